//! Device ownership transfer: single-use six digit codes with a short
//! lifetime, verified against the device and the previous owner.

pub mod api;
pub mod clock;
pub mod history;
pub mod registry;

pub use api::*;
pub use clock::*;
pub use history::*;
pub use registry::*;

pub mod broadcast;
pub mod commands;
pub mod console;
pub mod gatt;
pub mod protocol;
pub mod server;
pub mod state;
pub mod system;
pub mod transfer;
pub mod types;

pub use broadcast::{BroadcastHub, ChannelObserver, DeliveryError, Observer};
pub use commands::{CommandDispatcher, ScaleCommand};
pub use protocol::{decode_packet, encode_packet, Frame, ScalePacket};
pub use state::StateManager;
pub use system::Config;
pub use transfer::{TransferApi, TransferError, TransferRegistry};
pub use types::*;

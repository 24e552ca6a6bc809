//! Line-oriented TCP transports. Each accepted connection gets its own
//! thread; async components are driven with `block_on`.

pub mod telemetry;
pub mod transfer;

pub use telemetry::*;
pub use transfer::*;

use log::{error, info, warn};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Accepts connections forever, handing each to `handler` on a fresh thread.
pub(crate) fn spawn_accept_loop<F>(
    name: &'static str,
    listener: TcpListener,
    handler: F,
) -> io::Result<JoinHandle<()>>
where
    F: Fn(TcpStream, SocketAddr) + Send + Sync + 'static,
{
    let handler = Arc::new(handler);
    let local = listener.local_addr()?;
    info!("{} server listening on {}", name, local);

    thread::Builder::new()
        .name(format!("{}-accept", name))
        .spawn(move || {
            for stream in listener.incoming() {
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!("{} accept failed: {}", name, e);
                        continue;
                    }
                };
                let peer = match stream.peer_addr() {
                    Ok(peer) => peer,
                    Err(e) => {
                        warn!("{} connection without peer address: {}", name, e);
                        continue;
                    }
                };
                let handler = Arc::clone(&handler);
                let spawned = thread::Builder::new()
                    .name(format!("{}-{}", name, peer))
                    .spawn(move || (*handler)(stream, peer));
                if let Err(e) = spawned {
                    error!("Failed to spawn {} connection thread: {}", name, e);
                }
            }
        })
}

use super::spawn_accept_loop;
use crate::transfer::TransferApi;
use embassy_futures::block_on;
use log::{info, warn};
use std::io::{self, BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::thread::JoinHandle;

/// Request/response endpoint for ownership transfers: one JSON request per
/// line, one JSON response per line.
pub struct TransferServer {
    listener: TcpListener,
    api: TransferApi,
}

impl TransferServer {
    pub fn bind<A: ToSocketAddrs>(addr: A, api: TransferApi) -> io::Result<Self> {
        Ok(Self {
            listener: TcpListener::bind(addr)?,
            api,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        let TransferServer { listener, api } = self;
        spawn_accept_loop("transfer", listener, move |stream, peer| {
            if let Err(e) = serve_client(stream, peer, &api) {
                warn!("Transfer client {} failed: {}", peer, e);
            }
        })
    }
}

fn serve_client(stream: TcpStream, peer: SocketAddr, api: &TransferApi) -> io::Result<()> {
    info!("Transfer client connected: {}", peer);
    let mut writer = stream.try_clone()?;

    for line in BufReader::new(&stream).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let mut response = block_on(api.handle_json(&line));
        response.push('\n');
        writer.write_all(response.as_bytes())?;
        writer.flush()?;
    }

    info!("Transfer client disconnected: {}", peer);
    Ok(())
}

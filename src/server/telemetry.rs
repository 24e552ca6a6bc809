use super::spawn_accept_loop;
use crate::broadcast::{BroadcastHub, DeliveryError, Observer};
use crate::commands::CommandDispatcher;
use crate::gatt::{read_write_request, GattService};
use crate::protocol::{encode_error, encode_message, Frame};
use embassy_futures::block_on;
use log::{debug, info, warn};
use std::io::{self, BufRead, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::thread::{self, JoinHandle};

/// Wire form a connection receives broadcasts in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    /// Newline-terminated structured message.
    Json,
    /// Raw 12-byte packet.
    Binary,
}

type SharedWriter = Arc<StdMutex<TcpStream>>;

fn write_to(writer: &SharedWriter, bytes: &[u8]) -> io::Result<()> {
    let mut stream = writer.lock().unwrap_or_else(PoisonError::into_inner);
    stream.write_all(bytes)?;
    stream.flush()
}

/// Hands frames to a per-connection writer thread through a one-slot queue,
/// so a slow socket never stalls the broadcast tick.
pub struct TcpObserver {
    frames: SyncSender<Frame>,
}

impl TcpObserver {
    pub fn spawn(writer: SharedWriter, format: FrameFormat, peer: SocketAddr) -> io::Result<Arc<Self>> {
        let (frames, rx) = mpsc::sync_channel(1);
        thread::Builder::new()
            .name(format!("telemetry-writer-{}", peer))
            .spawn(move || write_frames(rx, writer, format, peer))?;
        Ok(Arc::new(Self { frames }))
    }
}

impl Observer for TcpObserver {
    fn deliver(&self, frame: &Frame) -> Result<(), DeliveryError> {
        self.frames.try_send(frame.clone()).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Lagging,
            TrySendError::Disconnected(_) => DeliveryError::Disconnected,
        })
    }
}

fn write_frames(rx: Receiver<Frame>, writer: SharedWriter, format: FrameFormat, peer: SocketAddr) {
    for frame in rx {
        let result = match format {
            FrameFormat::Json => {
                let mut line = frame.message;
                line.push('\n');
                write_to(&writer, line.as_bytes())
            }
            FrameFormat::Binary => write_to(&writer, &frame.packet),
        };
        if let Err(e) = result {
            debug!("Stopped streaming to {}: {}", peer, e);
            break;
        }
    }
}

/// Applies one inbound line and builds its acknowledgment: the state after
/// the command, or a structured error.
pub async fn handle_command_line(dispatcher: &CommandDispatcher, line: &str) -> String {
    match dispatcher.dispatch_json(line).await {
        Ok(state) => encode_message(&state),
        Err(e) => encode_error(&e),
    }
}

/// Telemetry endpoint. JSON clients receive the structured stream and may
/// send `{"command": ...}` lines, each answered with one acknowledgment.
/// Binary clients receive raw packets and may send framed characteristic
/// writes, which are applied without a reply.
pub struct TelemetryServer {
    listener: TcpListener,
    hub: Arc<BroadcastHub>,
    dispatcher: CommandDispatcher,
    format: FrameFormat,
}

impl TelemetryServer {
    pub fn bind<A: ToSocketAddrs>(
        addr: A,
        hub: Arc<BroadcastHub>,
        dispatcher: CommandDispatcher,
        format: FrameFormat,
    ) -> io::Result<Self> {
        Ok(Self {
            listener: TcpListener::bind(addr)?,
            hub,
            dispatcher,
            format,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        let TelemetryServer {
            listener,
            hub,
            dispatcher,
            format,
        } = self;
        let name = match format {
            FrameFormat::Json => "telemetry",
            FrameFormat::Binary => "binary",
        };
        spawn_accept_loop(name, listener, move |stream, peer| {
            if let Err(e) = serve_client(stream, peer, &hub, &dispatcher, format) {
                warn!("Telemetry client {} failed: {}", peer, e);
            }
        })
    }
}

fn serve_client(
    stream: TcpStream,
    peer: SocketAddr,
    hub: &BroadcastHub,
    dispatcher: &CommandDispatcher,
    format: FrameFormat,
) -> io::Result<()> {
    info!("Telemetry client connected: {}", peer);
    stream.set_nodelay(true)?;
    let writer: SharedWriter = Arc::new(StdMutex::new(stream.try_clone()?));
    let id = hub.register(TcpObserver::spawn(Arc::clone(&writer), format, peer)?);

    let result = match format {
        FrameFormat::Json => read_commands(&stream, &writer, dispatcher),
        FrameFormat::Binary => read_characteristic_writes(&stream, dispatcher),
    };

    hub.deregister(id);
    let _ = stream.shutdown(Shutdown::Both);
    info!("Telemetry client disconnected: {}", peer);
    result
}

fn read_commands(
    stream: &TcpStream,
    writer: &SharedWriter,
    dispatcher: &CommandDispatcher,
) -> io::Result<()> {
    for line in BufReader::new(stream).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let mut ack = block_on(handle_command_line(dispatcher, &line));
        ack.push('\n');
        write_to(writer, ack.as_bytes())?;
    }
    Ok(())
}

fn read_characteristic_writes(stream: &TcpStream, dispatcher: &CommandDispatcher) -> io::Result<()> {
    let gatt = GattService::new(dispatcher.clone());
    let mut reader = BufReader::new(stream);
    while let Some((id, payload)) = read_write_request(&mut reader)? {
        // Rejected writes are logged by the service; the next packet shows the state
        if let Err(e) = block_on(gatt.write(&id, &payload)) {
            debug!("Characteristic write to {} rejected: {}", id, e);
        }
    }
    Ok(())
}

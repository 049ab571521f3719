//! One established connection to a viewer
//!
//! A [`Link`] owns the socket and two helper threads:
//!
//! - **writer**: drains the bounded send queue onto the socket. Instrumented
//!   threads only ever `try_send` into the queue, so they never wait on the
//!   viewer.
//! - **reader**: applies `set_active` control messages to the collector
//!   registry and notices when the viewer goes away.
//!
//! Either thread clears the shared `alive` flag on a socket failure; the
//! transport checks it and tears the link down.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use framescope_common::{
    read_frame, write_frame, ClientMessage, Hello, ServerHello, ServerMessage, PROTOCOL_MAJOR,
};
use log::{debug, info, warn};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::config::ClientConfig;
use crate::domain::{CollectorIndex, ConnectError, ProtocolError, TransportError};
use crate::registry::CollectorRegistry;

#[derive(Debug, Default)]
struct LinkFlags {
    alive: AtomicBool,
    closing: AtomicBool,
}

pub(crate) struct Link {
    tx: Sender<ClientMessage>,
    stream: TcpStream,
    peer: SocketAddr,
    server: ServerHello,
    flags: Arc<LinkFlags>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl Link {
    /// Connect, run the client side of the handshake, and start the helper
    /// threads. Blocks for at most the configured connect and handshake
    /// timeouts per attempted address.
    pub(crate) fn establish(
        host: &str,
        port: u16,
        hello: Hello,
        config: &ClientConfig,
        collectors: Arc<CollectorRegistry>,
    ) -> Result<Self, ConnectError> {
        let mut stream = connect_any(host, port, config)?;
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        stream.set_write_timeout(Some(config.write_timeout))?;
        stream.set_read_timeout(Some(config.handshake_timeout))?;

        write_frame(&mut stream, &ClientMessage::Hello(hello))?;
        let server = match read_frame::<_, ServerMessage>(&mut stream)? {
            Some(ServerMessage::Hello(server)) if server.major == PROTOCOL_MAJOR => server,
            Some(ServerMessage::Hello(server)) => {
                return Err(ProtocolError::VersionMismatch {
                    local: PROTOCOL_MAJOR,
                    remote: server.major,
                }
                .into());
            }
            Some(ServerMessage::Reject { reason }) => {
                return Err(ProtocolError::Rejected(reason).into());
            }
            Some(other) => {
                return Err(ProtocolError::UnexpectedMessage {
                    expected: "server hello",
                    got: format!("{other:?}"),
                }
                .into());
            }
            None => return Err(ProtocolError::ClosedDuringHandshake.into()),
        };
        stream.set_read_timeout(None)?;

        let flags = Arc::new(LinkFlags { alive: AtomicBool::new(true), closing: AtomicBool::new(false) });
        let (tx, rx) = bounded(config.queue_capacity);

        let writer = {
            let stream = stream.try_clone()?;
            let flags = Arc::clone(&flags);
            thread::Builder::new()
                .name("framescope-writer".into())
                .spawn(move || finish("sending", run_writer(stream, &rx, &flags), &flags))?
        };
        let reader = {
            let stream = stream.try_clone()?;
            let flags = Arc::clone(&flags);
            thread::Builder::new()
                .name("framescope-reader".into())
                .spawn(move || {
                    let result = run_reader(stream, &flags, &collectors);
                    finish("receiving", result, &flags);
                    flags.alive.store(false, Ordering::Release);
                })?
        };

        info!("connected to viewer {:?} at {peer} (protocol {}.{})", server.server, server.major, server.minor);
        Ok(Self { tx, stream, peer, server, flags, writer, reader })
    }

    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) fn server(&self) -> &ServerHello {
        &self.server
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.flags.alive.load(Ordering::Acquire)
    }

    /// Queue `msg` without blocking.
    pub(crate) fn try_send(&self, msg: ClientMessage) -> Result<(), TrySendError<ClientMessage>> {
        self.tx.try_send(msg)
    }

    /// Shut the link down and join its threads.
    ///
    /// When `graceful` and the link is still healthy, queued frames are flushed
    /// and a `goodbye` is sent first; the flush is bounded by the write timeout.
    pub(crate) fn close(self, graceful: bool) {
        let Self { tx, stream, peer, flags, writer, reader, .. } = self;

        flags.closing.store(true, Ordering::Release);
        if graceful && flags.alive.load(Ordering::Acquire) {
            let _ = tx.try_send(ClientMessage::Goodbye);
        } else {
            flags.alive.store(false, Ordering::Release);
        }
        drop(tx);

        if writer.join().is_err() {
            warn!("framescope writer thread panicked");
        }
        flags.alive.store(false, Ordering::Release);
        let _ = stream.shutdown(Shutdown::Both);
        if reader.join().is_err() {
            warn!("framescope reader thread panicked");
        }
        info!("disconnected from viewer at {peer}");
    }
}

fn connect_any(host: &str, port: u16, config: &ClientConfig) -> Result<TcpStream, ConnectError> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|_| ConnectError::Resolve(format!("{host}:{port}")))?
        .collect();
    if addrs.is_empty() {
        return Err(ConnectError::Resolve(format!("{host}:{port}")));
    }

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, config.connect_timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!("connect to {addr} failed: {e}");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.map_or_else(|| ConnectError::Resolve(format!("{host}:{port}")), ConnectError::Io))
}

fn run_writer(mut stream: TcpStream, rx: &Receiver<ClientMessage>, flags: &LinkFlags) -> Result<(), TransportError> {
    for msg in rx {
        if !flags.alive.load(Ordering::Acquire) {
            break;
        }
        write_frame(&mut stream, &msg)?;
    }
    Ok(())
}

fn run_reader(mut stream: TcpStream, flags: &LinkFlags, collectors: &CollectorRegistry) -> Result<(), TransportError> {
    loop {
        match read_frame::<_, ServerMessage>(&mut stream)? {
            Some(ServerMessage::SetActive { collector, active }) => {
                let index = CollectorIndex(collector);
                match collectors.set_active(index, active) {
                    Ok(()) => debug!("viewer set {index} active={active}"),
                    Err(e) => warn!("viewer control message ignored: {e}"),
                }
            }
            Some(ServerMessage::Reject { reason }) => return Err(TransportError::ConnectionLost(reason)),
            Some(other) => warn!("unexpected message from viewer: {other:?}"),
            None => {
                if !flags.closing.load(Ordering::Acquire) {
                    info!("viewer closed the connection");
                }
                return Ok(());
            }
        }
    }
}

/// Log a helper thread's failure unless the link is already closing.
fn finish(direction: &str, result: Result<(), TransportError>, flags: &LinkFlags) {
    if let Err(e) = result {
        if !flags.closing.load(Ordering::Acquire) {
            warn!("viewer connection lost while {direction}: {e}");
        }
        flags.alive.store(false, Ordering::Release);
    }
}

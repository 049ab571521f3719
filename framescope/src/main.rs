//! # framescope - Headless Listener
//!
//! Accepts connections from instrumented programs and prints what they send:
//! one line per data frame (`--json` for machine-readable output), plus a line
//! when each client connects and disconnects.
//!
//! Each client is served on a blocking task with a synchronous
//! [`ViewerSession`]; the accept loop races Ctrl+C, the optional `--duration`
//! limit and the completion of those tasks. Open sockets are tracked only
//! while their session runs so shutdown can unblock them.

use anyhow::{Context, Result};
use clap::Parser;
use framescope::cli::Args;
use framescope::display::{display_client_closed, display_client_connected, display_data_frame};
use framescope::viewer::ViewerSession;
use framescope_common::ClientMessage;
use log::{info, warn};
use std::collections::HashMap;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinSet;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_NOPERM: i32 = 77;

#[derive(Clone, Copy)]
struct OutputMode {
    json: bool,
    quiet: bool,
}

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

/// Sockets of the sessions currently being served.
#[derive(Clone, Default)]
struct OpenConnections {
    inner: Arc<Mutex<Connections>>,
}

#[derive(Default)]
struct Connections {
    next_id: u64,
    streams: HashMap<u64, TcpStream>,
}

/// Removes its socket from [`OpenConnections`] when the session ends.
struct ConnectionGuard {
    id: u64,
    open: OpenConnections,
}

impl OpenConnections {
    fn lock(&self) -> std::sync::MutexGuard<'_, Connections> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a clone of `stream` until the returned guard is dropped.
    fn register(&self, stream: &TcpStream) -> io::Result<ConnectionGuard> {
        let clone = stream.try_clone()?;
        let mut connections = self.lock();
        let id = connections.next_id;
        connections.next_id += 1;
        connections.streams.insert(id, clone);
        Ok(ConnectionGuard { id, open: self.clone() })
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().streams.len()
    }

    /// Shut down every tracked socket, waking sessions blocked in a read.
    fn shutdown_all(&self) {
        for stream in self.lock().streams.values() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.open.lock().streams.remove(&self.id);
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let msg = format!("{err:#}").to_lowercase();
    if msg.contains("permission denied") {
        EXIT_NOPERM
    } else {
        EXIT_ERROR
    }
}

/// Serve one client until it says goodbye or the connection ends.
fn serve_client(stream: TcpStream, peer: SocketAddr, server_name: &str, mode: OutputMode) -> Result<()> {
    let peer = peer.to_string();
    let mut session = ViewerSession::accept(stream, server_name)
        .with_context(|| format!("Handshake with {peer} failed"))?;
    display_client_connected(&peer, session.hello());

    loop {
        match session.next_message() {
            Ok(Some(ClientMessage::Data(frame))) => {
                if mode.quiet {
                    continue;
                }
                if mode.json {
                    println!("{}", serde_json::to_string(&frame)?);
                } else {
                    display_data_frame(&session, &frame);
                }
            }
            Ok(Some(ClientMessage::Goodbye) | None) => break,
            Ok(Some(_)) => {}
            Err(e) => {
                warn!("{peer}: {e}");
                break;
            }
        }
    }

    display_client_closed(&peer, session.frames_received());
    Ok(())
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();
    let mode = OutputMode { json: args.json, quiet: args.quiet };

    let listener = TcpListener::bind((args.bind.as_str(), args.port))
        .await
        .with_context(|| format!("Failed to listen on {}:{}", args.bind, args.port))?;

    if !args.quiet {
        println!("framescope v{}", env!("CARGO_PKG_VERSION"));
        println!("listening: {}", listener.local_addr()?);
    }

    let server_name = format!("framescope {}", env!("CARGO_PKG_VERSION"));

    // Setup Ctrl+C handler
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let started = Instant::now();
    let duration_limit =
        if args.duration > 0 { Some(Duration::from_secs(args.duration)) } else { None };
    let deadline = async move {
        match duration_limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    let open = OpenConnections::default();
    let mut sessions = JoinSet::new();
    let mut exit_reason = "interrupted";

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("accept failed: {e}");
                        continue;
                    }
                };
                let stream = stream.into_std().context("Failed to detach client socket")?;
                stream.set_nonblocking(false)?;
                let guard = match open.register(&stream) {
                    Ok(guard) => guard,
                    Err(e) => {
                        warn!("dropping {peer}: {e}");
                        continue;
                    }
                };

                info!("accepted {peer}");
                let server_name = server_name.clone();
                sessions.spawn_blocking(move || {
                    let _guard = guard;
                    if let Err(e) = serve_client(stream, peer, &server_name, mode) {
                        warn!("{e:#}");
                    }
                });
            }
            Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(e) = finished {
                    warn!("session task failed: {e}");
                }
            }
            () = &mut deadline => {
                exit_reason = "duration limit reached";
                break;
            }
            _ = &mut ctrl_c => {
                break;
            }
        }
    }

    open.shutdown_all();
    while sessions.join_next().await.is_some() {}

    if !args.quiet {
        eprintln!("\n{exit_reason}: {:.1}s", started.elapsed().as_secs_f64());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener as StdListener;

    fn pair(listener: &StdListener) -> (TcpStream, TcpStream) {
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_finished_sessions_release_their_sockets() {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let open = OpenConnections::default();

        let (_c1, s1) = pair(&listener);
        let (_c2, s2) = pair(&listener);
        let first = open.register(&s1).unwrap();
        let second = open.register(&s2).unwrap();
        assert_eq!(open.len(), 2);

        drop(first);
        assert_eq!(open.len(), 1);
        drop(second);
        assert_eq!(open.len(), 0);
    }

    #[test]
    fn test_shutdown_all_unblocks_open_sessions() {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let open = OpenConnections::default();
        let (_client, server) = pair(&listener);
        let _guard = open.register(&server).unwrap();

        let reader = std::thread::spawn(move || {
            let mut server = server;
            let mut buf = [0u8; 1];
            server.read(&mut buf).unwrap_or(0)
        });
        open.shutdown_all();
        assert_eq!(reader.join().unwrap(), 0);
    }
}

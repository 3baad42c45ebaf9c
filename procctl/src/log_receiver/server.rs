// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::io::{self, ErrorKind, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use async_io::{Async, Timer};
use futures::future::{self, Either};
use futures::pin_mut;
use log::{debug, error, info, warn};

use super::sink::SinkRegistry;
use crate::config::ReceiverConfig;

/// How long a connection may take to finish the frame it is receiving
/// once the receiver has been asked to stop.
const MID_FRAME_GRACE: Duration = Duration::from_secs(5);

struct Connection {
    peer: SocketAddr,
    handle: JoinHandle<()>,
}

/// TCP server that decodes log frames and writes them to per-name sinks.
///
/// The accept loop wakes up at least once per poll interval to look at the
/// abort flag. Each connection is served by its own thread.
pub struct LogReceiver {
    listener: Async<TcpListener>,
    config: ReceiverConfig,
    sinks: Arc<SinkRegistry>,
    abort: Arc<AtomicBool>,
    connections: Vec<Connection>,
}

impl LogReceiver {
    pub fn bind(config: ReceiverConfig) -> io::Result<Self> {
        let listener = TcpListener::bind((config.host.as_str(), config.port))?;
        let sinks = SinkRegistry::new(
            config.log_dir.clone(),
            config.file_prefix.clone(),
            config.rotation(),
        );
        Ok(Self {
            listener: Async::new(listener)?,
            config,
            sinks: Arc::new(sinks),
            abort: Arc::new(AtomicBool::new(false)),
            connections: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.get_ref().local_addr()
    }

    /// Setting the returned flag stops [`serve_until_stopped`](Self::serve_until_stopped)
    /// within one poll interval.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.abort.clone()
    }

    pub fn sinks(&self) -> &Arc<SinkRegistry> {
        &self.sinks
    }

    pub fn serve_until_stopped(&mut self) -> io::Result<()> {
        info!("log receiver listening on {}", self.local_addr()?);
        async_io::block_on(self.accept_loop());
        self.close_connections();
        info!("log receiver stopped");
        Ok(())
    }

    async fn accept_loop(&mut self) {
        let poll_interval = self.config.poll_interval();
        while !self.abort.load(Ordering::SeqCst) {
            match accept_or_timeout(&self.listener, poll_interval).await {
                Some(Ok((stream, peer))) => {
                    if let Err(e) = self.spawn_connection(stream, peer) {
                        warn!("could not serve connection from {peer}: {e}");
                    }
                }
                Some(Err(e)) => warn!("accept failed: {e}"),
                None => {}
            }
            self.reap_finished();
        }
    }

    fn spawn_connection(&mut self, stream: Async<TcpStream>, peer: SocketAddr) -> io::Result<()> {
        let stream = stream.into_inner()?;
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(self.config.poll_interval()))?;
        let reader = ConnectionReader::new(stream, self.abort.clone());
        let sinks = self.sinks.clone();
        let max_frame_len = self.config.max_frame_len;
        let logname = self.config.logname.clone();
        let handle = thread::Builder::new()
            .name(format!("log-conn-{peer}"))
            .spawn(move || handle_connection(reader, peer, sinks, max_frame_len, logname))?;
        debug!("accepted log connection from {peer}");
        self.connections.push(Connection { peer, handle });
        Ok(())
    }

    fn reap_finished(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) = self
            .connections
            .drain(..)
            .partition(|c| c.handle.is_finished());
        self.connections = running;
        for connection in finished {
            if connection.handle.join().is_err() {
                error!("connection handler for {} panicked", connection.peer);
            }
        }
    }

    /// Waits for the handlers. Each one stops at its next frame boundary; a
    /// frame that is being received is finished first.
    fn close_connections(&mut self) {
        for connection in self.connections.drain(..) {
            if connection.handle.join().is_err() {
                error!("connection handler for {} panicked", connection.peer);
            }
        }
    }
}

async fn accept_or_timeout(
    listener: &Async<TcpListener>,
    timeout: Duration,
) -> Option<io::Result<(Async<TcpStream>, SocketAddr)>> {
    let accept = listener.accept();
    let timer = Timer::after(timeout);
    pin_mut!(accept);
    match future::select(accept, timer).await {
        Either::Left((accepted, _)) => Some(accepted),
        Either::Right(_) => None,
    }
}

/// Blocking reads on one connection that wake up every poll interval.
///
/// Between frames a raised abort flag reads as end of stream. Once the
/// first byte of a frame has arrived the reader waits for the rest, for at
/// most [`MID_FRAME_GRACE`] after the flag was raised.
struct ConnectionReader {
    stream: TcpStream,
    abort: Arc<AtomicBool>,
    at_boundary: bool,
    stop_seen: Option<Instant>,
}

impl ConnectionReader {
    fn new(stream: TcpStream, abort: Arc<AtomicBool>) -> Self {
        Self {
            stream,
            abort,
            at_boundary: true,
            stop_seen: None,
        }
    }

    fn next_frame(&mut self) {
        self.at_boundary = true;
    }
}

impl Read for ConnectionReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let stopping = self.abort.load(Ordering::SeqCst);
            if stopping && self.at_boundary {
                return Ok(0);
            }
            match self.stream.read(buf) {
                Ok(n) => {
                    if n > 0 {
                        self.at_boundary = false;
                    }
                    return Ok(n);
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    if !stopping {
                        continue;
                    }
                    let since = *self.stop_seen.get_or_insert_with(Instant::now);
                    if since.elapsed() >= MID_FRAME_GRACE {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Decode loop of one connection. Ends on a clean end of stream, on a stop
/// request between two frames, or on the first framing error; a partially
/// received frame is never decoded.
fn handle_connection(
    mut reader: ConnectionReader,
    peer: SocketAddr,
    sinks: Arc<SinkRegistry>,
    max_frame_len: usize,
    logname: Option<String>,
) {
    loop {
        reader.next_frame();
        match procctl_wire::decode(&mut reader, max_frame_len) {
            Ok(Some(record)) => {
                let name = logname.as_deref().unwrap_or(&record.name);
                if let Err(e) = sinks.write(name, &record) {
                    error!("could not write record of {name}: {e}");
                }
            }
            Ok(None) => {
                debug!("log connection from {peer} closed");
                break;
            }
            Err(e) => {
                warn!("dropping log connection from {peer}: {e}");
                break;
            }
        }
    }
}

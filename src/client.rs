//! Client side of the transport.
//!
//! A [`Client`] manages exactly one outbound connection. [`connect`]
//! (Client::connect) reports failure through its boolean return so the
//! application can poll-and-retry; once connected, [`listen`]
//! (Client::listen) runs the read loop on a worker thread, or the
//! application can drive [`update`](Client::update) itself.
//!
//! The worker blocks on a one-byte peek, so an idle client costs nothing;
//! payload reads happen inside the application's `on_packet`, and writes
//! can go through [`stream`](Client::stream) from any thread (`Write` is
//! implemented for `&TcpStream`).

use std::io;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use crate::error::{is_retriable, Error};
use crate::sockopt;

/// Application callbacks, invoked synchronously on the read-loop thread.
pub trait ClientEvents: Send {
    /// The host sent payload bytes; read them off `stream` here (`Read`
    /// is implemented for `&TcpStream`). The returned count is reserved
    /// and currently ignored.
    fn on_packet(&mut self, stream: &TcpStream) -> io::Result<usize>;

    /// The connection is gone. Runs once, before the socket is shut down.
    fn on_disconnection(&mut self, stream: &TcpStream) {
        let _ = stream;
    }
}

/// One outbound connection and its read loop.
pub struct Client {
    stream: Option<Arc<TcpStream>>,
    connected: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Client {
    pub fn new() -> Self {
        Self {
            stream: None,
            connected: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// Resolve `host` and open a TCP connection to it.
    ///
    /// Returns `false` on resolution or connect failure; the caller owns
    /// the retry policy. A `connect` on an already-connected client tears
    /// the previous session down first.
    pub fn connect(&mut self, host: &str, port: u16) -> bool {
        self.disconnect();

        let mut addrs = match (host, port).to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(err) => {
                debug!(host, port, %err, "resolution failed");
                return false;
            }
        };
        let addr = match addrs.next() {
            Some(addr) => addr,
            None => {
                debug!(host, port, "resolution produced no address");
                return false;
            }
        };

        let stream = match TcpStream::connect(addr) {
            Ok(stream) => stream,
            Err(err) => {
                debug!(%addr, %err, "connect failed");
                return false;
            }
        };

        if let Err(err) = sockopt::set_keepalive(&stream) {
            warn!(%addr, %err, "keepalive setup failed");
        }

        info!(%addr, "connected");
        self.stream = Some(Arc::new(stream));
        self.connected.store(true, Ordering::Release);
        true
    }

    /// Whether the connection is currently up.
    ///
    /// Flips to `false` the moment a disconnect is detected, which is how
    /// polling applications know to retry [`connect`](Client::connect).
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// The live stream, for writes from application threads.
    pub fn stream(&self) -> Option<&TcpStream> {
        self.stream.as_deref()
    }

    /// Start the background read loop for the current connection.
    ///
    /// A worker left over from a previous session is joined first; the new
    /// loop runs `update` until the connection drops. Without a live
    /// connection this is a no-op.
    pub fn listen<H: ClientEvents + 'static>(&mut self, handler: H) -> Result<(), Error> {
        if let Some(worker) = self.worker.take() {
            if worker.is_finished() || !self.is_connected() {
                let _ = worker.join();
            } else {
                // the loop for this session is already running; keep it
                self.worker = Some(worker);
                warn!("listen called while the read loop is running");
                return Ok(());
            }
        }

        let stream = match &self.stream {
            Some(stream) if self.is_connected() => stream.clone(),
            _ => {
                debug!("listen without a live connection");
                return Ok(());
            }
        };
        let connected = self.connected.clone();

        let worker = thread::Builder::new()
            .name("netmux-client".into())
            .spawn(move || {
                let mut handler = handler;
                while connected.load(Ordering::Acquire) {
                    step(&stream, &connected, &mut handler);
                }
                debug!("client loop exited");
            })
            .map_err(Error::Spawn)?;

        self.worker = Some(worker);
        Ok(())
    }

    /// One manual reactor step, for applications that drive the loop
    /// themselves instead of calling [`listen`](Client::listen).
    ///
    /// Blocks until the host sends something or the connection dies.
    /// Returns whether the connection is still up afterwards.
    pub fn update<H: ClientEvents>(&self, handler: &mut H) -> bool {
        match self.stream.as_deref() {
            Some(stream) if self.is_connected() => {
                step(stream, &self.connected, handler);
                self.is_connected()
            }
            _ => false,
        }
    }

    /// Explicit teardown: lower the flag, shut the socket down to unblock
    /// the worker, and join it. Also runs on drop.
    pub fn disconnect(&mut self) {
        self.connected.store(false, Ordering::Release);
        if let Some(stream) = &self.stream {
            let _ = stream.shutdown(Shutdown::Both);
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.stream = None;
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Peek-classify one readiness: payload, nothing, or hangup.
fn step<H: ClientEvents>(stream: &TcpStream, connected: &AtomicBool, handler: &mut H) {
    let mut probe = [0_u8; 1];
    match stream.peek(&mut probe) {
        Ok(0) => hangup(stream, connected, handler),
        Ok(_) => {
            if let Err(err) = handler.on_packet(stream) {
                debug!(%err, "packet callback failed");
            }
        }
        Err(err) if is_retriable(&err) => {}
        Err(err) => {
            debug!(%err, "peek failed");
            hangup(stream, connected, handler);
        }
    }
}

fn hangup<H: ClientEvents>(stream: &TcpStream, connected: &AtomicBool, handler: &mut H) {
    // swap guarantees the callback fires exactly once per session, and not
    // at all when the application initiated the teardown itself
    if connected.swap(false, Ordering::AcqRel) {
        info!("disconnected");
        handler.on_disconnection(stream);
    }
    let _ = stream.shutdown(Shutdown::Both);
}

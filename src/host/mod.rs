//! Host side of the transport.
//!
//! A [`Host`] owns one listening socket and every connection accepted from
//! it, multiplexing them on a single blocking readiness wait. For each
//! accepted connection a fresh instance of the application's record type
//! `T` is created and handed (mutably) to every callback for that peer.
//!
//! A connection's first activity is sniffed once for a websocket opening
//! handshake: if the bytes are an HTTP upgrade request the `101` response
//! is written and the request is consumed without any packet callback
//! firing; in every other case the application's `on_packet` reads the
//! payload straight off the socket. After the sniff (either way) the
//! connection is an ordinary binary-payload peer.
//!
//! ```ignore
//! struct Lobby;
//!
//! #[derive(Default)]
//! struct Player { hp: i32 }
//!
//! impl HostEvents<Player> for Lobby {
//!     fn on_connection(&mut self, peer: PeerId, _: &mut TcpStream, p: &mut Player) {
//!         p.hp = 100;
//!     }
//!     fn on_packet(&mut self, peer: PeerId, stream: &mut TcpStream, p: &mut Player) -> io::Result<usize> {
//!         let mut cmd = [0u8; 8];
//!         stream.read_exact(&mut cmd)?;
//!         Ok(cmd.len())
//!     }
//! }
//!
//! let host = Host::listen("0.0.0.0:1337", Lobby)?;
//! ```

mod table;

use std::fmt;
use std::io::{self, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};

pub use mio::net::TcpStream;
use tracing::{debug, error, info, trace, warn};

use crate::error::{is_retriable, Error};
use crate::handshake::{check_upgrade, Upgrade};
use crate::sockopt;

use table::Table;

const LISTENER: Token = Token(0);
const WAKE: Token = Token(1);

// peer handles start above the reserved tokens and are never reused
const FIRST_PEER: usize = 2;

const EVENT_CAPACITY: usize = 64;

// backoff applied when the readiness wait itself keeps failing; without it
// a persistent poll error would spin the reactor thread flat out
const POLL_RETRY_DELAY: Duration = Duration::from_millis(50);
const MAX_POLL_FAILURES: u32 = 16;

/// Handle naming one accepted connection.
///
/// Allocated from a monotonic counter, so a handle value is never reissued
/// within the lifetime of a host, even after its connection closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(usize);

impl PeerId {
    #[inline]
    fn token(self) -> Token {
        Token(self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Application callbacks, invoked synchronously on the reactor thread.
pub trait HostEvents<T>: Send {
    /// A connection was accepted. Runs before any packet callback for the
    /// same peer.
    fn on_connection(&mut self, peer: PeerId, stream: &mut TcpStream, state: &mut T) {
        let _ = (peer, stream, state);
    }

    /// The peer is gone. The record is still live while this runs; it is
    /// purged, and the socket closed, right after.
    fn on_disconnection(&mut self, peer: PeerId, stream: &mut TcpStream, state: &mut T) {
        let _ = (peer, stream, state);
    }

    /// The peer sent payload bytes; read them off `stream` here. The
    /// returned count is reserved and currently ignored by the reactor.
    fn on_packet(&mut self, peer: PeerId, stream: &mut TcpStream, state: &mut T)
        -> io::Result<usize>;
}

enum Outbound {
    To(PeerId, Vec<u8>),
    Broadcast(Vec<u8>),
}

/// Cross-thread write access to a running host's connections.
///
/// Writes are queued and performed by the reactor thread between readiness
/// waits, so application threads never touch a socket the reactor is
/// dispatching on.
#[derive(Clone)]
pub struct HostSender {
    tx: Sender<Outbound>,
    waker: Arc<Waker>,
}

impl HostSender {
    /// Queue `bytes` for one peer.
    pub fn send_to(&self, peer: PeerId, bytes: Vec<u8>) {
        if self.tx.send(Outbound::To(peer, bytes)).is_ok() {
            let _ = self.waker.wake();
        }
    }

    /// Queue `bytes` for every connected peer.
    pub fn broadcast(&self, bytes: Vec<u8>) {
        if self.tx.send(Outbound::Broadcast(bytes)).is_ok() {
            let _ = self.waker.wake();
        }
    }
}

/// The connection-multiplexing reactor.
///
/// [`bind`](Host::bind) performs all fallible setup; [`update`](Host::update)
/// runs one blocking iteration; [`run`](Host::run) moves the reactor onto
/// its own thread and returns a [`HostHandle`]. [`listen`](Host::listen) is
/// `bind` + `run` in one call.
pub struct Host<T, H> {
    poll: Poll,
    listener: TcpListener,
    local_addr: SocketAddr,
    table: Table<TcpStream, T>,
    handler: H,
    next_peer: usize,
    waker: Arc<Waker>,
    running: Arc<AtomicBool>,
    connections: Arc<AtomicUsize>,
    outbox: Receiver<Outbound>,
    outbox_tx: Sender<Outbound>,
}

impl<T, H> Host<T, H>
where
    T: Default,
    H: HostEvents<T>,
{
    /// Bind the listening socket and set up the readiness poller.
    ///
    /// Every setup failure surfaces here, before any thread is spawned.
    pub fn bind<A: ToSocketAddrs>(addr: A, handler: H) -> Result<Self, Error> {
        let addr = addr
            .to_socket_addrs()
            .map_err(Error::Listen)?
            .next()
            .ok_or_else(|| {
                Error::Listen(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    "address resolved to nothing",
                ))
            })?;

        let mut listener = TcpListener::bind(addr).map_err(Error::Listen)?;
        let local_addr = listener.local_addr().map_err(Error::Listen)?;

        let poll = Poll::new().map_err(Error::Poll)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(Error::Poll)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE).map_err(Error::Poll)?);

        let (outbox_tx, outbox) = mpsc::channel();

        info!(%local_addr, "listening");

        Ok(Self {
            poll,
            listener,
            local_addr,
            table: Table::new(),
            handler,
            next_peer: FIRST_PEER,
            waker,
            running: Arc::new(AtomicBool::new(true)),
            connections: Arc::new(AtomicUsize::new(0)),
            outbox,
            outbox_tx,
        })
    }

    /// Address the listener actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// One reactor iteration.
    ///
    /// Flushes queued cross-thread sends, blocks until the listener or any
    /// connection is ready (no timeout: an idle host parks here), then
    /// scans ready connections and finally accepts pending ones. If the
    /// last live connection disconnects during the scan, the iteration
    /// ends immediately.
    pub fn update(&mut self) -> Result<(), Error> {
        self.drain_outbox();

        let mut events = Events::with_capacity(EVENT_CAPACITY);
        if let Err(err) = self.poll.poll(&mut events, None) {
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(Error::Poll(err));
        }

        let mut accept_ready = false;
        let mut ready = Vec::new();
        for event in events.iter() {
            let token = event.token();
            if token == LISTENER {
                accept_ready = true;
            } else if token == WAKE {
                // queued sends are drained at the top of the next pass
            } else {
                ready.push(PeerId(token.0));
            }
        }

        // existing connections are always scanned before the accept step
        for peer in ready {
            if !self.table.contains(peer) {
                continue; // dropped earlier in this same scan
            }
            self.service(peer);

            if self.table.is_empty() {
                // the last connection just went away: end the iteration,
                // re-arming the listener so a pending accept still fires
                if accept_ready {
                    if let Err(err) = self.poll.registry().reregister(
                        &mut self.listener,
                        LISTENER,
                        Interest::READABLE,
                    ) {
                        warn!(%err, "listener reregister failed");
                    }
                }
                return Ok(());
            }
        }

        if accept_ready {
            self.accept_pending();
        }

        Ok(())
    }

    /// Classify one readable connection: disconnect, handshake or payload.
    fn service(&mut self, peer: PeerId) {
        let mut probe = [0_u8; 1];
        let classified = match self.table.get_mut(peer) {
            Some(entry) => entry.stream.peek(&mut probe),
            None => return,
        };

        match classified {
            // zero bytes from a readable socket: orderly shutdown
            Ok(0) => self.drop_peer(peer),
            Ok(_) => self.deliver(peer),
            Err(err) if is_retriable(&err) => trace!(%peer, "spurious readiness"),
            Err(err) => {
                debug!(%peer, %err, "peek failed");
                self.drop_peer(peer);
            }
        }
    }

    /// Dispatch a readable peer that definitely has bytes waiting.
    fn deliver(&mut self, peer: PeerId) {
        // one-time websocket sniff, gated by the seen-sender set
        if !self.table.is_sender(peer) {
            let verdict = match self.table.get_mut(peer) {
                Some(entry) => check_upgrade(&mut entry.stream),
                None => return,
            };
            match verdict {
                Ok(Upgrade::WebSocket) => {
                    debug!(%peer, "websocket handshake answered");
                    self.table.mark_sender(peer);
                    self.rearm(peer);
                    return;
                }
                Ok(Upgrade::None) => {}
                Err(err) => {
                    debug!(%peer, %err, "handshake probe failed");
                    self.drop_peer(peer);
                    return;
                }
            }
        }

        if let Some(entry) = self.table.get_mut(peer) {
            trace!(%peer, "dispatching packet");
            // the callback's return value is reserved; errors are logged only
            if let Err(err) = self
                .handler
                .on_packet(peer, &mut entry.stream, &mut entry.state)
            {
                debug!(%peer, %err, "packet callback failed");
            }
        }
        self.table.mark_sender(peer);
        self.rearm(peer);
    }

    // The poll registry is edge-triggered: re-arm a serviced stream so
    // bytes still buffered (or pipelined behind a handshake) fire again
    // on the next wait.
    fn rearm(&mut self, peer: PeerId) {
        if let Some(entry) = self.table.get_mut(peer) {
            if let Err(err) =
                self.poll
                    .registry()
                    .reregister(&mut entry.stream, peer.token(), Interest::READABLE)
            {
                warn!(%peer, %err, "stream reregister failed");
            }
        }
    }

    /// Run the disconnect callback, then purge and close the connection.
    fn drop_peer(&mut self, peer: PeerId) {
        // the record must still be live while the callback runs
        if let Some(entry) = self.table.get_mut(peer) {
            self.handler
                .on_disconnection(peer, &mut entry.stream, &mut entry.state);
        }
        if let Some(mut entry) = self.table.remove(peer) {
            let _ = self.poll.registry().deregister(&mut entry.stream);
            info!(%peer, "connection closed");
            // dropping the stream closes the descriptor
        }
        self.publish_count();
    }

    /// Accept every pending connection on the listener.
    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, addr)) => {
                    if let Err(err) = sockopt::set_keepalive(&stream) {
                        warn!(%addr, %err, "keepalive setup failed");
                    }
                    let peer = PeerId(self.next_peer);
                    if let Err(err) = self.poll.registry().register(
                        &mut stream,
                        peer.token(),
                        Interest::READABLE,
                    ) {
                        warn!(%peer, %addr, %err, "could not watch new connection");
                        continue;
                    }
                    self.next_peer += 1;
                    info!(%peer, %addr, "connection accepted");
                    self.table.insert(peer, stream);
                    self.publish_count();
                    if let Some(entry) = self.table.get_mut(peer) {
                        self.handler
                            .on_connection(peer, &mut entry.stream, &mut entry.state);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    warn!(%err, "transient accept error");
                    continue;
                }
                Err(err) => {
                    error!(%err, "accept failed");
                    break;
                }
            }
        }
    }

    /// Perform writes queued by [`HostSender`]s since the last iteration.
    fn drain_outbox(&mut self) {
        loop {
            match self.outbox.try_recv() {
                Ok(Outbound::To(peer, bytes)) => self.write_peer(peer, &bytes),
                Ok(Outbound::Broadcast(bytes)) => {
                    for peer in self.table.ids() {
                        self.write_peer(peer, &bytes);
                    }
                }
                Err(_) => break,
            }
        }
    }

    fn write_peer(&mut self, peer: PeerId, bytes: &[u8]) {
        let Some(entry) = self.table.get_mut(peer) else {
            debug!(%peer, "queued send for unknown peer");
            return;
        };
        match entry.stream.write_all(bytes) {
            Ok(()) => trace!(%peer, len = bytes.len(), "queued send flushed"),
            Err(err) if is_retriable(&err) => {
                warn!(%peer, len = bytes.len(), "send buffer full, queued bytes dropped");
            }
            Err(err) => {
                debug!(%peer, %err, "queued send failed");
                self.drop_peer(peer);
            }
        }
    }

    fn publish_count(&self) {
        self.connections.store(self.table.len(), Ordering::Relaxed);
    }
}

impl<T, H> Host<T, H>
where
    T: Default + Send + 'static,
    H: HostEvents<T> + 'static,
{
    /// Bind and start the reactor on its own thread.
    pub fn listen<A: ToSocketAddrs>(addr: A, handler: H) -> Result<HostHandle, Error> {
        Self::bind(addr, handler)?.run()
    }

    /// Move the reactor onto a dedicated worker thread.
    ///
    /// The returned handle owns the worker: dropping it (or calling
    /// [`stop`](HostHandle::stop)) ends the loop and joins the thread.
    pub fn run(self) -> Result<HostHandle, Error> {
        let running = self.running.clone();
        let waker = self.waker.clone();
        let connections = self.connections.clone();
        let sender = HostSender {
            tx: self.outbox_tx.clone(),
            waker: self.waker.clone(),
        };
        let local_addr = self.local_addr;

        let worker = thread::Builder::new()
            .name("netmux-host".into())
            .spawn(move || self.run_loop())
            .map_err(Error::Spawn)?;

        Ok(HostHandle {
            running,
            waker,
            sender,
            connections,
            local_addr,
            worker: Some(worker),
        })
    }

    fn run_loop(mut self) {
        let running = self.running.clone();
        let mut failures: u32 = 0;
        while running.load(Ordering::Acquire) {
            match self.update() {
                Ok(()) => failures = 0,
                Err(err) => {
                    failures += 1;
                    warn!(%err, failures, "reactor iteration failed");
                    if failures >= MAX_POLL_FAILURES {
                        error!("readiness wait keeps failing, stopping the reactor");
                        break;
                    }
                    thread::sleep(POLL_RETRY_DELAY);
                }
            }
        }
        debug!("reactor loop exited");
    }
}

/// Lifecycle handle for a running [`Host`].
pub struct HostHandle {
    running: Arc<AtomicBool>,
    waker: Arc<Waker>,
    sender: HostSender,
    connections: Arc<AtomicUsize>,
    local_addr: SocketAddr,
    worker: Option<JoinHandle<()>>,
}

impl HostHandle {
    /// Address the host is accepting on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of currently connected peers.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Write access to the host's connections for application threads.
    pub fn sender(&self) -> HostSender {
        self.sender.clone()
    }

    /// Stop the reactor and join its thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        let _ = self.waker.wake();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for HostHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

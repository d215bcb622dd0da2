//! Connection-multiplexing TCP transport with a transparent websocket
//! opening handshake.
//!
//! One [`Host`] owns a listening socket and every connection accepted from
//! it, multiplexed on a single blocking readiness wait on a dedicated
//! thread. Each connection carries an application-defined record type, and
//! the application hooks in through three callbacks: connect, disconnect,
//! packet. A [`Client`] is the single-connection counterpart.
//!
//! Because a connection's first activity is sniffed for an HTTP upgrade
//! request, a browser websocket client and a native binary client can
//! attach to the same port speaking the same payload protocol: the opening
//! handshake is answered transparently, and everything after it is opaque
//! binary payload either way. Payload framing and byte order ([`Message`])
//! stay in the application's hands; the transport never inspects payload
//! bytes.
//!
//! ## Host
//!
//! ```ignore
//! #[derive(Default)]
//! struct Player { hp: i32 }
//!
//! struct Game;
//!
//! impl HostEvents<Player> for Game {
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
//! let host = Host::listen("0.0.0.0:1337", Game)?;
//! host.sender().broadcast(state_bytes);
//! ```
//!
//! ## Client
//!
//! ```ignore
//! let mut client = Client::new();
//! if client.connect("127.0.0.1", 1337) {
//!     client.listen(MyEvents)?;
//! }
//! // poll client.is_connected() and retry connect() as needed
//! ```

pub mod bounded;
pub mod client;
pub mod error;
pub mod handshake;
pub mod host;
pub mod msg;
pub mod split;

mod sockopt;

pub use bounded::BoundedList;
pub use client::{Client, ClientEvents};
pub use error::Error;
pub use host::{Host, HostEvents, HostHandle, HostSender, PeerId};
pub use msg::Message;

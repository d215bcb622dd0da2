//! Upgrade detection on a live socket.
//!
//! Runs exactly once per connection, the first time it becomes readable.
//! The socket's buffered bytes are peeked, never consumed, unless the sniff
//! confirms an upgrade request; a native binary client therefore keeps its
//! first payload intact for the normal packet path.

use std::io::{self, Read, Write};

use tracing::trace;

use super::key::derive_accept_key;
use super::{compose_response, parse_upgrade};

/// Longest upgrade request the sniff will consider.
pub const SNIFF_LEN: usize = 1024;

/// Outcome of [`check_upgrade`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upgrade {
    /// Handshake answered; the request bytes were drained off the socket.
    WebSocket,
    /// Not a websocket client; the socket buffer was left untouched.
    None,
}

/// Readable source that can also expose buffered bytes without consuming
/// them. Implemented for both the reactor's non-blocking streams and plain
/// blocking streams.
pub trait PeekRead: Read {
    fn peek(&self, buf: &mut [u8]) -> io::Result<usize>;
}

impl PeekRead for mio::net::TcpStream {
    fn peek(&self, buf: &mut [u8]) -> io::Result<usize> {
        mio::net::TcpStream::peek(self, buf)
    }
}

impl PeekRead for std::net::TcpStream {
    fn peek(&self, buf: &mut [u8]) -> io::Result<usize> {
        std::net::TcpStream::peek(self, buf)
    }
}

/// Classify the first activity on `stream`.
///
/// Peeks up to [`SNIFF_LEN`] bytes. If they parse as an upgrade request,
/// the `101` response (with the derived `Sec-WebSocket-Accept`) is written
/// back and exactly the peeked bytes are drained, discarding the HTTP
/// request; everything the connection sends afterwards is ordinary payload
/// data. Otherwise nothing is consumed.
pub fn check_upgrade<S: PeekRead + Write>(stream: &mut S) -> io::Result<Upgrade> {
    let mut buf = [0_u8; SNIFF_LEN];
    let peeked = stream.peek(&mut buf)?;

    let request = match parse_upgrade(&buf[..peeked]) {
        Some(request) => request,
        None => return Ok(Upgrade::None),
    };

    let sec_accept = derive_accept_key(request.sec_key);
    let response = compose_response(&sec_accept, request.connection);
    stream.write_all(&response)?;
    trace!(len = response.len(), "wrote 101 response");

    drain(stream, &mut buf, peeked)?;
    Ok(Upgrade::WebSocket)
}

// Pull the already-answered request out of the socket buffer. Anything the
// client pipelined behind it within the peek window is discarded with it,
// matching the peek-then-drain accounting above.
fn drain<S: Read>(stream: &mut S, scratch: &mut [u8], mut remaining: usize) -> io::Result<()> {
    while remaining > 0 {
        let want = remaining.min(scratch.len());
        match stream.read(&mut scratch[..want]) {
            Ok(0) => break, // peer vanished; the next peek reports it
            Ok(n) => remaining -= n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

//! Websocket opening handshake.
//!
//! Only the opening handshake is handled here: a connection whose first
//! bytes look like an HTTP upgrade request gets the `101 Switching
//! Protocols` answer and is then treated as a plain binary-payload
//! connection. No RFC 6455 data-frame coding happens anywhere in this
//! crate; payload framing past the handshake belongs to the embedding
//! application.
//!
//! The parser is deliberately looser than a full HTTP parser: it scans
//! peeked bytes line by line, so a request that is still arriving simply
//! fails the sniff and falls through to the binary-payload path.

pub mod detect;
pub mod key;

pub use detect::{check_upgrade, Upgrade};
pub use key::{derive_accept_key, new_sec_key};

use crate::bounded::BoundedList;
use crate::split::{find_subslice, Split};

/// 258EAFA5-E914-47DA-95CA-C5AB0DC85B11
pub const GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// GET
pub const HTTP_METHOD: &[u8] = b"GET";

/// HTTP/1.1
pub const HTTP_VERSION: &[u8] = b"HTTP/1.1";

/// HTTP/1.1 101 Switching Protocols
pub const HTTP_STATUS_LINE: &[u8] = b"HTTP/1.1 101 Switching Protocols";

/// CRLF
pub const HTTP_LINE_BREAK: &[u8] = b"\r\n";

/// A colon + one SP
pub const HTTP_HEADER_SP: &[u8] = b": ";

/// Most headers an upgrade request may carry before the rest are ignored.
pub const MAX_UPGRADE_HEADERS: usize = 32;

/// Empty header
pub const EMPTY_HEADER: Header = Header::new(b"", b"");

/// Header names and values used on the wire. Lookups are case-sensitive.
pub mod static_headers {
    pub const HEADER_HOST: &[u8] = b"Host";

    pub const HEADER_UPGRADE: &[u8] = b"Upgrade";

    pub const HEADER_CONNECTION: &[u8] = b"Connection";

    pub const HEADER_SEC_WEBSOCKET_KEY: &[u8] = b"Sec-WebSocket-Key";

    pub const HEADER_SEC_WEBSOCKET_ACCEPT: &[u8] = b"Sec-WebSocket-Accept";

    pub const HEADER_SEC_WEBSOCKET_VERSION: &[u8] = b"Sec-WebSocket-Version";

    pub const HEADER_UPGRADE_VALUE: &[u8] = b"websocket";

    pub const HEADER_CONNECTION_VALUE: &[u8] = b"Upgrade";

    pub const HEADER_SEC_WEBSOCKET_VERSION_VALUE: &[u8] = b"13";
}

use static_headers::*;

/// Http header, two borrowed slices.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Header<'b> {
    pub name: &'b [u8],
    pub value: &'b [u8],
}

impl<'b> Header<'b> {
    #[inline]
    pub const fn new(name: &'b [u8], value: &'b [u8]) -> Self {
        Self { name, value }
    }
}

impl Default for Header<'_> {
    fn default() -> Self {
        EMPTY_HEADER
    }
}

/// The load-bearing pieces of a parsed upgrade request.
#[derive(Debug, Copy, Clone)]
pub struct UpgradeRequest<'b> {
    /// Client's `Sec-WebSocket-Key` value, as sent.
    pub sec_key: &'b [u8],
    /// Client's `Connection` value, echoed back in the response.
    pub connection: Option<&'b [u8]>,
}

/// Decide whether `buf` holds a websocket upgrade request.
///
/// Line 0 must contain `GET` and some later `key: value` line must carry
/// `Sec-WebSocket-Key` (exact, case-sensitive name), otherwise this is not
/// a websocket client and `None` comes back. Duplicate header names keep
/// the last value seen; headers past [`MAX_UPGRADE_HEADERS`] are ignored.
pub fn parse_upgrade(buf: &[u8]) -> Option<UpgradeRequest<'_>> {
    let mut lines = Split::new(buf, HTTP_LINE_BREAK);

    let request_line = lines.next()?;
    find_subslice(request_line, HTTP_METHOD)?;

    let mut headers: BoundedList<Header<'_>, MAX_UPGRADE_HEADERS> = BoundedList::new();
    for line in lines {
        let mut pair = Split::new(line, HTTP_HEADER_SP);
        let name = pair.next().unwrap_or(b"");
        let value = match pair.next() {
            Some(value) => value,
            None => continue,
        };
        if name.is_empty() {
            continue;
        }
        match headers.iter_mut().find(|h| h.name == name) {
            Some(header) => header.value = value,
            None => {
                let _ = headers.push(Header::new(name, value));
            }
        }
    }

    let sec_key = headers
        .iter()
        .find(|h| h.name == HEADER_SEC_WEBSOCKET_KEY)?
        .value;
    let connection = headers
        .iter()
        .find(|h| h.name == HEADER_CONNECTION)
        .map(|h| h.value);

    Some(UpgradeRequest {
        sec_key,
        connection,
    })
}

#[inline]
fn push_header(buf: &mut Vec<u8>, name: &[u8], value: &[u8]) {
    buf.extend_from_slice(name);
    buf.extend_from_slice(HTTP_HEADER_SP);
    buf.extend_from_slice(value);
    buf.extend_from_slice(HTTP_LINE_BREAK);
}

/// Compose the complete `101 Switching Protocols` response.
///
/// `connection` is the client's own `Connection` value; when the client
/// did not send one, the literal `Upgrade` goes out instead.
pub fn compose_response(sec_accept: &[u8], connection: Option<&[u8]>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(128);
    buf.extend_from_slice(HTTP_STATUS_LINE);
    buf.extend_from_slice(HTTP_LINE_BREAK);
    push_header(&mut buf, HEADER_UPGRADE, HEADER_UPGRADE_VALUE);
    push_header(
        &mut buf,
        HEADER_CONNECTION,
        connection.unwrap_or(HEADER_CONNECTION_VALUE),
    );
    push_header(&mut buf, HEADER_SEC_WEBSOCKET_ACCEPT, sec_accept);
    buf.extend_from_slice(HTTP_LINE_BREAK);
    buf
}

/// Compose a client upgrade request for `host`/`path` with the given key.
///
/// The host reactor only ever answers these; the composer exists so a
/// native client (or a test) can talk to a websocket-fronted listener
/// without pulling in a browser.
pub fn compose_request(host: &str, path: &str, sec_key: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(192);
    buf.extend_from_slice(HTTP_METHOD);
    buf.push(b' ');
    buf.extend_from_slice(path.as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(HTTP_VERSION);
    buf.extend_from_slice(HTTP_LINE_BREAK);
    push_header(&mut buf, HEADER_HOST, host.as_bytes());
    push_header(&mut buf, HEADER_UPGRADE, HEADER_UPGRADE_VALUE);
    push_header(&mut buf, HEADER_CONNECTION, HEADER_CONNECTION_VALUE);
    push_header(&mut buf, HEADER_SEC_WEBSOCKET_KEY, sec_key);
    push_header(
        &mut buf,
        HEADER_SEC_WEBSOCKET_VERSION,
        HEADER_SEC_WEBSOCKET_VERSION_VALUE,
    );
    buf.extend_from_slice(HTTP_LINE_BREAK);
    buf
}

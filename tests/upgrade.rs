//! End-to-end websocket upgrade against a running host.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::time::Duration;

use netmux::handshake::compose_request;
use netmux::host::{Host, HostEvents, PeerId, TcpStream as HostStream};

const RECV: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(300);

fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[derive(Debug)]
enum Event {
    Connected(PeerId),
    Packet(PeerId, Vec<u8>),
    Disconnected(PeerId),
}

struct Recorder {
    tx: Sender<Event>,
}

impl HostEvents<()> for Recorder {
    fn on_connection(&mut self, peer: PeerId, _stream: &mut HostStream, _state: &mut ()) {
        let _ = self.tx.send(Event::Connected(peer));
    }

    fn on_disconnection(&mut self, peer: PeerId, _stream: &mut HostStream, _state: &mut ()) {
        let _ = self.tx.send(Event::Disconnected(peer));
    }

    fn on_packet(
        &mut self,
        peer: PeerId,
        stream: &mut HostStream,
        _state: &mut (),
    ) -> std::io::Result<usize> {
        let mut buf = [0_u8; 64];
        let n = stream.read(&mut buf)?;
        let _ = self.tx.send(Event::Packet(peer, buf[..n].to_vec()));
        Ok(n)
    }
}

fn read_http_response(stream: &mut TcpStream) -> String {
    stream.set_read_timeout(Some(RECV)).unwrap();
    let mut collected = Vec::new();
    let mut buf = [0_u8; 512];
    while !collected.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf).unwrap();
        assert!(n > 0, "host closed before finishing the response");
        collected.extend_from_slice(&buf[..n]);
    }
    String::from_utf8(collected).unwrap()
}

#[test]
fn websocket_handshake_is_answered_and_never_dispatched() {
    init();
    let (tx, rx) = mpsc::channel();
    let host = Host::listen("127.0.0.1:0", Recorder { tx }).unwrap();

    let mut ws = TcpStream::connect(host.local_addr()).unwrap();
    ws.write_all(&compose_request(
        "127.0.0.1",
        "/",
        b"dGhlIHNhbXBsZSBub25jZQ==",
    ))
    .unwrap();

    let response = read_http_response(&mut ws);
    assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));

    // the handshake produced a connection event and nothing else
    assert!(matches!(rx.recv_timeout(RECV).unwrap(), Event::Connected(_)));
    assert!(matches!(
        rx.recv_timeout(QUIET),
        Err(RecvTimeoutError::Timeout)
    ));

    // the next raw send from the same connection is ordinary payload
    ws.write_all(&[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
    match rx.recv_timeout(RECV).unwrap() {
        Event::Packet(_, bytes) => assert_eq!(bytes, [0xDE, 0xAD, 0xBE, 0xEF]),
        other => panic!("expected a packet event, got {:?}", other),
    }

    drop(ws);
    assert!(matches!(
        rx.recv_timeout(RECV).unwrap(),
        Event::Disconnected(_)
    ));

    host.stop();
}

#[test]
fn binary_first_activity_is_dispatched_exactly_once() {
    init();
    let (tx, rx) = mpsc::channel();
    let host = Host::listen("127.0.0.1:0", Recorder { tx }).unwrap();

    let mut tcp = TcpStream::connect(host.local_addr()).unwrap();
    tcp.write_all(&[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();

    // connection callback always precedes the packet callback
    assert!(matches!(rx.recv_timeout(RECV).unwrap(), Event::Connected(_)));
    match rx.recv_timeout(RECV).unwrap() {
        Event::Packet(_, bytes) => assert_eq!(bytes, [0xDE, 0xAD, 0xBE, 0xEF]),
        other => panic!("expected a packet event, got {:?}", other),
    }

    // exactly once: nothing further until new bytes arrive
    assert!(matches!(
        rx.recv_timeout(QUIET),
        Err(RecvTimeoutError::Timeout)
    ));

    host.stop();
}

#[test]
fn plain_http_request_is_not_answered_as_websocket() {
    init();
    let (tx, rx) = mpsc::channel();
    let host = Host::listen("127.0.0.1:0", Recorder { tx }).unwrap();

    let mut tcp = TcpStream::connect(host.local_addr()).unwrap();
    let request = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
    tcp.write_all(request).unwrap();

    // no key header: the bytes fall through to the packet path intact
    assert!(matches!(rx.recv_timeout(RECV).unwrap(), Event::Connected(_)));
    match rx.recv_timeout(RECV).unwrap() {
        Event::Packet(_, bytes) => assert_eq!(bytes, request),
        other => panic!("expected a packet event, got {:?}", other),
    }

    host.stop();
}

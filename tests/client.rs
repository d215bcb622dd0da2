//! Client reactor: connect failure modes, read loop, manual stepping.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::{self, Sender};
use std::time::Duration;

use netmux::{Client, ClientEvents};

const RECV: Duration = Duration::from_secs(5);

fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[derive(Debug)]
enum Event {
    Packet(Vec<u8>),
    Disconnected,
}

struct Recorder {
    tx: Sender<Event>,
}

impl ClientEvents for Recorder {
    fn on_packet(&mut self, stream: &TcpStream) -> std::io::Result<usize> {
        let mut reader = stream;
        let mut buf = [0_u8; 64];
        let n = reader.read(&mut buf)?;
        let _ = self.tx.send(Event::Packet(buf[..n].to_vec()));
        Ok(n)
    }

    fn on_disconnection(&mut self, _stream: &TcpStream) {
        let _ = self.tx.send(Event::Disconnected);
    }
}

#[test]
fn connect_reports_resolution_failure() {
    init();
    let mut client = Client::new();
    assert!(!client.connect("host.invalid.netmux-test", 1));
    assert!(!client.is_connected());
}

#[test]
fn connect_reports_refused_connection() {
    init();
    // grab a free port, then close it again so nothing is listening there
    let port = {
        let probe = TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };

    let mut client = Client::new();
    assert!(!client.connect("127.0.0.1", port));
    assert!(!client.is_connected());
}

#[test]
fn read_loop_delivers_packets_then_disconnect() {
    init();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut client = Client::new();
    assert!(client.connect("127.0.0.1", port));
    assert!(client.is_connected());

    let (mut server_side, _) = listener.accept().unwrap();

    let (tx, rx) = mpsc::channel();
    client.listen(Recorder { tx }).unwrap();

    server_side.write_all(b"hello").unwrap();
    match rx.recv_timeout(RECV).unwrap() {
        Event::Packet(bytes) => assert_eq!(bytes, b"hello"),
        other => panic!("expected a packet event, got {:?}", other),
    }

    // the host going away surfaces exactly once, through the callback
    drop(server_side);
    assert!(matches!(rx.recv_timeout(RECV).unwrap(), Event::Disconnected));
    assert!(!client.is_connected());

    // explicit teardown after a detected disconnect is a quiet no-op
    client.disconnect();
}

#[test]
fn manual_update_steps_the_connection() {
    init();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut client = Client::new();
    assert!(client.connect("127.0.0.1", port));
    let (mut server_side, _) = listener.accept().unwrap();

    let (tx, rx) = mpsc::channel();
    let mut recorder = Recorder { tx };

    server_side.write_all(&[7, 7, 7]).unwrap();
    assert!(client.update(&mut recorder));
    match rx.try_recv().unwrap() {
        Event::Packet(bytes) => assert_eq!(bytes, [7, 7, 7]),
        other => panic!("expected a packet event, got {:?}", other),
    }

    drop(server_side);
    assert!(!client.update(&mut recorder));
    assert!(matches!(rx.try_recv().unwrap(), Event::Disconnected));
    assert!(!client.is_connected());

    // a dead client refuses further manual steps
    assert!(!client.update(&mut recorder));
}

#[test]
fn reconnect_then_listen_restarts_the_loop() {
    init();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut client = Client::new();

    for round in 0_u8..2 {
        assert!(client.connect("127.0.0.1", port));
        let (mut server_side, _) = listener.accept().unwrap();

        let (tx, rx) = mpsc::channel();
        client.listen(Recorder { tx }).unwrap();

        server_side.write_all(&[round]).unwrap();
        match rx.recv_timeout(RECV).unwrap() {
            Event::Packet(bytes) => assert_eq!(bytes, [round]),
            other => panic!("expected a packet event, got {:?}", other),
        }

        drop(server_side);
        assert!(matches!(rx.recv_timeout(RECV).unwrap(), Event::Disconnected));
        assert!(!client.is_connected());
    }
}

//! End-to-end scenarios driving the engine over real loopback sockets.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

use mio::Token;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use restige::{Config, Connections, Engine, Handler};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    New(Token),
    Data(Token),
    Timeout(Token),
    Closed(Token),
}

struct RecordingHandler {
    events: Sender<Event>,
    close_after_first_request: bool,
}

impl Handler for RecordingHandler {
    fn on_new(&self, token: Token, _conn: &dyn Connections) {
        let _ = self.events.send(Event::New(token));
    }

    fn on_data(&self, token: Token, conn: &dyn Connections) {
        let _ = self.events.send(Event::Data(token));
        let buf = conn.read_buffered(token).unwrap_or_default();
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            conn.set_request(token, None, buf.len(), !self.close_after_first_request);
        } else {
            // Incomplete request line; keep waiting for more bytes.
            conn.set_request(token, Some(Box::new(())), 0, true);
        }
    }

    fn on_timeout(&self, token: Token, _conn: &dyn Connections) {
        let _ = self.events.send(Event::Timeout(token));
    }

    fn on_close(&self, token: Token, _conn: &dyn Connections) {
        let _ = self.events.send(Event::Closed(token));
    }
}

fn start_engine(config: Config, close_after_first_request: bool) -> (Engine, Receiver<Event>) {
    let (tx, rx) = channel();
    let handler = Arc::new(RecordingHandler {
        events: tx,
        close_after_first_request,
    });
    let engine = Engine::start(config, handler).expect("engine starts");
    (engine, rx)
}

fn recv_within(rx: &Receiver<Event>, timeout: Duration) -> Option<Event> {
    rx.recv_timeout(timeout).ok()
}

#[test]
fn plaintext_get_round_trip() {
    let config = Config::builder()
        .server_port(find_free_port())
        .n_worker_threads(2)
        .conn_timeout_sec(30)
        .build();
    let port = config.server_port;

    let (engine, rx) = start_engine(config, true);

    let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    stream
        .write_all(b"GET / HTTP/1.0\r\n\r\n")
        .expect("write request");

    assert!(matches!(
        recv_within(&rx, Duration::from_secs(2)),
        Some(Event::New(_))
    ));
    assert!(matches!(
        recv_within(&rx, Duration::from_secs(2)),
        Some(Event::Data(_))
    ));

    engine.shutdown(5).expect("clean shutdown");
}

#[test]
fn idle_connection_times_out() {
    let config = Config::builder()
        .server_port(find_free_port())
        .n_worker_threads(1)
        .conn_timeout_sec(1)
        .build();
    let port = config.server_port;

    let (engine, rx) = start_engine(config, true);

    let _stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");

    assert!(matches!(
        recv_within(&rx, Duration::from_secs(2)),
        Some(Event::New(_))
    ));
    assert!(matches!(
        recv_within(&rx, Duration::from_secs(3)),
        Some(Event::Timeout(_))
    ));

    engine.shutdown(5).expect("clean shutdown");
}

#[test]
fn oversize_body_is_rejected() {
    let config = Config::builder()
        .server_port(find_free_port())
        .n_worker_threads(1)
        .conn_timeout_sec(30)
        .max_data_per_conn(1024)
        .build();
    let port = config.server_port;

    let (engine, rx) = start_engine(config, true);

    let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    let body = vec![b'a'; 2048];
    stream.write_all(&body).expect("write oversize body");

    assert!(matches!(
        recv_within(&rx, Duration::from_secs(2)),
        Some(Event::New(_))
    ));
    // Over the cap: the engine closes the connection without ever calling
    // `on_data`/`on_close` through the handler's happy path.
    let mut buf = [0u8; 1];
    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
    let n = stream.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0);

    engine.shutdown(5).expect("clean shutdown");
}

#[test]
fn shutdown_quiesces_with_no_live_connections() {
    let config = Config::builder()
        .server_port(find_free_port())
        .n_worker_threads(3)
        .build();
    let (engine, _rx) = start_engine(config, true);
    engine.shutdown(5).expect("quiesces within budget");
}

#[test]
fn tls_get_round_trip() {
    let (server_config, cert_der) = self_signed_server_config("localhost");

    let config = Config::builder()
        .server_port(find_free_port())
        .n_worker_threads(2)
        .conn_timeout_sec(30)
        .ssl_context(server_config)
        .build();
    let port = config.server_port;

    let (engine, rx) = start_engine(config, true);

    let mut roots = RootCertStore::empty();
    roots.add(cert_der).expect("trust self-signed cert");
    let client_config = Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    );
    let server_name = ServerName::try_from("localhost").expect("server name");
    let mut client =
        ClientConnection::new(client_config, server_name).expect("client connection");
    let mut tcp = TcpStream::connect(("127.0.0.1", port)).expect("connect");

    // `rustls::Stream` drives the full (possibly multi-round-trip) handshake
    // as part of the first read/write, the same way a real client would.
    {
        let mut tls = rustls::Stream::new(&mut client, &mut tcp);
        tls.write_all(b"GET / HTTP/1.0\r\n\r\n").expect("write request");
    }

    assert!(matches!(
        recv_within(&rx, Duration::from_secs(2)),
        Some(Event::New(_))
    ));
    assert!(matches!(
        recv_within(&rx, Duration::from_secs(2)),
        Some(Event::Data(_))
    ));

    engine.shutdown(5).expect("clean shutdown");
}

/// Builds a self-signed server TLS config for `common_name`, the way
/// `rcgen` is used for test fixtures elsewhere in the retrieval pack.
/// Returns the config plus the cert DER so a test client can trust it.
fn self_signed_server_config(common_name: &str) -> (Arc<rustls::ServerConfig>, CertificateDer<'static>) {
    let mut params =
        CertificateParams::new(vec![common_name.to_string()]).expect("cert params");
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;

    let key_pair = KeyPair::generate().expect("generate key pair");
    let certificate = params.self_signed(&key_pair).expect("self-sign cert");
    let cert_der = CertificateDer::from(certificate.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der()).expect("private key der");

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], key_der)
        .expect("build server config");

    (Arc::new(server_config), cert_der)
}

fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral");
    listener.local_addr().expect("local_addr").port()
}

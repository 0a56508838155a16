//! TLS end-to-end tests: verified round trips, server-name based bundle
//! selection and certificate failure handling.

mod common;

use bytes::Bytes;
use common::{expired, self_signed, TestCert};
use domonet::net::{
    CertificateBundle, ConnectionId, PemSource, SocketError, TcpConnection, TcpServer,
};
use openssl::nid::Nid;
use openssl::ssl::{Ssl, SslContextBuilder, SslMethod, SslVerifyMode};
use std::net::TcpStream;
use std::sync::mpsc;
use std::time::Duration;

const RECV_TIMEOUT: Duration = Duration::from_secs(10);

fn server_bundle(cert: &TestCert) -> CertificateBundle {
    CertificateBundle::new()
        .cert(PemSource::data(cert.cert_pem.clone()))
        .key(PemSource::data(cert.key_pem.clone()))
}

struct Events {
    connected: mpsc::Receiver<ConnectionId>,
    packets: mpsc::Receiver<(ConnectionId, Bytes)>,
}

fn tls_server(bundles: Vec<(&str, CertificateBundle)>) -> (TcpServer, Events) {
    let (connected_tx, connected) = mpsc::channel();
    let (packets_tx, packets) = mpsc::channel();
    let mut builder = TcpServer::builder()
        .use_tls(true)
        .select_interval(Duration::from_millis(10))
        .on_new_connection(move |id, _, _| {
            let _ = connected_tx.send(id);
        })
        .on_packet_received(move |id, packet| {
            let _ = packets_tx.send((id, packet));
        });
    for (pattern, bundle) in bundles {
        builder = builder.certificate_bundle(pattern, bundle);
    }
    (builder.build(), Events { connected, packets })
}

#[test]
fn test_verified_round_trip() {
    let cert = self_signed("localhost");
    let (server, events) = tls_server(vec![("*", server_bundle(&cert))]);
    let (_, port) = server.start_dynamic_port("127.0.0.1").unwrap();

    let connection = TcpConnection::builder()
        .hostname("localhost")
        .port(port)
        .use_tls(true)
        .verify_certificate(true)
        .verify_hostname(true)
        .ca(PemSource::data(cert.cert_pem.clone()))
        .read_timeout(Duration::from_secs(10))
        .build()
        .unwrap();
    connection.connect().unwrap();

    let id = events.connected.recv_timeout(RECV_TIMEOUT).unwrap();
    connection.write(b"ping").unwrap();
    let (packet_id, packet) = events.packets.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(packet_id, id);
    assert_eq!(&packet[..], b"ping");

    server.send_to_peer(id, b"pong", false).unwrap();
    let mut buf = [0u8; 64];
    let n = connection.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"pong");

    server.wait_until_stopped();
}

#[test]
fn test_untrusted_certificate_downgraded_without_verification() {
    let cert = self_signed("localhost");
    let (server, events) = tls_server(vec![("*", server_bundle(&cert))]);
    let (_, port) = server.start_dynamic_port("127.0.0.1").unwrap();

    // No trust anchor configured; the self-signed peer fails verification,
    // which is only a warning when verification is disabled.
    let connection = TcpConnection::builder()
        .hostname("localhost")
        .port(port)
        .use_tls(true)
        .verify_certificate(false)
        .read_timeout(Duration::from_secs(10))
        .build()
        .unwrap();
    connection.connect().unwrap();

    let id = events.connected.recv_timeout(RECV_TIMEOUT).unwrap();
    connection.write(b"data").unwrap();
    let (packet_id, _) = events.packets.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(packet_id, id);

    server.wait_until_stopped();
}

#[test]
fn test_untrusted_certificate_rejected_with_verification() {
    let cert = self_signed("localhost");
    let (server, _events) = tls_server(vec![("*", server_bundle(&cert))]);
    let (_, port) = server.start_dynamic_port("127.0.0.1").unwrap();

    let other = self_signed("localhost");
    let connection = TcpConnection::builder()
        .hostname("localhost")
        .port(port)
        .use_tls(true)
        .verify_certificate(true)
        .ca(PemSource::data(other.cert_pem.clone()))
        .read_timeout(Duration::from_secs(10))
        .build()
        .unwrap();
    assert!(matches!(connection.connect(), Err(SocketError::Tls(_))));

    server.wait_until_stopped();
}

#[test]
fn test_hostname_mismatch_rejected() {
    let cert = self_signed("localhost");
    let (server, _events) = tls_server(vec![("*", server_bundle(&cert))]);
    let (_, port) = server.start_dynamic_port("127.0.0.1").unwrap();

    let mut connection = TcpConnection::builder()
        .hostname("localhost")
        .port(port)
        .use_tls(true)
        .verify_certificate(true)
        .verify_hostname(true)
        .ca(PemSource::data(cert.cert_pem.clone()))
        .read_timeout(Duration::from_secs(10))
        .build()
        .unwrap();
    connection.set_verification_hostname("other.example");
    assert!(matches!(connection.connect(), Err(SocketError::Tls(_))));

    server.wait_until_stopped();
}

#[test]
fn test_expired_certificate_always_rejected() {
    let cert = expired("localhost");
    let (server, _events) = tls_server(vec![("*", server_bundle(&cert))]);
    let (_, port) = server.start_dynamic_port("127.0.0.1").unwrap();

    // Expiry is a hard failure even with verification disabled.
    for verify in [true, false] {
        let connection = TcpConnection::builder()
            .hostname("localhost")
            .port(port)
            .use_tls(true)
            .verify_certificate(verify)
            .ca(PemSource::data(cert.cert_pem.clone()))
            .read_timeout(Duration::from_secs(10))
            .build()
            .unwrap();
        assert!(matches!(connection.connect(), Err(SocketError::Tls(_))));
    }

    server.wait_until_stopped();
}

#[test]
fn test_client_certificate_enforcement() {
    let server_cert = self_signed("localhost");
    let client_cert = self_signed("client.example");
    let bundle = CertificateBundle::new()
        .ca(PemSource::data(client_cert.cert_pem.clone()))
        .cert(PemSource::data(server_cert.cert_pem.clone()))
        .key(PemSource::data(server_cert.key_pem.clone()));

    let (connected_tx, connected) = mpsc::channel();
    let server = TcpServer::builder()
        .use_tls(true)
        .require_client_cert(true)
        .select_interval(Duration::from_millis(10))
        .certificate_bundle("*", bundle)
        .on_new_connection(move |id, _, _| {
            let _ = connected_tx.send(id);
        })
        .build();
    let (_, port) = server.start_dynamic_port("127.0.0.1").unwrap();

    // A client presenting a certificate the server trusts gets through.
    let trusted = TcpConnection::builder()
        .hostname("localhost")
        .port(port)
        .use_tls(true)
        .verify_certificate(true)
        .ca(PemSource::data(server_cert.cert_pem.clone()))
        .client_cert(
            PemSource::data(client_cert.cert_pem.clone()),
            PemSource::data(client_cert.key_pem.clone()),
        )
        .read_timeout(Duration::from_secs(10))
        .build()
        .unwrap();
    trusted.connect().unwrap();
    connected.recv_timeout(RECV_TIMEOUT).unwrap();

    // A client without a certificate is rejected during the handshake. The
    // rejection alert may arrive after the client finished its side, so the
    // failure is accepted on connect or on the first round trip.
    let bare = TcpConnection::builder()
        .hostname("localhost")
        .port(port)
        .use_tls(true)
        .verify_certificate(true)
        .ca(PemSource::data(server_cert.cert_pem.clone()))
        .read_timeout(Duration::from_secs(10))
        .build()
        .unwrap();
    let result = bare.connect().and_then(|_| {
        bare.write(b"x")?;
        let mut buf = [0u8; 16];
        bare.read(&mut buf).map(|_| ())
    });
    assert!(result.is_err());
    // The server must never have registered the rejected peer.
    assert!(connected.recv_timeout(Duration::from_millis(300)).is_err());

    server.wait_until_stopped();
}

#[test]
fn test_tls_read_fails_after_server_stop() {
    let cert = self_signed("localhost");
    let (server, events) = tls_server(vec![("*", server_bundle(&cert))]);
    let (_, port) = server.start_dynamic_port("127.0.0.1").unwrap();

    let connection = TcpConnection::builder()
        .hostname("localhost")
        .port(port)
        .use_tls(true)
        .verify_certificate(false)
        .read_timeout(Duration::from_secs(10))
        .build()
        .unwrap();
    connection.connect().unwrap();
    events.connected.recv_timeout(RECV_TIMEOUT).unwrap();

    server.wait_until_stopped();

    let mut buf = [0u8; 16];
    assert!(connection.read(&mut buf).is_err());
}

/// Raw handshake probe reporting the common name the server presented for
/// a given server-name extension value.
fn presented_common_name(port: u16, server_name: Option<&str>) -> String {
    let mut builder = SslContextBuilder::new(SslMethod::tls_client()).unwrap();
    builder.set_verify(SslVerifyMode::NONE);
    let context = builder.build();

    let mut ssl = Ssl::new(&context).unwrap();
    if let Some(name) = server_name {
        ssl.set_hostname(name).unwrap();
    }
    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let stream = ssl.connect(stream).unwrap();
    let peer = stream.ssl().peer_certificate().unwrap();
    peer.subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .unwrap()
        .data()
        .as_utf8()
        .unwrap()
        .to_string()
}

#[test]
fn test_server_name_selects_certificate_bundle() {
    let cert_a = self_signed("a.example");
    let cert_b = self_signed("b.example");
    let (server, _events) = tls_server(vec![
        ("a.example", server_bundle(&cert_a)),
        ("b.example", server_bundle(&cert_b)),
    ]);
    let (_, port) = server.start_dynamic_port("127.0.0.1").unwrap();

    assert_eq!(presented_common_name(port, Some("a.example")), "a.example");
    assert_eq!(presented_common_name(port, Some("b.example")), "b.example");
    // Unknown and absent server names fall back to the first bundle.
    assert_eq!(presented_common_name(port, Some("c.example")), "a.example");
    assert_eq!(presented_common_name(port, None), "a.example");

    server.wait_until_stopped();
}

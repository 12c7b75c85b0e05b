//! TLS upgrade, echo, and downgrade scenarios: the socket under test
//! talks to a real peer TLS session whose ciphertext is shuttled
//! through the scripted proactor.

mod common;

use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use common::{establish, MockProactor};
use prosock::{
    DowngradeEvent, Encryption, EncryptionCertificate, EncryptionContext,
    EncryptionContextBuilder, EncryptionManager, EncryptionRole, EncryptionValidation, Error,
    ReceiveOptions, SendOptions, StreamSocket, StreamSocketOptions, UpgradeEvent, UpgradeOptions,
};

fn certificate_for(names: &[&str]) -> (EncryptionCertificate, Vec<u8>) {
    let names: Vec<String> = names.iter().map(|name| name.to_string()).collect();
    let generated = rcgen::generate_simple_self_signed(names).unwrap();
    (
        EncryptionCertificate::from_der(generated.serialize_der().unwrap()),
        generated.serialize_private_key_der(),
    )
}

fn server_context(names: &[&str]) -> (Arc<EncryptionContext>, EncryptionCertificate) {
    let (certificate, key) = certificate_for(names);
    let context = EncryptionContextBuilder::new(EncryptionRole::Server)
        .identity(vec![certificate.clone()], key)
        .build()
        .unwrap();
    (context, certificate)
}

fn client_context(validation: EncryptionValidation) -> Arc<EncryptionContext> {
    EncryptionContextBuilder::new(EncryptionRole::Client)
        .validation(validation)
        .build()
        .unwrap()
}

fn permissive_client_context() -> Arc<EncryptionContext> {
    client_context(EncryptionValidation {
        allow_self_signed: true,
        ..EncryptionValidation::default()
    })
}

/// Move ciphertext between the socket (through the proactor script) and
/// the peer TLS session until neither side produces more.
fn shuttle(proactor: &Arc<MockProactor>, socket: &Arc<StreamSocket>, server: &Encryption) {
    for _ in 0..64 {
        let mut moved = false;
        while let Some(data) = proactor.pop_send() {
            socket.process_socket_sent(Ok(data.len()));
            let _ = server.push_incoming_cipher_text(&data);
            moved = true;
        }
        if server.has_outgoing_cipher_text() {
            let mut cipher = BytesMut::new();
            if server.pop_outgoing_cipher_text(&mut cipher).is_ok() && !cipher.is_empty() {
                if let Some(max_bytes) = proactor.pop_receive() {
                    socket.process_socket_received(max_bytes, Ok(cipher.freeze()));
                    moved = true;
                }
            }
        }
        proactor.pump();
        if !moved {
            break;
        }
    }
}

#[test]
fn tls_upgrade_with_sni_echo_and_downgrade() {
    let proactor = MockProactor::new();
    let (socket, listener) = establish(&proactor, StreamSocketOptions::default());

    // The server dispatches on the requested name: a default context
    // for other.test and a dedicated context for example.test.
    let (default_ctx, default_cert) = server_context(&["other.test"]);
    let (example_ctx, example_cert) = server_context(&["example.test"]);
    assert_ne!(default_cert, example_cert);
    let manager = Arc::new(EncryptionManager::new());
    manager.set_default_context(default_ctx.clone());
    manager.add_context("example.test", example_ctx);
    let server = Encryption::server_with_factory(default_ctx, manager);
    server
        .initiate_handshake(&UpgradeOptions::default(), None)
        .unwrap();

    let encryption = Arc::new(Encryption::client(permissive_client_context()));
    let upgraded = Arc::new(AtomicUsize::new(0));
    let observed = upgraded.clone();
    socket
        .upgrade(
            &encryption,
            &UpgradeOptions {
                server_name: Some("example.test".into()),
                deadline: Some(Instant::now() + Duration::from_secs(5)),
                ..UpgradeOptions::default()
            },
            Some(Box::new(move |_socket, event| {
                match event {
                    UpgradeEvent::Complete(_) => {}
                    other => panic!("unexpected upgrade event: {:?}", other),
                }
                observed.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();

    shuttle(&proactor, &socket, &server);
    assert_eq!(upgraded.load(Ordering::SeqCst), 1);
    assert!(encryption.is_handshake_finished());

    // SNI dispatched to the matching context.
    assert_eq!(encryption.remote_certificate(), Some(example_cert.clone()));
    assert_eq!(socket.remote_certificate(), Some(example_cert));
    assert_eq!(server.server_name().as_deref(), Some("example.test"));

    // Plaintext echo through the encrypted stream.
    socket
        .send(Bytes::from_static(b"ping"), &SendOptions::default(), None)
        .unwrap();
    shuttle(&proactor, &socket, &server);
    let mut plaintext = BytesMut::new();
    server.pop_incoming_plain_text(&mut plaintext).unwrap();
    assert_eq!(&plaintext[..], b"ping");

    let received = Arc::new(Mutex::new(None));
    let observed = received.clone();
    socket
        .receive_async(
            &ReceiveOptions::default(),
            Box::new(move |_socket, data, _event| {
                *observed.lock().unwrap() = data.map(|data| data.to_vec());
            }),
        )
        .unwrap();
    server.push_outgoing_plain_text(b"pong").unwrap();
    shuttle(&proactor, &socket, &server);
    assert_eq!(received.lock().unwrap().as_deref(), Some(&b"pong"[..]));

    // Bidirectional close-notify returns the connection to plaintext.
    socket.downgrade().unwrap();
    shuttle(&proactor, &socket, &server);
    assert!(server.is_shutdown_received());
    server.shutdown().unwrap();
    shuttle(&proactor, &socket, &server);

    assert_eq!(
        listener.downgrade_events(),
        vec![DowngradeEvent::Initiated, DowngradeEvent::Complete]
    );
    assert!(encryption.is_shutdown_finished());
    assert!(server.is_shutdown_finished());
    assert!(socket.encryption().is_none());
}

#[test]
fn downgrade_with_incoming_leftovers() {
    let proactor = MockProactor::new();
    let (socket, listener) = establish(&proactor, StreamSocketOptions::default());

    let (server_ctx, _certificate) = server_context(&["example.test"]);
    let server = Encryption::server(server_ctx);
    server
        .initiate_handshake(&UpgradeOptions::default(), None)
        .unwrap();

    let encryption = Arc::new(Encryption::client(permissive_client_context()));
    socket
        .upgrade(
            &encryption,
            &UpgradeOptions {
                server_name: Some("example.test".into()),
                keep_incoming_leftovers: true,
                ..UpgradeOptions::default()
            },
            None,
        )
        .unwrap();
    shuttle(&proactor, &socket, &server);
    assert!(encryption.is_handshake_finished());

    // The peer sends one data record, its close-notify, and trailing
    // plaintext concatenated in the same transport segment.
    server.push_outgoing_plain_text(b"pre").unwrap();
    server.shutdown().unwrap();
    let mut wire = BytesMut::new();
    server.pop_outgoing_cipher_text(&mut wire).unwrap();
    wire.extend_from_slice(b"post");
    let max_bytes = proactor.pop_receive().expect("no pending receive");
    socket.process_socket_received(max_bytes, Ok(wire.freeze()));
    proactor.pump();

    // The close-notify is echoed and the downgrade completes.
    shuttle(&proactor, &socket, &server);
    assert!(server.is_shutdown_finished());
    assert_eq!(
        listener.downgrade_events(),
        vec![DowngradeEvent::Initiated, DowngradeEvent::Complete]
    );

    // Pre-close-notify plaintext is delivered through the receive
    // queue; the trailing bytes surface as leftovers.
    let pre = socket.receive(&ReceiveOptions::default()).unwrap();
    assert_eq!(&pre[..], b"pre");
    let mut leftovers = BytesMut::new();
    encryption.pop_incoming_leftovers(&mut leftovers).unwrap();
    assert_eq!(&leftovers[..], b"post");
}

#[test]
fn upgrade_failure_shuts_the_socket_down() {
    let proactor = MockProactor::new();
    let (socket, _listener) = establish(&proactor, StreamSocketOptions::default());

    let (server_ctx, _certificate) = server_context(&["example.test"]);
    let server = Encryption::server(server_ctx);
    server
        .initiate_handshake(&UpgradeOptions::default(), None)
        .unwrap();

    // No trust anchors and no self-signed waiver: verification fails.
    let encryption = Arc::new(Encryption::client(client_context(
        EncryptionValidation::default(),
    )));
    let failed = Arc::new(AtomicUsize::new(0));
    let observed = failed.clone();
    socket
        .upgrade(
            &encryption,
            &UpgradeOptions {
                server_name: Some("example.test".into()),
                ..UpgradeOptions::default()
            },
            Some(Box::new(move |_socket, event| {
                match event {
                    UpgradeEvent::Error(context) => {
                        assert_eq!(context.error, Some(Error::NotAuthorized));
                    }
                    other => panic!("unexpected upgrade event: {:?}", other),
                }
                observed.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();

    shuttle(&proactor, &socket, &server);
    assert_eq!(failed.load(Ordering::SeqCst), 1);

    // The failed upgrade tears the connection down.
    assert_eq!(
        socket.send(Bytes::from_static(b"x"), &SendOptions::default(), None),
        Err(Error::Invalid)
    );
}

#[test]
fn send_during_handshake_completes_without_ciphertext() {
    let proactor = MockProactor::new();
    let (socket, _listener) = establish(&proactor, StreamSocketOptions::default());

    let (server_ctx, _certificate) = server_context(&["example.test"]);
    let server = Encryption::server(server_ctx);
    server
        .initiate_handshake(&UpgradeOptions::default(), None)
        .unwrap();

    let encryption = Arc::new(Encryption::client(permissive_client_context()));
    socket
        .upgrade(
            &encryption,
            &UpgradeOptions {
                server_name: Some("example.test".into()),
                ..UpgradeOptions::default()
            },
            None,
        )
        .unwrap();

    // The handshake has not completed: the payload is absorbed and the
    // completion is dispatched immediately.
    let completed = Arc::new(AtomicUsize::new(0));
    let observed = completed.clone();
    socket
        .send(
            Bytes::from_static(b"early"),
            &SendOptions::default(),
            Some(Box::new(move |_socket, event| {
                match event {
                    prosock::SendEvent::Complete(_) => {}
                    other => panic!("unexpected send event: {:?}", other),
                }
                observed.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
    proactor.pump();
    assert_eq!(completed.load(Ordering::SeqCst), 1);

    // Once the handshake completes the staged plaintext goes out and
    // the peer reads it.
    shuttle(&proactor, &socket, &server);
    assert!(encryption.is_handshake_finished());
    let mut plaintext = BytesMut::new();
    server.pop_incoming_plain_text(&mut plaintext).unwrap();
    assert_eq!(&plaintext[..], b"early");
}

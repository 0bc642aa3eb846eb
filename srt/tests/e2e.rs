//! End-to-end scenarios (§8) driven through the public `Socket`/`Listener` API
//! against a real loopback UDP pair, rather than unit-level calls into
//! `Connection` directly.

use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

use srt::{Config, Listener, Socket};
use utils::error::ErrorKind;

const ANY: &str = "127.0.0.1:0";

fn spawn_listener(config: Config) -> (Listener, SocketAddr) {
	let listener = Listener::bind(ANY.parse().unwrap(), config).unwrap();
	let addr = listener.local_addr().unwrap();
	(listener, addr)
}

#[test]
fn clean_send_and_receive_round_trip() {
	let (listener, server_addr) = spawn_listener(Config::default());

	let client = thread::spawn(move || {
		let config = Config::default().with_conn_timeout(Duration::from_secs(2));
		let sock = Socket::connect(ANY.parse().unwrap(), server_addr, config).unwrap();
		sock.send(b"first message").unwrap();
		sock.send(b"second message").unwrap();
		sock
	});

	let server = listener.accept(Some(Duration::from_secs(2))).unwrap();
	let first = server.recv().unwrap();
	let second = server.recv().unwrap();

	assert_eq!(first.data, b"first message");
	assert_eq!(second.data, b"second message");
	assert!(second.seq.value() >= first.seq.value());

	let _ = client.join().unwrap();
}

#[test]
fn rejects_bad_passphrase_on_encrypted_connect() {
	let server_config = Config::default().with_passphrase("correct horse battery staple", crypto::KeyLen::Aes128);
	let (listener, server_addr) = spawn_listener(server_config);

	let client = thread::spawn(move || {
		let config = Config::default().with_passphrase("wrong horse battery staple", crypto::KeyLen::Aes128).with_conn_timeout(Duration::from_millis(800));
		let sock = Socket::connect(ANY.parse().unwrap(), server_addr, config).unwrap();
		sock.send(b"should not be readable").unwrap();
		sock
	});

	let server = listener.accept(Some(Duration::from_secs(2))).unwrap();

	// The handshake itself doesn't carry the passphrase (only the wrapped SEK), so it
	// still completes; the payload fails to decrypt under the mismatched key instead.
	// A malformed-ciphertext packet is dropped rather than surfaced to `recv`, so this
	// assertion exercises "no crash, no spurious delivery" rather than an explicit
	// error return.
	let got = server.recv_timeout_or_none();
	assert!(got.is_none(), "a payload encrypted under a different key must never decrypt to plaintext");

	let _ = client.join().unwrap();
}

trait RecvTimeoutOrNone {
	fn recv_timeout_or_none(&self) -> Option<Vec<u8>>;
}

impl RecvTimeoutOrNone for Socket {
	fn recv_timeout_or_none(&self) -> Option<Vec<u8>> {
		let deadline = std::time::Instant::now() + Duration::from_millis(500);
		while std::time::Instant::now() < deadline {
			if let Ok(d) = self.recv() {
				return Some(d.data);
			}
			thread::sleep(Duration::from_millis(20));
		}
		None
	}
}

#[test]
fn encrypted_session_round_trips_with_matching_passphrase() {
	let passphrase = "correct horse battery staple";
	let server_config = Config::default().with_passphrase(passphrase, crypto::KeyLen::Aes128);
	let (listener, server_addr) = spawn_listener(server_config);

	let client = thread::spawn(move || {
		let config = Config::default().with_passphrase(passphrase, crypto::KeyLen::Aes128).with_conn_timeout(Duration::from_secs(2));
		let sock = Socket::connect(ANY.parse().unwrap(), server_addr, config).unwrap();
		sock.send(b"secret payload").unwrap();
		sock
	});

	let server = listener.accept(Some(Duration::from_secs(2))).unwrap();
	let delivered = server.recv().unwrap();
	assert_eq!(delivered.data, b"secret payload");

	let _ = client.join().unwrap();
}

#[test]
fn rendezvous_handshake_connects_both_sides() {
	let a_channel = std::net::UdpSocket::bind(ANY).unwrap();
	let a_addr = a_channel.local_addr().unwrap();
	drop(a_channel);
	let b_channel = std::net::UdpSocket::bind(ANY).unwrap();
	let b_addr = b_channel.local_addr().unwrap();
	drop(b_channel);

	let config_a = Config::default().with_rendezvous(true).with_conn_timeout(Duration::from_secs(2));
	let config_b = config_a.clone();

	let side_a = thread::spawn(move || Socket::connect(a_addr, b_addr, config_a));
	let side_b = thread::spawn(move || Socket::connect(b_addr, a_addr, config_b));

	let sock_a = side_a.join().unwrap().unwrap();
	let sock_b = side_b.join().unwrap().unwrap();

	assert!(sock_a.is_connected());
	assert!(sock_b.is_connected());
}

#[test]
fn stats_report_sent_and_received_totals() {
	let (listener, server_addr) = spawn_listener(Config::default());

	let client = thread::spawn(move || {
		let config = Config::default().with_conn_timeout(Duration::from_secs(2));
		let sock = Socket::connect(ANY.parse().unwrap(), server_addr, config).unwrap();
		for i in 0..10 {
			sock.send(format!("message {i}").as_bytes()).unwrap();
		}
		sock
	});

	let server = listener.accept(Some(Duration::from_secs(2))).unwrap();
	for _ in 0..10 {
		server.recv().unwrap();
	}

	let client = client.join().unwrap();

	let sent = client.stats();
	assert_eq!(sent.sent_packets, 10);
	assert_eq!(sent.retrans_packets, 0);

	let recvd = server.stats();
	assert_eq!(recvd.recv_packets, 10);
	assert_eq!(recvd.lost_packets, 0);
}

#[test]
fn bad_passphrase_connection_refuses_send_and_recv_with_security_error() {
	let server_config = Config::default().with_passphrase("correct horse battery staple", crypto::KeyLen::Aes128);
	let (listener, server_addr) = spawn_listener(server_config);

	let client = thread::spawn(move || {
		let config = Config::default().with_passphrase("wrong horse battery staple", crypto::KeyLen::Aes128).with_conn_timeout(Duration::from_millis(800));
		let sock = Socket::connect(ANY.parse().unwrap(), server_addr, config).unwrap();

		// The handshake completes (it never carries the passphrase itself), but once
		// the mismatched key is confirmed as unusable the socket must refuse rather
		// than silently drop payloads.
		let deadline = std::time::Instant::now() + Duration::from_secs(2);
		let mut last = sock.send(b"probe");
		while last.is_ok() && std::time::Instant::now() < deadline {
			thread::sleep(Duration::from_millis(20));
			last = sock.send(b"probe");
		}
		last
	});

	let _server = listener.accept(Some(Duration::from_secs(2))).unwrap();
	let result = client.join().unwrap();

	let err = result.expect_err("send over a bad-passphrase connection must eventually be refused");
	assert_eq!(err.kind, ErrorKind::Security);
}

#[test]
fn hsv4_listener_falls_back_to_post_handshake_extension_negotiation() {
	let server_config = Config::default().with_max_hs_version(4);
	let (listener, server_addr) = spawn_listener(server_config);

	let client = thread::spawn(move || {
		let config = Config::default().with_conn_timeout(Duration::from_secs(2));
		let sock = Socket::connect(ANY.parse().unwrap(), server_addr, config).unwrap();
		sock.send(b"hello over hsv4").unwrap();
		sock
	});

	let server = listener.accept(Some(Duration::from_secs(2))).unwrap();
	let delivered = server.recv().unwrap();
	assert_eq!(delivered.data, b"hello over hsv4");

	let client = client.join().unwrap();
	assert!(client.is_connected());
	assert!(server.is_connected());
}

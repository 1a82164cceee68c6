use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use netlane::{ConnectError, ConnectOptions, Endpoint, IoError, Tcp, poll_once};

fn drive_until(deadline: Duration, done: impl Fn() -> bool) {
	let start = Instant::now();
	while !done() {
		assert!(
			start.elapsed() < deadline,
			"deadline passed waiting for readiness"
		);
		poll_once();
		std::thread::sleep(Duration::from_millis(2));
	}
}

#[test]
fn echo_round_trip_fires_completions_in_order() {
	let listener = TcpListener::bind("127.0.0.1:0").unwrap();
	let port = listener.local_addr().unwrap().port();
	let server = std::thread::spawn(move || {
		let (mut peer, _) = listener.accept().unwrap();
		let mut buf = [0u8; 11];
		peer.read_exact(&mut buf).unwrap();
		assert_eq!(&buf, b"hello world");
		peer.write_all(&buf).unwrap();
	});

	let connected = Arc::new(AtomicBool::new(false));
	let received = Arc::new(Mutex::new(Vec::new()));
	let tcp = Tcp::new();
	let c = connected.clone();
	let r = received.clone();
	tcp.connect(
		ConnectOptions::new("127.0.0.1", port).nodelay(true),
		Box::new(move |result, peer| {
			result.unwrap();
			assert!(peer.is_some());
			c.store(true, Ordering::SeqCst);
		}),
		Box::new(|| {}),
		Box::new(move |result| {
			// Peer shutdown after the echo surfaces here as an error.
			if let Ok(chunk) = result {
				r.lock().unwrap().extend_from_slice(chunk);
			}
		}),
	);
	assert!(connected.load(Ordering::SeqCst));
	assert!(tcp.established());

	let completions = Arc::new(AtomicUsize::new(0));
	let first = completions.clone();
	let second = completions.clone();
	tcp.send(
		b"hello ",
		Box::new(move |result| {
			assert_eq!(result.unwrap(), 6);
			assert_eq!(first.fetch_add(1, Ordering::SeqCst), 0);
		}),
	);
	tcp.send(
		b"world",
		Box::new(move |result| {
			assert_eq!(result.unwrap(), 5);
			assert_eq!(second.fetch_add(1, Ordering::SeqCst), 1);
		}),
	);

	drive_until(Duration::from_secs(5), || {
		received.lock().unwrap().len() >= 11
	});
	assert_eq!(received.lock().unwrap().as_slice(), b"hello world");
	assert_eq!(completions.load(Ordering::SeqCst), 2);
	server.join().unwrap();
}

#[test]
fn refused_connection_reports_error_not_timeout() {
	let port = {
		let listener = TcpListener::bind("127.0.0.1:0").unwrap();
		listener.local_addr().unwrap().port()
	};

	let failed = Arc::new(AtomicBool::new(false));
	let f = failed.clone();
	let tcp = Tcp::new();
	tcp.connect(
		ConnectOptions::new("127.0.0.1", port).timeout(Duration::from_secs(2)),
		Box::new(move |result, peer| {
			let err = result.unwrap_err();
			assert!(!err.timed_out());
			assert!(peer.is_some());
			f.store(true, Ordering::SeqCst);
		}),
		Box::new(|| {}),
		Box::new(|_| {}),
	);
	assert!(failed.load(Ordering::SeqCst));
	assert!(!tcp.established());
}

#[test]
fn unanswered_connect_times_out() {
	// Zero-backlog listener that never accepts: once the queue is full,
	// further handshakes get no answer and the attempt has to time out.
	let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
	assert!(fd >= 0);
	let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
	sin.sin_family = libc::AF_INET as libc::sa_family_t;
	sin.sin_addr.s_addr = u32::from_ne_bytes([127, 0, 0, 1]);
	let len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
	unsafe {
		assert_eq!(
			libc::bind(fd, &sin as *const _ as *const libc::sockaddr, len),
			0
		);
		assert_eq!(libc::listen(fd, 0), 0);
		let mut out_len = len;
		assert_eq!(
			libc::getsockname(fd, &mut sin as *mut _ as *mut libc::sockaddr, &mut out_len),
			0
		);
	}
	let port = u16::from_be(sin.sin_port);

	let addr = SocketAddr::from(([127, 0, 0, 1], port));
	let mut held = Vec::new();
	for _ in 0..8 {
		match TcpStream::connect_timeout(&addr, Duration::from_millis(250)) {
			Ok(stream) => held.push(stream),
			Err(_) => break,
		}
	}

	let timed_out = Arc::new(AtomicBool::new(false));
	let t = timed_out.clone();
	let tcp = Tcp::new();
	tcp.connect(
		ConnectOptions::new("127.0.0.1", port).timeout(Duration::from_millis(400)),
		Box::new(move |result, _| {
			assert!(result.unwrap_err().timed_out());
			t.store(true, Ordering::SeqCst);
		}),
		Box::new(|| {}),
		Box::new(|_| {}),
	);
	assert!(timed_out.load(Ordering::SeqCst));

	drop(held);
	unsafe { libc::close(fd) };
}

#[test]
fn second_connect_while_active_is_rejected_as_busy() {
	let listener = TcpListener::bind("127.0.0.1:0").unwrap();
	let port = listener.local_addr().unwrap().port();

	let tcp = Tcp::new();
	tcp.connect(
		ConnectOptions::new("127.0.0.1", port),
		Box::new(|result, _| result.unwrap()),
		Box::new(|| {}),
		Box::new(|_| {}),
	);
	assert!(tcp.established());

	let rejected = Arc::new(AtomicBool::new(false));
	let r = rejected.clone();
	tcp.connect(
		ConnectOptions::new("127.0.0.1", port),
		Box::new(move |result, _| {
			assert!(matches!(result.unwrap_err(), ConnectError::Busy));
			r.store(true, Ordering::SeqCst);
		}),
		Box::new(|| {}),
		Box::new(|_| {}),
	);
	assert!(rejected.load(Ordering::SeqCst));
	assert!(tcp.established());
}

#[test]
fn connect_endpoint_reuses_a_resolved_address() {
	let listener = TcpListener::bind("127.0.0.1:0").unwrap();
	let port = listener.local_addr().unwrap().port();

	let connected = Arc::new(AtomicBool::new(false));
	let c = connected.clone();
	let tcp = Tcp::new();
	tcp.connect_endpoint(
		Endpoint::new([127, 0, 0, 1], port),
		Duration::from_secs(2),
		Box::new(move |result, _| {
			result.unwrap();
			c.store(true, Ordering::SeqCst);
		}),
	);
	assert!(connected.load(Ordering::SeqCst));
	assert!(tcp.established());
	assert_eq!(tcp.peer().map(|e| e.port()), Some(port));
}

#[test]
fn close_is_idempotent_and_send_after_close_fails() {
	let listener = TcpListener::bind("127.0.0.1:0").unwrap();
	let port = listener.local_addr().unwrap().port();

	let tcp = Tcp::new();
	tcp.connect(
		ConnectOptions::new("127.0.0.1", port),
		Box::new(|result, _| result.unwrap()),
		Box::new(|| {}),
		Box::new(|_| {}),
	);
	assert!(tcp.established());

	tcp.close();
	tcp.close();
	assert!(!tcp.established());
	assert!(tcp.raw_fd().is_none());

	let failed = Arc::new(AtomicBool::new(false));
	let f = failed.clone();
	tcp.send(
		b"late",
		Box::new(move |result| {
			assert!(matches!(result.unwrap_err(), IoError::Closed));
			f.store(true, Ordering::SeqCst);
		}),
	);
	assert!(failed.load(Ordering::SeqCst));
}

#[test]
fn invalid_trust_anchor_fails_the_connect() {
	let listener = TcpListener::bind("127.0.0.1:0").unwrap();
	let port = listener.local_addr().unwrap().port();

	let failed = Arc::new(AtomicBool::new(false));
	let f = failed.clone();
	let tcp = Tcp::new();
	tcp.connect(
		ConnectOptions::new("127.0.0.1", port).tls(Some(b"not a certificate".to_vec())),
		Box::new(move |result, _| {
			assert!(matches!(result.unwrap_err(), ConnectError::Tls(_)));
			f.store(true, Ordering::SeqCst);
		}),
		Box::new(|| {}),
		Box::new(|_| {}),
	);
	assert!(failed.load(Ordering::SeqCst));
	assert!(!tcp.established());
	drop(listener);
}

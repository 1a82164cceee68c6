use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use netlane::{Endpoint, IoError, Udp, poll_once};

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
fn datagram_round_trip_reports_sender_address() {
	let server = UdpSocket::bind("127.0.0.1:0").unwrap();
	let server_port = server.local_addr().unwrap().port();
	server
		.set_read_timeout(Some(Duration::from_secs(5)))
		.unwrap();

	let received: Arc<Mutex<Option<(Vec<u8>, Endpoint)>>> = Arc::new(Mutex::new(None));
	let r = received.clone();
	let udp = Udp::new(
		"127.0.0.1",
		server_port,
		Box::new(|result| result.unwrap()),
		Box::new(|| {}),
		Box::new(move |result| {
			let (chunk, from) = result.unwrap();
			*r.lock().unwrap() = Some((chunk.to_vec(), from));
		}),
	);
	assert_eq!(udp.endpoint().map(|e| e.port()), Some(server_port));

	let sent = Arc::new(AtomicBool::new(false));
	let s = sent.clone();
	udp.send(
		b"ping",
		Box::new(move |result| {
			assert_eq!(result.unwrap(), 4);
			s.store(true, Ordering::SeqCst);
		}),
	);
	assert!(sent.load(Ordering::SeqCst));

	let echo = std::thread::spawn(move || {
		let mut buf = [0u8; 16];
		let (n, from) = server.recv_from(&mut buf).unwrap();
		assert_eq!(&buf[..n], b"ping");
		server.send_to(b"pong", from).unwrap();
	});

	drive_until(Duration::from_secs(5), || received.lock().unwrap().is_some());
	let (chunk, from) = received.lock().unwrap().take().unwrap();
	assert_eq!(chunk, b"pong");
	assert_eq!(from.ip(), [127, 0, 0, 1]);
	assert_eq!(from.port(), server_port);
	echo.join().unwrap();
}

#[test]
fn failed_setup_reports_init_error_and_rejects_sends() {
	let inited = Arc::new(AtomicBool::new(false));
	let i = inited.clone();
	let udp = Udp::new(
		"host.invalid",
		9,
		Box::new(move |result| {
			assert!(result.is_err());
			i.store(true, Ordering::SeqCst);
		}),
		Box::new(|| {}),
		Box::new(|_| {}),
	);
	assert!(inited.load(Ordering::SeqCst));
	assert!(udp.endpoint().is_none());
	assert!(udp.raw_fd().is_none());

	let failed = Arc::new(AtomicBool::new(false));
	let f = failed.clone();
	udp.send(
		b"late",
		Box::new(move |result| {
			assert!(matches!(result.unwrap_err(), IoError::Closed));
			f.store(true, Ordering::SeqCst);
		}),
	);
	assert!(failed.load(Ordering::SeqCst));
}

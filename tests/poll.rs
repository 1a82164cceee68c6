use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use netlane::{Udp, poll_once};

// The registry is process-global, so everything that depends on it being
// empty runs as one sequential test in its own binary.
#[test]
fn registry_reports_participation_and_compacts_dropped_endpoints() {
	assert!(!poll_once());

	let inited = Arc::new(AtomicBool::new(false));
	let flag = inited.clone();
	let udp = Udp::new(
		"127.0.0.1",
		9,
		Box::new(move |result| {
			assert!(result.is_ok());
			flag.store(true, Ordering::SeqCst);
		}),
		Box::new(|| {}),
		Box::new(|_| {}),
	);
	assert!(inited.load(Ordering::SeqCst));
	assert!(poll_once());

	// Dropping the endpoint leaves a dead weak entry behind; the next pass
	// compacts it away and reports an empty registry again.
	drop(udp);
	assert!(!poll_once());
}

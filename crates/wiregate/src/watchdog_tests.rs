use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::time::sleep;

use super::Watchdog;

const INTERVAL: Duration = Duration::from_millis(100);

fn counting_watchdog() -> (Watchdog, Arc<AtomicUsize>) {
	let fired = Arc::new(AtomicUsize::new(0));
	let w = Watchdog::new(INTERVAL);
	let count = fired.clone();
	w.set_callback(move || {
		count.fetch_add(1, Ordering::SeqCst);
	});
	(w, fired)
}

#[tokio::test(start_paused = true)]
async fn fires_once_and_does_not_rearm() {
	let (w, fired) = counting_watchdog();
	w.start();
	sleep(INTERVAL * 2).await;
	assert_eq!(fired.load(Ordering::SeqCst), 1);
	sleep(INTERVAL * 5).await;
	assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn refresh_pushes_the_deadline_out() {
	let (w, fired) = counting_watchdog();
	w.start();
	for _ in 0..4 {
		sleep(INTERVAL / 2).await;
		w.refresh();
	}
	assert_eq!(fired.load(Ordering::SeqCst), 0);
	sleep(INTERVAL * 2).await;
	assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn refresh_while_idle_arms_the_timer() {
	let (w, fired) = counting_watchdog();
	w.refresh();
	sleep(INTERVAL * 2).await;
	assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn no_fire_after_stop() {
	let (w, fired) = counting_watchdog();
	w.start();
	sleep(INTERVAL / 2).await;
	w.stop();
	sleep(INTERVAL * 3).await;
	assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn start_is_idempotent_while_running() {
	let (w, fired) = counting_watchdog();
	w.start();
	sleep(INTERVAL / 2).await;
	// A second start must not reset the deadline.
	w.start();
	sleep(INTERVAL / 2).await;
	assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn callback_installed_at_expiry_wins() {
	let w = Watchdog::new(INTERVAL);
	let first = Arc::new(AtomicUsize::new(0));
	let second = Arc::new(AtomicUsize::new(0));

	let count = first.clone();
	w.set_callback(move || {
		count.fetch_add(1, Ordering::SeqCst);
	});
	w.start();
	sleep(INTERVAL / 2).await;

	let count = second.clone();
	w.set_callback(move || {
		count.fetch_add(1, Ordering::SeqCst);
	});
	sleep(INTERVAL).await;

	assert_eq!(first.load(Ordering::SeqCst), 0);
	assert_eq!(second.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn can_be_armed_again_after_firing() {
	let (w, fired) = counting_watchdog();
	w.start();
	sleep(INTERVAL * 2).await;
	assert_eq!(fired.load(Ordering::SeqCst), 1);
	w.start();
	sleep(INTERVAL * 2).await;
	assert_eq!(fired.load(Ordering::SeqCst), 2);
}

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

#[cfg(test)]
#[path = "watchdog_tests.rs"]
mod tests;

type Callback = Arc<dyn Fn() + Send + Sync>;

/// A single rearm-able idle timer supervising one session.
///
/// `start` arms it, `refresh` pushes the deadline out a full interval (arming
/// first if needed), `stop` disarms it. When the deadline passes while armed,
/// the callback installed at that moment runs exactly once; the timer does
/// not rearm itself.
///
/// `refresh` is called after every successful I/O operation in the relay
/// loops, so it has to be cheap: it only moves the deadline. One waiter task
/// per arm sleeps toward the deadline and goes back to sleep whenever it
/// finds the deadline has moved on.
///
/// The callback runs under the watchdog's internal lock, which is what makes
/// the `stop` guarantee hold: once `stop` returns, no callback is running or
/// will run. The flip side is that callbacks must not call back into the
/// watchdog; ours only trip cancellation tokens.
pub struct Watchdog {
	interval: Duration,
	state: Arc<Mutex<State>>,
}

struct State {
	running: bool,
	// Bumped on every arm/stop; a waiter only acts while the generation it
	// was armed with is current, so an aborted or superseded waiter can never
	// invoke the callback.
	generation: u64,
	deadline: Instant,
	callback: Option<Callback>,
	waiter: Option<JoinHandle<()>>,
}

impl Watchdog {
	pub fn new(interval: Duration) -> Self {
		Watchdog {
			interval,
			state: Arc::new(Mutex::new(State {
				running: false,
				generation: 0,
				deadline: Instant::now(),
				callback: None,
				waiter: None,
			})),
		}
	}

	pub fn set_callback(&self, f: impl Fn() + Send + Sync + 'static) {
		self.state.lock().unwrap().callback = Some(Arc::new(f));
	}

	/// Arms the timer if it is not already running.
	pub fn start(&self) {
		let mut state = self.state.lock().unwrap();
		if state.running {
			return;
		}
		self.arm(&mut state);
	}

	/// Pushes the deadline out to a full interval from now; equivalent to
	/// `start` when the timer is idle.
	pub fn refresh(&self) {
		let mut state = self.state.lock().unwrap();
		if state.running {
			state.deadline = Instant::now() + self.interval;
		} else {
			self.arm(&mut state);
		}
	}

	/// Disarms the timer. No callback runs after this returns.
	pub fn stop(&self) {
		let mut state = self.state.lock().unwrap();
		state.running = false;
		state.generation += 1;
		if let Some(waiter) = state.waiter.take() {
			waiter.abort();
		}
	}

	fn arm(&self, state: &mut State) {
		state.running = true;
		state.generation += 1;
		state.deadline = Instant::now() + self.interval;
		let armed_generation = state.generation;
		if let Some(previous) = state.waiter.take() {
			previous.abort();
		}
		let shared = Arc::clone(&self.state);
		state.waiter = Some(tokio::spawn(async move {
			loop {
				let deadline = {
					let state = shared.lock().unwrap();
					if !state.running || state.generation != armed_generation {
						return;
					}
					state.deadline
				};
				tokio::time::sleep_until(deadline).await;

				let mut state = shared.lock().unwrap();
				if !state.running || state.generation != armed_generation {
					return;
				}
				if Instant::now() < state.deadline {
					// Refreshed while we slept; sleep toward the new deadline.
					continue;
				}
				state.running = false;
				state.waiter = None;
				if let Some(callback) = state.callback.clone() {
					// Still holding the lock, see the type-level comment.
					callback();
				}
				return;
			}
		}));
	}
}

impl Drop for Watchdog {
	fn drop(&mut self) {
		self.stop();
	}
}

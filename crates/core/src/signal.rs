use tokio::sync::mpsc;

/// Shutdown aggregates the ways the process can be asked to stop: OS signals
/// and explicit triggers from elsewhere in the program.
pub struct Shutdown {
	tx: mpsc::Sender<()>,
	rx: mpsc::Receiver<()>,
}

impl Shutdown {
	pub fn new() -> Self {
		let (tx, rx) = mpsc::channel(1);
		Shutdown { tx, rx }
	}

	/// Returns a handle that can request a shutdown programmatically.
	pub fn trigger(&self) -> ShutdownTrigger {
		ShutdownTrigger {
			tx: self.tx.clone(),
		}
	}

	/// Completes once a shutdown has been requested, by signal or by trigger.
	pub async fn wait(mut self) {
		imp::wait(&mut self.rx).await
	}
}

impl Default for Shutdown {
	fn default() -> Self {
		Self::new()
	}
}

#[derive(Clone, Debug)]
pub struct ShutdownTrigger {
	tx: mpsc::Sender<()>,
}

impl ShutdownTrigger {
	pub async fn shutdown_now(&self) {
		let _ = self.tx.send(()).await;
	}
}

#[cfg(unix)]
mod imp {
	use std::process;

	use tokio::signal::unix::{SignalKind, signal};
	use tokio::sync::mpsc::Receiver;
	use tracing::info;

	pub(super) async fn wait(rx: &mut Receiver<()>) {
		tokio::select! {
			_ = caught(SignalKind::interrupt(), "SIGINT") => {
				// A second Ctrl+C skips the graceful path entirely.
				tokio::spawn(async {
					caught(SignalKind::interrupt(), "SIGINT").await;
					info!("second SIGINT, exiting immediately");
					process::exit(0);
				});
			}
			_ = caught(SignalKind::terminate(), "SIGTERM") => {}
			_ = rx.recv() => {
				info!("received explicit shutdown request");
			}
		};
	}

	async fn caught(kind: SignalKind, name: &'static str) {
		signal(kind)
			.expect("failed to register signal handler")
			.recv()
			.await;
		info!("received {name}, starting shutdown");
	}
}

#[cfg(not(unix))]
mod imp {
	use tokio::sync::mpsc::Receiver;
	use tracing::info;

	pub(super) async fn wait(rx: &mut Receiver<()>) {
		tokio::select! {
			_ = caught() => {}
			_ = rx.recv() => {
				info!("received explicit shutdown request");
			}
		};
	}

	async fn caught() {
		tokio::signal::windows::ctrl_c()
			.expect("failed to register signal handler")
			.recv()
			.await;
		info!("received ctrl-c, starting shutdown");
	}
}

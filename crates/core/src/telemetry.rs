use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::{EnvFilter, Targets, filter_fn};
use tracing_subscriber::prelude::*;

/// Event target reserved for per-connection access records. Events under this
/// target bypass stderr and land in the access log file when one is
/// configured.
pub const ACCESS_TARGET: &str = "access";

#[derive(Debug, Clone)]
pub struct AccessLogConfig {
	pub path: PathBuf,
	pub rotate_bytes: u64,
}

/// Installs the global tracing subscriber: human-readable diagnostics on
/// stderr (filtered by `RUST_LOG`, default `info`), and optionally an access
/// record layer writing through a non-blocking, size-rotated file appender.
///
/// The returned guard must be held for the lifetime of the process; dropping
/// it flushes and stops the appender worker.
pub fn setup_logging(access: Option<&AccessLogConfig>) -> anyhow::Result<Option<WorkerGuard>> {
	let stderr_layer = tracing_subscriber::fmt::layer()
		.with_writer(io::stderr)
		.with_filter(default_filter())
		.with_filter(filter_fn(|meta| meta.target() != ACCESS_TARGET));
	let registry = tracing_subscriber::registry().with(stderr_layer);

	match access {
		Some(cfg) => {
			let writer = RollingFileWriter::create(&cfg.path, cfg.rotate_bytes)
				.with_context(|| format!("failed to open access log {}", cfg.path.display()))?;
			let (non_blocking, guard) = tracing_appender::non_blocking(writer);
			let access_layer = tracing_subscriber::fmt::layer()
				.with_writer(non_blocking)
				.with_ansi(false)
				.with_target(false)
				.with_filter(Targets::new().with_target(ACCESS_TARGET, Level::INFO));
			registry.with(access_layer).init();
			Ok(Some(guard))
		},
		None => {
			registry.init();
			Ok(None)
		},
	}
}

fn default_filter() -> EnvFilter {
	EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// An append-only file writer that rotates once the live file would exceed a
/// byte limit. Rotation renames the live file to `<name>.1`, replacing any
/// previous rotation, so disk usage is bounded by roughly two limits.
pub struct RollingFileWriter {
	path: PathBuf,
	limit: u64,
	written: u64,
	file: File,
}

impl RollingFileWriter {
	pub fn create(path: &Path, limit: u64) -> io::Result<Self> {
		let file = Self::open(path)?;
		let written = file.metadata()?.len();
		Ok(RollingFileWriter {
			path: path.to_path_buf(),
			limit,
			written,
			file,
		})
	}

	fn open(path: &Path) -> io::Result<File> {
		OpenOptions::new().create(true).append(true).open(path)
	}

	fn rotate(&mut self) -> io::Result<()> {
		self.file.flush()?;
		let mut rotated = self.path.clone().into_os_string();
		rotated.push(".1");
		fs::rename(&self.path, &rotated)?;
		self.file = Self::open(&self.path)?;
		self.written = 0;
		Ok(())
	}
}

impl Write for RollingFileWriter {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		if self.written > 0 && self.written + buf.len() as u64 > self.limit {
			self.rotate()?;
		}
		let n = self.file.write(buf)?;
		self.written += n as u64;
		Ok(n)
	}

	fn flush(&mut self) -> io::Result<()> {
		self.file.flush()
	}
}

#[cfg(test)]
mod tests {
	use std::io::Write;

	use super::RollingFileWriter;

	#[test]
	fn rotates_at_size_limit() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("access.log");
		let mut w = RollingFileWriter::create(&path, 32).unwrap();

		w.write_all(b"0123456789abcdef0123456789abcdef").unwrap();
		w.write_all(b"next line").unwrap();
		w.flush().unwrap();

		let rotated = dir.path().join("access.log.1");
		assert_eq!(std::fs::read(&rotated).unwrap().len(), 32);
		assert_eq!(std::fs::read(&path).unwrap(), b"next line");
	}

	#[test]
	fn reopens_existing_file_preserving_size() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("access.log");
		std::fs::write(&path, b"existing").unwrap();

		let mut w = RollingFileWriter::create(&path, 1024).unwrap();
		w.write_all(b" more").unwrap();
		w.flush().unwrap();
		assert_eq!(std::fs::read(&path).unwrap(), b"existing more");
	}
}

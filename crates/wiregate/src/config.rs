use std::collections::HashSet;
use std::num::NonZeroU64;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use wiregate_core::telemetry::AccessLogConfig;

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

pub const DEFAULT_CONFIG_FILE: &str = "proxy_config.toml";

/// The on-disk settings, one `[proxy]` table. Every key is optional in the
/// file and falls back to its default individually; validation, by contrast,
/// is all-or-nothing (see [`load_or_create`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
	pub max_connections: u64,
	pub timeout_milliseconds: u64,
	pub host: String,
	pub port: u16,
	pub log_on: bool,
	pub log_file_name: String,
	pub log_file_size_bytes: u64,
	pub max_bandwidth_per_sec: u64,
	pub blacklist_on: bool,
	pub blacklisted_hosts_file_name: String,
}

impl Default for Settings {
	fn default() -> Self {
		Settings {
			max_connections: 256,
			timeout_milliseconds: 10_000,
			host: "0.0.0.0".to_string(),
			port: 12345,
			log_on: false,
			log_file_name: "proxy.log".to_string(),
			log_file_size_bytes: 16 * 1024 * 1024,
			max_bandwidth_per_sec: 2 * 1024 * 1024,
			blacklist_on: false,
			blacklisted_hosts_file_name: "blacklisted_hosts.toml".to_string(),
		}
	}
}

impl Settings {
	fn validate(&self) -> Result<(), String> {
		if self.max_connections < 1 {
			return Err("max_connections must be at least 1".to_string());
		}
		if self.timeout_milliseconds < 1 || self.timeout_milliseconds > 600_000 {
			return Err("timeout_milliseconds must be in range 1-600000".to_string());
		}
		if self.host.is_empty() {
			return Err("host cannot be empty".to_string());
		}
		if self.port == 0 {
			return Err("port must be greater than 0".to_string());
		}
		if self.log_file_name.is_empty() {
			return Err("log_file_name cannot be empty".to_string());
		}
		if self.log_file_size_bytes < 1 {
			return Err("log_file_size_bytes must be at least 1".to_string());
		}
		if self.max_bandwidth_per_sec < 1 {
			return Err("max_bandwidth_per_sec must be at least 1".to_string());
		}
		Ok(())
	}

	/// Where access records go, when tracing is enabled at all.
	pub fn access_log(&self) -> Option<AccessLogConfig> {
		self.log_on.then(|| AccessLogConfig {
			path: PathBuf::from(&self.log_file_name),
			rotate_bytes: self.log_file_size_bytes,
		})
	}
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SettingsFile {
	#[serde(default)]
	proxy: Option<Settings>,
}

/// Settings plus the messages produced while loading them. The caller
/// replays the messages once logging is up; loading necessarily happens
/// before the subscriber exists because the log destination is itself a
/// setting.
pub struct Loaded {
	pub settings: Settings,
	pub warnings: Vec<String>,
}

/// Reads the configuration, creating the file with defaults when it does not
/// exist. Never fails: a missing, unreadable, unparsable or invalid file
/// degrades to the default settings with a warning.
pub fn load_or_create(path: &Path) -> Loaded {
	let mut warnings = Vec::new();
	let settings = match std::fs::read_to_string(path) {
		Ok(contents) => match toml::from_str::<SettingsFile>(&contents) {
			Ok(file) => {
				let settings = file.proxy.unwrap_or_default();
				match settings.validate() {
					Ok(()) => settings,
					Err(reason) => {
						warnings.push(format!(
							"invalid configuration in {}: {reason}; using defaults",
							path.display()
						));
						Settings::default()
					},
				}
			},
			Err(e) => {
				warnings.push(format!(
					"failed to parse {}: {e}; using defaults",
					path.display()
				));
				Settings::default()
			},
		},
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
			let defaults = Settings::default();
			match write_default(path, &defaults) {
				Ok(()) => warnings.push(format!(
					"configuration file not found, created {} with defaults",
					path.display()
				)),
				Err(e) => warnings.push(format!(
					"configuration file not found and could not create {}: {e}",
					path.display()
				)),
			}
			defaults
		},
		Err(e) => {
			warnings.push(format!(
				"could not read {}: {e}; using defaults",
				path.display()
			));
			Settings::default()
		},
	};
	Loaded { settings, warnings }
}

fn write_default(path: &Path, defaults: &Settings) -> anyhow::Result<()> {
	let rendered = toml::to_string_pretty(&SettingsFile {
		proxy: Some(defaults.clone()),
	})?;
	std::fs::write(path, rendered)?;
	Ok(())
}

#[derive(Debug, Default, Deserialize)]
struct BlacklistFile {
	#[serde(default)]
	blacklisted_hosts: Vec<String>,
}

fn load_blacklist(path: &Path) -> HashSet<String> {
	let contents = match std::fs::read_to_string(path) {
		Ok(contents) => contents,
		Err(e) => {
			warn!("could not read blacklist {}: {e}", path.display());
			return HashSet::new();
		},
	};
	match toml::from_str::<BlacklistFile>(&contents) {
		Ok(file) => {
			let hosts: HashSet<String> = file.blacklisted_hosts.into_iter().collect();
			info!(hosts = hosts.len(), "loaded blacklist from {}", path.display());
			hosts
		},
		Err(e) => {
			warn!("failed to parse blacklist {}: {e}", path.display());
			HashSet::new()
		},
	}
}

/// The validated runtime view of [`Settings`], with the blacklist resolved
/// and durations/rates in their proper types. Immutable once built.
#[derive(Debug)]
pub struct Config {
	pub bind_addr: String,
	pub max_connections: u64,
	pub idle_timeout: Duration,
	pub bandwidth_per_sec: NonZeroU64,
	pub blacklist: HashSet<String>,
}

impl Config {
	pub fn from_settings(settings: Settings) -> anyhow::Result<Config> {
		let bandwidth_per_sec = NonZeroU64::new(settings.max_bandwidth_per_sec)
			.context("max_bandwidth_per_sec must be at least 1")?;
		let blacklist = if settings.blacklist_on {
			load_blacklist(Path::new(&settings.blacklisted_hosts_file_name))
		} else {
			HashSet::new()
		};
		Ok(Config {
			bind_addr: crate::transport::stream::authority(
				&settings.host,
				&settings.port.to_string(),
			),
			max_connections: settings.max_connections,
			idle_timeout: Duration::from_millis(settings.timeout_milliseconds),
			bandwidth_per_sec,
			blacklist,
		})
	}
}

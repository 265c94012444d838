use std::collections::HashMap;
use std::num::NonZeroU64;
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use super::{ConnectionGauge, Limiter};

/// Maps client IPs to their shared limiter. Shaping is per source IP, not per
/// session: every session from one IP draws on the same bucket, so opening
/// more connections does not multiply the budget.
///
/// Entries hold weak references. Sessions own the strong handles, and once the
/// last session from an IP ends its limiter is freed; the stale map entry is
/// replaced on the next lookup for that IP. Memory therefore stays bounded by
/// the set of currently-active client IPs without any eviction pass.
pub struct LimiterRegistry {
	rate: NonZeroU64,
	gauge: Arc<ConnectionGauge>,
	users: Mutex<HashMap<String, Weak<Limiter>>>,
}

impl LimiterRegistry {
	pub fn new(rate_bytes_per_sec: NonZeroU64) -> Self {
		LimiterRegistry {
			rate: rate_bytes_per_sec,
			gauge: Default::default(),
			users: Mutex::new(HashMap::new()),
		}
	}

	/// Returns the live limiter for `ip`, creating one if the IP is new or its
	/// previous limiter has been dropped. Concurrent callers with the same IP
	/// always observe the same live limiter.
	pub fn get_or_create(&self, ip: &str) -> Arc<Limiter> {
		let mut users = self.users.lock().unwrap();
		if let Some(existing) = users.get(ip).and_then(Weak::upgrade) {
			return existing;
		}
		let limiter = Arc::new(Limiter::new(self.rate, self.gauge.clone()));
		users.insert(ip.to_string(), Arc::downgrade(&limiter));
		debug!(ip, active = self.gauge.active(), "created client limiter");
		limiter
	}

	pub fn active_clients(&self) -> usize {
		self.gauge.active()
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::*;

	fn registry(rate: u64) -> LimiterRegistry {
		LimiterRegistry::new(rate.try_into().unwrap())
	}

	#[test]
	fn same_ip_shares_one_limiter() {
		let r = registry(1000);
		let a = r.get_or_create("10.0.0.1");
		let b = r.get_or_create("10.0.0.1");
		assert!(Arc::ptr_eq(&a, &b));
		assert_eq!(r.active_clients(), 1);
	}

	#[test]
	fn distinct_ips_get_distinct_limiters() {
		let r = registry(1000);
		let a = r.get_or_create("10.0.0.1");
		let b = r.get_or_create("10.0.0.2");
		assert!(!Arc::ptr_eq(&a, &b));
		assert_eq!(r.active_clients(), 2);
	}

	#[test]
	fn dead_entry_is_replaced_with_a_fresh_bucket() {
		let r = registry(1000);
		let a = r.get_or_create("10.0.0.1");
		assert_eq!(a.acquire(usize::MAX), 1500);
		drop(a);
		assert_eq!(r.active_clients(), 0);

		// The map entry is stale now; the next lookup must mint a new limiter
		// with a full burst allowance.
		let b = r.get_or_create("10.0.0.1");
		assert_eq!(b.acquire(usize::MAX), 1500);
	}

	#[test]
	fn concurrent_lookups_converge_on_one_limiter() {
		let r = Arc::new(registry(1000));
		let handles: Vec<_> = (0..8)
			.map(|_| {
				let r = Arc::clone(&r);
				std::thread::spawn(move || r.get_or_create("172.16.0.9"))
			})
			.collect();
		let limiters: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
		assert!(limiters.iter().all(|l| Arc::ptr_eq(l, &limiters[0])));
		assert_eq!(r.active_clients(), 1);
	}
}

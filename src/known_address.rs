//! Bookkeeping for a single known address.

use std::time::{Duration, SystemTime};

use crate::net_address::NetAddress;
use crate::time::TimeExt;

/// Days without a fresh announcement before an address is assumed vanished.
const NUM_MISSING_DAYS: u32 = 14;

/// Attempts without a single success before an address is assumed bad.
const NUM_RETRIES: u32 = 5;

/// Maximum failures accepted without a success before an address is bad.
const MAX_FAILURES: u32 = 15;

/// Days since the last success before an address may be evicted.
const MIN_BAD_DAYS: u32 = 7;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// An address known to the manager, together with everything observed
/// about it so far.
#[derive(Debug, Clone)]
pub struct KnownAddress {
	pub(crate) na: NetAddress,
	pub(crate) src_addr: NetAddress,
	pub(crate) attempts: u32,
	pub(crate) last_attempt: Option<SystemTime>,
	pub(crate) last_success: Option<SystemTime>,
	/// Number of new buckets currently referencing this record.
	pub(crate) refs: u32,
	/// Whether the record lives in the tried tier.
	pub(crate) tried: bool,
}

impl KnownAddress {
	pub(crate) fn new(na: NetAddress, src_addr: NetAddress) -> KnownAddress {
		KnownAddress {
			na: na,
			src_addr: src_addr,
			attempts: 0,
			last_attempt: None,
			last_success: None,
			refs: 0,
			tried: false,
		}
	}

	/// The address itself.
	pub fn net_address(&self) -> &NetAddress {
		&self.na
	}

	/// The address of the peer that first told us about this one.
	pub fn source(&self) -> &NetAddress {
		&self.src_addr
	}

	/// When we last tried dialling this address, if ever.
	pub fn last_attempt(&self) -> Option<SystemTime> {
		self.last_attempt
	}

	/// When we last completed a handshake with this address, if ever.
	pub fn last_success(&self) -> Option<SystemTime> {
		self.last_success
	}

	/// Connection attempts since the last success.
	pub fn attempts(&self) -> u32 {
		self.attempts
	}

	/// Whether the address exceeded its retry budget or went stale.
	pub(crate) fn is_bad(&self) -> bool {
		let now = SystemTime::now();

		if self.last_success.is_none() && self.attempts >= NUM_RETRIES {
			return true;
		}
		if now.saturating_duration_since(self.na.timestamp) > DAY * NUM_MISSING_DAYS {
			return true;
		}
		match self.last_success {
			Some(t) => {
				now.saturating_duration_since(t) > DAY * MIN_BAD_DAYS && self.attempts >= MAX_FAILURES
			}
			None => false,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::net::{IpAddr, Ipv4Addr};
	use bitcoin::network::constants::ServiceFlags;

	fn fresh() -> KnownAddress {
		let na = NetAddress::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), 8333, ServiceFlags::NONE);
		KnownAddress::new(na.clone(), na)
	}

	#[test]
	fn fresh_address_is_not_bad() {
		assert!(!fresh().is_bad());
	}

	#[test]
	fn retries_without_success_are_bad() {
		let mut ka = fresh();
		ka.attempts = NUM_RETRIES - 1;
		assert!(!ka.is_bad());
		ka.attempts = NUM_RETRIES;
		assert!(ka.is_bad());
	}

	#[test]
	fn stale_announcement_is_bad() {
		let mut ka = fresh();
		ka.na.timestamp = SystemTime::now() - DAY * (NUM_MISSING_DAYS + 1);
		assert!(ka.is_bad());
	}

	#[test]
	fn old_success_with_many_failures_is_bad() {
		let mut ka = fresh();
		ka.last_success = Some(SystemTime::now() - DAY * (MIN_BAD_DAYS + 1));
		ka.attempts = MAX_FAILURES - 1;
		assert!(!ka.is_bad());
		ka.attempts = MAX_FAILURES;
		assert!(ka.is_bad());
	}

	#[test]
	fn recent_success_shields_failures() {
		let mut ka = fresh();
		ka.last_success = Some(SystemTime::now());
		ka.attempts = MAX_FAILURES + 10;
		assert!(!ka.is_bad());
	}
}

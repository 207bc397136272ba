//! Address classification.
//!
//! The manager itself is agnostic about what makes an address dialable or
//! which addresses count as "close" to each other; both decisions are
//! injected through the [AddrPolicy] trait. [DefaultPolicy] implements the
//! usual rules for the public internet.

use std::net;

use crate::net_address::NetAddress;

/// Classifies addresses for routability and diversification grouping.
pub trait AddrPolicy: Send + Sync {
	/// Whether the node is willing to dial this address at all.
	fn is_routable(&self, na: &NetAddress) -> bool;

	/// The coarse equivalence class the address belongs to.
	///
	/// Addresses sharing a group are considered close; the manager spreads
	/// groups over its buckets so no single network range can dominate.
	fn group_key(&self, na: &NetAddress) -> String;
}

/// The default routability and grouping rules.
///
/// IPv4 addresses group by their /16 range and IPv6 addresses by their /32.
pub struct DefaultPolicy;

impl AddrPolicy for DefaultPolicy {
	fn is_routable(&self, na: &NetAddress) -> bool {
		is_routable(na.ip)
	}

	fn group_key(&self, na: &NetAddress) -> String {
		if !self.is_routable(na) {
			return "unroutable".to_owned();
		}
		match na.ip {
			net::IpAddr::V4(ip) => {
				let octets = ip.octets();
				format!("{}.{}", octets[0], octets[1])
			}
			net::IpAddr::V6(ip) => {
				let segments = ip.segments();
				format!("{:x}:{:x}", segments[0], segments[1])
			}
		}
	}
}

/// Oracle that knows which remote addresses are reachable from one of our
/// local interfaces.
///
/// The manager periodically asks the oracle to [refresh](LocalAddrs::refresh)
/// itself and consults it when picking dial candidates. An oracle that cannot
/// obtain interface information (OS permissions, sandboxing) should report
/// itself as not working, in which case the manager assumes everything is
/// reachable.
pub trait LocalAddrs: Send + Sync {
	/// Whether `addr` is reachable from one of our local addresses.
	fn reachable(&self, addr: &NetAddress) -> bool;

	/// Whether the oracle has usable interface information.
	fn is_working(&self) -> bool;

	/// Re-scan the local interfaces.
	fn refresh(&self);
}

/// A [LocalAddrs] oracle without any interface information.
///
/// It reports itself as not working, so every address passes the
/// reachability filter.
pub struct AssumeReachable;

impl LocalAddrs for AssumeReachable {
	fn reachable(&self, _addr: &NetAddress) -> bool {
		true
	}

	fn is_working(&self) -> bool {
		false
	}

	fn refresh(&self) {}
}

/// Check whether an IP address is globally routable.
pub fn is_routable(addr: net::IpAddr) -> bool {
	match addr {
		net::IpAddr::V4(addr) => ipv4_is_routable(addr),
		net::IpAddr::V6(addr) => ipv6_is_routable(addr),
	}
}

/// Check whether an IP address is locally routable.
pub fn is_local(addr: net::IpAddr) -> bool {
	match addr {
		net::IpAddr::V4(addr) => {
			addr.is_private() || addr.is_loopback() || addr.is_link_local() || addr.is_unspecified()
		}
		net::IpAddr::V6(_) => false,
	}
}

/// Check whether an IPv4 address is globally routable.
///
/// This code is adapted from the Rust standard library's `net::Ipv4Addr::is_global`. It can be
/// replaced once that function is stabilized.
fn ipv4_is_routable(addr: net::Ipv4Addr) -> bool {
	// Check if this address is 192.0.0.9 or 192.0.0.10. These addresses are the only two
	// globally routable addresses in the 192.0.0.0/24 range.
	if u32::from(addr) == 0xc0000009 || u32::from(addr) == 0xc000000a {
		return true;
	}
	!addr.is_private()
		&& !addr.is_loopback()
		&& !addr.is_link_local()
		&& !addr.is_broadcast()
		&& !addr.is_documentation()
		// Make sure the address is not in 0.0.0.0/8.
		&& addr.octets()[0] != 0
}

/// Check whether an IPv6 address is globally routable.
///
/// For now, this always returns `true`, as IPv6 addresses
/// are not fully supported.
fn ipv6_is_routable(_addr: net::Ipv6Addr) -> bool {
	true
}

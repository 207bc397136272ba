//! Network endpoint identification.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::SystemTime;

use bitcoin::network::constants::ServiceFlags;

use crate::error::Error;

/// A network endpoint a peer can be dialled at.
///
/// Inside the manager these are treated as immutable: an update replaces the
/// whole value rather than mutating it in place, so handed-out copies never
/// change under the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetAddress {
	/// The last time the address was announced to us.
	pub timestamp: SystemTime,
	/// Services advertised for this endpoint.
	pub services: ServiceFlags,
	/// The IP address.
	pub ip: IpAddr,
	/// The TCP port.
	pub port: u16,
}

impl NetAddress {
	/// Create a new address announced right now.
	pub fn new(ip: IpAddr, port: u16, services: ServiceFlags) -> NetAddress {
		NetAddress {
			timestamp: SystemTime::now(),
			services: services,
			ip: ip,
			port: port,
		}
	}

	/// Create a new address from a socket address.
	pub fn from_socket_addr(addr: SocketAddr, services: ServiceFlags) -> NetAddress {
		NetAddress::new(addr.ip(), addr.port(), services)
	}

	/// The socket address of this endpoint.
	pub fn socket_addr(&self) -> SocketAddr {
		SocketAddr::new(self.ip, self.port)
	}

	/// The canonical `host:port` string for this endpoint.
	///
	/// Distinct (IP, port) pairs always yield distinct keys; this is what the
	/// manager indexes by.
	pub fn key(&self) -> String {
		self.socket_addr().to_string()
	}
}

impl fmt::Display for NetAddress {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", self.socket_addr())
	}
}

/// Split a `host:port` string, handling bracketed IPv6 literals.
pub(crate) fn split_host_port(addr: &str) -> Result<(&str, u16), Error> {
	let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
		let end = rest.find(']').ok_or_else(|| Error::InvalidAddress(addr.to_owned()))?;
		let port = rest[end + 1..]
			.strip_prefix(':')
			.ok_or_else(|| Error::InvalidAddress(addr.to_owned()))?;
		(&rest[..end], port)
	} else {
		let (host, port) = addr.rsplit_once(':').ok_or_else(|| Error::InvalidAddress(addr.to_owned()))?;
		// A bare IPv6 literal with a port is ambiguous; require brackets.
		if host.contains(':') {
			return Err(Error::InvalidAddress(addr.to_owned()));
		}
		(host, port)
	};

	let port = port.parse::<u16>().map_err(|_| Error::InvalidPort(port.to_owned()))?;
	Ok((host, port))
}

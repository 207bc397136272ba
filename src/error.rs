
use std::{fmt, io};

#[derive(Debug)]
pub enum Error {
	/// A host:port string that could not be split into host and port.
	InvalidAddress(String),
	/// A port number that could not be parsed or is out of range.
	InvalidPort(String),
	/// DNS lookup yielded no usable IP address for the host.
	HostNotFound(String),
	/// The peers file failed to parse or failed the post-load sanity checks.
	PeersFileCorrupt(String),
	/// An I/O error.
	Io(io::Error),
}

impl From<io::Error> for Error {
	fn from(e: io::Error) -> Error {
		Error::Io(e)
	}
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match *self {
			Error::InvalidAddress(ref s) => write!(f, "invalid address: {}", s),
			Error::InvalidPort(ref s) => write!(f, "invalid port: {}", s),
			Error::HostNotFound(ref s) => write!(f, "no addresses found for {}", s),
			Error::PeersFileCorrupt(ref s) => write!(f, "peers file corrupt: {}", s),
			Error::Io(ref e) => write!(f, "I/O error: {}", e),
		}
	}
}
impl std::error::Error for Error {}

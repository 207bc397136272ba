//! On-disk mirror of the address table.
//!
//! The format is plain self-describing JSON: unknown fields are ignored on
//! load, and only a file declaring a version newer than ours is rejected.
//! Bucket membership is stored as arrays of address keys; the `tried` flag
//! and reference counts are reconstructed from context.

use std::fs;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::time::TimeExt;

/// The current version of the on-disk format.
pub(crate) const SERIALISATION_VERSION: u32 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SerializedKnownAddress {
	#[serde(rename = "Addr")]
	pub addr: String,
	#[serde(rename = "Src")]
	pub src: String,
	#[serde(rename = "Attempts")]
	pub attempts: u32,
	#[serde(rename = "TimeStamp")]
	pub time_stamp: i64,
	#[serde(rename = "LastAttempt")]
	pub last_attempt: i64,
	#[serde(rename = "LastSuccess")]
	pub last_success: i64,
	// Absent in version 1 files; those get a default on load.
	#[serde(rename = "Services", default)]
	pub services: u64,
	#[serde(rename = "SrcServices", default)]
	pub src_services: u64,
	// No refcount or tried flag; those follow from bucket membership.
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SerializedAddrManager {
	#[serde(rename = "Version")]
	pub version: u32,
	#[serde(rename = "Key")]
	pub key: [u8; 32],
	#[serde(rename = "Addresses")]
	pub addresses: Vec<SerializedKnownAddress>,
	#[serde(rename = "NewBuckets")]
	pub new_buckets: Vec<Vec<String>>,
	#[serde(rename = "TriedBuckets")]
	pub tried_buckets: Vec<Vec<String>>,
}

/// Write the snapshot out to `path`, replacing whatever was there.
pub(crate) fn write_peers_file(path: &Path, sam: &SerializedAddrManager) -> Result<(), Error> {
	let file = fs::File::create(path)?;
	let mut writer = BufWriter::new(file);
	serde_json::to_writer(&mut writer, sam).map_err(io::Error::from)?;
	writer.flush()?;
	Ok(())
}

/// Read a snapshot back from `path`.
///
/// A missing file is not an error; it simply means a fresh start.
pub(crate) fn read_peers_file(path: &Path) -> Result<Option<SerializedAddrManager>, Error> {
	let file = match fs::File::open(path) {
		Ok(f) => f,
		Err(ref e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
		Err(e) => return Err(Error::Io(e)),
	};

	let sam: SerializedAddrManager = serde_json::from_reader(BufReader::new(file))
		.map_err(|e| Error::PeersFileCorrupt(format!("{}", e)))?;

	// Decoding is backwards compatible since unknown fields are skipped, so
	// only a version from the future is fatal.
	if sam.version > SERIALISATION_VERSION {
		return Err(Error::PeersFileCorrupt(format!("unknown version {}", sam.version)));
	}

	Ok(Some(sam))
}

/// Map an optional timestamp to Unix seconds, zero meaning never.
pub(crate) fn unix_opt(t: Option<SystemTime>) -> i64 {
	t.map(|t| t.unix_secs()).unwrap_or(0)
}

/// Map Unix seconds back to an optional timestamp, zero meaning never.
pub(crate) fn opt_unix(secs: i64) -> Option<SystemTime> {
	if secs > 0 {
		Some(SystemTime::from_unix_secs(secs))
	} else {
		None
	}
}

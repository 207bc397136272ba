//! Deterministic bucket assignment.
//!
//! Bucket indices are derived from a double-SHA256 over the per-instance
//! secret key and the group keys involved, so a single source cannot choose
//! which buckets its gossip lands in, yet assignments stay stable for the
//! lifetime of the key.

use bitcoin::hashes::{sha256d, Hash, HashEngine};

/// The number of buckets that new addresses are spread over.
pub(crate) const NEW_BUCKET_COUNT: usize = 1024;

/// The maximum number of addresses in each new bucket.
pub(crate) const NEW_BUCKET_SIZE: usize = 64;

/// The number of buckets that tried addresses are spread over.
pub(crate) const TRIED_BUCKET_COUNT: usize = 64;

/// The maximum number of addresses in each tried bucket.
pub(crate) const TRIED_BUCKET_SIZE: usize = 256;

/// The number of new buckets over which a single source group is spread.
const NEW_BUCKETS_PER_GROUP: u64 = 64;

/// The number of tried buckets over which an address group is spread.
const TRIED_BUCKETS_PER_GROUP: u64 = 8;

/// The number of buckets a frequently seen new address may end up in.
pub(crate) const NEW_BUCKETS_PER_ADDRESS: u32 = 8;

/// Double-SHA256 the concatenation of `parts`, truncated to the first
/// 8 bytes interpreted little-endian.
fn hash_u64(parts: &[&[u8]]) -> u64 {
	let mut engine = sha256d::Hash::engine();
	for part in parts {
		engine.input(part);
	}
	let hash = sha256d::Hash::from_engine(engine).into_inner();
	let mut buf = [0u8; 8];
	buf.copy_from_slice(&hash[..8]);
	u64::from_le_bytes(buf)
}

/// The new-tier bucket for an address heard from a given source.
///
/// A source group maps to at most [NEW_BUCKETS_PER_GROUP] distinct buckets,
/// so a single source flooding us with addresses can only ever touch a small
/// slice of the table.
pub(crate) fn new_bucket(key: &[u8; 32], dest_group: &str, src_group: &str) -> usize {
	let spread = hash_u64(&[key, dest_group.as_bytes(), src_group.as_bytes()])
		% NEW_BUCKETS_PER_GROUP;
	let hash = hash_u64(&[key, src_group.as_bytes(), &spread.to_le_bytes()]);
	(hash % NEW_BUCKET_COUNT as u64) as usize
}

/// The tried-tier bucket for a successfully contacted address.
pub(crate) fn tried_bucket(key: &[u8; 32], addr_key: &str, dest_group: &str) -> usize {
	let spread = hash_u64(&[key, addr_key.as_bytes()]) % TRIED_BUCKETS_PER_GROUP;
	let hash = hash_u64(&[key, dest_group.as_bytes(), &spread.to_le_bytes()]);
	(hash % TRIED_BUCKET_COUNT as u64) as usize
}

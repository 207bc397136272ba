//! Peer-to-peer address manager.
//!
//! A concurrency-safe, in-memory cache of peer addresses heard from the
//! network, mirrored to disk, for picking outbound connection candidates.
//!
//! Addresses live in two tiers: *new* holds gossip we never verified, spread
//! over 1024 buckets, and *tried* holds addresses we completed a handshake
//! with, spread over 64 buckets. Bucket assignment is keyed by a secret
//! drawn at construction, so no gossip source gets to choose where its
//! addresses land, and per-source spreading is bounded to frustrate table
//! pollution.

#[macro_use]
extern crate log;

mod bucket;
mod error;
mod known_address;
mod manager;
mod net_address;
mod peers_file;
mod policy;
mod time;

pub use crate::error::Error;
pub use crate::known_address::KnownAddress;
pub use crate::manager::{AddrManager, Config, LookupFn, PEERS_FILENAME};
pub use crate::net_address::NetAddress;
pub use crate::policy::{is_local, is_routable, AddrPolicy, AssumeReachable, DefaultPolicy, LocalAddrs};

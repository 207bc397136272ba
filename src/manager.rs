//!
//! The peer-to-peer address manager.
//!

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::thread;
use std::time::{Duration, SystemTime};

use bitcoin::network::constants::ServiceFlags;
use crossbeam_channel as chan;
use parking_lot::{Mutex, MutexGuard};
use rand::RngCore;

use crate::bucket;
use crate::error::Error;
use crate::known_address::KnownAddress;
use crate::net_address::{self, NetAddress};
use crate::peers_file::{self, SerializedAddrManager, SerializedKnownAddress};
use crate::policy::{AddrPolicy, AssumeReachable, DefaultPolicy, LocalAddrs};
use crate::time::TimeExt;

/// The most addresses we will hand out from one call to
/// [AddrManager::addresses_to_share].
const GET_ADDR_MAX: usize = 5000;

/// Share everything when fewer than this many addresses qualify.
const GET_ADDR_MIN: usize = 20;

/// The percentage of qualifying addresses shared per call.
const GET_ADDR_PERCENT: usize = 23;

/// How long a dialled address is quarantined from being handed out again.
const RETRY_TIMEOUT: Duration = Duration::from_secs(60);

/// Announcements older than this refresh a connected address's timestamp.
const CONNECTED_REFRESH: Duration = Duration::from_secs(20 * 60);

/// The file the address table is mirrored into, under the data directory.
pub const PEERS_FILENAME: &str = "peers.json";

/// Function used to resolve host names into IP addresses.
pub type LookupFn = Box<dyn Fn(&str) -> Result<Vec<IpAddr>, Error> + Send + Sync>;

/// Address manager configuration.
#[derive(Clone, Debug)]
pub struct Config {
	/// The directory the peers file is kept in.
	///
	/// Default value: the current directory.
	pub data_dir: PathBuf,

	/// Interval at which to mirror the address table to disk.
	///
	/// Default value: 2 minutes.
	pub dump_interval: Duration,

	/// Interval at which to refresh the local-address oracle.
	///
	/// Default value: 30 seconds.
	pub local_addrs_interval: Duration,

	/// The number of addresses under which [AddrManager::need_more_addresses]
	/// reports that more are wanted.
	///
	/// Default value: 3000.
	pub need_address_threshold: usize,

	/// Service bits that mark a gossip source as trusted.
	///
	/// Addresses heard from a trusted source may be handed out before we
	/// ever connected to them ourselves.
	///
	/// Default value: bit 62.
	pub trusted_services: ServiceFlags,
}

impl Default for Config {
	fn default() -> Config {
		Config {
			data_dir: PathBuf::from("."),
			dump_interval: Duration::from_secs(2 * 60),
			local_addrs_interval: Duration::from_secs(30),
			need_address_threshold: 3000,
			trusted_services: ServiceFlags::from(1 << 62),
		}
	}
}

/// Internal state, protected by the manager's mutex.
struct State {
	/// Secret key the bucket assignment is derived from.
	key: [u8; 32],
	rng: fastrand::Rng,
	/// Address key to record, for all addresses in either tier.
	index: HashMap<String, KnownAddress>,
	new_buckets: Vec<HashSet<String>>,
	tried_buckets: Vec<Vec<String>>,
	n_new: usize,
	n_tried: usize,
}

impl State {
	fn new() -> State {
		let mut state = State {
			key: [0; 32],
			rng: fastrand::Rng::new(),
			index: HashMap::new(),
			new_buckets: Vec::new(),
			tried_buckets: Vec::new(),
			n_new: 0,
			n_tried: 0,
		};
		state.reset();
		state
	}

	/// Wipe the table and draw a fresh hashing secret.
	fn reset(&mut self) {
		self.index = HashMap::new();
		self.new_buckets = (0..bucket::NEW_BUCKET_COUNT).map(|_| HashSet::new()).collect();
		self.tried_buckets = (0..bucket::TRIED_BUCKET_COUNT).map(|_| Vec::new()).collect();
		self.n_new = 0;
		self.n_tried = 0;
		// Failure to read OS entropy is unrecoverable; this panics.
		rand::rngs::OsRng.fill_bytes(&mut self.key);
	}

	fn num_addresses(&self) -> usize {
		self.n_new + self.n_tried
	}

	fn find(&self, addr: &NetAddress) -> Option<&KnownAddress> {
		self.index.get(&addr.key())
	}

	/// Remove `key` from the given new bucket, dropping the record from the
	/// table entirely when its last bucket reference goes away.
	fn drop_from_new_bucket(&mut self, bucket: usize, key: &str) {
		if !self.new_buckets[bucket].remove(key) {
			return;
		}
		let gone = match self.index.get_mut(key) {
			Some(ka) => {
				ka.refs -= 1;
				ka.refs == 0 && !ka.tried
			}
			None => false,
		};
		if gone {
			self.index.remove(key);
			self.n_new -= 1;
		}
	}

	/// Make room in a new bucket by dropping entries that exceeded their
	/// retry budget or went stale. When nothing qualified, the entry with
	/// the oldest timestamp is evicted instead.
	fn expire_new(&mut self, bucket: usize) {
		let keys: Vec<String> = self.new_buckets[bucket].iter().cloned().collect();
		let mut oldest: Option<(String, SystemTime)> = None;
		let mut expired = false;

		for key in keys {
			let (bad, timestamp) = match self.index.get(&key) {
				Some(ka) => (ka.is_bad(), ka.na.timestamp),
				None => continue,
			};
			if bad {
				trace!("expiring bad address {}", key);
				self.drop_from_new_bucket(bucket, &key);
				expired = true;
				continue;
			}
			match oldest {
				Some((_, best)) if timestamp >= best => {}
				_ => oldest = Some((key, timestamp)),
			}
		}

		if !expired {
			if let Some((key, _)) = oldest {
				trace!("expiring oldest address {}", key);
				self.drop_from_new_bucket(bucket, &key);
			}
		}
	}

	/// Pick the eviction victim in a tried bucket: the entry with the oldest
	/// timestamp.
	fn pick_tried(&self, bucket: usize) -> Option<usize> {
		let mut oldest: Option<(usize, SystemTime)> = None;
		for (slot, key) in self.tried_buckets[bucket].iter().enumerate() {
			let timestamp = match self.index.get(key) {
				Some(ka) => ka.na.timestamp,
				None => continue,
			};
			match oldest {
				Some((_, best)) if timestamp >= best => {}
				_ => oldest = Some((slot, timestamp)),
			}
		}
		oldest.map(|(slot, _)| slot)
	}
}

/// Concurrency-safe manager of candidate peer addresses.
///
/// Addresses heard from gossip go in through [add_address](Self::add_address)
/// and friends, dialling outcomes come back through
/// [connected](Self::connected) and [good](Self::good), and the dialler draws
/// candidates with [get_address](Self::get_address). The table is mirrored
/// to disk periodically between [start](Self::start) and [stop](Self::stop).
pub struct AddrManager {
	cfg: Config,
	peers_file: PathBuf,
	lookup: LookupFn,
	policy: Arc<dyn AddrPolicy>,
	local_addrs: Arc<dyn LocalAddrs>,
	state: Arc<Mutex<State>>,
	started: AtomicUsize,
	shutdown: AtomicUsize,
	quit_tx: Mutex<Option<chan::Sender<()>>>,
	quit_rx: chan::Receiver<()>,
	handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl AddrManager {
	/// Create a new address manager with the default address policy and
	/// local-address oracle.
	///
	/// Use [start](Self::start) to begin processing asynchronous updates.
	pub fn new(cfg: Config, lookup: LookupFn) -> AddrManager {
		AddrManager::with_parts(cfg, lookup, Arc::new(DefaultPolicy), Arc::new(AssumeReachable))
	}

	/// Create a new address manager with custom injected collaborators.
	pub fn with_parts(
		cfg: Config,
		lookup: LookupFn,
		policy: Arc<dyn AddrPolicy>,
		local_addrs: Arc<dyn LocalAddrs>,
	) -> AddrManager {
		let (quit_tx, quit_rx) = chan::unbounded();
		AddrManager {
			peers_file: cfg.data_dir.join(PEERS_FILENAME),
			cfg: cfg,
			lookup: lookup,
			policy: policy,
			local_addrs: local_addrs,
			state: Arc::new(Mutex::new(State::new())),
			started: AtomicUsize::new(0),
			shutdown: AtomicUsize::new(0),
			quit_tx: Mutex::new(Some(quit_tx)),
			quit_rx: quit_rx,
			handles: Mutex::new(Vec::new()),
		}
	}

	/// The configuration used for this manager.
	pub fn config(&self) -> &Config {
		&self.cfg
	}

	// Updating the table //////////////////////////////////////////////////////

	/// Add a new address heard from `src_addr`. Non-routable and duplicate
	/// addresses are silently ignored.
	pub fn add_address(&self, addr: &NetAddress, src_addr: &NetAddress) {
		let mut state = self.state.lock();
		self.update_address(&mut state, addr, src_addr);
	}

	/// Add multiple new addresses heard from `src_addr`. Non-routable and
	/// duplicate addresses are silently ignored.
	pub fn add_addresses(&self, addrs: &[NetAddress], src_addr: &NetAddress) {
		let mut state = self.state.lock();
		for addr in addrs {
			self.update_address(&mut state, addr, src_addr);
		}
	}

	/// Add an address given as an `ip:port` string, using itself as the
	/// source. Host names are not resolved here.
	pub fn add_address_by_ip(&self, addr_ip: &str) -> Result<(), Error> {
		let (host, port) = net_address::split_host_port(addr_ip)?;
		let ip: IpAddr = host.parse().map_err(|_| Error::InvalidAddress(host.to_owned()))?;
		let na = NetAddress::new(ip, port, ServiceFlags::NONE);
		self.add_address(&na, &na);
		Ok(())
	}

	/// Either update an address already known to the manager or add it to
	/// the table if not known yet.
	fn update_address(&self, state: &mut State, na: &NetAddress, src_addr: &NetAddress) {
		// Non-routable also covers invalid and local addresses.
		if !self.policy.is_routable(na) {
			return;
		}

		let addr_key = na.key();
		if let Some(ka) = state.index.get_mut(&addr_key) {
			// Records are immutable so that handed-out copies don't change
			// under the caller; a newer sighting replaces the whole value.
			if na.timestamp > ka.na.timestamp || !ka.na.services.has(na.services) {
				let mut updated = ka.na.clone();
				updated.timestamp = na.timestamp.max(ka.na.timestamp);
				updated.services.add(na.services);
				ka.na = updated;
			}

			// Already in tried, nothing further to do.
			if ka.tried {
				return;
			}

			// Already spread as widely as allowed?
			if ka.refs == bucket::NEW_BUCKETS_PER_ADDRESS {
				return;
			}

			// The more buckets an address is in, the less likely it is to
			// spread further; likelihood is 1 in 2*refs.
			let factor = 2 * ka.refs;
			if state.rng.u32(0..factor) != 0 {
				return;
			}
		} else {
			state.index.insert(addr_key.clone(), KnownAddress::new(na.clone(), src_addr.clone()));
			state.n_new += 1;
		}

		let dest_group = self.policy.group_key(na);
		let src_group = self.policy.group_key(src_addr);
		let new_bucket = bucket::new_bucket(&state.key, &dest_group, &src_group);

		// Already in this bucket?
		if state.new_buckets[new_bucket].contains(&addr_key) {
			return;
		}

		// Enforce the per-bucket maximum.
		if state.new_buckets[new_bucket].len() >= bucket::NEW_BUCKET_SIZE {
			trace!("new bucket {} is full, expiring old entries", new_bucket);
			state.expire_new(new_bucket);
		}

		state.new_buckets[new_bucket].insert(addr_key.clone());
		if let Some(ka) = state.index.get_mut(&addr_key) {
			ka.refs += 1;
		}

		trace!(
			"added new address {} for a total of {} addresses",
			addr_key,
			state.num_addresses(),
		);
	}

	/// Record that a connection to the address is currently up.
	///
	/// The address must already be known, else this is ignored.
	pub fn connected(&self, addr: &NetAddress) {
		let mut state = self.state.lock();
		if let Some(ka) = state.index.get_mut(&addr.key()) {
			let now = SystemTime::now();
			if now.saturating_duration_since(ka.na.timestamp) > CONNECTED_REFRESH {
				let mut updated = ka.na.clone();
				updated.timestamp = now;
				ka.na = updated;
			}
		}
	}

	/// Mark the address as good, to be called after a successful connection
	/// and handshake. Promotes the address into the tried tier, evicting an
	/// older entry back into the new tier when its bucket is full.
	///
	/// Addresses unknown to the manager are ignored.
	pub fn good(&self, addr: &NetAddress) {
		let mut guard = self.state.lock();
		let state = &mut *guard;
		let addr_key = addr.key();

		let ka = match state.index.get_mut(&addr_key) {
			Some(ka) => ka,
			None => return,
		};

		// The announce timestamp is deliberately left untouched so the
		// shared address list doesn't reveal which peers we are connected to.
		let now = SystemTime::now();
		ka.last_success = Some(now);
		ka.last_attempt = Some(now);
		ka.attempts = 0;

		if ka.tried {
			return;
		}

		let ka_na = ka.na.clone();

		// Remove it from every new bucket, remembering the first one.
		let mut old_bucket = None;
		for i in 0..state.new_buckets.len() {
			if state.new_buckets[i].remove(&addr_key) {
				if let Some(ka) = state.index.get_mut(&addr_key) {
					ka.refs -= 1;
				}
				if old_bucket.is_none() {
					old_bucket = Some(i);
				}
			}
		}

		let old_bucket = match old_bucket {
			Some(b) => b,
			None => {
				// A record that is neither tried nor in any new bucket
				// shouldn't exist; leave the counters alone.
				warn!("address {} marked good but absent from all new buckets", addr_key);
				return;
			}
		};
		state.n_new -= 1;

		let dest_group = self.policy.group_key(&ka_na);
		let tried = bucket::tried_bucket(&state.key, &addr_key, &dest_group);

		// Room in the target bucket?
		if state.tried_buckets[tried].len() < bucket::TRIED_BUCKET_SIZE {
			if let Some(ka) = state.index.get_mut(&addr_key) {
				ka.tried = true;
			}
			state.tried_buckets[tried].push(addr_key);
			state.n_tried += 1;
			return;
		}

		// No room; evict the oldest entry back into the new tier.
		let slot = match state.pick_tried(tried) {
			Some(slot) => slot,
			None => return,
		};
		let victim_key = state.tried_buckets[tried][slot].clone();
		let (victim_na, victim_src) = match state.index.get(&victim_key) {
			Some(victim) => (victim.na.clone(), victim.src_addr.clone()),
			None => {
				warn!("tried bucket {} references unknown address {}", tried, victim_key);
				return;
			}
		};

		// The first new bucket the victim would land in; if that one is
		// full, use the bucket the promoted address just left, which is
		// guaranteed to have room now.
		let victim_group = self.policy.group_key(&victim_na);
		let victim_src_group = self.policy.group_key(&victim_src);
		let mut new_bucket = bucket::new_bucket(&state.key, &victim_group, &victim_src_group);
		if state.new_buckets[new_bucket].len() >= bucket::NEW_BUCKET_SIZE {
			new_bucket = old_bucket;
		}

		// Swap the promoted record into the victim's slot.
		if let Some(ka) = state.index.get_mut(&addr_key) {
			ka.tried = true;
		}
		state.tried_buckets[tried][slot] = addr_key.clone();

		if let Some(victim) = state.index.get_mut(&victim_key) {
			victim.tried = false;
			victim.refs = 1;
		}
		state.new_buckets[new_bucket].insert(victim_key.clone());
		// One promoted in, one demoted out: the tried count is unchanged,
		// but the new tier got the victim back.
		state.n_new += 1;

		trace!("replaced {} with {} in tried bucket {}", victim_key, addr_key, tried);
	}

	/// Update the services advertised for a known address.
	pub fn set_services(&self, addr: &NetAddress, services: ServiceFlags) {
		let mut state = self.state.lock();
		if let Some(ka) = state.index.get_mut(&addr.key()) {
			if ka.na.services != services {
				let mut updated = ka.na.clone();
				updated.services = services;
				ka.na = updated;
			}
		}
	}

	// Queries /////////////////////////////////////////////////////////////////

	/// The number of addresses known to the manager.
	pub fn num_addresses(&self) -> usize {
		self.state.lock().num_addresses()
	}

	/// Whether the manager would like to hear about more addresses.
	pub fn need_more_addresses(&self) -> bool {
		self.state.lock().num_addresses() < self.cfg.need_address_threshold
	}

	/// When we last tried dialling the address, if it is known at all.
	pub fn get_last_attempt(&self, addr: &NetAddress) -> Option<SystemTime> {
		self.state.lock().find(addr).and_then(|ka| ka.last_attempt)
	}

	/// A random selection of the addresses we once connected to
	/// successfully, for sharing with other peers.
	pub fn addresses_to_share(&self) -> Vec<NetAddress> {
		let mut state = self.state.lock();
		let mut addrs: Vec<NetAddress> = state
			.index
			.values()
			.filter(|ka| ka.last_success.is_some())
			.map(|ka| ka.na.clone())
			.collect();

		let count = addrs.len();
		let share = GET_ADDR_MAX.min((count * GET_ADDR_PERCENT / 100).max(count.min(GET_ADDR_MIN)));

		// Partial Fisher-Yates shuffle; everything past `share` is dropped.
		for i in 0..share {
			let j = state.rng.usize(i..count);
			addrs.swap(i, j);
		}
		addrs.truncate(share);
		addrs
	}

	// Candidate selection /////////////////////////////////////////////////////

	/// Return a candidate address for an outbound dial attempt, picking a
	/// random one with preference for addresses that worked before and
	/// haven't been dialled recently.
	///
	/// `is_ok` is consulted for every candidate and is invoked with the
	/// table lock released; it must not call back into the manager. When a
	/// candidate is returned its attempt counters have been bumped already,
	/// since the caller is assumed to actually dial it.
	pub fn get_address(&self, mut is_ok: impl FnMut(&KnownAddress) -> bool) -> Option<KnownAddress> {
		let mut state = self.state.lock();

		if state.num_addresses() == 0 {
			info!("get_address: no addresses known at all");
			return None;
		}

		let mut found = None;
		// Strict mode only considers trusted or previously successful
		// addresses; when that turns up nothing we relax the filter.
		for relaxed in [false, true] {
			let tried_first = state.n_tried > 0 && (state.n_new == 0 || state.rng.bool());
			found = if tried_first {
				self.scan_tried(&mut state, relaxed, &mut is_ok)
					.or_else(|| self.scan_new(&mut state, relaxed, &mut is_ok))
			} else {
				self.scan_new(&mut state, relaxed, &mut is_ok)
					.or_else(|| self.scan_tried(&mut state, relaxed, &mut is_ok))
			};
			if found.is_some() {
				break;
			}
		}

		let key = match found {
			Some(key) => key,
			None => {
				info!("get_address: no qualifying addresses found");
				return None;
			}
		};

		if let Some(ka) = state.index.get_mut(&key) {
			// The predicate passed, so the caller is going to dial this.
			ka.attempts += 1;
			ka.last_attempt = Some(SystemTime::now());
			return Some(ka.clone());
		}
		None
	}

	/// Scan the tried tier for a usable address, starting at a random bucket
	/// and a random offset within each bucket.
	fn scan_tried(
		&self,
		state: &mut MutexGuard<'_, State>,
		relaxed: bool,
		is_ok: &mut dyn FnMut(&KnownAddress) -> bool,
	) -> Option<String> {
		let count = state.tried_buckets.len();
		let start = state.rng.usize(0..count);
		for m in start..start * 2 {
			let b = m % count;
			if state.tried_buckets[b].is_empty() {
				continue;
			}
			let entries = state.tried_buckets[b].clone();
			let offset = state.rng.usize(0..entries.len());
			for i in (offset..entries.len()).chain(0..offset) {
				if self.is_good_address(state, &entries[i], relaxed, is_ok) {
					return Some(entries[i].clone());
				}
			}
		}
		None
	}

	/// Scan the new tier for a usable address, starting at a random bucket
	/// and a random offset within each bucket.
	fn scan_new(
		&self,
		state: &mut MutexGuard<'_, State>,
		relaxed: bool,
		is_ok: &mut dyn FnMut(&KnownAddress) -> bool,
	) -> Option<String> {
		let count = state.new_buckets.len();
		let start = state.rng.usize(0..count);
		for m in start..start * 2 {
			let b = m % count;
			if state.new_buckets[b].is_empty() {
				continue;
			}
			let entries: Vec<String> = state.new_buckets[b].iter().cloned().collect();
			let offset = state.rng.usize(0..entries.len());
			for i in (offset..entries.len()).chain(0..offset) {
				if self.is_good_address(state, &entries[i], relaxed, is_ok) {
					return Some(entries[i].clone());
				}
			}
		}
		None
	}

	/// Whether a candidate qualifies for dialling right now.
	///
	/// The caller-supplied predicate runs with the table lock released, so
	/// the recent-attempt check is re-done afterwards to catch a concurrent
	/// picker grabbing the same address in the window.
	fn is_good_address(
		&self,
		state: &mut MutexGuard<'_, State>,
		key: &str,
		relaxed: bool,
		is_ok: &mut dyn FnMut(&KnownAddress) -> bool,
	) -> bool {
		let ka = match state.index.get(key) {
			Some(ka) => ka.clone(),
			None => return false,
		};

		// If the oracle can't tell us our local addresses (OS permissions),
		// we pretend everything is reachable.
		if !self.local_addrs.reachable(&ka.na) && self.local_addrs.is_working() {
			return false;
		}
		// Never hand out something that was dialled moments ago.
		if Self::attempted_recently(&ka) {
			return false;
		}
		if !relaxed && !self.is_trusted_source(&ka) && ka.last_success.is_none() {
			return false;
		}

		let ok = MutexGuard::unlocked(state, || is_ok(&ka));
		if !ok {
			return false;
		}

		// We had to unlock for the predicate; another picker may have raced
		// us to this address in the meantime.
		match state.index.get(key) {
			Some(ka) => !Self::attempted_recently(ka),
			None => false,
		}
	}

	fn attempted_recently(ka: &KnownAddress) -> bool {
		match ka.last_attempt {
			Some(t) => t.saturating_elapsed() < RETRY_TIMEOUT,
			None => false,
		}
	}

	fn is_trusted_source(&self, ka: &KnownAddress) -> bool {
		self.cfg.trusted_services != ServiceFlags::NONE
			&& ka.src_addr.services.has(self.cfg.trusted_services)
	}

	// Host resolution /////////////////////////////////////////////////////////

	/// Convert a host name or IP literal into a [NetAddress], resolving
	/// through the injected lookup function when needed.
	pub fn host_to_net_address(
		&self,
		host: &str,
		port: u16,
		services: ServiceFlags,
	) -> Result<NetAddress, Error> {
		let ip = match host.parse::<IpAddr>() {
			Ok(ip) => ip,
			Err(_) => {
				let ips = (self.lookup)(host)?;
				match ips.first() {
					Some(ip) => *ip,
					None => return Err(Error::HostNotFound(host.to_owned())),
				}
			}
		};
		Ok(NetAddress::new(ip, port, services))
	}

	/// Parse a `host:port` string into a [NetAddress], resolving the host
	/// if it is not an IP literal.
	pub fn deserialize_net_address(
		&self,
		addr: &str,
		services: ServiceFlags,
	) -> Result<NetAddress, Error> {
		let (host, port) = net_address::split_host_port(addr)?;
		self.host_to_net_address(host, port, services)
	}

	// Persistence /////////////////////////////////////////////////////////////

	/// Build the serialisable snapshot of the current state.
	fn serialize(state: &State) -> SerializedAddrManager {
		let mut addresses = Vec::with_capacity(state.index.len());
		for (key, ka) in &state.index {
			addresses.push(SerializedKnownAddress {
				addr: key.clone(),
				src: ka.src_addr.key(),
				attempts: ka.attempts,
				time_stamp: ka.na.timestamp.unix_secs(),
				last_attempt: peers_file::unix_opt(ka.last_attempt),
				last_success: peers_file::unix_opt(ka.last_success),
				services: u64::from(ka.na.services),
				src_services: u64::from(ka.src_addr.services),
			});
		}
		SerializedAddrManager {
			version: peers_file::SERIALISATION_VERSION,
			key: state.key,
			addresses: addresses,
			new_buckets: state.new_buckets.iter().map(|b| b.iter().cloned().collect()).collect(),
			tried_buckets: state.tried_buckets.clone(),
		}
	}

	/// Load the known addresses from the peers file. An empty, missing or
	/// malformed file just means starting fresh.
	fn load_peers(&self) {
		match self.try_load_peers() {
			Ok(0) => {}
			Ok(n) => debug!("loaded {} addresses from '{}'", n, self.peers_file.display()),
			Err(e) => {
				error!("failed to parse peers file {}: {}", self.peers_file.display(), e);
				// An invalid file is nuked unconditionally.
				if let Err(e) = fs::remove_file(&self.peers_file) {
					if e.kind() != io::ErrorKind::NotFound {
						warn!(
							"failed to remove corrupt peers file {}: {}",
							self.peers_file.display(),
							e,
						);
					}
				}
				self.state.lock().reset();
			}
		}
	}

	fn try_load_peers(&self) -> Result<usize, Error> {
		let sam = match peers_file::read_peers_file(&self.peers_file)? {
			Some(sam) => sam,
			None => return Ok(0),
		};

		let mut state = self.state.lock();
		self.install_snapshot(&mut state, &sam)?;
		Ok(state.num_addresses())
	}

	/// Rebuild the table and both tiers from a decoded snapshot. The `tried`
	/// flags and reference counts follow from bucket membership.
	fn install_snapshot(&self, state: &mut State, sam: &SerializedAddrManager) -> Result<(), Error> {
		state.reset();
		state.key = sam.key;

		for ska in &sam.addresses {
			// Version 1 files predate per-address service bits; assume a
			// plain network node for those.
			let (services, src_services) = if sam.version == 1 {
				(ServiceFlags::NETWORK, ServiceFlags::NETWORK)
			} else {
				(ServiceFlags::from(ska.services), ServiceFlags::from(ska.src_services))
			};

			let mut na = self
				.deserialize_net_address(&ska.addr, services)
				.map_err(|e| Error::PeersFileCorrupt(format!("address {}: {}", ska.addr, e)))?;
			na.timestamp = SystemTime::from_unix_secs(ska.time_stamp);
			let src = self
				.deserialize_net_address(&ska.src, src_services)
				.map_err(|e| Error::PeersFileCorrupt(format!("address {}: {}", ska.src, e)))?;

			let key = na.key();
			let mut ka = KnownAddress::new(na, src);
			ka.attempts = ska.attempts;
			ka.last_attempt = peers_file::opt_unix(ska.last_attempt);
			ka.last_success = peers_file::opt_unix(ska.last_success);
			state.index.insert(key, ka);
		}

		for (i, keys) in sam.new_buckets.iter().enumerate() {
			if i >= bucket::NEW_BUCKET_COUNT {
				return Err(Error::PeersFileCorrupt("too many new buckets".to_owned()));
			}
			for key in keys {
				let ka = match state.index.get_mut(key) {
					Some(ka) => ka,
					None => {
						return Err(Error::PeersFileCorrupt(format!(
							"new bucket references unknown address {}", key,
						)));
					}
				};
				if state.new_buckets[i].insert(key.clone()) {
					if ka.refs == 0 {
						state.n_new += 1;
					}
					ka.refs += 1;
				}
			}
		}

		for (i, keys) in sam.tried_buckets.iter().enumerate() {
			if i >= bucket::TRIED_BUCKET_COUNT {
				return Err(Error::PeersFileCorrupt("too many tried buckets".to_owned()));
			}
			for key in keys {
				let ka = match state.index.get_mut(key) {
					Some(ka) => ka,
					None => {
						return Err(Error::PeersFileCorrupt(format!(
							"tried bucket references unknown address {}", key,
						)));
					}
				};
				if ka.tried {
					return Err(Error::PeersFileCorrupt(format!(
						"address {} appears in multiple tried buckets", key,
					)));
				}
				ka.tried = true;
				state.n_tried += 1;
				state.tried_buckets[i].push(key.clone());
			}
		}

		// Sanity checking.
		for (key, ka) in &state.index {
			if ka.refs == 0 && !ka.tried {
				return Err(Error::PeersFileCorrupt(format!(
					"address {} has no bucket references", key,
				)));
			}
			if ka.refs > 0 && ka.tried {
				return Err(Error::PeersFileCorrupt(format!(
					"address {} is both new and tried", key,
				)));
			}
		}

		Ok(())
	}

	// Lifecycle ///////////////////////////////////////////////////////////////

	/// Start the background tasks: periodic snapshots of the table to disk
	/// and periodic refreshes of the local-address oracle. The peers file is
	/// loaded here.
	///
	/// Idempotent; only the first call has any effect.
	pub fn start(&self) {
		if self.started.fetch_add(1, AtomicOrdering::SeqCst) != 0 {
			return;
		}

		trace!("starting address manager");

		let local_addrs = self.local_addrs.clone();
		let quit = self.quit_rx.clone();
		let interval = self.cfg.local_addrs_interval;
		let handle = thread::Builder::new()
			.name("addrmgr_local_addrs".to_owned())
			.spawn(move || loop {
				local_addrs.refresh();
				match quit.recv_timeout(interval) {
					Err(chan::RecvTimeoutError::Timeout) => {}
					_ => break,
				}
			})
			.expect("failed to spawn addrmgr_local_addrs thread");
		self.handles.lock().push(handle);

		self.load_peers();

		let state = self.state.clone();
		let path = self.peers_file.clone();
		let quit = self.quit_rx.clone();
		let ticker = chan::tick(self.cfg.dump_interval);
		let handle = thread::Builder::new()
			.name("addrmgr_snapshot".to_owned())
			.spawn(move || {
				loop {
					chan::select! {
						recv(ticker) -> _ => save_peers(&state, &path),
						recv(quit) -> _ => break,
					}
				}
				// One final snapshot on the way out.
				save_peers(&state, &path);
				trace!("address handler done");
			})
			.expect("failed to spawn addrmgr_snapshot thread");
		self.handles.lock().push(handle);
	}

	/// Stop the background tasks, flushing a final snapshot to disk.
	///
	/// Idempotent. The manager must not be used after this returns.
	pub fn stop(&self) {
		if self.shutdown.fetch_add(1, AtomicOrdering::SeqCst) != 0 {
			warn!("address manager is already in the process of shutting down");
			return;
		}

		info!("address manager shutting down");
		// Dropping the only sender closes the quit channel for every task.
		self.quit_tx.lock().take();
		for handle in self.handles.lock().drain(..) {
			if handle.join().is_err() {
				error!("address manager worker thread panicked");
			}
		}
	}
}

/// Save all known addresses to the peers file so they can be read back in at
/// the next run. Errors are logged; the manager keeps going regardless.
fn save_peers(state: &Mutex<State>, path: &Path) {
	let sam = {
		let state = state.lock();
		AddrManager::serialize(&state)
	};
	if let Err(e) = peers_file::write_peers_file(path, &sam) {
		error!("failed to write peers file {}: {}", path.display(), e);
	}
}

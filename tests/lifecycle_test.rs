
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use bitcoin::network::constants::ServiceFlags;

use bitcoin_addrmgr::{AddrManager, Config, NetAddress, PEERS_FILENAME};

fn test_config(data_dir: &Path) -> Config {
	Config {
		data_dir: data_dir.to_path_buf(),
		dump_interval: Duration::from_millis(100),
		local_addrs_interval: Duration::from_millis(100),
		..Default::default()
	}
}

fn run_manager(data_dir: &Path) -> AddrManager {
	let mgr = AddrManager::new(test_config(data_dir), Box::new(|_| Ok(vec![])));
	mgr.start();
	mgr
}

fn addr(a: u8, b: u8) -> NetAddress {
	NetAddress::new(IpAddr::V4(Ipv4Addr::new(60, a, b, 1)), 8333, ServiceFlags::NETWORK)
}

#[test]
fn state_survives_restart() {
	let dir = tempfile::tempdir().expect("tempdir");

	let mgr = run_manager(dir.path());
	for i in 0..50u8 {
		let na = addr(i, 1);
		mgr.add_address(&na, &na);
	}
	mgr.good(&addr(0, 1));
	assert_eq!(mgr.num_addresses(), 50);

	// Stop flushes a final snapshot.
	mgr.stop();
	assert!(dir.path().join(PEERS_FILENAME).exists());

	// A fresh manager picks the table back up at start.
	let mgr = run_manager(dir.path());
	assert_eq!(mgr.num_addresses(), 50);
	assert!(mgr.get_last_attempt(&addr(0, 1)).is_some());
	mgr.stop();
}

#[test]
fn start_and_stop_are_idempotent() {
	let dir = tempfile::tempdir().expect("tempdir");

	let mgr = run_manager(dir.path());
	mgr.start();
	mgr.start();
	let na = addr(1, 2);
	mgr.add_address(&na, &na);
	mgr.stop();
	mgr.stop();
	assert!(dir.path().join(PEERS_FILENAME).exists());
}

#[test]
fn corrupt_file_starts_empty() {
	let dir = tempfile::tempdir().expect("tempdir");
	std::fs::write(dir.path().join(PEERS_FILENAME), b"}{ garbage").expect("write");

	let mgr = run_manager(dir.path());
	assert_eq!(mgr.num_addresses(), 0);
	assert!(mgr.need_more_addresses());
	mgr.stop();
}

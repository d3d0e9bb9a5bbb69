//! Per-transport registry of discovered CAN peers.
//!
//! A peer's 16-byte hardware unique id is its real identity; node ids are
//! transient and may change across reboots (the allocation server may hand
//! out a different id). The registry therefore reconciles GetNodeInfo
//! replies by unique id first and treats the node-id index as secondary.

use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::cubepilot::batchupdater::dronecan::messages::{NodeInfo, SoftwareVersion};
use crate::cubepilot::batchupdater::firmware::FirmwareCatalog;

/// Node ids at or below this are autopilots, never peripheral peers
pub const AUTOPILOT_NODE_ID_MAX: u8 = 20;

/// Peers silent for longer than this are dropped
pub const PEER_STALE_AFTER: Duration = Duration::from_secs(20);

const VENDOR_NAME_PATTERN: &str = r"com\.cubepilot\.(\w+)";

// PeerNode ---------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootloaderState {
    Pending,
    Updated,
    Unchanged,
    Timeout,
}

#[derive(Debug, Clone)]
pub struct PeerNode {
    pub node_id: u8,
    pub unique_id: [u8; 16],
    pub device_name: String,
    pub software_version: String,
    pub hardware_version: String,
    pub firmware_path: Option<PathBuf>,
    pub needs_update: bool,
    pub last_seen: Instant,
    pub bootloader_state: BootloaderState,
    pub port: String,
    pub bus: u8,
}

impl PeerNode {
    /// Stable-looking display key: `<port leaf>-CAN<bus>-<node id>`.
    pub fn key(&self) -> String {
        peer_key(&self.port, self.bus, self.node_id)
    }

    /// Short device type, the part after the vendor prefix.
    pub fn device_type(&self) -> &str {
        self.device_name
            .rsplit('.')
            .next()
            .unwrap_or(&self.device_name)
    }
}

pub fn peer_key(port: &str, bus: u8, node_id: u8) -> String {
    let leaf = port.rsplit('/').next().unwrap_or(port);
    format!("{}-CAN{}-{}", leaf, bus, node_id)
}

/// `"{major}.{minor}"` plus the VCS commit in hex when it is known.
pub fn derive_version(sw: &SoftwareVersion) -> String {
    let mut version = format!("{}.{}", sw.major, sw.minor);
    if sw.vcs_commit != 0 {
        version.push_str(&format!(".{:x}", sw.vcs_commit));
    }
    version
}

// Events -----------------------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum RegistryEvent {
    NewPeer(PeerNode),
    /// The peer kept its identity but moved to a new node id
    Reindexed { old_key: String, peer: PeerNode },
}

// PeerRegistry -----------------------------------------------------------------------------------

pub struct PeerRegistry {
    port: String,
    bus: u8,
    local_node_id: u8,
    peers: HashMap<u8, PeerNode>,
    /// Node ids already handed to an update driver; survives peer removal
    /// to suppress re-add churn for the life of the process
    processed: HashSet<u8>,
    name_pattern: Regex,
}

impl PeerRegistry {
    pub fn new(port: &str, bus: u8, local_node_id: u8) -> Self {
        PeerRegistry {
            port: port.to_owned(),
            bus,
            local_node_id,
            peers: HashMap::new(),
            processed: HashSet::new(),
            name_pattern: Regex::new(VENDOR_NAME_PATTERN).unwrap(),
        }
    }

    /// Autopilots and our own status traffic are not peers.
    pub fn is_foreign_peer(&self, node_id: u8) -> bool {
        node_id > AUTOPILOT_NODE_ID_MAX && node_id != self.local_node_id
    }

    pub fn touch(&mut self, node_id: u8, now: Instant) {
        if let Some(peer) = self.peers.get_mut(&node_id) {
            peer.last_seen = now;
        }
    }

    pub fn get(&self, node_id: u8) -> Option<&PeerNode> {
        self.peers.get(&node_id)
    }

    pub fn current_node_id(&self, unique_id: &[u8; 16]) -> Option<u8> {
        self.peers
            .values()
            .find(|peer| &peer.unique_id == unique_id)
            .map(|peer| peer.node_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerNode> {
        self.peers.values()
    }

    pub fn peers_needing_update(&self) -> Vec<PeerNode> {
        self.peers
            .values()
            .filter(|peer| peer.needs_update)
            .cloned()
            .collect()
    }

    pub fn mark_processed(&mut self, node_id: u8) {
        self.processed.insert(node_id);
    }

    pub fn is_processed(&self, node_id: u8) -> bool {
        self.processed.contains(&node_id)
    }

    pub fn set_needs_update(&mut self, unique_id: &[u8; 16], needs_update: bool) {
        if let Some(peer) = self
            .peers
            .values_mut()
            .find(|peer| &peer.unique_id == unique_id)
        {
            peer.needs_update = needs_update;
        }
    }

    pub fn set_bootloader_state(&mut self, unique_id: &[u8; 16], state: BootloaderState) {
        if let Some(peer) = self
            .peers
            .values_mut()
            .find(|peer| &peer.unique_id == unique_id)
        {
            peer.bootloader_state = state;
        }
    }

    /// Ingests one GetNodeInfo reply.
    ///
    /// Non-vendor devices are ignored. Known unique ids are reconciled
    /// (possibly reindexed under a new node id); unknown ones become new
    /// peers with their firmware looked up in the catalog.
    pub fn handle_node_info(
        &mut self,
        node_id: u8,
        info: &NodeInfo,
        catalog: &FirmwareCatalog,
        now: Instant,
    ) -> Option<RegistryEvent> {
        let device_name = match self.extract_device_name(info) {
            Some(name) => name,
            None => {
                log::debug!(
                    "{} is not a com.cubepilot device",
                    peer_key(&self.port, self.bus, node_id)
                );
                return None;
            }
        };

        let unique_id = info.hardware_version.unique_id;

        if let Some(old_node_id) = self.current_node_id(&unique_id) {
            if old_node_id == node_id {
                self.touch(node_id, now);
                return None;
            }

            // same device, new node id: move the record, keep its state
            let mut peer = self.peers.remove(&old_node_id).unwrap();
            let old_key = peer.key();
            log::info!("{} node id changed from {} to {}", old_key, old_node_id, node_id);
            peer.node_id = node_id;
            peer.last_seen = now;
            self.peers.insert(node_id, peer.clone());
            return Some(RegistryEvent::Reindexed { old_key, peer });
        }

        if self.is_processed(node_id) {
            return None;
        }

        let firmware_path = catalog.find_peripheral_firmware(&device_name);
        let peer = PeerNode {
            node_id,
            unique_id,
            device_name: device_name.clone(),
            software_version: derive_version(&info.software_version),
            hardware_version: format!(
                "{}.{}",
                info.hardware_version.major, info.hardware_version.minor
            ),
            needs_update: firmware_path.is_some(),
            firmware_path,
            last_seen: now,
            bootloader_state: BootloaderState::Pending,
            port: self.port.clone(),
            bus: self.bus,
        };

        log::info!("{} identified as {}", peer.key(), device_name);
        // a different device reappearing under a reused node id replaces
        // the stale record
        self.peers.insert(node_id, peer.clone());
        Some(RegistryEvent::NewPeer(peer))
    }

    /// Removes peers not seen for [`PEER_STALE_AFTER`], returning them.
    pub fn sweep(&mut self, now: Instant) -> Vec<PeerNode> {
        let stale: Vec<u8> = self
            .peers
            .iter()
            .filter(|(_, peer)| now.duration_since(peer.last_seen) > PEER_STALE_AFTER)
            .map(|(&node_id, _)| node_id)
            .collect();

        let mut removed = Vec::new();
        for node_id in stale {
            if let Some(peer) = self.peers.remove(&node_id) {
                log::info!("{} timed out, removing from monitoring", peer.key());
                // stays processed so it is not immediately re-added
                self.processed.insert(node_id);
                removed.push(peer);
            }
        }
        removed
    }

    fn extract_device_name(&self, info: &NodeInfo) -> Option<String> {
        let sw = &info.software_version;
        let hw = &info.hardware_version;
        let candidates = [
            info.name.clone(),
            format!("{}.{}.{:x}", sw.major, sw.minor, sw.vcs_commit),
            format!(
                "{}.{} {}",
                hw.major,
                hw.minor,
                String::from_utf8_lossy(&hw.certificate_of_authenticity)
            ),
        ];
        for text in &candidates {
            if let Some(captures) = self.name_pattern.captures(text) {
                return Some(format!("com.cubepilot.{}", &captures[1]));
            }
        }
        None
    }
}

// Tests ------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cubepilot::batchupdater::dronecan::messages::{
        HardwareVersion, NodeStatus, SoftwareVersion,
    };

    fn node_info(name: &str, unique_id: [u8; 16], vcs_commit: u32) -> NodeInfo {
        NodeInfo {
            status: NodeStatus {
                uptime_sec: 1,
                health: 0,
                mode: 0,
                sub_mode: 0,
                vendor_specific_status_code: 0,
            },
            software_version: SoftwareVersion {
                major: 1,
                minor: 8,
                optional_field_flags: 0,
                vcs_commit,
                image_crc: 0,
            },
            hardware_version: HardwareVersion {
                major: 2,
                minor: 1,
                unique_id,
                certificate_of_authenticity: vec![],
            },
            name: name.to_string(),
        }
    }

    fn catalog_with_here4() -> (tempfile::TempDir, FirmwareCatalog) {
        let dir = tempfile::tempdir().unwrap();
        let device_dir = dir.path().join("com.cubepilot.here4");
        std::fs::create_dir_all(&device_dir).unwrap();
        std::fs::write(device_dir.join("firmware_1.9.bin"), b"fw").unwrap();
        let catalog = FirmwareCatalog::new(dir.path());
        (dir, catalog)
    }

    #[test]
    fn foreign_peer_filter() {
        let registry = PeerRegistry::new("/dev/ttyACM1", 2, 100);
        assert!(!registry.is_foreign_peer(1));
        assert!(!registry.is_foreign_peer(20));
        assert!(!registry.is_foreign_peer(100));
        assert!(registry.is_foreign_peer(25));
    }

    #[test]
    fn non_vendor_devices_are_ignored() {
        let (_dir, catalog) = catalog_with_here4();
        let mut registry = PeerRegistry::new("/dev/ttyACM1", 2, 100);
        let info = node_info("org.other.gps", [1; 16], 0);
        assert!(registry
            .handle_node_info(25, &info, &catalog, Instant::now())
            .is_none());
        assert_eq!(registry.peer_count(), 0);
    }

    #[test]
    fn new_vendor_peer_gets_firmware_matched() {
        let (_dir, catalog) = catalog_with_here4();
        let mut registry = PeerRegistry::new("/dev/ttyACM1", 2, 100);
        let info = node_info("com.cubepilot.here4", [1; 16], 0xABCD12);

        let event = registry
            .handle_node_info(25, &info, &catalog, Instant::now())
            .expect("no event for new peer");
        match event {
            RegistryEvent::NewPeer(peer) => {
                assert_eq!(peer.device_name, "com.cubepilot.here4");
                assert_eq!(peer.software_version, "1.8.abcd12");
                assert!(peer.needs_update);
                assert!(peer.firmware_path.is_some());
                assert_eq!(peer.key(), "ttyACM1-CAN2-25");
                assert_eq!(peer.device_type(), "here4");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn version_without_commit_has_two_components() {
        let sw = SoftwareVersion {
            major: 1,
            minor: 8,
            ..Default::default()
        };
        assert_eq!(derive_version(&sw), "1.8");
    }

    #[test]
    fn node_id_change_moves_record_and_keeps_state() {
        let (_dir, catalog) = catalog_with_here4();
        let mut registry = PeerRegistry::new("/dev/ttyACM1", 2, 100);
        let uid = [9u8; 16];
        let info = node_info("com.cubepilot.here4", uid, 0);

        registry.handle_node_info(25, &info, &catalog, Instant::now());
        registry.set_bootloader_state(&uid, BootloaderState::Updated);

        // after a reboot the same device shows up as node 26
        let event = registry
            .handle_node_info(26, &info, &catalog, Instant::now())
            .expect("no reindex event");
        match event {
            RegistryEvent::Reindexed { old_key, peer } => {
                assert_eq!(old_key, "ttyACM1-CAN2-25");
                assert_eq!(peer.node_id, 26);
                assert!(peer.needs_update);
                assert!(peer.firmware_path.is_some());
                assert_eq!(peer.bootloader_state, BootloaderState::Updated);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // one record only, under the new id
        assert_eq!(registry.peer_count(), 1);
        assert!(registry.get(25).is_none());
        assert_eq!(registry.current_node_id(&uid), Some(26));
    }

    #[test]
    fn same_node_id_just_touches() {
        let (_dir, catalog) = catalog_with_here4();
        let mut registry = PeerRegistry::new("/dev/ttyACM1", 2, 100);
        let info = node_info("com.cubepilot.here4", [3; 16], 0);
        let start = Instant::now();

        assert!(registry
            .handle_node_info(25, &info, &catalog, start)
            .is_some());
        let later = start + Duration::from_secs(5);
        assert!(registry
            .handle_node_info(25, &info, &catalog, later)
            .is_none());
        assert_eq!(registry.get(25).unwrap().last_seen, later);
    }

    #[test]
    fn stale_peers_are_swept_and_stay_processed() {
        let (_dir, catalog) = catalog_with_here4();
        let mut registry = PeerRegistry::new("/dev/ttyACM1", 2, 100);
        let info = node_info("com.cubepilot.here4", [4; 16], 0);
        let start = Instant::now();

        registry.handle_node_info(25, &info, &catalog, start);
        // silent for 21 seconds
        let removed = registry.sweep(start + Duration::from_secs(21));
        assert_eq!(removed.len(), 1);
        assert_eq!(registry.peer_count(), 0);

        // the same node id does not come back as a fresh peer
        assert!(registry
            .handle_node_info(25, &info, &catalog, start + Duration::from_secs(22))
            .is_none());
    }

    #[test]
    fn vendor_name_found_in_certificate_text() {
        let (_dir, catalog) = catalog_with_here4();
        let mut registry = PeerRegistry::new("/dev/ttyACM1", 2, 100);
        let mut info = node_info("bare-device", [5; 16], 0);
        info.hardware_version.certificate_of_authenticity =
            b"com.cubepilot.here4".to_vec();
        assert!(registry
            .handle_node_info(30, &info, &catalog, Instant::now())
            .is_some());
    }
}

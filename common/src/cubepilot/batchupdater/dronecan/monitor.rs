//! Phase B orchestration: discover CAN transports, monitor their peers
//! and drive firmware updates until the process is stopped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::cubepilot::batchupdater::com::{ports, serial::SerialPortLink};
use crate::cubepilot::batchupdater::config::UpdaterConfig;
use crate::cubepilot::batchupdater::dronecan::messages::{
    encode_begin_update_request, encode_restart_request, NodeInfo, ParamGetSetRequest, ParamValue,
    BEGIN_FIRMWARE_UPDATE, GET_NODE_INFO, PARAM_GETSET, RESTART_NODE,
};
use crate::cubepilot::batchupdater::dronecan::node::{CanNode, CanNodeHandle, NodeEvent};
use crate::cubepilot::batchupdater::dronecan::registry::{
    peer_key, BootloaderState, PeerNode, PeerRegistry, RegistryEvent,
};
use crate::cubepilot::batchupdater::dronecan::transport::CanTransport;
use crate::cubepilot::batchupdater::dronecan::update::{
    run_update, DriverTimings, PeerEvent, PeerLink, UpdateContext,
};
use crate::cubepilot::batchupdater::firmware::{version_from_firmware_name, FirmwareCatalog};
use crate::cubepilot::batchupdater::progress::{DeviceKind, DeviceState, ProgressBus};
use crate::cubepilot::batchupdater::Result;

/// How long a candidate (port, bus) pair may prove it has peers
const DISCOVERY_WINDOW: Duration = Duration::from_secs(10);
/// Cadence of the stale-peer sweep
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const SERVICE_TIMEOUT: Duration = Duration::from_secs(1);

// Monitor ----------------------------------------------------------------------------------------

pub struct CanMonitor {
    config: UpdaterConfig,
    progress: Arc<ProgressBus>,
    catalog: Arc<FirmwareCatalog>,
    stop: Arc<AtomicBool>,
}

struct ActiveTransport {
    node: CanNode,
    registry: Arc<Mutex<PeerRegistry>>,
}

enum PumpEvent {
    Node(NodeEvent),
    Info(u8, NodeInfo),
}

impl CanMonitor {
    pub fn new(
        config: UpdaterConfig,
        progress: Arc<ProgressBus>,
        catalog: Arc<FirmwareCatalog>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        CanMonitor {
            config,
            progress,
            catalog,
            stop,
        }
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Runs discovery and then monitors all retained transports until the
    /// stop flag is raised.
    pub fn run(&self) -> Result<()> {
        let ports = ports::can_adapter_ports();
        if ports.is_empty() {
            self.progress
                .console("No serial ports available for DroneCAN monitoring");
            self.progress.console("Connect a CAN interface and restart");
            return Ok(());
        }

        self.progress
            .console("Discovery phase: testing all interfaces for DroneCAN devices...");

        let (new_peer_tx, new_peer_rx) = std::sync::mpsc::channel();
        let mut retained: Vec<ActiveTransport> = Vec::new();

        for port in &ports {
            if self.stopped() {
                break;
            }
            for &bus in &self.config.can_buses {
                self.progress
                    .console(format!("Testing {} CAN bus {}...", port, bus));

                let active = match self.start_transport(port, bus, retained.len(), &new_peer_tx) {
                    Ok(active) => active,
                    Err(e) => {
                        self.progress.console(format!("  failed to start node: {}", e));
                        continue;
                    }
                };

                self.wait_discovery();
                let found = active.registry.lock().unwrap().peer_count();
                if found > 0 {
                    self.progress.console(format!(
                        "Found {} device(s) on {} CAN bus {}",
                        found, port, bus
                    ));
                    retained.push(active);
                    // one working bus per adapter is enough
                    break;
                }
                self.progress.console("  no devices found");
                drop(active);
            }
        }

        if retained.is_empty() {
            self.progress
                .console("No DroneCAN devices found on available interfaces");
            return Ok(());
        }

        let total: usize = retained
            .iter()
            .map(|active| active.registry.lock().unwrap().peer_count())
            .sum();
        self.progress.console(format!(
            "Discovery complete: {} interface(s), {} device(s); monitoring...",
            retained.len(),
            total
        ));

        // the new-peer queue has been filling since discovery began;
        // draining it now starts the immediate updates
        let mut drivers: Vec<JoinHandle<()>> = Vec::new();
        while !self.stopped() {
            match new_peer_rx.recv_timeout(Duration::from_secs(1)) {
                Ok((index, peer)) => {
                    if let Some(active) = retained.get(index) {
                        if let Some(driver) = self.spawn_driver(active, peer) {
                            drivers.push(driver);
                        }
                    }
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        for driver in drivers {
            let _ = driver.join();
        }
        for mut active in retained {
            active.node.stop();
        }
        Ok(())
    }

    fn wait_discovery(&self) {
        let deadline = Instant::now() + DISCOVERY_WINDOW;
        while Instant::now() < deadline && !self.stopped() {
            std::thread::sleep(Duration::from_millis(500));
        }
    }

    fn start_transport(
        &self,
        port: &str,
        bus: u8,
        index: usize,
        new_peer_tx: &Sender<(usize, PeerNode)>,
    ) -> Result<ActiveTransport> {
        let link = SerialPortLink::with_timeout(port, 115200, Duration::from_millis(100));
        let mut transport = CanTransport::new(link, bus);
        transport.open()?;

        let node = CanNode::start(transport, self.config.can_node_id);
        let registry = Arc::new(Mutex::new(PeerRegistry::new(
            port,
            bus,
            self.config.can_node_id,
        )));

        self.spawn_event_pump(&node, registry.clone(), index, new_peer_tx.clone());

        Ok(ActiveTransport { node, registry })
    }

    /// Feeds node events into the registry: NodeStatus triggers
    /// GetNodeInfo requests, replies create or reconcile peers, and a
    /// periodic sweep drops the stale ones.
    fn spawn_event_pump(
        &self,
        node: &CanNode,
        registry: Arc<Mutex<PeerRegistry>>,
        index: usize,
        new_peer_tx: Sender<(usize, PeerNode)>,
    ) {
        let handle = node.handle();
        let events = handle.listen();
        let (pump_tx, pump_rx) = std::sync::mpsc::channel::<PumpEvent>();

        // bridge the bounded listener into the pump's own queue
        let bridge_tx = pump_tx.clone();
        std::thread::spawn(move || {
            while let Ok(event) = events.recv() {
                if bridge_tx.send(PumpEvent::Node(event)).is_err() {
                    break;
                }
            }
        });

        let progress = self.progress.clone();
        let catalog = self.catalog.clone();
        let stop = self.stop.clone();
        std::thread::spawn(move || {
            let mut last_sweep = Instant::now();
            loop {
                if stop.load(Ordering::Relaxed) {
                    break;
                }

                match pump_rx.recv_timeout(Duration::from_millis(500)) {
                    Ok(PumpEvent::Node(NodeEvent::Status { node_id, .. })) => {
                        let foreign = {
                            let mut registry = registry.lock().unwrap();
                            registry.touch(node_id, Instant::now());
                            registry.is_foreign_peer(node_id)
                        };
                        if foreign {
                            let reply_tx = pump_tx.clone();
                            handle.request(
                                GET_NODE_INFO,
                                node_id,
                                Vec::new(),
                                SERVICE_TIMEOUT,
                                Box::new(move |response| {
                                    if let Some(response) = response {
                                        if let Some(info) = NodeInfo::decode(&response.payload) {
                                            let _ = reply_tx
                                                .send(PumpEvent::Info(response.source, info));
                                        }
                                    }
                                }),
                            );
                        }
                    }
                    Ok(PumpEvent::Node(NodeEvent::Log { .. })) => {
                        // log traffic is consumed by the update drivers
                    }
                    Ok(PumpEvent::Info(node_id, info)) => {
                        let event = registry.lock().unwrap().handle_node_info(
                            node_id,
                            &info,
                            &catalog,
                            Instant::now(),
                        );
                        match event {
                            Some(RegistryEvent::NewPeer(peer)) => {
                                let state = if peer.needs_update {
                                    DeviceState::Queued
                                } else {
                                    DeviceState::Complete
                                };
                                progress.add_device_with_state(
                                    &peer.key(),
                                    &peer.device_name,
                                    &peer.key(),
                                    DeviceKind::CanPeer,
                                    state,
                                );
                                progress.console(format!(
                                    "{} identified as {}",
                                    peer.key(),
                                    peer.device_name
                                ));
                                if peer.needs_update {
                                    progress
                                        .console(format!("{} requires update", peer.key()));
                                    let _ = new_peer_tx.send((index, peer));
                                } else {
                                    progress
                                        .console(format!("{} is up to date", peer.key()));
                                }
                            }
                            Some(RegistryEvent::Reindexed { old_key, peer }) => {
                                progress.rename_device(&old_key, &peer.key(), &peer.key());
                                progress.console(format!(
                                    "{} node id changed, now {}",
                                    old_key,
                                    peer.key()
                                ));
                            }
                            None => {}
                        }
                    }
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
                }

                if last_sweep.elapsed() >= SWEEP_INTERVAL {
                    last_sweep = Instant::now();
                    let removed = registry.lock().unwrap().sweep(Instant::now());
                    for peer in removed {
                        progress.remove_device(&peer.key());
                        progress.console(format!(
                            "{} timed out, removed from monitoring",
                            peer.key()
                        ));
                    }
                }
            }
        });
    }

    /// Registers the peer's firmware with the file server and starts its
    /// update driver thread.
    fn spawn_driver(&self, active: &ActiveTransport, peer: PeerNode) -> Option<JoinHandle<()>> {
        let firmware_path = peer.firmware_path.clone()?;
        let firmware_size = match std::fs::metadata(&firmware_path) {
            Ok(meta) => meta.len(),
            Err(e) => {
                self.progress.console(format!(
                    "{} firmware unreadable ({}): {}",
                    peer.key(),
                    firmware_path.display(),
                    e
                ));
                return None;
            }
        };

        active.registry.lock().unwrap().mark_processed(peer.node_id);

        let handle = active.node.handle();
        let file_key = handle.serve_file(&firmware_path);
        let ctx = UpdateContext {
            firmware_size,
            target_version: version_from_firmware_name(&firmware_path),
            current_version: peer.software_version.clone(),
            file_key,
            timings: DriverTimings::default(),
        };

        let link = NodePeerLink {
            handle,
            registry: active.registry.clone(),
            unique_id: peer.unique_id,
            fallback_node_id: peer.node_id,
            port: peer.port.clone(),
            bus: peer.bus,
            events: Mutex::new(active.node.handle().listen()),
            stop: self.stop.clone(),
        };

        let progress = self.progress.clone();
        let registry = active.registry.clone();
        Some(std::thread::spawn(move || {
            match run_update(&link, &progress, &ctx) {
                Ok(()) => {
                    registry
                        .lock()
                        .unwrap()
                        .set_needs_update(&link.unique_id, false);
                    progress.console(format!(
                        "{} firmware update completed successfully",
                        link.key()
                    ));
                }
                Err(e) => {
                    let message = e.to_string();
                    progress.update_device_err(
                        &link.key(),
                        DeviceState::Failed,
                        0.0,
                        Some(truncate(&message, 50)),
                    );
                    progress.console(format!("{} firmware update failed: {}", link.key(), message));
                }
            }
        }))
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let short: String = text.chars().take(max).collect();
        format!("{}...", short)
    }
}

// NodePeerLink -----------------------------------------------------------------------------------

///
/// Live [`PeerLink`] bound to a node runtime and registry. The peer is
/// addressed by unique id; every send resolves the current node id so an
/// update survives a mid-flight node-id change.
///
struct NodePeerLink {
    handle: CanNodeHandle,
    registry: Arc<Mutex<PeerRegistry>>,
    unique_id: [u8; 16],
    fallback_node_id: u8,
    port: String,
    bus: u8,
    events: Mutex<Receiver<NodeEvent>>,
    stop: Arc<AtomicBool>,
}

impl NodePeerLink {
    fn node_id(&self) -> u8 {
        self.registry
            .lock()
            .unwrap()
            .current_node_id(&self.unique_id)
            .unwrap_or(self.fallback_node_id)
    }
}

impl PeerLink for NodePeerLink {
    fn key(&self) -> String {
        peer_key(&self.port, self.bus, self.node_id())
    }

    fn send_restart(&self) {
        let key = self.key();
        self.handle.request(
            RESTART_NODE,
            self.node_id(),
            encode_restart_request(),
            SERVICE_TIMEOUT,
            Box::new(move |response| match response {
                Some(_) => log::info!("{} restart request acknowledged", key),
                None => log::info!("{} no response to restart request", key),
            }),
        );
    }

    fn send_begin_update(&self, file_key: &str) {
        let key = self.key();
        let payload = encode_begin_update_request(self.handle.local_node_id(), file_key);
        self.handle.request(
            BEGIN_FIRMWARE_UPDATE,
            self.node_id(),
            payload,
            SERVICE_TIMEOUT,
            Box::new(move |response| {
                if let Some(response) = response {
                    use crate::cubepilot::batchupdater::dronecan::messages::BeginUpdateResponse;
                    if let Some(decoded) = BeginUpdateResponse::decode(&response.payload) {
                        log::info!("{} firmware update response: error {}", key, decoded.error);
                    }
                }
            }),
        );
    }

    fn send_flash_bootloader(&self) {
        let key = self.key();
        let request = ParamGetSetRequest {
            index: 0,
            value: ParamValue::Integer(1),
            name: "FLASH_BOOTLOADER".to_string(),
        };
        self.handle.request(
            PARAM_GETSET,
            self.node_id(),
            request.encode(),
            SERVICE_TIMEOUT,
            Box::new(move |response| {
                if let Some(response) = response {
                    use crate::cubepilot::batchupdater::dronecan::messages::ParamGetSetResponse;
                    if let Some(decoded) = ParamGetSetResponse::decode(&response.payload) {
                        log::info!(
                            "{} parameter {} set to {:?}",
                            key,
                            decoded.name,
                            decoded.value
                        );
                    }
                }
            }),
        );
    }

    fn recv_event(&self, timeout: Duration) -> Option<PeerEvent> {
        let deadline = Instant::now() + timeout;
        let events = self.events.lock().unwrap();
        loop {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let event = events.recv_timeout(remaining).ok()?;
            let peer_id = self.node_id();
            match event {
                NodeEvent::Status { node_id, status } if node_id == peer_id => {
                    return Some(PeerEvent::Status {
                        mode: status.mode,
                        vendor_status: status.vendor_specific_status_code,
                    });
                }
                NodeEvent::Log { node_id, message } if node_id == peer_id => {
                    return Some(PeerEvent::Log { text: message.text });
                }
                _ => continue,
            }
        }
    }

    fn set_bootloader_state(&self, state: BootloaderState) {
        self.registry
            .lock()
            .unwrap()
            .set_bootloader_state(&self.unique_id, state);
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    fn vanished(&self) -> bool {
        self.registry
            .lock()
            .unwrap()
            .current_node_id(&self.unique_id)
            .is_none()
    }
}

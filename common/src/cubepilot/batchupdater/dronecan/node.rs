//! CAN node runtime: one spin thread per transport endpoint.
//!
//! The worker thread owns the transport exclusively. Everything else talks
//! to it through a command channel (outbound requests, listener
//! registration, served files) and bounded event channels (inbound
//! NodeStatus and LogMessage traffic).

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::cubepilot::batchupdater::com::SerialLink;
use crate::cubepilot::batchupdater::dronecan::allocation::AllocationServer;
use crate::cubepilot::batchupdater::dronecan::file_server::{path_key, FileServer};
use crate::cubepilot::batchupdater::dronecan::messages::{
    self, Allocation, DataTypeInfo, FileReadRequest, LogMessage, NodeInfo, NodeStatus,
    ALLOCATION, FILE_READ, GET_NODE_INFO, LOG_MESSAGE, NODE_STATUS,
};
use crate::cubepilot::batchupdater::dronecan::transfer::{
    self, encode_message_id, encode_service_id, make_frames, Reassembler, TransferIdCounter,
    TransferKind, PRIORITY_BROADCAST, PRIORITY_SERVICE,
};
use crate::cubepilot::batchupdater::dronecan::transport::CanTransport;

const NODE_NAME: &str = "org.cubepilot.batchupdater";
const STATUS_INTERVAL: Duration = Duration::from_millis(500);
/// Backoff applied when an event listener's queue is full
const LISTENER_BACKOFF: Duration = Duration::from_millis(100);
const IDLE_SLEEP: Duration = Duration::from_millis(10);
/// Frames handled per spin before yielding back to housekeeping
const RX_BUDGET: usize = 256;

// Events and commands ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum NodeEvent {
    Status { node_id: u8, status: NodeStatus },
    Log { node_id: u8, message: LogMessage },
}

pub struct ServiceResponse {
    pub source: u8,
    pub payload: Vec<u8>,
}

type ResponseCallback = Box<dyn FnOnce(Option<ServiceResponse>) + Send>;

enum NodeCmd {
    Request {
        service: DataTypeInfo,
        dest: u8,
        payload: Vec<u8>,
        timeout: Duration,
        callback: ResponseCallback,
    },
    AddListener(SyncSender<NodeEvent>),
    ServeFile(std::path::PathBuf),
    Shutdown,
}

// Handle -----------------------------------------------------------------------------------------

///
/// Cloneable front for a running node; all operations are posted to the
/// spin thread.
///
#[derive(Clone)]
pub struct CanNodeHandle {
    cmd_tx: Sender<NodeCmd>,
    local_node_id: u8,
    port: String,
    bus: u8,
}

impl CanNodeHandle {
    pub fn local_node_id(&self) -> u8 {
        self.local_node_id
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn bus(&self) -> u8 {
        self.bus
    }

    /// Issues a service request; the callback fires on the spin thread
    /// with the response, or `None` on timeout.
    pub fn request(
        &self,
        service: DataTypeInfo,
        dest: u8,
        payload: Vec<u8>,
        timeout: Duration,
        callback: ResponseCallback,
    ) {
        let _ = self.cmd_tx.send(NodeCmd::Request {
            service,
            dest,
            payload,
            timeout,
            callback,
        });
    }

    /// Convenience wrapper that blocks the calling thread for the response.
    pub fn request_blocking(
        &self,
        service: DataTypeInfo,
        dest: u8,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Option<ServiceResponse> {
        let (tx, rx) = std::sync::mpsc::channel();
        self.request(
            service,
            dest,
            payload,
            timeout,
            Box::new(move |response| {
                let _ = tx.send(response);
            }),
        );
        rx.recv_timeout(timeout + Duration::from_secs(1)).ok()?
    }

    /// Registers a bounded event listener and returns its receiving end.
    pub fn listen(&self) -> Receiver<NodeEvent> {
        let (tx, rx) = std::sync::mpsc::sync_channel(256);
        let _ = self.cmd_tx.send(NodeCmd::AddListener(tx));
        rx
    }

    /// Starts serving a file to peers and returns its wire path key.
    pub fn serve_file(&self, path: &Path) -> String {
        let key = path_key(&path.to_string_lossy());
        let _ = self.cmd_tx.send(NodeCmd::ServeFile(path.to_path_buf()));
        key
    }

    fn shutdown(&self) {
        let _ = self.cmd_tx.send(NodeCmd::Shutdown);
    }
}

// CanNode ----------------------------------------------------------------------------------------

///
/// Owning wrapper around the spin thread; stopping (or dropping) tears the
/// transport down.
///
pub struct CanNode {
    handle: CanNodeHandle,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CanNode {
    pub fn start<L: SerialLink + 'static>(
        transport: CanTransport<L>,
        local_node_id: u8,
    ) -> CanNode {
        let (cmd_tx, cmd_rx) = std::sync::mpsc::channel();
        let handle = CanNodeHandle {
            cmd_tx,
            local_node_id,
            port: transport.port_name(),
            bus: transport.bus(),
        };
        let running = Arc::new(AtomicBool::new(true));

        let thread_running = running.clone();
        let thread = std::thread::spawn(move || {
            let mut worker = CanNodeWorker::new(transport, local_node_id, cmd_rx);
            while thread_running.load(Ordering::Relaxed) {
                if !worker.spin_once() {
                    break;
                }
            }
            worker.transport.close();
        });

        CanNode {
            handle,
            running,
            thread: Some(thread),
        }
    }

    pub fn handle(&self) -> CanNodeHandle {
        self.handle.clone()
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        self.handle.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for CanNode {
    fn drop(&mut self) {
        self.stop();
    }
}

// Worker -----------------------------------------------------------------------------------------

struct PendingRequest {
    service_id: u8,
    dest: u8,
    transfer_id: u8,
    deadline: Instant,
    callback: Option<ResponseCallback>,
}

struct CanNodeWorker<L: SerialLink> {
    transport: CanTransport<L>,
    local_node_id: u8,
    cmd_rx: Receiver<NodeCmd>,
    listeners: Vec<SyncSender<NodeEvent>>,
    reassembler: Reassembler,
    transfer_ids: TransferIdCounter,
    pending: Vec<PendingRequest>,
    allocation: AllocationServer,
    file_server: FileServer,
    started: Instant,
    last_status: Option<Instant>,
}

impl<L: SerialLink> CanNodeWorker<L> {
    fn new(transport: CanTransport<L>, local_node_id: u8, cmd_rx: Receiver<NodeCmd>) -> Self {
        CanNodeWorker {
            transport,
            local_node_id,
            cmd_rx,
            listeners: Vec::new(),
            reassembler: Reassembler::new(),
            transfer_ids: TransferIdCounter::new(),
            pending: Vec::new(),
            allocation: AllocationServer::new(local_node_id),
            file_server: FileServer::new(),
            started: Instant::now(),
            last_status: None,
        }
    }

    /// One scheduler pass; `false` requests shutdown.
    fn spin_once(&mut self) -> bool {
        if !self.drain_commands() {
            return false;
        }

        if let Err(e) = self.transport.keepalive() {
            log::warn!("{}: CAN keepalive failed: {}", self.transport.port_name(), e);
        }

        self.broadcast_status_if_due();

        let mut idle = true;
        for _ in 0..RX_BUDGET {
            match self.transport.recv_frame() {
                Ok(Some(frame)) => {
                    idle = false;
                    self.handle_frame(&frame);
                }
                Ok(None) => break,
                Err(e) => {
                    log::warn!("{}: CAN receive failed: {}", self.transport.port_name(), e);
                    break;
                }
            }
        }

        self.expire_pending();
        self.reassembler.purge();

        if idle {
            std::thread::sleep(IDLE_SLEEP);
        }
        true
    }

    fn drain_commands(&mut self) -> bool {
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            match cmd {
                NodeCmd::Request {
                    service,
                    dest,
                    payload,
                    timeout,
                    callback,
                } => self.send_request(service, dest, payload, timeout, callback),
                NodeCmd::AddListener(listener) => self.listeners.push(listener),
                NodeCmd::ServeFile(path) => {
                    let key = self.file_server.add_file(&path);
                    log::info!("file server configured with hash {}", key);
                }
                NodeCmd::Shutdown => return false,
            }
        }
        true
    }

    fn send_request(
        &mut self,
        service: DataTypeInfo,
        dest: u8,
        payload: Vec<u8>,
        timeout: Duration,
        callback: ResponseCallback,
    ) {
        // service ids live in their own counter space, away from messages
        let transfer_id = self.transfer_ids.next(service.id | 0x8000, dest);
        let can_id = encode_service_id(
            PRIORITY_SERVICE,
            service.id as u8,
            true,
            dest,
            self.local_node_id,
        );
        let frames = make_frames(can_id, &payload, transfer_id, service.signature);
        for frame in &frames {
            if let Err(e) = self.transport.send_frame(frame) {
                log::warn!("{}: CAN send failed: {}", self.transport.port_name(), e);
                callback(None);
                return;
            }
        }
        self.pending.push(PendingRequest {
            service_id: service.id as u8,
            dest,
            transfer_id,
            deadline: Instant::now() + timeout,
            callback: Some(callback),
        });
    }

    fn broadcast(&mut self, dtype: DataTypeInfo, priority: u8, payload: &[u8]) {
        let transfer_id = self.transfer_ids.next(dtype.id, 0xFF);
        let can_id = encode_message_id(priority, dtype.id, self.local_node_id);
        let frames = make_frames(can_id, payload, transfer_id, dtype.signature);
        for frame in &frames {
            if let Err(e) = self.transport.send_frame(frame) {
                log::warn!("{}: CAN send failed: {}", self.transport.port_name(), e);
                return;
            }
        }
    }

    fn current_status(&self) -> NodeStatus {
        NodeStatus {
            uptime_sec: self.started.elapsed().as_secs() as u32,
            health: messages::node_health::OK,
            mode: messages::node_mode::OPERATIONAL,
            sub_mode: 0,
            vendor_specific_status_code: 0,
        }
    }

    fn broadcast_status_if_due(&mut self) {
        let due = match self.last_status {
            Some(last) => last.elapsed() >= STATUS_INTERVAL,
            None => true,
        };
        if due {
            let payload = self.current_status().encode();
            self.broadcast(NODE_STATUS, PRIORITY_BROADCAST, &payload);
            self.last_status = Some(Instant::now());
        }
    }

    fn handle_frame(&mut self, frame: &crate::cubepilot::batchupdater::dronecan::CanFrame) {
        let (_, kind) = transfer::decode_can_id(frame.id);
        let signature = match kind {
            TransferKind::Message { type_id, .. } => messages::message_signature(type_id),
            TransferKind::Anonymous { type_id_low, .. } => {
                if type_id_low == (ALLOCATION.id & 0x03) as u8 {
                    Some(ALLOCATION.signature)
                } else {
                    None
                }
            }
            TransferKind::Service { type_id, dest, .. } => {
                if dest != self.local_node_id {
                    return;
                }
                messages::service_signature(type_id)
            }
        };

        let completed = match self.reassembler.push(frame, signature) {
            Some(completed) => completed,
            None => return,
        };

        match completed.kind {
            TransferKind::Message { type_id, source } => {
                self.handle_message(type_id, source, &completed.payload)
            }
            TransferKind::Anonymous { .. } => self.handle_allocation_request(&completed.payload),
            TransferKind::Service {
                type_id,
                request,
                source,
                ..
            } => {
                if request {
                    self.handle_service_request(
                        type_id,
                        source,
                        completed.transfer_id,
                        &completed.payload,
                    );
                } else {
                    self.handle_service_response(
                        type_id,
                        source,
                        completed.transfer_id,
                        completed.payload,
                    );
                }
            }
        }
    }

    fn handle_message(&mut self, type_id: u16, source: u8, payload: &[u8]) {
        if type_id == NODE_STATUS.id {
            if let Some(status) = NodeStatus::decode(payload) {
                self.allocation.observe_node_id(source);
                self.dispatch(NodeEvent::Status {
                    node_id: source,
                    status,
                });
            }
        } else if type_id == LOG_MESSAGE.id {
            if let Some(message) = LogMessage::decode(payload) {
                self.dispatch(NodeEvent::Log {
                    node_id: source,
                    message,
                });
            }
        }
    }

    fn handle_allocation_request(&mut self, payload: &[u8]) {
        let request = match Allocation::decode(payload) {
            Some(request) => request,
            None => return,
        };
        if let Some(response) = self.allocation.handle_anonymous(&request) {
            let payload = response.encode();
            self.broadcast(ALLOCATION, PRIORITY_BROADCAST, &payload);
        }
    }

    fn handle_service_request(&mut self, type_id: u8, source: u8, transfer_id: u8, payload: &[u8]) {
        if type_id as u16 == FILE_READ.id {
            if let Some(request) = FileReadRequest::decode(payload) {
                let response = self.file_server.handle_read(&request);
                self.send_service_response(FILE_READ, source, transfer_id, &response.encode());
            }
        } else if type_id as u16 == GET_NODE_INFO.id {
            let info = NodeInfo {
                status: self.current_status(),
                software_version: messages::SoftwareVersion {
                    major: 1,
                    minor: 0,
                    ..Default::default()
                },
                hardware_version: messages::HardwareVersion::default(),
                name: NODE_NAME.to_string(),
            };
            self.send_service_response(GET_NODE_INFO, source, transfer_id, &info.encode());
        }
    }

    fn send_service_response(
        &mut self,
        service: DataTypeInfo,
        dest: u8,
        transfer_id: u8,
        payload: &[u8],
    ) {
        let can_id = encode_service_id(
            PRIORITY_SERVICE,
            service.id as u8,
            false,
            dest,
            self.local_node_id,
        );
        // responses reuse the request's transfer id
        let frames = make_frames(can_id, payload, transfer_id, service.signature);
        for frame in &frames {
            if let Err(e) = self.transport.send_frame(frame) {
                log::warn!("{}: CAN send failed: {}", self.transport.port_name(), e);
                return;
            }
        }
    }

    fn handle_service_response(
        &mut self,
        type_id: u8,
        source: u8,
        transfer_id: u8,
        payload: Vec<u8>,
    ) {
        let position = self.pending.iter().position(|pending| {
            pending.service_id == type_id
                && pending.dest == source
                && pending.transfer_id == transfer_id
        });
        if let Some(position) = position {
            let mut pending = self.pending.swap_remove(position);
            if let Some(callback) = pending.callback.take() {
                callback(Some(ServiceResponse { source, payload }));
            }
        }
    }

    fn expire_pending(&mut self) {
        let now = Instant::now();
        let mut expired = Vec::new();
        self.pending.retain_mut(|pending| {
            if now >= pending.deadline {
                if let Some(callback) = pending.callback.take() {
                    expired.push(callback);
                }
                false
            } else {
                true
            }
        });
        for callback in expired {
            callback(None);
        }
    }

    fn dispatch(&mut self, event: NodeEvent) {
        self.listeners.retain(|listener| {
            match listener.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    // bounded queue overflow: back off once, then drop
                    std::thread::sleep(LISTENER_BACKOFF);
                    !matches!(
                        listener.try_send(event.clone()),
                        Err(TrySendError::Disconnected(_))
                    )
                }
                Err(TrySendError::Disconnected(_)) => false,
            }
        });
    }
}

// Tests ------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cubepilot::batchupdater::com::SerialSim;
    use crate::cubepilot::batchupdater::dronecan::CanFrame;
    use std::sync::Mutex;

    /// Wire bytes for the given frames as the adapter would tunnel them.
    fn tunnel_bytes(frames: &[CanFrame], bus: u8) -> Vec<u8> {
        let mut tx = CanTransport::new(SerialSim::new(), bus);
        for frame in frames {
            tx.send_frame(frame).unwrap();
        }
        tx.link_mut().written().to_vec()
    }

    fn make_worker() -> (CanNodeWorker<SerialSim>, CanNodeHandle) {
        let (cmd_tx, cmd_rx) = std::sync::mpsc::channel();
        let transport = CanTransport::new(SerialSim::new(), 2);
        let handle = CanNodeHandle {
            cmd_tx,
            local_node_id: 100,
            port: "sim".to_string(),
            bus: 2,
        };
        (CanNodeWorker::new(transport, 100, cmd_rx), handle)
    }

    fn parse_written(worker: &mut CanNodeWorker<SerialSim>) -> Vec<CanFrame> {
        let wire = worker.transport.link_mut().written().to_vec();
        worker.transport.link_mut().clear_written();
        let mut sim = SerialSim::new();
        sim.push_response(&wire);
        let mut rx = CanTransport::new(sim, 2);
        let mut frames = Vec::new();
        while let Some(frame) = rx.recv_frame().unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn node_status_reaches_listeners() {
        let (mut worker, handle) = make_worker();
        let rx = handle.listen();
        worker.drain_commands();

        let status = NodeStatus {
            uptime_sec: 5,
            health: 0,
            mode: messages::node_mode::OPERATIONAL,
            sub_mode: 0,
            vendor_specific_status_code: 7,
        };
        let can_id = encode_message_id(PRIORITY_BROADCAST, NODE_STATUS.id, 25);
        let frames = make_frames(can_id, &status.encode(), 0, NODE_STATUS.signature);
        let wire = tunnel_bytes(&frames, 2);
        worker.transport.link_mut().push_response(&wire);

        worker.spin_once();

        match rx.try_recv().expect("no event dispatched") {
            NodeEvent::Status { node_id, status } => {
                assert_eq!(node_id, 25);
                assert_eq!(status.vendor_specific_status_code, 7);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn request_gets_response_callback() {
        let (mut worker, handle) = make_worker();
        let result = Arc::new(Mutex::new(None));
        let result_clone = result.clone();
        handle.request(
            messages::RESTART_NODE,
            25,
            messages::encode_restart_request(),
            Duration::from_secs(1),
            Box::new(move |response| {
                *result_clone.lock().unwrap() = Some(response.map(|r| r.payload));
            }),
        );
        worker.spin_once();
        assert_eq!(worker.pending.len(), 1);
        let transfer_id = worker.pending[0].transfer_id;

        // peer 25 answers ok
        let can_id = encode_service_id(
            PRIORITY_SERVICE,
            messages::RESTART_NODE.id as u8,
            false,
            100,
            25,
        );
        let frames = make_frames(
            can_id,
            &messages::encode_restart_response(true),
            transfer_id,
            messages::RESTART_NODE.signature,
        );
        let wire = tunnel_bytes(&frames, 2);
        worker.transport.link_mut().push_response(&wire);
        worker.spin_once();

        let got = result.lock().unwrap().take().expect("callback not invoked");
        let payload = got.expect("request timed out");
        assert_eq!(messages::decode_restart_response(&payload), Some(true));
        assert!(worker.pending.is_empty());
    }

    #[test]
    fn request_times_out_with_none() {
        let (mut worker, handle) = make_worker();
        let result = Arc::new(Mutex::new(None));
        let result_clone = result.clone();
        handle.request(
            messages::GET_NODE_INFO,
            25,
            Vec::new(),
            Duration::from_millis(0),
            Box::new(move |response| {
                *result_clone.lock().unwrap() = Some(response.is_none());
            }),
        );
        worker.spin_once();
        worker.spin_once();
        assert_eq!(result.lock().unwrap().take(), Some(true));
    }

    #[test]
    fn allocation_request_is_answered() {
        let (mut worker, _handle) = make_worker();
        // first anonymous stage from a follower
        let alloc = Allocation {
            node_id: 0,
            first_part_of_unique_id: true,
            unique_id: vec![1, 2, 3, 4, 5, 6],
        };
        let can_id = transfer::encode_anonymous_id(
            PRIORITY_BROADCAST,
            0x1234,
            (ALLOCATION.id & 0x03) as u8,
        );
        let frames = make_frames(can_id, &alloc.encode(), 0, ALLOCATION.signature);
        let wire = tunnel_bytes(&frames, 2);
        worker.transport.link_mut().push_response(&wire);

        worker.spin_once();

        // among the written frames there must be an Allocation broadcast
        // from our node echoing the six uid bytes
        let frames = parse_written(&mut worker);
        let mut rx = Reassembler::new();
        let mut found = false;
        for frame in &frames {
            let (_, kind) = transfer::decode_can_id(frame.id);
            if let TransferKind::Message { type_id, source } = kind {
                if type_id == ALLOCATION.id && source == 100 {
                    if let Some(done) = rx.push(frame, Some(ALLOCATION.signature)) {
                        let decoded = Allocation::decode(&done.payload).unwrap();
                        assert_eq!(decoded.unique_id, vec![1, 2, 3, 4, 5, 6]);
                        found = true;
                    }
                }
            }
        }
        assert!(found, "no allocation response broadcast");
    }

    #[test]
    fn file_read_requests_are_served() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("firmware.bin");
        std::fs::write(&path, vec![0xCD; 40]).unwrap();

        let (mut worker, handle) = make_worker();
        let key = handle.serve_file(&path);
        worker.drain_commands();

        let request = FileReadRequest {
            offset: 0,
            path: key,
        };
        let can_id = encode_service_id(PRIORITY_SERVICE, FILE_READ.id as u8, true, 100, 25);
        let frames = make_frames(can_id, &request.encode(), 3, FILE_READ.signature);
        let wire = tunnel_bytes(&frames, 2);
        worker.transport.link_mut().push_response(&wire);

        worker.spin_once();

        let frames = parse_written(&mut worker);
        let mut rx = Reassembler::new();
        let mut served = None;
        for frame in &frames {
            let (_, kind) = transfer::decode_can_id(frame.id);
            if let TransferKind::Service {
                type_id,
                request: false,
                dest,
                source,
            } = kind
            {
                if type_id as u16 == FILE_READ.id && dest == 25 && source == 100 {
                    if let Some(done) = rx.push(frame, Some(FILE_READ.signature)) {
                        served = messages::FileReadResponse::decode(&done.payload);
                    }
                }
            }
        }
        let served = served.expect("no file read response");
        assert_eq!(served.error, messages::file_error::OK);
        assert_eq!(served.data, vec![0xCD; 40]);
    }
}

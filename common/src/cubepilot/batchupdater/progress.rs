//! Thread-safe aggregation of per-device update state and console output.
//!
//! The bus is the only structure mutated from multiple threads; everything
//! happens under one mutex and renderers work from consistent snapshots
//! taken in a single critical section.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const CONSOLE_MAX_LINES: usize = 100;
const RENDER_THROTTLE: Duration = Duration::from_millis(100);

// Device state -----------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Queued,
    Connecting,
    Preparing,
    Erasing,
    Uploading,
    Verifying,
    Updating,
    Bootloader,
    Restarting,
    Complete,
    Failed,
}

impl DeviceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Queued => "queued",
            DeviceState::Connecting => "connecting",
            DeviceState::Preparing => "preparing",
            DeviceState::Erasing => "erasing",
            DeviceState::Uploading => "uploading",
            DeviceState::Verifying => "verifying",
            DeviceState::Updating => "updating",
            DeviceState::Bootloader => "bootloader",
            DeviceState::Restarting => "restarting",
            DeviceState::Complete => "complete",
            DeviceState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DeviceState::Complete | DeviceState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Cube,
    CanPeer,
}

#[derive(Debug, Clone)]
pub struct DeviceRow {
    pub name: String,
    /// Port path for cubes, `<port>-CAN<bus>-<node id>` for peers
    pub locator: String,
    pub kind: DeviceKind,
    pub state: DeviceState,
    pub progress: f32,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    pub devices: BTreeMap<String, DeviceRow>,
    pub console: Vec<String>,
    /// Total number of console lines ever pushed; lets renderers tell
    /// which tail of `console` is new since their last snapshot
    pub console_seq: u64,
}

// ProgressBus ------------------------------------------------------------------------------------

struct BusState {
    devices: BTreeMap<String, DeviceRow>,
    console: VecDeque<String>,
    console_seq: u64,
    last_render: Option<Instant>,
}

///
/// Shared progress bus handed explicitly to every component that reports
/// state. Device rows stay until removed; the console FIFO is bounded.
///
pub struct ProgressBus {
    state: Mutex<BusState>,
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBus {
    pub fn new() -> Self {
        ProgressBus {
            state: Mutex::new(BusState {
                devices: BTreeMap::new(),
                console: VecDeque::new(),
                console_seq: 0,
                last_render: None,
            }),
        }
    }

    pub fn add_device(&self, id: &str, name: &str, locator: &str, kind: DeviceKind) {
        self.add_device_with_state(id, name, locator, kind, DeviceState::Queued);
    }

    pub fn add_device_with_state(
        &self,
        id: &str,
        name: &str,
        locator: &str,
        kind: DeviceKind,
        state: DeviceState,
    ) {
        let mut bus = self.state.lock().unwrap();
        // never reset a row that is already being driven
        bus.devices.entry(id.to_string()).or_insert(DeviceRow {
            name: name.to_string(),
            locator: locator.to_string(),
            kind,
            state,
            progress: 0.0,
            error: None,
        });
    }

    pub fn remove_device(&self, id: &str) {
        let mut bus = self.state.lock().unwrap();
        bus.devices.remove(id);
    }

    pub fn rename_device(&self, old_id: &str, new_id: &str, locator: &str) {
        let mut bus = self.state.lock().unwrap();
        if let Some(mut row) = bus.devices.remove(old_id) {
            row.locator = locator.to_string();
            bus.devices.insert(new_id.to_string(), row);
        }
    }

    pub fn update_device(&self, id: &str, state: DeviceState, progress: f32) {
        self.update_device_err(id, state, progress, None);
    }

    pub fn update_device_err(
        &self,
        id: &str,
        state: DeviceState,
        progress: f32,
        error: Option<String>,
    ) {
        let mut bus = self.state.lock().unwrap();
        if let Some(row) = bus.devices.get_mut(id) {
            row.state = state;
            row.progress = progress.clamp(0.0, 100.0);
            row.error = error;
        }
    }

    /// Appends a line to the console FIFO, discarding the oldest lines
    /// beyond the 100-line cap. Empty lines are dropped.
    pub fn console(&self, line: impl Into<String>) {
        let line = line.into();
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }
        let mut bus = self.state.lock().unwrap();
        bus.console.push_back(trimmed.to_string());
        bus.console_seq += 1;
        while bus.console.len() > CONSOLE_MAX_LINES {
            bus.console.pop_front();
        }
    }

    /// Internally consistent copy of the whole bus.
    pub fn snapshot(&self) -> ProgressSnapshot {
        let bus = self.state.lock().unwrap();
        ProgressSnapshot {
            devices: bus.devices.clone(),
            console: bus.console.iter().cloned().collect(),
            console_seq: bus.console_seq,
        }
    }

    /// True at most once per 100 ms of wall time; renderers poll this to
    /// throttle redraws.
    pub fn should_render(&self) -> bool {
        let mut bus = self.state.lock().unwrap();
        let now = Instant::now();
        match bus.last_render {
            Some(last) if now.duration_since(last) < RENDER_THROTTLE => false,
            _ => {
                bus.last_render = Some(now);
                true
            }
        }
    }

    /// True when every known device reached a terminal state.
    pub fn all_done(&self) -> bool {
        let bus = self.state.lock().unwrap();
        bus.devices.values().all(|row| row.state.is_terminal())
    }

    pub fn failed_devices(&self) -> Vec<String> {
        let bus = self.state.lock().unwrap();
        bus.devices
            .iter()
            .filter(|(_, row)| row.state == DeviceState::Failed)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

// Tests ------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_persist_until_removed() {
        let bus = ProgressBus::new();
        bus.add_device("cube_1", "CubeOrange", "/dev/ttyACM0", DeviceKind::Cube);
        bus.update_device("cube_1", DeviceState::Uploading, 42.0);

        let snap = bus.snapshot();
        assert_eq!(snap.devices.len(), 1);
        assert_eq!(snap.devices["cube_1"].state, DeviceState::Uploading);

        bus.remove_device("cube_1");
        assert!(bus.snapshot().devices.is_empty());
    }

    #[test]
    fn re_adding_does_not_reset_state() {
        let bus = ProgressBus::new();
        bus.add_device("n25", "here4", "can0-25", DeviceKind::CanPeer);
        bus.update_device("n25", DeviceState::Updating, 60.0);
        bus.add_device("n25", "here4", "can0-25", DeviceKind::CanPeer);
        assert_eq!(bus.snapshot().devices["n25"].state, DeviceState::Updating);
    }

    #[test]
    fn console_fifo_is_bounded_at_100() {
        let bus = ProgressBus::new();
        for i in 0..150 {
            bus.console(format!("line {}", i));
        }
        let snap = bus.snapshot();
        assert_eq!(snap.console.len(), 100);
        assert_eq!(snap.console.first().unwrap(), "line 50");
        assert_eq!(snap.console.last().unwrap(), "line 149");
        assert_eq!(snap.console_seq, 150);
    }

    #[test]
    fn empty_console_lines_dropped() {
        let bus = ProgressBus::new();
        bus.console("   ");
        bus.console("");
        assert_eq!(bus.snapshot().console_seq, 0);
    }

    #[test]
    fn render_throttle() {
        let bus = ProgressBus::new();
        assert!(bus.should_render());
        assert!(!bus.should_render());
    }

    #[test]
    fn rename_keeps_row() {
        let bus = ProgressBus::new();
        bus.add_device("a-CAN2-25", "here4", "a-CAN2-25", DeviceKind::CanPeer);
        bus.update_device("a-CAN2-25", DeviceState::Bootloader, 90.0);
        bus.rename_device("a-CAN2-25", "a-CAN2-26", "a-CAN2-26");

        let snap = bus.snapshot();
        assert_eq!(snap.devices.len(), 1);
        assert_eq!(snap.devices["a-CAN2-26"].state, DeviceState::Bootloader);
    }

    #[test]
    fn progress_is_clamped() {
        let bus = ProgressBus::new();
        bus.add_device("x", "x", "x", DeviceKind::Cube);
        bus.update_device("x", DeviceState::Uploading, 130.0);
        assert_eq!(bus.snapshot().devices["x"].progress, 100.0);
    }
}

//! Run configuration assembled by the CLI.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct UpdaterConfig {
    /// Auto-confirm Phase A updates (non-interactive mode)
    pub auto_yes: bool,
    /// Skip the cube update phase entirely
    pub skip_cube_update: bool,
    /// Root of the firmware tree (`*.apj` bundles and per-device dirs)
    pub firmware_dir: PathBuf,
    /// Explicit Phase A port list; platform defaults when empty
    pub ports: Vec<String>,
    /// CAN bus numbers probed per adapter during Phase B discovery
    pub can_buses: Vec<u8>,
    /// Local DroneCAN node id
    pub can_node_id: u8,
    /// CAN bitrate
    pub can_bitrate: u32,
    pub baud_bootloader: u32,
    pub baud_flightstack: Vec<u32>,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        UpdaterConfig {
            auto_yes: false,
            skip_cube_update: false,
            firmware_dir: PathBuf::from("firmware"),
            ports: Vec::new(),
            // the target hardware exposes its peripherals on bus 2
            can_buses: vec![2],
            can_node_id: 100,
            can_bitrate: 1_000_000,
            baud_bootloader: 115200,
            baud_flightstack: vec![57600],
        }
    }
}

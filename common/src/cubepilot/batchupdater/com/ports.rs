//! Candidate serial port discovery.
//!
//! Autopilots show up under a known set of USB vendor names; CAN adapters
//! are the autopilot's secondary USB interface. Patterns are expanded with
//! glob on Unix-likes; Windows enumerates plain COM port names.

// Default list of port name patterns to look for autopilots
pub const AUTOPILOT_PORT_PATTERNS: &[&str] = &[
    "/dev/serial/by-id/usb-Ardu*",
    "/dev/serial/by-id/usb-3D*",
    "/dev/serial/by-id/usb-APM*",
    "/dev/serial/by-id/usb-Radio*",
    "/dev/serial/by-id/usb-*_3DR_*",
    "/dev/serial/by-id/usb-Hex_Technology_Limited*",
    "/dev/serial/by-id/usb-Hex_ProfiCNC*",
    "/dev/serial/by-id/usb-Holybro*",
    "/dev/serial/by-id/usb-mRo*",
    "/dev/serial/by-id/usb-modalFC*",
    "/dev/serial/by-id/usb-Auterion*",
    "/dev/serial/by-id/usb-*-BL_*",
    "/dev/serial/by-id/usb-*_BL_*",
    "/dev/serial/by-id/usb-Swift-Flyer*",
    "/dev/serial/by-id/usb-CubePilot*",
    "/dev/serial/by-id/usb-Qiotek*",
    "/dev/tty.usbmodem*",
];

// Patterns for the serial-tunnelled CAN adapter interface
const CAN_ADAPTER_PATTERNS_LINUX: &[&str] = &["/dev/serial/by-id/usb-*if02"];
const CAN_ADAPTER_PATTERNS_MACOS: &[&str] = &["/dev/tty.usbmodem*03"];

/// Ordered list of candidate autopilot ports for the current platform.
pub fn autopilot_ports() -> Vec<String> {
    expand(AUTOPILOT_PORT_PATTERNS)
}

/// Ordered list of candidate CAN adapter ports for the current platform.
pub fn can_adapter_ports() -> Vec<String> {
    if cfg!(target_os = "windows") {
        return windows_com_ports();
    }
    let patterns = if cfg!(target_os = "macos") {
        CAN_ADAPTER_PATTERNS_MACOS
    } else {
        CAN_ADAPTER_PATTERNS_LINUX
    };
    expand(patterns)
}

fn expand(patterns: &[&str]) -> Vec<String> {
    if cfg!(target_os = "windows") {
        return filter_for_platform(windows_com_ports(), "windows");
    }

    let mut ports = Vec::new();
    for pattern in patterns {
        if let Ok(matches) = glob::glob(pattern) {
            let mut found: Vec<String> = matches
                .filter_map(|p| p.ok())
                .map(|p| p.to_string_lossy().into_owned())
                .collect();
            found.sort();
            ports.extend(found);
        }
    }

    let os = if cfg!(target_os = "macos") {
        "macos"
    } else {
        "linux"
    };
    filter_for_platform(ports, os)
}

fn windows_com_ports() -> Vec<String> {
    (1u32..=255).map(|n| format!("COM{}", n)).collect()
}

/// Drops ports that cannot exist on the given platform.
fn filter_for_platform(ports: Vec<String>, os: &str) -> Vec<String> {
    match os {
        // OS X, don't open Windows and Linux ports
        "macos" => ports
            .into_iter()
            .filter(|p| !p.contains("COM") && !p.contains("ACM"))
            .collect(),
        // Windows, don't open POSIX ports
        "windows" => ports.into_iter().filter(|p| !p.contains('/')).collect(),
        _ => ports,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macos_filter_drops_com_and_acm() {
        let ports = vec![
            "/dev/tty.usbmodem1101".to_string(),
            "COM7".to_string(),
            "/dev/ttyACM0".to_string(),
        ];
        let filtered = filter_for_platform(ports, "macos");
        assert_eq!(filtered, vec!["/dev/tty.usbmodem1101".to_string()]);
    }

    #[test]
    fn windows_filter_drops_posix_paths() {
        let ports = vec![
            "COM3".to_string(),
            "/dev/ttyACM0".to_string(),
            "COM255".to_string(),
        ];
        let filtered = filter_for_platform(ports, "windows");
        assert_eq!(filtered, vec!["COM3".to_string(), "COM255".to_string()]);
    }

    #[test]
    fn windows_com_range_is_1_to_255() {
        let ports = windows_com_ports();
        assert_eq!(ports.len(), 255);
        assert_eq!(ports.first().unwrap(), "COM1");
        assert_eq!(ports.last().unwrap(), "COM255");
    }
}

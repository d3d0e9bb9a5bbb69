// Defininition of modules ------------------------------------------------------------------------

pub mod bootloader;
pub mod com;
pub mod config;
pub mod cube;
pub mod dronecan;
pub mod firmware;
pub mod orchestrator;
pub mod progress;

// Error ------------------------------------------------------------------------------------------

///
/// Batch updater error enumeration.
///
/// Per-device errors never abort the fleet: workers surface one of these,
/// the device row is marked failed and the remaining devices continue.
///
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Serial or CAN transport failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port driver error
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Timed out waiting for data from the bootloader
    #[error("timeout waiting for data ({0} bytes)")]
    ProtocolTimeout(usize),

    /// Bootloader answered with something other than INSYNC/OK
    #[error("bootloader out of sync: {0}")]
    ProtocolDesync(String),

    /// Bootloader protocol revision outside the supported 2..=5 range
    #[error("unsupported bootloader protocol revision {0}")]
    UnsupportedBootloader(u32),

    /// Firmware board id does not match the board and no compatibility entry applies
    #[error("firmware not suitable for this board (board_type={board_type}, firmware board_id={board_id})")]
    IncompatibleBoard { board_type: u32, board_id: u32 },

    /// Firmware image exceeds the board's flash capacity
    #[error("firmware image is too large for this board")]
    ImageTooLarge,

    /// Programmed flash contents do not match the firmware image
    #[error("verification failed: {0}")]
    VerifyFailed(String),

    /// CAN peer went silent during an update
    #[error("peer {0} timed out")]
    PeerTimeout(String),

    /// A per-stage deadline of the CAN update sequence was reached
    #[error("update stage '{stage}' timed out after {seconds} s")]
    UpdateTimeout { stage: &'static str, seconds: u64 },

    /// Malformed .apj firmware bundle
    #[error("invalid firmware bundle {path}: {reason}")]
    BundleParse { path: String, reason: String },

    /// Cooperative stop requested
    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;

// ProgressUpdate ---------------------------------------------------------------------------------

///
/// Progress events emitted by the bootloader client during an upload.
///
/// The uploader is a library and stays UI-agnostic: callers install a
/// callback and map these events onto whatever display they drive.
///
pub enum ProgressUpdate {
    Message(String),
    EraseProgress { percent: f32 },
    ExtfEraseProgress { percent: f32 },
    ProgramProgress { current: usize, total: usize },
    ExtfProgramProgress { current: usize, total: usize },
    VerifyProgress { percent: f32 },
}

pub type ProgressFn = Box<dyn Fn(ProgressUpdate) + Send>;

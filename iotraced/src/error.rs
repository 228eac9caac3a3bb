use thiserror::Error;

/// Error taxonomy surfaced to the control plane and logged at the daemon's
/// boundary. Each variant maps to one of the failure classes the tracer can
/// raise: load-time environment checks, device/session bookkeeping, and
/// runtime ring/sink faults.
#[derive(Debug, Error)]
pub enum IoTraceError {
    #[error("insufficient capabilities: {0}")]
    InsufficientCapabilities(String),

    #[error("unsupported kernel version: {0}")]
    UnsupportedKernel(String),

    #[error("eBPF load failed: {0}")]
    EbpfLoad(String),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("device registry full (max {max})")]
    DeviceRegistryFull { max: usize },

    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("ring buffer fault on cpu {cpu}: {reason}")]
    RingFault { cpu: usize, reason: String },

    #[error("sink write failed: {0}")]
    SinkWrite(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

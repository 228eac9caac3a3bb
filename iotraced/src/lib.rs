pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod registry;
pub mod ring;
pub mod session;

pub use config::Config;
pub use error::IoTraceError;
pub use metrics::Metrics;
pub use registry::{DeviceRegistry, TracedDevice};
pub use session::{TraceManager, TraceSummary};

pub mod boot_guard;
pub mod chart;
pub mod config;
pub mod display;
pub mod error_log;
pub mod monitor;
pub mod probe;
pub mod types;

pub use boot_guard::{BootDecision, BootGuard};
pub use chart::{render_chart, ChartConfig, ChartError, SensorSeries};
pub use config::{CollectorConfig, MonitorConfig, NetworkConfig, ProbeLabel, RuntimeConfig};
pub use display::DisplayPage;
pub use error_log::{ErrorEntry, ErrorLog};
pub use monitor::{MonitorAction, MonitorEngine};
pub use probe::{ProbeFault, SensorInfo};
pub use types::{BootCounters, ErrorKind, MonitorStatus, ReportPayload, ReportReading, SendOutcome};

// ABOUTME: Core of subvisor: supervises worker processes and broadcasts their telemetry.
// ABOUTME: Registry, wire records, metric store, monitor, supervisor, broadcaster and config.

pub mod broadcast;
pub mod config;
pub mod error;
pub mod event;
pub mod metrics;
pub mod monitor;
pub mod process;
pub mod registry;
pub mod scaffold;
pub mod supervisor;
pub mod wire;

pub use broadcast::{Broadcaster, Subscription};
pub use config::Config;
pub use error::{ScaffoldError, SupervisorError, WireError};
pub use event::{Event, Status};
pub use metrics::{MetricReading, MetricStore, MetricWriter};
pub use monitor::OutputMonitor;
pub use process::{ChildProcess, LaunchSpec, ManagedProcess, ProcessOutput};
pub use registry::{Category, Descriptor, MetricSpec, Registry, Threshold};
pub use scaffold::Scaffolder;
pub use supervisor::{Action, ProcessSupervisor, SubprocessInfo, SupervisorOptions};
pub use wire::{MetricsRecord, WireRecord};

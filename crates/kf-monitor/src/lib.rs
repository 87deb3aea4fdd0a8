//! # kf-monitor
//!
//! Background supervision of external worker processes.
//!
//! - **[`ProcessRegistry`]** -- the set of [`TrackedProcess`]es currently
//!   running; stages insert through an RAII [`TrackingGuard`], the monitor
//!   removes on forced restart. Removal is always idempotent.
//! - **[`ProcessMetrics`]** -- CPU sampling strategy, chosen once by
//!   [`select_metrics`]: procfs when available, `ps` otherwise.
//! - **[`StallMonitor`]** -- periodic scan that terminates processes
//!   classified as stalled by [`StallPolicy`]. It never relaunches anything.

pub mod metrics;
pub mod registry;
pub mod stall;

pub use metrics::{select_metrics, ProcessMetrics, ProcessSample, ProcfsMetrics, PsMetrics};
pub use registry::{ProcessKind, ProcessRegistry, TrackedProcess, TrackingGuard};
pub use stall::{terminate, MonitorTask, StallMonitor, StallPolicy, StallReport, Termination};

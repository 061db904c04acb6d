//! Sinks: render targets and taps.

#[cfg(feature = "cpal_io")]
mod line_out;
mod monitor;
mod null_out;

#[cfg(feature = "cpal_io")]
pub use line_out::LineOut;
pub use monitor::{Monitor, MonitorReader, MAX_MONITOR_CHANNELS};
pub use null_out::NullOutput;

//! Threaded processing chains.
//!
//! A [`Pipe`] connects [`Processor`]s (sources, filters and sinks) with
//! bounded buffers and runs each of them on its own thread. Stages share a
//! [`ProcessingContext`]; stopping the first stage shuts the whole chain down
//! in order, without losing buffered items.

pub mod context;
pub mod error;
pub mod link;
pub mod params;
pub mod pipe;
pub mod processor;
pub mod stats;
pub mod status;

pub use context::{ContextDep, ProcessingContext};
pub use error::{AnyItem, Interrupt, PipeError, Result};
pub use link::{ItemType, Outlet, Stage, DEFAULT_BUFFER_CAPACITY, POLL_INTERVAL};
pub use params::Params;
pub use pipe::{Pipe, StopHandle};
pub use processor::{AttachedProcess, Flow, Processor};
pub use stats::{Average, Stat, StatFunction, Stats, StatsReader, StatsWriter, StatsWriterConfig, Sum, TimeInterval};
pub use status::{Status, StatusCell};

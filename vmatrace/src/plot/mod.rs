//! Plot events and the sinks that consume them
//!
//! The replay engine reports what it sees as [`PlotEvent`]s to a
//! [`PlotEventSink`]; it never decides how plots look. [`SeriesCollector`]
//! turns events into per-application series files, [`EventLog`] keeps them
//! verbatim.

pub mod event;
pub mod series;
pub mod sink;

pub use event::PlotEvent;
pub use series::{PlotKind, SeriesCollector};
pub use sink::{EventLog, PlotEventSink};

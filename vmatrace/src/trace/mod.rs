//! Trace input: line grammar, payload grammars and seekable streams

pub mod line;
pub mod payload;
pub mod stream;

pub use line::{EventLine, LineParser, StackBegin, StackEntry, TraceLine};
pub use payload::{
    EventFamily, MmapEvent, MmapPayload, PayloadParser, PteMappedPayload, RssStatPayload,
    SchedSwitchPayload, classify_event,
};
pub use stream::{FileStream, MemoryStream, StreamPos, TraceStream};

use super::event::PlotEvent;
use crate::domain::Tgid;

/// Receiver of plot events.
///
/// `appname` is the plot label of the process's group: `--app` when given,
/// otherwise the group root's `<name>-<tgid>`.
pub trait PlotEventSink {
    fn consume(&mut self, event: &PlotEvent, tgid: Tgid, appname: &str);
}

impl<T: PlotEventSink + ?Sized> PlotEventSink for &mut T {
    fn consume(&mut self, event: &PlotEvent, tgid: Tgid, appname: &str) {
        (**self).consume(event, tgid, appname);
    }
}

/// Records every event, in order
#[derive(Debug, Default)]
pub struct EventLog {
    pub events: Vec<(PlotEvent, Tgid, String)>,
}

impl EventLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Events of one process, in order
    pub fn for_tgid(&self, tgid: Tgid) -> impl Iterator<Item = &PlotEvent> {
        self.events.iter().filter(move |(_, t, _)| *t == tgid).map(|(e, _, _)| e)
    }
}

impl PlotEventSink for EventLog {
    fn consume(&mut self, event: &PlotEvent, tgid: Tgid, appname: &str) {
        self.events.push((event.clone(), tgid, appname.to_string()));
    }
}

use crossbeam::channel::{Receiver, Sender};

use crate::{node::NodeId, util::Rect};

/// Notifications strokes send to whoever drives them, eg. a tool drawing handles.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StrokeEvent {
    /// The stroke found nothing to work on.
    StartedEmpty,
    /// Image-space bounds of what the stroke is about to change.
    HandlesRectCalculated(Rect),
    /// Nodes chosen by a pick-under-cursor gesture.
    LayersPicked(Vec<NodeId>),
}

/// Sending half of a stroke event channel. Events sent without a listener are discarded.
#[derive(Clone, Debug, Default)]
pub struct EventSink {
    sender: Option<Sender<StrokeEvent>>,
}
impl EventSink {
    #[must_use]
    pub fn channel() -> (Self, Receiver<StrokeEvent>) {
        let (sender, receiver) = crossbeam::channel::unbounded();
        (
            Self {
                sender: Some(sender),
            },
            receiver,
        )
    }
    /// A sink with no listener.
    #[must_use]
    pub fn disconnected() -> Self {
        Self::default()
    }
    pub fn emit(&self, event: StrokeEvent) {
        let Some(sender) = &self.sender else {
            return;
        };
        if let Err(err) = sender.send(event) {
            log::trace!("stroke event {:?} had no listener", err.into_inner());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    #[test]
    fn events_arrive_in_order() {
        let (sink, events) = EventSink::channel();
        sink.emit(StrokeEvent::StartedEmpty);
        sink.clone().emit(StrokeEvent::HandlesRectCalculated(Rect::new(0, 0, 1, 1)));
        let got: Vec<_> = events.try_iter().collect();
        assert_eq!(
            got,
            [
                StrokeEvent::StartedEmpty,
                StrokeEvent::HandlesRectCalculated(Rect::new(0, 0, 1, 1))
            ]
        );
        drop(events);
        // Dropped listener is not an error.
        sink.emit(StrokeEvent::StartedEmpty);
        EventSink::disconnected().emit(StrokeEvent::StartedEmpty);
    }
}

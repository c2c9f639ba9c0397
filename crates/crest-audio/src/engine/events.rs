//! Playback event notification
//!
//! Control-side observers subscribe with a callback and receive playback
//! state changes. Events are emitted from non-realtime threads only (the
//! fill thread and control threads); the audio callback never emits.

use std::sync::Mutex;

use crate::model::ModelId;

/// Events emitted by the play source
#[derive(Debug, Clone, PartialEq)]
pub enum PlaySourceEvent {
    /// Playback started (true) or stopped (false)
    PlayStatusChanged(bool),

    /// The set of playable models or their buffers changed
    ModelReplaced,

    /// A model was rejected because its rate differs from the adopted one
    SampleRateMismatch { requested: u32, available: u32 },

    /// Every model has been fully played out and the buffers have drained
    PlaybackEnded,

    /// A synth plugin exceeded its CPU budget and was disabled
    PluginOverloaded { model: ModelId },
}

type Subscriber = Box<dyn Fn(&PlaySourceEvent) + Send>;

/// Observer list for play source events
pub struct EventDispatcher {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register a callback for all subsequent events
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&PlaySourceEvent) + Send + 'static,
    {
        self.subscribers.lock().unwrap().push(Box::new(callback));
    }

    /// Deliver an event to every subscriber
    ///
    /// Non-realtime threads only.
    pub fn emit(&self, event: PlaySourceEvent) {
        let subscribers = self.subscribers.lock().unwrap();
        for callback in subscribers.iter() {
            callback(&event);
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_subscribers_receive_events() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let seen_a = seen.clone();
        dispatcher.subscribe(move |ev| {
            if matches!(ev, PlaySourceEvent::PlayStatusChanged(true)) {
                seen_a.fetch_add(1, Ordering::SeqCst);
            }
        });
        let seen_b = seen.clone();
        dispatcher.subscribe(move |_| {
            seen_b.fetch_add(10, Ordering::SeqCst);
        });

        dispatcher.emit(PlaySourceEvent::PlayStatusChanged(true));
        assert_eq!(seen.load(Ordering::SeqCst), 11);

        dispatcher.emit(PlaySourceEvent::ModelReplaced);
        assert_eq!(seen.load(Ordering::SeqCst), 21);
    }
}

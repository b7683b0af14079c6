use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{Event, Subject};

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for committed changes, one channel per subject.
pub struct NotifyHub {
    channels: DashMap<Subject, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to changes on a subject. Creates the channel if needed.
    pub fn subscribe(&self, subject: Subject) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(subject)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification to the event's subject. No-op if nobody is listening.
    pub fn send(&self, event: &Event) {
        let subject = event.subject();
        let Some(sender) = self.channels.get(&subject) else {
            return;
        };
        if sender.send(event.clone()).is_err() {
            // Every receiver is gone.
            drop(sender);
            self.channels
                .remove_if(&subject, |_, tx| tx.receiver_count() == 0);
        }
    }

    pub fn send_all(&self, events: &[Event]) {
        for event in events {
            self.send(event);
        }
    }
}

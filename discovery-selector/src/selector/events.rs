//! Change-notification surface.
//!
//! Each selector owns its emitter; consumers subscribe directly to the
//! instance. There is no ambient event bus.

use std::sync::Mutex;

use async_channel::{Receiver, Sender};
use url::Url;

/// Publishes the new endpoint whenever the active selection changes.
#[derive(Debug, Default)]
pub(crate) struct EventEmitter {
    subscribers: Mutex<Vec<Sender<Url>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener. Dropping the receiver unsubscribes it.
    pub fn subscribe(&self) -> Receiver<Url> {
        let (sender, receiver) = async_channel::unbounded();
        self.subscribers()
            .push(sender);
        receiver
    }

    pub fn emit(&self, endpoint: &Url) {
        // try_send on an unbounded channel only fails when the receiver is
        // gone; prune those subscribers as we go.
        self.subscribers()
            .retain(|sender| sender.try_send(endpoint.clone()).is_ok());
    }

    fn subscribers(&self) -> std::sync::MutexGuard<'_, Vec<Sender<Url>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

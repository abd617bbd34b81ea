// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Fire-and-forget job-outcome events for UI and notification layers.
//!
//! Delivery is via an explicit subscription list rather than a global event
//! bus; subscribers that went away are dropped on the next emit.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::identifiers::{JobId, OutboxMessageId, RecipientId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
    MessageSent {
        message_id: OutboxMessageId,
    },
    MessageFailed {
        message_id: OutboxMessageId,
    },
    IdentityMismatch {
        message_id: OutboxMessageId,
        recipient: RecipientId,
    },
    JobFailed {
        job_id: JobId,
        factory_key: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct EventSink {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<OutboundEvent>>>>,
}

impl EventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<OutboundEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .expect("poisoned event sink lock")
            .push(tx);
        rx
    }

    pub fn emit(&self, event: OutboundEvent) {
        let mut subscribers = self.subscribers.lock().expect("poisoned event sink lock");
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let sink = EventSink::new();
        let rx = sink.subscribe();
        let mut kept = sink.subscribe();
        drop(rx);

        let message_id = OutboxMessageId::random();
        sink.emit(OutboundEvent::MessageSent { message_id });

        assert_eq!(
            kept.recv().await,
            Some(OutboundEvent::MessageSent { message_id })
        );
        assert_eq!(sink.subscribers.lock().unwrap().len(), 1);
    }
}

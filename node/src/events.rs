// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use oip_record_data::did::{Did, RecordStorage};
use tokio::sync::broadcast;

/// Capacity of each consumer's event queue. A consumer that falls further
/// behind than this loses the oldest events, never the newest, and is told
/// how many it lost.
const CONSUMER_QUEUE_CAPACITY: usize = 256;

/// A record lifecycle notification emitted by the indexer.
#[derive(Debug, Clone)]
pub enum RecordEvent {
    Committed {
        did: Did,
        record_type: String,
        storage: RecordStorage,
    },
    Deleted {
        did: Did,
    },
    TemplateCommitted {
        did: Did,
        name: String,
    },
}

/// Multi-consumer fanout of [`RecordEvent`]s.
///
/// Every subscriber owns its bounded queue; the bus itself never buffers
/// for its slowest consumer, so consumer lifetime does not pin event
/// memory.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RecordEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CONSUMER_QUEUE_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecordEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: RecordEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

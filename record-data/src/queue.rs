// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use async_channel::{Receiver, Sender, TrySendError};

/// AsyncQueue is a thin wrapper of async_channel.
///
/// A bounded queue blocks its producer when full, which is the only
/// backpressure mechanism between the stream readers and the indexer.
#[derive(Clone)]
pub struct AsyncQueue<M: Clone> {
    receiver: Receiver<M>,
    sender: Sender<M>,
    label: &'static str,
}

impl<M: Clone> AsyncQueue<M> {
    pub fn bounded(capacity: usize, label: &'static str) -> Self {
        let (sender, receiver) = async_channel::bounded(capacity);
        Self {
            receiver,
            sender,
            label,
        }
    }

    pub fn unbounded(label: &'static str) -> Self {
        let (sender, receiver) = async_channel::unbounded();
        Self {
            receiver,
            sender,
            label,
        }
    }

    pub fn send(&self, msg: M) -> async_channel::Send<'_, M> {
        self.sender.send(msg)
    }

    pub fn try_send(&self, msg: M) -> Result<(), TrySendError<M>> {
        self.sender.try_send(msg)
    }

    pub fn recv(&self) -> async_channel::Recv<'_, M> {
        self.receiver.recv()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn label(&self) -> &'static str {
        self.label
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_capacity_is_enforced() {
        let queue: AsyncQueue<u32> = AsyncQueue::bounded(2, "test");
        queue.try_send(1).unwrap();
        queue.try_send(2).unwrap();
        assert!(matches!(queue.try_send(3), Err(TrySendError::Full(3))));
        assert_eq!(queue.len(), 2);
    }
}

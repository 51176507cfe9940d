// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::config::ChannelConfiguration;
use crate::Tick;
use log::trace;
use std::collections::VecDeque;

/// Capacity-bounded FIFO pipe with a fixed delay.
///
/// A word sent at time `t` becomes visible to the receiver at `t + delay`.
/// The sender must check [`Channel::has_capacity`] first; a full channel
/// blocks it.
#[derive(Clone, Debug)]
pub struct Channel<T> {
    /// Words in flight, tagged with the time they become visible.
    buffer: VecDeque<(Tick, T)>,
    capacity: usize,
    delay: Tick,
    /// Total words that have passed through.
    transfers: usize,
}

impl<T> Channel<T> {
    pub fn new(capacity: usize, delay: Tick) -> Self {
        assert!(capacity > 0, "a channel needs room for at least one word");
        Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
            delay,
            transfers: 0,
        }
    }

    pub fn from_config(config: &ChannelConfiguration) -> Self {
        Self::new(config.capacity, config.delay)
    }

    pub fn has_capacity(&self) -> bool {
        self.buffer.len() < self.capacity
    }

    pub fn occupancy(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn transfers(&self) -> usize {
        self.transfers
    }

    pub fn send(&mut self, now: Tick, item: T) {
        assert!(self.has_capacity(), "May not send into a full channel.");
        self.buffer.push_back((now + self.delay, item));
        trace!(
            "channel send at {}, occupancy: {}/{}",
            now,
            self.buffer.len(),
            self.capacity
        );
    }

    /// The head of the channel, if it has arrived by `now`.
    pub fn peek(&self, now: Tick) -> Option<&T> {
        match self.buffer.front() {
            Some((ready_at, item)) if *ready_at <= now => Some(item),
            _ => None,
        }
    }

    pub fn receive(&mut self, now: Tick) -> Option<T> {
        if self.peek(now).is_none() {
            return None;
        }
        self.transfers += 1;
        self.buffer.pop_front().map(|(_, item)| item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_after_delay_in_order() {
        let mut channel = Channel::new(4, 2);
        channel.send(0, 'a');
        channel.send(1, 'b');
        assert_eq!(channel.receive(0), None);
        assert_eq!(channel.receive(1), None);
        assert_eq!(channel.peek(2), Some(&'a'));
        assert_eq!(channel.receive(2), Some('a'));
        assert_eq!(channel.receive(2), None);
        assert_eq!(channel.receive(3), Some('b'));
        assert!(channel.is_empty());
        assert_eq!(channel.transfers(), 2);
    }

    #[test]
    fn full_channel_blocks() {
        let mut channel = Channel::from_config(&ChannelConfiguration {
            capacity: 2,
            delay: 0,
        });
        channel.send(0, 1);
        assert!(channel.has_capacity());
        channel.send(0, 2);
        assert!(!channel.has_capacity());
        assert_eq!(channel.occupancy(), 2);
        assert_eq!(channel.receive(0), Some(1));
        assert!(channel.has_capacity());
    }

    #[test]
    #[should_panic(expected = "full channel")]
    fn sending_into_full_channel_panics() {
        let mut channel = Channel::new(1, 0);
        channel.send(0, ());
        channel.send(0, ());
    }
}

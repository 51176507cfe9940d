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

use crate::config::Policy;
use log::trace;
use std::collections::VecDeque;

/// Picks one of `sources` contenders per arbitration opportunity.
///
/// A grant stays outstanding until [`Arbiter::accept`] is called, and is
/// handed out again on every opportunity until then. Rotation state lives in
/// the instance, so arbiters never influence each other.
#[derive(Clone, Debug)]
pub struct Arbiter {
    sources: usize,
    policy: Policy,
    last_granted: Option<usize>,
    held: Option<usize>,
}

impl Arbiter {
    pub fn new(sources: usize, policy: Policy) -> Self {
        assert!(sources > 0, "an arbiter needs at least one source");
        Self {
            sources,
            policy,
            last_granted: None,
            held: None,
        }
    }

    pub fn round_robin(sources: usize) -> Self {
        Self::new(sources, Policy::RoundRobin)
    }

    pub fn fixed_priority(sources: usize, preferred: usize) -> Self {
        Self::new(sources, Policy::FixedPriority(preferred))
    }

    /// Start the rotation after `last`.
    pub fn with_last_granted(mut self, last: usize) -> Self {
        self.last_granted = Some(last % self.sources);
        self
    }

    pub fn sources(&self) -> usize {
        self.sources
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    pub fn last_granted(&self) -> Option<usize> {
        self.last_granted
    }

    /// The grant waiting for downstream to accept it.
    pub fn outstanding(&self) -> Option<usize> {
        self.held
    }

    /// Grant a source for which `offering` holds. Round robin scans from the
    /// source after the last grant; empty sources are skipped without
    /// consuming a rotation step.
    pub fn arbitrate<F>(&mut self, offering: F) -> Option<usize>
    where
        F: Fn(usize) -> bool,
    {
        if let Some(held) = self.held {
            if offering(held) {
                return Some(held);
            }
            self.held = None;
        }
        let grant = match self.policy {
            Policy::RoundRobin => {
                let start = self.last_granted.map_or(0, |last| last + 1);
                (0..self.sources)
                    .map(|offset| (start + offset) % self.sources)
                    .find(|&source| offering(source))
            }
            Policy::FixedPriority(preferred) => {
                if preferred < self.sources && offering(preferred) {
                    Some(preferred)
                } else {
                    (0..self.sources).find(|&source| offering(source))
                }
            }
        }?;
        trace!("arbiter: grant {} (last {:?})", grant, self.last_granted);
        self.last_granted = Some(grant);
        self.held = Some(grant);
        Some(grant)
    }

    /// Downstream consumed the outstanding grant.
    pub fn accept(&mut self) {
        self.held = None;
    }
}

/// FIFO queues merged onto one output by an [`Arbiter`].
#[derive(Clone, Debug)]
pub struct Combiner<T> {
    queues: Vec<VecDeque<T>>,
    arbiter: Arbiter,
}

impl<T> Combiner<T> {
    pub fn new(sources: usize, policy: Policy) -> Self {
        Self {
            queues: (0..sources).map(|_| VecDeque::new()).collect(),
            arbiter: Arbiter::new(sources, policy),
        }
    }

    pub fn from_arbiter(arbiter: Arbiter) -> Self {
        Self {
            queues: (0..arbiter.sources()).map(|_| VecDeque::new()).collect(),
            arbiter,
        }
    }

    pub fn offer(&mut self, source: usize, item: T) {
        self.queues[source].push_back(item);
    }

    pub fn pending(&self, source: usize) -> usize {
        self.queues[source].len()
    }

    pub fn len(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(|q| q.is_empty())
    }

    pub fn arbiter(&self) -> &Arbiter {
        &self.arbiter
    }

    /// The item that would be delivered next, without consuming it.
    pub fn peek(&mut self) -> Option<(usize, &T)> {
        let queues = &self.queues;
        let source = self.arbiter.arbitrate(|s| !queues[s].is_empty())?;
        self.queues[source].front().map(|item| (source, item))
    }

    /// Deliver the granted item if downstream is `ready`. When it is not,
    /// the grant is kept and nothing leaves its queue.
    pub fn pop(&mut self, ready: bool) -> Option<(usize, T)> {
        let queues = &self.queues;
        let source = self.arbiter.arbitrate(|s| !queues[s].is_empty())?;
        if !ready {
            return None;
        }
        let item = self.queues[source].pop_front()?;
        self.arbiter.accept();
        Some((source, item))
    }
}

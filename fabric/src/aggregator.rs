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

use crate::codec::{Payload, WireLayout};
use crate::error::ProtocolError;
use crate::{NodeId, Tick};
use bitvec::prelude::*;
use log::debug;

/// A bitmask published by an aggregator.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Publication {
    pub step: Tick,
    pub scope: NodeId,
    pub state: BitBox<usize, Lsb0>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Aggregated {
    /// The bitmask changed; this is its new value.
    Published(BitBox<usize, Lsb0>),
    /// A SIGNAL that did not change the bitmask.
    Unchanged,
    /// Not a SIGNAL for this scope; the caller forwards the word untouched.
    Passthrough,
}

/// Folds SIGNALs addressed to `scope` into a bitmask.
#[derive(Clone, Debug)]
pub struct Aggregator {
    scope: NodeId,
    state: BitVec<usize, Lsb0>,
    layout: WireLayout,
}

impl Aggregator {
    pub fn new(scope: NodeId, max_outputs: usize, layout: WireLayout) -> Self {
        Self {
            scope,
            state: BitVec::repeat(false, max_outputs),
            layout,
        }
    }

    pub fn scope(&self) -> NodeId {
        self.scope
    }

    pub fn state(&self) -> &BitSlice<usize, Lsb0> {
        &self.state
    }

    pub fn accept(
        &mut self,
        word: &BitSlice<usize, Lsb0>,
    ) -> Result<Aggregated, ProtocolError> {
        let signal = match self.layout.decode(word) {
            Ok((header, Payload::Signal(signal))) if header.target == self.scope => signal,
            _ => return Ok(Aggregated::Passthrough),
        };
        if signal.index >= self.state.len() {
            return Err(ProtocolError::SignalIndex {
                index: signal.index,
                limit: self.state.len(),
            });
        }
        if self.state[signal.index] == signal.state {
            return Ok(Aggregated::Unchanged);
        }
        self.state.set(signal.index, signal.state);
        debug!(
            "aggregator {}: bit {} <- {}",
            self.scope, signal.index, signal.state
        );
        Ok(Aggregated::Published(
            self.state.clone().into_boxed_bitslice(),
        ))
    }
}

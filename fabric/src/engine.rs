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

use crate::codec::Message;
use crate::state::NodeState;
use log::trace;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    /// Waiting for `start_cycle`.
    Capture,
    /// Executing one instruction per tick.
    Run,
}

/// The two-phase sequencer of a node.
#[derive(Clone, Debug)]
pub struct Engine {
    state: NodeState,
    phase: Phase,
    pc: usize,
    /// Output slot the next output-generating instruction feeds.
    slot: usize,
    cycle: u64,
    /// Ticks spent waiting for room for emitted SIGNALs.
    stalls: u64,
}

impl Engine {
    pub fn new(state: NodeState) -> Self {
        Self {
            state,
            phase: Phase::Capture,
            pc: 0,
            slot: 0,
            cycle: 0,
            stalls: 0,
        }
    }

    pub fn state(&self) -> &NodeState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut NodeState {
        &mut self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    /// Completed cycles.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn stalls(&self) -> u64 {
        self.stalls
    }

    /// Advance by one tick. SIGNALs for changed outputs are appended to
    /// `emitted` in mapping order.
    pub fn tick(&mut self, start_cycle: bool, emitted: &mut Vec<Message>) {
        self.tick_with(start_cycle, emitted, |_| true);
    }

    /// Like [`Engine::tick`], but an instruction whose SIGNALs `admit`
    /// refuses is not executed. The engine stays on it and retries on the
    /// next tick.
    pub fn tick_with<F>(&mut self, start_cycle: bool, emitted: &mut Vec<Message>, admit: F)
    where
        F: FnOnce(&[Message]) -> bool,
    {
        match self.phase {
            Phase::Capture => {
                if !start_cycle {
                    return;
                }
                self.state.capture();
                self.pc = 0;
                self.slot = 0;
                if self.state.instruction_count() == 0 {
                    self.finish_cycle();
                } else {
                    self.phase = Phase::Run;
                }
            }
            Phase::Run => {
                // the program may have shrunk under a CONTROL write
                let instruction = match self.state.instruction(self.pc) {
                    Some(instruction) => *instruction,
                    None => {
                        self.finish_cycle();
                        return;
                    }
                };
                let [a, b, c] = instruction.operands;
                let value = instruction.evaluate(
                    self.state.read(a),
                    self.state.read(b),
                    self.state.read(c),
                );
                let slot = self.slot;
                if instruction.generates_output && self.state.needs_publish(slot, value) {
                    let signals = self
                        .state
                        .mappings_for(slot)
                        .iter()
                        .map(|m| Message::signal(m.target, m.input, m.is_sequential, value))
                        .collect::<Vec<_>>();
                    if !signals.is_empty() && !admit(&signals) {
                        self.stalls += 1;
                        trace!("node {}: pc {} waits for output room", self.state.id(), self.pc);
                        return;
                    }
                    emitted.extend(signals);
                }
                self.state.write_register(instruction.target, value);
                if instruction.generates_output {
                    self.slot += 1;
                    self.state.record_output(slot, value);
                }
                self.pc += 1;
                if self.pc >= self.state.instruction_count() {
                    self.finish_cycle();
                }
            }
        }
    }

    fn finish_cycle(&mut self) {
        self.phase = Phase::Capture;
        self.pc = 0;
        self.cycle += 1;
        trace!("node {}: cycle {} done", self.state.id(), self.cycle);
    }
}

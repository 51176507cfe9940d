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

use crate::codec::{Header, Message, Parameter, Payload, WireLayout};
use crate::config::{MeshConfiguration, ProtocolGeneration};
use crate::error::{Error, RoutingError};
use crate::isa::{mask, InstructionLayout};
use crate::response::ResponseStrategy;
use crate::state::NodeState;
use crate::{Direction, NodeId};
use bitvec::prelude::*;
use log::debug;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Route {
    Local,
    Forward(Direction),
}

/// Dimension-ordered routing: close the row distance first, then the column
/// distance.
pub fn route(node: NodeId, target: NodeId) -> Route {
    if target.row != node.row {
        if target.row < node.row {
            Route::Forward(Direction::North)
        } else {
            Route::Forward(Direction::South)
        }
    } else if target.column != node.column {
        if target.column < node.column {
            Route::Forward(Direction::West)
        } else {
            Route::Forward(Direction::East)
        }
    } else {
        Route::Local
    }
}

/// What a node does with an inbound word.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Decision {
    Consume(Header, Payload),
    /// Send the word on unchanged.
    Forward(Direction),
}

/// Per-node consume/forward logic.
#[derive(Clone, Debug)]
pub struct Decoder {
    id: NodeId,
    rows: usize,
    columns: usize,
    layout: WireLayout,
}

impl Decoder {
    pub fn new(id: NodeId, config: &MeshConfiguration) -> Self {
        Self {
            id,
            rows: config.rows,
            columns: config.columns,
            layout: config.wire_layout(),
        }
    }

    /// Targets may name any mesh node or the egress row below the mesh.
    pub fn check_bounds(&self, target: NodeId) -> Result<(), RoutingError> {
        if target.row > self.rows || target.column >= self.columns {
            return Err(RoutingError::OutOfBounds {
                target,
                rows: self.rows,
                columns: self.columns,
            });
        }
        Ok(())
    }

    /// Only locally addressed words are fully decoded; forwarded words keep
    /// whatever payload they carry.
    pub fn decide(&self, word: &BitSlice<usize, Lsb0>) -> Result<Decision, Error> {
        let target = self.layout.peek_target(word)?;
        self.check_bounds(target)?;
        match route(self.id, target) {
            Route::Local => {
                let (header, payload) = self.layout.decode(word)?;
                Ok(Decision::Consume(header, payload))
            }
            Route::Forward(direction) => Ok(Decision::Forward(direction)),
        }
    }
}

/// Mesh-wide facts a node needs to apply a message.
pub struct DispatchContext<'a> {
    pub generation: ProtocolGeneration,
    pub instructions: InstructionLayout,
    pub egress_row: usize,
    pub control_value_bits: usize,
    pub responder: &'a dyn ResponseStrategy,
}

impl<'a> DispatchContext<'a> {
    pub fn new(config: &MeshConfiguration, responder: &'a dyn ResponseStrategy) -> Self {
        Self {
            generation: config.protocol,
            instructions: config.instruction_layout(),
            egress_row: config.rows,
            control_value_bits: config.wire_layout().control_value_bits,
            responder,
        }
    }
}

/// Apply a locally addressed payload to `state`. Reads of read-only CONTROL
/// parameters produce a response addressed to the egress row of the node's
/// column. On error the state is left untouched.
pub fn dispatch(
    state: &mut NodeState,
    payload: &Payload,
    context: &DispatchContext,
) -> Result<Option<Message>, Error> {
    match payload {
        Payload::Load(chunk) => {
            state.apply_load(chunk, context.generation, &context.instructions)?;
            Ok(None)
        }
        Payload::Signal(signal) => {
            state.apply_signal(signal)?;
            Ok(None)
        }
        Payload::Control(control) if control.is_read && control.parameter.is_writable() => {
            let value = match control.parameter {
                Parameter::LoopbackMask => state.loopback(),
                _ => state.instruction_count() as u64,
            };
            let target = NodeId::new(context.egress_row, state.id().column);
            Ok(Some(Message::control(
                target,
                control.parameter,
                value & mask(context.control_value_bits),
            )))
        }
        Payload::Control(control) => match control.parameter {
            Parameter::LoopbackMask => {
                state.set_loopback(control.value)?;
                debug!("node {}: loopback {:#b}", state.id(), control.value);
                Ok(None)
            }
            Parameter::InstructionCount => {
                state.set_instruction_count(control.value as usize)?;
                debug!("node {}: instruction count {}", state.id(), control.value);
                Ok(None)
            }
            parameter => {
                let value = context.responder.respond(parameter.code());
                let target = NodeId::new(context.egress_row, state.id().column);
                Ok(Some(Message::control(
                    target,
                    parameter,
                    value & mask(context.control_value_bits),
                )))
            }
        },
        Payload::Trace(bits) => {
            debug!("node {}: trace {:b}", state.id(), bits);
            Ok(None)
        }
    }
}

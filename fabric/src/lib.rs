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

//! Behavioral model of a mesh-connected spatial compute fabric.
//!
//! Nodes in a 2-D grid evaluate 3-operand truth-table instructions and talk
//! to each other with fixed-width wire words over capacity-bounded channels.
//! Messages are routed row first, then column, and SIGNAL traffic leaving the
//! bottom of the mesh is folded into per-column bitmasks by the aggregators.

mod aggregator;
mod arbiter;
mod channel;
mod codec;
mod config;
mod diagnostics;
mod engine;
mod error;
mod fields;
mod isa;
mod mesh;
mod node;
mod response;
mod router;
mod sim;
mod state;
mod topology;
mod vcd;

use bitvec::prelude::*;

pub use aggregator::{Aggregated, Aggregator, Publication};
pub use arbiter::{Arbiter, Combiner};
pub use channel::Channel;
pub use codec::{
    Command, ControlPayload, Header, LoadChunk, Message, Parameter, Payload, SignalPayload,
    WireLayout,
};
pub use config::{
    ArbitrationConfiguration, ChannelConfiguration, EgressConfiguration, MeshConfiguration,
    NodeConfiguration, Policy, ProtocolGeneration, TargetSelection,
};
pub use diagnostics::{DiagnosticSink, DropLog, DropReport};
pub use engine::{Engine, Phase};
pub use error::{AddressError, Error, ErrorKind, OverflowError, ProtocolError, RoutingError};
pub use isa::{Instruction, InstructionLayout, Operand};
pub use mesh::{Mesh, RouteEvent};
pub use node::{Direction, NodeId};
pub use response::{DeviceParameters, ResponseStrategy};
pub use router::{dispatch, route, Decision, Decoder, DispatchContext, Route};
pub use sim::SimulationCallbacks;
pub use state::{NodeState, OutputMapping};
pub use topology::Topology;
pub use crate::vcd::{VcdComponent, VcdWriter};

/// Simulation time, in propagation-delay units.
pub type Tick = usize;

/// A wire word. Fields are laid out most-significant first.
pub type Word = BitBox<usize, Lsb0>;

/// Number of bits needed to represent `value`; zero needs no bits.
pub fn bit_size(value: usize) -> usize {
    (usize::BITS - value.leading_zeros()) as usize
}

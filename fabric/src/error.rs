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

use crate::NodeId;
use std::fmt;

/// A wire word that does not decode into a known message shape.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProtocolError {
    UnknownCommand(u64),
    UnknownParameter(u64),
    /// The word is not as wide as the configured wire layout.
    WidthMismatch { expected: usize, actual: usize },
    /// A segmented LOAD was encoded for a mesh running the direct generation.
    GenerationMismatch,
    /// A value does not fit the field it is encoded into.
    FieldOverflow { field: &'static str, value: u64, width: usize },
    /// A SIGNAL addressed to an aggregator names an index past its bitmask.
    SignalIndex { index: usize, limit: usize },
    /// Header command and payload shape disagree.
    PayloadMismatch,
}

/// An instruction or mapping that references something the node does not have.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AddressError {
    Operand { operand: usize, index: usize, limit: usize },
    TargetRegister { index: usize, limit: usize },
    Instructions { count: usize, capacity: usize },
    Mappings { count: usize, capacity: usize },
    OutputSlots { count: usize, capacity: usize },
    MappingTarget(NodeId),
    MappingInput { target: NodeId, index: usize, limit: usize },
    Node(NodeId),
}

/// A message whose target lies outside the mesh (and the egress row).
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RoutingError {
    OutOfBounds { target: NodeId, rows: usize, columns: usize },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum OverflowError {
    LoopbackMask { mask: u64, inputs: usize },
    InstructionCount { count: usize, capacity: usize },
    /// A configuration dimension that is zero or too wide to represent.
    Dimension { name: &'static str, value: usize },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Error {
    Protocol(ProtocolError),
    Address(AddressError),
    Routing(RoutingError),
    Overflow(OverflowError),
    /// The mesh did not quiesce within the step budget.
    Stalled { steps: usize },
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ErrorKind {
    Protocol,
    Address,
    Routing,
    Overflow,
    Stalled,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Address(_) => ErrorKind::Address,
            Self::Routing(_) => ErrorKind::Routing,
            Self::Overflow(_) => ErrorKind::Overflow,
            Self::Stalled { .. } => ErrorKind::Stalled,
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::UnknownCommand(c) => write!(f, "unknown command {:#x}", c),
            Self::UnknownParameter(p) => write!(f, "unknown control parameter {:#x}", p),
            Self::WidthMismatch { expected, actual } => {
                write!(f, "word is {} bits wide, expected {}", actual, expected)
            }
            Self::FieldOverflow {
                field,
                value,
                width,
            } => write!(f, "{} value {:#x} does not fit {} bits", field, value, width),
            Self::SignalIndex { index, limit } => {
                write!(f, "signal index {} out of range 0..{}", index, limit)
            }
            _ => write!(f, "{:?}", self),
        }
    }
}

impl fmt::Display for AddressError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Operand {
                operand,
                index,
                limit,
            } => write!(
                f,
                "operand {} index {} out of range 0..{}",
                operand, index, limit
            ),
            Self::TargetRegister { index, limit } => {
                write!(f, "target register {} out of range 0..{}", index, limit)
            }
            Self::Instructions { count, capacity } => {
                write!(f, "{} instructions exceed capacity {}", count, capacity)
            }
            Self::Mappings { count, capacity } => {
                write!(f, "{} output mappings exceed capacity {}", count, capacity)
            }
            Self::OutputSlots { count, capacity } => {
                write!(f, "{} output slots exceed {} outputs", count, capacity)
            }
            Self::MappingTarget(target) => {
                write!(f, "mapping target {} is not addressable", target)
            }
            Self::MappingInput {
                target,
                index,
                limit,
            } => write!(
                f,
                "mapping into {} names input {} out of range 0..{}",
                target, index, limit
            ),
            Self::Node(id) => write!(f, "no node at {}", id),
        }
    }
}

impl fmt::Display for RoutingError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::OutOfBounds {
                target,
                rows,
                columns,
            } => write!(
                f,
                "target {} outside of {}x{} mesh",
                target, rows, columns
            ),
        }
    }
}

impl fmt::Display for OverflowError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::LoopbackMask { mask, inputs } => {
                write!(f, "loopback mask {:#b} wider than {} inputs", mask, inputs)
            }
            Self::InstructionCount { count, capacity } => {
                write!(f, "instruction count {} exceeds capacity {}", count, capacity)
            }
            Self::Dimension { name, value } => write!(f, "invalid {}: {}", name, value),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Protocol(e) => write!(f, "ERROR: protocol: {}", e),
            Self::Address(e) => write!(f, "ERROR: address: {}", e),
            Self::Routing(e) => write!(f, "ERROR: routing: {}", e),
            Self::Overflow(e) => write!(f, "ERROR: overflow: {}", e),
            Self::Stalled { steps } => write!(f, "ERROR: mesh still busy after {} steps", steps),
        }
    }
}

impl std::error::Error for Error {}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<AddressError> for Error {
    fn from(e: AddressError) -> Self {
        Self::Address(e)
    }
}

impl From<RoutingError> for Error {
    fn from(e: RoutingError) -> Self {
        Self::Routing(e)
    }
}

impl From<OverflowError> for Error {
    fn from(e: OverflowError) -> Self {
        Self::Overflow(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_and_messages() {
        let e: Error = ProtocolError::UnknownCommand(5).into();
        assert_eq!(e.kind(), ErrorKind::Protocol);
        assert_eq!(e.to_string(), "ERROR: protocol: unknown command 0x5");

        let e: Error = RoutingError::OutOfBounds {
            target: NodeId::new(7, 1),
            rows: 4,
            columns: 4,
        }
        .into();
        assert_eq!(e.kind(), ErrorKind::Routing);
        assert_eq!(e.to_string(), "ERROR: routing: target (7, 1) outside of 4x4 mesh");

        let e: Error = OverflowError::LoopbackMask {
            mask: 0b10000,
            inputs: 4,
        }
        .into();
        assert_eq!(e.kind(), ErrorKind::Overflow);
        assert_eq!(Error::Stalled { steps: 3 }.kind(), ErrorKind::Stalled);
    }
}

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

use crate::codec::WireLayout;
use crate::error::{Error, OverflowError};
use crate::isa::InstructionLayout;
use crate::Tick;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Number of inbound sources of a node: the four compass ports plus ingress.
pub const INBOUND_SOURCES: usize = 5;

/// Sources of an output combiner: forwarded traffic first, local second.
pub const COMBINER_SOURCES: usize = 2;

/// Which wire encoding the mesh speaks.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum ProtocolGeneration {
    /// A LOAD carries one full instruction word.
    Direct,
    /// A LOAD carries `segment_width` bits of an instruction plus a `last` flag.
    Segmented { segment_width: usize },
}

/// How words leaving the bottom row pick an aggregator.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum TargetSelection {
    /// Column `c` feeds aggregator `c`.
    Column,
    /// Any aggregator, drawn from a seeded generator.
    Random { seed: u64 },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum Policy {
    RoundRobin,
    /// Always prefer the given source, fall back to index order.
    FixedPriority(usize),
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ArbitrationConfiguration {
    /// Merges the north/east/south/west ports and ingress.
    pub inbound: Policy,
    /// Merges forwarded and locally originated traffic on each output port.
    pub combine: Policy,
}

impl Default for ArbitrationConfiguration {
    fn default() -> Self {
        Self {
            inbound: Policy::RoundRobin,
            combine: Policy::RoundRobin,
        }
    }
}

/// Capacities of a single node.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct NodeConfiguration {
    pub registers: usize,
    pub inputs: usize,
    pub outputs: usize,
    pub instruction_capacity: usize,
    pub mapping_capacity: usize,
    /// Time a forwarded word spends inside the node before it may leave.
    pub processing_delay: Tick,
    pub arbitration: ArbitrationConfiguration,
}

impl Default for NodeConfiguration {
    fn default() -> Self {
        Self {
            registers: 16,
            inputs: 4,
            outputs: 16,
            instruction_capacity: 64,
            mapping_capacity: 64,
            processing_delay: 1,
            arbitration: ArbitrationConfiguration::default(),
        }
    }
}

#[derive(Copy, Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ChannelConfiguration {
    /// Words a channel holds before it blocks the sender.
    pub capacity: usize,
    /// Time between a send and the word becoming visible at the receiver.
    pub delay: Tick,
}

impl Default for ChannelConfiguration {
    fn default() -> Self {
        Self {
            capacity: 4,
            delay: 1,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct EgressConfiguration {
    /// Width of each aggregator's bitmask.
    pub max_outputs: usize,
    pub selection: TargetSelection,
}

impl Default for EgressConfiguration {
    fn default() -> Self {
        Self {
            max_outputs: 32,
            selection: TargetSelection::Column,
        }
    }
}

/// Parameters of a whole mesh.
///
/// Constructed programmatically or read from a YAML file.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct MeshConfiguration {
    pub rows: usize,
    pub columns: usize,
    pub identity: u16,
    pub version: u16,
    pub counter_width: usize,
    pub node: NodeConfiguration,
    pub channel: ChannelConfiguration,
    pub protocol: ProtocolGeneration,
    pub egress: EgressConfiguration,
}

impl Default for MeshConfiguration {
    fn default() -> Self {
        Self {
            rows: 4,
            columns: 4,
            identity: 0xfab,
            version: 1,
            counter_width: 32,
            node: NodeConfiguration::default(),
            channel: ChannelConfiguration::default(),
            protocol: ProtocolGeneration::Direct,
            egress: EgressConfiguration::default(),
        }
    }
}

impl MeshConfiguration {
    pub fn new(rows: usize, columns: usize) -> Self {
        Self {
            rows,
            columns,
            ..Default::default()
        }
    }

    pub fn from_file<P: AsRef<Path>>(file_name: P) -> anyhow::Result<Self> {
        let path = file_name.as_ref();
        let file = File::open(path)
            .with_context(|| format!("mesh configuration {} not found", path.display()))?;
        let config: Self = serde_yaml::from_reader(BufReader::new(file))
            .with_context(|| format!("malformed mesh configuration {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_str(config: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(config).context("malformed mesh configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn instruction_layout(&self) -> InstructionLayout {
        InstructionLayout::new(self.node.inputs, self.node.registers)
    }

    pub fn wire_layout(&self) -> WireLayout {
        WireLayout::new(self)
    }

    /// Reject dimensions the wire format or the node model cannot represent.
    pub fn validate(&self) -> Result<(), Error> {
        fn positive(name: &'static str, value: usize) -> Result<(), Error> {
            if value == 0 {
                Err(OverflowError::Dimension { name, value }.into())
            } else {
                Ok(())
            }
        }
        positive("rows", self.rows)?;
        positive("columns", self.columns)?;
        positive("registers", self.node.registers)?;
        positive("inputs", self.node.inputs)?;
        positive("outputs", self.node.outputs)?;
        positive("instruction capacity", self.node.instruction_capacity)?;
        positive("channel capacity", self.channel.capacity)?;
        // nodes step in index order; a word must not cross two links in one step
        positive("channel delay", self.channel.delay)?;
        positive("max outputs", self.egress.max_outputs)?;
        // loopback masks travel in a single CONTROL value
        if self.node.inputs > 64 {
            return Err(OverflowError::Dimension {
                name: "inputs",
                value: self.node.inputs,
            }
            .into());
        }
        if self.counter_width > 64 {
            return Err(OverflowError::Dimension {
                name: "counter width",
                value: self.counter_width,
            }
            .into());
        }
        let instruction_width = self.instruction_layout().width();
        if instruction_width > 64 {
            return Err(OverflowError::Dimension {
                name: "instruction width",
                value: instruction_width,
            }
            .into());
        }
        if let ProtocolGeneration::Segmented { segment_width } = self.protocol {
            if segment_width == 0 || segment_width > 64 {
                return Err(OverflowError::Dimension {
                    name: "segment width",
                    value: segment_width,
                }
                .into());
            }
        }
        let arbitration = &self.node.arbitration;
        if let Policy::FixedPriority(source) = arbitration.inbound {
            if source >= INBOUND_SOURCES {
                return Err(OverflowError::Dimension {
                    name: "inbound priority source",
                    value: source,
                }
                .into());
            }
        }
        if let Policy::FixedPriority(source) = arbitration.combine {
            if source >= COMBINER_SOURCES {
                return Err(OverflowError::Dimension {
                    name: "combiner priority source",
                    value: source,
                }
                .into());
            }
        }
        Ok(())
    }
}

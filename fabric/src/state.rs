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

use crate::codec::{LoadChunk, SignalPayload};
use crate::config::{MeshConfiguration, NodeConfiguration, ProtocolGeneration};
use crate::error::{AddressError, Error, OverflowError, ProtocolError};
use crate::isa::{mask, Instruction, InstructionLayout, Operand};
use crate::NodeId;
use bitvec::prelude::*;
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// One destination notified when an output slot changes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct OutputMapping {
    pub target: NodeId,
    /// Input index at a mesh node, or bit index at an aggregator.
    pub input: usize,
    pub is_sequential: bool,
}

impl OutputMapping {
    pub fn new(target: NodeId, input: usize, is_sequential: bool) -> Self {
        Self {
            target,
            input,
            is_sequential,
        }
    }
}

/// Everything a node owns: register file, double-buffered inputs, outputs,
/// instruction memory, loopback mask and the output lookup table.
#[derive(Clone, Debug)]
pub struct NodeState {
    id: NodeId,
    config: NodeConfiguration,
    registers: BitVec<usize, Lsb0>,
    inputs: BitVec<usize, Lsb0>,
    captured: BitVec<usize, Lsb0>,
    outputs: BitVec<usize, Lsb0>,
    /// Output slots that have produced at least one SIGNAL.
    emitted: BitVec<usize, Lsb0>,
    /// Inputs written by a SIGNAL since the last capture.
    triggers: BitVec<usize, Lsb0>,
    /// Sized to capacity; only the first `instruction_count` entries run.
    memory: Vec<Instruction>,
    instruction_count: usize,
    loopback: u64,
    mappings: Vec<OutputMapping>,
    output_lookup: Vec<Range<usize>>,
    /// Segmented LOAD bits received so far and how many there are.
    load_accumulator: u128,
    load_bits: usize,
    load_address: usize,
}

impl NodeState {
    pub fn new(id: NodeId, config: &NodeConfiguration) -> Self {
        Self {
            id,
            config: config.clone(),
            registers: BitVec::repeat(false, config.registers),
            inputs: BitVec::repeat(false, config.inputs),
            captured: BitVec::repeat(false, config.inputs),
            outputs: BitVec::repeat(false, config.outputs),
            emitted: BitVec::repeat(false, config.outputs),
            triggers: BitVec::repeat(false, config.inputs),
            memory: vec![Instruction::default(); config.instruction_capacity],
            instruction_count: 0,
            loopback: 0,
            mappings: Vec::new(),
            output_lookup: Vec::new(),
            load_accumulator: 0,
            load_bits: 0,
            load_address: 0,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn register(&self, index: usize) -> bool {
        self.registers[index]
    }

    pub fn registers(&self) -> &BitSlice<usize, Lsb0> {
        &self.registers
    }

    pub fn input(&self, index: usize) -> bool {
        self.inputs[index]
    }

    pub fn captured(&self) -> &BitSlice<usize, Lsb0> {
        &self.captured
    }

    pub fn output(&self, slot: usize) -> bool {
        self.outputs[slot]
    }

    pub fn outputs(&self) -> &BitSlice<usize, Lsb0> {
        &self.outputs
    }

    pub fn triggers(&self) -> &BitSlice<usize, Lsb0> {
        &self.triggers
    }

    pub fn loopback(&self) -> u64 {
        self.loopback
    }

    pub fn instruction_count(&self) -> usize {
        self.instruction_count
    }

    /// The installed program.
    pub fn instructions(&self) -> &[Instruction] {
        &self.memory[..self.instruction_count]
    }

    pub fn instruction(&self, address: usize) -> Option<&Instruction> {
        self.instructions().get(address)
    }

    /// Address the next committed LOAD writes to.
    pub fn load_address(&self) -> usize {
        self.load_address
    }

    pub fn mappings_for(&self, slot: usize) -> &[OutputMapping] {
        match self.output_lookup.get(slot) {
            Some(range) => &self.mappings[range.clone()],
            None => &[],
        }
    }

    /// Install a compiled design. Either everything is accepted or nothing
    /// changes.
    pub fn load(
        &mut self,
        mesh: &MeshConfiguration,
        instructions: &[Instruction],
        loopback: u64,
        outputs: &[Vec<OutputMapping>],
    ) -> Result<(), Error> {
        let config = &self.config;
        if instructions.len() > config.instruction_capacity {
            return Err(AddressError::Instructions {
                count: instructions.len(),
                capacity: config.instruction_capacity,
            }
            .into());
        }
        for instruction in instructions {
            instruction.validate(config.inputs, config.registers)?;
        }
        let slots = instructions.iter().filter(|i| i.generates_output).count();
        let slots = slots.max(outputs.len());
        if slots > config.outputs {
            return Err(AddressError::OutputSlots {
                count: slots,
                capacity: config.outputs,
            }
            .into());
        }
        let mapping_count: usize = outputs.iter().map(|m| m.len()).sum();
        if mapping_count > config.mapping_capacity {
            return Err(AddressError::Mappings {
                count: mapping_count,
                capacity: config.mapping_capacity,
            }
            .into());
        }
        for mapping in outputs.iter().flatten() {
            validate_mapping(mesh, mapping)?;
        }
        check_loopback(loopback, config.inputs)?;

        let mut mappings = Vec::with_capacity(mapping_count);
        let mut output_lookup = Vec::with_capacity(outputs.len());
        for slot in outputs {
            let start = mappings.len();
            mappings.extend_from_slice(slot);
            output_lookup.push(start..mappings.len());
        }
        self.memory[..instructions.len()].copy_from_slice(instructions);
        self.instruction_count = instructions.len();
        self.load_address = instructions.len() % self.config.instruction_capacity;
        self.load_accumulator = 0;
        self.load_bits = 0;
        self.loopback = loopback;
        self.mappings = mappings;
        self.output_lookup = output_lookup;
        self.registers.fill(false);
        self.outputs.fill(false);
        self.emitted.fill(false);
        debug!(
            "node {}: loaded {} instructions, {} mappings, loopback {:#b}",
            self.id,
            self.instruction_count,
            self.mappings.len(),
            self.loopback
        );
        Ok(())
    }

    /// Snapshot the inputs for the next run; looped-back inputs take the
    /// node's own output of the same index.
    pub fn capture(&mut self) {
        for index in 0..self.inputs.len() {
            let looped = index < 64 && (self.loopback >> index) & 1 == 1;
            let value = if looped {
                self.outputs.get(index).map(|b| *b).unwrap_or(false)
            } else {
                self.inputs[index]
            };
            self.captured.set(index, value);
        }
        self.triggers.fill(false);
    }

    pub(crate) fn read(&self, operand: Operand) -> bool {
        if operand.is_input {
            self.captured[operand.index]
        } else {
            self.registers[operand.index]
        }
    }

    pub(crate) fn write_register(&mut self, index: usize, value: bool) {
        self.registers.set(index, value);
    }

    /// Store an output value. Returns true when the slot has to be
    /// published: its first evaluation, or a change.
    pub(crate) fn record_output(&mut self, slot: usize, value: bool) -> bool {
        let publish = self.needs_publish(slot, value);
        if slot < self.outputs.len() {
            self.outputs.set(slot, value);
            self.emitted.set(slot, true);
        }
        publish
    }

    /// Whether storing `value` in `slot` would have to be published.
    pub(crate) fn needs_publish(&self, slot: usize, value: bool) -> bool {
        slot < self.outputs.len() && (!self.emitted[slot] || self.outputs[slot] != value)
    }

    /// Host-side write of a live input, as a SIGNAL would do.
    pub fn set_input(&mut self, index: usize, value: bool) -> Result<(), Error> {
        if index >= self.inputs.len() {
            return Err(ProtocolError::SignalIndex {
                index,
                limit: self.inputs.len(),
            }
            .into());
        }
        self.inputs.set(index, value);
        self.triggers.set(index, true);
        Ok(())
    }

    pub fn apply_signal(&mut self, signal: &SignalPayload) -> Result<(), Error> {
        self.set_input(signal.index, signal.state)?;
        trace!(
            "node {}: input {} <- {} ({})",
            self.id,
            signal.index,
            signal.state,
            if signal.is_sequential {
                "sequential"
            } else {
                "combinational"
            }
        );
        Ok(())
    }

    /// Accumulate one LOAD chunk. Returns the address written once a whole
    /// instruction has been assembled and installed. A rejected chunk leaves
    /// the partial instruction as it was.
    pub fn apply_load(
        &mut self,
        chunk: &LoadChunk,
        generation: ProtocolGeneration,
        layout: &InstructionLayout,
    ) -> Result<Option<usize>, Error> {
        let width = layout.width();
        let (word, bits) = match generation {
            ProtocolGeneration::Direct => (chunk.data as u128, width),
            ProtocolGeneration::Segmented { segment_width } => (
                (self.load_accumulator << segment_width)
                    | (chunk.data & mask(segment_width)) as u128,
                self.load_bits + segment_width,
            ),
        };
        // set bits above the instruction, or a stream that would continue
        // past it
        if word >> width != 0 || (!chunk.last && bits >= width) {
            return Err(ProtocolError::FieldOverflow {
                field: "instruction",
                value: bits as u64,
                width,
            }
            .into());
        }
        if !chunk.last {
            self.load_accumulator = word;
            self.load_bits = bits;
            return Ok(None);
        }
        let instruction = layout.from_bits(word as u64);
        instruction.validate(self.config.inputs, self.config.registers)?;
        let address = self.load_address;
        self.memory[address] = instruction;
        if address >= self.instruction_count {
            self.instruction_count = address + 1;
        }
        self.load_address = (address + 1) % self.config.instruction_capacity;
        self.load_accumulator = 0;
        self.load_bits = 0;
        debug!("node {}: installed {:?} at {}", self.id, instruction, address);
        Ok(Some(address))
    }

    pub fn set_loopback(&mut self, mask: u64) -> Result<(), Error> {
        check_loopback(mask, self.config.inputs)?;
        self.loopback = mask;
        Ok(())
    }

    pub fn set_instruction_count(&mut self, count: usize) -> Result<(), Error> {
        if count > self.config.instruction_capacity {
            return Err(OverflowError::InstructionCount {
                count,
                capacity: self.config.instruction_capacity,
            }
            .into());
        }
        self.instruction_count = count;
        Ok(())
    }
}

fn check_loopback(mask: u64, inputs: usize) -> Result<(), OverflowError> {
    let beyond = if inputs >= 64 { 0 } else { mask >> inputs };
    if beyond != 0 {
        return Err(OverflowError::LoopbackMask { mask, inputs });
    }
    Ok(())
}

fn validate_mapping(mesh: &MeshConfiguration, mapping: &OutputMapping) -> Result<(), AddressError> {
    let target = mapping.target;
    if target.column >= mesh.columns || target.row > mesh.rows {
        return Err(AddressError::MappingTarget(target));
    }
    let limit = if target.row == mesh.rows {
        mesh.egress.max_outputs
    } else {
        mesh.node.inputs
    };
    if mapping.input >= limit {
        return Err(AddressError::MappingInput {
            target,
            index: mapping.input,
            limit,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    fn mesh() -> MeshConfiguration {
        MeshConfiguration::new(4, 4)
    }

    fn state() -> NodeState {
        NodeState::new(NodeId::new(1, 1), &mesh().node)
    }

    fn copy_input(input: usize, target: usize) -> Instruction {
        // a pass-through of operand a
        Instruction::new(
            0b1111_0000,
            [
                Operand::input(input),
                Operand::register(0),
                Operand::register(0),
            ],
            target,
        )
    }

    #[test]
    fn load_builds_lookup_table() {
        let mut s = state();
        let outputs = vec![
            vec![
                OutputMapping::new(NodeId::new(0, 0), 1, false),
                OutputMapping::new(NodeId::new(2, 3), 0, true),
            ],
            vec![],
            vec![OutputMapping::new(NodeId::new(4, 1), 5, false)],
        ];
        let program = vec![copy_input(0, 0).with_output(), copy_input(1, 1)];
        s.load(&mesh(), &program, 0b0100, &outputs).unwrap();
        assert_eq!(s.instruction_count(), 2);
        assert_eq!(s.instructions(), &program[..]);
        assert_eq!(s.loopback(), 0b0100);
        assert_eq!(s.mappings_for(0).len(), 2);
        assert_eq!(s.mappings_for(0)[1].target, NodeId::new(2, 3));
        assert!(s.mappings_for(1).is_empty());
        assert_eq!(s.mappings_for(2)[0].input, 5);
        assert!(s.mappings_for(3).is_empty());
        assert_eq!(s.load_address(), 2);
    }

    #[test]
    fn rejected_loads_change_nothing() {
        let mut s = state();
        let good = vec![copy_input(0, 0)];
        s.load(&mesh(), &good, 0, &[]).unwrap();

        let mut bad_operand = copy_input(0, 0);
        bad_operand.operands[0] = Operand::input(4);
        let e = s.load(&mesh(), &[bad_operand], 0, &[]).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Address);

        let too_many = vec![copy_input(0, 0); 65];
        let e = s.load(&mesh(), &too_many, 0, &[]).unwrap_err();
        assert_eq!(
            e,
            Error::Address(AddressError::Instructions {
                count: 65,
                capacity: 64
            })
        );

        let e = s.load(&mesh(), &good, 0b1_0000, &[]).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Overflow);

        let outside = vec![vec![OutputMapping::new(NodeId::new(5, 0), 0, false)]];
        let e = s.load(&mesh(), &good, 0, &outside).unwrap_err();
        assert_eq!(e, Error::Address(AddressError::MappingTarget(NodeId::new(5, 0))));

        let bad_input = vec![vec![OutputMapping::new(NodeId::new(3, 0), 4, false)]];
        assert!(s.load(&mesh(), &good, 0, &bad_input).is_err());

        let crowded = vec![vec![OutputMapping::new(NodeId::new(0, 0), 0, false); 65]];
        assert!(s.load(&mesh(), &good, 0, &crowded).is_err());

        assert_eq!(s.instructions(), &good[..]);
        assert_eq!(s.loopback(), 0);
    }

    #[test]
    fn capture_honors_loopback() {
        let mut s = state();
        s.set_input(0, true).unwrap();
        s.set_input(1, true).unwrap();
        assert!(s.record_output(1, false));
        s.set_loopback(0b0010).unwrap();
        assert!(s.triggers()[0]);
        s.capture();
        assert!(s.captured()[0]);
        // input 1 is driven by output 1, not by the network
        assert!(!s.captured()[1]);
        assert!(!s.triggers().any());
    }

    #[test]
    fn outputs_publish_first_time_and_on_change() {
        let mut s = state();
        assert!(s.record_output(0, false));
        assert!(!s.record_output(0, false));
        assert!(s.record_output(0, true));
        assert!(!s.record_output(0, true));
        assert!(!s.record_output(99, true));
    }

    #[test]
    fn direct_load_appends_and_wraps() {
        let mut config = mesh();
        config.node.instruction_capacity = 2;
        let layout = config.instruction_layout();
        let mut s = NodeState::new(NodeId::new(0, 0), &config.node);
        let bits = layout.to_bits(&copy_input(2, 3)).unwrap();
        let chunk = LoadChunk {
            last: true,
            data: bits,
        };
        let direct = ProtocolGeneration::Direct;
        assert_eq!(s.apply_load(&chunk, direct, &layout).unwrap(), Some(0));
        assert_eq!(s.apply_load(&chunk, direct, &layout).unwrap(), Some(1));
        assert_eq!(s.instruction_count(), 2);
        assert_eq!(s.load_address(), 0);
        assert_eq!(s.apply_load(&chunk, direct, &layout).unwrap(), Some(0));
        assert_eq!(s.instruction_count(), 2);
        assert_eq!(s.instruction(1), Some(&copy_input(2, 3)));
    }

    #[test]
    fn invalid_loaded_instruction_is_rejected() {
        let config = MeshConfiguration::new(4, 4);
        let layout = config.instruction_layout();
        let mut s = state();
        // input index 9 fits the 4-bit field but not the 4 inputs
        let mut bad = copy_input(0, 0);
        bad.operands[0] = Operand::input(9);
        let chunk = LoadChunk {
            last: true,
            data: layout.to_bits(&bad).unwrap(),
        };
        let e = s
            .apply_load(&chunk, ProtocolGeneration::Direct, &layout)
            .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Address);
        assert_eq!(s.instruction_count(), 0);
        assert_eq!(s.load_address(), 0);
    }

    #[test]
    fn segmented_rejects_leave_partial_load() {
        let config = MeshConfiguration::new(4, 4);
        let layout = config.instruction_layout();
        let generation = ProtocolGeneration::Segmented { segment_width: 14 };
        let mut s = state();
        let mut bad = copy_input(0, 0);
        bad.operands[0] = Operand::input(9);
        let bits = layout.to_bits(&bad).unwrap();
        let high = LoadChunk {
            last: false,
            data: bits >> 14,
        };
        let low = LoadChunk {
            last: true,
            data: bits & 0x3fff,
        };
        assert_eq!(s.apply_load(&high, generation, &layout), Ok(None));
        let (accumulator, count) = (s.load_accumulator, s.load_bits);
        assert_eq!(count, 14);

        let e = s.apply_load(&low, generation, &layout).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Address);
        assert_eq!(s.load_accumulator, accumulator);
        assert_eq!(s.load_bits, count);
        assert_eq!(s.instruction_count(), 0);
    }

    #[test]
    fn segmented_stream_may_not_outgrow_the_instruction() {
        let config = MeshConfiguration::new(4, 4);
        let layout = config.instruction_layout();
        let generation = ProtocolGeneration::Segmented { segment_width: 14 };
        let mut s = state();
        let good = copy_input(1, 2);
        let bits = layout.to_bits(&good).unwrap();
        let chunk = |last, data| LoadChunk { last, data };

        s.apply_load(&chunk(false, bits >> 14), generation, &layout)
            .unwrap();
        // 28 bits fill the instruction, so this chunk has to be the last
        let e = s
            .apply_load(&chunk(false, bits & 0x3fff), generation, &layout)
            .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Protocol);
        assert_eq!(s.load_bits, 14);
        assert_eq!(s.instruction_count(), 0);

        // the stream is still usable after a reject
        assert_eq!(
            s.apply_load(&chunk(true, bits & 0x3fff), generation, &layout),
            Ok(Some(0))
        );
        assert_eq!(s.instruction(0), Some(&good));
        assert_eq!(s.load_bits, 0);
    }

    #[test]
    fn segmented_bits_above_the_instruction_are_rejected() {
        let config = MeshConfiguration::new(4, 4);
        let layout = config.instruction_layout();
        // three 10-bit segments carry 30 bits for a 28-bit instruction
        let generation = ProtocolGeneration::Segmented { segment_width: 10 };
        let mut s = state();
        let chunk = |last, data| LoadChunk { last, data };
        s.apply_load(&chunk(false, 0x3ff), generation, &layout)
            .unwrap();
        s.apply_load(&chunk(false, 0), generation, &layout).unwrap();
        let e = s
            .apply_load(&chunk(true, 0), generation, &layout)
            .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Protocol);
        assert_eq!(s.instruction_count(), 0);
        assert_eq!(s.load_bits, 20);
    }

    #[test]
    fn control_writes_are_bounded() {
        let mut s = state();
        assert!(s.set_instruction_count(64).is_ok());
        assert_eq!(
            s.set_instruction_count(65),
            Err(Error::Overflow(OverflowError::InstructionCount {
                count: 65,
                capacity: 64
            }))
        );
        assert_eq!(s.instruction_count(), 64);
        assert!(s.set_loopback(0b1111).is_ok());
        assert!(s.set_loopback(0b1_1111).is_err());
        assert_eq!(s.loopback(), 0b1111);
        assert!(s
            .apply_signal(&SignalPayload {
                index: 4,
                is_sequential: false,
                state: true
            })
            .is_err());
    }
}

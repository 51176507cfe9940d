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

use crate::bit_size;
use crate::error::{AddressError, ProtocolError};
use crate::fields::{FieldReader, FieldWriter};
use crate::Word;
use bitvec::prelude::*;
use serde::{Deserialize, Serialize};

const TRUTH_TABLE_BITS: usize = 8;

/// One instruction source: a captured input or a register.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct Operand {
    pub is_input: bool,
    pub index: usize,
}

impl Operand {
    pub fn input(index: usize) -> Self {
        Self {
            is_input: true,
            index,
        }
    }

    pub fn register(index: usize) -> Self {
        Self {
            is_input: false,
            index,
        }
    }
}

/// A 3-operand truth-table instruction.
///
/// The three operand values form the index `a << 2 | b << 1 | c` into
/// `truth_table`; the selected bit is written to `target`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct Instruction {
    pub truth_table: u8,
    pub operands: [Operand; 3],
    pub target: usize,
    pub generates_output: bool,
}

impl Instruction {
    pub fn new(truth_table: u8, operands: [Operand; 3], target: usize) -> Self {
        Self {
            truth_table,
            operands,
            target,
            generates_output: false,
        }
    }

    pub fn with_output(mut self) -> Self {
        self.generates_output = true;
        self
    }

    pub fn evaluate(&self, a: bool, b: bool, c: bool) -> bool {
        let index = (a as u8) << 2 | (b as u8) << 1 | c as u8;
        (self.truth_table >> index) & 1 == 1
    }

    /// Check every index against the node's input and register counts.
    pub fn validate(&self, inputs: usize, registers: usize) -> Result<(), AddressError> {
        for (operand, source) in self.operands.iter().enumerate() {
            let limit = if source.is_input { inputs } else { registers };
            if source.index >= limit {
                return Err(AddressError::Operand {
                    operand,
                    index: source.index,
                    limit,
                });
            }
        }
        if self.target >= registers {
            return Err(AddressError::TargetRegister {
                index: self.target,
                limit: registers,
            });
        }
        Ok(())
    }
}

/// Bit layout of an instruction word, derived from node capacities:
/// `[truth_table][a_is_input][a][b_is_input][b][c_is_input][c][target][generates_output]`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InstructionLayout {
    pub index_bits: usize,
    pub register_bits: usize,
}

impl InstructionLayout {
    pub fn new(inputs: usize, registers: usize) -> Self {
        let widest = inputs.max(registers).max(1);
        Self {
            index_bits: bit_size(widest - 1).max(1),
            register_bits: bit_size(registers.max(1) - 1).max(1),
        }
    }

    pub fn width(&self) -> usize {
        TRUTH_TABLE_BITS + 3 * (1 + self.index_bits) + self.register_bits + 1
    }

    pub fn encode(&self, instruction: &Instruction) -> Result<Word, ProtocolError> {
        let mut writer = FieldWriter::new(self.width());
        writer.put("truth table", TRUTH_TABLE_BITS, instruction.truth_table as u64)?;
        for operand in instruction.operands.iter() {
            writer.put_flag(operand.is_input);
            writer.put("operand", self.index_bits, operand.index as u64)?;
        }
        writer.put("target register", self.register_bits, instruction.target as u64)?;
        writer.put_flag(instruction.generates_output);
        Ok(writer.finish())
    }

    /// Decoding is total: every bit pattern of the right width is an instruction.
    pub fn decode(&self, bits: &BitSlice<usize, Lsb0>) -> Instruction {
        assert_eq!(bits.len(), self.width(), "instruction word has the wrong width");
        let mut reader = FieldReader::new(bits);
        let truth_table = reader.take(TRUTH_TABLE_BITS) as u8;
        let mut operands = [Operand::default(); 3];
        for operand in operands.iter_mut() {
            operand.is_input = reader.take_flag();
            operand.index = reader.take(self.index_bits) as usize;
        }
        let target = reader.take(self.register_bits) as usize;
        let generates_output = reader.take_flag();
        Instruction {
            truth_table,
            operands,
            target,
            generates_output,
        }
    }

    pub fn to_bits(&self, instruction: &Instruction) -> Result<u64, ProtocolError> {
        Ok(self.encode(instruction)?.load_le::<u64>())
    }

    /// Decode the low `width()` bits of `value`; higher bits are ignored.
    pub fn from_bits(&self, value: u64) -> Instruction {
        let mut bits: BitVec<usize, Lsb0> = BitVec::repeat(false, self.width());
        bits.store_le(value & mask(self.width()));
        self.decode(&bits)
    }
}

/// The low `width` bits set.
pub(crate) fn mask(width: usize) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

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
use crate::config::{MeshConfiguration, ProtocolGeneration};
use crate::error::ProtocolError;
use crate::fields::{FieldReader, FieldWriter};
use crate::{NodeId, Word};
use bitvec::prelude::*;
use std::fmt;

const COMMAND_BITS: usize = 3;
const PARAMETER_BITS: usize = 4;
/// Identity and version are 16-bit quantities.
const DEVICE_WORD_BITS: usize = 16;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Command {
    Load = 0,
    Signal = 1,
    Control = 2,
    /// Diagnostic traffic carried through the mesh but never interpreted.
    Trace = 3,
}

impl Command {
    pub fn code(self) -> u64 {
        self as u64
    }

    pub fn from_code(code: u64) -> Result<Self, ProtocolError> {
        match code {
            0 => Ok(Self::Load),
            1 => Ok(Self::Signal),
            2 => Ok(Self::Control),
            3 => Ok(Self::Trace),
            _ => Err(ProtocolError::UnknownCommand(code)),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Load => "LOAD",
            Self::Signal => "SIGNAL",
            Self::Control => "CONTROL",
            Self::Trace => "TRACE",
        };
        write!(f, "{}", name)
    }
}

/// CONTROL parameters. Everything before `LoopbackMask` is read-only.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Parameter {
    Identity = 0,
    Version = 1,
    CounterWidth = 2,
    Rows = 3,
    Columns = 4,
    NodeInputs = 5,
    NodeOutputs = 6,
    NodeRegisters = 7,
    LoopbackMask = 8,
    InstructionCount = 9,
}

impl Parameter {
    pub const ALL: [Parameter; 10] = [
        Parameter::Identity,
        Parameter::Version,
        Parameter::CounterWidth,
        Parameter::Rows,
        Parameter::Columns,
        Parameter::NodeInputs,
        Parameter::NodeOutputs,
        Parameter::NodeRegisters,
        Parameter::LoopbackMask,
        Parameter::InstructionCount,
    ];

    pub fn code(self) -> u64 {
        self as u64
    }

    pub fn from_code(code: u64) -> Result<Self, ProtocolError> {
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.code() == code)
            .ok_or(ProtocolError::UnknownParameter(code))
    }

    pub fn is_writable(self) -> bool {
        matches!(self, Self::LoopbackMask | Self::InstructionCount)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Header {
    pub target: NodeId,
    pub command: Command,
}

/// One LOAD transfer. Under the direct generation `data` is a whole
/// instruction word and `last` is always set.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LoadChunk {
    pub last: bool,
    pub data: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SignalPayload {
    pub index: usize,
    pub is_sequential: bool,
    pub state: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ControlPayload {
    pub parameter: Parameter,
    /// Ask for the parameter's value instead of writing `value`. Read-only
    /// parameters are always answered.
    pub is_read: bool,
    pub value: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Payload {
    Load(LoadChunk),
    Signal(SignalPayload),
    Control(ControlPayload),
    Trace(Word),
}

impl Payload {
    pub fn command(&self) -> Command {
        match self {
            Self::Load(_) => Command::Load,
            Self::Signal(_) => Command::Signal,
            Self::Control(_) => Command::Control,
            Self::Trace(_) => Command::Trace,
        }
    }
}

/// A decoded message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Message {
    pub target: NodeId,
    pub payload: Payload,
}

impl Message {
    pub fn new(target: NodeId, payload: Payload) -> Self {
        Self { target, payload }
    }

    pub fn signal(target: NodeId, index: usize, is_sequential: bool, state: bool) -> Self {
        Self::new(
            target,
            Payload::Signal(SignalPayload {
                index,
                is_sequential,
                state,
            }),
        )
    }

    pub fn load(target: NodeId, data: u64, last: bool) -> Self {
        Self::new(target, Payload::Load(LoadChunk { last, data }))
    }

    /// A CONTROL write, or a response carrying `value`.
    pub fn control(target: NodeId, parameter: Parameter, value: u64) -> Self {
        Self::new(
            target,
            Payload::Control(ControlPayload {
                parameter,
                is_read: false,
                value,
            }),
        )
    }

    pub fn read(target: NodeId, parameter: Parameter) -> Self {
        Self::new(
            target,
            Payload::Control(ControlPayload {
                parameter,
                is_read: true,
                value: 0,
            }),
        )
    }

    pub fn trace(target: NodeId, bits: Word) -> Self {
        Self::new(target, Payload::Trace(bits))
    }

    pub fn header(&self) -> Header {
        Header {
            target: self.target,
            command: self.payload.command(),
        }
    }
}

/// Field widths of the wire word `[row][column][command][payload]` for one
/// mesh configuration. Every word on the mesh has the same width; payloads
/// narrower than the widest shape are zero padded at the low end.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WireLayout {
    pub row_bits: usize,
    pub column_bits: usize,
    pub generation: ProtocolGeneration,
    pub instruction_bits: usize,
    pub signal_index_bits: usize,
    pub control_value_bits: usize,
    pub payload_bits: usize,
}

impl WireLayout {
    pub fn new(config: &MeshConfiguration) -> Self {
        let node = &config.node;
        let instruction_bits = config.instruction_layout().width();
        let signal_index_bits = bit_size(node.inputs.max(config.egress.max_outputs) - 1).max(1);
        let control_value_bits = [
            DEVICE_WORD_BITS,
            node.inputs,
            bit_size(node.instruction_capacity),
            bit_size(config.rows),
            bit_size(config.columns),
            bit_size(node.inputs),
            bit_size(node.outputs),
            bit_size(node.registers),
            bit_size(config.counter_width),
        ]
        .iter()
        .copied()
        .max()
        .unwrap_or(DEVICE_WORD_BITS)
        .min(64);
        let load_bits = match config.protocol {
            ProtocolGeneration::Direct => instruction_bits,
            ProtocolGeneration::Segmented { segment_width } => 1 + segment_width,
        };
        let payload_bits = load_bits
            .max(signal_index_bits + 2)
            .max(PARAMETER_BITS + 1 + control_value_bits);
        Self {
            // row `rows` is the egress row and must be encodable
            row_bits: bit_size(config.rows).max(1),
            column_bits: bit_size(config.columns - 1).max(1),
            generation: config.protocol,
            instruction_bits,
            signal_index_bits,
            control_value_bits,
            payload_bits,
        }
    }

    pub fn width(&self) -> usize {
        self.row_bits + self.column_bits + COMMAND_BITS + self.payload_bits
    }

    pub fn encode(&self, header: &Header, payload: &Payload) -> Result<Word, ProtocolError> {
        if header.command != payload.command() {
            return Err(ProtocolError::PayloadMismatch);
        }
        let mut writer = FieldWriter::new(self.width());
        writer.put("row", self.row_bits, header.target.row as u64)?;
        writer.put("column", self.column_bits, header.target.column as u64)?;
        writer.put("command", COMMAND_BITS, header.command.code())?;
        let used = match payload {
            Payload::Load(chunk) => match self.generation {
                ProtocolGeneration::Direct => {
                    if !chunk.last {
                        return Err(ProtocolError::GenerationMismatch);
                    }
                    writer.put("instruction", self.instruction_bits, chunk.data)?;
                    self.instruction_bits
                }
                ProtocolGeneration::Segmented { segment_width } => {
                    writer.put_flag(chunk.last);
                    writer.put("segment", segment_width, chunk.data)?;
                    1 + segment_width
                }
            },
            Payload::Signal(signal) => {
                writer.put("signal index", self.signal_index_bits, signal.index as u64)?;
                writer.put_flag(signal.is_sequential);
                writer.put_flag(signal.state);
                self.signal_index_bits + 2
            }
            Payload::Control(control) => {
                writer.put("parameter", PARAMETER_BITS, control.parameter.code())?;
                writer.put_flag(control.is_read);
                writer.put("control value", self.control_value_bits, control.value)?;
                PARAMETER_BITS + 1 + self.control_value_bits
            }
            Payload::Trace(bits) => {
                writer.put_bits("trace", self.payload_bits, bits)?;
                self.payload_bits
            }
        };
        writer.skip(self.payload_bits - used);
        Ok(writer.finish())
    }

    pub fn encode_message(&self, message: &Message) -> Result<Word, ProtocolError> {
        self.encode(&message.header(), &message.payload)
    }

    fn check_width(&self, word: &BitSlice<usize, Lsb0>) -> Result<(), ProtocolError> {
        if word.len() != self.width() {
            return Err(ProtocolError::WidthMismatch {
                expected: self.width(),
                actual: word.len(),
            });
        }
        Ok(())
    }

    /// Read only the routing fields. Total over any word of the right width.
    pub fn peek_target(&self, word: &BitSlice<usize, Lsb0>) -> Result<NodeId, ProtocolError> {
        self.check_width(word)?;
        let mut reader = FieldReader::new(word);
        let row = reader.take(self.row_bits) as usize;
        let column = reader.take(self.column_bits) as usize;
        Ok(NodeId::new(row, column))
    }

    pub fn decode(&self, word: &BitSlice<usize, Lsb0>) -> Result<(Header, Payload), ProtocolError> {
        self.check_width(word)?;
        let mut reader = FieldReader::new(word);
        let row = reader.take(self.row_bits) as usize;
        let column = reader.take(self.column_bits) as usize;
        let command = Command::from_code(reader.take(COMMAND_BITS))?;
        let payload = match command {
            Command::Load => match self.generation {
                ProtocolGeneration::Direct => Payload::Load(LoadChunk {
                    last: true,
                    data: reader.take(self.instruction_bits),
                }),
                ProtocolGeneration::Segmented { segment_width } => {
                    let last = reader.take_flag();
                    let data = reader.take(segment_width);
                    Payload::Load(LoadChunk { last, data })
                }
            },
            Command::Signal => {
                let index = reader.take(self.signal_index_bits) as usize;
                let is_sequential = reader.take_flag();
                let state = reader.take_flag();
                Payload::Signal(SignalPayload {
                    index,
                    is_sequential,
                    state,
                })
            }
            Command::Control => {
                let parameter = Parameter::from_code(reader.take(PARAMETER_BITS))?;
                let is_read = reader.take_flag();
                let value = reader.take(self.control_value_bits);
                Payload::Control(ControlPayload {
                    parameter,
                    is_read,
                    value,
                })
            }
            Command::Trace => Payload::Trace(
                reader
                    .take_bits(self.payload_bits)
                    .to_bitvec()
                    .into_boxed_bitslice(),
            ),
        };
        let header = Header {
            target: NodeId::new(row, column),
            command,
        };
        Ok((header, payload))
    }

    pub fn decode_message(&self, word: &BitSlice<usize, Lsb0>) -> Result<Message, ProtocolError> {
        let (header, payload) = self.decode(word)?;
        Ok(Message::new(header.target, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::{Instruction, Operand};

    fn layout(rows: usize, columns: usize, protocol: ProtocolGeneration) -> WireLayout {
        let mut config = MeshConfiguration::new(rows, columns);
        config.protocol = protocol;
        config.wire_layout()
    }

    #[test]
    fn widths_follow_configuration() {
        let direct = layout(4, 4, ProtocolGeneration::Direct);
        // rows 0..=4 (egress row included) need 3 bits, columns 0..4 need 2
        assert_eq!(direct.row_bits, 3);
        assert_eq!(direct.column_bits, 2);
        assert_eq!(direct.instruction_bits, 28);
        assert_eq!(direct.signal_index_bits, 5);
        assert_eq!(direct.payload_bits, 28);
        assert_eq!(direct.width(), 3 + 2 + 3 + 28);

        let segmented = layout(4, 4, ProtocolGeneration::Segmented { segment_width: 14 });
        // 4 parameter bits, the read flag and 16 value bits now dominate
        assert_eq!(segmented.payload_bits, 21);

        let single = layout(1, 1, ProtocolGeneration::Direct);
        assert_eq!(single.row_bits, 1);
        assert_eq!(single.column_bits, 1);
    }

    #[test]
    fn header_occupies_top_bits() {
        let layout = layout(4, 4, ProtocolGeneration::Direct);
        let message = Message::signal(NodeId::new(3, 2), 7, true, true);
        let word = layout.encode_message(&message).unwrap();
        let top = word[word.len() - 8..].load_le::<u8>();
        assert_eq!(top, 0b011_10_001);
        assert_eq!(layout.peek_target(&word).unwrap(), NodeId::new(3, 2));
        assert_eq!(layout.decode_message(&word).unwrap(), message);
    }

    #[test]
    fn every_shape_decodes() {
        let layout = layout(4, 4, ProtocolGeneration::Direct);
        let instruction = Instruction::new(
            0x96,
            [Operand::input(0), Operand::input(1), Operand::register(4)],
            2,
        );
        let data = MeshConfiguration::default()
            .instruction_layout()
            .to_bits(&instruction)
            .unwrap();
        let mut trace = bitvec![usize, Lsb0; 0; layout.payload_bits];
        trace.set(0, true);
        trace.set(layout.payload_bits - 1, true);
        let messages = vec![
            Message::load(NodeId::new(0, 1), data, true),
            Message::signal(NodeId::new(4, 3), 31, false, true),
            Message::control(NodeId::new(2, 2), Parameter::LoopbackMask, 0b1010),
            Message::read(NodeId::new(2, 2), Parameter::InstructionCount),
            Message::trace(NodeId::new(1, 0), trace.into_boxed_bitslice()),
        ];
        for message in messages {
            let word = layout.encode_message(&message).unwrap();
            assert_eq!(word.len(), layout.width());
            assert_eq!(layout.decode_message(&word).unwrap(), message);
        }
    }

    #[test]
    fn unknown_commands_are_rejected() {
        let layout = layout(4, 4, ProtocolGeneration::Direct);
        let word = layout
            .encode_message(&Message::signal(NodeId::new(1, 1), 0, false, false))
            .unwrap();
        let command_start = layout.width() - layout.row_bits - layout.column_bits - COMMAND_BITS;
        for code in 4..8u64 {
            let mut bad = word.clone();
            bad[command_start..command_start + COMMAND_BITS].store_le(code);
            assert_eq!(
                layout.decode(&bad),
                Err(ProtocolError::UnknownCommand(code))
            );
            // routing fields stay readable
            assert_eq!(layout.peek_target(&bad).unwrap(), NodeId::new(1, 1));
        }
    }

    #[test]
    fn unknown_parameters_are_rejected() {
        let layout = layout(4, 4, ProtocolGeneration::Direct);
        let mut word = layout
            .encode_message(&Message::control(NodeId::new(0, 0), Parameter::Rows, 0))
            .unwrap();
        let parameter_start = layout.payload_bits - PARAMETER_BITS;
        word[parameter_start..layout.payload_bits].store_le(0xfu8);
        assert_eq!(
            layout.decode(&word),
            Err(ProtocolError::UnknownParameter(0xf))
        );
    }

    #[test]
    fn generations_do_not_mix() {
        let direct = layout(4, 4, ProtocolGeneration::Direct);
        assert_eq!(
            direct.encode_message(&Message::load(NodeId::new(0, 0), 1, false)),
            Err(ProtocolError::GenerationMismatch)
        );

        let segmented = layout(4, 4, ProtocolGeneration::Segmented { segment_width: 14 });
        let first = Message::load(NodeId::new(0, 0), 0x3fff, false);
        let word = segmented.encode_message(&first).unwrap();
        assert_eq!(segmented.decode_message(&word).unwrap(), first);
        assert!(segmented
            .encode_message(&Message::load(NodeId::new(0, 0), 0x4000, true))
            .is_err());
    }

    #[test]
    fn mismatched_words_are_rejected() {
        let layout = layout(4, 4, ProtocolGeneration::Direct);
        let short = bitvec![usize, Lsb0; 0; layout.width() - 1];
        assert_eq!(
            layout.decode(&short),
            Err(ProtocolError::WidthMismatch {
                expected: layout.width(),
                actual: layout.width() - 1
            })
        );
        let header = Header {
            target: NodeId::new(0, 0),
            command: Command::Load,
        };
        let payload = Payload::Signal(SignalPayload {
            index: 0,
            is_sequential: false,
            state: true,
        });
        assert_eq!(
            layout.encode(&header, &payload),
            Err(ProtocolError::PayloadMismatch)
        );
        assert!(layout
            .encode_message(&Message::signal(NodeId::new(8, 0), 0, false, true))
            .is_err());
    }
}

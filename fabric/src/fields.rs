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

//! Most-significant-first field packing on top of `bitvec`.
//!
//! The first field written lands in the top bits of the word, matching the
//! hardware's `[row][column][command][payload]` order.

use crate::error::ProtocolError;
use crate::Word;
use bitvec::prelude::*;

pub(crate) struct FieldWriter {
    bits: BitVec<usize, Lsb0>,
    cursor: usize,
}

impl FieldWriter {
    pub fn new(width: usize) -> Self {
        Self {
            bits: BitVec::repeat(false, width),
            cursor: width,
        }
    }

    pub fn put(
        &mut self,
        field: &'static str,
        width: usize,
        value: u64,
    ) -> Result<(), ProtocolError> {
        debug_assert!(width <= 64, "numeric fields are at most 64 bits");
        let fits = if width >= 64 { true } else { value >> width == 0 };
        if !fits {
            return Err(ProtocolError::FieldOverflow {
                field,
                value,
                width,
            });
        }
        assert!(width <= self.cursor, "May not write past the end of the word.");
        if width > 0 {
            self.bits[self.cursor - width..self.cursor].store_le(value);
        }
        self.cursor -= width;
        Ok(())
    }

    pub fn put_flag(&mut self, value: bool) {
        assert!(self.cursor > 0, "May not write past the end of the word.");
        self.cursor -= 1;
        self.bits.set(self.cursor, value);
    }

    /// Copy raw bits; `bits` is right-aligned into a field of `width`.
    pub fn put_bits(
        &mut self,
        field: &'static str,
        width: usize,
        bits: &BitSlice<usize, Lsb0>,
    ) -> Result<(), ProtocolError> {
        if bits.len() > width && bits[width..].any() {
            return Err(ProtocolError::FieldOverflow {
                field,
                value: bits.len() as u64,
                width,
            });
        }
        assert!(width <= self.cursor, "May not write past the end of the word.");
        let start = self.cursor - width;
        let used = bits.len().min(width);
        self.bits[start..start + used].copy_from_bitslice(&bits[..used]);
        self.cursor = start;
        Ok(())
    }

    /// Leave `width` bits zeroed.
    pub fn skip(&mut self, width: usize) {
        assert!(width <= self.cursor, "May not write past the end of the word.");
        self.cursor -= width;
    }

    pub fn finish(self) -> Word {
        self.bits.into_boxed_bitslice()
    }
}

pub(crate) struct FieldReader<'a> {
    bits: &'a BitSlice<usize, Lsb0>,
    cursor: usize,
}

impl<'a> FieldReader<'a> {
    pub fn new(bits: &'a BitSlice<usize, Lsb0>) -> Self {
        Self {
            bits,
            cursor: bits.len(),
        }
    }

    pub fn take(&mut self, width: usize) -> u64 {
        debug_assert!(width <= 64, "numeric fields are at most 64 bits");
        assert!(width <= self.cursor, "May not read past the end of the word.");
        self.cursor -= width;
        if width == 0 {
            0
        } else {
            self.bits[self.cursor..self.cursor + width].load_le::<u64>()
        }
    }

    pub fn take_flag(&mut self) -> bool {
        assert!(self.cursor > 0, "May not read past the end of the word.");
        self.cursor -= 1;
        self.bits[self.cursor]
    }

    pub fn take_bits(&mut self, width: usize) -> &'a BitSlice<usize, Lsb0> {
        assert!(width <= self.cursor, "May not read past the end of the word.");
        self.cursor -= width;
        &self.bits[self.cursor..self.cursor + width]
    }

    /// Bits not consumed yet, i.e. the low end of the word.
    pub fn remaining(&self) -> usize {
        self.cursor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_field_is_most_significant() {
        let mut writer = FieldWriter::new(8);
        writer.put("high", 3, 0b101).unwrap();
        writer.put_flag(true);
        writer.put("low", 4, 0b0011).unwrap();
        let word = writer.finish();
        assert_eq!(word.load_le::<u8>(), 0b1011_0011);

        let mut reader = FieldReader::new(&word);
        assert_eq!(reader.take(3), 0b101);
        assert!(reader.take_flag());
        assert_eq!(reader.take(4), 0b0011);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn rejects_values_wider_than_field() {
        let mut writer = FieldWriter::new(8);
        assert_eq!(
            writer.put("row", 2, 4),
            Err(ProtocolError::FieldOverflow {
                field: "row",
                value: 4,
                width: 2
            })
        );
        assert!(writer.put("empty", 0, 0).is_ok());
        assert!(writer.put("empty", 0, 1).is_err());
    }
}

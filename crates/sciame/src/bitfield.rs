//! Wrapper types around Bitvec.
use bitvec::prelude::*;

use crate::error::Error;

/// Bitfield where index = piece.
pub type Bitfield = BitVec<u8, Msb0>;

pub trait BitfieldExt {
    fn from_piece(pieces: usize) -> Bitfield {
        bitvec![u8, Msb0; 0; pieces]
    }

    /// Validate a bitfield that came from the wire, which is always a
    /// multiple of 8 bits long, and cut it to the number of pieces.
    ///
    /// The spare bits at the end must be zero.
    fn from_wire(self, pieces: usize) -> Result<Bitfield, Error>;

    /// Set the bit, growing the bitfield if needed.
    fn safe_set(&mut self, index: usize);

    /// Get the bit, out of bounds indexes are false.
    fn safe_get(&self, index: usize) -> bool;
}

impl BitfieldExt for Bitfield {
    fn from_wire(mut self, pieces: usize) -> Result<Bitfield, Error> {
        if self.len() != pieces.div_ceil(8) * 8 {
            return Err(Error::BitfieldInvalid);
        }
        if self[pieces..].any() {
            return Err(Error::BitfieldInvalid);
        }
        self.truncate(pieces);
        Ok(self)
    }

    fn safe_set(&mut self, index: usize) {
        if self.len() <= index {
            self.resize(index + 1, false);
        }
        self.set(index, true);
    }

    fn safe_get(&self, index: usize) -> bool {
        self.get(index).map(|b| *b).unwrap_or(false)
    }
}

// sointu -- a modular synthesizer for size-restricted music
// Copyright (C) 2021  Fabian Thorand
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Opcode numbers of the virtual machine when every unit type is compiled in.
//!
//! An opcode byte is `index << 1 | stereo`; index 0 ends an instrument.

/// Opcode indices, in the sorted order of the unit type catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Add = 1,
    Addp,
    Aux,
    Clip,
    Compressor,
    Crush,
    Dbgain,
    Delay,
    Distort,
    Envelope,
    Filter,
    Gain,
    Hold,
    In,
    Invgain,
    Loadnote,
    Loadval,
    Mul,
    Mulp,
    Noise,
    Oscillator,
    Out,
    Outaux,
    Pan,
    Pop,
    Push,
    Receive,
    Send,
    Speed,
    Sync,
    Xch,
}

/// Default operand count of every opcode, indexed by `index - 1`.
pub const TRANSFORM_COUNTS: [usize; 31] = [
    0, 0, 1, 0, 5, 1, 1, 4, 1, 5, 2, 1, 1, 0, 1, 0, 1, 0, 0, 2, 6, 1, 2, 1, 0, 0, 0, 1, 0, 0, 0,
];

const ALL: [Opcode; 31] = [
    Opcode::Add,
    Opcode::Addp,
    Opcode::Aux,
    Opcode::Clip,
    Opcode::Compressor,
    Opcode::Crush,
    Opcode::Dbgain,
    Opcode::Delay,
    Opcode::Distort,
    Opcode::Envelope,
    Opcode::Filter,
    Opcode::Gain,
    Opcode::Hold,
    Opcode::In,
    Opcode::Invgain,
    Opcode::Loadnote,
    Opcode::Loadval,
    Opcode::Mul,
    Opcode::Mulp,
    Opcode::Noise,
    Opcode::Oscillator,
    Opcode::Out,
    Opcode::Outaux,
    Opcode::Pan,
    Opcode::Pop,
    Opcode::Push,
    Opcode::Receive,
    Opcode::Send,
    Opcode::Speed,
    Opcode::Sync,
    Opcode::Xch,
];

impl Opcode {
    /// Decode an opcode index (the opcode byte shifted right by one).
    pub fn from_index(index: u8) -> Option<Opcode> {
        ALL.get((index as usize).checked_sub(1)?).copied()
    }

    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn transform_count(self) -> usize {
        TRANSFORM_COUNTS[self as usize - 1]
    }

    /// Name of the unit type this opcode executes.
    pub fn name(self) -> &'static str {
        sointu_core::unit_type::UNIT_TYPES[self as usize - 1].name
    }

    /// Number of operand bytes read after the default operands.
    pub fn extra_operands(self) -> usize {
        match self {
            Opcode::Aux | Opcode::In | Opcode::Filter | Opcode::Oscillator => 1,
            Opcode::Delay | Opcode::Send => 2,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use sointu_core::unit_type::UNIT_TYPES;

    #[test]
    fn test_matches_catalogue() {
        for (position, unit_type) in UNIT_TYPES.iter().enumerate() {
            let opcode = Opcode::from_index(position as u8 + 1).unwrap();
            assert_eq!(opcode.index() as usize, position + 1);
            assert_eq!(opcode.transform_count(), unit_type.transform_count());
            assert_eq!(opcode.name(), unit_type.name);
        }
    }

    #[test]
    fn test_out_of_range() {
        assert_eq!(Opcode::from_index(0), None);
        assert_eq!(Opcode::from_index(32), None);
        assert_eq!(Opcode::from_index(21), Some(Opcode::Oscillator));
        assert_eq!(Opcode::Xch.name(), "xch");
    }
}

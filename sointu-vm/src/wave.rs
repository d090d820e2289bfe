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

//! Stereo sample frames as produced by the synths.

use std::ops;

/// One stereo frame.
///
/// ```
/// use sointu_vm::wave::*;
///
/// let frame = Stereo::new(0.25f32, 0.5);
/// let mixed = frame + Stereo::new(0.5, -0.25);
/// assert_eq!(mixed * 2.0, Stereo::new(1.5, 0.5));
/// ```
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Stereo<T> {
    pub left: T,
    pub right: T,
}

impl<T> Stereo<T> {
    pub fn new(left: T, right: T) -> Self {
        Self { left, right }
    }

    pub fn mono(mono: T) -> Self
    where
        T: Copy,
    {
        Self::new(mono, mono)
    }
}

impl Stereo<f32> {
    pub const SILENCE: Stereo<f32> = Stereo {
        left: 0.0,
        right: 0.0,
    };

    pub fn is_finite(&self) -> bool {
        self.left.is_finite() && self.right.is_finite()
    }

    /// Convert to signed 16-bit integers, clipping to [-1, 1] first.
    pub fn to_i16(self) -> Stereo<i16> {
        let convert = |x: f32| (x.max(-1.0).min(1.0) * 32767.0) as i16;
        Stereo::new(convert(self.left), convert(self.right))
    }
}

impl<T: ops::Add> ops::Add for Stereo<T> {
    type Output = Stereo<T::Output>;

    fn add(self, rhs: Self) -> Self::Output {
        Stereo {
            left: self.left + rhs.left,
            right: self.right + rhs.right,
        }
    }
}

impl<T: ops::AddAssign> ops::AddAssign for Stereo<T> {
    fn add_assign(&mut self, rhs: Self) {
        self.left += rhs.left;
        self.right += rhs.right;
    }
}

impl<T: ops::Mul + Copy> ops::Mul<T> for Stereo<T> {
    type Output = Stereo<T::Output>;

    fn mul(self, rhs: T) -> Self::Output {
        Stereo {
            left: self.left * rhs,
            right: self.right * rhs,
        }
    }
}

/// Interleave frames into little endian 32-bit floats.
///
/// Returns the number of frames that were copied, which is less than the
/// number of input frames if the output is too short.
pub fn copy_f32_bytes(audio: &[Stereo<f32>], bytes: &mut [u8]) -> usize {
    let mut processed = 0;
    for (frame, target) in audio.iter().zip(bytes.chunks_exact_mut(8)) {
        target[0..4].copy_from_slice(&frame.left.to_le_bytes());
        target[4..8].copy_from_slice(&frame.right.to_le_bytes());
        processed += 1;
    }
    processed
}

/// Interleave frames into little endian 16-bit integers.
pub fn copy_i16_bytes(audio: &[Stereo<f32>], bytes: &mut [u8]) -> usize {
    let mut processed = 0;
    for (frame, target) in audio.iter().zip(bytes.chunks_exact_mut(4)) {
        let frame = frame.to_i16();
        target[0..2].copy_from_slice(&frame.left.to_le_bytes());
        target[2..4].copy_from_slice(&frame.right.to_le_bytes());
        processed += 1;
    }
    processed
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_i16_clipping() {
        assert_eq!(Stereo::new(2.0f32, -0.5).to_i16(), Stereo::new(32767, -16383));
        assert_eq!(Stereo::new(-3.0f32, 0.0).to_i16(), Stereo::new(-32767, 0));
    }

    #[test]
    fn test_copy_bytes() {
        let audio = [Stereo::new(1.0f32, -1.0), Stereo::new(0.5, 0.25)];
        let mut short = [0u8; 12];
        assert_eq!(copy_f32_bytes(&audio, &mut short), 1);
        assert_eq!(&short[0..4], &1.0f32.to_le_bytes());
        assert_eq!(&short[4..8], &(-1.0f32).to_le_bytes());

        let mut ints = [0u8; 8];
        assert_eq!(copy_i16_bytes(&audio, &mut ints), 2);
        assert_eq!(&ints[0..2], &32767i16.to_le_bytes());
        assert_eq!(&ints[4..6], &16383i16.to_le_bytes());
    }
}

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

//! The interface shared by all synths.

use std::fmt;
use std::time::Duration;

use snafu::Snafu;

use sointu_core::song::SAMPLE_RATE;
use sointu_core::Patch;

use crate::bytecode::CompileError;
use crate::wave::Stereo;

/// Progress made by a render call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rendered {
    /// Number of frames written to the start of the buffer.
    pub samples: usize,
    /// How far the song time advanced. Usually equal to `samples`, unless a
    /// speed unit is playing.
    pub time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum RenderErrorKind {
    #[snafu(display("stack underflow"))]
    StackUnderflow,
    #[snafu(display("stack not empty, {} signals left", depth))]
    StackNotEmpty { depth: usize },
    #[snafu(display("invalid opcode {}", opcode))]
    InvalidOpcode { opcode: u8 },
    #[snafu(display("operand stream ended prematurely"))]
    OperandsEnded,
    #[snafu(display("opcode stream ended before all voices were played"))]
    OpcodesEnded,
    #[snafu(display("instrument has more units than voices can hold"))]
    TooManyUnits,
    #[snafu(display("patch uses more delay lines than were allocated"))]
    DelayLinesExhausted,
    #[snafu(display("delay time index {} out of range", index))]
    InvalidDelayTime { index: usize },
    #[snafu(display("sample number {} out of range", index))]
    InvalidSample { index: usize },
    #[snafu(display("send address {:#06x} does not point at a unit", address))]
    InvalidSendTarget { address: u16 },
    #[snafu(display("output channel {} out of range", channel))]
    InvalidChannel { channel: usize },
    #[snafu(display("{} produced a value that is not finite", opcode))]
    NonFinite { opcode: &'static str },
    #[snafu(display("worker thread is gone"))]
    WorkerLost,
}

/// A failed render call. Frames before the failure were still written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderError {
    pub rendered: Rendered,
    pub kind: RenderErrorKind,
}

impl RenderError {
    pub fn new(rendered: Rendered, kind: RenderErrorKind) -> Self {
        Self { rendered, kind }
    }
}

impl fmt::Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} after {} samples (time {})",
            self.kind, self.rendered.samples, self.rendered.time
        )
    }
}

impl std::error::Error for RenderError {}

/// Wall clock time spent rendering relative to the duration of the audio.
/// Above 1 the synth cannot keep up in real time.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CpuLoad(pub f64);

impl CpuLoad {
    pub fn measure(elapsed: Duration, samples: usize) -> Self {
        if samples == 0 {
            return CpuLoad(0.0);
        }
        let audio = samples as f64 / SAMPLE_RATE as f64;
        CpuLoad(elapsed.as_secs_f64() / audio)
    }
}

/// A running synthesizer. Not to be shared between threads, but can be sent
/// to a rendering thread.
pub trait Synth: Send {
    /// Restart a voice with a note. All unit state of the voice is cleared.
    fn trigger(&mut self, voice: usize, note: u8);

    /// Release the note of a voice; envelopes go to their release phase.
    fn release(&mut self, voice: usize);

    /// Swap in a new patch. Unit state survives if the opcodes are unchanged.
    fn update(&mut self, patch: &Patch, bpm: usize) -> Result<(), CompileError>;

    /// Render frames to the buffer until it is full or the time reaches
    /// `max_time`.
    fn render(&mut self, buffer: &mut [Stereo<f32>], max_time: i64) -> Result<Rendered, RenderError>;

    /// Release resources, e.g. worker threads. The synth can not be used
    /// afterwards.
    fn close(&mut self) {}

    fn num_cores(&self) -> usize {
        1
    }

    /// Write the load of every core to `loads` and return the number of
    /// entries written.
    fn cpu_load(&self, loads: &mut [CpuLoad]) -> usize;
}

/// Creates synths from patches.
pub trait Synther {
    fn name(&self) -> &str;

    /// Whether the synths honor the core masks of instruments.
    fn supports_parallelism(&self) -> bool;

    fn synth(&self, patch: &Patch, bpm: usize) -> Result<Box<dyn Synth>, CompileError>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_render_error_display() {
        let err = RenderError::new(
            Rendered {
                samples: 3,
                time: 5,
            },
            RenderErrorKind::StackNotEmpty { depth: 1 },
        );
        assert_eq!(
            err.to_string(),
            "stack not empty, 1 signals left after 3 samples (time 5)"
        );
    }

    #[test]
    fn test_cpu_load() {
        assert_eq!(CpuLoad::measure(Duration::from_millis(500), 44100), CpuLoad(0.5));
        assert_eq!(CpuLoad::measure(Duration::from_secs(1), 0), CpuLoad(0.0));
    }
}

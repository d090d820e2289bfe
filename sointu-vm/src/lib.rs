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

//! The sointu virtual machine: compiling patches to bytecode and rendering
//! them.

// compiling
pub mod bytecode;
pub mod delaytable;
pub mod features;
pub mod opcodes;
pub mod patterns;

// rendering
pub mod interpreter;
pub mod parallel;
pub mod samples;
pub mod synth;
pub mod wave;

pub use bytecode::{Bytecode, CompileError};
pub use interpreter::{Interpreter, InterpreterSynther};
pub use parallel::{ParallelSynth, ParallelSynther};
pub use patterns::{construct_patterns, EncodedPatterns, PatternError};
pub use synth::{CpuLoad, RenderError, RenderErrorKind, Rendered, Synth, Synther};
pub use wave::Stereo;

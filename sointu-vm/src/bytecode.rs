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

//! Compilation of patches into the bytecode executed by the synths.
//!
//! The bytecode consists of two parallel byte streams: one opcode per unit,
//! with 0 marking the end of an instrument, and the operands the opcodes
//! consume. Sends address their targets with 16-bit operands, which are
//! patched once the target unit has been emitted.

use std::collections::HashMap;
use std::fmt::Write;

use log::{debug, warn};
use snafu::Snafu;

use sointu_core::unit_type::{self, OscillatorType};
use sointu_core::{Instrument, Patch, Unit};

use crate::delaytable::construct_delay_time_table;
use crate::features::FeatureSet;
use crate::opcodes::Opcode;

/// Maximum number of voices over all instruments of a patch.
pub const MAX_VOICES: usize = 32;
/// Maximum number of compiled units in one instrument.
pub const MAX_UNITS: usize = 63;
/// Size of the sample offset table; oscillators index it with one byte.
pub const MAX_SAMPLES: usize = 256;

/// Address of unresolved sends. It points at the last port of a unit no
/// instrument can reach, so the deposit is harmless.
pub const SCRATCH_ADDRESS: u16 = 0xFFF7;

/// Bit of a send address selecting the global address space.
pub const SEND_GLOBAL: u16 = 0x8000;
/// Bit of a send address requesting to pop the sent signal.
pub const SEND_POP: u16 = 0x8;
/// Global addresses are offset by this from the voice block.
pub const SEND_GLOBAL_BASE: u16 = 0x8010;
/// Size of the address block of one voice.
pub const SEND_VOICE_STRIDE: u16 = 0x400;

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum CompileError {
    #[snafu(display(
        "Sointu does not support more than 32 concurrent voices; patch uses {}",
        voices
    ))]
    TooManyVoices { voices: usize },
    #[snafu(display("Instrument {} must have at least 1 voice", instrument))]
    NoVoices { instrument: usize },
    #[snafu(display("Instrument {} has over 63 units", instrument))]
    TooManyUnits { instrument: usize },
    #[snafu(display("Patch uses over 256 samples"))]
    TooManySamples,
    #[snafu(display("VM is not configured to support unit type \"{}\"", unit_type))]
    UnsupportedUnit { unit_type: String },
}

/// Where a sample starts in the sample table and how it loops. All values
/// are in 16-bit words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SampleOffset {
    pub start: u32,
    /// Relative to `start`.
    pub loop_start: u16,
    pub loop_length: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bytecode {
    pub opcodes: Vec<u8>,
    pub operands: Vec<u8>,
    pub delay_times: Vec<u16>,
    pub sample_offsets: Vec<SampleOffset>,
    /// Bit `num_voices - 1 - n` is set if voice `n + 1` plays the same
    /// instrument as voice `n`.
    pub polyphony_bitmask: u32,
    pub num_voices: u32,
}

struct Builder<'a> {
    bytecode: Bytecode,
    sample_indices: HashMap<SampleOffset, usize>,
    global_addrs: HashMap<i32, u16>,
    global_fixups: HashMap<i32, Vec<usize>>,
    local_addrs: HashMap<i32, u16>,
    local_fixups: HashMap<i32, Vec<usize>>,
    voice_no: usize,
    unit_no: usize,
    delay_indices: Vec<Vec<usize>>,
    patch: &'a Patch,
}

impl<'a> Builder<'a> {
    fn new(patch: &'a Patch, bpm: usize) -> Self {
        let mut polyphony_bitmask = 0u32;
        for instr in patch.iter() {
            for _ in 1..instr.num_voices {
                polyphony_bitmask = (polyphony_bitmask << 1) + 1;
            }
            polyphony_bitmask <<= 1;
        }
        let (delay_times, delay_indices) = construct_delay_time_table(patch, bpm);
        Self {
            bytecode: Bytecode {
                delay_times,
                polyphony_bitmask,
                num_voices: patch.num_voices() as u32,
                ..Bytecode::default()
            },
            sample_indices: HashMap::new(),
            global_addrs: HashMap::new(),
            global_fixups: HashMap::new(),
            local_addrs: HashMap::new(),
            local_fixups: HashMap::new(),
            voice_no: 0,
            unit_no: 0,
            delay_indices,
            patch,
        }
    }

    fn op(&mut self, opcode: u8) {
        self.bytecode.opcodes.push(opcode);
        self.unit_no += 1;
    }

    /// Ends an instrument. Local labels do not outlive it.
    fn op_finish(&mut self, instr: &Instrument) {
        self.bytecode.opcodes.push(0);
        self.unit_no = 0;
        self.voice_no += instr.num_voices;
        self.local_addrs.clear();
        self.local_fixups.clear();
    }

    fn operand(&mut self, operands: &[i32]) {
        self.bytecode
            .operands
            .extend(operands.iter().map(|&v| v as u8));
    }

    fn def_operands(&mut self, unit: &Unit) {
        if let Some(t) = unit_type::unit_type(&unit.unit_type) {
            for param in t.params.iter().filter(|p| p.is_default_operand()) {
                self.bytecode.operands.push(unit.param(param.name) as u8);
            }
        }
    }

    fn address(&mut self, addr: u16) {
        self.bytecode.operands.extend_from_slice(&addr.to_le_bytes());
    }

    fn local_id_ref(&mut self, id: i32, addr: u16) {
        let addr = match self.local_addrs.get(&id) {
            Some(label) => addr.wrapping_add(*label),
            None => {
                let position = self.bytecode.operands.len();
                self.local_fixups.entry(id).or_default().push(position);
                addr
            }
        };
        self.address(addr);
    }

    fn global_id_ref(&mut self, id: i32, addr: u16) {
        let addr = match self.global_addrs.get(&id) {
            Some(label) => addr.wrapping_add(*label),
            None => {
                let position = self.bytecode.operands.len();
                self.global_fixups.entry(id).or_default().push(position);
                addr
            }
        };
        self.address(addr);
    }

    /// Record the addresses of the unit about to be emitted and patch all
    /// earlier references to it.
    fn id_label(&mut self, id: i32) {
        let local = ((self.unit_no + 1) << 4) as u16;
        if let Some(positions) = self.local_fixups.remove(&id) {
            self.fix_up(&positions, local);
        }
        self.local_addrs.insert(id, local);
        let global = local
            .wrapping_add(16)
            .wrapping_add((self.voice_no as u16).wrapping_mul(SEND_VOICE_STRIDE));
        if let Some(positions) = self.global_fixups.remove(&id) {
            self.fix_up(&positions, global);
        }
        self.global_addrs.insert(id, global);
    }

    fn fix_up(&mut self, positions: &[usize], delta: u16) {
        let operands = &mut self.bytecode.operands;
        for &pos in positions {
            let orig = u16::from_le_bytes([operands[pos], operands[pos + 1]]);
            let patched = orig.wrapping_add(delta).to_le_bytes();
            operands[pos..pos + 2].copy_from_slice(&patched);
        }
    }

    fn sample_index(&mut self, unit: &Unit) -> usize {
        let offset = SampleOffset {
            start: unit.param("samplestart") as u32,
            loop_start: unit.param("loopstart") as u16,
            // a zero loop length would divide by zero when playing
            loop_length: (unit.param("looplength") as u16).max(1),
        };
        let sample_offsets = &mut self.bytecode.sample_offsets;
        *self.sample_indices.entry(offset).or_insert_with(|| {
            sample_offsets.push(offset);
            sample_offsets.len() - 1
        })
    }

    fn oscillator(&mut self, opcode: u8, unit: &Unit) -> Result<(), CompileError> {
        let kind = OscillatorType::from_param(unit.param("type"));
        let color = if kind == Some(OscillatorType::Sample) {
            let index = self.sample_index(unit);
            if index >= MAX_SAMPLES {
                return Err(CompileError::TooManySamples);
            }
            index as i32
        } else {
            unit.param("color")
        };
        let mut flags = match kind {
            Some(OscillatorType::Sine) => 0x40,
            Some(OscillatorType::Trisaw) => 0x20,
            Some(OscillatorType::Pulse) => 0x10,
            Some(OscillatorType::Gate) => 0x04,
            Some(OscillatorType::Sample) => 0x80,
            None => 0,
        };
        if unit.param("lfo") == 1 {
            flags += 0x08;
        }
        flags += unit.param("unison");
        self.op(opcode);
        self.operand(&[
            unit.param("transpose"),
            unit.param("detune"),
            unit.param("phase"),
            color,
            unit.param("shape"),
            unit.param("gain"),
            flags,
        ]);
        Ok(())
    }

    fn filter(&mut self, opcode: u8, unit: &Unit) {
        let mut flags = 0;
        if unit.param("lowpass") == 1 {
            flags += 0x40;
        }
        if unit.param("bandpass") == 1 {
            flags += 0x20;
        }
        if unit.param("highpass") == 1 {
            flags += 0x10;
        }
        if unit.param("bandpass") == -1 {
            flags += 0x08;
        }
        if unit.param("highpass") == -1 {
            flags += 0x04;
        }
        self.op(opcode);
        self.def_operands(unit);
        self.operand(&[flags]);
    }

    fn send(&mut self, opcode: u8, instr_index: usize, unit: &Unit) {
        let target_id = unit.param("target");
        let target_voice = unit.param("voice");
        let pop = unit.param("sendpop") == 1;
        let mut addr = (unit.param("port") & 7) as u16;
        match self.patch.find_unit(target_id) {
            Some((target_instr, _)) if target_instr == instr_index && target_voice == 0 => {
                if pop {
                    addr += SEND_POP;
                }
                self.op(opcode);
                self.def_operands(unit);
                self.local_id_ref(target_id, addr);
            }
            Some((target_instr, _)) => {
                // voice 0 targets every voice of the instrument
                let (voice_start, voice_end) = if target_voice > 0 {
                    (target_voice as usize - 1, target_voice as usize)
                } else {
                    (0, self.patch[target_instr].num_voices)
                };
                addr = addr
                    .wrapping_add(SEND_GLOBAL)
                    .wrapping_add((voice_start as u16).wrapping_mul(SEND_VOICE_STRIDE));
                for voice in voice_start..voice_end {
                    self.op(opcode);
                    self.def_operands(unit);
                    if voice + 1 == voice_end && pop {
                        addr += SEND_POP;
                    }
                    self.global_id_ref(target_id, addr);
                    addr = addr.wrapping_add(SEND_VOICE_STRIDE);
                }
            }
            None => {
                warn!(
                    "Send in instrument {} targets unknown unit id {}",
                    instr_index, target_id
                );
                let addr = if pop {
                    SCRATCH_ADDRESS | SEND_POP
                } else {
                    SCRATCH_ADDRESS
                };
                self.op(opcode);
                self.def_operands(unit);
                self.address(addr);
            }
        }
    }
}

impl Bytecode {
    /// Compile a patch for a virtual machine supporting the given features.
    pub fn new<F: FeatureSet + ?Sized>(
        patch: &Patch,
        features: &F,
        bpm: usize,
    ) -> Result<Bytecode, CompileError> {
        let voices = patch.num_voices();
        if voices > MAX_VOICES {
            return Err(CompileError::TooManyVoices { voices });
        }
        let mut b = Builder::new(patch, bpm);
        for (instr_index, instr) in patch.iter().enumerate() {
            if instr.num_voices < 1 {
                return Err(CompileError::NoVoices {
                    instrument: instr_index,
                });
            }
            for (unit_index, unit) in instr.units.iter().enumerate() {
                if !unit.is_active() {
                    continue;
                }
                let opcode = match features.opcode(&unit.unit_type) {
                    Some(opcode) => opcode,
                    None => {
                        return Err(CompileError::UnsupportedUnit {
                            unit_type: unit.unit_type.clone(),
                        })
                    }
                };
                if unit.id != 0 {
                    b.id_label(unit.id);
                }
                let opcode = opcode.wrapping_add(unit.param("stereo") as u8);
                match unit.unit_type.as_str() {
                    "oscillator" => b.oscillator(opcode, unit)?,
                    "delay" => {
                        let mut count = unit.var_args.len() as i32;
                        if unit.is_stereo() {
                            count /= 2;
                        }
                        if count == 0 {
                            continue;
                        }
                        // odd counts disable note tracking
                        let count_track = count * 2 - 1 + (unit.param("notetracking") & 1);
                        let index = b.delay_indices[instr_index][unit_index] as i32;
                        b.op(opcode);
                        b.def_operands(unit);
                        b.operand(&[index, count_track]);
                    }
                    "aux" | "in" => {
                        b.op(opcode);
                        b.def_operands(unit);
                        b.operand(&[unit.param("channel")]);
                    }
                    "filter" => b.filter(opcode, unit),
                    "send" => b.send(opcode, instr_index, unit),
                    _ => {
                        b.op(opcode);
                        b.def_operands(unit);
                    }
                }
                if b.unit_no > MAX_UNITS {
                    return Err(CompileError::TooManyUnits {
                        instrument: instr_index,
                    });
                }
            }
            b.op_finish(instr);
        }
        let bytecode = b.bytecode;
        debug!(
            "Compiled {} opcodes, {} operands, {} delay times, {} samples, polyphony {:#034b}",
            bytecode.opcodes.len(),
            bytecode.operands.len(),
            bytecode.delay_times.len(),
            bytecode.sample_offsets.len(),
            bytecode.polyphony_bitmask
        );
        Ok(bytecode)
    }

    /// A human readable listing of the bytecode, assuming it was compiled
    /// with all features.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        let mut operands = self.operands.iter().copied();
        let mut instrument = 0;
        let mut unit = 0;
        for &op in &self.opcodes {
            if op == 0 {
                let _ = writeln!(out, "end instrument {}", instrument);
                instrument += 1;
                unit = 0;
                continue;
            }
            let stereo = op & 1 == 1;
            let opcode = match Opcode::from_index(op >> 1) {
                Some(opcode) => opcode,
                None => {
                    let _ = writeln!(out, "    {:2}: invalid opcode {}", unit, op);
                    break;
                }
            };
            let _ = write!(
                out,
                "    {:2}: {}{}",
                unit,
                opcode.name(),
                if stereo { " stereo" } else { "" }
            );
            let defaults: Vec<u8> = operands.by_ref().take(opcode.transform_count()).collect();
            if !defaults.is_empty() {
                let _ = write!(out, " {:?}", defaults);
            }
            let mut next = || operands.next().unwrap_or(0);
            match opcode {
                Opcode::Oscillator => {
                    let _ = write!(out, " flags={:#04x}", next());
                }
                Opcode::Filter => {
                    let _ = write!(out, " flags={:#04x}", next());
                }
                Opcode::Aux | Opcode::In => {
                    let _ = write!(out, " channel={}", next());
                }
                Opcode::Delay => {
                    let (index, count) = (next(), next());
                    let _ = write!(
                        out,
                        " index={} lines={} notetracking={}",
                        index,
                        (count as usize + 1) / 2,
                        count & 1 == 0
                    );
                }
                Opcode::Send => {
                    let addr = u16::from_le_bytes([next(), next()]);
                    let _ = write!(out, " {}", describe_send(addr));
                }
                _ => {}
            }
            out.push('\n');
            unit += 1;
        }
        let _ = writeln!(out, "delay times: {:?}", self.delay_times);
        for (index, sample) in self.sample_offsets.iter().enumerate() {
            let _ = writeln!(
                out,
                "sample {}: start={} loopstart={} looplength={}",
                index, sample.start, sample.loop_start, sample.loop_length
            );
        }
        let _ = writeln!(out, "polyphony: {:032b}", self.polyphony_bitmask);
        let _ = writeln!(out, "voices: {}", self.num_voices);
        out
    }
}

fn describe_send(addr: u16) -> String {
    let pop = if addr & SEND_POP != 0 { " pop" } else { "" };
    if addr & SEND_GLOBAL != 0 {
        let a = addr.wrapping_sub(SEND_GLOBAL_BASE);
        format!(
            "voice={} unit={} port={}{}",
            a >> 10,
            ((a & 0x1F0) >> 4) as i32 - 1,
            a & 7,
            pop
        )
    } else {
        format!(
            "unit={} port={}{}",
            ((addr & 0x1F0) >> 4) as i32 - 1,
            addr & 7,
            pop
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::features::{AllFeatures, NecessaryFeatures};
    use expect_test::expect;

    fn compile(patch: Vec<Instrument>) -> Result<Bytecode, CompileError> {
        Bytecode::new(&patch.into(), &AllFeatures, 100)
    }

    fn address_at(bytecode: &Bytecode, position: usize) -> u16 {
        u16::from_le_bytes([bytecode.operands[position], bytecode.operands[position + 1]])
    }

    #[test]
    fn test_empty_patch() {
        let bytecode = compile(vec![]).unwrap();
        assert_eq!(bytecode, Bytecode::default());
    }

    #[test]
    fn test_simple_instrument() {
        let bytecode = compile(vec![Instrument::new(
            1,
            vec![
                Unit::new("loadval").with("value", 96),
                Unit::new("out").with("stereo", 1).with("gain", 64),
            ],
        )])
        .unwrap();
        expect![[r#"Bytecode { opcodes: [34, 45, 0], operands: [96, 64], delay_times: [], sample_offsets: [], polyphony_bitmask: 0, num_voices: 1 }"#]]
            .assert_eq(&format!("{:?}", bytecode));
    }

    #[test]
    fn test_polyphony_bitmask() {
        let bytecode = compile(vec![
            Instrument::new(3, vec![]),
            Instrument::new(2, vec![]),
            Instrument::new(4, vec![]),
        ])
        .unwrap();
        assert_eq!(bytecode.polyphony_bitmask, 0b110101110);
        assert_eq!(bytecode.num_voices, 9);
        assert_eq!(bytecode.opcodes, vec![0, 0, 0]);
    }

    #[test]
    fn test_voice_limits() {
        assert_eq!(
            compile(vec![Instrument::new(20, vec![]), Instrument::new(13, vec![])]),
            Err(CompileError::TooManyVoices { voices: 33 })
        );
        assert_eq!(
            compile(vec![Instrument::new(1, vec![]), Instrument::new(0, vec![])]),
            Err(CompileError::NoVoices { instrument: 1 })
        );
    }

    #[test]
    fn test_unit_limit() {
        let units = |n| (0..n).map(|_| Unit::new("sync")).collect::<Vec<_>>();
        assert!(compile(vec![Instrument::new(1, units(63))]).is_ok());
        assert_eq!(
            compile(vec![Instrument::new(1, units(64))]),
            Err(CompileError::TooManyUnits { instrument: 0 })
        );
    }

    #[test]
    fn test_skipped_units() {
        let bytecode = compile(vec![Instrument::new(
            1,
            vec![
                Unit::default(),
                Unit {
                    disabled: true,
                    ..Unit::new("oscillator")
                },
                Unit::new("delay"),
                Unit::new("pop"),
            ],
        )])
        .unwrap();
        assert_eq!(bytecode.opcodes, vec![50, 0]);
        assert!(bytecode.operands.is_empty());
    }

    #[test]
    fn test_unsupported_unit() {
        let patch: Patch = vec![Instrument::new(1, vec![Unit::new("pop"), Unit::new("push")])].into();
        let features = NecessaryFeatures::for_patch(&vec![Instrument::new(1, vec![Unit::new("pop")])].into());
        assert_eq!(
            Bytecode::new(&patch, &features, 100),
            Err(CompileError::UnsupportedUnit {
                unit_type: "push".to_string()
            })
        );
        assert_eq!(
            compile(vec![Instrument::new(1, vec![Unit::new("belleq")])]),
            Err(CompileError::UnsupportedUnit {
                unit_type: "belleq".to_string()
            })
        );
    }

    #[test]
    fn test_oscillator_flags() {
        let bytecode = compile(vec![Instrument::new(
            1,
            vec![
                Unit::new("oscillator")
                    .with("transpose", 64)
                    .with("detune", 64)
                    .with("color", 96)
                    .with("shape", 64)
                    .with("gain", 128)
                    .with("type", 1)
                    .with("lfo", 1)
                    .with("unison", 2),
                Unit::new("pop"),
            ],
        )])
        .unwrap();
        assert_eq!(bytecode.operands, vec![64, 64, 0, 96, 64, 128, 0x20 + 0x08 + 2]);
    }

    #[test]
    fn test_sample_offsets() {
        let sample = |start, looplength| {
            Unit::new("oscillator")
                .with("type", 4)
                .with("color", 77)
                .with("samplestart", start)
                .with("loopstart", 10)
                .with("looplength", looplength)
        };
        let bytecode = compile(vec![Instrument::new(
            1,
            vec![sample(1000, 0), sample(2000, 50), sample(1000, 0)],
        )])
        .unwrap();
        assert_eq!(
            bytecode.sample_offsets,
            vec![
                SampleOffset {
                    start: 1000,
                    loop_start: 10,
                    loop_length: 1
                },
                SampleOffset {
                    start: 2000,
                    loop_start: 10,
                    loop_length: 50
                },
            ]
        );
        let colors: Vec<u8> = bytecode.operands.chunks(7).map(|c| c[3]).collect();
        assert_eq!(colors, vec![0, 1, 0]);
        assert!(bytecode.operands.chunks(7).all(|c| c[6] == 0x80));
    }

    #[test]
    fn test_too_many_samples() {
        let instruments = (0..5)
            .map(|i| {
                let units = (0..60)
                    .map(|j| {
                        Unit::new("oscillator")
                            .with("type", 4)
                            .with("samplestart", i * 60 + j)
                    })
                    .collect();
                Instrument::new(1, units)
            })
            .collect();
        assert_eq!(compile(instruments), Err(CompileError::TooManySamples));
    }

    #[test]
    fn test_delay_encoding() {
        let bytecode = compile(vec![Instrument::new(
            1,
            vec![
                Unit::new("delay")
                    .with("stereo", 1)
                    .with("pregain", 40)
                    .with("dry", 128)
                    .with("feedback", 125)
                    .with("damp", 64)
                    .with("notetracking", 0)
                    .with_var_args(&[1116, 1188, 1276, 1356]),
                Unit::new("delay")
                    .with("notetracking", 1)
                    .with_var_args(&[1188, 1276]),
            ],
        )])
        .unwrap();
        assert_eq!(bytecode.delay_times, vec![1116, 1188, 1276, 1356]);
        assert_eq!(bytecode.opcodes, vec![17, 16, 0]);
        assert_eq!(
            bytecode.operands,
            vec![40, 128, 125, 64, 0, 3, 0, 0, 0, 0, 1, 4]
        );
    }

    #[test]
    fn test_aux_and_filter() {
        let bytecode = compile(vec![Instrument::new(
            1,
            vec![
                Unit::new("filter")
                    .with("frequency", 32)
                    .with("resonance", 64)
                    .with("lowpass", 1)
                    .with("bandpass", -1)
                    .with("highpass", 1),
                Unit::new("aux").with("gain", 100).with("channel", 2),
            ],
        )])
        .unwrap();
        assert_eq!(bytecode.operands, vec![32, 64, 0x40 + 0x08 + 0x10, 100, 2]);
    }

    #[test]
    fn test_local_send_forward_and_backward() {
        let bytecode = compile(vec![Instrument::new(
            1,
            vec![
                Unit::new("send")
                    .with("amount", 96)
                    .with("target", 7)
                    .with("port", 1)
                    .with("sendpop", 1),
                Unit::new("filter").with_id(7),
                Unit::new("send").with("amount", 32).with("target", 7).with("port", 0),
            ],
        )])
        .unwrap();
        // filter is the second unit
        assert_eq!(address_at(&bytecode, 1), (2 << 4) + 1 + 0x8);
        assert_eq!(address_at(&bytecode, 7), 2 << 4);
    }

    #[test]
    fn test_global_send_to_all_voices() {
        let bytecode = compile(vec![
            Instrument::new(
                1,
                vec![Unit::new("send").with("target", 3).with("port", 6).with("sendpop", 1)],
            ),
            Instrument::new(2, vec![Unit::new("oscillator").with_id(3)]),
        ])
        .unwrap();
        assert_eq!(bytecode.opcodes, vec![56, 56, 0, 42, 0]);
        // target instrument starts at voice 1, unit 1
        let first = 0x8000 + 6 + (1 << 4) + 16 + 0x400;
        assert_eq!(address_at(&bytecode, 1), first);
        assert_eq!(address_at(&bytecode, 4), first + 0x400 + 0x8);
    }

    #[test]
    fn test_global_send_to_one_voice() {
        let bytecode = compile(vec![Instrument::new(
            3,
            vec![
                Unit::new("loadval").with_id(5),
                Unit::new("send").with("target", 5).with("voice", 3),
            ],
        )])
        .unwrap();
        assert_eq!(address_at(&bytecode, 2), 0x8000 + 2 * 0x400 + (1 << 4) + 16);
        assert_eq!(describe_send(address_at(&bytecode, 2)), "voice=2 unit=0 port=0");
    }

    #[test]
    fn test_unresolved_send() {
        let bytecode = compile(vec![Instrument::new(
            1,
            vec![
                Unit::new("send").with("target", 99),
                Unit::new("send").with("target", 99).with("sendpop", 1),
            ],
        )])
        .unwrap();
        assert_eq!(address_at(&bytecode, 1), 0xFFF7);
        assert_eq!(address_at(&bytecode, 4), 0xFFFF);
    }

    #[test]
    fn test_send_to_untyped_unit() {
        // a unit without a type gets no label, so it is no send target
        let bytecode = compile(vec![Instrument::new(
            1,
            vec![Unit::default().with_id(5), Unit::new("send").with("target", 5)],
        )])
        .unwrap();
        assert_eq!(address_at(&bytecode, 1), 0xFFF7);
    }

    #[test]
    fn test_disassemble() {
        let bytecode = compile(vec![Instrument::new(
            2,
            vec![
                Unit::new("envelope")
                    .with("attack", 32)
                    .with("decay", 32)
                    .with("sustain", 64)
                    .with("release", 64)
                    .with("gain", 128),
                Unit::new("send").with("target", 1).with("port", 6).with("sendpop", 1),
                Unit::new("oscillator").with_id(1).with("type", 2),
                Unit::new("out").with("stereo", 1),
            ],
        )])
        .unwrap();
        expect![[r#"
                 0: envelope [32, 32, 64, 64, 128]
                 1: send [0] unit=2 port=6 pop
                 2: oscillator [0, 0, 0, 0, 0, 0] flags=0x10
                 3: out stereo [0]
            end instrument 0
            delay times: []
            polyphony: 00000000000000000000000000000010
            voices: 2
        "#]]
        .assert_eq(&bytecode.disassemble());
    }
}

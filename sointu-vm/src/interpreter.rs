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

//! A bytecode interpreter for the sointu virtual machine.
//!
//! The interpreter executes bytecode compiled with [`AllFeatures`], as the
//! opcode numbers are fixed. Every frame runs the opcodes of each instrument
//! once per voice, on a software stack of signals. Units read their
//! parameters as the encoded operand plus whatever was sent to their ports
//! since they last ran.

use std::f64::consts::PI;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, trace};

use sointu_core::unit_type::UNIT_TYPES;
use sointu_core::Patch;

use crate::bytecode::{Bytecode, CompileError, MAX_UNITS, MAX_VOICES};
use crate::features::AllFeatures;
use crate::opcodes::Opcode;
use crate::samples::SampleTable;
use crate::synth::{CpuLoad, RenderError, RenderErrorKind, Rendered, Synth, Synther};
use crate::wave::Stereo;

/// Length of every delay line; delay times are 16 bits.
const DELAY_LINE_LENGTH: usize = 1 << 16;

/// Number of zeros kept at the bottom of the stack. A frame must end with
/// exactly these left.
const STACK_SENTINELS: usize = 4;

const ENV_ATTACK: f32 = 0.0;
const ENV_DECAY: f32 = 1.0;
const ENV_RELEASE: f32 = 3.0;

#[derive(Debug, Clone, Copy, Default)]
struct UnitState {
    state: [f32; 8],
    ports: [f32; 8],
}

#[derive(Debug, Clone)]
struct Voice {
    note: u8,
    sustain: bool,
    units: [UnitState; MAX_UNITS],
}

impl Default for Voice {
    fn default() -> Self {
        Self {
            note: 0,
            sustain: false,
            units: [UnitState::default(); MAX_UNITS],
        }
    }
}

struct DelayLine {
    buffer: Box<[f32]>,
    damp_state: f32,
    dc_in: f32,
    dc_filt_state: f32,
}

impl DelayLine {
    fn new() -> Self {
        Self {
            buffer: vec![0.0; DELAY_LINE_LENGTH].into_boxed_slice(),
            damp_state: 0.0,
            dc_in: 0.0,
            dc_filt_state: 0.0,
        }
    }
}

struct SynthState {
    /// The global bus; channels 0 and 1 are the output of the synth.
    outputs: [f32; 8],
    rand_seed: u32,
    /// Sample clock of the delay lines.
    global_time: u32,
    voices: Vec<Voice>,
}

impl SynthState {
    fn new() -> Self {
        Self {
            outputs: [0.0; 8],
            rand_seed: 1,
            global_time: 0,
            voices: vec![Voice::default(); MAX_VOICES],
        }
    }

    fn rand(&mut self) -> f32 {
        self.rand_seed = self.rand_seed.wrapping_mul(16007);
        self.rand_seed as i32 as f32 / -2147483648.0
    }
}

/// Maps a parameter in [0, 1] to a smoothing coefficient.
fn nonlinear_map(value: f32) -> f32 {
    ((-24.0 * value) as f64).exp2() as f32
}

fn clip(value: f32) -> f32 {
    value.max(-1.0).min(1.0)
}

fn crush(value: f32, amount: f32) -> f32 {
    let n = nonlinear_map(amount);
    ((value / n) as f64).round() as f32 * n
}

fn waveshape(value: f32, amount: f32) -> f32 {
    value * amount / (1.0 - amount + (2.0 * amount - 1.0) * value.abs())
}

fn next_operand(operands: &[u8], position: &mut usize) -> Result<u8, RenderErrorKind> {
    let operand = *operands
        .get(*position)
        .ok_or(RenderErrorKind::OperandsEnded)?;
    *position += 1;
    Ok(operand)
}

/// Global bus channels used by a unit, if they exist.
fn bus_channels(channel: u8, channels: usize) -> Result<usize, RenderErrorKind> {
    let channel = channel as usize;
    if channel + channels > 8 {
        return Err(RenderErrorKind::InvalidChannel { channel });
    }
    Ok(channel)
}

/// The single threaded reference synth.
pub struct Interpreter {
    bytecode: Bytecode,
    stack: Vec<f32>,
    state: SynthState,
    delay_lines: Vec<DelayLine>,
    samples: Arc<SampleTable>,
    trap_non_finite: bool,
    load: CpuLoad,
}

impl Interpreter {
    pub fn new(
        patch: &Patch,
        bpm: usize,
        samples: Arc<SampleTable>,
        trap_non_finite: bool,
    ) -> Result<Self, CompileError> {
        let bytecode = Bytecode::new(patch, &AllFeatures, bpm)?;
        let delay_lines = (0..patch.num_delay_lines())
            .map(|_| DelayLine::new())
            .collect();
        Ok(Self {
            bytecode,
            stack: Vec::with_capacity(64),
            state: SynthState::new(),
            delay_lines,
            samples,
            trap_non_finite,
            load: CpuLoad::default(),
        })
    }

    pub fn bytecode(&self) -> &Bytecode {
        &self.bytecode
    }

    fn run(
        &mut self,
        buffer: &mut [Stereo<f32>],
        max_time: i64,
        progress: &mut Rendered,
    ) -> Result<(), RenderErrorKind> {
        let Interpreter {
            bytecode,
            stack,
            state,
            delay_lines,
            samples,
            trap_non_finite,
            ..
        } = self;
        let operands = &bytecode.operands[..];
        let mut params = [0f32; 8];
        stack.clear();
        stack.extend_from_slice(&[0.0; STACK_SENTINELS]);

        while progress.time < max_time && progress.samples < buffer.len() {
            let mut opcodes_instr = 0;
            let mut operands_instr = 0;
            let mut op_pos = 0;
            let mut operand_pos = 0;
            let mut delay_line = 0;
            let mut voices_remaining = bytecode.num_voices;
            let mut voice_index = 0;
            let mut unit_index = 0;
            while voices_remaining > 0 {
                let op = *bytecode
                    .opcodes
                    .get(op_pos)
                    .ok_or(RenderErrorKind::OpcodesEnded)?;
                op_pos += 1;
                let channels = (op & 1) as usize + 1;
                let stereo = channels == 2;
                if op >> 1 == 0 {
                    voices_remaining -= 1;
                    if voices_remaining > 0 {
                        voice_index += 1;
                    }
                    unit_index = 0;
                    let mask = 1u32.checked_shl(voices_remaining).unwrap_or(0);
                    if bytecode.polyphony_bitmask & mask == mask {
                        op_pos = opcodes_instr;
                        operand_pos = operands_instr;
                    } else {
                        opcodes_instr = op_pos;
                        operands_instr = operand_pos;
                    }
                    continue;
                }
                let opcode = Opcode::from_index(op >> 1)
                    .ok_or(RenderErrorKind::InvalidOpcode { opcode: op })?;
                if unit_index >= MAX_UNITS {
                    return Err(RenderErrorKind::TooManyUnits);
                }
                let need = match opcode {
                    Opcode::Speed => 1,
                    Opcode::Sync => 0,
                    _ => UNIT_TYPES[opcode.index() as usize - 1]
                        .stack_effect(stereo)
                        .inputs,
                };
                if stack.len() < need {
                    return Err(RenderErrorKind::StackUnderflow);
                }

                let tcount = opcode.transform_count();
                if operand_pos + tcount > operands.len() {
                    return Err(RenderErrorKind::OperandsEnded);
                }
                let operands_at_transform = operand_pos;
                let (note, sustain) = {
                    let voice = &mut state.voices[voice_index];
                    let unit = &mut voice.units[unit_index];
                    for (i, param) in params.iter_mut().enumerate().take(tcount) {
                        *param = operands[operand_pos + i] as f32 / 128.0 + unit.ports[i];
                        unit.ports[i] = 0.0;
                    }
                    (voice.note, voice.sustain)
                };
                operand_pos += tcount;

                let l = stack.len();
                match opcode {
                    Opcode::Add => {
                        if stereo {
                            stack[l - 1] += stack[l - 3];
                            stack[l - 2] += stack[l - 4];
                        } else {
                            stack[l - 1] += stack[l - 2];
                        }
                    }
                    Opcode::Addp => {
                        if stereo {
                            stack[l - 3] += stack[l - 1];
                            stack[l - 4] += stack[l - 2];
                        } else {
                            stack[l - 2] += stack[l - 1];
                        }
                        stack.truncate(l - channels);
                    }
                    Opcode::Mul => {
                        if stereo {
                            stack[l - 1] *= stack[l - 3];
                            stack[l - 2] *= stack[l - 4];
                        } else {
                            stack[l - 1] *= stack[l - 2];
                        }
                    }
                    Opcode::Mulp => {
                        if stereo {
                            stack[l - 3] *= stack[l - 1];
                            stack[l - 4] *= stack[l - 2];
                        } else {
                            stack[l - 2] *= stack[l - 1];
                        }
                        stack.truncate(l - channels);
                    }
                    Opcode::Xch => {
                        if stereo {
                            stack.swap(l - 3, l - 1);
                            stack.swap(l - 4, l - 2);
                        } else {
                            stack.swap(l - 2, l - 1);
                        }
                    }
                    Opcode::Push => {
                        if stereo {
                            stack.push(stack[l - 2]);
                        }
                        stack.push(stack[l - 1]);
                    }
                    Opcode::Pop => stack.truncate(l - channels),
                    Opcode::Distort => {
                        for value in &mut stack[l - channels..] {
                            *value = waveshape(*value, params[0]);
                        }
                    }
                    Opcode::Loadval => {
                        let value = params[0] * 2.0 - 1.0;
                        stack.extend(std::iter::repeat(value).take(channels));
                    }
                    Opcode::Out => {
                        state.outputs[0] += params[0] * stack[l - 1];
                        if stereo {
                            state.outputs[1] += params[0] * stack[l - 2];
                        }
                        stack.truncate(l - channels);
                    }
                    Opcode::Outaux => {
                        state.outputs[0] += params[0] * stack[l - 1];
                        state.outputs[2] += params[1] * stack[l - 1];
                        if stereo {
                            state.outputs[1] += params[0] * stack[l - 2];
                            state.outputs[3] += params[1] * stack[l - 2];
                        }
                        stack.truncate(l - channels);
                    }
                    Opcode::Aux => {
                        let channel = bus_channels(next_operand(operands, &mut operand_pos)?, channels)?;
                        if stereo {
                            state.outputs[channel + 1] += params[0] * stack[l - 2];
                        }
                        state.outputs[channel] += params[0] * stack[l - 1];
                        stack.truncate(l - channels);
                    }
                    Opcode::Speed => {
                        let unit = &mut state.voices[voice_index].units[unit_index];
                        let r = unit.state[0]
                            + (((stack[l - 1] * 2.206896551724138) as f64).exp2() - 1.0) as f32;
                        let w = (r + 1.5) as i32 - 1;
                        unit.state[0] = r - w as f32;
                        progress.time += w as i64;
                        stack.truncate(l - 1);
                    }
                    Opcode::In => {
                        let channel = bus_channels(next_operand(operands, &mut operand_pos)?, channels)?;
                        if stereo {
                            stack.push(state.outputs[channel + 1]);
                            state.outputs[channel + 1] = 0.0;
                        }
                        stack.push(state.outputs[channel]);
                        state.outputs[channel] = 0.0;
                    }
                    Opcode::Envelope => {
                        let unit = &mut state.voices[voice_index].units[unit_index];
                        if !sustain {
                            unit.state[0] = ENV_RELEASE;
                        }
                        let mut env_state = unit.state[0];
                        let mut level = unit.state[1];
                        if env_state == ENV_ATTACK {
                            level += nonlinear_map(params[0]);
                            if level >= 1.0 {
                                level = 1.0;
                                env_state = ENV_DECAY;
                            }
                        } else if env_state == ENV_DECAY {
                            level -= nonlinear_map(params[1]);
                            if level <= params[2] {
                                level = params[2];
                            }
                        } else if env_state == ENV_RELEASE {
                            level -= nonlinear_map(params[3]);
                            if level <= 0.0 {
                                level = 0.0;
                            }
                        }
                        unit.state[0] = env_state;
                        unit.state[1] = level;
                        let output = level * params[4];
                        stack.extend(std::iter::repeat(output).take(channels));
                    }
                    Opcode::Noise => {
                        for _ in 0..channels {
                            let value = waveshape(state.rand(), params[0]) * params[1];
                            stack.push(value);
                        }
                    }
                    Opcode::Gain => {
                        for value in &mut stack[l - channels..] {
                            *value *= params[0];
                        }
                    }
                    Opcode::Invgain => {
                        for value in &mut stack[l - channels..] {
                            *value /= params[0];
                        }
                    }
                    Opcode::Dbgain => {
                        let gain = 2f64.powf((params[0] * 2.0 - 1.0) as f64 * 6.643856189774724) as f32;
                        for value in &mut stack[l - channels..] {
                            *value *= gain;
                        }
                    }
                    Opcode::Clip => {
                        for value in &mut stack[l - channels..] {
                            *value = clip(*value);
                        }
                    }
                    Opcode::Crush => {
                        for value in &mut stack[l - channels..] {
                            *value = crush(*value, params[0]);
                        }
                    }
                    Opcode::Hold => {
                        let unit = &mut state.voices[voice_index].units[unit_index];
                        let freq2 = params[0] * params[0];
                        for i in 0..channels {
                            let mut phase = unit.state[i] - freq2;
                            if phase <= 0.0 {
                                unit.state[2 + i] = stack[l - 1 - i];
                                phase += 1.0;
                            }
                            stack[l - 1 - i] = unit.state[2 + i];
                            unit.state[i] = phase;
                        }
                    }
                    Opcode::Send => {
                        let low = next_operand(operands, &mut operand_pos)?;
                        let high = next_operand(operands, &mut operand_pos)?;
                        let address = u16::from_le_bytes([low, high]);
                        let mut addr = address;
                        let mut target_voice = voice_index;
                        if addr & 0x8000 == 0x8000 {
                            addr = addr.wrapping_sub(0x8010);
                            target_voice = (addr >> 10) as usize;
                        }
                        let invalid = RenderErrorKind::InvalidSendTarget { address };
                        let target_unit = (((addr & 0x01F0) >> 4) as usize)
                            .checked_sub(1)
                            .ok_or_else(|| invalid.clone())?;
                        let port = (addr & 7) as usize;
                        let amount = params[0] * 2.0 - 1.0;
                        let target = state
                            .voices
                            .get_mut(target_voice)
                            .and_then(|voice| voice.units.get_mut(target_unit))
                            .ok_or(invalid)?;
                        for i in 0..channels {
                            // a stereo send to the last port spills over; the
                            // spill is dropped
                            if let Some(target_port) = target.ports.get_mut(port + i) {
                                *target_port += stack[l - 1 - i] * amount;
                            }
                        }
                        if addr & 0x8 == 0x8 {
                            stack.truncate(l - channels);
                        }
                    }
                    Opcode::Receive => {
                        let unit = &mut state.voices[voice_index].units[unit_index];
                        if stereo {
                            stack.push(unit.ports[1]);
                            unit.ports[1] = 0.0;
                        }
                        stack.push(unit.ports[0]);
                        unit.ports[0] = 0.0;
                    }
                    Opcode::Loadnote => {
                        let value = note as f32 / 64.0 - 1.0;
                        stack.extend(std::iter::repeat(value).take(channels));
                    }
                    Opcode::Pan => {
                        let mut l = l;
                        if !stereo {
                            stack.push(stack[l - 1]);
                            l += 1;
                        }
                        stack[l - 2] *= params[0];
                        stack[l - 1] *= 1.0 - params[0];
                    }
                    Opcode::Filter => {
                        let flags = next_operand(operands, &mut operand_pos)?;
                        let unit = &mut state.voices[voice_index].units[unit_index];
                        let freq2 = params[0] * params[0];
                        let res = params[1];
                        for i in 0..channels {
                            let mut low = unit.state[i];
                            let mut band = unit.state[2 + i];
                            low += freq2 * band;
                            let high = stack[l - 1 - i] - low - res * band;
                            band += freq2 * high;
                            unit.state[i] = low;
                            unit.state[2 + i] = band;
                            let mut output = 0.0;
                            if flags & 0x40 == 0x40 {
                                output += low;
                            }
                            if flags & 0x20 == 0x20 {
                                output += band;
                            }
                            if flags & 0x10 == 0x10 {
                                output += high;
                            }
                            if flags & 0x08 == 0x08 {
                                output -= band;
                            }
                            if flags & 0x04 == 0x04 {
                                output -= high;
                            }
                            stack[l - 1 - i] = output;
                        }
                    }
                    Opcode::Oscillator => {
                        let flags = next_operand(operands, &mut operand_pos)?;
                        let unit = &mut state.voices[voice_index].units[unit_index];
                        let lfo = flags & 0x08 == 0x08;
                        let unison = (flags & 3) as usize;
                        let mut detune_stereo = params[1] * 2.0 - 1.0;
                        for i in 0..channels {
                            let mut detune = detune_stereo;
                            let mut output = 0f32;
                            for j in 0..=unison {
                                let slot = i + j * 2;
                                let mut pitch = (64.0 * (params[0] * 2.0 - 1.0) + detune) as f64;
                                if !lfo {
                                    pitch += note as f64;
                                }
                                pitch *= 0.083333333333;
                                let mut omega = pitch.exp2();
                                omega *= if lfo { 0.000038 } else { 0.000092696138 };
                                omega += unit.ports[6] as f64;
                                unit.state[slot] += omega as f32;
                                let amplitude = if flags & 0x80 == 0x80 {
                                    let phase = unit.state[slot] + params[2];
                                    // the color operand holds the sample number
                                    let sample_no = operands[operands_at_transform + 3] as usize;
                                    let offset = bytecode
                                        .sample_offsets
                                        .get(sample_no)
                                        .ok_or(RenderErrorKind::InvalidSample { index: sample_no })?;
                                    let mut index = (phase * 84.28074964676522 + 0.5) as i64;
                                    let loop_start = offset.loop_start as i64;
                                    if index >= loop_start {
                                        index = (index - loop_start) % (offset.loop_length.max(1) as i64)
                                            + loop_start;
                                    }
                                    samples.read(index + offset.start as i64)
                                } else {
                                    unit.state[slot] -= ((unit.state[slot] + 1.0) as i32 - 1) as f32;
                                    let mut phase = unit.state[slot] + params[2];
                                    phase -= (phase as i32) as f32;
                                    let mut color = params[3];
                                    if flags & 0x40 == 0x40 {
                                        if phase < color {
                                            (2.0 * PI * (phase / color) as f64).sin() as f32
                                        } else {
                                            0.0
                                        }
                                    } else if flags & 0x20 == 0x20 {
                                        if phase >= color {
                                            phase = 1.0 - phase;
                                            color = 1.0 - color;
                                        }
                                        phase / color * 2.0 - 1.0
                                    } else if flags & 0x10 == 0x10 {
                                        if phase >= color {
                                            -1.0
                                        } else {
                                            1.0
                                        }
                                    } else if flags & 0x04 == 0x04 {
                                        let mask_low = operands[operands_at_transform + 3] as i32;
                                        let mask_high = operands[operands_at_transform + 4] as i32;
                                        let gate_bits = (mask_high << 8) + mask_low;
                                        let bit = (phase * 16.0 + 0.5) as i32 & 15;
                                        let mut amplitude = ((gate_bits >> bit) & 1) as f32;
                                        amplitude += 0.99609375 * (unit.state[4 + i] - amplitude);
                                        unit.state[4 + i] = amplitude;
                                        amplitude
                                    } else {
                                        0.0
                                    }
                                };
                                if flags & 0x04 == 0 {
                                    output += waveshape(amplitude, params[4]) * params[5];
                                } else {
                                    output += amplitude * params[5];
                                }
                                if j < unison {
                                    // keep the unison voices out of phase
                                    params[2] += 0.08333333;
                                }
                                detune = -detune * 0.5;
                            }
                            stack.push(output);
                            detune_stereo = -detune_stereo;
                        }
                        unit.ports[6] = 0.0;
                    }
                    Opcode::Delay => {
                        let mut index = next_operand(operands, &mut operand_pos)? as usize;
                        let count = next_operand(operands, &mut operand_pos)?;
                        let unit = &mut state.voices[voice_index].units[unit_index];
                        let pregain2 = params[0] * params[0];
                        let dry = params[1];
                        let feedback = params[2];
                        let damp = params[3];
                        let t = state.global_time as u16;
                        for stack_index in l - channels..l {
                            let signal = stack[stack_index];
                            let mut output = dry * signal;
                            let mut last_line = None;
                            for _ in (0..count).step_by(2) {
                                let line = delay_lines
                                    .get_mut(delay_line)
                                    .ok_or(RenderErrorKind::DelayLinesExhausted)?;
                                let mut delay = *bytecode
                                    .delay_times
                                    .get(index)
                                    .ok_or(RenderErrorKind::InvalidDelayTime { index })?
                                    as f32
                                    + unit.ports[4] * 32767.0;
                                if count & 1 == 0 {
                                    delay /= (note as f64 * 0.083333333333).exp2() as f32;
                                }
                                let read = t.wrapping_sub((delay + 0.5) as i32 as u16);
                                let delayed = line.buffer[read as usize];
                                output += delayed;
                                line.damp_state = damp * line.damp_state + (1.0 - damp) * delayed;
                                line.buffer[t as usize] = feedback * line.damp_state + pregain2 * signal;
                                index += 1;
                                last_line = Some(delay_line);
                                delay_line += 1;
                            }
                            // the dc filter lives in the last line of the channel
                            let line = last_line
                                .and_then(|i| delay_lines.get_mut(i))
                                .ok_or(RenderErrorKind::DelayLinesExhausted)?;
                            line.dc_filt_state = output + (0.99609375 * line.dc_filt_state - line.dc_in);
                            line.dc_in = output;
                            stack[stack_index] = line.dc_filt_state;
                        }
                        unit.ports[4] = 0.0;
                    }
                    Opcode::Compressor => {
                        let unit = &mut state.voices[voice_index].units[unit_index];
                        let mut signal_level = stack[l - 1] * stack[l - 1];
                        if stereo {
                            signal_level += stack[l - 2] * stack[l - 2];
                        }
                        let mut current_level = unit.state[0];
                        let param = if signal_level < current_level { 1 } else { 0 };
                        let alpha = nonlinear_map(params[param]);
                        current_level += (signal_level - current_level) * alpha;
                        unit.state[0] = current_level;
                        let mut gain = 1f32;
                        let threshold2 = params[3] * params[3];
                        if current_level > threshold2 {
                            gain = ((threshold2 / current_level) as f64).powf((params[4] / 2.0) as f64)
                                as f32;
                        }
                        gain /= params[2];
                        stack.extend(std::iter::repeat(gain).take(channels));
                    }
                    Opcode::Sync => {}
                }
                unit_index += 1;
                if *trap_non_finite {
                    if let Some(top) = stack.last() {
                        if !top.is_finite() {
                            return Err(RenderErrorKind::NonFinite {
                                opcode: opcode.name(),
                            });
                        }
                    }
                }
            }
            if stack.len() < STACK_SENTINELS {
                return Err(RenderErrorKind::StackUnderflow);
            }
            if stack.len() > STACK_SENTINELS {
                return Err(RenderErrorKind::StackNotEmpty {
                    depth: stack.len() - STACK_SENTINELS,
                });
            }
            buffer[progress.samples] = Stereo::new(state.outputs[0], state.outputs[1]);
            state.outputs[0] = 0.0;
            state.outputs[1] = 0.0;
            progress.samples += 1;
            progress.time += 1;
            state.global_time = state.global_time.wrapping_add(1);
        }
        Ok(())
    }
}

impl Synth for Interpreter {
    fn trigger(&mut self, voice: usize, note: u8) {
        trace!("Trigger voice {} with note {}", voice, note);
        if let Some(v) = self.state.voices.get_mut(voice) {
            *v = Voice {
                note,
                sustain: true,
                ..Voice::default()
            };
        }
    }

    fn release(&mut self, voice: usize) {
        trace!("Release voice {}", voice);
        if let Some(v) = self.state.voices.get_mut(voice) {
            v.sustain = false;
        }
    }

    fn update(&mut self, patch: &Patch, bpm: usize) -> Result<(), CompileError> {
        let bytecode = Bytecode::new(patch, &AllFeatures, bpm)?;
        let needs_refresh = bytecode.opcodes != self.bytecode.opcodes;
        self.bytecode = bytecode;
        while self.delay_lines.len() < patch.num_delay_lines() {
            self.delay_lines.push(DelayLine::new());
        }
        if needs_refresh {
            debug!("Opcodes changed, resetting unit states");
            for voice in self.state.voices.iter_mut() {
                voice.units = [UnitState::default(); MAX_UNITS];
            }
        }
        Ok(())
    }

    fn render(&mut self, buffer: &mut [Stereo<f32>], max_time: i64) -> Result<Rendered, RenderError> {
        let start = Instant::now();
        let mut progress = Rendered::default();
        let result = self.run(buffer, max_time, &mut progress);
        self.load = CpuLoad::measure(start.elapsed(), progress.samples);
        match result {
            Ok(()) => Ok(progress),
            Err(kind) => Err(RenderError::new(progress, kind)),
        }
    }

    fn cpu_load(&self, loads: &mut [CpuLoad]) -> usize {
        match loads.first_mut() {
            Some(load) => {
                *load = self.load;
                1
            }
            None => 0,
        }
    }
}

/// Creates [`Interpreter`]s.
#[derive(Debug, Clone, Default)]
pub struct InterpreterSynther {
    /// Fail rendering when a unit produces an infinity or NaN.
    pub trap_non_finite: bool,
    /// Sample data for sample oscillators; the global table if not given.
    pub samples: Option<Arc<SampleTable>>,
}

impl InterpreterSynther {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_trap_non_finite(mut self, trap_non_finite: bool) -> Self {
        self.trap_non_finite = trap_non_finite;
        self
    }

    pub fn with_samples(mut self, samples: Arc<SampleTable>) -> Self {
        self.samples = Some(samples);
        self
    }
}

impl Synther for InterpreterSynther {
    fn name(&self) -> &str {
        "interpreter"
    }

    fn supports_parallelism(&self) -> bool {
        false
    }

    fn synth(&self, patch: &Patch, bpm: usize) -> Result<Box<dyn Synth>, CompileError> {
        let samples = match &self.samples {
            Some(samples) => Arc::clone(samples),
            None => SampleTable::global(),
        };
        let synth = Interpreter::new(patch, bpm, samples, self.trap_non_finite)?;
        Ok(Box::new(synth))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use expect_test::expect;
    use sointu_core::{Instrument, Unit};

    fn synther() -> InterpreterSynther {
        InterpreterSynther::new().with_samples(Arc::new(SampleTable::default()))
    }

    fn synth(instruments: Vec<Instrument>) -> Box<dyn Synth> {
        synther().synth(&instruments.into(), 100).unwrap()
    }

    fn render(synth: &mut dyn Synth, frames: usize) -> Vec<Stereo<f32>> {
        let mut buffer = vec![Stereo::SILENCE; frames];
        let rendered = synth.render(&mut buffer, frames as i64).unwrap();
        assert_eq!(rendered.samples, frames);
        buffer
    }

    fn assert_close(actual: f32, expected: f32) {
        assert!(
            (actual - expected).abs() < 1e-6,
            "{} is not close to {}",
            actual,
            expected
        );
    }

    fn envelope() -> Unit {
        Unit::new("envelope")
            .with("attack", 32)
            .with("decay", 32)
            .with("sustain", 64)
            .with("release", 64)
            .with("gain", 128)
    }

    fn sine(transpose: i32, phase: i32, color: i32, shape: i32) -> Unit {
        Unit::new("oscillator")
            .with("transpose", transpose)
            .with("detune", 64)
            .with("phase", phase)
            .with("color", color)
            .with("shape", shape)
            .with("gain", 128)
            .with("type", 0)
    }

    #[test]
    fn test_empty_patch_is_silent() {
        let mut synth = synth(vec![]);
        let buffer = render(synth.as_mut(), 44100);
        assert!(buffer.iter().all(|frame| *frame == Stereo::SILENCE));
    }

    #[test]
    fn test_limits() {
        let mut synth = synth(vec![]);
        let mut buffer = vec![Stereo::SILENCE; 16];
        assert_eq!(synth.render(&mut [], 100), Ok(Rendered::default()));
        assert_eq!(synth.render(&mut buffer, 0), Ok(Rendered::default()));
        assert_eq!(
            synth.render(&mut buffer, 10),
            Ok(Rendered {
                samples: 10,
                time: 10
            })
        );
    }

    #[test]
    fn test_sine_note() {
        let units = vec![
            envelope(),
            sine(64, 0, 96, 64),
            Unit::new("mulp"),
            envelope(),
            sine(72, 64, 64, 96),
            Unit::new("mulp"),
            Unit::new("out").with("stereo", 1).with("gain", 128),
        ];
        let samples = 2 * 6615 * 16;
        let play = || {
            let mut synth = synth(vec![Instrument::new(1, units.clone())]);
            synth.trigger(0, 64);
            let mut buffer = render(synth.as_mut(), samples / 2);
            synth.release(0);
            buffer.extend(render(synth.as_mut(), samples / 2));
            buffer
        };
        let first = play();
        assert!(first.iter().all(|frame| frame.is_finite()));
        assert!(first.iter().any(|frame| frame.left.abs() > 0.01));
        assert!(first.iter().all(|frame| frame.left.abs() <= 1.0));
        // the envelopes have fully released by the end
        assert!(first[samples - 100..].iter().all(|frame| frame.left.abs() < 1e-3));
        assert_eq!(first, play());

        // the envelopes peak at frame 63 and settle at 95; after the release
        // at 105840 they reach zero at 107887
        let mut frames = String::new();
        for &i in &[0, 1, 10, 63, 64, 80, 96, 100, 1000, 20000, 44100, 105839, 105840, 106840, 107887] {
            frames += &format!("{}: {:.4} {:.4}\n", i, first[i].left, first[i].right);
        }
        expect![[r#"
            0: 0.0000 0.0005
            1: 0.0000 0.0020
            10: 0.0000 0.0580
            63: 0.0000 0.9077
            64: 0.0000 0.8802
            80: 0.0000 0.4180
            96: 0.4643 0.0522
            100: 0.4910 -0.0103
            1000: -0.4370 -0.0376
            20000: 0.4859 -0.0035
            44100: 0.4994 0.0000
            105839: -0.4902 -0.4983
            105840: -0.4849 -0.4991
            106840: -0.2472 0.1608
            107887: 0.0000 0.0000
        "#]]
        .assert_eq(&frames);
    }

    #[test]
    fn test_stack_underflow() {
        let mut synth = synth(vec![Instrument::new(1, vec![Unit::new("pop")])]);
        let mut buffer = [Stereo::SILENCE; 1];
        let err = synth.render(&mut buffer, 1).unwrap_err();
        assert_eq!(err.kind, RenderErrorKind::StackUnderflow);
        assert_eq!(err.rendered, Rendered::default());
    }

    #[test]
    fn test_stack_leak() {
        let mut synth = synth(vec![Instrument::new(1, vec![Unit::new("push")])]);
        let mut buffer = [Stereo::SILENCE; 1];
        let err = synth.render(&mut buffer, 1).unwrap_err();
        assert_eq!(err.kind, RenderErrorKind::StackNotEmpty { depth: 1 });
    }

    #[test]
    fn test_divide_by_zero() {
        let patch: Patch = vec![Instrument::new(
            1,
            vec![
                Unit::new("loadval").with("value", 128),
                Unit::new("invgain").with("invgain", 0),
                Unit::new("pop"),
            ],
        )]
        .into();
        let mut buffer = [Stereo::SILENCE; 1];

        let mut lenient = synther().synth(&patch, 100).unwrap();
        assert!(lenient.render(&mut buffer, 1).is_ok());

        let mut strict = synther().with_trap_non_finite(true).synth(&patch, 100).unwrap();
        let err = strict.render(&mut buffer, 1).unwrap_err();
        assert_eq!(err.kind, RenderErrorKind::NonFinite { opcode: "invgain" });
    }

    #[test]
    fn test_mono_and_stereo_out() {
        let mut synth = synth(vec![
            Instrument::new(
                1,
                vec![
                    Unit::new("loadval").with("value", 128),
                    Unit::new("out").with("gain", 128),
                ],
            ),
            Instrument::new(
                1,
                vec![
                    Unit::new("loadval").with("value", 32),
                    Unit::new("loadval").with("value", 96),
                    Unit::new("out").with("stereo", 1).with("gain", 64),
                ],
            ),
        ]);
        let buffer = render(synth.as_mut(), 2);
        // the later signal goes left
        assert_eq!(buffer[0], Stereo::new(1.25, -0.25));
        assert_eq!(buffer[1], buffer[0]);
    }

    #[test]
    fn test_polyphony_and_notes() {
        let mut synth = synth(vec![
            Instrument::new(
                2,
                vec![Unit::new("loadnote"), Unit::new("out").with("gain", 128)],
            ),
            Instrument::new(1, vec![Unit::new("loadval").with("value", 64), Unit::new("pop")]),
        ]);
        synth.trigger(0, 96);
        synth.trigger(1, 128);
        let buffer = render(synth.as_mut(), 1);
        assert_eq!(buffer[0].left, 1.5);
    }

    #[test]
    fn test_local_send() {
        let mut synth = synth(vec![Instrument::new(
            1,
            vec![
                Unit::new("loadval").with("value", 128),
                Unit::new("send")
                    .with("amount", 128)
                    .with("target", 1)
                    .with("sendpop", 1),
                Unit::new("receive").with_id(1),
                Unit::new("out").with("gain", 128),
            ],
        )]);
        let buffer = render(synth.as_mut(), 2);
        assert_eq!(buffer[0].left, 1.0);
        // ports are cleared once received
        assert_eq!(buffer[1].left, 1.0);
    }

    #[test]
    fn test_global_send() {
        let mut synth = synth(vec![
            Instrument::new(
                1,
                vec![
                    Unit::new("loadval").with("value", 96),
                    Unit::new("send")
                        .with("amount", 128)
                        .with("target", 2)
                        .with("sendpop", 1),
                ],
            ),
            Instrument::new(
                2,
                vec![
                    Unit::new("receive").with_id(2),
                    Unit::new("out").with("gain", 128),
                ],
            ),
        ]);
        let buffer = render(synth.as_mut(), 1);
        // both voices of the second instrument receive
        assert_eq!(buffer[0].left, 1.0);
    }

    #[test]
    fn test_speed() {
        let mut synth = synth(vec![Instrument::new(
            1,
            vec![Unit::new("loadval").with("value", 128), Unit::new("speed")],
        )]);
        let mut buffer = [Stereo::SILENCE; 10];
        assert_eq!(
            synth.render(&mut buffer, 10),
            Ok(Rendered {
                samples: 3,
                time: 14
            })
        );
    }

    #[test]
    fn test_noise() {
        let mut synth = synth(vec![Instrument::new(
            1,
            vec![
                Unit::new("noise").with("shape", 64).with("gain", 128),
                Unit::new("out").with("gain", 128),
            ],
        )]);
        let buffer = render(synth.as_mut(), 2);
        assert_close(buffer[0].left, 16007.0 / -2147483648.0);
        let seed = 16007u32.wrapping_mul(16007);
        assert_close(buffer[1].left, seed as i32 as f32 / -2147483648.0);
    }

    #[test]
    fn test_delay_echo() {
        let mut synth = synth(vec![Instrument::new(
            1,
            vec![
                Unit::new("loadval").with("value", 128),
                Unit::new("delay")
                    .with("pregain", 128)
                    .with("dry", 0)
                    .with("feedback", 0)
                    .with("damp", 0)
                    .with_var_args(&[2]),
                Unit::new("out").with("gain", 128),
            ],
        )]);
        let left: Vec<f32> = render(synth.as_mut(), 4).iter().map(|f| f.left).collect();
        assert_eq!(left, vec![0.0, 0.0, 1.0, 0.99609375]);
    }

    #[test]
    fn test_sample_oscillator() {
        let table = SampleTable::from_bytes(vec![0, 0, 0x00, 0x40]);
        let patch: Patch = vec![Instrument::new(
            1,
            vec![
                Unit::new("oscillator")
                    .with("transpose", 64)
                    .with("detune", 64)
                    .with("shape", 64)
                    .with("gain", 128)
                    .with("type", 4)
                    .with("samplestart", 1)
                    .with("looplength", 1),
                Unit::new("out").with("gain", 128),
            ],
        )]
        .into();
        let mut synth = synther().with_samples(Arc::new(table)).synth(&patch, 100).unwrap();
        let buffer = render(synth.as_mut(), 3);
        assert!(buffer.iter().all(|f| f.left == 16384.0 / 32767.0));
    }

    #[test]
    fn test_update() {
        let attack = |gain| {
            vec![Instrument::new(
                1,
                vec![
                    Unit::new("envelope")
                        .with("attack", 64)
                        .with("sustain", 128)
                        .with("gain", 128),
                    Unit::new("out").with("gain", gain),
                ],
            )]
        };
        let step = (-12f64).exp2() as f32;
        let mut synth = synth(attack(128));
        synth.trigger(0, 64);
        let buffer = render(synth.as_mut(), 10);
        assert_close(buffer[9].left, 10.0 * step);

        // same opcodes, so the envelope keeps its level
        synth.update(&attack(64).into(), 100).unwrap();
        let buffer = render(synth.as_mut(), 1);
        assert_close(buffer[0].left, 11.0 * step * 0.5);

        // a stereo output changes the opcodes and resets the envelope
        let mut stereo = attack(128);
        stereo[0].units[0].parameters.set("stereo", 1);
        stereo[0].units[1].parameters.set("stereo", 1);
        synth.update(&stereo.into(), 100).unwrap();
        let buffer = render(synth.as_mut(), 1);
        assert_close(buffer[0].left, step);
        assert_close(buffer[0].right, step);

        let too_many: Patch = vec![Instrument::new(33, vec![])].into();
        assert_eq!(
            synth.update(&too_many, 100),
            Err(CompileError::TooManyVoices { voices: 33 })
        );
        let buffer = render(synth.as_mut(), 1);
        assert_close(buffer[0].left, 2.0 * step);
    }

    #[test]
    fn test_envelope_release() {
        let mut synth = synth(vec![Instrument::new(
            1,
            vec![
                Unit::new("envelope")
                    .with("attack", 0)
                    .with("decay", 0)
                    .with("sustain", 64)
                    .with("release", 0)
                    .with("gain", 128),
                Unit::new("out").with("gain", 128),
            ],
        )]);
        synth.trigger(0, 64);
        let left: Vec<f32> = render(synth.as_mut(), 3).iter().map(|f| f.left).collect();
        assert_eq!(left, vec![1.0, 0.5, 0.5]);
        synth.release(0);
        assert_eq!(render(synth.as_mut(), 1)[0].left, 0.0);
    }

    #[test]
    fn test_cpu_load() {
        let mut synth = synth(vec![]);
        render(synth.as_mut(), 100);
        let mut loads = [CpuLoad(-1.0); 2];
        assert_eq!(synth.cpu_load(&mut loads), 1);
        assert!(loads[0].0 >= 0.0);
        assert_eq!(loads[1], CpuLoad(-1.0));
    }
}

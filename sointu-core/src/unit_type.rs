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

//! The static catalogue of unit types.
//!
//! The order of the parameters of a unit type is significant: the parameters
//! that can both be set and modulated are encoded as the default operands of
//! the unit, in this order, and every modulatable parameter gets a port number
//! in the order it appears here.

/// Describes one parameter of a unit type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitParameter {
    pub name: &'static str,
    /// Minimum value, inclusive.
    pub min: i32,
    /// Maximum value, inclusive. Smaller than `min` for pure modulation ports.
    pub max: i32,
    pub neutral: i32,
    /// Whether the value is stored in the patch.
    pub can_set: bool,
    /// Whether sends can target this parameter, i.e. it has a port.
    pub can_modulate: bool,
}

impl UnitParameter {
    const fn new(name: &'static str, min: i32, max: i32) -> Self {
        Self {
            name,
            min,
            max,
            neutral: min,
            can_set: true,
            can_modulate: false,
        }
    }

    const fn modulated(name: &'static str, min: i32, max: i32) -> Self {
        Self {
            can_modulate: true,
            ..Self::new(name, min, max)
        }
    }

    const fn port(name: &'static str) -> Self {
        Self {
            can_set: false,
            can_modulate: true,
            ..Self::new(name, 0, -1)
        }
    }

    const fn with_neutral(self, neutral: i32) -> Self {
        Self { neutral, ..self }
    }

    /// Parameters that are encoded as default operands in the bytecode.
    pub fn is_default_operand(&self) -> bool {
        self.can_set && self.can_modulate
    }

    /// Clamp a value into the range of the parameter. Ports have no range.
    pub fn clamp(&self, value: i32) -> i32 {
        if self.max < self.min {
            value
        } else {
            value.max(self.min).min(self.max)
        }
    }
}

/// How many signals a unit consumes from the stack and how many it leaves
/// in their place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackEffect {
    pub inputs: usize,
    pub outputs: usize,
}

impl StackEffect {
    const fn new(inputs: usize, outputs: usize) -> Self {
        Self { inputs, outputs }
    }

    pub fn change(&self) -> isize {
        self.outputs as isize - self.inputs as isize
    }
}

const SOURCE: [StackEffect; 2] = [StackEffect::new(0, 1), StackEffect::new(0, 2)];
const SINK: [StackEffect; 2] = [StackEffect::new(1, 0), StackEffect::new(2, 0)];
const EFFECT: [StackEffect; 2] = [StackEffect::new(1, 1), StackEffect::new(2, 2)];
const BINARY: [StackEffect; 2] = [StackEffect::new(2, 2), StackEffect::new(4, 4)];
const BINARY_POP: [StackEffect; 2] = [StackEffect::new(2, 1), StackEffect::new(4, 2)];

/// Static description of a unit type.
#[derive(Debug)]
pub struct UnitType {
    pub name: &'static str,
    pub params: &'static [UnitParameter],
    stack: [StackEffect; 2],
}

impl UnitType {
    pub fn param(&self, name: &str) -> Option<&'static UnitParameter> {
        self.params.iter().find(|p| p.name == name)
    }

    /// The modulatable parameters, in port order.
    pub fn ports(&self) -> impl Iterator<Item = &'static UnitParameter> {
        self.params.iter().filter(|p| p.can_modulate)
    }

    pub fn port_index(&self, name: &str) -> Option<usize> {
        self.ports().position(|p| p.name == name)
    }

    /// The parameter behind a port number.
    pub fn find_param_for_port(&self, port: usize) -> Option<&'static UnitParameter> {
        self.ports().nth(port)
    }

    /// Number of default operands emitted for this unit type.
    pub fn transform_count(&self) -> usize {
        self.params.iter().filter(|p| p.is_default_operand()).count()
    }

    pub fn stack_effect(&self, stereo: bool) -> StackEffect {
        self.stack[stereo as usize]
    }
}

const STEREO: UnitParameter = UnitParameter::new("stereo", 0, 1);
const GAIN: UnitParameter = UnitParameter::modulated("gain", 0, 128);
const CHANNEL: UnitParameter = UnitParameter::new("channel", 0, 6);

const ONLY_STEREO: &[UnitParameter] = &[STEREO];
const NOTHING: &[UnitParameter] = &[];

const AUX: &[UnitParameter] = &[STEREO, GAIN, CHANNEL];
const COMPRESSOR: &[UnitParameter] = &[
    STEREO,
    UnitParameter::modulated("attack", 0, 128),
    UnitParameter::modulated("release", 0, 128),
    UnitParameter::modulated("invgain", 0, 128),
    UnitParameter::modulated("threshold", 0, 128),
    UnitParameter::modulated("ratio", 0, 128),
];
const CRUSH: &[UnitParameter] = &[STEREO, UnitParameter::modulated("resolution", 0, 128)];
const DBGAIN: &[UnitParameter] = &[
    STEREO,
    UnitParameter::modulated("decibels", 0, 128).with_neutral(64),
];
const DELAY: &[UnitParameter] = &[
    STEREO,
    UnitParameter::modulated("pregain", 0, 128),
    UnitParameter::modulated("dry", 0, 128),
    UnitParameter::modulated("feedback", 0, 128),
    UnitParameter::modulated("damp", 0, 128),
    UnitParameter::new("notetracking", 0, 2),
    UnitParameter::port("delaytime"),
];
const DISTORT: &[UnitParameter] = &[
    STEREO,
    UnitParameter::modulated("drive", 0, 128).with_neutral(64),
];
const ENVELOPE: &[UnitParameter] = &[
    STEREO,
    UnitParameter::modulated("attack", 0, 128),
    UnitParameter::modulated("decay", 0, 128),
    UnitParameter::modulated("sustain", 0, 128),
    UnitParameter::modulated("release", 0, 128),
    GAIN,
];
const FILTER: &[UnitParameter] = &[
    STEREO,
    UnitParameter::modulated("frequency", 0, 128),
    UnitParameter::modulated("resonance", 0, 128).with_neutral(128),
    UnitParameter::new("lowpass", 0, 1),
    UnitParameter::new("bandpass", -1, 1),
    UnitParameter::new("highpass", -1, 1),
];
const GAIN_UNIT: &[UnitParameter] = &[STEREO, GAIN];
const HOLD: &[UnitParameter] = &[STEREO, UnitParameter::modulated("holdfreq", 0, 128)];
const IN: &[UnitParameter] = &[STEREO, CHANNEL];
const INVGAIN: &[UnitParameter] = &[STEREO, UnitParameter::modulated("invgain", 0, 128)];
const LOADVAL: &[UnitParameter] = &[STEREO, UnitParameter::modulated("value", 0, 128)];
const NOISE: &[UnitParameter] = &[
    STEREO,
    UnitParameter::modulated("shape", 0, 128).with_neutral(64),
    GAIN,
];
const OSCILLATOR: &[UnitParameter] = &[
    STEREO,
    UnitParameter::modulated("transpose", 0, 128).with_neutral(64),
    UnitParameter::modulated("detune", 0, 128).with_neutral(64),
    UnitParameter::modulated("phase", 0, 128),
    UnitParameter::modulated("color", 0, 128),
    UnitParameter::modulated("shape", 0, 128).with_neutral(64),
    GAIN,
    UnitParameter::port("frequency"),
    UnitParameter::new("type", OscillatorType::Sine as i32, OscillatorType::Sample as i32),
    UnitParameter::new("lfo", 0, 1),
    UnitParameter::new("unison", 0, 3),
    UnitParameter::new("samplestart", 0, 1_720_329),
    UnitParameter::new("loopstart", 0, 65535),
    UnitParameter::new("looplength", 0, 65535),
];
const OUTAUX: &[UnitParameter] = &[
    STEREO,
    UnitParameter::modulated("outgain", 0, 128),
    UnitParameter::modulated("auxgain", 0, 128),
];
const PAN: &[UnitParameter] = &[
    STEREO,
    UnitParameter::modulated("panning", 0, 128).with_neutral(64),
];
const RECEIVE: &[UnitParameter] = &[
    STEREO,
    UnitParameter::port("left"),
    UnitParameter::port("right"),
];
const SEND: &[UnitParameter] = &[
    STEREO,
    UnitParameter::modulated("amount", 0, 128).with_neutral(64),
    UnitParameter::new("voice", 0, 32),
    UnitParameter::new("target", 0, i32::MAX),
    UnitParameter::new("port", 0, 7),
    UnitParameter::new("sendpop", 0, 1),
];

/// Every unit type, sorted by name. The position in this table plus one is
/// the opcode index of the type when all features are compiled in.
pub static UNIT_TYPES: [UnitType; 31] = [
    UnitType { name: "add", params: ONLY_STEREO, stack: BINARY },
    UnitType { name: "addp", params: ONLY_STEREO, stack: BINARY_POP },
    UnitType { name: "aux", params: AUX, stack: SINK },
    UnitType { name: "clip", params: ONLY_STEREO, stack: EFFECT },
    UnitType {
        name: "compressor",
        params: COMPRESSOR,
        stack: [StackEffect::new(1, 2), StackEffect::new(2, 4)],
    },
    UnitType { name: "crush", params: CRUSH, stack: EFFECT },
    UnitType { name: "dbgain", params: DBGAIN, stack: EFFECT },
    UnitType { name: "delay", params: DELAY, stack: EFFECT },
    UnitType { name: "distort", params: DISTORT, stack: EFFECT },
    UnitType { name: "envelope", params: ENVELOPE, stack: SOURCE },
    UnitType { name: "filter", params: FILTER, stack: EFFECT },
    UnitType { name: "gain", params: GAIN_UNIT, stack: EFFECT },
    UnitType { name: "hold", params: HOLD, stack: EFFECT },
    UnitType { name: "in", params: IN, stack: SOURCE },
    UnitType { name: "invgain", params: INVGAIN, stack: EFFECT },
    UnitType { name: "loadnote", params: ONLY_STEREO, stack: SOURCE },
    UnitType { name: "loadval", params: LOADVAL, stack: SOURCE },
    UnitType { name: "mul", params: ONLY_STEREO, stack: BINARY },
    UnitType { name: "mulp", params: ONLY_STEREO, stack: BINARY_POP },
    UnitType { name: "noise", params: NOISE, stack: SOURCE },
    UnitType { name: "oscillator", params: OSCILLATOR, stack: SOURCE },
    UnitType { name: "out", params: GAIN_UNIT, stack: SINK },
    UnitType { name: "outaux", params: OUTAUX, stack: SINK },
    UnitType {
        name: "pan",
        params: PAN,
        stack: [StackEffect::new(1, 2), StackEffect::new(2, 2)],
    },
    UnitType { name: "pop", params: ONLY_STEREO, stack: SINK },
    UnitType {
        name: "push",
        params: ONLY_STEREO,
        stack: [StackEffect::new(1, 2), StackEffect::new(2, 4)],
    },
    UnitType { name: "receive", params: RECEIVE, stack: SOURCE },
    // the popping variant is handled by `Unit::stack_effect`
    UnitType { name: "send", params: SEND, stack: EFFECT },
    UnitType {
        name: "speed",
        params: NOTHING,
        stack: [StackEffect::new(1, 0), StackEffect::new(0, 0)],
    },
    UnitType {
        name: "sync",
        params: NOTHING,
        stack: [StackEffect::new(1, 1), StackEffect::new(0, 0)],
    },
    UnitType { name: "xch", params: ONLY_STEREO, stack: BINARY },
];

/// Position of a unit type in the sorted catalogue.
pub fn unit_type_index(name: &str) -> Option<usize> {
    UNIT_TYPES
        .binary_search_by(|t| t.name.cmp(name))
        .ok()
}

pub fn unit_type(name: &str) -> Option<&'static UnitType> {
    unit_type_index(name).map(|i| &UNIT_TYPES[i])
}

/// All unit type names in sorted order.
pub fn unit_names() -> impl Iterator<Item = &'static str> {
    UNIT_TYPES.iter().map(|t| t.name)
}

/// The waveform selected by the `type` parameter of an oscillator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OscillatorType {
    Sine = 0,
    Trisaw = 1,
    Pulse = 2,
    Gate = 3,
    Sample = 4,
}

impl OscillatorType {
    pub fn from_param(value: i32) -> Option<Self> {
        match value {
            0 => Some(OscillatorType::Sine),
            1 => Some(OscillatorType::Trisaw),
            2 => Some(OscillatorType::Pulse),
            3 => Some(OscillatorType::Gate),
            4 => Some(OscillatorType::Sample),
            _ => None,
        }
    }
}

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

//! Patches: instruments made of units.

use std::collections::BTreeMap;
use std::ops;

use serde::{Deserialize, Serialize};

use crate::unit_type::{self, StackEffect};

/// Parameter values of a unit, keyed by parameter name.
///
/// Missing parameters read as zero. Old patches describing filters with
/// `negbandpass` and `neghighpass` are folded into `bandpass` and `highpass`
/// when loading.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, i32>", into = "BTreeMap<String, i32>")]
pub struct ParamMap(BTreeMap<String, i32>);

impl ParamMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> i32 {
        self.0.get(name).copied().unwrap_or(0)
    }

    pub fn set(&mut self, name: &str, value: i32) {
        self.0.insert(name.to_string(), value);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i32)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl From<BTreeMap<String, i32>> for ParamMap {
    fn from(mut map: BTreeMap<String, i32>) -> Self {
        if let Some(n) = map.remove("negbandpass") {
            *map.entry("bandpass".to_string()).or_insert(0) -= n;
        }
        if let Some(n) = map.remove("neghighpass") {
            *map.entry("highpass".to_string()).or_insert(0) -= n;
        }
        ParamMap(map)
    }
}

impl From<ParamMap> for BTreeMap<String, i32> {
    fn from(params: ParamMap) -> Self {
        params.0
    }
}

fn is_zero(value: &i32) -> bool {
    *value == 0
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// One processing step of an instrument, e.g. an oscillator or a filter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Unit {
    /// Key into the unit type catalogue. Units with an empty type are skipped.
    #[serde(rename = "type", alias = "Type", skip_serializing_if = "String::is_empty")]
    pub unit_type: String,
    /// Non-zero ids make the unit a possible target of sends.
    #[serde(alias = "ID", skip_serializing_if = "is_zero")]
    pub id: i32,
    #[serde(alias = "Parameters")]
    pub parameters: ParamMap,
    /// Variable length arguments, the delay times of a delay unit.
    #[serde(rename = "varargs", alias = "VarArgs", skip_serializing_if = "Vec::is_empty")]
    pub var_args: Vec<i32>,
    /// Disabled units behave as if they were not in the patch at all.
    #[serde(alias = "Disabled", skip_serializing_if = "is_false")]
    pub disabled: bool,
    #[serde(alias = "Comment", skip_serializing_if = "String::is_empty")]
    pub comment: String,
}

impl Unit {
    pub fn new(unit_type: &str) -> Self {
        Self {
            unit_type: unit_type.to_string(),
            ..Self::default()
        }
    }

    /// Builder style parameter setter.
    pub fn with(mut self, name: &str, value: i32) -> Self {
        self.parameters.set(name, value);
        self
    }

    pub fn with_id(mut self, id: i32) -> Self {
        self.id = id;
        self
    }

    pub fn with_var_args(mut self, var_args: &[i32]) -> Self {
        self.var_args = var_args.to_vec();
        self
    }

    pub fn param(&self, name: &str) -> i32 {
        self.parameters.get(name)
    }

    pub fn is_stereo(&self) -> bool {
        self.param("stereo") == 1
    }

    /// Whether the unit takes part in compilation.
    pub fn is_active(&self) -> bool {
        !self.disabled && !self.unit_type.is_empty()
    }

    /// How the unit affects the signal stack. Disabled and unknown units do
    /// not touch the stack.
    pub fn stack_effect(&self) -> StackEffect {
        if !self.is_active() {
            return StackEffect {
                inputs: 0,
                outputs: 0,
            };
        }
        let stereo = self.is_stereo();
        match unit_type::unit_type(&self.unit_type) {
            Some(t) => {
                let effect = t.stack_effect(stereo);
                if self.unit_type == "send" && self.param("sendpop") == 1 {
                    StackEffect {
                        inputs: effect.inputs,
                        outputs: 0,
                    }
                } else {
                    effect
                }
            }
            None => StackEffect {
                inputs: 0,
                outputs: 0,
            },
        }
    }

    /// Net change of the stack depth caused by this unit.
    pub fn stack_change(&self) -> isize {
        self.stack_effect().change()
    }

    /// Number of signals that must be on the stack before the unit runs.
    pub fn stack_need(&self) -> usize {
        self.stack_effect().inputs
    }
}

/// Non-fatal problems found by walking the signal stack of an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackAdvisory {
    /// The unit at this index needs more signals than are on the stack.
    Underflow { unit: usize, need: usize, have: usize },
    /// Signals remain on the stack once all units have run.
    Leftover { count: usize },
}

impl std::fmt::Display for StackAdvisory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StackAdvisory::Underflow { unit, need, have } => write!(
                f,
                "Unit {} needs {} signals on the stack, but there are only {}",
                unit, need, have
            ),
            StackAdvisory::Leftover { count } => {
                write!(f, "Instrument leaves {} signals on the stack", count)
            }
        }
    }
}

/// A sound source with its own units, played by one or more voices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Instrument {
    #[serde(alias = "Name", skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(alias = "Comment", skip_serializing_if = "String::is_empty")]
    pub comment: String,
    #[serde(rename = "numvoices", alias = "NumVoices")]
    pub num_voices: usize,
    /// Only used by trackers for muting; compiled players ignore it.
    #[serde(alias = "Mute", skip_serializing_if = "is_false")]
    pub mute: bool,
    /// Bitmask of the cores rendering this instrument, minus one, so that
    /// the default 0 means core 0 only.
    #[serde(rename = "threadmaskm1", alias = "ThreadMaskM1", skip_serializing_if = "is_zero_u32")]
    pub core_mask_minus_one: u32,
    #[serde(alias = "Units")]
    pub units: Vec<Unit>,
}

fn is_zero_u32(value: &u32) -> bool {
    *value == 0
}

impl Default for Instrument {
    fn default() -> Self {
        Self {
            name: String::new(),
            comment: String::new(),
            num_voices: 1,
            mute: false,
            core_mask_minus_one: 0,
            units: Vec::new(),
        }
    }
}

impl Instrument {
    pub fn new(num_voices: usize, units: Vec<Unit>) -> Self {
        Self {
            num_voices,
            units,
            ..Self::default()
        }
    }

    pub fn with_core_mask_minus_one(mut self, mask: u32) -> Self {
        self.core_mask_minus_one = mask;
        self
    }

    /// Number of cores needed to honor the core mask.
    pub fn num_cores(&self) -> usize {
        let mask = self.core_mask_minus_one as u64 + 1;
        (64 - mask.leading_zeros()) as usize
    }

    /// Walk the units and report stack problems.
    pub fn stack_check(&self) -> Vec<StackAdvisory> {
        let mut advisories = Vec::new();
        let mut depth = 0usize;
        for (index, unit) in self.units.iter().enumerate() {
            let effect = unit.stack_effect();
            if effect.inputs > depth {
                advisories.push(StackAdvisory::Underflow {
                    unit: index,
                    need: effect.inputs,
                    have: depth,
                });
                depth = effect.inputs;
            }
            depth = depth - effect.inputs + effect.outputs;
        }
        if depth > 0 {
            advisories.push(StackAdvisory::Leftover { count: depth });
        }
        advisories
    }
}

/// A list of instruments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Patch(pub Vec<Instrument>);

impl ops::Deref for Patch {
    type Target = [Instrument];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl ops::DerefMut for Patch {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<Vec<Instrument>> for Patch {
    fn from(instruments: Vec<Instrument>) -> Self {
        Patch(instruments)
    }
}

impl Patch {
    /// Total number of voices over all instruments.
    pub fn num_voices(&self) -> usize {
        self.iter().map(|i| i.num_voices).sum()
    }

    /// Number of delay lines the interpreter allocates for this patch.
    pub fn num_delay_lines(&self) -> usize {
        self.iter()
            .map(|instr| {
                instr
                    .units
                    .iter()
                    .filter(|u| u.is_active() && u.unit_type == "delay")
                    .map(|u| u.var_args.len() * instr.num_voices)
                    .sum::<usize>()
            })
            .sum()
    }

    /// Number of cores the patch asks for; always at least one.
    pub fn num_cores(&self) -> usize {
        self.iter().map(|i| i.num_cores()).max().unwrap_or(1).max(1)
    }

    /// Index of the first voice of an instrument, i.e. the cumulative sum of
    /// the voices before it.
    pub fn first_voice_for_instrument(&self, instrument: usize) -> usize {
        self.iter().take(instrument).map(|i| i.num_voices).sum()
    }

    /// The instrument playing the given voice.
    pub fn instrument_for_voice(&self, voice: usize) -> Option<usize> {
        let mut remaining = voice;
        for (index, instr) in self.iter().enumerate() {
            if remaining < instr.num_voices {
                return Some(index);
            }
            remaining -= instr.num_voices;
        }
        None
    }

    /// Find the (instrument, unit) indices of the active unit with the given
    /// id. Id 0 means "no id" and never matches.
    pub fn find_unit(&self, id: i32) -> Option<(usize, usize)> {
        if id == 0 {
            return None;
        }
        self.iter().enumerate().find_map(|(i, instr)| {
            instr
                .units
                .iter()
                .position(|u| u.id == id && u.is_active())
                .map(|u| (i, u))
        })
    }
}

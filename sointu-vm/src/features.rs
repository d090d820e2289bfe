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

//! Feature sets decide which opcodes and parameter values a compiled
//! virtual machine supports, and thereby how units are encoded.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use sointu_core::unit_type::{self, UNIT_TYPES};
use sointu_core::Patch;

pub trait FeatureSet {
    /// The opcode byte of a unit type with the stereo bit cleared, if the
    /// unit type is supported.
    fn opcode(&self, unit_type: &str) -> Option<u8>;

    /// Number of default operands of a unit type.
    fn transform_count(&self, unit_type: &str) -> usize {
        unit_type::unit_type(unit_type).map_or(0, |t| t.transform_count())
    }

    /// Supported unit types in opcode order.
    fn instructions(&self) -> Vec<&str>;

    /// Port number of a parameter.
    fn input_number(&self, unit_type: &str, param: &str) -> Option<usize> {
        unit_type::unit_type(unit_type).and_then(|t| t.port_index(param))
    }

    fn supports_param_value(&self, unit_type: &str, param: &str, value: i32) -> bool;

    fn supports_param_value_other_than(&self, unit_type: &str, param: &str, value: i32) -> bool;

    fn supports_modulation(&self, unit_type: &str, param: &str) -> bool;

    fn supports_polyphony(&self) -> bool;

    fn supports_global_send(&self) -> bool;
}

/// Supports everything. This is what the interpreter executes, as its
/// opcodes are fixed.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllFeatures;

impl FeatureSet for AllFeatures {
    fn opcode(&self, unit_type: &str) -> Option<u8> {
        unit_type::unit_type_index(unit_type).map(|position| ((position + 1) * 2) as u8)
    }

    fn instructions(&self) -> Vec<&str> {
        UNIT_TYPES.iter().map(|t| t.name).collect()
    }

    fn supports_param_value(&self, _unit_type: &str, _param: &str, _value: i32) -> bool {
        true
    }

    fn supports_param_value_other_than(&self, _unit_type: &str, _param: &str, _value: i32) -> bool {
        true
    }

    fn supports_modulation(&self, _unit_type: &str, _param: &str) -> bool {
        true
    }

    fn supports_polyphony(&self) -> bool {
        true
    }

    fn supports_global_send(&self) -> bool {
        true
    }
}

type ParamKey = (String, String);

/// Supports only what a particular patch uses.
#[derive(Debug, Clone, Default)]
pub struct NecessaryFeatures {
    opcodes: HashMap<String, u8>,
    instructions: Vec<String>,
    param_values: BTreeMap<ParamKey, BTreeSet<i32>>,
    modulations: BTreeSet<ParamKey>,
    global_send: bool,
    polyphony: bool,
}

fn key(unit_type: &str, param: &str) -> ParamKey {
    (unit_type.to_string(), param.to_string())
}

impl NecessaryFeatures {
    pub fn for_patch(patch: &Patch) -> Self {
        let mut features = Self::default();
        for (instr_index, instr) in patch.iter().enumerate() {
            for unit in instr.units.iter().filter(|u| u.is_active()) {
                if !features.opcodes.contains_key(&unit.unit_type) {
                    features.instructions.push(unit.unit_type.clone());
                    let opcode = (features.instructions.len() * 2) as u8;
                    features.opcodes.insert(unit.unit_type.clone(), opcode);
                }
                if let Some(t) = unit_type::unit_type(&unit.unit_type) {
                    for param in t.params {
                        features
                            .param_values
                            .entry(key(t.name, param.name))
                            .or_default()
                            .insert(unit.param(param.name));
                    }
                }
                if unit.unit_type == "send" {
                    features.add_send(patch, instr_index, unit);
                }
            }
            if instr.num_voices > 1 {
                features.polyphony = true;
            }
        }
        features
    }

    fn add_send(&mut self, patch: &Patch, instr_index: usize, unit: &sointu_core::Unit) {
        let (target_instr, target_unit) = match patch.find_unit(unit.param("target")) {
            Some(found) => found,
            None => return,
        };
        let target = &patch[target_instr].units[target_unit];
        let param = match unit_type::unit_type(&target.unit_type)
            .and_then(|t| t.find_param_for_port(unit.param("port") as usize))
        {
            Some(param) if unit.param("port") >= 0 => param,
            _ => return,
        };
        if target_instr != instr_index || unit.param("voice") > 0 {
            self.global_send = true;
        }
        self.modulations.insert(key(&target.unit_type, param.name));
    }
}

impl FeatureSet for NecessaryFeatures {
    fn opcode(&self, unit_type: &str) -> Option<u8> {
        self.opcodes.get(unit_type).copied()
    }

    fn instructions(&self) -> Vec<&str> {
        self.instructions.iter().map(|s| s.as_str()).collect()
    }

    fn supports_param_value(&self, unit_type: &str, param: &str, value: i32) -> bool {
        self.param_values
            .get(&key(unit_type, param))
            .map_or(false, |values| values.contains(&value))
    }

    fn supports_param_value_other_than(&self, unit_type: &str, param: &str, value: i32) -> bool {
        self.param_values
            .get(&key(unit_type, param))
            .map_or(false, |values| values.iter().any(|v| *v != value))
    }

    fn supports_modulation(&self, unit_type: &str, param: &str) -> bool {
        self.modulations.contains(&key(unit_type, param))
    }

    fn supports_polyphony(&self) -> bool {
        self.polyphony
    }

    fn supports_global_send(&self) -> bool {
        self.global_send
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use sointu_core::{Instrument, Unit};

    #[test]
    fn test_all_features() {
        let features = AllFeatures;
        assert_eq!(features.opcode("add"), Some(2));
        assert_eq!(features.opcode("oscillator"), Some(42));
        assert_eq!(features.opcode("xch"), Some(62));
        assert_eq!(features.opcode("belleq"), None);
        assert_eq!(features.instructions().len(), 31);
        assert_eq!(features.transform_count("delay"), 4);
        assert_eq!(features.input_number("oscillator", "frequency"), Some(6));
    }

    #[test]
    fn test_necessary_features() {
        let patch: Patch = vec![
            Instrument::new(
                1,
                vec![
                    Unit::new("oscillator").with_id(1).with("color", 64),
                    Unit::new("send")
                        .with("target", 1)
                        .with("port", 6)
                        .with("sendpop", 1),
                    Unit {
                        disabled: true,
                        ..Unit::new("noise")
                    },
                ],
            ),
            Instrument::new(
                2,
                vec![Unit::new("oscillator").with("color", 32), Unit::new("out")],
            ),
        ]
        .into();
        let features = NecessaryFeatures::for_patch(&patch);
        assert_eq!(features.instructions(), vec!["oscillator", "send", "out"]);
        assert_eq!(features.opcode("oscillator"), Some(2));
        assert_eq!(features.opcode("out"), Some(6));
        assert_eq!(features.opcode("noise"), None);
        assert!(features.supports_param_value("oscillator", "color", 32));
        assert!(!features.supports_param_value("oscillator", "color", 31));
        assert!(features.supports_param_value_other_than("oscillator", "color", 32));
        assert!(!features.supports_param_value_other_than("out", "gain", 0));
        assert!(features.supports_modulation("oscillator", "frequency"));
        assert!(!features.supports_modulation("oscillator", "gain"));
        assert!(features.supports_polyphony());
        assert!(!features.supports_global_send());
    }
}

// This file is part of opbundler.
//
// opbundler is free software: you can redistribute it and/or modify it under the
// terms of the GNU Lesser General Public License as published by the Free Software
// Foundation, either version 3 of the License, or (at your option) any later version.
//
// opbundler is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY;
// without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
// See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with opbundler.
// If not, see https://www.gnu.org/licenses/.

use std::collections::HashMap;

use alloy_primitives::{fixed_bytes, Address, Bytes, FixedBytes};
use anyhow::bail;
use opbundler_provider::GethTrace;
use opbundler_types::EntityType;
use serde::Deserialize;

use crate::trace::TraceRecord;

/// Collector tracer shipped with the bundler
pub const DEFAULT_VALIDATION_TRACER_JS: &str = include_str!("../tracer/validation_tracer.js");

const CREATE_SENDER_SELECTOR: FixedBytes<4> = fixed_bytes!("570e1a36");
const VALIDATE_USER_OP_SELECTOR: FixedBytes<4> = fixed_bytes!("3a871cdd");
const VALIDATE_PAYMASTER_USER_OP_SELECTOR: FixedBytes<4> = fixed_bytes!("f465c77e");

/// Output of the validation tracer
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TracerOutput {
    /// One entry per call made by the entry point itself
    #[serde(default)]
    pub calls_from_entry_point: Vec<TopLevelCallInfo>,
    /// Flat call log below the entry point
    #[serde(default)]
    pub calls: Vec<TraceRecord>,
    /// Revert data of the top level `simulateValidation` call
    #[serde(default)]
    pub revert_data: Option<Bytes>,
}

/// Opcode usage of a call made directly by the entry point
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopLevelCallInfo {
    /// Selector of the call
    pub top_level_method_sig: Bytes,
    /// Target of the call
    pub top_level_target_address: Address,
    /// Opcode counts below the call
    #[serde(default)]
    pub opcodes: HashMap<String, u64>,
}

impl TopLevelCallInfo {
    /// The validation phase this call belongs to, by selector
    pub fn phase(&self) -> Option<EntityType> {
        if self.top_level_method_sig.len() != 4 {
            return None;
        }
        match FixedBytes::<4>::from_slice(&self.top_level_method_sig) {
            s if s == CREATE_SENDER_SELECTOR => Some(EntityType::Factory),
            s if s == VALIDATE_USER_OP_SELECTOR => Some(EntityType::Account),
            s if s == VALIDATE_PAYMASTER_USER_OP_SELECTOR => Some(EntityType::Paymaster),
            _ => None,
        }
    }
}

impl TracerOutput {
    /// Opcode counts grouped by validation phase
    pub fn opcodes_by_phase(&self) -> HashMap<EntityType, HashMap<String, u64>> {
        let mut out: HashMap<EntityType, HashMap<String, u64>> = HashMap::new();
        for call in &self.calls_from_entry_point {
            let Some(phase) = call.phase() else {
                continue;
            };
            let counts = out.entry(phase).or_default();
            for (opcode, count) in &call.opcodes {
                *counts.entry(opcode.clone()).or_default() += count;
            }
        }
        out
    }
}

impl TryFrom<GethTrace> for TracerOutput {
    type Error = anyhow::Error;

    fn try_from(trace: GethTrace) -> Result<Self, Self::Error> {
        match trace {
            GethTrace::JS(value) => Ok(TracerOutput::deserialize(&value)?),
            _ => bail!("Failed to deserialize simulation trace"),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_deserialize_and_group_phases() {
        let value = json!({
            "callsFromEntryPoint": [
                {
                    "topLevelMethodSig": "0x570e1a36",
                    "topLevelTargetAddress": "0x7fc98430eaedbb6070b35b39d798725049088348",
                    "opcodes": {"CREATE2": 1, "SLOAD": 3}
                },
                {
                    "topLevelMethodSig": "0x3a871cdd",
                    "topLevelTargetAddress": "0x1306b01bc3e4ad202612d3843387e94737673f53",
                    "opcodes": {"TIMESTAMP": 1}
                },
                {
                    "topLevelMethodSig": "0xb760faf9",
                    "topLevelTargetAddress": "0x5ff137d4b0fdcd49dca30c7cf57e578a026d2789",
                    "opcodes": {"GASPRICE": 1}
                }
            ],
            "calls": [
                {"type": "CALL", "to": "0x1306b01bc3e4ad202612d3843387e94737673f53", "method": "0x3a871cdd"},
                {"type": "RETURN", "data": "0x"}
            ],
            "revertData": "0x1234"
        });
        let out = TracerOutput::try_from(GethTrace::JS(value)).unwrap();
        assert_eq!(out.calls.len(), 2);
        assert_eq!(out.revert_data, Some(Bytes::from_static(&[0x12, 0x34])));

        let phases = out.opcodes_by_phase();
        assert_eq!(phases.len(), 2);
        assert_eq!(phases[&EntityType::Factory]["CREATE2"], 1);
        assert_eq!(phases[&EntityType::Account]["TIMESTAMP"], 1);
    }

    #[test]
    fn test_invalid_output_is_rejected() {
        assert!(TracerOutput::try_from(GethTrace::JS(json!({"calls": 5}))).is_err());
    }
}

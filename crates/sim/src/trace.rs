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

//! Call trace interpretation.
//!
//! The validation tracer emits a flat, depth first log of call frames: an
//! entering record when a frame starts and a RETURN or REVERT record when it
//! ends. [`interpret`] matches the two with a stack and produces one
//! [`CallEntry`] per completed frame, in completion (post) order.

use std::fmt::Display;

use alloy_primitives::{Address, Bytes, U256};
use alloy_sol_types::{Panic, Revert, SolError};
use opbundler_contracts::v0_6::IEntryPoint::FailedOp;
use serde::{Deserialize, Serialize};

/// Kind of a trace record
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum TraceKind {
    /// CALL
    #[default]
    Call,
    /// STATICCALL
    StaticCall,
    /// DELEGATECALL
    DelegateCall,
    /// CREATE
    Create,
    /// CREATE2
    Create2,
    /// Frame ended normally
    Return,
    /// Frame reverted
    Revert,
}

impl TraceKind {
    /// Whether the record opens a new frame
    pub fn is_entering(&self) -> bool {
        !self.is_exit()
    }

    /// Whether the record closes the innermost open frame
    pub fn is_exit(&self) -> bool {
        matches!(self, TraceKind::Return | TraceKind::Revert)
    }

    /// Whether the frame deploys a contract
    pub fn is_create(&self) -> bool {
        matches!(self, TraceKind::Create | TraceKind::Create2)
    }
}

/// A single record of the flat trace log
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceRecord {
    /// Record kind
    #[serde(rename = "type")]
    pub kind: TraceKind,
    /// Caller, unset on exit records
    #[serde(default)]
    pub from: Address,
    /// Call target, unset on exit records
    #[serde(default)]
    pub to: Address,
    /// Method selector of the call, unset on exit records
    #[serde(default)]
    pub method: Bytes,
    /// Return or revert data on exit records
    #[serde(default)]
    pub data: Bytes,
    /// Value sent with the call
    #[serde(default)]
    pub value: U256,
}

/// Decoded revert reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevertReason {
    /// Entry point `FailedOp(uint256,string)`
    FailedOp {
        /// Index of the failed operation
        op_index: U256,
        /// Reason string, prefixed with the entry point error code
        reason: String,
    },
    /// Solidity `Error(string)`
    Error(String),
    /// Solidity `Panic(uint256)`
    Panic(U256),
    /// Unrecognized revert payload
    Raw(Bytes),
}

impl RevertReason {
    /// Decode a revert payload, falling back to the raw bytes.
    pub fn decode(data: &[u8]) -> Self {
        if let Ok(failed_op) = FailedOp::abi_decode(data, false) {
            return Self::FailedOp {
                op_index: failed_op.opIndex,
                reason: failed_op.reason,
            };
        }
        if let Ok(revert) = Revert::abi_decode(data, false) {
            return Self::Error(revert.reason);
        }
        if let Ok(panic) = Panic::abi_decode(data, false) {
            return Self::Panic(panic.code);
        }
        Self::Raw(Bytes::copy_from_slice(data))
    }
}

impl Display for RevertReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FailedOp { op_index, reason } => write!(f, "FailedOp({op_index}, {reason})"),
            Self::Error(reason) => write!(f, "{reason}"),
            Self::Panic(code) => write!(f, "panic code {code:#x}"),
            Self::Raw(data) => write!(f, "{data}"),
        }
    }
}

/// How a call frame completed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    /// The frame returned the data
    Returned(Bytes),
    /// The frame reverted
    Reverted(RevertReason),
    /// A create frame deployed a contract at the address
    Created(Address),
}

/// A completed call frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallEntry {
    /// Caller
    pub from: Address,
    /// Call target
    pub to: Address,
    /// Kind of the entering record
    pub kind: TraceKind,
    /// Method selector
    pub method: Bytes,
    /// Value sent with the call
    pub value: U256,
    /// Outcome of the frame
    pub outcome: CallOutcome,
}

/// Errors for traces that do not describe a well formed call tree
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TraceError {
    /// An exit record with no open frame
    #[error("{0} at position {1} has no matching call")]
    UnmatchedExit(TraceKind, usize),
    /// Frames still open at the end of the trace
    #[error("trace ended with {0} unterminated calls")]
    Unterminated(usize),
    /// A create frame returned something that is not an address
    #[error("create at position {0} returned {1} bytes, expected an address")]
    InvalidCreatedAddress(usize, usize),
}

/// Interpret a flat trace log into completed call entries.
///
/// Entries are emitted in completion order: a frame is emitted after all of
/// the frames it opened.
pub fn interpret(records: &[TraceRecord]) -> Result<Vec<CallEntry>, TraceError> {
    let mut stack: Vec<&TraceRecord> = Vec::new();
    let mut entries = Vec::with_capacity(records.len() / 2);

    for (position, record) in records.iter().enumerate() {
        if record.kind.is_entering() {
            stack.push(record);
            continue;
        }

        let frame = stack
            .pop()
            .ok_or(TraceError::UnmatchedExit(record.kind, position))?;
        let outcome = match record.kind {
            TraceKind::Return if frame.kind.is_create() => CallOutcome::Created(
                decode_created_address(&record.data)
                    .ok_or(TraceError::InvalidCreatedAddress(position, record.data.len()))?,
            ),
            TraceKind::Revert => CallOutcome::Reverted(RevertReason::decode(&record.data)),
            _ => CallOutcome::Returned(record.data.clone()),
        };

        entries.push(CallEntry {
            from: frame.from,
            to: frame.to,
            kind: frame.kind,
            method: frame.method.clone(),
            value: frame.value,
            outcome,
        });
    }

    if !stack.is_empty() {
        return Err(TraceError::Unterminated(stack.len()));
    }
    Ok(entries)
}

// A raw 20 byte address, or an ABI encoded address word
fn decode_created_address(data: &[u8]) -> Option<Address> {
    match data.len() {
        20 => Some(Address::from_slice(data)),
        32 => Some(Address::from_slice(&data[12..])),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::{address, bytes};

    use super::*;

    const A: Address = address!("00000000000000000000000000000000000000aa");
    const B: Address = address!("00000000000000000000000000000000000000bb");

    fn enter(kind: TraceKind, to: Address) -> TraceRecord {
        TraceRecord {
            kind,
            to,
            method: bytes!("12345678"),
            ..Default::default()
        }
    }

    fn exit(kind: TraceKind, data: Bytes) -> TraceRecord {
        TraceRecord {
            kind,
            data,
            ..Default::default()
        }
    }

    #[test]
    fn test_call_return() {
        let out = interpret(&[
            enter(TraceKind::Call, A),
            exit(TraceKind::Return, bytes!("beef")),
        ])
        .unwrap();
        assert_eq!(
            out,
            vec![CallEntry {
                from: Address::ZERO,
                to: A,
                kind: TraceKind::Call,
                method: bytes!("12345678"),
                value: U256::ZERO,
                outcome: CallOutcome::Returned(bytes!("beef")),
            }]
        );
    }

    #[test]
    fn test_create_return_decodes_address() {
        let out = interpret(&[
            enter(TraceKind::Create, A),
            exit(TraceKind::Return, Bytes::copy_from_slice(B.as_slice())),
        ])
        .unwrap();
        assert_eq!(out[0].to, A);
        assert_eq!(out[0].outcome, CallOutcome::Created(B));
    }

    #[test]
    fn test_create2_return_decodes_word() {
        let mut word = [0u8; 32];
        word[12..].copy_from_slice(B.as_slice());
        let out = interpret(&[
            enter(TraceKind::Create2, A),
            exit(TraceKind::Return, Bytes::copy_from_slice(&word)),
        ])
        .unwrap();
        assert_eq!(out[0].outcome, CallOutcome::Created(B));
    }

    #[test]
    fn test_create_return_bad_address() {
        let err = interpret(&[
            enter(TraceKind::Create, A),
            exit(TraceKind::Return, bytes!("0102")),
        ])
        .unwrap_err();
        assert_eq!(err, TraceError::InvalidCreatedAddress(1, 2));
    }

    #[test]
    fn test_create_revert_is_reverted() {
        let out = interpret(&[
            enter(TraceKind::Create2, A),
            exit(TraceKind::Revert, Bytes::new()),
        ])
        .unwrap();
        assert_eq!(
            out[0].outcome,
            CallOutcome::Reverted(RevertReason::Raw(Bytes::new()))
        );
    }

    #[test]
    fn test_revert_decodes_error_string() {
        let data = Revert {
            reason: "not allowed".into(),
        }
        .abi_encode();
        let out = interpret(&[
            enter(TraceKind::StaticCall, A),
            exit(TraceKind::Revert, data.into()),
        ])
        .unwrap();
        assert_eq!(
            out[0].outcome,
            CallOutcome::Reverted(RevertReason::Error("not allowed".into()))
        );
    }

    #[test]
    fn test_revert_decodes_failed_op() {
        let data = FailedOp {
            opIndex: U256::ZERO,
            reason: "AA23 reverted (or OOG)".into(),
        }
        .abi_encode();
        assert_eq!(
            RevertReason::decode(&data),
            RevertReason::FailedOp {
                op_index: U256::ZERO,
                reason: "AA23 reverted (or OOG)".into()
            }
        );
    }

    #[test]
    fn test_revert_decodes_panic() {
        let data = Panic {
            code: U256::from(0x11),
        }
        .abi_encode();
        assert_eq!(RevertReason::decode(&data), RevertReason::Panic(U256::from(0x11)));
    }

    #[test]
    fn test_nested_calls_emit_post_order() {
        let out = interpret(&[
            enter(TraceKind::Call, A),
            enter(TraceKind::DelegateCall, B),
            exit(TraceKind::Return, bytes!("01")),
            exit(TraceKind::Revert, bytes!("02")),
        ])
        .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!((out[0].to, out[0].kind), (B, TraceKind::DelegateCall));
        assert_eq!(out[0].outcome, CallOutcome::Returned(bytes!("01")));
        assert_eq!((out[1].to, out[1].kind), (A, TraceKind::Call));
        assert_eq!(
            out[1].outcome,
            CallOutcome::Reverted(RevertReason::Raw(bytes!("02")))
        );
    }

    #[test]
    fn test_unmatched_exit() {
        let err = interpret(&[exit(TraceKind::Return, Bytes::new())]).unwrap_err();
        assert_eq!(err, TraceError::UnmatchedExit(TraceKind::Return, 0));
    }

    #[test]
    fn test_unterminated_call() {
        let err = interpret(&[
            enter(TraceKind::Call, A),
            enter(TraceKind::Call, B),
            exit(TraceKind::Return, Bytes::new()),
        ])
        .unwrap_err();
        assert_eq!(err, TraceError::Unterminated(1));
    }

    #[test]
    fn test_empty_trace() {
        assert_eq!(interpret(&[]).unwrap(), vec![]);
    }

    #[test]
    fn test_deserialize_tracer_records() {
        let records: Vec<TraceRecord> = serde_json::from_str(
            r#"[
                {"type":"CALL","from":"0x0000000000000000000000000000000000000001","to":"0x00000000000000000000000000000000000000aa","method":"0x12345678","value":"0x0","gas":1000},
                {"type":"RETURN","gasUsed":21,"data":"0x"}
            ]"#,
        )
        .unwrap();
        assert_eq!(records[0].kind, TraceKind::Call);
        assert_eq!(records[0].to, A);
        assert_eq!(records[1].kind, TraceKind::Return);
        assert_eq!(interpret(&records).unwrap().len(), 1);
    }
}

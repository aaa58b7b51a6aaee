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

use std::{collections::HashMap, sync::Arc, time::Duration};

use alloy_primitives::{fixed_bytes, Address, Bytes, FixedBytes, U256};
use alloy_sol_types::SolError;
#[cfg(feature = "test-utils")]
use mockall::automock;
use opbundler_contracts::v0_6::IEntryPoint::ValidationResult;
use opbundler_provider::{
    EntryPoint, EvmProvider, GethDebugTracerType, GethDebugTracingCallOptions,
    GethDebugTracingOptions, ProviderError,
};
use opbundler_types::{pool::MempoolError, EntityType, UserOperation};
use tracing::debug;

use crate::{
    trace::{interpret, CallEntry, RevertReason, TraceError},
    tracer::{TracerOutput, DEFAULT_VALIDATION_TRACER_JS},
};

/// Opcodes an entity may not use during validation
pub const FORBIDDEN_OPCODES: &[&str] = &[
    "GASPRICE",
    "GASLIMIT",
    "DIFFICULTY",
    "PREVRANDAO",
    "TIMESTAMP",
    "BASEFEE",
    "BLOCKHASH",
    "NUMBER",
    "SELFBALANCE",
    "BALANCE",
    "ORIGIN",
    "GAS",
    "CREATE",
    "COINBASE",
    "SELFDESTRUCT",
    "RANDOM",
];

const DEPOSIT_TO_SELECTOR: FixedBytes<4> = fixed_bytes!("b760faf9");

/// Simulation Settings
#[derive(Debug, Clone)]
pub struct Settings {
    /// Upper bound on a whole simulation, including the RPC round trip
    pub sim_timeout: Duration,
    /// Source of the javascript collector tracer
    pub tracer: String,
    /// The max duration of the javascript tracer on the node, in the node's
    /// duration format (e.g. "10s")
    pub tracer_timeout: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sim_timeout: Duration::from_secs(10),
            tracer: DEFAULT_VALIDATION_TRACER_JS.to_string(),
            tracer_timeout: "10s".to_string(),
        }
    }
}

/// Result of a successful validation simulation
#[derive(Clone, Debug, Default)]
pub struct SimulationResult {
    /// Completed call frames, in completion order
    pub calls: Vec<CallEntry>,
    /// Opcode counts per validation phase
    pub opcodes_by_phase: HashMap<EntityType, HashMap<String, u64>>,
    /// Gas used before execution
    pub pre_op_gas: U256,
    /// Whether the account or paymaster signature check failed
    pub sig_failed: bool,
    /// Start of the validity window
    pub valid_after: u64,
    /// End of the validity window, zero for no expiry
    pub valid_until: u64,
}

/// Errors that prevent a simulation from producing a result
#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    /// The simulation did not finish in time
    #[error("simulation timed out after {0:?}")]
    Timeout(Duration),
    /// The tracer returned something other than the expected output
    #[error("invalid tracer output: {0}")]
    InvalidTracerOutput(String),
    /// The call log was not balanced
    #[error(transparent)]
    MalformedTrace(#[from] TraceError),
    /// `simulateValidation` reverted with something other than a validation result
    #[error("validation reverted: {0}")]
    ValidationReverted(String),
    /// Provider failure
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl From<SimulationError> for MempoolError {
    fn from(err: SimulationError) -> Self {
        match err {
            SimulationError::MalformedTrace(e) => MempoolError::MalformedTrace(e.to_string()),
            SimulationError::Provider(e) => {
                MempoolError::Other(anyhow::Error::from(e).context("simulation provider error"))
            }
            e => MempoolError::SimulationFailed(e.to_string()),
        }
    }
}

/// Rule violations found in a simulation result
#[derive(Clone, Debug, parse_display::Display, PartialEq, Eq)]
pub enum SimulationViolation {
    /// An entity used an opcode that is not allowed during validation
    #[display("{0} uses banned opcode: {1}")]
    UsedForbiddenOpcode(EntityType, String),
    /// A call into the entry point other than `depositTo`
    #[display("called entry point method {0}, only depositTo is allowed")]
    CalledBannedEntryPointMethod(Bytes),
    /// The account or paymaster signature was invalid
    #[display("invalid signature")]
    InvalidSignature,
}

impl From<SimulationViolation> for MempoolError {
    fn from(violation: SimulationViolation) -> Self {
        match violation {
            SimulationViolation::UsedForbiddenOpcode(phase, opcode) => {
                MempoolError::OpcodeBanned(phase, opcode)
            }
            v => MempoolError::SimulationFailed(v.to_string()),
        }
    }
}

/// Simulator trait for running user operation simulations
#[cfg_attr(feature = "test-utils", automock)]
#[async_trait::async_trait]
pub trait Simulator: Send + Sync + 'static {
    /// Simulate the validation of an operation, returning the interpreted trace
    async fn simulate_validation(
        &self,
        op: UserOperation,
    ) -> Result<SimulationResult, SimulationError>;
}

/// Simulator backed by `debug_traceCall` of the entry point's `simulateValidation`
pub struct SimulatorImpl<P, E> {
    provider: Arc<P>,
    entry_point: Arc<E>,
    settings: Settings,
}

impl<P, E> SimulatorImpl<P, E>
where
    P: EvmProvider,
    E: EntryPoint,
{
    /// Create a new simulator
    pub fn new(provider: Arc<P>, entry_point: Arc<E>, settings: Settings) -> Self {
        Self {
            provider,
            entry_point,
            settings,
        }
    }

    async fn trace_simulate_validation(
        &self,
        op: UserOperation,
    ) -> Result<TracerOutput, SimulationError> {
        let tx = self.entry_point.get_simulate_validation_transaction(op);
        let trace = self
            .provider
            .debug_trace_call(
                tx,
                None,
                GethDebugTracingCallOptions {
                    tracing_options: GethDebugTracingOptions {
                        tracer: Some(GethDebugTracerType::JsTracer(self.settings.tracer.clone())),
                        timeout: Some(self.settings.tracer_timeout.clone()),
                        ..Default::default()
                    },
                    ..Default::default()
                },
            )
            .await?;

        TracerOutput::try_from(trace)
            .map_err(|e| SimulationError::InvalidTracerOutput(e.to_string()))
    }
}

#[async_trait::async_trait]
impl<P, E> Simulator for SimulatorImpl<P, E>
where
    P: EvmProvider + 'static,
    E: EntryPoint + 'static,
{
    async fn simulate_validation(
        &self,
        op: UserOperation,
    ) -> Result<SimulationResult, SimulationError> {
        let tracer_out =
            tokio::time::timeout(self.settings.sim_timeout, self.trace_simulate_validation(op))
                .await
                .map_err(|_| SimulationError::Timeout(self.settings.sim_timeout))??;

        let calls = interpret(&tracer_out.calls)?;
        let validation = decode_validation_revert(tracer_out.revert_data.as_ref())?;
        debug!(
            "simulation produced {} call entries, pre op gas {}",
            calls.len(),
            validation.returnInfo.preOpGas
        );

        Ok(SimulationResult {
            calls,
            opcodes_by_phase: tracer_out.opcodes_by_phase(),
            pre_op_gas: validation.returnInfo.preOpGas,
            sig_failed: validation.returnInfo.sigFailed,
            valid_after: validation.returnInfo.validAfter.to(),
            valid_until: validation.returnInfo.validUntil.to(),
        })
    }
}

// simulateValidation always reverts, a ValidationResult revert is the success path
fn decode_validation_revert(data: Option<&Bytes>) -> Result<ValidationResult, SimulationError> {
    let Some(data) = data else {
        return Err(SimulationError::ValidationReverted(
            "simulateValidation did not revert".to_string(),
        ));
    };
    if let Ok(result) = ValidationResult::abi_decode(data, false) {
        return Ok(result);
    }
    let reason = match RevertReason::decode(data) {
        RevertReason::FailedOp { reason, .. } => reason,
        other => other.to_string(),
    };
    Err(SimulationError::ValidationReverted(reason))
}

/// Check a simulation result against the validation rules.
///
/// Returns every violation found, forbidden opcodes first.
pub fn check_violations(result: &SimulationResult, entry_point: Address) -> Vec<SimulationViolation> {
    let mut violations = vec![];

    let mut phases: Vec<_> = result.opcodes_by_phase.iter().collect();
    phases.sort_by_key(|(phase, _)| **phase);
    for (phase, opcodes) in phases {
        let mut used: Vec<_> = opcodes
            .iter()
            .filter(|(opcode, count)| {
                **count > 0
                    && (FORBIDDEN_OPCODES.contains(&opcode.as_str())
                        || (opcode.as_str() == "CREATE2" && *phase != EntityType::Factory))
            })
            .map(|(opcode, _)| opcode.clone())
            .collect();
        used.sort();
        violations.extend(
            used.into_iter()
                .map(|opcode| SimulationViolation::UsedForbiddenOpcode(*phase, opcode)),
        );
    }

    // the entry point calls itself during validation, only entity calls count
    for call in &result.calls {
        if call.to == entry_point
            && call.from != entry_point
            && !call.method.is_empty()
            && call.method.as_ref() != DEPOSIT_TO_SELECTOR.as_slice()
        {
            violations.push(SimulationViolation::CalledBannedEntryPointMethod(
                call.method.clone(),
            ));
        }
    }

    if result.sig_failed {
        violations.push(SimulationViolation::InvalidSignature);
    }

    violations
}

#[cfg(test)]
mod tests {
    use alloy_primitives::{address, bytes};
    use opbundler_contracts::v0_6::{IEntryPoint::FailedOp, ReturnInfo, StakeInfo};
    use opbundler_provider::{
        BlockId, GethTrace, MockEntryPoint, MockEvmProvider, ProviderResult, TransactionRequest,
    };
    use serde_json::json;

    use super::*;
    use crate::trace::{CallOutcome, TraceKind};

    const ENTRY_POINT: Address = address!("5FF137D4b0FDCD49DcA30c7CF57E578a026d2789");
    const ACCOUNT: Address = address!("1306b01bc3e4ad202612d3843387e94737673f53");

    fn validation_result_revert(sig_failed: bool) -> Bytes {
        ValidationResult {
            returnInfo: ReturnInfo {
                preOpGas: U256::from(50_000),
                sigFailed: sig_failed,
                ..Default::default()
            },
            senderInfo: StakeInfo::default(),
            factoryInfo: StakeInfo::default(),
            paymasterInfo: StakeInfo::default(),
        }
        .abi_encode()
        .into()
    }

    fn entry_point() -> MockEntryPoint {
        let mut entry_point = MockEntryPoint::default();
        entry_point
            .expect_get_simulate_validation_transaction()
            .returning(|_| TransactionRequest::default());
        entry_point
    }

    fn simulator_with_trace(trace: serde_json::Value) -> SimulatorImpl<MockEvmProvider, MockEntryPoint> {
        let mut provider = MockEvmProvider::default();
        provider
            .expect_debug_trace_call()
            .returning(move |_, _, _| Ok(GethTrace::JS(trace.clone())));
        SimulatorImpl::new(
            Arc::new(provider),
            Arc::new(entry_point()),
            Settings::default(),
        )
    }

    #[tokio::test]
    async fn test_simulation_success() {
        let simulator = simulator_with_trace(json!({
            "callsFromEntryPoint": [{
                "topLevelMethodSig": "0x3a871cdd",
                "topLevelTargetAddress": "0x1306b01bc3e4ad202612d3843387e94737673f53",
                "opcodes": {"SLOAD": 2}
            }],
            "calls": [
                {"type": "CALL", "to": "0x1306b01bc3e4ad202612d3843387e94737673f53", "method": "0x3a871cdd"},
                {"type": "RETURN", "data": "0x"}
            ],
            "revertData": validation_result_revert(false),
        }));

        let result = simulator
            .simulate_validation(UserOperation::default())
            .await
            .unwrap();
        assert_eq!(result.pre_op_gas, U256::from(50_000));
        assert_eq!(result.calls.len(), 1);
        assert_eq!(result.calls[0].kind, TraceKind::Call);
        assert_eq!(result.calls[0].outcome, CallOutcome::Returned(Bytes::new()));
        assert!(check_violations(&result, ENTRY_POINT).is_empty());
    }

    #[tokio::test]
    async fn test_entry_point_internal_calls_allowed() {
        // simulateValidation calls itself for the sender and paymaster checks
        let simulator = simulator_with_trace(json!({
            "callsFromEntryPoint": [{
                "topLevelMethodSig": "0x3a871cdd",
                "topLevelTargetAddress": ACCOUNT,
                "opcodes": {"SLOAD": 2}
            }],
            "calls": [
                {"type": "STATICCALL", "from": ENTRY_POINT, "to": ENTRY_POINT, "method": "0x957122ab"},
                {"type": "REVERT", "data": "0x"},
                {"type": "CALL", "from": ENTRY_POINT, "to": ACCOUNT, "method": "0x3a871cdd"},
                {"type": "CALL", "from": ACCOUNT, "to": ENTRY_POINT, "method": "0xb760faf9", "value": "0x1"},
                {"type": "RETURN", "data": "0x"},
                {"type": "RETURN", "data": "0x"}
            ],
            "revertData": validation_result_revert(false),
        }));

        let result = simulator
            .simulate_validation(UserOperation::default())
            .await
            .unwrap();
        assert_eq!(result.calls.len(), 3);
        assert_eq!(result.calls[0].from, ENTRY_POINT);
        assert_eq!(result.calls[0].method, bytes!("957122ab"));
        assert!(check_violations(&result, ENTRY_POINT).is_empty());
    }

    #[tokio::test]
    async fn test_entity_call_into_entry_point_rejected() {
        let simulator = simulator_with_trace(json!({
            "calls": [
                {"type": "STATICCALL", "from": ENTRY_POINT, "to": ENTRY_POINT, "method": "0x957122ab"},
                {"type": "REVERT", "data": "0x"},
                {"type": "CALL", "from": ENTRY_POINT, "to": ACCOUNT, "method": "0x3a871cdd"},
                {"type": "CALL", "from": ACCOUNT, "to": ENTRY_POINT, "method": "0x1fad948c"},
                {"type": "RETURN", "data": "0x"},
                {"type": "RETURN", "data": "0x"}
            ],
            "revertData": validation_result_revert(false),
        }));

        let result = simulator
            .simulate_validation(UserOperation::default())
            .await
            .unwrap();
        assert_eq!(
            check_violations(&result, ENTRY_POINT),
            vec![SimulationViolation::CalledBannedEntryPointMethod(bytes!(
                "1fad948c"
            ))]
        );
    }

    #[tokio::test]
    async fn test_simulation_failed_op() {
        let revert: Bytes = FailedOp {
            opIndex: U256::ZERO,
            reason: "AA23 reverted (or OOG)".to_string(),
        }
        .abi_encode()
        .into();
        let simulator = simulator_with_trace(json!({ "calls": [], "revertData": revert }));

        let err = simulator
            .simulate_validation(UserOperation::default())
            .await
            .unwrap_err();
        assert!(
            matches!(&err, SimulationError::ValidationReverted(r) if r == "AA23 reverted (or OOG)")
        );
        assert!(matches!(
            MempoolError::from(err),
            MempoolError::SimulationFailed(_)
        ));
    }

    #[tokio::test]
    async fn test_simulation_malformed_trace() {
        let simulator = simulator_with_trace(json!({
            "calls": [{"type": "CALL", "to": "0x1306b01bc3e4ad202612d3843387e94737673f53"}],
            "revertData": validation_result_revert(false),
        }));

        let err = simulator
            .simulate_validation(UserOperation::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SimulationError::MalformedTrace(_)));
        let err = MempoolError::from(err).into_caller_error();
        assert!(matches!(err, MempoolError::SimulationFailed(_)));
    }

    #[tokio::test]
    async fn test_simulation_missing_revert() {
        let simulator = simulator_with_trace(json!({ "calls": [] }));
        let err = simulator
            .simulate_validation(UserOperation::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SimulationError::ValidationReverted(_)));
    }

    struct SlowProvider;

    #[async_trait::async_trait]
    impl EvmProvider for SlowProvider {
        async fn get_chain_id(&self) -> ProviderResult<u64> {
            Ok(1)
        }

        async fn estimate_gas(&self, _tx: TransactionRequest) -> ProviderResult<u64> {
            Ok(0)
        }

        async fn debug_trace_call(
            &self,
            _tx: TransactionRequest,
            _block_id: Option<BlockId>,
            _trace_options: GethDebugTracingCallOptions,
        ) -> ProviderResult<GethTrace> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(GethTrace::JS(json!({})))
        }

        async fn send_transaction(
            &self,
            _tx: TransactionRequest,
        ) -> ProviderResult<alloy_primitives::TxHash> {
            Ok(Default::default())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulation_timeout() {
        let simulator = SimulatorImpl::new(
            Arc::new(SlowProvider),
            Arc::new(entry_point()),
            Settings {
                sim_timeout: Duration::from_secs(1),
                ..Default::default()
            },
        );
        let err = simulator
            .simulate_validation(UserOperation::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SimulationError::Timeout(_)));
        assert!(matches!(
            MempoolError::from(err),
            MempoolError::SimulationFailed(_)
        ));
    }

    fn result_with_opcodes(phase: EntityType, opcodes: &[(&str, u64)]) -> SimulationResult {
        SimulationResult {
            opcodes_by_phase: HashMap::from([(
                phase,
                opcodes
                    .iter()
                    .map(|(op, count)| (op.to_string(), *count))
                    .collect(),
            )]),
            ..Default::default()
        }
    }

    #[test]
    fn test_forbidden_opcode() {
        let result = result_with_opcodes(EntityType::Account, &[("TIMESTAMP", 1), ("SLOAD", 4)]);
        let violations = check_violations(&result, ENTRY_POINT);
        assert_eq!(
            violations,
            vec![SimulationViolation::UsedForbiddenOpcode(
                EntityType::Account,
                "TIMESTAMP".to_string()
            )]
        );
        assert!(matches!(
            MempoolError::from(violations[0].clone()),
            MempoolError::OpcodeBanned(EntityType::Account, op) if op == "TIMESTAMP"
        ));
    }

    #[test]
    fn test_create2_only_in_factory() {
        let factory = result_with_opcodes(EntityType::Factory, &[("CREATE2", 1)]);
        assert!(check_violations(&factory, ENTRY_POINT).is_empty());

        let paymaster = result_with_opcodes(EntityType::Paymaster, &[("CREATE2", 1)]);
        assert_eq!(
            check_violations(&paymaster, ENTRY_POINT),
            vec![SimulationViolation::UsedForbiddenOpcode(
                EntityType::Paymaster,
                "CREATE2".to_string()
            )]
        );
    }

    fn entry_point_call(method: Bytes) -> CallEntry {
        CallEntry {
            from: ACCOUNT,
            to: ENTRY_POINT,
            kind: TraceKind::Call,
            method,
            value: U256::ZERO,
            outcome: CallOutcome::Returned(Bytes::new()),
        }
    }

    #[test]
    fn test_entry_point_calls() {
        let internal = SimulationResult {
            calls: vec![CallEntry {
                from: ENTRY_POINT,
                ..entry_point_call(bytes!("957122ab"))
            }],
            ..Default::default()
        };
        assert!(check_violations(&internal, ENTRY_POINT).is_empty());


        let allowed = SimulationResult {
            calls: vec![entry_point_call(bytes!("b760faf9"))],
            ..Default::default()
        };
        assert!(check_violations(&allowed, ENTRY_POINT).is_empty());

        let banned = SimulationResult {
            calls: vec![entry_point_call(bytes!("1fad948c"))],
            ..Default::default()
        };
        assert_eq!(
            check_violations(&banned, ENTRY_POINT),
            vec![SimulationViolation::CalledBannedEntryPointMethod(bytes!(
                "1fad948c"
            ))]
        );
    }

    #[test]
    fn test_sig_failed() {
        let result = SimulationResult {
            sig_failed: true,
            ..Default::default()
        };
        assert_eq!(
            check_violations(&result, ENTRY_POINT),
            vec![SimulationViolation::InvalidSignature]
        );
    }
}

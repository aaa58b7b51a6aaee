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

use std::sync::Arc;

use opbundler_sim::{check_violations, Simulator};
use opbundler_types::pool::{MempoolError, ReputationStatus};
use tracing::debug;

use crate::{
    pipeline::{Context, Module},
    reputation::ReputationStore,
};

/// Runs the traced validation simulation and applies the validation rules to
/// its result.
///
/// Entities of the operation reached by the trace are checked against their
/// live reputation, as it may have changed while simulating.
pub struct SimulateOp<S, R> {
    simulator: Arc<S>,
    reputation: Arc<R>,
}

impl<S, R> SimulateOp<S, R> {
    /// Create the module
    pub fn new(simulator: Arc<S>, reputation: Arc<R>) -> Self {
        Self {
            simulator,
            reputation,
        }
    }
}

#[async_trait::async_trait]
impl<S, R> Module for SimulateOp<S, R>
where
    S: Simulator,
    R: ReputationStore,
{
    fn name(&self) -> &'static str {
        "SimulateOp"
    }

    async fn handle(&self, ctx: &mut Context) -> Result<(), MempoolError> {
        let result = self.simulator.simulate_validation(ctx.op.clone()).await?;

        if let Some(violation) = check_violations(&result, ctx.entry_point)
            .into_iter()
            .next()
        {
            debug!("simulation violation for op from {:?}: {violation}", ctx.op.sender);
            return Err(violation.into());
        }

        let entities = ctx.op.entities();
        for call in &result.calls {
            let Some(entity) = entities.iter().find(|e| e.address == call.to) else {
                continue;
            };
            if self.reputation.status(entity.address) == ReputationStatus::Banned {
                return Err(MempoolError::EntityBanned(*entity, ReputationStatus::Banned));
            }
        }

        ctx.simulation = Some(result);
        Ok(())
    }
}

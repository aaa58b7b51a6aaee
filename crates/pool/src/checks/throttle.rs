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

use opbundler_types::pool::{MempoolError, ReputationStatus};

use crate::pipeline::{Context, Module};

/// Lets at most one operation per throttled entity into a bundle.
///
/// Outside of a bundling cycle this module is a no-op.
#[derive(Debug, Default)]
pub struct ThrottledPerCycle;

#[async_trait::async_trait]
impl Module for ThrottledPerCycle {
    fn name(&self) -> &'static str {
        "ThrottledPerCycle"
    }

    async fn handle(&self, ctx: &mut Context) -> Result<(), MempoolError> {
        let Some(cycle) = &ctx.cycle else {
            return Ok(());
        };

        for entity in ctx.op.entities() {
            if ctx.status(entity.address) == ReputationStatus::Throttled
                && !cycle.claim_throttled_slot(entity.address)
            {
                return Err(MempoolError::EntityBanned(
                    entity,
                    ReputationStatus::Throttled,
                ));
            }
        }
        Ok(())
    }
}

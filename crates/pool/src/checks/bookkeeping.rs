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

use opbundler_types::pool::MempoolError;

use crate::{
    pipeline::{Context, Module},
    reputation::ReputationStore,
};

/// Records that every entity of the operation was seen. Never fails.
pub struct IncOpsSeen<R> {
    reputation: Arc<R>,
}

impl<R> IncOpsSeen<R> {
    /// Create the module
    pub fn new(reputation: Arc<R>) -> Self {
        Self { reputation }
    }
}

#[async_trait::async_trait]
impl<R: ReputationStore> Module for IncOpsSeen<R> {
    fn name(&self) -> &'static str {
        "IncOpsSeen"
    }

    async fn handle(&self, ctx: &mut Context) -> Result<(), MempoolError> {
        for entity in ctx.op.entities() {
            self.reputation.add_seen(entity.address);
        }
        Ok(())
    }
}

/// Records that every entity of the operation was included. Never fails.
///
/// Run only for operations of a bundle that was submitted.
pub struct IncOpsIncluded<R> {
    reputation: Arc<R>,
}

impl<R> IncOpsIncluded<R> {
    /// Create the module
    pub fn new(reputation: Arc<R>) -> Self {
        Self { reputation }
    }
}

#[async_trait::async_trait]
impl<R: ReputationStore> Module for IncOpsIncluded<R> {
    fn name(&self) -> &'static str {
        "IncOpsIncluded"
    }

    async fn handle(&self, ctx: &mut Context) -> Result<(), MempoolError> {
        for entity in ctx.op.entities() {
            self.reputation.add_included(entity.address);
        }
        Ok(())
    }
}

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

use std::marker::PhantomData;

use alloy_primitives::TxHash;
use alloy_provider::{ext::DebugApi, Provider as AlloyProvider};
use alloy_rpc_types_eth::{BlockId, BlockNumberOrTag, TransactionRequest};
use alloy_rpc_types_trace::geth::{GethDebugTracingCallOptions, GethTrace};
use alloy_transport::Transport;

use crate::{EvmProvider, ProviderResult};

/// Evm Provider implementation using [alloy-provider](https://github.com/alloy-rs/alloy-rs)
pub struct AlloyEvmProvider<AP, T> {
    inner: AP,
    _marker: PhantomData<T>,
}

impl<AP, T> AlloyEvmProvider<AP, T> {
    /// Create a new `AlloyEvmProvider`
    pub fn new(inner: AP) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }
}

impl<AP: Clone, T> Clone for AlloyEvmProvider<AP, T> {
    fn clone(&self) -> Self {
        Self::new(self.inner.clone())
    }
}

#[async_trait::async_trait]
impl<AP, T> EvmProvider for AlloyEvmProvider<AP, T>
where
    T: Transport + Clone,
    AP: AlloyProvider<T>,
{
    async fn get_chain_id(&self) -> ProviderResult<u64> {
        Ok(self.inner.get_chain_id().await?)
    }

    async fn estimate_gas(&self, tx: TransactionRequest) -> ProviderResult<u64> {
        Ok(self.inner.estimate_gas(&tx).await?)
    }

    async fn debug_trace_call(
        &self,
        tx: TransactionRequest,
        block_id: Option<BlockId>,
        trace_options: GethDebugTracingCallOptions,
    ) -> ProviderResult<GethTrace> {
        let block_id = block_id.unwrap_or_else(|| BlockNumberOrTag::Latest.into());
        Ok(self
            .inner
            .debug_trace_call(tx, block_id, trace_options)
            .await?)
    }

    async fn send_transaction(&self, tx: TransactionRequest) -> ProviderResult<TxHash> {
        let pending = self.inner.send_transaction(tx).await?;
        Ok(*pending.tx_hash())
    }
}

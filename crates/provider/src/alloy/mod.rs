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

use alloy_provider::{Provider as AlloyProvider, ProviderBuilder};
use alloy_rpc_client::ClientBuilder;
use alloy_transport::layers::RetryBackoffService;
use alloy_transport_http::Http;
use anyhow::Context;
use reqwest::Client;
use url::Url;

pub(crate) mod entry_point;
pub(crate) mod evm;

/// Transport of the providers created by [`new_alloy_provider`]
pub type AlloyTransport = RetryBackoffService<Http<Client>>;

/// Create a new alloy provider from a given RPC URL
pub fn new_alloy_provider(
    rpc_url: &str,
) -> anyhow::Result<impl AlloyProvider<AlloyTransport> + Clone> {
    let url = Url::parse(rpc_url).context("invalid rpc url")?;
    // max retries, initial backoff in ms, compute units per second
    let retry_layer = alloy_transport::layers::RetryBackoffLayer::new(10, 500, 1_000_000);
    let client = ClientBuilder::default().layer(retry_layer).http(url);
    let provider = ProviderBuilder::new().on_client(client);
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_invalid_url() {
        assert!(new_alloy_provider("not a url").is_err());
    }
}

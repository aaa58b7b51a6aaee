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

use alloy_json_rpc::ErrorPayload;
use alloy_transport::TransportError;

/// Error enumeration for the Provider trait
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The node answered with a JSON-RPC error response
    #[error("RPC error response {}: {}", .0.code, .0.message)]
    ErrorResponse(ErrorPayload),
    /// Transport level failure, the request did not get an answer
    #[error(transparent)]
    Transport(TransportError),
    /// Contract Error
    #[error("Contract Error: {0}")]
    ContractError(String),
    /// Internal errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result of a provider method call
pub type ProviderResult<T> = Result<T, ProviderError>;

impl From<TransportError> for ProviderError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ErrorResp(payload) => Self::ErrorResponse(payload),
            err => Self::Transport(err),
        }
    }
}

impl From<alloy_contract::Error> for ProviderError {
    fn from(err: alloy_contract::Error) -> Self {
        match err {
            alloy_contract::Error::TransportError(err) => err.into(),
            err => Self::ContractError(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_is_kept() {
        let payload: ErrorPayload = serde_json::from_str(
            r#"{"code":-32000,"message":"execution reverted: AA23 reverted"}"#,
        )
        .unwrap();
        let err: ProviderError = TransportError::ErrorResp(payload).into();
        match err {
            ProviderError::ErrorResponse(p) => {
                assert_eq!(p.message.to_string(), "execution reverted: AA23 reverted")
            }
            e => panic!("unexpected error {e:?}"),
        }
    }
}

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

//! User operation (ERC-4337 v0.6 layout)

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use alloy_sol_types::SolValue;
use opbundler_contracts::v0_6::UserOperation as ContractUserOperation;
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

use crate::entity::{Entity, EntityType};

/// A user operation, submitted off-chain and executed through an entry point.
///
/// Immutable once admitted to the pool. A pending operation can only change by
/// being replaced with a new operation under the same [`UserOperationKey`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperation {
    /// Sender (smart account) address
    pub sender: Address,
    /// Account nonce
    pub nonce: U256,
    /// Factory address followed by factory calldata, empty if the account is deployed
    pub init_code: Bytes,
    /// Calldata for the account's execution phase
    pub call_data: Bytes,
    /// Gas limit for the execution phase
    pub call_gas_limit: U256,
    /// Gas limit for the verification phase
    pub verification_gas_limit: U256,
    /// Gas paid to the bundler for overhead not tracked by the entry point
    pub pre_verification_gas: U256,
    /// Max fee per gas
    pub max_fee_per_gas: U256,
    /// Max priority fee per gas
    pub max_priority_fee_per_gas: U256,
    /// Paymaster address followed by paymaster data, empty if self-sponsored
    pub paymaster_and_data: Bytes,
    /// Signature over the operation hash
    pub signature: Bytes,
}

/// The key under which at most one operation may be pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperationKey {
    /// Sender of the operation
    pub sender: Address,
    /// Entry point the operation targets
    pub entry_point: Address,
}

impl UserOperation {
    /// Canonical hash of the operation for a given entry point and chain.
    pub fn hash(&self, entry_point: Address, chain_id: u64) -> B256 {
        keccak256(
            (
                keccak256(self.pack_for_hash()),
                entry_point,
                U256::from(chain_id),
            )
                .abi_encode(),
        )
    }

    /// Pool key of the operation for the given entry point
    pub fn key(&self, entry_point: Address) -> UserOperationKey {
        UserOperationKey {
            sender: self.sender,
            entry_point,
        }
    }

    /// Factory address, if the operation deploys its sender
    pub fn factory(&self) -> Option<Address> {
        address_from_field(&self.init_code)
    }

    /// Paymaster address, if the operation is sponsored
    pub fn paymaster(&self) -> Option<Address> {
        address_from_field(&self.paymaster_and_data)
    }

    /// Address of the entity of the given type, if present
    pub fn entity_address(&self, kind: EntityType) -> Option<Address> {
        match kind {
            EntityType::Account => Some(self.sender),
            EntityType::Paymaster => self.paymaster(),
            EntityType::Factory => self.factory(),
        }
    }

    /// All entities referenced by this operation
    pub fn entities(&self) -> Vec<Entity> {
        EntityType::iter()
            .filter_map(|kind| {
                self.entity_address(kind)
                    .map(|address| Entity::new(kind, address))
            })
            .collect()
    }

    /// Worst case cost of the operation, in wei.
    ///
    /// The verification gas limit is counted three times when a paymaster is
    /// present, as the entry point may call `postOp` twice. Saturates at
    /// `U256::MAX`, the fields are caller supplied.
    pub fn max_gas_cost(&self) -> U256 {
        let mul = if self.paymaster().is_some() { 3 } else { 1 };
        let gas = self
            .pre_verification_gas
            .saturating_add(self.call_gas_limit)
            .saturating_add(self.verification_gas_limit.saturating_mul(U256::from(mul)));
        self.max_fee_per_gas.saturating_mul(gas)
    }

    /// Calldata cost of including the ABI encoded operation in a bundle
    pub fn calldata_gas_cost(
        &self,
        zero_byte_cost: U256,
        non_zero_byte_cost: U256,
        per_word_cost: U256,
    ) -> U256 {
        let encoded = ContractUserOperation::from(self.clone()).abi_encode();
        let length_in_words = U256::from((encoded.len() + 31) >> 5);
        let bytes_cost = encoded
            .iter()
            .map(|&b| {
                if b == 0 {
                    zero_byte_cost
                } else {
                    non_zero_byte_cost
                }
            })
            .fold(U256::ZERO, |acc, c| acc + c);

        bytes_cost + per_word_cost * length_in_words
    }

    fn pack_for_hash(&self) -> Vec<u8> {
        (
            self.sender,
            self.nonce,
            keccak256(&self.init_code),
            keccak256(&self.call_data),
            self.call_gas_limit,
            self.verification_gas_limit,
            self.pre_verification_gas,
            self.max_fee_per_gas,
            self.max_priority_fee_per_gas,
            keccak256(&self.paymaster_and_data),
        )
            .abi_encode()
    }
}

fn address_from_field(data: &Bytes) -> Option<Address> {
    if data.len() < 20 {
        None
    } else {
        Some(Address::from_slice(&data[..20]))
    }
}

impl From<UserOperation> for ContractUserOperation {
    fn from(op: UserOperation) -> Self {
        ContractUserOperation {
            sender: op.sender,
            nonce: op.nonce,
            initCode: op.init_code,
            callData: op.call_data,
            callGasLimit: op.call_gas_limit,
            verificationGasLimit: op.verification_gas_limit,
            preVerificationGas: op.pre_verification_gas,
            maxFeePerGas: op.max_fee_per_gas,
            maxPriorityFeePerGas: op.max_priority_fee_per_gas,
            paymasterAndData: op.paymaster_and_data,
            signature: op.signature,
        }
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::{address, b256, bytes};

    use super::*;

    #[test]
    fn test_hash_zeroed() {
        // Testing a user operation hash against the hash generated by the
        // entrypoint contract getUserOpHash() function with entrypoint address
        // at 0x66a15edcc3b50a663e72f1457ffd49b9ae284ddc and chain ID 1337.
        let operation = UserOperation::default();
        let entry_point = address!("66a15edcc3b50a663e72f1457ffd49b9ae284ddc");
        let chain_id = 1337;
        assert_eq!(
            operation.hash(entry_point, chain_id),
            b256!("dca97c3b49558ab360659f6ead939773be8bf26631e61bb17045bb70dc983b2d")
        );
    }

    #[test]
    fn test_entities() {
        let op = UserOperation {
            sender: address!("1306b01bc3e4ad202612d3843387e94737673f53"),
            init_code: bytes!("9406cc6185a346906296840746125a0e449764545fbfb9cf000000"),
            paymaster_and_data: bytes!("0123456789abcdef0123456789abcdef01234567ff"),
            ..Default::default()
        };
        assert_eq!(
            op.entities(),
            vec![
                Entity::account(op.sender),
                Entity::paymaster(address!("0123456789abcdef0123456789abcdef01234567")),
                Entity::factory(address!("9406cc6185a346906296840746125a0e44976454")),
            ]
        );
    }

    #[test]
    fn test_short_fields_have_no_entity() {
        let op = UserOperation {
            init_code: bytes!("0102"),
            paymaster_and_data: bytes!("03"),
            ..Default::default()
        };
        assert_eq!(op.factory(), None);
        assert_eq!(op.paymaster(), None);
        assert_eq!(op.entities().len(), 1);
    }

    #[test]
    fn test_max_gas_cost_with_paymaster() {
        let op = UserOperation {
            max_fee_per_gas: U256::from(2),
            pre_verification_gas: U256::from(10),
            call_gas_limit: U256::from(20),
            verification_gas_limit: U256::from(30),
            paymaster_and_data: bytes!("0123456789abcdef0123456789abcdef01234567"),
            ..Default::default()
        };
        assert_eq!(op.max_gas_cost(), U256::from(2 * (10 + 20 + 90)));
    }

    #[test]
    fn test_max_gas_cost_saturates() {
        // 2^255 * 2 would wrap to zero
        let op = UserOperation {
            max_fee_per_gas: U256::from(1) << 255,
            call_gas_limit: U256::from(2),
            ..Default::default()
        };
        assert_eq!(op.max_gas_cost(), U256::MAX);

        let op = UserOperation {
            max_fee_per_gas: U256::from(1),
            call_gas_limit: U256::MAX,
            verification_gas_limit: U256::MAX,
            paymaster_and_data: bytes!("0123456789abcdef0123456789abcdef01234567"),
            ..Default::default()
        };
        assert_eq!(op.max_gas_cost(), U256::MAX);
    }

    #[test]
    fn test_calldata_cost_grows_with_call_data() {
        let base = UserOperation::default();
        let longer = UserOperation {
            call_data: Bytes::from(vec![0xffu8; 32]),
            ..Default::default()
        };
        let cost = |op: &UserOperation| op.calldata_gas_cost(U256::ZERO, U256::from(16), U256::from(4));
        // 32 nonzero bytes plus one extra word, and the length word changes from zero to 0x20
        assert_eq!(cost(&longer) - cost(&base), U256::from(32 * 16 + 4 + 16));
    }

    #[test]
    fn test_serde_camel_case() {
        let op = UserOperation {
            call_gas_limit: U256::from(9100),
            ..Default::default()
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["callGasLimit"], "0x238c");
    }
}

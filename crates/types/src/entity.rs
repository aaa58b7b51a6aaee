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

use std::fmt::Display;

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use strum::{EnumIter, EnumString};

/// The type of an entity referenced by a user operation
#[derive(
    Debug,
    Clone,
    Copy,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    EnumIter,
    EnumString,
    strum::Display,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub enum EntityType {
    /// Account type
    Account,
    /// Paymaster type
    Paymaster,
    /// Factory type
    Factory,
}

/// An entity associated with a user operation
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Entity {
    /// The type of entity
    pub kind: EntityType,
    /// The address of the entity
    pub address: Address,
}

impl Entity {
    /// Create a new entity of the given type and address
    pub fn new(kind: EntityType, address: Address) -> Self {
        Self { kind, address }
    }

    /// Create a new account entity at address
    pub fn account(address: Address) -> Self {
        Self::new(EntityType::Account, address)
    }

    /// Create a new paymaster entity at address
    pub fn paymaster(address: Address) -> Self {
        Self::new(EntityType::Paymaster, address)
    }

    /// Create a new factory entity at address
    pub fn factory(address: Address) -> Self {
        Self::new(EntityType::Factory, address)
    }
}

impl Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.address.to_checksum(None))
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use alloy_primitives::address;

    use super::*;

    #[test]
    fn test_entity_display() {
        let entity = Entity::paymaster(address!("5FF137D4b0FDCD49DcA30c7CF57E578a026d2789"));
        assert_eq!(
            entity.to_string(),
            "paymaster:0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789"
        );
    }

    #[test]
    fn test_entity_type_from_str() {
        assert_eq!(EntityType::from_str("factory").unwrap(), EntityType::Factory);
        assert!(EntityType::from_str("aggregator").is_err());
    }
}

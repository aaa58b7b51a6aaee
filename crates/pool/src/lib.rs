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

#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]
//! Pending operation pool, reputation, and the admission pipeline.

pub mod checks;

mod client;
pub use client::{Client, GasEstimate, Settings as ClientSettings};

pub mod db;
pub use db::{Database, DbError, MemoryDatabase};

mod emit;
pub use emit::{OpRemovalReason, PoolEvent};

mod maintenance;
pub use maintenance::{MaintenanceTask, Settings as MaintenanceSettings};

mod mempool;
pub use mempool::{AdmitOutcome, Eligible, Mempool, PoolConfig};

mod pipeline;
#[cfg(feature = "test-utils")]
pub use pipeline::MockModule;
pub use pipeline::{Context, CycleState, Module, Pipeline};

mod reputation;
#[cfg(feature = "test-utils")]
pub use reputation::MockReputationStore;
pub use reputation::{BanThreshold, DbReputation, ReputationParams, ReputationStore};

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
//! Validation simulation, call trace interpretation, and the gas overhead model.

pub mod gas;
pub use gas::{call_gas_estimate, GasOverheads};

mod simulation;
#[cfg(feature = "test-utils")]
pub use simulation::MockSimulator;
pub use simulation::{
    check_violations, Settings as SimulationSettings, SimulationError, SimulationResult,
    SimulationViolation, Simulator, SimulatorImpl, FORBIDDEN_OPCODES,
};

pub mod trace;

mod tracer;
pub use tracer::DEFAULT_VALIDATION_TRACER_JS;

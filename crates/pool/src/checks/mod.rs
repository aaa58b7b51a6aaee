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

//! Pipeline modules used by admission and bundling

mod bookkeeping;
pub use bookkeeping::{IncOpsIncluded, IncOpsSeen};

mod entity_status;
pub use entity_status::EntityStatus;

mod op_values;
pub use op_values::{OpValueSettings, ValidateOpValues};

mod paymaster;
pub use paymaster::PaymasterDeposit;

mod simulate;
pub use simulate::SimulateOp;

mod throttle;
pub use throttle::ThrottledPerCycle;

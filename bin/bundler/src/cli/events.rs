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

use opbundler_builder::BuilderEvent;
use opbundler_pool::PoolEvent;

/// Events of both components, merged into a single logging stream
#[derive(Clone, Debug)]
pub(crate) enum Event {
    Pool(PoolEvent),
    Builder(BuilderEvent),
}

impl From<PoolEvent> for Event {
    fn from(event: PoolEvent) -> Self {
        Self::Pool(event)
    }
}

impl From<BuilderEvent> for Event {
    fn from(event: BuilderEvent) -> Self {
        Self::Builder(event)
    }
}

impl Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Pool(event) => write!(f, "[pool] {event}"),
            Event::Builder(event) => write!(f, "[builder] {event}"),
        }
    }
}

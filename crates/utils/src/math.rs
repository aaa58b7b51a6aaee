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

//! Math utilities

use alloy_primitives::U256;

/// Increases a value by a percentage, rounding up. Saturates at `U256::MAX`.
pub fn increase_by_percent_ceil(n: U256, percent: u32) -> U256 {
    n.checked_mul(U256::from(100) + U256::from(percent))
        .and_then(|scaled| scaled.checked_add(U256::from(99)))
        .map_or(U256::MAX, |scaled| scaled / U256::from(100))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increase_by_percent_ceil() {
        assert_eq!(increase_by_percent_ceil(U256::from(3), 10), U256::from(4));
        assert_eq!(increase_by_percent_ceil(U256::from(100), 10), U256::from(110));
        assert_eq!(increase_by_percent_ceil(U256::ZERO, 10), U256::ZERO);
    }

    #[test]
    fn test_increase_by_percent_ceil_saturates() {
        assert_eq!(increase_by_percent_ceil(U256::MAX / U256::from(2), 10), U256::MAX);
        assert_eq!(increase_by_percent_ceil(U256::MAX, 0), U256::MAX);
    }
}

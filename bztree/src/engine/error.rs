/*
 * Created on Sun Jul 28 2024
 *
 * This file is a part of Skytable
 * Skytable (formerly known as TerrabaseDB or Skybase) is a free and open-source
 * NoSQL database written by Sayan Nandan ("the Author") with the
 * vision to provide flexibility in data modelling without compromising
 * on performance, queryability or scalability.
 *
 * Copyright (c) 2024, Sayan Nandan <ohsayan@outlook.com>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

use core::fmt;

pub type BzTreeResult<T> = Result<T, BzTreeError>;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
/// Failure domains surfaced by the `try_*` API family. Duplicate-key and missing-key outcomes are
/// not errors in this crate (they're the normal `false` case of the boolean contract, per §4.3);
/// this enum only ever carries outcomes a caller cannot get by retrying the same call.
pub enum BzTreeError {
    /// the payload (key + value + metadata + sentinels) cannot fit in any node of this tree's
    /// configured `node_size`, regardless of fragmentation
    CapacityExceeded,
    /// an operation exhausted its configured retry budget without making progress; the tree is
    /// still structurally sound, but this call could not observe a quiescent enough state to finish
    RetryBudgetExceeded,
    /// this process has already mounted `2^27` trees, exhausting the `global_epoch` field's width
    InvariantViolation,
}

impl fmt::Display for BzTreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::CapacityExceeded => "payload too large for this tree's node size",
            Self::RetryBudgetExceeded => "retry budget exceeded without making progress",
            Self::InvariantViolation => "node invariant violated",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for BzTreeError {}

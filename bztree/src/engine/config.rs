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

//! Runtime-overridable thresholds. `node_size` is fixed at compile time (it defines the [`Node`]
//! byte layout; see [`crate::engine::node`]) but is carried here too so callers can read back what
//! the tree was built with.

use crate::engine::node::NODE_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Config {
    /// informational only; always [`NODE_SIZE`] in this build
    pub node_size: usize,
    /// free space (bytes) below which a leaf is split
    pub min_free_space: u32,
    /// free space (bytes) above which a leaf is a merge candidate
    pub max_free_space: u32,
    /// reclaimable (tombstoned) bytes above which a leaf is compacted
    pub max_deleted_space: u32,
    /// internal retry-from-root attempts before `try_*` operations give up with
    /// [`crate::BzTreeError::RetryBudgetExceeded`]
    pub retry_budget: u32,
}

impl Config {
    pub const fn new() -> Self {
        Self {
            node_size: NODE_SIZE,
            min_free_space: 40,
            max_free_space: 128,
            max_deleted_space: 100,
            retry_budget: 4_000_000,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

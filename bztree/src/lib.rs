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

//! `bztree` is a lock-free, latch-free ordered key-value index for byte-string
//! keys and values. Leaves are mutable append-only record arrays coordinated
//! through a software multi-word compare-and-swap (PMwCAS); inner nodes are
//! immutable and replaced wholesale during structural modifications (SMOs).
//!
//! See [`BzTree`] for the public surface.

#[cfg(all(not(target_env = "msvc"), not(miri)))]
use jemallocator::Jemalloc;

#[cfg(all(not(target_env = "msvc"), not(miri)))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

mod engine;
#[cfg(test)]
mod tests;

pub use engine::{BzTree, BzTreeError, BzTreeResult, Config};

/// Initializes the `log`/`env_logger` backend from the `BZTREE_LOG` environment
/// variable. Safe to call more than once; subsequent calls are no-ops.
pub fn init_logger() {
    let _ = env_logger::Builder::new()
        .parse_filters(&std::env::var("BZTREE_LOG").unwrap_or_else(|_| "warn".to_owned()))
        .try_init();
}

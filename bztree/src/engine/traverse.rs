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

//! C5: root-to-leaf descent.
//!
//! A descent walks `height - 1` inner-node levels, picking at each one the first routing key `>=`
//! the search key (or the last slot), and records the full ancestor chain so the SMO engine (C6)
//! can reach both the immediate parent (for a compaction's single-slot swap) and the grandparent
//! (for a split or merge, which rebuilds the parent itself and reattaches it one level up).

use {
    super::{
        config::Config,
        epoch::Guard,
        node::ChildNode,
        root::RootDescriptor,
        smo::{self, PathEntry},
    },
    log::trace,
};

pub struct Descent {
    pub leaf: *const ChildNode,
    pub path: Vec<PathEntry>,
}

impl Descent {
    /// The inner node whose child slot points directly at the leaf, and the index of that slot.
    /// `None` if the leaf is itself the tree root (`height == 1`).
    pub fn immediate(&self) -> Option<PathEntry> {
        self.path.last().copied()
    }

    /// The inner node one level above `immediate`, and the index of the slot pointing at it.
    /// `None` if `immediate` is itself the tree root, or if there is no `immediate` at all.
    pub fn upper(&self) -> Option<PathEntry> {
        if self.path.len() >= 2 {
            Some(self.path[self.path.len() - 2])
        } else {
            None
        }
    }
}

fn descend_once(root: *const ChildNode, height: u32, key: &[u8]) -> Descent {
    let mut path = Vec::with_capacity(height.saturating_sub(1) as usize);
    let mut current = root;
    for _ in 1..height {
        let inner = unsafe { &*current }
            .as_inner()
            .expect("every level above the leaf must be an inner node");
        let idx = inner.find_child_index(key);
        trace!("traverse: inner node, idx={idx}");
        path.push((current, idx));
        current = inner.child_ptr(idx);
    }
    Descent { leaf: current, path }
}

/// Read-only descent: no SMO triggers are evaluated or run. Used by `lookup`.
pub fn locate(root_desc: &RootDescriptor, key: &[u8]) -> Descent {
    let (meta, _) = root_desc.metadata();
    descend_once(meta.root, meta.height, key)
}

/// Descent for a mutating operation: evaluates the leaf's SMO trigger once it is reached, and if
/// one fires, runs it and restarts the whole descent from the root, per §4.4 step 4.
pub fn locate_for_write(
    root_desc: &RootDescriptor,
    key: &[u8],
    config: &Config,
    guard: &Guard,
) -> Descent {
    loop {
        let (meta, _) = root_desc.metadata();
        let descent = descend_once(meta.root, meta.height, key);
        let performed = smo::maybe_run(
            root_desc,
            meta.height,
            descent.leaf,
            descent.immediate(),
            descent.upper(),
            config,
            guard,
        );
        if performed {
            trace!("traverse: smo performed, restarting from root");
            continue;
        }
        return descent;
    }
}

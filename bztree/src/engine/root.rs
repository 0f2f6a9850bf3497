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

//! C7: the root descriptor and tree metadata object.
//!
//! `TreeMetadata` is immutable once published: `root`/`height`/`global_epoch` only ever change
//! together, by allocating a fresh `TreeMetadata` and swapping the root descriptor's single
//! pointer to it via PMwCAS. This is why root-level structural changes (height bump on a root
//! split, height decrement on a root merge) are handled as a special case rather than as a
//! recursive SMO: there is no grandparent to update, only this one pointer.
//!
//! The source's root object also carries a `desc_pool_ptr` alongside `metadata_ptr`, addressing
//! an externally supplied PMwCAS descriptor pool. This crate's PMwCAS (`pmwcas.rs`) is an
//! in-process module, not a separately constructed pool object, so that field has no counterpart
//! here; see `DESIGN.md`.

use {
    super::{
        node::ChildNode,
        pmwcas::{self, WordEntry},
    },
    core::sync::atomic::AtomicU64,
};

/// 27-bit field per §3/§9; a fresh mount starts at 0 and increments by one per construction.
pub const MAX_GLOBAL_EPOCH: u32 = (1 << 27) - 1;

pub struct TreeMetadata {
    pub root: *const ChildNode,
    pub height: u32,
    pub global_epoch: u32,
}

// SAFETY: `root` is only ever read through epoch-protected traversal, and a `TreeMetadata` is
// only ever reachable from one thread's stack plus the shared `RootDescriptor` pointer, which is
// itself protected by the same epoch/PMwCAS discipline as every other node pointer in this crate.
unsafe impl Send for TreeMetadata {}
unsafe impl Sync for TreeMetadata {}

pub struct RootDescriptor {
    metadata: AtomicU64,
}

impl RootDescriptor {
    pub fn new(initial: TreeMetadata) -> Self {
        let ptr = Box::into_raw(Box::new(initial));
        Self {
            metadata: AtomicU64::new(ptr as u64),
        }
    }

    #[inline(always)]
    pub fn metadata_addr(&self) -> *const AtomicU64 {
        &self.metadata
    }

    /// Loads the current metadata object, helping any in-flight PMwCAS targeting this pointer
    /// complete first.
    pub fn metadata(&self) -> (&TreeMetadata, u64) {
        let raw = pmwcas::read(self.metadata_addr());
        (unsafe { &*(raw as *const TreeMetadata) }, raw)
    }

    /// Swaps the metadata pointer from `expected_raw` to a freshly allocated `TreeMetadata`
    /// built from `new`. Returns the new metadata's pointer on success so the caller can retire
    /// the old one once it is sure no concurrent reader can still be using it.
    pub fn swap(&self, expected_raw: u64, new: TreeMetadata) -> Option<*const TreeMetadata> {
        let new_ptr = Box::into_raw(Box::new(new));
        let words = vec![unsafe {
            WordEntry::new(self.metadata_addr(), expected_raw, new_ptr as u64)
        }];
        if pmwcas::commit(words) {
            Some(new_ptr)
        } else {
            // unwind: the allocation never got published, free it directly (no reader can have
            // observed it since it was never installed into the shared word).
            drop(unsafe { Box::from_raw(new_ptr as *mut TreeMetadata) });
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::node::Node;

    #[test]
    fn fresh_root_descriptor_reads_back() {
        let leaf = super::super::node::alloc_child(ChildNode::Leaf(Node::new_leaf()));
        let rd = RootDescriptor::new(TreeMetadata {
            root: leaf,
            height: 1,
            global_epoch: 0,
        });
        let (meta, _) = rd.metadata();
        assert_eq!(meta.height, 1);
        assert_eq!(meta.root, leaf);
    }

    #[test]
    fn swap_replaces_metadata_atomically() {
        let leaf = super::super::node::alloc_child(ChildNode::Leaf(Node::new_leaf()));
        let rd = RootDescriptor::new(TreeMetadata {
            root: leaf,
            height: 1,
            global_epoch: 0,
        });
        let (_, raw) = rd.metadata();
        let new_leaf = super::super::node::alloc_child(ChildNode::Leaf(Node::new_leaf()));
        let swapped = rd.swap(
            raw,
            TreeMetadata {
                root: new_leaf,
                height: 1,
                global_epoch: 1,
            },
        );
        assert!(swapped.is_some());
        assert_eq!(rd.metadata().0.global_epoch, 1);
    }
}

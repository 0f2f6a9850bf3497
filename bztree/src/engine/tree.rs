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

//! C8: the public tree.
//!
//! Every public method brackets its work with one `epoch::protect()` guard and drives an outer
//! self-restarting loop over `traverse`/`leaf`: a [`leaf::LeafOutcome::RetryLocal`] just retries
//! the same leaf reference, a [`leaf::LeafOutcome::RetryFromRoot`] redoes the whole descent
//! (running any SMO that traversal finds triggered along the way). `try_*` surfaces a bounded
//! retry cap as [`BzTreeError::RetryBudgetExceeded`]; the plain boolean methods use an
//! effectively-unbounded cap so they keep the original two-state (found/not-found) contract.

use {
    super::{
        config::Config,
        epoch,
        error::{BzTreeError, BzTreeResult},
        leaf::{self, EraseResult, InsertResult, LeafOutcome, UpdateResult},
        node::{ChildNode, Node},
        root::{RootDescriptor, TreeMetadata, MAX_GLOBAL_EPOCH},
        sync::Backoff,
        traverse,
    },
    core::sync::atomic::{AtomicU32, Ordering},
    log::{error, info, warn},
};

/// Attempt count at which a still-looping operation logs a warning without yet failing.
const RETRY_WARN_THRESHOLD: u32 = 1_000;

/// Budget used by the plain (non-`try_`) methods: high enough that it is never reached by any
/// realistic adversarial interleaving, so those methods keep their original boolean-only contract.
const UNBOUNDED_RETRY_BUDGET: u32 = u32::MAX;

static MOUNT_COUNTER: AtomicU32 = AtomicU32::new(0);

/// A lock-free, latch-free ordered index over byte-string keys and values.
///
/// Construct with [`BzTree::new`] (default [`Config`]) or [`BzTree::with_config`]. Every operation
/// is safe to call concurrently from any number of threads without external synchronization.
pub struct BzTree {
    root: RootDescriptor,
    config: Config,
}

impl BzTree {
    pub fn new() -> Self {
        Self::with_config(Config::new())
    }

    pub fn with_config(config: Config) -> Self {
        Self::try_with_config(config).expect("global_epoch exhausted: too many BzTree mounts in this process")
    }

    /// Fallible mount: fails only if this process has already mounted `2^27` trees, per the
    /// `global_epoch` field's width.
    pub fn try_with_config(config: Config) -> BzTreeResult<Self> {
        let epoch = MOUNT_COUNTER.fetch_add(1, Ordering::AcqRel);
        if epoch > MAX_GLOBAL_EPOCH {
            MOUNT_COUNTER.fetch_sub(1, Ordering::AcqRel);
            return Err(BzTreeError::InvariantViolation);
        }
        info!("mounting bztree, global_epoch={epoch}");
        let root_leaf = super::node::alloc_child(ChildNode::Leaf(Node::new_leaf()));
        let root = RootDescriptor::new(TreeMetadata {
            root: root_leaf,
            height: 1,
            global_epoch: epoch,
        });
        Ok(Self { root, config })
    }

    fn current_epoch(&self) -> u32 {
        self.root.metadata().0.global_epoch
    }

    fn check_budget(&self, tries: u32, budget: u32) -> BzTreeResult<()> {
        if tries == RETRY_WARN_THRESHOLD {
            warn!("bztree operation has retried {tries} times without committing");
        }
        if tries >= budget {
            error!("bztree operation exceeded its retry budget ({budget} attempts)");
            return Err(BzTreeError::RetryBudgetExceeded);
        }
        Ok(())
    }

    pub fn insert(&self, key: &[u8], value: &[u8]) -> bool {
        self.insert_with_budget(key, value, UNBOUNDED_RETRY_BUDGET)
            .unwrap_or(false)
    }

    pub fn try_insert(&self, key: &[u8], value: &[u8]) -> BzTreeResult<bool> {
        self.insert_with_budget(key, value, self.config.retry_budget)
    }

    fn insert_with_budget(&self, key: &[u8], value: &[u8], budget: u32) -> BzTreeResult<bool> {
        let guard = epoch::protect();
        let backoff = Backoff::new();
        let mut tries: u32 = 0;
        'outer: loop {
            let descent = traverse::locate_for_write(&self.root, key, &self.config, &guard);
            let leaf = unsafe { &*descent.leaf }
                .as_leaf()
                .expect("a descent always terminates on a leaf");
            loop {
                let epoch_val = self.current_epoch();
                match leaf::insert(leaf, key, value, epoch_val) {
                    LeafOutcome::Committed(InsertResult::Inserted) => return Ok(true),
                    LeafOutcome::Committed(InsertResult::Duplicate) => return Ok(false),
                    LeafOutcome::Committed(InsertResult::CapacityExceeded) => {
                        return Err(BzTreeError::CapacityExceeded)
                    }
                    LeafOutcome::RetryLocal => {
                        tries += 1;
                        self.check_budget(tries, budget)?;
                        backoff.snooze();
                    }
                    LeafOutcome::RetryFromRoot => {
                        tries += 1;
                        self.check_budget(tries, budget)?;
                        backoff.snooze();
                        continue 'outer;
                    }
                }
            }
        }
    }

    pub fn update(&self, key: &[u8], value: &[u8]) -> bool {
        self.update_with_budget(key, value, UNBOUNDED_RETRY_BUDGET)
            .unwrap_or(false)
    }

    pub fn try_update(&self, key: &[u8], value: &[u8]) -> BzTreeResult<bool> {
        self.update_with_budget(key, value, self.config.retry_budget)
    }

    fn update_with_budget(&self, key: &[u8], value: &[u8], budget: u32) -> BzTreeResult<bool> {
        let guard = epoch::protect();
        let backoff = Backoff::new();
        let mut tries: u32 = 0;
        'outer: loop {
            let descent = traverse::locate_for_write(&self.root, key, &self.config, &guard);
            let leaf = unsafe { &*descent.leaf }
                .as_leaf()
                .expect("a descent always terminates on a leaf");
            loop {
                match leaf::update(leaf, key, value) {
                    LeafOutcome::Committed(UpdateResult::Updated) => return Ok(true),
                    LeafOutcome::Committed(UpdateResult::NotFound) => return Ok(false),
                    LeafOutcome::Committed(UpdateResult::CapacityExceeded) => {
                        return Err(BzTreeError::CapacityExceeded)
                    }
                    LeafOutcome::RetryLocal => {
                        tries += 1;
                        self.check_budget(tries, budget)?;
                        backoff.snooze();
                    }
                    LeafOutcome::RetryFromRoot => {
                        tries += 1;
                        self.check_budget(tries, budget)?;
                        backoff.snooze();
                        continue 'outer;
                    }
                }
            }
        }
    }

    pub fn erase(&self, key: &[u8]) -> bool {
        self.erase_with_budget(key, UNBOUNDED_RETRY_BUDGET)
            .unwrap_or(false)
    }

    pub fn try_erase(&self, key: &[u8]) -> BzTreeResult<bool> {
        self.erase_with_budget(key, self.config.retry_budget)
    }

    fn erase_with_budget(&self, key: &[u8], budget: u32) -> BzTreeResult<bool> {
        let guard = epoch::protect();
        let backoff = Backoff::new();
        let mut tries: u32 = 0;
        'outer: loop {
            let descent = traverse::locate_for_write(&self.root, key, &self.config, &guard);
            let leaf = unsafe { &*descent.leaf }
                .as_leaf()
                .expect("a descent always terminates on a leaf");
            loop {
                match leaf::erase(leaf, key) {
                    LeafOutcome::Committed(EraseResult::Erased) => return Ok(true),
                    LeafOutcome::Committed(EraseResult::NotFound) => return Ok(false),
                    LeafOutcome::RetryLocal => {
                        tries += 1;
                        self.check_budget(tries, budget)?;
                        backoff.snooze();
                    }
                    LeafOutcome::RetryFromRoot => {
                        tries += 1;
                        self.check_budget(tries, budget)?;
                        backoff.snooze();
                        continue 'outer;
                    }
                }
            }
        }
    }

    /// Read-only; a concurrent SMO may retire the located leaf, but epoch protection keeps its
    /// bytes valid for the duration of this call, so a single pass never needs to retry.
    pub fn lookup(&self, key: &[u8]) -> Option<Vec<u8>> {
        let guard = epoch::protect();
        let descent = traverse::locate(&self.root, key);
        let leaf = unsafe { &*descent.leaf }
            .as_leaf()
            .expect("a descent always terminates on a leaf");
        let result = leaf::lookup(leaf, key);
        drop(guard);
        result
    }

    /// Identical to [`Self::lookup`]; provided for symmetry with the other `try_*` methods. Never
    /// fails (a lookup has no retry budget to exhaust).
    pub fn try_lookup(&self, key: &[u8]) -> BzTreeResult<Option<Vec<u8>>> {
        Ok(self.lookup(key))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl Default for BzTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl BzTree {
    /// Current tree height (`1` for a single-leaf tree). Testing/validation hook only.
    pub(crate) fn height(&self) -> u32 {
        self.root.metadata().0.height
    }

    /// Walks the whole tree, checking the §3 node invariants and the §4.4 routing-key invariant
    /// on every inner node. Returns `false` on the first violation found rather than panicking, so
    /// property tests can shrink/report rather than abort the whole suite.
    pub(crate) fn debug_validate(&self) -> bool {
        let guard = epoch::protect();
        let (meta, _) = self.root.metadata();
        let ok = validate_subtree(meta.root, meta.height);
        drop(guard);
        ok
    }

    /// All currently-visible keys across every leaf, left to right. Property 5 (§8) asserts no
    /// duplicates ever appear here.
    pub(crate) fn bulk_scan(&self) -> Vec<Vec<u8>> {
        let guard = epoch::protect();
        let (meta, _) = self.root.metadata();
        let mut out = Vec::new();
        collect_keys(meta.root, &mut out);
        drop(guard);
        out
    }
}

#[cfg(test)]
fn validate_subtree(ptr: *const ChildNode, remaining_height: u32) -> bool {
    use super::node::{BODY_SIZE, META_ENTRY_SIZE};
    match unsafe { &*ptr } {
        ChildNode::Leaf(leaf) => {
            if remaining_height != 1 {
                return false; // every leaf must sit at depth height-1
            }
            let st = leaf.status();
            if (st.block_size as usize) + (st.record_count as usize) * META_ENTRY_SIZE
                > BODY_SIZE
            {
                return false;
            }
            if leaf.sorted_count() > st.record_count {
                return false;
            }
            let mut ranges: Vec<(u32, u32)> = Vec::new();
            for (_, m) in leaf.iter_metadata() {
                if m.visible {
                    let range = (m.offset, m.offset + m.total_len as u32);
                    for &(s, e) in &ranges {
                        if range.0 < e && s < range.1 {
                            return false; // overlapping live records
                        }
                    }
                    ranges.push(range);
                }
            }
            true
        }
        ChildNode::Inner(inner) => {
            if remaining_height < 2 {
                return false;
            }
            for i in 1..inner.len() {
                if inner.key(i) < inner.key(i - 1) {
                    return false; // routing keys must be non-decreasing left to right
                }
            }
            (0..inner.len()).all(|i| validate_subtree(inner.child_ptr(i), remaining_height - 1))
        }
    }
}

#[cfg(test)]
fn collect_keys(ptr: *const ChildNode, out: &mut Vec<Vec<u8>>) {
    match unsafe { &*ptr } {
        ChildNode::Leaf(leaf) => {
            for (k, _) in leaf.visible_records() {
                out.push(k.to_vec());
            }
        }
        ChildNode::Inner(inner) => {
            for i in 0..inner.len() {
                collect_keys(inner.child_ptr(i), out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_tree_lookup_misses() {
        let tree = BzTree::new();
        assert_eq!(tree.lookup(b"anything"), None);
    }

    #[test]
    fn single_pair_roundtrip() {
        let tree = BzTree::new();
        assert!(tree.insert(b"k", b"v"));
        assert_eq!(tree.lookup(b"k"), Some(b"v".to_vec()));
    }

    #[test]
    fn duplicate_insert_returns_false() {
        let tree = BzTree::new();
        assert!(tree.insert(b"k", b"v1"));
        assert!(!tree.insert(b"k", b"v2"));
        assert_eq!(tree.lookup(b"k"), Some(b"v1".to_vec()));
    }

    #[test]
    fn update_missing_key_returns_false() {
        let tree = BzTree::new();
        assert!(!tree.update(b"nope", b"v"));
    }

    #[test]
    fn update_then_lookup_sees_new_value() {
        let tree = BzTree::new();
        assert!(tree.insert(b"k", b"v1"));
        assert!(tree.update(b"k", b"v2-longer-value"));
        assert_eq!(tree.lookup(b"k"), Some(b"v2-longer-value".to_vec()));
    }

    #[test]
    fn erase_then_lookup_misses() {
        let tree = BzTree::new();
        assert!(tree.insert(b"k", b"v"));
        assert!(tree.erase(b"k"));
        assert_eq!(tree.lookup(b"k"), None);
        assert!(!tree.erase(b"k"));
    }

    #[test]
    fn fill_one_leaf_to_capacity() {
        let tree = BzTree::new();
        let mut inserted = 0;
        for i in 0..64u32 {
            let k = format!("k{i:06}");
            let v = format!("v{i:06}");
            if tree.insert(k.as_bytes(), v.as_bytes()) {
                inserted += 1;
            }
        }
        assert!(inserted >= 8);
        for i in 0..inserted {
            let k = format!("k{i:06}");
            let v = format!("v{i:06}");
            assert_eq!(tree.lookup(k.as_bytes()), Some(v.into_bytes()));
        }
    }

    #[test]
    fn compact_by_churn_keeps_unrelated_key() {
        let tree = BzTree::new();
        assert!(tree.insert(b"always kept", b"safe and sound"));
        for i in 0..24u32 {
            let k = format!("k{i:06}");
            let v = format!("v{i:06}");
            tree.insert(k.as_bytes(), v.as_bytes());
            tree.erase(k.as_bytes());
        }
        assert_eq!(
            tree.lookup(b"always kept"),
            Some(b"safe and sound".to_vec())
        );
        for i in 0..24u32 {
            let k = format!("k{i:06}");
            assert_eq!(tree.lookup(k.as_bytes()), None);
        }
    }

    #[test]
    fn multi_level_split_reaches_height_two() {
        let tree = BzTree::new();
        for i in 0..80u32 {
            let k = format!("k{i:06}");
            let v = format!("v{i:06}");
            assert!(tree.insert(k.as_bytes(), v.as_bytes()));
        }
        assert!(tree.root.metadata().0.height >= 2);
        for i in 0..80u32 {
            let k = format!("k{i:06}");
            let v = format!("v{i:06}");
            assert_eq!(tree.lookup(k.as_bytes()), Some(v.into_bytes()));
        }
    }

    #[test]
    fn try_insert_too_large_value_reports_capacity_exceeded() {
        let tree = BzTree::new();
        let huge = vec![0u8; 4096];
        assert_eq!(
            tree.try_insert(b"k", &huge),
            Err(BzTreeError::CapacityExceeded)
        );
    }

    #[test]
    fn mount_assigns_increasing_global_epochs() {
        let a = BzTree::new();
        let b = BzTree::new();
        assert!(b.current_epoch() > a.current_epoch());
    }
}

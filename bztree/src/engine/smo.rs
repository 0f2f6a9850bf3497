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

//! C6: the structural-modification (SMO) engine. Every SMO here is copy-on-write: build a
//! replacement subtree from the frozen original, then publish it with one PMwCAS that also
//! reasserts the publishing point isn't itself frozen by a concurrent SMO. Thresholds are
//! evaluated at the leaf only; `InnerNode` in this crate is a `Vec`-backed routing array rather
//! than a fixed 256-byte block (see `node.rs`'s module doc), so it carries no `free_space`/
//! `deleted_space` budget of its own to trigger against.

use {
    super::{
        config::Config,
        epoch::{self, Guard},
        node::{self, ChildNode, InnerNode, Node, StatusWord},
        pmwcas::{self, WordEntry},
        root::{RootDescriptor, TreeMetadata},
    },
    core::sync::atomic::{AtomicU64, Ordering},
    log::debug,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    None,
    Compact,
    Split,
    Merge,
}

/// One step of the path from the tree root down to (but not including) the leaf: the inner node
/// visited and the child index taken out of it.
pub type PathEntry = (*const ChildNode, usize);

pub fn evaluate(leaf: &Node, config: &Config) -> Trigger {
    if leaf.deleted_space() > config.max_deleted_space {
        Trigger::Compact
    } else if leaf.free_space() < config.min_free_space as i64 {
        Trigger::Split
    } else if leaf.free_space() > config.max_free_space as i64 {
        Trigger::Merge
    } else {
        Trigger::None
    }
}

/// Evaluates the leaf's SMO trigger and, if one fires, runs the corresponding operation. Returns
/// whether an SMO was performed (the caller must restart traversal from the root if so) versus
/// left untouched (`Trigger::None`) or aborted by a lost race (internally retried by the threshold
/// simply firing again on the next traversal).
pub fn maybe_run(
    root_desc: &RootDescriptor,
    height: u32,
    leaf_ptr: *const ChildNode,
    immediate: Option<PathEntry>,
    upper: Option<PathEntry>,
    config: &Config,
    guard: &Guard,
) -> bool {
    let leaf = unsafe { &*leaf_ptr }
        .as_leaf()
        .expect("maybe_run is only ever called with a leaf pointer");
    match evaluate(leaf, config) {
        Trigger::None => false,
        Trigger::Compact => {
            debug!("smo: compact triggered (deleted_space > max_deleted_space)");
            run_compact(leaf_ptr, immediate, root_desc, guard)
        }
        Trigger::Split => {
            debug!("smo: split triggered (free_space < min_free_space)");
            run_split(leaf_ptr, immediate, upper, height, root_desc, guard)
        }
        Trigger::Merge => {
            debug!("smo: merge triggered (free_space > max_free_space)");
            run_merge(leaf_ptr, immediate, upper, height, root_desc, config, guard)
        }
    }
}

fn rollback_freeze(addr: *const AtomicU64, frozen_raw: u64, original_raw: u64) {
    let _ = unsafe { &*addr }.compare_exchange(
        frozen_raw,
        original_raw,
        Ordering::AcqRel,
        Ordering::Acquire,
    );
}

fn freeze_word(addr: *const AtomicU64, raw: u64) -> Option<(WordEntry, u64)> {
    let status = StatusWord::decode(raw);
    if status.frozen {
        return None;
    }
    let frozen_raw = status.with_frozen().encode();
    Some((unsafe { WordEntry::new(addr, raw, frozen_raw) }, frozen_raw))
}

/// Swaps `leaf_ptr`'s slot for `new_ptr` at `immediate`, or (if `immediate` is `None`, meaning
/// `leaf_ptr` is itself the tree root) swaps the root metadata's `root` field. The 2-word PMwCAS
/// also reasserts the publishing point's own status word is unfrozen.
fn publish_at(
    immediate: Option<PathEntry>,
    old_ptr: *const ChildNode,
    new_ptr: *const ChildNode,
    new_height: u32,
    root_desc: &RootDescriptor,
    guard: &Guard,
) -> bool {
    match immediate {
        Some((parent_ptr, idx)) => {
            let parent = unsafe { &*parent_ptr }
                .as_inner()
                .expect("path entries are always inner nodes");
            let parent_status_raw = parent.status_raw();
            if StatusWord::decode(parent_status_raw).frozen {
                return false;
            }
            let child_addr = parent.child_addr(idx);
            let child_raw = parent.child_raw(idx);
            if child_raw != old_ptr as u64 {
                return false;
            }
            pmwcas::commit(vec![
                unsafe { WordEntry::new(parent.status_addr(), parent_status_raw, parent_status_raw) },
                unsafe { WordEntry::new(child_addr, child_raw, new_ptr as u64) },
            ])
        }
        None => {
            let (meta, meta_raw) = root_desc.metadata();
            if meta.root != old_ptr {
                return false;
            }
            let old_meta_ptr = meta_raw as *const TreeMetadata;
            match root_desc.swap(
                meta_raw,
                TreeMetadata {
                    root: new_ptr,
                    height: new_height,
                    global_epoch: meta.global_epoch,
                },
            ) {
                Some(_) => {
                    unsafe { epoch::retire_metadata(old_meta_ptr, guard) };
                    true
                }
                None => false,
            }
        }
    }
}

fn run_compact(
    leaf_ptr: *const ChildNode,
    immediate: Option<PathEntry>,
    root_desc: &RootDescriptor,
    guard: &Guard,
) -> bool {
    let leaf = unsafe { &*leaf_ptr }.as_leaf().unwrap();
    let leaf_status_raw = leaf.status_raw();
    let Some((freeze_entry, leaf_frozen_raw)) = freeze_word(leaf.status_addr(), leaf_status_raw)
    else {
        return false;
    };
    if !pmwcas::commit(vec![freeze_entry]) {
        return false;
    }

    let mut records = leaf.visible_records();
    records.sort_by(|a, b| a.0.cmp(b.0));
    let new_ptr = node::alloc_child(ChildNode::Leaf(Node::build_sorted(&records)));

    if publish_at(immediate, leaf_ptr, new_ptr, 1, root_desc, guard) {
        unsafe { epoch::retire_child(leaf_ptr, guard) };
        true
    } else {
        rollback_freeze(leaf.status_addr(), leaf_frozen_raw, leaf_status_raw);
        unsafe { node::free_child(new_ptr) };
        false
    }
}

/// Splits `records` at the byte-size midpoint (balancing bytes, not record counts) rather than at
/// the element midpoint. Never returns `0` or `records.len()`: both halves are non-empty.
fn split_point(records: &[(&[u8], &[u8])]) -> usize {
    let total: usize = records.iter().map(|(k, v)| k.len() + v.len()).sum();
    let half = total / 2;
    let mut acc = 0usize;
    for (i, (k, v)) in records.iter().enumerate() {
        acc += k.len() + v.len();
        if acc >= half && i + 1 < records.len() {
            return i + 1;
        }
    }
    (records.len() / 2).max(1)
}

fn rebuild_parent_with_split(
    parent: &InnerNode,
    idx: usize,
    left_ptr: *const ChildNode,
    right_ptr: *const ChildNode,
    separator: Vec<u8>,
) -> InnerNode {
    let mut entries = Vec::with_capacity(parent.len() + 1);
    for i in 0..parent.len() {
        if i == idx {
            entries.push((parent.key(i).to_vec(), left_ptr));
            entries.push((separator.clone(), right_ptr));
        } else {
            entries.push((parent.key(i).to_vec(), parent.child_ptr(i)));
        }
    }
    InnerNode::new(entries)
}

fn run_split(
    leaf_ptr: *const ChildNode,
    immediate: Option<PathEntry>,
    upper: Option<PathEntry>,
    height: u32,
    root_desc: &RootDescriptor,
    guard: &Guard,
) -> bool {
    let leaf = unsafe { &*leaf_ptr }.as_leaf().unwrap();
    let leaf_status_raw = leaf.status_raw();
    let Some((leaf_freeze, leaf_frozen_raw)) = freeze_word(leaf.status_addr(), leaf_status_raw)
    else {
        return false;
    };

    let mut freeze_words = vec![leaf_freeze];
    let immediate_freeze = match immediate {
        Some((parent_ptr, _)) => {
            let parent = unsafe { &*parent_ptr }.as_inner().unwrap();
            let raw = parent.status_raw();
            match freeze_word(parent.status_addr(), raw) {
                Some((entry, frozen_raw)) => {
                    freeze_words.push(entry);
                    Some((parent.status_addr(), raw, frozen_raw))
                }
                None => return false,
            }
        }
        None => None,
    };

    if !pmwcas::commit(freeze_words) {
        return false;
    }

    let mut records = leaf.visible_records();
    records.sort_by(|a, b| a.0.cmp(b.0));
    let sp = split_point(&records);
    let (left_recs, right_recs) = records.split_at(sp);
    let separator = right_recs[0].0.to_vec();
    let left_ptr = node::alloc_child(ChildNode::Leaf(Node::build_sorted(left_recs)));
    let right_ptr = node::alloc_child(ChildNode::Leaf(Node::build_sorted(right_recs)));

    let (new_upper_ptr, new_height) = match immediate {
        None => {
            let new_root = InnerNode::new(vec![(Vec::new(), left_ptr), (separator, right_ptr)]);
            (node::alloc_child(ChildNode::Inner(new_root)), height + 1)
        }
        Some((parent_ptr, idx)) => {
            let parent = unsafe { &*parent_ptr }.as_inner().unwrap();
            let new_parent = rebuild_parent_with_split(parent, idx, left_ptr, right_ptr, separator);
            (node::alloc_child(ChildNode::Inner(new_parent)), height)
        }
    };

    let published = match immediate {
        None => publish_at(None, leaf_ptr, new_upper_ptr, new_height, root_desc, guard),
        Some((parent_ptr, _)) => publish_at(upper, parent_ptr, new_upper_ptr, new_height, root_desc, guard),
    };

    if published {
        unsafe {
            epoch::retire_child(leaf_ptr, guard);
            if let Some((parent_ptr, _)) = immediate {
                epoch::retire_child(parent_ptr, guard);
            }
        }
        true
    } else {
        rollback_freeze(leaf.status_addr(), leaf_frozen_raw, leaf_status_raw);
        if let Some((addr, raw, frozen_raw)) = immediate_freeze {
            rollback_freeze(addr, frozen_raw, raw);
        }
        unsafe {
            node::free_child(left_ptr);
            node::free_child(right_ptr);
            node::free_child(new_upper_ptr);
        }
        false
    }
}

fn sibling_index(idx: usize, parent_len: usize) -> Option<usize> {
    if idx > 0 {
        Some(idx - 1)
    } else if idx + 1 < parent_len {
        Some(idx + 1)
    } else {
        None
    }
}

fn run_merge(
    leaf_ptr: *const ChildNode,
    immediate: Option<PathEntry>,
    upper: Option<PathEntry>,
    height: u32,
    root_desc: &RootDescriptor,
    config: &Config,
    guard: &Guard,
) -> bool {
    let Some((parent_ptr, idx)) = immediate else {
        // the root leaf has no sibling to merge with.
        return false;
    };
    let parent = unsafe { &*parent_ptr }.as_inner().unwrap();
    let Some(sib_idx) = sibling_index(idx, parent.len()) else {
        return false;
    };
    let sibling_ptr = parent.child_ptr(sib_idx);
    let Some(sibling) = unsafe { &*sibling_ptr }.as_leaf() else {
        // only leaf-level siblings are merged by this engine.
        return false;
    };
    let leaf = unsafe { &*leaf_ptr }.as_leaf().unwrap();

    let combined_free = leaf.free_space() + sibling.free_space() - node::BODY_SIZE as i64;
    if combined_free < config.min_free_space as i64 {
        return false;
    }

    let leaf_status_raw = leaf.status_raw();
    let sibling_status_raw = sibling.status_raw();
    let parent_status_raw = parent.status_raw();
    let (Some((leaf_freeze, leaf_frozen_raw)), Some((sib_freeze, sib_frozen_raw))) = (
        freeze_word(leaf.status_addr(), leaf_status_raw),
        freeze_word(sibling.status_addr(), sibling_status_raw),
    ) else {
        return false;
    };
    let Some((parent_freeze, parent_frozen_raw)) =
        freeze_word(parent.status_addr(), parent_status_raw)
    else {
        return false;
    };

    if !pmwcas::commit(vec![leaf_freeze, sib_freeze, parent_freeze]) {
        return false;
    }

    let (lower_ptr, lower_idx, higher_idx) = if sib_idx < idx {
        (sibling_ptr, sib_idx, idx)
    } else {
        (leaf_ptr, idx, sib_idx)
    };
    let _ = lower_ptr;

    let mut records = leaf.visible_records();
    records.extend(sibling.visible_records());
    records.sort_by(|a, b| a.0.cmp(b.0));
    let merged_ptr = node::alloc_child(ChildNode::Leaf(Node::build_sorted(&records)));

    let mut entries = Vec::with_capacity(parent.len() - 1);
    for i in 0..parent.len() {
        if i == higher_idx {
            continue;
        } else if i == lower_idx {
            entries.push((parent.key(i).to_vec(), merged_ptr));
        } else {
            entries.push((parent.key(i).to_vec(), parent.child_ptr(i)));
        }
    }

    let collapse_to_single_child = entries.len() == 1 && upper.is_none() && height > 1;

    let rollback = |new_parent_ptr: Option<*const ChildNode>| {
        rollback_freeze(leaf.status_addr(), leaf_frozen_raw, leaf_status_raw);
        rollback_freeze(sibling.status_addr(), sib_frozen_raw, sibling_status_raw);
        rollback_freeze(parent.status_addr(), parent_frozen_raw, parent_status_raw);
        unsafe {
            node::free_child(merged_ptr);
            if let Some(p) = new_parent_ptr {
                node::free_child(p);
            }
        }
    };

    if collapse_to_single_child {
        // root-level merge: the rebuilt parent (itself the root) would hold a single routing
        // entry; replace the root directly with that entry's child and decrement height instead.
        let published = publish_at(None, parent_ptr, merged_ptr, height - 1, root_desc, guard);
        if published {
            unsafe {
                epoch::retire_child(leaf_ptr, guard);
                epoch::retire_child(sibling_ptr, guard);
                epoch::retire_child(parent_ptr, guard);
            }
            true
        } else {
            rollback(None);
            false
        }
    } else {
        let new_parent_ptr = node::alloc_child(ChildNode::Inner(InnerNode::new(entries)));
        let published = publish_at(upper, parent_ptr, new_parent_ptr, height, root_desc, guard);
        if published {
            unsafe {
                epoch::retire_child(leaf_ptr, guard);
                epoch::retire_child(sibling_ptr, guard);
                epoch::retire_child(parent_ptr, guard);
            }
            true
        } else {
            rollback(Some(new_parent_ptr));
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluate_reports_compact_for_overfull_deleted_space() {
        let config = Config::new();
        let records: Vec<(&[u8], &[u8])> = vec![(b"a", b"1")];
        let leaf = Node::build_sorted(&records);
        // a fresh node has no deleted space; trigger should be none at default thresholds.
        assert_eq!(evaluate(&leaf, &config), Trigger::None);
    }

    #[test]
    fn split_point_balances_bytes_not_counts() {
        let records: Vec<(&[u8], &[u8])> =
            vec![(b"a", b"xxxxxxxxxx"), (b"b", b"x"), (b"c", b"x"), (b"d", b"x")];
        let sp = split_point(&records);
        assert!(sp >= 1 && sp < records.len());
    }
}

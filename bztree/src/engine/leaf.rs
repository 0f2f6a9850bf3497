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

//! C4: the leaf protocol. Every operation here runs against a single, already-located leaf
//! [`Node`]; none of it knows about the tree shape above it. Callers (see `traverse.rs` and
//! `tree.rs`) drive the outer "self-restarting operation" loop: a [`LeafOutcome::RetryFromRoot`]
//! means the leaf was frozen or is out of room and a fresh traversal (possibly running an SMO) is
//! needed; [`LeafOutcome::RetryLocal`] means the same leaf reference is still good, just contended.

use {
    super::{
        node::{Metadata, Node, BODY_SIZE, META_ENTRY_SIZE},
        pmwcas::{self, WordEntry},
        sync::Backoff,
    },
    log::{debug, trace},
};

/// Bounded helping-wait for a concurrent reservation to resolve before the second dup-check can
/// read its key. This only matters when two inserts of a colliding key race; real collisions are
/// rare enough that a bounded spin (rather than true blocking) is an acceptable compromise for a
/// lock-free design.
const MAX_RESERVATION_WAIT_SPINS: u32 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafOutcome<T> {
    Committed(T),
    RetryLocal,
    RetryFromRoot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    Inserted,
    Duplicate,
    CapacityExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateResult {
    Updated,
    NotFound,
    CapacityExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseResult {
    Erased,
    NotFound,
}

fn find_visible(node: &Node, key: &[u8]) -> Option<(usize, Metadata)> {
    node.iter_metadata()
        .find(|(_, m)| m.visible && node.key(*m) == key)
}

/// Waits (bounded) for the reservation at `idx` to resolve into either a visible record or a
/// tombstone, then reports whether it ended up carrying `key`.
fn reservation_resolves_to_key(node: &Node, idx: usize, key: &[u8]) -> bool {
    let backoff = Backoff::new();
    let mut meta = node.metadata(idx);
    let mut spins = 0;
    while meta.is_reservation() && spins < MAX_RESERVATION_WAIT_SPINS {
        backoff.snooze();
        meta = node.metadata(idx);
        spins += 1;
    }
    if meta.is_reservation() {
        // gave up waiting; treat as "not a conflict" rather than stalling this thread forever.
        // a genuine collision would still be caught by the losing side's own second dup-check.
        debug!("leaf: gave up waiting on reservation at index {idx} to resolve");
        return false;
    }
    meta.visible && node.key(meta) == key
}

/// §4.3 step 5: re-scans every slot below `upto` for a visible or still-resolving record sharing
/// `key`. Lower record index always wins ties.
fn duplicate_exists_before(node: &Node, upto: usize, key: &[u8]) -> bool {
    for i in 0..upto {
        let meta = node.metadata(i);
        if meta.is_reservation() {
            if reservation_resolves_to_key(node, i, key) {
                return true;
            }
            continue;
        }
        if meta.visible && node.key(meta) == key {
            return true;
        }
    }
    false
}

pub fn insert(node: &Node, key: &[u8], value: &[u8], epoch: u32) -> LeafOutcome<InsertResult> {
    let key_len = key.len() + 1;
    let total_len = key_len + value.len() + 1;
    if META_ENTRY_SIZE + total_len > BODY_SIZE {
        return LeafOutcome::Committed(InsertResult::CapacityExceeded);
    }

    // opportunistic dup-check
    if node.iter_metadata().any(|(_, m)| m.visible && node.key(m) == key) {
        return LeafOutcome::Committed(InsertResult::Duplicate);
    }

    let st = node.status();
    if st.frozen {
        return LeafOutcome::RetryFromRoot;
    }
    let needed = META_ENTRY_SIZE as i64 + total_len as i64;
    if node.free_space() < needed {
        return LeafOutcome::RetryFromRoot;
    }

    let new_index = st.record_count as usize;
    let new_status = super::node::StatusWord {
        block_size: st.block_size + total_len as u32,
        record_count: st.record_count + 1,
        ..st
    };
    let reserve_meta = Metadata::reserved(epoch);
    trace!("leaf: reserving slot {new_index} for {total_len}B record");
    let words = vec![
        unsafe { WordEntry::new(node.status_addr(), st.encode(), new_status.encode()) },
        unsafe { WordEntry::new(node.metadata_addr(new_index), 0, reserve_meta.encode()) },
    ];
    if !pmwcas::commit(words) {
        return if node.status().frozen {
            LeafOutcome::RetryFromRoot
        } else {
            LeafOutcome::RetryLocal
        };
    }

    let heap_offset = BODY_SIZE as u32 - new_status.block_size;
    node.write_record(heap_offset, key, value);

    if duplicate_exists_before(node, new_index, key) {
        debug!("leaf: losing a concurrent duplicate-insert race for a key, tombstoning slot {new_index}");
        let cur = node.status();
        let tomb_status = super::node::StatusWord {
            delete_size: cur.delete_size + total_len as u32,
            ..cur
        };
        let words = vec![
            unsafe { WordEntry::new(node.status_addr(), cur.encode(), tomb_status.encode()) },
            unsafe {
                WordEntry::new(
                    node.metadata_addr(new_index),
                    reserve_meta.encode(),
                    Metadata::TOMBSTONE.encode(),
                )
            },
        ];
        // best-effort: if this fails the node is being frozen out from under us anyway, and the
        // reservation slot dies with the node.
        let _ = pmwcas::commit(words);
        return LeafOutcome::Committed(InsertResult::Duplicate);
    }

    let cur_status = node.status();
    if cur_status.frozen {
        return LeafOutcome::RetryFromRoot;
    }
    let published = Metadata::published(heap_offset, key_len as u16, total_len as u16);
    let words = vec![
        unsafe { WordEntry::new(node.status_addr(), cur_status.encode(), cur_status.encode()) },
        unsafe {
            WordEntry::new(
                node.metadata_addr(new_index),
                reserve_meta.encode(),
                published.encode(),
            )
        },
    ];
    if pmwcas::commit(words) {
        LeafOutcome::Committed(InsertResult::Inserted)
    } else if node.status().frozen {
        LeafOutcome::RetryFromRoot
    } else {
        LeafOutcome::RetryLocal
    }
}

pub fn update(node: &Node, key: &[u8], value: &[u8]) -> LeafOutcome<UpdateResult> {
    let new_key_len = key.len() + 1;
    let new_total_len = new_key_len + value.len() + 1;
    if META_ENTRY_SIZE + new_total_len > BODY_SIZE {
        return LeafOutcome::Committed(UpdateResult::CapacityExceeded);
    }
    let (idx, old_meta) = match find_visible(node, key) {
        Some(x) => x,
        None => return LeafOutcome::Committed(UpdateResult::NotFound),
    };

    let st = node.status();
    if st.frozen {
        return LeafOutcome::RetryFromRoot;
    }
    if node.free_space() < new_total_len as i64 {
        return LeafOutcome::RetryFromRoot;
    }

    let reserve_status = super::node::StatusWord {
        block_size: st.block_size + new_total_len as u32,
        ..st
    };
    let words = vec![unsafe {
        WordEntry::new(node.status_addr(), st.encode(), reserve_status.encode())
    }];
    if !pmwcas::commit(words) {
        return if node.status().frozen {
            LeafOutcome::RetryFromRoot
        } else {
            LeafOutcome::RetryLocal
        };
    }

    let heap_offset = BODY_SIZE as u32 - reserve_status.block_size;
    node.write_record(heap_offset, key, value);

    if node.metadata(idx) != old_meta {
        // the record we located was concurrently updated or erased out from under us
        return LeafOutcome::RetryFromRoot;
    }

    let cur_status = node.status();
    if cur_status.frozen {
        return LeafOutcome::RetryFromRoot;
    }
    let final_status = super::node::StatusWord {
        delete_size: cur_status.delete_size + old_meta.total_len as u32,
        ..cur_status
    };
    let new_meta = Metadata::published(heap_offset, new_key_len as u16, new_total_len as u16);
    let words = vec![
        unsafe { WordEntry::new(node.status_addr(), cur_status.encode(), final_status.encode()) },
        unsafe { WordEntry::new(node.metadata_addr(idx), old_meta.encode(), new_meta.encode()) },
    ];
    if pmwcas::commit(words) {
        LeafOutcome::Committed(UpdateResult::Updated)
    } else if node.status().frozen {
        LeafOutcome::RetryFromRoot
    } else {
        LeafOutcome::RetryLocal
    }
}

pub fn erase(node: &Node, key: &[u8]) -> LeafOutcome<EraseResult> {
    let (idx, old_meta) = match find_visible(node, key) {
        Some(x) => x,
        None => return LeafOutcome::Committed(EraseResult::NotFound),
    };
    let st = node.status();
    if st.frozen {
        return LeafOutcome::RetryFromRoot;
    }
    let new_status = super::node::StatusWord {
        delete_size: st.delete_size + old_meta.total_len as u32 + META_ENTRY_SIZE as u32,
        ..st
    };
    let words = vec![
        unsafe { WordEntry::new(node.status_addr(), st.encode(), new_status.encode()) },
        unsafe {
            WordEntry::new(
                node.metadata_addr(idx),
                old_meta.encode(),
                Metadata::TOMBSTONE.encode(),
            )
        },
    ];
    if pmwcas::commit(words) {
        LeafOutcome::Committed(EraseResult::Erased)
    } else if node.status().frozen {
        LeafOutcome::RetryFromRoot
    } else {
        LeafOutcome::RetryLocal
    }
}

/// Linear scan for the value of `key`. Read-only; the caller must still hold epoch protection so
/// the leaf itself cannot be reclaimed mid-scan, but no PMwCAS is involved.
pub fn lookup(node: &Node, key: &[u8]) -> Option<Vec<u8>> {
    find_visible(node, key).map(|(_, m)| node.value(m).to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_lookup() {
        let node = Node::new_leaf();
        assert_eq!(
            insert(&node, b"key", b"value", 0),
            LeafOutcome::Committed(InsertResult::Inserted)
        );
        assert_eq!(lookup(&node, b"key"), Some(b"value".to_vec()));
        assert_eq!(lookup(&node, b"missing"), None);
    }

    #[test]
    fn duplicate_insert_rejected() {
        let node = Node::new_leaf();
        assert_eq!(
            insert(&node, b"key", b"v1", 0),
            LeafOutcome::Committed(InsertResult::Inserted)
        );
        assert_eq!(
            insert(&node, b"key", b"v2", 0),
            LeafOutcome::Committed(InsertResult::Duplicate)
        );
        assert_eq!(lookup(&node, b"key"), Some(b"v1".to_vec()));
    }

    #[test]
    fn update_replaces_value_by_append() {
        let node = Node::new_leaf();
        insert(&node, b"key", b"v1", 0);
        assert_eq!(
            update(&node, b"key", b"v2-longer"),
            LeafOutcome::Committed(UpdateResult::Updated)
        );
        assert_eq!(lookup(&node, b"key"), Some(b"v2-longer".to_vec()));
    }

    #[test]
    fn update_missing_key_not_found() {
        let node = Node::new_leaf();
        assert_eq!(
            update(&node, b"nope", b"v"),
            LeafOutcome::Committed(UpdateResult::NotFound)
        );
    }

    #[test]
    fn erase_then_lookup_absent() {
        let node = Node::new_leaf();
        insert(&node, b"key", b"v1", 0);
        assert_eq!(
            erase(&node, b"key"),
            LeafOutcome::Committed(EraseResult::Erased)
        );
        assert_eq!(lookup(&node, b"key"), None);
        assert_eq!(erase(&node, b"key"), LeafOutcome::Committed(EraseResult::NotFound));
    }

    #[test]
    fn insert_into_frozen_leaf_retries_from_root() {
        let node = Node::new_leaf();
        let st = node.status();
        let frozen = st.with_frozen();
        let words = vec![unsafe {
            WordEntry::new(node.status_addr(), st.encode(), frozen.encode())
        }];
        assert!(pmwcas::commit(words));
        assert_eq!(insert(&node, b"k", b"v", 0), LeafOutcome::RetryFromRoot);
    }
}

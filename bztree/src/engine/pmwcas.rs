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

//! C2: the PMwCAS adapter.
//!
//! This is an in-process software multi-word CAS, not a wrapper over a separately supplied
//! descriptor pool (there is no such pool crate in this workspace; see `DESIGN.md`). The algorithm
//! is the standard "dirty pointer" install/finish protocol: a descriptor lists up to
//! [`MAX_WORDS`] `(address, expected, desired)` triples; committing installs a tagged pointer to
//! the descriptor into every target word whose current value matches `expected`, decides the
//! outcome with a single atomic flip of the descriptor's own status, then finalizes every word to
//! `desired` (success) or back to `expected` (failure). A thread that observes another thread's
//! dirty word helps that descriptor finish before retrying its own word, which is what gives the
//! whole thing its lock-free progress guarantee: some descriptor among the contending ones always
//! reaches a decision.
//!
//! Every target word reserves its low 3 bits as a `control` field (see `node.rs`); this module
//! only ever uses the lowest of those three bits (the dirty tag), leaving the other two free for
//! future per-word tagging, per `SPEC_FULL.md` §4.1.

use {
    super::sync::Backoff,
    crate::engine::mem::UArray,
    core::sync::atomic::{AtomicU64, AtomicU8, Ordering},
};

/// Maximum number of words a single PMwCAS operation in this crate ever targets: the largest user
/// is a 3-sibling merge (freeze leaf + sibling + parent in one CAS).
pub const MAX_WORDS: usize = 4;

/// Low bit of every PMwCAS-targeted word's reserved control field: marks the word as "dirty",
/// i.e. holding a tagged pointer to an in-flight descriptor rather than a logical value.
const DIRTY_BIT: u64 = 0b001;
const PTR_MASK: u64 = !0b111;

const ST_UNDECIDED: u8 = 0;
const ST_SUCCEEDED: u8 = 1;
const ST_FAILED: u8 = 2;

/// One target word of a PMwCAS operation.
#[derive(Clone, Copy)]
pub struct WordEntry {
    address: *const AtomicU64,
    expected: u64,
    desired: u64,
}

impl WordEntry {
    /// # Safety
    /// `address` must stay valid (i.e. the node owning it must not be reclaimed) for as long as
    /// any PMwCAS descriptor referencing it might still be helped along by another thread. Since
    /// every caller here holds epoch protection across the whole operation, and nodes are only
    /// retired after every such epoch has ended, this holds for all call sites in this crate.
    pub unsafe fn new(address: *const AtomicU64, expected: u64, desired: u64) -> Self {
        debug_assert_eq!(address as usize % 8, 0, "pmwcas target must be 8-byte aligned");
        debug_assert_eq!(expected & DIRTY_BIT, 0, "expected value must not look dirty");
        Self {
            address,
            expected,
            desired,
        }
    }
}

// SAFETY: the raw pointer is only ever dereferenced while the referent is kept alive by the
// caller's epoch guard, which is `Send`-transitive across the thread that issues the PMwCAS.
unsafe impl Send for WordEntry {}
unsafe impl Sync for WordEntry {}

struct Descriptor {
    status: AtomicU8,
    words: UArray<MAX_WORDS, WordEntry>,
}

#[inline(always)]
fn is_dirty(word: u64) -> bool {
    word & DIRTY_BIT != 0
}

#[inline(always)]
fn desc_ptr_of(word: u64) -> *const Descriptor {
    (word & PTR_MASK) as *const Descriptor
}

/// Helps (or, if called by the owner, drives) `desc` to a decision and finalizes every word it
/// touches. Idempotent: safe to call from any number of threads concurrently or repeatedly.
fn complete(desc: *const Descriptor) -> bool {
    let d = unsafe {
        // SAFETY: every tagged pointer installed into a target word points at a live `Descriptor`
        // until the last word referencing it is finalized and the descriptor is epoch-deferred;
        // this function only runs while such a tag is still observable in at least one word.
        &*desc
    };
    // Try to decide: Undecided -> Succeeded. If that fails, someone already decided (either
    // direction); if it failed because a word mismatched we flip to Failed instead.
    let status = d.status.load(Ordering::Acquire);
    if status == ST_UNDECIDED {
        // Only a thread that has already installed all of its own words into this descriptor
        // calls complete() as the "owner"; helpers that observe a dirty word belonging to
        // someone else's in-flight descriptor also land here, but by construction every word in
        // `d.words` was already successfully swapped to the dirty tag before the descriptor could
        // be observed by anyone, so undecided here always means "succeeded so far".
        let _ = d
            .status
            .compare_exchange(ST_UNDECIDED, ST_SUCCEEDED, Ordering::AcqRel, Ordering::Acquire);
    }
    let succeeded = d.status.load(Ordering::Acquire) == ST_SUCCEEDED;
    let tagged = (desc as u64) | DIRTY_BIT;
    for w in d.words.as_slice() {
        let target = unsafe {
            // SAFETY: see `WordEntry::new`.
            &*w.address
        };
        let final_val = if succeeded { w.desired } else { w.expected };
        // best-effort: if another helper already finalized this word, the CAS simply fails and
        // we move on; the outcome is the same either way.
        let _ = target.compare_exchange(tagged, final_val, Ordering::AcqRel, Ordering::Acquire);
    }
    succeeded
}

/// Reads a word that may be a PMwCAS target, helping any in-flight descriptor to a decision first
/// so the caller never observes a transient "dirty" tag in place of a logical value. Every read of
/// a status word, metadata entry, or inner-node child slot outside of an install loop goes through
/// this function rather than a bare atomic load.
pub fn read(address: *const AtomicU64) -> u64 {
    loop {
        let cur = unsafe {
            // SAFETY: see `WordEntry::new` — callers keep the referent alive via epoch protection.
            &*address
        }
        .load(Ordering::Acquire);
        if is_dirty(cur) {
            complete(desc_ptr_of(cur));
            continue;
        }
        return cur;
    }
}

/// Attempts to atomically update every word in `entries` from its `expected` value to its
/// `desired` value. Either all addresses change or none do. Returns whether the operation
/// succeeded.
///
/// Entries are installed in address order to bound the number of descriptors any two contending
/// PMwCAS operations can deadlock-free between each other (the classic lowest-address-first
/// lock-free convention).
pub fn commit(mut entries: Vec<WordEntry>) -> bool {
    debug_assert!(!entries.is_empty());
    debug_assert!(entries.len() <= MAX_WORDS);
    entries.sort_by_key(|e| e.address as usize);

    let desc = Box::into_raw(Box::new(Descriptor {
        status: AtomicU8::new(ST_UNDECIDED),
        words: entries.iter().copied().collect(),
    }));
    let tagged = (desc as u64) | DIRTY_BIT;

    let mut installed = 0usize;
    let mut mismatched = false;
    let backoff = Backoff::new();
    'install: for w in unsafe { &*desc }.words.as_slice() {
        loop {
            let cur = unsafe { &*w.address }.load(Ordering::Acquire);
            if cur == w.expected {
                match unsafe { &*w.address }.compare_exchange(
                    cur,
                    tagged,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        installed += 1;
                        continue 'install;
                    }
                    Err(_) => {
                        backoff.snooze();
                        continue;
                    }
                }
            } else if is_dirty(cur) {
                // another PMwCAS is mid-flight on this exact word; help it finish, then re-read
                let other = desc_ptr_of(cur);
                if other != desc {
                    complete(other);
                }
                backoff.snooze();
                continue;
            } else {
                mismatched = true;
                break 'install;
            }
        }
    }

    let final_status = if mismatched {
        unsafe { &*desc }
            .status
            .store(ST_FAILED, Ordering::Release);
        false
    } else {
        complete(desc)
    };

    // finalize whichever words we did manage to install (complete() above only finalizes the
    // full word list of a descriptor once its status is decided; if we bailed early due to a
    // mismatch, the words we *did* install still need unwinding back to `expected`).
    if mismatched {
        for w in unsafe { &*desc }.words.as_slice().iter().take(installed) {
            let target = unsafe { &*w.address };
            let _ = target.compare_exchange(tagged, w.expected, Ordering::AcqRel, Ordering::Acquire);
        }
    }

    // The descriptor can only be reclaimed once no target word still carries its tag; the loop
    // above (via `complete`) guarantees that every installed word has already been finalized away
    // from `tagged` by the time we get here, except in the mismatched-bailout path we just handled
    // by hand above. Reclaim it after a grace period so a concurrent helper that is mid-`complete`
    // (read the tag, about to dereference it) still sees valid memory.
    let guard = crossbeam_epoch::pin();
    unsafe {
        guard.defer_unchecked(move || drop(Box::from_raw(desc)));
    }

    final_status
}

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

//! C3: the epoch/garbage manager. No reclamation engine is written from scratch here; this wraps
//! `crossbeam_epoch` the same way the rest of this crate wraps its collaborators.
//!
//! Nodes (`ChildNode`, `TreeMetadata`) are reached through raw pointers installed by PMwCAS rather
//! than through `crossbeam_epoch::Atomic<T>` slots — PMwCAS already owns the install/publish
//! protocol for those words (`pmwcas.rs`), so this module only needs the pinning and deferred-drop
//! half of `crossbeam_epoch`, the same split `pmwcas::commit` already uses for its own descriptors.

pub use crossbeam_epoch::Guard;

use super::{node::ChildNode, root::TreeMetadata};

/// Enter a protected section. Reentrant-safe per thread (`crossbeam_epoch::pin` pins the calling
/// thread's local epoch and may be called repeatedly without deadlocking).
#[inline(always)]
pub fn protect() -> Guard {
    crossbeam_epoch::pin()
}

/// Defers destruction of a child node (and everything it owns) until every guard pinned at or
/// before the current epoch has unprotected.
///
/// # Safety
/// `ptr` must have come from [`super::node::alloc_child`] and must no longer be reachable from any
/// live root, parent child slot, or in-flight PMwCAS descriptor by the time every currently live
/// guard unprotects.
pub unsafe fn retire_child(ptr: *const ChildNode, guard: &Guard) {
    let ptr = ptr as *mut ChildNode;
    guard.defer_unchecked(move || drop(Box::from_raw(ptr)));
}

/// Defers destruction of a superseded `TreeMetadata` object, mirroring [`retire_child`].
///
/// # Safety
/// `ptr` must have come from [`super::root::RootDescriptor::swap`] (or the descriptor's initial
/// allocation) and must no longer be the descriptor's published pointer.
pub unsafe fn retire_metadata(ptr: *const TreeMetadata, guard: &Guard) {
    let ptr = ptr as *mut TreeMetadata;
    guard.defer_unchecked(move || drop(Box::from_raw(ptr)));
}

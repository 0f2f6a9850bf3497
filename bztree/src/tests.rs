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

//! Top-level end-to-end scenario suite (literal scenarios A-F) plus single-threaded property
//! tests and concurrent property tests over real OS threads, colocated the way the teacher places
//! its own top-level `tests.rs` modules (see e.g. `harness/src/tests.rs`) rather than under a
//! separate `tests/` integration directory, since this crate has no CLI/bundle surface to drive
//! externally.

use {
    crate::BzTree,
    rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng},
    std::collections::HashMap,
};

fn kid(n: u32) -> String {
    format!("k{n:06}")
}

fn vid(n: u32) -> String {
    format!("v{n:06}")
}

/// Scenario A: empty tree.
#[test]
fn scenario_a_empty_tree() {
    let tree = BzTree::new();
    assert_eq!(tree.lookup(b"abcd"), None);
}

/// Scenario B: single pair.
#[test]
fn scenario_b_single_pair() {
    let tree = BzTree::new();
    assert!(tree.insert(b"key", b"value"));
    assert_eq!(tree.lookup(b"key"), Some(b"value".to_vec()));
    assert_eq!(tree.lookup(b"missing"), None);
}

/// Scenario C: fill one leaf, checking every intermediate lookup along the way.
#[test]
fn scenario_c_fill_one_leaf() {
    let tree = BzTree::new();
    for i in 0..8u32 {
        let (k, v) = (kid(i), vid(i));
        assert!(tree.insert(k.as_bytes(), v.as_bytes()));
        assert_eq!(tree.lookup(k.as_bytes()), Some(v.into_bytes()));
    }
    for i in 0..8u32 {
        assert_eq!(tree.lookup(kid(i).as_bytes()), Some(vid(i).into_bytes()));
    }
}

/// Scenario D: compact-by-churn. The churned keys must all be absent afterward and the tree must
/// have compacted at least once (otherwise the churn would have exhausted the one leaf's space
/// and later inserts in the loop would have failed).
#[test]
fn scenario_d_compact_by_churn() {
    let tree = BzTree::new();
    assert!(tree.insert(b"always kept", b"safe and sound"));
    for i in 0..24u32 {
        let (k, v) = (kid(i), vid(i));
        assert!(tree.insert(k.as_bytes(), v.as_bytes()), "churn insert {i} failed");
        assert!(tree.erase(k.as_bytes()));
    }
    assert_eq!(
        tree.lookup(b"always kept"),
        Some(b"safe and sound".to_vec())
    );
    for i in 0..24u32 {
        assert_eq!(tree.lookup(kid(i).as_bytes()), None);
    }
    assert!(tree.height() >= 1);
}

/// Scenario E: multi-level split.
#[test]
fn scenario_e_multi_level_split() {
    let tree = BzTree::new();
    for i in 0..80u32 {
        let (k, v) = (kid(i), vid(i));
        assert!(tree.insert(k.as_bytes(), v.as_bytes()));
    }
    assert!(tree.height() >= 2);
    for i in 0..80u32 {
        assert_eq!(tree.lookup(kid(i).as_bytes()), Some(vid(i).into_bytes()));
    }
    assert!(tree.debug_validate());
}

/// Scenario F: random non-repeating insert order, fixed seed for reproducibility.
#[test]
fn scenario_f_random_non_repeating() {
    let mut keys: Vec<u32> = (80..160).collect();
    let mut rng = StdRng::seed_from_u64(0xB7_7EE5);
    keys.shuffle(&mut rng);

    let tree = BzTree::new();
    for &key in &keys {
        assert!(tree.insert(kid(key).as_bytes(), vid(2 * key).as_bytes()));
    }
    for &key in &keys {
        assert_eq!(
            tree.lookup(kid(key).as_bytes()),
            Some(vid(2 * key).into_bytes())
        );
    }
    assert!(tree.debug_validate());
    let mut scan = tree.bulk_scan();
    scan.sort();
    scan.dedup();
    assert_eq!(scan.len(), keys.len());
}

/// Property 1+5: a randomized single-threaded sequence of insert/update/erase stays consistent
/// with a `HashMap` oracle, and a bulk scan never repeats a key.
#[test]
fn property_random_ops_match_oracle() {
    let tree = BzTree::new();
    let mut oracle: HashMap<String, String> = HashMap::new();
    let mut rng = StdRng::seed_from_u64(0x51_0E57);

    for step in 0..3000u32 {
        let key = format!("k{:04}", rng.gen_range(0..400));
        let value = format!("v{step}-{}", rng.gen_range(0..1_000_000));
        match rng.gen_range(0..3) {
            0 => {
                let got = tree.insert(key.as_bytes(), value.as_bytes());
                let expected = !oracle.contains_key(&key);
                assert_eq!(got, expected, "insert({key}) at step {step}");
                if got {
                    oracle.insert(key.clone(), value);
                }
            }
            1 => {
                let got = tree.update(key.as_bytes(), value.as_bytes());
                let expected = oracle.contains_key(&key);
                assert_eq!(got, expected, "update({key}) at step {step}");
                if got {
                    oracle.insert(key.clone(), value);
                }
            }
            _ => {
                let got = tree.erase(key.as_bytes());
                let expected = oracle.remove(&key).is_some();
                assert_eq!(got, expected, "erase({key}) at step {step}");
            }
        }
        assert_eq!(
            tree.lookup(key.as_bytes()),
            oracle.get(&key).map(|v| v.clone().into_bytes()),
            "lookup({key}) diverged from oracle at step {step}"
        );
    }

    for (k, v) in &oracle {
        assert_eq!(tree.lookup(k.as_bytes()), Some(v.clone().into_bytes()));
    }
    let mut scan = tree.bulk_scan();
    scan.sort();
    let mut expected: Vec<String> = oracle.keys().cloned().collect();
    expected.sort();
    assert_eq!(scan, expected.into_iter().map(String::into_bytes).collect::<Vec<_>>());
}

/// Property 2+3+4: after every mutation, the whole tree still satisfies its node invariants, and
/// height never jumps by more than one step per operation.
#[test]
fn property_invariants_and_bounded_height_changes() {
    let tree = BzTree::new();
    let mut rng = StdRng::seed_from_u64(0x1A_7A_11);
    let mut prev_height = tree.height();
    for i in 0..1500u32 {
        let key = format!("k{:04}", rng.gen_range(0..600));
        if rng.gen_bool(0.7) {
            tree.insert(key.as_bytes(), format!("v{i}").as_bytes());
        } else {
            tree.erase(key.as_bytes());
        }
        let h = tree.height();
        assert!(
            h.abs_diff(prev_height) <= 1,
            "height jumped from {prev_height} to {h} in one operation"
        );
        prev_height = h;
        assert!(tree.debug_validate(), "invariant violated after op {i}");
    }
}

/// Property 6+7: N threads insert disjoint key ranges concurrently; every insert that returns
/// `true` must be independently observable afterward, and no lookup ever returns a torn/foreign
/// value (each thread's values are tagged with its own thread index, so a torn read would show up
/// as a value belonging to the wrong thread or failing to parse).
#[test]
fn concurrent_disjoint_inserts_are_linearizable() {
    const THREADS: u32 = 8;
    const PER_THREAD: u32 = 200;
    let tree = BzTree::new();

    std::thread::scope(|scope| {
        for t in 0..THREADS {
            let tree = &tree;
            scope.spawn(move || {
                for i in 0..PER_THREAD {
                    let key = format!("t{t:02}k{i:05}");
                    let value = format!("t{t:02}v{i:05}");
                    assert!(tree.insert(key.as_bytes(), value.as_bytes()));
                }
            });
        }
    });

    for t in 0..THREADS {
        for i in 0..PER_THREAD {
            let key = format!("t{t:02}k{i:05}");
            let expected = format!("t{t:02}v{i:05}");
            assert_eq!(tree.lookup(key.as_bytes()), Some(expected.into_bytes()));
        }
    }
    assert!(tree.debug_validate());
    assert_eq!(tree.bulk_scan().len() as u32, THREADS * PER_THREAD);
}

/// Property 8: bounded adversarial interleaving (many threads hammering a small, overlapping key
/// space so SMOs and leaf-protocol races are near-guaranteed) completes without deadlock or panic,
/// and the tree is left in a structurally valid state.
#[test]
fn concurrent_contended_ops_make_progress_without_deadlock() {
    const THREADS: u32 = 8;
    const OPS_PER_THREAD: u32 = 400;
    let tree = BzTree::new();

    std::thread::scope(|scope| {
        for t in 0..THREADS {
            let tree = &tree;
            scope.spawn(move || {
                let mut rng = StdRng::seed_from_u64(0xC0FFEE ^ t as u64);
                for i in 0..OPS_PER_THREAD {
                    let key = format!("shared{:03}", rng.gen_range(0..64));
                    match rng.gen_range(0..3) {
                        0 => {
                            let _ = tree.insert(key.as_bytes(), format!("t{t}-{i}").as_bytes());
                        }
                        1 => {
                            let _ = tree.update(key.as_bytes(), format!("t{t}-{i}-u").as_bytes());
                        }
                        _ => {
                            let _ = tree.erase(key.as_bytes());
                        }
                    }
                }
            });
        }
    });

    assert!(tree.debug_validate());
}

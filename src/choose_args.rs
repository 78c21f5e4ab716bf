//! Choose-args: named, per-bucket overrides of item weights and ids,
//! applied at `map()` time without mutating the underlying `CrushMap`.
//!
//! Grounded on `parse_choose_args_bucket_ids` /
//! `parse_choose_args_bucket_weight_set` in
//! `original_source/crush/libcrush/libcrush.c`, which attach each
//! override to a bucket id within a named choose-args set, carrying one
//! weight row per placement position (so replica 0 can draw against a
//! different weight than replica 1 for the same bucket) and an optional
//! positional id remap.

use std::collections::HashMap;

use crate::error::{CrushError, Result};
use crate::types::CrushMap;

/// Override attached to one bucket within a choose-args set.
#[derive(Debug, Clone, Default)]
pub struct ChooseArgBucket {
    /// `weight_set[position]` is the weight vector to use for that
    /// placement position (outer index), one entry per bucket item
    /// (inner index). Empty means "no weight override at this position".
    pub weight_set: Vec<Vec<u32>>,
    /// Positional id remap, same length as the bucket's item list.
    pub ids: Option<Vec<i32>>,
}

/// One named override set, covering zero or more buckets.
#[derive(Debug, Clone, Default)]
pub struct ChooseArgs {
    /// Keyed by bucket id (always negative).
    pub buckets: HashMap<i32, ChooseArgBucket>,
}

impl ChooseArgs {
    pub fn get(&self, bucket_id: i32) -> Option<&ChooseArgBucket> {
        self.buckets.get(&bucket_id)
    }
}

/// All choose-args sets attached to a map, keyed by the set's id.
#[derive(Debug, Clone, Default)]
pub struct ChooseArgsMap {
    pub sets: HashMap<i32, ChooseArgs>,
}

impl ChooseArgsMap {
    pub fn get(&self, choose_args_id: i32) -> Result<&ChooseArgs> {
        self.sets
            .get(&choose_args_id)
            .ok_or_else(|| CrushError::not_found(format!("choose_args id {choose_args_id}")))
    }
}

/// Validate that every bucket referenced by a choose-args set exists in
/// `map`, and that each override's `weight_set`/`ids` length matches the
/// bucket's item count.
pub fn validate(map: &CrushMap, choose_args: &ChooseArgsMap) -> Result<()> {
    for set in choose_args.sets.values() {
        for (&bucket_id, over) in &set.buckets {
            let bucket = map.get_bucket(bucket_id)?;
            for (position, row) in over.weight_set.iter().enumerate() {
                if !row.is_empty() && row.len() != bucket.items.len() {
                    return Err(CrushError::invariant(format!(
                        "choose_args weight_set for bucket {bucket_id} position {position} has {} entries, bucket has {}",
                        row.len(),
                        bucket.items.len()
                    )));
                }
            }
            if let Some(ids) = &over.ids {
                if ids.len() != bucket.items.len() {
                    return Err(CrushError::invariant(format!(
                        "choose_args ids for bucket {bucket_id} has {} entries, bucket has {}",
                        ids.len(),
                        bucket.items.len()
                    )));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BucketAlgorithm, BucketData, CrushBucket};

    fn map_with_bucket() -> CrushMap {
        let mut map = CrushMap::new();
        map.buckets = vec![Some(CrushBucket {
            id: -1,
            bucket_type: 1,
            alg: BucketAlgorithm::Straw2,
            hash: 0,
            weight: 0x20000,
            has_bucket_weights: false,
            size: 2,
            items: vec![0, 1],
            data: BucketData::Straw2 {
                item_weights: vec![0x10000, 0x10000],
            },
        })];
        map
    }

    #[test]
    fn validate_rejects_mismatched_weight_set_length() {
        let map = map_with_bucket();
        let mut choose_args = ChooseArgsMap::default();
        let mut set = ChooseArgs::default();
        set.buckets.insert(
            -1,
            ChooseArgBucket {
                weight_set: vec![vec![0x10000]],
                ids: None,
            },
        );
        choose_args.sets.insert(0, set);
        assert!(validate(&map, &choose_args).is_err());
    }

    #[test]
    fn validate_accepts_matching_override() {
        let map = map_with_bucket();
        let mut choose_args = ChooseArgsMap::default();
        let mut set = ChooseArgs::default();
        set.buckets.insert(
            -1,
            ChooseArgBucket {
                weight_set: vec![vec![0x8000, 0x18000]],
                ids: None,
            },
        );
        choose_args.sets.insert(0, set);
        assert!(validate(&map, &choose_args).is_ok());
    }
}

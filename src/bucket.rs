//! Weighted item selection within a single bucket.
//!
//! Four algorithms, matching the four `BucketAlgorithm` variants. Each
//! accepts an optional choose-args override (`Override`) supplying a
//! per-position weight row and/or a positional id remap, applied without
//! touching the underlying `CrushBucket`.

use crate::hash::{crush_hash32_3, crush_hash32_4};
use crate::ln_fixed::ln_of_hash_draw;
use crate::types::{BucketAlgorithm, BucketData, CrushBucket};

/// Choose-args override applied for one placement position.
#[derive(Debug, Clone, Copy, Default)]
pub struct Override<'a> {
    /// Per-item weight row for the current replica position, same
    /// length as the bucket's item list.
    pub weights: Option<&'a [u32]>,
    /// Positional id remap, same length as the bucket's item list.
    pub ids: Option<&'a [i32]>,
}

impl<'a> Override<'a> {
    fn items<'b>(&self, bucket: &'b CrushBucket) -> &'b [i32]
    where
        'a: 'b,
    {
        self.ids.unwrap_or(&bucket.items)
    }
}

/// Per-bucket scratch state for the uniform algorithm's incremental
/// permutation, reused across `map()` calls within a workspace so no
/// allocation happens once the workspace is built.
#[derive(Debug, Clone, Default)]
pub struct PermState {
    perm: Vec<i32>,
    perm_x: Option<u32>,
    perm_n: u32,
}

impl PermState {
    pub fn for_bucket(bucket: &CrushBucket) -> Self {
        PermState {
            perm: bucket.items.clone(),
            perm_x: None,
            perm_n: 0,
        }
    }
}

/// Select an item from a bucket using its configured algorithm.
/// `perm` supplies uniform-bucket scratch state and is unused by the
/// other three algorithms.
pub fn bucket_choose(
    bucket: &CrushBucket,
    x: u32,
    r: u32,
    perm: &mut PermState,
    over: Option<Override>,
) -> Option<i32> {
    if bucket.size == 0 {
        return None;
    }
    match bucket.alg {
        BucketAlgorithm::Straw2 => bucket_straw2_choose(bucket, x, r, over),
        BucketAlgorithm::Uniform => bucket_uniform_choose(bucket, x, r, perm, over),
        BucketAlgorithm::List => bucket_list_choose(bucket, x, r, over),
        BucketAlgorithm::Straw => bucket_straw_choose(bucket, x, r, over),
    }
}

fn generate_exponential_draw(x: u32, item_id: i32, r: u32, weight: u32) -> i64 {
    if weight == 0 {
        return i64::MIN;
    }
    let hash = crush_hash32_3(x, item_id as u32, r);
    let u = ((hash & 0xffff) | 1) as u16;
    let ln_u = ln_of_hash_draw(u); // <= 0
    ln_u / i64::from(weight)
}

fn bucket_straw2_choose(bucket: &CrushBucket, x: u32, r: u32, over: Option<Override>) -> Option<i32> {
    let base_weights = match &bucket.data {
        BucketData::Straw2 { item_weights } => item_weights.as_slice(),
        _ => return None,
    };
    let weights = over.and_then(|o| o.weights).unwrap_or(base_weights);
    let items = over.map(|o| o.items(bucket)).unwrap_or(&bucket.items);

    let n = bucket.size as usize;
    let mut high = 0usize;
    let mut high_draw = i64::MIN;
    for i in 0..n {
        let draw = generate_exponential_draw(x, items[i], r, weights[i]);
        if i == 0 || draw > high_draw {
            high = i;
            high_draw = draw;
        }
    }
    Some(items[high])
}

/// Incremental Fisher-Yates permutation: on the first draw for a given
/// `x`, `perm` starts as the identity over the bucket's items; each call
/// advances the permutation lazily up to the requested rank `r`, so a
/// full `O(n)` shuffle is only ever paid once per `(bucket, x)` pair no
/// matter how many ranks are drawn from it.
fn bucket_uniform_choose(
    bucket: &CrushBucket,
    x: u32,
    r: u32,
    perm: &mut PermState,
    over: Option<Override>,
) -> Option<i32> {
    let n = bucket.size as usize;
    if n == 0 {
        return None;
    }
    let items = over.map(|o| o.items(bucket)).unwrap_or(&bucket.items);

    if perm.perm_x != Some(x) || perm.perm.len() != n {
        perm.perm.clear();
        perm.perm.extend_from_slice(&items[..n]);
        perm.perm_x = Some(x);
        perm.perm_n = 0;
    }

    let pr = (r as usize) % n;
    while (perm.perm_n as usize) <= pr {
        let p = perm.perm_n as usize;
        if p < n - 1 {
            let i = (crush_hash32_3(x, bucket.id as u32, p as u32) as usize) % (n - p);
            if i != 0 {
                perm.perm.swap(p, p + i);
            }
        }
        perm.perm_n += 1;
    }
    Some(perm.perm[pr])
}

fn bucket_list_choose(bucket: &CrushBucket, x: u32, r: u32, over: Option<Override>) -> Option<i32> {
    let (item_weights, sum_weights) = match &bucket.data {
        BucketData::List {
            item_weights,
            sum_weights,
        } => (item_weights, sum_weights),
        _ => return None,
    };
    let items = over.map(|o| o.items(bucket)).unwrap_or(&bucket.items);
    let override_weights = over.and_then(|o| o.weights);

    let n = bucket.size as usize;
    for i in (0..n).rev() {
        let (w, sum): (u64, u64) = if let Some(ov) = override_weights {
            let sum = ov[..=i].iter().map(|&w| u64::from(w)).sum();
            (u64::from(ov[i]), sum)
        } else {
            (u64::from(item_weights[i]), u64::from(sum_weights[i]))
        };

        let mut draw = u64::from(crush_hash32_4(x, items[i] as u32, r, bucket.id as u32));
        draw &= 0xffff;
        draw = draw.wrapping_mul(sum);
        draw >>= 16;

        if draw < w {
            return Some(items[i]);
        }
    }
    Some(items[0])
}

fn bucket_straw_choose(bucket: &CrushBucket, x: u32, r: u32, over: Option<Override>) -> Option<i32> {
    let straws = match &bucket.data {
        BucketData::Straw { straws, .. } => straws.as_slice(),
        _ => return None,
    };
    let items = over.map(|o| o.items(bucket)).unwrap_or(&bucket.items);
    let override_weights = over.and_then(|o| o.weights);

    let n = bucket.size as usize;
    let mut high = 0usize;
    let mut high_draw = 0u64;
    for i in 0..n {
        let straw = override_weights
            .map(|w| u64::from(w[i]))
            .unwrap_or(u64::from(straws[i]));
        let mut draw = u64::from(crush_hash32_3(x, items[i] as u32, r));
        draw &= 0xffff;
        draw = draw.wrapping_mul(straw);
        if i == 0 || draw > high_draw {
            high = i;
            high_draw = draw;
        }
    }
    Some(items[high])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BucketAlgorithm, BucketData, CrushBucket};

    fn straw2_bucket() -> CrushBucket {
        CrushBucket {
            id: -1,
            bucket_type: 1,
            alg: BucketAlgorithm::Straw2,
            hash: 0,
            weight: 0x30000,
            has_bucket_weights: false,
            size: 3,
            items: vec![0, 1, 2],
            data: BucketData::Straw2 {
                item_weights: vec![0x10000, 0x10000, 0x10000],
            },
        }
    }

    #[test]
    fn straw2_is_deterministic() {
        let bucket = straw2_bucket();
        let mut perm = PermState::for_bucket(&bucket);
        let a = bucket_choose(&bucket, 123, 0, &mut perm, None);
        let b = bucket_choose(&bucket, 123, 0, &mut perm, None);
        assert_eq!(a, b);
        assert!(matches!(a, Some(0..=2)));
    }

    #[test]
    fn straw2_zero_weight_item_never_chosen() {
        let mut bucket = straw2_bucket();
        bucket.data = BucketData::Straw2 {
            item_weights: vec![0, 0x10000, 0x10000],
        };
        let mut perm = PermState::for_bucket(&bucket);
        for x in 0..200 {
            let choice = bucket_choose(&bucket, x, 0, &mut perm, None);
            assert_ne!(choice, Some(0));
        }
    }

    #[test]
    fn uniform_choose_stays_within_bucket() {
        let bucket = CrushBucket {
            id: -2,
            bucket_type: 1,
            alg: BucketAlgorithm::Uniform,
            hash: 0,
            weight: 0x30000,
            has_bucket_weights: false,
            size: 3,
            items: vec![10, 11, 12],
            data: BucketData::Uniform {
                item_weight: 0x10000,
            },
        };
        let mut perm = PermState::for_bucket(&bucket);
        for r in 0..10 {
            let item = bucket_choose(&bucket, 42, r, &mut perm, None).unwrap();
            assert!(bucket.items.contains(&item));
        }
    }

    #[test]
    fn uniform_permutation_is_injective_over_full_range() {
        let bucket = CrushBucket {
            id: -3,
            bucket_type: 1,
            alg: BucketAlgorithm::Uniform,
            hash: 0,
            weight: 0x40000,
            has_bucket_weights: false,
            size: 4,
            items: vec![0, 1, 2, 3],
            data: BucketData::Uniform {
                item_weight: 0x10000,
            },
        };
        let mut perm = PermState::for_bucket(&bucket);
        let mut seen = std::collections::HashSet::new();
        for r in 0..4 {
            seen.insert(bucket_choose(&bucket, 7, r, &mut perm, None).unwrap());
        }
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn choose_args_weight_override_changes_selection_distribution() {
        let bucket = straw2_bucket();
        let mut perm = PermState::for_bucket(&bucket);
        let heavy = [0x10000u32, 0x10000, 0x200000];
        let over = Override {
            weights: Some(&heavy),
            ids: None,
        };
        let mut counts = [0u32; 3];
        for x in 0..300 {
            if let Some(item) = bucket_choose(&bucket, x, 0, &mut perm, Some(over)) {
                counts[item as usize] += 1;
            }
        }
        assert!(counts[2] > counts[0] + counts[1]);
    }

    #[test]
    fn list_choose_respects_weight_zero() {
        let bucket = CrushBucket {
            id: -4,
            bucket_type: 1,
            alg: BucketAlgorithm::List,
            hash: 0,
            weight: 0x10000,
            has_bucket_weights: false,
            size: 2,
            items: vec![0, 1],
            data: BucketData::List {
                item_weights: vec![0, 0x10000],
                sum_weights: vec![0, 0x10000],
            },
        };
        for x in 0..100 {
            let item = bucket_list_choose(&bucket, x, 0, None);
            assert_eq!(item, Some(1));
        }
    }
}

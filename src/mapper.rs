//! Rule execution engine: the bytecode VM that walks a `CrushRule`'s
//! steps and, for each `CHOOSE*` step, descends the bucket hierarchy
//! picking weighted items.
//!
//! The retry/descent structure (total tries, local tries, local
//! fallback tries, `vary_r`, `stable`) follows the tiered-retry design
//! Ceph's own mapper uses to trade determinism for placement quality
//! under failure, though the exact tier boundaries here are a
//! documented simplification rather than a line-for-line port (the
//! original C mapper was not available to consult; see DESIGN.md).

use crate::bucket::{bucket_choose, Override, PermState};
use crate::choose_args::ChooseArgs;
use crate::error::{CrushError, Result};
use crate::hash::crush_hash32_2;
use crate::types::{CrushMap, RuleOp};

/// Sentinel written into `indep`-mode output slots that could not be
/// filled, preserving positional stability. Matches Ceph's
/// `CRUSH_ITEM_NONE`.
pub const CRUSH_ITEM_NONE: i32 = 0x7fff_ffff;

const MAX_DESCENT_STEPS: u32 = 100;

/// Caller-owned scratch space reused across `map()` calls so placement
/// never allocates: one permutation state per bucket slot plus two
/// general-purpose item buffers.
pub struct Workspace {
    perm_states: Vec<PermState>,
    work: Vec<i32>,
    scratch: Vec<i32>,
}

impl Workspace {
    pub fn new(map: &CrushMap) -> Self {
        let perm_states = map
            .buckets
            .iter()
            .map(|b| match b {
                Some(bucket) => PermState::for_bucket(bucket),
                None => PermState::default(),
            })
            .collect();
        Workspace {
            perm_states,
            work: Vec::with_capacity(map.max_devices.max(0) as usize),
            scratch: Vec::with_capacity(map.max_devices.max(0) as usize),
        }
    }

    fn perm_state_mut(&mut self, bucket_id: i32) -> &mut PermState {
        let index = (-1 - bucket_id) as usize;
        &mut self.perm_states[index]
    }
}

fn is_out(weight: &[u32], item: i32, x: u32) -> bool {
    if item < 0 || item as usize >= weight.len() {
        return true;
    }
    let w = weight[item as usize];
    if w >= 0x10000 {
        return false;
    }
    if w == 0 {
        return true;
    }
    let hash = crush_hash32_2(x, item as u32);
    (hash & 0xffff) >= w
}

fn choose_args_override<'a>(
    choose_args: Option<&'a ChooseArgs>,
    bucket_id: i32,
    position: usize,
) -> Option<Override<'a>> {
    let over = choose_args?.get(bucket_id)?;
    let weights = over
        .weight_set
        .get(position)
        .or_else(|| over.weight_set.last())
        .map(Vec::as_slice)
        .filter(|w| !w.is_empty());
    let ids = over.ids.as_deref();
    if weights.is_none() && ids.is_none() {
        return None;
    }
    Some(Override { weights, ids })
}

/// Execute `rule_id` against `map`, writing up to `result_max` selected
/// device ids into `result`. `weights` gives the in/out status of every
/// device (16.16 fixed point, `0x10000` == fully in).
#[allow(clippy::too_many_arguments)]
pub fn crush_do_rule(
    map: &CrushMap,
    rule_id: u32,
    x: u32,
    result: &mut Vec<i32>,
    result_max: usize,
    weights: &[u32],
    workspace: &mut Workspace,
    choose_args: Option<&ChooseArgs>,
) -> Result<()> {
    let rule = map.get_rule(rule_id)?;
    result.clear();

    workspace.work.clear();
    workspace.scratch.clear();
    // Two buffers living inside `workspace` are swapped by value below;
    // to keep the borrow checker happy we move them out and back in.
    let mut work: Vec<i32> = std::mem::take(&mut workspace.work);
    let mut scratch: Vec<i32> = std::mem::take(&mut workspace.scratch);

    let mut total_tries = map.tunables.choose_total_tries;
    let mut local_tries = map.tunables.choose_local_tries;
    let mut local_fallback_tries = map.tunables.choose_local_fallback_tries;
    let mut vary_r = map.tunables.chooseleaf_vary_r;
    let mut stable = map.tunables.chooseleaf_stable;

    for step in &rule.steps {
        match step.op {
            RuleOp::Take => {
                work.clear();
                work.push(step.arg1);
            }

            RuleOp::ChooseFirstN | RuleOp::ChooseIndep => {
                scratch.clear();
                let numrep = resolve_numrep(step.arg1, result_max);
                let item_type = step.arg2;
                let indep = step.op == RuleOp::ChooseIndep;
                for &item in &work {
                    crush_choose(
                        map,
                        workspace,
                        item,
                        x,
                        numrep,
                        item_type,
                        &mut scratch,
                        weights,
                        total_tries,
                        local_tries,
                        local_fallback_tries,
                        false,
                        vary_r,
                        stable,
                        indep,
                        choose_args,
                    )?;
                }
                work.clone_from(&scratch);
            }

            RuleOp::ChooseLeafFirstN | RuleOp::ChooseLeafIndep => {
                scratch.clear();
                let numrep = resolve_numrep(step.arg1, result_max);
                let item_type = step.arg2;
                let indep = step.op == RuleOp::ChooseLeafIndep;
                for &item in &work {
                    crush_choose(
                        map,
                        workspace,
                        item,
                        x,
                        numrep,
                        item_type,
                        &mut scratch,
                        weights,
                        total_tries,
                        local_tries,
                        local_fallback_tries,
                        true,
                        vary_r,
                        stable,
                        indep,
                        choose_args,
                    )?;
                }
                work.clone_from(&scratch);
            }

            RuleOp::Emit => {
                for &item in &work {
                    if result.len() < result_max {
                        result.push(item);
                    }
                }
                work.clear();
            }

            RuleOp::SetChooseTries => total_tries = step.arg1 as u32,
            RuleOp::SetChooseLeafTries => total_tries = step.arg1 as u32,
            RuleOp::SetChooseLocalTries => local_tries = step.arg1 as u32,
            RuleOp::SetChooseLocalFallbackTries => local_fallback_tries = step.arg1 as u32,
            RuleOp::SetChooseLeafVaryR => vary_r = step.arg1 as u8,
            RuleOp::SetChooseLeafStable => stable = step.arg1 as u8,
            RuleOp::Noop => {}
        }
    }

    workspace.work = work;
    workspace.scratch = scratch;

    if result.is_empty() && result_max > 0 {
        return Err(CrushError::unmappable(format!(
            "rule {rule_id} produced no items for x={x}"
        )));
    }

    Ok(())
}

fn resolve_numrep(arg1: i32, result_max: usize) -> usize {
    if arg1 == 0 {
        result_max
    } else if arg1 > 0 {
        arg1 as usize
    } else {
        (result_max as i32 + arg1).max(0) as usize
    }
}

/// A single, non-retrying attempt to resolve `bucket_id` down to either
/// an item of `item_type` (when `recurse_to_leaf` is false) or a device
/// (when true), using rank `r`. Returns `Ok(None)` for any rejection
/// (collision, out-of-service device, or a descent that couldn't find
/// the requested type) rather than an error — rejections are expected
/// and handled by the caller's retry loop.
#[allow(clippy::too_many_arguments)]
fn attempt(
    map: &CrushMap,
    workspace: &mut Workspace,
    bucket_id: i32,
    x: u32,
    r: u32,
    item_type: i32,
    recurse_to_leaf: bool,
    out: &[i32],
    weights: &[u32],
    position: usize,
    choose_args: Option<&ChooseArgs>,
) -> Result<Option<i32>> {
    if bucket_id >= 0 {
        return Ok(if item_type == 0 && !is_out(weights, bucket_id, x) {
            Some(bucket_id)
        } else {
            None
        });
    }

    let mut current = bucket_id;
    for _ in 0..MAX_DESCENT_STEPS {
        let bucket = map.get_bucket(current)?;
        let over = choose_args_override(choose_args, current, position);
        let perm = workspace.perm_state_mut(current);
        let item = match bucket_choose(bucket, x, r, perm, over) {
            Some(item) => item,
            None => return Ok(None),
        };

        if item >= 0 {
            if item_type != 0 {
                return Ok(None);
            }
            if out.contains(&item) || is_out(weights, item, x) {
                return Ok(None);
            }
            return Ok(Some(item));
        }

        let child = map.get_bucket(item)?;
        if child.bucket_type == item_type {
            if recurse_to_leaf {
                return resolve_leaf(map, workspace, item, x, r, out, weights, choose_args);
            }
            if out.contains(&item) {
                return Ok(None);
            }
            return Ok(Some(item));
        }

        current = item;
    }

    Err(CrushError::invariant(format!(
        "bucket descent from {bucket_id} did not terminate within {MAX_DESCENT_STEPS} steps"
    )))
}

#[allow(clippy::too_many_arguments)]
fn resolve_leaf(
    map: &CrushMap,
    workspace: &mut Workspace,
    bucket_id: i32,
    x: u32,
    r: u32,
    out: &[i32],
    weights: &[u32],
    choose_args: Option<&ChooseArgs>,
) -> Result<Option<i32>> {
    let mut current = bucket_id;
    for _ in 0..MAX_DESCENT_STEPS {
        if current >= 0 {
            return Ok(if !out.contains(&current) && !is_out(weights, current, x) {
                Some(current)
            } else {
                None
            });
        }
        let bucket = map.get_bucket(current)?;
        let over = choose_args_override(choose_args, current, 0);
        let perm = workspace.perm_state_mut(current);
        let item = match bucket_choose(bucket, x, r, perm, over) {
            Some(item) => item,
            None => return Ok(None),
        };
        if item >= 0 {
            return Ok(if !out.contains(&item) && !is_out(weights, item, x) {
                Some(item)
            } else {
                None
            });
        }
        current = item;
    }
    Err(CrushError::invariant(format!(
        "leaf descent from {bucket_id} did not terminate within {MAX_DESCENT_STEPS} steps"
    )))
}

/// Select `numrep` items of `item_type` reachable from `bucket_id`,
/// appending to `out`.
///
/// In FIRSTN mode (`indep == false`) only successful picks are appended,
/// so a failed replica simply shortens the output. In INDEP mode every
/// replica position is represented in the output: a failed position is
/// filled with `CRUSH_ITEM_NONE` so positions stay stable, which is what
/// erasure-coded rules need (shard N must always land in output slot N).
#[allow(clippy::too_many_arguments)]
fn crush_choose(
    map: &CrushMap,
    workspace: &mut Workspace,
    bucket_id: i32,
    x: u32,
    numrep: usize,
    item_type: i32,
    out: &mut Vec<i32>,
    weights: &[u32],
    total_tries: u32,
    local_tries: u32,
    local_fallback_tries: u32,
    recurse_to_leaf: bool,
    vary_r: u8,
    stable: u8,
    indep: bool,
    choose_args: Option<&ChooseArgs>,
) -> Result<()> {
    for rep in 0..numrep {
        let r = if stable != 0 { 0 } else { rep as u32 };
        let mut picked = None;

        'tiers: for tier in 0..=local_fallback_tries {
            let tries_this_tier = if tier == 0 {
                total_tries.max(1)
            } else {
                local_tries.max(1)
            };
            for attempt_n in 0..tries_this_tier {
                let ftotal = tier * tries_this_tier + attempt_n;
                let r_prime = if vary_r != 0 { r.wrapping_add(ftotal) } else { r };
                match attempt(
                    map,
                    workspace,
                    bucket_id,
                    x,
                    r_prime,
                    item_type,
                    recurse_to_leaf,
                    out,
                    weights,
                    rep,
                    choose_args,
                )? {
                    Some(item) => {
                        picked = Some(item);
                        break 'tiers;
                    }
                    None => continue,
                }
            }
            if local_fallback_tries == 0 {
                break;
            }
        }

        match picked {
            Some(item) => out.push(item),
            None if indep => out.push(CRUSH_ITEM_NONE),
            None => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BucketAlgorithm, BucketData, CrushBucket, CrushRule, CrushRuleStep, RuleType};

    #[test]
    fn test_is_out() {
        let weights = vec![0x10000, 0x8000, 0, 0x20000];
        assert!(!is_out(&weights, 0, 123));
        assert!(!is_out(&weights, 3, 123));
        assert!(is_out(&weights, 2, 123));
        assert!(is_out(&weights, 10, 123));
        assert!(is_out(&weights, -1, 123));
    }

    fn simple_map() -> CrushMap {
        let mut map = CrushMap::new();
        map.max_devices = 3;
        map.max_buckets = 1;
        map.buckets = vec![Some(CrushBucket {
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
        })];
        map.rules = vec![Some(CrushRule {
            rule_id: 0,
            rule_type: RuleType::Replicated,
            min_size: 1,
            max_size: 10,
            steps: vec![
                CrushRuleStep {
                    op: RuleOp::Take,
                    arg1: -1,
                    arg2: 0,
                },
                CrushRuleStep {
                    op: RuleOp::ChooseLeafFirstN,
                    arg1: 0,
                    arg2: 0,
                },
                CrushRuleStep {
                    op: RuleOp::Emit,
                    arg1: 0,
                    arg2: 0,
                },
            ],
        })];
        map
    }

    #[test]
    fn firstn_picks_distinct_devices() {
        let map = simple_map();
        let mut workspace = Workspace::new(&map);
        let weights = vec![0x10000, 0x10000, 0x10000];
        let mut result = Vec::new();
        crush_do_rule(&map, 0, 123, &mut result, 2, &weights, &mut workspace, None).unwrap();
        assert_eq!(result.len(), 2);
        assert_ne!(result[0], result[1]);
    }

    #[test]
    fn firstn_is_deterministic_across_workspaces() {
        let map = simple_map();
        let weights = vec![0x10000, 0x10000, 0x10000];
        let mut r1 = Vec::new();
        let mut ws1 = Workspace::new(&map);
        crush_do_rule(&map, 0, 777, &mut r1, 2, &weights, &mut ws1, None).unwrap();

        let mut r2 = Vec::new();
        let mut ws2 = Workspace::new(&map);
        crush_do_rule(&map, 0, 777, &mut r2, 2, &weights, &mut ws2, None).unwrap();

        assert_eq!(r1, r2);
    }

    #[test]
    fn indep_mode_preserves_position_on_failure() {
        let mut map = simple_map();
        map.rules[0].as_mut().unwrap().steps[1].op = RuleOp::ChooseLeafIndep;
        let mut workspace = Workspace::new(&map);
        // Only one device in, rest fully out: asking for 3 indep slots
        // should yield CRUSH_ITEM_NONE in the unfilled positions rather
        // than a shorter, shifted vector.
        let weights = vec![0x10000, 0, 0];
        let mut result = Vec::new();
        crush_do_rule(&map, 0, 5, &mut result, 3, &weights, &mut workspace, None).unwrap();
        assert_eq!(result.len(), 3);
        assert_eq!(result.iter().filter(|&&i| i == 0).count(), 1);
        assert_eq!(
            result.iter().filter(|&&i| i == CRUSH_ITEM_NONE).count(),
            2
        );
    }

    #[test]
    fn unmappable_when_all_devices_out() {
        let map = simple_map();
        let mut workspace = Workspace::new(&map);
        let weights = vec![0, 0, 0];
        let mut result = Vec::new();
        let err = crush_do_rule(&map, 0, 1, &mut result, 2, &weights, &mut workspace, None)
            .unwrap_err();
        assert!(matches!(err, CrushError::Unmappable(_)));
    }
}

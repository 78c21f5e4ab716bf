//! JSON-shaped map loader.
//!
//! Grounded on `original_source/crush/libcrush/libcrush.c`'s
//! `parse_types`/`parse_bucket`/`parse_device`/`parse_reference`/
//! `parse_rules`/`parse_step*`/`parse_tunables`/`parse_choose_args*`:
//! a dynamic, dict-shaped input walked top to bottom (types, then
//! trees, then rules, then tunables, then choose_args), with strict
//! rejection of unknown keys and a breadcrumb trail recording the path
//! to whatever key or index caused a failure.
//!
//! `serde_json::Value` already is the `Null|Bool|Int|Float|Str|List|Map`
//! sum type the format needs, so no bespoke dynamic-value enum is
//! reinvented here.

use std::collections::HashMap;

use serde_json::Value;

use crate::choose_args::{ChooseArgBucket, ChooseArgs, ChooseArgsMap};
use crate::error::{CrushError, Result};
use crate::types::{
    BucketAlgorithm, BucketData, CrushBucket, CrushMap, CrushMapOptions, CrushRule,
    CrushRuleStep, RuleOp, RuleType,
};

/// Breadcrumb trail accumulated while walking the input, rendered as
/// e.g. `trees[2].items[0]` in error messages.
#[derive(Debug, Clone, Default)]
struct Trace(Vec<String>);

impl Trace {
    fn child(&self, segment: impl Into<String>) -> Trace {
        let mut v = self.0.clone();
        v.push(segment.into());
        Trace(v)
    }

    fn render(&self) -> String {
        self.0.join(".")
    }

    fn err(&self, msg: impl std::fmt::Display) -> CrushError {
        if self.0.is_empty() {
            CrushError::invalid(msg.to_string())
        } else {
            CrushError::invalid(format!("{}: {}", self.render(), msg))
        }
    }

    fn not_allowed(&self, msg: impl std::fmt::Display) -> CrushError {
        if self.0.is_empty() {
            CrushError::not_allowed(msg.to_string())
        } else {
            CrushError::not_allowed(format!("{}: {}", self.render(), msg))
        }
    }
}

fn obj<'a>(value: &'a Value, trace: &Trace) -> Result<&'a serde_json::Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| trace.err("expected an object"))
}

fn arr<'a>(value: &'a Value, trace: &Trace) -> Result<&'a Vec<Value>> {
    value.as_array().ok_or_else(|| trace.err("expected an array"))
}

fn require<'a>(
    map: &'a serde_json::Map<String, Value>,
    key: &str,
    trace: &Trace,
) -> Result<&'a Value> {
    map.get(key)
        .ok_or_else(|| trace.err(format!("missing required key '{key}'")))
}

fn check_known_keys(
    map: &serde_json::Map<String, Value>,
    allowed: &[&str],
    trace: &Trace,
) -> Result<()> {
    for key in map.keys() {
        if !allowed.contains(&key.as_str()) {
            return Err(trace.err(format!("unknown key '{key}'")));
        }
    }
    Ok(())
}

fn as_i64(value: &Value, trace: &Trace) -> Result<i64> {
    value.as_i64().ok_or_else(|| trace.err("expected an integer"))
}

fn as_i32(value: &Value, trace: &Trace) -> Result<i32> {
    let v = as_i64(value, trace)?;
    i32::try_from(v).map_err(|_| trace.err(format!("{v} out of range for i32")))
}

fn as_u32(value: &Value, trace: &Trace) -> Result<u32> {
    let v = as_i64(value, trace)?;
    u32::try_from(v).map_err(|_| trace.err(format!("{v} out of range for u32")))
}

fn as_str<'a>(value: &'a Value, trace: &Trace) -> Result<&'a str> {
    value.as_str().ok_or_else(|| trace.err("expected a string"))
}

/// 16.16 fixed-point weight. Accepts either a plain number of devices
/// (e.g. `1.0`), scaled by `0x10000`, or a pre-scaled integer when the
/// JSON value is already an object `{"fixed": N}` — the former is what
/// hand-written maps use; the latter lets round-tripped `dump_json`
/// output specify exact weights.
fn as_weight(value: &Value, trace: &Trace) -> Result<u32> {
    if let Some(f) = value.as_f64() {
        let scaled = (f * 65536.0).round();
        if !(0.0..=(u32::MAX as f64)).contains(&scaled) {
            return Err(trace.err(format!("weight {f} out of range")));
        }
        return Ok(scaled as u32);
    }
    Err(trace.err("expected a numeric weight"))
}

struct Loaded {
    map: CrushMap,
    choose_args: ChooseArgsMap,
}

/// Parse a JSON-shaped CRUSH map. Top-level keys: `types`, `trees`,
/// `rules`, `tunables` (optional), `choose_args` (optional). Returns the
/// built, finalized map plus any choose-args sets it carried.
pub fn load(value: &Value, options: CrushMapOptions) -> Result<(CrushMap, ChooseArgsMap)> {
    let trace = Trace::default();
    let root = obj(value, &trace)?;
    check_known_keys(
        root,
        &["types", "trees", "rules", "tunables", "choose_args"],
        &trace,
    )?;

    let mut map = CrushMap::with_options(options);

    if let Some(types) = root.get("types") {
        load_types(types, &trace.child("types"), &mut map)?;
    }

    let mut next_bucket_id: i32 = -1;
    if let Some(trees) = root.get("trees") {
        load_trees(trees, &trace.child("trees"), &mut map, &mut next_bucket_id)?;
    }
    map.max_buckets = -1 - next_bucket_id;

    let max_device = map.names.keys().filter(|&&id| id >= 0).copied().max();
    map.max_devices = max_device.map(|id| id + 1).unwrap_or(0);

    if let Some(rules) = root.get("rules") {
        load_rules(rules, &trace.child("rules"), &mut map)?;
    }

    if let Some(tunables) = root.get("tunables") {
        load_tunables(tunables, &trace.child("tunables"), &mut map)?;
    }

    crate::finalize::finalize(&mut map)?;

    let choose_args = if let Some(ca) = root.get("choose_args") {
        load_choose_args(ca, &trace.child("choose_args"), &map)?
    } else {
        ChooseArgsMap::default()
    };
    crate::choose_args::validate(&map, &choose_args)?;

    Ok((map, choose_args))
}

fn load_types(value: &Value, trace: &Trace, map: &mut CrushMap) -> Result<()> {
    let list = arr(value, trace)?;
    for (i, entry) in list.iter().enumerate() {
        let t = trace.child(format!("[{i}]"));
        let o = obj(entry, &t)?;
        check_known_keys(o, &["type_id", "name"], &t)?;
        let type_id = as_i32(require(o, "type_id", &t)?, &t.child("type_id"))?;
        let name = as_str(require(o, "name", &t)?, &t.child("name"))?.to_string();
        if map.type_names.insert(type_id, name).is_some() {
            return Err(t.err(format!("duplicate type_id {type_id}")));
        }
    }
    Ok(())
}

fn load_trees(
    value: &Value,
    trace: &Trace,
    map: &mut CrushMap,
    next_bucket_id: &mut i32,
) -> Result<()> {
    let list = arr(value, trace)?;
    let mut buckets_by_id: HashMap<i32, CrushBucket> = HashMap::new();
    for (i, entry) in list.iter().enumerate() {
        let t = trace.child(format!("[{i}]"));
        load_tree_node(entry, &t, map, next_bucket_id, &mut buckets_by_id)?;
    }
    // each root's own `(id, weight)` pair is discarded: roots aren't
    // anyone's child, so no parent needs a default edge weight for them.
    let size = (-1 - *next_bucket_id) as usize + 1;
    map.buckets = vec![None; size];
    for (id, bucket) in buckets_by_id {
        let idx = (-1 - id) as usize;
        map.buckets[idx] = Some(bucket);
    }
    Ok(())
}

/// Returns the item id (device or bucket) this node resolves to, and its
/// own total weight: for a device or a reference to an existing bucket,
/// the weight it would contribute if a parent doesn't give it an
/// explicit per-edge `"weight"`; for a bucket node, the weight just
/// computed for it (its own `"weight"` override if given, else the sum
/// of its children's contributed weights).
fn load_tree_node(
    value: &Value,
    trace: &Trace,
    map: &mut CrushMap,
    next_bucket_id: &mut i32,
    buckets_by_id: &mut HashMap<i32, CrushBucket>,
) -> Result<(i32, u32)> {
    let o = obj(value, trace)?;

    if o.contains_key("reference_id") {
        check_known_keys(o, &["reference_id", "weight"], trace)?;
        let id = as_i32(require(o, "reference_id", trace)?, &trace.child("reference_id"))?;
        let own_weight = buckets_by_id.get(&id).map(|b| b.weight).unwrap_or(0x10000);
        return Ok((id, own_weight));
    }

    if !o.contains_key("children") {
        check_known_keys(o, &["id", "name", "weight"], trace)?;
        let device_id = as_i32(require(o, "id", trace)?, &trace.child("id"))?;
        if device_id < 0 {
            return Err(trace.child("id").err("device id must be non-negative"));
        }
        if let Some(name) = o.get("name") {
            let name = as_str(name, &trace.child("name"))?.to_string();
            map.names.insert(device_id, name);
        }
        return Ok((device_id, 0x10000));
    }

    check_known_keys(o, &["name", "type", "algorithm", "id", "weight", "children"], trace)?;
    let name = as_str(require(o, "name", trace)?, &trace.child("name"))?.to_string();
    let type_id = as_i32(require(o, "type", trace)?, &trace.child("type"))?;
    let algorithm = match o.get("algorithm") {
        Some(v) => {
            BucketAlgorithm::from_name(as_str(v, &trace.child("algorithm"))?).map_err(|e| trace.err(e))?
        }
        None => BucketAlgorithm::Straw2,
    };
    if algorithm == BucketAlgorithm::Straw && !map.options.backward_compatibility {
        return Err(trace.child("algorithm").not_allowed(
            "the legacy 'straw' algorithm requires backward_compatibility",
        ));
    }

    let bucket_id = if let Some(explicit) = o.get("id") {
        let id = as_i32(explicit, &trace.child("id"))?;
        if id >= 0 {
            return Err(trace.child("id").err("bucket id must be negative"));
        }
        if buckets_by_id.contains_key(&id) {
            return Err(trace.child("id").err(format!("duplicate bucket id {id}")));
        }
        *next_bucket_id = (*next_bucket_id).min(id - 1);
        id
    } else {
        let id = *next_bucket_id;
        *next_bucket_id -= 1;
        id
    };

    let children_value = require(o, "children", trace)?;
    let children_list = arr(children_value, &trace.child("children"))?;

    let mut item_ids = Vec::with_capacity(children_list.len());
    let mut item_weights = Vec::with_capacity(children_list.len());
    for (i, child) in children_list.iter().enumerate() {
        let it = trace.child(format!("children[{i}]"));
        let child_obj = obj(child, &it)?;
        let explicit_weight = child_obj
            .get("weight")
            .map(|w| as_weight(w, &it.child("weight")))
            .transpose()?;
        let (child_id, own_weight) = load_tree_node(child, &it, map, next_bucket_id, buckets_by_id)?;
        item_ids.push(child_id);
        item_weights.push(explicit_weight.unwrap_or(own_weight));
    }

    let data = match algorithm {
        BucketAlgorithm::Uniform => {
            let w = item_weights.first().copied().unwrap_or(0x10000);
            if item_weights.iter().any(|&x| x != w) {
                return Err(trace.err("uniform bucket items must share one weight"));
            }
            BucketData::Uniform { item_weight: w }
        }
        BucketAlgorithm::List => {
            let mut running = 0u64;
            let mut sum_weights = Vec::with_capacity(item_weights.len());
            for &w in &item_weights {
                running += u64::from(w);
                sum_weights.push(running.min(u64::from(u32::MAX)) as u32);
            }
            BucketData::List {
                item_weights,
                sum_weights,
            }
        }
        BucketAlgorithm::Straw => BucketData::Straw {
            item_weights,
            straws: Vec::new(), // computed by finalize()
        },
        BucketAlgorithm::Straw2 => BucketData::Straw2 { item_weights },
    };

    let computed_weight = sum_item_weights(algorithm, &data, item_ids.len())?;
    let (weight, has_bucket_weights) = match o.get("weight") {
        Some(w) => (as_weight(w, &trace.child("weight"))?, true),
        None => (computed_weight, false),
    };

    let bucket = CrushBucket {
        id: bucket_id,
        bucket_type: type_id,
        alg: algorithm,
        hash: 0,
        weight,
        has_bucket_weights,
        size: item_ids.len() as u32,
        items: item_ids,
        data,
    };
    buckets_by_id.insert(bucket_id, bucket);
    map.names.insert(bucket_id, name);
    Ok((bucket_id, weight))
}

/// Sum of a bucket's own item weights, matching
/// `finalize::recompute_weights`'s formula, so a loader-built bucket
/// already carries its correct total before `finalize` runs (needed so
/// an un-weighted nested-bucket child can default to its parent's actual
/// total instead of a flat placeholder).
fn sum_item_weights(algorithm: BucketAlgorithm, data: &BucketData, item_count: usize) -> Result<u32> {
    let sum: u64 = match (algorithm, data) {
        (BucketAlgorithm::Uniform, BucketData::Uniform { item_weight }) => {
            u64::from(*item_weight) * item_count as u64
        }
        (_, BucketData::List { item_weights, .. })
        | (_, BucketData::Straw { item_weights, .. })
        | (_, BucketData::Straw2 { item_weights }) => {
            item_weights.iter().map(|&w| u64::from(w)).sum()
        }
        _ => unreachable!("algorithm/data mismatch"),
    };
    if sum > u64::from(u32::MAX) {
        return Err(CrushError::invariant("bucket total weight overflows u32"));
    }
    Ok(sum as u32)
}

/// `rules` is a map from rule name to its body — `{type, min_size?,
/// max_size?, steps}` — rather than a list, so that a rule's name is its
/// key in the record rather than a field on it. Rule ids are allocated
/// in iteration order; since `serde_json`'s default feature preserves
/// object key order, this is stable for a given input text.
fn load_rules(value: &Value, trace: &Trace, map: &mut CrushMap) -> Result<()> {
    let root = obj(value, trace)?;
    let mut rules = Vec::with_capacity(root.len());
    for (rule_id, (name, entry)) in root.iter().enumerate() {
        let t = trace.child(format!("[{name}]"));
        let o = obj(entry, &t)?;
        check_known_keys(o, &["type", "min_size", "max_size", "steps"], &t)?;
        let rule_type_str = as_str(require(o, "type", &t)?, &t.child("type"))?;
        let rule_type = match rule_type_str {
            "replicated" => RuleType::Replicated,
            "erasure" => RuleType::Erasure,
            other => {
                return Err(t
                    .child("type")
                    .err(format!("unknown rule type '{other}'")))
            }
        };
        let min_size = o
            .get("min_size")
            .map(|v| as_i32(v, &t.child("min_size")))
            .transpose()?
            .unwrap_or(1) as u8;
        let max_size = o
            .get("max_size")
            .map(|v| as_i32(v, &t.child("max_size")))
            .transpose()?
            .unwrap_or(10) as u8;

        let steps_value = require(o, "steps", &t)?;
        let steps_list = arr(steps_value, &t.child("steps"))?;
        let mut steps = Vec::with_capacity(steps_list.len());
        for (j, step) in steps_list.iter().enumerate() {
            steps.push(load_step(step, &t.child(format!("steps[{j}]")), map)?);
        }

        map.rule_names.insert(rule_id as u32, name.clone());
        rules.push(Some(CrushRule {
            rule_id: rule_id as u32,
            rule_type,
            min_size,
            max_size,
            steps,
        }));
    }
    map.max_rules = rules.len() as u32;
    map.rules = rules;
    Ok(())
}

/// Rule-step ops that only exist for backward compatibility with older
/// maps; rejected unless `backward_compatibility` is enabled, same as
/// the legacy `straw` bucket algorithm.
const COMPAT_ONLY_OPS: &[&str] = &[
    "set_choose_local_tries",
    "set_choose_local_fallback_tries",
    "set_chooseleaf_vary_r",
    "set_chooseleaf_stable",
];

fn load_step(value: &Value, trace: &Trace, map: &CrushMap) -> Result<CrushRuleStep> {
    let o = obj(value, trace)?;
    check_known_keys(o, &["op", "arg1", "arg2", "type"], trace)?;
    let op_str = as_str(require(o, "op", trace)?, &trace.child("op"))?;
    if COMPAT_ONLY_OPS.contains(&op_str) && !map.options.backward_compatibility {
        return Err(trace.child("op").not_allowed(format!(
            "'{op_str}' is a compatibility-only op and requires backward_compatibility"
        )));
    }
    let op = match op_str {
        "noop" => RuleOp::Noop,
        "take" => RuleOp::Take,
        "choose_firstn" => RuleOp::ChooseFirstN,
        "choose_indep" => RuleOp::ChooseIndep,
        "emit" => RuleOp::Emit,
        "chooseleaf_firstn" => RuleOp::ChooseLeafFirstN,
        "chooseleaf_indep" => RuleOp::ChooseLeafIndep,
        "set_choose_tries" => RuleOp::SetChooseTries,
        "set_chooseleaf_tries" => RuleOp::SetChooseLeafTries,
        "set_choose_local_tries" => RuleOp::SetChooseLocalTries,
        "set_choose_local_fallback_tries" => RuleOp::SetChooseLocalFallbackTries,
        "set_chooseleaf_vary_r" => RuleOp::SetChooseLeafVaryR,
        "set_chooseleaf_stable" => RuleOp::SetChooseLeafStable,
        other => return Err(trace.child("op").err(format!("unknown op '{other}'"))),
    };
    let arg1 = o
        .get("arg1")
        .map(|v| as_i32(v, &trace.child("arg1")))
        .transpose()?
        .unwrap_or(0);

    // `arg2` for the CHOOSE*/CHOOSELEAF* family is a hierarchy type id;
    // `type` lets a step name that type instead of hardcoding its id, and
    // is validated against the map's own type table.
    let arg2 = if let Some(type_name) = o.get("type") {
        let name = as_str(type_name, &trace.child("type"))?;
        map.type_names
            .iter()
            .find(|(_, n)| n.as_str() == name)
            .map(|(&id, _)| id)
            .ok_or_else(|| trace.child("type").err(format!("unknown type name '{name}'")))?
    } else {
        o.get("arg2")
            .map(|v| as_i32(v, &trace.child("arg2")))
            .transpose()?
            .unwrap_or(0)
    };
    Ok(CrushRuleStep { op, arg1, arg2 })
}

/// Tunable keys that only exist for backward compatibility with older
/// maps; rejected unless `backward_compatibility` is enabled.
const COMPAT_ONLY_TUNABLES: &[&str] = &[
    "choose_local_tries",
    "choose_local_fallback_tries",
    "chooseleaf_vary_r",
    "chooseleaf_stable",
    "chooseleaf_descend_once",
    "straw_calc_version",
];

fn load_tunables(value: &Value, trace: &Trace, map: &mut CrushMap) -> Result<()> {
    let o = obj(value, trace)?;
    check_known_keys(
        o,
        &[
            "choose_local_tries",
            "choose_local_fallback_tries",
            "choose_total_tries",
            "chooseleaf_descend_once",
            "chooseleaf_vary_r",
            "chooseleaf_stable",
            "straw_calc_version",
            "allowed_bucket_algs",
        ],
        trace,
    )?;
    for key in COMPAT_ONLY_TUNABLES {
        if o.contains_key(*key) && !map.options.backward_compatibility {
            return Err(trace.child(*key).not_allowed(format!(
                "'{key}' is a compatibility-only tunable and requires backward_compatibility"
            )));
        }
    }
    macro_rules! opt_u32 {
        ($key:literal, $field:ident) => {
            if let Some(v) = o.get($key) {
                map.tunables.$field = as_u32(v, &trace.child($key))?;
            }
        };
    }
    macro_rules! opt_u8 {
        ($key:literal, $field:ident) => {
            if let Some(v) = o.get($key) {
                map.tunables.$field = as_u32(v, &trace.child($key))? as u8;
            }
        };
    }
    opt_u32!("choose_local_tries", choose_local_tries);
    opt_u32!("choose_local_fallback_tries", choose_local_fallback_tries);
    opt_u32!("choose_total_tries", choose_total_tries);
    opt_u32!("chooseleaf_descend_once", chooseleaf_descend_once);
    opt_u8!("chooseleaf_vary_r", chooseleaf_vary_r);
    opt_u8!("chooseleaf_stable", chooseleaf_stable);
    opt_u8!("straw_calc_version", straw_calc_version);
    opt_u32!("allowed_bucket_algs", allowed_bucket_algs);
    Ok(())
}

fn resolve_bucket_ref(
    bo: &serde_json::Map<String, Value>,
    trace: &Trace,
    map: &CrushMap,
) -> Result<i32> {
    if let Some(v) = bo.get("bucket_id") {
        let id = as_i32(v, &trace.child("bucket_id"))?;
        map.get_bucket(id)
            .map_err(|_| trace.err(format!("unknown bucket_id {id}")))?;
        return Ok(id);
    }
    if let Some(v) = bo.get("bucket_name") {
        let name = as_str(v, &trace.child("bucket_name"))?;
        return map
            .names
            .iter()
            .find(|(&id, n)| id < 0 && n.as_str() == name)
            .map(|(&id, _)| id)
            .ok_or_else(|| trace.err(format!("unknown bucket_name '{name}'")));
    }
    Err(trace.err("entry must have either 'bucket_id' or 'bucket_name'"))
}

/// `choose_args` is a map from an arbitrary user key to a list of
/// per-bucket overrides; the key itself is opaque to placement (it only
/// threads through to `ChooseArgsMap::get`), so entries are assigned
/// sequential ids in iteration order.
fn load_choose_args(value: &Value, trace: &Trace, map: &CrushMap) -> Result<ChooseArgsMap> {
    let root = obj(value, trace)?;
    let mut out = ChooseArgsMap::default();
    for (choose_args_id, (_key, entry)) in root.iter().enumerate() {
        let choose_args_id = choose_args_id as i32;
        let t = trace.child(format!("[{_key}]"));
        let buckets_list = arr(entry, &t)?;
        let mut set = ChooseArgs::default();
        for (j, bentry) in buckets_list.iter().enumerate() {
            let bt = t.child(format!("[{j}]"));
            let bo = obj(bentry, &bt)?;
            check_known_keys(bo, &["bucket_id", "bucket_name", "weight_set", "ids"], &bt)?;
            let bucket_id = resolve_bucket_ref(bo, &bt, map)?;

            let mut weight_set = Vec::new();
            if let Some(ws) = bo.get("weight_set") {
                let rows = arr(ws, &bt.child("weight_set"))?;
                for (k, row) in rows.iter().enumerate() {
                    let rt = bt.child(format!("weight_set[{k}]"));
                    let row_arr = arr(row, &rt)?;
                    let mut values = Vec::with_capacity(row_arr.len());
                    for (l, v) in row_arr.iter().enumerate() {
                        values.push(as_weight(v, &rt.child(format!("[{l}]")))?);
                    }
                    weight_set.push(values);
                }
            }

            let ids = if let Some(ids_value) = bo.get("ids") {
                let ids_arr = arr(ids_value, &bt.child("ids"))?;
                let mut values = Vec::with_capacity(ids_arr.len());
                for (l, v) in ids_arr.iter().enumerate() {
                    values.push(as_i32(v, &bt.child(format!("ids[{l}]")))?);
                }
                Some(values)
            } else {
                None
            };

            set.buckets.insert(
                bucket_id,
                ChooseArgBucket { weight_set, ids },
            );
        }
        out.sets.insert(choose_args_id, set);
    }
    Ok(out)
}

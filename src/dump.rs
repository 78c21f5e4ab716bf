//! Structural inverse of `loader`: renders a `CrushMap` back into the
//! same JSON shape `loader::load` accepts, so that
//! `loader::load(dump(m)) ≈ m` up to key ordering and defaulted fields.

use serde_json::{json, Map, Value};

use crate::choose_args::ChooseArgsMap;
use crate::types::{BucketData, CrushMap};

/// Render `map` (and, if present, its choose-args overlay) to the
/// JSON-shaped record the loader accepts.
pub fn dump_json(map: &CrushMap, choose_args: &ChooseArgsMap) -> Value {
    let mut root = Map::new();
    root.insert("types".to_string(), dump_types(map));
    root.insert("trees".to_string(), dump_trees(map));
    root.insert("rules".to_string(), dump_rules(map));
    root.insert("tunables".to_string(), dump_tunables(map));
    if !choose_args.sets.is_empty() {
        root.insert("choose_args".to_string(), dump_choose_args(choose_args));
    }
    Value::Object(root)
}

fn dump_types(map: &CrushMap) -> Value {
    let mut types: Vec<_> = map.type_names.iter().collect();
    types.sort_by_key(|(id, _)| **id);
    Value::Array(
        types
            .into_iter()
            .map(|(id, name)| json!({"type_id": id, "name": name}))
            .collect(),
    )
}

/// A bucket is a "root" for dump purposes if no other bucket lists it
/// among its items — the inverse of what `finalize::rebuild_parents`
/// computes, read back off `CrushMap::parent_of`.
fn dump_trees(map: &CrushMap) -> Value {
    let roots: Vec<&crate::types::CrushBucket> = map
        .buckets
        .iter()
        .flatten()
        .filter(|b| map.parent_of(b.id).is_none())
        .collect();
    Value::Array(roots.iter().map(|b| dump_bucket(map, b.id)).collect())
}

fn dump_bucket(map: &CrushMap, bucket_id: i32) -> Value {
    let bucket = map.get_bucket(bucket_id).expect("dump walks only known ids");
    let children: Vec<Value> = bucket
        .items
        .iter()
        .zip(bucket.data.item_weights().iter().chain(std::iter::repeat(&0x10000)))
        .map(|(&item, &weight)| {
            if item >= 0 {
                json!({
                    "id": item,
                    "name": map.name_of(item),
                    "weight": weight as f64 / 65536.0,
                })
            } else {
                dump_bucket(map, item)
            }
        })
        .collect();
    let mut out = json!({
        "id": bucket.id,
        "name": map.name_of(bucket.id),
        "type": bucket.bucket_type,
        "algorithm": bucket.alg.name(),
        "children": children,
    });
    if bucket.has_bucket_weights {
        out["weight"] = json!(bucket.weight as f64 / 65536.0);
    }
    out
}

fn dump_rules(map: &CrushMap) -> Value {
    let mut root = Map::new();
    for rule in map.rules.iter().flatten() {
        let name = map
            .rule_name_of(rule.rule_id)
            .map(str::to_string)
            .unwrap_or_else(|| format!("rule_{}", rule.rule_id));
        let steps: Vec<Value> = rule
            .steps
            .iter()
            .map(|s| {
                json!({
                    "op": op_name(s.op),
                    "arg1": s.arg1,
                    "arg2": s.arg2,
                })
            })
            .collect();
        root.insert(
            name,
            json!({
                "type": match rule.rule_type {
                    crate::types::RuleType::Replicated => "replicated",
                    crate::types::RuleType::Erasure => "erasure",
                },
                "min_size": rule.min_size,
                "max_size": rule.max_size,
                "steps": steps,
            }),
        );
    }
    Value::Object(root)
}

fn op_name(op: crate::types::RuleOp) -> &'static str {
    use crate::types::RuleOp::*;
    match op {
        Noop => "noop",
        Take => "take",
        ChooseFirstN => "choose_firstn",
        ChooseIndep => "choose_indep",
        Emit => "emit",
        ChooseLeafFirstN => "chooseleaf_firstn",
        ChooseLeafIndep => "chooseleaf_indep",
        SetChooseTries => "set_choose_tries",
        SetChooseLeafTries => "set_chooseleaf_tries",
        SetChooseLocalTries => "set_choose_local_tries",
        SetChooseLocalFallbackTries => "set_choose_local_fallback_tries",
        SetChooseLeafVaryR => "set_chooseleaf_vary_r",
        SetChooseLeafStable => "set_chooseleaf_stable",
    }
}

fn dump_tunables(map: &CrushMap) -> Value {
    let t = &map.tunables;
    json!({
        "choose_local_tries": t.choose_local_tries,
        "choose_local_fallback_tries": t.choose_local_fallback_tries,
        "choose_total_tries": t.choose_total_tries,
        "chooseleaf_descend_once": t.chooseleaf_descend_once,
        "chooseleaf_vary_r": t.chooseleaf_vary_r,
        "chooseleaf_stable": t.chooseleaf_stable,
        "straw_calc_version": t.straw_calc_version,
        "allowed_bucket_algs": t.allowed_bucket_algs,
    })
}

fn dump_choose_args(choose_args: &ChooseArgsMap) -> Value {
    let mut root = Map::new();
    for (id, set) in &choose_args.sets {
        let buckets: Vec<Value> = set
            .buckets
            .iter()
            .map(|(bucket_id, over)| {
                json!({
                    "bucket_id": bucket_id,
                    "weight_set": over.weight_set,
                    "ids": over.ids,
                })
            })
            .collect();
        root.insert(id.to_string(), Value::Array(buckets));
    }
    Value::Object(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::load;
    use crate::types::CrushMapOptions;
    use serde_json::json;

    #[test]
    fn round_trips_minimal_map_through_loader() {
        let input = json!({
            "types": [{"type_id": 1, "name": "host"}],
            "trees": [{
                "name": "host0",
                "type": 1,
                "algorithm": "straw2",
                "children": [
                    {"id": 0, "name": "osd.0", "weight": 1.0},
                    {"id": 1, "name": "osd.1", "weight": 1.0}
                ]
            }],
            "rules": {
                "r": {
                    "type": "replicated",
                    "steps": [
                        {"op": "take", "arg1": -1},
                        {"op": "chooseleaf_firstn", "arg1": 0, "arg2": 0},
                        {"op": "emit"}
                    ]
                }
            }
        });
        let (map, choose_args) = load(&input, CrushMapOptions::default()).unwrap();
        let dumped = dump_json(&map, &choose_args);
        let (reloaded, _) = load(&dumped, CrushMapOptions::default()).unwrap();
        assert_eq!(reloaded.get_bucket(-1).unwrap().size, 2);
        assert_eq!(reloaded.rules.len(), 1);
        assert_eq!(reloaded.rule_name_of(0), Some("r"));
    }
}

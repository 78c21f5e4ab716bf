pub mod bucket;
pub mod choose_args;
pub mod decode;
pub mod dump;
pub mod encode;
pub mod error;
pub mod finalize;
pub mod hash;
pub mod ln_fixed;
pub mod loader;
pub mod mapper;
pub mod types;

pub use choose_args::{ChooseArgBucket, ChooseArgs, ChooseArgsMap};
pub use dump::dump_json;
pub use error::{CrushError, Result};
pub use mapper::{Workspace, CRUSH_ITEM_NONE};
pub use types::{
    BucketAlgorithm, BucketData, CrushBucket, CrushMap, CrushMapOptions, CrushRule,
    CrushRuleStep, RuleOp, RuleType, Tunables,
};

/// Replace `map`'s contents from a JSON-shaped record (§4.4 of the
/// placement engine's design). On success, returns the choose-args sets
/// the record carried (empty if it had none); on failure the original
/// `map` is left untouched — the loader builds a fresh map and only
/// swaps it in once fully parsed and finalized.
pub fn parse(map: &mut CrushMap, record: &serde_json::Value) -> Result<ChooseArgsMap> {
    let (built, choose_args) = loader::load(record, map.options)?;
    *map = built;
    Ok(choose_args)
}

/// Run `rule_id` against `map`, producing up to `replica_count` results.
/// `weights[d]` is device `d`'s effective weight (16.16 fixed point,
/// `0x10000` == fully in, `0` == fully out); `choose_args` overlays a
/// per-bucket weight/id override without mutating `map`.
pub fn map(
    crush_map: &CrushMap,
    rule_id: u32,
    x: u32,
    replica_count: usize,
    weights: &[u32],
    workspace: &mut Workspace,
    choose_args: Option<&ChooseArgs>,
) -> Result<Vec<i32>> {
    let mut result = Vec::with_capacity(replica_count);
    mapper::crush_do_rule(
        crush_map,
        rule_id,
        x,
        &mut result,
        replica_count,
        weights,
        workspace,
        choose_args,
    )?;
    Ok(result)
}

/// Parse a textual (JSON) form straight to a record, the "core" half of
/// the spec's `convert` operation — the textual DSL compiler/decompiler
/// itself is explicitly out of scope (see SPEC_FULL.md).
pub fn convert_from_binary(bytes: bytes::Bytes) -> Result<serde_json::Value> {
    let mut buf = bytes;
    let map = CrushMap::decode(&mut buf)?;
    Ok(dump_json(&map, &ChooseArgsMap::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_then_map_then_encode_round_trips() {
        let mut crush_map = CrushMap::new();
        let record = json!({
            "types": [{"type_id": 0, "name": "osd"}, {"type_id": 1, "name": "host"}],
            "trees": [{
                "name": "host0",
                "type": 1,
                "algorithm": "straw2",
                "children": [
                    {"id": 0, "name": "osd.0", "weight": 1.0},
                    {"id": 1, "name": "osd.1", "weight": 1.0},
                    {"id": 2, "name": "osd.2", "weight": 1.0}
                ]
            }],
            "rules": {
                "replicated_rule": {
                    "type": "replicated",
                    "steps": [
                        {"op": "take", "arg1": -1},
                        {"op": "chooseleaf_firstn", "arg1": 0, "arg2": 0},
                        {"op": "emit"}
                    ]
                }
            }
        });
        parse(&mut crush_map, &record).unwrap();

        let weights = vec![0x10000; 3];
        let mut workspace = Workspace::new(&crush_map);
        let result = map(&crush_map, 0, 42, 2, &weights, &mut workspace, None).unwrap();
        assert_eq!(result.len(), 2);

        let encoded = crush_map.encode();
        let mut buf = encoded;
        let decoded = CrushMap::decode(&mut buf).unwrap();
        assert_eq!(decoded.rules.len(), crush_map.rules.len());
    }
}

//! End-to-end scenarios against the public surface (§8 seed tests).

use std::collections::HashMap;

use bytes::Bytes;
use serde_json::json;

use crush::choose_args::{ChooseArgBucket, ChooseArgs, ChooseArgsMap};
use crush::{parse, CrushError, CrushMap, CrushMapOptions, Workspace};

fn two_host_map() -> CrushMap {
    let mut map = CrushMap::new();
    let record = json!({
        "types": [
            {"type_id": 0, "name": "device"},
            {"type_id": 1, "name": "host"},
            {"type_id": 2, "name": "root"}
        ],
        "trees": [{
            "name": "root0",
            "type": 2,
            "algorithm": "straw2",
            "children": [
                {
                    "name": "host0",
                    "type": 1,
                    "algorithm": "straw2",
                    "children": [
                        {"id": 0, "name": "osd.0", "weight": 1.0},
                        {"id": 1, "name": "osd.1", "weight": 1.0}
                    ]
                },
                {
                    "name": "host1",
                    "type": 1,
                    "algorithm": "straw2",
                    "children": [
                        {"id": 2, "name": "osd.2", "weight": 1.0},
                        {"id": 3, "name": "osd.3", "weight": 1.0}
                    ]
                }
            ]
        }],
        "rules": {
            "replicated": {
                "type": "replicated",
                "steps": [
                    {"op": "take", "arg1": -1},
                    {"op": "choose_firstn", "arg1": 0, "type": "host"},
                    {"op": "chooseleaf_firstn", "arg1": 1, "type": "device"},
                    {"op": "emit"}
                ]
            }
        }
    });
    parse(&mut map, &record).unwrap();
    map
}

#[test]
fn s1_two_replicas_land_on_different_hosts() {
    let map = two_host_map();
    let weights = vec![0x10000u32; 4];
    let mut workspace = Workspace::new(&map);
    let result = crush::map(&map, 0, 42, 2, &weights, &mut workspace, None).unwrap();

    assert_eq!(result.len(), 2);
    assert_ne!(result[0], result[1]);
    let host_of = |dev: i32| if dev < 2 { 0 } else { 1 };
    assert_ne!(host_of(result[0]), host_of(result[1]));
}

#[test]
fn s2_zero_weight_device_never_selected() {
    let map = two_host_map();
    let mut weights = vec![0x10000u32; 4];
    weights[0] = 0;
    let mut workspace = Workspace::new(&map);

    for x in 0..200 {
        let result = crush::map(&map, 0, x, 2, &weights, &mut workspace, None).unwrap();
        assert_eq!(result.len(), 2);
        assert!(!result.contains(&0));
    }
}

#[test]
fn s3_equal_weight_devices_get_roughly_equal_share() {
    let mut map = CrushMap::new();
    let mut children = Vec::new();
    for i in 0..10 {
        children.push(json!({"id": i, "name": format!("osd.{i}"), "weight": 1.0}));
    }
    let record = json!({
        "types": [{"type_id": 0, "name": "device"}, {"type_id": 1, "name": "root"}],
        "trees": [{"name": "root0", "type": 1, "algorithm": "straw2", "children": children}],
        "rules": {
            "replicated": {
                "type": "replicated",
                "steps": [
                    {"op": "take", "arg1": -1},
                    {"op": "chooseleaf_firstn", "arg1": 0, "arg2": 0},
                    {"op": "emit"}
                ]
            }
        }
    });
    parse(&mut map, &record).unwrap();

    let weights = vec![0x10000u32; 10];
    let mut workspace = Workspace::new(&map);
    let mut counts = [0u32; 10];
    let n = 20_000;
    for x in 0..n {
        let result = crush::map(&map, 0, x, 1, &weights, &mut workspace, None).unwrap();
        counts[result[0] as usize] += 1;
    }
    let expected = n as f64 / 10.0;
    for &c in &counts {
        assert!(
            (c as f64 - expected).abs() < expected * 0.25,
            "count {c} too far from expected {expected}"
        );
    }
}

#[test]
fn s4_flipping_a_feature_bit_is_corrupt() {
    let map = two_host_map();
    let mut encoded = map.encode().to_vec();
    // Tunables occupy the last 23 bytes; the feature bitmask (u64 LE) is
    // the 8 bytes immediately before that. Flip its low bit.
    let flip_index = encoded.len() - 23 - 8;
    encoded[flip_index] ^= 0x01;

    let mut buf = Bytes::from(encoded);
    let err = CrushMap::decode(&mut buf);
    assert!(err.is_err());
}

#[test]
fn s5_unknown_type_name_in_rule_step_is_invalid_input() {
    let mut map = CrushMap::new();
    let record = json!({
        "types": [{"type_id": 0, "name": "device"}],
        "trees": [{
            "name": "root0",
            "type": 1,
            "algorithm": "straw2",
            "children": [{"id": 0, "name": "osd.0", "weight": 1.0}]
        }],
        "rules": {
            "replicated": {
                "type": "replicated",
                "steps": [
                    {"op": "take", "arg1": -1},
                    {"op": "chooseleaf_firstn", "arg1": 0, "type": "rack"},
                    {"op": "emit"}
                ]
            }
        }
    });
    let err = parse(&mut map, &record).unwrap_err();
    match err {
        CrushError::InvalidInput(msg) => {
            assert!(msg.contains("replicated"));
            assert!(msg.contains("steps[1]"));
            assert!(msg.contains("rack"));
        }
        other => panic!("expected InvalidInput, got {other:?}"),
    }
}

#[test]
fn s6_straw_without_backward_compatibility_is_not_allowed() {
    let mut map = CrushMap::new();
    let record = json!({
        "types": [],
        "trees": [{
            "name": "root0",
            "type": 1,
            "algorithm": "straw",
            "children": [{"id": 0, "name": "osd.0", "weight": 1.0}]
        }],
        "rules": {}
    });
    let err = parse(&mut map, &record).unwrap_err();
    assert!(matches!(err, CrushError::NotAllowed(_)));
}

#[test]
fn s6_straw_is_allowed_with_backward_compatibility() {
    let mut map = CrushMap::with_options(CrushMapOptions {
        verbose: false,
        backward_compatibility: true,
    });
    let record = json!({
        "types": [],
        "trees": [{
            "name": "root0",
            "type": 1,
            "algorithm": "straw",
            "children": [{"id": 0, "name": "osd.0", "weight": 1.0}]
        }],
        "rules": {}
    });
    parse(&mut map, &record).unwrap();
}

#[test]
fn choose_args_neutral_overlay_matches_unmodified_map() {
    let map = two_host_map();
    let weights = vec![0x10000u32; 4];
    let mut workspace = Workspace::new(&map);

    // host0 is bucket id -2 in this tree (root=-1, host0=-2, host1=-3).
    let mut buckets = HashMap::new();
    buckets.insert(
        -2,
        ChooseArgBucket {
            weight_set: vec![vec![0x10000, 0x10000]],
            ids: Some(vec![0, 1]),
        },
    );
    let mut sets = HashMap::new();
    sets.insert(0, ChooseArgs { buckets });
    let choose_args = ChooseArgsMap { sets };
    let neutral = choose_args.get(0).unwrap();

    for x in 0..100 {
        let base = crush::map(&map, 0, x, 2, &weights, &mut workspace, None).unwrap();
        let overlaid =
            crush::map(&map, 0, x, 2, &weights, &mut workspace, Some(neutral)).unwrap();
        assert_eq!(base, overlaid);
    }
}

#[test]
fn determinism_across_independent_workspaces() {
    let map = two_host_map();
    let weights = vec![0x10000u32; 4];

    let mut ws_a = Workspace::new(&map);
    let mut ws_b = Workspace::new(&map);
    for x in 0..50 {
        let a = crush::map(&map, 0, x, 2, &weights, &mut ws_a, None).unwrap();
        let b = crush::map(&map, 0, x, 2, &weights, &mut ws_b, None).unwrap();
        assert_eq!(a, b);
    }
}

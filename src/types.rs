//! Data model: buckets, rules, tunables, and the map that owns them.

use std::collections::HashMap;

use crate::error::{CrushError, Result};

/// Selection algorithm a bucket uses to pick among its items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BucketAlgorithm {
    Uniform = 1,
    List = 2,
    Straw = 4,
    Straw2 = 5,
}

impl TryFrom<u8> for BucketAlgorithm {
    type Error = CrushError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(BucketAlgorithm::Uniform),
            2 => Ok(BucketAlgorithm::List),
            4 => Ok(BucketAlgorithm::Straw),
            5 => Ok(BucketAlgorithm::Straw2),
            3 => Err(CrushError::not_allowed(
                "tree buckets are not supported by this build",
            )),
            other => Err(CrushError::invalid(format!(
                "unknown bucket algorithm byte {other}"
            ))),
        }
    }
}

impl BucketAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            BucketAlgorithm::Uniform => "uniform",
            BucketAlgorithm::List => "list",
            BucketAlgorithm::Straw => "straw",
            BucketAlgorithm::Straw2 => "straw2",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "uniform" => Ok(BucketAlgorithm::Uniform),
            "list" => Ok(BucketAlgorithm::List),
            "straw" => Ok(BucketAlgorithm::Straw),
            "straw2" => Ok(BucketAlgorithm::Straw2),
            "tree" => Err(CrushError::not_allowed(
                "tree buckets are not supported by this build",
            )),
            other => Err(CrushError::invalid(format!(
                "unknown bucket algorithm name '{other}'"
            ))),
        }
    }

    /// Bit position used by `Tunables::allowed_bucket_algs`.
    pub fn allowed_bit(self) -> u32 {
        1u32 << (self as u32 - 1)
    }
}

/// Rule type, informational: which family of placement a rule targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RuleType {
    Replicated = 1,
    Erasure = 3,
}

impl From<u8> for RuleType {
    fn from(value: u8) -> Self {
        match value {
            3 => RuleType::Erasure,
            _ => RuleType::Replicated,
        }
    }
}

/// Rule step opcode, per spec's bytecode VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RuleOp {
    Noop = 0,
    Take = 1,
    ChooseFirstN = 2,
    ChooseIndep = 3,
    Emit = 4,
    ChooseLeafFirstN = 6,
    ChooseLeafIndep = 7,
    SetChooseTries = 8,
    SetChooseLeafTries = 9,
    SetChooseLocalTries = 10,
    SetChooseLocalFallbackTries = 11,
    SetChooseLeafVaryR = 12,
    SetChooseLeafStable = 13,
}

impl TryFrom<u32> for RuleOp {
    type Error = CrushError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(RuleOp::Noop),
            1 => Ok(RuleOp::Take),
            2 => Ok(RuleOp::ChooseFirstN),
            3 => Ok(RuleOp::ChooseIndep),
            4 => Ok(RuleOp::Emit),
            6 => Ok(RuleOp::ChooseLeafFirstN),
            7 => Ok(RuleOp::ChooseLeafIndep),
            8 => Ok(RuleOp::SetChooseTries),
            9 => Ok(RuleOp::SetChooseLeafTries),
            10 => Ok(RuleOp::SetChooseLocalTries),
            11 => Ok(RuleOp::SetChooseLocalFallbackTries),
            12 => Ok(RuleOp::SetChooseLeafVaryR),
            13 => Ok(RuleOp::SetChooseLeafStable),
            other => Err(CrushError::corrupt(format!(
                "unknown rule step opcode {other}"
            ))),
        }
    }
}

/// A single step in a CRUSH rule.
#[derive(Debug, Clone)]
pub struct CrushRuleStep {
    pub op: RuleOp,
    pub arg1: i32,
    pub arg2: i32,
}

/// A CRUSH rule: an ordered sequence of steps executed by `map()`.
#[derive(Debug, Clone)]
pub struct CrushRule {
    pub rule_id: u32,
    pub rule_type: RuleType,
    pub min_size: u8,
    pub max_size: u8,
    pub steps: Vec<CrushRuleStep>,
}

/// Algorithm-specific per-bucket data.
#[derive(Debug, Clone)]
pub enum BucketData {
    /// All items share one weight; selection uses an incremental
    /// permutation (see `bucket::bucket_uniform_choose`).
    Uniform { item_weight: u32 },
    /// Arbitrary per-item weights, scanned from the most-recently-added
    /// item backwards.
    List {
        item_weights: Vec<u32>,
        sum_weights: Vec<u32>,
    },
    /// Legacy straw: each item draws `hash * straw[i]`, highest wins.
    /// `straws` is precomputed at finalize time from `item_weights`.
    Straw {
        item_weights: Vec<u32>,
        straws: Vec<u32>,
    },
    /// Straw2: each item draws from an exponential distribution scaled
    /// by its own weight, highest draw wins. No precomputed table.
    Straw2 { item_weights: Vec<u32> },
}

impl BucketData {
    pub fn item_weights(&self) -> &[u32] {
        match self {
            BucketData::Uniform { .. } => &[],
            BucketData::List { item_weights, .. } => item_weights,
            BucketData::Straw { item_weights, .. } => item_weights,
            BucketData::Straw2 { item_weights } => item_weights,
        }
    }
}

/// A bucket: an internal node of the placement hierarchy, holding
/// either devices (non-negative item ids) or other buckets (negative
/// item ids).
#[derive(Debug, Clone)]
pub struct CrushBucket {
    /// Bucket id; always negative.
    pub id: i32,
    /// Hierarchy type (host, rack, datacenter, root, ...), caller-defined.
    pub bucket_type: i32,
    pub alg: BucketAlgorithm,
    /// Hash function selector. Only 0 (rjenkins1) is defined.
    pub hash: u8,
    /// Total weight, 16.16 fixed point; sum of item weights unless
    /// `has_bucket_weights` overrides it.
    pub weight: u32,
    /// Set when `weight` was given explicitly rather than derived from
    /// the sum of item weights; `finalize::recompute_weights` leaves
    /// such buckets alone instead of overwriting them.
    pub has_bucket_weights: bool,
    pub size: u32,
    /// Item ids: non-negative are devices, negative are child buckets.
    pub items: Vec<i32>,
    pub data: BucketData,
}

/// Tunable parameters controlling retry and descent behavior.
///
/// Defaults match the parse-time defaults of Ceph's own JSON/Python
/// loader (`original_source/crush/libcrush/libcrush.c`), not the
/// all-zero defaults of a freshly `CrushMap::new()`'d map before any
/// input has been loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tunables {
    pub choose_local_tries: u32,
    pub choose_local_fallback_tries: u32,
    pub choose_total_tries: u32,
    pub chooseleaf_descend_once: u32,
    pub chooseleaf_vary_r: u8,
    pub chooseleaf_stable: u8,
    pub straw_calc_version: u8,
    /// Bitmask of `BucketAlgorithm::allowed_bit()` values; 0 means "all
    /// algorithms allowed" (the wire-format convention).
    pub allowed_bucket_algs: u32,
}

impl Default for Tunables {
    fn default() -> Self {
        Tunables {
            choose_local_tries: 0,
            choose_local_fallback_tries: 0,
            choose_total_tries: 50,
            chooseleaf_descend_once: 1,
            chooseleaf_vary_r: 1,
            chooseleaf_stable: 1,
            straw_calc_version: 1,
            allowed_bucket_algs: 0,
        }
    }
}

impl Tunables {
    pub fn is_algorithm_allowed(&self, alg: BucketAlgorithm) -> bool {
        self.allowed_bucket_algs == 0 || self.allowed_bucket_algs & alg.allowed_bit() != 0
    }
}

/// Options accepted by `CrushMap::new`/the loader; the crate's entire
/// configuration surface (see spec's external interface).
#[derive(Debug, Clone, Copy, Default)]
pub struct CrushMapOptions {
    pub verbose: bool,
    pub backward_compatibility: bool,
}

/// A fully built CRUSH map: buckets, rules, name tables, and tunables.
#[derive(Debug, Clone)]
pub struct CrushMap {
    pub max_buckets: i32,
    pub max_devices: i32,
    pub max_rules: u32,
    /// Indexed by `-1 - bucket_id`.
    pub buckets: Vec<Option<CrushBucket>>,
    pub rules: Vec<Option<CrushRule>>,
    pub type_names: HashMap<i32, String>,
    pub names: HashMap<i32, String>,
    pub rule_names: HashMap<u32, String>,
    pub tunables: Tunables,
    pub options: CrushMapOptions,
    /// Parent of each bucket (by slot index, matching `buckets`), set by
    /// `finalize()`. `None` for buckets with no known parent (roots).
    pub(crate) parents: Vec<Option<i32>>,
}

impl CrushMap {
    pub fn new() -> Self {
        CrushMap::with_options(CrushMapOptions::default())
    }

    pub fn with_options(options: CrushMapOptions) -> Self {
        CrushMap {
            max_buckets: 0,
            max_devices: 0,
            max_rules: 0,
            buckets: Vec::new(),
            rules: Vec::new(),
            type_names: HashMap::new(),
            names: HashMap::new(),
            rule_names: HashMap::new(),
            tunables: Tunables::default(),
            options,
            parents: Vec::new(),
        }
    }

    pub fn get_bucket(&self, id: i32) -> Result<&CrushBucket> {
        if id >= 0 {
            return Err(CrushError::invalid(format!(
                "{id} is a device id, not a bucket id"
            )));
        }
        let index = (-1 - id) as usize;
        self.buckets
            .get(index)
            .and_then(|b| b.as_ref())
            .ok_or_else(|| CrushError::not_found(format!("bucket {id}")))
    }

    pub fn get_rule(&self, rule_id: u32) -> Result<&CrushRule> {
        self.rules
            .get(rule_id as usize)
            .and_then(|r| r.as_ref())
            .ok_or_else(|| CrushError::not_found(format!("rule {rule_id}")))
    }

    /// Name of a bucket or device id, if one was assigned.
    pub fn name_of(&self, id: i32) -> Option<&str> {
        self.names.get(&id).map(String::as_str)
    }

    pub fn type_name_of(&self, type_id: i32) -> Option<&str> {
        self.type_names.get(&type_id).map(String::as_str)
    }

    pub fn rule_name_of(&self, rule_id: u32) -> Option<&str> {
        self.rule_names.get(&rule_id).map(String::as_str)
    }

    /// Parent bucket id of a bucket, as computed by the last `finalize()`.
    pub fn parent_of(&self, bucket_id: i32) -> Option<i32> {
        if bucket_id >= 0 {
            return None;
        }
        let index = (-1 - bucket_id) as usize;
        self.parents.get(index).copied().flatten()
    }
}

impl Default for CrushMap {
    fn default() -> Self {
        Self::new()
    }
}

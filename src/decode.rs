//! Binary wire format: little-endian, magic-prefixed, with a feature
//! bitmask gating optional trailing sections so old and new encodings
//! stay mutually parseable.
//!
//! Ceph's own `CrushWrapper::decode` leans on `ENCODE_START`/
//! `DECODE_START` struct-versioning macros from the `denc` framework;
//! this crate drops that dependency (see DESIGN.md) in favor of an
//! explicit feature bitmask read once, up front, rather than guessing
//! field presence from `buf.remaining()` as this crate's prior revision
//! did — a heuristic that silently breaks the moment a new optional
//! field is appended after the ones it already knows about.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use crate::error::{CrushError, Result};
use crate::types::*;

pub(crate) const CRUSH_MAGIC: u32 = 0x0001_0000;

/// This crate's own wire format revision, not a Ceph on-disk version.
pub(crate) const FORMAT_VERSION: u32 = 1;

pub(crate) const FEATURE_TUNABLES: u64 = 1 << 0;
pub(crate) const FEATURE_CHOOSE_ARGS: u64 = 1 << 1;

#[inline]
fn decode_u8(buf: &mut impl Buf, context: &str) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(CrushError::corrupt(format!(
            "insufficient bytes for u8 ({context}): need 1, have {}",
            buf.remaining()
        )));
    }
    Ok(buf.get_u8())
}

#[inline]
fn decode_u16(buf: &mut impl Buf, context: &str) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(CrushError::corrupt(format!(
            "insufficient bytes for u16 ({context}): need 2, have {}",
            buf.remaining()
        )));
    }
    Ok(buf.get_u16_le())
}

#[inline]
fn decode_u32(buf: &mut impl Buf, context: &str) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(CrushError::corrupt(format!(
            "insufficient bytes for u32 ({context}): need 4, have {}",
            buf.remaining()
        )));
    }
    Ok(buf.get_u32_le())
}

#[inline]
fn decode_u64(buf: &mut impl Buf, context: &str) -> Result<u64> {
    if buf.remaining() < 8 {
        return Err(CrushError::corrupt(format!(
            "insufficient bytes for u64 ({context}): need 8, have {}",
            buf.remaining()
        )));
    }
    Ok(buf.get_u64_le())
}

#[inline]
fn decode_i32(buf: &mut impl Buf, context: &str) -> Result<i32> {
    if buf.remaining() < 4 {
        return Err(CrushError::corrupt(format!(
            "insufficient bytes for i32 ({context}): need 4, have {}",
            buf.remaining()
        )));
    }
    Ok(buf.get_i32_le())
}

impl CrushMap {
    /// Decode a CRUSH map from its binary wire form.
    pub fn decode(data: &mut Bytes) -> Result<Self> {
        let magic = decode_u32(data, "magic number")?;
        if magic != CRUSH_MAGIC {
            return Err(CrushError::corrupt(format!(
                "invalid magic 0x{magic:x}, expected 0x{CRUSH_MAGIC:x}"
            )));
        }
        let format_version = decode_u32(data, "format version")?;
        if format_version != FORMAT_VERSION {
            return Err(CrushError::corrupt(format!(
                "unsupported wire format version {format_version}"
            )));
        }

        let max_buckets = decode_i32(data, "max_buckets")?;
        let max_rules = decode_u32(data, "max_rules")?;
        let max_devices = decode_i32(data, "max_devices")?;

        if max_buckets < 0 {
            return Err(CrushError::corrupt("negative max_buckets"));
        }

        let mut map = CrushMap::new();
        map.max_buckets = max_buckets;
        map.max_rules = max_rules;
        map.max_devices = max_devices;

        map.buckets = Vec::with_capacity(max_buckets as usize);
        for i in 0..max_buckets {
            let alg = decode_u32(data, &format!("bucket {i} algorithm"))?;
            if alg == 0 {
                map.buckets.push(None);
                continue;
            }
            map.buckets.push(Some(decode_bucket(data, alg)?));
        }

        map.rules = Vec::with_capacity(max_rules as usize);
        for _ in 0..max_rules {
            let exists = decode_u32(data, "rule existence flag")?;
            if exists == 0 {
                map.rules.push(None);
                continue;
            }
            map.rules.push(Some(decode_rule(data)?));
        }

        map.type_names = decode_i32_string_map(data)?;
        map.names = decode_i32_string_map(data)?;
        map.rule_names = decode_u32_string_map(data)?;

        let features = decode_u64(data, "feature bitmask")?;

        if features & FEATURE_TUNABLES != 0 {
            map.tunables.choose_local_tries = decode_u32(data, "choose_local_tries")?;
            map.tunables.choose_local_fallback_tries =
                decode_u32(data, "choose_local_fallback_tries")?;
            map.tunables.choose_total_tries = decode_u32(data, "choose_total_tries")?;
            map.tunables.chooseleaf_descend_once = decode_u32(data, "chooseleaf_descend_once")?;
            map.tunables.chooseleaf_vary_r = decode_u8(data, "chooseleaf_vary_r")?;
            map.tunables.straw_calc_version = decode_u8(data, "straw_calc_version")?;
            map.tunables.allowed_bucket_algs = decode_u32(data, "allowed_bucket_algs")?;
            map.tunables.chooseleaf_stable = decode_u8(data, "chooseleaf_stable")?;
        }

        if features & FEATURE_CHOOSE_ARGS != 0 {
            // Choose-args are decoded by the caller via `decode_choose_args`
            // once the map they apply to is available; here we only skip
            // past them so trailing data (if any) stays aligned.
            let len = decode_u32(data, "choose_args block length")? as usize;
            if data.remaining() < len {
                return Err(CrushError::corrupt(
                    "choose_args block length exceeds remaining data",
                ));
            }
            data.advance(len);
        }

        if data.has_remaining() {
            return Err(CrushError::corrupt(format!(
                "{} trailing byte(s) after a fully-parsed map; feature bitmask likely doesn't match payload",
                data.remaining()
            )));
        }

        crate::finalize::rebuild_hierarchy(&mut map)?;
        Ok(map)
    }
}

fn decode_bucket(data: &mut Bytes, alg: u32) -> Result<CrushBucket> {
    let id = decode_i32(data, "bucket id")?;
    if id >= 0 {
        return Err(CrushError::corrupt(format!(
            "bucket id {id} is not negative"
        )));
    }
    let bucket_type = decode_u16(data, "bucket type")?;
    let alg_byte = decode_u8(data, "bucket alg")?;
    let hash = decode_u8(data, "bucket hash")?;
    let weight = decode_u32(data, "bucket weight")?;
    let size = decode_u32(data, "bucket size")?;

    if alg_byte as u32 != alg {
        return Err(CrushError::corrupt(format!(
            "algorithm mismatch: header says {alg}, bucket says {alg_byte}"
        )));
    }
    if size > 10_000 {
        return Err(CrushError::corrupt(format!("bucket size too large: {size}")));
    }

    let items_bytes = size
        .checked_mul(4)
        .ok_or_else(|| CrushError::corrupt(format!("bucket size overflow: {size}")))?;
    if data.remaining() < items_bytes as usize {
        return Err(CrushError::corrupt(format!(
            "not enough data for bucket items: need {items_bytes}, have {}",
            data.remaining()
        )));
    }

    let mut items = Vec::with_capacity(size as usize);
    for i in 0..size {
        items.push(decode_i32(data, &format!("bucket item {i}"))?);
    }

    let algorithm = BucketAlgorithm::try_from(alg_byte)?;

    let bucket_data = match algorithm {
        BucketAlgorithm::Uniform => {
            let item_weight = decode_u32(data, "uniform bucket item_weight")?;
            BucketData::Uniform { item_weight }
        }
        BucketAlgorithm::List => {
            let mut item_weights = Vec::with_capacity(size as usize);
            let mut sum_weights = Vec::with_capacity(size as usize);
            for i in 0..size {
                item_weights.push(decode_u32(data, &format!("list item_weight {i}"))?);
                sum_weights.push(decode_u32(data, &format!("list sum_weight {i}"))?);
            }
            BucketData::List {
                item_weights,
                sum_weights,
            }
        }
        BucketAlgorithm::Straw => {
            let mut item_weights = Vec::with_capacity(size as usize);
            let mut straws = Vec::with_capacity(size as usize);
            for i in 0..size {
                item_weights.push(decode_u32(data, &format!("straw item_weight {i}"))?);
                straws.push(decode_u32(data, &format!("straw straw {i}"))?);
            }
            BucketData::Straw {
                item_weights,
                straws,
            }
        }
        BucketAlgorithm::Straw2 => {
            let mut item_weights = Vec::with_capacity(size as usize);
            for i in 0..size {
                item_weights.push(decode_u32(data, &format!("straw2 item_weight {i}"))?);
            }
            BucketData::Straw2 { item_weights }
        }
    };

    Ok(CrushBucket {
        id,
        bucket_type: bucket_type as i32,
        alg: algorithm,
        hash,
        weight,
        // wire-supplied weight is authoritative; nothing should recompute it.
        has_bucket_weights: true,
        size,
        items,
        data: bucket_data,
    })
}

fn decode_rule(data: &mut Bytes) -> Result<CrushRule> {
    let len = decode_u32(data, "rule length")?;
    let rule_id = decode_u8(data, "rule_id")? as u32;
    let rule_type = decode_u8(data, "rule_type")?;
    let min_size = decode_u8(data, "min_size")?;
    let max_size = decode_u8(data, "max_size")?;

    let mut steps = Vec::with_capacity(len as usize);
    for i in 0..len {
        let op = decode_u32(data, &format!("rule step {i} op"))?;
        let arg1 = decode_i32(data, &format!("rule step {i} arg1"))?;
        let arg2 = decode_i32(data, &format!("rule step {i} arg2"))?;
        steps.push(CrushRuleStep {
            op: RuleOp::try_from(op)?,
            arg1,
            arg2,
        });
    }

    Ok(CrushRule {
        rule_id,
        rule_type: RuleType::from(rule_type),
        min_size,
        max_size,
        steps,
    })
}

fn decode_i32_string_map(data: &mut Bytes) -> Result<HashMap<i32, String>> {
    let len = decode_u32(data, "i32 map length")?;
    let mut map = HashMap::with_capacity(len as usize);
    for i in 0..len {
        let key = decode_i32(data, &format!("i32 map key {i}"))?;
        let str_len = decode_u32(data, &format!("i32 map string length {i}"))?;
        if data.remaining() < str_len as usize {
            return Err(CrushError::corrupt(format!(
                "not enough data for string: need {str_len}, have {}",
                data.remaining()
            )));
        }
        let mut bytes = vec![0u8; str_len as usize];
        data.copy_to_slice(&mut bytes);
        let value = String::from_utf8(bytes)
            .map_err(|e| CrushError::corrupt(format!("invalid utf-8: {e}")))?;
        map.insert(key, value);
    }
    Ok(map)
}

fn decode_u32_string_map(data: &mut Bytes) -> Result<HashMap<u32, String>> {
    let len = decode_u32(data, "u32 map length")?;
    let mut map = HashMap::with_capacity(len as usize);
    for i in 0..len {
        let key = decode_u32(data, &format!("u32 map key {i}"))?;
        let str_len = decode_u32(data, &format!("u32 map string length {i}"))?;
        if data.remaining() < str_len as usize {
            return Err(CrushError::corrupt(format!(
                "not enough data for string: need {str_len}, have {}",
                data.remaining()
            )));
        }
        let mut bytes = vec![0u8; str_len as usize];
        data.copy_to_slice(&mut bytes);
        let value = String::from_utf8(bytes)
            .map_err(|e| CrushError::corrupt(format!("invalid utf-8: {e}")))?;
        map.insert(key, value);
    }
    Ok(map)
}

pub(crate) fn encode_i32_string_map(buf: &mut BytesMut, map: &HashMap<i32, String>) {
    buf.put_u32_le(map.len() as u32);
    for (key, value) in map {
        buf.put_i32_le(*key);
        buf.put_u32_le(value.len() as u32);
        buf.put_slice(value.as_bytes());
    }
}

pub(crate) fn encode_u32_string_map(buf: &mut BytesMut, map: &HashMap<u32, String>) {
    buf.put_u32_le(map.len() as u32);
    for (key, value) in map {
        buf.put_u32_le(*key);
        buf.put_u32_le(value.len() as u32);
        buf.put_slice(value.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_magic() {
        let mut data = Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef]);
        assert!(matches!(
            CrushMap::decode(&mut data),
            Err(CrushError::Corrupt(_))
        ));
    }

    #[test]
    fn rejects_truncated_header() {
        let mut data = Bytes::from_static(&CRUSH_MAGIC.to_le_bytes());
        assert!(matches!(
            CrushMap::decode(&mut data),
            Err(CrushError::Corrupt(_))
        ));
    }
}

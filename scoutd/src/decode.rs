//! Wire decoding for per-OU ring records: `u32 ou_index`, `u32 pid`, the
//! feature struct, then the metrics struct, field order fixed by the
//! schema. Producer and consumer share the machine, so values are read in
//! native byte order at the schema's C offsets.

use std::fmt;

use anyhow::{bail, Result};
use planscout_common::{FieldKind, ResourceMetrics};

use crate::schema::{OuSchema, RECORD_HEADER_BYTES};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FeatureValue {
    Bool(bool),
    I16(i16),
    I32(i32),
    I64(i64),
    F64(f64),
    Ptr(u64),
    Len(u32),
}

impl fmt::Display for FeatureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureValue::Bool(v) => write!(f, "{}", *v as u8),
            FeatureValue::I16(v) => write!(f, "{v}"),
            FeatureValue::I32(v) => write!(f, "{v}"),
            FeatureValue::I64(v) => write!(f, "{v}"),
            FeatureValue::F64(v) => write!(f, "{v}"),
            FeatureValue::Ptr(v) => write!(f, "{v:#x}"),
            FeatureValue::Len(v) => write!(f, "{v}"),
        }
    }
}

/// One decoded observation, ready for the per-OU sink.
#[derive(Clone, Debug)]
pub struct Record {
    pub ou_index: u32,
    pub pid: u32,
    pub features: Vec<FeatureValue>,
    pub metrics: ResourceMetrics,
}

pub fn decode_record(schema: &OuSchema, bytes: &[u8]) -> Result<Record> {
    if bytes.len() != schema.record_size() {
        bail!(
            "{} record is {} bytes, expected {}",
            schema.name,
            bytes.len(),
            schema.record_size()
        );
    }

    let ou_index = u32::from_ne_bytes(bytes[0..4].try_into().unwrap());
    let pid = u32::from_ne_bytes(bytes[4..8].try_into().unwrap());
    if ou_index != schema.index {
        bail!(
            "record on the {} ring carries ou_index {}",
            schema.name,
            ou_index
        );
    }

    let layout = schema.layout();
    let feature_bytes = &bytes[RECORD_HEADER_BYTES..RECORD_HEADER_BYTES + layout.size];
    let mut features = Vec::with_capacity(schema.features.len());
    for (field, &offset) in schema.features.iter().zip(&layout.offsets) {
        let raw = &feature_bytes[offset..offset + field.kind.width()];
        features.push(match field.kind {
            FieldKind::Bool => FeatureValue::Bool(raw[0] != 0),
            FieldKind::Int16 => FeatureValue::I16(i16::from_ne_bytes(raw.try_into().unwrap())),
            FieldKind::Int32 => FeatureValue::I32(i32::from_ne_bytes(raw.try_into().unwrap())),
            FieldKind::Int64 => FeatureValue::I64(i64::from_ne_bytes(raw.try_into().unwrap())),
            FieldKind::Float64 => {
                FeatureValue::F64(f64::from_ne_bytes(raw.try_into().unwrap()))
            }
            FieldKind::Ptr => FeatureValue::Ptr(u64::from_ne_bytes(raw.try_into().unwrap())),
            FieldKind::ListLen => FeatureValue::Len(u32::from_ne_bytes(raw.try_into().unwrap())),
        });
    }

    let metrics =
        bytemuck::pod_read_unaligned(&bytes[RECORD_HEADER_BYTES + layout.size..]);

    Ok(Record {
        ou_index,
        pid,
        features,
        metrics,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::schema::{default_catalog, parse_catalog};
    use planscout_common::OuIndex;

    /// Assemble a seq_scan wire record the way the collector lays it out.
    pub(crate) fn seq_scan_record_bytes(
        plan_node_id: i32,
        query_id: i64,
        relid: i32,
        metrics: &ResourceMetrics,
    ) -> Vec<u8> {
        let mut bytes = vec![0u8; 8 + 64];
        bytes[0..4].copy_from_slice(&(OuIndex::SeqScan as u32).to_ne_bytes());
        bytes[4..8].copy_from_slice(&metrics.pid.to_ne_bytes());
        let feat = &mut bytes[8..];
        feat[0..4].copy_from_slice(&plan_node_id.to_ne_bytes());
        feat[8..16].copy_from_slice(&query_id.to_ne_bytes());
        feat[16..24].copy_from_slice(&0xAAu64.to_ne_bytes());
        feat[24..28].copy_from_slice(&(-1i32).to_ne_bytes());
        feat[28..32].copy_from_slice(&(-1i32).to_ne_bytes());
        feat[32..40].copy_from_slice(&1_000i64.to_ne_bytes());
        feat[40..44].copy_from_slice(&relid.to_ne_bytes());
        feat[48..56].copy_from_slice(&123.5f64.to_ne_bytes());
        feat[56..60].copy_from_slice(&16i32.to_ne_bytes());
        bytes.extend_from_slice(bytemuck::bytes_of(metrics));
        bytes
    }

    fn seq_scan_schema() -> OuSchema {
        parse_catalog(default_catalog()).unwrap().remove(0)
    }

    #[test]
    fn seq_scan_record_roundtrips_field_by_field() {
        let metrics = ResourceMetrics {
            start_time_us: 100,
            end_time_us: 160,
            elapsed_us: 60,
            instructions: 250,
            cpu_id: 2,
            pid: 4242,
            ..Default::default()
        };
        let bytes = seq_scan_record_bytes(7, 42, 100, &metrics);
        let record = decode_record(&seq_scan_schema(), &bytes).unwrap();

        assert_eq!(record.ou_index, OuIndex::SeqScan as u32);
        assert_eq!(record.pid, 4242);
        assert_eq!(record.features[0], FeatureValue::I32(7));
        assert_eq!(record.features[1], FeatureValue::I64(42));
        assert_eq!(record.features[2], FeatureValue::Ptr(0xAA));
        assert_eq!(record.features[3], FeatureValue::I32(-1));
        assert_eq!(record.features[6], FeatureValue::I32(100));
        assert_eq!(record.features[7], FeatureValue::F64(123.5));
        assert_eq!(record.metrics.elapsed_us, 60);
        assert_eq!(record.metrics.instructions, 250);
        assert!(record.metrics.end_time_us >= record.metrics.start_time_us);
    }

    #[test]
    fn short_record_is_rejected() {
        let schema = seq_scan_schema();
        let err = decode_record(&schema, &[0u8; 16]).unwrap_err();
        assert!(err.to_string().contains("expected"));
    }

    #[test]
    fn mismatched_ou_index_is_rejected() {
        let metrics = ResourceMetrics::default();
        let mut bytes = seq_scan_record_bytes(1, 1, 1, &metrics);
        bytes[0..4].copy_from_slice(&(OuIndex::Agg as u32).to_ne_bytes());
        assert!(decode_record(&seq_scan_schema(), &bytes).is_err());
    }
}

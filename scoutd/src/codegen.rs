//! Code generation for the per-OU collector programs: textual substitution
//! over three templates (collector prelude, per-OU markers program, common
//! probes) producing the generated source compiled into the collector
//! object. The substitution vocabulary is closed; nothing outside
//! [`VOCABULARY`] is replaced.

use planscout_common::{FieldKind, METRIC_FIELD_NAMES};

use crate::schema::OuSchema;

const PRELUDE: &str = include_str!("../templates/collector_prelude.rs.in");
const OU_MARKERS: &str = include_str!("../templates/ou_markers.rs.in");
const COMMON_PROBES: &str = include_str!("../templates/common_probes.rs.in");

pub const SUBST_OU: &str = "SUBST_OU";
pub const SUBST_INDEX: &str = "SUBST_INDEX";
pub const SUBST_FEATURES: &str = "SUBST_FEATURES";
pub const SUBST_METRICS: &str = "SUBST_METRICS";
pub const SUBST_FIRST_FEATURE: &str = "SUBST_FIRST_FEATURE";
pub const SUBST_FIRST_METRIC: &str = "SUBST_FIRST_METRIC";
pub const SUBST_READARGS: &str = "SUBST_READARGS";
pub const SUBST_ACCUMULATE: &str = "SUBST_ACCUMULATE";

pub const VOCABULARY: [&str; 8] = [
    SUBST_OU,
    SUBST_INDEX,
    SUBST_FEATURES,
    SUBST_METRICS,
    SUBST_FIRST_METRIC,
    SUBST_FIRST_FEATURE,
    SUBST_READARGS,
    SUBST_ACCUMULATE,
];

/// Generate the collector source for the given schemas: prelude, one
/// markers block per OU, then the common probes.
pub fn generate(schemas: &[OuSchema]) -> String {
    // The wire name `start_time` is the struct field `start_time_us`.
    let mut out = PRELUDE
        .replace(SUBST_ACCUMULATE, &accumulate_doc())
        .replace(SUBST_METRICS, "ResourceMetrics")
        .replace(SUBST_FIRST_METRIC, "start_time_us");
    for schema in schemas {
        let (decls, reads) = feature_source(schema);
        let block = OU_MARKERS
            .replace(SUBST_FIRST_FEATURE, &schema.features[0].name)
            .replace(SUBST_FEATURES, &decls)
            .replace(SUBST_READARGS, &reads)
            .replace(SUBST_OU, &schema.name)
            .replace(SUBST_INDEX, &schema.index.to_string());
        out.push('\n');
        out.push_str(&block);
    }
    out.push('\n');
    out.push_str(COMMON_PROBES);
    out
}

/// The metric fields summed by END accumulation, for the generated
/// artifact's protocol documentation. Everything except the four fields
/// with keep/overwrite semantics.
fn accumulate_doc() -> String {
    let summed: Vec<&str> = METRIC_FIELD_NAMES
        .iter()
        .copied()
        .filter(|name| !matches!(*name, "start_time" | "end_time" | "cpu_id" | "pid"))
        .collect();
    format!(
        "sum\n//! {},\n//! {},\n//! {}",
        summed[..4].join(", "),
        summed[4..8].join(", "),
        summed[8..].join(", ")
    )
}

fn rust_type(kind: FieldKind) -> &'static str {
    match kind {
        FieldKind::Bool => "u8",
        FieldKind::Int16 => "i16",
        FieldKind::Int32 => "i32",
        FieldKind::Int64 => "i64",
        FieldKind::Float64 => "f64",
        FieldKind::Ptr => "u64",
        FieldKind::ListLen => "u32",
    }
}

fn read_expr(kind: FieldKind, arg: usize) -> String {
    match kind {
        FieldKind::Bool => format!("(args[{arg}] != 0) as u8"),
        FieldKind::Int16 => format!("args[{arg}] as u16 as i16"),
        FieldKind::Int32 => format!("args[{arg}] as u32 as i32"),
        FieldKind::Int64 => format!("args[{arg}] as i64"),
        FieldKind::Float64 => format!("f64::from_bits(args[{arg}])"),
        FieldKind::Ptr => format!("args[{arg}]"),
        FieldKind::ListLen => format!("args[{arg}] as u32"),
    }
}

/// Field declarations and `from_args` initializers, with explicit padding
/// so every byte of the stored struct is initialized.
fn feature_source(schema: &OuSchema) -> (String, String) {
    let mut decls = Vec::new();
    let mut reads = Vec::new();
    let mut offset = 0usize;
    let mut pad_n = 0usize;
    for (arg, field) in schema.features.iter().enumerate() {
        let width = field.kind.width();
        if offset % width != 0 {
            let pad = width - offset % width;
            decls.push(format!("    pub _pad{pad_n}: [u8; {pad}],"));
            reads.push(format!("            _pad{pad_n}: [0; {pad}],"));
            pad_n += 1;
            offset += pad;
        }
        decls.push(format!(
            "    pub {}: {},",
            field.name,
            rust_type(field.kind)
        ));
        reads.push(format!(
            "            {}: {},",
            field.name,
            read_expr(field.kind, arg)
        ));
        offset += width;
    }
    if offset % 8 != 0 {
        let pad = 8 - offset % 8;
        decls.push(format!("    pub _pad{pad_n}: [u8; {pad}],"));
        reads.push(format!("            _pad{pad_n}: [0; {pad}],"));
    }
    (decls.join("\n"), reads.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{default_catalog, parse_catalog};

    fn generated() -> String {
        generate(&parse_catalog(default_catalog()).unwrap())
    }

    #[test]
    fn vocabulary_is_fully_substituted() {
        let out = generated();
        assert!(
            !out.contains("SUBST_"),
            "unreplaced substitution key in generated source"
        );
        for key in VOCABULARY {
            assert!(
                PRELUDE.contains(key) || OU_MARKERS.contains(key) || key == SUBST_ACCUMULATE,
                "{key} unused by every template"
            );
        }
    }

    #[test]
    fn every_ou_gets_a_program_block() {
        let out = generated();
        for schema in parse_catalog(default_catalog()).unwrap() {
            assert!(out.contains(&format!(
                "ou_programs!({}, {}, {}_features);",
                schema.name, schema.index, schema.name
            )));
            assert!(out.contains(&format!("pub struct {}_features {{", schema.name)));
        }
        assert!(out.contains("postmaster_fork_backend"));
    }

    #[test]
    fn padding_is_explicit_and_placed() {
        let out = generated();
        // Common prefix: i32 then i64 forces a 4-byte pad.
        assert!(out.contains("    pub plan_node_id: i32,\n    pub _pad0: [u8; 4],"));
        // hash: one bool after the prefix leaves 7 tail-pad bytes.
        assert!(out.contains("    pub skew_optimized: u8,\n    pub _pad1: [u8; 7],"));
        // agg: i32 + i16 leaves 2 tail-pad bytes.
        assert!(out.contains("    pub num_group_cols: i16,\n    pub _pad1: [u8; 2],"));
    }

    #[test]
    fn readargs_promote_and_reinterpret() {
        let out = generated();
        assert!(out.contains("plan_rows: f64::from_bits(args[7])"));
        assert!(out.contains("hash_clauses_len: args[7] as u32"));
        assert!(out.contains("skew_optimized: (args[6] != 0) as u8"));
        assert!(out.contains("statement_start_ts: args[5] as i64"));
    }

    #[test]
    fn generated_source_matches_the_committed_artifact() {
        let committed = include_str!("../../planscout-ebpf/src/generated.rs");
        assert_eq!(generated(), committed);
    }
}

//! Schema extraction: parse the server's operating-unit catalog header
//! into per-OU feature schemas. This is the only place that knows about
//! the OU catalog; codegen and record decoding both work from the
//! schemas produced here.

use anyhow::{bail, Context, Result};
use planscout_common::{FieldKind, ResourceMetrics, MARKER_MAX_ARGS, NUM_MARKER_EVENTS};

pub const RECORD_HEADER_BYTES: usize = 8;

#[derive(Clone, Debug, PartialEq)]
pub struct Field {
    pub name: String,
    pub kind: FieldKind,
}

#[derive(Clone, Debug)]
pub struct OuSchema {
    pub index: u32,
    pub name: String,
    pub features: Vec<Field>,
}

/// C-layout placement of the feature struct: one byte offset per field,
/// plus the padded struct size.
#[derive(Clone, Debug)]
pub struct FeatureLayout {
    pub offsets: Vec<usize>,
    pub size: usize,
}

impl OuSchema {
    pub fn struct_name(&self) -> String {
        format!("{}_features", self.name)
    }

    /// Map name of this OU's result ring in the collector object.
    pub fn ring_map_name(&self) -> String {
        format!("RESULTS_{}", self.name.to_uppercase())
    }

    /// Collector program names, begin/end/features/flush.
    pub fn program_names(&self) -> [String; NUM_MARKER_EVENTS] {
        [
            format!("{}_begin", self.name),
            format!("{}_end", self.name),
            format!("{}_features", self.name),
            format!("{}_flush", self.name),
        ]
    }

    /// Marker anchor symbols in the server binary, same order.
    pub fn anchor_symbols(&self) -> [String; NUM_MARKER_EVENTS] {
        self.program_names()
            .map(|name| format!("planscout_{name}"))
    }

    pub fn layout(&self) -> FeatureLayout {
        let mut offsets = Vec::with_capacity(self.features.len());
        let mut offset = 0usize;
        for field in &self.features {
            let width = field.kind.width();
            if offset % width != 0 {
                offset += width - offset % width;
            }
            offsets.push(offset);
            offset += width;
        }
        if offset % 8 != 0 {
            offset += 8 - offset % 8;
        }
        FeatureLayout {
            offsets,
            size: offset,
        }
    }

    /// Total wire size of one record on this OU's ring:
    /// header ++ features ++ metrics.
    pub fn record_size(&self) -> usize {
        RECORD_HEADER_BYTES + self.layout().size + std::mem::size_of::<ResourceMetrics>()
    }
}

/// The catalog header shipped with the coordinator.
pub fn default_catalog() -> &'static str {
    include_str!("../schemas/operating_units.h")
}

/// Parse an OU catalog header: one `enum ou_index` block plus one
/// `struct ou_<name>_features` block per enum entry.
pub fn parse_catalog(text: &str) -> Result<Vec<OuSchema>> {
    let text = strip_comments(text);
    let entries = parse_index_enum(&text)?;

    let mut schemas = Vec::with_capacity(entries.len());
    let mut seen = std::collections::HashSet::new();
    for (name, index) in entries {
        if !seen.insert(index) {
            bail!("duplicate ou_index value {index} ({name})");
        }
        let features = parse_features_struct(&text, &name)
            .with_context(|| format!("features for operating unit {name}"))?;
        if features.len() > MARKER_MAX_ARGS {
            bail!(
                "operating unit {name} declares {} feature fields; markers carry at most {}",
                features.len(),
                MARKER_MAX_ARGS
            );
        }
        schemas.push(OuSchema {
            index,
            name,
            features,
        });
    }

    schemas.sort_by_key(|s| s.index);
    for (position, schema) in schemas.iter().enumerate() {
        if schema.index as usize != position {
            bail!(
                "ou_index values must be dense from zero; {} has index {}",
                schema.name,
                schema.index
            );
        }
    }
    Ok(schemas)
}

fn strip_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("/*") {
        out.push_str(&rest[..start]);
        match rest[start..].find("*/") {
            Some(end) => rest = &rest[start + end + 2..],
            None => return out,
        }
    }
    out.push_str(rest);
    out.lines()
        .map(|line| line.split("//").next().unwrap_or(""))
        .collect::<Vec<_>>()
        .join("\n")
}

fn parse_index_enum(text: &str) -> Result<Vec<(String, u32)>> {
    let body = block_body(text, "enum ou_index").context("enum ou_index not found")?;
    let mut entries = Vec::new();
    for item in body.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let (name, value) = item
            .split_once('=')
            .with_context(|| format!("enum entry {item:?} has no explicit value"))?;
        let name = name.trim();
        let ou_name = name
            .strip_prefix("OU_")
            .with_context(|| format!("enum entry {name:?} lacks the OU_ prefix"))?
            .to_lowercase();
        let value: u32 = value
            .trim()
            .parse()
            .with_context(|| format!("enum entry {name:?} has a non-numeric value"))?;
        entries.push((ou_name, value));
    }
    if entries.is_empty() {
        bail!("enum ou_index declares no operating units");
    }
    Ok(entries)
}

fn parse_features_struct(text: &str, ou_name: &str) -> Result<Vec<Field>> {
    let header = format!("struct ou_{ou_name}_features");
    let body = block_body(text, &header).with_context(|| format!("{header} not found"))?;

    let mut fields = Vec::new();
    for line in body.split(';') {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut tokens = line.split_whitespace();
        let c_type = tokens.next().context("field declaration missing a type")?;
        let name = tokens
            .next()
            .with_context(|| format!("field of type {c_type:?} missing a name"))?;
        if tokens.next().is_some() {
            bail!("unsupported field declaration {line:?}");
        }
        let kind = FieldKind::from_c_type(c_type)
            .with_context(|| format!("field {name}: unsupported C type {c_type:?}"))?;
        let name = match kind {
            // List-valued fields contribute their length.
            FieldKind::ListLen => format!("{name}_len"),
            _ => name.to_string(),
        };
        fields.push(Field { name, kind });
    }
    if fields.is_empty() {
        bail!("{header} declares no fields");
    }
    Ok(fields)
}

fn block_body<'a>(text: &'a str, header: &str) -> Option<&'a str> {
    let start = text.find(header)?;
    let rest = &text[start..];
    let open = rest.find('{')?;
    let close = rest[open..].find('}')?;
    Some(&rest[open + 1..open + close])
}

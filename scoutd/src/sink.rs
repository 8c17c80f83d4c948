//! Per-OU record sinks. One sink per operating unit; the reference sink
//! appends CSV rows under a header of feature names followed by metric
//! names. Sinks are pluggable so downstream consumers can swap in their
//! own serializers.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use planscout_common::METRIC_FIELD_NAMES;

use crate::decode::Record;
use crate::schema::OuSchema;

pub trait Sink: Send {
    fn write_record(&mut self, record: &Record) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

/// Header row for one OU: feature names then metric names.
pub fn header_line(schema: &OuSchema) -> String {
    let mut columns: Vec<&str> = schema
        .features
        .iter()
        .map(|field| field.name.as_str())
        .collect();
    columns.extend(METRIC_FIELD_NAMES);
    columns.join(",")
}

pub struct CsvSink {
    writer: BufWriter<File>,
}

impl CsvSink {
    /// Create `<outdir>/<ou>.csv` and write the header.
    pub fn create(outdir: &Path, schema: &OuSchema) -> Result<Self> {
        fs::create_dir_all(outdir)
            .with_context(|| format!("create output directory {}", outdir.display()))?;
        let path = outdir.join(format!("{}.csv", schema.name));
        let file = File::create(&path)
            .with_context(|| format!("create sink file {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{}", header_line(schema))?;
        Ok(Self { writer })
    }
}

impl Sink for CsvSink {
    fn write_record(&mut self, record: &Record) -> Result<()> {
        let mut row = String::new();
        for value in &record.features {
            row.push_str(&value.to_string());
            row.push(',');
        }
        let m = &record.metrics;
        row.push_str(&format!(
            "{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
            m.start_time_us,
            m.end_time_us,
            m.elapsed_us,
            m.cpu_cycles,
            m.instructions,
            m.cache_references,
            m.cache_misses,
            m.ref_cpu_cycles,
            m.disk_bytes_read,
            m.disk_bytes_written,
            m.network_bytes_read,
            m.network_bytes_written,
            m.cpu_id,
            m.pid
        ));
        writeln!(self.writer, "{row}")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{decode_record, tests::seq_scan_record_bytes};
    use crate::schema::{default_catalog, parse_catalog};
    use planscout_common::ResourceMetrics;

    #[test]
    fn csv_sink_writes_header_then_rows() {
        let dir = tempfile::tempdir().unwrap();
        let schema = parse_catalog(default_catalog()).unwrap().remove(0);
        let mut sink = CsvSink::create(dir.path(), &schema).unwrap();

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
        let record = decode_record(&schema, &bytes).unwrap();
        sink.write_record(&record).unwrap();
        sink.flush().unwrap();

        let contents = std::fs::read_to_string(dir.path().join("seq_scan.csv")).unwrap();
        let mut lines = contents.lines();
        let header = lines.next().unwrap();
        assert!(header.starts_with("plan_node_id,query_id,plan_ptr,"));
        assert!(header.ends_with(
            "start_time,end_time,elapsed_us,cpu_cycles,instructions,\
             cache_references,cache_misses,ref_cpu_cycles,disk_bytes_read,\
             disk_bytes_written,network_bytes_read,network_bytes_written,cpu_id,pid"
        ));
        let row = lines.next().unwrap();
        assert!(row.starts_with("7,42,0xaa,-1,-1,1000,100,"));
        assert!(row.contains(",60,")); // elapsed
        assert!(row.ends_with(",2,4242"));
        assert!(lines.next().is_none());
    }

    #[test]
    fn header_columns_match_schema_order() {
        let schemas = parse_catalog(default_catalog()).unwrap();
        for schema in &schemas {
            let header = header_line(schema);
            let columns: Vec<&str> = header.split(',').collect();
            assert_eq!(
                columns.len(),
                schema.features.len() + METRIC_FIELD_NAMES.len()
            );
            assert_eq!(columns[0], "plan_node_id");
            assert_eq!(columns[columns.len() - 1], "pid");
        }
    }
}

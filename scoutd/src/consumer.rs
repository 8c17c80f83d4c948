//! Per-OU ring consumers. One task per operating unit drains that OU's
//! result ring in order, decodes records against the schema, and hands
//! them to the OU's sink. Consumers are independent; no cross-consumer
//! ordering exists. Malformed records count as drops and never stop the
//! consumer; a failing sink does.

use std::sync::Arc;

use anyhow::Result;
use aya::maps::{MapData, RingBuf};
use log::{error, warn};
use tokio::io::unix::AsyncFd;
use tokio::sync::watch;

use crate::decode::decode_record;
use crate::metrics::Metrics;
use crate::schema::OuSchema;
use crate::sink::Sink;

pub async fn run_consumer(
    ring: RingBuf<MapData>,
    schema: OuSchema,
    mut sink: Box<dyn Sink>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut ring = AsyncFd::new(ring)?;
    'outer: loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            guard = ring.readable_mut() => {
                let mut guard = guard?;
                while let Some(item) = guard.get_inner_mut().next() {
                    let decoded = decode_record(&schema, &item);
                    drop(item);
                    match decoded {
                        Ok(record) => {
                            metrics.record_record(record.ou_index);
                            if let Err(err) = sink.write_record(&record) {
                                error!("[scoutd] {} sink failed: {err:#}", schema.name);
                                break 'outer;
                            }
                        }
                        Err(err) => {
                            warn!("[scoutd] {} record dropped: {err:#}", schema.name);
                            metrics.inc_decode_failure();
                        }
                    }
                }
                guard.clear_ready();
            }
        }
    }
    sink.flush()?;
    Ok(())
}

//! Backend lifecycle tracking. The postmaster's fork/reap probes feed a
//! dedicated ring; consuming it keeps the uprobe attachments in step
//! with the server's process tree, including backends forked after the
//! coordinator attached. A backend's client socket fd (fork-backend
//! events only) is forwarded to the collector so the per-socket TCP
//! counters can find it.

use std::fs;
use std::sync::Arc;

use anyhow::Result;
use aya::maps::{HashMap as AyaHashMap, MapData, RingBuf};
use log::{debug, warn};
use tokio::io::unix::AsyncFd;
use tokio::sync::{watch, Mutex};

use planscout_common::{lifecycle_kind, LifecycleEvent};

use crate::attach::AttachController;
use crate::metrics::Metrics;

/// Backends already running when the coordinator starts: direct children
/// of the postmaster, from /proc.
pub fn children_of(postmaster: u32) -> Vec<u32> {
    let Ok(entries) = fs::read_dir("/proc") else {
        return Vec::new();
    };
    let mut pids = Vec::new();
    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        let Ok(stat) = fs::read_to_string(format!("/proc/{pid}/stat")) else {
            continue;
        };
        if parse_ppid(&stat) == Some(postmaster) {
            pids.push(pid);
        }
    }
    pids
}

/// The ppid is the second field after the parenthesized comm, which may
/// itself contain spaces and parentheses.
fn parse_ppid(stat: &str) -> Option<u32> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    after_comm.split_whitespace().nth(1)?.parse().ok()
}

pub async fn run_lifecycle(
    ring: RingBuf<MapData>,
    controller: Arc<Mutex<AttachController>>,
    mut socket_fds: Option<AyaHashMap<MapData, u32, i32>>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut ring = AsyncFd::new(ring)?;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            guard = ring.readable_mut() => {
                let mut guard = guard?;
                while let Some(item) = guard.get_inner_mut().next() {
                    const EVENT_BYTES: usize = std::mem::size_of::<LifecycleEvent>();
                    let event = (item.len() >= EVENT_BYTES)
                        .then(|| bytemuck::pod_read_unaligned::<LifecycleEvent>(&item[..EVENT_BYTES]));
                    drop(item);
                    match event {
                        Some(event) => {
                            handle_event(&event, &controller, &mut socket_fds, &metrics).await
                        }
                        None => metrics.inc_ring_drop(),
                    }
                }
                guard.clear_ready();
            }
        }
    }
    Ok(())
}

async fn handle_event(
    event: &LifecycleEvent,
    controller: &Arc<Mutex<AttachController>>,
    socket_fds: &mut Option<AyaHashMap<MapData, u32, i32>>,
    metrics: &Arc<Metrics>,
) {
    let pid = event.pid as u32;
    match event.kind {
        lifecycle_kind::FORK_BACKEND | lifecycle_kind::FORK_BACKGROUND => {
            if event.kind == lifecycle_kind::FORK_BACKEND && event.socket_fd >= 0 {
                if let Some(map) = socket_fds {
                    if let Err(err) = map.insert(pid, event.socket_fd, 0) {
                        warn!("[scoutd] record socket fd for backend {pid}: {err}");
                    }
                }
            }
            let mut controller = controller.lock().await;
            // A child that exited between fork and attach is normal
            // churn, not a failure of the coordinator.
            if let Err(err) = controller.attach_backend(pid) {
                warn!("[scoutd] attach to forked backend {pid}: {err:#}");
            }
            metrics.set_backends_attached(controller.attached_count());
        }
        lifecycle_kind::REAP_BACKEND | lifecycle_kind::REAP_BACKGROUND => {
            if let Some(map) = socket_fds {
                let _ = map.remove(&pid);
            }
            let mut controller = controller.lock().await;
            controller.detach(pid);
            metrics.set_backends_attached(controller.attached_count());
            debug!("[scoutd] reaped backend {pid}");
        }
        other => {
            warn!("[scoutd] unknown lifecycle event kind {other} for pid {pid}");
            metrics.inc_ring_drop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ppid_survives_hostile_comm_names() {
        assert_eq!(parse_ppid("1234 (postgres) S 77 1234 1234 0"), Some(77));
        assert_eq!(
            parse_ppid("42 (a) b) c (x) R 7 42 42 0"),
            Some(7),
            "rightmost paren delimits the comm"
        );
        assert_eq!(parse_ppid("garbage"), None);
    }
}

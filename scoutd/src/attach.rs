//! Probe attachment. Loads the collector object, seeds its globals and
//! perf-event arrays, and manages the per-process uprobe links: the
//! postmaster gets the lifecycle probes unconditionally, every backend
//! gets all begin/end/features/flush probes plus a bumped semaphore
//! table. Detaching a backend drops its links and decrements its
//! semaphores; markers that already committed to firing complete their
//! emission and simply find no observer next time.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use aya::maps::{Map, MapData, RingBuf};
use aya::programs::uprobe::UProbeLinkId;
use aya::programs::UProbe;
use aya::{Ebpf, EbpfLoader};
use aya_log::EbpfLogger;
use log::{info, warn};

use planscout_common::{TaskOffsets, NUM_MARKER_EVENTS};

use crate::config::Config;
use crate::perf::{seed_perf_arrays, PerfCounters};
use crate::schema::OuSchema;
use crate::semaphores::SemaphoreHandle;

#[repr(transparent)]
#[derive(Copy, Clone)]
struct TaskOffsetsPod(TaskOffsets);

unsafe impl aya::Pod for TaskOffsetsPod {}

const LIFECYCLE_PROGRAMS: [(&str, &str); 4] = [
    ("postmaster_fork_backend", "planscout_postmaster_fork_backend"),
    (
        "postmaster_fork_background",
        "planscout_postmaster_fork_background",
    ),
    ("postmaster_reap_backend", "planscout_postmaster_reap_backend"),
    (
        "postmaster_reap_background",
        "planscout_postmaster_reap_background",
    ),
];

/// Locate and read the collector object from common install/build paths.
fn read_bpf_object(explicit: Option<&Path>) -> Result<(Vec<u8>, String)> {
    if let Some(path) = explicit {
        let data = fs::read(path)
            .with_context(|| format!("read collector object {}", path.display()))?;
        return Ok((data, path.display().to_string()));
    }
    if let Ok(path) = std::env::var("PLANSCOUT_BPF_PATH") {
        let data = fs::read(&path)?;
        return Ok((data, path));
    }

    const CANDIDATES: [&str; 6] = [
        "/usr/local/share/planscout/planscout-ebpf",
        "/usr/local/share/planscout/planscout-ebpf.o",
        "target/bpfel-unknown-none/release/planscout-ebpf",
        "./target/bpfel-unknown-none/release/planscout-ebpf",
        "../target/bpfel-unknown-none/release/planscout-ebpf",
        "target/bpf/planscout-ebpf.o",
    ];
    for candidate in CANDIDATES {
        if Path::new(candidate).exists() {
            return Ok((fs::read(candidate)?, candidate.to_string()));
        }
    }

    bail!(
        "collector object not found. Set PLANSCOUT_BPF_PATH or install to /usr/local/share/planscout/"
    );
}

pub struct AttachController {
    bpf: Ebpf,
    _logger: Option<EbpfLogger>,
    _perf: PerfCounters,
    schemas: Vec<OuSchema>,
    /// Path of the server executable, resolved from the postmaster.
    exe: Option<PathBuf>,
    links: HashMap<u32, Vec<(String, UProbeLinkId)>>,
    semaphores: HashMap<u32, SemaphoreHandle>,
}

impl AttachController {
    /// Load the collector object, write the offsets global, open and seed
    /// the perf counters, and load every program.
    pub fn load(config: &Config, schemas: Vec<OuSchema>, offsets: TaskOffsets) -> Result<Self> {
        let (bytes, origin) = read_bpf_object(config.collector.bpf_object.as_deref())?;
        info!("[scoutd] loading collector object from {origin}");

        let mut loader = EbpfLoader::new();
        let task_offsets_pod = TaskOffsetsPod(offsets);
        loader.set_global("TASK_OFFSETS", &task_offsets_pod, true);
        let mut bpf = loader.load(&bytes)?;

        let logger = match EbpfLogger::init(&mut bpf) {
            Ok(logger) => Some(logger),
            Err(err) => {
                warn!("[scoutd] collector logger not active: {err}");
                None
            }
        };

        let perf = seed_perf_arrays(&mut bpf)?;

        let mut controller = Self {
            bpf,
            _logger: logger,
            _perf: perf,
            schemas,
            exe: None,
            links: HashMap::new(),
            semaphores: HashMap::new(),
        };
        controller.load_programs()?;
        Ok(controller)
    }

    fn load_programs(&mut self) -> Result<()> {
        let mut names: Vec<String> = Vec::new();
        for schema in &self.schemas {
            names.extend(schema.program_names());
        }
        names.extend(LIFECYCLE_PROGRAMS.iter().map(|(name, _)| name.to_string()));
        for name in names {
            let program: &mut UProbe = self
                .bpf
                .program_mut(&name)
                .with_context(|| format!("program {name} not found"))?
                .try_into()?;
            program.load()?;
        }
        Ok(())
    }

    /// Remove a map from the loaded object, handing ownership to a
    /// consumer. Programs and remaining maps are unaffected.
    pub fn take_ring(&mut self, name: &str) -> Result<RingBuf<MapData>> {
        let map = self
            .bpf
            .take_map(name)
            .with_context(|| format!("map {name} not found"))?;
        RingBuf::try_from(map).map_err(|err| anyhow!("map {name}: {err}"))
    }

    pub fn take_map(&mut self, name: &str) -> Option<Map> {
        self.bpf.take_map(name)
    }

    fn target_exe(&mut self, pid: u32) -> Result<PathBuf> {
        if let Some(exe) = &self.exe {
            return Ok(exe.clone());
        }
        let exe = fs::read_link(format!("/proc/{pid}/exe"))
            .with_context(|| format!("resolve executable of pid {pid}"))?;
        self.exe = Some(exe.clone());
        Ok(exe)
    }

    /// Attach the lifecycle probes to the postmaster. Unconditional: the
    /// coordinator needs fork/reap events before any backend is sampled.
    pub fn attach_postmaster(&mut self, pid: u32) -> Result<()> {
        let exe = self.target_exe(pid)?;
        let mut links = Vec::with_capacity(LIFECYCLE_PROGRAMS.len());
        for (program_name, symbol) in LIFECYCLE_PROGRAMS {
            let program: &mut UProbe = self
                .bpf
                .program_mut(program_name)
                .with_context(|| format!("program {program_name} not found"))?
                .try_into()?;
            let link = program
                .attach(Some(symbol), 0, &exe, Some(pid as libc::pid_t))
                .with_context(|| format!("attach {symbol} to postmaster {pid}"))?;
            links.push((program_name.to_string(), link));
        }
        self.links.insert(pid, links);
        info!("[scoutd] attached lifecycle probes to postmaster {pid}");
        Ok(())
    }

    /// Attach every per-OU probe to one backend and bump its marker
    /// semaphores.
    pub fn attach_backend(&mut self, pid: u32) -> Result<()> {
        if self.links.contains_key(&pid) {
            return Ok(());
        }
        let exe = self.target_exe(pid)?;
        let mut links = Vec::with_capacity(self.schemas.len() * NUM_MARKER_EVENTS);
        let program_pairs: Vec<(String, String)> = self
            .schemas
            .iter()
            .flat_map(|schema| {
                schema
                    .program_names()
                    .into_iter()
                    .zip(schema.anchor_symbols())
            })
            .collect();
        for (program_name, symbol) in program_pairs {
            let program: &mut UProbe = self
                .bpf
                .program_mut(&program_name)
                .with_context(|| format!("program {program_name} not found"))?
                .try_into()?;
            let link = program
                .attach(Some(&symbol), 0, &exe, Some(pid as libc::pid_t))
                .with_context(|| format!("attach {symbol} to backend {pid}"))?;
            links.push((program_name, link));
        }
        self.links.insert(pid, links);

        match SemaphoreHandle::open(pid) {
            Ok(mut handle) => {
                handle.attach();
                self.semaphores.insert(pid, handle);
            }
            Err(err) => {
                // Markers stay dormant for this backend; records from it
                // are lost, the attachment itself is still useful for
                // lifecycle bookkeeping.
                warn!("[scoutd] semaphore table for backend {pid}: {err:#}");
            }
        }

        info!("[scoutd] attached {} probes to backend {pid}", NUM_MARKER_EVENTS * self.schemas.len());
        Ok(())
    }

    /// Drop a process's links and release its semaphores.
    pub fn detach(&mut self, pid: u32) {
        if let Some(links) = self.links.remove(&pid) {
            for (program_name, link) in links {
                let detached = self
                    .bpf
                    .program_mut(&program_name)
                    .and_then(|program| <&mut UProbe>::try_from(program).ok())
                    .map(|program| program.detach(link));
                if let Some(Err(err)) = detached {
                    warn!("[scoutd] detach {program_name} from {pid}: {err}");
                }
            }
        }
        if let Some(mut handle) = self.semaphores.remove(&pid) {
            handle.detach();
        }
    }

    pub fn detach_all(&mut self) {
        let pids: Vec<u32> = self.links.keys().copied().collect();
        for pid in pids {
            self.detach(pid);
        }
    }

    pub fn attached_count(&self) -> usize {
        self.links.len()
    }
}

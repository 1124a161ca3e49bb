// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::Serialize;
use stackfs_fd::{
    Fd, FdObject, FdTable, FdTableConfig, FdTableStats, FsError, Inode, InodeKind, Module,
    ModuleGraph, Pid, ReleaseStatus,
};
use stackfs_logging::CliLoggingArgs;
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const TRACKER: &str = "stress-tracker";

fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.logging.init("stackfs-fd-stress")?;

    let (report, json_output) = match cli.command {
        Command::Churn(args) => (run_churn(&args)?, args.common.json_output),
        Command::Lookup(args) => (run_lookup(&args)?, args.common.json_output),
    };
    if let Some(path) = json_output {
        let file = File::create(&path)
            .with_context(|| format!("failed to create report {}", path.display()))?;
        serde_json::to_writer_pretty(file, &report)?;
    }
    write_json_to_stdout(&report)?;
    if report.status != "passed" {
        bail!("{} violation(s) detected", report.violations.len());
    }
    Ok(())
}

fn write_json_to_stdout<T: Serialize>(value: &T) -> Result<()> {
    let mut out = io::stdout().lock();
    writeln!(out, "{}", serde_json::to_string_pretty(value)?)?;
    out.flush()?;
    Ok(())
}

#[derive(Parser)]
#[command(author, version, about = "StackFS fd table stress workload runner")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    logging: CliLoggingArgs,
}

#[derive(Subcommand)]
enum Command {
    /// Allocate, look up and release fds on one shared table
    Churn(ChurnArgs),
    /// Race per-inode fd lookups against the last release
    Lookup(LookupArgs),
}

#[derive(Args, Clone)]
struct CommonArgs {
    /// Number of worker threads to spawn
    #[arg(long, default_value_t = 8)]
    threads: usize,

    /// Duration of the workload in seconds
    #[arg(long, default_value_t = 10)]
    duration_sec: u64,

    /// Stop each worker after this many operations
    #[arg(long)]
    max_ops_per_thread: Option<u64>,

    /// Number of shared inodes fds are opened against
    #[arg(long, default_value_t = 16)]
    inodes: u64,

    /// Optional path for writing the JSON report
    #[arg(long)]
    json_output: Option<PathBuf>,
}

#[derive(Args, Clone)]
struct ChurnArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// JSON fd table configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Fds each worker keeps open at most
    #[arg(long, default_value_t = 256)]
    max_held: usize,

    /// Upper bound for fd numbers tried with explicit placement
    #[arg(long, default_value_t = 4096)]
    placement_range: i32,
}

#[derive(Args, Clone)]
struct LookupArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Fds each worker keeps open at most
    #[arg(long, default_value_t = 64)]
    max_held: usize,
}

/// Module that records every serial it is asked to release.
#[derive(Default)]
struct ReleaseTracker {
    released: Mutex<HashSet<u64>>,
    violations: Mutex<Vec<String>>,
}

impl ReleaseTracker {
    fn record(&self, fd: &FdObject) -> ReleaseStatus {
        let Some(serial) = fd.ctx_get::<u64>(TRACKER) else {
            self.violation(format!("fd for pid {} lost its tracker context", fd.pid()));
            return ReleaseStatus::Released;
        };
        let fresh = self.released.lock().unwrap_or_else(|e| e.into_inner()).insert(*serial);
        if !fresh {
            self.violation(format!("fd {serial} released twice"));
        }
        ReleaseStatus::Released
    }

    fn violation(&self, detail: String) {
        warn!("{detail}");
        self.violations.lock().unwrap_or_else(|e| e.into_inner()).push(detail);
    }

    fn released_count(&self) -> u64 {
        self.released.lock().unwrap_or_else(|e| e.into_inner()).len() as u64
    }

    fn take_violations(&self) -> Vec<String> {
        std::mem::take(&mut *self.violations.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl Module for ReleaseTracker {
    fn release(&self, fd: &FdObject) -> ReleaseStatus {
        self.record(fd)
    }

    fn release_dir(&self, fd: &FdObject) -> ReleaseStatus {
        self.record(fd)
    }
}

/// Inodes, the tracker module and the serial counter shared by all workers.
struct Fixture {
    inodes: Vec<Arc<Inode>>,
    tracker: Arc<ReleaseTracker>,
    next_serial: AtomicU64,
}

impl Fixture {
    fn new(count: u64) -> Result<Self> {
        if count == 0 {
            bail!("--inodes must be at least 1");
        }
        let tracker = Arc::new(ReleaseTracker::default());
        let graph = Arc::new(ModuleGraph::new().with_module(TRACKER, tracker.clone()));
        let inodes = (0..count)
            .map(|ino| {
                let kind = if ino % 4 == 0 { InodeKind::Directory } else { InodeKind::Regular };
                Inode::new(ino + 1, kind, graph.clone())
            })
            .collect();
        Ok(Self {
            inodes,
            tracker,
            next_serial: AtomicU64::new(1),
        })
    }

    fn open(&self, rng: &mut SmallRng, pid: Pid) -> Result<(u64, Fd)> {
        let inode = &self.inodes[rng.gen_range(0..self.inodes.len())];
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let fd = Fd::create(inode, pid);
        fd.ctx_set(TRACKER, serial)?;
        fd.bind()?;
        Ok((serial, fd))
    }

    fn opened(&self) -> u64 {
        self.next_serial.load(Ordering::Relaxed) - 1
    }

    fn finish(&self, violations: &mut Vec<String>) {
        violations.extend(self.tracker.take_violations());
        let released = self.tracker.released_count();
        if released != self.opened() {
            violations.push(format!("opened {} fds but released {released}", self.opened()));
        }
        for inode in &self.inodes {
            if inode.has_open_fds() {
                violations.push(format!("inode {} still has open fds", inode.ino()));
            }
        }
    }
}

#[derive(Default, Serialize, Clone)]
struct OperationStats {
    counts: BTreeMap<&'static str, u64>,
}

impl OperationStats {
    fn increment(&mut self, op: &'static str) {
        *self.counts.entry(op).or_insert(0) += 1;
    }

    fn total(&self) -> u64 {
        self.counts.values().sum()
    }
}

impl std::ops::AddAssign<&OperationStats> for OperationStats {
    fn add_assign(&mut self, other: &OperationStats) {
        for (op, n) in &other.counts {
            *self.counts.entry(*op).or_insert(0) += n;
        }
    }
}

#[derive(Serialize)]
struct Report {
    phase: String,
    threads: usize,
    duration_sec: u64,
    start_time: String,
    end_time: String,
    operations: OperationStats,
    total_ops: u64,
    fds_opened: u64,
    fds_released: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    table: Option<FdTableStats>,
    violations: Vec<String>,
    status: String,
}

/// Completed operation label, or a violation description.
type OpOutcome = std::result::Result<&'static str, String>;

struct WorkerResult {
    stats: OperationStats,
    violations: Vec<String>,
}

struct Budget {
    run_until: Instant,
    max_ops: u64,
}

impl Budget {
    fn new(common: &CommonArgs) -> Self {
        Self {
            run_until: Instant::now() + Duration::from_secs(common.duration_sec),
            max_ops: common.max_ops_per_thread.unwrap_or(u64::MAX),
        }
    }

    fn exhausted(&self, done: u64) -> bool {
        done >= self.max_ops || Instant::now() >= self.run_until
    }
}

fn seed_for(worker: usize) -> u64 {
    let base = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
    base ^ ((std::process::id() as u64) << 32) ^ worker as u64
}

fn load_table_config(path: Option<&PathBuf>) -> Result<FdTableConfig> {
    let Some(path) = path else {
        return Ok(FdTableConfig::default());
    };
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    FdTableConfig::from_json_bytes(&bytes)
        .with_context(|| format!("invalid fd table config {}", path.display()))
}

fn join_workers(
    workers: Vec<thread::JoinHandle<WorkerResult>>,
    stats: &mut OperationStats,
    violations: &mut Vec<String>,
) {
    for worker in workers {
        match worker.join() {
            Ok(result) => {
                *stats += &result.stats;
                violations.extend(result.violations);
            }
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                warn!("worker thread panicked: {msg}");
                violations.push(format!("worker panic: {msg}"));
            }
        }
    }
}

fn run_churn(args: &ChurnArgs) -> Result<Report> {
    let config = load_table_config(args.config.as_ref())?;
    let table = Arc::new(FdTable::with_config(config)?);
    let fixture = Arc::new(Fixture::new(args.common.inodes)?);

    info!(
        threads = args.common.threads,
        duration_sec = args.common.duration_sec,
        capacity = table.capacity(),
        "fd churn workload starting"
    );

    let start_time = chrono::Utc::now();
    let workers: Vec<_> = (0..args.common.threads)
        .map(|id| {
            let worker = ChurnWorker {
                id,
                table: table.clone(),
                fixture: fixture.clone(),
                budget: Budget::new(&args.common),
                max_held: args.max_held.max(1),
                placement_range: args.placement_range.max(1),
            };
            thread::spawn(move || worker.run())
        })
        .collect();

    let mut stats = OperationStats::default();
    let mut violations = Vec::new();
    join_workers(workers, &mut stats, &mut violations);

    let table_stats = table.stats();
    if table_stats.in_use != 0 {
        violations.push(format!("{} fds left in the table", table_stats.in_use));
    }
    drop(table.drain());
    fixture.finish(&mut violations);

    Ok(build_report(
        "churn",
        &args.common,
        start_time,
        stats,
        &fixture,
        Some(table_stats),
        violations,
    ))
}

fn run_lookup(args: &LookupArgs) -> Result<Report> {
    let fixture = Arc::new(Fixture::new(args.common.inodes)?);
    info!(
        threads = args.common.threads,
        duration_sec = args.common.duration_sec,
        inodes = args.common.inodes,
        "fd lookup workload starting"
    );

    let start_time = chrono::Utc::now();
    let workers: Vec<_> = (0..args.common.threads)
        .map(|id| {
            let worker = LookupWorker {
                id,
                fixture: fixture.clone(),
                budget: Budget::new(&args.common),
                max_held: args.max_held.max(1),
            };
            thread::spawn(move || worker.run())
        })
        .collect();

    let mut stats = OperationStats::default();
    let mut violations = Vec::new();
    join_workers(workers, &mut stats, &mut violations);
    fixture.finish(&mut violations);

    Ok(build_report("lookup", &args.common, start_time, stats, &fixture, None, violations))
}

fn build_report(
    phase: &str,
    common: &CommonArgs,
    start_time: chrono::DateTime<chrono::Utc>,
    stats: OperationStats,
    fixture: &Fixture,
    table: Option<FdTableStats>,
    violations: Vec<String>,
) -> Report {
    let end_time = chrono::Utc::now();
    let status = if violations.is_empty() { "passed" } else { "failed" };
    Report {
        phase: phase.to_string(),
        threads: common.threads,
        duration_sec: common.duration_sec,
        start_time: start_time.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        end_time: end_time.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        total_ops: stats.total(),
        operations: stats,
        fds_opened: fixture.opened(),
        fds_released: fixture.tracker.released_count(),
        table,
        violations,
        status: status.to_string(),
    }
}

struct ChurnWorker {
    id: usize,
    table: Arc<FdTable>,
    fixture: Arc<Fixture>,
    budget: Budget,
    max_held: usize,
    placement_range: i32,
}

impl ChurnWorker {
    fn run(self) -> WorkerResult {
        let mut rng = SmallRng::seed_from_u64(seed_for(self.id));
        let pid = Pid::new(self.id as u32 + 1);
        let mut held: Vec<(i32, u64)> = Vec::new();
        let mut stats = OperationStats::default();
        let mut violations = Vec::new();
        let mut done = 0;

        while !self.budget.exhausted(done) {
            done += 1;
            let bucket = rng.gen_range(0..100);
            let outcome = match bucket {
                0..=29 if held.len() < self.max_held => self.open(&mut rng, pid, &mut held, false),
                30..=39 if held.len() < self.max_held => self.open(&mut rng, pid, &mut held, true),
                40..=74 if !held.is_empty() => self.verify(&mut rng, &held),
                _ if !held.is_empty() => self.close(&mut rng, &mut held),
                _ => self.open(&mut rng, pid, &mut held, false),
            };
            match outcome {
                Ok(op) => stats.increment(op),
                Err(detail) => {
                    debug!(worker = self.id, "{detail}");
                    violations.push(detail);
                }
            }
        }

        for (idx, serial) in held.drain(..) {
            match self.table.release(idx) {
                Some(fd) if fd.ctx_get::<u64>(TRACKER).as_deref() == Some(&serial) => {}
                _ => violations.push(format!("worker {} lost fd {idx} before shutdown", self.id)),
            }
        }

        WorkerResult { stats, violations }
    }

    fn open(
        &self,
        rng: &mut SmallRng,
        pid: Pid,
        held: &mut Vec<(i32, u64)>,
        placed: bool,
    ) -> OpOutcome {
        let (serial, fd) = self.fixture.open(rng, pid).map_err(|e| format!("open: {e}"))?;
        if placed {
            let target = rng.gen_range(0..self.placement_range);
            match self.table.allocate_at(target, &fd) {
                Ok(idx) => {
                    held.push((idx, serial));
                    return Ok("allocate_at");
                }
                Err(FsError::SlotOccupied(_)) => return Ok("allocate_at_occupied"),
                Err(err) => return Err(format!("allocate_at {target}: {err}")),
            }
        }
        let idx = self.table.allocate(&fd).map_err(|e| format!("allocate: {e}"))?;
        held.push((idx, serial));
        Ok("allocate")
    }

    fn verify(&self, rng: &mut SmallRng, held: &[(i32, u64)]) -> OpOutcome {
        let (idx, serial) = held[rng.gen_range(0..held.len())];
        match self.table.get(idx) {
            Ok(Some(fd)) if fd.ctx_get::<u64>(TRACKER).as_deref() == Some(&serial) => Ok("get"),
            Ok(Some(_)) => Err(format!("fd {idx} aliased another open fd")),
            Ok(None) => Err(format!("fd {idx} vanished while held")),
            Err(err) => Err(format!("get {idx}: {err}")),
        }
    }

    fn close(&self, rng: &mut SmallRng, held: &mut Vec<(i32, u64)>) -> OpOutcome {
        let (idx, serial) = held.swap_remove(rng.gen_range(0..held.len()));
        match self.table.release(idx) {
            Some(fd) if fd.ctx_get::<u64>(TRACKER).as_deref() == Some(&serial) => Ok("release"),
            Some(_) => Err(format!("fd {idx} released someone else's fd")),
            None => Err(format!("fd {idx} was already empty")),
        }
    }
}

struct LookupWorker {
    id: usize,
    fixture: Arc<Fixture>,
    budget: Budget,
    max_held: usize,
}

impl LookupWorker {
    fn run(self) -> WorkerResult {
        let mut rng = SmallRng::seed_from_u64(seed_for(self.id));
        let pid = Pid::new(self.id as u32 + 1);
        let mut held: Vec<Fd> = Vec::new();
        let mut stats = OperationStats::default();
        let mut violations = Vec::new();
        let mut done = 0;

        while !self.budget.exhausted(done) {
            done += 1;
            match rng.gen_range(0..100) {
                0..=39 if held.len() < self.max_held => match self.fixture.open(&mut rng, pid) {
                    Ok((_, fd)) => {
                        held.push(fd);
                        stats.increment("open");
                    }
                    Err(err) => violations.push(format!("open: {err}")),
                },
                40..=79 => {
                    let inode = &self.fixture.inodes[rng.gen_range(0..self.fixture.inodes.len())];
                    let wanted = if rng.gen_bool(0.2) { Pid::ANY } else { pid };
                    match inode.fd_lookup(wanted) {
                        Some(fd) if !wanted.is_any() && fd.pid() != pid => {
                            violations.push(format!("lookup for {pid} returned {}", fd.pid()));
                        }
                        Some(fd) if !Arc::ptr_eq(fd.inode(), inode) => {
                            violations.push(format!("lookup crossed inode {}", inode.ino()));
                        }
                        Some(_) => stats.increment("lookup_hit"),
                        None => stats.increment("lookup_miss"),
                    }
                }
                _ if !held.is_empty() => {
                    drop(held.swap_remove(rng.gen_range(0..held.len())));
                    stats.increment("close");
                }
                _ => stats.increment("idle"),
            }
        }

        drop(held);
        WorkerResult { stats, violations }
    }
}

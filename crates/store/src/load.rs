//! Load-simulation harness
//!
//! Testing/debugging aid that exercises the handle registry the way a
//! busy fleet member would: randomised readers, writers that periodically
//! prune their own test records, full-database iterators, and optionally
//! forked child processes running a mixed workload against the same
//! files. Normal agents never run this code.
//!
//! Writers derive their keys as `test_<worker>_<template-key>` so real
//! data is never disturbed, and clean up after themselves on stop. A
//! full database is survivable: capacity errors are logged and the
//! workload keeps going.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{error, info, warn};

use fleetstate_core::{DbId, Error, Result, StateLayout};

use crate::registry;

/// Distinguishes harness workers across threads and processes
static WORKER_SEQ: AtomicU64 = AtomicU64::new(0);

/// Per-operation sleep range for one role
#[derive(Debug, Clone, Copy)]
pub struct Interval {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl Interval {
    fn sample(&self, rng: &mut impl Rng) -> Duration {
        if self.max_ms <= self.min_ms {
            return Duration::from_millis(self.min_ms);
        }
        Duration::from_millis(rng.gen_range(self.min_ms..self.max_ms))
    }
}

#[derive(Debug, Clone)]
pub struct ReadLoad {
    pub threads: usize,
    /// How often the sampled key set is refreshed
    pub keys_refresh_secs: u64,
    pub interval: Interval,
}

#[derive(Debug, Clone)]
pub struct WriteLoad {
    pub threads: usize,
    /// Percentage of existing records used as write templates
    pub sample_size_percent: usize,
    /// How often the writer deletes its own test keys
    pub prune_interval_secs: u64,
    pub interval: Interval,
}

#[derive(Debug, Clone)]
pub struct IterLoad {
    pub threads: usize,
    pub interval: Interval,
}

#[derive(Debug, Clone)]
pub struct ChildLoad {
    pub processes: usize,
    /// How long each child keeps its mixed workload running
    pub duration: Duration,
}

/// What to run; roles left `None` are not started
#[derive(Debug, Clone, Default)]
pub struct LoadSpec {
    pub read: Option<ReadLoad>,
    pub write: Option<WriteLoad>,
    pub iter: Option<IterLoad>,
    pub children: Option<ChildLoad>,
}

/// A running simulation; stop it with [`LoadSimulation::stop`]
pub struct LoadSimulation {
    terminate: Arc<AtomicBool>,
    threads: Vec<(&'static str, JoinHandle<()>)>,
    #[cfg(unix)]
    children: Vec<nix::unistd::Pid>,
}

impl LoadSimulation {
    /// Start the configured workload against one logical database.
    ///
    /// Child processes are forked before any worker threads are spawned.
    pub fn start(layout: &StateLayout, id: DbId, spec: LoadSpec) -> Result<LoadSimulation> {
        #[cfg(unix)]
        let children = match &spec.children {
            Some(child_spec) => fork_children(layout, id, child_spec)?,
            None => Vec::new(),
        };

        // Open once as a safety check before unleashing the workers.
        registry::open(layout, id)?;

        let terminate = Arc::new(AtomicBool::new(false));
        let mut threads: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        if let Some(read) = &spec.read {
            for _ in 0..read.threads {
                let layout = layout.clone();
                let params = read.clone();
                let terminate = terminate.clone();
                threads.push((
                    "read",
                    thread::spawn(move || run_reader(&layout, id, &params, &terminate)),
                ));
            }
        }
        if let Some(write) = &spec.write {
            for _ in 0..write.threads {
                let layout = layout.clone();
                let params = write.clone();
                let terminate = terminate.clone();
                threads.push((
                    "write",
                    thread::spawn(move || run_writer(&layout, id, &params, &terminate)),
                ));
            }
        }
        if let Some(iter) = &spec.iter {
            for _ in 0..iter.threads {
                let layout = layout.clone();
                let params = iter.clone();
                let terminate = terminate.clone();
                threads.push((
                    "iterate",
                    thread::spawn(move || run_iterator(&layout, id, &params, &terminate)),
                ));
            }
        }

        #[cfg(unix)]
        if threads.is_empty() && children.is_empty() {
            warn!("no load simulation roles configured, nothing is running");
        }

        Ok(LoadSimulation {
            terminate,
            threads,
            #[cfg(unix)]
            children,
        })
    }

    /// Signal every worker to stop and wait for them; threads get five
    /// seconds before they are declared leaked.
    pub fn stop(mut self) {
        self.terminate.store(true, Ordering::Relaxed);

        let deadline = Instant::now() + Duration::from_secs(5);
        for (role, handle) in self.threads.drain(..) {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                error!("failed to stop {role} simulation thread within 5 s, leaking it");
            }
        }

        #[cfg(unix)]
        for pid in self.children.drain(..) {
            match nix::sys::wait::waitpid(pid, None) {
                Ok(_) => {}
                Err(err) => error!("failed to wait for load child {pid}: {err}"),
            }
        }
    }
}

/// Sleep for a sampled interval, honouring the terminate flag in small
/// steps. Returns how long was slept, or `None` once terminated.
fn sleep_interval(
    interval: Interval,
    rng: &mut impl Rng,
    terminate: &AtomicBool,
) -> Option<Duration> {
    let total = interval.sample(rng);
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if terminate.load(Ordering::Relaxed) {
            return None;
        }
        let step = remaining.min(Duration::from_millis(50));
        thread::sleep(step);
        remaining -= step;
    }
    if terminate.load(Ordering::Relaxed) {
        None
    } else {
        Some(total)
    }
}

fn fetch_keys(layout: &StateLayout, id: DbId) -> Result<Vec<Vec<u8>>> {
    let db = registry::open(layout, id)?;
    Ok(db.load_to_map()?.into_keys().collect())
}

fn run_reader(layout: &StateLayout, id: DbId, params: &ReadLoad, terminate: &AtomicBool) {
    let mut rng = rand::thread_rng();

    let mut keys = match fetch_keys(layout, id) {
        Ok(keys) => keys,
        Err(err) => {
            error!("read simulation could not sample keys: {err}");
            return;
        }
    };

    let mut slept = Duration::ZERO;
    while let Some(duration) = sleep_interval(params.interval, &mut rng, terminate) {
        slept += duration;
        if keys.is_empty() {
            continue;
        }
        let key = &keys[rng.gen_range(0..keys.len())];

        let db = match registry::open(layout, id) {
            Ok(db) => db,
            Err(err) => {
                error!("read simulation open failed: {err}");
                return;
            }
        };
        if let Err(err) = db.read_raw(key) {
            error!("read simulation read failed: {err}");
        }

        if slept >= Duration::from_secs(params.keys_refresh_secs.max(1)) {
            match db.load_to_map() {
                Ok(map) => keys = map.into_keys().collect(),
                Err(err) => error!("read simulation key refresh failed: {err}"),
            }
            slept = Duration::ZERO;
        }
    }
}

fn run_writer(layout: &StateLayout, id: DbId, params: &WriteLoad, terminate: &AtomicBool) {
    let mut rng = rand::thread_rng();
    let worker = WORKER_SEQ.fetch_add(1, Ordering::Relaxed);
    let prefix = format!("test_{worker}_");

    let items: Vec<(Vec<u8>, Vec<u8>)> = match registry::open(layout, id)
        .and_then(|db| db.load_to_map())
    {
        Ok(map) => map.into_iter().collect(),
        Err(err) => {
            error!("write simulation could not load templates: {err}");
            return;
        }
    };
    let n_items = items.len();
    let n_samples = (n_items * params.sample_size_percent) / 100;
    if n_samples == 0 {
        warn!("write simulation has no template records to work with");
        return;
    }
    // Use the first item of every (n_items / n_samples)-th stride, which
    // spreads the sample across the key space instead of clustering it
    // at the front.
    let sample_stride = n_items / n_samples;

    let mut written: HashSet<Vec<u8>> = HashSet::new();
    let mut slept = Duration::ZERO;
    while let Some(duration) = sleep_interval(params.interval, &mut rng, terminate) {
        slept += duration;

        let rnd = rng.gen_range(0..n_items);
        let idx = ((rnd * n_samples) / n_items) * sample_stride;
        let (template_key, template_value) = &items[idx];

        let db = match registry::open(layout, id) {
            Ok(db) => db,
            Err(err) => {
                error!("write simulation open failed: {err}");
                return;
            }
        };

        let key = derived_key(&prefix, template_key, 400);
        match db.write_raw(&key, template_value) {
            Ok(()) => {
                written.insert(key);
            }
            Err(err) if err.is_capacity() => warn!("write simulation hit capacity: {err}"),
            Err(err) => error!("write simulation write failed: {err}"),
        }

        if slept >= Duration::from_secs(params.prune_interval_secs.max(1)) {
            if let Err(err) = prune(&db, prefix.as_bytes(), &mut written) {
                error!("write simulation prune failed: {err}");
            }
            slept = Duration::ZERO;
        }
    }

    // Clean after ourselves.
    match registry::open(layout, id) {
        Ok(db) => {
            for key in &written {
                if let Err(err) = db.delete_raw(key) {
                    error!("write simulation cleanup failed: {err}");
                }
            }
        }
        Err(err) => error!("write simulation cleanup open failed: {err}"),
    }
}

fn run_iterator(layout: &StateLayout, id: DbId, params: &IterLoad, terminate: &AtomicBool) {
    let mut rng = rand::thread_rng();

    while sleep_interval(params.interval, &mut rng, terminate).is_some() {
        let db = match registry::open(layout, id) {
            Ok(db) => db,
            Err(err) => {
                error!("iteration simulation open failed: {err}");
                return;
            }
        };
        if let Err(err) = db.engine().scan(|_, _| Ok(())) {
            error!("iteration simulation scan failed: {err}");
        }
    }
}

/// `<prefix><template-key>`, with the template part bounded so the
/// result stays within the engine's key size limit.
fn derived_key(prefix: &str, template_key: &[u8], template_limit: usize) -> Vec<u8> {
    let mut key = prefix.as_bytes().to_vec();
    key.extend_from_slice(&template_key[..template_key.len().min(template_limit)]);
    key
}

fn prune(db: &registry::Db, prefix: &[u8], written: &mut HashSet<Vec<u8>>) -> Result<()> {
    let mut cursor = db.cursor()?;
    while let Some((key, _)) = cursor.next_entry()? {
        if key.starts_with(prefix) {
            cursor.delete_current()?;
            written.remove(&key);
        }
    }
    cursor.close()
}

#[cfg(unix)]
fn fork_children(layout: &StateLayout, id: DbId, spec: &ChildLoad) -> Result<Vec<nix::unistd::Pid>> {
    use nix::unistd::{fork, ForkResult};

    let mut pids = Vec::with_capacity(spec.processes);
    for _ in 0..spec.processes {
        // SAFETY: children are forked before any worker threads exist,
        // and they re-open the database instead of touching inherited
        // engine state.
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => pids.push(child),
            Ok(ForkResult::Child) => {
                let code = match run_child_workload(layout, id, spec.duration) {
                    Ok(()) => 0,
                    Err(err) => {
                        error!("load child workload failed: {err}");
                        1
                    }
                };
                std::process::exit(code);
            }
            Err(err) => {
                return Err(Error::io(
                    "fork load child".to_string(),
                    std::io::Error::from(err),
                ));
            }
        }
    }
    info!("forked {} load child processes", pids.len());
    Ok(pids)
}

#[cfg(unix)]
fn run_child_workload(layout: &StateLayout, id: DbId, duration: Duration) -> Result<()> {
    use crate::engine::{Engine, EngineOptions};

    // The child must not reuse any engine environment inherited over
    // fork; open our own against the same file.
    let engine = Engine::open(&layout.db_path(id), &EngineOptions::default())?;
    let worker = std::process::id();
    let deadline = Instant::now() + duration;
    let mut i = 0u64;

    while Instant::now() < deadline {
        if let Some((key, _)) = engine.first_entry()? {
            engine.get_copy(&key)?;
        }
        engine.scan(|_, _| Ok(()))?;

        let key = format!("test_{worker}_child_{i}");
        match engine.put_one(key.as_bytes(), b"child-load\0") {
            Ok(()) => {
                engine.del_one(key.as_bytes())?;
            }
            Err(err) if err.is_capacity() => warn!("load child hit capacity: {err}"),
            Err(err) => return Err(err),
        }

        i += 1;
        thread::sleep(Duration::from_millis(5));
    }
    Ok(())
}

// =============================================================================
// Fill-to-percentage
// =============================================================================

/// Synthetic records injected to fill a database to a target usage,
/// removable afterwards by their stored keys.
pub struct Filament {
    layout: StateLayout,
    id: DbId,
    keys: HashSet<Vec<u8>>,
}

/// Clone an existing record until usage reaches `target_percent`.
///
/// Records are written in batches of 1000 so every usage probe sees a
/// measurable difference. A database that fills up before the target is
/// reached keeps the records written so far.
pub fn fill(layout: &StateLayout, id: DbId, target_percent: i32) -> Result<Filament> {
    let db = registry::open(layout, id)?;

    let mut usage = db.usage_percentage()?;
    if usage < 0 {
        return Err(Error::internal(format!(
            "cannot determine usage of '{}'",
            db.path().display()
        )));
    }

    let (template_key, template_value) = db.engine().first_entry()?.ok_or_else(|| {
        Error::internal(format!(
            "no record in '{}' to use as a fill template",
            db.path().display()
        ))
    })?;

    let worker = WORKER_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut keys: HashSet<Vec<u8>> = HashSet::new();
    let mut batch = 0usize;

    let engine = db.engine();
    let prefix = format!("test_{worker}_");
    'fill: while usage < target_percent {
        let mut wtxn = engine.write_txn()?;
        let mut batch_keys = Vec::with_capacity(1000);
        for i in 0..1000usize {
            let mut key = derived_key(&prefix, &template_key, 200);
            key.extend_from_slice(format!("_{batch}_{i}").as_bytes());
            match engine.put(&mut wtxn, &key, &template_value) {
                Ok(()) => batch_keys.push(key),
                Err(err) if err.is_capacity() => {
                    warn!("database filled up before reaching {target_percent}%: {err}");
                    engine.abort(wtxn);
                    break 'fill;
                }
                Err(err) => return Err(err),
            }
        }
        engine.commit(wtxn)?;
        keys.extend(batch_keys);
        batch += 1;
        usage = db.usage_percentage()?;
    }

    Ok(Filament {
        layout: layout.clone(),
        id,
        keys,
    })
}

impl Filament {
    /// Number of injected records still tracked
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Remove the injected records
    pub fn remove(mut self) -> Result<()> {
        self.remove_inner()
    }

    fn remove_inner(&mut self) -> Result<()> {
        if self.keys.is_empty() {
            return Ok(());
        }
        let db = registry::open(&self.layout, self.id)?;
        for key in self.keys.drain() {
            db.delete_raw(&key)?;
        }
        Ok(())
    }
}

impl Drop for Filament {
    fn drop(&mut self) {
        if let Err(err) = self.remove_inner() {
            error!("failed to remove load filament: {err}");
        }
    }
}

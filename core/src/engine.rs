//! The step engine: owns one model per region and advances them in
//! lock-step, decoupled from whatever drives the UI.
//!
//! STEP ORDER (fixed, never reordered):
//!   1. Drain newly configured links and the action queue; apply actions.
//!   2. Advance every region by one time step, in region order.
//!   3. Evaluate every link and install the coupled values.
//!   4. Commit the new time on every region.
//!   5. Append one OutputLog row (every region × every captured attribute).
//!   6. Publish `StepCompleted`.
//!   7. Wait out the step rate, then re-check the paused flag.
//!
//! RULES:
//!   - Only the stepping thread touches the models.
//!   - The action queue, the link inbox and the paused flag are the only
//!     state written from outside the stepping thread.
//!   - A step that fails appends nothing. Overrides already installed by
//!     links earlier in that step stay in place.

use std::collections::HashSet;
use std::ops::RangeBounds;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::Receiver;

use crate::{
    action::{Action, ActionBook, ActionQueue, QueuedAction},
    capture::CaptureSet,
    clock::{step_period, StepClock},
    config::{validate_rate, EngineConfig},
    error::{SimError, SimResult, StepPhase},
    event::{EngineEvent, EventBus},
    link::{Link, LinkRuntime},
    model::{ModelFactory, SimulationModel},
    output::{OutputLog, OutputRow, SeriesPoint},
    snapshot::EngineSnapshot,
    store::SimStore,
    sync::lock,
    types::{RegionId, StepIndex},
};

#[derive(Debug)]
struct Control {
    paused:           bool,
    running:          bool,
    steps_per_second: f64,
}

/// Everything only the stepping thread mutates.
struct StepCore {
    models: Vec<Box<dyn SimulationModel>>,
    links:  Vec<LinkRuntime>,
    book:   ActionBook,
    clock:  StepClock,
}

pub struct StepEngine {
    regions:        Arc<Vec<RegionId>>,
    queue:          ActionQueue,
    link_inbox:     Mutex<Vec<Link>>,
    output:         Arc<OutputLog>,
    events:         EventBus,
    control:        Mutex<Control>,
    wake:           Condvar,
    completed_step: AtomicU64,
    active_loops:   AtomicUsize,
    core:           Mutex<StepCore>,
}

impl std::fmt::Debug for StepEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepEngine")
            .field("regions", &self.regions)
            .field("current_step", &self.current_step())
            .field("paused", &self.is_paused())
            .finish()
    }
}

impl StepEngine {
    /// Build an engine with one fresh model per configured region.
    pub fn new(config: EngineConfig, factory: &dyn ModelFactory) -> SimResult<Self> {
        config.validate()?;
        let models = create_models(&config.regions, factory)?;

        let elements = models[0].element_names();
        let capture = match &config.capture {
            Some(list) => {
                let capture = CaptureSet::new(list.iter().cloned());
                capture.validate_against(&elements)?;
                capture
            }
            None => CaptureSet::from_elements(&elements),
        };

        let first = &models[0];
        let clock = StepClock::new(first.current_time(), first.time_step(), first.final_time());
        if !(clock.time_step > 0.0) {
            return Err(SimError::invalid_config(format!(
                "model time step must be positive, got {}",
                clock.time_step
            )));
        }

        log::info!(
            "engine built: {} region(s), {} captured attribute(s), t0={} dt={} final={}",
            config.regions.len(),
            capture.len(),
            clock.start_time,
            clock.time_step,
            clock.final_time
        );

        let output = OutputLog::new(config.regions.clone(), capture);
        let links = config.links.into_iter().map(LinkRuntime::new).collect();
        Ok(Self::assemble(
            config.regions,
            models,
            links,
            clock,
            config.steps_per_second,
            output,
        ))
    }

    /// Rebuild an engine from a snapshot and the output rows saved with it.
    /// Stepping continues at the step after the snapshot.
    pub fn restore(
        snapshot: EngineSnapshot,
        rows: Vec<OutputRow>,
        factory: &dyn ModelFactory,
    ) -> SimResult<Self> {
        let config = EngineConfig {
            regions:          snapshot.regions.clone(),
            capture:          Some(snapshot.capture.attributes().to_vec()),
            steps_per_second: snapshot.steps_per_second,
            links:            snapshot.links.clone(),
        };
        config.validate()?;
        if snapshot.model_states.len() != snapshot.regions.len() {
            return Err(SimError::invalid_config(format!(
                "snapshot has {} model states for {} regions",
                snapshot.model_states.len(),
                snapshot.regions.len()
            )));
        }

        let mut models = create_models(&snapshot.regions, factory)?;
        for ((model, state), region) in models
            .iter_mut()
            .zip(&snapshot.model_states)
            .zip(&snapshot.regions)
        {
            model.restore_state(state).map_err(|e| {
                SimError::Other(e.context(format!("restoring model state for region '{region}'")))
            })?;
        }

        // The next advance reads the coupled values of the saved step.
        let mut link_values = snapshot.link_values.into_iter();
        let mut links = Vec::with_capacity(snapshot.links.len());
        for link in snapshot.links {
            let installed = link_values.next().flatten();
            links.push(LinkRuntime::restored(link, installed, &mut models)?);
        }

        let rows: Vec<OutputRow> = rows
            .into_iter()
            .filter(|row| row.step <= snapshot.clock.current_step)
            .collect();
        let output = OutputLog::with_rows(snapshot.regions.clone(), snapshot.capture, rows)?;

        log::info!(
            "engine restored at step {} (t={})",
            snapshot.clock.current_step,
            snapshot.clock.current_time()
        );
        Ok(Self::assemble(
            snapshot.regions,
            models,
            links,
            snapshot.clock,
            snapshot.steps_per_second,
            output,
        ))
    }

    /// Load the latest snapshot and output of `run_id` from `store`.
    pub fn resume(store: &SimStore, run_id: &str, factory: &dyn ModelFactory) -> SimResult<Self> {
        let (_, json) = store
            .latest_snapshot(run_id)?
            .ok_or_else(|| SimError::Other(anyhow::anyhow!("no snapshot saved for run '{run_id}'")))?;
        let snapshot: EngineSnapshot = serde_json::from_str(&json)?;
        let rows = store.output_rows(run_id, &snapshot.regions, &snapshot.capture)?;
        Self::restore(snapshot, rows, factory)
    }

    fn assemble(
        regions: Vec<RegionId>,
        models: Vec<Box<dyn SimulationModel>>,
        links: Vec<LinkRuntime>,
        clock: StepClock,
        steps_per_second: f64,
        output: OutputLog,
    ) -> Self {
        let region_set: HashSet<RegionId> = regions.iter().cloned().collect();
        let completed = clock.current_step;
        Self {
            regions:        Arc::new(regions),
            queue:          ActionQueue::new(Arc::new(region_set)),
            link_inbox:     Mutex::new(Vec::new()),
            output:         Arc::new(output),
            events:         EventBus::new(),
            control:        Mutex::new(Control { paused: true, running: false, steps_per_second }),
            wake:           Condvar::new(),
            completed_step: AtomicU64::new(completed),
            active_loops:   AtomicUsize::new(0),
            core:           Mutex::new(StepCore {
                models,
                links,
                book: ActionBook::new(),
                clock,
            }),
        }
    }

    // ── Accessors ──────────────────────────────────────────────

    pub fn regions(&self) -> &[RegionId] {
        &self.regions
    }

    pub fn capture(&self) -> &CaptureSet {
        self.output.capture()
    }

    /// Shared handle on the output log, readable from any thread.
    pub fn output(&self) -> Arc<OutputLog> {
        Arc::clone(&self.output)
    }

    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Last completed step; 0 before the first step.
    pub fn current_step(&self) -> StepIndex {
        self.completed_step.load(Ordering::Acquire)
    }

    pub fn current_time(&self) -> f64 {
        lock(&self.core).clock.current_time()
    }

    pub fn is_finished(&self) -> bool {
        lock(&self.core).clock.is_finished()
    }

    /// Number of step loops currently running. Never more than one.
    pub fn active_loops(&self) -> usize {
        self.active_loops.load(Ordering::SeqCst)
    }

    pub fn step_rate(&self) -> f64 {
        lock(&self.control).steps_per_second
    }

    /// Links applied every step, including ones not yet picked up.
    pub fn links(&self) -> Vec<Link> {
        let mut links: Vec<Link> = lock(&self.core).links.iter().map(|rt| rt.link.clone()).collect();
        links.extend(lock(&self.link_inbox).iter().cloned());
        links
    }

    pub fn active_actions(&self, region: &str) -> SimResult<Vec<String>> {
        self.region_index(region)?;
        Ok(lock(&self.core).book.active_on(region))
    }

    /// Evaluate `attribute` on `region`'s model right now.
    /// Blocks while a step is in flight.
    pub fn current_value(&self, region: &str, attribute: &str) -> SimResult<f64> {
        let index = self.region_index(region)?;
        let core = lock(&self.core);
        core.models[index].get(attribute).map_err(|e| {
            SimError::Other(e.context(format!("reading '{attribute}' on region '{region}'")))
        })
    }

    pub fn query_output(
        &self,
        region: &str,
        attribute: &str,
        steps: impl RangeBounds<StepIndex>,
    ) -> SimResult<Vec<SeriesPoint>> {
        self.output.series(region, attribute, steps)
    }

    fn region_index(&self, region: &str) -> SimResult<usize> {
        self.regions
            .iter()
            .position(|id| id == region)
            .ok_or_else(|| SimError::InvalidRegion { region: region.to_string() })
    }

    // ── Inbound ────────────────────────────────────────────────

    /// Queue an action for the next step boundary. Returns its id.
    pub fn submit_action(&self, action: Action) -> SimResult<String> {
        self.queue.submit(action, self.current_step())
    }

    /// Add a link. It is evaluated from the next step on.
    pub fn configure_link(&self, link: Link) -> SimResult<()> {
        link.validate()?;
        log::info!(
            "link configured: {:?} {} -> {}",
            link.kind,
            link.source_attribute,
            link.target_attribute
        );
        lock(&self.link_inbox).push(link);
        Ok(())
    }

    /// Change the target step rate. Takes effect on the current wait.
    pub fn set_step_rate(&self, steps_per_second: f64) -> SimResult<()> {
        validate_rate(steps_per_second)?;
        lock(&self.control).steps_per_second = steps_per_second;
        self.wake.notify_all();
        log::info!("step rate set to {steps_per_second}/s");
        Ok(())
    }

    // ── Run control ────────────────────────────────────────────

    /// Ask the loop to stop at the next step boundary. Does not wait.
    pub fn pause(&self) {
        let changed = {
            let mut control = lock(&self.control);
            let changed = !control.paused;
            control.paused = true;
            changed
        };
        self.wake.notify_all();
        if changed {
            log::info!("engine paused at step {}", self.current_step());
            self.events.publish(EngineEvent::Paused);
        }
    }

    pub fn is_paused(&self) -> bool {
        lock(&self.control).paused
    }

    /// Run the step loop on the calling thread until paused, finished or
    /// failed.
    pub fn run(&self) -> SimResult<()> {
        self.begin()?;
        self.drive(|| self.step_loop())
    }

    /// Run the step loop on a dedicated worker thread.
    pub fn spawn(self: &Arc<Self>) -> SimResult<EngineWorker> {
        self.begin()?;
        let engine = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("regionsim-step".to_string())
            .spawn(move || engine.drive(|| engine.step_loop()));
        match handle {
            Ok(handle) => Ok(EngineWorker { handle }),
            Err(e) => {
                self.end();
                Err(SimError::Other(anyhow::anyhow!("cannot spawn step worker: {e}")))
            }
        }
    }

    /// Execute `n` steps back to back, unthrottled, on the calling thread.
    /// Stops early if paused from elsewhere or the final time is reached.
    pub fn run_steps(&self, n: u64) -> SimResult<()> {
        self.begin()?;
        self.drive(|| {
            for _ in 0..n {
                if self.is_paused() || !self.step_or_finish()? {
                    break;
                }
            }
            Ok(())
        })
    }

    fn begin(&self) -> SimResult<()> {
        let mut control = lock(&self.control);
        if control.running {
            return Err(SimError::AlreadyRunning);
        }
        control.running = true;
        control.paused = false;
        self.active_loops.fetch_add(1, Ordering::SeqCst);
        log::info!("step loop started at step {}", self.current_step());
        Ok(())
    }

    fn end(&self) {
        let was_running_unpaused = {
            let mut control = lock(&self.control);
            let unpaused = !control.paused;
            control.paused = true;
            control.running = false;
            unpaused
        };
        self.active_loops.fetch_sub(1, Ordering::SeqCst);
        if was_running_unpaused {
            self.events.publish(EngineEvent::Paused);
        }
    }

    /// Run `body` as the one active loop, then publish `Stopped`.
    fn drive(&self, body: impl FnOnce() -> SimResult<()>) -> SimResult<()> {
        let result = {
            let _guard = LoopGuard(self);
            body()
        };
        let step = self.current_step();
        match &result {
            Ok(()) => log::info!("step loop stopped at step {step}"),
            Err(e) => log::error!("step loop failed after step {step}: {e}"),
        }
        self.events.publish(EngineEvent::Stopped {
            step,
            error: result.as_ref().err().map(|e| e.to_string()),
        });
        result
    }

    fn step_loop(&self) -> SimResult<()> {
        loop {
            if self.is_paused() {
                return Ok(());
            }
            let started = Instant::now();
            if !self.step_or_finish()? {
                return Ok(());
            }
            self.pace(started);
        }
    }

    /// One step, or pause when the final time is reached. `Finished` is
    /// followed by `Paused`, as with any other pause.
    /// Returns false when no step was taken.
    fn step_or_finish(&self) -> SimResult<bool> {
        let mut guard = lock(&self.core);
        let core = &mut *guard;
        if core.clock.is_finished() {
            let (step, time) = (core.clock.current_step, core.clock.current_time());
            drop(guard);
            log::info!("final time {time} reached at step {step}");
            let was_running = !std::mem::replace(&mut lock(&self.control).paused, true);
            self.events.publish(EngineEvent::Finished { step, time });
            if was_running {
                self.events.publish(EngineEvent::Paused);
            }
            return Ok(false);
        }
        self.step(core)?;
        Ok(true)
    }

    /// Sleep out the rest of the step period; `pause()` cuts it short.
    fn pace(&self, started: Instant) {
        let mut control = lock(&self.control);
        loop {
            if control.paused {
                return;
            }
            let Some(period) = step_period(control.steps_per_second) else {
                return;
            };
            let elapsed = started.elapsed();
            if elapsed >= period {
                return;
            }
            control = match self.wake.wait_timeout(control, period - elapsed) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    // ── The step ───────────────────────────────────────────────

    fn step(&self, core: &mut StepCore) -> SimResult<StepIndex> {
        let started = Instant::now();
        let step = core.clock.next_step();
        let time = core.clock.time_at(step);
        let dt = core.clock.time_step;

        // 1. Links and actions submitted since the last step.
        for link in lock(&self.link_inbox).drain(..) {
            core.links.push(LinkRuntime::new(link));
        }
        for queued in self.queue.drain() {
            self.apply_action(core, queued);
        }

        // 2. Advance.
        for (index, model) in core.models.iter_mut().enumerate() {
            model
                .advance(dt)
                .map_err(|e| self.failure(index, StepPhase::Advance, step, e))?;
        }

        // 3. Links read post-advance, pre-commit values of this step.
        for link in core.links.iter_mut() {
            link.apply(&mut core.models)
                .map_err(|f| self.failure(f.index, StepPhase::Link, step, f.source))?;
        }

        // 4. Commit.
        for (index, model) in core.models.iter_mut().enumerate() {
            model
                .commit_time(time)
                .map_err(|e| self.failure(index, StepPhase::Commit, step, e))?;
        }

        // 5. Capture. The whole row is read before anything is appended.
        let capture = self.output.capture();
        let mut values = Vec::with_capacity(core.models.len() * capture.len());
        for (index, model) in core.models.iter().enumerate() {
            for attr in capture.iter() {
                let value = model
                    .get(attr)
                    .map_err(|e| self.failure(index, StepPhase::Capture, step, e))?;
                values.push(value);
            }
        }
        self.output.append(OutputRow { step, time, values })?;

        core.clock.complete(step);
        self.completed_step.store(step, Ordering::Release);
        log::debug!("step={step} t={time} took={:?}", started.elapsed());

        // 6. Notify.
        self.events.publish(EngineEvent::StepCompleted { step });
        Ok(step)
    }

    fn apply_action(&self, core: &mut StepCore, queued: QueuedAction) {
        let QueuedAction { action_id, queued_at, action } = queued;
        let targets: Vec<usize> = match &action.region {
            Some(region) => self.regions.iter().position(|id| id == region).into_iter().collect(),
            None => (0..self.regions.len()).collect(),
        };

        let mut changed = false;
        for index in targets {
            let model = core.models[index].as_mut();
            changed |= core.book.apply(&action, &self.regions[index], model);
        }

        if changed {
            log::info!(
                "applied {} '{}' ({action_id}, queued at step {queued_at}) activated={} region={:?}",
                action.kind_name(),
                action.name,
                action.activated,
                action.region
            );
            self.events.publish(EngineEvent::ActionApplied { action });
        } else {
            log::debug!("action '{}' ({action_id}) left state unchanged", action.name);
        }
    }

    fn failure(&self, index: usize, phase: StepPhase, step: StepIndex, source: anyhow::Error) -> SimError {
        SimError::ModelStepFailure {
            region: self.regions[index].clone(),
            phase,
            step,
            source,
        }
    }

    // ── Persistence ────────────────────────────────────────────

    /// Capture the state needed to resume. Blocks while a step is in flight.
    pub fn snapshot(&self) -> SimResult<EngineSnapshot> {
        let core = lock(&self.core);
        let mut model_states = Vec::with_capacity(core.models.len());
        for (model, region) in core.models.iter().zip(self.regions.iter()) {
            match model.save_state()? {
                Some(state) => model_states.push(state),
                None => return Err(SimError::SnapshotUnsupported { region: region.clone() }),
            }
        }
        let mut links: Vec<Link> = core.links.iter().map(|rt| rt.link.clone()).collect();
        let mut link_values: Vec<Option<Vec<f64>>> =
            core.links.iter().map(|rt| rt.installed().map(<[f64]>::to_vec)).collect();
        for link in lock(&self.link_inbox).iter() {
            links.push(link.clone());
            link_values.push(None);
        }

        Ok(EngineSnapshot {
            saved_at: chrono::Utc::now(),
            regions: self.regions.to_vec(),
            capture: self.output.capture().clone(),
            clock: core.clock.clone(),
            steps_per_second: self.step_rate(),
            links,
            link_values,
            model_states,
        })
    }

    /// Write unsaved output rows and a snapshot for `run_id`.
    pub fn save(&self, store: &SimStore, run_id: &str) -> SimResult<StepIndex> {
        let snapshot = self.snapshot()?;
        let step = snapshot.clock.current_step;
        let saved_through = store.last_output_step(run_id)?.unwrap_or(0);
        let rows: Vec<OutputRow> = self
            .output
            .rows_after(saved_through)
            .into_iter()
            .filter(|row| row.step <= step)
            .collect();
        store.append_output_rows(run_id, &self.output, &rows)?;
        store.save_snapshot(run_id, step, &serde_json::to_string(&snapshot)?)?;
        log::info!("saved run '{run_id}' at step {step} ({} new row(s))", rows.len());
        Ok(step)
    }
}

/// Resets the running state even if the loop body panics.
struct LoopGuard<'a>(&'a StepEngine);

impl Drop for LoopGuard<'_> {
    fn drop(&mut self) {
        self.0.end();
    }
}

/// Handle on a step loop running on its own thread.
#[derive(Debug)]
pub struct EngineWorker {
    handle: JoinHandle<SimResult<()>>,
}

impl EngineWorker {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the loop to exit and return how it ended.
    pub fn join(self) -> SimResult<()> {
        self.handle
            .join()
            .map_err(|_| SimError::Other(anyhow::anyhow!("step worker panicked")))?
    }
}

fn create_models(regions: &[RegionId], factory: &dyn ModelFactory) -> SimResult<Vec<Box<dyn SimulationModel>>> {
    regions
        .iter()
        .enumerate()
        .map(|(index, region)| {
            factory.create(index, region).map_err(|e| {
                SimError::Other(e.context(format!("creating model for region '{region}'")))
            })
        })
        .collect()
}

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::config::{CommandKind, Config};
use super::constants::{
    ABORT_LOOKAHEAD, FALLBACK_WEDGE_SIZE, FINAL_DIR_PREFIX, WEDGE_DIR_PREFIX, WEDGE_TARGET_DEGREES,
};
use super::error::{IntegrationError, SchedulerError};
use super::file_watcher::{Deadline, FileWatcher, WaitOutcome};
use super::integration::{AttemptKind, AttemptOutcome, Integrator};
use super::run_spec::RunSpecification;
use super::tool::CancelToken;
use super::worker_status::{StatusSender, WorkerStage};

/// Number of progress messages sent over a whole collection
const PROGRESS_STEPS: u32 = 100;

/// Images per wedge: ten degrees of rotation, or the fallback when the
/// oscillation is unusable
pub fn wedge_size(osc_range: f64) -> u32 {
    if osc_range.is_finite() && osc_range > 0.0 {
        let size = (WEDGE_TARGET_DEGREES / osc_range).floor();
        if size >= 1.0 && size < u32::MAX as f64 {
            return size as u32;
        }
    }
    FALLBACK_WEDGE_SIZE
}

/// Directory a wedge over these images runs in
pub fn wedge_dir(work_dir: &Path, range: (u32, u32)) -> PathBuf {
    work_dir.join(format!("{WEDGE_DIR_PREFIX}{}_{}", range.0, range.1))
}

/// Directory the final pass over these images runs in. Never shared with a
/// wedge, even one ending on the same image.
pub fn final_dir(work_dir: &Path, range: (u32, u32)) -> PathBuf {
    work_dir.join(format!("{FINAL_DIR_PREFIX}{}_{}", range.0, range.1))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    WedgeIntegrating,
    WedgeDone,
    FinalIntegrating,
    Polishing,
    Complete,
    Aborted,
}

/// Decides wedge boundaries as images are confirmed.
///
/// A boundary is every multiple of the wedge size counted from the first
/// image. A wedge covers every image since the end of the last launched wedge,
/// so a skipped boundary is folded into the next one.
#[derive(Debug, Clone)]
pub struct WedgePlanner {
    first: u32,
    size: u32,
    next_start: u32,
}

impl WedgePlanner {
    pub fn new(first: u32, size: u32) -> Self {
        Self {
            first,
            size: size.max(1),
            next_start: first,
        }
    }

    pub fn is_boundary(&self, image: u32) -> bool {
        image >= self.first && (image - self.first + 1) % self.size == 0
    }

    /// Claim the wedge ending at this image
    pub fn take(&mut self, image: u32) -> (u32, u32) {
        let wedge = (self.next_start, image);
        self.next_start = image + 1;
        wedge
    }
}

/// Runs the integration attempts the scheduler decides on. Wedges run in the
/// background; the final pass blocks.
pub trait WedgeRunner {
    fn launch(&mut self, wedge: (u32, u32)) -> Result<(), SchedulerError>;
    /// Is a wedge still running. A finished wedge is reaped by this call.
    fn is_busy(&mut self) -> bool;
    /// Stop the running wedge, if any, and discard its result
    fn cancel(&mut self);
    fn integrate_final(&mut self, range: (u32, u32)) -> Result<AttemptOutcome, IntegrationError>;
}

struct RunningWedge {
    range: (u32, u32),
    cancel: CancelToken,
    handle: JoinHandle<Result<AttemptOutcome, IntegrationError>>,
}

/// Runs each wedge on its own thread, one at a time
pub struct ThreadWedgeRunner {
    integrator: Arc<Integrator>,
    work_dir: PathBuf,
    current: Option<RunningWedge>,
    cancel: CancelToken,
    wedges_done: u32,
}

impl ThreadWedgeRunner {
    pub fn new(integrator: Integrator, work_dir: &Path) -> Self {
        Self {
            integrator: Arc::new(integrator),
            work_dir: work_dir.to_path_buf(),
            current: None,
            cancel: CancelToken::new(),
            wedges_done: 0,
        }
    }

    /// Token that stops the final pass
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Wedges that ran to a result, successful or not
    pub fn wedges_done(&self) -> u32 {
        self.wedges_done
    }

    fn reap(&mut self, wedge: RunningWedge) {
        let (first, last) = wedge.range;
        match wedge.handle.join() {
            Ok(Ok(outcome)) => {
                self.wedges_done += 1;
                log::info!(
                    "Wedge {first}-{last} finished with status {:?}",
                    outcome.record.status
                );
            }
            Ok(Err(e)) if wedge.cancel.is_cancelled() => {
                log::info!("Wedge {first}-{last} was cancelled: {e}");
            }
            Ok(Err(e)) => {
                self.wedges_done += 1;
                log::error!("Wedge {first}-{last} failed: {e}");
            }
            Err(_) => log::error!("Wedge {first}-{last} thread panicked"),
        }
    }
}

impl WedgeRunner for ThreadWedgeRunner {
    fn launch(&mut self, wedge: (u32, u32)) -> Result<(), SchedulerError> {
        let integrator = self.integrator.clone();
        let dir = wedge_dir(&self.work_dir, wedge);
        let cancel = CancelToken::new();
        let token = cancel.clone();
        let handle = std::thread::Builder::new()
            .name(format!("wedge_{}_{}", wedge.0, wedge.1))
            .spawn(move || integrator.integrate(&dir, wedge, AttemptKind::Wedge, &token))?;
        self.current = Some(RunningWedge {
            range: wedge,
            cancel,
            handle,
        });
        Ok(())
    }

    fn is_busy(&mut self) -> bool {
        match self.current.take() {
            Some(wedge) if !wedge.handle.is_finished() => {
                self.current = Some(wedge);
                true
            }
            Some(wedge) => {
                self.reap(wedge);
                false
            }
            None => false,
        }
    }

    fn cancel(&mut self) {
        if let Some(wedge) = self.current.take() {
            log::info!("Cancelling wedge {}-{}", wedge.range.0, wedge.range.1);
            wedge.cancel.cancel();
            self.reap(wedge);
        }
    }

    fn integrate_final(&mut self, range: (u32, u32)) -> Result<AttemptOutcome, IntegrationError> {
        let dir = final_dir(&self.work_dir, range);
        self.integrator
            .integrate(&dir, range, AttemptKind::Final, &self.cancel)
    }
}

/// The final pass and how the collection ended
#[derive(Debug, Clone)]
pub struct FinalOutcome {
    pub range: (u32, u32),
    /// Images stopped arriving before the expected last image
    pub collection_aborted: bool,
    pub attempt: AttemptOutcome,
}

/// The per dataset state machine. Follows the collection, launches wedges and
/// runs the final pass over everything confirmed.
pub struct WedgeScheduler<R: WedgeRunner> {
    command: CommandKind,
    run_spec: RunSpecification,
    watcher: FileWatcher,
    wait_timeout: Duration,
    wedge_size: u32,
    runner: R,
    status: Option<StatusSender>,
    history: Vec<SchedulerState>,
}

impl<R: WedgeRunner> WedgeScheduler<R> {
    pub fn new(command: CommandKind, run_spec: RunSpecification, runner: R) -> Self {
        let wedge_size = wedge_size(run_spec.osc_range);
        Self {
            command,
            run_spec,
            watcher: FileWatcher::default(),
            wait_timeout: Duration::from_secs(60),
            wedge_size,
            runner,
            status: None,
            history: vec![SchedulerState::Idle],
        }
    }

    pub fn from_config(config: &Config, run_spec: RunSpecification, runner: R) -> Self {
        Self::new(config.command, run_spec, runner)
            .with_watcher(FileWatcher::new(config.poll_interval()), config.image_wait_timeout())
    }

    pub fn with_watcher(mut self, watcher: FileWatcher, wait_timeout: Duration) -> Self {
        self.watcher = watcher;
        self.wait_timeout = wait_timeout;
        self
    }

    pub fn with_status(mut self, status: StatusSender) -> Self {
        self.status = Some(status);
        self
    }

    pub fn state(&self) -> SchedulerState {
        self.history
            .last()
            .copied()
            .unwrap_or(SchedulerState::Idle)
    }

    /// Every state entered so far, in order
    pub fn history(&self) -> &[SchedulerState] {
        &self.history
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn run(&mut self) -> Result<FinalOutcome, SchedulerError> {
        let first = self.run_spec.start;
        let last = self.run_spec.last_image();
        let (range, collection_aborted) = match self.command {
            CommandKind::TotalOnDisk => {
                let path = self.run_spec.image_path(first);
                if !path.exists() && !self.watcher.recheck(&path) {
                    self.enter(SchedulerState::Aborted);
                    return Err(SchedulerError::NoImages(path));
                }
                ((first, last), false)
            }
            // the images are only visible on the nodes holding them
            CommandKind::RamDistributed => ((first, last), false),
            CommandKind::Incremental => match self.follow_collection() {
                Ok(result) => result,
                Err(e) => {
                    self.runner.cancel();
                    self.enter(SchedulerState::Aborted);
                    return Err(e);
                }
            },
        };

        if self.runner.is_busy() {
            log::info!("Final image confirmed while a wedge is running");
            self.runner.cancel();
        }
        self.enter(SchedulerState::FinalIntegrating);
        self.report(0.0, WorkerStage::Final)?;
        match self.runner.integrate_final(range) {
            Ok(attempt) => {
                if attempt.polished {
                    self.enter(SchedulerState::Polishing);
                }
                self.enter(SchedulerState::Complete);
                Ok(FinalOutcome {
                    range,
                    collection_aborted,
                    attempt,
                })
            }
            Err(e) => {
                log::error!("Final integration of {}-{} failed: {e}", range.0, range.1);
                self.enter(SchedulerState::Aborted);
                Err(SchedulerError::FinalFailed(e))
            }
        }
    }

    /// Wait for each image in turn, launching wedges on the way. Returns the
    /// range to integrate and whether the collection stopped early.
    fn follow_collection(&mut self) -> Result<((u32, u32), bool), SchedulerError> {
        let first = self.run_spec.start;
        let last = self.run_spec.last_image();
        log::info!(
            "Following collection of images {first}-{last} in wedges of {}",
            self.wedge_size
        );
        let mut planner = WedgePlanner::new(first, self.wedge_size);
        let mut deadline = Deadline::start(self.wait_timeout);
        let progress_step = (self.run_spec.total / PROGRESS_STEPS).max(1);
        let mut confirmed = None;
        let mut aborted = false;

        let mut image = first;
        while image <= last {
            let path = self.run_spec.image_path(image);
            match self.watcher.wait_until(&path, &mut deadline) {
                WaitOutcome::Found => {
                    deadline.restart();
                    confirmed = Some(image);
                    let count = image - first + 1;
                    if count % progress_step == 0 || image == last {
                        self.report(count as f32 / self.run_spec.total as f32, WorkerStage::Wedge)?;
                    }
                    // the last image goes to the final pass
                    if image < last && planner.is_boundary(image) {
                        self.trigger(&mut planner, image)?;
                    }
                    image += 1;
                }
                WaitOutcome::TimedOut => match self.lookahead(image) {
                    Some(later) => {
                        log::warn!(
                            "Image {} never appeared but image {later} did; carrying on",
                            path.to_string_lossy()
                        );
                        deadline.restart();
                        image = later;
                    }
                    None => {
                        log::warn!(
                            "Collection stopped: image {} did not appear within {:?}",
                            path.to_string_lossy(),
                            self.wait_timeout
                        );
                        aborted = true;
                        break;
                    }
                },
            }
        }
        deadline.cancel();

        let Some(last_confirmed) = confirmed else {
            return Err(SchedulerError::NoImages(self.run_spec.image_path(first)));
        };
        Ok(((first, last_confirmed), aborted))
    }

    /// The first of the next few images present after a missing one, if any
    fn lookahead(&self, missing: u32) -> Option<u32> {
        (1..=ABORT_LOOKAHEAD)
            .map(|n| missing + n)
            .filter(|n| self.run_spec.contains(*n))
            .find(|n| self.watcher.recheck(&self.run_spec.image_path(*n)))
    }

    fn trigger(&mut self, planner: &mut WedgePlanner, image: u32) -> Result<(), SchedulerError> {
        if self.runner.is_busy() {
            log::info!("Wedge still running at image {image}; skipping this boundary");
            return Ok(());
        }
        if self.state() == SchedulerState::WedgeIntegrating {
            self.enter(SchedulerState::WedgeDone);
        }
        let wedge = planner.take(image);
        log::info!("Launching wedge {}-{}", wedge.0, wedge.1);
        self.runner.launch(wedge)?;
        self.enter(SchedulerState::WedgeIntegrating);
        Ok(())
    }

    fn enter(&mut self, state: SchedulerState) {
        log::debug!("Scheduler {:?} -> {state:?}", self.state());
        self.history.push(state);
    }

    fn report(&self, progress: f32, stage: WorkerStage) -> Result<(), SchedulerError> {
        if let Some(status) = &self.status {
            status.send(progress, stage)?;
        }
        Ok(())
    }
}

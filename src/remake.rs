use std::convert::Infallible;
use std::future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio::time::{interval_at, sleep, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::makecmd::process::ExitError;
use crate::makecmd::tool::BuildTool;
use crate::makecmd::{BuildTask, TaskError, TaskState};
use crate::parser::Args;
use crate::watcher::Client;

use self::progress::ProgressChecker;

pub mod progress;

#[derive(Debug, thiserror::Error)]
pub enum GoalError {
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error("Grace period exceeded: {command}")]
    GraceExceeded { command: String },
}

impl GoalError {
    pub fn is_fatal(&self) -> bool {
        match self {
            GoalError::Task(e) => e.is_fatal(),
            GoalError::GraceExceeded { .. } => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// How long a starting build may go without progress before it is killed.
    pub grace: Duration,
    /// Interval between polled checks, zero disables polling.
    pub poll: Duration,
    /// Pause before starting over after a failed cycle.
    pub error_sleep: Duration,
    /// Delay of the one check that grace always makes, for long-running
    /// phony goals that are already up to date and never send a ready signal.
    pub forced_check: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(10),
            poll: Duration::ZERO,
            error_sleep: Duration::from_secs(5),
            forced_check: Duration::from_secs(1),
        }
    }
}

impl From<&Args> for Settings {
    fn from(args: &Args) -> Self {
        Self {
            grace: args.grace,
            poll: args.poll,
            ..Default::default()
        }
    }
}

/// Serializes starting builds, so goals with shared prerequisites never
/// build them at the same time.
#[derive(Debug, Default)]
pub struct BuildLock {
    mutex: Mutex<()>,
    holders: AtomicUsize,
}

pub struct BuildGuard<'a> {
    _guard: MutexGuard<'a, ()>,
    holders: &'a AtomicUsize,
}

impl BuildLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self) -> BuildGuard<'_> {
        let guard = self.mutex.lock().await;
        self.holders.fetch_add(1, Ordering::SeqCst);
        BuildGuard {
            _guard: guard,
            holders: &self.holders,
        }
    }

    /// Number of guards currently alive.
    pub fn holders(&self) -> usize {
        self.holders.load(Ordering::SeqCst)
    }
}

impl Drop for BuildGuard<'_> {
    fn drop(&mut self) {
        self.holders.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Event sources of one goal, besides its own build process.
#[derive(Default)]
pub struct GoalEvents {
    pub ready: Option<mpsc::Receiver<()>>,
    pub watcher: Option<Client>,
}

enum Wake {
    Ready,
    Exited(Result<(), ExitError>),
    Forced,
    Check,
    Stalled,
}

/// Keeps goals up to date: builds each goal, waits for the build to settle,
/// then restarts it whenever make reports it out of date.
pub struct Remake {
    tool: Arc<dyn BuildTool>,
    lock: Arc<BuildLock>,
    settings: Settings,
}

impl Remake {
    pub fn new(tool: Arc<dyn BuildTool>, lock: Arc<BuildLock>, settings: Settings) -> Self {
        Self {
            tool,
            lock,
            settings,
        }
    }

    pub fn lock(&self) -> &Arc<BuildLock> {
        &self.lock
    }

    /// Runs build cycles for a goal forever. It only returns for errors that
    /// retrying cannot fix.
    #[instrument(name = "goal", skip_all, fields(goal = label(&goal)))]
    pub async fn run_goal_forever(
        &self,
        goal: String,
        mut events: GoalEvents,
    ) -> Result<Infallible, GoalError> {
        loop {
            let mut task = BuildTask::new(goal.clone(), self.tool.clone());
            match self.run_cycle(&mut task, &mut events).await {
                Ok(()) => info!("Remake: restarting {task}"),
                Err(e) => {
                    task.kill().await;
                    if e.is_fatal() {
                        error!("Remake: giving up on {task}: {e}");
                        return Err(e);
                    }
                    error!("Remake: {e}");
                    sleep(self.settings.error_sleep).await;
                }
            }
        }
    }

    /// One cycle: start the build, let it settle, then watch it until it
    /// goes out of date. The build process is killed when this returns `Ok`.
    pub async fn run_cycle(
        &self,
        task: &mut BuildTask,
        events: &mut GoalEvents,
    ) -> Result<(), GoalError> {
        self.update_watched(task, events).await?;
        self.grace(task, events).await?;
        task.set_state(TaskState::Finished);
        info!("Remake: monitoring {task}");
        self.monitor(task, events).await
    }

    /// Starts the build while holding the build lock, and waits for it to
    /// finish building, exit, or send a ready signal. Kills it when it stops
    /// making progress for longer than the grace period.
    pub async fn grace(
        &self,
        task: &mut BuildTask,
        events: &mut GoalEvents,
    ) -> Result<(), GoalError> {
        let _guard = self.lock.acquire().await;

        task.start()?;
        info!("Remake: started {task}");

        let mut progress = ProgressChecker::new(self.settings.grace);
        let forced = sleep(self.settings.forced_check);
        tokio::pin!(forced);
        let mut forced_done = false;
        let mut poll = poll_timer(self.settings.poll);

        loop {
            let wake = tokio::select! {
                _ = recv(&mut events.ready) => Wake::Ready,
                exit = task.finished() => Wake::Exited(exit),
                _ = &mut forced, if !forced_done => Wake::Forced,
                _ = tick(&mut poll) => Wake::Check,
                _ = changed(&mut events.watcher) => Wake::Check,
                _ = &mut progress.stalled => Wake::Stalled,
            };

            match wake {
                Wake::Ready => {
                    debug!("ready signal received");
                    // Later changes are judged against this moment.
                    task.sample_progress().await?;
                    return Ok(());
                }
                Wake::Exited(exit) => {
                    if let Err(e) = exit {
                        warn!("Remake: {task}: {e}");
                    }
                    task.sample_progress().await?;
                    return Ok(());
                }
                Wake::Forced | Wake::Check => {
                    forced_done = true;
                    if progress.check(task).await?.done {
                        return Ok(());
                    }
                    self.update_watched(task, events).await?;
                }
                Wake::Stalled => {
                    // One last chance before killing it.
                    let last = progress.check(task).await?;
                    if last.done {
                        return Ok(());
                    }
                    if last.progressing {
                        continue;
                    }
                    if !task.is_running() {
                        // Already exited, which ends grace like any exit.
                        if let Err(e) = task.finished().await {
                            warn!("Remake: {task}: {e}");
                        }
                        return Ok(());
                    }
                    task.kill().await;
                    return Err(GoalError::GraceExceeded {
                        command: task.to_string(),
                    });
                }
            }
        }
    }

    /// Waits until the goal is out of date, then kills the build.
    pub async fn monitor(
        &self,
        task: &mut BuildTask,
        events: &mut GoalEvents,
    ) -> Result<(), GoalError> {
        let mut poll = poll_timer(self.settings.poll);
        self.update_watched(task, events).await?;

        loop {
            let wake = tokio::select! {
                exit = task.finished() => Wake::Exited(exit),
                _ = recv(&mut events.ready) => Wake::Ready,
                _ = tick(&mut poll) => Wake::Check,
                _ = changed(&mut events.watcher) => Wake::Check,
            };

            match wake {
                Wake::Exited(Ok(())) => debug!("{task} exited"),
                Wake::Exited(Err(e)) => warn!("Remake: {task}: {e}"),
                Wake::Ready => debug!("ignoring ready signal outside of grace"),
                Wake::Check | Wake::Forced | Wake::Stalled => {
                    if task.has_changed().await? {
                        info!("Remake: {task} is out of date");
                        task.kill().await;
                        task.set_state(TaskState::Superseded);
                        return Ok(());
                    }
                    self.update_watched(task, events).await?;
                }
            }
        }
    }

    async fn update_watched(
        &self,
        task: &mut BuildTask,
        events: &GoalEvents,
    ) -> Result<(), GoalError> {
        if let Some(client) = &events.watcher {
            client.watch(task.watched_files().await?);
        }
        Ok(())
    }
}

fn label(goal: &str) -> &str {
    if goal.is_empty() {
        "(default)"
    } else {
        goal
    }
}

fn poll_timer(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut timer = interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(timer)
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => future::pending().await,
    }
}

async fn recv(rx: &mut Option<mpsc::Receiver<()>>) {
    if let Some(inner) = rx.as_mut() {
        if inner.recv().await.is_some() {
            return;
        }
    }
    // Closed or absent: this source never fires again.
    *rx = None;
    future::pending().await
}

async fn changed(client: &mut Option<Client>) {
    match client {
        Some(client) => client.changed().await,
        None => future::pending().await,
    }
}

use std::fmt;
use std::future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use tracing::{debug, error};

use crate::makedb::{Database, DatabaseError};

use self::process::{ExitError, Process};
use self::tool::BuildTool;

pub mod process;
pub mod tool;

const KILL_RETRY: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Error starting {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("Error running {command}: {source}")]
    Query {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("Error reading {command}: {source}")]
    Database {
        command: String,
        #[source]
        source: DatabaseError,
    },
    #[error("Goal '{goal}': cannot check for changes before sampling progress")]
    ChangeBeforeProgress { goal: String },
    #[error("Goal '{goal}': cannot sample progress after checking for changes")]
    ProgressAfterChange { goal: String },
}

impl TaskError {
    /// Errors that come from misusing the task or the database, rather than
    /// from the environment. Retrying them would only repeat them.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TaskError::ChangeBeforeProgress { .. }
                | TaskError::ProgressAfterChange { .. }
                | TaskError::Database {
                    source: DatabaseError::TargetNotFound { .. },
                    ..
                }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Started,
    Progressing,
    Stalled,
    Finished,
    Superseded,
}

/// One build of one goal: the running make process and the bookkeeping
/// needed to tell whether its goal is up to date.
pub struct BuildTask {
    goal: String,
    tool: Arc<dyn BuildTool>,
    process: Option<Box<dyn Process>>,
    db: Option<Database>,
    progressed_at: Option<DateTime<Local>>,
    remaining: usize,
    used_changed: bool,
    state: TaskState,
}

impl BuildTask {
    pub fn new(goal: impl Into<String>, tool: Arc<dyn BuildTool>) -> Self {
        Self {
            goal: goal.into(),
            tool,
            process: None,
            db: None,
            progressed_at: None,
            remaining: 0,
            used_changed: false,
            state: TaskState::Created,
        }
    }

    pub fn goal(&self) -> &str {
        &self.goal
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: TaskState) {
        self.state = state;
    }

    /// Number of out of date targets at the last `sample_progress`.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn progressed_at(&self) -> Option<DateTime<Local>> {
        self.progressed_at
    }

    pub fn start(&mut self) -> Result<(), TaskError> {
        let process = self.tool.start(&self.goal).map_err(|source| TaskError::Spawn {
            command: self.to_string(),
            source,
        })?;
        self.process = Some(process);
        self.state = TaskState::Started;
        Ok(())
    }

    /// Counts how many targets still need updating and remembers when that
    /// was measured. Used while the build is starting up, never after
    /// `has_changed`.
    pub async fn sample_progress(&mut self) -> Result<usize, TaskError> {
        if self.used_changed {
            return Err(TaskError::ProgressAfterChange {
                goal: self.goal.clone(),
            });
        }
        let now = Local::now();
        let db = self.query().await?;
        let remaining = db
            .count_pending(&self.goal, now)
            .map_err(|source| self.database_error(source))?;
        self.db = Some(db);

        let previous = self.progressed_at.replace(now).map(|_| self.remaining);
        self.state = match previous {
            Some(previous) if previous == remaining => TaskState::Stalled,
            _ => TaskState::Progressing,
        };
        self.remaining = remaining;
        debug!(goal = %self.goal, remaining, "sampled progress");
        Ok(remaining)
    }

    /// Whether the goal went out of date since the last `sample_progress`.
    pub async fn has_changed(&mut self) -> Result<bool, TaskError> {
        let Some(since) = self.progressed_at else {
            return Err(TaskError::ChangeBeforeProgress {
                goal: self.goal.clone(),
            });
        };
        self.used_changed = true;
        let db = self.query().await?;
        let changed = db
            .is_stale(&self.goal, since)
            .map_err(|source| self.database_error(source))?;
        self.db = Some(db);
        Ok(changed)
    }

    /// Resolves when the build process exits. Without a process, or once the
    /// exit has been reported, it never resolves.
    pub async fn finished(&mut self) -> Result<(), ExitError> {
        match self.process.as_mut() {
            Some(process) => process.finished().await,
            None => future::pending().await,
        }
    }

    pub fn is_running(&self) -> bool {
        self.process.as_ref().is_some_and(|process| process.is_running())
    }

    /// Kills the build process and waits for it to exit, trying again until
    /// it succeeds.
    pub async fn kill(&mut self) {
        let Some(process) = self.process.as_mut() else {
            return;
        };
        if !process.is_running() {
            return;
        }
        loop {
            match process.kill().await {
                Ok(()) => break,
                Err(e) => {
                    error!("Remake: Error killing {process}: {e}");
                    tokio::time::sleep(KILL_RETRY).await;
                }
            }
        }
        self.state = TaskState::Superseded;
    }

    /// Real files among the goal and its prerequisites, from the most recent
    /// database when there is one.
    pub async fn watched_files(&mut self) -> Result<Vec<String>, TaskError> {
        let db = match self.db.take() {
            Some(db) => db,
            None => self.query().await?,
        };
        let files = db
            .files(&self.goal)
            .map_err(|source| self.database_error(source));
        self.db = Some(db);
        files
    }

    /// Runs the make query and parses a fresh database from it.
    async fn query(&self) -> Result<Database, TaskError> {
        let command = self.tool.query_command(&self.goal);
        let dump = self
            .tool
            .print_database(&self.goal)
            .await
            .map_err(|source| TaskError::Query {
                command: command.clone(),
                source,
            })?;
        Database::parse(&dump).map_err(|source| TaskError::Database {
            command,
            source: source.into(),
        })
    }

    fn database_error(&self, source: DatabaseError) -> TaskError {
        TaskError::Database {
            command: self.tool.query_command(&self.goal),
            source,
        }
    }
}

impl fmt::Display for BuildTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.process {
            Some(process) => write!(f, "{process}"),
            None => f.write_str(&self.tool.build_command(&self.goal)),
        }
    }
}

#![allow(dead_code)]

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use remake::makecmd::process::{ExitError, Process};
use remake::makecmd::tool::BuildTool;
use remake::remake::BuildLock;
use tokio::time::Instant;

/// How a mock build behaves once started.
#[derive(Debug, Clone, Copy)]
pub enum Build {
    /// Runs until killed, like a server.
    Forever,
    /// Exits successfully after the given time.
    ExitAfter(Duration),
}

#[derive(Default)]
struct Counters {
    start_attempts: AtomicUsize,
    starts: AtomicUsize,
    queries: AtomicUsize,
    kills: AtomicUsize,
    kill_attempts: AtomicUsize,
    fail_kills: AtomicUsize,
    building: AtomicUsize,
    max_building: AtomicUsize,
}

/// A build tool that serves canned database dumps and starts fake builds.
pub struct MockTool {
    dumps: Mutex<VecDeque<String>>,
    build: Mutex<Build>,
    fail_starts: AtomicUsize,
    lock: Mutex<Option<Arc<BuildLock>>>,
    holders_at_start: Mutex<Vec<usize>>,
    counters: Arc<Counters>,
}

impl MockTool {
    pub fn new(dump: impl Into<String>, build: Build) -> Self {
        Self {
            dumps: Mutex::new(VecDeque::from([dump.into()])),
            build: Mutex::new(build),
            fail_starts: AtomicUsize::new(0),
            lock: Mutex::new(None),
            holders_at_start: Mutex::new(Vec::new()),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Serves the given dumps in order, one per query. The last one is
    /// served forever.
    pub fn with_dumps<I, S>(dumps: I, build: Build) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tool = Self::new(String::new(), build);
        *tool.dumps.lock().unwrap() = dumps.into_iter().map(Into::into).collect();
        tool
    }

    pub fn set_dump(&self, dump: impl Into<String>) {
        *self.dumps.lock().unwrap() = VecDeque::from([dump.into()]);
    }

    /// Makes the next `count` starts fail.
    pub fn fail_starts(&self, count: usize) {
        self.fail_starts.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` kills fail, whichever process they target.
    pub fn fail_kills(&self, count: usize) {
        self.counters.fail_kills.store(count, Ordering::SeqCst);
    }

    /// Records how many holders the lock has whenever a build starts.
    pub fn observe_lock(&self, lock: Arc<BuildLock>) {
        *self.lock.lock().unwrap() = Some(lock);
    }

    pub fn holders_at_start(&self) -> Vec<usize> {
        self.holders_at_start.lock().unwrap().clone()
    }

    pub fn start_attempts(&self) -> usize {
        self.counters.start_attempts.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> usize {
        self.counters.starts.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> usize {
        self.counters.queries.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.counters.kills.load(Ordering::SeqCst)
    }

    pub fn kill_attempts(&self) -> usize {
        self.counters.kill_attempts.load(Ordering::SeqCst)
    }

    /// Highest number of builds that were running at the same time.
    pub fn max_building(&self) -> usize {
        self.counters.max_building.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BuildTool for MockTool {
    fn start(&self, goal: &str) -> io::Result<Box<dyn Process>> {
        self.counters.start_attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .fail_starts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(io::Error::new(io::ErrorKind::NotFound, "mock start failure"));
        }

        if let Some(lock) = self.lock.lock().unwrap().as_ref() {
            self.holders_at_start.lock().unwrap().push(lock.holders());
        }
        self.counters.starts.fetch_add(1, Ordering::SeqCst);
        let building = self.counters.building.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters
            .max_building
            .fetch_max(building, Ordering::SeqCst);

        let exit_at = match *self.build.lock().unwrap() {
            Build::Forever => None,
            Build::ExitAfter(after) => Some(Instant::now() + after),
        };
        Ok(Box::new(MockProcess {
            command: self.build_command(goal),
            exit_at,
            stopped: false,
            reported: false,
            counters: self.counters.clone(),
        }))
    }

    async fn print_database(&self, _goal: &str) -> io::Result<String> {
        self.counters.queries.fetch_add(1, Ordering::SeqCst);
        let mut dumps = self.dumps.lock().unwrap();
        let dump = if dumps.len() > 1 {
            dumps.pop_front().unwrap_or_default()
        } else {
            dumps.front().cloned().unwrap_or_default()
        };
        Ok(dump)
    }

    fn build_command(&self, goal: &str) -> String {
        format!("mock-make {goal}")
    }

    fn query_command(&self, goal: &str) -> String {
        format!("mock-make --question --print-data-base {goal}")
    }
}

pub struct MockProcess {
    command: String,
    exit_at: Option<Instant>,
    stopped: bool,
    reported: bool,
    counters: Arc<Counters>,
}

impl MockProcess {
    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.counters.building.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Process for MockProcess {
    async fn finished(&mut self) -> Result<(), ExitError> {
        if self.reported {
            return std::future::pending().await;
        }
        match self.exit_at {
            Some(at) if !self.stopped => tokio::time::sleep_until(at).await,
            _ if self.stopped => {}
            _ => return std::future::pending().await,
        }
        self.stop();
        self.reported = true;
        Ok(())
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.counters.kill_attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .counters
            .fail_kills
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(io::Error::other("mock kill failure"));
        }
        if !self.stopped {
            self.counters.kills.fetch_add(1, Ordering::SeqCst);
            self.stop();
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        !self.stopped && self.exit_at.map_or(true, |at| Instant::now() < at)
    }
}

impl Drop for MockProcess {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Display for MockProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command)
    }
}

/// State of one file in a generated dump.
#[derive(Debug, Clone, Copy)]
pub enum File {
    /// Absent, so make would build it.
    Missing,
    /// Present but older than one of its prerequisites.
    Outdated(&'static str),
    /// Present and up to date.
    Built(&'static str),
    /// Make decided the outcome before looking at this file.
    NotChecked,
}

/// Builds database dumps shaped like `make --question --print-data-base`.
#[derive(Debug, Clone, Default)]
pub struct Dump {
    default_goal: String,
    blocks: Vec<String>,
}

impl Dump {
    pub fn new(default_goal: &str) -> Self {
        Self {
            default_goal: default_goal.to_string(),
            blocks: Vec::new(),
        }
    }

    pub fn file(mut self, rule: &str, file: File) -> Self {
        let mut block = vec![rule.to_string(), "#  Implicit rule search has not been done.".to_string()];
        match file {
            File::Missing => {
                block.push("#  File does not exist.".to_string());
                block.push("#  Needs to be updated (-q is set).".to_string());
            }
            File::Outdated(modified) => {
                block.push(format!("#  Last modified {modified}"));
                block.push("#  Needs to be updated (-q is set).".to_string());
            }
            File::NotChecked => {
                block.push("#  Modification time never checked.".to_string());
                block.push("#  File has not been updated.".to_string());
            }
            File::Built(modified) => {
                block.push(format!("#  Last modified {modified}"));
                block.push("#  File has been updated.".to_string());
                block.push("#  Successfully updated.".to_string());
            }
        }
        block.push("#  recipe to execute (from 'Makefile', line 2):".to_string());
        block.push("\ttouch $@".to_string());
        self.blocks.push(block.join("\n"));
        self
    }

    pub fn phony(mut self, rule: &str) -> Self {
        self.blocks.push(
            [
                rule,
                "#  Phony target (prerequisite of .PHONY).",
                "#  Implicit rule search has not been done.",
                "#  File does not exist.",
                "#  File has been updated.",
                "#  Needs to be updated (-q is set).",
            ]
            .join("\n"),
        );
        self
    }

    pub fn build(&self) -> String {
        let mut dump = String::from("# GNU Make 4.3\n# Built for x86_64-pc-linux-gnu\n\n# Variables\n\n");
        dump.push_str(&format!(".DEFAULT_GOAL := {}\n\n", self.default_goal));
        dump.push_str("# Files\n\n");
        dump.push_str(
            "# Not a target:\nMakefile:\n#  Implicit rule search has been done.\n#  Last modified 2024-05-01 09:00:00.000000000\n#  File has been updated.\n#  Successfully updated.\n\n",
        );
        dump.push_str(&self.blocks.join("\n\n"));
        dump.push_str("\n\n# files hash-table stats:\n# Load=4/1024=0%, Rehash=0, Collisions=0/12=0%\n\n# VPATH Search Paths\n\n# No 'vpath' search paths.\n");
        dump
    }
}

impl From<Dump> for String {
    fn from(dump: Dump) -> String {
        dump.build()
    }
}

/// The chain `f1 <- f2 <- {f3, f4}`, starting with every file missing and
/// then creating f1, f2, f3 and f4 in that order, touching f2 again and
/// finally touching f1 again.
pub fn chain(step: usize) -> String {
    use File::*;
    let (f1, f2, f3, f4) = match step {
        0 => (Missing, Missing, Missing, NotChecked),
        1 => (Outdated("2024-05-01 10:00:01"), Missing, Missing, NotChecked),
        2 => (
            Outdated("2024-05-01 10:00:01"),
            Outdated("2024-05-01 10:00:02"),
            Missing,
            NotChecked,
        ),
        3 => (
            Outdated("2024-05-01 10:00:01"),
            Outdated("2024-05-01 10:00:02"),
            Built("2024-05-01 10:00:03"),
            Missing,
        ),
        4 => (
            Outdated("2024-05-01 10:00:01"),
            Outdated("2024-05-01 10:00:02"),
            Built("2024-05-01 10:00:03"),
            Built("2024-05-01 10:00:04"),
        ),
        5 => (
            Outdated("2024-05-01 10:00:01"),
            Built("2024-05-01 10:00:05"),
            Built("2024-05-01 10:00:03"),
            Built("2024-05-01 10:00:04"),
        ),
        _ => (
            Built("2024-05-01 10:00:06"),
            Built("2024-05-01 10:00:05"),
            Built("2024-05-01 10:00:03"),
            Built("2024-05-01 10:00:04"),
        ),
    };
    Dump::new("f1")
        .file("f1: f2", f1)
        .file("f2: f3 f4", f2)
        .file("f3:", f3)
        .file("f4:", f4)
        .build()
}

/// The finished chain after `f3` was touched again.
pub fn chain_touched() -> String {
    Dump::new("f1")
        .file("f1: f2", File::Outdated("2024-05-01 10:00:06"))
        .file("f2: f3 f4", File::Outdated("2024-05-01 10:00:05"))
        .file("f3:", File::Built("2024-05-01 10:00:07"))
        .file("f4:", File::Built("2024-05-01 10:00:04"))
        .build()
}

pub fn up_to_date(goal: &str) -> String {
    Dump::new(goal)
        .file(&format!("{goal}: src"), File::Built("2024-05-01 10:00:01"))
        .file("src:", File::Built("2024-05-01 10:00:00"))
        .build()
}

pub fn out_of_date(goal: &str) -> String {
    Dump::new(goal)
        .file(&format!("{goal}: src"), File::Outdated("2024-05-01 10:00:01"))
        .file("src:", File::Built("2024-05-01 10:00:02"))
        .build()
}

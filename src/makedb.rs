use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Local};
use tracing::trace;

use crate::parser::ParseError;

use self::target::Target;

pub mod target;

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("Target '{target}' not found")]
    TargetNotFound { target: String },
}

/// The targets of one `make --print-data-base` run.
#[derive(Debug, Clone, Default)]
pub struct Database {
    pub default_goal: String,
    pub targets: HashMap<String, Target>,
}

/// Transitive prerequisites of a target. `normal` entries are checked for
/// being up to date, `order_only` entries only for existence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Closure {
    pub normal: Vec<String>,
    pub order_only: Vec<String>,
}

impl Closure {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.normal
            .iter()
            .chain(self.order_only.iter())
            .map(String::as_str)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Walk {
    FirstStale,
    All,
}

#[derive(Clone, Copy)]
enum Check {
    UpToDate,
    Exists,
}

/// FIFO queue that only accepts each name once.
#[derive(Default)]
struct UniqueQueue {
    queue: VecDeque<String>,
    seen: HashSet<String>,
}

impl UniqueQueue {
    fn push(&mut self, name: &str) {
        if self.seen.insert(name.to_string()) {
            self.queue.push_back(name.to_string());
        }
    }

    fn extend<'a>(&mut self, names: impl IntoIterator<Item = &'a String>) {
        for name in names {
            self.push(name);
        }
    }

    fn pop(&mut self) -> Option<String> {
        self.queue.pop_front()
    }

    fn has_seen(&self, name: &str) -> bool {
        self.seen.contains(name)
    }
}

impl Database {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, target: Target) {
        self.targets.insert(target.name.clone(), target);
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Looks up a target. The empty name is the default goal.
    pub fn get_target(&self, name: &str) -> Result<&Target, DatabaseError> {
        let name = if name.is_empty() {
            self.default_goal.as_str()
        } else {
            name
        };
        self.targets
            .get(name)
            .ok_or_else(|| DatabaseError::TargetNotFound {
                target: name.to_string(),
            })
    }

    pub fn dependency_closure(&self, name: &str) -> Result<Closure, DatabaseError> {
        let target = self.get_target(name)?;

        let mut normal_queue = UniqueQueue::default();
        normal_queue.extend(&target.normal_prerequisites);
        let mut order_only_queue = UniqueQueue::default();
        order_only_queue.extend(&target.order_only_prerequisites);

        let mut closure = Closure::default();

        while let Some(name) = normal_queue.pop() {
            let dep = self.get_target(&name)?;
            normal_queue.extend(&dep.normal_prerequisites);
            order_only_queue.extend(&dep.order_only_prerequisites);
            closure.normal.push(name);
        }

        while let Some(name) = order_only_queue.pop() {
            let dep = self.get_target(&name)?;
            // Prerequisites of an order-only prerequisite only need to exist.
            order_only_queue.extend(&dep.normal_prerequisites);
            order_only_queue.extend(&dep.order_only_prerequisites);
            if !normal_queue.has_seen(&name) {
                closure.order_only.push(name);
            }
        }

        Ok(closure)
    }

    /// Whether the target, or anything it depends on, needs to be rebuilt.
    /// Phony targets are always out of date according to make, so for them
    /// the timestamps of real prerequisites are compared against `since`.
    pub fn is_stale(&self, name: &str, since: DateTime<Local>) -> Result<bool, DatabaseError> {
        Ok(self.walk(name, since, Walk::FirstStale)? != 0)
    }

    /// Number of entries that make `is_stale` true. A falling count while a
    /// build runs means it is making progress.
    pub fn count_pending(&self, name: &str, since: DateTime<Local>) -> Result<usize, DatabaseError> {
        self.walk(name, since, Walk::All)
    }

    /// Names of the real files among the target and its prerequisites.
    pub fn files(&self, name: &str) -> Result<Vec<String>, DatabaseError> {
        let target = self.get_target(name)?;
        let closure = self.dependency_closure(&target.name)?;
        let mut files = Vec::new();
        for name in std::iter::once(target.name.as_str()).chain(closure.iter()) {
            if !self.get_target(name)?.phony {
                files.push(name.to_string());
            }
        }
        Ok(files)
    }

    fn walk(&self, name: &str, since: DateTime<Local>, walk: Walk) -> Result<usize, DatabaseError> {
        let target = self.get_target(name)?;
        let mut count = 0;

        if !target.phony && (target.does_not_exist || target.needs_update) {
            trace!("{target} is stale");
            count += 1;
            if walk == Walk::FirstStale {
                return Ok(count);
            }
        }

        let closure = self.dependency_closure(&target.name)?;
        let checks = closure
            .normal
            .iter()
            .map(|name| (name, Check::UpToDate))
            .chain(closure.order_only.iter().map(|name| (name, Check::Exists)));

        for (name, check) in checks {
            let dep = self.get_target(name)?;
            if dep.phony {
                continue;
            }
            let stale = match check {
                Check::UpToDate => {
                    dep.does_not_exist
                        || dep.needs_update
                        || (target.phony && dep.modified_after(since))
                }
                Check::Exists => dep.does_not_exist,
            };
            if stale {
                trace!("{dep} makes {} stale", target.name);
                count += 1;
                if walk == Walk::FirstStale {
                    return Ok(count);
                }
            }
        }

        Ok(count)
    }
}

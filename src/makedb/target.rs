use std::fmt;

use chrono::{DateTime, Local};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetStatus {
    Phony,
    Missing,
    NeedsUpdate,
    /// Make knows the file but never looked at its timestamp, usually because
    /// an earlier prerequisite already decided the outcome.
    NotChecked,
    Ok,
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            TargetStatus::Phony => "phony",
            TargetStatus::Missing => "missing",
            TargetStatus::NeedsUpdate => "needs update",
            TargetStatus::NotChecked => "not checked",
            TargetStatus::Ok => "ok",
        };
        f.write_str(status)
    }
}

/// One target as reported by `make --question --print-data-base`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Target {
    pub name: String,
    pub normal_prerequisites: Vec<String>,
    pub order_only_prerequisites: Vec<String>,
    pub not_a_target: bool,
    pub phony: bool,
    pub needs_update: bool,
    pub does_not_exist: bool,
    pub last_modified: Option<DateTime<Local>>,
}

impl Target {
    pub fn new(name: impl Into<String>) -> Target {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn status(&self) -> TargetStatus {
        if self.phony {
            TargetStatus::Phony
        } else if self.does_not_exist {
            TargetStatus::Missing
        } else if self.needs_update {
            TargetStatus::NeedsUpdate
        } else if self.last_modified.is_none() {
            TargetStatus::NotChecked
        } else {
            TargetStatus::Ok
        }
    }

    /// Whether the target was modified after `since`. Targets without a
    /// known timestamp never count as newer.
    pub fn modified_after(&self, since: DateTime<Local>) -> bool {
        self.last_modified.is_some_and(|modified| modified > since)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.status())
    }
}

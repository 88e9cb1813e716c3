use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use clap::Parser;
use regex::Regex;

use crate::makedb::target::Target;
use crate::makedb::Database;

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Args {
    /// Send a ready signal to the parent remake process and then quit
    #[arg(long)]
    pub ready: bool,

    /// Grace period for commands to finish building
    #[arg(long, default_value = "10s", value_parser = parse_duration)]
    pub grace: Duration,

    /// Regularly poll for changes (0s disables polling)
    #[arg(long, default_value = "0s", value_parser = parse_duration)]
    pub poll: Duration,

    /// Debounce time for watching the filesystem (0s disables watching)
    #[arg(long, default_value = "100ms", value_parser = parse_duration)]
    pub watch: Duration,

    /// Makefile to read instead of make's default
    #[arg(short, long)]
    pub file: Option<String>,

    /// Number of jobs make may run at once
    #[arg(short = 'j', long)]
    pub jobs: Option<u16>,

    /// Make program to run
    #[arg(long, env = "REMAKE_MAKE", default_value = "make")]
    pub make: String,

    /// Print debug information
    #[arg(short, long)]
    pub debug: bool,

    /// Goals to keep up to date, make's default goal if none are given
    pub goals: Vec<String>,
}

impl Args {
    /// The goals to run. Like make, no goals means the default goal, which is
    /// represented by the empty name.
    pub fn goals(&self) -> Vec<String> {
        if self.goals.is_empty() {
            vec![String::new()]
        } else {
            self.goals.clone()
        }
    }
}

/// Parses durations such as `10s`, `100ms`, `1.5m` or a bare `0`.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: f64 = number
        .parse()
        .map_err(|_| format!("invalid duration '{value}'"))?;
    let seconds = match unit {
        "ns" => number / 1e9,
        "us" | "µs" => number / 1e6,
        "ms" => number / 1e3,
        "s" => number,
        "m" => number * 60.0,
        "h" => number * 3600.0,
        "" if number == 0.0 => 0.0,
        "" => return Err(format!("missing unit in duration '{value}'")),
        _ => return Err(format!("unknown unit '{unit}' in duration '{value}'")),
    };
    Duration::try_from_secs_f64(seconds).map_err(|e| format!("invalid duration '{value}': {e}"))
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Unable to find a target name in block:\n{block}")]
    MissingName { block: String },
    #[error("Invalid timestamp '{value}' for target '{target}': {source}")]
    Timestamp {
        target: String,
        value: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error("Timestamp '{value}' for target '{target}' does not exist in the local time zone")]
    LocalTime { target: String, value: String },
    #[error("Target '{target}' has an unset modification time: '{line}'")]
    EpochSentinel { target: String, line: String },
}

const DEFAULT_GOAL: &str = ".DEFAULT_GOAL := ";
const FILES_HEADER: &str = "# Files";
const FILES_TRAILER: &str = "# files hash-table stats:";
const LAST_MODIFIED_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";
// Make prints a zero timestamp like this when the local zone is not UTC.
const EPOCH_SENTINEL: &str = "1970-01-01 00:59:56";

static NOT_A_TARGET: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^#\s+Not a target:").unwrap());
static PHONY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#\s+Phony target \(prerequisite of \.PHONY\)\.").unwrap());
static NEEDS_UPDATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#\s+Needs to be updated \(-q is set\)\.").unwrap());
static DOES_NOT_EXIST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#\s+File does not exist\.").unwrap());
static LAST_MODIFIED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#\s+Last modified\s+(.+?)\s*$").unwrap());

const ASSIGNMENTS: [&str; 6] = ["=", ":=", "::=", "+=", "?=", "!="];

impl Database {
    /// Builds a database from the output of `make --print-data-base`.
    pub fn parse(dump: &str) -> Result<Database, ParseError> {
        let mut db = Database::new();
        db.populate(dump)?;
        Ok(db)
    }

    pub fn populate(&mut self, dump: &str) -> Result<(), ParseError> {
        let mut lines = dump.lines();

        let mut files_section = false;
        for line in lines.by_ref() {
            if let Some(goal) = line.strip_prefix(DEFAULT_GOAL) {
                self.default_goal = goal.trim().to_string();
            } else if line == FILES_HEADER {
                files_section = true;
                break;
            }
        }
        if !files_section {
            return Ok(());
        }

        let mut block: Vec<&str> = Vec::new();
        for line in lines {
            if line.starts_with(FILES_TRAILER) {
                break;
            }
            if line.is_empty() {
                if !block.is_empty() {
                    self.insert(Target::from_block(&block)?);
                    block.clear();
                }
            } else {
                block.push(line);
            }
        }
        if !block.is_empty() {
            self.insert(Target::from_block(&block)?);
        }

        Ok(())
    }
}

impl Target {
    /// Parses one target's block of lines from the files section.
    pub fn from_block(lines: &[&str]) -> Result<Target, ParseError> {
        let mut target = Target::default();
        let mut last_modified = None;

        for &line in lines {
            if line.starts_with('#') {
                if NOT_A_TARGET.is_match(line) {
                    target.not_a_target = true;
                } else if PHONY.is_match(line) {
                    target.phony = true;
                } else if NEEDS_UPDATE.is_match(line) {
                    target.needs_update = true;
                } else if DOES_NOT_EXIST.is_match(line) {
                    target.does_not_exist = true;
                } else if let Some(captures) = LAST_MODIFIED.captures(line) {
                    last_modified = Some((line, captures.get(1).map_or("", |m| m.as_str())));
                }
            } else if line.starts_with('\t') || !target.name.is_empty() {
                continue;
            } else {
                target.parse_names(line);
            }
        }

        if target.name.is_empty() {
            return Err(ParseError::MissingName {
                block: lines.join("\n"),
            });
        }

        if let Some((line, value)) = last_modified {
            target.last_modified = Some(parse_timestamp(&target.name, line, value)?);
        }

        Ok(target)
    }

    /// Reads `name: normal... | order-only...`. Lines that turn out to be
    /// target-specific variables (`name: VAR := value`) are left alone.
    fn parse_names(&mut self, line: &str) {
        let Some((name, rest)) = line.split_once(':') else {
            return;
        };
        let name = name.trim();
        let rest = rest.strip_prefix(':').unwrap_or(rest);

        let words = rest.split_whitespace();
        if name.is_empty() || words.clone().take(2).any(|word| ASSIGNMENTS.contains(&word)) {
            return;
        }

        let mut order_only = false;
        for word in words {
            if word.starts_with('|') {
                order_only = true;
                let rest = &word[1..];
                if !rest.is_empty() {
                    self.order_only_prerequisites.push(rest.to_string());
                }
            } else if order_only {
                self.order_only_prerequisites.push(word.to_string());
            } else {
                self.normal_prerequisites.push(word.to_string());
            }
        }
        self.name = name.to_string();
    }
}

fn parse_timestamp(target: &str, line: &str, value: &str) -> Result<DateTime<Local>, ParseError> {
    if value.starts_with(EPOCH_SENTINEL) {
        return Err(ParseError::EpochSentinel {
            target: target.to_string(),
            line: line.to_string(),
        });
    }
    let naive = NaiveDateTime::parse_from_str(value, LAST_MODIFIED_FORMAT).map_err(|source| {
        ParseError::Timestamp {
            target: target.to_string(),
            value: value.to_string(),
            source,
        }
    })?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| ParseError::LocalTime {
            target: target.to_string(),
            value: value.to_string(),
        })
}

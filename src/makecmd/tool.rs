use std::io;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::process::{CmdProcess, Process};
use crate::parser::Args;

/// The build tool that remake drives: it runs builds and reports which
/// targets are out of date.
#[async_trait]
pub trait BuildTool: Send + Sync {
    /// Starts building `goal` (the default goal when empty).
    fn start(&self, goal: &str) -> io::Result<Box<dyn Process>>;

    /// Returns the raw dependency database dump for `goal`.
    async fn print_database(&self, goal: &str) -> io::Result<String>;

    /// The command lines behind `start` and `print_database`, for messages.
    fn build_command(&self, goal: &str) -> String;

    fn query_command(&self, goal: &str) -> String;
}

#[derive(Debug, Clone)]
pub struct Make {
    pub program: String,
    pub makefile: Option<String>,
    pub jobs: Option<u16>,
}

impl Default for Make {
    fn default() -> Self {
        Self {
            program: "make".to_string(),
            makefile: None,
            jobs: None,
        }
    }
}

impl From<&Args> for Make {
    fn from(args: &Args) -> Self {
        Self {
            program: args.make.clone(),
            makefile: args.file.clone(),
            jobs: args.jobs,
        }
    }
}

impl Make {
    pub fn build_args(&self, goal: &str) -> Vec<String> {
        let mut args = vec!["--warn-undefined-variables".to_string()];
        self.push_makefile(&mut args);
        if let Some(jobs) = self.jobs {
            args.push(format!("--jobs={jobs}"));
        }
        push_goal(&mut args, goal);
        args
    }

    pub fn query_args(&self, goal: &str) -> Vec<String> {
        let mut args = vec![
            "--warn-undefined-variables".to_string(),
            "--question".to_string(),
            "--print-data-base".to_string(),
        ];
        self.push_makefile(&mut args);
        push_goal(&mut args, goal);
        args
    }

    fn command_line(&self, args: Vec<String>) -> String {
        std::iter::once(self.program.clone())
            .chain(args)
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn push_makefile(&self, args: &mut Vec<String>) {
        if let Some(makefile) = &self.makefile {
            args.push("--file".to_string());
            args.push(makefile.clone());
        }
    }
}

fn push_goal(args: &mut Vec<String>, goal: &str) {
    if !goal.is_empty() {
        args.push(goal.to_string());
    }
}

#[async_trait]
impl BuildTool for Make {
    fn start(&self, goal: &str) -> io::Result<Box<dyn Process>> {
        let process = CmdProcess::spawn(&self.program, &self.build_args(goal))?;
        Ok(Box::new(process))
    }

    async fn print_database(&self, goal: &str) -> io::Result<String> {
        // Question mode exits non-zero whenever something is out of date,
        // so the exit status says nothing about whether the dump is usable.
        let output = Command::new(&self.program)
            .args(self.query_args(goal))
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.stderr.is_empty() {
            debug!(
                "{}: {}",
                self.query_command(goal),
                String::from_utf8_lossy(&output.stderr).trim_end()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn build_command(&self, goal: &str) -> String {
        self.command_line(self.build_args(goal))
    }

    fn query_command(&self, goal: &str) -> String {
        self.command_line(self.query_args(goal))
    }
}

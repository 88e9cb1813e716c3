use std::error::Error;
use std::process::ExitCode;
use std::sync::Arc;

use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use remake::makecmd::tool::{BuildTool, Make};
use remake::parser::Args;
use remake::ready;
use remake::remake::{BuildLock, GoalEvents, Remake, Settings};
use remake::watcher::SharedWatcher;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let default_filter = if args.debug { "remake=debug" } else { "remake=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if args.ready {
        return match ready::send_ready_signal() {
            Ok(_) => ExitCode::SUCCESS,
            Err(e) => {
                error!("Remake: {e}");
                ExitCode::FAILURE
            }
        };
    }

    if args.watch.is_zero() && args.poll.is_zero() {
        Args::command()
            .error(
                ErrorKind::ArgumentConflict,
                "--watch and --poll cannot both be disabled",
            )
            .exit();
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Remake: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let goals = args.goals();
    let mut ready = ready::listen(goals.len())?;

    let watcher = if args.watch.is_zero() {
        None
    } else {
        let watcher = SharedWatcher::new(args.watch);
        // Catches new files that wildcards in the makefile would pick up.
        watcher.add(".");
        Some(watcher)
    };
    let _watching = watcher.as_ref().map(SharedWatcher::start);

    let tool: Arc<dyn BuildTool> = Arc::new(Make::from(&args));
    let remake = Arc::new(Remake::new(
        tool,
        Arc::new(BuildLock::new()),
        Settings::from(&args),
    ));

    let mut running = JoinSet::new();
    for goal in goals {
        let remake = remake.clone();
        let events = GoalEvents {
            ready: ready.take(),
            watcher: watcher.as_ref().map(SharedWatcher::client),
        };
        running.spawn(async move { remake.run_goal_forever(goal, events).await });
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Remake: interrupted, stopping builds");
            // Aborted goals drop their build processes, which sends make SIGTERM.
            running.shutdown().await;
            Ok(())
        }
        joined = running.join_next() => {
            let result: Result<(), Box<dyn Error>> = match joined {
                Some(Ok(Ok(never))) => match never {},
                Some(Ok(Err(e))) => Err(e.into()),
                Some(Err(e)) => Err(e.into()),
                None => Ok(()),
            };
            running.shutdown().await;
            result
        }
    }
}

use std::process::ExitCode;

use anyhow::Context;

mod cleanup;
mod cli;
mod config;
mod error;
mod fetcher;
mod instances;
mod orchestrator;
mod platform;
mod run_info;
mod supervisor;

#[cfg(test)]
mod test_support;

use crate::cli::{Command, Task};
use crate::config::LauncherConfig;
use crate::error::{EXIT_CONFIG, EXIT_VALIDATION, format_error_chain};
use crate::orchestrator::LaunchContext;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let command = match cli::parse(std::env::args().skip(1)) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("error: {e}\n");
            eprintln!("{}", cli::usage());
            return ExitCode::from(EXIT_VALIDATION);
        }
    };
    let task = match command {
        Command::Help => {
            println!("{}", cli::usage());
            return ExitCode::SUCCESS;
        }
        Command::Run(task) => task,
    };

    match start(task) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "launcher setup failed");
            eprintln!("error: {e:#}");
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

fn start(task: Task) -> anyhow::Result<ExitCode> {
    let config = LauncherConfig::from_env().context("load launcher configuration")?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start async runtime")?;
    let ctx = LaunchContext::new(config).context("build http client")?;
    tracing::info!(
        root = %ctx.config.root.display(),
        batch = %ctx.supervisor.batch(),
        version = env!("CARGO_PKG_VERSION"),
        "agentlauncher starting"
    );

    match runtime.block_on(orchestrator::run(&ctx, task)) {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            let msg = format_error_chain(&e);
            tracing::error!(error = %msg, exit_code = e.exit_code(), "launch failed");
            eprintln!("error: {msg}");
            Ok(ExitCode::from(e.exit_code()))
        }
    }
}

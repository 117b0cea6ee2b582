use std::future::Future;

use agentlauncher_process::{AgentStatus, BatchId, InstanceId};
use tokio::sync::mpsc;

use crate::cleanup::{CleanupReport, cleanup};
use crate::cli::{LaunchRequest, Task};
use crate::config::LauncherConfig;
use crate::error::{FetchError, LaunchError};
use crate::fetcher::{ArtifactSet, FetchReport, ensure_artifacts, http_client};
use crate::instances::{InstanceReport, ensure_instances, instance_dir};
use crate::platform::{PlatformDescriptor, resolve};
use crate::supervisor::Supervisor;

/// Everything a run needs, passed explicitly instead of living in globals.
#[derive(Debug, Clone)]
pub struct LaunchContext {
    pub config: LauncherConfig,
    pub client: reqwest::Client,
    pub supervisor: Supervisor,
}

impl LaunchContext {
    pub fn new(config: LauncherConfig) -> Result<Self, FetchError> {
        let client = http_client(config.http_timeout)?;
        let supervisor = Supervisor::new(BatchId::new(), config.early_exit);
        Ok(Self {
            config,
            client,
            supervisor,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorCommand {
    Toggle { instance: InstanceId },
}

/// Hands out toggle targets 0, 1, .., count-1, 0, ..
#[derive(Debug, Clone)]
pub struct ToggleCycle {
    count: u32,
    next: u32,
}

impl ToggleCycle {
    pub fn new(count: u32) -> Self {
        Self { count, next: 0 }
    }
}

impl Iterator for ToggleCycle {
    type Item = SupervisorCommand;

    fn next(&mut self) -> Option<Self::Item> {
        if self.count == 0 {
            return None;
        }
        let instance = InstanceId(self.next);
        self.next = (self.next + 1) % self.count;
        Some(SupervisorCommand::Toggle { instance })
    }
}

#[derive(Debug)]
pub struct LaunchOutcome {
    pub artifacts: ArtifactSet,
    pub fetch: FetchReport,
    pub instances: InstanceReport,
    pub launched: Vec<AgentStatus>,
}

pub fn run_cleanup(ctx: &LaunchContext) -> Result<CleanupReport, LaunchError> {
    let root = ctx.config.artifact_root();
    tracing::info!(root = %root.display(), "cleaning up agent instances");
    Ok(cleanup(&root)?)
}

/// Resolve, fetch, replicate, spawn. Each stage completes before the next
/// starts and the first error ends the chain. Agents spawned before a
/// failing spawn stay registered.
pub async fn run_launch(
    ctx: &LaunchContext,
    req: &LaunchRequest,
    platform: &PlatformDescriptor,
) -> Result<LaunchOutcome, LaunchError> {
    let variant = resolve(platform)?;
    tracing::info!(
        os = %platform.os,
        arch = %platform.arch,
        variant = %variant.id,
        "resolved agent variant"
    );

    let root = ctx.config.artifact_root();
    let (artifacts, fetch) =
        ensure_artifacts(&ctx.client, &req.url, variant, &req.mesh, &root).await?;
    let instances = ensure_instances(&root, req.count)?;

    let mut launched = Vec::with_capacity(req.count as usize);
    for id in InstanceId::range(req.count) {
        let dir = instance_dir(&root, id);
        let status = ctx
            .supervisor
            .launch(id, &dir, artifacts.binary_name())
            .await?;
        launched.push(status);
    }

    tracing::info!(
        count = req.count,
        batch = %ctx.supervisor.batch(),
        server = %req.url,
        "all agents launched"
    );
    Ok(LaunchOutcome {
        artifacts,
        fetch,
        instances,
        launched,
    })
}

/// Stays resident until `shutdown` resolves, applying supervisor commands as
/// they arrive, then stops every agent.
pub async fn supervise<F>(
    ctx: &LaunchContext,
    mut commands: mpsc::Receiver<SupervisorCommand>,
    shutdown: F,
) -> Vec<AgentStatus>
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            Some(cmd) = commands.recv() => {
                // A shutdown mid-toggle abandons the restart; stop_all below
                // reaches whatever it left registered.
                tokio::select! {
                    _ = apply(ctx, cmd) => {}
                    _ = &mut shutdown => break,
                }
            }
        }
    }
    ctx.supervisor.stop_all(ctx.config.stop_grace).await
}

async fn apply(ctx: &LaunchContext, cmd: SupervisorCommand) {
    match cmd {
        SupervisorCommand::Toggle { instance } => {
            match ctx
                .supervisor
                .restart(instance, ctx.config.stop_grace)
                .await
            {
                Ok(status) => {
                    tracing::info!(%instance, pid = ?status.pid, "agent toggled");
                }
                Err(e) => {
                    tracing::warn!(%instance, error = %e, "toggle failed");
                }
            }
        }
    }
}

/// Top-level dispatch for a parsed task.
pub async fn run(ctx: &LaunchContext, task: Task) -> Result<(), LaunchError> {
    match task {
        Task::Cleanup => {
            let report = run_cleanup(ctx)?;
            println!(
                "Removed {} files and {} directories.",
                report.files_removed, report.dirs_removed
            );
            Ok(())
        }
        Task::Launch(req) => {
            let outcome = match run_launch(ctx, &req, &PlatformDescriptor::host()).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    // The launcher is about to exit; do not orphan what did start.
                    ctx.supervisor.stop_all(ctx.config.stop_grace).await;
                    return Err(e);
                }
            };
            tracing::info!(
                root = %outcome.artifacts.root.display(),
                binary = %outcome.artifacts.binary.display(),
                policy = %outcome.artifacts.policy.display(),
                binary_downloaded = outcome.fetch.binary_downloaded,
                policy_downloaded = outcome.fetch.policy_downloaded,
                dirs_created = outcome.instances.created_dirs,
                "supervising agents, Ctrl-C to stop"
            );

            let (tx, rx) = mpsc::channel(8);
            if req.toggle {
                spawn_toggle_trigger(outcome.launched.len() as u32, tx);
            } else {
                drop(tx);
            }

            let statuses = supervise(ctx, rx, shutdown_signal()).await;
            for st in &statuses {
                tracing::debug!(instance = %st.instance, state = ?st.state, exit_code = ?st.exit_code, "final agent state");
            }
            Ok(())
        }
    }
}

#[cfg(unix)]
fn spawn_toggle_trigger(count: u32, tx: mpsc::Sender<SupervisorCommand>) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "TOGGLE: cannot listen for SIGHUP, toggling disabled");
            return;
        }
    };
    tracing::info!(pid = std::process::id(), "TOGGLE: send SIGHUP to restart the next agent");
    let mut cycle = ToggleCycle::new(count);
    tokio::spawn(async move {
        while hup.recv().await.is_some() {
            let Some(cmd) = cycle.next() else {
                break;
            };
            if tx.send(cmd).await.is_err() {
                break;
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_toggle_trigger(_count: u32, _tx: mpsc::Sender<SupervisorCommand>) {
    tracing::warn!("TOGGLE has no trigger on this platform; agents will not be cycled");
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    res = tokio::signal::ctrl_c() => log_ctrl_c(res),
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                log_ctrl_c(tokio::signal::ctrl_c().await);
            }
        }
    }
    #[cfg(not(unix))]
    log_ctrl_c(tokio::signal::ctrl_c().await);

    tracing::info!("received shutdown signal");
}

fn log_ctrl_c(res: std::io::Result<()>) {
    if let Err(e) = res {
        tracing::error!(error = %e, "failed to install Ctrl-C handler");
    }
}

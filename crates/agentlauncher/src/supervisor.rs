use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use agentlauncher_process::{AgentState, AgentStatus, BatchId, InstanceId};
use tokio::{
    process::{Child, Command},
    sync::{Mutex, mpsc},
};

use crate::error::SpawnError;
use crate::run_info::{RunInfo, write_run_json};

/// Argument every agent is started with: run in the foreground and connect
/// to the server named in the policy file.
pub const AGENT_ARG: &str = "connect";

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const KILL_SETTLE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    Term,
    Kill,
}

#[derive(Debug)]
struct AgentEntry {
    state: AgentState,
    pid: Option<u32>,
    exit_code: Option<i32>,
    signal: Option<i32>,
    message: Option<String>,
    dir: PathBuf,
    exec_name: String,
    // Bumped per spawn so a stale watcher never overwrites a newer process.
    generation: u64,
    term_tx: Option<mpsc::UnboundedSender<Termination>>,
}

impl AgentEntry {
    fn status(&self, instance: InstanceId) -> AgentStatus {
        AgentStatus {
            instance,
            state: self.state,
            pid: self.pid,
            exit_code: self.exit_code,
            signal: self.signal,
            message: self.message.clone(),
        }
    }
}

type Registry = Arc<Mutex<BTreeMap<InstanceId, AgentEntry>>>;

/// Owns every spawned agent process.
///
/// The registry only ever holds instances whose spawn call succeeded. Each
/// child handle lives in its own watcher task; other code reaches a process
/// through `toggle` / `stop_all`, never through the handle.
#[derive(Clone, Debug)]
pub struct Supervisor {
    inner: Registry,
    batch: BatchId,
    early_exit: Duration,
    generation: Arc<AtomicU64>,
}

impl Supervisor {
    pub fn new(batch: BatchId, early_exit: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BTreeMap::new())),
            batch,
            early_exit,
            generation: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn batch(&self) -> &BatchId {
        &self.batch
    }

    pub async fn launch(
        &self,
        instance: InstanceId,
        dir: &Path,
        exec_name: &str,
    ) -> Result<AgentStatus, SpawnError> {
        let exec = dir.join(exec_name);
        if !exec.is_file() {
            tracing::error!(%instance, exec = %exec.display(), "agent executable not found");
            return Err(SpawnError::NotFound {
                instance,
                path: exec,
            });
        }

        let mut cmd = Command::new(&exec);
        cmd.arg(AGENT_ARG)
            .current_dir(dir)
            .stdin(std::process::Stdio::inherit())
            .stdout(std::process::Stdio::inherit())
            .stderr(std::process::Stdio::inherit());

        #[cfg(unix)]
        {
            // Own process group so a toggle reaches anything the agent forks.
            cmd.process_group(0);
            unsafe {
                cmd.pre_exec(set_parent_death_signal);
            }
        }

        let mut run = RunInfo::new(instance, &self.batch, &exec, &[AGENT_ARG], dir);

        // Check, spawn and insert under one lock so two launches of the same
        // instance cannot both pass the liveness check.
        let mut inner = self.inner.lock().await;
        if inner.get(&instance).is_some_and(|e| e.state.is_live()) {
            return Err(SpawnError::AlreadyRunning(instance));
        }

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                tracing::error!(%instance, exec = %exec.display(), error = %source, "agent spawn failed");
                return Err(SpawnError::Os {
                    instance,
                    exec,
                    source,
                });
            }
        };
        let pid = child.id();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (term_tx, term_rx) = mpsc::unbounded_channel();

        let status = {
            let entry = AgentEntry {
                state: AgentState::Starting,
                pid,
                exit_code: None,
                signal: None,
                message: Some("starting".to_string()),
                dir: dir.to_path_buf(),
                exec_name: exec_name.to_string(),
                generation,
                term_tx: Some(term_tx),
            };
            let status = entry.status(instance);
            inner.insert(instance, entry);
            status
        };
        drop(inner);
        tracing::info!(%instance, pid = ?pid, dir = %dir.display(), "agent spawned");

        // The watcher owns the child from here on, so dropping this future
        // later cannot leave an unwatched process behind.
        self.spawn_watcher(instance, generation, child, term_rx);
        self.spawn_promoter(instance, generation);

        run.pid = pid;
        if let Err(e) = write_run_json(dir, &run).await {
            tracing::warn!(%instance, error = %e, "failed to write run.json");
        }

        Ok(status)
    }

    fn spawn_watcher(
        &self,
        instance: InstanceId,
        generation: u64,
        mut child: Child,
        mut term_rx: mpsc::UnboundedReceiver<Termination>,
    ) {
        let inner = self.inner.clone();
        let early_exit = self.early_exit;
        tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            let pid = child.id();
            let res = loop {
                tokio::select! {
                    res = child.wait() => break res,
                    Some(req) = term_rx.recv() => deliver(&mut child, pid, req),
                }
            };
            let runtime = started.elapsed();

            let mut map = inner.lock().await;
            let Some(e) = map.get_mut(&instance) else {
                return;
            };
            if e.generation != generation {
                return;
            }
            e.term_tx = None;
            let stopping = matches!(e.state, AgentState::Stopping);

            match res {
                Ok(status) => {
                    e.exit_code = status.code();
                    e.signal = exit_signal(&status);

                    if stopping {
                        e.state = AgentState::Killed;
                        e.message = Some("stopped".to_string());
                        tracing::info!(%instance, pid = ?pid, signal = ?e.signal, "agent stopped");
                    } else if let Some(sig) = e.signal {
                        e.state = AgentState::Killed;
                        e.message = Some(format!("terminated by signal {sig}"));
                        tracing::warn!(%instance, pid = ?pid, signal = sig, "agent terminated by signal");
                    } else if runtime < early_exit {
                        e.state = AgentState::Errored;
                        e.message = Some(format!(
                            "exited too quickly ({}ms, code {})",
                            runtime.as_millis(),
                            status.code().unwrap_or_default()
                        ));
                        tracing::error!(
                            %instance,
                            pid = ?pid,
                            exit_code = ?e.exit_code,
                            runtime_ms = runtime.as_millis() as u64,
                            "agent exited too quickly"
                        );
                    } else if status.success() {
                        e.state = AgentState::Exited;
                        e.message = Some("exited".to_string());
                        tracing::info!(%instance, pid = ?pid, exit_code = 0, "agent exited");
                    } else {
                        e.state = AgentState::Errored;
                        e.message = Some(format!(
                            "exited with code {}",
                            status.code().unwrap_or_default()
                        ));
                        tracing::warn!(%instance, pid = ?pid, exit_code = ?e.exit_code, "agent exited with failure");
                    }
                }
                Err(err) => {
                    e.state = AgentState::Errored;
                    e.message = Some(format!("disconnected: {err}"));
                    tracing::error!(%instance, pid = ?pid, error = %err, "lost agent process handle");
                }
            }
        });
    }

    fn spawn_promoter(&self, instance: InstanceId, generation: u64) {
        let inner = self.inner.clone();
        let early_exit = self.early_exit;
        tokio::spawn(async move {
            tokio::time::sleep(early_exit).await;
            let mut map = inner.lock().await;
            let Some(e) = map.get_mut(&instance) else {
                return;
            };
            if e.generation == generation && matches!(e.state, AgentState::Starting) {
                e.state = AgentState::Running;
                e.message = None;
                tracing::info!(%instance, pid = ?e.pid, "agent running");
            }
        });
    }

    /// Asks the instance's process to terminate and returns immediately.
    ///
    /// Pair with `wait_stopped` + `launch` (or use `restart`) to cycle it.
    pub async fn toggle(&self, instance: InstanceId) -> Result<(), SpawnError> {
        let mut inner = self.inner.lock().await;
        let e = inner
            .get_mut(&instance)
            .ok_or(SpawnError::Unknown(instance))?;
        if !e.state.is_live() {
            tracing::debug!(%instance, state = ?e.state, "toggle: agent not running");
            return Ok(());
        }
        e.state = AgentState::Stopping;
        e.message = Some("stopping".to_string());
        if let Some(tx) = &e.term_tx {
            let _ = tx.send(Termination::Term);
        }
        tracing::info!(%instance, pid = ?e.pid, "toggle: termination requested");
        Ok(())
    }

    /// Waits for a toggled process to exit, escalating to SIGKILL at `timeout`.
    pub async fn wait_stopped(
        &self,
        instance: InstanceId,
        timeout: Duration,
    ) -> Result<AgentStatus, SpawnError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut killed_at: Option<tokio::time::Instant> = None;

        loop {
            let status = self
                .status(instance)
                .await
                .ok_or(SpawnError::Unknown(instance))?;
            if !status.state.is_live() {
                return Ok(status);
            }

            let now = tokio::time::Instant::now();
            match killed_at {
                None if now >= deadline => {
                    self.send(instance, Termination::Kill).await;
                    tracing::warn!(%instance, pid = ?status.pid, "agent did not stop in time, killing");
                    killed_at = Some(now);
                }
                Some(at) if now.duration_since(at) >= KILL_SETTLE => return Ok(status),
                _ => {}
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Toggle, wait for exit, then start the same instance again.
    pub async fn restart(
        &self,
        instance: InstanceId,
        timeout: Duration,
    ) -> Result<AgentStatus, SpawnError> {
        let (dir, exec_name) = {
            let inner = self.inner.lock().await;
            let e = inner.get(&instance).ok_or(SpawnError::Unknown(instance))?;
            (e.dir.clone(), e.exec_name.clone())
        };

        self.toggle(instance).await?;
        self.wait_stopped(instance, timeout).await?;
        self.launch(instance, &dir, &exec_name).await
    }

    /// Terminates every registered agent and waits up to `grace` before
    /// killing stragglers. Instance directories are left alone.
    pub async fn stop_all(&self, grace: Duration) -> Vec<AgentStatus> {
        let ids: Vec<InstanceId> = self.inner.lock().await.keys().copied().collect();
        for id in &ids {
            let _ = self.toggle(*id).await;
        }

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let live = self.live_instances().await;
            if live.is_empty() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                for id in &live {
                    tracing::warn!(instance = %id, "agent did not stop in time, killing");
                    self.send(*id, Termination::Kill).await;
                }
                let settle = tokio::time::Instant::now() + KILL_SETTLE;
                while !self.live_instances().await.is_empty()
                    && tokio::time::Instant::now() < settle
                {
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        let statuses = self.list().await;
        tracing::info!(count = statuses.len(), "all agents stopped");
        statuses
    }

    async fn send(&self, instance: InstanceId, req: Termination) {
        let inner = self.inner.lock().await;
        if let Some(tx) = inner.get(&instance).and_then(|e| e.term_tx.as_ref()) {
            let _ = tx.send(req);
        }
    }

    async fn live_instances(&self) -> Vec<InstanceId> {
        let inner = self.inner.lock().await;
        inner
            .iter()
            .filter(|(_, e)| e.state.is_live())
            .map(|(id, _)| *id)
            .collect()
    }

    pub async fn list(&self) -> Vec<AgentStatus> {
        let inner = self.inner.lock().await;
        inner.iter().map(|(id, e)| e.status(*id)).collect()
    }

    pub async fn status(&self, instance: InstanceId) -> Option<AgentStatus> {
        let inner = self.inner.lock().await;
        inner.get(&instance).map(|e| e.status(instance))
    }
}

#[cfg(unix)]
fn deliver(child: &mut Child, pid: Option<u32>, req: Termination) {
    let sig = match req {
        Termination::Term => libc::SIGTERM,
        Termination::Kill => libc::SIGKILL,
    };
    match pid {
        // The child leads its own process group (pgid == pid).
        Some(pid) => unsafe {
            libc::kill(-(pid as i32), sig);
        },
        None => {
            let _ = child.start_kill();
        }
    }
}

#[cfg(not(unix))]
fn deliver(child: &mut Child, _pid: Option<u32>, _req: Termination) {
    let _ = child.start_kill();
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

#[cfg(target_os = "linux")]
fn set_parent_death_signal() -> std::io::Result<()> {
    // If the launcher dies (crash/kill), take the agent down with it.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::temp_dir_for;

    // The executable is a symlink to /bin/sh, which then reads the `connect`
    // file in the instance directory as its script. This avoids exec'ing a
    // file the test has just written.
    fn agent_dir(test_name: &str, script: &str) -> PathBuf {
        let dir = temp_dir_for(test_name);
        std::fs::create_dir_all(&dir).unwrap();
        std::os::unix::fs::symlink("/bin/sh", dir.join("meshagent")).unwrap();
        std::fs::write(dir.join(AGENT_ARG), script).unwrap();
        dir
    }

    async fn wait_for_state(sup: &Supervisor, id: InstanceId, want: AgentState) -> AgentStatus {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let st = sup.status(id).await.unwrap();
            if st.state == want {
                return st;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {want:?}, last {st:?}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn missing_executable_never_registers() {
        let dir = temp_dir_for("sup-missing");
        std::fs::create_dir_all(&dir).unwrap();
        let sup = Supervisor::new(BatchId::new(), Duration::from_millis(100));

        let err = sup.launch(InstanceId(0), &dir, "meshagent").await.unwrap_err();
        assert!(matches!(err, SpawnError::NotFound { .. }));
        assert!(sup.list().await.is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn os_spawn_failure_never_registers() {
        use std::os::unix::fs::PermissionsExt;

        let dir = temp_dir_for("sup-noexec");
        std::fs::create_dir_all(&dir).unwrap();
        let exec = dir.join("meshagent");
        std::fs::write(&exec, b"#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&exec, std::fs::Permissions::from_mode(0o644)).unwrap();
        let sup = Supervisor::new(BatchId::new(), Duration::from_millis(100));

        let err = sup.launch(InstanceId(0), &dir, "meshagent").await.unwrap_err();
        assert!(matches!(err, SpawnError::Os { instance: InstanceId(0), .. }), "{err:?}");
        assert!(sup.list().await.is_empty());
        assert!(!dir.join("run.json").exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_launches_of_one_instance_spawn_once() {
        let dir = agent_dir("sup-race", "exec sleep 30\n");
        let sup = Supervisor::new(BatchId::new(), Duration::from_millis(100));

        let (a, b) = tokio::join!(
            sup.launch(InstanceId(0), &dir, "meshagent"),
            sup.launch(InstanceId(0), &dir, "meshagent"),
        );
        let oks = [&a, &b].iter().filter(|r| r.is_ok()).count();
        assert_eq!(oks, 1, "{a:?} {b:?}");
        assert!(
            [&a, &b]
                .iter()
                .any(|r| matches!(r, Err(SpawnError::AlreadyRunning(InstanceId(0))))),
            "{a:?} {b:?}"
        );

        // The surviving entry still reaches its process.
        let statuses = sup.stop_all(Duration::from_secs(5)).await;
        assert_eq!(statuses.len(), 1);
        assert!(!statuses[0].state.is_live(), "{:?}", statuses[0]);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn launched_agent_is_promoted_to_running() {
        let dir = agent_dir("sup-running", "exec sleep 30\n");
        let sup = Supervisor::new(BatchId::new(), Duration::from_millis(100));

        let st = sup.launch(InstanceId(0), &dir, "meshagent").await.unwrap();
        assert_eq!(st.state, AgentState::Starting);
        assert!(st.pid.is_some());

        wait_for_state(&sup, InstanceId(0), AgentState::Running).await;
        assert!(dir.join("run.json").exists());

        sup.stop_all(Duration::from_secs(5)).await;
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn second_launch_of_live_instance_is_rejected() {
        let dir = agent_dir("sup-dup", "exec sleep 30\n");
        let sup = Supervisor::new(BatchId::new(), Duration::from_millis(100));

        sup.launch(InstanceId(0), &dir, "meshagent").await.unwrap();
        let err = sup.launch(InstanceId(0), &dir, "meshagent").await.unwrap_err();
        assert!(matches!(err, SpawnError::AlreadyRunning(InstanceId(0))));

        sup.stop_all(Duration::from_secs(5)).await;
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn quick_exit_is_errored() {
        let dir = agent_dir("sup-quick", "exit 0\n");
        let sup = Supervisor::new(BatchId::new(), Duration::from_secs(5));

        sup.launch(InstanceId(0), &dir, "meshagent").await.unwrap();
        let st = wait_for_state(&sup, InstanceId(0), AgentState::Errored).await;
        assert_eq!(st.exit_code, Some(0));
        assert!(st.message.unwrap().contains("too quickly"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn exit_code_is_recorded() {
        let dir = agent_dir("sup-code", "sleep 1\nexit 3\n");
        let sup = Supervisor::new(BatchId::new(), Duration::from_millis(100));

        sup.launch(InstanceId(0), &dir, "meshagent").await.unwrap();
        let st = wait_for_state(&sup, InstanceId(0), AgentState::Errored).await;
        assert_eq!(st.exit_code, Some(3));
        assert_eq!(st.message.as_deref(), Some("exited with code 3"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn external_signal_is_reported() {
        let dir = agent_dir("sup-signal", "exec sleep 30\n");
        let sup = Supervisor::new(BatchId::new(), Duration::from_millis(100));

        let st = sup.launch(InstanceId(0), &dir, "meshagent").await.unwrap();
        let pid = st.pid.unwrap() as i32;
        unsafe {
            libc::kill(pid, libc::SIGKILL);
        }

        let st = wait_for_state(&sup, InstanceId(0), AgentState::Killed).await;
        assert_eq!(st.signal, Some(libc::SIGKILL));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn toggle_returns_before_exit_and_restart_spawns_fresh_process() {
        let dir = agent_dir("sup-toggle", "exec sleep 30\n");
        let sup = Supervisor::new(BatchId::new(), Duration::from_millis(100));

        let first = sup.launch(InstanceId(0), &dir, "meshagent").await.unwrap();
        sup.toggle(InstanceId(0)).await.unwrap();

        let stopped = sup
            .wait_stopped(InstanceId(0), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(stopped.state, AgentState::Killed);
        assert_eq!(stopped.signal, Some(libc::SIGTERM));

        let second = sup.launch(InstanceId(0), &dir, "meshagent").await.unwrap();
        assert_ne!(second.pid, first.pid);

        let third = sup
            .restart(InstanceId(0), Duration::from_secs(5))
            .await
            .unwrap();
        assert_ne!(third.pid, second.pid);
        assert!(third.state.is_live());

        sup.stop_all(Duration::from_secs(5)).await;
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn toggle_unknown_instance_fails() {
        let sup = Supervisor::new(BatchId::new(), Duration::from_millis(100));
        let err = sup.toggle(InstanceId(9)).await.unwrap_err();
        assert!(matches!(err, SpawnError::Unknown(InstanceId(9))));
    }

    #[tokio::test]
    async fn stop_all_kills_agents_ignoring_sigterm() {
        let dir = agent_dir("sup-stubborn", "trap '' TERM\nwhile true; do sleep 1; done\n");
        let sup = Supervisor::new(BatchId::new(), Duration::from_millis(100));

        sup.launch(InstanceId(0), &dir, "meshagent").await.unwrap();
        wait_for_state(&sup, InstanceId(0), AgentState::Running).await;

        let statuses = sup.stop_all(Duration::from_millis(300)).await;
        assert_eq!(statuses.len(), 1);
        assert!(!statuses[0].state.is_live(), "{:?}", statuses[0]);
        // Directories are not the supervisor's business.
        assert!(dir.join("meshagent").exists());

        let _ = std::fs::remove_dir_all(&dir);
    }
}

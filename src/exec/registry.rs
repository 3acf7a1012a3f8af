use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};

use crate::config::ExecConfig;
use crate::exec::error::{ExecError, ExecErrorCode, ExecResult};
use crate::exec::launcher::{spawn_shell, supervise, SupervisorSettings};
use crate::exec::now_ms;
use crate::exec::session::{OutputChunk, SessionHandle, SessionState, SessionSummary};
use crate::exec::termination::TerminationOutcome;
use crate::security::allowed_dirs::WorkingDirectoryPolicy;
use crate::security::command_gate::CommandGate;

const TERMINATION_QUEUE: usize = 4;

#[derive(Debug, Clone, Default)]
pub struct ExecuteRequest {
    pub command: String,
    pub cwd: Option<String>,
    pub timeout_ms: Option<u64>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteOutcome {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub output: String,
    pub completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminateOutcome {
    pub session_id: String,
    pub success: bool,
    pub outcome: TerminationOutcome,
}

/// Authoritative map of live sessions. The map lock only guards
/// insert/lookup/evict; buffer and state updates go through each session's
/// own lock.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    counter: AtomicU64,
    gate: Arc<CommandGate>,
    directories: Arc<dyn WorkingDirectoryPolicy>,
    config: ExecConfig,
}

impl SessionRegistry {
    pub fn new(
        config: ExecConfig,
        gate: Arc<CommandGate>,
        directories: Arc<dyn WorkingDirectoryPolicy>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            counter: AtomicU64::new(0),
            gate,
            directories,
            config,
        })
    }

    pub async fn execute_command(&self, request: ExecuteRequest) -> ExecResult<ExecuteOutcome> {
        let command = request.command.trim().to_owned();
        if command.is_empty() {
            return Err(ExecError::new(
                ExecErrorCode::InvalidArgs,
                "command must be a non-empty string",
            ));
        }

        if let Some(requested) = request.session_id.as_deref().map(str::trim) {
            if let Some(existing) = self.get(requested).await {
                if existing.state().await == SessionState::Running {
                    return Err(ExecError::new(
                        ExecErrorCode::SessionInUse,
                        format!("session {requested} is still running"),
                    ));
                }
            }
        }

        let cwd = self
            .directories
            .resolve_working_directory(request.cwd.as_deref())
            .await?;
        let child = self
            .gate
            .admit(&command, || spawn_shell(&self.config.shell, &command, &cwd))
            .await?;

        let seq = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let session_id = format!("sess-{seq:06}");
        let (finished_tx, finished_rx) = watch::channel(false);
        let (terminate_tx, terminate_rx) = mpsc::channel(TERMINATION_QUEUE);
        let pid = child.id();
        let session = Arc::new(SessionHandle::new(
            seq,
            session_id.clone(),
            command.clone(),
            cwd.clone(),
            pid,
            finished_rx,
            terminate_tx,
        ));
        self.sessions
            .write()
            .await
            .insert(session_id.clone(), session.clone());
        let supervisor = supervise(
            child,
            session.clone(),
            finished_tx,
            terminate_rx,
            SupervisorSettings {
                termination_grace: Duration::from_millis(self.config.termination_grace_ms),
                output_settle: Duration::from_millis(self.config.output_settle_ms),
            },
        );
        session.attach_supervisor(supervisor).await;
        info!(
            "session {session_id} spawned pid={} cwd={} command={command:?}",
            pid.map(|pid| pid.to_string()).unwrap_or_else(|| "?".to_owned()),
            cwd.display()
        );

        let wait = Duration::from_millis(self.effective_timeout_ms(request.timeout_ms));
        if tokio::time::timeout(wait, session.wait_finished())
            .await
            .is_err()
        {
            debug!(
                "session {session_id} detached after {}ms",
                wait.as_millis()
            );
        }

        let chunk = session.drain().await;
        Ok(ExecuteOutcome {
            session_id,
            pid,
            output: chunk.output,
            completed: chunk.completed,
            exit_code: chunk.exit_code,
        })
    }

    pub async fn read_output(&self, session_id: &str) -> ExecResult<OutputChunk> {
        let session = self
            .get(session_id)
            .await
            .ok_or_else(|| ExecError::not_found(session_id))?;
        Ok(session.drain().await)
    }

    pub async fn force_terminate(&self, session_id: &str) -> ExecResult<TerminateOutcome> {
        let session = self
            .get(session_id)
            .await
            .ok_or_else(|| ExecError::not_found(session_id))?;
        session.touch().await;

        let state = session.state().await;
        debug!("force_terminate {session_id} in state {}", state.as_str());
        let outcome = if state.is_terminal() {
            TerminationOutcome::Noop
        } else {
            match session.request_termination().await {
                Some(result) => result?,
                // the supervisor finished on its own while we were asking
                None => TerminationOutcome::Noop,
            }
        };
        Ok(TerminateOutcome {
            session_id: session_id.to_owned(),
            success: true,
            outcome,
        })
    }

    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        let mut sessions = self.snapshot().await;
        sessions.sort_by_key(|session| session.seq);
        let mut rows = Vec::with_capacity(sessions.len());
        for session in sessions {
            rows.push(session.summary().await);
        }
        rows
    }

    /// Drops drained/terminated sessions past the retention window and
    /// abandoned completed sessions past the idle bound.
    pub async fn evict_expired(&self) -> Vec<String> {
        let now = now_ms();
        let retention_ms = self.config.drained_retention_ms;
        let idle_ms = self.config.idle_eviction_secs.saturating_mul(1_000);

        let mut expired = Vec::new();
        for session in self.snapshot().await {
            let inner = session.inner.lock().await;
            let idle_for = now.saturating_sub(inner.last_activity_ms);
            let evict = match inner.state {
                SessionState::Running => false,
                SessionState::CompletedNotDrained => idle_for >= idle_ms,
                SessionState::CompletedDrained | SessionState::Terminated => {
                    idle_for >= retention_ms
                }
            };
            if evict {
                expired.push(session.id.clone());
            }
        }

        if !expired.is_empty() {
            let removed = {
                let mut sessions = self.sessions.write().await;
                expired
                    .iter()
                    .filter_map(|id| sessions.remove(id))
                    .collect::<Vec<_>>()
            };
            for session in removed {
                session.release_supervisor(self.supervisor_budget()).await;
            }
            info!("evicted {} session(s): {}", expired.len(), expired.join(","));
        }
        expired
    }

    /// Terminates every running session and joins every supervisor task;
    /// used on shutdown.
    pub async fn terminate_all(&self) -> usize {
        let mut terminated = 0;
        for session in self.snapshot().await {
            if !session.state().await.is_terminal() {
                match self.force_terminate(&session.id).await {
                    Ok(_) => terminated += 1,
                    Err(err) => warn!("shutdown termination of {} failed: {err}", session.id),
                }
            }
            session.release_supervisor(self.supervisor_budget()).await;
        }
        terminated
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    fn effective_timeout_ms(&self, requested: Option<u64>) -> u64 {
        requested
            .unwrap_or(self.config.default_timeout_ms)
            .min(self.config.max_timeout_ms)
    }

    /// Upper bound for a supervisor to wrap up once its session is terminal.
    fn supervisor_budget(&self) -> Duration {
        Duration::from_millis(
            self.config
                .termination_grace_ms
                .saturating_mul(2)
                .saturating_add(self.config.output_settle_ms)
                .saturating_add(1_000),
        )
    }

    async fn snapshot(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions.read().await.values().cloned().collect()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use super::{ExecuteRequest, SessionRegistry};
    use crate::config::ExecConfig;
    use crate::exec::error::ExecErrorCode;
    use crate::exec::session::SessionState;
    use crate::exec::termination::TerminationOutcome;
    use crate::security::allowed_dirs::DirectoryAllowList;
    use crate::security::command_gate::CommandGate;

    fn temp_path(tag: &str) -> PathBuf {
        let mut root = std::env::temp_dir();
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        root.push(format!("shellgate-registry-{tag}-{stamp}"));
        root
    }

    fn test_config() -> ExecConfig {
        ExecConfig {
            termination_grace_ms: 500,
            output_settle_ms: 200,
            drained_retention_ms: 0,
            ..ExecConfig::default()
        }
    }

    async fn build_registry(tag: &str, config: ExecConfig) -> (Arc<SessionRegistry>, PathBuf) {
        let root = temp_path(tag);
        std::fs::create_dir_all(&root).expect("workspace");
        let gate = CommandGate::load(root.join("blocked.json"), &["rm".to_owned()])
            .await
            .expect("gate");
        let directories = DirectoryAllowList::new(&[root.clone()]).expect("allow list");
        let registry = SessionRegistry::new(config, Arc::new(gate), Arc::new(directories));
        (registry, root)
    }

    fn request(command: &str, timeout_ms: u64) -> ExecuteRequest {
        ExecuteRequest {
            command: command.to_owned(),
            timeout_ms: Some(timeout_ms),
            ..ExecuteRequest::default()
        }
    }

    #[tokio::test]
    async fn quick_command_completes_with_full_output_and_exit_code() {
        let (registry, _root) = build_registry("quick", test_config()).await;
        let outcome = registry
            .execute_command(request("echo hello; echo oops 1>&2; exit 7", 5_000))
            .await
            .expect("execute");
        assert!(outcome.completed);
        assert_eq!(outcome.exit_code, Some(7));
        assert!(outcome.output.contains("hello"));
        assert!(outcome.output.contains("oops"));
    }

    #[tokio::test]
    async fn timeout_detaches_and_read_output_resumes_without_gaps() {
        let (registry, _root) = build_registry("detach", test_config()).await;
        let first = registry
            .execute_command(request("printf A; sleep 0.6; printf B", 250))
            .await
            .expect("execute");
        assert!(!first.completed);
        assert_eq!(first.output, "A");

        tokio::time::sleep(Duration::from_millis(1_200)).await;
        let second = registry
            .read_output(&first.session_id)
            .await
            .expect("read output");
        assert_eq!(second.output, "B");
        assert!(second.completed);
        assert_eq!(second.exit_code, Some(0));

        let third = registry
            .read_output(&first.session_id)
            .await
            .expect("idempotent read");
        assert_eq!(third.output, "");
        assert!(third.completed);
    }

    #[tokio::test]
    async fn blocked_program_is_rejected_before_spawn() {
        let (registry, root) = build_registry("blocked", test_config()).await;
        let marker = root.join("marker");
        std::fs::write(&marker, b"keep").expect("marker");
        let command = format!("rm -f {}", marker.display());
        let err = registry
            .execute_command(request(&command, 1_000))
            .await
            .expect_err("rm should be blocked");
        assert_eq!(err.code, ExecErrorCode::PolicyViolation);
        assert!(registry.list_sessions().await.is_empty());
        assert!(marker.exists());

        assert!(registry.gate.unblock_command("rm").await.expect("unblock"));
        let allowed = registry
            .execute_command(request(&command, 5_000))
            .await
            .expect("rm runs once unblocked");
        assert!(allowed.completed);
        assert_eq!(allowed.exit_code, Some(0));
        assert!(!marker.exists());
        assert_eq!(registry.list_sessions().await.len(), 1);

        let err = registry
            .execute_command(ExecuteRequest {
                command: "echo hi".to_owned(),
                cwd: Some("/".to_owned()),
                ..ExecuteRequest::default()
            })
            .await
            .expect_err("cwd outside allow list");
        assert_eq!(err.code, ExecErrorCode::PathNotAllowed);
    }

    #[tokio::test]
    async fn running_session_id_cannot_be_resubmitted() {
        let (registry, _root) = build_registry("in-use", test_config()).await;
        let running = registry
            .execute_command(request("sleep 5", 50))
            .await
            .expect("execute");
        let err = registry
            .execute_command(ExecuteRequest {
                command: "echo again".to_owned(),
                session_id: Some(running.session_id.clone()),
                timeout_ms: Some(1_000),
                ..ExecuteRequest::default()
            })
            .await
            .expect_err("session in use");
        assert_eq!(err.code, ExecErrorCode::SessionInUse);
        registry
            .force_terminate(&running.session_id)
            .await
            .expect("terminate");
    }

    #[tokio::test]
    async fn force_terminate_freezes_output_and_is_idempotent() {
        let (registry, _root) = build_registry("terminate", test_config()).await;
        let started = registry
            .execute_command(request("while true; do echo tick; sleep 0.02; done", 100))
            .await
            .expect("execute");
        assert!(!started.completed);

        let first = registry
            .force_terminate(&started.session_id)
            .await
            .expect("terminate");
        assert!(first.success);
        assert_ne!(first.outcome, TerminationOutcome::Noop);

        let session = registry.get(&started.session_id).await.expect("session");
        let len_after = session.inner.lock().await.buffer.len();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(session.inner.lock().await.buffer.len(), len_after);
        assert_eq!(session.state().await, SessionState::Terminated);

        let second = registry
            .force_terminate(&started.session_id)
            .await
            .expect("second terminate");
        assert!(second.success);
        assert_eq!(second.outcome, TerminationOutcome::Noop);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let (registry, _root) = build_registry("missing", test_config()).await;
        assert_eq!(
            registry.read_output("sess-999999").await.unwrap_err().code,
            ExecErrorCode::NotFound
        );
        assert_eq!(
            registry.force_terminate("sess-999999").await.unwrap_err().code,
            ExecErrorCode::NotFound
        );
    }

    #[tokio::test]
    async fn drained_sessions_are_evicted() {
        let (registry, _root) = build_registry("evict", test_config()).await;
        let done = registry
            .execute_command(request("echo done", 5_000))
            .await
            .expect("execute");
        assert!(done.completed);
        let running = registry
            .execute_command(request("sleep 5", 20))
            .await
            .expect("execute");

        let done_handle = registry.get(&done.session_id).await.expect("done session");
        let running_handle = registry.get(&running.session_id).await.expect("running session");
        assert!(done_handle.has_supervisor().await);

        let evicted = registry.evict_expired().await;
        assert_eq!(evicted, vec![done.session_id.clone()]);
        assert!(!done_handle.has_supervisor().await);
        let listed = registry.list_sessions().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].session_id, running.session_id);

        assert!(running_handle.has_supervisor().await);
        assert_eq!(registry.terminate_all().await, 1);
        assert!(!running_handle.has_supervisor().await);
        assert_eq!(running_handle.state().await, SessionState::Terminated);
    }

    #[tokio::test]
    async fn concurrent_sessions_keep_separate_buffers() {
        let (registry, _root) = build_registry("concurrent", test_config()).await;
        let left = registry.execute_command(request(
            "for i in 1 2 3 4 5; do echo left; sleep 0.02; done",
            10,
        ));
        let right = registry.execute_command(request(
            "for i in 1 2 3 4 5; do echo right; sleep 0.02; done",
            10,
        ));
        let (left, right) = tokio::join!(left, right);
        let (left, right) = (left.expect("left"), right.expect("right"));
        assert_ne!(left.session_id, right.session_id);

        tokio::time::sleep(Duration::from_millis(600)).await;
        let left_rest = registry.read_output(&left.session_id).await.expect("left");
        let right_rest = registry.read_output(&right.session_id).await.expect("right");
        let left_all = format!("{}{}", left.output, left_rest.output);
        let right_all = format!("{}{}", right.output, right_rest.output);
        assert_eq!(left_all, "left\n".repeat(5));
        assert_eq!(right_all, "right\n".repeat(5));
    }
}

use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::warn;

use crate::exec::buffer::OutputBuffer;
use crate::exec::error::ExecResult;
use crate::exec::termination::TerminationOutcome;
use crate::exec::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Running,
    CompletedNotDrained,
    CompletedDrained,
    Terminated,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::CompletedNotDrained => "completed_not_drained",
            Self::CompletedDrained => "completed_drained",
            Self::Terminated => "terminated",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

pub(crate) type TerminationReply = oneshot::Sender<ExecResult<TerminationOutcome>>;

#[derive(Debug)]
pub(crate) struct SessionInner {
    pub state: SessionState,
    pub buffer: OutputBuffer,
    pub exit_code: Option<i32>,
    pub last_activity_ms: u64,
}

/// One drain of a session's buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputChunk {
    pub output: String,
    pub completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub state: SessionState,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub command: String,
    pub cwd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub state: SessionState,
    pub started_at: u64,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

pub struct SessionHandle {
    pub(crate) seq: u64,
    pub id: String,
    pub command: String,
    pub cwd: PathBuf,
    pub pid: Option<u32>,
    pub started_at_ms: u64,
    started: Instant,
    pub(crate) inner: Mutex<SessionInner>,
    finished: watch::Receiver<bool>,
    terminate_tx: mpsc::Sender<TerminationReply>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl SessionHandle {
    pub(crate) fn new(
        seq: u64,
        id: String,
        command: String,
        cwd: PathBuf,
        pid: Option<u32>,
        finished: watch::Receiver<bool>,
        terminate_tx: mpsc::Sender<TerminationReply>,
    ) -> Self {
        let started_at_ms = now_ms();
        Self {
            seq,
            id,
            command,
            cwd,
            pid,
            started_at_ms,
            started: Instant::now(),
            inner: Mutex::new(SessionInner {
                state: SessionState::Running,
                buffer: OutputBuffer::new(),
                exit_code: None,
                last_activity_ms: started_at_ms,
            }),
            finished,
            terminate_tx,
            supervisor: Mutex::new(None),
        }
    }

    pub(crate) async fn attach_supervisor(&self, task: JoinHandle<()>) {
        *self.supervisor.lock().await = Some(task);
    }

    pub(crate) async fn has_supervisor(&self) -> bool {
        self.supervisor.lock().await.is_some()
    }

    /// Waits up to `budget` for the supervisor task to return, then aborts it.
    /// Aborting drops the child, which is spawned with `kill_on_drop`.
    pub(crate) async fn release_supervisor(&self, budget: Duration) {
        let Some(mut task) = self.supervisor.lock().await.take() else {
            return;
        };
        if timeout(budget, &mut task).await.is_err() {
            warn!("supervisor for {} did not finish in {}ms, aborting", self.id, budget.as_millis());
            task.abort();
        }
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    /// Resolves once the process has exited (naturally or by termination)
    /// and the session left `Running`.
    pub async fn wait_finished(&self) {
        let mut finished = self.finished.clone();
        // a dropped sender means the supervisor is gone, which only happens after finishing
        let _ = finished.wait_for(|done| *done).await;
    }

    pub(crate) async fn append_output(&self, chunk: &[u8]) -> bool {
        let mut inner = self.inner.lock().await;
        if !inner.buffer.append(chunk) {
            return false;
        }
        inner.last_activity_ms = now_ms();
        true
    }

    /// Hands out everything appended since the last drain and applies the
    /// `CompletedNotDrained -> CompletedDrained` transition when the drain
    /// reaches the end of a finished stream.
    pub async fn drain(&self) -> OutputChunk {
        let mut inner = self.inner.lock().await;
        inner.last_activity_ms = now_ms();
        let output = match inner.state {
            SessionState::Running => inner.buffer.drain(false),
            SessionState::CompletedNotDrained => {
                let output = inner.buffer.drain(true);
                if inner.buffer.is_drained() {
                    inner.state = SessionState::CompletedDrained;
                }
                output
            }
            SessionState::CompletedDrained => String::new(),
            SessionState::Terminated => inner.buffer.drain(true),
        };
        OutputChunk {
            output,
            completed: inner.state.is_terminal(),
            exit_code: inner.exit_code,
            state: inner.state,
        }
    }

    pub(crate) async fn request_termination(&self) -> Option<ExecResult<TerminationOutcome>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.terminate_tx.send(reply_tx).await.is_err() {
            return None;
        }
        reply_rx.await.ok()
    }

    pub(crate) async fn touch(&self) {
        self.inner.lock().await.last_activity_ms = now_ms();
    }

    pub async fn summary(&self) -> SessionSummary {
        let inner = self.inner.lock().await;
        SessionSummary {
            session_id: self.id.clone(),
            command: self.command.clone(),
            cwd: self.cwd.display().to_string(),
            pid: self.pid,
            state: inner.state,
            started_at: self.started_at_ms,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            exit_code: inner.exit_code,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use tokio::sync::{mpsc, watch};

    use super::{SessionHandle, SessionState};

    fn detached_handle() -> (SessionHandle, watch::Sender<bool>) {
        let (finished_tx, finished_rx) = watch::channel(false);
        let (terminate_tx, _terminate_rx) = mpsc::channel(1);
        let handle = SessionHandle::new(
            1,
            "sess-000001".to_owned(),
            "echo hi".to_owned(),
            PathBuf::from("/tmp"),
            None,
            finished_rx,
            terminate_tx,
        );
        (handle, finished_tx)
    }

    #[tokio::test]
    async fn drain_after_completion_moves_to_drained_once() {
        let (handle, finished_tx) = detached_handle();
        assert!(handle.append_output(b"partial ").await);
        let first = handle.drain().await;
        assert_eq!(first.output, "partial ");
        assert!(!first.completed);

        handle.append_output(b"rest").await;
        {
            let mut inner = handle.inner.lock().await;
            inner.buffer.seal();
            inner.state = SessionState::CompletedNotDrained;
            inner.exit_code = Some(3);
        }
        let _ = finished_tx.send(true);
        handle.wait_finished().await;

        let second = handle.drain().await;
        assert_eq!(second.output, "rest");
        assert!(second.completed);
        assert_eq!(second.exit_code, Some(3));
        assert_eq!(second.state, SessionState::CompletedDrained);

        let third = handle.drain().await;
        assert_eq!(third.output, "");
        assert!(third.completed);
        assert_eq!(third.state, SessionState::CompletedDrained);
    }

    #[tokio::test]
    async fn stuck_supervisor_is_aborted_on_release() {
        let (handle, _finished_tx) = detached_handle();
        let task = tokio::spawn(std::future::pending::<()>());
        let remote = task.abort_handle();
        handle.attach_supervisor(task).await;
        assert!(handle.has_supervisor().await);

        handle.release_supervisor(Duration::from_millis(20)).await;
        assert!(!handle.has_supervisor().await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(remote.is_finished());
    }

    #[tokio::test]
    async fn termination_request_without_supervisor_reports_none() {
        let (handle, _finished_tx) = detached_handle();
        assert!(handle.request_termination().await.is_none());
    }
}

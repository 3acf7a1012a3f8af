use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::exec::error::{ExecError, ExecErrorCode, ExecResult};
use crate::exec::now_ms;
use crate::exec::registry::{ExecuteRequest, SessionRegistry};
use crate::exec::session::SessionState;
use crate::process_directory;
use crate::protocol::RpcRequestFrame;
use crate::security::allowed_dirs::WorkingDirectoryPolicy;
use crate::security::command_gate::CommandGate;

const TRANSCRIPT_LIMIT: usize = 256;
const HEALTH_TRANSCRIPT_TAIL: usize = 16;

const SUPPORTED_METHODS: &[&str] = &[
    "execute_command",
    "read_output",
    "force_terminate",
    "list_sessions",
    "list_processes",
    "kill_process",
    "block_command",
    "unblock_command",
    "list_blocked_commands",
    "list_allowed_directories",
    "health",
    "methods",
];

pub fn supported_methods() -> &'static [&'static str] {
    SUPPORTED_METHODS
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Handled(Value),
    Error { code: &'static str, message: String },
    NotHandled,
}

impl From<ExecResult<Value>> for DispatchOutcome {
    fn from(result: ExecResult<Value>) -> Self {
        match result {
            Ok(payload) => Self::Handled(payload),
            Err(err) if err.code == ExecErrorCode::Internal => {
                error!("internal error: {}", err.message);
                Self::Error {
                    code: err.code.as_str(),
                    message: "internal error".to_owned(),
                }
            }
            Err(err) => Self::Error {
                code: err.code.as_str(),
                message: err.message,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallTranscriptEntry {
    pub request_id: String,
    pub method: String,
    pub started_at_ms: u64,
    pub duration_ms: u64,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'static str>,
}

/// Maps method names and JSON params onto the session engine, blocklist
/// and process directory.
pub struct ToolDispatcher {
    registry: Arc<SessionRegistry>,
    gate: Arc<CommandGate>,
    directories: Arc<dyn WorkingDirectoryPolicy>,
    started: Instant,
    transcript: Mutex<VecDeque<CallTranscriptEntry>>,
}

impl ToolDispatcher {
    pub fn new(
        registry: Arc<SessionRegistry>,
        gate: Arc<CommandGate>,
        directories: Arc<dyn WorkingDirectoryPolicy>,
    ) -> Self {
        Self {
            registry,
            gate,
            directories,
            started: Instant::now(),
            transcript: Mutex::new(VecDeque::new()),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub async fn handle_request(&self, request: &RpcRequestFrame) -> DispatchOutcome {
        let started_at_ms = now_ms();
        let started = Instant::now();
        let method = normalize_method(&request.method);
        let outcome: DispatchOutcome = match method.as_str() {
            "execute_command" => self.execute_command(&request.params).await.into(),
            "read_output" => self.read_output(&request.params).await.into(),
            "force_terminate" => self.force_terminate(&request.params).await.into(),
            "list_sessions" => self.list_sessions().await.into(),
            "list_processes" => list_processes().await.into(),
            "kill_process" => kill_process(&request.params).into(),
            "block_command" => self.block_command(&request.params).await.into(),
            "unblock_command" => self.unblock_command(&request.params).await.into(),
            "list_blocked_commands" => self.list_blocked_commands().await.into(),
            "list_allowed_directories" => {
                DispatchOutcome::Handled(self.list_allowed_directories())
            }
            "health" => DispatchOutcome::Handled(self.health().await),
            "methods" => DispatchOutcome::Handled(json!({
                "count": SUPPORTED_METHODS.len(),
                "methods": SUPPORTED_METHODS
            })),
            _ => DispatchOutcome::NotHandled,
        };
        if outcome != DispatchOutcome::NotHandled {
            self.record_transcript(request, &method, started_at_ms, started, &outcome)
                .await;
        }
        outcome
    }

    async fn execute_command(&self, params: &Value) -> ExecResult<Value> {
        let command = required_string_arg(params, &["command"], "command")?;
        let request = ExecuteRequest {
            command,
            cwd: first_string_arg(params, &["cwd"]),
            timeout_ms: optional_u64_arg(params, &["timeoutMs", "timeout", "timeout_ms"])?,
            session_id: first_string_arg(params, &["sessionId", "session_id"]),
        };
        let outcome = self.registry.execute_command(request).await?;
        to_payload(&outcome)
    }

    async fn read_output(&self, params: &Value) -> ExecResult<Value> {
        let session_id = required_string_arg(params, &["sessionId", "session_id"], "sessionId")?;
        let chunk = self.registry.read_output(&session_id).await?;
        to_payload(&chunk)
    }

    async fn force_terminate(&self, params: &Value) -> ExecResult<Value> {
        let session_id = required_string_arg(params, &["sessionId", "session_id"], "sessionId")?;
        let outcome = self.registry.force_terminate(&session_id).await?;
        to_payload(&outcome)
    }

    async fn list_sessions(&self) -> ExecResult<Value> {
        let sessions = self.registry.list_sessions().await;
        Ok(json!({
            "count": sessions.len(),
            "sessions": sessions
        }))
    }

    async fn block_command(&self, params: &Value) -> ExecResult<Value> {
        let name = required_string_arg(params, &["command", "name"], "command")?;
        let added = self.gate.block_command(&name).await?;
        Ok(json!({
            "command": name,
            "success": true,
            "changed": added
        }))
    }

    async fn unblock_command(&self, params: &Value) -> ExecResult<Value> {
        let name = required_string_arg(params, &["command", "name"], "command")?;
        let removed = self.gate.unblock_command(&name).await?;
        Ok(json!({
            "command": name,
            "success": true,
            "changed": removed
        }))
    }

    async fn list_blocked_commands(&self) -> ExecResult<Value> {
        let names = self.gate.list_blocked().await;
        Ok(json!({
            "count": names.len(),
            "blockedCommands": names
        }))
    }

    fn list_allowed_directories(&self) -> Value {
        let dirs = self
            .directories
            .allowed_directories()
            .into_iter()
            .map(|dir| dir.display().to_string())
            .collect::<Vec<_>>();
        json!({
            "count": dirs.len(),
            "allowedDirectories": dirs
        })
    }

    async fn health(&self) -> Value {
        let sessions = self.registry.list_sessions().await;
        let running = sessions
            .iter()
            .filter(|session| session.state == SessionState::Running)
            .count();
        let blocked = self.gate.snapshot().await.len();
        let recent = {
            let guard = self.transcript.lock().await;
            guard
                .iter()
                .rev()
                .take(HEALTH_TRANSCRIPT_TAIL)
                .cloned()
                .collect::<Vec<_>>()
        };
        json!({
            "ok": true,
            "version": env!("CARGO_PKG_VERSION"),
            "uptimeMs": self.started.elapsed().as_millis() as u64,
            "sessions": {
                "total": sessions.len(),
                "running": running
            },
            "blockedCommands": blocked,
            "blocklistPath": self.gate.store_path().display().to_string(),
            "recentCalls": recent
        })
    }

    #[cfg(test)]
    pub async fn transcript(&self) -> Vec<CallTranscriptEntry> {
        self.transcript.lock().await.iter().cloned().collect()
    }

    async fn record_transcript(
        &self,
        request: &RpcRequestFrame,
        method: &str,
        started_at_ms: u64,
        started: Instant,
        outcome: &DispatchOutcome,
    ) {
        let (status, error_code) = match outcome {
            DispatchOutcome::Error { code, .. } => ("error", Some(*code)),
            _ => ("ok", None),
        };
        debug!("dispatched {method} id={} status={status}", request.id);
        let mut guard = self.transcript.lock().await;
        guard.push_back(CallTranscriptEntry {
            request_id: request.id.clone(),
            method: method.to_owned(),
            started_at_ms,
            duration_ms: started.elapsed().as_millis() as u64,
            status,
            error_code,
        });
        while guard.len() > TRANSCRIPT_LIMIT {
            guard.pop_front();
        }
    }
}

async fn list_processes() -> ExecResult<Value> {
    let processes = process_directory::list_processes().await?;
    Ok(json!({
        "count": processes.len(),
        "processes": processes
    }))
}

fn kill_process(params: &Value) -> ExecResult<Value> {
    let pid = optional_u64_arg(params, &["pid"])?.ok_or_else(|| {
        ExecError::new(ExecErrorCode::InvalidArgs, "missing required parameter `pid`")
    })?;
    let pid = u32::try_from(pid).map_err(|_| {
        ExecError::new(
            ExecErrorCode::InvalidArgs,
            format!("pid {pid} is out of range"),
        )
    })?;
    let outcome = process_directory::kill_process(pid)?;
    to_payload(&outcome)
}

fn normalize_method(value: &str) -> String {
    value.trim().to_ascii_lowercase()
}

fn to_payload<T: Serialize>(value: &T) -> ExecResult<Value> {
    serde_json::to_value(value).map_err(|err| {
        ExecError::new(
            ExecErrorCode::Internal,
            format!("failed serializing response: {err}"),
        )
    })
}

fn first_string_arg(root: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(value) = root.get(*key).and_then(Value::as_str) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_owned());
            }
        }
    }
    None
}

fn required_string_arg(root: &Value, keys: &[&str], label: &str) -> ExecResult<String> {
    first_string_arg(root, keys).ok_or_else(|| {
        ExecError::new(
            ExecErrorCode::InvalidArgs,
            format!("missing required parameter `{label}`"),
        )
    })
}

/// Absent or null is `None`; anything other than a non-negative integer is
/// rejected.
fn optional_u64_arg(root: &Value, keys: &[&str]) -> ExecResult<Option<u64>> {
    for key in keys {
        match root.get(*key) {
            None | Some(Value::Null) => continue,
            Some(value) => {
                return value.as_u64().map(Some).ok_or_else(|| {
                    ExecError::new(
                        ExecErrorCode::InvalidArgs,
                        format!("parameter `{key}` must be a non-negative integer"),
                    )
                });
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use serde_json::{json, Value};

    use super::{optional_u64_arg, DispatchOutcome, ToolDispatcher};
    use crate::config::ExecConfig;
    use crate::exec::registry::SessionRegistry;
    use crate::protocol::RpcRequestFrame;
    use crate::security::allowed_dirs::{DirectoryAllowList, WorkingDirectoryPolicy};
    use crate::security::command_gate::CommandGate;

    fn temp_path(tag: &str) -> PathBuf {
        let mut root = std::env::temp_dir();
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        root.push(format!("shellgate-dispatch-{tag}-{stamp}"));
        root
    }

    async fn dispatcher(tag: &str) -> ToolDispatcher {
        let root = temp_path(tag);
        std::fs::create_dir_all(&root).expect("root");
        let gate = Arc::new(
            CommandGate::load(root.join("blocked.json"), &["rm".to_owned()])
                .await
                .expect("gate"),
        );
        let directories: Arc<dyn WorkingDirectoryPolicy> =
            Arc::new(DirectoryAllowList::new(&[root]).expect("dirs"));
        let config = ExecConfig {
            termination_grace_ms: 200,
            output_settle_ms: 200,
            ..ExecConfig::default()
        };
        let registry = SessionRegistry::new(config, gate.clone(), directories.clone());
        ToolDispatcher::new(registry, gate, directories)
    }

    fn req(id: &str, method: &str, params: Value) -> RpcRequestFrame {
        RpcRequestFrame {
            id: id.to_owned(),
            method: method.to_owned(),
            params,
        }
    }

    fn handled(outcome: DispatchOutcome) -> Value {
        match outcome {
            DispatchOutcome::Handled(payload) => payload,
            other => panic!("expected handled outcome, got {other:?}"),
        }
    }

    fn error_code(outcome: DispatchOutcome) -> &'static str {
        match outcome {
            DispatchOutcome::Error { code, .. } => code,
            other => panic!("expected error outcome, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn execute_then_read_round_trip_through_json_params() {
        let rpc = dispatcher("exec").await;
        let started = handled(
            rpc.handle_request(&req(
                "1",
                "execute_command",
                json!({"command": "echo A; sleep 0.8; echo B", "timeout": 300}),
            ))
            .await,
        );
        assert_eq!(started.get("completed").and_then(Value::as_bool), Some(false));
        assert_eq!(started.get("output").and_then(Value::as_str), Some("A\n"));
        let session_id = started
            .get("sessionId")
            .and_then(Value::as_str)
            .expect("session id")
            .to_owned();

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        let rest = handled(
            rpc.handle_request(&req("2", "read_output", json!({"sessionId": session_id})))
                .await,
        );
        assert_eq!(rest.get("output").and_then(Value::as_str), Some("B\n"));
        assert_eq!(rest.get("completed").and_then(Value::as_bool), Some(true));
        assert_eq!(rest.get("exitCode").and_then(Value::as_i64), Some(0));
    }

    #[tokio::test]
    async fn errors_map_to_taxonomy_codes() {
        let rpc = dispatcher("errors").await;
        assert_eq!(
            error_code(
                rpc.handle_request(&req(
                    "1",
                    "execute_command",
                    json!({"command": "rm -rf /tmp/nothing"})
                ))
                .await
            ),
            "policy_violation"
        );
        assert_eq!(
            error_code(
                rpc.handle_request(&req("2", "read_output", json!({"sessionId": "sess-999999"})))
                    .await
            ),
            "not_found"
        );
        assert_eq!(
            error_code(rpc.handle_request(&req("3", "read_output", json!({}))).await),
            "invalid_args"
        );
        assert_eq!(
            error_code(
                rpc.handle_request(&req("4", "kill_process", json!({"pid": "abc"})))
                    .await
            ),
            "invalid_args"
        );
        assert_eq!(
            rpc.handle_request(&req("5", "no_such_method", json!({}))).await,
            DispatchOutcome::NotHandled
        );

        let transcript = rpc.transcript().await;
        assert_eq!(transcript.len(), 4);
        assert!(transcript.iter().all(|entry| entry.status == "error"));
        assert_eq!(transcript[0].error_code, Some("policy_violation"));
    }

    #[tokio::test]
    async fn blocklist_methods_take_effect_for_new_executions() {
        let rpc = dispatcher("blocklist").await;
        let added = handled(
            rpc.handle_request(&req("1", "block_command", json!({"command": "curl"})))
                .await,
        );
        assert_eq!(added.get("changed").and_then(Value::as_bool), Some(true));

        let listed = handled(
            rpc.handle_request(&req("2", "list_blocked_commands", json!({})))
                .await,
        );
        let names = listed
            .get("blockedCommands")
            .and_then(Value::as_array)
            .expect("names");
        assert!(names.iter().any(|name| name == "curl"));

        assert_eq!(
            error_code(
                rpc.handle_request(&req(
                    "3",
                    "execute_command",
                    json!({"command": "curl http://localhost"})
                ))
                .await
            ),
            "policy_violation"
        );

        let removed = handled(
            rpc.handle_request(&req("4", "unblock_command", json!({"command": "curl"})))
                .await,
        );
        assert_eq!(removed.get("changed").and_then(Value::as_bool), Some(true));
    }

    #[tokio::test]
    async fn health_and_directory_listing_report_state() {
        let rpc = dispatcher("health").await;
        let dirs = handled(
            rpc.handle_request(&req("1", "list_allowed_directories", json!({})))
                .await,
        );
        assert_eq!(dirs.get("count").and_then(Value::as_u64), Some(1));

        let health = handled(rpc.handle_request(&req("2", "health", json!({}))).await);
        assert_eq!(health.get("ok").and_then(Value::as_bool), Some(true));
        assert_eq!(
            health.get("blockedCommands").and_then(Value::as_u64),
            Some(1)
        );
        assert_eq!(
            health
                .pointer("/recentCalls/0/method")
                .and_then(Value::as_str),
            Some("list_allowed_directories")
        );
    }

    #[test]
    fn numeric_params_accept_aliases_and_reject_garbage() {
        assert_eq!(
            optional_u64_arg(&json!({"timeout": 250}), &["timeoutMs", "timeout"]).expect("ok"),
            Some(250)
        );
        assert_eq!(
            optional_u64_arg(&json!({"timeoutMs": null}), &["timeoutMs"]).expect("ok"),
            None
        );
        assert!(optional_u64_arg(&json!({"timeoutMs": -5}), &["timeoutMs"]).is_err());
    }
}

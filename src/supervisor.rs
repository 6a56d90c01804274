//! Subprocess Supervisor (component H) — spawns the Agent CLI, enforces
//! limits, manages PID identity, and kills safely (spec §4.3).
//!
//! The spawn/monitor/kill shape is grounded in
//! examples/clawde-io-apps/daemon/src/session/claude.rs's pause/resume/stop
//! handling and the SIGTERM-then-SIGKILL escalation in
//! examples/other_examples's `ChildGuard`. PID identity verification reuses
//! `sysinfo::System`, already part of the teacher's stack for
//! resource_governor.rs.

use crate::approval::ActionClass;
use crate::project::Project;
use crate::queue::TaskRow;
use crate::redact::{redact, truncate_chars};
use crate::config::RuntimeConfig;
use crate::error::EngineError;
use crate::queue::TaskQueue;
use crate::session_store::SessionStore;
use crate::audit::AuditLog;
use crate::storage::now_ms;
use crate::stream::{consume, StreamState};
use anyhow::Result;
use std::process::Stdio;
use std::time::{Duration, Instant};
use sysinfo::{Pid, System};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct RunContext {
    pub replay_mode: bool,
    pub checkpoint_summary: Option<String>,
    /// The operator-approved action's description (spec §4.5 rule 4), only
    /// set in replay mode — folded into the scoped replay prompt.
    pub approved_action_description: Option<String>,
    pub force_skip_permissions: bool,
    pub timeout_ms: u64,
    pub allow_resume: bool,
    /// Precomputed thread-history summary (spec §4.4), used only if a
    /// resume-failure fallback run is triggered for a `/continue` task.
    pub fallback_history_summary: Option<String>,
}

impl RunContext {
    pub fn normal(config: &RuntimeConfig, project: &Project, allow_resume: bool) -> Self {
        Self {
            replay_mode: false,
            checkpoint_summary: None,
            approved_action_description: None,
            force_skip_permissions: project.skip_permissions,
            timeout_ms: project_timeout_ms(config, project),
            allow_resume,
            fallback_history_summary: None,
        }
    }

    pub fn replay(config: &RuntimeConfig, checkpoint_summary: String, approved_action_description: String) -> Self {
        Self {
            replay_mode: true,
            checkpoint_summary: Some(checkpoint_summary),
            approved_action_description: Some(approved_action_description),
            force_skip_permissions: true,
            timeout_ms: config.replay_timeout_ms,
            allow_resume: true,
            fallback_history_summary: None,
        }
    }
}

/// Build the scoped replay prompt spec §4.5 rule 4 requires: the approved
/// action is named explicitly so the agent does only that, then continues
/// the original task.
fn scoped_replay_prompt(description: &str, checkpoint_summary: &str, original_prompt: &str) -> String {
    format!(
        "[APPROVED ACTION ONLY] The user approved: {description}. \
         Previous progress: {checkpoint_summary}. \
         Perform the approved action, then continue the original task: {original_prompt}"
    )
}

fn project_timeout_ms(config: &RuntimeConfig, project: &Project) -> u64 {
    if project.timeout_ms > 0 {
        project.timeout_ms
    } else {
        config.default_timeout_ms
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Checkpoint {
    pub original_prompt: String,
    pub summary_of_progress_so_far: String,
    pub replay_actions_so_far: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SummaryInput {
    pub raw_text: String,
    pub tool_summary: Vec<String>,
    pub tokens_used: i64,
    pub token_budget: i64,
    pub replay_actions: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum Outcome {
    Done {
        summary_input: SummaryInput,
        session_ref: Option<String>,
    },
    NeedsApproval {
        checkpoint: Checkpoint,
        action_class: ActionClass,
        description: String,
    },
    Failed {
        error: EngineError,
        detail: String,
    },
}

#[derive(Debug, Clone, Copy)]
enum KillReason {
    Silence,
    HardTimeout,
    Budget,
}

impl KillReason {
    fn label(&self) -> &'static str {
        match self {
            Self::Silence => "killed_by_silence",
            Self::HardTimeout => "killed_by_hard_timeout",
            Self::Budget => "killed_by_budget",
        }
    }
}

struct Attempt {
    state: StreamState,
    stderr_text: String,
    kill_reason: Option<KillReason>,
    exit_status: Option<std::process::ExitStatus>,
}

#[derive(Clone)]
pub struct Supervisor {
    config: RuntimeConfig,
    agent_binary: String,
    api_key_env_var: String,
}

impl Supervisor {
    pub fn new(
        config: RuntimeConfig,
        agent_binary: impl Into<String>,
        api_key_env_var: impl Into<String>,
    ) -> Self {
        Self {
            config,
            agent_binary: agent_binary.into(),
            api_key_env_var: api_key_env_var.into(),
        }
    }

    /// Run (and, if needed, resume-fallback-retry once) a task to a terminal
    /// outcome. Never propagates an exception — every failure mode becomes
    /// an `Outcome` per spec §7's propagation policy.
    pub async fn run(
        &self,
        task: &TaskRow,
        project: &Project,
        mut ctx: RunContext,
        queue: &TaskQueue,
        session_store: &SessionStore,
        audit: &AuditLog,
    ) -> Outcome {
        let mut prompt = if ctx.replay_mode {
            scoped_replay_prompt(
                ctx.approved_action_description.as_deref().unwrap_or(""),
                ctx.checkpoint_summary.as_deref().unwrap_or(""),
                &task.prompt,
            )
        } else {
            task.prompt.clone()
        };
        let mut resumed_once = false;
        let effective_budget = task
            .token_budget
            .unwrap_or(self.config.default_token_budget)
            .max(1);

        loop {
            let session_ref = if ctx.allow_resume {
                session_store
                    .lookup(&task.thread_id)
                    .await
                    .ok()
                    .flatten()
                    .map(|r| r.session_ref)
            } else {
                None
            };

            let attempt = match self
                .attempt(task, project, &ctx, &prompt, session_ref.as_deref(), queue)
                .await
            {
                Ok(a) => a,
                Err(e) => {
                    return Outcome::Failed {
                        error: EngineError::CliError,
                        detail: redact(&e.to_string()),
                    }
                }
            };

            // Schema-drift policy (spec §4.2): nothing usable was extracted
            // but at least one line failed to parse as JSON at all.
            if !attempt.state.has_usable_text() && attempt.state.parse_failures > 0 {
                audit
                    .record(
                        "system",
                        "schema_drift",
                        Some(&task.id),
                        Some(&task.project),
                        Some(&task.thread_id),
                        serde_json::json!({
                            "parse_failures": attempt.state.parse_failures,
                            "lines_seen": attempt.state.lines_seen,
                            "first_failing_line": attempt.state.parse_warnings.first(),
                        }),
                    )
                    .await;
            }

            if let Some(denial) = &attempt.state.permission_denied {
                if !ctx.force_skip_permissions {
                    let checkpoint = Checkpoint {
                        original_prompt: task.prompt.clone(),
                        summary_of_progress_so_far: truncate_chars(
                            &redact(&attempt.state.assistant_text),
                            2000,
                        ),
                        replay_actions_so_far: attempt.state.replay_actions.clone(),
                    };
                    return Outcome::NeedsApproval {
                        checkpoint,
                        action_class: denial.action_class,
                        description: denial.description.clone(),
                    };
                }
            }

            if let Some(reason) = attempt.kill_reason {
                let error = match reason {
                    KillReason::Silence => EngineError::SilenceTimeout,
                    KillReason::HardTimeout => EngineError::Timeout,
                    KillReason::Budget => EngineError::BudgetExceeded,
                };
                return Outcome::Failed {
                    error,
                    detail: reason.label().to_string(),
                };
            }

            let exit_ok = attempt.exit_status.map(|s| s.success()).unwrap_or(false);
            let combined = format!("{}\n{}", attempt.state.assistant_text, attempt.stderr_text);

            if !exit_ok && !resumed_once && ctx.allow_resume && looks_like_resume_failure(&combined) {
                resumed_once = true;
                audit
                    .record(
                        "system",
                        "session_resume_failed",
                        Some(&task.id),
                        Some(&task.project),
                        Some(&task.thread_id),
                        serde_json::json!({ "excerpt": truncate_chars(&redact(&combined), 300) }),
                    )
                    .await;
                ctx.allow_resume = false;
                if let Some(history) = ctx.fallback_history_summary.take() {
                    prompt = format!("{}\n\n{}", task.prompt, history);
                }
                continue;
            }

            if !exit_ok && !attempt.state.has_usable_text() {
                return Outcome::Failed {
                    error: EngineError::CliError,
                    detail: truncate_chars(&redact(&combined), 500),
                };
            }

            if let Some(session_ref) = &attempt.state.session_ref {
                session_store
                    .upsert(&task.thread_id, &task.project, session_ref)
                    .await
                    .ok();
            }

            let mut raw_text = attempt.state.assistant_text.clone();
            if resumed_once {
                raw_text = format!(
                    "(couldn't resume the prior session — ran a fresh one instead)\n{raw_text}"
                );
            }

            return Outcome::Done {
                summary_input: SummaryInput {
                    raw_text,
                    tool_summary: attempt.state.tool_summaries.clone(),
                    tokens_used: attempt.state.tokens_used.unwrap_or(0),
                    token_budget: effective_budget,
                    replay_actions: attempt.state.replay_actions.clone(),
                },
                session_ref: attempt.state.session_ref.clone(),
            };
        }
    }

    async fn attempt(
        &self,
        task: &TaskRow,
        project: &Project,
        ctx: &RunContext,
        prompt: &str,
        session_ref: Option<&str>,
        queue: &TaskQueue,
    ) -> Result<Attempt> {
        let canonical = std::fs::canonicalize(&project.path)?;
        if canonical != project.path || !canonical.is_dir() {
            anyhow::bail!("project path drifted from its configured canonical form");
        }

        let mut args = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
        ];
        if let Some(r) = session_ref {
            args.push("--resume".to_string());
            args.push(r.to_string());
        }
        args.push("-p".to_string());
        args.push(prompt.to_string());
        if ctx.force_skip_permissions || project.skip_permissions {
            args.push("--dangerously-skip-permissions".to_string());
        }

        let mut cmd = Command::new(&self.agent_binary);
        cmd.args(&args)
            .current_dir(&canonical)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in self.whitelisted_env() {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| anyhow::anyhow!("child exited before its pid could be read"))?;
        let start_ts = now_ms();
        queue.set_worker_pid(&task.id, pid, start_ts).await?;

        let stdout = child.stdout.take().expect("stdout is piped");
        let stderr = child.stderr.take().expect("stderr is piped");
        let mut out_lines = BufReader::new(stdout).lines();
        let mut err_lines = BufReader::new(stderr).lines();

        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            while let Ok(Some(line)) = err_lines.next_line().await {
                buf.push_str(&line);
                buf.push('\n');
            }
            buf
        });

        let deadline = Instant::now() + Duration::from_millis(ctx.timeout_ms);
        let effective_budget = task
            .token_budget
            .unwrap_or(self.config.default_token_budget)
            .max(1);
        let mut raw_bytes: usize = 0;
        let mut state = StreamState::new(ctx.replay_mode);
        let mut kill_reason = None;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                kill_reason = Some(KillReason::HardTimeout);
                break;
            }
            let silence_timeout = self.config.silence_timeout();
            let (wait, wait_is_hard_deadline) = if remaining <= silence_timeout {
                (remaining, true)
            } else {
                (silence_timeout, false)
            };

            tokio::select! {
                line = out_lines.next_line() => {
                    match line {
                        Ok(Some(l)) => {
                            raw_bytes += l.len();
                            state = consume(state, &l, redact);
                            let tokens = state.tokens_used.unwrap_or((raw_bytes / 4) as i64);
                            queue.update_tokens(&task.id, tokens).await.ok();
                            if tokens > effective_budget {
                                kill_reason = Some(KillReason::Budget);
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(_) => break,
                    }
                }
                _ = tokio::time::sleep(wait) => {
                    kill_reason = Some(if wait_is_hard_deadline {
                        KillReason::HardTimeout
                    } else {
                        KillReason::Silence
                    });
                    break;
                }
            }
        }

        if kill_reason.is_some() {
            self.kill_verified(pid, start_ts).await;
        }

        let exit_status = child.wait().await.ok();
        queue.clear_worker_pid(&task.id).await.ok();
        let stderr_text = stderr_task.await.unwrap_or_default();

        Ok(Attempt {
            state,
            stderr_text,
            kill_reason,
            exit_status,
        })
    }

    fn whitelisted_env(&self) -> Vec<(String, String)> {
        let mut env = Vec::new();
        for key in ["PATH", "HOME", "NODE_ENV"] {
            if let Ok(v) = std::env::var(key) {
                env.push((key.to_string(), v));
            }
        }
        if let Ok(v) = std::env::var(&self.api_key_env_var) {
            env.push((self.api_key_env_var.clone(), v));
        }
        env
    }

    /// Orphan recovery entrypoint, called once per running row at engine
    /// start (spec §4.1 "Orphan discovery"). Never signals a pid whose
    /// identity cannot be verified.
    pub async fn reap_orphan(&self, worker_pid: Option<i64>, worker_pid_start_ts: Option<i64>) -> OrphanOutcome {
        match (worker_pid, worker_pid_start_ts) {
            (Some(pid), Some(start_ts)) if pid > 0 => {
                if verify_identity(pid as u32, start_ts) {
                    self.kill_verified(pid as u32, start_ts).await;
                    OrphanOutcome::Killed
                } else {
                    OrphanOutcome::NotVerified
                }
            }
            _ => OrphanOutcome::NoPid,
        }
    }

    #[cfg(unix)]
    async fn kill_verified(&self, pid: u32, start_ts: i64) {
        if !verify_identity(pid, start_ts) {
            tracing::warn!(pid, "zombie_pid_reused or unidentified process — refusing to signal");
            return;
        }
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(500)).await;
            if !process_alive(pid) {
                return;
            }
        }
        if verify_identity(pid, start_ts) {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGKILL);
            }
        }
    }

    #[cfg(not(unix))]
    async fn kill_verified(&self, _pid: u32, _start_ts: i64) {
        tracing::warn!("process signalling is only implemented for unix targets");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanOutcome {
    Killed,
    NotVerified,
    NoPid,
}

/// spec §4.3 PID identity discipline: pid exists, its command name looks
/// like the Agent's expected binary, and its OS-reported start time is
/// within 5s of what we recorded at spawn time.
fn verify_identity(pid: u32, start_ts_ms: i64) -> bool {
    let mut sys = System::new();
    let spid = Pid::from_u32(pid);
    sys.refresh_process(spid);
    let Some(process) = sys.process(spid) else {
        return false;
    };
    let name = process.name().to_lowercase();
    let name_ok = name.contains("claude") || name.contains("node") || name.contains("sh");
    let observed_start_ms = (process.start_time() as i64) * 1000;
    let drift_ms = (observed_start_ms - start_ts_ms).abs();
    name_ok && drift_ms <= 5_000
}

fn process_alive(pid: u32) -> bool {
    let mut sys = System::new();
    let spid = Pid::from_u32(pid);
    sys.refresh_process(spid);
    sys.process(spid).is_some()
}

/// Heuristic fallback trigger (spec §4.4): combination of session-ish and
/// failure-ish vocabulary in the combined stdout+stderr text.
fn looks_like_resume_failure(text: &str) -> bool {
    let lower = text.to_lowercase();
    let mentions_session =
        lower.contains("resume") || lower.contains("session") || lower.contains("conversation");
    let mentions_failure = lower.contains("not found")
        || lower.contains("invalid")
        || lower.contains("unable to resume");
    mentions_session && mentions_failure
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::Project;
    use crate::queue::TaskInput;
    use crate::storage::Storage;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(dir: &std::path::Path, body: &str) -> String {
        let path = dir.join("stub_agent.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path.to_string_lossy().into_owned()
    }

    async fn harness(
        script_body: &str,
        config: RuntimeConfig,
    ) -> (Supervisor, TaskQueue, SessionStore, AuditLog, TaskRow, Project, tempfile::TempDir) {
        let work_dir = tempfile::tempdir().unwrap();
        let script_dir = tempfile::tempdir().unwrap();
        let script = write_script(script_dir.path(), script_body);

        let storage = Storage::open_in_memory().await.unwrap();
        let queue = TaskQueue::new(storage.pool(), config.max_queued_per_project);
        let session_store = SessionStore::new(storage.pool());
        let audit = AuditLog::new(storage.pool());

        let project = Project::new("alpha", work_dir.path(), config.default_token_budget, config.default_timeout_ms, false, None).unwrap();
        let task = queue
            .enqueue(TaskInput {
                project: "alpha".into(),
                project_path: project.path.to_string_lossy().into_owned(),
                prompt: "hello".into(),
                thread_id: "t1".into(),
                adapter: "web".into(),
                continue_session: false,
                token_budget: None,
            })
            .await
            .unwrap();
        queue.dequeue_next().await.unwrap();

        let supervisor = Supervisor::new(config, script, "ANTHROPIC_API_KEY");
        (supervisor, queue, session_store, audit, task, project, work_dir)
    }

    fn fast_config() -> RuntimeConfig {
        let mut c = RuntimeConfig::default();
        c.silence_timeout_ms = 300;
        c.default_timeout_ms = 2_000;
        c.replay_timeout_ms = 1_000;
        c
    }

    #[tokio::test]
    async fn happy_path_reports_done_with_session_ref() {
        let (sup, queue, sessions, audit, task, project, _dir) =
            harness(r#"echo '{"result":"hello there","session_id":"sess-1"}'"#, fast_config()).await;
        let ctx = RunContext::normal(&RuntimeConfig::default(), &project, true);
        let outcome = sup.run(&task, &project, ctx, &queue, &sessions, &audit).await;
        match outcome {
            Outcome::Done { summary_input, session_ref } => {
                assert!(summary_input.raw_text.contains("hello there"));
                assert_eq!(session_ref.as_deref(), Some("sess-1"));
            }
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn permission_denied_yields_needs_approval() {
        let (sup, queue, sessions, audit, task, project, _dir) = harness(
            r#"echo '{"type":"error","text":"Permission denied: rm -rf /data"}'; exit 1"#,
            fast_config(),
        )
        .await;
        let ctx = RunContext::normal(&RuntimeConfig::default(), &project, true);
        let outcome = sup.run(&task, &project, ctx, &queue, &sessions, &audit).await;
        match outcome {
            Outcome::NeedsApproval { action_class, .. } => {
                assert_eq!(action_class, ActionClass::DestructiveCmd);
            }
            other => panic!("expected NeedsApproval, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn silence_times_out_and_kills() {
        let (sup, queue, sessions, audit, task, project, _dir) =
            harness("sleep 5", fast_config()).await;
        let ctx = RunContext::normal(&RuntimeConfig::default(), &project, true);
        let outcome = sup.run(&task, &project, ctx, &queue, &sessions, &audit).await;
        match outcome {
            Outcome::Failed { error, .. } => assert_eq!(error, EngineError::SilenceTimeout),
            other => panic!("expected Failed(SilenceTimeout), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn budget_exceeded_kills_run() {
        let mut cfg = fast_config();
        cfg.default_token_budget = 10;
        let (sup, queue, sessions, audit, task, project, _dir) = harness(
            r#"echo '{"usage":{"total_tokens":9999}}'; sleep 5"#,
            cfg,
        )
        .await;
        let ctx = RunContext::normal(&RuntimeConfig::default(), &project, true);
        let outcome = sup.run(&task, &project, ctx, &queue, &sessions, &audit).await;
        match outcome {
            Outcome::Failed { error, .. } => assert_eq!(error, EngineError::BudgetExceeded),
            other => panic!("expected Failed(BudgetExceeded), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fully_malformed_output_emits_schema_drift_audit_entry() {
        let (sup, queue, sessions, audit, task, project, _dir) =
            harness("echo 'not json at all'; echo 'still not json'; exit 1", fast_config()).await;
        let ctx = RunContext::normal(&RuntimeConfig::default(), &project, true);
        let outcome = sup.run(&task, &project, ctx, &queue, &sessions, &audit).await;
        assert!(matches!(outcome, Outcome::Failed { error: EngineError::CliError, .. }));

        let entries = audit.recent(10).await.unwrap();
        assert!(entries.iter().any(|e| e.action == "schema_drift"));
    }

    #[tokio::test]
    async fn reap_orphan_refuses_to_signal_unverifiable_pid() {
        let sup = Supervisor::new(fast_config(), "claude", "ANTHROPIC_API_KEY");
        let outcome = sup.reap_orphan(Some(999_999), Some(0)).await;
        assert_eq!(outcome, OrphanOutcome::NotVerified);
    }

    #[test]
    fn resume_failure_heuristic_matches_expected_phrases() {
        assert!(looks_like_resume_failure("unable to resume session: not found"));
        assert!(looks_like_resume_failure("invalid conversation reference"));
        assert!(!looks_like_resume_failure("everything worked fine"));
    }
}

//! Execution Engine (component I) — the scheduler loop that dequeues
//! tasks, runs them under the supervisor, and routes outcomes (spec §4.8).
//!
//! The tick/launch/in-flight-semaphore shape generalizes
//! examples/clawde-io-apps/daemon/src/process_pool.rs's worker-slot
//! accounting from a fixed pool of long-lived workers to a pool of
//! one-shot subprocess runs gated by `MAX_CONCURRENT_TASKS`.

use crate::adapter::{AdapterBus, ApprovalPrompt, TaskUpdate};
use crate::approval::{ApprovalStore, Resolution};
use crate::audit::{AuditEntry, AuditLog};
use crate::config::RuntimeConfig;
use crate::error::EngineError;
use crate::project::{Project, ProjectRegistry};
use crate::queue::{QueueFull, TaskInput, TaskQueue, TaskRow};
use crate::session_store::SessionStore;
use crate::summarizer::{summarize_with_fallback, Summarizer};
use crate::supervisor::{Checkpoint, Outcome, RunContext, Supervisor};
use crate::thread_binding::{ThreadBindingRow, ThreadBindingStore};
use crate::uploads::{UploadError, UploadHandle, UploadRefRow, UploadStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};

pub struct Engine {
    config: RuntimeConfig,
    projects: ProjectRegistry,
    queue: TaskQueue,
    approvals: ApprovalStore,
    sessions: SessionStore,
    audit: AuditLog,
    uploads: UploadStore,
    thread_bindings: ThreadBindingStore,
    supervisor: Supervisor,
    adapters: AdapterBus,
    summarizer: Arc<dyn Summarizer>,
    in_flight: Arc<Semaphore>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RuntimeConfig,
        projects: ProjectRegistry,
        queue: TaskQueue,
        approvals: ApprovalStore,
        sessions: SessionStore,
        audit: AuditLog,
        uploads: UploadStore,
        thread_bindings: ThreadBindingStore,
        supervisor: Supervisor,
        adapters: AdapterBus,
        summarizer: Arc<dyn Summarizer>,
    ) -> Arc<Self> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let in_flight = Arc::new(Semaphore::new(config.max_concurrent_tasks));
        Arc::new(Self {
            config,
            projects,
            queue,
            approvals,
            sessions,
            audit,
            uploads,
            thread_bindings,
            supervisor,
            adapters,
            summarizer,
            in_flight,
            stop_tx,
            stop_rx,
        })
    }

    /// On start: reap anything left `running` from a prior crash, log and
    /// audit every unconditional-skip project, then drive the tick loop
    /// until `stop()` is called (spec §4.8 point 1, point 4).
    pub async fn run(self: Arc<Self>) {
        self.announce_skip_permission_projects().await;
        if let Err(e) = self.run_orphan_recovery().await {
            tracing::error!(err = %e, "orphan recovery failed at startup");
        }

        let mut interval = tokio::time::interval(self.config.tick_interval());
        let mut stop_rx = self.stop_rx.clone();
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                    self.clone().tick().await;
                }
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Stop the tick loop and refuse new launches; in-flight runs are left
    /// to finish on their own (spec §4.8 point 4: "wait for in-flight with
    /// a grace window" — the caller awaiting `stop()` provides that
    /// window).
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    async fn announce_skip_permission_projects(&self) {
        for project in self.projects.all() {
            if project.skip_permissions {
                tracing::warn!(
                    project = %project.alias,
                    reason = project.skip_permissions_reason.as_deref().unwrap_or(""),
                    "project runs with skip_permissions enabled — approval flow never triggers"
                );
                self.audit
                    .record(
                        "system",
                        "skip_permissions_enabled",
                        None,
                        Some(&project.alias),
                        None,
                        serde_json::json!({ "reason": project.skip_permissions_reason }),
                    )
                    .await;
            }
        }
    }

    async fn run_orphan_recovery(&self) -> anyhow::Result<()> {
        for orphan in self.queue.running_orphans().await? {
            let outcome = self
                .supervisor
                .reap_orphan(orphan.worker_pid, orphan.worker_pid_start_ts)
                .await;

            if outcome == crate::supervisor::OrphanOutcome::NotVerified {
                self.audit
                    .record(
                        "system",
                        "zombie_pid_reused",
                        Some(&orphan.id),
                        Some(&orphan.project),
                        Some(&orphan.thread_id),
                        serde_json::json!({ "pid": orphan.worker_pid }),
                    )
                    .await;
            }

            self.queue
                .mark_failed(&orphan.id, EngineError::WorkerCrashedRecovery.as_code())
                .await?;
            self.adapters
                .send_task_update(
                    &orphan.adapter,
                    TaskUpdate {
                        task_id: orphan.id.clone(),
                        thread_id: orphan.thread_id.clone(),
                        status: "failed".to_string(),
                        summary: None,
                        error: Some(EngineError::WorkerCrashedRecovery.as_code().to_string()),
                    },
                )
                .await;
        }
        Ok(())
    }

    async fn tick(self: Arc<Self>) {
        self.expire_approvals().await;

        loop {
            if *self.stop_rx.borrow() {
                break;
            }
            let permit = match self.in_flight.clone().try_acquire_owned() {
                Ok(p) => p,
                Err(_) => break,
            };
            match self.queue.dequeue_next().await {
                Ok(Some(task)) => {
                    let engine = self.clone();
                    tokio::spawn(async move {
                        engine.launch(task, permit).await;
                    });
                }
                Ok(None) => {
                    drop(permit);
                    break;
                }
                Err(e) => {
                    tracing::error!(err = %e, "dequeue failed");
                    drop(permit);
                    break;
                }
            }
        }
    }

    async fn expire_approvals(&self) {
        match self.approvals.expire_pending(self.config.approval_timeout_ms as i64).await {
            Ok(task_ids) => {
                for task_id in task_ids {
                    let Ok(Some(task)) = self.queue.get(&task_id).await else {
                        continue;
                    };
                    self.queue
                        .mark_failed(&task_id, EngineError::ApprovalTimeout.as_code())
                        .await
                        .ok();
                    self.audit
                        .record(
                            "system",
                            "approval_timeout",
                            Some(&task_id),
                            Some(&task.project),
                            Some(&task.thread_id),
                            serde_json::json!({}),
                        )
                        .await;
                    self.adapters
                        .send_task_update(
                            &task.adapter,
                            TaskUpdate {
                                task_id: task_id.clone(),
                                thread_id: task.thread_id.clone(),
                                status: "failed".to_string(),
                                summary: None,
                                error: Some(EngineError::ApprovalTimeout.as_code().to_string()),
                            },
                        )
                        .await;
                }
            }
            Err(e) => tracing::error!(err = %e, "failed to sweep expired approvals"),
        }
    }

    async fn launch(self: Arc<Self>, task: TaskRow, _permit: tokio::sync::OwnedSemaphorePermit) {
        self.audit
            .record(
                "system",
                "task_started",
                Some(&task.id),
                Some(&task.project),
                Some(&task.thread_id),
                serde_json::json!({}),
            )
            .await;
        self.adapters
            .send_task_update(
                &task.adapter,
                TaskUpdate {
                    task_id: task.id.clone(),
                    thread_id: task.thread_id.clone(),
                    status: "running".to_string(),
                    summary: None,
                    error: None,
                },
            )
            .await;

        let Some(project) = self.projects.get(&task.project).cloned() else {
            self.queue
                .mark_failed(&task.id, EngineError::UnknownProject.as_code())
                .await
                .ok();
            self.adapters
                .send_task_update(
                    &task.adapter,
                    TaskUpdate {
                        task_id: task.id.clone(),
                        thread_id: task.thread_id.clone(),
                        status: "failed".to_string(),
                        summary: None,
                        error: Some(EngineError::UnknownProject.as_code().to_string()),
                    },
                )
                .await;
            return;
        };

        let mut ctx = RunContext::normal(&self.config, &project, task.continue_session);
        if task.continue_session {
            ctx.fallback_history_summary =
                thread_history_summary(&self.queue, &task.thread_id, crate::redact::redact).await;
        }
        let outcome = self
            .supervisor
            .run(&task, &project, ctx, &self.queue, &self.sessions, &self.audit)
            .await;
        self.route_outcome(&task, outcome).await;
    }

    async fn route_outcome(&self, task: &TaskRow, outcome: Outcome) {
        match outcome {
            Outcome::Done { summary_input, .. } => {
                let summary = summarize_with_fallback(
                    self.summarizer.as_ref(),
                    &summary_input,
                    self.config.summarizer_timeout(),
                    self.config.summarizer_enabled,
                )
                .await;
                self.queue.mark_done(&task.id, &summary).await.ok();
                self.audit
                    .record(
                        "system",
                        "task_completed",
                        Some(&task.id),
                        Some(&task.project),
                        Some(&task.thread_id),
                        serde_json::json!({ "tokens_used": summary_input.tokens_used }),
                    )
                    .await;
                self.adapters
                    .send_task_update(
                        &task.adapter,
                        TaskUpdate {
                            task_id: task.id.clone(),
                            thread_id: task.thread_id.clone(),
                            status: "done".to_string(),
                            summary: Some(summary),
                            error: None,
                        },
                    )
                    .await;
            }
            Outcome::Failed { error, detail } => {
                self.queue.mark_failed(&task.id, error.as_code()).await.ok();
                self.audit
                    .record(
                        "system",
                        "task_failed",
                        Some(&task.id),
                        Some(&task.project),
                        Some(&task.thread_id),
                        serde_json::json!({ "error": error.as_code(), "detail": detail }),
                    )
                    .await;
                self.adapters
                    .send_task_update(
                        &task.adapter,
                        TaskUpdate {
                            task_id: task.id.clone(),
                            thread_id: task.thread_id.clone(),
                            status: "failed".to_string(),
                            summary: None,
                            error: Some(error.as_code().to_string()),
                        },
                    )
                    .await;
            }
            Outcome::NeedsApproval {
                checkpoint,
                action_class,
                description,
            } => {
                let checkpoint_json = serde_json::to_string(&checkpoint).unwrap_or_default();
                self.queue.set_checkpoint(&task.id, &checkpoint_json).await.ok();
                self.queue.mark_needs_approval(&task.id).await.ok();

                match self.approvals.create(&task.id, action_class, &description).await {
                    Ok(row) => {
                        self.audit
                            .record(
                                "system",
                                "approval_requested",
                                Some(&task.id),
                                Some(&task.project),
                                Some(&task.thread_id),
                                serde_json::json!({
                                    "approval_id": row.id,
                                    "action_class": action_class.as_str(),
                                }),
                            )
                            .await;
                        self.adapters
                            .request_approval(
                                &task.adapter,
                                ApprovalPrompt {
                                    approval_id: row.id,
                                    task_id: task.id.clone(),
                                    thread_id: task.thread_id.clone(),
                                    description,
                                },
                            )
                            .await;
                    }
                    Err(e) => tracing::error!(err = %e, task_id = %task.id, "failed to create approval row"),
                }
            }
        }
    }

    /// Driven by adapters (spec §4.8 point 3). Atomically resolves the
    /// approval and, on approve, immediately launches the replay run.
    pub async fn resolve_approval(self: Arc<Self>, approval_id: &str, actor: &str, action: Resolution) -> bool {
        let resolved = match self.approvals.resolve(approval_id, actor, action).await {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(err = %e, approval_id, "failed to resolve approval");
                return false;
            }
        };
        if !resolved {
            return false;
        }

        let Ok(Some(approval)) = self.approvals.get(approval_id).await else {
            return true;
        };
        let Ok(Some(task)) = self.queue.get(&approval.task_id).await else {
            return true;
        };

        match action {
            Resolution::Deny => {
                self.queue
                    .mark_failed(&task.id, EngineError::ApprovalDenied.as_code())
                    .await
                    .ok();
                self.audit
                    .record(
                        "system",
                        "approval_denied",
                        Some(&task.id),
                        Some(&task.project),
                        Some(&task.thread_id),
                        serde_json::json!({ "approval_id": approval_id }),
                    )
                    .await;
                self.adapters
                    .send_task_update(
                        &task.adapter,
                        TaskUpdate {
                            task_id: task.id.clone(),
                            thread_id: task.thread_id.clone(),
                            status: "failed".to_string(),
                            summary: None,
                            error: Some(EngineError::ApprovalDenied.as_code().to_string()),
                        },
                    )
                    .await;
            }
            Resolution::Approve => {
                self.audit
                    .record(
                        "system",
                        "approval_granted",
                        Some(&task.id),
                        Some(&task.project),
                        Some(&task.thread_id),
                        serde_json::json!({ "approval_id": approval_id }),
                    )
                    .await;
                let permit = match self.in_flight.clone().acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => return true,
                };
                let engine = self.clone();
                let approved_action_description = approval.description.clone();
                tokio::spawn(async move {
                    engine
                        .launch_replay(task, approval_id.to_string(), approved_action_description, permit)
                        .await;
                });
            }
        }
        true
    }

    async fn launch_replay(
        self: Arc<Self>,
        task: TaskRow,
        approval_id: String,
        approved_action_description: String,
        _permit: tokio::sync::OwnedSemaphorePermit,
    ) {
        if !self.queue.mark_replaying(&task.id).await.unwrap_or(false) {
            return;
        }
        self.adapters
            .send_task_update(
                &task.adapter,
                TaskUpdate {
                    task_id: task.id.clone(),
                    thread_id: task.thread_id.clone(),
                    status: "running".to_string(),
                    summary: None,
                    error: None,
                },
            )
            .await;

        let Some(project) = self.projects.get(&task.project).cloned() else {
            self.queue
                .mark_failed(&task.id, EngineError::UnknownProject.as_code())
                .await
                .ok();
            return;
        };

        let checkpoint: Option<Checkpoint> = task
            .checkpoint
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok());
        let checkpoint_summary = checkpoint
            .as_ref()
            .map(|c| c.summary_of_progress_so_far.clone())
            .unwrap_or_default();

        let ctx = RunContext::replay(&self.config, checkpoint_summary, approved_action_description);
        let outcome = self
            .supervisor
            .run(&task, &project, ctx, &self.queue, &self.sessions, &self.audit)
            .await;

        self.audit
            .record(
                "system",
                "task_replayed",
                Some(&task.id),
                Some(&task.project),
                Some(&task.thread_id),
                serde_json::json!({ "approval_id": approval_id }),
            )
            .await;
        if project.skip_permissions {
            self.audit
                .record(
                    "system",
                    "auto_approved",
                    Some(&task.id),
                    Some(&task.project),
                    Some(&task.thread_id),
                    serde_json::json!({ "reason": project.skip_permissions_reason }),
                )
                .await;
        }

        self.route_outcome(&task, outcome).await;
    }

    /// Cancel a task (spec §4.8 "Cancellation"): flip the terminal status
    /// first, then best-effort PID-verified-kill any current run. The run's
    /// own post-exit handling refrains from re-emitting a terminal update
    /// once the status is no longer `running` (enforced by [[queue]]'s
    /// conditional UPDATEs).
    pub async fn cancel_task(&self, task_id: &str, actor: &str) -> anyhow::Result<bool> {
        let Some(before) = self.queue.get(task_id).await? else {
            return Ok(false);
        };
        let cancelled = self.queue.cancel(task_id).await?;
        if !cancelled {
            return Ok(false);
        }

        self.audit
            .record(
                actor,
                "task_cancelled",
                Some(task_id),
                Some(&before.project),
                Some(&before.thread_id),
                serde_json::json!({}),
            )
            .await;

        if let (Some(pid), Some(start_ts)) = (before.worker_pid, before.worker_pid_start_ts) {
            self.supervisor.reap_orphan(Some(pid), Some(start_ts)).await;
        }

        self.adapters
            .send_task_update(
                &before.adapter,
                TaskUpdate {
                    task_id: task_id.to_string(),
                    thread_id: before.thread_id.clone(),
                    status: "failed".to_string(),
                    summary: None,
                    error: Some(EngineError::CancelledByUser.as_code().to_string()),
                },
            )
            .await;
        Ok(true)
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn projects(&self) -> &ProjectRegistry {
        &self.projects
    }

    // ---- Adapter API (spec §6 "internal contract") ----
    //
    // Everything below is the typed surface the out-of-scope adapters
    // (chat-bot, HTTP+WS server) call against. Grounded in the one-verb-
    // per-function shape of examples/clawde-io-apps/daemon/src/ipc/handlers
    // (`account::create`, `account::list`, ...), adapted to typed
    // request/response structs rather than raw `serde_json::Value` since
    // every other boundary in this crate (TaskInput, ApprovalRow, ...) is
    // already typed.

    /// `enqueue_task` (spec §6): validate the project exists, enqueue, and
    /// audit `task_created` before any worker ever sees the row.
    pub async fn enqueue_task(&self, request: EnqueueRequest) -> anyhow::Result<EnqueueOutcome> {
        let Some(project) = self.projects.get(&request.project_alias) else {
            return Ok(EnqueueOutcome::UnknownProject);
        };

        let input = TaskInput {
            project: request.project_alias.clone(),
            project_path: project.path.to_string_lossy().into_owned(),
            prompt: request.prompt,
            thread_id: request.thread_id.clone(),
            adapter: request.adapter.clone(),
            continue_session: request.continue_session,
            token_budget: None,
        };

        match self.queue.enqueue(input).await {
            Ok(task) => {
                self.audit
                    .record(
                        &request.actor_id,
                        "task_created",
                        Some(&task.id),
                        Some(&task.project),
                        Some(&task.thread_id),
                        serde_json::json!({ "adapter": task.adapter }),
                    )
                    .await;
                self.adapters
                    .send_task_update(
                        &task.adapter,
                        TaskUpdate {
                            task_id: task.id.clone(),
                            thread_id: task.thread_id.clone(),
                            status: "queued".to_string(),
                            summary: None,
                            error: None,
                        },
                    )
                    .await;
                Ok(EnqueueOutcome::Created(task))
            }
            Err(QueueFull::AtCapacity) => Ok(EnqueueOutcome::QueueFull),
            Err(QueueFull::Storage(e)) => Err(e),
        }
    }

    /// `bind_thread` (spec §6): rejects unknown projects, otherwise upserts
    /// the thread -> project mapping.
    pub async fn bind_thread(
        &self,
        thread_id: &str,
        project_alias: &str,
        adapter: &str,
        actor_id: &str,
    ) -> anyhow::Result<Option<ThreadBindingRow>> {
        if self.projects.get(project_alias).is_none() {
            return Ok(None);
        }
        let row = self
            .thread_bindings
            .bind(thread_id, project_alias, adapter, actor_id)
            .await?;
        self.audit
            .record(
                actor_id,
                "thread_bound",
                None,
                Some(project_alias),
                Some(thread_id),
                serde_json::json!({ "adapter": adapter }),
            )
            .await;
        Ok(Some(row))
    }

    pub async fn get_binding(&self, thread_id: &str) -> anyhow::Result<Option<ThreadBindingRow>> {
        self.thread_bindings.get(thread_id).await
    }

    pub fn get_projects(&self) -> Vec<ProjectSummary> {
        self.projects.all().map(ProjectSummary::from).collect()
    }

    /// `get_queue_status` (spec §6): queued depth and whether a project is
    /// currently occupied, per configured project.
    pub async fn get_queue_status(&self) -> anyhow::Result<Vec<QueueStatusEntry>> {
        let mut out = Vec::new();
        for project in self.projects.all() {
            let queued = self.queue.pending_count_for_project(&project.alias).await?;
            let occupied = !self
                .queue
                .list_by_project(&project.alias, 50)
                .await?
                .iter()
                .filter(|t| matches!(t.status.as_str(), "running" | "needs_approval"))
                .collect::<Vec<_>>()
                .is_empty();
            out.push(QueueStatusEntry {
                project: project.alias.clone(),
                queued_count: queued,
                occupied,
            });
        }
        Ok(out)
    }

    pub async fn get_thread_task_history(&self, thread_id: &str, limit: i64) -> anyhow::Result<Vec<TaskRow>> {
        self.queue.list_by_thread(thread_id, limit).await
    }

    pub async fn get_project_task_history(&self, project: &str, limit: i64) -> anyhow::Result<Vec<TaskRow>> {
        self.queue.list_by_project(project, limit).await
    }

    pub async fn get_audit(&self, project: Option<&str>, limit: i64) -> anyhow::Result<Vec<AuditEntry>> {
        match project {
            Some(p) => self.audit.by_project(p, limit).await,
            None => self.audit.recent(limit).await,
        }
    }

    /// `get_budget_today` (spec §6): total `tokens_used` across tasks
    /// created since local midnight, optionally scoped to one project.
    pub async fn get_budget_today(&self, project: Option<&str>) -> anyhow::Result<i64> {
        self.queue.tokens_used_since(project, midnight_ms()).await
    }

    pub async fn create_upload_reference(
        &self,
        project: &str,
        scope_id: &str,
        original_name: &str,
        declared_mime: &str,
        bytes: &[u8],
    ) -> Result<UploadHandle, UploadError> {
        let row = self.uploads.save(project, scope_id, original_name, declared_mime, bytes).await?;
        Ok(UploadHandle::from(&row))
    }

    pub async fn resolve_upload_ref(&self, id: &str) -> Result<Option<UploadRefRow>, UploadError> {
        self.uploads.resolve(id).await
    }

    pub async fn mark_upload_consumed(&self, id: &str) -> Result<(), UploadError> {
        self.uploads.mark_consumed(id).await
    }

    pub async fn cleanup_task_upload_dir(&self, project: &str, scope_id: &str) -> Result<(), UploadError> {
        self.uploads.cleanup_task_upload_dir(project, scope_id).await
    }
}

/// Request envelope for `enqueue_task` (spec §6, spec §9 "config-option
/// envelopes": exactly these fields, nothing else).
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnqueueRequest {
    pub project_alias: String,
    pub prompt: String,
    pub thread_id: String,
    pub adapter: String,
    #[serde(default)]
    pub continue_session: bool,
    pub actor_id: String,
}

#[derive(Debug, Clone)]
pub enum EnqueueOutcome {
    Created(TaskRow),
    QueueFull,
    UnknownProject,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ProjectSummary {
    pub alias: String,
    pub token_budget: i64,
    pub timeout_ms: u64,
    pub skip_permissions: bool,
}

impl From<&Project> for ProjectSummary {
    fn from(p: &Project) -> Self {
        Self {
            alias: p.alias.clone(),
            token_budget: p.token_budget,
            timeout_ms: p.timeout_ms,
            skip_permissions: p.skip_permissions,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStatusEntry {
    pub project: String,
    pub queued_count: i64,
    pub occupied: bool,
}

/// Milliseconds since the epoch at the start of the current UTC day —
/// "today" for `get_budget_today` has no client-supplied timezone to honor,
/// so UTC midnight is the stable, restart-safe boundary.
fn midnight_ms() -> i64 {
    let now = crate::storage::now_ms();
    now - (now % 86_400_000)
}

/// Composes the thread-history fallback summary used by resume-failure
/// retries (spec §4.4): up to the last 3 completed-or-failed tasks on the
/// thread, each reduced to a single redacted line, joined and bounded.
pub async fn thread_history_summary(queue: &TaskQueue, thread_id: &str, redact: impl Fn(&str) -> String) -> Option<String> {
    let tasks = queue.list_by_thread(thread_id, 10).await.ok()?;
    let recent: Vec<&TaskRow> = tasks
        .iter()
        .filter(|t| matches!(t.status.as_str(), "done" | "failed"))
        .take(3)
        .collect();
    if recent.is_empty() {
        return None;
    }
    let lines: Vec<String> = recent
        .iter()
        .map(|t| {
            let ts = t.completed_at.unwrap_or(t.created_at);
            let detail = t
                .result
                .as_deref()
                .or(t.error.as_deref())
                .unwrap_or("");
            format!(
                "{} {}: {}",
                ts,
                t.status,
                crate::redact::truncate_chars(&redact(detail), 160)
            )
        })
        .collect();
    Some(crate::redact::truncate_chars(&lines.join(" | "), 700))
}

//! Adapter Bus (component J) — fans out task updates and approval prompts
//! to registered client-facing adapters (spec §4.7).
//!
//! The two concrete adapters (chat-bot, HTTP+WebSocket) are out of scope
//! (spec §1); this module only owns the registration/dispatch seam they
//! plug into. Dispatch is fire-and-catch per spec §9 ("adapter fan-out must
//! not block the engine loop") — each call is spawned onto its own task so
//! a slow or failing adapter can never stall the scheduler.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct TaskUpdate {
    pub task_id: String,
    pub thread_id: String,
    pub status: String,
    pub summary: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ApprovalPrompt {
    pub approval_id: String,
    pub task_id: String,
    pub thread_id: String,
    pub description: String,
}

#[async_trait]
pub trait Adapter: Send + Sync {
    async fn send_task_update(&self, update: TaskUpdate);
    async fn request_approval(&self, prompt: ApprovalPrompt);
}

/// Fallback used for any adapter tag with nothing registered, and as the
/// out-of-the-box default for `remotewizd` (spec §1: real adapters are
/// pluggable transports supplied by the caller).
pub struct LoggingAdapter;

#[async_trait]
impl Adapter for LoggingAdapter {
    async fn send_task_update(&self, update: TaskUpdate) {
        tracing::info!(
            task_id = %update.task_id,
            thread_id = %update.thread_id,
            status = %update.status,
            "task update (no adapter registered for this tag)"
        );
    }

    async fn request_approval(&self, prompt: ApprovalPrompt) {
        tracing::info!(
            approval_id = %prompt.approval_id,
            task_id = %prompt.task_id,
            "approval requested (no adapter registered for this tag)"
        );
    }
}

#[derive(Clone)]
pub struct AdapterBus {
    adapters: Arc<RwLock<HashMap<String, Arc<dyn Adapter>>>>,
    fallback: Arc<dyn Adapter>,
}

impl Default for AdapterBus {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterBus {
    pub fn new() -> Self {
        Self {
            adapters: Arc::new(RwLock::new(HashMap::new())),
            fallback: Arc::new(LoggingAdapter),
        }
    }

    pub async fn register(&self, tag: impl Into<String>, adapter: Arc<dyn Adapter>) {
        self.adapters.write().await.insert(tag.into(), adapter);
    }

    async fn resolve(&self, tag: &str) -> Arc<dyn Adapter> {
        let adapters = self.adapters.read().await;
        adapters.get(tag).cloned().unwrap_or_else(|| self.fallback.clone())
    }

    pub async fn send_task_update(&self, tag: &str, update: TaskUpdate) {
        let adapter = self.resolve(tag).await;
        let tag = tag.to_string();
        tokio::spawn(async move {
            adapter.send_task_update(update).await;
        })
        .await
        .unwrap_or_else(|e| tracing::error!(tag, err = %e, "adapter task panicked during send_task_update"));
    }

    pub async fn request_approval(&self, tag: &str, prompt: ApprovalPrompt) {
        let adapter = self.resolve(tag).await;
        let tag = tag.to_string();
        tokio::spawn(async move {
            adapter.request_approval(prompt).await;
        })
        .await
        .unwrap_or_else(|e| tracing::error!(tag, err = %e, "adapter task panicked during request_approval"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    struct RecordingAdapter {
        updates: mpsc::UnboundedSender<TaskUpdate>,
    }

    #[async_trait]
    impl Adapter for RecordingAdapter {
        async fn send_task_update(&self, update: TaskUpdate) {
            let _ = self.updates.send(update);
        }

        async fn request_approval(&self, _prompt: ApprovalPrompt) {}
    }

    #[tokio::test]
    async fn dispatches_to_registered_adapter_by_tag() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let bus = AdapterBus::new();
        bus.register("web", Arc::new(RecordingAdapter { updates: tx })).await;

        bus.send_task_update(
            "web",
            TaskUpdate {
                task_id: "t1".into(),
                thread_id: "th1".into(),
                status: "done".into(),
                summary: Some("ok".into()),
                error: None,
            },
        )
        .await;

        let received = rx.recv().await.expect("update delivered");
        assert_eq!(received.task_id, "t1");
        assert_eq!(received.status, "done");
    }

    #[tokio::test]
    async fn unregistered_tag_falls_back_without_panicking() {
        let bus = AdapterBus::new();
        bus.send_task_update(
            "nobody-registered",
            TaskUpdate {
                task_id: "t1".into(),
                thread_id: "th1".into(),
                status: "queued".into(),
                summary: None,
                error: None,
            },
        )
        .await;
    }
}

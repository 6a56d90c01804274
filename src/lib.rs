pub mod adapter;
pub mod approval;
pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod project;
pub mod queue;
pub mod redact;
pub mod session_store;
pub mod storage;
pub mod stream;
pub mod summarizer;
pub mod supervisor;
pub mod thread_binding;
pub mod uploads;

use std::sync::Arc;

use adapter::AdapterBus;
use approval::ApprovalStore;
use audit::AuditLog;
use config::RuntimeConfig;
use engine::Engine;
use project::ProjectRegistry;
use queue::TaskQueue;
use session_store::SessionStore;
use storage::Storage;
use summarizer::Summarizer;
use supervisor::Supervisor;
use thread_binding::ThreadBindingStore;
use uploads::UploadStore;

/// Everything a `remotewizd` process needs to construct an [`Engine`] — the
/// out-of-scope pieces (real project config loading, real adapters, a real
/// summarizer — spec §1) are supplied by the caller; this only wires the
/// in-scope components together against one shared [`Storage`] pool.
pub struct AppContext {
    pub config: RuntimeConfig,
    pub storage: Storage,
    pub projects: ProjectRegistry,
    pub queue: TaskQueue,
    pub approvals: ApprovalStore,
    pub sessions: SessionStore,
    pub audit: AuditLog,
    pub uploads: UploadStore,
    pub thread_bindings: ThreadBindingStore,
    pub adapters: AdapterBus,
}

impl AppContext {
    pub async fn new(
        config: RuntimeConfig,
        data_dir: &std::path::Path,
        uploads_root: &std::path::Path,
        projects: ProjectRegistry,
    ) -> anyhow::Result<Self> {
        let storage = Storage::open(data_dir, "remotewiz").await?;
        let pool = storage.pool();
        let uploads_root = uploads::canonical_uploads_root(uploads_root)?;
        Ok(Self {
            queue: TaskQueue::new(pool.clone(), config.max_queued_per_project),
            approvals: ApprovalStore::new(pool.clone()),
            sessions: SessionStore::new(pool.clone()),
            audit: AuditLog::new(pool.clone()),
            uploads: UploadStore::new(pool.clone(), uploads_root),
            thread_bindings: ThreadBindingStore::new(pool),
            adapters: AdapterBus::new(),
            config,
            storage,
            projects,
        })
    }

    /// Build the running [`Engine`] from this context plus the two pluggable
    /// external collaborators the engine itself does not own (spec §1:
    /// Agent CLI binary location and the summarizer implementation).
    pub fn build_engine(self, agent_binary: impl Into<String>, api_key_env_var: impl Into<String>, summarizer: Arc<dyn Summarizer>) -> Arc<Engine> {
        let supervisor = Supervisor::new(self.config.clone(), agent_binary, api_key_env_var);
        Engine::new(
            self.config,
            self.projects,
            self.queue,
            self.approvals,
            self.sessions,
            self.audit,
            self.uploads,
            self.thread_bindings,
            supervisor,
            self.adapters,
            summarizer,
        )
    }
}

//! Shared test utilities

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use attache::config::ResponderConfig;
use attache::pipeline::{
    AccessControl, AdminCommand, ArchiveStage, Dedup, IdeaCapture, InputSecurity, NewChatNotify,
    NoReplyFilter, Normalize, Outbound, Pipeline, PolicyStage, ReplyContextEnrich, ResponderStage,
};
use attache::policy::admin::AdminService;
use attache::policy::{PolicyDecision, PolicyEngine};
use attache::responder::{FailureTracker, Responder};
use attache::{
    InboundArchive, Message, Result, SecurityEngine, SessionStore, Shutdown,
};

/// Responder stub that returns a fixed reply and counts invocations
pub struct CountingResponder {
    pub calls: AtomicUsize,
    reply: String,
}

impl CountingResponder {
    #[must_use]
    pub fn new(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            reply: reply.to_string(),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Responder for CountingResponder {
    async fn generate_reply(
        &self,
        _event: &Message,
        _decision: &PolicyDecision,
        _memory: &str,
    ) -> Result<Option<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Some(self.reply.clone()))
    }
}

/// A fully wired 13-stage pipeline over temp-dir state
pub struct TestHarness {
    pub pipeline: Pipeline,
    pub engine: Arc<PolicyEngine>,
    pub archive: InboundArchive,
    pub responder: Arc<CountingResponder>,
    pub policy_path: PathBuf,
    pub shutdown: Arc<Shutdown>,
}

/// Build a harness with the given policy document
#[must_use]
pub fn harness(policy_json: &str) -> TestHarness {
    let dir = std::env::temp_dir().join(format!("attache-e2e-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let policy_path = dir.join("policy.json");
    std::fs::write(&policy_path, policy_json).unwrap();

    let engine = Arc::new(PolicyEngine::load(&policy_path).unwrap());
    let archive = InboundArchive::open_memory().unwrap();
    let security = Arc::new(SecurityEngine::builtin().unwrap());
    let sessions = SessionStore::new(dir.join("sessions"));
    let responder = CountingResponder::new("as requested");
    let shutdown = Shutdown::new();
    let admin = Arc::new(AdminService::new(
        Arc::clone(&engine),
        Some(Arc::new(archive.clone())),
        dir.join("backups"),
        dir.join("audit.jsonl"),
    ));
    let failures = Arc::new(FailureTracker::new(&ResponderConfig::default()));

    let pipeline = Pipeline::new(vec![
        Arc::new(Normalize),
        Arc::new(Dedup::default()),
        Arc::new(ArchiveStage::new(archive.clone())),
        Arc::new(ReplyContextEnrich::new(archive.clone(), 6, 8, 1_000)),
        Arc::new(AdminCommand::new(
            Arc::clone(&engine),
            admin,
            sessions.clone(),
            Arc::clone(&shutdown),
        )),
        Arc::new(PolicyStage::new(Arc::clone(&engine))),
        Arc::new(IdeaCapture::new(
            vec!["idea".to_string(), "idee".to_string(), "ideia".to_string()],
            vec!["backlog".to_string(), "todo".to_string()],
        )),
        Arc::new(AccessControl),
        Arc::new(NewChatNotify::new(
            Arc::clone(&engine),
            &archive,
            &["whatsapp", "telegram"],
        )),
        Arc::new(NoReplyFilter),
        Arc::new(InputSecurity::new(Arc::clone(&security), "😂")),
        Arc::new(ResponderStage::new(
            Arc::clone(&responder) as Arc<dyn Responder>,
            None,
            failures,
            Duration::from_secs(5),
            6,
        )),
        Arc::new(Outbound::new(
            security,
            Arc::clone(&engine),
            sessions,
            None,
            None,
            160 * 1024,
            false,
            "😂",
        )),
    ]);

    TestHarness {
        pipeline,
        engine,
        archive,
        responder,
        policy_path,
        shutdown,
    }
}

/// Count user-visible outbound text intents
#[must_use]
pub fn outbound_texts(intents: &[attache::OrchestratorIntent]) -> Vec<String> {
    intents
        .iter()
        .filter_map(|i| match i {
            attache::OrchestratorIntent::OutboundText { text, .. } => Some(text.clone()),
            _ => None,
        })
        .collect()
}

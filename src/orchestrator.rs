//! Orchestrator — inbound consumption and intent dispatch
//!
//! Consumes the inbound bus, runs each message through the pipeline,
//! and fans the resulting intents out: outbound/reaction/typing intents
//! to the channel manager, memory captures to the background lane,
//! metrics to the telemetry sink. Messages of one `(channel, chat)`
//! run strictly in arrival order on a per-chat serial queue; chats run
//! in parallel. A panicking pipeline kills only its own message.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::bus::{BusReceiver, OutboundBus, OutboundItem};
use crate::intents::OrchestratorIntent;
use crate::lifecycle::Shutdown;
use crate::memory::CaptureRequest;
use crate::message::Message;
use crate::pipeline::Pipeline;
use crate::policy::PolicyEngine;

/// Per-chat queue depth
const CHAT_QUEUE_DEPTH: usize = 64;

/// Pipeline driver
pub struct Orchestrator {
    pipeline: Arc<Pipeline>,
    outbound: OutboundBus,
    engine: Arc<PolicyEngine>,
    capture_tx: Option<mpsc::Sender<CaptureRequest>>,
    shutdown: Arc<Shutdown>,
}

impl Orchestrator {
    /// Create the orchestrator
    #[must_use]
    pub fn new(
        pipeline: Arc<Pipeline>,
        outbound: OutboundBus,
        engine: Arc<PolicyEngine>,
        capture_tx: Option<mpsc::Sender<CaptureRequest>>,
        shutdown: Arc<Shutdown>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pipeline,
            outbound,
            engine,
            capture_tx,
            shutdown,
        })
    }

    /// Consume the inbound bus until shutdown drains
    pub async fn run(self: Arc<Self>, mut inbound: BusReceiver<Message>) {
        let mut chat_queues: HashMap<String, mpsc::Sender<Message>> = HashMap::new();

        loop {
            let message = tokio::select! {
                message = inbound.recv() => message,
                () = self.shutdown.wait() => {
                    tracing::info!("orchestrator draining: no longer accepting inbound");
                    break;
                }
            };

            let key = format!("{}:{}", message.channel, message.chat_id);
            let sender = chat_queues
                .entry(key.clone())
                .or_insert_with(|| self.spawn_chat_worker(key));
            if sender.send(message).await.is_err() {
                tracing::warn!("per-chat worker closed unexpectedly");
            }
        }

        // Dropping the queue senders lets in-flight workers finish
        // their backlog before exiting.
        drop(chat_queues);
    }

    fn spawn_chat_worker(&self, key: String) -> mpsc::Sender<Message> {
        let (tx, mut rx) = mpsc::channel::<Message>(CHAT_QUEUE_DEPTH);
        let pipeline = Arc::clone(&self.pipeline);
        let this = Self {
            pipeline: Arc::clone(&self.pipeline),
            outbound: self.outbound.clone(),
            engine: Arc::clone(&self.engine),
            capture_tx: self.capture_tx.clone(),
            shutdown: Arc::clone(&self.shutdown),
        };

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let pipeline = Arc::clone(&pipeline);
                // Each message runs in its own task so a panic inside a
                // stage is confined to that message.
                let run = tokio::spawn(async move { pipeline.run(message).await });
                match run.await {
                    Ok(intents) => this.dispatch(intents).await,
                    Err(e) => {
                        tracing::error!(chat = %key, error = %e, "pipeline task panicked");
                    }
                }
            }
        });
        tx
    }

    /// Fan one pipeline's intents out to their consumers
    pub async fn dispatch(&self, intents: Vec<OrchestratorIntent>) {
        for intent in intents {
            match intent {
                OrchestratorIntent::MetricEvent { name, labels, value } => {
                    tracing::debug!(metric = %name, ?labels, value, "counter");
                }
                OrchestratorIntent::MemoryCapture {
                    channel,
                    chat_id,
                    sender_id,
                    message_id,
                    text,
                    kind,
                    scope: _,
                    assistant,
                } => {
                    let Some(ref capture_tx) = self.capture_tx else {
                        continue;
                    };
                    let sender_is_owner = sender_id.as_ref().is_some_and(|id| {
                        self.engine
                            .is_owner(&channel, &crate::message::Identity::new(id.clone()))
                    });
                    let request = CaptureRequest {
                        channel,
                        chat_id,
                        sender_id,
                        message_id,
                        text,
                        kind,
                        assistant,
                        sender_is_owner,
                    };
                    if capture_tx.try_send(request).is_err() {
                        tracing::debug!("memory capture lane full, dropping request");
                    }
                }
                other => {
                    let channel = match &other {
                        OrchestratorIntent::OutboundText { channel, .. }
                        | OrchestratorIntent::OutboundMedia { channel, .. }
                        | OrchestratorIntent::Reaction { channel, .. }
                        | OrchestratorIntent::Typing { channel, .. } => channel.clone(),
                        _ => continue,
                    };
                    self.outbound.publish(OutboundItem {
                        channel,
                        intent: other,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InboundBus;
    use crate::intents::TypingState;
    use crate::message::Identity;
    use crate::pipeline::{Middleware, Next, PipelineContext};
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl Middleware for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }

        async fn handle(&self, ctx: &mut PipelineContext, _next: Next<'_>) -> crate::Result<()> {
            ctx.intents.push(OrchestratorIntent::OutboundText {
                channel: ctx.event.channel.clone(),
                chat_id: ctx.event.chat_id.clone(),
                text: format!("echo: {}", ctx.event.text_content()),
                reply_to: None,
            });
            Ok(())
        }
    }

    fn engine() -> Arc<PolicyEngine> {
        let dir = std::env::temp_dir().join(format!("attache-orch-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("policy.json"), r#"{"version": 2}"#).unwrap();
        Arc::new(PolicyEngine::load(dir.join("policy.json")).unwrap())
    }

    #[tokio::test]
    async fn messages_flow_to_outbound_bus() {
        let (inbound, inbound_rx) = InboundBus::new("inbound", 16);
        let (outbound, mut outbound_rx) = OutboundBus::new("outbound", 16);
        let shutdown = Shutdown::new();

        let orchestrator = Orchestrator::new(
            Arc::new(Pipeline::new(vec![Arc::new(Echo)])),
            outbound,
            engine(),
            None,
            Arc::clone(&shutdown),
        );
        tokio::spawn(orchestrator.run(inbound_rx));

        inbound.publish(Message::text("telegram", "c1", "m1", Identity::new("u1"), "hi"));

        let item = tokio::time::timeout(std::time::Duration::from_secs(2), outbound_rx.recv())
            .await
            .unwrap();
        assert_eq!(item.channel, "telegram");
        assert!(matches!(
            item.intent,
            OrchestratorIntent::OutboundText { ref text, .. } if text == "echo: hi"
        ));
        shutdown.drain();
    }

    #[tokio::test]
    async fn per_chat_order_is_preserved() {
        let (inbound, inbound_rx) = InboundBus::new("inbound", 64);
        let (outbound, mut outbound_rx) = OutboundBus::new("outbound", 64);
        let shutdown = Shutdown::new();

        let orchestrator = Orchestrator::new(
            Arc::new(Pipeline::new(vec![Arc::new(Echo)])),
            outbound,
            engine(),
            None,
            Arc::clone(&shutdown),
        );
        tokio::spawn(orchestrator.run(inbound_rx));

        for i in 0..10 {
            inbound.publish(Message::text(
                "telegram",
                "c1",
                format!("m{i}"),
                Identity::new("u1"),
                format!("{i}"),
            ));
        }

        let mut seen = Vec::new();
        for _ in 0..10 {
            let item = tokio::time::timeout(std::time::Duration::from_secs(2), outbound_rx.recv())
                .await
                .unwrap();
            if let OrchestratorIntent::OutboundText { text, .. } = item.intent {
                seen.push(text);
            }
        }
        let expected: Vec<String> = (0..10).map(|i| format!("echo: {i}")).collect();
        assert_eq!(seen, expected);
        shutdown.drain();
    }

    #[tokio::test]
    async fn typing_intents_are_forwarded() {
        let (outbound, mut outbound_rx) = OutboundBus::new("outbound", 16);
        let orchestrator = Orchestrator::new(
            Arc::new(Pipeline::new(vec![])),
            outbound,
            engine(),
            None,
            Shutdown::new(),
        );
        orchestrator
            .dispatch(vec![OrchestratorIntent::Typing {
                channel: "whatsapp".to_string(),
                chat_id: "c1".to_string(),
                state: TypingState::On,
            }])
            .await;
        let item = outbound_rx.try_recv().unwrap();
        assert!(matches!(item.intent, OrchestratorIntent::Typing { .. }));
    }
}

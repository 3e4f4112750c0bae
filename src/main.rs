use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use attache::channels::{ChannelManager, DiscordChannel, FeishuChannel, TelegramChannel, WhatsAppChannel};
use attache::config::ensure_dir;
use attache::media::MediaStorage;
use attache::memory::{self, MemoryService, MemoryStore};
use attache::pipeline::{
    AccessControl, AdminCommand, ArchiveStage, Dedup, IdeaCapture, InputSecurity, NewChatNotify,
    NoReplyFilter, Normalize, Outbound, Pipeline, PolicyStage, ReplyContextEnrich, ResponderStage,
};
use attache::policy::admin::{ActorSource, AdminActor, AdminService};
use attache::policy::{spawn_reload_loop, PolicyEngine};
use attache::responder::{FailureTracker, HttpResponder};
use attache::{
    Config, InboundArchive, InboundBus, Identity, Orchestrator, OutboundBus, SecurityEngine,
    SessionStore, Shutdown,
};

/// Attaché - multi-channel personal assistant runtime
#[derive(Parser)]
#[command(name = "attache", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the assistant daemon
    Run,
    /// Invoke the policy admin backend (same commands as the owner DM)
    Policy {
        /// Channel the command applies to
        #[arg(short, long, default_value = "whatsapp")]
        channel: String,
        /// Admin subcommand and arguments
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
    /// Show the merged policy and decision trace for a sender
    Explain {
        channel: String,
        chat_id: String,
        sender: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,attache=info",
        1 => "info,attache=debug",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> attache::Result<()> {
    let config = Config::load()?;
    ensure_dir(&config.home)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_daemon(config).await,
        Command::Policy { channel, args } => {
            let engine = Arc::new(PolicyEngine::load(config.policy_path())?);
            let archive = InboundArchive::open(config.archive_path(), config.archive.retention_days)?;
            let service = AdminService::new(
                Arc::clone(&engine),
                Some(Arc::new(archive)),
                config.policy_backup_dir(),
                config.policy_audit_path(),
            );
            let owner = engine
                .snapshot()
                .owners
                .get(&channel)
                .and_then(|owners| owners.first().cloned())
                .unwrap_or_else(|| "cli".to_string());
            let actor = AdminActor {
                source: ActorSource::Cli,
                id: owner,
                channel,
            };
            let response = service.handle(&actor, &args.join(" "))?;
            println!("{response}");
            Ok(())
        }
        Command::Explain {
            channel,
            chat_id,
            sender,
        } => {
            let engine = PolicyEngine::load(config.policy_path())?;
            let explanation = engine.explain(&channel, &chat_id, &Identity::new(sender));
            println!("{}", serde_json::to_string_pretty(&explanation)?);
            Ok(())
        }
    }
}

#[allow(clippy::too_many_lines)]
async fn run_daemon(config: Config) -> attache::Result<()> {
    let shutdown = Shutdown::new();

    // Stores.
    let archive = InboundArchive::open(config.archive_path(), config.archive.retention_days)?;
    let memory_store = MemoryStore::open(config.memory_path())?;
    let memory_service = Arc::new(MemoryService::new(memory_store, config.memory.clone()));
    let sessions = SessionStore::new(config.sessions_dir());

    // Policy.
    let engine = Arc::new(PolicyEngine::load(config.policy_path())?);
    spawn_reload_loop(Arc::clone(&engine));
    attache::archive::spawn_retention_sweep(archive.clone());

    // Security.
    let security = Arc::new(SecurityEngine::builtin()?);

    // Admin backend.
    let admin = Arc::new(AdminService::new(
        Arc::clone(&engine),
        Some(Arc::new(archive.clone())),
        config.policy_backup_dir(),
        config.policy_audit_path(),
    ));

    // Memory capture lane.
    let (capture_tx, capture_rx) = tokio::sync::mpsc::channel(1_024);
    memory::spawn_capture_worker(Arc::clone(&memory_service), capture_rx);

    // Responder.
    let responder = Arc::new(HttpResponder::new(config.responder.clone()));
    let failures = Arc::new(FailureTracker::new(&config.responder));

    // Voice.
    let tts: Option<Arc<dyn attache::media::tts::TtsSynthesizer>> = config
        .voice
        .tts_url
        .as_ref()
        .map(|url| {
            Arc::new(attache::media::tts::HttpTts::new(
                url.clone(),
                config.voice.tts_api_key.clone(),
            )) as Arc<dyn attache::media::tts::TtsSynthesizer>
        });
    let wa_media = MediaStorage::new(
        config.media_incoming_dir("whatsapp"),
        config.media_outgoing_dir("whatsapp"),
    );

    // The stage order below is load-bearing; see the pipeline module
    // docs before touching it.
    let known_channels = ["whatsapp", "telegram", "discord", "feishu"];
    let pipeline = Arc::new(Pipeline::new(vec![
        Arc::new(Normalize),
        Arc::new(Dedup::new(
            Duration::from_secs(config.pipeline.dedup_ttl_seconds),
            config.pipeline.dedup_max_entries,
        )),
        Arc::new(ArchiveStage::new(archive.clone())),
        Arc::new(ReplyContextEnrich::new(
            archive.clone(),
            config.pipeline.reply_context_window_limit,
            config.pipeline.ambient_window_limit,
            config.pipeline.context_line_max_chars,
        )),
        Arc::new(AdminCommand::new(
            Arc::clone(&engine),
            Arc::clone(&admin),
            sessions.clone(),
            Arc::clone(&shutdown),
        )),
        Arc::new(PolicyStage::new(Arc::clone(&engine))),
        Arc::new(IdeaCapture::new(
            config.pipeline.idea_words.clone(),
            config.pipeline.backlog_words.clone(),
        )),
        Arc::new(AccessControl),
        Arc::new(NewChatNotify::new(
            Arc::clone(&engine),
            &archive,
            &known_channels,
        )),
        Arc::new(NoReplyFilter),
        Arc::new(InputSecurity::new(Arc::clone(&security), "😂")),
        Arc::new(ResponderStage::new(
            responder,
            Some(Arc::clone(&memory_service)),
            failures,
            Duration::from_secs(config.responder.timeout_seconds),
            config.memory.recall_limit,
        )),
        Arc::new(Outbound::new(
            Arc::clone(&security),
            Arc::clone(&engine),
            sessions.clone(),
            tts,
            Some(wa_media),
            config.voice.max_audio_bytes,
            config.memory.capture_assistant,
            "😂",
        )),
    ]));

    // Buses.
    let (inbound, inbound_rx) = InboundBus::new("inbound", config.pipeline.queue_capacity);
    let (outbound, outbound_rx) = OutboundBus::new("outbound", config.pipeline.queue_capacity);

    // Channels.
    let mut manager = ChannelManager::new();
    if config.channels.whatsapp.enabled {
        config.bridge.validate()?;
        let asr: Option<Arc<dyn attache::media::asr::AsrTranscriber>> =
            config.voice.asr_url.as_ref().map(|url| {
                Arc::new(attache::media::asr::HttpAsr::new(url.clone(), None))
                    as Arc<dyn attache::media::asr::AsrTranscriber>
            });
        let whatsapp = WhatsAppChannel::new(
            config.bridge.url(),
            config.bridge.token.clone(),
            config.channels.whatsapp.debounce_ms,
            inbound.clone(),
            asr,
        );
        Arc::clone(&whatsapp).spawn();
        manager.register(whatsapp);
    }
    if config.channels.telegram.enabled {
        let token = config
            .channels
            .telegram
            .bot_token
            .clone()
            .ok_or_else(|| attache::Error::Config("telegram.botToken is required".to_string()))?;
        let telegram = TelegramChannel::new(&token, inbound.clone());
        Arc::clone(&telegram).spawn();
        manager.register(telegram);
    }
    if config.channels.discord.enabled {
        let token = config
            .channels
            .discord
            .token
            .clone()
            .ok_or_else(|| attache::Error::Config("discord.token is required".to_string()))?;
        manager.register(Arc::new(DiscordChannel::new(
            token,
            config.channels.discord.api_url.clone(),
        )));
    }
    if config.channels.feishu.enabled {
        let credentials = config
            .channels
            .feishu
            .token
            .clone()
            .ok_or_else(|| attache::Error::Config("feishu.token is required".to_string()))?;
        manager.register(Arc::new(FeishuChannel::new(
            &credentials,
            config.channels.feishu.api_url.clone(),
        )));
    }

    let manager = Arc::new(manager);
    tokio::spawn(Arc::clone(&manager).run(outbound_rx));

    // Orchestrator.
    let orchestrator = Orchestrator::new(
        pipeline,
        outbound,
        Arc::clone(&engine),
        Some(capture_tx),
        Arc::clone(&shutdown),
    );
    let orchestrator_task = tokio::spawn(orchestrator.run(inbound_rx));

    tracing::info!(home = %config.home.display(), "attache running");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, draining");
            shutdown.drain();
        }
        () = shutdown.wait() => {}
    }

    // Give in-flight pipelines a moment to finish, then stop channels.
    let _ = tokio::time::timeout(Duration::from_secs(10), orchestrator_task).await;
    manager.disconnect_all().await;
    Ok(())
}

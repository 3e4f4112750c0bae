//! Owner admin commands for live policy management
//!
//! The same backend serves DM `/policy …` commands and the CLI. Every
//! mutation validates under the strict schema, writes a snapshot backup
//! referenced by `change_id`, appends an audit record, and replaces the
//! policy file atomically. Dry-run reports the would-be change without
//! touching the file.

use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};

use super::schema::{ChatPolicyOverride, PolicySpec, WhenToReplyMode};
use super::{content_hash, write_policy_atomic, PolicyEngine};
use crate::archive::InboundArchive;
use crate::{Error, Result};

/// Keyed limiter bounding commands per owner per rolling minute
type OwnerLimiter = RateLimiter<
    String,
    governor::state::keyed::DefaultKeyedStateStore<String>,
    governor::clock::DefaultClock,
>;

/// Where an admin command came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorSource {
    /// Owner DM through a channel
    Dm,
    /// Local CLI invocation
    Cli,
}

/// The authenticated owner issuing a command
#[derive(Debug, Clone)]
pub struct AdminActor {
    /// Command origin
    pub source: ActorSource,
    /// Owner sender id
    pub id: String,
    /// Channel the command applies to
    pub channel: String,
}

/// One audit log entry (JSONL)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    pub timestamp: String,
    pub actor_source: ActorSource,
    pub actor_id: String,
    pub channel: String,
    pub chat_id: Option<String>,
    pub command_raw: String,
    pub dry_run: bool,
    pub result: String,
    pub before_hash: String,
    pub after_hash: String,
    pub backup_ref: Option<String>,
}

/// Admin command service
pub struct AdminService {
    engine: Arc<PolicyEngine>,
    archive: Option<Arc<InboundArchive>>,
    backup_dir: PathBuf,
    audit_path: PathBuf,
    limiter: OwnerLimiter,
}

const HELP: &str = "\
/policy commands:\n\
  help\n\
  list-groups [query]          (alias: groups)\n\
  resolve-group <name|id>\n\
  status-group <chat_id>\n\
  explain-group <chat_id>\n\
  allow-group <chat_id> [--dry-run]     (alias: resume-group)\n\
  block-group <chat_id> [--dry-run]     (alias: pause-group)\n\
  set-when <chat_id> <all|off|mention_only|allowed_senders|owner_only> [--dry-run]\n\
  set-persona <chat_id> <path> [--dry-run]\n\
  clear-persona <chat_id> [--dry-run]\n\
  block-sender <chat_id> <sender>\n\
  unblock-sender <chat_id> <sender>\n\
  list-blocked <chat_id>\n\
  history [limit]\n\
  rollback <change_id> [--confirm] [--dry-run]";

impl AdminService {
    /// Create the service
    #[must_use]
    pub fn new(
        engine: Arc<PolicyEngine>,
        archive: Option<Arc<InboundArchive>>,
        backup_dir: PathBuf,
        audit_path: PathBuf,
    ) -> Self {
        let per_minute = engine
            .snapshot()
            .runtime
            .admin_command_rate_limit_per_minute;
        let quota = Quota::per_minute(NonZeroU32::new(per_minute).unwrap_or(NonZeroU32::MIN));
        Self {
            engine,
            archive,
            backup_dir,
            audit_path,
            limiter: RateLimiter::keyed(quota),
        }
    }

    /// Handle one tokenized command line (without the `/policy` prefix)
    ///
    /// # Errors
    ///
    /// Returns error for malformed commands; throttling and validation
    /// failures are reported as normal response strings
    pub fn handle(&self, actor: &AdminActor, raw: &str) -> Result<String> {
        if self.limiter.check_key(&actor.id).is_err() {
            return Ok("rate limit exceeded, try again in a minute".to_string());
        }

        let tokens = tokenize(raw);
        let Some((command, args)) = tokens.split_first() else {
            return Ok(HELP.to_string());
        };

        let command = resolve_alias(command);
        let dry_run = args.iter().any(|a| a == "--dry-run");
        let confirm = args.iter().any(|a| a == "--confirm");
        let args: Vec<&str> = args
            .iter()
            .map(String::as_str)
            .filter(|a| !a.starts_with("--"))
            .collect();

        match command {
            "help" => Ok(HELP.to_string()),
            "list-groups" => Ok(self.list_groups(actor, args.first().copied())),
            "resolve-group" => {
                let needle = args
                    .first()
                    .ok_or_else(|| Error::Admin("resolve-group needs <name|id>".to_string()))?;
                Ok(self.resolve_group(actor, needle))
            }
            "status-group" => {
                let chat = required_chat(&args)?;
                Ok(self.status_group(actor, chat))
            }
            "explain-group" => {
                let chat = required_chat(&args)?;
                let explanation = self.engine.explain(
                    &actor.channel,
                    chat,
                    &crate::message::Identity::new(actor.id.clone()),
                );
                Ok(format!(
                    "explain {chat}\n{}\ntrace:\n  {}",
                    serde_json::to_string_pretty(&explanation.resolved)?,
                    explanation.trace.join("\n  ")
                ))
            }
            "allow-group" => {
                let chat = required_chat(&args)?.to_string();
                self.mutate(actor, Some(&chat), raw, dry_run, |spec| {
                    set_when(spec, &actor.channel, &chat, WhenToReplyMode::All);
                    Ok(format!("{chat}: whenToReply.mode -> all"))
                })
            }
            "block-group" => {
                let chat = required_chat(&args)?.to_string();
                if self.requires_confirm() && !confirm && !dry_run {
                    return Ok("block-group is a risky change; re-run with --confirm".to_string());
                }
                self.mutate(actor, Some(&chat), raw, dry_run, |spec| {
                    set_when(spec, &actor.channel, &chat, WhenToReplyMode::Off);
                    Ok(format!("{chat}: whenToReply.mode -> off"))
                })
            }
            "set-when" => {
                let chat = required_chat(&args)?.to_string();
                let mode_raw = args
                    .get(1)
                    .ok_or_else(|| Error::Admin("set-when needs <chat_id> <mode>".to_string()))?;
                let mode = parse_when_mode(mode_raw)?;
                self.mutate(actor, Some(&chat), raw, dry_run, |spec| {
                    set_when(spec, &actor.channel, &chat, mode);
                    Ok(format!("{chat}: whenToReply.mode -> {mode_raw}"))
                })
            }
            "set-persona" => {
                let chat = required_chat(&args)?.to_string();
                let path = args
                    .get(1)
                    .ok_or_else(|| Error::Admin("set-persona needs <chat_id> <path>".to_string()))?
                    .to_string();
                self.mutate(actor, Some(&chat), raw, dry_run, |spec| {
                    chat_override(spec, &actor.channel, &chat).persona_file =
                        Some(Some(path.clone()));
                    Ok(format!("{chat}: personaFile -> {path}"))
                })
            }
            "clear-persona" => {
                let chat = required_chat(&args)?.to_string();
                self.mutate(actor, Some(&chat), raw, dry_run, |spec| {
                    chat_override(spec, &actor.channel, &chat).persona_file = Some(None);
                    Ok(format!("{chat}: personaFile cleared"))
                })
            }
            "block-sender" => {
                let chat = required_chat(&args)?.to_string();
                let sender = required_sender(&args)?.to_string();
                self.mutate(actor, Some(&chat), raw, dry_run, |spec| {
                    let over = chat_override(spec, &actor.channel, &chat);
                    let blocked = over.blocked_senders.get_or_insert_with(Default::default);
                    let senders = blocked.senders.get_or_insert_with(Vec::new);
                    if !senders.contains(&sender) {
                        senders.push(sender.clone());
                    }
                    Ok(format!("{chat}: blocked {sender}"))
                })
            }
            "unblock-sender" => {
                let chat = required_chat(&args)?.to_string();
                let sender = required_sender(&args)?.to_string();
                self.mutate(actor, Some(&chat), raw, dry_run, |spec| {
                    let over = chat_override(spec, &actor.channel, &chat);
                    if let Some(blocked) = over.blocked_senders.as_mut() {
                        if let Some(senders) = blocked.senders.as_mut() {
                            senders.retain(|s| s != &sender);
                        }
                    }
                    Ok(format!("{chat}: unblocked {sender}"))
                })
            }
            "list-blocked" => {
                let chat = required_chat(&args)?;
                let resolved = self.engine.snapshot().resolve(&actor.channel, chat);
                if resolved.blocked_senders.senders.is_empty() {
                    Ok(format!("{chat}: no blocked senders"))
                } else {
                    Ok(format!(
                        "{chat}: blocked senders:\n  {}",
                        resolved.blocked_senders.senders.join("\n  ")
                    ))
                }
            }
            "history" => {
                let limit = args
                    .first()
                    .and_then(|a| a.parse::<usize>().ok())
                    .unwrap_or(10);
                self.history(limit)
            }
            "rollback" => {
                let change_id = args
                    .first()
                    .ok_or_else(|| Error::Admin("rollback needs <change_id>".to_string()))?
                    .to_string();
                if self.requires_confirm() && !confirm && !dry_run {
                    return Ok("rollback is a risky change; re-run with --confirm".to_string());
                }
                let restored = self.load_backup(&change_id)?;
                self.mutate(actor, None, raw, dry_run, move |spec| {
                    *spec = restored;
                    Ok(format!("rolled back to snapshot {change_id}"))
                })
            }
            other => Err(Error::Admin(format!("unknown subcommand: {other}"))),
        }
    }

    fn requires_confirm(&self) -> bool {
        self.engine
            .snapshot()
            .runtime
            .admin_require_confirm_for_risky
    }

    fn list_groups(&self, actor: &AdminActor, needle: Option<&str>) -> String {
        let mut chats: Vec<String> = self
            .engine
            .snapshot()
            .channels
            .get(&actor.channel)
            .map(|cp| cp.chats.keys().cloned().collect())
            .unwrap_or_default();
        if let Some(ref archive) = self.archive {
            if let Ok(known) = archive.distinct_chats(&actor.channel, None) {
                for chat in known {
                    if !chats.contains(&chat) {
                        chats.push(chat);
                    }
                }
            }
        }
        chats.sort();
        if let Some(needle) = needle {
            let lowered = needle.to_lowercase();
            chats.retain(|c| c.to_lowercase().contains(&lowered));
        }
        if chats.is_empty() {
            "no known chats".to_string()
        } else {
            format!("known chats:\n  {}", chats.join("\n  "))
        }
    }

    fn resolve_group(&self, actor: &AdminActor, needle: &str) -> String {
        let listing = self.list_groups(actor, Some(needle));
        if listing.starts_with("no known") {
            format!("no chat matching '{needle}'")
        } else {
            listing
        }
    }

    fn status_group(&self, actor: &AdminActor, chat: &str) -> String {
        let resolved = self.engine.snapshot().resolve(&actor.channel, chat);
        format!(
            "{chat}\n  whoCanTalk: {:?}\n  whenToReply: {:?}\n  blockedSenders: {}\n  allowedTools: {:?} (deny: {})\n  personaFile: {}",
            resolved.who_can_talk.mode,
            resolved.when_to_reply.mode,
            resolved.blocked_senders.senders.len(),
            resolved.allowed_tools.mode,
            resolved.allowed_tools.deny.len(),
            resolved.persona_file.as_deref().unwrap_or("-"),
        )
    }

    fn history(&self, limit: usize) -> Result<String> {
        if !self.audit_path.exists() {
            return Ok("no admin history".to_string());
        }
        let raw = std::fs::read_to_string(&self.audit_path)?;
        let lines: Vec<&str> = raw.lines().filter(|l| !l.trim().is_empty()).collect();
        let tail = lines.iter().rev().take(limit.max(1)).rev();
        let mut out = Vec::new();
        for line in tail {
            if let Ok(record) = serde_json::from_str::<AuditRecord>(line) {
                out.push(format!(
                    "{} {} {} {}{}",
                    record.timestamp,
                    record.id,
                    record.actor_id,
                    record.result,
                    if record.dry_run { " (dry-run)" } else { "" }
                ));
            }
        }
        if out.is_empty() {
            Ok("no admin history".to_string())
        } else {
            Ok(out.join("\n"))
        }
    }

    /// Apply one mutation with validate → backup → atomic persist →
    /// swap → audit semantics
    fn mutate(
        &self,
        actor: &AdminActor,
        chat_id: Option<&str>,
        raw: &str,
        dry_run: bool,
        mutator: impl FnOnce(&mut PolicySpec) -> Result<String>,
    ) -> Result<String> {
        let before = (*self.engine.snapshot()).clone();
        let before_json = before.to_json()?;
        let before_hash = content_hash(&before_json);

        let mut after = before.clone();
        let description = mutator(&mut after)?;

        // Round-trip through the strict parser so a bad mutation can
        // never reach disk.
        let after_json = after.to_json()?;
        PolicySpec::parse(&after_json)?;
        let after_hash = content_hash(&after_json);

        let change_id = format!("chg_{}", uuid::Uuid::new_v4().simple());

        if dry_run {
            self.append_audit(&AuditRecord {
                id: change_id.clone(),
                timestamp: Utc::now().to_rfc3339(),
                actor_source: actor.source,
                actor_id: actor.id.clone(),
                channel: actor.channel.clone(),
                chat_id: chat_id.map(ToString::to_string),
                command_raw: raw.to_string(),
                dry_run: true,
                result: description.clone(),
                before_hash: before_hash.clone(),
                after_hash: after_hash.clone(),
                backup_ref: None,
            })?;
            return Ok(format!(
                "dry-run: {description}\nbefore={before_hash}\nafter={after_hash}\nno changes written"
            ));
        }

        std::fs::create_dir_all(&self.backup_dir)?;
        let backup_path = self.backup_dir.join(format!("{change_id}.json"));
        std::fs::write(&backup_path, &before_json)?;

        write_policy_atomic(self.engine.path(), &after)?;
        self.engine.install(after);

        self.append_audit(&AuditRecord {
            id: change_id.clone(),
            timestamp: Utc::now().to_rfc3339(),
            actor_source: actor.source,
            actor_id: actor.id.clone(),
            channel: actor.channel.clone(),
            chat_id: chat_id.map(ToString::to_string),
            command_raw: raw.to_string(),
            dry_run: false,
            result: description.clone(),
            before_hash: before_hash.clone(),
            after_hash: after_hash.clone(),
            backup_ref: Some(backup_path.display().to_string()),
        })?;

        Ok(format!(
            "{description}\nchange_id={change_id}\nbefore={before_hash}\nafter={after_hash}"
        ))
    }

    fn append_audit(&self, record: &AuditRecord) -> Result<()> {
        use std::io::Write;
        if let Some(parent) = self.audit_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.audit_path)?;
        writeln!(file, "{}", serde_json::to_string(record)?)?;
        Ok(())
    }

    fn load_backup(&self, change_id: &str) -> Result<PolicySpec> {
        // change_id is owner-supplied; restrict to the expected shape
        // before touching the filesystem.
        if !change_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(Error::Admin(format!("invalid change id: {change_id}")));
        }
        let path = self.backup_dir.join(format!("{change_id}.json"));
        if !path.exists() {
            return Err(Error::Admin(format!("no backup for change {change_id}")));
        }
        let raw = std::fs::read_to_string(&path)?;
        PolicySpec::parse(&raw)
    }
}

/// Shell-style tokenization with single/double quote support
#[must_use]
pub fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in input.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                } else {
                    current.push(c);
                }
            }
            None => match c {
                '\'' | '"' => quote = Some(c),
                c if c.is_whitespace() => {
                    if !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                    }
                }
                c => current.push(c),
            },
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn resolve_alias(command: &str) -> &str {
    match command {
        "resume-group" => "allow-group",
        "pause-group" => "block-group",
        "groups" => "list-groups",
        other => other,
    }
}

fn required_chat<'a>(args: &[&'a str]) -> Result<&'a str> {
    args.first()
        .copied()
        .ok_or_else(|| Error::Admin("missing <chat_id>".to_string()))
}

fn required_sender<'a>(args: &[&'a str]) -> Result<&'a str> {
    args.get(1)
        .copied()
        .ok_or_else(|| Error::Admin("missing <sender>".to_string()))
}

fn parse_when_mode(raw: &str) -> Result<WhenToReplyMode> {
    match raw {
        "all" => Ok(WhenToReplyMode::All),
        "off" => Ok(WhenToReplyMode::Off),
        "mention_only" => Ok(WhenToReplyMode::MentionOnly),
        "allowed_senders" => Ok(WhenToReplyMode::AllowedSenders),
        "owner_only" => Ok(WhenToReplyMode::OwnerOnly),
        other => Err(Error::Admin(format!("unknown whenToReply mode: {other}"))),
    }
}

fn chat_override<'a>(
    spec: &'a mut PolicySpec,
    channel: &str,
    chat: &str,
) -> &'a mut ChatPolicyOverride {
    spec.channels
        .entry(channel.to_string())
        .or_default()
        .chats
        .entry(chat.to_string())
        .or_default()
}

fn set_when(spec: &mut PolicySpec, channel: &str, chat: &str, mode: WhenToReplyMode) {
    chat_override(spec, channel, chat)
        .when_to_reply
        .get_or_insert_with(Default::default)
        .mode = Some(mode);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> (AdminService, PathBuf) {
        let dir = std::env::temp_dir().join(format!("attache-admin-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let policy_path = dir.join("policy.json");
        std::fs::write(&policy_path, r#"{"version": 2}"#).unwrap();
        let engine = Arc::new(PolicyEngine::load(&policy_path).unwrap());
        let service = AdminService::new(
            engine,
            None,
            dir.join("backups"),
            dir.join("audit.jsonl"),
        );
        (service, policy_path)
    }

    fn actor() -> AdminActor {
        AdminActor {
            source: ActorSource::Dm,
            id: "491701234567".to_string(),
            channel: "whatsapp".to_string(),
        }
    }

    #[test]
    fn tokenize_handles_quotes() {
        assert_eq!(
            tokenize(r#"set-persona g1 "my persona.md""#),
            vec!["set-persona", "g1", "my persona.md"]
        );
    }

    #[test]
    fn dry_run_does_not_modify_file() {
        let (service, path) = service();
        let before = std::fs::read_to_string(&path).unwrap();
        let response = service
            .handle(&actor(), "allow-group 1203630@g.us --dry-run")
            .unwrap();
        assert!(response.contains("dry-run"));
        assert!(response.contains("before="));
        assert!(response.contains("after="));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
    }

    #[test]
    fn mutation_persists_and_is_rollbackable() {
        let (service, path) = service();
        let original = std::fs::read_to_string(&path).unwrap();
        let original_spec = PolicySpec::parse(&original).unwrap();

        let response = service.handle(&actor(), "block-group g1@g.us").unwrap();
        let change_id = response
            .lines()
            .find_map(|l| l.strip_prefix("change_id="))
            .unwrap()
            .to_string();

        let mutated = PolicySpec::parse(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(
            mutated.resolve("whatsapp", "g1@g.us").when_to_reply.mode,
            WhenToReplyMode::Off
        );

        let rollback = service
            .handle(&actor(), &format!("rollback {change_id} --confirm"))
            .unwrap();
        assert!(rollback.contains("rolled back"));
        let restored = PolicySpec::parse(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(restored, original_spec);
    }

    #[test]
    fn history_lists_mutations() {
        let (service, _path) = service();
        service.handle(&actor(), "allow-group g1@g.us").unwrap();
        let history = service.handle(&actor(), "history").unwrap();
        assert!(history.contains("whenToReply.mode -> all"));
    }

    #[test]
    fn unknown_subcommand_is_error() {
        let (service, _path) = service();
        assert!(service.handle(&actor(), "frobnicate").is_err());
    }

    #[test]
    fn block_and_unblock_sender() {
        let (service, path) = service();
        service
            .handle(&actor(), "block-sender g1@g.us +4917612345")
            .unwrap();
        let spec = PolicySpec::parse(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(
            spec.resolve("whatsapp", "g1@g.us").blocked_senders.senders,
            vec!["+4917612345"]
        );

        service
            .handle(&actor(), "unblock-sender g1@g.us +4917612345")
            .unwrap();
        let spec = PolicySpec::parse(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(spec
            .resolve("whatsapp", "g1@g.us")
            .blocked_senders
            .senders
            .is_empty());
    }
}

//! Policy engine and admin command scenarios

mod common;

use attache::policy::PolicySpec;
use attache::{Identity, Message};
use common::{harness, outbound_texts};

fn owner_dm(text: &str) -> Message {
    Message::text(
        "whatsapp",
        "491700000009@s.whatsapp.net",
        format!("m-{}", uuid::Uuid::new_v4().simple()),
        Identity::new("491700000009@s.whatsapp.net"),
        text,
    )
}

const OWNER_POLICY: &str = r#"{
    "version": 2,
    "owners": {"whatsapp": ["+491700000009"]}
}"#;

#[tokio::test]
async fn admin_dry_run_reports_hashes_without_writing() {
    let h = harness(OWNER_POLICY);
    let before = std::fs::read_to_string(&h.policy_path).unwrap();

    let intents = h
        .pipeline
        .run(owner_dm("/policy allow-group 120363000@g.us --dry-run"))
        .await;
    let texts = outbound_texts(&intents);
    assert_eq!(texts.len(), 1);
    assert!(texts[0].contains("dry-run"));
    assert!(texts[0].contains("before="));
    assert!(texts[0].contains("after="));
    assert!(texts[0].contains("no changes written"));

    assert_eq!(std::fs::read_to_string(&h.policy_path).unwrap(), before);
}

#[tokio::test]
async fn admin_mutation_rollback_restores_the_file() {
    let h = harness(OWNER_POLICY);
    let original = PolicySpec::parse(&std::fs::read_to_string(&h.policy_path).unwrap()).unwrap();

    let intents = h
        .pipeline
        .run(owner_dm("/policy block-group 120363000@g.us"))
        .await;
    let response = outbound_texts(&intents).remove(0);
    let change_id = response
        .lines()
        .find_map(|l| l.strip_prefix("change_id="))
        .expect("mutation response carries a change_id")
        .to_string();

    let mutated = PolicySpec::parse(&std::fs::read_to_string(&h.policy_path).unwrap()).unwrap();
    assert_ne!(mutated, original);

    let intents = h
        .pipeline
        .run(owner_dm(&format!("/policy rollback {change_id} --confirm")))
        .await;
    assert!(outbound_texts(&intents)[0].contains("rolled back"));

    let restored = PolicySpec::parse(&std::fs::read_to_string(&h.policy_path).unwrap()).unwrap();
    assert_eq!(restored, original);
}

#[tokio::test]
async fn admin_mutation_takes_effect_without_reload() {
    let h = harness(OWNER_POLICY);

    h.pipeline
        .run(owner_dm("/policy set-when G1@g.us off"))
        .await;

    // The new snapshot is live immediately for evaluation.
    let mut msg = Message::text(
        "whatsapp",
        "G1@g.us",
        "m-next",
        Identity::new("someone"),
        "anyone home?",
    );
    msg.is_group = true;
    let intents = h.pipeline.run(msg).await;
    assert!(outbound_texts(&intents).is_empty());
    assert_eq!(h.responder.call_count(), 0);
}

#[tokio::test]
async fn non_owner_gets_nothing_from_admin_namespace() {
    let h = harness(OWNER_POLICY);
    let msg = Message::text(
        "whatsapp",
        "stranger@s.whatsapp.net",
        "m1",
        Identity::new("stranger@s.whatsapp.net"),
        "/policy list-groups",
    );
    let intents = h.pipeline.run(msg).await;
    assert!(intents.iter().all(|i| !i.is_outbound()));
}

#[tokio::test]
async fn panic_command_drains_the_runtime() {
    let h = harness(OWNER_POLICY);
    assert!(!h.shutdown.is_draining());
    let intents = h.pipeline.run(owner_dm("/panic")).await;
    assert!(h.shutdown.is_draining());
    assert!(outbound_texts(&intents)[0].contains("draining"));
}

#[tokio::test]
async fn history_lists_recent_changes() {
    let h = harness(OWNER_POLICY);
    h.pipeline
        .run(owner_dm("/policy allow-group 120363000@g.us"))
        .await;
    let intents = h.pipeline.run(owner_dm("/policy history")).await;
    assert!(outbound_texts(&intents)[0].contains("whenToReply.mode -> all"));
}

#[test]
fn policy_round_trips_byte_stable_semantics() {
    let raw = r#"{
        "version": 2,
        "owners": {"whatsapp": ["+491700000009"], "telegram": ["42"]},
        "defaults": {
            "whoCanTalk": {"mode": "everyone", "senders": []},
            "allowedTools": {"mode": "allowlist", "tools": ["web_search", "read_file"], "deny": ["exec"]}
        },
        "channels": {
            "whatsapp": {
                "default": {"whenToReply": {"mode": "mention_only"}},
                "chats": {"G1@g.us": {"personaFile": "personas/butler.md"}}
            }
        }
    }"#;
    let spec = PolicySpec::parse(raw).unwrap();
    let serialized = spec.to_json().unwrap();
    let reparsed = PolicySpec::parse(&serialized).unwrap();
    assert_eq!(spec, reparsed);
}

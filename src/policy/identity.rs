//! Sender identity normalization
//!
//! Policy lists and inbound senders arrive in several shapes per
//! channel (full JIDs, bare phone numbers, `@usernames`, numeric ids).
//! Everything is canonicalized into a set of aliases before comparison;
//! a match succeeds when any alias of the sender equals any alias of a
//! listed entry.

use std::collections::BTreeSet;

use crate::message::Identity;

/// Normalize one raw identity token: trim, drop a leading `@`, lowercase
#[must_use]
pub fn normalize_token(value: &str) -> String {
    let token = value.trim();
    let token = token.strip_prefix('@').unwrap_or(token);
    token.trim().to_lowercase()
}

/// Expand one normalized token into channel-aware aliases
#[must_use]
pub fn expand_aliases(channel: &str, token: &str) -> BTreeSet<String> {
    let mut aliases = BTreeSet::new();
    if token.is_empty() {
        return aliases;
    }
    aliases.insert(token.to_string());

    match channel {
        "telegram" => {
            // Username variants: "@foo" vs "foo"; numeric ids stay as-is.
            if !token.chars().all(|c| c.is_ascii_digit()) {
                aliases.insert(format!("@{token}"));
            }
        }
        "whatsapp" => {
            // JID variants: "49170:12@s.whatsapp.net" / "49170@s.whatsapp.net" / "49170" / "+49170".
            let (left, right) = token
                .split_once('@')
                .map_or((token, ""), |(l, r)| (l, r));
            let left_base = left.split(':').next().unwrap_or(left);
            aliases.insert(left_base.to_string());
            if !right.is_empty() {
                aliases.insert(format!("{left_base}@{}", right.to_lowercase()));
            }
            if let Some(bare) = left_base.strip_prefix('+') {
                aliases.insert(bare.to_string());
            } else if left_base.chars().all(|c| c.is_ascii_digit()) {
                aliases.insert(format!("+{left_base}"));
            }
        }
        _ => {}
    }

    aliases
}

/// Normalize a policy sender list into its full alias set
#[must_use]
pub fn normalize_sender_list(channel: &str, values: &[String]) -> BTreeSet<String> {
    let mut normalized = BTreeSet::new();
    for value in values {
        let token = normalize_token(value);
        normalized.extend(expand_aliases(channel, &token));
    }
    normalized
}

/// All canonical aliases of an inbound sender identity
#[must_use]
pub fn sender_aliases(channel: &str, sender: &Identity) -> BTreeSet<String> {
    let mut aliases = BTreeSet::new();
    for candidate in [Some(sender.id.as_str()), sender.handle.as_deref()]
        .into_iter()
        .flatten()
    {
        let token = normalize_token(candidate);
        aliases.extend(expand_aliases(channel, &token));
    }
    aliases
}

/// Whether the sender matches any entry of a normalized alias set
#[must_use]
pub fn sender_matches(channel: &str, sender: &Identity, allowed: &BTreeSet<String>) -> bool {
    if allowed.is_empty() {
        return false;
    }
    sender_aliases(channel, sender)
        .iter()
        .any(|alias| allowed.contains(alias))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whatsapp_device_suffix_is_stripped() {
        let aliases = expand_aliases("whatsapp", "491701234567:12@s.whatsapp.net");
        assert!(aliases.contains("491701234567"));
        assert!(aliases.contains("491701234567@s.whatsapp.net"));
        assert!(aliases.contains("+491701234567"));
    }

    #[test]
    fn whatsapp_phone_forms_match_each_other() {
        let listed = normalize_sender_list("whatsapp", &["+491701234567".to_string()]);
        let sender = Identity::new("491701234567@s.whatsapp.net");
        assert!(sender_matches("whatsapp", &sender, &listed));
    }

    #[test]
    fn telegram_username_is_case_insensitive_with_optional_at() {
        let listed = normalize_sender_list("telegram", &["@Alice".to_string()]);
        let mut sender = Identity::new("12345");
        sender.handle = Some("alice".to_string());
        assert!(sender_matches("telegram", &sender, &listed));
    }

    #[test]
    fn telegram_numeric_id_matches() {
        let listed = normalize_sender_list("telegram", &["12345".to_string()]);
        let sender = Identity::new("12345");
        assert!(sender_matches("telegram", &sender, &listed));
    }

    #[test]
    fn empty_list_never_matches() {
        let listed = BTreeSet::new();
        let sender = Identity::new("anyone");
        assert!(!sender_matches("whatsapp", &sender, &listed));
    }
}

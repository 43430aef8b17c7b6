//! Moderation checks: pubkey blocklist, kind allowlist, blocked content
//! substrings, and tag-name allowlist.

use crate::config::{ModerationConfig, GIFT_WRAP_KIND};
use crate::error::RelayError;
use crate::event::Event;

pub fn check(config: &ModerationConfig, event: &Event) -> Result<(), RelayError> {
    if event.kind != GIFT_WRAP_KIND && config.blocked_pubkeys.contains(&event.pubkey) {
        return Err(RelayError::blocked("pubkey is blocked"));
    }

    if let Some(allowed_kinds) = &config.allowed_kinds {
        if !allowed_kinds.contains(&event.kind) {
            return Err(RelayError::blocked("kind not allowed"));
        }
    }

    for needle in &config.blocked_content_substrings {
        if !needle.is_empty() && event.content.contains(needle.as_str()) {
            return Err(RelayError::blocked("content not allowed"));
        }
    }

    if let Some(allowed_tags) = &config.allowed_tag_names {
        for tag in &event.tags {
            if let Some(name) = tag.first() {
                if !allowed_tags.contains(name) {
                    return Err(RelayError::blocked("tag not allowed"));
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn sample_event(kind: u64, pubkey: &str, content: &str) -> Event {
        Event {
            id: "a".repeat(64),
            pubkey: pubkey.to_string(),
            created_at: 1,
            kind,
            tags: vec![],
            content: content.to_string(),
            sig: "b".repeat(128),
        }
    }

    fn base_config() -> ModerationConfig {
        ModerationConfig {
            blocked_pubkeys: HashSet::new(),
            allowed_kinds: None,
            blocked_content_substrings: vec![],
            allowed_tag_names: None,
        }
    }

    #[test]
    fn blocked_pubkey_is_rejected() {
        let mut cfg = base_config();
        cfg.blocked_pubkeys.insert("bad".to_string());
        let result = check(&cfg, &sample_event(1, "bad", "hi"));
        assert_eq!(result, Err(RelayError::blocked("pubkey is blocked")));
    }

    #[test]
    fn gift_wrap_kind_bypasses_blocklist() {
        let mut cfg = base_config();
        cfg.blocked_pubkeys.insert("bad".to_string());
        let result = check(&cfg, &sample_event(GIFT_WRAP_KIND, "bad", "hi"));
        assert!(result.is_ok());
    }

    #[test]
    fn blocked_content_substring_is_rejected() {
        let mut cfg = base_config();
        cfg.blocked_content_substrings.push("spam".to_string());
        let result = check(&cfg, &sample_event(1, "ok", "this is spam"));
        assert_eq!(result, Err(RelayError::blocked("content not allowed")));
    }
}

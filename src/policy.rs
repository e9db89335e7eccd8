use std::fmt;
use std::str::FromStr;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::store::Store;

pub const DEFAULT_RULES: &str = "general spam detection";
pub const DEFAULT_LANGUAGE: &str = "english";

/// What happens to a spammer once the bot is allowed to act.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Punishment {
    Delete,
    Mute,
    Kick,
    Ban,
}

impl Punishment {
    /// Punishments that leave a durable violation record by default.
    pub fn is_recorded(self) -> bool {
        matches!(self, Punishment::Mute | Punishment::Ban)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Punishment::Delete => "delete",
            Punishment::Mute => "mute",
            Punishment::Kick => "kick",
            Punishment::Ban => "ban",
        }
    }
}

impl fmt::Display for Punishment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Punishment {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "delete" => Ok(Punishment::Delete),
            "mute" => Ok(Punishment::Mute),
            "kick" => Ok(Punishment::Kick),
            "ban" => Ok(Punishment::Ban),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatPolicy {
    pub rules: String,
    pub language: String,
    pub punishment: Punishment,
}

impl Default for ChatPolicy {
    fn default() -> Self {
        Self {
            rules: DEFAULT_RULES.to_string(),
            language: DEFAULT_LANGUAGE.to_string(),
            punishment: Punishment::Mute,
        }
    }
}

pub fn rules_key(chat_id: i64) -> String {
    format!("rules_{}", chat_id)
}

pub fn language_key(chat_id: i64) -> String {
    format!("language_{}", chat_id)
}

pub fn punishment_key(chat_id: i64) -> String {
    format!("punishment_{}", chat_id)
}

impl Store {
    /// Load the chat's policy. Missing keys, read failures, and values that
    /// no longer parse all degrade to the defaults.
    pub async fn chat_policy(&self, chat_id: i64) -> ChatPolicy {
        let mut policy = ChatPolicy::default();

        match self.get(&rules_key(chat_id)).await {
            Ok(Some(rules)) if !rules.trim().is_empty() => policy.rules = rules,
            Ok(_) => {}
            Err(e) => warn!("rules read failed for chat {}: {:#}", chat_id, e),
        }

        match self.get(&language_key(chat_id)).await {
            Ok(Some(language)) if !language.trim().is_empty() => policy.language = language,
            Ok(_) => {}
            Err(e) => warn!("language read failed for chat {}: {:#}", chat_id, e),
        }

        match self.get(&punishment_key(chat_id)).await {
            Ok(Some(raw)) => match raw.parse() {
                Ok(p) => policy.punishment = p,
                Err(()) => warn!("unrecognized stored punishment {:?} for chat {}", raw, chat_id),
            },
            Ok(None) => {}
            Err(e) => warn!("punishment read failed for chat {}: {:#}", chat_id, e),
        }

        policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::temp_store;

    #[test]
    fn punishment_parses_case_insensitively() {
        assert_eq!("mute".parse(), Ok(Punishment::Mute));
        assert_eq!(" BAN ".parse(), Ok(Punishment::Ban));
        assert_eq!("Kick".parse(), Ok(Punishment::Kick));
        assert_eq!("delete".parse(), Ok(Punishment::Delete));
        assert_eq!(Punishment::from_str("warn"), Err(()));
    }

    #[test]
    fn only_mute_and_ban_are_recorded_by_default() {
        assert!(Punishment::Mute.is_recorded());
        assert!(Punishment::Ban.is_recorded());
        assert!(!Punishment::Kick.is_recorded());
        assert!(!Punishment::Delete.is_recorded());
    }

    #[tokio::test]
    async fn unset_chat_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir);
        let policy = store.chat_policy(-100).await;
        assert_eq!(policy, ChatPolicy::default());
        assert_eq!(policy.punishment, Punishment::Mute);
    }

    #[tokio::test]
    async fn stored_punishment_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir);
        store.put(&punishment_key(-100), "ban").await.unwrap();
        assert_eq!(store.chat_policy(-100).await.punishment, Punishment::Ban);
        // until changed again
        assert_eq!(store.chat_policy(-100).await.punishment, Punishment::Ban);
        store.put(&punishment_key(-100), "kick").await.unwrap();
        assert_eq!(store.chat_policy(-100).await.punishment, Punishment::Kick);
    }

    #[tokio::test]
    async fn invalid_stored_punishment_degrades_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir);
        store.put(&punishment_key(7), "guillotine").await.unwrap();
        assert_eq!(store.chat_policy(7).await.punishment, Punishment::Mute);
    }

    #[tokio::test]
    async fn stored_rules_and_language_are_used() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir);
        store.put(&rules_key(5), "no crypto ads").await.unwrap();
        store.put(&language_key(5), "spanish").await.unwrap();
        let policy = store.chat_policy(5).await;
        assert_eq!(policy.rules, "no crypto ads");
        assert_eq!(policy.language, "spanish");
    }
}

use anyhow::Result;
use log::warn;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::policy::Punishment;
use crate::store::Store;

/// How many violations the /start overview shows. The stored sequence itself
/// is unbounded.
pub const DISPLAY_LIMIT: usize = 5;

pub fn now_ts() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// One enforced punishment, kept for audit and appeals. `handled` is written
/// false; flipping it after an admin resolves the case is an extension point
/// with no code path yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub chat_id: i64,
    pub chat_title: String,
    pub timestamp: i64,
    pub punishment: Punishment,
    pub content: String,
    pub reason: String,
    pub handled: bool,
}

fn user_key(user_id: u64) -> String {
    format!("user_{}", user_id)
}

impl Store {
    /// The user's violations in insertion order. Read failures and corrupt
    /// stored sequences degrade to an empty history.
    pub async fn violations(&self, user_id: u64) -> Vec<ViolationRecord> {
        let raw = match self.get(&user_key(user_id)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!("violation history read failed for user {}: {:#}", user_id, e);
                return Vec::new();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(records) => records,
            Err(e) => {
                warn!("corrupt violation history for user {}: {}", user_id, e);
                Vec::new()
            }
        }
    }

    pub async fn append_violation(&self, user_id: u64, record: ViolationRecord) -> Result<()> {
        let mut records = self.violations(user_id).await;
        records.push(record);
        let encoded = serde_json::to_string(&records)?;
        self.put(&user_key(user_id), &encoded).await
    }
}

/// The tail of the history shown to the user.
pub fn display_window(records: &[ViolationRecord]) -> &[ViolationRecord] {
    let start = records.len().saturating_sub(DISPLAY_LIMIT);
    &records[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::temp_store;

    fn record(chat_id: i64, reason: &str) -> ViolationRecord {
        ViolationRecord {
            chat_id,
            chat_title: "Rust Beginners".to_string(),
            timestamp: 1_754_000_000,
            punishment: Punishment::Mute,
            content: "Earn $5000 a week from home!!!".to_string(),
            reason: reason.to_string(),
            handled: false,
        }
    }

    #[tokio::test]
    async fn round_trip_preserves_every_field() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir);
        let rec = record(-1001, "promotional link");
        store.append_violation(42, rec.clone()).await.unwrap();
        assert_eq!(store.violations(42).await, vec![rec]);
    }

    #[tokio::test]
    async fn appends_keep_insertion_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir);
        for i in 0..3 {
            store
                .append_violation(42, record(i, &format!("reason {}", i)))
                .await
                .unwrap();
        }
        let got = store.violations(42).await;
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].reason, "reason 0");
        assert_eq!(got[2].reason, "reason 2");
    }

    #[tokio::test]
    async fn histories_are_scoped_per_user() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir);
        store.append_violation(1, record(-1, "a")).await.unwrap();
        assert!(store.violations(2).await.is_empty());
    }

    #[tokio::test]
    async fn corrupt_history_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir);
        store.put(&user_key(9), "not json at all").await.unwrap();
        assert!(store.violations(9).await.is_empty());
    }

    #[test]
    fn display_window_caps_at_the_last_five() {
        let records: Vec<_> = (0..8).map(|i| record(i, "r")).collect();
        let window = display_window(&records);
        assert_eq!(window.len(), 5);
        assert_eq!(window[0].chat_id, 3);
        assert_eq!(window[4].chat_id, 7);

        let short: Vec<_> = (0..2).map(|i| record(i, "r")).collect();
        assert_eq!(display_window(&short).len(), 2);
    }

    #[test]
    fn serialized_form_uses_lowercase_punishment() {
        let encoded = serde_json::to_string(&record(-1, "x")).unwrap();
        assert!(encoded.contains("\"punishment\":\"mute\""));
        assert!(encoded.contains("\"handled\":false"));
    }
}

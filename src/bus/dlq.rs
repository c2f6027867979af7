//! Dead-letter stream: the terminal home for entries whose handlers
//! never succeed within the retry budget (spec.md §4.2, §6 topic
//! `dlq.<original-topic>`).

use super::stream::DurableStream;
use crate::error::CoreResult;
use serde::{Deserialize, Serialize};

/// A dead-lettered entry: the original envelope bytes plus why it died.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub original_topic: String,
    pub entry_id: u64,
    pub payload: serde_json::Value,
    pub failure_reason: String,
    pub retry_count: u32,
}

pub struct DeadLetterQueue {
    stream: DurableStream,
}

impl DeadLetterQueue {
    pub fn for_topic(db: &sled::Db, original_topic: &str) -> CoreResult<Self> {
        let stream = DurableStream::open(db, &format!("dlq.{original_topic}"))?;
        Ok(Self { stream })
    }

    pub fn push(
        &self,
        original_topic: &str,
        entry_id: u64,
        payload: &[u8],
        failure_reason: String,
        retry_count: u32,
    ) -> CoreResult<u64> {
        let payload: serde_json::Value =
            serde_json::from_slice(payload).unwrap_or_else(|_| serde_json::Value::Null);
        let letter = DeadLetter {
            original_topic: original_topic.to_string(),
            entry_id,
            payload,
            failure_reason,
            retry_count,
        };
        let encoded = serde_json::to_vec(&letter)?;
        self.stream.append(encoded)
    }

    pub fn drain(&self, after_id: u64, limit: usize) -> CoreResult<Vec<DeadLetter>> {
        self.stream
            .read_after(after_id, limit)?
            .into_iter()
            .map(|entry| Ok(serde_json::from_slice(&entry.payload)?))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.stream.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stream.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_then_drain_round_trips() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let dlq = DeadLetterQueue::for_topic(&db, "agent-invoke.echo").unwrap();
        dlq.push(
            "agent-invoke.echo",
            42,
            br#"{"hello":"world"}"#,
            "handler panicked".to_string(),
            5,
        )
        .unwrap();

        let letters = dlq.drain(0, 10).unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].original_topic, "agent-invoke.echo");
        assert_eq!(letters[0].retry_count, 5);
        assert_eq!(letters[0].failure_reason, "handler panicked");
    }

    #[test]
    fn empty_queue_reports_empty() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let dlq = DeadLetterQueue::for_topic(&db, "t").unwrap();
        assert!(dlq.is_empty());
    }
}

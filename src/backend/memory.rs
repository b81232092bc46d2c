//! In-memory broker, semantics-faithful to the Redis backend.
//!
//! Used by the test suite and by `--backend memory` for single-node smoke
//! runs where no broker is installed. Lists push at the head and pop at the
//! tail, matching the LPUSH/BRPOP pairing of the Redis implementation.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;

use super::{command_queue, counter_key, Backend, BACKLOG_HASH, INPUT_QUEUES, RETRY_HASH};
use crate::message::{epoch_now, Envelope, Message, MessageIdentifier, QueueTag};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Default)]
struct State {
    lists: HashMap<String, VecDeque<String>>,
    hashes: HashMap<String, HashMap<String, String>>,
    counters: HashMap<String, i64>,
}

#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn encode(msg: &Message) -> Result<String> {
        serde_json::to_string(msg).context("failed to encode message")
    }

    fn lpush(&self, key: &str, payload: String) {
        self.state
            .lock()
            .lists
            .entry(key.to_string())
            .or_default()
            .push_front(payload);
    }

    fn try_pop_input(&self) -> Option<(QueueTag, String)> {
        let mut state = self.state.lock();
        for (queue, tag) in INPUT_QUEUES
            .iter()
            .zip([QueueTag::Local, QueueTag::Remote, QueueTag::Reply])
        {
            if let Some(payload) = state.lists.get_mut(*queue).and_then(VecDeque::pop_back) {
                return Some((tag, payload));
            }
        }
        None
    }

    /// What a local producer's LPUSH onto the local input queue does.
    pub fn queue_local(&self, msg: &Message) -> Result<()> {
        self.lpush(super::QUEUE_LOCAL, Self::encode(msg)?);
        Ok(())
    }

    /// Number of entries currently queued under a list key.
    pub fn list_len(&self, key: &str) -> usize {
        self.state.lock().lists.get(key).map_or(0, VecDeque::len)
    }

    /// Pop the oldest entry of a list, decoded. Test helper mirroring what a
    /// local consumer would BRPOP.
    pub fn take_oldest(&self, key: &str) -> Option<Message> {
        let payload = self.state.lock().lists.get_mut(key)?.pop_back()?;
        serde_json::from_str(&payload).ok()
    }

    /// Number of entries in a hash key (backlog or retry).
    pub fn hash_len(&self, key: &str) -> usize {
        self.state.lock().hashes.get(key).map_or(0, HashMap::len)
    }

    /// Fetch a hash field without removing it.
    pub fn hash_get(&self, key: &str, field: &str) -> Option<Message> {
        let state = self.state.lock();
        let stored = state.hashes.get(key)?.get(field)?;
        serde_json::from_str(stored).ok()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn next(&self, timeout: Duration) -> Result<Option<Envelope>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some((tag, payload)) = self.try_pop_input() {
                let message: Message =
                    serde_json::from_str(&payload).context("couldn't parse queued message")?;
                return Ok(Some(Envelope { tag, message }));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn queue_reply(&self, msg: &Message) -> Result<()> {
        self.lpush(super::QUEUE_REPLY, Self::encode(msg)?);
        Ok(())
    }

    async fn queue_remote(&self, msg: &Message) -> Result<()> {
        self.lpush(super::QUEUE_REMOTE, Self::encode(msg)?);
        Ok(())
    }

    async fn queue_command(&self, msg: &Message) -> Result<()> {
        self.lpush(&command_queue(&msg.command), Self::encode(msg)?);
        Ok(())
    }

    async fn push_processed_message(&self, msg: &Message) -> Result<()> {
        self.lpush(&msg.retqueue, Self::encode(msg)?);
        Ok(())
    }

    async fn increment_id(&self, twin: u32) -> Result<i64> {
        let mut state = self.state.lock();
        let counter = state.counters.entry(counter_key(twin)).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn push_to_backlog(&self, msg: &Message, id: &str) -> Result<()> {
        let payload = Self::encode(msg)?;
        self.state
            .lock()
            .hashes
            .entry(BACKLOG_HASH.to_string())
            .or_default()
            .insert(id.to_string(), payload);
        Ok(())
    }

    async fn pop_message_from_backlog(&self, id: &str) -> Result<Option<Message>> {
        let stored = {
            let mut state = self.state.lock();
            state
                .hashes
                .get_mut(BACKLOG_HASH)
                .and_then(|hash| hash.remove(id))
        };
        match stored {
            Some(stored) => Ok(Some(
                serde_json::from_str(&stored).context("couldn't parse backlog entry")?,
            )),
            None => Ok(None),
        }
    }

    async fn queue_retry(&self, msg: &Message) -> Result<()> {
        let payload = Self::encode(msg)?;
        self.state
            .lock()
            .hashes
            .entry(RETRY_HASH.to_string())
            .or_default()
            .insert(msg.id.clone(), payload);
        Ok(())
    }

    async fn pop_retry_messages(&self, older_than: Duration) -> Result<Vec<Message>> {
        let now = epoch_now();
        let cutoff = older_than.as_secs() as i64;
        let mut state = self.state.lock();
        let Some(hash) = state.hashes.get_mut(RETRY_HASH) else {
            return Ok(Vec::new());
        };

        let mut due = Vec::new();
        hash.retain(|key, value| {
            let msg: Message = match serde_json::from_str(value) {
                Ok(msg) => msg,
                Err(err) => {
                    tracing::error!("skipping malformed retry entry {key}: {err}");
                    return true;
                }
            };
            if now > msg.epoch + cutoff {
                due.push(msg);
                false
            } else {
                true
            }
        });
        Ok(due)
    }

    async fn pop_expired_backlog_messages(&self) -> Result<Vec<Message>> {
        let now = epoch_now();
        let mut state = self.state.lock();
        let Some(hash) = state.hashes.get_mut(BACKLOG_HASH) else {
            return Ok(Vec::new());
        };

        let mut expired = Vec::new();
        hash.retain(|key, value| {
            let mut msg: Message = match serde_json::from_str(value) {
                Ok(msg) => msg,
                Err(err) => {
                    tracing::error!("skipping malformed backlog entry {key}: {err}");
                    return true;
                }
            };
            msg.expiration = msg.effective_expiration();
            if msg.epoch + msg.expiration < now {
                msg.id = key.clone();
                expired.push(msg);
                false
            } else {
                true
            }
        });
        Ok(expired)
    }

    async fn get_message_reply(&self, id: &MessageIdentifier) -> Result<Vec<Message>> {
        let stored = self
            .state
            .lock()
            .lists
            .remove(&id.retqueue)
            .unwrap_or_default();

        let mut replies = Vec::with_capacity(stored.len());
        for value in stored.into_iter().rev() {
            match serde_json::from_str(&value) {
                Ok(msg) => replies.push(msg),
                Err(err) => tracing::error!("skipping malformed reply entry: {err}"),
            }
        }
        Ok(replies)
    }
}

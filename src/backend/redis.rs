//! Redis implementation of the broker interface.
//!
//! Producers LPUSH onto the input lists; we pop the opposite end with a
//! multi-key BRPOP so each queue drains oldest-first while the key order
//! still gives local > remote > reply priority.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::{
    command_queue, counter_key, Backend, BACKLOG_HASH, INPUT_QUEUES, QUEUE_REMOTE, QUEUE_REPLY,
    RETRY_HASH,
};
use crate::message::{epoch_now, Envelope, Message, MessageIdentifier, QueueTag};

pub struct RedisBackend {
    conn: ConnectionManager,
}

impl RedisBackend {
    /// Connect to the broker, e.g. `redis://127.0.0.1:6379`. The connection
    /// manager reconnects on its own, so a broker restart only shows up as
    /// transient errors.
    pub async fn connect(address: &str) -> Result<Self> {
        let client = redis::Client::open(address)
            .with_context(|| format!("invalid redis address {address}"))?;
        let conn = ConnectionManager::new(client)
            .await
            .context("failed to connect to redis")?;
        Ok(Self { conn })
    }

    fn encode(msg: &Message) -> Result<String> {
        serde_json::to_string(msg).context("failed to encode message")
    }

    async fn lpush(&self, key: &str, msg: &Message) -> Result<()> {
        let payload = Self::encode(msg)?;
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .lpush(key, payload)
            .await
            .with_context(|| format!("failed to push onto {key}"))?;
        Ok(())
    }

    fn tag_for(queue: &str) -> Result<QueueTag> {
        match queue {
            super::QUEUE_LOCAL => Ok(QueueTag::Local),
            QUEUE_REMOTE => Ok(QueueTag::Remote),
            QUEUE_REPLY => Ok(QueueTag::Reply),
            other => anyhow::bail!("popped from unexpected queue {other}"),
        }
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn next(&self, timeout: Duration) -> Result<Option<Envelope>> {
        let mut conn = self.conn.clone();
        let popped: Option<(String, String)> = conn
            .brpop(&INPUT_QUEUES[..], timeout.as_secs_f64())
            .await
            .context("failed to get next message")?;

        let Some((queue, payload)) = popped else {
            return Ok(None);
        };

        let message: Message =
            serde_json::from_str(&payload).context("couldn't parse queued message")?;
        Ok(Some(Envelope {
            tag: Self::tag_for(&queue)?,
            message,
        }))
    }

    async fn queue_reply(&self, msg: &Message) -> Result<()> {
        self.lpush(QUEUE_REPLY, msg).await
    }

    async fn queue_remote(&self, msg: &Message) -> Result<()> {
        self.lpush(QUEUE_REMOTE, msg).await
    }

    async fn queue_command(&self, msg: &Message) -> Result<()> {
        self.lpush(&command_queue(&msg.command), msg).await
    }

    async fn push_processed_message(&self, msg: &Message) -> Result<()> {
        self.lpush(&msg.retqueue, msg).await
    }

    async fn increment_id(&self, twin: u32) -> Result<i64> {
        let mut conn = self.conn.clone();
        let count: i64 = conn
            .incr(counter_key(twin), 1)
            .await
            .context("failed to increment destination counter")?;
        Ok(count)
    }

    async fn push_to_backlog(&self, msg: &Message, id: &str) -> Result<()> {
        let payload = Self::encode(msg)?;
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .hset(BACKLOG_HASH, id, payload)
            .await
            .context("failed to record backlog entry")?;
        Ok(())
    }

    async fn pop_message_from_backlog(&self, id: &str) -> Result<Option<Message>> {
        let mut conn = self.conn.clone();
        let stored: Option<String> = conn
            .hget(BACKLOG_HASH, id)
            .await
            .context("failed to fetch backlog entry")?;
        let Some(stored) = stored else {
            return Ok(None);
        };
        let msg: Message =
            serde_json::from_str(&stored).context("couldn't parse backlog entry")?;
        let _: i64 = conn
            .hdel(BACKLOG_HASH, id)
            .await
            .context("failed to remove backlog entry")?;
        Ok(Some(msg))
    }

    async fn queue_retry(&self, msg: &Message) -> Result<()> {
        let payload = Self::encode(msg)?;
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .hset(RETRY_HASH, &msg.id, payload)
            .await
            .context("failed to record retry entry")?;
        Ok(())
    }

    async fn pop_retry_messages(&self, older_than: Duration) -> Result<Vec<Message>> {
        let mut conn = self.conn.clone();
        let entries: std::collections::HashMap<String, String> = conn
            .hgetall(RETRY_HASH)
            .await
            .context("couldn't read retry messages")?;

        let now = epoch_now();
        let cutoff = older_than.as_secs() as i64;
        let mut due = Vec::new();
        for (key, value) in entries {
            let msg: Message = match serde_json::from_str(&value) {
                Ok(msg) => msg,
                Err(err) => {
                    tracing::error!("skipping malformed retry entry {key}: {err}");
                    continue;
                }
            };
            if now > msg.epoch + cutoff {
                let _: i64 = conn
                    .hdel(RETRY_HASH, &key)
                    .await
                    .context("failed to remove retry entry")?;
                due.push(msg);
            }
        }
        Ok(due)
    }

    async fn pop_expired_backlog_messages(&self) -> Result<Vec<Message>> {
        let mut conn = self.conn.clone();
        let entries: std::collections::HashMap<String, String> = conn
            .hgetall(BACKLOG_HASH)
            .await
            .context("couldn't read backlog messages")?;

        let now = epoch_now();
        let mut expired = Vec::new();
        for (key, value) in entries {
            let mut msg: Message = match serde_json::from_str(&value) {
                Ok(msg) => msg,
                Err(err) => {
                    tracing::error!("skipping malformed backlog entry {key}: {err}");
                    continue;
                }
            };
            msg.expiration = msg.effective_expiration();
            if msg.epoch + msg.expiration < now {
                let _: i64 = conn
                    .hdel(BACKLOG_HASH, &key)
                    .await
                    .context("failed to remove expired backlog entry")?;
                msg.id = key;
                expired.push(msg);
            }
        }
        Ok(expired)
    }

    async fn get_message_reply(&self, id: &MessageIdentifier) -> Result<Vec<Message>> {
        let mut conn = self.conn.clone();
        let stored: Vec<String> = conn
            .lrange(&id.retqueue, 0, -1)
            .await
            .context("couldn't read reply queue")?;
        let _: i64 = conn
            .del(&id.retqueue)
            .await
            .context("failed to clear reply queue")?;

        // LPUSH puts the newest reply at the head; hand them back in arrival order
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

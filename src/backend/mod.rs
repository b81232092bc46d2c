//! Queue broker interface.
//!
//! The relay core only ever talks to this trait; the concrete broker behind
//! it is Redis in production and an in-memory table in tests. All in-flight
//! state (backlog, retry, counters) lives in the broker — the process keeps
//! no mirror, so a restart picks up exactly where it left off.

pub mod memory;
pub mod redis;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::message::{Envelope, Message, MessageIdentifier};

/// Input queue fed by local producers.
pub const QUEUE_LOCAL: &str = "msgbus.system.local";
/// Input queue fed by remote peers via `/zbus-remote`.
pub const QUEUE_REMOTE: &str = "msgbus.system.remote";
/// Input queue carrying reply traffic, both inbound and in-transit.
pub const QUEUE_REPLY: &str = "msgbus.system.reply";
/// Hash of in-flight requests, keyed by outbound id.
pub const BACKLOG_HASH: &str = "msgbus.system.backlog";
/// Hash of failed sends awaiting another attempt, keyed by message id.
pub const RETRY_HASH: &str = "msgbus.system.retry";

/// Dispatch priority: local before remote before reply.
pub const INPUT_QUEUES: [&str; 3] = [QUEUE_LOCAL, QUEUE_REMOTE, QUEUE_REPLY];

/// Per-destination counter key backing request id allocation.
pub fn counter_key(twin: u32) -> String {
    format!("msgbus.counter.{twin}")
}

/// Delivery queue local consumers listen on for a given command.
pub fn command_queue(command: &str) -> String {
    format!("msgbus.{command}")
}

/// Typed operations over the queue broker. Every method maps onto a single
/// atomic broker command (or a scan of one hash), so mutual exclusion is the
/// broker's problem, not ours.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Blocking pop across the three input queues, priority per
    /// [`INPUT_QUEUES`], FIFO within a queue. `None` means the timeout
    /// passed with nothing available.
    async fn next(&self, timeout: Duration) -> Result<Option<Envelope>>;

    async fn queue_reply(&self, msg: &Message) -> Result<()>;
    async fn queue_remote(&self, msg: &Message) -> Result<()>;

    /// Hand a remote command to local consumers on `msgbus.<cmd>`.
    async fn queue_command(&self, msg: &Message) -> Result<()>;

    /// Deliver a finished reply (or terminal error) onto `msg.retqueue`.
    async fn push_processed_message(&self, msg: &Message) -> Result<()>;

    /// Atomically allocate the next request counter for a destination.
    async fn increment_id(&self, twin: u32) -> Result<i64>;

    async fn push_to_backlog(&self, msg: &Message, id: &str) -> Result<()>;

    /// Remove and return the backlog entry for `id`; `None` if the id was
    /// never recorded or was already correlated.
    async fn pop_message_from_backlog(&self, id: &str) -> Result<Option<Message>>;

    async fn queue_retry(&self, msg: &Message) -> Result<()>;

    /// Remove and return every retry entry older than `older_than`
    /// (measured against the entry's epoch). Malformed entries are logged
    /// and left alone.
    async fn pop_retry_messages(&self, older_than: Duration) -> Result<Vec<Message>>;

    /// Remove and return every backlog entry past its expiration. Returned
    /// messages carry their backlog key as `id` and a normalized non-zero
    /// expiration.
    async fn pop_expired_backlog_messages(&self) -> Result<Vec<Message>>;

    /// Drain every reply accumulated under a proxy return-queue id.
    async fn get_message_reply(&self, id: &MessageIdentifier) -> Result<Vec<Message>>;
}

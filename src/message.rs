//! Wire message envelope shared by every hop of the bus.
//!
//! The JSON keys are part of the federation protocol and must not change:
//! peers on other nodes and local producers both speak this exact shape.

use serde::{Deserialize, Serialize};

/// Protocol version accepted by every node.
pub const PROTOCOL_VERSION: u32 = 1;

/// Fallback expiration applied when a request carries `exp = 0`.
pub const DEFAULT_EXPIRATION_SECS: i64 = 3600;

/// The single message envelope exchanged on the wire and on broker queues.
///
/// Unknown JSON fields are ignored on decode; absent fields take their zero
/// value, so older peers stay readable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "ver", default)]
    pub version: u32,
    /// Request id, allocated by the sending gateway as `"<dst>.<counter>"`.
    /// Replies echo it verbatim.
    #[serde(rename = "uid", default)]
    pub id: String,
    /// Dotted command name, e.g. `griddb.twins.get`.
    #[serde(rename = "cmd", default)]
    pub command: String,
    /// Seconds the request stays correlatable; 0 means the 1 h default.
    #[serde(rename = "exp", default)]
    pub expiration: i64,
    /// Remaining send attempts.
    #[serde(rename = "try", default)]
    pub retry: u32,
    /// Opaque payload; producers and consumers agree on base64.
    #[serde(rename = "dat", default)]
    pub data: String,
    #[serde(rename = "src", default)]
    pub twin_src: u32,
    /// Destination twins; a reply carries exactly one entry (the original source).
    #[serde(rename = "dst", default)]
    pub twin_dst: Vec<u32>,
    /// Queue the local caller awaits the reply on. Rewritten to the system
    /// reply queue while the request is in flight.
    #[serde(rename = "ret", default)]
    pub retqueue: String,
    #[serde(rename = "shm", default)]
    pub schema: String,
    /// Unix seconds, refreshed by the gateway at every hop.
    #[serde(rename = "now", default)]
    pub epoch: i64,
    /// When set, replies are held for HTTP polling instead of being pushed
    /// onto a local queue.
    #[serde(rename = "pxy", default)]
    pub proxy: bool,
    /// Non-empty means this message conveys a terminal error to the caller.
    #[serde(rename = "err", default)]
    pub err: String,
    /// Hex `typebyte || raw signature`, see the identity module.
    #[serde(rename = "sig", default)]
    pub signature: String,
}

impl Message {
    /// Gate every message entering the pipeline. Mirrors what remote peers
    /// enforce, so a message that validates here is acceptable everywhere.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.version != PROTOCOL_VERSION {
            anyhow::bail!("protocol version mismatch");
        }
        if self.command.is_empty() {
            anyhow::bail!("missing command request");
        }
        if self.twin_dst.is_empty() {
            anyhow::bail!("missing twin destination");
        }
        if self.retqueue.is_empty() {
            anyhow::bail!("return queue not defined");
        }
        Ok(())
    }

    /// Expiration with the zero-value fallback applied.
    pub fn effective_expiration(&self) -> i64 {
        if self.expiration == 0 {
            DEFAULT_EXPIRATION_SECS
        } else {
            self.expiration
        }
    }
}

/// Current wall clock in Unix seconds, the protocol's time base.
pub fn epoch_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Which input queue a message was popped from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueTag {
    Local,
    Remote,
    Reply,
}

/// A parsed message paired with its queue of origin. Produced only by the
/// backend's `next`.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub tag: QueueTag,
    pub message: Message,
}

/// Body of the HTTP result-polling request: names the return queue a proxy
/// caller was handed by `/zbus-cmd`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageIdentifier {
    pub retqueue: String,
}

//! End-to-end relay scenarios over the in-memory broker: request fan-out,
//! reply correlation, retry exhaustion, expiration scrubbing, and the full
//! dispatcher/worker loop.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use twinbus::backend::memory::MemoryBackend;
use twinbus::backend::{Backend, BACKLOG_HASH, QUEUE_REPLY, RETRY_HASH};
use twinbus::identity::{ensure_fresh, verify_message, Identity, KeyType};
use twinbus::message::{epoch_now, Message};
use twinbus::relay::App;
use twinbus::twin::{ResolveError, TwinClient, TwinResolver};

const NODE_SEED: &str = "9d61b19deffd5a60ba844af492ec2cc44449c5697b326919703bac031cae7f60";
const OWN_TWIN: u32 = 1;

// ── Test doubles ─────────────────────────────────────────────────

/// Records everything posted toward one peer; can be told to fail sends.
#[derive(Default)]
struct PeerMock {
    remote: Mutex<Vec<Message>>,
    reply: Mutex<Vec<Message>>,
    fail_sends: AtomicBool,
}

#[async_trait]
impl TwinClient for PeerMock {
    async fn send_remote(&self, msg: &Message) -> anyhow::Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            anyhow::bail!("injected peer outage");
        }
        self.remote.lock().push(msg.clone());
        Ok(())
    }

    async fn send_reply(&self, msg: &Message) -> anyhow::Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            anyhow::bail!("injected peer outage");
        }
        self.reply.lock().push(msg.clone());
        Ok(())
    }
}

/// Directory returning one [`PeerMock`] per twin; lookups for twins in the
/// failing set error like a directory outage would.
#[derive(Default)]
struct DirectoryMock {
    peers: Mutex<HashMap<u32, Arc<PeerMock>>>,
    failing: Mutex<HashSet<u32>>,
}

impl DirectoryMock {
    fn peer(&self, twin: u32) -> Arc<PeerMock> {
        Arc::clone(self.peers.lock().entry(twin).or_default())
    }

    fn fail(&self, twin: u32) {
        self.failing.lock().insert(twin);
    }

    fn recover(&self, twin: u32) {
        self.failing.lock().remove(&twin);
    }
}

#[async_trait]
impl TwinResolver for DirectoryMock {
    async fn resolve(&self, twin: u32) -> Result<Arc<dyn TwinClient>, ResolveError> {
        if self.failing.lock().contains(&twin) {
            return Err(ResolveError::Transport("injected directory outage".into()));
        }
        Ok(self.peer(twin))
    }

    async fn public_key(&self, twin: u32) -> Result<Vec<u8>, ResolveError> {
        Err(ResolveError::NotFound(twin))
    }
}

struct Node {
    app: App,
    backend: Arc<MemoryBackend>,
    directory: Arc<DirectoryMock>,
    identity: Arc<Identity>,
}

fn node() -> Node {
    let backend = Arc::new(MemoryBackend::new());
    let directory = Arc::new(DirectoryMock::default());
    let identity = Arc::new(Identity::from_seed_hex(NODE_SEED, KeyType::Sr25519).unwrap());
    let app = App::new(
        Arc::clone(&backend) as Arc<dyn Backend>,
        Arc::clone(&directory) as Arc<dyn TwinResolver>,
        Arc::clone(&identity),
        OWN_TWIN,
        4,
    );
    Node {
        app,
        backend,
        directory,
        identity,
    }
}

fn request(dst: &[u32], retqueue: &str, retry: u32) -> Message {
    Message {
        version: 1,
        command: "x.get".into(),
        retry,
        data: "ZGF0YQ==".into(),
        twin_dst: dst.to_vec(),
        retqueue: retqueue.into(),
        epoch: epoch_now(),
        ..Message::default()
    }
}

/// Rewind a stored retry entry so the next idle tick considers it due.
async fn age_retry_entry(backend: &MemoryBackend, id: &str) {
    let mut entry = backend.hash_get(RETRY_HASH, id).expect("retry entry");
    entry.epoch = epoch_now() - 6;
    backend.queue_retry(&entry).await.unwrap();
}

// ── S1: happy local→remote round trip ────────────────────────────

#[tokio::test]
async fn local_request_round_trips_through_the_backlog() {
    let n = node();
    let peer = n.directory.peer(2);

    n.app
        .handle_from_local(request(&[2], "cb-abc", 2))
        .await
        .unwrap();

    // the peer saw a rewritten, signed copy
    let sent = peer.remote.lock()[0].clone();
    assert_eq!(sent.id, "2.1");
    assert_eq!(sent.twin_src, OWN_TWIN);
    assert_eq!(sent.twin_dst, vec![2]);
    assert_eq!(sent.retqueue, QUEUE_REPLY);
    ensure_fresh(&sent).unwrap();
    verify_message(&sent, &n.identity.public_key()).unwrap();

    // the backlog holds the caller's original, keyed by the wire id
    let backlog = n.backend.hash_get(BACKLOG_HASH, "2.1").expect("backlog entry");
    assert_eq!(backlog.retqueue, "cb-abc");

    // the peer answers
    let reply = Message {
        version: 1,
        id: "2.1".into(),
        command: "x.get".into(),
        data: "b2s=".into(),
        twin_src: 2,
        twin_dst: vec![OWN_TWIN],
        retqueue: QUEUE_REPLY.into(),
        epoch: epoch_now(),
        ..Message::default()
    };
    n.app.handle_from_reply(reply).await.unwrap();

    // exactly one reply on the caller's queue, return queue restored
    let delivered = n.backend.take_oldest("cb-abc").expect("delivered reply");
    assert_eq!(delivered.data, "b2s=");
    assert_eq!(delivered.retqueue, "cb-abc");
    assert_eq!(n.backend.list_len("cb-abc"), 0);
    assert_eq!(n.backend.hash_len(BACKLOG_HASH), 0);
}

// ── S2: fan-out with one destination failing ─────────────────────

#[tokio::test]
async fn fan_out_keeps_destinations_independent_and_retries_the_failed_one() {
    let n = node();
    n.directory.fail(3);

    n.app
        .handle_from_local(request(&[2, 3], "cb-fan", 2))
        .await
        .unwrap();

    // destination 2 went out and is in the backlog
    assert!(n.backend.hash_get(BACKLOG_HASH, "2.1").is_some());
    assert_eq!(n.backend.hash_len(BACKLOG_HASH), 1);

    // destination 3 is parked for retry with one attempt consumed and the
    // caller's return queue preserved
    let parked = n.backend.hash_get(RETRY_HASH, "3.1").expect("retry entry");
    assert_eq!(parked.retry, 1);
    assert_eq!(parked.retqueue, "cb-fan");

    // directory recovers; the next idle tick promotes the entry
    n.directory.recover(3);
    age_retry_entry(&n.backend, "3.1").await;
    n.app.handle_retry().await.unwrap();

    assert_eq!(n.backend.hash_len(RETRY_HASH), 0);
    // the re-send allocated the next counter value for twin 3
    assert!(n.backend.hash_get(BACKLOG_HASH, "3.2").is_some());
    assert_eq!(n.backend.hash_len(BACKLOG_HASH), 2);

    let sent = n.directory.peer(3).remote.lock()[0].clone();
    assert_eq!(sent.id, "3.2");
    assert_eq!(sent.retqueue, QUEUE_REPLY);
}

// ── S3: no retries left ──────────────────────────────────────────

#[tokio::test]
async fn exhausted_retries_deliver_exactly_one_terminal_error() {
    let n = node();
    n.directory.fail(2);

    n.app
        .handle_from_local(request(&[2], "cb-term", 0))
        .await
        .unwrap();

    let terminal = n.backend.take_oldest("cb-term").expect("terminal error");
    assert!(terminal.err.contains("all retries done"));
    assert_eq!(n.backend.list_len("cb-term"), 0);
    assert_eq!(n.backend.hash_len(BACKLOG_HASH), 0);
    assert_eq!(n.backend.hash_len(RETRY_HASH), 0);
}

#[tokio::test]
async fn a_request_with_k_retries_fails_k_plus_one_times_then_errors_once() {
    let n = node();
    n.directory.peer(2).fail_sends.store(true, Ordering::SeqCst);

    // attempt 1 fails at the POST, one retry remains
    n.app
        .handle_from_local(request(&[2], "cb-retry", 1))
        .await
        .unwrap();
    let parked = n.backend.hash_get(RETRY_HASH, "2.1").expect("retry entry");
    assert_eq!(parked.retry, 0);

    // attempt 2 fails too: retries exhausted, terminal error for the caller
    age_retry_entry(&n.backend, "2.1").await;
    n.app.handle_retry().await.unwrap();

    assert_eq!(n.backend.hash_len(RETRY_HASH), 0);
    assert_eq!(n.backend.hash_len(BACKLOG_HASH), 0);
    let terminal = n.backend.take_oldest("cb-retry").expect("terminal error");
    assert!(terminal.err.contains("all retries done"));
    assert_eq!(n.backend.list_len("cb-retry"), 0);
}

// ── S4: expiration scrubbing ─────────────────────────────────────

#[tokio::test]
async fn expired_backlog_entries_turn_into_timeout_errors() {
    let n = node();
    let mut original = request(&[2], "cb-exp", 2);
    original.expiration = 1;
    original.epoch = epoch_now() - 5;
    n.backend.push_to_backlog(&original, "2.9").await.unwrap();

    n.app.handle_scrubbing().await.unwrap();

    let timeout = n.backend.take_oldest("cb-exp").expect("timeout error");
    assert_eq!(timeout.err, "request timeout (expiration reached, 1)");
    assert_eq!(n.backend.hash_len(BACKLOG_HASH), 0);
    assert_eq!(n.backend.list_len("cb-exp"), 0);
}

// ── Reply routing ────────────────────────────────────────────────

#[tokio::test]
async fn locally_produced_replies_are_resigned_and_forwarded_to_the_source() {
    let n = node();
    let reply = Message {
        version: 1,
        id: "1.4".into(),
        command: "x.get".into(),
        data: "b2s=".into(),
        twin_src: OWN_TWIN,
        twin_dst: vec![2],
        retqueue: QUEUE_REPLY.into(),
        epoch: epoch_now() - 15, // stale stamp from the consumer
        ..Message::default()
    };
    n.app.handle_from_reply(reply).await.unwrap();

    let forwarded = n.directory.peer(2).reply.lock()[0].clone();
    ensure_fresh(&forwarded).unwrap();
    verify_message(&forwarded, &n.identity.public_key()).unwrap();
}

#[tokio::test]
async fn proxy_replies_go_to_the_parking_queue_untouched() {
    let n = node();
    let retqueue = "0c46a4f6-b52a-4d3e-9427-d614c2587a21";
    let reply = Message {
        version: 1,
        id: "1.4".into(),
        command: "x.get".into(),
        twin_src: OWN_TWIN,
        twin_dst: vec![2],
        retqueue: retqueue.into(),
        proxy: true,
        epoch: epoch_now(),
        ..Message::default()
    };
    n.app.handle_from_reply(reply).await.unwrap();
    assert_eq!(n.backend.list_len(retqueue), 1);
}

#[tokio::test]
async fn replies_without_a_backlog_entry_are_dropped_with_an_error() {
    let n = node();
    let reply = Message {
        version: 1,
        id: "2.99".into(),
        command: "x.get".into(),
        twin_src: 2,
        twin_dst: vec![OWN_TWIN],
        retqueue: QUEUE_REPLY.into(),
        epoch: epoch_now(),
        ..Message::default()
    };
    let err = n.app.handle_from_reply(reply).await.unwrap_err();
    assert!(err.to_string().contains("couldn't find key 2.99"));
}

#[tokio::test]
async fn duplicate_replies_for_a_correlated_id_are_dropped() {
    let n = node();
    n.app
        .handle_from_local(request(&[2], "cb-dup", 2))
        .await
        .unwrap();

    let reply = Message {
        version: 1,
        id: "2.1".into(),
        command: "x.get".into(),
        twin_src: 2,
        twin_dst: vec![OWN_TWIN],
        retqueue: QUEUE_REPLY.into(),
        epoch: epoch_now(),
        ..Message::default()
    };
    n.app.handle_from_reply(reply.clone()).await.unwrap();
    // the peer retransmits after we already correlated
    assert!(n.app.handle_from_reply(reply).await.is_err());
    assert_eq!(n.backend.list_len("cb-dup"), 1);
}

#[tokio::test]
async fn replies_that_concern_neither_side_of_this_node_are_ignored() {
    let n = node();
    let reply = Message {
        version: 1,
        id: "7.3".into(),
        command: "x.get".into(),
        twin_src: 5,
        twin_dst: vec![7],
        retqueue: QUEUE_REPLY.into(),
        epoch: epoch_now(),
        ..Message::default()
    };
    n.app.handle_from_reply(reply).await.unwrap();
    assert!(n.directory.peer(7).reply.lock().is_empty());
}

// ── Remote commands ──────────────────────────────────────────────

#[tokio::test]
async fn remote_commands_land_on_the_per_command_queue_verbatim() {
    let n = node();
    let msg = Message {
        version: 1,
        id: "1.12".into(),
        command: "griddb.twins.get".into(),
        data: "Mg==".into(),
        twin_src: 2,
        twin_dst: vec![OWN_TWIN],
        retqueue: QUEUE_REPLY.into(),
        epoch: epoch_now(),
        ..Message::default()
    };
    n.app.handle_from_remote(msg.clone()).await.unwrap();

    let delivered = n.backend.take_oldest("msgbus.griddb.twins.get").unwrap();
    assert_eq!(delivered, msg);
}

// ── Id allocation ────────────────────────────────────────────────

#[tokio::test]
async fn wire_ids_count_up_per_destination() {
    let n = node();
    for _ in 0..3 {
        n.app
            .handle_from_local(request(&[2], "cb-seq", 0))
            .await
            .unwrap();
    }
    n.app
        .handle_from_local(request(&[5], "cb-seq", 0))
        .await
        .unwrap();

    let ids: Vec<String> = n
        .directory
        .peer(2)
        .remote
        .lock()
        .iter()
        .map(|m| m.id.clone())
        .collect();
    assert_eq!(ids, ["2.1", "2.2", "2.3"]);
    assert_eq!(n.directory.peer(5).remote.lock()[0].id, "5.1");
}

// ── Full loop through the dispatcher and workers ─────────────────

async fn wait_until(mut probe: impl FnMut() -> bool) {
    for _ in 0..100 {
        if probe() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached within 2s");
}

#[tokio::test]
async fn serve_drains_the_local_queue_and_reports_invalid_messages() {
    let n = node();
    let backend = Arc::clone(&n.backend);
    let directory = Arc::clone(&n.directory);
    let cancel = CancellationToken::new();

    backend.queue_local(&request(&[2], "cb-live", 2)).unwrap();
    let mut invalid = request(&[2], "cb-bad", 2);
    invalid.version = 9;
    backend.queue_local(&invalid).unwrap();

    let server = tokio::spawn(
        Arc::new(n.app).serve("127.0.0.1:0".parse().unwrap(), cancel.clone()),
    );

    wait_until(|| !directory.peer(2).remote.lock().is_empty()).await;
    wait_until(|| backend.list_len("cb-bad") == 1).await;

    let rejected = backend.take_oldest("cb-bad").unwrap();
    assert!(rejected.err.contains("version mismatch"));

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(15), server)
        .await
        .expect("serve did not stop after cancellation")
        .unwrap()
        .unwrap();
}

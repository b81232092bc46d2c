//! Message pipelines: local requests fanning out to peers, remote commands
//! landing on consumer queues, and the three reply modes.

use anyhow::Result;

use super::{App, RETRY_QUANTUM};
use crate::backend::QUEUE_REPLY;
use crate::message::{epoch_now, Message};

impl App {
    /// A locally-originated request: fan out over its destinations. Each
    /// destination is handled independently — one peer being down must not
    /// abort the others or undo their backlog entries.
    pub async fn handle_from_local(&self, mut msg: Message) -> Result<()> {
        if msg.epoch == 0 {
            msg.epoch = epoch_now();
        }
        for dst in msg.twin_dst.clone() {
            if let Err(err) = self.send_to_destination(&msg, dst).await {
                tracing::error!("failed to send to twin {dst}: {err:#}");
            }
        }
        Ok(())
    }

    /// Send one copy of `original` toward `dst`: allocate the wire id, sign
    /// the rewritten copy, post it, then record the original in the backlog
    /// so the caller's return queue can be restored when the reply arrives.
    pub(crate) async fn send_to_destination(&self, original: &Message, dst: u32) -> Result<()> {
        let mut update = original.clone();
        update.twin_src = self.twin;
        update.twin_dst = vec![dst];

        let counter = self.backend.increment_id(dst).await?;
        update.id = format!("{dst}.{counter}");
        update.retqueue = QUEUE_REPLY.to_string();

        let client = match self.resolver.resolve(dst).await {
            Ok(client) => client,
            Err(err) => {
                let cause = anyhow::anyhow!("couldn't resolve twin {dst}: {err}");
                self.bookkeep_failed_send(original, update, &cause).await?;
                return Err(cause);
            }
        };

        update.epoch = epoch_now();
        self.identity.sign_message(&mut update);

        if let Err(cause) = client.send_remote(&update).await {
            self.bookkeep_failed_send(original, update, &cause).await?;
            return Err(cause);
        }

        self.backend.push_to_backlog(original, &update.id).await
    }

    /// Failed send: either schedule another attempt or tell the caller it's
    /// over. The update is restored to the caller's return queue first so
    /// both outcomes land where the caller is listening.
    async fn bookkeep_failed_send(
        &self,
        original: &Message,
        mut update: Message,
        cause: &anyhow::Error,
    ) -> Result<()> {
        tracing::info!("could not send message to remote peer: {cause:#}");
        update.retqueue = original.retqueue.clone();

        if update.retry == 0 {
            tracing::info!("no more retries for {}, replying with error", update.id);
            update.err = format!("could not send request and all retries done: {cause}");
            return self.backend.push_processed_message(&update).await;
        }

        tracing::info!(retry = update.retry, "adding {} to the retry list", update.id);
        update.retry -= 1;
        update.epoch = epoch_now();
        self.backend.queue_retry(&update).await
    }

    /// A command from a remote peer: hand it to local consumers verbatim.
    pub async fn handle_from_remote(&self, msg: Message) -> Result<()> {
        tracing::info!("forwarding to local service msgbus.{}", msg.command);
        self.backend.queue_command(&msg).await
    }

    /// Reply traffic. Three mutually exclusive cases, in order: a proxy
    /// reply held for HTTP polling, a reply to one of our own requests, or
    /// a locally-produced reply on its way back to the requesting peer.
    pub async fn handle_from_reply(&self, mut msg: Message) -> Result<()> {
        if msg.proxy {
            return self.backend.push_processed_message(&msg).await;
        }

        if msg.twin_dst.first() == Some(&self.twin) {
            let Some(original) = self.backend.pop_message_from_backlog(&msg.id).await? else {
                anyhow::bail!("couldn't find key {}", msg.id);
            };
            msg.retqueue = original.retqueue;
            return self.backend.push_processed_message(&msg).await;
        }

        if msg.twin_src == self.twin {
            let Some(&dst) = msg.twin_dst.first() else {
                anyhow::bail!("reply {} has no destination", msg.id);
            };
            let client = self
                .resolver
                .resolve(dst)
                .await
                .map_err(|err| anyhow::anyhow!("couldn't resolve twin {dst}: {err}"))?;
            msg.epoch = epoch_now();
            self.identity.sign_message(&mut msg);
            return client.send_reply(&msg).await;
        }

        tracing::debug!("dropping reply {} not addressed through this node", msg.id);
        Ok(())
    }

    /// Idle-tick sweep: promote retry entries old enough back into the send
    /// path. A promoted message carries its original return queue, so it
    /// goes through exactly the same path as a fresh local request.
    pub async fn handle_retry(&self) -> Result<()> {
        let due = self.backend.pop_retry_messages(RETRY_QUANTUM).await?;
        for msg in due {
            let Some(&dst) = msg.twin_dst.first() else {
                tracing::warn!("retry entry {} has no destination, dropping", msg.id);
                continue;
            };
            tracing::info!("retrying message {} toward twin {dst}", msg.id);
            if let Err(err) = self.send_to_destination(&msg, dst).await {
                tracing::error!("retry toward twin {dst} failed: {err:#}");
            }
        }
        Ok(())
    }

    /// Idle-tick sweep: evict expired backlog entries and tell their
    /// callers the request timed out.
    pub async fn handle_scrubbing(&self) -> Result<()> {
        let expired = self.backend.pop_expired_backlog_messages().await?;
        for mut msg in expired {
            tracing::debug!("request {} expired", msg.id);
            msg.err = format!("request timeout (expiration reached, {})", msg.expiration);
            if let Err(err) = self.backend.push_processed_message(&msg).await {
                tracing::error!("failed to deliver expiration error for {}: {err:#}", msg.id);
            }
        }
        Ok(())
    }

    /// A message that failed validation never reaches a worker; if it names
    /// a return queue the caller gets the validation error, otherwise it is
    /// dropped with a warning.
    pub(crate) async fn reject_invalid(&self, mut msg: Message, cause: &anyhow::Error) {
        if msg.retqueue.is_empty() {
            tracing::warn!("dropping invalid message without return queue: {cause:#}");
            return;
        }
        msg.err = format!("couldn't validate input: {cause}");
        if let Err(err) = self.backend.push_processed_message(&msg).await {
            tracing::error!("failed to report validation error: {err:#}");
        }
    }
}

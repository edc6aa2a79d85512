// ── Mnemo Engine: Change Channel ────────────────────────────────────────────
//
// Pub/sub for working-set membership events (`added` / `evicted` /
// `cleared`). One named channel per robot group; members publish on write
// and react to incoming events by syncing the affected robot.
//
// Architecture: an in-process bus over tokio broadcast channels. In a
// multi-process deployment this would be replaced by a database notify
// primitive or an external queue; payloads are already small JSON blobs so
// only the transport would change.
//
// Delivery: each subscription runs one long-lived task that decodes payloads
// and invokes its callback sequentially — callbacks must not block. Malformed
// payloads are dropped with a warning. Slow subscribers lag past the channel
// capacity and lose oldest events (the sync protocol is idempotent, so a
// lost event degrades to a later full sync).

use crate::atoms::constants::{CHANNEL_CAPACITY, CHANNEL_PREFIX};
use crate::atoms::error::EngineResult;
use crate::atoms::types::ChangeEvent;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Callback invoked for every decoded event on a subscription.
pub type ChangeCallback = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

/// In-process change-event bus, keyed by sanitized channel name.
#[derive(Default)]
pub struct ChangeBus {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

/// Live subscription. Dropping (or `shutdown`) stops the delivery task.
pub struct Subscription {
    channel: String,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Stop the delivery loop now.
    pub fn shutdown(self) {
        // Drop runs the abort.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Channel names come from user-supplied group names; replace anything that
/// is not an identifier character and prefix, the way one would for a
/// database channel identifier.
pub fn sanitize_channel(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    format!("{CHANNEL_PREFIX}{cleaned}")
}

impl ChangeBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self.channels.lock();
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Publish an event to a (raw) channel name. Publishing to a channel
    /// with no subscribers is a no-op.
    pub fn publish(&self, channel: &str, event: &ChangeEvent) -> EngineResult<()> {
        let name = sanitize_channel(channel);
        let payload = serde_json::to_string(event)?;
        let sender = self.sender(&name);
        match sender.send(payload) {
            Ok(n) => debug!("[change-bus] {name}: delivered to {n} subscriber(s)"),
            Err(_) => debug!("[change-bus] {name}: no subscribers"),
        }
        Ok(())
    }

    /// Register a callback on a (raw) channel name. The returned handle owns
    /// the delivery task.
    pub fn subscribe(&self, channel: &str, callback: ChangeCallback) -> Subscription {
        let name = sanitize_channel(channel);
        let mut rx = self.sender(&name).subscribe();
        let task_name = name.clone();

        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => match serde_json::from_str::<ChangeEvent>(&payload) {
                        Ok(event) => callback(event),
                        Err(e) => {
                            warn!("[change-bus] {task_name}: dropping malformed payload: {e}");
                        }
                    },
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("[change-bus] {task_name}: subscriber lagged, {missed} events lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Subscription { channel: name, task }
    }

    /// Number of live subscribers on a channel (post-sanitization).
    pub fn subscriber_count(&self, channel: &str) -> usize {
        let name = sanitize_channel(channel);
        self.channels.lock().get(&name).map_or(0, |s| s.receiver_count())
    }

    /// Inject a raw payload, bypassing serialization. Test hook for the
    /// malformed-payload path.
    #[cfg(test)]
    pub(crate) fn publish_raw(&self, channel: &str, payload: &str) {
        let name = sanitize_channel(channel);
        let _ = self.sender(&name).send(payload.to_string());
    }
}

//! MessageBus - channel-based messaging between agents.
//!
//! Agents subscribe to named channels and receive messages through an
//! in-process inbox (`connect`) or an attached `RealtimeTransport`. The
//! transport is tried first; the inbox is the fallback. Failed deliveries
//! are retried in the background with exponential backoff and end up in the
//! dead-letter store once retries run out.

pub mod message;

pub use message::{
    BusStats, DeadLetter, DeliveryMode, Message, MessageId, PublishOptions, PublishReceipt,
    Priority, SYSTEM_SENDER,
};

use crate::agent::AgentId;
use crate::config::BusConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Push delivery to a connected agent, e.g. a websocket.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn send(&self, message: &Message) -> Result<()>;
}

/// Where an agent can currently be reached.
#[derive(Clone, Default)]
struct Endpoint {
    transport: Option<Arc<dyn RealtimeTransport>>,
    inbox: Option<mpsc::UnboundedSender<Message>>,
}

#[derive(Default)]
struct BusState {
    /// channel -> subscribers in subscription order
    subscriptions: HashMap<String, Vec<AgentId>>,
    inboxes: HashMap<AgentId, mpsc::UnboundedSender<Message>>,
    transports: HashMap<AgentId, Arc<dyn RealtimeTransport>>,
    messages: HashMap<MessageId, Message>,
    queues: HashMap<String, VecDeque<MessageId>>,
    /// message -> agents still unreached
    pending: HashMap<MessageId, Vec<AgentId>>,
    dead_letters: Vec<DeadLetter>,
    anycast_cursor: HashMap<String, usize>,
    /// response channel -> requester waiting on it
    waiters: HashMap<String, oneshot::Sender<Message>>,
    stats: BusStats,
}

impl BusState {
    fn endpoint(&self, agent: &AgentId) -> Endpoint {
        Endpoint {
            transport: self.transports.get(agent).cloned(),
            inbox: self.inboxes.get(agent).cloned(),
        }
    }

    fn resolve_targets(&mut self, message: &Message) -> Vec<AgentId> {
        let subscribers = self
            .subscriptions
            .get(&message.channel)
            .cloned()
            .unwrap_or_default();
        match message.delivery_mode {
            DeliveryMode::Broadcast => subscribers,
            DeliveryMode::Direct => match &message.target_agent {
                Some(target) => vec![target.clone()],
                None => {
                    warn!(channel = %message.channel, "Direct message without a target");
                    Vec::new()
                }
            },
            DeliveryMode::Anycast => {
                if subscribers.is_empty() {
                    return Vec::new();
                }
                let cursor = self.anycast_cursor.entry(message.channel.clone()).or_insert(0);
                let chosen = subscribers[*cursor % subscribers.len()].clone();
                *cursor = cursor.wrapping_add(1);
                vec![chosen]
            }
        }
    }

    /// Keep the message in the store and its channel queue.
    fn remember(&mut self, message: &Message, history: usize) {
        self.messages.insert(message.id, message.clone());
        let queue = self.queues.entry(message.channel.clone()).or_default();
        queue.push_back(message.id);
        while queue.len() > history {
            if let Some(old) = queue.pop_front() {
                if !self.pending.contains_key(&old) {
                    self.messages.remove(&old);
                }
            }
        }
    }

    fn dead_letter(&mut self, message: Message, unreached: Vec<AgentId>, reason: String) {
        warn!(
            message = %message.id,
            channel = %message.channel,
            unreached = unreached.len(),
            "{}",
            reason
        );
        self.stats.dead_letters += 1;
        self.dead_letters.push(DeadLetter {
            message,
            unreached,
            reason,
            timestamp: Utc::now(),
        });
    }
}

/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct MessageBus {
    state: Arc<Mutex<BusState>>,
    config: BusConfig,
    shutdown: CancellationToken,
}

impl MessageBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState::default())),
            config,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    // ========== Subscriptions ==========

    pub async fn subscribe(&self, agent: &AgentId, channel: &str) {
        let mut state = self.state.lock().await;
        let subscribers = state.subscriptions.entry(channel.to_string()).or_default();
        if !subscribers.contains(agent) {
            subscribers.push(agent.clone());
            debug!(%agent, channel, "Subscribed");
        }
    }

    /// Returns true if the agent was subscribed.
    pub async fn unsubscribe(&self, agent: &AgentId, channel: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some(subscribers) = state.subscriptions.get_mut(channel) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|a| a != agent);
        let removed = subscribers.len() != before;
        if subscribers.is_empty() {
            state.subscriptions.remove(channel);
        }
        removed
    }

    pub async fn subscribers(&self, channel: &str) -> Vec<AgentId> {
        self.state
            .lock()
            .await
            .subscriptions
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    // ========== Connections ==========

    /// Open an in-process inbox for the agent, replacing any previous one.
    pub async fn connect(&self, agent: &AgentId) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().await.inboxes.insert(agent.clone(), tx);
        debug!(%agent, "Agent connected");
        rx
    }

    pub async fn attach_transport(&self, agent: &AgentId, transport: Arc<dyn RealtimeTransport>) {
        self.state
            .lock()
            .await
            .transports
            .insert(agent.clone(), transport);
    }

    /// Drop the agent's inbox and transport. Subscriptions are kept.
    pub async fn disconnect(&self, agent: &AgentId) -> bool {
        let mut state = self.state.lock().await;
        let inbox = state.inboxes.remove(agent).is_some();
        let transport = state.transports.remove(agent).is_some();
        inbox || transport
    }

    // ========== Publishing ==========

    /// Publish on a channel. Delivery problems show up in the receipt, the
    /// dead-letter store and the stats; they are never returned as errors.
    pub async fn publish(&self, channel: &str, data: serde_json::Value, options: PublishOptions) -> PublishReceipt {
        let message = Message::new(channel, data, options, self.config.default_ttl_ms);
        self.dispatch(message).await
    }

    pub async fn send_direct(
        &self,
        channel: &str,
        from: &AgentId,
        to: &AgentId,
        data: serde_json::Value,
    ) -> PublishReceipt {
        let options = PublishOptions::direct(to.clone()).from_sender(from.clone());
        self.publish(channel, data, options).await
    }

    /// Send a direct request and wait for the single response.
    ///
    /// # Errors
    /// `Error::Timeout` when no response arrives in time, `Error::InvalidState`
    /// when the bus shuts down while waiting.
    pub async fn send_request(
        &self,
        channel: &str,
        from: &AgentId,
        to: &AgentId,
        data: serde_json::Value,
        timeout: Duration,
    ) -> Result<Message> {
        let options = PublishOptions::direct(to.clone()).from_sender(from.clone());
        let message = Message::new(channel, data, options, self.config.default_ttl_ms);
        let response_channel = message.response_channel();

        let (tx, rx) = oneshot::channel();
        self.state
            .lock()
            .await
            .waiters
            .insert(response_channel.clone(), tx);
        self.dispatch(message).await;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::InvalidState("message bus shut down".to_string())),
            Err(_) => {
                self.state.lock().await.waiters.remove(&response_channel);
                Err(Error::Timeout(timeout))
            }
        }
    }

    /// Answer a request received through `send_request`.
    pub async fn send_response(&self, request: &Message, from: &AgentId, data: serde_json::Value) -> PublishReceipt {
        let options = PublishOptions::direct(request.sender.clone()).from_sender(from.clone());
        self.publish(&request.response_channel(), data, options).await
    }

    async fn dispatch(&self, message: Message) -> PublishReceipt {
        let mut receipt = PublishReceipt {
            message_id: Some(message.id),
            ..Default::default()
        };
        if self.shutdown.is_cancelled() {
            warn!(channel = %message.channel, "Publish after shutdown dropped");
            return receipt;
        }

        let targets = {
            let mut state = self.state.lock().await;
            state.stats.published += 1;

            if let Some(waiter) = state.waiters.remove(&message.channel) {
                let requester = message.target_agent.clone();
                if waiter.send(message).is_ok() {
                    state.stats.delivered += 1;
                    receipt.delivered_to.extend(requester);
                }
                return receipt;
            }

            let targets = state.resolve_targets(&message);
            state.remember(&message, self.config.channel_history);
            targets
                .into_iter()
                .map(|agent| {
                    let endpoint = state.endpoint(&agent);
                    (agent, endpoint)
                })
                .collect::<Vec<_>>()
        };

        if targets.is_empty() {
            trace!(channel = %message.channel, "No recipients");
            return receipt;
        }

        if message.is_expired() {
            let mut state = self.state.lock().await;
            state.stats.expired += 1;
            receipt.failed = targets.into_iter().map(|(agent, _)| agent).collect();
            return receipt;
        }

        let mut unreached = Vec::new();
        for (agent, endpoint) in targets {
            if deliver(&endpoint, &message).await {
                receipt.delivered_to.push(agent);
            } else {
                unreached.push(agent);
            }
        }

        let mut state = self.state.lock().await;
        state.stats.delivered += receipt.delivered_to.len() as u64;
        state.stats.failed_deliveries += unreached.len() as u64;
        if unreached.is_empty() {
            return receipt;
        }

        if self.config.max_retries == 0 {
            receipt.failed = unreached.clone();
            state.dead_letter(message, unreached, "delivery failed".to_string());
        } else {
            receipt.queued_for = unreached.clone();
            state.pending.insert(message.id, unreached);
            drop(state);
            let bus = self.clone();
            tokio::spawn(async move { bus.retry(message).await });
        }
        receipt
    }

    async fn retry(&self, mut message: Message) {
        let max_retries = self.config.max_retries;
        for attempt in 1..=max_retries {
            let delay = backoff(self.config.retry_base_delay(), attempt);
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let targets = {
                let mut state = self.state.lock().await;
                let Some(unreached) = state.pending.get(&message.id).cloned() else {
                    // purged
                    return;
                };
                if message.is_expired() {
                    state.pending.remove(&message.id);
                    state.stats.expired += 1;
                    debug!(message = %message.id, "Expired before redelivery");
                    return;
                }
                state.stats.retries += 1;
                unreached
                    .into_iter()
                    .map(|agent| {
                        let endpoint = state.endpoint(&agent);
                        (agent, endpoint)
                    })
                    .collect::<Vec<_>>()
            };

            message.retry_count = attempt;
            let mut still_unreached = Vec::new();
            let mut delivered = 0u64;
            for (agent, endpoint) in targets {
                if deliver(&endpoint, &message).await {
                    delivered += 1;
                } else {
                    still_unreached.push(agent);
                }
            }

            let mut state = self.state.lock().await;
            state.stats.delivered += delivered;
            state.stats.failed_deliveries += still_unreached.len() as u64;
            if still_unreached.is_empty() {
                state.pending.remove(&message.id);
                debug!(message = %message.id, attempt, "Delivered on retry");
                return;
            }
            match state.pending.get_mut(&message.id) {
                Some(unreached) => *unreached = still_unreached,
                None => return,
            }
        }

        let mut state = self.state.lock().await;
        if let Some(unreached) = state.pending.remove(&message.id) {
            let reason = format!("undelivered after {} retries", max_retries);
            state.dead_letter(message, unreached, reason);
        }
    }

    // ========== Maintenance ==========

    /// Drop expired messages from the store, the channel queues and the
    /// retry set. Returns how many messages were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let expired: Vec<MessageId> = state
            .messages
            .values()
            .filter(|m| m.is_expired_at(now))
            .map(|m| m.id)
            .collect();
        if expired.is_empty() {
            return 0;
        }

        for id in &expired {
            state.messages.remove(id);
            state.pending.remove(id);
        }
        for queue in state.queues.values_mut() {
            queue.retain(|id| !expired.contains(id));
        }
        state.queues.retain(|_, q| !q.is_empty());
        state.stats.expired += expired.len() as u64;
        debug!(count = expired.len(), "Purged expired messages");
        expired.len()
    }

    /// Run `purge_expired` every `sweep_interval` until shutdown.
    pub fn start_sweeper(&self) -> JoinHandle<()> {
        let bus = self.clone();
        let cancel = self.shutdown.child_token();
        let period = self.config.sweep_interval().max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Bus sweeper cancelled");
                        break;
                    }
                    _ = interval.tick() => {
                        bus.purge_expired().await;
                    }
                }
            }
        })
    }

    /// Stop the sweeper and retries, close inboxes and fail pending requests.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut state = self.state.lock().await;
        state.waiters.clear();
        state.inboxes.clear();
        state.transports.clear();
        info!(pending = state.pending.len(), "Message bus shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    // ========== Inspection ==========

    /// Messages awaiting a retry.
    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead_letters.clone()
    }

    /// Unexpired messages retained for a channel, oldest first.
    pub async fn history(&self, channel: &str) -> Vec<Message> {
        let now = Utc::now();
        let state = self.state.lock().await;
        state
            .queues
            .get(channel)
            .map(|queue| {
                queue
                    .iter()
                    .filter_map(|id| state.messages.get(id))
                    .filter(|m| !m.is_expired_at(now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn stats(&self) -> BusStats {
        let state = self.state.lock().await;
        BusStats {
            channels: state.subscriptions.len(),
            subscriptions: state.subscriptions.values().map(Vec::len).sum(),
            connected_agents: state.inboxes.len().max(state.transports.len()),
            pending_retries: state.pending.len(),
            ..state.stats.clone()
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

/// Transport first, then the inbox.
async fn deliver(endpoint: &Endpoint, message: &Message) -> bool {
    if let Some(transport) = &endpoint.transport {
        match transport.send(message).await {
            Ok(()) => return true,
            Err(e) => debug!(message = %message.id, error = %e, "Transport delivery failed"),
        }
    }
    match &endpoint.inbox {
        Some(inbox) => inbox.send(message.clone()).is_ok(),
        None => false,
    }
}

/// `base * 2^(attempt - 1)`
fn backoff(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent)
}

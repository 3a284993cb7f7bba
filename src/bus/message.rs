//! Bus message types.

use crate::agent::AgentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sender used when a publisher does not name itself.
pub const SYSTEM_SENDER: &str = "mesh";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Every subscriber of the channel.
    #[default]
    Broadcast,
    /// Only `target_agent`.
    Direct,
    /// Exactly one subscriber, chosen round-robin.
    Anycast,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub channel: String,
    pub data: serde_json::Value,
    pub sender: AgentId,
    pub timestamp: DateTime<Utc>,
    pub ttl_ms: u64,
    pub priority: Priority,
    pub delivery_mode: DeliveryMode,
    #[serde(default)]
    pub target_agent: Option<AgentId>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub require_ack: bool,
}

impl Message {
    pub fn new(channel: &str, data: serde_json::Value, options: PublishOptions, default_ttl_ms: u64) -> Self {
        Self {
            id: MessageId::new(),
            channel: channel.to_string(),
            data,
            sender: options.sender.unwrap_or_else(|| AgentId::from(SYSTEM_SENDER)),
            timestamp: Utc::now(),
            ttl_ms: options.ttl_ms.unwrap_or(default_ttl_ms),
            priority: options.priority,
            delivery_mode: options.delivery_mode,
            target_agent: options.target_agent,
            retry_count: 0,
            require_ack: options.require_ack,
        }
    }

    /// A TTL past the representable range never expires.
    pub fn expires_at(&self) -> DateTime<Utc> {
        i64::try_from(self.ttl_ms)
            .ok()
            .and_then(chrono::Duration::try_milliseconds)
            .and_then(|ttl| self.timestamp.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Expired once `now > timestamp + ttl`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at()
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Channel a response to this message is published on.
    pub fn response_channel(&self) -> String {
        response_channel(&self.channel, &self.id)
    }
}

pub fn response_channel(channel: &str, id: &MessageId) -> String {
    format!("{}:response:{}", channel, id)
}

/// Per-publish settings. Unset fields take the bus defaults.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub sender: Option<AgentId>,
    pub ttl_ms: Option<u64>,
    pub priority: Priority,
    pub delivery_mode: DeliveryMode,
    pub target_agent: Option<AgentId>,
    pub require_ack: bool,
}

impl PublishOptions {
    pub fn broadcast() -> Self {
        Self::default()
    }

    pub fn direct(target: AgentId) -> Self {
        Self {
            delivery_mode: DeliveryMode::Direct,
            target_agent: Some(target),
            ..Default::default()
        }
    }

    pub fn anycast() -> Self {
        Self {
            delivery_mode: DeliveryMode::Anycast,
            ..Default::default()
        }
    }

    pub fn from_sender(mut self, sender: AgentId) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = Some(ttl_ms);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn require_ack(mut self) -> Self {
        self.require_ack = true;
        self
    }
}

/// Outcome of one publish.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub message_id: Option<MessageId>,
    pub delivered_to: Vec<AgentId>,
    /// Agents whose delivery failed and will be retried.
    pub queued_for: Vec<AgentId>,
    /// Agents that will never receive the message.
    pub failed: Vec<AgentId>,
}

impl PublishReceipt {
    /// No recipient was targeted at all.
    pub fn is_empty(&self) -> bool {
        self.delivered_to.is_empty() && self.queued_for.is_empty() && self.failed.is_empty()
    }
}

/// A message that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message: Message,
    pub unreached: Vec<AgentId>,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub failed_deliveries: u64,
    pub retries: u64,
    pub dead_letters: u64,
    pub expired: u64,
    pub channels: usize,
    pub subscriptions: usize,
    pub connected_agents: usize,
    pub pending_retries: usize,
}

// Copyright (c) 2026 Safety Governor contributors
// SPDX-License-Identifier: Apache-2.0
//! Inter-agent message records.
//!
//! A [`Message`] is immutable once constructed: the communication manager
//! and the retained history only ever hold clones, never mutate one in
//! place. Delivery outcomes are tracked separately as [`MessageAck`]s.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use crate::domain::agent::AgentId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
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
        self.0.fmt(f)
    }
}

/// Routing category of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// To every registered agent except the sender.
    Broadcast,
    /// To one or more explicitly named agents.
    Private,
    /// To the members of a named group.
    Group,
    System,
    Negotiation,
    Observation,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Broadcast => "broadcast",
            MessageType::Private => "private",
            MessageType::Group => "group",
            MessageType::System => "system",
            MessageType::Negotiation => "negotiation",
            MessageType::Observation => "observation",
        }
    }
}

/// Advisory priority. Exposed on the message but gives no scheduling
/// guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low,
    Normal,
    High,
    Urgent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender: AgentId,
    /// Resolved at send time. A broadcast snapshot is not updated if the
    /// registry changes afterwards.
    pub recipients: Vec<AgentId>,
    pub message_type: MessageType,
    pub content: Value,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub timestamp: DateTime<Utc>,
    pub priority: MessagePriority,
    pub requires_ack: bool,
    /// Back-reference to a prior message id, lookup only.
    pub reply_to: Option<MessageId>,
}

/// Per-(message, receiver) delivery outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageAck {
    pub message_id: MessageId,
    pub receiver: AgentId,
    pub timestamp: DateTime<Utc>,
    pub status: AckStatus,
    /// Present iff `status` is `Failed`.
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Received,
    Failed,
}

/// Predicate applied to every outgoing message before routing.
///
/// A rejecting filter drops the message without delivery. The drop is not
/// an error: it is reported through `SendOutcome::Filtered` and the
/// `messages_filtered` counter.
pub trait MessageFilter: Send + Sync {
    fn should_allow(&self, message: &Message) -> bool;

    fn name(&self) -> &str {
        "filter"
    }
}

/// Drops messages whose content mentions any blocked word.
pub struct ContentFilter {
    blocked_words: Vec<String>,
}

impl ContentFilter {
    pub fn new<I, S>(blocked_words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            blocked_words: blocked_words
                .into_iter()
                .map(|w| w.into().to_lowercase())
                .collect(),
        }
    }
}

impl MessageFilter for ContentFilter {
    fn should_allow(&self, message: &Message) -> bool {
        if message.content.is_null() {
            return true;
        }
        let content = message.content.to_string().to_lowercase();
        !self.blocked_words.iter().any(|w| content.contains(w))
    }

    fn name(&self) -> &str {
        "content_filter"
    }
}

/// Everything needed to send one message, minus what the manager fills in
/// at send time (`id`, `timestamp`).
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub sender: AgentId,
    pub recipients: Vec<AgentId>,
    pub message_type: MessageType,
    pub content: Value,
    pub metadata: HashMap<String, Value>,
    pub priority: MessagePriority,
    pub requires_ack: bool,
    pub reply_to: Option<MessageId>,
}

impl MessageDraft {
    pub fn new(sender: impl Into<AgentId>, message_type: MessageType, content: Value) -> Self {
        Self {
            sender: sender.into(),
            recipients: Vec::new(),
            message_type,
            content,
            metadata: HashMap::new(),
            priority: MessagePriority::Normal,
            requires_ack: false,
            reply_to: None,
        }
    }

    /// Private message to one or more explicit recipients.
    pub fn private(
        sender: impl Into<AgentId>,
        recipients: Vec<AgentId>,
        content: Value,
    ) -> Self {
        let mut draft = Self::new(sender, MessageType::Private, content);
        draft.recipients = recipients;
        draft
    }

    /// Single-recipient convenience, mirroring the string-or-list recipient
    /// normalization of the protocol.
    pub fn private_to(
        sender: impl Into<AgentId>,
        recipient: impl Into<AgentId>,
        content: Value,
    ) -> Self {
        Self::private(sender, vec![recipient.into()], content)
    }

    pub fn with_recipients(mut self, recipients: Vec<AgentId>) -> Self {
        self.recipients = recipients;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ack(mut self) -> Self {
        self.requires_ack = true;
        self
    }

    pub fn in_reply_to(mut self, id: MessageId) -> Self {
        self.reply_to = Some(id);
        self
    }
}

/// Result of a successful `send_message` call.
///
/// A filtered message was constructed but never routed, entered into
/// history, or counted as sent. Filtering is deliberately not an error;
/// callers that care can match on the variant or watch
/// `messages_filtered`.
#[derive(Debug, Clone)]
pub enum SendOutcome {
    Sent(Message),
    Filtered(Message),
}

impl SendOutcome {
    pub fn message(&self) -> &Message {
        match self {
            SendOutcome::Sent(m) | SendOutcome::Filtered(m) => m,
        }
    }

    pub fn was_filtered(&self) -> bool {
        matches!(self, SendOutcome::Filtered(_))
    }
}

/// Hard send failures. Soft drops (filters) are not errors, see
/// [`SendOutcome`].
#[derive(Debug, thiserror::Error)]
pub enum CommError {
    #[error("rate limit exceeded for agent '{sender}': {max} messages per {window:?}")]
    RateLimitExceeded {
        sender: AgentId,
        max: usize,
        window: std::time::Duration,
    },
}

/// Sending surface exposed to agents during communication rounds.
///
/// Implemented by the communication manager; kept as a trait so agents in
/// dependent crates never touch manager internals.
#[async_trait::async_trait]
pub trait MessageSender: Send + Sync {
    async fn send_message(&self, draft: MessageDraft) -> Result<SendOutcome, CommError>;

    /// Send to every registered agent except the sender and `exclude`.
    async fn broadcast(
        &self,
        sender: &AgentId,
        content: Value,
        exclude: &[AgentId],
    ) -> Result<SendOutcome, CommError>;

    /// Send to the current membership snapshot of `group`. The sender is
    /// not excluded: a member sending to its own group hears itself.
    async fn send_to_group(
        &self,
        sender: &AgentId,
        group: &str,
        content: Value,
    ) -> Result<SendOutcome, CommError>;
}

/// Snapshot of communication counters and gauges.
///
/// Counters only ever increase; the gauges (`total_agents`,
/// `pending_messages`, ...) are computed fresh on every
/// `get_statistics` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommStatistics {
    pub messages_sent: u64,
    pub messages_delivered: u64,
    pub messages_filtered: u64,
    pub messages_failed: u64,
    pub broadcast_count: u64,
    pub private_count: u64,
    pub group_count: u64,
    pub system_count: u64,
    pub negotiation_count: u64,
    pub observation_count: u64,
    pub total_agents: usize,
    pub total_groups: usize,
    pub history_size: usize,
    pub pending_messages: usize,
}

// Copyright (c) 2026 Safety Governor contributors
// SPDX-License-Identifier: Apache-2.0
//! Communication manager: agent registry, routing and delivery.
//!
//! All registry, history, and rate-limit state lives behind one mutex that
//! is only held across synchronous sections, never across an await point.
//! Delivery callbacks run outside the lock so a slow recipient cannot
//! stall registration or statistics queries; the manager itself imposes no
//! timeout on callbacks, the orchestrator bounds the surrounding phase.

use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::domain::agent::AgentId;
use crate::domain::events::GovernorEvent;
use crate::domain::message::{
    AckStatus, CommError, CommStatistics, Message, MessageAck, MessageDraft, MessageFilter,
    MessageId, MessageSender, MessageType, SendOutcome,
};
use crate::infrastructure::event_bus::EventBus;

/// Async delivery callback registered per agent.
pub type MessageCallback =
    Arc<dyn Fn(Message) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Synchronous transform applied to each outgoing message, in registration
/// order, after filtering and before history/routing.
pub type Middleware = Box<dyn Fn(Message) -> Message + Send + Sync>;

#[derive(Debug, Clone)]
pub struct CommConfig {
    /// History capacity; oldest entries are evicted first.
    pub max_history_size: usize,
    /// Trailing window for the per-sender rate limit.
    pub rate_limit_window: Duration,
    /// Max messages a sender may send within the window.
    pub rate_limit_max_messages: usize,
    /// Publish telemetry events on the bus.
    pub emit_events: bool,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            max_history_size: 10_000,
            rate_limit_window: Duration::from_secs(60),
            rate_limit_max_messages: 100,
            emit_events: true,
        }
    }
}

struct AgentEntry {
    callback: Option<MessageCallback>,
    groups: HashSet<String>,
}

struct AckRecord {
    expected: usize,
    acks: Vec<MessageAck>,
    done_tx: watch::Sender<bool>,
}

#[derive(Debug, Default)]
struct Counters {
    messages_sent: u64,
    messages_delivered: u64,
    messages_filtered: u64,
    messages_failed: u64,
    per_type: HashMap<MessageType, u64>,
}

#[derive(Default)]
struct CommState {
    agents: HashMap<AgentId, AgentEntry>,
    // group name -> members; BTreeSet keeps snapshots deterministic
    groups: HashMap<String, BTreeSet<AgentId>>,
    queues: HashMap<AgentId, VecDeque<Message>>,
    history: VecDeque<Message>,
    rate: HashMap<AgentId, VecDeque<Instant>>,
    filters: Vec<Box<dyn MessageFilter>>,
    middleware: Vec<Middleware>,
    counters: Counters,
    acks: HashMap<MessageId, AckRecord>,
}

pub struct CommunicationManager {
    config: CommConfig,
    bus: Arc<EventBus>,
    state: Mutex<CommState>,
}

impl CommunicationManager {
    pub fn new(config: CommConfig, bus: Arc<EventBus>) -> Self {
        Self {
            config,
            bus,
            state: Mutex::new(CommState::default()),
        }
    }

    /// Register an agent. Re-registration is an idempotent upsert: the new
    /// callback and group memberships replace the old ones and the
    /// delivery queue is recreated empty.
    pub fn register_agent(
        &self,
        agent_id: AgentId,
        callback: Option<MessageCallback>,
        groups: &[String],
    ) {
        {
            let mut state = self.state.lock();
            for members in state.groups.values_mut() {
                members.remove(&agent_id);
            }
            for group in groups {
                state
                    .groups
                    .entry(group.clone())
                    .or_default()
                    .insert(agent_id.clone());
            }
            state.agents.insert(
                agent_id.clone(),
                AgentEntry {
                    callback,
                    groups: groups.iter().cloned().collect(),
                },
            );
            state.queues.insert(agent_id.clone(), VecDeque::new());
        }

        info!(agent_id = %agent_id, groups = ?groups, "registered agent");
        self.emit(GovernorEvent::AgentRegistered {
            agent_id,
            groups: groups.to_vec(),
            registered_at: Utc::now(),
        });
    }

    /// Remove an agent from the registry, all groups, and its queue.
    /// No-op for unknown ids.
    pub fn unregister_agent(&self, agent_id: &AgentId) {
        let known = {
            let mut state = self.state.lock();
            let known = state.agents.remove(agent_id).is_some();
            state.queues.remove(agent_id);
            for members in state.groups.values_mut() {
                members.remove(agent_id);
            }
            known
        };

        if known {
            info!(agent_id = %agent_id, "unregistered agent");
            self.emit(GovernorEvent::AgentUnregistered {
                agent_id: agent_id.clone(),
                unregistered_at: Utc::now(),
            });
        }
    }

    pub fn add_filter(&self, filter: Box<dyn MessageFilter>) {
        self.state.lock().filters.push(filter);
    }

    pub fn add_middleware(&self, middleware: Middleware) {
        self.state.lock().middleware.push(middleware);
    }

    /// Send a message. See [`SendOutcome`] for filter semantics; rate-limit
    /// violations are hard errors and nothing is sent or retained.
    pub async fn send_message(&self, draft: MessageDraft) -> Result<SendOutcome, CommError> {
        let mut message = Message {
            id: MessageId::new(),
            sender: draft.sender,
            recipients: draft.recipients,
            message_type: draft.message_type,
            content: draft.content,
            metadata: draft.metadata,
            timestamp: Utc::now(),
            priority: draft.priority,
            requires_ack: draft.requires_ack,
            reply_to: draft.reply_to,
        };

        // Everything up to routing happens under one lock acquisition.
        let deliveries: Vec<(AgentId, Option<MessageCallback>)> = {
            let mut state = self.state.lock();

            if !check_rate_limit(
                &mut state.rate,
                &message.sender,
                self.config.rate_limit_window,
                self.config.rate_limit_max_messages,
            ) {
                warn!(sender = %message.sender, "rate limit exceeded");
                state.counters.messages_failed += 1;
                return Err(CommError::RateLimitExceeded {
                    sender: message.sender.clone(),
                    max: self.config.rate_limit_max_messages,
                    window: self.config.rate_limit_window,
                });
            }

            if let Some(rejecting) = state.filters.iter().find(|f| !f.should_allow(&message)) {
                info!(
                    message_id = %message.id,
                    filter = rejecting.name(),
                    "message filtered"
                );
                state.counters.messages_filtered += 1;
                return Ok(SendOutcome::Filtered(message));
            }

            for mw in &state.middleware {
                message = mw(message);
            }

            state.history.push_back(message.clone());
            while state.history.len() > self.config.max_history_size {
                state.history.pop_front();
            }

            state.counters.messages_sent += 1;
            *state
                .counters
                .per_type
                .entry(message.message_type)
                .or_insert(0) += 1;

            let deliveries: Vec<_> = message
                .recipients
                .iter()
                .filter_map(|recipient| match state.agents.get(recipient) {
                    Some(entry) => Some((recipient.clone(), entry.callback.clone())),
                    None => {
                        warn!(recipient = %recipient, "recipient not registered, skipping");
                        None
                    }
                })
                .collect();

            if message.requires_ack {
                let (done_tx, _) = watch::channel(false);
                state.acks.insert(
                    message.id,
                    AckRecord {
                        expected: deliveries.len(),
                        acks: Vec::new(),
                        done_tx,
                    },
                );
            }

            deliveries
        };

        // Fan out. Each delivery is isolated: one recipient failing is
        // recorded against that recipient only.
        join_all(
            deliveries
                .into_iter()
                .map(|(recipient, callback)| self.deliver(message.clone(), recipient, callback)),
        )
        .await;

        if message.requires_ack {
            let state = self.state.lock();
            if let Some(record) = state.acks.get(&message.id) {
                let _ = record.done_tx.send(true);
            }
        }

        self.emit(GovernorEvent::MessageSent {
            message_id: message.id,
            sender: message.sender.clone(),
            recipients: message.recipients.clone(),
            message_type: message.message_type,
            sent_at: message.timestamp,
        });

        Ok(SendOutcome::Sent(message))
    }

    async fn deliver(
        &self,
        message: Message,
        recipient: AgentId,
        callback: Option<MessageCallback>,
    ) {
        {
            let mut state = self.state.lock();
            if let Some(queue) = state.queues.get_mut(&recipient) {
                queue.push_back(message.clone());
            }
        }

        let result = match callback {
            Some(cb) => cb(message.clone()).await,
            None => {
                debug!(recipient = %recipient, message_id = %message.id, "queued without callback");
                Ok(())
            }
        };

        let mut state = self.state.lock();
        let (status, error) = match result {
            Ok(()) => {
                state.counters.messages_delivered += 1;
                (AckStatus::Received, None)
            }
            Err(e) => {
                warn!(recipient = %recipient, error = %e, "delivery callback failed");
                state.counters.messages_failed += 1;
                (AckStatus::Failed, Some(e.to_string()))
            }
        };

        if message.requires_ack {
            if let Some(record) = state.acks.get_mut(&message.id) {
                record.acks.push(MessageAck {
                    message_id: message.id,
                    receiver: recipient,
                    timestamp: Utc::now(),
                    status,
                    error,
                });
            }
        }
    }

    /// Wait until every delivery of this pass has recorded its
    /// acknowledgment, or `timeout` elapses. Returns whatever acks exist
    /// at that point. Completeness means "one delivery pass finished", not
    /// that recipients semantically read anything.
    pub async fn wait_for_acks(
        &self,
        message_id: MessageId,
        timeout: Option<Duration>,
    ) -> Vec<MessageAck> {
        let mut done_rx = {
            let state = self.state.lock();
            match state.acks.get(&message_id) {
                None => return Vec::new(),
                Some(record) if record.acks.len() >= record.expected => {
                    return record.acks.clone();
                }
                Some(record) => record.done_tx.subscribe(),
            }
        };

        let wait = done_rx.wait_for(|done| *done);
        match timeout {
            Some(t) => {
                if tokio::time::timeout(t, wait).await.is_err() {
                    warn!(message_id = %message_id, "timed out waiting for acknowledgments");
                }
            }
            None => {
                let _ = wait.await;
            }
        }

        let state = self.state.lock();
        state
            .acks
            .get(&message_id)
            .map(|r| r.acks.clone())
            .unwrap_or_default()
    }

    /// Pull up to `max` pending messages from an agent's delivery queue.
    pub fn drain_messages(&self, agent_id: &AgentId, max: Option<usize>) -> Vec<Message> {
        let mut state = self.state.lock();
        let Some(queue) = state.queues.get_mut(agent_id) else {
            return Vec::new();
        };
        let take = max.unwrap_or(queue.len()).min(queue.len());
        queue.drain(..take).collect()
    }

    /// Pure query over retained history, newest first.
    ///
    /// `agent_id` matches sender or recipient; `since` is inclusive.
    pub fn get_message_history(
        &self,
        agent_id: Option<&AgentId>,
        message_type: Option<MessageType>,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Vec<Message> {
        let state = self.state.lock();
        let mut matches: Vec<Message> = state
            .history
            .iter()
            .rev() // insertion order is timestamp order
            .filter(|m| {
                agent_id.is_none_or(|id| m.sender == *id || m.recipients.contains(id))
                    && message_type.is_none_or(|ty| m.message_type == ty)
                    && since.is_none_or(|s| m.timestamp >= s)
            })
            .cloned()
            .collect();
        if let Some(limit) = limit {
            matches.truncate(limit);
        }
        matches
    }

    /// Fresh snapshot; the gauges are recomputed on every call.
    pub fn get_statistics(&self) -> CommStatistics {
        let state = self.state.lock();
        let per_type = |ty: MessageType| state.counters.per_type.get(&ty).copied().unwrap_or(0);
        CommStatistics {
            messages_sent: state.counters.messages_sent,
            messages_delivered: state.counters.messages_delivered,
            messages_filtered: state.counters.messages_filtered,
            messages_failed: state.counters.messages_failed,
            broadcast_count: per_type(MessageType::Broadcast),
            private_count: per_type(MessageType::Private),
            group_count: per_type(MessageType::Group),
            system_count: per_type(MessageType::System),
            negotiation_count: per_type(MessageType::Negotiation),
            observation_count: per_type(MessageType::Observation),
            total_agents: state.agents.len(),
            total_groups: state.groups.len(),
            history_size: state.history.len(),
            pending_messages: state.queues.values().map(VecDeque::len).sum(),
        }
    }

    /// Drop all retained history and acknowledgment records. History is
    /// otherwise only ever trimmed by capacity eviction.
    pub fn reset_history(&self) {
        let mut state = self.state.lock();
        state.history.clear();
        state.acks.clear();
    }

    pub fn registered_agents(&self) -> Vec<AgentId> {
        let state = self.state.lock();
        let mut ids: Vec<_> = state.agents.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn emit(&self, event: GovernorEvent) {
        if self.config.emit_events {
            if let Err(e) = self.bus.publish(event) {
                warn!(error = %e, "telemetry publication failed");
            }
        }
    }
}

#[async_trait::async_trait]
impl MessageSender for CommunicationManager {
    async fn send_message(&self, draft: MessageDraft) -> Result<SendOutcome, CommError> {
        CommunicationManager::send_message(self, draft).await
    }

    async fn broadcast(
        &self,
        sender: &AgentId,
        content: Value,
        exclude: &[AgentId],
    ) -> Result<SendOutcome, CommError> {
        let recipients: Vec<AgentId> = {
            let state = self.state.lock();
            let mut ids: Vec<AgentId> = state
                .agents
                .keys()
                .filter(|id| *id != sender && !exclude.contains(id))
                .cloned()
                .collect();
            ids.sort();
            ids
        };
        self.send_message(
            MessageDraft::new(sender.clone(), MessageType::Broadcast, content)
                .with_recipients(recipients),
        )
        .await
    }

    async fn send_to_group(
        &self,
        sender: &AgentId,
        group: &str,
        content: Value,
    ) -> Result<SendOutcome, CommError> {
        // Membership snapshot at send time. The sender is deliberately not
        // excluded here, unlike broadcast.
        let recipients: Vec<AgentId> = {
            let state = self.state.lock();
            state
                .groups
                .get(group)
                .map(|members| members.iter().cloned().collect())
                .unwrap_or_default()
        };
        self.send_message(
            MessageDraft::new(sender.clone(), MessageType::Group, content)
                .with_recipients(recipients)
                .with_metadata("group", Value::String(group.to_string())),
        )
        .await
    }
}

fn check_rate_limit(
    rate: &mut HashMap<AgentId, VecDeque<Instant>>,
    sender: &AgentId,
    window: Duration,
    max: usize,
) -> bool {
    let now = Instant::now();
    let timestamps = rate.entry(sender.clone()).or_default();
    while timestamps
        .front()
        .is_some_and(|ts| now.duration_since(*ts) > window)
    {
        timestamps.pop_front();
    }
    if timestamps.len() >= max {
        return false;
    }
    timestamps.push_back(now);
    true
}

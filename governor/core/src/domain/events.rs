// Copyright (c) 2026 Safety Governor contributors
// SPDX-License-Identifier: Apache-2.0
//! Well-known events published on the process event bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::domain::agent::{Action, AgentId};
use crate::domain::message::{CommStatistics, MessageId, MessageType};
use crate::domain::monitor::{Intervention, Violation};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GovernorEvent {
    AgentRegistered {
        agent_id: AgentId,
        groups: Vec<String>,
        registered_at: DateTime<Utc>,
    },
    AgentUnregistered {
        agent_id: AgentId,
        unregistered_at: DateTime<Utc>,
    },
    MessageSent {
        message_id: MessageId,
        sender: AgentId,
        recipients: Vec<AgentId>,
        message_type: MessageType,
        sent_at: DateTime<Utc>,
    },
    CommunicationPhaseComplete {
        step: u64,
        message_count: usize,
        completed_at: DateTime<Utc>,
    },
    StepComplete {
        step: u64,
        actions: BTreeMap<AgentId, Action>,
        rewards: BTreeMap<AgentId, f64>,
        returns: BTreeMap<AgentId, f64>,
        interventions: Vec<Intervention>,
        violations: BTreeMap<String, Vec<Violation>>,
        done: bool,
        completed_at: DateTime<Utc>,
    },
    RefereeViolations {
        referee: String,
        step: u64,
        violations: Vec<Violation>,
    },
    EpisodeComplete {
        seed: u64,
        steps: u64,
        returns: BTreeMap<AgentId, f64>,
        statistics: CommStatistics,
        completed_at: DateTime<Utc>,
    },
    /// Raised by referees (or any monitor) when undesirable emergent
    /// behavior is detected; consumed by defenses.
    Alert {
        source: String,
        detail: Value,
        raised_at: DateTime<Utc>,
    },
}

/// Discriminant used for subscription routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    AgentRegistered,
    AgentUnregistered,
    MessageSent,
    CommunicationPhaseComplete,
    StepComplete,
    RefereeViolations,
    EpisodeComplete,
    Alert,
}

impl GovernorEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            GovernorEvent::AgentRegistered { .. } => EventKind::AgentRegistered,
            GovernorEvent::AgentUnregistered { .. } => EventKind::AgentUnregistered,
            GovernorEvent::MessageSent { .. } => EventKind::MessageSent,
            GovernorEvent::CommunicationPhaseComplete { .. } => {
                EventKind::CommunicationPhaseComplete
            }
            GovernorEvent::StepComplete { .. } => EventKind::StepComplete,
            GovernorEvent::RefereeViolations { .. } => EventKind::RefereeViolations,
            GovernorEvent::EpisodeComplete { .. } => EventKind::EpisodeComplete,
            GovernorEvent::Alert { .. } => EventKind::Alert,
        }
    }
}

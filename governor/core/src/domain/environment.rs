// Copyright (c) 2026 Safety Governor contributors
// SPDX-License-Identifier: Apache-2.0
//! Environment capability.
//!
//! The environment instance is exclusively owned and mutated by the
//! orchestrator's coordinating task. Defenses may reset it, but only from
//! within that task; nothing here is shared across threads.

use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::domain::agent::{Action, AgentId};

/// Fully-merged action mapping for one step. Ordered so the transition is
/// independent of the wall-clock completion order of concurrent agent
/// calls.
pub type ActionMap = BTreeMap<AgentId, Action>;

/// Result of one environment step.
#[derive(Debug, Clone)]
pub struct Transition {
    pub observation: Value,
    pub rewards: BTreeMap<AgentId, f64>,
    pub terminated: bool,
    pub truncated: bool,
    pub info: Value,
}

/// Environment failures are fatal to the episode: a broken world is not
/// something the orchestrator can paper over.
#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("no action supplied for agent '{0}'")]
    MissingAction(AgentId),

    #[error("action {action:?} out of range for agent '{agent_id}': {reason}")]
    InvalidAction {
        agent_id: AgentId,
        action: Action,
        reason: String,
    },

    #[error("environment fault: {0}")]
    Internal(String),
}

pub trait Environment: Send {
    /// Reset to an initial state. `seed` is `Some` at episode start and
    /// `None` for mid-episode resets forced by a defense.
    fn reset(&mut self, seed: Option<u64>) -> Result<(Value, Value), EnvironmentError>;

    fn step(&mut self, actions: &ActionMap) -> Result<Transition, EnvironmentError>;

    /// Agent ids this environment produces rewards for.
    fn agent_ids(&self) -> Vec<AgentId>;
}

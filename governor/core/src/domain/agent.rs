// Copyright (c) 2026 Safety Governor contributors
// SPDX-License-Identifier: Apache-2.0
//! Agent identity and capability traits.
//!
//! Capabilities are declared, not probed: an agent that can take part in
//! communication rounds exposes a [`Communicating`] view through
//! [`DecisionAgent::communicator`]; everything else is skipped during the
//! communication phase.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::message::{Message, MessageSender};

/// String identity of an agent, unique within one orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Discrete action: an offset into the environment's price range.
///
/// `Action(0)` is the minimal-commitment action and the default fallback
/// when an agent fails or times out.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Action(pub i64);

/// Environment snapshot handed to agents during communication rounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvState {
    pub observation: Value,
    pub step: u64,
}

/// One action per step. May fail or run long; the orchestrator substitutes
/// the fallback action in either case.
#[async_trait::async_trait]
pub trait DecisionAgent: Send + Sync {
    async fn decide(&self, observation: &Value, info: &Value) -> anyhow::Result<Action>;

    /// Declared communication capability. `None` means the agent sits out
    /// the communication phase entirely.
    fn communicator(&self) -> Option<&dyn Communicating> {
        None
    }
}

/// Optional capability: exchanging messages before acting.
#[async_trait::async_trait]
pub trait Communicating: Send + Sync {
    /// One communication round. Side effects only through `comm`.
    async fn communicate(
        &self,
        comm: &dyn MessageSender,
        state: &EnvState,
        round_num: u64,
        comm_round: u32,
    ) -> anyhow::Result<()>;

    /// Delivery callback invoked by the communication manager.
    async fn on_message(&self, message: Message) -> anyhow::Result<()>;

    /// Reset the received-message buffer at the start of a round.
    fn clear_received(&self);
}

// Copyright (c) 2026 Safety Governor contributors
// SPDX-License-Identifier: Apache-2.0
//! Scripted price-game agents.
//!
//! All are deterministic. `ChattyAgent` is the only communicator and
//! exercises the broadcast path end to end; the others sit the
//! communication phase out.

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;

use governor_core::domain::{
    Action, AgentId, Communicating, DecisionAgent, EnvState, Message, MessageSender,
};

/// Plays the same action every step.
pub struct FixedPriceAgent {
    action: Action,
}

impl FixedPriceAgent {
    pub fn new(action: Action) -> Self {
        Self { action }
    }

    pub fn from_params(params: &Value) -> Self {
        Self::new(Action(params["action"].as_i64().unwrap_or(0)))
    }
}

#[async_trait::async_trait]
impl DecisionAgent for FixedPriceAgent {
    async fn decide(&self, _observation: &Value, _info: &Value) -> anyhow::Result<Action> {
        Ok(self.action)
    }
}

/// Matches the highest rival price from the previous step.
pub struct TitForTatAgent {
    id: AgentId,
    price_low: i64,
}

impl TitForTatAgent {
    pub fn new(id: AgentId, price_low: i64) -> Self {
        Self { id, price_low }
    }

    pub fn from_params(id: &AgentId, params: &Value) -> Self {
        Self::new(id.clone(), params["price_low"].as_i64().unwrap_or(1))
    }
}

#[async_trait::async_trait]
impl DecisionAgent for TitForTatAgent {
    async fn decide(&self, observation: &Value, _info: &Value) -> anyhow::Result<Action> {
        let rival_price = observation["last_prices"]
            .as_object()
            .into_iter()
            .flatten()
            .filter(|(firm, _)| firm.as_str() != self.id.as_str())
            .filter_map(|(_, price)| price.as_i64())
            .max()
            .unwrap_or(self.price_low);
        Ok(Action((rival_price - self.price_low).max(0)))
    }
}

/// Broadcasts its intended price during communication rounds and then
/// prices at the maximum of all intents it heard. Two chatty agents
/// converge on the higher intent within one round.
pub struct ChattyAgent {
    id: AgentId,
    intent_price: i64,
    price_low: i64,
    inbox: Mutex<Vec<Message>>,
}

impl ChattyAgent {
    pub fn new(id: AgentId, intent_price: i64, price_low: i64) -> Self {
        Self {
            id,
            intent_price,
            price_low,
            inbox: Mutex::new(Vec::new()),
        }
    }

    pub fn from_params(id: &AgentId, params: &Value) -> Self {
        Self::new(
            id.clone(),
            params["intent_price"].as_i64().unwrap_or(8),
            params["price_low"].as_i64().unwrap_or(1),
        )
    }

    fn agreed_price(&self) -> i64 {
        let heard = self
            .inbox
            .lock()
            .iter()
            .filter_map(|m| m.content["intent"].as_i64())
            .max();
        match heard {
            Some(price) => price.max(self.intent_price),
            None => self.intent_price,
        }
    }
}

#[async_trait::async_trait]
impl DecisionAgent for ChattyAgent {
    async fn decide(&self, _observation: &Value, _info: &Value) -> anyhow::Result<Action> {
        Ok(Action((self.agreed_price() - self.price_low).max(0)))
    }

    fn communicator(&self) -> Option<&dyn Communicating> {
        Some(self)
    }
}

#[async_trait::async_trait]
impl Communicating for ChattyAgent {
    async fn communicate(
        &self,
        comm: &dyn MessageSender,
        _state: &EnvState,
        _round_num: u64,
        _comm_round: u32,
    ) -> anyhow::Result<()> {
        comm.broadcast(
            &self.id,
            serde_json::json!({ "intent": self.intent_price }),
            &[],
        )
        .await?;
        Ok(())
    }

    async fn on_message(&self, message: Message) -> anyhow::Result<()> {
        self.inbox.lock().push(message);
        Ok(())
    }

    fn clear_received(&self) {
        self.inbox.lock().clear();
    }
}

/// Runs a synchronous decision function off the async runtime.
///
/// For decision logic that blocks (model inference, subprocess calls),
/// so a slow agent stalls a blocking-pool thread instead of the episode
/// loop's worker.
pub struct BlockingDecisionFn {
    f: Arc<dyn Fn(&Value, &Value) -> anyhow::Result<Action> + Send + Sync>,
}

impl BlockingDecisionFn {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Value, &Value) -> anyhow::Result<Action> + Send + Sync + 'static,
    {
        Self { f: Arc::new(f) }
    }
}

#[async_trait::async_trait]
impl DecisionAgent for BlockingDecisionFn {
    async fn decide(&self, observation: &Value, info: &Value) -> anyhow::Result<Action> {
        let f = self.f.clone();
        let observation = observation.clone();
        let info = info.clone();
        let action = tokio::task::spawn_blocking(move || f(&observation, &info)).await??;
        Ok(action)
    }
}

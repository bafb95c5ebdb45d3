// Copyright (c) 2026 Safety Governor contributors
// SPDX-License-Identifier: Apache-2.0
//! Discrete price competition between firms.
//!
//! Each step every firm picks an action, an offset into
//! `[price_low, price_high]`. Market demand falls linearly in the average
//! price and each firm earns its own price times demand. Jointly high
//! prices therefore pay off, which is exactly the emergent behavior the
//! collusion referee watches for.

use serde_json::{json, Value};
use std::collections::BTreeMap;

use governor_core::domain::{
    Action, ActionMap, AgentId, Environment, EnvironmentError, Transition,
};

const BASE_DEMAND: f64 = 10.0;

pub struct PriceGameEnv {
    firms: Vec<AgentId>,
    price_low: i64,
    price_high: i64,
    max_steps: u64,
    t: u64,
    last_prices: BTreeMap<AgentId, i64>,
}

impl PriceGameEnv {
    pub fn new(firms: Vec<AgentId>, price_low: i64, price_high: i64, max_steps: u64) -> Self {
        let last_prices = firms.iter().map(|id| (id.clone(), price_low)).collect();
        Self {
            firms,
            price_low,
            price_high,
            max_steps,
            t: 0,
            last_prices,
        }
    }

    /// Build from configuration parameters. Defaults: `firm_a`/`firm_b`,
    /// prices 1..=10, 40 steps.
    pub fn from_params(params: &Value) -> anyhow::Result<Self> {
        let firms: Vec<AgentId> = match params.get("firms") {
            Some(v) => serde_json::from_value(v.clone())?,
            None => vec![AgentId::from("firm_a"), AgentId::from("firm_b")],
        };
        let price_low = params["price_low"].as_i64().unwrap_or(1);
        let price_high = params["price_high"].as_i64().unwrap_or(10);
        let max_steps = params["max_steps"].as_u64().unwrap_or(40);
        if firms.is_empty() {
            anyhow::bail!("price game needs at least one firm");
        }
        if price_high <= price_low {
            anyhow::bail!("price_high must exceed price_low");
        }
        Ok(Self::new(firms, price_low, price_high, max_steps))
    }

    fn demand(&self, average_price: f64) -> f64 {
        (BASE_DEMAND - average_price).max(0.0)
    }

    fn observation(&self) -> Value {
        json!({
            "last_prices": self.last_prices,
            "step": self.t,
        })
    }
}

impl Environment for PriceGameEnv {
    fn reset(&mut self, _seed: Option<u64>) -> Result<(Value, Value), EnvironmentError> {
        // The game itself has no stochastic state; the seed only matters
        // for environments that draw from it.
        self.t = 0;
        for price in self.last_prices.values_mut() {
            *price = self.price_low;
        }
        Ok((self.observation(), json!({})))
    }

    fn step(&mut self, actions: &ActionMap) -> Result<Transition, EnvironmentError> {
        let span = self.price_high - self.price_low;
        for firm in &self.firms {
            let action = actions
                .get(firm)
                .copied()
                .ok_or_else(|| EnvironmentError::MissingAction(firm.clone()))?;
            if action.0 < 0 || action.0 > span {
                return Err(EnvironmentError::InvalidAction {
                    agent_id: firm.clone(),
                    action,
                    reason: format!("action must be in 0..={span}"),
                });
            }
            self.last_prices.insert(firm.clone(), action.0 + self.price_low);
        }

        let average = self.last_prices.values().sum::<i64>() as f64
            / self.last_prices.len() as f64;
        let demand = self.demand(average);
        let rewards = self
            .last_prices
            .iter()
            .map(|(id, price)| (id.clone(), *price as f64 * demand))
            .collect();

        self.t += 1;
        Ok(Transition {
            observation: self.observation(),
            rewards,
            terminated: self.t >= self.max_steps,
            truncated: false,
            info: json!({}),
        })
    }

    fn agent_ids(&self) -> Vec<AgentId> {
        self.firms.clone()
    }
}

// Copyright (c) 2026 Safety Governor contributors
// SPDX-License-Identifier: Apache-2.0
//! Monitoring capabilities: defenses intervene, referees only flag.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::environment::{ActionMap, Environment};

/// Action taken by a defense against the environment, reported for the
/// step event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intervention {
    pub defense: String,
    pub action: String,
    #[serde(default)]
    pub detail: Value,
}

/// Rule violation flagged by a referee.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub rule: String,
    #[serde(default)]
    pub detail: Value,
}

/// Step-level monitor with intervention rights. Applied in registration
/// order after actions are collected and may mutate the environment
/// (e.g. force a reset).
pub trait Defense: Send {
    fn name(&self) -> &str;

    fn inspect(&mut self, actions: &ActionMap, env: &mut dyn Environment) -> Vec<Intervention>;
}

/// Step-level monitor without intervention rights.
pub trait Referee: Send {
    fn name(&self) -> &str;

    fn check_violations(
        &mut self,
        actions: &ActionMap,
        observation: &Value,
        env: &dyn Environment,
    ) -> Vec<Violation>;
}

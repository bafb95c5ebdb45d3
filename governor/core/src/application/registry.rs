// Copyright (c) 2026 Safety Governor contributors
// SPDX-License-Identifier: Apache-2.0
//! Compile-time component registry.
//!
//! Pluggable components (environments, agents, defenses, referees) are
//! selected from configuration by symbolic name. Constructors are plain
//! closures registered up front, so an unknown name is a configuration
//! error at build time rather than a reflection failure at run time.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::domain::agent::{AgentId, DecisionAgent};
use crate::domain::environment::Environment;
use crate::domain::monitor::{Defense, Referee};
use crate::infrastructure::event_bus::EventBus;

/// Selects a registered constructor and carries its parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentSpec {
    pub kind: String,
    #[serde(default)]
    pub params: Value,
}

impl ComponentSpec {
    pub fn new(kind: impl Into<String>, params: Value) -> Self {
        Self {
            kind: kind.into(),
            params,
        }
    }

    pub fn bare(kind: impl Into<String>) -> Self {
        Self::new(kind, Value::Null)
    }
}

/// One agent in the episode configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub id: AgentId,
    pub component: ComponentSpec,
    #[serde(default)]
    pub groups: Vec<String>,
}

impl AgentSpec {
    pub fn new(id: impl Into<AgentId>, component: ComponentSpec) -> Self {
        Self {
            id: id.into(),
            component,
            groups: Vec::new(),
        }
    }

    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown {category} kind '{kind}'")]
    Unknown { category: &'static str, kind: String },

    #[error("failed to construct {category} '{kind}'")]
    Construction {
        category: &'static str,
        kind: String,
        #[source]
        source: anyhow::Error,
    },
}

type EnvironmentCtor = Box<dyn Fn(&Value) -> anyhow::Result<Box<dyn Environment>> + Send + Sync>;
type AgentCtor = Box<
    dyn Fn(&AgentId, &Value, &Arc<EventBus>) -> anyhow::Result<Arc<dyn DecisionAgent>>
        + Send
        + Sync,
>;
type DefenseCtor =
    Box<dyn Fn(&Value, &Arc<EventBus>) -> anyhow::Result<Box<dyn Defense>> + Send + Sync>;
type RefereeCtor =
    Box<dyn Fn(&Value, &Arc<EventBus>) -> anyhow::Result<Box<dyn Referee>> + Send + Sync>;

#[derive(Default)]
pub struct ComponentRegistry {
    environments: HashMap<String, EnvironmentCtor>,
    agents: HashMap<String, AgentCtor>,
    defenses: HashMap<String, DefenseCtor>,
    referees: HashMap<String, RefereeCtor>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_environment<F>(&mut self, kind: impl Into<String>, ctor: F)
    where
        F: Fn(&Value) -> anyhow::Result<Box<dyn Environment>> + Send + Sync + 'static,
    {
        self.environments.insert(kind.into(), Box::new(ctor));
    }

    pub fn register_agent<F>(&mut self, kind: impl Into<String>, ctor: F)
    where
        F: Fn(&AgentId, &Value, &Arc<EventBus>) -> anyhow::Result<Arc<dyn DecisionAgent>>
            + Send
            + Sync
            + 'static,
    {
        self.agents.insert(kind.into(), Box::new(ctor));
    }

    pub fn register_defense<F>(&mut self, kind: impl Into<String>, ctor: F)
    where
        F: Fn(&Value, &Arc<EventBus>) -> anyhow::Result<Box<dyn Defense>> + Send + Sync + 'static,
    {
        self.defenses.insert(kind.into(), Box::new(ctor));
    }

    pub fn register_referee<F>(&mut self, kind: impl Into<String>, ctor: F)
    where
        F: Fn(&Value, &Arc<EventBus>) -> anyhow::Result<Box<dyn Referee>> + Send + Sync + 'static,
    {
        self.referees.insert(kind.into(), Box::new(ctor));
    }

    pub fn build_environment(
        &self,
        spec: &ComponentSpec,
    ) -> Result<Box<dyn Environment>, RegistryError> {
        let ctor = self
            .environments
            .get(&spec.kind)
            .ok_or_else(|| RegistryError::Unknown {
                category: "environment",
                kind: spec.kind.clone(),
            })?;
        ctor(&spec.params).map_err(|source| RegistryError::Construction {
            category: "environment",
            kind: spec.kind.clone(),
            source,
        })
    }

    pub fn build_agent(
        &self,
        spec: &AgentSpec,
        bus: &Arc<EventBus>,
    ) -> Result<Arc<dyn DecisionAgent>, RegistryError> {
        let ctor = self
            .agents
            .get(&spec.component.kind)
            .ok_or_else(|| RegistryError::Unknown {
                category: "agent",
                kind: spec.component.kind.clone(),
            })?;
        ctor(&spec.id, &spec.component.params, bus).map_err(|source| {
            RegistryError::Construction {
                category: "agent",
                kind: spec.component.kind.clone(),
                source,
            }
        })
    }

    pub fn build_defense(
        &self,
        spec: &ComponentSpec,
        bus: &Arc<EventBus>,
    ) -> Result<Box<dyn Defense>, RegistryError> {
        let ctor = self
            .defenses
            .get(&spec.kind)
            .ok_or_else(|| RegistryError::Unknown {
                category: "defense",
                kind: spec.kind.clone(),
            })?;
        ctor(&spec.params, bus).map_err(|source| RegistryError::Construction {
            category: "defense",
            kind: spec.kind.clone(),
            source,
        })
    }

    pub fn build_referee(
        &self,
        spec: &ComponentSpec,
        bus: &Arc<EventBus>,
    ) -> Result<Box<dyn Referee>, RegistryError> {
        let ctor = self
            .referees
            .get(&spec.kind)
            .ok_or_else(|| RegistryError::Unknown {
                category: "referee",
                kind: spec.kind.clone(),
            })?;
        ctor(&spec.params, bus).map_err(|source| RegistryError::Construction {
            category: "referee",
            kind: spec.kind.clone(),
            source,
        })
    }
}

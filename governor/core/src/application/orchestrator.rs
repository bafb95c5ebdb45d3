// Copyright (c) 2026 Safety Governor contributors
// SPDX-License-Identifier: Apache-2.0
//! Episode orchestrator.
//!
//! Drives the reset/step loop for one seed: an optional bounded
//! communication phase, concurrent action collection with per-agent fault
//! isolation, the environment transition, then defenses and referees.
//! Agent failures are absorbed (fallback action); environment failures are
//! fatal and propagate.
//!
//! # State machine
//!
//! ```text
//! INIT -> (COMMUNICATING <-> ACTING -> TRANSITIONING -> MONITORING)* -> TERMINAL
//! ```
//!
//! Determinism: for a fixed seed, fixed agent decision functions, and a
//! fixed environment, rewards and final returns are reproducible. Actions
//! are merged into an ordered map before the transition, so wall-clock
//! completion order of the concurrent calls never reaches the environment.
//! Communication-round *content* may still vary run to run when agents
//! react to timing; that is accepted and documented.

use chrono::Utc;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::registry::{AgentSpec, ComponentRegistry, ComponentSpec, RegistryError};
use crate::application::streaming::{EpisodeEvent, MessagePreview};
use crate::domain::agent::{Action, AgentId, DecisionAgent, EnvState};
use crate::domain::environment::{ActionMap, EnvironmentError};
use crate::domain::events::GovernorEvent;
use crate::domain::message::{CommStatistics, Message};
use crate::domain::monitor::Violation;
use crate::infrastructure::comm::{CommConfig, CommunicationManager, MessageCallback};
use crate::infrastructure::event_bus::EventBus;

/// Configuration for the per-step communication phase.
#[derive(Debug, Clone)]
pub struct CommPhaseConfig {
    pub enabled: bool,
    /// Sequential rounds per step.
    pub max_rounds: u32,
    /// Budget per round; stragglers are abandoned, not failed.
    pub timeout_per_round: Duration,
    /// Pause between rounds.
    pub round_delay: Duration,
}

impl Default for CommPhaseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_rounds: 3,
            timeout_per_round: Duration::from_secs(30),
            round_delay: Duration::from_millis(100),
        }
    }
}

#[derive(Clone)]
pub struct EpisodeConfig {
    pub max_steps: u64,
    /// Budget for one round of concurrent action collection.
    pub action_timeout: Duration,
    /// Substituted when an agent fails or times out.
    pub fallback_action: Action,
    pub communication: CommPhaseConfig,
    pub comm: CommConfig,
    pub environment: ComponentSpec,
    pub agents: Vec<AgentSpec>,
    pub defenses: Vec<ComponentSpec>,
    pub referees: Vec<ComponentSpec>,
}

impl EpisodeConfig {
    pub fn new(environment: ComponentSpec, agents: Vec<AgentSpec>) -> Self {
        Self {
            max_steps: 100,
            action_timeout: Duration::from_secs(60),
            fallback_action: Action(0),
            communication: CommPhaseConfig::default(),
            comm: CommConfig::default(),
            environment,
            agents,
            defenses: Vec::new(),
            referees: Vec::new(),
        }
    }

    fn validate(&self) -> Result<(), EpisodeError> {
        if self.agents.is_empty() {
            return Err(EpisodeError::Configuration(
                "at least one agent is required".to_string(),
            ));
        }
        if self.max_steps == 0 {
            return Err(EpisodeError::Configuration(
                "max_steps must be positive".to_string(),
            ));
        }
        let mut ids: Vec<_> = self.agents.iter().map(|a| &a.id).collect();
        ids.sort();
        ids.dedup();
        if ids.len() != self.agents.len() {
            return Err(EpisodeError::Configuration(
                "duplicate agent ids in configuration".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum EpisodeError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("environment failure: {0}")]
    Environment(#[from] EnvironmentError),

    #[error("episode task aborted: {0}")]
    Aborted(String),
}

/// Final aggregate of one episode.
#[derive(Debug, Clone)]
pub struct EpisodeOutcome {
    pub seed: u64,
    pub steps: u64,
    pub returns: BTreeMap<AgentId, f64>,
    pub statistics: CommStatistics,
}

pub struct EpisodeOrchestrator {
    config: EpisodeConfig,
    registry: Arc<ComponentRegistry>,
    bus: Arc<EventBus>,
    comm: Arc<CommunicationManager>,
    shutdown: CancellationToken,
}

impl EpisodeOrchestrator {
    pub fn new(
        config: EpisodeConfig,
        registry: Arc<ComponentRegistry>,
        bus: Arc<EventBus>,
    ) -> Result<Self, EpisodeError> {
        config.validate()?;
        let comm = Arc::new(CommunicationManager::new(config.comm.clone(), bus.clone()));
        info!(
            agents = config.agents.len(),
            max_steps = config.max_steps,
            communication = config.communication.enabled,
            "initialized orchestrator"
        );
        Ok(Self {
            config,
            registry,
            bus,
            comm,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn comm(&self) -> &Arc<CommunicationManager> {
        &self.comm
    }

    /// Cooperative shutdown signal, observed at the top of each step.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run one episode per seed, sequentially. Returns one outcome per
    /// seed, each keyed by all configured agent ids.
    pub async fn run(&self, seeds: &[u64]) -> Result<Vec<EpisodeOutcome>, EpisodeError> {
        let mut outcomes = Vec::with_capacity(seeds.len());
        for &seed in seeds {
            outcomes.push(self.run_episode(seed).await?);
        }
        Ok(outcomes)
    }

    pub async fn run_episode(&self, seed: u64) -> Result<EpisodeOutcome, EpisodeError> {
        self.run_episode_inner(seed, None).await
    }

    pub(crate) async fn run_episode_inner(
        &self,
        seed: u64,
        sink: Option<&mpsc::Sender<EpisodeEvent>>,
    ) -> Result<EpisodeOutcome, EpisodeError> {
        // INIT: build components fresh for this seed.
        let mut env = self.registry.build_environment(&self.config.environment)?;
        let mut agents: BTreeMap<AgentId, Arc<dyn DecisionAgent>> = BTreeMap::new();
        for spec in &self.config.agents {
            agents.insert(spec.id.clone(), self.registry.build_agent(spec, &self.bus)?);
        }
        let mut defenses = Vec::with_capacity(self.config.defenses.len());
        for spec in &self.config.defenses {
            defenses.push(self.registry.build_defense(spec, &self.bus)?);
        }
        let mut referees = Vec::with_capacity(self.config.referees.len());
        for spec in &self.config.referees {
            referees.push(self.registry.build_referee(spec, &self.bus)?);
        }

        for spec in &self.config.agents {
            let agent = &agents[&spec.id];
            let callback = agent
                .communicator()
                .is_some()
                .then(|| delivery_callback(agent.clone()));
            self.comm
                .register_agent(spec.id.clone(), callback, &spec.groups);
        }

        let reset = env.reset(Some(seed));
        let (mut observation, mut info) = match reset {
            Ok(pair) => pair,
            Err(e) => {
                self.unregister_all();
                return Err(e.into());
            }
        };
        let mut returns: BTreeMap<AgentId, f64> =
            agents.keys().map(|id| (id.clone(), 0.0)).collect();

        self.send_event(
            sink,
            EpisodeEvent::Init {
                seed,
                agents: agents.keys().cloned().collect(),
                observation: observation.clone(),
            },
        )
        .await;

        info!(seed, "episode started");

        let mut step: u64 = 0;
        while step < self.config.max_steps {
            if self.shutdown.is_cancelled() {
                info!(seed, step, "shutdown requested, ending episode");
                break;
            }

            // COMMUNICATING
            if self.config.communication.enabled {
                let state = EnvState {
                    observation: observation.clone(),
                    step,
                };
                let messages = self.run_communication_phase(&agents, state).await;
                self.publish_event(GovernorEvent::CommunicationPhaseComplete {
                    step,
                    message_count: messages.len(),
                    completed_at: Utc::now(),
                });
                self.send_event(
                    sink,
                    EpisodeEvent::Communication {
                        step,
                        message_count: messages.len(),
                        messages: messages
                            .iter()
                            .rev()
                            .take(5)
                            .map(MessagePreview::of)
                            .collect(),
                    },
                )
                .await;
            }

            // ACTING
            let actions = self.collect_actions(&agents, &observation, &info).await;

            // TRANSITIONING: environment failure is fatal.
            let transition = match env.step(&actions) {
                Ok(t) => t,
                Err(e) => {
                    warn!(seed, step, error = %e, "environment failed, aborting episode");
                    self.unregister_all();
                    return Err(e.into());
                }
            };

            // MONITORING: defenses first (may mutate the environment),
            // then referees, both in registration order.
            let mut interventions = Vec::new();
            for defense in &mut defenses {
                interventions.extend(defense.inspect(&actions, env.as_mut()));
            }

            let mut violations: BTreeMap<String, Vec<Violation>> = BTreeMap::new();
            for referee in &mut referees {
                let found = referee.check_violations(&actions, &transition.observation, env.as_ref());
                self.publish_event(GovernorEvent::RefereeViolations {
                    referee: referee.name().to_string(),
                    step,
                    violations: found.clone(),
                });
                if !found.is_empty() {
                    violations.insert(referee.name().to_string(), found);
                }
            }

            for (id, reward) in &transition.rewards {
                *returns.entry(id.clone()).or_insert(0.0) += reward;
            }
            let done = transition.terminated || transition.truncated;

            self.publish_event(GovernorEvent::StepComplete {
                step,
                actions: actions.clone(),
                rewards: transition.rewards.clone(),
                returns: returns.clone(),
                interventions: interventions.clone(),
                violations: violations.clone(),
                done,
                completed_at: Utc::now(),
            });
            self.send_event(
                sink,
                EpisodeEvent::Step {
                    step,
                    actions,
                    rewards: transition.rewards,
                    observation: transition.observation.clone(),
                    interventions,
                    violations,
                    done,
                    returns: returns.clone(),
                },
            )
            .await;

            observation = transition.observation;
            info = transition.info;
            step += 1;

            if done {
                break;
            }
        }

        // TERMINAL
        self.unregister_all();
        let statistics = self.comm.get_statistics();
        self.publish_event(GovernorEvent::EpisodeComplete {
            seed,
            steps: step,
            returns: returns.clone(),
            statistics: statistics.clone(),
            completed_at: Utc::now(),
        });
        self.send_event(
            sink,
            EpisodeEvent::Complete {
                seed,
                steps: step,
                returns: returns.clone(),
                statistics: statistics.clone(),
            },
        )
        .await;

        info!(seed, steps = step, "episode complete");
        Ok(EpisodeOutcome {
            seed,
            steps: step,
            returns,
            statistics,
        })
    }

    /// Concurrent action collection. Every agent's call is bounded by the
    /// same wall-clock budget; a failure or timeout yields the fallback
    /// action for that agent only.
    async fn collect_actions(
        &self,
        agents: &BTreeMap<AgentId, Arc<dyn DecisionAgent>>,
        observation: &serde_json::Value,
        info: &serde_json::Value,
    ) -> ActionMap {
        let budget = self.config.action_timeout;
        let tasks = agents.iter().map(|(id, agent)| {
            let id = id.clone();
            let agent = agent.clone();
            let observation = observation.clone();
            let info = info.clone();
            async move {
                let result =
                    tokio::time::timeout(budget, agent.decide(&observation, &info)).await;
                (id, result)
            }
        });

        let mut actions = ActionMap::new();
        for (id, result) in join_all(tasks).await {
            let action = match result {
                Ok(Ok(action)) => action,
                Ok(Err(e)) => {
                    warn!(agent_id = %id, error = %e, "agent decision failed, using fallback");
                    self.config.fallback_action
                }
                Err(_) => {
                    warn!(
                        agent_id = %id,
                        budget = ?budget,
                        "agent decision timed out, using fallback"
                    );
                    self.config.fallback_action
                }
            };
            actions.insert(id, action);
        }
        actions
    }

    /// Up to `max_rounds` sequential communication rounds. A round that
    /// exceeds its budget is abandoned; the episode continues.
    async fn run_communication_phase(
        &self,
        agents: &BTreeMap<AgentId, Arc<dyn DecisionAgent>>,
        state: EnvState,
    ) -> Vec<Message> {
        let cfg = &self.config.communication;
        let communicators: Vec<(AgentId, Arc<dyn DecisionAgent>)> = agents
            .iter()
            .filter(|(_, agent)| agent.communicator().is_some())
            .map(|(id, agent)| (id.clone(), agent.clone()))
            .collect();
        if communicators.is_empty() {
            return Vec::new();
        }

        let mut all_messages = Vec::new();
        for comm_round in 0..cfg.max_rounds {
            debug!(step = state.step, comm_round, "communication round");
            let round_start = Utc::now();

            for (_, agent) in &communicators {
                if let Some(c) = agent.communicator() {
                    c.clear_received();
                }
            }

            let tasks = communicators.iter().map(|(id, agent)| {
                let id = id.clone();
                let agent = agent.clone();
                let state = state.clone();
                let comm = self.comm.clone();
                async move {
                    let result = match agent.communicator() {
                        Some(c) => c.communicate(&*comm, &state, state.step, comm_round).await,
                        None => Ok(()),
                    };
                    (id, result)
                }
            });

            match tokio::time::timeout(cfg.timeout_per_round, join_all(tasks)).await {
                Ok(results) => {
                    for (id, result) in results {
                        if let Err(e) = result {
                            warn!(agent_id = %id, comm_round, error = %e, "communication failed");
                        }
                    }
                }
                Err(_) => {
                    warn!(
                        comm_round,
                        budget = ?cfg.timeout_per_round,
                        "communication round timed out, abandoning stragglers"
                    );
                }
            }

            all_messages.extend(self.comm.get_message_history(
                None,
                None,
                Some(round_start),
                Some(1000),
            ));

            if !cfg.round_delay.is_zero() {
                tokio::time::sleep(cfg.round_delay).await;
            }
        }
        all_messages
    }

    fn unregister_all(&self) {
        for spec in &self.config.agents {
            self.comm.unregister_agent(&spec.id);
        }
    }

    /// Telemetry publication never aborts an episode: a fail-fast bus
    /// error is logged here and surfaced only to direct `publish` callers.
    fn publish_event(&self, event: GovernorEvent) {
        if let Err(e) = self.bus.publish(event) {
            warn!(error = %e, "event publication failed");
        }
    }

    async fn send_event(&self, sink: Option<&mpsc::Sender<EpisodeEvent>>, event: EpisodeEvent) {
        if let Some(tx) = sink {
            // A consumer that stopped listening is not an episode failure.
            let _ = tx.send(event).await;
        }
    }
}

fn delivery_callback(agent: Arc<dyn DecisionAgent>) -> MessageCallback {
    Arc::new(move |message| {
        let agent = agent.clone();
        Box::pin(async move {
            match agent.communicator() {
                Some(c) => c.on_message(message).await,
                None => Ok(()),
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::environment::{Environment, Transition};
    use crate::domain::events::EventKind;
    use crate::domain::message::MessageSender;
    use crate::domain::monitor::{Defense, Intervention};
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    /// Pays each agent its own action value every step.
    struct PayoutEnv {
        agent_ids: Vec<AgentId>,
        max_steps: u64,
        t: u64,
    }

    impl PayoutEnv {
        fn new(agent_ids: &[&str], max_steps: u64) -> Self {
            Self {
                agent_ids: agent_ids.iter().map(|s| AgentId::from(*s)).collect(),
                max_steps,
                t: 0,
            }
        }
    }

    impl Environment for PayoutEnv {
        fn reset(&mut self, _seed: Option<u64>) -> Result<(Value, Value), EnvironmentError> {
            self.t = 0;
            Ok((json!({ "step": 0 }), Value::Null))
        }

        fn step(&mut self, actions: &ActionMap) -> Result<Transition, EnvironmentError> {
            self.t += 1;
            let rewards = self
                .agent_ids
                .iter()
                .map(|id| {
                    let action = actions.get(id).copied().unwrap_or_default();
                    (id.clone(), action.0 as f64)
                })
                .collect();
            Ok(Transition {
                observation: json!({ "step": self.t }),
                rewards,
                terminated: self.t >= self.max_steps,
                truncated: false,
                info: Value::Null,
            })
        }

        fn agent_ids(&self) -> Vec<AgentId> {
            self.agent_ids.clone()
        }
    }

    struct BrokenEnv;

    impl Environment for BrokenEnv {
        fn reset(&mut self, _seed: Option<u64>) -> Result<(Value, Value), EnvironmentError> {
            Ok((Value::Null, Value::Null))
        }

        fn step(&mut self, _actions: &ActionMap) -> Result<Transition, EnvironmentError> {
            Err(EnvironmentError::Internal("world is broken".to_string()))
        }

        fn agent_ids(&self) -> Vec<AgentId> {
            Vec::new()
        }
    }

    struct ConstAgent(Action);

    #[async_trait::async_trait]
    impl DecisionAgent for ConstAgent {
        async fn decide(&self, _obs: &Value, _info: &Value) -> anyhow::Result<Action> {
            Ok(self.0)
        }
    }

    struct SlowAgent {
        delay: Duration,
        action: Action,
    }

    #[async_trait::async_trait]
    impl DecisionAgent for SlowAgent {
        async fn decide(&self, _obs: &Value, _info: &Value) -> anyhow::Result<Action> {
            tokio::time::sleep(self.delay).await;
            Ok(self.action)
        }
    }

    struct FailingAgent;

    #[async_trait::async_trait]
    impl DecisionAgent for FailingAgent {
        async fn decide(&self, _obs: &Value, _info: &Value) -> anyhow::Result<Action> {
            anyhow::bail!("backend unavailable")
        }
    }

    /// Broadcasts a greeting once per communication round.
    struct GreeterAgent {
        id: AgentId,
        received: Mutex<Vec<Message>>,
    }

    #[async_trait::async_trait]
    impl DecisionAgent for GreeterAgent {
        async fn decide(&self, _obs: &Value, _info: &Value) -> anyhow::Result<Action> {
            Ok(Action(1))
        }

        fn communicator(&self) -> Option<&dyn crate::domain::agent::Communicating> {
            Some(self)
        }
    }

    #[async_trait::async_trait]
    impl crate::domain::agent::Communicating for GreeterAgent {
        async fn communicate(
            &self,
            comm: &dyn MessageSender,
            _state: &EnvState,
            round_num: u64,
            comm_round: u32,
        ) -> anyhow::Result<()> {
            comm.broadcast(
                &self.id,
                json!({ "greeting": "hello", "round": round_num, "comm_round": comm_round }),
                &[],
            )
            .await?;
            Ok(())
        }

        async fn on_message(&self, message: Message) -> anyhow::Result<()> {
            self.received.lock().push(message);
            Ok(())
        }

        fn clear_received(&self) {
            self.received.lock().clear();
        }
    }

    /// Answers promptly but never finishes a communication round.
    struct StallingTalker {
        action: Action,
    }

    #[async_trait::async_trait]
    impl DecisionAgent for StallingTalker {
        async fn decide(&self, _obs: &Value, _info: &Value) -> anyhow::Result<Action> {
            Ok(self.action)
        }

        fn communicator(&self) -> Option<&dyn crate::domain::agent::Communicating> {
            Some(self)
        }
    }

    #[async_trait::async_trait]
    impl crate::domain::agent::Communicating for StallingTalker {
        async fn communicate(
            &self,
            _comm: &dyn MessageSender,
            _state: &EnvState,
            _round_num: u64,
            _comm_round: u32,
        ) -> anyhow::Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }

        async fn on_message(&self, _message: Message) -> anyhow::Result<()> {
            Ok(())
        }

        fn clear_received(&self) {}
    }

    /// Communication capability that always errors.
    struct BrokenTalker {
        action: Action,
    }

    #[async_trait::async_trait]
    impl DecisionAgent for BrokenTalker {
        async fn decide(&self, _obs: &Value, _info: &Value) -> anyhow::Result<Action> {
            Ok(self.action)
        }

        fn communicator(&self) -> Option<&dyn crate::domain::agent::Communicating> {
            Some(self)
        }
    }

    #[async_trait::async_trait]
    impl crate::domain::agent::Communicating for BrokenTalker {
        async fn communicate(
            &self,
            _comm: &dyn MessageSender,
            _state: &EnvState,
            _round_num: u64,
            _comm_round: u32,
        ) -> anyhow::Result<()> {
            anyhow::bail!("radio down")
        }

        async fn on_message(&self, _message: Message) -> anyhow::Result<()> {
            Ok(())
        }

        fn clear_received(&self) {}
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn test_registry() -> ComponentRegistry {
        let mut registry = ComponentRegistry::new();
        registry.register_environment("payout", |params| {
            let max_steps = params["max_steps"].as_u64().unwrap_or(3);
            Ok(Box::new(PayoutEnv::new(&["firm_a", "firm_b"], max_steps)))
        });
        registry.register_environment("broken", |_| Ok(Box::new(BrokenEnv)));
        registry.register_agent("const", |_, params, _| {
            let action = Action(params["action"].as_i64().unwrap_or(0));
            Ok(Arc::new(ConstAgent(action)))
        });
        registry.register_agent("slow", |_, params, _| {
            let delay = Duration::from_millis(params["delay_ms"].as_u64().unwrap_or(5000));
            let action = Action(params["action"].as_i64().unwrap_or(9));
            Ok(Arc::new(SlowAgent { delay, action }))
        });
        registry.register_agent("failing", |_, _, _| Ok(Arc::new(FailingAgent)));
        registry.register_agent("greeter", |id, _, _| {
            Ok(Arc::new(GreeterAgent {
                id: id.clone(),
                received: Mutex::new(Vec::new()),
            }))
        });
        registry.register_agent("stalling_talker", |_, params, _| {
            let action = Action(params["action"].as_i64().unwrap_or(1));
            Ok(Arc::new(StallingTalker { action }))
        });
        registry.register_agent("broken_talker", |_, params, _| {
            let action = Action(params["action"].as_i64().unwrap_or(1));
            Ok(Arc::new(BrokenTalker { action }))
        });
        registry
    }

    fn quiet_comm_phase() -> CommPhaseConfig {
        CommPhaseConfig {
            enabled: false,
            ..CommPhaseConfig::default()
        }
    }

    fn base_config(agents: Vec<AgentSpec>) -> EpisodeConfig {
        let mut config = EpisodeConfig::new(
            ComponentSpec::new("payout", json!({ "max_steps": 3 })),
            agents,
        );
        config.communication = quiet_comm_phase();
        config
    }

    fn orchestrator(config: EpisodeConfig) -> EpisodeOrchestrator {
        EpisodeOrchestrator::new(config, Arc::new(test_registry()), Arc::new(EventBus::new()))
            .unwrap()
    }

    #[tokio::test]
    async fn returns_accumulate_per_agent() {
        let config = base_config(vec![
            AgentSpec::new("firm_a", ComponentSpec::new("const", json!({ "action": 2 }))),
            AgentSpec::new("firm_b", ComponentSpec::new("const", json!({ "action": 5 }))),
        ]);
        let orch = orchestrator(config);

        let outcome = orch.run_episode(7).await.unwrap();
        assert_eq!(outcome.steps, 3);
        assert_eq!(outcome.returns[&AgentId::from("firm_a")], 6.0);
        assert_eq!(outcome.returns[&AgentId::from("firm_b")], 15.0);
    }

    #[tokio::test]
    async fn run_yields_one_outcome_per_seed() {
        let config = base_config(vec![
            AgentSpec::new("firm_a", ComponentSpec::new("const", json!({ "action": 1 }))),
            AgentSpec::new("firm_b", ComponentSpec::new("const", json!({ "action": 1 }))),
        ]);
        let orch = orchestrator(config);

        let outcomes = orch.run(&[1, 2, 3, 4]).await.unwrap();
        assert_eq!(outcomes.len(), 4);
        for outcome in &outcomes {
            assert_eq!(outcome.returns.len(), 2);
            assert!(outcome
                .returns
                .values()
                .all(|r| *r >= 0.0));
        }
    }

    #[tokio::test]
    async fn same_seed_reproduces_returns() {
        let config = base_config(vec![
            AgentSpec::new("firm_a", ComponentSpec::new("const", json!({ "action": 4 }))),
            AgentSpec::new("firm_b", ComponentSpec::new("const", json!({ "action": 3 }))),
        ]);
        let orch = orchestrator(config);

        let first = orch.run_episode(42).await.unwrap();
        let second = orch.run_episode(42).await.unwrap();
        assert_eq!(first.returns, second.returns);
        assert_eq!(first.steps, second.steps);
    }

    #[tokio::test]
    async fn timed_out_agent_gets_fallback_others_keep_actions() {
        let mut config = base_config(vec![
            AgentSpec::new("firm_a", ComponentSpec::new("const", json!({ "action": 3 }))),
            AgentSpec::new(
                "firm_b",
                ComponentSpec::new("slow", json!({ "delay_ms": 5000, "action": 9 })),
            ),
        ]);
        config.action_timeout = Duration::from_millis(50);
        let bus = Arc::new(EventBus::new());
        let seen_actions = Arc::new(Mutex::new(Vec::new()));
        let sink = seen_actions.clone();
        bus.subscribe(EventKind::StepComplete, move |event| {
            if let GovernorEvent::StepComplete { actions, .. } = event {
                sink.lock().push(actions.clone());
            }
            Ok(())
        });
        let orch = EpisodeOrchestrator::new(config, Arc::new(test_registry()), bus).unwrap();

        let outcome = orch.run_episode(0).await.unwrap();
        assert_eq!(outcome.steps, 3);

        let steps = seen_actions.lock();
        for actions in steps.iter() {
            assert_eq!(actions[&AgentId::from("firm_a")], Action(3));
            assert_eq!(actions[&AgentId::from("firm_b")], Action(0)); // fallback
        }
    }

    #[tokio::test]
    async fn failing_agent_gets_fallback_without_aborting() {
        let config = base_config(vec![
            AgentSpec::new("firm_a", ComponentSpec::bare("failing")),
            AgentSpec::new("firm_b", ComponentSpec::new("const", json!({ "action": 2 }))),
        ]);
        let orch = orchestrator(config);

        let outcome = orch.run_episode(0).await.unwrap();
        assert_eq!(outcome.returns[&AgentId::from("firm_a")], 0.0);
        assert_eq!(outcome.returns[&AgentId::from("firm_b")], 6.0);
    }

    #[tokio::test]
    async fn environment_failure_is_fatal_and_unregisters_agents() {
        let mut config = base_config(vec![AgentSpec::new(
            "firm_a",
            ComponentSpec::new("const", json!({ "action": 1 })),
        )]);
        config.environment = ComponentSpec::bare("broken");
        let orch = orchestrator(config);

        let result = orch.run_episode(0).await;
        assert!(matches!(result, Err(EpisodeError::Environment(_))));
        assert!(orch.comm().registered_agents().is_empty());
    }

    #[tokio::test]
    async fn shutdown_flag_ends_episode_at_step_boundary() {
        let config = base_config(vec![
            AgentSpec::new("firm_a", ComponentSpec::new("const", json!({ "action": 1 }))),
            AgentSpec::new("firm_b", ComponentSpec::new("const", json!({ "action": 1 }))),
        ]);
        let orch = orchestrator(config);
        orch.shutdown_token().cancel();

        let outcome = orch.run_episode(0).await.unwrap();
        assert_eq!(outcome.steps, 0);
        assert!(outcome.returns.values().all(|r| *r == 0.0));
    }

    #[tokio::test]
    async fn communication_phase_delivers_between_agents() {
        let mut config = base_config(vec![
            AgentSpec::new("firm_a", ComponentSpec::bare("greeter")),
            AgentSpec::new("firm_b", ComponentSpec::bare("greeter")),
        ]);
        config.max_steps = 1;
        config.communication = CommPhaseConfig {
            enabled: true,
            max_rounds: 2,
            timeout_per_round: Duration::from_secs(5),
            round_delay: Duration::ZERO,
        };
        let orch = orchestrator(config);

        let outcome = orch.run_episode(0).await.unwrap();
        // 2 greeters x 2 rounds x 1 step
        assert_eq!(outcome.statistics.messages_sent, 4);
        assert_eq!(outcome.statistics.broadcast_count, 4);
        assert_eq!(outcome.statistics.messages_delivered, 4);
    }

    #[tokio::test]
    async fn stalled_communication_round_is_abandoned_not_fatal() {
        init_tracing();
        let mut config = base_config(vec![
            AgentSpec::new(
                "firm_a",
                ComponentSpec::new("stalling_talker", json!({ "action": 2 })),
            ),
            AgentSpec::new("firm_b", ComponentSpec::new("const", json!({ "action": 5 }))),
        ]);
        config.communication = CommPhaseConfig {
            enabled: true,
            max_rounds: 2,
            timeout_per_round: Duration::from_millis(20),
            round_delay: Duration::ZERO,
        };
        let orch = orchestrator(config);

        let outcome = orch.run_episode(0).await.unwrap();
        // Every round times out, yet all steps run and actions survive.
        assert_eq!(outcome.steps, 3);
        assert_eq!(outcome.returns[&AgentId::from("firm_a")], 6.0);
        assert_eq!(outcome.returns[&AgentId::from("firm_b")], 15.0);
        assert_eq!(outcome.statistics.messages_sent, 0);
    }

    #[tokio::test]
    async fn failing_communicator_does_not_abort_the_episode() {
        init_tracing();
        let mut config = base_config(vec![
            AgentSpec::new(
                "firm_a",
                ComponentSpec::new("broken_talker", json!({ "action": 3 })),
            ),
            AgentSpec::new("firm_b", ComponentSpec::bare("greeter")),
        ]);
        config.communication = CommPhaseConfig {
            enabled: true,
            max_rounds: 1,
            timeout_per_round: Duration::from_secs(5),
            round_delay: Duration::ZERO,
        };
        let orch = orchestrator(config);

        let outcome = orch.run_episode(0).await.unwrap();
        assert_eq!(outcome.steps, 3);
        assert_eq!(outcome.returns[&AgentId::from("firm_a")], 9.0);
        // The healthy communicator's broadcasts still go through.
        assert_eq!(outcome.statistics.messages_sent, 3);
    }

    #[tokio::test]
    async fn fail_fast_bus_handler_error_does_not_abort_the_episode() {
        init_tracing();
        let bus = Arc::new(EventBus::with_policy(true));
        bus.subscribe(EventKind::StepComplete, |_| anyhow::bail!("sink offline"));
        let config = base_config(vec![
            AgentSpec::new("firm_a", ComponentSpec::new("const", json!({ "action": 2 }))),
            AgentSpec::new("firm_b", ComponentSpec::new("const", json!({ "action": 2 }))),
        ]);
        let orch = EpisodeOrchestrator::new(config, Arc::new(test_registry()), bus).unwrap();

        let outcome = orch.run_episode(0).await.unwrap();
        assert_eq!(outcome.steps, 3);
        assert_eq!(outcome.returns[&AgentId::from("firm_a")], 6.0);
    }

    #[tokio::test]
    async fn defenses_run_in_registration_order() {
        struct TaggingDefense {
            tag: &'static str,
            log: Arc<Mutex<Vec<&'static str>>>,
        }

        impl Defense for TaggingDefense {
            fn name(&self) -> &str {
                self.tag
            }

            fn inspect(
                &mut self,
                _actions: &ActionMap,
                _env: &mut dyn Environment,
            ) -> Vec<Intervention> {
                self.log.lock().push(self.tag);
                Vec::new()
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = test_registry();
        let log_a = log.clone();
        registry.register_defense("first", move |_, _| {
            Ok(Box::new(TaggingDefense {
                tag: "first",
                log: log_a.clone(),
            }))
        });
        let log_b = log.clone();
        registry.register_defense("second", move |_, _| {
            Ok(Box::new(TaggingDefense {
                tag: "second",
                log: log_b.clone(),
            }))
        });

        let mut config = base_config(vec![
            AgentSpec::new("firm_a", ComponentSpec::new("const", json!({ "action": 1 }))),
            AgentSpec::new("firm_b", ComponentSpec::new("const", json!({ "action": 1 }))),
        ]);
        config.max_steps = 1;
        config.defenses = vec![ComponentSpec::bare("first"), ComponentSpec::bare("second")];
        let orch =
            EpisodeOrchestrator::new(config, Arc::new(registry), Arc::new(EventBus::new()))
                .unwrap();

        orch.run_episode(0).await.unwrap();
        assert_eq!(*log.lock(), vec!["first", "second"]);
    }

    #[test]
    fn empty_agent_list_is_rejected() {
        let config = EpisodeConfig::new(ComponentSpec::bare("payout"), Vec::new());
        let result =
            EpisodeOrchestrator::new(config, Arc::new(test_registry()), Arc::new(EventBus::new()));
        assert!(matches!(result, Err(EpisodeError::Configuration(_))));
    }

    #[test]
    fn duplicate_agent_ids_are_rejected() {
        let config = EpisodeConfig::new(
            ComponentSpec::bare("payout"),
            vec![
                AgentSpec::new("firm_a", ComponentSpec::bare("failing")),
                AgentSpec::new("firm_a", ComponentSpec::bare("failing")),
            ],
        );
        let result =
            EpisodeOrchestrator::new(config, Arc::new(test_registry()), Arc::new(EventBus::new()));
        assert!(matches!(result, Err(EpisodeError::Configuration(_))));
    }
}

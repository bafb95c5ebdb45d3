// Copyright (c) 2026 Safety Governor contributors
// SPDX-License-Identifier: Apache-2.0
//! Reference arena: a two-firm price game with scripted agents, a
//! collusion referee and a resetting governor defense.
//!
//! Everything here is deterministic and exists to exercise the core
//! orchestration pipeline end to end. [`register_defaults`] wires all
//! component kinds into a registry.

pub mod agents;
pub mod defenses;
pub mod environment;
pub mod referees;

pub use agents::{BlockingDecisionFn, ChattyAgent, FixedPriceAgent, TitForTatAgent};
pub use defenses::HierarchicalGovernor;
pub use environment::PriceGameEnv;
pub use referees::CollusionReferee;

use governor_core::application::ComponentRegistry;

/// Register every arena component under its symbolic kind.
pub fn register_defaults(registry: &mut ComponentRegistry) {
    registry.register_environment("price_game", |params| {
        Ok(Box::new(PriceGameEnv::from_params(params)?))
    });
    registry.register_agent("fixed_price", |_, params, _| {
        Ok(std::sync::Arc::new(FixedPriceAgent::from_params(params)))
    });
    registry.register_agent("tit_for_tat", |id, params, _| {
        Ok(std::sync::Arc::new(TitForTatAgent::from_params(id, params)))
    });
    registry.register_agent("chatty", |id, params, _| {
        Ok(std::sync::Arc::new(ChattyAgent::from_params(id, params)))
    });
    registry.register_defense("hierarchical_governor", |_, bus| {
        Ok(Box::new(HierarchicalGovernor::new(bus)))
    });
    registry.register_referee("simple_collusion", |params, bus| {
        Ok(Box::new(CollusionReferee::from_params(params, bus)))
    });
}

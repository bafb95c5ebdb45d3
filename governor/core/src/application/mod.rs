// Copyright (c) 2026 Safety Governor contributors
// SPDX-License-Identifier: Apache-2.0

pub mod orchestrator;
pub mod registry;
pub mod streaming;

pub use orchestrator::{
    CommPhaseConfig, EpisodeConfig, EpisodeError, EpisodeOrchestrator, EpisodeOutcome,
};
pub use registry::{AgentSpec, ComponentRegistry, ComponentSpec, RegistryError};
pub use streaming::{BlockingEpisodeStream, EpisodeEvent, EpisodeStream, MessagePreview};

// Copyright (c) 2026 Safety Governor contributors
// SPDX-License-Identifier: Apache-2.0
//! Core runtime for coordinating autonomous agents in a repeated
//! price-setting game.
//!
//! # Architecture
//!
//! - **Domain:** messages, capability traits, events
//! - **Application:** episode orchestration, streaming, component registry
//! - **Infrastructure:** communication manager, event bus

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;

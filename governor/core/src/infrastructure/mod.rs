// Copyright (c) 2026 Safety Governor contributors
// SPDX-License-Identifier: Apache-2.0

pub mod comm;
pub mod event_bus;

pub use comm::{CommConfig, CommunicationManager, MessageCallback, Middleware};
pub use event_bus::EventBus;

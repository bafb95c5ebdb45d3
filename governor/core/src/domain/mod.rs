// Copyright (c) 2026 Safety Governor contributors
// SPDX-License-Identifier: Apache-2.0

pub mod agent;
pub mod environment;
pub mod events;
pub mod message;
pub mod monitor;

pub use agent::{Action, AgentId, Communicating, DecisionAgent, EnvState};
pub use environment::{ActionMap, Environment, EnvironmentError, Transition};
pub use events::{EventKind, GovernorEvent};
pub use message::{
    AckStatus, CommError, CommStatistics, ContentFilter, Message, MessageAck, MessageDraft,
    MessageFilter, MessageId, MessagePriority, MessageSender, MessageType, SendOutcome,
};
pub use monitor::{Defense, Intervention, Referee, Violation};

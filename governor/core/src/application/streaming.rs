// Copyright (c) 2026 Safety Governor contributors
// SPDX-License-Identifier: Apache-2.0
//! Streaming episode execution.
//!
//! [`EpisodeOrchestrator::run_episode_stream`] runs an episode on a
//! background task and yields lifecycle events over a bounded channel as
//! the episode progresses, so dashboards and live tooling can observe
//! steps without waiting for the final outcome. The event sequence for a
//! normal episode is `Init`, then per step an optional `Communication`
//! followed by `Step`, and finally `Complete`.

use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::application::orchestrator::{EpisodeError, EpisodeOrchestrator, EpisodeOutcome};
use crate::domain::agent::{Action, AgentId};
use crate::domain::message::{CommStatistics, Message};
use crate::domain::monitor::{Intervention, Violation};

const CHANNEL_CAPACITY: usize = 32;
const CONTENT_PREVIEW_LEN: usize = 100;

/// Lifecycle event emitted during a streamed episode.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EpisodeEvent {
    Init {
        seed: u64,
        agents: Vec<AgentId>,
        observation: serde_json::Value,
    },
    Communication {
        step: u64,
        message_count: usize,
        /// Most recent messages of the phase, newest first.
        messages: Vec<MessagePreview>,
    },
    Step {
        step: u64,
        actions: BTreeMap<AgentId, Action>,
        rewards: BTreeMap<AgentId, f64>,
        observation: serde_json::Value,
        interventions: Vec<Intervention>,
        violations: BTreeMap<String, Vec<Violation>>,
        done: bool,
        returns: BTreeMap<AgentId, f64>,
    },
    Complete {
        seed: u64,
        steps: u64,
        returns: BTreeMap<AgentId, f64>,
        statistics: CommStatistics,
    },
}

/// Truncated view of a message, sized for live display.
#[derive(Debug, Clone, Serialize)]
pub struct MessagePreview {
    pub sender: AgentId,
    pub recipients: Vec<AgentId>,
    pub message_type: String,
    pub content_preview: String,
}

impl MessagePreview {
    pub fn of(message: &Message) -> Self {
        let rendered = message.content.to_string();
        let content_preview = if rendered.len() > CONTENT_PREVIEW_LEN {
            let mut cut = CONTENT_PREVIEW_LEN;
            while !rendered.is_char_boundary(cut) {
                cut -= 1;
            }
            format!("{}...", &rendered[..cut])
        } else {
            rendered
        };
        Self {
            sender: message.sender.clone(),
            recipients: message.recipients.clone(),
            message_type: message.message_type.as_str().to_string(),
            content_preview,
        }
    }
}

/// Handle to an episode running on a background task.
///
/// Dropping the stream before [`join`](Self::join) aborts the episode
/// task; the environment and agents are dropped wherever the task was,
/// and no terminal events are published for it.
pub struct EpisodeStream {
    rx: mpsc::Receiver<EpisodeEvent>,
    handle: Option<JoinHandle<Result<EpisodeOutcome, EpisodeError>>>,
}

impl EpisodeStream {
    /// Next event, or `None` once the episode task has finished and the
    /// channel is drained.
    pub async fn next_event(&mut self) -> Option<EpisodeEvent> {
        self.rx.recv().await
    }

    /// Drain any remaining events and wait for the final outcome.
    pub async fn join(mut self) -> Result<EpisodeOutcome, EpisodeError> {
        while self.rx.recv().await.is_some() {}
        let handle = match self.handle.take() {
            Some(handle) => handle,
            None => return Err(EpisodeError::Aborted("episode already joined".to_string())),
        };
        match handle.await {
            Ok(result) => result,
            Err(e) => Err(EpisodeError::Aborted(e.to_string())),
        }
    }

    /// Adapter for synchronous consumers; iterates by blocking on the
    /// given runtime handle.
    pub fn blocking(self, runtime: tokio::runtime::Handle) -> BlockingEpisodeStream {
        BlockingEpisodeStream {
            inner: self,
            runtime,
        }
    }
}

impl Drop for EpisodeStream {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

pub struct BlockingEpisodeStream {
    inner: EpisodeStream,
    runtime: tokio::runtime::Handle,
}

impl BlockingEpisodeStream {
    pub fn join(self) -> Result<EpisodeOutcome, EpisodeError> {
        let runtime = self.runtime.clone();
        runtime.block_on(self.inner.join())
    }
}

impl Iterator for BlockingEpisodeStream {
    type Item = EpisodeEvent;

    fn next(&mut self) -> Option<EpisodeEvent> {
        self.runtime.block_on(self.inner.next_event())
    }
}

impl EpisodeOrchestrator {
    /// Start one episode on a background task and stream its lifecycle
    /// events. Backpressure from a slow consumer pauses the episode at
    /// the emission point rather than dropping events.
    pub fn run_episode_stream(self: std::sync::Arc<Self>, seed: u64) -> EpisodeStream {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let handle = tokio::spawn(async move {
            self.run_episode_inner(seed, Some(&tx)).await
        });
        EpisodeStream {
            rx,
            handle: Some(handle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::message::{MessageId, MessagePriority, MessageType};
    use serde_json::json;
    use std::collections::HashMap;

    fn preview_message(content: serde_json::Value) -> Message {
        Message {
            id: MessageId::new(),
            sender: AgentId::from("alpha"),
            recipients: vec![AgentId::from("beta")],
            message_type: MessageType::Broadcast,
            content,
            metadata: HashMap::new(),
            timestamp: chrono::Utc::now(),
            priority: MessagePriority::Normal,
            requires_ack: false,
            reply_to: None,
        }
    }

    #[test]
    fn short_content_is_not_truncated() {
        let message = preview_message(json!({ "note": "hi" }));
        let preview = MessagePreview::of(&message);
        assert_eq!(preview.content_preview, r#"{"note":"hi"}"#);
        assert_eq!(preview.message_type, "broadcast");
    }

    #[test]
    fn long_content_is_truncated_with_ellipsis() {
        let message = preview_message(json!({ "note": "x".repeat(500) }));
        let preview = MessagePreview::of(&message);
        assert!(preview.content_preview.len() <= CONTENT_PREVIEW_LEN + 3);
        assert!(preview.content_preview.ends_with("..."));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let message = preview_message(json!({ "note": "é".repeat(300) }));
        let preview = MessagePreview::of(&message);
        assert!(preview.content_preview.ends_with("..."));
    }
}

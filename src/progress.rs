//! Per-request progress channel.
//!
//! The producer (the resolver, or a tool wrapping it) holds a [`ProgressSender`]; the
//! response layer drains the matching [`ProgressReceiver`], either directly or as one
//! source of the stream multiplexer.

use std::time::Duration;

use futures::StreamExt;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::model::ResourceCard;
use crate::multiplex::EventSource;
use crate::streaming::StreamEvent;
use crate::telemetry::unix_secs_f64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressKind {
    ToolProgress,
    Resource,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub kind: ProgressKind,
    pub tool_name: String,
    pub step: String,
    pub message: String,
    pub percent: u8,
    pub payload: Value,
    pub timestamp: f64,
}

impl ProgressEvent {
    pub fn milestone(
        tool_name: &str,
        step: &str,
        message: impl Into<String>,
        percent: u8,
        payload: Value,
    ) -> Self {
        Self {
            kind: ProgressKind::ToolProgress,
            tool_name: tool_name.to_string(),
            step: step.to_string(),
            message: message.into(),
            percent: percent.min(100),
            payload,
            timestamp: unix_secs_f64(),
        }
    }

    pub fn resources(tool_name: &str, cards: &[ResourceCard]) -> Self {
        Self {
            kind: ProgressKind::Resource,
            tool_name: tool_name.to_string(),
            step: "resources".to_string(),
            message: format!("{} resources", cards.len()),
            percent: 100,
            payload: json!({ "resources": cards }),
            timestamp: unix_secs_f64(),
        }
    }

    /// The `payload.reason` of a terminal warning milestone, if any.
    pub fn reason(&self) -> Option<&str> {
        self.payload.get("reason").and_then(Value::as_str)
    }
}

impl From<ProgressEvent> for StreamEvent {
    fn from(event: ProgressEvent) -> Self {
        match event.kind {
            ProgressKind::ToolProgress => StreamEvent::ToolProgress {
                tool_name: event.tool_name,
                step: event.step,
                message: event.message,
                progress: event.percent,
                data: event.payload,
                timestamp: event.timestamp,
            },
            ProgressKind::Resource => {
                let resources = event
                    .payload
                    .get("resources")
                    .cloned()
                    .and_then(|value| serde_json::from_value::<Vec<ResourceCard>>(value).ok())
                    .unwrap_or_default();
                StreamEvent::Resource {
                    count: resources.len(),
                    resources,
                    timestamp: event.timestamp,
                }
            }
        }
    }
}

/// How long the progress source waits for new events before treating itself as exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdlePolicy {
    pub poll_interval: Duration,
    pub max_idle_polls: u32,
}

impl Default for IdlePolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            max_idle_polls: 50,
        }
    }
}

impl IdlePolicy {
    pub fn idle_budget(&self) -> Duration {
        self.poll_interval * self.max_idle_polls
    }
}

#[derive(Debug)]
pub enum Pop {
    Event(ProgressEvent),
    Timeout,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ProgressSender {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

#[derive(Debug)]
pub struct ProgressReceiver {
    rx: mpsc::UnboundedReceiver<ProgressEvent>,
}

pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ProgressSender { tx }, ProgressReceiver { rx })
}

impl ProgressSender {
    /// Never blocks. Events pushed after the receiver is gone are dropped.
    pub fn push(&self, event: ProgressEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("progress receiver dropped, discarding event");
        }
    }

    pub fn milestone(&self, tool_name: &str, step: &str, message: impl Into<String>, percent: u8) {
        self.push(ProgressEvent::milestone(
            tool_name,
            step,
            message,
            percent,
            Value::Null,
        ));
    }

    pub fn warning(&self, tool_name: &str, reason: &str, message: impl Into<String>) {
        self.push(ProgressEvent::milestone(
            tool_name,
            "warning",
            message,
            100,
            json!({ "reason": reason }),
        ));
    }

    pub fn resources(&self, tool_name: &str, cards: &[ResourceCard]) {
        self.push(ProgressEvent::resources(tool_name, cards));
    }
}

impl ProgressReceiver {
    pub async fn pop_with_timeout(&mut self, timeout: Duration) -> Pop {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(event)) => Pop::Event(event),
            Ok(None) => Pop::Closed,
            Err(_) => Pop::Timeout,
        }
    }

    /// Everything queued right now, without waiting.
    pub fn drain(&mut self) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Turns the receiver into a multiplexer source that ends when the channel closes or
    /// after `policy.max_idle_polls` consecutive empty polls.
    pub fn into_event_source(self, policy: IdlePolicy) -> EventSource {
        let mut receiver = self;
        async_stream::stream! {
            let mut idle_polls = 0u32;
            loop {
                match receiver.pop_with_timeout(policy.poll_interval).await {
                    Pop::Event(event) => {
                        idle_polls = 0;
                        yield Ok::<_, anyhow::Error>(StreamEvent::from(event));
                    }
                    Pop::Timeout => {
                        idle_polls += 1;
                        if idle_polls >= policy.max_idle_polls {
                            tracing::debug!(idle_polls, "progress source idle, closing");
                            break;
                        }
                    }
                    Pop::Closed => break,
                }
            }
        }
        .boxed()
    }
}

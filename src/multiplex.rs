//! Fan-in of several event sources into one outbound sequence.
//!
//! Each source runs in its own forwarding task and relays into a shared queue tagged
//! with its index, so the merged order is the order in which events became available.
//! Source 0 is the primary: once it has finished and a single secondary source is left,
//! the merge stops and cancels the remaining forwarders instead of waiting them out.
//! Before cancelling, whatever the secondaries can still deliver without waiting is
//! flushed downstream.

use std::collections::VecDeque;

use anyhow::Result;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::streaming::StreamEvent;

pub type EventSource = BoxStream<'static, Result<StreamEvent>>;

pub const PRIMARY_SOURCE: usize = 0;

/// Scheduler yields spent flushing secondaries before an early stop.
const FLUSH_ROUNDS: usize = 8;

#[derive(Debug)]
enum Relay {
    Event(usize, StreamEvent),
    Finished(usize),
}

struct Forwarders(Vec<JoinHandle<()>>);

impl Forwarders {
    async fn shutdown(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
        for handle in self.0.drain(..) {
            if let Err(err) = handle.await
                && !err.is_cancelled()
            {
                tracing::warn!(error = %err, "event source forwarder panicked");
            }
        }
    }
}

impl Drop for Forwarders {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

struct MergeState {
    rx: mpsc::UnboundedReceiver<Relay>,
    forwarders: Forwarders,
    active: usize,
    primary_done: bool,
    flushed: VecDeque<StreamEvent>,
    closing: bool,
}

impl MergeState {
    /// Lets woken forwarders run and collects every event they relay without blocking.
    /// Stops after a round that relays nothing.
    async fn flush_secondaries(&mut self) {
        for _ in 0..FLUSH_ROUNDS {
            tokio::task::yield_now().await;
            let before = self.flushed.len();
            while let Ok(relay) = self.rx.try_recv() {
                if let Relay::Event(_, event) = relay {
                    self.flushed.push_back(event);
                }
            }
            if self.flushed.len() == before {
                break;
            }
        }
    }
}

fn spawn_forwarder(
    index: usize,
    mut source: EventSource,
    tx: mpsc::UnboundedSender<Relay>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(item) = source.next().await {
            match item {
                Ok(event) => {
                    if tx.send(Relay::Event(index, event)).is_err() {
                        return;
                    }
                }
                Err(err) => {
                    tracing::warn!(source = index, error = %format!("{err:#}"), "event source failed");
                    let _ = tx.send(Relay::Event(index, StreamEvent::error(format!("{err:#}"))));
                    break;
                }
            }
        }
        let _ = tx.send(Relay::Finished(index));
    })
}

/// Merges `sources` into one stream. Must be polled inside a tokio runtime.
pub fn merge_sources(sources: Vec<EventSource>) -> impl Stream<Item = StreamEvent> + Send + 'static {
    let (tx, rx) = mpsc::unbounded_channel();
    let active = sources.len();
    let handles = sources
        .into_iter()
        .enumerate()
        .map(|(index, source)| spawn_forwarder(index, source, tx.clone()))
        .collect::<Vec<_>>();
    drop(tx);

    let state = MergeState {
        rx,
        forwarders: Forwarders(handles),
        active,
        primary_done: false,
        flushed: VecDeque::new(),
        closing: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.flushed.pop_front() {
                return Some((event, state));
            }
            if state.closing {
                return None;
            }
            if state.active == 0 {
                state.forwarders.shutdown().await;
                return None;
            }

            match state.rx.recv().await {
                Some(Relay::Event(index, event)) => {
                    tracing::debug!(source = index, kind = event.kind(), "relaying event");
                    return Some((event, state));
                }
                Some(Relay::Finished(index)) => {
                    state.active = state.active.saturating_sub(1);
                    if index == PRIMARY_SOURCE {
                        state.primary_done = true;
                    }
                    if state.primary_done && state.active == 1 {
                        state.flush_secondaries().await;
                        tracing::debug!(
                            flushed = state.flushed.len(),
                            "primary source finished, cancelling secondary sources"
                        );
                        state.forwarders.shutdown().await;
                        state.closing = true;
                    }
                }
                None => {
                    state.forwarders.shutdown().await;
                    return None;
                }
            }
        }
    })
}

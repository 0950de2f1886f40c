//! Runs a [`LogStream`] on tokio.
//!
//! One task owns the stream, the poll interval and every in-flight fetch.
//! Inputs arrive over an mpsc channel; snapshots leave through a watch
//! channel after each event.

use std::future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, warn};

use super::{FetchCommand, LogStream, ScrollMetrics, SnapshotStamp, StreamSnapshot, Ticket};
use crate::opstail_core::Filters;
use crate::opstail_protocol::{FetchError, LogSource, Page};

#[derive(Debug, Clone)]
pub enum StreamInput {
    Scroll(ScrollMetrics),
    FetchMore,
    SetFilters(Filters),
    SetLive(bool),
    Shutdown,
}

#[derive(Debug, Error)]
#[error("stream driver has stopped")]
pub struct DriverStopped;

/// Renderer-side handle to a running driver.
pub struct StreamHandle {
    inputs: mpsc::UnboundedSender<StreamInput>,
    snapshots: watch::Receiver<StreamSnapshot>,
    task: JoinHandle<()>,
}

impl StreamHandle {
    pub fn scroll(&self, metrics: ScrollMetrics) -> Result<(), DriverStopped> {
        self.send(StreamInput::Scroll(metrics))
    }

    pub fn fetch_more(&self) -> Result<(), DriverStopped> {
        self.send(StreamInput::FetchMore)
    }

    pub fn set_filters(&self, filters: Filters) -> Result<(), DriverStopped> {
        self.send(StreamInput::SetFilters(filters))
    }

    pub fn set_live(&self, live: bool) -> Result<(), DriverStopped> {
        self.send(StreamInput::SetLive(live))
    }

    pub fn snapshots(&self) -> watch::Receiver<StreamSnapshot> {
        self.snapshots.clone()
    }

    pub fn snapshot(&self) -> StreamSnapshot {
        self.snapshots.borrow().clone()
    }

    pub async fn shutdown(self) {
        let _ = self.inputs.send(StreamInput::Shutdown);
        if let Err(error) = self.task.await {
            warn!(%error, "stream driver task failed");
        }
    }

    fn send(&self, input: StreamInput) -> Result<(), DriverStopped> {
        self.inputs.send(input).map_err(|_| DriverStopped)
    }
}

type FetchResult = (Ticket, Result<Page, FetchError>);

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct StreamDriver<S: LogSource + ?Sized> {
    source: Arc<S>,
    stream: LogStream,
    in_flight: JoinSet<FetchResult>,
    /// Interval plus the generation it was started for.
    poller: Option<(u64, Interval)>,
    snapshots: watch::Sender<StreamSnapshot>,
    published: Option<SnapshotStamp>,
}

impl<S: LogSource + ?Sized> StreamDriver<S> {
    /// Mounts `stream` and runs it on a new task.
    pub fn spawn(source: Arc<S>, stream: LogStream) -> StreamHandle {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(stream.snapshot());
        let driver = Self { source, stream, in_flight: JoinSet::new(), poller: None, snapshots: snapshot_tx, published: None };
        let task = tokio::spawn(driver.run(input_rx));
        StreamHandle { inputs: input_tx, snapshots: snapshot_rx, task }
    }

    async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<StreamInput>) {
        let commands = self.stream.mount();
        self.dispatch(commands);
        self.sync_poller();
        self.publish();

        loop {
            tokio::select! {
                input = inputs.recv() => {
                    let Some(input) = input else { break };
                    if !self.handle_input(input) {
                        break;
                    }
                }
                Some(joined) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    match joined {
                        Ok((ticket, result)) => {
                            let (completion, follow_up) = self.stream.on_fetch_complete(ticket, result);
                            debug!(?completion, id = ticket.id, "fetch completed");
                            self.dispatch(follow_up);
                        }
                        Err(error) if error.is_cancelled() => {}
                        Err(error) => warn!(%error, "fetch task failed"),
                    }
                }
                _ = next_tick(&mut self.poller) => {
                    if let Some(command) = self.stream.on_poll_tick() {
                        self.dispatch(vec![command]);
                    }
                }
            }
            self.sync_poller();
            self.publish();
        }

        self.in_flight.abort_all();
        debug!(generation = self.stream.generation(), "stream driver stopped");
    }

    fn handle_input(&mut self, input: StreamInput) -> bool {
        let commands = match input {
            StreamInput::Scroll(metrics) => self.stream.on_scroll(metrics),
            StreamInput::FetchMore => self.stream.fetch_more().into_iter().collect(),
            StreamInput::SetFilters(filters) => {
                let generation = self.stream.generation();
                let commands = self.stream.set_filters(filters);
                if self.stream.generation() != generation {
                    self.in_flight.abort_all();
                }
                commands
            }
            StreamInput::SetLive(live) => self.stream.set_live(live),
            StreamInput::Shutdown => return false,
        };
        self.dispatch(commands);
        true
    }

    fn dispatch(&mut self, commands: Vec<FetchCommand>) {
        for FetchCommand { ticket, filters, request } in commands {
            debug!(id = ticket.id, purpose = ?ticket.purpose, anchor = ?request.anchor, "dispatching fetch");
            let source = Arc::clone(&self.source);
            self.in_flight.spawn(async move {
                let result = source.fetch(&filters, request).await;
                (ticket, result)
            });
        }
    }

    fn sync_poller(&mut self) {
        let generation = self.stream.generation();
        if !self.stream.poll_due() {
            if self.poller.take().is_some() {
                debug!(generation, "live poller stopped");
            }
            return;
        }
        if matches!(&self.poller, Some((started_for, _)) if *started_for == generation) {
            return;
        }
        let period = self.stream.config().poll_interval.max(MIN_POLL_INTERVAL);
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.poller = Some((generation, interval));
        debug!(generation, period_ms = period.as_millis() as u64, "live poller started");
    }

    fn publish(&mut self) {
        let stamp = self.stream.snapshot_stamp();
        if self.published.as_ref() == Some(&stamp) {
            return;
        }
        self.published = Some(stamp);
        self.snapshots.send_replace(self.stream.snapshot());
    }
}

async fn next_tick(poller: &mut Option<(u64, Interval)>) {
    match poller {
        Some((_, interval)) => {
            interval.tick().await;
        }
        None => future::pending().await,
    }
}

//! High-level drivers: serve producers on a stream, or download one or more
//! resources from it into files.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use segline_core::{
    Batch, ChunkConsumer, ConsumerEvent, Name, PartFile, ProducerRegistry, TransferError,
    TransportAdapter, TransportEvent,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::bridge::BridgeTransport;
use crate::config::Config;

/// How a download request ended without error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Completed,
    /// Another process holds the segment table at this path.
    InProgressElsewhere(PathBuf),
}

/// Answer inbound requests from `registry` until the peer closes the stream.
/// Requests no producer matches are dropped; the requester sees a timeout.
pub async fn serve<S>(stream: S, registry: &mut ProducerRegistry, config: &Config) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut transport, mut events) = BridgeTransport::spawn(stream, config.request_timeout());
    info!(producers = registry.len(), "serving");
    while let Some(event) = events.recv().await {
        let TransportEvent::Request { name } = event else {
            continue;
        };
        match registry.dispatch(&name) {
            Some(response) => transport.respond(response),
            None => {
                warn!(%name, "no producer, request dropped");
                transport.discard_inbound(&name);
            }
        }
    }
    info!("peer closed, serving stopped");
    Ok(())
}

fn open_consumer(
    name: &Name,
    path: &Path,
    config: &Config,
) -> anyhow::Result<Result<ChunkConsumer<PartFile>, PathBuf>> {
    match ChunkConsumer::open(name.clone(), path, config.consumer_options()) {
        Ok(c) => Ok(Ok(c.with_resize_policy(config.resize_policy()))),
        Err(TransferError::ConcurrentDownload(table)) => {
            info!(%name, table = %table.display(), "download already in progress elsewhere");
            Ok(Err(table))
        }
        Err(e) => Err(e).with_context(|| format!("opening download of {} into {}", name, path.display())),
    }
}

fn report(name: &Name, events: Vec<ConsumerEvent>) {
    for event in events {
        match event {
            ConsumerEvent::Progress { completed, total } => {
                debug!(%name, completed, total, "progress")
            }
            ConsumerEvent::Timeout { segment } => debug!(%name, ?segment, "request timed out"),
            ConsumerEvent::Nack { segment } => debug!(%name, segment, "segment not available yet"),
            ConsumerEvent::Complete => info!(%name, "download complete"),
        }
    }
}

/// Ticks once per request timeout; NACKed segments are asked for again at most
/// this often.
fn nack_retry_timer(config: &Config) -> Interval {
    let period = config.request_timeout();
    let mut timer = tokio::time::interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

/// Download `name` into `path`, resuming from `<path>.sgt` when possible.
pub async fn download<S>(
    stream: S,
    name: Name,
    path: impl AsRef<Path>,
    config: &Config,
) -> anyhow::Result<DownloadOutcome>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let path = path.as_ref();
    let mut consumer = match open_consumer(&name, path, config)? {
        Ok(c) => c,
        Err(table) => return Ok(DownloadOutcome::InProgressElsewhere(table)),
    };
    let (mut transport, mut events) = BridgeTransport::spawn(stream, config.request_timeout());

    let started = consumer
        .start(&mut transport)
        .with_context(|| format!("starting download of {}", name))?;
    report(&name, started);

    let mut retry = nack_retry_timer(config);
    while !consumer.is_finished() {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = retry.tick() => {
                if consumer.is_stalled() {
                    let out = consumer
                        .retry_nacked(&mut transport)
                        .with_context(|| format!("retrying {}", name))?;
                    report(&name, out);
                }
                continue;
            }
        };
        let Some(event) = event else {
            bail!("connection closed before {} completed", name);
        };
        if let TransportEvent::Request { name: inbound } = &event {
            transport.discard_inbound(inbound);
            continue;
        }
        let out = consumer
            .handle_event(&mut transport, event)
            .with_context(|| format!("downloading {}", name))?;
        report(&name, out);
    }
    Ok(DownloadOutcome::Completed)
}

/// Download several resources over one stream. Outcomes are in input order.
pub async fn download_many<S>(
    stream: S,
    items: Vec<(Name, PathBuf)>,
    config: &Config,
) -> anyhow::Result<Vec<DownloadOutcome>>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut outcomes = Vec::with_capacity(items.len());
    let mut consumers: Vec<(usize, ChunkConsumer<PartFile>)> = Vec::new();
    for (i, (name, path)) in items.iter().enumerate() {
        match open_consumer(name, path, config)? {
            Ok(c) => {
                outcomes.push(DownloadOutcome::Completed);
                consumers.push((i, c));
            }
            Err(table) => outcomes.push(DownloadOutcome::InProgressElsewhere(table)),
        }
    }

    let mut batch = Batch::new(consumers.iter().map(|(i, _)| *i));
    if batch.start() {
        return Ok(outcomes);
    }

    let (mut transport, mut events) = BridgeTransport::spawn(stream, config.request_timeout());
    for (i, consumer) in consumers.iter_mut() {
        let out = consumer
            .start(&mut transport)
            .with_context(|| format!("starting download of {}", items[*i].0))?;
        finish_member(&mut batch, *i, consumer, out);
    }

    let mut retry = nack_retry_timer(config);
    while !batch.is_complete() {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = retry.tick() => {
                for (i, consumer) in consumers.iter_mut().filter(|(_, c)| c.is_stalled()) {
                    let out = consumer
                        .retry_nacked(&mut transport)
                        .with_context(|| format!("retrying {}", items[*i].0))?;
                    finish_member(&mut batch, *i, consumer, out);
                }
                continue;
            }
        };
        let Some(event) = event else {
            bail!(
                "connection closed with {} of {} downloads unfinished",
                batch.remaining(),
                batch.total()
            );
        };
        let request = match &event {
            TransportEvent::Request { name } => {
                transport.discard_inbound(name);
                continue;
            }
            TransportEvent::Response { request, .. } | TransportEvent::Timeout { request, .. } => {
                request.clone()
            }
        };
        let Some((i, consumer)) = consumers
            .iter_mut()
            .filter(|(_, c)| c.name().is_prefix_of(&request))
            .max_by_key(|(_, c)| c.name().len())
        else {
            debug!(%request, "event for unknown download");
            continue;
        };
        let out = consumer
            .handle_event(&mut transport, event)
            .with_context(|| format!("downloading {}", items[*i].0))?;
        finish_member(&mut batch, *i, consumer, out);
    }
    info!(count = batch.total(), "batch complete");
    Ok(outcomes)
}

fn finish_member(
    batch: &mut Batch<usize>,
    index: usize,
    consumer: &ChunkConsumer<PartFile>,
    events: Vec<ConsumerEvent>,
) {
    let done = events.contains(&ConsumerEvent::Complete);
    report(consumer.name(), events);
    if done {
        batch.mark_complete(&index);
    }
}

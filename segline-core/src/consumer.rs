//! Consumer side: pipelined, resumable fetch of one resource.
//!
//! The consumer owns no I/O loop. The host calls [`ChunkConsumer::start`] once and
//! then feeds every [`TransportEvent`] for this consumer into
//! [`ChunkConsumer::handle_event`]; each call returns the events it produced.
//!
//! Per segment: `Unsent -> Outgoing -> Complete`, with timeouts and unusable
//! responses moving `Outgoing` back to `Unsent`. A NACKed segment is parked: it
//! stays `Unsent` but is not requested again until the host calls
//! [`ChunkConsumer::retry_nacked`]. Payload is written before the
//! segment is marked complete, and the table is persisted after every completion,
//! so the table on disk never claims more than the destination holds.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::chunk::{self, DEFAULT_CHUNK_SIZE};
use crate::destination::{Destination, PartFile};
use crate::integrity;
use crate::name::Name;
use crate::protocol::{Reply, Response};
use crate::scheduler;
use crate::segments::{self, SegmentState, SegmentTable, SegmentTableError, MAX_SEGMENTS};
use crate::transport::{RequestHandle, TransportAdapter, TransportEvent};

pub const DEFAULT_PIPELINE_DEPTH: u32 = 5;

const RENDER_WIDTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerOptions {
    pub chunk_size: u64,
    /// Maximum concurrent requests; at least 1.
    pub pipeline_depth: u32,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            pipeline_depth: DEFAULT_PIPELINE_DEPTH,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for the first response to learn the final segment.
    Initializing,
    Fetching,
    Complete,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerEvent {
    Progress { completed: u64, total: u64 },
    Complete,
    /// Diagnostic only; the segment has already been rescheduled.
    /// `None` is the initial bare-name request.
    Timeout { segment: Option<u64> },
    /// The producer had no data for an in-range segment; it is parked.
    Nack { segment: u64 },
}

/// Decides whether a producer may report a larger final segment mid-transfer.
/// A smaller one is always a mismatch.
pub trait ResizePolicy: Send {
    fn allow_growth(&self, known: i64, reported: i64) -> bool;
}

/// Final segment is fixed once learned.
#[derive(Debug, Clone, Copy, Default)]
pub struct Strict;

impl ResizePolicy for Strict {
    fn allow_growth(&self, _known: i64, _reported: i64) -> bool {
        false
    }
}

/// Extend the table in place when the resource grows.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowGrowth;

impl ResizePolicy for AllowGrowth {
    fn allow_growth(&self, known: i64, reported: i64) -> bool {
        reported > known
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("final segment changed from {expected} to {reported}")]
    FinalSegmentMismatch { expected: i64, reported: i64 },
    #[error("{} is already being downloaded", .0.display())]
    ConcurrentDownload(PathBuf),
    #[error("transfer I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<SegmentTableError> for TransferError {
    fn from(e: SegmentTableError) -> Self {
        match e {
            SegmentTableError::ConcurrentDownload(path) => TransferError::ConcurrentDownload(path),
            SegmentTableError::Io(e) => TransferError::Io(e),
            SegmentTableError::Corrupt(msg) => {
                TransferError::Io(io::Error::new(io::ErrorKind::InvalidData, msg))
            }
        }
    }
}

pub struct ChunkConsumer<D> {
    name: Name,
    qualified_name: Option<Name>,
    chunk_size: u64,
    pipeline_depth: u32,
    destination: D,
    table: Option<SegmentTable>,
    final_segment: Option<i64>,
    segments: Vec<SegmentState>,
    num_outstanding: u32,
    num_complete: usize,
    /// No `Unsent` segment lies below this index.
    scan_from: usize,
    /// Outstanding requests; `None` marks the initial bare-name request.
    in_flight: HashMap<RequestHandle, Option<usize>>,
    /// `Unsent` segments the producer NACKed; skipped by the scheduler.
    nacked: HashSet<usize>,
    /// Exact resource length, once the final segment has been written.
    data_len: Option<u64>,
    phase: Phase,
    resize: Box<dyn ResizePolicy>,
    preallocated: bool,
}

impl ChunkConsumer<PartFile> {
    /// Consumer writing to `path` through `<path>.part`, resumable through `<path>.sgt`.
    ///
    /// Fails with [`TransferError::ConcurrentDownload`] when another process holds
    /// the table lock. A table whose partial file is gone is ignored.
    pub fn open(
        name: Name,
        path: impl AsRef<Path>,
        options: ConsumerOptions,
    ) -> Result<Self, TransferError> {
        let path = path.as_ref();
        let table = SegmentTable::open(SegmentTable::path_for(path))?;
        let destination = PartFile::create(path)?;
        let resumable = destination.resumable();
        if !resumable {
            debug!(path = %path.display(), "no partial file, starting from scratch");
        }
        Self::build(name, destination, Some(table), options, resumable)
    }
}

impl<D: Destination> ChunkConsumer<D> {
    /// Consumer for `name` writing into `destination`. A readable, non-empty
    /// `table` resumes the transfer; a corrupt one is discarded.
    pub fn new(
        name: Name,
        destination: D,
        table: Option<SegmentTable>,
        options: ConsumerOptions,
    ) -> Result<Self, TransferError> {
        Self::build(name, destination, table, options, true)
    }

    fn build(
        name: Name,
        destination: D,
        mut table: Option<SegmentTable>,
        options: ConsumerOptions,
        resume: bool,
    ) -> Result<Self, TransferError> {
        let mut consumer = Self {
            name: name.without_segment(),
            qualified_name: None,
            chunk_size: chunk::effective_chunk_size(options.chunk_size),
            pipeline_depth: options.pipeline_depth.max(1),
            destination,
            table: None,
            final_segment: None,
            segments: Vec::new(),
            num_outstanding: 0,
            num_complete: 0,
            scan_from: 0,
            in_flight: HashMap::new(),
            nacked: HashSet::new(),
            data_len: None,
            phase: Phase::Initializing,
            resize: Box::new(Strict),
            preallocated: false,
        };

        if let (true, Some(t)) = (resume, table.as_mut()) {
            match t.read() {
                Ok(persisted) if !persisted.is_empty() => {
                    consumer.num_complete = scheduler::count(&persisted, SegmentState::Complete);
                    consumer.final_segment = Some(persisted.len() as i64 - 1);
                    consumer.segments = persisted;
                    consumer.phase = Phase::Fetching;
                    info!(
                        name = %consumer.name,
                        complete = consumer.num_complete,
                        total = consumer.segments.len(),
                        table = %segments::render(&consumer.segments, RENDER_WIDTH),
                        "resuming transfer"
                    );
                }
                Ok(_) => {}
                Err(SegmentTableError::Corrupt(reason)) => {
                    debug!(name = %consumer.name, reason, "discarding unreadable segment table");
                }
                Err(e) => return Err(e.into()),
            }
        }
        if consumer.final_segment.is_none() {
            consumer.destination.truncate(0)?;
        }
        consumer.table = table;
        Ok(consumer)
    }

    pub fn with_resize_policy(mut self, policy: Box<dyn ResizePolicy>) -> Self {
        self.resize = policy;
        self
    }

    pub fn name(&self) -> &Name {
        &self.name
    }

    /// Name learned from the first data response, version included.
    pub fn qualified_name(&self) -> Option<&Name> {
        self.qualified_name.as_ref()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.phase, Phase::Complete | Phase::Failed)
    }

    pub fn final_segment(&self) -> Option<i64> {
        self.final_segment
    }

    pub fn segments(&self) -> &[SegmentState] {
        &self.segments
    }

    pub fn num_outstanding(&self) -> u32 {
        self.num_outstanding
    }

    /// Nothing in flight and nothing schedulable: only parked segments remain.
    pub fn is_stalled(&self) -> bool {
        !self.is_finished()
            && self.final_segment.is_some()
            && self.num_outstanding == 0
            && !self.nacked.is_empty()
    }

    /// `(complete, total)`; total is 0 until the final segment is known.
    pub fn progress(&self) -> (u64, u64) {
        (self.num_complete as u64, self.segments.len() as u64)
    }

    pub fn destination(&self) -> &D {
        &self.destination
    }

    /// Issue the first requests: the bare name, or the missing segments of a
    /// resumed table.
    pub fn start<T: TransportAdapter>(
        &mut self,
        transport: &mut T,
    ) -> Result<Vec<ConsumerEvent>, TransferError> {
        let mut events = Vec::new();
        if self.is_finished() {
            return Ok(events);
        }
        info!(name = %self.name, resumed = self.final_segment.is_some(), "transfer started");
        let result = self.schedule(transport, &mut events);
        self.fail_on_error(transport, result)?;
        Ok(events)
    }

    /// Integrate one transport outcome. Inbound requests are not for consumers
    /// and are ignored, as is everything after the transfer has finished.
    pub fn handle_event<T: TransportAdapter>(
        &mut self,
        transport: &mut T,
        event: TransportEvent,
    ) -> Result<Vec<ConsumerEvent>, TransferError> {
        let mut events = Vec::new();
        if self.is_finished() {
            return Ok(events);
        }
        let result = match event {
            TransportEvent::Response {
                handle, response, ..
            } => self.on_response(transport, handle, response, &mut events),
            TransportEvent::Timeout { handle, .. } => self.on_timeout(transport, handle, &mut events),
            TransportEvent::Request { .. } => Ok(()),
        };
        self.fail_on_error(transport, result)?;
        Ok(events)
    }

    /// Cancel every outstanding request. The transfer can be restarted with
    /// [`ChunkConsumer::start`].
    pub fn cancel<T: TransportAdapter>(&mut self, transport: &mut T) {
        info!(name = %self.name, outstanding = self.num_outstanding, "transfer cancelled");
        self.cancel_all(transport);
    }

    /// Make NACKed segments schedulable again and request them. Hosts call this
    /// on their own timer; the consumer never retries a NACK by itself.
    pub fn retry_nacked<T: TransportAdapter>(
        &mut self,
        transport: &mut T,
    ) -> Result<Vec<ConsumerEvent>, TransferError> {
        let mut events = Vec::new();
        if self.is_finished() || self.nacked.is_empty() {
            return Ok(events);
        }
        debug!(name = %self.name, parked = self.nacked.len(), "retrying nacked segments");
        if let Some(lowest) = self.nacked.iter().min() {
            self.scan_from = self.scan_from.min(*lowest);
        }
        self.nacked.clear();
        let result = self.schedule(transport, &mut events);
        self.fail_on_error(transport, result)?;
        Ok(events)
    }

    fn fail_on_error<T: TransportAdapter>(
        &mut self,
        transport: &mut T,
        result: Result<(), TransferError>,
    ) -> Result<(), TransferError> {
        if let Err(e) = &result {
            warn!(name = %self.name, error = %e, "transfer failed");
            self.phase = Phase::Failed;
            self.cancel_all(transport);
        }
        result
    }

    fn cancel_all<T: TransportAdapter>(&mut self, transport: &mut T) {
        let drained: Vec<_> = self.in_flight.drain().collect();
        for (handle, slot) in drained {
            transport.cancel(handle);
            if let Some(n) = slot {
                self.release(n);
            }
        }
        self.num_outstanding = 0;
    }

    fn segment_name(&self, n: u64) -> Name {
        self.qualified_name
            .as_ref()
            .unwrap_or(&self.name)
            .with_segment(n)
    }

    /// Put an `Outgoing` segment back in line.
    fn release(&mut self, n: usize) {
        if let Some(state) = self.segments.get_mut(n) {
            if *state == SegmentState::Outgoing {
                *state = SegmentState::Unsent;
                self.scan_from = self.scan_from.min(n);
            }
        }
    }

    fn schedule<T: TransportAdapter>(
        &mut self,
        transport: &mut T,
        events: &mut Vec<ConsumerEvent>,
    ) -> Result<(), TransferError> {
        if self.final_segment.is_none() {
            if self.num_outstanding == 0 {
                let handle = transport.request(&self.name);
                debug!(name = %self.name, "requesting first segment");
                self.in_flight.insert(handle, None);
                self.num_outstanding += 1;
            }
            return Ok(());
        }

        let mut from = self.scan_from;
        while scheduler::free_slots(self.num_outstanding, self.pipeline_depth) > 0 {
            let Some(n) = scheduler::next_unsent(&self.segments, from) else {
                break;
            };
            from = n + 1;
            if self.nacked.contains(&n) {
                continue;
            }
            let name = self.segment_name(n as u64);
            let handle = transport.request(&name);
            debug!(%name, "segment requested");
            self.segments[n] = SegmentState::Outgoing;
            self.in_flight.insert(handle, Some(n));
            self.num_outstanding += 1;
        }
        self.scan_from = from;
        self.check_complete(transport, events)
    }

    fn on_timeout<T: TransportAdapter>(
        &mut self,
        transport: &mut T,
        handle: RequestHandle,
        events: &mut Vec<ConsumerEvent>,
    ) -> Result<(), TransferError> {
        let Some(slot) = self.in_flight.remove(&handle) else {
            return Ok(());
        };
        self.num_outstanding -= 1;
        if let Some(n) = slot {
            self.release(n);
        }
        debug!(
            name = %self.name,
            segment = ?slot,
            table = %segments::render(&self.segments, RENDER_WIDTH),
            "request timed out"
        );
        events.push(ConsumerEvent::Timeout {
            segment: slot.map(|n| n as u64),
        });
        self.schedule(transport, events)
    }

    fn on_response<T: TransportAdapter>(
        &mut self,
        transport: &mut T,
        handle: RequestHandle,
        response: Response,
        events: &mut Vec<ConsumerEvent>,
    ) -> Result<(), TransferError> {
        match self.in_flight.remove(&handle) {
            Some(slot) => {
                self.num_outstanding -= 1;
                if let Some(n) = slot {
                    self.release(n);
                }
            }
            None => debug!(name = %response.name, "response for untracked request"),
        }

        let Response {
            name,
            final_segment,
            meta,
            reply,
        } = response;

        if !(-1..MAX_SEGMENTS as i64).contains(&final_segment) {
            warn!(%name, final_segment, "ignoring response with impossible final segment");
            return self.schedule(transport, events);
        }
        if let Some(meta) = meta {
            if chunk::final_segment(meta.total_size, self.chunk_size) != final_segment {
                warn!(%name, total_size = meta.total_size, final_segment, "ignoring response with inconsistent size");
                return self.schedule(transport, events);
            }
        }

        match reply {
            Reply::Nack => {
                self.accept_final_segment(transport, final_segment)?;
                let parked = name
                    .segment()
                    .and_then(|n| usize::try_from(n).ok())
                    .filter(|n| self.segments.get(*n).is_some_and(|s| *s != SegmentState::Complete));
                match parked {
                    Some(n) => {
                        debug!(%name, final_segment, "segment not available, parked");
                        self.nacked.insert(n);
                        events.push(ConsumerEvent::Nack { segment: n as u64 });
                    }
                    None => debug!(%name, final_segment, "nack outside the table"),
                }
            }
            Reply::Data { payload, digest } => {
                let Some(n) = self.validate(&name, &payload, &digest, final_segment) else {
                    return self.schedule(transport, events);
                };
                self.accept_final_segment(transport, final_segment)?;
                if self.qualified_name.is_none() {
                    self.qualified_name = Some(name.without_segment());
                }
                if let Some(meta) = meta {
                    if !self.preallocated {
                        self.destination.preallocate(meta.total_size)?;
                        self.preallocated = true;
                    }
                }
                self.nacked.remove(&n);
                if self.segments[n] == SegmentState::Complete {
                    debug!(%name, "duplicate segment discarded");
                } else {
                    self.complete_segment(transport, n, &payload, events)?;
                }
            }
        }
        self.schedule(transport, events)
    }

    /// Check a reported final segment (already range-checked) against what is known.
    fn accept_final_segment<T: TransportAdapter>(
        &mut self,
        transport: &mut T,
        reported: i64,
    ) -> Result<(), TransferError> {
        match self.final_segment {
            None => {
                self.final_segment = Some(reported);
                self.segments = vec![SegmentState::Unsent; (reported + 1) as usize];
                self.phase = Phase::Fetching;
                info!(name = %self.name, final_segment = reported, "final segment learned");
                self.drop_bootstrap(transport);
                Ok(())
            }
            Some(known) if known == reported => Ok(()),
            Some(known) if reported > known && self.resize.allow_growth(known, reported) => {
                info!(name = %self.name, from = known, to = reported, "resource grew");
                self.segments
                    .resize((reported + 1) as usize, SegmentState::Unsent);
                self.final_segment = Some(reported);
                self.data_len = None;
                Ok(())
            }
            Some(known) => Err(TransferError::FinalSegmentMismatch {
                expected: known,
                reported,
            }),
        }
    }

    /// A bare-name request still in flight once the table exists would be
    /// counted as outstanding with no `Outgoing` segment behind it.
    fn drop_bootstrap<T: TransportAdapter>(&mut self, transport: &mut T) {
        let stale: Vec<_> = self
            .in_flight
            .iter()
            .filter(|(_, slot)| slot.is_none())
            .map(|(h, _)| *h)
            .collect();
        for handle in stale {
            self.in_flight.remove(&handle);
            self.num_outstanding -= 1;
            transport.cancel(handle);
        }
    }

    /// Index of the segment carried by a data response, or `None` when the
    /// response cannot be used.
    fn validate(
        &self,
        name: &Name,
        payload: &[u8],
        digest: &[u8; 32],
        final_segment: i64,
    ) -> Option<usize> {
        let Some(n) = name.segment() else {
            warn!(%name, "response without segment component");
            return None;
        };
        let Some(index) = i64::try_from(n).ok().filter(|i| *i <= final_segment) else {
            warn!(%name, final_segment, "segment beyond final segment");
            return None;
        };
        let len = payload.len() as u64;
        let bad_len = len == 0
            || len > self.chunk_size
            || (index < final_segment && len != self.chunk_size);
        if bad_len {
            warn!(%name, len, chunk_size = self.chunk_size, "segment has wrong length");
            return None;
        }
        if !integrity::verify(payload, digest) {
            warn!(%name, "segment digest mismatch");
            return None;
        }
        Some(index as usize)
    }

    fn complete_segment<T: TransportAdapter>(
        &mut self,
        transport: &mut T,
        n: usize,
        payload: &[u8],
        events: &mut Vec<ConsumerEvent>,
    ) -> Result<(), TransferError> {
        let offset = n as u64 * self.chunk_size;
        self.destination.write_at(offset, payload)?;
        if Some(n as i64) == self.final_segment {
            self.data_len = Some(offset + payload.len() as u64);
        }

        let stale = self
            .in_flight
            .iter()
            .find(|(_, slot)| **slot == Some(n))
            .map(|(h, _)| *h);
        if let Some(handle) = stale {
            self.in_flight.remove(&handle);
            self.num_outstanding -= 1;
            transport.cancel(handle);
        }

        self.segments[n] = SegmentState::Complete;
        self.num_complete += 1;
        if let Some(table) = self.table.as_mut() {
            table.write(&self.segments)?;
        }
        debug!(name = %self.name, segment = n, "segment complete");
        events.push(ConsumerEvent::Progress {
            completed: self.num_complete as u64,
            total: self.segments.len() as u64,
        });
        Ok(())
    }

    fn check_complete<T: TransportAdapter>(
        &mut self,
        transport: &mut T,
        events: &mut Vec<ConsumerEvent>,
    ) -> Result<(), TransferError> {
        if self.phase == Phase::Complete
            || self.final_segment.is_none()
            || self.num_complete < self.segments.len()
        {
            return Ok(());
        }
        self.cancel_all(transport);
        let exact_len = if self.segments.is_empty() {
            Some(0)
        } else {
            self.data_len
        };
        if let Some(len) = exact_len {
            self.destination.truncate(len)?;
        }
        self.destination.finalize()?;
        if let Some(table) = self.table.take() {
            if let Err(e) = table.close(true) {
                warn!(name = %self.name, error = %e, "removing segment table failed");
            }
        }
        self.phase = Phase::Complete;
        info!(
            name = %self.qualified_name.as_ref().unwrap_or(&self.name),
            segments = self.segments.len(),
            "transfer complete"
        );
        events.push(ConsumerEvent::Complete);
        Ok(())
    }
}

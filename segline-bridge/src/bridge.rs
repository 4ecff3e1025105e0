//! Stream transport: carries segline packets over any byte stream (Unix socket,
//! pipe, TCP, in-memory duplex) using the core's length-prefixed wire codec.
//!
//! Both ends may request and serve. Outcomes and inbound requests are delivered on
//! the event channel returned by [`BridgeTransport::spawn`]; the channel closes
//! when the peer goes away.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use segline_core::wire::{self, LEN_SIZE};
use segline_core::{Name, Packet, RequestHandle, Response, TransportAdapter, TransportEvent};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

struct Pending {
    name: Name,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct Shared {
    /// Our requests awaiting an answer, by handle.
    pending: Mutex<HashMap<u64, Pending>>,
    /// Peer requests awaiting `respond`, oldest first.
    inbound: Mutex<Vec<(u64, Name)>>,
    /// Cleared when the stream ends, which closes the event channel.
    events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        if let Some(tx) = lock(&self.events).as_ref() {
            let _ = tx.send(event);
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct BridgeTransport {
    outbound: mpsc::UnboundedSender<Packet>,
    shared: Arc<Shared>,
    next_handle: u64,
    request_timeout: Duration,
    reader: JoinHandle<()>,
}

impl BridgeTransport {
    /// Start reader and writer tasks on `stream`. Must be called inside a tokio runtime.
    pub fn spawn<S>(
        stream: S,
        request_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            events: Mutex::new(Some(events_tx)),
            ..Shared::default()
        });
        let (reader, writer) = tokio::io::split(stream);

        tokio::spawn(write_loop(writer, outbound_rx));
        let reader = tokio::spawn(read_loop(reader, shared.clone()));

        let transport = Self {
            outbound,
            shared,
            next_handle: 0,
            request_timeout,
            reader,
        };
        (transport, events_rx)
    }

    /// Forget an inbound request that will not be answered.
    pub fn discard_inbound(&mut self, name: &Name) {
        let mut inbound = lock(&self.shared.inbound);
        if let Some(idx) = inbound.iter().position(|(_, n)| n == name) {
            inbound.remove(idx);
        }
    }

    pub fn outstanding(&self) -> usize {
        lock(&self.shared.pending).len()
    }

    fn send(&self, packet: Packet) {
        if self.outbound.send(packet).is_err() {
            debug!("stream writer gone, packet dropped");
        }
    }
}

impl TransportAdapter for BridgeTransport {
    fn request(&mut self, name: &Name) -> RequestHandle {
        self.next_handle += 1;
        let handle = self.next_handle;

        // Held across the spawn so the timer cannot fire before the entry exists.
        let mut pending = lock(&self.shared.pending);
        let shared = self.shared.clone();
        let timeout = self.request_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let expired = lock(&shared.pending).remove(&handle);
            if let Some(p) = expired {
                shared.emit(TransportEvent::Timeout {
                    handle: RequestHandle(handle),
                    request: p.name,
                });
            }
        });
        pending.insert(
            handle,
            Pending {
                name: name.clone(),
                timer,
            },
        );
        drop(pending);

        self.send(Packet::Request {
            handle,
            name: name.clone(),
        });
        RequestHandle(handle)
    }

    fn cancel(&mut self, handle: RequestHandle) {
        if let Some(p) = lock(&self.shared.pending).remove(&handle.0) {
            p.timer.abort();
        }
    }

    /// Answer the oldest inbound request this response belongs to: the one with
    /// the same name, or else a bare-name request whose answer is segment 0.
    fn respond(&mut self, response: Response) {
        let target = {
            let mut inbound = lock(&self.shared.inbound);
            let exact = inbound.iter().position(|(_, n)| *n == response.name);
            let bare = || {
                inbound.iter().position(|(_, n)| {
                    n.segment().is_none()
                        && response.segment() == Some(0)
                        && n.is_prefix_of(&response.name)
                })
            };
            exact.or_else(bare).map(|idx| inbound.remove(idx))
        };
        match target {
            Some((handle, _)) => self.send(Packet::Response { handle, response }),
            None => debug!(name = %response.name, "no inbound request for response"),
        }
    }
}

impl Drop for BridgeTransport {
    fn drop(&mut self) {
        self.reader.abort();
        for (_, p) in lock(&self.shared.pending).drain() {
            p.timer.abort();
        }
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Packet>) {
    while let Some(packet) = rx.recv().await {
        let frame = match wire::encode_frame(&packet) {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "dropping unencodable packet");
                continue;
            }
        };
        if writer.write_all(&frame).await.is_err() || writer.flush().await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop<R: AsyncRead + Unpin>(mut reader: R, shared: Arc<Shared>) {
    loop {
        let mut len_buf = [0u8; LEN_SIZE];
        if reader.read_exact(&mut len_buf).await.is_err() {
            break;
        }
        let len = match wire::frame_len(&len_buf) {
            Ok(len) => len,
            Err(e) => {
                warn!(error = %e, "bad frame header, closing");
                break;
            }
        };
        let mut payload = vec![0u8; len];
        if reader.read_exact(&mut payload).await.is_err() {
            break;
        }
        match wire::decode_payload(&payload) {
            Ok(Packet::Request { handle, name }) => {
                lock(&shared.inbound).push((handle, name.clone()));
                shared.emit(TransportEvent::Request { name });
            }
            Ok(Packet::Response { handle, response }) => {
                let answered = lock(&shared.pending).remove(&handle);
                match answered {
                    Some(p) => {
                        p.timer.abort();
                        shared.emit(TransportEvent::Response {
                            handle: RequestHandle(handle),
                            request: p.name,
                            response,
                        });
                    }
                    None => debug!(name = %response.name, "late or cancelled response dropped"),
                }
            }
            Err(e) => warn!(error = %e, "undecodable packet dropped"),
        }
    }
    debug!("stream closed");
    lock(&shared.events).take();
}

//! Synchronous-request bridge.
//!
//! Gives request/response semantics on top of a transport that only
//! supports "send" and "deliver inbound packet". Each outgoing request
//! gets a sequence id scoped to this bridge; the caller parks on a
//! oneshot until a response with the same sequence arrives, the periodic
//! sweep expires the request, or the connection fails all pending work.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};

use strata_core::{Result, StrataError, REQUEST_SWEEP_INTERVAL_MS};

use crate::packet::Packet;

struct RequestPromise {
    started: Instant,
    /// `<0` never expires, `0` uses the bridge default, `>0` overrides it.
    timeout_ms: i64,
    /// Accumulates non-terminal chunk fragments of the response.
    partial: Option<Packet>,
    completion: oneshot::Sender<Result<Packet>>,
}

impl RequestPromise {
    fn is_expired(&self, now: Instant, default_timeout_ms: u64) -> bool {
        let deadline_ms = match self.timeout_ms {
            t if t < 0 => return false,
            0 => default_timeout_ms,
            t => t as u64,
        };
        now.duration_since(self.started) > Duration::from_millis(deadline_ms)
    }
}

/// One bridge per connection; owns the pending-request table and the
/// sequence counter, and runs a timeout sweep for as long as the table
/// is alive.
pub struct SyncRequestSupport {
    name: String,
    default_timeout_ms: u64,
    sequence: AtomicU64,
    pending: Arc<Mutex<HashMap<String, RequestPromise>>>,
}

impl SyncRequestSupport {
    pub fn new(name: impl Into<String>, default_timeout_ms: u64) -> Arc<Self> {
        let support = Arc::new(Self {
            name: name.into(),
            default_timeout_ms,
            sequence: AtomicU64::new(0),
            pending: Arc::new(Mutex::new(HashMap::new())),
        });
        support.spawn_sweeper();
        support
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sequence ids are unique for the lifetime of this bridge, which is
    /// all the correlation table needs.
    pub fn next_sequence(&self) -> String {
        let n = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-{}", self.name, n)
    }

    /// Stamps a fresh sequence onto the request and parks a promise for
    /// it. The caller must still write the request to the transport and
    /// then await the returned receiver.
    pub async fn register(&self, request: &mut Packet) -> oneshot::Receiver<Result<Packet>> {
        let sequence = self.next_sequence();
        request.header.set_sequence(&sequence);
        let (completion, receiver) = oneshot::channel();
        let promise = RequestPromise {
            started: Instant::now(),
            timeout_ms: request.header.timeout_ms(),
            partial: None,
            completion,
        };
        self.pending.lock().await.insert(sequence, promise);
        receiver
    }

    /// Routes an inbound packet to its pending promise, if any.
    ///
    /// Non-terminal chunk fragments are merged into the promise and
    /// consumed; the terminal marker (or a plain response) completes the
    /// promise and releases the waiter. Returns the packet back when no
    /// promise claims it so the caller can dispatch it elsewhere.
    pub async fn on_response(&self, packet: Packet) -> Option<Packet> {
        let Some(sequence) = packet.header.sequence().map(str::to_owned) else {
            return Some(packet);
        };

        let mut pending = self.pending.lock().await;
        if !pending.contains_key(&sequence) {
            return Some(packet);
        }

        if packet.header.support_chunked() && !packet.body.is_empty() {
            if let Some(promise) = pending.get_mut(&sequence) {
                match promise.partial.as_mut() {
                    Some(partial) => partial.merge_chunked_body(&packet),
                    None => promise.partial = Some(packet),
                }
            }
            return None;
        }

        let Some(promise) = pending.remove(&sequence) else {
            return Some(packet);
        };
        drop(pending);

        let response = if packet.is_chunk_end() {
            promise.partial.unwrap_or(packet)
        } else {
            packet
        };
        let outcome = match response.error() {
            Some(message) => Err(StrataError::Remote(message.to_string())),
            None => Ok(response),
        };
        if promise.completion.send(outcome).is_err() {
            debug!(
                target: "strata::net",
                bridge = %self.name,
                sequence = %sequence,
                "Response arrived after the caller stopped waiting"
            );
        }
        None
    }

    /// Fails every pending request. Called when the owning connection is
    /// torn down so no caller is left parked forever.
    pub async fn fail_all(&self, reason: &str) {
        let mut pending = self.pending.lock().await;
        if pending.is_empty() {
            return;
        }
        warn!(
            target: "strata::net",
            bridge = %self.name,
            count = pending.len(),
            reason,
            "Failing all pending requests"
        );
        for (sequence, promise) in pending.drain() {
            let _ = promise.completion.send(Err(StrataError::Disconnected(format!(
                "{reason} [sequence={sequence}]"
            ))));
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// The sweep holds only a weak handle; it exits once the bridge is
    /// dropped.
    fn spawn_sweeper(self: &Arc<Self>) {
        let pending: Weak<Mutex<HashMap<String, RequestPromise>>> = Arc::downgrade(&self.pending);
        let default_timeout_ms = self.default_timeout_ms;
        let name = self.name.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(REQUEST_SWEEP_INTERVAL_MS));
            loop {
                ticker.tick().await;
                let Some(pending) = pending.upgrade() else {
                    break;
                };
                let now = Instant::now();
                let mut table = pending.lock().await;
                let expired: Vec<String> = table
                    .iter()
                    .filter(|(_, promise)| promise.is_expired(now, default_timeout_ms))
                    .map(|(sequence, _)| sequence.clone())
                    .collect();
                for sequence in expired {
                    if let Some(promise) = table.remove(&sequence) {
                        let elapsed_ms = now.duration_since(promise.started).as_millis() as u64;
                        warn!(
                            target: "strata::net",
                            bridge = %name,
                            sequence = %sequence,
                            elapsed_ms,
                            "Synchronous request timed out"
                        );
                        let _ = promise.completion.send(Err(StrataError::RequestTimeout {
                            sequence,
                            elapsed_ms,
                        }));
                    }
                }
            }
        });
    }
}

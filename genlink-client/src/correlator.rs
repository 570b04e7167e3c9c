//! Request correlation.
//!
//! Many logical requests share one connection. Each request gets a fresh
//! correlation token and a pending entry; incoming frames are routed to the
//! entry with the matching token. An entry is removed by whichever of
//! response, rejection or timeout happens first, so a late response for a
//! timed-out request finds nothing and is dropped.

use crate::error::ClientError;
use genlink_protocol::{codec, IncomingMessage, ProtocolError, TaskRequest, TaskType};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Queue of encoded frames drained by the connection's writer task.
pub type FrameSender = mpsc::UnboundedSender<String>;

/// Outcome delivered to a waiting request.
pub type Completion = Result<Value, ClientError>;

/// Bookkeeping for a request that has been sent but not resolved.
#[derive(Debug)]
pub struct PendingRequest {
    pub task_type: TaskType,
    pub created_at: Instant,
    pub deadline: Instant,
    completion: oneshot::Sender<Completion>,
}

/// Routes responses to the requests that caused them.
pub struct Correlator {
    pending: Mutex<HashMap<String, PendingRequest>>,
    /// Random high half of every token issued by this correlator.
    session: u64,
    /// Monotonic low half of the next token.
    next_seq: AtomicU64,
    /// Bumped by every `fail_all`; a send started in an older epoch is
    /// rejected instead of outliving the flush.
    epoch: AtomicU64,
    request_timeout: Duration,
}

impl Correlator {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            session: Uuid::new_v4().as_u64_pair().0,
            next_seq: AtomicU64::new(1),
            epoch: AtomicU64::new(0),
            request_timeout,
        }
    }

    /// Allocates a new correlation token.
    ///
    /// Tokens are UUID-formatted, never repeat for the lifetime of the
    /// correlator, and sort in issue order.
    pub fn next_token(&self) -> String {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        Uuid::from_u64_pair(self.session, seq).to_string()
    }

    /// Returns the current flush epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Sends a task and waits for its response.
    ///
    /// Resolves with the response payload, or fails with the service's error,
    /// `Timeout`, or the reason passed to [`Correlator::fail_all`].
    pub async fn send(&self, outbound: &FrameSender, task: TaskRequest) -> Completion {
        self.send_in_epoch(outbound, self.epoch(), task).await
    }

    /// Like [`Correlator::send`], for a writer queue captured in `epoch`.
    ///
    /// Fails with `ConnectionClosed` if `fail_all` ran since then, so a request
    /// registered just after a flush is not left waiting on a dead connection.
    pub async fn send_in_epoch(
        &self,
        outbound: &FrameSender,
        epoch: u64,
        task: TaskRequest,
    ) -> Completion {
        let task_type = task.task_type();
        let token = self.next_token();
        let frame = codec::encode(&task.into_message(token.clone()))?;

        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        let deadline = now + self.request_timeout;
        self.pending.lock().insert(
            token.clone(),
            PendingRequest {
                task_type,
                created_at: now,
                deadline,
                completion: tx,
            },
        );
        // Removes the entry on every exit path, including cancellation.
        let _guard = PendingGuard {
            correlator: self,
            token: &token,
        };

        if self.epoch() != epoch {
            tracing::debug!("Request {} not sent: connection was flushed", token);
            return Err(ClientError::ConnectionClosed);
        }

        outbound.send(frame).map_err(|_| {
            tracing::debug!("Request {} not sent: writer gone", token);
            ClientError::ConnectionClosed
        })?;
        tracing::debug!("Request {} ({}) sent", token, task_type);

        match tokio::time::timeout_at(deadline.into(), rx).await {
            Ok(Ok(completion)) => completion,
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                tracing::debug!("Request {} ({}) timed out", token, task_type);
                Err(ClientError::Timeout)
            }
        }
    }

    /// Routes a raw text frame to its pending requests.
    ///
    /// Returns the number of requests resolved. Unparseable, uncorrelated or
    /// late frames are logged and dropped.
    pub fn on_frame(&self, frame: &str) -> usize {
        self.route(codec::decode_frame(frame))
    }

    /// Routes a binary frame carrying UTF-8 JSON.
    pub fn on_bytes(&self, frame: &[u8]) -> usize {
        self.route(codec::decode_bytes(frame))
    }

    fn route(&self, decoded: Result<Vec<IncomingMessage>, ProtocolError>) -> usize {
        match decoded {
            Ok(messages) => messages
                .into_iter()
                .map(|m| self.dispatch(m))
                .filter(|resolved| *resolved)
                .count(),
            Err(e) => {
                tracing::warn!("Dropping undecodable frame: {}", e);
                0
            }
        }
    }

    /// Resolves the pending request matching `message`, if any.
    pub fn dispatch(&self, message: IncomingMessage) -> bool {
        let Some(ref token) = message.task_uuid else {
            match message.error_message() {
                Some(error) => tracing::warn!("Uncorrelated error from service: {}", error),
                None => tracing::debug!("Dropping uncorrelated frame"),
            }
            return false;
        };

        let Some(entry) = self.pending.lock().remove(token) else {
            tracing::debug!("No pending request for {} (late or unknown)", token);
            return false;
        };

        let completion = match message.error_message() {
            Some(error) => Err(ClientError::Task {
                task_type: entry.task_type,
                message: error,
            }),
            None => Ok(message.data.unwrap_or(Value::Null)),
        };

        tracing::debug!(
            "Request {} resolved after {:?}",
            token,
            entry.created_at.elapsed()
        );
        // The waiter may have been cancelled; nothing to do then.
        let _ = entry.completion.send(completion);
        true
    }

    /// Rejects every pending request with `reason` and clears the table.
    pub fn fail_all(&self, reason: ClientError) -> usize {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let drained: Vec<(String, PendingRequest)> = self.pending.lock().drain().collect();
        if !drained.is_empty() {
            tracing::debug!("Failing {} pending requests: {}", drained.len(), reason);
        }
        let count = drained.len();
        for (_, entry) in drained {
            let _ = entry.completion.send(Err(reason.clone()));
        }
        count
    }

    /// Returns the number of pending requests.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

struct PendingGuard<'a> {
    correlator: &'a Correlator,
    token: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.correlator.pending.lock().remove(self.token);
    }
}

//! Request/response correlation: FIFO per (service, command) key, per-request retry policy.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use log::{debug, info};
use parking_lot::Mutex;

use crate::transfer::TransferId;

/// Correlation key: an inbound frame answers the oldest pending request with
/// the same service and command ids.
pub type RequestKey = (u8, u8);

/// Retry policy for one request: total transmission attempts and the base
/// timeout. The wait doubles after every expired attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub timeout: Duration,
}

impl RetryPolicy {
    /// One attempt, no retries.
    pub fn fail_fast(timeout: Duration) -> Self {
        Self {
            attempts: 1,
            timeout,
        }
    }

    pub fn retrying(attempts: u32, timeout: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            timeout,
        }
    }

    /// Wait before the zero-based `attempt` expires.
    fn wait(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.timeout.saturating_mul(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            timeout: Duration::from_secs(5),
        }
    }
}

/// Opaque identity of a submitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle(u64);

/// Bytes for a transmission. Deferred sources are materialized at every send,
/// so a retried block request reads the transfer's live offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadSource {
    Fixed(Vec<u8>),
    TransferBlock(TransferId),
}

/// Where a resolved response goes. Each sink is invoked at most once.
pub enum ResponseSink {
    Callback(Box<dyn FnOnce(ResponseOutcome) + Send>),
    Transfer(TransferId),
}

/// What a request resolved to.
#[derive(Debug)]
pub enum ResponseOutcome {
    Payload(Vec<u8>),
    Failed(RequestError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("timed out after {attempts} attempt(s)")]
    TimedOut { attempts: u32 },
    #[error("session closed")]
    SessionClosed,
    #[error("response authentication failed")]
    AuthFailed,
    #[error("cancelled")]
    Cancelled,
    #[error("request could not be sent: {0}")]
    Rejected(&'static str),
}

/// A logical request as submitted. Owned by the correlator from submission
/// until its sink fires.
pub struct Request {
    pub service_id: u8,
    pub command_id: u8,
    pub payload: PayloadSource,
    pub encrypted: bool,
    pub policy: RetryPolicy,
    pub sink: ResponseSink,
}

/// Work for the caller after a correlator call.
pub enum CorrelatorStep {
    /// Materialize, frame, optionally seal, and send this payload now.
    Transmit {
        handle: RequestHandle,
        service_id: u8,
        command_id: u8,
        payload: PayloadSource,
        encrypted: bool,
    },
    /// Hand the outcome to the sink.
    Deliver {
        sink: ResponseSink,
        outcome: ResponseOutcome,
    },
}

struct Pending {
    handle: RequestHandle,
    payload: PayloadSource,
    encrypted: bool,
    policy: RetryPolicy,
    /// Transmissions so far; only the queue front is ever on the wire.
    attempts: u32,
    deadline: Option<Instant>,
    sink: Option<ResponseSink>,
}

#[derive(Default)]
struct PendingTable {
    queues: HashMap<RequestKey, VecDeque<Pending>>,
    next_handle: u64,
}

/// Pending-request table. The interior mutex is the only synchronization
/// point between the delivery path and the caller path, so every method takes
/// `&self`.
pub struct Correlator {
    table: Mutex<PendingTable>,
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(PendingTable::default()),
        }
    }

    /// Queue a request. If nothing is in flight on its key, the returned steps
    /// include the first transmission.
    pub fn submit(&self, request: Request, now: Instant) -> (RequestHandle, Vec<CorrelatorStep>) {
        let mut table = self.table.lock();
        table.next_handle += 1;
        let handle = RequestHandle(table.next_handle);
        let key = (request.service_id, request.command_id);
        let queue = table.queues.entry(key).or_default();
        queue.push_back(Pending {
            handle,
            payload: request.payload,
            encrypted: request.encrypted,
            policy: request.policy,
            attempts: 0,
            deadline: None,
            sink: Some(request.sink),
        });
        let mut steps = Vec::new();
        if queue.len() == 1 {
            if let Some(front) = queue.front_mut() {
                steps.push(transmit(front, key, now));
            }
        }
        (handle, steps)
    }

    /// An inbound frame for `key` resolves the oldest pending request on that
    /// key; with nothing pending it is logged and discarded. `now` stamps the
    /// deadline of whatever queued request gets promoted.
    pub fn on_frame(
        &self,
        service_id: u8,
        command_id: u8,
        payload: Vec<u8>,
        now: Instant,
    ) -> Vec<CorrelatorStep> {
        let key = (service_id, command_id);
        let mut table = self.table.lock();
        let queue = match table.queues.get_mut(&key) {
            Some(q) if !q.is_empty() => q,
            _ => {
                debug!(
                    "discarding unmatched frame service=0x{service_id:02X} command=0x{command_id:02X} ({} bytes)",
                    payload.len()
                );
                return Vec::new();
            }
        };
        resolve_front(queue, key, ResponseOutcome::Payload(payload), now)
    }

    /// Fail the in-flight request on `key` (e.g. its response arrived but did
    /// not authenticate). The session stays up; the next queued request on
    /// the key is promoted.
    pub fn fail_front(
        &self,
        service_id: u8,
        command_id: u8,
        error: RequestError,
        now: Instant,
    ) -> Vec<CorrelatorStep> {
        let key = (service_id, command_id);
        let mut table = self.table.lock();
        let queue = match table.queues.get_mut(&key) {
            Some(q) if !q.is_empty() => q,
            _ => return Vec::new(),
        };
        resolve_front(queue, key, ResponseOutcome::Failed(error), now)
    }

    /// Fail one request wherever it sits. Cancelling an in-flight request
    /// leaves its eventual response to match the next request on the key or
    /// be discarded as unmatched.
    pub fn fail_handle(
        &self,
        handle: RequestHandle,
        error: RequestError,
        now: Instant,
    ) -> Vec<CorrelatorStep> {
        let mut table = self.table.lock();
        let mut steps = Vec::new();
        for (&key, queue) in table.queues.iter_mut() {
            let Some(pos) = queue.iter().position(|p| p.handle == handle) else {
                continue;
            };
            if pos == 0 {
                steps.extend(resolve_front(
                    queue,
                    key,
                    ResponseOutcome::Failed(error),
                    now,
                ));
            } else if let Some(mut pending) = queue.remove(pos) {
                if let Some(sink) = pending.sink.take() {
                    steps.push(CorrelatorStep::Deliver {
                        sink,
                        outcome: ResponseOutcome::Failed(error),
                    });
                }
            }
            break;
        }
        steps
    }

    /// Encryption flag of the request currently on the wire for `key`, used to
    /// decide whether its response payload must be opened.
    pub fn front_encrypted(&self, service_id: u8, command_id: u8) -> Option<bool> {
        let table = self.table.lock();
        table
            .queues
            .get(&(service_id, command_id))
            .and_then(|q| q.front())
            .map(|p| p.encrypted)
    }

    /// Drive deadlines: retransmit requests with attempts remaining, time out
    /// the rest, promote whatever is behind them.
    pub fn poll(&self, now: Instant) -> Vec<CorrelatorStep> {
        let mut table = self.table.lock();
        let mut steps = Vec::new();
        let keys: Vec<RequestKey> = table.queues.keys().copied().collect();
        for key in keys {
            let Some(queue) = table.queues.get_mut(&key) else {
                continue;
            };
            let expired = match queue.front() {
                Some(front) => front.deadline.is_some_and(|d| d <= now),
                None => false,
            };
            if !expired {
                continue;
            }
            // Front is past its deadline.
            let retry = queue
                .front()
                .map(|p| p.attempts < p.policy.attempts)
                .unwrap_or(false);
            if retry {
                if let Some(front) = queue.front_mut() {
                    debug!(
                        "request on service=0x{:02X} command=0x{:02X} expired, retrying (attempt {} of {})",
                        key.0,
                        key.1,
                        front.attempts + 1,
                        front.policy.attempts
                    );
                    steps.push(transmit(front, key, now));
                }
            } else {
                let attempts = queue.front().map(|p| p.attempts).unwrap_or(0);
                steps.extend(resolve_front(
                    queue,
                    key,
                    ResponseOutcome::Failed(RequestError::TimedOut { attempts }),
                    now,
                ));
            }
        }
        table.queues.retain(|_, q| !q.is_empty());
        steps
    }

    /// Session teardown: every pending request fails with `SessionClosed`
    /// immediately instead of timing out silently.
    pub fn close_session(&self) -> Vec<CorrelatorStep> {
        let mut table = self.table.lock();
        let mut steps = Vec::new();
        let mut failed = 0usize;
        for (_, queue) in table.queues.iter_mut() {
            for pending in queue.iter_mut() {
                if let Some(sink) = pending.sink.take() {
                    failed += 1;
                    steps.push(CorrelatorStep::Deliver {
                        sink,
                        outcome: ResponseOutcome::Failed(RequestError::SessionClosed),
                    });
                }
            }
        }
        table.queues.clear();
        if failed > 0 {
            info!("session closed with {failed} pending request(s) failed");
        }
        steps
    }

    /// Pending requests across all keys (queued and in flight).
    pub fn pending_len(&self) -> usize {
        let table = self.table.lock();
        table.queues.values().map(|q| q.len()).sum()
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

/// Mark the front transmitted and describe the send. The deadline applies the
/// doubling backoff for whichever attempt this is.
fn transmit(front: &mut Pending, key: RequestKey, now: Instant) -> CorrelatorStep {
    front.attempts += 1;
    front.deadline = Some(now + front.policy.wait(front.attempts - 1));
    CorrelatorStep::Transmit {
        handle: front.handle,
        service_id: key.0,
        command_id: key.1,
        payload: front.payload.clone(),
        encrypted: front.encrypted,
    }
}

/// Pop the front, deliver its outcome, put the next queued request on the wire.
fn resolve_front(
    queue: &mut VecDeque<Pending>,
    key: RequestKey,
    outcome: ResponseOutcome,
    now: Instant,
) -> Vec<CorrelatorStep> {
    let mut steps = Vec::new();
    if let Some(mut resolved) = queue.pop_front() {
        resolved.deadline = None;
        if let Some(sink) = resolved.sink.take() {
            steps.push(CorrelatorStep::Deliver { sink, outcome });
        }
    }
    if let Some(next) = queue.front_mut() {
        if next.deadline.is_none() {
            steps.push(transmit(next, key, now));
        }
    }
    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn capture() -> (Arc<Mutex<Vec<ResponseOutcome>>>, ResponseSink) {
        let log: Arc<Mutex<Vec<ResponseOutcome>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_log = Arc::clone(&log);
        let sink = ResponseSink::Callback(Box::new(move |outcome| {
            sink_log.lock().push(outcome);
        }));
        (log, sink)
    }

    fn request(service: u8, command: u8, bytes: &[u8], policy: RetryPolicy) -> (Arc<Mutex<Vec<ResponseOutcome>>>, Request) {
        let (log, sink) = capture();
        (
            log,
            Request {
                service_id: service,
                command_id: command,
                payload: PayloadSource::Fixed(bytes.to_vec()),
                encrypted: false,
                policy,
                sink,
            },
        )
    }

    /// Invoke callback sinks, count transmissions.
    fn run(steps: Vec<CorrelatorStep>) -> usize {
        let mut transmits = 0;
        for step in steps {
            match step {
                CorrelatorStep::Transmit { .. } => transmits += 1,
                CorrelatorStep::Deliver { sink, outcome } => match sink {
                    ResponseSink::Callback(f) => f(outcome),
                    ResponseSink::Transfer(_) => panic!("no transfer sinks in these tests"),
                },
            }
        }
        transmits
    }

    #[test]
    fn submit_transmits_immediately() {
        let correlator = Correlator::new();
        let now = Instant::now();
        let (_, req) = request(0x0A, 0x02, b"payload", RetryPolicy::default());
        let (handle, steps) = correlator.submit(req, now);
        assert_eq!(steps.len(), 1);
        match &steps[0] {
            CorrelatorStep::Transmit {
                handle: h,
                service_id,
                command_id,
                payload,
                ..
            } => {
                assert_eq!(*h, handle);
                assert_eq!((*service_id, *command_id), (0x0A, 0x02));
                assert_eq!(*payload, PayloadSource::Fixed(b"payload".to_vec()));
            }
            _ => panic!("expected Transmit"),
        }
    }

    #[test]
    fn fifo_order_per_key() {
        let correlator = Correlator::new();
        let now = Instant::now();
        let (log_a, req_a) = request(1, 1, b"a", RetryPolicy::default());
        let (log_b, req_b) = request(1, 1, b"b", RetryPolicy::default());
        correlator.submit(req_a, now);
        let (_, steps_b) = correlator.submit(req_b, now);
        // B waits behind A.
        assert_eq!(run(steps_b), 0);

        let steps = correlator.on_frame(1, 1, b"first response".to_vec(), now);
        // A resolved, B put on the wire.
        assert_eq!(run(steps), 1);
        assert!(matches!(
            log_a.lock().as_slice(),
            [ResponseOutcome::Payload(p)] if p == b"first response"
        ));
        assert!(log_b.lock().is_empty());

        run(correlator.on_frame(1, 1, b"second response".to_vec(), now));
        assert!(matches!(
            log_b.lock().as_slice(),
            [ResponseOutcome::Payload(p)] if p == b"second response"
        ));
        assert_eq!(correlator.pending_len(), 0);
    }

    #[test]
    fn unmatched_frame_is_discarded() {
        let correlator = Correlator::new();
        let steps = correlator.on_frame(9, 9, b"nobody asked".to_vec(), Instant::now());
        assert!(steps.is_empty());
        assert_eq!(correlator.pending_len(), 0);
    }

    #[test]
    fn independent_keys_fly_together() {
        let correlator = Correlator::new();
        let now = Instant::now();
        let (_, req_a) = request(1, 1, b"a", RetryPolicy::default());
        let (_, req_b) = request(2, 2, b"b", RetryPolicy::default());
        let (_, steps_a) = correlator.submit(req_a, now);
        let (_, steps_b) = correlator.submit(req_b, now);
        assert_eq!(run(steps_a), 1);
        assert_eq!(run(steps_b), 1);
    }

    #[test]
    fn timeout_retries_with_doubling_backoff() {
        let correlator = Correlator::new();
        let t0 = Instant::now();
        let policy = RetryPolicy::retrying(3, Duration::from_secs(1));
        let (log, req) = request(1, 1, b"r", policy);
        correlator.submit(req, t0);

        // First deadline at t0+1s.
        assert_eq!(run(correlator.poll(t0 + Duration::from_millis(900))), 0);
        let t1 = t0 + Duration::from_millis(1100);
        assert_eq!(run(correlator.poll(t1)), 1);

        // Second deadline doubles: t1+2s.
        assert_eq!(run(correlator.poll(t1 + Duration::from_millis(1900))), 0);
        let t2 = t1 + Duration::from_millis(2100);
        assert_eq!(run(correlator.poll(t2)), 1);

        // Third deadline doubles again: t2+4s; expiry exhausts the budget.
        assert_eq!(run(correlator.poll(t2 + Duration::from_millis(3900))), 0);
        run(correlator.poll(t2 + Duration::from_millis(4100)));
        assert!(matches!(
            log.lock().as_slice(),
            [ResponseOutcome::Failed(RequestError::TimedOut { attempts: 3 })]
        ));
        assert_eq!(correlator.pending_len(), 0);
    }

    #[test]
    fn fail_fast_times_out_after_one_attempt() {
        let correlator = Correlator::new();
        let t0 = Instant::now();
        let (log, req) = request(3, 3, b"x", RetryPolicy::fail_fast(Duration::from_secs(2)));
        correlator.submit(req, t0);
        run(correlator.poll(t0 + Duration::from_secs(3)));
        assert!(matches!(
            log.lock().as_slice(),
            [ResponseOutcome::Failed(RequestError::TimedOut { attempts: 1 })]
        ));
    }

    #[test]
    fn late_response_after_timeout_is_unmatched() {
        let correlator = Correlator::new();
        let t0 = Instant::now();
        let (log, req) = request(1, 2, b"x", RetryPolicy::fail_fast(Duration::from_secs(1)));
        correlator.submit(req, t0);
        run(correlator.poll(t0 + Duration::from_secs(2)));
        // Deadline already fired; the late frame finds nothing.
        let steps = correlator.on_frame(1, 2, b"late".to_vec(), t0 + Duration::from_secs(3));
        assert!(steps.is_empty());
        assert_eq!(log.lock().len(), 1);
    }

    #[test]
    fn resolution_cancels_the_deadline() {
        let correlator = Correlator::new();
        let t0 = Instant::now();
        let (log, req) = request(1, 1, b"x", RetryPolicy::fail_fast(Duration::from_secs(1)));
        correlator.submit(req, t0);
        run(correlator.on_frame(1, 1, b"answer".to_vec(), t0));
        // Polling far past the deadline must not deliver a second outcome.
        run(correlator.poll(t0 + Duration::from_secs(60)));
        let outcomes = log.lock();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(&outcomes[0], ResponseOutcome::Payload(p) if p == b"answer"));
    }

    #[test]
    fn close_session_fails_everything() {
        let correlator = Correlator::new();
        let now = Instant::now();
        let fired = Arc::new(AtomicUsize::new(0));
        for (service, command) in [(1u8, 1u8), (1, 1), (2, 7)] {
            let fired = Arc::clone(&fired);
            let req = Request {
                service_id: service,
                command_id: command,
                payload: PayloadSource::Fixed(vec![0]),
                encrypted: false,
                policy: RetryPolicy::default(),
                sink: ResponseSink::Callback(Box::new(move |outcome| {
                    assert!(matches!(
                        outcome,
                        ResponseOutcome::Failed(RequestError::SessionClosed)
                    ));
                    fired.fetch_add(1, Ordering::SeqCst);
                })),
            };
            correlator.submit(req, now);
        }
        run(correlator.close_session());
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert_eq!(correlator.pending_len(), 0);
    }

    #[test]
    fn cancel_front_promotes_next() {
        let correlator = Correlator::new();
        let now = Instant::now();
        let (log_a, req_a) = request(1, 1, b"a", RetryPolicy::default());
        let (log_b, req_b) = request(1, 1, b"b", RetryPolicy::default());
        let (handle_a, _) = correlator.submit(req_a, now);
        correlator.submit(req_b, now);

        let steps = correlator.fail_handle(handle_a, RequestError::Cancelled, now);
        assert_eq!(run(steps), 1);
        assert!(matches!(
            log_a.lock().as_slice(),
            [ResponseOutcome::Failed(RequestError::Cancelled)]
        ));
        assert!(log_b.lock().is_empty());

        run(correlator.on_frame(1, 1, b"for b".to_vec(), now));
        assert!(matches!(
            log_b.lock().as_slice(),
            [ResponseOutcome::Payload(p)] if p == b"for b"
        ));
    }

    #[test]
    fn cancel_queued_leaves_front_alone() {
        let correlator = Correlator::new();
        let now = Instant::now();
        let (log_a, req_a) = request(1, 1, b"a", RetryPolicy::default());
        let (log_b, req_b) = request(1, 1, b"b", RetryPolicy::default());
        correlator.submit(req_a, now);
        let (handle_b, _) = correlator.submit(req_b, now);

        let steps = correlator.fail_handle(handle_b, RequestError::Cancelled, now);
        assert_eq!(run(steps), 0);
        assert!(matches!(
            log_b.lock().as_slice(),
            [ResponseOutcome::Failed(RequestError::Cancelled)]
        ));

        run(correlator.on_frame(1, 1, b"for a".to_vec(), now));
        assert!(matches!(
            log_a.lock().as_slice(),
            [ResponseOutcome::Payload(p)] if p == b"for a"
        ));
    }

    #[test]
    fn auth_failure_fails_only_the_front() {
        let correlator = Correlator::new();
        let now = Instant::now();
        let (log_a, req_a) = request(5, 5, b"a", RetryPolicy::default());
        let (log_b, req_b) = request(5, 5, b"b", RetryPolicy::default());
        correlator.submit(req_a, now);
        correlator.submit(req_b, now);

        let steps = correlator.fail_front(5, 5, RequestError::AuthFailed, now);
        assert_eq!(run(steps), 1);
        assert!(matches!(
            log_a.lock().as_slice(),
            [ResponseOutcome::Failed(RequestError::AuthFailed)]
        ));
        assert!(log_b.lock().is_empty());
        assert_eq!(correlator.pending_len(), 1);
    }

    #[test]
    fn front_encrypted_tracks_the_wire() {
        let correlator = Correlator::new();
        let now = Instant::now();
        assert_eq!(correlator.front_encrypted(1, 1), None);
        let (_, sink) = capture();
        correlator.submit(
            Request {
                service_id: 1,
                command_id: 1,
                payload: PayloadSource::Fixed(vec![1]),
                encrypted: true,
                policy: RetryPolicy::default(),
                sink,
            },
            now,
        );
        assert_eq!(correlator.front_encrypted(1, 1), Some(true));
    }
}

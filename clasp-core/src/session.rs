//! Host-driven session: the host passes received bytes, disconnects, and a
//! clock; the session returns bytes to send and transfer events. One session
//! per link connection.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, warn};

use crate::capability::{CapabilityRegistry, DeviceCapabilityProfile, NotSupported};
use crate::config::Config;
use crate::correlator::{
    Correlator, CorrelatorStep, PayloadSource, Request, RequestError, RequestHandle,
    ResponseOutcome, ResponseSink, RetryPolicy,
};
use crate::crypto::{derive_session_key, DeviceNonce, KeyScheme, PairingSecret, SessionKeyMaterial};
use crate::frame::{self, FrameError, ProtocolVariant};
use crate::transfer::{
    FileId, FileTransfer, FileTransferState, TransferError, TransferId, TransferStep,
};

/// What the host must act on after feeding the session an event.
#[derive(Debug)]
pub enum SessionEvent {
    /// Write these bytes to the link.
    Send(Vec<u8>),
    TransferProgress {
        id: TransferId,
        offset: u64,
        total: Option<u64>,
    },
    TransferComplete {
        id: TransferId,
        state: FileTransferState,
        data: Vec<u8>,
    },
    TransferFailed {
        id: TransferId,
        reason: TransferError,
        state: FileTransferState,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,
    #[error("profile requires encryption but no keys are established")]
    MissingKeys,
    #[error("device nonce scheme {got:?} does not match profile scheme {expected:?}")]
    SchemeMismatch { expected: KeyScheme, got: KeyScheme },
    #[error(transparent)]
    Transfer(#[from] TransferError),
}

/// Protocol engine for one connected device. No I/O and no timers of its
/// own: time-dependent methods take `now` from the host.
pub struct DeviceSession {
    profile: Arc<DeviceCapabilityProfile>,
    config: Config,
    variant: ProtocolVariant,
    correlator: Correlator,
    transfers: HashMap<TransferId, FileTransfer>,
    in_flight: HashMap<TransferId, RequestHandle>,
    keys: Option<SessionKeyMaterial>,
    rx: Vec<u8>,
    open: bool,
}

impl DeviceSession {
    pub fn new(profile: Arc<DeviceCapabilityProfile>, config: Config) -> Self {
        let variant = profile.variant;
        Self {
            profile,
            config,
            variant,
            correlator: Correlator::new(),
            transfers: HashMap::new(),
            in_flight: HashMap::new(),
            keys: None,
            rx: Vec::new(),
            open: true,
        }
    }

    /// Resolve the reported model name through the registry and open a
    /// session for the matched profile.
    pub fn for_model(
        registry: &CapabilityRegistry,
        model: &str,
        config: Config,
    ) -> Result<Self, NotSupported> {
        let profile = registry.identify(model)?;
        Ok(Self::new(profile, config))
    }

    pub fn profile(&self) -> &DeviceCapabilityProfile {
        &self.profile
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn pending_requests(&self) -> usize {
        self.correlator.pending_len()
    }

    /// Derive and install the session key for this connection. The nonce
    /// scheme must match the profile.
    pub fn establish_keys(
        &mut self,
        pairing: &PairingSecret,
        nonce: &DeviceNonce,
    ) -> Result<(), SessionError> {
        if !self.open {
            return Err(SessionError::Closed);
        }
        if nonce.scheme() != self.profile.key_scheme {
            return Err(SessionError::SchemeMismatch {
                expected: self.profile.key_scheme,
                got: nonce.scheme(),
            });
        }
        self.keys = Some(derive_session_key(pairing, nonce));
        Ok(())
    }

    /// Queue one request. The response, or its failure, reaches
    /// `on_response` exactly once. Requests on encrypted profiles go sealed
    /// once keys are established and plaintext before that, which is how the
    /// key exchange itself gets through.
    pub fn submit_request(
        &mut self,
        service_id: u8,
        command_id: u8,
        payload: Vec<u8>,
        policy: RetryPolicy,
        on_response: impl FnOnce(ResponseOutcome) + Send + 'static,
        now: Instant,
    ) -> Result<(RequestHandle, Vec<SessionEvent>), SessionError> {
        if !self.open {
            return Err(SessionError::Closed);
        }
        let encrypted = self.profile.encrypted && self.keys.is_some();
        let (handle, steps) = self.correlator.submit(
            Request {
                service_id,
                command_id,
                payload: PayloadSource::Fixed(payload),
                encrypted,
                policy,
                sink: ResponseSink::Callback(Box::new(on_response)),
            },
            now,
        );
        Ok((handle, self.drive(steps, now)))
    }

    /// Start downloading a file. `resume_from` lets a host that kept its own
    /// partial data skip ahead; pass 0 for a full fetch. Encrypted profiles
    /// need keys before any transfer.
    pub fn start_file_transfer(
        &mut self,
        file: FileId,
        resume_from: u64,
        now: Instant,
    ) -> Result<(TransferId, Vec<SessionEvent>), SessionError> {
        if !self.open {
            return Err(SessionError::Closed);
        }
        if self.profile.encrypted && self.keys.is_none() {
            return Err(SessionError::MissingKeys);
        }
        let transfer = FileTransfer::begin(
            file,
            self.variant,
            self.profile.encrypted,
            self.profile.max_block_size,
            resume_from,
            self.config.transfer_options(),
        )?;
        self.launch_transfer(transfer, now)
    }

    /// Continue a transfer from a state captured when an earlier session was
    /// interrupted.
    pub fn resume_file_transfer(
        &mut self,
        state: FileTransferState,
        now: Instant,
    ) -> Result<(TransferId, Vec<SessionEvent>), SessionError> {
        if !self.open {
            return Err(SessionError::Closed);
        }
        if self.profile.encrypted && self.keys.is_none() {
            return Err(SessionError::MissingKeys);
        }
        let transfer = FileTransfer::resume(state, self.config.transfer_options())?;
        self.launch_transfer(transfer, now)
    }

    fn launch_transfer(
        &mut self,
        transfer: FileTransfer,
        now: Instant,
    ) -> Result<(TransferId, Vec<SessionEvent>), SessionError> {
        let id = transfer.id();
        self.transfers.insert(id, transfer);
        let steps = self.enqueue_transfer_submit(id, now);
        Ok((id, self.drive(steps, now)))
    }

    /// Abort a transfer. Its in-flight request is failed through the
    /// correlator, so the transfer emits its terminal event on the usual
    /// path. A late response to the aborted request is discarded as
    /// unmatched.
    pub fn cancel_transfer(&mut self, id: TransferId, now: Instant) -> Vec<SessionEvent> {
        let Some(handle) = self.in_flight.remove(&id) else {
            debug!("cancel for unknown transfer {id}");
            return Vec::new();
        };
        let steps = self
            .correlator
            .fail_handle(handle, RequestError::Cancelled, now);
        self.drive(steps, now)
    }

    /// Feed bytes read from the link. Partial frames are buffered; on a
    /// corrupt prefix the whole buffer is dropped and reassembly restarts
    /// with the next delivery.
    pub fn on_bytes_received(&mut self, bytes: &[u8], now: Instant) -> Vec<SessionEvent> {
        if !self.open {
            debug!("dropping {} bytes on closed session", bytes.len());
            return Vec::new();
        }
        self.rx.extend_from_slice(bytes);
        let mut events = Vec::new();
        loop {
            match frame::decode(self.variant, &self.rx) {
                Ok((frame, consumed)) => {
                    self.rx.drain(..consumed);
                    events.extend(self.on_frame(frame.service_id, frame.command_id, frame.payload, now));
                }
                Err(FrameError::NeedMore) => break,
                Err(err) => {
                    warn!("dropping inbound buffer: {err}");
                    self.rx.clear();
                    break;
                }
            }
        }
        events
    }

    /// Advance timeouts. Call at least once per second while connected.
    pub fn poll(&mut self, now: Instant) -> Vec<SessionEvent> {
        if !self.open {
            return Vec::new();
        }
        let steps = self.correlator.poll(now);
        self.drive(steps, now)
    }

    /// The link dropped. Every pending request fails with `SessionClosed`
    /// and every running transfer ends `Interrupted` with a resumable state.
    /// The session stays closed; reconnecting means a new session.
    pub fn on_disconnected(&mut self, now: Instant) -> Vec<SessionEvent> {
        if !self.open {
            return Vec::new();
        }
        self.open = false;
        self.rx.clear();
        self.keys = None;
        let steps = self.correlator.close_session();
        self.drive(steps, now)
    }

    fn on_frame(
        &mut self,
        service_id: u8,
        command_id: u8,
        payload: Vec<u8>,
        now: Instant,
    ) -> Vec<SessionEvent> {
        let payload = match self.correlator.front_encrypted(service_id, command_id) {
            Some(true) => {
                let opened = self.keys.as_ref().map(|keys| keys.open(&payload));
                match opened {
                    Some(Ok(plain)) => plain,
                    _ => {
                        warn!(
                            "response failed authentication service=0x{service_id:02X} command=0x{command_id:02X}"
                        );
                        let steps = self.correlator.fail_front(
                            service_id,
                            command_id,
                            RequestError::AuthFailed,
                            now,
                        );
                        return self.drive(steps, now);
                    }
                }
            }
            _ => payload,
        };
        let steps = self.correlator.on_frame(service_id, command_id, payload, now);
        self.drive(steps, now)
    }

    /// Submit the transfer's current request through the correlator and
    /// remember the handle for cancellation.
    fn enqueue_transfer_submit(&mut self, id: TransferId, now: Instant) -> Vec<CorrelatorStep> {
        let Some(request) = self
            .transfers
            .get_mut(&id)
            .and_then(|transfer| transfer.build_request())
        else {
            return Vec::new();
        };
        let (handle, steps) = self.correlator.submit(
            Request {
                service_id: request.service_id,
                command_id: request.command_id,
                payload: PayloadSource::TransferBlock(id),
                encrypted: request.encrypted,
                policy: self.config.request_policy(),
                sink: ResponseSink::Transfer(id),
            },
            now,
        );
        self.in_flight.insert(id, handle);
        steps
    }

    /// Worklist executor. Correlator steps can produce transfer steps, which
    /// can produce further correlator steps; everything drains here before
    /// events go back to the host.
    fn drive(&mut self, steps: Vec<CorrelatorStep>, now: Instant) -> Vec<SessionEvent> {
        let mut work = VecDeque::from(steps);
        let mut events = Vec::new();
        while let Some(step) = work.pop_front() {
            match step {
                CorrelatorStep::Transmit {
                    handle,
                    service_id,
                    command_id,
                    payload,
                    encrypted,
                } => {
                    let bytes = match payload {
                        PayloadSource::Fixed(bytes) => bytes,
                        PayloadSource::TransferBlock(id) => {
                            let rebuilt = self
                                .transfers
                                .get_mut(&id)
                                .and_then(|transfer| transfer.build_request());
                            match rebuilt {
                                Some(request) => request.payload,
                                None => {
                                    debug!("transfer {id} gone before transmit");
                                    work.extend(self.correlator.fail_handle(
                                        handle,
                                        RequestError::Rejected("transfer no longer active"),
                                        now,
                                    ));
                                    continue;
                                }
                            }
                        }
                    };
                    let on_wire = if encrypted {
                        match self.keys.as_mut().map(|keys| keys.seal(&bytes)) {
                            Some(Ok(sealed)) => sealed,
                            _ => {
                                warn!(
                                    "cannot seal request service=0x{service_id:02X} command=0x{command_id:02X}"
                                );
                                work.extend(self.correlator.fail_handle(
                                    handle,
                                    RequestError::Rejected("sealing failed"),
                                    now,
                                ));
                                continue;
                            }
                        }
                    } else {
                        bytes
                    };
                    match frame::encode(self.variant, service_id, command_id, &on_wire) {
                        Ok(wire_bytes) => events.push(SessionEvent::Send(wire_bytes)),
                        Err(err) => {
                            warn!(
                                "cannot frame request service=0x{service_id:02X} command=0x{command_id:02X}: {err}"
                            );
                            work.extend(self.correlator.fail_handle(
                                handle,
                                RequestError::Rejected("payload does not fit a frame"),
                                now,
                            ));
                        }
                    }
                }
                CorrelatorStep::Deliver { sink, outcome } => match sink {
                    ResponseSink::Callback(callback) => callback(outcome),
                    ResponseSink::Transfer(id) => {
                        self.in_flight.remove(&id);
                        let Some(transfer) = self.transfers.get_mut(&id) else {
                            debug!("outcome for unknown transfer {id}");
                            continue;
                        };
                        let transfer_steps = match outcome {
                            ResponseOutcome::Payload(payload) => transfer.on_payload(&payload),
                            ResponseOutcome::Failed(error) => transfer.on_request_failed(error),
                        };
                        for transfer_step in transfer_steps {
                            match transfer_step {
                                TransferStep::Submit => {
                                    let steps = self.enqueue_transfer_submit(id, now);
                                    work.extend(steps);
                                }
                                TransferStep::Progress { offset, total } => {
                                    events.push(SessionEvent::TransferProgress { id, offset, total });
                                }
                                TransferStep::Complete { state, data } => {
                                    self.transfers.remove(&id);
                                    events.push(SessionEvent::TransferComplete { id, state, data });
                                }
                                TransferStep::Failed { reason, state } => {
                                    self.transfers.remove(&id);
                                    events.push(SessionEvent::TransferFailed { id, reason, state });
                                }
                            }
                        }
                    }
                },
            }
        }
        events
    }
}

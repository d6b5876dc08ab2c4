//! Chunked file transfer: probe the size, request blocks in sequence, retry at
//! the same offset, resume from a persisted state.

use std::fmt;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::correlator::RequestError;
use crate::frame::ProtocolVariant;

/// Legacy file service: path-addressed, big-endian fields, fixed block size.
pub const LEGACY_FILE_SERVICE: u8 = 0x0A;
pub const LEGACY_FILE_INFO: u8 = 0x01;
pub const LEGACY_FILE_BLOCK: u8 = 0x02;

/// New-sync file service: id-addressed, little-endian fields, negotiable blocks.
pub const NEW_SYNC_FILE_SERVICE: u8 = 0x2C;
pub const NEW_SYNC_FILE_INFO: u8 = 0x01;
pub const NEW_SYNC_FILE_BLOCK: u8 = 0x03;

/// Identity of one transfer, independent of the file it fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferId([u8; 16]);

impl TransferId {
    pub fn new() -> Self {
        TransferId(uuid::Uuid::new_v4().into_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// How a vendor addresses a file: legacy by path, new-sync by numeric id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileId {
    Path(String),
    Id(u32),
}

/// One in-progress download. The only state a host may persist; re-supplying
/// it to `FileTransfer::resume` continues at `current_offset`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileTransferState {
    pub file: FileId,
    /// Unknown until the probe response arrives.
    pub total_size: Option<u64>,
    /// Monotonically non-decreasing; the transfer is complete when it reaches
    /// `total_size`.
    pub current_offset: u64,
    pub block_size: u32,
    pub variant: ProtocolVariant,
    pub encrypted: bool,
    /// Whole-file digest announced by new-sync devices, verified on completion.
    pub expected_sha256: Option<[u8; 32]>,
}

impl FileTransferState {
    pub fn to_bytes(&self) -> Result<Vec<u8>, TransferError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransferError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Tunables handed in by the session layer.
#[derive(Debug, Clone, Copy)]
pub struct TransferOptions {
    /// Recoverable failures tolerated at one offset before the transfer fails.
    pub retry_budget: u32,
    /// Floor for new-sync block-size negotiation.
    pub min_block_size: u32,
    /// Ask new-sync devices to send file data outside the sealed channel.
    pub plaintext_blocks: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            retry_budget: 3,
            min_block_size: 256,
            plaintext_blocks: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Probing,
    Requesting,
    AwaitingBlock,
    Complete,
    Failed,
}

/// One request the session should put on the wire for this transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub service_id: u8,
    pub command_id: u8,
    pub payload: Vec<u8>,
    pub encrypted: bool,
}

/// What the session must do after feeding a transfer a response.
#[derive(Debug)]
pub enum TransferStep {
    /// Submit the transfer's current request through the correlator.
    Submit,
    Progress {
        offset: u64,
        total: Option<u64>,
    },
    /// Terminal; emitted exactly once. `data` holds the bytes received since
    /// the transfer's starting offset.
    Complete {
        state: FileTransferState,
        data: Vec<u8>,
    },
    /// Terminal; emitted exactly once. The state snapshot is resumable when
    /// the reason is `Interrupted`.
    Failed {
        reason: TransferError,
        state: FileTransferState,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("session closed before the transfer finished")]
    Interrupted,
    #[error("retry budget exhausted at offset {offset}")]
    RetryBudgetExhausted { offset: u64 },
    #[error("malformed transfer exchange: {0}")]
    Malformed(&'static str),
    #[error("offset beyond what this protocol can address")]
    UnsupportedSize,
    #[error("assembled file failed digest verification")]
    ChecksumMismatch,
    #[error("transfer cancelled")]
    Cancelled,
    #[error("state serialization failed: {0}")]
    Persist(#[from] bincode::Error),
}

/// Driver for one download. Sequential by construction: block N is
/// acknowledged before block N+1 is requested.
pub struct FileTransfer {
    id: TransferId,
    state: FileTransferState,
    phase: Phase,
    options: TransferOptions,
    attempts_at_offset: u32,
    start_offset: u64,
    data: Vec<u8>,
}

impl FileTransfer {
    /// Fresh transfer. Probes the file size first; `resume_from` lets a host
    /// that persisted its own partial data skip ahead without a stored state.
    pub fn begin(
        file: FileId,
        variant: ProtocolVariant,
        encrypted: bool,
        block_size: u32,
        resume_from: u64,
        options: TransferOptions,
    ) -> Result<Self, TransferError> {
        check_addressing(&file, variant, resume_from)?;
        let block_size = clamp_block_size(block_size, variant);
        Ok(Self {
            id: TransferId::new(),
            state: FileTransferState {
                file,
                total_size: None,
                current_offset: resume_from,
                block_size,
                variant,
                encrypted,
                expected_sha256: None,
            },
            phase: Phase::Probing,
            options,
            attempts_at_offset: 0,
            start_offset: resume_from,
            data: Vec::new(),
        })
    }

    /// Continue a persisted transfer at its recorded offset. The device file
    /// is assumed unchanged since the state was captured.
    pub fn resume(
        state: FileTransferState,
        options: TransferOptions,
    ) -> Result<Self, TransferError> {
        check_addressing(&state.file, state.variant, state.current_offset)?;
        let phase = match state.total_size {
            Some(total) if state.current_offset > total => {
                return Err(TransferError::Malformed("resume offset past end of file"))
            }
            Some(total) if state.current_offset == total => {
                return Err(TransferError::Malformed("state is already complete"))
            }
            Some(_) => Phase::Requesting,
            None => Phase::Probing,
        };
        let start_offset = state.current_offset;
        Ok(Self {
            id: TransferId::new(),
            state: FileTransferState {
                block_size: clamp_block_size(state.block_size, state.variant),
                ..state
            },
            phase,
            options,
            attempts_at_offset: 0,
            start_offset,
            data: Vec::new(),
        })
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn state(&self) -> &FileTransferState {
        &self.state
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, Phase::Complete | Phase::Failed)
    }

    /// The request for the current phase and offset, rebuilt on every call so
    /// submissions and retransmissions both read the live state. `None` once
    /// the transfer is terminal.
    pub fn build_request(&mut self) -> Option<TransferRequest> {
        match self.phase {
            Phase::Probing => Some(self.info_request()),
            Phase::Requesting => {
                self.phase = Phase::AwaitingBlock;
                Some(self.block_request())
            }
            Phase::AwaitingBlock => Some(self.block_request()),
            Phase::Complete | Phase::Failed => None,
        }
    }

    /// Feed the response payload of the transfer's in-flight request.
    pub fn on_payload(&mut self, payload: &[u8]) -> Vec<TransferStep> {
        match self.phase {
            Phase::Probing => self.on_info(payload),
            Phase::AwaitingBlock => self.on_block(payload),
            Phase::Requesting => {
                debug!("transfer {}: response while re-requesting, ignored", self.id);
                Vec::new()
            }
            Phase::Complete | Phase::Failed => {
                debug!("transfer {}: response after terminal state, ignored", self.id);
                Vec::new()
            }
        }
    }

    /// Feed the failure of the transfer's in-flight request.
    pub fn on_request_failed(&mut self, error: RequestError) -> Vec<TransferStep> {
        if self.is_terminal() {
            return Vec::new();
        }
        match error {
            RequestError::SessionClosed => self.fail(TransferError::Interrupted),
            RequestError::Cancelled => self.fail(TransferError::Cancelled),
            RequestError::Rejected(reason) => self.fail(TransferError::Malformed(reason)),
            RequestError::TimedOut { .. } | RequestError::AuthFailed => {
                self.recoverable("request failed")
            }
        }
    }

    fn on_info(&mut self, payload: &[u8]) -> Vec<TransferStep> {
        let parsed = match self.state.variant {
            ProtocolVariant::Legacy => parse_info_legacy(payload).map(|t| (t, None)),
            ProtocolVariant::NewSync => parse_info_new_sync(payload),
        };
        let Some((total, digest)) = parsed else {
            return self.recoverable("unparseable file info");
        };
        if self.state.current_offset > total {
            return self.fail(TransferError::Malformed("resume offset past end of file"));
        }
        self.state.total_size = Some(total);
        self.state.expected_sha256 = digest;
        self.attempts_at_offset = 0;
        let mut steps = vec![TransferStep::Progress {
            offset: self.state.current_offset,
            total: Some(total),
        }];
        if self.state.current_offset == total {
            steps.extend(self.finalize());
        } else {
            self.phase = Phase::Requesting;
            steps.push(TransferStep::Submit);
        }
        steps
    }

    fn on_block(&mut self, payload: &[u8]) -> Vec<TransferStep> {
        let total = self.state.total_size.unwrap_or(0);
        let parsed = match self.state.variant {
            ProtocolVariant::Legacy => parse_block_legacy(payload),
            ProtocolVariant::NewSync => parse_block_new_sync(payload),
        };
        let Some((echo, data)) = parsed else {
            return self.recoverable("unparseable block");
        };
        if echo != self.state.current_offset {
            warn!(
                "transfer {}: block echoes offset {echo}, expected {}",
                self.id, self.state.current_offset
            );
            return self.recoverable("offset echo mismatch");
        }
        if data.is_empty() {
            return self.recoverable("empty block");
        }
        let len = data.len() as u64;
        if self.state.current_offset + len > total {
            return self.recoverable("block overruns file size");
        }
        let requested = block_span(&self.state, total);
        if self.state.variant == ProtocolVariant::Legacy
            && len < requested
            && self.state.current_offset + len != total
        {
            return self.recoverable("short block before end of file");
        }
        self.data.extend_from_slice(data);
        self.state.current_offset += len;
        self.attempts_at_offset = 0;
        let mut steps = vec![TransferStep::Progress {
            offset: self.state.current_offset,
            total: Some(total),
        }];
        if self.state.current_offset == total {
            steps.extend(self.finalize());
        } else {
            self.phase = Phase::Requesting;
            steps.push(TransferStep::Submit);
        }
        steps
    }

    /// Charge one recoverable failure against the budget; re-request at the
    /// same offset while it lasts.
    fn recoverable(&mut self, reason: &'static str) -> Vec<TransferStep> {
        self.attempts_at_offset += 1;
        if self.attempts_at_offset > self.options.retry_budget {
            return self.fail(TransferError::RetryBudgetExhausted {
                offset: self.state.current_offset,
            });
        }
        if self.state.variant == ProtocolVariant::NewSync && self.attempts_at_offset >= 2 {
            let shrunk = (self.state.block_size / 2).max(self.options.min_block_size);
            if shrunk < self.state.block_size {
                debug!(
                    "transfer {}: shrinking block size {} -> {shrunk}",
                    self.id, self.state.block_size
                );
                self.state.block_size = shrunk;
            }
        }
        debug!(
            "transfer {}: {reason}, retrying at offset {} ({} of {})",
            self.id, self.state.current_offset, self.attempts_at_offset, self.options.retry_budget
        );
        self.phase = Phase::Requesting;
        vec![TransferStep::Submit]
    }

    fn fail(&mut self, reason: TransferError) -> Vec<TransferStep> {
        self.phase = Phase::Failed;
        vec![TransferStep::Failed {
            reason,
            state: self.state.clone(),
        }]
    }

    fn finalize(&mut self) -> Vec<TransferStep> {
        if self.start_offset == 0 {
            if let Some(expected) = self.state.expected_sha256 {
                let digest: [u8; 32] = Sha256::digest(&self.data).into();
                if digest != expected {
                    return self.fail(TransferError::ChecksumMismatch);
                }
            }
        }
        self.phase = Phase::Complete;
        vec![TransferStep::Complete {
            state: self.state.clone(),
            data: std::mem::take(&mut self.data),
        }]
    }

    fn info_request(&self) -> TransferRequest {
        match (&self.state.file, self.state.variant) {
            (FileId::Path(path), ProtocolVariant::Legacy) => {
                let mut payload = Vec::with_capacity(1 + path.len());
                payload.push(path.len() as u8);
                payload.extend_from_slice(path.as_bytes());
                TransferRequest {
                    service_id: LEGACY_FILE_SERVICE,
                    command_id: LEGACY_FILE_INFO,
                    payload,
                    encrypted: self.state.encrypted,
                }
            }
            (FileId::Id(file_id), ProtocolVariant::NewSync) => TransferRequest {
                service_id: NEW_SYNC_FILE_SERVICE,
                command_id: NEW_SYNC_FILE_INFO,
                payload: file_id.to_le_bytes().to_vec(),
                encrypted: self.state.encrypted,
            },
            _ => unreachable!("addressing checked at construction"),
        }
    }

    fn block_request(&self) -> TransferRequest {
        let total = self.state.total_size.unwrap_or(0);
        let span = block_span(&self.state, total) as u32;
        match (&self.state.file, self.state.variant) {
            (FileId::Path(path), ProtocolVariant::Legacy) => {
                let mut payload = Vec::with_capacity(1 + path.len() + 6);
                payload.push(path.len() as u8);
                payload.extend_from_slice(path.as_bytes());
                payload.extend_from_slice(&(self.state.current_offset as u32).to_be_bytes());
                payload.extend_from_slice(&(span as u16).to_be_bytes());
                TransferRequest {
                    service_id: LEGACY_FILE_SERVICE,
                    command_id: LEGACY_FILE_BLOCK,
                    payload,
                    encrypted: self.state.encrypted,
                }
            }
            (FileId::Id(file_id), ProtocolVariant::NewSync) => {
                let no_encrypt = self.state.encrypted && self.options.plaintext_blocks;
                let mut payload = Vec::with_capacity(4 + 8 + 4 + 1);
                payload.extend_from_slice(&file_id.to_le_bytes());
                payload.extend_from_slice(&self.state.current_offset.to_le_bytes());
                payload.extend_from_slice(&span.to_le_bytes());
                payload.push(no_encrypt as u8);
                TransferRequest {
                    service_id: NEW_SYNC_FILE_SERVICE,
                    command_id: NEW_SYNC_FILE_BLOCK,
                    payload,
                    encrypted: self.state.encrypted && !self.options.plaintext_blocks,
                }
            }
            _ => unreachable!("addressing checked at construction"),
        }
    }
}

/// Bytes the next block request asks for: a full block, or the tail.
fn block_span(state: &FileTransferState, total: u64) -> u64 {
    let remaining = total.saturating_sub(state.current_offset);
    remaining.min(u64::from(state.block_size.max(1)))
}

fn check_addressing(
    file: &FileId,
    variant: ProtocolVariant,
    offset: u64,
) -> Result<(), TransferError> {
    match (file, variant) {
        (FileId::Path(path), ProtocolVariant::Legacy) => {
            if path.is_empty() || path.len() > u8::MAX as usize {
                Err(TransferError::Malformed("legacy path length out of range"))
            } else if offset > u64::from(u32::MAX) {
                // Legacy offsets are u32 on the wire.
                Err(TransferError::UnsupportedSize)
            } else {
                Ok(())
            }
        }
        (FileId::Id(_), ProtocolVariant::NewSync) => Ok(()),
        (FileId::Id(_), ProtocolVariant::Legacy) => {
            Err(TransferError::Malformed("legacy transfers address files by path"))
        }
        (FileId::Path(_), ProtocolVariant::NewSync) => {
            Err(TransferError::Malformed("new-sync transfers address files by id"))
        }
    }
}

fn clamp_block_size(block_size: u32, variant: ProtocolVariant) -> u32 {
    let block_size = block_size.max(1);
    match variant {
        ProtocolVariant::Legacy => block_size.min(u16::MAX as u32),
        ProtocolVariant::NewSync => block_size,
    }
}

/// Legacy info response: u32 BE total size.
fn parse_info_legacy(payload: &[u8]) -> Option<u64> {
    let bytes: [u8; 4] = payload.get(..4)?.try_into().ok()?;
    Some(u64::from(u32::from_be_bytes(bytes)))
}

/// New-sync info response: u64 LE total size, a digest-present flag, then the
/// optional whole-file SHA-256.
fn parse_info_new_sync(payload: &[u8]) -> Option<(u64, Option<[u8; 32]>)> {
    let size_bytes: [u8; 8] = payload.get(..8)?.try_into().ok()?;
    let total = u64::from_le_bytes(size_bytes);
    let has_digest = *payload.get(8)?;
    let digest = match has_digest {
        0 => None,
        1 => {
            let digest: [u8; 32] = payload.get(9..41)?.try_into().ok()?;
            Some(digest)
        }
        _ => return None,
    };
    Some((total, digest))
}

/// Legacy block response: u32 BE echoed offset, then the data.
fn parse_block_legacy(payload: &[u8]) -> Option<(u64, &[u8])> {
    let offset_bytes: [u8; 4] = payload.get(..4)?.try_into().ok()?;
    Some((u64::from(u32::from_be_bytes(offset_bytes)), &payload[4..]))
}

/// New-sync block response: u64 LE echoed offset, then the data.
fn parse_block_new_sync(payload: &[u8]) -> Option<(u64, &[u8])> {
    let offset_bytes: [u8; 8] = payload.get(..8)?.try_into().ok()?;
    Some((u64::from_le_bytes(offset_bytes), &payload[8..]))
}

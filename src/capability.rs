// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Abstract capabilities the engine depends on but does not implement.
//!
//! The wire client and the cryptographic protocol are external collaborators.
//! Jobs only ever see these traits; tests substitute scripted fakes.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::identifiers::RecipientId;

/// A network operation requested by a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkRequest {
    /// Deliver an encrypted envelope to a single recipient.
    SendEnvelope {
        recipient: RecipientId,
        ciphertext: Vec<u8>,
    },
    /// Obtain a signed upload location for an attachment of the given size.
    ProvisionUpload { size: u64 },
    /// Query how many bytes the server has already committed for an upload.
    QueryUploadOffset { location: String },
    /// Transfer a range of bytes starting at `offset`.
    UploadRange {
        location: String,
        offset: u64,
        bytes: Vec<u8>,
    },
    /// Deliver batched receipts for messages in a thread.
    SendReceipts {
        thread: String,
        receipts: Vec<(String, String)>,
    },
    /// Replace the account attributes stored on the server.
    SetAccountAttributes { attributes: Vec<u8> },
    /// Upload a fresh pre-key bundle.
    RotateKeys { bundle: Vec<u8> },
}

/// Payload of a successful network operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    Empty,
    UploadProvisioned { location: String },
    UploadOffset { offset: u64 },
    /// The server acknowledges a completed upload with the digest it computed.
    UploadComplete { digest: Vec<u8> },
}

/// Outcome of a network operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkResponse {
    Success(ResponseBody),
    /// Transient transport failure (unreachable, 5xx, timeout).
    NetworkFailure,
    /// The server asks us to back off, optionally for a specific duration.
    RateLimited { retry_after: Option<Duration> },
    /// Permanent failure with a server-assigned code (e.g. 404 unregistered).
    PermanentFailure { code: u16 },
}

#[async_trait]
pub trait NetworkCapability: Send + Sync {
    async fn perform(&self, request: NetworkRequest) -> NetworkResponse;
}

/// Error raised by the encryption capability.
#[derive(Debug, thiserror::Error)]
pub enum EncryptError {
    /// The recipient's identity key changed since it was last verified.
    #[error("untrusted identity for {recipient}")]
    UntrustedIdentity {
        recipient: RecipientId,
        identity_key: Vec<u8>,
    },
    #[error("invalid pre-key bundle for {recipient}")]
    InvalidPreKeyBundle { recipient: RecipientId },
}

#[async_trait]
pub trait CryptoCapability: Send + Sync {
    /// Encrypts and envelopes a plaintext for a single recipient.
    async fn encrypt_and_envelope(
        &self,
        plaintext: &[u8],
        recipient: RecipientId,
    ) -> Result<Vec<u8>, EncryptError>;
}

/// Monotonic-enough time source for lifespan and backoff computation.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

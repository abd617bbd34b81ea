// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Resumable upload sub-protocol.
//!
//! An upload obtains a signed upload location, queries the committed byte
//! offset and only transfers the remainder, so resuming after a crash never
//! re-sends acknowledged bytes. A SHA-256 digest computed while streaming is
//! compared against the server's acknowledgment; a mismatch is a permanent
//! failure, not retried blindly.

use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::capability::{NetworkCapability, NetworkRequest, NetworkResponse, ResponseBody};

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("transient network failure")]
    Transient,
    #[error("rate limited")]
    RateLimited(Option<Duration>),
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },
    #[error("permanent upload failure (code {0})")]
    Permanent(u16),
    #[error("upload protocol violation: {0}")]
    Protocol(String),
}

impl UploadError {
    /// Whether the job running this upload should retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, UploadError::Transient)
    }
}

pub struct ResumableUpload<'a> {
    network: &'a dyn NetworkCapability,
    chunk_size: usize,
}

impl<'a> ResumableUpload<'a> {
    pub fn new(network: &'a dyn NetworkCapability, chunk_size: usize) -> Self {
        debug_assert!(chunk_size > 0);
        Self {
            network,
            chunk_size,
        }
    }

    /// Obtains a signed upload location for content of the given size.
    pub async fn provision(&self, size: u64) -> Result<String, UploadError> {
        match self
            .network
            .perform(NetworkRequest::ProvisionUpload { size })
            .await
        {
            NetworkResponse::Success(ResponseBody::UploadProvisioned { location }) => Ok(location),
            NetworkResponse::Success(other) => Err(UploadError::Protocol(format!(
                "unexpected provision response: {other:?}"
            ))),
            other => Err(classify(other)),
        }
    }

    /// Transfers the not-yet-committed remainder of `content` and verifies
    /// the server's digest acknowledgment.
    ///
    /// Returns the verified digest.
    pub async fn resume(&self, location: &str, content: &[u8]) -> Result<Vec<u8>, UploadError> {
        let offset = self.query_offset(location).await?;
        if offset > content.len() as u64 {
            return Err(UploadError::Protocol(format!(
                "server committed offset {offset} beyond content length {}",
                content.len()
            )));
        }

        // The digest covers the whole content, including bytes that were
        // acknowledged before a previous interruption.
        let mut hasher = Sha256::new();
        hasher.update(&content[..offset as usize]);

        debug!(offset, total = content.len(), "resuming upload");

        let mut sent = offset as usize;
        let acknowledged = loop {
            let end = (sent + self.chunk_size).min(content.len());
            let chunk = &content[sent..end];
            hasher.update(chunk);
            let response = self
                .network
                .perform(NetworkRequest::UploadRange {
                    location: location.to_owned(),
                    offset: sent as u64,
                    bytes: chunk.to_vec(),
                })
                .await;
            sent = end;
            match response {
                NetworkResponse::Success(ResponseBody::UploadComplete { digest }) => break digest,
                NetworkResponse::Success(ResponseBody::Empty) if sent < content.len() => continue,
                NetworkResponse::Success(other) => {
                    return Err(UploadError::Protocol(format!(
                        "unexpected range response: {other:?}"
                    )));
                }
                other => return Err(classify(other)),
            }
        };

        let computed = hasher.finalize().to_vec();
        if computed != acknowledged {
            return Err(UploadError::DigestMismatch {
                expected: hex::encode(&computed),
                actual: hex::encode(&acknowledged),
            });
        }
        Ok(computed)
    }

    async fn query_offset(&self, location: &str) -> Result<u64, UploadError> {
        match self
            .network
            .perform(NetworkRequest::QueryUploadOffset {
                location: location.to_owned(),
            })
            .await
        {
            NetworkResponse::Success(ResponseBody::UploadOffset { offset }) => Ok(offset),
            NetworkResponse::Success(other) => Err(UploadError::Protocol(format!(
                "unexpected offset response: {other:?}"
            ))),
            other => Err(classify(other)),
        }
    }
}

fn classify(response: NetworkResponse) -> UploadError {
    match response {
        NetworkResponse::NetworkFailure => UploadError::Transient,
        NetworkResponse::RateLimited { retry_after } => UploadError::RateLimited(retry_after),
        NetworkResponse::PermanentFailure { code } => UploadError::Permanent(code),
        NetworkResponse::Success(_) => unreachable!("success handled by callers"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    /// An in-memory upload endpoint with a scriptable committed prefix.
    struct FakeUploadServer {
        state: Mutex<ServerState>,
        /// Corrupt the acknowledged digest to simulate data damage in transit.
        tamper_digest: bool,
    }

    struct ServerState {
        declared_size: u64,
        committed: Vec<u8>,
        received_bytes: usize,
        /// Fail the n-th range request with a network failure.
        fail_range_at: Option<usize>,
        range_requests: usize,
    }

    impl FakeUploadServer {
        fn new() -> Self {
            Self {
                state: Mutex::new(ServerState {
                    declared_size: 0,
                    committed: Vec::new(),
                    received_bytes: 0,
                    fail_range_at: None,
                    range_requests: 0,
                }),
                tamper_digest: false,
            }
        }

        fn with_committed_prefix(self, prefix: &[u8]) -> Self {
            self.state.lock().unwrap().committed = prefix.to_vec();
            self
        }

        fn received_bytes(&self) -> usize {
            self.state.lock().unwrap().received_bytes
        }
    }

    #[async_trait]
    impl NetworkCapability for FakeUploadServer {
        async fn perform(&self, request: NetworkRequest) -> NetworkResponse {
            let mut state = self.state.lock().unwrap();
            match request {
                NetworkRequest::ProvisionUpload { size } => {
                    state.declared_size = size;
                    NetworkResponse::Success(ResponseBody::UploadProvisioned {
                        location: "upload/1".to_owned(),
                    })
                }
                NetworkRequest::QueryUploadOffset { .. } => {
                    NetworkResponse::Success(ResponseBody::UploadOffset {
                        offset: state.committed.len() as u64,
                    })
                }
                NetworkRequest::UploadRange { offset, bytes, .. } => {
                    state.range_requests += 1;
                    if state.fail_range_at == Some(state.range_requests) {
                        return NetworkResponse::NetworkFailure;
                    }
                    assert_eq!(offset, state.committed.len() as u64, "offset gap");
                    state.received_bytes += bytes.len();
                    state.committed.extend_from_slice(&bytes);
                    if state.committed.len() as u64 >= state.declared_size {
                        let mut digest = Sha256::digest(&state.committed).to_vec();
                        if self.tamper_digest {
                            digest[0] ^= 0xff;
                        }
                        NetworkResponse::Success(ResponseBody::UploadComplete { digest })
                    } else {
                        NetworkResponse::Success(ResponseBody::Empty)
                    }
                }
                other => panic!("unexpected request: {other:?}"),
            }
        }
    }

    const CONTENT: &[u8] = b"0123456789abcdef0123456789abcdef";

    #[tokio::test]
    async fn uploads_in_chunks_and_verifies_digest() {
        let server = FakeUploadServer::new();
        let upload = ResumableUpload::new(&server, 8);
        let location = upload.provision(CONTENT.len() as u64).await.unwrap();
        let digest = upload.resume(&location, CONTENT).await.unwrap();
        assert_eq!(digest, Sha256::digest(CONTENT).to_vec());
        assert_eq!(server.received_bytes(), CONTENT.len());
    }

    #[tokio::test]
    async fn resume_does_not_resend_acknowledged_bytes() {
        let server = FakeUploadServer::new().with_committed_prefix(&CONTENT[..20]);
        server.state.lock().unwrap().declared_size = CONTENT.len() as u64;
        let upload = ResumableUpload::new(&server, 8);
        let digest = upload.resume("upload/1", CONTENT).await.unwrap();
        assert_eq!(digest, Sha256::digest(CONTENT).to_vec());
        assert_eq!(server.received_bytes(), CONTENT.len() - 20);
    }

    #[tokio::test]
    async fn digest_mismatch_is_permanent() {
        let mut server = FakeUploadServer::new();
        server.tamper_digest = true;
        let upload = ResumableUpload::new(&server, 8);
        let location = upload.provision(CONTENT.len() as u64).await.unwrap();
        let error = upload.resume(&location, CONTENT).await.unwrap_err();
        assert!(matches!(error, UploadError::DigestMismatch { .. }));
        assert!(!error.is_transient());
    }

    #[tokio::test]
    async fn transport_failures_are_transient() {
        let server = FakeUploadServer::new();
        server.state.lock().unwrap().fail_range_at = Some(2);
        let upload = ResumableUpload::new(&server, 8);
        let location = upload.provision(CONTENT.len() as u64).await.unwrap();
        let error = upload.resume(&location, CONTENT).await.unwrap_err();
        assert!(error.is_transient());
    }

    #[tokio::test]
    async fn offset_beyond_content_is_a_protocol_error() {
        let server = FakeUploadServer::new().with_committed_prefix(&[0u8; 64]);
        let upload = ResumableUpload::new(&server, 8);
        let error = upload.resume("upload/1", CONTENT).await.unwrap_err();
        assert!(matches!(error, UploadError::Protocol(_)));
    }
}

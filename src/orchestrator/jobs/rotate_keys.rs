// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    capability::NetworkRequest,
    scheduler::job::{Executable, JobContext, JobOutcome},
};

use super::single_request_outcome;

#[derive(Debug, Serialize, Deserialize)]
pub struct RotateKeysPayload {
    pub bundle: Vec<u8>,
}

/// Uploads a fresh pre-key bundle.
pub struct RotateKeysJob {
    payload: RotateKeysPayload,
}

impl RotateKeysJob {
    pub fn new(bundle: Vec<u8>) -> Self {
        Self {
            payload: RotateKeysPayload { bundle },
        }
    }

    pub(crate) fn from_payload(payload: &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            payload: serde_json::from_slice(payload)?,
        })
    }

    pub fn payload_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.payload).expect("infallible serialization")
    }
}

#[async_trait]
impl Executable for RotateKeysJob {
    async fn run(&mut self, ctx: &JobContext) -> JobOutcome {
        let response = ctx
            .network
            .perform(NetworkRequest::RotateKeys {
                bundle: self.payload.bundle.clone(),
            })
            .await;
        single_request_outcome(response)
    }
}

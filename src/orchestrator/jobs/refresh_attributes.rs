// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::{
    capability::{NetworkRequest, NetworkResponse},
    scheduler::job::{Executable, JobContext, JobOutcome},
};

use super::single_request_outcome;

#[derive(Debug, Serialize, Deserialize)]
pub struct RefreshAttributesPayload {
    pub attributes: Vec<u8>,
}

/// Re-uploads the account attributes stored on the server.
///
/// Runs at most once per scheduler cycle: later instances short-circuit on
/// the process-scoped flag, which is cleared again at scheduler startup.
pub struct RefreshAttributesJob {
    payload: RefreshAttributesPayload,
}

impl RefreshAttributesJob {
    pub fn new(attributes: Vec<u8>) -> Self {
        Self {
            payload: RefreshAttributesPayload { attributes },
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
impl Executable for RefreshAttributesJob {
    async fn run(&mut self, ctx: &JobContext) -> JobOutcome {
        if ctx.process_state.attributes_refreshed() {
            debug!("account attributes already refreshed this cycle");
            return JobOutcome::Success;
        }
        let response = ctx
            .network
            .perform(NetworkRequest::SetAccountAttributes {
                attributes: self.payload.attributes.clone(),
            })
            .await;
        if matches!(response, NetworkResponse::Success(_)) {
            ctx.process_state.mark_attributes_refreshed();
        }
        let outcome = single_request_outcome(response);
        if let JobOutcome::Failure(error) = &outcome {
            error!(%error, "attribute refresh rejected");
        }
        outcome
    }
}

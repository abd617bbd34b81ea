// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Durable job scheduling and send orchestration for the client component.
//!
//! The crate is built from two layers. The [`scheduler`] is a generic durable
//! job engine: jobs are persisted records with a retry/backoff/lifespan
//! policy, optional per-queue FIFO serialization, dependency edges and
//! constraint gates. The [`orchestrator`] expresses the messaging client's
//! outbound operations (sends with attachments, receipts, maintenance) as
//! jobs on that engine and reconciles partial failures per recipient.

pub mod capability;
pub mod config;
pub mod constraints;
pub mod events;
pub mod graph;
pub mod identifiers;
pub mod orchestrator;
pub mod scheduler;
pub mod store;
pub mod upload;
mod utils;

pub use capability::{Clock, CryptoCapability, NetworkCapability, SystemClock};
pub use config::SchedulerConfig;
pub use events::{EventSink, OutboundEvent};
pub use orchestrator::{MessageDraft, ReceiptStatus, SendOrchestrator, SkippedRecipientPolicy};
pub use scheduler::{JobScheduler, SchedulerHandle};
pub use store::open_client_db;

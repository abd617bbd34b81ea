// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-recipient reconciliation of a multi-recipient send attempt.
//!
//! A send to a conversation fans out to many recipients and may partially
//! fail. Reconciliation folds the per-recipient results of one attempt into
//! the failure sets carried by the outbox message and derives the attempt's
//! overall decision. The fold is pure; persisting the updated sets is the
//! send job's business.

use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use crate::identifiers::RecipientId;

/// Result of delivering to one recipient during one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecipientSendResult {
    Success,
    /// Transient transport failure; the recipient stays addressed.
    NetworkFailure,
    /// The recipient's identity key changed; requires user re-verification.
    IdentityMismatch { identity_key: Vec<u8> },
    /// The recipient no longer has an account; dropped from the send.
    Unregistered,
    /// The recipient's pre-key bundle is unusable; dropped from the send.
    InvalidPreKeyBundle,
    /// The server permanently rejected the envelope for this recipient;
    /// retrying the same request cannot succeed, so the recipient is dropped.
    Rejected,
    /// The server asked us to back off before reaching this recipient.
    RateLimited { retry_after: Option<Duration> },
}

/// Overall decision for one send attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendDecision {
    /// Every addressed recipient is accounted for; the message is sent.
    Sent,
    /// Network failures remain; retry with backoff, attempt counted.
    RetryNetwork,
    /// Identity mismatches remain; permanent until the user re-verifies.
    FailedIdentity,
    /// Back off without counting the attempt.
    RateLimited { retry_after: Option<Duration> },
}

/// The failure sets of a message going into an attempt.
#[derive(Debug, Default, Clone)]
pub struct PriorFailures {
    pub network_failures: HashSet<RecipientId>,
    pub identity_mismatches: HashMap<RecipientId, Vec<u8>>,
}

/// Updated failure sets and the attempt decision.
#[derive(Debug)]
pub struct Reconciliation {
    pub network_failures: HashSet<RecipientId>,
    pub identity_mismatches: HashMap<RecipientId, Vec<u8>>,
    /// Recipients dropped from the send during this attempt.
    pub newly_skipped: HashSet<RecipientId>,
    pub decision: SendDecision,
}

/// Folds one attempt's per-recipient results into the carried failure sets.
///
/// A success resolves the recipient from both failure sets. A skip
/// (unregistered, invalid pre-key bundle) drops the recipient from both sets
/// without counting as a failure. Rate-limited recipients were never reached;
/// they are retained as network failures so that the retry re-addresses them,
/// and the attempt as a whole is deferred without being counted.
pub fn reconcile(
    prior: &PriorFailures,
    results: &[(RecipientId, RecipientSendResult)],
) -> Reconciliation {
    let mut network_failures = prior.network_failures.clone();
    let mut identity_mismatches = prior.identity_mismatches.clone();
    let mut newly_skipped = HashSet::new();
    let mut rate_limited: Option<Option<Duration>> = None;

    for (recipient, result) in results {
        match result {
            RecipientSendResult::Success => {
                network_failures.remove(recipient);
                identity_mismatches.remove(recipient);
            }
            RecipientSendResult::NetworkFailure => {
                network_failures.insert(*recipient);
            }
            RecipientSendResult::IdentityMismatch { identity_key } => {
                network_failures.remove(recipient);
                identity_mismatches.insert(*recipient, identity_key.clone());
            }
            RecipientSendResult::Unregistered
            | RecipientSendResult::InvalidPreKeyBundle
            | RecipientSendResult::Rejected => {
                network_failures.remove(recipient);
                identity_mismatches.remove(recipient);
                newly_skipped.insert(*recipient);
            }
            RecipientSendResult::RateLimited { retry_after } => {
                network_failures.insert(*recipient);
                let retry_after = match rate_limited.take() {
                    Some(previous) => previous.max(*retry_after),
                    None => *retry_after,
                };
                rate_limited = Some(retry_after);
            }
        }
    }

    let decision = if let Some(retry_after) = rate_limited {
        SendDecision::RateLimited { retry_after }
    } else if network_failures.is_empty() && identity_mismatches.is_empty() {
        SendDecision::Sent
    } else if !identity_mismatches.is_empty() {
        SendDecision::FailedIdentity
    } else {
        SendDecision::RetryNetwork
    };

    Reconciliation {
        network_failures,
        identity_mismatches,
        newly_skipped,
        decision,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (RecipientId, RecipientId, RecipientId) {
        (
            RecipientId::random(),
            RecipientId::random(),
            RecipientId::random(),
        )
    }

    #[test]
    fn partial_failure_buckets_recipients() {
        let (a, b, c) = ids();
        let outcome = reconcile(
            &PriorFailures::default(),
            &[
                (a, RecipientSendResult::Success),
                (b, RecipientSendResult::NetworkFailure),
                (
                    c,
                    RecipientSendResult::IdentityMismatch {
                        identity_key: vec![7],
                    },
                ),
            ],
        );

        assert_eq!(outcome.network_failures, HashSet::from([b]));
        assert_eq!(outcome.identity_mismatches.keys().copied().collect::<Vec<_>>(), vec![c]);
        assert!(outcome.newly_skipped.is_empty());
        assert_eq!(outcome.decision, SendDecision::FailedIdentity);
    }

    #[test]
    fn success_network_failure_and_skip_bucket_in_one_attempt() {
        let (a, b, c) = ids();
        let outcome = reconcile(
            &PriorFailures::default(),
            &[
                (a, RecipientSendResult::Success),
                (b, RecipientSendResult::NetworkFailure),
                (c, RecipientSendResult::Unregistered),
            ],
        );

        assert_eq!(outcome.network_failures, HashSet::from([b]));
        assert!(outcome.identity_mismatches.is_empty());
        assert_eq!(outcome.newly_skipped, HashSet::from([c]));
        assert_eq!(outcome.decision, SendDecision::RetryNetwork);
    }

    #[test]
    fn server_rejections_drop_the_recipient_permanently() {
        let (a, b, _) = ids();
        let prior = PriorFailures {
            network_failures: HashSet::from([b]),
            identity_mismatches: HashMap::new(),
        };
        let outcome = reconcile(
            &prior,
            &[
                (a, RecipientSendResult::Success),
                (b, RecipientSendResult::Rejected),
            ],
        );

        assert!(outcome.network_failures.is_empty());
        assert_eq!(outcome.newly_skipped, HashSet::from([b]));
        // A rejected recipient never blocks the message from being sent.
        assert_eq!(outcome.decision, SendDecision::Sent);
    }

    #[test]
    fn successes_resolve_carried_failures() {
        let (_, b, c) = ids();
        let prior = PriorFailures {
            network_failures: HashSet::from([b]),
            identity_mismatches: HashMap::from([(c, vec![7])]),
        };
        let outcome = reconcile(
            &prior,
            &[
                (b, RecipientSendResult::Success),
                (c, RecipientSendResult::Success),
            ],
        );

        assert!(outcome.network_failures.is_empty());
        assert!(outcome.identity_mismatches.is_empty());
        assert_eq!(outcome.decision, SendDecision::Sent);
    }

    #[test]
    fn network_failures_alone_mean_retry() {
        let (a, b, _) = ids();
        let outcome = reconcile(
            &PriorFailures::default(),
            &[
                (a, RecipientSendResult::Success),
                (b, RecipientSendResult::NetworkFailure),
            ],
        );
        assert_eq!(outcome.decision, SendDecision::RetryNetwork);
    }

    #[test]
    fn skips_drop_recipients_from_both_sets() {
        let (a, b, _) = ids();
        let prior = PriorFailures {
            network_failures: HashSet::from([a]),
            identity_mismatches: HashMap::from([(b, vec![1])]),
        };
        let outcome = reconcile(
            &prior,
            &[
                (a, RecipientSendResult::Unregistered),
                (b, RecipientSendResult::InvalidPreKeyBundle),
            ],
        );

        assert!(outcome.network_failures.is_empty());
        assert!(outcome.identity_mismatches.is_empty());
        assert_eq!(outcome.newly_skipped, HashSet::from([a, b]));
        // Skipped recipients do not prevent the message from being sent.
        assert_eq!(outcome.decision, SendDecision::Sent);
    }

    #[test]
    fn rate_limits_defer_the_whole_attempt() {
        let (a, b, _) = ids();
        let outcome = reconcile(
            &PriorFailures::default(),
            &[
                (a, RecipientSendResult::Success),
                (
                    b,
                    RecipientSendResult::RateLimited {
                        retry_after: Some(Duration::from_secs(30)),
                    },
                ),
            ],
        );

        assert_eq!(
            outcome.decision,
            SendDecision::RateLimited {
                retry_after: Some(Duration::from_secs(30)),
            }
        );
        // The unreached recipient stays addressed for the retry.
        assert_eq!(outcome.network_failures, HashSet::from([b]));
    }

    #[test]
    fn identity_mismatch_wins_over_network_retry() {
        let (a, b, _) = ids();
        let outcome = reconcile(
            &PriorFailures::default(),
            &[
                (a, RecipientSendResult::NetworkFailure),
                (
                    b,
                    RecipientSendResult::IdentityMismatch {
                        identity_key: vec![2],
                    },
                ),
            ],
        );
        assert_eq!(outcome.decision, SendDecision::FailedIdentity);
    }
}

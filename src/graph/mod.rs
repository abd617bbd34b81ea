// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Deferred construction of job dependency graphs.
//!
//! A chain is built and validated entirely in memory before any record is
//! handed to the scheduler, so wiring a batch is all-or-nothing: a crash
//! between construction steps never leaves a half-built dependency chain in
//! the durable store.
//!
//! Attachment work is deduplicated through an arena keyed by the
//! content-addressed attachment id: the same binary content shared across
//! several outbound messages is compressed and uploaded exactly once.

use std::collections::{HashMap, HashSet};

use crate::{
    identifiers::{AttachmentId, JobId},
    scheduler::job::NewJob,
};

/// The jobs producing one logical artifact (a single attachment).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentNode {
    pub compress_job: JobId,
    pub upload_job: JobId,
}

#[derive(Debug, Default)]
pub struct JobChainBuilder {
    jobs: Vec<NewJob>,
    attachments: HashMap<AttachmentId, AttachmentNode>,
}

impl JobChainBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a job to the batch and returns its id.
    pub fn add(&mut self, job: NewJob) -> JobId {
        let id = job.id;
        self.jobs.push(job);
        id
    }

    /// Wires a compression → upload chain for an attachment, deduplicated by
    /// content id.
    ///
    /// `make` is only invoked the first time the content is seen; it returns
    /// the (compress, upload) job pair. The upload job is made to depend on
    /// the compression job.
    pub fn attachment_chain(
        &mut self,
        attachment_id: AttachmentId,
        make: impl FnOnce() -> (NewJob, NewJob),
    ) -> AttachmentNode {
        if let Some(node) = self.attachments.get(&attachment_id) {
            return *node;
        }
        let (compress, mut upload) = make();
        upload.depends_on.push(compress.id);
        let node = AttachmentNode {
            compress_job: compress.id,
            upload_job: upload.id,
        };
        self.jobs.push(compress);
        self.jobs.push(upload);
        self.attachments.insert(attachment_id, node);
        node
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Validates the batch and returns it ready for atomic enqueueing.
    ///
    /// Dependencies on ids outside the batch are allowed (they refer to jobs
    /// already persisted); within the batch every dependency must point at an
    /// earlier job, which rules out cycles.
    pub fn into_jobs(self) -> anyhow::Result<Vec<NewJob>> {
        let mut seen: HashSet<JobId> = HashSet::with_capacity(self.jobs.len());
        for job in &self.jobs {
            if !seen.insert(job.id) {
                anyhow::bail!("duplicate job id in chain: {}", job.id);
            }
        }
        let mut earlier: HashSet<JobId> = HashSet::with_capacity(self.jobs.len());
        for job in &self.jobs {
            for dependency in &job.depends_on {
                if seen.contains(dependency) && !earlier.contains(dependency) {
                    anyhow::bail!(
                        "job {} depends on {} which is not ordered before it",
                        job.id,
                        dependency
                    );
                }
            }
            earlier.insert(job.id);
        }
        Ok(self.jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(factory_key: &'static str) -> NewJob {
        NewJob::new(factory_key, Vec::new())
    }

    #[test]
    fn shared_content_is_wired_once() {
        let mut builder = JobChainBuilder::new();
        let content_id = AttachmentId::for_content(b"shared image bytes");

        let first = builder.attachment_chain(content_id.clone(), || {
            (job("compress-attachment"), job("upload-attachment"))
        });
        let second = builder.attachment_chain(content_id, || {
            panic!("attachment chain must be deduplicated")
        });

        assert_eq!(first, second);
        let jobs = builder.into_jobs().unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[1].depends_on, vec![first.compress_job]);
    }

    #[test]
    fn send_jobs_depend_on_their_uploads() {
        let mut builder = JobChainBuilder::new();
        let node = builder.attachment_chain(AttachmentId::for_content(b"media"), || {
            (job("compress-attachment"), job("upload-attachment"))
        });
        let send = builder.add(job("send-message").depends_on(node.upload_job));

        let jobs = builder.into_jobs().unwrap();
        assert_eq!(jobs.len(), 3);
        assert_eq!(jobs[2].id, send);
        assert_eq!(jobs[2].depends_on, vec![node.upload_job]);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut builder = JobChainBuilder::new();
        let first = job("send-message");
        let mut duplicate = job("send-message");
        duplicate.id = first.id;
        builder.add(first);
        builder.add(duplicate);
        assert!(builder.into_jobs().is_err());
    }

    #[test]
    fn forward_dependencies_within_the_batch_are_rejected() {
        let mut builder = JobChainBuilder::new();
        let later = job("upload-attachment");
        builder.add(job("send-message").depends_on(later.id));
        builder.add(later);
        assert!(builder.into_jobs().is_err());
    }

    #[test]
    fn external_dependencies_are_allowed() {
        let mut builder = JobChainBuilder::new();
        builder.add(job("send-message").depends_on(JobId::random()));
        assert!(builder.into_jobs().is_ok());
    }
}

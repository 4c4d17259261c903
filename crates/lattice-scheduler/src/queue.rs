//! Ready queue with concurrency-group accounting.

use crate::dag::DagNode;
use lattice_core::JobId;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

/// A ready job waiting for a free slot.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub id: JobId,
    /// Logical job name, used for matrix `max_parallel` limits.
    pub name: String,
    pub rank: usize,
    pub index: usize,
    /// `None` for jobs in their implicit, unconstrained group.
    pub concurrency_group: Option<String>,
}

impl QueuedJob {
    pub fn from_node(node: &DagNode) -> Self {
        let job = &node.job;
        Self {
            id: job.id.clone(),
            name: job.name.clone(),
            rank: node.rank,
            index: job.index,
            concurrency_group: job.concurrency_group.clone(),
        }
    }
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        // Lower rank first, then earlier declaration
        other
            .rank
            .cmp(&self.rank)
            .then_with(|| other.index.cmp(&self.index))
    }
}

struct RateLimit {
    max_concurrent: usize,
    current: usize,
}

/// Queue of ready jobs. Tracks running counts per concurrency group and per
/// logical job so `dequeue` only hands out jobs that may start now.
pub struct ReadyQueue {
    queue: BinaryHeap<QueuedJob>,
    concurrency_groups: HashMap<String, usize>,
    concurrency_limits: HashMap<String, usize>,
    job_rate_limits: HashMap<String, RateLimit>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self {
            queue: BinaryHeap::new(),
            concurrency_groups: HashMap::new(),
            concurrency_limits: HashMap::new(),
            job_rate_limits: HashMap::new(),
        }
    }

    /// Add a job to the queue.
    pub fn enqueue(&mut self, job: QueuedJob) {
        self.queue.push(job);
    }

    /// Get the next job that can be executed.
    pub fn dequeue(&mut self) -> Option<QueuedJob> {
        let mut temp = Vec::new();
        let mut result = None;

        while let Some(job) = self.queue.pop() {
            if self.can_execute(&job) {
                // Mark as running
                if let Some(ref group) = job.concurrency_group {
                    *self.concurrency_groups.entry(group.clone()).or_insert(0) += 1;
                }
                if let Some(limit) = self.job_rate_limits.get_mut(&job.name) {
                    limit.current += 1;
                }
                result = Some(job);
                break;
            } else {
                temp.push(job);
            }
        }

        // Put back jobs that couldn't be executed
        for job in temp {
            self.queue.push(job);
        }

        result
    }

    /// Mark a job as completed, freeing up concurrency slots.
    pub fn complete(&mut self, job: &QueuedJob) {
        if let Some(ref group) = job.concurrency_group
            && let Some(count) = self.concurrency_groups.get_mut(group)
        {
            *count = count.saturating_sub(1);
        }
        if let Some(limit) = self.job_rate_limits.get_mut(&job.name) {
            limit.current = limit.current.saturating_sub(1);
        }
    }

    /// Remove every waiting job, returning them in dispatch order.
    pub fn drain(&mut self) -> Vec<QueuedJob> {
        let mut drained = Vec::with_capacity(self.queue.len());
        while let Some(job) = self.queue.pop() {
            drained.push(job);
        }
        drained
    }

    /// Remove every queued instance of a logical job.
    pub fn remove_named(&mut self, name: &str) -> Vec<QueuedJob> {
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.queue)
            .into_iter()
            .partition(|job| job.name == name);
        self.queue = kept.into();
        removed
    }

    /// Set the concurrency limit for a group.
    pub fn set_concurrency_limit(&mut self, group: String, limit: usize) {
        self.concurrency_limits.insert(group, limit);
    }

    /// Cap the running instances of one logical job.
    pub fn set_job_rate_limit(&mut self, name: String, max_concurrent: usize) {
        self.job_rate_limits.insert(
            name,
            RateLimit {
                max_concurrent,
                current: 0,
            },
        );
    }

    /// Jobs of a group currently handed out and not completed.
    pub fn running_in_group(&self, group: &str) -> usize {
        self.concurrency_groups.get(group).copied().unwrap_or(0)
    }

    /// Get the current queue length.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn can_execute(&self, job: &QueuedJob) -> bool {
        // Check concurrency group
        if let Some(ref group) = job.concurrency_group {
            let current = self.running_in_group(group);
            let limit = self.concurrency_limits.get(group).copied().unwrap_or(1);
            if current >= limit {
                return false;
            }
        }

        // Check matrix max_parallel
        if let Some(limit) = self.job_rate_limits.get(&job.name)
            && limit.current >= limit.max_concurrent
        {
            return false;
        }

        true
    }
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

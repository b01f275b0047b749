//! Dispatch ordering and readiness gates for queued tasks.
//!
//! The scheduler keeps its pending tasks in a [`VecDeque`] sorted by
//! [`dispatch_order`] and only ever examines the head. Readiness is a
//! separate question from ordering: a task can be first in line yet still
//! gated by a future schedule time or a retry backoff window.

use std::cmp::Ordering;
use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use super::retry::BackoffPolicy;
use crate::task::{Task, TaskStatus};

/// Whether the queue head may start right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Readiness {
    /// All gates passed; dispatch it.
    Ready,
    /// Gated by schedule time or retry backoff; rotate it to the tail and
    /// keep scanning.
    NotReady,
    /// Ready but its network requirement is unsatisfied; the whole
    /// dispatch pass halts here.
    NetworkUnmet,
}

/// Total dispatch order: network-paused tasks hold the queue head, then
/// priority descending, then earliest scheduled time (tasks with an
/// explicit time sort before unscheduled ones), then creation order.
pub(crate) fn dispatch_order(a: &Task, b: &Task) -> Ordering {
    paused_rank(a)
        .cmp(&paused_rank(b))
        .then_with(|| b.priority().cmp(&a.priority()))
        .then_with(|| scheduled_order(a.scheduled_at, b.scheduled_at))
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Tasks paused while waiting for their network stay at the head so they
/// are reconsidered first once connectivity returns.
fn paused_rank(task: &Task) -> u8 {
    u8::from(task.status() != TaskStatus::Paused)
}

fn scheduled_order(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

pub(crate) fn sort_queue(queue: &mut VecDeque<Task>) {
    queue.make_contiguous().sort_by(dispatch_order);
}

/// Whether the task's explicit schedule time has arrived.
pub(crate) fn schedule_gate_open(task: &Task, now: DateTime<Utc>) -> bool {
    task.scheduled_at.is_none_or(|at| at <= now)
}

/// Whether the retry backoff window since the task's last start has
/// elapsed. Only errored tasks are gated; everything else passes.
pub(crate) fn backoff_gate_open(task: &Task, policy: &BackoffPolicy, now: DateTime<Utc>) -> bool {
    if task.status() != TaskStatus::Error || task.retry_count == 0 {
        return true;
    }
    let Some(started_at) = task.started_at else {
        return true;
    };
    let retry_count = u32::try_from(task.retry_count).unwrap_or(u32::MAX);
    let delay = policy.delay_for(retry_count);
    let Ok(delay) = chrono::Duration::from_std(delay) else {
        return false;
    };
    now >= started_at + delay
}

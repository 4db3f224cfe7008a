use crate::sync::models::ExitingFlag;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct InFlightJob {
    kind: &'static str,
    exiting: ExitingFlag,
}

#[derive(Default)]
struct Inner {
    count: AtomicUsize,
    jobs: DashMap<Uuid, InFlightJob>,
}

/// Jobs currently being processed by this worker.
///
/// Slots are taken with `try_register` and released when the returned guard
/// drops, including when the task holding it panics.
#[derive(Clone, Default)]
pub struct InFlight {
    inner: Arc<Inner>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn available(&self, max: usize) -> usize {
        max.saturating_sub(self.len())
    }

    /// Take a slot if fewer than `max` are in use.
    pub fn try_register(&self, max: usize, kind: &'static str) -> Option<InFlightGuard> {
        self.inner
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()?;

        let id = Uuid::new_v4();
        let exiting = ExitingFlag::new();
        self.inner.jobs.insert(
            id,
            InFlightJob {
                kind,
                exiting: exiting.clone(),
            },
        );
        Some(InFlightGuard {
            id,
            exiting,
            inner: self.inner.clone(),
        })
    }

    /// Flag every running job as exiting; returns how many were flagged.
    pub fn mark_all_exiting(&self) -> usize {
        let mut n = 0;
        for entry in self.inner.jobs.iter() {
            tracing::debug!(job_id = %entry.key(), kind = entry.kind, "marking job as exiting");
            entry.exiting.set();
            n += 1;
        }
        n
    }
}

pub struct InFlightGuard {
    id: Uuid,
    exiting: ExitingFlag,
    inner: Arc<Inner>,
}

impl InFlightGuard {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn exiting(&self) -> ExitingFlag {
        self.exiting.clone()
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.jobs.remove(&self.id);
        self.inner.count.fetch_sub(1, Ordering::SeqCst);
    }
}

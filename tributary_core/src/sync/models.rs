use crate::models::{ActivityRecord, Integration, Operation};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Pagination state shared by every stream kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetadata {
    /// Upstream cursor for the page to fetch. `None` marks a root stream.
    #[serde(default)]
    pub page: Option<String>,
    /// Set on streams whose source was not known before this run. New streams
    /// are always paginated to the end.
    #[serde(default)]
    pub new: bool,
}

/// One pagination lineage of a connector.
///
/// `K` is the connector's own tagged union of stream kinds; it carries the
/// parent identifiers (channel id, thread id, ...) the connector needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stream<K> {
    pub kind: K,
    #[serde(default)]
    pub metadata: StreamMetadata,
}

impl<K: Clone> Stream<K> {
    pub fn root(kind: K, new: bool) -> Self {
        Self {
            kind,
            metadata: StreamMetadata { page: None, new },
        }
    }

    /// Continuation of this stream at `cursor`. The `new` flag carries over.
    pub fn next_page(&self, cursor: impl Into<String>) -> Self {
        Self {
            kind: self.kind.clone(),
            metadata: StreamMetadata {
                page: Some(cursor.into()),
                new: self.metadata.new,
            },
        }
    }

    pub fn is_root(&self) -> bool {
        self.metadata.page.is_none()
    }

    pub fn is_new(&self) -> bool {
        self.metadata.new
    }

    pub fn cursor(&self) -> Option<&str> {
        self.metadata.page.as_deref()
    }
}

/// Output of one `process_stream` call.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessStreamResult<K> {
    pub operations: Vec<Operation>,
    pub last_record: Option<ActivityRecord>,
    pub last_record_timestamp: Option<DateTime<Utc>>,
    pub new_streams: Vec<Stream<K>>,
    pub next_page_stream: Option<Stream<K>>,
}

impl<K> ProcessStreamResult<K> {
    pub fn empty() -> Self {
        Self {
            operations: Vec::new(),
            last_record: None,
            last_record_timestamp: None,
            new_streams: Vec::new(),
            next_page_stream: None,
        }
    }

    /// Wrap `records` in a single upsert operation and track the last record.
    pub fn from_records(records: Vec<ActivityRecord>) -> Self {
        let last_record = records.last().cloned();
        let last_record_timestamp = last_record.as_ref().map(|r| r.timestamp);
        let operations = if records.is_empty() {
            Vec::new()
        } else {
            vec![Operation::upsert_activities(records)]
        };
        Self {
            operations,
            last_record,
            last_record_timestamp,
            new_streams: Vec::new(),
            next_page_stream: None,
        }
    }

    pub fn with_new_streams(mut self, streams: Vec<Stream<K>>) -> Self {
        self.new_streams = streams;
        self
    }

    pub fn with_next_page(mut self, next: Option<Stream<K>>) -> Self {
        self.next_page_stream = next;
        self
    }
}

/// Work list of a job cut short by a rate limit.
///
/// `pending` keeps the scheduler's stack order (last element runs first).
/// `failed` holds lineages that already failed, so `postprocess` of the
/// resumed job still sees them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "K: Deserialize<'de>"))]
pub struct ResumeState<K> {
    pub pending: Vec<Stream<K>>,
    #[serde(default)]
    pub failed: Vec<Stream<K>>,
}

/// Set by the worker when it starts draining. Jobs may read it; nothing is
/// cancelled because of it.
#[derive(Debug, Clone, Default)]
pub struct ExitingFlag(Arc<AtomicBool>);

impl ExitingFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Job-wide state known before `preprocess` runs.
#[derive(Debug, Clone)]
pub struct JobState {
    pub integration: Integration,
    /// First-ever sync for this integration.
    pub onboarding: bool,
    pub start_timestamp: DateTime<Utc>,
    pub exiting: ExitingFlag,
    /// Serialized `ResumeState` left behind by a rate-limited delivery.
    pub resume: Option<serde_json::Value>,
}

impl JobState {
    pub fn new(integration: Integration, onboarding: bool, exiting: ExitingFlag) -> Self {
        Self {
            integration,
            onboarding,
            start_timestamp: Utc::now(),
            exiting,
            resume: None,
        }
    }

    pub fn with_resume(mut self, resume: Option<serde_json::Value>) -> Self {
        self.resume = resume;
        self
    }

    pub fn with_start_timestamp(mut self, start: DateTime<Utc>) -> Self {
        self.start_timestamp = start;
        self
    }
}

/// Mutable state threaded through one job. `data` is created by the
/// connector's `preprocess`.
#[derive(Debug)]
pub struct PipelineContext<D> {
    pub job: JobState,
    pub data: D,
}

impl<D> PipelineContext<D> {
    pub fn new(job: JobState, data: D) -> Self {
        Self { job, data }
    }

    pub fn integration(&self) -> &Integration {
        &self.job.integration
    }
}

/// Counters reported when a job ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub streams_processed: u64,
    pub streams_failed: u64,
    pub operations_emitted: u64,
    pub records_emitted: u64,
}

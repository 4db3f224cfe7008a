use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tributary_core::models::{MemberRecord, Platform};
use tributary_core::sync::memory::{MemoryIntegrationStore, MemoryOperationSink};
use tributary_core::{
    ActivityRecord, Connector, Error, ExitingFlag, Integration, IntegrationStatus, JobState,
    Operation, PipelineContext, ProcessStreamResult, ResumeState, RetrospectPolicy, Stream,
    StreamScheduler, TenantId,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
enum Kind {
    Channel(String),
    Thread { channel_id: String, thread_id: String },
}

enum Page {
    Records {
        timestamps: Vec<DateTime<Utc>>,
        next: Option<&'static str>,
        threads: Vec<&'static str>,
    },
    Fail(fn() -> Error),
    /// Rate limited on first fetch, then served normally.
    RateLimitedOnce(Box<Page>),
}

fn page(timestamps: Vec<DateTime<Utc>>, next: Option<&'static str>) -> Page {
    Page::Records {
        timestamps,
        next,
        threads: Vec::new(),
    }
}

struct FakeConnector {
    roots: Vec<(Kind, bool)>,
    pages: HashMap<(Kind, Option<String>), Page>,
    calls: Mutex<Vec<(Kind, Option<String>)>>,
    tripped: Mutex<HashSet<(Kind, Option<String>)>>,
    root_listings: Mutex<usize>,
    postprocessed: AtomicBool,
    failed: Mutex<Vec<Stream<Kind>>>,
    policy: RetrospectPolicy,
}

impl FakeConnector {
    fn new(roots: Vec<(Kind, bool)>) -> Self {
        Self {
            roots,
            pages: HashMap::new(),
            calls: Mutex::new(Vec::new()),
            tripped: Mutex::new(HashSet::new()),
            root_listings: Mutex::new(0),
            postprocessed: AtomicBool::new(false),
            failed: Mutex::new(Vec::new()),
            policy: RetrospectPolicy::default(),
        }
    }

    fn with_page(mut self, kind: Kind, cursor: Option<&str>, page: Page) -> Self {
        self.pages.insert((kind, cursor.map(str::to_string)), page);
        self
    }

    fn calls(&self) -> Vec<(Kind, Option<String>)> {
        self.calls.lock().unwrap().clone()
    }

    fn failed(&self) -> Vec<Stream<Kind>> {
        self.failed.lock().unwrap().clone()
    }

    fn root_listings(&self) -> usize {
        *self.root_listings.lock().unwrap()
    }
}

fn channel(id: &str) -> Kind {
    Kind::Channel(id.to_string())
}

fn record(tenant_id: TenantId, ts: DateTime<Utc>) -> ActivityRecord {
    ActivityRecord {
        tenant_id,
        platform: Platform::Slack,
        activity_type: "message".to_string(),
        source_id: ts.timestamp().to_string(),
        source_parent_id: None,
        timestamp: ts,
        body: Some("hi".to_string()),
        url: None,
        channel: None,
        attributes: serde_json::json!({}),
        member: MemberRecord {
            username: "ann".to_string(),
            source_id: "U1".to_string(),
            attributes: serde_json::json!({}),
        },
    }
}

#[async_trait]
impl Connector for FakeConnector {
    type PipelineData = ();
    type StreamKind = Kind;

    fn platform(&self) -> Platform {
        Platform::Slack
    }

    async fn preprocess(&self, _job: &JobState) -> tributary_core::Result<()> {
        Ok(())
    }

    async fn get_streams(&self, _ctx: &PipelineContext<()>) -> tributary_core::Result<Vec<Stream<Kind>>> {
        *self.root_listings.lock().unwrap() += 1;
        Ok(self
            .roots
            .iter()
            .map(|(k, new)| Stream::root(k.clone(), *new))
            .collect())
    }

    async fn process_stream(
        &self,
        stream: &Stream<Kind>,
        ctx: &mut PipelineContext<()>,
    ) -> tributary_core::Result<ProcessStreamResult<Kind>> {
        let key = (stream.kind.clone(), stream.metadata.page.clone());
        self.calls.lock().unwrap().push(key.clone());
        let page = self
            .pages
            .get(&key)
            .ok_or_else(|| Error::Fatal(format!("unknown stream {:?}", key)))?;
        let page = match page {
            Page::RateLimitedOnce(inner) => {
                if self.tripped.lock().unwrap().insert(key.clone()) {
                    return Err(Error::rate_limited(30, "conversations.history"));
                }
                inner.as_ref()
            }
            other => other,
        };
        match page {
            Page::Fail(make) => Err(make()),
            Page::RateLimitedOnce(_) => Err(Error::Fatal("nested rate limit page".to_string())),
            Page::Records {
                timestamps,
                next,
                threads,
            } => {
                let tenant = ctx.integration().tenant_id;
                let records = timestamps.iter().map(|ts| record(tenant, *ts)).collect();
                let channel_id = match &stream.kind {
                    Kind::Channel(id) => id.clone(),
                    Kind::Thread { channel_id, .. } => channel_id.clone(),
                };
                let new_streams = threads
                    .iter()
                    .map(|t| {
                        Stream::root(
                            Kind::Thread {
                                channel_id: channel_id.clone(),
                                thread_id: t.to_string(),
                            },
                            stream.is_new(),
                        )
                    })
                    .collect();
                Ok(ProcessStreamResult::from_records(records)
                    .with_new_streams(new_streams)
                    .with_next_page(next.map(|c| stream.next_page(c))))
            }
        }
    }

    async fn postprocess(
        &self,
        _ctx: &mut PipelineContext<()>,
        failed_streams: &[Stream<Kind>],
    ) -> tributary_core::Result<serde_json::Value> {
        self.postprocessed.store(true, Ordering::SeqCst);
        *self.failed.lock().unwrap() = failed_streams.to_vec();
        Ok(serde_json::json!({"synced": true}))
    }

    fn is_processing_finished(
        &self,
        ctx: &PipelineContext<()>,
        stream: &Stream<Kind>,
        _last_operations: &[Operation],
        _last_record: Option<&ActivityRecord>,
        last_record_timestamp: Option<DateTime<Utc>>,
    ) -> bool {
        self.policy
            .is_stream_finished(ctx.job.start_timestamp, stream.is_new(), last_record_timestamp)
    }
}

struct Harness {
    connector: Arc<FakeConnector>,
    store: MemoryIntegrationStore,
    sink: MemoryOperationSink,
    scheduler: StreamScheduler<FakeConnector>,
    integration: Integration,
}

fn harness(connector: FakeConnector) -> Harness {
    let connector = Arc::new(connector);
    let store = MemoryIntegrationStore::new();
    let sink = MemoryOperationSink::new();
    let integration = Integration::new(TenantId::new(), Platform::Slack, None, serde_json::json!({}));
    store.insert(integration.clone());
    let scheduler = StreamScheduler::new(connector.clone(), Arc::new(store.clone()), Arc::new(sink.clone()));
    Harness {
        connector,
        store,
        sink,
        scheduler,
        integration,
    }
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

impl Harness {
    fn job(&self, onboarding: bool) -> JobState {
        JobState::new(self.integration.clone(), onboarding, ExitingFlag::new())
            .with_start_timestamp(start())
    }

    fn status(&self) -> IntegrationStatus {
        self.store
            .snapshot(self.integration.tenant_id, self.integration.id)
            .unwrap()
            .status
    }
}

#[tokio::test]
async fn pagination_round_trip_follows_every_page() {
    let recent = start() - Duration::minutes(5);
    let h = harness(
        FakeConnector::new(vec![(channel("C1"), true)])
            .with_page(channel("C1"), None, page(vec![recent], Some("p2")))
            .with_page(channel("C1"), Some("p2"), page(vec![recent], Some("p3")))
            .with_page(channel("C1"), Some("p3"), page(vec![recent], None)),
    );

    let summary = h.scheduler.run_job(h.job(false)).await.unwrap();

    assert_eq!(h.connector.calls().len(), 3);
    assert_eq!(summary.streams_processed, 3);
    assert_eq!(summary.records_emitted, 3);
    assert_eq!(h.sink.record_count().await, 3);
    assert_eq!(h.status(), IntegrationStatus::Done);
    let saved = h
        .store
        .snapshot(h.integration.tenant_id, h.integration.id)
        .unwrap();
    assert_eq!(saved.settings["synced"], true);
}

#[tokio::test]
async fn new_stream_is_exhausted_past_retrospect_window() {
    let ancient = start() - Duration::days(30);
    let h = harness(
        FakeConnector::new(vec![(channel("C1"), true)])
            .with_page(channel("C1"), None, page(vec![ancient], Some("p2")))
            .with_page(channel("C1"), Some("p2"), page(vec![ancient], None)),
    );

    h.scheduler.run_job(h.job(false)).await.unwrap();
    assert_eq!(h.connector.calls().len(), 2);
}

#[tokio::test]
async fn known_stream_stops_once_retrospect_window_is_exceeded() {
    let two_hours_ago = start() - Duration::seconds(7200);
    let h = harness(
        FakeConnector::new(vec![(channel("C1"), false)])
            .with_page(channel("C1"), None, page(vec![two_hours_ago], Some("p2")))
            .with_page(channel("C1"), Some("p2"), page(vec![two_hours_ago], None)),
    );

    h.scheduler.run_job(h.job(false)).await.unwrap();
    assert_eq!(h.connector.calls(), vec![(channel("C1"), None)]);
}

#[tokio::test]
async fn known_stream_within_window_keeps_paging() {
    let recent = start() - Duration::minutes(10);
    let h = harness(
        FakeConnector::new(vec![(channel("C1"), false)])
            .with_page(channel("C1"), None, page(vec![recent], Some("p2")))
            .with_page(channel("C1"), Some("p2"), page(vec![], Some("p3")))
            .with_page(channel("C1"), Some("p3"), page(vec![recent], None)),
    );

    h.scheduler.run_job(h.job(false)).await.unwrap();
    // The empty second page has no last record, which ends the lineage.
    assert_eq!(h.connector.calls().len(), 2);
}

#[tokio::test]
async fn onboarding_ignores_retrospect_window() {
    let ancient = start() - Duration::days(30);
    let h = harness(
        FakeConnector::new(vec![(channel("C1"), false)])
            .with_page(channel("C1"), None, page(vec![ancient], Some("p2")))
            .with_page(channel("C1"), Some("p2"), page(vec![ancient], None)),
    );

    h.scheduler.run_job(h.job(true)).await.unwrap();
    assert_eq!(h.connector.calls().len(), 2);
}

#[tokio::test]
async fn threads_are_processed_before_channel_continues() {
    let recent = start() - Duration::minutes(1);
    let thread = Kind::Thread {
        channel_id: "C1".to_string(),
        thread_id: "T1".to_string(),
    };
    let h = harness(
        FakeConnector::new(vec![(channel("C1"), true), (channel("C2"), true)])
            .with_page(
                channel("C1"),
                None,
                Page::Records {
                    timestamps: vec![recent],
                    next: Some("p2"),
                    threads: vec!["T1"],
                },
            )
            .with_page(thread.clone(), None, page(vec![recent], None))
            .with_page(channel("C1"), Some("p2"), page(vec![recent], None))
            .with_page(channel("C2"), None, page(vec![recent], None)),
    );

    h.scheduler.run_job(h.job(false)).await.unwrap();

    let calls = h.connector.calls();
    assert_eq!(
        calls,
        vec![
            (channel("C1"), None),
            (thread, None),
            (channel("C1"), Some("p2".to_string())),
            (channel("C2"), None),
        ]
    );
    let threads: Vec<_> = calls
        .iter()
        .filter(|(k, _)| matches!(k, Kind::Thread { channel_id, .. } if channel_id == "C1"))
        .collect();
    assert_eq!(threads.len(), 1);
}

#[tokio::test]
async fn transport_error_aborts_only_its_lineage() {
    let recent = start() - Duration::minutes(1);
    let h = harness(
        FakeConnector::new(vec![(channel("C1"), true), (channel("C2"), true)])
            .with_page(channel("C1"), None, page(vec![recent], Some("p2")))
            .with_page(
                channel("C1"),
                Some("p2"),
                Page::Fail(|| Error::BackendMessage("connection reset".to_string())),
            )
            .with_page(channel("C2"), None, page(vec![recent], None)),
    );

    let summary = h.scheduler.run_job(h.job(false)).await.unwrap();

    assert_eq!(summary.streams_failed, 1);
    assert_eq!(h.connector.calls().len(), 3);
    assert_eq!(h.sink.record_count().await, 2);
    assert_eq!(h.status(), IntegrationStatus::Done);
    let failed = h.connector.failed();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].kind, channel("C1"));
    assert_eq!(failed[0].cursor(), Some("p2"));
}

#[tokio::test]
async fn rate_limit_returns_without_postprocess() {
    let recent = start() - Duration::minutes(1);
    let h = harness(
        FakeConnector::new(vec![(channel("C1"), true), (channel("C2"), true)])
            .with_page(channel("C1"), None, page(vec![recent], None))
            .with_page(
                channel("C2"),
                None,
                Page::Fail(|| Error::rate_limited(42, "conversations.history")),
            ),
    );

    let err = h.scheduler.run_job(h.job(false)).await.unwrap_err();

    assert_eq!(err.as_rate_limit().map(|r| r.reset_seconds), Some(42));
    assert!(!h.connector.postprocessed.load(Ordering::SeqCst));
    assert_eq!(h.status(), IntegrationStatus::InProgress);
    let saved = h
        .store
        .snapshot(h.integration.tenant_id, h.integration.id)
        .unwrap();
    assert_eq!(saved.settings, serde_json::json!({}));
}

#[tokio::test]
async fn fatal_error_marks_integration_errored() {
    let h = harness(
        FakeConnector::new(vec![(channel("C1"), true), (channel("C2"), true)])
            .with_page(
                channel("C1"),
                None,
                Page::Fail(|| Error::Unauthorized("token_revoked".to_string())),
            ),
    );

    let err = h.scheduler.run_job(h.job(false)).await.unwrap_err();

    assert!(matches!(err, Error::Unauthorized(_)));
    assert_eq!(h.connector.calls().len(), 1);
    assert!(!h.connector.postprocessed.load(Ordering::SeqCst));
    assert_eq!(h.status(), IntegrationStatus::Error);
}

#[tokio::test]
async fn rate_limited_job_resumes_from_pending_streams() {
    let recent = start() - Duration::minutes(1);
    let h = harness(
        FakeConnector::new(vec![(channel("C1"), true), (channel("C2"), true)])
            .with_page(channel("C1"), None, page(vec![recent], Some("p2")))
            .with_page(
                channel("C1"),
                Some("p2"),
                Page::RateLimitedOnce(Box::new(page(vec![recent], None))),
            )
            .with_page(channel("C2"), None, page(vec![recent], None)),
    );

    let err = h.scheduler.run_job(h.job(false)).await.unwrap_err();
    let resume = err
        .as_rate_limit()
        .and_then(|rl| rl.resume.clone())
        .expect("rate limit carries pending work");
    let state: ResumeState<Kind> = serde_json::from_value(resume.clone()).unwrap();
    let top = state.pending.last().unwrap();
    assert_eq!(top.kind, channel("C1"));
    assert_eq!(top.cursor(), Some("p2"));
    assert!(top.is_new());
    assert_eq!(state.pending.len(), 2);

    let summary = h
        .scheduler
        .run_job(h.job(false).with_resume(Some(resume)))
        .await
        .unwrap();

    assert_eq!(h.connector.root_listings(), 1);
    assert_eq!(
        h.connector.calls(),
        vec![
            (channel("C1"), None),
            (channel("C1"), Some("p2".to_string())),
            (channel("C1"), Some("p2".to_string())),
            (channel("C2"), None),
        ]
    );
    assert_eq!(summary.streams_processed, 2);
    assert_eq!(h.sink.record_count().await, 3);
    assert!(h.connector.postprocessed.load(Ordering::SeqCst));
    assert_eq!(h.status(), IntegrationStatus::Done);
}

#[tokio::test]
async fn lineage_failed_before_rate_limit_reaches_postprocess_after_resume() {
    let recent = start() - Duration::minutes(1);
    let h = harness(
        FakeConnector::new(vec![(channel("C1"), true), (channel("C2"), true)])
            .with_page(
                channel("C1"),
                None,
                Page::Fail(|| Error::BackendMessage("502 bad gateway".to_string())),
            )
            .with_page(
                channel("C2"),
                None,
                Page::RateLimitedOnce(Box::new(page(vec![recent], None))),
            ),
    );

    let err = h.scheduler.run_job(h.job(false)).await.unwrap_err();
    let resume = err.as_rate_limit().and_then(|rl| rl.resume.clone());
    assert!(resume.is_some());

    h.scheduler
        .run_job(h.job(false).with_resume(resume))
        .await
        .unwrap();

    let failed = h.connector.failed();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].kind, channel("C1"));
}

#[tokio::test]
async fn unreadable_resume_state_restarts_from_roots() {
    let recent = start() - Duration::minutes(1);
    let h = harness(
        FakeConnector::new(vec![(channel("C1"), false)])
            .with_page(channel("C1"), None, page(vec![recent], None)),
    );

    h.scheduler
        .run_job(h.job(false).with_resume(Some(serde_json::json!({ "pending": "nope" }))))
        .await
        .unwrap();

    assert_eq!(h.connector.root_listings(), 1);
    assert_eq!(h.connector.calls(), vec![(channel("C1"), None)]);
}

//! Integration tests for the fetch engine
//!
//! These tests use wiremock to create mock HTTP servers and exercise the
//! engine's drain, isolation, spacing, retry and cancellation behavior.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use storefront_crawler::config::{AppendFailurePolicy, EngineConfig, UserAgentConfig};
use storefront_crawler::crawler::{
    FetchEngine, FetchError, FetchFailure, FetchResponse, ResponseHandler, RetryHandler,
};
use storefront_crawler::ledger::{Ledger, LedgerError};
use storefront_crawler::CrawlError;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

fn create_test_user_agent() -> UserAgentConfig {
    UserAgentConfig {
        crawler_name: "TestBot".to_string(),
        crawler_version: "1.0.0".to_string(),
        contact_url: None,
    }
}

fn create_engine(concurrency: u32, minimum_wait_ms: u64) -> FetchEngine {
    let config = EngineConfig {
        max_concurrent_fetches: concurrency,
        minimum_wait_ms,
        request_timeout_ms: 5_000,
        ..EngineConfig::default()
    };
    FetchEngine::new(&config, &create_test_user_agent()).expect("engine should start")
}

async fn mount_ok(server: &MockServer, route: &str, body: &str) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;
}

/// Records the path of every success and every failure
#[derive(Default)]
struct Recorder {
    successes: Mutex<Vec<String>>,
    failures: Mutex<Vec<FetchFailure>>,
}

impl Recorder {
    fn successes(&self) -> Vec<String> {
        let mut paths = self.successes.lock().unwrap().clone();
        paths.sort();
        paths
    }

    fn failures(&self) -> Vec<FetchFailure> {
        self.failures.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResponseHandler for Recorder {
    async fn on_success(
        &self,
        _engine: &FetchEngine,
        response: FetchResponse,
    ) -> Result<(), CrawlError> {
        self.successes
            .lock()
            .unwrap()
            .push(response.url.path().to_string());
        Ok(())
    }

    async fn on_error(&self, _engine: &FetchEngine, failure: FetchFailure) {
        self.failures.lock().unwrap().push(failure);
    }
}

/// Each step submits the next one after a delay
#[derive(Clone)]
struct ChainHandler {
    base: String,
    last_step: u32,
    seen: Arc<Mutex<Vec<u32>>>,
}

#[async_trait]
impl ResponseHandler for ChainHandler {
    async fn on_success(
        &self,
        engine: &FetchEngine,
        response: FetchResponse,
    ) -> Result<(), CrawlError> {
        let step: u32 = response
            .url
            .path()
            .trim_start_matches("/chain/")
            .parse()
            .expect("chain step");
        self.seen.lock().unwrap().push(step);

        if step < self.last_step {
            // Leave the queue empty for a while before the follow-up exists
            tokio::time::sleep(Duration::from_millis(100)).await;
            engine.fetch(
                format!("{}/chain/{}", self.base, step + 1),
                Arc::new(self.clone()),
            )?;
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_drain_waits_for_transitively_enqueued_tasks() {
    let server = MockServer::start().await;
    for step in 1..=3 {
        Mock::given(method("GET"))
            .and(path(format!("/chain/{}", step)))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;
    }

    let engine = create_engine(4, 0);
    let handler = ChainHandler {
        base: server.uri(),
        last_step: 3,
        seen: Arc::new(Mutex::new(Vec::new())),
    };
    let seen = Arc::clone(&handler.seen);

    engine
        .fetch(format!("{}/chain/1", server.uri()), Arc::new(handler))
        .unwrap();
    let report = engine.wait_and_close().await.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    assert_eq!(report.statistics.enqueued, 3);
    assert_eq!(report.statistics.succeeded, 3);
    assert_eq!(engine.pending(), 0);
}

/// Panics on `/boom`, errors on `/bad`, records everything else
struct FaultyHandler {
    completed: Mutex<Vec<String>>,
}

#[async_trait]
impl ResponseHandler for FaultyHandler {
    async fn on_success(
        &self,
        _engine: &FetchEngine,
        response: FetchResponse,
    ) -> Result<(), CrawlError> {
        match response.url.path() {
            "/boom" => panic!("collaborator blew up"),
            "/bad" => Err(CrawlError::HtmlParse {
                url: response.url.to_string(),
                message: "missing item table".to_string(),
            }),
            other => {
                self.completed.lock().unwrap().push(other.to_string());
                Ok(())
            }
        }
    }
}

#[tokio::test]
async fn test_callback_faults_are_isolated() {
    let server = MockServer::start().await;
    for route in ["/boom", "/bad", "/a", "/b", "/c", "/d"] {
        mount_ok(&server, route, "<html></html>").await;
    }

    let engine = create_engine(2, 0);
    let handler = Arc::new(FaultyHandler {
        completed: Mutex::new(Vec::new()),
    });
    for route in ["/boom", "/bad", "/a", "/b", "/c", "/d"] {
        engine
            .fetch(format!("{}{}", server.uri(), route), handler.clone())
            .unwrap();
    }

    let report = tokio::time::timeout(Duration::from_secs(10), engine.wait_and_close())
        .await
        .expect("drain must not hang after a callback panic")
        .unwrap();

    let mut completed = handler.completed.lock().unwrap().clone();
    completed.sort();
    assert_eq!(completed, vec!["/a", "/b", "/c", "/d"]);
    assert_eq!(report.statistics.succeeded, 6);
    assert_eq!(report.statistics.callback_faults, 2);
    assert!(!report.cancelled);
}

/// Responds 200 and records when each request arrived
struct ArrivalRecorder {
    arrivals: Arc<Mutex<Vec<Instant>>>,
}

impl Respond for ArrivalRecorder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        self.arrivals.lock().unwrap().push(Instant::now());
        ResponseTemplate::new(200).set_body_string("ok")
    }
}

#[tokio::test]
async fn test_request_starts_respect_minimum_wait() {
    let server = MockServer::start().await;
    let arrivals = Arc::new(Mutex::new(Vec::new()));
    Mock::given(method("GET"))
        .respond_with(ArrivalRecorder {
            arrivals: Arc::clone(&arrivals),
        })
        .mount(&server)
        .await;

    let engine = create_engine(4, 250);
    let recorder = Arc::new(Recorder::default());
    let started = Instant::now();
    for i in 0..10 {
        engine
            .fetch(format!("{}/item/{}", server.uri(), i), recorder.clone())
            .unwrap();
    }
    let report = engine.wait_and_close().await.unwrap();

    assert_eq!(report.statistics.succeeded, 10);
    assert!(started.elapsed() >= Duration::from_millis(9 * 250));

    let mut arrivals = arrivals.lock().unwrap().clone();
    arrivals.sort();
    assert_eq!(arrivals.len(), 10);
    let epsilon = Duration::from_millis(40);
    for pair in arrivals.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(
            gap + epsilon >= Duration::from_millis(250),
            "requests started {:?} apart",
            gap
        );
    }
}

#[tokio::test]
async fn test_non_success_status_goes_to_on_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gone"))
        .respond_with(ResponseTemplate::new(404).set_body_string("item is gone"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    mount_ok(&server, "/fine", "ok").await;

    let engine = create_engine(2, 0);
    let recorder = Arc::new(Recorder::default());
    for route in ["/gone", "/broken", "/fine"] {
        engine
            .fetch(format!("{}{}", server.uri(), route), recorder.clone())
            .unwrap();
    }
    let report = engine.wait_and_close().await.unwrap();

    assert_eq!(recorder.successes(), vec!["/fine"]);
    assert_eq!(report.statistics.failed, 2);

    let mut failures = recorder.failures();
    failures.sort_by(|a, b| a.url.cmp(&b.url));
    assert_eq!(failures[0].error, FetchError::Status(500));
    assert_eq!(failures[1].error, FetchError::Status(404));
    assert_eq!(failures[1].status, Some(404));
    assert_eq!(failures[1].body.as_deref(), Some(&b"item is gone"[..]));
}

#[tokio::test]
async fn test_transport_error_goes_to_on_error() {
    let engine = create_engine(1, 0);
    let recorder = Arc::new(Recorder::default());
    engine
        .fetch("http://127.0.0.1:9/unreachable", recorder.clone())
        .unwrap();
    let report = engine.wait_and_close().await.unwrap();

    assert_eq!(report.statistics.failed, 1);
    let failures = recorder.failures();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].status.is_none());
}

#[tokio::test]
async fn test_timeout_goes_to_on_error_without_blocking_others() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("too late")
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;
    mount_ok(&server, "/fast", "ok").await;

    let config = EngineConfig {
        max_concurrent_fetches: 2,
        minimum_wait_ms: 0,
        request_timeout_ms: 300,
        ..EngineConfig::default()
    };
    let engine = FetchEngine::new(&config, &create_test_user_agent()).unwrap();
    let recorder = Arc::new(Recorder::default());

    let started = Instant::now();
    for route in ["/slow", "/fast"] {
        engine
            .fetch(format!("{}{}", server.uri(), route), recorder.clone())
            .unwrap();
    }
    let report = engine.wait_and_close().await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(recorder.successes(), vec!["/fast"]);
    assert_eq!(report.statistics.failed, 1);
    let failures = recorder.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].error, FetchError::Timeout);
    assert!(failures[0].url.ends_with("/slow"));
    assert!(
        elapsed < Duration::from_secs(2),
        "drain took {:?}, the slow response was awaited",
        elapsed
    );
}

/// Marks the final URL of every response
struct MarkingHandler {
    ledger: Arc<Ledger>,
    first_marks: AtomicUsize,
}

#[async_trait]
impl ResponseHandler for MarkingHandler {
    async fn on_success(
        &self,
        _engine: &FetchEngine,
        response: FetchResponse,
    ) -> Result<(), CrawlError> {
        if self.ledger.mark_downloaded(response.url.as_str())? {
            self.first_marks.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_redirect_final_url_is_marked() {
    let server = MockServer::start().await;
    let location = format!("{}/new", server.uri());
    Mock::given(method("GET"))
        .and(path("/old"))
        .respond_with(ResponseTemplate::new(301).insert_header("location", location.as_str()))
        .mount(&server)
        .await;
    mount_ok(&server, "/new", "moved here").await;

    let dir = tempfile::tempdir().unwrap();
    let ledger = Arc::new(
        Ledger::open(dir.path().join("ledger.txt"), AppendFailurePolicy::Log, vec![]).unwrap(),
    );
    let engine = create_engine(1, 0);
    engine
        .fetch(
            format!("{}/old", server.uri()),
            Arc::new(MarkingHandler {
                ledger: Arc::clone(&ledger),
                first_marks: AtomicUsize::new(0),
            }),
        )
        .unwrap();
    engine.wait_and_close().await.unwrap();

    assert!(ledger.contains(&format!("{}/new", server.uri())));
    assert!(!ledger.contains(&format!("{}/old", server.uri())));
}

#[tokio::test]
async fn test_concurrent_completions_mark_once() {
    let server = MockServer::start().await;
    mount_ok(&server, "/same", "ok").await;

    let dir = tempfile::tempdir().unwrap();
    let ledger_path = dir.path().join("ledger.txt");
    let ledger = Arc::new(Ledger::open(&ledger_path, AppendFailurePolicy::Log, vec![]).unwrap());
    let handler = Arc::new(MarkingHandler {
        ledger: Arc::clone(&ledger),
        first_marks: AtomicUsize::new(0),
    });

    let engine = create_engine(4, 0);
    let url = format!("{}/same", server.uri());
    for _ in 0..10 {
        engine.fetch(url.clone(), handler.clone()).unwrap();
    }
    engine.wait_and_close().await.unwrap();
    ledger.flush().unwrap();

    assert_eq!(handler.first_marks.load(Ordering::SeqCst), 1);
    let contents = std::fs::read_to_string(&ledger_path).unwrap();
    assert_eq!(contents.lines().filter(|line| *line == url).count(), 1);
}

#[tokio::test]
async fn test_retry_resubmits_until_bound() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let engine = create_engine(2, 0);
    let recorder = Arc::new(Recorder::default());
    let retry = RetryHandler::new(recorder.clone(), 2);
    engine
        .fetch(format!("{}/flaky", server.uri()), Arc::new(retry.clone()))
        .unwrap();
    let report = engine.wait_and_close().await.unwrap();

    // The first attempt plus two resubmissions; the wrapped handler sees only the last
    assert_eq!(report.statistics.enqueued, 3);
    assert_eq!(report.statistics.failed, 3);
    assert_eq!(recorder.failures().len(), 1);
    assert_eq!(retry.attempts(&format!("{}/flaky", server.uri())), 2);
}

#[tokio::test]
async fn test_retry_recovers_after_transient_failures() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/recovering"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    mount_ok(&server, "/recovering", "finally").await;

    let engine = create_engine(1, 0);
    let recorder = Arc::new(Recorder::default());
    engine
        .fetch(
            format!("{}/recovering", server.uri()),
            Arc::new(RetryHandler::new(recorder.clone(), 5)),
        )
        .unwrap();
    let report = engine.wait_and_close().await.unwrap();

    assert_eq!(recorder.successes(), vec!["/recovering"]);
    assert!(recorder.failures().is_empty());
    assert_eq!(report.statistics.failed, 2);
    assert_eq!(report.statistics.succeeded, 1);
}

#[tokio::test]
async fn test_retry_skips_permanent_failures() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let engine = create_engine(1, 0);
    let recorder = Arc::new(Recorder::default());
    engine
        .fetch(
            format!("{}/missing", server.uri()),
            Arc::new(RetryHandler::new(recorder.clone(), 5)),
        )
        .unwrap();
    engine.wait_and_close().await.unwrap();

    assert_eq!(recorder.failures().len(), 1);
}

/// Cancels the engine from the first callback
struct CancellingHandler {
    calls: AtomicUsize,
}

#[async_trait]
impl ResponseHandler for CancellingHandler {
    async fn on_success(
        &self,
        engine: &FetchEngine,
        _response: FetchResponse,
    ) -> Result<(), CrawlError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            engine.cancel();
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_cancel_drops_queued_tasks() {
    let server = MockServer::start().await;
    mount_ok(&server, "/page", "ok").await;

    let engine = create_engine(1, 0);
    let handler = Arc::new(CancellingHandler {
        calls: AtomicUsize::new(0),
    });
    for i in 0..10 {
        engine
            .fetch(format!("{}/page?n={}", server.uri(), i), handler.clone())
            .unwrap();
    }
    let report = engine.wait_and_close().await.unwrap();

    assert!(report.cancelled);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    assert_eq!(report.statistics.succeeded, 1);
    assert_eq!(report.statistics.cancelled, 9);
    assert_eq!(report.statistics.resolved(), 10);

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
}

/// Fails every success callback with a fatal ledger error
struct FatalHandler;

#[async_trait]
impl ResponseHandler for FatalHandler {
    async fn on_success(
        &self,
        _engine: &FetchEngine,
        response: FetchResponse,
    ) -> Result<(), CrawlError> {
        Err(CrawlError::Ledger(LedgerError::Append {
            url: response.url.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        }))
    }
}

#[tokio::test]
async fn test_fatal_callback_error_aborts_crawl() {
    let server = MockServer::start().await;
    mount_ok(&server, "/page", "ok").await;

    let engine = create_engine(1, 0);
    let handler = Arc::new(FatalHandler);
    for i in 0..5 {
        engine
            .fetch(format!("{}/page?n={}", server.uri(), i), handler.clone())
            .unwrap();
    }

    let result = engine.wait_and_close().await;
    match result {
        Err(CrawlError::Aborted(reason)) => assert!(reason.contains("disk full")),
        other => panic!("expected an aborted crawl, got {:?}", other.map(|r| r.statistics)),
    }
    assert!(engine.is_cancelled());

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
}

//! End-to-end tests for the vote pipeline against a mock feed.

use std::sync::Arc;
use std::time::Duration;

use ballot_common::config::Config;
use ballot_common::queue::{topics, InMemoryQueue, MessageQueue};
use ballot_votes::store::StoreResult;
use ballot_votes::{
    Authorizer, InMemoryPollStore, PipelineSettings, Poll, PollStore, SqlitePollStore,
    VotePipeline,
};
use url::Url;
use wiremock::matchers::{body_string, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const FILTER_PATH: &str = "/1.1/statuses/filter.json";

fn settings(server: &MockServer) -> PipelineSettings {
    PipelineSettings {
        endpoint: Url::parse(&format!("{}{}", server.uri(), FILTER_PATH)).unwrap(),
        connect_timeout: Duration::from_secs(1),
        poll_interval: Duration::from_millis(20),
        recycle_interval: Duration::from_secs(60),
        vote_buffer: 1,
        topic: topics::VOTES.to_string(),
        diagnostic_max_chars: 200,
    }
}

fn pets_store() -> Arc<InMemoryPollStore> {
    Arc::new(InMemoryPollStore::with_polls(vec![Poll::new(
        "Pets",
        vec!["Cats".to_string(), "Dogs".to_string()],
    )]))
}

fn bearer() -> Authorizer {
    Authorizer::Bearer("test-token".into())
}

#[tokio::test]
async fn test_votes_reach_queue_in_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(FILTER_PATH))
        .and(header("authorization", "Bearer test-token"))
        .and(header("content-type", "application/x-www-form-urlencoded"))
        .and(body_string("track=%23cats%2C%23dogs"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "{\"text\":\"I love cats and dogs\"}\r\n\r\n{\"text\":\"I love birds\"}\r\n",
        ))
        .mount(&server)
        .await;

    let queue = Arc::new(InMemoryQueue::new());
    let mut votes = queue.subscribe(topics::VOTES).await;
    let pipeline =
        VotePipeline::start(settings(&server), pets_store(), bearer(), queue.clone()).unwrap();

    let first = tokio::time::timeout(Duration::from_secs(5), votes.recv())
        .await
        .expect("first vote")
        .unwrap();
    let second = tokio::time::timeout(Duration::from_secs(5), votes.recv())
        .await
        .expect("second vote")
        .unwrap();
    assert_eq!(first.payload, b"cats");
    assert_eq!(second.payload, b"dogs");

    let report = tokio::time::timeout(Duration::from_secs(5), pipeline.run_until(async {}))
        .await
        .expect("shutdown should complete")
        .unwrap();

    assert!(report.supervisor.sessions_opened >= 1);
    assert_eq!(report.supervisor.terms_loaded_last, 2);
    assert!(report.publisher.published >= 2);
    assert_eq!(report.publisher.failed, 0);
    assert!(!queue.is_healthy().await);
}

#[tokio::test]
async fn test_reconnects_after_eof() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(FILTER_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string("\r\n"))
        .mount(&server)
        .await;

    let queue = Arc::new(InMemoryQueue::new());
    let pipeline = VotePipeline::start(settings(&server), pets_store(), bearer(), queue).unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    let report = pipeline.run_until(async {}).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert!(requests.len() >= 2, "expected reconnects, got {}", requests.len());
    assert!(report.supervisor.sessions_opened >= 2);
    assert_eq!(report.publisher.published, 0);
}

#[tokio::test]
async fn test_rejected_request_retries_without_streaming() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(FILTER_PATH))
        .respond_with(
            ResponseTemplate::new(401).set_body_string("Authorization Required\n<html>...</html>"),
        )
        .mount(&server)
        .await;

    let queue = Arc::new(InMemoryQueue::new());
    let pipeline = VotePipeline::start(settings(&server), pets_store(), bearer(), queue).unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    let report = pipeline.run_until(async {}).await.unwrap();

    assert!(server.received_requests().await.unwrap().len() >= 2);
    assert_eq!(report.supervisor.sessions_opened, 0);
    assert_eq!(report.publisher.published, 0);
}

#[tokio::test]
async fn test_shutdown_interrupts_blocked_dial() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(FILTER_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("{\"text\":\"cats\"}")
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;

    let queue = Arc::new(InMemoryQueue::new());
    let pipeline = VotePipeline::start(settings(&server), pets_store(), bearer(), queue).unwrap();

    // Let the supervisor get stuck waiting on the delayed response.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(pipeline.factory().current_session_id().is_some());

    let report = tokio::time::timeout(Duration::from_secs(5), pipeline.run_until(async {}))
        .await
        .expect("force close should unblock the supervisor")
        .unwrap();

    assert_eq!(report.supervisor.sessions_opened, 0);
    assert_eq!(report.publisher.published, 0);
}

#[tokio::test]
async fn test_new_polls_tracked_on_reconnect() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(FILTER_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"text\":\"tea time\"}"))
        .mount(&server)
        .await;

    let store = Arc::new(InMemoryPollStore::new());
    let queue = Arc::new(InMemoryQueue::new());
    let mut votes = queue.subscribe(topics::VOTES).await;
    let pipeline =
        VotePipeline::start(settings(&server), store.clone(), bearer(), queue.clone()).unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    store
        .add_poll(Poll::new("Drinks", vec!["Tea".into(), "Coffee".into()]))
        .await;

    let vote = tokio::time::timeout(Duration::from_secs(5), votes.recv())
        .await
        .expect("vote after poll added")
        .unwrap();
    assert_eq!(vote.payload, b"tea");

    pipeline.run_until(async {}).await.unwrap();

    let bodies: Vec<String> = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|r| String::from_utf8_lossy(&r.body).to_string())
        .collect();
    assert_eq!(bodies.first().map(String::as_str), Some("track="));
    assert!(bodies.iter().any(|b| b == "track=%23tea%2C%23coffee"));
}

#[tokio::test]
async fn test_pipeline_from_config_with_sqlite_store() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(FILTER_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"text\":\"Dogs!\"}"))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("ballots.db");
    let store = SqlitePollStore::open(&db_path).unwrap();
    store
        .insert_poll(&Poll::new("Pets", vec!["cats".into(), "dogs".into()]))
        .unwrap();

    let mut config = Config::default();
    config.feed.endpoint = format!("{}{}", server.uri(), FILTER_PATH);
    config.secrets.feed.consumer_key = Some("ck".into());
    config.secrets.feed.consumer_secret = Some("cs".into());
    config.secrets.feed.access_token = Some("at".into());
    config.secrets.feed.access_secret = Some("as".into());
    config.store.path = db_path;
    config.validate().unwrap();

    let mut settings = PipelineSettings::from_config(&config).unwrap();
    assert_eq!(settings.poll_interval, Duration::from_secs(2));
    assert_eq!(settings.recycle_interval, Duration::from_secs(60));
    assert_eq!(settings.topic, "votes");
    settings.poll_interval = Duration::from_millis(20);

    let authorizer = Authorizer::from_config(&config).unwrap();
    let queue = Arc::new(InMemoryQueue::new());
    let mut votes = queue.subscribe(topics::VOTES).await;
    let pipeline = VotePipeline::start(settings, Arc::new(store), authorizer, queue).unwrap();

    let vote = tokio::time::timeout(Duration::from_secs(5), votes.recv())
        .await
        .expect("vote")
        .unwrap();
    assert_eq!(vote.payload, b"dogs");

    pipeline.run_until(async {}).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let auth = requests[0].headers.get("authorization").unwrap().to_str().unwrap();
    assert!(auth.starts_with("OAuth "));
    assert!(auth.contains("oauth_signature=\""));
}

/// Store whose `list_polls` blocks until released.
struct GatedStore {
    inner: InMemoryPollStore,
    entered: tokio::sync::Notify,
    release: tokio::sync::Notify,
}

#[async_trait::async_trait]
impl PollStore for GatedStore {
    async fn list_polls(&self) -> StoreResult<Vec<Poll>> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.list_polls().await
    }
}

#[tokio::test]
async fn test_shutdown_during_term_load_skips_dial() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
        .mount(&server)
        .await;

    let store = Arc::new(GatedStore {
        inner: InMemoryPollStore::with_polls(vec![Poll::new("Pets", vec!["Cats".to_string()])]),
        entered: tokio::sync::Notify::new(),
        release: tokio::sync::Notify::new(),
    });
    let queue = Arc::new(InMemoryQueue::new());
    let pipeline = VotePipeline::start(settings(&server), store.clone(), bearer(), queue).unwrap();

    tokio::time::timeout(Duration::from_secs(5), store.entered.notified())
        .await
        .expect("supervisor should start loading terms");

    // Terms finish loading only after the stop and force_close have run.
    let release = {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            store.release.notify_one();
        })
    };

    let report = tokio::time::timeout(Duration::from_secs(5), pipeline.run_until(async {}))
        .await
        .expect("shutdown should not wait on a session opened after stop")
        .unwrap();
    release.await.unwrap();

    assert_eq!(report.supervisor.sessions_opened, 0);
    assert!(server.received_requests().await.unwrap().is_empty());
}

//! SSE transport against a mock relay channel

use std::time::Duration;

use async_trait::async_trait;
use gh_pulse::source::sse::SseTransport;
use gh_pulse::source::{BackoffPolicy, EventHandler, Flow, ReconnectingSource};
use gh_pulse::{Event, Outcome};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const FAST: BackoffPolicy = BackoffPolicy {
    initial: Duration::from_millis(10),
    max: Duration::from_millis(50),
};

struct Collect {
    events: Vec<Event>,
    stop_after: usize,
}

#[async_trait]
impl EventHandler for Collect {
    async fn on_event(&mut self, event: Event) -> Flow {
        self.events.push(event);
        if self.events.len() >= self.stop_after {
            Flow::Stop(Outcome::ExitWithCode(0))
        } else {
            Flow::Continue
        }
    }
}

fn channel_body() -> String {
    [
        "event: ready\ndata: {}\n\n",
        ": keep-alive\n\n",
        "event: message\ndata: {\"x-github-event\":\"push\",\"x-github-delivery\":\"p-1\",\"body\":{\"ref\":\"refs/heads/main\"}}\n\n",
        "event: message\ndata: not json\n\n",
        "event: message\ndata: {\"x-github-event\":\"pull_request\",\"x-github-delivery\":\"pr-1\",\"body\":{\"action\":\"closed\"}}\n\n",
    ]
    .concat()
}

async fn mount_channel(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/channel"))
        .and(header("accept", "text/event-stream"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(channel_body()),
        )
        .mount(server)
        .await;
}

async fn run_with_deadline(
    source: &ReconnectingSource<SseTransport>,
    handler: &mut Collect,
    cancel: &CancellationToken,
) -> Outcome {
    tokio::time::timeout(Duration::from_secs(5), source.run(handler, cancel))
        .await
        .expect("source did not finish in time")
}

#[tokio::test]
async fn test_sse_relay_events_decoded_in_order() {
    let server = MockServer::start().await;
    mount_channel(&server).await;

    let transport = SseTransport::new(&format!("{}/channel", server.uri())).unwrap();
    let source = ReconnectingSource::new(transport, FAST);
    let mut handler = Collect {
        events: Vec::new(),
        stop_after: 2,
    };

    let outcome = run_with_deadline(&source, &mut handler, &CancellationToken::new()).await;

    assert_eq!(outcome, Outcome::ExitWithCode(0));
    let categories: Vec<_> = handler.events.iter().map(|e| e.category.as_str()).collect();
    assert_eq!(categories, vec!["push", "pull_request"]);
    assert_eq!(handler.events[0].delivery_id, "p-1");
    assert_eq!(handler.events[1].payload["action"], "closed");
}

#[tokio::test]
async fn test_sse_reconnects_after_stream_ends() {
    let server = MockServer::start().await;
    mount_channel(&server).await;

    let transport = SseTransport::new(&format!("{}/channel", server.uri())).unwrap();
    let source = ReconnectingSource::new(transport, FAST);
    // Each response carries two events; four requires a second connection.
    let mut handler = Collect {
        events: Vec::new(),
        stop_after: 4,
    };

    let outcome = run_with_deadline(&source, &mut handler, &CancellationToken::new()).await;

    assert_eq!(outcome, Outcome::ExitWithCode(0));
    assert_eq!(handler.events[2].delivery_id, "p-1");
    assert!(server.received_requests().await.unwrap().len() >= 2);
}

#[tokio::test]
async fn test_sse_category_filter() {
    let server = MockServer::start().await;
    mount_channel(&server).await;

    let transport = SseTransport::new(&format!("{}/channel", server.uri()))
        .unwrap()
        .with_categories(["pull_request"]);
    let source = ReconnectingSource::new(transport, FAST);
    let mut handler = Collect {
        events: Vec::new(),
        stop_after: 1,
    };

    run_with_deadline(&source, &mut handler, &CancellationToken::new()).await;

    assert_eq!(handler.events.len(), 1);
    assert_eq!(handler.events[0].category, "pull_request");
}

#[tokio::test]
async fn test_sse_error_status_retried_until_cancelled() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/channel"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let transport = SseTransport::new(&format!("{}/channel", server.uri())).unwrap();
    let source = ReconnectingSource::new(transport, FAST);
    let mut handler = Collect {
        events: Vec::new(),
        stop_after: 1,
    };

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        stopper.cancel();
    });

    let outcome = run_with_deadline(&source, &mut handler, &cancel).await;

    assert_eq!(outcome, Outcome::Cancelled);
    assert!(handler.events.is_empty());
    assert!(server.received_requests().await.unwrap().len() >= 2);
}

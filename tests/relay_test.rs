mod common;

use axum::{body::Body, http::StatusCode, response::Response, routing::post, Router};
use bytes::Bytes;
use futures_util::StreamExt;
use moldrelay::constants::{PERSIST_FAILED_MESSAGE, PERSIST_TIMEOUT_MESSAGE, TIMEOUT_ERROR_MESSAGE};
use moldrelay::ingress::ImageQueryRef;
use moldrelay::models::NewImageMessage;
use moldrelay::persist::{PersistJob, ResponsePersister};
use moldrelay::store::Store;
use moldrelay::streaming::{FrameContent, OutboundFrame, RelayOutcome, RelayRequest, StreamRelay};
use moldrelay::types::{AgentMode, Sender};
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;

fn relay_for(store: &Store) -> StreamRelay {
    StreamRelay::new(common::upstream_client(), ResponsePersister::new(store.clone()))
        .with_rendezvous_timeout(Duration::from_secs(2))
}

fn chat_request(endpoint: &str, conversation_id: &str) -> RelayRequest {
    RelayRequest {
        mode: AgentMode::Chat,
        endpoint: endpoint.to_string(),
        body: json!({"textQuery": "why short shots?", "imageQuery": null, "machineType": "default", "chatHistory": []}),
        content: FrameContent::Text,
        job: PersistJob {
            conversation_id: conversation_id.to_string(),
            machine_model: Some("Yizumi PAC 460 K3".to_string()),
            image_query: None,
        },
        user_id: Some("u-1".to_string()),
    }
}

/// Mock agent answering `POST /chat/stream` with `body` in a single chunk.
fn single_chunk_agent(body: Vec<u8>) -> Router {
    Router::new().route(
        "/chat/stream",
        post(move || {
            let body = body.clone();
            async move { common::chunked(vec![body]) }
        }),
    )
}

async fn run_relay(relay: &StreamRelay, request: RelayRequest) -> (Vec<OutboundFrame>, RelayOutcome) {
    let handle = relay.relay(request);
    let frames: Vec<OutboundFrame> = handle.frames.collect().await;
    let outcome = match handle.task.await {
        Ok(o) => o,
        Err(e) => panic!("relay task failed: {:?}", e),
    };
    (frames, outcome)
}

async fn feed_count(store: &Store, conversation_id: &str) -> i64 {
    match store.feed_count(conversation_id).await {
        Ok(c) => c,
        Err(e) => panic!("feed count failed: {}", e),
    }
}

#[tokio::test]
async fn upstream_500_yields_one_error_frame_and_no_persistence() {
    let (_dir, store) = common::test_store().await;
    let conversation = common::seed_conversation(&store, "u-1").await;

    let agent = Router::new().route(
        "/chat/stream",
        post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "agent exploded") }),
    );
    let endpoint = common::spawn_upstream(agent).await;

    let (frames, outcome) = run_relay(&relay_for(&store), chat_request(&endpoint, &conversation.id)).await;

    assert_eq!(frames, vec![OutboundFrame::Error("Error: 500".to_string())]);
    assert_eq!(&frames[0].to_bytes()[..], br#"{"error":"Error: 500"}"#);
    assert!(!outcome.persistence_started());
    assert!(matches!(outcome, RelayOutcome::UpstreamFailed(_)));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(feed_count(&store, &conversation.id).await, 0);
}

#[tokio::test]
async fn single_frame_stream_forwards_then_summarizes() {
    let (_dir, store) = common::test_store().await;
    let conversation = common::seed_conversation(&store, "u-1").await;

    let document = json!({
        "response": "Raise the injection speed on stage 2.",
        "images": [{"url": "https://zbot.s3.amazonaws.com/ref/weld.png", "description": "weld line", "utility": "reference"}]
    });
    let mut body = br#"{"data": "Raise the injection speed on stage 2."}"#.to_vec();
    body.extend_from_slice(common::double_encoded(&document).as_bytes());
    let endpoint = common::spawn_upstream(single_chunk_agent(body)).await;

    let (frames, outcome) = run_relay(&relay_for(&store), chat_request(&endpoint, &conversation.id)).await;

    assert_eq!(frames.len(), 2);
    assert_eq!(
        frames[0],
        OutboundFrame::Data("Raise the injection speed on stage 2.".to_string())
    );
    assert_eq!(
        &frames[0].to_bytes()[..],
        b"data : Raise the injection speed on stage 2.\n\n"
    );
    let summary = match &frames[1] {
        OutboundFrame::Summary(s) => s.clone(),
        other => panic!("expected summary frame, got {:?}", other),
    };
    assert_eq!(outcome, RelayOutcome::Completed(summary.clone()));
    assert_eq!(summary.error, None);

    let saved_text = match &summary.text {
        Some(t) => t.clone(),
        None => panic!("summary should carry the saved text"),
    };
    let text = match store.find_text_message(saved_text.id).await {
        Ok(Some(t)) => t,
        other => panic!("saved text not found: {:?}", other.map(|_| ())),
    };
    assert_eq!(text.text, "Raise the injection speed on stage 2.");
    assert_eq!(text.sender, Sender::Ai);
    assert_eq!(text.machine_model.as_deref(), Some("Yizumi PAC 460 K3"));

    assert_eq!(summary.images.len(), 1);
    let image = match store.find_image_message(summary.images[0].id).await {
        Ok(Some(i)) => i,
        other => panic!("saved image not found: {:?}", other.map(|_| ())),
    };
    assert_eq!(image.sender, Sender::Ai);
    assert_eq!(
        image.metadata.as_deref(),
        Some("description:weld line|utility:reference")
    );

    assert_eq!(feed_count(&store, &conversation.id).await, 2);
}

#[tokio::test]
async fn caption_for_the_users_image_is_written_in_place() {
    let (_dir, store) = common::test_store().await;
    let conversation = common::seed_conversation(&store, "u-1").await;
    let user_image = match store
        .create_image_message(
            &conversation.id,
            &NewImageMessage {
                image_url: Some("https://zbot.s3.amazonaws.com/in/part.png".to_string()),
                sender: Sender::User,
                ..NewImageMessage::default()
            },
        )
        .await
    {
        Ok(i) => i,
        Err(e) => panic!("failed to seed image: {}", e),
    };

    let document = json!({"response": "Looks like flash.", "imageInputDescription": "flash along the parting line"});
    let mut body = br#"{"data": "Looks like flash."}"#.to_vec();
    body.extend_from_slice(common::double_encoded(&document).as_bytes());
    let endpoint = common::spawn_upstream(single_chunk_agent(body)).await;

    let mut request = chat_request(&endpoint, &conversation.id);
    request.job.image_query = Some(ImageQueryRef {
        id: user_image.id,
        image_url: user_image.image_url.clone(),
    });
    let (_, outcome) = run_relay(&relay_for(&store), request).await;
    assert!(outcome.persistence_started());

    let updated = match store.find_image_message(user_image.id).await {
        Ok(Some(i)) => i,
        other => panic!("user image vanished: {:?}", other.map(|_| ())),
    };
    assert_eq!(updated.metadata.as_deref(), Some("flash along the parting line"));
    // text + the user's own image; no new image records
    assert_eq!(feed_count(&store, &conversation.id).await, 2);
}

#[tokio::test]
async fn stalled_upstream_times_out_without_persistence() {
    let (_dir, store) = common::test_store().await;
    let conversation = common::seed_conversation(&store, "u-1").await;

    let agent = Router::new().route(
        "/chat/stream",
        post(|| async {
            let stream = futures_util::stream::iter(vec![Ok::<_, Infallible>(Bytes::from_static(
                br#"{"data": "Checking"}"#,
            ))])
            .chain(futures_util::stream::pending());
            Response::new(Body::from_stream(stream))
        }),
    );
    let endpoint = common::spawn_upstream(agent).await;

    let (frames, outcome) = run_relay(&relay_for(&store), chat_request(&endpoint, &conversation.id)).await;

    assert_eq!(
        frames,
        vec![
            OutboundFrame::Data("Checking".to_string()),
            OutboundFrame::Error(TIMEOUT_ERROR_MESSAGE.to_string()),
        ]
    );
    assert_eq!(outcome, RelayOutcome::UpstreamFailed(TIMEOUT_ERROR_MESSAGE.to_string()));
    assert_eq!(feed_count(&store, &conversation.id).await, 0);
}

#[tokio::test]
async fn malformed_final_payload_yields_fallback_summary() {
    let (_dir, store) = common::test_store().await;
    let conversation = common::seed_conversation(&store, "u-1").await;

    let body = br#"{"data": "partial answer"} this is not json"#.to_vec();
    let endpoint = common::spawn_upstream(single_chunk_agent(body)).await;

    let (frames, outcome) = run_relay(&relay_for(&store), chat_request(&endpoint, &conversation.id)).await;

    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0], OutboundFrame::Data("partial answer".to_string()));
    match &frames[1] {
        OutboundFrame::Summary(s) => {
            assert_eq!(s.error.as_deref(), Some(PERSIST_FAILED_MESSAGE));
            assert!(s.text.is_none());
            assert!(s.images.is_empty());
        }
        other => panic!("expected fallback summary, got {:?}", other),
    }
    assert!(outcome.persistence_started());
    assert_eq!(feed_count(&store, &conversation.id).await, 0);
}

#[tokio::test]
async fn departed_client_does_not_stop_persistence() {
    let (_dir, store) = common::test_store().await;
    let conversation = common::seed_conversation(&store, "u-1").await;

    let document = json!({"response": "Lower the barrel temperature.", "images": []});
    let mut body = br#"{"data": "Lower"}{"data": " the barrel temperature."}"#.to_vec();
    body.extend_from_slice(common::double_encoded(&document).as_bytes());
    let endpoint = common::spawn_upstream(single_chunk_agent(body)).await;

    let handle = relay_for(&store).relay(chat_request(&endpoint, &conversation.id));
    drop(handle.frames);

    let outcome = match handle.task.await {
        Ok(o) => o,
        Err(e) => panic!("relay task failed: {:?}", e),
    };
    match outcome {
        RelayOutcome::Completed(summary) => {
            assert_eq!(summary.error, None);
            assert!(summary.text.is_some());
        }
        other => panic!("expected completion, got {:?}", other),
    }
    assert_eq!(feed_count(&store, &conversation.id).await, 1);
}

#[tokio::test]
async fn no_content_status_yields_an_error_frame() {
    let (_dir, store) = common::test_store().await;
    let conversation = common::seed_conversation(&store, "u-1").await;

    let agent = Router::new().route("/chat/stream", post(|| async { StatusCode::NO_CONTENT }));
    let endpoint = common::spawn_upstream(agent).await;

    let (frames, outcome) = run_relay(&relay_for(&store), chat_request(&endpoint, &conversation.id)).await;

    assert_eq!(frames, vec![OutboundFrame::Error("Error: 204".to_string())]);
    assert!(!outcome.persistence_started());
    assert_eq!(feed_count(&store, &conversation.id).await, 0);
}

/// Mock agent that waits `delay` and then answers `text` in one frame.
fn answering_agent(text: &'static str, delay: Duration) -> Router {
    Router::new().route(
        "/chat/stream",
        post(move || async move {
            tokio::time::sleep(delay).await;
            let mut body = format!(r#"{{"data": "{}"}}"#, text).into_bytes();
            body.extend_from_slice(common::double_encoded(&json!({"response": text})).as_bytes());
            common::chunked(vec![body])
        }),
    )
}

async fn summary_text(store: &Store, frames: &[OutboundFrame]) -> String {
    let summary = match frames.last() {
        Some(OutboundFrame::Summary(s)) => s.clone(),
        other => panic!("expected a summary frame last, got {:?}", other),
    };
    let saved = match summary.text {
        Some(t) => t,
        None => panic!("summary has no saved text: {:?}", summary),
    };
    match store.find_text_message(saved.id).await {
        Ok(Some(t)) => t.text,
        other => panic!("saved text not found: {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn concurrent_relays_receive_their_own_summaries() {
    let (_dir, store) = common::test_store().await;
    let conversation = common::seed_conversation(&store, "u-1").await;

    let slow = common::spawn_upstream(answering_agent("alpha", Duration::from_millis(100))).await;
    let fast = common::spawn_upstream(answering_agent("beta", Duration::ZERO)).await;

    let relay = relay_for(&store);
    let ((alpha_frames, alpha_outcome), (beta_frames, beta_outcome)) = tokio::join!(
        run_relay(&relay, chat_request(&slow, &conversation.id)),
        run_relay(&relay, chat_request(&fast, &conversation.id)),
    );

    assert!(alpha_outcome.persistence_started());
    assert!(beta_outcome.persistence_started());
    assert_eq!(alpha_frames[0], OutboundFrame::Data("alpha".to_string()));
    assert_eq!(beta_frames[0], OutboundFrame::Data("beta".to_string()));
    assert_eq!(summary_text(&store, &alpha_frames).await, "alpha");
    assert_eq!(summary_text(&store, &beta_frames).await, "beta");
    assert_eq!(feed_count(&store, &conversation.id).await, 2);
}

#[tokio::test]
async fn slow_persistence_gets_timeout_summary_and_still_saves() {
    let (_dir, store) = common::test_store().await;
    let conversation = common::seed_conversation(&store, "u-1").await;
    let endpoint = common::spawn_upstream(answering_agent("Dry the resin first.", Duration::ZERO)).await;

    // Hold the write lock so every insert waits on the busy timeout.
    let mut writer = match store.pool().acquire().await {
        Ok(c) => c,
        Err(e) => panic!("Failed to acquire connection: {}", e),
    };
    if let Err(e) = sqlx::query("BEGIN EXCLUSIVE").execute(&mut *writer).await {
        panic!("Failed to lock database: {}", e);
    }

    let relay = StreamRelay::new(common::upstream_client(), ResponsePersister::new(store.clone()))
        .with_rendezvous_timeout(Duration::from_millis(100));
    let (frames, outcome) = run_relay(&relay, chat_request(&endpoint, &conversation.id)).await;

    assert_eq!(frames.len(), 2);
    match &frames[1] {
        OutboundFrame::Summary(s) => {
            assert_eq!(s.error.as_deref(), Some(PERSIST_TIMEOUT_MESSAGE));
            assert!(s.text.is_none());
        }
        other => panic!("expected timeout summary, got {:?}", other),
    }
    assert!(outcome.persistence_started());

    if let Err(e) = sqlx::query("COMMIT").execute(&mut *writer).await {
        panic!("Failed to release lock: {}", e);
    }
    drop(writer);

    let mut saved = 0;
    for _ in 0..40 {
        saved = feed_count(&store, &conversation.id).await;
        if saved == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(saved, 1);
}

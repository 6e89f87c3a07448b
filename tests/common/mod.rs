#![allow(dead_code)]

use axum::{body::Body, http::StatusCode, response::Response, Router};
use moldrelay::db::init_db;
use moldrelay::models::{
    Conversation, Machine, Material, NewConversation, NewMachine, NewMaterial,
};
use moldrelay::store::Store;
use moldrelay::upstream::{AgentEndpoints, UpstreamClient, UpstreamConfig};
use moldrelay::{AppState, Args};
use serde_json::Value;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Fresh migrated database in its own temp dir. Keep the `TempDir` alive for
/// the duration of the test.
pub async fn test_store() -> (TempDir, Store) {
    let dir = match tempfile::tempdir() {
        Ok(d) => d,
        Err(e) => panic!("Failed to create temp dir: {:?}", e),
    };
    let pool = match init_db(dir.path().join("moldrelay_test.db")).await {
        Ok(p) => p,
        Err(e) => panic!("Failed to init DB: {:?}", e),
    };
    (dir, Store::new(pool))
}

pub async fn seed_conversation(store: &Store, user_id: &str) -> Conversation {
    let new = NewConversation {
        name: None,
        title: Some("Short shots on cavity 2".to_string()),
        kind: "chat".to_string(),
    };
    match store.create_conversation(user_id, &new).await {
        Ok(c) => c,
        Err(e) => panic!("Failed to create conversation: {}", e),
    }
}

/// The reference machine used by the calculator examples.
pub async fn seed_machine(store: &Store, number: &str) -> Machine {
    let new = NewMachine {
        name: "Yizumi PAC 460 K3".to_string(),
        number: number.to_string(),
        kind: "injection".to_string(),
        screw_diameter: 40.0,
        screw_stroke: 200.0,
        shot_volume: 500.0,
        max_sys_pressure: 150.0,
        clamping_force: 4600.0,
        ..NewMachine::default()
    };
    match store.create_machine(&new).await {
        Ok(m) => m,
        Err(e) => panic!("Failed to create machine: {}", e),
    }
}

pub async fn seed_material(store: &Store) -> Material {
    let new = NewMaterial {
        kind: "PP".to_string(),
        melt_density: 0.92,
        quantity: 100.0,
    };
    match store.create_material(&new).await {
        Ok(m) => m,
        Err(e) => panic!("Failed to create material: {}", e),
    }
}

/// Upstream settings small enough for tests to hit every timeout quickly.
pub fn fast_upstream_config() -> UpstreamConfig {
    UpstreamConfig {
        stream_timeout: Duration::from_millis(500),
        chat_timeout: Duration::from_millis(500),
        search_timeout: Duration::from_millis(500),
        connect_timeout: Duration::from_millis(500),
        max_attempts: 1,
        retry_base_delay_ms: 1,
    }
}

pub fn upstream_client() -> UpstreamClient {
    match UpstreamClient::new(&fast_upstream_config()) {
        Ok(c) => c,
        Err(e) => panic!("Failed to build upstream client: {}", e),
    }
}

pub fn test_state(store: Store, agent_endpoint: &str) -> Arc<AppState> {
    test_state_with(store, AgentEndpoints::new(agent_endpoint))
}

pub fn test_state_with(store: Store, endpoints: AgentEndpoints) -> Arc<AppState> {
    let args = Args {
        rendezvous_timeout_secs: 2,
        ..Args::default()
    };
    Arc::new(AppState::new(
        store,
        upstream_client(),
        endpoints,
        Arc::new(args),
    ))
}

/// Serves `router` on an ephemeral local port and returns its base URL.
pub async fn spawn_upstream(router: Router) -> String {
    let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
        Ok(l) => l,
        Err(e) => panic!("Failed to bind mock upstream: {:?}", e),
    };
    let addr = match listener.local_addr() {
        Ok(a) => a,
        Err(e) => panic!("Mock upstream has no address: {:?}", e),
    };
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            eprintln!("mock upstream stopped: {}", e);
        }
    });
    format!("http://{}", addr)
}

/// A 200 response whose body arrives in the given chunks.
pub fn chunked(chunks: Vec<Vec<u8>>) -> Response {
    let stream = futures_util::stream::iter(chunks.into_iter().map(Ok::<_, Infallible>));
    match Response::builder()
        .status(StatusCode::OK)
        .body(Body::from_stream(stream))
    {
        Ok(r) => r,
        Err(e) => panic!("Failed to build mock response: {:?}", e),
    }
}

/// The final payload as the agent sends it: the document, JSON-encoded as a
/// string.
pub fn double_encoded(document: &Value) -> String {
    match serde_json::to_string(&document.to_string()) {
        Ok(s) => s,
        Err(e) => panic!("Failed to encode payload: {:?}", e),
    }
}

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use axum::{
    Router,
    extract::{Query, State},
    routing::get,
};
use reqwest::Url;

pub fn temp_dir_for(test_name: &str) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let mut dir = std::env::temp_dir();
    dir.push(format!(
        "agentlauncher-{test_name}-{}-{n}-{ts}",
        std::process::id()
    ));
    dir
}

/// Agent stand-in: stays alive long enough to be observed, ignores `connect`.
pub const SLEEPING_AGENT: &[u8] = b"#!/bin/sh\nexec sleep 30\n";
pub const POLICY_BODY: &[u8] = b"MeshName=test\nMeshType=2\n";

#[derive(Default)]
struct Hits {
    binary: AtomicUsize,
    policy: AtomicUsize,
    binary_ids: Mutex<Vec<String>>,
    policy_ids: Mutex<Vec<String>>,
}

#[derive(Clone)]
struct ServerState {
    hits: Arc<Hits>,
    binary_body: Arc<Vec<u8>>,
}

/// In-process stand-in for the MeshCentral download endpoints.
pub struct TestServer {
    pub base: Url,
    hits: Arc<Hits>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with_binary(SLEEPING_AGENT).await
    }

    pub async fn start_with_binary(body: &[u8]) -> Self {
        let hits = Arc::new(Hits::default());
        let state = ServerState {
            hits: hits.clone(),
            binary_body: Arc::new(body.to_vec()),
        };
        let app = Router::new()
            .route("/meshagents", get(binary))
            .route("/meshsettings", get(policy))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            base: Url::parse(&format!("http://{addr}")).unwrap(),
            hits,
        }
    }

    pub fn binary_hits(&self) -> usize {
        self.hits.binary.load(Ordering::SeqCst)
    }

    pub fn policy_hits(&self) -> usize {
        self.hits.policy.load(Ordering::SeqCst)
    }

    pub fn binary_ids(&self) -> Vec<String> {
        self.hits.binary_ids.lock().unwrap().clone()
    }

    pub fn policy_ids(&self) -> Vec<String> {
        self.hits.policy_ids.lock().unwrap().clone()
    }
}

async fn binary(
    State(state): State<ServerState>,
    Query(q): Query<HashMap<String, String>>,
) -> Vec<u8> {
    state.hits.binary.fetch_add(1, Ordering::SeqCst);
    state
        .hits
        .binary_ids
        .lock()
        .unwrap()
        .push(q.get("id").cloned().unwrap_or_default());
    state.binary_body.as_ref().clone()
}

async fn policy(
    State(state): State<ServerState>,
    Query(q): Query<HashMap<String, String>>,
) -> Vec<u8> {
    state.hits.policy.fetch_add(1, Ordering::SeqCst);
    state
        .hits
        .policy_ids
        .lock()
        .unwrap()
        .push(q.get("id").cloned().unwrap_or_default());
    POLICY_BODY.to_vec()
}

/// A base URL nothing listens on.
pub fn dead_base_url() -> Url {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    Url::parse(&format!("http://{addr}")).unwrap()
}

//! In-process send server for integration tests.
//!
//! Verifies `send-v1` credentials with HMAC-SHA256 over a per-upload nonce,
//! rotating the nonce on every authenticated request.

#![allow(dead_code)]

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde_json::{json, Value};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::Notify;

use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};

use csend_core::b64;
use csend_core::types::FileDescriptor;
use csend_crypto::Keychain;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Mode {
    #[default]
    Normal,
    /// 401s repeat the current nonce instead of issuing a fresh one
    RepeatNonce,
    /// Reply `{"error": 400}` right after the upload header
    RejectUpload,
    /// Stop reading the upload socket after the header until `resume` fires
    StallReads,
    /// Serve downloads as `206 Partial Content`
    PartialContent,
}

#[derive(Debug, Clone)]
pub struct Stored {
    pub metadata: String,
    pub data: Vec<u8>,
    pub auth_key: Vec<u8>,
    pub owner: String,
    pub nonce: String,
    pub dlimit: u32,
    pub dtotal: u32,
}

#[derive(Default)]
pub struct MockState {
    pub base_url: String,
    pub mode: Mode,
    pub uploads: Mutex<HashMap<String, Stored>>,
    pub next_id: AtomicUsize,
    pub download_requests: AtomicUsize,
    pub metadata_requests: AtomicUsize,
    pub close_codes: Mutex<Vec<u16>>,
    /// Binary upload frames received, terminator excluded
    pub binary_frames: AtomicUsize,
    pub resume: Notify,
}

impl MockState {
    pub fn stored(&self, id: &str) -> Option<Stored> {
        self.uploads.lock().unwrap().get(id).cloned()
    }

    /// Put a record directly, bypassing the upload socket.
    pub fn insert(&self, id: &str, stored: Stored) {
        self.uploads.lock().unwrap().insert(id.to_string(), stored);
    }

    pub fn last_close_code(&self) -> Option<u16> {
        self.close_codes.lock().unwrap().last().copied()
    }
}

pub struct MockServer {
    pub base_url: String,
    pub state: Arc<MockState>,
}

pub async fn start(mode: Mode) -> MockServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let base_url = format!("http://{addr}");

    let state = Arc::new(MockState {
        base_url: base_url.clone(),
        mode,
        ..Default::default()
    });

    let app = Router::new()
        .route("/api/ws", get(ws_handler))
        .route("/api/download/{id}", get(download))
        .route("/api/metadata/{id}", get(metadata))
        .route("/api/password/{id}", post(set_password))
        .route("/api/delete/{id}", post(delete))
        .route("/api/params/{id}", post(params))
        .route("/api/info/{id}", post(info))
        .with_state(state.clone());

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    MockServer { base_url, state }
}

pub fn fresh_nonce() -> String {
    let mut raw = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut raw);
    // standard alphabet with padding, as real servers send it
    STANDARD.encode(raw)
}

pub fn expected_header(auth_key: &[u8], nonce: &str) -> String {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(auth_key).unwrap();
    mac.update(&b64::decode(nonce).unwrap());
    format!("send-v1 {}", b64::encode(&mac.finalize().into_bytes()))
}

fn challenge(nonce: &str) -> [(header::HeaderName, String); 1] {
    [(header::WWW_AUTHENTICATE, format!("send-v1 {nonce}"))]
}

/// Check the credential and rotate the nonce. `Ok` carries the next nonce.
fn authorize(state: &MockState, id: &str, headers: &HeaderMap) -> Result<String, Response> {
    let mut uploads = state.uploads.lock().unwrap();
    let Some(stored) = uploads.get_mut(id) else {
        return Err(StatusCode::NOT_FOUND.into_response());
    };

    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let ok = presented == expected_header(&stored.auth_key, &stored.nonce);

    if !ok && state.mode == Mode::RepeatNonce {
        return Err((StatusCode::UNAUTHORIZED, challenge(&stored.nonce)).into_response());
    }
    stored.nonce = fresh_nonce();
    if ok {
        Ok(stored.nonce.clone())
    } else {
        Err((StatusCode::UNAUTHORIZED, challenge(&stored.nonce)).into_response())
    }
}

async fn download(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    state.download_requests.fetch_add(1, Ordering::SeqCst);
    let nonce = match authorize(&state, &id, &headers) {
        Ok(nonce) => nonce,
        Err(response) => return response,
    };
    let data = {
        let mut uploads = state.uploads.lock().unwrap();
        let Some(stored) = uploads.get_mut(&id) else {
            return StatusCode::NOT_FOUND.into_response();
        };
        stored.dtotal += 1;
        stored.data.clone()
    };
    let status = if state.mode == Mode::PartialContent {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };
    (status, challenge(&nonce), data).into_response()
}

async fn metadata(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    state.metadata_requests.fetch_add(1, Ordering::SeqCst);
    let nonce = match authorize(&state, &id, &headers) {
        Ok(nonce) => nonce,
        Err(response) => return response,
    };
    let Some(stored) = state.stored(&id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    (
        StatusCode::OK,
        challenge(&nonce),
        Json(json!({ "metadata": stored.metadata, "ttl": 86_400_000u64 })),
    )
        .into_response()
}

fn owner_matches(state: &MockState, id: &str, body: &Value) -> bool {
    let token = body["owner_token"].as_str().unwrap_or_default();
    state.stored(id).is_some_and(|s| s.owner == token)
}

async fn set_password(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> StatusCode {
    if !owner_matches(&state, &id, &body) {
        return StatusCode::NOT_FOUND;
    }
    let Some(auth) = body["auth"].as_str().and_then(|a| b64::decode(a).ok()) else {
        return StatusCode::BAD_REQUEST;
    };
    if let Some(stored) = state.uploads.lock().unwrap().get_mut(&id) {
        stored.auth_key = auth;
    }
    StatusCode::OK
}

async fn delete(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> StatusCode {
    if !owner_matches(&state, &id, &body) {
        return StatusCode::NOT_FOUND;
    }
    state.uploads.lock().unwrap().remove(&id);
    StatusCode::OK
}

async fn params(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> StatusCode {
    if !owner_matches(&state, &id, &body) {
        return StatusCode::NOT_FOUND;
    }
    let Some(dlimit) = body["dlimit"].as_u64() else {
        return StatusCode::BAD_REQUEST;
    };
    if let Some(stored) = state.uploads.lock().unwrap().get_mut(&id) {
        stored.dlimit = dlimit as u32;
    }
    StatusCode::OK
}

async fn info(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    if !owner_matches(&state, &id, &body) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let Some(stored) = state.stored(&id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    Json(json!({ "dlimit": stored.dlimit, "dtotal": stored.dtotal, "ttl": 86_400_000u64 }))
        .into_response()
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<MockState>>) -> Response {
    ws.on_upgrade(move |socket| handle_upload(socket, state))
}

async fn handle_upload(mut socket: WebSocket, state: Arc<MockState>) {
    let header: Value = match socket.recv().await {
        Some(Ok(Message::Text(text))) => match serde_json::from_str(text.as_str()) {
            Ok(v) => v,
            Err(_) => return,
        },
        _ => return,
    };
    let metadata = header["fileMetadata"].as_str().unwrap_or_default().to_string();
    let auth_key = header["authorization"]
        .as_str()
        .and_then(|a| a.strip_prefix("send-v1 "))
        .and_then(|k| b64::decode(k).ok())
        .unwrap_or_default();

    if state.mode == Mode::RejectUpload {
        let _ = socket
            .send(Message::Text(json!({ "error": 400 }).to_string().into()))
            .await;
    }

    if state.mode == Mode::StallReads {
        state.resume.notified().await;
    }

    let mut data = Vec::new();
    loop {
        match socket.recv().await {
            Some(Ok(Message::Binary(chunk))) => {
                if chunk.as_ref() == [0u8].as_slice() {
                    break;
                }
                state.binary_frames.fetch_add(1, Ordering::SeqCst);
                data.extend_from_slice(&chunk);
            }
            Some(Ok(Message::Close(frame))) => {
                let code = frame.map(|f| f.code).unwrap_or(1005);
                state.close_codes.lock().unwrap().push(code);
                return;
            }
            Some(Ok(_)) => {}
            Some(Err(_)) | None => return,
        }
    }

    if state.mode == Mode::RejectUpload {
        wait_for_close(socket, &state).await;
        return;
    }

    let id = format!("f{}", state.next_id.fetch_add(1, Ordering::SeqCst));
    let owner = format!("owner-{id}");
    state.insert(
        &id,
        Stored {
            metadata,
            data,
            auth_key,
            owner: owner.clone(),
            nonce: fresh_nonce(),
            dlimit: 1,
            dtotal: 0,
        },
    );

    let reply = json!({
        "url": format!("{}/download/{id}/", state.base_url),
        "id": id,
        "owner": owner,
    });
    let _ = socket.send(Message::Text(reply.to_string().into())).await;
    wait_for_close(socket, &state).await;
}

async fn wait_for_close(mut socket: WebSocket, state: &MockState) {
    while let Some(Ok(message)) = socket.recv().await {
        if let Message::Close(frame) = message {
            let code = frame.map(|f| f.code).unwrap_or(1005);
            state.close_codes.lock().unwrap().push(code);
            return;
        }
    }
}

/// Encrypt `plaintext` under `keychain` and store it as upload `id`,
/// bypassing the socket.
pub async fn seed(
    state: &MockState,
    id: &str,
    keychain: &Keychain,
    name: &str,
    plaintext: &[u8],
) {
    let descriptor = FileDescriptor {
        name: name.to_string(),
        size: plaintext.len() as u64,
        mime: None,
        manifest: Default::default(),
    };
    let metadata = keychain.encrypt_metadata(&descriptor).unwrap();
    let source = futures::stream::iter(vec![Ok(Bytes::copy_from_slice(plaintext))]).boxed();
    let (records, _) = keychain
        .encrypt_stream(source, plaintext.len() as u64)
        .unwrap();
    let chunks: Vec<Bytes> = records.try_collect().await.unwrap();

    state.insert(
        id,
        Stored {
            metadata: b64::encode(&metadata),
            data: chunks.concat(),
            auth_key: b64::decode(&keychain.auth_key_b64()).unwrap(),
            owner: format!("owner-{id}"),
            nonce: fresh_nonce(),
            dlimit: 1,
            dtotal: 0,
        },
    );
}

/// Poll until the server has recorded a close code, or give up after ~2s.
pub async fn wait_close_code(state: &MockState) -> Option<u16> {
    for _ in 0..200 {
        if let Some(code) = state.last_close_code() {
            return Some(code);
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    None
}

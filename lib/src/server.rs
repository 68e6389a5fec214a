// Copyright 2023 The Wrangle Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The pack endpoints over HTTP.
//!
//! `POST /upload-pack/` and `POST /receive-pack/` run the two session
//! state machines; `GET /refs/` advertises refs for the fetch and push
//! drivers. Sessions are pinned to cookies, guarded by one lock each, and
//! evicted when complete, failed, or idle past the timeout. The auth hook
//! runs before any session work.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::http::header;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use thiserror::Error;
use tower_http::timeout::TimeoutLayer;
use tracing::info;
use tracing::warn;

use crate::config::Config;
use crate::object_id::ObjectId as _;
use crate::objects::CommitId;
use crate::receive_pack::ReceivePackError;
use crate::receive_pack::ReceivePackSession;
use crate::refs::RefError;
use crate::refs::RefStore;
use crate::refs::list_all_refs;
use crate::store::ObjectStore;
use crate::upload_pack::UploadPackError;
use crate::upload_pack::UploadPackResponse;
use crate::upload_pack::UploadPackSession;

pub const UPLOAD_PACK_PATH: &str = "/upload-pack/";
pub const RECEIVE_PACK_PATH: &str = "/receive-pack/";
pub const REFS_PATH: &str = "/refs/";

pub const UPLOAD_PACK_SESSION_COOKIE: &str = "wrgl-upload-pack-session";
pub const RECEIVE_PACK_SESSION_COOKIE: &str = "wrgl-receive-pack-session";

pub const CT_UPLOAD_PACK_REQUEST: &str = "application/x-wrgl-upload-pack-request";
pub const CT_UPLOAD_PACK_RESULT: &str = "application/x-wrgl-upload-pack-result";
pub const CT_RECEIVE_PACK_REQUEST: &str = "application/x-wrgl-receive-pack-request";
pub const CT_RECEIVE_PACK_RESULT: &str = "application/x-wrgl-receive-pack-result";
pub const CT_PACKFILE: &str = "application/x-wrgl-packfile";

/// Marks a packfile response that has further chunks; the client posts an
/// empty body to the same session to continue.
pub const PACK_MORE_HEADER: &str = "wrgl-pack-more";

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthAction {
    Read,
    Write,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
}

/// Enforcement hook consulted once per request, before any session work.
pub trait AuthHook: Send + Sync {
    fn authorize(&self, headers: &HeaderMap, action: AuthAction) -> Result<(), AuthError>;
}

/// Default hook: everything is allowed.
pub struct NoAuth;

impl AuthHook for NoAuth {
    fn authorize(&self, _headers: &HeaderMap, _action: AuthAction) -> Result<(), AuthError> {
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    UploadPack(#[from] UploadPackError),
    #[error(transparent)]
    ReceivePack(#[from] ReceivePackError),
    #[error(transparent)]
    Ref(#[from] RefError),
}

impl ServerError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Auth(AuthError::Unauthorized) => StatusCode::UNAUTHORIZED,
            Self::Auth(AuthError::Forbidden) => StatusCode::FORBIDDEN,
            Self::UploadPack(UploadPackError::Send(_)) | Self::Ref(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::ReceivePack(ReceivePackError::Store(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

struct SessionMap<S> {
    sessions: Mutex<HashMap<String, Arc<Mutex<S>>>>,
}

impl<S> SessionMap<S> {
    fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn get_or_insert(
        &self,
        id: Option<&str>,
        create: impl FnOnce() -> S,
    ) -> (String, Arc<Mutex<S>>) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(id) = id {
            if let Some(session) = sessions.get(id) {
                return (id.to_owned(), session.clone());
            }
        }
        let id = new_session_id();
        let session = Arc::new(Mutex::new(create()));
        sessions.insert(id.clone(), session.clone());
        (id, session)
    }

    fn remove(&self, id: &str) {
        self.sessions.lock().unwrap().remove(id);
    }

    fn evict_idle(&self, timeout: Duration, idle_since: impl Fn(&S) -> Instant) {
        let now = Instant::now();
        self.sessions.lock().unwrap().retain(|id, session| {
            let Ok(session) = session.try_lock() else {
                // In use right now, certainly not idle.
                return true;
            };
            let keep = now.duration_since(idle_since(&session)) < timeout;
            if !keep {
                info!(session = id, "evicting idle session");
            }
            keep
        });
    }
}

fn new_session_id() -> String {
    let bytes: [u8; 16] = rand::random();
    hex::encode(bytes)
}

/// The transport-agnostic server: both the axum handlers and the
/// in-process client transport drive these entry points.
pub struct PackServer {
    store: Arc<ObjectStore>,
    refs: Arc<RefStore>,
    config: Config,
    auth: Arc<dyn AuthHook>,
    upload_sessions: SessionMap<UploadPackSession>,
    receive_sessions: SessionMap<ReceivePackSession>,
    idle_timeout: Duration,
}

/// Response of one upload-pack round.
pub struct UploadPackReply {
    pub session_id: String,
    pub response: UploadPackResponse,
}

/// Response of one receive-pack round.
pub struct ReceivePackReply {
    pub session_id: String,
    pub payload: Vec<u8>,
    pub done: bool,
}

impl PackServer {
    pub fn new(
        store: Arc<ObjectStore>,
        refs: Arc<RefStore>,
        config: Config,
        auth: Arc<dyn AuthHook>,
    ) -> Self {
        Self {
            store,
            refs,
            config,
            auth,
            upload_sessions: SessionMap::new(),
            receive_sessions: SessionMap::new(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn advertised_refs(&self) -> Result<BTreeMap<String, CommitId>, RefError> {
        list_all_refs(&self.refs)
    }

    pub fn upload_pack(
        &self,
        session_id: Option<&str>,
        body: &[u8],
    ) -> Result<UploadPackReply, ServerError> {
        self.evict_idle();
        let (session_id, session) = self.upload_sessions.get_or_insert(session_id, || {
            UploadPackSession::new(self.store.clone(), self.config.max_packfile_size())
        });
        let result = session.lock().unwrap().handle(body);
        match result {
            Ok((response, done)) => {
                if done {
                    self.upload_sessions.remove(&session_id);
                }
                Ok(UploadPackReply {
                    session_id,
                    response,
                })
            }
            Err(err) => {
                self.upload_sessions.remove(&session_id);
                Err(err.into())
            }
        }
    }

    pub fn receive_pack(
        &self,
        session_id: Option<&str>,
        body: &[u8],
    ) -> Result<ReceivePackReply, ServerError> {
        self.evict_idle();
        let (session_id, session) = self.receive_sessions.get_or_insert(session_id, || {
            ReceivePackSession::new(
                self.store.clone(),
                self.refs.clone(),
                self.config.clone(),
            )
        });
        let result = session.lock().unwrap().handle(body);
        match result {
            Ok((payload, done)) => {
                if done {
                    self.receive_sessions.remove(&session_id);
                }
                Ok(ReceivePackReply {
                    session_id,
                    payload,
                    done,
                })
            }
            Err(err) => {
                self.receive_sessions.remove(&session_id);
                Err(err.into())
            }
        }
    }

    pub fn authorize(&self, headers: &HeaderMap, action: AuthAction) -> Result<(), AuthError> {
        self.auth.authorize(headers, action)
    }

    fn evict_idle(&self) {
        self.upload_sessions
            .evict_idle(self.idle_timeout, UploadPackSession::idle_since);
        self.receive_sessions
            .evict_idle(self.idle_timeout, ReceivePackSession::idle_since);
    }
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then(|| value.to_owned())
    })
}

fn error_response(err: &ServerError) -> Response {
    warn!(error = %err, "pack request failed");
    (err.status(), format!("{err}\n")).into_response()
}

async fn handle_upload_pack(
    State(server): State<Arc<PackServer>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(err) = server.authorize(&headers, AuthAction::Read) {
        return error_response(&err.into());
    }
    let session_id = cookie_value(&headers, UPLOAD_PACK_SESSION_COOKIE);
    let reply = match server.upload_pack(session_id.as_deref(), &body) {
        Ok(reply) => reply,
        Err(err) => return error_response(&err),
    };
    let cookie = format!(
        "{UPLOAD_PACK_SESSION_COOKIE}={}; Path=/; HttpOnly",
        reply.session_id
    );
    match reply.response {
        UploadPackResponse::Acks(payload) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, CT_UPLOAD_PACK_RESULT)
            .header(header::SET_COOKIE, cookie)
            .body(payload.into())
            .unwrap(),
        UploadPackResponse::Packfile { chunk, more } => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, CT_PACKFILE)
            .header(header::SET_COOKIE, cookie)
            .header(PACK_MORE_HEADER, if more { "1" } else { "0" })
            .body(chunk.into())
            .unwrap(),
    }
}

async fn handle_receive_pack(
    State(server): State<Arc<PackServer>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(err) = server.authorize(&headers, AuthAction::Write) {
        return error_response(&err.into());
    }
    let session_id = cookie_value(&headers, RECEIVE_PACK_SESSION_COOKIE);
    let reply = match server.receive_pack(session_id.as_deref(), &body) {
        Ok(reply) => reply,
        Err(err) => return error_response(&err),
    };
    let cookie = format!(
        "{RECEIVE_PACK_SESSION_COOKIE}={}; Path=/; HttpOnly",
        reply.session_id
    );
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, CT_RECEIVE_PACK_RESULT)
        .header(header::SET_COOKIE, cookie)
        .body(reply.payload.into())
        .unwrap()
}

async fn handle_get_refs(
    State(server): State<Arc<PackServer>>,
    headers: HeaderMap,
) -> Response {
    if let Err(err) = server.authorize(&headers, AuthAction::Read) {
        return error_response(&err.into());
    }
    match server.advertised_refs() {
        Ok(refs) => {
            let payload: BTreeMap<String, String> = refs
                .into_iter()
                .map(|(name, id)| (name, id.hex()))
                .collect();
            axum::Json(payload).into_response()
        }
        Err(err) => error_response(&err.into()),
    }
}

/// Builds the HTTP router for one repository.
pub fn pack_router(server: Arc<PackServer>) -> Router {
    Router::new()
        .route(UPLOAD_PACK_PATH, post(handle_upload_pack))
        .route(RECEIVE_PACK_PATH, post(handle_receive_pack))
        .route(REFS_PATH, get(handle_get_refs))
        .layer(TimeoutLayer::new(DEFAULT_HTTP_TIMEOUT))
        .with_state(server)
}

/// Serves `router` until the listener fails. Callers usually spawn this on
/// a dedicated runtime.
pub async fn serve(
    server: Arc<PackServer>,
    listener: tokio::net::TcpListener,
) -> std::io::Result<()> {
    axum::serve(listener, pack_router(server)).await
}

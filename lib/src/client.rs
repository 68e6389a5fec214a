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

//! Client side of the pack protocol.
//!
//! Drivers talk to a [`Transport`]; the HTTP implementation wraps a
//! blocking reqwest client with a cookie store so sessions survive across
//! round trips. [`LocalTransport`] routes the same byte streams into an
//! in-process [`PackServer`], which keeps protocol tests hermetic.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use itertools::Itertools as _;
use thiserror::Error;
use tracing::debug;
use tracing::instrument;

use crate::dag_walk;
use crate::object_id::ObjectId as _;
use crate::objects::CommitId;
use crate::pktline;
use crate::pktline::PktLine;
use crate::pktline::PktLineError;
use crate::receiver::ReceiveError;
use crate::receiver::ReceiveSummary;
use crate::receiver::receive_objects;
use crate::refs::RefStore;
use crate::refs::list_all_refs;
use crate::server::CT_PACKFILE;
use crate::server::CT_RECEIVE_PACK_REQUEST;
use crate::server::CT_UPLOAD_PACK_REQUEST;
use crate::server::PACK_MORE_HEADER;
use crate::server::PackServer;
use crate::server::RECEIVE_PACK_PATH;
use crate::server::REFS_PATH;
use crate::server::UPLOAD_PACK_PATH;
use crate::store::ObjectStore;
use crate::store::StoreError;
use crate::upload_pack::UploadPackResponse;

const HAVES_PER_ROUND: usize = 32;
const MAX_HAVES: usize = 256;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http error")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    PktLine(#[from] PktLineError),
    #[error(transparent)]
    Receive(#[from] ReceiveError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ref(#[from] crate::refs::RefError),
}

/// One upload-pack response as seen by the client.
pub struct TransportReply {
    /// True when the body is a packfile chunk rather than ACK pkt-lines.
    pub packfile: bool,
    /// True when more packfile chunks remain.
    pub more: bool,
    pub body: Vec<u8>,
}

pub trait Transport: Send + Sync {
    fn get_refs(&self) -> Result<BTreeMap<String, CommitId>, ClientError>;
    fn upload_pack(&self, body: Vec<u8>) -> Result<TransportReply, ClientError>;
    fn receive_pack(&self, body: Vec<u8>) -> Result<Vec<u8>, ClientError>;
}

/// HTTP transport against a remote repository URL.
pub struct HttpTransport {
    base: String,
    http: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let http = reqwest::blocking::Client::builder()
            .cookie_store(true)
            .build()?;
        Ok(Self {
            base: base_url.trim_end_matches('/').to_owned(),
            http,
        })
    }

    fn check(response: reqwest::blocking::Response) -> Result<reqwest::blocking::Response, ClientError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response.text().unwrap_or_default();
        Err(ClientError::Status { status, message })
    }
}

impl Transport for HttpTransport {
    fn get_refs(&self) -> Result<BTreeMap<String, CommitId>, ClientError> {
        let response = Self::check(self.http.get(format!("{}{REFS_PATH}", self.base)).send()?)?;
        let refs: BTreeMap<String, String> = response.json()?;
        refs.into_iter()
            .map(|(name, hex)| {
                CommitId::try_from_hex(&hex)
                    .map(|id| (name, id))
                    .ok_or_else(|| ClientError::Protocol(format!("invalid ref value {hex:?}")))
            })
            .collect()
    }

    fn upload_pack(&self, body: Vec<u8>) -> Result<TransportReply, ClientError> {
        let response = Self::check(
            self.http
                .post(format!("{}{UPLOAD_PACK_PATH}", self.base))
                .header(reqwest::header::CONTENT_TYPE, CT_UPLOAD_PACK_REQUEST)
                .body(body)
                .send()?,
        )?;
        let packfile = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value == CT_PACKFILE);
        let more = response
            .headers()
            .get(PACK_MORE_HEADER)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value == "1");
        Ok(TransportReply {
            packfile,
            more,
            body: response.bytes()?.to_vec(),
        })
    }

    fn receive_pack(&self, body: Vec<u8>) -> Result<Vec<u8>, ClientError> {
        let response = Self::check(
            self.http
                .post(format!("{}{RECEIVE_PACK_PATH}", self.base))
                .header(reqwest::header::CONTENT_TYPE, CT_RECEIVE_PACK_REQUEST)
                .body(body)
                .send()?,
        )?;
        Ok(response.bytes()?.to_vec())
    }
}

/// Routes requests into an in-process [`PackServer`], tracking session
/// cookies the way an HTTP client would.
pub struct LocalTransport {
    server: Arc<PackServer>,
    upload_session: Mutex<Option<String>>,
    receive_session: Mutex<Option<String>>,
}

impl LocalTransport {
    pub fn new(server: Arc<PackServer>) -> Self {
        Self {
            server,
            upload_session: Mutex::new(None),
            receive_session: Mutex::new(None),
        }
    }
}

impl Transport for LocalTransport {
    fn get_refs(&self) -> Result<BTreeMap<String, CommitId>, ClientError> {
        self.server
            .advertised_refs()
            .map_err(|err| ClientError::Protocol(err.to_string()))
    }

    fn upload_pack(&self, body: Vec<u8>) -> Result<TransportReply, ClientError> {
        let mut session = self.upload_session.lock().unwrap();
        let reply = self
            .server
            .upload_pack(session.as_deref(), &body)
            .map_err(|err| ClientError::Protocol(err.to_string()))?;
        *session = Some(reply.session_id);
        Ok(match reply.response {
            UploadPackResponse::Acks(payload) => TransportReply {
                packfile: false,
                more: false,
                body: payload,
            },
            UploadPackResponse::Packfile { chunk, more } => TransportReply {
                packfile: true,
                more,
                body: chunk,
            },
        })
    }

    fn receive_pack(&self, body: Vec<u8>) -> Result<Vec<u8>, ClientError> {
        let mut session = self.receive_session.lock().unwrap();
        let reply = self
            .server
            .receive_pack(session.as_deref(), &body)
            .map_err(|err| ClientError::Protocol(err.to_string()))?;
        *session = if reply.done {
            None
        } else {
            Some(reply.session_id)
        };
        Ok(reply.payload)
    }
}

// Commits worth offering as haves: local ref tips first, then their
// ancestry, breadth-first, capped.
fn local_haves(store: &ObjectStore, refs: &RefStore) -> Result<Vec<CommitId>, ClientError> {
    let tips: Vec<CommitId> = list_all_refs(refs)?.into_values().collect();
    let mut haves = Vec::new();
    let mut seen = HashSet::new();
    let mut queue: VecDeque<CommitId> = tips.into_iter().collect();
    while let Some(id) = queue.pop_front() {
        if haves.len() >= MAX_HAVES {
            break;
        }
        if !seen.insert(id) {
            continue;
        }
        match store.get_commit(&id) {
            Ok(commit) => {
                haves.push(id);
                queue.extend(commit.parents);
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(haves)
}

fn parse_acks(body: &[u8]) -> Result<Vec<CommitId>, ClientError> {
    let mut reader = body;
    let mut acks = Vec::new();
    while let Some(line) = pktline::read_pkt_line(&mut reader)? {
        let PktLine::Data(_) = &line else {
            break;
        };
        let text = line
            .as_text()
            .ok_or_else(|| ClientError::Protocol("binary pkt-line in acks".to_owned()))?;
        if text == "NAK" {
            continue;
        }
        let hex = text
            .strip_prefix("ACK ")
            .ok_or_else(|| ClientError::Protocol(format!("unexpected line {text:?}")))?;
        let id = CommitId::try_from_hex(hex)
            .ok_or_else(|| ClientError::Protocol(format!("invalid ack id {hex:?}")))?;
        acks.push(id);
    }
    Ok(acks)
}

/// Negotiates with the server and persists every received object. Returns
/// the summary of received commits. `wants` that already exist locally are
/// skipped; an empty effective want set returns an empty summary without
/// touching the network.
#[instrument(skip(store, refs, transport))]
pub fn fetch_objects(
    store: &ObjectStore,
    refs: &RefStore,
    transport: &dyn Transport,
    wants: &[CommitId],
    depth: u32,
) -> Result<ReceiveSummary, ClientError> {
    let wants: Vec<CommitId> = {
        let mut unique = Vec::new();
        let mut seen = HashSet::new();
        for want in wants {
            if !store.commit_exists(want) && seen.insert(*want) {
                unique.push(*want);
            }
        }
        unique
    };
    if wants.is_empty() {
        debug!("nothing wanted");
        return Ok(ReceiveSummary::default());
    }

    let mut haves: VecDeque<CommitId> = local_haves(store, refs)?.into();
    let mut first = true;
    let mut reply = loop {
        let mut body = Vec::new();
        if first {
            for want in &wants {
                pktline::write_text_line(&mut body, &format!("want {}", want.hex()))?;
            }
            if depth > 0 {
                pktline::write_text_line(&mut body, &format!("depth {depth}"))?;
            }
        }
        let batch = haves
            .drain(..haves.len().min(HAVES_PER_ROUND))
            .collect_vec();
        for have in &batch {
            pktline::write_text_line(&mut body, &format!("have {}", have.hex()))?;
        }
        if haves.is_empty() {
            // No more haves to offer; let the server send what it has.
            pktline::write_text_line(&mut body, "done")?;
        } else {
            pktline::write_flush(&mut body)?;
        }
        first = false;
        let reply = transport.upload_pack(body)?;
        if reply.packfile {
            break reply;
        }
        let acks = parse_acks(&reply.body)?;
        debug!(acks = acks.len(), "negotiation round");
    };

    let mut summary = ReceiveSummary::default();
    loop {
        let chunk_summary = receive_objects(store, &reply.body[..])?;
        summary.commits.extend(chunk_summary.commits);
        summary.shallow.extend(chunk_summary.shallow);
        if !reply.more {
            break;
        }
        reply = transport.upload_pack(Vec::new())?;
        if !reply.packfile {
            return Err(ClientError::Protocol(
                "expected packfile continuation".to_owned(),
            ));
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::object_id::ObjectId as _;
    use crate::server::NoAuth;
    use testutils::create_random_commit;
    use testutils::new_object_store;
    use testutils::new_ref_store;

    fn server_with_chain(
        n: usize,
    ) -> (
        Vec<tempfile::TempDir>,
        Arc<ObjectStore>,
        Arc<RefStore>,
        LocalTransport,
        Vec<CommitId>,
    ) {
        let (d1, store) = new_object_store();
        let (d2, refs) = new_ref_store();
        let store = Arc::new(store);
        let refs = Arc::new(refs);
        let mut chain: Vec<CommitId> = Vec::new();
        for _ in 0..n {
            let parents: Vec<CommitId> = chain.last().copied().into_iter().collect();
            let (id, _) = create_random_commit(&store, 3, 20, &parents);
            chain.push(id);
        }
        crate::refs::save_ref(
            &refs,
            "heads/main",
            chain.last().unwrap(),
            "t",
            "t@e.c",
            "commit",
            "tip",
        )
        .unwrap();
        let server = Arc::new(PackServer::new(
            store.clone(),
            refs.clone(),
            Config::default(),
            Arc::new(NoAuth),
        ));
        let transport = LocalTransport::new(server);
        (vec![d1, d2], store, refs, transport, chain)
    }

    #[test]
    fn test_fetch_everything() {
        let (_dirs, _store, _refs, transport, chain) = server_with_chain(3);
        let (_cd, client_store) = new_object_store();
        let (_cr, client_refs) = new_ref_store();
        let summary =
            fetch_objects(&client_store, &client_refs, &transport, &[chain[2]], 0).unwrap();
        assert_eq!(summary.commits.len(), 3);
        for id in &chain {
            let commit = client_store.get_commit(id).unwrap();
            assert!(client_store.commit_is_complete(&commit));
        }
    }

    #[test]
    fn test_fetch_skips_known_commits() {
        let (_dirs, server_store, _refs, transport, chain) = server_with_chain(4);
        let (_cd, client_store) = new_object_store();
        let (_cr, client_refs) = new_ref_store();

        // Client already has the first half of the chain.
        let pack = {
            let mut sender = crate::sender::ObjectSender::new(
                server_store.clone(),
                chain[..2]
                    .iter()
                    .rev()
                    .map(|id| (*id, server_store.get_commit(id).unwrap()))
                    .collect(),
                &HashSet::new(),
                u64::MAX,
            )
            .unwrap();
            let mut buf = Vec::new();
            assert!(sender.write_objects(&mut buf).unwrap());
            buf
        };
        receive_objects(&client_store, &pack[..]).unwrap();
        crate::refs::save_ref(
            &client_refs,
            "heads/main",
            &chain[1],
            "t",
            "t@e.c",
            "commit",
            "m",
        )
        .unwrap();

        let summary =
            fetch_objects(&client_store, &client_refs, &transport, &[chain[3]], 0).unwrap();
        let fetched: HashSet<CommitId> = summary.commits.iter().copied().collect();
        assert_eq!(fetched, HashSet::from([chain[2], chain[3]]));

        // Fetching again wants nothing.
        let summary =
            fetch_objects(&client_store, &client_refs, &transport, &[chain[3]], 0).unwrap();
        assert!(summary.commits.is_empty());
    }

    #[test]
    fn test_parse_acks() {
        let mut body = Vec::new();
        pktline::write_text_line(&mut body, "NAK").unwrap();
        let id = CommitId::new([7; 16]);
        pktline::write_text_line(&mut body, &format!("ACK {}", id.hex())).unwrap();
        pktline::write_flush(&mut body).unwrap();
        assert_eq!(parse_acks(&body).unwrap(), vec![id]);
    }
}

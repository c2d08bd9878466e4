//! Fetching metadata and snapshot bytes.

use std::cell::RefCell;
use std::collections::BTreeMap;

use bytes::Bytes;
use foundation::time::TimeKey;
use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::{self, LocalBoxFuture, Shared};

use crate::config::TimeSourceConfig;
use crate::protocol::{QueryParams, describe};
use crate::request::Request;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// Non-200 response.
    Status { url: String, status: u16 },
    Transport(String),
    /// Key cannot be expressed as a calendar date.
    InvalidKey(TimeKey),
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadError::Status { url, status } => write!(f, "HTTP {status} from {url}"),
            LoadError::Transport(msg) => write!(f, "request failed: {msg}"),
            LoadError::InvalidKey(key) => write!(f, "time key {key} out of range"),
        }
    }
}

impl std::error::Error for LoadError {}

/// Source of raw metadata/snapshot bytes.
///
/// Futures are `'static` and single-threaded; implementations clone what
/// they need out of `self` before returning.
pub trait SnapshotLoader {
    fn fetch(&self, request: Request) -> LocalBoxFuture<'static, Result<Bytes, LoadError>>;
}

/// Loads from the HTTP endpoints named in a `TimeSourceConfig`.
pub struct HttpLoader {
    host: String,
    scope: String,
    meta_endpoint: String,
    data_endpoint: String,
    #[cfg(not(target_arch = "wasm32"))]
    client: reqwest::Client,
}

impl HttpLoader {
    pub fn new(config: &TimeSourceConfig) -> Self {
        Self {
            host: config.host.trim_end_matches('/').to_string(),
            scope: config.scope.clone(),
            meta_endpoint: config.meta_endpoint.clone(),
            data_endpoint: config.data_endpoint.clone(),
            #[cfg(not(target_arch = "wasm32"))]
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self, request: Request) -> &str {
        match request {
            Request::Meta(_) => &self.meta_endpoint,
            Request::Snapshot(_) => &self.data_endpoint,
        }
    }
}

impl SnapshotLoader for HttpLoader {
    fn fetch(&self, request: Request) -> LocalBoxFuture<'static, Result<Bytes, LoadError>> {
        let Some(params) = QueryParams::for_key(&self.scope, request.key()) else {
            return future::ready(Err(LoadError::InvalidKey(request.key()))).boxed_local();
        };
        let endpoint = self.endpoint(request);
        let url = format!("{}/{endpoint}", self.host);
        let label = describe(&self.host, endpoint, &params);
        tracing::debug!(url = %label, "fetch");

        #[cfg(not(target_arch = "wasm32"))]
        {
            let pending = self.client.get(url).query(&params.pairs());
            async move {
                let resp = pending
                    .send()
                    .await
                    .map_err(|e| LoadError::Transport(e.to_string()))?;
                if resp.status() != reqwest::StatusCode::OK {
                    return Err(LoadError::Status {
                        url: label,
                        status: resp.status().as_u16(),
                    });
                }
                resp.bytes()
                    .await
                    .map_err(|e| LoadError::Transport(e.to_string()))
            }
            .boxed_local()
        }

        #[cfg(target_arch = "wasm32")]
        {
            async move {
                let pairs = params.pairs();
                let resp = gloo_net::http::Request::get(&url)
                    .query(pairs.iter().map(|(k, v)| (*k, v)))
                    .send()
                    .await
                    .map_err(|e| LoadError::Transport(e.to_string()))?;
                if resp.status() != 200 {
                    return Err(LoadError::Status {
                        url: label,
                        status: resp.status(),
                    });
                }
                let body = resp
                    .binary()
                    .await
                    .map_err(|e| LoadError::Transport(e.to_string()))?;
                Ok(Bytes::from(body))
            }
            .boxed_local()
        }
    }
}

type HeldFetch = Shared<LocalBoxFuture<'static, Result<Bytes, LoadError>>>;

enum MemoryEntry {
    Ready(Result<Bytes, LoadError>),
    Held(HeldFetch),
}

/// Serves responses registered up front, for offline playback and replays.
///
/// Unknown requests answer 404. `hold` parks a request until the caller
/// releases it, which lets hosts script arrival order.
#[derive(Default)]
pub struct MemoryLoader {
    entries: RefCell<BTreeMap<Request, MemoryEntry>>,
    requests: RefCell<Vec<Request>>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, request: Request, bytes: impl Into<Bytes>) {
        self.entries
            .borrow_mut()
            .insert(request, MemoryEntry::Ready(Ok(bytes.into())));
    }

    pub fn fail(&self, request: Request, error: LoadError) {
        self.entries
            .borrow_mut()
            .insert(request, MemoryEntry::Ready(Err(error)));
    }

    /// Fetches of `request` stay pending until the sender fires. Dropping
    /// the sender fails them.
    pub fn hold(&self, request: Request) -> oneshot::Sender<Result<Bytes, LoadError>> {
        let (tx, rx) = oneshot::channel();
        let fetch = rx
            .map(|r| r.unwrap_or_else(|_| Err(LoadError::Transport("released".into()))))
            .boxed_local()
            .shared();
        self.entries
            .borrow_mut()
            .insert(request, MemoryEntry::Held(fetch));
        tx
    }

    /// Every request seen so far, in order.
    pub fn requests(&self) -> Vec<Request> {
        self.requests.borrow().clone()
    }

    pub fn request_count(&self, request: Request) -> usize {
        self.requests.borrow().iter().filter(|r| **r == request).count()
    }
}

impl SnapshotLoader for MemoryLoader {
    fn fetch(&self, request: Request) -> LocalBoxFuture<'static, Result<Bytes, LoadError>> {
        self.requests.borrow_mut().push(request);
        match self.entries.borrow().get(&request) {
            Some(MemoryEntry::Ready(r)) => future::ready(r.clone()).boxed_local(),
            Some(MemoryEntry::Held(fetch)) => fetch.clone().boxed_local(),
            None => future::ready(Err(LoadError::Status {
                url: format!("memory:{request:?}"),
                status: 404,
            }))
            .boxed_local(),
        }
    }
}

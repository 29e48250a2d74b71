use std::io::Write;
use std::time::Duration;

use anyhow::{format_err, Error};
use cdp_api_types::{HashListRequest, HashListResponse, SuccessResponse, VersionInfo, WireBlock, WireMetadata};
use flate2::write::DeflateEncoder;
use flate2::Compression;
use hyper::client::{Client, HttpConnector};
use hyper::{Body, Method, Request};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// HTTP requests are given a generous timeout since they are expected to
/// finish quickly but may block under load (§5 "Timeouts").
const HTTP_TIMEOUT: Duration = Duration::from_secs(120);

/// The two response-side failure shapes call sites actually need to
/// distinguish (§7 "Parse failure" vs "Transport failure"): everything else
/// propagates as a plain `anyhow::Error` via `?`.
#[derive(thiserror::Error, Debug)]
pub enum WireError {
    #[error("response body did not parse as the expected JSON shape: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("server returned unexpected status {0}")]
    UnexpectedStatus(hyper::StatusCode),
}

/// Thin, blocking wrapper around `hyper::Client` for the wire protocol of
/// §6.1. Each call spins up (or reuses) a small current-thread tokio
/// runtime internally, so the Saver/Reconnector/restore threads can call it
/// without themselves being async.
pub struct HttpClient {
    runtime: tokio::runtime::Runtime,
    client: Client<HttpConnector>,
    base_url: String,
    compress: bool,
}

/// The outcome of one POST: either the server accepted it and returned a
/// parsed body, or the request failed outright (connection refused, timed
/// out, non-success status) and the caller should buffer it for later
/// retry (§4.4).
pub enum PostOutcome<T> {
    Accepted(T),
    Failed,
}

impl HttpClient {
    pub fn new(server_ip: &str, server_port: u16, compress: bool) -> Result<Self, Error> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self {
            runtime,
            client: Client::new(),
            base_url: format!("http://{server_ip}:{server_port}"),
            compress,
        })
    }

    fn uri(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn body_bytes(&self, body: &[u8]) -> (Vec<u8>, bool) {
        if self.compress {
            let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
            if encoder.write_all(body).is_ok() {
                if let Ok(compressed) = encoder.finish() {
                    return (compressed, true);
                }
            }
        }
        (body.to_vec(), false)
    }

    fn content_type(path: &str) -> &'static str {
        if path.ends_with(".json") {
            "application/json; charset=utf-8"
        } else {
            "text/plain; charset=utf-8"
        }
    }

    /// GET `path`, parsing a JSON response. Returns `Ok(None)` for any
    /// transport-level failure, so callers treat it the same way a failed
    /// POST is treated (§7 "Transport failure").
    pub fn get_json<T: DeserializeOwned>(&self, path: &str) -> Option<T> {
        self.runtime.block_on(self.get_json_async(path)).ok()
    }

    async fn get_json_async<T: DeserializeOwned>(&self, path: &str) -> Result<T, Error> {
        let req = Request::builder()
            .method(Method::GET)
            .uri(self.uri(path))
            .body(Body::empty())?;
        let resp = tokio::time::timeout(HTTP_TIMEOUT, self.client.request(req))
            .await
            .map_err(|_| format_err!("GET {path} timed out"))??;
        if !resp.status().is_success() {
            return Err(WireError::UnexpectedStatus(resp.status()).into());
        }
        let bytes = hyper::body::to_bytes(resp.into_body()).await?;
        Ok(serde_json::from_slice(&bytes).map_err(WireError::Malformed)?)
    }

    /// POST a JSON-serializable body to `path`, returning the parsed
    /// response on success or `PostOutcome::Failed` on any transport or
    /// parse failure (§7).
    pub fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> PostOutcome<T> {
        match self.runtime.block_on(self.post_json_async(path, body)) {
            Ok(value) => PostOutcome::Accepted(value),
            Err(err) => {
                match err.downcast_ref::<WireError>() {
                    Some(WireError::Malformed(_)) => {
                        log::warn!("POST {path} got a response the server shouldn't send: {err:#}");
                    }
                    Some(WireError::UnexpectedStatus(_)) | None => {
                        log::debug!("POST {path} failed: {err:#}");
                    }
                }
                PostOutcome::Failed
            }
        }
    }

    async fn post_json_async<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, Error> {
        let raw = serde_json::to_vec(body)?;
        let (payload, compressed) = self.body_bytes(&raw);

        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(self.uri(path))
            .header("Content-Type", Self::content_type(path));
        if compressed {
            builder = builder
                .header("Content-Encoding", "gzip")
                .header("X-Uncompressed-Content-Length", raw.len().to_string());
        }
        let req = builder.body(Body::from(payload))?;

        let resp = tokio::time::timeout(HTTP_TIMEOUT, self.client.request(req))
            .await
            .map_err(|_| format_err!("POST {path} timed out"))??;
        if !resp.status().is_success() {
            return Err(WireError::UnexpectedStatus(resp.status()).into());
        }
        let bytes = hyper::body::to_bytes(resp.into_body()).await?;
        Ok(serde_json::from_slice(&bytes).map_err(WireError::Malformed)?)
    }

    /// Raw bytes of the exact request body that would be sent, for buffering
    /// into the local cache's unsent-requests table when a POST fails
    /// (§4.4 "Failure semantics").
    pub fn encode_json_body<B: Serialize>(body: &B) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(body)?)
    }

    /// Replay a previously buffered (endpoint, payload) pair, used by the
    /// Reconnector (§4.6) and [`crate::local_cache::LocalCache::drain_unsent`].
    pub fn replay_buffered(&self, endpoint: &str, payload: &[u8]) -> bool {
        self.runtime
            .block_on(self.replay_buffered_async(endpoint, payload))
            .unwrap_or(false)
    }

    async fn replay_buffered_async(&self, endpoint: &str, payload: &[u8]) -> Result<bool, Error> {
        let req = Request::builder()
            .method(Method::POST)
            .uri(self.uri(endpoint))
            .header("Content-Type", Self::content_type(endpoint))
            .body(Body::from(payload.to_vec()))?;
        let resp = tokio::time::timeout(HTTP_TIMEOUT, self.client.request(req)).await??;
        Ok(resp.status().is_success())
    }

    /// GET `/Version.json`, used by the Reconnector as a liveness probe
    /// (§4.6) and by `--version` output.
    pub fn get_version(&self) -> Option<VersionInfo> {
        self.get_json("/Version.json")
    }

    pub fn post_metadata(&self, wire: &WireMetadata) -> PostOutcome<HashListResponse> {
        self.post_json("/Meta.json", wire)
    }

    pub fn post_hash_array(&self, hashes: &[String]) -> PostOutcome<HashListResponse> {
        let req = HashListRequest {
            hash_list: hashes.to_vec(),
        };
        self.post_json("/Hash_Array.json", &req)
    }

    pub fn post_block(&self, block: &WireBlock) -> PostOutcome<SuccessResponse> {
        self.post_json("/Data.json", block)
    }

    pub fn post_block_array(&self, blocks: &[WireBlock]) -> PostOutcome<SuccessResponse> {
        #[derive(Serialize)]
        struct DataArray<'a> {
            data_array: &'a [WireBlock],
        }
        self.post_json("/Data_Array.json", &DataArray {
            data_array: blocks,
        })
    }

    pub fn get_file_list<T: DeserializeOwned>(&self, query: &str) -> Option<T> {
        self.get_json(&format!("/File/List.json?{query}"))
    }

    pub fn get_block(&self, hex_hash: &str) -> Option<WireBlock> {
        self.get_json(&format!("/Data/{hex_hash}.json"))
    }

    /// Bulk-fetch blocks by hash, used by the restore CLI (§4.10): a single
    /// GET carrying every requested hash in the `X-Get-Hash-Array` header,
    /// answered with the blocks' raw bytes concatenated in the same order
    /// (§6.1, §4.9). Returns `None` on any transport error or a server
    /// lacking the bulk endpoint; the caller falls back to
    /// [`Self::get_block`] per hash.
    pub fn get_hash_array(&self, hashes: &[String]) -> Option<Vec<u8>> {
        self.runtime.block_on(self.get_hash_array_async(hashes)).ok()
    }

    async fn get_hash_array_async(&self, hashes: &[String]) -> Result<Vec<u8>, Error> {
        let req = Request::builder()
            .method(Method::GET)
            .uri(self.uri("/Data/Hash_Array.json"))
            .header("X-Get-Hash-Array", hashes.join(","))
            .body(Body::empty())?;
        let resp = tokio::time::timeout(HTTP_TIMEOUT, self.client.request(req))
            .await
            .map_err(|_| format_err!("GET /Data/Hash_Array.json timed out"))??;
        if !resp.status().is_success() {
            return Err(WireError::UnexpectedStatus(resp.status()).into());
        }
        let bytes = hyper::body::to_bytes(resp.into_body()).await?;
        Ok(bytes.to_vec())
    }
}

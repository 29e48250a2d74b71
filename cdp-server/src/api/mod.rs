pub mod meta;
pub mod query;
pub mod version;

use std::sync::Arc;

use hyper::{Body, Method, Request, Response, StatusCode};
use serde::Serialize;

use crate::stats::Stats;
use crate::worker::Workers;

/// Shared state every request handler needs (§4.7, §4.9). The datastore
/// itself is only ever touched from inside a [`Workers::submit`] closure,
/// never directly from this async layer (§5 "handlers never block on
/// per-client state").
pub struct ApiState {
    pub workers: Workers,
    pub stats: Stats,
}

/// Route one request to its handler (§6.1). Mirrors the wire protocol's flat
/// endpoint list rather than a nested router, since there are few enough
/// routes that a match is clearer than a table.
pub async fn dispatch(state: Arc<ApiState>, req: Request<Body>) -> Response<Body> {
    let method = req.method().clone();
    let (path, query_string) = split_path_query(req.uri());
    let hash_array_header = req
        .headers()
        .get("X-Get-Hash-Array")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let compressed = req
        .headers()
        .get("Content-Encoding")
        .map(|v| v == "gzip")
        .unwrap_or(false);
    let raw = match hyper::body::to_bytes(req.into_body()).await {
        Ok(bytes) => bytes,
        Err(err) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!("unable to read request body: {err}"),
            )
        }
    };
    let body = if compressed {
        match inflate(&raw) {
            Ok(data) => data,
            Err(err) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    &format!("unable to decompress body: {err}"),
                )
            }
        }
    } else {
        raw.to_vec()
    };
    state.stats.record_request(body.len());

    let outcome = match (&method, path.as_str()) {
        (&Method::GET, "/Version.json") => return json_response(&version::version_info()),
        (&Method::GET, "/Stats.json") => return json_response(&state.stats.snapshot()),
        (&Method::POST, "/Meta.json") => {
            state
                .workers
                .submit(move |store| {
                    serde_json::to_vec(&meta::handle_meta(store, &body)?).map_err(Into::into)
                })
                .await
        }
        (&Method::POST, "/Hash_Array.json") => {
            state
                .workers
                .submit(move |store| {
                    serde_json::to_vec(&meta::handle_hash_array(store, &body)?).map_err(Into::into)
                })
                .await
        }
        (&Method::POST, "/Data.json") => {
            let result = state
                .workers
                .submit(move |store| {
                    serde_json::to_vec(&meta::handle_data(store, &body)?).map_err(Into::into)
                })
                .await;
            if result.is_ok() {
                state.stats.record_file_saved();
            }
            result
        }
        (&Method::POST, "/Data_Array.json") => {
            state
                .workers
                .submit(move |store| {
                    serde_json::to_vec(&meta::handle_data_array(store, &body)?).map_err(Into::into)
                })
                .await
        }
        (&Method::GET, "/File/List.json") => {
            state
                .workers
                .submit(move |store| {
                    serde_json::to_vec(&query::handle_file_list(store, &query_string)?)
                        .map_err(Into::into)
                })
                .await
        }
        (&Method::GET, "/Data/Hash_Array.json") => {
            let header_value = hash_array_header.unwrap_or_default();
            let result = state
                .workers
                .submit(move |store| query::handle_data_hash_array(store, &header_value))
                .await;
            return match result {
                Ok(bytes) => Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", "application/octet-stream")
                    .body(Body::from(bytes))
                    .unwrap(),
                Err(err) => {
                    log::warn!("request failed: {err:#}");
                    error_response(StatusCode::BAD_REQUEST, &format!("{err:#}"))
                }
            };
        }
        (&Method::GET, p) if p.starts_with("/Data/") && p.ends_with(".json") => {
            let hex_hash = p["/Data/".len()..p.len() - ".json".len()].to_string();
            state
                .workers
                .submit(move |store| {
                    serde_json::to_vec(&query::handle_data_get(store, &hex_hash)?)
                        .map_err(Into::into)
                })
                .await
        }
        _ => return error_response(StatusCode::NOT_FOUND, "no such endpoint"),
    };

    match outcome {
        Ok(bytes) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/json; charset=utf-8")
            .body(Body::from(bytes))
            .unwrap(),
        Err(err) => {
            log::warn!("request failed: {err:#}");
            error_response(StatusCode::BAD_REQUEST, &format!("{err:#}"))
        }
    }
}

fn json_response<T: Serialize>(value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(bytes) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/json; charset=utf-8")
            .body(Body::from(bytes))
            .unwrap(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &format!("{err}")),
    }
}

fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    #[derive(Serialize)]
    struct ErrorBody<'a> {
        error: &'a str,
    }
    let body = serde_json::to_vec(&ErrorBody { error: message }).unwrap_or_default();
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json; charset=utf-8")
        .body(Body::from(body))
        .unwrap()
}

fn split_path_query(uri: &hyper::Uri) -> (String, String) {
    let path = uri.path().to_string();
    let query = uri.query().unwrap_or("").to_string();
    (path, query)
}

fn inflate(data: &[u8]) -> Result<Vec<u8>, anyhow::Error> {
    use std::io::Read;
    let mut decoder = flate2::read::DeflateDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_path_query_separates_query_string() {
        let uri: hyper::Uri = "/File/List.json?hostname=host1&latest=true".parse().unwrap();
        let (path, query) = split_path_query(&uri);
        assert_eq!(path, "/File/List.json");
        assert_eq!(query, "hostname=host1&latest=true");
    }

    #[test]
    fn split_path_query_with_no_query_string() {
        let uri: hyper::Uri = "/Version.json".parse().unwrap();
        let (path, query) = split_path_query(&uri);
        assert_eq!(path, "/Version.json");
        assert_eq!(query, "");
    }

    #[test]
    fn inflate_roundtrips_deflate_compressed_body() {
        use flate2::write::DeflateEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"hello backup").unwrap();
        let compressed = encoder.finish().unwrap();

        let decompressed = inflate(&compressed).unwrap();
        assert_eq!(decompressed, b"hello backup");
    }

    #[test]
    fn error_response_body_carries_the_message() {
        let resp = error_response(StatusCode::BAD_REQUEST, "bad request");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}

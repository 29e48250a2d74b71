use anyhow::Error;
use serde::{Deserialize, Serialize};

/// Parsed `/File/List.json` query parameters (§4.9, §6.1).
///
/// `path_regex`, `exact_date`, `after_date` and `before_date` arrive on the
/// wire base64-encoded so that arbitrary regex/date text survives a URL
/// query string unmangled.
#[derive(Clone, Debug, Default)]
pub struct FileListQuery {
    pub hostname: Option<String>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub path_regex: Option<String>,
    pub exact_date: Option<String>,
    pub after_date: Option<String>,
    pub before_date: Option<String>,
    pub latest_only: bool,
}

impl FileListQuery {
    /// Parse from the raw query string of a `/File/List.json` GET request.
    pub fn from_query_string(query: &str) -> Result<Self, Error> {
        let mut q = FileListQuery::default();
        for pair in query.split('&').filter(|s| !s.is_empty()) {
            let (key, value) = match pair.split_once('=') {
                Some(kv) => kv,
                None => continue,
            };
            let value = percent_decode(value);
            match key {
                "hostname" => q.hostname = Some(value),
                "uid" => q.uid = value.parse().ok(),
                "gid" => q.gid = value.parse().ok(),
                "owner" => q.owner = Some(value),
                "group" => q.group = Some(value),
                "filename" => q.path_regex = Some(base64_decode_text(&value)?),
                "date" => q.exact_date = Some(base64_decode_text(&value)?),
                "afterdate" => q.after_date = Some(base64_decode_text(&value)?),
                "beforedate" => q.before_date = Some(base64_decode_text(&value)?),
                "latest" => q.latest_only = value == "true" || value == "1",
                _ => {}
            }
        }
        Ok(q)
    }
}

fn base64_decode_text(value: &str) -> Result<String, Error> {
    let raw = base64::decode(value)?;
    Ok(String::from_utf8(raw)?)
}

/// Minimal percent-decoder for query-string values; the set of characters
/// that actually appear (base64, digits, dots) never needs more than `%XX`
/// unescaping.
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        if bytes[i] == b'+' {
            out.push(b' ');
        } else {
            out.push(bytes[i]);
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[derive(Serialize, Deserialize)]
pub struct VersionInfo {
    pub name: String,
    pub date: String,
    pub version: String,
    pub revision: String,
    pub licence: String,
    pub authors: Vec<String>,
    pub librairies: Vec<LibraryVersion>,
}

#[derive(Serialize, Deserialize)]
pub struct LibraryVersion {
    pub lib: String,
    pub version: String,
}

#[derive(Serialize, Deserialize, Default)]
pub struct StatsInfo {
    pub requests: u64,
    pub bytes: u64,
    pub files: u64,
}

#[derive(Serialize, Deserialize)]
pub struct HashListRequest {
    pub hash_list: Vec<String>,
}

#[derive(Serialize, Deserialize)]
pub struct HashListResponse {
    pub hash_list: Vec<String>,
}

#[derive(Serialize, Deserialize)]
pub struct SuccessStatus {
    pub code: u32,
    pub message: String,
}

#[derive(Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: SuccessStatus,
}

impl SuccessResponse {
    pub fn ok() -> Self {
        Self {
            success: SuccessStatus {
                code: 200,
                message: "ok".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_query_string_parses_plain_fields() {
        let q = FileListQuery::from_query_string("hostname=host1&uid=1000&latest=true").unwrap();
        assert_eq!(q.hostname, Some("host1".to_string()));
        assert_eq!(q.uid, Some(1000));
        assert!(q.latest_only);
    }

    #[test]
    fn from_query_string_decodes_base64_filename() {
        let encoded = base64::encode(".*\\.txt$");
        let query = format!("filename={encoded}");
        let q = FileListQuery::from_query_string(&query).unwrap();
        assert_eq!(q.path_regex, Some(".*\\.txt$".to_string()));
    }

    #[test]
    fn from_query_string_rejects_invalid_base64() {
        assert!(FileListQuery::from_query_string("filename=not-valid-base64!!!").is_err());
    }

    #[test]
    fn from_query_string_ignores_unknown_keys_and_empty_pairs() {
        let q = FileListQuery::from_query_string("&bogus=1&hostname=host1&").unwrap();
        assert_eq!(q.hostname, Some("host1".to_string()));
    }

    #[test]
    fn percent_decode_unescapes_percent_and_plus() {
        assert_eq!(percent_decode("a%20b+c"), "a b c");
        assert_eq!(percent_decode("no-escapes"), "no-escapes");
    }
}

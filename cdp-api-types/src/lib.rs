//! Wire and on-disk types shared by `cdp-client`, `cdp-server` and
//! `cdp-restore`.

pub mod block;
pub mod metadata;
pub mod query;

pub use block::{Block, BlockHash, CompressionTag, WireBlock};
pub use metadata::{CompositeKey, FileType, Metadata, WireMetadata};
pub use query::{
    FileListQuery, HashListRequest, HashListResponse, LibraryVersion, SuccessResponse,
    SuccessStatus, StatsInfo, VersionInfo,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_hash_hex_base64_roundtrip() {
        let hash = BlockHash::from_bytes(b"hello world");
        let hex = hash.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(BlockHash::from_hex(&hex).unwrap(), hash);

        let b64 = hash.to_base64();
        assert_eq!(BlockHash::from_base64(&b64).unwrap(), hash);
    }

    #[test]
    fn metadata_wire_roundtrip() {
        let meta = Metadata {
            file_type: FileType::Regular,
            inode: 42,
            mode: 0o644,
            uid: 1000,
            gid: 1000,
            owner: "alice".to_string(),
            group: "alice".to_string(),
            atime: 1,
            ctime: 2,
            mtime: 3,
            size: 100,
            path: "/tmp/x".to_string(),
            link_target: String::new(),
            block_list: vec![BlockHash::from_bytes(b"abc")],
            hostname: "host1".to_string(),
            data_already_sent: false,
        };
        let wire = WireMetadata::from_metadata(&meta);
        let json = serde_json::to_string(&wire).unwrap();
        let parsed: WireMetadata = serde_json::from_str(&json).unwrap();
        let back = parsed.into_metadata().unwrap();
        assert_eq!(back.path, meta.path);
        assert_eq!(back.block_list, meta.block_list);
    }

    #[test]
    fn metadata_log_line_roundtrip() {
        let meta = Metadata {
            file_type: FileType::Regular,
            inode: 7,
            mode: 0o600,
            uid: 0,
            gid: 0,
            owner: "root".to_string(),
            group: "root".to_string(),
            atime: 10,
            ctime: 11,
            mtime: 12,
            size: 5,
            path: "/etc/hostname".to_string(),
            link_target: String::new(),
            block_list: vec![BlockHash::from_bytes(b"x")],
            hostname: "host1".to_string(),
            data_already_sent: true,
        };
        let wire = WireMetadata::from_metadata(&meta);
        let line = wire.to_log_line();
        let parsed = WireMetadata::from_log_line(&line).unwrap();
        assert_eq!(parsed.name, meta.path);
        assert_eq!(parsed.hash_list, wire.hash_list);
    }

    #[test]
    fn file_list_query_decodes_base64_fields() {
        let filename = base64::encode("/tmp/.*");
        let query = format!("hostname=host1&filename={filename}&latest=true");
        let parsed = FileListQuery::from_query_string(&query).unwrap();
        assert_eq!(parsed.hostname.as_deref(), Some("host1"));
        assert_eq!(parsed.path_regex.as_deref(), Some("/tmp/.*"));
        assert!(parsed.latest_only);
    }
}

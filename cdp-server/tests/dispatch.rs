use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use cdp_api_types::{BlockHash, FileType, Metadata, WireMetadata};
use cdp_client::{HttpClient, PostOutcome};
use cdp_datastore::ChunkStore;
use cdp_server::api::ApiState;
use cdp_server::stats::Stats;
use cdp_server::worker::Workers;

static COUNTER: AtomicU32 = AtomicU32::new(0);

fn scratch_dir() -> std::path::PathBuf {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!("cdp-dispatch-test-{}-{n}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Bind a real listener, spawn the server on its own thread and runtime (the
/// same way `cdp-server`'s own `main.rs` does it), and return a client
/// already pointed at the bound port. Mirrors `pbs-client`-style
/// end-to-end tests that stand up the server in-process rather than mocking
/// the wire protocol.
fn spawn_server() -> HttpClient {
    let store = ChunkStore::open(scratch_dir(), 1).unwrap();
    let workers = Workers::spawn(Arc::new(store), 1);
    let state = Arc::new(ApiState {
        workers,
        stats: Stats::default(),
    });

    let (listener, addr) = cdp_server::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();

    std::thread::Builder::new()
        .name("test-server".into())
        .spawn(move || {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .unwrap();
            let _ = runtime.block_on(cdp_server::serve(state, listener));
        })
        .unwrap();

    HttpClient::new("127.0.0.1", addr.port(), false).unwrap()
}

fn sample_metadata(path: &str, block_list: Vec<BlockHash>) -> WireMetadata {
    WireMetadata::from_metadata(&Metadata {
        file_type: FileType::Regular,
        inode: 42,
        mode: 0o644,
        uid: 1000,
        gid: 1000,
        owner: "alice".to_string(),
        group: "alice".to_string(),
        atime: 100,
        ctime: 100,
        mtime: 100,
        size: 5,
        path: path.to_string(),
        link_target: String::new(),
        block_list,
        hostname: "host1".to_string(),
        data_already_sent: false,
    })
}

#[test]
fn version_endpoint_reports_server_identity() {
    let client = spawn_server();
    let info = client.get_version().expect("server should answer /Version.json");
    assert_eq!(info.name, "cdp-server");
}

#[test]
fn full_metadata_then_block_then_restore_round_trip() {
    use cdp_api_types::Block;

    let client = spawn_server();

    let block = Block::new_uncompressed(b"hello".to_vec());
    let wire_meta = sample_metadata("/etc/motd", vec![block.hash]);

    let needed = match client.post_metadata(&wire_meta) {
        PostOutcome::Accepted(resp) => resp,
        PostOutcome::Failed => panic!("metadata post should succeed against a fresh store"),
    };
    assert_eq!(needed.hash_list, vec![block.hash.to_base64()]);

    let wire_block = cdp_api_types::WireBlock::from_block(&block);
    match client.post_block(&wire_block) {
        PostOutcome::Accepted(_) => {}
        PostOutcome::Failed => panic!("block post should succeed"),
    }

    let still_needed = match client.post_hash_array(&[block.hash.to_base64()]) {
        PostOutcome::Accepted(resp) => resp,
        PostOutcome::Failed => panic!("hash_array post should succeed"),
    };
    assert!(
        still_needed.hash_list.is_empty(),
        "server already has this block and should no longer ask for it"
    );

    let fetched = client
        .get_block(&block.hash.to_hex())
        .expect("the block just stored should be fetchable");
    assert_eq!(base64::decode(&fetched.data).unwrap(), b"hello");

    let listing: cdp_server::api::query::FileListResponse = client
        .get_file_list("hostname=host1")
        .expect("file list should return the entry just saved");
    assert_eq!(listing.files.len(), 1);
    assert_eq!(listing.files[0].name, "/etc/motd");
}

#[test]
fn bulk_hash_array_returns_concatenated_blocks_in_order() {
    use cdp_api_types::Block;

    let client = spawn_server();

    let a = Block::new_uncompressed(b"foo-".to_vec());
    let b = Block::new_uncompressed(b"bar".to_vec());
    for block in [&a, &b] {
        match client.post_block(&cdp_api_types::WireBlock::from_block(block)) {
            PostOutcome::Accepted(_) => {}
            PostOutcome::Failed => panic!("block post should succeed"),
        }
    }

    let hashes = vec![a.hash.to_base64(), b.hash.to_base64()];
    let bytes = client
        .get_hash_array(&hashes)
        .expect("bulk fetch of two freshly stored blocks should succeed");
    assert_eq!(bytes, b"foo-bar");

    let reversed = vec![b.hash.to_base64(), a.hash.to_base64()];
    let bytes = client
        .get_hash_array(&reversed)
        .expect("bulk fetch should honor the requested order");
    assert_eq!(bytes, b"barfoo-");
}

#[test]
fn bulk_hash_array_fails_on_an_unknown_hash() {
    let client = spawn_server();
    let missing = BlockHash::from_bytes(b"nobody ever stored this").to_base64();
    assert!(client.get_hash_array(&[missing]).is_none());
}

#[test]
fn unknown_endpoint_returns_not_found() {
    let client = spawn_server();
    let resp: Option<serde_json::Value> = client.get_json("/NoSuchEndpoint.json");
    assert!(resp.is_none());
}

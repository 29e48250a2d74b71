use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Error};
use cdp_buildcfg::CONFIGDIR;
use cdp_config::{AllConfig, Config, FileBackendConfig, ServerConfig};
use cdp_datastore::ChunkStore;

use cdp_server::api::ApiState;
use cdp_server::stats::Stats;
use cdp_server::worker::Workers;
use cdp_server::{bind, serve, DATASTORE_WORKER_COUNT};

fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| format!("{CONFIGDIR}/server.conf"));
    let debug_mode = Config::load(&config_path)
        .map(|cfg| AllConfig::from_config(&cfg).debug_mode)
        .unwrap_or(false);
    init_logging(debug_mode);

    if let Err(err) = run(&config_path) {
        log::error!("cdp-server failed: {err:#}");
        std::process::exit(1);
    }
}

/// Installs syslog (falling back to stderr) at Info, or Debug everywhere
/// when `debug-mode=true` is set in `[All]`.
fn init_logging(debug_mode: bool) {
    let (level, filter) = if debug_mode {
        (log::LevelFilter::Debug, "debug")
    } else {
        (log::LevelFilter::Info, "info")
    };
    if syslog::init(syslog::Facility::LOG_DAEMON, level, Some("cdp-server")).is_err() {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();
    }
}

fn run(config_path: &str) -> Result<(), Error> {
    let config = Config::load(config_path)
        .with_context(|| format!("unable to load config {config_path:?}"))?;
    let server_config = ServerConfig::from_config(&config);
    let backend_config = FileBackendConfig::from_config(&config);

    let store = ChunkStore::open(backend_config.file_directory.as_str(), backend_config.dir_level)
        .with_context(|| format!("unable to open datastore at {}", backend_config.file_directory))?;
    let workers = Workers::spawn(Arc::new(store), DATASTORE_WORKER_COUNT);
    let state = Arc::new(ApiState {
        workers,
        stats: Stats::default(),
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], server_config.server_port));
    let (listener, _bound_addr) = bind(addr)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(state, listener))
}

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Error};
use cdp_buildcfg::CONFIGDIR;
use cdp_client::{
    Carver, EventSourceStop, HttpClient, LocalCache, MetadataExtractor, NotifyEventSource,
    Reconnector, Sender, SenderConfig,
};
use cdp_config::{AllConfig, ClientConfig, Config};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn request_shutdown(_signum: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| format!("{CONFIGDIR}/client.conf"));
    let debug_mode = Config::load(&config_path)
        .map(|cfg| AllConfig::from_config(&cfg).debug_mode)
        .unwrap_or(false);
    let filter = if debug_mode { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    if let Err(err) = run(&config_path) {
        log::error!("cdp-backup-client failed: {err:#}");
        std::process::exit(1);
    }
}

fn run(config_path: &str) -> Result<(), Error> {
    let config = Config::load(config_path)
        .with_context(|| format!("unable to load config {config_path:?}"))?;
    let client_config = ClientConfig::from_config(&config);

    if client_config.directory_list.is_empty() {
        bail!("no directories configured to save (Client.directory_list)");
    }

    install_signal_handlers()?;

    let hostname = hostname()?;
    let cache_path = PathBuf::from(&client_config.cache_directory).join(&client_config.cache_db_name);
    std::fs::create_dir_all(&client_config.cache_directory)
        .with_context(|| format!("unable to create cache directory {}", client_config.cache_directory))?;

    let cache = Arc::new(LocalCache::open(&cache_path)?);
    let http = Arc::new(HttpClient::new(
        &client_config.server_ip,
        client_config.server_port,
        true,
    )?);
    let extractor = MetadataExtractor::new(hostname, &client_config.exclude_list);

    let (save_tx, save_rx) = crossbeam_channel::unbounded();
    let (dir_tx, dir_rx) = crossbeam_channel::unbounded();

    let roots: Vec<PathBuf> = client_config
        .directory_list
        .iter()
        .map(PathBuf::from)
        .collect();

    let sender = Sender::new(
        extractor,
        Arc::clone(&cache),
        Arc::clone(&http),
        SenderConfig {
            adaptive: client_config.adaptive,
            fixed_blocksize: client_config.blocksize,
            default_buffersize: client_config.buffersize,
        },
        dir_tx.clone(),
    );

    let saver_handle = {
        let save_rx = save_rx.clone();
        std::thread::Builder::new()
            .name("saver".into())
            .spawn(move || {
                for event in save_rx.iter() {
                    if let Err(err) = sender.handle_event(&event) {
                        log::warn!("error saving {:?}: {err:#}", event.path);
                    }
                }
            })?
    };

    let carver_handle = if client_config.no_scan {
        None
    } else {
        let stop = Arc::new(AtomicBool::new(false));
        let carver = Carver::new(roots.clone(), save_tx.clone(), dir_rx, Arc::clone(&stop));
        let handle = std::thread::Builder::new()
            .name("carver".into())
            .spawn(move || carver.run())?;
        Some((handle, stop))
    };

    let (event_handle, event_stop): (_, Option<EventSourceStop>) = {
        let save_tx = save_tx.clone();
        match NotifyEventSource::new(&roots) {
            Ok(source) => {
                let stop = source.stop_handle();
                let handle = std::thread::Builder::new()
                    .name("event-source".into())
                    .spawn(move || cdp_client::event_source::run(source, save_tx))?;
                (handle, Some(stop))
            }
            Err(err) => {
                log::error!("unable to start filesystem watcher: {err:#}, shutting down");
                SHUTDOWN.store(true, Ordering::SeqCst);
                let handle = std::thread::Builder::new()
                    .name("event-source".into())
                    .spawn(|| {})?;
                (handle, None)
            }
        }
    };

    let reconnector_handle = {
        let stop = Arc::new(AtomicBool::new(false));
        let reconnector = Reconnector::new(
            Arc::clone(&http),
            Arc::clone(&cache),
            Duration::from_secs(client_config.reconnect_interval),
            Arc::clone(&stop),
        );
        let handle = std::thread::Builder::new()
            .name("reconnector".into())
            .spawn(move || reconnector.run())?;
        (handle, stop)
    };

    while !SHUTDOWN.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(500));
    }

    log::info!("shutdown requested, stopping reconnector, carver and event source");
    reconnector_handle.1.store(true, Ordering::SeqCst);
    let _ = reconnector_handle.0.join();
    if let Some((handle, stop)) = carver_handle {
        stop.store(true, Ordering::Relaxed);
        let _ = handle.join();
    }
    if let Some(stop) = &event_stop {
        stop.stop();
    }
    let _ = event_handle.join();
    drop(save_tx);
    let _ = saver_handle.join();

    Ok(())
}

fn install_signal_handlers() -> Result<(), Error> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
    let action = SigAction::new(
        SigHandler::Handler(request_shutdown),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGINT, &action)?;
        sigaction(Signal::SIGTERM, &action)?;
    }
    Ok(())
}

fn hostname() -> Result<String, Error> {
    let raw = nix::unistd::gethostname().context("unable to read hostname")?;
    Ok(raw.to_string_lossy().into_owned())
}

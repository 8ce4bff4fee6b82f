use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{bail, Context as _};
use clap::Parser;
use log::{error, info, warn};
use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};

use lorafwd::config;
use lorafwd::constants::PULL_TIMEOUT_MS;
use lorafwd::ghost::{PacketSource, UdpGhost};
use lorafwd::hal::sim::SimConcentrator;
use lorafwd::hal::Concentrator;
use lorafwd::init_logger;
use lorafwd::state::{Context, Shutdown};
use lorafwd::transport::ServerEndpoint;
use lorafwd::worker::{downstream, gps_sync, stats, upstream, xtal};
use lorafwd::{FwdError, Gps, TtyGps};

#[derive(Parser)]
#[command(name = "lorafwd")]
#[command(about = "LoRa gateway packet forwarder speaking the Semtech UDP protocol")]
#[command(version)]
struct Cli {
    /// Directory holding global_conf.json, local_conf.json and
    /// debug_conf.json
    #[arg(short, long, default_value = ".")]
    config_dir: PathBuf,
}

fn spawn_worker<F>(
    name: &str,
    shutdown: Shutdown,
    body: F,
) -> anyhow::Result<(String, JoinHandle<Result<(), FwdError>>)>
where
    F: FnOnce() -> Result<(), FwdError> + Send + 'static,
{
    let thread_name = name.to_string();
    let log_name = thread_name.clone();
    let handle = std::thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            let result = body();
            if let Err(e) = &result {
                error!("[{log_name}] fatal: {e}");
                shutdown.request_exit();
            }
            result
        })
        .with_context(|| format!("impossible to create {name} thread"))?;
    Ok((thread_name, handle))
}

fn main() -> anyhow::Result<()> {
    init_logger();
    let cli = Cli::parse();

    info!(
        "*** LoRa packet forwarder, version {} ***",
        env!("CARGO_PKG_VERSION")
    );
    if cfg!(target_endian = "little") {
        info!("Little endian host");
    } else {
        info!("Big endian host");
    }

    let config = config::load(&cli.config_dir).context("loading configuration")?;

    // Open the GPS as soon as possible, to give it time to lock.
    let mut gps_device: Option<Box<dyn Gps>> = None;
    let mut gps_active = false;
    if config.gps_enabled && !config.fake_gps {
        match TtyGps::open(&config.gps_tty_path) {
            Ok(gps) => {
                info!("TTY port {} open for GPS synchronization", config.gps_tty_path);
                gps_device = Some(Box::new(gps));
                gps_active = true;
            }
            Err(e) => warn!("GPS synchronization unavailable: {e}"),
        }
    }

    let concentrator: Box<dyn Concentrator> = Box::new(SimConcentrator::new());
    let ctx = Context::new(config, concentrator, gps_active);

    // Server endpoints; individual failures leave the server non-live.
    let push_timeout_half = Duration::from_micros(ctx.config.push_timeout_ms * 500);
    let pull_timeout = Duration::from_millis(PULL_TIMEOUT_MS);
    let servers: Vec<Arc<ServerEndpoint>> = ctx
        .config
        .servers
        .iter()
        .enumerate()
        .map(|(i, conf)| Arc::new(ServerEndpoint::connect(i, conf, push_timeout_half, pull_timeout)))
        .collect();

    if ctx.config.radiostream_enabled {
        info!("[main] starting the concentrator");
        ctx.concentrator
            .lock()
            .unwrap()
            .start()
            .context("failed to start the concentrator")?;
    } else {
        warn!("Radio is disabled, radio packets cannot be sent or received");
    }

    let ghost: Option<Box<dyn PacketSource>> = if ctx.config.ghoststream_enabled {
        match UdpGhost::bind(&ctx.config.ghost_address, ctx.config.ghost_port) {
            Ok(ghost) => Some(Box::new(ghost)),
            Err(e) => {
                warn!("Ghost listener could not be started: {e}");
                None
            }
        }
    } else {
        None
    };
    if ctx.config.monitor_enabled {
        warn!("Monitor is enabled but no monitor backend is wired in");
    }
    if !ctx.config.radiostream_enabled
        && !ctx.config.ghoststream_enabled
        && !ctx.config.statusstream_enabled
        && !ctx.config.monitor_enabled
    {
        warn!("[main] all streams are disabled, gateway may be completely silent");
    }

    signal_hook::flag::register(SIGINT, ctx.shutdown.exit_flag())
        .context("registering SIGINT handler")?;
    signal_hook::flag::register(SIGTERM, ctx.shutdown.exit_flag())
        .context("registering SIGTERM handler")?;
    signal_hook::flag::register(SIGQUIT, ctx.shutdown.quit_flag())
        .context("registering SIGQUIT handler")?;

    let mut workers = Vec::new();

    if ctx.config.upstream_enabled {
        let up_ctx = ctx.clone();
        let up_servers = servers.clone();
        workers.push(spawn_worker("up", ctx.shutdown.clone(), move || {
            upstream::upstream_loop(up_ctx, up_servers, ghost)
        })?);
    }
    if ctx.config.downstream_enabled {
        for server in servers.iter().filter(|s| s.is_live()) {
            let down_ctx = ctx.clone();
            let down_server = server.clone();
            workers.push(spawn_worker(
                &format!("down-{}", server.index),
                ctx.shutdown.clone(),
                move || downstream::downstream_loop(down_ctx, down_server),
            )?);
        }
    }
    if let Some(gps) = gps_device.take() {
        // The GPS loop blocks on TTY reads; it is detached rather than
        // joined and dies with the process.
        let gps_ctx = ctx.clone();
        std::thread::Builder::new()
            .name("gps".into())
            .spawn(move || gps_sync::gps_loop(gps_ctx, gps))
            .context("impossible to create gps thread")?;

        let xtal_ctx = ctx.clone();
        workers.push(spawn_worker("xtal", ctx.shutdown.clone(), move || {
            xtal::validator_loop(xtal_ctx);
            Ok(())
        })?);
    }

    // Statistics collection runs on the main thread.
    let stats_result = stats::stats_loop(ctx.clone());
    let mut failed = stats_result.is_err();
    if let Err(e) = &stats_result {
        error!("[main] fatal: {e}");
        ctx.shutdown.request_exit();
    }

    for (name, handle) in workers {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(_)) => failed = true, // already logged by the wrapper
            Err(_) => {
                error!("[main] thread {name} panicked");
                failed = true;
            }
        }
    }

    // On a clean exit (not a prompt quit), release the hardware.
    if ctx.shutdown.exit_requested() && !ctx.shutdown.quit_requested() && ctx.config.radiostream_enabled {
        match ctx.concentrator.lock().unwrap().stop() {
            Ok(()) => info!("concentrator stopped successfully"),
            Err(e) => warn!("failed to stop concentrator: {e}"),
        }
    }

    info!("Exiting packet forwarder");
    if failed {
        bail!("packet forwarder terminated on a fatal error");
    }
    Ok(())
}

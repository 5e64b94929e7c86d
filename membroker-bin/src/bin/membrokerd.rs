//! The broker daemon. Binds the control and diagnostic sockets, preloads
//! the owned page pool, and runs the single-threaded event loop until a
//! shutdown signal arrives.
//!
//! Grounded on the original `main.c`'s option set (`--memsize`/`-m`,
//! `--all-except`/`-x`, `GLIBC_POOL_SIZE` fallback) and its
//! `sd_listen_fds`-style socket activation, less the signal-unsafe
//! `signal(2)` handlers it installed for `SIGSEGV`/`SIGBUS` (a Rust port
//! has no use for "print and exit" handlers around memory-safety bugs it
//! cannot have).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use membroker::engine::Broker;
use membroker::transport::{inherited_listen_fd, unlink_sockets, Server};
use membroker_proto::{all_except_pages, control_socket_path, debug_socket_path, page_size};
use tracing::{info, warn};

/// `AMOUNT` is a positive integer followed by a unit: `p` (pages), `M`
/// (mebibytes), or `G` (gibibytes).
#[derive(Parser, Debug)]
#[command(name = "membrokerd", about = "Per-host memory-page broker daemon")]
struct Args {
    /// Preload the owned pool with this many pages.
    #[arg(short = 'm', long, value_name = "AMOUNT", conflicts_with = "all_except")]
    memsize: Option<String>,

    /// Preload the owned pool with the kernel's MemTotal minus this amount.
    #[arg(short = 'x', long, value_name = "AMOUNT", conflicts_with = "memsize")]
    all_except: Option<String>,

    /// Raise the default log level from info to debug.
    #[arg(short, long)]
    verbose: bool,
}

fn kernel_mem_total_kb() -> std::io::Result<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo")?;
    meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))
        .and_then(|rest| rest.trim().strip_suffix("kB"))
        .and_then(|n| n.trim().parse().ok())
        .ok_or_else(|| std::io::Error::other("MemTotal not found in /proc/meminfo"))
}

/// Everything the daemon needs to start, resolved once from CLI flags and
/// the environment rather than read ad hoc wherever it's needed.
struct Config {
    control_path: PathBuf,
    debug_path: Option<PathBuf>,
    initial_pages: i32,
}

/// Resolves the daemon's initial page pool: an explicit `--memsize`/
/// `--all-except` flag wins, falling back to `GLIBC_POOL_SIZE` bytes, and
/// finally to an empty pool (a client must donate before anything can be
/// granted).
fn resolve_initial_pages(args: &Args) -> Result<i32, String> {
    let page_bytes = page_size();

    if let Some(amount) = &args.memsize {
        return membroker_proto::parse_amount(amount, page_bytes).map_err(|e| e.to_string());
    }
    if let Some(amount) = &args.all_except {
        let except = membroker_proto::parse_amount(amount, page_bytes).map_err(|e| e.to_string())?;
        let mem_total_kb = kernel_mem_total_kb().map_err(|e| e.to_string())?;
        return Ok(all_except_pages(mem_total_kb, except, page_bytes));
    }
    if let Ok(env) = std::env::var("GLIBC_POOL_SIZE") {
        let bytes: i64 = env.parse().map_err(|_| format!("GLIBC_POOL_SIZE '{env}' is not a number"))?;
        return Ok((bytes / page_bytes.max(1)) as i32);
    }
    Ok(0)
}

fn resolve_config(args: &Args) -> Result<Config, String> {
    Ok(Config {
        control_path: control_socket_path(),
        debug_path: debug_socket_path(),
        initial_pages: resolve_initial_pages(args)?,
    })
}

fn install_signal_handlers(shutdown: membroker::transport::ShutdownHandle) {
    let flag = Arc::new(AtomicBool::new(false));
    for sig in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        if let Err(e) = signal_hook::flag::register(sig, Arc::clone(&flag)) {
            warn!(signal = sig, error = %e, "failed to install signal handler");
        }
    }
    std::thread::spawn(move || loop {
        if flag.load(Ordering::SeqCst) {
            shutdown.trigger();
            return;
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
    });
}

fn main() -> std::process::ExitCode {
    let args = Args::parse();
    membroker_bin::init_tracing(args.verbose);

    let config = match resolve_config(&args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("membrokerd: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };
    if config.initial_pages == 0 && args.memsize.is_none() && args.all_except.is_none() {
        info!("no preload size given; a client must donate pages before any grant can succeed");
    }

    let mut server = match Server::bind(inherited_listen_fd(), &config.control_path, config.debug_path.as_deref()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("membrokerd: failed to bind control socket: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };

    install_signal_handlers(server.shutdown_handle());

    let mut broker = Broker::new(config.initial_pages);
    broker.total_donations_at_startup = config.initial_pages;
    info!(pages = config.initial_pages, "membrokerd starting");

    let result = server.run(&mut broker);
    unlink_sockets(&config.control_path, config.debug_path.as_deref());

    match result {
        Ok(()) => {
            info!("membrokerd shut down cleanly");
            std::process::ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("membrokerd: event loop error: {e}");
            std::process::ExitCode::FAILURE
        }
    }
}

//! `membroker` — interact with a running `membrokerd` from the command
//! line. Grounded on the original `mbutil.c` (`query`/`request`/`reserve`,
//! the `p`/`k`/`M`/`G`/`%` amount grammar) and `mbstatus.c` (dumping the
//! diagnostic side channel).

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

use clap::{Parser, Subcommand};
use membroker_client::ClientHandle;
use membroker_proto::{debug_socket_path, page_size};

#[derive(Parser, Debug)]
#[command(name = "membroker", about = "Interact with a running membrokerd")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print available pages (server, client, and grand total) and exit.
    Query,
    /// Request AMOUNT pages, best-effort; holds whatever is granted until
    /// interrupted.
    Request { amount: String },
    /// Reserve AMOUNT pages, all-or-nothing; holds whatever is granted
    /// until interrupted.
    Reserve { amount: String },
    /// Dump the broker's diagnostic snapshot from the debug socket.
    Status,
}

fn pages_to_megabytes(pages: i32, page_bytes: i64) -> f64 {
    (i64::from(pages) * page_bytes) as f64 / (1024.0 * 1024.0)
}

/// Parses an `AMOUNT` argument. A trailing `%` is resolved against the
/// broker's current grand total (`mbutil.c`'s `percentage_of_total_pages`,
/// which briefly registers and terminates a throwaway sink to learn the
/// total); anything else goes through the shared `p`/`k`/`M`/`G` grammar.
fn parse_amount(arg: &str, page_bytes: i64) -> Result<i32, String> {
    if let Some(digits) = arg.strip_suffix('%') {
        let pct: f64 = digits.parse().map_err(|_| format!("bad percentage '{arg}'"))?;
        if !(0.0..=100.0).contains(&pct) {
            return Err(format!("percentage {pct} is out of range (0,100)"));
        }
        let id = std::process::id() as i32;
        let mut probe = ClientHandle::register_sink(id).map_err(|e| e.to_string())?;
        let total = probe.query_total().map_err(|e| e.to_string())?;
        probe.terminate().map_err(|e| e.to_string())?;
        return Ok((pct * f64::from(total) / 100.0) as i32);
    }
    membroker_proto::parse_amount(arg, page_bytes).map_err(|e| e.to_string())
}

fn do_query(page_bytes: i64) -> Result<(), String> {
    let id = std::process::id() as i32;
    let mut client = ClientHandle::register_sink(id).map_err(|e| e.to_string())?;
    let total = client.query_total().map_err(|e| e.to_string())?;
    let server = client.query_server().map_err(|e| e.to_string())?;
    let held = client.balance();
    client.terminate().map_err(|e| e.to_string())?;

    println!("total   {total:9} p ({:.1} M)", pages_to_megabytes(total, page_bytes));
    println!("server  {server:9} p ({:.1} M)", pages_to_megabytes(server, page_bytes));
    println!("client  {held:9} p ({:.1} M)", pages_to_megabytes(held, page_bytes));
    Ok(())
}

/// Holds whatever was granted until the process is interrupted; the broker
/// reclaims it on disconnect (the original's "Interrupt (^C) to release
/// memory to membroker" loop).
fn hold_until_interrupted(granted: i32, requested: i32, verb: &str) -> ! {
    println!("Got {granted} of {requested} pages");
    if granted == 0 {
        eprintln!("membroker: {verb} of {requested} pages failed");
        std::process::exit(1);
    }
    println!("Interrupt (^C) to release memory to membroker.");
    loop {
        std::thread::sleep(std::time::Duration::from_secs(3600));
    }
}

fn do_request(amount: i32) -> Result<(), String> {
    let id = std::process::id() as i32;
    let mut client = ClientHandle::register_sink(id).map_err(|e| e.to_string())?;
    let granted = client.request_pages(amount).map_err(|e| e.to_string())?;
    hold_until_interrupted(granted, amount, "request");
}

fn do_reserve(amount: i32) -> Result<(), String> {
    let id = std::process::id() as i32;
    let mut client = ClientHandle::register_sink(id).map_err(|e| e.to_string())?;
    let granted = client.reserve_pages(amount).map_err(|e| e.to_string())?;
    hold_until_interrupted(granted, amount, "reserve");
}

fn do_status() -> Result<(), String> {
    let Some(path) = debug_socket_path() else {
        return Err("debug socket path collides with the control socket".to_owned());
    };
    let mut stream = UnixStream::connect(&path).map_err(|e| e.to_string())?;
    let mut buf = [0u8; 1024];
    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.to_string()),
        };
        std::io::stdout().write_all(&buf[..n]).map_err(|e| e.to_string())?;
    }
    Ok(())
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    let page_bytes = page_size();

    let result = match cli.command {
        Command::Query => do_query(page_bytes),
        Command::Request { amount } => {
            parse_amount(&amount, page_bytes).and_then(do_request)
        }
        Command::Reserve { amount } => {
            parse_amount(&amount, page_bytes).and_then(do_reserve)
        }
        Command::Status => do_status(),
    };

    match result {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("membroker: {e}");
            std::process::ExitCode::FAILURE
        }
    }
}

//! Device-side wait loop as a standalone process.
//!
//! Attaches to a control channel a host created in POSIX shared memory
//! (`ChannelMemory::Shared`), holds until the host aborts or the timeout
//! elapses, and prints the terminal status integer on stdout.
//!
//! # Usage
//!
//! ```sh
//! baton-wait /baton-4242-0a1b2c3d --timeout-ms 500
//! ```

use std::time::Duration;

use thiserror::Error;

use baton::ipc::shmem::{ShmError, ShmPath};
use baton::{AttachError, DEFAULT_POLL_INTERVAL, Timeout, WaitLoop};

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Path(#[from] ShmError),
    #[error(transparent)]
    Attach(#[from] AttachError),
}

struct Args {
    path: ShmPath,
    wait: WaitLoop,
}

fn main() {
    baton::init_tracing();
    if let Err(e) = run() {
        eprintln!("baton-wait: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    let args: Vec<String> = std::env::args().collect();
    let Args { path, wait } = parse_args(&args)?;

    let status = baton::attach(&path, wait)?;
    println!("{}", i32::from(status));
    Ok(())
}

fn parse_args(args: &[String]) -> Result<Args, CliError> {
    let mut path: Option<ShmPath> = None;
    let mut timeout = Timeout::Infinite;
    let mut poll_interval = DEFAULT_POLL_INTERVAL;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--timeout-ms" | "-t" => {
                i += 1;
                timeout = Timeout::from_millis(number(args, i, "--timeout-ms")?);
            }
            "--poll-us" | "-p" => {
                i += 1;
                poll_interval = Duration::from_micros(number(args, i, "--poll-us")?);
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            arg if arg.starts_with('-') => {
                return Err(CliError::Usage(format!("unknown argument: {arg}")));
            }
            arg => {
                if path.is_some() {
                    return Err(CliError::Usage(format!("unexpected argument: {arg}")));
                }
                path = Some(ShmPath::new(arg)?);
            }
        }
        i += 1;
    }

    let path = path.ok_or_else(|| CliError::Usage("missing control channel path".into()))?;
    Ok(Args {
        path,
        wait: WaitLoop::new(timeout).with_poll_interval(poll_interval),
    })
}

fn number(args: &[String], i: usize, flag: &str) -> Result<u64, CliError> {
    let raw = args
        .get(i)
        .ok_or_else(|| CliError::Usage(format!("missing value for {flag}")))?;
    raw.parse()
        .map_err(|e| CliError::Usage(format!("invalid value for {flag}: {e}")))
}

fn print_usage() {
    eprintln!(
        "Usage: baton-wait <shm-path> [OPTIONS]

Options:
  -t, --timeout-ms <MS>   Device-side timeout, 0 waits until aborted [default: 0]
  -p, --poll-us <US>      Sleep between polls [default: 1000]
  -h, --help              Print help"
    );
}

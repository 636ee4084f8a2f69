use std::{process::ExitCode, sync::atomic::Ordering, thread, time::Duration};

use clap::Parser;
use relay_broker::{BrokerConfig, console};
use signal_hook::{
    consts::{SIGHUP, SIGINT, SIGTERM},
    iterator::Signals,
};
use tracing::info;

/// Length-prefixed publish/subscribe message relay.
#[derive(Parser, Debug)]
#[command(name = "relayd", version)]
struct Cli {
    /// Enter interactive console mode (X quit, D diagnostics, ? help).
    #[arg(long)]
    console: bool,

    /// Listen port.
    #[arg(long, default_value_t = 8888)]
    port: u16,

    /// Frequency of checking for client disconnects, in ms.
    #[arg(long, default_value_t = 500)]
    freq: u64,

    /// 0 Trace, 1 Debug, 2 Info, 3 Warning, 5 Error.
    #[arg(long, default_value_t = 2)]
    loglevel: u8,

    /// Write logs to a rolling file under ./logs.
    #[arg(long)]
    logtofile: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _log_guard = relay_broker::logging::init(cli.loglevel, cli.logtofile);

    let cfg = BrokerConfig::new(cli.port).with_reap_freq(cli.freq);
    let mut handle = match relay_broker::spawn(cfg) {
        Ok(handle) => handle,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    // SIGINT/SIGTERM/SIGHUP all request the same cooperative stop.
    let stop = handle.stop_flag();
    {
        let stop = stop.clone();
        thread::spawn(move || {
            let mut signals =
                Signals::new([SIGINT, SIGTERM, SIGHUP]).expect("failed to install signal handler");
            if let Some(sig) = signals.forever().next() {
                info!(sig, "shutdown signal received");
                stop.store(true, Ordering::Relaxed);
            }
        });
    }

    if cli.console {
        console::run(&handle);
    } else {
        while !stop.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(50));
        }
    }

    handle.shut_down();
    ExitCode::SUCCESS
}

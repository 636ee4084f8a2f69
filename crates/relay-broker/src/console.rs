use std::{
    io::{self, BufRead},
    sync::atomic::Ordering,
};

use tracing::info;

use crate::BrokerHandle;

/// Interactive console: single-character commands from stdin, one per line.
/// Returns when the operator quits, stdin closes, or the stop flag is set
/// elsewhere (e.g. by a signal).
pub fn run(handle: &BrokerHandle) {
    let stop = handle.stop_flag();
    let stdin = io::stdin();
    let mut line = String::new();
    while !stop.load(Ordering::Relaxed) {
        line.clear();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let input = line.trim_end_matches(['\r', '\n']);
        let mut chars = input.chars();
        match (chars.next(), chars.next()) {
            // Bare <enter> is a no-op; longer input is ignored wholesale.
            (None, _) | (Some(_), Some(_)) => {}
            (Some('X'), None) => {
                info!("server shutting down");
                break;
            }
            (Some('D'), None) => handle.diagnostics(),
            (Some('?'), None) => {
                println!("CONSOLE COMMANDS:");
                println!("    D: Diagnostics");
                println!("    ?: Help");
                println!("    X: quit");
            }
            (Some(c), None) => println!("Unknown command {c}."),
        }
    }
}

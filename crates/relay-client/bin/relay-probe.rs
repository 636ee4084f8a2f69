//! Interactive exerciser for a running relay broker: logs on, optionally
//! subscribes, and floods periodic test messages on demand.
//!
//! Console commands: `d` toggle periodic sends, `s` toggle the subscription,
//! `D` status, `?` help, `X` quit.

use std::{
    env,
    io::{self, BufRead},
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use relay_client::{Client, ClientConfig, ClientEvent};
use tracing::info;
use tracing_subscriber::filter::LevelFilter;

fn main() {
    let addr: SocketAddr = get_arg(&["--addr"])
        .unwrap_or_else(|| "127.0.0.1:8888".into())
        .parse()
        .expect("--addr must be host:port");
    let client_type: u32 = get_arg(&["--clienttype"]).map_or(1, |v| v.parse().expect("--clienttype"));
    let client_id: u32 = get_arg(&["--clientid"]).map_or(100, |v| v.parse().expect("--clientid"));
    let peer_type: u32 = get_arg(&["--peertype"]).map_or(2, |v| v.parse().expect("--peertype"));
    let freq: u64 = get_arg(&["--freq"]).map_or(500, |v| v.parse().expect("--freq"));

    tracing_subscriber::fmt().with_max_level(LevelFilter::DEBUG).init();

    let client = Arc::new(Client::new(
        ClientConfig::new(addr, client_type, client_id)
            .with_name("probe")
            .with_reconnect_retry(2000),
    ));

    let stop = Arc::new(AtomicBool::new(false));
    let sending = Arc::new(AtomicBool::new(false));

    // Log everything the broker pushes at us.
    let events = client.events();
    let printer = thread::spawn(move || {
        for ev in events.iter() {
            match ev {
                ClientEvent::ConnectionChanged(up) => info!(up, "connection changed"),
                ClientEvent::StateChanged { old, new, reason } => {
                    info!(%old, %new, %reason, "socket state changed");
                }
                ClientEvent::Record(record) => {
                    info!(
                        kind = %record.msg_type,
                        msg_key = record.msg_key,
                        orig = ?(record.orig_client_type, record.orig_client_id),
                        "received"
                    );
                }
            }
        }
    });

    // Periodic traffic while toggled on.
    let sender = {
        let client = Arc::clone(&client);
        let stop = Arc::clone(&stop);
        let sending = Arc::clone(&sending);
        thread::spawn(move || {
            let mut n: u64 = 0;
            while !stop.load(Ordering::Relaxed) {
                if sending.load(Ordering::Relaxed) && client.is_logged_on() {
                    n += 1;
                    client.send_custom(format!("probe {n}").into_bytes(), 0, 0, 0);
                }
                thread::sleep(Duration::from_millis(freq));
            }
        })
    };

    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        line.clear();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let input = line.trim_end_matches(['\r', '\n']);
        let mut chars = input.chars();
        match (chars.next(), chars.next()) {
            (None, _) | (Some(_), Some(_)) => {}
            (Some('X'), None) => break,
            (Some('d'), None) => {
                let now = !sending.load(Ordering::Relaxed);
                sending.store(now, Ordering::Relaxed);
                info!(sending = now, "toggled periodic sends");
            }
            (Some('s'), None) => {
                // Toggle by trying to add first; a no-op add means we held it.
                if client.subscribe(peer_type, 0, 0) {
                    info!(peer_type, "subscribed");
                } else {
                    client.unsubscribe(peer_type, 0, 0);
                    info!(peer_type, "unsubscribed");
                }
            }
            (Some('D'), None) => {
                let (state, reason) = client.socket_state();
                info!(
                    logged_on = client.is_logged_on(),
                    %state,
                    %reason,
                    "status"
                );
            }
            (Some('?'), None) => {
                println!("CONSOLE COMMANDS:");
                println!("    d: toggle periodic sends");
                println!("    s: toggle subscription to ({peer_type}, 0, 0)");
                println!("    D: status");
                println!("    ?: Help");
                println!("    X: quit");
            }
            (Some(c), None) => println!("Unknown command {c}."),
        }
    }

    stop.store(true, Ordering::Relaxed);
    let _ = sender.join();
    drop(client);
    let _ = printer.join();
}

fn get_arg(flags: &[&str]) -> Option<String> {
    env::args()
        .enumerate()
        .find_map(|(i, arg)| flags.contains(&arg.as_str()).then_some(i))
        .and_then(|idx| env::args().nth(idx + 1))
}

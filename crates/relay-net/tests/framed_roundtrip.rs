use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    thread,
    time::{Duration, Instant},
};

use relay_net::{Driver, PollEvent};
use relay_wire::{MsgKind, Record};

fn custom(msg_key: u32, payload: &[u8]) -> Record {
    Record {
        msg_type: MsgKind::Custom,
        msg_key,
        payload: payload.to_vec(),
        ..Record::default()
    }
}

#[test]
fn framed_roundtrip() {
    let bind_addr = SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), 24731));

    let server = thread::spawn(move || {
        let mut driver = Driver::new();
        driver.listen(bind_addr).unwrap();

        let mut stream_token = None;
        let mut recv = None;
        let deadline = Instant::now() + Duration::from_secs(5);
        while recv.is_none() && Instant::now() < deadline {
            for ev in driver.poll() {
                match ev {
                    PollEvent::Accepted { token, .. } => stream_token = Some(token),
                    PollEvent::Record { token, record } => {
                        assert_eq!(Some(token), stream_token);
                        recv = Some(record);
                    }
                    _ => {}
                }
            }
            thread::sleep(Duration::from_micros(200));
        }
        let recv = recv.expect("server should have received a record");
        assert_eq!(recv.msg_key, 222);
        assert_eq!(recv.payload, b"ping");

        assert!(driver.send_record(stream_token.unwrap(), &custom(111, b"pong")));
        let deadline = Instant::now() + Duration::from_secs(1);
        while driver.has_pending_writes() && Instant::now() < deadline {
            driver.poll();
            thread::sleep(Duration::from_micros(200));
        }
    });

    let client = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        let mut driver = Driver::new();
        let token = driver.connect(bind_addr);
        assert!(driver.send_record(token, &custom(222, b"ping")));

        let mut recv = None;
        let deadline = Instant::now() + Duration::from_secs(5);
        while recv.is_none() && Instant::now() < deadline {
            for ev in driver.poll() {
                if let PollEvent::Record { record, .. } = ev {
                    recv = Some(record);
                }
            }
            thread::sleep(Duration::from_micros(200));
        }
        let recv = recv.expect("client should have received a reply");
        assert_eq!(recv.msg_key, 111);
        assert_eq!(recv.payload, b"pong");
    });

    server.join().unwrap();
    client.join().unwrap();
}

#[test]
fn heartbeats_pass_through_without_a_record() {
    let bind_addr = SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), 24732));

    let server = thread::spawn(move || {
        let mut driver = Driver::new();
        driver.listen(bind_addr).unwrap();

        let mut heartbeats = 0;
        let mut records = 0;
        let deadline = Instant::now() + Duration::from_secs(5);
        while heartbeats < 2 && Instant::now() < deadline {
            for ev in driver.poll() {
                match ev {
                    PollEvent::Heartbeat { .. } => heartbeats += 1,
                    PollEvent::Record { .. } => records += 1,
                    _ => {}
                }
            }
            thread::sleep(Duration::from_micros(200));
        }
        assert_eq!(heartbeats, 2);
        assert_eq!(records, 1, "the record between heartbeats must survive");
    });

    let client = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        let mut driver = Driver::new();
        let token = driver.connect(bind_addr);
        assert!(driver.send_heartbeat(token));
        assert!(driver.send_record(token, &custom(1, b"x")));
        assert!(driver.send_heartbeat(token));

        let deadline = Instant::now() + Duration::from_secs(1);
        while Instant::now() < deadline {
            driver.poll();
            thread::sleep(Duration::from_micros(200));
        }
    });

    server.join().unwrap();
    client.join().unwrap();
}

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    thread,
    time::{Duration, Instant},
};

use relay_net::{Driver, PollEvent};
use relay_wire::{MsgKind, Record};

/// A dial that starts before the listener exists must keep retrying and
/// eventually deliver once the listener comes up.
#[test]
fn redials_until_the_listener_appears() {
    let bind_addr = SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), 24733));

    let client = thread::spawn(move || {
        let mut driver = Driver::new().with_reconnect(Duration::from_millis(100));
        let token = driver.connect(bind_addr);

        let mut delivered = false;
        let deadline = Instant::now() + Duration::from_secs(10);
        while !delivered && Instant::now() < deadline {
            for ev in driver.poll() {
                // Send once per (apparent) connect; failed attempts recycle
                // through the redial schedule and we send again.
                if let PollEvent::Connected { .. } = ev {
                    driver.send_record(
                        token,
                        &Record {
                            msg_type: MsgKind::Custom,
                            msg_key: 7,
                            payload: b"late".to_vec(),
                            ..Record::default()
                        },
                    );
                }
            }
            delivered = driver.is_connected(token) && !driver.has_pending_writes();
            thread::sleep(Duration::from_millis(1));
        }
        // Keep the socket alive until the server thread has read the record.
        thread::sleep(Duration::from_millis(500));
        assert!(delivered, "client never established a connection");
    });

    // The listener shows up late.
    thread::sleep(Duration::from_millis(350));
    let mut driver = Driver::new();
    driver.listen(bind_addr).unwrap();

    let mut recv = None;
    let deadline = Instant::now() + Duration::from_secs(10);
    while recv.is_none() && Instant::now() < deadline {
        for ev in driver.poll() {
            if let PollEvent::Record { record, .. } = ev {
                recv = Some(record);
            }
        }
        thread::sleep(Duration::from_millis(1));
    }
    let recv = recv.expect("record should arrive after the redial");
    assert_eq!(recv.msg_key, 7);
    assert_eq!(recv.payload, b"late");

    client.join().unwrap();
}

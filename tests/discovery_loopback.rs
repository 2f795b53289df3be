//! Discovery over a loopback "group", end to end through the public API.

use std::net::{Ipv4Addr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use xplink::{BeaconPacket, ConnectionSupervisor, LinkConfig, LinkError, XPlane};

fn config(port: u16) -> LinkConfig {
    let yaml = format!(
        "discovery:\n  group: 127.0.0.1\n  port: {port}\n  timeout_secs: 0.5\nsupervisor:\n  retry_interval_secs: 0.02\n  monitor_interval_secs: 0.02\n  join_timeout_secs: 2\n"
    );
    LinkConfig::from_yaml(&yaml).unwrap()
}

fn packet(version: i32) -> Vec<u8> {
    BeaconPacket {
        major: 1,
        minor: 2,
        host_id: 1,
        version,
        role: 1,
        port: 49000,
        hostname: "simbox".to_string(),
    }
    .encode()
}

/// Announce `bytes` every 20ms until the returned sender is dropped or fired.
fn announce(port: u16, bytes: Vec<u8>) -> oneshot::Sender<()> {
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        loop {
            let _ = socket.send_to(&bytes, (Ipv4Addr::LOCALHOST, port));
            tokio::select! {
                _ = &mut stop_rx => break,
                _ = tokio::time::sleep(Duration::from_millis(20)) => {}
            }
        }
    });
    stop_tx
}

#[tokio::test]
async fn discovers_announcing_simulator() {
    let _ = tracing_subscriber::fmt::try_init();
    let port = 47821;
    let stop = announce(port, packet(121400));

    let beacon = XPlane::discover(&config(port)).await.unwrap();
    assert_eq!(beacon.ip, Ipv4Addr::LOCALHOST);
    assert_eq!(beacon.port, 49000);
    assert_eq!(beacon.hostname, "simbox");
    assert_eq!(beacon.version, 121400);
    let _ = stop.send(());
}

#[tokio::test]
async fn silence_is_ip_not_found() {
    let err = XPlane::discover(&config(47822)).await.unwrap_err();
    assert!(matches!(err, LinkError::IpNotFound { .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn supervisor_follows_simulator_lifecycle() {
    let _ = tracing_subscriber::fmt::try_init();
    let port = 47823;
    let config = config(port);
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let listener = Arc::new(xplink::BeaconListener::new(&config.discovery));
    let supervisor = ConnectionSupervisor::new(listener, &config, move |connected| sink.lock().unwrap().push(connected));

    supervisor.connect();
    let stop = announce(port, packet(121400));
    for _ in 0..200 {
        if supervisor.is_connected() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(supervisor.is_connected());
    assert_eq!(supervisor.beacon().unwrap().hostname, "simbox");

    let _ = stop.send(());
    for _ in 0..200 {
        if !supervisor.is_connected() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!supervisor.is_connected());
    assert!(supervisor.beacon().is_none());

    supervisor.disconnect().await;
    assert_eq!(*events.lock().unwrap(), vec![true, false]);
}

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use wattbench::config::SensorConfig;
use wattbench::sensor::SensorPoller;
use wattbench::types::Calibration;

/// Scripted sensor board: waits for `subscribe`, then streams the given
/// line every few milliseconds until `unsubscribe` arrives.
async fn spawn_fake_sensor(line: &'static str) -> (String, u16, Arc<AtomicBool>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let unsubscribed = Arc::new(AtomicBool::new(false));
    let seen_unsubscribe = Arc::clone(&unsubscribed);

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let mut command = String::new();
        reader.read_line(&mut command).await.unwrap();
        assert_eq!(command.trim(), "subscribe");

        // Stream until the client goes away
        let writer = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(5));
            loop {
                ticker.tick().await;
                let payload = format!("{}\n", line);
                if write_half.write_all(payload.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        loop {
            let mut command = String::new();
            if reader.read_line(&mut command).await.unwrap_or(0) == 0 {
                break;
            }
            if command.trim() == "unsubscribe" {
                seen_unsubscribe.store(true, Ordering::SeqCst);
                break;
            }
        }
        writer.abort();
    });

    (addr.ip().to_string(), addr.port(), unsubscribed)
}

fn test_config(ip: String, port: u16) -> SensorConfig {
    SensorConfig {
        ip,
        port,
        buffer_size: 1024,
        timeout_secs: 1.0,
        sampling_frequency: 200.0,
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn uncalibrated_frames_scale_counts_and_report_no_current() {
    let (ip, port, _) = spawn_fake_sensor("512,0").await;
    let sensor = SensorPoller::start(&test_config(ip, port), None)
        .await
        .unwrap();

    wait_for("first frame", || !sensor.read().channels.is_empty()).await;

    let frame = sensor.read();
    let ch1 = &frame.channels["channel1"];
    assert!((ch1.voltage - 512.0 / 1023.0 * 3.3).abs() < 1e-9);
    assert!((ch1.voltage - 1.652).abs() < 1e-3);
    assert!(ch1.current.is_none());

    let ch2 = &frame.channels["channel2"];
    assert_eq!(ch2.voltage, 0.0);
    assert!(ch2.current.is_none());
    assert!(frame.calibration.is_none());

    sensor.shutdown().await;
}

#[tokio::test]
async fn installed_calibration_is_applied_and_embedded() {
    let (ip, port, _) = spawn_fake_sensor("512,0").await;
    let sensor = SensorPoller::start(&test_config(ip, port), None)
        .await
        .unwrap();
    wait_for("first frame", || !sensor.read().channels.is_empty()).await;

    let cal = Calibration { k: 0.01, m: 0.2 };
    sensor.set_calibration(cal);
    assert_eq!(sensor.calibration(), Some(cal));

    wait_for("calibrated frame", || sensor.read().calibration.is_some()).await;

    let frame = sensor.read();
    assert_eq!(frame.calibration, Some(cal));
    let current = frame.channels["channel1"].current.unwrap();
    assert!((current - 145.2).abs() < 0.1, "current={}", current);

    sensor.shutdown().await;
}

#[tokio::test]
async fn startup_calibration_is_used_from_the_first_frame() {
    let (ip, port, _) = spawn_fake_sensor("512,0").await;
    let cal = Calibration { k: 0.01, m: 0.2 };
    let sensor = SensorPoller::start(&test_config(ip, port), Some(cal))
        .await
        .unwrap();

    wait_for("first frame", || !sensor.read().channels.is_empty()).await;
    assert_eq!(sensor.read().calibration, Some(cal));

    sensor.shutdown().await;
}

#[tokio::test]
async fn malformed_lines_are_skipped() {
    let (ip, port, _) = spawn_fake_sensor("garbage,line").await;
    let sensor = SensorPoller::start(&test_config(ip, port), None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Nothing publishable arrived, but the poller is still alive and empty
    assert!(sensor.read().channels.is_empty());

    sensor.shutdown().await;
}

#[tokio::test]
async fn shutdown_unsubscribes_and_is_idempotent() {
    let (ip, port, unsubscribed) = spawn_fake_sensor("512,0").await;
    let sensor = SensorPoller::start(&test_config(ip, port), None)
        .await
        .unwrap();
    wait_for("first frame", || !sensor.read().channels.is_empty()).await;

    sensor.shutdown().await;
    sensor.shutdown().await;

    wait_for("unsubscribe command", || unsubscribed.load(Ordering::SeqCst)).await;
}

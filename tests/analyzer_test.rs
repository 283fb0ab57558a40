use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use wattbench::analyzer::PowerAnalyzer;
use wattbench::config::AnalyzerConfig;

/// Scripted analyzer: answers every query line via the supplied closure.
async fn spawn_fake_analyzer<F>(mut reply: F) -> (String, u16)
where
    F: FnMut(&str) -> String + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                break;
            }
            let payload = format!("{}\n", reply(line.trim()));
            if write_half.write_all(payload.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    (addr.ip().to_string(), addr.port())
}

fn test_config(ip: String, port: u16, channels: Vec<u8>) -> AnalyzerConfig {
    AnalyzerConfig {
        ip,
        port,
        buffer_size: 1024,
        timeout_secs: 1.0,
        sampling_frequency: 100.0,
        channels,
    }
}

#[tokio::test]
async fn polling_publishes_parsed_channel_map() {
    let (ip, port) = spawn_fake_analyzer(|query| {
        assert_eq!(query, ":MEAS? Urms1,Urms2;:MEAS? Irms1,Irms2");
        "230.1,231.4;2.50,2.61".to_string()
    })
    .await;

    let analyzer = PowerAnalyzer::start(&test_config(ip, port, vec![1, 2]))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let map = analyzer.read();
    assert_eq!(map.len(), 2);
    assert_eq!(map["channel1"].voltage, 230.1);
    assert_eq!(map["channel1"].current, Some(2.50));
    assert_eq!(map["channel2"].voltage, 231.4);

    analyzer.shutdown().await;
}

#[tokio::test]
async fn latest_value_is_monotonic_in_cycle_index() {
    let cycle = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&cycle);
    let (ip, port) = spawn_fake_analyzer(move |_| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        format!("230.0;{}", n)
    })
    .await;

    let analyzer = PowerAnalyzer::start(&test_config(ip, port, vec![1]))
        .await
        .unwrap();

    let mut last = -1.0;
    for _ in 0..30 {
        tokio::time::sleep(Duration::from_millis(15)).await;
        if let Some(reading) = analyzer.read().get("channel1") {
            let current = reading.current.unwrap();
            assert!(
                current >= last,
                "latest went backwards: {} after {}",
                current,
                last
            );
            last = current;
        }
    }
    assert!(last > 0.0, "poller never published");

    analyzer.shutdown().await;
}

#[tokio::test]
async fn bad_cycles_are_skipped_and_polling_continues() {
    let cycle = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&cycle);
    let (ip, port) = spawn_fake_analyzer(move |_| {
        // Every other reply is garbage
        if counter.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
            "not a measurement".to_string()
        } else {
            "230.0;2.5".to_string()
        }
    })
    .await;

    let analyzer = PowerAnalyzer::start(&test_config(ip, port, vec![1]))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let map = analyzer.read();
    assert_eq!(map["channel1"].voltage, 230.0);
    assert_eq!(map["channel1"].current, Some(2.5));

    analyzer.shutdown().await;
}

#[tokio::test]
async fn read_returns_copies_not_views() {
    let (ip, port) = spawn_fake_analyzer(|_| "230.0;2.5".to_string()).await;
    let analyzer = PowerAnalyzer::start(&test_config(ip, port, vec![1]))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut copy = analyzer.read();
    copy.clear();
    // Mutating the copy never touches the live value
    assert_eq!(analyzer.read().len(), 1);

    analyzer.shutdown().await;
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    let (ip, port) = spawn_fake_analyzer(|_| "230.0;2.5".to_string()).await;
    let analyzer = PowerAnalyzer::start(&test_config(ip, port, vec![1]))
        .await
        .unwrap();

    analyzer.shutdown().await;
    analyzer.shutdown().await;
}

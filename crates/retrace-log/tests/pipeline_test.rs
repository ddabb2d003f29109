//! Log pipeline persistence tests

use std::time::Duration;

use retrace_log::{LogConfig, LogError, LogPipeline};

fn file_config(path: std::path::PathBuf) -> LogConfig {
    LogConfig { file_path: Some(path), ..LogConfig::default() }
}

fn assert_clock_prefix(line: &str) {
    let bytes = line.as_bytes();
    assert!(bytes.len() >= 11, "line too short: {line:?}");
    assert_eq!(bytes[0], b'[');
    assert_eq!(bytes[3], b':');
    assert_eq!(bytes[6], b':');
    assert_eq!(bytes[9], b']');
    assert_eq!(bytes[10], b' ');
    for i in [1, 2, 4, 5, 7, 8] {
        assert!(bytes[i].is_ascii_digit(), "bad clock in {line:?}");
    }
}

#[tokio::test]
async fn close_flushes_every_line_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("replay.log");

    let log = LogPipeline::open(file_config(path.clone())).await.unwrap();
    assert!(log.is_persisting());
    for i in 0..25 {
        log.write(format!("event {i}"));
    }
    log.close().await;

    let contents = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 25);
    for (i, line) in lines.iter().enumerate() {
        assert_clock_prefix(line);
        assert_eq!(&line[11..], format!("event {i}"));
    }
    assert!(contents.ends_with('\n'));
}

#[tokio::test]
async fn reopening_appends_instead_of_truncating() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("replay.log");

    let first = LogPipeline::open(file_config(path.clone())).await.unwrap();
    first.write("first run");
    first.close().await;

    let second = LogPipeline::open(file_config(path.clone())).await.unwrap();
    second.write("second run");
    second.close().await;

    let contents = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].ends_with("first run"));
    assert!(lines[1].ends_with("second run"));
}

#[tokio::test]
async fn creates_missing_parent_directories() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("logs").join("nested").join("replay.log");

    let log = LogPipeline::open(file_config(path.clone())).await.unwrap();
    log.write("hello");
    log.close().await;

    assert!(path.exists());
}

#[tokio::test]
async fn partial_batch_is_flushed_by_timer() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("replay.log");
    let config = LogConfig {
        batch_size: 50,
        flush_interval: Duration::from_millis(20),
        ..file_config(path.clone())
    };

    let log = LogPipeline::open(config).await.unwrap();
    log.write("lonely line");

    let mut found = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if std::fs::read_to_string(&path).unwrap().contains("lonely line") {
            found = true;
            break;
        }
    }
    assert!(found, "timer flush never wrote the partial batch");

    log.close().await;
}

#[tokio::test]
async fn open_fails_when_parent_is_a_file() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"x").unwrap();

    let result = LogPipeline::open(file_config(blocker.join("replay.log"))).await;
    assert!(matches!(result, Err(LogError::CreateDir { .. })));
}

#[tokio::test]
async fn history_survives_without_file() {
    let log = LogPipeline::open(LogConfig { capacity: 3, ..LogConfig::default() }).await.unwrap();
    assert!(!log.is_persisting());

    for i in 0..5 {
        log.write(format!("event {i}"));
    }

    let history = log.read_all();
    assert_eq!(history.lines().count(), 3);
    assert!(history.contains("event 2"));
    assert!(!history.contains("event 1"));
    log.close().await;
    log.close().await;
}

#[tokio::test]
async fn subscriber_receives_live_lines() {
    let log = LogPipeline::in_memory(10);
    let mut subscriber = log.subscribe().unwrap();

    let writer = log.clone();
    let handle = tokio::spawn(async move {
        for i in 0..3 {
            writer.write(format!("live {i}"));
        }
        writer.close().await;
    });

    let mut received = Vec::new();
    while let Some(line) = subscriber.recv().await {
        received.push(line);
    }
    handle.await.unwrap();

    assert_eq!(received.len(), 3);
    assert!(received[2].ends_with("live 2"));
}

#[tokio::test]
async fn full_persistence_queue_drops_from_disk_only() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("replay.log");
    let config = LogConfig { queue_capacity: 16, ..file_config(path.clone()) };

    let log = LogPipeline::open(config).await.unwrap();
    // No await between writes: the flush task cannot drain the queue.
    for i in 0..1000 {
        log.write(format!("event {i}"));
    }
    log.close().await;

    let history = log.lines();
    assert_eq!(history.len(), 1000);
    assert!(history[999].ends_with("event 999"));

    let contents = std::fs::read_to_string(&path).unwrap();
    let persisted: Vec<&str> = contents.lines().collect();
    assert!(!persisted.is_empty());
    assert!(persisted.len() <= 16, "{} lines reached disk", persisted.len());
    for (i, line) in persisted.iter().enumerate() {
        assert_eq!(&line[11..], format!("event {i}"));
    }
}

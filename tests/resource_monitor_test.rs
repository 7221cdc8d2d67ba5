use rsp_approx::ResourceUsageLogger;
use std::fs;
use std::time::Duration;

const HEADER: &str = "timestamp,cpu_user,cpu_system,rss,heapTotal,heapUsed,heapUsedMB,external";

fn data_rows(content: &str) -> Vec<Vec<String>> {
    content
        .lines()
        .skip(1)
        .map(|l| l.split(',').map(str::to_string).collect())
        .collect()
}

#[tokio::test]
async fn test_header_written_once_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("iteration1").join("approximation_resource_usage.csv");

    let first = ResourceUsageLogger::start(&path, Duration::from_millis(10)).unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    let written_first = first.stop().await.unwrap();

    let second = ResourceUsageLogger::start(&path, Duration::from_millis(10)).unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    let written_second = second.stop().await.unwrap();

    assert!(written_first > 0);
    assert!(written_second > 0);

    let content = fs::read_to_string(&path).unwrap();
    assert_eq!(content.lines().next(), Some(HEADER));
    assert_eq!(content.matches(HEADER).count(), 1);
    assert_eq!(
        data_rows(&content).len() as u64,
        written_first + written_second
    );
}

#[tokio::test]
async fn test_samples_are_well_formed_and_ordered() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("resource.csv");

    let monitor = ResourceUsageLogger::start(&path, Duration::from_millis(5)).unwrap();
    assert_eq!(monitor.path(), path.as_path());
    tokio::time::sleep(Duration::from_millis(50)).await;
    monitor.stop().await.unwrap();

    let rows = data_rows(&fs::read_to_string(&path).unwrap());
    assert!(rows.len() >= 2);
    let mut previous = i64::MIN;
    for row in &rows {
        assert_eq!(row.len(), 8);
        let timestamp: i64 = row[0].parse().unwrap();
        assert!(timestamp >= previous);
        previous = timestamp;
        assert!(row[1].parse::<f64>().is_ok());
        assert!(row[6].parse::<f64>().is_ok());
        assert_eq!(row[7], "0");
    }
}

#[tokio::test]
async fn test_dropping_the_monitor_stops_sampling() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("resource.csv");

    let monitor = ResourceUsageLogger::start(&path, Duration::from_millis(5)).unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    drop(monitor);
    tokio::time::sleep(Duration::from_millis(30)).await;

    let before = fs::read_to_string(&path).unwrap().lines().count();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let after = fs::read_to_string(&path).unwrap().lines().count();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_header_survives_a_run_stopped_before_sampling() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("resource.csv");

    let first = ResourceUsageLogger::start(&path, Duration::from_secs(3600)).unwrap();
    assert_eq!(fs::read_to_string(&path).unwrap(), format!("{HEADER}\n"));
    let written_first = first.stop().await.unwrap();

    let second = ResourceUsageLogger::start(&path, Duration::from_millis(10)).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let written_second = second.stop().await.unwrap();

    let content = fs::read_to_string(&path).unwrap();
    assert_eq!(content.lines().next(), Some(HEADER));
    assert_eq!(content.matches(HEADER).count(), 1);
    assert_eq!(
        data_rows(&content).len() as u64,
        written_first + written_second
    );
}

#[tokio::test]
async fn test_existing_empty_file_gets_a_header() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("resource.csv");
    fs::write(&path, "").unwrap();

    let monitor = ResourceUsageLogger::start(&path, Duration::from_millis(10)).unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    monitor.stop().await.unwrap();

    let content = fs::read_to_string(&path).unwrap();
    assert_eq!(content.lines().next(), Some(HEADER));
}

//! End-to-end behaviour of the monitoring core through the `Monitor` facade.

use std::sync::Arc;
use std::thread;

use chrono::{Duration, Utc};
use logwarden::config::Config;
use logwarden::detect::rules::{BRUTE_FORCE, GEO_ANOMALY, VOLUME_ANOMALY};
use logwarden::detect::{EventData, Finding, GeoPoint, Severity};
use logwarden::storage::export::ExportFormat;
use logwarden::storage::record::{LogInput, LogLevel, LogRecord};
use logwarden::storage::search::SearchQuery;
use logwarden::Monitor;

fn monitor() -> Monitor {
    Monitor::new(Config::default()).unwrap()
}

fn messages(logs: &[LogRecord]) -> Vec<&str> {
    logs.iter().map(|r| r.message.as_str()).collect()
}

#[test]
fn lookup_by_level_and_service() {
    let m = monitor();
    m.add_log(LogInput::new(LogLevel::Error, "x").with_service("api"));

    assert_eq!(m.get_by_level(LogLevel::Error).len(), 1);
    assert_eq!(m.get_by_service("api").len(), 1);
    assert!(m.get_by_level(LogLevel::Info).is_empty());
}

#[test]
fn hard_cap_keeps_newest_records_only() {
    let mut config = Config::default();
    config.store.max_logs = 3;
    let m = Monitor::new(config).unwrap();
    for name in ["A", "B", "C", "D"] {
        m.add_log(LogInput::new(LogLevel::Info, name).with_service(name));
    }

    let all = m.search(&SearchQuery::default().page(1, 10));
    assert_eq!(all.total, 3);
    assert_eq!(messages(&all.logs), vec!["D", "C", "B"]);
    assert!(m.get_by_service("A").is_empty());
    assert_eq!(m.stats().total_evicted, 1);
}

#[test]
fn brute_force_is_detected() {
    let m = monitor();
    let report = m.analyze("u1", &EventData::new().failed_attempts(6));
    let anomaly = report.anomaly(BRUTE_FORCE).unwrap();
    assert_eq!(anomaly.severity, Severity::High);
    assert!(anomaly.confidence >= 0.6);
    assert!(report.risk_score > 0.0);
}

#[test]
fn volume_spike_is_detected() {
    let m = monitor();
    let report = m.analyze("u1", &EventData::new().requests(100.0).avg_requests(10.0));
    assert!(report.has_rule(VOLUME_ANOMALY));
}

#[test]
fn custom_rule_is_evaluated() {
    let m = monitor();
    m.add_rule("always-flag", |_: &EventData, _| {
        Ok(Some(Finding::new("custom", Severity::Medium, 0.5, "always")))
    });
    let report = m.analyze("whoever", &EventData::new().field("anything", serde_json::json!(1)));
    assert!(report.has_rule("always-flag"));
}

#[test]
fn impossible_travel_is_detected() {
    let m = monitor();
    let a = GeoPoint::new(40.0, -3.7);
    let b = GeoPoint::new(44.5, -3.7);
    let report = m.analyze("u1", &EventData::new().moved(a, b, 600_000));
    let anomaly = report.anomaly(GEO_ANOMALY).unwrap();
    assert_eq!(anomaly.severity, Severity::High);
    assert!(!report.alerts.is_empty());
    assert_eq!(m.recent_alerts(1)[0].anomaly.entity_id, "u1");
}

#[test]
fn empty_event_scores_zero() {
    let m = monitor();
    let report = m.analyze("quiet", &EventData::new());
    assert!(report.anomalies.is_empty());
    assert_eq!(report.risk_score, 0.0);
}

#[test]
fn json_export_equals_unpaged_search() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.store.export_dir = dir.path().to_path_buf();
    let m = Monitor::new(config).unwrap();
    for i in 0..120 {
        let level = if i % 3 == 0 { LogLevel::Error } else { LogLevel::Info };
        m.add_log(LogInput::new(level, format!("event {i}")).with_service("svc"));
    }

    let filters = SearchQuery::default().level(LogLevel::Error);
    let path = m.export_to_file("errors.json", ExportFormat::Json, &filters).unwrap();
    let exported: Vec<LogRecord> =
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();

    let all = m.search(&filters.clone().page(1, 1000));
    assert_eq!(exported.len(), 40);
    assert_eq!(exported, all.logs);
}

#[test]
fn retention_sweep_clears_expired_records_everywhere() {
    let m = monitor();
    let now = Utc::now();
    m.add_log(
        LogInput::new(LogLevel::Error, "ancient")
            .with_service("api")
            .with_user("u1")
            .with_timestamp(now - Duration::days(10)),
    );
    m.add_log(LogInput::new(LogLevel::Error, "recent").with_service("api").with_timestamp(now));

    let report = m.run_retention(now).unwrap();
    assert_eq!(report.sweep.evicted, 1);
    assert_eq!(messages(&m.get_by_service("api")), vec!["recent"]);
    assert!(m.get_by_user("u1").is_empty());
    assert_eq!(m.search(&SearchQuery::default().text("ancient")).total, 0);
}

#[test]
fn search_never_serves_data_older_than_a_completed_write() {
    let m = Arc::new(monitor());
    let query = SearchQuery::default().service("web");
    assert_eq!(m.search(&query).total, 0);

    let writers: Vec<_> = (0..4)
        .map(|t| {
            let m = Arc::clone(&m);
            thread::spawn(move || {
                for i in 0..50 {
                    m.add_log(LogInput::new(LogLevel::Info, format!("{t}-{i}")).with_service("web"));
                }
            })
        })
        .collect();
    let reader = {
        let m = Arc::clone(&m);
        let query = query.clone();
        thread::spawn(move || {
            let mut last = 0;
            for _ in 0..200 {
                let total = m.search(&query).total;
                assert!(total >= last, "search went backwards: {total} < {last}");
                last = total;
            }
        })
    };

    for w in writers {
        w.join().unwrap();
    }
    reader.join().unwrap();
    assert_eq!(m.search(&query).total, 200);
}

#[test]
fn concurrent_analyze_for_one_entity_counts_every_event() {
    let m = Arc::new(monitor());
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let m = Arc::clone(&m);
            thread::spawn(move || {
                for _ in 0..25 {
                    m.analyze("shared", &EventData::new().requests(10.0));
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(m.baseline("shared").unwrap().data_points, 200);
}

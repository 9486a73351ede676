use chrono::{DateTime, Duration, TimeZone, Utc};
use tally_core::codec::{DailySales, EventCount, HourlySales};
use tally_core::{Event, Watermark};
use tally_io::{CollectSink, VecSource};
use tally_ops::{PipelineKind, PipelineOptions, Registration};

// 2025-11-13 14:00 in Seoul
fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 11, 13, 5, 0, 0).unwrap()
}

fn at_min(m: i64) -> DateTime<Utc> {
    t0() + Duration::minutes(m)
}

async fn run(kind: PipelineKind, opts: PipelineOptions, source: VecSource) -> Vec<Event> {
    let (input, output) = kind.default_topics();
    let sink = CollectSink::new();
    let mut exec = Registration::new(kind, input, output)
        .executor(&opts, source, sink.clone())
        .unwrap();
    exec.run().await.unwrap();
    sink.events()
}

fn lines(events: &[Event]) -> Vec<String> {
    let mut out: Vec<String> = events.iter().map(|e| e.value.clone()).collect();
    out.sort();
    out
}

#[tokio::test]
async fn hourly_sales_sum_is_emitted_once_after_the_hour() {
    let events = ["1500000", "1800000", "2000000"]
        .iter()
        .enumerate()
        .map(|(i, v)| Event::keyed("노트북", *v, at_min(i as i64 * 15)))
        .collect();
    let out = run(PipelineKind::HourlySales, PipelineOptions::default(), VecSource::bounded(events)).await;
    assert_eq!(out.len(), 1);
    assert_eq!(
        out[0].value,
        "상품:노트북, 시간대:2025-11-13 14:00~2025-11-13 15:00, 총매출:5300000"
    );
    let decoded = HourlySales::decode(&out[0].value).unwrap();
    assert_eq!(decoded.total_sales, 5_300_000);
}

#[tokio::test]
async fn nothing_is_emitted_while_the_window_is_open() {
    let events = vec![
        Event::keyed("노트북", "1500000", at_min(1)),
        Event::keyed("노트북", "1800000", at_min(2)),
    ];
    let source = VecSource::new(events).with_watermark(Watermark(at_min(59)));
    let out = run(PipelineKind::HourlySales, PipelineOptions::default(), source).await;
    assert!(out.is_empty());
}

#[tokio::test]
async fn bulk_hourly_sales_across_products_and_lanes() {
    let sales = [
        ("노트북", "1500000"),
        ("노트북", "1800000"),
        ("노트북", "2000000"),
        ("마우스", "50000"),
        ("마우스", "80000"),
        ("키보드", "120000"),
        ("키보드", "150000"),
    ];
    let events = sales
        .iter()
        .enumerate()
        .map(|(i, (k, v))| Event::keyed(*k, *v, at_min(i as i64 * 5)))
        .collect();
    let opts = PipelineOptions {
        partitions: 3,
        ..PipelineOptions::default()
    };
    let out = run(PipelineKind::HourlySales, opts, VecSource::bounded(events)).await;
    let mut totals: Vec<(String, i64)> = out
        .iter()
        .map(|e| {
            let r = HourlySales::decode(&e.value).unwrap();
            (r.product, r.total_sales)
        })
        .collect();
    totals.sort();
    assert_eq!(
        totals,
        vec![
            ("노트북".to_string(), 5_300_000),
            ("마우스".to_string(), 130_000),
            ("키보드".to_string(), 270_000),
        ]
    );
}

#[tokio::test]
async fn daily_sales_per_category() {
    let sales = [
        ("전자제품", "1500000"),
        ("전자제품", "800000"),
        ("전자제품", "2200000"),
        ("의류", "150000"),
        ("의류", "200000"),
        ("식품", "50000"),
        ("식품", "30000"),
        ("식품", "70000"),
    ];
    let events = sales
        .iter()
        .map(|(k, v)| Event::keyed(*k, *v, at_min(30)))
        .collect();
    let out = run(PipelineKind::DailySales, PipelineOptions::default(), VecSource::bounded(events)).await;
    assert_eq!(
        lines(&out),
        vec![
            "날짜:2025-11-13, 카테고리:식품, 일매출:150000".to_string(),
            "날짜:2025-11-13, 카테고리:의류, 일매출:350000".to_string(),
            "날짜:2025-11-13, 카테고리:전자제품, 일매출:4500000".to_string(),
        ]
    );
    for e in &out {
        assert!(DailySales::decode(&e.value).is_ok());
    }
}

#[tokio::test]
async fn event_counts_per_five_minutes() {
    let mut events = Vec::new();
    for (kind, n) in [("USER_LOGIN", 5), ("PAGE_VIEW", 10), ("PURCHASE", 3)] {
        for i in 0..n {
            events.push(Event::keyed(kind, format!("{{\"seq\":{}}}", i), at_min(30) + Duration::seconds(i)));
        }
    }
    let out = run(PipelineKind::EventCount, PipelineOptions::default(), VecSource::bounded(events)).await;
    assert_eq!(
        lines(&out),
        vec![
            "이벤트:PAGE_VIEW, 시간:14:30~14:35, 발생횟수:10".to_string(),
            "이벤트:PURCHASE, 시간:14:30~14:35, 발생횟수:3".to_string(),
            "이벤트:USER_LOGIN, 시간:14:30~14:35, 발생횟수:5".to_string(),
        ]
    );
    let login = out
        .iter()
        .find_map(|e| EventCount::decode(&e.value).ok().filter(|r| r.event_type == "USER_LOGIN"))
        .unwrap();
    assert_eq!(login.event_count, 5);
}

#[tokio::test]
async fn late_event_after_close_changes_nothing() {
    let events = vec![
        Event::keyed("노트북", "100", at_min(10)),
        // closes 14:00~15:00
        Event::keyed("노트북", "1", at_min(61)),
        // late for the closed hour
        Event::keyed("노트북", "999", at_min(20)),
    ];
    let out = run(PipelineKind::HourlySales, PipelineOptions::default(), VecSource::bounded(events)).await;
    assert_eq!(
        lines(&out),
        vec![
            "상품:노트북, 시간대:2025-11-13 14:00~2025-11-13 15:00, 총매출:100".to_string(),
            "상품:노트북, 시간대:2025-11-13 15:00~2025-11-13 16:00, 총매출:1".to_string(),
        ]
    );
}

#[tokio::test]
async fn malformed_amount_is_skipped_by_sum_but_counted_by_count() {
    let make = || {
        vec![
            Event::keyed("PURCHASE", "100", at_min(1)),
            Event::keyed("PURCHASE", "not-a-number", at_min(2)),
            Event::keyed("PURCHASE", "200", at_min(3)),
        ]
    };
    let sums = run(PipelineKind::HourlySales, PipelineOptions::default(), VecSource::bounded(make())).await;
    assert_eq!(HourlySales::decode(&sums[0].value).unwrap().total_sales, 300);
    let counts = run(PipelineKind::EventCount, PipelineOptions::default(), VecSource::bounded(make())).await;
    assert_eq!(EventCount::decode(&counts[0].value).unwrap().event_count, 3);
}

#[tokio::test]
async fn uppercase_transform() {
    let source = VecSource::new(vec![Event::observed(None, "hello kafka streams")]);
    let out = run(PipelineKind::Uppercase, PipelineOptions::default(), source).await;
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].value, "HELLO KAFKA STREAMS");
}

#[tokio::test]
async fn keyword_filter_passes_only_matching_messages() {
    let source = VecSource::new(vec![
        Event::observed(None, "중요한 메시지입니다"),
        Event::observed(None, "일반 메시지입니다"),
    ]);
    let out = run(PipelineKind::KeywordFilter, PipelineOptions::default(), source).await;
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].value, "중요한 메시지입니다");
}

#[tokio::test]
async fn word_count_emits_running_counts_in_arrival_order() {
    let source = VecSource::new(vec![Event::observed(None, "hello world hello")]);
    let opts = PipelineOptions {
        partitions: 4,
        ..PipelineOptions::default()
    };
    let out = run(PipelineKind::WordCount, opts, source).await;
    let pairs: Vec<String> = out
        .iter()
        .map(|e| format!("{}:{}", e.key.as_deref().unwrap_or(""), e.value))
        .collect();
    assert_eq!(pairs, vec!["hello:1", "world:1", "hello:2"]);
}

#[tokio::test]
async fn tick_closes_idle_windows() {
    // events in the past; the wall-clock tick moves the watermark beyond their hour
    let past = Utc::now() - Duration::hours(3);
    let source = VecSource::new(vec![Event::keyed("노트북", "42", past)]).hold_open();
    let opts = PipelineOptions {
        tick: Some(std::time::Duration::from_millis(100)),
        ..PipelineOptions::default()
    };
    let (input, output) = PipelineKind::HourlySales.default_topics();
    let sink = CollectSink::new();
    let mut exec = Registration::new(PipelineKind::HourlySales, input, output)
        .executor(&opts, source, sink.clone())
        .unwrap();
    let stop = exec.shutdown_handle();
    let handle = tokio::spawn(async move { exec.run().await });

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    while sink.events().is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    stop.cancel();
    handle.await.unwrap().unwrap();
    let out = sink.events();
    assert_eq!(out.len(), 1);
    assert!(out[0].value.ends_with("총매출:42"));
}

#[tokio::test]
async fn shutdown_with_open_windows_emits_nothing() {
    let source = VecSource::new(vec![
        Event::keyed("노트북", "1500000", at_min(1)),
        Event::keyed("마우스", "50000", at_min(2)),
    ])
    .hold_open();
    let opts = PipelineOptions {
        partitions: 2,
        ..PipelineOptions::default()
    };
    let (input, output) = PipelineKind::HourlySales.default_topics();
    let sink = CollectSink::new();
    let mut exec = Registration::new(PipelineKind::HourlySales, input, output)
        .executor(&opts, source, sink.clone())
        .unwrap();
    let stop = exec.shutdown_handle();
    let handle = tokio::spawn(async move { exec.run().await });

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    stop.cancel();
    tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .expect("pipeline did not stop")
        .unwrap()
        .unwrap();
    assert!(sink.events().is_empty());
}

#[tokio::test]
async fn interleaved_keys_across_an_hour_boundary_on_many_lanes() {
    let keys: Vec<String> = (0..8).map(|i| format!("상품{}", i)).collect();
    let mut events = Vec::new();
    for (i, k) in keys.iter().enumerate() {
        events.push(Event::keyed(k.as_str(), "10", at_min(i as i64)));
    }
    for (i, k) in keys.iter().enumerate().rev() {
        events.push(Event::keyed(k.as_str(), "5", at_min(30 + i as i64)));
    }
    for (i, k) in keys.iter().enumerate() {
        events.push(Event::keyed(k.as_str(), "1", at_min(60 + i as i64)));
    }
    let opts = PipelineOptions {
        partitions: 4,
        ..PipelineOptions::default()
    };
    let out = run(PipelineKind::HourlySales, opts, VecSource::bounded(events)).await;

    let mut totals: Vec<(String, String, i64)> = out
        .iter()
        .map(|e| {
            let r = HourlySales::decode(&e.value).unwrap();
            (r.product, r.window_start.format("%Y-%m-%d %H:%M").to_string(), r.total_sales)
        })
        .collect();
    totals.sort();
    let mut expected = Vec::new();
    for k in &keys {
        expected.push((k.clone(), "2025-11-13 14:00".to_string(), 15));
        expected.push((k.clone(), "2025-11-13 15:00".to_string(), 1));
    }
    expected.sort();
    assert_eq!(totals, expected);
}

#[tokio::test]
async fn one_event_past_the_hour_closes_windows_on_every_lane() {
    let mut events: Vec<Event> = (0..20)
        .map(|i| Event::keyed(format!("상품{}", i), "100", at_min(1)))
        .collect();
    events.push(Event::keyed("마우스", "1", at_min(61)));
    // no end-of-input watermark: only the last event moves time
    let opts = PipelineOptions {
        partitions: 4,
        ..PipelineOptions::default()
    };
    let out = run(PipelineKind::HourlySales, opts, VecSource::new(events)).await;
    assert_eq!(out.len(), 20);
    assert!(out.iter().all(|e| e.value.contains("시간대:2025-11-13 14:00~2025-11-13 15:00, 총매출:100")));
}

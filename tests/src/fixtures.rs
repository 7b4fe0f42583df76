//! Test fixtures and payload generators.

use chrono::Utc;
use engine_core::Record;

/// One line-protocol tick with an explicit nanosecond timestamp.
pub fn tick_line(symbol: &str, price: f64, seq: i64) -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("ticks,symbol={} price={},seq={}i {}", symbol, price, seq, nanos)
}

/// N line-protocol ticks, one per line.
pub fn tick_lines(n: usize) -> String {
    (0..n)
        .map(|i| tick_line("AAPL", 100.0 + i as f64, i as i64))
        .collect::<Vec<_>>()
        .join("\n")
}

/// N tick records.
pub fn tick_records(n: usize) -> Vec<Record> {
    (0..n)
        .map(|i| {
            Record::new(Utc::now(), "ticks")
                .tag("symbol", "MSFT")
                .field("price", 300.0 + i as f64)
                .field("seq", i as i64)
        })
        .collect()
}

/// Task submission body.
pub fn task_request(task_type: &str, args: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "task_type": task_type,
        "args": args,
    })
}

/// Interval schedule body.
pub fn interval_schedule(name: &str, task_type: &str, seconds: u64) -> serde_json::Value {
    serde_json::json!({
        "name": name,
        "task_type": task_type,
        "cadence": { "kind": "interval", "seconds": seconds },
        "payload_template": { "source": name },
    })
}

/// Cron schedule body.
pub fn cron_schedule(name: &str, task_type: &str, expression: &str) -> serde_json::Value {
    serde_json::json!({
        "name": name,
        "task_type": task_type,
        "cadence": { "kind": "cron", "expression": expression },
    })
}

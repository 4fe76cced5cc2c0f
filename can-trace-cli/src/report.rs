//! Session summaries and trace inspection output
//!
//! Text tables for the terminal and JSON documents for scripting.

use can_trace_core::{
    CanId, CycleStatSnapshot, Diagnostics, SessionFault, SessionInfo, TraceFile,
};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt::Write;

/// Live summary table, one row per CAN id
pub fn render_cycle_table(stats: &[CycleStatSnapshot]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<10} {:>3}  {:<23}  {:>11}  {:>15}",
        "CAN ID", "DLC", "Data", "Cycle Count", "Cycle Time (ms)"
    );
    let _ = writeln!(out, "{}", "─".repeat(68));

    for entry in stats {
        let cycle = entry
            .stat
            .last_cycle_time_ms
            .map(|ms| format!("{:.1}", ms))
            .unwrap_or_else(|| "-".to_string());
        let _ = writeln!(
            out,
            "{:<10} {:>3}  {:<23}  {:>11}  {:>15}",
            entry.id.to_hex(),
            entry.stat.dlc,
            entry.stat.data.to_hex(),
            entry.stat.count,
            cycle
        );
    }
    out
}

/// Diagnostic counters block
pub fn render_diagnostics(diagnostics: &Diagnostics) -> String {
    let rows = [
        ("Frames received", diagnostics.frames_received),
        ("Lines written", diagnostics.lines_written),
        ("Invalid frames", diagnostics.invalid_frames),
        ("Paused discards", diagnostics.paused_discards),
        ("Jitter clamps", diagnostics.jitter_clamps),
        ("Disconnect retries", diagnostics.disconnect_retries),
        ("Dropped notifications", diagnostics.notifications_dropped),
    ];
    let mut out = String::new();
    for (label, value) in rows {
        let _ = writeln!(out, "  {:<22} {}", label, value);
    }
    out
}

/// Machine-readable record summary
pub fn summary_json(
    info: Option<&SessionInfo>,
    stats: &[CycleStatSnapshot],
    diagnostics: &Diagnostics,
    fault: Option<&SessionFault>,
) -> serde_json::Value {
    let messages: Vec<_> = stats
        .iter()
        .map(|entry| {
            json!({
                "id": entry.id.to_hex(),
                "extended": entry.id.is_extended(),
                "dlc": entry.stat.dlc,
                "data": entry.stat.data.to_hex(),
                "count": entry.stat.count,
                "cycle_time_ms": entry.stat.last_cycle_time_ms,
            })
        })
        .collect();

    json!({
        "session": info,
        "messages": messages,
        "diagnostics": diagnostics,
        "fault": fault,
    })
}

/// Per-id statistics of a parsed trace
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InspectEntry {
    pub id: CanId,
    pub count: u64,
    pub first_ms: f64,
    pub last_ms: f64,
    /// Mean interval between records of this id
    pub mean_period_ms: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InspectReport {
    pub version: Option<String>,
    pub start_time: Option<String>,
    pub records: usize,
    pub duration_ms: f64,
    pub messages: Vec<InspectEntry>,
}

impl InspectReport {
    pub fn from_trace(trace: &TraceFile) -> Self {
        let mut by_id: BTreeMap<CanId, InspectEntry> = BTreeMap::new();
        for record in &trace.records {
            by_id
                .entry(record.id)
                .and_modify(|entry| {
                    entry.count += 1;
                    entry.last_ms = record.offset_ms;
                })
                .or_insert(InspectEntry {
                    id: record.id,
                    count: 1,
                    first_ms: record.offset_ms,
                    last_ms: record.offset_ms,
                    mean_period_ms: None,
                });
        }

        let messages = by_id
            .into_values()
            .map(|mut entry| {
                if entry.count > 1 {
                    entry.mean_period_ms =
                        Some((entry.last_ms - entry.first_ms) / (entry.count - 1) as f64);
                }
                entry
            })
            .collect();

        let duration_ms = match (trace.records.first(), trace.records.last()) {
            (Some(first), Some(last)) => last.offset_ms - first.offset_ms,
            _ => 0.0,
        };

        Self {
            version: trace.version.clone(),
            start_time: trace
                .start_time()
                .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f").to_string()),
            records: trace.records.len(),
            duration_ms,
            messages,
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "File version: {}",
            self.version.as_deref().unwrap_or("unknown")
        );
        if let Some(start) = &self.start_time {
            let _ = writeln!(out, "Start time:   {}", start);
        }
        let _ = writeln!(out, "Records:      {}", self.records);
        let _ = writeln!(out, "Duration:     {:.1} ms\n", self.duration_ms);

        let _ = writeln!(out, "{:<10} {:>8}  {:>16}", "CAN ID", "Count", "Mean Period (ms)");
        let _ = writeln!(out, "{}", "─".repeat(36));
        for entry in &self.messages {
            let period = entry
                .mean_period_ms
                .map(|ms| format!("{:.1}", ms))
                .unwrap_or_else(|| "-".to_string());
            let _ = writeln!(out, "{:<10} {:>8}  {:>16}", entry.id.to_hex(), entry.count, period);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use can_trace_core::{CanEvent, CycleTracker, Direction, Payload, TraceReader};

    fn event(id: u32, data: &[u8], ts: u64) -> CanEvent {
        CanEvent::new(
            CanId::standard(id).unwrap(),
            Payload::new(data).unwrap(),
            ts,
            Direction::Rx,
        )
    }

    #[test]
    fn test_cycle_table_rows() {
        let mut tracker = CycleTracker::new();
        tracker.observe(&event(0x100, &[0x01, 0xA2], 1_000));
        tracker.observe(&event(0x100, &[0x01, 0xA3], 11_000));
        tracker.observe(&event(0x200, &[], 5_000));

        let table = render_cycle_table(&tracker.snapshot());
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("CAN ID"));
        assert!(lines[2].starts_with("100"));
        assert!(lines[2].contains("01 A3"));
        assert!(lines[2].trim_end().ends_with("10.0"));
        assert!(lines[3].trim_end().ends_with('-'));
    }

    #[test]
    fn test_summary_json_shape() {
        let mut tracker = CycleTracker::new();
        tracker.observe(&event(0x7DF, &[0x02], 0));

        let value = summary_json(None, &tracker.snapshot(), &Diagnostics::default(), None);
        assert_eq!(value["messages"][0]["id"], "7DF");
        assert_eq!(value["messages"][0]["count"], 1);
        assert!(value["messages"][0]["cycle_time_ms"].is_null());
        assert!(value["fault"].is_null());
    }

    #[test]
    fn test_inspect_report() {
        let text = "\
;$FILEVERSION=1.1
     1)         0.0  Rx    100      1  00
     2)         5.0  Rx    200      1  00
     3)        10.0  Rx    100      1  01
     4)        20.0  Rx    100      1  02
";
        let trace = TraceReader::parse_str(text).unwrap();
        let report = InspectReport::from_trace(&trace);

        assert_eq!(report.records, 4);
        assert_eq!(report.duration_ms, 20.0);
        assert_eq!(report.messages.len(), 2);
        assert_eq!(report.messages[0].count, 3);
        assert_eq!(report.messages[0].mean_period_ms, Some(10.0));
        assert_eq!(report.messages[1].mean_period_ms, None);
        assert!(report.render().contains("Records:      4"));
    }
}

//! PCAN `.TRC` v1.1 reader

use crate::types::{CanId, Direction, TraceParseError};
use chrono::{DateTime, NaiveDateTime};
use serde::Serialize;
use std::io::BufRead;
use std::path::Path;

/// One record parsed from a trace file
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceRecord {
    pub sequence: u64,
    pub offset_ms: f64,
    pub direction: Direction,
    pub id: CanId,
    pub dlc: u8,
    pub data: Vec<u8>,
    pub remote: bool,
}

/// Parsed trace file
#[derive(Debug, Clone, Default, Serialize)]
pub struct TraceFile {
    pub version: Option<String>,
    /// `$STARTTIME` as an OLE automation date
    pub start_time_days: Option<f64>,
    pub records: Vec<TraceRecord>,
}

impl TraceFile {
    /// `$STARTTIME` as a local wall-clock time
    pub fn start_time(&self) -> Option<NaiveDateTime> {
        let days = self.start_time_days?;
        let millis = ((days - 25_569.0) * 86_400_000.0).round() as i64;
        DateTime::from_timestamp_millis(millis).map(|dt| dt.naive_utc())
    }
}

/// Parser for v1.1 trace files
pub struct TraceReader;

impl TraceReader {
    pub fn read_file(path: &Path) -> Result<TraceFile, TraceParseError> {
        log::info!("Reading trace file: {:?}", path);
        let file = std::fs::File::open(path)?;
        Self::parse(std::io::BufReader::new(file))
    }

    pub fn parse_str(text: &str) -> Result<TraceFile, TraceParseError> {
        Self::parse(text.as_bytes())
    }

    pub fn parse<R: BufRead>(reader: R) -> Result<TraceFile, TraceParseError> {
        let mut trace = TraceFile::default();

        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            let line_no = index + 1;
            let trimmed = line.trim();

            if let Some(version) = trimmed.strip_prefix(";$FILEVERSION=") {
                if version != "1.1" {
                    return Err(TraceParseError::UnsupportedVersion(version.to_string()));
                }
                trace.version = Some(version.to_string());
            } else if let Some(start) = trimmed.strip_prefix(";$STARTTIME=") {
                trace.start_time_days = start.parse().ok();
            } else if trimmed.is_empty() || trimmed.starts_with(';') {
                continue;
            } else {
                trace.records.push(parse_record(trimmed, line_no)?);
            }
        }

        log::debug!("Parsed {} trace records", trace.records.len());
        Ok(trace)
    }
}

fn parse_record(line: &str, line_no: usize) -> Result<TraceRecord, TraceParseError> {
    let invalid = |reason: String| TraceParseError::InvalidRecord {
        line: line_no,
        reason,
    };

    let cols: Vec<&str> = line.split_whitespace().collect();
    if cols.len() < 5 {
        return Err(invalid(format!("expected at least 5 columns, found {}", cols.len())));
    }

    let sequence = cols[0]
        .strip_suffix(')')
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| invalid(format!("bad message number '{}'", cols[0])))?;
    let offset_ms = cols[1]
        .parse()
        .map_err(|_| invalid(format!("bad time offset '{}'", cols[1])))?;
    let direction: Direction = cols[2].parse().map_err(invalid)?;

    // 8 hex digits mark an extended id, PCAN writes 4 for standard ids
    let extended = cols[3].len() > 4;
    let raw = u32::from_str_radix(cols[3], 16)
        .map_err(|_| invalid(format!("bad CAN ID '{}'", cols[3])))?;
    let id = CanId::new(raw, extended)
        .ok_or_else(|| invalid(format!("CAN ID '{}' out of range", cols[3])))?;

    let dlc: u8 = cols[4]
        .parse()
        .ok()
        .filter(|dlc| *dlc <= 8)
        .ok_or_else(|| invalid(format!("bad data length '{}'", cols[4])))?;

    let remote = cols.get(5) == Some(&"RTR");
    let data = if remote {
        Vec::new()
    } else {
        let data = cols[5..]
            .iter()
            .map(|b| u8::from_str_radix(b, 16))
            .collect::<Result<Vec<u8>, _>>()
            .map_err(|_| invalid("bad data byte".to_string()))?;
        if data.len() != dlc as usize {
            return Err(invalid(format!(
                "data length {} does not match {} bytes",
                dlc,
                data.len()
            )));
        }
        data
    };

    Ok(TraceRecord {
        sequence,
        offset_ms,
        direction,
        id,
        dlc,
        data,
        remote,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
;$FILEVERSION=1.1
;$STARTTIME=45579.6272916667
;
;   Start time: 14-10-2024 15:03:18.000.0
;---+--   ----+----  --+--  ----+---  +  -+ -- -- -- -- -- -- --
     1)         0.1  Rx    100      8  01 02 03 04 05 06 07 08
     2)        10.4  Tx    18DAF110 2  3E 00
     3)        12.0  Rx    321      4  RTR
     4)        15.5  Rx    0200     0
";

    #[test]
    fn test_parse_sample() {
        let trace = TraceReader::parse_str(SAMPLE).unwrap();
        assert_eq!(trace.version.as_deref(), Some("1.1"));
        assert_eq!(trace.records.len(), 4);

        let first = &trace.records[0];
        assert_eq!(first.sequence, 1);
        assert_eq!(first.id, CanId::standard(0x100).unwrap());
        assert_eq!(first.data, vec![1, 2, 3, 4, 5, 6, 7, 8]);

        let second = &trace.records[1];
        assert_eq!(second.direction, Direction::Tx);
        assert!(second.id.is_extended());
        assert_eq!(second.offset_ms, 10.4);

        assert!(trace.records[2].remote);
        assert_eq!(trace.records[2].dlc, 4);

        // Four-digit PCAN style standard id
        assert!(!trace.records[3].id.is_extended());
        assert!(trace.records[3].data.is_empty());
    }

    #[test]
    fn test_start_time() {
        let trace = TraceReader::parse_str(SAMPLE).unwrap();
        let start = trace.start_time().unwrap();
        assert_eq!(start.format("%Y-%m-%d %H:%M:%S").to_string(), "2024-10-14 15:03:18");
    }

    #[test]
    fn test_unsupported_version() {
        let result = TraceReader::parse_str(";$FILEVERSION=2.1\n");
        assert!(matches!(result, Err(TraceParseError::UnsupportedVersion(v)) if v == "2.1"));
    }

    #[test]
    fn test_dlc_mismatch_is_reported() {
        let result = TraceReader::parse_str("     1)         0.0  Rx    100      3  01 02\n");
        match result {
            Err(TraceParseError::InvalidRecord { line, .. }) => assert_eq!(line, 1),
            other => panic!("expected InvalidRecord, got {:?}", other),
        }
    }
}

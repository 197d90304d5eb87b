//! JSON-lines log book
//!
//! Recordings are stored one entry per line as
//! `{"type": "PVT", "payload": {...}, "monoTime": 12.5}`, payload fields named
//! as in the u-blox interface description. Fused measurements are written back
//! one JSON object per line as well.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use hifitime::Epoch;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::Result;
use crate::nav_fusion::Measurement;
use crate::ubx_messages::NavRecord;

/// One recorded navigation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
    /// Seconds on a monotonic clock when the message was received
    #[serde(rename = "monoTime", default, skip_serializing_if = "Option::is_none")]
    pub mono_time: Option<f64>,
}

impl LogEntry {
    /// Builds an entry for a decoded record. Records without a typed payload
    /// have nothing to log and yield `None`.
    pub fn from_record(record: &NavRecord, mono_time: Option<f64>) -> Result<Option<Self>> {
        let payload = match record {
            NavRecord::Pvt(pvt) => serde_json::to_value(pvt)?,
            NavRecord::TimeUtc(time) => serde_json::to_value(time)?,
            NavRecord::HpPosLlh(pos) => serde_json::to_value(pos)?,
            NavRecord::Other { .. } => return Ok(None),
        };
        Ok(Some(Self {
            kind: record.name().to_string(),
            payload,
            mono_time,
        }))
    }

    pub fn into_record(self) -> Result<NavRecord> {
        Ok(match self.kind.as_str() {
            "PVT" => NavRecord::Pvt(serde_json::from_value(self.payload)?),
            "TIMEUTC" => NavRecord::TimeUtc(serde_json::from_value(self.payload)?),
            "HPPOSLLH" => NavRecord::HpPosLlh(serde_json::from_value(self.payload)?),
            _ => {
                let itow = self
                    .payload
                    .get("iTOW")
                    .and_then(Value::as_u64)
                    .and_then(|itow| u32::try_from(itow).ok());
                NavRecord::Other { name: self.kind, itow }
            }
        })
    }
}

/// Reads every record of a log book, skipping blank lines.
pub fn read_records<R: BufRead>(reader: R) -> Result<Vec<NavRecord>> {
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: LogEntry = serde_json::from_str(&line)?;
        records.push(entry.into_record()?);
    }
    Ok(records)
}

/// Appends records to a log book, stamping each with the time elapsed since
/// the writer was created.
pub struct LogWriter<W: Write> {
    writer: W,
    started: Instant,
    written: usize,
}

impl<W: Write> LogWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            started: Instant::now(),
            written: 0,
        }
    }

    /// Writes the record, returns false if it had no payload to log.
    pub fn write_record(&mut self, record: &NavRecord) -> Result<bool> {
        let mono_time = self.started.elapsed().as_secs_f64();
        let Some(entry) = LogEntry::from_record(record, Some(mono_time))? else {
            return Ok(false);
        };
        serde_json::to_writer(&mut self.writer, &entry)?;
        self.writer.write_all(b"\n")?;
        self.written += 1;
        Ok(true)
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

pub fn write_measurements<W: Write>(mut writer: W, measurements: &[Measurement]) -> Result<()> {
    for measurement in measurements {
        serde_json::to_writer(&mut writer, measurement)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

/// `dir/name.jsonl` becomes `dir/name-gps.jsonl`.
pub fn converted_path(input: &Path) -> PathBuf {
    let stem = input.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default();
    let name = match input.extension() {
        Some(ext) => format!("{stem}-gps.{}", ext.to_string_lossy()),
        None => format!("{stem}-gps"),
    };
    input.with_file_name(name)
}

/// Log book file name for a recording started at `start` (UTC).
pub fn log_file_name(start: Epoch) -> String {
    let (year, month, day, hour, minute, second, _) = start.to_gregorian_utc();
    format!("ubx-{year:04}-{month:02}-{day:02}-{hour:02}-{minute:02}-{second:02}.jsonl")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StreamFormat {
    /// `lat lon altitude verticalAccuracy accuracy`
    #[default]
    Plain,
    Json,
}

/// Formats a live measurement for stdout.
pub fn format_stream_line(measurement: &Measurement, format: StreamFormat) -> Result<String> {
    Ok(match format {
        StreamFormat::Plain => format!(
            "{:?} {:?} {:?} {:?} {:?}",
            measurement.lat,
            measurement.lon,
            measurement.altitude,
            measurement.vertical_accuracy,
            measurement.accuracy
        ),
        StreamFormat::Json => serde_json::to_string(&json!({
            "latitude": measurement.lat,
            "longitude": measurement.lon,
            "altitude": measurement.altitude,
            "monotonicTime": measurement.time,
            "accuracy": measurement.accuracy,
            "verticalAccuracy": measurement.vertical_accuracy,
        }))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::nav_fusion::{PrecisionMode, fuse_batch};
    use crate::ubx_messages::{NavHpPosLlh, NavPvt, PvtValidity};
    use std::io::Cursor;

    const RECORDING: &str = r#"{"type": "PVT", "payload": {"iTOW": 1000, "year": 2023, "month": 6, "day": 14, "hour": 12, "min": 30, "sec": 1, "valid": {"validDate": 1, "validTime": 1, "fullyResolved": 1, "validMag": 0}, "nano": -20, "lon": 247538120, "lat": 601698230, "hMSL": 15320, "hAcc": 1400, "vAcc": 2100, "velN": 100, "velE": 0, "velD": 0, "gSpeed": 100, "sAcc": 300}, "monoTime": 10.0}
{"type": "STATUS", "payload": {"iTOW": 1000, "gpsFix": 3}, "monoTime": 10.1}

{"type": "TIMEUTC", "payload": {"iTOW": 1000, "tAcc": 20, "nano": -20, "year": 2023, "month": 6, "day": 14, "hour": 12, "min": 30, "sec": 1, "valid": {"validTOW": 1, "validWKN": 1, "validUTC": 1, "utcStandard": 4}}, "monoTime": 10.2}
{"type": "HPPOSLLH", "payload": {"version": 0, "iTOW": 1000, "lon": 247538120, "lat": 601698230, "height": 33000, "hMSL": 15320, "lonHp": 5, "latHp": -5, "heightHp": 0, "hMSLHp": 3, "hAcc": 140, "vAcc": 210, "flags": {"invalidLlh": 0}}, "monoTime": 10.3}
{"type": "PVT", "payload": {"iTOW": 2000, "year": 2023, "month": 6, "day": 14, "hour": 12, "min": 30, "sec": 2, "valid": {"validDate": 1, "validTime": 0}, "lon": 1, "lat": 1, "hMSL": 1, "hAcc": 1, "vAcc": 1}, "monoTime": 11.0}
"#;

    #[test]
    fn test_read_records() {
        let records = read_records(Cursor::new(RECORDING)).unwrap();
        let names: Vec<&str> = records.iter().map(NavRecord::name).collect();
        assert_eq!(names, ["PVT", "STATUS", "TIMEUTC", "HPPOSLLH", "PVT"]);
        assert_eq!(records[1], NavRecord::Other { name: "STATUS".to_string(), itow: Some(1000) });
        let NavRecord::HpPosLlh(pos) = &records[3] else {
            panic!("expected HPPOSLLH");
        };
        assert_eq!((pos.lat_hp, pos.lon_hp, pos.h_msl_hp), (-5, 5, 3));
    }

    #[test]
    fn test_convert_recording() {
        let records = read_records(Cursor::new(RECORDING)).unwrap();
        // second epoch has no valid time and is dropped
        let measurements = fuse_batch(records, PrecisionMode::Auto);
        assert_eq!(measurements.len(), 1);
        assert!((measurements[0].lat - 60.169822995).abs() < 1e-12);

        let mut out = Vec::new();
        write_measurements(&mut out, &measurements).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 1);
        let value: Value = serde_json::from_str(text.trim_end()).unwrap();
        assert!((value["velocity"]["north"].as_f64().unwrap() - 0.1).abs() < 1e-12);
        assert!((value["verticalAccuracy"].as_f64().unwrap() - 0.21).abs() < 1e-12);
    }

    #[test]
    fn test_corrupted_line_is_an_error() {
        let result = read_records(Cursor::new("{\"type\": \"PVT\"\n"));
        assert!(matches!(result, Err(Error::Json(_))));
    }

    #[test]
    fn test_log_writer_round_trip() {
        let pvt = NavPvt {
            itow: 42,
            second: 7,
            valid: PvtValidity { valid_time: true, ..Default::default() },
            lat: -335_000_000,
            ..Default::default()
        };
        let pos = NavHpPosLlh { itow: 42, lat_hp: -1, ..Default::default() };
        let mut buffer = Vec::new();
        let mut writer = LogWriter::new(&mut buffer);
        assert!(writer.write_record(&NavRecord::Pvt(pvt)).unwrap());
        assert!(writer.write_record(&NavRecord::HpPosLlh(pos)).unwrap());
        let other = NavRecord::Other { name: "NAV-03".to_string(), itow: None };
        assert!(!writer.write_record(&other).unwrap());
        assert_eq!(writer.written(), 2);
        writer.flush().unwrap();

        let text = String::from_utf8(buffer).unwrap();
        let first: Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(first["type"], "PVT");
        assert_eq!(first["payload"]["iTOW"], 42);
        assert_eq!(first["payload"]["valid"]["validTime"], 1);
        assert!(first["monoTime"].as_f64().unwrap() >= 0.0);

        let records = read_records(Cursor::new(text)).unwrap();
        assert_eq!(records, vec![NavRecord::Pvt(pvt), NavRecord::HpPosLlh(pos)]);
    }

    #[test]
    fn test_converted_path() {
        assert_eq!(
            converted_path(Path::new("output/ubx-2023.jsonl")),
            PathBuf::from("output/ubx-2023-gps.jsonl")
        );
        assert_eq!(converted_path(Path::new("raw")), PathBuf::from("raw-gps"));
    }

    #[test]
    fn test_log_file_name() {
        let start = Epoch::from_gregorian_utc(2024, 3, 5, 7, 8, 9, 0);
        assert_eq!(log_file_name(start), "ubx-2024-03-05-07-08-09.jsonl");
    }

    #[test]
    fn test_stream_lines() {
        let measurement = Measurement {
            time: 1_700_000_000.5,
            lat: 60.5,
            lon: 24.25,
            altitude: 15.0,
            accuracy: 0.5,
            vertical_accuracy: 0.75,
            velocity: None,
            ground_speed: None,
            speed_accuracy: None,
        };
        assert_eq!(
            format_stream_line(&measurement, StreamFormat::Plain).unwrap(),
            "60.5 24.25 15.0 0.75 0.5"
        );
        let line = format_stream_line(&measurement, StreamFormat::Json).unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["latitude"], 60.5);
        assert_eq!(value["monotonicTime"], 1_700_000_000.5);
        assert_eq!(value["verticalAccuracy"], 0.75);
    }
}

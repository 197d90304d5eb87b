//! Navigation solution fusion.
//!
//! For every navigation epoch the receiver emits several messages sharing the
//! same GPS time of week (`iTOW`): `NAV-PVT` (time, position, velocity),
//! `NAV-TIMEUTC` (time) and `NAV-HPPOSLLH` (high precision position). This
//! module groups them by `iTOW` and turns each group into one [`Measurement`].
//!
//! # Features
//! - Batch fusion of a whole recording, sorted by time
//! - Streaming fusion, emitting a measurement as soon as its epoch is complete
//! - High precision position from `NAV-HPPOSLLH`, low precision fallback to base fields
//! - Sub-second timestamps with signed nanosecond correction
//!
//! # Usage
//!
//! ```rust
//! use ubx_fusion::nav_fusion::{fuse_batch, PrecisionMode};
//! let measurements = fuse_batch(Vec::new(), PrecisionMode::Auto);
//! assert!(measurements.is_empty());
//! ```

use std::collections::BTreeMap;

use hifitime::{Duration, Epoch};
use log::{info, warn};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::ubx_messages::{NavHpPosLlh, NavPvt, NavRecord, NavTimeUtc, UtcTime};

const LATLON_SCALE: f64 = 1e-7;
const LATLON_HP_SCALE: f64 = 1e-2;
const HEIGHT_HP_SCALE: f64 = 0.1;
const MM_TO_METERS: f64 = 1e-3;

/// Which position tier to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PrecisionMode {
    /// High precision as soon as `NAV-HPPOSLLH` shows up in the data.
    #[default]
    Auto,
    /// Only `NAV-HPPOSLLH` high precision positions.
    High,
    /// Base fields only, from `NAV-HPPOSLLH` or `NAV-PVT`.
    Low,
}

#[derive(Debug, Clone, Default)]
pub struct FusionConfig {
    pub precision: PrecisionMode,
    /// Streaming only: emit an epoch that never got all three messages.
    pub allow_incomplete: bool,
}

/// NED velocity in m/s.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Velocity {
    pub north: f64,
    pub east: f64,
    pub down: f64,
}

/// A fused navigation solution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Measurement {
    /// UNIX time in seconds
    pub time: f64,
    /// Latitude in decimal degrees
    pub lat: f64,
    /// Longitude in decimal degrees
    pub lon: f64,
    /// Height above mean sea level in meters
    pub altitude: f64,
    /// Horizontal accuracy estimate in meters
    pub accuracy: f64,
    /// Vertical accuracy estimate in meters
    pub vertical_accuracy: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub velocity: Option<Velocity>,
    /// Ground speed in m/s
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ground_speed: Option<f64>,
    /// Speed accuracy estimate in m/s
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_accuracy: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Position {
    lat: f64,
    lon: f64,
    altitude: f64,
    accuracy: f64,
    vertical_accuracy: f64,
}

impl Position {
    fn high_precision(hp: &NavHpPosLlh) -> Self {
        Self {
            lat: (hp.lat as f64 + hp.lat_hp as f64 * LATLON_HP_SCALE) * LATLON_SCALE,
            lon: (hp.lon as f64 + hp.lon_hp as f64 * LATLON_HP_SCALE) * LATLON_SCALE,
            altitude: (hp.h_msl as f64 + hp.h_msl_hp as f64 * HEIGHT_HP_SCALE) * MM_TO_METERS,
            accuracy: hp.h_acc as f64 * MM_TO_METERS,
            vertical_accuracy: hp.v_acc as f64 * MM_TO_METERS,
        }
    }

    fn low_precision(lat: i32, lon: i32, h_msl: i32, h_acc: u32, v_acc: u32) -> Self {
        Self {
            lat: lat as f64 * LATLON_SCALE,
            lon: lon as f64 * LATLON_SCALE,
            altitude: h_msl as f64 * MM_TO_METERS,
            accuracy: h_acc as f64 * MM_TO_METERS,
            vertical_accuracy: v_acc as f64 * MM_TO_METERS,
        }
    }
}

/// Turns calendar fields plus signed nanoseconds into an instant.
///
/// The correction is added as a duration, so a negative value moves the
/// instant into the previous second (or minute, day...).
fn utc_epoch(time: &UtcTime) -> Option<Epoch> {
    let second = Epoch::maybe_from_gregorian_utc(
        i32::from(time.year),
        time.month,
        time.day,
        time.hour,
        time.minute,
        time.second,
        0,
    )
    .ok()?;
    Some(second + Duration::from_total_nanoseconds(i128::from(time.nano)))
}

/// All messages of one navigation epoch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NavigationGroup {
    pub itow: u32,
    pub pvt: Option<NavPvt>,
    pub time_utc: Option<NavTimeUtc>,
    pub hp_pos: Option<NavHpPosLlh>,
}

impl NavigationGroup {
    pub fn new(itow: u32) -> Self {
        Self {
            itow,
            ..Default::default()
        }
    }

    /// Stores a known record, replacing one of the same type.
    ///
    /// Returns false for records this group does not keep.
    pub fn insert(&mut self, record: NavRecord) -> bool {
        match record {
            NavRecord::Pvt(pvt) => self.pvt = Some(pvt),
            NavRecord::TimeUtc(time) => self.time_utc = Some(time),
            NavRecord::HpPosLlh(pos) => self.hp_pos = Some(pos),
            NavRecord::Other { .. } => return false,
        }
        true
    }

    pub fn is_empty(&self) -> bool {
        self.pvt.is_none() && self.time_utc.is_none() && self.hp_pos.is_none()
    }

    /// True once PVT, TIMEUTC and HPPOSLLH are all present.
    pub fn is_complete(&self) -> bool {
        self.pvt.is_some() && self.time_utc.is_some() && self.hp_pos.is_some()
    }

    /// Solution time: PVT when its time is valid, TIMEUTC otherwise.
    pub fn timestamp(&self) -> Result<Epoch> {
        self.pvt
            .as_ref()
            .and_then(NavPvt::utc_time)
            .and_then(|t| utc_epoch(&t))
            .or_else(|| {
                self.time_utc
                    .as_ref()
                    .and_then(NavTimeUtc::utc_time)
                    .and_then(|t| utc_epoch(&t))
            })
            .ok_or(Error::MissingTimestamp(self.itow))
    }

    fn position(&self, high_precision: bool) -> Result<Position> {
        match (&self.hp_pos, &self.pvt) {
            (Some(hp), _) if high_precision => Ok(Position::high_precision(hp)),
            (Some(hp), _) => Ok(Position::low_precision(hp.lat, hp.lon, hp.h_msl, hp.h_acc, hp.v_acc)),
            (None, Some(pvt)) if !high_precision => Ok(Position::low_precision(
                pvt.lat, pvt.lon, pvt.h_msl, pvt.h_acc, pvt.v_acc,
            )),
            _ => Err(Error::MissingLocation(self.itow)),
        }
    }

    /// Fuses the group into a measurement.
    ///
    /// In high precision mode a group without `NAV-HPPOSLLH` has no position.
    /// Velocity is attached whenever `NAV-PVT` is present.
    pub fn measurement(&self, high_precision: bool) -> Result<Measurement> {
        let time = self.timestamp()?;
        let position = self.position(high_precision)?;
        let pvt = self.pvt.as_ref();
        Ok(Measurement {
            time: time.to_unix_seconds(),
            lat: position.lat,
            lon: position.lon,
            altitude: position.altitude,
            accuracy: position.accuracy,
            vertical_accuracy: position.vertical_accuracy,
            velocity: pvt.map(|pvt| Velocity {
                north: pvt.vel_n as f64 * MM_TO_METERS,
                east: pvt.vel_e as f64 * MM_TO_METERS,
                down: pvt.vel_d as f64 * MM_TO_METERS,
            }),
            ground_speed: pvt.map(|pvt| pvt.g_speed as f64 * MM_TO_METERS),
            speed_accuracy: pvt.map(|pvt| pvt.s_acc as f64 * MM_TO_METERS),
        })
    }
}

/// Fuses a whole recording.
///
/// In [`PrecisionMode::Auto`] the tier is decided once for the whole input:
/// high precision if any `NAV-HPPOSLLH` record is present. Groups without a
/// valid time or position are skipped with a warning. The result is sorted by
/// time, equal times keep their `iTOW` order.
pub fn fuse_batch<I>(records: I, precision: PrecisionMode) -> Vec<Measurement>
where
    I: IntoIterator<Item = NavRecord>,
{
    let mut groups: BTreeMap<u32, NavigationGroup> = BTreeMap::new();
    let mut seen_high_precision = false;
    for record in records {
        if matches!(record, NavRecord::HpPosLlh(_)) {
            seen_high_precision = true;
        }
        if matches!(record, NavRecord::Other { .. }) {
            continue;
        }
        let Some(itow) = record.itow() else {
            continue;
        };
        groups
            .entry(itow)
            .or_insert_with(|| NavigationGroup::new(itow))
            .insert(record);
    }

    let high_precision = match precision {
        PrecisionMode::Auto => seen_high_precision,
        PrecisionMode::High => true,
        PrecisionMode::Low => false,
    };
    if high_precision {
        info!("using HPPOSLLH for high precision, PVT positions excluded");
    } else {
        info!("using low precision mode");
    }

    let mut measurements: Vec<Measurement> = groups
        .values()
        .filter_map(|group| match group.measurement(high_precision) {
            Ok(measurement) => Some(measurement),
            Err(err) => {
                warn!("{err}");
                None
            }
        })
        .collect();
    measurements.sort_by(|a, b| a.time.total_cmp(&b.time));
    measurements
}

/// Incremental fusion of a live message stream.
///
/// A group is emitted when all three messages arrived, or, with
/// `allow_incomplete`, when the next epoch starts. Any record carrying a
/// different `iTOW`, known type or not, starts a new epoch.
#[derive(Debug)]
pub struct StreamFusion {
    config: FusionConfig,
    current: Option<NavigationGroup>,
    high_precision: bool,
}

impl StreamFusion {
    pub fn new(config: FusionConfig) -> Self {
        let high_precision = config.precision == PrecisionMode::High;
        Self {
            config,
            current: None,
            high_precision,
        }
    }

    /// True once positions come from `NAV-HPPOSLLH` only.
    ///
    /// In auto mode this turns on with the first `NAV-HPPOSLLH` and stays on;
    /// epochs emitted before that are not revisited.
    pub fn is_high_precision(&self) -> bool {
        self.high_precision
    }

    /// Feeds one record, returning a measurement if an epoch got emitted.
    pub fn push(&mut self, record: NavRecord) -> Option<Measurement> {
        let itow = record.itow()?;

        let mut flushed = None;
        if self.current.as_ref().is_some_and(|group| group.itow != itow) {
            if let Some(previous) = self.current.take() {
                if self.config.allow_incomplete && !previous.is_empty() {
                    flushed = self.emit(&previous);
                }
            }
        }

        if matches!(record, NavRecord::HpPosLlh(_))
            && self.config.precision == PrecisionMode::Auto
            && !self.high_precision
        {
            info!("found HPPOSLLH, switching to high precision");
            self.high_precision = true;
        }

        let group = self.current.get_or_insert_with(|| NavigationGroup::new(itow));
        group.insert(record);
        if group.is_complete() {
            if let Some(complete) = self.current.take() {
                return self.emit(&complete);
            }
        }
        flushed
    }

    /// Flushes the pending epoch at end of stream, if incomplete ones are allowed.
    pub fn finish(&mut self) -> Option<Measurement> {
        let pending = self.current.take()?;
        if self.config.allow_incomplete && !pending.is_empty() {
            self.emit(&pending)
        } else {
            None
        }
    }

    fn emit(&self, group: &NavigationGroup) -> Option<Measurement> {
        match group.measurement(self.high_precision) {
            Ok(measurement) => Some(measurement),
            Err(err) => {
                warn!("{err}");
                None
            }
        }
    }
}

//! Typed UBX messages
//!
//! Only the handful of messages this crate acts upon are decoded: the two
//! acknowledgements answering a configuration frame, and the three navigation
//! messages fused into a measurement. Everything else decodes to an opaque
//! variant that only keeps its identity, plus the `iTOW` of other NAV
//! messages. [`read_nav_records`] pulls navigation records off a serial port.
//!
//! Field names follow the u-blox interface description, so the serde
//! representation of each payload matches the JSON logs (`iTOW`, `hMSL`,
//! `validTime`...).

use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use byteorder::{ByteOrder, LittleEndian};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::config_session::READ_ERROR_BACKOFF;
use crate::error::FrameError;
use crate::ubx_frame::{Frame, FrameParser};

pub const UBX_CLASS_NAV: u8 = 0x01;
pub const UBX_CLASS_ACK: u8 = 0x05;

pub const UBX_ACK_NAK: u8 = 0x00;
pub const UBX_ACK_ACK: u8 = 0x01;

pub const UBX_NAV_PVT: u8 = 0x07;
pub const UBX_NAV_HPPOSLLH: u8 = 0x14;
pub const UBX_NAV_TIMEUTC: u8 = 0x21;

const NAV_PVT_MIN_LEN: usize = 84;
const NAV_TIMEUTC_LEN: usize = 20;
const NAV_HPPOSLLH_LEN: usize = 36;

/// Validity bits are written as `0`/`1` like the receiver reports them, but
/// booleans are accepted when reading logs back.
mod flag {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(u8::from(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Flag {
            Bool(bool),
            Int(i64),
        }
        Ok(match Flag::deserialize(deserializer)? {
            Flag::Bool(b) => b,
            Flag::Int(i) => i != 0,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    Ack,
    Nak,
}

/// Receiver answer to a configuration frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckRecord {
    pub kind: AckKind,
    /// Class of the acknowledged message
    pub class: u8,
    /// Id of the acknowledged message
    pub id: u8,
}

impl AckRecord {
    /// True if this is a positive acknowledgement of `class`/`id`.
    pub fn acknowledges(&self, class: u8, id: u8) -> bool {
        self.kind == AckKind::Ack && self.concerns(class, id)
    }

    /// True if this answer, positive or not, refers to `class`/`id`.
    pub fn concerns(&self, class: u8, id: u8) -> bool {
        self.class == class && self.id == id
    }
}

impl std::fmt::Display for AckRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let kind = match self.kind {
            AckKind::Ack => "ACK",
            AckKind::Nak => "NAK",
        };
        write!(f, "{kind} clsID={:#04x}, msgID={:#04x}", self.class, self.id)
    }
}

/// UTC calendar time with its signed nanosecond correction.
///
/// `nano` may be negative: the instant is the calendar second plus `nano`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtcTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub nano: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PvtValidity {
    #[serde(rename = "validDate", with = "flag")]
    pub valid_date: bool,
    #[serde(rename = "validTime", with = "flag")]
    pub valid_time: bool,
    #[serde(rename = "fullyResolved", with = "flag")]
    pub fully_resolved: bool,
    #[serde(rename = "validMag", with = "flag")]
    pub valid_mag: bool,
}

impl PvtValidity {
    fn from_bits(bits: u8) -> Self {
        Self {
            valid_date: bits & 0x01 != 0,
            valid_time: bits & 0x02 != 0,
            fully_resolved: bits & 0x04 != 0,
            valid_mag: bits & 0x08 != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PvtFlags {
    #[serde(rename = "gnssFixOK", with = "flag")]
    pub gnss_fix_ok: bool,
    #[serde(rename = "diffSoln", with = "flag")]
    pub diff_soln: bool,
    #[serde(rename = "carrSoln")]
    pub carr_soln: u8,
}

/// UBX-NAV-PVT: navigation position velocity time solution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NavPvt {
    #[serde(rename = "iTOW")]
    pub itow: u32,
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    #[serde(rename = "min")]
    pub minute: u8,
    #[serde(rename = "sec")]
    pub second: u8,
    pub valid: PvtValidity,
    /// Time accuracy estimate (ns)
    #[serde(rename = "tAcc")]
    pub t_acc: u32,
    /// Fraction of second, range -1e9 .. 1e9 (ns)
    pub nano: i32,
    #[serde(rename = "fixType")]
    pub fix_type: u8,
    pub flags: PvtFlags,
    #[serde(rename = "numSV")]
    pub num_sv: u8,
    /// Longitude (deg * 1e-7)
    pub lon: i32,
    /// Latitude (deg * 1e-7)
    pub lat: i32,
    /// Height above ellipsoid (mm)
    pub height: i32,
    /// Height above mean sea level (mm)
    #[serde(rename = "hMSL")]
    pub h_msl: i32,
    /// Horizontal accuracy estimate (mm)
    #[serde(rename = "hAcc")]
    pub h_acc: u32,
    /// Vertical accuracy estimate (mm)
    #[serde(rename = "vAcc")]
    pub v_acc: u32,
    /// NED north velocity (mm/s)
    #[serde(rename = "velN")]
    pub vel_n: i32,
    #[serde(rename = "velE")]
    pub vel_e: i32,
    #[serde(rename = "velD")]
    pub vel_d: i32,
    /// Ground speed, 2-D (mm/s)
    #[serde(rename = "gSpeed")]
    pub g_speed: i32,
    /// Heading of motion (deg * 1e-5)
    #[serde(rename = "headMot")]
    pub head_mot: i32,
    /// Speed accuracy estimate (mm/s)
    #[serde(rename = "sAcc")]
    pub s_acc: u32,
    #[serde(rename = "headAcc")]
    pub head_acc: u32,
    /// Position DOP (* 0.01)
    #[serde(rename = "pDOP")]
    pub p_dop: u16,
}

impl NavPvt {
    pub fn decode(payload: &[u8]) -> Result<Self, FrameError> {
        check_len(UBX_CLASS_NAV, UBX_NAV_PVT, payload, NAV_PVT_MIN_LEN)?;
        let p = payload;
        Ok(Self {
            itow: LittleEndian::read_u32(&p[0..4]),
            year: LittleEndian::read_u16(&p[4..6]),
            month: p[6],
            day: p[7],
            hour: p[8],
            minute: p[9],
            second: p[10],
            valid: PvtValidity::from_bits(p[11]),
            t_acc: LittleEndian::read_u32(&p[12..16]),
            nano: LittleEndian::read_i32(&p[16..20]),
            fix_type: p[20],
            flags: PvtFlags {
                gnss_fix_ok: p[21] & 0x01 != 0,
                diff_soln: p[21] & 0x02 != 0,
                carr_soln: p[21] >> 6,
            },
            num_sv: p[23],
            lon: LittleEndian::read_i32(&p[24..28]),
            lat: LittleEndian::read_i32(&p[28..32]),
            height: LittleEndian::read_i32(&p[32..36]),
            h_msl: LittleEndian::read_i32(&p[36..40]),
            h_acc: LittleEndian::read_u32(&p[40..44]),
            v_acc: LittleEndian::read_u32(&p[44..48]),
            vel_n: LittleEndian::read_i32(&p[48..52]),
            vel_e: LittleEndian::read_i32(&p[52..56]),
            vel_d: LittleEndian::read_i32(&p[56..60]),
            g_speed: LittleEndian::read_i32(&p[60..64]),
            head_mot: LittleEndian::read_i32(&p[64..68]),
            s_acc: LittleEndian::read_u32(&p[68..72]),
            head_acc: LittleEndian::read_u32(&p[72..76]),
            p_dop: LittleEndian::read_u16(&p[76..78]),
        })
    }

    /// UTC time of the solution, if the receiver flagged it valid.
    pub fn utc_time(&self) -> Option<UtcTime> {
        self.valid.valid_time.then_some(UtcTime {
            year: self.year,
            month: self.month,
            day: self.day,
            hour: self.hour,
            minute: self.minute,
            second: self.second,
            nano: self.nano,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeUtcValidity {
    #[serde(rename = "validTOW", with = "flag")]
    pub valid_tow: bool,
    #[serde(rename = "validWKN", with = "flag")]
    pub valid_wkn: bool,
    #[serde(rename = "validUTC", with = "flag")]
    pub valid_utc: bool,
    #[serde(rename = "utcStandard")]
    pub utc_standard: u8,
}

/// UBX-NAV-TIMEUTC: UTC time solution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NavTimeUtc {
    #[serde(rename = "iTOW")]
    pub itow: u32,
    #[serde(rename = "tAcc")]
    pub t_acc: u32,
    pub nano: i32,
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    #[serde(rename = "min")]
    pub minute: u8,
    #[serde(rename = "sec")]
    pub second: u8,
    pub valid: TimeUtcValidity,
}

impl NavTimeUtc {
    pub fn decode(payload: &[u8]) -> Result<Self, FrameError> {
        check_len(UBX_CLASS_NAV, UBX_NAV_TIMEUTC, payload, NAV_TIMEUTC_LEN)?;
        let p = payload;
        Ok(Self {
            itow: LittleEndian::read_u32(&p[0..4]),
            t_acc: LittleEndian::read_u32(&p[4..8]),
            nano: LittleEndian::read_i32(&p[8..12]),
            year: LittleEndian::read_u16(&p[12..14]),
            month: p[14],
            day: p[15],
            hour: p[16],
            minute: p[17],
            second: p[18],
            valid: TimeUtcValidity {
                valid_tow: p[19] & 0x01 != 0,
                valid_wkn: p[19] & 0x02 != 0,
                valid_utc: p[19] & 0x04 != 0,
                utc_standard: p[19] >> 4,
            },
        })
    }

    pub fn utc_time(&self) -> Option<UtcTime> {
        self.valid.valid_utc.then_some(UtcTime {
            year: self.year,
            month: self.month,
            day: self.day,
            hour: self.hour,
            minute: self.minute,
            second: self.second,
            nano: self.nano,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HpPosFlags {
    #[serde(rename = "invalidLlh", with = "flag")]
    pub invalid_llh: bool,
}

/// UBX-NAV-HPPOSLLH: high precision geodetic position.
///
/// Each `*_hp` term extends its base field: latitude in degrees is
/// `(lat + lat_hp * 1e-2) * 1e-7`, height in mm is `h_msl + h_msl_hp * 0.1`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NavHpPosLlh {
    pub version: u8,
    pub flags: HpPosFlags,
    #[serde(rename = "iTOW")]
    pub itow: u32,
    pub lon: i32,
    pub lat: i32,
    pub height: i32,
    #[serde(rename = "hMSL")]
    pub h_msl: i32,
    #[serde(rename = "lonHp")]
    pub lon_hp: i8,
    #[serde(rename = "latHp")]
    pub lat_hp: i8,
    #[serde(rename = "heightHp")]
    pub height_hp: i8,
    #[serde(rename = "hMSLHp")]
    pub h_msl_hp: i8,
    /// Horizontal accuracy estimate
    #[serde(rename = "hAcc")]
    pub h_acc: u32,
    #[serde(rename = "vAcc")]
    pub v_acc: u32,
}

impl NavHpPosLlh {
    pub fn decode(payload: &[u8]) -> Result<Self, FrameError> {
        check_len(UBX_CLASS_NAV, UBX_NAV_HPPOSLLH, payload, NAV_HPPOSLLH_LEN)?;
        let p = payload;
        Ok(Self {
            version: p[0],
            flags: HpPosFlags {
                invalid_llh: p[3] & 0x01 != 0,
            },
            itow: LittleEndian::read_u32(&p[4..8]),
            lon: LittleEndian::read_i32(&p[8..12]),
            lat: LittleEndian::read_i32(&p[12..16]),
            height: LittleEndian::read_i32(&p[16..20]),
            h_msl: LittleEndian::read_i32(&p[20..24]),
            lon_hp: p[24] as i8,
            lat_hp: p[25] as i8,
            height_hp: p[26] as i8,
            h_msl_hp: p[27] as i8,
            h_acc: LittleEndian::read_u32(&p[28..32]),
            v_acc: LittleEndian::read_u32(&p[32..36]),
        })
    }
}

/// A navigation message as consumed by the fusion engine.
#[derive(Debug, Clone, PartialEq)]
pub enum NavRecord {
    Pvt(NavPvt),
    TimeUtc(NavTimeUtc),
    HpPosLlh(NavHpPosLlh),
    /// Any other navigation message. Its time of week is kept when known, as
    /// it still marks the start of a new navigation epoch.
    Other { name: String, itow: Option<u32> },
}

impl NavRecord {
    /// Short type name, as used in the `type` field of log entries.
    pub fn name(&self) -> &str {
        match self {
            Self::Pvt(_) => "PVT",
            Self::TimeUtc(_) => "TIMEUTC",
            Self::HpPosLlh(_) => "HPPOSLLH",
            Self::Other { name, .. } => name,
        }
    }

    /// GPS time of week of the navigation epoch (ms).
    pub fn itow(&self) -> Option<u32> {
        match self {
            Self::Pvt(pvt) => Some(pvt.itow),
            Self::TimeUtc(time) => Some(time.itow),
            Self::HpPosLlh(pos) => Some(pos.itow),
            Self::Other { itow, .. } => *itow,
        }
    }
}

/// Any decoded UBX frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Ack(AckRecord),
    Nav(NavRecord),
    Other { class: u8, id: u8 },
}

impl Message {
    pub fn decode(frame: &Frame) -> Result<Self, FrameError> {
        let p = &frame.payload;
        Ok(match (frame.class, frame.id) {
            (UBX_CLASS_ACK, UBX_ACK_ACK | UBX_ACK_NAK) => {
                check_len(frame.class, frame.id, p, 2)?;
                let kind = if frame.id == UBX_ACK_ACK { AckKind::Ack } else { AckKind::Nak };
                Self::Ack(AckRecord { kind, class: p[0], id: p[1] })
            }
            (UBX_CLASS_NAV, UBX_NAV_PVT) => Self::Nav(NavRecord::Pvt(NavPvt::decode(p)?)),
            (UBX_CLASS_NAV, UBX_NAV_TIMEUTC) => Self::Nav(NavRecord::TimeUtc(NavTimeUtc::decode(p)?)),
            (UBX_CLASS_NAV, UBX_NAV_HPPOSLLH) => {
                Self::Nav(NavRecord::HpPosLlh(NavHpPosLlh::decode(p)?))
            }
            // almost every NAV message starts with iTOW
            (UBX_CLASS_NAV, id) => Self::Nav(NavRecord::Other {
                name: format!("NAV-{id:02X}"),
                itow: (p.len() >= 4).then(|| LittleEndian::read_u32(&p[0..4])),
            }),
            (class, id) => Self::Other { class, id },
        })
    }
}

/// Reads `reader` until `stop` is raised, handing every navigation record
/// over to `handle`.
///
/// Other messages and corrupt frames are dropped. Read errors are logged and
/// reading goes on; only `handle` can end the loop with an error. `stop` is
/// checked after every record.
pub fn read_nav_records<R, F>(mut reader: R, stop: &AtomicBool, mut handle: F) -> crate::Result<()>
where
    R: Read,
    F: FnMut(NavRecord) -> crate::Result<()>,
{
    let mut parser = FrameParser::new();
    let mut buffer = [0u8; 1024];
    while !stop.load(Ordering::Relaxed) {
        match reader.read(&mut buffer) {
            Ok(0) => continue,
            Ok(n) => parser.push(&buffer[..n]),
            Err(err) if err.kind() == ErrorKind::TimedOut => {
                debug!("no data before read timeout");
                continue;
            }
            Err(err) => {
                debug!("read error: {err}");
                thread::sleep(READ_ERROR_BACKOFF);
                continue;
            }
        }
        for frame in parser.by_ref() {
            match Message::decode(&frame) {
                Ok(Message::Nav(record)) => handle(record)?,
                Ok(_) => {}
                Err(err) => debug!("ignoring frame: {err}"),
            }
            if stop.load(Ordering::Relaxed) {
                break;
            }
        }
    }
    Ok(())
}

fn check_len(class: u8, id: u8, payload: &[u8], min: usize) -> Result<(), FrameError> {
    if payload.len() < min {
        return Err(FrameError::ShortPayload { class, id, len: payload.len() });
    }
    Ok(())
}

//! Device orientation values and the windows they are matched against.

use std::fmt;
use std::str::FromStr;

use crate::error::{Axis, InvalidInput};

/// A single orientation reading, in whole degrees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DeviceOrientation {
    pub azimuth: i32,
    pub pitch: i32,
    pub roll: i32,
}

/// An orientation window: a center plus a per-axis tolerance.
///
/// Two ranges are the same *range group* iff they are equal field by field.
/// Lock conflicts are only ever detected within a group, so distinct but
/// overlapping windows never contend with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OrientationRange {
    pub center: DeviceOrientation,
    pub azimuth_tolerance: u32,
    pub pitch_tolerance: u32,
    pub roll_tolerance: u32,
}

impl DeviceOrientation {
    /// Size of the wire encoding accepted by [decode](Self::decode).
    pub const ENCODED_LEN: usize = 12;

    pub const fn new(azimuth: i32, pitch: i32, roll: i32) -> Self {
        Self {
            azimuth,
            pitch,
            roll,
        }
    }

    /// Decodes three little-endian `i32`s: azimuth, pitch, roll.
    pub fn decode(bytes: &[u8]) -> Result<Self, InvalidInput> {
        let [azimuth, pitch, roll] = read_i32s::<3>(bytes)?;
        Ok(Self::new(azimuth, pitch, roll))
    }

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0; Self::ENCODED_LEN];
        let values = [self.azimuth, self.pitch, self.roll];
        for (chunk, value) in out.chunks_exact_mut(4).zip(values) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        out
    }
}

impl fmt::Display for DeviceOrientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "azimuth={} pitch={} roll={}",
            self.azimuth, self.pitch, self.roll
        )
    }
}

impl FromStr for DeviceOrientation {
    type Err = InvalidInput;

    /// Parses `"azimuth pitch roll"`; commas and whitespace both separate.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || InvalidInput::Malformed(s.to_owned());
        let mut fields = s
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|field| !field.is_empty())
            .map(|field| field.parse::<i32>().map_err(|_| malformed()));
        let mut next = || fields.next().unwrap_or_else(|| Err(malformed()));
        let orientation = Self::new(next()?, next()?, next()?);
        if fields.next().is_some() {
            return Err(malformed());
        }
        Ok(orientation)
    }
}

impl OrientationRange {
    /// Size of the wire encoding accepted by [decode](Self::decode).
    pub const ENCODED_LEN: usize = 24;

    pub const fn new(
        center: DeviceOrientation,
        azimuth_tolerance: u32,
        pitch_tolerance: u32,
        roll_tolerance: u32,
    ) -> Self {
        Self {
            center,
            azimuth_tolerance,
            pitch_tolerance,
            roll_tolerance,
        }
    }

    /// Whether `orientation` lies inside this window on every axis.
    ///
    /// Both edges are inclusive. The window is linear: an azimuth of 359 is
    /// not considered close to 0.
    pub fn contains(&self, orientation: DeviceOrientation) -> bool {
        axis_in_window(self.center.azimuth, self.azimuth_tolerance, orientation.azimuth)
            && axis_in_window(self.center.pitch, self.pitch_tolerance, orientation.pitch)
            && axis_in_window(self.center.roll, self.roll_tolerance, orientation.roll)
    }

    /// Decodes the center (see [DeviceOrientation::decode]) followed by the
    /// azimuth, pitch and roll tolerances as little-endian `i32`s.
    pub fn decode(bytes: &[u8]) -> Result<Self, InvalidInput> {
        let [azimuth, pitch, roll, azimuth_tolerance, pitch_tolerance, roll_tolerance] =
            read_i32s::<6>(bytes)?;
        Ok(Self::new(
            DeviceOrientation::new(azimuth, pitch, roll),
            tolerance(Axis::Azimuth, azimuth_tolerance)?,
            tolerance(Axis::Pitch, pitch_tolerance)?,
            tolerance(Axis::Roll, roll_tolerance)?,
        ))
    }
}

fn axis_in_window(center: i32, tolerance: u32, value: i32) -> bool {
    let (center, tolerance, value) = (i64::from(center), i64::from(tolerance), i64::from(value));
    center - tolerance <= value && value <= center + tolerance
}

fn tolerance(axis: Axis, value: i32) -> Result<u32, InvalidInput> {
    u32::try_from(value).map_err(|_| InvalidInput::NegativeTolerance { axis, value })
}

fn read_i32s<const N: usize>(bytes: &[u8]) -> Result<[i32; N], InvalidInput> {
    if bytes.len() != N * 4 {
        return Err(InvalidInput::Length {
            expected: N * 4,
            actual: bytes.len(),
        });
    }
    let mut out = [0; N];
    for (value, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
        *value = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    Ok(out)
}

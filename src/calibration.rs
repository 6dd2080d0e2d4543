//! Per-axis magnetometer calibration.
//!
//! Magnetometer readings are not centered around zero; hard-iron distortion
//! shifts every axis by a different offset. Calibration records the min/max
//! raw value seen on each axis while the sensor is rotated through all of
//! its orientations, and steady-state sampling then maps a raw reading to
//! `[-1, 1]`: subtract the range midpoint (the bias), divide by the half
//! range. A range whose min and max are equal would divide by zero, so it
//! is rejected everywhere a range can enter a [`Calibration`].

use std::collections::HashMap;

use thiserror::Error;

/// Sensor axis, for error reporting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
    Z,
}

/// A degenerate axis range (`min >= max`); scaling it would divide by zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("degenerate calibration on {axis:?} axis: min {min} >= max {max}")]
pub struct CalibrationError {
    pub axis: Axis,
    pub min: i16,
    pub max: i16,
}

/// Raw-count bounds for one axis. Invariant: `min < max`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AxisRange {
    pub min: i16,
    pub max: i16,
}

impl AxisRange {
    fn validate(self, axis: Axis) -> Result<(), CalibrationError> {
        if self.min >= self.max {
            return Err(CalibrationError {
                axis,
                min: self.min,
                max: self.max,
            });
        }
        Ok(())
    }

    /// Range midpoint, the hard-iron offset for this axis.
    pub fn bias(self) -> f32 {
        (f32::from(self.min) + f32::from(self.max)) / 2.0
    }

    /// Map a raw reading to `[-1, 1]`: bias out the midpoint, then scale by
    /// the half range. A reading at `min` comes out exactly -1, at `max`
    /// exactly +1.
    pub fn scale(self, raw: i16) -> f32 {
        let debiased = f32::from(raw) - self.bias();
        debiased / (f32::from(self.max) - f32::from(self.min)) * 2.0
    }
}

/// Min/max calibration for all three axes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Calibration {
    pub x: AxisRange,
    pub y: AxisRange,
    pub z: AxisRange,
}

impl Default for Calibration {
    /// Bench calibration of the reference robot, December 2017.
    fn default() -> Self {
        Calibration {
            x: AxisRange { min: -566, max: 651 },
            y: AxisRange { min: -685, max: 526 },
            z: AxisRange { min: -447, max: 684 },
        }
    }
}

/// Settings section and keys, matching the robot's INI layout.
const SECTION: &str = "HMC5883L";
const KEYS: [(&str, &str, Axis); 3] = [
    ("minX", "maxX", Axis::X),
    ("minY", "maxY", Axis::Y),
    ("minZ", "maxZ", Axis::Z),
];

impl Calibration {
    pub fn new(x: AxisRange, y: AxisRange, z: AxisRange) -> Result<Self, CalibrationError> {
        let cal = Calibration { x, y, z };
        cal.validate()?;
        Ok(cal)
    }

    pub fn validate(&self) -> Result<(), CalibrationError> {
        self.x.validate(Axis::X)?;
        self.y.validate(Axis::Y)?;
        self.z.validate(Axis::Z)?;
        Ok(())
    }

    fn range(&self, axis: Axis) -> AxisRange {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
        }
    }

    fn range_mut(&mut self, axis: Axis) -> &mut AxisRange {
        match axis {
            Axis::X => &mut self.x,
            Axis::Y => &mut self.y,
            Axis::Z => &mut self.z,
        }
    }

    /// Overlay values from a settings store on top of `self`. Keys that are
    /// absent keep their current value; the merged result is validated
    /// before it replaces anything.
    pub fn load(&self, settings: &dyn Settings) -> Result<Self, CalibrationError> {
        let mut merged = *self;
        for &(min_key, max_key, axis) in &KEYS {
            let range = merged.range_mut(axis);
            if let Some(v) = settings.get(SECTION, min_key) {
                range.min = v as i16;
            }
            if let Some(v) = settings.get(SECTION, max_key) {
                range.max = v as i16;
            }
        }
        merged.validate()?;
        Ok(merged)
    }

    pub fn save(&self, settings: &mut dyn Settings) {
        for &(min_key, max_key, axis) in &KEYS {
            let range = self.range(axis);
            settings.put(SECTION, min_key, f64::from(range.min));
            settings.put(SECTION, max_key, f64::from(range.max));
        }
    }
}

/// Key-value settings store, the shape of the robot's INI loader. The file
/// format itself is the framework's business.
pub trait Settings {
    fn get(&self, section: &str, key: &str) -> Option<f64>;
    fn put(&mut self, section: &str, key: &str, value: f64);
}

/// In-memory settings store.
#[derive(Default)]
pub struct MemorySettings {
    values: HashMap<(String, String), f64>,
}

impl Settings for MemorySettings {
    fn get(&self, section: &str, key: &str) -> Option<f64> {
        self.values
            .get(&(section.to_string(), key.to_string()))
            .copied()
    }

    fn put(&mut self, section: &str, key: &str, value: f64) {
        self.values
            .insert((section.to_string(), key.to_string()), value);
    }
}

fn track(range: &mut AxisRange, v: i16) {
    if v < range.min {
        range.min = v;
    }
    if v > range.max {
        range.max = v;
    }
}

/// Running min/max over raw samples, used by the calibration procedure.
#[derive(Clone, Copy, Debug, Default)]
pub struct RangeTracker {
    seen: Option<Calibration>,
}

impl RangeTracker {
    pub fn new() -> Self {
        RangeTracker::default()
    }

    pub fn observe(&mut self, x: i16, y: i16, z: i16) {
        match self.seen.as_mut() {
            None => {
                self.seen = Some(Calibration {
                    x: AxisRange { min: x, max: x },
                    y: AxisRange { min: y, max: y },
                    z: AxisRange { min: z, max: z },
                });
            }
            Some(cal) => {
                track(&mut cal.x, x);
                track(&mut cal.y, y);
                track(&mut cal.z, z);
            }
        }
    }

    /// The tracked ranges as a calibration. An axis that never moved (or no
    /// samples at all) is degenerate and rejected.
    pub fn into_calibration(self) -> Result<Calibration, CalibrationError> {
        let cal = self.seen.unwrap_or(Calibration {
            x: AxisRange { min: 0, max: 0 },
            y: AxisRange { min: 0, max: 0 },
            z: AxisRange { min: 0, max: 0 },
        });
        cal.validate()?;
        Ok(cal)
    }
}

//! # magwalk
//!
//! Compass heading and closed-loop turning for a small bipedal robot.
//!
//! The crate has two halves:
//!
//! - [`hmc5883l`]: a driver for the HMC5883L 3-axis magnetometer on an I2C
//!   bus. It owns the per-axis min/max calibration, turns raw field samples
//!   into a declination-corrected compass [`Heading`], and can project the
//!   field onto the horizontal plane when roll/pitch are known (the bare
//!   X/Y heading is useless once the sensor tilts).
//! - [`turn`]: a blocking turn controller that walks the robot around to a
//!   relative or absolute compass bearing, one heading poll per tick,
//!   standing the robot back up and resuming if it falls over mid-turn.
//!
//! The gait engine, fall detector and stand-up player live in the robot
//! framework; the controller only talks to them through the traits in
//! [`turn`], so everything here runs against fakes in tests.

pub mod calibration;
pub mod hmc5883l;
pub mod turn;

pub use crate::calibration::{Axis, AxisRange, Calibration, Settings};
pub use crate::hmc5883l::{Error, Hmc5883l};
pub use crate::turn::{TurnController, TurnOutcome};

use std::f32::consts::PI;

/// A 3-axis f32 vector, e.g. a scaled magnetic field sample.
#[derive(Clone, Copy, Debug)]
pub struct V {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// A compass heading, stored in radians and always wrapped to `[0, 2*PI)`.
///
/// Built from `atan2` output plus a declination constant, so the raw value
/// can only be off by one turn in either direction. The constructor wraps
/// with two conditional corrections rather than a modulo; at the sample
/// rates involved the heading never moves further than that between polls,
/// and the conditionals keep the exact rounding of the original firmware
/// at the 0/2*PI boundary.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Heading {
    radians: f32,
}

impl Heading {
    /// Wrap a raw angle (radians, within one turn of range) into `[0, 2*PI)`.
    pub fn from_radians(raw: f32) -> Self {
        let mut rad = raw;
        if rad < 0.0 {
            rad += 2.0 * PI;
        }
        if rad > 2.0 * PI {
            rad -= 2.0 * PI;
        }
        Heading { radians: rad }
    }

    pub fn radians(self) -> f32 {
        self.radians
    }

    pub fn degrees(self) -> f32 {
        self.radians * 180.0 / PI
    }

    /// Whole degrees, i.e. `degrees()` floored, with the arc-minute carry
    /// applied (see [`minutes`](Heading::minutes)).
    pub fn whole_degrees(self) -> f32 {
        self.degrees_and_minutes().0
    }

    /// The fractional-degree remainder as arc-minutes, rounded to nearest,
    /// in `[0, 60)`. A remainder that rounds up to a full degree carries
    /// into the degree count instead of reporting 60.
    pub fn minutes(self) -> f32 {
        self.degrees_and_minutes().1
    }

    fn degrees_and_minutes(self) -> (f32, f32) {
        let degrees = self.degrees();
        let mut whole = degrees.floor();
        let mut minutes = ((degrees - whole) * 60.0).round();
        if minutes >= 60.0 {
            minutes = 0.0;
            whole += 1.0;
        }
        if whole >= 360.0 {
            whole = 0.0;
        }
        (whole, minutes)
    }
}

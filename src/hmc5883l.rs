//! HMC5883L 3-axis magnetometer driver.
//!
//! The sensor sits on the robot's I2C bus at address 0x1E. The driver is
//! generic over the `embedded-hal` blocking I2C traits, so on the robot it
//! runs against `linux_embedded_hal::I2cdev` and in tests against a scripted
//! mock bus.
//!
//! A poll is one register-select write followed by a 6-byte read of the data
//! registers. The device interleaves its axes as X, Z, Y, each big-endian
//! two's-complement. The raw counts are mapped through the min/max
//! calibration to `[-1, 1]` per axis, and the heading is
//! `atan2(scaled_y, scaled_x)` plus the local magnetic declination, wrapped
//! into `[0, 2*PI)`.
//!
//! A failed data read surfaces as [`Error::Read`]; the driver never hands
//! back a stale heading from `poll`. Callers on the control loop skip that
//! tick and try again on the next one.

use core::fmt::Debug;
use std::f32::consts::PI;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::i2c::{Read, Write};
use log::{debug, info, warn};
use thiserror::Error;

use crate::calibration::{Calibration, CalibrationError, RangeTracker};
use crate::{Heading, V};

/// Fixed device address. `i2cdetect -y 1` shows the sensor at 0x1E.
pub const I2C_ADDR: u8 = 0x1E;

/// Configuration register B: gain control.
const REG_CONFIG_B: u8 = 0x01;
/// Mode register.
const REG_MODE: u8 = 0x02;
/// First data output register (X high byte).
const REG_DATA: u8 = 0x03;

/// 820 LSb/Gauss, 1.22 mG/LSb.
const GAIN_820_LSB_PER_GAUSS: u8 = 0x20;
/// Continuous-measurement mode.
const MODE_CONTINUOUS: u8 = 0x00;

/// Magnetic declination of the reference site, 0 degrees 35 minutes east.
pub const DEFAULT_DECLINATION: f32 = (35.0 / 60.0) * (PI / 180.0);

/// Calibration acquisition rate: 10 Hz.
const CALIBRATION_POLL_MS: u16 = 100;

/// Threshold below which a horizontal field projection is treated as
/// unresolvable rather than normalized into garbage.
const MIN_PROJECTION: f32 = 1e-6;

/// Driver-level errors, generic over the bus error type.
#[derive(Debug, Error)]
pub enum Error<E: Debug> {
    /// Bus failure while configuring the device. The sensor is absent or
    /// unresponsive; there is no in-process recovery.
    #[error("failed to configure HMC5883L: {0:?}")]
    Init(E),
    /// Bus failure while reading the data registers. Transient; skip the
    /// tick and poll again.
    #[error("failed to read HMC5883L data registers: {0:?}")]
    Read(E),
    /// A calibration range with `min >= max` was supplied or measured.
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
    /// The tilt-compensated field projection was too close to zero to
    /// normalize.
    #[error("magnetic field projection too small to resolve a direction")]
    IndeterminateHeading,
    /// Tilt compensation was requested before any successful poll.
    #[error("no magnetometer sample polled yet")]
    NoSample,
}

/// One raw field sample, fresh off the data registers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawField {
    pub x: i16,
    pub y: i16,
    pub z: i16,
}

impl RawField {
    /// Assemble from the 6 data-register bytes. Axis order on the wire is
    /// X, Z, Y (not X, Y, Z), high byte first.
    pub fn from_registers(buf: &[u8; 6]) -> Self {
        RawField {
            x: i16::from_be_bytes([buf[0], buf[1]]),
            z: i16::from_be_bytes([buf[2], buf[3]]),
            y: i16::from_be_bytes([buf[4], buf[5]]),
        }
    }
}

/// Unit-vector components of the tilt-compensated field direction.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TiltHeading {
    pub x: f32,
    pub y: f32,
}

/// The magnetometer. One instance owns the bus handle for the life of the
/// process; consumers take it by reference rather than through a global.
pub struct Hmc5883l<I2C> {
    i2c: I2C,
    calibration: Calibration,
    declination: f32,
    scaled: Option<V>,
    heading: Option<Heading>,
}

impl<I2C, E> Hmc5883l<I2C>
where
    I2C: Write<Error = E> + Read<Error = E>,
    E: Debug,
{
    /// Validate the calibration and configure the device: gain to
    /// 820 LSb/Gauss, continuous-measurement mode. A bus failure here means
    /// the sensor is not answering at 0x1E; the caller should give up, not
    /// retry.
    pub fn new(i2c: I2C, calibration: Calibration, declination: f32) -> Result<Self, Error<E>> {
        calibration.validate()?;
        let mut driver = Hmc5883l {
            i2c,
            calibration,
            declination,
            scaled: None,
            heading: None,
        };
        driver.write_register(REG_CONFIG_B, GAIN_820_LSB_PER_GAUSS)?;
        driver.write_register(REG_MODE, MODE_CONTINUOUS)?;
        info!("HMC5883L configured at 0x{:02X}", I2C_ADDR);
        Ok(driver)
    }

    /// `new` with the bench calibration and reference-site declination.
    pub fn with_defaults(i2c: I2C) -> Result<Self, Error<E>> {
        Hmc5883l::new(i2c, Calibration::default(), DEFAULT_DECLINATION)
    }

    fn write_register(&mut self, reg: u8, value: u8) -> Result<(), Error<E>> {
        self.i2c.write(I2C_ADDR, &[reg, value]).map_err(Error::Init)
    }

    /// Read one raw sample from the data registers.
    pub fn read_raw(&mut self) -> Result<RawField, Error<E>> {
        self.i2c.write(I2C_ADDR, &[REG_DATA]).map_err(Error::Read)?;
        let mut buf = [0u8; 6];
        self.i2c.read(I2C_ADDR, &mut buf).map_err(Error::Read)?;
        Ok(RawField::from_registers(&buf))
    }

    /// Take a fresh sample and compute the compass heading from the
    /// horizontal (X/Y) components.
    pub fn poll(&mut self) -> Result<Heading, Error<E>> {
        let raw = self.read_raw()?;
        let scaled = V {
            x: self.calibration.x.scale(raw.x),
            y: self.calibration.y.scale(raw.y),
            z: self.calibration.z.scale(raw.z),
        };
        let heading = Heading::from_radians(scaled.y.atan2(scaled.x) + self.declination);
        debug!(
            "raw ({}, {}, {}) heading {:.1} deg",
            raw.x,
            raw.y,
            raw.z,
            heading.degrees()
        );
        self.scaled = Some(scaled);
        self.heading = Some(heading);
        Ok(heading)
    }

    /// Heading from the most recent successful poll, if any.
    pub fn heading(&self) -> Option<Heading> {
        self.heading
    }

    /// Project the last scaled sample onto the horizontal plane using
    /// roll/pitch (radians) from an accelerometer or gyro, and normalize.
    /// This is the heading to trust when the robot is not standing level.
    pub fn tilt_compensated(&self, roll: f32, pitch: f32) -> Result<TiltHeading, Error<E>> {
        let scaled = self.scaled.ok_or(Error::NoSample)?;

        let cos_roll = roll.cos();
        let sin_roll = roll.sin();
        let cos_pitch = pitch.cos();
        let sin_pitch = pitch.sin();

        let mag_x =
            scaled.x * cos_pitch + scaled.y * sin_roll * sin_pitch + scaled.z * cos_roll * sin_pitch;
        let mag_y = scaled.y * cos_roll - scaled.z * sin_roll;

        let norm = (mag_x * mag_x + mag_y * mag_y).sqrt();
        if norm < MIN_PROJECTION {
            return Err(Error::IndeterminateHeading);
        }
        Ok(TiltHeading {
            x: mag_x / norm,
            y: -mag_y / norm,
        })
    }

    /// Re-measure the min/max calibration: sample at 10 Hz for `seconds`,
    /// tracking the extremes per axis, while the operator rotates the robot
    /// through all of its orientations. On success the new calibration
    /// replaces the current one and is returned (save it with
    /// [`Calibration::save`] to keep it). An axis that never moved is a
    /// calibration error and the current calibration stays in place.
    ///
    /// Offline procedure; do not run it while a turn is in flight.
    pub fn calibrate<D: DelayMs<u16>>(
        &mut self,
        seconds: u16,
        delay: &mut D,
    ) -> Result<Calibration, Error<E>> {
        let mut tracker = RangeTracker::new();
        for _ in 0..u32::from(seconds) * 10 {
            match self.read_raw() {
                Ok(raw) => tracker.observe(raw.x, raw.y, raw.z),
                Err(e) => warn!("calibration sample dropped: {:?}", e),
            }
            delay.delay_ms(CALIBRATION_POLL_MS);
        }
        let calibration = tracker.into_calibration()?;
        info!(
            "calibrated: x {}..{}, y {}..{}, z {}..{}",
            calibration.x.min,
            calibration.x.max,
            calibration.y.min,
            calibration.y.max,
            calibration.z.min,
            calibration.z.max
        );
        self.calibration = calibration;
        Ok(calibration)
    }

    pub fn calibration(&self) -> Calibration {
        self.calibration
    }

    /// Replace the calibration, e.g. with values loaded from settings.
    pub fn set_calibration(&mut self, calibration: Calibration) -> Result<(), Error<E>> {
        calibration.validate()?;
        self.calibration = calibration;
        Ok(())
    }

    pub fn set_declination(&mut self, radians: f32) {
        self.declination = radians;
    }

    /// Release the bus handle.
    pub fn free(self) -> I2C {
        self.i2c
    }
}

impl<I2C, E> crate::turn::Compass for Hmc5883l<I2C>
where
    I2C: Write<Error = E> + Read<Error = E>,
    E: Debug,
{
    type Error = Error<E>;

    fn heading_degrees(&mut self) -> Result<f32, Self::Error> {
        Ok(self.poll()?.degrees())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{Axis, AxisRange};

    #[derive(Debug, PartialEq)]
    struct BusError;

    /// Scripted I2C bus: records writes, serves reads from a looping list
    /// of canned 6-byte frames.
    struct MockI2c {
        writes: Vec<Vec<u8>>,
        frames: Vec<[u8; 6]>,
        next_frame: usize,
        fail_reads: bool,
    }

    impl MockI2c {
        fn new(frames: Vec<[u8; 6]>) -> Self {
            MockI2c {
                writes: Vec::new(),
                frames,
                next_frame: 0,
                fail_reads: false,
            }
        }
    }

    impl Write for MockI2c {
        type Error = BusError;

        fn write(&mut self, addr: u8, bytes: &[u8]) -> Result<(), BusError> {
            assert_eq!(addr, I2C_ADDR);
            self.writes.push(bytes.to_vec());
            Ok(())
        }
    }

    impl Read for MockI2c {
        type Error = BusError;

        fn read(&mut self, addr: u8, buffer: &mut [u8]) -> Result<(), BusError> {
            assert_eq!(addr, I2C_ADDR);
            if self.fail_reads {
                return Err(BusError);
            }
            let frame = self.frames[self.next_frame % self.frames.len()];
            self.next_frame += 1;
            buffer.copy_from_slice(&frame[..buffer.len()]);
            Ok(())
        }
    }

    struct NoopDelay;

    impl DelayMs<u16> for NoopDelay {
        fn delay_ms(&mut self, _ms: u16) {}
    }

    /// Symmetric ranges make expected scaled values easy to read: bias 0,
    /// scale raw/100.
    fn symmetric_calibration() -> Calibration {
        let range = AxisRange { min: -100, max: 100 };
        Calibration { x: range, y: range, z: range }
    }

    fn frame(x: i16, z: i16, y: i16) -> [u8; 6] {
        let x = x.to_be_bytes();
        let z = z.to_be_bytes();
        let y = y.to_be_bytes();
        [x[0], x[1], z[0], z[1], y[0], y[1]]
    }

    #[test]
    fn init_writes_gain_and_mode() {
        let bus = MockI2c::new(vec![[0; 6]]);
        let driver = Hmc5883l::with_defaults(bus).unwrap();
        let bus = driver.free();
        assert_eq!(bus.writes, vec![vec![0x01, 0x20], vec![0x02, 0x00]]);
    }

    #[test]
    fn init_rejects_degenerate_calibration() {
        let bus = MockI2c::new(vec![[0; 6]]);
        let bad = Calibration {
            x: AxisRange { min: 5, max: 5 },
            ..Calibration::default()
        };
        match Hmc5883l::new(bus, bad, 0.0) {
            Err(Error::Calibration(e)) => assert_eq!(e.axis, Axis::X),
            other => panic!("expected calibration error, got {:?}", other.err()),
        }
    }

    #[test]
    fn poll_selects_data_register_and_unpacks_x_z_y() {
        let bus = MockI2c::new(vec![frame(-609, 684, 437)]);
        let mut driver =
            Hmc5883l::new(bus, symmetric_calibration(), 0.0).unwrap();
        let raw = driver.read_raw().unwrap();
        assert_eq!(raw, RawField { x: -609, y: 437, z: 684 });

        let bus = driver.free();
        // init writes, then the register select before the read
        assert_eq!(bus.writes.last().unwrap(), &vec![REG_DATA]);
    }

    #[test]
    fn poll_computes_wrapped_heading() {
        // scaled (1, 0): atan2 = 0, heading = declination only
        let bus = MockI2c::new(vec![frame(100, 0, 0)]);
        let mut driver =
            Hmc5883l::new(bus, symmetric_calibration(), 0.1).unwrap();
        let heading = driver.poll().unwrap();
        assert!((heading.radians() - 0.1).abs() < 1e-6);

        // scaled (0, -1): atan2 = -PI/2, wraps up past zero
        let bus = MockI2c::new(vec![frame(0, 0, -100)]);
        let mut driver =
            Hmc5883l::new(bus, symmetric_calibration(), 0.0).unwrap();
        let heading = driver.poll().unwrap();
        assert!((heading.radians() - 3.0 * PI / 2.0).abs() < 1e-5);
    }

    #[test]
    fn failed_read_is_an_error_not_a_stale_heading() {
        let bus = MockI2c::new(vec![frame(100, 0, 0)]);
        let mut driver =
            Hmc5883l::new(bus, symmetric_calibration(), 0.0).unwrap();
        let first = driver.poll().unwrap();

        driver.i2c.fail_reads = true;
        match driver.poll() {
            Err(Error::Read(BusError)) => {}
            other => panic!("expected read error, got {:?}", other),
        }
        // last-known-good stays readable, but only through the explicit
        // accessor
        assert_eq!(driver.heading(), Some(first));
    }

    #[test]
    fn tilt_compensation_level_matches_plain_heading_frame() {
        let bus = MockI2c::new(vec![frame(60, 0, 80)]);
        let mut driver =
            Hmc5883l::new(bus, symmetric_calibration(), 0.0).unwrap();
        driver.poll().unwrap();

        // roll = pitch = 0 projects straight through: (0.6, 0.8) normalized,
        // y negated.
        let dir = driver.tilt_compensated(0.0, 0.0).unwrap();
        assert!((dir.x - 0.6).abs() < 1e-6);
        assert!((dir.y - -0.8).abs() < 1e-6);
    }

    #[test]
    fn tilt_compensation_guards_zero_projection() {
        // field straight along Z: horizontal projection vanishes at level
        let bus = MockI2c::new(vec![frame(0, 100, 0)]);
        let mut driver =
            Hmc5883l::new(bus, symmetric_calibration(), 0.0).unwrap();
        driver.poll().unwrap();

        match driver.tilt_compensated(0.0, 0.0) {
            Err(Error::IndeterminateHeading) => {}
            other => panic!("expected indeterminate heading, got {:?}", other),
        }
    }

    #[test]
    fn tilt_compensation_requires_a_sample() {
        let bus = MockI2c::new(vec![[0; 6]]);
        let driver = Hmc5883l::with_defaults(bus).unwrap();
        match driver.tilt_compensated(0.0, 0.0) {
            Err(Error::NoSample) => {}
            other => panic!("expected NoSample, got {:?}", other),
        }
    }

    #[test]
    fn calibrate_replaces_ranges_from_observed_extremes() {
        let bus = MockI2c::new(vec![
            frame(-20, 7, -4),
            frame(10, 100, 3),
            frame(5, 40, 0),
        ]);
        let mut driver =
            Hmc5883l::new(bus, symmetric_calibration(), 0.0).unwrap();
        let cal = driver.calibrate(1, &mut NoopDelay).unwrap();
        assert_eq!(cal.x, AxisRange { min: -20, max: 10 });
        assert_eq!(cal.y, AxisRange { min: -4, max: 3 });
        assert_eq!(cal.z, AxisRange { min: 7, max: 100 });
        assert_eq!(driver.calibration(), cal);
    }

    #[test]
    fn calibrate_rejects_an_axis_that_never_moved() {
        // z pinned at 7 for the whole acquisition
        let bus = MockI2c::new(vec![frame(-20, 7, -4), frame(10, 7, 3)]);
        let mut driver =
            Hmc5883l::new(bus, symmetric_calibration(), 0.0).unwrap();
        let before = driver.calibration();
        match driver.calibrate(1, &mut NoopDelay) {
            Err(Error::Calibration(e)) => assert_eq!(e.axis, Axis::Z),
            other => panic!("expected calibration error, got {:?}", other.err()),
        }
        // the old calibration must survive a failed run
        assert_eq!(driver.calibration(), before);
    }
}

//! Closed-loop turning against the compass heading.
//!
//! The controller owns one turn at a time: it reads the heading, decides a
//! rotation direction, hands the gait engine an asymmetric turn amplitude,
//! and polls once per tick until the heading passes the target. If the
//! robot falls over mid-turn it parks the gait, plays the stand-up motion
//! for the fall direction, and resumes the same turn.
//!
//! The gait engine, fall detector and stand-up player are framework
//! collaborators reached through the [`Gait`], [`FallSignal`] and
//! [`Recovery`] traits. Headings come through [`Compass`], implemented by
//! the HMC5883L driver.
//!
//! The loop blocks its caller. It checks a cloneable [`CancelToken`] once
//! per tick, so a supervisor thread can always stop a turn whose target
//! never comes into reach.

use core::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use embedded_hal::blocking::delay::DelayMs;
use log::{debug, info, warn};

/// Gait stance and amplitude during a turn: lean back slightly, widen the
/// stance, rotate in place.
const TURN_X_OFFSET: f32 = -4.0;
const TURN_Y_OFFSET: f32 = 5.0;
const TURN_A_AMPLITUDE: f32 = 23.0;

const DEFAULT_TICK_MS: u16 = 500;
const DEFAULT_TOLERANCE_DEGREES: f32 = 10.0;
/// Pause either side of the stand-up motion.
const RECOVERY_SETTLE_MS: u16 = 10;
/// Let the last step finish before the gait module is disabled.
const STOP_SETTLE_MS: u16 = 1000;

/// Source of compass headings in degrees, `[0, 360)`. An error means this
/// tick's reading is unavailable; the controller skips the tick.
pub trait Compass {
    type Error: Debug;

    fn heading_degrees(&mut self) -> Result<f32, Self::Error>;
}

/// Amplitude and offset parameters accepted by the walking engine.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GaitParams {
    pub x_offset: f32,
    pub y_offset: f32,
    pub x_amplitude: f32,
    pub y_amplitude: f32,
    pub a_amplitude: f32,
}

impl GaitParams {
    pub const NEUTRAL: GaitParams = GaitParams {
        x_offset: 0.0,
        y_offset: 0.0,
        x_amplitude: 0.0,
        y_amplitude: 0.0,
        a_amplitude: 0.0,
    };
}

/// The walking engine, as seen from the turn loop. `attach` adds the
/// module to the framework's active set and recalibrates the gyro;
/// `detach` removes it. The controller assumes exclusive ownership of the
/// module between the two.
pub trait Gait {
    fn attach(&mut self);
    fn detach(&mut self);
    fn set_enabled(&mut self, enabled: bool);
    fn apply(&mut self, params: &GaitParams);
    fn start(&mut self);
    fn stop(&mut self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FallDirection {
    Forward,
    Backward,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MotionStatus {
    Standing,
    Fallen(FallDirection),
}

/// Fall detector, sampled once per tick.
pub trait FallSignal {
    fn status(&mut self) -> MotionStatus;
}

/// Plays the canned stand-up motion for a fall direction; blocks until the
/// robot is back on its feet.
pub trait Recovery {
    fn stand_up(&mut self, direction: FallDirection);
}

/// Clockwise means compass heading increasing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnDirection {
    Clockwise,
    CounterClockwise,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    Cancelled,
}

/// Cooperative stop flag, checked once per tick. Clone it out of the
/// controller and trip it from any thread; call [`reset`](CancelToken::reset)
/// before reusing the controller for another turn.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::Relaxed);
    }
}

/// Wrap a degree value (at most one turn out of range) into `[0, 360)`.
/// Exactly 360 folds to 0: a target of 360 would sit outside the range the
/// compass ever reports and the completion tests could never pass it.
pub fn wrap_degrees(degrees: f32) -> f32 {
    let mut deg = degrees;
    if deg < 0.0 {
        deg += 360.0;
    }
    if deg >= 360.0 {
        deg -= 360.0;
    }
    deg
}

/// Angular distance between two headings, the short way round.
pub fn wrapped_distance(a: f32, b: f32) -> f32 {
    let d = (a - b).abs() % 360.0;
    d.min(360.0 - d)
}

#[derive(Clone, Copy, Debug)]
enum Goal {
    /// Turn by an offset: track where we started so the completion test can
    /// tell whether the arc crosses the 0/360 boundary.
    Relative { initial: f32, target: f32 },
    /// Turn to a bearing, within tolerance.
    Absolute { target: f32 },
}

impl Goal {
    fn complete(self, current: f32, direction: TurnDirection, tolerance: f32) -> bool {
        match self {
            Goal::Relative { initial, target } => match direction {
                // A single `current > target` test fails exactly when the
                // arc crosses 0/360: the target re-enters below the initial
                // heading, so completion additionally requires that the
                // reading has wrapped past zero (dropped below the initial).
                TurnDirection::Clockwise => {
                    if target < initial {
                        current < initial && current > target
                    } else {
                        current > target
                    }
                }
                TurnDirection::CounterClockwise => {
                    if target > initial {
                        current > initial && current < target
                    } else {
                        current < target
                    }
                }
            },
            Goal::Absolute { target } => wrapped_distance(current, target) <= tolerance,
        }
    }
}

/// Blocking turn controller. Owns its collaborators; one turn in flight at
/// a time by construction (`&mut self`).
pub struct TurnController<C, G, F, R, D> {
    compass: C,
    gait: G,
    falls: F,
    recovery: R,
    delay: D,
    tick_ms: u16,
    tolerance_degrees: f32,
    cancel: CancelToken,
}

impl<C, G, F, R, D> TurnController<C, G, F, R, D>
where
    C: Compass,
    G: Gait,
    F: FallSignal,
    R: Recovery,
    D: DelayMs<u16>,
{
    pub fn new(compass: C, gait: G, falls: F, recovery: R, delay: D) -> Self {
        TurnController {
            compass,
            gait,
            falls,
            recovery,
            delay,
            tick_ms: DEFAULT_TICK_MS,
            tolerance_degrees: DEFAULT_TOLERANCE_DEGREES,
            cancel: CancelToken::new(),
        }
    }

    /// A handle that stops the in-flight turn at the next tick.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn set_tick_ms(&mut self, tick_ms: u16) {
        self.tick_ms = tick_ms;
    }

    pub fn set_tolerance_degrees(&mut self, tolerance: f32) {
        self.tolerance_degrees = tolerance;
    }

    /// Turn by `delta_degrees` relative to the current heading. Positive is
    /// clockwise. Blocks until the turn completes or is cancelled.
    ///
    /// `delta_degrees` must stay within one full turn; beyond that the
    /// single-correction wrap cannot bring the target back into `[0, 360)`.
    pub fn turn_relative(&mut self, delta_degrees: f32) -> Result<TurnOutcome, C::Error> {
        let initial = self.compass.heading_degrees()?;
        let direction = if delta_degrees >= 0.0 {
            TurnDirection::Clockwise
        } else {
            TurnDirection::CounterClockwise
        };
        let target = wrap_degrees(initial + delta_degrees);
        info!(
            "turn {:?} from {:.0} to {:.0} degrees",
            direction, initial, target
        );
        self.run(Goal::Relative { initial, target }, direction)
    }

    /// Turn to the compass bearing `target_degrees`, within the configured
    /// tolerance. Blocks until the turn completes or is cancelled.
    ///
    /// The rotation direction comes from the robot's long-standing
    /// heuristic: counter-clockwise when the plain (unwrapped) difference
    /// exceeds 180 degrees, clockwise otherwise. Near the 0/360 boundary
    /// this can pick the longer way round; kept as-is so the robot keeps
    /// turning the way it always has.
    pub fn turn_absolute(&mut self, target_degrees: f32) -> Result<TurnOutcome, C::Error> {
        let current = self.compass.heading_degrees()?;
        let target = wrap_degrees(target_degrees);
        let direction = if (current - target).abs() > 180.0 {
            TurnDirection::CounterClockwise
        } else {
            TurnDirection::Clockwise
        };
        info!(
            "turn {:?} from {:.0} to bearing {:.0} degrees",
            direction, current, target
        );
        self.run(Goal::Absolute { target }, direction)
    }

    fn run(&mut self, goal: Goal, direction: TurnDirection) -> Result<TurnOutcome, C::Error> {
        let params = turn_params(direction);
        self.engage(&params);

        let outcome = loop {
            if self.cancel.is_cancelled() {
                break TurnOutcome::Cancelled;
            }

            // fall handling must not depend on bus health, so the fall
            // signal is sampled before the heading poll
            if let MotionStatus::Fallen(fall) = self.falls.status() {
                info!("robot fell {:?}, standing up", fall);
                self.recover(fall, &params);
                continue;
            }

            let current = match self.compass.heading_degrees() {
                Ok(degrees) => degrees,
                Err(e) => {
                    warn!("heading unavailable this tick: {:?}", e);
                    self.delay.delay_ms(self.tick_ms);
                    continue;
                }
            };

            debug!("heading {:.1} degrees", current);
            if goal.complete(current, direction, self.tolerance_degrees) {
                break TurnOutcome::Completed;
            }
            self.delay.delay_ms(self.tick_ms);
        };

        self.disengage();
        info!("turn {:?}", outcome);
        Ok(outcome)
    }

    /// Hand the gait module the turn command and get it walking.
    fn engage(&mut self, params: &GaitParams) {
        self.gait.attach();
        self.gait.set_enabled(true);
        self.gait.apply(params);
        self.gait.start();
    }

    /// Park the gait, stand back up, re-issue the same turn command.
    fn recover(&mut self, fall: FallDirection, params: &GaitParams) {
        self.gait.stop();
        self.gait.apply(&GaitParams::NEUTRAL);
        self.gait.set_enabled(false);
        self.delay.delay_ms(RECOVERY_SETTLE_MS);
        self.recovery.stand_up(fall);
        self.delay.delay_ms(RECOVERY_SETTLE_MS);
        self.engage(params);
    }

    /// Common teardown for every exit path: stop walking, zero the
    /// parameters, let the last step settle, release the module.
    fn disengage(&mut self) {
        self.gait.stop();
        self.gait.apply(&GaitParams::NEUTRAL);
        self.delay.delay_ms(STOP_SETTLE_MS);
        self.gait.set_enabled(false);
        self.gait.detach();
    }
}

fn turn_params(direction: TurnDirection) -> GaitParams {
    let sign = match direction {
        TurnDirection::Clockwise => 1.0,
        TurnDirection::CounterClockwise => -1.0,
    };
    GaitParams {
        x_offset: TURN_X_OFFSET,
        y_offset: TURN_Y_OFFSET,
        x_amplitude: 0.0,
        y_amplitude: 0.0,
        a_amplitude: TURN_A_AMPLITUDE * sign,
    }
}

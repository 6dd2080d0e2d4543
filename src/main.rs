//! Standalone compass check for the robot: poll the magnetometer and print
//! the heading twice a second. Run with `--calibrate` to re-measure the
//! min/max ranges first; rotate the robot through all of its orientations
//! while the acquisition runs.

use anyhow::Context;
use embedded_hal::blocking::delay::DelayMs;
use linux_embedded_hal::{Delay, I2cdev};
use log::warn;

use magwalk::Hmc5883l;

const I2C_BUS: &str = "/dev/i2c-1";
const CALIBRATION_SECONDS: u16 = 15;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let bus = I2cdev::new(I2C_BUS).with_context(|| format!("failed to open {}", I2C_BUS))?;
    let mut compass = Hmc5883l::with_defaults(bus).context("HMC5883L not responding at 0x1E")?;

    let mut delay = Delay;
    if std::env::args().any(|arg| arg == "--calibrate") {
        println!("Rotate the robot along all of its axes; sampling for {} seconds", CALIBRATION_SECONDS);
        let cal = compass
            .calibrate(CALIBRATION_SECONDS, &mut delay)
            .context("calibration failed")?;
        println!("min/max values");
        println!("x: {}, {}", cal.x.min, cal.x.max);
        println!("y: {}, {}", cal.y.min, cal.y.max);
        println!("z: {}, {}", cal.z.min, cal.z.max);
    }

    loop {
        match compass.poll() {
            Ok(heading) => println!(
                "degrees: {:.0}, minutes: {:.0}",
                heading.whole_degrees(),
                heading.minutes()
            ),
            Err(e) => warn!("dropped sample: {}", e),
        }
        delay.delay_ms(500u16);
    }
}

// Bus path, loop rates, motor configuration
use std::time::Duration;

/// I2C bus device exposed by the Pi
pub const DEFAULT_BUS_PATH: &str = "/dev/i2c-1";

/// Fusion update rate
pub const SAMPLE_HZ: f64 = 100.0;

// Motor configuration
// The four ESCs sit at consecutive addresses starting here
pub const MOTOR_BASE_ADDR: u16 = 0x29;
pub const MOTOR_COUNT: usize = 4;

/// Highest throttle byte the ESCs accept
pub const MAX_SPEED: u8 = 240;

/// How often the actuation task pushes the commanded speed to the device.
/// Bounded staleness of a speed command equals one period.
pub const ACTUATION_PERIOD: Duration = Duration::from_millis(20);

/// Slow-stop ramp: decrement per step, and the step cadence
pub const SLOW_STOP_STEP: u8 = 5;
pub const SLOW_STOP_PERIOD: Duration = Duration::from_millis(100);

/// Arm sequence: number of zero writes, and the gap between them
pub const ARM_WRITE_COUNT: usize = 0xFFF;
pub const ARM_WRITE_DELAY: Duration = Duration::from_micros(10);

// Time-averaged calibration defaults
pub const CALIBRATION_SAMPLES: u32 = 50;
pub const CALIBRATION_DELAY: Duration = Duration::from_millis(5);

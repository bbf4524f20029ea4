// ADXL345 triaxial accelerometer driver

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::bus::{BusError, RegisterBus};
use crate::sensor::{Axis, AxisOffsets, TriaxialSensor, read_axis_registers};

/// I2C address of the ADXL345
pub const ADXL345_ADDR: u16 = 0x53;

// Registers
const REG_OFFSET_X: u8 = 0x1E;
const REG_OFFSET_Y: u8 = 0x1F;
const REG_OFFSET_Z: u8 = 0x20;
const REG_BW_RATE: u8 = 0x2C;
const REG_POWER_CTL: u8 = 0x2D;
const REG_DATA_FORMAT: u8 = 0x31;
const REG_DATA_X_L: u8 = 0x32;
const REG_DATA_X_H: u8 = 0x33;
const REG_DATA_Y_L: u8 = 0x34;
const REG_DATA_Y_H: u8 = 0x35;
const REG_DATA_Z_L: u8 = 0x36;
const REG_DATA_Z_H: u8 = 0x37;
const REG_FIFO_CTL: u8 = 0x38;

// Output data rate
const BITS_RATE_100HZ: u8 = 0x0A;

// Power management
const BITS_PWR_MEASURE: u8 = 1 << 3;

// Data format
const BITS_DATA_FULL_RES: u8 = 1 << 3;
const BITS_DATA_RANGE_4G: u8 = 0x01;

// FIFO control
const FIFO_STREAM: u8 = 0x10;

/// Scale under +/-2g full resolution; the range bits multiply it up
const BASE_SCALE: f64 = 0.0039;

pub struct Adxl345<B> {
    bus: Arc<B>,
    addr: u16,
    offsets: AxisOffsets,
    initialized: bool,
}

impl<B: RegisterBus> Adxl345<B> {
    pub fn new(bus: Arc<B>) -> Self {
        Self::with_addr(bus, ADXL345_ADDR)
    }

    pub fn with_addr(bus: Arc<B>, addr: u16) -> Self {
        Self {
            bus,
            addr,
            offsets: AxisOffsets::default(),
            initialized: false,
        }
    }

    /// Time-averaged bias estimation. The device must be at rest.
    ///
    /// Measurement is paused, the hardware offset registers are zeroed and
    /// the chip re-initialized, then `samples` raw readings are averaged
    /// into the software offsets subtracted by every later read.
    pub fn calibrate(&mut self, samples: u32, delay: Duration) -> Result<(), BusError> {
        self.bus.write_reg(self.addr, REG_POWER_CTL, 0x00)?;
        self.bus.write_reg(self.addr, REG_OFFSET_X, 0x00)?;
        self.bus.write_reg(self.addr, REG_OFFSET_Y, 0x00)?;
        self.bus.write_reg(self.addr, REG_OFFSET_Z, 0x00)?;

        self.initialized = false;
        self.init()?;
        self.offsets = AxisOffsets::default();

        info!("calibrating ADXL345 over {} samples", samples);
        let (mut x_sum, mut y_sum, mut z_sum) = (0i64, 0i64, 0i64);
        for _ in 0..samples {
            x_sum += i64::from(self.read_axis(Axis::X));
            y_sum += i64::from(self.read_axis(Axis::Y));
            z_sum += i64::from(self.read_axis(Axis::Z));
            std::thread::sleep(delay);
        }

        self.offsets = AxisOffsets {
            x: (x_sum / i64::from(samples)) as i16,
            y: (y_sum / i64::from(samples)) as i16,
            z: (z_sum / i64::from(samples)) as i16,
        };
        info!("ADXL345 calibrated, offsets {:?}", self.offsets);

        // Resume measurement with the new bias in place
        self.bus.write_reg(self.addr, REG_POWER_CTL, 0x00)?;
        self.bus.write_reg(self.addr, REG_POWER_CTL, BITS_PWR_MEASURE)?;
        Ok(())
    }

    /// Take the chip out of measure mode
    pub fn stop(&self) -> Result<(), BusError> {
        self.bus.write_reg(self.addr, REG_POWER_CTL, 0x00)
    }

    pub fn offsets(&self) -> AxisOffsets {
        self.offsets
    }

    pub fn adc_to_g(&self, value: i16) -> f64 {
        f64::from(value) * BASE_SCALE * f64::from(BITS_DATA_RANGE_4G)
    }

    /// Bias-corrected sample in g
    pub fn read_sample_g(&self) -> crate::messages::Sample3 {
        crate::messages::Sample3::new(
            self.adc_to_g(self.read_axis(Axis::X)),
            self.adc_to_g(self.read_axis(Axis::Y)),
            self.adc_to_g(self.read_axis(Axis::Z)),
        )
    }
}

impl<B: RegisterBus> TriaxialSensor for Adxl345<B> {
    fn init(&mut self) -> Result<(), BusError> {
        if self.initialized {
            return Ok(());
        }
        debug!("initializing ADXL345 at 0x{:02X}", self.addr);
        self.bus.write_reg(
            self.addr,
            REG_DATA_FORMAT,
            BITS_DATA_FULL_RES | BITS_DATA_RANGE_4G,
        )?;
        self.bus.write_reg(self.addr, REG_FIFO_CTL, FIFO_STREAM)?;
        self.bus.write_reg(self.addr, REG_BW_RATE, BITS_RATE_100HZ)?;
        self.bus.write_reg(self.addr, REG_POWER_CTL, BITS_PWR_MEASURE)?;
        self.initialized = true;
        Ok(())
    }

    fn read_axis(&self, axis: Axis) -> i16 {
        let (high_reg, low_reg) = match axis {
            Axis::X => (REG_DATA_X_H, REG_DATA_X_L),
            Axis::Y => (REG_DATA_Y_H, REG_DATA_Y_L),
            Axis::Z => (REG_DATA_Z_H, REG_DATA_Z_L),
        };
        read_axis_registers(
            self.bus.as_ref(),
            self.addr,
            high_reg,
            low_reg,
            self.offsets.for_axis(axis),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::MockBus;

    fn bus_reading_constant(value: u8) -> Arc<MockBus> {
        let bus = Arc::new(MockBus::new());
        for reg in [REG_DATA_X_H, REG_DATA_Y_H, REG_DATA_Z_H] {
            bus.set_reg(ADXL345_ADDR, reg, 0x00);
        }
        for reg in [REG_DATA_X_L, REG_DATA_Y_L, REG_DATA_Z_L] {
            bus.set_reg(ADXL345_ADDR, reg, value);
        }
        bus
    }

    #[test]
    fn init_is_idempotent() {
        let bus = Arc::new(MockBus::new());
        let mut accel = Adxl345::new(bus.clone());
        accel.init().unwrap();
        let writes_after_first = bus.writes().len();
        accel.init().unwrap();
        assert_eq!(bus.writes().len(), writes_after_first);
    }

    #[test]
    fn calibration_averages_constant_samples_exactly() {
        let bus = bus_reading_constant(100);
        let mut accel = Adxl345::new(bus);
        accel.calibrate(50, Duration::ZERO).unwrap();

        assert_eq!(accel.offsets(), AxisOffsets { x: 100, y: 100, z: 100 });
        // the stored bias nulls subsequent reads at rest
        assert_eq!(accel.read_axis(Axis::X), 0);
        assert_eq!(accel.read_sample(), crate::messages::Sample3::default());
    }

    #[test]
    fn calibration_zeroes_hardware_offset_registers() {
        let bus = bus_reading_constant(10);
        let mut accel = Adxl345::new(bus.clone());
        accel.calibrate(5, Duration::ZERO).unwrap();

        for reg in [REG_OFFSET_X, REG_OFFSET_Y, REG_OFFSET_Z] {
            assert_eq!(bus.written_value(ADXL345_ADDR, reg), Some(0));
        }
        // measurement resumed after the run
        assert_eq!(
            bus.written_value(ADXL345_ADDR, REG_POWER_CTL),
            Some(BITS_PWR_MEASURE)
        );
    }

    #[test]
    fn adc_to_g_applies_resolution_and_range() {
        let bus = Arc::new(MockBus::new());
        let accel = Adxl345::new(bus);
        assert!((accel.adc_to_g(256) - 0.9984).abs() < 1e-9);
        assert_eq!(accel.adc_to_g(0), 0.0);
    }
}

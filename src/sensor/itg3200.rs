// ITG-3200 triaxial gyroscope driver

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::bus::{BusError, RegisterBus};
use crate::sensor::{Axis, AxisOffsets, TriaxialSensor, read_axis_registers};

/// I2C address of the ITG-3200
pub const ITG3200_ADDR: u16 = 0x68;

/// ADC counts per degree/second at the configured full-scale range
const SENSITIVITY: f64 = 14.375;

// Registers
const REG_SMPLRT_DIV: u8 = 0x15;
const REG_DLPF_FS: u8 = 0x16;
const REG_INT_CFG: u8 = 0x17;
const REG_GYRO_X_H: u8 = 0x1D;
const REG_GYRO_X_L: u8 = 0x1E;
const REG_GYRO_Y_H: u8 = 0x1F;
const REG_GYRO_Y_L: u8 = 0x20;
const REG_GYRO_Z_H: u8 = 0x21;
const REG_GYRO_Z_L: u8 = 0x22;
const REG_PWRMGM: u8 = 0x3E;

// DLPF_FS bits: full-scale select plus low-pass bandwidth
const DLPF_FS_SEL: u8 = 3 << 3;
const LPFBW_256HZ: u8 = 0x00;

// PWRMGM standby bit
const BITS_PWR_STANDBY: u8 = 0x20;

pub struct Itg3200<B> {
    bus: Arc<B>,
    addr: u16,
    offsets: AxisOffsets,
    initialized: bool,
}

impl<B: RegisterBus> Itg3200<B> {
    pub fn new(bus: Arc<B>) -> Self {
        Self::with_addr(bus, ITG3200_ADDR)
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
    pub fn calibrate(&mut self, samples: u32, delay: Duration) -> Result<(), BusError> {
        self.init()?;
        self.offsets = AxisOffsets::default();

        info!("calibrating ITG-3200 over {} samples", samples);
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
        info!("ITG-3200 calibrated, offsets {:?}", self.offsets);
        Ok(())
    }

    /// Put the chip into standby
    pub fn stop(&self) -> Result<(), BusError> {
        self.bus.write_reg(self.addr, REG_PWRMGM, BITS_PWR_STANDBY)
    }

    pub fn offsets(&self) -> AxisOffsets {
        self.offsets
    }

    pub fn adc_to_deg_per_sec(&self, value: i16) -> f64 {
        f64::from(value) / SENSITIVITY
    }

    /// Die temperature in Celsius from the raw temperature ADC value
    pub fn temp_to_celsius(&self, raw: i16) -> f64 {
        35.0 + (f64::from(raw) + 13200.0) / 280.0
    }

    /// Bias-corrected angular rate in degrees/second
    pub fn read_sample_deg_s(&self) -> crate::messages::Sample3 {
        crate::messages::Sample3::new(
            self.adc_to_deg_per_sec(self.read_axis(Axis::X)),
            self.adc_to_deg_per_sec(self.read_axis(Axis::Y)),
            self.adc_to_deg_per_sec(self.read_axis(Axis::Z)),
        )
    }
}

impl<B: RegisterBus> TriaxialSensor for Itg3200<B> {
    fn init(&mut self) -> Result<(), BusError> {
        if self.initialized {
            return Ok(());
        }
        debug!("initializing ITG-3200 at 0x{:02X}", self.addr);
        self.bus.write_reg(self.addr, REG_PWRMGM, 0x00)?;
        self.bus.write_reg(self.addr, REG_SMPLRT_DIV, 0x0A)?;
        self.bus
            .write_reg(self.addr, REG_DLPF_FS, DLPF_FS_SEL | LPFBW_256HZ)?;
        self.bus.write_reg(self.addr, REG_INT_CFG, 0x00)?;
        self.initialized = true;
        Ok(())
    }

    fn read_axis(&self, axis: Axis) -> i16 {
        let (high_reg, low_reg) = match axis {
            Axis::X => (REG_GYRO_X_H, REG_GYRO_X_L),
            Axis::Y => (REG_GYRO_Y_H, REG_GYRO_Y_L),
            Axis::Z => (REG_GYRO_Z_H, REG_GYRO_Z_L),
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

    #[test]
    fn calibration_stores_signed_offsets() {
        let bus = Arc::new(MockBus::new());
        // constant reading of -3 on every axis
        for (h, l) in [
            (REG_GYRO_X_H, REG_GYRO_X_L),
            (REG_GYRO_Y_H, REG_GYRO_Y_L),
            (REG_GYRO_Z_H, REG_GYRO_Z_L),
        ] {
            bus.set_reg(ITG3200_ADDR, h, 0xFF);
            bus.set_reg(ITG3200_ADDR, l, 0xFD);
        }

        let mut gyro = Itg3200::new(bus);
        gyro.calibrate(50, Duration::ZERO).unwrap();
        assert_eq!(gyro.offsets(), AxisOffsets { x: -3, y: -3, z: -3 });
        assert_eq!(gyro.read_axis(Axis::X), 0);
    }

    #[test]
    fn init_configures_power_and_rate_once() {
        let bus = Arc::new(MockBus::new());
        let mut gyro = Itg3200::new(bus.clone());
        gyro.init().unwrap();
        gyro.init().unwrap();

        let writes = bus.writes();
        assert_eq!(writes.len(), 4);
        assert_eq!(writes[0], (ITG3200_ADDR, REG_PWRMGM, 0x00));
        assert_eq!(writes[1], (ITG3200_ADDR, REG_SMPLRT_DIV, 0x0A));
    }

    #[test]
    fn unit_conversions() {
        let bus = Arc::new(MockBus::new());
        let gyro = Itg3200::new(bus);
        assert!((gyro.adc_to_deg_per_sec(14) - 14.0 / 14.375).abs() < 1e-12);
        // datasheet reference point: -13200 counts is 35 C
        assert_eq!(gyro.temp_to_celsius(-13200), 35.0);
    }
}

// Triaxial sensor contract shared by every chip driver
//
// Each driver owns its register map and unit conversions; the decode rule,
// axis addressing, and bias bookkeeping live here.

pub mod adxl345;
pub mod itg3200;
pub mod mpu9250;

use tracing::warn;

use crate::bus::{BusError, RegisterBus};
use crate::messages::Sample3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
    Z,
}

/// Per-axis steady-state bias, signed 16-bit for every chip
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AxisOffsets {
    pub x: i16,
    pub y: i16,
    pub z: i16,
}

impl AxisOffsets {
    pub fn for_axis(&self, axis: Axis) -> i16 {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
        }
    }
}

/// Combine a high/low register pair into a bias-corrected signed sample.
///
/// The chips transmit big-endian two's complement, but the bias is
/// subtracted before sign recovery, so the wrap test is on the offset
/// result: strictly above 32768 folds down by 65536. 32768 itself is left
/// alone and truncates on the cast.
pub fn decode_axis(high: u8, low: u8, offset: i16) -> i16 {
    let raw = (u16::from(high) << 8) | u16::from(low);
    let mut value = i32::from(raw) - i32::from(offset);
    if value > 32768 {
        value -= 65536;
    }
    value as i16
}

/// Read one axis from its register pair, degrading to 0 on a failed read.
///
/// Sensor reads happen at rates where a dropped sample is cheaper than an
/// aborted caller; initialization sequences do NOT go through this path.
pub(crate) fn read_axis_registers(
    bus: &dyn RegisterBus,
    addr: u16,
    high_reg: u8,
    low_reg: u8,
    offset: i16,
) -> i16 {
    let high = match bus.read_reg(addr, high_reg) {
        Ok(v) => v,
        Err(e) => {
            warn!("axis high-byte read failed on 0x{:02X}: {}", addr, e);
            return 0;
        }
    };
    let low = match bus.read_reg(addr, low_reg) {
        Ok(v) => v,
        Err(e) => {
            warn!("axis low-byte read failed on 0x{:02X}: {}", addr, e);
            return 0;
        }
    };
    decode_axis(high, low, offset)
}

/// Uniform read contract implemented by every chip variant.
///
/// `read_sample` is three sequential single-axis reads; there is no atomic
/// multi-axis snapshot. Sensor output rates are far above bus read latency,
/// so the skew within one sample is negligible.
pub trait TriaxialSensor {
    /// Configure power, rate, and range registers. Idempotent.
    fn init(&mut self) -> Result<(), BusError>;

    /// One bias-corrected axis in raw ADC counts
    fn read_axis(&self, axis: Axis) -> i16;

    fn read_sample(&self) -> Sample3 {
        Sample3::new(
            f64::from(self.read_axis(Axis::X)),
            f64::from(self.read_axis(Axis::Y)),
            f64::from(self.read_axis(Axis::Z)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::MockBus;

    #[test]
    fn decode_combines_register_pair() {
        assert_eq!(decode_axis(0x01, 0x02, 0), 258);
    }

    #[test]
    fn decode_recovers_negative_values() {
        // 32769 folds to -32767; the boundary test is a strict greater-than
        assert_eq!(decode_axis(0x80, 0x01, 0), -32767);
        assert_eq!(decode_axis(0xFF, 0xFF, 0), -1);
    }

    #[test]
    fn decode_boundary_does_not_take_wrap_branch() {
        // 32768 stays on the non-wrapping path and truncates on the cast
        assert_eq!(decode_axis(0x80, 0x00, 0), i16::MIN);
        // with an offset pulling the result below the boundary, no fold
        assert_eq!(decode_axis(0x80, 0x00, 1), 32767);
    }

    #[test]
    fn decode_subtracts_offset() {
        assert_eq!(decode_axis(0x00, 0x64, 100), 0);
        assert_eq!(decode_axis(0x00, 0x64, -100), 200);
    }

    #[test]
    fn failed_register_read_degrades_to_zero() {
        let bus = MockBus::new();
        bus.set_reg(0x53, 0x33, 0x01);
        bus.set_reg(0x53, 0x32, 0x02);
        assert_eq!(read_axis_registers(&bus, 0x53, 0x33, 0x32, 0), 258);

        bus.fail_reg(0x53, 0x33);
        assert_eq!(read_axis_registers(&bus, 0x53, 0x33, 0x32, 0), 0);
    }
}

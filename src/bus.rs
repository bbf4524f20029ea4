// Shared I2C bus arbitration and register access
//
// One I2cBus is constructed per physical /dev/i2c-N and handed to every
// driver behind an Arc. Each operation selects the target device and runs
// the data transfer under a single lock hold, so concurrent drivers on the
// same bus cannot interleave mid-transaction.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use i2cdev::core::I2CDevice;
use i2cdev::linux::{LinuxI2CDevice, LinuxI2CError};
use tracing::debug;

/// Error types for bus communication
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to open i2c bus {path}: {source}")]
    Open { path: PathBuf, source: LinuxI2CError },

    #[error("failed to select device 0x{addr:02X}: {source}")]
    Select { addr: u16, source: LinuxI2CError },

    #[error("transfer failed for device 0x{addr:02X}: {source}")]
    Transfer { addr: u16, source: LinuxI2CError },
}

pub type Result<T> = std::result::Result<T, BusError>;

/// Register-level capability every driver programs against.
///
/// Implementations must make each call one atomic bus transaction:
/// device select and data transfer happen without releasing the bus
/// in between.
pub trait RegisterBus: Send + Sync {
    fn read_reg(&self, addr: u16, reg: u8) -> Result<u8>;

    fn write_reg(&self, addr: u16, reg: u8, value: u8) -> Result<()>;

    /// Burst read starting at `reg`, filling `buf`
    fn read_block(&self, addr: u16, reg: u8, buf: &mut [u8]) -> Result<()>;

    /// Raw write with no register prefix. ESCs take bare throttle bytes.
    fn write_raw(&self, addr: u16, bytes: &[u8]) -> Result<()>;
}

/// Arbiter for one physical I2C bus
pub struct I2cBus {
    dev: Mutex<LinuxI2CDevice>,
}

impl I2cBus {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let dev = LinuxI2CDevice::new(path, 0).map_err(|source| BusError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            dev: Mutex::new(dev),
        })
    }

    /// Select `addr` and run `f` against the device, all under one lock hold
    fn transaction<T>(
        &self,
        addr: u16,
        f: impl FnOnce(&mut LinuxI2CDevice) -> std::result::Result<T, LinuxI2CError>,
    ) -> Result<T> {
        let mut dev = self.dev.lock().expect("i2c bus lock poisoned");
        dev.set_slave_address(addr)
            .map_err(|source| BusError::Select { addr, source })?;
        f(&mut dev).map_err(|source| BusError::Transfer { addr, source })
    }
}

impl RegisterBus for I2cBus {
    fn read_reg(&self, addr: u16, reg: u8) -> Result<u8> {
        self.transaction(addr, |dev| dev.smbus_read_byte_data(reg))
    }

    fn write_reg(&self, addr: u16, reg: u8, value: u8) -> Result<()> {
        debug!(
            "write 0x{:02X} to reg 0x{:02X} on device 0x{:02X}",
            value, reg, addr
        );
        self.transaction(addr, |dev| dev.smbus_write_byte_data(reg, value))
    }

    fn read_block(&self, addr: u16, reg: u8, buf: &mut [u8]) -> Result<()> {
        let data = self.transaction(addr, |dev| {
            dev.smbus_read_i2c_block_data(reg, buf.len() as u8)
        })?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(())
    }

    fn write_raw(&self, addr: u16, bytes: &[u8]) -> Result<()> {
        self.transaction(addr, |dev| dev.write(bytes))
    }
}

/// Scripted in-memory bus used by driver tests.
#[cfg(test)]
pub mod mock {
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::Mutex;

    use super::{BusError, RegisterBus, Result};

    #[derive(Default)]
    struct MockState {
        // One-shot responses consumed front-first, then `steady` applies.
        scripted: HashMap<(u16, u8), VecDeque<u8>>,
        steady: HashMap<(u16, u8), u8>,
        blocks: HashMap<(u16, u8), VecDeque<Vec<u8>>>,
        failing: HashSet<(u16, u8)>,
        writes: Vec<(u16, u8, u8)>,
        raw_writes: Vec<(u16, Vec<u8>)>,
    }

    #[derive(Default)]
    pub struct MockBus {
        state: Mutex<MockState>,
    }

    impl MockBus {
        pub fn new() -> Self {
            Self::default()
        }

        /// Every read of (addr, reg) returns `value` unless scripted
        pub fn set_reg(&self, addr: u16, reg: u8, value: u8) {
            self.state.lock().unwrap().steady.insert((addr, reg), value);
        }

        /// Queue one-shot read responses for (addr, reg)
        pub fn script_reg(&self, addr: u16, reg: u8, values: &[u8]) {
            self.state
                .lock()
                .unwrap()
                .scripted
                .entry((addr, reg))
                .or_default()
                .extend(values.iter().copied());
        }

        /// Queue one block-read response for (addr, reg)
        pub fn script_block(&self, addr: u16, reg: u8, bytes: Vec<u8>) {
            self.state
                .lock()
                .unwrap()
                .blocks
                .entry((addr, reg))
                .or_default()
                .push_back(bytes);
        }

        /// Make every read or write of (addr, reg) fail
        pub fn fail_reg(&self, addr: u16, reg: u8) {
            self.state.lock().unwrap().failing.insert((addr, reg));
        }

        pub fn clear_failures(&self) {
            self.state.lock().unwrap().failing.clear();
        }

        /// All register writes, in order
        pub fn writes(&self) -> Vec<(u16, u8, u8)> {
            self.state.lock().unwrap().writes.clone()
        }

        /// Last value written to (addr, reg), if any
        pub fn written_value(&self, addr: u16, reg: u8) -> Option<u8> {
            self.state
                .lock()
                .unwrap()
                .writes
                .iter()
                .rev()
                .find(|(a, r, _)| (*a, *r) == (addr, reg))
                .map(|(_, _, v)| *v)
        }

        /// All raw (register-less) writes to `addr`, in order
        pub fn raw_writes(&self, addr: u16) -> Vec<Vec<u8>> {
            self.state
                .lock()
                .unwrap()
                .raw_writes
                .iter()
                .filter(|(a, _)| *a == addr)
                .map(|(_, b)| b.clone())
                .collect()
        }

        fn injected_failure(addr: u16) -> BusError {
            BusError::Transfer {
                addr,
                source: std::io::Error::other("injected failure").into(),
            }
        }
    }

    impl RegisterBus for MockBus {
        fn read_reg(&self, addr: u16, reg: u8) -> Result<u8> {
            let mut state = self.state.lock().unwrap();
            if state.failing.contains(&(addr, reg)) {
                return Err(Self::injected_failure(addr));
            }
            if let Some(queue) = state.scripted.get_mut(&(addr, reg))
                && let Some(value) = queue.pop_front()
            {
                return Ok(value);
            }
            Ok(state.steady.get(&(addr, reg)).copied().unwrap_or(0))
        }

        fn write_reg(&self, addr: u16, reg: u8, value: u8) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if state.failing.contains(&(addr, reg)) {
                return Err(Self::injected_failure(addr));
            }
            state.writes.push((addr, reg, value));
            state.steady.insert((addr, reg), value);
            Ok(())
        }

        fn read_block(&self, addr: u16, reg: u8, buf: &mut [u8]) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if state.failing.contains(&(addr, reg)) {
                return Err(Self::injected_failure(addr));
            }
            if let Some(queue) = state.blocks.get_mut(&(addr, reg))
                && let Some(bytes) = queue.pop_front()
            {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                return Ok(());
            }
            // Fall back to consecutive steady registers starting at `reg`
            for (i, slot) in buf.iter_mut().enumerate() {
                *slot = state
                    .steady
                    .get(&(addr, reg.wrapping_add(i as u8)))
                    .copied()
                    .unwrap_or(0);
            }
            Ok(())
        }

        fn write_raw(&self, addr: u16, bytes: &[u8]) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.raw_writes.push((addr, bytes.to_vec()));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockBus;
    use super::*;

    #[test]
    fn mock_scripted_reads_drain_before_steady() {
        let bus = MockBus::new();
        bus.set_reg(0x68, 0x3B, 0x7F);
        bus.script_reg(0x68, 0x3B, &[1, 2]);

        assert_eq!(bus.read_reg(0x68, 0x3B).unwrap(), 1);
        assert_eq!(bus.read_reg(0x68, 0x3B).unwrap(), 2);
        assert_eq!(bus.read_reg(0x68, 0x3B).unwrap(), 0x7F);
    }

    #[test]
    fn mock_records_writes() {
        let bus = MockBus::new();
        bus.write_reg(0x53, 0x2D, 0x08).unwrap();
        bus.write_raw(0x29, &[0x01]).unwrap();

        assert_eq!(bus.written_value(0x53, 0x2D), Some(0x08));
        assert_eq!(bus.raw_writes(0x29), vec![vec![0x01]]);
    }

    #[test]
    fn mock_injected_failure_reports_address() {
        let bus = MockBus::new();
        bus.fail_reg(0x0C, 0x09);
        let err = bus.read_reg(0x0C, 0x09).unwrap_err();
        assert!(matches!(err, BusError::Transfer { addr: 0x0C, .. }));
    }
}

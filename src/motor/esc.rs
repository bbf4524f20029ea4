// ESC channel: arming, commanded-speed state, and the actuation task
//
// The commanded speed is shared mutable state with one external writer
// (whatever issues speed commands) and one internal reader (the actuation
// task pushing it to hardware). An atomic keeps both sides lock-free; the
// staleness of a command is bounded by one actuation period.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use tokio::sync::watch;
use tokio::time::{interval, sleep};
use tracing::{debug, info, warn};

use crate::bus::{BusError, RegisterBus};
use crate::config::{
    ARM_WRITE_COUNT, ARM_WRITE_DELAY, ACTUATION_PERIOD, MAX_SPEED, SLOW_STOP_PERIOD,
    SLOW_STOP_STEP,
};

/// One step of the slow-stop ramp. `None` once the channel is stopped.
fn ramp_down(speed: u8) -> Option<u8> {
    if speed == 0 {
        None
    } else {
        Some(speed.saturating_sub(SLOW_STOP_STEP))
    }
}

pub struct Esc<B> {
    bus: Arc<B>,
    addr: u16,
    speed: AtomicU8,
    initialized: AtomicBool,
}

impl<B: RegisterBus> Esc<B> {
    pub fn new(bus: Arc<B>, addr: u16) -> Self {
        Self {
            bus,
            addr,
            speed: AtomicU8::new(0),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn addr(&self) -> u16 {
        self.addr
    }

    /// Arm the controller: a long train of zero bytes followed by the arm
    /// byte. Idempotent; blocking (call off the async runtime).
    pub fn init(&self) -> Result<(), BusError> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("arming ESC 0x{:02X}", self.addr);
        for _ in 0..ARM_WRITE_COUNT {
            self.bus.write_raw(self.addr, &[0x00])?;
            std::thread::sleep(ARM_WRITE_DELAY);
        }
        self.bus.write_raw(self.addr, &[0x01])?;
        Ok(())
    }

    /// Command a speed. Values outside [0, MAX_SPEED] clamp silently.
    pub fn set_speed(&self, speed: i32) {
        let clamped = speed.clamp(0, i32::from(MAX_SPEED)) as u8;
        self.speed.store(clamped, Ordering::SeqCst);
        debug!("ESC 0x{:02X} speed set to {}", self.addr, clamped);
    }

    pub fn get_speed(&self) -> u8 {
        self.speed.load(Ordering::SeqCst)
    }

    /// Actuation task: push the commanded speed to the device whenever it
    /// changed since the last write, until `shutdown` signals.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = interval(ACTUATION_PERIOD);
        let mut last_written: Option<u8> = None;
        info!("actuation loop started for ESC 0x{:02X}", self.addr);

        loop {
            tokio::select! {
                // poll first so a pending speed still reaches the device
                // when the stop signal arrives in the same period
                biased;
                _ = tick.tick() => {
                    let speed = self.get_speed();
                    if last_written != Some(speed) {
                        match self.bus.write_raw(self.addr, &[speed]) {
                            Ok(()) => {
                                debug!("ESC 0x{:02X} wrote speed {}", self.addr, speed);
                                last_written = Some(speed);
                            }
                            // leave last_written alone so the next tick
                            // pushes the value again
                            Err(e) => warn!("ESC 0x{:02X} write failed: {}", self.addr, e),
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("actuation loop stopped for ESC 0x{:02X}", self.addr);
    }

    /// Ramp the commanded speed down to zero, one step per cadence.
    /// Concurrent `set_speed` calls win immediately: the next step ramps
    /// from whatever they stored.
    pub async fn slow_stop(&self) {
        info!("slow-stopping ESC 0x{:02X}", self.addr);
        while self
            .speed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, ramp_down)
            .is_ok()
        {
            sleep(SLOW_STOP_PERIOD).await;
        }
    }
}

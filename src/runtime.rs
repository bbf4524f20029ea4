// Sensor sampling + fusion loop, calibration sequencing, motor lifecycle
//
// Bring-up order: calibrate (concurrently, joined), arm motors, then run
// the fusion loop until shutdown. On shutdown the motors ramp down before
// their actuation tasks are released, so the last value pushed to each
// controller is zero.

use std::f64::consts::PI;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinSet, spawn_blocking};
use tokio::time::interval;
use tracing::{info, warn};

use crate::bus::{BusError, I2cBus, RegisterBus};
use crate::config::{
    CALIBRATION_DELAY, CALIBRATION_SAMPLES, MOTOR_BASE_ADDR, MOTOR_COUNT, SAMPLE_HZ,
};
use crate::fusion::Madgwick;
use crate::messages::{AttitudeSnapshot, RuntimeHealth, Sample3, Telemetry};
use crate::motor::Esc;
use crate::sensor::TriaxialSensor;
use crate::sensor::adxl345::Adxl345;
use crate::sensor::itg3200::Itg3200;
use crate::sensor::mpu9250::Mpu9250;

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub bus_path: String,
    pub sample_hz: f64,
    /// Use the 9-axis MPU-9250 instead of the ADXL345 + ITG-3200 pair
    pub nine_axis: bool,
    pub motors: usize,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            bus_path: crate::config::DEFAULT_BUS_PATH.to_string(),
            sample_hz: SAMPLE_HZ,
            nine_axis: false,
            motors: MOTOR_COUNT,
        }
    }
}

enum SensorStack<B> {
    SixAxis {
        accel: Adxl345<B>,
        gyro: Itg3200<B>,
    },
    NineAxis(Mpu9250<B>),
}

impl<B: RegisterBus + 'static> SensorStack<B> {
    /// Read one calibrated sample set: accel in g, gyro in rad/s, and the
    /// magnetometer in uT when the hardware has one.
    fn read(&self) -> (Sample3, Sample3, Option<Sample3>) {
        match self {
            SensorStack::SixAxis { accel, gyro } => {
                let a = accel.read_sample_g();
                let g = gyro_to_rad_s(gyro.read_sample_deg_s());
                (a, g, None)
            }
            SensorStack::NineAxis(imu) => {
                let sample = imu.read_nine_axis();
                let g = gyro_to_rad_s(sample.gyro_deg_s);
                (sample.accel_g, g, Some(sample.mag_ut))
            }
        }
    }
}

/// Open the configured bus and run until `shutdown` signals
pub async fn run(
    opts: RuntimeOptions,
    shutdown: watch::Receiver<bool>,
    telemetry: watch::Sender<Telemetry>,
) -> Result<(), BusError> {
    let bus = Arc::new(I2cBus::open(&opts.bus_path)?);
    run_with_bus(bus, opts, shutdown, telemetry).await
}

/// Runtime entry over any bus implementation
pub async fn run_with_bus<B: RegisterBus + 'static>(
    bus: Arc<B>,
    opts: RuntimeOptions,
    mut shutdown: watch::Receiver<bool>,
    telemetry: watch::Sender<Telemetry>,
) -> Result<(), BusError> {
    info!(
        "runtime starting: {}Hz fusion, {} motors, {} sensors",
        opts.sample_hz,
        opts.motors,
        if opts.nine_axis { "9-axis" } else { "6-axis" }
    );
    telemetry.send_replace(Telemetry {
        attitude: AttitudeSnapshot::default(),
        health: RuntimeHealth::Calibrating,
    });

    let sensors = calibrate_sensors(&bus, opts.nine_axis).await?;

    // Arm every controller before any actuation task runs
    let escs: Vec<Arc<Esc<B>>> = (0..opts.motors)
        .map(|i| Arc::new(Esc::new(bus.clone(), MOTOR_BASE_ADDR + i as u16)))
        .collect();
    {
        let escs = escs.clone();
        spawn_blocking(move || -> Result<(), BusError> {
            for esc in &escs {
                esc.init()?;
            }
            Ok(())
        })
        .await
        .expect("arm task panicked")?;
    }

    // Actuation loops get their own stop signal: they must outlive the
    // fusion loop so the slow-stop ramp still reaches the hardware
    let (motor_stop_tx, motor_stop_rx) = watch::channel(false);
    let mut actuation_tasks = JoinSet::new();
    for esc in &escs {
        actuation_tasks.spawn(esc.clone().run(motor_stop_rx.clone()));
    }

    let mut filter = Madgwick::new(opts.sample_hz);
    let mut tick = interval(Duration::from_secs_f64(1.0 / opts.sample_hz));
    info!("fusion loop running");

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let (accel, gyro, mag) = sensors.read();
                filter.update(accel, gyro, mag);
                let (roll, pitch, yaw) = filter.orientation();
                telemetry.send_replace(Telemetry {
                    attitude: AttitudeSnapshot { roll, pitch, yaw },
                    health: RuntimeHealth::Running,
                });
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("shutting down, ramping motors to zero");
    let attitude = telemetry.borrow().attitude;
    telemetry.send_replace(Telemetry {
        attitude,
        health: RuntimeHealth::ShuttingDown,
    });

    let mut ramps = JoinSet::new();
    for esc in &escs {
        let esc = esc.clone();
        ramps.spawn(async move { esc.slow_stop().await });
    }
    while ramps.join_next().await.is_some() {}

    if motor_stop_tx.send(true).is_err() {
        warn!("actuation loops already gone at shutdown");
    }
    while actuation_tasks.join_next().await.is_some() {}

    info!("runtime stopped");
    Ok(())
}

/// Run the bias calibrations and hand back the ready sensor stack.
/// The 6-axis pair calibrates both chips as concurrent blocking tasks and
/// joins them; recalibrating after first use is not supported.
async fn calibrate_sensors<B: RegisterBus + 'static>(
    bus: &Arc<B>,
    nine_axis: bool,
) -> Result<SensorStack<B>, BusError> {
    if nine_axis {
        let bus = bus.clone();
        let imu = spawn_blocking(move || -> Result<_, BusError> {
            let mut imu = Mpu9250::new(bus);
            imu.calibrate_fifo()?;
            imu.init()?;
            Ok(imu)
        })
        .await
        .expect("calibration task panicked")?;
        return Ok(SensorStack::NineAxis(imu));
    }

    let accel_bus = bus.clone();
    let accel_task = spawn_blocking(move || -> Result<_, BusError> {
        let mut accel = Adxl345::new(accel_bus);
        accel.init()?;
        accel.calibrate(CALIBRATION_SAMPLES, CALIBRATION_DELAY)?;
        Ok(accel)
    });
    let gyro_bus = bus.clone();
    let gyro_task = spawn_blocking(move || -> Result<_, BusError> {
        let mut gyro = Itg3200::new(gyro_bus);
        gyro.init()?;
        gyro.calibrate(CALIBRATION_SAMPLES, CALIBRATION_DELAY)?;
        Ok(gyro)
    });

    let accel = accel_task.await.expect("calibration task panicked")?;
    let gyro = gyro_task.await.expect("calibration task panicked")?;
    Ok(SensorStack::SixAxis { accel, gyro })
}

/// The filter integrates angular rate in rad/s; drivers report deg/s.
/// The conversion happens once, here, at the filter boundary.
fn gyro_to_rad_s(deg_s: Sample3) -> Sample3 {
    Sample3::new(
        deg_s.x * PI / 180.0,
        deg_s.y * PI / 180.0,
        deg_s.z * PI / 180.0,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::MockBus;

    #[tokio::test(flavor = "multi_thread")]
    async fn runtime_calibrates_runs_and_stops_cleanly() {
        let bus = Arc::new(MockBus::new());
        let opts = RuntimeOptions {
            bus_path: String::new(),
            sample_hz: 200.0,
            nine_axis: false,
            motors: 2,
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (telemetry_tx, mut telemetry_rx) = watch::channel(Telemetry::default());

        let handle = tokio::spawn(run_with_bus(bus.clone(), opts, shutdown_rx, telemetry_tx));

        // wait until the fusion loop has published at least one Running
        // snapshot
        loop {
            telemetry_rx.changed().await.unwrap();
            if telemetry_rx.borrow().health == RuntimeHealth::Running {
                break;
            }
        }

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        // both ESCs were armed and the last pushed value is zero
        for addr in [MOTOR_BASE_ADDR, MOTOR_BASE_ADDR + 1] {
            let writes = bus.raw_writes(addr);
            assert!(writes.len() > crate::config::ARM_WRITE_COUNT);
            assert_eq!(writes.last(), Some(&vec![0x00]));
        }
    }

    #[test]
    fn unit_conversion_at_filter_boundary() {
        let g = gyro_to_rad_s(Sample3::new(180.0, -90.0, 0.0));
        assert!((g.x - PI).abs() < 1e-12);
        assert!((g.y + PI / 2.0).abs() < 1e-12);
        assert_eq!(g.z, 0.0);
    }
}

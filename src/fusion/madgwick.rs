// Madgwick AHRS: gradient-descent orientation filter
//
// Fuses gyroscope rates (rad/s) with an accelerometer gravity reference
// and, when present, a magnetometer heading reference into a unit
// quaternion. The corrective step is the closed-form gradient of the
// orientation-error objective, not a numerical derivative.

use crate::messages::Sample3;

/// Unit quaternion representing the body orientation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quaternion {
    pub q0: f64,
    pub q1: f64,
    pub q2: f64,
    pub q3: f64,
}

impl Quaternion {
    pub const IDENTITY: Quaternion = Quaternion {
        q0: 1.0,
        q1: 0.0,
        q2: 0.0,
        q3: 0.0,
    };

    pub fn magnitude(&self) -> f64 {
        (self.q0 * self.q0 + self.q1 * self.q1 + self.q2 * self.q2 + self.q3 * self.q3).sqrt()
    }

    /// Roll in degrees
    pub fn roll(&self) -> f64 {
        let Quaternion { q0, q1, q2, q3 } = *self;
        (2.0 * (q0 * q1 + q2 * q3))
            .atan2(1.0 - 2.0 * (q1 * q1 + q2 * q2))
            .to_degrees()
    }

    /// Pitch in degrees. The asin argument is clamped so orientations at
    /// the gimbal boundary return +/-90 instead of NaN.
    pub fn pitch(&self) -> f64 {
        let Quaternion { q0, q1, q2, q3 } = *self;
        (2.0 * (q0 * q2 - q3 * q1)).clamp(-1.0, 1.0).asin().to_degrees()
    }

    /// Yaw in degrees
    pub fn yaw(&self) -> f64 {
        let Quaternion { q0, q1, q2, q3 } = *self;
        (2.0 * (q0 * q3 + q1 * q2))
            .atan2(1.0 - 2.0 * (q2 * q2 + q3 * q3))
            .to_degrees()
    }
}

/// Filter state: quaternion plus the gradient-descent gain `beta` and the
/// fixed update rate the integration step is derived from.
pub struct Madgwick {
    pub beta: f64,
    sample_freq: f64,
    q: Quaternion,
}

fn inv_sqrt(x: f64) -> f64 {
    1.0 / x.sqrt()
}

impl Madgwick {
    pub fn new(sample_freq: f64) -> Self {
        Self {
            beta: 0.1,
            sample_freq,
            q: Quaternion::IDENTITY,
        }
    }

    pub fn quaternion(&self) -> Quaternion {
        self.q
    }

    /// (roll, pitch, yaw) in degrees
    pub fn orientation(&self) -> (f64, f64, f64) {
        (self.q.roll(), self.q.pitch(), self.q.yaw())
    }

    /// Advance the filter by one sample period.
    ///
    /// `gyro` is angular rate in rad/s; `accel` and `mag` may be in any
    /// consistent units since both are normalized. A missing or all-zero
    /// magnetometer reading falls back to the 6-axis gravity-only
    /// correction; an all-zero accelerometer reading integrates the
    /// gyroscope alone for this call. Total for finite inputs.
    pub fn update(&mut self, accel: Sample3, gyro: Sample3, mag: Option<Sample3>) {
        match mag {
            Some(m) if !m.is_zero() => self.update_marg(accel, gyro, m),
            _ => self.update_imu(accel, gyro),
        }
    }

    /// 6-axis update: gravity is the only correction reference
    pub fn update_imu(&mut self, accel: Sample3, gyro: Sample3) {
        let Quaternion { q0, q1, q2, q3 } = self.q;
        let Sample3 {
            x: gx,
            y: gy,
            z: gz,
        } = gyro;
        let Sample3 {
            x: mut ax,
            y: mut ay,
            z: mut az,
        } = accel;

        // Rate of change of quaternion from the gyroscope
        let mut q_dot0 = 0.5 * (-q1 * gx - q2 * gy - q3 * gz);
        let mut q_dot1 = 0.5 * (q0 * gx + q2 * gz - q3 * gy);
        let mut q_dot2 = 0.5 * (q0 * gy - q1 * gz + q3 * gx);
        let mut q_dot3 = 0.5 * (q0 * gz + q1 * gy - q2 * gx);

        // Feedback only with a valid accelerometer measurement (an exact
        // zero vector cannot be normalized)
        if !accel.is_zero() {
            let recip_norm = inv_sqrt(ax * ax + ay * ay + az * az);
            ax *= recip_norm;
            ay *= recip_norm;
            az *= recip_norm;

            let _2q0 = 2.0 * q0;
            let _2q1 = 2.0 * q1;
            let _2q2 = 2.0 * q2;
            let _2q3 = 2.0 * q3;
            let _4q0 = 4.0 * q0;
            let _4q1 = 4.0 * q1;
            let _4q2 = 4.0 * q2;
            let _8q1 = 8.0 * q1;
            let _8q2 = 8.0 * q2;
            let q0q0 = q0 * q0;
            let q1q1 = q1 * q1;
            let q2q2 = q2 * q2;
            let q3q3 = q3 * q3;

            // Gradient-descent corrective step
            let s0 = _4q0 * q2q2 + _2q2 * ax + _4q0 * q1q1 - _2q1 * ay;
            let s1 = _4q1 * q3q3 - _2q3 * ax + 4.0 * q0q0 * q1 - _2q0 * ay - _4q1
                + _8q1 * q1q1
                + _8q1 * q2q2
                + _4q1 * az;
            let s2 = 4.0 * q0q0 * q2 + _2q0 * ax + _4q2 * q3q3 - _2q3 * ay - _4q2
                + _8q2 * q1q1
                + _8q2 * q2q2
                + _4q2 * az;
            let s3 = 4.0 * q1q1 * q3 - _2q1 * ax + 4.0 * q2q2 * q3 - _2q2 * ay;

            let norm_sq = s0 * s0 + s1 * s1 + s2 * s2 + s3 * s3;
            if norm_sq > 0.0 {
                let recip_norm = inv_sqrt(norm_sq);
                q_dot0 -= self.beta * s0 * recip_norm;
                q_dot1 -= self.beta * s1 * recip_norm;
                q_dot2 -= self.beta * s2 * recip_norm;
                q_dot3 -= self.beta * s3 * recip_norm;
            }
        }

        self.integrate(q_dot0, q_dot1, q_dot2, q_dot3);
    }

    /// 9-axis update: gravity plus the Earth's magnetic field
    fn update_marg(&mut self, accel: Sample3, gyro: Sample3, mag: Sample3) {
        let Quaternion { q0, q1, q2, q3 } = self.q;
        let Sample3 {
            x: gx,
            y: gy,
            z: gz,
        } = gyro;
        let Sample3 {
            x: mut ax,
            y: mut ay,
            z: mut az,
        } = accel;
        let Sample3 {
            x: mut mx,
            y: mut my,
            z: mut mz,
        } = mag;

        let mut q_dot0 = 0.5 * (-q1 * gx - q2 * gy - q3 * gz);
        let mut q_dot1 = 0.5 * (q0 * gx + q2 * gz - q3 * gy);
        let mut q_dot2 = 0.5 * (q0 * gy - q1 * gz + q3 * gx);
        let mut q_dot3 = 0.5 * (q0 * gz + q1 * gy - q2 * gx);

        if !accel.is_zero() {
            let recip_norm = inv_sqrt(ax * ax + ay * ay + az * az);
            ax *= recip_norm;
            ay *= recip_norm;
            az *= recip_norm;

            let recip_norm = inv_sqrt(mx * mx + my * my + mz * mz);
            mx *= recip_norm;
            my *= recip_norm;
            mz *= recip_norm;

            let _2q0mx = 2.0 * q0 * mx;
            let _2q0my = 2.0 * q0 * my;
            let _2q0mz = 2.0 * q0 * mz;
            let _2q1mx = 2.0 * q1 * mx;
            let _2q0 = 2.0 * q0;
            let _2q1 = 2.0 * q1;
            let _2q2 = 2.0 * q2;
            let _2q3 = 2.0 * q3;
            let _2q0q2 = 2.0 * q0 * q2;
            let _2q2q3 = 2.0 * q2 * q3;
            let q0q0 = q0 * q0;
            let q0q1 = q0 * q1;
            let q0q2 = q0 * q2;
            let q0q3 = q0 * q3;
            let q1q1 = q1 * q1;
            let q1q2 = q1 * q2;
            let q1q3 = q1 * q3;
            let q2q2 = q2 * q2;
            let q2q3 = q2 * q3;
            let q3q3 = q3 * q3;

            // Reference direction of the Earth's magnetic field
            let hx = mx * q0q0 - _2q0my * q3 + _2q0mz * q2 + mx * q1q1 + _2q1 * my * q2
                + _2q1 * mz * q3
                - mx * q2q2
                - mx * q3q3;
            let hy = _2q0mx * q3 + my * q0q0 - _2q0mz * q1 + _2q1mx * q2 - my * q1q1
                + my * q2q2
                + _2q2 * mz * q3
                - my * q3q3;
            let _2bx = (hx * hx + hy * hy).sqrt();
            let _2bz = -_2q0mx * q2 + _2q0my * q1 + mz * q0q0 + _2q1mx * q3 - mz * q1q1
                + _2q2 * my * q3
                - mz * q2q2
                + mz * q3q3;
            let _4bx = 2.0 * _2bx;
            let _4bz = 2.0 * _2bz;

            // Gradient-descent corrective step
            let s0 = -_2q2 * (2.0 * q1q3 - _2q0q2 - ax) + _2q1 * (2.0 * q0q1 + _2q2q3 - ay)
                - _2bz * q2 * (_2bx * (0.5 - q2q2 - q3q3) + _2bz * (q1q3 - q0q2) - mx)
                + (-_2bx * q3 + _2bz * q1)
                    * (_2bx * (q1q2 - q0q3) + _2bz * (q0q1 + q2q3) - my)
                + _2bx * q2 * (_2bx * (q0q2 + q1q3) + _2bz * (0.5 - q1q1 - q2q2) - mz);
            let s1 = _2q3 * (2.0 * q1q3 - _2q0q2 - ax) + _2q0 * (2.0 * q0q1 + _2q2q3 - ay)
                - 4.0 * q1 * (1.0 - 2.0 * q1q1 - 2.0 * q2q2 - az)
                + _2bz * q3 * (_2bx * (0.5 - q2q2 - q3q3) + _2bz * (q1q3 - q0q2) - mx)
                + (_2bx * q2 + _2bz * q0)
                    * (_2bx * (q1q2 - q0q3) + _2bz * (q0q1 + q2q3) - my)
                + (_2bx * q3 - _4bz * q1)
                    * (_2bx * (q0q2 + q1q3) + _2bz * (0.5 - q1q1 - q2q2) - mz);
            let s2 = -_2q0 * (2.0 * q1q3 - _2q0q2 - ax) + _2q3 * (2.0 * q0q1 + _2q2q3 - ay)
                - 4.0 * q2 * (1.0 - 2.0 * q1q1 - 2.0 * q2q2 - az)
                + (-_4bx * q2 - _2bz * q0)
                    * (_2bx * (0.5 - q2q2 - q3q3) + _2bz * (q1q3 - q0q2) - mx)
                + (_2bx * q1 + _2bz * q3)
                    * (_2bx * (q1q2 - q0q3) + _2bz * (q0q1 + q2q3) - my)
                + (_2bx * q0 - _4bz * q2)
                    * (_2bx * (q0q2 + q1q3) + _2bz * (0.5 - q1q1 - q2q2) - mz);
            let s3 = _2q1 * (2.0 * q1q3 - _2q0q2 - ax) + _2q2 * (2.0 * q0q1 + _2q2q3 - ay)
                + (-_4bx * q3 + _2bz * q1)
                    * (_2bx * (0.5 - q2q2 - q3q3) + _2bz * (q1q3 - q0q2) - mx)
                + (-_2bx * q0 + _2bz * q2)
                    * (_2bx * (q1q2 - q0q3) + _2bz * (q0q1 + q2q3) - my)
                + _2bx * q1 * (_2bx * (q0q2 + q1q3) + _2bz * (0.5 - q1q1 - q2q2) - mz);

            let norm_sq = s0 * s0 + s1 * s1 + s2 * s2 + s3 * s3;
            if norm_sq > 0.0 {
                let recip_norm = inv_sqrt(norm_sq);
                q_dot0 -= self.beta * s0 * recip_norm;
                q_dot1 -= self.beta * s1 * recip_norm;
                q_dot2 -= self.beta * s2 * recip_norm;
                q_dot3 -= self.beta * s3 * recip_norm;
            }
        }

        self.integrate(q_dot0, q_dot1, q_dot2, q_dot3);
    }

    /// Integrate the quaternion derivative over one sample period and
    /// renormalize. The renormalization runs on every call; without it
    /// floating-point error walks the state off the unit hypersphere.
    fn integrate(&mut self, q_dot0: f64, q_dot1: f64, q_dot2: f64, q_dot3: f64) {
        let dt = 1.0 / self.sample_freq;
        self.q.q0 += q_dot0 * dt;
        self.q.q1 += q_dot1 * dt;
        self.q.q2 += q_dot2 * dt;
        self.q.q3 += q_dot3 * dt;

        let recip_norm = inv_sqrt(
            self.q.q0 * self.q.q0
                + self.q.q1 * self.q.q1
                + self.q.q2 * self.q.q2
                + self.q.q3 * self.q.q3,
        );
        self.q.q0 *= recip_norm;
        self.q.q1 *= recip_norm;
        self.q.q2 *= recip_norm;
        self.q.q3 *= recip_norm;
    }
}

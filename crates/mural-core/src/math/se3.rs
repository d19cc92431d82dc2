use nalgebra::{Isometry3, Matrix3, Translation3, UnitQuaternion, Vector3};

use super::utils::skew_symmetric;

/// Rigid transform. Poses are stored world→camera (`pose_cw`) unless noted.
pub type TransformSE3 = Isometry3<f64>;

/// Tangent-space increment: rotation `omega` (axis-angle) and translation `v`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Twist {
    pub omega: Vector3<f64>,
    pub v: Vector3<f64>,
}

impl Twist {
    pub fn new(omega: Vector3<f64>, v: Vector3<f64>) -> Self {
        Self { omega, v }
    }

    /// Splits a stacked `[v, omega]` Gauss-Newton step.
    pub fn from_stacked(delta: &nalgebra::SVector<f64, 6>) -> Self {
        Self {
            omega: Vector3::new(delta[3], delta[4], delta[5]),
            v: Vector3::new(delta[0], delta[1], delta[2]),
        }
    }
}

/// SE(3) exponential map.
pub fn exp(twist: &Twist) -> TransformSE3 {
    let theta = twist.omega.norm();
    let omega_hat = skew_symmetric(&twist.omega);
    let omega_hat_sq = omega_hat * omega_hat;

    let (s, c) = if theta < 1e-9 {
        (0.5, 1.0 / 6.0)
    } else {
        let theta_sq = theta * theta;
        (
            (1.0 - theta.cos()) / theta_sq,
            (theta - theta.sin()) / (theta_sq * theta),
        )
    };
    let v_matrix = Matrix3::identity() + s * omega_hat + c * omega_hat_sq;

    log::trace!(target: "mural_core::math", "se3 exp: theta={theta:.6}");

    TransformSE3::from_parts(
        Translation3::from(v_matrix * twist.v),
        UnitQuaternion::from_scaled_axis(twist.omega),
    )
}

/// Angle in radians of the relative rotation between two poses.
pub fn rotation_angle_between(a: &TransformSE3, b: &TransformSE3) -> f64 {
    a.rotation.angle_to(&b.rotation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn exp_of_zero_is_identity() {
        let pose = exp(&Twist::new(Vector3::zeros(), Vector3::zeros()));
        assert_relative_eq!(pose.to_homogeneous(), TransformSE3::identity().to_homogeneous());
    }

    #[test]
    fn exp_of_pure_translation() {
        let pose = exp(&Twist::new(Vector3::zeros(), Vector3::new(1.0, -2.0, 0.5)));
        assert_relative_eq!(pose.translation.vector, Vector3::new(1.0, -2.0, 0.5));
        assert_relative_eq!(pose.rotation.angle(), 0.0);
    }

    #[test]
    fn exp_rotation_matches_axis_angle() {
        let omega = Vector3::new(0.0, 0.0, std::f64::consts::FRAC_PI_2);
        let pose = exp(&Twist::new(omega, Vector3::new(1.0, 0.0, 0.0)));
        assert_relative_eq!(pose.rotation.angle(), std::f64::consts::FRAC_PI_2, epsilon = 1e-12);
        // Quarter turn about z bends the x translation into the first quadrant.
        let t = pose.translation.vector;
        assert!(t.x > 0.0 && t.y > 0.0);
        assert_relative_eq!(t.z, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn rotation_angle_between_poses() {
        let a = TransformSE3::identity();
        let b = exp(&Twist::new(Vector3::new(0.2, 0.0, 0.0), Vector3::zeros()));
        assert_relative_eq!(rotation_angle_between(&a, &b), 0.2, epsilon = 1e-12);
    }
}

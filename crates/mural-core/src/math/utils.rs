use nalgebra::{Matrix3, Vector3};

/// Returns the cross-product matrix `[v]x` such that `[v]x * w == v.cross(&w)`.
pub fn skew_symmetric(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Projects a near-rotation onto SO(3) via SVD, flipping the last singular
/// direction when the result would otherwise be a reflection.
pub fn nearest_rotation(m: &Matrix3<f64>) -> Option<Matrix3<f64>> {
    let svd = m.svd(true, true);
    let mut u = svd.u?;
    let v_t = svd.v_t?;
    if (u * v_t).determinant() < 0.0 {
        let mut last = u.column_mut(2);
        last *= -1.0;
    }
    Some(u * v_t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Rotation3;

    #[test]
    fn skew_matches_cross_product() {
        let a = Vector3::new(0.3, -1.2, 2.0);
        let b = Vector3::new(-0.7, 0.4, 0.9);
        assert_relative_eq!(skew_symmetric(&a) * b, a.cross(&b), epsilon = 1e-12);
    }

    #[test]
    fn nearest_rotation_cleans_scaled_rotation() {
        let r = Rotation3::from_euler_angles(0.1, -0.3, 0.7).into_inner();
        let noisy = r * 1.7;
        let cleaned = nearest_rotation(&noisy).unwrap();
        assert_relative_eq!(cleaned, r, epsilon = 1e-9);
        assert_relative_eq!(cleaned.determinant(), 1.0, epsilon = 1e-9);
    }
}

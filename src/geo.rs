//! Great-circle distance on a spherical Earth.

pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = phi2 - phi1;
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    // Rounding can push `a` just outside [0, 1] near identical or antipodal points.
    let a = a.clamp(0.0, 1.0);
    2.0 * EARTH_RADIUS_M * a.sqrt().asin()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    #[test]
    fn identical_points_are_zero_apart() {
        assert_eq!(haversine_m(12.5, -77.25, 12.5, -77.25), 0.0);
        assert_eq!(haversine_m(90.0, 0.0, 90.0, 0.0), 0.0);
    }

    #[test]
    fn distance_is_symmetric() {
        let ab = haversine_m(27.7, 85.3, 28.2, 83.9);
        let ba = haversine_m(28.2, 83.9, 27.7, 85.3);
        assert_eq!(ab, ba);
    }

    #[test]
    fn antipodal_points_are_half_circumference_apart() {
        let d = haversine_m(0.0, 0.0, 0.0, 180.0);
        assert!((d - PI * EARTH_RADIUS_M).abs() < 1e-6);
        let poles = haversine_m(90.0, 0.0, -90.0, 0.0);
        assert!(poles.is_finite());
        assert!((poles - PI * EARTH_RADIUS_M).abs() < 1e-6);
    }

    #[test]
    fn one_degree_of_latitude_is_about_111_km() {
        let d = haversine_m(0.0, 10.0, 1.0, 10.0);
        assert!((d - 111_195.08).abs() < 1.0, "d={d}");
    }
}

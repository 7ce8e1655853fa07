//! RDNAP: WGS 84 <-> RD New (EPSG:28992) transformation for the Netherlands.
//!
//! - Forward (lon/lat degrees -> x/y meters): Schreutelkamp / Strang van Hees
//!   polynomial approximation around the Amersfoort base point.
//! - Inverse (x/y -> lon/lat): published inverse polynomial as the initial
//!   guess, refined with Newton iterations against the forward polynomial, so
//!   the pair round-trips to sub-millimeter everywhere inside the valid
//!   domain.
//! - Inputs far outside the Dutch extent are rejected with
//!   [`OutOfDomainError`] instead of producing silently-garbage coordinates.
//!
//! All functions are pure; [`RdNew`] is `Send + Sync` and safe to share
//! across threads without synchronization.

use thiserror::Error;

/// Amersfoort base point of the RD New grid.
pub mod base {
    /// Base latitude (Onze Lieve Vrouwetoren, Amersfoort), degrees.
    pub const LAT0_DEG: f64 = 52.155_174_40;

    /// Base longitude, degrees.
    pub const LON0_DEG: f64 = 5.387_206_21;

    /// False easting, meters.
    pub const X0_M: f64 = 155_000.0;

    /// False northing, meters.
    pub const Y0_M: f64 = 463_000.0;
}

/// Coordinate pair rejected because it lies outside the supported domain.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
#[error("coordinates ({a:.6}, {b:.6}) outside the {system} domain")]
pub struct OutOfDomainError {
    /// First coordinate as supplied (lon or x).
    pub a: f64,
    /// Second coordinate as supplied (lat or y).
    pub b: f64,
    /// Which reference system rejected the pair.
    pub system: &'static str,
}

/// Axis-aligned validity window for one reference system.
#[derive(Debug, Clone, Copy)]
pub struct Domain {
    pub a_min: f64,
    pub a_max: f64,
    pub b_min: f64,
    pub b_max: f64,
}

impl Domain {
    #[inline]
    fn contains(&self, a: f64, b: f64) -> bool {
        a.is_finite()
            && b.is_finite()
            && (self.a_min..=self.a_max).contains(&a)
            && (self.b_min..=self.b_max).contains(&b)
    }
}

// Forward polynomial terms: (p, q, coefficient) applied as c * dphi^p * dlam^q,
// with dphi = 0.36 * (lat - LAT0), dlam = 0.36 * (lon - LON0).
const RD_X_TERMS: &[(u32, u32, f64)] = &[
    (0, 1, 190_094.945),
    (1, 1, -11_832.228),
    (2, 1, -114.221),
    (0, 3, -32.391),
    (1, 0, -0.705),
    (3, 1, -2.340),
    (1, 3, -0.608),
    (0, 2, -0.008),
    (2, 3, 0.148),
];

const RD_Y_TERMS: &[(u32, u32, f64)] = &[
    (1, 0, 309_056.544),
    (0, 2, 3_638.893),
    (2, 0, 73.077),
    (1, 2, -157.984),
    (3, 0, 59.788),
    (0, 1, 0.433),
    (2, 2, -6.439),
    (1, 1, -0.032),
    (0, 4, 0.092),
    (1, 4, -0.054),
];

// Inverse polynomial terms: (p, q, coefficient) applied as c * dx^p * dy^q,
// with dx = (x - X0) * 1e-5, dy = (y - Y0) * 1e-5; result in arc seconds.
const WGS_LAT_TERMS: &[(u32, u32, f64)] = &[
    (0, 1, 3_235.653_89),
    (2, 0, -32.582_97),
    (0, 2, -0.247_50),
    (2, 1, -0.849_78),
    (0, 3, -0.065_50),
    (2, 2, -0.017_09),
    (1, 0, -0.007_38),
    (4, 0, 0.005_30),
    (2, 3, -0.000_39),
    (4, 1, 0.000_33),
    (1, 1, -0.000_12),
];

const WGS_LON_TERMS: &[(u32, u32, f64)] = &[
    (1, 0, 5_260.529_16),
    (1, 1, 105.946_84),
    (1, 2, 2.456_56),
    (3, 0, -0.818_85),
    (1, 3, 0.055_94),
    (3, 1, -0.056_07),
    (0, 1, 0.011_99),
    (3, 2, -0.002_56),
    (1, 4, 0.001_28),
    (0, 2, 0.000_22),
    (2, 0, -0.000_22),
    (5, 0, 0.000_26),
];

#[inline]
fn eval_terms(terms: &[(u32, u32, f64)], u: f64, v: f64) -> f64 {
    terms
        .iter()
        .map(|&(p, q, c)| c * u.powi(p as i32) * v.powi(q as i32))
        .sum()
}

/// Transformer between WGS 84 lon/lat (degrees, always lon-first) and
/// RD New x/y (meters).
///
/// Carries the validity windows explicitly so callers can see and, if
/// needed, widen the accepted extent; [`RdNew::default`] uses the official
/// RD validity bounds plus a geographic box around the Netherlands.
#[derive(Debug, Clone, Copy)]
pub struct RdNew {
    /// Accepted geographic window (lon, lat in degrees).
    pub geographic: Domain,
    /// Accepted projected window (x, y in meters).
    pub projected: Domain,
}

impl Default for RdNew {
    fn default() -> Self {
        Self {
            // Chosen to strictly contain the image of the projected window,
            // so any in-domain (x, y) round-trips without tripping the
            // geographic check.
            geographic: Domain {
                a_min: 2.8,
                a_max: 7.8,
                b_min: 50.5,
                b_max: 53.8,
            },
            projected: Domain {
                a_min: -7_000.0,
                a_max: 300_000.0,
                b_min: 289_000.0,
                b_max: 629_000.0,
            },
        }
    }
}

impl RdNew {
    pub fn new() -> Self {
        Self::default()
    }

    /// WGS 84 (lon, lat) -> RD New (x, y) in meters.
    pub fn to_rd(&self, lon: f64, lat: f64) -> Result<(f64, f64), OutOfDomainError> {
        if !self.geographic.contains(lon, lat) {
            return Err(OutOfDomainError {
                a: lon,
                b: lat,
                system: "WGS84",
            });
        }
        Ok(forward(lon, lat))
    }

    /// RD New (x, y) -> WGS 84 (lon, lat).
    ///
    /// Exact inverse of [`RdNew::to_rd`] to well below a millimeter: the
    /// polynomial estimate is polished with Newton steps on the forward map.
    pub fn to_wgs84(&self, x: f64, y: f64) -> Result<(f64, f64), OutOfDomainError> {
        if !self.projected.contains(x, y) {
            return Err(OutOfDomainError {
                a: x,
                b: y,
                system: "RD",
            });
        }

        let (mut lon, mut lat) = inverse_estimate(x, y);

        // Newton iteration on the 2x2 system forward(lon, lat) = (x, y).
        // The forward map is nearly affine at this scale; two iterations land
        // far inside the 1e-4 m tolerance, the loop bound is a safety net.
        const H: f64 = 1e-7; // finite-difference step, degrees
        for _ in 0..8 {
            let (fx, fy) = forward(lon, lat);
            let (rx, ry) = (fx - x, fy - y);
            if rx.abs() < 1e-7 && ry.abs() < 1e-7 {
                break;
            }

            let (fx_lon, fy_lon) = forward(lon + H, lat);
            let (fx_lat, fy_lat) = forward(lon, lat + H);
            let j11 = (fx_lon - fx) / H;
            let j12 = (fx_lat - fx) / H;
            let j21 = (fy_lon - fy) / H;
            let j22 = (fy_lat - fy) / H;

            let det = j11 * j22 - j12 * j21;
            if det.abs() < 1e-12 {
                break;
            }

            lon -= (rx * j22 - ry * j12) / det;
            lat -= (ry * j11 - rx * j21) / det;
        }

        Ok((lon, lat))
    }
}

#[inline]
fn forward(lon: f64, lat: f64) -> (f64, f64) {
    let dphi = 0.36 * (lat - base::LAT0_DEG);
    let dlam = 0.36 * (lon - base::LON0_DEG);

    let x = base::X0_M + eval_terms(RD_X_TERMS, dphi, dlam);
    let y = base::Y0_M + eval_terms(RD_Y_TERMS, dphi, dlam);

    (x, y)
}

#[inline]
fn inverse_estimate(x: f64, y: f64) -> (f64, f64) {
    let dx = (x - base::X0_M) * 1e-5;
    let dy = (y - base::Y0_M) * 1e-5;

    let lat = base::LAT0_DEG + eval_terms(WGS_LAT_TERMS, dx, dy) / 3600.0;
    let lon = base::LON0_DEG + eval_terms(WGS_LON_TERMS, dx, dy) / 3600.0;

    (lon, lat)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn transformer_is_shareable() {
        assert_send_sync::<RdNew>();
    }

    #[test]
    fn base_point_maps_to_false_origin() {
        let tr = RdNew::new();
        let (x, y) = tr.to_rd(base::LON0_DEG, base::LAT0_DEG).unwrap();
        assert!((x - base::X0_M).abs() < 1e-6, "x = {x}");
        assert!((y - base::Y0_M).abs() < 1e-6, "y = {y}");
    }

    #[test]
    fn westertoren_reference_point() {
        // Validation point from the polynomial publication:
        // Westertoren, Amsterdam.
        let tr = RdNew::new();
        let (x, y) = tr.to_rd(4.905_953_791, 52.372_143_838).unwrap();
        assert!((x - 120_700.723).abs() < 0.5, "x = {x}");
        assert!((y - 487_525.501).abs() < 0.5, "y = {y}");
    }

    #[test]
    fn round_trip_is_sub_millimeter() {
        let tr = RdNew::new();
        let mut x = 10_000.0;
        while x < 280_000.0 {
            let mut y = 305_000.0;
            while y < 620_000.0 {
                let (lon, lat) = tr.to_wgs84(x, y).unwrap();
                let (x2, y2) = tr.to_rd(lon, lat).unwrap();
                assert!(
                    (x2 - x).abs() < 1e-3 && (y2 - y).abs() < 1e-3,
                    "round trip drifted at ({x}, {y}): ({x2}, {y2})"
                );
                y += 35_000.0;
            }
            x += 30_000.0;
        }
    }

    #[test]
    fn geographic_round_trip() {
        let tr = RdNew::new();
        for &(lon, lat) in &[
            (4.9, 52.37),  // Amsterdam
            (4.48, 51.92), // Rotterdam
            (6.57, 53.22), // Groningen
            (5.69, 50.85), // Maastricht
        ] {
            let (x, y) = tr.to_rd(lon, lat).unwrap();
            let (lon2, lat2) = tr.to_wgs84(x, y).unwrap();
            // 1e-8 deg is well under a millimeter at this latitude.
            assert!((lon2 - lon).abs() < 1e-8, "lon {lon} -> {lon2}");
            assert!((lat2 - lat).abs() < 1e-8, "lat {lat} -> {lat2}");
        }
    }

    #[test]
    fn rejects_out_of_domain_input() {
        let tr = RdNew::new();
        assert!(tr.to_rd(0.0, 0.0).is_err());
        assert!(tr.to_rd(4.9, 89.0).is_err());
        assert!(tr.to_rd(f64::NAN, 52.0).is_err());
        assert!(tr.to_wgs84(500_000.0, 463_000.0).is_err());
        assert!(tr.to_wgs84(155_000.0, -1.0).is_err());

        let err = tr.to_rd(120.0, 30.0).unwrap_err();
        assert_eq!(err.system, "WGS84");
    }
}

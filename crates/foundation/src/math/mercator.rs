use crate::bounds::{GeoBounds, MercBounds};

/// EPSG:3857 sphere radius (meters).
pub const EPSG3857_R: f64 = 6_378_137.0;
/// Half the projected world width (meters).
pub const WM_RANGE: f64 = 20_037_508.342_789_244;
/// Projected meters per degree of longitude.
pub const EPSG3857_DEG: f64 = WM_RANGE / 180.0;
/// Latitude at which Web Mercator y reaches `WM_RANGE`.
pub const MAX_MERC_LAT: f64 = 85.051_128_779_806_6;

const DEG_TO_TAU: f64 = std::f64::consts::PI / 360.0;

pub fn lon_to_merc(lon: f64) -> f64 {
    lon * EPSG3857_DEG
}

/// Latitude to projected y. Clamped to the Mercator limit so poles stay finite.
pub fn lat_to_merc(lat: f64) -> f64 {
    let lat = lat.clamp(-MAX_MERC_LAT, MAX_MERC_LAT);
    (DEG_TO_TAU * (lat + 90.0)).tan().ln() * EPSG3857_R
}

pub fn to_mercator([lon, lat]: [f64; 2]) -> [f64; 2] {
    [lon_to_merc(lon), lat_to_merc(lat)]
}

/// Projected meters, `[west, south, east, north]`.
pub fn bounds_to_mercator(b: &GeoBounds) -> [f64; 4] {
    [
        lon_to_merc(b.west),
        lat_to_merc(b.south),
        lon_to_merc(b.east),
        lat_to_merc(b.north),
    ]
}

/// Projected meters to normalized texture space (`y` flipped).
pub fn norm_merc(m: [f64; 4]) -> MercBounds {
    let scale = WM_RANGE * 2.0;
    MercBounds {
        west: m[0] / scale + 0.5,
        south: -m[1] / scale + 0.5,
        east: m[2] / scale + 0.5,
        north: -m[3] / scale + 0.5,
    }
}

pub fn norm_merc_point([x, y]: [f64; 2]) -> [f64; 2] {
    let scale = WM_RANGE * 2.0;
    [x / scale + 0.5, -y / scale + 0.5]
}

#[cfg(test)]
mod tests {
    use super::{GeoBounds, MAX_MERC_LAT, WM_RANGE, bounds_to_mercator, lat_to_merc, norm_merc};

    fn assert_close(a: f64, b: f64, eps: f64) {
        let diff = (a - b).abs();
        assert!(diff <= eps, "expected {a} ~= {b} (diff {diff})");
    }

    #[test]
    fn mercator_limit_maps_to_world_edge() {
        assert_close(lat_to_merc(MAX_MERC_LAT), WM_RANGE, 1e-3);
        assert_close(lat_to_merc(0.0), 0.0, 1e-6);
        assert!(lat_to_merc(90.0).is_finite());
    }

    #[test]
    fn world_normalizes_to_unit_square() {
        let b = GeoBounds::new(-180.0, -90.0, 180.0, 90.0);
        let n = norm_merc(bounds_to_mercator(&b));
        assert_close(n.west, 0.0, 1e-9);
        assert_close(n.east, 1.0, 1e-9);
        assert_close(n.south, 1.0, 1e-9);
        assert_close(n.north, 0.0, 1e-9);
    }

    #[test]
    fn normalized_x_preserves_ordering() {
        let n = norm_merc(bounds_to_mercator(&GeoBounds::new(10.0, 20.0, 30.0, 40.0)));
        assert!(n.west < n.east);
        assert!(n.height() > 0.0);
    }
}

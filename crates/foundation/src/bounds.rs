/// Geographic bounds in degrees, `[west, south, east, north]` on the wire.
#[derive(Copy, Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct GeoBounds {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl GeoBounds {
    pub const fn new(west: f64, south: f64, east: f64, north: f64) -> Self {
        GeoBounds {
            west,
            south,
            east,
            north,
        }
    }

    pub fn lon_span(&self) -> f64 {
        self.east - self.west
    }

    pub fn lat_span(&self) -> f64 {
        self.north - self.south
    }

    pub fn to_array(self) -> [f64; 4] {
        [self.west, self.south, self.east, self.north]
    }
}

impl From<[f64; 4]> for GeoBounds {
    fn from(b: [f64; 4]) -> Self {
        GeoBounds::new(b[0], b[1], b[2], b[3])
    }
}

impl From<GeoBounds> for [f64; 4] {
    fn from(b: GeoBounds) -> Self {
        b.to_array()
    }
}

/// Bounds in normalized Web Mercator texture space.
///
/// `x` grows eastward, `y` grows southward, so for ordinary bounds
/// `west < east` and `south > north`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct MercBounds {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl MercBounds {
    pub fn width(&self) -> f64 {
        self.east - self.west
    }

    /// Positive height (`south - north` in the flipped y axis).
    pub fn height(&self) -> f64 {
        self.south - self.north
    }
}

#[cfg(test)]
mod tests {
    use super::GeoBounds;

    #[test]
    fn serializes_as_array() {
        let b = GeoBounds::new(-10.0, 40.0, 30.0, 60.0);
        let json = serde_json::to_string(&b).unwrap();
        assert_eq!(json, "[-10.0,40.0,30.0,60.0]");
        let back: GeoBounds = serde_json::from_str(&json).unwrap();
        assert_eq!(back, b);
        assert_eq!(back.lon_span(), 40.0);
        assert_eq!(back.lat_span(), 20.0);
    }
}

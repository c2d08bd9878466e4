use foundation::bounds::GeoBounds;
use glam::{DAffine2, DVec2};

use crate::uv::UvImage;

/// Point lookups of u/v on the CPU, for tooltips and tooling.
///
/// Works on the source grid directly (no reprojection): longitude and
/// latitude map linearly to pixel columns and bottom-up rows.
#[derive(Debug, Clone)]
pub struct UvSampler {
    deg_to_pixel: DAffine2,
}

impl UvSampler {
    pub fn new([width, height]: [u32; 2], bounds: &GeoBounds) -> Self {
        let scale = DVec2::new(
            f64::from(width) / bounds.lon_span(),
            f64::from(height) / bounds.lat_span(),
        );
        let deg_to_pixel = DAffine2::from_scale(scale)
            * DAffine2::from_translation(DVec2::new(-bounds.west, -bounds.south));
        Self { deg_to_pixel }
    }

    pub fn to_pixel(&self, [lon, lat]: [f64; 2]) -> [f64; 2] {
        self.deg_to_pixel.transform_point2(DVec2::new(lon, lat)).into()
    }

    /// Bilinear sample in code space, converted to m/s.
    pub fn sample(&self, image: &UvImage, coord: [f64; 2]) -> [f32; 2] {
        let [x, y] = self.to_pixel(coord);
        let (ix, iy) = (x.floor(), y.floor());
        let (fx, fy) = ((x - ix) as f32, (y - iy) as f32);
        let (ix, iy) = (ix as i64, iy as i64);
        let code = |x, y| {
            let [u, v] = image.code_at(x, y);
            [f32::from(u), f32::from(v)]
        };
        let row0 = lerp2(code(ix, iy), code(ix + 1, iy), fx);
        let row1 = lerp2(code(ix, iy + 1), code(ix + 1, iy + 1), fx);
        let [u, v] = lerp2(row0, row1, fy);
        [
            crate::uv::code_to_speed(u),
            crate::uv::code_to_speed(v),
        ]
    }

    /// Sample two consecutive snapshots and blend by `mix` in `[0, 1]`.
    pub fn sample_between(
        &self,
        a: &UvImage,
        b: &UvImage,
        coord: [f64; 2],
        mix: f32,
    ) -> [f32; 2] {
        lerp2(self.sample(a, coord), self.sample(b, coord), mix)
    }
}

fn lerp2(a: [f32; 2], b: [f32; 2], t: f32) -> [f32; 2] {
    [a[0] + (b[0] - a[0]) * t, a[1] + (b[1] - a[1]) * t]
}

#[cfg(test)]
mod tests {
    use super::UvSampler;
    use crate::uv::UvImage;
    use foundation::bounds::GeoBounds;

    fn close(a: [f32; 2], b: [f32; 2]) -> bool {
        (a[0] - b[0]).abs() < 0.05 && (a[1] - b[1]).abs() < 0.05
    }

    #[test]
    fn degrees_map_to_bottom_up_pixels() {
        let s = UvSampler::new([360, 180], &GeoBounds::new(-180.0, -90.0, 180.0, 90.0));
        assert_eq!(s.to_pixel([-180.0, -90.0]), [0.0, 0.0]);
        assert_eq!(s.to_pixel([0.0, 0.0]), [180.0, 90.0]);
    }

    #[test]
    fn bilinear_between_pixels() {
        let img = UvImage::from_fn(4, 4, |x, y| [x as f32 * 4.0, y as f32 * -2.0]);
        let s = UvSampler::new([4, 4], &GeoBounds::new(0.0, 0.0, 4.0, 4.0));
        assert!(close(s.sample(&img, [1.0, 2.0]), [4.0, -4.0]));
        assert!(close(s.sample(&img, [1.5, 2.5]), [6.0, -5.0]));
    }

    #[test]
    fn blends_snapshots_in_time() {
        let a = UvImage::from_fn(2, 2, |_, _| [0.0, 10.0]);
        let b = UvImage::from_fn(2, 2, |_, _| [8.0, -10.0]);
        let s = UvSampler::new([2, 2], &GeoBounds::new(0.0, 0.0, 2.0, 2.0));
        assert!(close(s.sample_between(&a, &b, [0.5, 0.5], 0.25), [2.0, 5.0]));
    }
}

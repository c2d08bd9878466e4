//! 2-D affine transforms carried in homogeneous 4×4 matrices, the layout
//! GLSL `mat4` uniforms expect.

use glam::{DMat4, DVec3};

/// `translate(tx, ty) * scale(sx, sy)`.
pub fn translate_scale(tx: f64, ty: f64, sx: f64, sy: f64) -> DMat4 {
    DMat4::from_translation(DVec3::new(tx, ty, 0.0))
        * DMat4::from_scale(DVec3::new(sx, sy, 1.0))
}

/// Column-major `f32` copy for uniform upload.
pub fn to_uniform(m: &DMat4) -> [f32; 16] {
    m.to_cols_array().map(|v| v as f32)
}

pub fn transform_point(m: &DMat4, [x, y]: [f64; 2]) -> [f64; 2] {
    let p = m.transform_point3(DVec3::new(x, y, 0.0));
    [p.x, p.y]
}

/// `true` if `a * b` is the identity within `eps`.
pub fn is_inverse_pair(a: &DMat4, b: &DMat4, eps: f64) -> bool {
    (*a * *b).abs_diff_eq(DMat4::IDENTITY, eps)
}

#[cfg(test)]
mod tests {
    use super::{is_inverse_pair, transform_point, translate_scale};

    #[test]
    fn translate_then_scale_order() {
        let m = translate_scale(1.0, 2.0, 3.0, -4.0);
        assert_eq!(transform_point(&m, [1.0, 1.0]), [4.0, -2.0]);
        assert!(is_inverse_pair(&m, &m.inverse(), 1e-12));
    }
}

//! Wind snapshot images: 12-bit u and v packed into the RGB bytes of a PNG.
//!
//! ```text
//! R        G        B
//! UUUUUUUU UUUUVVVV VVVVVVVV
//! ```

use std::io::Cursor;

use image::{ImageFormat, RgbaImage};

/// Physical range covered by the 12-bit codes, m/s.
pub const UV_LIMIT: f32 = 40.0;
pub const UV_CODE_MAX: u16 = 0xFFF;

#[derive(Debug)]
pub enum DecodeError {
    Png(String),
    Size { expected: usize, actual: usize },
    Meta(serde_json::Error),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Png(msg) => write!(f, "PNG decode error: {msg}"),
            DecodeError::Size { expected, actual } => {
                write!(f, "expected {expected} bytes of RGBA, got {actual}")
            }
            DecodeError::Meta(err) => write!(f, "metadata parse error: {err}"),
        }
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DecodeError::Meta(err) => Some(err),
            _ => None,
        }
    }
}

pub fn unpack(r: u8, g: u8, b: u8) -> [u16; 2] {
    let u = (u16::from(r) << 4) | (u16::from(g) >> 4);
    let v = (u16::from(g & 0xF) << 8) | u16::from(b);
    [u, v]
}

pub fn pack([u, v]: [u16; 2]) -> [u8; 3] {
    let u = u.min(UV_CODE_MAX);
    let v = v.min(UV_CODE_MAX);
    [(u >> 4) as u8, (((u & 0xF) << 4) | (v >> 8)) as u8, (v & 0xFF) as u8]
}

pub fn code_to_speed(code: f32) -> f32 {
    code / f32::from(UV_CODE_MAX) * 2.0 * UV_LIMIT - UV_LIMIT
}

pub fn speed_to_code(speed: f32) -> u16 {
    let t = (speed.clamp(-UV_LIMIT, UV_LIMIT) + UV_LIMIT) / (2.0 * UV_LIMIT);
    (t * f32::from(UV_CODE_MAX)).round() as u16
}

/// Decoded snapshot, RGBA8 with rows bottom-up (row 0 is the southern edge).
#[derive(Debug, Clone, PartialEq)]
pub struct UvImage {
    width: u32,
    height: u32,
    rgba: Vec<u8>,
}

impl UvImage {
    pub fn from_rgba(width: u32, height: u32, rgba: Vec<u8>) -> Result<Self, DecodeError> {
        let expected = width as usize * height as usize * 4;
        if rgba.len() != expected {
            return Err(DecodeError::Size {
                expected,
                actual: rgba.len(),
            });
        }
        Ok(Self {
            width,
            height,
            rgba,
        })
    }

    /// Builds an image from a function of bottom-up pixel coordinates
    /// returning `[u, v]` in m/s.
    pub fn from_fn(width: u32, height: u32, f: impl Fn(u32, u32) -> [f32; 2]) -> Self {
        let mut rgba = Vec::with_capacity(width as usize * height as usize * 4);
        for y in 0..height {
            for x in 0..width {
                let [u, v] = f(x, y);
                let [r, g, b] = pack([speed_to_code(u), speed_to_code(v)]);
                rgba.extend_from_slice(&[r, g, b, 0xFF]);
            }
        }
        Self {
            width,
            height,
            rgba,
        }
    }

    /// PNG rows are top-down; they are flipped to match texture origin.
    pub fn decode_png(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut img = image::load_from_memory_with_format(bytes, ImageFormat::Png)
            .map_err(|e| DecodeError::Png(e.to_string()))?
            .to_rgba8();
        image::imageops::flip_vertical_in_place(&mut img);
        let (width, height) = img.dimensions();
        Ok(Self {
            width,
            height,
            rgba: img.into_raw(),
        })
    }

    pub fn encode_png(&self) -> Result<Vec<u8>, DecodeError> {
        let mut img = RgbaImage::from_raw(self.width, self.height, self.rgba.clone()).ok_or(
            DecodeError::Size {
                expected: self.width as usize * self.height as usize * 4,
                actual: self.rgba.len(),
            },
        )?;
        image::imageops::flip_vertical_in_place(&mut img);
        let mut out = Vec::new();
        img.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .map_err(|e| DecodeError::Png(e.to_string()))?;
        Ok(out)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn size(&self) -> [u32; 2] {
        [self.width, self.height]
    }

    pub fn rgba(&self) -> &[u8] {
        &self.rgba
    }

    pub fn byte_len(&self) -> usize {
        self.rgba.len()
    }

    /// Raw codes at a pixel; coordinates are clamped to the image.
    pub fn code_at(&self, x: i64, y: i64) -> [u16; 2] {
        if self.width == 0 || self.height == 0 {
            return [0, 0];
        }
        let x = x.clamp(0, i64::from(self.width) - 1) as usize;
        let y = y.clamp(0, i64::from(self.height) - 1) as usize;
        let o = (y * self.width as usize + x) * 4;
        unpack(self.rgba[o], self.rgba[o + 1], self.rgba[o + 2])
    }

    pub fn uv_at(&self, x: i64, y: i64) -> [f32; 2] {
        let [u, v] = self.code_at(x, y);
        [code_to_speed(f32::from(u)), code_to_speed(f32::from(v))]
    }
}

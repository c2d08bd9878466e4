//! Equirectangular → Web Mercator reprojection of u/v snapshots.

use foundation::bounds::{GeoBounds, MercBounds};
use foundation::math::affine::{to_uniform, translate_scale};
use foundation::math::mercator::{bounds_to_mercator, norm_merc};
use glam::DMat4;
use tracing::debug;

use crate::context::{
    Buffer, DrawMode, Framebuffer, Gl, GpuError, PixelData, TexelType, Texture, TextureFilter,
    same_context,
};
use crate::program::GpuProgram;
use crate::shaders::{QUAD_VERTEX, REPROJECT_FRAGMENT};
use crate::textures::{TextureSpec, bind_texture, create_quad_buffer, create_texture};

const INPUT_UNIT: u32 = 0;

/// Borrowed RGBA8 pixels, rows bottom-up.
#[derive(Debug, Copy, Clone)]
pub struct ImageView<'a> {
    pub width: u32,
    pub height: u32,
    pub rgba: &'a [u8],
}

struct Resources {
    gl: Gl,
    program: GpuProgram,
    quad: Buffer,
    texture: Texture,
}

impl Resources {
    fn allocate(gl: &Gl, output_size: [u32; 2]) -> Result<Self, GpuError> {
        let program = GpuProgram::compile(gl.as_ref(), "reproject", QUAD_VERTEX, REPROJECT_FRAGMENT)?;
        let quad = match create_quad_buffer(gl.as_ref()) {
            Ok(b) => b,
            Err(e) => {
                program.delete(gl.as_ref());
                return Err(e);
            }
        };
        let spec = TextureSpec::new(output_size, TextureFilter::Nearest, TexelType::UnsignedByte);
        let texture = match create_texture(gl.as_ref(), &spec, PixelData::Empty) {
            Ok(t) => t,
            Err(e) => {
                gl.delete_buffer(quad);
                program.delete(gl.as_ref());
                return Err(e);
            }
        };
        Ok(Self {
            gl: gl.clone(),
            program,
            quad,
            texture,
        })
    }

    fn release(self) {
        let gl = self.gl;
        gl.delete_texture(self.texture);
        gl.delete_buffer(self.quad);
        self.program.delete(gl.as_ref());
    }
}

/// Maps a WGS84 raster onto a Mercator-space texture.
///
/// Geometry (output size, transforms, globe span) is fixed at construction;
/// GPU resources follow whatever context `set_context` last received.
pub struct Reprojector {
    input_size: [u32; 2],
    output_size: [u32; 2],
    span_globe: bool,
    merc_bounds: MercBounds,
    tex_to_merc: DMat4,
    merc_to_tex: DMat4,
    tex_to_deg: DMat4,
    deg_to_tex: DMat4,
    resources: Option<Resources>,
}

impl Reprojector {
    /// Widens `bounds` in place when the raster is within a pixel of
    /// covering all 360° of longitude.
    pub fn new([width, height]: [u32; 2], bounds: &mut GeoBounds) -> Self {
        let edge = 360.0 - bounds.east + bounds.west;
        let edge_px = edge * f64::from(width) / 360.0;
        let span_globe = edge_px.abs().ceil() <= 1.0;
        if span_globe {
            bounds.west -= edge / 2.0;
            bounds.east += edge / 2.0;
        }

        let mb = norm_merc(bounds_to_mercator(bounds));
        let w = mb.width();
        let h = mb.height();
        let output_height = (f64::from(width) * h / w).round() as u32;

        let tex_to_merc = translate_scale(mb.west, mb.south, w, -h);
        let h_deg = bounds.lat_span() / 180.0;
        let tex_to_deg = translate_scale(mb.west, bounds.south / 180.0 + 0.5, w, h_deg);

        Self {
            input_size: [width, height],
            output_size: [width, output_height],
            span_globe,
            merc_bounds: mb,
            merc_to_tex: tex_to_merc.inverse(),
            tex_to_merc,
            deg_to_tex: tex_to_deg.inverse(),
            tex_to_deg,
            resources: None,
        }
    }

    pub fn input_size(&self) -> [u32; 2] {
        self.input_size
    }

    pub fn output_size(&self) -> [u32; 2] {
        self.output_size
    }

    pub fn span_globe(&self) -> bool {
        self.span_globe
    }

    pub fn merc_bounds(&self) -> MercBounds {
        self.merc_bounds
    }

    pub fn tex_to_merc(&self) -> &DMat4 {
        &self.tex_to_merc
    }

    pub fn merc_to_tex(&self) -> &DMat4 {
        &self.merc_to_tex
    }

    pub fn tex_to_deg(&self) -> &DMat4 {
        &self.tex_to_deg
    }

    pub fn deg_to_tex(&self) -> &DMat4 {
        &self.deg_to_tex
    }

    pub fn has_context(&self) -> bool {
        self.resources.is_some()
    }

    /// No-op for the context already held. Otherwise releases resources of
    /// the previous context and, for `Some`, allocates fresh ones.
    pub fn set_context(&mut self, gl: Option<&Gl>) -> Result<(), GpuError> {
        if same_context(self.resources.as_ref().map(|r| &r.gl), gl) {
            return Ok(());
        }
        if let Some(old) = self.resources.take() {
            old.release();
        }
        let Some(gl) = gl else {
            return Ok(());
        };
        debug!(output = ?self.output_size, "reprojector: allocating for new context");
        self.resources = Some(Resources::allocate(gl, self.output_size)?);
        Ok(())
    }

    /// Draws `image` into `target`, which must be a live framebuffer sized
    /// `output_size`. Leaves the default framebuffer bound.
    pub fn reproject(&self, image: ImageView<'_>, target: Framebuffer) -> Result<(), GpuError> {
        let r = self.resources.as_ref().ok_or(GpuError::NoContext)?;
        let gl = r.gl.as_ref();
        if !gl.is_framebuffer(target) {
            return Err(GpuError::InvalidTarget);
        }

        gl.use_program(r.program.handle());
        gl.bind_framebuffer(Some(target));

        bind_texture(gl, r.texture, INPUT_UNIT);
        if let Err(e) = gl.tex_image(
            image.width,
            image.height,
            TexelType::UnsignedByte,
            PixelData::U8(image.rgba),
        ) {
            gl.bind_framebuffer(None);
            return Err(e);
        }

        if let Some(loc) = r.program.attribute("a_pos") {
            gl.bind_attribute(r.quad, loc, 2);
        }
        r.program.set_i32(gl, "u_input", INPUT_UNIT as i32);
        r.program
            .set_vec2(gl, "u_input_size", image.width as f32, image.height as f32);
        r.program
            .set_mat4(gl, "u_tex_to_merc", &to_uniform(&self.tex_to_merc));
        r.program
            .set_mat4(gl, "u_deg_to_tex", &to_uniform(&self.deg_to_tex));

        gl.viewport(0, 0, self.output_size[0] as i32, self.output_size[1] as i32);
        gl.clear([0.0, 0.0, 0.0, 0.0]);
        gl.draw_arrays(DrawMode::Triangles, 0, 6);

        gl.bind_framebuffer(None);
        Ok(())
    }
}

impl Drop for Reprojector {
    fn drop(&mut self) {
        if let Some(r) = self.resources.take() {
            r.release();
        }
    }
}

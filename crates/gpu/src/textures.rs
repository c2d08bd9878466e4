use tracing::error;

use crate::context::{
    Buffer, Framebuffer, GpuContext, GpuError, PixelData, TexelType, Texture, TextureFilter,
    TextureWrap,
};

/// Two triangles covering the unit square.
pub const UNIT_QUAD: [f32; 12] = [0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0];

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct TextureSpec {
    pub size: [u32; 2],
    pub filter: TextureFilter,
    pub wrap_s: TextureWrap,
    pub wrap_t: TextureWrap,
    pub texel: TexelType,
}

impl TextureSpec {
    pub fn new(size: [u32; 2], filter: TextureFilter, texel: TexelType) -> Self {
        Self {
            size,
            filter,
            wrap_s: TextureWrap::ClampToEdge,
            wrap_t: TextureWrap::ClampToEdge,
            texel,
        }
    }
}

pub fn create_texture(
    gl: &dyn GpuContext,
    spec: &TextureSpec,
    data: PixelData<'_>,
) -> Result<Texture, GpuError> {
    let texture = gl.create_texture()?;
    gl.bind_texture(Some(texture));
    gl.tex_parameters(spec.filter, spec.wrap_s, spec.wrap_t);
    let uploaded = gl.tex_image(spec.size[0], spec.size[1], spec.texel, data);
    gl.bind_texture(None);
    if let Err(e) = uploaded {
        gl.delete_texture(texture);
        return Err(e);
    }
    Ok(texture)
}

/// Texture plus a framebuffer rendering into it.
pub fn create_render_target(
    gl: &dyn GpuContext,
    spec: &TextureSpec,
) -> Result<(Texture, Framebuffer), GpuError> {
    let texture = create_texture(gl, spec, PixelData::Empty)?;
    let framebuffer = match gl.create_framebuffer() {
        Ok(fb) => fb,
        Err(e) => {
            gl.delete_texture(texture);
            return Err(e);
        }
    };
    gl.bind_framebuffer(Some(framebuffer));
    gl.framebuffer_texture(texture);
    gl.bind_framebuffer(None);
    Ok((texture, framebuffer))
}

pub fn bind_texture(gl: &dyn GpuContext, texture: Texture, unit: u32) {
    gl.active_texture(unit);
    gl.bind_texture(Some(texture));
}

pub fn create_quad_buffer(gl: &dyn GpuContext) -> Result<Buffer, GpuError> {
    gl.create_buffer(&UNIT_QUAD)
}

/// Fails loudly when a required extension is missing; there is no fallback path.
pub fn require_extension(gl: &dyn GpuContext, name: &'static str) -> Result<(), GpuError> {
    if gl.has_extension(name) {
        return Ok(());
    }
    error!(extension = name, "required gpu extension unavailable");
    Err(GpuError::MissingExtension(name))
}

//! Handle-based GPU context abstraction.
//!
//! The surface mirrors a WebGL 1 context closely enough that the WebGL
//! backend is a thin translation, while the recording backend can log and
//! inspect every call for tests and headless runs.

use std::rc::Rc;

use foundation::handles::Handle;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Texture(pub Handle);

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Framebuffer(pub Handle);

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Buffer(pub Handle);

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Program(pub Handle);

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UniformLocation(pub Handle);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TextureFilter {
    Nearest,
    Linear,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TextureWrap {
    ClampToEdge,
    Repeat,
}

/// Per-channel storage type of an RGBA texture.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TexelType {
    UnsignedByte,
    HalfFloat,
    Float,
}

/// Initial texture contents. `Empty` allocates storage only.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum PixelData<'a> {
    Empty,
    U8(&'a [u8]),
    F32(&'a [f32]),
}

impl PixelData<'_> {
    pub fn len(&self) -> usize {
        match self {
            PixelData::Empty => 0,
            PixelData::U8(d) => d.len(),
            PixelData::F32(d) => d.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DrawMode {
    Points,
    Triangles,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl std::fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShaderStage::Vertex => write!(f, "vertex"),
            ShaderStage::Fragment => write!(f, "fragment"),
        }
    }
}

/// A linked program with the names of its active inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkedProgram {
    pub program: Program,
    pub uniforms: Vec<(String, UniformLocation)>,
    pub attributes: Vec<(String, u32)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpuError {
    /// `set_context` has not been called, or was called with `None`.
    NoContext,
    /// A call was made with a context other than the one resources live in.
    ContextMismatch,
    MissingExtension(&'static str),
    /// Render target missing or not a framebuffer of the current context.
    InvalidTarget,
    Compile { stage: ShaderStage, log: String },
    Link(String),
    Resource(&'static str),
    Upload(String),
}

impl std::fmt::Display for GpuError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GpuError::NoContext => write!(f, "no gpu context attached"),
            GpuError::ContextMismatch => write!(f, "gpu context does not own these resources"),
            GpuError::MissingExtension(name) => {
                write!(f, "{name} not supported by this browser/hardware")
            }
            GpuError::InvalidTarget => write!(f, "invalid render target"),
            GpuError::Compile { stage, log } => write!(f, "{stage} shader failed: {log}"),
            GpuError::Link(log) => write!(f, "program link failed: {log}"),
            GpuError::Resource(what) => write!(f, "failed to create {what}"),
            GpuError::Upload(msg) => write!(f, "texture upload failed: {msg}"),
        }
    }
}

impl std::error::Error for GpuError {}

/// Immediate-mode GPU context.
///
/// Texture parameter and upload calls apply to the texture bound on the
/// active unit. Framebuffer attachment applies to the bound framebuffer.
pub trait GpuContext {
    fn has_extension(&self, name: &str) -> bool;

    fn create_texture(&self) -> Result<Texture, GpuError>;
    fn delete_texture(&self, texture: Texture);
    fn active_texture(&self, unit: u32);
    fn bind_texture(&self, texture: Option<Texture>);
    fn tex_parameters(&self, filter: TextureFilter, wrap_s: TextureWrap, wrap_t: TextureWrap);
    fn tex_image(
        &self,
        width: u32,
        height: u32,
        texel: TexelType,
        data: PixelData<'_>,
    ) -> Result<(), GpuError>;

    fn create_framebuffer(&self) -> Result<Framebuffer, GpuError>;
    fn delete_framebuffer(&self, framebuffer: Framebuffer);
    fn is_framebuffer(&self, framebuffer: Framebuffer) -> bool;
    fn bind_framebuffer(&self, framebuffer: Option<Framebuffer>);
    fn framebuffer_texture(&self, texture: Texture);

    fn create_buffer(&self, data: &[f32]) -> Result<Buffer, GpuError>;
    fn buffer_data(&self, buffer: Buffer, data: &[f32]);
    fn delete_buffer(&self, buffer: Buffer);
    fn bind_attribute(&self, buffer: Buffer, location: u32, components: i32);
    fn disable_attribute(&self, location: u32);

    fn create_program(&self, vertex: &str, fragment: &str) -> Result<LinkedProgram, GpuError>;
    fn delete_program(&self, program: Program);
    fn use_program(&self, program: Program);
    /// The program currently in use, which the host may have changed.
    fn current_program(&self) -> Option<Program>;

    fn uniform1i(&self, location: UniformLocation, value: i32);
    fn uniform1f(&self, location: UniformLocation, value: f32);
    fn uniform2f(&self, location: UniformLocation, x: f32, y: f32);
    fn uniform4f(&self, location: UniformLocation, v: [f32; 4]);
    fn uniform1fv(&self, location: UniformLocation, values: &[f32]);
    fn uniform_matrix4(&self, location: UniformLocation, matrix: &[f32; 16]);

    fn viewport(&self, x: i32, y: i32, width: i32, height: i32);
    fn clear(&self, color: [f32; 4]);
    fn draw_arrays(&self, mode: DrawMode, first: i32, count: i32);
    fn is_blend_enabled(&self) -> bool;
    fn set_blend(&self, enabled: bool);
}

/// Shared handle to a context. Identity is pointer identity.
pub type Gl = Rc<dyn GpuContext>;

pub fn same_context(a: Option<&Gl>, b: Option<&Gl>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => std::ptr::addr_eq(Rc::as_ptr(a), Rc::as_ptr(b)),
        (None, None) => true,
        _ => false,
    }
}

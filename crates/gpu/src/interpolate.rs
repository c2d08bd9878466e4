//! Ring of three reprojected snapshots and the blend between two of them.

use foundation::time::RING_SIZE;
use glam::{DMat4, DVec3};
use tracing::debug;

use crate::context::{
    Buffer, DrawMode, Framebuffer, Gl, GpuError, TexelType, Texture, TextureFilter, TextureWrap,
    UniformLocation, same_context,
};
use crate::program::GpuProgram;
use crate::shaders::{INTERPOLATE_FRAGMENT, INTERPOLATE_VERTEX};
use crate::textures::{
    TextureSpec, create_quad_buffer, create_render_target, require_extension,
};

pub const HALF_FLOAT_EXTENSIONS: [&str; 3] = [
    "OES_texture_half_float",
    "EXT_color_buffer_half_float",
    "OES_texture_half_float_linear",
];

struct Resources {
    gl: Gl,
    textures: [Texture; RING_SIZE],
    framebuffers: [Framebuffer; RING_SIZE],
    // Only the standalone `render` path needs these.
    program: Option<GpuProgram>,
    quad: Option<Buffer>,
}

impl Resources {
    fn allocate(gl: &Gl, spec: &TextureSpec) -> Result<Self, GpuError> {
        for ext in HALF_FLOAT_EXTENSIONS {
            require_extension(gl.as_ref(), ext)?;
        }
        let mut targets = Vec::with_capacity(RING_SIZE);
        for _ in 0..RING_SIZE {
            match create_render_target(gl.as_ref(), spec) {
                Ok(t) => targets.push(t),
                Err(e) => {
                    for (t, fb) in targets {
                        gl.delete_framebuffer(fb);
                        gl.delete_texture(t);
                    }
                    return Err(e);
                }
            }
        }
        let [(t0, f0), (t1, f1), (t2, f2)] = [targets[0], targets[1], targets[2]];
        Ok(Self {
            gl: gl.clone(),
            textures: [t0, t1, t2],
            framebuffers: [f0, f1, f2],
            program: None,
            quad: None,
        })
    }

    fn release(self) {
        let gl = self.gl;
        if let Some(p) = self.program {
            p.delete(gl.as_ref());
        }
        if let Some(q) = self.quad {
            gl.delete_buffer(q);
        }
        for t in self.textures {
            gl.delete_texture(t);
        }
        for fb in self.framebuffers {
            gl.delete_framebuffer(fb);
        }
    }
}

/// Supplies two ring textures plus a mix factor to a sampling program.
///
/// Slots are addressed by `key mod 3`. Half-float storage with linear
/// filtering; horizontal wrap repeats when the data spans the globe.
pub struct Interpolator {
    size: [u32; 2],
    wrap: bool,
    tex_0: usize,
    tex_1: usize,
    tex_a: f32,
    bound: [Option<usize>; 2],
    matrix: DMat4,
    resources: Option<Resources>,
}

impl Interpolator {
    pub fn new(size: [u32; 2], wrap: bool) -> Self {
        let matrix = DMat4::from_translation(DVec3::new(0.5, 0.5, 1.0))
            * DMat4::from_scale(DVec3::new(
                f64::from(size[0]) - 1.0,
                f64::from(size[1]) - 1.0,
                1.0,
            ))
            * DMat4::from_translation(DVec3::new(0.0, 0.5, 0.0));
        Self {
            size,
            wrap,
            tex_0: 0,
            tex_1: 1,
            tex_a: 0.0,
            bound: [None, None],
            matrix,
            resources: None,
        }
    }

    pub fn size(&self) -> [u32; 2] {
        self.size
    }

    pub fn wrap(&self) -> bool {
        self.wrap
    }

    pub fn has_context(&self) -> bool {
        self.resources.is_some()
    }

    fn texture_spec(&self) -> TextureSpec {
        let mut spec = TextureSpec::new(self.size, TextureFilter::Linear, TexelType::HalfFloat);
        if self.wrap {
            spec.wrap_s = TextureWrap::Repeat;
        }
        spec
    }

    pub fn set_context(&mut self, gl: Option<&Gl>) -> Result<(), GpuError> {
        if same_context(self.resources.as_ref().map(|r| &r.gl), gl) {
            return Ok(());
        }
        if let Some(old) = self.resources.take() {
            old.release();
        }
        self.bound = [None, None];
        let Some(gl) = gl else {
            return Ok(());
        };
        debug!(size = ?self.size, wrap = self.wrap, "interpolator: allocating ring");
        self.resources = Some(Resources::allocate(gl, &self.texture_spec())?);
        Ok(())
    }

    /// Framebuffer rendering into ring slot `idx`.
    pub fn get_buffer(&self, idx: usize) -> Option<Framebuffer> {
        self.resources
            .as_ref()
            .and_then(|r| r.framebuffers.get(idx).copied())
    }

    pub fn texture(&self, idx: usize) -> Option<Texture> {
        self.resources
            .as_ref()
            .and_then(|r| r.textures.get(idx).copied())
    }

    /// Records which slots to blend and by how much. No GPU work.
    pub fn set_state(&mut self, tex_0: usize, tex_1: usize, mix: f32) {
        self.tex_0 = tex_0;
        self.tex_1 = tex_1;
        self.tex_a = mix;
    }

    pub fn state(&self) -> (usize, usize, f32) {
        (self.tex_0, self.tex_1, self.tex_a)
    }

    /// Binds the selected slots to `unit_0`/`unit_1` and uploads the mix.
    ///
    /// Binds are skipped for slots already bound by a previous call;
    /// `release_textures` must be called once the units may have been
    /// rebound by anyone else.
    pub fn bind_textures(
        &mut self,
        gl: &Gl,
        unit_0: u32,
        unit_1: u32,
        mix: Option<UniformLocation>,
    ) -> Result<(), GpuError> {
        let r = self.resources.as_ref().ok_or(GpuError::NoContext)?;
        if !same_context(Some(&r.gl), Some(gl)) {
            return Err(GpuError::ContextMismatch);
        }
        if self.bound[0] != Some(self.tex_0) {
            gl.active_texture(unit_0);
            gl.bind_texture(Some(r.textures[self.tex_0]));
            self.bound[0] = Some(self.tex_0);
        }
        if self.bound[1] != Some(self.tex_1) {
            gl.active_texture(unit_1);
            gl.bind_texture(Some(r.textures[self.tex_1]));
            self.bound[1] = Some(self.tex_1);
        }
        if let Some(loc) = mix {
            gl.uniform1f(loc, self.tex_a);
        }
        Ok(())
    }

    pub fn release_textures(&mut self) {
        self.bound = [None, None];
    }

    /// Draws the blended field to the bound framebuffer. Debug aid.
    pub fn render(&mut self) -> Result<(), GpuError> {
        let r = self.resources.as_mut().ok_or(GpuError::NoContext)?;
        let gl = r.gl.clone();
        if r.program.is_none() {
            let quad = create_quad_buffer(gl.as_ref())?;
            let program = match GpuProgram::compile(
                gl.as_ref(),
                "interpolate",
                INTERPOLATE_VERTEX,
                INTERPOLATE_FRAGMENT,
            ) {
                Ok(p) => p,
                Err(e) => {
                    gl.delete_buffer(quad);
                    return Err(e);
                }
            };
            gl.use_program(program.handle());
            program.set_mat4(
                gl.as_ref(),
                "u_matrix",
                &foundation::math::affine::to_uniform(&self.matrix),
            );
            program.set_vec2(gl.as_ref(), "u_size", self.size[0] as f32, self.size[1] as f32);
            program.set_i32(gl.as_ref(), "u_tex_0", 0);
            program.set_i32(gl.as_ref(), "u_tex_1", 1);
            r.quad = Some(quad);
            r.program = Some(program);
        }
        let (mix, attr, quad) = match (&r.program, r.quad) {
            (Some(p), Some(q)) => {
                gl.use_program(p.handle());
                (p.uniform("u_tex_a"), p.attribute("a_pos"), q)
            }
            _ => return Err(GpuError::Resource("interpolate program")),
        };
        if let Some(loc) = attr {
            gl.bind_attribute(quad, loc, 2);
        }
        self.bind_textures(&gl, 0, 1, mix)?;
        gl.viewport(0, 0, self.size[0] as i32, self.size[1] as i32);
        gl.clear([0.0, 0.0, 0.0, 0.0]);
        gl.draw_arrays(DrawMode::Triangles, 0, 6);
        Ok(())
    }
}

impl Drop for Interpolator {
    fn drop(&mut self) {
        if let Some(r) = self.resources.take() {
            r.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{HALF_FLOAT_EXTENSIONS, Interpolator};
    use crate::context::{Gl, GpuError, TexelType, TextureFilter, TextureWrap};
    use crate::recording::{Call, RecordingContext};
    use std::rc::Rc;

    fn contexts() -> (Rc<RecordingContext>, Gl) {
        let rec = Rc::new(RecordingContext::new());
        let gl: Gl = rec.clone();
        (rec, gl)
    }

    fn binds(rec: &RecordingContext) -> usize {
        rec.count(|c| matches!(c, Call::BindTexture(Some(_))))
    }

    #[test]
    fn allocates_three_half_float_targets() {
        let (rec, gl) = contexts();
        let mut interp = Interpolator::new([8, 4], true);
        interp.set_context(Some(&gl)).unwrap();
        for idx in 0..3 {
            let fb = interp.get_buffer(idx).unwrap();
            let tex = rec.framebuffer_attachment(fb).unwrap();
            assert_eq!(Some(tex), interp.texture(idx));
            let info = rec.texture_info(tex).unwrap();
            assert_eq!(info.texel, Some(TexelType::HalfFloat));
            assert_eq!(info.filter, TextureFilter::Linear);
            assert_eq!(info.wrap_s, TextureWrap::Repeat);
            assert_eq!(info.wrap_t, TextureWrap::ClampToEdge);
        }
        assert_eq!(interp.get_buffer(3), None);

        let created = rec.live_textures();
        interp.set_context(Some(&gl)).unwrap();
        assert_eq!(rec.live_textures(), created);
    }

    #[test]
    fn without_wrap_clamps_horizontally() {
        let (rec, gl) = contexts();
        let mut interp = Interpolator::new([8, 4], false);
        interp.set_context(Some(&gl)).unwrap();
        let info = rec.texture_info(interp.texture(0).unwrap()).unwrap();
        assert_eq!(info.wrap_s, TextureWrap::ClampToEdge);
    }

    #[test]
    fn missing_half_float_support_fails_loudly() {
        let (rec, gl) = contexts();
        rec.disable_extension(HALF_FLOAT_EXTENSIONS[1]);
        let mut interp = Interpolator::new([8, 4], false);
        assert_eq!(
            interp.set_context(Some(&gl)),
            Err(GpuError::MissingExtension("EXT_color_buffer_half_float"))
        );
        assert!(!interp.has_context());
        assert_eq!(rec.live_textures(), 0);
    }

    #[test]
    fn repeated_binds_are_memoized_until_released() {
        let (rec, gl) = contexts();
        let mut interp = Interpolator::new([8, 4], false);
        interp.set_context(Some(&gl)).unwrap();
        interp.set_state(0, 1, 0.5);
        rec.clear_calls();

        interp.bind_textures(&gl, 0, 1, None).unwrap();
        assert_eq!(binds(&rec), 2);
        interp.bind_textures(&gl, 0, 1, None).unwrap();
        assert_eq!(binds(&rec), 2);

        interp.release_textures();
        interp.bind_textures(&gl, 0, 1, None).unwrap();
        assert_eq!(binds(&rec), 4);

        interp.set_state(1, 2, 0.25);
        interp.bind_textures(&gl, 0, 1, None).unwrap();
        assert_eq!(binds(&rec), 6);
        assert_eq!(rec.bound_texture(1), interp.texture(2));
    }

    #[test]
    fn bind_rejects_foreign_context() {
        let (_, gl) = contexts();
        let (_, other) = contexts();
        let mut interp = Interpolator::new([2, 2], false);
        assert_eq!(
            interp.bind_textures(&gl, 0, 1, None),
            Err(GpuError::NoContext)
        );
        interp.set_context(Some(&gl)).unwrap();
        assert_eq!(
            interp.bind_textures(&other, 0, 1, None),
            Err(GpuError::ContextMismatch)
        );
    }

    #[test]
    fn standalone_render_uploads_mix() {
        let (rec, gl) = contexts();
        let mut interp = Interpolator::new([4, 4], false);
        interp.set_context(Some(&gl)).unwrap();
        interp.set_state(2, 0, 0.75);
        interp.render().unwrap();
        interp.render().unwrap();
        assert_eq!(rec.draw_count(), 2);
        assert_eq!(
            rec.last_uniform("u_tex_a"),
            Some(crate::recording::UniformValue::Float(0.75))
        );
        assert_eq!(rec.count(|c| matches!(c, Call::CreateProgram(_))), 1);
    }

    #[test]
    fn dropping_releases_ring() {
        let (rec, gl) = contexts();
        let mut interp = Interpolator::new([4, 4], false);
        interp.set_context(Some(&gl)).unwrap();
        interp.render().unwrap();
        drop(interp);
        assert_eq!(rec.live_textures(), 0);
        assert_eq!(rec.live_framebuffers(), 0);
        assert_eq!(rec.live_programs(), 0);
        assert_eq!(rec.live_buffers(), 0);
    }
}

//! WebGL 1 backend over `web_sys`.

use std::cell::RefCell;

use foundation::handles::HandleSlab;
use js_sys::Float32Array;
use wasm_bindgen::JsCast;
use web_sys::{
    WebGlBuffer, WebGlFramebuffer, WebGlProgram, WebGlRenderingContext as GL, WebGlShader,
    WebGlTexture, WebGlUniformLocation,
};

use crate::context::{
    Buffer, DrawMode, Framebuffer, GpuContext, GpuError, LinkedProgram, PixelData, Program,
    ShaderStage, TexelType, Texture, TextureFilter, TextureWrap, UniformLocation,
};

const HALF_FLOAT_OES: u32 = 0x8D61;

#[derive(Default)]
struct Objects {
    textures: HandleSlab<WebGlTexture>,
    framebuffers: HandleSlab<WebGlFramebuffer>,
    buffers: HandleSlab<WebGlBuffer>,
    programs: HandleSlab<WebGlProgram>,
    locations: HandleSlab<(Program, WebGlUniformLocation)>,
}

pub struct WebGlContext {
    gl: GL,
    objects: RefCell<Objects>,
}

impl WebGlContext {
    pub fn new(gl: GL) -> Self {
        Self {
            gl,
            objects: RefCell::new(Objects::default()),
        }
    }

    pub fn raw(&self) -> &GL {
        &self.gl
    }

    fn texture(&self, t: Texture) -> Option<WebGlTexture> {
        self.objects.borrow().textures.get(t.0).cloned()
    }

    fn framebuffer(&self, f: Framebuffer) -> Option<WebGlFramebuffer> {
        self.objects.borrow().framebuffers.get(f.0).cloned()
    }

    fn buffer(&self, b: Buffer) -> Option<WebGlBuffer> {
        self.objects.borrow().buffers.get(b.0).cloned()
    }

    fn location(&self, l: UniformLocation) -> Option<WebGlUniformLocation> {
        self.objects
            .borrow()
            .locations
            .get(l.0)
            .map(|(_, loc)| loc.clone())
    }

    fn compile(&self, stage: ShaderStage, source: &str) -> Result<WebGlShader, GpuError> {
        let kind = match stage {
            ShaderStage::Vertex => GL::VERTEX_SHADER,
            ShaderStage::Fragment => GL::FRAGMENT_SHADER,
        };
        let shader = self
            .gl
            .create_shader(kind)
            .ok_or(GpuError::Resource("shader"))?;
        self.gl.shader_source(&shader, source);
        self.gl.compile_shader(&shader);
        let ok = self
            .gl
            .get_shader_parameter(&shader, GL::COMPILE_STATUS)
            .as_bool()
            .unwrap_or(false);
        if !ok {
            let log = self.gl.get_shader_info_log(&shader).unwrap_or_default();
            self.gl.delete_shader(Some(&shader));
            return Err(GpuError::Compile { stage, log });
        }
        Ok(shader)
    }
}

fn filter_enum(f: TextureFilter) -> i32 {
    match f {
        TextureFilter::Nearest => GL::NEAREST as i32,
        TextureFilter::Linear => GL::LINEAR as i32,
    }
}

fn wrap_enum(w: TextureWrap) -> i32 {
    match w {
        TextureWrap::ClampToEdge => GL::CLAMP_TO_EDGE as i32,
        TextureWrap::Repeat => GL::REPEAT as i32,
    }
}

impl GpuContext for WebGlContext {
    fn has_extension(&self, name: &str) -> bool {
        matches!(self.gl.get_extension(name), Ok(Some(_)))
    }

    fn create_texture(&self) -> Result<Texture, GpuError> {
        let t = self
            .gl
            .create_texture()
            .ok_or(GpuError::Resource("texture"))?;
        Ok(Texture(self.objects.borrow_mut().textures.insert(t)))
    }

    fn delete_texture(&self, texture: Texture) {
        if let Some(t) = self.objects.borrow_mut().textures.remove(texture.0) {
            self.gl.delete_texture(Some(&t));
        }
    }

    fn active_texture(&self, unit: u32) {
        self.gl.active_texture(GL::TEXTURE0 + unit);
    }

    fn bind_texture(&self, texture: Option<Texture>) {
        let t = texture.and_then(|t| self.texture(t));
        self.gl.bind_texture(GL::TEXTURE_2D, t.as_ref());
    }

    fn tex_parameters(&self, filter: TextureFilter, wrap_s: TextureWrap, wrap_t: TextureWrap) {
        let gl = &self.gl;
        gl.tex_parameteri(GL::TEXTURE_2D, GL::TEXTURE_WRAP_S, wrap_enum(wrap_s));
        gl.tex_parameteri(GL::TEXTURE_2D, GL::TEXTURE_WRAP_T, wrap_enum(wrap_t));
        gl.tex_parameteri(GL::TEXTURE_2D, GL::TEXTURE_MIN_FILTER, filter_enum(filter));
        gl.tex_parameteri(GL::TEXTURE_2D, GL::TEXTURE_MAG_FILTER, filter_enum(filter));
    }

    fn tex_image(
        &self,
        width: u32,
        height: u32,
        texel: TexelType,
        data: PixelData<'_>,
    ) -> Result<(), GpuError> {
        let ty = match texel {
            TexelType::UnsignedByte => GL::UNSIGNED_BYTE,
            TexelType::HalfFloat => HALF_FLOAT_OES,
            TexelType::Float => GL::FLOAT,
        };
        let (w, h) = (width as i32, height as i32);
        let rgba = GL::RGBA as i32;
        let result = match data {
            PixelData::Empty => self
                .gl
                .tex_image_2d_with_i32_and_i32_and_i32_and_format_and_type_and_opt_u8_array(
                    GL::TEXTURE_2D,
                    0,
                    rgba,
                    w,
                    h,
                    0,
                    GL::RGBA,
                    ty,
                    None,
                ),
            PixelData::U8(bytes) => self
                .gl
                .tex_image_2d_with_i32_and_i32_and_i32_and_format_and_type_and_opt_u8_array(
                    GL::TEXTURE_2D,
                    0,
                    rgba,
                    w,
                    h,
                    0,
                    GL::RGBA,
                    ty,
                    Some(bytes),
                ),
            PixelData::F32(values) => {
                let view = Float32Array::from(values);
                self.gl
                    .tex_image_2d_with_i32_and_i32_and_i32_and_format_and_type_and_opt_array_buffer_view(
                        GL::TEXTURE_2D,
                        0,
                        rgba,
                        w,
                        h,
                        0,
                        GL::RGBA,
                        ty,
                        Some(&*view),
                    )
            }
        };
        result.map_err(|e| GpuError::Upload(format!("{e:?}")))
    }

    fn create_framebuffer(&self) -> Result<Framebuffer, GpuError> {
        let fb = self
            .gl
            .create_framebuffer()
            .ok_or(GpuError::Resource("framebuffer"))?;
        Ok(Framebuffer(self.objects.borrow_mut().framebuffers.insert(fb)))
    }

    fn delete_framebuffer(&self, framebuffer: Framebuffer) {
        if let Some(fb) = self.objects.borrow_mut().framebuffers.remove(framebuffer.0) {
            self.gl.delete_framebuffer(Some(&fb));
        }
    }

    fn is_framebuffer(&self, framebuffer: Framebuffer) -> bool {
        self.framebuffer(framebuffer)
            .is_some_and(|fb| self.gl.is_framebuffer(Some(&fb)))
    }

    fn bind_framebuffer(&self, framebuffer: Option<Framebuffer>) {
        let fb = framebuffer.and_then(|f| self.framebuffer(f));
        self.gl.bind_framebuffer(GL::FRAMEBUFFER, fb.as_ref());
    }

    fn framebuffer_texture(&self, texture: Texture) {
        let t = self.texture(texture);
        self.gl.framebuffer_texture_2d(
            GL::FRAMEBUFFER,
            GL::COLOR_ATTACHMENT0,
            GL::TEXTURE_2D,
            t.as_ref(),
            0,
        );
    }

    fn create_buffer(&self, data: &[f32]) -> Result<Buffer, GpuError> {
        let b = self
            .gl
            .create_buffer()
            .ok_or(GpuError::Resource("buffer"))?;
        self.gl.bind_buffer(GL::ARRAY_BUFFER, Some(&b));
        let view = Float32Array::from(data);
        self.gl
            .buffer_data_with_array_buffer_view(GL::ARRAY_BUFFER, &view, GL::STATIC_DRAW);
        Ok(Buffer(self.objects.borrow_mut().buffers.insert(b)))
    }

    fn buffer_data(&self, buffer: Buffer, data: &[f32]) {
        let Some(b) = self.buffer(buffer) else {
            return;
        };
        self.gl.bind_buffer(GL::ARRAY_BUFFER, Some(&b));
        let view = Float32Array::from(data);
        self.gl
            .buffer_data_with_array_buffer_view(GL::ARRAY_BUFFER, &view, GL::DYNAMIC_DRAW);
    }

    fn delete_buffer(&self, buffer: Buffer) {
        if let Some(b) = self.objects.borrow_mut().buffers.remove(buffer.0) {
            self.gl.delete_buffer(Some(&b));
        }
    }

    fn bind_attribute(&self, buffer: Buffer, location: u32, components: i32) {
        let b = self.buffer(buffer);
        self.gl.bind_buffer(GL::ARRAY_BUFFER, b.as_ref());
        self.gl.enable_vertex_attrib_array(location);
        self.gl
            .vertex_attrib_pointer_with_i32(location, components, GL::FLOAT, false, 0, 0);
    }

    fn disable_attribute(&self, location: u32) {
        self.gl.disable_vertex_attrib_array(location);
    }

    fn create_program(&self, vertex: &str, fragment: &str) -> Result<LinkedProgram, GpuError> {
        let vs = self.compile(ShaderStage::Vertex, vertex)?;
        let fs = match self.compile(ShaderStage::Fragment, fragment) {
            Ok(fs) => fs,
            Err(e) => {
                self.gl.delete_shader(Some(&vs));
                return Err(e);
            }
        };
        let gl = &self.gl;
        let raw = gl.create_program().ok_or(GpuError::Resource("program"))?;
        gl.attach_shader(&raw, &vs);
        gl.attach_shader(&raw, &fs);
        gl.link_program(&raw);
        gl.delete_shader(Some(&vs));
        gl.delete_shader(Some(&fs));
        let linked = gl
            .get_program_parameter(&raw, GL::LINK_STATUS)
            .as_bool()
            .unwrap_or(false);
        if !linked {
            let log = gl.get_program_info_log(&raw).unwrap_or_default();
            gl.delete_program(Some(&raw));
            return Err(GpuError::Link(log));
        }

        let mut objects = self.objects.borrow_mut();
        let program = Program(objects.programs.insert(raw.clone()));

        let mut attributes = Vec::new();
        let count = gl
            .get_program_parameter(&raw, GL::ACTIVE_ATTRIBUTES)
            .as_f64()
            .unwrap_or(0.0) as u32;
        for i in 0..count {
            if let Some(info) = gl.get_active_attrib(&raw, i) {
                let loc = gl.get_attrib_location(&raw, &info.name());
                if loc >= 0 {
                    attributes.push((info.name(), loc as u32));
                }
            }
        }

        let mut uniforms = Vec::new();
        let count = gl
            .get_program_parameter(&raw, GL::ACTIVE_UNIFORMS)
            .as_f64()
            .unwrap_or(0.0) as u32;
        for i in 0..count {
            let Some(info) = gl.get_active_uniform(&raw, i) else {
                continue;
            };
            let name = info.name();
            if let Some(loc) = gl.get_uniform_location(&raw, &name) {
                let handle = UniformLocation(objects.locations.insert((program, loc)));
                uniforms.push((name, handle));
            }
        }

        Ok(LinkedProgram {
            program,
            uniforms,
            attributes,
        })
    }

    fn delete_program(&self, program: Program) {
        let mut objects = self.objects.borrow_mut();
        let stale: Vec<_> = objects
            .locations
            .iter()
            .filter(|(_, (p, _))| *p == program)
            .map(|(h, _)| h)
            .collect();
        for h in stale {
            objects.locations.remove(h);
        }
        if let Some(p) = objects.programs.remove(program.0) {
            self.gl.delete_program(Some(&p));
        }
    }

    fn use_program(&self, program: Program) {
        let p = self.objects.borrow().programs.get(program.0).cloned();
        self.gl.use_program(p.as_ref());
    }

    fn current_program(&self) -> Option<Program> {
        let current = self
            .gl
            .get_parameter(GL::CURRENT_PROGRAM)
            .ok()?
            .dyn_into::<WebGlProgram>()
            .ok()?;
        let objects = self.objects.borrow();
        objects
            .programs
            .iter()
            .find(|(_, p)| **p == current)
            .map(|(h, _)| Program(h))
    }

    fn uniform1i(&self, location: UniformLocation, value: i32) {
        self.gl.uniform1i(self.location(location).as_ref(), value);
    }

    fn uniform1f(&self, location: UniformLocation, value: f32) {
        self.gl.uniform1f(self.location(location).as_ref(), value);
    }

    fn uniform2f(&self, location: UniformLocation, x: f32, y: f32) {
        self.gl.uniform2f(self.location(location).as_ref(), x, y);
    }

    fn uniform4f(&self, location: UniformLocation, [x, y, z, w]: [f32; 4]) {
        self.gl
            .uniform4f(self.location(location).as_ref(), x, y, z, w);
    }

    fn uniform1fv(&self, location: UniformLocation, values: &[f32]) {
        self.gl
            .uniform1fv_with_f32_array(self.location(location).as_ref(), values);
    }

    fn uniform_matrix4(&self, location: UniformLocation, matrix: &[f32; 16]) {
        self.gl
            .uniform_matrix4fv_with_f32_array(self.location(location).as_ref(), false, matrix);
    }

    fn viewport(&self, x: i32, y: i32, width: i32, height: i32) {
        self.gl.viewport(x, y, width, height);
    }

    fn clear(&self, [r, g, b, a]: [f32; 4]) {
        self.gl.clear_color(r, g, b, a);
        self.gl.clear(GL::COLOR_BUFFER_BIT);
    }

    fn draw_arrays(&self, mode: DrawMode, first: i32, count: i32) {
        let mode = match mode {
            DrawMode::Points => GL::POINTS,
            DrawMode::Triangles => GL::TRIANGLES,
        };
        self.gl.draw_arrays(mode, first, count);
    }

    fn is_blend_enabled(&self) -> bool {
        self.gl.is_enabled(GL::BLEND)
    }

    fn set_blend(&self, enabled: bool) {
        if enabled {
            self.gl.enable(GL::BLEND);
        } else {
            self.gl.disable(GL::BLEND);
        }
    }
}

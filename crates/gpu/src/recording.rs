//! Headless context that records every call.
//!
//! Used by tests and by tools that want to exercise the GPU-side code paths
//! without a browser. Resources live in generational slabs so stale handles
//! behave the way deleted WebGL objects do: silently ignored.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};

use foundation::handles::HandleSlab;

use crate::context::{
    Buffer, DrawMode, Framebuffer, GpuContext, GpuError, LinkedProgram, PixelData, Program,
    TexelType, Texture, TextureFilter, TextureWrap, UniformLocation,
};

#[derive(Debug, Clone, PartialEq)]
pub enum UniformValue {
    Int(i32),
    Float(f32),
    Vec2(f32, f32),
    Vec4([f32; 4]),
    Floats(Vec<f32>),
    Mat4([f32; 16]),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    CreateTexture(Texture),
    DeleteTexture(Texture),
    ActiveTexture(u32),
    BindTexture(Option<Texture>),
    TexParameters {
        filter: TextureFilter,
        wrap_s: TextureWrap,
        wrap_t: TextureWrap,
    },
    TexImage {
        texture: Option<Texture>,
        width: u32,
        height: u32,
        texel: TexelType,
        len: usize,
    },
    CreateFramebuffer(Framebuffer),
    DeleteFramebuffer(Framebuffer),
    BindFramebuffer(Option<Framebuffer>),
    FramebufferTexture {
        framebuffer: Option<Framebuffer>,
        texture: Texture,
    },
    CreateBuffer(Buffer, usize),
    BufferData(Buffer, usize),
    DeleteBuffer(Buffer),
    BindAttribute {
        buffer: Buffer,
        location: u32,
        components: i32,
    },
    DisableAttribute(u32),
    CreateProgram(Program),
    DeleteProgram(Program),
    UseProgram(Program),
    Uniform {
        name: String,
        value: UniformValue,
    },
    Viewport([i32; 4]),
    Clear([f32; 4]),
    Draw {
        mode: DrawMode,
        first: i32,
        count: i32,
        program: Option<Program>,
        framebuffer: Option<Framebuffer>,
    },
    SetBlend(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextureInfo {
    pub size: [u32; 2],
    pub texel: Option<TexelType>,
    pub filter: TextureFilter,
    pub wrap_s: TextureWrap,
    pub wrap_t: TextureWrap,
    pub uploaded: usize,
}

impl Default for TextureInfo {
    fn default() -> Self {
        Self {
            size: [0, 0],
            texel: None,
            filter: TextureFilter::Nearest,
            wrap_s: TextureWrap::Repeat,
            wrap_t: TextureWrap::Repeat,
            uploaded: 0,
        }
    }
}

#[derive(Debug)]
struct ProgramInfo {
    foreign: bool,
}

#[derive(Debug, Default)]
struct State {
    calls: Vec<Call>,
    disabled_extensions: BTreeSet<String>,
    fail_allocations: bool,
    textures: HandleSlab<TextureInfo>,
    framebuffers: HandleSlab<Option<Texture>>,
    buffers: HandleSlab<usize>,
    programs: HandleSlab<ProgramInfo>,
    locations: HandleSlab<(Program, String)>,
    uniform_values: BTreeMap<(Program, String), UniformValue>,
    active_unit: u32,
    bound_textures: BTreeMap<u32, Texture>,
    bound_framebuffer: Option<Framebuffer>,
    current_program: Option<Program>,
    blend: bool,
}

#[derive(Debug, Default)]
pub struct RecordingContext {
    state: RefCell<State>,
}

impl RecordingContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `has_extension(name)` report false from now on.
    pub fn disable_extension(&self, name: &str) {
        self.state
            .borrow_mut()
            .disabled_extensions
            .insert(name.to_string());
    }

    /// Make every subsequent `create_*` call fail.
    pub fn fail_allocations(&self, fail: bool) {
        self.state.borrow_mut().fail_allocations = fail;
    }

    /// Switch to a program this context's users did not create, the way a
    /// host renderer does between frames.
    pub fn simulate_foreign_program(&self) -> Program {
        let mut s = self.state.borrow_mut();
        let program = Program(s.programs.insert(ProgramInfo { foreign: true }));
        s.current_program = Some(program);
        program
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.borrow().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.borrow_mut().calls.clear();
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.state.borrow().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn draw_count(&self) -> usize {
        self.count(|c| matches!(c, Call::Draw { .. }))
    }

    pub fn draws_into(&self, framebuffer: Option<Framebuffer>) -> usize {
        self.count(|c| matches!(c, Call::Draw { framebuffer: fb, .. } if *fb == framebuffer))
    }

    pub fn texture_info(&self, texture: Texture) -> Option<TextureInfo> {
        self.state.borrow().textures.get(texture.0).cloned()
    }

    pub fn framebuffer_attachment(&self, framebuffer: Framebuffer) -> Option<Texture> {
        self.state
            .borrow()
            .framebuffers
            .get(framebuffer.0)
            .copied()
            .flatten()
    }

    pub fn bound_texture(&self, unit: u32) -> Option<Texture> {
        self.state.borrow().bound_textures.get(&unit).copied()
    }

    pub fn bound_framebuffer(&self) -> Option<Framebuffer> {
        self.state.borrow().bound_framebuffer
    }

    pub fn uniform_value(&self, program: Program, name: &str) -> Option<UniformValue> {
        self.state
            .borrow()
            .uniform_values
            .get(&(program, name.to_string()))
            .cloned()
    }

    /// Most recent value written to a uniform of this name, in any program.
    pub fn last_uniform(&self, name: &str) -> Option<UniformValue> {
        self.state.borrow().calls.iter().rev().find_map(|c| match c {
            Call::Uniform { name: n, value } if n == name => Some(value.clone()),
            _ => None,
        })
    }

    pub fn live_textures(&self) -> usize {
        self.state.borrow().textures.len()
    }

    pub fn live_framebuffers(&self) -> usize {
        self.state.borrow().framebuffers.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.state.borrow().buffers.len()
    }

    pub fn live_programs(&self) -> usize {
        let s = self.state.borrow();
        s.programs.iter().filter(|(_, p)| !p.foreign).count()
    }

    fn record(&self, call: Call) {
        self.state.borrow_mut().calls.push(call);
    }

    fn set_uniform(&self, location: UniformLocation, value: UniformValue) {
        let mut s = self.state.borrow_mut();
        let Some((program, name)) = s.locations.get(location.0).cloned() else {
            return;
        };
        s.uniform_values
            .insert((program, name.clone()), value.clone());
        s.calls.push(Call::Uniform { name, value });
    }
}

/// Active inputs declared by a shader: `(uniforms, attributes)`.
///
/// Array uniforms are reported as `name[0]`, matching what WebGL's
/// `getActiveUniform` returns.
pub fn parse_shader_inputs(source: &str) -> (Vec<String>, Vec<String>) {
    let mut uniforms = Vec::new();
    let mut attributes = Vec::new();
    let source: String = source
        .lines()
        .filter(|l| !l.trim_start().starts_with('#'))
        .collect::<Vec<_>>()
        .join("\n");
    for statement in source.split(';') {
        let mut words = statement.split_whitespace();
        let target = loop {
            match words.next() {
                Some("uniform") => break Some(&mut uniforms),
                Some("attribute") => break Some(&mut attributes),
                Some(w) if w.ends_with('}') || w == "{" => continue,
                _ => break None,
            }
        };
        let Some(target) = target else {
            continue;
        };
        let rest: Vec<&str> = words
            .filter(|w| !matches!(*w, "lowp" | "mediump" | "highp"))
            .collect();
        // First word is the type; the remainder is a comma-separated name list.
        let names = rest.get(1..).unwrap_or_default().join(" ");
        for name in names.split(',') {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            let name = match name.find('[') {
                Some(i) => format!("{}[0]", name[..i].trim()),
                None => name.to_string(),
            };
            if !target.contains(&name) {
                target.push(name);
            }
        }
    }
    (uniforms, attributes)
}

impl GpuContext for RecordingContext {
    fn has_extension(&self, name: &str) -> bool {
        !self.state.borrow().disabled_extensions.contains(name)
    }

    fn create_texture(&self) -> Result<Texture, GpuError> {
        let mut s = self.state.borrow_mut();
        if s.fail_allocations {
            return Err(GpuError::Resource("texture"));
        }
        let texture = Texture(s.textures.insert(TextureInfo::default()));
        s.calls.push(Call::CreateTexture(texture));
        Ok(texture)
    }

    fn delete_texture(&self, texture: Texture) {
        let mut s = self.state.borrow_mut();
        s.textures.remove(texture.0);
        s.bound_textures.retain(|_, t| *t != texture);
        s.calls.push(Call::DeleteTexture(texture));
    }

    fn active_texture(&self, unit: u32) {
        let mut s = self.state.borrow_mut();
        s.active_unit = unit;
        s.calls.push(Call::ActiveTexture(unit));
    }

    fn bind_texture(&self, texture: Option<Texture>) {
        let mut s = self.state.borrow_mut();
        let unit = s.active_unit;
        let live = texture.filter(|t| s.textures.contains(t.0));
        match live {
            Some(t) => s.bound_textures.insert(unit, t),
            None => s.bound_textures.remove(&unit),
        };
        s.calls.push(Call::BindTexture(texture));
    }

    fn tex_parameters(&self, filter: TextureFilter, wrap_s: TextureWrap, wrap_t: TextureWrap) {
        let mut s = self.state.borrow_mut();
        let unit = s.active_unit;
        if let Some(t) = s.bound_textures.get(&unit).copied() {
            if let Some(info) = s.textures.get_mut(t.0) {
                info.filter = filter;
                info.wrap_s = wrap_s;
                info.wrap_t = wrap_t;
            }
        }
        s.calls.push(Call::TexParameters {
            filter,
            wrap_s,
            wrap_t,
        });
    }

    fn tex_image(
        &self,
        width: u32,
        height: u32,
        texel: TexelType,
        data: PixelData<'_>,
    ) -> Result<(), GpuError> {
        let expected = (width as usize) * (height as usize) * 4;
        if !data.is_empty() && data.len() != expected {
            return Err(GpuError::Upload(format!(
                "expected {expected} components, got {}",
                data.len()
            )));
        }
        let mut s = self.state.borrow_mut();
        let unit = s.active_unit;
        let texture = s.bound_textures.get(&unit).copied();
        if let Some(info) = texture.and_then(|t| s.textures.get_mut(t.0)) {
            info.size = [width, height];
            info.texel = Some(texel);
            info.uploaded = data.len();
        }
        s.calls.push(Call::TexImage {
            texture,
            width,
            height,
            texel,
            len: data.len(),
        });
        Ok(())
    }

    fn create_framebuffer(&self) -> Result<Framebuffer, GpuError> {
        let mut s = self.state.borrow_mut();
        if s.fail_allocations {
            return Err(GpuError::Resource("framebuffer"));
        }
        let fb = Framebuffer(s.framebuffers.insert(None));
        s.calls.push(Call::CreateFramebuffer(fb));
        Ok(fb)
    }

    fn delete_framebuffer(&self, framebuffer: Framebuffer) {
        let mut s = self.state.borrow_mut();
        s.framebuffers.remove(framebuffer.0);
        if s.bound_framebuffer == Some(framebuffer) {
            s.bound_framebuffer = None;
        }
        s.calls.push(Call::DeleteFramebuffer(framebuffer));
    }

    fn is_framebuffer(&self, framebuffer: Framebuffer) -> bool {
        self.state.borrow().framebuffers.contains(framebuffer.0)
    }

    fn bind_framebuffer(&self, framebuffer: Option<Framebuffer>) {
        let mut s = self.state.borrow_mut();
        let live = framebuffer.filter(|f| s.framebuffers.contains(f.0));
        s.bound_framebuffer = live;
        s.calls.push(Call::BindFramebuffer(framebuffer));
    }

    fn framebuffer_texture(&self, texture: Texture) {
        let mut s = self.state.borrow_mut();
        let framebuffer = s.bound_framebuffer;
        if let Some(slot) = framebuffer.and_then(|f| s.framebuffers.get_mut(f.0)) {
            *slot = Some(texture);
        }
        s.calls.push(Call::FramebufferTexture {
            framebuffer,
            texture,
        });
    }

    fn create_buffer(&self, data: &[f32]) -> Result<Buffer, GpuError> {
        let mut s = self.state.borrow_mut();
        if s.fail_allocations {
            return Err(GpuError::Resource("buffer"));
        }
        let buffer = Buffer(s.buffers.insert(data.len()));
        s.calls.push(Call::CreateBuffer(buffer, data.len()));
        Ok(buffer)
    }

    fn buffer_data(&self, buffer: Buffer, data: &[f32]) {
        let mut s = self.state.borrow_mut();
        if let Some(len) = s.buffers.get_mut(buffer.0) {
            *len = data.len();
        }
        s.calls.push(Call::BufferData(buffer, data.len()));
    }

    fn delete_buffer(&self, buffer: Buffer) {
        let mut s = self.state.borrow_mut();
        s.buffers.remove(buffer.0);
        s.calls.push(Call::DeleteBuffer(buffer));
    }

    fn bind_attribute(&self, buffer: Buffer, location: u32, components: i32) {
        self.record(Call::BindAttribute {
            buffer,
            location,
            components,
        });
    }

    fn disable_attribute(&self, location: u32) {
        self.record(Call::DisableAttribute(location));
    }

    fn create_program(&self, vertex: &str, fragment: &str) -> Result<LinkedProgram, GpuError> {
        let mut s = self.state.borrow_mut();
        if s.fail_allocations {
            return Err(GpuError::Resource("program"));
        }
        if !vertex.contains("void main") {
            return Err(GpuError::Compile {
                stage: crate::context::ShaderStage::Vertex,
                log: "missing main".to_string(),
            });
        }
        if !fragment.contains("void main") {
            return Err(GpuError::Compile {
                stage: crate::context::ShaderStage::Fragment,
                log: "missing main".to_string(),
            });
        }
        let program = Program(s.programs.insert(ProgramInfo { foreign: false }));
        let (mut uniform_names, attribute_names) = parse_shader_inputs(vertex);
        let (fs_uniforms, _) = parse_shader_inputs(fragment);
        for name in fs_uniforms {
            if !uniform_names.contains(&name) {
                uniform_names.push(name);
            }
        }
        let uniforms = uniform_names
            .into_iter()
            .map(|name| {
                let loc = UniformLocation(s.locations.insert((program, name.clone())));
                (name, loc)
            })
            .collect();
        let attributes = attribute_names
            .into_iter()
            .enumerate()
            .map(|(i, name)| (name, i as u32))
            .collect();
        s.calls.push(Call::CreateProgram(program));
        Ok(LinkedProgram {
            program,
            uniforms,
            attributes,
        })
    }

    fn delete_program(&self, program: Program) {
        let mut s = self.state.borrow_mut();
        s.programs.remove(program.0);
        let stale: Vec<_> = s
            .locations
            .iter()
            .filter(|(_, (p, _))| *p == program)
            .map(|(h, _)| h)
            .collect();
        for h in stale {
            s.locations.remove(h);
        }
        s.uniform_values.retain(|(p, _), _| *p != program);
        if s.current_program == Some(program) {
            s.current_program = None;
        }
        s.calls.push(Call::DeleteProgram(program));
    }

    fn use_program(&self, program: Program) {
        let mut s = self.state.borrow_mut();
        s.current_program = Some(program);
        s.calls.push(Call::UseProgram(program));
    }

    fn current_program(&self) -> Option<Program> {
        self.state.borrow().current_program
    }

    fn uniform1i(&self, location: UniformLocation, value: i32) {
        self.set_uniform(location, UniformValue::Int(value));
    }

    fn uniform1f(&self, location: UniformLocation, value: f32) {
        self.set_uniform(location, UniformValue::Float(value));
    }

    fn uniform2f(&self, location: UniformLocation, x: f32, y: f32) {
        self.set_uniform(location, UniformValue::Vec2(x, y));
    }

    fn uniform4f(&self, location: UniformLocation, v: [f32; 4]) {
        self.set_uniform(location, UniformValue::Vec4(v));
    }

    fn uniform1fv(&self, location: UniformLocation, values: &[f32]) {
        self.set_uniform(location, UniformValue::Floats(values.to_vec()));
    }

    fn uniform_matrix4(&self, location: UniformLocation, matrix: &[f32; 16]) {
        self.set_uniform(location, UniformValue::Mat4(*matrix));
    }

    fn viewport(&self, x: i32, y: i32, width: i32, height: i32) {
        self.record(Call::Viewport([x, y, width, height]));
    }

    fn clear(&self, color: [f32; 4]) {
        self.record(Call::Clear(color));
    }

    fn draw_arrays(&self, mode: DrawMode, first: i32, count: i32) {
        let mut s = self.state.borrow_mut();
        let call = Call::Draw {
            mode,
            first,
            count,
            program: s.current_program,
            framebuffer: s.bound_framebuffer,
        };
        s.calls.push(call);
    }

    fn is_blend_enabled(&self) -> bool {
        self.state.borrow().blend
    }

    fn set_blend(&self, enabled: bool) {
        let mut s = self.state.borrow_mut();
        s.blend = enabled;
        s.calls.push(Call::SetBlend(enabled));
    }
}

use std::collections::BTreeMap;

use tracing::warn;

use crate::context::{GpuContext, GpuError, Program, UniformLocation};

/// A linked program plus lookup tables for its active uniforms and attributes.
///
/// Programs are addressed by name the way the shaders declare them
/// (`u_tex_0`, `a_pos`, ...). A name the program does not expose resolves to
/// `None` and is logged; the call that needed it is skipped.
#[derive(Debug, Clone)]
pub struct GpuProgram {
    program: Program,
    label: &'static str,
    uniforms: BTreeMap<String, UniformLocation>,
    attributes: BTreeMap<String, u32>,
}

impl GpuProgram {
    pub fn compile(
        gl: &dyn GpuContext,
        label: &'static str,
        vertex: &str,
        fragment: &str,
    ) -> Result<Self, GpuError> {
        let linked = gl.create_program(vertex, fragment)?;
        Ok(Self {
            program: linked.program,
            label,
            uniforms: linked.uniforms.into_iter().collect(),
            attributes: linked.attributes.into_iter().collect(),
        })
    }

    pub fn handle(&self) -> Program {
        self.program
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn uniform(&self, name: &str) -> Option<UniformLocation> {
        let loc = self
            .uniforms
            .get(name)
            .or_else(|| self.uniforms.get(&format!("{name}[0]")))
            .copied();
        if loc.is_none() {
            warn!(program = self.label, uniform = name, "undefined uniform");
        }
        loc
    }

    pub fn attribute(&self, name: &str) -> Option<u32> {
        let loc = self.attributes.get(name).copied();
        if loc.is_none() {
            warn!(program = self.label, attribute = name, "undefined attribute");
        }
        loc
    }

    pub fn has_uniform(&self, name: &str) -> bool {
        self.uniforms.contains_key(name)
    }

    pub fn set_i32(&self, gl: &dyn GpuContext, name: &str, value: i32) {
        if let Some(loc) = self.uniform(name) {
            gl.uniform1i(loc, value);
        }
    }

    pub fn set_f32(&self, gl: &dyn GpuContext, name: &str, value: f32) {
        if let Some(loc) = self.uniform(name) {
            gl.uniform1f(loc, value);
        }
    }

    pub fn set_vec2(&self, gl: &dyn GpuContext, name: &str, x: f32, y: f32) {
        if let Some(loc) = self.uniform(name) {
            gl.uniform2f(loc, x, y);
        }
    }

    pub fn set_vec4(&self, gl: &dyn GpuContext, name: &str, v: [f32; 4]) {
        if let Some(loc) = self.uniform(name) {
            gl.uniform4f(loc, v);
        }
    }

    pub fn set_f32_array(&self, gl: &dyn GpuContext, name: &str, values: &[f32]) {
        if let Some(loc) = self.uniform(name) {
            gl.uniform1fv(loc, values);
        }
    }

    pub fn set_mat4(&self, gl: &dyn GpuContext, name: &str, matrix: &[f32; 16]) {
        if let Some(loc) = self.uniform(name) {
            gl.uniform_matrix4(loc, matrix);
        }
    }

    pub fn delete(self, gl: &dyn GpuContext) {
        gl.delete_program(self.program);
    }
}

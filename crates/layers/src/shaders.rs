//! Screen-space draw programs for the simulation outputs.

/// Reads particle positions from the state texture. Positions are stored
/// split as `fract`/`floor` of `merc * 0xFFFF`; the view offset is split the
/// same way so the subtraction keeps its precision.
pub const PARTICLE_DRAW_VERTEX: &str = r#"
precision highp float;
attribute float a_index;
uniform sampler2D u_particles;
uniform float u_particles_res;
uniform vec2 u_scale;
uniform vec2 u_offset_f;
uniform vec2 u_offset_i;
uniform vec2 u_wrap;
uniform float u_size;

void main() {
    float row = floor(a_index / u_particles_res);
    float col = a_index - row * u_particles_res;
    vec2 uv = (vec2(col, row) + 0.5) / u_particles_res;
    vec4 state = texture2D(u_particles, uv);
    vec2 pos = ((state.zw + u_offset_i) + (state.xy + u_offset_f)) / 65535.0 + u_wrap;
    vec2 screen = pos * u_scale;
    gl_PointSize = u_size;
    gl_Position = vec4(screen.x * 2.0 - 1.0, 1.0 - screen.y * 2.0, 0.0, 1.0);
}
"#;

pub const PARTICLE_DRAW_FRAGMENT: &str = r#"
precision mediump float;
uniform vec4 u_color;

void main() {
    if (length(gl_PointCoord - 0.5) > 0.5) {
        discard;
    }
    gl_FragColor = u_color;
}
"#;

pub const HEATMAP_DRAW_VERTEX: &str = r#"
precision highp float;
attribute vec2 a_pos;
uniform mat4 u_transform;
varying vec2 v_tex;

void main() {
    v_tex = a_pos;
    gl_Position = u_transform * vec4(a_pos, 0.0, 1.0);
}
"#;

/// `u_output_alpha` blends from opaque output (0) to alpha taken from the
/// first channel (1).
pub const HEATMAP_DRAW_FRAGMENT: &str = r#"
precision highp float;
uniform sampler2D u_tex;
uniform float u_output_mult;
uniform float u_output_alpha;
varying vec2 v_tex;

void main() {
    vec4 v = texture2D(u_tex, v_tex) * u_output_mult;
    float a = mix(1.0, clamp(v.r, 0.0, 1.0), u_output_alpha);
    gl_FragColor = vec4(v.rgb * a, a);
}
"#;

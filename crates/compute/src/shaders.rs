//! GLSL ES 1.00 sources for the simulation passes.
//!
//! Every update program reads the blended wind field through `u_tex_0`,
//! `u_tex_1` and `u_tex_a`, and the previous state through the input unit.

/// Full-screen quad shared by both update passes.
pub const UPDATE_VERTEX: &str = r#"
precision highp float;
attribute vec2 a_pos;
varying vec2 v_pos;
void main() {
    v_pos = a_pos;
    gl_Position = vec4(a_pos * 2.0 - 1.0, 0.0, 1.0);
}
"#;

/// Advects particle positions stored as `(fract, floor)` of `merc * 0xFFFF`.
pub const PARTICLE_UPDATE_FRAGMENT: &str = r#"
precision highp float;
const float PI = 3.141592653589793;
const float WORLD_METERS = 40075016.68557849;
const float SCALE = 65535.0;
uniform sampler2D u_particles;
uniform sampler2D u_tex_0;
uniform sampler2D u_tex_1;
uniform float u_tex_a;
uniform float u_time_step;
uniform float u_span_globe;
uniform vec2 u_padding;
uniform float u_drop_rate;
uniform float u_drop_rate_bump;
uniform mat4 u_offset;
uniform mat4 u_offset_inverse;
uniform float u_render_perc;
uniform float u_rand_seed;
varying vec2 v_pos;

float rand(vec2 co) {
    return fract(sin(dot(co, vec2(12.9898, 78.233))) * 43758.5453);
}

float merc_scale(float y) {
    float k = (0.5 - y) * 2.0 * PI;
    return (exp(k) + exp(-k)) * 0.5;
}

void main() {
    vec4 state = texture2D(u_particles, v_pos);
    vec2 merc = (state.zw + state.xy) / SCALE;
    vec2 tex = (u_offset_inverse * vec4(merc, 0.0, 1.0)).xy;
    vec2 uv = mix(texture2D(u_tex_0, tex).rg, texture2D(u_tex_1, tex).rg, u_tex_a);

    merc += vec2(uv.x, -uv.y) * u_time_step * merc_scale(merc.y) / WORLD_METERS;
    if (u_span_globe > 0.5) {
        merc.x = fract(merc.x);
    }

    vec2 seed = (v_pos + merc) * (u_rand_seed + 1.0);
    float drop = (u_drop_rate + length(uv) * u_drop_rate_bump) * abs(u_time_step);
    vec2 t = (u_offset_inverse * vec4(merc, 0.0, 1.0)).xy;
    bool outside = any(lessThan(t, -u_padding)) || any(greaterThan(t, 1.0 + u_padding));
    if (outside || v_pos.y > u_render_perc || rand(seed) < drop) {
        vec2 r = vec2(rand(seed + 1.3), rand(seed + 2.1)) * (1.0 + 2.0 * u_padding) - u_padding;
        merc = (u_offset * vec4(r, 0.0, 1.0)).xy;
    }

    vec2 scaled = merc * SCALE;
    gl_FragColor = vec4(fract(scaled), floor(scaled));
}
"#;

/// Advects, disperses and decays the heatmap field. `dispersion()` is
/// generated per kernel and spliced in before `main`.
pub const HEATMAP_UPDATE_FRAGMENT: &str = r#"
precision highp float;
uniform sampler2D u_heatmap;
uniform sampler2D u_tex_0;
uniform sampler2D u_tex_1;
uniform float u_tex_a;
uniform float u_time_step;
uniform float u_drop_off;
uniform mat4 u_hm_to_uv;
uniform vec2 u_resolution_met;
uniform vec2 u_resolution_tex;
varying vec2 v_pos;

void main() {
    vec2 uv_pos = (u_hm_to_uv * vec4(v_pos, 0.0, 1.0)).xy;
    vec2 uv = mix(texture2D(u_tex_0, uv_pos).rg, texture2D(u_tex_1, uv_pos).rg, u_tex_a);
    vec2 upstream = v_pos - uv * u_time_step * u_resolution_met;
    gl_FragColor = dispersion(upstream, u_resolution_tex) * u_drop_off;
}
"#;

/// Splats point sources into the heatmap. Blending is additive.
pub const HEATMAP_APPLY_VERTEX: &str = r#"
precision highp float;
attribute vec2 a_positions;
attribute vec4 a_data;
uniform mat4 u_matrix;
uniform float u_diameter;
varying vec4 v_data;
void main() {
    vec4 tex = u_matrix * vec4(a_positions, 0.0, 1.0);
    v_data = a_data;
    gl_PointSize = max(u_diameter, 1.0);
    gl_Position = vec4(tex.xy * 2.0 - 1.0, 0.0, 1.0);
}
"#;

pub const HEATMAP_APPLY_FRAGMENT: &str = r#"
precision highp float;
uniform float u_fade;
varying vec4 v_data;
void main() {
    float d = length(gl_PointCoord - 0.5) * 2.0;
    if (d > 1.0) {
        discard;
    }
    gl_FragColor = v_data * mix(1.0, 1.0 - d, u_fade);
}
"#;

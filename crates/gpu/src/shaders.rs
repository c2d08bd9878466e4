//! GLSL ES 1.00 sources for the data-side passes.

/// Full-screen quad; `v_pos` is the output texel position in `[0, 1]²`.
pub const QUAD_VERTEX: &str = r#"
precision highp float;
attribute vec2 a_pos;
varying vec2 v_pos;
void main() {
    v_pos = a_pos;
    gl_Position = vec4(a_pos * 2.0 - 1.0, 0.0, 1.0);
}
"#;

/// Samples an equirectangular u/v image for each Mercator output texel and
/// writes decoded physical values (m/s) into `rg`.
pub const REPROJECT_FRAGMENT: &str = r#"
precision highp float;
const float PI = 3.141592653589793;
uniform sampler2D u_input;
uniform vec2 u_input_size;
uniform mat4 u_tex_to_merc;
uniform mat4 u_deg_to_tex;
varying vec2 v_pos;

vec2 unpack_uv(vec3 c) {
    vec3 b = floor(c * 255.0 + 0.5);
    float u = b.r * 16.0 + floor(b.g / 16.0);
    float v = mod(b.g, 16.0) * 256.0 + b.b;
    return vec2(u, v) / 4095.0 * 80.0 - 40.0;
}

void main() {
    vec4 merc = u_tex_to_merc * vec4(v_pos, 0.0, 1.0);
    float lat = degrees(2.0 * atan(exp((0.5 - merc.y) * 2.0 * PI))) - 90.0;
    vec4 src = u_deg_to_tex * vec4(merc.x, lat / 180.0 + 0.5, 0.0, 1.0);
    vec2 texel = (floor(src.xy * u_input_size) + 0.5) / u_input_size;
    gl_FragColor = vec4(unpack_uv(texture2D(u_input, texel).rgb), 0.0, 1.0);
}
"#;

pub const INTERPOLATE_VERTEX: &str = r#"
precision highp float;
attribute vec2 a_pos;
uniform mat4 u_matrix;
uniform vec2 u_size;
varying vec2 v_pos;
void main() {
    v_pos = a_pos;
    vec4 px = u_matrix * vec4(a_pos, 0.0, 1.0);
    gl_Position = vec4(px.xy / u_size * 2.0 - 1.0, 0.0, 1.0);
}
"#;

pub const INTERPOLATE_FRAGMENT: &str = r#"
precision highp float;
uniform sampler2D u_tex_0;
uniform sampler2D u_tex_1;
uniform float u_tex_a;
varying vec2 v_pos;
void main() {
    vec2 uv = mix(texture2D(u_tex_0, v_pos).rg, texture2D(u_tex_1, v_pos).rg, u_tex_a);
    gl_FragColor = vec4(uv / 80.0 + 0.5, 0.0, 1.0);
}
"#;

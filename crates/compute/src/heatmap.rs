//! Dispersion heatmap: a scalar field advected by the wind, blurred by a
//! Gaussian kernel each step and fed by point sources.

use foundation::bounds::{GeoBounds, MercBounds};
use foundation::math::affine::{to_uniform, translate_scale};
use foundation::math::mercator::{
    EPSG3857_R, WM_RANGE, bounds_to_mercator, norm_merc, norm_merc_point, to_mercator,
};
use foundation::time::HOUR_MS;
use glam::DMat4;
use gpu::textures::{UNIT_QUAD, create_quad_buffer};
use gpu::{Buffer, DrawMode, Gl, GpuError, GpuProgram, Texture, TextureFilter};
use serde::{Deserialize, Serialize};
use streaming::TimeSource;
use tracing::{debug, trace};

use crate::error::SimulationError;
use crate::shaders::{
    HEATMAP_APPLY_FRAGMENT, HEATMAP_APPLY_VERTEX, HEATMAP_UPDATE_FRAGMENT, UPDATE_VERTEX,
};
use crate::simulation::{INPUT_TEX_UNIT, Simulation, SimulationKernel};

/// Fixed at construction: changing any of these changes the grid or the
/// generated shader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeatmapConfig {
    /// Diffusion speed, meters per second.
    pub dispersion: f64,
    pub max_sources: usize,
    pub bounds: GeoBounds,
    /// Scalar channels carried per texel, 1 to 4.
    pub num_data_types: u32,
    /// Texel size at the bounds' center, meters.
    pub grid_resolution: f64,
    /// Step the blur kernel is sized for, seconds.
    pub time_step: f64,
}

impl Default for HeatmapConfig {
    fn default() -> Self {
        Self {
            dispersion: 1.0,
            max_sources: 1000,
            bounds: GeoBounds::new(-180.0, -80.0, 180.0, 80.0),
            num_data_types: 1,
            grid_resolution: 10_000.0,
            time_step: 60.0,
        }
    }
}

/// Tunables that may change between steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeatmapSettings {
    /// Splat radius, meters.
    pub source_radius: f64,
    /// 0 paints flat discs, 1 fades linearly to the edge.
    pub source_fade: f64,
    /// Fraction of the field lost per second.
    pub drop_off: f64,
}

impl Default for HeatmapSettings {
    fn default() -> Self {
        Self {
            source_radius: 10_000.0,
            source_fade: 1.0,
            drop_off: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointSource {
    /// `[lon, lat]`, degrees.
    pub coordinate: [f64; 2],
    /// Only the first `num_data_types` channels are used.
    pub data: [f32; 4],
}

/// Emitters active at a timestamp (milliseconds since the epoch).
pub trait SourceFeed {
    fn sources(&self, timestamp_ms: f64) -> Vec<PointSource>;
}

impl<F> SourceFeed for F
where
    F: Fn(f64) -> Vec<PointSource>,
{
    fn sources(&self, timestamp_ms: f64) -> Vec<PointSource> {
        self(timestamp_ms)
    }
}

/// Separable Gaussian weights plus the GLSL that applies them.
#[derive(Debug, Clone, PartialEq)]
pub struct BlurKernel {
    pub radius: u32,
    pub weights: Vec<f32>,
    pub prelude: String,
}

/// Sizes the blur so one step spreads the field by `dispersion * dt`.
pub fn dispersion_kernel(dispersion: f64, time_step: f64, grid_resolution: f64) -> BlurKernel {
    let sigma = dispersion * time_step.abs() / grid_resolution;
    let (radius, weights) = if sigma > 0.0 && sigma.is_finite() {
        let radius = (2.0 * sigma).ceil() as i64;
        let raw: Vec<f64> = (-radius..=radius)
            .map(|x| (-(x as f64 / sigma).powi(2)).exp())
            .collect();
        let sum: f64 = raw.iter().sum();
        (radius as u32, raw.iter().map(|w| (w / sum) as f32).collect())
    } else {
        (0, vec![1.0])
    };
    let prelude = format!(
        "const int rad = {radius};
const int len = rad * 2 + 1;
uniform float u_blur_kernel[len];
vec4 dispersion(vec2 sample_pos, vec2 tex_res) {{
    vec4 sum = vec4(0.0);
    for (int x = 0; x < len; x++) {{
        for (int y = 0; y < len; y++) {{
            vec2 tex_pos = sample_pos + vec2(x - rad, y - rad) * tex_res;
            vec4 tex_val = texture2D(u_heatmap, tex_pos);
            sum += u_blur_kernel[x] * u_blur_kernel[y] * tex_val;
        }}
    }}
    return sum;
}}"
    );
    BlurKernel {
        radius,
        weights,
        prelude,
    }
}

/// Inserts `code` ahead of the shader's entry point.
pub fn inject_prelude(fragment: &str, code: &str) -> String {
    fragment.replacen("void main()", &format!("{code}\nvoid main()"), 1)
}

/// Texel grid covering `bounds` at `grid_resolution` true meters per texel,
/// plus the Mercator scale factor at its center.
pub fn grid_size(bounds: &GeoBounds, grid_resolution: f64) -> Result<([u32; 2], f64), SimulationError> {
    if !(grid_resolution > 0.0) {
        return Err(SimulationError::Config(format!(
            "grid_resolution must be positive, got {grid_resolution}"
        )));
    }
    let mb = bounds_to_mercator(bounds);
    let resolution = ((mb[1] + mb[3]) / 2.0 / EPSG3857_R).cosh();
    let width = ((mb[2] - mb[0]) / (resolution * grid_resolution)).ceil();
    let height = ((mb[3] - mb[1]) / (resolution * grid_resolution)).ceil();
    if !(width >= 1.0 && height >= 1.0) {
        return Err(SimulationError::Config(format!(
            "bounds {:?} produce an empty heatmap grid",
            bounds.to_array()
        )));
    }
    Ok(([width as u32, height as u32], resolution))
}

struct ApplyPass {
    program: GpuProgram,
    positions: Buffer,
    data: Buffer,
}

pub struct HeatmapKernel {
    config: HeatmapConfig,
    settings: HeatmapSettings,
    feed: Box<dyn SourceFeed>,
    size: [u32; 2],
    resolution: f64,
    merc_bounds: MercBounds,
    tex_to_merc: DMat4,
    merc_to_tex: DMat4,
    hm_to_uv: DMat4,
    blur: BlurKernel,
    fragment: String,
    quad: Option<Buffer>,
    apply: Option<ApplyPass>,
    positions: Vec<f32>,
    data: Vec<f32>,
}

impl HeatmapKernel {
    /// `source_merc_to_tex` maps normalized Mercator into the wind grid's
    /// texture space.
    pub fn new(
        config: HeatmapConfig,
        settings: HeatmapSettings,
        source_merc_to_tex: DMat4,
        feed: Box<dyn SourceFeed>,
    ) -> Result<Self, SimulationError> {
        if !(1..=4).contains(&config.num_data_types) {
            return Err(SimulationError::Config(format!(
                "num_data_types must be within 1..=4, got {}",
                config.num_data_types
            )));
        }
        let (size, resolution) = grid_size(&config.bounds, config.grid_resolution)?;
        let mbn = norm_merc(bounds_to_mercator(&config.bounds));
        let tex_to_merc = translate_scale(mbn.west, mbn.south, mbn.width(), -mbn.height());
        let merc_to_tex = tex_to_merc.inverse();
        let blur = dispersion_kernel(config.dispersion, config.time_step, config.grid_resolution);
        let fragment = inject_prelude(HEATMAP_UPDATE_FRAGMENT, &blur.prelude);
        debug!(?size, radius = blur.radius, "heatmap: grid sized");
        Ok(Self {
            size,
            resolution,
            merc_bounds: mbn,
            tex_to_merc,
            merc_to_tex,
            hm_to_uv: source_merc_to_tex * tex_to_merc,
            blur,
            fragment,
            quad: None,
            apply: None,
            positions: Vec::with_capacity(config.max_sources * 2),
            data: Vec::with_capacity(config.max_sources * config.num_data_types as usize),
            config,
            settings,
            feed,
        })
    }

    pub fn config(&self) -> &HeatmapConfig {
        &self.config
    }

    pub fn settings(&self) -> &HeatmapSettings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut HeatmapSettings {
        &mut self.settings
    }

    pub fn grid_size(&self) -> [u32; 2] {
        self.size
    }

    pub fn blur(&self) -> &BlurKernel {
        &self.blur
    }

    pub fn merc_bounds(&self) -> MercBounds {
        self.merc_bounds
    }

    pub fn tex_to_merc(&self) -> DMat4 {
        self.tex_to_merc
    }

    pub fn merc_to_tex(&self) -> DMat4 {
        self.merc_to_tex
    }

    fn apply_sources(&mut self, gl: &Gl, timestamp_ms: f64) {
        let Some(pass) = &self.apply else {
            return;
        };
        let channels = self.config.num_data_types as usize;
        self.positions.clear();
        self.data.clear();
        for s in self
            .feed
            .sources(timestamp_ms)
            .iter()
            .take(self.config.max_sources)
        {
            let [x, y] = norm_merc_point(to_mercator(s.coordinate));
            self.positions.extend_from_slice(&[x as f32, y as f32]);
            self.data.extend_from_slice(&s.data[..channels]);
        }
        let count = self.positions.len() / 2;
        if count == 0 {
            return;
        }
        trace!(count, "heatmap: applying sources");

        let g = gl.as_ref();
        gl.use_program(pass.program.handle());
        gl.buffer_data(pass.positions, &self.positions);
        gl.buffer_data(pass.data, &self.data);
        let a_positions = pass.program.attribute("a_positions");
        let a_data = pass.program.attribute("a_data");
        if let Some(loc) = a_positions {
            gl.bind_attribute(pass.positions, loc, 2);
        }
        if let Some(loc) = a_data {
            gl.bind_attribute(pass.data, loc, channels as i32);
        }
        gl.set_blend(true);
        let diameter = self.settings.source_radius * 2.0 / self.config.grid_resolution;
        pass.program.set_f32(g, "u_diameter", diameter as f32);
        pass.program
            .set_f32(g, "u_fade", self.settings.source_fade as f32);
        gl.draw_arrays(DrawMode::Points, 0, count as i32);
        for loc in [a_positions, a_data].into_iter().flatten() {
            gl.disable_attribute(loc);
        }
    }
}

impl SimulationKernel for HeatmapKernel {
    fn label(&self) -> &'static str {
        "heatmap"
    }

    fn vertex_shader(&self) -> &str {
        UPDATE_VERTEX
    }

    fn fragment_shader(&self) -> &str {
        &self.fragment
    }

    fn required_extensions(&self) -> &'static [&'static str] {
        &["OES_texture_float", "OES_texture_float_linear"]
    }

    fn texture_filter(&self) -> TextureFilter {
        TextureFilter::Linear
    }

    fn allocate(&mut self, gl: &Gl, program: &GpuProgram) -> Result<(), GpuError> {
        let g = gl.as_ref();
        let [w, h] = self.size;
        let mbn = self.merc_bounds;
        program.set_i32(g, "u_heatmap", INPUT_TEX_UNIT as i32);
        program.set_mat4(g, "u_hm_to_uv", &to_uniform(&self.hm_to_uv));
        program.set_vec2(
            g,
            "u_resolution_met",
            (self.resolution / (2.0 * WM_RANGE * mbn.width())) as f32,
            (self.resolution / (2.0 * WM_RANGE * mbn.height())) as f32,
        );
        program.set_vec2(g, "u_resolution_tex", 1.0 / w as f32, 1.0 / h as f32);
        program.set_f32_array(g, "u_blur_kernel", &self.blur.weights);

        let quad = create_quad_buffer(g)?;
        self.quad = Some(quad);

        let apply = GpuProgram::compile(g, "heatmap-apply", HEATMAP_APPLY_VERTEX, HEATMAP_APPLY_FRAGMENT)?;
        let channels = self.config.num_data_types as usize;
        let positions = gl.create_buffer(&vec![0.0; self.config.max_sources * 2]);
        let data = gl.create_buffer(&vec![0.0; self.config.max_sources * channels]);
        let (positions, data) = match (positions, data) {
            (Ok(p), Ok(d)) => (p, d),
            (p, d) => {
                for b in [p.as_ref().ok(), d.as_ref().ok()].into_iter().flatten() {
                    gl.delete_buffer(*b);
                }
                apply.delete(g);
                return Err(p.and(d).err().unwrap_or(GpuError::Resource("buffer")));
            }
        };
        gl.use_program(apply.handle());
        apply.set_mat4(g, "u_matrix", &to_uniform(&self.merc_to_tex));
        self.apply = Some(ApplyPass {
            program: apply,
            positions,
            data,
        });
        Ok(())
    }

    fn release(&mut self, gl: &Gl) {
        if let Some(quad) = self.quad.take() {
            gl.delete_buffer(quad);
        }
        if let Some(pass) = self.apply.take() {
            gl.delete_buffer(pass.positions);
            gl.delete_buffer(pass.data);
            pass.program.delete(gl.as_ref());
        }
    }

    fn initial_state(&mut self, _size: [u32; 2]) -> Option<&[f32]> {
        None
    }

    fn prepare_update(&mut self, gl: &Gl, program: &GpuProgram, _time_step: f64) {
        if let (Some(quad), Some(loc)) = (self.quad, program.attribute("a_pos")) {
            gl.bind_attribute(quad, loc, 2);
        }
    }

    fn execute_update(
        &mut self,
        gl: &Gl,
        program: &GpuProgram,
        time_step: f64,
        source: &TimeSource,
    ) {
        gl.clear([0.0; 4]);
        let drop_off = (1.0 - self.settings.drop_off).powf(time_step.abs());
        program.set_f32(gl.as_ref(), "u_drop_off", drop_off as f32);
        gl.draw_arrays(DrawMode::Triangles, 0, (UNIT_QUAD.len() / 2) as i32);

        let timestamp_ms = source.time().unwrap_or_default() * HOUR_MS;
        self.apply_sources(gl, timestamp_ms);
    }
}

/// Concentration field carried by the wind.
pub type Heatmap = Simulation<HeatmapKernel>;

impl Simulation<HeatmapKernel> {
    pub fn from_source(
        source: TimeSource,
        config: HeatmapConfig,
        settings: HeatmapSettings,
        feed: impl SourceFeed + 'static,
    ) -> Result<Self, SimulationError> {
        let geometry = source.geometry().ok_or(SimulationError::NotLoaded)?;
        let kernel = HeatmapKernel::new(config, settings, geometry.merc_to_tex, Box::new(feed))?;
        let size = kernel.grid_size();
        Ok(Simulation::new(kernel, source, size))
    }

    /// The latest field; texture `(0, 0)` is the south-west corner.
    pub fn output_texture(&self) -> Option<Texture> {
        self.state_texture()
    }

    pub fn tex_to_merc(&self) -> DMat4 {
        self.kernel().tex_to_merc()
    }

    pub fn settings_mut(&mut self) -> &mut HeatmapSettings {
        self.kernel_mut().settings_mut()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::{
        Heatmap, HeatmapConfig, HeatmapSettings, PointSource, dispersion_kernel, grid_size,
        inject_prelude,
    };
    use crate::error::SimulationError;
    use crate::shaders::HEATMAP_UPDATE_FRAGMENT;
    use crate::test_support::Fixture;
    use foundation::bounds::GeoBounds;
    use foundation::time::HOUR_MS;
    use gpu::recording::{Call, UniformValue};
    use gpu::{DrawMode, GpuError};
    use pretty_assertions::assert_eq;

    fn config(max_sources: usize) -> HeatmapConfig {
        HeatmapConfig {
            dispersion: 1.0,
            max_sources,
            bounds: GeoBounds::new(0.0, 0.0, 1.0, 1.0),
            num_data_types: 2,
            grid_resolution: 10_000.0,
            time_step: 60.0,
        }
    }

    fn settings() -> HeatmapSettings {
        HeatmapSettings {
            source_radius: 20_000.0,
            source_fade: 0.5,
            drop_off: 0.01,
        }
    }

    fn point(lon: f64, lat: f64) -> PointSource {
        PointSource {
            coordinate: [lon, lat],
            data: [1.0, 2.0, 3.0, 4.0],
        }
    }

    fn no_sources(_: f64) -> Vec<PointSource> {
        Vec::new()
    }

    fn point_draws(fx: &Fixture) -> Vec<i32> {
        fx.rec
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Draw {
                    mode: DrawMode::Points,
                    count,
                    ..
                } => Some(count),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn grid_follows_true_meters_at_center() {
        let (size, resolution) = grid_size(&GeoBounds::new(0.0, 0.0, 1.0, 1.0), 10_000.0).unwrap();
        assert_eq!(size, [12, 12]);
        assert!(resolution > 1.0 && resolution < 1.001);

        // Farther north a degree spans fewer true meters.
        let (north, _) = grid_size(&GeoBounds::new(0.0, 60.0, 1.0, 61.0), 10_000.0).unwrap();
        assert_eq!(north[0], 6);

        assert!(matches!(
            grid_size(&GeoBounds::new(0.0, 0.0, 1.0, 1.0), 0.0),
            Err(SimulationError::Config(_))
        ));
    }

    #[test]
    fn blur_weights_are_normalized() {
        let k = dispersion_kernel(1.0, 60.0, 30.0);
        assert_eq!(k.radius, 4);
        assert_eq!(k.weights.len(), 9);
        let sum: f32 = k.weights.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert_eq!(k.weights[0], k.weights[8]);
        assert!(k.weights[4] > k.weights[3]);
        assert!(k.prelude.starts_with("const int rad = 4;"));
    }

    #[test]
    fn no_dispersion_is_an_identity_blur() {
        let k = dispersion_kernel(0.0, 60.0, 30.0);
        assert_eq!(k.radius, 0);
        assert_eq!(k.weights, vec![1.0]);
    }

    #[test]
    fn prelude_lands_before_main() {
        let k = dispersion_kernel(1.0, 60.0, 30.0);
        let shader = inject_prelude(HEATMAP_UPDATE_FRAGMENT, &k.prelude);
        let prelude_at = shader.find("vec4 dispersion(").unwrap();
        let main_at = shader.find("void main()").unwrap();
        assert!(prelude_at < main_at);
        assert_eq!(shader.matches("void main()").count(), 1);
    }

    #[test]
    fn data_channels_are_validated() {
        let fx = Fixture::new(&[]);
        let bad = HeatmapConfig {
            num_data_types: 5,
            ..config(4)
        };
        let result = Heatmap::from_source(fx.source.clone(), bad, settings(), no_sources);
        assert!(matches!(result, Err(SimulationError::Config(_))));
    }

    #[test]
    fn allocation_uploads_grid_uniforms() {
        let fx = Fixture::new(&[]);
        let mut hm =
            Heatmap::from_source(fx.source.clone(), config(4), settings(), no_sources)
                .unwrap();
        hm.set_context(Some(&fx.gl)).unwrap();

        assert_eq!(hm.size(), [12, 12]);
        assert_eq!(
            fx.rec.last_uniform("u_resolution_tex"),
            Some(UniformValue::Vec2(1.0 / 12.0, 1.0 / 12.0))
        );
        let weights = hm.kernel().blur().weights.clone();
        assert_eq!(
            fx.rec.last_uniform("u_blur_kernel[0]"),
            Some(UniformValue::Floats(weights))
        );
        let info = fx.rec.texture_info(hm.output_texture().unwrap()).unwrap();
        assert_eq!(info.filter, gpu::TextureFilter::Linear);
        assert_eq!(info.uploaded, 0);
    }

    #[test]
    fn linear_float_filtering_is_required() {
        let fx = Fixture::new(&[]);
        fx.rec.disable_extension("OES_texture_float_linear");
        let mut hm =
            Heatmap::from_source(fx.source.clone(), config(4), settings(), no_sources)
                .unwrap();
        assert_eq!(
            hm.set_context(Some(&fx.gl)),
            Err(SimulationError::Gpu(GpuError::MissingExtension(
                "OES_texture_float_linear"
            )))
        );
    }

    #[test]
    fn sources_are_splatted_with_blending() {
        let mut fx = Fixture::new(&[9, 10, 11]);
        fx.settle(10.0);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = seen.clone();
        let feed = move |t: f64| {
            log.borrow_mut().push(t);
            vec![point(0.5, 0.5), point(0.25, 0.75)]
        };
        let mut hm = Heatmap::from_source(fx.source.clone(), config(4), settings(), feed).unwrap();
        hm.set_context(Some(&fx.gl)).unwrap();
        fx.rec.clear_calls();

        assert_eq!(hm.update(60.0, 1).unwrap(), 60.0);

        assert_eq!(*seen.borrow(), vec![10.0 * HOUR_MS]);
        assert_eq!(point_draws(&fx), vec![2]);
        assert!(fx.rec.calls().contains(&Call::SetBlend(true)));
        assert!(!fx.gl.is_blend_enabled());
        assert_eq!(
            fx.rec.count(|c| matches!(c, Call::BufferData(_, 4))),
            2
        );
        assert_eq!(fx.rec.last_uniform("u_diameter"), Some(UniformValue::Float(4.0)));
        assert_eq!(
            fx.rec.last_uniform("u_drop_off"),
            Some(UniformValue::Float((1.0f64 - 0.01).powf(60.0) as f32))
        );
    }

    #[test]
    fn sources_beyond_the_limit_are_dropped() {
        let mut fx = Fixture::new(&[9, 10, 11]);
        fx.settle(10.0);
        let feed = |_: f64| -> Vec<PointSource> {
            (0..5).map(|i| point(0.1 * f64::from(i), 0.5)).collect()
        };
        let mut hm = Heatmap::from_source(fx.source.clone(), config(3), settings(), feed).unwrap();
        hm.set_context(Some(&fx.gl)).unwrap();
        fx.rec.clear_calls();

        hm.update(60.0, 1).unwrap();
        assert_eq!(point_draws(&fx), vec![3]);
    }

    #[test]
    fn no_sources_means_no_splat() {
        let mut fx = Fixture::new(&[9, 10, 11]);
        fx.settle(10.0);
        let mut hm =
            Heatmap::from_source(fx.source.clone(), config(4), settings(), no_sources)
                .unwrap();
        hm.set_context(Some(&fx.gl)).unwrap();
        fx.rec.clear_calls();

        hm.update(60.0, 2).unwrap();
        assert!(point_draws(&fx).is_empty());
        assert_eq!(fx.rec.draw_count(), 2);
    }

    #[test]
    fn applying_sources_reruns_setup_on_the_next_step() {
        let mut fx = Fixture::new(&[9, 10, 11]);
        fx.settle(10.0);
        let feed = |_: f64| vec![point(0.5, 0.5)];
        let mut hm = Heatmap::from_source(fx.source.clone(), config(4), settings(), feed).unwrap();
        hm.set_context(Some(&fx.gl)).unwrap();
        fx.rec.clear_calls();

        assert_eq!(hm.update(30.0, 2).unwrap(), 60.0);
        assert_eq!(point_draws(&fx), vec![1, 1]);
        // The splat program takes over, so each step sets the update pass up again.
        assert_eq!(fx.rec.count(|c| matches!(c, Call::Viewport(_))), 2);
    }
}

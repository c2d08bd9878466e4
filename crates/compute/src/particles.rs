use foundation::bounds::MercBounds;
use foundation::math::affine::to_uniform;
use glam::DMat4;
use gpu::textures::{UNIT_QUAD, create_quad_buffer};
use gpu::{Buffer, DrawMode, Gl, GpuError, GpuProgram, Texture, TextureFilter};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use streaming::{SourceGeometry, TimeSource};

use crate::error::SimulationError;
use crate::shaders::{PARTICLE_UPDATE_FRAGMENT, UPDATE_VERTEX};
use crate::simulation::{INPUT_TEX_UNIT, Simulation, SimulationKernel};

/// Positions are stored as `fract`/`floor` of `merc * SCALE`, which keeps
/// sub-texel precision in a 32-bit float texture.
const SCALE: f64 = 65535.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParticleOptions {
    /// Chance a particle is dropped per second.
    pub drop_rate: f64,
    /// Extra drop chance per m/s of wind speed.
    pub drop_rate_bump: f64,
    pub num_particles: u32,
    /// Fraction of the grid particles may stray outside it before respawning.
    pub padding: f64,
    pub max_particles: u32,
    /// Largest step taken when catching up with a target time, seconds.
    pub time_step: f64,
    pub max_steps: u32,
    pub seed: u64,
}

impl Default for ParticleOptions {
    fn default() -> Self {
        Self {
            drop_rate: 0.0005,
            drop_rate_bump: 0.0001,
            num_particles: 1 << 16,
            padding: 0.05,
            max_particles: 1 << 20,
            time_step: 60.0,
            max_steps: 100,
            seed: 0,
        }
    }
}

/// Side of the square state texture holding `max_particles`.
pub fn state_dimension(max_particles: u32) -> Result<u32, SimulationError> {
    if max_particles == 0 {
        return Err(SimulationError::Config("max_particles must be positive".into()));
    }
    let dim = f64::from(max_particles).sqrt().ceil() as u32;
    if u64::from(dim) * u64::from(dim) < u64::from(max_particles) {
        return Err(SimulationError::Config(format!(
            "particle texture dimension {dim} insufficient for {max_particles} particles"
        )));
    }
    Ok(dim)
}

pub struct ParticleKernel {
    options: ParticleOptions,
    dim: u32,
    span_globe: bool,
    merc_bounds: MercBounds,
    tex_to_merc: DMat4,
    merc_to_tex: DMat4,
    rng: StdRng,
    random_state: Option<Vec<f32>>,
    quad: Option<Buffer>,
    indices: Option<Buffer>,
}

impl ParticleKernel {
    pub fn new(geometry: &SourceGeometry, options: ParticleOptions) -> Result<Self, SimulationError> {
        let dim = state_dimension(options.max_particles)?;
        Ok(Self {
            dim,
            span_globe: geometry.span_globe,
            merc_bounds: geometry.merc_bounds,
            tex_to_merc: geometry.tex_to_merc,
            merc_to_tex: geometry.merc_to_tex,
            rng: StdRng::seed_from_u64(options.seed),
            random_state: None,
            quad: None,
            indices: None,
            options,
        })
    }

    pub fn options(&self) -> &ParticleOptions {
        &self.options
    }

    pub fn dimension(&self) -> u32 {
        self.dim
    }

    /// Particles actually drawn: the requested count rounded up to whole
    /// texture rows.
    pub fn num_particles(&self) -> u32 {
        let rows = self.options.num_particles.div_ceil(self.dim).min(self.dim);
        rows * self.dim
    }

    pub fn set_num_particles(&mut self, n: u32) {
        self.options.num_particles = n;
    }

    pub fn set_drop_rates(&mut self, drop_rate: f64, drop_rate_bump: f64) {
        self.options.drop_rate = drop_rate;
        self.options.drop_rate_bump = drop_rate_bump;
    }

    pub fn index_buffer(&self) -> Option<Buffer> {
        self.indices
    }

    /// Forget the cached spawn positions; the next reset draws new ones.
    pub fn reseed(&mut self) {
        self.random_state = None;
    }

    fn spawn_positions(&mut self) -> Vec<f32> {
        let n = (self.dim * self.dim) as usize;
        let mb = self.merc_bounds;
        let x_range = mb.east - mb.west;
        let y_range = mb.north - mb.south;
        let pad = self.options.padding;
        let x_pad = if self.span_globe { 0.0 } else { pad };

        let mut state = Vec::with_capacity(n * 4);
        for _ in 0..n {
            let rx: f64 = self.rng.random();
            let ry: f64 = self.rng.random();
            let x = (mb.west + (rx * (1.0 + 2.0 * x_pad) - x_pad) * x_range) * SCALE;
            let y = (mb.south + (ry * (1.0 + 2.0 * pad) - pad) * y_range) * SCALE;
            state.extend_from_slice(&[
                (x - x.floor()) as f32,
                (y - y.floor()) as f32,
                x.floor() as f32,
                y.floor() as f32,
            ]);
        }
        state
    }
}

impl SimulationKernel for ParticleKernel {
    fn label(&self) -> &'static str {
        "particles"
    }

    fn vertex_shader(&self) -> &str {
        UPDATE_VERTEX
    }

    fn fragment_shader(&self) -> &str {
        PARTICLE_UPDATE_FRAGMENT
    }

    fn texture_filter(&self) -> TextureFilter {
        TextureFilter::Nearest
    }

    fn allocate(&mut self, gl: &Gl, program: &GpuProgram) -> Result<(), GpuError> {
        let quad = create_quad_buffer(gl.as_ref())?;
        let count = self.dim * self.dim;
        let indices: Vec<f32> = (0..count).map(|i| i as f32).collect();
        let indices = match gl.create_buffer(&indices) {
            Ok(b) => b,
            Err(e) => {
                gl.delete_buffer(quad);
                return Err(e);
            }
        };
        self.quad = Some(quad);
        self.indices = Some(indices);

        let g = gl.as_ref();
        let pad = self.options.padding as f32;
        program.set_i32(g, "u_particles", INPUT_TEX_UNIT as i32);
        program.set_f32(g, "u_span_globe", if self.span_globe { 1.0 } else { 0.0 });
        program.set_vec2(g, "u_padding", if self.span_globe { 0.0 } else { pad }, pad);
        program.set_mat4(g, "u_offset", &to_uniform(&self.tex_to_merc));
        program.set_mat4(g, "u_offset_inverse", &to_uniform(&self.merc_to_tex));
        Ok(())
    }

    fn release(&mut self, gl: &Gl) {
        for b in [self.quad.take(), self.indices.take()].into_iter().flatten() {
            gl.delete_buffer(b);
        }
    }

    fn initial_state(&mut self, _size: [u32; 2]) -> Option<&[f32]> {
        if self.random_state.is_none() {
            self.random_state = Some(self.spawn_positions());
        }
        self.random_state.as_deref()
    }

    fn prepare_update(&mut self, gl: &Gl, program: &GpuProgram, _time_step: f64) {
        let g = gl.as_ref();
        let render_perc = f64::from(self.num_particles()) / f64::from(self.dim * self.dim);
        program.set_f32(g, "u_render_perc", render_perc as f32);
        program.set_f32(g, "u_drop_rate", self.options.drop_rate as f32);
        program.set_f32(g, "u_drop_rate_bump", self.options.drop_rate_bump as f32);
        if let (Some(quad), Some(loc)) = (self.quad, program.attribute("a_pos")) {
            gl.bind_attribute(quad, loc, 2);
        }
    }

    fn execute_update(
        &mut self,
        gl: &Gl,
        program: &GpuProgram,
        _time_step: f64,
        _source: &TimeSource,
    ) {
        program.set_f32(gl.as_ref(), "u_rand_seed", self.rng.random::<f32>());
        gl.draw_arrays(DrawMode::Triangles, 0, (UNIT_QUAD.len() / 2) as i32);
    }
}

/// Particle positions advected through the wind field.
pub type Particles = Simulation<ParticleKernel>;

impl Simulation<ParticleKernel> {
    pub fn from_source(source: TimeSource, options: ParticleOptions) -> Result<Self, SimulationError> {
        let geometry = source.geometry().ok_or(SimulationError::NotLoaded)?;
        let kernel = ParticleKernel::new(&geometry, options)?;
        let dim = kernel.dimension();
        Ok(Simulation::new(kernel, source, [dim, dim]))
    }

    pub fn positions(&self) -> Option<Texture> {
        self.state_texture()
    }

    pub fn indexes(&self) -> Option<Buffer> {
        self.kernel().index_buffer()
    }

    pub fn num_particles(&self) -> u32 {
        self.kernel().num_particles()
    }

    pub fn set_num_particles(&mut self, n: u32) {
        self.kernel_mut().set_num_particles(n);
    }

    pub fn set_drop_rates(&mut self, drop_rate: f64, drop_rate_bump: f64) {
        self.kernel_mut().set_drop_rates(drop_rate, drop_rate_bump);
    }

    /// Respawns every particle at fresh random positions.
    pub fn randomize(&mut self) -> Result<(), SimulationError> {
        self.kernel_mut().reseed();
        self.reset()
    }
}

#[cfg(test)]
mod tests {
    use super::{ParticleKernel, ParticleOptions, Particles, SCALE, state_dimension};
    use crate::error::SimulationError;
    use crate::simulation::SimulationKernel;
    use crate::test_support::Fixture;
    use gpu::recording::{Call, UniformValue};
    use gpu::GpuError;
    use pretty_assertions::assert_eq;

    fn options(max: u32, num: u32) -> ParticleOptions {
        ParticleOptions {
            max_particles: max,
            num_particles: num,
            seed: 7,
            ..ParticleOptions::default()
        }
    }

    #[test]
    fn state_dimension_covers_max_particles() {
        assert_eq!(state_dimension(16).unwrap(), 4);
        assert_eq!(state_dimension(17).unwrap(), 5);
        assert_eq!(state_dimension(1 << 20).unwrap(), 1024);
        assert!(matches!(state_dimension(0), Err(SimulationError::Config(_))));
    }

    #[test]
    fn particle_count_rounds_to_whole_rows() {
        let fx = Fixture::new(&[]);
        let geo = fx.source.geometry().unwrap();
        let mut k = ParticleKernel::new(&geo, options(16, 5)).unwrap();
        assert_eq!(k.num_particles(), 8);
        k.set_num_particles(100);
        assert_eq!(k.num_particles(), 16);
        k.set_num_particles(0);
        assert_eq!(k.num_particles(), 0);
    }

    #[test]
    fn spawn_positions_stay_inside_padded_bounds() {
        let fx = Fixture::new(&[]);
        let geo = fx.source.geometry().unwrap();
        assert!(geo.span_globe);
        let mut k = ParticleKernel::new(&geo, options(64, 64)).unwrap();
        let state = k.initial_state([8, 8]).unwrap().to_vec();
        assert_eq!(state.len(), 64 * 4);

        let mb = geo.merc_bounds;
        let pad_y = 0.05 * mb.height();
        for p in state.chunks(4) {
            assert!((0.0..1.0).contains(&p[0]) && (0.0..1.0).contains(&p[1]));
            let x = (f64::from(p[2]) + f64::from(p[0])) / SCALE;
            let y = (f64::from(p[3]) + f64::from(p[1])) / SCALE;
            // Globe-spanning data gets no horizontal padding.
            assert!(x >= mb.west - 1e-4 && x <= mb.east + 1e-4, "x={x}");
            assert!(y >= mb.north - pad_y - 1e-4 && y <= mb.south + pad_y + 1e-4, "y={y}");
        }
    }

    #[test]
    fn same_seed_same_particles() {
        let fx = Fixture::new(&[]);
        let geo = fx.source.geometry().unwrap();
        let mut a = ParticleKernel::new(&geo, options(16, 16)).unwrap();
        let mut b = ParticleKernel::new(&geo, options(16, 16)).unwrap();
        assert_eq!(a.initial_state([4, 4]), b.initial_state([4, 4]));
    }

    #[test]
    fn allocation_uploads_fixed_uniforms() {
        let fx = Fixture::new(&[]);
        let mut p = Particles::from_source(fx.source.clone(), options(16, 5)).unwrap();
        p.set_context(Some(&fx.gl)).unwrap();

        assert_eq!(p.size(), [4, 4]);
        assert_eq!(fx.rec.last_uniform("u_span_globe"), Some(UniformValue::Float(1.0)));
        assert_eq!(fx.rec.last_uniform("u_padding"), Some(UniformValue::Vec2(0.0, 0.05)));
        let index_buffer = p.indexes().unwrap();
        assert_eq!(
            fx.rec.count(|c| matches!(c, Call::CreateBuffer(b, 16) if *b == index_buffer)),
            1
        );
        let info = fx.rec.texture_info(p.positions().unwrap()).unwrap();
        assert_eq!(info.filter, gpu::TextureFilter::Nearest);
        assert_eq!(info.uploaded, 64);
    }

    #[test]
    fn update_reports_render_fraction_and_draws() {
        let mut fx = Fixture::new(&[9, 10, 11]);
        fx.settle(10.0);
        let mut p = Particles::from_source(fx.source.clone(), options(16, 5)).unwrap();
        p.set_context(Some(&fx.gl)).unwrap();
        fx.rec.clear_calls();

        assert_eq!(p.update(60.0, 2).unwrap(), 120.0);
        assert_eq!(fx.rec.last_uniform("u_render_perc"), Some(UniformValue::Float(0.5)));
        assert_eq!(
            fx.rec.count(|c| matches!(c, Call::Uniform { name, .. } if name == "u_rand_seed")),
            2
        );
        assert_eq!(fx.rec.draw_count(), 2);
    }

    #[test]
    fn option_changes_reach_the_next_update() {
        let mut fx = Fixture::new(&[9, 10, 11]);
        fx.settle(10.0);
        let mut p = Particles::from_source(fx.source.clone(), options(16, 16)).unwrap();
        p.set_context(Some(&fx.gl)).unwrap();
        p.update(60.0, 1).unwrap();
        assert_eq!(fx.rec.last_uniform("u_render_perc"), Some(UniformValue::Float(1.0)));

        p.set_drop_rates(0.5, 0.25);
        p.set_num_particles(4);
        p.update(60.0, 1).unwrap();
        assert_eq!(fx.rec.last_uniform("u_drop_rate"), Some(UniformValue::Float(0.5)));
        assert_eq!(fx.rec.last_uniform("u_drop_rate_bump"), Some(UniformValue::Float(0.25)));
        assert_eq!(fx.rec.last_uniform("u_render_perc"), Some(UniformValue::Float(0.25)));
    }

    #[test]
    fn north_padding_positions_split_into_positive_fractions() {
        let fx = Fixture::new(&[]);
        let geo = fx.source.geometry().unwrap();
        let mut k = ParticleKernel::new(&geo, options(1024, 1024)).unwrap();
        let state = k.initial_state([32, 32]).unwrap().to_vec();

        let negative: Vec<&[f32]> = state.chunks(4).filter(|p| p[3] < 0.0).collect();
        assert!(!negative.is_empty());
        for p in negative {
            assert!((0.0..1.0).contains(&p[1]), "fraction {}", p[1]);
            assert_eq!(p[3], p[3].floor());
        }
    }

    #[test]
    fn randomize_draws_new_positions() {
        let fx = Fixture::new(&[]);
        let mut p = Particles::from_source(fx.source.clone(), options(16, 16)).unwrap();
        p.set_context(Some(&fx.gl)).unwrap();
        let first = p.kernel_mut().initial_state([4, 4]).unwrap().to_vec();
        p.randomize().unwrap();
        let second = p.kernel_mut().initial_state([4, 4]).unwrap().to_vec();
        assert_ne!(first, second);
    }

    #[test]
    fn float_textures_are_required() {
        let fx = Fixture::new(&[]);
        fx.rec.disable_extension("OES_texture_float");
        let mut p = Particles::from_source(fx.source.clone(), options(16, 16)).unwrap();
        assert_eq!(
            p.set_context(Some(&fx.gl)),
            Err(SimulationError::Gpu(GpuError::MissingExtension("OES_texture_float")))
        );
        assert!(!p.has_context());
    }
}

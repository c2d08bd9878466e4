//! Ping-pong GPU simulation stepped against a `TimeSource`.
//!
//! The engine owns the update program, a framebuffer and two state
//! textures; a `SimulationKernel` supplies the shaders and the per-step
//! draw. Each step reads state `current`, writes `current ^ 1`, then flips.

use foundation::time::SECONDS_PER_HOUR;
use gpu::textures::{TextureSpec, bind_texture, create_texture, require_extension};
use gpu::{
    Framebuffer, Gl, GpuError, GpuProgram, PixelData, TexelType, Texture, TextureFilter,
    same_context,
};
use runtime::{Metrics, names};
use streaming::TimeSource;
use tracing::debug;

use crate::error::SimulationError;

pub const UV_TEX_0_UNIT: u32 = 0;
pub const UV_TEX_1_UNIT: u32 = 1;
pub const INPUT_TEX_UNIT: u32 = 2;

/// The model-specific half of a simulation.
///
/// Hooks run with the update program current and the output texture
/// attached to the bound framebuffer.
pub trait SimulationKernel {
    fn label(&self) -> &'static str;

    fn vertex_shader(&self) -> &str;

    fn fragment_shader(&self) -> &str;

    fn required_extensions(&self) -> &'static [&'static str] {
        &["OES_texture_float"]
    }

    /// `Nearest` where exact texel values matter, `Linear` for smooth fields.
    fn texture_filter(&self) -> TextureFilter;

    /// Creates kernel-owned GPU objects and uploads uniforms that stay fixed
    /// for the program's lifetime. The update program is current.
    fn allocate(&mut self, gl: &Gl, program: &GpuProgram) -> Result<(), GpuError>;

    fn release(&mut self, gl: &Gl);

    /// Contents of a freshly reset state texture; `None` clears it.
    fn initial_state(&mut self, size: [u32; 2]) -> Option<&[f32]>;

    /// Runs whenever the update program had to be made current again.
    fn prepare_update(&mut self, gl: &Gl, program: &GpuProgram, time_step: f64);

    /// Issues the draw for one step.
    fn execute_update(
        &mut self,
        gl: &Gl,
        program: &GpuProgram,
        time_step: f64,
        source: &TimeSource,
    );

    fn before_update(&mut self, _source: &TimeSource) {}

    fn after_update(&mut self, _source: &TimeSource) {}
}

struct Resources {
    gl: Gl,
    program: GpuProgram,
    framebuffer: Option<Framebuffer>,
    textures: Vec<Texture>,
    current: usize,
    /// Framebuffer, viewport and per-update uniforms still need applying.
    stale: bool,
}

impl Resources {
    fn release(self) {
        let gl = self.gl;
        for t in self.textures {
            gl.delete_texture(t);
        }
        if let Some(fb) = self.framebuffer {
            gl.delete_framebuffer(fb);
        }
        self.program.delete(gl.as_ref());
    }
}

pub struct Simulation<K: SimulationKernel> {
    kernel: K,
    source: TimeSource,
    size: [u32; 2],
    resources: Option<Resources>,
    metrics: Metrics,
}

impl<K: SimulationKernel> Simulation<K> {
    /// No GPU work happens until `set_context`.
    pub fn new(kernel: K, source: TimeSource, size: [u32; 2]) -> Self {
        Self {
            kernel,
            source,
            size,
            resources: None,
            metrics: Metrics::new(),
        }
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    /// Kernel options may feed per-update uniforms, so they are applied
    /// again on the next update.
    pub fn kernel_mut(&mut self) -> &mut K {
        self.invalidate();
        &mut self.kernel
    }

    /// Re-runs program setup and `prepare_update` on the next update.
    pub fn invalidate(&mut self) {
        if let Some(r) = self.resources.as_mut() {
            r.stale = true;
        }
    }

    pub fn source(&self) -> &TimeSource {
        &self.source
    }

    pub fn size(&self) -> [u32; 2] {
        self.size
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn has_context(&self) -> bool {
        self.resources.is_some()
    }

    /// The most recently written state.
    pub fn state_texture(&self) -> Option<Texture> {
        self.resources
            .as_ref()
            .and_then(|r| r.textures.get(r.current).copied())
    }

    pub fn state_textures(&self) -> Option<[Texture; 2]> {
        let r = self.resources.as_ref()?;
        Some([*r.textures.first()?, *r.textures.get(1)?])
    }

    pub fn set_context(&mut self, gl: Option<&Gl>) -> Result<(), SimulationError> {
        if same_context(self.resources.as_ref().map(|r| &r.gl), gl) {
            return Ok(());
        }
        self.release();
        let Some(gl) = gl else {
            return Ok(());
        };
        debug!(kernel = self.kernel.label(), size = ?self.size, "simulation: allocating");
        for ext in self.kernel.required_extensions() {
            require_extension(gl.as_ref(), ext)?;
        }
        let program = GpuProgram::compile(
            gl.as_ref(),
            self.kernel.label(),
            self.kernel.vertex_shader(),
            self.kernel.fragment_shader(),
        )?;
        let mut res = Resources {
            gl: gl.clone(),
            program,
            framebuffer: None,
            textures: Vec::with_capacity(2),
            current: 0,
            stale: true,
        };
        match self.fill(&mut res) {
            Ok(()) => {
                self.resources = Some(res);
                Ok(())
            }
            Err(e) => {
                res.release();
                Err(e.into())
            }
        }
    }

    fn fill(&mut self, res: &mut Resources) -> Result<(), GpuError> {
        let gl = res.gl.clone();
        res.framebuffer = Some(gl.create_framebuffer()?);
        let spec = self.texture_spec();
        for _ in 0..2 {
            let data = self.kernel.initial_state(self.size);
            let pixels = data.map_or(PixelData::Empty, PixelData::F32);
            res.textures.push(create_texture(gl.as_ref(), &spec, pixels)?);
        }
        gl.use_program(res.program.handle());
        res.program.set_i32(gl.as_ref(), "u_tex_0", UV_TEX_0_UNIT as i32);
        res.program.set_i32(gl.as_ref(), "u_tex_1", UV_TEX_1_UNIT as i32);
        self.kernel.allocate(&gl, &res.program)
    }

    fn texture_spec(&self) -> TextureSpec {
        TextureSpec::new(self.size, self.kernel.texture_filter(), TexelType::Float)
    }

    fn release(&mut self) {
        if let Some(r) = self.resources.take() {
            self.kernel.release(&r.gl);
            r.release();
        }
    }

    /// Reinitializes both state textures from the kernel.
    pub fn reset(&mut self) -> Result<(), SimulationError> {
        let r = self.resources.as_mut().ok_or(GpuError::NoContext)?;
        let [w, h] = self.size;
        for t in &r.textures {
            bind_texture(r.gl.as_ref(), *t, INPUT_TEX_UNIT);
            let data = self.kernel.initial_state(self.size);
            let pixels = data.map_or(PixelData::Empty, PixelData::F32);
            r.gl.tex_image(w, h, TexelType::Float, pixels)?;
        }
        // The input unit no longer holds what the interpolator memo thinks.
        self.source.with_interpolator(|i| i.release_textures());
        Ok(())
    }

    /// Advances the simulation by up to `steps` steps of `time_step`
    /// seconds, moving the source's time along with it.
    ///
    /// With `steps == 0` one pass runs at the current time without moving
    /// it. The loop stops as soon as the source cannot render
    /// synchronously; the return value is the simulated time actually
    /// covered, in seconds.
    pub fn update(&mut self, time_step: f64, steps: u32) -> Result<f64, SimulationError> {
        if time_step == 0.0 {
            return Ok(0.0);
        }
        let gl = match &self.resources {
            Some(r) => r.gl.clone(),
            None => return Err(GpuError::NoContext.into()),
        };
        let blend = gl.is_blend_enabled();
        let source = self.source.clone();
        let result = {
            let _quiet = source.suppress_events();
            self.run_steps(&gl, time_step, steps)
        };
        source.with_interpolator(|i| i.release_textures());
        gl.set_blend(blend);

        let completed = result?;
        self.metrics
            .inc_by(names::SIMULATION_STEPS, u64::from(completed));
        self.metrics
            .record(names::SIMULATION_BATCH, i64::from(completed));
        Ok(f64::from(completed) * time_step)
    }

    fn run_steps(&mut self, gl: &Gl, time_step: f64, steps: u32) -> Result<u32, SimulationError> {
        let Self {
            kernel,
            source,
            size,
            resources,
            ..
        } = self;
        let r = resources.as_mut().ok_or(GpuError::NoContext)?;

        let mut completed = 0;
        loop {
            if !source.poll_ready() {
                break;
            }
            kernel.before_update(source);

            if r.stale || gl.current_program() != Some(r.program.handle()) {
                r.stale = false;
                gl.use_program(r.program.handle());
                gl.viewport(0, 0, size[0] as i32, size[1] as i32);
                gl.bind_framebuffer(r.framebuffer);
                r.program.set_f32(gl.as_ref(), "u_time_step", time_step as f32);
                gl.set_blend(false);
                kernel.prepare_update(gl, &r.program, time_step);
                source.with_interpolator(|i| i.release_textures());
            }

            bind_texture(gl.as_ref(), r.textures[r.current], INPUT_TEX_UNIT);
            gl.framebuffer_texture(r.textures[r.current ^ 1]);

            let mix = r.program.uniform("u_tex_a");
            source
                .with_interpolator(|i| i.bind_textures(gl, UV_TEX_0_UNIT, UV_TEX_1_UNIT, mix))
                .unwrap_or(Err(GpuError::NoContext))?;

            kernel.execute_update(gl, &r.program, time_step, source);
            r.current ^= 1;
            completed += 1;

            if steps == 0 {
                break;
            }
            let now = source.time().unwrap_or_default();
            // Requests go out immediately; readiness is polled next round.
            drop(source.set_time(now + time_step / SECONDS_PER_HOUR));
            kernel.after_update(source);

            if completed == steps {
                break;
            }
        }
        Ok(completed)
    }
}

impl<K: SimulationKernel> Drop for Simulation<K> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::{INPUT_TEX_UNIT, Simulation, SimulationKernel};
    use crate::test_support::Fixture;
    use gpu::recording::Call;
    use gpu::{DrawMode, Gl, GpuError, GpuProgram, TextureFilter};
    use pretty_assertions::assert_eq;
    use runtime::names;
    use streaming::TimeSource;

    #[derive(Default)]
    struct Counting {
        prepared: usize,
        executed: usize,
        released: usize,
        state: Vec<f32>,
    }

    const VS: &str = "attribute vec2 a_pos;\nvoid main() {}\n";
    const FS: &str = "uniform sampler2D u_tex_0;\nuniform sampler2D u_tex_1;\nuniform float u_tex_a;\nuniform float u_time_step;\nvoid main() {}\n";

    impl SimulationKernel for Counting {
        fn label(&self) -> &'static str {
            "counting"
        }
        fn vertex_shader(&self) -> &str {
            VS
        }
        fn fragment_shader(&self) -> &str {
            FS
        }
        fn texture_filter(&self) -> TextureFilter {
            TextureFilter::Nearest
        }
        fn allocate(&mut self, _gl: &Gl, _program: &GpuProgram) -> Result<(), GpuError> {
            Ok(())
        }
        fn release(&mut self, _gl: &Gl) {
            self.released += 1;
        }
        fn initial_state(&mut self, [w, h]: [u32; 2]) -> Option<&[f32]> {
            self.state = vec![0.5; (w * h * 4) as usize];
            Some(&self.state)
        }
        fn prepare_update(&mut self, _gl: &Gl, _program: &GpuProgram, _time_step: f64) {
            self.prepared += 1;
        }
        fn execute_update(
            &mut self,
            gl: &Gl,
            _program: &GpuProgram,
            _time_step: f64,
            _source: &TimeSource,
        ) {
            self.executed += 1;
            gl.draw_arrays(DrawMode::Triangles, 0, 6);
        }
    }

    fn simulation(fx: &Fixture) -> Simulation<Counting> {
        let mut sim = Simulation::new(Counting::default(), fx.source.clone(), [2, 2]);
        sim.set_context(Some(&fx.gl)).unwrap();
        sim
    }

    #[test]
    fn stops_when_the_source_runs_out_of_data() {
        let mut fx = Fixture::new(&[9, 10, 11]);
        let _hold_12 = fx.loader.hold(streaming::Request::Snapshot(12));
        fx.settle(10.0);
        let dt_h = 10.0 / 3600.0;
        fx.settle(11.0 - 2.5 * dt_h);

        let mut sim = simulation(&fx);
        let covered = sim.update(10.0, 5).unwrap();

        assert_eq!(covered, 30.0);
        assert_eq!(sim.kernel().executed, 3);
        assert_eq!(sim.metrics().counter(names::SIMULATION_STEPS), 3);
        assert_eq!(
            sim.metrics().histogram(names::SIMULATION_BATCH).map(|h| h.max),
            Some(3)
        );
        assert!((fx.source.time().unwrap() - (11.0 + 0.5 * dt_h)).abs() < 1e-9);
    }

    #[test]
    fn zero_time_step_is_a_no_op() {
        let mut fx = Fixture::new(&[9, 10, 11]);
        fx.settle(10.0);
        let mut sim = simulation(&fx);
        fx.rec.clear_calls();

        assert_eq!(sim.update(0.0, 7).unwrap(), 0.0);
        assert_eq!(fx.rec.draw_count(), 0);
        assert!(fx.rec.calls().is_empty());
    }

    #[test]
    fn visualization_pass_keeps_time() {
        let mut fx = Fixture::new(&[9, 10, 11]);
        fx.settle(10.25);
        let mut sim = simulation(&fx);
        let before = sim.state_texture();

        assert_eq!(sim.update(60.0, 0).unwrap(), 60.0);
        assert_eq!(fx.source.time(), Some(10.25));
        assert_eq!(sim.kernel().executed, 1);
        assert_ne!(sim.state_texture(), before);
    }

    #[test]
    fn steps_ping_pong_and_restore_state() {
        let mut fx = Fixture::new(&[9, 10, 11]);
        fx.settle(10.0);
        fx.gl.set_blend(true);
        let mut sim = simulation(&fx);
        let [a, b] = sim.state_textures().unwrap();
        fx.rec.clear_calls();

        let covered = sim.update(60.0, 2).unwrap();
        assert_eq!(covered, 120.0);
        assert_eq!(sim.state_texture(), Some(a));

        let attached: Vec<_> = fx
            .rec
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::FramebufferTexture { texture, .. } => Some(texture),
                _ => None,
            })
            .collect();
        assert_eq!(attached, vec![b, a]);

        // The program stayed current, so setup ran once.
        assert_eq!(sim.kernel().prepared, 1);
        assert!(fx.gl.is_blend_enabled());
        assert_eq!(fx.rec.bound_texture(INPUT_TEX_UNIT), Some(b));
    }

    #[test]
    fn events_are_held_back_during_the_loop() {
        let mut fx = Fixture::new(&[9, 10, 11]);
        fx.settle(10.0);
        let fired = std::rc::Rc::new(std::cell::Cell::new(0));
        let seen = fired.clone();
        fx.source.subscribe(move |_| seen.set(seen.get() + 1));

        let mut sim = simulation(&fx);
        sim.update(60.0, 3).unwrap();
        assert_eq!(fired.get(), 0);
        assert!(!fx.source.events_suppressed());
    }

    #[test]
    fn update_without_context_is_an_error() {
        let fx = Fixture::new(&[]);
        let mut sim = Simulation::new(Counting::default(), fx.source.clone(), [2, 2]);
        assert_eq!(
            sim.update(1.0, 1),
            Err(GpuError::NoContext.into())
        );
    }

    #[test]
    fn rebinding_the_same_context_keeps_resources() {
        let fx = Fixture::new(&[]);
        let mut sim = simulation(&fx);
        let textures = sim.state_textures();
        let created = fx.rec.count(|c| matches!(c, Call::CreateTexture(_)));

        sim.set_context(Some(&fx.gl)).unwrap();
        assert_eq!(sim.state_textures(), textures);
        assert_eq!(fx.rec.count(|c| matches!(c, Call::CreateTexture(_))), created);

        sim.set_context(None).unwrap();
        assert!(!sim.has_context());
        assert_eq!(sim.kernel().released, 1);
    }

    #[test]
    fn reset_reuploads_both_textures() {
        let fx = Fixture::new(&[]);
        let mut sim = simulation(&fx);
        fx.rec.clear_calls();
        sim.reset().unwrap();
        assert_eq!(
            fx.rec.count(|c| matches!(c, Call::TexImage { len: 16, .. })),
            2
        );
    }
}

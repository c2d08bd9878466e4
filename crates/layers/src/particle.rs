//! Wind particles drawn as points over the map.

use std::collections::BTreeMap;
use std::rc::Rc;

use compute::{ParticleOptions, Particles};
use foundation::math::mercator::{norm_merc_point, to_mercator};
use foundation::time::SECONDS_PER_HOUR;
use gpu::textures::bind_texture;
use gpu::{DrawMode, Gl, GpuProgram};
use runtime::{Frame, catch_up};
use serde::{Deserialize, Serialize};
use streaming::{SourceGeometry, TimeSource};
use tracing::{debug, trace, warn};

use crate::error::LayerError;
use crate::layer::{LayerBase, LayerId, MapView, TimeLayer, world_copies};
use crate::shaders::{PARTICLE_DRAW_FRAGMENT, PARTICLE_DRAW_VERTEX};
use crate::symbology::{PropertyTable, PropertyValue};

const POS_TEX_UNIT: u32 = 0;
const POSITION_SCALE: f64 = 65535.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParticleLayerOptions {
    pub particles: ParticleOptions,
    /// Initial style properties, applied in name order.
    pub properties: BTreeMap<String, PropertyValue>,
}

pub struct ParticleLayer {
    base: LayerBase,
    properties: Rc<PropertyTable<ParticleLayer>>,
    options: ParticleOptions,
    particles: Option<Particles>,
    draw: Option<GpuProgram>,
    color: [f32; 4],
    visible: bool,
    /// Step toward `target_time` instead of animating in place.
    simulation_mode: bool,
    target_time: Option<f64>,
    max_step_time: f64,
    max_steps: u32,
    visualisation_time_step: f64,
    rendered_time: Option<f64>,
}

fn property_table() -> PropertyTable<ParticleLayer> {
    PropertyTable::<ParticleLayer>::new()
        .with("particle-color", |l, v| {
            l.color = v.as_color("particle-color")?;
            Ok(())
        })
        .with("visible", |l, v| {
            l.visible = v.as_bool("visible")?;
            Ok(())
        })
        .with("simulation-mode", |l, v| {
            l.simulation_mode = v.as_bool("simulation-mode")?;
            Ok(())
        })
        .with("simulation-target-time", |l, v| {
            l.set_target_time(v.as_f64("simulation-target-time")?);
            Ok(())
        })
        .with("simulation-max-step-time", |l, v| {
            l.max_step_time = v.as_f64("simulation-max-step-time")?;
            Ok(())
        })
        .with("simulation-max-steps", |l, v| {
            l.max_steps = v.as_u32("simulation-max-steps")?;
            Ok(())
        })
        .with("visualisation-time-step", |l, v| {
            l.visualisation_time_step = v.as_f64("visualisation-time-step")?;
            Ok(())
        })
        .with("num-particles", |l, v| {
            let n = v.as_u32("num-particles")?;
            l.options.num_particles = n;
            if let Some(p) = l.particles.as_mut() {
                p.set_num_particles(n);
            }
            Ok(())
        })
        .with("drop-rate", |l, v| {
            l.options.drop_rate = v.as_f64("drop-rate")?;
            l.push_drop_rates();
            Ok(())
        })
        .with("drop-rate-bump", |l, v| {
            l.options.drop_rate_bump = v.as_f64("drop-rate-bump")?;
            l.push_drop_rates();
            Ok(())
        })
}

impl ParticleLayer {
    pub fn new(
        id: LayerId,
        source: TimeSource,
        options: ParticleLayerOptions,
    ) -> Result<Self, LayerError> {
        let mut layer = Self {
            base: LayerBase::new(id, source),
            properties: Rc::new(property_table()),
            max_step_time: options.particles.time_step,
            max_steps: options.particles.max_steps,
            options: options.particles,
            particles: None,
            draw: None,
            color: [1.0; 4],
            visible: true,
            simulation_mode: false,
            target_time: None,
            visualisation_time_step: 60.0,
            rendered_time: None,
        };
        for (name, value) in &options.properties {
            layer.set_property(name, value)?;
        }
        Ok(layer)
    }

    pub fn particles(&self) -> Option<&Particles> {
        self.particles.as_ref()
    }

    pub fn is_initialized(&self) -> bool {
        self.draw.is_some()
    }

    pub fn target_time(&self) -> Option<f64> {
        self.target_time
    }

    pub fn set_target_time(&mut self, hours: f64) {
        self.target_time = Some(hours);
        self.base.repaint().request();
    }

    /// Respawns every particle.
    pub fn randomize(&mut self) -> Result<(), LayerError> {
        if let Some(p) = self.particles.as_mut() {
            p.randomize()?;
        }
        self.rendered_time = None;
        self.base.repaint().request();
        Ok(())
    }

    fn push_drop_rates(&mut self) {
        let (rate, bump) = (self.options.drop_rate, self.options.drop_rate_bump);
        if let Some(p) = self.particles.as_mut() {
            p.set_drop_rates(rate, bump);
        }
    }

    /// Creates the simulation and draw program once the source knows its
    /// grid. Until then this quietly does nothing and `prerender` retries.
    fn build(&mut self) -> Result<(), LayerError> {
        let Some(gl) = self.base.gl().cloned() else {
            return Ok(());
        };
        if self.draw.is_some() || !self.base.source().is_loaded() {
            return Ok(());
        }
        if self.particles.is_none() {
            self.particles = Some(Particles::from_source(
                self.base.source().clone(),
                self.options.clone(),
            )?);
        }
        let Some(particles) = self.particles.as_mut() else {
            return Ok(());
        };
        particles.set_context(Some(&gl))?;

        let g = gl.as_ref();
        let program =
            GpuProgram::compile(g, "particle-draw", PARTICLE_DRAW_VERTEX, PARTICLE_DRAW_FRAGMENT)?;
        gl.use_program(program.handle());
        program.set_i32(g, "u_particles", POS_TEX_UNIT as i32);
        program.set_f32(g, "u_particles_res", particles.size()[0] as f32);
        self.draw = Some(program);
        debug!(layer = %self.base.id().0, particles = particles.num_particles(), "particle layer ready");
        Ok(())
    }

    fn step(&mut self) -> Result<(), LayerError> {
        let Some(particles) = self.particles.as_mut() else {
            return Ok(());
        };
        let Some(time) = self.base.source().time() else {
            return Ok(());
        };
        if self.simulation_mode {
            let Some(target) = self.target_time else {
                return Ok(());
            };
            let gap = (target - time) * SECONDS_PER_HOUR;
            if let Some(plan) = catch_up(gap, self.max_step_time, self.max_steps) {
                let covered = particles.update(plan.time_step_s, plan.steps)?;
                trace!(gap, covered, steps = plan.steps, "particles caught up");
            }
        } else if self.visualisation_time_step != 0.0 {
            particles.update(self.visualisation_time_step, 0)?;
        }
        Ok(())
    }

    fn maybe_repaint(&self) {
        if !self.simulation_mode || self.base.source().time() != self.rendered_time {
            self.base.repaint().request();
        }
    }

    fn draw_points(&self, gl: &Gl, view: &MapView, geometry: &SourceGeometry) {
        let (Some(program), Some(particles)) = (self.draw.as_ref(), self.particles.as_ref()) else {
            return;
        };
        let (Some(positions), Some(indexes)) = (particles.positions(), particles.indexes()) else {
            return;
        };
        let g = gl.as_ref();
        gl.use_program(program.handle());

        let b = &view.bounds;
        let [l, t] = norm_merc_point(to_mercator([b.west, b.north]));
        let [r, bottom] = norm_merc_point(to_mercator([b.east, b.south]));
        program.set_vec2(g, "u_scale", (1.0 / (r - l)) as f32, (1.0 / (bottom - t)) as f32);
        let offset = [-l * POSITION_SCALE, -t * POSITION_SCALE];
        let whole = offset.map(f64::floor);
        program.set_vec2(
            g,
            "u_offset_f",
            (offset[0] - whole[0]) as f32,
            (offset[1] - whole[1]) as f32,
        );
        program.set_vec2(g, "u_offset_i", whole[0] as f32, whole[1] as f32);

        bind_texture(g, positions, POS_TEX_UNIT);
        program.set_i32(g, "u_particles", POS_TEX_UNIT as i32);

        let size = point_size(view, geometry);
        let c = size.min(1.0).powi(2).clamp(1.0 / 256.0, 180.0 / 255.0) as f32;
        program.set_f32(g, "u_size", size.max(1.0) as f32);
        program.set_vec4(g, "u_color", self.color.map(|v| v * c));

        let a_index = program.attribute("a_index");
        if let Some(loc) = a_index {
            gl.bind_attribute(indexes, loc, 1);
        }
        let count = particles.num_particles() as i32;
        for i in world_copies(b.west, b.east, &geometry.bounds) {
            program.set_vec2(g, "u_wrap", i as f32, 0.0);
            gl.draw_arrays(DrawMode::Points, 0, count);
        }
        if let Some(loc) = a_index {
            gl.disable_attribute(loc);
        }
    }
}

/// Half the on-screen size of one grid texel, capped at 8 px.
pub fn point_size(view: &MapView, geometry: &SourceGeometry) -> f64 {
    let m = view.matrix * geometry.tex_to_merc;
    let texel_px = |axis: glam::DVec4, canvas: u32, texels: u32| {
        axis.truncate().length() * f64::from(canvas) / 2.0 / f64::from(texels.max(1))
    };
    let x = texel_px(m.x_axis, view.canvas_size[0], geometry.texture_size[0]);
    let y = texel_px(m.y_axis, view.canvas_size[1], geometry.texture_size[1]);
    x.min(y).min(8.0) / 2.0
}

impl TimeLayer for ParticleLayer {
    fn id(&self) -> &LayerId {
        self.base.id()
    }

    fn initialize(&mut self, gl: &Gl) -> Result<(), LayerError> {
        if !self.base.attach(gl)? {
            return Ok(());
        }
        let built = self.build();
        if built.is_err() {
            self.uninitialize();
        }
        built
    }

    fn uninitialize(&mut self) {
        if let Some(p) = self.particles.as_mut() {
            if let Err(e) = p.set_context(None) {
                warn!(layer = %self.base.id().0, error = %e, "releasing particles failed");
            }
        }
        if let (Some(program), Some(gl)) = (self.draw.take(), self.base.gl()) {
            program.delete(gl.as_ref());
        }
        self.rendered_time = None;
        self.base.detach();
    }

    fn prerender(&mut self, frame: &Frame) -> Result<(), LayerError> {
        if !self.base.is_attached() {
            return Ok(());
        }
        self.build()?;
        trace!(frame = frame.index, "particle prerender");
        self.step()?;
        self.maybe_repaint();
        Ok(())
    }

    fn render(&mut self, view: &MapView) -> Result<(), LayerError> {
        if !self.visible {
            return Ok(());
        }
        let (Some(gl), Some(geometry)) = (self.base.gl().cloned(), self.base.source().geometry())
        else {
            return Ok(());
        };
        self.base.source().set_context(Some(&gl))?;
        self.draw_points(&gl, view, &geometry);
        self.rendered_time = self.base.source().time();
        Ok(())
    }

    fn set_property(&mut self, name: &str, value: &PropertyValue) -> Result<(), LayerError> {
        let table = self.properties.clone();
        table.apply(self, name, value)?;
        self.base.repaint().request();
        Ok(())
    }

    fn take_repaint(&self) -> bool {
        self.base.repaint().take()
    }

    fn on_context_lost(&mut self) {
        self.uninitialize();
        self.base.context_lost();
    }
}

#[cfg(test)]
mod tests {
    use super::{ParticleLayer, ParticleLayerOptions, point_size};
    use crate::error::LayerError;
    use crate::layer::{MapView, TimeLayer};
    use crate::symbology::PropertyValue;
    use crate::test_support::{Fixture, world_view};
    use compute::ParticleOptions;
    use foundation::bounds::GeoBounds;
    use foundation::math::affine::translate_scale;
    use gpu::recording::{Call, UniformValue};
    use gpu::{DrawMode, Gl, RecordingContext};
    use pretty_assertions::assert_eq;
    use runtime::{Frame, names};
    use std::rc::Rc;

    fn options() -> ParticleLayerOptions {
        ParticleLayerOptions {
            particles: ParticleOptions {
                max_particles: 16,
                num_particles: 16,
                seed: 3,
                ..ParticleOptions::default()
            },
            ..ParticleLayerOptions::default()
        }
    }

    fn layer(fx: &Fixture) -> ParticleLayer {
        let mut layer = ParticleLayer::new("wind".into(), fx.source.clone(), options()).unwrap();
        layer.initialize(&fx.gl).unwrap();
        layer
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
    fn initialize_builds_simulation_and_draw_program() {
        let fx = Fixture::new(&[]);
        let mut layer = layer(&fx);
        assert!(layer.is_initialized());
        assert!(layer.particles().unwrap().has_context());
        assert!(layer.take_repaint());

        let programs = fx.rec.live_programs();
        layer.initialize(&fx.gl).unwrap();
        assert_eq!(fx.rec.live_programs(), programs);
    }

    #[test]
    fn initial_properties_are_validated() {
        let fx = Fixture::new(&[]);
        let mut opts = options();
        opts.properties
            .insert("particle-colour".into(), PropertyValue::from("white"));
        assert!(matches!(
            ParticleLayer::new("wind".into(), fx.source.clone(), opts),
            Err(LayerError::UnknownProperty(_))
        ));

        let mut layer = layer(&fx);
        assert_eq!(
            layer.set_property("simulation-max-steps", &PropertyValue::Number(-1.0)),
            Err(LayerError::InvalidValue {
                property: "simulation-max-steps".into(),
                expected: "a non-negative integer"
            })
        );
    }

    #[test]
    fn simulation_mode_catches_up_to_the_target() {
        let mut fx = Fixture::new(&[9, 10, 11]);
        let mut layer = layer(&fx);
        fx.settle(10.0);
        layer
            .set_property("simulation-mode", &PropertyValue::Bool(true))
            .unwrap();
        layer
            .set_property("simulation-target-time", &PropertyValue::Number(10.5))
            .unwrap();

        layer.prerender(&Frame::first()).unwrap();

        let particles = layer.particles().unwrap();
        assert_eq!(particles.metrics().counter(names::SIMULATION_STEPS), 30);
        assert!((fx.source.time().unwrap() - 10.5).abs() < 1e-9);
    }

    #[test]
    fn visualisation_mode_animates_in_place() {
        let mut fx = Fixture::new(&[9, 10, 11]);
        let mut layer = layer(&fx);
        fx.settle(10.25);
        layer.take_repaint();

        layer.prerender(&Frame::first()).unwrap();
        assert_eq!(
            layer.particles().unwrap().metrics().counter(names::SIMULATION_STEPS),
            1
        );
        assert_eq!(fx.source.time(), Some(10.25));
        assert!(layer.take_repaint());
    }

    #[test]
    fn render_draws_every_world_copy() {
        let mut fx = Fixture::new(&[9, 10, 11]);
        let mut layer = layer(&fx);
        fx.settle(10.0);
        layer.prerender(&Frame::first()).unwrap();
        fx.rec.clear_calls();

        let view = MapView {
            bounds: GeoBounds::new(-270.0, -60.0, 270.0, 60.0),
            ..world_view()
        };
        layer.render(&view).unwrap();

        assert_eq!(point_draws(&fx), vec![16, 16, 16]);
        assert_eq!(fx.rec.last_uniform("u_wrap"), Some(UniformValue::Vec2(1.0, 0.0)));
        let positions = layer.particles().unwrap().positions();
        assert_eq!(fx.rec.bound_texture(0), positions);
    }

    #[test]
    fn hidden_layers_draw_nothing() {
        let mut fx = Fixture::new(&[9, 10, 11]);
        let mut layer = layer(&fx);
        fx.settle(10.0);
        layer
            .set_property("visible", &PropertyValue::Bool(false))
            .unwrap();
        fx.rec.clear_calls();
        layer.render(&world_view()).unwrap();
        assert_eq!(fx.rec.draw_count(), 0);
    }

    #[test]
    fn particle_count_follows_the_property() {
        let mut fx = Fixture::new(&[9, 10, 11]);
        let mut layer = layer(&fx);
        fx.settle(10.0);
        layer
            .set_property("num-particles", &PropertyValue::Number(5.0))
            .unwrap();
        fx.rec.clear_calls();
        // Clear of the antimeridian, so a single world copy.
        let view = MapView {
            bounds: GeoBounds::new(-10.0, -10.0, 10.0, 10.0),
            ..world_view()
        };
        layer.render(&view).unwrap();
        assert_eq!(point_draws(&fx), vec![8]);
    }

    #[test]
    fn context_restore_rebuilds_on_the_new_context() {
        let fx = Fixture::new(&[]);
        let mut layer = layer(&fx);

        layer.on_context_lost();
        assert!(!layer.is_initialized());
        assert!(!layer.particles().unwrap().has_context());
        assert!(fx.source.gl().is_none());

        let rec = Rc::new(RecordingContext::new());
        let gl: Gl = rec.clone();
        layer.on_context_restored(&gl).unwrap();
        assert!(layer.is_initialized());
        assert!(layer.particles().unwrap().has_context());
        assert!(fx.source.gl().is_some_and(|g| gpu::same_context(Some(&g), Some(&gl))));
    }

    #[test]
    fn points_shrink_with_the_texel_footprint() {
        let fx = Fixture::new(&[]);
        let mut geo = fx.source.geometry().unwrap();
        geo.texture_size = [4, 2];
        geo.tex_to_merc = translate_scale(0.0, 1.0, 1.0, -1.0);

        assert_eq!(point_size(&world_view(), &geo), 4.0);
        let small = MapView {
            canvas_size: [16, 16],
            ..world_view()
        };
        assert_eq!(point_size(&small, &geo), 1.0);
    }
}

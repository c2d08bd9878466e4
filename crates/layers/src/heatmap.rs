//! Dispersion heatmap drawn as a textured quad over its bounds.

use std::collections::BTreeMap;
use std::rc::Rc;

use compute::{Heatmap, HeatmapConfig, HeatmapSettings, PointSource, SourceFeed};
use foundation::math::affine::to_uniform;
use foundation::time::SECONDS_PER_HOUR;
use glam::{DMat4, DVec3};
use gpu::textures::{UNIT_QUAD, bind_texture, create_quad_buffer};
use gpu::{Buffer, DrawMode, Gl, GpuProgram, TextureFilter, TextureWrap};
use runtime::{Frame, fixed_steps};
use serde::{Deserialize, Serialize};
use streaming::TimeSource;
use tracing::{debug, trace, warn};

use crate::error::LayerError;
use crate::layer::{LayerBase, LayerId, MapView, TimeLayer, world_copies};
use crate::shaders::{HEATMAP_DRAW_FRAGMENT, HEATMAP_DRAW_VERTEX};
use crate::symbology::{PropertyTable, PropertyValue};

const OUTPUT_TEX_UNIT: u32 = 0;

/// How the field is stepped and shown; none of it touches the simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeatmapDisplay {
    pub max_steps_per_frame: u32,
    pub output_multiplier: f64,
    /// Linear filtering when drawing; nearest shows the raw grid cells.
    pub output_filter: bool,
    /// 0 draws opaque, 1 takes alpha from the first channel.
    pub output_alpha_mode: f64,
}

impl Default for HeatmapDisplay {
    fn default() -> Self {
        Self {
            max_steps_per_frame: 100,
            output_multiplier: 1.0,
            output_filter: true,
            output_alpha_mode: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeatmapLayerOptions {
    pub config: HeatmapConfig,
    pub settings: HeatmapSettings,
    pub display: HeatmapDisplay,
    pub properties: BTreeMap<String, PropertyValue>,
}

struct DrawPass {
    program: GpuProgram,
    quad: Buffer,
}

pub struct HeatmapLayer {
    base: LayerBase,
    properties: Rc<PropertyTable<HeatmapLayer>>,
    config: HeatmapConfig,
    settings: HeatmapSettings,
    display: HeatmapDisplay,
    feed: Rc<dyn SourceFeed>,
    heatmap: Option<Heatmap>,
    draw: Option<DrawPass>,
    visible: bool,
    target_time: Option<f64>,
}

fn property_table() -> PropertyTable<HeatmapLayer> {
    PropertyTable::<HeatmapLayer>::new()
        .with("visible", |l, v| {
            l.visible = v.as_bool("visible")?;
            Ok(())
        })
        .with("simulation-target-time", |l, v| {
            l.set_target_time(v.as_f64("simulation-target-time")?);
            Ok(())
        })
        .with("max-steps-per-frame", |l, v| {
            l.display.max_steps_per_frame = v.as_u32("max-steps-per-frame")?;
            Ok(())
        })
        .with("output-multiplier", |l, v| {
            l.display.output_multiplier = v.as_f64("output-multiplier")?;
            Ok(())
        })
        .with("output-filter", |l, v| {
            l.display.output_filter = v.as_bool("output-filter")?;
            Ok(())
        })
        .with("output-alpha-mode", |l, v| {
            l.display.output_alpha_mode = v.as_f64("output-alpha-mode")?.clamp(0.0, 1.0);
            Ok(())
        })
        .with("source-radius", |l, v| {
            let mut settings = l.settings.clone();
            settings.source_radius = v.as_f64("source-radius")?;
            l.set_settings(settings);
            Ok(())
        })
        .with("source-fade", |l, v| {
            let mut settings = l.settings.clone();
            settings.source_fade = v.as_f64("source-fade")?;
            l.set_settings(settings);
            Ok(())
        })
        .with("drop-off", |l, v| {
            let mut settings = l.settings.clone();
            settings.drop_off = v.as_f64("drop-off")?.clamp(0.0, 1.0);
            l.set_settings(settings);
            Ok(())
        })
}

impl HeatmapLayer {
    pub fn new(
        id: LayerId,
        source: TimeSource,
        options: HeatmapLayerOptions,
        feed: impl SourceFeed + 'static,
    ) -> Result<Self, LayerError> {
        let mut layer = Self {
            base: LayerBase::new(id, source),
            properties: Rc::new(property_table()),
            config: options.config,
            settings: options.settings,
            display: options.display,
            feed: Rc::new(feed),
            heatmap: None,
            draw: None,
            visible: true,
            target_time: None,
        };
        for (name, value) in &options.properties {
            layer.set_property(name, value)?;
        }
        Ok(layer)
    }

    pub fn heatmap(&self) -> Option<&Heatmap> {
        self.heatmap.as_ref()
    }

    pub fn is_initialized(&self) -> bool {
        self.draw.is_some()
    }

    pub fn config(&self) -> &HeatmapConfig {
        &self.config
    }

    pub fn settings(&self) -> &HeatmapSettings {
        &self.settings
    }

    pub fn display(&self) -> &HeatmapDisplay {
        &self.display
    }

    pub fn target_time(&self) -> Option<f64> {
        self.target_time
    }

    pub fn set_target_time(&mut self, hours: f64) {
        self.target_time = Some(hours);
        self.base.repaint().request();
    }

    /// Replaces the grid, blur and source limits. The field starts over.
    pub fn set_config(&mut self, config: HeatmapConfig) -> Result<(), LayerError> {
        if config == self.config {
            return Ok(());
        }
        self.config = config;
        self.heatmap = None;
        self.base.repaint().request();
        self.build()
    }

    pub fn set_settings(&mut self, settings: HeatmapSettings) {
        if let Some(h) = self.heatmap.as_mut() {
            *h.settings_mut() = settings.clone();
        }
        self.settings = settings;
        self.base.repaint().request();
    }

    pub fn set_display(&mut self, display: HeatmapDisplay) {
        self.display = display;
        self.base.repaint().request();
    }

    /// Zeroes the field.
    pub fn clear(&mut self) -> Result<(), LayerError> {
        if let Some(h) = self.heatmap.as_mut() {
            h.reset()?;
        }
        self.base.repaint().request();
        Ok(())
    }

    fn build(&mut self) -> Result<(), LayerError> {
        let Some(gl) = self.base.gl().cloned() else {
            return Ok(());
        };
        if !self.base.source().is_loaded() {
            return Ok(());
        }
        if self.heatmap.is_none() {
            let feed = self.feed.clone();
            self.heatmap = Some(Heatmap::from_source(
                self.base.source().clone(),
                self.config.clone(),
                self.settings.clone(),
                move |timestamp_ms: f64| -> Vec<PointSource> { feed.sources(timestamp_ms) },
            )?);
        }
        let Some(heatmap) = self.heatmap.as_mut() else {
            return Ok(());
        };
        if !heatmap.has_context() {
            heatmap.set_context(Some(&gl))?;
        }
        if self.draw.is_none() {
            let g = gl.as_ref();
            let program =
                GpuProgram::compile(g, "heatmap-draw", HEATMAP_DRAW_VERTEX, HEATMAP_DRAW_FRAGMENT)?;
            let quad = match create_quad_buffer(g) {
                Ok(quad) => quad,
                Err(e) => {
                    program.delete(g);
                    return Err(e.into());
                }
            };
            self.draw = Some(DrawPass { program, quad });
            debug!(layer = %self.base.id().0, grid = ?heatmap.size(), "heatmap layer ready");
        }
        Ok(())
    }

    fn step(&mut self) -> Result<(), LayerError> {
        let (Some(heatmap), Some(target)) = (self.heatmap.as_mut(), self.target_time) else {
            return Ok(());
        };
        let Some(time) = self.base.source().time() else {
            return Ok(());
        };
        let gap = (target - time) * SECONDS_PER_HOUR;
        let Some(plan) = fixed_steps(gap, self.config.time_step, self.display.max_steps_per_frame)
        else {
            return Ok(());
        };
        let covered = heatmap.update(plan.time_step_s, plan.steps)?;
        trace!(gap, covered, steps = plan.steps, "heatmap stepped");
        if covered != 0.0 {
            self.base.repaint().request();
        }
        Ok(())
    }

    fn draw_field(&self, gl: &Gl, view: &MapView) {
        let (Some(pass), Some(heatmap)) = (self.draw.as_ref(), self.heatmap.as_ref()) else {
            return;
        };
        let Some(texture) = heatmap.output_texture() else {
            return;
        };
        let g = gl.as_ref();
        let program = &pass.program;
        gl.use_program(program.handle());

        let a_pos = program.attribute("a_pos");
        if let Some(loc) = a_pos {
            gl.bind_attribute(pass.quad, loc, 2);
        }
        program.set_f32(g, "u_output_mult", self.display.output_multiplier as f32);
        program.set_f32(g, "u_output_alpha", self.display.output_alpha_mode as f32);
        program.set_i32(g, "u_tex", OUTPUT_TEX_UNIT as i32);
        bind_texture(g, texture, OUTPUT_TEX_UNIT);
        let nearest = !self.display.output_filter;
        if nearest {
            gl.tex_parameters(TextureFilter::Nearest, TextureWrap::ClampToEdge, TextureWrap::ClampToEdge);
        }

        let b = &view.bounds;
        let tex_to_merc = heatmap.tex_to_merc();
        for i in world_copies(b.west, b.east, &self.config.bounds) {
            let wrap = DMat4::from_translation(DVec3::new(f64::from(i), 0.0, 0.0));
            let m = view.matrix * wrap * tex_to_merc;
            program.set_mat4(g, "u_transform", &to_uniform(&m));
            gl.draw_arrays(DrawMode::Triangles, 0, (UNIT_QUAD.len() / 2) as i32);
        }

        if nearest {
            gl.tex_parameters(TextureFilter::Linear, TextureWrap::ClampToEdge, TextureWrap::ClampToEdge);
        }
        if let Some(loc) = a_pos {
            gl.disable_attribute(loc);
        }
    }
}

impl TimeLayer for HeatmapLayer {
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
        if let Some(h) = self.heatmap.as_mut() {
            if let Err(e) = h.set_context(None) {
                warn!(layer = %self.base.id().0, error = %e, "releasing heatmap failed");
            }
        }
        if let (Some(pass), Some(gl)) = (self.draw.take(), self.base.gl()) {
            gl.delete_buffer(pass.quad);
            pass.program.delete(gl.as_ref());
        }
        self.base.detach();
    }

    fn prerender(&mut self, frame: &Frame) -> Result<(), LayerError> {
        if !self.base.is_attached() {
            return Ok(());
        }
        self.build()?;
        trace!(frame = frame.index, "heatmap prerender");
        self.step()
    }

    fn render(&mut self, view: &MapView) -> Result<(), LayerError> {
        if !self.visible {
            return Ok(());
        }
        let Some(gl) = self.base.gl().cloned() else {
            return Ok(());
        };
        self.draw_field(&gl, view);
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
    use super::{HeatmapDisplay, HeatmapLayer, HeatmapLayerOptions};
    use crate::error::LayerError;
    use crate::layer::{MapView, TimeLayer};
    use crate::symbology::PropertyValue;
    use crate::test_support::{Fixture, world_view};
    use compute::{HeatmapConfig, HeatmapSettings, PointSource};
    use foundation::bounds::GeoBounds;
    use gpu::recording::{Call, UniformValue};
    use gpu::{DrawMode, TextureFilter};
    use pretty_assertions::assert_eq;
    use runtime::{Frame, names};

    fn options() -> HeatmapLayerOptions {
        HeatmapLayerOptions {
            config: HeatmapConfig {
                bounds: GeoBounds::new(0.0, 0.0, 1.0, 1.0),
                max_sources: 8,
                ..HeatmapConfig::default()
            },
            settings: HeatmapSettings {
                drop_off: 0.01,
                ..HeatmapSettings::default()
            },
            ..HeatmapLayerOptions::default()
        }
    }

    fn one_source(_: f64) -> Vec<PointSource> {
        vec![PointSource {
            coordinate: [0.5, 0.5],
            data: [1.0, 0.0, 0.0, 0.0],
        }]
    }

    fn layer(fx: &Fixture) -> HeatmapLayer {
        let mut layer =
            HeatmapLayer::new("plume".into(), fx.source.clone(), options(), one_source).unwrap();
        layer.initialize(&fx.gl).unwrap();
        layer
    }

    fn draws(fx: &Fixture, mode: DrawMode) -> usize {
        fx.rec
            .count(|c| matches!(c, Call::Draw { mode: m, .. } if *m == mode))
    }

    #[test]
    fn initialize_builds_the_field_and_draw_pass() {
        let fx = Fixture::new(&[]);
        let mut layer = layer(&fx);
        assert!(layer.is_initialized());
        assert_eq!(layer.heatmap().unwrap().size(), [12, 12]);

        let programs = fx.rec.live_programs();
        layer.initialize(&fx.gl).unwrap();
        assert_eq!(fx.rec.live_programs(), programs);
    }

    #[test]
    fn prerender_takes_whole_steps_toward_the_target() {
        let mut fx = Fixture::new(&[9, 10, 11]);
        let mut layer = layer(&fx);
        fx.settle(10.0);

        layer.prerender(&Frame::first()).unwrap();
        assert_eq!(layer.heatmap().unwrap().metrics().counter(names::SIMULATION_STEPS), 0);

        layer
            .set_property("simulation-target-time", &PropertyValue::Number(10.06))
            .unwrap();
        layer.take_repaint();
        fx.rec.clear_calls();
        layer.prerender(&Frame::first()).unwrap();

        // 216 s at 60 s per step; the last 36 s wait for a later frame.
        let heatmap = layer.heatmap().unwrap();
        assert_eq!(heatmap.metrics().counter(names::SIMULATION_STEPS), 3);
        assert!((fx.source.time().unwrap() - 10.05).abs() < 1e-9);
        assert_eq!(draws(&fx, DrawMode::Points), 3);
        assert!(layer.take_repaint());
    }

    #[test]
    fn steps_per_frame_are_capped() {
        let mut fx = Fixture::new(&[9, 10, 11]);
        let mut layer = layer(&fx);
        fx.settle(10.0);
        layer
            .set_property("max-steps-per-frame", &PropertyValue::Number(2.0))
            .unwrap();
        layer
            .set_property("simulation-target-time", &PropertyValue::Number(10.5))
            .unwrap();

        layer.prerender(&Frame::first()).unwrap();
        assert_eq!(
            layer.heatmap().unwrap().metrics().counter(names::SIMULATION_STEPS),
            2
        );
    }

    #[test]
    fn render_draws_one_quad_per_world_copy() {
        let mut fx = Fixture::new(&[9, 10, 11]);
        let mut layer = layer(&fx);
        fx.settle(10.0);
        fx.rec.clear_calls();

        let view = MapView {
            bounds: GeoBounds::new(-400.0, -60.0, 400.0, 60.0),
            ..world_view()
        };
        layer.render(&view).unwrap();

        assert_eq!(draws(&fx, DrawMode::Triangles), 3);
        let output = layer.heatmap().unwrap().output_texture();
        assert_eq!(fx.rec.bound_texture(0), output);
        assert_eq!(fx.rec.last_uniform("u_output_mult"), Some(UniformValue::Float(1.0)));
        assert_eq!(fx.rec.count(|c| matches!(c, Call::TexParameters { .. })), 0);
    }

    #[test]
    fn nearest_output_restores_linear_filtering() {
        let mut fx = Fixture::new(&[9, 10, 11]);
        let mut layer = layer(&fx);
        fx.settle(10.0);
        layer.set_display(HeatmapDisplay {
            output_filter: false,
            output_multiplier: 2.0,
            ..HeatmapDisplay::default()
        });
        fx.rec.clear_calls();
        layer.render(&world_view()).unwrap();

        let filters: Vec<TextureFilter> = fx
            .rec
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::TexParameters { filter, .. } => Some(filter),
                _ => None,
            })
            .collect();
        assert_eq!(filters, vec![TextureFilter::Nearest, TextureFilter::Linear]);
        assert_eq!(fx.rec.last_uniform("u_output_mult"), Some(UniformValue::Float(2.0)));
    }

    #[test]
    fn settings_reach_the_running_simulation() {
        let fx = Fixture::new(&[]);
        let mut layer = layer(&fx);
        layer
            .set_property("source-radius", &PropertyValue::Number(30_000.0))
            .unwrap();
        assert_eq!(layer.settings().source_radius, 30_000.0);
        assert_eq!(
            layer.heatmap().unwrap().kernel().settings().source_radius,
            30_000.0
        );
        assert!(matches!(
            layer.set_property("source-radius", &PropertyValue::Bool(true)),
            Err(LayerError::InvalidValue { .. })
        ));
    }

    #[test]
    fn new_config_rebuilds_the_grid() {
        let fx = Fixture::new(&[]);
        let mut layer = layer(&fx);
        let config = HeatmapConfig {
            bounds: GeoBounds::new(0.0, 60.0, 1.0, 61.0),
            ..layer.config().clone()
        };
        layer.set_config(config).unwrap();
        assert_eq!(layer.heatmap().unwrap().size()[0], 6);
        assert!(layer.heatmap().unwrap().has_context());
    }

    #[test]
    fn invalid_config_is_reported_on_initialize() {
        let fx = Fixture::new(&[]);
        let mut opts = options();
        opts.config.num_data_types = 5;
        let mut layer = HeatmapLayer::new("plume".into(), fx.source.clone(), opts, one_source).unwrap();
        assert!(layer.initialize(&fx.gl).is_err());
        assert!(!layer.is_initialized());
    }

    #[test]
    fn context_loss_releases_everything() {
        let fx = Fixture::new(&[]);
        let mut layer = layer(&fx);
        layer.on_context_lost();
        assert!(!layer.is_initialized());
        assert!(!layer.heatmap().unwrap().has_context());
        assert!(fx.source.gl().is_none());

        layer.on_context_restored(&fx.gl).unwrap();
        assert!(layer.is_initialized());
        assert!(layer.heatmap().unwrap().has_context());
    }
}

//! Host binding between a JS map renderer and the wind layers.
//!
//! `Viewer` holds everything the binding needs and runs on any target; the
//! wasm exports in `host` only translate JS values.

use compute::PointSource;
use foundation::bounds::GeoBounds;
use glam::DMat4;
use gpu::Gl;
use layers::{LayerError, MapView, PropertyValue, TimeLayer};
use runtime::Frame;
use streaming::TimeSource;
use tracing::{debug, warn};

#[cfg(target_arch = "wasm32")]
mod host;

#[derive(Debug, PartialEq)]
pub enum ViewerError {
    Layer(LayerError),
    DuplicateLayer(String),
    UnknownLayer(String),
    /// A view matrix must have 16 column-major entries.
    BadMatrix(usize),
}

impl std::fmt::Display for ViewerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViewerError::Layer(e) => write!(f, "{e}"),
            ViewerError::DuplicateLayer(id) => write!(f, "layer {id:?} already exists"),
            ViewerError::UnknownLayer(id) => write!(f, "no layer {id:?}"),
            ViewerError::BadMatrix(n) => write!(f, "view matrix has {n} entries, expected 16"),
        }
    }
}

impl std::error::Error for ViewerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ViewerError::Layer(e) => Some(e),
            _ => None,
        }
    }
}

impl From<LayerError> for ViewerError {
    fn from(e: LayerError) -> Self {
        ViewerError::Layer(e)
    }
}

/// Point sources packed by JS as `[lon, lat, d0, .., lon, lat, ..]`.
/// A trailing partial record is ignored.
pub fn sources_from_flat(values: &[f64], channels: usize) -> Vec<PointSource> {
    let channels = channels.min(4);
    values
        .chunks_exact(2 + channels)
        .map(|rec| {
            let mut data = [0.0; 4];
            for (d, v) in data.iter_mut().zip(&rec[2..]) {
                *d = *v as f32;
            }
            PointSource {
                coordinate: [rec[0], rec[1]],
                data,
            }
        })
        .collect()
}

pub fn map_view(
    matrix: &[f64],
    [west, south, east, north]: [f64; 4],
    canvas_size: [u32; 2],
) -> Result<MapView, ViewerError> {
    if matrix.len() != 16 {
        return Err(ViewerError::BadMatrix(matrix.len()));
    }
    Ok(MapView {
        matrix: DMat4::from_cols_slice(matrix),
        bounds: GeoBounds::new(west, south, east, north),
        canvas_size,
    })
}

/// One source and the layers drawn from it, in draw order.
pub struct Viewer {
    source: TimeSource,
    layers: Vec<Box<dyn TimeLayer>>,
    gl: Option<Gl>,
    frame: Option<Frame>,
    last_frame_ms: Option<f64>,
}

impl Viewer {
    pub fn new(source: TimeSource) -> Self {
        Self {
            source,
            layers: Vec::new(),
            gl: None,
            frame: None,
            last_frame_ms: None,
        }
    }

    pub fn source(&self) -> &TimeSource {
        &self.source
    }

    pub fn frame(&self) -> Option<Frame> {
        self.frame
    }

    pub fn layer_ids(&self) -> Vec<String> {
        self.layers.iter().map(|l| l.id().0.clone()).collect()
    }

    pub fn add_layer(&mut self, mut layer: Box<dyn TimeLayer>) -> Result<(), ViewerError> {
        let id = layer.id().clone();
        if self.layers.iter().any(|l| *l.id() == id) {
            return Err(ViewerError::DuplicateLayer(id.0));
        }
        if let Some(gl) = &self.gl {
            layer.initialize(gl)?;
        }
        debug!(layer = %id.0, "layer added");
        self.layers.push(layer);
        Ok(())
    }

    pub fn remove_layer(&mut self, id: &str) -> Result<(), ViewerError> {
        let at = self.position(id)?;
        let mut layer = self.layers.remove(at);
        layer.uninitialize();
        Ok(())
    }

    pub fn set_property(
        &mut self,
        id: &str,
        name: &str,
        value: &PropertyValue,
    ) -> Result<(), ViewerError> {
        let at = self.position(id)?;
        self.layers[at].set_property(name, value)?;
        Ok(())
    }

    /// Attaches every layer to `gl`. Layers that fail stay in the list
    /// and are retried on the next attach.
    pub fn attach(&mut self, gl: &Gl) -> Result<(), ViewerError> {
        self.gl = Some(gl.clone());
        let mut first_error = None;
        for layer in &mut self.layers {
            if let Err(e) = layer.initialize(gl) {
                warn!(layer = %layer.id().0, error = %e, "layer failed to initialize");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), |e| Err(e.into()))
    }

    /// Advances the frame clock and steps every layer. Returns whether
    /// any layer wants another frame.
    pub fn prerender(&mut self, now_ms: f64) -> Result<bool, ViewerError> {
        let frame = match (self.frame, self.last_frame_ms) {
            (Some(f), Some(last)) => f.next((now_ms - last) / 1000.0),
            _ => Frame::first(),
        };
        self.frame = Some(frame);
        self.last_frame_ms = Some(now_ms);

        for layer in &mut self.layers {
            layer.prerender(&frame)?;
        }
        Ok(self.layers.iter().fold(false, |any, l| l.take_repaint() || any))
    }

    pub fn render(&mut self, view: &MapView) -> Result<(), ViewerError> {
        for layer in &mut self.layers {
            layer.render(view)?;
        }
        Ok(())
    }

    pub fn time_changed(&mut self) {
        for layer in &mut self.layers {
            layer.on_time_changed();
        }
    }

    pub fn context_lost(&mut self) {
        for layer in &mut self.layers {
            layer.on_context_lost();
        }
        self.gl = None;
    }

    pub fn context_restored(&mut self, gl: &Gl) -> Result<(), ViewerError> {
        self.gl = Some(gl.clone());
        for layer in &mut self.layers {
            layer.on_context_restored(gl)?;
        }
        Ok(())
    }

    fn position(&self, id: &str) -> Result<usize, ViewerError> {
        self.layers
            .iter()
            .position(|l| l.id().0 == id)
            .ok_or_else(|| ViewerError::UnknownLayer(id.to_string()))
    }
}

impl Drop for Viewer {
    fn drop(&mut self) {
        for layer in &mut self.layers {
            layer.uninitialize();
        }
    }
}

use std::cell::Cell;
use std::ops::RangeInclusive;
use std::rc::Rc;

use foundation::bounds::GeoBounds;
use glam::DMat4;
use gpu::{Gl, same_context};
use runtime::{Frame, ListenerId};
use streaming::{TimeEvent, TimeSource};
use tracing::debug;

use crate::error::LayerError;
use crate::symbology::PropertyValue;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(pub String);

impl From<&str> for LayerId {
    fn from(s: &str) -> Self {
        LayerId(s.to_string())
    }
}

/// What the host map shows in the frame being drawn.
#[derive(Debug, Clone, PartialEq)]
pub struct MapView {
    /// Normalized Web Mercator to clip space.
    pub matrix: DMat4,
    /// Visible area in degrees; longitudes may run past ±180.
    pub bounds: GeoBounds,
    pub canvas_size: [u32; 2],
}

/// Lifecycle hooks a host map calls on a time-driven layer.
pub trait TimeLayer {
    fn id(&self) -> &LayerId;

    /// Builds GPU resources on `gl`. Calling it again with the same
    /// context is a no-op.
    fn initialize(&mut self, gl: &Gl) -> Result<(), LayerError>;

    fn uninitialize(&mut self);

    /// Runs before the host draws its own layers; simulations step here.
    fn prerender(&mut self, frame: &Frame) -> Result<(), LayerError>;

    fn render(&mut self, view: &MapView) -> Result<(), LayerError>;

    fn set_property(&mut self, name: &str, value: &PropertyValue) -> Result<(), LayerError>;

    /// True once since the layer last asked the host for another frame.
    fn take_repaint(&self) -> bool;

    fn on_time_changed(&mut self) {}

    /// Everything on the lost context is gone; drop our handles to it.
    fn on_context_lost(&mut self) {
        self.uninitialize();
    }

    fn on_context_restored(&mut self, gl: &Gl) -> Result<(), LayerError> {
        self.initialize(gl)
    }
}

/// Repaint request shared between a layer and its source listener.
#[derive(Debug, Clone, Default)]
pub struct Repaint(Rc<Cell<bool>>);

impl Repaint {
    pub fn request(&self) {
        self.0.set(true);
    }

    pub fn take(&self) -> bool {
        self.0.replace(false)
    }

    pub fn is_requested(&self) -> bool {
        self.0.get()
    }
}

/// The bookkeeping every time layer shares: its source, the context it is
/// attached to and the listener that turns source updates into repaints.
pub struct LayerBase {
    id: LayerId,
    source: TimeSource,
    gl: Option<Gl>,
    repaint: Repaint,
    listener: Option<ListenerId>,
}

impl LayerBase {
    pub fn new(id: LayerId, source: TimeSource) -> Self {
        Self {
            id,
            source,
            gl: None,
            repaint: Repaint::default(),
            listener: None,
        }
    }

    pub fn id(&self) -> &LayerId {
        &self.id
    }

    pub fn source(&self) -> &TimeSource {
        &self.source
    }

    pub fn gl(&self) -> Option<&Gl> {
        self.gl.as_ref()
    }

    pub fn is_attached(&self) -> bool {
        self.gl.is_some()
    }

    pub fn repaint(&self) -> &Repaint {
        &self.repaint
    }

    /// Returns false when already attached to `gl`.
    pub fn attach(&mut self, gl: &Gl) -> Result<bool, LayerError> {
        if same_context(self.gl.as_ref(), Some(gl)) {
            return Ok(false);
        }
        self.detach();
        self.source.set_context(Some(gl))?;
        let repaint = self.repaint.clone();
        self.listener = Some(self.source.subscribe(move |e| {
            if matches!(e, TimeEvent::Ready { .. } | TimeEvent::Loaded) {
                repaint.request();
            }
        }));
        self.gl = Some(gl.clone());
        self.repaint.request();
        debug!(layer = %self.id.0, "layer attached");
        Ok(true)
    }

    pub fn detach(&mut self) {
        if let Some(id) = self.listener.take() {
            self.source.unsubscribe(id);
        }
        if self.gl.take().is_some() {
            debug!(layer = %self.id.0, "layer detached");
        }
    }

    /// Detaches and also takes the source off the context, which is gone.
    pub fn context_lost(&mut self) {
        self.detach();
        if let Err(e) = self.source.set_context(None) {
            debug!(layer = %self.id.0, error = %e, "source release failed");
        }
    }
}

impl Drop for LayerBase {
    fn drop(&mut self) {
        if let Some(id) = self.listener.take() {
            self.source.unsubscribe(id);
        }
    }
}

/// World copies of `data` that intersect the visible longitudes
/// `west..=east`, as multiples of 360°.
pub fn world_copies(west: f64, east: f64, data: &GeoBounds) -> RangeInclusive<i32> {
    let first = ((west - data.east) / 360.0).ceil() as i32;
    let last = ((east - data.west) / 360.0).floor() as i32;
    first..=last
}

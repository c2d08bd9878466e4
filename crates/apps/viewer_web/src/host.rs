//! wasm-bindgen exports. The JS side owns the map and calls these from its
//! custom-layer hooks.

use std::cell::RefCell;
use std::rc::Rc;

use console_error_panic_hook::set_once;
use futures::task::{LocalFutureObj, LocalSpawn, SpawnError};
use gpu::Gl;
use gpu::webgl::WebGlContext;
use js_sys::{Float64Array, Function};
use layers::{HeatmapLayer, HeatmapLayerOptions, ParticleLayer, ParticleLayerOptions, PropertyValue};
use streaming::{HttpLoader, RenderResponse, TimeSource, TimeSourceConfig};
use tracing::warn;
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::spawn_local;
use web_sys::WebGlRenderingContext;

use compute::{PointSource, SourceFeed};

use crate::{Viewer, ViewerError, map_view, sources_from_flat};

thread_local! {
    static VIEWER: RefCell<Option<Viewer>> = const { RefCell::new(None) };
}

/// Runs source futures on the browser's microtask queue.
struct WasmSpawner;

impl LocalSpawn for WasmSpawner {
    fn spawn_local_obj(&self, future: LocalFutureObj<'static, ()>) -> Result<(), SpawnError> {
        spawn_local(future);
        Ok(())
    }
}

/// Point sources supplied by a JS callback returning a flat `Float64Array`.
struct JsFeed {
    callback: Function,
    channels: usize,
}

impl SourceFeed for JsFeed {
    fn sources(&self, timestamp_ms: f64) -> Vec<PointSource> {
        match self.callback.call1(&JsValue::NULL, &JsValue::from_f64(timestamp_ms)) {
            Ok(v) => sources_from_flat(&Float64Array::new(&v).to_vec(), self.channels),
            Err(e) => {
                warn!(error = ?e, "source callback threw");
                Vec::new()
            }
        }
    }
}

fn js_error(e: impl std::fmt::Display) -> JsValue {
    JsValue::from_str(&e.to_string())
}

fn with_viewer<R>(f: impl FnOnce(&mut Viewer) -> Result<R, ViewerError>) -> Result<R, JsValue> {
    VIEWER.with(|v| match v.borrow_mut().as_mut() {
        Some(viewer) => f(viewer).map_err(js_error),
        None => Err(JsValue::from_str("create_source has not been called")),
    })
}

fn webgl(gl: WebGlRenderingContext) -> Gl {
    Rc::new(WebGlContext::new(gl))
}

#[wasm_bindgen(start)]
pub fn start() {
    set_once();
}

/// Replaces the current source and its layers. `config` is a partial
/// `TimeSourceConfig` as JSON.
#[wasm_bindgen]
pub fn create_source(config: &str) -> Result<(), JsValue> {
    let config: TimeSourceConfig = serde_json::from_str(config).map_err(js_error)?;
    let loader = Rc::new(HttpLoader::new(&config));
    let source = TimeSource::new(config, loader, Rc::new(WasmSpawner));
    VIEWER.with(|v| *v.borrow_mut() = Some(Viewer::new(source.clone())));

    spawn_local(async move {
        if let Err(e) = source.load(None).await {
            web_sys::console::warn_1(&js_error(format!("wind metadata failed: {e}")));
        }
    });
    Ok(())
}

#[wasm_bindgen]
pub fn attach(gl: WebGlRenderingContext) -> Result<(), JsValue> {
    let gl = webgl(gl);
    with_viewer(|v| v.attach(&gl))
}

#[wasm_bindgen]
pub fn add_particle_layer(id: &str, options: &str) -> Result<(), JsValue> {
    let options: ParticleLayerOptions = serde_json::from_str(options).map_err(js_error)?;
    with_viewer(|v| {
        let layer = ParticleLayer::new(id.into(), v.source().clone(), options)?;
        v.add_layer(Box::new(layer))
    })
}

/// `sources(timestampMs)` must return `[lon, lat, d0 .. dN, ...]` with
/// `num_data_types` data values per source.
#[wasm_bindgen]
pub fn add_heatmap_layer(id: &str, options: &str, sources: Function) -> Result<(), JsValue> {
    let options: HeatmapLayerOptions = serde_json::from_str(options).map_err(js_error)?;
    let feed = JsFeed {
        callback: sources,
        channels: options.config.num_data_types as usize,
    };
    with_viewer(|v| {
        let layer = HeatmapLayer::new(id.into(), v.source().clone(), options, feed)?;
        v.add_layer(Box::new(layer))
    })
}

#[wasm_bindgen]
pub fn remove_layer(id: &str) -> Result<(), JsValue> {
    with_viewer(|v| v.remove_layer(id))
}

/// `value` is JSON: a boolean, number, RGBA array or color string.
#[wasm_bindgen]
pub fn set_property(id: &str, name: &str, value: &str) -> Result<(), JsValue> {
    let value: PropertyValue = serde_json::from_str(value).map_err(js_error)?;
    with_viewer(|v| v.set_property(id, name, &value))
}

/// Moves the source to `hours` since the epoch. The promise-free call
/// returns at once; layers repaint when the data is ready.
#[wasm_bindgen]
pub fn set_time(hours: f64) -> Result<(), JsValue> {
    let pending = with_viewer(|v| {
        v.time_changed();
        Ok(v.source().set_time(hours))
    })?;
    spawn_local(async move {
        if pending.await == RenderResponse::Failed {
            web_sys::console::warn_1(&js_error(format!("no wind data around {hours}")));
        }
    });
    Ok(())
}

/// Clears failed snapshots so they are fetched again. Returns how many.
#[wasm_bindgen]
pub fn retry_failed() -> Result<usize, JsValue> {
    with_viewer(|v| Ok(v.source().retry_failed()))
}

/// Returns true when the map should schedule another frame.
#[wasm_bindgen]
pub fn prerender(now_ms: f64) -> Result<bool, JsValue> {
    with_viewer(|v| v.prerender(now_ms))
}

/// `matrix` maps normalized Web Mercator to clip space, column-major.
#[wasm_bindgen]
pub fn render(
    matrix: Vec<f64>,
    west: f64,
    south: f64,
    east: f64,
    north: f64,
    width: u32,
    height: u32,
) -> Result<(), JsValue> {
    with_viewer(|v| {
        let view = map_view(&matrix, [west, south, east, north], [width, height])?;
        v.render(&view)
    })
}

#[wasm_bindgen]
pub fn context_lost() -> Result<(), JsValue> {
    with_viewer(|v| {
        v.context_lost();
        Ok(())
    })
}

#[wasm_bindgen]
pub fn context_restored(gl: WebGlRenderingContext) -> Result<(), JsValue> {
    let gl = webgl(gl);
    with_viewer(|v| v.context_restored(&gl))
}

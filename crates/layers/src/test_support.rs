//! A loaded `TimeSource` on a recording context for the layer tests.

use std::rc::Rc;

use bytes::Bytes;
use formats::UvImage;
use foundation::bounds::GeoBounds;
use foundation::time::TimeKey;
use futures::executor::LocalPool;
use glam::DMat4;
use gpu::{Gl, RecordingContext};
use streaming::{MemoryLoader, RenderResponse, Request, TimeSource, TimeSourceConfig};

use crate::layer::MapView;

pub(crate) const META: &str = r#"{"date":"2024-03-01T00:00:00.000Z","width":4,"height":2,"uvMax":20,"bounds":[-180,-85,180,85]}"#;

pub(crate) fn png(u: f32, v: f32) -> Bytes {
    UvImage::from_fn(4, 2, |_, _| [u, v])
        .encode_png()
        .unwrap()
        .into()
}

/// The whole world on a 512 px canvas.
pub(crate) fn world_view() -> MapView {
    MapView {
        matrix: DMat4::IDENTITY,
        bounds: GeoBounds::new(-180.0, -80.0, 180.0, 80.0),
        canvas_size: [512, 512],
    }
}

pub(crate) struct Fixture {
    pub pool: LocalPool,
    pub rec: Rc<RecordingContext>,
    pub gl: Gl,
    pub source: TimeSource,
}

impl Fixture {
    pub fn new(keys: &[TimeKey]) -> Self {
        let mut pool = LocalPool::new();
        let loader = Rc::new(MemoryLoader::new());
        loader.insert(Request::Meta(0), META);
        for k in keys {
            loader.insert(Request::Snapshot(*k), png(5.0, -5.0));
        }
        let rec = Rc::new(RecordingContext::new());
        let gl: Gl = rec.clone();
        let source = TimeSource::new(
            TimeSourceConfig::new("memory", "test"),
            loader.clone(),
            Rc::new(pool.spawner()),
        );
        pool.run_until(source.load(Some(0.0))).unwrap();
        Self {
            pool,
            rec,
            gl,
            source,
        }
    }

    /// Moves the source to `time` and drains every pending task.
    pub fn settle(&mut self, time: f64) -> RenderResponse {
        let fut = self.source.set_time(time);
        let response = self.pool.run_until(fut);
        self.pool.run_until_stalled();
        response
    }
}

use foundation::time::TimeKey;

/// What a loader is asked to fetch. Small and `Copy` so it can key caches
/// and travel into futures without allocation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Request {
    /// Grid metadata for the run covering this hour.
    Meta(TimeKey),
    /// The u/v snapshot image for this hour.
    Snapshot(TimeKey),
}

impl Request {
    pub fn key(self) -> TimeKey {
        match self {
            Request::Meta(k) | Request::Snapshot(k) => k,
        }
    }
}

pub mod cache;
pub mod config;
pub mod error;
pub mod loader;
pub mod protocol;
pub mod request;
pub mod residency;
pub mod time_source;

pub use cache::*;
pub use config::*;
pub use error::*;
pub use loader::*;
pub use request::*;
pub use residency::*;
pub use time_source::*;

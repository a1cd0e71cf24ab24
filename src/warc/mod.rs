//! WARC 1.1 data model and codec (§3, §4.B).

pub mod digest;
pub mod headers;
pub mod reader;
pub mod record;

pub use headers::WarcHeaders;
pub use record::{Record, WarcVersion};

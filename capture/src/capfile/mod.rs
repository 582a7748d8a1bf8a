//! The versioned on-disk capture format.

mod format;
mod reader;
mod writer;

pub use format::{Version, CURRENT};
pub use reader::load_capture;
pub use writer::write_capture;

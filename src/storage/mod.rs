//! File-writer sink (component K).

pub mod plugin;
pub mod writer;

pub use plugin::FileFormatPlugin;
pub use writer::{FileWriterSink, ScanStorage};

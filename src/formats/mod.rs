//! File formats, value conversion, and SQL literal rendering

pub mod conversion;
pub mod reader;
pub mod value;

pub use conversion::Conversion;
pub use reader::{DelimitedConfig, Format, Frame, TypedFrame, encoding_for_label};

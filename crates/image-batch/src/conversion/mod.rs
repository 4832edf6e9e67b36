//! Conversion workers: one source file in, one output file out

mod converter;
mod image_converter;

pub use converter::{output_path_for, ConversionError, Converter};
pub use image_converter::ImageConverter;

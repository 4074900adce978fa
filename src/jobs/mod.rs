//! Background jobs that reuse the batch runner outside of publishing.

pub mod generate;
pub mod watermark;

pub use generate::{ContentGenerator, GenerationJob};
pub use watermark::{WatermarkJob, Watermarker};

//! Turn a video walkthrough of an app idea into a structured Markdown
//! specification.
//!
//! [`sampler::FrameSampler`] pulls a bounded set of JPEG stills out of a
//! video, [`analysis::Analyzer`] sends them (or a video URL) to a generative
//! model with a fixed six-section template, and [`pipeline::process_video`]
//! ties the two together.

pub mod ai;
pub mod analysis;
pub mod capture;
pub mod config;
pub mod error;
pub mod gemini;
pub mod pipeline;
pub mod recorder;
pub mod sampler;
pub mod source;
pub mod template;

pub use analysis::{AnalysisRequest, AnalysisResult, Analyzer, Citation};
pub use capture::FfmpegBackend;
pub use config::{AnalyzerConfig, Provider, Settings};
pub use error::{AnalysisError, ConfigError, Error, RecorderError, Result, SampleError};
pub use pipeline::{process_video, Progress};
pub use recorder::{CaptureDevice, Recorder};
pub use sampler::{CancellationToken, Frame, FrameSampler, SampleIntervalPlan, SamplerOptions};
pub use source::VideoSource;

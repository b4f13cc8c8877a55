use std::fmt;

use tracing::warn;

use crate::analysis::{AnalysisResult, Analyzer};
use crate::error::{AnalysisError, Error, Result};
use crate::sampler::{CancellationToken, Frame, FrameSampler, MediaBackend};
use crate::source::VideoSource;

/// Where a video currently is on its way to a specification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Progress {
    /// Fraction of the timeline sampled so far.
    Sampling(f64),
    Analyzing { frames: usize },
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Progress::Sampling(fraction) => {
                write!(f, "Extracting frames... {}%", (fraction * 100.0).round() as u32)
            }
            Progress::Analyzing { frames } => write!(f, "Analyzing {frames} frames with AI..."),
        }
    }
}

/// Sample `source` and have the model describe the application it shows.
///
/// `cancel` stops sampling before the next seek and abandons an in-flight
/// analysis request.
pub async fn process_video<B, F>(
    sampler: &FrameSampler<B>,
    analyzer: &Analyzer,
    source: &VideoSource,
    mut on_progress: F,
    cancel: &CancellationToken,
) -> Result<AnalysisResult>
where
    B: MediaBackend,
    F: FnMut(Progress),
{
    let frames = sampler
        .sample(source, |fraction| on_progress(Progress::Sampling(fraction)), cancel)
        .await?;
    let frames = require_frames(frames)?;
    on_progress(Progress::Analyzing {
        frames: frames.len(),
    });
    tokio::select! {
        result = analyzer.analyze_frames(&frames) => Ok(result?),
        () = cancel.cancelled() => {
            warn!("analysis cancelled");
            Err(AnalysisError::Cancelled.into())
        }
    }
}

fn require_frames(frames: Vec<Frame>) -> Result<Vec<Frame>> {
    if frames.is_empty() {
        warn!("no frames could be extracted from the video");
        return Err(Error::NoFrames);
    }
    Ok(frames)
}

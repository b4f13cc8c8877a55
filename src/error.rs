use thiserror::Error;

/// Failures while pulling frames out of a video.
#[derive(Debug, Error)]
pub enum SampleError {
    #[error("could not load video metadata: {0}")]
    Load(String),

    #[error("failed to decode frame at {position:.2}s: {reason}")]
    Decode { position: f64, reason: String },

    #[error("frame sampling was cancelled")]
    Cancelled,
}

/// Failures talking to the remote model.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("the provided API key is invalid, check your configuration ({0})")]
    InvalidCredential(String),

    #[error("failed to get a response from the AI model: {0}")]
    Failed(String),

    #[error("analysis was cancelled")]
    Cancelled,
}

impl AnalysisError {
    pub fn is_invalid_credential(&self) -> bool {
        matches!(self, AnalysisError::InvalidCredential(_))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no API key configured, set GEMINI_API_KEY or pass --api-key")]
    MissingCredential,

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("a recording is already in progress")]
    AlreadyRecording,

    #[error("no recording is in progress")]
    NotRecording,

    #[error("could not open capture device {device}: {reason}")]
    Device { device: String, reason: String },

    #[error("recording failed: {0}")]
    Capture(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Top-level error for the video → specification flow.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Sample(#[from] SampleError),

    #[error("could not extract any frames from the video, try a different video file")]
    NoFrames,

    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Recorder(#[from] RecorderError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

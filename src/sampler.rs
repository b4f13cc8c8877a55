//! Frame sampling: walk a video's timeline at a computed interval and keep a
//! bounded number of JPEG stills.
//!
//! The sampler itself knows nothing about containers or codecs. It drives a
//! [`DecodeSurface`] obtained from a [`MediaBackend`] through a strictly
//! sequential seek → capture loop; see [`crate::capture`] for the FFmpeg
//! implementation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use image::codecs::jpeg;
use image::RgbImage;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::error::{ConfigError, SampleError};
use crate::source::VideoSource;

pub const DEFAULT_MAX_FRAMES: usize = 15;
pub const DEFAULT_BASE_INTERVAL_SECONDS: f64 = 2.0;
pub const JPEG_QUALITY: u8 = 70;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoMetadata {
    pub duration_seconds: f64,
    pub width: u32,
    pub height: u32,
}

/// One captured still. `position` is the timeline offset in seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub position: f64,
    pub jpeg: Vec<u8>,
}

impl Frame {
    pub fn mime_type(&self) -> &'static str {
        "image/jpeg"
    }

    pub fn to_base64(&self) -> String {
        BASE64_STANDARD.encode(&self.jpeg)
    }

    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type(), self.to_base64())
    }
}

/// Spacing and frame count derived from a video's duration and the capture budget.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleIntervalPlan {
    pub capacity: usize,
    pub interval_seconds: f64,
}

impl SampleIntervalPlan {
    pub fn new(duration_seconds: f64, max_frames: usize, base_interval_seconds: f64) -> Self {
        let max_frames = max_frames.max(1);
        let mut interval = base_interval_seconds;
        if duration_seconds / interval > max_frames as f64 {
            interval = duration_seconds / max_frames as f64;
        }
        if duration_seconds < interval {
            interval = duration_seconds / 2.0;
        }
        // Zero, negative or NaN intervals would never advance the timeline.
        if !(interval > 0.0) || !interval.is_finite() {
            interval = 1.0;
        }

        let mut capacity = 0;
        let mut current_time = 0.0;
        while current_time <= duration_seconds && capacity < max_frames {
            capacity += 1;
            current_time += interval;
        }

        Self {
            capacity: capacity.max(1),
            interval_seconds: interval,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerOptions {
    pub max_frames: usize,
    pub base_interval_seconds: f64,
}

impl Default for SamplerOptions {
    fn default() -> Self {
        Self {
            max_frames: DEFAULT_MAX_FRAMES,
            base_interval_seconds: DEFAULT_BASE_INTERVAL_SECONDS,
        }
    }
}

impl SamplerOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frames == 0 {
            return Err(ConfigError::Invalid("max frames must be at least 1".into()));
        }
        if !(self.base_interval_seconds > 0.0) || !self.base_interval_seconds.is_finite() {
            return Err(ConfigError::Invalid(format!(
                "capture interval must be a positive number of seconds, got {}",
                self.base_interval_seconds
            )));
        }
        Ok(())
    }
}

/// Cooperative cancellation shared between the caller and a running sample
/// or analysis.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<CancelState>);

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let notified = self.0.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

/// A single decodable view onto a video. Only one seek is ever in flight.
#[async_trait]
pub trait DecodeSurface: Send {
    fn metadata(&self) -> VideoMetadata;

    /// Move the surface to `position` seconds and wait until the frame there is ready.
    async fn seek(&mut self, position: f64) -> Result<(), SampleError>;

    /// Rasterize the frame currently on the surface at native resolution.
    async fn capture(&mut self) -> Result<RgbImage, SampleError>;

    /// Tear down decoder state and delete any temporary file.
    async fn release(self: Box<Self>);
}

#[async_trait]
pub trait MediaBackend: Send + Sync {
    async fn open(&self, source: &VideoSource) -> Result<Box<dyn DecodeSurface>, SampleError>;
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, image::ImageError> {
    let mut jpeg_data = Vec::new();
    let mut encoder = jpeg::JpegEncoder::new_with_quality(&mut jpeg_data, quality);
    encoder.encode(
        image,
        image.width(),
        image.height(),
        image::ExtendedColorType::Rgb8,
    )?;
    Ok(jpeg_data)
}

pub struct FrameSampler<B> {
    backend: B,
    options: SamplerOptions,
}

impl<B: MediaBackend> FrameSampler<B> {
    pub fn new(backend: B, options: SamplerOptions) -> Result<Self, ConfigError> {
        options.validate()?;
        Ok(Self { backend, options })
    }

    pub fn options(&self) -> &SamplerOptions {
        &self.options
    }

    /// Capture up to `max_frames` stills from `source` in timeline order.
    ///
    /// `on_progress` receives the fraction of the timeline covered after each
    /// capture. The decode surface is released before this returns, whatever
    /// the outcome. An empty result is possible and left to the caller to judge.
    pub async fn sample<F>(
        &self,
        source: &VideoSource,
        mut on_progress: F,
        cancel: &CancellationToken,
    ) -> Result<Vec<Frame>, SampleError>
    where
        F: FnMut(f64),
    {
        if cancel.is_cancelled() {
            return Err(SampleError::Cancelled);
        }

        info!(source = %source.describe(), "opening video");
        let mut surface = self.backend.open(source).await?;
        let result = self
            .walk_timeline(surface.as_mut(), &mut on_progress, cancel)
            .await;
        surface.release().await;

        if let Ok(frames) = &result {
            info!(count = frames.len(), "frame sampling finished");
        }
        result
    }

    async fn walk_timeline(
        &self,
        surface: &mut dyn DecodeSurface,
        on_progress: &mut dyn FnMut(f64),
        cancel: &CancellationToken,
    ) -> Result<Vec<Frame>, SampleError> {
        let metadata = surface.metadata();
        let duration = metadata.duration_seconds;
        if !duration.is_finite() || duration <= 0.0 {
            return Err(SampleError::Load(format!(
                "video reports an unusable duration of {duration} seconds"
            )));
        }

        let plan = SampleIntervalPlan::new(
            duration,
            self.options.max_frames,
            self.options.base_interval_seconds,
        );
        info!(
            duration,
            width = metadata.width,
            height = metadata.height,
            interval = plan.interval_seconds,
            capacity = plan.capacity,
            "sampling video"
        );

        let mut frames = Vec::with_capacity(plan.capacity);
        let mut current_time = 0.0;
        while current_time <= duration && frames.len() < self.options.max_frames {
            if cancel.is_cancelled() {
                debug!(position = current_time, "sampling cancelled");
                return Err(SampleError::Cancelled);
            }

            surface.seek(current_time).await?;
            let raster = surface.capture().await?;
            let jpeg = encode_jpeg(&raster, JPEG_QUALITY).map_err(|err| SampleError::Decode {
                position: current_time,
                reason: err.to_string(),
            })?;
            debug!(position = current_time, bytes = jpeg.len(), "captured frame");
            frames.push(Frame {
                position: current_time,
                jpeg,
            });

            on_progress((current_time / duration).min(1.0));
            current_time += plan.interval_seconds;
        }

        Ok(frames)
    }
}

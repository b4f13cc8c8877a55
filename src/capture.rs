use std::path::{Path, PathBuf};
use std::sync::Once;
use std::thread;

use anyhow::anyhow;
use async_trait::async_trait;
use ffmpeg::util::frame::video::Video;
use ffmpeg_next::{self as ffmpeg, codec, decoder, format, media, rescale, software, Rational, Rescale};
use image::RgbImage;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{ConfigError, SampleError};
use crate::sampler::{DecodeSurface, FrameSampler, MediaBackend, SamplerOptions, VideoMetadata};
use crate::source::{MediaPath, VideoSource};

static INIT: Once = Once::new();

pub(crate) fn init() {
    INIT.call_once(|| {
        if let Err(err) = ffmpeg::init() {
            warn!(%err, "ffmpeg initialization failed");
        }
        ffmpeg::util::log::set_level(ffmpeg::util::log::Level::Error);
    });
}

/// Decodes videos with FFmpeg. Each opened source gets its own worker thread
/// that owns the demuxer, decoder and scaler.
#[derive(Debug, Clone, Copy, Default)]
pub struct FfmpegBackend;

impl FfmpegBackend {
    pub fn new() -> Self {
        init();
        Self
    }
}

impl FrameSampler<FfmpegBackend> {
    pub fn with_ffmpeg(options: SamplerOptions) -> Result<Self, ConfigError> {
        FrameSampler::new(FfmpegBackend::new(), options)
    }
}

enum Command {
    Seek {
        position: f64,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    Capture {
        reply: oneshot::Sender<anyhow::Result<RgbImage>>,
    },
}

#[async_trait]
impl MediaBackend for FfmpegBackend {
    async fn open(&self, source: &VideoSource) -> Result<Box<dyn DecodeSurface>, SampleError> {
        let media = source
            .materialize()
            .map_err(|err| SampleError::Load(err.to_string()))?;
        let path = media.path().to_path_buf();

        let (command_tx, command_rx) = mpsc::channel(1);
        let (ready_tx, ready_rx) = oneshot::channel();
        let spawned = thread::Builder::new()
            .name("vidspec-decode".into())
            .spawn(move || run_worker(path, ready_tx, command_rx));
        let worker = match spawned {
            Ok(worker) => worker,
            Err(err) => {
                media.release();
                return Err(SampleError::Load(format!("could not start decoder: {err}")));
            }
        };

        match ready_rx.await {
            Ok(Ok(metadata)) => Ok(Box::new(FfmpegSurface {
                metadata,
                position: 0.0,
                commands: command_tx,
                worker,
                media,
            })),
            outcome => {
                let reason = match outcome {
                    Ok(Err(err)) => format!("{err:#}"),
                    _ => "decoder exited before reporting metadata".to_owned(),
                };
                drop(command_tx);
                let _ = tokio::task::spawn_blocking(move || worker.join()).await;
                media.release();
                Err(SampleError::Load(reason))
            }
        }
    }
}

struct FfmpegSurface {
    metadata: VideoMetadata,
    position: f64,
    commands: mpsc::Sender<Command>,
    worker: thread::JoinHandle<()>,
    media: MediaPath,
}

impl FfmpegSurface {
    fn worker_gone(&self) -> SampleError {
        SampleError::Decode {
            position: self.position,
            reason: "decoder thread stopped unexpectedly".into(),
        }
    }
}

#[async_trait]
impl DecodeSurface for FfmpegSurface {
    fn metadata(&self) -> VideoMetadata {
        self.metadata
    }

    async fn seek(&mut self, position: f64) -> Result<(), SampleError> {
        self.position = position;
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Seek { position, reply })
            .await
            .map_err(|_| self.worker_gone())?;
        response
            .await
            .map_err(|_| self.worker_gone())?
            .map_err(|err| SampleError::Decode {
                position,
                reason: format!("{err:#}"),
            })
    }

    async fn capture(&mut self) -> Result<RgbImage, SampleError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Capture { reply })
            .await
            .map_err(|_| self.worker_gone())?;
        response
            .await
            .map_err(|_| self.worker_gone())?
            .map_err(|err| SampleError::Decode {
                position: self.position,
                reason: format!("{err:#}"),
            })
    }

    async fn release(self: Box<Self>) {
        let FfmpegSurface {
            commands,
            worker,
            media,
            ..
        } = *self;
        drop(commands);
        if let Err(err) = tokio::task::spawn_blocking(move || worker.join()).await {
            warn!(%err, "failed to join decoder thread");
        }
        media.release();
    }
}

fn run_worker(
    path: PathBuf,
    ready: oneshot::Sender<anyhow::Result<VideoMetadata>>,
    mut commands: mpsc::Receiver<Command>,
) {
    let mut state = match DecoderState::open(&path) {
        Ok(state) => state,
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };
    if ready.send(Ok(state.metadata)).is_err() {
        return;
    }

    while let Some(command) = commands.blocking_recv() {
        match command {
            Command::Seek { position, reply } => {
                let _ = reply.send(state.seek(position));
            }
            Command::Capture { reply } => {
                let _ = reply.send(state.capture());
            }
        }
    }
    debug!(path = %path.display(), "decoder thread finished");
}

/// The single decode surface for one video: the frame last landed on by a
/// seek stays here until the next seek replaces it.
struct DecoderState {
    input: format::context::Input,
    stream_index: usize,
    time_base: Rational,
    start_pts: i64,
    decoder: decoder::Video,
    scaler: software::scaling::context::Context,
    current: Option<Video>,
    metadata: VideoMetadata,
}

impl DecoderState {
    fn open(path: &Path) -> anyhow::Result<Self> {
        let input = format::input(&path)?;

        let (stream_index, time_base, start_pts, stream_duration, decoder) = {
            let video_stream = input
                .streams()
                .best(media::Type::Video)
                .ok_or(anyhow!(ffmpeg::Error::StreamNotFound))?;
            let decoder = codec::context::Context::from_parameters(video_stream.parameters())?
                .decoder()
                .video()?;
            (
                video_stream.index(),
                video_stream.time_base(),
                video_stream.start_time().max(0),
                video_stream.duration(),
                decoder,
            )
        };

        let duration_seconds = if input.duration() > 0 {
            input.duration() as f64 * f64::from(rescale::TIME_BASE)
        } else if stream_duration > 0 {
            stream_duration as f64 * f64::from(time_base)
        } else {
            0.0
        };

        let scaler = software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            format::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            software::scaling::Flags::BILINEAR,
        )?;

        let metadata = VideoMetadata {
            duration_seconds,
            width: decoder.width(),
            height: decoder.height(),
        };
        debug!(?metadata, path = %path.display(), "opened video");

        Ok(Self {
            input,
            stream_index,
            time_base,
            start_pts,
            decoder,
            scaler,
            current: None,
            metadata,
        })
    }

    /// Jump to the keyframe at or before `position` and decode forward to the
    /// first frame at or after it. Past the end, the last decoded frame wins.
    fn seek(&mut self, position: f64) -> anyhow::Result<()> {
        let target_ms = (position * 1000.0).round() as i64;
        let seek_ts = target_ms.rescale((1, 1000), rescale::TIME_BASE);
        self.input.seek(seek_ts, ..seek_ts)?;
        self.decoder.flush();

        let target_pts = self.start_pts + target_ms.rescale((1, 1000), self.time_base);
        let mut decoded = Video::empty();
        let mut last = None;

        for (stream, packet) in self.input.packets() {
            if stream.index() != self.stream_index {
                continue;
            }
            self.decoder.send_packet(&packet)?;
            while self.decoder.receive_frame(&mut decoded).is_ok() {
                if reached(&decoded, target_pts)? {
                    self.current = Some(decoded);
                    return Ok(());
                }
                last = Some(std::mem::replace(&mut decoded, Video::empty()));
            }
        }

        self.decoder.send_eof()?;
        while self.decoder.receive_frame(&mut decoded).is_ok() {
            if reached(&decoded, target_pts)? {
                self.current = Some(decoded);
                return Ok(());
            }
            last = Some(std::mem::replace(&mut decoded, Video::empty()));
        }

        match last {
            Some(frame) => {
                debug!(position, "seek ran past the last frame");
                self.current = Some(frame);
                Ok(())
            }
            None if self.current.is_some() => Ok(()),
            None => Err(anyhow!("no frame could be decoded at {position:.2}s")),
        }
    }

    fn capture(&mut self) -> anyhow::Result<RgbImage> {
        let frame = self
            .current
            .as_ref()
            .ok_or(anyhow!("nothing has been decoded yet"))?;
        let mut rgb_frame = Video::empty();
        self.scaler.run(frame, &mut rgb_frame)?;
        rgb_image(&rgb_frame)
    }
}

/// Frames without a timestamp cannot be placed on the timeline.
fn reached(frame: &Video, target_pts: i64) -> anyhow::Result<bool> {
    let pts = frame
        .timestamp()
        .ok_or(anyhow!("decoded frame carries no timestamp"))?;
    Ok(pts >= target_pts)
}

/// Copy an RGB24 frame into an image buffer, dropping per-row padding.
fn rgb_image(frame: &Video) -> anyhow::Result<RgbImage> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = width as usize * 3;
    let stride = frame.stride(0);
    if stride < row_bytes {
        return Err(anyhow!("frame stride {stride} is narrower than {row_bytes} bytes"));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in frame.data(0).chunks(stride).take(height as usize) {
        pixels.extend_from_slice(&row[..row_bytes]);
    }
    RgbImage::from_raw(width, height, pixels).ok_or(anyhow!("Failed to create image buffer"))
}

#[cfg(test)]
mod tests {
    use ffmpeg_next::{encoder, Dictionary, Packet};

    use super::*;
    use crate::sampler::{CancellationToken, Frame, SampleIntervalPlan};

    const CLIP_WIDTH: u32 = 64;
    const CLIP_HEIGHT: u32 = 48;
    const CLIP_FPS: i64 = 10;
    const CLIP_TIME_BASE: Rational = Rational(1, 10);

    /// Luma for frame `index`: a ramp from black towards white, one step per frame.
    fn clip_luma(index: i64) -> u8 {
        (16 + 7 * index) as u8
    }

    /// Encode `seconds` of flat grey frames at 10 fps as MPEG-4 in Matroska,
    /// each frame brighter than the one before.
    fn write_ramp_clip(path: &Path, seconds: i64) -> anyhow::Result<()> {
        init();
        let mut output = format::output(&path)?;
        let global_header = output
            .format()
            .flags()
            .contains(format::Flags::GLOBAL_HEADER);
        let codec = encoder::find(codec::Id::MPEG4).ok_or(anyhow!(ffmpeg::Error::EncoderNotFound))?;

        let mut encoder = {
            let mut stream = output.add_stream(codec)?;
            let mut encoder = codec::context::Context::new_with_codec(codec)
                .encoder()
                .video()?;
            encoder.set_width(CLIP_WIDTH);
            encoder.set_height(CLIP_HEIGHT);
            encoder.set_format(format::Pixel::YUV420P);
            encoder.set_frame_rate(Some(Rational(CLIP_FPS as i32, 1)));
            encoder.set_time_base(CLIP_TIME_BASE);
            encoder.set_gop(5);
            if global_header {
                encoder.set_flags(codec::Flags::GLOBAL_HEADER);
            }
            stream.set_time_base(CLIP_TIME_BASE);
            let encoder = encoder.open_with(Dictionary::new())?;
            stream.set_parameters(&encoder);
            encoder
        };

        output.write_header()?;
        let stream_time_base = output
            .stream(0)
            .ok_or(anyhow!(ffmpeg::Error::StreamNotFound))?
            .time_base();

        for index in 0..seconds * CLIP_FPS {
            let mut frame = Video::new(format::Pixel::YUV420P, CLIP_WIDTH, CLIP_HEIGHT);
            frame.data_mut(0).fill(clip_luma(index));
            frame.data_mut(1).fill(128);
            frame.data_mut(2).fill(128);
            frame.set_pts(Some(index));
            encoder.send_frame(&frame)?;
            write_packets(&mut encoder, &mut output, stream_time_base)?;
        }
        encoder.send_eof()?;
        write_packets(&mut encoder, &mut output, stream_time_base)?;
        output.write_trailer()?;
        Ok(())
    }

    fn write_packets(
        encoder: &mut encoder::Video,
        output: &mut format::context::Output,
        stream_time_base: Rational,
    ) -> anyhow::Result<()> {
        let mut packet = Packet::empty();
        while encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(0);
            packet.rescale_ts(CLIP_TIME_BASE, stream_time_base);
            packet.write_interleaved(output)?;
        }
        Ok(())
    }

    fn centre_level(image: &RgbImage) -> u8 {
        image.get_pixel(image.width() / 2, image.height() / 2).0[0]
    }

    fn frame_level(frame: &Frame) -> u8 {
        let image = image::load_from_memory(&frame.jpeg).unwrap().to_rgb8();
        centre_level(&image)
    }

    #[test]
    fn padded_rows_are_stripped() {
        init();
        let mut frame = Video::new(format::Pixel::RGB24, 5, 3);
        let stride = frame.stride(0);
        let data = frame.data_mut(0);
        for row in 0..3 {
            for byte in 0..15 {
                data[row * stride + byte] = row as u8 + 1;
            }
        }

        let image = rgb_image(&frame).unwrap();
        assert_eq!(image.dimensions(), (5, 3));
        assert_eq!(image.get_pixel(4, 0).0, [1, 1, 1]);
        assert_eq!(image.get_pixel(0, 2).0, [3, 3, 3]);
    }

    #[tokio::test]
    async fn garbage_bytes_fail_to_load() {
        let sampler = FrameSampler::with_ffmpeg(SamplerOptions::default()).unwrap();
        let source = VideoSource::from_bytes(b"definitely not a video".to_vec(), "video/mp4");
        let mut calls = 0;
        let err = sampler
            .sample(&source, |_| calls += 1, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SampleError::Load(_)));
        assert_eq!(calls, 0);
    }

    #[tokio::test]
    async fn missing_file_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let source = VideoSource::from_path(dir.path().join("missing.mp4"));
        let err = FfmpegBackend::new().open(&source).await.err().unwrap();
        assert!(matches!(err, SampleError::Load(_)));
    }

    #[test]
    fn frames_without_timestamps_are_rejected() {
        init();
        let mut frame = Video::new(format::Pixel::RGB24, 2, 2);
        assert!(reached(&frame, 0).is_err());

        unsafe {
            (*frame.as_mut_ptr()).best_effort_timestamp = 500;
        }
        assert!(reached(&frame, 500).unwrap());
        assert!(!reached(&frame, 501).unwrap());
    }

    #[tokio::test]
    async fn sampling_a_real_clip_walks_forward_through_distinct_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ramp.mkv");
        write_ramp_clip(&path, 3).unwrap();
        let source = VideoSource::from_path(path.clone());

        let surface = FfmpegBackend::new().open(&source).await.unwrap();
        let metadata = surface.metadata();
        surface.release().await;
        assert!(
            (2.5..=3.5).contains(&metadata.duration_seconds),
            "duration {}",
            metadata.duration_seconds
        );
        assert_eq!((metadata.width, metadata.height), (CLIP_WIDTH, CLIP_HEIGHT));

        let options = SamplerOptions {
            max_frames: 15,
            base_interval_seconds: 0.5,
        };
        let plan = SampleIntervalPlan::new(metadata.duration_seconds, 15, 0.5);
        let sampler = FrameSampler::with_ffmpeg(options).unwrap();
        let frames = sampler
            .sample(&source, |_| {}, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(frames.len(), plan.capacity);
        assert!(frames.windows(2).all(|pair| pair[0].position < pair[1].position));
        let levels: Vec<u8> = frames.iter().map(frame_level).collect();
        assert!(levels.windows(2).all(|pair| pair[0] < pair[1]), "{levels:?}");
        assert!(levels[0] < 40, "{levels:?}");
        assert!(path.exists());
    }

    #[tokio::test]
    async fn seeking_to_the_end_holds_the_last_frame_and_rewinds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ramp.mkv");
        write_ramp_clip(&path, 1).unwrap();

        let mut surface = FfmpegBackend::new()
            .open(&VideoSource::from_path(path))
            .await
            .unwrap();
        let duration = surface.metadata().duration_seconds;

        surface.seek(duration).await.unwrap();
        let last = centre_level(&surface.capture().await.unwrap());
        surface.seek(0.0).await.unwrap();
        let first = centre_level(&surface.capture().await.unwrap());
        surface.seek(0.5).await.unwrap();
        let middle = centre_level(&surface.capture().await.unwrap());
        surface.release().await;

        assert!(first < middle && middle < last, "{first} {middle} {last}");
        assert!(last > 60, "{last}");
    }
}

//! Camera recording. A worker thread pulls frames from an FFmpeg input
//! device, re-encodes them and muxes a Matroska file that the sampler can
//! open once the recording stops.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use ffmpeg::util::frame::video::Video;
use ffmpeg_next::{
    self as ffmpeg, codec, decoder, encoder, format, media, picture, software, Dictionary, Packet,
    Rational, Rescale,
};
use tempfile::TempPath;
use tracing::{debug, info, warn};

use crate::capture;
use crate::error::RecorderError;
use crate::source::VideoSource;

pub const DEFAULT_DEVICE: &str = "/dev/video0";
pub const DEFAULT_INPUT_FORMAT: &str = "v4l2";

const ENCODER_TIME_BASE: Rational = Rational(1, 1000);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureDevice {
    /// Device path or name, e.g. `/dev/video0` or `0` for avfoundation.
    pub url: String,
    /// FFmpeg input device format, e.g. `v4l2`, `avfoundation`, `dshow`.
    pub format: String,
}

impl Default for CaptureDevice {
    fn default() -> Self {
        Self {
            url: DEFAULT_DEVICE.to_owned(),
            format: DEFAULT_INPUT_FORMAT.to_owned(),
        }
    }
}

struct ActiveRecording {
    stop: Arc<AtomicBool>,
    worker: thread::JoinHandle<Result<(), RecorderError>>,
    output: TempPath,
    started: Instant,
}

impl ActiveRecording {
    fn finish(self) -> Result<TempPath, RecorderError> {
        self.stop.store(true, Ordering::SeqCst);
        let outcome = self
            .worker
            .join()
            .map_err(|_| RecorderError::Capture("recording thread panicked".into()))?;
        outcome.map(|()| self.output)
    }
}

/// Idle until [`Recorder::start`], recording until [`Recorder::stop`] or
/// [`Recorder::discard`].
pub struct Recorder {
    device: CaptureDevice,
    active: Option<ActiveRecording>,
}

impl Recorder {
    pub fn new(device: CaptureDevice) -> Self {
        Self {
            device,
            active: None,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    pub fn elapsed(&self) -> Option<Duration> {
        self.active.as_ref().map(|active| active.started.elapsed())
    }

    /// Open the device and begin writing. Returns once the device is open.
    pub fn start(&mut self) -> Result<(), RecorderError> {
        self.ensure_idle()?;
        capture::init();

        let output = tempfile::Builder::new()
            .prefix("vidspec-recording-")
            .suffix(".mkv")
            .tempfile()?
            .into_temp_path();
        let output_path = output.to_path_buf();
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::channel();

        let device = self.device.clone();
        let worker_stop = stop.clone();
        let worker = thread::Builder::new()
            .name("vidspec-record".into())
            .spawn(move || record_until_stopped(device, output_path, worker_stop, ready_tx))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!(device = %self.device.url, "recording started");
                self.active = Some(ActiveRecording {
                    stop,
                    worker,
                    output,
                    started: Instant::now(),
                });
                Ok(())
            }
            Ok(Err(err)) => {
                let _ = worker.join();
                Err(err)
            }
            Err(_) => {
                let _ = worker.join();
                Err(RecorderError::Capture("recording thread exited during startup".into()))
            }
        }
    }

    fn ensure_idle(&self) -> Result<(), RecorderError> {
        match self.active {
            Some(_) => Err(RecorderError::AlreadyRecording),
            None => Ok(()),
        }
    }

    /// Finalize the file and hand it over as a video source.
    pub fn stop(&mut self) -> Result<VideoSource, RecorderError> {
        let active = self.active.take().ok_or(RecorderError::NotRecording)?;
        let elapsed = active.started.elapsed();
        let output = active.finish()?;
        info!(elapsed = %format_elapsed(elapsed), path = %output.display(), "recording stopped");
        Ok(VideoSource::Recording(output))
    }

    /// Stop and throw the recording away.
    pub fn discard(&mut self) {
        if let Some(active) = self.active.take() {
            match active.finish() {
                Ok(output) => {
                    if let Err(err) = output.close() {
                        warn!(%err, "failed to delete discarded recording");
                    }
                }
                Err(err) => warn!(%err, "discarded recording had failed"),
            }
            debug!("recording discarded");
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.discard();
    }
}

/// `mm:ss`, as shown next to the recording indicator.
pub fn format_elapsed(elapsed: Duration) -> String {
    let seconds = elapsed.as_secs();
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

fn record_until_stopped(
    device: CaptureDevice,
    output_path: PathBuf,
    stop: Arc<AtomicBool>,
    ready: mpsc::Sender<Result<(), RecorderError>>,
) -> Result<(), RecorderError> {
    let mut session = match CaptureSession::open(&device, &output_path) {
        Ok(session) => session,
        Err(err) => {
            let _ = ready.send(Err(RecorderError::Device {
                device: device.url,
                reason: format!("{err:#}"),
            }));
            return Ok(());
        }
    };
    let _ = ready.send(Ok(()));
    session
        .run(&stop)
        .map_err(|err| RecorderError::Capture(format!("{err:#}")))
}

struct CaptureSession {
    input: format::context::Input,
    input_stream_index: usize,
    transcoder: RecordingTranscoder,
    output: format::context::Output,
}

impl CaptureSession {
    fn open(device: &CaptureDevice, output_path: &Path) -> anyhow::Result<Self> {
        let input_format = ffmpeg::device::input::video()
            .find(|candidate| candidate.name() == device.format)
            .ok_or(anyhow!("input device format {} is not available", device.format))?;

        let mut options = Dictionary::new();
        options.set("framerate", "30");
        let input = format::open_with(
            &device.url,
            &format::format::Format::Input(input_format),
            options,
        )?
        .input();

        let mut output = format::output_as(&output_path, "matroska")?;
        let (input_stream_index, transcoder) = {
            let input_stream = input
                .streams()
                .best(media::Type::Video)
                .ok_or(anyhow!(ffmpeg::Error::StreamNotFound))?;
            (
                input_stream.index(),
                RecordingTranscoder::new(&input_stream, &mut output)?,
            )
        };

        Ok(Self {
            input,
            input_stream_index,
            transcoder,
            output,
        })
    }

    fn run(&mut self, stop: &AtomicBool) -> anyhow::Result<()> {
        self.output.write_header()?;
        let output_time_base = self
            .output
            .stream(0)
            .ok_or(anyhow!(ffmpeg::Error::StreamNotFound))?
            .time_base();

        for (stream, packet) in self.input.packets() {
            if stop.load(Ordering::SeqCst) {
                break;
            }
            if stream.index() != self.input_stream_index {
                continue;
            }
            self.transcoder.send_packet_to_decoder(&packet)?;
            self.transcoder
                .receive_and_process_decoded_frames(&mut self.output, output_time_base)?;
        }

        self.transcoder.send_eof_to_decoder()?;
        self.transcoder
            .receive_and_process_decoded_frames(&mut self.output, output_time_base)?;
        self.transcoder.send_eof_to_encoder()?;
        self.transcoder
            .receive_and_process_encoded_packets(&mut self.output, output_time_base)?;
        self.output.write_trailer()?;
        Ok(())
    }
}

/// Decodes raw camera frames and re-encodes them for the output container.
struct RecordingTranscoder {
    decoder: decoder::Video,
    encoder: encoder::Video,
    scaler: software::scaling::context::Context,
    input_time_base: Rational,
    first_timestamp: Option<i64>,
}

impl RecordingTranscoder {
    fn new(
        input_stream: &format::stream::Stream,
        output: &mut format::context::Output,
    ) -> anyhow::Result<Self> {
        let global_header = output
            .format()
            .flags()
            .contains(format::Flags::GLOBAL_HEADER);
        let decoder = codec::context::Context::from_parameters(input_stream.parameters())?
            .decoder()
            .video()?;

        let codec = encoder::find(codec::Id::H264)
            .or_else(|| encoder::find(codec::Id::MPEG4))
            .ok_or(anyhow!(ffmpeg::Error::EncoderNotFound))?;
        let mut output_stream = output.add_stream(codec)?;
        let mut encoder = codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()?;
        encoder.set_width(decoder.width());
        encoder.set_height(decoder.height());
        encoder.set_aspect_ratio(decoder.aspect_ratio());
        encoder.set_format(format::Pixel::YUV420P);
        encoder.set_frame_rate(decoder.frame_rate());
        encoder.set_time_base(ENCODER_TIME_BASE);
        output_stream.set_time_base(ENCODER_TIME_BASE);

        if global_header {
            encoder.set_flags(codec::Flags::GLOBAL_HEADER);
        }

        let mut opts = Dictionary::new();
        opts.set("preset", "veryfast");
        let opened_encoder = encoder.open_with(opts)?;
        output_stream.set_parameters(&opened_encoder);

        let scaler = software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            format::Pixel::YUV420P,
            decoder.width(),
            decoder.height(),
            software::scaling::Flags::BILINEAR,
        )?;

        Ok(Self {
            decoder,
            encoder: opened_encoder,
            scaler,
            input_time_base: input_stream.time_base(),
            first_timestamp: None,
        })
    }

    fn send_packet_to_decoder(&mut self, packet: &Packet) -> anyhow::Result<()> {
        self.decoder
            .send_packet(packet)
            .map_err(anyhow::Error::from)
    }

    fn send_eof_to_decoder(&mut self) -> anyhow::Result<()> {
        self.decoder.send_eof().map_err(anyhow::Error::from)
    }

    fn receive_and_process_decoded_frames(
        &mut self,
        output: &mut format::context::Output,
        output_stream_time_base: Rational,
    ) -> anyhow::Result<()> {
        let mut frame = Video::empty();
        while self.decoder.receive_frame(&mut frame).is_ok() {
            let timestamp = frame.timestamp().ok_or(anyhow!("No timestamp"))?;
            let origin = *self.first_timestamp.get_or_insert(timestamp);

            let mut scaled = Video::empty();
            self.scaler.run(&frame, &mut scaled)?;
            scaled.set_pts(Some(
                (timestamp - origin).rescale(self.input_time_base, ENCODER_TIME_BASE),
            ));
            scaled.set_kind(picture::Type::None);

            self.encoder.send_frame(&scaled)?;
            self.receive_and_process_encoded_packets(output, output_stream_time_base)?;
        }
        Ok(())
    }

    fn send_eof_to_encoder(&mut self) -> anyhow::Result<()> {
        self.encoder.send_eof().map_err(anyhow::Error::from)
    }

    fn receive_and_process_encoded_packets(
        &mut self,
        output: &mut format::context::Output,
        output_stream_time_base: Rational,
    ) -> anyhow::Result<()> {
        let mut packet = Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(0);
            packet.rescale_ts(ENCODER_TIME_BASE, output_stream_time_base);
            packet.write_interleaved(output)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_time_renders_as_minutes_and_seconds() {
        assert_eq!(format_elapsed(Duration::from_secs(0)), "00:00");
        assert_eq!(format_elapsed(Duration::from_millis(59_900)), "00:59");
        assert_eq!(format_elapsed(Duration::from_secs(61)), "01:01");
        assert_eq!(format_elapsed(Duration::from_secs(3600)), "60:00");
    }

    #[test]
    fn stopping_while_idle_is_an_error() {
        let mut recorder = Recorder::new(CaptureDevice::default());
        assert!(!recorder.is_recording());
        assert!(recorder.elapsed().is_none());
        assert!(matches!(recorder.stop(), Err(RecorderError::NotRecording)));
        recorder.discard();
    }

    /// A recording whose worker just waits for the stop flag, standing in for
    /// a camera.
    fn idle_recording() -> ActiveRecording {
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = stop.clone();
        let worker = thread::spawn(move || {
            while !worker_stop.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(5));
            }
            Ok(())
        });
        let output = tempfile::Builder::new()
            .suffix(".mkv")
            .tempfile()
            .unwrap()
            .into_temp_path();
        ActiveRecording {
            stop,
            worker,
            output,
            started: Instant::now(),
        }
    }

    #[test]
    fn starting_twice_keeps_the_first_recording() {
        let mut recorder = Recorder::new(CaptureDevice::default());
        recorder.active = Some(idle_recording());

        assert!(matches!(recorder.start(), Err(RecorderError::AlreadyRecording)));
        assert!(recorder.is_recording());

        let path = match recorder.stop().unwrap() {
            VideoSource::Recording(output) => output.to_path_buf(),
            other => panic!("expected a recording, got {other:?}"),
        };
        assert!(!recorder.is_recording());
        assert!(!path.exists());
    }

    #[test]
    fn discarding_deletes_the_recording() {
        let mut recorder = Recorder::new(CaptureDevice::default());
        let active = idle_recording();
        let path = active.output.to_path_buf();
        recorder.active = Some(active);

        recorder.discard();
        assert!(!recorder.is_recording());
        assert!(!path.exists());
    }

    #[test]
    fn unknown_device_fails_to_start() {
        let mut recorder = Recorder::new(CaptureDevice {
            url: "/nonexistent/video99".into(),
            format: "no-such-device-format".into(),
        });
        let err = recorder.start().unwrap_err();
        assert!(matches!(err, RecorderError::Device { ref device, .. } if device == "/nonexistent/video99"));
        assert!(!recorder.is_recording());
    }
}

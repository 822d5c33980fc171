//! Rate-limited frame sampling
//!
//! A [`VideoDecoder`] advances one frame at a time (`grab`) and only decodes
//! pixels for frames the sampler keeps (`retrieve`). [`FrameSampler`] turns a
//! decoder into a finite iterator of frames spaced `interval` seconds of video
//! time apart.

use crate::error::{RecognitionError, RecognitionResult};
use anyhow::{Context, Result};
use common::frame_extractor::{parse_showinfo_pts, probe_video, spawn_raw_decoder, VideoProbe};
use image::RgbImage;
use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::iter::FusedIterator;
use std::process::{Child, ChildStdout};
use std::sync::mpsc::{self, Receiver};
use std::thread::JoinHandle;
use tracing::{debug, trace, warn};

/// Offset absorbing float error when comparing timestamps to the schedule
const SCHEDULE_EPSILON: f64 = 1e-9;

/// Outcome of advancing the decoder
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Grab {
    /// A frame is available, with its presentation time when known
    Frame { pts: Option<f64> },
    End,
}

/// Sequential video decoder
pub trait VideoDecoder: Send {
    /// Average frame rate, when the source reports one
    fn frame_rate(&self) -> Option<f64>;

    /// Total frame count, when known
    fn frame_count(&self) -> Option<u64>;

    fn duration_secs(&self) -> Option<f64> {
        None
    }

    /// Advance to the next frame without decoding its pixels
    fn grab(&mut self) -> Result<Grab>;

    /// Decode the most recently grabbed frame
    fn retrieve(&mut self) -> Result<RgbImage>;
}

impl<D: VideoDecoder + ?Sized> VideoDecoder for Box<D> {
    fn frame_rate(&self) -> Option<f64> {
        (**self).frame_rate()
    }

    fn frame_count(&self) -> Option<u64> {
        (**self).frame_count()
    }

    fn duration_secs(&self) -> Option<f64> {
        (**self).duration_secs()
    }

    fn grab(&mut self) -> Result<Grab> {
        (**self).grab()
    }

    fn retrieve(&mut self) -> Result<RgbImage> {
        (**self).retrieve()
    }
}

/// Opens video references into decoders
pub trait VideoSource: Send + Sync {
    /// Fails with `VideoOpen` when the reference cannot be opened
    ///
    /// `interval_secs` is the sampling interval the decoder will be read at;
    /// sources may use it to avoid decoding frames that would be dropped.
    fn open(&self, reference: &str, interval_secs: f64)
        -> RecognitionResult<Box<dyn VideoDecoder>>;
}

/// Files and URIs readable by ffmpeg
#[derive(Debug, Clone, Copy, Default)]
pub struct FfmpegVideoSource;

impl VideoSource for FfmpegVideoSource {
    fn open(
        &self,
        reference: &str,
        interval_secs: f64,
    ) -> RecognitionResult<Box<dyn VideoDecoder>> {
        Ok(Box::new(FfmpegDecoder::open(reference, interval_secs)?))
    }
}

/// A frame selected by the sampler
#[derive(Debug, Clone)]
pub struct SampledFrame {
    pub image: RgbImage,
    /// Video time in seconds
    pub timestamp: f64,
    /// Position of the frame in the decoded stream
    pub frame_index: u64,
}

pub struct FrameSampler<D> {
    decoder: D,
    interval: f64,
    frame_rate: Option<f64>,
    stride: u64,
    frame_index: u64,
    samples: u64,
    next_due: f64,
    consecutive_failures: u32,
    max_consecutive_failures: u32,
    skipped: u64,
    finished: bool,
}

impl<D: VideoDecoder> FrameSampler<D> {
    /// Sample `decoder` every `interval_secs` of video time
    ///
    /// The iterator ends with a `VideoRead` error once
    /// `max_consecutive_failures` frames in a row could not be read.
    pub fn new(
        decoder: D,
        interval_secs: f64,
        max_consecutive_failures: u32,
    ) -> RecognitionResult<Self> {
        if !interval_secs.is_finite() || interval_secs <= 0.0 {
            return Err(RecognitionError::invalid_parameter(format!(
                "sampling interval must be greater than 0, got {}",
                interval_secs
            )));
        }

        let frame_rate = decoder
            .frame_rate()
            .filter(|fps| fps.is_finite() && *fps > 0.0);
        let stride = frame_rate
            .map(|fps| ((interval_secs * fps).round() as u64).max(1))
            .unwrap_or(1);

        Ok(Self {
            decoder,
            interval: interval_secs,
            frame_rate,
            stride,
            frame_index: 0,
            samples: 0,
            next_due: 0.0,
            consecutive_failures: 0,
            max_consecutive_failures: max_consecutive_failures.max(1),
            skipped: 0,
            finished: false,
        })
    }

    pub fn interval_secs(&self) -> f64 {
        self.interval
    }

    /// Frames between two samples when the frame rate is known
    pub fn stride(&self) -> Option<u64> {
        self.frame_rate.map(|_| self.stride)
    }

    /// Number of frames this sampler is expected to yield, if predictable
    pub fn expected_samples(&self) -> Option<u64> {
        if let (Some(_), Some(count)) = (self.frame_rate, self.decoder.frame_count()) {
            return Some(count.div_ceil(self.stride));
        }
        if let Some(duration) = self.decoder.duration_secs() {
            if duration.is_finite() && duration > 0.0 {
                return Some((duration / self.interval).floor() as u64 + 1);
            }
        }
        None
    }

    /// Frames that could not be read or decoded
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Samples yielded so far
    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Decide whether the grabbed frame is kept, returning its timestamp
    fn schedule(&mut self, index: u64, pts: Option<f64>) -> Option<f64> {
        if let Some(fps) = self.frame_rate {
            return (index % self.stride == 0).then(|| index as f64 / fps);
        }

        match pts {
            Some(pts) if pts.is_finite() => {
                if pts + SCHEDULE_EPSILON < self.next_due {
                    return None;
                }
                while self.next_due <= pts + SCHEDULE_EPSILON {
                    self.next_due += self.interval;
                }
                Some(pts)
            }
            _ => Some(self.samples as f64 * self.interval),
        }
    }

    fn record_failure(&mut self, error: anyhow::Error) -> Option<RecognitionResult<SampledFrame>> {
        self.skipped += 1;
        self.consecutive_failures += 1;
        warn!(
            frame_index = self.frame_index.saturating_sub(1),
            consecutive_failures = self.consecutive_failures,
            error = %error,
            "skipping unreadable frame"
        );

        if self.consecutive_failures >= self.max_consecutive_failures {
            self.finished = true;
            return Some(Err(RecognitionError::VideoRead {
                failures: self.consecutive_failures,
                reason: format!("{:#}", error),
            }));
        }
        None
    }
}

impl<D: VideoDecoder> Iterator for FrameSampler<D> {
    type Item = RecognitionResult<SampledFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.finished {
            let index = self.frame_index;
            let grabbed = self.decoder.grab();
            match grabbed {
                Ok(Grab::End) => {
                    self.finished = true;
                    debug!(frames = index, samples = self.samples, "video exhausted");
                }
                Err(e) => {
                    self.frame_index += 1;
                    if let Some(err) = self.record_failure(e) {
                        return Some(err);
                    }
                }
                Ok(Grab::Frame { pts }) => {
                    self.frame_index += 1;
                    let Some(timestamp) = self.schedule(index, pts) else {
                        self.consecutive_failures = 0;
                        continue;
                    };

                    match self.decoder.retrieve() {
                        Ok(image) => {
                            self.consecutive_failures = 0;
                            self.samples += 1;
                            return Some(Ok(SampledFrame {
                                image,
                                timestamp,
                                frame_index: index,
                            }));
                        }
                        Err(e) => {
                            if let Some(err) = self.record_failure(e) {
                                return Some(err);
                            }
                        }
                    }
                }
            }
        }
        None
    }
}

impl<D: VideoDecoder> FusedIterator for FrameSampler<D> {}

// ============================================================================
// FFmpeg decoder
// ============================================================================

/// Packed RGB24 frames paired with the timestamps logged by `showinfo`
///
/// Reports no frame rate, so the sampler schedules on presentation time.
pub struct RawFrameStream<R> {
    reader: R,
    timestamps: Receiver<f64>,
    width: u32,
    height: u32,
    buffer: Vec<u8>,
    grabbed: bool,
}

impl<R: Read> RawFrameStream<R> {
    pub fn new(reader: R, timestamps: Receiver<f64>, width: u32, height: u32) -> Self {
        Self {
            reader,
            timestamps,
            width,
            height,
            buffer: vec![0; width as usize * height as usize * 3],
            grabbed: false,
        }
    }
}

impl<R: Read + Send> VideoDecoder for RawFrameStream<R> {
    fn frame_rate(&self) -> Option<f64> {
        None
    }

    fn frame_count(&self) -> Option<u64> {
        None
    }

    fn grab(&mut self) -> Result<Grab> {
        self.grabbed = false;
        match self.reader.read_exact(&mut self.buffer) {
            Ok(()) => {
                self.grabbed = true;
                // showinfo logs a frame before it reaches the pipe
                let pts = self.timestamps.recv().ok();
                Ok(Grab::Frame { pts })
            }
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(Grab::End),
            Err(e) => Err(e).context("failed to read frame from ffmpeg"),
        }
    }

    fn retrieve(&mut self) -> Result<RgbImage> {
        if !self.grabbed {
            anyhow::bail!("no frame grabbed");
        }
        RgbImage::from_raw(self.width, self.height, self.buffer.clone())
            .context("frame buffer does not match video dimensions")
    }
}

/// Forward every `showinfo` timestamp found in an ffmpeg log stream
pub fn spawn_timestamp_reader<L>(log: L) -> Result<(Receiver<f64>, JoinHandle<()>)>
where
    L: Read + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let handle = std::thread::Builder::new()
        .name("ffmpeg-log".to_string())
        .spawn(move || {
            for line in BufReader::new(log).lines() {
                let Ok(line) = line else {
                    break;
                };
                match parse_showinfo_pts(&line) {
                    Some(pts) => {
                        if tx.send(pts).is_err() {
                            break;
                        }
                    }
                    None => trace!(line = %line, "ffmpeg"),
                }
            }
        })
        .context("failed to spawn ffmpeg log reader")?;
    Ok((rx, handle))
}

/// Decoder reading frames from an ffmpeg child process
///
/// When the container reports no frame rate, ffmpeg itself drops frames
/// between sampling points and the sampler works from the logged timestamps.
pub struct FfmpegDecoder {
    probe: VideoProbe,
    child: Child,
    frames: RawFrameStream<ChildStdout>,
    log_reader: Option<JoinHandle<()>>,
}

impl FfmpegDecoder {
    /// Probe `reference` and start decoding it
    pub fn open(reference: &str, interval_secs: f64) -> RecognitionResult<Self> {
        let video_open = |e: anyhow::Error| RecognitionError::VideoOpen {
            reference: reference.to_string(),
            reason: format!("{:#}", e),
        };

        let probe = probe_video(reference).map_err(video_open)?;
        if probe.width == 0 || probe.height == 0 {
            return Err(video_open(anyhow::anyhow!(
                "video reports empty frame size {}x{}",
                probe.width,
                probe.height
            )));
        }

        let prefilter = probe.frame_rate.is_none().then_some(interval_secs);
        let mut child = spawn_raw_decoder(reference, probe.width, probe.height, prefilter)
            .map_err(video_open)?;

        let streams = child
            .stdout
            .take()
            .zip(child.stderr.take())
            .context("ffmpeg output was not captured");
        let (stdout, stderr) = match streams {
            Ok(streams) => streams,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(video_open(e));
            }
        };

        let (timestamps, log_reader) = match spawn_timestamp_reader(stderr) {
            Ok(reader) => reader,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(video_open(e));
            }
        };

        let frames = RawFrameStream::new(stdout, timestamps, probe.width, probe.height);
        Ok(Self {
            probe,
            child,
            frames,
            log_reader: Some(log_reader),
        })
    }

    pub fn probe(&self) -> &VideoProbe {
        &self.probe
    }
}

impl VideoDecoder for FfmpegDecoder {
    fn frame_rate(&self) -> Option<f64> {
        self.probe.frame_rate
    }

    fn frame_count(&self) -> Option<u64> {
        self.probe.frame_count
    }

    fn duration_secs(&self) -> Option<f64> {
        self.probe.duration_secs
    }

    fn grab(&mut self) -> Result<Grab> {
        self.frames.grab()
    }

    fn retrieve(&mut self) -> Result<RgbImage> {
        self.frames.retrieve()
    }
}

impl Drop for FfmpegDecoder {
    fn drop(&mut self) {
        if let Err(e) = self.child.kill() {
            debug!(error = %e, "ffmpeg already exited");
        }
        let _ = self.child.wait();
        if let Some(reader) = self.log_reader.take() {
            let _ = reader.join();
        }
    }
}

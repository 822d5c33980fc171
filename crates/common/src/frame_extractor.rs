//! Frame extraction utilities for video files and streams
//!
//! This module wraps FFmpeg/ffprobe for the analysis pipeline: probing a
//! source for its geometry and frame rate, and spawning a decoder that writes
//! raw RGB frames to a pipe.

use anyhow::{Context, Result};
use base64::Engine;
use serde::Deserialize;
use std::process::{Child, Command, Stdio};
use tracing::{debug, error};

/// Properties of a video source as reported by ffprobe
#[derive(Debug, Clone, PartialEq)]
pub struct VideoProbe {
    pub width: u32,
    pub height: u32,
    /// Average frame rate, `None` when the container does not report one
    pub frame_rate: Option<f64>,
    /// Number of frames, `None` when unknown (live sources, some containers)
    pub frame_count: Option<u64>,
    pub duration_secs: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    nb_frames: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Parse an ffprobe rational such as `30000/1001` or `25/1`
///
/// Returns `None` for `0/0`, zero and non-finite rates.
pub fn parse_frame_rate(value: &str) -> Option<f64> {
    let rate = match value.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => value.trim().parse().ok()?,
    };

    if rate.is_finite() && rate > 0.0 {
        Some(rate)
    } else {
        None
    }
}

/// Parse the JSON document printed by `ffprobe -of json`
pub fn parse_probe_output(json: &str) -> Result<VideoProbe> {
    let output: ProbeOutput =
        serde_json::from_str(json).context("ffprobe output is not valid JSON")?;

    let stream = output
        .streams
        .into_iter()
        .next()
        .context("no video stream found")?;

    let width = stream.width.context("video stream has no width")?;
    let height = stream.height.context("video stream has no height")?;

    let frame_rate = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_frame_rate));

    let frame_count = stream
        .nb_frames
        .as_deref()
        .and_then(|n| n.parse::<u64>().ok())
        .filter(|&n| n > 0);

    let duration_secs = output
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0);

    Ok(VideoProbe {
        width,
        height,
        frame_rate,
        frame_count,
        duration_secs,
    })
}

/// Probe a video source with ffprobe
pub fn probe_video(source_uri: &str) -> Result<VideoProbe> {
    debug!(source = %source_uri, "probing video source");

    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,avg_frame_rate,r_frame_rate,nb_frames:format=duration",
            "-of",
            "json",
            source_uri,
        ])
        .output()
        .context("failed to execute ffprobe")?;

    if !output.status.success() {
        error!(source = %source_uri, status = ?output.status, "ffprobe failed");
        anyhow::bail!("ffprobe exited with error: {:?}", output.status);
    }

    let stdout = String::from_utf8(output.stdout).context("ffprobe output is not valid UTF-8")?;
    let probe = parse_probe_output(&stdout)?;

    debug!(
        source = %source_uri,
        width = probe.width,
        height = probe.height,
        frame_rate = ?probe.frame_rate,
        frame_count = ?probe.frame_count,
        "probed video source"
    );

    Ok(probe)
}

/// Arguments for an FFmpeg process writing packed RGB24 frames to stdout
///
/// A `showinfo` filter logs every emitted frame to stderr so the caller can
/// pair frames with their presentation time. With `sample_interval` set, a
/// `select` filter drops frames before conversion and keeps only the first
/// frame at or after each multiple of the interval.
pub fn raw_decoder_args(
    source_uri: &str,
    width: u32,
    height: u32,
    sample_interval: Option<f64>,
) -> Vec<String> {
    let mut filters = Vec::new();
    if let Some(interval) = sample_interval.filter(|i| i.is_finite() && *i > 0.0) {
        filters.push(format!(
            "select='isnan(prev_selected_t)+gt(floor(t/{i}),floor(prev_selected_t/{i}))'",
            i = interval
        ));
    }
    filters.push(format!("scale={}:{}", width, height));
    filters.push("showinfo".to_string());

    vec![
        "-hide_banner".to_string(),
        "-nostats".to_string(),
        "-v".to_string(),
        "info".to_string(),
        "-i".to_string(),
        source_uri.to_string(),
        "-vf".to_string(),
        filters.join(","),
        "-f".to_string(),
        "rawvideo".to_string(),
        "-pix_fmt".to_string(),
        "rgb24".to_string(),
        "pipe:1".to_string(),
    ]
}

/// Spawn FFmpeg decoding `source_uri` into packed RGB24 frames on stdout
///
/// Each frame occupies exactly `width * height * 3` bytes of the pipe and
/// has a matching `showinfo` line on stderr.
pub fn spawn_raw_decoder(
    source_uri: &str,
    width: u32,
    height: u32,
    sample_interval: Option<f64>,
) -> Result<Child> {
    let args = raw_decoder_args(source_uri, width, height, sample_interval);

    debug!(args = ?args, "spawning ffmpeg raw decoder");

    Command::new("ffmpeg")
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("failed to spawn ffmpeg")
}

/// Presentation time logged by the `showinfo` filter for one frame
///
/// Format: `[Parsed_showinfo_1 @ 0x..] n:   3 pts:  3003 pts_time:0.1001 ...`
pub fn parse_showinfo_pts(line: &str) -> Option<f64> {
    if !line.contains("showinfo") {
        return None;
    }
    let (_, rest) = line.split_once("pts_time:")?;
    let value: f64 = rest.split_whitespace().next()?.parse().ok()?;
    value.is_finite().then_some(value)
}

/// Decode a base64 image payload, tolerating a `data:image/...;base64,` prefix
pub fn decode_base64_image(data: &str) -> Result<Vec<u8>> {
    let payload = match data.split_once("base64,") {
        Some((_, rest)) => rest,
        None => data,
    };

    base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .context("invalid base64 image data")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frame_rate() {
        assert_eq!(parse_frame_rate("25/1"), Some(25.0));
        assert!((parse_frame_rate("30000/1001").unwrap() - 29.97).abs() < 0.01);
        assert_eq!(parse_frame_rate("24"), Some(24.0));
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("0/1"), None);
        assert_eq!(parse_frame_rate("n/a"), None);
    }

    #[test]
    fn test_parse_stream_info() {
        let json = r#"{
            "programs": [],
            "streams": [
                {"width": 1280, "height": 720, "avg_frame_rate": "30/1", "r_frame_rate": "30/1", "nb_frames": "900"}
            ],
            "format": {"duration": "30.000000"}
        }"#;

        let probe = parse_probe_output(json).unwrap();
        assert_eq!(probe.width, 1280);
        assert_eq!(probe.height, 720);
        assert_eq!(probe.frame_rate, Some(30.0));
        assert_eq!(probe.frame_count, Some(900));
        assert_eq!(probe.duration_secs, Some(30.0));
    }

    #[test]
    fn test_parse_stream_info_falls_back_to_real_frame_rate() {
        let json = r#"{
            "streams": [{"width": 640, "height": 480, "avg_frame_rate": "0/0", "r_frame_rate": "15/1"}]
        }"#;

        let probe = parse_probe_output(json).unwrap();
        assert_eq!(probe.frame_rate, Some(15.0));
        assert_eq!(probe.frame_count, None);
        assert_eq!(probe.duration_secs, None);
    }

    #[test]
    fn test_parse_stream_info_without_stream() {
        assert!(parse_probe_output(r#"{"streams": []}"#).is_err());
        assert!(parse_probe_output("not json").is_err());
    }

    #[test]
    fn test_decode_base64_image() {
        let plain = decode_base64_image("/9j/4A==").unwrap();
        assert_eq!(plain, vec![0xFF, 0xD8, 0xFF, 0xE0]);

        let data_url = decode_base64_image("data:image/jpeg;base64,/9j/4A==").unwrap();
        assert_eq!(data_url, plain);

        assert!(decode_base64_image("%%%").is_err());
    }

    #[test]
    fn test_parse_showinfo_pts() {
        let line = "[Parsed_showinfo_2 @ 0x5581c0] n:   4 pts:  12012 pts_time:0.4004  duration:3003 pos:48213 fmt:yuv420p";
        assert_eq!(parse_showinfo_pts(line), Some(0.4004));

        let config = "[Parsed_showinfo_2 @ 0x5581c0] config in time_base: 1/30000, frame_rate: 30000/1001";
        assert_eq!(parse_showinfo_pts(config), None);
        assert_eq!(parse_showinfo_pts("frame=  10 fps=0.0 q=-0.0 pts_time:1.0"), None);
        assert_eq!(parse_showinfo_pts("[Parsed_showinfo_0 @ 0x1] n: 0 pts: N/A pts_time:NOPTS"), None);
    }

    #[test]
    fn test_raw_decoder_args() {
        let args = raw_decoder_args("/videos/gate.mp4", 640, 360, None);
        let filter = &args[args.iter().position(|a| a == "-vf").unwrap() + 1];
        assert_eq!(filter, "scale=640:360,showinfo");
        assert_eq!(args.last().map(String::as_str), Some("pipe:1"));

        let args = raw_decoder_args("/videos/gate.mp4", 640, 360, Some(2.0));
        let filter = &args[args.iter().position(|a| a == "-vf").unwrap() + 1];
        assert_eq!(
            filter,
            "select='isnan(prev_selected_t)+gt(floor(t/2),floor(prev_selected_t/2))',scale=640:360,showinfo"
        );
    }
}

// --- ffmpeg invocation ------------------------------------------------------
//
// ffmpeg's command-line syntax is the contract here; we only assemble it.
// The child reads the source in real time (`-re`), transcodes with the
// configured profile and publishes to the ingest URL. Progress and errors go
// to stderr, which the process handle captures.

use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

use crate::config::{OutputConfig, PlayConfig};
use crate::item::Item;
use crate::process::Launcher;

/// Env override for the transcoder binary (name on PATH or absolute path).
pub const FFMPEG_ENV: &str = "LIVESTREAMER_FFMPEG";

pub fn build_args(item: &Item, play: &PlayConfig, output: &OutputConfig) -> Vec<String> {
    let mut args: Vec<String> = vec!["-re".into()];
    if let Some(start) = &item.start {
        args.push("-ss".into());
        args.push(start.clone());
    }

    args.push("-i".into());
    args.push(item.path.clone());

    if let Some(end) = &item.end {
        args.push("-to".into());
        args.push(end.clone());
    }

    let profile = [
        ("-c:v", play.video_codec.clone()),
        ("-preset", play.preset.clone()),
        ("-crf", play.crf.to_string()),
        ("-maxrate", play.max_rate.clone()),
        ("-bufsize", play.buf_size.clone()),
        ("-vf", format!("scale={}", play.scale)),
        ("-r", play.frame_rate.to_string()),
        ("-c:a", play.audio_codec.clone()),
        ("-b:a", play.audio_bitrate.clone()),
        ("-ar", play.audio_sample_rate.to_string()),
        ("-f", play.output_format.clone()),
    ];
    for (flag, value) in profile {
        args.push(flag.into());
        args.push(value);
    }
    args.extend(["-stats", "-loglevel", "info"].map(String::from));

    args.extend(play.custom_args.split_whitespace().map(String::from));

    args.push(output.ingest_url());
    args
}

/// Resolve the transcoder binary: `LIVESTREAMER_FFMPEG` if set, else `ffmpeg`
/// on PATH. Absolute and relative paths are checked for being executable.
pub fn locate_ffmpeg() -> Option<PathBuf> {
    let name = std::env::var(FFMPEG_ENV).unwrap_or_else(|_| "ffmpeg".to_string());
    match which::which(&name) {
        Ok(path) => Some(path),
        Err(e) => {
            debug!(%name, "transcoder lookup failed: {e}");
            None
        }
    }
}

/// Production launcher: one ffmpeg per item, streaming to the configured ingest.
#[derive(Debug, Clone)]
pub struct FfmpegLauncher {
    program: PathBuf,
    play: PlayConfig,
    output: OutputConfig,
}

impl FfmpegLauncher {
    pub fn new(program: PathBuf, play: PlayConfig, output: OutputConfig) -> Self {
        Self { program, play, output }
    }
}

impl Launcher for FfmpegLauncher {
    fn command(&self, item: &Item) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-hide_banner");
        cmd.args(build_args(item, &self.play, &self.output));
        cmd
    }

    fn program(&self) -> Option<&Path> {
        Some(&self.program)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output() -> OutputConfig {
        OutputConfig {
            rtmp_server: "rtmp://live.example.com/app".into(),
            stream_key: "key".into(),
        }
    }

    #[test]
    fn args_without_bounds() {
        let args = build_args(&Item::new("/v/a.mp4"), &PlayConfig::default(), &output());
        let expected = [
            "-re", "-i", "/v/a.mp4", "-c:v", "libx264", "-preset", "fast", "-crf", "23", "-maxrate",
            "8000k", "-bufsize", "12000k", "-vf", "scale=1920:1080", "-r", "30", "-c:a", "aac",
            "-b:a", "192k", "-ar", "48000", "-f", "flv", "-stats", "-loglevel", "info",
            "rtmp://live.example.com/app/key",
        ];
        assert_eq!(args, expected);
    }

    #[test]
    fn trim_bounds_wrap_the_input_and_custom_args_precede_url() {
        let item = Item::new("/v/a.mp4").with_bounds(Some("00:00:05".into()), Some("90".into()));
        let play = PlayConfig {
            custom_args: "  -g 60   -tune zerolatency ".into(),
            ..PlayConfig::default()
        };
        let args = build_args(&item, &play, &output());

        assert_eq!(&args[..7], ["-re", "-ss", "00:00:05", "-i", "/v/a.mp4", "-to", "90"]);
        let n = args.len();
        assert_eq!(
            &args[n - 5..],
            ["-g", "60", "-tune", "zerolatency", "rtmp://live.example.com/app/key"]
        );
    }

    #[test]
    fn transcoder_lookup_honours_the_env_override() {
        // Only this test touches FFMPEG_ENV.
        std::env::set_var(FFMPEG_ENV, "/definitely/not/here/ffmpeg");
        assert!(locate_ffmpeg().is_none());

        std::env::set_var(FFMPEG_ENV, "sh");
        let found = locate_ffmpeg().unwrap();
        assert!(found.is_absolute());
        assert!(found.ends_with("sh"));

        std::env::remove_var(FFMPEG_ENV);
    }
}

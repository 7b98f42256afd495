// --- Configuration ----------------------------------------------------------
//
// A single JSON file drives everything: what to play, where to stream it, the
// transcode profile and a few runtime knobs. Loading happens exactly once at
// startup; any error here is fatal and reported before the play loop starts.
//
// Example:
//
//   {
//     "input": ["/srv/videos", { "path": "/srv/intro.mp4", "start": "5", "end": "00:01:00" }],
//     "output": { "rtmp_server": "rtmp://live.example.com/app", "stream_key": "abc" },
//     "play": { "video_codec": "libx264", "crf": 23 }
//   }

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use walkdir::WalkDir;

use crate::item::{is_supported_video, Item};

pub const DEFAULT_CONFIG_PATH: &str = "config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config not found: {0}")]
    NotFound(PathBuf),

    #[error("config read failed ({path}): {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config unmarshal failed: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("input is empty")]
    NoInput,

    #[error("input[{0}] path is empty")]
    EmptyInputPath(usize),

    #[error("input[{index}] stat failed ({path}): {source}")]
    InputStat {
        index: usize,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("input[{index}] is not a supported video: {path}")]
    UnsupportedInput { index: usize, path: String },

    #[error("input[{index}] walk failed ({path}): {source}")]
    Walk {
        index: usize,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("rtmp_server is empty")]
    RtmpServerEmpty,

    #[error("rtmp_server is not a valid rtmp server: {0}")]
    RtmpServerInvalid(String),

    #[error("stream_key is empty")]
    StreamKeyEmpty,

    #[error("no input video found")]
    NoPlayableItems,
}

/// One entry of the `input` array: a bare path or an object with trim bounds.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum InputEntry {
    Path(String),
    Item {
        path: String,
        #[serde(default)]
        start: Option<String>,
        #[serde(default)]
        end: Option<String>,
    },
}

impl InputEntry {
    fn into_item(self) -> Item {
        match self {
            InputEntry::Path(path) => Item::new(path),
            InputEntry::Item { path, start, end } => Item::new(path).with_bounds(start, end),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    File,
    Dir,
}

/// A validated input entry.
#[derive(Debug, Clone)]
pub struct InputSource {
    pub item: Item,
    pub kind: InputKind,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutputConfig {
    #[serde(default)]
    pub rtmp_server: String,
    #[serde(default)]
    pub stream_key: String,
}

impl OutputConfig {
    /// `<rtmp_server>/<stream_key>`, the address ffmpeg publishes to.
    pub fn ingest_url(&self) -> String {
        format!("{}/{}", self.rtmp_server, self.stream_key)
    }

    fn validate(&mut self) -> Result<(), ConfigError> {
        let server = self.rtmp_server.trim();
        if server.is_empty() {
            return Err(ConfigError::RtmpServerEmpty);
        }
        if !server.starts_with("rtmp://") && !server.starts_with("rtmps://") {
            return Err(ConfigError::RtmpServerInvalid(server.to_string()));
        }
        self.rtmp_server = server.trim_end_matches('/').to_string();

        let key = self.stream_key.trim();
        if key.is_empty() {
            return Err(ConfigError::StreamKeyEmpty);
        }
        self.stream_key = key.trim_start_matches('/').to_string();
        Ok(())
    }
}

/// Transcode profile. Empty strings and zeroes fall back to the defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlayConfig {
    pub video_codec: String,
    pub preset: String,
    pub crf: u32,
    pub max_rate: String,
    pub buf_size: String,
    pub scale: String,
    pub frame_rate: u32,
    pub audio_codec: String,
    pub audio_bitrate: String,
    pub audio_sample_rate: u32,
    pub output_format: String,
    pub custom_args: String,
}

impl Default for PlayConfig {
    fn default() -> Self {
        Self {
            video_codec: "libx264".into(),
            preset: "fast".into(),
            crf: 23,
            max_rate: "8000k".into(),
            buf_size: "12000k".into(),
            scale: "1920:1080".into(),
            frame_rate: 30,
            audio_codec: "aac".into(),
            audio_bitrate: "192k".into(),
            audio_sample_rate: 48_000,
            output_format: "flv".into(),
            custom_args: String::new(),
        }
    }
}

impl PlayConfig {
    fn fill_defaults(&mut self) {
        let d = PlayConfig::default();
        fn or_default(v: &mut String, d: String) {
            if v.trim().is_empty() {
                *v = d;
            }
        }
        or_default(&mut self.video_codec, d.video_codec);
        or_default(&mut self.preset, d.preset);
        or_default(&mut self.max_rate, d.max_rate);
        or_default(&mut self.buf_size, d.buf_size);
        or_default(&mut self.scale, d.scale);
        or_default(&mut self.audio_codec, d.audio_codec);
        or_default(&mut self.audio_bitrate, d.audio_bitrate);
        or_default(&mut self.output_format, d.output_format);
        if self.crf == 0 {
            self.crf = d.crf;
        }
        if self.frame_rate == 0 {
            self.frame_rate = d.frame_rate;
        }
        if self.audio_sample_rate == 0 {
            self.audio_sample_rate = d.audio_sample_rate;
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Capture ffmpeg's stderr (progress/errors) into the output buffer.
    pub play_state: bool,
    /// Upper bound for the buffered diagnostic text.
    pub output_buffer_bytes: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            play_state: true,
            output_buffer_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub addr: String,
    pub broadcast_interval_ms: u64,
}

impl ServerConfig {
    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_interval_ms.max(10))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".into(),
            broadcast_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub first_ms: u64,
    pub max_ms: u64,
    pub factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            first_ms: 500,
            max_ms: 30_000,
            factor: 2.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub grace_period_ms: u64,
    pub idle_poll_ms: u64,
    pub backoff: BackoffConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 3000,
            idle_poll_ms: 1000,
            backoff: BackoffConfig::default(),
        }
    }
}

impl SupervisorConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms.max(10))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub input: Vec<InputEntry>,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub play: PlayConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Validated inputs, filled by [`Config::validate`].
    #[serde(skip)]
    pub sources: Vec<InputSource>,
}

impl Config {
    /// Read, parse and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let meta = std::fs::metadata(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                }
            }
        })?;
        if meta.is_dir() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let mut cfg: Config = serde_json::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&mut self) -> Result<(), ConfigError> {
        self.sources = validate_inputs(&self.input)?;
        self.output.validate()?;
        self.play.fill_defaults();
        Ok(())
    }

    /// Expand the validated inputs into the initial playlist.
    ///
    /// Files are taken as-is (with their trim bounds); directories contribute
    /// every supported file below them, in path order.
    pub fn resolve_playlist(&self) -> Result<Vec<Item>, ConfigError> {
        let mut out = Vec::new();
        for (index, src) in self.sources.iter().enumerate() {
            match src.kind {
                InputKind::File => out.push(src.item.clone()),
                InputKind::Dir => {
                    let videos =
                        scan_videos_recursive(Path::new(&src.item.path)).map_err(|e| ConfigError::Walk {
                            index,
                            path: src.item.path.clone(),
                            source: e,
                        })?;
                    out.extend(videos.into_iter().map(Item::new));
                }
            }
        }
        if out.is_empty() {
            return Err(ConfigError::NoPlayableItems);
        }
        Ok(out)
    }

    /// Directory inputs, which the filesystem watcher follows.
    pub fn watch_dirs(&self) -> Vec<PathBuf> {
        self.sources
            .iter()
            .filter(|s| s.kind == InputKind::Dir)
            .map(|s| PathBuf::from(&s.item.path))
            .collect()
    }
}

fn validate_inputs(input: &[InputEntry]) -> Result<Vec<InputSource>, ConfigError> {
    if input.is_empty() {
        return Err(ConfigError::NoInput);
    }

    let mut out = Vec::with_capacity(input.len());
    for (index, entry) in input.iter().enumerate() {
        let item = entry.clone().into_item();
        if item.path.trim().is_empty() {
            return Err(ConfigError::EmptyInputPath(index));
        }
        let meta = std::fs::metadata(&item.path).map_err(|e| ConfigError::InputStat {
            index,
            path: item.path.clone(),
            source: e,
        })?;
        let kind = if meta.is_dir() {
            InputKind::Dir
        } else {
            if !is_supported_video(&item.path) {
                return Err(ConfigError::UnsupportedInput {
                    index,
                    path: item.path.clone(),
                });
            }
            InputKind::File
        };
        out.push(InputSource { item, kind });
    }
    Ok(out)
}

/// Every supported video below `root`, sorted by path.
///
/// Symlinked directories are not followed. Filesystem errors are returned,
/// never treated as an empty directory.
pub fn scan_videos_recursive(root: &Path) -> std::io::Result<Vec<String>> {
    let mut out = Vec::new();
    for ent in WalkDir::new(root).follow_links(false) {
        let ent = ent?;
        if ent.file_type().is_file() && is_supported_video(ent.path()) {
            out.push(ent.path().to_string_lossy().to_string());
        }
    }
    out.sort();
    Ok(out)
}

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Container/stream extensions the transcoder is fed from disk.
pub const SUPPORTED_FORMATS: [&str; 13] = [
    "mp4", "flv", "mkv", "ts", "webm", "avi", "mov", "wmv", "ogg", "m3u8", "mpd", "rtmp", "srt",
];

/// One playable source.
///
/// `start`/`end` are passed through to ffmpeg untouched (`-ss`/`-to`), so any
/// duration syntax ffmpeg accepts is fine ("90", "00:01:30", "1:30.5").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
}

impl Item {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            start: None,
            end: None,
        }
    }

    pub fn with_bounds(mut self, start: Option<String>, end: Option<String>) -> Self {
        // Blank strings in the config mean "no bound".
        self.start = start.filter(|s| !s.trim().is_empty());
        self.end = end.filter(|s| !s.trim().is_empty());
        self
    }
}

pub fn is_supported_video(path: impl AsRef<Path>) -> bool {
    let Some(ext) = path.as_ref().extension().and_then(|e| e.to_str()) else {
        return false;
    };
    let ext_lc = ext.to_ascii_lowercase();
    SUPPORTED_FORMATS.iter().any(|f| *f == ext_lc.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_check_is_case_insensitive() {
        assert!(is_supported_video("/media/a.mp4"));
        assert!(is_supported_video("/media/B.MKV"));
        assert!(is_supported_video("clip.Ts"));
        assert!(!is_supported_video("/media/notes.txt"));
        assert!(!is_supported_video("/media/no_extension"));
    }

    #[test]
    fn blank_bounds_are_dropped() {
        let item = Item::new("a.mp4").with_bounds(Some("".into()), Some("00:10:00".into()));
        assert_eq!(item.start, None);
        assert_eq!(item.end.as_deref(), Some("00:10:00"));
    }
}

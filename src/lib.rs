//! live-streamer: keeps one ffmpeg child pushing the current playlist item to
//! an RTMP ingest, and lets operators skip, queue and drop items while it runs.

pub mod backoff;
pub mod config;
pub mod console;
pub mod error;
pub mod ffmpeg;
pub mod item;
pub mod playlist;
pub mod process;
pub mod server;
pub mod sink;
pub mod supervisor;
pub mod watcher;

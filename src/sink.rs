use std::sync::Mutex;

/// Bounded buffer of diagnostic text from the active transcoder.
///
/// Producers (the stderr reader, the play loop) append; observers take
/// snapshots. The lock is only ever held for a string copy, so a slow
/// observer cannot stall ffmpeg's stderr pipe. Once the buffer grows past
/// `max_bytes` the oldest text is dropped down to three quarters of the cap.
#[derive(Debug)]
pub struct OutputSink {
    buf: Mutex<String>,
    max_bytes: usize,
}

impl OutputSink {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            buf: Mutex::new(String::new()),
            max_bytes: max_bytes.max(256),
        }
    }

    /// Append a chunk of diagnostic output tagged with its source path.
    pub fn push_chunk(&self, path: &str, chunk: &[u8]) {
        let text = String::from_utf8_lossy(chunk);
        self.append(&format!("[{path}] {text}"));
    }

    /// Append a lifecycle line (`start stream: ...`).
    pub fn push_line(&self, line: &str) {
        self.append(&format!("{line}\n"));
    }

    pub fn snapshot(&self) -> String {
        self.lock().clone()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn append(&self, text: &str) {
        let mut buf = self.lock();
        buf.push_str(text);
        if buf.len() > self.max_bytes {
            let keep = self.max_bytes * 3 / 4;
            let mut cut = buf.len() - keep;
            while !buf.is_char_boundary(cut) {
                cut += 1;
            }
            buf.drain(..cut);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, String> {
        // Poisoning is ignored; the buffer is plain text.
        self.buf.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_are_tagged_with_the_source_path() {
        let sink = OutputSink::new(1024);
        sink.push_line("start stream: /v/a.mp4");
        sink.push_chunk("/v/a.mp4", b"frame=  10 fps=30\n");
        assert_eq!(
            sink.snapshot(),
            "start stream: /v/a.mp4\n[/v/a.mp4] frame=  10 fps=30\n"
        );
    }

    #[test]
    fn trims_oldest_text_once_over_capacity() {
        let sink = OutputSink::new(256);
        for i in 0..100 {
            sink.push_line(&format!("line {i:03}"));
        }
        let snap = sink.snapshot();
        assert!(snap.len() <= 256);
        assert!(snap.ends_with("line 099\n"));
        assert!(!snap.contains("line 000"));
    }

    #[test]
    fn trimming_respects_utf8_boundaries() {
        let sink = OutputSink::new(256);
        for _ in 0..200 {
            sink.push_line("é");
        }
        // Would panic inside drain() if the cut split a code point.
        assert!(sink.snapshot().len() <= 256);
    }
}

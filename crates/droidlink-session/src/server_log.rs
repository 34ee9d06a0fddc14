use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::debug;

/// Oldest output is dropped beyond this many bytes.
const MAX_LOG_BYTES: usize = 64 * 1024;

/// Accumulated stdout/stderr of one server process, attached to crash and
/// handshake errors.
#[derive(Debug, Clone, Default)]
pub struct ServerLog {
    inner: Arc<Mutex<String>>,
}

impl ServerLog {
    pub fn append(&self, line: &str) {
        let mut log = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        log.push_str(line);
        log.push('\n');
        if log.len() > MAX_LOG_BYTES {
            let mut cut = log.len() - MAX_LOG_BYTES;
            while !log.is_char_boundary(cut) {
                cut += 1;
            }
            log.drain(..cut);
        }
    }

    pub fn snapshot(&self) -> String {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Whether a server stderr line reports that the device encoder failed.
/// Matches "Video encoding error" and other "encoding error" variants in
/// any case, plus codec-open failures.
pub fn is_encoder_failure(line: &str) -> bool {
    line.contains("Could not open codec") || line.to_ascii_lowercase().contains("encoding error")
}

/// Read `pipe` to the end, handing each non-empty line to `on_line`.
/// Invalid UTF-8 is replaced rather than ending the drain.
pub async fn drain_lines<R, F>(pipe: R, mut on_line: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end();
                if !line.is_empty() {
                    on_line(line);
                }
            }
            Err(e) => {
                debug!("Server pipe read failed: {}", e);
                break;
            }
        }
    }
}

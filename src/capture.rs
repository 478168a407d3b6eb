//! Size-bounded output capture.

use serde_json::{Map, Value};

use crate::namespace::ExecutionNamespace;

/// Appended once to a stream that hit its cap.
pub const TRUNCATION_MARKER: &str = "\n... [output truncated]";

const READ_CHUNK: usize = 8192;

/// A text buffer that stops growing at `cap` bytes.
///
/// Writes past the cap are dropped. The truncation marker is added when the
/// buffer is turned into a string, so it appears exactly once however many
/// writes were dropped.
#[derive(Debug, Clone)]
pub struct BoundedBuffer {
    text: String,
    cap: usize,
    truncated: bool,
}

impl BoundedBuffer {
    pub const fn new(cap: usize) -> Self {
        Self {
            text: String::new(),
            cap,
            truncated: false,
        }
    }

    pub fn push_str(&mut self, s: &str) {
        if self.truncated {
            return;
        }
        let room = self.cap - self.text.len();
        if s.len() <= room {
            self.text.push_str(s);
            return;
        }
        let mut cut = room;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        self.text.push_str(&s[..cut]);
        self.truncated = true;
    }

    /// Append raw bytes, replacing invalid UTF-8.
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.push_str(&String::from_utf8_lossy(bytes));
    }

    /// Record that the producer already dropped output.
    pub fn mark_truncated(&mut self) {
        self.truncated = true;
    }

    pub const fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn into_string(mut self) -> String {
        if self.truncated {
            self.text.push_str(TRUNCATION_MARKER);
        }
        self.text
    }
}

/// Drain `reader` to EOF, keeping at most `cap` bytes.
///
/// Reading continues past the cap so a chatty writer never blocks on a full
/// pipe.
pub async fn read_bounded<R>(mut reader: R, cap: usize) -> BoundedBuffer
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut kept = Vec::new();
    let mut truncated = false;
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => keep(&mut kept, &chunk[..n], cap, &mut truncated),
        }
    }
    finish(&kept, cap, truncated)
}

/// Blocking counterpart of [`read_bounded`].
pub fn read_bounded_blocking<R: std::io::Read>(mut reader: R, cap: usize) -> BoundedBuffer {
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => keep(&mut kept, &chunk[..n], cap, &mut truncated),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(_) => break,
        }
    }
    finish(&kept, cap, truncated)
}

fn keep(kept: &mut Vec<u8>, bytes: &[u8], cap: usize, truncated: &mut bool) {
    let room = cap.saturating_sub(kept.len());
    if bytes.len() > room {
        *truncated = true;
    }
    kept.extend_from_slice(&bytes[..bytes.len().min(room)]);
}

fn finish(kept: &[u8], cap: usize, truncated: bool) -> BoundedBuffer {
    let mut buffer = BoundedBuffer::new(cap);
    buffer.push_bytes(kept);
    if truncated {
        buffer.mark_truncated();
    }
    buffer
}

/// Drop snapshot entries that the namespace itself bound.
///
/// The child already skips names it injected and left untouched; this is
/// the parent's check that a snapshot never hands back builtins or module
/// handles as if user code had produced them. Caller globals that user code
/// reassigned are kept.
pub fn sanitize_locals(
    mut locals: Map<String, Value>,
    namespace: &ExecutionNamespace,
) -> Map<String, Value> {
    locals.retain(|name, _| {
        !name.starts_with('_')
            && (namespace.globals.contains_key(name) || !namespace.provides(name))
    });
    locals
}

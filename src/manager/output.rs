//! Child output handling
//!
//! Standard output and standard error of a child are split into lines by one
//! reader task each and fanned into a single channel. The merged channel
//! closes once both readers have hit end of stream.

use std::collections::VecDeque;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;

/// One labelled line of service output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub service_id: String,
    pub line: String,
}

/// Where every service's output ends up
pub type OutputSink = mpsc::UnboundedSender<OutputLine>;

/// Bounded tail of the most recent output lines (oldest dropped first)
#[derive(Debug, Clone, Default)]
pub struct LogTail {
    capacity: usize,
    lines: VecDeque<String>,
}

impl LogTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            lines: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, line: &str) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Merge two byte streams into one channel of lines
///
/// Lines from the two sources are interleaved in arrival order. A final
/// line without a trailing newline is still delivered, but stream end never
/// produces an extra empty line.
pub fn merge_lines<A, B>(stdout: Option<A>, stderr: Option<B>) -> mpsc::UnboundedReceiver<String>
where
    A: AsyncRead + Unpin + Send + 'static,
    B: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    if let Some(reader) = stdout {
        tokio::spawn(read_lines(reader, tx.clone()));
    }
    if let Some(reader) = stderr {
        tokio::spawn(read_lines(reader, tx.clone()));
    }
    rx
}

async fn read_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                if tx.send(line).is_err() {
                    break;
                }
            }
            Err(e) => {
                log::debug!("Output stream read failed: {}", e);
                break;
            }
        }
    }
}

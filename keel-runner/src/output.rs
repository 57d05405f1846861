//! Output sinks
//!
//! Container runtimes and the VCS produce raw chunks of output. The rest of the
//! runner deals in whole lines, so chunks go through a `LineWriter` which
//! splits them and hands each complete line to a `LineHandler`.

use anyhow::Result;
use async_trait::async_trait;

/// Destination for raw output chunks
#[async_trait]
pub trait OutputSink: Send {
    /// Writes a chunk of output, which may contain partial lines
    async fn write(&mut self, chunk: &[u8]) -> Result<()>;

    /// Flushes anything still buffered
    async fn close(&mut self) -> Result<()>;
}

/// Receives output one line at a time, without the line terminator
#[async_trait]
pub trait LineHandler: Send {
    async fn line(&mut self, line: &str) -> Result<()>;
}

/// Splits output chunks into lines
///
/// `\r\n` and lone `\r` are treated as line endings too. Text after the last
/// line ending is held back until more output arrives or the writer is closed.
pub struct LineWriter<H> {
    handler: H,
    left_over: String,
}

impl<H: LineHandler> LineWriter<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            left_over: String::new(),
        }
    }

    pub fn into_inner(self) -> H {
        self.handler
    }
}

#[async_trait]
impl<H: LineHandler> OutputSink for LineWriter<H> {
    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        let text = String::from_utf8_lossy(chunk)
            .replace("\r\n", "\n")
            .replace('\r', "\n");

        let mut buffered = std::mem::take(&mut self.left_over);
        buffered.push_str(&text);

        let mut lines: Vec<&str> = buffered.split('\n').collect();
        let rest = lines.pop().unwrap_or_default().to_string();

        for line in lines {
            self.handler.line(line).await?;
        }
        self.left_over = rest;

        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.left_over.is_empty() {
            let last = std::mem::take(&mut self.left_over);
            self.handler.line(&last).await?;
        }
        Ok(())
    }
}

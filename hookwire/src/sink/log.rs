use std::{
    fs::OpenOptions,
    io::{self, BufWriter, Write},
    path::Path,
};

use anyhow::{anyhow, Result};
use events::DecodedEvent;
use serde::Deserialize;

use super::Sink;

/// Format used by `LogSink` to write events.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub(crate) enum LogFormat {
    /// One human readable line per event.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Writes events one by one to a `Write`.
pub(crate) struct LogSink {
    writer: Box<dyn Write + Send>,
    format: LogFormat,
}

impl LogSink {
    pub(crate) fn new(writer: Box<dyn Write + Send>, format: LogFormat) -> Self {
        LogSink { writer, format }
    }

    pub(crate) fn stdout(format: LogFormat) -> Self {
        Self::new(Box::new(BufWriter::new(io::stdout())), format)
    }

    /// Append events to a file, creating it if needed.
    pub(crate) fn file(path: &Path, format: LogFormat) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| anyhow!("Could not open {}: {e}", path.display()))?;

        Ok(Self::new(Box::new(BufWriter::new(file)), format))
    }
}

impl Sink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    fn deliver(&mut self, event: &DecodedEvent) -> Result<()> {
        match self.format {
            LogFormat::Text => writeln!(self.writer, "{event}")?,
            LogFormat::Json => {
                let mut line = serde_json::to_vec(event)?;
                line.push(b'\n');
                self.writer.write_all(&line)?;
            }
        }

        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        Ok(self.writer.flush()?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use events::{EventBody, ProbeKind, XdpAction, XdpEvent};

    use super::*;

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Buffer {
        fn content(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn event() -> DecodedEvent {
        DecodedEvent {
            timestamp: 42,
            hook_id: 1,
            probe: "fexit_xdp".to_string(),
            hook: "xdp".to_string(),
            kind: ProbeKind::Exit,
            body: EventBody::Xdp(XdpEvent {
                ifindex: 2,
                rx_queue: 0,
                data_len: 60,
                action: Some(XdpAction::Pass),
            }),
        }
    }

    #[test]
    fn text() {
        let buf = Buffer::default();
        let mut sink = LogSink::new(Box::new(buf.clone()), LogFormat::Text);

        sink.deliver(&event()).unwrap();
        sink.finish().unwrap();
        assert_eq!(
            buf.content(),
            "42 [fexit_xdp] exit:xdp if 2 rxq 0 len 60 verdict pass\n"
        );
    }

    #[test]
    fn json() {
        let buf = Buffer::default();
        let mut sink = LogSink::new(Box::new(buf.clone()), LogFormat::Json);

        sink.deliver(&event()).unwrap();
        sink.deliver(&event()).unwrap();

        let content = buf.content();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let parsed: DecodedEvent = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed, event());

        let value: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(value["body"]["schema"], "xdp");
        assert_eq!(value["body"]["action"], "pass");
    }

    #[test]
    fn file() {
        let path = std::env::temp_dir().join(format!("hookwire-log-sink-{}", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let mut sink = LogSink::file(&path, LogFormat::Text).unwrap();
        sink.deliver(&event()).unwrap();
        sink.finish().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("42 [fexit_xdp]"));
        std::fs::remove_file(&path).unwrap();
    }
}

//! Line-oriented file connectors.
//!
//! `FileInbound` reads the file once, one message per line, then idles until
//! stopped. `FileOutbound` appends one line per message.

use super::{parse_params, Connector, ConnectorError, NoopStopper, StopHandle, StopLatch};
use crate::config::ConnectorConfig;
use crate::pipeline::error::PipelineResult;
use crate::pipeline::message::{Message, MessageWrapper};
use serde::Deserialize;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Lines, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileParams {
    path: PathBuf,
    #[serde(default)]
    topic: Option<String>,
    /// Parse each line as JSON into a document message.
    #[serde(default)]
    json: bool,
}

pub struct FileInbound {
    path: PathBuf,
    topic: String,
    json: bool,
    lines: Option<Lines<BufReader<File>>>,
    latch: Arc<StopLatch>,
}

impl FileInbound {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            topic: path.display().to_string(),
            path,
            json: false,
            lines: None,
            latch: StopLatch::new(),
        }
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    pub fn from_config(config: &ConnectorConfig) -> PipelineResult<Self> {
        let params: FileParams = parse_params(config)?;
        let mut conn = Self::new(&params.path).with_json(params.json);
        if let Some(topic) = params.topic {
            conn.topic = topic;
        }
        Ok(conn)
    }

    fn to_message(&self, line: String) -> Result<Message, ConnectorError> {
        if self.json {
            let doc = serde_json::from_str(&line).map_err(ConnectorError::transport)?;
            Ok(Message::document(self.topic.clone(), doc))
        } else {
            Ok(Message::raw(self.topic.clone(), line.into_bytes()))
        }
    }
}

impl Connector for FileInbound {
    fn type_name(&self) -> &'static str {
        "file"
    }

    fn connect(&mut self) -> Result<(), ConnectorError> {
        let file = File::open(&self.path).map_err(|e| {
            ConnectorError::Transport(format!("{}: {}", self.path.display(), e))
        })?;
        self.lines = Some(BufReader::new(file).lines());
        self.latch.reset();
        Ok(())
    }

    fn disconnect(&mut self) {
        self.lines = None;
    }

    fn stopper(&self) -> StopHandle {
        self.latch.clone()
    }

    fn receive(&mut self) -> Result<Message, ConnectorError> {
        if self.latch.is_stopped() {
            return Err(ConnectorError::Stopped);
        }
        loop {
            let next = match self.lines.as_mut() {
                Some(lines) => lines.next(),
                None => None,
            };
            match next {
                Some(Ok(line)) if line.trim().is_empty() => continue,
                Some(Ok(line)) => return self.to_message(line),
                Some(Err(e)) => return Err(ConnectorError::transport(e)),
                None => {
                    self.lines = None;
                    self.latch.wait();
                    return Err(ConnectorError::Stopped);
                }
            }
        }
    }

    fn send(&mut self, _wrapper: &MessageWrapper) -> Result<(), ConnectorError> {
        Err(ConnectorError::Transport(
            "file inbound connector cannot send".to_string(),
        ))
    }
}

impl std::fmt::Debug for FileInbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileInbound")
            .field("path", &self.path)
            .field("topic", &self.topic)
            .field("json", &self.json)
            .finish()
    }
}

#[derive(Debug)]
pub struct FileOutbound {
    path: PathBuf,
    file: Option<File>,
}

impl FileOutbound {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: None,
        }
    }

    pub fn from_config(config: &ConnectorConfig) -> PipelineResult<Self> {
        let params: FileParams = parse_params(config)?;
        Ok(Self::new(params.path))
    }
}

impl Connector for FileOutbound {
    fn type_name(&self) -> &'static str {
        "file"
    }

    fn connect(&mut self) -> Result<(), ConnectorError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(ConnectorError::transport)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| ConnectorError::Transport(format!("{}: {}", self.path.display(), e)))?;
        self.file = Some(file);
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(mut file) = self.file.take() {
            if let Err(e) = file.flush() {
                tracing::warn!("Failed to flush {}: {}", self.path.display(), e);
            }
        }
    }

    fn stopper(&self) -> StopHandle {
        Arc::new(NoopStopper)
    }

    fn receive(&mut self) -> Result<Message, ConnectorError> {
        Err(ConnectorError::Transport(
            "file outbound connector cannot receive".to_string(),
        ))
    }

    fn send(&mut self, wrapper: &MessageWrapper) -> Result<(), ConnectorError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| ConnectorError::Transport("file not open".to_string()))?;
        let bytes = wrapper.working.as_bytes().map_err(ConnectorError::transport)?;
        file.write_all(bytes).map_err(ConnectorError::transport)?;
        file.write_all(b"\n").map_err(ConnectorError::transport)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_reads_lines_then_idles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.txt");
        std::fs::write(&path, "one\n\ntwo\n").unwrap();

        let mut conn = FileInbound::new(&path);
        conn.connect().unwrap();
        assert_eq!(conn.receive().unwrap().as_bytes().unwrap(), b"one");
        assert_eq!(conn.receive().unwrap().as_bytes().unwrap(), b"two");

        let stopper = conn.stopper();
        let reader = thread::spawn(move || conn.receive());
        thread::sleep(Duration::from_millis(20));
        stopper.stop();
        assert!(matches!(reader.join().unwrap(), Err(ConnectorError::Stopped)));
    }

    #[test]
    fn test_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.jsonl");
        std::fs::write(&path, "{\"v\": 1}\n").unwrap();

        let cfg = ConnectorConfig::new("file")
            .param("path", path.to_string_lossy().to_string())
            .param("json", true)
            .param("topic", "sensors");
        let mut conn = FileInbound::from_config(&cfg).unwrap();
        conn.connect().unwrap();
        let msg = conn.receive().unwrap();
        assert_eq!(msg.topic(), "sensors");
        assert_eq!(msg.as_document().unwrap(), &json!({"v": 1}));
    }

    #[test]
    fn test_missing_file_fails_connect() {
        let mut conn = FileInbound::new("/definitely/not/here.txt");
        assert!(matches!(conn.connect(), Err(ConnectorError::Transport(_))));
    }

    #[test]
    fn test_outbound_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.txt");
        let mut conn = FileOutbound::new(&path);
        conn.connect().unwrap();
        conn.send(&MessageWrapper::new(Message::raw("t", b"a".to_vec())))
            .unwrap();
        conn.send(&MessageWrapper::new(Message::document("t", json!({"b": 2}))))
            .unwrap();
        conn.disconnect();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a\n{\"b\":2}\n");
    }
}

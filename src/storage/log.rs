//! Append-only message log.
//!
//! One JSON record per line:
//!
//! ```text
//! {"type":"message","queue":"q","messageId":"...","data":"<base64>","checksum":"<md5 hex>"}
//! {"type":"delete","queue":"q","messageId":"..."}
//! ```
//!
//! `data` is the base64 of the serialized message envelope (JSON with the
//! raw content base64-encoded inside); `checksum` is the md5 hex digest of
//! the decoded envelope bytes. Replay applies records in order and skips
//! corrupt records with a warning. Appends are flushed and fsynced before
//! returning, so the causal client action is only acknowledged once the
//! record is durable.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::entities::Message;
use crate::protocol::BasicProperties;
use crate::Result;

pub const LOG_FILE: &str = "messages.log";

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum LogRecord {
    Message {
        queue: String,
        #[serde(rename = "messageId")]
        message_id: String,
        data: String,
        checksum: String,
    },
    Delete {
        queue: String,
        #[serde(rename = "messageId")]
        message_id: String,
    },
}

/// The serialized message form carried inside a `message` record.
#[derive(Debug, Serialize, Deserialize)]
struct MessageEnvelope {
    id: String,
    exchange: String,
    #[serde(rename = "routingKey")]
    routing_key: String,
    mandatory: bool,
    immediate: bool,
    properties: BasicProperties,
    timestamp: u64,
    content: String,
}

fn serialize_message(message: &Message) -> Result<Vec<u8>> {
    let envelope = MessageEnvelope {
        id: message.id.clone(),
        exchange: message.exchange.clone(),
        routing_key: message.routing_key.clone(),
        mandatory: message.mandatory,
        immediate: message.immediate,
        properties: message.properties.clone(),
        timestamp: message.timestamp,
        content: BASE64.encode(&message.content),
    };
    Ok(serde_json::to_vec(&envelope)?)
}

fn deserialize_message(bytes: &[u8]) -> Result<Message> {
    let envelope: MessageEnvelope = serde_json::from_slice(bytes)?;
    let content = BASE64
        .decode(envelope.content.as_bytes())
        .map_err(|e| crate::BrokerError::Storage(format!("invalid message content: {}", e)))?;
    Ok(Message {
        id: envelope.id,
        exchange: envelope.exchange,
        routing_key: envelope.routing_key,
        mandatory: envelope.mandatory,
        immediate: envelope.immediate,
        properties: envelope.properties,
        content: Bytes::from(content),
        timestamp: envelope.timestamp,
        redelivered: false,
        publisher: None,
    })
}

fn md5_hex(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

/// The append handle plus replay/compaction over `messages.log`.
#[derive(Debug)]
pub struct MessageLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl MessageLog {
    /// Open (creating if absent) the log under `data_dir` for appending.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(LOG_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, writer: BufWriter::new(file) })
    }

    /// Append a `message` record for `queue` and make it durable.
    pub fn append_message(&mut self, queue: &str, message: &Message) -> Result<()> {
        let bytes = serialize_message(message)?;
        let record = LogRecord::Message {
            queue: queue.to_string(),
            message_id: message.id.clone(),
            checksum: md5_hex(&bytes),
            data: BASE64.encode(&bytes),
        };
        self.append(&record)
    }

    /// Append a `delete` record and make it durable.
    pub fn append_delete(&mut self, queue: &str, message_id: &str) -> Result<()> {
        let record =
            LogRecord::Delete { queue: queue.to_string(), message_id: message_id.to_string() };
        self.append(&record)
    }

    fn append(&mut self, record: &LogRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Replay the log in order, applying deletes, and return the surviving
    /// `(queue, message)` pairs. Corrupt records are skipped with a warning.
    pub fn replay(&self) -> Result<Vec<(String, Message)>> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut survivors: Vec<(String, Message)> = Vec::new();
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: LogRecord = match serde_json::from_str(&line) {
                Ok(r) => r,
                Err(e) => {
                    warn!("skipping unparseable log record at line {}: {}", line_no + 1, e);
                    continue;
                }
            };
            match record {
                LogRecord::Message { queue, message_id, data, checksum } => {
                    let bytes = match BASE64.decode(data.as_bytes()) {
                        Ok(b) => b,
                        Err(e) => {
                            warn!(
                                "skipping log record for message {} on {}: bad base64: {}",
                                message_id, queue, e
                            );
                            continue;
                        }
                    };
                    if md5_hex(&bytes) != checksum {
                        warn!(
                            "skipping log record for message {} on {}: checksum mismatch",
                            message_id, queue
                        );
                        continue;
                    }
                    match deserialize_message(&bytes) {
                        Ok(message) => survivors.push((queue, message)),
                        Err(e) => {
                            warn!(
                                "skipping log record for message {} on {}: {}",
                                message_id, queue, e
                            );
                        }
                    }
                }
                LogRecord::Delete { queue, message_id } => {
                    if let Some(pos) = survivors
                        .iter()
                        .position(|(q, m)| *q == queue && m.id == message_id)
                    {
                        survivors.remove(pos);
                    }
                }
            }
        }
        Ok(survivors)
    }

    /// Rewrite the log with one `message` record per surviving message,
    /// atomically replace the old file, and reopen for append.
    pub fn compact<'a, I>(&mut self, survivors: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a str, &'a Message)>,
    {
        self.writer.flush()?;

        let tmp_path = self.path.with_extension("log.tmp");
        {
            let tmp = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(tmp);
            for (queue, message) in survivors {
                let bytes = serialize_message(message)?;
                let record = LogRecord::Message {
                    queue: queue.to_string(),
                    message_id: message.id.clone(),
                    checksum: md5_hex(&bytes),
                    data: BASE64.encode(&bytes),
                };
                let line = serde_json::to_string(&record)?;
                writer.write_all(line.as_bytes())?;
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
            writer.get_ref().sync_data()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;

        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        Ok(())
    }

    /// Flush buffered appends to disk.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::Message;

    fn message(body: &str) -> Message {
        Message::new(
            "".into(),
            "q".into(),
            false,
            false,
            BasicProperties { delivery_mode: Some(2), ..Default::default() },
            Bytes::from(body.as_bytes().to_vec()),
        )
    }

    #[test]
    fn test_append_and_replay() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut log = MessageLog::open(dir.path()).expect("Failed to open log");

        let m1 = message("first");
        let m2 = message("second");
        log.append_message("q", &m1).expect("Failed to append");
        log.append_message("q", &m2).expect("Failed to append");

        let survivors = log.replay().expect("Failed to replay");
        assert_eq!(survivors.len(), 2);
        assert_eq!(survivors[0].1.content, Bytes::from("first"));
        assert_eq!(survivors[1].1.content, Bytes::from("second"));
        assert_eq!(survivors[0].1.properties, m1.properties);
    }

    #[test]
    fn test_delete_record_removes_message() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut log = MessageLog::open(dir.path()).expect("Failed to open log");

        let m1 = message("keep");
        let m2 = message("acked");
        log.append_message("q", &m1).unwrap();
        log.append_message("q", &m2).unwrap();
        log.append_delete("q", &m2.id).unwrap();

        let survivors = log.replay().expect("Failed to replay");
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].1.id, m1.id);
    }

    #[test]
    fn test_checksum_mismatch_skips_single_record() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut log = MessageLog::open(dir.path()).expect("Failed to open log");

        let m1 = message("good");
        log.append_message("q", &m1).unwrap();

        // Hand-write a record with a bogus checksum, then a valid one after it.
        let bytes = serialize_message(&message("corrupt")).unwrap();
        let bad = LogRecord::Message {
            queue: "q".into(),
            message_id: "bad-id".into(),
            data: BASE64.encode(&bytes),
            checksum: "00000000000000000000000000000000".into(),
        };
        log.append(&bad).unwrap();
        let m3 = message("also good");
        log.append_message("q", &m3).unwrap();

        let survivors = log.replay().expect("Failed to replay");
        assert_eq!(survivors.len(), 2);
        assert_eq!(survivors[0].1.id, m1.id);
        assert_eq!(survivors[1].1.id, m3.id);
    }

    #[test]
    fn test_replay_missing_file_is_empty() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let log = MessageLog::open(dir.path()).expect("Failed to open log");
        std::fs::remove_file(dir.path().join(LOG_FILE)).unwrap();
        assert!(log.replay().expect("Failed to replay").is_empty());
    }

    #[test]
    fn test_compaction_drops_deleted_records() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut log = MessageLog::open(dir.path()).expect("Failed to open log");

        let m1 = message("kept");
        let m2 = message("dropped");
        log.append_message("q", &m1).unwrap();
        log.append_message("q", &m2).unwrap();
        log.append_delete("q", &m2.id).unwrap();

        let survivors = log.replay().unwrap();
        let refs: Vec<(&str, &Message)> =
            survivors.iter().map(|(q, m)| (q.as_str(), m)).collect();
        log.compact(refs).expect("Failed to compact");

        // The rewritten log replays to the same survivors and contains a
        // single line.
        let replayed = log.replay().unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].1.id, m1.id);
        let text = std::fs::read_to_string(dir.path().join(LOG_FILE)).unwrap();
        assert_eq!(text.lines().count(), 1);

        // The log is still appendable after compaction.
        log.append_message("q", &message("after")).unwrap();
        assert_eq!(log.replay().unwrap().len(), 2);
    }
}

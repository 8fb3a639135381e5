//! Durable state: metadata snapshots plus the append-only message log.
//!
//! Three snapshot files (`exchanges.json`, `queues.json`, `bindings.json`)
//! hold pretty-printed arrays of entity records, replaced atomically via a
//! temp file and rename. `messages.log` holds the persistent message
//! records (see [`log`]). Startup recovery loads the snapshots, filters to
//! what durability rules allow to survive, replays the log into the
//! surviving queues, and compacts.
//!
//! Durability rules: an exchange or queue is persisted iff durable; a
//! binding iff its destination queue is durable; a message iff its
//! destination queue is durable and the message is persistent
//! (delivery mode 2).

pub mod log;

pub use log::MessageLog;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::PathBuf;
use tracing::{debug, info};

use crate::entities::{Binding, Exchange, Message, Queue};
use crate::Result;

pub const EXCHANGES_FILE: &str = "exchanges.json";
pub const QUEUES_FILE: &str = "queues.json";
pub const BINDINGS_FILE: &str = "bindings.json";

/// Durable state restored at startup.
#[derive(Debug, Default)]
pub struct RecoveredState {
    pub exchanges: Vec<Exchange>,
    pub queues: Vec<Queue>,
    pub bindings: Vec<Binding>,
    /// `(queue, message)` pairs in log order.
    pub messages: Vec<(String, Message)>,
}

/// Owner of the data directory: snapshot writes and the message log append
/// handle.
#[derive(Debug)]
pub struct Persistence {
    data_dir: PathBuf,
    log: MessageLog,
}

impl Persistence {
    /// Open the persistence layer, creating `data_dir` if needed.
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)?;
        let log = MessageLog::open(&data_dir)?;
        Ok(Self { data_dir, log })
    }

    /// Load and filter durable state, replay the message log into the
    /// surviving queues, and compact the log down to the survivors.
    pub fn recover(&mut self) -> Result<RecoveredState> {
        let exchanges: Vec<Exchange> = self.load_snapshot(EXCHANGES_FILE)?;
        let queues: Vec<Queue> = self.load_snapshot(QUEUES_FILE)?;
        let bindings: Vec<Binding> = self.load_snapshot(BINDINGS_FILE)?;

        let exchanges: Vec<Exchange> = exchanges.into_iter().filter(|e| e.durable).collect();
        let queues: Vec<Queue> =
            queues.into_iter().filter(|q| q.durable && !q.exclusive).collect();
        let bindings: Vec<Binding> = bindings
            .into_iter()
            .filter(|b| {
                let source_ok =
                    b.source.is_empty() || exchanges.iter().any(|e| e.name == b.source);
                let dest_ok = queues.iter().any(|q| q.name == b.destination);
                source_ok && dest_ok
            })
            .collect();

        let messages: Vec<(String, Message)> = self
            .log
            .replay()?
            .into_iter()
            .filter(|(queue, _)| queues.iter().any(|q| q.name == *queue))
            .collect();

        let survivors: Vec<(&str, &Message)> =
            messages.iter().map(|(q, m)| (q.as_str(), m)).collect();
        self.log.compact(survivors)?;

        info!(
            "recovered {} exchanges, {} queues, {} bindings, {} messages from {:?}",
            exchanges.len(),
            queues.len(),
            bindings.len(),
            messages.len(),
            self.data_dir
        );
        Ok(RecoveredState { exchanges, queues, bindings, messages })
    }

    /// Snapshot the durable exchanges.
    pub fn snapshot_exchanges<'a, I>(&self, exchanges: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a Exchange>,
    {
        let durable: Vec<&Exchange> =
            exchanges.into_iter().filter(|e| e.durable && !e.is_default).collect();
        self.write_snapshot(EXCHANGES_FILE, &durable)
    }

    /// Snapshot the durable queues.
    pub fn snapshot_queues<'a, I>(&self, queues: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a Queue>,
    {
        let durable: Vec<&Queue> = queues.into_iter().filter(|q| q.durable).collect();
        self.write_snapshot(QUEUES_FILE, &durable)
    }

    /// Snapshot the bindings whose destination queue is durable.
    /// `durable_queue` supplies that check.
    pub fn snapshot_bindings<'a, I>(
        &self,
        bindings: I,
        durable_queue: impl Fn(&str) -> bool,
    ) -> Result<()>
    where
        I: IntoIterator<Item = &'a Binding>,
    {
        let durable: Vec<&Binding> =
            bindings.into_iter().filter(|b| durable_queue(&b.destination)).collect();
        self.write_snapshot(BINDINGS_FILE, &durable)
    }

    /// Append a persistent message record; durable before return.
    pub fn append_message(&mut self, queue: &str, message: &Message) -> Result<()> {
        self.log.append_message(queue, message)
    }

    /// Append a delete record; durable before return.
    pub fn append_delete(&mut self, queue: &str, message_id: &str) -> Result<()> {
        self.log.append_delete(queue, message_id)
    }

    /// Rewrite the message log to exactly the given survivors.
    pub fn compact<'a, I>(&mut self, survivors: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a str, &'a Message)>,
    {
        self.log.compact(survivors)
    }

    /// Flush outstanding log writes. Called on shutdown.
    pub fn close(&mut self) -> Result<()> {
        self.log.flush()
    }

    fn write_snapshot<T: Serialize>(&self, name: &str, items: &[T]) -> Result<()> {
        let path = self.data_dir.join(name);
        let tmp_path = self.data_dir.join(format!("{}.tmp", name));
        {
            let file = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, items)?;
            writer.flush()?;
            writer.get_ref().sync_data()?;
        }
        fs::rename(&tmp_path, &path)?;
        debug!("wrote snapshot {:?}", path);
        Ok(())
    }

    fn load_snapshot<T: DeserializeOwned>(&self, name: &str) -> Result<Vec<T>> {
        let path = self.data_dir.join(name);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_reader(file)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::ExchangeType;
    use crate::protocol::{BasicProperties, FieldTable};
    use bytes::Bytes;

    fn exchange(name: &str, durable: bool) -> Exchange {
        Exchange {
            name: name.into(),
            kind: ExchangeType::Direct,
            durable,
            auto_delete: false,
            internal: false,
            arguments: FieldTable::new(),
            is_default: false,
        }
    }

    fn queue(name: &str, durable: bool, exclusive: bool) -> Queue {
        Queue {
            name: name.into(),
            durable,
            exclusive,
            auto_delete: false,
            arguments: FieldTable::new(),
            exclusive_connection: None,
        }
    }

    fn binding(source: &str, destination: &str) -> Binding {
        Binding {
            source: source.into(),
            destination: destination.into(),
            routing_key: "k".into(),
            arguments: FieldTable::new(),
        }
    }

    fn persistent_message(body: &str) -> Message {
        Message::new(
            "".into(),
            "d".into(),
            false,
            false,
            BasicProperties { delivery_mode: Some(2), ..Default::default() },
            Bytes::from(body.as_bytes().to_vec()),
        )
    }

    #[test]
    fn test_missing_snapshots_load_empty() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut persistence = Persistence::open(dir.path()).expect("Failed to open");
        let state = persistence.recover().expect("Failed to recover");
        assert!(state.exchanges.is_empty());
        assert!(state.queues.is_empty());
        assert!(state.bindings.is_empty());
        assert!(state.messages.is_empty());
    }

    #[test]
    fn test_recovery_filters_durable_entities() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut persistence = Persistence::open(dir.path()).expect("Failed to open");

        let exchanges = vec![exchange("keep", true)];
        persistence.snapshot_exchanges(exchanges.iter()).unwrap();

        // A non-durable queue never reaches the snapshot; an exclusive
        // durable one is filtered out at load time.
        let queues =
            vec![queue("d", true, false), queue("transient", false, false), {
                let mut q = queue("x", true, true);
                q.exclusive_connection = Some(1);
                q
            }];
        persistence.snapshot_queues(queues.iter()).unwrap();

        let bindings = vec![binding("keep", "d"), binding("keep", "x"), binding("gone", "d")];
        persistence
            .snapshot_bindings(bindings.iter(), |q| q == "d" || q == "x")
            .unwrap();

        let state = persistence.recover().expect("Failed to recover");
        assert_eq!(state.exchanges.len(), 1);
        assert_eq!(state.queues.len(), 1);
        assert_eq!(state.queues[0].name, "d");
        // "keep"->"x" loses its queue, "gone"->"d" loses its exchange.
        assert_eq!(state.bindings.len(), 1);
        assert!(state.bindings[0].matches_key("keep", "d", "k"));
    }

    #[test]
    fn test_recovery_replays_messages_into_surviving_queues() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut persistence = Persistence::open(dir.path()).expect("Failed to open");

        persistence.snapshot_queues([queue("d", true, false)].iter()).unwrap();

        let kept = persistent_message("keep");
        let acked = persistent_message("acked");
        let orphan = persistent_message("orphan");
        persistence.append_message("d", &kept).unwrap();
        persistence.append_message("d", &acked).unwrap();
        persistence.append_delete("d", &acked.id).unwrap();
        persistence.append_message("missing-queue", &orphan).unwrap();

        let state = persistence.recover().expect("Failed to recover");
        assert_eq!(state.messages.len(), 1);
        assert_eq!(state.messages[0].0, "d");
        assert_eq!(state.messages[0].1.content, Bytes::from("keep"));
    }

    #[test]
    fn test_snapshot_replaces_previous_contents() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let persistence = Persistence::open(dir.path()).expect("Failed to open");

        persistence
            .snapshot_exchanges([exchange("a", true), exchange("b", true)].iter())
            .unwrap();
        persistence.snapshot_exchanges([exchange("b", true)].iter()).unwrap();

        let loaded: Vec<Exchange> = persistence.load_snapshot(EXCHANGES_FILE).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "b");
        assert!(!dir.path().join(format!("{}.tmp", EXCHANGES_FILE)).exists());
    }

    #[test]
    fn test_default_exchanges_are_not_snapshotted() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let persistence = Persistence::open(dir.path()).expect("Failed to open");

        let mut builtin = exchange("amq.topic", true);
        builtin.is_default = true;
        persistence.snapshot_exchanges([builtin, exchange("mine", true)].iter()).unwrap();

        let loaded: Vec<Exchange> = persistence.load_snapshot(EXCHANGES_FILE).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "mine");
    }
}

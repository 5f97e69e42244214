//! Файловое хранилище: один JSON-lines журнал на беседу.
//!
//! ```text
//! <root>/
//! ├── keys/<hex(conversation_id)>.jsonl       # put / superseded, ключи обёрнуты MasterKey
//! └── messages/<hex(conversation_id)>.jsonl   # по строке на сообщение, sequence подряд
//! ```
//!
//! Каждая запись это одна строка, дописанная `write_all` + `sync_all` до
//! возврата `Ok`. При ошибке записи файл обрезается до прежней длины.
//! Журнал беседы читается в память при первом обращении; оборванная
//! последняя строка (сбой посреди записи) отбрасывается и обрезается,
//! повреждение в середине файла даёт `SerializationError`.
//!
//! Один процесс-писатель на корневой каталог: межпроцессной блокировки нет.

use crate::crypto::{Algorithm, KeyVersion, MasterKey, Sealed, SecureBuffer};
use crate::storage::memory::{find_active, find_version, page_newest_first, KeyChain, KeyRow};
use crate::storage::models::{ConversationKey, Message, SequenceNumber};
use crate::storage::{
    clamp_limit, ensure_conversation_keyed, ensure_key_exists, lock_poisoned, KeyStore,
    MessageStore,
};
use crate::utils::error::{ConclaveError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const LOG_EXTENSION: &str = "jsonl";

/// hex удваивает длину, имя файла ограничено 255 байтами
const MAX_CONVERSATION_ID_LEN: usize = 120;

fn log_path(dir: &Path, conversation_id: &str) -> Result<PathBuf> {
    if conversation_id.is_empty() || conversation_id.len() > MAX_CONVERSATION_ID_LEN {
        return Err(ConclaveError::InvalidInput(format!(
            "Conversation id must be 1..={} bytes",
            MAX_CONVERSATION_ID_LEN
        )));
    }
    Ok(dir.join(format!("{}.{}", hex::encode(conversation_id), LOG_EXTENSION)))
}

// ============================================================================
// Журнал с дозаписью
// ============================================================================

struct AppendLog {
    path: PathBuf,
    file: Option<File>,
    /// Длина подтверждённого содержимого
    len: u64,
}

impl AppendLog {
    /// Прочитать строки журнала. Оборванный хвост отрезается.
    fn replay(path: PathBuf) -> Result<(Self, Vec<String>)> {
        use tracing::warn;

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut lines = Vec::new();
        let mut good: u64 = 0;
        for segment in bytes.split_inclusive(|b| *b == b'\n') {
            if segment.last() != Some(&b'\n') {
                break;
            }
            let line = std::str::from_utf8(&segment[..segment.len() - 1]).map_err(|_| {
                ConclaveError::SerializationError(format!(
                    "Non UTF-8 line in {}",
                    path.display()
                ))
            })?;
            if !line.trim().is_empty() {
                lines.push(line.to_string());
            }
            good += segment.len() as u64;
        }

        if good < bytes.len() as u64 {
            warn!(
                target: "conclave::storage",
                path = %path.display(),
                dropped_bytes = bytes.len() as u64 - good,
                "Truncating torn trailing record"
            );
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(good)?;
            file.sync_all()?;
        }

        Ok((
            Self {
                path,
                file: None,
                len: good,
            },
            lines,
        ))
    }

    fn ensure_open(&mut self) -> Result<&mut File> {
        if self.file.is_none() {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            // Хвост от неудачной записи, которую не удалось обрезать
            if file.metadata()?.len() != self.len {
                file.set_len(self.len)?;
            }
            self.file = Some(file);
        }
        self.file
            .as_mut()
            .ok_or_else(|| ConclaveError::StorageError("Log file is not open".to_string()))
    }

    /// Дописать одну строку и дождаться `sync_all`.
    fn append(&mut self, line: &str) -> Result<()> {
        let mut record = Vec::with_capacity(line.len() + 1);
        record.extend_from_slice(line.as_bytes());
        record.push(b'\n');

        let prev_len = self.len;
        let file = self.ensure_open()?;
        let written = file.write_all(&record).and_then(|_| file.sync_all());

        match written {
            Ok(()) => {
                self.len = prev_len + record.len() as u64;
                Ok(())
            }
            Err(e) => {
                if let Some(file) = self.file.take() {
                    let _ = file.set_len(prev_len);
                }
                Err(ConclaveError::StorageError(format!(
                    "Append to {} failed: {}",
                    self.path.display(),
                    e
                )))
            }
        }
    }
}

/// Слоты бесед. Журнал загружается под мьютексом своей беседы, дальше
/// работа идёт под Mutex слота.
struct Slots<T> {
    dir: PathBuf,
    slots: DashMap<String, Arc<Mutex<T>>>,
    loaders: DashMap<String, Arc<Mutex<()>>>,
}

impl<T> Slots<T> {
    fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            slots: DashMap::new(),
            loaders: DashMap::new(),
        }
    }

    /// `None`, если журнала нет и `create == false`.
    fn get<F>(&self, conversation_id: &str, create: bool, load: F) -> Result<Option<Arc<Mutex<T>>>>
    where
        F: FnOnce(AppendLog, Vec<String>) -> Result<T>,
    {
        if let Some(slot) = self.slots.get(conversation_id) {
            return Ok(Some(Arc::clone(slot.value())));
        }

        let path = log_path(&self.dir, conversation_id)?;
        let loader = Arc::clone(
            self.loaders
                .entry(conversation_id.to_string())
                .or_default()
                .value(),
        );
        let loaded = self.load_under(&loader, conversation_id, path, create, load);

        // Мьютекс загрузки убирается, когда его больше никто не держит
        drop(loader);
        self.loaders
            .remove_if(conversation_id, |_, loader| Arc::strong_count(loader) == 1);
        loaded
    }

    fn load_under<F>(
        &self,
        loader: &Mutex<()>,
        conversation_id: &str,
        path: PathBuf,
        create: bool,
        load: F,
    ) -> Result<Option<Arc<Mutex<T>>>>
    where
        F: FnOnce(AppendLog, Vec<String>) -> Result<T>,
    {
        let _loading = loader.lock().map_err(|_| lock_poisoned("log loader"))?;
        if let Some(slot) = self.slots.get(conversation_id) {
            return Ok(Some(Arc::clone(slot.value())));
        }
        if !create && !path.exists() {
            return Ok(None);
        }

        let (log, lines) = AppendLog::replay(path)?;
        let slot = Arc::new(Mutex::new(load(log, lines)?));
        self.slots
            .insert(conversation_id.to_string(), Arc::clone(&slot));
        Ok(Some(slot))
    }
}

fn corrupt(path: &Path, line_no: usize, reason: impl std::fmt::Display) -> ConclaveError {
    ConclaveError::SerializationError(format!(
        "{} line {}: {}",
        path.display(),
        line_no + 1,
        reason
    ))
}

// ============================================================================
// Ключи
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum KeyLogRecord {
    Put {
        version: KeyVersion,
        /// nonce ‖ AES-256-GCM(MasterKey, material)
        #[serde(with = "crate::utils::b64::serde_bytes_b64")]
        wrapped: Vec<u8>,
        created_at: DateTime<Utc>,
    },
    Superseded {
        version: KeyVersion,
        at: DateTime<Utc>,
    },
}

struct KeyFile {
    log: AppendLog,
    chain: KeyChain,
}

/// `KeyStore` поверх файлов. Материал ключей на диске только в обёрнутом виде.
pub struct FileKeyStore {
    master_key: MasterKey,
    slots: Slots<KeyFile>,
}

impl FileKeyStore {
    pub fn open(root: impl AsRef<Path>, master_key: MasterKey) -> Result<Self> {
        let dir = root.as_ref().join("keys");
        fs::create_dir_all(&dir)?;
        Ok(Self {
            master_key,
            slots: Slots::new(dir),
        })
    }

    fn slot(&self, conversation_id: &str, create: bool) -> Result<Option<Arc<Mutex<KeyFile>>>> {
        self.slots.get(conversation_id, create, |log, lines| {
            let mut chain = KeyChain::new();
            for (line_no, line) in lines.iter().enumerate() {
                let record: KeyLogRecord =
                    serde_json::from_str(line).map_err(|e| corrupt(&log.path, line_no, e))?;
                match record {
                    KeyLogRecord::Put {
                        version,
                        wrapped,
                        created_at,
                    } => {
                        let material =
                            self.master_key
                                .unwrap_key(conversation_id, version, &wrapped)?;
                        let row = KeyRow {
                            material,
                            created_at,
                            superseded_at: None,
                        };
                        if chain.insert(version, row).is_some() {
                            return Err(corrupt(&log.path, line_no, "duplicate key version"));
                        }
                    }
                    KeyLogRecord::Superseded { version, at } => {
                        let row = chain
                            .get_mut(&version)
                            .ok_or_else(|| corrupt(&log.path, line_no, "unknown key version"))?;
                        row.superseded_at.get_or_insert(at);
                    }
                }
            }
            Ok(KeyFile { log, chain })
        })
    }
}

impl KeyStore for FileKeyStore {
    fn put(
        &self,
        conversation_id: &str,
        version: KeyVersion,
        material: &SecureBuffer,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        let slot = self
            .slot(conversation_id, true)?
            .ok_or_else(|| ConclaveError::StorageError("Key log not created".to_string()))?;
        let mut file = slot.lock().map_err(|_| lock_poisoned("key log"))?;

        if file.chain.contains_key(&version) {
            return Err(ConclaveError::DuplicateVersion {
                conversation_id: conversation_id.to_string(),
                version,
            });
        }

        let record = KeyLogRecord::Put {
            version,
            wrapped: self.master_key.wrap(conversation_id, version, material)?,
            created_at,
        };
        file.log.append(&serde_json::to_string(&record)?)?;
        file.chain.insert(
            version,
            KeyRow {
                material: material.duplicate(),
                created_at,
                superseded_at: None,
            },
        );
        Ok(())
    }

    fn get(&self, conversation_id: &str, version: KeyVersion) -> Result<ConversationKey> {
        let slot = self
            .slot(conversation_id, false)?
            .ok_or_else(|| ConclaveError::key_not_found(conversation_id, Some(version)))?;
        let file = slot.lock().map_err(|_| lock_poisoned("key log"))?;
        find_version(&file.chain, conversation_id, version)
    }

    fn get_active(&self, conversation_id: &str) -> Result<ConversationKey> {
        let slot = self
            .slot(conversation_id, false)?
            .ok_or_else(|| ConclaveError::key_not_found(conversation_id, None))?;
        let file = slot.lock().map_err(|_| lock_poisoned("key log"))?;
        find_active(&file.chain, conversation_id)
    }

    fn mark_superseded(
        &self,
        conversation_id: &str,
        version: KeyVersion,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let slot = self
            .slot(conversation_id, false)?
            .ok_or_else(|| ConclaveError::key_not_found(conversation_id, Some(version)))?;
        let mut file = slot.lock().map_err(|_| lock_poisoned("key log"))?;

        match file.chain.get(&version) {
            None => return Err(ConclaveError::key_not_found(conversation_id, Some(version))),
            Some(row) if row.superseded_at.is_some() => return Ok(()),
            Some(_) => {}
        }

        let record = KeyLogRecord::Superseded { version, at };
        file.log.append(&serde_json::to_string(&record)?)?;
        if let Some(row) = file.chain.get_mut(&version) {
            row.superseded_at = Some(at);
        }
        Ok(())
    }
}

// ============================================================================
// Сообщения
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct MessageRecord {
    sequence: SequenceNumber,
    sender_id: String,
    key_version: KeyVersion,
    algorithm: Algorithm,
    #[serde(with = "crate::utils::b64::serde_bytes_b64")]
    nonce: Vec<u8>,
    #[serde(with = "crate::utils::b64::serde_bytes_b64")]
    ciphertext: Vec<u8>,
    sent_at: DateTime<Utc>,
}

impl MessageRecord {
    fn into_message(self, conversation_id: &str) -> Message {
        Message {
            conversation_id: conversation_id.to_string(),
            sender_id: self.sender_id,
            sequence: self.sequence,
            key_version: self.key_version,
            algorithm: self.algorithm,
            nonce: self.nonce,
            ciphertext: self.ciphertext,
            sent_at: self.sent_at,
        }
    }
}

struct MessageFile {
    log: AppendLog,
    messages: Vec<Message>,
}

/// `MessageStore` поверх файлов. Счётчик sequence восстанавливается из журнала.
pub struct FileMessageStore {
    keys: Arc<dyn KeyStore>,
    max_page_size: usize,
    slots: Slots<MessageFile>,
}

impl FileMessageStore {
    pub fn open(
        root: impl AsRef<Path>,
        keys: Arc<dyn KeyStore>,
        max_page_size: usize,
    ) -> Result<Self> {
        let dir = root.as_ref().join("messages");
        fs::create_dir_all(&dir)?;
        Ok(Self {
            keys,
            max_page_size,
            slots: Slots::new(dir),
        })
    }

    fn slot(
        &self,
        conversation_id: &str,
        create: bool,
    ) -> Result<Option<Arc<Mutex<MessageFile>>>> {
        use tracing::debug;

        self.slots.get(conversation_id, create, |log, lines| {
            let mut messages = Vec::with_capacity(lines.len());
            for (line_no, line) in lines.iter().enumerate() {
                let record: MessageRecord =
                    serde_json::from_str(line).map_err(|e| corrupt(&log.path, line_no, e))?;
                let expected = messages.len() as SequenceNumber + 1;
                if record.sequence != expected {
                    return Err(corrupt(
                        &log.path,
                        line_no,
                        format!("sequence {} where {} expected", record.sequence, expected),
                    ));
                }
                messages.push(record.into_message(conversation_id));
            }

            debug!(
                target: "conclave::storage",
                conversation_id,
                messages = messages.len(),
                "Message log replayed"
            );
            Ok(MessageFile { log, messages })
        })
    }
}

impl MessageStore for FileMessageStore {
    fn append(
        &self,
        conversation_id: &str,
        sender_id: &str,
        key_version: KeyVersion,
        sealed: Sealed,
        sent_at: DateTime<Utc>,
    ) -> Result<Message> {
        ensure_key_exists(self.keys.as_ref(), conversation_id, key_version)?;

        let slot = self
            .slot(conversation_id, true)?
            .ok_or_else(|| ConclaveError::StorageError("Message log not created".to_string()))?;
        let mut file = slot.lock().map_err(|_| lock_poisoned("message log"))?;

        let record = MessageRecord {
            sequence: file.messages.len() as SequenceNumber + 1,
            sender_id: sender_id.to_string(),
            key_version,
            algorithm: sealed.algorithm,
            nonce: sealed.nonce,
            ciphertext: sealed.ciphertext,
            sent_at,
        };
        file.log.append(&serde_json::to_string(&record)?)?;

        let message = record.into_message(conversation_id);
        file.messages.push(message.clone());
        Ok(message)
    }

    fn fetch(
        &self,
        conversation_id: &str,
        before: Option<SequenceNumber>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        ensure_conversation_keyed(self.keys.as_ref(), conversation_id)?;

        let slot = match self.slot(conversation_id, false)? {
            Some(slot) => slot,
            None => return Ok(Vec::new()),
        };
        let file = slot.lock().map_err(|_| lock_poisoned("message log"))?;
        Ok(page_newest_first(
            &file.messages,
            before,
            clamp_limit(limit, self.max_page_size),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    fn master() -> MasterKey {
        MasterKey::from_bytes([9u8; 32])
    }

    fn sealed(byte: u8) -> Sealed {
        Sealed {
            algorithm: Algorithm::Aes256Gcm,
            nonce: vec![byte; 12],
            ciphertext: vec![byte; 24],
        }
    }

    fn open_stores(root: &Path) -> (Arc<FileKeyStore>, FileMessageStore) {
        let keys = Arc::new(FileKeyStore::open(root, master()).unwrap());
        let messages = FileMessageStore::open(root, keys.clone(), 50).unwrap();
        (keys, messages)
    }

    #[test]
    fn test_keys_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let v1 = SecureBuffer::copy_from_slice(&[0xAB; 32]);
        let v2 = SecureBuffer::copy_from_slice(&[0xCD; 32]);
        {
            let (keys, _) = open_stores(dir.path());
            keys.put("conv1", 1, &v1, Utc::now()).unwrap();
            keys.put("conv1", 2, &v2, Utc::now()).unwrap();
            keys.mark_superseded("conv1", 1, Utc::now()).unwrap();
        }

        let (keys, _) = open_stores(dir.path());
        let active = keys.get_active("conv1").unwrap();
        assert_eq!(active.version, 2);
        assert_eq!(active.material(), &v2);
        assert!(!keys.get("conv1", 1).unwrap().is_active());
        assert_eq!(keys.get("conv1", 1).unwrap().material(), &v1);
    }

    #[test]
    fn test_key_material_is_not_stored_in_clear() {
        let dir = TempDir::new().unwrap();
        let (keys, _) = open_stores(dir.path());
        let material = SecureBuffer::copy_from_slice(&[0x5A; 32]);
        keys.put("conv1", 1, &material, Utc::now()).unwrap();

        let raw = fs::read(log_path(&dir.path().join("keys"), "conv1").unwrap()).unwrap();
        let text = String::from_utf8(raw).unwrap();
        assert!(!text.contains(&crate::utils::b64::encode(material.as_slice())));
        assert!(!text.contains(&hex::encode(material.as_slice())));
    }

    #[test]
    fn test_wrong_master_key_cannot_load_keys() {
        let dir = TempDir::new().unwrap();
        {
            let (keys, _) = open_stores(dir.path());
            keys.put("conv1", 1, &SecureBuffer::zeroed(32), Utc::now())
                .unwrap();
        }

        let keys = FileKeyStore::open(dir.path(), MasterKey::from_bytes([1u8; 32])).unwrap();
        assert!(matches!(
            keys.get_active("conv1"),
            Err(ConclaveError::CryptoError(_))
        ));
    }

    #[test]
    fn test_sequence_continues_after_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let (keys, messages) = open_stores(dir.path());
            keys.put("conv1", 1, &SecureBuffer::zeroed(32), Utc::now())
                .unwrap();
            messages.append("conv1", "alice", 1, sealed(1), Utc::now()).unwrap();
            messages.append("conv1", "bob", 1, sealed(2), Utc::now()).unwrap();
        }

        let (_keys, messages) = open_stores(dir.path());
        let third = messages.append("conv1", "alice", 1, sealed(3), Utc::now()).unwrap();
        assert_eq!(third.sequence, 3);

        let page = messages.fetch("conv1", None, 10).unwrap();
        let sequences: Vec<_> = page.iter().map(|m| m.sequence).collect();
        assert_eq!(sequences, vec![3, 2, 1]);
        assert_eq!(page[1].sender_id, "bob");
        assert_eq!(page[1].ciphertext, vec![2u8; 24]);
    }

    #[test]
    fn test_torn_trailing_record_is_dropped() {
        let dir = TempDir::new().unwrap();
        let path = log_path(&dir.path().join("messages"), "conv1").unwrap();
        {
            let (keys, messages) = open_stores(dir.path());
            keys.put("conv1", 1, &SecureBuffer::zeroed(32), Utc::now())
                .unwrap();
            messages.append("conv1", "alice", 1, sealed(1), Utc::now()).unwrap();
        }
        let intact_len = fs::metadata(&path).unwrap().len();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(br#"{"sequence":2,"sender_id":"al"#).unwrap();
        }

        let (_keys, messages) = open_stores(dir.path());
        assert_eq!(messages.fetch("conv1", None, 10).unwrap().len(), 1);
        assert_eq!(fs::metadata(&path).unwrap().len(), intact_len);

        let next = messages.append("conv1", "alice", 1, sealed(2), Utc::now()).unwrap();
        assert_eq!(next.sequence, 2);
    }

    #[test]
    fn test_corruption_mid_log_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = log_path(&dir.path().join("messages"), "conv1").unwrap();
        {
            let (keys, messages) = open_stores(dir.path());
            keys.put("conv1", 1, &SecureBuffer::zeroed(32), Utc::now())
                .unwrap();
            messages.append("conv1", "alice", 1, sealed(1), Utc::now()).unwrap();
        }
        let original = fs::read_to_string(&path).unwrap();
        fs::write(&path, format!("not json\n{}", original)).unwrap();

        let (_keys, messages) = open_stores(dir.path());
        assert!(matches!(
            messages.fetch("conv1", None, 10),
            Err(ConclaveError::SerializationError(_))
        ));
    }

    #[test]
    fn test_unknown_conversation_reads_create_nothing() {
        let dir = TempDir::new().unwrap();
        let (keys, _) = open_stores(dir.path());

        assert!(matches!(
            keys.get_active("ghost"),
            Err(ConclaveError::KeyNotFound { .. })
        ));
        assert!(!log_path(&dir.path().join("keys"), "ghost")
            .unwrap()
            .exists());
    }

    #[test]
    fn test_overlong_conversation_id_rejected() {
        let dir = TempDir::new().unwrap();
        let (keys, _) = open_stores(dir.path());
        let id = "x".repeat(MAX_CONVERSATION_ID_LEN + 1);

        let err = keys
            .put(&id, 1, &SecureBuffer::zeroed(32), Utc::now())
            .unwrap_err();
        assert!(matches!(err, ConclaveError::InvalidInput(_)));
    }

    #[test]
    fn test_loading_one_conversation_does_not_block_another() {
        let dir = TempDir::new().unwrap();
        {
            let (keys, _) = open_stores(dir.path());
            keys.put("conv2", 1, &SecureBuffer::zeroed(32), Utc::now())
                .unwrap();
        }
        let (keys, _) = open_stores(dir.path());

        // Загрузка conv1 держит свой мьютекс
        let stuck = Arc::clone(
            keys.slots
                .loaders
                .entry("conv1".to_string())
                .or_default()
                .value(),
        );
        let _loading = stuck.lock().unwrap();

        let (tx, rx) = mpsc::channel();
        let reader = keys.clone();
        thread::spawn(move || {
            let _ = tx.send(reader.get_active("conv2").map(|key| key.version));
        });
        let version = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("conv2 waited for conv1")
            .unwrap();
        assert_eq!(version, 1);
        assert!(keys.slots.loaders.get("conv2").is_none());
    }
}

//! Persistence context shared by the reconciliation engine, the dispatcher and
//! any number of readers.
//!
//! Writes go through [`Store::write`], which runs a closure against a
//! [`Transaction`]. The transaction keeps an undo log of everything it touched;
//! if the closure fails or the backend refuses the save, the log is replayed and
//! the model is left exactly as it was.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, RwLockReadGuard, broadcast};
use tracing::{debug, info, warn};

use crate::config::SectionKind;
use crate::error::{PersistenceError, Result};
use crate::state::{ChannelRecord, MeshModel, MessageRecord, Node};

/// Where the model lives between runs.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// `None` when nothing has been saved yet.
    async fn load(&self) -> Result<Option<MeshModel>, PersistenceError>;
    async fn save(&self, model: &MeshModel) -> Result<(), PersistenceError>;
}

/// Keeps the last saved model in memory. Used by tests and `--simulate`.
#[derive(Default)]
pub struct MemoryBackend {
    saved: Mutex<Option<MeshModel>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(model: MeshModel) -> Self {
        Self {
            saved: Mutex::new(Some(model)),
        }
    }
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    async fn load(&self) -> Result<Option<MeshModel>, PersistenceError> {
        Ok(self.saved.lock().await.clone())
    }

    async fn save(&self, model: &MeshModel) -> Result<(), PersistenceError> {
        *self.saved.lock().await = Some(model.clone());
        Ok(())
    }
}

/// A single JSON document on disk, replaced atomically on every save.
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StoreBackend for JsonFileBackend {
    async fn load(&self) -> Result<Option<MeshModel>, PersistenceError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, model: &MeshModel) -> Result<(), PersistenceError> {
        let bytes = serde_json::to_vec_pretty(model)?;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// Published after a transaction commits.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreChange {
    NodeUpdated(u32),
    PositionAdded(u32),
    TelemetryAdded(u32),
    ConfigUpdated { node: u32, kind: SectionKind },
    MessageAdded(u32),
    MessageUpdated(u32),
    ChannelUpdated(u32),
    PositionsCleared(u32),
    TelemetryCleared(u32),
    MessagesDeleted(usize),
    Cleared,
}

#[derive(Default)]
struct UndoLog {
    /// Prior state of every node touched; `None` means it did not exist.
    nodes: BTreeMap<u32, Option<Node>>,
    messages: Option<Vec<MessageRecord>>,
    channels: Option<Vec<ChannelRecord>>,
    my_node_num: Option<Option<u32>>,
}

/// Mutable view of the model inside [`Store::write`].
pub struct Transaction<'a> {
    model: &'a mut MeshModel,
    undo: UndoLog,
    changes: Vec<StoreChange>,
}

impl<'a> Transaction<'a> {
    fn new(model: &'a mut MeshModel) -> Self {
        Self {
            model,
            undo: UndoLog::default(),
            changes: Vec::new(),
        }
    }

    pub fn model(&self) -> &MeshModel {
        self.model
    }

    pub fn node(&self, num: u32) -> Option<&Node> {
        self.model.nodes.get(&num)
    }

    fn remember_node(&mut self, num: u32) {
        if !self.undo.nodes.contains_key(&num) {
            let prior = self.model.nodes.get(&num).cloned();
            self.undo.nodes.insert(num, prior);
        }
    }

    pub fn node_mut(&mut self, num: u32) -> Option<&mut Node> {
        if !self.model.nodes.contains_key(&num) {
            return None;
        }
        self.remember_node(num);
        self.model.nodes.get_mut(&num)
    }

    /// Fetch the node, creating an empty one if this is the first reference.
    pub fn node_or_insert(&mut self, num: u32) -> &mut Node {
        self.remember_node(num);
        self.model.nodes.entry(num).or_insert_with(|| {
            debug!("Creating node {num:08x}");
            Node::new(num)
        })
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        let nums: Vec<u32> = self.model.nodes.keys().copied().collect();
        for num in nums {
            self.remember_node(num);
        }
        self.model.nodes.values_mut()
    }

    pub fn messages_mut(&mut self) -> &mut Vec<MessageRecord> {
        if self.undo.messages.is_none() {
            self.undo.messages = Some(self.model.messages.clone());
        }
        &mut self.model.messages
    }

    pub fn channels_mut(&mut self) -> &mut Vec<ChannelRecord> {
        if self.undo.channels.is_none() {
            self.undo.channels = Some(self.model.channels.clone());
        }
        &mut self.model.channels
    }

    pub fn set_my_node_num(&mut self, num: u32) {
        if self.undo.my_node_num.is_none() {
            self.undo.my_node_num = Some(self.model.my_node_num);
        }
        self.model.my_node_num = Some(num);
    }

    /// Drop every node, message and channel.
    pub fn clear(&mut self) {
        let nums: Vec<u32> = self.model.nodes.keys().copied().collect();
        for num in nums {
            self.remember_node(num);
        }
        self.model.nodes.clear();
        self.messages_mut().clear();
        self.channels_mut().clear();
        if self.undo.my_node_num.is_none() {
            self.undo.my_node_num = Some(self.model.my_node_num);
        }
        self.model.my_node_num = None;
    }

    pub fn notify(&mut self, change: StoreChange) {
        self.changes.push(change);
    }

    fn is_dirty(&self) -> bool {
        !self.undo.nodes.is_empty()
            || self.undo.messages.is_some()
            || self.undo.channels.is_some()
            || self.undo.my_node_num.is_some()
    }

    fn rollback(self) {
        let Transaction { model, undo, .. } = self;
        for (num, prior) in undo.nodes {
            match prior {
                Some(node) => {
                    model.nodes.insert(num, node);
                }
                None => {
                    model.nodes.remove(&num);
                }
            }
        }
        if let Some(messages) = undo.messages {
            model.messages = messages;
        }
        if let Some(channels) = undo.channels {
            model.channels = channels;
        }
        if let Some(my_node_num) = undo.my_node_num {
            model.my_node_num = my_node_num;
        }
    }
}

/// Cloneable handle to the shared model.
#[derive(Clone)]
pub struct Store {
    model: Arc<RwLock<MeshModel>>,
    backend: Arc<dyn StoreBackend>,
    changes: broadcast::Sender<StoreChange>,
}

impl Store {
    /// Load the model from `backend`, starting empty if it holds nothing.
    pub async fn open(backend: impl StoreBackend + 'static) -> Result<Self> {
        let model = backend.load().await?.unwrap_or_default();
        info!(
            "Opened store with {} nodes and {} messages",
            model.nodes.len(),
            model.messages.len()
        );
        let (changes, _) = broadcast::channel(256);
        Ok(Self {
            model: Arc::new(RwLock::new(model)),
            backend: Arc::new(backend),
            changes,
        })
    }

    pub async fn in_memory() -> Result<Self> {
        Self::open(MemoryBackend::new()).await
    }

    /// Flush the current model to the backend.
    pub async fn close(&self) -> Result<()> {
        let model = self.model.read().await;
        self.backend.save(&model).await?;
        info!("Store flushed");
        Ok(())
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, MeshModel> {
        self.model.read().await
    }

    pub async fn snapshot(&self) -> MeshModel {
        self.model.read().await.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    /// Run `f` as one atomic unit: committed and saved, or fully undone.
    pub async fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T>,
    {
        let mut guard = self.model.write().await;
        let mut tx = Transaction::new(&mut guard);

        let value = match f(&mut tx) {
            Ok(value) => value,
            Err(e) => {
                tx.rollback();
                return Err(e);
            }
        };

        if !tx.is_dirty() {
            return Ok(value);
        }

        if let Err(e) = self.backend.save(tx.model()).await {
            warn!("Store save failed, rolling back: {e}");
            tx.rollback();
            return Err(e.into());
        }

        let changes = std::mem::take(&mut tx.changes);
        drop(tx);
        drop(guard);
        for change in changes {
            // No subscribers is fine.
            let _ = self.changes.send(change);
        }
        Ok(value)
    }
}

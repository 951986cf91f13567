//! # Persistent State Store
//!
//! [`PotStore`] exclusively owns every [`PotState`]. Other components work
//! on snapshots or submit mutations; nobody holds a live reference.
//!
//! ## Locking
//!
//! ```text
//! mutate(pot, f).await
//!   ├── pot writer gate          (async, per pot; different pots never contend)
//!   ├── f(&mut clone)            (on error: nothing changes)
//!   ├── save gate                (async; writer gate → save gate, never reversed)
//!   │     ├── image = document ⊕ clone
//!   │     └── spawn_blocking(backend.save(image))   (on error: image restored)
//!   └── publish clone into slot
//! ```
//!
//! The gates are `tokio` mutexes and may be held across the save. The
//! published state and the document image sit behind `parking_lot`
//! mutexes that are only held for a clone and never across an `.await`,
//! so snapshots never wait on disk I/O.
//!
//! ## Durability
//!
//! [`FileBackend`] writes `{path}.tmp`, fsyncs it, renames it over `{path}`
//! and fsyncs the parent directory, so a crash leaves either the old or the
//! new document and a completed save survives power loss.
//! An unparseable document is copied aside to `{path}.corrupt-<unix-ts>`
//! and replaced by an empty one.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};

use rapidpot_common::{LedgerDocument, PotConfig, PotId, PotState};

use crate::error::{StateError, StoreError};

// ════════════════════════════════════════════════════════════════════════════════
// BACKENDS
// ════════════════════════════════════════════════════════════════════════════════

/// Durable home of the [`LedgerDocument`].
pub trait StateBackend: Send + Sync {
    fn load(&self) -> Result<LedgerDocument, StoreError>;
    fn save(&self, document: &LedgerDocument) -> Result<(), StoreError>;
}

/// JSON file backend with atomic replace.
#[derive(Debug, Clone)]
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name: OsString = self.path.as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    }

    /// Copies a damaged document aside so it can be inspected later.
    fn quarantine(&self) -> Result<PathBuf, StoreError> {
        let target = self.sibling(&format!(".corrupt-{}", chrono::Utc::now().timestamp()));
        fs::copy(&self.path, &target)?;
        Ok(target)
    }
}

impl StateBackend for FileBackend {
    fn load(&self) -> Result<LedgerDocument, StoreError> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "state file missing; creating empty document");
            let doc = LedgerDocument::default();
            self.save(&doc)?;
            return Ok(doc);
        }

        let bytes = fs::read(&self.path)?;
        match LedgerDocument::from_json_slice(&bytes) {
            Ok((doc, migrated)) => {
                if migrated {
                    info!(
                        path = %self.path.display(),
                        version = doc.version,
                        "state document migrated"
                    );
                    self.save(&doc)?;
                }
                Ok(doc)
            }
            Err(e) => {
                let copy = self.quarantine()?;
                error!(
                    path = %self.path.display(),
                    quarantined = %copy.display(),
                    error = %e,
                    "state document unreadable; starting from an empty document"
                );
                let doc = LedgerDocument::default();
                self.save(&doc)?;
                Ok(doc)
            }
        }
    }

    fn save(&self, document: &LedgerDocument) -> Result<(), StoreError> {
        let data = document.to_json_vec()?;
        let tmp_path = self.sibling(".tmp");

        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }

        fs::rename(&tmp_path, &self.path)?;
        sync_parent_dir(&self.path)?;
        Ok(())
    }
}

/// Makes a completed rename durable.
#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> Result<(), StoreError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::File::open(parent)?.sync_all()?;
    Ok(())
}

// Directory handles cannot be fsynced here; the rename is as durable as
// the platform makes it.
#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

/// In-memory backend holding the serialized document. For tests.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    bytes: Mutex<Option<Vec<u8>>>,
    /// Saves still allowed before writes start failing; `None` = unlimited.
    save_budget: Mutex<Option<u64>>,
    saves: Mutex<u64>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from an already-serialized document.
    pub fn with_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Mutex::new(Some(bytes)),
            ..Self::default()
        }
    }

    pub fn bytes(&self) -> Option<Vec<u8>> {
        self.bytes.lock().clone()
    }

    /// Makes every subsequent save fail with an I/O error.
    pub fn set_fail_saves(&self, fail: bool) {
        *self.save_budget.lock() = if fail { Some(0) } else { None };
    }

    /// Lets `n` more saves succeed, then fails every later one.
    pub fn fail_saves_after(&self, n: u64) {
        *self.save_budget.lock() = Some(n);
    }

    pub fn save_count(&self) -> u64 {
        *self.saves.lock()
    }
}

impl StateBackend for MemoryBackend {
    fn load(&self) -> Result<LedgerDocument, StoreError> {
        match self.bytes.lock().as_deref() {
            Some(bytes) => Ok(LedgerDocument::from_json_slice(bytes)?.0),
            None => Ok(LedgerDocument::default()),
        }
    }

    fn save(&self, document: &LedgerDocument) -> Result<(), StoreError> {
        {
            let mut budget = self.save_budget.lock();
            match budget.as_mut() {
                Some(0) => return Err(StoreError::Io("simulated write failure".to_string())),
                Some(n) => *n -= 1,
                None => {}
            }
        }
        *self.bytes.lock() = Some(document.to_json_vec()?);
        *self.saves.lock() += 1;
        Ok(())
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// POT STORE
// ════════════════════════════════════════════════════════════════════════════════

/// One configured pot: the published state plus the gate that orders its
/// writers.
struct Slot {
    /// Held for the whole read-modify-save-publish cycle of one mutation.
    writer: AsyncMutex<()>,
    live: Mutex<PotState>,
}

/// Live per-pot state plus the persisted document image.
pub struct PotStore {
    backend: Arc<dyn StateBackend>,
    slots: BTreeMap<PotId, Slot>,
    /// Last image handed to the backend. Also carries pots that are no
    /// longer configured so that saving never drops their data.
    document: Mutex<LedgerDocument>,
    /// Orders saves so that images reach the backend in the order they
    /// were built.
    save_gate: AsyncMutex<()>,
}

impl std::fmt::Debug for PotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PotStore")
            .field("pots", &self.slots.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl PotStore {
    /// Loads the document and creates one slot per configured pot.
    pub fn open(backend: Arc<dyn StateBackend>, pots: &[PotConfig]) -> Result<Self, StoreError> {
        let mut document = backend.load()?;

        for id in document.pots.keys() {
            if !pots.iter().any(|p| &p.id == id) {
                warn!(pot = %id, "persisted pot is not configured; kept but not served");
            }
        }

        let mut slots = BTreeMap::new();
        for pot in pots {
            let state = document.pots.entry(pot.id.clone()).or_default().clone();
            slots.insert(
                pot.id.clone(),
                Slot {
                    writer: AsyncMutex::new(()),
                    live: Mutex::new(state),
                },
            );
        }

        Ok(Self {
            backend,
            slots,
            document: Mutex::new(document),
            save_gate: AsyncMutex::new(()),
        })
    }

    pub fn contains(&self, pot: &str) -> bool {
        self.slots.contains_key(pot)
    }

    pub fn pot_ids(&self) -> impl Iterator<Item = &PotId> {
        self.slots.keys()
    }

    fn slot(&self, pot: &str) -> Result<&Slot, StateError> {
        self.slots
            .get(pot)
            .ok_or_else(|| StateError::UnknownPot(pot.to_string()))
    }

    /// Clone of a pot's current state.
    pub fn snapshot(&self, pot: &str) -> Result<PotState, StateError> {
        Ok(self.slot(pot)?.live.lock().clone())
    }

    /// Hands `image` to the backend on the blocking pool.
    async fn save_image(&self, image: LedgerDocument) -> Result<(), StoreError> {
        let backend = Arc::clone(&self.backend);
        tokio::task::spawn_blocking(move || backend.save(&image))
            .await
            .map_err(|e| StoreError::Io(format!("state save task failed: {}", e)))?
    }

    /// Applies `f` to a copy of the pot's state, persists, then publishes.
    ///
    /// If `f` fails or the save fails, the live state is left untouched.
    /// A mutation that changes nothing is not written. Readers see the old
    /// state until the save has completed.
    pub async fn mutate<T, E, F>(&self, pot: &str, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut PotState) -> Result<T, E>,
        E: From<StateError> + From<StoreError>,
    {
        let slot = self.slot(pot)?;
        let _writer = slot.writer.lock().await;

        let current = slot.live.lock().clone();
        let mut next = current.clone();
        let value = f(&mut next)?;
        if next == current {
            return Ok(value);
        }

        {
            let _save = self.save_gate.lock().await;
            let image = {
                let mut document = self.document.lock();
                document.pots.insert(pot.to_string(), next.clone());
                document.clone()
            };
            if let Err(e) = self.save_image(image).await {
                self.document.lock().pots.insert(pot.to_string(), current);
                return Err(e.into());
            }
        }

        *slot.live.lock() = next;
        Ok(value)
    }

    /// Mutates the live state without persisting it.
    ///
    /// Only for recording facts that must be visible even though the
    /// backend just refused a write. The next successful [`mutate`] on the
    /// pot persists them.
    ///
    /// [`mutate`]: PotStore::mutate
    pub async fn mutate_volatile<T>(
        &self,
        pot: &str,
        f: impl FnOnce(&mut PotState) -> T,
    ) -> Result<T, StateError> {
        let slot = self.slot(pot)?;
        let _writer = slot.writer.lock().await;
        let mut live = slot.live.lock();
        Ok(f(&mut live))
    }

    /// Every transfer reference ever credited, retired pots included.
    pub fn spent_references(&self) -> Vec<String> {
        self.document
            .lock()
            .pots
            .values()
            .flat_map(|pot| pot.spent_references.iter().cloned())
            .collect()
    }

    /// Writes the current image again. Used after startup recovery and on
    /// shutdown.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let _save = self.save_gate.lock().await;
        let image = {
            let mut document = self.document.lock();
            for (id, slot) in &self.slots {
                document.pots.insert(id.clone(), slot.live.lock().clone());
            }
            document.clone()
        };
        self.save_image(image).await
    }
}

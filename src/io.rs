use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use image::codecs::png::PngEncoder;
use image::{ImageEncoder, ImageFormat};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::canvas::{LayerName, MAX_SURFACE_DIM, Surface};
use crate::error::{EngineError, EngineResult};

// ============================================================================
// LAYER SNAPSHOT FORMAT
// ============================================================================

/// Magic header of an encoded layer snapshot.
pub const SNAPSHOT_MAGIC: &str = "LBS1";

/// On-disk envelope: bincode header around a lossless PNG payload.
#[derive(Serialize, Deserialize)]
struct SnapshotEnvelope {
    magic: String,
    layer: LayerName,
    width: u32,
    height: u32,
    png: Vec<u8>,
}

/// One persisted layer as handed to a [`PersistenceAdapter`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedLayer {
    pub layer: LayerName,
    pub bytes: Vec<u8>,
}

/// All persisted layers of one object, produced on commit or explicit save.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectSnapshot {
    pub object: Uuid,
    pub layers: Vec<EncodedLayer>,
}

/// Raw copies of an object's persisted layers, cheap to take on the input
/// thread. Encoding happens when the capture is written.
#[derive(Clone, Debug, PartialEq)]
pub struct LayerCapture {
    pub object: Uuid,
    pub layers: Vec<(LayerName, Surface)>,
}

impl LayerCapture {
    pub fn encode(&self) -> EngineResult<ObjectSnapshot> {
        let layers = self
            .layers
            .iter()
            .map(|(name, surface)| encode_layer(*name, surface))
            .collect::<EngineResult<Vec<_>>>()?;
        Ok(ObjectSnapshot { object: self.object, layers })
    }
}

pub fn encode_png(surface: &Surface) -> EngineResult<Vec<u8>> {
    let mut png = Vec::new();
    PngEncoder::new(&mut png).write_image(
        surface.as_raw(),
        surface.width(),
        surface.height(),
        image::ColorType::Rgba8,
    )?;
    Ok(png)
}

/// Encode one layer. Only persisted layers are accepted.
pub fn encode_layer(layer: LayerName, surface: &Surface) -> EngineResult<EncodedLayer> {
    if !layer.is_persisted() {
        return Err(EngineError::validation(format!("layer '{}' is never persisted", layer.as_str())));
    }
    let envelope = SnapshotEnvelope {
        magic: SNAPSHOT_MAGIC.to_string(),
        layer,
        width: surface.width(),
        height: surface.height(),
        png: encode_png(surface)?,
    };
    Ok(EncodedLayer { layer, bytes: bincode::serialize(&envelope)? })
}

/// Decode an encoded layer back into a surface. The header is checked
/// before the payload is decoded, and the payload must match it exactly.
pub fn decode_layer(bytes: &[u8]) -> EngineResult<(LayerName, Surface)> {
    let envelope: SnapshotEnvelope = bincode::deserialize(bytes)?;
    if envelope.magic != SNAPSHOT_MAGIC {
        return Err(EngineError::codec(format!("unknown snapshot magic '{}'", envelope.magic)));
    }
    if !envelope.layer.is_persisted() {
        return Err(EngineError::codec(format!(
            "snapshot carries non-persisted layer '{}'",
            envelope.layer.as_str()
        )));
    }
    if envelope.width == 0 || envelope.height == 0 {
        return Err(EngineError::codec("snapshot dimensions cannot be zero"));
    }
    if envelope.width > MAX_SURFACE_DIM || envelope.height > MAX_SURFACE_DIM {
        return Err(EngineError::codec(format!(
            "snapshot size {}x{} exceeds maximum allowed {}x{}",
            envelope.width, envelope.height, MAX_SURFACE_DIM, MAX_SURFACE_DIM
        )));
    }

    let surface = image::load_from_memory_with_format(&envelope.png, ImageFormat::Png)?.to_rgba8();
    if surface.dimensions() != (envelope.width, envelope.height) {
        return Err(EngineError::codec(format!(
            "snapshot payload is {}x{}, header says {}x{}",
            surface.width(),
            surface.height(),
            envelope.width,
            envelope.height
        )));
    }
    Ok((envelope.layer, surface))
}

// ============================================================================
// IMAGE FILES (CLI)
// ============================================================================

pub fn read_png(path: &Path) -> EngineResult<Surface> {
    let bytes = std::fs::read(path)?;
    Ok(image::load_from_memory_with_format(&bytes, ImageFormat::Png)?.to_rgba8())
}

pub fn write_png(surface: &Surface, path: &Path) -> EngineResult<()> {
    let file = File::create(path)?;
    let writer = BufWriter::new(file);
    PngEncoder::new(writer).write_image(
        surface.as_raw(),
        surface.width(),
        surface.height(),
        image::ColorType::Rgba8,
    )?;
    Ok(())
}

// ============================================================================
// PERSISTENCE ADAPTER
// ============================================================================

/// Storage collaborator. Retrying failed saves is the adapter's business;
/// the engine keeps its in-memory layers authoritative either way.
pub trait PersistenceAdapter: Send + Sync {
    fn save(&self, snapshot: &ObjectSnapshot) -> EngineResult<()>;

    /// Encoded layers stored for `object`. Missing layers are simply absent.
    fn load(&self, object: Uuid) -> EngineResult<Vec<EncodedLayer>>;
}

/// Stores each layer as `<root>/<object-id>/<layer>.lbs`.
pub struct DirectoryAdapter {
    root: PathBuf,
}

impl DirectoryAdapter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_dir(&self, object: Uuid) -> PathBuf {
        self.root.join(object.to_string())
    }
}

impl PersistenceAdapter for DirectoryAdapter {
    fn save(&self, snapshot: &ObjectSnapshot) -> EngineResult<()> {
        let dir = self.object_dir(snapshot.object);
        std::fs::create_dir_all(&dir)
            .map_err(|e| EngineError::persistence(format!("cannot create {}: {}", dir.display(), e)))?;
        for layer in &snapshot.layers {
            let path = dir.join(format!("{}.lbs", layer.layer.as_str()));
            let tmp = path.with_extension("lbs.tmp");
            std::fs::write(&tmp, &layer.bytes)
                .and_then(|_| std::fs::rename(&tmp, &path))
                .map_err(|e| EngineError::persistence(format!("cannot write {}: {}", path.display(), e)))?;
        }
        Ok(())
    }

    fn load(&self, object: Uuid) -> EngineResult<Vec<EncodedLayer>> {
        let dir = self.object_dir(object);
        let mut out = Vec::new();
        for layer in LayerName::PERSISTED {
            let path = dir.join(format!("{}.lbs", layer.as_str()));
            match std::fs::read(&path) {
                Ok(bytes) => out.push(EncodedLayer { layer, bytes }),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(EngineError::persistence(format!("cannot read {}: {}", path.display(), e)));
                }
            }
        }
        Ok(out)
    }
}

/// Keeps the latest snapshot per object in memory.
#[derive(Default)]
pub struct MemoryAdapter {
    store: Mutex<HashMap<Uuid, Vec<EncodedLayer>>>,
    saves: Mutex<usize>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `save` calls that reached this adapter.
    pub fn save_count(&self) -> usize {
        *lock(&self.saves)
    }
}

impl PersistenceAdapter for MemoryAdapter {
    fn save(&self, snapshot: &ObjectSnapshot) -> EngineResult<()> {
        lock(&self.store).insert(snapshot.object, snapshot.layers.clone());
        *lock(&self.saves) += 1;
        Ok(())
    }

    fn load(&self, object: Uuid) -> EngineResult<Vec<EncodedLayer>> {
        Ok(lock(&self.store).get(&object).cloned().unwrap_or_default())
    }
}

/// A poisoned lock only means another thread panicked mid-save; the data
/// it guards is still a complete value.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// COALESCING SAVE QUEUE
// ============================================================================

/// Counters reported by [`SaveQueue::stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SaveStats {
    pub enqueued: usize,
    /// Captures replaced by a newer one before being written.
    pub coalesced: usize,
    pub saved: usize,
    pub failed: usize,
}

#[derive(Default)]
struct QueueState {
    pending: HashMap<Uuid, LayerCapture>,
    order: VecDeque<Uuid>,
    /// Objects whose latest write failed, until reported or rewritten.
    failed: HashSet<Uuid>,
    in_flight: usize,
    shutdown: bool,
    stats: SaveStats,
}

#[derive(Default)]
struct QueueShared {
    state: Mutex<QueueState>,
    wake: Condvar,
    idle: Condvar,
}

/// Background writer. At most one capture per object waits in the queue;
/// a newer capture replaces the waiting one, so the backlog never grows
/// beyond the number of objects. Captures are PNG-encoded on the worker.
pub struct SaveQueue {
    shared: Arc<QueueShared>,
    worker: Option<JoinHandle<()>>,
}

impl SaveQueue {
    pub fn new(adapter: Arc<dyn PersistenceAdapter>) -> EngineResult<Self> {
        let shared = Arc::new(QueueShared::default());
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("layerbrush-save".into())
            .spawn(move || Self::run(worker_shared, adapter))?;
        Ok(Self { shared, worker: Some(worker) })
    }

    /// Queue a capture without blocking. Returns `true` when it replaced a
    /// pending capture of the same object.
    pub fn enqueue(&self, capture: LayerCapture) -> bool {
        let mut state = lock(&self.shared.state);
        let id = capture.object;
        state.stats.enqueued += 1;
        let coalesced = state.pending.insert(id, capture).is_some();
        if coalesced {
            state.stats.coalesced += 1;
            debug!(object = %id, "save coalesced with pending snapshot");
        } else {
            state.order.push_back(id);
            debug!(object = %id, "save enqueued");
        }
        drop(state);
        self.shared.wake.notify_one();
        coalesced
    }

    /// Block until every queued capture has been handed to the adapter.
    pub fn flush(&self) {
        let mut state = lock(&self.shared.state);
        while !state.pending.is_empty() || state.in_flight > 0 {
            state = self.shared.idle.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn stats(&self) -> SaveStats {
        lock(&self.shared.state).stats
    }

    /// Objects whose last write failed since the previous call.
    pub fn take_failures(&self) -> Vec<Uuid> {
        lock(&self.shared.state).failed.drain().collect()
    }

    fn run(shared: Arc<QueueShared>, adapter: Arc<dyn PersistenceAdapter>) {
        loop {
            let capture = {
                let mut state = lock(&shared.state);
                loop {
                    if let Some(id) = state.order.pop_front() {
                        if let Some(capture) = state.pending.remove(&id) {
                            state.in_flight += 1;
                            break Some(capture);
                        }
                        continue;
                    }
                    if state.shutdown {
                        break None;
                    }
                    state = shared.wake.wait(state).unwrap_or_else(|e| e.into_inner());
                }
            };
            let Some(capture) = capture else {
                shared.idle.notify_all();
                return;
            };

            let id = capture.object;
            let result = capture.encode().and_then(|snapshot| adapter.save(&snapshot));

            let mut state = lock(&shared.state);
            state.in_flight -= 1;
            match result {
                Ok(()) => {
                    state.stats.saved += 1;
                    state.failed.remove(&id);
                    debug!(object = %id, layers = capture.layers.len(), "save complete");
                }
                Err(e) => {
                    state.stats.failed += 1;
                    state.failed.insert(id);
                    warn!(object = %id, error = %e, "save failed, in-memory layers kept");
                }
            }
            if state.pending.is_empty() && state.in_flight == 0 {
                shared.idle.notify_all();
            }
        }
    }
}

impl Drop for SaveQueue {
    fn drop(&mut self) {
        lock(&self.shared.state).shutdown = true;
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("save worker panicked");
            }
        }
        info!(stats = ?self.stats(), "save queue stopped");
    }
}

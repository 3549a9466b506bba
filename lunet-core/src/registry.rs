use slab::Slab;
use std::any::Any;
use std::fmt;
use std::rc::Rc;
use uuid::Uuid;

use crate::dgram::DgramHandle;
use crate::error::CoreError;
use crate::fiber::FiberRef;
use crate::fsops::FileHandle;
use crate::stream::{ListenerHandle, StreamHandle};

// ─── Ids ──────────────────────────────────────────────────────

/// Registry anchor id — an opaque integer key for a fiber reference held
/// across a suspension.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AnchorId(pub usize);

/// Registry handle id — the opaque value scripts hold for a native
/// resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandleId(pub usize);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle#{}", self.0)
    }
}

// ─── Handle slots ─────────────────────────────────────────────

/// Typed slot for a native resource. The tag is the contract: an op that
/// looks up the wrong kind gets `INVALID_HANDLE`, never a reinterpreted
/// pointer.
pub enum HandleSlot {
    Listener(Rc<ListenerHandle>),
    Stream(Rc<StreamHandle>),
    Dgram(Rc<DgramHandle>),
    File(Rc<FileHandle>),
    /// Offload-crate handles (DB connections). Downcast by the owning
    /// crate through [`crate::runtime::RuntimeHandle::get_native_handle`].
    Native(Rc<dyn Any>),
}

impl HandleSlot {
    pub fn kind(&self) -> &'static str {
        match self {
            HandleSlot::Listener(_) => "listener",
            HandleSlot::Stream(_) => "stream",
            HandleSlot::Dgram(_) => "dgram",
            HandleSlot::File(_) => "file",
            HandleSlot::Native(_) => "native",
        }
    }
}

struct HandleEntry {
    slot: HandleSlot,
    /// Creation-time identifier for diagnostics.
    created: Uuid,
}

// ─── Registry ─────────────────────────────────────────────────

/// The root state's registry: anchors keeping suspended fibers alive, and
/// the handle table mapping script-visible ids to native resources.
///
/// Anchors are created at the moment of suspension and released exactly
/// once at resumption; the counters are the observable balance contract.
pub struct Registry {
    anchors: Slab<FiberRef>,
    handles: Slab<HandleEntry>,
    pub(crate) anchors_created: u64,
    pub(crate) anchors_released: u64,
    pub(crate) double_releases: u64,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            anchors: Slab::new(),
            handles: Slab::new(),
            anchors_created: 0,
            anchors_released: 0,
            double_releases: 0,
        }
    }

    // ── Anchors ──

    pub fn anchor(&mut self, fiber: FiberRef) -> AnchorId {
        self.anchors_created += 1;
        AnchorId(self.anchors.insert(fiber))
    }

    /// Release an anchor. Releasing a vacant id is the double-release
    /// fault: counted, logged, and fatal in debug builds.
    pub fn release(&mut self, id: AnchorId) -> Option<FiberRef> {
        match self.anchors.try_remove(id.0) {
            Some(f) => {
                self.anchors_released += 1;
                Some(f)
            }
            None => {
                self.double_releases += 1;
                tracing::error!("DOUBLE_RESUME: anchor {} released twice", id.0);
                debug_assert!(false, "anchor {} released twice", id.0);
                None
            }
        }
    }

    pub fn anchors_live(&self) -> usize {
        self.anchors.len()
    }

    // ── Handles ──

    pub fn insert(&mut self, slot: HandleSlot) -> HandleId {
        HandleId(self.handles.insert(HandleEntry {
            slot,
            created: Uuid::now_v7(),
        }))
    }

    pub fn remove(&mut self, id: HandleId) -> Option<HandleSlot> {
        self.handles.try_remove(id.0).map(|e| e.slot)
    }

    pub fn handles_live(&self) -> usize {
        self.handles.len()
    }

    pub fn handle_ids(&self) -> Vec<HandleId> {
        self.handles.iter().map(|(k, _)| HandleId(k)).collect()
    }

    pub fn created_at(&self, id: HandleId) -> Option<Uuid> {
        self.handles.get(id.0).map(|e| e.created)
    }

    fn entry(&self, id: HandleId) -> Result<&HandleEntry, CoreError> {
        self.handles.get(id.0).ok_or(CoreError::InvalidHandle)
    }

    pub fn get_listener(&self, id: HandleId) -> Result<Rc<ListenerHandle>, CoreError> {
        match &self.entry(id)?.slot {
            HandleSlot::Listener(l) => Ok(l.clone()),
            _ => Err(CoreError::InvalidHandle),
        }
    }

    pub fn get_stream(&self, id: HandleId) -> Result<Rc<StreamHandle>, CoreError> {
        match &self.entry(id)?.slot {
            HandleSlot::Stream(s) => Ok(s.clone()),
            _ => Err(CoreError::InvalidHandle),
        }
    }

    pub fn get_dgram(&self, id: HandleId) -> Result<Rc<DgramHandle>, CoreError> {
        match &self.entry(id)?.slot {
            HandleSlot::Dgram(d) => Ok(d.clone()),
            _ => Err(CoreError::InvalidHandle),
        }
    }

    pub fn get_file(&self, id: HandleId) -> Result<Rc<FileHandle>, CoreError> {
        match &self.entry(id)?.slot {
            HandleSlot::File(f) => Ok(f.clone()),
            _ => Err(CoreError::InvalidHandle),
        }
    }

    pub fn get_native(&self, id: HandleId) -> Result<Rc<dyn Any>, CoreError> {
        match &self.entry(id)?.slot {
            HandleSlot::Native(n) => Ok(n.clone()),
            _ => Err(CoreError::InvalidHandle),
        }
    }

    pub fn get_any(&self, id: HandleId) -> Result<HandleSlot, CoreError> {
        let e = self.entry(id)?;
        Ok(match &e.slot {
            HandleSlot::Listener(l) => HandleSlot::Listener(l.clone()),
            HandleSlot::Stream(s) => HandleSlot::Stream(s.clone()),
            HandleSlot::Dgram(d) => HandleSlot::Dgram(d.clone()),
            HandleSlot::File(f) => HandleSlot::File(f.clone()),
            HandleSlot::Native(n) => HandleSlot::Native(n.clone()),
        })
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

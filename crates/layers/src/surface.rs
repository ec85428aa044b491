use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt;
use std::rc::Rc;

/// Failure of a single surface mutation call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SurfaceError {
    #[error("surface rejected the call: {0}")]
    Rejected(String),
    #[error("operation not supported by this surface")]
    Unsupported,
    #[error("surface call failed: {0}")]
    Failed(String),
}

/// Mutation primitives a surface offers. Read once when a layer is built.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SurfaceCapabilities {
    pub batch_attach: bool,
    pub batch_detach: bool,
    pub single_attach: bool,
    pub single_detach: bool,
}

impl SurfaceCapabilities {
    pub const ALL: Self = Self {
        batch_attach: true,
        batch_detach: true,
        single_attach: true,
        single_detach: true,
    };

    pub const SINGLE_ONLY: Self = Self {
        batch_attach: false,
        batch_detach: false,
        single_attach: true,
        single_detach: true,
    };
}

/// The rendering surface overlay items are attached to.
///
/// Every call may fail. The commit engine is the only caller; failures are
/// contained per item and never abort a whole commit.
pub trait RenderSurface {
    type Handle: Clone + fmt::Debug + 'static;

    fn capabilities(&self) -> SurfaceCapabilities;

    fn attach(&mut self, _handle: &Self::Handle) -> Result<(), SurfaceError> {
        Err(SurfaceError::Unsupported)
    }

    fn detach(&mut self, _handle: &Self::Handle) -> Result<(), SurfaceError> {
        Err(SurfaceError::Unsupported)
    }

    fn attach_many(&mut self, _handles: &[Self::Handle]) -> Result<(), SurfaceError> {
        Err(SurfaceError::Unsupported)
    }

    fn detach_many(&mut self, _handles: &[Self::Handle]) -> Result<(), SurfaceError> {
        Err(SurfaceError::Unsupported)
    }
}

/// How one direction (attach or detach) of a commit is written.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WritePath {
    Batched { per_item_fallback: bool },
    PerItem,
    Unsupported,
}

impl WritePath {
    fn select(batch: bool, single: bool) -> Self {
        match (batch, single) {
            (true, fallback) => WritePath::Batched {
                per_item_fallback: fallback,
            },
            (false, true) => WritePath::PerItem,
            (false, false) => WritePath::Unsupported,
        }
    }
}

/// Richest write path per direction, chosen at construction time.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CommitStrategy {
    pub hide: WritePath,
    pub show: WritePath,
}

impl CommitStrategy {
    pub fn from_capabilities(caps: SurfaceCapabilities) -> Result<Self, SurfaceError> {
        let strategy = Self {
            hide: WritePath::select(caps.batch_detach, caps.single_detach),
            show: WritePath::select(caps.batch_attach, caps.single_attach),
        };
        if strategy.hide == WritePath::Unsupported || strategy.show == WritePath::Unsupported {
            return Err(SurfaceError::Unsupported);
        }
        Ok(strategy)
    }
}

/// Call counters and fault injection shared by clones of a [`MemorySurface`].
#[derive(Debug, Default)]
pub struct MemorySurfaceState {
    pub attached: BTreeSet<u64>,
    pub single_calls: u64,
    pub batch_calls: u64,
    pub failing: BTreeSet<u64>,
    pub reject_batches: bool,
}

/// In-memory surface keyed by `u64` handles.
///
/// Used by the bench driver and tests. Clones share state, so a test can keep
/// an observer while the layer owns the surface.
#[derive(Debug, Clone)]
pub struct MemorySurface {
    caps: SurfaceCapabilities,
    state: Rc<RefCell<MemorySurfaceState>>,
}

impl MemorySurface {
    pub fn new(caps: SurfaceCapabilities) -> Self {
        Self {
            caps,
            state: Rc::new(RefCell::new(MemorySurfaceState::default())),
        }
    }

    pub fn attached(&self) -> Vec<u64> {
        self.state.borrow().attached.iter().copied().collect()
    }

    pub fn is_attached(&self, handle: u64) -> bool {
        self.state.borrow().attached.contains(&handle)
    }

    pub fn single_calls(&self) -> u64 {
        self.state.borrow().single_calls
    }

    pub fn batch_calls(&self) -> u64 {
        self.state.borrow().batch_calls
    }

    /// Make every call touching `handle` fail.
    pub fn fail_on(&self, handle: u64) {
        self.state.borrow_mut().failing.insert(handle);
    }

    pub fn heal(&self, handle: u64) {
        self.state.borrow_mut().failing.remove(&handle);
    }

    pub fn reject_batches(&self, reject: bool) {
        self.state.borrow_mut().reject_batches = reject;
    }

    fn check(state: &MemorySurfaceState, handle: u64) -> Result<(), SurfaceError> {
        if state.failing.contains(&handle) {
            return Err(SurfaceError::Failed(format!("handle {handle}")));
        }
        Ok(())
    }

    fn check_batch(state: &MemorySurfaceState, handles: &[u64]) -> Result<(), SurfaceError> {
        if state.reject_batches {
            return Err(SurfaceError::Rejected("batch disabled".to_string()));
        }
        handles.iter().try_for_each(|h| Self::check(state, *h))
    }
}

impl Default for MemorySurface {
    fn default() -> Self {
        Self::new(SurfaceCapabilities::ALL)
    }
}

impl RenderSurface for MemorySurface {
    type Handle = u64;

    fn capabilities(&self) -> SurfaceCapabilities {
        self.caps
    }

    fn attach(&mut self, handle: &u64) -> Result<(), SurfaceError> {
        let mut state = self.state.borrow_mut();
        state.single_calls += 1;
        Self::check(&state, *handle)?;
        state.attached.insert(*handle);
        Ok(())
    }

    fn detach(&mut self, handle: &u64) -> Result<(), SurfaceError> {
        let mut state = self.state.borrow_mut();
        state.single_calls += 1;
        Self::check(&state, *handle)?;
        state.attached.remove(handle);
        Ok(())
    }

    fn attach_many(&mut self, handles: &[u64]) -> Result<(), SurfaceError> {
        if !self.caps.batch_attach {
            return Err(SurfaceError::Unsupported);
        }
        let mut state = self.state.borrow_mut();
        state.batch_calls += 1;
        Self::check_batch(&state, handles)?;
        state.attached.extend(handles.iter().copied());
        Ok(())
    }

    fn detach_many(&mut self, handles: &[u64]) -> Result<(), SurfaceError> {
        if !self.caps.batch_detach {
            return Err(SurfaceError::Unsupported);
        }
        let mut state = self.state.borrow_mut();
        state.batch_calls += 1;
        Self::check_batch(&state, handles)?;
        for h in handles {
            state.attached.remove(h);
        }
        Ok(())
    }
}

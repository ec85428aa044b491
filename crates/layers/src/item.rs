use foundation::bounds::GeoRect;
use foundation::ids::GenerationKey;
use foundation::math::unit_clamp;

/// One renderable overlay item as supplied by a dataset provider.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayItem<H> {
    pub index: u32,
    pub bounds: Option<GeoRect>,
    pub score: f64,
    pub handle: H,
}

/// Surface handle state. Broken items are excluded from every future diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemState<H> {
    Live(H),
    Broken,
}

impl<H> ItemState<H> {
    pub fn handle(&self) -> Option<&H> {
        match self {
            ItemState::Live(h) => Some(h),
            ItemState::Broken => None,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, ItemState::Live(_))
    }
}

/// Detach attempts a quarantined handle gets before it is given up as stranded.
pub const MAX_DETACH_ATTEMPTS: u32 = 8;

/// A handle waiting for a detach, with the number of failed tries so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quarantined<H> {
    pub handle: H,
    pub attempts: u32,
}

impl<H> Quarantined<H> {
    pub fn new(handle: H) -> Self {
        Self {
            handle,
            attempts: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ItemError {
    #[error("item index {index} at position {position}; indices must be 0..n in order")]
    IndexOutOfOrder { index: u32, position: usize },
    #[error("expected {expected} scores, got {actual}")]
    ScoreCountMismatch { expected: usize, actual: usize },
}

/// Items of the live dataset generation, stored column-wise.
///
/// Handles of items that break while still attached wait in the quarantine
/// until a commit task detaches them. A failed detach puts the handle back;
/// after [`MAX_DETACH_ATTEMPTS`] it is counted as stranded and dropped.
#[derive(Debug, Clone)]
pub struct ItemStore<H> {
    generation: GenerationKey,
    states: Vec<ItemState<H>>,
    bounds: Vec<Option<GeoRect>>,
    scores: Vec<f64>,
    quarantine: Vec<Quarantined<H>>,
    broken: usize,
    stranded: usize,
}

impl<H> Default for ItemStore<H> {
    fn default() -> Self {
        Self {
            generation: GenerationKey::default(),
            states: Vec::new(),
            bounds: Vec::new(),
            scores: Vec::new(),
            quarantine: Vec::new(),
            broken: 0,
            stranded: 0,
        }
    }
}

impl<H: Clone> ItemStore<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the dataset. Quarantined handles are kept.
    ///
    /// On error the store is left unchanged.
    pub fn load(
        &mut self,
        generation: GenerationKey,
        items: Vec<OverlayItem<H>>,
    ) -> Result<(), ItemError> {
        if let Some((position, item)) = items
            .iter()
            .enumerate()
            .find(|(pos, item)| item.index as usize != *pos)
        {
            return Err(ItemError::IndexOutOfOrder {
                index: item.index,
                position,
            });
        }

        self.generation = generation;
        self.states.clear();
        self.bounds.clear();
        self.scores.clear();
        self.broken = 0;
        for item in items {
            self.states.push(ItemState::Live(item.handle));
            self.bounds.push(item.bounds.filter(GeoRect::is_valid));
            self.scores.push(unit_clamp(item.score));
        }
        Ok(())
    }

    /// Drop every item. Quarantined handles are kept.
    pub fn clear(&mut self) {
        self.generation = GenerationKey::default();
        self.states.clear();
        self.bounds.clear();
        self.scores.clear();
        self.broken = 0;
    }

    pub fn generation(&self) -> &GenerationKey {
        &self.generation
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn bounds(&self) -> &[Option<GeoRect>] {
        &self.bounds
    }

    pub fn item_bounds(&self, index: u32) -> Option<GeoRect> {
        self.bounds.get(index as usize).copied().flatten()
    }

    pub fn scores(&self) -> &[f64] {
        &self.scores
    }

    /// Replace every score (metric switch). Scores are clamped to `[0, 1]`.
    pub fn set_scores(&mut self, scores: &[f64]) -> Result<(), ItemError> {
        if scores.len() != self.states.len() {
            return Err(ItemError::ScoreCountMismatch {
                expected: self.states.len(),
                actual: scores.len(),
            });
        }
        self.scores = scores.iter().copied().map(unit_clamp).collect();
        Ok(())
    }

    pub fn state(&self, index: u32) -> Option<&ItemState<H>> {
        self.states.get(index as usize)
    }

    pub fn is_live(&self, index: u32) -> bool {
        self.state(index).is_some_and(ItemState::is_live)
    }

    pub fn live_handle(&self, index: u32) -> Option<&H> {
        self.state(index).and_then(ItemState::handle)
    }

    pub fn live_indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.states
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_live())
            .map(|(i, _)| i as u32)
    }

    pub fn broken_count(&self) -> usize {
        self.broken
    }

    /// Flip a live item to broken and hand back its handle.
    pub fn mark_broken(&mut self, index: u32) -> Option<H> {
        let slot = self.states.get_mut(index as usize)?;
        match std::mem::replace(slot, ItemState::Broken) {
            ItemState::Live(h) => {
                self.broken += 1;
                Some(h)
            }
            ItemState::Broken => None,
        }
    }

    /// Queue a handle for a best-effort detach on the next commit.
    pub fn quarantine(&mut self, handle: H) {
        self.quarantine.push(Quarantined::new(handle));
    }

    /// Put back a handle whose detach just failed. Returns `false` once it
    /// has used up its attempts; it is then counted as stranded.
    pub fn requarantine(&mut self, mut entry: Quarantined<H>) -> bool {
        entry.attempts += 1;
        if entry.attempts >= MAX_DETACH_ATTEMPTS {
            self.stranded += 1;
            return false;
        }
        self.quarantine.push(entry);
        true
    }

    pub fn quarantined(&self) -> usize {
        self.quarantine.len()
    }

    pub fn take_quarantine(&mut self) -> Vec<Quarantined<H>> {
        std::mem::take(&mut self.quarantine)
    }

    /// Handles given up after repeated detach failures, across generations.
    pub fn stranded_count(&self) -> usize {
        self.stranded
    }
}

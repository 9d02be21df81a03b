//! Liveness anchors.
//!
//! An anchor keeps cached entity states reachable for as long as a caller
//! needs them. Anchors live in an arena ([`AnchorForest`]) and form trees:
//! joining one root anchor into another makes the joined anchor's payloads
//! reachable through the surviving root, and releasing a root frees the whole
//! tree at once.
//!
//! Only roots can be joined. A member anchor already has an owner, and moving
//! it would leave the previous owner's tree with a dangling link.
//!
//! Callers hold [`Anchor`] handles rather than raw ids. A handle releases its
//! tree when dropped, so the forest only holds what someone still owns.

use graphfetch_core::{Error, Result};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Handle to an anchor in an [`AnchorForest`].
///
/// Handles carry a generation, so a handle kept after its anchor was released
/// never aliases a newer anchor in the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AnchorId {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct AnchorNode<P> {
    payloads: Vec<P>,
    members: Vec<AnchorId>,
    parent: Option<AnchorId>,
}

#[derive(Debug)]
struct Slot<P> {
    generation: u32,
    node: Option<AnchorNode<P>>,
}

/// Arena of anchor trees.
#[derive(Debug)]
pub struct AnchorForest<P> {
    slots: Vec<Slot<P>>,
    free: Vec<u32>,
    live: usize,
}

impl<P> Default for AnchorForest<P> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }
}

impl<P> AnchorForest<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a root anchor holding `payloads`.
    pub fn create(&mut self, payloads: Vec<P>) -> AnchorId {
        let node = AnchorNode {
            payloads,
            members: Vec::new(),
            parent: None,
        };
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.node = Some(node);
            return AnchorId {
                index,
                generation: slot.generation,
            };
        }
        let index = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
        self.slots.push(Slot {
            generation: 0,
            node: Some(node),
        });
        AnchorId {
            index,
            generation: 0,
        }
    }

    /// Create a root anchor holding a single payload.
    pub fn anchor(&mut self, payload: P) -> AnchorId {
        self.create(vec![payload])
    }

    fn node(&self, id: AnchorId) -> Option<&AnchorNode<P>> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
    }

    fn node_mut(&mut self, id: AnchorId) -> Option<&mut AnchorNode<P>> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
    }

    /// Whether `id` refers to a live anchor.
    pub fn contains(&self, id: AnchorId) -> bool {
        self.node(id).is_some()
    }

    /// Whether `id` is a live anchor with no parent.
    pub fn is_root(&self, id: AnchorId) -> bool {
        self.node(id).is_some_and(|n| n.parent.is_none())
    }

    pub fn parent(&self, id: AnchorId) -> Option<AnchorId> {
        self.node(id).and_then(|n| n.parent)
    }

    /// Add a payload to a live anchor.
    pub fn push_payload(&mut self, id: AnchorId, payload: P) -> Result<()> {
        let node = self
            .node_mut(id)
            .ok_or_else(|| Error::InvariantViolation(format!("anchor {id:?} is not live")))?;
        node.payloads.push(payload);
        Ok(())
    }

    /// Make `other` a member of `root`.
    ///
    /// Both anchors must be distinct live roots.
    pub fn join(&mut self, root: AnchorId, other: AnchorId) -> Result<()> {
        if root == other {
            return Err(Error::InvariantViolation(format!(
                "cannot join anchor {root:?} into itself"
            )));
        }
        if !self.is_root(root) || !self.is_root(other) {
            return Err(Error::InvariantViolation(format!(
                "only root anchors can be joined ({root:?} <- {other:?})"
            )));
        }
        if let Some(node) = self.node_mut(other) {
            node.parent = Some(root);
        }
        if let Some(node) = self.node_mut(root) {
            node.members.push(other);
        }
        Ok(())
    }

    /// Every payload reachable from `id`, depth first.
    pub fn payloads(&self, id: AnchorId) -> Vec<&P> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if let Some(node) = self.node(next) {
                out.extend(node.payloads.iter());
                stack.extend(node.members.iter().rev().copied());
            }
        }
        out
    }

    /// Free the root `id` and every anchor joined into it.
    ///
    /// Returns the number of anchors freed.
    pub fn release(&mut self, id: AnchorId) -> Result<usize> {
        if !self.is_root(id) {
            return Err(Error::InvariantViolation(format!(
                "only root anchors can be released ({id:?})"
            )));
        }
        let mut freed = 0;
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            let Some(slot) = self
                .slots
                .get_mut(next.index as usize)
                .filter(|slot| slot.generation == next.generation)
            else {
                continue;
            };
            if let Some(node) = slot.node.take() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(next.index);
                stack.extend(node.members);
                freed += 1;
            }
        }
        self.live -= freed;
        Ok(freed)
    }

    /// Number of live anchors.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}

/// An [`AnchorForest`] shared between a scheduler and the [`Anchor`]s it
/// hands out.
pub type SharedForest<P> = Arc<Mutex<AnchorForest<P>>>;

fn lock<P>(forest: &Mutex<AnchorForest<P>>) -> MutexGuard<'_, AnchorForest<P>> {
    forest.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owned root anchor.
///
/// Dropping the handle releases the anchor and everything joined into it.
/// A handle is always a root: joining consumes the other handle, whose tree
/// is then released together with this one.
pub struct Anchor<P> {
    id: AnchorId,
    forest: SharedForest<P>,
}

impl<P> Anchor<P> {
    /// Create a root anchor holding `payloads` in `forest`.
    pub fn new(forest: &SharedForest<P>, payloads: Vec<P>) -> Self {
        let id = lock(forest).create(payloads);
        Self {
            id,
            forest: Arc::clone(forest),
        }
    }

    pub fn id(&self) -> AnchorId {
        self.id
    }

    /// Make `other` a member of this anchor.
    ///
    /// Fails when the two anchors belong to different forests; `other` is
    /// released in that case.
    pub fn join(&self, other: Anchor<P>) -> Result<()> {
        if !Arc::ptr_eq(&self.forest, &other.forest) {
            return Err(Error::InvariantViolation(format!(
                "anchors {:?} and {:?} live in different forests",
                self.id, other.id
            )));
        }
        let joined = lock(&self.forest).join(self.id, other.id);
        drop(other);
        joined
    }

    /// Number of payloads kept alive by this anchor.
    pub fn payload_count(&self) -> usize {
        lock(&self.forest).payloads(self.id).len()
    }

    /// Every payload kept alive by this anchor.
    pub fn payloads(&self) -> Vec<P>
    where
        P: Clone,
    {
        lock(&self.forest).payloads(self.id).into_iter().cloned().collect()
    }
}

impl<P> std::fmt::Debug for Anchor<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Anchor").field(&self.id).finish()
    }
}

impl<P> Drop for Anchor<P> {
    fn drop(&mut self) {
        let mut forest = lock(&self.forest);
        // Members go away with their root.
        if forest.is_root(self.id) {
            let _ = forest.release(self.id);
        }
    }
}

/// Join `other` into `root` and return the anchor that now keeps both alive.
pub fn join_anchors<P>(root: Option<Anchor<P>>, other: Option<Anchor<P>>) -> Option<Anchor<P>> {
    match (root, other) {
        (Some(root), Some(other)) => {
            if let Err(e) = root.join(other) {
                debug!(error = %e, "Anchor join skipped");
            }
            Some(root)
        }
        (None, other) => other,
        (root, None) => root,
    }
}

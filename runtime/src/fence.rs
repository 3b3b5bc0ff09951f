//! Upper bound on automatic advancement, with memory of the target it deferred.

use crate::VirtualInstant;

/// Tracks the active fence and the most recent request it clamped.
///
/// While a fence is active the clock may never move past it. A request beyond the fence is
/// remembered as pending so that raising or clearing the fence can release it later.
#[derive(Debug, Default)]
pub(crate) struct FenceController {
    fence: Option<VirtualInstant>,
    pending: Option<VirtualInstant>,
}

impl FenceController {
    pub(crate) fn new(fence: Option<VirtualInstant>) -> Self {
        Self {
            fence,
            pending: None,
        }
    }

    pub(crate) fn fence(&self) -> Option<VirtualInstant> {
        self.fence
    }

    pub(crate) fn pending(&self) -> Option<VirtualInstant> {
        self.pending
    }

    /// Replace the fence, returning the deferred target that should be retried (if any).
    pub(crate) fn replace(&mut self, fence: Option<VirtualInstant>) -> Option<VirtualInstant> {
        self.fence = fence;
        self.pending
    }

    /// Limit `requested` to the fence.
    ///
    /// Returns the effective target and whether `requested` was deferred.
    pub(crate) fn clamp(&mut self, requested: VirtualInstant) -> (VirtualInstant, bool) {
        match self.fence {
            Some(fence) if requested > fence => {
                self.pending = Some(requested);
                (fence, true)
            }
            _ => {
                self.pending = None;
                (requested, false)
            }
        }
    }
}

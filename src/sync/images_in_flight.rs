use super::FrameSlot;

/// Which frame slot last claimed each presentable image.
///
/// The surface may hand out images in any order and its image count need not
/// equal K, so an image can still be in use by a different slot than the one
/// about to render into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInUseTable {
    claimants: Vec<Option<FrameSlot>>,
}

impl ImageInUseTable {
    pub fn new(image_count: usize) -> Self {
        Self {
            claimants: vec![None; image_count],
        }
    }

    pub fn len(&self) -> usize {
        self.claimants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claimants.is_empty()
    }

    pub fn claimant(&self, image_index: u32) -> Option<FrameSlot> {
        self.claimants[image_index as usize]
    }

    /// Records `slot` as the new claimant and returns the previous one.
    pub fn claim(&mut self, image_index: u32, slot: FrameSlot) -> Option<FrameSlot> {
        self.claimants[image_index as usize].replace(slot)
    }

    /// Forgets every claim, e.g. after the surface was rebuilt.
    pub fn reset(&mut self, image_count: usize) {
        self.claimants.clear();
        self.claimants.resize(image_count, None);
    }
}

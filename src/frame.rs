// Frame slots - per-frame resource bundles
//
// FRAME_OVERLAP slots rotate so the CPU can record frame N+1 while the GPU
// still works on frame N. A slot may only be re-recorded, or have its object
// buffer rewritten, after its in-flight fence has signaled.

use ash::vk;

/// Number of frames in flight.
pub const FRAME_OVERLAP: usize = 2;

/// A secondary command buffer with its own pool, so parallel recorders never
/// share a pool.
#[derive(Debug, Clone, Copy)]
pub struct SecondaryRecorder {
    pub pool: vk::CommandPool,
    pub buffer: vk::CommandBuffer,
}

#[derive(Debug, Clone)]
pub struct FrameSlot {
    pub command_pool: vk::CommandPool,
    pub primary: vk::CommandBuffer,
    /// At least one. Serial recording only uses the first.
    pub secondaries: Vec<SecondaryRecorder>,

    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    /// Created signaled so the first wait returns immediately.
    pub in_flight_fence: vk::Fence,

    pub object_buffer: vk::Buffer,
    pub object_set: vk::DescriptorSet,
}

/// The rotating array of frame slots.
#[derive(Debug)]
pub struct FrameSlotSet {
    slots: Vec<FrameSlot>,
    current: usize,
}

impl FrameSlotSet {
    /// Takes exactly `FRAME_OVERLAP` slots.
    pub fn new(slots: Vec<FrameSlot>) -> anyhow::Result<Self> {
        if slots.len() != FRAME_OVERLAP {
            anyhow::bail!("Expected {} frame slots, got {}", FRAME_OVERLAP, slots.len());
        }
        if slots.iter().any(|s| s.secondaries.is_empty()) {
            anyhow::bail!("Every frame slot needs at least one secondary command buffer");
        }
        Ok(Self { slots, current: 0 })
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current(&self) -> &FrameSlot {
        &self.slots[self.current]
    }

    /// Move to the next slot and return its index.
    pub fn advance(&mut self) -> usize {
        self.current = (self.current + 1) % FRAME_OVERLAP;
        self.current
    }

    pub fn slots(&self) -> &[FrameSlot] {
        &self.slots
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ash::vk::Handle;

    /// Slot with fabricated handles; every handle in slot `i` is unique.
    pub(crate) fn fake_slot(i: u64, secondaries: usize) -> FrameSlot {
        let base = (i + 1) * 1000;
        FrameSlot {
            command_pool: vk::CommandPool::from_raw(base + 1),
            primary: vk::CommandBuffer::from_raw(base + 2),
            secondaries: (0..secondaries as u64)
                .map(|s| SecondaryRecorder {
                    pool: vk::CommandPool::from_raw(base + 100 + s),
                    buffer: vk::CommandBuffer::from_raw(base + 200 + s),
                })
                .collect(),
            image_available: vk::Semaphore::from_raw(base + 3),
            render_finished: vk::Semaphore::from_raw(base + 4),
            in_flight_fence: vk::Fence::from_raw(base + 5),
            object_buffer: vk::Buffer::from_raw(base + 6),
            object_set: vk::DescriptorSet::from_raw(base + 7),
        }
    }

    pub(crate) fn fake_slots(secondaries: usize) -> FrameSlotSet {
        let slots = (0..FRAME_OVERLAP as u64).map(|i| fake_slot(i, secondaries)).collect();
        FrameSlotSet::new(slots).unwrap()
    }

    #[test]
    fn advance_alternates_and_wraps_after_two() {
        let mut set = fake_slots(1);
        assert_eq!(set.current_index(), 0);

        let mut seen = vec![set.current_index()];
        for _ in 0..6 {
            seen.push(set.advance());
        }
        assert_eq!(seen, vec![0, 1, 0, 1, 0, 1, 0]);
        assert!(seen.windows(2).all(|w| w[0] != w[1]));
    }

    #[test]
    fn current_follows_the_index() {
        let mut set = fake_slots(1);
        let first = set.current().in_flight_fence;
        set.advance();
        assert_ne!(set.current().in_flight_fence, first);
        set.advance();
        assert_eq!(set.current().in_flight_fence, first);
    }

    #[test]
    fn rejects_wrong_slot_count() {
        assert!(FrameSlotSet::new(vec![fake_slot(0, 1)]).is_err());
        assert!(FrameSlotSet::new(vec![fake_slot(0, 0), fake_slot(1, 0)]).is_err());
    }
}

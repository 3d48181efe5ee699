//! Deferred destruction of native objects.
//!
//! Objects the GPU may still be reading cannot be destroyed when the CPU side
//! lets go of them. They are queued together with the command buffer that
//! last used them and the fence counter that command buffer will reach once
//! that work retires, and destroyed on a later maintenance pass.

use std::sync::Arc;

use crossbeam_queue::SegQueue;

use crate::allocators::cmd_buffer::CmdBuffer;
use crate::gpu::{GpuDevice, NativeHandle};
use crate::sync::mutex::Mutex;

/// What to destroy.
pub enum DeferredPayload {
    /// A native object, destroyed through [`GpuDevice::destroy_object`].
    Native(NativeHandle),
    /// Arbitrary teardown, run with the device.
    Custom(Box<dyn FnOnce(&dyn GpuDevice) + Send>),
}

impl std::fmt::Debug for DeferredPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeferredPayload::Native(handle) => f.debug_tuple("Native").field(handle).finish(),
            DeferredPayload::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

struct DeferredEntry {
    payload: DeferredPayload,
    owner: Option<Arc<CmdBuffer>>,
    fence_counter: u64,
}

impl DeferredEntry {
    fn is_retired(&self) -> bool {
        match &self.owner {
            Some(cmd) => cmd.fence_signaled_counter() >= self.fence_counter,
            None => true,
        }
    }
}

/// Queue of objects waiting for the GPU to catch up.
///
/// Enqueueing is lock-free; entries are merged into the pending list on each
/// [`release_resources`](Self::release_resources) pass.
pub struct DeferredDeletionQueue {
    device: Arc<dyn GpuDevice>,
    incoming: SegQueue<DeferredEntry>,
    entries: Mutex<Vec<DeferredEntry>>,
    /// Most recent submission and the fence counter its completion reaches.
    last_submitted: Mutex<Option<(Arc<CmdBuffer>, u64)>>,
}

impl DeferredDeletionQueue {
    pub fn new(device: Arc<dyn GpuDevice>) -> Self {
        Self {
            device,
            incoming: SegQueue::new(),
            entries: Mutex::new(Vec::new()),
            last_submitted: Mutex::new(None),
        }
    }

    /// Remember the submission `cmd` just made. Plain
    /// [`enqueue`](Self::enqueue) calls wait for it.
    ///
    /// Call right after the submit, before the fence can be observed.
    pub fn on_cmd_buffer_submitted(&self, cmd: &Arc<CmdBuffer>) {
        let counter = cmd.pending_fence_counter();
        *self.last_submitted.lock() = Some((cmd.clone(), counter));
    }

    /// Destroy `handle` once the last recorded submission retires.
    ///
    /// With no submission recorded, or one already retired, the handle goes on
    /// the next pass.
    pub fn enqueue(&self, handle: NativeHandle) {
        let last = self.last_submitted.lock().clone();
        let (owner, fence_counter) = match last {
            Some((cmd, counter)) => (Some(cmd), counter),
            None => (None, 0),
        };
        self.incoming.push(DeferredEntry {
            payload: DeferredPayload::Native(handle),
            owner,
            fence_counter,
        });
    }

    /// Destroy `handle` once `cmd`'s current recording retires.
    pub fn enqueue_for(&self, cmd: &Arc<CmdBuffer>, handle: NativeHandle) {
        self.push(Some(cmd.clone()), DeferredPayload::Native(handle));
    }

    /// Run `destroy` once `cmd`'s current recording retires.
    pub fn enqueue_with<F>(&self, cmd: &Arc<CmdBuffer>, destroy: F)
    where
        F: FnOnce(&dyn GpuDevice) + Send + 'static,
    {
        self.push(Some(cmd.clone()), DeferredPayload::Custom(Box::new(destroy)));
    }

    fn push(&self, owner: Option<Arc<CmdBuffer>>, payload: DeferredPayload) {
        let fence_counter = owner.as_ref().map_or(0, |cmd| cmd.pending_fence_counter());
        self.incoming.push(DeferredEntry {
            payload,
            owner,
            fence_counter,
        });
    }

    /// Destroy every entry whose owner has retired, or all of them when
    /// `immediate`. Returns how many were destroyed.
    pub fn release_resources(&self, immediate: bool) -> usize {
        let doomed = {
            let mut entries = self.entries.lock();
            while let Some(entry) = self.incoming.pop() {
                entries.push(entry);
            }
            if immediate {
                std::mem::take(&mut *entries)
            } else {
                let mut doomed = Vec::new();
                let mut index = 0;
                while index < entries.len() {
                    if entries[index].is_retired() {
                        doomed.push(entries.swap_remove(index));
                    } else {
                        index += 1;
                    }
                }
                doomed
            }
        };

        let count = doomed.len();
        for entry in doomed {
            match entry.payload {
                DeferredPayload::Native(handle) => self.device.destroy_object(handle),
                DeferredPayload::Custom(destroy) => destroy(self.device.as_ref()),
            }
        }
        count
    }

    /// Entries still waiting, including ones not merged yet.
    pub fn len(&self) -> usize {
        self.entries.lock().len() + self.incoming.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for DeferredDeletionQueue {
    fn drop(&mut self) {
        self.release_resources(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::DummyDevice;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn setup() -> (Arc<DummyDevice>, DeferredDeletionQueue) {
        let device = Arc::new(DummyDevice::new());
        let queue = DeferredDeletionQueue::new(device.clone());
        (device, queue)
    }

    #[test]
    fn test_waits_for_recorded_counter() {
        let (device, queue) = setup();
        let cmd = Arc::new(CmdBuffer::new(0));
        for _ in 0..4 {
            cmd.mark_signaled();
        }
        assert_eq!(cmd.pending_fence_counter(), 5);

        let handle = NativeHandle::Sampler(11);
        queue.enqueue_for(&cmd, handle);
        assert_eq!(queue.release_resources(false), 0);
        assert!(!device.was_destroyed(handle));

        cmd.mark_signaled();
        assert_eq!(queue.release_resources(false), 1);
        assert!(device.was_destroyed(handle));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_unowned_entries_go_next_pass() {
        let (device, queue) = setup();
        queue.enqueue(NativeHandle::ImageView(3));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.release_resources(false), 1);
        assert!(device.was_destroyed(NativeHandle::ImageView(3)));
    }

    #[test]
    fn test_enqueue_attaches_last_submitted() {
        let (device, queue) = setup();
        let cmd = Arc::new(CmdBuffer::new(1));
        queue.on_cmd_buffer_submitted(&cmd);
        queue.enqueue(NativeHandle::Pipeline(9));

        assert_eq!(queue.release_resources(false), 0);
        cmd.mark_signaled();
        assert_eq!(queue.release_resources(false), 1);
        assert!(device.was_destroyed(NativeHandle::Pipeline(9)));
    }

    #[test]
    fn test_enqueue_after_submission_retired() {
        let (device, queue) = setup();
        let cmd = Arc::new(CmdBuffer::new(3));
        queue.on_cmd_buffer_submitted(&cmd);
        cmd.mark_signaled();

        queue.enqueue(NativeHandle::Sampler(5));
        assert_eq!(queue.release_resources(false), 1);
        assert!(device.was_destroyed(NativeHandle::Sampler(5)));
    }

    #[test]
    fn test_enqueue_waits_for_later_submission() {
        let (device, queue) = setup();
        let cmd = Arc::new(CmdBuffer::new(4));
        queue.on_cmd_buffer_submitted(&cmd);
        cmd.mark_signaled();
        queue.on_cmd_buffer_submitted(&cmd);

        queue.enqueue(NativeHandle::Framebuffer(8));
        assert_eq!(queue.release_resources(false), 0);
        cmd.mark_signaled();
        assert_eq!(queue.release_resources(false), 1);
        assert!(device.was_destroyed(NativeHandle::Framebuffer(8)));
    }

    #[test]
    fn test_immediate_releases_everything() {
        let (device, queue) = setup();
        let cmd = Arc::new(CmdBuffer::new(2));
        let (buffer, _) = device.create_buffer(64, crate::gpu::BufferUsage::VERTEX_BUFFER).unwrap();
        queue.enqueue_for(&cmd, NativeHandle::Buffer(buffer));
        queue.enqueue_for(&cmd, NativeHandle::Semaphore(4));

        assert_eq!(queue.release_resources(true), 2);
        assert_eq!(device.live_buffer_count(), 0);
    }

    #[test]
    fn test_custom_payload() {
        let (_device, queue) = setup();
        let cmd = Arc::new(CmdBuffer::new(5));
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        queue.enqueue_with(&cmd, move |_device| flag.store(true, Ordering::SeqCst));

        queue.release_resources(false);
        assert!(!ran.load(Ordering::SeqCst));
        cmd.mark_signaled();
        queue.release_resources(false);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_drop_drains() {
        let (device, queue) = setup();
        let cmd = Arc::new(CmdBuffer::new(6));
        queue.enqueue_for(&cmd, NativeHandle::QueryPool(1));
        drop(queue);
        assert!(device.was_destroyed(NativeHandle::QueryPool(1)));
    }
}

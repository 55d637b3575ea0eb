//! Submission of command buffers for execution.
//!
//! A [`Queue`] executes the commands of a command buffer with the software interpreter, one
//! after the other, in recording order. The memory that the descriptors of the device refer to
//! is owned by the queue, so that the effects of one submission are visible to the next.

use super::{Device, DeviceOwned};
use crate::{
    command_buffer::CommandBuffer,
    descriptor_set::ResourceId,
    shader::interpreter::{DeviceMemory, ExecutionError},
    sync::Fence,
    Validated,
};
use parking_lot::Mutex;
use std::sync::Arc;

/// Executes command buffers.
#[derive(Debug)]
pub struct Queue {
    device: Arc<Device>,
    memory: Mutex<DeviceMemory>,
}

impl Queue {
    /// Creates a new `Queue`.
    #[inline]
    pub fn new(device: Arc<Device>) -> Arc<Queue> {
        Arc::new(Queue {
            device,
            memory: Mutex::new(DeviceMemory::new()),
        })
    }

    /// Submits `command_buffer`, and executes it to completion.
    ///
    /// The returned fence is signaled. Pass it to [`CommandBuffer::wait`] to read the violations
    /// that the submission reported.
    ///
    /// If an access that was not validated faults, the submission is abandoned: the error is
    /// returned, and the command buffer goes back to the executable state without any results.
    ///
    /// # Panics
    ///
    /// - Panics if `command_buffer` belongs to a different device.
    pub fn submit(
        &self,
        command_buffer: &mut CommandBuffer,
    ) -> Result<Arc<Fence>, Validated<ExecutionError>> {
        assert_eq!(command_buffer.device(), &self.device);

        let fence = command_buffer.on_submit()?;
        let mut memory = self.memory.lock();

        match command_buffer.execute(&mut memory) {
            Ok(()) => {
                fence.signal();

                Ok(fence)
            }
            Err(err) => {
                tracing::error!(
                    command_buffer = command_buffer.id().get(),
                    "submission faulted: {}",
                    err,
                );
                command_buffer.abort_submission();

                Err(Validated::Error(err))
            }
        }
    }

    /// Returns the word held by `resource`.
    #[inline]
    pub fn resource_contents(&self, resource: ResourceId) -> u32 {
        self.memory.lock().resource(resource)
    }
}

unsafe impl DeviceOwned for Queue {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

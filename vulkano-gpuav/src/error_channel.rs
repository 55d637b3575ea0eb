//! The channel through which instrumented shaders report violations to the host.
//!
//! An [`ErrorChannel`] stands in for a buffer in memory that is visible to both the device and
//! the host. It consists of a three-word header, `{capacity, cursor, dropped}`, followed by
//! `capacity` slots of one [`ErrorRecord`] each.
//!
//! Any number of shader invocations may report a violation at the same time. An invocation
//! claims a slot by atomically advancing the cursor, and writes its record into the slot that
//! the cursor pointed at before. The cursor never goes past the capacity. Once it reaches it, the
//! channel is full, and further records are only counted in `dropped`, which saturates instead
//! of wrapping. This means that the channel always keeps the first records that were claimed,
//! never the last ones.
//!
//! The host only reads the channel after the submission that wrote it has completed, which is
//! enforced by [`ErrorChannel::drain`] taking `&mut self`.

use crate::{command_buffer::CommandKind, pipeline::PipelineBindPoint, shader::ShaderStage};
use bytemuck::{Pod, Zeroable};
use std::{
    fmt::{Display, Error as FmtError, Formatter},
    num::NonZero,
    sync::atomic::{AtomicU32, Ordering},
};

const CAPACITY: usize = 0;
const CURSOR: usize = 1;
const DROPPED: usize = 2;
const HEADER_WORDS: usize = 3;

/// A buffer of error records that is written by the device, and read by the host.
#[derive(Debug)]
pub struct ErrorChannel {
    words: Box<[AtomicU32]>,
}

impl ErrorChannel {
    /// Creates a new `ErrorChannel` that can hold `capacity` records.
    pub fn new(capacity: u32) -> Self {
        let len = HEADER_WORDS + capacity as usize * ErrorRecord::WORDS;
        let words: Box<[AtomicU32]> = (0..len).map(|_| AtomicU32::new(0)).collect();
        words[CAPACITY].store(capacity, Ordering::Relaxed);

        ErrorChannel { words }
    }

    /// Returns the number of records that the channel can hold.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.words[CAPACITY].load(Ordering::Relaxed)
    }

    /// Returns the number of records that have been reported since the channel was last drained,
    /// including those that were dropped.
    #[inline]
    pub fn reported(&self) -> u32 {
        self.words[CURSOR]
            .load(Ordering::Acquire)
            .saturating_add(self.dropped())
    }

    /// Returns the number of records that were dropped because the channel was full, saturating
    /// at `u32::MAX`.
    #[inline]
    pub fn dropped(&self) -> u32 {
        self.words[DROPPED].load(Ordering::Acquire)
    }

    /// Claims the next free slot. Returns `None` if the channel is full.
    pub fn claim(&self) -> Option<u32> {
        let capacity = self.capacity();
        let claimed =
            self.words[CURSOR].fetch_update(Ordering::AcqRel, Ordering::Acquire, |slot| {
                (slot < capacity).then(|| slot + 1)
            });

        match claimed {
            Ok(slot) => Some(slot),
            Err(_) => {
                let _ = self.words[DROPPED].fetch_update(
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    |dropped| dropped.checked_add(1),
                );

                None
            }
        }
    }

    /// Writes `record` into a slot that was returned by [`claim`](Self::claim).
    ///
    /// # Panics
    ///
    /// - Panics if `slot` is not less than the capacity.
    pub fn write(&self, slot: u32, record: &ErrorRecord) {
        assert!(slot < self.capacity());

        let start = HEADER_WORDS + slot as usize * ErrorRecord::WORDS;
        let words: [u32; ErrorRecord::WORDS] = bytemuck::cast(*record);

        for (dst, word) in self.words[start..start + ErrorRecord::WORDS]
            .iter()
            .zip(words)
        {
            dst.store(word, Ordering::Release);
        }
    }

    /// Claims a slot and writes `record` into it. Returns `false` if the channel was full and the
    /// record was dropped.
    #[inline]
    pub fn report(&self, record: &ErrorRecord) -> bool {
        match self.claim() {
            Some(slot) => {
                self.write(slot, record);
                true
            }
            None => false,
        }
    }

    /// Reads all records that were written, and empties the channel.
    pub fn drain(&mut self) -> Vec<ErrorRecord> {
        let capacity = self.capacity();
        let count = self.words[CURSOR].load(Ordering::Acquire).min(capacity) as usize;
        let dropped = self.dropped();

        let records = self.words[HEADER_WORDS..HEADER_WORDS + count * ErrorRecord::WORDS]
            .chunks_exact(ErrorRecord::WORDS)
            .map(|chunk| {
                let mut words = [0u32; ErrorRecord::WORDS];

                for (word, src) in words.iter_mut().zip(chunk) {
                    *word = src.load(Ordering::Acquire);
                }

                bytemuck::cast(words)
            })
            .collect();

        if dropped != 0 {
            tracing::warn!(
                capacity,
                dropped,
                "the error channel overflowed, some violations were not recorded",
            );
        }

        self.reset();

        records
    }

    /// Empties the channel without reading it.
    pub fn reset(&mut self) {
        self.words[CURSOR].store(0, Ordering::Release);
        self.words[DROPPED].store(0, Ordering::Release);
    }
}

/// A single violation, as written by the device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct ErrorRecord {
    /// The [`ViolationKind`] in the lowest 8 bits, and the index of the command that caused the
    /// violation in the upper 24 bits.
    pub kind: u32,

    /// The raw [`ShaderStage`] of the shader that performed the access.
    pub stage: u32,

    pub set: u32,
    pub binding: u32,
    pub element: u32,

    /// The source location of the access within the instrumented shader.
    pub extra: u32,
}

impl ErrorRecord {
    /// The size of a record in `u32` words.
    pub const WORDS: usize = 6;

    /// The highest command index that can be stored in a record.
    pub const MAX_COMMAND_INDEX: u32 = (1 << 24) - 1;

    /// Returns a new `ErrorRecord`. Command indices above [`Self::MAX_COMMAND_INDEX`] are
    /// clamped to it.
    #[inline]
    pub fn new(
        kind: ViolationKind,
        command_index: u32,
        stage: ShaderStage,
        set: u32,
        binding: u32,
        element: u32,
        location: u32,
    ) -> Self {
        ErrorRecord {
            kind: kind as u32 | command_index.min(Self::MAX_COMMAND_INDEX) << 8,
            stage: stage as u32,
            set,
            binding,
            element,
            extra: location,
        }
    }

    /// Returns the kind of the violation, or `None` if the record is corrupt.
    #[inline]
    pub fn violation_kind(&self) -> Option<ViolationKind> {
        ViolationKind::from_raw(self.kind & 0xff)
    }

    /// Returns the index of the command that caused the violation.
    #[inline]
    pub fn command_index(&self) -> u32 {
        self.kind >> 8
    }

    /// Returns the stage of the shader that performed the access, or `None` if the record is
    /// corrupt.
    #[inline]
    pub fn shader_stage(&self) -> Option<ShaderStage> {
        ShaderStage::try_from(ash::vk::ShaderStageFlags::from_raw(self.stage)).ok()
    }

    /// Returns the source location of the access.
    #[inline]
    pub fn location(&self) -> u32 {
        self.extra
    }
}

/// The kinds of violation that instrumented shaders detect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ViolationKind {
    /// The index of the access was not less than the number of descriptors in the binding.
    OutOfBoundsIndex = 1,

    /// The descriptor had never been written.
    UnwrittenDescriptor = 2,

    /// The descriptor was written with a null descriptor, but the `null_descriptor` feature is
    /// not enabled.
    NullDescriptorUse = 3,

    /// The descriptor set was disturbed by binding a descriptor set with an incompatible pipeline
    /// layout, and was not bound again afterwards.
    StaleBindingAfterIncompatibleRebind = 4,

    /// The resource that the descriptor refers to has been destroyed.
    DestroyedUnderlyingResource = 5,
}

impl ViolationKind {
    /// Returns the kind with the given raw value.
    #[inline]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => ViolationKind::OutOfBoundsIndex,
            2 => ViolationKind::UnwrittenDescriptor,
            3 => ViolationKind::NullDescriptorUse,
            4 => ViolationKind::StaleBindingAfterIncompatibleRebind,
            5 => ViolationKind::DestroyedUnderlyingResource,
            _ => return None,
        })
    }

    /// Returns the VUID that is violated when the violation happens during `command`.
    pub fn vuid(self, command: CommandKind) -> &'static str {
        let [out_of_bounds, unwritten, null, stale] = match command {
            CommandKind::Draw => [
                "VUID-vkCmdDraw-None-10068",
                "VUID-vkCmdDraw-None-08114",
                "VUID-vkCmdDraw-None-08115",
                "VUID-vkCmdDraw-None-08600",
            ],
            CommandKind::Dispatch => [
                "VUID-vkCmdDispatch-None-10068",
                "VUID-vkCmdDispatch-None-08114",
                "VUID-vkCmdDispatch-None-08115",
                "VUID-vkCmdDispatch-None-08600",
            ],
            CommandKind::TraceRays => [
                "VUID-vkCmdTraceRaysKHR-None-10068",
                "VUID-vkCmdTraceRaysKHR-None-08114",
                "VUID-vkCmdTraceRaysKHR-None-08115",
                "VUID-vkCmdTraceRaysKHR-None-08600",
            ],
        };

        match self {
            ViolationKind::OutOfBoundsIndex => out_of_bounds,
            ViolationKind::UnwrittenDescriptor | ViolationKind::DestroyedUnderlyingResource => {
                unwritten
            }
            ViolationKind::NullDescriptorUse => null,
            ViolationKind::StaleBindingAfterIncompatibleRebind => stale,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            ViolationKind::OutOfBoundsIndex => "the array index is out of bounds",
            ViolationKind::UnwrittenDescriptor => "the descriptor has never been written",
            ViolationKind::NullDescriptorUse => {
                "the descriptor is null, but the `null_descriptor` feature is not enabled"
            }
            ViolationKind::StaleBindingAfterIncompatibleRebind => {
                "the descriptor set was disturbed by binding a descriptor set with an \
                incompatible pipeline layout"
            }
            ViolationKind::DestroyedUnderlyingResource => {
                "the resource that the descriptor refers to has been destroyed"
            }
        }
    }
}

/// A violation that was detected by the device, translated back to the objects involved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedViolation {
    pub kind: ViolationKind,
    pub stage: ShaderStage,
    pub set: u32,
    pub binding: u32,
    pub element: u32,

    /// The VUID that was violated.
    pub vuid: &'static str,

    /// The command during which the violation happened.
    pub command: CommandKind,

    /// The index of the command, in recording order, among all commands of the command buffer.
    pub command_index: u32,

    pub bind_point: PipelineBindPoint,

    /// A description of the access within the shader.
    pub location: String,

    /// The descriptor set that was bound at `set`, if any.
    pub descriptor_set: Option<NonZero<u64>>,

    /// The layout of the descriptor set that was bound at `set`, if any.
    pub descriptor_set_layout: Option<NonZero<u64>>,

    /// The pipeline layout that the descriptor set was bound with, if any.
    pub pipeline_layout: Option<NonZero<u64>>,

    /// The shader module that performed the access.
    pub shader_module: NonZero<u64>,
}

impl Display for DecodedViolation {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(
            f,
            "{} (command #{}, {:?} stage): {}: set {}, binding {}, element {}",
            self.command.name(),
            self.command_index,
            self.stage,
            self.kind.describe(),
            self.set,
            self.binding,
            self.element,
        )?;

        if let Some(descriptor_set) = self.descriptor_set {
            write!(f, " (descriptor set {})", descriptor_set)?;
        }

        write!(f, ", at {}\n\nVulkan VUIDs:\n    {}", self.location, self.vuid)
    }
}

#[cfg(test)]
mod tests {
    use super::{ErrorChannel, ErrorRecord, ViolationKind, CURSOR, DROPPED};
    use crate::shader::ShaderStage;
    use std::{sync::atomic::Ordering, thread};

    fn record(element: u32) -> ErrorRecord {
        ErrorRecord::new(
            ViolationKind::OutOfBoundsIndex,
            3,
            ShaderStage::Fragment,
            0,
            1,
            element,
            0,
        )
    }

    #[test]
    fn record_layout() {
        assert_eq!(size_of::<ErrorRecord>(), ErrorRecord::WORDS * 4);

        let record = record(9);
        assert_eq!(record.violation_kind(), Some(ViolationKind::OutOfBoundsIndex));
        assert_eq!(record.command_index(), 3);
        assert_eq!(record.shader_stage(), Some(ShaderStage::Fragment));
        assert_eq!(ErrorRecord::default().violation_kind(), None);
    }

    #[test]
    fn keeps_first_records() {
        let mut channel = ErrorChannel::new(4);

        for element in 0..10 {
            channel.report(&record(element));
        }
        assert_eq!(channel.reported(), 10);

        let records = channel.drain();
        assert_eq!(
            records.iter().map(|r| r.element).collect::<Vec<_>>(),
            [0, 1, 2, 3],
        );
        assert_eq!(channel.reported(), 0);
        assert!(channel.drain().is_empty());
    }

    #[test]
    fn overflow_saturates() {
        let mut channel = ErrorChannel::new(2);
        channel.report(&record(0));
        channel.report(&record(1));
        channel.words[DROPPED].store(u32::MAX - 1, Ordering::Relaxed);

        for element in 2..6 {
            assert!(!channel.report(&record(element)));
        }

        // The cursor stays at the capacity, and the dropped count does not wrap around.
        assert_eq!(channel.words[CURSOR].load(Ordering::Relaxed), 2);
        assert_eq!(channel.dropped(), u32::MAX);
        assert_eq!(channel.reported(), u32::MAX);
        assert_eq!(channel.claim(), None);

        let records = channel.drain();
        assert_eq!(
            records.iter().map(|r| r.element).collect::<Vec<_>>(),
            [0, 1],
        );
        assert_eq!(channel.dropped(), 0);
        assert_eq!(channel.claim(), Some(0));
    }

    #[test]
    fn concurrent_reports() {
        let mut channel = ErrorChannel::new(64);

        thread::scope(|scope| {
            for lane in 0..8 {
                let channel = &channel;
                scope.spawn(move || {
                    for i in 0..16 {
                        channel.report(&record(lane * 16 + i));
                    }
                });
            }
        });

        let mut elements: Vec<_> = channel.drain().iter().map(|r| r.element).collect();
        assert_eq!(elements.len(), 64);

        // Every slot holds a complete record, and no record was written twice.
        elements.sort_unstable();
        elements.dedup();
        assert_eq!(elements.len(), 64);
    }
}

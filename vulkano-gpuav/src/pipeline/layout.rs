//! A pipeline layout describes the layout of descriptors and push constants used by a pipeline.
//!
//! # Overview
//!
//! The layout itself only *describes* the descriptors and push constants, and does not contain
//! their content itself. Instead, you can think of it as a `struct` definition that states which
//! members there are, what types they have, and in what order.
//!
//! A pipeline layout is made of zero or more descriptor set layouts, indexed by set number, and
//! zero or more push constant ranges.
//!
//! # Layout compatibility
//!
//! When a descriptor set is bound with a pipeline layout, it remains usable by a pipeline with a
//! different layout, as long as the two layouts are *compatible* up to the set number of the
//! descriptor set. Two layouts are compatible for the first `n` sets if they have the same push
//! constant ranges, and the same descriptor set layout *objects* for each of those sets.
//!
//! Compatibility is decided by identity: two descriptor set layouts that were created from equal
//! create infos are still different layouts. Share the same `Arc<DescriptorSetLayout>` between
//! pipeline layouts to make them compatible.

use crate::{
    descriptor_set::layout::DescriptorSetLayout,
    device::{Device, DeviceOwned},
    macros::impl_id_counter,
    shader::ShaderStages,
    ValidationError,
};
use std::{num::NonZero, sync::Arc};

/// Describes the layout of descriptor sets and push constants that are made available to
/// shaders.
#[derive(Debug)]
pub struct PipelineLayout {
    device: Arc<Device>,
    id: NonZero<u64>,

    set_layouts: Vec<Arc<DescriptorSetLayout>>,
    push_constant_ranges: Vec<PushConstantRange>,
}

impl PipelineLayout {
    /// Creates a new `PipelineLayout`.
    ///
    /// # Panics
    ///
    /// - Panics if an element of `create_info.set_layouts` belongs to a different device.
    pub fn new(
        device: Arc<Device>,
        create_info: PipelineLayoutCreateInfo,
    ) -> Result<Arc<PipelineLayout>, Box<ValidationError>> {
        create_info
            .validate(&device)
            .map_err(|err| err.add_context("create_info"))?;

        let PipelineLayoutCreateInfo {
            set_layouts,
            mut push_constant_ranges,
            _ne: _,
        } = create_info;

        // Sort the ranges, so that equal sets of ranges compare equal.
        push_constant_ranges
            .sort_unstable_by_key(|range| (range.offset, range.size, range.stages.as_raw()));

        Ok(Arc::new(PipelineLayout {
            device,
            id: Self::next_id(),
            set_layouts,
            push_constant_ranges,
        }))
    }

    /// Returns the descriptor set layouts this pipeline layout was created from.
    #[inline]
    pub fn set_layouts(&self) -> &[Arc<DescriptorSetLayout>] {
        &self.set_layouts
    }

    /// Returns a sorted list of push constant ranges for the pipeline layout.
    #[inline]
    pub fn push_constant_ranges(&self) -> &[PushConstantRange] {
        &self.push_constant_ranges
    }

    /// Returns whether `self` is compatible with `other` for the given number of sets.
    ///
    /// # Panics
    ///
    /// - Panics if `num_sets` is greater than the number of sets in `self`.
    #[inline]
    pub fn is_compatible_with(&self, other: &PipelineLayout, num_sets: u32) -> bool {
        let num_sets = num_sets as usize;
        assert!(num_sets <= self.set_layouts.len());

        if self == other {
            return true;
        }

        if self.push_constant_ranges != other.push_constant_ranges {
            return false;
        }

        let other_sets = match other.set_layouts.get(0..num_sets) {
            Some(x) => x,
            None => return false,
        };

        self.set_layouts
            .iter()
            .zip(other_sets)
            .all(|(self_set_layout, other_set_layout)| self_set_layout == other_set_layout)
    }

    /// Returns whether the push constant ranges of `self` that include any of `stages` cover
    /// every byte of `offset..offset + size`.
    pub(crate) fn push_constants_cover(&self, stages: ShaderStages, offset: u32, size: u32) -> bool {
        let end = offset.saturating_add(size);

        (offset..end).step_by(4).all(|byte| {
            self.push_constant_ranges.iter().any(|range| {
                range.stages.intersects(stages)
                    && range.offset <= byte
                    && byte < range.offset + range.size
            })
        })
    }
}

unsafe impl DeviceOwned for PipelineLayout {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl_id_counter!(PipelineLayout);

/// Parameters to create a new `PipelineLayout`.
#[derive(Clone, Debug)]
pub struct PipelineLayoutCreateInfo {
    /// The descriptor set layouts that should be part of the pipeline layout.
    ///
    /// They are provided in order of set number.
    ///
    /// The default value is empty.
    pub set_layouts: Vec<Arc<DescriptorSetLayout>>,

    /// The ranges of push constants that the pipeline will access.
    ///
    /// A shader stage can only appear in one element of the list, but it is possible to combine
    /// ranges for multiple shader stages if they are the same.
    ///
    /// The default value is empty.
    pub push_constant_ranges: Vec<PushConstantRange>,

    pub _ne: crate::NonExhaustive,
}

impl Default for PipelineLayoutCreateInfo {
    #[inline]
    fn default() -> Self {
        Self {
            set_layouts: Vec::new(),
            push_constant_ranges: Vec::new(),
            _ne: crate::NonExhaustive(()),
        }
    }
}

impl PipelineLayoutCreateInfo {
    pub(crate) fn validate(&self, device: &Device) -> Result<(), Box<ValidationError>> {
        let properties = device.properties();

        let &Self {
            ref set_layouts,
            ref push_constant_ranges,
            _ne: _,
        } = self;

        for set_layout in set_layouts {
            assert_eq!(set_layout.device().id(), device.id());
        }

        if set_layouts.len() > properties.max_bound_descriptor_sets as usize {
            return Err(Box::new(ValidationError {
                context: "set_layouts".into(),
                problem: "the length exceeds the `max_bound_descriptor_sets` limit".into(),
                vuids: &["VUID-VkPipelineLayoutCreateInfo-setLayoutCount-00286"],
                ..Default::default()
            }));
        }

        let mut seen_stages = ShaderStages::empty();

        for (range_index, range) in push_constant_ranges.iter().enumerate() {
            range
                .validate(device)
                .map_err(|err| err.add_context(format!("push_constant_ranges[{}]", range_index)))?;

            let &PushConstantRange {
                stages,
                offset: _,
                size: _,
            } = range;

            if seen_stages.intersects(stages) {
                return Err(Box::new(ValidationError {
                    context: "push_constant_ranges".into(),
                    problem: "contains more than one range with the same stage".into(),
                    vuids: &["VUID-VkPipelineLayoutCreateInfo-pPushConstantRanges-00292"],
                    ..Default::default()
                }));
            }

            seen_stages |= stages;
        }

        Ok(())
    }
}

/// Description of a range of the push constants of a pipeline layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PushConstantRange {
    /// The stages which can access this range. A stage can access at most one push constant range.
    ///
    /// The default value is [`ShaderStages::empty()`], which must be overridden.
    pub stages: ShaderStages,

    /// Offset in bytes from the start of the push constants to this range.
    ///
    /// The value must be a multiple of 4.
    ///
    /// The default value is `0`.
    pub offset: u32,

    /// Size in bytes of the range.
    ///
    /// The value must be a multiple of 4, and not 0.
    ///
    /// The default value is `0`, which must be overridden.
    pub size: u32,
}

impl Default for PushConstantRange {
    #[inline]
    fn default() -> Self {
        Self {
            stages: ShaderStages::empty(),
            offset: 0,
            size: 0,
        }
    }
}

impl PushConstantRange {
    pub(crate) fn validate(&self, device: &Device) -> Result<(), Box<ValidationError>> {
        let &Self {
            stages,
            offset,
            size,
        } = self;

        if stages.is_empty() {
            return Err(Box::new(ValidationError {
                context: "stages".into(),
                problem: "is empty".into(),
                vuids: &["VUID-VkPushConstantRange-stageFlags-requiredbitmask"],
                ..Default::default()
            }));
        }

        let max_push_constants_size = device.properties().max_push_constants_size;

        if offset >= max_push_constants_size {
            return Err(Box::new(ValidationError {
                context: "offset".into(),
                problem: "is not less than the `max_push_constants_size` limit".into(),
                vuids: &["VUID-VkPushConstantRange-offset-00294"],
                ..Default::default()
            }));
        }

        if offset % 4 != 0 {
            return Err(Box::new(ValidationError {
                context: "offset".into(),
                problem: "is not a multiple of 4".into(),
                vuids: &["VUID-VkPushConstantRange-offset-00295"],
                ..Default::default()
            }));
        }

        if size == 0 {
            return Err(Box::new(ValidationError {
                context: "size".into(),
                problem: "is zero".into(),
                vuids: &["VUID-VkPushConstantRange-size-00296"],
                ..Default::default()
            }));
        }

        if size % 4 != 0 {
            return Err(Box::new(ValidationError {
                context: "size".into(),
                problem: "is not a multiple of 4".into(),
                vuids: &["VUID-VkPushConstantRange-size-00297"],
                ..Default::default()
            }));
        }

        if size > max_push_constants_size - offset {
            return Err(Box::new(ValidationError {
                problem: "`size` is greater than `max_push_constants_size` limit minus `offset`"
                    .into(),
                vuids: &["VUID-VkPushConstantRange-size-00298"],
                ..Default::default()
            }));
        }

        Ok(())
    }
}

//! Describes the layout of all descriptors within a descriptor set.
//!
//! When creating a new descriptor set, you must provide a *layout* object to create it from.
//! Layouts are compared by identity: two layouts that were created separately are never
//! considered the same, even if their bindings are identical.

use crate::{
    device::{Device, DeviceOwned},
    macros::{impl_id_counter, vulkan_bitflags, vulkan_enum},
    ValidationError,
};
use foldhash::HashMap;
use std::{collections::BTreeMap, num::NonZero, sync::Arc};

/// Describes the layout of all descriptors within a descriptor set.
#[derive(Debug)]
pub struct DescriptorSetLayout {
    device: Arc<Device>,
    id: NonZero<u64>,

    flags: DescriptorSetLayoutCreateFlags,
    bindings: BTreeMap<u32, DescriptorSetLayoutBinding>,

    descriptor_counts: HashMap<DescriptorType, u32>,
}

impl DescriptorSetLayout {
    /// Creates a new `DescriptorSetLayout`.
    pub fn new(
        device: Arc<Device>,
        create_info: DescriptorSetLayoutCreateInfo,
    ) -> Result<Arc<DescriptorSetLayout>, Box<ValidationError>> {
        Self::validate_new(&device, &create_info)?;

        let DescriptorSetLayoutCreateInfo {
            flags,
            bindings,
            _ne: _,
        } = create_info;

        let mut descriptor_counts = HashMap::default();

        for binding in bindings.values() {
            if binding.descriptor_count != 0 {
                *descriptor_counts
                    .entry(binding.descriptor_type)
                    .or_default() += binding.descriptor_count;
            }
        }

        Ok(Arc::new(DescriptorSetLayout {
            device,
            id: Self::next_id(),
            flags,
            bindings,
            descriptor_counts,
        }))
    }

    fn validate_new(
        device: &Device,
        create_info: &DescriptorSetLayoutCreateInfo,
    ) -> Result<(), Box<ValidationError>> {
        create_info
            .validate(device)
            .map_err(|err| err.add_context("create_info"))?;

        let total_descriptor_count: u64 = create_info
            .bindings
            .values()
            .map(|binding| u64::from(binding.descriptor_count))
            .sum();

        if total_descriptor_count > u64::from(device.properties().max_per_set_descriptors) {
            return Err(Box::new(ValidationError {
                problem: "the total number of descriptors across all bindings is greater than \
                    the `max_per_set_descriptors` limit"
                    .into(),
                ..Default::default()
            }));
        }

        Ok(())
    }

    /// Returns the flags that the descriptor set layout was created with.
    #[inline]
    pub fn flags(&self) -> DescriptorSetLayoutCreateFlags {
        self.flags
    }

    /// Returns the bindings of the descriptor set layout.
    #[inline]
    pub fn bindings(&self) -> &BTreeMap<u32, DescriptorSetLayoutBinding> {
        &self.bindings
    }

    /// Returns the binding with the given binding number, if it exists.
    #[inline]
    pub fn binding(&self, binding: u32) -> Option<&DescriptorSetLayoutBinding> {
        self.bindings.get(&binding)
    }

    /// Returns the number of descriptors of each type.
    ///
    /// The map is guaranteed to not contain any elements with a count of `0`.
    #[inline]
    pub fn descriptor_counts(&self) -> &HashMap<DescriptorType, u32> {
        &self.descriptor_counts
    }

    /// If the highest-numbered binding has a variable count, returns its `descriptor_count`.
    /// Otherwise returns `0`.
    #[inline]
    pub fn variable_descriptor_count(&self) -> u32 {
        self.bindings
            .values()
            .next_back()
            .map(|binding| {
                if binding
                    .binding_flags
                    .intersects(DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT)
                {
                    binding.descriptor_count
                } else {
                    0
                }
            })
            .unwrap_or(0)
    }

    /// Returns the binding number of the variable-count binding, if there is one.
    #[inline]
    pub fn variable_binding(&self) -> Option<u32> {
        self.bindings
            .iter()
            .next_back()
            .filter(|(_, binding)| {
                binding
                    .binding_flags
                    .intersects(DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT)
            })
            .map(|(&binding_num, _)| binding_num)
    }
}

unsafe impl DeviceOwned for DescriptorSetLayout {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl_id_counter!(DescriptorSetLayout);

/// Parameters to create a new `DescriptorSetLayout`.
#[derive(Clone, Debug)]
pub struct DescriptorSetLayoutCreateInfo {
    /// Specifies how to create the descriptor set layout.
    ///
    /// The default value is empty.
    pub flags: DescriptorSetLayoutCreateFlags,

    /// The bindings of the descriptor set layout. These are specified according to binding
    /// number.
    ///
    /// It is generally advisable to keep the binding numbers low. Higher binding numbers may
    /// use more memory inside Vulkan.
    ///
    /// The default value is empty.
    pub bindings: BTreeMap<u32, DescriptorSetLayoutBinding>,

    pub _ne: crate::NonExhaustive,
}

impl DescriptorSetLayoutCreateInfo {
    pub(crate) fn validate(&self, device: &Device) -> Result<(), Box<ValidationError>> {
        let &Self {
            flags,
            ref bindings,
            _ne: _,
        } = self;

        let highest_binding_num = bindings.keys().copied().next_back();

        for (&binding_num, binding) in bindings.iter() {
            binding
                .validate(device)
                .map_err(|err| err.add_context(format!("bindings[{}]", binding_num)))?;

            let &DescriptorSetLayoutBinding {
                binding_flags,
                descriptor_type: _,
                descriptor_count: _,
                skip_validation: _,
                _ne: _,
            } = binding;

            if binding_flags.intersects(DescriptorBindingFlags::UPDATE_AFTER_BIND)
                && !flags.intersects(DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            {
                return Err(Box::new(ValidationError {
                    problem: format!(
                        "`bindings[{}].binding_flags` contains \
                        `DescriptorBindingFlags::UPDATE_AFTER_BIND`, but \
                        `flags` does not contain \
                        `DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL`",
                        binding_num
                    )
                    .into(),
                    vuids: &["VUID-VkDescriptorSetLayoutCreateInfo-flags-03000"],
                    ..Default::default()
                }));
            }

            if binding_flags.intersects(DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT)
                && Some(binding_num) != highest_binding_num
            {
                return Err(Box::new(ValidationError {
                    problem: format!(
                        "`bindings[{}].binding_flags` contains \
                        `DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT`, but {0} is not the \
                        highest binding number in `bindings`",
                        binding_num
                    )
                    .into(),
                    vuids: &["VUID-VkDescriptorSetLayoutBindingFlagsCreateInfo-pBindingFlags-03004"],
                    ..Default::default()
                }));
            }
        }

        Ok(())
    }
}

impl Default for DescriptorSetLayoutCreateInfo {
    #[inline]
    fn default() -> Self {
        Self {
            flags: DescriptorSetLayoutCreateFlags::empty(),
            bindings: BTreeMap::new(),
            _ne: crate::NonExhaustive(()),
        }
    }
}

vulkan_bitflags! {
    /// Flags that control how a descriptor set layout is created.
    DescriptorSetLayoutCreateFlags = DescriptorSetLayoutCreateFlags(u32);

    /// Whether descriptor sets using this descriptor set layout must be allocated from a
    /// descriptor pool whose flags contain `UPDATE_AFTER_BIND`. Bindings with the
    /// [`DescriptorBindingFlags::UPDATE_AFTER_BIND`] flag can only be used in layouts with this
    /// flag.
    UPDATE_AFTER_BIND_POOL = UPDATE_AFTER_BIND_POOL,
}

/// A binding in a descriptor set layout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DescriptorSetLayoutBinding {
    /// Specifies how to create the binding.
    ///
    /// The default value is empty.
    pub binding_flags: DescriptorBindingFlags,

    /// The content and layout of each array element of a binding.
    ///
    /// There is no default value.
    pub descriptor_type: DescriptorType,

    /// How many descriptors (array elements) this binding is made of.
    ///
    /// If the binding is a single element rather than an array, then you must specify `1`.
    /// For a binding with the [`DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT`] flag, this is
    /// the upper bound of the count that can be chosen when a descriptor set is allocated.
    ///
    /// The default value is `1`.
    pub descriptor_count: u32,

    /// Excludes this binding from GPU-assisted validation. Accesses to the binding are not
    /// instrumented, and the binding is left out of the binding snapshots.
    ///
    /// The default value is `false`.
    pub skip_validation: bool,

    pub _ne: crate::NonExhaustive,
}

impl DescriptorSetLayoutBinding {
    /// Returns a `DescriptorSetLayoutBinding` with the given type.
    #[inline]
    pub fn descriptor_type(descriptor_type: DescriptorType) -> Self {
        Self {
            binding_flags: DescriptorBindingFlags::empty(),
            descriptor_type,
            descriptor_count: 1,
            skip_validation: false,
            _ne: crate::NonExhaustive(()),
        }
    }

    pub(crate) fn validate(&self, device: &Device) -> Result<(), Box<ValidationError>> {
        let &Self {
            binding_flags,
            descriptor_type,
            descriptor_count,
            skip_validation: _,
            _ne: _,
        } = self;

        if descriptor_type == DescriptorType::InlineUniformBlock && descriptor_count % 4 != 0 {
            return Err(Box::new(ValidationError {
                problem: "`descriptor_type` is `DescriptorType::InlineUniformBlock`, and \
                    `descriptor_count` is not a multiple of 4"
                    .into(),
                vuids: &["VUID-VkDescriptorSetLayoutBinding-descriptorType-02209"],
                ..Default::default()
            }));
        }

        let features = device.enabled_features();

        if binding_flags.intersects(DescriptorBindingFlags::UPDATE_AFTER_BIND) {
            if matches!(
                descriptor_type,
                DescriptorType::InputAttachment
                    | DescriptorType::UniformBufferDynamic
                    | DescriptorType::StorageBufferDynamic
            ) {
                return Err(Box::new(ValidationError {
                    problem: "`binding_flags` contains \
                        `DescriptorBindingFlags::UPDATE_AFTER_BIND`, and \
                        `descriptor_type` is `DescriptorType::InputAttachment`, \
                        `DescriptorType::UniformBufferDynamic` or \
                        `DescriptorType::StorageBufferDynamic`"
                        .into(),
                    vuids: &["VUID-VkDescriptorSetLayoutBindingFlagsCreateInfo-None-03011"],
                    ..Default::default()
                }));
            }

            if !features.descriptor_binding_update_after_bind {
                return Err(Box::new(ValidationError {
                    context: "binding_flags".into(),
                    problem: "contains `DescriptorBindingFlags::UPDATE_AFTER_BIND`, but the \
                        `descriptor_binding_update_after_bind` feature is not enabled"
                        .into(),
                    vuids: &["VUID-VkDescriptorSetLayoutBindingFlagsCreateInfo-descriptorBindingStorageBufferUpdateAfterBind-03008"],
                    ..Default::default()
                }));
            }
        }

        if binding_flags.intersects(DescriptorBindingFlags::UPDATE_UNUSED_WHILE_PENDING)
            && !features.descriptor_binding_update_unused_while_pending
        {
            return Err(Box::new(ValidationError {
                context: "binding_flags".into(),
                problem: "contains `DescriptorBindingFlags::UPDATE_UNUSED_WHILE_PENDING`, but the \
                    `descriptor_binding_update_unused_while_pending` feature is not enabled"
                    .into(),
                vuids: &["VUID-VkDescriptorSetLayoutBindingFlagsCreateInfo-descriptorBindingUpdateUnusedWhilePending-03012"],
                ..Default::default()
            }));
        }

        if binding_flags.intersects(DescriptorBindingFlags::PARTIALLY_BOUND)
            && !features.descriptor_binding_partially_bound
        {
            return Err(Box::new(ValidationError {
                context: "binding_flags".into(),
                problem: "contains `DescriptorBindingFlags::PARTIALLY_BOUND`, but the \
                    `descriptor_binding_partially_bound` feature is not enabled"
                    .into(),
                vuids: &["VUID-VkDescriptorSetLayoutBindingFlagsCreateInfo-descriptorBindingPartiallyBound-03013"],
                ..Default::default()
            }));
        }

        if binding_flags.intersects(DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT) {
            if !features.descriptor_binding_variable_descriptor_count {
                return Err(Box::new(ValidationError {
                    context: "binding_flags".into(),
                    problem: "contains `DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT`, but \
                        the `descriptor_binding_variable_descriptor_count` feature is not enabled"
                        .into(),
                    vuids: &["VUID-VkDescriptorSetLayoutBindingFlagsCreateInfo-descriptorBindingVariableDescriptorCount-03014"],
                    ..Default::default()
                }));
            }

            if descriptor_type.is_dynamic() {
                return Err(Box::new(ValidationError {
                    problem: "`binding_flags` contains \
                        `DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT`, and \
                        `descriptor_type` is `DescriptorType::UniformBufferDynamic` or \
                        `DescriptorType::StorageBufferDynamic`"
                        .into(),
                    vuids: &["VUID-VkDescriptorSetLayoutBindingFlagsCreateInfo-pBindingFlags-03015"],
                    ..Default::default()
                }));
            }
        }

        Ok(())
    }
}

vulkan_bitflags! {
    /// Flags that control how a binding in a descriptor set layout is created.
    DescriptorBindingFlags = DescriptorBindingFlags(u32);

    /// Allows descriptors in this binding to be updated after a command buffer has already
    /// recorded a bind command containing a descriptor set with this layout, as long as the
    /// command buffer is not executing. Each descriptor can also be updated concurrently.
    ///
    /// The binding snapshot of such a binding is refreshed when the command buffer is submitted,
    /// so that updates made between recording and submission are seen by the device.
    UPDATE_AFTER_BIND = UPDATE_AFTER_BIND,

    /// Allows descriptors in this binding to be updated after a command buffer has already
    /// recorded a bind command containing a descriptor set with this layout, as long as no
    /// shader invocation recorded in the command buffer *uses* the descriptor.
    UPDATE_UNUSED_WHILE_PENDING = UPDATE_UNUSED_WHILE_PENDING,

    /// Allows descriptors to be left empty or invalid even if they are *statically used* by a
    /// shader invocation, as long as they are not *dynamically used*.
    ///
    /// Whether a descriptor is dynamically used can only be determined while the shader
    /// executes, so an access to an unwritten element of such a binding is still reported by
    /// the device.
    PARTIALLY_BOUND = PARTIALLY_BOUND,

    /// Whether the binding has a variable number of descriptors.
    ///
    /// There may only be one binding with a variable count in a descriptor set, and it must be the
    /// binding with the highest binding number. The `descriptor_type` must not be
    /// [`DescriptorType::UniformBufferDynamic`] or [`DescriptorType::StorageBufferDynamic`].
    VARIABLE_DESCRIPTOR_COUNT = VARIABLE_DESCRIPTOR_COUNT,
}

vulkan_enum! {
    /// Describes what kind of resource may later be bound to a descriptor.
    DescriptorType impl {
        /// Returns whether the type is one of the dynamic buffer types, whose offset is
        /// specified when the descriptor set is bound.
        #[inline]
        pub const fn is_dynamic(self) -> bool {
            matches!(
                self,
                DescriptorType::UniformBufferDynamic | DescriptorType::StorageBufferDynamic
            )
        }

        /// Returns whether the type refers to an image.
        #[inline]
        pub const fn is_image(self) -> bool {
            matches!(
                self,
                DescriptorType::CombinedImageSampler
                    | DescriptorType::SampledImage
                    | DescriptorType::StorageImage
                    | DescriptorType::InputAttachment
            )
        }

        /// Returns whether a shader can write through a descriptor of this type.
        #[inline]
        pub const fn is_writable(self) -> bool {
            matches!(
                self,
                DescriptorType::StorageImage
                    | DescriptorType::StorageTexelBuffer
                    | DescriptorType::StorageBuffer
                    | DescriptorType::StorageBufferDynamic
            )
        }
    }
    = DescriptorType(i32);

    /// Describes how a `SampledImage` descriptor should be read.
    Sampler = SAMPLER,

    /// Combines `SampledImage` and `Sampler` in one descriptor.
    CombinedImageSampler = COMBINED_IMAGE_SAMPLER,

    /// Gives read-only access to an image via a sampler. The image must be combined with a sampler
    /// inside the shader.
    SampledImage = SAMPLED_IMAGE,

    /// Gives read and/or write access to individual pixels in an image.
    StorageImage = STORAGE_IMAGE,

    /// Gives read-only access to the content of a buffer, interpreted as an array of texel data.
    UniformTexelBuffer = UNIFORM_TEXEL_BUFFER,

    /// Gives read and/or write access to the content of a buffer, interpreted as an array of texel
    /// data.
    StorageTexelBuffer = STORAGE_TEXEL_BUFFER,

    /// Gives read-only access to the content of a buffer, interpreted as a structure.
    UniformBuffer = UNIFORM_BUFFER,

    /// Gives read and/or write access to the content of a buffer, interpreted as a structure.
    StorageBuffer = STORAGE_BUFFER,

    /// As `UniformBuffer`, but the offset within the buffer is specified at the time the descriptor
    /// set is bound, rather than when the descriptor set is updated.
    UniformBufferDynamic = UNIFORM_BUFFER_DYNAMIC,

    /// As `StorageBuffer`, but the offset within the buffer is specified at the time the descriptor
    /// set is bound, rather than when the descriptor set is updated.
    StorageBufferDynamic = STORAGE_BUFFER_DYNAMIC,

    /// Gives access to an image inside a fragment shader via a render pass.
    InputAttachment = INPUT_ATTACHMENT,

    /// Data written directly into the descriptor set. `descriptor_count` is a number of bytes,
    /// and must be a multiple of 4.
    InlineUniformBlock = INLINE_UNIFORM_BLOCK,

    /// Gives read access to an acceleration structure, for performing ray queries and ray tracing.
    AccelerationStructure = ACCELERATION_STRUCTURE_KHR,
}

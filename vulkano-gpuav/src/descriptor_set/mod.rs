//! Bindings between shaders and the resources they access.
//!
//! # Overview
//!
//! In order to access a buffer or an image from a shader, that buffer or image must be put in a
//! *descriptor*. Descriptors are grouped in *descriptor sets*, whose shape is described by a
//! [`DescriptorSetLayout`]. A binding of a layout may be an array of descriptors, and with
//! descriptor indexing, the shader may select the element of that array with an index that is
//! only known while it runs.
//!
//! A [`DescriptorSet`] in this crate does not hold the resources themselves. For every element of
//! every binding it only keeps the [`DescriptorValidity`] of the element, and the [`ResourceId`]
//! that was last written to it, which is all that is needed to tell whether a shader may access
//! the element.
//!
//! Updating a range of elements never touches the elements outside of that range. In particular,
//! writing to element 1 of a binding leaves element 0 in whatever state it was before.

pub use self::update::{CopyDescriptorSet, WriteDescriptorSet, WriteDescriptorSetElements};
use self::layout::{DescriptorBindingFlags, DescriptorSetLayout, DescriptorType};
use crate::{
    device::{Device, DeviceOwned},
    macros::impl_id_counter,
    ValidationError,
};
use foldhash::HashMap;
use parking_lot::{RwLock, RwLockReadGuard};
use std::{
    error::Error,
    fmt::{Display, Error as FmtError, Formatter},
    num::NonZero,
    ops::Range,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

pub mod layout;
mod update;

/// An instance of a descriptor set layout, whose contents are tracked per array element.
#[derive(Debug)]
pub struct DescriptorSet {
    id: NonZero<u64>,
    layout: Arc<DescriptorSetLayout>,
    variable_descriptor_count: u32,
    resources: RwLock<DescriptorSetResources>,
    version: AtomicU64,
}

impl DescriptorSet {
    /// Allocates a new descriptor set. Every element of every binding starts out as
    /// [`DescriptorValidity::Unwritten`].
    ///
    /// If the layout has a binding with a variable descriptor count, `variable_descriptor_count`
    /// is the number of elements that binding has in the new set. Otherwise it must be `0`.
    pub fn new(
        layout: Arc<DescriptorSetLayout>,
        variable_descriptor_count: u32,
    ) -> Result<Arc<DescriptorSet>, Box<ValidationError>> {
        if variable_descriptor_count > layout.variable_descriptor_count() {
            return Err(Box::new(ValidationError {
                context: "variable_descriptor_count".into(),
                problem: "is greater than the maximum number of descriptors of the variable \
                    count binding of `layout`"
                    .into(),
                vuids: &["VUID-VkDescriptorSetVariableDescriptorCountAllocateInfo-pSetLayouts-03046"],
                ..Default::default()
            }));
        }

        let descriptor_set = Arc::new(DescriptorSet {
            id: Self::next_id(),
            resources: RwLock::new(DescriptorSetResources::new(
                &layout,
                variable_descriptor_count,
            )),
            layout,
            variable_descriptor_count,
            version: AtomicU64::new(0),
        });
        descriptor_set
            .device()
            .register_descriptor_set(&descriptor_set);

        Ok(descriptor_set)
    }

    /// Returns the layout of this descriptor set.
    #[inline]
    pub fn layout(&self) -> &Arc<DescriptorSetLayout> {
        &self.layout
    }

    /// Returns the variable descriptor count that this descriptor set was allocated with.
    #[inline]
    pub fn variable_descriptor_count(&self) -> u32 {
        self.variable_descriptor_count
    }

    /// Returns the number of elements that `binding` has in this descriptor set, or `None` if
    /// the layout has no such binding.
    #[inline]
    pub fn element_count(&self, binding: u32) -> Option<u32> {
        self.resources
            .read()
            .binding(binding)
            .map(|binding_resources| binding_resources.validity.len() as u32)
    }

    /// Returns the state of the descriptors in this set.
    #[inline]
    pub fn resources(&self) -> RwLockReadGuard<'_, DescriptorSetResources> {
        self.resources.read()
    }

    /// Returns the validity of a single element, or `None` if it does not exist.
    #[inline]
    pub fn validity(&self, binding: u32, element: u32) -> Option<DescriptorValidity> {
        self.resources
            .read()
            .binding(binding)
            .and_then(|binding_resources| binding_resources.validity().get(element as usize))
            .copied()
    }

    /// Returns the number of times the contents of this descriptor set have been modified.
    ///
    /// Two reads that return the same version observed the same contents.
    #[inline]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Sets the validity of the elements `element_range` of `binding`, without changing the
    /// other elements of the binding.
    ///
    /// This forgets which resources the elements referred to. Use [`write`](Self::write) to
    /// write actual resources.
    pub fn write_update(
        &self,
        binding: u32,
        element_range: Range<u32>,
        validity: DescriptorValidity,
    ) -> Result<(), DescriptorUpdateError> {
        let mut resources = self.resources.write();
        let binding_resources = self.check_range(&mut resources, binding, &element_range)?;

        if validity == DescriptorValidity::Null {
            self.check_null_descriptor()?;
        }

        let range = element_range.start as usize..element_range.end as usize;
        binding_resources.validity[range.clone()].fill(validity);
        binding_resources.resources[range].fill(None);
        self.bump_version();

        Ok(())
    }

    /// Performs a descriptor write.
    pub fn write(&self, write: &WriteDescriptorSet) -> Result<(), DescriptorUpdateError> {
        let first = write.first_array_element();
        let element_range = first..first.saturating_add(write.elements().len());

        let mut resources = self.resources.write();
        let binding_resources =
            self.check_range(&mut resources, write.binding(), &element_range)?;
        let range = element_range.start as usize..element_range.end as usize;

        match write.elements() {
            WriteDescriptorSetElements::Null(_) => {
                self.check_null_descriptor()?;
                binding_resources.validity[range.clone()].fill(DescriptorValidity::Null);
                binding_resources.resources[range].fill(None);
            }
            WriteDescriptorSetElements::Resource(elements) => {
                binding_resources.validity[range.clone()].fill(DescriptorValidity::Valid);

                for (dst, &resource) in binding_resources.resources[range].iter_mut().zip(elements)
                {
                    *dst = Some(resource);
                }
            }
        }

        self.bump_version();

        Ok(())
    }

    /// Performs a descriptor copy. The source set may be `self`.
    ///
    /// # Panics
    ///
    /// - Panics if `copy.src_set` belongs to a different device than `self`.
    pub fn copy(&self, copy: &CopyDescriptorSet) -> Result<(), DescriptorUpdateError> {
        let &CopyDescriptorSet {
            ref src_set,
            src_binding,
            src_first_array_element,
            dst_binding,
            dst_first_array_element,
            descriptor_count,
            _ne: _,
        } = copy;

        assert_eq!(src_set.device(), self.device());

        let src_type = src_set.descriptor_type(src_binding)?;
        let dst_type = self.descriptor_type(dst_binding)?;

        if src_type != dst_type {
            return Err(DescriptorUpdateError::IncompatibleCopy { src_type, dst_type });
        }

        let src_range =
            src_first_array_element..src_first_array_element.saturating_add(descriptor_count);
        let dst_range =
            dst_first_array_element..dst_first_array_element.saturating_add(descriptor_count);

        // Copy the source elements out first, so that the two locks are never held together.
        let (validity, resource_ids): (Vec<_>, Vec<_>) = {
            let mut src_resources = src_set.resources.write();
            let src_binding_resources =
                src_set.check_range(&mut src_resources, src_binding, &src_range)?;
            let range = src_range.start as usize..src_range.end as usize;

            (
                src_binding_resources.validity[range.clone()].to_vec(),
                src_binding_resources.resources[range].to_vec(),
            )
        };

        let mut resources = self.resources.write();
        let binding_resources = self.check_range(&mut resources, dst_binding, &dst_range)?;
        let range = dst_range.start as usize..dst_range.end as usize;
        binding_resources.validity[range.clone()].clone_from_slice(&validity);
        binding_resources.resources[range].clone_from_slice(&resource_ids);
        self.bump_version();

        Ok(())
    }

    /// Marks every element that refers to `resource` as
    /// [`DescriptorValidity::Destroyed`]. Returns the number of elements that were affected.
    pub(crate) fn resource_destroyed(&self, resource: ResourceId) -> usize {
        let mut resources = self.resources.write();
        let mut affected = 0;

        for binding_resources in resources.bindings.values_mut() {
            for (validity, element_resource) in binding_resources
                .validity
                .iter_mut()
                .zip(&binding_resources.resources)
            {
                if *element_resource == Some(resource) && *validity == DescriptorValidity::Valid {
                    *validity = DescriptorValidity::Destroyed;
                    affected += 1;
                }
            }
        }

        if affected != 0 {
            self.bump_version();
        }

        affected
    }

    fn descriptor_type(&self, binding: u32) -> Result<DescriptorType, DescriptorUpdateError> {
        self.layout
            .binding(binding)
            .map(|layout_binding| layout_binding.descriptor_type)
            .ok_or(DescriptorUpdateError::InvalidBinding { binding })
    }

    fn check_range<'a>(
        &self,
        resources: &'a mut DescriptorSetResources,
        binding: u32,
        element_range: &Range<u32>,
    ) -> Result<&'a mut DescriptorBindingResources, DescriptorUpdateError> {
        let binding_resources = resources
            .bindings
            .get_mut(&binding)
            .ok_or(DescriptorUpdateError::InvalidBinding { binding })?;
        let count = binding_resources.validity.len() as u32;

        if element_range.start > element_range.end || element_range.end > count {
            return Err(DescriptorUpdateError::InvalidRange {
                binding,
                range: element_range.clone(),
                count,
            });
        }

        Ok(binding_resources)
    }

    fn check_null_descriptor(&self) -> Result<(), DescriptorUpdateError> {
        if self.device().enabled_features().null_descriptor {
            Ok(())
        } else {
            Err(DescriptorUpdateError::NullDescriptorNotEnabled)
        }
    }

    fn bump_version(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
    }
}

unsafe impl DeviceOwned for DescriptorSet {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        self.layout.device()
    }
}

impl_id_counter!(DescriptorSet);

/// Identifies a resource (buffer, image view, sampler, ...) that a descriptor refers to.
///
/// This is usually derived from the handle of the resource. The only thing that matters is that
/// two live resources never share an id, so that destroying one does not affect descriptors that
/// refer to the other.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(NonZero<u64>);

impl ResourceId {
    /// Returns a `ResourceId` from its raw value.
    #[inline]
    pub const fn new(raw: NonZero<u64>) -> Self {
        Self(raw)
    }

    /// Returns a `ResourceId` from its raw value, or `None` if it is `0`.
    #[inline]
    pub const fn from_raw(raw: u64) -> Option<Self> {
        match NonZero::new(raw) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }

    /// Returns the raw value of the id.
    #[inline]
    pub const fn as_raw(self) -> u64 {
        self.0.get()
    }
}

/// The state of a single element of a descriptor binding.
///
/// The discriminants are the 2-bit codes that the element has in a binding snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DescriptorValidity {
    /// The element has never been written since the descriptor set was allocated.
    #[default]
    Unwritten = 0,

    /// The element refers to a live resource.
    Valid = 1,

    /// The element was written with a null descriptor.
    Null = 2,

    /// The element refers to a resource that has since been destroyed.
    Destroyed = 3,
}

impl DescriptorValidity {
    /// Returns the validity that has the given 2-bit code. Only the lowest 2 bits of `code` are
    /// looked at.
    #[inline]
    pub const fn from_code(code: u32) -> Self {
        match code & 0b11 {
            0 => DescriptorValidity::Unwritten,
            1 => DescriptorValidity::Valid,
            2 => DescriptorValidity::Null,
            _ => DescriptorValidity::Destroyed,
        }
    }

    /// Returns the 2-bit code of the validity.
    #[inline]
    pub const fn code(self) -> u32 {
        self as u32
    }
}

/// The state of all descriptors of a descriptor set.
#[derive(Clone, Debug)]
pub struct DescriptorSetResources {
    bindings: HashMap<u32, DescriptorBindingResources>,
}

impl DescriptorSetResources {
    /// Creates a new `DescriptorSetResources` matching the provided descriptor set layout, with
    /// every element unwritten.
    pub fn new(layout: &DescriptorSetLayout, variable_descriptor_count: u32) -> Self {
        assert!(variable_descriptor_count <= layout.variable_descriptor_count());

        let bindings = layout
            .bindings()
            .iter()
            .map(|(&binding_num, binding)| {
                let count = if binding
                    .binding_flags
                    .intersects(DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT)
                {
                    variable_descriptor_count
                } else {
                    binding.descriptor_count
                } as usize;

                (
                    binding_num,
                    DescriptorBindingResources {
                        validity: vec![DescriptorValidity::Unwritten; count],
                        resources: vec![None; count],
                    },
                )
            })
            .collect();

        Self { bindings }
    }

    /// Returns a reference to the bound resources for `binding`. Returns `None` if the binding
    /// doesn't exist.
    #[inline]
    pub fn binding(&self, binding: u32) -> Option<&DescriptorBindingResources> {
        self.bindings.get(&binding)
    }
}

/// The state of all descriptors of a single binding.
#[derive(Clone, Debug)]
pub struct DescriptorBindingResources {
    validity: Vec<DescriptorValidity>,
    resources: Vec<Option<ResourceId>>,
}

impl DescriptorBindingResources {
    /// Returns the validity of each element of the binding.
    #[inline]
    pub fn validity(&self) -> &[DescriptorValidity] {
        &self.validity
    }

    /// Returns the resource that each element of the binding refers to, if any.
    #[inline]
    pub fn resources(&self) -> &[Option<ResourceId>] {
        &self.resources
    }
}

/// Error that can happen when updating a descriptor set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DescriptorUpdateError {
    /// The binding does not exist in the layout of the descriptor set.
    InvalidBinding { binding: u32 },

    /// The range of elements is not within the elements of the binding.
    InvalidRange {
        binding: u32,
        range: Range<u32>,
        count: u32,
    },

    /// A null descriptor was written, but the `null_descriptor` feature is not enabled on the
    /// device.
    NullDescriptorNotEnabled,

    /// The source and destination bindings of a copy do not have the same descriptor type.
    IncompatibleCopy {
        src_type: DescriptorType,
        dst_type: DescriptorType,
    },
}

impl Error for DescriptorUpdateError {}

impl Display for DescriptorUpdateError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            Self::InvalidBinding { binding } => {
                write!(f, "binding {} does not exist in the descriptor set layout", binding)
            }
            Self::InvalidRange {
                binding,
                range,
                count,
            } => write!(
                f,
                "the element range {:?} is out of bounds for binding {}, which has {} elements",
                range, binding, count,
            ),
            Self::NullDescriptorNotEnabled => write!(
                f,
                "a null descriptor was written, but the `null_descriptor` feature is not enabled",
            ),
            Self::IncompatibleCopy { src_type, dst_type } => write!(
                f,
                "the source binding has descriptor type {:?}, but the destination binding has \
                descriptor type {:?}",
                src_type, dst_type,
            ),
        }
    }
}

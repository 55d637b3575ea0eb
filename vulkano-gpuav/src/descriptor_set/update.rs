use super::{DescriptorSet, ResourceId};
use smallvec::SmallVec;
use std::sync::Arc;

/// Represents a single write operation to the binding of a descriptor set.
///
/// `WriteDescriptorSet` specifies the binding number and target array index, and includes one or
/// more resources that need to be written to that location. Two constructors are provided for
/// each kind of write:
/// - The basic constructor variant writes a single element to array index 0. It is intended for
///   non-arrayed bindings, where `descriptor_count` in the descriptor set layout is 1.
/// - The `_array` variant writes several elements and allows specifying the target array index.
///   At least one element must be provided; a panic results if the provided iterator is empty.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteDescriptorSet {
    binding: u32,
    first_array_element: u32,
    elements: WriteDescriptorSetElements,
}

impl WriteDescriptorSet {
    /// Write a null descriptor to array element 0.
    ///
    /// The [`null_descriptor`] feature must be enabled on the device.
    ///
    /// [`null_descriptor`]: crate::device::DeviceFeatures::null_descriptor
    #[inline]
    pub fn null(binding: u32) -> Self {
        Self::null_array(binding, 0, 1)
    }

    /// Write a number of consecutive null descriptors.
    ///
    /// See [`null`](Self::null) for more information.
    #[inline]
    pub fn null_array(binding: u32, first_array_element: u32, num_elements: u32) -> Self {
        assert!(num_elements != 0);
        Self {
            binding,
            first_array_element,
            elements: WriteDescriptorSetElements::Null(num_elements),
        }
    }

    /// Write a single resource to array element 0.
    #[inline]
    pub fn resource(binding: u32, resource: ResourceId) -> Self {
        Self::resource_array(binding, 0, [resource])
    }

    /// Write a number of consecutive resources.
    pub fn resource_array(
        binding: u32,
        first_array_element: u32,
        elements: impl IntoIterator<Item = ResourceId>,
    ) -> Self {
        let elements: SmallVec<_> = elements.into_iter().collect();
        assert!(!elements.is_empty());
        Self {
            binding,
            first_array_element,
            elements: WriteDescriptorSetElements::Resource(elements),
        }
    }

    /// Returns the binding number that is updated by this descriptor write.
    #[inline]
    pub fn binding(&self) -> u32 {
        self.binding
    }

    /// Returns the first array element in the binding that is updated by this descriptor write.
    #[inline]
    pub fn first_array_element(&self) -> u32 {
        self.first_array_element
    }

    /// Returns a reference to the elements held by this descriptor write.
    #[inline]
    pub fn elements(&self) -> &WriteDescriptorSetElements {
        &self.elements
    }
}

/// The elements held by a `WriteDescriptorSet`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteDescriptorSetElements {
    Null(u32),
    Resource(SmallVec<[ResourceId; 1]>),
}

impl WriteDescriptorSetElements {
    /// Returns the number of elements.
    #[inline]
    pub fn len(&self) -> u32 {
        match self {
            Self::Null(num_elements) => *num_elements,
            Self::Resource(elements) => elements.len() as u32,
        }
    }

    /// Returns whether there are no elements.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Represents a single copy operation to the binding of a descriptor set.
#[derive(Clone, Debug)]
pub struct CopyDescriptorSet {
    /// The source descriptor set to copy from.
    ///
    /// There is no default value.
    pub src_set: Arc<DescriptorSet>,

    /// The binding number in the source descriptor set to copy from.
    ///
    /// The default value is 0.
    pub src_binding: u32,

    /// The first array element in the source descriptor set to copy from.
    ///
    /// The default value is 0.
    pub src_first_array_element: u32,

    /// The binding number in the destination descriptor set to copy into.
    ///
    /// The default value is 0.
    pub dst_binding: u32,

    /// The first array element in the destination descriptor set to copy into.
    ///
    /// The default value is 0.
    pub dst_first_array_element: u32,

    /// The number of descriptors (array elements) to copy.
    ///
    /// The default value is 1.
    pub descriptor_count: u32,

    pub _ne: crate::NonExhaustive,
}

impl CopyDescriptorSet {
    /// Returns a `CopyDescriptorSet` with the specified `src_set`.
    #[inline]
    pub fn new(src_set: Arc<DescriptorSet>) -> Self {
        Self {
            src_set,
            src_binding: 0,
            src_first_array_element: 0,
            dst_binding: 0,
            dst_first_array_element: 0,
            descriptor_count: 1,
            _ne: crate::NonExhaustive(()),
        }
    }
}

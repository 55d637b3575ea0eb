//! The device-scoped context that all other objects belong to.
//!
//! A [`Device`] does not talk to a driver. It mirrors the parts of a logical device that the
//! validation engine needs: the features that were enabled when the real device was created,
//! a few limits, and the state that is shared between every command buffer of the device, such
//! as the cache of instrumented shaders.
//!
//! Each `Device` is fully independent of the others, so that several devices can be validated
//! side by side in the same process. The shared state is torn down when the last reference to
//! the device is dropped.

use crate::{
    cache::WeakArcOnceCache,
    descriptor_set::{layout::DescriptorSetLayout, DescriptorSet, ResourceId},
    error_channel::ErrorChannel,
    macros::impl_id_counter,
    shader::{
        instrument::{instrument, InstrumentationError},
        InstrumentedShader, ShaderModule,
    },
};
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::{
    env,
    num::NonZero,
    ops::Deref,
    sync::{Arc, Weak},
};

pub mod queue;

/// Represents a logical device, as seen by the validation engine.
#[derive(Debug)]
pub struct Device {
    id: NonZero<u64>,
    enabled_features: DeviceFeatures,
    properties: DeviceProperties,
    config: GpuAvConfig,

    pub(crate) instrumented_shaders: WeakArcOnceCache<InstrumentationKey, InstrumentedShader>,
    descriptor_sets: Mutex<DescriptorSetRegistry>,
    free_error_channels: SegQueue<ErrorChannel>,
}

type InstrumentationKey = (NonZero<u64>, SmallVec<[NonZero<u64>; 4]>);

/// The descriptor sets of a device that `destroy_resource` has to visit.
///
/// Dropped sets are pruned whenever the list doubles in size since the last prune, so it stays
/// within twice the number of live sets.
#[derive(Debug)]
struct DescriptorSetRegistry {
    sets: Vec<Weak<DescriptorSet>>,
    prune_at: usize,
}

impl DescriptorSetRegistry {
    const MIN_PRUNE_AT: usize = 32;

    fn push(&mut self, descriptor_set: &Arc<DescriptorSet>) {
        if self.sets.len() >= self.prune_at {
            self.sets.retain(|weak| weak.strong_count() > 0);
            self.prune_at = (self.sets.len() * 2).max(Self::MIN_PRUNE_AT);
        }

        self.sets.push(Arc::downgrade(descriptor_set));
    }
}

impl Default for DescriptorSetRegistry {
    fn default() -> Self {
        DescriptorSetRegistry {
            sets: Vec::new(),
            prune_at: Self::MIN_PRUNE_AT,
        }
    }
}

impl Device {
    /// Creates a new `Device`.
    pub fn new(create_info: DeviceCreateInfo) -> Arc<Device> {
        let DeviceCreateInfo {
            enabled_features,
            properties,
            config,
            _ne: _,
        } = create_info;

        tracing::debug!(
            enabled = config.enabled,
            max_error_records = config.max_error_records,
            "creating GPU-assisted validation device context",
        );

        Arc::new(Device {
            id: Self::next_id(),
            enabled_features,
            properties,
            config,
            instrumented_shaders: WeakArcOnceCache::new(),
            descriptor_sets: Mutex::new(DescriptorSetRegistry::default()),
            free_error_channels: SegQueue::new(),
        })
    }

    /// Returns the features that are enabled on the device.
    #[inline]
    pub fn enabled_features(&self) -> &DeviceFeatures {
        &self.enabled_features
    }

    /// Returns the limits of the device.
    #[inline]
    pub fn properties(&self) -> &DeviceProperties {
        &self.properties
    }

    /// Returns the validation configuration of the device.
    #[inline]
    pub fn config(&self) -> &GpuAvConfig {
        &self.config
    }

    /// Instruments `module` for use with the given descriptor set layouts, indexed by set number.
    ///
    /// The result is cached: instrumenting the same module with the same layout objects again
    /// returns the same `InstrumentedShader`, for as long as it is kept alive elsewhere (for
    /// example by a pipeline). If GPU-assisted validation is disabled, the module is returned
    /// unchanged.
    ///
    /// # Panics
    ///
    /// - Panics if an element of `set_layouts` does not belong to `self`.
    pub fn instrument_shader(
        &self,
        module: &Arc<ShaderModule>,
        set_layouts: &[Arc<DescriptorSetLayout>],
    ) -> Result<Arc<InstrumentedShader>, InstrumentationError> {
        for set_layout in set_layouts {
            assert_eq!(set_layout.device().id(), self.id());
        }

        let key = (
            module.id(),
            set_layouts
                .iter()
                .map(|set_layout| set_layout.id())
                .collect(),
        );

        self.instrumented_shaders.get_or_try_insert(key, |_| {
            let instrumented = if self.config.enabled {
                instrument(module, set_layouts)?
            } else {
                InstrumentedShader::passthrough(module.clone())
            };

            Ok(Arc::new(instrumented))
        })
    }

    /// Returns the number of distinct instrumented shaders that the device has cached and that
    /// are still alive.
    #[inline]
    pub fn instrumented_shader_count(&self) -> usize {
        self.instrumented_shaders.len()
    }

    /// Returns how many calls to [`instrument_shader`](Self::instrument_shader) were answered
    /// from the cache, and how many had to instrument a module.
    #[inline]
    pub fn instrumentation_cache_stats(&self) -> (u64, u64) {
        self.instrumented_shaders.stats()
    }

    /// Marks every descriptor that refers to `resource` as referring to a destroyed resource.
    ///
    /// This must be called when the application destroys a buffer, image or other resource
    /// that may still be referenced from a descriptor set.
    pub fn destroy_resource(&self, resource: ResourceId) {
        let mut registry = self.descriptor_sets.lock();
        let mut affected = 0;

        registry.sets.retain(|descriptor_set| match descriptor_set.upgrade() {
            Some(descriptor_set) => {
                affected += descriptor_set.resource_destroyed(resource);
                true
            }
            None => false,
        });

        tracing::trace!(?resource, affected, "resource destroyed");
    }

    pub(crate) fn register_descriptor_set(&self, descriptor_set: &Arc<DescriptorSet>) {
        self.descriptor_sets.lock().push(descriptor_set);
    }

    /// Takes an error channel from the pool of recycled channels, or creates a new one.
    pub(crate) fn acquire_error_channel(&self) -> ErrorChannel {
        match self.free_error_channels.pop() {
            Some(channel) => channel,
            None => ErrorChannel::new(self.config.max_error_records),
        }
    }

    /// Returns an error channel to the pool, once its owner no longer needs it.
    pub(crate) fn recycle_error_channel(&self, mut channel: ErrorChannel) {
        if channel.capacity() == self.config.max_error_records {
            channel.reset();
            self.free_error_channels.push(channel);
        }
    }
}

impl_id_counter!(Device);

/// Implemented on objects that belong to a Vulkan device.
///
/// # Safety
///
/// - `device()` must return the correct device.
pub unsafe trait DeviceOwned {
    /// Returns the device that owns `self`.
    fn device(&self) -> &Arc<Device>;
}

unsafe impl<T> DeviceOwned for T
where
    T: Deref,
    T::Target: DeviceOwned,
{
    #[inline]
    fn device(&self) -> &Arc<Device> {
        (**self).device()
    }
}

/// Parameters to create a new `Device`.
#[derive(Clone, Debug)]
pub struct DeviceCreateInfo {
    /// The features that were enabled on the real device.
    ///
    /// The default value is [`DeviceFeatures::empty()`].
    pub enabled_features: DeviceFeatures,

    /// The limits of the real device.
    ///
    /// The default value is [`DeviceProperties::default()`].
    pub properties: DeviceProperties,

    /// How GPU-assisted validation should behave.
    ///
    /// The default value is [`GpuAvConfig::default()`].
    pub config: GpuAvConfig,

    pub _ne: crate::NonExhaustive,
}

impl Default for DeviceCreateInfo {
    #[inline]
    fn default() -> Self {
        Self {
            enabled_features: DeviceFeatures::empty(),
            properties: DeviceProperties::default(),
            config: GpuAvConfig::default(),
            _ne: crate::NonExhaustive(()),
        }
    }
}

/// The device features that affect descriptor validation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceFeatures {
    /// Descriptors may be written with a null handle, and reading them returns zero.
    pub null_descriptor: bool,
    /// Bindings may have the `PARTIALLY_BOUND` flag.
    pub descriptor_binding_partially_bound: bool,
    /// Bindings may have the `VARIABLE_DESCRIPTOR_COUNT` flag.
    pub descriptor_binding_variable_descriptor_count: bool,
    /// Bindings may have the `UPDATE_AFTER_BIND` flag.
    pub descriptor_binding_update_after_bind: bool,
    /// Bindings may have the `UPDATE_UNUSED_WHILE_PENDING` flag.
    pub descriptor_binding_update_unused_while_pending: bool,
}

impl DeviceFeatures {
    /// Returns a `DeviceFeatures` with none of the features enabled.
    #[inline]
    pub const fn empty() -> Self {
        DeviceFeatures {
            null_descriptor: false,
            descriptor_binding_partially_bound: false,
            descriptor_binding_variable_descriptor_count: false,
            descriptor_binding_update_after_bind: false,
            descriptor_binding_update_unused_while_pending: false,
        }
    }

    /// Returns a `DeviceFeatures` with all the descriptor indexing features enabled, but not
    /// `null_descriptor`.
    #[inline]
    pub const fn descriptor_indexing() -> Self {
        DeviceFeatures {
            null_descriptor: false,
            descriptor_binding_partially_bound: true,
            descriptor_binding_variable_descriptor_count: true,
            descriptor_binding_update_after_bind: true,
            descriptor_binding_update_unused_while_pending: true,
        }
    }
}

/// The device limits that affect descriptor validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceProperties {
    /// The maximum size of the push constants, in bytes.
    pub max_push_constants_size: u32,
    /// The maximum number of descriptor sets in a pipeline layout.
    pub max_bound_descriptor_sets: u32,
    /// The maximum total number of descriptors in a single descriptor set layout.
    pub max_per_set_descriptors: u32,
}

impl Default for DeviceProperties {
    #[inline]
    fn default() -> Self {
        DeviceProperties {
            max_push_constants_size: 128,
            max_bound_descriptor_sets: 32,
            max_per_set_descriptors: 1 << 20,
        }
    }
}

/// Configuration of GPU-assisted validation.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct GpuAvConfig {
    /// Whether shaders are instrumented and binding state is snapshotted at all.
    ///
    /// The default value is `true`.
    pub enabled: bool,

    /// How many error records a single submission of a command buffer can hold. Violations
    /// beyond this number are dropped.
    ///
    /// The default value is `1024`.
    pub max_error_records: u32,

    /// The initial size, in `u32` words, of the binding snapshot buffer of a command buffer.
    /// The buffer grows as needed.
    ///
    /// The default value is `1024`.
    pub initial_snapshot_words: u32,
}

impl Default for GpuAvConfig {
    #[inline]
    fn default() -> Self {
        GpuAvConfig {
            enabled: true,
            max_error_records: 1024,
            initial_snapshot_words: 1024,
        }
    }
}

impl GpuAvConfig {
    /// Environment variable that overrides [`GpuAvConfig::enabled`].
    pub const ENABLED_VAR: &'static str = "VULKANO_GPUAV_ENABLED";

    /// Environment variable that overrides [`GpuAvConfig::max_error_records`].
    pub const MAX_ERROR_RECORDS_VAR: &'static str = "VULKANO_GPUAV_MAX_ERROR_RECORDS";

    /// Returns the default configuration, with overrides applied from the environment.
    ///
    /// Values that can't be parsed are ignored with a warning.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|name| env::var(name).ok())
    }

    fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(value) = var(Self::ENABLED_VAR) {
            match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "on" => self.enabled = true,
                "0" | "false" | "off" => self.enabled = false,
                _ => tracing::warn!(%value, "ignoring invalid value of {}", Self::ENABLED_VAR),
            }
        }

        if let Some(value) = var(Self::MAX_ERROR_RECORDS_VAR) {
            match value.trim().parse::<u32>() {
                Ok(max_error_records) if max_error_records != 0 => {
                    self.max_error_records = max_error_records;
                }
                _ => tracing::warn!(
                    %value,
                    "ignoring invalid value of {}",
                    Self::MAX_ERROR_RECORDS_VAR,
                ),
            }
        }

        self
    }
}

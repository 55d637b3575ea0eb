use crate::{
    descriptor_set::{layout::DescriptorSetLayout, DescriptorSet},
    pipeline::{layout::PipelineLayout, Pipeline, PipelineBindPoint},
};
use foldhash::HashMap;
use std::{
    collections::hash_map::Entry,
    num::NonZero,
    sync::{Arc, Weak},
};

/// The state that is tracked while a command buffer is being recorded.
#[derive(Debug, Default)]
pub(super) struct CommandBufferBuilderState {
    pub(super) descriptor_sets: HashMap<PipelineBindPoint, DescriptorSetState>,
    pub(super) pipelines: HashMap<PipelineBindPoint, Arc<Pipeline>>,
    pub(super) push_constants: Vec<u8>,
}

impl CommandBufferBuilderState {
    pub(super) fn reset(&mut self) {
        self.descriptor_sets.clear();
        self.pipelines.clear();
        self.push_constants.clear();
    }

    /// Prepares the state of `bind_point` for binding `num_descriptor_sets` sets at `first_set`
    /// with `pipeline_layout`.
    ///
    /// Bound sets from the first set number at which `pipeline_layout` is not compatible with
    /// the current layout of the bind point onwards are disturbed. Sets below that number keep
    /// their bindings.
    pub(super) fn invalidate_descriptor_sets(
        &mut self,
        bind_point: PipelineBindPoint,
        pipeline_layout: Arc<PipelineLayout>,
        first_set: u32,
        num_descriptor_sets: u32,
    ) -> &mut DescriptorSetState {
        match self.descriptor_sets.entry(bind_point) {
            Entry::Vacant(entry) => entry.insert(DescriptorSetState {
                descriptor_sets: HashMap::default(),
                pipeline_layout,
            }),
            Entry::Occupied(entry) => {
                let state = entry.into_mut();

                let invalidate_from = if state.pipeline_layout == pipeline_layout {
                    None
                } else if state.pipeline_layout.push_constant_ranges()
                    != pipeline_layout.push_constant_ranges()
                {
                    Some(0)
                } else {
                    // The first set number whose set layout differs.
                    let current_layouts = state.pipeline_layout.set_layouts();
                    let new_layouts = pipeline_layout.set_layouts();
                    let max = (current_layouts.len() as u32)
                        .min(first_set + num_descriptor_sets)
                        .min(new_layouts.len() as u32);

                    (0..max).find(|&num| {
                        let num = num as usize;
                        current_layouts[num] != new_layouts[num]
                    })
                };

                if let Some(invalidate_from) = invalidate_from {
                    let mut disturbed = 0;

                    for (_, slot) in state
                        .descriptor_sets
                        .iter_mut()
                        .filter(|&(&num, _)| num >= invalidate_from)
                    {
                        if let SetSlot::Bound(bound) = slot {
                            *slot = SetSlot::Disturbed(bound.clone());
                            disturbed += 1;
                        }
                    }

                    tracing::trace!(
                        ?bind_point,
                        invalidate_from,
                        disturbed,
                        "descriptor sets disturbed by an incompatible pipeline layout",
                    );

                    state.pipeline_layout = pipeline_layout;
                } else if (first_set + num_descriptor_sets) as usize
                    >= state.pipeline_layout.set_layouts().len()
                {
                    // Compatible, and covers at least as many sets.
                    state.pipeline_layout = pipeline_layout;
                }

                state
            }
        }
    }

    /// Returns the binding state of set number `set_num` of `bind_point`.
    pub(super) fn set_binding_state(
        &self,
        bind_point: PipelineBindPoint,
        set_num: u32,
    ) -> SetBindingState {
        match self
            .descriptor_sets
            .get(&bind_point)
            .and_then(|state| state.descriptor_sets.get(&set_num))
        {
            None => SetBindingState::Unbound,
            Some(SetSlot::Disturbed(_)) => SetBindingState::Disturbed,
            Some(SetSlot::Bound(bound)) => SetBindingState::Bound {
                descriptor_set: bound.descriptor_set_id,
                pipeline_layout: bound.pipeline_layout.id(),
            },
        }
    }

    /// Resolves what every set number of the layout of `pipeline` refers to, if the pipeline
    /// were used by a command right now.
    pub(super) fn resolve_descriptor_sets(&self, pipeline: &Pipeline) -> Vec<ResolvedSet> {
        let layout = pipeline.layout();
        let state = self.descriptor_sets.get(&pipeline.bind_point());

        (0..layout.set_layouts().len() as u32)
            .map(|set_num| match state.and_then(|s| s.descriptor_sets.get(&set_num)) {
                None => ResolvedSet {
                    status: SetStatus::Unbound,
                    bound: None,
                    version: None,
                },
                Some(SetSlot::Disturbed(bound)) => ResolvedSet {
                    status: SetStatus::Disturbed,
                    bound: Some(bound.clone()),
                    version: None,
                },
                Some(SetSlot::Bound(bound)) => {
                    if layout.is_compatible_with(&bound.pipeline_layout, set_num + 1) {
                        ResolvedSet {
                            status: SetStatus::Bound,
                            bound: Some(bound.clone()),
                            version: bound
                                .descriptor_set
                                .upgrade()
                                .map(|descriptor_set| descriptor_set.version()),
                        }
                    } else {
                        ResolvedSet {
                            status: SetStatus::Disturbed,
                            bound: Some(bound.clone()),
                            version: None,
                        }
                    }
                }
            })
            .collect()
    }
}

/// The descriptor sets that are bound to one bind point.
#[derive(Debug)]
pub(super) struct DescriptorSetState {
    pub(super) descriptor_sets: HashMap<u32, SetSlot>,
    pub(super) pipeline_layout: Arc<PipelineLayout>,
}

#[derive(Clone, Debug)]
pub(super) enum SetSlot {
    Bound(BoundSet),

    /// The set that was bound before the slot was disturbed.
    Disturbed(BoundSet),
}

/// A descriptor set, as it was bound.
///
/// The command buffer does not keep descriptor sets alive. A set that is dropped while it is
/// still bound is treated as if all its resources were destroyed.
#[derive(Clone, Debug)]
pub(super) struct BoundSet {
    pub(super) descriptor_set: Weak<DescriptorSet>,
    pub(super) descriptor_set_id: NonZero<u64>,
    pub(super) set_layout: Arc<DescriptorSetLayout>,
    pub(super) variable_descriptor_count: u32,
    pub(super) pipeline_layout: Arc<PipelineLayout>,
}

impl BoundSet {
    pub(super) fn new(
        descriptor_set: &Arc<DescriptorSet>,
        pipeline_layout: &Arc<PipelineLayout>,
    ) -> Self {
        BoundSet {
            descriptor_set: Arc::downgrade(descriptor_set),
            descriptor_set_id: descriptor_set.id(),
            set_layout: descriptor_set.layout().clone(),
            variable_descriptor_count: descriptor_set.variable_descriptor_count(),
            pipeline_layout: pipeline_layout.clone(),
        }
    }

    /// Returns the number of elements of `binding` of the set.
    pub(super) fn element_count(&self, binding: u32) -> Option<u32> {
        let layout_binding = self.set_layout.binding(binding)?;

        Some(if self.set_layout.variable_binding() == Some(binding) {
            self.variable_descriptor_count
        } else {
            layout_binding.descriptor_count
        })
    }
}

/// What a set number referred to when a command was recorded.
#[derive(Clone, Debug)]
pub(super) struct ResolvedSet {
    pub(super) status: SetStatus,
    pub(super) bound: Option<BoundSet>,

    /// The version of the descriptor set when the command was recorded, or `None` if the set
    /// is not bound or is no longer alive.
    pub(super) version: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(super) enum SetStatus {
    Unbound,
    Bound,
    Disturbed,
}

/// The binding state of one set number of a bind point.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SetBindingState {
    /// No descriptor set has been bound at this number since recording began.
    Unbound,

    /// A descriptor set was bound, but was then disturbed by binding a descriptor set with an
    /// incompatible pipeline layout.
    Disturbed,

    /// A descriptor set is bound.
    Bound {
        /// The id of the descriptor set.
        descriptor_set: NonZero<u64>,

        /// The id of the pipeline layout that the set was bound with.
        pipeline_layout: NonZero<u64>,
    },
}

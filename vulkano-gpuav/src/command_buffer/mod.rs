//! Recording of commands, and decoding of the violations that they caused.
//!
//! A [`CommandBuffer`] shadows the descriptor binding state of a real command buffer while it is
//! recorded. When a draw, dispatch or ray tracing command is recorded, the descriptor sets that
//! the bound pipeline can see are resolved and captured in a binding snapshot, which the
//! instrumented shaders of the pipeline read while the command executes.
//!
//! # Lifecycle
//!
//! ```text
//! Initial --begin--> Recording --end--> Executable --submit--> Pending --wait--> Executable
//! ```
//!
//! Calling [`begin`](CommandBuffer::begin) again from `Executable` discards everything that was
//! recorded, including the violations of the last submission.
//!
//! Once a submission has completed and [`wait`](CommandBuffer::wait) has returned, the
//! violations that the device reported are available from
//! [`decoded_violations`](CommandBuffer::decoded_violations), translated back to the objects
//! that were involved.

pub use self::state::SetBindingState;
use self::state::{BoundSet, CommandBufferBuilderState, ResolvedSet, SetSlot, SetStatus};
use crate::{
    descriptor_set::{layout::DescriptorBindingFlags, DescriptorSet, DescriptorValidity},
    device::{Device, DeviceOwned},
    error_channel::{DecodedViolation, ErrorChannel, ErrorRecord},
    macros::impl_id_counter,
    pipeline::{layout::PipelineLayout, Pipeline, PipelineBindPoint},
    shader::{
        interpreter::{self, DeviceMemory, ExecutionContext, ExecutionError},
        InstrumentedShader, ShaderStages,
    },
    snapshot::{self, BindingSnapshot, BoundSetSnapshot, SetSnapshot, SnapshotArena},
    sync::Fence,
    Validated, ValidationError,
};
use foldhash::HashMap;
use smallvec::SmallVec;
use std::{
    error::Error,
    fmt::{Display, Error as FmtError, Formatter},
    num::NonZero,
    sync::Arc,
};

mod state;

/// Records commands, and keeps the violations that they caused when they were last executed.
#[derive(Debug)]
pub struct CommandBuffer {
    device: Arc<Device>,
    id: NonZero<u64>,
    state: CommandBufferState,

    builder_state: CommandBufferBuilderState,
    commands: Vec<RecordedCommand>,
    next_command_index: u32,
    snapshots: SnapshotArena,
    last_snapshot: Option<(SnapshotKey, u32)>,

    channel: Option<ErrorChannel>,
    submission: Option<NonZero<u64>>,
    violations: Vec<DecodedViolation>,
    outputs: HashMap<u32, Vec<u32>>,
}

impl CommandBuffer {
    /// Creates a new `CommandBuffer`, in the initial state.
    pub fn new(device: Arc<Device>) -> Self {
        let snapshots = SnapshotArena::new(device.config().initial_snapshot_words);

        CommandBuffer {
            device,
            id: Self::next_id(),
            state: CommandBufferState::Initial,
            builder_state: CommandBufferBuilderState::default(),
            commands: Vec::new(),
            next_command_index: 0,
            snapshots,
            last_snapshot: None,
            channel: None,
            submission: None,
            violations: Vec::new(),
            outputs: HashMap::default(),
        }
    }

    /// Returns the current state of the command buffer.
    #[inline]
    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    /// Begins recording. Everything that was recorded before is discarded, along with the
    /// violations of the last submission.
    pub fn begin(&mut self) -> Result<(), Box<ValidationError>> {
        if self.state == CommandBufferState::Pending {
            return Err(Box::new(ValidationError {
                problem: "the command buffer is in the pending state".into(),
                vuids: &["VUID-vkBeginCommandBuffer-commandBuffer-00049"],
                ..Default::default()
            }));
        }

        self.builder_state.reset();
        self.commands.clear();
        self.next_command_index = 0;
        self.snapshots.reset();
        self.last_snapshot = None;
        self.violations.clear();
        self.outputs.clear();

        if let Some(channel) = &mut self.channel {
            channel.reset();
        }

        self.state = CommandBufferState::Recording;

        Ok(())
    }

    /// Ends recording.
    pub fn end(&mut self) -> Result<(), Box<ValidationError>> {
        self.validate_recording()
            .map_err(|err| err.set_vuids(&["VUID-vkEndCommandBuffer-commandBuffer-00059"]))?;

        tracing::trace!(
            command_buffer = self.id.get(),
            commands = self.commands.len(),
            snapshot_words = self.snapshots.len(),
            "ended recording",
        );

        self.state = CommandBufferState::Executable;

        Ok(())
    }

    /// Binds a pipeline to its bind point, for future commands.
    ///
    /// Binding a pipeline does not disturb the bound descriptor sets. Whether they are
    /// compatible with the pipeline is decided when a command is recorded.
    ///
    /// # Panics
    ///
    /// - Panics if `pipeline` belongs to a different device.
    pub fn bind_pipeline(&mut self, pipeline: Arc<Pipeline>) -> Result<(), Box<ValidationError>> {
        self.validate_recording()
            .map_err(|err| err.set_vuids(&["VUID-vkCmdBindPipeline-commandBuffer-recording"]))?;

        assert_eq!(pipeline.device(), &self.device);

        self.next_command_index()?;
        self.builder_state
            .pipelines
            .insert(pipeline.bind_point(), pipeline);

        Ok(())
    }

    /// Binds descriptor sets at `first_set` and up, for future commands.
    ///
    /// Sets that are bound at other set numbers stay bound, unless `pipeline_layout` is not
    /// compatible with the pipeline layout that they were bound with. In that case, every set
    /// from the first set number at which the layouts differ onwards is disturbed, and using
    /// it in a command is a violation until a set is bound there again.
    ///
    /// The command buffer does not keep `descriptor_sets` alive. The caller must hold on to them
    /// until every submission that uses them has completed. A set that is dropped earlier is
    /// treated as if all of its resources were destroyed.
    ///
    /// # Panics
    ///
    /// - Panics if `pipeline_layout` or one of `descriptor_sets` belongs to a different device.
    pub fn bind_descriptor_sets(
        &mut self,
        bind_point: PipelineBindPoint,
        pipeline_layout: Arc<PipelineLayout>,
        first_set: u32,
        descriptor_sets: impl IntoIterator<Item = Arc<DescriptorSet>>,
    ) -> Result<(), Box<ValidationError>> {
        let descriptor_sets: SmallVec<[Arc<DescriptorSet>; 4]> =
            descriptor_sets.into_iter().collect();
        self.validate_bind_descriptor_sets(&pipeline_layout, first_set, &descriptor_sets)?;

        self.next_command_index()?;

        let state = self.builder_state.invalidate_descriptor_sets(
            bind_point,
            pipeline_layout.clone(),
            first_set,
            descriptor_sets.len() as u32,
        );

        for (set_num, descriptor_set) in (first_set..).zip(&descriptor_sets) {
            state.descriptor_sets.insert(
                set_num,
                SetSlot::Bound(BoundSet::new(descriptor_set, &pipeline_layout)),
            );
        }

        Ok(())
    }

    fn validate_bind_descriptor_sets(
        &self,
        pipeline_layout: &PipelineLayout,
        first_set: u32,
        descriptor_sets: &[Arc<DescriptorSet>],
    ) -> Result<(), Box<ValidationError>> {
        self.validate_recording().map_err(|err| {
            err.set_vuids(&["VUID-vkCmdBindDescriptorSets-commandBuffer-recording"])
        })?;

        assert_eq!(pipeline_layout.device(), &self.device);

        if descriptor_sets.is_empty() {
            return Err(Box::new(ValidationError {
                context: "descriptor_sets".into(),
                problem: "is empty".into(),
                vuids: &["VUID-vkCmdBindDescriptorSets-descriptorSetCount-arraylength"],
                ..Default::default()
            }));
        }

        if first_set as usize + descriptor_sets.len() > pipeline_layout.set_layouts().len() {
            return Err(Box::new(ValidationError {
                problem: "`first_set + descriptor_sets.len()` is greater than \
                    `pipeline_layout.set_layouts().len()`"
                    .into(),
                vuids: &["VUID-vkCmdBindDescriptorSets-firstSet-00360"],
                ..Default::default()
            }));
        }

        for (descriptor_sets_index, descriptor_set) in descriptor_sets.iter().enumerate() {
            let set_num = first_set as usize + descriptor_sets_index;

            assert_eq!(descriptor_set.device(), &self.device);

            if descriptor_set.layout() != &pipeline_layout.set_layouts()[set_num] {
                return Err(Box::new(ValidationError {
                    problem: format!(
                        "the layout of `descriptor_sets[{0}]` (for set number {1}) is not \
                        `pipeline_layout.set_layouts()[{1}]`",
                        descriptor_sets_index, set_num,
                    )
                    .into(),
                    vuids: &["VUID-vkCmdBindDescriptorSets-pDescriptorSets-00358"],
                    ..Default::default()
                }));
            }
        }

        Ok(())
    }

    /// Sets push constants for future commands, starting at byte `offset`.
    ///
    /// # Panics
    ///
    /// - Panics if `pipeline_layout` belongs to a different device.
    pub fn push_constants(
        &mut self,
        pipeline_layout: &PipelineLayout,
        offset: u32,
        data: &[u8],
    ) -> Result<(), Box<ValidationError>> {
        self.validate_push_constants(pipeline_layout, offset, data)?;

        self.next_command_index()?;

        let end = offset as usize + data.len();

        if self.builder_state.push_constants.len() < end {
            self.builder_state.push_constants.resize(end, 0);
        }

        self.builder_state.push_constants[offset as usize..end].copy_from_slice(data);

        Ok(())
    }

    fn validate_push_constants(
        &self,
        pipeline_layout: &PipelineLayout,
        offset: u32,
        data: &[u8],
    ) -> Result<(), Box<ValidationError>> {
        self.validate_recording()
            .map_err(|err| err.set_vuids(&["VUID-vkCmdPushConstants-commandBuffer-recording"]))?;

        assert_eq!(pipeline_layout.device(), &self.device);

        let max_push_constants_size = self.device.properties().max_push_constants_size;
        let size = u32::try_from(data.len()).unwrap_or(u32::MAX);

        if size == 0 {
            return Err(Box::new(ValidationError {
                context: "data".into(),
                problem: "is empty".into(),
                vuids: &["VUID-vkCmdPushConstants-size-arraylength"],
                ..Default::default()
            }));
        }

        if offset % 4 != 0 {
            return Err(Box::new(ValidationError {
                context: "offset".into(),
                problem: "is not a multiple of 4".into(),
                vuids: &["VUID-vkCmdPushConstants-offset-00368"],
                ..Default::default()
            }));
        }

        if size % 4 != 0 {
            return Err(Box::new(ValidationError {
                context: "data".into(),
                problem: "the size is not a multiple of 4".into(),
                vuids: &["VUID-vkCmdPushConstants-size-00369"],
                ..Default::default()
            }));
        }

        if offset >= max_push_constants_size {
            return Err(Box::new(ValidationError {
                context: "offset".into(),
                problem: "is not less than the `max_push_constants_size` limit".into(),
                vuids: &["VUID-vkCmdPushConstants-offset-00370"],
                ..Default::default()
            }));
        }

        if size > max_push_constants_size - offset {
            return Err(Box::new(ValidationError {
                problem: "`offset` + the size of `data` is greater than the \
                    `max_push_constants_size` limit"
                    .into(),
                vuids: &["VUID-vkCmdPushConstants-size-00371"],
                ..Default::default()
            }));
        }

        if !pipeline_layout.push_constants_cover(ShaderStages::all(), offset, size) {
            return Err(Box::new(ValidationError {
                problem: "the push constant ranges of `pipeline_layout` do not contain every \
                    byte of `offset..offset + data.len()`"
                    .into(),
                vuids: &["VUID-vkCmdPushConstants-offset-01795"],
                ..Default::default()
            }));
        }

        Ok(())
    }

    /// Records a draw of `vertex_count` vertices and `instance_count` instances, with the bound
    /// graphics pipeline.
    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
    ) -> Result<DrawInfo, Box<ValidationError>> {
        self.record_action(CommandParams::Draw {
            vertex_count,
            instance_count,
        })
    }

    /// Records a dispatch of `group_counts` workgroups, with the bound compute pipeline.
    pub fn dispatch(&mut self, group_counts: [u32; 3]) -> Result<DrawInfo, Box<ValidationError>> {
        self.record_action(CommandParams::Dispatch { group_counts })
    }

    /// Records a ray tracing command of `[width, height, depth]` rays, with the bound ray
    /// tracing pipeline.
    pub fn trace_rays(&mut self, dimensions: [u32; 3]) -> Result<DrawInfo, Box<ValidationError>> {
        self.record_action(CommandParams::TraceRays { dimensions })
    }

    fn record_action(&mut self, params: CommandParams) -> Result<DrawInfo, Box<ValidationError>> {
        let kind = params.kind();
        let bind_point = kind.bind_point();

        self.validate_recording()
            .map_err(|err| err.set_vuids(kind.recording_vuids()))?;

        let Some(pipeline) = self.builder_state.pipelines.get(&bind_point).cloned() else {
            return Err(Box::new(ValidationError {
                problem: format!("no pipeline is bound to the {:?} bind point", bind_point)
                    .into(),
                vuids: kind.pipeline_vuids(),
                ..Default::default()
            }));
        };

        let command_index = self.next_command_index()?;
        let sets = self.builder_state.resolve_descriptor_sets(&pipeline);

        let unbound_sets: SmallVec<[u32; 4]> = pipeline
            .used_sets()
            .filter(|&set_num| {
                sets.get(set_num as usize)
                    .map_or(true, |resolved| resolved.status == SetStatus::Unbound)
            })
            .collect();

        if !unbound_sets.is_empty() {
            tracing::warn!(
                command = kind.name(),
                command_index,
                ?unbound_sets,
                "the pipeline uses descriptor sets that were never bound",
            );
        }

        let snapshot = if self.device.config().enabled {
            Some(self.encode_snapshot(&pipeline, &sets))
        } else {
            None
        };

        self.commands.push(RecordedCommand {
            index: command_index,
            params,
            pipeline,
            sets,
            push_constants: self.builder_state.push_constants.clone(),
            snapshot,
        });

        Ok(DrawInfo {
            command_index,
            unbound_sets,
        })
    }

    /// Encodes the snapshot of a command, or returns the region of the previous command if the
    /// state that it would capture is the same.
    fn encode_snapshot(&mut self, pipeline: &Arc<Pipeline>, sets: &[ResolvedSet]) -> u32 {
        let key = SnapshotKey {
            pipeline: pipeline.id(),
            sets: sets
                .iter()
                .map(|resolved| {
                    (
                        resolved.status,
                        resolved
                            .bound
                            .as_ref()
                            .map(|bound| bound.descriptor_set_id),
                        resolved.version,
                    )
                })
                .collect(),
        };

        if let Some((last_key, region)) = &self.last_snapshot {
            if *last_key == key {
                return *region;
            }
        }

        let snapshot = binding_snapshot(
            pipeline,
            sets,
            self.device.enabled_features().null_descriptor,
        );
        let region = snapshot.encode(&mut self.snapshots);
        self.last_snapshot = Some((key, region));

        region
    }

    /// Returns the binding snapshot that a command recorded now on `bind_point` would see, or
    /// `None` if no pipeline is bound there.
    pub fn snapshot(&self, bind_point: PipelineBindPoint) -> Option<BindingSnapshot> {
        let pipeline = self.builder_state.pipelines.get(&bind_point)?;
        let sets = self.builder_state.resolve_descriptor_sets(pipeline);

        Some(binding_snapshot(
            pipeline,
            &sets,
            self.device.enabled_features().null_descriptor,
        ))
    }

    /// Returns what is currently bound at set number `set_num` of `bind_point`.
    #[inline]
    pub fn set_binding_state(
        &self,
        bind_point: PipelineBindPoint,
        set_num: u32,
    ) -> SetBindingState {
        self.builder_state.set_binding_state(bind_point, set_num)
    }

    /// Prepares the command buffer for execution, and returns the fence that is signaled once
    /// the submission completes.
    ///
    /// The snapshots of bindings with the `UPDATE_AFTER_BIND` flag are brought up to date with
    /// the descriptor sets, and elements whose resources were destroyed since recording are
    /// marked as destroyed.
    ///
    /// This is called by [`Queue::submit`](crate::device::queue::Queue::submit).
    pub fn on_submit(&mut self) -> Result<Arc<Fence>, Box<ValidationError>> {
        match self.state {
            CommandBufferState::Executable => (),
            CommandBufferState::Pending => {
                return Err(Box::new(ValidationError {
                    problem: "the command buffer is already in the pending state".into(),
                    vuids: &["VUID-vkQueueSubmit-pCommandBuffers-00071"],
                    ..Default::default()
                }));
            }
            CommandBufferState::Initial | CommandBufferState::Recording => {
                return Err(Box::new(ValidationError {
                    problem: "the command buffer is not in the executable state".into(),
                    vuids: &["VUID-vkQueueSubmit-pCommandBuffers-00070"],
                    ..Default::default()
                }));
            }
        }

        let device = &self.device;
        self.channel
            .get_or_insert_with(|| device.acquire_error_channel())
            .reset();
        self.violations.clear();
        self.outputs.clear();
        self.refresh_snapshots();

        let fence = Arc::new(Fence::new());
        self.submission = Some(fence.id());
        self.state = CommandBufferState::Pending;

        tracing::debug!(
            command_buffer = self.id.get(),
            fence = fence.id().get(),
            commands = self.commands.len(),
            "submitted command buffer",
        );

        Ok(fence)
    }

    fn refresh_snapshots(&mut self) {
        let mut refreshed = 0;

        for command in &self.commands {
            let Some(region) = command.snapshot else {
                continue;
            };

            for (set_num, resolved) in (0u32..).zip(&command.sets) {
                if resolved.status != SetStatus::Bound {
                    continue;
                }

                let Some(bound) = &resolved.bound else {
                    continue;
                };

                let descriptor_set = bound.descriptor_set.upgrade();

                if let Some(descriptor_set) = &descriptor_set {
                    if Some(descriptor_set.version()) == resolved.version {
                        continue;
                    }
                }

                for (&(_, binding_num), _) in command
                    .pipeline
                    .validated_bindings()
                    .range((set_num, 0)..=(set_num, u32::MAX))
                {
                    let words = self.snapshots.words_mut();

                    let Some(encoded) =
                        snapshot::binding_states(words, region, set_num, binding_num)
                    else {
                        continue;
                    };

                    let update_after_bind = bound.set_layout.binding(binding_num).is_some_and(
                        |binding| {
                            binding
                                .binding_flags
                                .intersects(DescriptorBindingFlags::UPDATE_AFTER_BIND)
                        },
                    );

                    let elements: Vec<_> = match &descriptor_set {
                        Some(descriptor_set) => {
                            let resources = descriptor_set.resources();
                            let Some(live) = resources.binding(binding_num) else {
                                continue;
                            };

                            encoded
                                .iter()
                                .zip(live.validity())
                                .map(|(&encoded, &live)| {
                                    if update_after_bind || live == DescriptorValidity::Destroyed
                                    {
                                        live
                                    } else {
                                        encoded
                                    }
                                })
                                .collect()
                        }
                        None => vec![DescriptorValidity::Destroyed; encoded.len()],
                    };

                    if elements != encoded
                        && snapshot::refresh_binding(words, region, set_num, binding_num, &elements)
                    {
                        refreshed += 1;
                    }
                }
            }
        }

        if refreshed != 0 {
            tracing::trace!(
                command_buffer = self.id.get(),
                refreshed,
                "refreshed binding snapshots at submit",
            );
        }
    }

    /// Executes the recorded commands in order.
    pub(crate) fn execute(&mut self, memory: &mut DeviceMemory) -> Result<(), ExecutionError> {
        let device = &self.device;
        let channel: &ErrorChannel = self
            .channel
            .get_or_insert_with(|| device.acquire_error_channel());
        let null_descriptor = device.enabled_features().null_descriptor;
        let words = self.snapshots.words();

        for command in &self.commands {
            let descriptor_sets: Vec<Option<Arc<DescriptorSet>>> = command
                .sets
                .iter()
                .map(|resolved| match (resolved.status, &resolved.bound) {
                    (SetStatus::Bound, Some(bound)) => bound.descriptor_set.upgrade(),
                    _ => None,
                })
                .collect();

            let mut ctx = ExecutionContext {
                snapshot: command.snapshot.map(|region| (words, region)),
                descriptor_sets: &descriptor_sets,
                push_constants: &command.push_constants,
                channel,
                memory: &mut *memory,
                command_index: command.index,
                null_descriptor,
            };

            let mut output = Vec::new();

            for shader in command.pipeline.stages() {
                let invocation_count = command.params.invocation_count(shader);
                output.extend(interpreter::execute(shader, invocation_count, &mut ctx)?);
            }

            self.outputs.insert(command.index, output);
        }

        Ok(())
    }

    /// Returns the command buffer to the executable state after a submission that could not
    /// complete.
    pub(crate) fn abort_submission(&mut self) {
        if let Some(channel) = &mut self.channel {
            channel.reset();
        }

        self.outputs.clear();
        self.submission = None;
        self.state = CommandBufferState::Executable;
    }

    /// Waits for the submission that `fence` belongs to, then reads and decodes the violations
    /// that it reported.
    ///
    /// The command buffer returns to the executable state.
    pub fn wait(&mut self, fence: &Fence) -> Result<&[DecodedViolation], Validated<GpuAvError>> {
        if self.state != CommandBufferState::Pending || self.submission != Some(fence.id()) {
            return Err(Box::new(ValidationError {
                context: "fence".into(),
                problem: "does not belong to the pending submission of the command buffer"
                    .into(),
                ..Default::default()
            })
            .into());
        }

        if !fence.is_signaled() {
            return Err(Validated::Error(GpuAvError::NotComplete));
        }

        let records = match &mut self.channel {
            Some(channel) => channel.drain(),
            None => Vec::new(),
        };

        let mut violations = Vec::with_capacity(records.len());

        for record in &records {
            match self.decode(record) {
                Some(violation) => {
                    tracing::error!(vuid = violation.vuid, "{}", violation);
                    violations.push(violation);
                }
                None => tracing::warn!(?record, "ignoring a corrupt error record"),
            }
        }

        self.violations = violations;
        self.submission = None;
        self.state = CommandBufferState::Executable;

        Ok(&self.violations)
    }

    fn decode(&self, record: &ErrorRecord) -> Option<DecodedViolation> {
        let kind = record.violation_kind()?;
        let stage = record.shader_stage()?;
        let command_index = record.command_index();
        let command = self
            .commands
            .binary_search_by_key(&command_index, |command| command.index)
            .ok()
            .map(|index| &self.commands[index])?;
        let shader = command
            .pipeline
            .stages()
            .iter()
            .find(|shader| shader.stage() == stage)?;
        let bound = command
            .sets
            .get(record.set as usize)
            .and_then(|resolved| resolved.bound.as_ref());
        let command_kind = command.params.kind();

        Some(DecodedViolation {
            kind,
            stage,
            set: record.set,
            binding: record.binding,
            element: record.element,
            vuid: kind.vuid(command_kind),
            command: command_kind,
            command_index,
            bind_point: command.pipeline.bind_point(),
            location: match shader.location(record.location()) {
                Some(location) => location.to_string(),
                None => format!("unknown location {}", record.location()),
            },
            descriptor_set: bound.map(|bound| bound.descriptor_set_id),
            descriptor_set_layout: bound.map(|bound| bound.set_layout.id()),
            pipeline_layout: bound.map(|bound| bound.pipeline_layout.id()),
            shader_module: shader.module().id(),
        })
    }

    /// Returns the violations that the last completed submission reported.
    pub fn decoded_violations(&self) -> Result<&[DecodedViolation], GpuAvError> {
        if self.state == CommandBufferState::Pending {
            return Err(GpuAvError::NotComplete);
        }

        Ok(&self.violations)
    }

    /// Returns what the shaders of the command with index `command_index` output during the last
    /// submission, in stage order and then invocation order.
    #[inline]
    pub fn outputs(&self, command_index: u32) -> Option<&[u32]> {
        self.outputs.get(&command_index).map(Vec::as_slice)
    }

    fn validate_recording(&self) -> Result<(), Box<ValidationError>> {
        if self.state != CommandBufferState::Recording {
            return Err(Box::new(ValidationError {
                problem: "the command buffer is not in the recording state".into(),
                ..Default::default()
            }));
        }

        Ok(())
    }

    fn next_command_index(&mut self) -> Result<u32, Box<ValidationError>> {
        let index = self.next_command_index;

        if index > ErrorRecord::MAX_COMMAND_INDEX {
            return Err(Box::new(ValidationError {
                problem: "the command buffer already contains the maximum number of commands"
                    .into(),
                ..Default::default()
            }));
        }

        self.next_command_index += 1;

        Ok(index)
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take() {
            self.device.recycle_error_channel(channel);
        }
    }
}

unsafe impl DeviceOwned for CommandBuffer {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl_id_counter!(CommandBuffer);

/// The state of a [`CommandBuffer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandBufferState {
    /// Nothing has been recorded yet.
    Initial,

    /// Commands are being recorded.
    Recording,

    /// Recording has ended, and the command buffer can be submitted.
    Executable,

    /// The command buffer has been submitted, and [`CommandBuffer::wait`] has not yet been
    /// called.
    Pending,
}

/// Information about a command that was recorded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DrawInfo {
    /// The index of the command, in recording order, among all commands of the command buffer.
    pub command_index: u32,

    /// The set numbers that the pipeline uses, but where no descriptor set was ever bound.
    /// Accesses through these sets are skipped on the device without being reported.
    pub unbound_sets: SmallVec<[u32; 4]>,
}

/// The kinds of command that execute shaders.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Draw,
    Dispatch,
    TraceRays,
}

impl CommandKind {
    /// Returns the name of the Vulkan command.
    #[inline]
    pub fn name(self) -> &'static str {
        match self {
            CommandKind::Draw => "vkCmdDraw",
            CommandKind::Dispatch => "vkCmdDispatch",
            CommandKind::TraceRays => "vkCmdTraceRaysKHR",
        }
    }

    /// Returns the bind point whose state the command uses.
    #[inline]
    pub fn bind_point(self) -> PipelineBindPoint {
        match self {
            CommandKind::Draw => PipelineBindPoint::Graphics,
            CommandKind::Dispatch => PipelineBindPoint::Compute,
            CommandKind::TraceRays => PipelineBindPoint::RayTracing,
        }
    }

    fn recording_vuids(self) -> &'static [&'static str] {
        match self {
            CommandKind::Draw => &["VUID-vkCmdDraw-commandBuffer-recording"],
            CommandKind::Dispatch => &["VUID-vkCmdDispatch-commandBuffer-recording"],
            CommandKind::TraceRays => &["VUID-vkCmdTraceRaysKHR-commandBuffer-recording"],
        }
    }

    fn pipeline_vuids(self) -> &'static [&'static str] {
        match self {
            CommandKind::Draw => &["VUID-vkCmdDraw-None-08606"],
            CommandKind::Dispatch => &["VUID-vkCmdDispatch-None-08606"],
            CommandKind::TraceRays => &["VUID-vkCmdTraceRaysKHR-None-08606"],
        }
    }
}

/// Error that can happen when reading the results of a submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GpuAvError {
    /// The submission has not completed yet.
    NotComplete,
}

impl Error for GpuAvError {}

impl Display for GpuAvError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            Self::NotComplete => write!(
                f,
                "the results of a submission were read before the submission completed",
            ),
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum CommandParams {
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
    Dispatch {
        group_counts: [u32; 3],
    },
    TraceRays {
        dimensions: [u32; 3],
    },
}

impl CommandParams {
    fn kind(self) -> CommandKind {
        match self {
            CommandParams::Draw { .. } => CommandKind::Draw,
            CommandParams::Dispatch { .. } => CommandKind::Dispatch,
            CommandParams::TraceRays { .. } => CommandKind::TraceRays,
        }
    }

    /// Returns how many times `shader` is invoked by the command.
    fn invocation_count(self, shader: &InstrumentedShader) -> u32 {
        let product = |counts: [u32; 3]| counts.into_iter().fold(1u32, u32::saturating_mul);

        match self {
            CommandParams::Draw {
                vertex_count,
                instance_count,
            } => vertex_count.saturating_mul(instance_count),
            CommandParams::Dispatch { group_counts } => {
                product(group_counts).saturating_mul(product(shader.module().local_size()))
            }
            CommandParams::TraceRays { dimensions } => product(dimensions),
        }
    }
}

#[derive(Debug)]
struct RecordedCommand {
    index: u32,
    params: CommandParams,
    pipeline: Arc<Pipeline>,

    /// What each set number of the pipeline layout referred to, by set number.
    sets: Vec<ResolvedSet>,

    push_constants: Vec<u8>,

    /// The region of the binding snapshot, or `None` if validation is disabled.
    snapshot: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct SnapshotKey {
    pipeline: NonZero<u64>,
    sets: SmallVec<[(SetStatus, Option<NonZero<u64>>, Option<u64>); 4]>,
}

/// Captures the state of the sets in `sets` that `pipeline` validates.
fn binding_snapshot(
    pipeline: &Pipeline,
    sets: &[ResolvedSet],
    null_descriptor: bool,
) -> BindingSnapshot {
    let sets = (0u32..)
        .zip(sets)
        .map(|(set_num, resolved)| {
            let bindings = pipeline
                .validated_bindings()
                .range((set_num, 0)..=(set_num, u32::MAX))
                .map(|(&(_, binding_num), _)| binding_num);

            match (resolved.status, &resolved.bound) {
                (SetStatus::Bound, Some(bound)) => match bound.descriptor_set.upgrade() {
                    Some(descriptor_set) => {
                        SetSnapshot::Bound(BoundSetSnapshot::capture(&descriptor_set, bindings))
                    }
                    None => SetSnapshot::Bound(BoundSetSnapshot::destroyed(
                        bound.descriptor_set_id,
                        bindings.filter_map(|binding_num| {
                            let binding = bound.set_layout.binding(binding_num)?;
                            let element_count = bound.element_count(binding_num)?;

                            Some((binding_num, binding.binding_flags, element_count))
                        }),
                    )),
                },
                (SetStatus::Disturbed, _) => SetSnapshot::Disturbed,
                _ => SetSnapshot::Unbound,
            }
        })
        .collect();

    BindingSnapshot {
        null_descriptor,
        sets,
    }
}

#[cfg(test)]
mod tests {
    use super::{CommandBuffer, CommandBufferState, CommandKind, GpuAvError, SetBindingState};
    use crate::{
        descriptor_set::{
            layout::{
                DescriptorBindingFlags, DescriptorSetLayout, DescriptorSetLayoutBinding,
                DescriptorSetLayoutCreateFlags, DescriptorSetLayoutCreateInfo, DescriptorType,
            },
            DescriptorSet, ResourceId, WriteDescriptorSet,
        },
        device::{
            queue::Queue, Device, DeviceCreateInfo, DeviceFeatures, DeviceOwned, GpuAvConfig,
        },
        error_channel::{DecodedViolation, ViolationKind},
        pipeline::{
            layout::{PipelineLayout, PipelineLayoutCreateInfo, PushConstantRange},
            Pipeline, PipelineBindPoint, PipelineCreateInfo,
        },
        shader::{
            Access, AccessOp, BinaryOp, DescriptorArray, DescriptorVariable, Id, Instruction,
            ShaderModule, ShaderModuleCreateInfo, ShaderStage, ShaderStages, VariableId,
        },
        snapshot::SetSnapshot,
        sync::Fence,
        Validated,
    };
    use std::sync::Arc;

    const COMPUTE: PipelineBindPoint = PipelineBindPoint::Compute;

    fn set_layout(
        device: &Arc<Device>,
        descriptor_count: u32,
        binding_flags: DescriptorBindingFlags,
    ) -> Arc<DescriptorSetLayout> {
        let flags = if binding_flags.intersects(DescriptorBindingFlags::UPDATE_AFTER_BIND) {
            DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL
        } else {
            DescriptorSetLayoutCreateFlags::empty()
        };

        DescriptorSetLayout::new(
            device.clone(),
            DescriptorSetLayoutCreateInfo {
                flags,
                bindings: [(
                    0,
                    DescriptorSetLayoutBinding {
                        binding_flags,
                        descriptor_count,
                        ..DescriptorSetLayoutBinding::descriptor_type(DescriptorType::StorageBuffer)
                    },
                )]
                .into(),
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn pipeline_layout(
        device: &Arc<Device>,
        set_layouts: &[&Arc<DescriptorSetLayout>],
    ) -> Arc<PipelineLayout> {
        PipelineLayout::new(
            device.clone(),
            PipelineLayoutCreateInfo {
                set_layouts: set_layouts.iter().map(|&layout| layout.clone()).collect(),
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn resources(raw: impl IntoIterator<Item = u64>) -> Vec<ResourceId> {
        raw.into_iter()
            .map(|raw| ResourceId::from_raw(raw).unwrap())
            .collect()
    }

    /// A descriptor set whose first elements refer to `raw` resources.
    fn written_set(
        layout: &Arc<DescriptorSetLayout>,
        raw: impl IntoIterator<Item = u64>,
    ) -> Arc<DescriptorSet> {
        let set = DescriptorSet::new(layout.clone(), 0).unwrap();
        let resources = resources(raw);

        if !resources.is_empty() {
            set.write(&WriteDescriptorSet::resource_array(0, 0, resources))
                .unwrap();
        }

        set
    }

    /// For each of `sets`: `Output(buffers[invocation_index])`, through binding 0 of the set.
    fn indexed_loads(device: &Arc<Device>, stage: ShaderStage, sets: &[u32]) -> Arc<ShaderModule> {
        let variables = (0..)
            .zip(sets)
            .map(|(index, &set)| DescriptorVariable {
                id: VariableId(index),
                set,
                binding: 0,
                descriptor_type: DescriptorType::StorageBuffer,
                array: DescriptorArray::Runtime,
            })
            .collect();

        let mut instructions = vec![Instruction::InvocationIndex { result: Id(0) }];

        for index in 0..sets.len() as u32 {
            instructions.push(Instruction::Access(Access {
                result: Some(Id(1 + index)),
                variable: VariableId(index),
                index: Some(Id(0)),
                op: AccessOp::Load,
            }));
            instructions.push(Instruction::Output {
                value: Id(1 + index),
            });
        }

        ShaderModule::new(
            device.clone(),
            ShaderModuleCreateInfo {
                variables,
                instructions,
                ..ShaderModuleCreateInfo::stage(stage)
            },
        )
        .unwrap()
    }

    fn pipeline(
        device: &Arc<Device>,
        bind_point: PipelineBindPoint,
        layout: &Arc<PipelineLayout>,
        stages: Vec<Arc<ShaderModule>>,
    ) -> Arc<Pipeline> {
        Pipeline::new(
            device.clone(),
            PipelineCreateInfo {
                stages,
                ..PipelineCreateInfo::bind_point_and_layout(bind_point, layout.clone())
            },
        )
        .unwrap()
    }

    fn recording(device: &Arc<Device>) -> CommandBuffer {
        let mut command_buffer = CommandBuffer::new(device.clone());
        command_buffer.begin().unwrap();

        command_buffer
    }

    /// Ends recording, submits, and waits for the results.
    fn run(command_buffer: &mut CommandBuffer) -> Vec<DecodedViolation> {
        if command_buffer.state() == CommandBufferState::Recording {
            command_buffer.end().unwrap();
        }

        let queue = Queue::new(command_buffer.device().clone());
        let fence = queue.submit(command_buffer).unwrap();

        command_buffer.wait(&fence).unwrap().to_vec()
    }

    fn kinds(violations: &[DecodedViolation]) -> Vec<(u32, u32, ViolationKind)> {
        violations
            .iter()
            .map(|violation| (violation.set, violation.element, violation.kind))
            .collect()
    }

    #[test]
    fn lifecycle() {
        let device = test_device!();
        let layout = set_layout(&device, 1, DescriptorBindingFlags::empty());
        let pipeline_layout = pipeline_layout(&device, &[&layout]);
        let set = written_set(&layout, [1]);

        let mut command_buffer = CommandBuffer::new(device.clone());
        assert_eq!(command_buffer.state(), CommandBufferState::Initial);
        assert!(command_buffer.dispatch([1, 1, 1]).is_err());
        assert!(command_buffer
            .bind_descriptor_sets(COMPUTE, pipeline_layout.clone(), 0, [set.clone()])
            .is_err());
        assert!(command_buffer.end().is_err());
        assert!(command_buffer.on_submit().is_err());

        command_buffer.begin().unwrap();
        assert!(command_buffer.on_submit().is_err());

        // Nothing is bound to the compute bind point.
        let err = command_buffer.dispatch([1, 1, 1]).unwrap_err();
        assert_eq!(err.vuids, ["VUID-vkCmdDispatch-None-08606"]);

        command_buffer.end().unwrap();
        assert_eq!(command_buffer.state(), CommandBufferState::Executable);

        let fence = command_buffer.on_submit().unwrap();
        assert_eq!(command_buffer.state(), CommandBufferState::Pending);
        assert!(command_buffer.on_submit().is_err());
        assert!(command_buffer.begin().is_err());

        // Nothing has executed yet.
        assert!(matches!(
            command_buffer.wait(&fence),
            Err(Validated::Error(GpuAvError::NotComplete)),
        ));
        assert_eq!(
            command_buffer.decoded_violations(),
            Err(GpuAvError::NotComplete),
        );

        assert!(matches!(
            command_buffer.wait(&Fence::new()),
            Err(Validated::ValidationError(_)),
        ));

        fence.signal();
        assert!(command_buffer.wait(&fence).unwrap().is_empty());
        assert_eq!(command_buffer.state(), CommandBufferState::Executable);

        // The fence belongs to a submission that was already waited for.
        assert!(matches!(
            command_buffer.wait(&fence),
            Err(Validated::ValidationError(_)),
        ));
    }

    #[test]
    fn bind_descriptor_sets_validation() {
        let device = test_device!();
        let a = set_layout(&device, 1, DescriptorBindingFlags::empty());
        let b = set_layout(&device, 1, DescriptorBindingFlags::empty());
        let pipeline_layout = pipeline_layout(&device, &[&a, &b]);
        let set_a = written_set(&a, [1]);
        let set_b = written_set(&b, [2]);

        let mut command_buffer = recording(&device);

        let err = command_buffer
            .bind_descriptor_sets(COMPUTE, pipeline_layout.clone(), 0, Vec::new())
            .unwrap_err();
        assert_eq!(
            err.vuids,
            ["VUID-vkCmdBindDescriptorSets-descriptorSetCount-arraylength"],
        );

        let err = command_buffer
            .bind_descriptor_sets(COMPUTE, pipeline_layout.clone(), 1, [set_b.clone(), set_b.clone()])
            .unwrap_err();
        assert_eq!(err.vuids, ["VUID-vkCmdBindDescriptorSets-firstSet-00360"]);

        let err = command_buffer
            .bind_descriptor_sets(COMPUTE, pipeline_layout.clone(), 0, [set_b.clone()])
            .unwrap_err();
        assert_eq!(
            err.vuids,
            ["VUID-vkCmdBindDescriptorSets-pDescriptorSets-00358"],
        );

        command_buffer
            .bind_descriptor_sets(COMPUTE, pipeline_layout.clone(), 0, [set_a, set_b.clone()])
            .unwrap();
        assert_eq!(
            command_buffer.set_binding_state(COMPUTE, 1),
            SetBindingState::Bound {
                descriptor_set: set_b.id(),
                pipeline_layout: pipeline_layout.id(),
            },
        );

        // Bind points are independent.
        assert_eq!(
            command_buffer.set_binding_state(PipelineBindPoint::Graphics, 1),
            SetBindingState::Unbound,
        );
    }

    #[test]
    fn push_constants_validation() {
        let device = test_device!();
        let layout = PipelineLayout::new(
            device.clone(),
            PipelineLayoutCreateInfo {
                push_constant_ranges: vec![PushConstantRange {
                    stages: ShaderStages::COMPUTE,
                    offset: 0,
                    size: 8,
                }],
                ..Default::default()
            },
        )
        .unwrap();

        let mut command_buffer = recording(&device);

        let vuids = |result: Result<(), Box<crate::ValidationError>>| result.unwrap_err().vuids;
        assert_eq!(
            vuids(command_buffer.push_constants(&layout, 0, &[])),
            ["VUID-vkCmdPushConstants-size-arraylength"],
        );
        assert_eq!(
            vuids(command_buffer.push_constants(&layout, 2, &[0; 4])),
            ["VUID-vkCmdPushConstants-offset-00368"],
        );
        assert_eq!(
            vuids(command_buffer.push_constants(&layout, 0, &[0; 3])),
            ["VUID-vkCmdPushConstants-size-00369"],
        );
        assert_eq!(
            vuids(command_buffer.push_constants(&layout, 128, &[0; 4])),
            ["VUID-vkCmdPushConstants-offset-00370"],
        );
        assert_eq!(
            vuids(command_buffer.push_constants(&layout, 64, &[0; 68])),
            ["VUID-vkCmdPushConstants-size-00371"],
        );
        assert_eq!(
            vuids(command_buffer.push_constants(&layout, 4, &[0; 8])),
            ["VUID-vkCmdPushConstants-offset-01795"],
        );

        command_buffer.push_constants(&layout, 4, &[0; 4]).unwrap();
    }

    #[test]
    fn compatible_rebind_preserves_lower_sets() {
        let device = test_device!();
        let a = set_layout(&device, 4, DescriptorBindingFlags::empty());
        let b = set_layout(&device, 4, DescriptorBindingFlags::empty());
        let c = set_layout(&device, 4, DescriptorBindingFlags::empty());
        let l1 = pipeline_layout(&device, &[&a, &b]);
        let l2 = pipeline_layout(&device, &[&a, &c]);

        let set_a = written_set(&a, [1, 2, 3, 4]);
        let set_b = written_set(&b, [5, 6, 7, 8]);
        let set_a2 = written_set(&a, [9, 10, 11, 12]);

        let pipeline = pipeline(
            &device,
            COMPUTE,
            &l1,
            vec![indexed_loads(&device, ShaderStage::Compute, &[0, 1])],
        );

        let mut command_buffer = recording(&device);
        command_buffer.bind_pipeline(pipeline).unwrap();
        command_buffer
            .bind_descriptor_sets(COMPUTE, l1.clone(), 0, [set_a, set_b.clone()])
            .unwrap();

        // `l2` has the same set layout as `l1` at set 0.
        command_buffer
            .bind_descriptor_sets(COMPUTE, l2.clone(), 0, [set_a2.clone()])
            .unwrap();
        assert_eq!(
            command_buffer.set_binding_state(COMPUTE, 0),
            SetBindingState::Bound {
                descriptor_set: set_a2.id(),
                pipeline_layout: l2.id(),
            },
        );
        assert_eq!(
            command_buffer.set_binding_state(COMPUTE, 1),
            SetBindingState::Bound {
                descriptor_set: set_b.id(),
                pipeline_layout: l1.id(),
            },
        );

        let info = command_buffer.dispatch([4, 1, 1]).unwrap();
        assert!(info.unbound_sets.is_empty());

        assert!(run(&mut command_buffer).is_empty());
        assert_eq!(
            command_buffer.outputs(info.command_index).unwrap(),
            [9, 5, 10, 6, 11, 7, 12, 8],
        );
    }

    #[test]
    fn incompatible_rebind_disturbs_higher_sets() {
        let device = test_device!();
        let a = set_layout(&device, 2, DescriptorBindingFlags::empty());
        let b = set_layout(&device, 2, DescriptorBindingFlags::empty());
        let x = set_layout(&device, 2, DescriptorBindingFlags::empty());
        let l1 = pipeline_layout(&device, &[&a, &b]);
        let l3 = pipeline_layout(&device, &[&x, &b]);

        let set_a = written_set(&a, [1, 2]);
        let set_b = written_set(&b, [3, 4]);
        let set_x = written_set(&x, [5, 6]);

        let pipeline = pipeline(
            &device,
            COMPUTE,
            &l1,
            vec![indexed_loads(&device, ShaderStage::Compute, &[0, 1])],
        );

        let mut command_buffer = recording(&device);
        command_buffer.bind_pipeline(pipeline).unwrap();
        command_buffer
            .bind_descriptor_sets(COMPUTE, l1.clone(), 0, [set_a.clone(), set_b.clone()])
            .unwrap();

        // Binding the same incompatible set twice changes nothing the second time.
        for _ in 0..2 {
            command_buffer
                .bind_descriptor_sets(COMPUTE, l3.clone(), 0, [set_x.clone()])
                .unwrap();
            assert_eq!(
                command_buffer.set_binding_state(COMPUTE, 0),
                SetBindingState::Bound {
                    descriptor_set: set_x.id(),
                    pipeline_layout: l3.id(),
                },
            );
            assert_eq!(
                command_buffer.set_binding_state(COMPUTE, 1),
                SetBindingState::Disturbed,
            );
        }

        let snapshot = command_buffer.snapshot(COMPUTE).unwrap();
        assert_eq!(snapshot.sets, [SetSnapshot::Disturbed, SetSnapshot::Disturbed]);

        let info = command_buffer.dispatch([2, 1, 1]).unwrap();
        let violations = run(&mut command_buffer);
        assert_eq!(
            kinds(&violations),
            [
                (0, 0, ViolationKind::StaleBindingAfterIncompatibleRebind),
                (1, 0, ViolationKind::StaleBindingAfterIncompatibleRebind),
                (0, 1, ViolationKind::StaleBindingAfterIncompatibleRebind),
                (1, 1, ViolationKind::StaleBindingAfterIncompatibleRebind),
            ],
        );
        assert_eq!(violations[0].vuid, "VUID-vkCmdDispatch-None-08600");
        assert_eq!(violations[0].descriptor_set, Some(set_x.id()));
        assert_eq!(violations[0].pipeline_layout, Some(l3.id()));
        assert_eq!(violations[1].descriptor_set, Some(set_b.id()));
        assert_eq!(violations[1].pipeline_layout, Some(l1.id()));
        assert_eq!(command_buffer.outputs(info.command_index).unwrap(), [0; 4]);

        // An incompatible set at set 1 leaves set 0 alone.
        let d = set_layout(&device, 2, DescriptorBindingFlags::empty());
        let l4 = pipeline_layout(&device, &[&a, &d]);
        let set_d = written_set(&d, [7, 8]);

        command_buffer.begin().unwrap();
        command_buffer
            .bind_descriptor_sets(COMPUTE, l1.clone(), 0, [set_a.clone(), set_b])
            .unwrap();
        command_buffer
            .bind_descriptor_sets(COMPUTE, l4.clone(), 1, [set_d.clone()])
            .unwrap();
        assert_eq!(
            command_buffer.set_binding_state(COMPUTE, 0),
            SetBindingState::Bound {
                descriptor_set: set_a.id(),
                pipeline_layout: l1.id(),
            },
        );
        assert_eq!(
            command_buffer.set_binding_state(COMPUTE, 1),
            SetBindingState::Bound {
                descriptor_set: set_d.id(),
                pipeline_layout: l4.id(),
            },
        );
    }

    #[test]
    fn partially_bound_binding() {
        let device = test_device!();
        let layout = set_layout(&device, 2, DescriptorBindingFlags::PARTIALLY_BOUND);
        let pipeline_layout = pipeline_layout(&device, &[&layout]);

        // Only element 1 is written.
        let set = DescriptorSet::new(layout.clone(), 0).unwrap();
        set.write(&WriteDescriptorSet::resource_array(0, 1, resources([20])))
            .unwrap();

        // `if invocation_index == 1 { Output(buffers[invocation_index]) }`
        let conditional = ShaderModule::new(
            device.clone(),
            ShaderModuleCreateInfo {
                variables: vec![DescriptorVariable {
                    id: VariableId(0),
                    set: 0,
                    binding: 0,
                    descriptor_type: DescriptorType::StorageBuffer,
                    array: DescriptorArray::Runtime,
                }],
                instructions: vec![
                    Instruction::InvocationIndex { result: Id(0) },
                    Instruction::Constant {
                        result: Id(1),
                        value: 1,
                    },
                    Instruction::Binary {
                        result: Id(2),
                        op: BinaryOp::IEqual,
                        lhs: Id(0),
                        rhs: Id(1),
                    },
                    Instruction::Selection {
                        condition: Id(2),
                        accept: vec![
                            Instruction::Access(Access {
                                result: Some(Id(3)),
                                variable: VariableId(0),
                                index: Some(Id(0)),
                                op: AccessOp::Load,
                            }),
                            Instruction::Output { value: Id(3) },
                        ],
                        reject: vec![],
                    },
                ],
                ..ShaderModuleCreateInfo::stage(ShaderStage::Compute)
            },
        )
        .unwrap();
        let conditional = pipeline(&device, COMPUTE, &pipeline_layout, vec![conditional]);
        let unconditional = pipeline(
            &device,
            COMPUTE,
            &pipeline_layout,
            vec![indexed_loads(&device, ShaderStage::Compute, &[0])],
        );

        let mut command_buffer = recording(&device);
        command_buffer
            .bind_descriptor_sets(COMPUTE, pipeline_layout, 0, [set.clone()])
            .unwrap();
        command_buffer.bind_pipeline(conditional).unwrap();
        let first = command_buffer.dispatch([2, 1, 1]).unwrap();
        command_buffer.bind_pipeline(unconditional).unwrap();
        let second = command_buffer.dispatch([1, 1, 1]).unwrap();

        let violations = run(&mut command_buffer);
        assert_eq!(
            kinds(&violations),
            [(0, 0, ViolationKind::UnwrittenDescriptor)],
        );
        assert_eq!(violations[0].command_index, second.command_index);
        assert_eq!(violations[0].descriptor_set, Some(set.id()));
        assert_eq!(command_buffer.outputs(first.command_index).unwrap(), [20]);
        assert_eq!(command_buffer.outputs(second.command_index).unwrap(), [0]);
    }

    #[test]
    fn pipeline_switch_keeps_shared_sets() {
        let device = test_device!();
        let s0 = set_layout(&device, 2, DescriptorBindingFlags::empty());
        let s1 = set_layout(&device, 2, DescriptorBindingFlags::empty());
        let s1_other = set_layout(&device, 2, DescriptorBindingFlags::empty());
        let superset = pipeline_layout(&device, &[&s0, &s1]);
        let subset = pipeline_layout(&device, &[&s0, &s1_other]);

        let set0 = written_set(&s0, [1, 2]);
        let set1 = written_set(&s1, [3, 4]);

        let both = pipeline(
            &device,
            COMPUTE,
            &superset,
            vec![indexed_loads(&device, ShaderStage::Compute, &[0, 1])],
        );
        let first_only = pipeline(
            &device,
            COMPUTE,
            &subset,
            vec![indexed_loads(&device, ShaderStage::Compute, &[0])],
        );

        let mut command_buffer = recording(&device);
        command_buffer.bind_pipeline(both.clone()).unwrap();
        command_buffer
            .bind_descriptor_sets(COMPUTE, superset, 0, [set0.clone(), set1.clone()])
            .unwrap();
        let first = command_buffer.dispatch([2, 1, 1]).unwrap();
        command_buffer.bind_pipeline(first_only).unwrap();
        let second = command_buffer.dispatch([2, 1, 1]).unwrap();
        command_buffer.bind_pipeline(both).unwrap();
        let third = command_buffer.dispatch([2, 1, 1]).unwrap();

        assert!(run(&mut command_buffer).is_empty());
        assert_eq!(
            command_buffer.outputs(first.command_index).unwrap(),
            [1, 3, 2, 4],
        );
        assert_eq!(command_buffer.outputs(second.command_index).unwrap(), [1, 2]);
        assert_eq!(
            command_buffer.outputs(third.command_index).unwrap(),
            [1, 3, 2, 4],
        );
    }

    #[test]
    fn unbound_sets_are_reported_on_the_host() {
        let device = test_device!();
        let a = set_layout(&device, 1, DescriptorBindingFlags::empty());
        let b = set_layout(&device, 1, DescriptorBindingFlags::empty());
        let layout = pipeline_layout(&device, &[&a, &b]);

        let pipeline = pipeline(
            &device,
            COMPUTE,
            &layout,
            vec![indexed_loads(&device, ShaderStage::Compute, &[0, 1])],
        );

        let set = written_set(&a, [7]);

        let mut command_buffer = recording(&device);
        command_buffer.bind_pipeline(pipeline).unwrap();
        command_buffer
            .bind_descriptor_sets(COMPUTE, layout, 0, [set.clone()])
            .unwrap();

        let info = command_buffer.dispatch([1, 1, 1]).unwrap();
        assert_eq!(info.unbound_sets.as_slice(), [1]);

        assert!(run(&mut command_buffer).is_empty());
        assert_eq!(command_buffer.outputs(info.command_index).unwrap(), [7, 0]);
    }

    #[test]
    fn error_channel_keeps_first_records() {
        let device = Device::new(DeviceCreateInfo {
            enabled_features: DeviceFeatures::descriptor_indexing(),
            config: GpuAvConfig {
                max_error_records: 4,
                ..Default::default()
            },
            ..Default::default()
        });
        let layout = set_layout(&device, 2, DescriptorBindingFlags::empty());
        let pipeline_layout = pipeline_layout(&device, &[&layout]);
        let pipeline = pipeline(
            &device,
            COMPUTE,
            &pipeline_layout,
            vec![indexed_loads(&device, ShaderStage::Compute, &[0])],
        );

        let set = written_set(&layout, [1, 2]);

        let mut command_buffer = recording(&device);
        command_buffer.bind_pipeline(pipeline).unwrap();
        command_buffer
            .bind_descriptor_sets(COMPUTE, pipeline_layout, 0, [set.clone()])
            .unwrap();
        let info = command_buffer.dispatch([10, 1, 1]).unwrap();

        // 8 invocations go out of bounds, only the first 4 are kept.
        let violations = run(&mut command_buffer);
        assert_eq!(
            violations
                .iter()
                .map(|violation| violation.element)
                .collect::<Vec<_>>(),
            [2, 3, 4, 5],
        );
        assert!(violations
            .iter()
            .all(|violation| violation.kind == ViolationKind::OutOfBoundsIndex));
        assert_eq!(
            command_buffer.outputs(info.command_index).unwrap(),
            [1, 2, 0, 0, 0, 0, 0, 0, 0, 0],
        );
    }

    #[test]
    fn rerecording_forgets_previous_violations() {
        let device = test_device!();
        let layout = set_layout(&device, 1, DescriptorBindingFlags::empty());
        let pipeline_layout = pipeline_layout(&device, &[&layout]);
        let pipeline = pipeline(
            &device,
            COMPUTE,
            &pipeline_layout,
            vec![indexed_loads(&device, ShaderStage::Compute, &[0])],
        );
        let set = written_set(&layout, []);

        let record = |command_buffer: &mut CommandBuffer| {
            command_buffer.begin().unwrap();
            command_buffer.bind_pipeline(pipeline.clone()).unwrap();
            command_buffer
                .bind_descriptor_sets(COMPUTE, pipeline_layout.clone(), 0, [set.clone()])
                .unwrap();
            command_buffer.dispatch([1, 1, 1]).unwrap();
        };

        let mut command_buffer = CommandBuffer::new(device.clone());
        record(&mut command_buffer);
        assert_eq!(
            kinds(&run(&mut command_buffer)),
            [(0, 0, ViolationKind::UnwrittenDescriptor)],
        );

        set.write(&WriteDescriptorSet::resource(0, resources([3])[0]))
            .unwrap();
        record(&mut command_buffer);
        assert!(command_buffer.decoded_violations().unwrap().is_empty());
        assert!(run(&mut command_buffer).is_empty());
    }

    #[test]
    fn update_after_bind_is_refreshed_at_submit() {
        let device = test_device!();

        for (binding_flags, expected) in [
            (
                DescriptorBindingFlags::UPDATE_AFTER_BIND | DescriptorBindingFlags::PARTIALLY_BOUND,
                vec![],
            ),
            (
                DescriptorBindingFlags::PARTIALLY_BOUND,
                vec![(0, 1, ViolationKind::UnwrittenDescriptor)],
            ),
        ] {
            let layout = set_layout(&device, 2, binding_flags);
            let pipeline_layout = pipeline_layout(&device, &[&layout]);
            let pipeline = pipeline(
                &device,
                COMPUTE,
                &pipeline_layout,
                vec![indexed_loads(&device, ShaderStage::Compute, &[0])],
            );
            let set = written_set(&layout, [1]);

            let mut command_buffer = recording(&device);
            command_buffer.bind_pipeline(pipeline).unwrap();
            command_buffer
                .bind_descriptor_sets(COMPUTE, pipeline_layout, 0, [set.clone()])
                .unwrap();
            command_buffer.dispatch([2, 1, 1]).unwrap();
            command_buffer.end().unwrap();

            // Written after the command was recorded.
            set.write(&WriteDescriptorSet::resource_array(0, 1, resources([2])))
                .unwrap();

            assert_eq!(kinds(&run(&mut command_buffer)), expected);
        }
    }

    #[test]
    fn destroyed_resources() {
        let device = test_device!();
        let layout = set_layout(&device, 2, DescriptorBindingFlags::empty());
        let pipeline_layout = pipeline_layout(&device, &[&layout]);
        let pipeline = pipeline(
            &device,
            COMPUTE,
            &pipeline_layout,
            vec![indexed_loads(&device, ShaderStage::Compute, &[0])],
        );
        let set = written_set(&layout, [10, 11]);

        let mut command_buffer = recording(&device);
        command_buffer.bind_pipeline(pipeline.clone()).unwrap();
        command_buffer
            .bind_descriptor_sets(COMPUTE, pipeline_layout.clone(), 0, [set.clone()])
            .unwrap();
        let info = command_buffer.dispatch([2, 1, 1]).unwrap();
        command_buffer.end().unwrap();

        // The resource is destroyed between recording and submission.
        device.destroy_resource(ResourceId::from_raw(11).unwrap());

        assert_eq!(
            kinds(&run(&mut command_buffer)),
            [(0, 1, ViolationKind::DestroyedUnderlyingResource)],
        );
        assert_eq!(command_buffer.outputs(info.command_index).unwrap(), [10, 0]);

        // A descriptor set that is dropped while bound destroys all of its descriptors.
        let set = written_set(&layout, [12, 13]);
        command_buffer.begin().unwrap();
        command_buffer.bind_pipeline(pipeline).unwrap();
        command_buffer
            .bind_descriptor_sets(COMPUTE, pipeline_layout, 0, [set])
            .unwrap();
        command_buffer.dispatch([2, 1, 1]).unwrap();

        assert_eq!(
            kinds(&run(&mut command_buffer)),
            [
                (0, 0, ViolationKind::DestroyedUnderlyingResource),
                (0, 1, ViolationKind::DestroyedUnderlyingResource),
            ],
        );
    }

    #[test]
    fn snapshot_regions_are_reused() {
        let device = test_device!();
        let layout = set_layout(&device, 2, DescriptorBindingFlags::empty());
        let pipeline_layout = pipeline_layout(&device, &[&layout]);
        let pipeline = pipeline(
            &device,
            COMPUTE,
            &pipeline_layout,
            vec![indexed_loads(&device, ShaderStage::Compute, &[0])],
        );
        let set = written_set(&layout, [1]);

        let mut command_buffer = recording(&device);
        command_buffer.bind_pipeline(pipeline).unwrap();
        command_buffer
            .bind_descriptor_sets(COMPUTE, pipeline_layout, 0, [set.clone()])
            .unwrap();

        command_buffer.dispatch([1, 1, 1]).unwrap();
        let len = command_buffer.snapshots.len();
        command_buffer.dispatch([1, 1, 1]).unwrap();
        assert_eq!(command_buffer.snapshots.len(), len);

        // The set changed, so the state is captured again.
        set.write(&WriteDescriptorSet::resource_array(0, 1, resources([2])))
            .unwrap();
        let info = command_buffer.dispatch([2, 1, 1]).unwrap();
        assert_eq!(command_buffer.snapshots.len(), len * 2);

        assert!(run(&mut command_buffer).is_empty());
        assert_eq!(command_buffer.outputs(info.command_index).unwrap(), [1, 2]);
    }

    #[test]
    fn decoded_violation() {
        let device = test_device!();
        let layout = set_layout(&device, 1, DescriptorBindingFlags::empty());
        let pipeline_layout = pipeline_layout(&device, &[&layout]);
        let module = indexed_loads(&device, ShaderStage::Compute, &[0]);
        let pipeline = pipeline(&device, COMPUTE, &pipeline_layout, vec![module.clone()]);
        let set = written_set(&layout, [1]);

        let mut command_buffer = recording(&device);
        command_buffer.bind_pipeline(pipeline).unwrap();
        command_buffer
            .bind_descriptor_sets(COMPUTE, pipeline_layout.clone(), 0, [set.clone()])
            .unwrap();
        let info = command_buffer.dispatch([2, 1, 1]).unwrap();

        let violations = run(&mut command_buffer);
        assert_eq!(violations.len(), 1);

        let violation = &violations[0];
        assert_eq!(violation.kind, ViolationKind::OutOfBoundsIndex);
        assert_eq!(violation.stage, ShaderStage::Compute);
        assert_eq!((violation.set, violation.binding, violation.element), (0, 0, 1));
        assert_eq!(violation.vuid, "VUID-vkCmdDispatch-None-10068");
        assert_eq!(violation.command, CommandKind::Dispatch);
        assert_eq!(violation.command_index, info.command_index);
        assert_eq!(violation.bind_point, COMPUTE);
        assert_eq!(violation.descriptor_set, Some(set.id()));
        assert_eq!(violation.descriptor_set_layout, Some(layout.id()));
        assert_eq!(violation.pipeline_layout, Some(pipeline_layout.id()));
        assert_eq!(violation.shader_module, module.id());
        assert!(violation.location.contains("set 0, binding 0"));

        let message = violation.to_string();
        assert!(message.starts_with("vkCmdDispatch"));
        assert!(message.contains("VUID-vkCmdDispatch-None-10068"));

        assert_eq!(command_buffer.decoded_violations().unwrap(), violations);
    }

    #[test]
    fn push_constants_are_captured_per_command() {
        let device = test_device!();
        let layout = set_layout(&device, 4, DescriptorBindingFlags::empty());
        let pipeline_layout = PipelineLayout::new(
            device.clone(),
            PipelineLayoutCreateInfo {
                set_layouts: vec![layout.clone()],
                push_constant_ranges: vec![PushConstantRange {
                    stages: ShaderStages::COMPUTE,
                    offset: 0,
                    size: 4,
                }],
                ..Default::default()
            },
        )
        .unwrap();

        // `Output(buffers[push_constants[0]])`
        let module = ShaderModule::new(
            device.clone(),
            ShaderModuleCreateInfo {
                variables: vec![DescriptorVariable {
                    id: VariableId(0),
                    set: 0,
                    binding: 0,
                    descriptor_type: DescriptorType::StorageBuffer,
                    array: DescriptorArray::Runtime,
                }],
                instructions: vec![
                    Instruction::LoadPushConstant {
                        result: Id(0),
                        offset: 0,
                    },
                    Instruction::Access(Access {
                        result: Some(Id(1)),
                        variable: VariableId(0),
                        index: Some(Id(0)),
                        op: AccessOp::Load,
                    }),
                    Instruction::Output { value: Id(1) },
                ],
                ..ShaderModuleCreateInfo::stage(ShaderStage::Compute)
            },
        )
        .unwrap();
        let pipeline = pipeline(&device, COMPUTE, &pipeline_layout, vec![module]);
        let set = written_set(&layout, [10, 11, 12, 13]);

        let mut command_buffer = recording(&device);
        command_buffer.bind_pipeline(pipeline).unwrap();
        command_buffer
            .bind_descriptor_sets(COMPUTE, pipeline_layout.clone(), 0, [set.clone()])
            .unwrap();

        let mut infos = Vec::new();

        for index in [2u32, 5] {
            command_buffer
                .push_constants(&pipeline_layout, 0, &index.to_ne_bytes())
                .unwrap();
            infos.push(command_buffer.dispatch([1, 1, 1]).unwrap());
        }

        assert_eq!(
            kinds(&run(&mut command_buffer)),
            [(0, 5, ViolationKind::OutOfBoundsIndex)],
        );
        assert_eq!(command_buffer.outputs(infos[0].command_index).unwrap(), [12]);
        assert_eq!(command_buffer.outputs(infos[1].command_index).unwrap(), [0]);
    }

    #[test]
    fn graphics_and_ray_tracing() {
        let device = test_device!();
        let layout = set_layout(&device, 2, DescriptorBindingFlags::empty());
        let pipeline_layout = pipeline_layout(&device, &[&layout]);
        let set = written_set(&layout, [1, 2]);

        let graphics = pipeline(
            &device,
            PipelineBindPoint::Graphics,
            &pipeline_layout,
            vec![
                indexed_loads(&device, ShaderStage::Fragment, &[0]),
                indexed_loads(&device, ShaderStage::Vertex, &[0]),
            ],
        );
        let ray_tracing = pipeline(
            &device,
            PipelineBindPoint::RayTracing,
            &pipeline_layout,
            vec![indexed_loads(&device, ShaderStage::Raygen, &[0])],
        );

        let mut command_buffer = recording(&device);
        command_buffer.bind_pipeline(graphics).unwrap();
        command_buffer.bind_pipeline(ray_tracing).unwrap();

        for bind_point in [PipelineBindPoint::Graphics, PipelineBindPoint::RayTracing] {
            command_buffer
                .bind_descriptor_sets(bind_point, pipeline_layout.clone(), 0, [set.clone()])
                .unwrap();
        }

        // Every stage runs once per vertex.
        let draw = command_buffer.draw(3, 1).unwrap();
        let trace = command_buffer.trace_rays([2, 1, 1]).unwrap();

        let violations = run(&mut command_buffer);
        assert_eq!(
            violations
                .iter()
                .map(|violation| (violation.stage, violation.element, violation.vuid))
                .collect::<Vec<_>>(),
            [
                (ShaderStage::Vertex, 2, "VUID-vkCmdDraw-None-10068"),
                (ShaderStage::Fragment, 2, "VUID-vkCmdDraw-None-10068"),
            ],
        );
        assert_eq!(
            command_buffer.outputs(draw.command_index).unwrap(),
            [1, 2, 0, 1, 2, 0],
        );
        assert_eq!(command_buffer.outputs(trace.command_index).unwrap(), [1, 2]);
        assert!(violations
            .iter()
            .all(|violation| violation.command == CommandKind::Draw));
    }
}

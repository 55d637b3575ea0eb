//! A software executor for shader modules, standing in for the device.
//!
//! The executor runs every invocation of a command one after the other. Instrumented modules
//! consult the binding snapshot of the command before each access, exactly as they would on the
//! device, and report violations into the error channel of the submission.
//!
//! Accesses that are actually performed are checked against the live state of the descriptor
//! sets. An access to a descriptor that is not valid is what would crash or corrupt a real
//! device, and is reported as [`ExecutionError::DeviceFault`]. With instrumentation, this can
//! only happen for bindings that opted out of validation.

use super::{AccessOp, Id, Instruction, InstrumentedShader, ShaderStage, VariableId};
use crate::{
    descriptor_set::{DescriptorSet, DescriptorValidity, ResourceId},
    error_channel::{ErrorChannel, ErrorRecord, ViolationKind},
    snapshot::{self, SnapshotLookup},
};
use foldhash::HashMap;
use std::{
    error::Error,
    fmt::{Display, Error as FmtError, Formatter},
    num::NonZero,
    sync::Arc,
};

/// Everything a command can see while it executes.
#[derive(Debug)]
pub struct ExecutionContext<'a> {
    /// The snapshot words of the command buffer, and the offset of the region of the command.
    /// `None` if validation is disabled.
    pub snapshot: Option<(&'a [u32], u32)>,

    /// The descriptor sets that the command sees, indexed by set number.
    pub descriptor_sets: &'a [Option<Arc<DescriptorSet>>],

    pub push_constants: &'a [u8],
    pub channel: &'a ErrorChannel,
    pub memory: &'a mut DeviceMemory,

    /// The index of the command in its command buffer, in recording order.
    pub command_index: u32,

    /// Whether the `null_descriptor` feature is enabled.
    pub null_descriptor: bool,
}

/// Executes `invocation_count` invocations of `shader`, and returns what they output, in
/// invocation order.
pub fn execute(
    shader: &InstrumentedShader,
    invocation_count: u32,
    ctx: &mut ExecutionContext<'_>,
) -> Result<Vec<u32>, ExecutionError> {
    let mut invocation = Invocation {
        shader,
        ctx,
        registers: vec![0; shader.register_count() as usize],
        index: 0,
        output: Vec::new(),
    };

    for index in 0..invocation_count {
        invocation.index = index;
        invocation.registers.fill(0);
        invocation.run_block(shader.instructions())?;
    }

    Ok(invocation.output)
}

struct Invocation<'s, 'c, 'a> {
    shader: &'s InstrumentedShader,
    ctx: &'c mut ExecutionContext<'a>,
    registers: Vec<u32>,
    index: u32,
    output: Vec<u32>,
}

impl Invocation<'_, '_, '_> {
    fn get(&self, id: Id) -> u32 {
        self.registers[id.0 as usize]
    }

    fn set(&mut self, id: Id, value: u32) {
        self.registers[id.0 as usize] = value;
    }

    fn run_block(&mut self, instructions: &[Instruction]) -> Result<(), ExecutionError> {
        for instruction in instructions {
            match *instruction {
                Instruction::Constant { result, value } => self.set(result, value),
                Instruction::InvocationIndex { result } => self.set(result, self.index),
                Instruction::LoadPushConstant { result, offset } => {
                    let value = self
                        .ctx
                        .push_constants
                        .get(offset as usize..offset as usize + 4)
                        .map(bytemuck::pod_read_unaligned::<u32>)
                        .ok_or(ExecutionError::PushConstantOutOfRange {
                            offset,
                            size: self.ctx.push_constants.len() as u32,
                        })?;
                    self.set(result, value);
                }
                Instruction::Binary {
                    result,
                    op,
                    lhs,
                    rhs,
                } => self.set(result, op.apply(self.get(lhs), self.get(rhs))),
                Instruction::LogicalNot { result, operand } => {
                    self.set(result, (self.get(operand) == 0) as u32)
                }
                Instruction::NonUniform { result, operand } => self.set(result, self.get(operand)),
                Instruction::Select {
                    result,
                    condition,
                    accept,
                    reject,
                } => {
                    let value = if self.get(condition) != 0 {
                        self.get(accept)
                    } else {
                        self.get(reject)
                    };
                    self.set(result, value);
                }
                Instruction::Selection {
                    condition,
                    ref accept,
                    ref reject,
                } => {
                    if self.get(condition) != 0 {
                        self.run_block(accept)?;
                    } else {
                        self.run_block(reject)?;
                    }
                }
                Instruction::Access(access) => {
                    let variable = self
                        .shader
                        .module()
                        .variable(access.variable)
                        .copied()
                        .ok_or(ExecutionError::UndeclaredVariable {
                            variable: access.variable,
                        })?;
                    let element = access.index.map_or(0, |index| self.get(index));
                    let value = self.access(variable.set, variable.binding, element, access.op)?;

                    if let Some(result) = access.result {
                        self.set(result, value);
                    }
                }
                Instruction::Output { value } => self.output.push(self.get(value)),
                Instruction::ValidateDescriptor {
                    result,
                    set,
                    binding,
                    index,
                    location,
                } => {
                    let element = index.map_or(0, |index| self.get(index));
                    let valid = self.validate_descriptor(set, binding, element, location);
                    self.set(result, valid as u32);
                }
            }
        }

        Ok(())
    }

    /// The device-side validation routine.
    fn validate_descriptor(&self, set: u32, binding: u32, element: u32, location: u32) -> bool {
        let Some((words, region)) = self.ctx.snapshot else {
            return true;
        };

        let kind = match snapshot::lookup(words, region, set, binding, element) {
            // Unbound sets are reported when the command is recorded.
            SnapshotLookup::SetUnbound | SnapshotLookup::BindingAbsent => return false,
            SnapshotLookup::SetDisturbed => ViolationKind::StaleBindingAfterIncompatibleRebind,
            SnapshotLookup::OutOfBounds { .. } => ViolationKind::OutOfBoundsIndex,
            SnapshotLookup::Element(DescriptorValidity::Valid) => return true,
            SnapshotLookup::Element(DescriptorValidity::Null) => {
                if snapshot::null_descriptor_enabled(words, region) {
                    return true;
                }

                ViolationKind::NullDescriptorUse
            }
            SnapshotLookup::Element(DescriptorValidity::Unwritten) => {
                ViolationKind::UnwrittenDescriptor
            }
            SnapshotLookup::Element(DescriptorValidity::Destroyed) => {
                ViolationKind::DestroyedUnderlyingResource
            }
        };

        self.ctx.channel.report(&ErrorRecord::new(
            kind,
            self.ctx.command_index,
            self.shader.stage(),
            set,
            binding,
            element,
            location,
        ));

        false
    }

    /// Performs an access against the live descriptor state.
    fn access(
        &mut self,
        set: u32,
        binding: u32,
        element: u32,
        op: AccessOp,
    ) -> Result<u32, ExecutionError> {
        let stage = self.shader.stage();
        let fault = |cause| ExecutionError::DeviceFault {
            stage,
            set,
            binding,
            element,
            cause,
        };

        let descriptor_sets = self.ctx.descriptor_sets;
        let Some(descriptor_set) = descriptor_sets.get(set as usize).and_then(Option::as_ref) else {
            return Err(fault(FaultCause::SetNotBound));
        };

        let (validity, resource) = {
            let resources = descriptor_set.resources();
            let binding_resources = resources
                .binding(binding)
                .ok_or_else(|| fault(FaultCause::BindingAbsent))?;
            let element_count = binding_resources.validity().len() as u32;

            if element >= element_count {
                return Err(fault(FaultCause::OutOfBounds { element_count }));
            }

            (
                binding_resources.validity()[element as usize],
                binding_resources.resources()[element as usize],
            )
        };

        let cell = match validity {
            DescriptorValidity::Valid => match resource {
                Some(resource) => MemoryCell::Resource(resource),
                None => MemoryCell::Anonymous {
                    descriptor_set: descriptor_set.id(),
                    binding,
                    element,
                },
            },
            DescriptorValidity::Null if self.ctx.null_descriptor => return Ok(0),
            validity => return Err(fault(FaultCause::InvalidDescriptor(validity))),
        };

        let value = match op {
            AccessOp::Sample | AccessOp::Fetch | AccessOp::Load => self.ctx.memory.read(cell),
            AccessOp::Store(value) => {
                let value = self.get(value);
                self.ctx.memory.write(cell, value);

                0
            }
            AccessOp::AtomicAdd(value) => {
                let value = self.get(value);
                let old = self.ctx.memory.read(cell);
                self.ctx.memory.write(cell, old.wrapping_add(value));

                old
            }
        };

        Ok(value)
    }
}

/// The contents of the resources that descriptors refer to.
///
/// Every resource holds a single word. A resource that was never stored to holds the lower 32
/// bits of its id. A descriptor that was made valid without naming a resource refers to a word
/// of its own, which initially holds the element index plus one.
#[derive(Debug, Default)]
pub struct DeviceMemory {
    cells: HashMap<MemoryCell, u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum MemoryCell {
    Resource(ResourceId),
    Anonymous {
        descriptor_set: NonZero<u64>,
        binding: u32,
        element: u32,
    },
}

impl DeviceMemory {
    /// Creates an empty `DeviceMemory`.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the word held by `resource`.
    #[inline]
    pub fn resource(&self, resource: ResourceId) -> u32 {
        self.read(MemoryCell::Resource(resource))
    }

    fn read(&self, cell: MemoryCell) -> u32 {
        self.cells.get(&cell).copied().unwrap_or(match cell {
            MemoryCell::Resource(resource) => resource.as_raw() as u32,
            MemoryCell::Anonymous { element, .. } => element.wrapping_add(1),
        })
    }

    fn write(&mut self, cell: MemoryCell, value: u32) {
        self.cells.insert(cell, value);
    }
}

/// Why an access faulted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultCause {
    /// No descriptor set is visible at the set number.
    SetNotBound,

    /// The descriptor set has no such binding.
    BindingAbsent,

    /// The element is not less than the number of elements of the binding.
    OutOfBounds { element_count: u32 },

    /// The element is not valid.
    InvalidDescriptor(DescriptorValidity),
}

/// Error that can happen when executing a shader.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecutionError {
    /// A shader performed an access to a descriptor that is not valid.
    DeviceFault {
        stage: ShaderStage,
        set: u32,
        binding: u32,
        element: u32,
        cause: FaultCause,
    },

    /// A shader read a word of push constants past the end of the push constants.
    PushConstantOutOfRange { offset: u32, size: u32 },

    /// A shader accessed a variable that its module does not declare.
    UndeclaredVariable { variable: VariableId },
}

impl Error for ExecutionError {}

impl Display for ExecutionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            Self::DeviceFault {
                stage,
                set,
                binding,
                element,
                cause,
            } => {
                write!(
                    f,
                    "the {:?} shader faulted while accessing set {}, binding {}, element {}: ",
                    stage, set, binding, element,
                )?;

                match cause {
                    FaultCause::SetNotBound => write!(f, "no descriptor set is bound"),
                    FaultCause::BindingAbsent => write!(f, "the binding does not exist"),
                    FaultCause::OutOfBounds { element_count } => {
                        write!(f, "the binding only has {} elements", element_count)
                    }
                    FaultCause::InvalidDescriptor(validity) => {
                        write!(f, "the descriptor is {:?}", validity)
                    }
                }
            }
            Self::PushConstantOutOfRange { offset, size } => write!(
                f,
                "a shader read push constants at offset {}, but only {} bytes were pushed",
                offset, size,
            ),
            Self::UndeclaredVariable { variable } => {
                write!(f, "a shader accessed {}, which is not declared", variable)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{execute, DeviceMemory, ExecutionContext, ExecutionError, FaultCause};
    use crate::{
        descriptor_set::{
            layout::{
                DescriptorSetLayout, DescriptorSetLayoutBinding, DescriptorSetLayoutCreateInfo,
                DescriptorType,
            },
            DescriptorSet, DescriptorValidity, ResourceId, WriteDescriptorSet,
        },
        device::{Device, DeviceOwned},
        error_channel::{ErrorChannel, ViolationKind},
        shader::{
            instrument::SINK_VALUE, Access, AccessOp, DescriptorArray, DescriptorVariable, Id,
            Instruction, InstrumentedShader, ShaderModule, ShaderModuleCreateInfo, ShaderStage,
            VariableId,
        },
        snapshot::{BindingSnapshot, BoundSetSnapshot, SetSnapshot, SnapshotArena},
    };
    use std::sync::Arc;

    fn descriptor_set(device: &Arc<Device>, count: u32) -> Arc<DescriptorSet> {
        let layout = DescriptorSetLayout::new(
            device.clone(),
            DescriptorSetLayoutCreateInfo {
                bindings: [(
                    0,
                    DescriptorSetLayoutBinding {
                        descriptor_count: count,
                        ..DescriptorSetLayoutBinding::descriptor_type(DescriptorType::StorageBuffer)
                    },
                )]
                .into(),
                ..Default::default()
            },
        )
        .unwrap();

        DescriptorSet::new(layout, 0).unwrap()
    }

    fn resources(raw: impl IntoIterator<Item = u64>) -> Vec<ResourceId> {
        raw.into_iter()
            .map(|raw| ResourceId::from_raw(raw).unwrap())
            .collect()
    }

    /// `Output(buffers[invocation_index].op)`
    fn indexed_module(device: &Arc<Device>, op: AccessOp) -> Arc<ShaderModule> {
        ShaderModule::new(
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
                    Instruction::Access(Access {
                        result: Some(Id(2)),
                        variable: VariableId(0),
                        index: Some(Id(0)),
                        op,
                    }),
                    Instruction::Output { value: Id(2) },
                ],
                ..ShaderModuleCreateInfo::stage(ShaderStage::Compute)
            },
        )
        .unwrap()
    }

    struct Harness {
        set: Arc<DescriptorSet>,
        arena: SnapshotArena,
        region: u32,
        channel: ErrorChannel,
        memory: DeviceMemory,
    }

    impl Harness {
        fn new(set: Arc<DescriptorSet>, sets: Vec<SetSnapshot>, null_descriptor: bool) -> Self {
            let mut arena = SnapshotArena::new(64);
            let region = BindingSnapshot {
                null_descriptor,
                sets,
            }
            .encode(&mut arena);

            Harness {
                set,
                arena,
                region,
                channel: ErrorChannel::new(16),
                memory: DeviceMemory::new(),
            }
        }

        fn bound(set: Arc<DescriptorSet>) -> Self {
            let sets = vec![SetSnapshot::Bound(BoundSetSnapshot::capture(&set, [0]))];
            let null_descriptor = set.layout().device().enabled_features().null_descriptor;

            Self::new(set, sets, null_descriptor)
        }

        fn run(
            &mut self,
            shader: &InstrumentedShader,
            invocations: u32,
        ) -> Result<Vec<u32>, ExecutionError> {
            let descriptor_sets = [Some(self.set.clone())];

            execute(
                shader,
                invocations,
                &mut ExecutionContext {
                    snapshot: Some((self.arena.words(), self.region)),
                    descriptor_sets: &descriptor_sets,
                    push_constants: &[],
                    channel: &self.channel,
                    memory: &mut self.memory,
                    command_index: 7,
                    null_descriptor: self
                        .set
                        .layout()
                        .device()
                        .enabled_features()
                        .null_descriptor,
                },
            )
        }
    }

    #[test]
    fn valid_path_unchanged() {
        let device = test_device!();
        let set = descriptor_set(&device, 4);
        set.write(&WriteDescriptorSet::resource_array(
            0,
            0,
            resources([10, 11, 12, 13]),
        ))
        .unwrap();

        let module = indexed_module(&device, AccessOp::Load);
        let instrumented = device
            .instrument_shader(&module, &[set.layout().clone()])
            .unwrap();
        let original = InstrumentedShader::passthrough(module);

        let mut harness = Harness::bound(set);
        assert_eq!(harness.run(&instrumented, 4).unwrap(), [10, 11, 12, 13]);
        assert_eq!(harness.run(&original, 4).unwrap(), [10, 11, 12, 13]);
        assert!(harness.channel.drain().is_empty());
    }

    #[test]
    fn out_of_bounds_is_reported_and_sunk() {
        let device = test_device!();
        let set = descriptor_set(&device, 4);
        set.write(&WriteDescriptorSet::resource_array(
            0,
            0,
            resources([10, 11, 12, 13]),
        ))
        .unwrap();

        let module = indexed_module(&device, AccessOp::Load);
        let instrumented = device
            .instrument_shader(&module, &[set.layout().clone()])
            .unwrap();

        let mut harness = Harness::bound(set);
        assert_eq!(
            harness.run(&instrumented, 6).unwrap(),
            [10, 11, 12, 13, SINK_VALUE, SINK_VALUE],
        );

        let records = harness.channel.drain();
        assert_eq!(records.len(), 2);

        for (record, element) in records.iter().zip([4, 5]) {
            assert_eq!(record.violation_kind(), Some(ViolationKind::OutOfBoundsIndex));
            assert_eq!(record.command_index(), 7);
            assert_eq!(record.shader_stage(), Some(ShaderStage::Compute));
            assert_eq!((record.set, record.binding, record.element), (0, 0, element));
            assert_eq!(record.location(), 0);
        }

        // Without instrumentation, the same access brings the device down.
        let original = InstrumentedShader::passthrough(instrumented.module().clone());
        assert_eq!(
            harness.run(&original, 6),
            Err(ExecutionError::DeviceFault {
                stage: ShaderStage::Compute,
                set: 0,
                binding: 0,
                element: 4,
                cause: FaultCause::OutOfBounds { element_count: 4 },
            }),
        );
    }

    #[test]
    fn element_states() {
        let device = test_device!();
        let set = descriptor_set(&device, 3);
        set.write(&WriteDescriptorSet::resource_array(
            0,
            0,
            resources([20, 21]),
        ))
        .unwrap();
        device.destroy_resource(ResourceId::from_raw(21).unwrap());

        let module = indexed_module(&device, AccessOp::Load);
        let instrumented = device
            .instrument_shader(&module, &[set.layout().clone()])
            .unwrap();

        let mut harness = Harness::bound(set);
        assert_eq!(harness.run(&instrumented, 3).unwrap(), [20, 0, 0]);

        let kinds: Vec<_> = harness
            .channel
            .drain()
            .iter()
            .map(|record| (record.element, record.violation_kind()))
            .collect();
        assert_eq!(
            kinds,
            [
                (1, Some(ViolationKind::DestroyedUnderlyingResource)),
                (2, Some(ViolationKind::UnwrittenDescriptor)),
            ],
        );
    }

    #[test]
    fn null_descriptors() {
        let device = test_device!(null_descriptor);
        let set = descriptor_set(&device, 2);
        set.write(&WriteDescriptorSet::resource(0, resources([5])[0]))
            .unwrap();
        set.write(&WriteDescriptorSet::null_array(0, 1, 1)).unwrap();

        let module = indexed_module(&device, AccessOp::Load);
        let instrumented = device
            .instrument_shader(&module, &[set.layout().clone()])
            .unwrap();

        let mut harness = Harness::bound(set.clone());
        assert_eq!(harness.run(&instrumented, 2).unwrap(), [5, 0]);
        assert!(harness.channel.drain().is_empty());

        // The same state, in a snapshot that was taken without the feature.
        let sets = vec![SetSnapshot::Bound(BoundSetSnapshot::capture(&set, [0]))];
        let mut harness = Harness::new(set, sets, false);
        assert_eq!(harness.run(&instrumented, 2).unwrap(), [5, 0]);
        let records = harness.channel.drain();
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].violation_kind(),
            Some(ViolationKind::NullDescriptorUse),
        );
    }

    #[test]
    fn disturbed_set() {
        let device = test_device!();
        let set = descriptor_set(&device, 1);
        set.write_update(0, 0..1, DescriptorValidity::Valid).unwrap();

        let module = indexed_module(&device, AccessOp::Load);
        let instrumented = device
            .instrument_shader(&module, &[set.layout().clone()])
            .unwrap();

        let mut harness = Harness::new(set, vec![SetSnapshot::Disturbed], false);
        assert_eq!(harness.run(&instrumented, 1).unwrap(), [SINK_VALUE]);
        let records = harness.channel.drain();
        assert_eq!(
            records[0].violation_kind(),
            Some(ViolationKind::StaleBindingAfterIncompatibleRebind),
        );

        // Unbound sets are not reported by the device.
        let mut harness = Harness::new(harness.set.clone(), vec![SetSnapshot::Unbound], false);
        assert_eq!(harness.run(&instrumented, 1).unwrap(), [SINK_VALUE]);
        assert!(harness.channel.drain().is_empty());
    }

    #[test]
    fn atomics_and_stores() {
        let device = test_device!();
        let set = descriptor_set(&device, 1);
        set.write(&WriteDescriptorSet::resource(0, resources([100])[0]))
            .unwrap();

        // `Output(buffer.atomic_add(1))`
        let module = ShaderModule::new(
            device.clone(),
            ShaderModuleCreateInfo {
                variables: vec![DescriptorVariable {
                    id: VariableId(0),
                    set: 0,
                    binding: 0,
                    descriptor_type: DescriptorType::StorageBuffer,
                    array: DescriptorArray::None,
                }],
                instructions: vec![
                    Instruction::Constant {
                        result: Id(0),
                        value: 1,
                    },
                    Instruction::Access(Access {
                        result: Some(Id(1)),
                        variable: VariableId(0),
                        index: None,
                        op: AccessOp::AtomicAdd(Id(0)),
                    }),
                    Instruction::Output { value: Id(1) },
                ],
                ..ShaderModuleCreateInfo::stage(ShaderStage::Compute)
            },
        )
        .unwrap();
        let instrumented = device
            .instrument_shader(&module, &[set.layout().clone()])
            .unwrap();

        let mut harness = Harness::bound(set);
        assert_eq!(harness.run(&instrumented, 3).unwrap(), [100, 101, 102]);
        assert_eq!(harness.memory.resource(resources([100])[0]), 103);
    }

    #[test]
    fn push_constants() {
        let device = test_device!();
        let module = ShaderModule::new(
            device.clone(),
            ShaderModuleCreateInfo {
                instructions: vec![
                    Instruction::LoadPushConstant {
                        result: Id(0),
                        offset: 4,
                    },
                    Instruction::Output { value: Id(0) },
                ],
                ..ShaderModuleCreateInfo::stage(ShaderStage::Vertex)
            },
        )
        .unwrap();
        let shader = InstrumentedShader::passthrough(module);
        let channel = ErrorChannel::new(1);
        let mut memory = DeviceMemory::new();

        let mut run = |push_constants: &[u8]| {
            execute(
                &shader,
                1,
                &mut ExecutionContext {
                    snapshot: None,
                    descriptor_sets: &[],
                    push_constants,
                    channel: &channel,
                    memory: &mut memory,
                    command_index: 0,
                    null_descriptor: false,
                },
            )
        };

        let mut data = [0u8; 8];
        data[4..].copy_from_slice(&42u32.to_ne_bytes());
        assert_eq!(run(&data), Ok(vec![42]));
        assert_eq!(
            run(&data[..6]),
            Err(ExecutionError::PushConstantOutOfRange { offset: 4, size: 6 }),
        );
    }
}

//! The shader programs that pipelines execute, and their instrumented form.
//!
//! Shaders are represented by a small structured intermediate representation. A module declares
//! its descriptor [`DescriptorVariable`]s up front, and its body is a list of [`Instruction`]s
//! that operate on 32-bit registers, identified by [`Id`]s. Control flow is structured: the only
//! branching construct is [`Instruction::Selection`], which executes one of two nested blocks.
//!
//! A register may be assigned more than once, including in both blocks of a selection. Reading a
//! register that was never assigned in the current invocation yields `0`.
//!
//! Before a module is used in a pipeline, it is instrumented for the descriptor set layouts of the
//! pipeline, see [`Device::instrument_shader`](crate::device::Device::instrument_shader).

use crate::{
    descriptor_set::layout::DescriptorType,
    device::{Device, DeviceOwned},
    macros::{impl_id_counter, vulkan_bitflags, vulkan_enum},
    ValidationError,
};
use foldhash::{HashMap, HashSet};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{Display, Error as FmtError, Formatter},
    num::NonZero,
    sync::Arc,
};

pub mod instrument;
pub mod interpreter;

/// A shader program, before instrumentation.
#[derive(Debug)]
pub struct ShaderModule {
    device: Arc<Device>,
    id: NonZero<u64>,

    stage: ShaderStage,
    local_size: [u32; 3],
    variables: Vec<DescriptorVariable>,
    instructions: Vec<Instruction>,

    variable_indices: HashMap<VariableId, usize>,
    register_count: u32,
}

impl ShaderModule {
    /// Creates a new `ShaderModule`, checking that it is well-formed.
    ///
    /// A module is well-formed if every register it reads has been assigned earlier in the
    /// module, its variables have distinct ids, and it does not contain any
    /// [`Instruction::ValidateDescriptor`].
    pub fn new(
        device: Arc<Device>,
        create_info: ShaderModuleCreateInfo,
    ) -> Result<Arc<ShaderModule>, Box<ValidationError>> {
        let register_count = create_info
            .validate()
            .map_err(|err| err.add_context("create_info"))?;

        let ShaderModuleCreateInfo {
            stage,
            local_size,
            variables,
            instructions,
            _ne: _,
        } = create_info;

        let variable_indices = variables
            .iter()
            .enumerate()
            .map(|(index, variable)| (variable.id, index))
            .collect();

        Ok(Arc::new(ShaderModule {
            device,
            id: Self::next_id(),
            stage,
            local_size,
            variables,
            instructions,
            variable_indices,
            register_count,
        }))
    }

    /// Returns the stage of the shader.
    #[inline]
    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    /// Returns the number of invocations in a workgroup, for compute shaders.
    #[inline]
    pub fn local_size(&self) -> [u32; 3] {
        self.local_size
    }

    /// Returns the descriptor variables that the module declares.
    #[inline]
    pub fn variables(&self) -> &[DescriptorVariable] {
        &self.variables
    }

    /// Returns the variable with the given id, if the module declares it.
    #[inline]
    pub fn variable(&self, id: VariableId) -> Option<&DescriptorVariable> {
        self.variable_indices
            .get(&id)
            .map(|&index| &self.variables[index])
    }

    /// Returns the body of the module.
    #[inline]
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Returns one more than the highest register id that the module uses.
    #[inline]
    pub fn register_count(&self) -> u32 {
        self.register_count
    }

    /// Returns the `(set, binding)` pairs that the module accesses through a declared variable.
    pub fn descriptor_uses(&self) -> BTreeSet<(u32, u32)> {
        let mut uses = BTreeSet::new();
        for_each_access(&self.instructions, &mut |access| {
            if let Some(variable) = self.variable(access.variable) {
                uses.insert((variable.set, variable.binding));
            }
        });

        uses
    }
}

unsafe impl DeviceOwned for ShaderModule {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl_id_counter!(ShaderModule);

/// Parameters to create a new `ShaderModule`.
#[derive(Clone, Debug)]
pub struct ShaderModuleCreateInfo {
    /// The stage that the shader is written for.
    ///
    /// There is no default value.
    pub stage: ShaderStage,

    /// The number of invocations in a workgroup. Only used for compute shaders, where each
    /// element must not be zero.
    ///
    /// The default value is `[1, 1, 1]`.
    pub local_size: [u32; 3],

    /// The descriptor variables that the shader declares.
    ///
    /// The default value is empty.
    pub variables: Vec<DescriptorVariable>,

    /// The body of the shader.
    ///
    /// The default value is empty.
    pub instructions: Vec<Instruction>,

    pub _ne: crate::NonExhaustive,
}

impl ShaderModuleCreateInfo {
    /// Returns a `ShaderModuleCreateInfo` with the specified `stage`.
    #[inline]
    pub fn stage(stage: ShaderStage) -> Self {
        Self {
            stage,
            local_size: [1; 3],
            variables: Vec::new(),
            instructions: Vec::new(),
            _ne: crate::NonExhaustive(()),
        }
    }

    /// Validates the create info, and returns the number of registers that the body uses.
    pub(crate) fn validate(&self) -> Result<u32, Box<ValidationError>> {
        let &Self {
            stage,
            local_size,
            ref variables,
            ref instructions,
            _ne: _,
        } = self;

        if stage == ShaderStage::Compute && local_size.contains(&0) {
            return Err(Box::new(ValidationError {
                context: "local_size".into(),
                problem: "contains zero".into(),
                vuids: &["VUID-RuntimeSpirv-x-06429"],
                ..Default::default()
            }));
        }

        let mut variable_ids = HashSet::default();

        for (index, variable) in variables.iter().enumerate() {
            if !variable_ids.insert(variable.id) {
                return Err(Box::new(ValidationError {
                    context: format!("variables[{}].id", index).into(),
                    problem: "is not unique".into(),
                    ..Default::default()
                }));
            }

            if variable.array == DescriptorArray::Sized(0) {
                return Err(Box::new(ValidationError {
                    context: format!("variables[{}].array", index).into(),
                    problem: "is a sized array of zero elements".into(),
                    ..Default::default()
                }));
            }
        }

        let mut defined = HashSet::default();
        let mut register_count = 0;
        check_block(instructions, "instructions", &mut defined, &mut register_count)?;

        Ok(register_count)
    }
}

fn check_block(
    instructions: &[Instruction],
    path: &str,
    defined: &mut HashSet<Id>,
    register_count: &mut u32,
) -> Result<(), Box<ValidationError>> {
    for (index, instruction) in instructions.iter().enumerate() {
        let mut result = Ok(());
        instruction.for_each_operand(|operand| {
            *register_count = (*register_count).max(operand.0 + 1);

            if result.is_ok() && !defined.contains(&operand) {
                result = Err(Box::new(ValidationError {
                    context: format!("{}[{}]", path, index).into(),
                    problem: format!("reads {}, which has not been assigned before", operand)
                        .into(),
                    ..Default::default()
                }));
            }
        });
        result?;

        match instruction {
            Instruction::Selection { accept, reject, .. } => {
                check_block(
                    accept,
                    &format!("{}[{}].accept", path, index),
                    defined,
                    register_count,
                )?;
                check_block(
                    reject,
                    &format!("{}[{}].reject", path, index),
                    defined,
                    register_count,
                )?;
            }
            Instruction::ValidateDescriptor { .. } => {
                return Err(Box::new(ValidationError {
                    context: format!("{}[{}]", path, index).into(),
                    problem: "is a `ValidateDescriptor` instruction, which can only be added by \
                        instrumentation"
                        .into(),
                    ..Default::default()
                }));
            }
            _ => (),
        }

        if let Some(result) = instruction.result() {
            *register_count = (*register_count).max(result.0 + 1);
            defined.insert(result);
        }
    }

    Ok(())
}

/// Calls `f` for every access in `instructions`, including those in nested blocks, in program
/// order.
pub(crate) fn for_each_access<'a>(instructions: &'a [Instruction], f: &mut impl FnMut(&'a Access)) {
    for instruction in instructions {
        match instruction {
            Instruction::Access(access) => f(access),
            Instruction::Selection { accept, reject, .. } => {
                for_each_access(accept, f);
                for_each_access(reject, f);
            }
            _ => (),
        }
    }
}

/// Identifies a register.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id(pub u32);

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(f, "%{}", self.0)
    }
}

/// Identifies a descriptor variable within a module.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VariableId(pub u32);

impl Display for VariableId {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(f, "variable {}", self.0)
    }
}

/// A descriptor variable declared by a shader.
///
/// Several variables may be decorated with the same set and binding. They then alias the same
/// descriptors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorVariable {
    pub id: VariableId,
    pub set: u32,
    pub binding: u32,
    pub descriptor_type: DescriptorType,
    pub array: DescriptorArray,
}

/// Whether a descriptor variable is an array, and of how many elements.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorArray {
    /// The variable is a single descriptor.
    None,

    /// The variable is an array with a size that is known when the shader is compiled.
    Sized(u32),

    /// The variable is an array whose size is only known at runtime.
    Runtime,
}

/// An instruction of a shader module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Instruction {
    /// `result = value`
    Constant { result: Id, value: u32 },

    /// `result` = the index of the current invocation within the command.
    InvocationIndex { result: Id },

    /// `result` = the 32-bit word at byte `offset` of the push constants.
    LoadPushConstant { result: Id, offset: u32 },

    /// `result = lhs op rhs`, with wrapping integer arithmetic.
    Binary {
        result: Id,
        op: BinaryOp,
        lhs: Id,
        rhs: Id,
    },

    /// `result = !operand`, where any nonzero value is true.
    LogicalNot { result: Id, operand: Id },

    /// `result = operand`, marking the value as not uniform across invocations.
    NonUniform { result: Id, operand: Id },

    /// `result = condition ? accept : reject`
    Select {
        result: Id,
        condition: Id,
        accept: Id,
        reject: Id,
    },

    /// Executes `accept` if `condition` is nonzero, `reject` otherwise.
    Selection {
        condition: Id,
        accept: Vec<Instruction>,
        reject: Vec<Instruction>,
    },

    /// Accesses a descriptor.
    Access(Access),

    /// Appends `value` to the output of the invocation.
    Output { value: Id },

    /// Checks the descriptor at `index` of `(set, binding)` against the binding snapshot of the
    /// current command, reports a violation if it is not valid, and writes whether it is valid
    /// to `result`.
    ///
    /// Only instrumentation adds this instruction.
    ValidateDescriptor {
        result: Id,
        set: u32,
        binding: u32,
        index: Option<Id>,
        location: u32,
    },
}

impl Instruction {
    /// Returns the register that the instruction writes to, if any.
    pub fn result(&self) -> Option<Id> {
        match *self {
            Instruction::Constant { result, .. }
            | Instruction::InvocationIndex { result }
            | Instruction::LoadPushConstant { result, .. }
            | Instruction::Binary { result, .. }
            | Instruction::LogicalNot { result, .. }
            | Instruction::NonUniform { result, .. }
            | Instruction::Select { result, .. }
            | Instruction::ValidateDescriptor { result, .. } => Some(result),
            Instruction::Access(ref access) => access.result,
            Instruction::Selection { .. } | Instruction::Output { .. } => None,
        }
    }

    /// Calls `f` for every register that the instruction itself reads. Nested blocks are not
    /// visited.
    pub fn for_each_operand(&self, mut f: impl FnMut(Id)) {
        match *self {
            Instruction::Constant { .. }
            | Instruction::InvocationIndex { .. }
            | Instruction::LoadPushConstant { .. } => (),
            Instruction::Binary { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            Instruction::LogicalNot { operand, .. } | Instruction::NonUniform { operand, .. } => {
                f(operand)
            }
            Instruction::Select {
                condition,
                accept,
                reject,
                ..
            } => {
                f(condition);
                f(accept);
                f(reject);
            }
            Instruction::Selection { condition, .. } => f(condition),
            Instruction::Access(ref access) => {
                if let Some(index) = access.index {
                    f(index);
                }

                if let Some(value) = access.op.value() {
                    f(value);
                }
            }
            Instruction::Output { value } => f(value),
            Instruction::ValidateDescriptor { index, .. } => {
                if let Some(index) = index {
                    f(index);
                }
            }
        }
    }
}

/// The operation of an [`Instruction::Binary`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    IAdd,
    ISub,
    IMul,
    /// Unsigned remainder. The remainder of a division by zero is `0`.
    URem,
    ULessThan,
    IEqual,
    LogicalAnd,
    LogicalOr,
}

impl BinaryOp {
    /// Applies the operation.
    #[inline]
    pub fn apply(self, lhs: u32, rhs: u32) -> u32 {
        match self {
            BinaryOp::IAdd => lhs.wrapping_add(rhs),
            BinaryOp::ISub => lhs.wrapping_sub(rhs),
            BinaryOp::IMul => lhs.wrapping_mul(rhs),
            BinaryOp::URem => lhs.checked_rem(rhs).unwrap_or(0),
            BinaryOp::ULessThan => (lhs < rhs) as u32,
            BinaryOp::IEqual => (lhs == rhs) as u32,
            BinaryOp::LogicalAnd => (lhs != 0 && rhs != 0) as u32,
            BinaryOp::LogicalOr => (lhs != 0 || rhs != 0) as u32,
        }
    }
}

/// An access to a descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Access {
    /// The register that receives the value that was read, if the operation reads.
    pub result: Option<Id>,

    /// The variable that is accessed.
    pub variable: VariableId,

    /// The array element that is accessed. Must be `None` for variables that are not arrays,
    /// and `Some` for arrays.
    pub index: Option<Id>,

    /// What is done with the descriptor.
    pub op: AccessOp,
}

/// What an [`Access`] does with the descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessOp {
    /// Samples an image through a sampler.
    Sample,

    /// Reads a texel of an image or texel buffer, without a sampler.
    Fetch,

    /// Reads from a buffer.
    Load,

    /// Writes the value to a storage resource.
    Store(Id),

    /// Atomically adds the value to a storage resource, returning the previous value.
    AtomicAdd(Id),
}

impl AccessOp {
    /// Returns the register that the operation writes to the resource, if any.
    #[inline]
    pub fn value(self) -> Option<Id> {
        match self {
            AccessOp::Sample | AccessOp::Fetch | AccessOp::Load => None,
            AccessOp::Store(value) | AccessOp::AtomicAdd(value) => Some(value),
        }
    }

    /// Returns the name of the operation.
    #[inline]
    pub fn name(self) -> &'static str {
        match self {
            AccessOp::Sample => "Sample",
            AccessOp::Fetch => "Fetch",
            AccessOp::Load => "Load",
            AccessOp::Store(_) => "Store",
            AccessOp::AtomicAdd(_) => "AtomicAdd",
        }
    }

    /// Returns whether the operation can be performed on a descriptor of the given type.
    pub fn is_supported_by(self, descriptor_type: DescriptorType) -> bool {
        match self {
            AccessOp::Sample => matches!(
                descriptor_type,
                DescriptorType::CombinedImageSampler | DescriptorType::SampledImage
            ),
            AccessOp::Fetch => matches!(
                descriptor_type,
                DescriptorType::CombinedImageSampler
                    | DescriptorType::SampledImage
                    | DescriptorType::StorageImage
                    | DescriptorType::UniformTexelBuffer
                    | DescriptorType::StorageTexelBuffer
                    | DescriptorType::InputAttachment
            ),
            AccessOp::Load => matches!(
                descriptor_type,
                DescriptorType::UniformBuffer
                    | DescriptorType::StorageBuffer
                    | DescriptorType::UniformBufferDynamic
                    | DescriptorType::StorageBufferDynamic
                    | DescriptorType::InlineUniformBlock
                    | DescriptorType::StorageImage
                    | DescriptorType::AccelerationStructure
            ),
            AccessOp::Store(_) | AccessOp::AtomicAdd(_) => descriptor_type.is_writable(),
        }
    }
}

/// A shader module, together with the instrumentation that validates its descriptor accesses.
#[derive(Debug)]
pub struct InstrumentedShader {
    module: Arc<ShaderModule>,
    instructions: Vec<Instruction>,
    register_count: u32,
    locations: Vec<SourceLocation>,
    validated_bindings: BTreeMap<(u32, u32), DescriptorType>,
    instrumented: bool,
}

impl InstrumentedShader {
    pub(crate) fn new(
        module: Arc<ShaderModule>,
        instructions: Vec<Instruction>,
        register_count: u32,
        locations: Vec<SourceLocation>,
        validated_bindings: BTreeMap<(u32, u32), DescriptorType>,
    ) -> Self {
        InstrumentedShader {
            module,
            instructions,
            register_count,
            locations,
            validated_bindings,
            instrumented: true,
        }
    }

    /// Wraps `module` without instrumenting it.
    pub(crate) fn passthrough(module: Arc<ShaderModule>) -> Self {
        InstrumentedShader {
            instructions: module.instructions.clone(),
            register_count: module.register_count,
            locations: Vec::new(),
            validated_bindings: BTreeMap::new(),
            instrumented: false,
            module,
        }
    }

    /// Returns the module that was instrumented.
    #[inline]
    pub fn module(&self) -> &Arc<ShaderModule> {
        &self.module
    }

    /// Returns the stage of the shader.
    #[inline]
    pub fn stage(&self) -> ShaderStage {
        self.module.stage
    }

    /// Returns the instrumented body.
    #[inline]
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Returns one more than the highest register id that the instrumented body uses.
    #[inline]
    pub fn register_count(&self) -> u32 {
        self.register_count
    }

    /// Returns whether the body was instrumented, or is a copy of the original module.
    #[inline]
    pub fn is_instrumented(&self) -> bool {
        self.instrumented
    }

    /// Returns the source locations of the validated accesses, indexed by location id.
    #[inline]
    pub fn locations(&self) -> &[SourceLocation] {
        &self.locations
    }

    /// Returns the source location with the given id.
    #[inline]
    pub fn location(&self, location: u32) -> Option<&SourceLocation> {
        self.locations.get(location as usize)
    }

    /// Returns the bindings whose accesses are validated, and their descriptor types.
    #[inline]
    pub fn validated_bindings(&self) -> &BTreeMap<(u32, u32), DescriptorType> {
        &self.validated_bindings
    }
}

/// Identifies a descriptor access in the source of a shader module.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourceLocation {
    /// The ordinal of the access among all accesses of the module, in program order.
    pub access_index: u32,
    pub variable: VariableId,
    pub set: u32,
    pub binding: u32,
    pub op: AccessOp,
}

impl Display for SourceLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(
            f,
            "access #{} ({}) through {} (set {}, binding {})",
            self.access_index,
            self.op.name(),
            self.variable,
            self.set,
            self.binding,
        )
    }
}

vulkan_bitflags! {
    /// A set of [`ShaderStage`] values.
    ShaderStages impl {
        /// Creates a `ShaderStages` struct with all graphics stages set to `true`.
        #[inline]
        pub const fn all_graphics() -> ShaderStages {
            ShaderStages::VERTEX
                .union(ShaderStages::TESSELLATION_CONTROL)
                .union(ShaderStages::TESSELLATION_EVALUATION)
                .union(ShaderStages::GEOMETRY)
                .union(ShaderStages::FRAGMENT)
        }

        /// Creates a `ShaderStages` struct with all ray tracing stages set to `true`.
        #[inline]
        pub const fn all_ray_tracing() -> ShaderStages {
            ShaderStages::RAYGEN
                .union(ShaderStages::ANY_HIT)
                .union(ShaderStages::CLOSEST_HIT)
                .union(ShaderStages::MISS)
                .union(ShaderStages::INTERSECTION)
                .union(ShaderStages::CALLABLE)
        }
    }
    = ShaderStageFlags(u32);

    VERTEX = VERTEX,
    TESSELLATION_CONTROL = TESSELLATION_CONTROL,
    TESSELLATION_EVALUATION = TESSELLATION_EVALUATION,
    GEOMETRY = GEOMETRY,
    FRAGMENT = FRAGMENT,
    COMPUTE = COMPUTE,
    RAYGEN = RAYGEN_KHR,
    ANY_HIT = ANY_HIT_KHR,
    CLOSEST_HIT = CLOSEST_HIT_KHR,
    MISS = MISS_KHR,
    INTERSECTION = INTERSECTION_KHR,
    CALLABLE = CALLABLE_KHR,
}

vulkan_enum! {
    /// A shader stage within a pipeline.
    ShaderStage = ShaderStageFlags(u32);

    Vertex = VERTEX,
    TessellationControl = TESSELLATION_CONTROL,
    TessellationEvaluation = TESSELLATION_EVALUATION,
    Geometry = GEOMETRY,
    Fragment = FRAGMENT,
    Compute = COMPUTE,
    Raygen = RAYGEN_KHR,
    AnyHit = ANY_HIT_KHR,
    ClosestHit = CLOSEST_HIT_KHR,
    Miss = MISS_KHR,
    Intersection = INTERSECTION_KHR,
    Callable = CALLABLE_KHR,
}

impl From<ShaderStage> for ShaderStages {
    #[inline]
    fn from(stage: ShaderStage) -> Self {
        Self::from_raw_truncate(stage as u32)
    }
}

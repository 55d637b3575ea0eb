//! Rewrites a shader module so that every descriptor access is validated before it happens.
//!
//! For each access through a variable whose binding is validated, the pass emits:
//!
//! ```text
//! %ok = ValidateDescriptor set, binding, index, location
//! Selection %ok {
//!     <the original access>
//! } else {
//!     <result of the access> = Constant 0
//! }
//! ```
//!
//! so that an invalid access is never performed, and the code that consumes its result sees `0`
//! instead. Accesses whose binding has `skip_validation` set, and accesses to inline uniform
//! blocks, which can't be indexed, are left as they are.

use super::{
    Access, DescriptorArray, Instruction, InstrumentedShader, ShaderModule, SourceLocation,
    VariableId,
};
use crate::descriptor_set::layout::{DescriptorSetLayout, DescriptorType};
use std::{
    collections::BTreeMap,
    error::Error,
    fmt::{Display, Error as FmtError, Formatter},
    sync::Arc,
};

/// The value that an access produces when the descriptor it accesses is not valid.
pub const SINK_VALUE: u32 = 0;

/// Instruments `module` for use with `set_layouts`, indexed by set number.
pub(crate) fn instrument(
    module: &Arc<ShaderModule>,
    set_layouts: &[Arc<DescriptorSetLayout>],
) -> Result<InstrumentedShader, InstrumentationError> {
    let mut pass = Pass {
        module,
        set_layouts,
        next_register: module.register_count(),
        access_count: 0,
        locations: Vec::new(),
        validated_bindings: BTreeMap::new(),
    };
    let instructions = pass.rewrite_block(module.instructions())?;

    tracing::debug!(
        module = module.id().get(),
        stage = ?module.stage(),
        accesses = pass.access_count,
        validated = pass.locations.len(),
        "instrumented shader module",
    );

    Ok(InstrumentedShader::new(
        module.clone(),
        instructions,
        pass.next_register,
        pass.locations,
        pass.validated_bindings,
    ))
}

struct Pass<'a> {
    module: &'a ShaderModule,
    set_layouts: &'a [Arc<DescriptorSetLayout>],
    next_register: u32,
    access_count: u32,
    locations: Vec<SourceLocation>,
    validated_bindings: BTreeMap<(u32, u32), DescriptorType>,
}

impl Pass<'_> {
    fn rewrite_block(
        &mut self,
        instructions: &[Instruction],
    ) -> Result<Vec<Instruction>, InstrumentationError> {
        let mut output = Vec::with_capacity(instructions.len());

        for instruction in instructions {
            match instruction {
                Instruction::Selection {
                    condition,
                    accept,
                    reject,
                } => output.push(Instruction::Selection {
                    condition: *condition,
                    accept: self.rewrite_block(accept)?,
                    reject: self.rewrite_block(reject)?,
                }),
                Instruction::Access(access) => self.rewrite_access(access, &mut output)?,
                _ => output.push(instruction.clone()),
            }
        }

        Ok(output)
    }

    fn rewrite_access(
        &mut self,
        access: &Access,
        output: &mut Vec<Instruction>,
    ) -> Result<(), InstrumentationError> {
        let access_index = self.access_count;
        self.access_count += 1;

        let variable = self
            .module
            .variable(access.variable)
            .ok_or(InstrumentationError::UndeclaredVariable {
                variable: access.variable,
            })?;
        let (set, binding) = (variable.set, variable.binding);

        let set_layout = self.set_layouts.get(set as usize).ok_or(
            InstrumentationError::SetNotInLayout {
                variable: variable.id,
                set,
            },
        )?;
        let layout_binding = set_layout
            .binding(binding)
            .ok_or(InstrumentationError::MissingBinding { set, binding })?;

        if variable.descriptor_type != layout_binding.descriptor_type {
            return Err(InstrumentationError::DescriptorTypeMismatch {
                set,
                binding,
                layout_type: layout_binding.descriptor_type,
                shader_type: variable.descriptor_type,
            });
        }

        match variable.array {
            DescriptorArray::Sized(array_size) if array_size > layout_binding.descriptor_count => {
                return Err(InstrumentationError::ArrayTooLarge {
                    set,
                    binding,
                    array_size,
                    descriptor_count: layout_binding.descriptor_count,
                });
            }
            DescriptorArray::None if access.index.is_some() => {
                return Err(InstrumentationError::IndexedNonArray {
                    variable: variable.id,
                });
            }
            DescriptorArray::Sized(_) | DescriptorArray::Runtime if access.index.is_none() => {
                return Err(InstrumentationError::MissingArrayIndex {
                    variable: variable.id,
                });
            }
            _ => (),
        }

        if !access.op.is_supported_by(variable.descriptor_type) {
            return Err(InstrumentationError::UnsupportedAccess {
                variable: variable.id,
                op: access.op.name(),
                descriptor_type: variable.descriptor_type,
            });
        }

        if layout_binding.skip_validation
            || layout_binding.descriptor_type == DescriptorType::InlineUniformBlock
        {
            output.push(Instruction::Access(*access));
            return Ok(());
        }

        let location = self.locations.len() as u32;
        self.locations.push(SourceLocation {
            access_index,
            variable: variable.id,
            set,
            binding,
            op: access.op,
        });
        self.validated_bindings
            .insert((set, binding), layout_binding.descriptor_type);

        let ok = super::Id(self.next_register);
        self.next_register += 1;

        output.push(Instruction::ValidateDescriptor {
            result: ok,
            set,
            binding,
            index: access.index,
            location,
        });
        output.push(Instruction::Selection {
            condition: ok,
            accept: vec![Instruction::Access(*access)],
            reject: access
                .result
                .map(|result| Instruction::Constant {
                    result,
                    value: SINK_VALUE,
                })
                .into_iter()
                .collect(),
        });

        Ok(())
    }
}

/// Error that can happen when instrumenting a shader module. The module can't be used with the
/// descriptor set layouts that it was instrumented for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InstrumentationError {
    /// An access goes through a variable that the module does not declare.
    UndeclaredVariable { variable: VariableId },

    /// A variable is decorated with a set number that is not in the pipeline layout.
    SetNotInLayout { variable: VariableId, set: u32 },

    /// A variable is decorated with a binding that the descriptor set layout does not have.
    MissingBinding { set: u32, binding: u32 },

    /// The descriptor type of a variable is not the type of its binding.
    DescriptorTypeMismatch {
        set: u32,
        binding: u32,
        layout_type: DescriptorType,
        shader_type: DescriptorType,
    },

    /// A variable is an array with more elements than its binding has descriptors.
    ArrayTooLarge {
        set: u32,
        binding: u32,
        array_size: u32,
        descriptor_count: u32,
    },

    /// An access provides an array index for a variable that is not an array.
    IndexedNonArray { variable: VariableId },

    /// An access does not provide an array index for a variable that is an array.
    MissingArrayIndex { variable: VariableId },

    /// The operation of an access can't be performed on the descriptor type of its variable.
    UnsupportedAccess {
        variable: VariableId,
        op: &'static str,
        descriptor_type: DescriptorType,
    },
}

impl Error for InstrumentationError {}

impl Display for InstrumentationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            Self::UndeclaredVariable { variable } => {
                write!(f, "an access goes through {}, which is not declared", variable)
            }
            Self::SetNotInLayout { variable, set } => write!(
                f,
                "{} uses descriptor set {}, which is not in the pipeline layout",
                variable, set,
            ),
            Self::MissingBinding { set, binding } => write!(
                f,
                "the descriptor set layout of set {} has no binding {}",
                set, binding,
            ),
            Self::DescriptorTypeMismatch {
                set,
                binding,
                layout_type,
                shader_type,
            } => write!(
                f,
                "the shader uses set {} binding {} as {:?}, but the descriptor set layout \
                declares it as {:?}",
                set, binding, shader_type, layout_type,
            ),
            Self::ArrayTooLarge {
                set,
                binding,
                array_size,
                descriptor_count,
            } => write!(
                f,
                "the shader declares set {} binding {} as an array of {} elements, but the \
                binding only has {} descriptors",
                set, binding, array_size, descriptor_count,
            ),
            Self::IndexedNonArray { variable } => {
                write!(f, "an access indexes {}, which is not an array", variable)
            }
            Self::MissingArrayIndex { variable } => write!(
                f,
                "an access to {} does not provide an array index, but it is an array",
                variable,
            ),
            Self::UnsupportedAccess {
                variable,
                op,
                descriptor_type,
            } => write!(
                f,
                "a {} access can't be performed through {}, which is a {:?} descriptor",
                op, variable, descriptor_type,
            ),
        }
    }
}

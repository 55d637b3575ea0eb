#![doc(html_logo_url = "https://raw.githubusercontent.com/vulkano-rs/vulkano/master/logo.png")]
//! GPU-assisted validation of descriptor indexing.
//!
//! Most of the rules of the Vulkan API can be checked when a command is recorded, because every
//! value involved is visible to the host. Descriptor indexing is the exception: when a shader
//! selects one element of a descriptor array with an index that it computes at runtime, no
//! amount of inspection of the command stream can tell whether the index is in range, or whether
//! the element it selects has ever been written. This crate checks those rules *on the device*.
//!
//! # Overview
//!
//! - A [`Device`](crate::device::Device) is the context that everything else belongs to. It
//!   holds the enabled features, the [`GpuAvConfig`](crate::device::GpuAvConfig), and the caches
//!   that are shared between command buffers.
//!
//! - [`DescriptorSetLayout`](crate::descriptor_set::layout::DescriptorSetLayout)s,
//!   [`DescriptorSet`](crate::descriptor_set::DescriptorSet)s and
//!   [`PipelineLayout`](crate::pipeline::layout::PipelineLayout)s mirror the Vulkan objects of the
//!   same name. Descriptor sets keep track of the state of every single array element: whether it
//!   has been written, written with a null descriptor, or whether the resource it refers to has
//!   been destroyed since.
//!
//! - [`ShaderModule`](crate::shader::ShaderModule)s are instrumented once when a
//!   [`Pipeline`](crate::pipeline::Pipeline) is created: every descriptor access is preceded by a
//!   call into a validation routine that checks the access against a snapshot of the bound
//!   descriptor state, and that replaces the result of an invalid access with an inert value.
//!
//! - A [`CommandBuffer`](crate::command_buffer::CommandBuffer) shadows the descriptor sets that
//!   are bound while it is being recorded. Binding a set with an incompatible pipeline layout
//!   disturbs the sets that are bound above it, exactly as on a real implementation. Every draw
//!   and dispatch serializes the bound state into a buffer that the instrumented shaders read.
//!
//! - While the commands execute, violations are written into an
//!   [`ErrorChannel`](crate::error_channel::ErrorChannel). Once the submission is known to be
//!   complete, the host drains the channel and decodes each record back into the API objects
//!   that were involved.
//!
//! The device itself is outside the scope of this crate. The
//! [`Queue`](crate::device::queue::Queue) type executes instrumented shaders with a software
//! interpreter so that the whole pipeline can be exercised on the host.

use std::{
    borrow::Cow,
    error::Error,
    fmt::{Display, Error as FmtError, Formatter},
};

mod cache;
pub mod command_buffer;
pub mod descriptor_set;
pub mod device;
pub mod error_channel;
mod macros;
pub mod pipeline;
pub mod shader;
pub mod snapshot;
pub mod sync;

/// A helper type for non-exhaustive structs.
///
/// This type cannot be constructed outside this crate. Structures with a field of this type can
/// only be constructed by calling a constructor function or `Default::default()`. The effect is
/// similar to the standard Rust `#[non_exhaustive]` attribute, except that it does not prevent
/// update syntax from being used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)] // add traits as needed
pub struct NonExhaustive(pub(crate) ());

/// The arguments or other context of a call to a function were not valid.
#[derive(Clone, Debug)]
pub struct ValidationError {
    /// The context in which the problem exists (e.g. a specific parameter).
    pub context: Cow<'static, str>,

    /// A description of the problem.
    pub problem: Cow<'static, str>,

    /// *Valid Usage IDs* (VUIDs) in the Vulkan specification that relate to the error.
    pub vuids: &'static [&'static str],

    pub _ne: NonExhaustive,
}

impl ValidationError {
    pub(crate) fn add_context(mut self: Box<Self>, context: impl Into<Cow<'static, str>>) -> Box<Self> {
        if self.context.is_empty() {
            self.context = context.into();
        } else {
            self.context = format!("{}.{}", context.into(), self.context).into();
        }

        self
    }

    pub(crate) fn set_vuids(mut self: Box<Self>, vuids: &'static [&'static str]) -> Box<Self> {
        self.vuids = vuids;
        self
    }
}

impl Default for ValidationError {
    fn default() -> Self {
        ValidationError {
            context: Cow::Borrowed(""),
            problem: Cow::Borrowed(""),
            vuids: &[],
            _ne: NonExhaustive(()),
        }
    }
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        if self.context.is_empty() {
            write!(f, "{}", self.problem)?;
        } else {
            write!(f, "{}: {}", self.context, self.problem)?;
        }

        if !self.vuids.is_empty() {
            write!(f, "\n\nVulkan VUIDs:")?;

            for vuid in self.vuids {
                write!(f, "\n    {}", vuid)?;
            }
        }

        Ok(())
    }
}

impl Error for ValidationError {}

/// A wrapper for error types of functions that can return validation errors.
#[derive(Clone)]
pub enum Validated<E> {
    /// A non-validation error occurred.
    Error(E),

    /// A validation error occurred.
    ValidationError(Box<ValidationError>),
}

impl<E> Validated<E> {
    /// Maps the inner `Error` value using the provided function, or does nothing if the value is
    /// `ValidationError`.
    #[inline]
    pub fn map<F>(self, f: impl FnOnce(E) -> F) -> Validated<F> {
        match self {
            Self::Error(err) => Validated::Error(f(err)),
            Self::ValidationError(err) => Validated::ValidationError(err),
        }
    }

    /// Returns the inner `Error` value, or panics if it contains `ValidationError`.
    #[inline(always)]
    #[track_caller]
    pub fn unwrap(self) -> E {
        match self {
            Self::Error(err) => err,
            Self::ValidationError(err) => {
                panic!(
                    "called `Validated::unwrap` on a `ValidationError` value: {:?}",
                    err
                )
            }
        }
    }
}

impl<E> std::fmt::Debug for Validated<E>
where
    E: std::fmt::Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            Self::Error(err) => write!(f, "a non-validation error occurred: {:?}", err),
            Self::ValidationError(err) => {
                write!(f, "a validation error occurred\n\nCaused by:\n    {}", err)
            }
        }
    }
}

impl<E> Display for Validated<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            Self::Error(_) => write!(f, "a non-validation error occurred"),
            Self::ValidationError(_) => write!(f, "a validation error occurred"),
        }
    }
}

impl<E> Error for Validated<E>
where
    E: Error + 'static,
{
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Error(err) => Some(err),
            Self::ValidationError(err) => Some(err.as_ref()),
        }
    }
}

impl<E> From<Box<ValidationError>> for Validated<E> {
    #[inline]
    fn from(err: Box<ValidationError>) -> Self {
        Self::ValidationError(err)
    }
}

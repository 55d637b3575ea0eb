//! Describes a graphical, compute or ray tracing operation.
//!
//! A [`Pipeline`] groups the shader stages that run for a command with the [`PipelineLayout`]
//! that they were compiled against. Each stage is instrumented for the set layouts of the
//! pipeline layout when the pipeline is created, so that recording a command never has to
//! instrument anything.

use self::layout::PipelineLayout;
use crate::{
    descriptor_set::layout::DescriptorType,
    device::{Device, DeviceOwned},
    macros::{impl_id_counter, vulkan_enum},
    shader::{
        instrument::InstrumentationError, Instruction, InstrumentedShader, ShaderModule,
        ShaderStages,
    },
    Validated, ValidationError,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    num::NonZero,
    sync::Arc,
};

pub mod layout;

/// A pipeline, with instrumented shader stages.
#[derive(Debug)]
pub struct Pipeline {
    device: Arc<Device>,
    id: NonZero<u64>,

    bind_point: PipelineBindPoint,
    stages: Vec<Arc<InstrumentedShader>>,
    layout: Arc<PipelineLayout>,

    descriptor_uses: BTreeSet<(u32, u32)>,
    validated_bindings: BTreeMap<(u32, u32), DescriptorType>,
}

impl Pipeline {
    /// Creates a new `Pipeline`, instrumenting each of its stages.
    ///
    /// # Panics
    ///
    /// - Panics if `create_info.layout` or one of `create_info.stages` belongs to a different
    ///   device.
    pub fn new(
        device: Arc<Device>,
        create_info: PipelineCreateInfo,
    ) -> Result<Arc<Pipeline>, Validated<InstrumentationError>> {
        create_info
            .validate(&device)
            .map_err(|err| err.add_context("create_info"))?;

        let PipelineCreateInfo {
            bind_point,
            mut stages,
            layout,
            _ne: _,
        } = create_info;

        // Stages execute in pipeline order.
        stages.sort_by_key(|module| module.stage() as u32);

        let stages = stages
            .iter()
            .map(|module| device.instrument_shader(module, layout.set_layouts()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(Validated::Error)?;

        let mut descriptor_uses = BTreeSet::new();
        let mut validated_bindings = BTreeMap::new();

        for shader in &stages {
            descriptor_uses.extend(shader.module().descriptor_uses());
            validated_bindings.extend(
                shader
                    .validated_bindings()
                    .iter()
                    .map(|(&key, &descriptor_type)| (key, descriptor_type)),
            );
        }

        let pipeline = Arc::new(Pipeline {
            device,
            id: Self::next_id(),
            bind_point,
            stages,
            layout,
            descriptor_uses,
            validated_bindings,
        });

        tracing::debug!(
            pipeline = pipeline.id.get(),
            bind_point = ?bind_point,
            stages = pipeline.stages.len(),
            validated_bindings = pipeline.validated_bindings.len(),
            "created pipeline",
        );

        Ok(pipeline)
    }

    /// Returns the bind point that the pipeline is bound to.
    #[inline]
    pub fn bind_point(&self) -> PipelineBindPoint {
        self.bind_point
    }

    /// Returns the instrumented stages of the pipeline, in pipeline order.
    #[inline]
    pub fn stages(&self) -> &[Arc<InstrumentedShader>] {
        &self.stages
    }

    /// Returns the pipeline layout used in this pipeline.
    #[inline]
    pub fn layout(&self) -> &Arc<PipelineLayout> {
        &self.layout
    }

    /// Returns the `(set, binding)` pairs that any stage of the pipeline accesses.
    #[inline]
    pub fn descriptor_uses(&self) -> &BTreeSet<(u32, u32)> {
        &self.descriptor_uses
    }

    /// Returns the set numbers that any stage of the pipeline accesses.
    pub fn used_sets(&self) -> impl Iterator<Item = u32> + '_ {
        let mut last = None;

        self.descriptor_uses.iter().filter_map(move |&(set, _)| {
            (last != Some(set)).then(|| {
                last = Some(set);
                set
            })
        })
    }

    /// Returns the bindings whose accesses are validated in at least one stage.
    #[inline]
    pub fn validated_bindings(&self) -> &BTreeMap<(u32, u32), DescriptorType> {
        &self.validated_bindings
    }
}

unsafe impl DeviceOwned for Pipeline {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl_id_counter!(Pipeline);

/// Parameters to create a new `Pipeline`.
#[derive(Clone, Debug)]
pub struct PipelineCreateInfo {
    /// The bind point of the pipeline.
    ///
    /// There is no default value.
    pub bind_point: PipelineBindPoint,

    /// The shader stages of the pipeline. A stage may appear only once.
    ///
    /// The default value is empty, which must be overridden.
    pub stages: Vec<Arc<ShaderModule>>,

    /// The pipeline layout that the stages were compiled against.
    ///
    /// There is no default value.
    pub layout: Arc<PipelineLayout>,

    pub _ne: crate::NonExhaustive,
}

impl PipelineCreateInfo {
    /// Returns a `PipelineCreateInfo` with the specified `bind_point` and `layout`.
    #[inline]
    pub fn bind_point_and_layout(
        bind_point: PipelineBindPoint,
        layout: Arc<PipelineLayout>,
    ) -> Self {
        Self {
            bind_point,
            stages: Vec::new(),
            layout,
            _ne: crate::NonExhaustive(()),
        }
    }

    pub(crate) fn validate(&self, device: &Device) -> Result<(), Box<ValidationError>> {
        let &Self {
            bind_point,
            ref stages,
            ref layout,
            _ne: _,
        } = self;

        assert_eq!(layout.device().id(), device.id());

        if stages.is_empty() {
            return Err(Box::new(ValidationError {
                context: "stages".into(),
                problem: "is empty".into(),
                ..Default::default()
            }));
        }

        let mut seen_stages = ShaderStages::empty();

        for (stage_index, module) in stages.iter().enumerate() {
            assert_eq!(module.device().id(), device.id());

            let stage = ShaderStages::from(module.stage());

            if !bind_point.stages().contains(stage) {
                return Err(Box::new(ValidationError {
                    context: format!("stages[{}]", stage_index).into(),
                    problem: format!(
                        "is a {:?} shader, which can't be part of a {:?} pipeline",
                        module.stage(),
                        bind_point,
                    )
                    .into(),
                    ..Default::default()
                }));
            }

            if seen_stages.intersects(stage) {
                return Err(Box::new(ValidationError {
                    context: "stages".into(),
                    problem: format!("contains more than one {:?} shader", module.stage())
                        .into(),
                    vuids: &["VUID-VkGraphicsPipelineCreateInfo-stage-06897"],
                    ..Default::default()
                }));
            }

            seen_stages |= stage;

            for offset in push_constant_reads(module.instructions()) {
                if !layout.push_constants_cover(stage, offset, 4) {
                    return Err(Box::new(ValidationError {
                        context: format!("stages[{}]", stage_index).into(),
                        problem: format!(
                            "reads push constants at offset {}, which is not in a push \
                            constant range of `layout` for the {:?} stage",
                            offset,
                            module.stage(),
                        )
                        .into(),
                        vuids: &["VUID-VkGraphicsPipelineCreateInfo-layout-07987"],
                        ..Default::default()
                    }));
                }
            }
        }

        if bind_point == PipelineBindPoint::Graphics && !seen_stages.intersects(ShaderStages::VERTEX)
        {
            return Err(Box::new(ValidationError {
                context: "stages".into(),
                problem: "does not contain a vertex shader".into(),
                vuids: &["VUID-VkGraphicsPipelineCreateInfo-stage-02096"],
                ..Default::default()
            }));
        }

        if bind_point == PipelineBindPoint::RayTracing && !seen_stages.intersects(ShaderStages::RAYGEN)
        {
            return Err(Box::new(ValidationError {
                context: "stages".into(),
                problem: "does not contain a ray generation shader".into(),
                vuids: &["VUID-VkRayTracingPipelineCreateInfoKHR-stage-03425"],
                ..Default::default()
            }));
        }

        Ok(())
    }
}

fn push_constant_reads(instructions: &[Instruction]) -> Vec<u32> {
    let mut offsets = Vec::new();

    for instruction in instructions {
        match instruction {
            &Instruction::LoadPushConstant { offset, .. } => offsets.push(offset),
            Instruction::Selection { accept, reject, .. } => {
                offsets.extend(push_constant_reads(accept));
                offsets.extend(push_constant_reads(reject));
            }
            _ => (),
        }
    }

    offsets
}

vulkan_enum! {
    /// The type of a pipeline.
    ///
    /// When binding a pipeline or descriptor sets in a command buffer, the state for each bind
    /// point is independent from the others. This means that it is possible, for example, to
    /// bind a graphics pipeline without disturbing any bound compute pipeline. Likewise,
    /// binding descriptor sets for the `Compute` bind point does not affect sets that were
    /// bound to the `Graphics` bind point.
    PipelineBindPoint impl {
        /// Returns the shader stages that a pipeline of this bind point can contain.
        #[inline]
        pub const fn stages(self) -> ShaderStages {
            match self {
                PipelineBindPoint::Graphics => ShaderStages::all_graphics(),
                PipelineBindPoint::Compute => ShaderStages::COMPUTE,
                PipelineBindPoint::RayTracing => ShaderStages::all_ray_tracing(),
            }
        }
    }
    = PipelineBindPoint(i32);

    /// Draw commands use the graphics bind point.
    Graphics = GRAPHICS,

    /// Dispatch commands use the compute bind point.
    Compute = COMPUTE,

    /// Ray tracing commands use the ray tracing bind point.
    RayTracing = RAY_TRACING_KHR,
}

//! Linked shader programs.

use std::borrow::Cow;

use crate::backend::{
    NativeShader, ProgramDescriptor, ProgramId, SCREEN_HEIGHT, SCREEN_WIDTH, ShaderSource,
    UniformValue,
};
use crate::context::Context;
use crate::error::Result;

/// A compiled fragment program owned by the caller.
///
/// Programs are released when dropped. Stages and the post-processing pipeline
/// share them through `Rc<Program>` and never manage their lifetime otherwise.
pub struct Program {
    ctx: Context,
    id: ProgramId,
    label: String,
}

impl Program {
    pub fn new(ctx: &Context, desc: ProgramDescriptor) -> Result<Self> {
        let label = desc.label.clone();
        let id = ctx.with(|b| b.create_program(desc))?;
        Ok(Self {
            ctx: ctx.clone(),
            id,
            label,
        })
    }

    /// Compiles a WGSL fragment shader with no declared parameters.
    pub fn wgsl(
        ctx: &Context,
        label: impl Into<String>,
        source: impl Into<Cow<'static, str>>,
    ) -> Result<Self> {
        Self::new(ctx, ProgramDescriptor::new(label, ShaderSource::Wgsl(source.into())))
    }

    /// Wraps a CPU fragment closure for the software backend.
    pub fn native(ctx: &Context, label: impl Into<String>, shader: NativeShader) -> Result<Self> {
        Self::new(ctx, ProgramDescriptor::new(label, ShaderSource::Native(shader)))
    }

    pub fn id(&self) -> ProgramId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Makes this the program used by subsequent draws.
    pub fn activate(&self) {
        self.ctx.with(|b| b.use_program(self.id))
    }

    /// Sets a named parameter. Unknown names are ignored.
    pub fn set(&self, name: &str, value: impl Into<UniformValue>) -> Result<()> {
        self.ctx
            .with(|b| b.set_uniform(self.id, name, value.into()))
    }

    /// Sets `screenWidth` and `screenHeight`.
    pub fn set_screen_size(&self, width: u32, height: u32) -> Result<()> {
        self.set(SCREEN_WIDTH, width as f32)?;
        self.set(SCREEN_HEIGHT, height as f32)
    }
}

impl Drop for Program {
    fn drop(&mut self) {
        self.ctx.with(|b| b.delete_program(self.id));
    }
}

impl std::fmt::Debug for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Program")
            .field("label", &self.label)
            .field("id", &self.id)
            .finish()
    }
}

//! The full-screen quad every post-processing pass draws.

use crate::backend::{MeshId, ScreenVertex};
use crate::context::Context;
use crate::error::Result;
use crate::program::Program;

/// Corners in NDC with UVs, listed top-left, bottom-left, bottom-right, top-right.
pub const QUAD_VERTICES: [ScreenVertex; 4] = [
    ScreenVertex::new([-1.0, 1.0, 0.0], [0.0, 1.0]),
    ScreenVertex::new([-1.0, -1.0, 0.0], [0.0, 0.0]),
    ScreenVertex::new([1.0, -1.0, 0.0], [1.0, 0.0]),
    ScreenVertex::new([1.0, 1.0, 0.0], [1.0, 1.0]),
];

/// Two triangles covering the quad.
pub const QUAD_INDICES: [u32; 6] = [0, 1, 2, 0, 2, 3];

/// A quad spanning the whole viewport, uploaded once and never modified.
pub struct FullScreenQuad {
    ctx: Context,
    mesh: MeshId,
}

impl FullScreenQuad {
    pub fn new(ctx: &Context) -> Result<Self> {
        let mesh = ctx.with(|b| b.create_mesh(&QUAD_VERTICES, &QUAD_INDICES))?;
        Ok(Self {
            ctx: ctx.clone(),
            mesh,
        })
    }

    /// Issues one indexed draw of six indices with `program` into the bound target.
    pub fn draw(&self, program: &Program) -> Result<()> {
        program.activate();
        self.ctx.with(|b| b.draw(self.mesh))
    }
}

impl Drop for FullScreenQuad {
    fn drop(&mut self) {
        self.ctx.with(|b| b.delete_mesh(self.mesh));
    }
}

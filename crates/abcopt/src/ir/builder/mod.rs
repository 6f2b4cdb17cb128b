//! # IR Builder
//!
//! Translates one method body's instruction stream into an [`IrGraph`] in
//! SSA form.
//!
//! ## Pipeline overview
//!
//! ```text
//! method body bytes + exception table
//!      │
//!      ├─[core]─────────────────────────────────────────────┐
//!      │  Cfg::new()          flat frame [locals|scope|stack] │
//!      │  create_block()      saved entry state, one phi/slot │
//!      │  merge()             append phi inputs at joins      │
//!      │                                                     │
//!      └─[translate]──────────────────────────────────────┐  │
//!         Decoder::enter()     arg exprs for params/locals │  │
//!         Decoder::run()                                   │  │
//!           └── for each instruction:                      │  │
//!                 block boundary?  ─► start_block()        │  │
//!                 try range?       ─► xmerge() per handler │  │
//!                 translate()      ─► zero or one Expr     │  │
//!                                                          │  │
//! ◄──────────────────────────────────────────────────────────┘
//!   dce::eliminate()  ─► MethodBody
//! ```
//!
//! ## Architecture
//!
//! | Module        | Responsibility                                           |
//! |---------------|----------------------------------------------------------|
//! | [`core`]      | Frame layout, block creation, phi construction at merges |
//! | [`translate`] | Instruction → expression dispatch, exception edges       |
//!
//! The decoder is a stack-machine interpreter over SSA values: every frame
//! slot holds the [`ExprId`](super::ExprId) currently stored there, and
//! control transfers merge the frame into the target block's saved state.
//! Exception edges reset the stack and scope pointers to their initial
//! values and route through a handler block holding the `xarg` that
//! materializes the caught value.

pub mod core;
mod translate;

use super::types::{Handler, MethodBody};
use crate::abc::parse::ConstantPools;
use crate::optimizer::dce;
use crate::types::{MethodId, TypeCache, TypeId, Typeref};
use anyhow::Result;
use tracing::debug;

/// Everything the decoder needs to know about one body.
#[derive(Debug, Clone, Copy)]
pub struct BodyInput<'a> {
    pub pools: &'a ConstantPools,
    /// Method table of the declaring file, for `newfunction`/`callstatic`.
    pub methods: &'a [MethodId],
    /// Class table of the declaring file, for `newclass`.
    pub classes: &'a [TypeId],
    pub method: MethodId,
    pub code: &'a [u8],
    pub max_stack: u32,
    pub local_count: u32,
    pub max_scope: u32,
    pub init_scope: u32,
    pub strip_debug: bool,
}

/// Decode one method body.
///
/// `handlers` come from the body's exception table with offsets relative
/// to the start of `input.code`.
pub fn decode_body(
    input: &BodyInput<'_>,
    handlers: Vec<Handler>,
    activation: Typeref,
    cache: &TypeCache,
) -> Result<MethodBody> {
    let mut decoder = translate::Decoder::new(input, handlers);
    decoder.enter(input, cache)?;
    decoder.run(input.code)?;

    let translate::Decoder {
        cfg,
        handlers,
        fixed_locals,
        ..
    } = decoder;
    let mut body = MethodBody {
        max_stack: input.max_stack,
        local_count: input.local_count,
        max_scope: input.max_scope,
        init_scope: input.init_scope,
        code_len: input.code.len() as u32,
        handlers,
        activation,
        graph: cfg.g,
        fixed_locals,
        code: Vec::new(),
    };
    dce::eliminate(&mut body)?;
    debug!(
        method = cache.method(input.method).debug_name.as_str(),
        blocks = body.graph.blocks.len(),
        exprs = body.graph.exprs.len(),
        "decoded body"
    );
    Ok(body)
}

//! abcopt — whole-program optimizer for ABC stack-machine bytecode.
//!
//! The primary file is decoded into SSA form with every method body turned
//! into an [`ir::IrGraph`], optimized against the type information of the
//! whole program (including import files that are read but never written),
//! lowered back to stack code and re-encoded.
//!
//! ```text
//!  imports ──┐
//!            ├─► abc::read_abc ─► TypeCache + MethodBody per method
//!  primary ──┘                          │
//!                  worklist from scripts │ (closures and classes join
//!                                        ▼  as sccp reaches them)
//!        sccp ─► dvn ─► cfg_simplify ─► fold ─► casts
//!                                        │
//!                                        ▼
//!        remove_phis ─► appease (legacy) ─► layout ─► frame counts
//!                                        │
//!                                        ▼
//!               encoder::link ─► encoder::write_abc ─► bytes
//!                                        └─► natives::collect_natives
//! ```

pub mod abc;
pub mod analysis;
pub mod encoder;
pub mod error;
pub mod ir;
pub mod natives;
pub mod optimizer;
pub mod sched;
pub mod types;

#[cfg(test)]
pub(crate) mod testutil;

pub use anyhow::{Context, Result};
pub use error::AbcError;
pub use natives::{NativeKind, NativeMethod};

use abc::{read_abc, AbcFile};
use optimizer::{casts, cfg_simplify, dvn, fold, sccp};
use std::collections::HashSet;
use tracing::{debug, info};
use types::{AbcId, MethodId, TypeCache};

/// Configuration of one optimization run.
#[derive(Debug, Clone)]
pub struct OptimizeOptions {
    /// Drop debug instructions and parameter names.
    pub strip_debug_info: bool,
    /// Accept classes whose constructor is native.
    pub allow_native_ctors: bool,
    /// Keep method names in the method table.
    pub preserve_method_names: bool,
    /// Emit code the older verifier accepts: explicit kills and coercions
    /// at joins, and strict base-first class order across linked files.
    pub legacy_verifier: bool,
    /// Do not report natives of the primary file by name.
    pub obscure_natives: bool,
}

impl Default for OptimizeOptions {
    fn default() -> Self {
        Self {
            strip_debug_info: true,
            allow_native_ctors: false,
            preserve_method_names: false,
            legacy_verifier: false,
            obscure_natives: false,
        }
    }
}

/// Result of [`optimize`].
#[derive(Debug, Clone)]
pub struct Optimized {
    /// The optimized file.
    pub abc: Vec<u8>,
    /// Native methods the host has to bind, by emitted method index.
    pub natives: Vec<natives::NativeMethod>,
}

/// Optimize `primary` against the declarations in `imports`.
pub fn optimize(primary: &[u8], imports: &[&[u8]], options: &OptimizeOptions) -> Result<Optimized> {
    optimize_all(&[primary], imports, options)
}

/// Optimize several primary files linked into one output file.
pub fn optimize_all(
    primaries: &[&[u8]],
    imports: &[&[u8]],
    options: &OptimizeOptions,
) -> Result<Optimized> {
    let mut cache = TypeCache::new();

    for (id, bytes) in imports.iter().enumerate() {
        read_abc(bytes, id, &mut cache, options)
            .with_context(|| format!("failed to read import {}", id))?;
    }

    let mut primary: Option<AbcFile> = None;
    for (i, bytes) in primaries.iter().enumerate() {
        let id = imports.len() + i;
        let file = read_abc(bytes, id, &mut cache, options)
            .with_context(|| format!("failed to read input {}", i))?;
        match primary.as_mut() {
            Some(p) => p.combine(file, &mut cache),
            None => primary = Some(file),
        }
    }
    let primary = primary.ok_or_else(|| anyhow::anyhow!("no input file"))?;
    if options.obscure_natives {
        primary.obscure_natives(&mut cache);
    }

    let count = optimize_methods(&mut cache, &primary, options)?;
    info!(methods = count, files = primary.merged.len(), "optimized");

    let linked = encoder::link(&cache, &primary, options).context("failed to link")?;
    let abc = encoder::write_abc(&cache, &linked, options).context("failed to write output")?;
    let natives = if options.obscure_natives {
        Vec::new()
    } else {
        natives::collect_natives(&cache, &linked).context("failed to collect natives")?
    };

    info!(before = primary.len, after = abc.len(), natives = natives.len(), "encoded");
    Ok(Optimized { abc, natives })
}

/// Optimize every method reachable from the scripts of `primary`, then
/// every remaining method body declared by it. Returns the number of
/// bodies processed.
fn optimize_methods(
    cache: &mut TypeCache,
    primary: &AbcFile,
    options: &OptimizeOptions,
) -> Result<usize> {
    let mut ready = Vec::new();
    for &s in &primary.scripts {
        cache.ready_type(s, &mut ready);
    }

    let mut done = 0;
    let mut seen = HashSet::new();
    loop {
        while done < ready.len() {
            let m = ready[done];
            done += 1;
            if seen.insert(m) {
                optimize_method(cache, m, &primary.merged, options, &mut ready)?;
            }
        }
        // bodies no script reaches are still emitted with their class
        for &m in &primary.methods {
            cache.ready_method(m, &mut ready);
        }
        if done == ready.len() {
            return Ok(seen.len());
        }
    }
}

/// Run the per-method pipeline on `m`, leaving its body lowered to stack
/// code in [`ir::MethodBody::code`] order. Methods that become reachable
/// are queued onto `ready`.
pub fn optimize_method(
    cache: &mut TypeCache,
    m: MethodId,
    merged: &[AbcId],
    options: &OptimizeOptions,
    ready: &mut Vec<MethodId>,
) -> Result<()> {
    let mut body = match cache.method_mut(m).body.take() {
        Some(body) => body,
        None => return Ok(()),
    };
    let result = run_passes(&mut body, cache, m, merged, options, ready)
        .with_context(|| format!("failed to optimize {}", cache.method(m).name));
    cache.method_mut(m).body = Some(body);
    result
}

fn run_passes(
    body: &mut ir::MethodBody,
    cache: &mut TypeCache,
    m: MethodId,
    merged: &[AbcId],
    options: &OptimizeOptions,
    ready: &mut Vec<MethodId>,
) -> Result<()> {
    let target = || sccp::Target { method: m, merged };

    sccp::run(body, cache, target(), ready)?;
    dvn::number(body)?;
    if cfg_simplify::simplify(body)? {
        sccp::run(body, cache, target(), ready)?;
        dvn::number(body)?;
    }
    fold::fold(body)?;

    let outer = cache
        .method(m)
        .cx
        .and_then(|c| cache.ty(c).scopes.clone());
    let types = casts::insert_casts(body, cache, m, outer.as_deref())?;

    sched::remove_phis(body, cache.method_mut(m))?;
    if options.legacy_verifier {
        sched::appease(body, cache, cache.method(m), &types)?;
    }
    body.code = sched::layout(&mut body.graph)?;
    sched::compute_frame_counts(body)?;

    debug!(
        method = %cache.method(m).name,
        blocks = body.code.len(),
        max_stack = body.max_stack,
        locals = body.local_count,
        "lowered"
    );
    Ok(())
}

//! Core decoder state: the simulated frame and block/phi bookkeeping.
//!
//! The frame is one flat slot array laid out as
//! `[locals | scope chain | operand stack]`. Each block remembers the frame
//! it starts with; the saved slots are phis, so merging another incoming
//! state just appends phi inputs where the incoming value differs.

use super::super::types::*;
use crate::abc::opcodes::Op;
use crate::error::AbcError;
use anyhow::Result;
use std::collections::{BTreeMap, HashMap};

/// Target of an edge whose block does not exist yet.
pub(super) const UNSET: BlockId = BlockId(u32::MAX);

/// Saved entry state of a block.
#[derive(Debug, Clone)]
pub(super) struct FrameState {
    pub(super) frame: Vec<Option<ExprId>>,
    pub(super) sp: usize,
    pub(super) scopep: usize,
}

/// Block and phi construction over a growing [`IrGraph`].
#[derive(Debug)]
pub(super) struct Cfg {
    pub(super) g: IrGraph,
    pub(super) local_count: usize,
    pub(super) max_scope: usize,
    pub(super) frame_len: usize,
    /// Block starting at each code position.
    pub(super) blocks: BTreeMap<usize, BlockId>,
    pub(super) states: HashMap<BlockId, FrameState>,
}

impl Cfg {
    pub(super) fn new(local_count: usize, max_scope: usize, max_stack: usize) -> Self {
        Self {
            g: IrGraph::new(),
            local_count,
            max_scope,
            frame_len: local_count + max_scope + max_stack + 1,
            blocks: BTreeMap::new(),
            states: HashMap::new(),
        }
    }

    /// Locals and active scopes are live, as is the whole operand stack.
    pub(super) fn is_live(&self, i: usize, scopep: usize) -> bool {
        i < scopep || i >= self.local_count + self.max_scope
    }

    /// New block whose entry state is `frame`; every live slot gets a phi
    /// seeded from `edge` when there is one.
    pub(super) fn create_block(
        &mut self,
        edge: Option<EdgeId>,
        frame: &[Option<ExprId>],
        sp: usize,
        scopep: usize,
    ) -> BlockId {
        let b = self.g.new_block();
        let mut state = FrameState {
            frame: vec![None; self.frame_len],
            sp,
            scopep,
        };
        if let Some(edge) = edge {
            self.g.edge_mut(edge).to = b;
        }
        for i in 0..sp {
            if !self.is_live(i, scopep) {
                continue;
            }
            if let Some(v) = frame[i] {
                let phi = self.g.push(b, Op::Phi);
                if let Some(edge) = edge {
                    let x = self.g.expr_mut(phi);
                    x.args = vec![v];
                    x.pred = vec![edge];
                }
                state.frame[i] = Some(phi);
            }
        }
        self.states.insert(b, state);
        b
    }

    /// Merge `frame` into the block at `pos`, creating it on first use.
    pub(super) fn merge(
        &mut self,
        edge: Option<EdgeId>,
        pos: usize,
        frame: &[Option<ExprId>],
        sp: usize,
        scopep: usize,
    ) -> Result<()> {
        match self.blocks.get(&pos).copied() {
            None => {
                let b = self.create_block(edge, frame, sp, scopep);
                self.blocks.insert(pos, b);
            }
            Some(b) => {
                if let Some(edge) = edge {
                    self.g.edge_mut(edge).to = b;
                    self.merge_frame_states(edge, frame, sp, scopep)?;
                }
            }
        }
        Ok(())
    }

    /// Append phi inputs for every live slot where `frame` differs from the
    /// saved state of `edge.to`.
    pub(super) fn merge_frame_states(
        &mut self,
        edge: EdgeId,
        frame: &[Option<ExprId>],
        sp: usize,
        scopep: usize,
    ) -> Result<()> {
        let to = self.g.edge(edge).to;
        let target = match self.states.get(&to) {
            Some(s) => s.frame.clone(),
            None => return Err(AbcError::internal(format!("no saved frame for {}", to))),
        };
        for i in 0..sp.min(target.len()) {
            if !self.is_live(i, scopep) || frame[i] == target[i] {
                continue;
            }
            // Slots the target never saw stay unmerged.
            let Some(phi) = target[i] else { continue };
            let Some(v) = frame[i] else {
                return Err(AbcError::format(format!(
                    "frame slot {} undefined at merge into {}",
                    i, to
                )));
            };
            if self.g.expr(phi).op != Op::Phi {
                return Err(AbcError::internal(format!("saved slot {} is not a phi", i)));
            }
            let x = self.g.expr_mut(phi);
            x.args.push(v);
            x.pred.push(edge);
        }
        Ok(())
    }
}

//! Instruction encoding and method body emission.
//!
//! ## Algorithm
//!
//! Branch offsets depend on block positions, which depend on branch sizes,
//! so a body is written in two passes:
//!
//! 1. Encode every block's straight-line instructions into its own buffer
//!    and reserve space for its terminator: a jump takes 4 bytes unless it
//!    falls through, a conditional branch 4 bytes plus 4 more when its
//!    fall-through edge is not the next block, a switch its exact size.
//!    This fixes every block's start position.
//! 2. Concatenate the buffers, writing the terminators with their final
//!    signed offsets. Blocks reached by a backward edge start with `label`.
//!
//! The exception table is rebuilt from the blocks that carry an exception
//! edge into each handler; handlers whose entry block died are dropped and
//! `newcatch` indices renumbered to match.

use super::link::{const_id, const_kind, Linked};
use crate::abc::constants::ref_argc;
use crate::abc::writer::{size_of_u30, Writer};
use crate::abc::Op;
use crate::error::AbcError;
use crate::ir::{BlockId, Expr, IrGraph, MethodBody};
use crate::types::{Name, TypeCache, Value};
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use tracing::trace;

// ── Operand shapes ───────────────────────────────────────────────────────────

/// Immediate operands an instruction carries after its opcode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Operands {
    None,
    /// Name index.
    Name,
    /// Name index and argument count.
    NameArgc,
    /// Argument count.
    Argc,
    /// `imm[0]` as a u30: slots, registers, line numbers.
    Imm,
    /// `imm[0]` and `imm[1]` as u30s.
    Imm2,
    /// `imm[0]` as a byte.
    ImmByte,
    /// Handler index, renumbered after dead handlers are dropped.
    Catch,
    /// Class index.
    Class,
    /// Method index.
    Method,
    /// Method index and argument count.
    MethodArgc,
    /// Dispatch id and argument count.
    DispArgc,
    /// Signed byte literal.
    Byte,
    /// Signed 16-bit literal as a u30.
    Short,
    /// String index of the literal.
    String,
    Namespace,
    Int,
    Uint,
    Double,
    /// `debug`: kind byte, string index, register byte, extra u30.
    Debug,
    /// Control transfer; encoded by the block emitter.
    Branch,
    /// No encoding at all.
    Synthetic,
}

pub(super) fn operands(op: Op) -> Operands {
    use Op::*;
    match op {
        GetSuper | SetSuper | GetDescendants | DelDescendants | DeleteProperty | GetProperty
        | SetProperty | InitProperty | FindPropStrict | FindProperty | FindDef | GetLex
        | Coerce | AsType | IsType => Operands::Name,
        CallSuper | CallProperty | ConstructProp | CallPropLex | CallSuperVoid
        | CallPropVoid => Operands::NameArgc,
        Call | Construct | ConstructSuper | ApplyType | NewObject | NewArray => Operands::Argc,
        GetLocal | SetLocal | Kill | GetSlot | SetSlot | IncLocal | IncLocalI | DecLocal
        | DecLocalI | DebugLine | BkptLine => Operands::Imm,
        HasNext2 => Operands::Imm2,
        GetScopeObject => Operands::ImmByte,
        NewCatch => Operands::Catch,
        NewClass => Operands::Class,
        NewFunction => Operands::Method,
        CallStatic => Operands::MethodArgc,
        CallMethod => Operands::DispArgc,
        PushByte => Operands::Byte,
        PushShort => Operands::Short,
        PushString | Dxns | DebugFile => Operands::String,
        PushNamespace => Operands::Namespace,
        PushInt => Operands::Int,
        PushUint => Operands::Uint,
        PushDouble => Operands::Double,
        Debug => Operands::Debug,
        Jump | LookupSwitch | IfTrue | IfFalse | IfEq | IfNe | IfLt | IfLe | IfGt | IfGe
        | IfNlt | IfNle | IfNgt | IfNge | IfStrictEq | IfStrictNe => Operands::Branch,
        Phi | Arg | XArg | HasNext2O | HasNext2I => Operands::Synthetic,
        Bkpt | Nop | Throw | DxnsLate | Label | PushWith | PopScope | NextName | HasNext
        | PushNull | PushUndefined | NextValue | PushTrue | PushFalse | PushNan | Pop | Dup
        | Swap | PushScope | ReturnVoid | ReturnValue | NewActivation | GetGlobalScope
        | ConvertS | EscXelem | EscXattr | ConvertI | ConvertU | ConvertD | ConvertB
        | ConvertO | CheckFilter | CoerceA | CoerceS | AsTypeLate | CoerceO | Negate
        | Increment | Decrement | TypeOf | Not | BitNot | Add | Subtract | Multiply | Divide
        | Modulo | LShift | RShift | URShift | BitAnd | BitOr | BitXor | Equals
        | StrictEquals | LessThan | LessEquals | GreaterThan | GreaterEquals | InstanceOf
        | IsTypeLate | In | IncrementI | DecrementI | NegateI | AddI | SubtractI
        | MultiplyI | GetLocal0 | GetLocal1 | GetLocal2 | GetLocal3 | SetLocal0 | SetLocal1
        | SetLocal2 | SetLocal3 | Timestamp => Operands::None,
    }
}

/// Argument count operand of a call-like instruction.
fn argc(x: &Expr) -> Result<u32> {
    let n = x.args.len();
    let count = match x.op {
        Op::CallProperty
        | Op::CallPropLex
        | Op::CallPropVoid
        | Op::CallSuper
        | Op::CallSuperVoid
        | Op::ConstructProp => {
            let refs = x.name.as_ref().map_or(0, |n| ref_argc(n.kind));
            n.checked_sub(refs + 1)
        }
        Op::ApplyType | Op::CallStatic | Op::CallMethod | Op::ConstructSuper | Op::Construct => {
            n.checked_sub(1)
        }
        Op::Call => n.checked_sub(2),
        Op::NewArray => Some(n),
        Op::NewObject if n % 2 == 0 => Some(n / 2),
        _ => None,
    };
    count
        .map(|c| c as u32)
        .ok_or_else(|| AbcError::internal(format!("bad operand count for {}", x)))
}

fn name_of(x: &Expr) -> Result<&Name> {
    x.name
        .as_ref()
        .ok_or_else(|| AbcError::internal(format!("{} has no name", x)))
}

fn string_of(x: &Expr) -> Result<&str> {
    match &x.value {
        Some(Value::String(s)) => Ok(s),
        _ => Err(AbcError::internal(format!("{} has no string operand", x))),
    }
}

fn int_of(x: &Expr) -> Result<i32> {
    match x.value {
        Some(Value::Int(v)) => Ok(v),
        _ => Err(AbcError::internal(format!("{} has no int operand", x))),
    }
}

fn imm(x: &Expr, i: usize) -> Result<u32> {
    match x.imm.get(i) {
        Some(&v) if v >= 0 => Ok(v as u32),
        _ => Err(AbcError::internal(format!("{} is missing immediate {}", x, i))),
    }
}

// ── Instructions ─────────────────────────────────────────────────────────────

struct Encoder<'a> {
    linked: &'a Linked,
    cache: &'a TypeCache,
    /// Old handler index → emitted handler index.
    catches: HashMap<u32, u32>,
}

impl Encoder<'_> {
    /// Encode one straight-line instruction.
    fn instruction(&self, w: &mut Writer, x: &Expr) -> Result<()> {
        let l = self.linked;
        let byte = x
            .op
            .byte()
            .ok_or_else(|| AbcError::internal(format!("{} has no encoding", x)))?;

        // short register forms
        if matches!(x.op, Op::GetLocal | Op::SetLocal) {
            let r = imm(x, 0)?;
            if r < 4 {
                let base = if x.op == Op::GetLocal { Op::GetLocal0 } else { Op::SetLocal0 };
                w.write_u8(base.byte().unwrap_or(byte) + r as u8);
                return Ok(());
            }
        }

        w.write_u8(byte);
        match operands(x.op) {
            Operands::None => {}
            Operands::Name => w.write_u30(l.names.id(name_of(x)?)?),
            Operands::NameArgc => {
                w.write_u30(l.names.id(name_of(x)?)?);
                w.write_u30(argc(x)?);
            }
            Operands::Argc => w.write_u30(argc(x)?),
            Operands::Imm => w.write_u30(imm(x, 0)?),
            Operands::Imm2 => {
                w.write_u30(imm(x, 0)?);
                w.write_u30(imm(x, 1)?);
            }
            Operands::ImmByte => w.write_u8(imm(x, 0)? as u8),
            Operands::Catch => {
                let h = self.catches.get(&imm(x, 0)?).copied().ok_or_else(|| {
                    AbcError::internal(format!("{} refers to a dropped handler", x))
                })?;
                w.write_u30(h);
            }
            Operands::Class => {
                let c = x
                    .class
                    .ok_or_else(|| AbcError::internal(format!("{} has no class", x)))?;
                w.write_u30(l.class_id(c, self.cache)?);
            }
            Operands::Method | Operands::MethodArgc => {
                let m = x
                    .method
                    .ok_or_else(|| AbcError::internal(format!("{} has no method", x)))?;
                w.write_u30(l.method_id(m, self.cache)?);
                if x.op == Op::CallStatic {
                    w.write_u30(argc(x)?);
                }
            }
            Operands::DispArgc => {
                w.write_u30(imm(x, 0)?);
                w.write_u30(argc(x)?);
            }
            Operands::Byte => w.write_u8(int_of(x)? as i8 as u8),
            Operands::Short => w.write_u30(int_of(x)? as i16 as u16 as u32),
            Operands::String => w.write_u30(l.strings.id(&string_of(x)?.to_string())?),
            Operands::Namespace => match &x.value {
                Some(Value::Namespace(ns)) => w.write_u30(l.namespaces.id(ns)?),
                _ => return Err(AbcError::internal(format!("{} has no namespace", x))),
            },
            Operands::Int => w.write_u30(l.ints.id(&int_of(x)?)?),
            Operands::Uint => match x.value {
                Some(Value::Uint(v)) => w.write_u30(l.uints.id(&v)?),
                _ => return Err(AbcError::internal(format!("{} has no uint operand", x))),
            },
            Operands::Double => match x.value {
                Some(Value::Double(d)) => w.write_u30(l.doubles.id(&d.to_bits())?),
                _ => return Err(AbcError::internal(format!("{} has no double operand", x))),
            },
            Operands::Debug => {
                w.write_u8(imm(x, 0)? as u8);
                w.write_u30(l.strings.id(&string_of(x)?.to_string())?);
                w.write_u8(imm(x, 2)? as u8);
                w.write_u30(imm(x, 3)?);
            }
            Operands::Branch | Operands::Synthetic => {
                return Err(AbcError::internal(format!("{} inside a block", x)));
            }
        }
        Ok(())
    }
}

// ── Bodies ───────────────────────────────────────────────────────────────────

/// What follows a block's straight-line code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tail {
    /// Return or throw, already written into the block buffer.
    Done,
    /// Jump that falls through to the next block.
    FallThrough,
    /// Reserved bytes for branch, jump or switch.
    Reserved(usize),
}

fn terminator(g: &IrGraph, b: BlockId) -> Result<&Expr> {
    g.last(b)
        .map(|e| g.expr(e))
        .filter(|x| x.is_terminator())
        .ok_or_else(|| AbcError::internal(format!("{} does not end in a control transfer", b)))
}

/// Write code length, instructions and exception table of `body`, laid
/// out in `body.code` order.
pub(super) fn emit_code(
    out: &mut Writer,
    linked: &Linked,
    cache: &TypeCache,
    body: &MethodBody,
) -> Result<()> {
    let g = &body.graph;
    let code = &body.code;

    // Handlers that still have an entry block reached by some exception edge.
    let live: HashSet<BlockId> = code.iter().copied().collect();
    let mut protected: HashMap<BlockId, Vec<BlockId>> = HashMap::new();
    for &b in code {
        for &x in &g.block(b).xsucc {
            protected.entry(g.edge(x).to).or_default().push(b);
        }
    }
    let mut catches = HashMap::new();
    let mut handlers = Vec::new();
    for (i, h) in body.handlers.iter().enumerate() {
        if let Some(entry) = h.entry.filter(|e| live.contains(e) && protected.contains_key(e)) {
            catches.insert(i as u32, handlers.len() as u32);
            handlers.push((h, entry));
        }
    }
    let enc = Encoder {
        linked,
        cache,
        catches,
    };

    let mut labels = HashSet::new();
    let mut done = HashSet::new();
    for &b in code {
        done.insert(b);
        for &s in g.succ(b) {
            if done.contains(&g.edge(s).to) {
                labels.insert(g.edge(s).to);
            }
        }
    }

    // Pass 1: block buffers and positions.
    let mut pos: HashMap<BlockId, usize> = HashMap::new();
    let mut ends: HashMap<BlockId, usize> = HashMap::new();
    let mut bufs: Vec<(Writer, Tail)> = Vec::with_capacity(code.len());
    let mut code_len = 0;
    for (i, &b) in code.iter().enumerate() {
        pos.insert(b, code_len);
        let mut w = Writer::new();
        if labels.contains(&b) {
            w.write_u8(Op::Label.byte().unwrap_or(0x09));
        }
        for &e in &g.block(b).exprs {
            let x = g.expr(e);
            if x.is_terminator() {
                break;
            }
            enc.instruction(&mut w, x)?;
        }

        let last = terminator(g, b)?;
        let next = code.get(i + 1).copied();
        let falls = |k: usize| last.succ.get(k).map(|&s| g.edge(s).to) == next && next.is_some();
        let tail = match last.op {
            Op::ReturnVoid | Op::ReturnValue | Op::Throw => {
                w.write_u8(last.op.byte().unwrap_or(0));
                Tail::Done
            }
            Op::Jump if falls(0) => Tail::FallThrough,
            Op::Jump => Tail::Reserved(4),
            Op::LookupSwitch => {
                let n = last.succ.len();
                if n < 2 {
                    return Err(AbcError::internal(format!("switch with {} targets", n)));
                }
                Tail::Reserved(1 + 3 + size_of_u30((n - 2) as u32) + 3 * (n - 1))
            }
            _ if falls(0) => Tail::Reserved(4),
            _ => Tail::Reserved(8),
        };
        code_len += w.len();
        if let Tail::Reserved(n) = tail {
            code_len += n;
        }
        ends.insert(b, code_len);
        bufs.push((w, tail));
    }

    // Pass 2: final bytes.
    out.write_index(code_len);
    let start = out.len();
    let target = |b: BlockId| -> Result<usize> {
        pos.get(&b)
            .map(|&p| start + p)
            .ok_or_else(|| AbcError::internal(format!("branch to {} outside the code", b)))
    };
    for (&b, (w, tail)) in code.iter().zip(&bufs) {
        out.write_bytes(w.as_bytes());
        let n = match *tail {
            Tail::Reserved(n) => n,
            _ => continue,
        };
        let last = terminator(g, b)?;
        let edge_to = |k: usize| -> Result<BlockId> {
            last.succ
                .get(k)
                .map(|&s| g.edge(s).to)
                .ok_or_else(|| AbcError::internal(format!("{} lacks successor {}", last, k)))
        };
        if last.op == Op::LookupSwitch {
            let base = out.len() as i64;
            out.write_u8(last.op.byte().unwrap_or(0x1B));
            let cases = last.succ.len() - 2;
            out.write_s24((target(edge_to(cases + 1)?)? as i64 - base) as i32);
            out.write_index(cases);
            for k in 0..=cases {
                out.write_s24((target(edge_to(k)?)? as i64 - base) as i32);
            }
            continue;
        }
        let mut remaining = n;
        if last.op.is_if() {
            branch(out, last.op, target(edge_to(1)?)?);
            remaining -= 4;
        }
        if remaining == 4 {
            branch(out, Op::Jump, target(edge_to(0)?)?);
        }
    }
    trace!(len = code_len, blocks = code.len(), "code");

    out.write_index(handlers.len());
    for (h, entry) in handlers {
        let blocks = protected.get(&entry).map(Vec::as_slice).unwrap_or(&[]);
        let from = blocks.iter().filter_map(|b| pos.get(b)).min().copied().unwrap_or(0);
        let to = blocks.iter().filter_map(|b| ends.get(b)).max().copied().unwrap_or(0);
        out.write_index(from);
        out.write_index(to);
        out.write_index(pos.get(&entry).copied().unwrap_or(0));
        out.write_u30(linked.type_ref(h.ty.t, cache)?);
        match &h.name {
            Some(n) => out.write_u30(linked.names.id(n)?),
            None => out.write_u30(0),
        }
    }
    Ok(())
}

/// Branch from the current position to absolute position `to`.
fn branch(out: &mut Writer, op: Op, to: usize) {
    out.write_u8(op.byte().unwrap_or(0x10));
    let from = out.len() + 3;
    out.write_s24((to as i64 - from as i64) as i32);
}

/// Emitted form of a trait or parameter default: `(index, kind)`.
pub(super) fn constant(linked: &Linked, v: &Value) -> Result<(u32, u8)> {
    let kind = const_kind(v);
    Ok((const_id(linked, kind, v)?, kind))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::MethodBody;
    use crate::types::TypeCache;

    fn body(cache: &TypeCache, g: IrGraph, code: Vec<BlockId>) -> MethodBody {
        MethodBody {
            max_stack: 1,
            local_count: 1,
            max_scope: 0,
            init_scope: 0,
            code_len: 0,
            handlers: Vec::new(),
            activation: cache.tref(cache.builtins.any),
            graph: g,
            fixed_locals: HashMap::new(),
            code,
        }
    }

    fn push_byte(g: &mut IrGraph, b: BlockId, v: i32) {
        let e = g.push(b, Op::PushByte);
        g.expr_mut(e).value = Some(Value::Int(v));
    }

    #[test]
    fn every_op_has_a_shape() {
        for byte in 0..=255u8 {
            if let Some(op) = Op::from_byte(byte) {
                let shape = operands(op);
                assert_ne!(shape, Operands::Synthetic, "{}", op);
                assert_eq!(shape == Operands::Branch, op == Op::Jump || op == Op::LookupSwitch || op.is_if());
            }
        }
    }

    /// `entry: if → ret1 | ret2` laid out as `[entry, ret2, ret1]`: the
    /// fall-through edge needs an explicit jump.
    #[test]
    fn branch_offsets_are_relative_to_the_next_instruction() {
        let cache = TypeCache::new();
        let mut g = IrGraph::new();
        let entry = g.entry_block();
        let (one, two) = (g.new_block(), g.new_block());
        push_byte(&mut g, entry, 0);
        let br = g.push(entry, Op::IfTrue);
        let c = g.block(entry).exprs[0];
        g.expr_mut(br).args = vec![c];
        let e0 = g.new_edge(Some(entry), 0, one);
        let e1 = g.new_edge(Some(entry), 1, two);
        g.expr_mut(br).succ = vec![e0, e1];
        for (b, v) in [(one, 1), (two, 2)] {
            push_byte(&mut g, b, v);
            let x = g.block(b).exprs[0];
            let r = g.push(b, Op::ReturnValue);
            g.expr_mut(r).args = vec![x];
        }

        let b = body(&cache, g, vec![entry, two, one]);
        let linked = Linked::default();
        let mut out = Writer::new();
        emit_code(&mut out, &linked, &cache, &b).unwrap();

        let bytes = out.into_bytes();
        // len, pushbyte 0, iftrue +4, jump +3, pushbyte 2, returnvalue, pushbyte 1, returnvalue
        assert_eq!(
            bytes,
            vec![
                16, 0x24, 0, 0x11, 4, 0, 0, 0x10, 3, 0, 0, 0x24, 2, 0x48, 0x24, 1, 0x48, 0
            ]
        );
    }

    #[test]
    fn backward_target_gets_a_label() {
        let cache = TypeCache::new();
        let mut g = IrGraph::new();
        let entry = g.entry_block();
        let head = g.new_block();
        let j = g.push(entry, Op::Jump);
        let e = g.new_edge(Some(entry), 0, head);
        g.expr_mut(j).succ = vec![e];
        let j = g.push(head, Op::Jump);
        let back = g.new_edge(Some(head), 0, head);
        g.expr_mut(j).succ = vec![back];

        let b = body(&cache, g, vec![entry, head]);
        let mut out = Writer::new();
        emit_code(&mut out, &Linked::default(), &cache, &b).unwrap();
        // len 5, label, jump -5 (back onto the label), no handlers
        assert_eq!(out.into_bytes(), vec![5, 0x09, 0x10, 0xfb, 0xff, 0xff, 0]);
    }

    #[test]
    fn short_register_forms() {
        let cache = TypeCache::new();
        let linked = Linked::default();
        let enc = Encoder {
            linked: &linked,
            cache: &cache,
            catches: HashMap::new(),
        };
        let mut g = IrGraph::new();
        let b = g.entry_block();
        let get = g.push(b, Op::GetLocal);
        g.expr_mut(get).imm = vec![2];
        let set = g.push(b, Op::SetLocal);
        g.expr_mut(set).imm = vec![300];
        let mut w = Writer::new();
        enc.instruction(&mut w, g.expr(get)).unwrap();
        enc.instruction(&mut w, g.expr(set)).unwrap();
        assert_eq!(w.into_bytes(), vec![0xD2, 0x63, 0xAC, 0x02]);
    }
}

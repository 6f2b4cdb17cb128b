//! Helpers shared by unit tests: method stubs and body decoding.

use crate::abc::parse::ConstantPools;
use crate::abc::Op;
use crate::analysis::dfs;
use crate::ir::builder::{decode_body, BodyInput};
use crate::ir::MethodBody;
use crate::types::{Method, MethodId, MethodKind, Name, TypeCache};

/// A method taking `params` untyped arguments besides the receiver.
pub fn method(cache: &mut TypeCache, params: usize) -> MethodId {
    let any = cache.tref(cache.builtins.any);
    cache.add_method(Method {
        id: 0,
        abc: 0,
        params: vec![any; params + 1],
        param_names: None,
        returns: any,
        values: Vec::new(),
        optional_count: 0,
        flags: 0,
        cx: None,
        kind: MethodKind::Function,
        name: Name::public("f"),
        debug_name: "f".into(),
        body: None,
        ready: false,
    })
}

/// Decode `code` as the body of `m`, without handlers.
pub fn decode(cache: &TypeCache, m: MethodId, code: &[u8], locals: u32, stack: u32) -> MethodBody {
    let pools = ConstantPools::default();
    let input = BodyInput {
        pools: &pools,
        methods: &[],
        classes: &[],
        method: m,
        code,
        max_stack: stack,
        local_count: locals,
        max_scope: 1,
        init_scope: 0,
        strip_debug: true,
    };
    let any = cache.tref(cache.builtins.any);
    decode_body(&input, Vec::new(), any, cache).unwrap()
}

/// Opcodes of every live block, in reverse postorder.
pub fn live_ops(body: &mut MethodBody) -> Vec<Vec<Op>> {
    dfs(&mut body.graph)
        .iter()
        .map(|&b| {
            body.graph
                .block(b)
                .exprs
                .iter()
                .map(|&e| body.graph.expr(e).op)
                .collect()
        })
        .collect()
}

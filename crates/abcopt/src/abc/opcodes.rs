//! The closed instruction set.
//!
//! [`Op`] covers every instruction the decoder accepts plus a handful of
//! synthetic operations that only exist inside the IR (`Phi`, `Arg`, `XArg`
//! and the two halves of `hasnext2`). Synthetic ops have no encoding and
//! are never emitted.

macro_rules! opcodes {
    ($($variant:ident = $byte:literal, $name:literal;)*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum Op {
            $($variant,)*
            /// SSA merge of one value per incoming edge.
            Phi,
            /// Incoming parameter or initial local; `imm[0]` is the slot.
            Arg,
            /// Exception value at the head of a handler block.
            XArg,
            /// Object half of `hasnext2`, written back to its local.
            HasNext2O,
            /// Index half of `hasnext2`, written back to its local.
            HasNext2I,
        }

        impl Op {
            pub fn from_byte(b: u8) -> Option<Op> {
                match b {
                    $($byte => Some(Op::$variant),)*
                    _ => None,
                }
            }

            /// Encoding byte; `None` for synthetic operations.
            pub fn byte(self) -> Option<u8> {
                match self {
                    $(Op::$variant => Some($byte),)*
                    _ => None,
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(Op::$variant => $name,)*
                    Op::Phi => "phi",
                    Op::Arg => "arg",
                    Op::XArg => "xarg",
                    Op::HasNext2O => "hasnext2_o",
                    Op::HasNext2I => "hasnext2_i",
                }
            }
        }
    };
}

opcodes! {
    Bkpt = 0x01, "bkpt";
    Nop = 0x02, "nop";
    Throw = 0x03, "throw";
    GetSuper = 0x04, "getsuper";
    SetSuper = 0x05, "setsuper";
    Dxns = 0x06, "dxns";
    DxnsLate = 0x07, "dxnslate";
    Kill = 0x08, "kill";
    Label = 0x09, "label";
    IfNlt = 0x0C, "ifnlt";
    IfNle = 0x0D, "ifnle";
    IfNgt = 0x0E, "ifngt";
    IfNge = 0x0F, "ifnge";
    Jump = 0x10, "jump";
    IfTrue = 0x11, "iftrue";
    IfFalse = 0x12, "iffalse";
    IfEq = 0x13, "ifeq";
    IfNe = 0x14, "ifne";
    IfLt = 0x15, "iflt";
    IfLe = 0x16, "ifle";
    IfGt = 0x17, "ifgt";
    IfGe = 0x18, "ifge";
    IfStrictEq = 0x19, "ifstricteq";
    IfStrictNe = 0x1A, "ifstrictne";
    LookupSwitch = 0x1B, "lookupswitch";
    PushWith = 0x1C, "pushwith";
    PopScope = 0x1D, "popscope";
    NextName = 0x1E, "nextname";
    HasNext = 0x1F, "hasnext";
    PushNull = 0x20, "pushnull";
    PushUndefined = 0x21, "pushundefined";
    NextValue = 0x23, "nextvalue";
    PushByte = 0x24, "pushbyte";
    PushShort = 0x25, "pushshort";
    PushTrue = 0x26, "pushtrue";
    PushFalse = 0x27, "pushfalse";
    PushNan = 0x28, "pushnan";
    Pop = 0x29, "pop";
    Dup = 0x2A, "dup";
    Swap = 0x2B, "swap";
    PushString = 0x2C, "pushstring";
    PushInt = 0x2D, "pushint";
    PushUint = 0x2E, "pushuint";
    PushDouble = 0x2F, "pushdouble";
    PushScope = 0x30, "pushscope";
    PushNamespace = 0x31, "pushnamespace";
    HasNext2 = 0x32, "hasnext2";
    NewFunction = 0x40, "newfunction";
    Call = 0x41, "call";
    Construct = 0x42, "construct";
    CallMethod = 0x43, "callmethod";
    CallStatic = 0x44, "callstatic";
    CallSuper = 0x45, "callsuper";
    CallProperty = 0x46, "callproperty";
    ReturnVoid = 0x47, "returnvoid";
    ReturnValue = 0x48, "returnvalue";
    ConstructSuper = 0x49, "constructsuper";
    ConstructProp = 0x4A, "constructprop";
    CallPropLex = 0x4C, "callproplex";
    CallSuperVoid = 0x4E, "callsupervoid";
    CallPropVoid = 0x4F, "callpropvoid";
    ApplyType = 0x53, "applytype";
    NewObject = 0x55, "newobject";
    NewArray = 0x56, "newarray";
    NewActivation = 0x57, "newactivation";
    NewClass = 0x58, "newclass";
    GetDescendants = 0x59, "getdescendants";
    NewCatch = 0x5A, "newcatch";
    DelDescendants = 0x5B, "deldescendants";
    FindPropStrict = 0x5D, "findpropstrict";
    FindProperty = 0x5E, "findproperty";
    FindDef = 0x5F, "finddef";
    GetLex = 0x60, "getlex";
    SetProperty = 0x61, "setproperty";
    GetLocal = 0x62, "getlocal";
    SetLocal = 0x63, "setlocal";
    GetGlobalScope = 0x64, "getglobalscope";
    GetScopeObject = 0x65, "getscopeobject";
    GetProperty = 0x66, "getproperty";
    InitProperty = 0x68, "initproperty";
    DeleteProperty = 0x6A, "deleteproperty";
    GetSlot = 0x6C, "getslot";
    SetSlot = 0x6D, "setslot";
    ConvertS = 0x70, "convert_s";
    EscXelem = 0x71, "esc_xelem";
    EscXattr = 0x72, "esc_xattr";
    ConvertI = 0x73, "convert_i";
    ConvertU = 0x74, "convert_u";
    ConvertD = 0x75, "convert_d";
    ConvertB = 0x76, "convert_b";
    ConvertO = 0x77, "convert_o";
    CheckFilter = 0x78, "checkfilter";
    Coerce = 0x80, "coerce";
    CoerceA = 0x82, "coerce_a";
    CoerceS = 0x85, "coerce_s";
    AsType = 0x86, "astype";
    AsTypeLate = 0x87, "astypelate";
    CoerceO = 0x89, "coerce_o";
    Negate = 0x90, "negate";
    Increment = 0x91, "increment";
    IncLocal = 0x92, "inclocal";
    Decrement = 0x93, "decrement";
    DecLocal = 0x94, "declocal";
    TypeOf = 0x95, "typeof";
    Not = 0x96, "not";
    BitNot = 0x97, "bitnot";
    Add = 0xA0, "add";
    Subtract = 0xA1, "subtract";
    Multiply = 0xA2, "multiply";
    Divide = 0xA3, "divide";
    Modulo = 0xA4, "modulo";
    LShift = 0xA5, "lshift";
    RShift = 0xA6, "rshift";
    URShift = 0xA7, "urshift";
    BitAnd = 0xA8, "bitand";
    BitOr = 0xA9, "bitor";
    BitXor = 0xAA, "bitxor";
    Equals = 0xAB, "equals";
    StrictEquals = 0xAC, "strictequals";
    LessThan = 0xAD, "lessthan";
    LessEquals = 0xAE, "lessequals";
    GreaterThan = 0xAF, "greaterthan";
    GreaterEquals = 0xB0, "greaterequals";
    InstanceOf = 0xB1, "instanceof";
    IsType = 0xB2, "istype";
    IsTypeLate = 0xB3, "istypelate";
    In = 0xB4, "in";
    IncrementI = 0xC0, "increment_i";
    DecrementI = 0xC1, "decrement_i";
    IncLocalI = 0xC2, "inclocal_i";
    DecLocalI = 0xC3, "declocal_i";
    NegateI = 0xC4, "negate_i";
    AddI = 0xC5, "add_i";
    SubtractI = 0xC6, "subtract_i";
    MultiplyI = 0xC7, "multiply_i";
    GetLocal0 = 0xD0, "getlocal0";
    GetLocal1 = 0xD1, "getlocal1";
    GetLocal2 = 0xD2, "getlocal2";
    GetLocal3 = 0xD3, "getlocal3";
    SetLocal0 = 0xD4, "setlocal0";
    SetLocal1 = 0xD5, "setlocal1";
    SetLocal2 = 0xD6, "setlocal2";
    SetLocal3 = 0xD7, "setlocal3";
    Debug = 0xEF, "debug";
    DebugLine = 0xF0, "debugline";
    DebugFile = 0xF1, "debugfile";
    BkptLine = 0xF2, "bkptline";
    Timestamp = 0xF3, "timestamp";
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl Op {
    pub fn is_synthetic(self) -> bool {
        matches!(
            self,
            Op::Phi | Op::Arg | Op::XArg | Op::HasNext2O | Op::HasNext2I
        )
    }

    /// Values that live in a local register rather than on the operand stack.
    pub fn in_local(self) -> bool {
        matches!(self, Op::Arg | Op::HasNext2O | Op::HasNext2I)
    }

    pub fn on_scope(self) -> bool {
        matches!(self, Op::PushScope | Op::PushWith)
    }

    /// Whether the instruction leaves a result on the operand stack.
    pub fn on_stack(self) -> bool {
        !matches!(
            self,
            Op::Bkpt
                | Op::Nop
                | Op::Throw
                | Op::SetSuper
                | Op::Dxns
                | Op::DxnsLate
                | Op::Kill
                | Op::Label
                | Op::Jump
                | Op::LookupSwitch
                | Op::PushWith
                | Op::PushScope
                | Op::PopScope
                | Op::Pop
                | Op::Swap
                | Op::ReturnVoid
                | Op::ReturnValue
                | Op::ConstructSuper
                | Op::CallSuperVoid
                | Op::CallPropVoid
                | Op::SetProperty
                | Op::InitProperty
                | Op::SetLocal
                | Op::SetLocal0
                | Op::SetLocal1
                | Op::SetLocal2
                | Op::SetLocal3
                | Op::SetSlot
                | Op::CheckFilter
                | Op::IncLocal
                | Op::DecLocal
                | Op::IncLocalI
                | Op::DecLocalI
                | Op::Debug
                | Op::DebugLine
                | Op::DebugFile
                | Op::BkptLine
                | Op::Timestamp
                | Op::Phi
                | Op::Arg
                | Op::HasNext2O
                | Op::HasNext2I
        ) && !self.is_if()
    }

    /// Conditional branches, including the fused compare-and-branch forms.
    pub fn is_if(self) -> bool {
        matches!(
            self,
            Op::IfTrue
                | Op::IfFalse
                | Op::IfEq
                | Op::IfNe
                | Op::IfLt
                | Op::IfLe
                | Op::IfGt
                | Op::IfGe
                | Op::IfNlt
                | Op::IfNle
                | Op::IfNgt
                | Op::IfNge
                | Op::IfStrictEq
                | Op::IfStrictNe
        )
    }

    pub fn is_push_const(self) -> bool {
        matches!(
            self,
            Op::PushNull
                | Op::PushUndefined
                | Op::PushTrue
                | Op::PushFalse
                | Op::PushNan
                | Op::PushByte
                | Op::PushShort
                | Op::PushString
                | Op::PushInt
                | Op::PushUint
                | Op::PushDouble
                | Op::PushNamespace
        )
    }

    pub fn is_debug(self) -> bool {
        matches!(
            self,
            Op::Debug | Op::DebugLine | Op::DebugFile | Op::Bkpt | Op::BkptLine
        )
    }

    /// Operators whose only hazard is a valueOf/toString call on an
    /// object operand; they become pure once the operands are primitive.
    pub fn is_oper(self) -> bool {
        matches!(
            self,
            Op::Add
                | Op::Subtract
                | Op::Multiply
                | Op::Divide
                | Op::Modulo
                | Op::LShift
                | Op::RShift
                | Op::URShift
                | Op::BitAnd
                | Op::BitOr
                | Op::BitXor
                | Op::BitNot
                | Op::Equals
                | Op::LessThan
                | Op::LessEquals
                | Op::GreaterThan
                | Op::GreaterEquals
                | Op::Negate
                | Op::Increment
                | Op::Decrement
                | Op::AddI
                | Op::SubtractI
                | Op::MultiplyI
                | Op::NegateI
                | Op::IncrementI
                | Op::DecrementI
                | Op::ConvertI
                | Op::ConvertU
                | Op::ConvertD
                | Op::ConvertB
                | Op::ConvertS
                | Op::CoerceS
                | Op::EscXelem
                | Op::EscXattr
        )
    }

    /// Compare op folded into a fused branch, for the decoder's split of
    /// `if<cmp>` into compare + `iftrue`/`iffalse`.
    pub fn if_operator(self) -> Option<Op> {
        Some(match self {
            Op::IfNlt | Op::IfLt => Op::LessThan,
            Op::IfNle | Op::IfLe => Op::LessEquals,
            Op::IfNgt | Op::IfGt => Op::GreaterThan,
            Op::IfNge | Op::IfGe => Op::GreaterEquals,
            Op::IfNe | Op::IfEq => Op::Equals,
            Op::IfStrictNe | Op::IfStrictEq => Op::StrictEquals,
            _ => return None,
        })
    }

    /// Branch that jumps when the comparison holds (`negated == false`) or
    /// fails (`negated == true`).
    pub fn fused_if(cmp: Op, negated: bool) -> Option<Op> {
        Some(match (cmp, negated) {
            (Op::LessThan, false) => Op::IfLt,
            (Op::LessThan, true) => Op::IfNlt,
            (Op::LessEquals, false) => Op::IfLe,
            (Op::LessEquals, true) => Op::IfNle,
            (Op::GreaterThan, false) => Op::IfGt,
            (Op::GreaterThan, true) => Op::IfNgt,
            (Op::GreaterEquals, false) => Op::IfGe,
            (Op::GreaterEquals, true) => Op::IfNge,
            (Op::Equals, false) => Op::IfEq,
            (Op::Equals, true) => Op::IfNe,
            (Op::StrictEquals, false) => Op::IfStrictEq,
            (Op::StrictEquals, true) => Op::IfStrictNe,
            _ => return None,
        })
    }

    /// The branch taking the opposite successor for the same condition.
    pub fn inverted(self) -> Option<Op> {
        Some(match self {
            Op::IfTrue => Op::IfFalse,
            Op::IfFalse => Op::IfTrue,
            Op::IfEq => Op::IfNe,
            Op::IfNe => Op::IfEq,
            Op::IfLt => Op::IfNlt,
            Op::IfNlt => Op::IfLt,
            Op::IfLe => Op::IfNle,
            Op::IfNle => Op::IfLe,
            Op::IfGt => Op::IfNgt,
            Op::IfNgt => Op::IfGt,
            Op::IfGe => Op::IfNge,
            Op::IfNge => Op::IfGe,
            Op::IfStrictEq => Op::IfStrictNe,
            Op::IfStrictNe => Op::IfStrictEq,
            _ => return None,
        })
    }
}

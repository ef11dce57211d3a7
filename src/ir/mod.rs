// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! The in-memory IR consumed by every analysis in this crate.
//!
//! The model is deliberately narrow. Analyses only ever enumerate functions,
//! blocks, instructions and arguments, and ask an instruction for its opcode,
//! operands, result type bits, debug location and callee. Nothing here is
//! mutated after a module is built; analyses index values by identity.

use std::collections::HashMap;

use crate::util::bit_vec::Idx;

pub mod cfg;

macro_rules! ir_index {
    ($name:ident, $fmt:literal) => {
        #[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl Idx for $name {
            #[inline]
            fn new(idx: usize) -> Self {
                assert!(idx <= u32::MAX as usize);
                $name(idx as u32)
            }

            #[inline]
            fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, $fmt, self.0)
            }
        }
    };
}

ir_index!(ValueId, "v{}");
ir_index!(FuncId, "f{}");
ir_index!(GlobalId, "g{}");
ir_index!(InstId, "i{}");
ir_index!(BlockId, "bb{}");

/// The only type information the analyses consult.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct TypeInfo {
    pub is_pointer: bool,
    pub is_void: bool,
    pub addr_space: u32,
}

impl TypeInfo {
    pub fn pointer() -> Self {
        TypeInfo {
            is_pointer: true,
            ..Default::default()
        }
    }

    pub fn pointer_in(addr_space: u32) -> Self {
        TypeInfo {
            is_pointer: true,
            is_void: false,
            addr_space,
        }
    }

    pub fn void() -> Self {
        TypeInfo {
            is_void: true,
            ..Default::default()
        }
    }

    pub fn scalar() -> Self {
        TypeInfo::default()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DebugLoc {
    pub file: String,
    pub line: u32,
    pub col: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CastKind {
    Bitcast,
    /// An address-space cast that does not change the representation.
    NoopAddrSpaceCast,
    AddrSpaceCast,
    IntToPtr,
    PtrToInt,
    Other,
}

impl CastKind {
    /// Casts that are transparent for aliasing purposes.
    pub fn is_noop(self) -> bool {
        matches!(self, CastKind::Bitcast | CastKind::NoopAddrSpaceCast)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum GepKind {
    /// All indices are constant zero; the result is the base address.
    ZeroOffsets,
    /// A single constant structural offset (field number).
    Field(u32),
    /// A constant byte offset that is not a recognized field.
    ConstOffset(i64),
    /// At least one index is not a compile-time constant.
    Dynamic,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Callee {
    Direct(FuncId),
    /// The called operand for calls through a function pointer.
    Indirect(ValueId),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    Alloca,
    /// operands: [pointer]
    Load,
    /// operands: [value, pointer]
    Store,
    /// operands: [base]
    Gep(GepKind),
    /// operands: [value]
    Cast(CastKind),
    /// operands: the incoming values
    Phi,
    /// operands: [condition, true value, false value]
    Select,
    /// operands: the actual arguments
    Call(Callee),
    /// operands: [] or [returned value]
    Ret,
    Binary,
    Cmp,
    Other,
}

#[derive(Clone, Debug)]
pub struct Instruction {
    pub value: ValueId,
    pub func: FuncId,
    pub block: BlockId,
    pub index_in_block: u32,
    pub opcode: Opcode,
    pub operands: Vec<ValueId>,
    pub ty: TypeInfo,
    pub debug_loc: Option<DebugLoc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValueKind {
    Inst(InstId),
    Argument { func: FuncId, ordinal: u32 },
    Global(GlobalId),
    Function(FuncId),
    ConstantInt(i64),
    NullPtr { addr_space: u32 },
    ConstantOther,
}

#[derive(Clone, Debug)]
pub struct ValueInfo {
    pub kind: ValueKind,
    pub ty: TypeInfo,
}

#[derive(Clone, Debug, Default)]
pub struct BasicBlock {
    pub insts: Vec<InstId>,
    pub succs: Vec<BlockId>,
}

#[derive(Clone, Debug)]
pub struct Function {
    pub name: String,
    /// The value representing the function itself (used as a call operand).
    pub value: ValueId,
    pub params: Vec<ValueId>,
    pub ret_ty: TypeInfo,
    pub blocks: Vec<BasicBlock>,
    pub is_declaration: bool,
    pub is_variadic: bool,
    pub address_taken: bool,
}

impl Function {
    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

#[derive(Clone, Debug)]
pub struct Global {
    pub name: String,
    pub value: ValueId,
    /// Values whose addresses the initializer stores into this global.
    pub init_refs: Vec<ValueId>,
}

/// A call instruction paired with its containing function. One instruction
/// yields one `BaseCallSite` regardless of how many callees it resolves to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BaseCallSite {
    pub caller: FuncId,
    pub inst: InstId,
}

#[derive(Debug, Default)]
pub struct Module {
    pub name: String,
    functions: Vec<Function>,
    globals: Vec<Global>,
    values: Vec<ValueInfo>,
    insts: Vec<Instruction>,
    func_names: HashMap<String, FuncId>,
}

impl Module {
    pub fn new(name: &str) -> Self {
        Module {
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[inline]
    pub fn num_functions(&self) -> usize {
        self.functions.len()
    }

    #[inline]
    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    pub fn func_ids(&self) -> impl Iterator<Item = FuncId> {
        (0..self.functions.len() as u32).map(FuncId)
    }

    #[inline]
    pub fn func(&self, f: FuncId) -> &Function {
        &self.functions[f.index()]
    }

    pub fn func_by_name(&self, name: &str) -> Option<FuncId> {
        self.func_names.get(name).copied()
    }

    pub fn globals(&self) -> &[Global] {
        &self.globals
    }

    #[inline]
    pub fn value(&self, v: ValueId) -> &ValueInfo {
        &self.values[v.index()]
    }

    #[inline]
    pub fn inst(&self, i: InstId) -> &Instruction {
        &self.insts[i.index()]
    }

    pub fn inst_ids(&self, f: FuncId) -> impl Iterator<Item = InstId> + '_ {
        self.func(f)
            .blocks
            .iter()
            .flat_map(|b| b.insts.iter().copied())
    }

    /// The instruction defining `v`, if `v` is an instruction result.
    pub fn inst_of_value(&self, v: ValueId) -> Option<InstId> {
        match self.value(v).kind {
            ValueKind::Inst(i) => Some(i),
            _ => None,
        }
    }

    /// The function a value is local to (instruction results and arguments).
    pub fn func_of_value(&self, v: ValueId) -> Option<FuncId> {
        match self.value(v).kind {
            ValueKind::Inst(i) => Some(self.inst(i).func),
            ValueKind::Argument { func, .. } => Some(func),
            _ => None,
        }
    }

    #[inline]
    pub fn value_is_pointer(&self, v: ValueId) -> bool {
        self.value(v).ty.is_pointer
    }

    pub fn value_is_null(&self, v: ValueId) -> bool {
        matches!(self.value(v).kind, ValueKind::NullPtr { .. })
    }

    /// All `Ret` operand values of a function.
    pub fn ret_values(&self, f: FuncId) -> Vec<ValueId> {
        let mut rets = Vec::new();
        for i in self.inst_ids(f) {
            let inst = self.inst(i);
            if matches!(inst.opcode, Opcode::Ret) {
                if let Some(v) = inst.operands.first() {
                    rets.push(*v);
                }
            }
        }
        rets
    }

    pub fn call_sites(&self, f: FuncId) -> Vec<(InstId, Callee)> {
        let mut calls = Vec::new();
        for i in self.inst_ids(f) {
            if let Opcode::Call(callee) = self.inst(i).opcode {
                calls.push((i, callee));
            }
        }
        calls
    }

    /// Functions whose address escapes into data flow; the candidate set for
    /// indirect call resolution.
    pub fn address_taken_funcs(&self) -> Vec<FuncId> {
        self.func_ids()
            .filter(|f| self.func(*f).address_taken)
            .collect()
    }

    // ---- construction ----

    fn add_value(&mut self, kind: ValueKind, ty: TypeInfo) -> ValueId {
        let id = ValueId::new(self.values.len());
        self.values.push(ValueInfo { kind, ty });
        id
    }

    pub fn const_int(&mut self, value: i64) -> ValueId {
        self.add_value(ValueKind::ConstantInt(value), TypeInfo::scalar())
    }

    pub fn null_ptr(&mut self, addr_space: u32) -> ValueId {
        self.add_value(
            ValueKind::NullPtr { addr_space },
            TypeInfo::pointer_in(addr_space),
        )
    }

    /// The value naming a function; requesting it marks the function
    /// address-taken.
    pub fn func_value(&mut self, f: FuncId) -> ValueId {
        self.functions[f.index()].address_taken = true;
        self.functions[f.index()].value
    }

    pub fn add_global(&mut self, name: &str) -> GlobalId {
        let gid = GlobalId::new(self.globals.len());
        let value = self.add_value(ValueKind::Global(gid), TypeInfo::pointer());
        self.globals.push(Global {
            name: name.to_string(),
            value,
            init_refs: Vec::new(),
        });
        gid
    }

    pub fn global_value(&self, g: GlobalId) -> ValueId {
        self.globals[g.index()].value
    }

    /// Records that the initializer of `g` stores the address of `target`.
    pub fn add_global_init(&mut self, g: GlobalId, target: ValueId) {
        self.globals[g.index()].init_refs.push(target);
    }

    pub fn declare_function(
        &mut self,
        name: &str,
        param_tys: &[TypeInfo],
        ret_ty: TypeInfo,
        is_variadic: bool,
    ) -> FuncId {
        self.new_function(name, param_tys, ret_ty, is_variadic, true)
    }

    pub fn define_function(
        &mut self,
        name: &str,
        param_tys: &[TypeInfo],
        ret_ty: TypeInfo,
    ) -> FuncId {
        self.new_function(name, param_tys, ret_ty, false, false)
    }

    pub fn define_variadic_function(
        &mut self,
        name: &str,
        param_tys: &[TypeInfo],
        ret_ty: TypeInfo,
    ) -> FuncId {
        self.new_function(name, param_tys, ret_ty, true, false)
    }

    fn new_function(
        &mut self,
        name: &str,
        param_tys: &[TypeInfo],
        ret_ty: TypeInfo,
        is_variadic: bool,
        is_declaration: bool,
    ) -> FuncId {
        let f = FuncId::new(self.functions.len());
        let value = self.add_value(ValueKind::Function(f), TypeInfo::pointer());
        let params = param_tys
            .iter()
            .enumerate()
            .map(|(ordinal, ty)| {
                self.add_value(
                    ValueKind::Argument {
                        func: f,
                        ordinal: ordinal as u32,
                    },
                    *ty,
                )
            })
            .collect();
        self.functions.push(Function {
            name: name.to_string(),
            value,
            params,
            ret_ty,
            blocks: Vec::new(),
            is_declaration,
            is_variadic,
            address_taken: false,
        });
        self.func_names.insert(name.to_string(), f);
        f
    }

    /// Starts appending a body to `f`; panics when `f` is a declaration.
    pub fn build_function(&mut self, f: FuncId) -> FunctionBuilder<'_> {
        assert!(
            !self.func(f).is_declaration,
            "cannot attach a body to a declaration"
        );
        FunctionBuilder { module: self, func: f }
    }
}

/// Appends blocks and instructions to one function.
///
/// The builder is the write side of the loader contract: loaders and tests
/// both go through it, and nothing downstream ever mutates the module.
pub struct FunctionBuilder<'m> {
    module: &'m mut Module,
    func: FuncId,
}

impl<'m> FunctionBuilder<'m> {
    pub fn func_id(&self) -> FuncId {
        self.func
    }

    pub fn module(&mut self) -> &mut Module {
        self.module
    }

    pub fn block(&mut self) -> BlockId {
        let blocks = &mut self.module.functions[self.func.index()].blocks;
        let id = BlockId::new(blocks.len());
        blocks.push(BasicBlock::default());
        id
    }

    /// Adds a control-flow edge between two blocks.
    pub fn br(&mut self, from: BlockId, to: BlockId) {
        let blocks = &mut self.module.functions[self.func.index()].blocks;
        if !blocks[from.index()].succs.contains(&to) {
            blocks[from.index()].succs.push(to);
        }
    }

    pub fn param(&self, ordinal: usize) -> ValueId {
        self.module.func(self.func).params[ordinal]
    }

    fn push_inst(
        &mut self,
        block: BlockId,
        opcode: Opcode,
        operands: Vec<ValueId>,
        ty: TypeInfo,
    ) -> ValueId {
        let inst_id = InstId::new(self.module.insts.len());
        let value = self.module.add_value(ValueKind::Inst(inst_id), ty);
        let function = &mut self.module.functions[self.func.index()];
        let index_in_block = function.blocks[block.index()].insts.len() as u32;
        function.blocks[block.index()].insts.push(inst_id);
        self.module.insts.push(Instruction {
            value,
            func: self.func,
            block,
            index_in_block,
            opcode,
            operands,
            ty,
            debug_loc: None,
        });
        value
    }

    pub fn set_debug_loc(&mut self, v: ValueId, file: &str, line: u32, col: u32) {
        if let Some(i) = self.module.inst_of_value(v) {
            self.module.insts[i.index()].debug_loc = Some(DebugLoc {
                file: file.to_string(),
                line,
                col,
            });
        }
    }

    pub fn alloca(&mut self, block: BlockId) -> ValueId {
        self.push_inst(block, Opcode::Alloca, vec![], TypeInfo::pointer())
    }

    pub fn load(&mut self, block: BlockId, ptr: ValueId, ty: TypeInfo) -> ValueId {
        self.push_inst(block, Opcode::Load, vec![ptr], ty)
    }

    pub fn store(&mut self, block: BlockId, value: ValueId, ptr: ValueId) -> ValueId {
        self.push_inst(block, Opcode::Store, vec![value, ptr], TypeInfo::void())
    }

    pub fn gep_zero(&mut self, block: BlockId, base: ValueId) -> ValueId {
        self.push_inst(
            block,
            Opcode::Gep(GepKind::ZeroOffsets),
            vec![base],
            TypeInfo::pointer(),
        )
    }

    pub fn gep_field(&mut self, block: BlockId, base: ValueId, field: u32) -> ValueId {
        self.push_inst(
            block,
            Opcode::Gep(GepKind::Field(field)),
            vec![base],
            TypeInfo::pointer(),
        )
    }

    pub fn gep_offset(&mut self, block: BlockId, base: ValueId, offset: i64) -> ValueId {
        self.push_inst(
            block,
            Opcode::Gep(GepKind::ConstOffset(offset)),
            vec![base],
            TypeInfo::pointer(),
        )
    }

    pub fn gep_dynamic(&mut self, block: BlockId, base: ValueId, index: ValueId) -> ValueId {
        self.push_inst(
            block,
            Opcode::Gep(GepKind::Dynamic),
            vec![base, index],
            TypeInfo::pointer(),
        )
    }

    pub fn cast(&mut self, block: BlockId, kind: CastKind, v: ValueId, ty: TypeInfo) -> ValueId {
        self.push_inst(block, Opcode::Cast(kind), vec![v], ty)
    }

    pub fn bitcast(&mut self, block: BlockId, v: ValueId) -> ValueId {
        self.cast(block, CastKind::Bitcast, v, TypeInfo::pointer())
    }

    pub fn ptr_to_int(&mut self, block: BlockId, v: ValueId) -> ValueId {
        self.cast(block, CastKind::PtrToInt, v, TypeInfo::scalar())
    }

    pub fn int_to_ptr(&mut self, block: BlockId, v: ValueId) -> ValueId {
        self.cast(block, CastKind::IntToPtr, v, TypeInfo::pointer())
    }

    pub fn phi(&mut self, block: BlockId, incoming: &[ValueId], ty: TypeInfo) -> ValueId {
        self.push_inst(block, Opcode::Phi, incoming.to_vec(), ty)
    }

    pub fn select(
        &mut self,
        block: BlockId,
        cond: ValueId,
        tval: ValueId,
        fval: ValueId,
        ty: TypeInfo,
    ) -> ValueId {
        self.push_inst(block, Opcode::Select, vec![cond, tval, fval], ty)
    }

    pub fn call(
        &mut self,
        block: BlockId,
        callee: FuncId,
        args: &[ValueId],
        ret_ty: TypeInfo,
    ) -> ValueId {
        self.push_inst(
            block,
            Opcode::Call(Callee::Direct(callee)),
            args.to_vec(),
            ret_ty,
        )
    }

    pub fn call_indirect(
        &mut self,
        block: BlockId,
        callee: ValueId,
        args: &[ValueId],
        ret_ty: TypeInfo,
    ) -> ValueId {
        self.push_inst(
            block,
            Opcode::Call(Callee::Indirect(callee)),
            args.to_vec(),
            ret_ty,
        )
    }

    pub fn ret(&mut self, block: BlockId, value: Option<ValueId>) {
        let operands = value.into_iter().collect();
        self.push_inst(block, Opcode::Ret, operands, TypeInfo::void());
    }

    pub fn binary(&mut self, block: BlockId, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.push_inst(block, Opcode::Binary, vec![lhs, rhs], TypeInfo::scalar())
    }
}

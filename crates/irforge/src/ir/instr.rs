//! Block IR: instructions, terminators, and functions
//!
//! The facade emits into this small register-based IR; the backend lowers
//! it to Cranelift IR when a module is handed to the JIT. Instructions
//! operate on typed virtual registers grouped into named blocks with
//! explicit terminators (one block per code section).

use rustc_hash::FxHashMap;

/// Virtual register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reg(pub u32);

impl std::fmt::Display for Reg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Basic-block identifier; index into [`FuncIr::blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Machine-level value type of a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IrType {
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    /// Host pointer (also carries vector values as stack-slot addresses).
    Ptr,
}

impl IrType {
    pub fn bytes(self) -> u32 {
        match self {
            IrType::I8 => 1,
            IrType::I16 => 2,
            IrType::I32 => 4,
            IrType::I64 => 8,
            IrType::F32 => 4,
            IrType::F64 => 8,
            IrType::Ptr => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, IrType::F32 | IrType::F64)
    }

    pub fn is_int(self) -> bool {
        matches!(self, IrType::I8 | IrType::I16 | IrType::I32 | IrType::I64)
    }
}

impl std::fmt::Display for IrType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IrType::I8 => "i8",
            IrType::I16 => "i16",
            IrType::I32 => "i32",
            IrType::I64 => "i64",
            IrType::F32 => "f32",
            IrType::F64 => "f64",
            IrType::Ptr => "ptr",
        };
        f.write_str(s)
    }
}

/// Two-operand arithmetic flavor; signedness is resolved when the facade
/// builds the instruction, not at lowering time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    IAdd,
    ISub,
    IMul,
    SDiv,
    UDiv,
    SRem,
    URem,
    FAdd,
    FSub,
    FMul,
    FDiv,
    FRem,
}

impl BinOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            BinOp::IAdd => "iadd",
            BinOp::ISub => "isub",
            BinOp::IMul => "imul",
            BinOp::SDiv => "sdiv",
            BinOp::UDiv => "udiv",
            BinOp::SRem => "srem",
            BinOp::URem => "urem",
            BinOp::FAdd => "fadd",
            BinOp::FSub => "fsub",
            BinOp::FMul => "fmul",
            BinOp::FDiv => "fdiv",
            BinOp::FRem => "frem",
        }
    }

    /// Commutative and associative over the same operand type.
    pub fn is_reassociable(self) -> bool {
        matches!(self, BinOp::IAdd | BinOp::IMul)
    }
}

/// Comparison condition; combined with a signedness flag for integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpCc {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpCc {
    pub fn mnemonic(self) -> &'static str {
        match self {
            CmpCc::Eq => "eq",
            CmpCc::Ne => "ne",
            CmpCc::Lt => "lt",
            CmpCc::Le => "le",
            CmpCc::Gt => "gt",
            CmpCc::Ge => "ge",
        }
    }
}

/// An IR instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    IConst { dest: Reg, ty: IrType, value: i64 },
    FConst { dest: Reg, ty: IrType, value: f64 },
    Binary { dest: Reg, op: BinOp, lhs: Reg, rhs: Reg },
    IntCmp { dest: Reg, cc: CmpCc, signed: bool, lhs: Reg, rhs: Reg },
    FloatCmp { dest: Reg, cc: CmpCc, lhs: Reg, rhs: Reg },
    Select { dest: Reg, cond: Reg, then_val: Reg, else_val: Reg },

    // Integer width changes and int/float conversions.
    Extend { dest: Reg, ty: IrType, src: Reg, signed: bool },
    Reduce { dest: Reg, ty: IrType, src: Reg },
    FPromote { dest: Reg, src: Reg },
    FDemote { dest: Reg, src: Reg },
    FloatToInt { dest: Reg, ty: IrType, src: Reg, signed: bool },
    IntToFloat { dest: Reg, ty: IrType, src: Reg, signed: bool },

    // Memory.
    StackAlloc { dest: Reg, size: u32, align: u32 },
    Load { dest: Reg, ty: IrType, addr: Reg, offset: i32 },
    Store { addr: Reg, value: Reg, offset: i32 },
    PtrAddImm { dest: Reg, base: Reg, offset: i64 },
    PtrAdd { dest: Reg, base: Reg, offset: Reg },
    MemCopy { dest: Reg, src: Reg, size: u32, align: u32 },

    Call {
        dest: Option<Reg>,
        symbol: String,
        params: Vec<IrType>,
        ret: Option<IrType>,
        args: Vec<Reg>,
    },

    Move { dest: Reg, src: Reg },
}

impl Instr {
    /// Destination register, when the instruction produces a value.
    pub fn dest(&self) -> Option<Reg> {
        match self {
            Instr::IConst { dest, .. }
            | Instr::FConst { dest, .. }
            | Instr::Binary { dest, .. }
            | Instr::IntCmp { dest, .. }
            | Instr::FloatCmp { dest, .. }
            | Instr::Select { dest, .. }
            | Instr::Extend { dest, .. }
            | Instr::Reduce { dest, .. }
            | Instr::FPromote { dest, .. }
            | Instr::FDemote { dest, .. }
            | Instr::FloatToInt { dest, .. }
            | Instr::IntToFloat { dest, .. }
            | Instr::StackAlloc { dest, .. }
            | Instr::Load { dest, .. }
            | Instr::PtrAddImm { dest, .. }
            | Instr::PtrAdd { dest, .. }
            | Instr::Move { dest, .. } => Some(*dest),
            Instr::Call { dest, .. } => *dest,
            Instr::Store { .. } | Instr::MemCopy { .. } => None,
        }
    }

    /// Whether the instruction can be removed or deduplicated freely.
    pub fn is_pure(&self) -> bool {
        !matches!(
            self,
            Instr::Store { .. } | Instr::MemCopy { .. } | Instr::Call { .. } | Instr::StackAlloc { .. }
        )
    }
}

/// How a block terminates.
#[derive(Debug, Clone, PartialEq)]
pub enum Terminator {
    /// Not yet sealed.
    None,
    Return(Option<Reg>),
    Jump(BlockId),
    Branch { cond: Reg, then_block: BlockId, else_block: BlockId },
}

/// A basic block; one per code section.
#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    pub name: String,
    pub instrs: Vec<Instr>,
    pub terminator: Terminator,
}

/// A complete IR function. The first block added is the entry block and
/// receives the single context argument.
#[derive(Debug, Clone)]
pub struct FuncIr {
    pub name: String,
    pub ctx_ty: IrType,
    pub ret_ty: IrType,
    pub blocks: Vec<Block>,
    pub next_reg: u32,
    pub reg_types: FxHashMap<Reg, IrType>,
    pub ctx_reg: Reg,
}

impl Default for FuncIr {
    fn default() -> Self {
        FuncIr {
            name: String::new(),
            ctx_ty: IrType::Ptr,
            ret_ty: IrType::I32,
            blocks: vec![],
            next_reg: 0,
            reg_types: FxHashMap::default(),
            ctx_reg: Reg(0),
        }
    }
}

impl FuncIr {
    pub fn new(name: String, ctx_ty: IrType, ret_ty: IrType) -> Self {
        let mut func = FuncIr { name, ctx_ty, ret_ty, ..FuncIr::default() };
        func.ctx_reg = func.alloc_reg(ctx_ty);
        func
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_empty() && self.blocks.is_empty()
    }

    pub fn alloc_reg(&mut self, ty: IrType) -> Reg {
        let reg = Reg(self.next_reg);
        self.next_reg += 1;
        self.reg_types.insert(reg, ty);
        reg
    }

    pub fn reg_type(&self, reg: Reg) -> IrType {
        self.reg_types.get(&reg).copied().unwrap_or(IrType::I64)
    }

    pub fn add_block(&mut self, name: impl Into<String>) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block { id, name: name.into(), instrs: vec![], terminator: Terminator::None });
        id
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0 as usize]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.0 as usize]
    }

    pub fn instr_count(&self) -> usize {
        self.blocks.iter().map(|b| b.instrs.len()).sum()
    }

    /// Structural check: the entry block exists and every block that holds
    /// code or is a jump target carries a terminator.
    pub fn verify(&self) -> Result<(), String> {
        if self.blocks.is_empty() {
            return Err(format!("function {}: no blocks", self.name));
        }
        let mut referenced = vec![false; self.blocks.len()];
        referenced[0] = true;
        for block in &self.blocks {
            match &block.terminator {
                Terminator::Jump(t) => referenced[t.0 as usize] = true,
                Terminator::Branch { then_block, else_block, .. } => {
                    referenced[then_block.0 as usize] = true;
                    referenced[else_block.0 as usize] = true;
                }
                _ => {}
            }
        }
        for block in &self.blocks {
            let needs_terminator = referenced[block.id.0 as usize] || !block.instrs.is_empty();
            if needs_terminator && block.terminator == Terminator::None {
                return Err(format!(
                    "function {}: block {} ({}) has no terminator",
                    self.name, block.id, block.name
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_block_and_regs() {
        let mut func = FuncIr::new("f".to_string(), IrType::Ptr, IrType::I32);
        assert_eq!(func.reg_type(func.ctx_reg), IrType::Ptr);
        let b0 = func.add_block("body");
        assert_eq!(b0, BlockId(0));
        let r = func.alloc_reg(IrType::I32);
        func.block_mut(b0).instrs.push(Instr::IConst { dest: r, ty: IrType::I32, value: 3 });
        assert_eq!(func.instr_count(), 1);
    }

    #[test]
    fn test_verify_requires_terminators() {
        let mut func = FuncIr::new("f".to_string(), IrType::Ptr, IrType::I32);
        let b0 = func.add_block("body");
        assert!(func.verify().is_err());

        let r = func.alloc_reg(IrType::I32);
        func.block_mut(b0).instrs.push(Instr::IConst { dest: r, ty: IrType::I32, value: 0 });
        func.block_mut(b0).terminator = Terminator::Return(Some(r));
        assert!(func.verify().is_ok());
    }

    #[test]
    fn test_verify_unreferenced_empty_block_ok() {
        let mut func = FuncIr::new("f".to_string(), IrType::Ptr, IrType::I32);
        let b0 = func.add_block("body");
        let _spare = func.add_block("never_entered");
        let r = func.alloc_reg(IrType::I32);
        func.block_mut(b0).instrs.push(Instr::IConst { dest: r, ty: IrType::I32, value: 0 });
        func.block_mut(b0).terminator = Terminator::Return(Some(r));
        assert!(func.verify().is_ok());
    }

    #[test]
    fn test_verify_branch_target_needs_terminator() {
        let mut func = FuncIr::new("f".to_string(), IrType::Ptr, IrType::I32);
        let b0 = func.add_block("body");
        let b1 = func.add_block("next");
        func.block_mut(b0).terminator = Terminator::Jump(b1);
        assert!(func.verify().is_err());

        let r = func.alloc_reg(IrType::I32);
        func.block_mut(b1).instrs.push(Instr::IConst { dest: r, ty: IrType::I32, value: 0 });
        func.block_mut(b1).terminator = Terminator::Return(Some(r));
        assert!(func.verify().is_ok());
    }
}

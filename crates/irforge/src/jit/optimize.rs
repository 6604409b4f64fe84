//! Function-level optimization passes on the block IR
//!
//! Each pass implements [`OptPass`] and transforms a `FuncIr` in place.
//! The default pipeline is combine (constant folding and algebraic
//! identities), reassociate (merging constant chains of commutative
//! ops), and local value numbering. Pass-instrumentation callbacks fire
//! before and after each pass for tracing.

use rustc_hash::FxHashMap;

use crate::ir::{BinOp, CmpCc, FuncIr, Instr, IrType, Reg};

/// An optimization pass over one function.
pub trait OptPass {
    /// Pass name, reported to instrumentation callbacks.
    fn name(&self) -> &str;
    fn run(&self, func: &mut FuncIr);
}

type PassCallback = Box<dyn Fn(&str, &FuncIr)>;

/// Pipeline of passes with before/after instrumentation.
pub struct FunctionOptimizer {
    passes: Vec<Box<dyn OptPass>>,
    before: Vec<PassCallback>,
    after: Vec<PassCallback>,
}

impl FunctionOptimizer {
    /// The default pipeline: combine, reassociate, value numbering.
    pub fn new() -> Self {
        FunctionOptimizer {
            passes: vec![
                Box::new(CombinePass),
                Box::new(ReassociatePass),
                Box::new(ValueNumberingPass),
            ],
            before: vec![],
            after: vec![],
        }
    }

    pub fn empty() -> Self {
        FunctionOptimizer { passes: vec![], before: vec![], after: vec![] }
    }

    pub fn add_pass(&mut self, pass: Box<dyn OptPass>) {
        self.passes.push(pass);
    }

    pub fn on_before_pass(&mut self, cb: impl Fn(&str, &FuncIr) + 'static) {
        self.before.push(Box::new(cb));
    }

    pub fn on_after_pass(&mut self, cb: impl Fn(&str, &FuncIr) + 'static) {
        self.after.push(Box::new(cb));
    }

    pub fn run(&self, func: &mut FuncIr) {
        for pass in &self.passes {
            for cb in &self.before {
                cb(pass.name(), func);
            }
            pass.run(func);
            for cb in &self.after {
                cb(pass.name(), func);
            }
        }
    }
}

impl Default for FunctionOptimizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Sign-extend `value` to the width of `ty` so folded constants match
/// what the backend would compute.
fn normalize(ty: IrType, value: i64) -> i64 {
    match ty {
        IrType::I8 => value as i8 as i64,
        IrType::I16 => value as i16 as i64,
        IrType::I32 => value as i32 as i64,
        _ => value,
    }
}

fn fold_arith(op: BinOp, ty: IrType, a: i64, b: i64) -> Option<i64> {
    let v = match op {
        BinOp::IAdd => a.wrapping_add(b),
        BinOp::ISub => a.wrapping_sub(b),
        BinOp::IMul => a.wrapping_mul(b),
        BinOp::SDiv => {
            if b == 0 {
                return None;
            }
            a.checked_div(b)?
        }
        BinOp::SRem => {
            if b == 0 {
                return None;
            }
            a.checked_rem(b)?
        }
        BinOp::UDiv => {
            if b == 0 {
                return None;
            }
            ((a as u64) / (b as u64)) as i64
        }
        BinOp::URem => {
            if b == 0 {
                return None;
            }
            ((a as u64) % (b as u64)) as i64
        }
        _ => return None,
    };
    Some(normalize(ty, v))
}

fn fold_cmp(cc: CmpCc, signed: bool, a: i64, b: i64) -> bool {
    match cc {
        CmpCc::Eq => a == b,
        CmpCc::Ne => a != b,
        CmpCc::Lt => {
            if signed {
                a < b
            } else {
                (a as u64) < (b as u64)
            }
        }
        CmpCc::Le => {
            if signed {
                a <= b
            } else {
                (a as u64) <= (b as u64)
            }
        }
        CmpCc::Gt => {
            if signed {
                a > b
            } else {
                (a as u64) > (b as u64)
            }
        }
        CmpCc::Ge => {
            if signed {
                a >= b
            } else {
                (a as u64) >= (b as u64)
            }
        }
    }
}

/// Constant folding and algebraic identities within each block.
pub struct CombinePass;

impl OptPass for CombinePass {
    fn name(&self) -> &str {
        "combine"
    }

    fn run(&self, func: &mut FuncIr) {
        for block in &mut func.blocks {
            let mut consts: FxHashMap<Reg, (IrType, i64)> = FxHashMap::default();
            for instr in &mut block.instrs {
                let replacement = match instr {
                    Instr::IConst { dest, ty, value } => {
                        consts.insert(*dest, (*ty, *value));
                        None
                    }
                    Instr::Binary { dest, op, lhs, rhs } => {
                        let lc = consts.get(lhs).copied();
                        let rc = consts.get(rhs).copied();
                        match (lc, rc) {
                            (Some((ty, a)), Some((_, b))) => fold_arith(*op, ty, a, b)
                                .map(|value| Instr::IConst { dest: *dest, ty, value }),
                            (None, Some((_, 0))) if matches!(*op, BinOp::IAdd | BinOp::ISub) => {
                                Some(Instr::Move { dest: *dest, src: *lhs })
                            }
                            (Some((_, 0)), None) if *op == BinOp::IAdd => {
                                Some(Instr::Move { dest: *dest, src: *rhs })
                            }
                            (None, Some((_, 1))) if *op == BinOp::IMul => {
                                Some(Instr::Move { dest: *dest, src: *lhs })
                            }
                            (Some((_, 1)), None) if *op == BinOp::IMul => {
                                Some(Instr::Move { dest: *dest, src: *rhs })
                            }
                            _ => None,
                        }
                    }
                    Instr::IntCmp { dest, cc, signed, lhs, rhs } => {
                        match (consts.get(lhs), consts.get(rhs)) {
                            (Some((_, a)), Some((_, b))) => {
                                let value = fold_cmp(*cc, *signed, *a, *b) as i64;
                                Some(Instr::IConst { dest: *dest, ty: IrType::I8, value })
                            }
                            _ => None,
                        }
                    }
                    _ => None,
                };
                if let Some(new_instr) = replacement {
                    if let Instr::IConst { dest, ty, value } = &new_instr {
                        consts.insert(*dest, (*ty, *value));
                    }
                    *instr = new_instr;
                }
            }
        }
    }
}

/// Merge `(x op c1) op c2` into `x op (c1 op c2)` for commutative,
/// associative integer ops.
pub struct ReassociatePass;

impl OptPass for ReassociatePass {
    fn name(&self) -> &str {
        "reassociate"
    }

    fn run(&self, func: &mut FuncIr) {
        for block_idx in 0..func.blocks.len() {
            let instrs = std::mem::take(&mut func.blocks[block_idx].instrs);
            let mut consts: FxHashMap<Reg, i64> = FxHashMap::default();
            // dest -> (base operand, accumulated constant)
            let mut chains: FxHashMap<Reg, (BinOp, Reg, i64)> = FxHashMap::default();
            let mut rebuilt = Vec::with_capacity(instrs.len());
            for instr in instrs {
                match &instr {
                    Instr::IConst { dest, value, .. } => {
                        consts.insert(*dest, *value);
                        rebuilt.push(instr);
                    }
                    Instr::Binary { dest, op, lhs, rhs } if op.is_reassociable() => {
                        // Canonicalize the constant operand to the right.
                        let (base, konst) = match (consts.get(lhs), consts.get(rhs)) {
                            (None, Some(c)) => (Some(*lhs), Some(*c)),
                            (Some(c), None) => (Some(*rhs), Some(*c)),
                            _ => (None, None),
                        };
                        let (Some(base), Some(konst)) = (base, konst) else {
                            rebuilt.push(instr);
                            continue;
                        };
                        let ty = func.reg_type(*dest);
                        if let Some(&(chain_op, chain_base, chain_c)) = chains.get(&base) {
                            if chain_op == *op {
                                let merged = match op {
                                    BinOp::IAdd => chain_c.wrapping_add(konst),
                                    _ => chain_c.wrapping_mul(konst),
                                };
                                let merged = normalize(ty, merged);
                                let const_reg = func.alloc_reg(ty);
                                rebuilt.push(Instr::IConst { dest: const_reg, ty, value: merged });
                                rebuilt.push(Instr::Binary {
                                    dest: *dest,
                                    op: *op,
                                    lhs: chain_base,
                                    rhs: const_reg,
                                });
                                consts.insert(const_reg, merged);
                                chains.insert(*dest, (*op, chain_base, merged));
                                continue;
                            }
                        }
                        chains.insert(*dest, (*op, base, konst));
                        rebuilt.push(instr);
                    }
                    _ => rebuilt.push(instr),
                }
            }
            func.blocks[block_idx].instrs = rebuilt;
        }
    }
}

/// Local value numbering: identical pure instructions within a block
/// collapse to the first occurrence. Memory clobbers reset the table.
pub struct ValueNumberingPass;

fn vn_key(instr: &Instr) -> Option<String> {
    if !instr.is_pure() {
        return None;
    }
    let mut keyed = instr.clone();
    match &mut keyed {
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
        | Instr::Load { dest, .. }
        | Instr::PtrAddImm { dest, .. }
        | Instr::PtrAdd { dest, .. }
        | Instr::Move { dest, .. } => *dest = Reg(u32::MAX),
        _ => return None,
    }
    Some(format!("{:?}", keyed))
}

impl OptPass for ValueNumberingPass {
    fn name(&self) -> &str {
        "gvn"
    }

    fn run(&self, func: &mut FuncIr) {
        for block in &mut func.blocks {
            let mut table: FxHashMap<String, Reg> = FxHashMap::default();
            for instr in &mut block.instrs {
                if matches!(instr, Instr::Store { .. } | Instr::MemCopy { .. } | Instr::Call { .. }) {
                    // Conservative: memory effects invalidate the table.
                    table.clear();
                    continue;
                }
                let Some(key) = vn_key(instr) else {
                    continue;
                };
                let Some(dest) = instr.dest() else {
                    continue;
                };
                match table.get(&key) {
                    Some(&first) => {
                        *instr = Instr::Move { dest, src: first };
                    }
                    None => {
                        table.insert(key, dest);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Terminator;

    fn func_with_instrs(instrs: Vec<Instr>, ret: Reg) -> FuncIr {
        let mut func = FuncIr::new("f".to_string(), IrType::Ptr, IrType::I32);
        let b0 = func.add_block("body");
        func.blocks[b0.0 as usize].instrs = instrs;
        func.blocks[b0.0 as usize].terminator = Terminator::Return(Some(ret));
        func
    }

    #[test]
    fn test_combine_folds_constant_add() {
        let mut func = FuncIr::new("f".to_string(), IrType::Ptr, IrType::I32);
        let b0 = func.add_block("body");
        let r1 = func.alloc_reg(IrType::I32);
        let r2 = func.alloc_reg(IrType::I32);
        let r3 = func.alloc_reg(IrType::I32);
        func.block_mut(b0).instrs = vec![
            Instr::IConst { dest: r1, ty: IrType::I32, value: 3 },
            Instr::IConst { dest: r2, ty: IrType::I32, value: 5 },
            Instr::Binary { dest: r3, op: BinOp::IAdd, lhs: r1, rhs: r2 },
        ];
        func.block_mut(b0).terminator = Terminator::Return(Some(r3));

        CombinePass.run(&mut func);
        assert_eq!(
            func.block(b0).instrs[2],
            Instr::IConst { dest: r3, ty: IrType::I32, value: 8 }
        );
    }

    #[test]
    fn test_combine_skips_division_by_zero() {
        let mut func = FuncIr::new("f".to_string(), IrType::Ptr, IrType::I32);
        let b0 = func.add_block("body");
        let r1 = func.alloc_reg(IrType::I32);
        let r2 = func.alloc_reg(IrType::I32);
        let r3 = func.alloc_reg(IrType::I32);
        func.block_mut(b0).instrs = vec![
            Instr::IConst { dest: r1, ty: IrType::I32, value: 3 },
            Instr::IConst { dest: r2, ty: IrType::I32, value: 0 },
            Instr::Binary { dest: r3, op: BinOp::SDiv, lhs: r1, rhs: r2 },
        ];
        func.block_mut(b0).terminator = Terminator::Return(Some(r3));

        CombinePass.run(&mut func);
        assert!(matches!(func.block(b0).instrs[2], Instr::Binary { .. }));
    }

    #[test]
    fn test_combine_add_zero_identity() {
        let mut func = FuncIr::new("f".to_string(), IrType::Ptr, IrType::I32);
        let b0 = func.add_block("body");
        let x = func.alloc_reg(IrType::I32);
        let z = func.alloc_reg(IrType::I32);
        let r = func.alloc_reg(IrType::I32);
        func.block_mut(b0).instrs = vec![
            Instr::Load { dest: x, ty: IrType::I32, addr: func.ctx_reg, offset: 0 },
            Instr::IConst { dest: z, ty: IrType::I32, value: 0 },
            Instr::Binary { dest: r, op: BinOp::IAdd, lhs: x, rhs: z },
        ];
        func.block_mut(b0).terminator = Terminator::Return(Some(r));

        CombinePass.run(&mut func);
        assert_eq!(func.block(b0).instrs[2], Instr::Move { dest: r, src: x });
    }

    #[test]
    fn test_gvn_dedupes_pure_instrs() {
        let mut func = FuncIr::new("f".to_string(), IrType::Ptr, IrType::I32);
        let b0 = func.add_block("body");
        let a = func.alloc_reg(IrType::I32);
        let b = func.alloc_reg(IrType::I32);
        func.block_mut(b0).instrs = vec![
            Instr::Load { dest: a, ty: IrType::I32, addr: func.ctx_reg, offset: 0 },
            Instr::Load { dest: b, ty: IrType::I32, addr: func.ctx_reg, offset: 0 },
        ];
        func.block_mut(b0).terminator = Terminator::Return(Some(b));

        ValueNumberingPass.run(&mut func);
        assert_eq!(func.block(b0).instrs[1], Instr::Move { dest: b, src: a });
    }

    #[test]
    fn test_gvn_respects_stores() {
        let mut func = FuncIr::new("f".to_string(), IrType::Ptr, IrType::I32);
        let b0 = func.add_block("body");
        let a = func.alloc_reg(IrType::I32);
        let b = func.alloc_reg(IrType::I32);
        func.block_mut(b0).instrs = vec![
            Instr::Load { dest: a, ty: IrType::I32, addr: func.ctx_reg, offset: 0 },
            Instr::Store { addr: func.ctx_reg, value: a, offset: 0 },
            Instr::Load { dest: b, ty: IrType::I32, addr: func.ctx_reg, offset: 0 },
        ];
        func.block_mut(b0).terminator = Terminator::Return(Some(b));

        ValueNumberingPass.run(&mut func);
        assert!(matches!(func.block(b0).instrs[2], Instr::Load { .. }));
    }

    #[test]
    fn test_pipeline_callbacks_fire_per_pass() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let seen: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(vec![]));
        let seen_cb = Rc::clone(&seen);
        let mut opt = FunctionOptimizer::new();
        opt.on_before_pass(move |name, _| seen_cb.borrow_mut().push(name.to_string()));

        let r = Reg(1);
        let mut func = func_with_instrs(vec![Instr::IConst { dest: r, ty: IrType::I32, value: 1 }], r);
        opt.run(&mut func);
        assert_eq!(*seen.borrow(), vec!["combine", "reassociate", "gvn"]);
    }

    #[test]
    fn test_reassociate_merges_constant_chain() {
        let mut func = FuncIr::new("f".to_string(), IrType::Ptr, IrType::I32);
        let b0 = func.add_block("body");
        let x = func.alloc_reg(IrType::I32);
        let c1 = func.alloc_reg(IrType::I32);
        let c2 = func.alloc_reg(IrType::I32);
        let t1 = func.alloc_reg(IrType::I32);
        let t2 = func.alloc_reg(IrType::I32);
        func.block_mut(b0).instrs = vec![
            Instr::Load { dest: x, ty: IrType::I32, addr: func.ctx_reg, offset: 0 },
            Instr::IConst { dest: c1, ty: IrType::I32, value: 2 },
            Instr::IConst { dest: c2, ty: IrType::I32, value: 3 },
            Instr::Binary { dest: t1, op: BinOp::IAdd, lhs: x, rhs: c1 },
            Instr::Binary { dest: t2, op: BinOp::IAdd, lhs: t1, rhs: c2 },
        ];
        func.block_mut(b0).terminator = Terminator::Return(Some(t2));

        ReassociatePass.run(&mut func);
        // The final add now uses x directly with a merged constant 5.
        let last = func.block(b0).instrs.last().unwrap().clone();
        match last {
            Instr::Binary { op: BinOp::IAdd, lhs, rhs, .. } => {
                assert_eq!(lhs, x);
                let prev = &func.block(b0).instrs[func.block(b0).instrs.len() - 2];
                assert_eq!(*prev, Instr::IConst { dest: rhs, ty: IrType::I32, value: 5 });
            }
            other => panic!("unexpected instr: {:?}", other),
        }
    }
}

//! Block IR → Cranelift IR lowering
//!
//! Translates one [`FuncIr`] at a time into Cranelift IR and defines it
//! inside a `JITModule`. Registers become Cranelift variables, blocks map
//! one-to-one, allocas become explicit stack slots, and vector values
//! travel as stack-slot addresses copied with small memory copies.

use cranelift_codegen::ir::{self, condcodes, types, AbiParam, InstBuilder, MemFlags, UserFuncName};
use cranelift_codegen::ir::{StackSlotData, StackSlotKind};
use cranelift_codegen::isa::TargetFrontendConfig;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext, Variable};
use cranelift_jit::JITModule;
use cranelift_module::{FuncId, Linkage, Module as ClifModule};
use rustc_hash::FxHashMap;

use crate::ir::{BinOp, BlockId, CmpCc, FuncIr, Instr, IrType, Reg, Terminator};

/// Error during lowering or definition of one function.
#[derive(Debug, thiserror::Error)]
pub enum LowerError {
    #[error("malformed IR: {0}")]
    Malformed(String),
    #[error("module error: {0}")]
    Module(String),
}

fn clif_type(ty: IrType, ptr_ty: types::Type) -> types::Type {
    match ty {
        IrType::I8 => types::I8,
        IrType::I16 => types::I16,
        IrType::I32 => types::I32,
        IrType::I64 => types::I64,
        IrType::F32 => types::F32,
        IrType::F64 => types::F64,
        IrType::Ptr => ptr_ty,
    }
}

fn int_cc(cc: CmpCc, signed: bool) -> condcodes::IntCC {
    use condcodes::IntCC;
    match (cc, signed) {
        (CmpCc::Eq, _) => IntCC::Equal,
        (CmpCc::Ne, _) => IntCC::NotEqual,
        (CmpCc::Lt, true) => IntCC::SignedLessThan,
        (CmpCc::Le, true) => IntCC::SignedLessThanOrEqual,
        (CmpCc::Gt, true) => IntCC::SignedGreaterThan,
        (CmpCc::Ge, true) => IntCC::SignedGreaterThanOrEqual,
        (CmpCc::Lt, false) => IntCC::UnsignedLessThan,
        (CmpCc::Le, false) => IntCC::UnsignedLessThanOrEqual,
        (CmpCc::Gt, false) => IntCC::UnsignedGreaterThan,
        (CmpCc::Ge, false) => IntCC::UnsignedGreaterThanOrEqual,
    }
}

fn float_cc(cc: CmpCc) -> condcodes::FloatCC {
    use condcodes::FloatCC;
    match cc {
        CmpCc::Eq => FloatCC::Equal,
        CmpCc::Ne => FloatCC::OrderedNotEqual,
        CmpCc::Lt => FloatCC::LessThan,
        CmpCc::Le => FloatCC::LessThanOrEqual,
        CmpCc::Gt => FloatCC::GreaterThan,
        CmpCc::Ge => FloatCC::GreaterThanOrEqual,
    }
}

/// Build the Cranelift signature of a facade function: one context
/// parameter, one return value.
pub(crate) fn function_signature(
    module: &JITModule,
    ctx_ty: IrType,
    ret_ty: IrType,
) -> ir::Signature {
    let ptr_ty = module.target_config().pointer_type();
    let mut sig = module.make_signature();
    sig.params.push(AbiParam::new(clif_type(ctx_ty, ptr_ty)));
    sig.returns.push(AbiParam::new(clif_type(ret_ty, ptr_ty)));
    sig
}

/// Lower `func` and define it into the JIT module under its own symbol
/// name with export linkage. `declared` caches name → id across the whole
/// JIT so cross-module calls resolve to one definition.
pub(crate) fn define_function(
    module: &mut JITModule,
    declared: &mut FxHashMap<String, FuncId>,
    func: &FuncIr,
) -> Result<FuncId, LowerError> {
    func.verify().map_err(LowerError::Malformed)?;

    let ptr_ty = module.target_config().pointer_type();
    let frontend_config = module.target_config();
    let sig = function_signature(module, func.ctx_ty, func.ret_ty);

    let func_id = module
        .declare_function(&func.name, Linkage::Export, &sig)
        .map_err(|e| LowerError::Module(format!("declare {}: {}", func.name, e)))?;
    declared.insert(func.name.clone(), func_id);

    let mut ctx = module.make_context();
    ctx.func.signature = sig;
    ctx.func.name = UserFuncName::user(0, func_id.as_u32());

    let mut fb_ctx = FunctionBuilderContext::new();
    {
        let mut builder = FunctionBuilder::new(&mut ctx.func, &mut fb_ctx);

        // One Cranelift block per terminated IR block; never-entered
        // sections are skipped.
        let mut block_map: FxHashMap<BlockId, ir::Block> = FxHashMap::default();
        for block in &func.blocks {
            if block.terminator != Terminator::None {
                block_map.insert(block.id, builder.create_block());
            }
        }
        let entry = *block_map
            .get(&BlockId(0))
            .ok_or_else(|| LowerError::Malformed(format!("function {}: entry never sealed", func.name)))?;

        builder.append_block_params_for_function_params(entry);
        builder.switch_to_block(entry);

        // Declare a variable per virtual register.
        let mut reg_vars: FxHashMap<Reg, Variable> = FxHashMap::default();
        for idx in 0..func.next_reg {
            let reg = Reg(idx);
            let var = builder.declare_var(clif_type(func.reg_type(reg), ptr_ty));
            reg_vars.insert(reg, var);
        }
        let ctx_param = builder.block_params(entry)[0];
        builder.def_var(reg_vars[&func.ctx_reg], ctx_param);

        let mut lower = LoweringContext { func, reg_vars, block_map, ptr_ty, frontend_config };

        let mut first = true;
        for block in &func.blocks {
            let Some(&cl_block) = lower.block_map.get(&block.id) else {
                continue;
            };
            if !first {
                builder.switch_to_block(cl_block);
            }
            first = false;

            for instr in &block.instrs {
                lower.lower_instr(instr, module, declared, &mut builder)?;
            }
            lower.lower_terminator(&block.terminator, &mut builder)?;
        }

        builder.seal_all_blocks();
        builder.finalize();
    }

    module
        .define_function(func_id, &mut ctx)
        .map_err(|e| LowerError::Module(format!("define {}: {}", func.name, e)))?;
    module.clear_context(&mut ctx);
    Ok(func_id)
}

/// State for lowering a single function.
struct LoweringContext<'a> {
    func: &'a FuncIr,
    reg_vars: FxHashMap<Reg, Variable>,
    block_map: FxHashMap<BlockId, ir::Block>,
    ptr_ty: types::Type,
    frontend_config: TargetFrontendConfig,
}

impl<'a> LoweringContext<'a> {
    fn use_reg(&self, builder: &mut FunctionBuilder<'_>, reg: Reg) -> ir::Value {
        builder.use_var(self.reg_vars[&reg])
    }

    fn def_reg(&self, builder: &mut FunctionBuilder<'_>, reg: Reg, val: ir::Value) {
        builder.def_var(self.reg_vars[&reg], val);
    }

    fn lower_instr(
        &mut self,
        instr: &Instr,
        module: &mut JITModule,
        declared: &mut FxHashMap<String, FuncId>,
        builder: &mut FunctionBuilder<'_>,
    ) -> Result<(), LowerError> {
        match instr {
            Instr::IConst { dest, ty, value } => {
                let val = builder.ins().iconst(clif_type(*ty, self.ptr_ty), *value);
                self.def_reg(builder, *dest, val);
            }
            Instr::FConst { dest, ty, value } => {
                let val = match ty {
                    IrType::F32 => builder.ins().f32const(*value as f32),
                    _ => builder.ins().f64const(*value),
                };
                self.def_reg(builder, *dest, val);
            }
            Instr::Binary { dest, op, lhs, rhs } => {
                let l = self.use_reg(builder, *lhs);
                let r = self.use_reg(builder, *rhs);
                let result = match op {
                    BinOp::IAdd => builder.ins().iadd(l, r),
                    BinOp::ISub => builder.ins().isub(l, r),
                    BinOp::IMul => builder.ins().imul(l, r),
                    BinOp::SDiv => builder.ins().sdiv(l, r),
                    BinOp::UDiv => builder.ins().udiv(l, r),
                    BinOp::SRem => builder.ins().srem(l, r),
                    BinOp::URem => builder.ins().urem(l, r),
                    BinOp::FAdd => builder.ins().fadd(l, r),
                    BinOp::FSub => builder.ins().fsub(l, r),
                    BinOp::FMul => builder.ins().fmul(l, r),
                    BinOp::FDiv => builder.ins().fdiv(l, r),
                    BinOp::FRem => {
                        // No frem in Cranelift: a - trunc(a/b) * b.
                        let q = builder.ins().fdiv(l, r);
                        let t = builder.ins().trunc(q);
                        let m = builder.ins().fmul(t, r);
                        builder.ins().fsub(l, m)
                    }
                };
                self.def_reg(builder, *dest, result);
            }
            Instr::IntCmp { dest, cc, signed, lhs, rhs } => {
                let l = self.use_reg(builder, *lhs);
                let r = self.use_reg(builder, *rhs);
                let result = builder.ins().icmp(int_cc(*cc, *signed), l, r);
                self.def_reg(builder, *dest, result);
            }
            Instr::FloatCmp { dest, cc, lhs, rhs } => {
                let l = self.use_reg(builder, *lhs);
                let r = self.use_reg(builder, *rhs);
                let result = builder.ins().fcmp(float_cc(*cc), l, r);
                self.def_reg(builder, *dest, result);
            }
            Instr::Select { dest, cond, then_val, else_val } => {
                let c = self.use_reg(builder, *cond);
                let t = self.use_reg(builder, *then_val);
                let e = self.use_reg(builder, *else_val);
                let result = builder.ins().select(c, t, e);
                self.def_reg(builder, *dest, result);
            }
            Instr::Extend { dest, ty, src, signed } => {
                let v = self.use_reg(builder, *src);
                let target = clif_type(*ty, self.ptr_ty);
                let src_ty = clif_type(self.func.reg_type(*src), self.ptr_ty);
                let result = if src_ty == target {
                    v
                } else if *signed {
                    builder.ins().sextend(target, v)
                } else {
                    builder.ins().uextend(target, v)
                };
                self.def_reg(builder, *dest, result);
            }
            Instr::Reduce { dest, ty, src } => {
                let v = self.use_reg(builder, *src);
                let target = clif_type(*ty, self.ptr_ty);
                let src_ty = clif_type(self.func.reg_type(*src), self.ptr_ty);
                let result = if src_ty == target { v } else { builder.ins().ireduce(target, v) };
                self.def_reg(builder, *dest, result);
            }
            Instr::FPromote { dest, src } => {
                let v = self.use_reg(builder, *src);
                let result = builder.ins().fpromote(types::F64, v);
                self.def_reg(builder, *dest, result);
            }
            Instr::FDemote { dest, src } => {
                let v = self.use_reg(builder, *src);
                let result = builder.ins().fdemote(types::F32, v);
                self.def_reg(builder, *dest, result);
            }
            Instr::FloatToInt { dest, ty, src, signed } => {
                let v = self.use_reg(builder, *src);
                let target = clif_type(*ty, self.ptr_ty);
                let result = if *signed {
                    builder.ins().fcvt_to_sint(target, v)
                } else {
                    builder.ins().fcvt_to_uint(target, v)
                };
                self.def_reg(builder, *dest, result);
            }
            Instr::IntToFloat { dest, ty, src, signed } => {
                let v = self.use_reg(builder, *src);
                let target = clif_type(*ty, self.ptr_ty);
                let result = if *signed {
                    builder.ins().fcvt_from_sint(target, v)
                } else {
                    builder.ins().fcvt_from_uint(target, v)
                };
                self.def_reg(builder, *dest, result);
            }
            Instr::StackAlloc { dest, size, align } => {
                let align_shift = (*align).max(1).trailing_zeros() as u8;
                let slot = builder.create_sized_stack_slot(StackSlotData::new(
                    StackSlotKind::ExplicitSlot,
                    (*size).max(1),
                    align_shift,
                ));
                let addr = builder.ins().stack_addr(self.ptr_ty, slot, 0);
                self.def_reg(builder, *dest, addr);
            }
            Instr::Load { dest, ty, addr, offset } => {
                let a = self.use_reg(builder, *addr);
                let val =
                    builder.ins().load(clif_type(*ty, self.ptr_ty), MemFlags::trusted(), a, *offset);
                self.def_reg(builder, *dest, val);
            }
            Instr::Store { addr, value, offset } => {
                let a = self.use_reg(builder, *addr);
                let v = self.use_reg(builder, *value);
                builder.ins().store(MemFlags::trusted(), v, a, *offset);
            }
            Instr::PtrAddImm { dest, base, offset } => {
                let b = self.use_reg(builder, *base);
                let result = builder.ins().iadd_imm(b, *offset);
                self.def_reg(builder, *dest, result);
            }
            Instr::PtrAdd { dest, base, offset } => {
                let b = self.use_reg(builder, *base);
                let o = self.use_reg(builder, *offset);
                let result = builder.ins().iadd(b, o);
                self.def_reg(builder, *dest, result);
            }
            Instr::MemCopy { dest, src, size, align } => {
                let d = self.use_reg(builder, *dest);
                let s = self.use_reg(builder, *src);
                builder.emit_small_memory_copy(
                    self.frontend_config,
                    d,
                    s,
                    *size as u64,
                    (*align).min(8) as u8,
                    (*align).min(8) as u8,
                    true,
                    MemFlags::trusted(),
                );
            }
            Instr::Call { dest, symbol, params, ret, args } => {
                let func_id = match declared.get(symbol) {
                    Some(id) => *id,
                    None => {
                        let mut sig = module.make_signature();
                        for p in params {
                            sig.params.push(AbiParam::new(clif_type(*p, self.ptr_ty)));
                        }
                        if let Some(r) = ret {
                            sig.returns.push(AbiParam::new(clif_type(*r, self.ptr_ty)));
                        }
                        let id = module
                            .declare_function(symbol, Linkage::Import, &sig)
                            .map_err(|e| LowerError::Module(format!("declare {}: {}", symbol, e)))?;
                        declared.insert(symbol.clone(), id);
                        id
                    }
                };
                let func_ref = module.declare_func_in_func(func_id, builder.func);
                let arg_vals: Vec<ir::Value> =
                    args.iter().map(|a| self.use_reg(builder, *a)).collect();
                let call = builder.ins().call(func_ref, &arg_vals);
                if let Some(dest) = dest {
                    let results = builder.inst_results(call);
                    let result = results
                        .first()
                        .copied()
                        .ok_or_else(|| LowerError::Malformed(format!("call {}: no result", symbol)))?;
                    self.def_reg(builder, *dest, result);
                }
            }
            Instr::Move { dest, src } => {
                let v = self.use_reg(builder, *src);
                self.def_reg(builder, *dest, v);
            }
        }
        Ok(())
    }

    fn lower_terminator(
        &self,
        term: &Terminator,
        builder: &mut FunctionBuilder<'_>,
    ) -> Result<(), LowerError> {
        match term {
            Terminator::Return(Some(reg)) => {
                let val = self.use_reg(builder, *reg);
                builder.ins().return_(&[val]);
            }
            Terminator::Return(None) => {
                return Err(LowerError::Malformed(format!(
                    "function {}: return without a value",
                    self.func.name
                )));
            }
            Terminator::Jump(target) => {
                let cl_target = self.target(*target)?;
                builder.ins().jump(cl_target, &[]);
            }
            Terminator::Branch { cond, then_block, else_block } => {
                let c = self.use_reg(builder, *cond);
                let t = self.target(*then_block)?;
                let e = self.target(*else_block)?;
                builder.ins().brif(c, t, &[], e, &[]);
            }
            Terminator::None => {
                return Err(LowerError::Malformed(format!(
                    "function {}: unterminated block reached lowering",
                    self.func.name
                )));
            }
        }
        Ok(())
    }

    fn target(&self, id: BlockId) -> Result<ir::Block, LowerError> {
        self.block_map.get(&id).copied().ok_or_else(|| {
            LowerError::Malformed(format!(
                "function {}: jump to unterminated block {}",
                self.func.name, id
            ))
        })
    }
}

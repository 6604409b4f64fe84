//! Pretty-printing for the block IR
//!
//! Textual form used by module/function dumps (`write_to_file` and
//! friends) and by tests.

use std::fmt;

use super::instr::{Block, FuncIr, Instr, Terminator};

impl fmt::Display for FuncIr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "function %{}({}: {}) -> {} {{",
            self.name, self.ctx_reg, self.ctx_ty, self.ret_ty
        )?;
        for block in &self.blocks {
            write!(f, "{}", block)?;
        }
        writeln!(f, "}}")
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  {}: ; {}", self.id, self.name)?;
        for instr in &self.instrs {
            writeln!(f, "    {}", instr)?;
        }
        writeln!(f, "    {}", self.terminator)
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instr::IConst { dest, ty, value } => write!(f, "{} = iconst.{} {}", dest, ty, value),
            Instr::FConst { dest, ty, value } => write!(f, "{} = fconst.{} {}", dest, ty, value),
            Instr::Binary { dest, op, lhs, rhs } => {
                write!(f, "{} = {} {}, {}", dest, op.mnemonic(), lhs, rhs)
            }
            Instr::IntCmp { dest, cc, signed, lhs, rhs } => {
                let sign = if *signed { "s" } else { "u" };
                write!(f, "{} = icmp.{}{} {}, {}", dest, sign, cc.mnemonic(), lhs, rhs)
            }
            Instr::FloatCmp { dest, cc, lhs, rhs } => {
                write!(f, "{} = fcmp.{} {}, {}", dest, cc.mnemonic(), lhs, rhs)
            }
            Instr::Select { dest, cond, then_val, else_val } => {
                write!(f, "{} = select {}, {}, {}", dest, cond, then_val, else_val)
            }
            Instr::Extend { dest, ty, src, signed } => {
                let kind = if *signed { "sext" } else { "uext" };
                write!(f, "{} = {}.{} {}", dest, kind, ty, src)
            }
            Instr::Reduce { dest, ty, src } => write!(f, "{} = ireduce.{} {}", dest, ty, src),
            Instr::FPromote { dest, src } => write!(f, "{} = fpromote {}", dest, src),
            Instr::FDemote { dest, src } => write!(f, "{} = fdemote {}", dest, src),
            Instr::FloatToInt { dest, ty, src, signed } => {
                let kind = if *signed { "fcvt_to_sint" } else { "fcvt_to_uint" };
                write!(f, "{} = {}.{} {}", dest, kind, ty, src)
            }
            Instr::IntToFloat { dest, ty, src, signed } => {
                let kind = if *signed { "fcvt_from_sint" } else { "fcvt_from_uint" };
                write!(f, "{} = {}.{} {}", dest, kind, ty, src)
            }
            Instr::StackAlloc { dest, size, align } => {
                write!(f, "{} = stack_alloc {}, align {}", dest, size, align)
            }
            Instr::Load { dest, ty, addr, offset } => {
                write!(f, "{} = load.{} {}+{}", dest, ty, addr, offset)
            }
            Instr::Store { addr, value, offset } => write!(f, "store {}, {}+{}", value, addr, offset),
            Instr::PtrAddImm { dest, base, offset } => {
                write!(f, "{} = ptr_add {}, {}", dest, base, offset)
            }
            Instr::PtrAdd { dest, base, offset } => {
                write!(f, "{} = ptr_add {}, {}", dest, base, offset)
            }
            Instr::MemCopy { dest, src, size, align } => {
                write!(f, "memcpy {}, {}, {} align {}", dest, src, size, align)
            }
            Instr::Call { dest, symbol, args, .. } => {
                if let Some(dest) = dest {
                    write!(f, "{} = call %{}(", dest, symbol)?;
                } else {
                    write!(f, "call %{}(", symbol)?;
                }
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", a)?;
                }
                write!(f, ")")
            }
            Instr::Move { dest, src } => write!(f, "{} = move {}", dest, src),
        }
    }
}

impl fmt::Display for Terminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Terminator::None => write!(f, "<unterminated>"),
            Terminator::Return(Some(r)) => write!(f, "return {}", r),
            Terminator::Return(None) => write!(f, "return"),
            Terminator::Jump(b) => write!(f, "jump {}", b),
            Terminator::Branch { cond, then_block, else_block } => {
                write!(f, "branch {}, {}, {}", cond, then_block, else_block)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::instr::*;

    #[test]
    fn test_function_display() {
        let mut func = FuncIr::new("demo".to_string(), IrType::Ptr, IrType::I32);
        let b0 = func.add_block("fn_body");
        let r = func.alloc_reg(IrType::I32);
        func.block_mut(b0).instrs.push(Instr::IConst { dest: r, ty: IrType::I32, value: 42 });
        func.block_mut(b0).terminator = Terminator::Return(Some(r));

        let text = format!("{}", func);
        assert!(text.contains("function %demo"));
        assert!(text.contains("iconst.i32 42"));
        assert!(text.contains("return r1"));
        assert!(text.contains("; fn_body"));
    }
}

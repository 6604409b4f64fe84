//! Lazy value graph
//!
//! `ValueInfo` is a node in a deferred expression DAG. Building an
//! operation records the node and its parents; nothing reaches the IR
//! until the node is materialized inside an open code section, at which
//! point parents are evaluated depth-first and one instruction is
//! emitted. Stores, allocas and calls are the exceptions: they emit
//! eagerly at the point of the builder call.
//!
//! Two values are never structurally equal; the per-section evaluation
//! cache keys on node identity instead, so a node is emitted at most once
//! per section while constants stay reusable across sections.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::cursor::{self, CursorContext};
use crate::error::{fn_guard, push_error};
use crate::handle::StrongHandle;
use crate::ir::{BinOp, Instr, IrType, Reg};
use crate::section::CodeSectionContext;
use crate::types::{BinFlavor, BinaryOp, TypeInfo};

const TAG_DELIM: char = ':';

/// Free-form string tags carried by values; unioned through operations.
#[derive(Debug, Clone, Default)]
pub struct TagInfo {
    values: Vec<String>,
}

impl TagInfo {
    pub fn new() -> Self {
        TagInfo::default()
    }

    pub fn from_str(value: &str) -> Self {
        let mut tags = TagInfo::new();
        tags.add_entry(value);
        tags
    }

    pub fn contains(&self, v: &str) -> bool {
        self.values.iter().any(|e| e == v)
    }

    /// Add one entry; a delimited string adds each piece.
    pub fn add_entry(&mut self, v: &str) {
        if v.is_empty() {
            return;
        }
        if v.contains(TAG_DELIM) {
            for piece in v.split(TAG_DELIM) {
                if !piece.is_empty() {
                    self.values.push(piece.to_string());
                }
            }
        } else {
            self.values.push(v.to_string());
        }
    }

    pub fn set_union(&self, other: &TagInfo) -> TagInfo {
        let mut result = self.clone();
        for v in &other.values {
            if !self.values.contains(v) {
                result.values.push(v.clone());
            }
        }
        result
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Node discriminant of the value DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ValueKind {
    Constant,
    Context,
    Binary,
    Conditional,
    Typecast,
    InnerEntry,
    Load,
    Store,
    MkPtr,
    FnCall,
    LoadVectorEntry,
    StoreVectorEntry,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum ConstPayload {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
}

pub(crate) struct ValueNode {
    pub kind: ValueKind,
    pub ty: TypeInfo,
    pub parents: Vec<ValueInfo>,
    pub tags: RefCell<TagInfo>,
    pub op: Option<BinaryOp>,
    /// Aggregate type behind the base pointer of an inner-entry node.
    pub parent_ptr_ty: Option<TypeInfo>,
    pub payload: ConstPayload,
    /// Register produced by eager emission (allocas, calls).
    pub eager_reg: Cell<Option<Reg>>,
}

/// Handle to a value-graph node.
pub struct ValueInfo {
    h: StrongHandle<ValueNode>,
}

impl Clone for ValueInfo {
    fn clone(&self) -> Self {
        ValueInfo { h: self.h.clone() }
    }
}

impl PartialEq for ValueInfo {
    fn eq(&self, other: &Self) -> bool {
        // Two live values are never considered equal; errors compare
        // equal so `x == ValueInfo::null()` stays meaningful.
        self.h.is_marked() && other.h.is_marked()
    }
}

/// Host constants convertible into constant value nodes.
pub trait ConstValue: Copy {
    fn type_info() -> TypeInfo;
    fn payload(self) -> ConstPayload;
}

macro_rules! impl_const_int {
    ($($t:ty => $mk:ident),+ $(,)?) => {
        $(impl ConstValue for $t {
            fn type_info() -> TypeInfo {
                TypeInfo::$mk()
            }
            fn payload(self) -> ConstPayload {
                ConstPayload::Int(self as i64)
            }
        })+
    };
}

impl_const_int!(
    i8 => mk_int8,
    i16 => mk_int16,
    i32 => mk_int32,
    i64 => mk_int64,
    u8 => mk_uint8,
    u16 => mk_uint16,
    u32 => mk_uint32,
    u64 => mk_uint64,
);

impl ConstValue for bool {
    fn type_info() -> TypeInfo {
        TypeInfo::mk_bool()
    }
    fn payload(self) -> ConstPayload {
        ConstPayload::Bool(self)
    }
}

impl ConstValue for f32 {
    fn type_info() -> TypeInfo {
        TypeInfo::mk_float32()
    }
    fn payload(self) -> ConstPayload {
        ConstPayload::Float(self as f64)
    }
}

impl ConstValue for f64 {
    fn type_info() -> TypeInfo {
        TypeInfo::mk_float64()
    }
    fn payload(self) -> ConstPayload {
        ConstPayload::Float(self)
    }
}

/// Node attributes beyond kind/type/parents.
struct NodeExtra {
    op: Option<BinaryOp>,
    parent_ptr_ty: Option<TypeInfo>,
    payload: ConstPayload,
}

impl Default for NodeExtra {
    fn default() -> Self {
        NodeExtra { op: None, parent_ptr_ty: None, payload: ConstPayload::None }
    }
}

impl ValueInfo {
    fn node(kind: ValueKind, ty: TypeInfo, parents: Vec<ValueInfo>) -> ValueInfo {
        Self::node_with(kind, ty, parents, NodeExtra::default())
    }

    fn node_with(kind: ValueKind, ty: TypeInfo, parents: Vec<ValueInfo>, extra: NodeExtra) -> ValueInfo {
        if ty.has_error() {
            return ValueInfo::null();
        }
        let node = Rc::new(ValueNode {
            kind,
            ty,
            parents,
            tags: RefCell::new(TagInfo::new()),
            op: extra.op,
            parent_ptr_ty: extra.parent_ptr_ty,
            payload: extra.payload,
            eager_reg: Cell::new(None),
        });
        ValueInfo { h: StrongHandle::valid(node) }
    }

    pub fn null() -> ValueInfo {
        ValueInfo { h: StrongHandle::null() }
    }

    pub fn has_error(&self) -> bool {
        self.h.has_error()
    }

    pub fn is_null(&self) -> bool {
        self.h.is_marked()
    }

    pub(crate) fn mark_error(&self) {
        self.h.mark_error();
    }

    fn get(&self) -> Option<&Rc<ValueNode>> {
        self.h.raw().filter(|_| !self.h.is_marked())
    }

    /// Type of the value; null type when the value is in error.
    pub fn ty(&self) -> TypeInfo {
        match self.get() {
            Some(n) => n.ty.clone(),
            None => TypeInfo::null(),
        }
    }

    pub fn equals_type(&self, other: &ValueInfo) -> bool {
        self.ty() == other.ty()
    }

    // --- tags ---------------------------------------------------------

    pub fn has_tag(&self, v: &str) -> bool {
        self.get().map(|n| n.tags.borrow().contains(v)).unwrap_or(false)
    }

    pub fn add_tag(&self, v: &str) {
        if let Some(n) = self.get() {
            n.tags.borrow_mut().add_entry(v);
        }
    }

    pub fn add_tags(&self, tags: &TagInfo) {
        if let Some(n) = self.get() {
            let merged = n.tags.borrow().set_union(tags);
            *n.tags.borrow_mut() = merged;
        }
    }

    pub fn tag_info(&self) -> TagInfo {
        self.get().map(|n| n.tags.borrow().clone()).unwrap_or_default()
    }

    // --- factories ----------------------------------------------------

    /// A typed constant; usable in any section of the cursor.
    pub fn from_const<T: ConstValue>(v: T) -> ValueInfo {
        fn_guard!();
        if !CursorContext::has_value() {
            return ValueInfo::null();
        }
        let ty = T::type_info();
        if ty.has_error() {
            return ValueInfo::null();
        }
        Self::node_with(
            ValueKind::Constant,
            ty,
            vec![],
            NodeExtra { payload: v.payload(), ..NodeExtra::default() },
        )
    }

    /// The enclosing function's single argument.
    pub fn from_context(ctx_type: &TypeInfo) -> ValueInfo {
        Self::node(ValueKind::Context, ctx_type.clone(), vec![])
    }

    /// Stack-allocate storage for `ty` in the open section and return the
    /// pointer value. The allocation is emitted eagerly.
    pub fn mk_pointer(ty: &TypeInfo) -> ValueInfo {
        fn_guard!();
        if ty.has_error() {
            return ValueInfo::null();
        }
        let ptr_ty = ty.pointer_type();
        if ptr_ty.has_error() {
            return ValueInfo::null();
        }
        let value = Self::node(ValueKind::MkPtr, ptr_ty, vec![]);
        if CursorContext::has_value() {
            let size = ty.size_in_bytes();
            if size == u32::MAX {
                push_error!(ValueError, "can't allocate storage for type {}", ty.short_name());
                return ValueInfo::null();
            }
            let reg = cursor::emit_value(IrType::Ptr, |dest| Instr::StackAlloc {
                dest,
                size,
                align: ty.align(),
            });
            match reg {
                Some(reg) => {
                    if let Some(n) = value.get() {
                        n.eager_reg.set(Some(reg));
                    }
                }
                None => return ValueInfo::null(),
            }
        }
        value
    }

    /// Size in bytes of a struct type as an `int32` constant.
    pub fn calc_struct_size(ty: &TypeInfo) -> ValueInfo {
        fn_guard!();
        if CursorContext::has_value() {
            if !ty.is_struct() {
                push_error!(TypeError, "type is not a struct");
                return ValueInfo::null();
            }
            ValueInfo::from_const(ty.size_in_bytes() as i32)
        } else {
            ValueInfo::from_const(-1i32)
        }
    }

    /// Field count of a struct type as an `int32` constant.
    pub fn calc_struct_field_count(ty: &TypeInfo) -> ValueInfo {
        if ty.is_struct() {
            ValueInfo::from_const(ty.num_elements() as i32)
        } else {
            ValueInfo::from_const(-1i32)
        }
    }

    /// Byte offset of the field selected by the runtime index `idx`,
    /// computed as a cascade of equality selects; `-1` when out of range.
    pub fn calc_struct_field_offset(ty: &TypeInfo, idx: &ValueInfo) -> ValueInfo {
        fn_guard!();
        if !CursorContext::has_value() {
            return ValueInfo::null();
        }
        if !ty.is_struct() {
            push_error!(TypeError, "type is not a struct");
            return ValueInfo::null();
        }
        if !idx.ty().is_integer() {
            push_error!(TypeError, "field index needs to be of integer type");
            return ValueInfo::null();
        }
        let num_fields = ty.num_elements();
        let mut offset_result = ValueInfo::from_const(-1i32);
        for i in 0..num_fields {
            let curr_idx = ValueInfo::from_const(i as i32);
            let matches = curr_idx.equal(idx);
            let curr_offset = ValueInfo::from_const(ty.field_at(i).offset() as i32);
            offset_result = matches.cond(&curr_offset, &offset_result);
        }
        offset_result
    }

    // --- operations ---------------------------------------------------

    fn binary(&self, op: BinaryOp, v2: &ValueInfo) -> ValueInfo {
        fn_guard!();
        if self.has_error() || v2.has_error() {
            return ValueInfo::null();
        }
        if !self.equals_type(v2) {
            self.mark_error();
            push_error!(ValueError, "{} can't be defined for different types", op.name());
            return ValueInfo::null();
        }
        let result_ty = if op.is_comparison() { TypeInfo::mk_bool() } else { self.ty() };
        let tags = self.tag_info().set_union(&v2.tag_info());
        let value = Self::node_with(
            ValueKind::Binary,
            result_ty,
            vec![self.clone(), v2.clone()],
            NodeExtra { op: Some(op), ..NodeExtra::default() },
        );
        value.add_tags(&tags);
        value
    }

    pub fn add(&self, v2: &ValueInfo) -> ValueInfo {
        self.binary(BinaryOp::Add, v2)
    }

    pub fn sub(&self, v2: &ValueInfo) -> ValueInfo {
        self.binary(BinaryOp::Sub, v2)
    }

    pub fn mul(&self, v2: &ValueInfo) -> ValueInfo {
        self.binary(BinaryOp::Mul, v2)
    }

    pub fn div(&self, v2: &ValueInfo) -> ValueInfo {
        self.binary(BinaryOp::Div, v2)
    }

    pub fn remainder(&self, v2: &ValueInfo) -> ValueInfo {
        self.binary(BinaryOp::Remainder, v2)
    }

    pub fn less_than(&self, v2: &ValueInfo) -> ValueInfo {
        self.binary(BinaryOp::LessThan, v2)
    }

    pub fn less_than_equal(&self, v2: &ValueInfo) -> ValueInfo {
        self.binary(BinaryOp::LessThanEqual, v2)
    }

    pub fn greater_than(&self, v2: &ValueInfo) -> ValueInfo {
        self.binary(BinaryOp::GreaterThan, v2)
    }

    pub fn greater_than_equal(&self, v2: &ValueInfo) -> ValueInfo {
        self.binary(BinaryOp::GreaterThanEqual, v2)
    }

    pub fn equal(&self, v2: &ValueInfo) -> ValueInfo {
        self.binary(BinaryOp::Equal, v2)
    }

    pub fn not_equal(&self, v2: &ValueInfo) -> ValueInfo {
        self.binary(BinaryOp::NotEqual, v2)
    }

    /// Boolean select: `self ? then_value : else_value`.
    pub fn cond(&self, then_value: &ValueInfo, else_value: &ValueInfo) -> ValueInfo {
        fn_guard!();
        if self.has_error() || then_value.has_error() || else_value.has_error() {
            self.mark_error();
            return ValueInfo::null();
        }
        if !self.ty().is_boolean() {
            self.mark_error();
            push_error!(ValueError, "can't define cond operation for non-boolean type");
            return ValueInfo::null();
        }
        if !then_value.equals_type(else_value) {
            self.mark_error();
            push_error!(ValueError, "then and else values are not of the same type");
            return ValueInfo::null();
        }
        let tags = self
            .tag_info()
            .set_union(&then_value.tag_info())
            .set_union(&else_value.tag_info());
        let value = Self::node(
            ValueKind::Conditional,
            then_value.ty(),
            vec![self.clone(), then_value.clone(), else_value.clone()],
        );
        value.add_tags(&tags);
        value
    }

    /// Cast to `target_type`; the combination is validated when the value
    /// materializes.
    pub fn cast(&self, target_type: &TypeInfo) -> ValueInfo {
        fn_guard!();
        if self.has_error() || target_type.has_error() {
            return ValueInfo::null();
        }
        let value = Self::node(ValueKind::Typecast, target_type.clone(), vec![self.clone()]);
        value.add_tags(&self.tag_info());
        value
    }

    /// Dereference a pointer value.
    pub fn load(&self) -> ValueInfo {
        fn_guard!();
        if self.has_error() {
            return ValueInfo::null();
        }
        if !self.ty().is_pointer() {
            self.mark_error();
            push_error!(ValueError, "can't define load operation for non-pointer type");
            return ValueInfo::null();
        }
        let base = self.ty().base_type();
        if base.is_struct() || base.is_array() {
            self.mark_error();
            push_error!(ValueError, "load of aggregate type {} is not supported", base.short_name());
            return ValueInfo::null();
        }
        Self::node(ValueKind::Load, base, vec![self.clone()])
    }

    /// Store `value` through this pointer. Emitted eagerly into the open
    /// section.
    pub fn store(&self, value: &ValueInfo) {
        fn_guard!();
        if self.has_error() {
            return;
        }
        if value.has_error() {
            push_error!(ValueError, "can't store an invalid value");
            return;
        }
        if !self.ty().is_pointer() {
            self.mark_error();
            push_error!(ValueError, "can't define store operation for non-pointer type");
            return;
        }
        let base = self.ty().base_type();
        if !base.is_scalar() && !base.is_vector() {
            self.mark_error();
            push_error!(ValueError, "store target must be scalar or vector");
            return;
        }
        if base != value.ty() {
            self.mark_error();
            push_error!(
                ValueError,
                "type mismatch between pointer and value: expected {}, found {}",
                base.short_name(),
                value.ty().short_name()
            );
            return;
        }
        let store = Self::node(ValueKind::Store, self.ty(), vec![self.clone(), value.clone()]);
        store.materialize();
    }

    /// Pointer to the struct field `name`; `self` must be a
    /// pointer-to-struct.
    pub fn field(&self, name: &str) -> ValueInfo {
        fn_guard!();
        if self.has_error() {
            return ValueInfo::null();
        }
        if !self.ty().is_pointer() {
            self.mark_error();
            push_error!(ValueError, "can't access a struct field through a non-pointer type");
            return ValueInfo::null();
        }
        if name.is_empty() {
            self.mark_error();
            push_error!(ValueError, "can't access a struct field with an empty name");
            return ValueInfo::null();
        }
        let base = self.ty().base_type();
        if !base.is_struct() {
            self.mark_error();
            push_error!(ValueError, "can't access a struct field through a non-struct pointer");
            return ValueInfo::null();
        }
        let entry = base.field(name);
        if entry.has_error() {
            return ValueInfo::null();
        }
        let idx = ValueInfo::from_const(entry.idx() as i32);
        Self::node_with(
            ValueKind::InnerEntry,
            entry.ty().pointer_type(),
            vec![self.clone(), idx],
            NodeExtra { parent_ptr_ty: Some(base), ..NodeExtra::default() },
        )
    }

    /// Pointer to array element `i`; `self` must be a pointer-to-array.
    pub fn entry(&self, i: u32) -> ValueInfo {
        fn_guard!();
        if self.has_error() {
            return ValueInfo::null();
        }
        if !self.ty().is_pointer() {
            self.mark_error();
            push_error!(ValueError, "can't index through a non-pointer type");
            return ValueInfo::null();
        }
        let base = self.ty().base_type();
        if !base.is_array() {
            self.mark_error();
            push_error!(ValueError, "can't index through a non-array pointer");
            return ValueInfo::null();
        }
        if i >= base.num_elements() {
            self.mark_error();
            push_error!(
                ValueError,
                "array is of size {}, can't access element {}",
                base.num_elements(),
                i
            );
            return ValueInfo::null();
        }
        let idx = ValueInfo::from_const(i as i32);
        self.entry_node(&base, idx)
    }

    /// Pointer to the array element selected by the runtime index `i`.
    pub fn entry_at(&self, i: &ValueInfo) -> ValueInfo {
        fn_guard!();
        if self.has_error() || i.has_error() {
            return ValueInfo::null();
        }
        if !self.ty().is_pointer() {
            self.mark_error();
            push_error!(ValueError, "can't index through a non-pointer type");
            return ValueInfo::null();
        }
        let base = self.ty().base_type();
        if !base.is_array() {
            self.mark_error();
            push_error!(ValueError, "can't index through a non-array pointer");
            return ValueInfo::null();
        }
        if !i.ty().is_integer() {
            self.mark_error();
            push_error!(ValueError, "array index must be of integer type");
            return ValueInfo::null();
        }
        self.entry_node(&base, i.clone())
    }

    fn entry_node(&self, base: &TypeInfo, idx: ValueInfo) -> ValueInfo {
        Self::node_with(
            ValueKind::InnerEntry,
            base.base_type().pointer_type(),
            vec![self.clone(), idx],
            NodeExtra { parent_ptr_ty: Some(base.clone()), ..NodeExtra::default() },
        )
    }

    /// Read lane `i` of a vector value.
    pub fn load_vector_entry(&self, i: u32) -> ValueInfo {
        fn_guard!();
        if self.has_error() {
            return ValueInfo::null();
        }
        if !self.ty().is_vector() {
            self.mark_error();
            push_error!(ValueError, "can't read a vector lane of a non-vector type");
            return ValueInfo::null();
        }
        if i >= self.ty().num_elements() {
            self.mark_error();
            push_error!(ValueError, "can't access lane {} of {} lanes", i, self.ty().num_elements());
            return ValueInfo::null();
        }
        let value = Self::node(
            ValueKind::LoadVectorEntry,
            self.ty().base_type(),
            vec![self.clone(), ValueInfo::from_const(i as i32)],
        );
        value.add_tags(&self.tag_info());
        value
    }

    /// Read the lane selected by the runtime index `idx`.
    pub fn load_vector_entry_at(&self, idx: &ValueInfo) -> ValueInfo {
        fn_guard!();
        if self.has_error() || idx.has_error() {
            return ValueInfo::null();
        }
        if !self.ty().is_vector() {
            self.mark_error();
            push_error!(ValueError, "can't read a vector lane of a non-vector type");
            return ValueInfo::null();
        }
        let value = Self::node(
            ValueKind::LoadVectorEntry,
            self.ty().base_type(),
            vec![self.clone(), idx.clone()],
        );
        value.add_tags(&self.tag_info());
        value
    }

    /// A new vector value with lane `i` replaced by `v`.
    pub fn store_vector_entry(&self, i: u32, v: &ValueInfo) -> ValueInfo {
        fn_guard!();
        if self.has_error() || v.has_error() {
            return ValueInfo::null();
        }
        if !self.ty().is_vector() {
            self.mark_error();
            push_error!(ValueError, "can't write a vector lane of a non-vector type");
            return ValueInfo::null();
        }
        if i >= self.ty().num_elements() {
            self.mark_error();
            push_error!(ValueError, "can't access lane {} of {} lanes", i, self.ty().num_elements());
            return ValueInfo::null();
        }
        let value = Self::node(
            ValueKind::StoreVectorEntry,
            self.ty(),
            vec![self.clone(), ValueInfo::from_const(i as i32), v.clone()],
        );
        value.add_tags(&self.tag_info());
        value
    }

    /// A new vector value with the lane selected by `idx` replaced.
    pub fn store_vector_entry_at(&self, idx: &ValueInfo, v: &ValueInfo) -> ValueInfo {
        fn_guard!();
        if self.has_error() || idx.has_error() || v.has_error() {
            return ValueInfo::null();
        }
        if !self.ty().is_vector() {
            self.mark_error();
            push_error!(ValueError, "can't write a vector lane of a non-vector type");
            return ValueInfo::null();
        }
        Self::node(
            ValueKind::StoreVectorEntry,
            self.ty(),
            vec![self.clone(), idx.clone(), v.clone()],
        )
    }

    // --- materialization ---------------------------------------------

    /// Evaluate the node into the current section, reusing the section's
    /// cache so shared subtrees emit once.
    pub(crate) fn materialize(&self) -> Option<Reg> {
        fn_guard!();
        if self.has_error() {
            return None;
        }
        let node = Rc::clone(self.get()?);
        let key = Rc::as_ptr(&node) as usize;
        let section = CodeSectionContext::current_section();
        if let Some(reg) = section.cached_eval(key) {
            return Some(reg);
        }
        let reg = self.eval_node(&node)?;
        if node.kind != ValueKind::Store {
            section.cache_eval(key, reg);
        }
        Some(reg)
    }

    fn eval_node(&self, node: &ValueNode) -> Option<Reg> {
        match node.kind {
            ValueKind::Constant => self.eval_constant(node),
            ValueKind::Context => {
                let func = CodeSectionContext::current_function();
                func.context_reg()
            }
            ValueKind::Binary => self.eval_binary(node),
            ValueKind::Conditional => {
                let cond = node.parents[0].materialize()?;
                let then_val = node.parents[1].materialize()?;
                let else_val = node.parents[2].materialize()?;
                let ty = node.ty.ir_type()?;
                cursor::emit_value(ty, |dest| Instr::Select { dest, cond, then_val, else_val })
            }
            ValueKind::Typecast => self.eval_typecast(node),
            ValueKind::InnerEntry => self.eval_inner_entry(node),
            ValueKind::Load => self.eval_load(node),
            ValueKind::Store => self.eval_store(node),
            ValueKind::MkPtr | ValueKind::FnCall => match node.eager_reg.get() {
                Some(reg) => Some(reg),
                None => {
                    push_error!(ValueError, "value was never emitted into a section");
                    None
                }
            },
            ValueKind::LoadVectorEntry => self.eval_load_vector_entry(node),
            ValueKind::StoreVectorEntry => self.eval_store_vector_entry(node),
        }
    }

    fn eval_constant(&self, node: &ValueNode) -> Option<Reg> {
        let ty = node.ty.ir_type()?;
        match node.payload {
            ConstPayload::Int(v) => cursor::emit_value(ty, |dest| Instr::IConst { dest, ty, value: v }),
            ConstPayload::Bool(v) => {
                cursor::emit_value(ty, |dest| Instr::IConst { dest, ty, value: v as i64 })
            }
            ConstPayload::Float(v) => {
                cursor::emit_value(ty, |dest| Instr::FConst { dest, ty, value: v })
            }
            ConstPayload::None => {
                push_error!(ValueError, "constant without payload");
                None
            }
        }
    }

    fn eval_binary(&self, node: &ValueNode) -> Option<Reg> {
        let op = node.op?;
        let operand_ty = node.parents[0].ty();
        let Some(flavor) = operand_ty.select_binary(op) else {
            push_error!(
                TypeError,
                "{} is not supported for type {}",
                op.name(),
                operand_ty.short_name()
            );
            return None;
        };
        let lhs = node.parents[0].materialize()?;
        let rhs = node.parents[1].materialize()?;
        if operand_ty.is_vector() {
            return self.eval_vector_binary(&operand_ty, flavor, lhs, rhs);
        }
        match flavor {
            BinFlavor::Arith(op) => {
                let ty = node.ty.ir_type()?;
                cursor::emit_value(ty, |dest| Instr::Binary { dest, op, lhs, rhs })
            }
            BinFlavor::IntCompare { cc, signed } => {
                cursor::emit_value(IrType::I8, |dest| Instr::IntCmp { dest, cc, signed, lhs, rhs })
            }
            BinFlavor::FloatCompare { cc } => {
                cursor::emit_value(IrType::I8, |dest| Instr::FloatCmp { dest, cc, lhs, rhs })
            }
        }
    }

    /// Elementwise unroll over stack storage: vector operands are lane
    /// arrays behind pointers.
    fn eval_vector_binary(
        &self,
        vec_ty: &TypeInfo,
        flavor: BinFlavor,
        lhs: Reg,
        rhs: Reg,
    ) -> Option<Reg> {
        let BinFlavor::Arith(op) = flavor else {
            push_error!(TypeError, "comparison is not supported for vector types");
            return None;
        };
        let elem = vec_ty.base_type();
        let elem_ir = elem.ir_type()?;
        let elem_size = elem.size_in_bytes();
        let lanes = vec_ty.num_elements();
        let result = cursor::emit_value(IrType::Ptr, |dest| Instr::StackAlloc {
            dest,
            size: vec_ty.size_in_bytes(),
            align: elem.align(),
        })?;
        for lane in 0..lanes {
            let offset = (lane * elem_size) as i32;
            let l = cursor::emit_value(elem_ir, |dest| Instr::Load { dest, ty: elem_ir, addr: lhs, offset })?;
            let r = cursor::emit_value(elem_ir, |dest| Instr::Load { dest, ty: elem_ir, addr: rhs, offset })?;
            let v = cursor::emit_value(elem_ir, |dest| Instr::Binary { dest, op, lhs: l, rhs: r })?;
            cursor::emit(Instr::Store { addr: result, value: v, offset });
        }
        Some(result)
    }

    fn eval_typecast(&self, node: &ValueNode) -> Option<Reg> {
        let src_value = &node.parents[0];
        let src_ty = src_value.ty();
        let dst_ty = &node.ty;
        let src = src_value.materialize()?;

        let unsupported = || {
            push_error!(
                TypeError,
                "type cast combination not supported: {} -> {}",
                src_ty.short_name(),
                dst_ty.short_name()
            );
        };

        if src_ty.is_integer() && dst_ty.is_integer() {
            let src_size = src_ty.size_in_bytes();
            let dst_size = dst_ty.size_in_bytes();
            let ty = dst_ty.ir_type()?;
            if dst_size > src_size {
                // Extension kind follows the target signedness.
                let signed = dst_ty.is_signed_integer();
                cursor::emit_value(ty, |dest| Instr::Extend { dest, ty, src, signed })
            } else if dst_size < src_size {
                cursor::emit_value(ty, |dest| Instr::Reduce { dest, ty, src })
            } else {
                Some(src)
            }
        } else if src_ty.is_float() && dst_ty.is_float() {
            let src_size = src_ty.size_in_bytes();
            let dst_size = dst_ty.size_in_bytes();
            if dst_size > src_size {
                cursor::emit_value(IrType::F64, |dest| Instr::FPromote { dest, src })
            } else if dst_size < src_size {
                cursor::emit_value(IrType::F32, |dest| Instr::FDemote { dest, src })
            } else {
                Some(src)
            }
        } else if src_ty.is_integer() && dst_ty.is_float() {
            let ty = dst_ty.ir_type()?;
            let signed = src_ty.is_signed_integer();
            cursor::emit_value(ty, |dest| Instr::IntToFloat { dest, ty, src, signed })
        } else if src_ty.is_float() && dst_ty.is_integer() {
            let ty = dst_ty.ir_type()?;
            let signed = dst_ty.is_signed_integer();
            cursor::emit_value(ty, |dest| Instr::FloatToInt { dest, ty, src, signed })
        } else if src_ty.is_boolean() && dst_ty.is_integer() {
            let ty = dst_ty.ir_type()?;
            if ty == IrType::I8 {
                Some(src)
            } else {
                cursor::emit_value(ty, |dest| Instr::Extend { dest, ty, src, signed: false })
            }
        } else {
            unsupported();
            None
        }
    }

    fn eval_inner_entry(&self, node: &ValueNode) -> Option<Reg> {
        let aggregate = node.parent_ptr_ty.as_ref()?;
        let base = node.parents[0].materialize()?;
        let idx_value = &node.parents[1];

        if aggregate.is_struct() {
            // Struct selectors are always constant.
            let Some(idx) = idx_value.const_int() else {
                push_error!(ValueError, "struct field selector must be a constant");
                return None;
            };
            let offset = aggregate.field_at(idx as u32).offset();
            if offset == u32::MAX {
                return None;
            }
            return cursor::emit_value(IrType::Ptr, |dest| Instr::PtrAddImm {
                dest,
                base,
                offset: offset as i64,
            });
        }

        let elem_size = aggregate.base_type().size_in_bytes();
        if let Some(idx) = idx_value.const_int() {
            return cursor::emit_value(IrType::Ptr, |dest| Instr::PtrAddImm {
                dest,
                base,
                offset: idx * elem_size as i64,
            });
        }
        let idx = idx_value.materialize()?;
        let signed = idx_value.ty().is_signed_integer();
        let wide = cursor::emit_value(IrType::I64, |dest| Instr::Extend {
            dest,
            ty: IrType::I64,
            src: idx,
            signed,
        })?;
        let size = cursor::emit_value(IrType::I64, |dest| Instr::IConst {
            dest,
            ty: IrType::I64,
            value: elem_size as i64,
        })?;
        let offset = cursor::emit_value(IrType::I64, |dest| Instr::Binary {
            dest,
            op: BinOp::IMul,
            lhs: wide,
            rhs: size,
        })?;
        cursor::emit_value(IrType::Ptr, |dest| Instr::PtrAdd { dest, base, offset })
    }

    fn eval_load(&self, node: &ValueNode) -> Option<Reg> {
        let addr = node.parents[0].materialize()?;
        if node.ty.is_vector() {
            let size = node.ty.size_in_bytes();
            let align = node.ty.base_type().align();
            let slot =
                cursor::emit_value(IrType::Ptr, |dest| Instr::StackAlloc { dest, size, align })?;
            cursor::emit(Instr::MemCopy { dest: slot, src: addr, size, align });
            return Some(slot);
        }
        let ty = node.ty.ir_type()?;
        cursor::emit_value(ty, |dest| Instr::Load { dest, ty, addr, offset: 0 })
    }

    fn eval_store(&self, node: &ValueNode) -> Option<Reg> {
        let addr = node.parents[0].materialize()?;
        let value = node.parents[1].materialize()?;
        let stored_ty = node.parents[1].ty();
        if stored_ty.is_vector() {
            let size = stored_ty.size_in_bytes();
            cursor::emit(Instr::MemCopy {
                dest: addr,
                src: value,
                size,
                align: stored_ty.base_type().align(),
            });
        } else {
            cursor::emit(Instr::Store { addr, value, offset: 0 });
        }
        Some(value)
    }

    fn eval_load_vector_entry(&self, node: &ValueNode) -> Option<Reg> {
        let vec = node.parents[0].materialize()?;
        let elem = node.ty.ir_type()?;
        let elem_size = node.parents[0].ty().base_type().size_in_bytes();
        if let Some(idx) = node.parents[1].const_int() {
            let offset = (idx * elem_size as i64) as i32;
            return cursor::emit_value(elem, |dest| Instr::Load { dest, ty: elem, addr: vec, offset });
        }
        let addr = self.lane_addr(vec, &node.parents[1], elem_size)?;
        cursor::emit_value(elem, |dest| Instr::Load { dest, ty: elem, addr, offset: 0 })
    }

    fn eval_store_vector_entry(&self, node: &ValueNode) -> Option<Reg> {
        let vec_ty = node.ty.clone();
        let size = vec_ty.size_in_bytes();
        let align = vec_ty.base_type().align();
        let elem_size = vec_ty.base_type().size_in_bytes();
        let vec = node.parents[0].materialize()?;
        let value = node.parents[2].materialize()?;
        let slot = cursor::emit_value(IrType::Ptr, |dest| Instr::StackAlloc { dest, size, align })?;
        cursor::emit(Instr::MemCopy { dest: slot, src: vec, size, align });
        if let Some(idx) = node.parents[1].const_int() {
            let offset = (idx * elem_size as i64) as i32;
            cursor::emit(Instr::Store { addr: slot, value, offset });
        } else {
            let addr = self.lane_addr(slot, &node.parents[1], elem_size)?;
            cursor::emit(Instr::Store { addr, value, offset: 0 });
        }
        Some(slot)
    }

    fn lane_addr(&self, base: Reg, idx_value: &ValueInfo, elem_size: u32) -> Option<Reg> {
        let idx = idx_value.materialize()?;
        let signed = idx_value.ty().is_signed_integer();
        let wide = cursor::emit_value(IrType::I64, |dest| Instr::Extend {
            dest,
            ty: IrType::I64,
            src: idx,
            signed,
        })?;
        let size = cursor::emit_value(IrType::I64, |dest| Instr::IConst {
            dest,
            ty: IrType::I64,
            value: elem_size as i64,
        })?;
        let offset = cursor::emit_value(IrType::I64, |dest| Instr::Binary {
            dest,
            op: BinOp::IMul,
            lhs: wide,
            rhs: size,
        })?;
        cursor::emit_value(IrType::Ptr, |dest| Instr::PtrAdd { dest, base, offset })
    }

    /// Constant integer payload, when this node is a constant.
    pub(crate) fn const_int(&self) -> Option<i64> {
        let node = self.get()?;
        if node.kind != ValueKind::Constant {
            return None;
        }
        match node.payload {
            ConstPayload::Int(v) => Some(v),
            ConstPayload::Bool(v) => Some(v as i64),
            _ => None,
        }
    }

    /// Build a call-result value carrying an eagerly emitted register.
    pub(crate) fn call_result(ty: &TypeInfo, reg: Reg) -> ValueInfo {
        let value = Self::node(ValueKind::FnCall, ty.clone(), vec![]);
        if let Some(n) = value.get() {
            n.eager_reg.set(Some(reg));
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_info_union_and_split() {
        let mut a = TagInfo::new();
        a.add_entry("hot");
        a.add_entry("x:y");
        assert!(a.contains("hot"));
        assert!(a.contains("x"));
        assert!(a.contains("y"));

        let mut b = TagInfo::new();
        b.add_entry("y");
        b.add_entry("z");
        let u = a.set_union(&b);
        assert!(u.contains("z"));
        assert_eq!(u.values().iter().filter(|v| *v == "y").count(), 1);
    }

    #[test]
    fn test_null_value_is_error() {
        let v = ValueInfo::null();
        assert!(v.is_null());
        assert!(v.has_error());
        assert!(v == ValueInfo::null());
    }

    #[test]
    fn test_values_never_equal_without_error() {
        // Without a cursor no node can be built, so compare nulls only;
        // live-value inequality is covered by the cursor tests.
        let a = ValueInfo::null();
        let b = ValueInfo::null();
        assert!(a == b);
    }
}

//! Interned type descriptions
//!
//! Every `TypeInfo` is an interned handle owned by its cursor: asking the
//! cursor for the same descriptor twice returns the same handle, so type
//! equality is pointer identity. Struct layout (field offsets, total
//! size) is computed against the host data layout at construction time.

use std::fmt;
use std::rc::{Rc, Weak};

use crate::backend::isa;
use crate::backend::layout;
use crate::cursor::{CursorContext, CursorInner};
use crate::error::{fn_guard, push_error};
use crate::handle::WeakHandle;
use crate::ir::{BinOp, CmpCc, IrType};
use crate::value::ValueInfo;

/// Type discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Void,
    Bool,
    Int,
    Float,
    Pointer,
    Array,
    Vector,
    Struct,
    /// The event signature `int32(void*)`; only meaningful behind a
    /// pointer, where it makes a struct field callable.
    Function,
}

/// A named field in a struct descriptor, before layout.
#[derive(Debug, Clone)]
pub struct MemberField {
    name: String,
    ty: TypeInfo,
    readonly: bool,
}

impl MemberField {
    pub fn new(name: &str, ty: &TypeInfo) -> Self {
        MemberField { name: name.to_string(), ty: ty.clone(), readonly: false }
    }

    pub fn readonly(name: &str, ty: &TypeInfo) -> Self {
        MemberField { name: name.to_string(), ty: ty.clone(), readonly: true }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> &TypeInfo {
        &self.ty
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn is_valid(&self) -> bool {
        !self.name.is_empty() && !self.ty.has_error()
    }
}

/// A struct field after layout: index, byte offset, name, type.
#[derive(Clone)]
pub struct FieldEntry {
    err: bool,
    idx: u32,
    offset: u32,
    name: String,
    ty: TypeInfo,
    readonly: bool,
}

impl FieldEntry {
    pub(crate) fn new(idx: u32, offset: u32, name: &str, ty: &TypeInfo, readonly: bool) -> Self {
        FieldEntry { err: false, idx, offset, name: name.to_string(), ty: ty.clone(), readonly }
    }

    pub fn null() -> Self {
        FieldEntry {
            err: true,
            idx: u32::MAX,
            offset: u32::MAX,
            name: String::new(),
            ty: TypeInfo::null(),
            readonly: true,
        }
    }

    pub fn has_error(&self) -> bool {
        self.err
    }

    pub fn idx(&self) -> u32 {
        self.idx
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> &TypeInfo {
        &self.ty
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }
}

impl PartialEq for FieldEntry {
    fn eq(&self, other: &Self) -> bool {
        if self.err && other.err {
            return true;
        }
        if self.err || other.err {
            return false;
        }
        self.idx == other.idx
            && self.offset == other.offset
            && self.name == other.name
            && self.ty == other.ty
    }
}

/// Laid-out field stored inside a struct's implementation record.
#[derive(Clone)]
pub(crate) struct FieldInfo {
    pub offset: u32,
    pub name: String,
    pub ty: TypeInfo,
    pub readonly: bool,
}

/// Implementation record; owned by the cursor's type registry.
pub(crate) struct TypeImpl {
    pub kind: TypeKind,
    pub size: u32,
    pub align: u32,
    pub signed: bool,
    pub name: String,
    pub packed: bool,
    pub elems: u32,
    pub base: Option<TypeInfo>,
    pub fields: Vec<FieldInfo>,
    #[allow(dead_code)]
    pub cursor: Weak<CursorInner>,
}

impl TypeImpl {
    fn is_scalar(&self) -> bool {
        matches!(self.kind, TypeKind::Bool | TypeKind::Int | TypeKind::Float)
    }

    fn short_name(&self) -> String {
        match self.kind {
            TypeKind::Void => "void".to_string(),
            TypeKind::Bool => "bool".to_string(),
            TypeKind::Int => {
                if self.signed {
                    format!("int{}", self.size * 8)
                } else {
                    format!("uint{}", self.size * 8)
                }
            }
            TypeKind::Float => format!("float{}", self.size * 8),
            TypeKind::Pointer => {
                format!("ptr[{}]", self.base.as_ref().map(|b| b.short_name()).unwrap_or_default())
            }
            TypeKind::Array => format!(
                "array[{}:{}]",
                self.base.as_ref().map(|b| b.short_name()).unwrap_or_default(),
                self.elems
            ),
            TypeKind::Vector => format!(
                "vector[{}:{}]",
                self.base.as_ref().map(|b| b.short_name()).unwrap_or_default(),
                self.elems
            ),
            TypeKind::Struct => format!("struct[{}]", self.name),
            TypeKind::Function => "event_fn".to_string(),
        }
    }
}

/// Facade-level binary operation; the operand type picks the flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Remainder,
    LessThan,
    LessThanEqual,
    GreaterThan,
    GreaterThanEqual,
    Equal,
    NotEqual,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::LessThan
                | BinaryOp::LessThanEqual
                | BinaryOp::GreaterThan
                | BinaryOp::GreaterThanEqual
                | BinaryOp::Equal
                | BinaryOp::NotEqual
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Remainder => "remainder",
            BinaryOp::LessThan => "less_than",
            BinaryOp::LessThanEqual => "less_than_equal",
            BinaryOp::GreaterThan => "greater_than",
            BinaryOp::GreaterThanEqual => "greater_than_equal",
            BinaryOp::Equal => "equal",
            BinaryOp::NotEqual => "not_equal",
        }
    }
}

/// Instruction flavor chosen for a binary op on one scalar type.
#[derive(Debug, Clone, Copy)]
pub(crate) enum BinFlavor {
    Arith(BinOp),
    IntCompare { cc: CmpCc, signed: bool },
    FloatCompare { cc: CmpCc },
}

fn compare_cc(op: BinaryOp) -> CmpCc {
    match op {
        BinaryOp::LessThan => CmpCc::Lt,
        BinaryOp::LessThanEqual => CmpCc::Le,
        BinaryOp::GreaterThan => CmpCc::Gt,
        BinaryOp::GreaterThanEqual => CmpCc::Ge,
        BinaryOp::Equal => CmpCc::Eq,
        BinaryOp::NotEqual => CmpCc::Ne,
        _ => unreachable!("not a comparison"),
    }
}

/// Interned type handle.
pub struct TypeInfo {
    pub(crate) h: WeakHandle<TypeImpl>,
}

impl Clone for TypeInfo {
    fn clone(&self) -> Self {
        TypeInfo { h: self.h.clone() }
    }
}

impl fmt::Debug for TypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeInfo({})", self.short_name_quiet())
    }
}

impl PartialEq for TypeInfo {
    fn eq(&self, other: &Self) -> bool {
        if self.h.is_marked() && other.h.is_marked() {
            return true;
        }
        if self.h.is_marked() || other.h.is_marked() {
            return false;
        }
        self.h.ptr_eq(&other.h)
    }
}

impl TypeInfo {
    pub(crate) fn from_impl(rc: &Rc<TypeImpl>) -> Self {
        TypeInfo { h: WeakHandle::valid(rc) }
    }

    pub fn null() -> Self {
        TypeInfo { h: WeakHandle::null() }
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

    fn get(&self) -> Option<Rc<TypeImpl>> {
        self.h.get_or_error(crate::error::ErrorKind::TypeError, "type")
    }

    /// Lookup that ignores the latched thread error; used while
    /// formatting diagnostics.
    fn get_quiet(&self) -> Option<Rc<TypeImpl>> {
        self.h.get()
    }

    // --- factories ----------------------------------------------------

    fn ctx_type(f: impl FnOnce(&CursorInner) -> TypeInfo) -> TypeInfo {
        match CursorContext::with_inner(f) {
            Some(ty) => ty,
            None => {
                push_error!(Context, "no cursor in context");
                TypeInfo::null()
            }
        }
    }

    pub fn mk_void() -> TypeInfo {
        fn_guard!();
        Self::ctx_type(|c| c.type_void())
    }

    pub fn mk_bool() -> TypeInfo {
        fn_guard!();
        Self::ctx_type(|c| c.type_bool())
    }

    pub fn mk_int8() -> TypeInfo {
        fn_guard!();
        Self::ctx_type(|c| c.type_int(1, true))
    }

    pub fn mk_int16() -> TypeInfo {
        fn_guard!();
        Self::ctx_type(|c| c.type_int(2, true))
    }

    pub fn mk_int32() -> TypeInfo {
        fn_guard!();
        Self::ctx_type(|c| c.type_int(4, true))
    }

    pub fn mk_int64() -> TypeInfo {
        fn_guard!();
        Self::ctx_type(|c| c.type_int(8, true))
    }

    pub fn mk_uint8() -> TypeInfo {
        fn_guard!();
        Self::ctx_type(|c| c.type_int(1, false))
    }

    pub fn mk_uint16() -> TypeInfo {
        fn_guard!();
        Self::ctx_type(|c| c.type_int(2, false))
    }

    pub fn mk_uint32() -> TypeInfo {
        fn_guard!();
        Self::ctx_type(|c| c.type_int(4, false))
    }

    pub fn mk_uint64() -> TypeInfo {
        fn_guard!();
        Self::ctx_type(|c| c.type_int(8, false))
    }

    pub fn mk_float32() -> TypeInfo {
        fn_guard!();
        Self::ctx_type(|c| c.type_float(4))
    }

    pub fn mk_float64() -> TypeInfo {
        fn_guard!();
        Self::ctx_type(|c| c.type_float(8))
    }

    /// The event-function signature type; valid only as a pointer base.
    pub fn mk_event_fn() -> TypeInfo {
        fn_guard!();
        Self::ctx_type(|c| c.type_event_fn())
    }

    /// Resolve a C-style spelling (`"int32_t"`, `"double"`, ...).
    pub fn from_name(name: &str) -> TypeInfo {
        fn_guard!();
        match name {
            "bool" => TypeInfo::mk_bool(),
            "float" | "float32_t" => TypeInfo::mk_float32(),
            "double" | "float64_t" => TypeInfo::mk_float64(),
            "int8_t" => TypeInfo::mk_int8(),
            "uint8_t" => TypeInfo::mk_uint8(),
            "int16_t" => TypeInfo::mk_int16(),
            "uint16_t" => TypeInfo::mk_uint16(),
            "int32_t" => TypeInfo::mk_int32(),
            "uint32_t" => TypeInfo::mk_uint32(),
            "int64_t" => TypeInfo::mk_int64(),
            "uint64_t" => TypeInfo::mk_uint64(),
            _ => {
                push_error!(TypeError, "type name not identified: {}", name);
                TypeInfo::null()
            }
        }
    }

    pub fn mk_array(element_type: &TypeInfo, num_elements: u32) -> TypeInfo {
        fn_guard!();
        if element_type.has_error() {
            push_error!(TypeError, "element type invalid for array");
            return TypeInfo::null();
        }
        if num_elements == 0 {
            push_error!(TypeError, "number of elements can't be 0 in array");
            return TypeInfo::null();
        }
        if !element_type.is_scalar() && !element_type.is_pointer() {
            push_error!(TypeError, "array can be formed only of scalar or pointer types");
            return TypeInfo::null();
        }
        CursorContext::with_inner(|c| c.type_array(element_type, num_elements))
            .unwrap_or_else(TypeInfo::null)
    }

    pub fn mk_vector(element_type: &TypeInfo, num_elements: u32) -> TypeInfo {
        fn_guard!();
        if element_type.has_error() {
            push_error!(TypeError, "element type invalid for vector");
            return TypeInfo::null();
        }
        if num_elements == 0 {
            push_error!(TypeError, "number of elements can't be 0 in vector");
            return TypeInfo::null();
        }
        if !element_type.is_scalar() {
            push_error!(TypeError, "vector can be formed only of scalar types");
            return TypeInfo::null();
        }
        CursorContext::with_inner(|c| c.type_vector(element_type, num_elements))
            .unwrap_or_else(TypeInfo::null)
    }

    pub fn mk_struct(name: &str, fields: &[MemberField], packed: bool) -> TypeInfo {
        fn_guard!();
        if name.is_empty() {
            push_error!(TypeError, "struct name can't be empty");
            return TypeInfo::null();
        }
        if fields.is_empty() {
            push_error!(TypeError, "struct can't have 0 fields");
            return TypeInfo::null();
        }
        for field in fields {
            if !field.is_valid() {
                push_error!(TypeError, "struct {} has an invalid field entry", name);
                return TypeInfo::null();
            }
            if !field.ty().is_valid_struct_field() {
                push_error!(TypeError, "field {}.{} is not of a valid struct-field type", name, field.name());
                return TypeInfo::null();
            }
        }
        match CursorContext::with_inner(|c| c.type_struct(name, fields, packed)) {
            Some(ty) => ty,
            None => {
                push_error!(Context, "no cursor in context for struct {}", name);
                TypeInfo::null()
            }
        }
    }

    pub fn mk_pointer(base: &TypeInfo) -> TypeInfo {
        base.pointer_type()
    }

    /// The interned pointer-to-self type.
    pub fn pointer_type(&self) -> TypeInfo {
        fn_guard!();
        if self.has_error() {
            return TypeInfo::null();
        }
        match CursorContext::with_inner(|c| c.type_pointer(self)) {
            Some(ty) => ty,
            None => {
                push_error!(Context, "no cursor in context for pointer type");
                TypeInfo::null()
            }
        }
    }

    // --- predicates ---------------------------------------------------

    pub fn is_valid(&self) -> bool {
        !self.has_error() && self.get_quiet().is_some()
    }

    pub fn kind(&self) -> Option<TypeKind> {
        self.get_quiet().map(|t| t.kind)
    }

    fn kind_is(&self, kind: TypeKind) -> bool {
        if self.has_error() {
            return false;
        }
        self.get().map(|t| t.kind == kind).unwrap_or(false)
    }

    pub fn is_void(&self) -> bool {
        self.kind_is(TypeKind::Void)
    }

    pub fn is_boolean(&self) -> bool {
        self.kind_is(TypeKind::Bool)
    }

    pub fn is_integer(&self) -> bool {
        self.kind_is(TypeKind::Int)
    }

    pub fn is_signed_integer(&self) -> bool {
        if self.has_error() {
            return false;
        }
        self.get().map(|t| t.kind == TypeKind::Int && t.signed).unwrap_or(false)
    }

    pub fn is_unsigned_integer(&self) -> bool {
        if self.has_error() {
            return false;
        }
        self.get().map(|t| t.kind == TypeKind::Int && !t.signed).unwrap_or(false)
    }

    pub fn is_float(&self) -> bool {
        self.kind_is(TypeKind::Float)
    }

    pub fn is_scalar(&self) -> bool {
        if self.has_error() {
            return false;
        }
        self.get().map(|t| t.is_scalar()).unwrap_or(false)
    }

    pub fn is_pointer(&self) -> bool {
        self.kind_is(TypeKind::Pointer)
    }

    pub fn is_array(&self) -> bool {
        self.kind_is(TypeKind::Array)
    }

    pub fn is_vector(&self) -> bool {
        self.kind_is(TypeKind::Vector)
    }

    pub fn is_struct(&self) -> bool {
        self.kind_is(TypeKind::Struct)
    }

    pub fn is_function(&self) -> bool {
        self.kind_is(TypeKind::Function)
    }

    // --- accessors ----------------------------------------------------

    pub fn size_in_bytes(&self) -> u32 {
        if self.has_error() {
            return u32::MAX;
        }
        self.get().map(|t| t.size).unwrap_or(u32::MAX)
    }

    pub(crate) fn align(&self) -> u32 {
        self.get_quiet().map(|t| t.align).unwrap_or(1)
    }

    pub fn base_type(&self) -> TypeInfo {
        fn_guard!();
        if self.has_error() {
            return TypeInfo::null();
        }
        let Some(t) = self.get() else {
            return TypeInfo::null();
        };
        match &t.base {
            Some(base) => base.clone(),
            None => {
                push_error!(TypeError, "type {} has no base type", t.short_name());
                TypeInfo::null()
            }
        }
    }

    pub fn num_elements(&self) -> u32 {
        fn_guard!();
        if self.has_error() {
            return u32::MAX;
        }
        let Some(t) = self.get() else {
            return u32::MAX;
        };
        match t.kind {
            TypeKind::Array | TypeKind::Vector | TypeKind::Struct => t.elems,
            _ => {
                push_error!(TypeError, "type {} has no element count", t.short_name());
                u32::MAX
            }
        }
    }

    pub fn struct_name(&self) -> String {
        if self.has_error() {
            return "INVALID_STRUCT".to_string();
        }
        match self.get() {
            Some(t) if t.kind == TypeKind::Struct => t.name.clone(),
            _ => "INVALID_STRUCT".to_string(),
        }
    }

    pub fn struct_size_bytes(&self) -> u32 {
        fn_guard!();
        if self.has_error() {
            return u32::MAX;
        }
        let Some(t) = self.get() else {
            return u32::MAX;
        };
        if t.kind == TypeKind::Struct {
            t.size
        } else {
            push_error!(TypeError, "type {} is not a struct", t.short_name());
            u32::MAX
        }
    }

    pub fn is_packed(&self) -> bool {
        self.get_quiet().map(|t| t.packed).unwrap_or(false)
    }

    pub fn short_name(&self) -> String {
        if self.has_error() {
            return "INVALID_NAME".to_string();
        }
        self.get().map(|t| t.short_name()).unwrap_or_else(|| "INVALID_NAME".to_string())
    }

    fn short_name_quiet(&self) -> String {
        self.get_quiet().map(|t| t.short_name()).unwrap_or_else(|| "<error>".to_string())
    }

    pub fn field_at(&self, idx: u32) -> FieldEntry {
        fn_guard!();
        if self.has_error() {
            return FieldEntry::null();
        }
        let Some(t) = self.get() else {
            return FieldEntry::null();
        };
        if t.kind != TypeKind::Struct {
            push_error!(TypeError, "type {} has no fields", t.short_name());
            self.mark_error();
            return FieldEntry::null();
        }
        match t.fields.get(idx as usize) {
            Some(f) => FieldEntry::new(idx, f.offset, &f.name, &f.ty, f.readonly),
            None => {
                push_error!(ValueError, "unable to find field {} in struct {}", idx, t.name);
                FieldEntry::null()
            }
        }
    }

    pub fn field(&self, name: &str) -> FieldEntry {
        fn_guard!();
        if self.has_error() {
            return FieldEntry::null();
        }
        if name.is_empty() {
            push_error!(TypeError, "can't search for an empty field name in struct");
            self.mark_error();
            return FieldEntry::null();
        }
        let Some(t) = self.get() else {
            return FieldEntry::null();
        };
        if t.kind != TypeKind::Struct {
            push_error!(TypeError, "type {} has no fields", t.short_name());
            self.mark_error();
            return FieldEntry::null();
        }
        for (i, f) in t.fields.iter().enumerate() {
            if f.name == name {
                return FieldEntry::new(i as u32, f.offset, &f.name, &f.ty, f.readonly);
            }
        }
        push_error!(ValueError, "unable to find field {} in struct {}", name, t.name);
        FieldEntry::null()
    }

    // --- validity rules ----------------------------------------------

    /// A struct field must be scalar, or a pointer whose base is an
    /// aggregate (struct/array/vector), another valid pointer, or the
    /// event-function type.
    pub fn is_valid_struct_field(&self) -> bool {
        fn_guard!();
        if self.has_error() {
            return false;
        }
        let Some(t) = self.get() else {
            return false;
        };
        if t.is_scalar() {
            return true;
        }
        if t.kind == TypeKind::Pointer {
            return self.is_valid_pointer_field();
        }
        false
    }

    pub fn is_valid_pointer_field(&self) -> bool {
        fn_guard!();
        if self.has_error() {
            return false;
        }
        let Some(t) = self.get() else {
            return false;
        };
        if t.kind != TypeKind::Pointer {
            return false;
        }
        let Some(base) = t.base.clone() else {
            return false;
        };
        let Some(b) = base.get() else {
            return false;
        };
        match b.kind {
            TypeKind::Struct => b.fields.iter().all(|f| f.ty.is_valid_struct_field()),
            TypeKind::Array | TypeKind::Vector => {
                b.base.as_ref().map(|e| e.is_valid_struct_field()).unwrap_or(false)
            }
            TypeKind::Pointer => base.is_valid_pointer_field(),
            TypeKind::Function => true,
            _ => false,
        }
    }

    // --- operations ---------------------------------------------------

    /// Cast `src` to this type; see the value-graph cast rules.
    pub fn cast(&self, src: &ValueInfo) -> ValueInfo {
        fn_guard!();
        if self.has_error() {
            return ValueInfo::null();
        }
        if src.has_error() {
            push_error!(TypeError, "can't typecast an invalid value");
            return ValueInfo::null();
        }
        src.cast(self)
    }

    /// Verify that a computed value's type identity-matches this type.
    pub fn check_sync(&self, value: &ValueInfo) -> bool {
        if self.has_error() || value.has_error() {
            return false;
        }
        let vty = value.ty();
        if *self != vty {
            return false;
        }
        // Interning makes identity checks carry size/signedness/shape.
        match (self.get_quiet(), vty.get_quiet()) {
            (Some(a), Some(b)) => {
                a.size == b.size && a.signed == b.signed && a.elems == b.elems && a.kind == b.kind
            }
            _ => false,
        }
    }

    /// Machine value type for scalars and pointers. Vector values travel
    /// as addresses of stack-allocated storage.
    pub(crate) fn ir_type(&self) -> Option<IrType> {
        let t = self.get_quiet()?;
        match t.kind {
            TypeKind::Bool => Some(IrType::I8),
            TypeKind::Int => match t.size {
                1 => Some(IrType::I8),
                2 => Some(IrType::I16),
                4 => Some(IrType::I32),
                8 => Some(IrType::I64),
                _ => None,
            },
            TypeKind::Float => match t.size {
                4 => Some(IrType::F32),
                8 => Some(IrType::F64),
                _ => None,
            },
            TypeKind::Pointer => Some(IrType::Ptr),
            TypeKind::Vector => Some(IrType::Ptr),
            _ => None,
        }
    }

    /// Select the instruction flavor for `op` on this type. Works for
    /// scalars; vectors resolve against their element type. Comparison
    /// over vectors is not supported.
    pub(crate) fn select_binary(&self, op: BinaryOp) -> Option<BinFlavor> {
        let t = self.get_quiet()?;
        let scalar: Rc<TypeImpl> = if t.kind == TypeKind::Vector {
            if op.is_comparison() {
                return None;
            }
            t.base.as_ref().and_then(|b| b.get_quiet())?
        } else {
            t
        };
        if !scalar.is_scalar() {
            return None;
        }
        let is_float = scalar.kind == TypeKind::Float;
        let signed = scalar.kind == TypeKind::Int && scalar.signed;
        if op.is_comparison() {
            let cc = compare_cc(op);
            if is_float {
                Some(BinFlavor::FloatCompare { cc })
            } else {
                Some(BinFlavor::IntCompare { cc, signed })
            }
        } else {
            let choice = match (op, is_float) {
                (BinaryOp::Add, false) => BinOp::IAdd,
                (BinaryOp::Sub, false) => BinOp::ISub,
                (BinaryOp::Mul, false) => BinOp::IMul,
                (BinaryOp::Div, false) => {
                    if signed {
                        BinOp::SDiv
                    } else {
                        BinOp::UDiv
                    }
                }
                (BinaryOp::Remainder, false) => {
                    if signed {
                        BinOp::SRem
                    } else {
                        BinOp::URem
                    }
                }
                (BinaryOp::Add, true) => BinOp::FAdd,
                (BinaryOp::Sub, true) => BinOp::FSub,
                (BinaryOp::Mul, true) => BinOp::FMul,
                (BinaryOp::Div, true) => BinOp::FDiv,
                (BinaryOp::Remainder, true) => BinOp::FRem,
                _ => return None,
            };
            Some(BinFlavor::Arith(choice))
        }
    }
}

/// Build the implementation record for a scalar/void/function type.
pub(crate) fn scalar_impl(
    kind: TypeKind,
    size: u32,
    signed: bool,
    cursor: Weak<CursorInner>,
) -> TypeImpl {
    TypeImpl {
        kind,
        size,
        align: layout::scalar_align(size),
        signed,
        name: String::new(),
        packed: false,
        elems: 0,
        base: None,
        fields: vec![],
        cursor,
    }
}

/// Build the implementation record for a pointer type.
pub(crate) fn pointer_impl(base: TypeInfo, cursor: Weak<CursorInner>) -> TypeImpl {
    let size = isa::pointer_bytes();
    TypeImpl {
        kind: TypeKind::Pointer,
        size,
        align: size,
        signed: false,
        name: String::new(),
        packed: false,
        elems: 0,
        base: Some(base),
        fields: vec![],
        cursor,
    }
}

/// Build the implementation record for an array or vector type.
pub(crate) fn sequence_impl(
    kind: TypeKind,
    element: TypeInfo,
    count: u32,
    cursor: Weak<CursorInner>,
) -> TypeImpl {
    let elem_size = element.size_in_bytes();
    let align = element.align();
    TypeImpl {
        kind,
        size: elem_size.saturating_mul(count),
        align,
        signed: false,
        name: String::new(),
        packed: false,
        elems: count,
        base: Some(element),
        fields: vec![],
        cursor,
    }
}

/// Build the implementation record for a struct type with host layout.
pub(crate) fn struct_impl(
    name: &str,
    members: &[MemberField],
    packed: bool,
    cursor: Weak<CursorInner>,
) -> TypeImpl {
    let sized: Vec<(u32, u32)> =
        members.iter().map(|m| (m.ty().size_in_bytes(), m.ty().align())).collect();
    let laid_out = layout::layout_fields(&sized, packed);
    let fields = members
        .iter()
        .zip(laid_out.offsets.iter())
        .map(|(m, &offset)| FieldInfo {
            offset,
            name: m.name().to_string(),
            ty: m.ty().clone(),
            readonly: m.is_readonly(),
        })
        .collect();
    TypeImpl {
        kind: TypeKind::Struct,
        size: laid_out.size,
        align: laid_out.align,
        signed: false,
        name: name.to_string(),
        packed,
        elems: members.len() as u32,
        base: None,
        fields,
        cursor,
    }
}

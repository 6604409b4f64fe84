//! Runtime struct shapes
//!
//! [`Struct`] and [`Field`] are heap-resident mirrors of struct types,
//! copied out of the cursor's type registry when modules are handed to
//! the JIT, so they stay valid after the cursor is cleaned up.

use rustc_hash::FxHashMap;
use std::rc::Rc;

use crate::error::{fn_guard, push_error};
use crate::handle::StrongHandle;
use crate::types::TypeInfo;

use super::object::Object;

/// Runtime field type discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtType {
    Unknown,
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float32,
    Float64,
    PointerStruct,
    PointerArray,
    PointerFn,
}

impl RtType {
    /// Size of one runtime slot of this type, in bytes.
    pub fn size(self) -> u32 {
        match self {
            RtType::Unknown => u32::MAX,
            RtType::Bool | RtType::Int8 | RtType::Uint8 => 1,
            RtType::Int16 | RtType::Uint16 => 2,
            RtType::Int32 | RtType::Uint32 | RtType::Float32 => 4,
            RtType::Int64 | RtType::Uint64 | RtType::Float64 => 8,
            RtType::PointerStruct | RtType::PointerArray | RtType::PointerFn => 8,
        }
    }

    pub fn is_pointer(self) -> bool {
        matches!(self, RtType::PointerStruct | RtType::PointerArray | RtType::PointerFn)
    }

    /// Classify a builder type.
    pub fn of(ty: &TypeInfo) -> RtType {
        if ty.has_error() {
            return RtType::Unknown;
        }
        if ty.is_boolean() {
            return RtType::Bool;
        }
        if ty.is_pointer() {
            let base = ty.base_type();
            if base.is_struct() {
                return RtType::PointerStruct;
            }
            if base.is_array() || base.is_vector() {
                return RtType::PointerArray;
            }
            if base.is_function() {
                return RtType::PointerFn;
            }
            return RtType::Unknown;
        }
        if ty.is_float() {
            return match ty.size_in_bytes() {
                4 => RtType::Float32,
                8 => RtType::Float64,
                _ => RtType::Unknown,
            };
        }
        if ty.is_integer() {
            let signed = ty.is_signed_integer();
            return match (ty.size_in_bytes(), signed) {
                (1, true) => RtType::Int8,
                (2, true) => RtType::Int16,
                (4, true) => RtType::Int32,
                (8, true) => RtType::Int64,
                (1, false) => RtType::Uint8,
                (2, false) => RtType::Uint16,
                (4, false) => RtType::Uint32,
                (8, false) => RtType::Uint64,
                _ => RtType::Unknown,
            };
        }
        RtType::Unknown
    }
}

pub(crate) struct FieldInner {
    idx: u32,
    offset: u32,
    name: String,
    rt: RtType,
    /// Shape behind a struct-pointer field.
    underlying: Option<Struct>,
}

/// A single field of a runtime struct shape.
pub struct Field {
    h: StrongHandle<FieldInner>,
}

impl Clone for Field {
    fn clone(&self) -> Self {
        Field { h: self.h.clone() }
    }
}

impl PartialEq for Field {
    fn eq(&self, other: &Self) -> bool {
        if self.h.is_marked() && other.h.is_marked() {
            return true;
        }
        self.h.ptr_eq(&other.h)
    }
}

impl Field {
    fn create(idx: u32, offset: u32, name: &str, rt: RtType, underlying: Option<Struct>) -> Field {
        let inner = Rc::new(FieldInner { idx, offset, name: name.to_string(), rt, underlying });
        Field { h: StrongHandle::valid(inner) }
    }

    pub fn null() -> Field {
        Field { h: StrongHandle::null() }
    }

    pub fn has_error(&self) -> bool {
        self.h.has_error()
    }

    pub fn is_null(&self) -> bool {
        self.h.is_marked()
    }

    fn get(&self) -> Option<&Rc<FieldInner>> {
        self.h.raw().filter(|_| !self.h.is_marked())
    }

    pub fn idx(&self) -> u32 {
        self.get().map(|f| f.idx).unwrap_or(u32::MAX)
    }

    pub fn offset(&self) -> u32 {
        self.get().map(|f| f.offset).unwrap_or(u32::MAX)
    }

    pub fn name(&self) -> String {
        self.get().map(|f| f.name.clone()).unwrap_or_default()
    }

    pub fn rt_type(&self) -> RtType {
        self.get().map(|f| f.rt).unwrap_or(RtType::Unknown)
    }

    pub fn is_bool(&self) -> bool {
        self.rt_type() == RtType::Bool
    }

    pub fn is_struct_pointer(&self) -> bool {
        self.rt_type() == RtType::PointerStruct
    }

    pub fn is_array_pointer(&self) -> bool {
        self.rt_type() == RtType::PointerArray
    }

    pub fn is_fn_pointer(&self) -> bool {
        self.rt_type() == RtType::PointerFn
    }

    pub fn is_pointer(&self) -> bool {
        self.rt_type().is_pointer()
    }

    /// Shape of the struct behind a struct-pointer field.
    pub fn underlying_struct(&self) -> Struct {
        self.get()
            .and_then(|f| f.underlying.clone())
            .unwrap_or_else(Struct::null)
    }
}

pub(crate) struct StructInner {
    name: String,
    size: u32,
    fields: FxHashMap<String, Field>,
    field_names: Vec<String>,
}

/// A runtime struct shape.
pub struct Struct {
    h: StrongHandle<StructInner>,
}

impl Clone for Struct {
    fn clone(&self) -> Self {
        Struct { h: self.h.clone() }
    }
}

impl PartialEq for Struct {
    fn eq(&self, other: &Self) -> bool {
        if self.h.is_marked() && other.h.is_marked() {
            return true;
        }
        self.h.ptr_eq(&other.h)
    }
}

impl Struct {
    /// Copy a struct type out of the builder's registry.
    pub(crate) fn from_type(ty: &TypeInfo) -> Struct {
        fn_guard!();
        if ty.has_error() || !ty.is_struct() {
            push_error!(Jit, "type is not a struct: {}", ty.short_name());
            return Struct::null();
        }
        let num_fields = ty.num_elements();
        let mut fields = FxHashMap::default();
        let mut field_names = Vec::with_capacity(num_fields as usize);
        for i in 0..num_fields {
            let entry = ty.field_at(i);
            if entry.has_error() {
                return Struct::null();
            }
            let rt = RtType::of(entry.ty());
            let underlying = if rt == RtType::PointerStruct {
                Some(Struct::from_type(&entry.ty().base_type()))
            } else {
                None
            };
            let field = Field::create(i, entry.offset(), entry.name(), rt, underlying);
            field_names.push(entry.name().to_string());
            fields.insert(entry.name().to_string(), field);
        }
        let inner = Rc::new(StructInner {
            name: ty.struct_name(),
            size: ty.struct_size_bytes(),
            fields,
            field_names,
        });
        Struct { h: StrongHandle::valid(inner) }
    }

    pub fn null() -> Struct {
        Struct { h: StrongHandle::null() }
    }

    pub fn has_error(&self) -> bool {
        self.h.has_error()
    }

    pub fn is_null(&self) -> bool {
        self.h.is_marked()
    }

    fn get(&self) -> Option<&Rc<StructInner>> {
        self.h.raw().filter(|_| !self.h.is_marked())
    }

    pub fn name(&self) -> String {
        self.get().map(|s| s.name.clone()).unwrap_or_default()
    }

    pub fn size_in_bytes(&self) -> u32 {
        self.get().map(|s| s.size).unwrap_or(0)
    }

    pub fn num_fields(&self) -> u32 {
        self.get().map(|s| s.fields.len() as u32).unwrap_or(0)
    }

    pub fn field_names(&self) -> Vec<String> {
        self.get().map(|s| s.field_names.clone()).unwrap_or_default()
    }

    pub fn field(&self, name: &str) -> Field {
        self.get()
            .and_then(|s| s.fields.get(name).cloned())
            .unwrap_or_else(Field::null)
    }

    /// Heap-allocate a zeroed object of this shape.
    pub fn mk_object(&self) -> Object {
        if self.has_error() {
            return Object::null();
        }
        Object::create(self)
    }
}

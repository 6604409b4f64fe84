//! Runtime objects and arrays
//!
//! Heap buffers shaped by a runtime [`Struct`], passed to JITted code by
//! raw pointer. Pointer fields must be linked to frozen children before
//! the object itself can freeze; the owning side tables keep children
//! alive for as long as the parent does. A frozen object is immutable.

use rustc_hash::FxHashMap;
use std::alloc::{self, Layout};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::error::{fn_guard, push_error};
use crate::handle::StrongHandle;
use crate::jit::RawEventFn;

use super::shape::{Field, RtType, Struct};

/// Host scalars that can live in object fields and array slots.
pub trait FieldScalar: Copy {
    const RT: RtType;
}

macro_rules! impl_field_scalar {
    ($($t:ty => $rt:ident),+ $(,)?) => {
        $(impl FieldScalar for $t {
            const RT: RtType = RtType::$rt;
        })+
    };
}

impl_field_scalar!(
    bool => Bool,
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    u8 => Uint8,
    u16 => Uint16,
    u32 => Uint32,
    u64 => Uint64,
    f32 => Float32,
    f64 => Float64,
);

/// Aligned zeroed heap buffer with its layout remembered for dealloc.
struct RawBuf {
    ptr: *mut u8,
    layout: Layout,
}

impl RawBuf {
    fn zeroed(size: usize, align: usize) -> Option<RawBuf> {
        let layout = Layout::from_size_align(size.max(1), align).ok()?;
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return None;
        }
        Some(RawBuf { ptr, layout })
    }
}

impl Drop for RawBuf {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr, self.layout) };
    }
}

pub(crate) struct ObjectInner {
    shape: Struct,
    buf: RawBuf,
    size: u32,
    linked_objects: RefCell<FxHashMap<String, Object>>,
    linked_arrays: RefCell<FxHashMap<String, Array>>,
    frozen: Cell<bool>,
}

/// A heap-resident instance of a runtime struct shape.
pub struct Object {
    h: StrongHandle<ObjectInner>,
}

impl Clone for Object {
    fn clone(&self) -> Self {
        Object { h: self.h.clone() }
    }
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        if self.h.is_marked() && other.h.is_marked() {
            return true;
        }
        self.h.ptr_eq(&other.h)
    }
}

impl Object {
    pub(crate) fn create(shape: &Struct) -> Object {
        fn_guard!();
        if shape.has_error() {
            return Object::null();
        }
        let size = shape.size_in_bytes();
        let Some(buf) = RawBuf::zeroed(size as usize, 16) else {
            push_error!(Jit, "failed to allocate object buffer of {} bytes", size);
            return Object::null();
        };
        let inner = Rc::new(ObjectInner {
            shape: shape.clone(),
            buf,
            size,
            linked_objects: RefCell::new(FxHashMap::default()),
            linked_arrays: RefCell::new(FxHashMap::default()),
            frozen: Cell::new(false),
        });
        Object { h: StrongHandle::valid(inner) }
    }

    pub fn null() -> Object {
        Object { h: StrongHandle::null() }
    }

    pub fn has_error(&self) -> bool {
        self.h.has_error()
    }

    pub fn is_null(&self) -> bool {
        self.h.is_marked()
    }

    fn get(&self) -> Option<&Rc<ObjectInner>> {
        self.h.raw().filter(|_| !self.h.is_marked())
    }

    pub fn is_frozen(&self) -> bool {
        self.get().map(|o| o.frozen.get()).unwrap_or(false)
    }

    pub fn struct_def(&self) -> Struct {
        self.get().map(|o| o.shape.clone()).unwrap_or_else(Struct::null)
    }

    pub fn is_instance_of(&self, shape: &Struct) -> bool {
        if self.has_error() || shape.has_error() {
            return false;
        }
        self.struct_def() == *shape
    }

    /// Raw buffer pointer handed to JITted code; the object must stay
    /// alive and frozen for the duration of any call using it.
    pub fn ref_ptr(&self) -> *mut u8 {
        match self.get() {
            Some(o) => o.buf.ptr,
            None => std::ptr::null_mut(),
        }
    }

    fn field_checked(&self, name: &str) -> Option<(Rc<ObjectInner>, Field)> {
        let inner = Rc::clone(self.get()?);
        let field = inner.shape.field(name);
        if field.is_null() {
            push_error!(Jit, "can't find field: {}", name);
            return None;
        }
        Some((inner, field))
    }

    unsafe fn slot_ptr<T>(inner: &ObjectInner, offset: u32) -> *mut T {
        debug_assert!(offset < inner.size.max(1));
        unsafe { inner.buf.ptr.add(offset as usize) as *mut T }
    }

    /// Read a scalar field.
    pub fn get_value<T: FieldScalar>(&self, name: &str) -> Option<T> {
        fn_guard!();
        if self.has_error() {
            push_error!(Jit, "can't access a field of an invalid object: {}", name);
            return None;
        }
        let (inner, field) = self.field_checked(name)?;
        if field.rt_type() != T::RT {
            push_error!(Jit, "field type mismatch: {}", name);
            return None;
        }
        Some(unsafe { *Self::slot_ptr::<T>(&inner, field.offset()) })
    }

    /// Write a scalar field; forbidden after freeze.
    pub fn set_value<T: FieldScalar>(&self, name: &str, v: T) {
        fn_guard!();
        if self.has_error() {
            push_error!(Jit, "can't access a field of an invalid object: {}", name);
            return;
        }
        if self.is_frozen() {
            push_error!(Jit, "object already frozen, can't set a new value");
            return;
        }
        let Some((inner, field)) = self.field_checked(name) else {
            return;
        };
        if field.rt_type() != T::RT {
            push_error!(Jit, "field type mismatch: {}", name);
            return;
        }
        unsafe { *Self::slot_ptr::<T>(&inner, field.offset()) = v };
    }

    pub fn get_object(&self, name: &str) -> Object {
        fn_guard!();
        if self.has_error() {
            push_error!(Jit, "can't access a field of an invalid object: {}", name);
            return Object::null();
        }
        let Some((inner, field)) = self.field_checked(name) else {
            return Object::null();
        };
        if !field.is_struct_pointer() {
            push_error!(Jit, "field type is not a struct pointer: {}", name);
            return Object::null();
        }
        let result = inner.linked_objects.borrow().get(name).cloned().unwrap_or_else(Object::null);
        result
    }

    /// Link a frozen child object into a struct-pointer field; the child
    /// is retained so the stored pointer cannot dangle.
    pub fn set_object(&self, name: &str, v: &Object) {
        fn_guard!();
        if self.has_error() {
            push_error!(Jit, "can't access a field of an invalid object: {}", name);
            return;
        }
        if v.has_error() {
            push_error!(Jit, "can't set an invalid object for field: {}", name);
            return;
        }
        if !v.is_frozen() {
            push_error!(Jit, "can only link a frozen object for field: {}", name);
            return;
        }
        if self.is_frozen() {
            push_error!(Jit, "object already frozen, can't set a new value");
            return;
        }
        let Some((inner, field)) = self.field_checked(name) else {
            return;
        };
        if !field.is_struct_pointer() {
            push_error!(Jit, "field type is not a struct pointer: {}", name);
            return;
        }
        unsafe { *Self::slot_ptr::<u64>(&inner, field.offset()) = v.ref_ptr() as u64 };
        inner.linked_objects.borrow_mut().insert(name.to_string(), v.clone());
    }

    pub fn get_array(&self, name: &str) -> Array {
        fn_guard!();
        if self.has_error() {
            push_error!(Jit, "can't access a field of an invalid object: {}", name);
            return Array::null();
        }
        let Some((inner, field)) = self.field_checked(name) else {
            return Array::null();
        };
        if !field.is_array_pointer() {
            push_error!(Jit, "field type is not an array pointer: {}", name);
            return Array::null();
        }
        let result = inner.linked_arrays.borrow().get(name).cloned().unwrap_or_else(Array::null);
        result
    }

    /// Link a frozen child array into an array-pointer field.
    pub fn set_array(&self, name: &str, v: &Array) {
        fn_guard!();
        if self.has_error() {
            push_error!(Jit, "can't access a field of an invalid object: {}", name);
            return;
        }
        if v.has_error() {
            push_error!(Jit, "can't set an invalid array for field: {}", name);
            return;
        }
        if !v.is_frozen() {
            push_error!(Jit, "can only link a frozen array for field: {}", name);
            return;
        }
        if self.is_frozen() {
            push_error!(Jit, "object already frozen, can't set a new value");
            return;
        }
        let Some((inner, field)) = self.field_checked(name) else {
            return;
        };
        if !field.is_array_pointer() {
            push_error!(Jit, "field type is not an array pointer: {}", name);
            return;
        }
        unsafe { *Self::slot_ptr::<u64>(&inner, field.offset()) = v.ref_ptr() as u64 };
        inner.linked_arrays.borrow_mut().insert(name.to_string(), v.clone());
    }

    pub fn get_fn_ptr(&self, name: &str) -> Option<RawEventFn> {
        fn_guard!();
        if self.has_error() {
            push_error!(Jit, "can't access a field of an invalid object: {}", name);
            return None;
        }
        let (inner, field) = self.field_checked(name)?;
        if !field.is_fn_pointer() {
            push_error!(Jit, "field type is not a function pointer: {}", name);
            return None;
        }
        let raw = unsafe { *Self::slot_ptr::<u64>(&inner, field.offset()) };
        if raw == 0 {
            return None;
        }
        Some(unsafe { std::mem::transmute::<u64, RawEventFn>(raw) })
    }

    /// Write a raw function pointer into a function-pointer field.
    pub fn set_fn_ptr(&self, name: &str, f: RawEventFn) {
        fn_guard!();
        if self.has_error() {
            push_error!(Jit, "can't access a field of an invalid object: {}", name);
            return;
        }
        if self.is_frozen() {
            push_error!(Jit, "object already frozen, can't set a new value");
            return;
        }
        let Some((inner, field)) = self.field_checked(name) else {
            return;
        };
        if !field.is_fn_pointer() {
            push_error!(Jit, "field type is not a function pointer: {}", name);
            return;
        }
        unsafe { *Self::slot_ptr::<u64>(&inner, field.offset()) = f as usize as u64 };
    }

    /// Pointer fields that are not yet linked (or hold a null function
    /// pointer).
    pub fn null_fields(&self) -> Vec<Field> {
        fn_guard!();
        let Some(inner) = self.get() else {
            return vec![];
        };
        let mut result = Vec::new();
        for fname in inner.shape.field_names() {
            let field = inner.shape.field(&fname);
            if field.is_struct_pointer() {
                if !inner.linked_objects.borrow().contains_key(&fname) {
                    result.push(field);
                }
            } else if field.is_array_pointer() {
                if !inner.linked_arrays.borrow().contains_key(&fname) {
                    result.push(field);
                }
            } else if field.is_fn_pointer() {
                let raw = unsafe { *Self::slot_ptr::<u64>(inner, field.offset()) };
                if raw == 0 {
                    result.push(field);
                }
            }
        }
        result
    }

    /// Mark immutable; fails while any pointer field is unlinked.
    pub fn freeze(&self) -> bool {
        fn_guard!();
        if self.has_error() {
            return false;
        }
        if self.is_frozen() {
            push_error!(Jit, "trying to re-freeze an object");
            return false;
        }
        if !self.null_fields().is_empty() {
            return false;
        }
        if let Some(inner) = self.get() {
            inner.frozen.set(true);
            return true;
        }
        false
    }
}

pub(crate) struct ArrayInner {
    size: u32,
    element_type: RtType,
    element_size: u32,
    buf: RawBuf,
    child_objects: RefCell<Vec<Object>>,
    child_arrays: RefCell<Vec<Array>>,
    frozen: Cell<bool>,
}

/// A heap-resident array of runtime scalars or pointers.
pub struct Array {
    h: StrongHandle<ArrayInner>,
}

impl Clone for Array {
    fn clone(&self) -> Self {
        Array { h: self.h.clone() }
    }
}

impl PartialEq for Array {
    fn eq(&self, other: &Self) -> bool {
        if self.h.is_marked() && other.h.is_marked() {
            return true;
        }
        self.h.ptr_eq(&other.h)
    }
}

impl Array {
    /// Allocate a zeroed array of `size` elements.
    pub fn from(element_type: RtType, size: u32) -> Array {
        fn_guard!();
        if element_type == RtType::Unknown {
            push_error!(Jit, "can't create an array of unknown element type");
            return Array::null();
        }
        if size == 0 || size == u32::MAX {
            push_error!(Jit, "can't create an array of invalid size");
            return Array::null();
        }
        let element_size = element_type.size();
        let Some(buf) = RawBuf::zeroed((size * element_size) as usize, 128) else {
            push_error!(Jit, "failed to allocate array buffer");
            return Array::null();
        };
        let child_objects = if element_type == RtType::PointerStruct {
            vec![Object::null(); size as usize]
        } else {
            vec![]
        };
        let child_arrays = if element_type == RtType::PointerArray {
            vec![Array::null(); size as usize]
        } else {
            vec![]
        };
        let inner = Rc::new(ArrayInner {
            size,
            element_type,
            element_size,
            buf,
            child_objects: RefCell::new(child_objects),
            child_arrays: RefCell::new(child_arrays),
            frozen: Cell::new(false),
        });
        Array { h: StrongHandle::valid(inner) }
    }

    pub fn null() -> Array {
        Array { h: StrongHandle::null() }
    }

    pub fn has_error(&self) -> bool {
        self.h.has_error()
    }

    pub fn is_null(&self) -> bool {
        self.h.is_marked()
    }

    fn get(&self) -> Option<&Rc<ArrayInner>> {
        self.h.raw().filter(|_| !self.h.is_marked())
    }

    pub fn is_pointer(&self) -> bool {
        self.get().map(|a| a.element_type.is_pointer()).unwrap_or(false)
    }

    pub fn is_scalar(&self) -> bool {
        self.get().map(|a| !a.element_type.is_pointer()).unwrap_or(false)
    }

    pub fn is_frozen(&self) -> bool {
        self.get().map(|a| a.frozen.get()).unwrap_or(false)
    }

    pub fn num_elements(&self) -> u32 {
        self.get().map(|a| a.size).unwrap_or(u32::MAX)
    }

    pub fn element_type(&self) -> RtType {
        self.get().map(|a| a.element_type).unwrap_or(RtType::Unknown)
    }

    pub fn element_size(&self) -> u32 {
        self.get().map(|a| a.element_size).unwrap_or(u32::MAX)
    }

    pub fn ref_ptr(&self) -> *mut u8 {
        match self.get() {
            Some(a) => a.buf.ptr,
            None => std::ptr::null_mut(),
        }
    }

    pub fn get_value<T: FieldScalar>(&self, i: u32) -> Option<T> {
        fn_guard!();
        let inner = Rc::clone(self.get()?);
        if i >= inner.size {
            push_error!(Jit, "array index out of range: {}", i);
            return None;
        }
        if inner.element_type != T::RT {
            push_error!(Jit, "array element type mismatch");
            return None;
        }
        Some(unsafe { *(inner.buf.ptr as *const T).add(i as usize) })
    }

    pub fn set_value<T: FieldScalar>(&self, i: u32, v: T) {
        fn_guard!();
        let Some(inner) = self.get() else {
            push_error!(Jit, "can't access an invalid array");
            return;
        };
        if i >= inner.size {
            push_error!(Jit, "array index out of range: {}", i);
            return;
        }
        if self.is_frozen() {
            push_error!(Jit, "array already frozen, can't set a new value");
            return;
        }
        if inner.element_type != T::RT {
            push_error!(Jit, "array element type mismatch");
            return;
        }
        unsafe { *(inner.buf.ptr as *mut T).add(i as usize) = v };
    }

    pub fn get_object(&self, i: u32) -> Object {
        fn_guard!();
        let Some(inner) = self.get() else {
            return Object::null();
        };
        if i >= inner.size {
            push_error!(Jit, "array index out of range: {}", i);
            return Object::null();
        }
        if inner.element_type != RtType::PointerStruct {
            push_error!(Jit, "array element is not a struct pointer");
            return Object::null();
        }
        inner.child_objects.borrow()[i as usize].clone()
    }

    pub fn set_object(&self, i: u32, v: &Object) {
        fn_guard!();
        let Some(inner) = self.get() else {
            push_error!(Jit, "can't access an invalid array");
            return;
        };
        if v.has_error() {
            push_error!(Jit, "can't set an invalid object entry");
            return;
        }
        if i >= inner.size {
            push_error!(Jit, "array index out of range: {}", i);
            return;
        }
        if self.is_frozen() {
            push_error!(Jit, "array already frozen, can't set a new value");
            return;
        }
        if !v.is_frozen() {
            push_error!(Jit, "array entry object must be frozen before linking");
            return;
        }
        if inner.element_type != RtType::PointerStruct {
            push_error!(Jit, "array element is not a struct pointer");
            return;
        }
        unsafe { *(inner.buf.ptr as *mut u64).add(i as usize) = v.ref_ptr() as u64 };
        inner.child_objects.borrow_mut()[i as usize] = v.clone();
    }

    pub fn get_array(&self, i: u32) -> Array {
        fn_guard!();
        let Some(inner) = self.get() else {
            return Array::null();
        };
        if i >= inner.size {
            push_error!(Jit, "array index out of range: {}", i);
            return Array::null();
        }
        if inner.element_type != RtType::PointerArray {
            push_error!(Jit, "array element is not an array pointer");
            return Array::null();
        }
        inner.child_arrays.borrow()[i as usize].clone()
    }

    pub fn set_array(&self, i: u32, v: &Array) {
        fn_guard!();
        let Some(inner) = self.get() else {
            push_error!(Jit, "can't access an invalid array");
            return;
        };
        if v.has_error() {
            push_error!(Jit, "can't set an invalid array entry");
            return;
        }
        if i >= inner.size {
            push_error!(Jit, "array index out of range: {}", i);
            return;
        }
        if self.is_frozen() {
            push_error!(Jit, "array already frozen, can't set a new value");
            return;
        }
        if !v.is_frozen() {
            push_error!(Jit, "array entry must be frozen before linking");
            return;
        }
        if inner.element_type != RtType::PointerArray {
            push_error!(Jit, "array element is not an array pointer");
            return;
        }
        unsafe { *(inner.buf.ptr as *mut u64).add(i as usize) = v.ref_ptr() as u64 };
        inner.child_arrays.borrow_mut()[i as usize] = v.clone();
    }

    /// Mark immutable; pointer arrays require every slot to be linked.
    pub fn freeze(&self) -> bool {
        fn_guard!();
        let Some(inner) = self.get() else {
            return false;
        };
        if inner.frozen.get() {
            push_error!(Jit, "trying to re-freeze an array");
            return false;
        }
        match inner.element_type {
            RtType::PointerStruct => {
                if inner.child_objects.borrow().iter().any(|o| o.has_error()) {
                    return false;
                }
            }
            RtType::PointerArray => {
                if inner.child_arrays.borrow().iter().any(|a| a.has_error()) {
                    return false;
                }
            }
            _ => {}
        }
        inner.frozen.set(true);
        true
    }
}

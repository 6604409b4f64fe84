//! Construction-side behavior: type interning and validity, builder
//! lifecycle, section state machine, and the error short-circuit.

use irforge::error::ErrorKind;
use irforge::{
    CodeSectionContext, Cursor, CursorContext, ErrorContext, FnContext, FunctionBuilder,
    IfElseCond, MemberField, ModuleContext, TypeInfo, ValueInfo,
};

fn with_cursor(name: &str, body: impl FnOnce(&Cursor)) {
    ErrorContext::clear_error();
    let cursor = Cursor::new(name);
    {
        let _ctx = CursorContext::enter(&cursor);
        body(&cursor);
    }
    ErrorContext::clear_error();
}

#[test]
fn test_primitive_type_interning() {
    with_cursor("prim", |_| {
        assert!(TypeInfo::mk_int32() == TypeInfo::mk_int32());
        assert!(TypeInfo::mk_uint8() == TypeInfo::mk_uint8());
        assert!(TypeInfo::mk_float64() == TypeInfo::mk_float64());
        assert!(TypeInfo::mk_int32() != TypeInfo::mk_uint32());
        assert!(TypeInfo::mk_int32() != TypeInfo::mk_int64());
        assert!(!ErrorContext::has_error());
    });
}

#[test]
fn test_derived_type_interning() {
    with_cursor("derived", |_| {
        let int32 = TypeInfo::mk_int32();
        assert!(int32.pointer_type() == int32.pointer_type());
        assert!(TypeInfo::mk_array(&int32, 4) == TypeInfo::mk_array(&int32, 4));
        assert!(TypeInfo::mk_array(&int32, 4) != TypeInfo::mk_array(&int32, 5));
        assert!(TypeInfo::mk_vector(&int32, 4) == TypeInfo::mk_vector(&int32, 4));
        assert!(TypeInfo::mk_array(&int32, 4) != TypeInfo::mk_vector(&int32, 4));
        assert!(!ErrorContext::has_error());
    });
}

#[test]
fn test_struct_interning_same_shape() {
    with_cursor("structs", |_| {
        let int32 = TypeInfo::mk_int32();
        let fields = [MemberField::new("a", &int32), MemberField::new("b", &int32)];
        let s1 = TypeInfo::mk_struct("pair", &fields, false);
        let s2 = TypeInfo::mk_struct("pair", &fields, false);
        assert!(s1 == s2);
        assert!(!ErrorContext::has_error());

        // Same name with a different shape is rejected.
        let other = [MemberField::new("x", &int32)];
        let s3 = TypeInfo::mk_struct("pair", &other, false);
        assert!(s3.is_null());
        assert_eq!(ErrorContext::last_error().unwrap().kind(), ErrorKind::TypeError);
    });
}

#[test]
fn test_struct_duplicate_field_name() {
    with_cursor("dupfield", |_| {
        let int32 = TypeInfo::mk_int32();
        let fields = [MemberField::new("x", &int32), MemberField::new("x", &int32)];
        let s = TypeInfo::mk_struct("S", &fields, false);
        assert!(s.is_null());
        assert!(ErrorContext::has_error());
        assert_eq!(ErrorContext::last_error().unwrap().kind(), ErrorKind::TypeError);
    });
}

#[test]
fn test_struct_field_layout_offsets() {
    with_cursor("layout", |_| {
        let int8 = TypeInfo::mk_int8();
        let int32 = TypeInfo::mk_int32();
        let fields = [
            MemberField::new("a", &int8),
            MemberField::new("b", &int32),
            MemberField::new("c", &int8),
        ];
        let s = TypeInfo::mk_struct("layout_t", &fields, false);
        assert_eq!(s.field("a").offset(), 0);
        assert_eq!(s.field("b").offset(), 4);
        assert_eq!(s.field("c").offset(), 8);
        assert_eq!(s.struct_size_bytes(), 12);

        let packed = TypeInfo::mk_struct("layout_p", &fields, true);
        assert_eq!(packed.field("b").offset(), 1);
        assert_eq!(packed.struct_size_bytes(), 6);
        assert!(!ErrorContext::has_error());
    });
}

#[test]
fn test_type_validity_rules() {
    with_cursor("validity", |_| {
        let int32 = TypeInfo::mk_int32();

        // Arrays of zero elements fail.
        assert!(TypeInfo::mk_array(&int32, 0).is_null());
        ErrorContext::clear_error();

        // Vectors only take scalars.
        let ptr = int32.pointer_type();
        assert!(TypeInfo::mk_vector(&ptr, 2).is_null());
        ErrorContext::clear_error();

        // Pointer-to-scalar is not a valid struct field.
        assert!(!ptr.is_valid_struct_field());
        // Pointer-to-pointer-to-scalar is rejected too.
        assert!(!ptr.pointer_type().is_valid_struct_field());
        // Scalars are fine; pointer-to-struct is fine.
        assert!(int32.is_valid_struct_field());
        let s = TypeInfo::mk_struct("inner_t", &[MemberField::new("v", &int32)], false);
        assert!(s.pointer_type().is_valid_struct_field());
        // Pointer-to-event-fn makes a callable field.
        assert!(TypeInfo::mk_event_fn().pointer_type().is_valid_struct_field());
        ErrorContext::clear_error();

        let bad = TypeInfo::mk_struct("bad_t", &[MemberField::new("p", &ptr)], false);
        assert!(bad.is_null());
        assert!(ErrorContext::has_error());
    });
}

#[test]
fn test_struct_creation_refused_after_bind() {
    with_cursor("late", |cursor| {
        let int32 = TypeInfo::mk_int32();
        cursor.bind();
        let s = TypeInfo::mk_struct("late_t", &[MemberField::new("a", &int32)], false);
        assert!(s.is_null());
        assert!(ErrorContext::has_error());
    });
}

#[test]
fn test_hooks_refused_after_bind() {
    with_cursor("hooks", |cursor| {
        cursor.bind();
        cursor.main_module_hook_fn(|_m| {});
        assert!(ErrorContext::has_error());
    });
}

#[test]
fn test_gen_module_naming_and_iteration() {
    with_cursor("modgen", |cursor| {
        cursor.bind();
        let m1 = cursor.gen_module();
        let m2 = cursor.gen_module();
        assert_eq!(m1.name(), "modgen_1");
        assert_eq!(m2.name(), "modgen_2");
        assert_eq!(cursor.main_module().name(), "modgen");

        let mut seen = Vec::new();
        cursor.for_each_module(|m| seen.push(m.name()));
        assert_eq!(seen, vec!["modgen_1".to_string(), "modgen_2".to_string()]);
        assert!(!ErrorContext::has_error());
    });
}

#[test]
fn test_function_builder_requires_name_and_context() {
    with_cursor("fb", |cursor| {
        cursor.bind();
        let main = cursor.main_module();

        let f = FunctionBuilder::new().module(&main).compile();
        assert!(f.is_null());
        assert!(ErrorContext::has_error());
        ErrorContext::clear_error();

        let f = FunctionBuilder::new().module(&main).name("f").compile();
        assert!(f.is_null());
        assert!(ErrorContext::has_error());
    });
}

#[test]
fn test_duplicate_function_name_rejected() {
    with_cursor("dupfn", |cursor| {
        cursor.bind();
        let main = cursor.main_module();
        let ctx = FnContext::new(&TypeInfo::mk_int32());
        let f1 = FunctionBuilder::new().module(&main).name("twice").context(ctx.clone()).compile();
        assert!(!f1.is_null());
        assert!(!ErrorContext::has_error());

        let f2 = FunctionBuilder::new().module(&main).name("twice").context(ctx).compile();
        assert!(f2.is_null());
        assert!(ErrorContext::has_error());
    });
}

#[test]
fn test_fn_context_must_be_scalar_or_pointer() {
    with_cursor("fnctx", |_| {
        let int32 = TypeInfo::mk_int32();
        let s = TypeInfo::mk_struct("ctx_t", &[MemberField::new("a", &int32)], false);
        // A bare struct is rejected; a pointer to it is fine.
        let bad = FnContext::new(&s);
        assert!(!bad.is_valid());
        assert!(ErrorContext::has_error());
        ErrorContext::clear_error();

        let good = FnContext::new(&s.pointer_type());
        assert!(good.is_valid());
        assert!(!ErrorContext::has_error());
    });
}

#[test]
fn test_section_double_enter_is_error() {
    with_cursor("sections", |cursor| {
        cursor.bind();
        let main = cursor.main_module();
        let _mc = ModuleContext::enter(&main);
        let f = FunctionBuilder::new()
            .module(&main)
            .name("f")
            .context(FnContext::new(&TypeInfo::mk_int32()))
            .compile();
        let body = f.mk_section("fn_body");
        body.enter();
        body.enter();
        assert!(ErrorContext::has_error());
        assert_eq!(ErrorContext::last_error().unwrap().kind(), ErrorKind::CodeSection);

        // Subsequent terminator emission is a no-op on the errored handle.
        body.set_return_value(&ValueInfo::from_const(0i32));
        assert!(!body.is_sealed());
    });
}

#[test]
fn test_duplicate_section_name_rejected() {
    with_cursor("dupsec", |cursor| {
        cursor.bind();
        let main = cursor.main_module();
        let f = FunctionBuilder::new()
            .module(&main)
            .name("f")
            .context(FnContext::new(&TypeInfo::mk_int32()))
            .compile();
        let s1 = f.mk_section("body");
        assert!(!s1.is_null());
        let s2 = f.mk_section("body");
        assert!(s2.is_null());
        assert!(ErrorContext::has_error());
    });
}

#[test]
fn test_return_type_mismatch_is_section_error() {
    with_cursor("retmismatch", |cursor| {
        cursor.bind();
        let main = cursor.main_module();
        let _mc = ModuleContext::enter(&main);
        let f = FunctionBuilder::new()
            .module(&main)
            .name("f")
            .context(FnContext::new(&TypeInfo::mk_int32()))
            .compile();
        let body = f.mk_section("fn_body");
        body.enter();
        body.set_return_value(&ValueInfo::from_const(1.5f64));
        assert!(ErrorContext::has_error());
        assert_eq!(ErrorContext::last_error().unwrap().kind(), ErrorKind::CodeSection);
        assert!(!body.is_sealed());
    });
}

#[test]
fn test_section_lifecycle_and_clean() {
    with_cursor("lifecycle", |cursor| {
        cursor.bind();
        let main = cursor.main_module();
        let _mc = ModuleContext::enter(&main);
        let f = FunctionBuilder::new()
            .module(&main)
            .name("f")
            .context(FnContext::new(&TypeInfo::mk_int32()))
            .compile();
        let body = f.mk_section("fn_body");
        assert!(!body.is_open());
        body.enter();
        assert!(body.is_open());
        assert!(CodeSectionContext::is_current_section(&body));

        // Leaving a never-sealed section on the stack is flagged.
        let count = CodeSectionContext::clean_sealed_context();
        assert_eq!(count, 1);
        assert!(ErrorContext::has_error());
        ErrorContext::clear_error();

        // Seal it properly now.
        body.set_return_value(&ValueInfo::from_const(0i32));
        assert!(body.is_sealed());
        assert!(body.is_commit());
        assert_eq!(CodeSectionContext::section_stack_depth(), 0);
        assert_eq!(CodeSectionContext::clean_sealed_context(), 0);
        ErrorContext::clear_error();
    });
}

#[test]
fn test_branch_over_non_bool_is_branch_error() {
    with_cursor("branch", |cursor| {
        cursor.bind();
        let main = cursor.main_module();
        let _mc = ModuleContext::enter(&main);
        let f = FunctionBuilder::new()
            .module(&main)
            .name("f")
            .context(FnContext::new(&TypeInfo::mk_int32()))
            .compile();
        let body = f.mk_section("fn_body");
        body.enter();

        {
            let _cond = IfElseCond::new("c", &ValueInfo::from_const(3i32));
            assert!(ErrorContext::has_error());
            assert_eq!(ErrorContext::last_error().unwrap().kind(), ErrorKind::BranchError);
        }
        ErrorContext::clear_error();
        body.set_return_value(&ValueInfo::from_const(0i32));
        assert!(body.is_sealed());
    });
}

#[test]
fn test_values_are_never_structurally_equal() {
    with_cursor("valeq", |_| {
        let a = ValueInfo::from_const(1i32);
        let b = ValueInfo::from_const(1i32);
        assert!(a != b);
        assert!(a != a.clone());
        assert!(ValueInfo::null() == ValueInfo::null());
    });
}

#[test]
fn test_tag_propagation_through_ops() {
    with_cursor("tags", |_| {
        let a = ValueInfo::from_const(1i32);
        let b = ValueInfo::from_const(2i32);
        a.add_tag("lhs");
        b.add_tag("rhs");
        let sum = a.add(&b);
        assert!(sum.has_tag("lhs"));
        assert!(sum.has_tag("rhs"));

        let cond = ValueInfo::from_const(true);
        cond.add_tag("cond");
        let sel = cond.cond(&a, &b);
        assert!(sel.has_tag("cond"));
        assert!(sel.has_tag("lhs"));
        assert!(sel.has_tag("rhs"));
    });
}

#[test]
fn test_error_short_circuits_value_ops() {
    with_cursor("shortcircuit", |_| {
        let a = ValueInfo::from_const(1i32);
        let b = ValueInfo::from_const(2i32);
        ErrorContext::push_error(ErrorKind::Unknown, "latched", file!(), line!());
        let sum = a.add(&b);
        assert!(sum.is_null());
        ErrorContext::clear_error();

        // After clearing, the same handles work again.
        let sum = a.add(&b);
        assert!(!sum.is_null());
    });
}

#[test]
fn test_binary_type_mismatch() {
    with_cursor("binmismatch", |_| {
        let a = ValueInfo::from_const(1i32);
        let b = ValueInfo::from_const(2i64);
        let sum = a.add(&b);
        assert!(sum.is_null());
        assert_eq!(ErrorContext::last_error().unwrap().kind(), ErrorKind::ValueError);
    });
}

#[test]
fn test_cond_requires_bool_and_same_types() {
    with_cursor("condcheck", |_| {
        let i = ValueInfo::from_const(1i32);
        let j = ValueInfo::from_const(2i32);
        let sel = i.cond(&j, &j);
        assert!(sel.is_null());
        ErrorContext::clear_error();

        let c = ValueInfo::from_const(true);
        let f = ValueInfo::from_const(1.0f64);
        let sel = c.cond(&i, &f);
        assert!(sel.is_null());
        ErrorContext::clear_error();

        let sel = c.cond(&i, &j);
        assert!(!sel.is_null());
        assert!(sel.ty() == TypeInfo::mk_int32());
    });
}

#[test]
fn test_module_symbol_registry() {
    with_cursor("symbols", |cursor| {
        let int32 = TypeInfo::mk_int32();
        let _s = TypeInfo::mk_struct("reg_t", &[MemberField::new("a", &int32)], false);
        cursor.bind();
        let main = cursor.main_module();

        // The struct hook registered the symbol during bind.
        assert!(main.contains("reg_t"));
        assert!(!main.struct_type("reg_t").is_null());
        let names = main.exported_symbol_names();
        assert!(names.contains(&"reg_t".to_string()));
        assert!(!ErrorContext::has_error());

        // Unknown struct lookups report a module error.
        assert!(main.struct_type("missing_t").is_null());
        assert!(ErrorContext::has_error());
    });
}

#[test]
fn test_module_text_output() {
    with_cursor("textout", |cursor| {
        cursor.bind();
        let main = cursor.main_module();
        let _mc = ModuleContext::enter(&main);
        let f = FunctionBuilder::new()
            .module(&main)
            .name("emit_me")
            .context(FnContext::new(&TypeInfo::mk_int32()))
            .compile();
        let body = f.mk_section("fn_body");
        body.enter();
        body.set_return_value(&ValueInfo::from_const(7i32));

        let mut text = Vec::new();
        main.write_to_stream(&mut text);
        let text = String::from_utf8(text).unwrap();
        assert!(text.contains("; module textout"));
        assert!(text.contains("function %emit_me"));
        assert!(text.contains("iconst.i32 7"));
        assert!(!ErrorContext::has_error());
    });
}

#[test]
fn test_module_write_to_file() {
    with_cursor("fileout", |cursor| {
        cursor.bind();
        let main = cursor.main_module();

        let dir = tempfile::tempdir().unwrap();
        let old = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();
        main.write_output("stage1");
        std::env::set_current_dir(old).unwrap();

        let written = std::fs::read_to_string(dir.path().join("fileout_stage1.clif")).unwrap();
        assert!(written.contains("; module fileout"));
        assert!(!ErrorContext::has_error());
    });
}

#[test]
fn test_cursor_cleanup_degrades_handles() {
    with_cursor("cleanup", |cursor| {
        let int32 = TypeInfo::mk_int32();
        cursor.bind();
        let main = cursor.main_module();
        cursor.cleanup();

        assert!(!main.is_init());
        // The interned primitive handle now dangles and reports an error.
        assert_eq!(int32.size_in_bytes(), u32::MAX);
        assert!(ErrorContext::has_error());
    });
}

#[test]
fn test_cursor_context_reset_refused() {
    ErrorContext::clear_error();
    let c1 = Cursor::new("ctx1");
    let c2 = Cursor::new("ctx2");
    let _g1 = CursorContext::enter(&c1);
    {
        let _g2 = CursorContext::enter(&c2);
        assert!(ErrorContext::has_error());
        assert_eq!(ErrorContext::last_error().unwrap().kind(), ErrorKind::Context);
        ErrorContext::clear_error();
    }
    // The original context survives the failed nested guard.
    assert!(CursorContext::is_value(&c1));
    ErrorContext::clear_error();
}

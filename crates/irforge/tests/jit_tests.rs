//! End-to-end scenarios through the real JIT: build IR with the facade,
//! compile and link it, then drive the generated code through runtime
//! objects and events.

use irforge::{
    CodeSectionContext, Cursor, CursorContext, ErrorContext, FnContext, FunctionBuilder,
    IfElseCond, JitRunner, MemberField, ModuleContext, RtType, TypeInfo, ValueInfo,
};

/// Build the canonical two-field event context: `{ a: int32, result: int32 }`.
fn mk_io_struct(name: &str) -> TypeInfo {
    let int32 = TypeInfo::mk_int32();
    TypeInfo::mk_struct(
        name,
        &[MemberField::new("a", &int32), MemberField::new("result", &int32)],
        false,
    )
}

#[test]
fn test_identity_function_end_to_end() {
    ErrorContext::clear_error();
    let cursor = Cursor::new("ident");
    let _cc = CursorContext::enter(&cursor);

    let ctx_ty = mk_io_struct("ident_ctx");
    let ctx_ptr = ctx_ty.pointer_type();
    cursor.main_module_hook_fn(move |module| {
        let _mc = ModuleContext::enter(module);
        let f = FunctionBuilder::new()
            .module(module)
            .name("id")
            .context(FnContext::new(&ctx_ptr))
            .compile();
        let body = f.mk_section("fn_body");
        body.enter();
        let ctx = CodeSectionContext::current_context();
        let a = ctx.field("a").load();
        ctx.field("result").store(&a);
        CodeSectionContext::set_return_value(&ValueInfo::from_const(0i32));
        f.verify();
    });
    cursor.bind();
    assert!(!ErrorContext::has_error());

    let jit = JitRunner::new();
    jit.add_module(&cursor);
    jit.bind();
    assert!(!ErrorContext::has_error());

    let ns = jit.get_global_namespace();
    let shape = ns.struct_info("ident_ctx");
    assert_eq!(shape.size_in_bytes(), 8);

    let obj = shape.mk_object();
    obj.set_value::<i32>("a", 7);
    obj.set_value::<i32>("result", 0);
    assert!(obj.freeze());

    let event = ns.event_fn_info("id");
    assert!(event.is_init());
    assert_eq!(event.on_event(&obj), 0);
    assert_eq!(obj.get_value::<i32>("result"), Some(7));
    ErrorContext::clear_error();
}

#[test]
fn test_conditional_sign_function() {
    ErrorContext::clear_error();
    let cursor = Cursor::new("signum");
    let _cc = CursorContext::enter(&cursor);

    let ctx_ty = mk_io_struct("signum_ctx");
    let ctx_ptr = ctx_ty.pointer_type();
    cursor.main_module_hook_fn(move |module| {
        let _mc = ModuleContext::enter(module);
        let f = FunctionBuilder::new()
            .module(module)
            .name("sign")
            .context(FnContext::new(&ctx_ptr))
            .compile();
        let body = f.mk_section("fn_body");
        body.enter();
        let ctx = CodeSectionContext::current_context();
        let cond = ctx.field("a").load().less_than(&ValueInfo::from_const(0i32));

        let branch = IfElseCond::new("negative", &cond);
        branch.then_branch(|| {
            let ctx = CodeSectionContext::current_context();
            ctx.field("result").store(&ValueInfo::from_const(-1i32));
        });
        branch.else_branch(|| {
            let ctx = CodeSectionContext::current_context();
            ctx.field("result").store(&ValueInfo::from_const(1i32));
        });
        branch.bind();

        CodeSectionContext::set_return_value(&ValueInfo::from_const(0i32));
        f.verify();
    });
    cursor.bind();
    assert!(!ErrorContext::has_error());

    let jit = JitRunner::new();
    jit.add_module(&cursor);
    jit.bind();
    assert!(!ErrorContext::has_error());

    let ns = jit.get_global_namespace();
    let shape = ns.struct_info("signum_ctx");
    let event = ns.event_fn_info("sign");

    let neg = shape.mk_object();
    neg.set_value::<i32>("a", -5);
    assert!(neg.freeze());
    assert_eq!(event.on_event(&neg), 0);
    assert_eq!(neg.get_value::<i32>("result"), Some(-1));

    let pos = shape.mk_object();
    pos.set_value::<i32>("a", 42);
    assert!(pos.freeze());
    assert_eq!(event.on_event(&pos), 0);
    assert_eq!(pos.get_value::<i32>("result"), Some(1));
    ErrorContext::clear_error();
}

#[test]
fn test_freeze_requires_linked_pointer_fields() {
    ErrorContext::clear_error();
    let cursor = Cursor::new("links");
    let _cc = CursorContext::enter(&cursor);

    let int32 = TypeInfo::mk_int32();
    let child_ty = TypeInfo::mk_struct("child_t", &[MemberField::new("x", &int32)], false);
    let _parent_ty = TypeInfo::mk_struct(
        "parent_t",
        &[
            MemberField::new("child", &child_ty.pointer_type()),
            MemberField::new("v", &int32),
        ],
        false,
    );
    cursor.bind();
    assert!(!ErrorContext::has_error());

    let jit = JitRunner::new();
    jit.add_module(&cursor);
    jit.bind();
    assert!(!ErrorContext::has_error());

    let ns = jit.get_global_namespace();
    let parent_shape = ns.struct_info("parent_t");
    let child_shape = ns.struct_info("child_t");

    let parent = parent_shape.mk_object();
    parent.set_value::<i32>("v", 9);
    assert!(!parent.freeze());
    let nulls = parent.null_fields();
    assert_eq!(nulls.len(), 1);
    assert_eq!(nulls[0].name(), "child");
    assert!(!parent.is_frozen());

    // Children must be frozen before linking.
    let child = child_shape.mk_object();
    child.set_value::<i32>("x", 3);
    parent.set_object("child", &child);
    assert!(ErrorContext::has_error());
    ErrorContext::clear_error();

    assert!(child.freeze());
    parent.set_object("child", &child);
    assert!(parent.freeze());
    assert!(parent.null_fields().is_empty());
    assert!(parent.get_object("child") == child);

    // A frozen object refuses further writes.
    parent.set_value::<i32>("v", 10);
    assert!(ErrorContext::has_error());
    ErrorContext::clear_error();
    assert_eq!(parent.get_value::<i32>("v"), Some(9));
    ErrorContext::clear_error();
}

#[test]
fn test_cross_module_call() {
    ErrorContext::clear_error();
    let cursor = Cursor::new("xm");
    let _cc = CursorContext::enter(&cursor);

    let ctx_ty = mk_io_struct("xm_ctx");
    let ctx_ptr = ctx_ty.pointer_type();
    cursor.bind();

    let m1 = cursor.gen_module();
    let callee;
    {
        let _mc = ModuleContext::enter(&m1);
        callee = FunctionBuilder::new()
            .module(&m1)
            .name("callee")
            .context(FnContext::new(&ctx_ptr))
            .compile();
        let body = callee.mk_section("fn_body");
        body.enter();
        let ctx = CodeSectionContext::current_context();
        let bumped = ctx.field("a").load().add(&ValueInfo::from_const(1i32));
        ctx.field("result").store(&bumped);
        CodeSectionContext::set_return_value(&ValueInfo::from_const(0i32));
        callee.verify();
    }

    let m2 = cursor.gen_module();
    {
        let _mc = ModuleContext::enter(&m2);
        let caller = FunctionBuilder::new()
            .module(&m2)
            .name("caller")
            .context(FnContext::new(&ctx_ptr))
            .compile();
        let body = caller.mk_section("fn_body");
        body.enter();
        let ctx = CodeSectionContext::current_context();
        let r = callee.call_fn(&ctx);
        CodeSectionContext::set_return_value(&r);
        caller.verify();
    }
    // The cross-module call auto-declared the callee in the caller's
    // module.
    assert_eq!(m2.declared_imports(), vec!["callee".to_string()]);
    assert!(!ErrorContext::has_error());

    let jit = JitRunner::new();
    jit.add_module(&cursor);
    jit.bind();
    assert!(!ErrorContext::has_error());

    let ns = jit.get_global_namespace();
    let shape = ns.struct_info("xm_ctx");
    let obj = shape.mk_object();
    obj.set_value::<i32>("a", 7);
    assert!(obj.freeze());

    let event = ns.event_fn_info("caller");
    assert_eq!(event.on_event(&obj), 0);
    assert_eq!(obj.get_value::<i32>("result"), Some(8));
    ErrorContext::clear_error();
}

#[test]
fn test_local_pointer_store_load_roundtrip() {
    ErrorContext::clear_error();
    let cursor = Cursor::new("locals");
    let _cc = CursorContext::enter(&cursor);

    let ctx_ty = mk_io_struct("locals_ctx");
    let ctx_ptr = ctx_ty.pointer_type();
    let int32 = TypeInfo::mk_int32();
    cursor.main_module_hook_fn(move |module| {
        let _mc = ModuleContext::enter(module);
        let f = FunctionBuilder::new()
            .module(module)
            .name("via_local")
            .context(FnContext::new(&ctx_ptr))
            .compile();
        let body = f.mk_section("fn_body");
        body.enter();
        CodeSectionContext::push_var_context();
        let ctx = CodeSectionContext::current_context();
        // tmp starts at 5, then takes a; the read loads a back.
        CodeSectionContext::mk_ptr("tmp", &int32, Some(&ValueInfo::from_const(5i32)));
        CodeSectionContext::set("tmp", &ctx.field("a").load());
        let v = CodeSectionContext::pop("tmp");
        ctx.field("result").store(&v);
        CodeSectionContext::pop_var_context();
        CodeSectionContext::set_return_value(&ValueInfo::from_const(0i32));
        f.verify();
    });
    cursor.bind();
    assert!(!ErrorContext::has_error());

    let jit = JitRunner::new();
    jit.add_module(&cursor);
    jit.bind();

    let ns = jit.get_global_namespace();
    let shape = ns.struct_info("locals_ctx");
    let obj = shape.mk_object();
    obj.set_value::<i32>("a", 23);
    assert!(obj.freeze());
    assert_eq!(ns.event_fn_info("via_local").on_event(&obj), 0);
    assert_eq!(obj.get_value::<i32>("result"), Some(23));
    ErrorContext::clear_error();
}

#[test]
fn test_vector_lane_roundtrip() {
    ErrorContext::clear_error();
    let cursor = Cursor::new("lanes");
    let _cc = CursorContext::enter(&cursor);

    let ctx_ty = mk_io_struct("lanes_ctx");
    let ctx_ptr = ctx_ty.pointer_type();
    let int32 = TypeInfo::mk_int32();
    let vec4 = TypeInfo::mk_vector(&int32, 4);
    cursor.main_module_hook_fn(move |module| {
        let _mc = ModuleContext::enter(module);
        let f = FunctionBuilder::new()
            .module(module)
            .name("lane_echo")
            .context(FnContext::new(&ctx_ptr))
            .compile();
        let body = f.mk_section("fn_body");
        body.enter();
        let ctx = CodeSectionContext::current_context();
        let slot = ValueInfo::mk_pointer(&vec4);
        let vec = slot.load();
        let written = vec.store_vector_entry(2, &ctx.field("a").load());
        let lane = written.load_vector_entry(2);
        ctx.field("result").store(&lane);
        CodeSectionContext::set_return_value(&ValueInfo::from_const(0i32));
        f.verify();
    });
    cursor.bind();
    assert!(!ErrorContext::has_error());

    let jit = JitRunner::new();
    jit.add_module(&cursor);
    jit.bind();

    let ns = jit.get_global_namespace();
    let shape = ns.struct_info("lanes_ctx");
    let obj = shape.mk_object();
    obj.set_value::<i32>("a", 77);
    assert!(obj.freeze());
    assert_eq!(ns.event_fn_info("lane_echo").on_event(&obj), 0);
    assert_eq!(obj.get_value::<i32>("result"), Some(77));
    ErrorContext::clear_error();
}

#[test]
fn test_cast_chain_preserves_value() {
    ErrorContext::clear_error();
    let cursor = Cursor::new("casts");
    let _cc = CursorContext::enter(&cursor);

    let ctx_ty = mk_io_struct("casts_ctx");
    let ctx_ptr = ctx_ty.pointer_type();
    let int32 = TypeInfo::mk_int32();
    let int64 = TypeInfo::mk_int64();
    cursor.main_module_hook_fn(move |module| {
        let _mc = ModuleContext::enter(module);
        let f = FunctionBuilder::new()
            .module(module)
            .name("widen_narrow")
            .context(FnContext::new(&ctx_ptr))
            .compile();
        let body = f.mk_section("fn_body");
        body.enter();
        let ctx = CodeSectionContext::current_context();
        let wide = ctx.field("a").load().cast(&int64);
        let bumped = wide.add(&ValueInfo::from_const(1i64));
        ctx.field("result").store(&bumped.cast(&int32));
        CodeSectionContext::set_return_value(&ValueInfo::from_const(0i32));
        f.verify();
    });
    cursor.bind();
    assert!(!ErrorContext::has_error());

    let jit = JitRunner::new();
    jit.add_module(&cursor);
    jit.bind();

    let ns = jit.get_global_namespace();
    let shape = ns.struct_info("casts_ctx");
    let obj = shape.mk_object();
    obj.set_value::<i32>("a", 41);
    assert!(obj.freeze());
    assert_eq!(ns.event_fn_info("widen_narrow").on_event(&obj), 0);
    assert_eq!(obj.get_value::<i32>("result"), Some(42));
    ErrorContext::clear_error();
}

#[test]
fn test_optimizer_keeps_semantics() {
    ErrorContext::clear_error();
    let cursor = Cursor::new("opt");
    let _cc = CursorContext::enter(&cursor);

    let ctx_ty = mk_io_struct("opt_ctx");
    let ctx_ptr = ctx_ty.pointer_type();
    cursor.bind();
    let main = cursor.main_module();
    let f;
    {
        let _mc = ModuleContext::enter(&main);
        f = FunctionBuilder::new()
            .module(&main)
            .name("add5")
            .context(FnContext::new(&ctx_ptr))
            .compile();
        let body = f.mk_section("fn_body");
        body.enter();
        let ctx = CodeSectionContext::current_context();
        let sum = ctx
            .field("a")
            .load()
            .add(&ValueInfo::from_const(2i32))
            .add(&ValueInfo::from_const(3i32));
        ctx.field("result").store(&sum);
        CodeSectionContext::set_return_value(&ValueInfo::from_const(0i32));
    }
    assert!(!ErrorContext::has_error());

    let jit = JitRunner::new();
    let traced = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let traced_cb = std::rc::Rc::clone(&traced);
    jit.on_before_pass(move |name, _| traced_cb.borrow_mut().push(name.to_string()));
    assert!(jit.process_module_fn(&f));
    assert_eq!(*traced.borrow(), vec!["combine", "reassociate", "gvn"]);

    jit.add_module(&cursor);
    jit.bind();
    assert!(!ErrorContext::has_error());

    let ns = jit.get_global_namespace();
    let shape = ns.struct_info("opt_ctx");
    let obj = shape.mk_object();
    obj.set_value::<i32>("a", 10);
    assert!(obj.freeze());
    assert_eq!(ns.event_fn_info("add5").on_event(&obj), 0);
    assert_eq!(obj.get_value::<i32>("result"), Some(15));
    ErrorContext::clear_error();
}

#[test]
fn test_runtime_array_of_scalars() {
    ErrorContext::clear_error();
    let arr = irforge::Array::from(RtType::Int32, 4);
    arr.set_value::<i32>(0, 10);
    arr.set_value::<i32>(3, 40);
    assert_eq!(arr.get_value::<i32>(0), Some(10));
    assert_eq!(arr.get_value::<i32>(3), Some(40));
    assert_eq!(arr.num_elements(), 4);
    assert!(arr.is_scalar());
    assert!(arr.freeze());

    arr.set_value::<i32>(1, 5);
    assert!(ErrorContext::has_error());
    ErrorContext::clear_error();

    // Out-of-range and zero-size construction both fail.
    assert_eq!(arr.get_value::<i32>(9), None);
    ErrorContext::clear_error();
    assert!(irforge::Array::from(RtType::Int32, 0).is_null());
    ErrorContext::clear_error();
}

#[test]
fn test_event_invocation_safety() {
    ErrorContext::clear_error();
    let cursor = Cursor::new("safety");
    let _cc = CursorContext::enter(&cursor);

    let ctx_ty = mk_io_struct("safety_ctx");
    let ctx_ptr = ctx_ty.pointer_type();
    cursor.main_module_hook_fn(move |module| {
        let _mc = ModuleContext::enter(module);
        let f = FunctionBuilder::new()
            .module(module)
            .name("noop")
            .context(FnContext::new(&ctx_ptr))
            .compile();
        let body = f.mk_section("fn_body");
        body.enter();
        CodeSectionContext::set_return_value(&ValueInfo::from_const(0i32));
    });
    cursor.bind();

    let jit = JitRunner::new();
    jit.add_module(&cursor);
    jit.bind();
    assert!(!ErrorContext::has_error());

    let ns = jit.get_global_namespace();
    let shape = ns.struct_info("safety_ctx");
    let event = ns.event_fn_info("noop");

    // An unfrozen object is refused.
    let obj = shape.mk_object();
    assert_eq!(event.on_event(&obj), -1);
    assert!(ErrorContext::has_error());
    ErrorContext::clear_error();

    assert!(obj.freeze());
    assert_eq!(event.on_event(&obj), 0);

    // Unknown lookups degrade to nulls.
    assert!(ns.event_fn_info("missing").is_null());
    assert!(ns.struct_info("missing_t").is_null());

    // Unknown symbols report a jit error.
    assert!(jit.get_fn("nope").is_none());
    assert!(ErrorContext::has_error());
    ErrorContext::clear_error();

    // A second jit bind is an error and marks the runner.
    jit.bind();
    assert!(ErrorContext::has_error());
    ErrorContext::clear_error();
    assert!(jit.get_fn("noop").is_none());
    ErrorContext::clear_error();
}

#[test]
fn test_namespaced_events() {
    ErrorContext::clear_error();
    let cursor = Cursor::new("spaced");
    let _cc = CursorContext::enter(&cursor);

    let ctx_ty = mk_io_struct("spaced_ctx");
    let ctx_ptr = ctx_ty.pointer_type();
    cursor.main_module_hook_fn(move |module| {
        let _mc = ModuleContext::enter(module);
        let f = FunctionBuilder::new()
            .module(module)
            .name("echo")
            .namespace("mathx")
            .context(FnContext::new(&ctx_ptr))
            .compile();
        assert_eq!(f.name(), "mathx_echo");
        let body = f.mk_section("fn_body");
        body.enter();
        let ctx = CodeSectionContext::current_context();
        ctx.field("result").store(&ctx.field("a").load());
        CodeSectionContext::set_return_value(&ValueInfo::from_const(0i32));
    });
    cursor.bind();
    assert!(!ErrorContext::has_error());

    let jit = JitRunner::new();
    jit.add_module(&cursor);
    jit.bind();
    assert!(!ErrorContext::has_error());
    assert!(jit.contains_symbol_definition("mathx_echo"));

    // The struct lives in the global namespace, the event in "mathx".
    let global = jit.get_global_namespace();
    assert!(global.is_global());
    assert!(global.event_fn_info("echo").is_null());
    let mathx = jit.get_namespace("mathx");
    assert!(!mathx.is_global());
    assert!(mathx.is_bind());

    let shape = global.struct_info("spaced_ctx");
    let obj = shape.mk_object();
    obj.set_value::<i32>("a", 13);
    assert!(obj.freeze());

    let event = mathx.event_fn_info("echo");
    assert!(event.is_init());
    assert_eq!(event.symbol(), "mathx_echo");
    assert_eq!(event.on_event(&obj), 0);
    assert_eq!(obj.get_value::<i32>("result"), Some(13));
    ErrorContext::clear_error();
}

#[test]
fn test_get_fn_direct_invocation() {
    ErrorContext::clear_error();
    let cursor = Cursor::new("direct");
    let _cc = CursorContext::enter(&cursor);

    let ctx_ty = mk_io_struct("direct_ctx");
    let ctx_ptr = ctx_ty.pointer_type();
    cursor.main_module_hook_fn(move |module| {
        let _mc = ModuleContext::enter(module);
        let f = FunctionBuilder::new()
            .module(module)
            .name("double_it")
            .context(FnContext::new(&ctx_ptr))
            .compile();
        let body = f.mk_section("fn_body");
        body.enter();
        let ctx = CodeSectionContext::current_context();
        let a = ctx.field("a").load();
        ctx.field("result").store(&a.add(&a.clone()));
        CodeSectionContext::set_return_value(&ValueInfo::from_const(0i32));
    });
    cursor.bind();

    let jit = JitRunner::new();
    jit.add_module(&cursor);
    jit.bind();
    assert!(!ErrorContext::has_error());

    let ns = jit.get_global_namespace();
    let shape = ns.struct_info("direct_ctx");
    let obj = shape.mk_object();
    obj.set_value::<i32>("a", 21);
    assert!(obj.freeze());

    let raw = jit.get_fn("double_it").expect("symbol must resolve");
    let rc = unsafe { raw(obj.ref_ptr()) };
    assert_eq!(rc, 0);
    assert_eq!(obj.get_value::<i32>("result"), Some(42));
    ErrorContext::clear_error();
}

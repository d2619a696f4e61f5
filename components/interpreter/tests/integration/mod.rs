//! Integration tests for the interpreter
//!
//! Programs are assembled with the module builder, encoded, loaded through
//! the normal reader and run through the embedding API.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytecode_system::{
    function_flags, Capture, FieldDescriptor, FunctionBuilder, Module, ModuleBuilder, Opcode,
    TypeKind,
};
use core_types::{Destructor, ErrorKind, PrimitiveKind, StatusCode, Text, TypeId, Value};
use interpreter::{
    HotFunction, JitHook, NativeError, ResourceLimits, SecurityPolicy, Vm, VmConfig,
};

fn new_vm() -> Vm {
    Vm::new(VmConfig::default()).unwrap()
}

fn load(vm: &mut Vm, module: ModuleBuilder) {
    vm.load_module(&module.build().encode()).unwrap();
}

fn text(value: &Value) -> &str {
    value.as_text().map(Text::as_str).unwrap_or("")
}

/// `global += 1`
fn bump(f: &mut FunctionBuilder, global: u32, one: u32) {
    f.emit(&Opcode::LoadGlobal(global));
    f.emit(&Opcode::LoadConst(one));
    f.emit(&Opcode::Add);
    f.emit(&Opcode::StoreGlobal(global));
}

// ============================================================================
// Calls and arithmetic
// ============================================================================

#[test]
fn test_recursive_factorial() {
    let mut m = ModuleBuilder::new("fact");
    let one = m.integer(1);
    let fact = m.reserve_function();
    let mut f = FunctionBuilder::new("fact");
    let n = f.param("n");
    let recurse = f.new_label();
    f.emit(&Opcode::LoadLocal(n));
    f.emit(&Opcode::LoadConst(one));
    f.emit(&Opcode::Le);
    f.jump_if_false(recurse);
    f.emit(&Opcode::LoadConst(one));
    f.emit(&Opcode::Return);
    f.bind(recurse);
    f.emit(&Opcode::LoadLocal(n));
    f.emit(&Opcode::LoadLocal(n));
    f.emit(&Opcode::LoadConst(one));
    f.emit(&Opcode::Sub);
    f.emit(&Opcode::CallFunction {
        function: fact,
        argc: 1,
    });
    f.emit(&Opcode::Mul);
    f.emit(&Opcode::Return);
    m.define_function(fact, f).unwrap();

    let mut vm = new_vm();
    load(&mut vm, m);
    let result = vm.call("fact", &[Value::Integer(10)]).unwrap();
    assert_eq!(result, Value::Integer(3_628_800));
}

#[test]
fn test_mixed_arithmetic_promotes_to_decimal() {
    let mut m = ModuleBuilder::new("mix");
    let mut f = FunctionBuilder::new("mix");
    let a = f.param("a");
    let b = f.param("b");
    f.emit(&Opcode::LoadLocal(a));
    f.emit(&Opcode::LoadLocal(b));
    f.emit(&Opcode::Add);
    f.emit(&Opcode::Return);
    m.add_function(f).unwrap();

    let mut vm = new_vm();
    load(&mut vm, m);
    assert_eq!(
        vm.call("mix", &[Value::Integer(1), Value::Decimal(0.5)]).unwrap(),
        Value::Decimal(1.5)
    );
    assert_eq!(
        vm.call("mix", &[Value::Integer(i64::MAX), Value::Integer(1)]).unwrap(),
        Value::Integer(i64::MIN)
    );
    let joined = vm.call("mix", &[Value::from("ab"), Value::from("cd")]).unwrap();
    assert_eq!(text(&joined), "abcd");
}

#[test]
fn test_optional_and_variadic_parameters() {
    let mut m = ModuleBuilder::new("params");
    let mut f = FunctionBuilder::new("count");
    f.param("first");
    let maybe = f.optional_param("maybe");
    let rest = f.variadic_param("rest");
    let done = f.new_label();
    f.emit(&Opcode::LoadLocal(maybe));
    f.emit(&Opcode::PushNull);
    f.emit(&Opcode::Eq);
    f.jump_if_false(done);
    f.emit(&Opcode::PushNull);
    f.emit(&Opcode::Return);
    f.bind(done);
    f.emit(&Opcode::LoadLocal(rest));
    f.emit(&Opcode::Len);
    f.emit(&Opcode::Return);
    m.add_function(f).unwrap();

    let mut vm = new_vm();
    load(&mut vm, m);
    assert_eq!(vm.call("count", &[Value::Integer(1)]).unwrap(), Value::Null);
    let args: Vec<Value> = (0..5).map(Value::Integer).collect();
    assert_eq!(vm.call("count", &args).unwrap(), Value::Integer(3));
    let err = vm.call("count", &[]).unwrap_err();
    assert!(err.message.contains("expects at least 1"), "{}", err.message);
}

#[test]
fn test_call_depth_is_bounded() {
    let mut m = ModuleBuilder::new("deep");
    let down = m.reserve_function();
    let mut f = FunctionBuilder::new("down");
    f.emit(&Opcode::CallFunction {
        function: down,
        argc: 0,
    });
    f.emit(&Opcode::Return);
    m.define_function(down, f).unwrap();

    let mut vm = Vm::new(VmConfig {
        max_call_depth: 64,
        ..VmConfig::default()
    })
    .unwrap();
    load(&mut vm, m);
    let err = vm.call("down", &[]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::UncaughtException);
    assert!(err.message.contains("call stack overflow"));
    assert!(!err.stack_trace.is_empty());
}

#[test]
fn test_undefined_global_is_error() {
    let mut m = ModuleBuilder::new("globals");
    let name = m.text("missing");
    let mut f = FunctionBuilder::new("read");
    f.emit(&Opcode::LoadGlobal(name));
    f.emit(&Opcode::Return);
    m.add_function(f).unwrap();

    let mut vm = new_vm();
    load(&mut vm, m);
    let err = vm.call("read", &[]).unwrap_err();
    assert!(err.message.contains("undefined global `missing`"));

    vm.set_global("missing", Value::Integer(3));
    assert_eq!(vm.call("read", &[]).unwrap(), Value::Integer(3));
}

// ============================================================================
// Closures
// ============================================================================

fn counter_module() -> ModuleBuilder {
    let mut m = ModuleBuilder::new("counter");
    let zero = m.integer(0);
    let one = m.integer(1);

    let mut inc = FunctionBuilder::new("increment");
    inc.upvalues(1);
    inc.emit(&Opcode::LoadUpvalue(0));
    inc.emit(&Opcode::LoadConst(one));
    inc.emit(&Opcode::Add);
    inc.emit(&Opcode::Dup);
    inc.emit(&Opcode::StoreUpvalue(0));
    inc.emit(&Opcode::Return);
    let inc = m.add_function(inc).unwrap();

    let mut make = FunctionBuilder::new("make_counter");
    let count = make.local("count");
    make.emit(&Opcode::LoadConst(zero));
    make.emit(&Opcode::StoreLocal(count));
    make.emit(&Opcode::MakeClosure {
        function: inc,
        captures: vec![Capture::Local(count)],
    });
    make.emit(&Opcode::Return);
    m.add_function(make).unwrap();
    m
}

#[test]
fn test_closures_keep_independent_state() {
    let mut vm = new_vm();
    load(&mut vm, counter_module());
    let first = vm.call("make_counter", &[]).unwrap();
    let second = vm.call("make_counter", &[]).unwrap();

    assert_eq!(vm.call_value(&first, &[]).unwrap(), Value::Integer(1));
    assert_eq!(vm.call_value(&first, &[]).unwrap(), Value::Integer(2));
    assert_eq!(vm.call_value(&second, &[]).unwrap(), Value::Integer(1));
    assert_eq!(vm.type_of(&first), TypeId::FUNCTION);
}

#[test]
fn test_open_upvalue_aliases_enclosing_local() {
    let mut m = ModuleBuilder::new("alias");
    let one = m.integer(1);
    let ten = m.integer(10);

    let mut bump10 = FunctionBuilder::new("bump");
    bump10.upvalues(1);
    bump10.emit(&Opcode::LoadUpvalue(0));
    bump10.emit(&Opcode::LoadConst(ten));
    bump10.emit(&Opcode::Add);
    bump10.emit(&Opcode::StoreUpvalue(0));
    bump10.emit(&Opcode::PushNull);
    bump10.emit(&Opcode::Return);
    let bump10 = m.add_function(bump10).unwrap();

    let mut outer = FunctionBuilder::new("outer");
    let x = outer.local("x");
    outer.emit(&Opcode::LoadConst(one));
    outer.emit(&Opcode::StoreLocal(x));
    outer.emit(&Opcode::MakeClosure {
        function: bump10,
        captures: vec![Capture::Local(x)],
    });
    outer.emit(&Opcode::Call(0));
    outer.emit(&Opcode::Pop);
    outer.emit(&Opcode::LoadLocal(x));
    outer.emit(&Opcode::Return);
    m.add_function(outer).unwrap();

    let mut vm = new_vm();
    load(&mut vm, m);
    assert_eq!(vm.call("outer", &[]).unwrap(), Value::Integer(11));
}

// ============================================================================
// Exceptions
// ============================================================================

#[test]
fn test_runtime_fault_is_catchable() {
    let mut m = ModuleBuilder::new("div");
    let message = m.text("message");
    let mut f = FunctionBuilder::new("safe_div");
    let a = f.param("a");
    let b = f.param("b");
    let r = f.local("r");
    let catch = f.new_label();
    let exit = f.new_label();
    f.try_begin(Some(catch), None, None);
    f.emit(&Opcode::LoadLocal(a));
    f.emit(&Opcode::LoadLocal(b));
    f.emit(&Opcode::Div);
    f.emit(&Opcode::StoreLocal(r));
    f.try_end(exit);
    f.bind(catch);
    f.emit(&Opcode::GetField(message));
    f.emit(&Opcode::StoreLocal(r));
    f.catch_end(exit);
    f.bind(exit);
    f.emit(&Opcode::LoadLocal(r));
    f.emit(&Opcode::Return);
    m.add_function(f).unwrap();

    let mut vm = new_vm();
    load(&mut vm, m);
    assert_eq!(
        vm.call("safe_div", &[Value::Integer(7), Value::Integer(2)]).unwrap(),
        Value::Integer(3)
    );
    let caught = vm
        .call("safe_div", &[Value::Integer(7), Value::Integer(0)])
        .unwrap();
    assert_eq!(text(&caught), "integer division by zero");
}

#[test]
fn test_catch_filter_selects_error_type() {
    let mut m = ModuleBuilder::new("filter");
    let denied_type = m.add_type("PermissionDenied", TypeKind::External("PermissionDenied".into()));
    let mismatch_type = m.add_type("TypeMismatch", TypeKind::External("TypeMismatch".into()));
    let denied = m.text("denied");
    let read = m.add_native_function("fs.read_text", 1);

    for (name, filter) in [("guarded", denied_type), ("misfiltered", mismatch_type)] {
        let mut f = FunctionBuilder::new(name);
        let path = f.param("path");
        let catch = f.new_label();
        f.try_begin(Some(catch), None, Some(filter));
        f.emit(&Opcode::LoadLocal(path));
        f.emit(&Opcode::CallFunction {
            function: read,
            argc: 1,
        });
        f.emit(&Opcode::Return);
        f.bind(catch);
        f.emit(&Opcode::Pop);
        f.emit(&Opcode::LoadConst(denied));
        f.emit(&Opcode::Return);
        m.add_function(f).unwrap();
    }

    let mut vm = new_vm();
    load(&mut vm, m);
    let path = Value::from("/etc/hostname");
    assert_eq!(text(&vm.call("guarded", &[path.clone()]).unwrap()), "denied");

    let err = vm.call("misfiltered", &[path]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::PermissionDenied);
    let exception = err.exception.expect("exception value");
    assert_eq!(vm.type_of(&exception), TypeId::PERMISSION_DENIED_ERROR);
    assert!(vm.is_instance(&exception, TypeId::ERROR));
}

#[test]
fn test_uncaught_value_reports_trace() {
    let mut m = ModuleBuilder::new("trace");
    m.source_file("trace.runa");
    let boom = m.text("boom");
    let mut inner = FunctionBuilder::new("inner");
    inner.line(3, 5);
    inner.emit(&Opcode::LoadConst(boom));
    inner.line(4, 5);
    inner.emit(&Opcode::Throw);
    let inner = m.add_function(inner).unwrap();
    let mut outer = FunctionBuilder::new("outer");
    outer.line(9, 1);
    outer.emit(&Opcode::CallFunction {
        function: inner,
        argc: 0,
    });
    outer.emit(&Opcode::Return);
    m.add_function(outer).unwrap();

    let mut vm = new_vm();
    load(&mut vm, m);
    let err = vm.call("outer", &[]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::UncaughtException);
    assert_eq!(err.exception.as_ref().map(text), Some("boom"));
    let names: Vec<&str> = err
        .stack_trace
        .iter()
        .map(|f| f.function_name.as_str())
        .collect();
    assert_eq!(names, ["inner", "outer"]);
    let location = err.location.expect("location from debug info");
    assert_eq!((location.file.as_str(), location.line), ("trace.runa", 4));
    assert_eq!(vm.last_error().map(|e| e.kind), Some(ErrorKind::UncaughtException));
}

fn finally_module() -> ModuleBuilder {
    let mut m = ModuleBuilder::new("finally");
    let runs = m.text("runs");
    let one = m.integer(1);
    let two = m.integer(2);
    let boom = m.text("boom");

    // try {} finally { runs += 1 } return 1
    let mut f = FunctionBuilder::new("normal");
    let fin = f.new_label();
    let exit = f.new_label();
    f.try_begin(None, Some(fin), None);
    f.emit(&Opcode::Nop);
    f.try_end(exit);
    f.bind(fin);
    bump(&mut f, runs, one);
    f.emit(&Opcode::EndFinally);
    f.bind(exit);
    f.emit(&Opcode::LoadConst(one));
    f.emit(&Opcode::Return);
    m.add_function(f).unwrap();

    // try { return 1 } finally { runs += 1 }
    let mut f = FunctionBuilder::new("returning");
    let fin = f.new_label();
    f.try_begin(None, Some(fin), None);
    f.emit(&Opcode::LoadConst(one));
    f.emit(&Opcode::Return);
    f.bind(fin);
    bump(&mut f, runs, one);
    f.emit(&Opcode::EndFinally);
    f.emit(&Opcode::PushNull);
    f.emit(&Opcode::Return);
    m.add_function(f).unwrap();

    // try { return 1 } finally { return 2 }
    let mut f = FunctionBuilder::new("overriding");
    let fin = f.new_label();
    f.try_begin(None, Some(fin), None);
    f.emit(&Opcode::LoadConst(one));
    f.emit(&Opcode::Return);
    f.bind(fin);
    f.emit(&Opcode::LoadConst(two));
    f.emit(&Opcode::Return);
    m.add_function(f).unwrap();

    // try { throw "boom" } finally { runs += 1 }
    let mut f = FunctionBuilder::new("throwing");
    let fin = f.new_label();
    f.try_begin(None, Some(fin), None);
    f.emit(&Opcode::LoadConst(boom));
    f.emit(&Opcode::Throw);
    f.bind(fin);
    bump(&mut f, runs, one);
    f.emit(&Opcode::EndFinally);
    f.emit(&Opcode::PushNull);
    f.emit(&Opcode::Return);
    let throwing = m.add_function(f).unwrap();

    // try { throwing() } catch (e) { r = e }
    let mut f = FunctionBuilder::new("catching_caller");
    let e = f.local("e");
    let catch = f.new_label();
    let exit = f.new_label();
    f.try_begin(Some(catch), None, None);
    f.emit(&Opcode::CallFunction {
        function: throwing,
        argc: 0,
    });
    f.emit(&Opcode::Pop);
    f.try_end(exit);
    f.bind(catch);
    f.emit(&Opcode::StoreLocal(e));
    f.catch_end(exit);
    f.bind(exit);
    f.emit(&Opcode::LoadLocal(e));
    f.emit(&Opcode::Return);
    m.add_function(f).unwrap();

    // try { throw } catch (e) { r = e } finally { runs += 1 } return r
    let mut f = FunctionBuilder::new("catch_and_finally");
    let r = f.local("r");
    let catch = f.new_label();
    let fin = f.new_label();
    let exit = f.new_label();
    f.try_begin(Some(catch), Some(fin), None);
    f.emit(&Opcode::LoadConst(boom));
    f.emit(&Opcode::Throw);
    f.bind(catch);
    f.emit(&Opcode::StoreLocal(r));
    f.catch_end(exit);
    f.bind(fin);
    bump(&mut f, runs, one);
    f.emit(&Opcode::EndFinally);
    f.bind(exit);
    f.emit(&Opcode::LoadLocal(r));
    f.emit(&Opcode::Return);
    m.add_function(f).unwrap();

    // try { throw } catch (e) { throw e } finally { runs += 1 }
    let mut f = FunctionBuilder::new("rethrowing");
    let catch = f.new_label();
    let fin = f.new_label();
    f.try_begin(Some(catch), Some(fin), None);
    f.emit(&Opcode::LoadConst(boom));
    f.emit(&Opcode::Throw);
    f.bind(catch);
    f.emit(&Opcode::Throw);
    f.bind(fin);
    bump(&mut f, runs, one);
    f.emit(&Opcode::EndFinally);
    f.emit(&Opcode::PushNull);
    f.emit(&Opcode::Return);
    m.add_function(f).unwrap();
    m
}

#[test]
fn test_finally_runs_exactly_once_per_exit_path() {
    let mut vm = new_vm();
    load(&mut vm, finally_module());
    let runs = |vm: &Vm| vm.get_global("runs");

    vm.set_global("runs", Value::Integer(0));
    assert_eq!(vm.call("normal", &[]).unwrap(), Value::Integer(1));
    assert_eq!(runs(&vm), Some(Value::Integer(1)));

    vm.set_global("runs", Value::Integer(0));
    assert_eq!(vm.call("returning", &[]).unwrap(), Value::Integer(1));
    assert_eq!(runs(&vm), Some(Value::Integer(1)));

    vm.set_global("runs", Value::Integer(0));
    let caught = vm.call("catching_caller", &[]).unwrap();
    assert_eq!(text(&caught), "boom");
    assert_eq!(runs(&vm), Some(Value::Integer(1)));

    vm.set_global("runs", Value::Integer(0));
    let caught = vm.call("catch_and_finally", &[]).unwrap();
    assert_eq!(text(&caught), "boom");
    assert_eq!(runs(&vm), Some(Value::Integer(1)));

    vm.set_global("runs", Value::Integer(0));
    let err = vm.call("rethrowing", &[]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::UncaughtException);
    assert_eq!(runs(&vm), Some(Value::Integer(1)));
}

#[test]
fn test_return_in_finally_supersedes_pending_return() {
    let mut vm = new_vm();
    load(&mut vm, finally_module());
    assert_eq!(vm.call("overriding", &[]).unwrap(), Value::Integer(2));
}

/// `tmp = 7; throw "boom"` inside a try, with a finally that publishes `tmp`
fn scoped_throw(m: &mut ModuleBuilder, name: &str) -> (u32, u32) {
    let seen = m.text("seen");
    let boom = m.text("boom");
    let seven = m.integer(7);
    let mut f = FunctionBuilder::new(name);
    let tmp = f.local("tmp");
    let fin = f.new_label();
    f.try_begin(None, Some(fin), None);
    f.emit(&Opcode::LoadConst(seven));
    f.emit(&Opcode::StoreLocal(tmp));
    f.emit(&Opcode::LoadConst(boom));
    f.emit(&Opcode::Throw);
    let body_end = f.offset();
    f.bind(fin);
    f.emit(&Opcode::LoadLocal(tmp));
    f.emit(&Opcode::StoreGlobal(seen));
    f.emit(&Opcode::EndFinally);
    f.emit(&Opcode::PushNull);
    f.emit(&Opcode::Return);
    (m.add_function(f).unwrap(), body_end)
}

#[test]
fn test_throw_into_finally_releases_try_scoped_locals() {
    let mut m = ModuleBuilder::new("scopes");
    let (scoped, body_end) = scoped_throw(&mut m, "scoped");
    scoped_throw(&mut m, "whole");
    let mut module = m.build();
    module.functions[scoped as usize].locals[0].scope_end = body_end;

    let mut vm = new_vm();
    vm.load_module(&module.encode()).unwrap();

    vm.set_global("seen", Value::Integer(0));
    let err = vm.call("scoped", &[]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::UncaughtException);
    assert_eq!(vm.get_global("seen"), Some(Value::Null));

    vm.set_global("seen", Value::Integer(0));
    let err = vm.call("whole", &[]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::UncaughtException);
    assert_eq!(vm.get_global("seen"), Some(Value::Integer(7)));
}

// ============================================================================
// Generators and async functions
// ============================================================================

fn generator_module() -> ModuleBuilder {
    let mut m = ModuleBuilder::new("gen");
    let zero = m.integer(0);
    let one = m.integer(1);
    let three = m.integer(3);
    let suffix = m.text(" done");
    let request = m.text("request");

    // for i in 0..n { yield i }
    let mut g = FunctionBuilder::new("count_to");
    g.flags(function_flags::GENERATOR);
    let n = g.param("n");
    let i = g.local("i");
    let top = g.new_label();
    let done = g.new_label();
    g.emit(&Opcode::LoadConst(zero));
    g.emit(&Opcode::StoreLocal(i));
    g.bind(top);
    g.emit(&Opcode::LoadLocal(i));
    g.emit(&Opcode::LoadLocal(n));
    g.emit(&Opcode::Lt);
    g.jump_if_false(done);
    g.emit(&Opcode::LoadLocal(i));
    g.emit(&Opcode::Yield);
    g.emit(&Opcode::Pop);
    g.emit(&Opcode::LoadLocal(i));
    g.emit(&Opcode::LoadConst(one));
    g.emit(&Opcode::Add);
    g.emit(&Opcode::StoreLocal(i));
    g.jump(top);
    g.bind(done);
    g.emit(&Opcode::PushNull);
    g.emit(&Opcode::Return);
    let count_to = m.add_function(g).unwrap();

    // sum of count_to(3), driven from bytecode
    let mut s = FunctionBuilder::new("sum_three");
    let gen = s.local("gen");
    let total = s.local("total");
    let top = s.new_label();
    let finish = s.new_label();
    s.emit(&Opcode::LoadConst(three));
    s.emit(&Opcode::CallFunction {
        function: count_to,
        argc: 1,
    });
    s.emit(&Opcode::StoreLocal(gen));
    s.emit(&Opcode::LoadConst(zero));
    s.emit(&Opcode::StoreLocal(total));
    s.bind(top);
    s.emit(&Opcode::LoadLocal(gen));
    s.emit(&Opcode::PushNull);
    s.emit(&Opcode::Resume);
    s.jump_if_true(finish);
    s.emit(&Opcode::LoadLocal(total));
    s.emit(&Opcode::Add);
    s.emit(&Opcode::StoreLocal(total));
    s.jump(top);
    s.bind(finish);
    s.emit(&Opcode::Pop);
    s.emit(&Opcode::LoadLocal(total));
    s.emit(&Opcode::Return);
    m.add_function(s).unwrap();

    // await "request", then append " done" to the reply
    let mut a = FunctionBuilder::new("fetch");
    a.flags(function_flags::ASYNC);
    a.emit(&Opcode::LoadConst(request));
    a.emit(&Opcode::Await);
    a.emit(&Opcode::LoadConst(suffix));
    a.emit(&Opcode::Add);
    a.emit(&Opcode::Return);
    m.add_function(a).unwrap();
    m
}

#[test]
fn test_host_drives_generator() {
    let mut vm = new_vm();
    load(&mut vm, generator_module());
    let gen = vm.call("count_to", &[Value::Integer(3)]).unwrap();
    assert_eq!(vm.type_of(&gen), TypeId::CONTINUATION);

    for expected in 0..3 {
        let (value, done) = vm.resume(&gen, Value::Null).unwrap();
        assert_eq!((value, done), (Value::Integer(expected), false));
    }
    assert_eq!(vm.resume(&gen, Value::Null).unwrap(), (Value::Null, true));
    let err = vm.resume(&gen, Value::Null).unwrap_err();
    assert!(err.message.contains("finished"), "{}", err.message);
}

#[test]
fn test_bytecode_drives_generator() {
    let mut vm = new_vm();
    load(&mut vm, generator_module());
    assert_eq!(vm.call("sum_three", &[]).unwrap(), Value::Integer(3));
    assert_eq!(vm.live_continuations(), 0);
}

#[test]
fn test_async_function_receives_awaited_value() {
    let mut vm = new_vm();
    load(&mut vm, generator_module());
    let task = vm.call("fetch", &[]).unwrap();
    let (request, done) = vm.resume(&task, Value::Null).unwrap();
    assert_eq!((text(&request), done), ("request", false));
    let (reply, done) = vm.resume(&task, Value::from("reply")).unwrap();
    assert_eq!((text(&reply), done), ("reply done", true));
}

#[test]
fn test_dropped_generator_releases_its_slot() {
    let mut vm = new_vm();
    load(&mut vm, generator_module());
    let gen = vm.call("count_to", &[Value::Integer(10)]).unwrap();
    vm.resume(&gen, Value::Null).unwrap();
    assert_eq!(vm.live_continuations(), 1);
    drop(gen);
    assert_eq!(vm.live_continuations(), 0);
}

// ============================================================================
// Structs, methods and host types
// ============================================================================

fn geometry_module() -> ModuleBuilder {
    let mut m = ModuleBuilder::new("geo");
    let int = m.primitive(PrimitiveKind::Integer);
    let point = m.add_type(
        "Point",
        TypeKind::Struct {
            size: 16,
            fields: vec![
                FieldDescriptor {
                    name: "x".into(),
                    type_id: int,
                    offset: 0,
                    flags: 0,
                },
                FieldDescriptor {
                    name: "y".into(),
                    type_id: int,
                    offset: 8,
                    flags: 0,
                },
            ],
        },
    );
    let x = m.text("x");
    let y = m.text("y");
    let sum = m.text("sum");
    let three = m.integer(3);
    let four = m.integer(4);
    let word = m.text("four");

    let mut method = FunctionBuilder::new("Point.sum");
    method.flags(function_flags::METHOD);
    let this = method.param("self");
    method.emit(&Opcode::LoadLocal(this));
    method.emit(&Opcode::GetField(x));
    method.emit(&Opcode::LoadLocal(this));
    method.emit(&Opcode::GetField(y));
    method.emit(&Opcode::Add);
    method.emit(&Opcode::Return);
    m.add_function(method).unwrap();

    let mut main = FunctionBuilder::new("point_sum");
    main.emit(&Opcode::LoadConst(three));
    main.emit(&Opcode::LoadConst(four));
    main.emit(&Opcode::NewStruct(point));
    main.emit(&Opcode::CallMethod { name: sum, argc: 0 });
    main.emit(&Opcode::Return);
    m.add_function(main).unwrap();

    let mut bad = FunctionBuilder::new("bad_point");
    bad.emit(&Opcode::LoadConst(three));
    bad.emit(&Opcode::LoadConst(word));
    bad.emit(&Opcode::NewStruct(point));
    bad.emit(&Opcode::Return);
    m.add_function(bad).unwrap();

    let mut set = FunctionBuilder::new("set_x");
    let p = set.param("p");
    let v = set.param("v");
    set.emit(&Opcode::LoadLocal(p));
    set.emit(&Opcode::LoadLocal(v));
    set.emit(&Opcode::SetField(x));
    set.emit(&Opcode::LoadLocal(p));
    set.emit(&Opcode::TypeCheck(point));
    set.emit(&Opcode::Return);
    m.add_function(set).unwrap();

    let mut make = FunctionBuilder::new("make_point");
    make.emit(&Opcode::LoadConst(three));
    make.emit(&Opcode::LoadConst(four));
    make.emit(&Opcode::NewStruct(point));
    make.emit(&Opcode::Return);
    m.add_function(make).unwrap();
    m
}

#[test]
fn test_struct_method_dispatch() {
    let mut vm = new_vm();
    load(&mut vm, geometry_module());
    assert_eq!(vm.call("point_sum", &[]).unwrap(), Value::Integer(7));
    let point = vm.call("make_point", &[]).unwrap();
    let point_type = vm.type_id("geo.Point").unwrap();
    assert_eq!(vm.type_of(&point), point_type);
    assert!(vm.is_instance(&point, TypeId::MAP));
}

#[test]
fn test_struct_fields_are_typed() {
    let mut vm = new_vm();
    load(&mut vm, geometry_module());
    let err = vm.call("bad_point", &[]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::TypeMismatch);

    let point = vm.call("make_point", &[]).unwrap();
    assert_eq!(
        vm.call("set_x", &[point.clone(), Value::Integer(9)]).unwrap(),
        Value::Boolean(true)
    );
    let err = vm.call("set_x", &[point, Value::from("nine")]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::TypeMismatch);
}

#[test]
fn test_host_type_method_and_destructor() {
    let mut vm = new_vm();
    let dropped = Arc::new(AtomicUsize::new(0));
    let seen = dropped.clone();
    let destructor: Destructor = Arc::new(move |_data: &mut (dyn Any + Send + Sync)| {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    let handle_type = vm.register_type("Handle", Some(destructor)).unwrap();
    vm.register_native("host.describe", |ctx, args| {
        let name = ctx.type_name(&args[0]).to_string();
        ctx.new_text(&format!("a {}", name))
    });
    let describe = vm.native("host.describe").unwrap();
    vm.register_method(handle_type, "describe", describe).unwrap();

    let mut m = ModuleBuilder::new("handles");
    let h = m.text("h");
    let name = m.text("describe");
    let mut f = FunctionBuilder::new("describe_handle");
    f.emit(&Opcode::LoadGlobal(h));
    f.emit(&Opcode::CallMethod { name, argc: 0 });
    f.emit(&Opcode::Return);
    m.add_function(f).unwrap();
    load(&mut vm, m);

    let handle = vm.new_custom(handle_type, Box::new(5u32)).unwrap();
    vm.set_global("h", handle);
    let described = vm.call("describe_handle", &[]).unwrap();
    assert_eq!(text(&described), "a Handle");

    vm.set_global("h", Value::Null);
    assert_eq!(dropped.load(Ordering::SeqCst), 1);
}

#[test]
fn test_import_exposes_named_functions() {
    let mut lib = ModuleBuilder::new("lib");
    let three = lib.integer(3);
    let mut triple = FunctionBuilder::new("triple");
    let n = triple.param("n");
    triple.emit(&Opcode::LoadLocal(n));
    triple.emit(&Opcode::LoadConst(three));
    triple.emit(&Opcode::Mul);
    triple.emit(&Opcode::Return);
    lib.add_function(triple).unwrap();

    let mut app = ModuleBuilder::new("app");
    let lib_name = app.text("lib");
    let triple_name = app.text("triple");
    let five = app.integer(5);
    let mut main = FunctionBuilder::new("main");
    main.emit(&Opcode::Import(lib_name));
    main.emit(&Opcode::GetField(triple_name));
    main.emit(&Opcode::LoadConst(five));
    main.emit(&Opcode::Call(1));
    main.emit(&Opcode::Return);
    app.add_function(main).unwrap();

    let mut vm = new_vm();
    load(&mut vm, lib);
    let app_id = vm.load_module(&app.build().encode()).unwrap();
    assert_eq!(vm.call_in(app_id, "main", &[]).unwrap(), Value::Integer(15));
}

// ============================================================================
// Natives
// ============================================================================

#[test]
fn test_native_functions_and_data() {
    let mut vm = new_vm();
    vm.register_native("host.add", |_ctx, args| match (&args[0], &args[1]) {
        (Value::Integer(a), Value::Integer(b)) => Ok(Value::Integer(a + b)),
        _ => Err(NativeError::Failed("host.add takes integers".into())),
    });
    vm.register_native_with_data("host.scale", Arc::new(10i64), |ctx, args| {
        let factor = ctx.data::<i64>().copied().unwrap_or(1);
        Ok(Value::Integer(args[0].as_integer().unwrap_or(0) * factor))
    });

    let mut m = ModuleBuilder::new("natives");
    m.require_native("host");
    let add = m.add_native_function("host.add", 2);
    let scale = m.add_native_function("host.scale", 1);
    let two = m.integer(2);
    let forty = m.integer(40);
    let word = m.text("x");
    let mut f = FunctionBuilder::new("main");
    f.emit(&Opcode::LoadConst(two));
    f.emit(&Opcode::LoadConst(forty));
    f.emit(&Opcode::CallFunction {
        function: add,
        argc: 2,
    });
    f.emit(&Opcode::CallFunction {
        function: scale,
        argc: 1,
    });
    f.emit(&Opcode::Return);
    m.add_function(f).unwrap();
    let mut f = FunctionBuilder::new("misuse");
    f.emit(&Opcode::LoadConst(two));
    f.emit(&Opcode::LoadConst(word));
    f.emit(&Opcode::CallFunction {
        function: add,
        argc: 2,
    });
    f.emit(&Opcode::Return);
    m.add_function(f).unwrap();
    load(&mut vm, m);

    assert_eq!(vm.call("main", &[]).unwrap(), Value::Integer(420));
    let err = vm.call("misuse", &[]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::HostCallbackError);
    assert!(err.message.contains("host.add takes integers"));
}

#[test]
fn test_native_can_throw_catchable_value() {
    let mut vm = new_vm();
    vm.register_native("host.reject", |_ctx, _args| {
        Err(NativeError::Thrown(Value::Integer(7)))
    });
    let mut m = ModuleBuilder::new("reject");
    let reject = m.add_native_function("host.reject", 0);
    let mut f = FunctionBuilder::new("main");
    let catch = f.new_label();
    f.try_begin(Some(catch), None, None);
    f.emit(&Opcode::CallFunction {
        function: reject,
        argc: 0,
    });
    f.emit(&Opcode::Return);
    f.bind(catch);
    f.emit(&Opcode::Return);
    m.add_function(f).unwrap();
    load(&mut vm, m);
    assert_eq!(vm.call("main", &[]).unwrap(), Value::Integer(7));
}

#[derive(Default)]
struct RecordingHook {
    hot: Mutex<Vec<(String, u64)>>,
}

impl JitHook for RecordingHook {
    fn function_hot(&self, function: &HotFunction<'_>) {
        self.hot
            .lock()
            .unwrap()
            .push((function.function.to_string(), function.calls));
    }
}

#[test]
fn test_jit_hook_notified_once_at_threshold() {
    let mut vm = Vm::new(VmConfig {
        jit_threshold: 3,
        ..VmConfig::default()
    })
    .unwrap();
    let hook = Arc::new(RecordingHook::default());
    vm.set_jit_hook(hook.clone());
    let mut m = ModuleBuilder::new("hot");
    let mut f = FunctionBuilder::new("tick");
    f.emit(&Opcode::PushTrue);
    f.emit(&Opcode::Return);
    m.add_function(f).unwrap();
    let id = vm.load_module(&m.build().encode()).unwrap();

    for _ in 0..5 {
        vm.call("tick", &[]).unwrap();
    }
    assert_eq!(vm.call_count(id, "tick"), 5);
    assert_eq!(*hook.hot.lock().unwrap(), vec![("tick".to_string(), 3)]);
}

// ============================================================================
// Memory
// ============================================================================

#[test]
fn test_collector_reclaims_bytecode_cycle() {
    let mut m = ModuleBuilder::new("cycle");
    let field = m.text("me");
    let mut f = FunctionBuilder::new("make_cycle");
    let a = f.local("a");
    f.emit(&Opcode::NewMap(0));
    f.emit(&Opcode::StoreLocal(a));
    f.emit(&Opcode::LoadLocal(a));
    f.emit(&Opcode::LoadLocal(a));
    f.emit(&Opcode::SetField(field));
    f.emit(&Opcode::PushNull);
    f.emit(&Opcode::Return);
    m.add_function(f).unwrap();

    let mut vm = new_vm();
    load(&mut vm, m);
    vm.call("make_cycle", &[]).unwrap();
    let before = vm.heap_stats().live;
    assert!(vm.collect_garbage() >= 1);
    assert!(vm.heap_stats().live < before);
}

#[test]
fn test_globals_survive_collection() {
    let mut vm = new_vm();
    let list = vm.new_list(vec![Value::Integer(1)]).unwrap();
    let holder = vm.new_list(vec![list.clone()]).unwrap();
    vm.set_global("holder", holder);
    drop(list);
    vm.collect_garbage();
    let holder = vm.get_global("holder").unwrap();
    let Value::List(cell) = &holder else {
        panic!("holder is a list");
    };
    assert!(matches!(&*cell.read(), core_types::Object::List(items) if items.len() == 1));
}

// ============================================================================
// Sandbox and limits
// ============================================================================

fn spin_module() -> ModuleBuilder {
    let mut m = ModuleBuilder::new("spin");
    let stopped = m.text("stopped");
    let mut f = FunctionBuilder::new("spin");
    let top = f.new_label();
    f.bind(top);
    f.emit(&Opcode::Nop);
    f.jump(top);
    let spin = m.add_function(f).unwrap();

    let mut f = FunctionBuilder::new("guarded_spin");
    let catch = f.new_label();
    f.try_begin(Some(catch), None, None);
    f.emit(&Opcode::CallFunction {
        function: spin,
        argc: 0,
    });
    f.emit(&Opcode::Return);
    f.bind(catch);
    f.emit(&Opcode::Pop);
    f.emit(&Opcode::LoadConst(stopped));
    f.emit(&Opcode::Return);
    m.add_function(f).unwrap();
    m
}

fn limited_vm(limits: ResourceLimits) -> Vm {
    let mut policy = SecurityPolicy::deny_all();
    policy.limits = limits;
    let mut vm = Vm::new(VmConfig {
        checkpoint_interval: 100,
        policy,
        ..VmConfig::default()
    })
    .unwrap();
    load(&mut vm, spin_module());
    vm
}

#[test]
fn test_file_grant_allows_read() {
    let dir = tempfile::tempdir().unwrap();
    let granted = dir.path().join("granted");
    std::fs::create_dir(&granted).unwrap();
    let path = granted.join("greeting.txt");
    std::fs::write(&path, "hello").unwrap();
    std::fs::write(dir.path().join("secret.txt"), "classified").unwrap();
    let path = path.to_string_lossy().into_owned();
    let escape = granted
        .join("..")
        .join("secret.txt")
        .to_string_lossy()
        .into_owned();

    let mut m = ModuleBuilder::new("reader");
    m.require_native("fs");
    let read = m.add_native_function("fs.read_text", 1);
    let mut f = FunctionBuilder::new("read");
    let p = f.param("path");
    f.emit(&Opcode::LoadLocal(p));
    f.emit(&Opcode::CallFunction {
        function: read,
        argc: 1,
    });
    f.emit(&Opcode::Return);
    m.add_function(f).unwrap();

    let mut vm = new_vm();
    load(&mut vm, m);
    let err = vm.call("read", &[Value::from(path.as_str())]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::PermissionDenied);

    let policy = SecurityPolicy::deny_all().grant_path(&granted, true, false);
    vm.set_policy(policy).unwrap();
    let contents = vm.call("read", &[Value::from(path.as_str())]).unwrap();
    assert_eq!(text(&contents), "hello");

    let err = vm.call("read", &[Value::from(escape.as_str())]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::PermissionDenied);
}

#[test]
fn test_instruction_limit_aborts_call() {
    let mut vm = limited_vm(ResourceLimits {
        max_instructions: Some(10_000),
        ..ResourceLimits::default()
    });
    let err = vm.call("spin", &[]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::ExecutionLimitExceeded);
    assert_eq!(err.status(), StatusCode::ExecutionLimitExceeded);
}

#[test]
fn test_instruction_limit_is_catchable() {
    let mut vm = limited_vm(ResourceLimits {
        max_instructions: Some(10_000),
        ..ResourceLimits::default()
    });
    let result = vm.call("guarded_spin", &[]).unwrap();
    assert_eq!(text(&result), "stopped");
}

#[test]
fn test_wall_clock_limit() {
    let mut vm = limited_vm(ResourceLimits {
        max_wall_ms: Some(20),
        ..ResourceLimits::default()
    });
    let err = vm.call("spin", &[]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::TimeoutExceeded);
}

#[test]
fn test_cancellation_stops_call_once() {
    let mut vm = limited_vm(ResourceLimits::default());
    let cancel = vm.cancel_handle();
    let watchdog = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        cancel.cancel();
    });
    let err = vm.call("spin", &[]).unwrap_err();
    watchdog.join().unwrap();
    assert_eq!(err.kind, ErrorKind::Cancelled);

    vm.set_limits(ResourceLimits {
        max_instructions: Some(1_000),
        ..ResourceLimits::default()
    })
    .unwrap();
    let err = vm.call("spin", &[]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::ExecutionLimitExceeded);
}

#[test]
fn test_out_of_memory_is_recoverable() {
    let mut m = ModuleBuilder::new("hog");
    let mut f = FunctionBuilder::new("hog");
    let chain = f.local("chain");
    let top = f.new_label();
    f.bind(top);
    f.emit(&Opcode::LoadLocal(chain));
    f.emit(&Opcode::NewList(1));
    f.emit(&Opcode::StoreLocal(chain));
    f.jump(top);
    m.add_function(f).unwrap();
    let mut f = FunctionBuilder::new("small");
    f.emit(&Opcode::NewList(0));
    f.emit(&Opcode::Len);
    f.emit(&Opcode::Return);
    m.add_function(f).unwrap();

    let mut vm = Vm::new(VmConfig {
        heap_ceiling: 64 * 1024,
        ..VmConfig::default()
    })
    .unwrap();
    load(&mut vm, m);
    let err = vm.call("hog", &[]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::OutOfMemory);
    assert!(vm.heap_stats().allocated < 64 * 1024);
    assert_eq!(vm.call("small", &[]).unwrap(), Value::Integer(0));
}

#[test]
fn test_shared_vm_serializes_threads() {
    let mut m = ModuleBuilder::new("shared");
    let hits = m.text("hits");
    let one = m.integer(1);
    let mut f = FunctionBuilder::new("hit");
    bump(&mut f, hits, one);
    f.emit(&Opcode::LoadGlobal(hits));
    f.emit(&Opcode::Return);
    m.add_function(f).unwrap();

    let shared = new_vm().into_shared();
    shared.load_module(&m.build().encode()).unwrap();
    shared.lock().set_global("hits", Value::Integer(0));

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let vm = shared.clone();
            std::thread::spawn(move || {
                for _ in 0..25 {
                    vm.call("hit", &[]).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(shared.lock().get_global("hits"), Some(Value::Integer(100)));
}

#[test]
fn test_module_shared_between_vms() {
    let mut m = ModuleBuilder::new("answer");
    let answer = m.integer(42);
    let mut f = FunctionBuilder::new("answer");
    f.emit(&Opcode::LoadConst(answer));
    f.emit(&Opcode::Return);
    m.add_function(f).unwrap();
    let module = Arc::new(Module::decode(&m.build().encode()).unwrap());

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let module = module.clone();
            std::thread::spawn(move || {
                let mut vm = new_vm();
                vm.load_shared(module).unwrap();
                vm.call("answer", &[]).unwrap()
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), Value::Integer(42));
    }
}

//! Resource limit and cancellation integration tests
//!
//! Limits are checked at interpreter checkpoints; each host call starts with
//! a fresh instruction budget and clock.

use std::thread;
use std::time::Duration;

use bytecode_system::{FunctionBuilder, ModuleBuilder, Opcode};
use core_types::{ErrorKind, Value};
use integration_tests::{text, vm_with};
use interpreter::{ResourceLimits, SecurityPolicy, VmConfig};

/// `count(n)` loops `n` times and returns `n`; `forever()` never returns
fn loops_module() -> ModuleBuilder {
    let mut m = ModuleBuilder::new("loops");
    let zero = m.integer(0);
    let one = m.integer(1);
    let caught = m.text("caught");

    let mut f = FunctionBuilder::new("count");
    let n = f.param("n");
    let i = f.local("i");
    let top = f.new_label();
    let done = f.new_label();
    f.emit(&Opcode::LoadConst(zero));
    f.emit(&Opcode::StoreLocal(i));
    f.bind(top);
    f.emit(&Opcode::LoadLocal(i));
    f.emit(&Opcode::LoadLocal(n));
    f.emit(&Opcode::Lt);
    f.jump_if_false(done);
    f.emit(&Opcode::LoadLocal(i));
    f.emit(&Opcode::LoadConst(one));
    f.emit(&Opcode::Add);
    f.emit(&Opcode::StoreLocal(i));
    f.jump(top);
    f.bind(done);
    f.emit(&Opcode::LoadLocal(i));
    f.emit(&Opcode::Return);
    m.add_function(f).unwrap();

    let mut f = FunctionBuilder::new("forever");
    let top = f.new_label();
    f.bind(top);
    f.emit(&Opcode::Nop);
    f.jump(top);
    let forever = m.add_function(f).unwrap();

    let mut f = FunctionBuilder::new("forever_guarded");
    let catch = f.new_label();
    f.try_begin(Some(catch), None, None);
    f.emit(&Opcode::CallFunction {
        function: forever,
        argc: 0,
    });
    f.emit(&Opcode::Return);
    f.bind(catch);
    f.emit(&Opcode::Pop);
    f.emit(&Opcode::LoadConst(caught));
    f.emit(&Opcode::Return);
    m.add_function(f).unwrap();
    m
}

fn config(limits: ResourceLimits) -> VmConfig {
    let mut policy = SecurityPolicy::deny_all();
    policy.limits = limits;
    VmConfig {
        checkpoint_interval: 64,
        policy,
        ..VmConfig::default()
    }
}

#[test]
fn test_budget_resets_between_calls() {
    let mut vm = vm_with(
        config(ResourceLimits {
            max_instructions: Some(5_000),
            ..ResourceLimits::default()
        }),
        loops_module(),
    );
    // ~9 instructions per iteration keeps 400 iterations under budget
    for _ in 0..5 {
        assert_eq!(
            vm.call("count", &[Value::Integer(400)]).unwrap(),
            Value::Integer(400)
        );
    }
    let err = vm.call("count", &[Value::Integer(100_000)]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::ExecutionLimitExceeded);
    assert!(!err.stack_trace.is_empty());
}

#[test]
fn test_limits_replaced_at_run_time() {
    let mut vm = vm_with(config(ResourceLimits::default()), loops_module());
    assert_eq!(
        vm.call("count", &[Value::Integer(10_000)]).unwrap(),
        Value::Integer(10_000)
    );
    vm.set_limits(ResourceLimits {
        max_instructions: Some(1_000),
        ..ResourceLimits::default()
    })
    .unwrap();
    let err = vm.call("count", &[Value::Integer(10_000)]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::ExecutionLimitExceeded);
    assert_eq!(vm.policy().limits.max_instructions, Some(1_000));
}

#[test]
fn test_timeout_is_catchable() {
    let mut vm = vm_with(
        config(ResourceLimits {
            max_wall_ms: Some(10),
            ..ResourceLimits::default()
        }),
        loops_module(),
    );
    let result = vm.call("forever_guarded", &[]).unwrap();
    assert_eq!(text(&result), "caught");
    let err = vm.call("forever", &[]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::TimeoutExceeded);
}

#[test]
fn test_cancel_shared_vm_from_another_thread() {
    let shared = vm_with(config(ResourceLimits::default()), loops_module()).into_shared();
    let canceller = shared.clone();
    let watchdog = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        canceller.cancel();
    });
    let err = shared.call("forever", &[]).unwrap_err();
    watchdog.join().unwrap();
    assert_eq!(err.kind, ErrorKind::Cancelled);

    assert_eq!(
        shared.call("count", &[Value::Integer(3)]).unwrap(),
        Value::Integer(3)
    );
}

#[test]
fn test_memory_limit_from_policy() {
    let mut m = ModuleBuilder::new("grow");
    let mut f = FunctionBuilder::new("grow");
    let acc = f.local("acc");
    let top = f.new_label();
    f.bind(top);
    f.emit(&Opcode::LoadLocal(acc));
    f.emit(&Opcode::NewList(1));
    f.emit(&Opcode::StoreLocal(acc));
    f.jump(top);
    m.add_function(f).unwrap();

    let mut vm = vm_with(
        config(ResourceLimits {
            max_memory_bytes: Some(32 * 1024),
            ..ResourceLimits::default()
        }),
        m,
    );
    assert_eq!(vm.heap_stats().ceiling, 32 * 1024);
    let err = vm.call("grow", &[]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::OutOfMemory);
    assert!(err.exception.is_some());
}

//! Memory manager and interpreter integration tests
//!
//! Verifies reference counting, cycle collection and buffer pooling both
//! directly against the heap and through running bytecode.

use std::sync::Arc;

use bytecode_system::{Capture, FunctionBuilder, ModuleBuilder, Opcode};
use core_types::{Object, Value};
use integration_tests::{load, vm_with};
use interpreter::{Vm, VmConfig};
use memory_manager::{Heap, HeapConfig, RootSet, ValuePool};

fn link(from: &Value, to: &Value) {
    if let Value::List(cell) = from {
        if let Object::List(items) = &mut *cell.write() {
            items.push(to.clone());
        }
    }
}

/// Test: a cycle reachable from a root survives; once unrooted it is freed
#[test]
fn test_heap_collects_only_unrooted_cycles() {
    let mut heap = Heap::new(HeapConfig::default());
    let a = Value::List(heap.alloc_list(Vec::new()).unwrap());
    let b = Value::List(heap.alloc_list(Vec::new()).unwrap());
    link(&a, &b);
    link(&b, &a);

    let mut roots = RootSet::new();
    roots.add_global_root(a.clone());
    drop(a);
    drop(b);
    assert_eq!(heap.collect(&roots).reclaimed, 0);
    assert_eq!(heap.stats().live, 2);

    roots.clear();
    assert_eq!(heap.collect(&roots).reclaimed, 2);
    assert_eq!(heap.stats().live, 0);
    assert_eq!(heap.stats().allocated, 0);
}

/// Test: acyclic values are freed by counting alone
#[test]
fn test_heap_frees_acyclic_values_immediately() {
    let mut heap = Heap::new(HeapConfig::default());
    let inner = Value::List(heap.alloc_list(vec![Value::Integer(1)]).unwrap());
    let outer = Value::List(heap.alloc_list(vec![inner.clone()]).unwrap());
    assert_eq!(Heap::refcount(&inner), Some(2));
    drop(inner);
    assert_eq!(heap.stats().live, 2);
    Heap::release(outer);
    assert_eq!(heap.stats().live, 0);
    assert_eq!(heap.stats().frees, 2);
}

fn closure_cycle_module() -> ModuleBuilder {
    let mut m = ModuleBuilder::new("cycles");
    let field = m.text("callback");

    let mut body = FunctionBuilder::new("callback");
    body.upvalues(1);
    body.emit(&Opcode::LoadUpvalue(0));
    body.emit(&Opcode::Return);
    let body = m.add_function(body).unwrap();

    // holder.callback = || holder
    let mut f = FunctionBuilder::new("make_cycle");
    let holder = f.local("holder");
    f.emit(&Opcode::NewMap(0));
    f.emit(&Opcode::StoreLocal(holder));
    f.emit(&Opcode::LoadLocal(holder));
    f.emit(&Opcode::MakeClosure {
        function: body,
        captures: vec![Capture::Local(holder)],
    });
    f.emit(&Opcode::SetField(field));
    f.emit(&Opcode::PushNull);
    f.emit(&Opcode::Return);
    m.add_function(f).unwrap();
    m
}

/// Test: a map holding a closure that captures the map is reclaimed
#[test]
fn test_closure_cycle_reclaimed() {
    let mut vm = vm_with(VmConfig::default(), closure_cycle_module());
    let baseline = vm.heap_stats().live;
    for _ in 0..5 {
        vm.call("make_cycle", &[]).unwrap();
    }
    assert!(vm.heap_stats().live > baseline);
    assert!(vm.collect_garbage() >= 5);
    assert_eq!(vm.heap_stats().live, baseline);
}

/// Test: with cycle collection off, cycles stay until the VM is dropped
#[test]
fn test_cycle_collection_can_be_disabled() {
    let mut vm = vm_with(
        VmConfig {
            cycle_collection: false,
            ..VmConfig::default()
        },
        closure_cycle_module(),
    );
    vm.call("make_cycle", &[]).unwrap();
    let live = vm.heap_stats().live;
    assert_eq!(vm.collect_garbage(), 0);
    assert_eq!(vm.heap_stats().live, live);
}

/// Test: values held by the host survive collection
#[test]
fn test_host_handles_are_roots() {
    let mut m = ModuleBuilder::new("keep");
    let mut f = FunctionBuilder::new("make_list");
    let holder = f.local("holder");
    f.emit(&Opcode::NewList(0));
    f.emit(&Opcode::StoreLocal(holder));
    f.emit(&Opcode::LoadLocal(holder));
    f.emit(&Opcode::Return);
    m.add_function(f).unwrap();

    let mut vm = vm_with(VmConfig::default(), m);
    let list = vm.call("make_list", &[]).unwrap();
    link(&list, &list);
    vm.collect_garbage();
    let Value::List(cell) = &list else {
        panic!("expected a list");
    };
    assert!(matches!(&*cell.read(), Object::List(items) if items.len() == 1));

    drop(list);
    assert!(vm.collect_garbage() >= 1);
}

/// Test: list buffers are recycled through a shared pool
#[test]
fn test_pool_recycles_list_buffers() {
    let mut m = ModuleBuilder::new("pairs");
    let one = m.integer(1);
    let two = m.integer(2);
    let mut f = FunctionBuilder::new("pair");
    f.emit(&Opcode::LoadConst(one));
    f.emit(&Opcode::LoadConst(two));
    f.emit(&Opcode::NewList(2));
    f.emit(&Opcode::Return);
    m.add_function(f).unwrap();

    let pool = Arc::new(ValuePool::new(8));
    let mut vm = Vm::with_pool(VmConfig::default(), pool.clone()).unwrap();
    load(&mut vm, m);
    for _ in 0..10 {
        let pair = vm.call("pair", &[]).unwrap();
        drop(pair);
    }
    assert!(pool.hits() >= 9, "hits: {}", pool.hits());
    assert!(pool.len() <= 8);
}

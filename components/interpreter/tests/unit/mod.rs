//! Unit tests for interpreter components

use bytecode_system::{FunctionBuilder, ModuleBuilder, Opcode, TypeKind, NO_TARGET};
use core_types::{ErrorKind, Fault, TypeId, Value};
use interpreter::handler::{abandon_finally, PendingFinally};
use interpreter::native::NativeRegistry;
use interpreter::sandbox::Sandbox;
use interpreter::{
    CancelHandle, Completion, ConfigError, ExecutionMeter, HandlerEntry, HandlerPhase,
    NativeEntry, NativeError, Privilege, ProfileData, ResourceLimits, SecurityPolicy, Vm,
    VmConfig,
};

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn test_config_defaults() {
    let config = VmConfig::default();
    assert_eq!(config.heap_ceiling, 256 * 1024 * 1024);
    assert_eq!(config.gc_threshold_percent, 75);
    assert!(config.cycle_collection);
    assert_eq!(config.checkpoint_interval, 1024);
    assert_eq!(config.policy, SecurityPolicy::deny_all());
    assert!(config.validate().is_ok());
}

#[test]
fn test_config_rejects_out_of_range_values() {
    let bad = [
        VmConfig {
            gc_threshold_percent: 0,
            ..VmConfig::default()
        },
        VmConfig {
            gc_threshold_percent: 101,
            ..VmConfig::default()
        },
        VmConfig {
            max_call_depth: 0,
            ..VmConfig::default()
        },
    ];
    for config in bad {
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        assert!(Vm::new(config).is_err());
    }
}

#[test]
fn test_config_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vm.json");
    let config = VmConfig {
        checkpoint_interval: 64,
        policy: SecurityPolicy::deny_all()
            .grant_path("/srv/data", true, false)
            .allow_host("*.internal", Some(8443)),
        ..VmConfig::default()
    };
    std::fs::write(&path, config.to_json().unwrap()).unwrap();
    assert_eq!(VmConfig::from_file(&path).unwrap(), config);
}

#[test]
fn test_config_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = VmConfig::from_file(dir.path().join("absent.json")).unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)));
}

#[test]
fn test_memory_limit_caps_heap_ceiling() {
    let mut config = VmConfig::default();
    config.policy.limits.max_memory_bytes = Some(1024 * 1024);
    assert_eq!(config.heap_config().ceiling, 1024 * 1024);
}

// ============================================================================
// Sandbox
// ============================================================================

#[test]
fn test_sandbox_write_needs_write_grant() {
    let sandbox = Sandbox::new(
        SecurityPolicy::deny_all()
            .grant_path("/srv/in", true, false)
            .grant_path("/srv/out", false, true),
    )
    .unwrap();
    assert!(sandbox.check_file("/srv/in/a.txt", false).is_ok());
    assert!(sandbox.check_file("/srv/in/a.txt", true).is_err());
    assert!(sandbox.check_file("/srv/out/b.txt", true).is_ok());
    assert!(sandbox.check_file("/srv/out/b.txt", false).is_err());
}

#[test]
fn test_sandbox_denial_names_the_target() {
    let sandbox = Sandbox::default();
    let Err(Fault::PermissionDenied(message)) = sandbox.check_file("/etc/shadow", false) else {
        panic!("read must be denied");
    };
    assert!(message.contains("/etc/shadow"));
    let Err(Fault::PermissionDenied(message)) = sandbox.check_network("db.local", Some(5432))
    else {
        panic!("connection must be denied");
    };
    assert!(message.contains("db.local:5432"));
}

#[test]
fn test_sandbox_process_and_ffi_flags() {
    let mut policy = SecurityPolicy::deny_all();
    policy.allow_process = true;
    let sandbox = Sandbox::new(policy).unwrap();
    assert!(sandbox.authorize(Privilege::Process, &[]).is_ok());
    assert!(matches!(
        sandbox.authorize(Privilege::Ffi, &[]),
        Err(Fault::PermissionDenied(_))
    ));
}

#[test]
fn test_sandbox_network_port_argument() {
    let sandbox = Sandbox::new(SecurityPolicy::deny_all().allow_host("api.test", Some(443))).unwrap();
    let host = Value::from("api.test");
    assert!(sandbox
        .authorize(Privilege::Network, &[host.clone(), Value::Integer(443)])
        .is_ok());
    assert!(sandbox
        .authorize(Privilege::Network, &[host, Value::Integer(80)])
        .is_err());
}

// ============================================================================
// Execution meter
// ============================================================================

#[test]
fn test_meter_checkpoints_every_interval() {
    let mut meter = ExecutionMeter::new(3, ResourceLimits::default());
    let due: Vec<bool> = (0..7).map(|_| meter.tick()).collect();
    assert_eq!(due, [false, false, true, false, false, true, false]);
    assert_eq!(meter.executed(), 7);
    meter.reset();
    assert_eq!(meter.executed(), 0);
}

#[test]
fn test_meter_zero_interval_checks_every_instruction() {
    let mut meter = ExecutionMeter::new(0, ResourceLimits::default());
    assert!(meter.tick());
    assert!(meter.tick());
}

#[test]
fn test_meter_wall_clock() {
    let mut meter = ExecutionMeter::new(
        1,
        ResourceLimits {
            max_wall_ms: Some(1),
            ..ResourceLimits::default()
        },
    );
    std::thread::sleep(std::time::Duration::from_millis(5));
    assert_eq!(
        meter.check(&CancelHandle::new()),
        Err(Fault::TimeoutExceeded { limit_ms: 1 })
    );
}

#[test]
fn test_cancel_handle_is_shared() {
    let handle = CancelHandle::new();
    let clone = handle.clone();
    clone.cancel();
    assert!(handle.is_cancelled());
    let mut meter = ExecutionMeter::new(1, ResourceLimits::default());
    assert_eq!(meter.check(&handle), Err(Fault::Cancelled));
    assert!(!clone.is_cancelled());
}

// ============================================================================
// Profiling
// ============================================================================

#[test]
fn test_profile_counts_per_function() {
    let profile = ProfileData::new(2, 2);
    assert_eq!(profile.record_call(0), None);
    assert_eq!(profile.record_call(0), Some(2));
    assert_eq!(profile.record_call(0), None);
    assert_eq!(profile.record_call(1), None);
    assert_eq!(profile.call_count(0), 3);
    assert!(profile.is_hot(0));
    assert!(!profile.is_hot(1));
}

// ============================================================================
// Handlers
// ============================================================================

#[test]
fn test_handler_entry_operands() {
    let entry = HandlerEntry::new(NO_TARGET, 40, 3, 1);
    assert_eq!(entry.catch, None);
    assert_eq!(entry.finally, Some(40));
    assert_eq!(entry.filter, Some(3));
    assert_eq!(entry.phase, HandlerPhase::Try);
    assert!(!entry.can_catch());
}

#[test]
fn test_abandon_finally_drops_inner_regions() {
    let mut pending = vec![
        PendingFinally {
            completion: Completion::Jump(10),
            handlers_len: 0,
        },
        PendingFinally {
            completion: Completion::Return(Value::Integer(1)),
            handlers_len: 2,
        },
    ];
    abandon_finally(&mut pending, 1);
    assert_eq!(pending.len(), 1);
    assert!(matches!(pending[0].completion, Completion::Jump(10)));
}

// ============================================================================
// Natives
// ============================================================================

#[test]
fn test_registry_libraries_and_shadowing() {
    let mut registry = NativeRegistry::default();
    assert!(registry.is_empty());
    let first = registry.register(NativeEntry::new("math.abs", None, |_ctx, _args| {
        Ok(Value::Integer(1))
    }));
    let second = registry.register(NativeEntry::new("math.abs", None, |_ctx, _args| {
        Ok(Value::Integer(2))
    }));
    assert_ne!(first, second);
    assert_eq!(registry.lookup("math.abs"), Some(second));
    assert!(registry.has_library("math"));
    assert!(!registry.has_library("mat"));
    assert_eq!(registry.len(), 2);
}

#[test]
fn test_native_error_conversions() {
    let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
    assert!(matches!(NativeError::from(io), NativeError::Failed(m) if m == "gone"));
    let fault = NativeError::from(Fault::Cancelled);
    assert_eq!(fault.to_string(), Fault::Cancelled.to_string());
}

#[test]
fn test_builtin_core_natives_through_vm() {
    let mut vm = Vm::new(VmConfig::default()).unwrap();
    let len = vm.native("core.len").unwrap();
    assert_eq!(
        vm.call_value(&len, &[Value::from("héllo")]).unwrap(),
        Value::Integer(5)
    );
    let type_name = vm.native("core.type_name").unwrap();
    let name = vm.call_value(&type_name, &[Value::Decimal(1.5)]).unwrap();
    assert_eq!(name, Value::from("Decimal"));
    let to_text = vm.native("core.to_text").unwrap();
    let rendered = vm.call_value(&to_text, &[Value::Integer(42)]).unwrap();
    assert_eq!(rendered, Value::from("42"));
}

// ============================================================================
// Loading
// ============================================================================

#[test]
fn test_truncated_module_is_malformed() {
    let mut m = ModuleBuilder::new("t");
    let mut f = FunctionBuilder::new("f");
    f.emit(&Opcode::PushNull);
    f.emit(&Opcode::Return);
    m.add_function(f).unwrap();
    let bytes = m.build().encode();

    let mut vm = Vm::new(VmConfig::default()).unwrap();
    let err = vm.load_module(&bytes[..bytes.len() / 2]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::MalformedModule);
    let err = vm.load_module(b"nope").unwrap_err();
    assert_eq!(err.kind, ErrorKind::MalformedModule);
    assert!(vm.module_id("t").is_none());
}

#[test]
fn test_unknown_host_type_fails_load() {
    let mut m = ModuleBuilder::new("needs_host");
    m.add_type("Socket", TypeKind::External("Socket".into()));
    let mut f = FunctionBuilder::new("f");
    f.emit(&Opcode::PushNull);
    f.emit(&Opcode::Return);
    m.add_function(f).unwrap();
    let bytes = m.build().encode();

    let mut vm = Vm::new(VmConfig::default()).unwrap();
    let err = vm.load_module(&bytes).unwrap_err();
    assert_eq!(err.kind, ErrorKind::TypeResolutionError);
    assert!(vm.module_id("needs_host").is_none());

    let socket = vm.register_type("Socket", None).unwrap();
    assert!(socket >= TypeId::FIRST_USER);
    let id = vm.load_module(&bytes).unwrap();
    assert_eq!(vm.module_id("needs_host"), Some(id));
}

#[test]
fn test_missing_native_library_fails_load() {
    let mut m = ModuleBuilder::new("gpu_user");
    m.require_native("gpu");
    let mut f = FunctionBuilder::new("f");
    f.emit(&Opcode::PushNull);
    f.emit(&Opcode::Return);
    m.add_function(f).unwrap();

    let mut vm = Vm::new(VmConfig::default()).unwrap();
    let err = vm.load_module(&m.build().encode()).unwrap_err();
    assert_eq!(err.kind, ErrorKind::TypeResolutionError);
    assert!(err.message.contains("gpu"));
}

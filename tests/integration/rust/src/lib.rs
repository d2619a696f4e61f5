//! Integration test suite for the Runa VM
//!
//! This crate verifies that the loader, interpreter, memory manager and
//! sandbox work together across component boundaries.

use bytecode_system::ModuleBuilder;
use core_types::{ModuleId, Value};
use interpreter::{Vm, VmConfig};

/// Re-export components for test convenience
pub mod components {
    pub use bytecode_system;
    pub use core_types;
    pub use interpreter;
    pub use memory_manager;
}

/// Encode `module` and load it into `vm`
pub fn load(vm: &mut Vm, module: ModuleBuilder) -> ModuleId {
    vm.load_module(&module.build().encode())
        .unwrap_or_else(|err| panic!("module failed to load: {}", err))
}

/// A VM with `config` and `module` loaded
pub fn vm_with(config: VmConfig, module: ModuleBuilder) -> Vm {
    let mut vm = Vm::new(config).unwrap_or_else(|err| panic!("bad configuration: {}", err));
    load(&mut vm, module);
    vm
}

/// Contents of a text value, or an empty string
pub fn text(value: &Value) -> &str {
    value.as_text().map(|t| t.as_str()).unwrap_or("")
}

//! Unit tests for TypeRegistry

use core_types::{
    values_equal, CompareHook, CustomObject, CustomTypeInfo, FieldLayout, Gc, MapObject, Object,
    TypeId, TypeRegistry, TypeShape, Value,
};
use std::any::Any;
use std::sync::Arc;

fn custom(types: &TypeRegistry, ty: TypeId, payload: i32) -> Value {
    let destructor = types.custom_info(ty).and_then(|info| info.destructor.clone());
    Value::Custom(Gc::new(Object::Custom(CustomObject::new(
        ty,
        Box::new(payload),
        destructor,
    ))))
}

#[cfg(test)]
mod registry_tests {
    use super::*;

    #[test]
    fn test_struct_instances_match_struct_and_map() {
        let mut types = TypeRegistry::new();
        let point = types.define(
            "geo.Point",
            TypeShape::Struct {
                fields: vec![FieldLayout {
                    name: "x".to_string(),
                    type_id: TypeId::INTEGER,
                    offset: 0,
                    indirect: false,
                }],
                size: 8,
            },
            Some(TypeId::MAP),
        );
        let value = Value::Map(Gc::new(Object::Map(MapObject::tagged(point))));

        assert!(types.is_instance(&value, point));
        assert!(types.is_instance(&value, TypeId::MAP));
        assert!(!types.is_instance(&value, TypeId::LIST));
        assert_eq!(types.lookup("geo.Point"), Some(point));
    }

    #[test]
    fn test_custom_values_compare_by_identity_without_hook() {
        let mut types = TypeRegistry::new();
        let handle = types.register_custom("Handle", None).unwrap();
        let a = custom(&types, handle, 1);
        let b = custom(&types, handle, 1);

        assert!(values_equal(&a, &a.clone(), &types));
        assert!(!values_equal(&a, &b, &types));
        assert!(types.is_instance(&a, handle));
        assert_eq!(types.type_of(&a), handle);
    }

    #[test]
    fn test_compare_hook_enables_structural_equality() {
        let mut types = TypeRegistry::new();
        let hook: CompareHook = Arc::new(|a: &(dyn Any + Send + Sync), b: &(dyn Any + Send + Sync)| {
            let (a, b) = (a.downcast_ref::<i32>()?, b.downcast_ref::<i32>()?);
            Some(a.cmp(b))
        });
        let money = types
            .register_custom_info(
                "Money",
                CustomTypeInfo {
                    destructor: None,
                    compare: Some(hook),
                },
            )
            .unwrap();

        assert!(values_equal(&custom(&types, money, 5), &custom(&types, money, 5), &types));
        assert!(!values_equal(&custom(&types, money, 5), &custom(&types, money, 6), &types));
    }

    #[test]
    fn test_function_shape_accepts_functions() {
        let mut types = TypeRegistry::new();
        let sig = types.define(
            "",
            TypeShape::Function {
                params: vec![TypeId::INTEGER],
                ret: TypeId::INTEGER,
            },
            None,
        );
        let f = Value::Function(core_types::FunctionRef::Native(core_types::NativeId(0)));
        assert!(types.is_instance(&f, sig));
        assert!(!types.is_instance(&Value::Integer(0), sig));
    }
}

//! Unit tests for Value, Gc cells and arithmetic

use core_types::{
    arithmetic, compare_values, negate, ArithOp, Fault, FunctionRef, Gc, MapKey, MapObject,
    ModuleId, NoHooks, Object, Text, TypeId, Value,
};
use std::cmp::Ordering;

#[cfg(test)]
mod truthiness_tests {
    use super::*;

    #[test]
    fn test_falsy_values() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Boolean(false).is_truthy());
        assert!(!Value::Integer(0).is_truthy());
        assert!(!Value::Decimal(f64::NAN).is_truthy());
        assert!(!Value::from("").is_truthy());
    }

    #[test]
    fn test_containers_are_truthy() {
        let empty = Value::List(Gc::new(Object::List(Vec::new())));
        assert!(empty.is_truthy());
        let f = Value::Function(FunctionRef::Bytecode {
            module: ModuleId(0),
            index: 0,
        });
        assert!(f.is_truthy());
    }
}

#[cfg(test)]
mod type_id_tests {
    use super::*;

    #[test]
    fn test_tagged_map_reports_tag() {
        let point = TypeId(40);
        let value = Value::Map(Gc::new(Object::Map(MapObject::tagged(point))));
        assert_eq!(value.type_id(), point);
        let plain = Value::Map(Gc::new(Object::Map(MapObject::new())));
        assert_eq!(plain.type_id(), TypeId::MAP);
    }
}

#[cfg(test)]
mod refcount_tests {
    use super::*;

    #[test]
    fn test_clone_retains_and_drop_releases() {
        let cell = Gc::new(Object::List(vec![Value::Integer(1)]));
        let value = Value::List(cell.clone());
        assert_eq!(cell.strong_count(), 2);
        let copy = value.clone();
        assert_eq!(cell.strong_count(), 3);
        drop(copy);
        drop(value);
        assert_eq!(cell.strong_count(), 1);
    }

    #[test]
    fn test_weak_handle_observes_free() {
        let cell = Gc::new(Object::List(Vec::new()));
        let weak = cell.downgrade();
        assert!(weak.upgrade().is_some());
        drop(cell);
        assert!(weak.is_dead());
    }
}

#[cfg(test)]
mod text_tests {
    use super::*;

    #[test]
    fn test_scalar_indexing() {
        let t = Text::new("añb");
        assert_eq!(t.char_len(), 3);
        assert_eq!(t.char_at(2), Some('b'));
        assert_eq!(t.char_at(3), None);
    }

    #[test]
    fn test_text_keys_hash_by_content() {
        let mut map = MapObject::new();
        map.insert(MapKey::from("k"), Value::Integer(1));
        assert_eq!(map.get(&MapKey::Text(Text::new("k"))), Some(&Value::Integer(1)));
    }
}

#[cfg(test)]
mod arithmetic_tests {
    use super::*;

    #[test]
    fn test_mixed_promotes_to_decimal() {
        let result = arithmetic(ArithOp::Mul, &Value::Integer(3), &Value::Decimal(0.5)).unwrap();
        assert!(matches!(result, Value::Decimal(d) if d == 1.5));
    }

    #[test]
    fn test_wrapping_multiplication() {
        let result = arithmetic(ArithOp::Mul, &Value::Integer(i64::MAX), &Value::Integer(2)).unwrap();
        assert_eq!(result, Value::Integer(-2));
    }

    #[test]
    fn test_division_by_zero_faults() {
        let err = arithmetic(ArithOp::Div, &Value::Integer(1), &Value::Integer(0)).unwrap_err();
        assert!(matches!(err, Fault::Runtime(_)));
    }

    #[test]
    fn test_negate_min_wraps() {
        assert_eq!(negate(&Value::Integer(i64::MIN)).unwrap(), Value::Integer(i64::MIN));
    }

    #[test]
    fn test_list_ordering_is_lexicographic() {
        let a = Value::List(Gc::new(Object::List(vec![Value::Integer(1), Value::Integer(2)])));
        let b = Value::List(Gc::new(Object::List(vec![Value::Integer(1), Value::Integer(3)])));
        assert_eq!(compare_values(&a, &b, &NoHooks).unwrap(), Some(Ordering::Less));
    }

    #[test]
    fn test_nan_is_unordered() {
        let ord = compare_values(&Value::Decimal(f64::NAN), &Value::Integer(1), &NoHooks).unwrap();
        assert_eq!(ord, None);
    }
}

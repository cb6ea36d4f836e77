//! Property-based tests for type resolution, arity and struct layout.

use nativebind::{
    FfiError, Function, FunctionOptions, StructLayout, Symbol, Type, TypeRegistry, Value,
};
use proptest::prelude::*;

/// Names that resolve to a sized, by-value field type.
const FIELD_TYPES: &[&str] = &[
    "int8", "uint8", "int16", "uint16", "int32", "uint32", "int64", "uint64", "long", "ulong",
    "float32", "float64", "longdouble", "bool", "pointer", "string", "char", "short", "double",
];

fn known_name() -> impl Strategy<Value = String> {
    let names = TypeRegistry::global()
        .typedef_names()
        .into_iter()
        .map(str::to_string)
        .collect::<Vec<_>>();
    prop::sample::select(names)
}

fn non_type_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i64>().prop_map(Value::Integer),
        any::<f64>().prop_map(Value::Float),
        any::<bool>().prop_map(Value::Bool),
        Just(Value::Nil),
        prop::collection::vec(any::<i64>().prop_map(Value::Integer), 0..3).prop_map(Value::Array),
    ]
}

fn field_type() -> impl Strategy<Value = Type> {
    prop::sample::select(FIELD_TYPES.to_vec())
        .prop_map(|name| TypeRegistry::global().resolve_name(name).unwrap())
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        ..ProptestConfig::default()
    })]

    #[test]
    fn resolve_is_idempotent(name in known_name()) {
        let registry = TypeRegistry::global();
        let once = registry.resolve(&Value::sym(name.as_str())).unwrap();
        let twice = registry.resolve(&Value::Type(once.clone())).unwrap();
        prop_assert_eq!(&once, &twice);
        prop_assert_eq!(registry.resolve(&Value::sym(name.as_str())).unwrap(), once);
    }

    #[test]
    fn unknown_names_fail_citing_symbol(name in "[a-z_][a-z0-9_]{0,12}") {
        let registry = TypeRegistry::global();
        prop_assume!(registry.find(&name).is_none());
        let err = registry.resolve(&Value::sym(name.as_str())).unwrap_err();
        prop_assert_eq!(err.to_string(), "can't convert Symbol into Type");
    }

    #[test]
    fn other_values_fail_citing_their_kind(value in non_type_value()) {
        let err = TypeRegistry::global().resolve(&value).unwrap_err();
        prop_assert_eq!(
            err.to_string(),
            format!("can't convert {} into Type", value.kind_name())
        );
    }

    #[test]
    fn arity_mismatch_always_fails(
        nparams in 0usize..6,
        args in prop::collection::vec(any::<i32>(), 0..8),
    ) {
        prop_assume!(args.len() != nparams);
        let params = vec![Value::sym("int"); nparams];
        let f = Function::new(
            &Value::sym("int"),
            &params,
            &Value::LibrarySymbol(Symbol::new("nativebind_never_called")),
            &FunctionOptions::new(),
        ).unwrap();
        let values: Vec<Value> = args.into_iter().map(Value::from).collect();
        let is_arg_count = matches!(f.call(&values), Err(FfiError::ArgCount { .. }));
        prop_assert!(is_arg_count);
    }

    #[test]
    fn layout_offsets_are_monotonic_and_aligned(types in prop::collection::vec(field_type(), 0..12)) {
        let mut builder = StructLayout::builder();
        for (i, ty) in types.into_iter().enumerate() {
            builder = builder.field(format!("f{}", i), ty);
        }
        let layout = builder.build().unwrap();
        let mut prev = 0;
        for field in layout.fields() {
            prop_assert!(field.offset() >= prev);
            prop_assert_eq!(field.offset() % field.ty().alignment(), 0);
            prev = field.offset();
        }
        prop_assert_eq!(layout.size() % layout.alignment(), 0);
        if let Some(last) = layout.fields().last() {
            prop_assert!(layout.size() >= last.offset() + last.size());
        }
    }

    #[test]
    fn packed_layouts_keep_offsets_aligned_to_packing(
        types in prop::collection::vec(field_type(), 1..8),
        shift in 0u32..4,
    ) {
        let pack = 1usize << shift;
        let mut builder = StructLayout::builder().packed(pack);
        for (i, ty) in types.into_iter().enumerate() {
            builder = builder.field(format!("f{}", i), ty);
        }
        let layout = builder.build().unwrap();
        for field in layout.fields() {
            prop_assert_eq!(field.offset() % field.ty().alignment().min(pack), 0);
        }
        prop_assert!(layout.alignment() <= pack);
    }
}

//! End-to-end calls into the C and math libraries.
//!
//! These load the real system libraries, so they only run on Linux where
//! the sonames are stable.

#![cfg(target_os = "linux")]

use std::sync::Arc;
use std::thread;

use nativebind::{
    Buffer, DynamicLibrary, FfiError, Function, FunctionOptions, Module, StructLayout,
    StructValue, Symbol, SymbolState, Type, TypeRegistry, Value,
};

const LIBC: &str = "libc.so.6";
const LIBM: &str = "libm.so.6";

fn open(name: &str, flags: i32) -> DynamicLibrary {
    DynamicLibrary::open(&Value::from(name), &Value::Integer(flags as i64)).unwrap()
}

fn ty(name: &str) -> Type {
    TypeRegistry::global().resolve_name(name).unwrap()
}

fn bind(lib: &DynamicLibrary, name: &str, ret: &str, args: &[&str]) -> Function {
    let args: Vec<Value> = args.iter().map(|a| Value::sym(*a)).collect();
    Function::new(
        &Value::sym(ret),
        &args,
        &Value::LibrarySymbol(lib.find_symbol(name).unwrap()),
        &FunctionOptions::new(),
    )
    .unwrap()
}

#[test]
fn test_attach_libm_pow() {
    let mut lib = Module::new("LibraryMock");
    lib.add_library(open(LIBM, DynamicLibrary::LOCAL));

    let pow = Function::new(
        &Value::sym("float64"),
        &[Value::sym("float64"), Value::sym("float64")],
        &Value::LibrarySymbol(Symbol::new("pow")),
        &FunctionOptions::new(),
    )
    .unwrap();
    pow.attach(&mut lib, "power");

    let results: Vec<Value> = (0..=5)
        .map(|x| lib.call("power", &[Value::Integer(x), Value::Integer(2)]).unwrap())
        .collect();
    let expected: Vec<Value> = [0.0, 1.0, 4.0, 9.0, 16.0, 25.0]
        .into_iter()
        .map(Value::Float)
        .collect();
    assert_eq!(results, expected);
}

#[test]
fn test_attach_libc_abs() {
    let mut lib = Module::new("LibraryMock");
    lib.add_library(open(LIBC, DynamicLibrary::LOCAL));

    Function::new(
        &Value::sym("int32"),
        &[Value::sym("int32")],
        &Value::LibrarySymbol(Symbol::new("abs")),
        &FunctionOptions::new(),
    )
    .unwrap()
    .attach(&mut lib, "abs");

    let results: Vec<Value> = (-3..=3)
        .map(|x| lib.call("abs", &[Value::Integer(x)]).unwrap())
        .collect();
    let expected: Vec<Value> = [3, 2, 1, 0, 1, 2, 3].into_iter().map(Value::Integer).collect();
    assert_eq!(results, expected);
}

#[test]
fn test_attach_scans_libraries_in_order() {
    let mut lib = Module::new("Both");
    lib.add_library(open(LIBM, DynamicLibrary::LAZY));
    lib.add_library(open(LIBC, DynamicLibrary::LAZY));
    lib.attach_function(
        "len",
        "strlen",
        &Value::sym("ulong"),
        &[Value::sym("string")],
        &FunctionOptions::new(),
    )
    .unwrap();
    assert_eq!(lib.call("len", &[Value::from("four")]).unwrap(), Value::Integer(4));
}

#[test]
fn test_open_local_and_global() {
    for flags in [DynamicLibrary::LOCAL, DynamicLibrary::GLOBAL] {
        let lib = open(LIBC, flags);
        assert_eq!(lib.name(), LIBC);
    }
    let err = DynamicLibrary::open(&Value::Float(3.142), &Value::Integer(1)).unwrap_err();
    assert_eq!(err.to_string(), "can't convert Float into String");
}

#[test]
fn test_now_resolves_eagerly() {
    let lib = open(LIBM, DynamicLibrary::NOW);
    let cos = lib.find_symbol("cos").unwrap();
    assert!(matches!(cos.state(), SymbolState::Resolved(_)));
    let err = lib.find_symbol("nativebind_missing").unwrap_err();
    assert!(matches!(err, FfiError::UnresolvedSymbol { .. }));
}

#[test]
fn test_lazy_failure_deferred_to_call() {
    let lib = open(LIBM, DynamicLibrary::LAZY);
    let missing = bind(&lib, "nativebind_missing", "int", &[]);
    assert_eq!(missing.symbol().state(), SymbolState::Unresolved);
    let err = missing.call(&[]).unwrap_err();
    assert!(matches!(err, FfiError::UnresolvedSymbol { .. }));
    assert!(matches!(missing.symbol().state(), SymbolState::Failed(_)));
}

#[test]
fn test_float32_return() {
    let lib = open(LIBM, DynamicLibrary::LAZY);
    let sqrtf = bind(&lib, "sqrtf", "float", &["float"]);
    assert_eq!(sqrtf.call(&[Value::Float(16.0)]).unwrap(), Value::Float(4.0));
}

#[test]
fn test_unsigned_64_bit_result() {
    let lib = open(LIBC, DynamicLibrary::LAZY);
    let strtoull = bind(&lib, "strtoull", "ulong_long", &["string", "pointer", "int"]);
    let result = strtoull
        .call(&[
            Value::from("18446744073709551615"),
            Value::Nil,
            Value::Integer(10),
        ])
        .unwrap();
    assert_eq!(result, Value::Unsigned(u64::MAX));
}

#[test]
fn test_snprintf_varargs() {
    let lib = open(LIBC, DynamicLibrary::LAZY);
    let snprintf = bind(&lib, "snprintf", "int", &["buffer_out", "ulong", "string", "varargs"]);
    let buf = Buffer::new(64);

    let written = snprintf
        .call(&[
            Value::Buffer(buf.clone()),
            Value::Integer(64),
            Value::from("%ld-%s-%.1f"),
            Value::Integer(42),
            Value::from("ok"),
            Value::Float(2.5),
        ])
        .unwrap();
    assert_eq!(written, Value::Integer(9));
    assert_eq!(buf.to_string_lossy(), "42-ok-2.5");

    snprintf
        .call(&[
            Value::Buffer(buf.clone()),
            Value::Integer(64),
            Value::from("%ld-%s-%.1f"),
            Value::Integer(7),
            Value::from("again"),
            Value::Float(0.5),
        ])
        .unwrap();
    assert_eq!(buf.to_string_lossy(), "7-again-0.5");
    assert_eq!(snprintf.cached_descriptors(), 1);

    snprintf
        .call(&[Value::Buffer(buf.clone()), Value::Integer(64), Value::from("plain")])
        .unwrap();
    assert_eq!(buf.to_string_lossy(), "plain");
    assert_eq!(snprintf.cached_descriptors(), 2);
}

#[test]
fn test_bool_vararg_promotes_to_int() {
    let lib = open(LIBC, DynamicLibrary::LAZY);
    let snprintf = bind(&lib, "snprintf", "int", &["buffer_out", "ulong", "string", "varargs"]);
    let buf = Buffer::new(16);
    let written = snprintf
        .call(&[
            Value::Buffer(buf.clone()),
            Value::Integer(16),
            Value::from("%d|%d"),
            Value::Bool(true),
            Value::Bool(false),
        ])
        .unwrap();
    assert_eq!(written, Value::Integer(3));
    assert_eq!(buf.to_string_lossy(), "1|0");
}

#[test]
fn test_attach_sees_libraries_added_later() {
    let mut lib = Module::new("Late");
    lib.add_library(open(LIBC, DynamicLibrary::LAZY));
    lib.attach_function(
        "cube_root",
        "cbrt",
        &Value::sym("double"),
        &[Value::sym("double")],
        &FunctionOptions::new(),
    )
    .unwrap();
    lib.add_library(open(LIBM, DynamicLibrary::LAZY));
    match lib.call("cube_root", &[Value::Float(27.0)]).unwrap() {
        Value::Float(v) => assert!((v - 3.0).abs() < 1e-12),
        other => panic!("expected float, got {:?}", other),
    }
}

#[test]
fn test_unknown_library_defers_failure_to_call() {
    let mut lib = Module::new("Missing");
    lib.add_library(open("nativebind-no-such-library.so", DynamicLibrary::LAZY));
    lib.attach_function("f", "abs", &Value::sym("int"), &[Value::sym("int")], &FunctionOptions::new())
        .unwrap();
    let err = lib.call("f", &[Value::Integer(1)]).unwrap_err();
    assert!(matches!(err, FfiError::UnresolvedSymbol { .. }));
}

#[test]
fn test_buffer_copy_back() {
    let lib = open(LIBC, DynamicLibrary::LAZY);
    let memcpy = bind(&lib, "memcpy", "pointer", &["buffer_out", "buffer_in", "ulong"]);
    let dst = Buffer::new(5);
    let src = Buffer::from_bytes(b"hello".to_vec());
    memcpy
        .call(&[Value::Buffer(dst.clone()), Value::Buffer(src), Value::Integer(5)])
        .unwrap();
    assert_eq!(dst.to_vec(), b"hello".to_vec());
}

#[test]
fn test_string_into_out_buffer_is_rejected() {
    let lib = open(LIBC, DynamicLibrary::LAZY);
    let memset = bind(&lib, "memset", "pointer", &["buffer_inout", "int", "ulong"]);
    let err = memset
        .call(&[Value::from("abc"), Value::Integer(0), Value::Integer(3)])
        .unwrap_err();
    assert!(err.is_conversion());
}

#[test]
fn test_struct_by_value_return() {
    let lib = open(LIBC, DynamicLibrary::LAZY);
    let div_t = StructLayout::builder()
        .field("quot", ty("int"))
        .field("rem", ty("int"))
        .build()
        .unwrap();
    let div = Function::new(
        &Value::Type(Type::by_value(div_t)),
        &[Value::sym("int"), Value::sym("int")],
        &Value::LibrarySymbol(lib.find_symbol("div").unwrap()),
        &FunctionOptions::new(),
    )
    .unwrap();
    match div.call(&[Value::Integer(17), Value::Integer(5)]).unwrap() {
        Value::Struct(result) => {
            assert_eq!(result.get("quot").unwrap(), Value::Integer(3));
            assert_eq!(result.get("rem").unwrap(), Value::Integer(2));
        }
        other => panic!("expected struct, got {:?}", other),
    }
}

#[test]
fn test_struct_by_reference_out_parameter() {
    let lib = open(LIBM, DynamicLibrary::LAZY);
    let exponent = StructLayout::builder().field("e", ty("int")).build().unwrap();
    let frexp = Function::new(
        &Value::sym("double"),
        &[
            Value::sym("double"),
            Value::Type(Type::by_reference(Arc::clone(&exponent))),
        ],
        &Value::LibrarySymbol(lib.find_symbol("frexp").unwrap()),
        &FunctionOptions::new(),
    )
    .unwrap();
    let out = StructValue::new(exponent).unwrap();
    let mantissa = frexp
        .call(&[Value::Float(8.0), Value::Struct(out.clone())])
        .unwrap();
    assert_eq!(mantissa, Value::Float(0.5));
    assert_eq!(out.get("e").unwrap(), Value::Integer(4));
}

#[test]
fn test_string_return() {
    let lib = open(LIBC, DynamicLibrary::LAZY);
    let strchr = bind(&lib, "strchr", "string", &["string", "int"]);
    assert_eq!(
        strchr.call(&[Value::from("native"), Value::Integer('t' as i64)]).unwrap(),
        Value::from("tive")
    );
    assert_eq!(
        strchr.call(&[Value::from("native"), Value::Integer('z' as i64)]).unwrap(),
        Value::Nil
    );
}

#[test]
fn test_find_variable_reads_memory() {
    let lib = open(LIBC, DynamicLibrary::LAZY);
    let environ = lib.find_variable("environ").unwrap();
    let slot = environ.to_pointer().unwrap();
    match slot.read(&Type::pointer(), 0).unwrap() {
        Value::Pointer(p) => assert!(!p.is_null()),
        other => panic!("expected pointer, got {:?}", other),
    }
}

#[test]
fn test_concurrent_first_calls_share_one_descriptor() {
    let lib = open(LIBC, DynamicLibrary::LAZY);
    let labs = bind(&lib, "labs", "long", &["long"]);
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let labs = labs.clone();
            thread::spawn(move || labs.call(&[Value::Integer(-i)]).unwrap())
        })
        .collect();
    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.join().unwrap(), Value::Integer(i as i64));
    }
    assert_eq!(labs.cached_descriptors(), 1);
}

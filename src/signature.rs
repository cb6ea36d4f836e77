//! Function signatures
//!
//! A resolved return type and parameter list, plus a small parser for the
//! C-style text form used by the command line.

use std::fmt;

use crate::error::{FfiError, FfiResult};
use crate::types::{Type, TypeRegistry};

/// Return and parameter types of a native function.
#[derive(Debug, Clone, PartialEq)]
pub struct Signature {
    pub ret: Type,
    /// Fixed parameters; the `VARARGS` marker is not stored here
    pub params: Vec<Type>,
    pub variadic: bool,
}

impl Signature {
    /// Build from resolved types, validating marker placement.
    ///
    /// `VARARGS` may only be the final parameter, never the return type;
    /// `VOID` is never a parameter.
    pub fn new(ret: Type, args: Vec<Type>) -> FfiResult<Self> {
        if ret.is_varargs() {
            return Err(FfiError::InvalidSignature(
                "VARARGS cannot be a return type".into(),
            ));
        }
        let mut params = args;
        let variadic = params.last().is_some_and(Type::is_varargs);
        if variadic {
            params.pop();
        }
        for (i, ty) in params.iter().enumerate() {
            if ty.is_varargs() {
                return Err(FfiError::InvalidSignature(format!(
                    "VARARGS must be the last parameter (found at {})",
                    i
                )));
            }
            if ty.is_void() {
                return Err(FfiError::InvalidSignature(format!(
                    "parameter {} has type VOID",
                    i
                )));
            }
        }
        Ok(Self {
            ret,
            params,
            variadic,
        })
    }

    /// Parameter types as declared, with the trailing marker if variadic.
    pub fn arg_types(&self) -> Vec<Type> {
        let mut out = self.params.clone();
        if self.variadic {
            out.push(Type::Varargs);
        }
        out
    }

    pub fn check_arity(&self, got: usize) -> FfiResult<()> {
        let ok = if self.variadic {
            got >= self.params.len()
        } else {
            got == self.params.len()
        };
        if ok {
            Ok(())
        } else {
            Err(FfiError::ArgCount {
                expected: self.params.len(),
                got,
                variadic: self.variadic,
            })
        }
    }

    /// Parse `"ret name(type, type, ...)"`, returning the name too.
    ///
    /// Type words resolve through `registry`; a trailing `*` makes a plain
    /// pointer except `char*`, which is a string. Parameter names after the
    /// type are allowed and ignored.
    pub fn parse(text: &str, registry: &TypeRegistry) -> FfiResult<(String, Self)> {
        let text = text.trim();
        let open = text
            .find('(')
            .ok_or_else(|| FfiError::InvalidSignature(format!("missing '(' in '{}'", text)))?;
        let close = text
            .rfind(')')
            .filter(|&close| close > open)
            .ok_or_else(|| FfiError::InvalidSignature(format!("missing ')' in '{}'", text)))?;

        let head = text[..open].trim();
        let (ret_text, name) = head
            .rsplit_once(char::is_whitespace)
            .ok_or_else(|| FfiError::InvalidSignature(format!("missing return type in '{}'", text)))?;
        let (ret_text, name) = split_pointer_suffix(ret_text.trim(), name.trim());

        let ret = parse_type(&ret_text, registry)?;
        let mut args = Vec::new();
        for param in text[open + 1..close].split(',') {
            let param = param.trim();
            if param.is_empty() || (param == "void" && args.is_empty()) {
                continue;
            }
            if param == "..." {
                args.push(Type::Varargs);
                continue;
            }
            let ty_text = param
                .split_whitespace()
                .next()
                .ok_or_else(|| FfiError::InvalidSignature(format!("empty parameter in '{}'", text)))?;
            let stars = param.chars().filter(|&c| c == '*').count();
            let ty_text = ty_text.trim_end_matches('*');
            args.push(parse_type(&format!("{}{}", ty_text, "*".repeat(stars)), registry)?);
        }
        Ok((name.to_string(), Self::new(ret, args)?))
    }
}

/// `char *strdup` splits as (`char`, `*strdup`); move the stars to the type.
fn split_pointer_suffix<'a>(ret: &str, name: &'a str) -> (String, &'a str) {
    let stars = name.len() - name.trim_start_matches('*').len();
    (
        format!("{}{}", ret, "*".repeat(stars)),
        name.trim_start_matches('*'),
    )
}

fn parse_type(text: &str, registry: &TypeRegistry) -> FfiResult<Type> {
    let base = text.trim_end_matches('*').trim();
    let stars = text.len() - text.trim_end_matches('*').len();
    match stars {
        0 => registry.resolve_name(base),
        1 if base == "char" => Ok(Type::string()),
        _ => Ok(Type::pointer()),
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (", self.ret)?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", param)?;
        }
        if self.variadic {
            if !self.params.is_empty() {
                write!(f, ", ")?;
            }
            write!(f, "...")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::PrimitiveKind;

    #[test]
    fn test_parse_simple() {
        let registry = TypeRegistry::new();
        let (name, sig) = Signature::parse("double pow(double x, double y)", &registry).unwrap();
        assert_eq!(name, "pow");
        assert_eq!(sig.ret, Type::primitive(PrimitiveKind::Float64));
        assert_eq!(sig.params.len(), 2);
        assert!(!sig.variadic);
    }

    #[test]
    fn test_parse_pointers_and_varargs() {
        let registry = TypeRegistry::new();
        let (name, sig) =
            Signature::parse("int snprintf(char *buf, ulong n, char *fmt, ...)", &registry).unwrap();
        assert_eq!(name, "snprintf");
        assert_eq!(sig.params, vec![Type::string(), registry.resolve_name("ulong").unwrap(), Type::string()]);
        assert!(sig.variadic);

        let (name, sig) = Signature::parse("char *getenv(char *)", &registry).unwrap();
        assert_eq!(name, "getenv");
        assert_eq!(sig.ret, Type::string());

        let (_, sig) = Signature::parse("int rand(void)", &registry).unwrap();
        assert!(sig.params.is_empty());
    }

    #[test]
    fn test_varargs_placement() {
        let int = Type::primitive(PrimitiveKind::Int32);
        assert!(Signature::new(int.clone(), vec![Type::Varargs, int.clone()]).is_err());
        assert!(Signature::new(Type::Varargs, vec![]).is_err());
        assert!(Signature::new(int.clone(), vec![Type::Void]).is_err());
        let sig = Signature::new(Type::Void, vec![int, Type::Varargs]).unwrap();
        assert!(sig.variadic);
        assert_eq!(sig.arg_types().len(), 2);
    }

    #[test]
    fn test_arity() {
        let int = Type::primitive(PrimitiveKind::Int32);
        let fixed = Signature::new(int.clone(), vec![int.clone()]).unwrap();
        assert!(fixed.check_arity(1).is_ok());
        assert!(matches!(
            fixed.check_arity(2),
            Err(FfiError::ArgCount { expected: 1, got: 2, variadic: false })
        ));
        let var = Signature::new(int.clone(), vec![int, Type::Varargs]).unwrap();
        assert!(var.check_arity(5).is_ok());
        assert!(var.check_arity(0).is_err());
    }

    #[test]
    fn test_display() {
        let registry = TypeRegistry::new();
        let (_, sig) = Signature::parse("int printf(char *, ...)", &registry).unwrap();
        assert_eq!(sig.to_string(), "INT32 (STRING, ...)");
    }
}

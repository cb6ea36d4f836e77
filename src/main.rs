//! Nativebind CLI
//!
//! Inspect the type table, compute struct layouts and call native functions
//! from the command line.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nativebind::{
    logging, FfiConfig, FieldSpec, Function, FunctionOptions, Module, Platform, Signature,
    StructLayout, Symbol, Type, TypeRegistry, Value,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "nb")]
#[command(version)]
#[command(about = "Call native shared libraries from runtime-described signatures", long_about = None)]
struct Cli {
    /// Config file (default: nativebind.toml found from the current directory up)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Call a native function
    Call {
        /// Library to search, in order (default: the running process)
        #[arg(short, long = "lib")]
        libs: Vec<String>,

        /// C-style signature, e.g. "double pow(double, double)"
        signature: String,

        /// Arguments, parsed according to the parameter types
        #[arg(allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Compute a struct layout from name:type[@offset] fields
    Layout {
        /// Fields in declaration order
        #[arg(required = true)]
        fields: Vec<String>,

        /// Cap field alignment at N bytes
        #[arg(long)]
        packed: Option<usize>,

        /// Lay out as a union
        #[arg(long)]
        union: bool,
    },

    /// Print the type table with sizes and alignments
    Types {
        /// Include every alias spelling
        #[arg(short, long)]
        all: bool,
    },
}

fn main() -> Result<()> {
    logging::init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => FfiConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => FfiConfig::load_from_cwd().context("loading nativebind.toml")?,
    };
    let registry = TypeRegistry::from_config(&config)?;

    match cli.command {
        Commands::Call {
            libs,
            signature,
            args,
        } => cmd_call(&config, &libs, &signature, &args),
        Commands::Layout {
            fields,
            packed,
            union,
        } => cmd_layout(&registry, &fields, packed, union),
        Commands::Types { all } => cmd_types(&registry, all),
    }
}

fn cmd_types(registry: &TypeRegistry, all: bool) -> Result<()> {
    let platform = Platform::host();
    println!(
        "{} {} ({}-endian, {}-byte addresses, long double {:?})",
        platform.arch,
        platform.os,
        if platform.little_endian { "little" } else { "big" },
        platform.address_size,
        platform.long_double_format
    );
    println!("{:<16} {:>5} {:>6}", "NAME", "SIZE", "ALIGN");
    if all {
        for name in registry.typedef_names() {
            if let Some(ty) = registry.find(name) {
                print_type(name, ty);
            }
        }
    } else {
        for (name, ty) in registry.types() {
            print_type(name, ty);
        }
    }
    Ok(())
}

fn print_type(name: &str, ty: &Type) {
    match ty.size_align() {
        Some((size, align)) => println!("{:<16} {:>5} {:>6}   {}", name, size, align, ty),
        None => println!("{:<16} {:>5} {:>6}   {}", name, "-", "-", ty),
    }
}

fn cmd_layout(
    registry: &TypeRegistry,
    fields: &[String],
    packed: Option<usize>,
    union: bool,
) -> Result<()> {
    let mut builder = StructLayout::builder();
    for field in fields {
        let spec = parse_field(registry, field)?;
        builder = match spec.offset {
            Some(offset) => builder.field_at(spec.name, spec.ty, offset),
            None => builder.field(spec.name, spec.ty),
        };
    }
    if let Some(n) = packed {
        builder = builder.packed(n);
    }
    if union {
        builder = builder.union();
    }
    let layout = builder.build()?;
    print!("{}", layout);
    Ok(())
}

fn parse_field(registry: &TypeRegistry, text: &str) -> Result<FieldSpec> {
    let (name, rest) = text
        .split_once(':')
        .with_context(|| format!("field '{}' is not name:type[@offset]", text))?;
    let (ty, offset) = match rest.split_once('@') {
        Some((ty, offset)) => (
            ty,
            Some(
                offset
                    .parse::<usize>()
                    .with_context(|| format!("bad offset in '{}'", text))?,
            ),
        ),
        None => (rest, None),
    };
    let spec = FieldSpec::new(name, registry.resolve_name(ty)?);
    Ok(match offset {
        Some(offset) => spec.at(offset),
        None => spec,
    })
}

fn cmd_call(config: &FfiConfig, libs: &[String], signature: &str, args: &[String]) -> Result<()> {
    let mut module = Module::with_config("nb", config)?;
    for lib in libs {
        module
            .ffi_lib(lib)
            .with_context(|| format!("opening {}", lib))?;
    }

    let (name, sig) = Signature::parse(signature, module.registry())?;
    let values = args
        .iter()
        .enumerate()
        .map(|(i, text)| parse_arg(text, sig.params.get(i)))
        .collect::<Result<Vec<_>>>()?;

    let options = FunctionOptions::new().convention(config.convention()?);
    let function = Function::from_signature(sig, Symbol::new(name.as_str()), options)?;
    function.attach(&mut module, &name);

    let result = module
        .call(&name, &values)
        .with_context(|| format!("calling {}", name))?;
    println!("{}", result);
    Ok(())
}

/// Parse a command-line argument for a parameter of type `ty`; trailing
/// variadic arguments are guessed from their text.
fn parse_arg(text: &str, ty: Option<&Type>) -> Result<Value> {
    match ty {
        Some(Type::Primitive(p)) if p.kind.is_float() => Ok(Value::Float(
            text.parse()
                .with_context(|| format!("'{}' is not a number", text))?,
        )),
        Some(Type::Primitive(p)) if p.kind == nativebind::PrimitiveKind::Bool => Ok(Value::Bool(
            text.parse()
                .with_context(|| format!("'{}' is not true/false", text))?,
        )),
        Some(Type::Primitive(_)) => parse_integer(text),
        Some(Type::Pointer(nativebind::PointerKind::Address)) if text == "null" => Ok(Value::Nil),
        Some(Type::Pointer(nativebind::PointerKind::Address)) => parse_integer(text),
        Some(_) => Ok(Value::from(text)),
        None => Ok(parse_integer(text)
            .or_else(|_| text.parse::<f64>().map(Value::Float))
            .unwrap_or_else(|_| Value::from(text))),
    }
}

fn parse_integer(text: &str) -> Result<Value> {
    let parsed = match text.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).map(Value::from_u64),
        None => text
            .parse::<i64>()
            .map(Value::Integer)
            .or_else(|_| text.parse::<u64>().map(Value::Unsigned)),
    };
    parsed.with_context(|| format!("'{}' is not an integer", text))
}

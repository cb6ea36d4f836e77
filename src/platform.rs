//! Native primitive sizes and alignments for the host CPU/ABI.
//!
//! Everything here is derived from the build target at compile time; the
//! table never changes while the process runs.

use std::mem::{align_of, size_of};
use std::os::raw::{c_char, c_double, c_float, c_int, c_long, c_longlong, c_short};

/// Primitive kinds the binding engine can pass by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    /// Native word (`long`)
    Long,
    /// Native unsigned word (`unsigned long`)
    ULong,
    Float32,
    Float64,
    LongDouble,
    /// C `_Bool`
    Bool,
}

impl PrimitiveKind {
    pub const ALL: [PrimitiveKind; 14] = [
        PrimitiveKind::Int8,
        PrimitiveKind::UInt8,
        PrimitiveKind::Int16,
        PrimitiveKind::UInt16,
        PrimitiveKind::Int32,
        PrimitiveKind::UInt32,
        PrimitiveKind::Int64,
        PrimitiveKind::UInt64,
        PrimitiveKind::Long,
        PrimitiveKind::ULong,
        PrimitiveKind::Float32,
        PrimitiveKind::Float64,
        PrimitiveKind::LongDouble,
        PrimitiveKind::Bool,
    ];

    /// Constant-style name, e.g. `INT32`.
    pub fn name(self) -> &'static str {
        match self {
            PrimitiveKind::Int8 => "INT8",
            PrimitiveKind::UInt8 => "UINT8",
            PrimitiveKind::Int16 => "INT16",
            PrimitiveKind::UInt16 => "UINT16",
            PrimitiveKind::Int32 => "INT32",
            PrimitiveKind::UInt32 => "UINT32",
            PrimitiveKind::Int64 => "INT64",
            PrimitiveKind::UInt64 => "UINT64",
            PrimitiveKind::Long => "LONG",
            PrimitiveKind::ULong => "ULONG",
            PrimitiveKind::Float32 => "FLOAT32",
            PrimitiveKind::Float64 => "FLOAT64",
            PrimitiveKind::LongDouble => "LONGDOUBLE",
            PrimitiveKind::Bool => "BOOL",
        }
    }

    pub fn is_integer(self) -> bool {
        !matches!(
            self,
            PrimitiveKind::Float32 | PrimitiveKind::Float64 | PrimitiveKind::LongDouble
        )
    }

    pub fn is_float(self) -> bool {
        matches!(
            self,
            PrimitiveKind::Float32 | PrimitiveKind::Float64 | PrimitiveKind::LongDouble
        )
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            PrimitiveKind::Int8
                | PrimitiveKind::Int16
                | PrimitiveKind::Int32
                | PrimitiveKind::Int64
                | PrimitiveKind::Long
        )
    }
}

/// How `long double` is stored on this target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LongDoubleFormat {
    /// x87 80-bit extended precision, padded to the type size.
    X87Extended,
    /// IEEE 754 binary128.
    Quad,
    /// Same as `double`.
    Double,
}

/// Static description of the host ABI.
#[derive(Debug, Clone, Copy)]
pub struct Platform {
    pub arch: &'static str,
    pub os: &'static str,
    pub little_endian: bool,
    pub address_size: usize,
    pub long_size: usize,
    pub long_double_size: usize,
    pub long_double_align: usize,
    pub long_double_format: LongDoubleFormat,
}

impl Platform {
    pub const INT8_SIZE: usize = size_of::<c_char>();
    pub const INT16_SIZE: usize = size_of::<c_short>();
    pub const INT32_SIZE: usize = size_of::<c_int>();
    pub const INT64_SIZE: usize = size_of::<c_longlong>();
    pub const LONG_SIZE: usize = size_of::<c_long>();
    pub const FLOAT_SIZE: usize = size_of::<c_float>();
    pub const DOUBLE_SIZE: usize = size_of::<c_double>();
    pub const ADDRESS_SIZE: usize = size_of::<*const ()>();

    /// The table for the target this crate was built for.
    pub fn host() -> &'static Platform {
        &HOST
    }

    /// Byte size of a primitive kind.
    pub fn size_of(&self, kind: PrimitiveKind) -> usize {
        match kind {
            PrimitiveKind::Int8 | PrimitiveKind::UInt8 | PrimitiveKind::Bool => 1,
            PrimitiveKind::Int16 | PrimitiveKind::UInt16 => 2,
            PrimitiveKind::Int32 | PrimitiveKind::UInt32 | PrimitiveKind::Float32 => 4,
            PrimitiveKind::Int64 | PrimitiveKind::UInt64 | PrimitiveKind::Float64 => 8,
            PrimitiveKind::Long | PrimitiveKind::ULong => self.long_size,
            PrimitiveKind::LongDouble => self.long_double_size,
        }
    }

    /// Required alignment of a primitive kind.
    pub fn align_of(&self, kind: PrimitiveKind) -> usize {
        match kind {
            PrimitiveKind::Int8 | PrimitiveKind::UInt8 | PrimitiveKind::Bool => 1,
            PrimitiveKind::Int16 | PrimitiveKind::UInt16 => align_of::<i16>(),
            PrimitiveKind::Int32 | PrimitiveKind::UInt32 => align_of::<i32>(),
            PrimitiveKind::Float32 => align_of::<f32>(),
            PrimitiveKind::Int64 | PrimitiveKind::UInt64 => align_of::<c_longlong>(),
            PrimitiveKind::Float64 => align_of::<c_double>(),
            PrimitiveKind::Long | PrimitiveKind::ULong => align_of::<c_long>(),
            PrimitiveKind::LongDouble => self.long_double_align,
        }
    }

    pub fn address_align(&self) -> usize {
        align_of::<*const ()>()
    }
}

static HOST: Platform = Platform {
    arch: std::env::consts::ARCH,
    os: std::env::consts::OS,
    little_endian: cfg!(target_endian = "little"),
    address_size: size_of::<*const ()>(),
    long_size: size_of::<c_long>(),
    long_double_size: LONG_DOUBLE.0,
    long_double_align: LONG_DOUBLE.1,
    long_double_format: LONG_DOUBLE.2,
};

#[cfg(all(target_arch = "x86_64", not(target_env = "msvc")))]
const LONG_DOUBLE: (usize, usize, LongDoubleFormat) = (16, 16, LongDoubleFormat::X87Extended);

#[cfg(all(target_arch = "x86", not(target_env = "msvc")))]
const LONG_DOUBLE: (usize, usize, LongDoubleFormat) = (12, 4, LongDoubleFormat::X87Extended);

#[cfg(any(
    all(target_arch = "aarch64", target_os = "linux"),
    target_arch = "riscv64"
))]
const LONG_DOUBLE: (usize, usize, LongDoubleFormat) = (16, 16, LongDoubleFormat::Quad);

#[cfg(not(any(
    all(target_arch = "x86_64", not(target_env = "msvc")),
    all(target_arch = "x86", not(target_env = "msvc")),
    all(target_arch = "aarch64", target_os = "linux"),
    target_arch = "riscv64"
)))]
const LONG_DOUBLE: (usize, usize, LongDoubleFormat) = (8, 8, LongDoubleFormat::Double);

/// Encode a host double into the target's `long double` bytes.
pub fn encode_long_double(value: f64, format: LongDoubleFormat, out: &mut [u8]) {
    out.fill(0);
    match format {
        LongDoubleFormat::Double => out[..8].copy_from_slice(&value.to_ne_bytes()),
        LongDoubleFormat::X87Extended => {
            let (sign, exp, mantissa) = f64_to_x87(value);
            let sign_exp = ((sign as u16) << 15) | exp;
            out[..8].copy_from_slice(&mantissa.to_le_bytes());
            out[8..10].copy_from_slice(&sign_exp.to_le_bytes());
        }
        LongDoubleFormat::Quad => {
            let bits = f64_to_quad(value);
            out[..16].copy_from_slice(&bits.to_ne_bytes());
        }
    }
}

/// Decode the target's `long double` bytes into a host double (rounding).
pub fn decode_long_double(bytes: &[u8], format: LongDoubleFormat) -> f64 {
    match format {
        LongDoubleFormat::Double => f64::from_ne_bytes(first_n(bytes)),
        LongDoubleFormat::X87Extended => {
            let mantissa = u64::from_le_bytes(first_n(bytes));
            let sign_exp = u16::from_le_bytes([bytes[8], bytes[9]]);
            x87_to_f64(sign_exp >> 15 != 0, sign_exp & 0x7fff, mantissa)
        }
        LongDoubleFormat::Quad => quad_to_f64(u128::from_ne_bytes(first_n(bytes))),
    }
}

fn first_n<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

/// `m * 2^e` in two steps so intermediate powers neither overflow nor
/// flush to zero before the product lands in the subnormal range.
fn scale2(m: f64, e: i32) -> f64 {
    let half = e / 2;
    m * 2f64.powi(half) * 2f64.powi(e - half)
}

fn f64_to_x87(value: f64) -> (bool, u16, u64) {
    let bits = value.to_bits();
    let sign = bits >> 63 != 0;
    let exp = ((bits >> 52) & 0x7ff) as i32;
    let frac = bits & ((1u64 << 52) - 1);
    match exp {
        0 if frac == 0 => (sign, 0, 0),
        0 => {
            // Subnormal double: normalise into the wider exponent range.
            let shift = frac.leading_zeros() - 11;
            let mantissa = frac << (shift + 11);
            let e = 1 - 1023 - shift as i32 + 16383;
            (sign, e as u16, mantissa)
        }
        0x7ff => {
            let mantissa = (1u64 << 63) | (frac << 11);
            (sign, 0x7fff, mantissa)
        }
        _ => {
            let mantissa = (1u64 << 63) | (frac << 11);
            (sign, (exp - 1023 + 16383) as u16, mantissa)
        }
    }
}

fn x87_to_f64(sign: bool, exp: u16, mantissa: u64) -> f64 {
    let magnitude = if exp == 0x7fff {
        if mantissa << 1 == 0 {
            f64::INFINITY
        } else {
            f64::NAN
        }
    } else if mantissa == 0 {
        0.0
    } else {
        // value = mantissa * 2^(exp - 16383 - 63)
        scale2(mantissa as f64, exp as i32 - 16383 - 63)
    };
    if sign {
        -magnitude
    } else {
        magnitude
    }
}

fn f64_to_quad(value: f64) -> u128 {
    let bits = value.to_bits();
    let sign = (bits >> 63) as u128;
    let exp = ((bits >> 52) & 0x7ff) as i32;
    let frac = (bits & ((1u64 << 52) - 1)) as u128;
    let (qexp, qfrac): (u128, u128) = match exp {
        0 if frac == 0 => (0, 0),
        0 => {
            let shift = (frac as u64).leading_zeros() - 11;
            let normalised = (frac << shift) & ((1u128 << 52) - 1);
            let e = 1 - 1023 - shift as i32 + 16383;
            (e as u128, normalised << 60)
        }
        0x7ff => (0x7fff, frac << 60),
        _ => ((exp - 1023 + 16383) as u128, frac << 60),
    };
    (sign << 127) | (qexp << 112) | qfrac
}

fn quad_to_f64(bits: u128) -> f64 {
    let sign = (bits >> 127) != 0;
    let exp = ((bits >> 112) & 0x7fff) as i32;
    let frac = bits & ((1u128 << 112) - 1);
    let magnitude = if exp == 0x7fff {
        if frac == 0 {
            f64::INFINITY
        } else {
            f64::NAN
        }
    } else if exp == 0 {
        0.0
    } else {
        let significand = ((1u128 << 112) | frac) >> 60;
        scale2(significand as f64, exp - 16383 - 52)
    };
    if sign {
        -magnitude
    } else {
        magnitude
    }
}

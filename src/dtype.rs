//! Normalized dtypes and the typed buffers that carry array data across the
//! storage-adapter boundary.
//!
//! Per the design notes on runtime dispatch, dtype is a tagged sum type
//! rather than an open string so that a `Buffer` can never silently mismatch
//! its schema's `DType`.

use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A normalized element type.
///
/// Source dtypes such as platform `int`/`float`/`complex` are normalized at
/// schema-construction time to `I64`/`F64`/`C128`; only the variants below
/// are ever persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DType {
    /// 8-bit signed integer.
    I8,
    /// 16-bit signed integer.
    I16,
    /// 32-bit signed integer.
    I32,
    /// 64-bit signed integer.
    I64,
    /// 16-bit IEEE-754 float.
    F16,
    /// 32-bit IEEE-754 float.
    F32,
    /// 64-bit IEEE-754 float.
    F64,
    /// 64-bit complex (two 32-bit floats).
    C64,
    /// 128-bit complex (two 64-bit floats).
    C128,
    /// 256-bit complex (two 128-bit floats, represented as two `f64` pairs).
    C256,
    /// UTF-8 string.
    Str,
    /// A fixed tuple of heterogeneous scalar values.
    Tuple,
    /// An RFC-3339 datetime, always normalized to UTC.
    DateTime,
}

impl DType {
    /// Parse a source dtype tag (`"int"`, `"float"`, `"complex"`, or an
    /// already-normalized tag) into its normalized form.
    ///
    /// # Errors
    /// Returns [`Error::InvalidSchema`] for unrecognised tags.
    pub fn normalize(tag: &str) -> Result<Self> {
        match tag {
            "int" | "i64" | "numpy.int64" => Ok(Self::I64),
            "i8" | "numpy.int8" => Ok(Self::I8),
            "i16" | "numpy.int16" => Ok(Self::I16),
            "i32" | "numpy.int32" => Ok(Self::I32),
            "float" | "f64" | "numpy.float64" => Ok(Self::F64),
            "f16" | "numpy.float16" => Ok(Self::F16),
            "f32" | "numpy.float32" => Ok(Self::F32),
            "complex" | "c128" | "numpy.complex128" => Ok(Self::C128),
            "c64" | "numpy.complex64" => Ok(Self::C64),
            "c256" | "numpy.complex256" => Ok(Self::C256),
            "str" | "string" => Ok(Self::Str),
            "tuple" => Ok(Self::Tuple),
            "datetime" => Ok(Self::DateTime),
            other => Err(Error::InvalidSchema(format!("unknown dtype: {other}"))),
        }
    }

    /// The canonical `"numpy.xxx"`-style tag used in persisted metadata, mirroring the source's `DTypeEnum::get_name`.
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            Self::I8 => "numpy.int8",
            Self::I16 => "numpy.int16",
            Self::I32 => "numpy.int32",
            Self::I64 => "numpy.int64",
            Self::F16 => "numpy.float16",
            Self::F32 => "numpy.float32",
            Self::F64 => "numpy.float64",
            Self::C64 => "numpy.complex64",
            Self::C128 => "numpy.complex128",
            Self::C256 => "numpy.complex256",
            Self::Str => "string",
            Self::Tuple => "tuple",
            Self::DateTime => "datetime",
        }
    }

    /// Size in bytes of a single element, used by the memory pre-flight check.
    #[must_use]
    pub fn size_of(self) -> u64 {
        match self {
            Self::I8 => 1,
            Self::I16 | Self::F16 => 2,
            Self::I32 | Self::F32 => 4,
            Self::I64 | Self::F64 | Self::C64 => 8,
            Self::C128 => 16,
            Self::C256 => 32,
            Self::Str | Self::Tuple | Self::DateTime => 8,
        }
    }

    /// Whether this dtype is one of the numeric kinds legal for an Array schema's `dtype` field.
    #[must_use]
    pub fn is_numeric(self) -> bool {
        !matches!(self, Self::Str | Self::Tuple | Self::DateTime)
    }

    /// Whether this dtype has a [`Buffer`] variant, i.e. can actually back an
    /// Array/VArray payload rather than just an attribute value.
    ///
    /// `F16`, `C64` and `C256` are legal attribute dtypes but this build
    /// carries no `half`-width or extended-precision complex buffer type, so
    /// they are rejected as an Array's payload `dtype` (see DESIGN.md).
    #[must_use]
    pub fn is_buffer_representable(self) -> bool {
        matches!(
            self,
            Self::I8 | Self::I16 | Self::I32 | Self::I64 | Self::F32 | Self::F64 | Self::C128
        )
    }

    /// Whether NaN is a legal fill value for this dtype.
    #[must_use]
    pub fn allows_nan(self) -> bool {
        matches!(
            self,
            Self::F16 | Self::F32 | Self::F64 | Self::C64 | Self::C128 | Self::C256
        )
    }
}

/// A dense, homogeneously-typed buffer of array elements.
///
/// One variant per [`DType`]; this is the typed counterpart the design notes
/// call for instead of an erased `dyn Any` crossing the storage-adapter
/// boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Buffer {
    /// `i8` elements.
    I8(Vec<i8>),
    /// `i16` elements.
    I16(Vec<i16>),
    /// `i32` elements.
    I32(Vec<i32>),
    /// `i64` elements.
    I64(Vec<i64>),
    /// `f32` elements.
    F32(Vec<f32>),
    /// `f64` elements.
    F64(Vec<f64>),
    /// `f64`-backed complex elements.
    C128(Vec<Complex64>),
}

impl Buffer {
    /// The [`DType`] of this buffer's elements.
    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::I8(_) => DType::I8,
            Self::I16(_) => DType::I16,
            Self::I32(_) => DType::I32,
            Self::I64(_) => DType::I64,
            Self::F32(_) => DType::F32,
            Self::F64(_) => DType::F64,
            Self::C128(_) => DType::C128,
        }
    }

    /// Number of elements in the buffer.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::I8(v) => v.len(),
            Self::I16(v) => v.len(),
            Self::I32(v) => v.len(),
            Self::I64(v) => v.len(),
            Self::F32(v) => v.len(),
            Self::F64(v) => v.len(),
            Self::C128(v) => v.len(),
        }
    }

    /// Whether the buffer holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reinterpret a raw native-endian byte slice as a buffer of `dtype`.
    ///
    /// # Errors
    /// Returns [`Error::Array`] if `bytes`'s length is not a multiple of
    /// `dtype`'s element size.
    pub fn from_bytes(dtype: DType, bytes: &[u8]) -> Result<Self> {
        let malformed = || Error::Array(format!("payload length is not a multiple of {dtype:?}'s element size"));
        Ok(match dtype {
            DType::I8 => Self::I8(bytemuck::try_cast_slice(bytes).map_err(|_| malformed())?.to_vec()),
            DType::I16 => Self::I16(bytemuck::try_cast_slice(bytes).map_err(|_| malformed())?.to_vec()),
            DType::I32 => Self::I32(bytemuck::try_cast_slice(bytes).map_err(|_| malformed())?.to_vec()),
            DType::I64 => Self::I64(bytemuck::try_cast_slice(bytes).map_err(|_| malformed())?.to_vec()),
            DType::F32 => Self::F32(bytemuck::try_cast_slice(bytes).map_err(|_| malformed())?.to_vec()),
            DType::F64 => Self::F64(bytemuck::try_cast_slice(bytes).map_err(|_| malformed())?.to_vec()),
            DType::C128 => Self::C128(bytemuck::try_cast_slice(bytes).map_err(|_| malformed())?.to_vec()),
            _ => {
                return Err(Error::ArrayType {
                    expected: "a buffer-representable numeric dtype".to_string(),
                    found: format!("{dtype:?}"),
                })
            }
        })
    }

    /// Reinterpret this buffer as a raw native-endian byte slice, suitable
    /// for writing verbatim to a dense payload file.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::I8(v) => bytemuck::cast_slice(v),
            Self::I16(v) => bytemuck::cast_slice(v),
            Self::I32(v) => bytemuck::cast_slice(v),
            Self::I64(v) => bytemuck::cast_slice(v),
            Self::F32(v) => bytemuck::cast_slice(v),
            Self::F64(v) => bytemuck::cast_slice(v),
            Self::C128(v) => bytemuck::cast_slice(v),
        }
    }

    /// Gather the elements at `indices` (flat, row-major) into a new buffer
    /// of the same dtype, in `indices`'s order.
    #[must_use]
    pub fn gather(&self, indices: &[usize]) -> Self {
        match self {
            Self::I8(v) => Self::I8(indices.iter().map(|&i| v[i]).collect()),
            Self::I16(v) => Self::I16(indices.iter().map(|&i| v[i]).collect()),
            Self::I32(v) => Self::I32(indices.iter().map(|&i| v[i]).collect()),
            Self::I64(v) => Self::I64(indices.iter().map(|&i| v[i]).collect()),
            Self::F32(v) => Self::F32(indices.iter().map(|&i| v[i]).collect()),
            Self::F64(v) => Self::F64(indices.iter().map(|&i| v[i]).collect()),
            Self::C128(v) => Self::C128(indices.iter().map(|&i| v[i]).collect()),
        }
    }

    /// Scatter `values` into `self` at `indices` (flat, row-major), in
    /// `indices`'s order.
    ///
    /// # Errors
    /// Returns [`Error::ArrayType`] if `values`'s dtype does not match `self`'s.
    pub fn scatter(&mut self, indices: &[usize], values: &Self) -> Result<()> {
        macro_rules! scatter_variant {
            ($full:ident, $vals:ident) => {{
                for (i, &idx) in indices.iter().enumerate() {
                    $full[idx] = $vals[i];
                }
            }};
        }
        match (self, values) {
            (Self::I8(full), Self::I8(vals)) => scatter_variant!(full, vals),
            (Self::I16(full), Self::I16(vals)) => scatter_variant!(full, vals),
            (Self::I32(full), Self::I32(vals)) => scatter_variant!(full, vals),
            (Self::I64(full), Self::I64(vals)) => scatter_variant!(full, vals),
            (Self::F32(full), Self::F32(vals)) => scatter_variant!(full, vals),
            (Self::F64(full), Self::F64(vals)) => scatter_variant!(full, vals),
            (Self::C128(full), Self::C128(vals)) => scatter_variant!(full, vals),
            (full, vals) => {
                return Err(Error::ArrayType {
                    expected: format!("{:?}", full.dtype()),
                    found: format!("{:?}", vals.dtype()),
                })
            }
        }
        Ok(())
    }

    /// Whether every element in the buffer is bitwise-equal to `fill` (NaN
    /// compares equal to itself here, unlike IEEE-754 `==`), used to decide
    /// whether a cleared payload's body can be dropped entirely.
    #[must_use]
    pub fn is_all_fill(&self, fill: &FillValue) -> bool {
        match (self, fill) {
            (Self::I8(v), FillValue::Int(f)) => v.iter().all(|x| i64::from(*x) == *f),
            (Self::I16(v), FillValue::Int(f)) => v.iter().all(|x| i64::from(*x) == *f),
            (Self::I32(v), FillValue::Int(f)) => v.iter().all(|x| i64::from(*x) == *f),
            (Self::I64(v), FillValue::Int(f)) => v.iter().all(|x| x == f),
            (Self::F32(v), FillValue::Float(f)) => v.iter().all(|x| x.to_bits() == (*f as f32).to_bits()),
            (Self::F64(v), FillValue::Float(f)) => v.iter().all(|x| x.to_bits() == f.to_bits()),
            (Self::C128(v), FillValue::Complex(f)) => {
                v.iter().all(|x| x.re.to_bits() == f.re.to_bits() && x.im.to_bits() == f.im.to_bits())
            }
            _ => false,
        }
    }

    /// Build a buffer of `len` copies of `fill_value`, for the given dtype.
    ///
    /// # Errors
    /// Returns [`Error::ArrayType`] if `fill_value`'s variant does not match `dtype`.
    pub fn filled(dtype: DType, len: usize, fill_value: &FillValue) -> Result<Self> {
        Ok(match (dtype, fill_value) {
            (DType::I8, FillValue::Int(v)) => Self::I8(vec![*v as i8; len]),
            (DType::I16, FillValue::Int(v)) => Self::I16(vec![*v as i16; len]),
            (DType::I32, FillValue::Int(v)) => Self::I32(vec![*v as i32; len]),
            (DType::I64, FillValue::Int(v)) => Self::I64(vec![*v; len]),
            (DType::F32, FillValue::Float(v)) => Self::F32(vec![*v as f32; len]),
            (DType::F64, FillValue::Float(v)) => Self::F64(vec![*v; len]),
            (DType::C128, FillValue::Complex(v)) => Self::C128(vec![*v; len]),
            _ => {
                return Err(Error::ArrayType {
                    expected: dtype.tag().to_string(),
                    found: format!("{fill_value:?}"),
                })
            }
        })
    }
}

/// A schema's default/fill value, castable to its dtype.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FillValue {
    /// An integer fill value, narrowed to the target integer dtype on use.
    Int(i64),
    /// A floating-point fill value (may be NaN).
    Float(f64),
    /// A complex fill value (may carry NaN components).
    Complex(Complex64),
}

impl FillValue {
    /// The default fill value for a dtype per §3: integer minimum, or NaN for float/complex.
    ///
    /// # Errors
    /// Returns [`Error::InvalidSchema`] for non-numeric dtypes, which have no default fill value.
    pub fn default_for(dtype: DType) -> Result<Self> {
        Ok(match dtype {
            DType::I8 => Self::Int(i64::from(i8::MIN)),
            DType::I16 => Self::Int(i64::from(i16::MIN)),
            DType::I32 => Self::Int(i64::from(i32::MIN)),
            DType::I64 => Self::Int(i64::MIN),
            DType::F16 | DType::F32 | DType::F64 => Self::Float(f64::NAN),
            DType::C64 | DType::C128 | DType::C256 => {
                Self::Complex(Complex64::new(f64::NAN, f64::NAN))
            }
            DType::Str | DType::Tuple | DType::DateTime => {
                return Err(Error::InvalidSchema(format!(
                    "dtype {:?} has no default fill value",
                    dtype
                )))
            }
        })
    }

    /// Validate that this fill value is representable in `dtype` (NaN is illegal for integers).
    ///
    /// # Errors
    /// Returns [`Error::InvalidSchema`] if the fill value's kind mismatches `dtype`, or if
    /// an integer dtype is paired with a NaN float value.
    pub fn validate(self, dtype: DType) -> Result<()> {
        match (dtype, self) {
            (DType::I8 | DType::I16 | DType::I32 | DType::I64, Self::Int(_)) => Ok(()),
            (DType::F16 | DType::F32 | DType::F64, Self::Float(_)) => Ok(()),
            (DType::C64 | DType::C128 | DType::C256, Self::Complex(_)) => Ok(()),
            _ if !dtype.allows_nan() && matches!(self, Self::Float(f) if f.is_nan()) => Err(
                Error::InvalidSchema("NaN is not a legal fill value for an integer dtype".into()),
            ),
            _ => Err(Error::InvalidSchema(format!(
                "fill value {self:?} is not representable in dtype {dtype:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_platform_dtypes() {
        assert_eq!(DType::normalize("int").unwrap(), DType::I64);
        assert_eq!(DType::normalize("float").unwrap(), DType::F64);
        assert_eq!(DType::normalize("complex").unwrap(), DType::C128);
        assert!(DType::normalize("bogus").is_err());
    }

    #[test]
    fn nan_illegal_for_integers() {
        let err = FillValue::Float(f64::NAN).validate(DType::I64).unwrap_err();
        assert!(matches!(err, Error::InvalidSchema(_)));
    }

    #[test]
    fn default_fill_values_match_spec() {
        assert_eq!(FillValue::default_for(DType::I8).unwrap(), FillValue::Int(-128));
        assert!(matches!(
            FillValue::default_for(DType::F64).unwrap(),
            FillValue::Float(f) if f.is_nan()
        ));
    }
}

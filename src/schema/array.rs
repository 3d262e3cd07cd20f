//! Array schemas.

use crate::dtype::{DType, FillValue};
use crate::error::{Error, Result};

use super::attribute::{validate_unique_names, AttributeSchema};
use super::dimension::DimensionSchema;

/// The declarative schema shared by every Array in a Collection.
#[derive(Debug, Clone, PartialEq)]
pub struct ArraySchema {
    dtype: DType,
    fill_value: FillValue,
    dimensions: Vec<DimensionSchema>,
    attributes: Vec<AttributeSchema>,
}

impl ArraySchema {
    /// Construct and validate an Array schema.
    ///
    /// # Errors
    /// Returns [`Error::InvalidSchema`] if: `dtype` is not numeric; `fill_value`
    /// is not representable in `dtype`; `dimensions` is empty or has
    /// duplicate names; `attributes` has duplicate names; or any time
    /// dimension's `$ref` does not resolve to a `datetime` attribute.
    pub fn new(
        dtype: DType,
        fill_value: Option<FillValue>,
        dimensions: Vec<DimensionSchema>,
        attributes: Vec<AttributeSchema>,
    ) -> Result<Self> {
        if !dtype.is_buffer_representable() {
            return Err(Error::InvalidSchema(format!(
                "array dtype must be a buffer-representable numeric type, found {:?}",
                dtype
            )));
        }
        if dimensions.is_empty() {
            return Err(Error::InvalidSchema(
                "array schema must declare at least one dimension".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for dim in &dimensions {
            if !seen.insert(dim.name()) {
                return Err(Error::InvalidSchema(format!(
                    "duplicate dimension name: {}",
                    dim.name()
                )));
            }
        }
        validate_unique_names(&attributes)?;

        let fill_value = match fill_value {
            Some(fv) => {
                fv.validate(dtype)?;
                fv
            }
            None => FillValue::default_for(dtype)?,
        };

        for dim in &dimensions {
            if let Some(ref_name) = dim.time_ref() {
                let resolved = attributes
                    .iter()
                    .find(|a| a.name() == ref_name)
                    .ok_or_else(|| {
                        Error::InvalidSchema(format!(
                            "time dimension {} references unknown attribute {ref_name}",
                            dim.name()
                        ))
                    })?;
                if resolved.dtype() != DType::DateTime {
                    return Err(Error::InvalidSchema(format!(
                        "time dimension {} references non-datetime attribute {ref_name}",
                        dim.name()
                    )));
                }
            }
        }

        Ok(Self {
            dtype,
            fill_value,
            dimensions,
            attributes,
        })
    }

    /// The array's element dtype.
    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// The array's fill value.
    #[must_use]
    pub fn fill_value(&self) -> FillValue {
        self.fill_value
    }

    /// The ordered dimension schemas.
    #[must_use]
    pub fn dimensions(&self) -> &[DimensionSchema] {
        &self.dimensions
    }

    /// The declared shape, in dimension order.
    #[must_use]
    pub fn shape(&self) -> Vec<u64> {
        self.dimensions.iter().map(DimensionSchema::size).collect()
    }

    /// The declared attribute schemas, in declaration order.
    #[must_use]
    pub fn attributes(&self) -> &[AttributeSchema] {
        &self.attributes
    }

    /// Attributes marked `primary`, in schema declaration order.
    #[must_use]
    pub fn primary_attributes(&self) -> Vec<&AttributeSchema> {
        self.attributes.iter().filter(|a| a.is_primary()).collect()
    }
}

//! VArray schemas.

use crate::dtype::{DType, FillValue};
use crate::error::{Error, Result};

use super::array::ArraySchema;
use super::attribute::AttributeSchema;
use super::dimension::DimensionSchema;

/// An [`ArraySchema`] extended with a virtual grid describing how the
/// logical array is tiled into physical Array tiles.
#[derive(Debug, Clone, PartialEq)]
pub struct VArraySchema {
    array_schema: ArraySchema,
    vgrid: Vec<u64>,
}

impl VArraySchema {
    /// Construct and validate a VArray schema.
    ///
    /// # Errors
    /// Returns [`Error::InvalidSchema`] if `vgrid`'s length does not match
    /// the number of dimensions, any `vgrid` entry is zero, or any
    /// dimension size is not evenly divisible by its `vgrid` factor.
    pub fn new(
        dtype: DType,
        fill_value: Option<FillValue>,
        dimensions: Vec<DimensionSchema>,
        attributes: Vec<AttributeSchema>,
        vgrid: Vec<u64>,
    ) -> Result<Self> {
        let array_schema = ArraySchema::new(dtype, fill_value, dimensions, attributes)?;
        if vgrid.len() != array_schema.dimensions().len() {
            return Err(Error::InvalidSchema(format!(
                "vgrid length {} != dimension count {}",
                vgrid.len(),
                array_schema.dimensions().len()
            )));
        }
        for (dim, factor) in array_schema.dimensions().iter().zip(&vgrid) {
            if *factor == 0 {
                return Err(Error::InvalidSchema(format!(
                    "vgrid factor for dimension {} must be positive",
                    dim.name()
                )));
            }
            if dim.size() % factor != 0 {
                return Err(Error::InvalidSchema(format!(
                    "dimension {} size {} is not divisible by vgrid factor {factor}",
                    dim.name(),
                    dim.size()
                )));
            }
        }
        Ok(Self {
            array_schema,
            vgrid,
        })
    }

    /// The underlying (logical) array schema.
    #[must_use]
    pub fn array_schema(&self) -> &ArraySchema {
        &self.array_schema
    }

    /// The per-dimension tiling factor.
    #[must_use]
    pub fn vgrid(&self) -> &[u64] {
        &self.vgrid
    }

    /// The logical (full, untiled) shape.
    #[must_use]
    pub fn shape(&self) -> Vec<u64> {
        self.array_schema.shape()
    }

    /// The shape shared by every tile: `dim.size / vgrid[i]`.
    #[must_use]
    pub fn tile_shape(&self) -> Vec<u64> {
        self.array_schema
            .shape()
            .iter()
            .zip(&self.vgrid)
            .map(|(size, factor)| size / factor)
            .collect()
    }

    /// The [`ArraySchema`] a tile of this VArray is created with: the same
    /// dtype, fill value, and dimensions, with `vid`/`v_position` appended
    /// as implicit primary attributes (§3's glossary) and any attribute
    /// referenced by a time dimension's `$ref` downgraded to non-primary,
    /// since a tile receives its resolved start value as a computed custom
    /// attribute rather than at creation time (§4.8).
    ///
    /// # Errors
    /// Returns [`Error::InvalidSchema`] if the derived attribute set is malformed.
    pub fn tile_schema(&self) -> Result<ArraySchema> {
        let time_refs: std::collections::HashSet<&str> = self
            .array_schema
            .dimensions()
            .iter()
            .filter_map(DimensionSchema::time_ref)
            .collect();

        let mut attributes = Vec::with_capacity(self.array_schema.attributes().len() + 2);
        for attr in self.array_schema.attributes() {
            if time_refs.contains(attr.name()) {
                attributes.push(AttributeSchema::new(attr.name(), attr.dtype(), false)?);
            } else {
                attributes.push(attr.clone());
            }
        }
        attributes.push(AttributeSchema::new("vid", DType::Str, true)?);
        attributes.push(AttributeSchema::new("v_position", DType::Tuple, true)?);

        ArraySchema::new(
            self.array_schema.dtype(),
            Some(self.array_schema.fill_value()),
            self.array_schema.dimensions().to_vec(),
            attributes,
        )
    }
}

//! Attribute schemas.

use crate::dtype::DType;
use crate::error::{Error, Result};

/// A declared attribute: a named, typed slot in an Array's metadata.
///
/// Primary attributes participate in the attribute-symlink index and are
/// immutable once set; custom attributes are mutable and stored in metadata
/// only.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeSchema {
    name: String,
    dtype: DType,
    primary: bool,
}

impl AttributeSchema {
    /// Construct and validate an attribute schema.
    ///
    /// # Errors
    /// Returns [`Error::InvalidSchema`] if `name` is blank.
    pub fn new(name: impl Into<String>, dtype: DType, primary: bool) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::InvalidSchema("attribute name must be non-blank".into()));
        }
        Ok(Self {
            name,
            dtype,
            primary,
        })
    }

    /// The attribute's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The attribute's declared dtype.
    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Whether this attribute participates in the symlink index.
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.primary
    }
}

/// Validate that attribute names are unique within a schema.
///
/// # Errors
/// Returns [`Error::InvalidSchema`] on the first duplicate name found.
pub fn validate_unique_names(attributes: &[AttributeSchema]) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for attr in attributes {
        if !seen.insert(attr.name()) {
            return Err(Error::InvalidSchema(format!(
                "duplicate attribute name: {}",
                attr.name()
            )));
        }
    }
    Ok(())
}

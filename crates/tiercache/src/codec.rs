use std::fmt;

use thiserror::Error;

/// An error produced by a [`Transformable`] conversion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct TransformError(String);

impl TransformError {
    pub fn new(message: impl fmt::Display) -> Self {
        Self(message.to_string())
    }
}

/// The reversible value <-> bytes conversion a cached payload must support.
///
/// This is the only constraint the cache places on values: the disk tier
/// encodes values through [`to_bytes`](Self::to_bytes) before writing and
/// decodes files through [`from_bytes`](Self::from_bytes) after reading. The
/// loader also uses [`from_bytes`](Self::from_bytes) as the default
/// conversion for freshly fetched bytes, unless a per-call decode override
/// is supplied.
pub trait Transformable: Sized {
    fn to_bytes(&self) -> Result<Vec<u8>, TransformError>;
    fn from_bytes(bytes: &[u8]) -> Result<Self, TransformError>;
}

impl Transformable for Vec<u8> {
    fn to_bytes(&self) -> Result<Vec<u8>, TransformError> {
        Ok(self.clone())
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, TransformError> {
        Ok(bytes.to_vec())
    }
}

impl Transformable for String {
    fn to_bytes(&self) -> Result<Vec<u8>, TransformError> {
        Ok(self.as_bytes().to_vec())
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, TransformError> {
        String::from_utf8(bytes.to_vec()).map_err(TransformError::new)
    }
}

//! Typed binary encoding of layers, blocks and parameters.
//!
//! Every value is written as a [`Tagged`] record holding its type identifier and a payload. The
//! payload is the `bincode` encoding of the value's [`Codec::Record`]. Composite values nest the
//! tagged records of their children inside their own records, so a decoder can dispatch on the
//! identifier before it knows the payload layout.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{Error, Result, ResultExt};

/// Choices that cannot be recovered from serialized data and must be supplied by the caller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BuildOptions {
    /// How decoded convolution layers compute.
    pub conv: crate::conv::ConvStrategy,
}

/// A value with a fixed type identifier and a serializable record form.
pub trait Codec: Sized {
    /// Unique identifier written before the payload.
    const TYPE_ID: &'static str;

    /// Plain data written as the payload.
    type Record: Serialize + DeserializeOwned;

    /// Capture the value as a record.
    fn to_record(&self) -> Result<Self::Record>;

    /// Rebuild a value from a record produced by [`Codec::to_record`], validating its shape.
    fn from_record(record: Self::Record, opts: &BuildOptions) -> Result<Self>;
}

/// A type identifier together with the encoded record of a value of that type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tagged {
    /// Identifier of the encoded type.
    pub type_id: String,
    /// `bincode` encoding of the type's record.
    pub payload: Vec<u8>,
}

impl Tagged {
    /// Encode a value with its identifier.
    pub fn new<T: Codec>(value: &T) -> Result<Self> {
        Ok(Self {
            type_id: T::TYPE_ID.to_owned(),
            payload: to_bytes(&value.to_record()?)?,
        })
    }

    /// Decode the payload as `T`, failing if the identifier names another type.
    pub fn decode<T: Codec>(&self, opts: &BuildOptions) -> Result<T> {
        if self.type_id != T::TYPE_ID {
            return Err(Error::TypeMismatch {
                expected: T::TYPE_ID,
                actual: self.type_id.clone(),
            });
        }
        from_bytes(&self.payload)
            .and_then(|record| T::from_record(record, opts))
            .with_context(|| format!("deserialize {}", T::TYPE_ID))
    }
}

// Fixed-width integers, and a payload must be consumed exactly.
fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

/// Encode plain data with the crate's `bincode` settings.
pub fn to_bytes<S: Serialize>(value: &S) -> Result<Vec<u8>> {
    Ok(options().serialize(value)?)
}

/// Decode plain data written by [`to_bytes`], rejecting truncated input and trailing bytes.
pub fn from_bytes<D: DeserializeOwned>(data: &[u8]) -> Result<D> {
    Ok(options().deserialize(data)?)
}

/// Serialize a value as a standalone tagged record.
pub fn serialize<T: Codec>(value: &T) -> Result<Vec<u8>> {
    to_bytes(&Tagged::new(value)?)
}

/// Deserialize a tagged record of a known type.
pub fn deserialize<T: Codec>(data: &[u8], opts: &BuildOptions) -> Result<T> {
    from_bytes::<Tagged>(data)?.decode(opts)
}

use std::any::{type_name, Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use crate::serialize::{mismatch, RestoreError, SerializedValue};

/// Binary encoding for one runtime type, addressed by a stable type tag.
pub trait BlobCodec: Send + Sync {
    fn type_tag(&self) -> &str;
    fn value_type(&self) -> TypeId;
    fn value_type_name(&self) -> &'static str;
    fn encode(&self, value: &dyn Any) -> Option<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Option<Box<dyn Any + Send + Sync>>;
}

struct FnCodec<T> {
    type_tag: String,
    encode: fn(&T) -> Vec<u8>,
    decode: fn(&[u8]) -> Option<T>,
}

impl<T: Any + Send + Sync> BlobCodec for FnCodec<T> {
    fn type_tag(&self) -> &str {
        &self.type_tag
    }

    fn value_type(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn value_type_name(&self) -> &'static str {
        type_name::<T>()
    }

    fn encode(&self, value: &dyn Any) -> Option<Vec<u8>> {
        value.downcast_ref::<T>().map(self.encode)
    }

    fn decode(&self, bytes: &[u8]) -> Option<Box<dyn Any + Send + Sync>> {
        (self.decode)(bytes).map(|value| Box::new(value) as Box<dyn Any + Send + Sync>)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecEntry {
    pub type_tag: String,
    pub value_type: &'static str,
}

/// Table of blob codecs keyed both by runtime type and by type tag.
///
/// Registering a codec for a type or tag that is already present replaces
/// the earlier entry, so per-recorder overrides can be layered on top of the
/// built-in set.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    by_type: HashMap<TypeId, Arc<dyn BlobCodec>>,
    by_tag: BTreeMap<String, Arc<dyn BlobCodec>>,
}

impl CodecRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with `bytes`, `f32_array` and `f64_array`.
    #[must_use]
    pub fn with_builtin_codecs() -> Self {
        let mut registry = Self::new();
        registry
            .register::<Vec<u8>>("bytes", Clone::clone, |bytes| Some(bytes.to_vec()))
            .register::<Vec<f32>>("f32_array", encode_f32_array, decode_f32_array)
            .register::<Vec<f64>>("f64_array", encode_f64_array, decode_f64_array);
        registry
    }

    pub fn register<T: Any + Send + Sync>(
        &mut self,
        type_tag: impl Into<String>,
        encode: fn(&T) -> Vec<u8>,
        decode: fn(&[u8]) -> Option<T>,
    ) -> &mut Self {
        self.register_codec(Arc::new(FnCodec { type_tag: type_tag.into(), encode, decode }))
    }

    pub fn register_codec(&mut self, codec: Arc<dyn BlobCodec>) -> &mut Self {
        if let Some(previous) = self.by_type.insert(codec.value_type(), codec.clone()) {
            if previous.type_tag() != codec.type_tag() {
                self.by_tag.remove(previous.type_tag());
            }
        }
        if let Some(previous) = self.by_tag.insert(codec.type_tag().to_string(), codec.clone()) {
            if previous.value_type() != codec.value_type() {
                self.by_type.remove(&previous.value_type());
            }
        }
        self
    }

    /// Layer every codec of `overrides` on top of this registry.
    pub fn extend_from(&mut self, overrides: &CodecRegistry) -> &mut Self {
        for codec in overrides.by_tag.values() {
            self.register_codec(codec.clone());
        }
        self
    }

    #[must_use]
    pub fn entries(&self) -> Vec<CodecEntry> {
        self.by_tag
            .values()
            .map(|codec| CodecEntry {
                type_tag: codec.type_tag().to_string(),
                value_type: codec.value_type_name(),
            })
            .collect()
    }

    #[must_use]
    pub fn contains_tag(&self, type_tag: &str) -> bool {
        self.by_tag.contains_key(type_tag)
    }

    #[must_use]
    pub fn encode<T: Any>(&self, value: &T) -> Option<(String, Vec<u8>)> {
        let codec = self.by_type.get(&TypeId::of::<T>())?;
        let bytes = codec.encode(value)?;
        Some((codec.type_tag().to_string(), bytes))
    }

    #[must_use]
    pub fn decode_any(&self, type_tag: &str, bytes: &[u8]) -> Option<Box<dyn Any + Send + Sync>> {
        self.by_tag.get(type_tag)?.decode(bytes)
    }

    /// Decode a blob value back into `T`.
    ///
    /// # Errors
    /// Returns [`RestoreError`] when `value` is not a blob, when no codec is
    /// registered for its tag, or when the codec rejects the payload or
    /// produces a different type.
    pub fn decode<T: Any>(&self, value: &SerializedValue) -> Result<T, RestoreError> {
        let SerializedValue::Blob { type_tag, bytes } = value else {
            return Err(mismatch("blob", value));
        };
        let codec = self
            .by_tag
            .get(type_tag)
            .ok_or_else(|| RestoreError::MissingCodec { type_tag: type_tag.clone() })?;
        let decoded =
            codec.decode(bytes).ok_or_else(|| RestoreError::Codec { type_tag: type_tag.clone() })?;
        decoded
            .downcast::<T>()
            .map(|boxed| *boxed)
            .map_err(|_| RestoreError::Codec { type_tag: type_tag.clone() })
    }
}

impl Debug for CodecRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.by_tag.keys()).finish()
    }
}

fn encode_f32_array(values: &Vec<f32>) -> Vec<u8> {
    values.iter().flat_map(|value| value.to_le_bytes()).collect()
}

fn decode_f32_array(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    bytes
        .chunks_exact(4)
        .map(|chunk| chunk.try_into().ok().map(f32::from_le_bytes))
        .collect()
}

fn encode_f64_array(values: &Vec<f64>) -> Vec<u8> {
    values.iter().flat_map(|value| value.to_le_bytes()).collect()
}

fn decode_f64_array(bytes: &[u8]) -> Option<Vec<f64>> {
    if bytes.len() % 8 != 0 {
        return None;
    }
    bytes
        .chunks_exact(8)
        .map(|chunk| chunk.try_into().ok().map(f64::from_le_bytes))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialize::{serialize, Registered};

    #[derive(Debug, Clone, PartialEq)]
    struct Point {
        x: i16,
        y: i16,
    }

    fn encode_point(point: &Point) -> Vec<u8> {
        let mut bytes = point.x.to_le_bytes().to_vec();
        bytes.extend_from_slice(&point.y.to_le_bytes());
        bytes
    }

    fn decode_point(bytes: &[u8]) -> Option<Point> {
        let x = bytes.get(0..2)?.try_into().ok().map(i16::from_le_bytes)?;
        let y = bytes.get(2..4)?.try_into().ok().map(i16::from_le_bytes)?;
        Some(Point { x, y })
    }

    #[test]
    fn builtin_codecs_are_inspectable() {
        let registry = CodecRegistry::with_builtin_codecs();
        let tags = registry.entries().into_iter().map(|entry| entry.type_tag).collect::<Vec<_>>();
        assert_eq!(tags, vec!["bytes", "f32_array", "f64_array"]);
    }

    #[test]
    fn custom_codec_round_trips() -> Result<(), RestoreError> {
        let mut registry = CodecRegistry::new();
        registry.register("point", encode_point, decode_point);
        let point = Point { x: -3, y: 9 };

        let serialized = serialize(&Registered(&point), &registry);
        assert_eq!(registry.decode::<Point>(&serialized)?, point);
        Ok(())
    }

    #[test]
    fn overrides_replace_same_type_and_drop_old_tag() {
        let mut registry = CodecRegistry::with_builtin_codecs();
        let mut overrides = CodecRegistry::new();
        overrides.register::<Vec<u8>>("raw", Clone::clone, |bytes| Some(bytes.to_vec()));
        registry.extend_from(&overrides);

        assert!(registry.contains_tag("raw"));
        assert!(!registry.contains_tag("bytes"));
        assert_eq!(registry.encode(&vec![1_u8, 2]), Some(("raw".to_string(), vec![1, 2])));
    }

    #[test]
    fn decode_reports_missing_codec_and_bad_payload() {
        let registry = CodecRegistry::with_builtin_codecs();
        let unknown = SerializedValue::Blob { type_tag: "tensor".to_string(), bytes: vec![0] };
        assert_eq!(
            registry.decode::<Vec<u8>>(&unknown),
            Err(RestoreError::MissingCodec { type_tag: "tensor".to_string() })
        );

        let truncated = SerializedValue::Blob { type_tag: "f64_array".to_string(), bytes: vec![0; 5] };
        assert_eq!(
            registry.decode::<Vec<f64>>(&truncated),
            Err(RestoreError::Codec { type_tag: "f64_array".to_string() })
        );
    }
}

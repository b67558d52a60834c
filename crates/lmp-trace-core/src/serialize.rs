use std::any::{type_name, Any};
use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt::{self, Debug, Formatter};
use std::hash::BuildHasher;
use std::rc::Rc;
use std::sync::{Arc, Mutex, TryLockError};

use serde::{Deserialize, Serialize};

use crate::codec::CodecRegistry;

const DEFAULT_MAX_DEPTH: usize = 128;
const MAX_REPR_CHARS: usize = 2048;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Primitive {
    Null,
    Bool(bool),
    Int(i64),
    #[serde(rename = "uint")]
    UInt(u64),
    Float(#[serde(with = "float_repr")] f64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub value: SerializedValue,
}

impl Field {
    #[must_use]
    pub fn new(name: impl Into<String>, value: SerializedValue) -> Self {
        Self { name: name.into(), value }
    }
}

/// Storable form of a runtime value.
///
/// Every runtime value maps to some variant: values without a canonical form
/// become [`SerializedValue::Unrepresentable`], and a shared pointer that is
/// reached again while it is still being serialized becomes
/// [`SerializedValue::CyclicReference`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SerializedValue {
    Primitive(Primitive),
    List(Vec<SerializedValue>),
    Map(Vec<Field>),
    Record {
        type_name: String,
        fields: Vec<Field>,
    },
    Blob {
        type_tag: String,
        #[serde(with = "hex_bytes")]
        bytes: Vec<u8>,
    },
    Unrepresentable {
        type_name: String,
        repr: String,
    },
    CyclicReference {
        type_name: String,
    },
}

impl SerializedValue {
    #[must_use]
    pub fn null() -> Self {
        Self::Primitive(Primitive::Null)
    }

    #[must_use]
    pub fn bool(value: bool) -> Self {
        Self::Primitive(Primitive::Bool(value))
    }

    #[must_use]
    pub fn int(value: i64) -> Self {
        Self::Primitive(Primitive::Int(value))
    }

    #[must_use]
    pub fn uint(value: u64) -> Self {
        Self::Primitive(Primitive::UInt(value))
    }

    #[must_use]
    pub fn float(value: f64) -> Self {
        Self::Primitive(Primitive::Float(value))
    }

    #[must_use]
    pub fn text(value: impl Into<String>) -> Self {
        Self::Primitive(Primitive::Text(value.into()))
    }

    /// Placeholder for a value of type `T` that has no canonical form.
    #[must_use]
    pub fn placeholder<T: ?Sized>(repr: impl Into<String>) -> Self {
        Self::Unrepresentable { type_name: type_name::<T>().to_string(), repr: truncate_repr(repr.into()) }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Primitive(Primitive::Null) => "null",
            Self::Primitive(Primitive::Bool(_)) => "bool",
            Self::Primitive(Primitive::Int(_)) => "int",
            Self::Primitive(Primitive::UInt(_)) => "uint",
            Self::Primitive(Primitive::Float(_)) => "float",
            Self::Primitive(Primitive::Text(_)) => "text",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Record { .. } => "record",
            Self::Blob { .. } => "blob",
            Self::Unrepresentable { .. } => "unrepresentable",
            Self::CyclicReference { .. } => "cyclic_reference",
        }
    }

    /// True when this value, or anything nested in it, cannot be restored exactly.
    #[must_use]
    pub fn is_lossy(&self) -> bool {
        match self {
            Self::Unrepresentable { .. } | Self::CyclicReference { .. } => true,
            Self::List(items) => items.iter().any(Self::is_lossy),
            Self::Map(fields) | Self::Record { fields, .. } => {
                fields.iter().any(|field| field.value.is_lossy())
            }
            Self::Primitive(_) | Self::Blob { .. } => false,
        }
    }

    /// Deterministic text encoding used for hashing and equality of snapshots.
    #[must_use]
    pub fn canonical_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|err| format!("<unencodable {self:?}: {err}>"))
    }
}

/// Conversion of a runtime value into a [`SerializedValue`].
///
/// Implementations must not fail: anything that cannot be represented is
/// reported through [`SerializedValue::placeholder`].
pub trait Capture {
    fn capture(&self, serializer: &mut Serializer<'_>) -> SerializedValue;
}

/// Serializes values against a codec table, breaking pointer cycles.
pub struct Serializer<'a> {
    codecs: &'a CodecRegistry,
    active: Vec<usize>,
    depth: usize,
    max_depth: usize,
}

impl<'a> Serializer<'a> {
    #[must_use]
    pub fn new(codecs: &'a CodecRegistry) -> Self {
        Self { codecs, active: Vec::new(), depth: 0, max_depth: DEFAULT_MAX_DEPTH }
    }

    #[must_use]
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth.max(1);
        self
    }

    #[must_use]
    pub fn codecs(&self) -> &CodecRegistry {
        self.codecs
    }

    pub fn serialize<T: Capture + ?Sized>(&mut self, value: &T) -> SerializedValue {
        if self.depth >= self.max_depth {
            return SerializedValue::placeholder::<T>(format!(
                "<nesting deeper than {} levels>",
                self.max_depth
            ));
        }
        self.depth += 1;
        let captured = value.capture(self);
        self.depth -= 1;
        captured
    }

    /// Start a record value with named fields in declaration order.
    pub fn record(&mut self, type_name: impl Into<String>) -> RecordBuilder<'_, 'a> {
        RecordBuilder { serializer: self, type_name: type_name.into(), fields: Vec::new() }
    }

    fn shared<T: Capture + ?Sized>(&mut self, address: usize, value: &T) -> SerializedValue {
        if self.active.contains(&address) {
            return SerializedValue::CyclicReference { type_name: type_name::<T>().to_string() };
        }
        self.active.push(address);
        let captured = self.serialize(value);
        self.active.pop();
        captured
    }
}

pub struct RecordBuilder<'s, 'a> {
    serializer: &'s mut Serializer<'a>,
    type_name: String,
    fields: Vec<Field>,
}

impl RecordBuilder<'_, '_> {
    #[must_use]
    pub fn field<T: Capture + ?Sized>(mut self, name: &str, value: &T) -> Self {
        let value = self.serializer.serialize(value);
        self.fields.push(Field::new(name, value));
        self
    }

    #[must_use]
    pub fn finish(self) -> SerializedValue {
        SerializedValue::Record { type_name: self.type_name, fields: self.fields }
    }
}

/// Serialize one value with the given codec table.
#[must_use]
pub fn serialize<T: Capture + ?Sized>(value: &T, codecs: &CodecRegistry) -> SerializedValue {
    Serializer::new(codecs).serialize(value)
}

/// Captures a value through its `Debug` output only.
///
/// This is the explicit fallback for types with no canonical textual or binary form.
pub struct Opaque<'a, T: ?Sized>(pub &'a T);

impl<T: Debug + ?Sized> Capture for Opaque<'_, T> {
    fn capture(&self, _serializer: &mut Serializer<'_>) -> SerializedValue {
        SerializedValue::placeholder::<T>(format!("{:?}", self.0))
    }
}

/// Captures a value through the serializer's registered blob codec for its type.
pub struct Registered<'a, T>(pub &'a T);

impl<T: Any> Capture for Registered<'_, T> {
    fn capture(&self, serializer: &mut Serializer<'_>) -> SerializedValue {
        match serializer.codecs().encode(self.0) {
            Some((type_tag, bytes)) => SerializedValue::Blob { type_tag, bytes },
            None => SerializedValue::placeholder::<T>("<no codec registered>"),
        }
    }
}

/// Captures a value through its `serde::Serialize` implementation.
pub struct SerdeValue<'a, T: ?Sized>(pub &'a T);

impl<T: Serialize + ?Sized> Capture for SerdeValue<'_, T> {
    fn capture(&self, serializer: &mut Serializer<'_>) -> SerializedValue {
        match serde_json::to_value(self.0) {
            Ok(value) => serializer.serialize(&value),
            Err(err) => SerializedValue::placeholder::<T>(format!("<serde error: {err}>")),
        }
    }
}

impl Capture for SerializedValue {
    fn capture(&self, _serializer: &mut Serializer<'_>) -> SerializedValue {
        self.clone()
    }
}

impl Capture for () {
    fn capture(&self, _serializer: &mut Serializer<'_>) -> SerializedValue {
        SerializedValue::null()
    }
}

impl Capture for bool {
    fn capture(&self, _serializer: &mut Serializer<'_>) -> SerializedValue {
        SerializedValue::bool(*self)
    }
}

macro_rules! capture_signed {
    ($($ty:ty),*) => {
        $(impl Capture for $ty {
            fn capture(&self, _serializer: &mut Serializer<'_>) -> SerializedValue {
                SerializedValue::int(i64::from(*self))
            }
        })*
    };
}

macro_rules! capture_unsigned {
    ($($ty:ty),*) => {
        $(impl Capture for $ty {
            fn capture(&self, _serializer: &mut Serializer<'_>) -> SerializedValue {
                SerializedValue::uint(u64::from(*self))
            }
        })*
    };
}

capture_signed!(i8, i16, i32, i64);
capture_unsigned!(u8, u16, u32, u64);

impl Capture for isize {
    fn capture(&self, _serializer: &mut Serializer<'_>) -> SerializedValue {
        i64::try_from(*self)
            .map_or_else(|_| SerializedValue::placeholder::<isize>(self.to_string()), SerializedValue::int)
    }
}

impl Capture for usize {
    fn capture(&self, _serializer: &mut Serializer<'_>) -> SerializedValue {
        u64::try_from(*self)
            .map_or_else(|_| SerializedValue::placeholder::<usize>(self.to_string()), SerializedValue::uint)
    }
}

impl Capture for f32 {
    fn capture(&self, _serializer: &mut Serializer<'_>) -> SerializedValue {
        SerializedValue::float(f64::from(*self))
    }
}

impl Capture for f64 {
    fn capture(&self, _serializer: &mut Serializer<'_>) -> SerializedValue {
        SerializedValue::float(*self)
    }
}

impl Capture for char {
    fn capture(&self, _serializer: &mut Serializer<'_>) -> SerializedValue {
        SerializedValue::text(self.to_string())
    }
}

impl Capture for str {
    fn capture(&self, _serializer: &mut Serializer<'_>) -> SerializedValue {
        SerializedValue::text(self)
    }
}

impl Capture for String {
    fn capture(&self, _serializer: &mut Serializer<'_>) -> SerializedValue {
        SerializedValue::text(self.as_str())
    }
}

impl Capture for Cow<'_, str> {
    fn capture(&self, _serializer: &mut Serializer<'_>) -> SerializedValue {
        SerializedValue::text(self.as_ref())
    }
}

impl<T: Capture> Capture for Option<T> {
    fn capture(&self, serializer: &mut Serializer<'_>) -> SerializedValue {
        match self {
            Some(value) => serializer.serialize(value),
            None => SerializedValue::null(),
        }
    }
}

impl<T: Capture> Capture for [T] {
    fn capture(&self, serializer: &mut Serializer<'_>) -> SerializedValue {
        SerializedValue::List(self.iter().map(|item| serializer.serialize(item)).collect())
    }
}

impl<T: Capture, const N: usize> Capture for [T; N] {
    fn capture(&self, serializer: &mut Serializer<'_>) -> SerializedValue {
        self.as_slice().capture(serializer)
    }
}

impl<T: Capture> Capture for Vec<T> {
    fn capture(&self, serializer: &mut Serializer<'_>) -> SerializedValue {
        self.as_slice().capture(serializer)
    }
}

impl<T: Capture> Capture for VecDeque<T> {
    fn capture(&self, serializer: &mut Serializer<'_>) -> SerializedValue {
        SerializedValue::List(self.iter().map(|item| serializer.serialize(item)).collect())
    }
}

impl<T: Capture> Capture for BTreeSet<T> {
    fn capture(&self, serializer: &mut Serializer<'_>) -> SerializedValue {
        SerializedValue::List(self.iter().map(|item| serializer.serialize(item)).collect())
    }
}

impl<T: Capture, S: BuildHasher> Capture for HashSet<T, S> {
    fn capture(&self, serializer: &mut Serializer<'_>) -> SerializedValue {
        // Iteration order is per-process; sort so the snapshot is stable.
        let mut items = self.iter().map(|item| serializer.serialize(item)).collect::<Vec<_>>();
        items.sort_by_cached_key(SerializedValue::canonical_json);
        SerializedValue::List(items)
    }
}

impl<T: Capture> Capture for BTreeMap<String, T> {
    fn capture(&self, serializer: &mut Serializer<'_>) -> SerializedValue {
        SerializedValue::Map(
            self.iter().map(|(key, value)| Field::new(key.clone(), serializer.serialize(value))).collect(),
        )
    }
}

impl<T: Capture, S: BuildHasher> Capture for HashMap<String, T, S> {
    fn capture(&self, serializer: &mut Serializer<'_>) -> SerializedValue {
        let mut entries = self.iter().collect::<Vec<_>>();
        entries.sort_by(|lhs, rhs| lhs.0.cmp(rhs.0));
        SerializedValue::Map(
            entries
                .into_iter()
                .map(|(key, value)| Field::new(key.clone(), serializer.serialize(value)))
                .collect(),
        )
    }
}

impl<T: Capture + ?Sized> Capture for &T {
    fn capture(&self, serializer: &mut Serializer<'_>) -> SerializedValue {
        (**self).capture(serializer)
    }
}

impl<T: Capture + ?Sized> Capture for Box<T> {
    fn capture(&self, serializer: &mut Serializer<'_>) -> SerializedValue {
        (**self).capture(serializer)
    }
}

impl<T: Capture + ?Sized> Capture for Rc<T> {
    fn capture(&self, serializer: &mut Serializer<'_>) -> SerializedValue {
        let address = Rc::as_ptr(self).cast::<()>() as usize;
        serializer.shared(address, &**self)
    }
}

impl<T: Capture + ?Sized> Capture for Arc<T> {
    fn capture(&self, serializer: &mut Serializer<'_>) -> SerializedValue {
        let address = Arc::as_ptr(self).cast::<()>() as usize;
        serializer.shared(address, &**self)
    }
}

impl<T: Capture + ?Sized> Capture for RefCell<T> {
    fn capture(&self, serializer: &mut Serializer<'_>) -> SerializedValue {
        match self.try_borrow() {
            Ok(value) => serializer.serialize(&*value),
            Err(_) => SerializedValue::placeholder::<T>("<mutably borrowed>"),
        }
    }
}

impl<T: Capture + ?Sized> Capture for Mutex<T> {
    fn capture(&self, serializer: &mut Serializer<'_>) -> SerializedValue {
        match self.try_lock() {
            Ok(value) => serializer.serialize(&*value),
            Err(TryLockError::Poisoned(poisoned)) => serializer.serialize(&*poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => SerializedValue::placeholder::<T>("<locked>"),
        }
    }
}

impl Capture for serde_json::Value {
    fn capture(&self, serializer: &mut Serializer<'_>) -> SerializedValue {
        match self {
            Self::Null => SerializedValue::null(),
            Self::Bool(value) => SerializedValue::bool(*value),
            Self::Number(number) => {
                if let Some(value) = number.as_i64() {
                    SerializedValue::int(value)
                } else if let Some(value) = number.as_u64() {
                    SerializedValue::uint(value)
                } else {
                    number.as_f64().map_or_else(
                        || SerializedValue::placeholder::<serde_json::Number>(number.to_string()),
                        SerializedValue::float,
                    )
                }
            }
            Self::String(value) => SerializedValue::text(value.as_str()),
            Self::Array(items) => {
                SerializedValue::List(items.iter().map(|item| serializer.serialize(item)).collect())
            }
            Self::Object(object) => SerializedValue::Map(
                object
                    .iter()
                    .map(|(key, value)| Field::new(key.clone(), serializer.serialize(value)))
                    .collect(),
            ),
        }
    }
}

macro_rules! capture_tuple {
    ($($name:ident),+) => {
        impl<$($name: Capture),+> Capture for ($($name,)+) {
            #[allow(non_snake_case)]
            fn capture(&self, serializer: &mut Serializer<'_>) -> SerializedValue {
                let ($($name,)+) = self;
                SerializedValue::List(vec![$(serializer.serialize($name)),+])
            }
        }
    };
}

capture_tuple!(A);
capture_tuple!(A, B);
capture_tuple!(A, B, C);
capture_tuple!(A, B, C, D);
capture_tuple!(A, B, C, D, E);
capture_tuple!(A, B, C, D, E, F);

/// Best-effort reconstruction of a [`SerializedValue`].
#[derive(Debug)]
pub enum RuntimeValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    List(Vec<RuntimeValue>),
    Map(Vec<(String, RuntimeValue)>),
    Record { type_name: String, fields: Vec<(String, RuntimeValue)> },
    Blob(DecodedBlob),
    /// Marker standing in for a value that was not recorded in full.
    Opaque(OpaqueValue),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpaqueValue {
    pub type_name: String,
    pub repr: String,
    pub cyclic: bool,
}

pub struct DecodedBlob {
    type_tag: String,
    bytes: Vec<u8>,
    decoded: Option<Box<dyn Any + Send + Sync>>,
}

impl DecodedBlob {
    #[must_use]
    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn is_decoded(&self) -> bool {
        self.decoded.is_some()
    }

    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.decoded.as_ref().and_then(|value| value.downcast_ref::<T>())
    }
}

impl Debug for DecodedBlob {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedBlob")
            .field("type_tag", &self.type_tag)
            .field("len", &self.bytes.len())
            .field("decoded", &self.decoded.is_some())
            .finish()
    }
}

/// Reconstruct a runtime value. Placeholders come back as [`RuntimeValue::Opaque`]
/// markers, and blobs without a registered codec keep their raw bytes.
#[must_use]
pub fn deserialize(value: &SerializedValue, codecs: &CodecRegistry) -> RuntimeValue {
    let fields_of = |fields: &[Field]| {
        fields
            .iter()
            .map(|field| (field.name.clone(), deserialize(&field.value, codecs)))
            .collect::<Vec<_>>()
    };

    match value {
        SerializedValue::Primitive(primitive) => match primitive {
            Primitive::Null => RuntimeValue::Null,
            Primitive::Bool(value) => RuntimeValue::Bool(*value),
            Primitive::Int(value) => RuntimeValue::Int(*value),
            Primitive::UInt(value) => RuntimeValue::UInt(*value),
            Primitive::Float(value) => RuntimeValue::Float(*value),
            Primitive::Text(value) => RuntimeValue::Text(value.clone()),
        },
        SerializedValue::List(items) => {
            RuntimeValue::List(items.iter().map(|item| deserialize(item, codecs)).collect())
        }
        SerializedValue::Map(fields) => RuntimeValue::Map(fields_of(fields)),
        SerializedValue::Record { type_name, fields } => {
            RuntimeValue::Record { type_name: type_name.clone(), fields: fields_of(fields) }
        }
        SerializedValue::Blob { type_tag, bytes } => RuntimeValue::Blob(DecodedBlob {
            type_tag: type_tag.clone(),
            bytes: bytes.clone(),
            decoded: codecs.decode_any(type_tag, bytes),
        }),
        SerializedValue::Unrepresentable { type_name, repr } => RuntimeValue::Opaque(OpaqueValue {
            type_name: type_name.clone(),
            repr: repr.clone(),
            cyclic: false,
        }),
        SerializedValue::CyclicReference { type_name } => RuntimeValue::Opaque(OpaqueValue {
            type_name: type_name.clone(),
            repr: "<cyclic reference>".to_string(),
            cyclic: true,
        }),
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RestoreError {
    #[error("expected {expected}, found {found}")]
    TypeMismatch { expected: &'static str, found: &'static str },
    #[error("{value} is out of range for {target}")]
    OutOfRange { value: String, target: &'static str },
    #[error("value of type {type_name} was recorded as a placeholder and cannot be restored")]
    Opaque { type_name: String },
    #[error("no codec registered for blob type tag {type_tag}")]
    MissingCodec { type_tag: String },
    #[error("codec for blob type tag {type_tag} could not decode the payload")]
    Codec { type_tag: String },
}

pub(crate) fn mismatch(expected: &'static str, found: &SerializedValue) -> RestoreError {
    match found {
        SerializedValue::Unrepresentable { type_name, .. }
        | SerializedValue::CyclicReference { type_name } => {
            RestoreError::Opaque { type_name: type_name.clone() }
        }
        other => RestoreError::TypeMismatch { expected, found: other.kind() },
    }
}

/// Typed reconstruction, exact for everything [`Capture`] records losslessly.
pub trait Restore: Sized {
    /// # Errors
    /// Returns [`RestoreError`] when the serialized shape does not match `Self`.
    fn restore(value: &SerializedValue, codecs: &CodecRegistry) -> Result<Self, RestoreError>;
}

impl Restore for SerializedValue {
    fn restore(value: &SerializedValue, _codecs: &CodecRegistry) -> Result<Self, RestoreError> {
        Ok(value.clone())
    }
}

impl Restore for () {
    fn restore(value: &SerializedValue, _codecs: &CodecRegistry) -> Result<Self, RestoreError> {
        match value {
            SerializedValue::Primitive(Primitive::Null) => Ok(()),
            other => Err(mismatch("null", other)),
        }
    }
}

impl Restore for bool {
    fn restore(value: &SerializedValue, _codecs: &CodecRegistry) -> Result<Self, RestoreError> {
        match value {
            SerializedValue::Primitive(Primitive::Bool(value)) => Ok(*value),
            other => Err(mismatch("bool", other)),
        }
    }
}

macro_rules! restore_integer {
    ($($ty:ty),*) => {
        $(impl Restore for $ty {
            fn restore(
                value: &SerializedValue,
                _codecs: &CodecRegistry,
            ) -> Result<Self, RestoreError> {
                let out_of_range = |raw: String| RestoreError::OutOfRange {
                    value: raw,
                    target: stringify!($ty),
                };
                match value {
                    SerializedValue::Primitive(Primitive::Int(raw)) => {
                        <$ty>::try_from(*raw).map_err(|_| out_of_range(raw.to_string()))
                    }
                    SerializedValue::Primitive(Primitive::UInt(raw)) => {
                        <$ty>::try_from(*raw).map_err(|_| out_of_range(raw.to_string()))
                    }
                    other => Err(mismatch("integer", other)),
                }
            }
        })*
    };
}

restore_integer!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

impl Restore for f64 {
    fn restore(value: &SerializedValue, _codecs: &CodecRegistry) -> Result<Self, RestoreError> {
        match value {
            SerializedValue::Primitive(Primitive::Float(value)) => Ok(*value),
            other => Err(mismatch("float", other)),
        }
    }
}

impl Restore for f32 {
    #[allow(clippy::cast_possible_truncation)]
    fn restore(value: &SerializedValue, codecs: &CodecRegistry) -> Result<Self, RestoreError> {
        // Captured f32 values widen losslessly, so narrowing back is exact for them.
        f64::restore(value, codecs).map(|value| value as f32)
    }
}

impl Restore for String {
    fn restore(value: &SerializedValue, _codecs: &CodecRegistry) -> Result<Self, RestoreError> {
        match value {
            SerializedValue::Primitive(Primitive::Text(value)) => Ok(value.clone()),
            other => Err(mismatch("text", other)),
        }
    }
}

impl Restore for char {
    fn restore(value: &SerializedValue, codecs: &CodecRegistry) -> Result<Self, RestoreError> {
        let text = String::restore(value, codecs)?;
        let mut chars = text.chars();
        match (chars.next(), chars.next()) {
            (Some(ch), None) => Ok(ch),
            _ => Err(RestoreError::OutOfRange { value: text, target: "char" }),
        }
    }
}

impl<T: Restore> Restore for Option<T> {
    fn restore(value: &SerializedValue, codecs: &CodecRegistry) -> Result<Self, RestoreError> {
        match value {
            SerializedValue::Primitive(Primitive::Null) => Ok(None),
            other => T::restore(other, codecs).map(Some),
        }
    }
}

fn list_items(value: &SerializedValue) -> Result<&[SerializedValue], RestoreError> {
    match value {
        SerializedValue::List(items) => Ok(items),
        other => Err(mismatch("list", other)),
    }
}

impl<T: Restore> Restore for Vec<T> {
    fn restore(value: &SerializedValue, codecs: &CodecRegistry) -> Result<Self, RestoreError> {
        list_items(value)?.iter().map(|item| T::restore(item, codecs)).collect()
    }
}

impl<T: Restore> Restore for VecDeque<T> {
    fn restore(value: &SerializedValue, codecs: &CodecRegistry) -> Result<Self, RestoreError> {
        list_items(value)?.iter().map(|item| T::restore(item, codecs)).collect()
    }
}

impl<T: Restore + Ord> Restore for BTreeSet<T> {
    fn restore(value: &SerializedValue, codecs: &CodecRegistry) -> Result<Self, RestoreError> {
        list_items(value)?.iter().map(|item| T::restore(item, codecs)).collect()
    }
}

impl<T: Restore> Restore for BTreeMap<String, T> {
    fn restore(value: &SerializedValue, codecs: &CodecRegistry) -> Result<Self, RestoreError> {
        let SerializedValue::Map(fields) = value else {
            return Err(mismatch("map", value));
        };
        fields
            .iter()
            .map(|field| Ok((field.name.clone(), T::restore(&field.value, codecs)?)))
            .collect()
    }
}

impl<T: Restore, S: BuildHasher + Default> Restore for HashMap<String, T, S> {
    fn restore(value: &SerializedValue, codecs: &CodecRegistry) -> Result<Self, RestoreError> {
        let SerializedValue::Map(fields) = value else {
            return Err(mismatch("map", value));
        };
        fields
            .iter()
            .map(|field| Ok((field.name.clone(), T::restore(&field.value, codecs)?)))
            .collect()
    }
}

macro_rules! restore_tuple {
    ($len:expr; $($name:ident),+) => {
        impl<$($name: Restore),+> Restore for ($($name,)+) {
            fn restore(
                value: &SerializedValue,
                codecs: &CodecRegistry,
            ) -> Result<Self, RestoreError> {
                let SerializedValue::List(items) = value else {
                    return Err(mismatch("tuple", value));
                };
                if items.len() != $len {
                    return Err(RestoreError::OutOfRange {
                        value: format!("list of {} items", items.len()),
                        target: concat!("tuple of ", stringify!($len)),
                    });
                }
                let mut items = items.iter();
                Ok(($(
                    match items.next() {
                        Some(item) => $name::restore(item, codecs)?,
                        None => return Err(mismatch("tuple", value)),
                    },
                )+))
            }
        }
    };
}

restore_tuple!(1; A);
restore_tuple!(2; A, B);
restore_tuple!(3; A, B, C);
restore_tuple!(4; A, B, C, D);

fn truncate_repr(repr: String) -> String {
    if repr.chars().count() <= MAX_REPR_CHARS {
        return repr;
    }
    let mut truncated = repr.chars().take(MAX_REPR_CHARS).collect::<String>();
    truncated.push_str("...");
    truncated
}

mod float_repr {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum FloatRepr {
        Number(f64),
        Special(String),
    }

    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_nan() {
            serializer.serialize_str("NaN")
        } else if value.is_infinite() && value.is_sign_positive() {
            serializer.serialize_str("inf")
        } else if value.is_infinite() {
            serializer.serialize_str("-inf")
        } else {
            serializer.serialize_f64(*value)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match FloatRepr::deserialize(deserializer)? {
            FloatRepr::Number(value) => Ok(value),
            FloatRepr::Special(raw) => match raw.as_str() {
                "NaN" => Ok(f64::NAN),
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                other => Err(serde::de::Error::custom(format!("invalid float literal: {other}"))),
            },
        }
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        hex::decode(raw).map_err(serde::de::Error::custom)
    }
}

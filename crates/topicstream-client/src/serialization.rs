//! Payload serialization.
//!
//! A Writer turns values into bytes with a [`Serializer`], a Reader turns
//! bytes back into values with a [`Deserializer`]. Built-in implementations
//! cover little-endian integers, UTF-8 strings, raw bytes and JSON.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;

/// Boxed error returned by serializers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Converts a value into a message payload.
pub trait Serializer<T>: Send + Sync + 'static {
    fn serialize(&self, value: &T) -> Result<Vec<u8>, BoxError>;
}

/// Converts a message payload into a value.
pub trait Deserializer<T>: Send + Sync + 'static {
    fn deserialize(&self, data: &[u8]) -> Result<T, BoxError>;
}

/// Types with a built-in payload format.
pub trait Builtin: Sized + Send + 'static {
    fn serializer() -> Arc<dyn Serializer<Self>>;
    fn deserializer() -> Arc<dyn Deserializer<Self>>;
}

/// 32-bit little-endian integers.
#[derive(Debug, Clone, Copy, Default)]
pub struct Int32;

impl Serializer<i32> for Int32 {
    fn serialize(&self, value: &i32) -> Result<Vec<u8>, BoxError> {
        Ok(value.to_le_bytes().to_vec())
    }
}

impl Deserializer<i32> for Int32 {
    fn deserialize(&self, data: &[u8]) -> Result<i32, BoxError> {
        let bytes: [u8; 4] = data
            .try_into()
            .map_err(|_| format!("expected 4 bytes, got {}", data.len()))?;
        Ok(i32::from_le_bytes(bytes))
    }
}

/// 64-bit little-endian integers.
#[derive(Debug, Clone, Copy, Default)]
pub struct Int64;

impl Serializer<i64> for Int64 {
    fn serialize(&self, value: &i64) -> Result<Vec<u8>, BoxError> {
        Ok(value.to_le_bytes().to_vec())
    }
}

impl Deserializer<i64> for Int64 {
    fn deserialize(&self, data: &[u8]) -> Result<i64, BoxError> {
        let bytes: [u8; 8] = data
            .try_into()
            .map_err(|_| format!("expected 8 bytes, got {}", data.len()))?;
        Ok(i64::from_le_bytes(bytes))
    }
}

/// UTF-8 strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8;

impl Serializer<String> for Utf8 {
    fn serialize(&self, value: &String) -> Result<Vec<u8>, BoxError> {
        Ok(value.as_bytes().to_vec())
    }
}

impl Deserializer<String> for Utf8 {
    fn deserialize(&self, data: &[u8]) -> Result<String, BoxError> {
        Ok(String::from_utf8(data.to_vec())?)
    }
}

/// Payload bytes as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawBytes;

impl Serializer<Bytes> for RawBytes {
    fn serialize(&self, value: &Bytes) -> Result<Vec<u8>, BoxError> {
        Ok(value.to_vec())
    }
}

impl Deserializer<Bytes> for RawBytes {
    fn deserialize(&self, data: &[u8]) -> Result<Bytes, BoxError> {
        Ok(Bytes::copy_from_slice(data))
    }
}

impl Serializer<Vec<u8>> for RawBytes {
    fn serialize(&self, value: &Vec<u8>) -> Result<Vec<u8>, BoxError> {
        Ok(value.clone())
    }
}

impl Deserializer<Vec<u8>> for RawBytes {
    fn deserialize(&self, data: &[u8]) -> Result<Vec<u8>, BoxError> {
        Ok(data.to_vec())
    }
}

/// JSON via serde.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Order { id: u64 }
///
/// let writer = Writer::<Order>::builder_with_serializer(Json::new())
///     .topic("orders")
///     .connector(connector)
///     .build()?;
/// ```
pub struct Json<T>(PhantomData<fn() -> T>);

impl<T> Json<T> {
    pub fn new() -> Self {
        Json(PhantomData)
    }
}

impl<T> Default for Json<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Json<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T: Serialize + 'static> Serializer<T> for Json<T> {
    fn serialize(&self, value: &T) -> Result<Vec<u8>, BoxError> {
        Ok(serde_json::to_vec(value)?)
    }
}

impl<T: DeserializeOwned + 'static> Deserializer<T> for Json<T> {
    fn deserialize(&self, data: &[u8]) -> Result<T, BoxError> {
        Ok(serde_json::from_slice(data)?)
    }
}

macro_rules! builtin {
    ($ty:ty, $format:expr) => {
        impl Builtin for $ty {
            fn serializer() -> Arc<dyn Serializer<Self>> {
                Arc::new($format)
            }

            fn deserializer() -> Arc<dyn Deserializer<Self>> {
                Arc::new($format)
            }
        }
    };
}

builtin!(i32, Int32);
builtin!(i64, Int64);
builtin!(String, Utf8);
builtin!(Bytes, RawBytes);
builtin!(Vec<u8>, RawBytes);

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_integers_are_little_endian() {
        assert_eq!(Int32.serialize(&1).unwrap(), vec![1, 0, 0, 0]);
        assert_eq!(Int64.deserialize(&[2, 0, 0, 0, 0, 0, 0, 0]).unwrap(), 2);
        assert!(Int32.deserialize(&[1, 2]).is_err());
    }

    #[test]
    fn test_invalid_utf8_is_rejected() {
        assert!(Utf8.deserialize(&[0xc3, 0x28]).is_err());
        assert_eq!(Utf8.deserialize(b"ok").unwrap(), "ok");
    }

    #[test]
    fn test_builtin_string_round_trip() {
        let bytes = String::serializer().serialize(&"hello".to_string()).unwrap();
        assert_eq!(String::deserializer().deserialize(&bytes).unwrap(), "hello");
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: u64,
        item: String,
    }

    #[test]
    fn test_json_payloads() {
        let json = Json::<Order>::new();
        let bytes = json
            .serialize(&Order {
                id: 7,
                item: "book".to_string(),
            })
            .unwrap();
        assert_eq!(bytes, br#"{"id":7,"item":"book"}"#.to_vec());
        assert!(json.deserialize(b"{\"id\":").is_err());
    }
}

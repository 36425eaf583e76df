//! Typed view over the byte map.

use std::collections::BTreeMap;
use std::marker::PhantomData;

use super::ReplicatedMap;
use crate::Result;
use crate::codec::CodecError;

/// Conversion between a Rust value and the bytes stored in a slot.
///
/// Integers are fixed-width big-endian; strings and byte vectors use their
/// raw bytes, the slot recording their length.
pub trait BinaryCodec: Sized {
    fn encode(&self) -> Vec<u8>;
    fn decode(bytes: &[u8]) -> std::result::Result<Self, CodecError>;
}

macro_rules! impl_binary_codec_for_int {
    ($($ty:ty),*) => {
        $(
            impl BinaryCodec for $ty {
                fn encode(&self) -> Vec<u8> {
                    self.to_be_bytes().to_vec()
                }

                fn decode(bytes: &[u8]) -> std::result::Result<Self, CodecError> {
                    let array = bytes.try_into().map_err(|_| CodecError::InvalidValue {
                        type_name: stringify!($ty),
                        reason: format!(
                            "expected {} bytes, found {}",
                            std::mem::size_of::<$ty>(),
                            bytes.len()
                        ),
                    })?;
                    Ok(<$ty>::from_be_bytes(array))
                }
            }
        )*
    };
}

impl_binary_codec_for_int!(u8, u16, u32, u64, i8, i16, i32, i64);

impl BinaryCodec for String {
    fn encode(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    fn decode(bytes: &[u8]) -> std::result::Result<Self, CodecError> {
        String::from_utf8(bytes.to_vec()).map_err(|e| CodecError::InvalidValue {
            type_name: "String",
            reason: e.to_string(),
        })
    }
}

impl BinaryCodec for Vec<u8> {
    fn encode(&self) -> Vec<u8> {
        self.clone()
    }

    fn decode(bytes: &[u8]) -> std::result::Result<Self, CodecError> {
        Ok(bytes.to_vec())
    }
}

/// A [`ReplicatedMap`] seen through key and value codecs.
///
/// ```
/// # use meshmap::{MapConfig, ReplicatedMap, TypedMap};
/// # fn main() -> meshmap::Result<()> {
/// let map: TypedMap<i32, String> = TypedMap::new(ReplicatedMap::open_local(MapConfig::new(1))?);
/// map.put(&1, &"EXAMPLE-1".to_string())?;
/// assert_eq!(map.get(&1)?, Some("EXAMPLE-1".to_string()));
/// # Ok(())
/// # }
/// ```
pub struct TypedMap<K, V> {
    map: ReplicatedMap,
    _types: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Clone for TypedMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            map: self.map.clone(),
            _types: PhantomData,
        }
    }
}

impl<K: BinaryCodec, V: BinaryCodec> TypedMap<K, V> {
    pub fn new(map: ReplicatedMap) -> Self {
        Self {
            map,
            _types: PhantomData,
        }
    }

    /// The underlying byte map.
    pub fn inner(&self) -> &ReplicatedMap {
        &self.map
    }

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        match self.map.get(key.encode())? {
            Some(bytes) => Ok(Some(V::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        self.map.contains_key(key.encode())
    }

    pub fn put(&self, key: &K, value: &V) -> Result<()> {
        self.map.put(key.encode(), value.encode())
    }

    pub fn remove(&self, key: &K) -> Result<bool> {
        self.map.remove(key.encode())
    }

    pub fn len(&self) -> Result<usize> {
        self.map.len()
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.map.is_empty()
    }

    pub fn clear(&self) -> Result<usize> {
        self.map.clear()
    }

    /// Snapshot of live entries, decoded.
    pub fn entries(&self) -> Result<Vec<(K, V)>> {
        self.map
            .entries()?
            .into_iter()
            .map(|(k, v)| -> Result<(K, V)> { Ok((K::decode(&k)?, V::decode(&v)?)) })
            .collect()
    }

    /// Snapshot of live entries in key order.
    pub fn to_btree(&self) -> Result<BTreeMap<K, V>>
    where
        K: Ord,
    {
        Ok(self.entries()?.into_iter().collect())
    }
}

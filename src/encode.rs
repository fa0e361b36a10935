//! Value serialization ahead of fingerprinting.
//!
//! Encoders must be deterministic: the same value always yields the same bytes, otherwise
//! equal values get different fingerprints.

use crate::error::{DedupError, Result};
use serde::Serialize;
use serde::ser::{self, Error as _};

pub trait ValueEncoder: Send + Sync {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>>;
}

/// Canonical JSON: the value goes through `serde_json::Value` first, whose objects are
/// ordered maps, so `HashMap` iteration order never reaches the bytes.
///
/// NaN and infinities are rejected: JSON has no encoding for them and serde_json would
/// write `null`, making them collide with each other and with `None`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEncoder;

impl ValueEncoder for JsonEncoder {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        value
            .serialize(FiniteFloats)
            .map_err(|e| DedupError::Serialization(e.to_string()))?;
        let canonical =
            serde_json::to_value(value).map_err(|e| DedupError::Serialization(e.to_string()))?;
        serde_json::to_vec(&canonical).map_err(|e| DedupError::Serialization(e.to_string()))
    }
}

/// Walks a value and fails on the first non-finite float. Produces nothing.
struct FiniteFloats;

fn check_float(v: f64) -> std::result::Result<(), serde_json::Error> {
    if v.is_finite() {
        Ok(())
    } else {
        Err(serde_json::Error::custom(format!("non-finite float {v} has no JSON encoding")))
    }
}

type Check = std::result::Result<(), serde_json::Error>;

impl ser::Serializer for FiniteFloats {
    type Ok = ();
    type Error = serde_json::Error;
    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Self;
    type SerializeMap = Self;
    type SerializeStruct = Self;
    type SerializeStructVariant = Self;

    fn serialize_bool(self, _: bool) -> Check {
        Ok(())
    }
    fn serialize_i8(self, _: i8) -> Check {
        Ok(())
    }
    fn serialize_i16(self, _: i16) -> Check {
        Ok(())
    }
    fn serialize_i32(self, _: i32) -> Check {
        Ok(())
    }
    fn serialize_i64(self, _: i64) -> Check {
        Ok(())
    }
    fn serialize_i128(self, _: i128) -> Check {
        Ok(())
    }
    fn serialize_u8(self, _: u8) -> Check {
        Ok(())
    }
    fn serialize_u16(self, _: u16) -> Check {
        Ok(())
    }
    fn serialize_u32(self, _: u32) -> Check {
        Ok(())
    }
    fn serialize_u64(self, _: u64) -> Check {
        Ok(())
    }
    fn serialize_u128(self, _: u128) -> Check {
        Ok(())
    }
    fn serialize_f32(self, v: f32) -> Check {
        check_float(f64::from(v))
    }
    fn serialize_f64(self, v: f64) -> Check {
        check_float(v)
    }
    fn serialize_char(self, _: char) -> Check {
        Ok(())
    }
    fn serialize_str(self, _: &str) -> Check {
        Ok(())
    }
    fn serialize_bytes(self, _: &[u8]) -> Check {
        Ok(())
    }
    fn serialize_none(self) -> Check {
        Ok(())
    }
    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Check {
        value.serialize(self)
    }
    fn serialize_unit(self) -> Check {
        Ok(())
    }
    fn serialize_unit_struct(self, _: &'static str) -> Check {
        Ok(())
    }
    fn serialize_unit_variant(self, _: &'static str, _: u32, _: &'static str) -> Check {
        Ok(())
    }
    fn serialize_newtype_struct<T: Serialize + ?Sized>(self, _: &'static str, value: &T) -> Check {
        value.serialize(self)
    }
    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        value: &T,
    ) -> Check {
        value.serialize(self)
    }
    fn serialize_seq(self, _: Option<usize>) -> std::result::Result<Self, serde_json::Error> {
        Ok(self)
    }
    fn serialize_tuple(self, _: usize) -> std::result::Result<Self, serde_json::Error> {
        Ok(self)
    }
    fn serialize_tuple_struct(
        self,
        _: &'static str,
        _: usize,
    ) -> std::result::Result<Self, serde_json::Error> {
        Ok(self)
    }
    fn serialize_tuple_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> std::result::Result<Self, serde_json::Error> {
        Ok(self)
    }
    fn serialize_map(self, _: Option<usize>) -> std::result::Result<Self, serde_json::Error> {
        Ok(self)
    }
    fn serialize_struct(
        self,
        _: &'static str,
        _: usize,
    ) -> std::result::Result<Self, serde_json::Error> {
        Ok(self)
    }
    fn serialize_struct_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> std::result::Result<Self, serde_json::Error> {
        Ok(self)
    }
}

impl ser::SerializeSeq for FiniteFloats {
    type Ok = ();
    type Error = serde_json::Error;
    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Check {
        value.serialize(FiniteFloats)
    }
    fn end(self) -> Check {
        Ok(())
    }
}

impl ser::SerializeTuple for FiniteFloats {
    type Ok = ();
    type Error = serde_json::Error;
    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Check {
        value.serialize(FiniteFloats)
    }
    fn end(self) -> Check {
        Ok(())
    }
}

impl ser::SerializeTupleStruct for FiniteFloats {
    type Ok = ();
    type Error = serde_json::Error;
    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Check {
        value.serialize(FiniteFloats)
    }
    fn end(self) -> Check {
        Ok(())
    }
}

impl ser::SerializeTupleVariant for FiniteFloats {
    type Ok = ();
    type Error = serde_json::Error;
    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Check {
        value.serialize(FiniteFloats)
    }
    fn end(self) -> Check {
        Ok(())
    }
}

impl ser::SerializeMap for FiniteFloats {
    type Ok = ();
    type Error = serde_json::Error;
    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Check {
        key.serialize(FiniteFloats)
    }
    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Check {
        value.serialize(FiniteFloats)
    }
    fn end(self) -> Check {
        Ok(())
    }
}

impl ser::SerializeStruct for FiniteFloats {
    type Ok = ();
    type Error = serde_json::Error;
    fn serialize_field<T: Serialize + ?Sized>(&mut self, _: &'static str, value: &T) -> Check {
        value.serialize(FiniteFloats)
    }
    fn end(self) -> Check {
        Ok(())
    }
}

impl ser::SerializeStructVariant for FiniteFloats {
    type Ok = ();
    type Error = serde_json::Error;
    fn serialize_field<T: Serialize + ?Sized>(&mut self, _: &'static str, value: &T) -> Check {
        value.serialize(FiniteFloats)
    }
    fn end(self) -> Check {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashMap};

    #[test]
    fn strings_encode_as_json() {
        assert_eq!(JsonEncoder.encode("Nairobi").unwrap(), b"\"Nairobi\"");
    }

    #[test]
    fn type_is_preserved() {
        let n = JsonEncoder.encode(&42u32).unwrap();
        let s = JsonEncoder.encode("42").unwrap();
        assert_ne!(n, s);
    }

    #[test]
    fn map_order_does_not_change_bytes() {
        let mut a = HashMap::new();
        let mut b = HashMap::new();
        for i in 0..32 {
            a.insert(format!("k{i}"), i);
        }
        for i in (0..32).rev() {
            b.insert(format!("k{i}"), i);
        }
        assert_eq!(JsonEncoder.encode(&a).unwrap(), JsonEncoder.encode(&b).unwrap());
    }

    #[test]
    fn non_string_map_keys_are_rejected() {
        let mut m = BTreeMap::new();
        m.insert(vec![1u8, 2], "x");
        let err = JsonEncoder.encode(&m).unwrap_err();
        assert_eq!(err.kind(), "serialization");
    }

    #[test]
    fn non_finite_floats_are_rejected() {
        for v in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            assert_eq!(JsonEncoder.encode(&v).unwrap_err().kind(), "serialization");
        }
        assert_eq!(
            JsonEncoder.encode(&vec![1.0f32, f32::NAN]).unwrap_err().kind(),
            "serialization"
        );
        let mut m = HashMap::new();
        m.insert("score", Some(f64::INFINITY));
        assert!(JsonEncoder.encode(&m).is_err());
    }

    #[test]
    fn finite_floats_still_encode() {
        assert_eq!(JsonEncoder.encode(&1.5f64).unwrap(), b"1.5");
        assert_ne!(
            JsonEncoder.encode(&0.0f64).unwrap(),
            JsonEncoder.encode(&None::<f64>).unwrap()
        );
    }
}

//! Key-value metadata attached to a stored table.
//!
//! Every engine persists metadata as the same JSON document produced by
//! [`encode`]; only where that string lives differs (a catalog field, a
//! marker-array attribute, a Parquet footer entry). Values are modelled by
//! [`MetaValue`] so that booleans, integers, and floats survive a round trip
//! with their original types: `true` never comes back as `1`, and `1.0`
//! never comes back as `1`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

/// A metadata map: string keys to scalar or simple composite values.
pub type Metadata = BTreeMap<String, MetaValue>;

/// One metadata value.
///
/// Untagged on the wire, so the stored JSON is what a human would write:
/// `{"source": "HITEMP", "rows": 1200, "version": 1.5, "merged": true}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    /// JSON `null`.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer value.
    Int(i64),
    /// Finite floating-point value.
    Float(f64),
    /// UTF-8 string value.
    Str(String),
    /// Ordered list of values.
    List(Vec<MetaValue>),
    /// Nested string-keyed map.
    Map(BTreeMap<String, MetaValue>),
}

/// Errors from encoding or decoding metadata.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum MetadataError {
    /// A value cannot be represented without loss.
    #[snafu(display("Unsupported metadata value for key {key:?}: {reason}"))]
    UnsupportedMetadataType {
        /// Top-level key holding the offending value.
        key: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// The stored metadata string is not a valid metadata document.
    #[snafu(display("Stored metadata is not valid JSON: {source}"))]
    Decode {
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    /// Serializing metadata failed.
    #[snafu(display("Failed to serialize metadata: {source}"))]
    Encode {
        /// Underlying JSON error.
        source: serde_json::Error,
    },
}

impl MetaValue {
    /// Returns the boolean if this is a `Bool`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MetaValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the integer if this is an `Int`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetaValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns a float for `Float` and `Int` values.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetaValue::Float(f) => Some(*f),
            MetaValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Returns the string slice if this is a `Str`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Str(s) => Some(s),
            _ => None,
        }
    }

    fn check(&self, key: &str) -> Result<(), MetadataError> {
        match self {
            MetaValue::Float(f) if !f.is_finite() => UnsupportedMetadataTypeSnafu {
                key,
                reason: format!("non-finite float {f} has no JSON representation"),
            }
            .fail(),
            MetaValue::List(items) => items.iter().try_for_each(|v| v.check(key)),
            MetaValue::Map(map) => map.values().try_for_each(|v| v.check(key)),
            _ => Ok(()),
        }
    }
}

macro_rules! meta_from_int {
    ($($t:ty),*) => {$(
        impl From<$t> for MetaValue {
            fn from(v: $t) -> Self {
                MetaValue::Int(i64::from(v))
            }
        }
    )*};
}

meta_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<bool> for MetaValue {
    fn from(v: bool) -> Self {
        MetaValue::Bool(v)
    }
}

impl From<f32> for MetaValue {
    fn from(v: f32) -> Self {
        MetaValue::Float(f64::from(v))
    }
}

impl From<f64> for MetaValue {
    fn from(v: f64) -> Self {
        MetaValue::Float(v)
    }
}

impl From<&str> for MetaValue {
    fn from(v: &str) -> Self {
        MetaValue::Str(v.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(v: String) -> Self {
        MetaValue::Str(v)
    }
}

impl<T: Into<MetaValue>> From<Vec<T>> for MetaValue {
    fn from(v: Vec<T>) -> Self {
        MetaValue::List(v.into_iter().map(Into::into).collect())
    }
}

/// Build a [`Metadata`] map from `(key, value)` pairs.
pub fn metadata_from<K, V, I>(pairs: I) -> Metadata
where
    K: Into<String>,
    V: Into<MetaValue>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Convert any serializable struct or map into [`Metadata`].
///
/// Fails with `UnsupportedMetadataType` when the value does not serialize
/// to a JSON object, or when a number does not fit `i64`/`f64` exactly.
pub fn to_metadata<T: Serialize>(value: &T) -> Result<Metadata, MetadataError> {
    let json = serde_json::to_value(value).map_err(|e| MetadataError::UnsupportedMetadataType {
        key: "<root>".to_string(),
        reason: e.to_string(),
    })?;

    let serde_json::Value::Object(map) = json else {
        return UnsupportedMetadataTypeSnafu {
            key: "<root>",
            reason: "metadata must serialize to a JSON object",
        }
        .fail();
    };

    map.into_iter()
        .map(|(k, v)| {
            let converted = from_json(&k, v)?;
            Ok((k, converted))
        })
        .collect()
}

fn from_json(key: &str, value: serde_json::Value) -> Result<MetaValue, MetadataError> {
    use serde_json::Value;

    Ok(match value {
        Value::Null => MetaValue::Null,
        Value::Bool(b) => MetaValue::Bool(b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                MetaValue::Int(i)
            } else if n.is_f64() {
                MetaValue::Float(n.as_f64().unwrap_or(f64::NAN))
            } else {
                return UnsupportedMetadataTypeSnafu {
                    key,
                    reason: format!("integer {n} does not fit in i64"),
                }
                .fail();
            }
        }
        Value::String(s) => MetaValue::Str(s),
        Value::Array(items) => MetaValue::List(
            items
                .into_iter()
                .map(|v| from_json(key, v))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => MetaValue::Map(
            map.into_iter()
                .map(|(k, v)| Ok((k, from_json(key, v)?)))
                .collect::<Result<_, MetadataError>>()?,
        ),
    })
}

/// Check that every value of `metadata` survives a JSON round trip.
pub(crate) fn validate(metadata: &Metadata) -> Result<(), MetadataError> {
    metadata.iter().try_for_each(|(key, value)| value.check(key))
}

/// Serialize `metadata` to the JSON string stored by every engine.
pub fn encode(metadata: &Metadata) -> Result<String, MetadataError> {
    validate(metadata)?;
    serde_json::to_string(metadata).context(EncodeSnafu)
}

/// Parse a JSON string produced by [`encode`].
pub fn decode(raw: &str) -> Result<Metadata, MetadataError> {
    serde_json::from_str(raw).context(DecodeSnafu)
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn sample() -> Metadata {
        metadata_from([
            ("source", MetaValue::from("HITEMP")),
            ("rows", MetaValue::from(1200_i64)),
            ("version", MetaValue::from(1.0_f64)),
            ("merged", MetaValue::from(true)),
            ("isotopes", MetaValue::from(vec![1_i64, 2, 3])),
        ])
    }

    #[test]
    fn round_trip_preserves_value_types() -> TestResult {
        let meta = sample();
        let back = decode(&encode(&meta)?)?;
        assert_eq!(back, meta);
        assert_eq!(back["merged"], MetaValue::Bool(true));
        assert_eq!(back["version"], MetaValue::Float(1.0));
        assert_eq!(back["rows"], MetaValue::Int(1200));
        Ok(())
    }

    #[test]
    fn booleans_do_not_become_integers() -> TestResult {
        let meta = metadata_from([("flag", false)]);
        let raw = encode(&meta)?;
        assert_eq!(raw, r#"{"flag":false}"#);
        assert_eq!(decode(&raw)?["flag"].as_bool(), Some(false));
        Ok(())
    }

    #[test]
    fn non_finite_floats_are_rejected() {
        let meta = metadata_from([("bad", f64::NAN)]);
        let err = encode(&meta).expect_err("NaN has no JSON form");
        assert!(matches!(
            err,
            MetadataError::UnsupportedMetadataType { ref key, .. } if key == "bad"
        ));

        let nested = metadata_from([("list", vec![1.0, f64::INFINITY])]);
        assert!(encode(&nested).is_err());
    }

    #[test]
    fn to_metadata_accepts_serializable_structs() -> TestResult {
        #[derive(Serialize)]
        struct Provenance {
            source: &'static str,
            wmin: f64,
            parsed: bool,
        }

        let meta = to_metadata(&Provenance {
            source: "HITRAN",
            wmin: 2000.5,
            parsed: true,
        })?;
        assert_eq!(meta["source"].as_str(), Some("HITRAN"));
        assert_eq!(meta["wmin"].as_f64(), Some(2000.5));
        assert_eq!(meta["parsed"].as_bool(), Some(true));
        Ok(())
    }

    #[test]
    fn to_metadata_rejects_non_objects_and_huge_integers() {
        assert!(to_metadata(&vec![1, 2]).is_err());
        let huge = std::collections::BTreeMap::from([("n", u64::MAX)]);
        assert!(matches!(
            to_metadata(&huge),
            Err(MetadataError::UnsupportedMetadataType { .. })
        ));
    }

    #[test]
    fn decode_reports_invalid_json() {
        assert!(matches!(decode("{not json"), Err(MetadataError::Decode { .. })));
    }
}

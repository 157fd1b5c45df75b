//! Serde helpers for `f64` values that may be NaN or infinite.
//!
//! JSON has no spelling for non-finite numbers and `serde_json` writes them
//! as `null`, which cannot be read back as `f64`. Finite values stay plain
//! numbers; the others are written as `"NaN"`, `"inf"` or `"-inf"`.

use std::collections::BTreeMap;

use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};

/// An `f64` that survives a JSON round trip whatever its value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Float(pub f64);

#[derive(Serialize)]
#[serde(untagged)]
enum Repr<'a> {
    Number(f64),
    Text(&'a str),
}

impl Serialize for Float {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let repr = match self.0 {
            v if v.is_finite() => Repr::Number(v),
            v if v.is_nan() => Repr::Text("NaN"),
            v if v > 0.0 => Repr::Text("inf"),
            _ => Repr::Text("-inf"),
        };
        repr.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Float {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Owned {
            Number(f64),
            Text(String),
        }

        match Owned::deserialize(deserializer)? {
            Owned::Number(v) => Ok(Float(v)),
            Owned::Text(text) => match text.as_str() {
                "NaN" => Ok(Float(f64::NAN)),
                "inf" => Ok(Float(f64::INFINITY)),
                "-inf" => Ok(Float(f64::NEG_INFINITY)),
                other => Err(D::Error::custom(format!("`{other}` is not a float"))),
            },
        }
    }
}

/// `#[serde(with = "float::option")]` for `Option<f64>`.
pub mod option {
    use super::*;

    pub fn serialize<S: Serializer>(
        value: &Option<f64>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        value.map(Float).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<f64>, D::Error> {
        Ok(Option::<Float>::deserialize(deserializer)?.map(|f| f.0))
    }
}

/// `#[serde(with = "float::series_map")]` for named series of values.
pub mod series_map {
    use super::*;

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<String, Vec<f64>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_map(map.iter().map(|(name, values)| {
            let values: Vec<Float> = values.iter().copied().map(Float).collect();
            (name, values)
        }))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, Vec<f64>>, D::Error> {
        let raw = BTreeMap::<String, Vec<Float>>::deserialize(deserializer)?;
        Ok(raw
            .into_iter()
            .map(|(name, values)| (name, values.into_iter().map(|f| f.0).collect()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn non_finite_values_are_spelled_out() {
        let values = vec![
            Float(1.5),
            Float(f64::NAN),
            Float(f64::INFINITY),
            Float(f64::NEG_INFINITY),
        ];
        let encoded = serde_json::to_value(&values).unwrap();
        assert_eq!(encoded, json!([1.5, "NaN", "inf", "-inf"]));

        let decoded: Vec<Float> = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded[0], Float(1.5));
        assert!(decoded[1].0.is_nan());
        assert_eq!(decoded[2], Float(f64::INFINITY));
        assert_eq!(decoded[3], Float(f64::NEG_INFINITY));
    }

    #[test]
    fn unknown_text_is_rejected() {
        assert!(serde_json::from_value::<Float>(json!("lots")).is_err());
        assert!(serde_json::from_value::<Float>(json!(null)).is_err());
    }
}

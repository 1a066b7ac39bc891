//! gRPC metadata carried inside tunnel frames.
//!
//! Metadata travels as `map<string, Values>`. Only ASCII entries are
//! carried; binary (`-bin`) entries and values that are not visible ASCII
//! are dropped in both directions.

use std::collections::HashMap;

use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue, KeyAndValueRef, MetadataMap};

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Values {
    #[prost(string, repeated, tag = "1")]
    pub value: Vec<String>,
}

pub fn meta_to_values_map(meta: &MetadataMap) -> HashMap<String, Values> {
    let mut result: HashMap<String, Values> = HashMap::with_capacity(meta.keys_len());
    for entry in meta.iter() {
        let KeyAndValueRef::Ascii(key, value) = entry else {
            continue;
        };
        let Ok(value) = value.to_str() else {
            continue;
        };
        result
            .entry(key.as_str().to_owned())
            .or_default()
            .value
            .push(value.to_owned());
    }
    result
}

pub fn values_map_to_meta(values: &HashMap<String, Values>) -> MetadataMap {
    let mut result = MetadataMap::with_capacity(values.len());
    for (key, vals) in values {
        if key.ends_with("-bin") {
            continue;
        }
        let Ok(key) = AsciiMetadataKey::from_bytes(key.as_bytes()) else {
            continue;
        };
        for val in &vals.value {
            if let Ok(val) = AsciiMetadataValue::try_from(val.as_str()) {
                result.append(key.clone(), val);
            }
        }
    }
    result
}

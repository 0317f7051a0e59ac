//! The subset of the `tf.train.Example` protobuf message used by the slice records.

use crate::error::{Error, Result};
use crate::protos::example::Example as ExampleProto;
use crate::protos::feature::{
    BytesList, Feature as FeatureProto, Features, FloatList, Int64List, feature::Kind,
};
use protobuf::{Message, MessageField};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub enum Feature {
    Bytes(Vec<Vec<u8>>),
    Float(Vec<f32>),
    Int64(Vec<i64>),
}

impl Feature {
    pub fn kind(&self) -> &'static str {
        match self {
            Feature::Bytes(_) => "bytes",
            Feature::Float(_) => "float",
            Feature::Int64(_) => "int64",
        }
    }

    fn from_proto(name: &str, proto: FeatureProto) -> Result<Self> {
        match proto.kind {
            Some(Kind::BytesList(list)) => Ok(Feature::Bytes(list.value)),
            Some(Kind::FloatList(list)) => Ok(Feature::Float(list.value)),
            Some(Kind::Int64List(list)) => Ok(Feature::Int64(list.value)),
            None => Err(Error::EmptyFeature(name.to_owned())),
        }
    }

    fn to_proto(&self) -> FeatureProto {
        let kind = match self {
            Feature::Bytes(values) => {
                let mut list = BytesList::new();
                list.value = values.clone();
                Kind::BytesList(list)
            }
            Feature::Float(values) => {
                let mut list = FloatList::new();
                list.value = values.clone();
                Kind::FloatList(list)
            }
            Feature::Int64(values) => {
                let mut list = Int64List::new();
                list.value = values.clone();
                Kind::Int64List(list)
            }
        };
        let mut proto = FeatureProto::new();
        proto.kind = Some(kind);
        proto
    }
}

/// A named collection of features.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Example {
    pub features: BTreeMap<String, Feature>,
}

impl Example {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_feature(mut self, name: impl Into<String>, feature: Feature) -> Self {
        self.features.insert(name.into(), feature);
        self
    }

    pub fn feature(&self, name: &str) -> Result<&Feature> {
        self.features
            .get(name)
            .ok_or_else(|| Error::MissingFeature(name.to_owned()))
    }

    /// The first byte string of a bytes feature.
    pub fn bytes(&self, name: &str) -> Result<&[u8]> {
        match self.feature(name)? {
            Feature::Bytes(values) => values
                .first()
                .map(Vec::as_slice)
                .ok_or_else(|| Error::MissingFeature(name.to_owned())),
            other => Err(kind_error(name, other, "bytes")),
        }
    }

    pub fn floats(&self, name: &str) -> Result<&[f32]> {
        match self.feature(name)? {
            Feature::Float(values) => Ok(values),
            other => Err(kind_error(name, other, "float")),
        }
    }

    pub fn int64s(&self, name: &str) -> Result<&[i64]> {
        match self.feature(name)? {
            Feature::Int64(values) => Ok(values),
            other => Err(kind_error(name, other, "int64")),
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let proto = ExampleProto::parse_from_bytes(buf)?;
        let features = proto
            .features
            .into_option()
            .map(|features| features.feature)
            .unwrap_or_default()
            .into_iter()
            .map(|(name, feature)| {
                let feature = Feature::from_proto(&name, feature)?;
                Ok((name, feature))
            })
            .collect::<Result<_>>()?;
        Ok(Example { features })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut features = Features::new();
        features.feature = self
            .features
            .iter()
            .map(|(name, feature)| (name.clone(), feature.to_proto()))
            .collect();
        let mut proto = ExampleProto::new();
        proto.features = MessageField::some(features);
        Ok(proto.write_to_bytes()?)
    }
}

fn kind_error(name: &str, found: &Feature, expected: &'static str) -> Error {
    Error::FeatureKind {
        name: name.to_owned(),
        found: found.kind(),
        expected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Example {
        Example::new()
            .with_feature("img_raw", Feature::Bytes(vec![vec![1, 2, 3, 0xff]]))
            .with_feature("weights", Feature::Float(vec![0.5, -1.25]))
            .with_feature("ids", Feature::Int64(vec![0, 300, -1]))
    }

    /// Length-delimited field with a one byte key and length.
    fn len_field(number: u8, bytes: &[u8]) -> Vec<u8> {
        [&[(number << 3) | 2, bytes.len() as u8][..], bytes].concat()
    }

    /// Wraps one serialized `Feature` as the only entry of an `Example`.
    fn single_feature_example(name: &str, feature: &[u8], entry_suffix: &[u8]) -> Vec<u8> {
        let entry = [
            len_field(1, name.as_bytes()),
            len_field(2, feature),
            entry_suffix.to_vec(),
        ]
        .concat();
        len_field(1, &len_field(1, &entry))
    }

    #[test]
    fn decodes_what_it_encodes() {
        let example = sample();
        let decoded = Example::decode(&example.encode().unwrap()).unwrap();
        assert_eq!(decoded, example);
        assert_eq!(decoded.bytes("img_raw").unwrap(), &[1, 2, 3, 0xff]);
        assert_eq!(decoded.floats("weights").unwrap(), &[0.5, -1.25]);
        assert_eq!(decoded.int64s("ids").unwrap(), &[0, 300, -1]);
    }

    #[test]
    fn hand_encoded_bytes_feature() {
        // Example { features { feature { key: "a" value { bytes_list { value: "xy" } } } } }
        let feature = len_field(1, &len_field(1, b"xy"));
        let decoded = Example::decode(&single_feature_example("a", &feature, &[])).unwrap();
        assert_eq!(decoded.bytes("a").unwrap(), b"xy");
    }

    #[test]
    fn unpacked_scalars_and_unknown_fields() {
        // Int64List with two unpacked values
        let int64_list = [0x08, 0x07, 0x08, 0x96, 0x01];
        // an unknown varint field inside the map entry
        let example = single_feature_example("i", &len_field(3, &int64_list), &[0x18, 0x2a]);
        assert_eq!(Example::decode(&example).unwrap().int64s("i").unwrap(), &[7, 150]);

        // FloatList with one unpacked fixed32
        let float_list = [&[0x0d][..], &2.5f32.to_le_bytes()].concat();
        let example = single_feature_example("f", &len_field(2, &float_list), &[]);
        assert_eq!(Example::decode(&example).unwrap().floats("f").unwrap(), &[2.5]);
    }

    #[test]
    fn accessor_errors() {
        let example = sample();
        assert!(matches!(
            example.bytes("label_raw"),
            Err(Error::MissingFeature(name)) if name == "label_raw"
        ));
        assert!(matches!(
            example.bytes("ids"),
            Err(Error::FeatureKind { found: "int64", expected: "bytes", .. })
        ));

        // a feature without any value list
        let example = single_feature_example("none", &[], &[]);
        assert!(matches!(
            Example::decode(&example),
            Err(Error::EmptyFeature(name)) if name == "none"
        ));
    }

    #[test]
    fn malformed_input() {
        // length prefix past the end of the buffer
        assert!(matches!(Example::decode(&[0x0a, 0x05, 0x00]), Err(Error::Proto(_))));
        // unterminated varint
        assert!(matches!(Example::decode(&[0x08, 0x80]), Err(Error::Proto(_))));
    }

    #[test]
    fn empty_message_has_no_features() {
        assert!(Example::decode(&[]).unwrap().features.is_empty());
    }
}

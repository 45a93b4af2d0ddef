use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    Decode, DecodeError,
    encode::{EncodeError, Param},
    postgres::{Oid, OidType, PgType},
    row::Field,
    value::Value,
};

/// `jsonb` binary format version.
pub(crate) const JSONB_VERSION: u8 = 1;

/// Decode and Encode postgres json value.
///
/// Decoding accepts both `json` and `jsonb` columns, encoding produces `jsonb`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Json<T>(pub T);

impl<T: Serialize> Json<T> {
    /// Encode as binary `jsonb` parameter.
    ///
    /// Fails when the [`Serialize`] implementation fails.
    pub fn to_param(&self) -> Result<Param, EncodeError> {
        let mut buf = vec![JSONB_VERSION];
        serde_json::to_writer(&mut buf, &self.0).map_err(|e| EncodeError::new(e.to_string()))?;
        Ok(Param::binary(Self::OID, buf))
    }
}

impl<T> PgType for Json<T> {
    const OID: Oid = OidType::Jsonb.oid();
}

impl<T: DeserializeOwned> Decode<'_> for Json<T> {
    fn decode(field: Field<'_>) -> Result<Self, DecodeError> {
        match field.value()? {
            Value::Json(text) => Ok(Json(serde_json::from_str(&text)?)),
            Value::Null => Err(DecodeError::Null),
            _ => Err(DecodeError::mismatch::<Self>(field.oid())),
        }
    }
}

impl<T: Serialize> Serialize for Json<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Json<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(Self(T::deserialize(deserializer)?))
    }
}

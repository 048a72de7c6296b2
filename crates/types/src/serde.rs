use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serializer};
use url::Url;

/// Option<Url> helper. Empty strings read as `None` so blank config columns stay harmless.
pub mod serde_url_opt {
    use super::*;
    pub fn serialize<S: Serializer>(v: &Option<Url>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(u) => s.serialize_some(u.as_str()),
            None => s.serialize_none(),
        }
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Url>, D::Error> {
        let opt = Option::<String>::deserialize(d)?;
        match opt {
            Some(s) if !s.trim().is_empty() => Ok(Some(Url::parse(&s).map_err(D::Error::custom)?)),
            _ => Ok(None),
        }
    }
}

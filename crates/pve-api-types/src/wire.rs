// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Serde helpers for the management API's loosely typed scalars.
//!
//! Booleans travel as `0`/`1`, and numbers are sometimes rendered as strings
//! depending on the server version.

use serde::{de, Deserialize, Deserializer, Serializer};

#[derive(Deserialize)]
#[serde(untagged)]
enum Loose {
    Bool(bool),
    Int(u64),
    Str(String),
}

pub(crate) mod opt_bool {
    use super::*;

    pub fn serialize<S>(
        v: &Option<bool>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match v {
            Some(b) => serializer.serialize_u8(u8::from(*b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'d, D>(deserializer: D) -> Result<Option<bool>, D::Error>
    where
        D: Deserializer<'d>,
    {
        let v = match Option::<Loose>::deserialize(deserializer)? {
            None => return Ok(None),
            Some(v) => v,
        };
        match v {
            Loose::Bool(b) => Ok(Some(b)),
            Loose::Int(0) => Ok(Some(false)),
            Loose::Int(1) => Ok(Some(true)),
            Loose::Str(s) if s == "0" => Ok(Some(false)),
            Loose::Str(s) if s == "1" => Ok(Some(true)),
            Loose::Int(i) => Err(de::Error::custom(format!(
                "expected boolean flag, found {}",
                i
            ))),
            Loose::Str(s) => Err(de::Error::custom(format!(
                "expected boolean flag, found {:?}",
                s
            ))),
        }
    }
}

pub(crate) mod opt_number {
    use super::*;
    use serde::Serialize;
    use std::convert::TryFrom;
    use std::str::FromStr;

    pub fn serialize<T, S>(
        v: &Option<T>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        T: Serialize,
        S: Serializer,
    {
        match v {
            Some(n) => n.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'d, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
    where
        T: TryFrom<u64> + FromStr,
        D: Deserializer<'d>,
    {
        let v = match Option::<Loose>::deserialize(deserializer)? {
            None => return Ok(None),
            Some(v) => v,
        };
        match v {
            Loose::Int(i) => T::try_from(i)
                .map(Some)
                .map_err(|_| de::Error::custom(format!("{} out of range", i))),
            Loose::Str(s) => s
                .parse()
                .map(Some)
                .map_err(|_| {
                    de::Error::custom(format!("invalid number {:?}", s))
                }),
            Loose::Bool(b) => {
                Err(de::Error::custom(format!("expected number, found {}", b)))
            }
        }
    }
}

/// Serializes a list of option names as the comma-separated string the
/// `delete` parameter expects.
pub(crate) fn comma_list<S>(
    v: &[String],
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&v.join(","))
}

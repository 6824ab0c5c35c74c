use chrono::DateTime;
use serde::{Deserialize, Deserializer, de::Error};
use std::{fmt::Display, str::FromStr};

/// Deserialize a `String` as the desired type.
pub fn de_str<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    let data: &str = Deserialize::deserialize(deserializer)?;
    data.parse::<T>().map_err(Error::custom)
}

/// Deserialize an `f64` that some venues encode as a JSON number and others as a string.
pub fn de_flexible_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flexible {
        Number(f64),
        Str(String),
    }

    match Flexible::deserialize(deserializer)? {
        Flexible::Number(value) => Ok(value),
        Flexible::Str(value) => value.parse::<f64>().map_err(Error::custom),
    }
}

/// Deserialize an RFC3339 timestamp `String` as epoch milliseconds.
pub fn de_rfc3339_as_epoch_ms<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let data: &str = Deserialize::deserialize(deserializer)?;
    DateTime::parse_from_rfc3339(data)
        .map(|time| time.timestamp_millis())
        .map_err(Error::custom)
}

/// Deserialize a `String` of epoch seconds as epoch milliseconds.
pub fn de_str_epoch_s_as_ms<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    de_str::<D, i64>(deserializer).map(|seconds| seconds * 1000)
}

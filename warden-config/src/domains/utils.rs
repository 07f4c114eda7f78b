//! Serde helpers shared by the configuration domains

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

/// Whole seconds are written as integers, anything finer as a float
fn write_seconds<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    if duration.subsec_nanos() == 0 {
        serializer.serialize_u64(duration.as_secs())
    } else {
        serializer.serialize_f64(duration.as_secs_f64())
    }
}

fn read_seconds<E: serde::de::Error>(seconds: f64) -> Result<Duration, E> {
    Duration::try_from_secs_f64(seconds)
        .map_err(|_| E::custom(format!("invalid duration: {} seconds", seconds)))
}

/// Duration as a number of seconds
pub mod serde_duration {
    use super::*;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        write_seconds(duration, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        read_seconds(f64::deserialize(deserializer)?)
    }
}

/// Optional duration as a number of seconds; absent means unbounded
pub mod serde_duration_option {
    use super::*;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => write_seconds(d, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<f64>::deserialize(deserializer)?
            .map(read_seconds)
            .transpose()
    }
}

pub fn default_false() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Timeouts {
        #[serde(with = "serde_duration")]
        ready: Duration,
        #[serde(with = "serde_duration_option", default)]
        call: Option<Duration>,
    }

    #[test]
    fn test_seconds_keep_sub_second_precision() {
        let timeouts = Timeouts {
            ready: Duration::from_secs(10),
            call: Some(Duration::from_millis(250)),
        };
        let encoded = serde_json::to_string(&timeouts).unwrap();
        assert_eq!(encoded, r#"{"ready":10,"call":0.25}"#);
        assert_eq!(serde_json::from_str::<Timeouts>(&encoded).unwrap(), timeouts);
    }

    #[test]
    fn test_negative_seconds_are_rejected() {
        assert!(serde_json::from_str::<Timeouts>(r#"{"ready":-1}"#).is_err());
        let parsed: Timeouts = serde_yaml::from_str("ready: 3\n").unwrap();
        assert_eq!(parsed.call, None);
    }
}

//! Serde adapters shared by result types.

/// `Duration` as whole milliseconds, for `#[serde(with = "...")]`.
pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Timed {
        #[serde(with = "super::duration_millis")]
        elapsed: Duration,
    }

    #[test]
    fn writes_whole_milliseconds() {
        let json = serde_json::to_string(&Timed {
            elapsed: Duration::from_micros(1_500_900),
        })
        .unwrap();
        assert_eq!(json, r#"{"elapsed":1500}"#);
        let back: Timed = serde_json::from_str(&json).unwrap();
        assert_eq!(back.elapsed, Duration::from_millis(1500));
    }

    #[test]
    fn huge_durations_saturate() {
        let json = serde_json::to_string(&Timed {
            elapsed: Duration::MAX,
        })
        .unwrap();
        assert_eq!(json, format!(r#"{{"elapsed":{}}}"#, u64::MAX));
    }
}

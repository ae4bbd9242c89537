use serde::Serialize;
use std::collections::BTreeMap;

/// Flat key -> value statistics map handed to telemetry collectors.
pub type StatsMap = BTreeMap<String, serde_json::Value>;

/// Flatten a statistics struct into `prefix.field` entries.
///
/// Nested objects are flattened with dotted keys so the result is always a
/// single-level map with stable names.
pub fn flatten<T: Serialize>(prefix: &str, stats: &T) -> StatsMap {
    let mut map = StatsMap::new();
    match serde_json::to_value(stats) {
        Ok(value) => insert_flat(&mut map, prefix, value),
        Err(e) => {
            tracing::warn!(prefix, error = %e, "Failed to serialize statistics snapshot");
        }
    }
    map
}

fn insert_flat(map: &mut StatsMap, prefix: &str, value: serde_json::Value) {
    match value {
        serde_json::Value::Object(fields) => {
            for (key, inner) in fields {
                let name = if prefix.is_empty() {
                    key
                } else {
                    format!("{prefix}.{key}")
                };
                insert_flat(map, &name, inner);
            }
        }
        other => {
            map.insert(prefix.to_string(), other);
        }
    }
}

/// Ratio helper that reports 0 instead of NaN for an empty denominator.
pub(crate) fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Inner {
        depth: u32,
    }

    #[derive(Serialize)]
    struct Outer {
        count: u64,
        rate: f64,
        queue: Inner,
    }

    #[test]
    fn test_flatten_nested() {
        let map = flatten(
            "scheduler",
            &Outer {
                count: 3,
                rate: 0.5,
                queue: Inner { depth: 7 },
            },
        );
        assert_eq!(map["scheduler.count"], serde_json::json!(3));
        assert_eq!(map["scheduler.rate"], serde_json::json!(0.5));
        assert_eq!(map["scheduler.queue.depth"], serde_json::json!(7));
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn test_flatten_without_prefix() {
        let map = flatten("", &Inner { depth: 1 });
        assert_eq!(map["depth"], serde_json::json!(1));
    }

    #[test]
    fn test_ratio() {
        assert_eq!(ratio(0, 0), 0.0);
        assert_eq!(ratio(1, 4), 0.25);
    }
}

//! Conversion of MySQL values into the JSON values written to the sink.
//!
//! Snapshot rows arrive over the text protocol, so most values are byte
//! strings that have to be parsed according to the target column type.
//! Binlog rows arrive as typed values. Both go through [`to_json`].

use crate::schema::TargetType;
use mysql_async::Value as MySqlValue;
use serde_json::{Number, Value};

/// Converts one column value for a column of type `target`.
pub fn to_json(value: MySqlValue, target: &TargetType) -> Value {
    match value {
        MySqlValue::NULL => Value::Null,
        MySqlValue::Int(n) => from_i64(n, target),
        MySqlValue::UInt(n) => from_u64(n, target),
        MySqlValue::Float(f) => from_f64(f64::from(f), target),
        MySqlValue::Double(d) => from_f64(d, target),
        MySqlValue::Bytes(bytes) => from_bytes(&bytes, target),
        MySqlValue::Date(year, month, day, hour, minute, second, micros) => {
            if *target == TargetType::Date {
                Value::String(format!("{:04}-{:02}-{:02}", year, month, day))
            } else {
                let mut text = format!(
                    "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                    year, month, day, hour, minute, second
                );
                if micros > 0 {
                    text.push_str(&format!(".{:06}", micros));
                }
                Value::String(text)
            }
        }
        MySqlValue::Time(negative, days, hours, minutes, seconds, micros) => {
            let mut text = format!(
                "{}{:02}:{:02}:{:02}",
                if negative { "-" } else { "" },
                u64::from(days) * 24 + u64::from(hours),
                minutes,
                seconds
            );
            if micros > 0 {
                text.push_str(&format!(".{:06}", micros));
            }
            Value::String(text)
        }
    }
}

fn from_i64(n: i64, target: &TargetType) -> Value {
    match target {
        TargetType::Bool => Value::Bool(n != 0),
        TargetType::UInt64 | TargetType::UInt16 | TargetType::UInt8 => Value::from(n as u64),
        t if t.is_float() => Value::from(n as f64),
        TargetType::Decimal { .. } | TargetType::String => Value::String(n.to_string()),
        _ => Value::from(n),
    }
}

fn from_u64(n: u64, target: &TargetType) -> Value {
    match target {
        TargetType::Bool => Value::Bool(n != 0),
        TargetType::UInt64 | TargetType::UInt16 | TargetType::UInt8 => Value::from(n),
        t if t.is_float() => Value::from(n as f64),
        TargetType::Decimal { .. } | TargetType::String => Value::String(n.to_string()),
        // Signed targets: values above the signed range wrap.
        _ => Value::from(n as i64),
    }
}

fn from_f64(f: f64, target: &TargetType) -> Value {
    match target {
        TargetType::Decimal { .. } | TargetType::String => Value::String(f.to_string()),
        _ => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
    }
}

fn from_bytes(bytes: &[u8], target: &TargetType) -> Value {
    if *target == TargetType::UInt64 {
        // BIT columns: big-endian bit field.
        let bits = bytes
            .iter()
            .take(8)
            .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
        return Value::from(bits);
    }

    let text = String::from_utf8_lossy(bytes);
    let parsed = match target {
        TargetType::Bool => match text.as_ref() {
            "1" | "true" | "TRUE" => Some(Value::Bool(true)),
            "0" | "false" | "FALSE" => Some(Value::Bool(false)),
            _ => None,
        },
        t if t.is_integer() => text
            .parse::<i64>()
            .map(|n| from_i64(n, target))
            .or_else(|_| text.parse::<u64>().map(|n| from_u64(n, target)))
            .ok(),
        t if t.is_float() => text
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number),
        _ => None,
    };

    parsed.unwrap_or_else(|| Value::String(text.into_owned()))
}

/// Label of a binlog `ENUM` value: a 1-based index into `members`, with 0
/// standing for the empty string MySQL stores for invalid values.
pub fn enum_label(index: u64, members: &[String]) -> Option<Value> {
    match index {
        0 => Some(Value::String(String::new())),
        i => members
            .get(i as usize - 1)
            .map(|label| Value::String(label.clone())),
    }
}

/// Labels of a binlog `SET` value: a little-endian bitmask over `members`,
/// joined the way MySQL prints them.
pub fn set_labels(mask: &[u8], members: &[String]) -> Value {
    let bits = mask
        .iter()
        .take(8)
        .rev()
        .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
    let labels: Vec<&str> = members
        .iter()
        .enumerate()
        .filter(|(bit, _)| *bit < 64 && bits & (1u64 << bit) != 0)
        .map(|(_, label)| label.as_str())
        .collect();
    Value::String(labels.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_text_protocol_integers() {
        assert_eq!(to_json(MySqlValue::Bytes(b"42".to_vec()), &TargetType::Int32), json!(42));
        assert_eq!(to_json(MySqlValue::Bytes(b"-7".to_vec()), &TargetType::Int8), json!(-7));
        assert_eq!(to_json(MySqlValue::Bytes(b"2024".to_vec()), &TargetType::UInt16), json!(2024));
    }

    #[test]
    fn test_unsigned_values_wrap_into_signed_targets() {
        assert_eq!(
            to_json(MySqlValue::UInt(u64::MAX), &TargetType::Int64),
            json!(-1)
        );
        assert_eq!(
            to_json(
                MySqlValue::Bytes(b"18446744073709551615".to_vec()),
                &TargetType::Int64
            ),
            json!(-1)
        );
    }

    #[test]
    fn test_decimals_stay_textual() {
        let value = to_json(
            MySqlValue::Bytes(b"1234.50".to_vec()),
            &TargetType::Decimal {
                precision: 10,
                scale: 2,
            },
        );
        assert_eq!(value, json!("1234.50"));
    }

    #[test]
    fn test_floats_and_bools() {
        assert_eq!(to_json(MySqlValue::Double(1.5), &TargetType::Float64), json!(1.5));
        assert_eq!(to_json(MySqlValue::Bytes(b"0.25".to_vec()), &TargetType::Float32), json!(0.25));
        assert_eq!(to_json(MySqlValue::Bytes(b"1".to_vec()), &TargetType::Bool), json!(true));
        assert_eq!(to_json(MySqlValue::Int(0), &TargetType::Bool), json!(false));
    }

    #[test]
    fn test_temporal_values() {
        assert_eq!(
            to_json(MySqlValue::Date(2024, 3, 9, 0, 0, 0, 0), &TargetType::Date),
            json!("2024-03-09")
        );
        assert_eq!(
            to_json(MySqlValue::Date(2024, 3, 9, 14, 5, 7, 0), &TargetType::DateTime),
            json!("2024-03-09 14:05:07")
        );
        assert_eq!(
            to_json(MySqlValue::Time(true, 1, 2, 3, 4, 500), &TargetType::String),
            json!("-26:03:04.000500")
        );
    }

    #[test]
    fn test_bit_fields() {
        assert_eq!(
            to_json(MySqlValue::Bytes(vec![0x01, 0x02]), &TargetType::UInt64),
            json!(258)
        );
    }

    #[test]
    fn test_strings_and_nulls() {
        assert_eq!(
            to_json(MySqlValue::Bytes("héllo".as_bytes().to_vec()), &TargetType::String),
            json!("héllo")
        );
        assert_eq!(to_json(MySqlValue::NULL, &TargetType::Int32), Value::Null);
    }

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_enum_index_resolves_label() {
        let members = labels(&["active", "suspended"]);
        assert_eq!(enum_label(2, &members), Some(json!("suspended")));
        assert_eq!(enum_label(0, &members), Some(json!("")));
        assert_eq!(enum_label(3, &members), None);
    }

    #[test]
    fn test_set_mask_resolves_labels() {
        let members = labels(&["read", "write", "admin"]);
        assert_eq!(set_labels(&[0b101], &members), json!("read,admin"));
        assert_eq!(set_labels(&[0], &members), json!(""));

        let wide: Vec<String> = (0..10).map(|i| format!("f{}", i)).collect();
        // Little-endian: bit 9 lives in the second byte.
        assert_eq!(set_labels(&[0x01, 0x02], &wide), json!("f0,f9"));
    }
}

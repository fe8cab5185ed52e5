//! Envelope decoder: raw queue payload → typed candle values.
//!
//! Decoding is a total function. Every field is extracted on its own and a
//! missing or malformed field becomes zero (or an empty ticker) without
//! affecting its neighbours, so a bad message still lands as an
//! identifiable row instead of disappearing.
use crate::record::CandleFact;
use crate::timestamp::Timestamp;
use serde_json::{Map, Value};

pub const FIELD_TICKER: &str = "ticker";
pub const FIELD_OPEN_PRICE: &str = "openPrice";
pub const FIELD_CLOSE_PRICE: &str = "closePrice";
pub const FIELD_SMA: &str = "sma";
pub const FIELD_STD: &str = "std";
pub const FIELD_AVG_PRICE: &str = "avgPrice";
pub const FIELD_CLOSE_TO_OPEN_RATIO: &str = "closeToOpenRatio";
pub const FIELD_OPEN_DT: &str = "openDt";
pub const FIELD_CLOSE_DT: &str = "closeDt";

/// Everything a [`CandleFact`] carries except its version stamp.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedCandle {
    pub ticker: String,
    pub open_price: f64,
    pub close_price: f64,
    pub sma: f64,
    pub std: f64,
    pub avg_price: f64,
    pub close_to_open_ratio: f64,
    pub open_dt: Timestamp,
    pub close_dt: Timestamp,
}

impl DecodedCandle {
    /// Attach the version discriminator. Only the transform view calls this;
    /// nothing in the payload can influence `landed_at`.
    pub fn land(self, landed_at: Timestamp) -> CandleFact {
        CandleFact {
            ticker: self.ticker,
            open_price: self.open_price,
            close_price: self.close_price,
            sma: self.sma,
            std: self.std,
            avg_price: self.avg_price,
            close_to_open_ratio: self.close_to_open_ratio,
            open_dt: self.open_dt,
            close_dt: self.close_dt,
            landed_at,
        }
    }
}

pub fn decode(payload: &str) -> DecodedCandle {
    match serde_json::from_str::<Value>(payload) {
        Ok(Value::Object(obj)) => decode_object(&obj),
        _ => DecodedCandle::default(),
    }
}

fn decode_object(obj: &Map<String, Value>) -> DecodedCandle {
    DecodedCandle {
        ticker: string_field(obj, FIELD_TICKER),
        open_price: decimal_field(obj, FIELD_OPEN_PRICE),
        close_price: decimal_field(obj, FIELD_CLOSE_PRICE),
        sma: decimal_field(obj, FIELD_SMA),
        std: decimal_field(obj, FIELD_STD),
        avg_price: decimal_field(obj, FIELD_AVG_PRICE),
        close_to_open_ratio: decimal_field(obj, FIELD_CLOSE_TO_OPEN_RATIO),
        open_dt: timestamp_field(obj, FIELD_OPEN_DT),
        close_dt: timestamp_field(obj, FIELD_CLOSE_DT),
    }
}

fn string_field(obj: &Map<String, Value>, name: &str) -> String {
    match obj.get(name) {
        Some(Value::String(s)) => s.clone(),
        _ => String::new(),
    }
}

fn decimal_field(obj: &Map<String, Value>, name: &str) -> f64 {
    let parsed = match obj.get(name) {
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(Value::Number(n)) => n.as_f64(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite()).unwrap_or(0.0)
}

fn timestamp_field(obj: &Map<String, Value>, name: &str) -> Timestamp {
    let parsed = match obj.get(name) {
        Some(Value::String(s)) => Timestamp::parse_best_effort(s),
        Some(Value::Number(n)) => n.as_i64().and_then(Timestamp::from_epoch_digits),
        _ => None,
    };
    parsed.unwrap_or(Timestamp::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const FULL: &str = r#"{"ticker":"ticker1","openPrice":"1.19","closePrice":"2.19","sma":"1.69","std":"0.5","avgPrice":"1.7","closeToOpenRatio":"1.84","openDt":"2025-10-10 10:10:10","closeDt":"2025-10-11 10:10:10"}"#;

    #[test]
    fn decodes_full_record() {
        let c = decode(FULL);
        assert_eq!(c.ticker, "ticker1");
        assert_eq!(c.open_price, 1.19);
        assert_eq!(c.close_price, 2.19);
        assert_eq!(c.sma, 1.69);
        assert_eq!(c.std, 0.5);
        assert_eq!(c.avg_price, 1.7);
        assert_eq!(c.close_to_open_ratio, 1.84);
        assert_eq!(c.open_dt.as_micros(), 1_760_091_010_000_000);
        assert_eq!(c.close_dt.as_micros(), 1_760_177_410_000_000);
    }

    #[test]
    fn missing_statistics_are_zero() {
        let c = decode(r#"{"ticker":"ticker1","openPrice":"1.19","closePrice":"2.19","openDt":"2025-10-10 10:10:10","closeDt":"2025-10-11 10:10:10"}"#);
        assert_eq!((c.sma, c.std, c.avg_price, c.close_to_open_ratio), (0.0, 0.0, 0.0, 0.0));
        assert_eq!(c.open_price, 1.19);
        assert!(!c.open_dt.is_zero());
    }

    #[test]
    fn malformed_numbers_do_not_spill_over() {
        let c = decode(r#"{"ticker":"X","openPrice":"abc","closePrice":" 2.5 ","sma":"NaN","std":"inf","avgPrice":true,"openDt":"soon"}"#);
        assert_eq!(c.open_price, 0.0);
        assert_eq!(c.close_price, 2.5);
        assert_eq!(c.sma, 0.0);
        assert_eq!(c.std, 0.0);
        assert_eq!(c.avg_price, 0.0);
        assert!(c.open_dt.is_zero());
        assert!(c.close_dt.is_zero());
    }

    #[test]
    fn json_numbers_are_accepted() {
        let c = decode(r#"{"ticker":"X","openPrice":1.25,"closePrice":3,"openDt":1760091010}"#);
        assert_eq!(c.open_price, 1.25);
        assert_eq!(c.close_price, 3.0);
        assert_eq!(c.open_dt.as_micros(), 1_760_091_010_000_000);
    }

    #[test]
    fn non_object_payloads_decode_to_zero_row() {
        for raw in ["", "not json", "[1,2]", "42", "null", r#"{"ticker":5}"#] {
            assert_eq!(decode(raw), DecodedCandle::default(), "{raw:?}");
        }
    }

    #[test]
    fn producer_cannot_supply_landed_at() {
        let c = decode(r#"{"ticker":"X","landedAt":"2099-01-01 00:00:00","landed_at":"2099-01-01 00:00:00"}"#);
        let fact = c.land(Timestamp::from_micros(7));
        assert_eq!(fact.landed_at.as_micros(), 7);
    }

    const OPTIONAL: [(&str, &str); 8] = [
        (FIELD_OPEN_PRICE, "\"1.19\""),
        (FIELD_CLOSE_PRICE, "\"2.19\""),
        (FIELD_SMA, "\"1.5\""),
        (FIELD_STD, "\"0.25\""),
        (FIELD_AVG_PRICE, "\"1.75\""),
        (FIELD_CLOSE_TO_OPEN_RATIO, "\"1.84\""),
        (FIELD_OPEN_DT, "\"2025-10-10 10:10:10\""),
        (FIELD_CLOSE_DT, "\"2025-10-11 10:10:10\""),
    ];

    proptest! {
        #[test]
        fn any_subset_of_fields_decodes(mask in 0u8..=255) {
            let mut parts = vec![format!("\"{FIELD_TICKER}\":\"T\"")];
            for (i, (name, value)) in OPTIONAL.iter().enumerate() {
                if mask & (1 << i) != 0 {
                    parts.push(format!("\"{name}\":{value}"));
                }
            }
            let c = decode(&format!("{{{}}}", parts.join(",")));
            let present = |i: usize| mask & (1 << i) != 0;
            prop_assert_eq!(c.ticker.as_str(), "T");
            prop_assert_eq!(c.open_price != 0.0, present(0));
            prop_assert_eq!(c.close_price != 0.0, present(1));
            prop_assert_eq!(c.sma != 0.0, present(2));
            prop_assert_eq!(c.std != 0.0, present(3));
            prop_assert_eq!(c.avg_price != 0.0, present(4));
            prop_assert_eq!(c.close_to_open_ratio != 0.0, present(5));
            prop_assert_eq!(!c.open_dt.is_zero(), present(6));
            prop_assert_eq!(!c.close_dt.is_zero(), present(7));
        }

        #[test]
        fn arbitrary_text_never_panics(raw in ".*") {
            let _ = decode(&raw);
        }
    }
}

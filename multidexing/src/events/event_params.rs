use serde::de::DeserializeOwned;
use serde_json::Value;

use super::Event;
use crate::HandlerError;

/// Typed access to an event's decoded parameters.
///
/// Integers may be stored either as JSON numbers or as decimal strings
/// (EVM sources encode 256-bit values as strings), so the integer getters accept both.
pub struct EventParams<'a> {
    event: &'a Event,
}

impl<'a> EventParams<'a> {
    pub(crate) fn new(event: &'a Event) -> Self {
        Self { event }
    }

    pub fn get_value(&self, key: &str) -> Result<&'a Value, HandlerError> {
        self.event.params.get(key).ok_or_else(|| HandlerError::MissingParam {
            event_name: self.event.event_name.clone(),
            name: key.to_string(),
        })
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, HandlerError> {
        serde_json::from_value(self.get_value(key)?.clone())
            .map_err(|_error| self.invalid(key, std::any::type_name::<T>()))
    }

    /// N/B: the returned string comes straight from chain data.
    /// Sanitize it before interpolating it anywhere.
    pub fn get_string(&self, key: &str) -> Result<String, HandlerError> {
        match self.get_value(key)? {
            Value::String(value) => Ok(value.clone()),
            other => Ok(other.to_string()),
        }
    }

    /// Returns the address lowercased, matching how contract addresses are stored
    pub fn get_address_string(&self, key: &str) -> Result<String, HandlerError> {
        match self.get_value(key)? {
            Value::String(value) => Ok(value.to_lowercase()),
            _ => Err(self.invalid(key, "address")),
        }
    }

    pub fn get_bool(&self, key: &str) -> Result<bool, HandlerError> {
        self.get_value(key)?.as_bool().ok_or_else(|| self.invalid(key, "bool"))
    }

    pub fn get_u64(&self, key: &str) -> Result<u64, HandlerError> {
        match self.get_value(key)? {
            Value::Number(number) => number.as_u64().ok_or_else(|| self.invalid(key, "u64")),
            Value::String(value) => value.parse().map_err(|_error| self.invalid(key, "u64")),
            _ => Err(self.invalid(key, "u64")),
        }
    }

    pub fn get_i64(&self, key: &str) -> Result<i64, HandlerError> {
        match self.get_value(key)? {
            Value::Number(number) => number.as_i64().ok_or_else(|| self.invalid(key, "i64")),
            Value::String(value) => value.parse().map_err(|_error| self.invalid(key, "i64")),
            _ => Err(self.invalid(key, "i64")),
        }
    }

    pub fn get_u128(&self, key: &str) -> Result<u128, HandlerError> {
        match self.get_value(key)? {
            Value::Number(number) => {
                number.as_u64().map(u128::from).ok_or_else(|| self.invalid(key, "u128"))
            }
            Value::String(value) => value.parse().map_err(|_error| self.invalid(key, "u128")),
            _ => Err(self.invalid(key, "u128")),
        }
    }

    fn invalid(&self, key: &str, expected: &str) -> HandlerError {
        HandlerError::InvalidParam {
            event_name: self.event.event_name.clone(),
            name: key.to_string(),
            expected: expected.to_string(),
        }
    }
}

use crate::error::{PipeError, Result};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;

/// String parameters of a processor, converted on demand
#[derive(Debug, Clone, Default)]
pub struct Params(BTreeMap<String, String>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Parses `name=value` pairs, e.g. from a command line
    pub fn parse_pairs<I, S>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut params = Params::new();
        for pair in pairs {
            let pair = pair.as_ref();
            let (name, value) = pair
                .split_once('=')
                .ok_or_else(|| PipeError::param(pair, "expected name=value"))?;
            params.insert(name.trim(), value.trim());
        }
        Ok(params)
    }

    pub fn required<T>(&self, name: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        let raw = self
            .get(name)
            .ok_or_else(|| PipeError::param(name, "required parameter missing"))?;
        raw.parse()
            .map_err(|e| PipeError::param(name, format!("invalid value '{}': {}", raw, e)))
    }

    pub fn optional<T>(&self, name: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get(name) {
            Some(_) => self.required(name),
            None => Ok(default),
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Params {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Params::new();
        for (k, v) in iter {
            params.insert(k, v);
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_lookup() {
        let params = Params::new().with("interval", "30").with("file", "stats.txt");
        assert_eq!(params.required::<u64>("interval").unwrap(), 30);
        assert_eq!(params.optional::<u64>("missing", 7).unwrap(), 7);
        assert_eq!(params.required::<String>("file").unwrap(), "stats.txt");
    }

    #[test]
    fn missing_and_invalid_are_config_errors() {
        let params = Params::new().with("interval", "soon");
        assert!(matches!(
            params.required::<String>("conf"),
            Err(PipeError::Param { .. })
        ));
        assert!(matches!(
            params.optional::<u64>("interval", 0),
            Err(PipeError::Param { .. })
        ));
    }

    #[test]
    fn pairs() {
        let params = Params::parse_pairs(["conf = crawler.json", "bootstrap=seeds"]).unwrap();
        assert_eq!(params.get("conf"), Some("crawler.json"));
        assert_eq!(params.get("bootstrap"), Some("seeds"));
        assert!(Params::parse_pairs(["oops"]).is_err());
    }
}

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::AppError;

fn place_code_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // IATA airport (3) and city/metro codes (up to 8, e.g. "LOND")
    PATTERN.get_or_init(|| Regex::new(r"^[A-Z0-9]{2,8}$").expect("static regex"))
}

/// Trim and upper-case an airport or city code.
pub fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

/// Normalize and validate a single place code.
pub fn parse_place_code(code: &str) -> Result<String, AppError> {
    let normalized = normalize_code(code);
    if !place_code_pattern().is_match(&normalized) {
        return Err(AppError::Validation(format!("Invalid place code: '{}'", code)));
    }
    Ok(normalized)
}

/// Ordered origin/destination pair. Codes are stored upper-cased so the key
/// compares case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RouteKey {
    origin: String,
    destination: String,
}

impl RouteKey {
    pub fn new(origin: &str, destination: &str) -> Result<Self, AppError> {
        let origin = parse_place_code(origin)?;
        let destination = parse_place_code(destination)?;
        if origin == destination {
            return Err(AppError::Validation(format!(
                "Origin and destination must differ ({})",
                origin
            )));
        }
        Ok(Self { origin, destination })
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.origin, self.destination)
    }
}

impl FromStr for RouteKey {
    type Err = AppError;

    /// Parses the `ORIGIN-DESTINATION` form used in configuration.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (origin, destination) = s
            .split_once('-')
            .ok_or_else(|| AppError::Validation(format!("Route must look like 'LHR-JFK': '{}'", s)))?;
        RouteKey::new(origin, destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_key_is_case_insensitive() {
        let a = RouteKey::new("lhr", " jfk ").unwrap();
        let b = RouteKey::new("LHR", "JFK").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "LHR-JFK");
    }

    #[test]
    fn test_route_key_is_ordered_pair() {
        let out = RouteKey::new("LHR", "JFK").unwrap();
        let back = RouteKey::new("JFK", "LHR").unwrap();
        assert_ne!(out, back);
    }

    #[test]
    fn test_rejects_bad_codes() {
        assert!(RouteKey::new("", "JFK").is_err());
        assert!(RouteKey::new("L H R", "JFK").is_err());
        assert!(RouteKey::new("LHR", "LHR").is_err());
    }

    #[test]
    fn test_parse_from_config_form() {
        let route: RouteKey = "man-bcn".parse().unwrap();
        assert_eq!(route.origin(), "MAN");
        assert_eq!(route.destination(), "BCN");
        assert!("MANBCN".parse::<RouteKey>().is_err());
    }
}

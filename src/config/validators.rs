//! Stock validator functions for [`super::ParamSpec::validators`].
//!
//! Every validator follows the same convention as the original project's
//! validator library: an empty value is always accepted (skip, don't
//! validate) unless the validator's whole purpose is to reject emptiness.
//! This lets a key remain validator-decorated even when it is optional.

use crate::error::Error;
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;

pub type ValidatorFn = fn(key: &str, value: &str) -> Result<(), Error>;

pub fn not_empty(key: &str, value: &str) -> Result<(), Error> {
    if value.trim().is_empty() {
        return Err(Error::config(key, "value must not be empty"));
    }
    Ok(())
}

pub fn integer(key: &str, value: &str) -> Result<(), Error> {
    if value.is_empty() {
        return Ok(());
    }
    value
        .parse::<i64>()
        .map(|_| ())
        .map_err(|_| Error::config(key, format!("`{value}` is not an integer")))
}

pub fn float(key: &str, value: &str) -> Result<(), Error> {
    if value.is_empty() {
        return Ok(());
    }
    value
        .parse::<f64>()
        .map(|_| ())
        .map_err(|_| Error::config(key, format!("`{value}` is not a float")))
}

pub fn ip(key: &str, value: &str) -> Result<(), Error> {
    if value.is_empty() {
        return Ok(());
    }
    IpAddr::from_str(value)
        .map(|_| ())
        .map_err(|_| Error::config(key, format!("`{value}` is not a valid IP address")))
}

pub fn port(key: &str, value: &str) -> Result<(), Error> {
    if value.is_empty() {
        return Ok(());
    }
    integer(key, value)?;
    let n: i64 = value.parse().unwrap();
    if !(0..=65535).contains(&n) {
        return Err(Error::config(key, format!("`{value}` is out of port range 0-65535")));
    }
    Ok(())
}

pub fn file_exists(key: &str, value: &str) -> Result<(), Error> {
    if value.is_empty() {
        return Ok(());
    }
    if !Path::new(value).exists() {
        return Err(Error::config(key, format!("file `{value}` does not exist")));
    }
    Ok(())
}

/// Makes a validator that checks minimum string length, used by
/// configuration keys such as passwords that have no closed option set but
/// still need a shape check.
pub fn min_length(min: usize) -> impl Fn(&str, &str) -> Result<(), Error> + Clone {
    move |key: &str, value: &str| {
        if value.is_empty() {
            return Ok(());
        }
        if value.len() < min {
            return Err(Error::config(
                key,
                format!("value must be at least {min} characters long"),
            ));
        }
        Ok(())
    }
}

/// Checks that `value` matches at least one of `options` literally. This is
/// redundant with [`super::ParamSpec::options`] enforcement but kept as a
/// standalone validator for keys that want it applied explicitly.
pub fn options(options: &HashSet<String>) -> impl Fn(&str, &str) -> Result<(), Error> + '_ {
    move |key: &str, value: &str| {
        if value.is_empty() {
            return Ok(());
        }
        if !options.contains(value) {
            return Err(Error::config(
                key,
                format!("`{value}` is not one of the allowed options"),
            ));
        }
        Ok(())
    }
}

/// DNS-resolves `value` and caches successful lookups process-wide, mirroring
/// the original project's resolution cache.
pub fn hostname(key: &str, value: &str) -> Result<(), Error> {
    use std::collections::HashSet as Set;
    use std::sync::Mutex;

    static CACHE: OnceLock<Mutex<Set<String>>> = OnceLock::new();
    if value.is_empty() {
        return Ok(());
    }
    let cache = CACHE.get_or_init(|| Mutex::new(Set::new()));
    {
        let guard = cache.lock().unwrap();
        if guard.contains(value) {
            return Ok(());
        }
    }
    use std::net::ToSocketAddrs;
    let lookup = format!("{value}:0");
    lookup
        .to_socket_addrs()
        .map_err(|_| Error::config(key, format!("host `{value}` does not resolve")))?
        .next()
        .ok_or_else(|| Error::config(key, format!("host `{value}` does not resolve")))?;
    cache.lock().unwrap().insert(value.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_empty_rejects_blank() {
        assert!(not_empty("k", "").is_err());
        assert!(not_empty("k", "x").is_ok());
    }

    #[test]
    fn integer_accepts_digits_only() {
        assert!(integer("k", "42").is_ok());
        assert!(integer("k", "4.2").is_err());
        assert!(integer("k", "").is_ok());
    }

    #[test]
    fn port_rejects_out_of_range() {
        assert!(port("k", "22").is_ok());
        assert!(port("k", "70000").is_err());
    }

    #[test]
    fn min_length_rejects_short_values() {
        let v = min_length(8);
        assert!(v("k", "short").is_err());
        assert!(v("k", "longenough").is_ok());
        assert!(v("k", "").is_ok());
    }

    #[test]
    fn options_rejects_unlisted_value() {
        let set: HashSet<String> = ["mysql".to_string(), "postgresql".to_string()]
            .into_iter()
            .collect();
        let v = options(&set);
        assert!(v("k", "mysql").is_ok());
        assert!(v("k", "oracle").is_err());
    }
}

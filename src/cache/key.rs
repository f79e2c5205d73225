//! Cache key derivation.
//!
//! A key is `<namespace>:<METHOD>:<path>:<canonical query>:<caller>`. The
//! query is canonicalized by sorting pairs on name, then value, so parameter
//! order on the wire never splits one logical request across two keys.
//!
//! `%`, `:`, `&` and `=` are percent-escaped inside every component, so the
//! separators only ever appear as separators. An authenticated caller is
//! written `u=<id>`; the bare [`ANONYMOUS`] sentinel can never be produced
//! by a caller id.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Method;

/// Caller component used for unauthenticated requests.
pub const ANONYMOUS: &str = "anonymous";

/// Errors produced while deriving a key. The middleware treats any of them
/// as "this request is not cacheable".
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("derived key is {len} bytes, over the {max} byte limit")]
    TooLong { len: usize, max: usize },

    #[error("{component} contains control characters")]
    InvalidComponent { component: &'static str },
}

/// An opaque cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self(key.to_owned())
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Selects keys for bulk invalidation.
///
/// `Contains` matches anywhere in the key (the usual choice: `"products"`
/// hits every key whose path mentions products). `Prefix` matches from the
/// start of the full key, namespace included.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "match", content = "value", rename_all = "snake_case")]
pub enum InvalidationPattern {
    Contains(String),
    Prefix(String),
}

impl InvalidationPattern {
    pub fn contains(fragment: impl Into<String>) -> Self {
        Self::Contains(fragment.into())
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self::Prefix(prefix.into())
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::Contains(fragment) => key.contains(fragment.as_str()),
            Self::Prefix(prefix) => key.starts_with(prefix.as_str()),
        }
    }

    /// The raw fragment or prefix.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Contains(s) | Self::Prefix(s) => s,
        }
    }
}

impl From<&str> for InvalidationPattern {
    fn from(fragment: &str) -> Self {
        Self::Contains(fragment.to_owned())
    }
}

impl From<String> for InvalidationPattern {
    fn from(fragment: String) -> Self {
        Self::Contains(fragment)
    }
}

impl fmt::Display for InvalidationPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Contains(s) => write!(f, "*{s}*"),
            Self::Prefix(s) => write!(f, "{s}*"),
        }
    }
}

/// Maps a request's identity to a [`CacheKey`].
///
/// Stateless apart from its configuration, so a single instance is shared
/// freely across tasks.
///
/// # Examples
///
/// ```
/// use tiercache::Method;
/// use tiercache::cache::KeyDeriver;
///
/// let deriver = KeyDeriver::new("shop");
/// let a = deriver
///     .derive(&Method::Get, "/products", &[("page", "1"), ("sort", "name")], None)
///     .unwrap();
/// let b = deriver
///     .derive(&Method::Get, "/products", &[("sort", "name"), ("page", "1")], None)
///     .unwrap();
/// assert_eq!(a, b);
/// assert_eq!(a.as_str(), "shop:GET:/products:page=1&sort=name:anonymous");
/// ```
#[derive(Debug, Clone)]
pub struct KeyDeriver {
    namespace: String,
    max_len: usize,
}

impl KeyDeriver {
    /// Default upper bound on key length, in bytes.
    pub const DEFAULT_MAX_LEN: usize = 1024;

    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            max_len: Self::DEFAULT_MAX_LEN,
        }
    }

    #[must_use]
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Derives the key for one request.
    ///
    /// # Errors
    ///
    /// [`KeyError::InvalidComponent`] if the path or caller contains control
    /// characters, [`KeyError::TooLong`] if the result exceeds the limit.
    pub fn derive<K, V>(
        &self,
        method: &Method,
        path: &str,
        query: &[(K, V)],
        caller: Option<&str>,
    ) -> Result<CacheKey, KeyError>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        if path.chars().any(char::is_control) {
            return Err(KeyError::InvalidComponent { component: "path" });
        }
        if caller.is_some_and(|c| c.chars().any(char::is_control)) {
            return Err(KeyError::InvalidComponent { component: "caller" });
        }

        let caller = match caller {
            Some(id) => format!("u={}", escape(id)),
            None => ANONYMOUS.to_owned(),
        };
        let key = format!(
            "{}:{}:{}:{}:{}",
            self.namespace,
            method.as_str(),
            escape(path),
            canonical_query(query),
            caller,
        );

        if key.len() > self.max_len {
            return Err(KeyError::TooLong {
                len: key.len(),
                max: self.max_len,
            });
        }
        Ok(CacheKey(key))
    }
}

/// Sorted `name=value` pairs joined with `&`, each side escaped.
fn canonical_query<K, V>(query: &[(K, V)]) -> String
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut pairs: Vec<(&str, &str)> = query
        .iter()
        .map(|(k, v)| (k.as_ref(), v.as_ref()))
        .collect();
    pairs.sort_unstable();

    let mut out = String::new();
    for (i, (k, v)) in pairs.into_iter().enumerate() {
        if i > 0 {
            out.push('&');
        }
        out.push_str(&escape(k));
        out.push('=');
        out.push_str(&escape(v));
    }
    out
}

fn escape(component: &str) -> Cow<'_, str> {
    if !component.contains(['%', ':', '&', '=']) {
        return Cow::Borrowed(component);
    }
    let mut out = String::with_capacity(component.len() + 8);
    for c in component.chars() {
        match c {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3A"),
            '&' => out.push_str("%26"),
            '=' => out.push_str("%3D"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_QUERY: &[(&str, &str)] = &[];

    #[test]
    fn same_request_same_key() {
        let d = KeyDeriver::new("t");
        let q = [("page", "1")];
        let a = d.derive(&Method::Get, "/products", &q, Some("u1")).unwrap();
        let b = d.derive(&Method::Get, "/products", &q, Some("u1")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn query_order_does_not_matter() {
        let d = KeyDeriver::new("t");
        let a = d
            .derive(&Method::Get, "/p", &[("b", "2"), ("a", "1"), ("a", "0")], None)
            .unwrap();
        let b = d
            .derive(&Method::Get, "/p", &[("a", "0"), ("b", "2"), ("a", "1")], None)
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "t:GET:/p:a=0&a=1&b=2:anonymous");
    }

    #[test]
    fn components_separate_keys() {
        let d = KeyDeriver::new("t");
        let base = d.derive(&Method::Get, "/p", &[("a", "1")], None).unwrap();
        assert_ne!(base, d.derive(&Method::Head, "/p", &[("a", "1")], None).unwrap());
        assert_ne!(base, d.derive(&Method::Get, "/q", &[("a", "1")], None).unwrap());
        assert_ne!(base, d.derive(&Method::Get, "/p", &[("a", "2")], None).unwrap());
        assert_ne!(base, d.derive(&Method::Get, "/p", &[("a", "1")], Some("u")).unwrap());
    }

    #[test]
    fn missing_caller_uses_sentinel() {
        let d = KeyDeriver::new("t");
        let key = d.derive(&Method::Get, "/p", NO_QUERY, None).unwrap();
        assert_eq!(key.as_str(), "t:GET:/p::anonymous");
    }

    #[test]
    fn callers_are_tagged() {
        let d = KeyDeriver::new("t");
        let key = d.derive(&Method::Get, "/me", NO_QUERY, Some("u1")).unwrap();
        assert_eq!(key.as_str(), "t:GET:/me::u=u1");

        let named_anonymous = d.derive(&Method::Get, "/me", NO_QUERY, Some(ANONYMOUS)).unwrap();
        let unauthenticated = d.derive(&Method::Get, "/me", NO_QUERY, None).unwrap();
        assert_ne!(named_anonymous, unauthenticated);
    }

    #[test]
    fn separators_inside_components_are_escaped() {
        let d = KeyDeriver::new("t");
        let in_path = d.derive(&Method::Get, "/x:a=1", NO_QUERY, None).unwrap();
        let in_query = d.derive(&Method::Get, "/x", &[("a", "1:")], None).unwrap();
        assert_ne!(in_path, in_query);
        assert_eq!(in_path.as_str(), "t:GET:/x%3Aa%3D1::anonymous");
        assert_eq!(in_query.as_str(), "t:GET:/x:a=1%3A:anonymous");

        let split = d.derive(&Method::Get, "/p", &[("a", "1&b=2")], None).unwrap();
        let pair = d.derive(&Method::Get, "/p", &[("a", "1"), ("b", "2")], None).unwrap();
        assert_ne!(split, pair);

        let escaped = d.derive(&Method::Get, "/p", &[("a", "%3A")], None).unwrap();
        let literal = d.derive(&Method::Get, "/p", &[("a", ":")], None).unwrap();
        assert_ne!(escaped, literal);

        let caller = d.derive(&Method::Get, "/p", NO_QUERY, Some("a:b")).unwrap();
        assert_eq!(caller.as_str(), "t:GET:/p::u=a%3Ab");
    }

    #[test]
    fn works_with_owned_pairs() {
        let d = KeyDeriver::new("t");
        let owned = vec![("page".to_string(), "3".to_string())];
        let key = d.derive(&Method::Get, "/p", &owned, None).unwrap();
        assert_eq!(key.as_str(), "t:GET:/p:page=3:anonymous");
    }

    #[test]
    fn rejects_overlong_keys() {
        let d = KeyDeriver::new("t").with_max_len(16);
        let err = d.derive(&Method::Get, "/a-rather-long-path", NO_QUERY, None);
        assert!(matches!(err, Err(KeyError::TooLong { max: 16, .. })));
    }

    #[test]
    fn patterns_match_substring_or_prefix() {
        let key = "t:GET:/products:page=1:anonymous";
        assert!(InvalidationPattern::from("products").matches(key));
        assert!(!InvalidationPattern::from("orders").matches(key));
        assert!(InvalidationPattern::prefix("t:GET:/prod").matches(key));
        assert!(!InvalidationPattern::prefix("products").matches(key));
    }

    #[test]
    fn patterns_serialize_tagged() {
        let json = serde_json::to_string(&InvalidationPattern::contains("orders")).unwrap();
        assert_eq!(json, r#"{"match":"contains","value":"orders"}"#);
        let back: InvalidationPattern = serde_json::from_str(&json).unwrap();
        assert_eq!(back, InvalidationPattern::contains("orders"));
    }

    #[test]
    fn rejects_control_characters() {
        let d = KeyDeriver::new("t");
        assert_eq!(
            d.derive(&Method::Get, "/p\n", NO_QUERY, None),
            Err(KeyError::InvalidComponent { component: "path" })
        );
        assert_eq!(
            d.derive(&Method::Get, "/p", NO_QUERY, Some("u\0")),
            Err(KeyError::InvalidComponent { component: "caller" })
        );
    }
}

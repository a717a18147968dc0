//! Document transforms applied between the stored and the domain form of a
//! record.
//!
//! A [`Pipeline`] combines a caller-supplied pair of transforms with an
//! optional date codec:
//!
//! ```text
//! to_storage(doc) = inverse_transformer(encode_dates(doc))
//! to_domain(doc)  = decode_dates(transformer(doc))
//! ```
//!
//! Both transforms default to identity. They only see payloads; row keys
//! are derived from the domain record before any transform runs.

use chrono::DateTime;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::Result;

/// Prefix of a date-time stored by the date codec.
const DATE_PREFIX: &str = "$date:";
/// Stored strings starting with this are escaped domain strings.
const ESCAPE: char = '$';

/// A boxed future that returns a transformed document
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

/// Transform one document, possibly asynchronously
type TransformFn = dyn Fn(Value) -> BoxFuture<Value> + Send + Sync;

/// A caller-supplied document transform.
#[derive(Clone)]
pub struct Transform(Arc<TransformFn>);

impl Transform {
  /// Wrap an asynchronous transform.
  ///
  /// # Example
  ///
  /// ```ignore
  /// let t = Transform::new(|doc| async move { enrich(doc).await });
  /// ```
  pub fn new<F, Fut>(f: F) -> Self
  where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
  {
    Self(Arc::new(move |doc| -> BoxFuture<Value> { Box::pin(f(doc)) }))
  }

  /// Wrap a synchronous transform.
  pub fn sync<F>(f: F) -> Self
  where
    F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
  {
    Self::new(move |doc| std::future::ready(f(doc)))
  }

  pub async fn apply(&self, doc: Value) -> Result<Value> {
    (self.0)(doc).await
  }
}

impl fmt::Debug for Transform {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("Transform(..)")
  }
}

/// Transform pipeline between storage and domain documents.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
  /// Storage to domain; identity when unset
  transformer: Option<Transform>,
  /// Domain to storage; identity when unset
  inverse_transformer: Option<Transform>,
  transform_dates: bool,
}

impl Pipeline {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_transformer(mut self, transformer: Transform) -> Self {
    self.transformer = Some(transformer);
    self
  }

  pub fn with_inverse_transformer(mut self, inverse: Transform) -> Self {
    self.inverse_transformer = Some(inverse);
    self
  }

  /// Store date-time strings in prefixed form and restore them on read.
  pub fn with_transform_dates(mut self, enabled: bool) -> Self {
    self.transform_dates = enabled;
    self
  }

  pub fn transforms_dates(&self) -> bool {
    self.transform_dates
  }

  /// Turn a stored payload into its domain form.
  pub async fn to_domain(&self, doc: Value) -> Result<Value> {
    let doc = match &self.transformer {
      Some(t) => t.apply(doc).await?,
      None => doc,
    };
    Ok(if self.transform_dates {
      decode_dates(doc)
    } else {
      doc
    })
  }

  /// Turn a domain document into its stored form.
  pub async fn to_storage(&self, doc: Value) -> Result<Value> {
    let doc = if self.transform_dates {
      encode_dates(doc)
    } else {
      doc
    };
    match &self.inverse_transformer {
      Some(t) => t.apply(doc).await,
      None => Ok(doc),
    }
  }
}

fn is_date(s: &str) -> bool {
  DateTime::parse_from_rfc3339(s).is_ok()
}

/// Replace every RFC 3339 date-time string with `"$date:<string>"`.
///
/// Other strings starting with `$` get one more `$`, so the encoding stays
/// reversible. Only string leaves change: object keys, nesting and nulls are
/// left alone, so a merge patch encoded this way applies to an encoded
/// document exactly as the plain patch applies to the plain document.
pub fn encode_dates(doc: Value) -> Value {
  match doc {
    Value::String(s) if is_date(&s) => Value::String(format!("{}{}", DATE_PREFIX, s)),
    Value::String(s) if s.starts_with(ESCAPE) => Value::String(format!("{}{}", ESCAPE, s)),
    Value::Array(items) => Value::Array(items.into_iter().map(encode_dates).collect()),
    Value::Object(map) => Value::Object(
      map
        .into_iter()
        .map(|(key, value)| (key, encode_dates(value)))
        .collect(),
    ),
    other => other,
  }
}

/// Inverse of [`encode_dates`].
pub fn decode_dates(doc: Value) -> Value {
  match doc {
    Value::String(s) => Value::String(decode_string(s)),
    Value::Array(items) => Value::Array(items.into_iter().map(decode_dates).collect()),
    Value::Object(map) => Value::Object(
      map
        .into_iter()
        .map(|(key, value)| (key, decode_dates(value)))
        .collect(),
    ),
    other => other,
  }
}

fn decode_string(s: String) -> String {
  if let Some(date) = s.strip_prefix(DATE_PREFIX) {
    return date.to_string();
  }
  match s.strip_prefix(ESCAPE) {
    Some(rest) if rest.starts_with(ESCAPE) => rest.to_string(),
    _ => s,
  }
}

//! Request classification and versioned bucket naming.

use url::Url;

const STATIC_EXTENSIONS: &[&str] = &[
  "js", "mjs", "css", "woff", "woff2", "ttf", "otf", "eot", "png", "jpg", "jpeg", "gif", "svg",
  "ico", "webp", "webmanifest",
];

/// How a request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  /// Scripts, styles, fonts, manifest: cache-first
  Static,
  /// Calendar/task endpoints: network-first, synthesized empty result offline
  DomainApi,
  /// Everything else: network-first, cache as best effort
  Other,
}

/// Decides the [`RequestClass`] of a URL.
#[derive(Debug, Clone)]
pub struct Classifier {
  api_prefixes: Vec<String>,
}

impl Classifier {
  pub fn new(api_prefixes: Vec<String>) -> Self {
    Self { api_prefixes }
  }

  pub fn classify(&self, url: &Url) -> RequestClass {
    let path = url.path();

    if self.api_prefixes.iter().any(|p| path.contains(p.as_str())) {
      return RequestClass::DomainApi;
    }

    let file = path.rsplit('/').next().unwrap_or("");
    if file == "manifest.json" {
      return RequestClass::Static;
    }
    match file.rsplit_once('.') {
      Some((_, ext)) if STATIC_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) => {
        RequestClass::Static
      }
      _ => RequestClass::Other,
    }
  }
}

impl Default for Classifier {
  fn default() -> Self {
    Self::new(vec!["/calendar-events".into(), "/task-api".into()])
  }
}

/// Bucket names for one engine version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buckets {
  pub static_bucket: String,
  pub dynamic_bucket: String,
}

impl Buckets {
  pub fn for_version(version: u32) -> Self {
    Self {
      static_bucket: format!("static-v{}", version),
      dynamic_bucket: format!("dynamic-v{}", version),
    }
  }

  pub fn names(&self) -> [&str; 2] {
    [&self.static_bucket, &self.dynamic_bucket]
  }
}

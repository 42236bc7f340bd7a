//! Which requests the worker handles.

use super::types::{AssetRequest, RequestMode};

/// Extensions intercepted when no configuration overrides them.
pub const DEFAULT_EXTENSIONS: &[&str] = &["html", "css", "js", "json", "svg"];

/// Decides whether a request is served through the cache.
///
/// A GET is intercepted when it is a navigation, or when the full URL ends
/// in one of the extensions. The suffix check runs on the whole URL, so
/// `style.css?v=2` is not intercepted. Images are left to the browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptPolicy {
  /// Lowercase, without the leading dot
  extensions: Vec<String>,
}

impl Default for InterceptPolicy {
  fn default() -> Self {
    Self::new(DEFAULT_EXTENSIONS.iter().copied())
  }
}

impl InterceptPolicy {
  pub fn new<I, S>(extensions: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    Self {
      extensions: extensions
        .into_iter()
        .map(|e| e.as_ref().trim_start_matches('.').to_lowercase())
        .filter(|e| !e.is_empty())
        .collect(),
    }
  }

  pub fn intercepts(&self, request: &AssetRequest) -> bool {
    if !request.method.eq_ignore_ascii_case("GET") {
      return false;
    }
    request.mode == RequestMode::Navigate || self.matches_extension(&request.url)
  }

  fn matches_extension(&self, url: &str) -> bool {
    let Some((_, suffix)) = url.rsplit_once('.') else {
      return false;
    };
    self.extensions.iter().any(|ext| ext == suffix)
  }
}

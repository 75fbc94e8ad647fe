//! Load contexts and resource identifiers

use crate::error::{CacheError, CacheResult};

/// Who loads a resource, used to keep storages apart
///
/// Each distinct context gets its own entry table, keyed by [`key`](Self::key).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct LoadContextInfo {
    pub private: bool,
    pub anonymous: bool,
    pub app_id: u32,
    pub in_browser: bool,
}

impl LoadContextInfo {
    pub fn new(private: bool, anonymous: bool, app_id: u32, in_browser: bool) -> Self {
        Self {
            private,
            anonymous,
            app_id,
            in_browser,
        }
    }

    /// Context of private browsing loads
    pub fn private() -> Self {
        Self {
            private: true,
            ..Self::default()
        }
    }

    /// The salt identifying the context, e.g. `a,i42,p,`
    pub fn key(&self) -> String {
        let mut key = String::new();
        if self.anonymous {
            key.push_str("a,");
        }
        if self.in_browser {
            key.push_str("b,");
        }
        if self.app_id != 0 {
            key.push_str(&format!("i{},", self.app_id));
        }
        if self.private {
            key.push_str("p,");
        }
        key
    }

    /// Parse a salt produced by [`key`](Self::key)
    pub fn from_key(key: &str) -> CacheResult<Self> {
        let mut info = Self::default();
        for part in key.split(',').filter(|p| !p.is_empty()) {
            match part {
                "a" => info.anonymous = true,
                "b" => info.in_browser = true,
                "p" => info.private = true,
                _ => {
                    let id = part
                        .strip_prefix('i')
                        .and_then(|id| id.parse().ok())
                        .ok_or_else(|| {
                            CacheError::InvalidArgument(format!("bad context key: {}", key))
                        })?;
                    info.app_id = id;
                }
            }
        }
        Ok(info)
    }
}

/// Resource identifier; only its text and equality matter
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheUri {
    text: String,
}

impl CacheUri {
    /// Parse an ASCII URI, dropping the `#fragment`
    pub fn parse(text: &str) -> CacheResult<Self> {
        let text = text.split('#').next().unwrap_or_default().trim();
        if text.is_empty() || !text.contains(':') {
            return Err(CacheError::InvalidArgument(format!("invalid uri: {}", text)));
        }
        Ok(Self {
            text: text.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl std::fmt::Display for CacheUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

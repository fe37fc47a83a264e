use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use tracing::debug;

pub const DEFAULT_CONTENT_TYPE: &str = "text/plain; charset=UTF-8";

/// Extension to content-type table. Entries from an optional override file win over
/// `mime_guess`; the `*` key replaces the fallback for unknown extensions.
#[derive(Debug, Clone)]
pub struct MimeTypes {
    overrides: HashMap<String, String>,
    fallback: String,
}

impl Default for MimeTypes {
    fn default() -> Self {
        Self {
            overrides: HashMap::new(),
            fallback: DEFAULT_CONTENT_TYPE.to_string(),
        }
    }
}

impl MimeTypes {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read MIME map {}", path.display()))?;
        let table =
            Self::parse(&text).with_context(|| format!("invalid MIME map {}", path.display()))?;
        debug!(
            path = %path.display(),
            entries = table.overrides.len(),
            "loaded MIME overrides"
        );
        Ok(table)
    }

    /// Parses `ext=type` (or `ext: type`) lines. `#` and `!` start comments.
    pub fn parse(text: &str) -> Result<Self> {
        let mut table = Self::default();
        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let Some((ext, value)) = line.split_once(['=', ':']) else {
                bail!("line {}: expected 'extension=type'", index + 1);
            };
            let ext = ext.trim().trim_start_matches('.').to_ascii_lowercase();
            let value = value.trim();
            if ext.is_empty() || value.is_empty() {
                bail!("line {}: empty extension or type", index + 1);
            }
            if ext == "*" {
                table.fallback = value.to_string();
            } else {
                table.overrides.insert(ext, value.to_string());
            }
        }
        Ok(table)
    }

    /// Content type for a file name. Dot files and names without an extension get the
    /// fallback.
    pub fn content_type(&self, path: &Path) -> String {
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            return self.fallback.clone();
        };
        let ext = match name.rfind('.') {
            Some(dot) if dot > 0 && dot + 1 < name.len() => name[dot + 1..].to_ascii_lowercase(),
            _ => return self.fallback.clone(),
        };
        if let Some(value) = self.overrides.get(&ext) {
            return value.clone();
        }
        match mime_guess::from_ext(&ext).first() {
            Some(mime) if mime.type_() == mime_guess::mime::TEXT => {
                format!("{}; charset=UTF-8", mime.essence_str())
            }
            Some(mime) => mime.essence_str().to_string(),
            None => self.fallback.clone(),
        }
    }
}

use anyhow::{Context, Result, anyhow, bail};
use http::{
    HeaderMap,
    header::{HeaderName, HeaderValue},
};

use crate::proxy::limits::HeaderBudget;

/// Collects header lines of a message head into a [`HeaderMap`], recording the framing
/// headers on the way.
pub(crate) struct HeaderAccumulator {
    budget: HeaderBudget,
    headers: HeaderMap,
    content_length: Option<u64>,
    chunked: bool,
}

impl HeaderAccumulator {
    pub fn new(max_bytes: usize, error_message: &'static str) -> Result<Self> {
        Ok(Self {
            budget: HeaderBudget::new(max_bytes, error_message)?,
            headers: HeaderMap::new(),
            content_length: None,
            chunked: false,
        })
    }

    /// Returns `false` once the blank line closing the head has been consumed.
    pub fn push_line(&mut self, line: &str) -> Result<bool> {
        self.budget.record(line.len())?;
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            return Ok(false);
        }

        let (name, value) = trimmed
            .split_once(':')
            .ok_or_else(|| anyhow!("header missing ':' separator"))?;
        let name = name.trim();
        let value = value.trim();
        if name.is_empty() {
            bail!("header name must not be empty");
        }
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| anyhow!("invalid header name '{name}'"))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|_| anyhow!("invalid value for header '{name}'"))?;

        if header_name == http::header::CONTENT_LENGTH {
            if self.content_length.is_some() {
                bail!("multiple Content-Length headers are not supported");
            }
            let parsed: u64 = value
                .parse()
                .with_context(|| format!("invalid Content-Length value '{value}'"))?;
            self.content_length = Some(parsed);
        }
        if header_name == http::header::TRANSFER_ENCODING
            && value.to_ascii_lowercase().contains("chunked")
        {
            self.chunked = true;
        }

        self.headers.append(header_name, header_value);
        Ok(true)
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    pub fn remaining(&self) -> usize {
        self.budget.remaining()
    }

    pub fn into_map(self) -> HeaderMap {
        self.headers
    }
}

/// Returns the comma separated tokens of every `Connection` header, lowercased.
pub(crate) fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}

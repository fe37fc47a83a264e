use anyhow::{Result, anyhow, ensure};

use crate::proxy::error::ProxyError;

/// Tracks cumulative request body bytes and enforces `max_request_body_size`.
pub struct BodySizeTracker {
    max_bytes: u64,
    total_bytes: u64,
}

impl BodySizeTracker {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            total_bytes: 0,
        }
    }

    pub fn record(&mut self, chunk_len: usize) -> Result<()> {
        self.total_bytes = self.total_bytes.saturating_add(chunk_len as u64);
        if self.total_bytes > self.max_bytes {
            return Err(ProxyError::BodyTooLarge {
                limit: self.max_bytes,
            }
            .into());
        }
        Ok(())
    }
}

/// Enforces a maximum number of header bytes while parsing a message head.
pub struct HeaderBudget {
    limit: usize,
    used: usize,
    error_message: &'static str,
}

impl HeaderBudget {
    pub fn new(limit: usize, error_message: &'static str) -> Result<Self> {
        ensure!(limit > 0, "header limit must be greater than zero");
        Ok(Self {
            limit,
            used: 0,
            error_message,
        })
    }

    pub fn record(&mut self, bytes: usize) -> Result<()> {
        self.used = self
            .used
            .checked_add(bytes)
            .ok_or_else(|| anyhow!("header size overflow"))?;
        ensure!(self.used <= self.limit, "{}", self.error_message);
        Ok(())
    }

    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.used)
    }
}

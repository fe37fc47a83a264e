use std::collections::HashMap;

use anyhow::{Result, anyhow};
use http::{
    HeaderMap, HeaderValue,
    header::{self, HeaderName},
};
use serde::Deserialize;
use tracing::trace;

use crate::proxy::http::connection_tokens;
use crate::proxy::origin::Origin;

/// What happens to one inbound header on its way to the origin.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum HeaderRule {
    Drop,
    Fixed { value: String },
    Passthrough,
}

/// Hop-by-hop and framing headers are never copied; the forwarder writes its own.
pub fn is_hop_by_hop(name: &str) -> bool {
    name.starts_with("proxy-")
        || matches!(
            name,
            "connection"
                | "keep-alive"
                | "te"
                | "trailer"
                | "upgrade"
                | "transfer-encoding"
                | "content-length"
        )
}

/// Table-driven translation of inbound request headers into origin request headers.
#[derive(Debug, Clone)]
pub struct HeaderRemapper {
    rules: HashMap<HeaderName, HeaderRule>,
    origin: Origin,
}

impl HeaderRemapper {
    /// Default rules pin `Host` and `Origin` to the origin and drop `Accept-Encoding`;
    /// `overrides` from the settings file are merged on top.
    pub fn for_origin(origin: Origin, overrides: &HashMap<String, HeaderRule>) -> Result<Self> {
        let mut rules = HashMap::new();
        rules.insert(header::ACCEPT_ENCODING, HeaderRule::Drop);
        rules.insert(
            header::ORIGIN,
            HeaderRule::Fixed {
                value: origin.origin_value(),
            },
        );
        rules.insert(
            header::HOST,
            HeaderRule::Fixed {
                value: origin.authority(),
            },
        );
        for (name, rule) in overrides {
            let name = HeaderName::from_bytes(name.trim().as_bytes())
                .map_err(|_| anyhow!("invalid header name '{name}' in header_rules"))?;
            if let HeaderRule::Fixed { value } = rule {
                HeaderValue::from_str(value)
                    .map_err(|_| anyhow!("invalid fixed value for header '{name}'"))?;
            }
            rules.insert(name, rule.clone());
        }
        Ok(Self { rules, origin })
    }

    pub fn rule(&self, name: &HeaderName) -> &HeaderRule {
        self.rules.get(name).unwrap_or(&HeaderRule::Passthrough)
    }

    /// Builds the outbound header set. Repeated passthrough headers are joined with `;`,
    /// an empty fixed value drops the header, and `Referer` keeps its path and query but
    /// points at the origin. `Host` is always present.
    pub fn remap(&self, inbound: &HeaderMap) -> HeaderMap {
        let nominated = connection_tokens(inbound);
        let mut outbound = HeaderMap::new();

        for name in inbound.keys() {
            if is_hop_by_hop(name.as_str()) || nominated.iter().any(|token| token == name.as_str())
            {
                continue;
            }

            let value = if *name == header::REFERER {
                inbound
                    .get(name)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| self.origin.rewrite_referer(value))
                    .and_then(|value| HeaderValue::from_str(&value).ok())
            } else {
                match self.rule(name) {
                    HeaderRule::Drop => None,
                    HeaderRule::Fixed { value } if value.is_empty() => None,
                    HeaderRule::Fixed { value } => HeaderValue::from_str(value).ok(),
                    HeaderRule::Passthrough => join_values(inbound, name),
                }
            };

            match value {
                Some(value) => {
                    outbound.insert(name.clone(), value);
                }
                None => trace!(header = %name, "header not forwarded to origin"),
            }
        }

        if !outbound.contains_key(header::HOST)
            && let Ok(host) = HeaderValue::from_str(&self.origin.authority())
        {
            outbound.insert(header::HOST, host);
        }
        outbound
    }
}

fn join_values(headers: &HeaderMap, name: &HeaderName) -> Option<HeaderValue> {
    let mut values = headers.get_all(name).iter();
    let first = values.next()?;
    let rest: Vec<&HeaderValue> = values.collect();
    if rest.is_empty() {
        return Some(first.clone());
    }
    let mut joined = first.as_bytes().to_vec();
    for value in rest {
        joined.push(b';');
        joined.extend_from_slice(value.as_bytes());
    }
    HeaderValue::from_bytes(&joined).ok()
}

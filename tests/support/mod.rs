#![allow(dead_code)]

mod harness;
mod http_utils;
mod upstream;

pub use harness::{ServerHarness, ServerHarnessBuilder};
pub use http_utils::{HttpResponse, send_request};
pub use upstream::{MockOrigin, RecordedRequest};

mod headers;
mod line;
mod request;
mod response;

pub(crate) use headers::connection_tokens;
pub(crate) use line::read_line_with_timeout;
pub(crate) use request::{RequestHead, read_request_head};
pub(crate) use response::{ResponseHead, encode_response_head, read_response_head};

pub mod headers;
pub mod method;
pub mod parser;
pub mod request;
pub mod response;
pub mod status;

pub use headers::Headers;
pub use method::Method;
pub use parser::{ParseError, ParseStatus, Phase, RequestParser};
pub use request::{Request, Version};
pub use response::{Body, Response};
pub use status::StatusCode;

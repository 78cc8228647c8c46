use std::fs;

use crate::error::HttpError;
use crate::http::{Response, StatusCode};
use crate::static_files;
use crate::vhost::VirtualHost;

/// Custom pages larger than this are ignored in favour of the built-in one.
const MAX_PAGE_BYTES: u64 = 1024 * 1024;

pub struct ErrorPages;

impl ErrorPages {
    /// Response for a request-level error, using the host's configured page
    /// for the status when one is readable.
    pub fn response(err: &HttpError, host: Option<&VirtualHost>) -> Response {
        let mut response = Self::for_status(err.status(), host);
        if let HttpError::MethodNotAllowed(allowed) = err {
            let mut names: Vec<&str> = allowed.iter().map(|m| m.as_str()).collect();
            if names.contains(&"GET") && !names.contains(&"HEAD") {
                names.push("HEAD");
            }
            response.headers.set("Allow", names.join(", "));
        }
        response
    }

    pub fn for_status(status: StatusCode, host: Option<&VirtualHost>) -> Response {
        if let Some(page) = host.and_then(|h| h.error_page(status)) {
            let small = fs::metadata(page).map(|m| m.is_file() && m.len() <= MAX_PAGE_BYTES);
            if let Ok(true) = small {
                match fs::read(page) {
                    Ok(body) => {
                        let mut response = Response::html(status, body);
                        response.headers.set("Content-Type", static_files::content_type(page));
                        return response;
                    }
                    Err(e) => log::warn!("error page {} unreadable: {}", page.display(), e),
                }
            }
        }
        Response::html(status, Self::generic(status))
    }

    pub fn generic(status: StatusCode) -> String {
        let code = status.as_u16();
        let reason = status.reason();
        format!(
            r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>{code} {reason}</title>
    <style>
        body {{
            font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", Roboto, Arial, sans-serif;
            margin: 0;
            height: 100vh;
            display: flex;
            justify-content: center;
            align-items: center;
            background: #f5f5f5;
        }}
        h1 {{
            color: #e74c3c;
            font-size: 72px;
            margin: 0;
        }}
    </style>
</head>
<body>
    <div>
        <h1>{code}</h1>
        <p>{reason}</p>
    </div>
</body>
</html>
"#
        )
    }
}

//! HTML pages, compiled into the binary.

use actix_web::http::StatusCode;
use url::Url;

const HOME: &str = include_str!("../templates/home.html");
const FEED: &str = include_str!("../templates/feed.html");
const ERROR: &str = include_str!("../templates/error.html");

pub fn home_page(tcp_host: &str, tcp_port: u16) -> String {
    render(
        HOME,
        &[("tcp_host", tcp_host), ("tcp_port", &tcp_port.to_string())],
    )
}

pub fn feed_page(base_url: &str, feed_id: &str) -> String {
    let base = base_url.trim_end_matches('/');
    render(
        FEED,
        &[
            ("feed_id", feed_id),
            ("home_url", &format!("{}/", base)),
            ("plaintext_url", &format!("{}/plaintext/{}", base, feed_id)),
        ],
    )
}

pub fn error_page(status: StatusCode, title: &str, detail: &str) -> String {
    render(
        ERROR,
        &[
            ("status", status.as_str()),
            ("title", title),
            ("detail", detail),
        ],
    )
}

/// Host part of a URL such as `https://nacre.example:8443/x`. Input that is not
/// an absolute URL is returned as is.
pub fn url_host(raw: &str) -> String {
    Url::parse(raw)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
        .unwrap_or_else(|| raw.to_string())
}

/// Single pass over `template`, so substituted values are never re-scanned.
/// Unknown placeholders are left as they are.
fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len() + 64);
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim();
                match vars.iter().find(|(k, _)| *k == key) {
                    Some((_, value)) => out.push_str(&escape_html(value)),
                    None => out.push_str(&rest[start..start + 2 + end + 2]),
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

pub fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

//! Response headers the hosting layer serves the sandbox page with.
use crate::config::Config;

/// Headers derived from `config`. `frame-ancestors` is always exactly the
/// allowed origin set, so only the parents we talk to can embed us.
pub fn security_headers(config: &Config) -> Vec<(&'static str, String)> {
    vec![
        ("Content-Security-Policy", content_security_policy(config)),
        ("X-Content-Type-Options", "nosniff".to_string()),
        ("Referrer-Policy", "no-referrer".to_string()),
        ("X-XSS-Protection", "1; mode=block".to_string()),
    ]
}

fn directive(name: &str, sources: &[String]) -> String {
    if sources.is_empty() {
        format!("{name} 'none'")
    } else {
        format!("{name} {}", sources.join(" "))
    }
}

pub fn content_security_policy(config: &Config) -> String {
    let headers = &config.headers;
    [
        "default-src 'self'".to_string(),
        directive("script-src", &headers.script_src),
        directive("style-src", &headers.style_src),
        directive("font-src", &headers.font_src),
        directive("img-src", &headers.img_src),
        directive("connect-src", &headers.connect_src),
        directive("frame-ancestors", &config.sandbox.allowed_origins),
        "object-src 'none'".to_string(),
        "base-uri 'none'".to_string(),
    ]
    .join("; ")
}

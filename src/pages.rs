//! HTML shown to browsers while the gateway boots or when it cannot start

use crate::error::ErrorResponse;

/// Seconds between automatic reloads of the loading page
const LOADING_REFRESH_SECS: u32 = 3;

/// Escape text for inclusion in HTML element content or attributes
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn document(title: &str, head_extra: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{title}</title>
{head_extra}<style>
body {{ font-family: system-ui, sans-serif; background: #0f1115; color: #e6e6e6; display: flex; min-height: 100vh; align-items: center; justify-content: center; margin: 0; }}
main {{ max-width: 40rem; padding: 2rem; }}
h1 {{ font-size: 1.4rem; }}
pre {{ white-space: pre-wrap; background: #1b1e24; padding: 1rem; border-radius: 6px; }}
.hint {{ color: #9ecbff; }}
</style>
</head>
<body>
<main>
{body}
</main>
</body>
</html>
"#,
        title = escape_html(title),
        head_extra = head_extra,
        body = body,
    )
}

/// Placeholder served to browsers while the gateway starts.
///
/// Reloads itself, and polls `/api/status` so it can reload as soon as the
/// gateway reports running.
pub fn loading_page() -> String {
    let refresh = format!(
        "<meta http-equiv=\"refresh\" content=\"{}\">\n",
        LOADING_REFRESH_SECS
    );
    let body = r#"<h1>Starting the gateway&hellip;</h1>
<p>The container was asleep. This page reloads on its own once the gateway is ready, which can take a minute or two on a cold start.</p>
<script>
(function poll() {
  fetch('/api/status', { cache: 'no-store' })
    .then(function (r) { return r.json(); })
    .then(function (s) { if (s.ok) { location.reload(); } else { setTimeout(poll, 1000); } })
    .catch(function () { setTimeout(poll, 2000); });
})();
</script>"#;
    document("Starting", &refresh, body)
}

/// Error page presenting the same fields as the JSON body
pub fn error_page(error: &ErrorResponse) -> String {
    let mut body = format!("<h1>{}</h1>\n", escape_html(&error.error));
    if let Some(message) = &error.message {
        body.push_str(&format!("<p>{}</p>\n", escape_html(message)));
    }
    if let Some(missing) = &error.missing {
        body.push_str("<ul>\n");
        for name in missing {
            body.push_str(&format!("<li><code>{}</code></li>\n", escape_html(name)));
        }
        body.push_str("</ul>\n");
    }
    if let Some(details) = &error.details {
        body.push_str(&format!("<pre>{}</pre>\n", escape_html(details)));
    }
    if let Some(hint) = &error.hint {
        body.push_str(&format!("<p class=\"hint\">{}</p>\n", escape_html(hint)));
    }
    document(&error.error, "", &body)
}

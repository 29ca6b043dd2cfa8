use async_trait::async_trait;
use flowx_types::{FlowError, Result};
use regex::Regex;

/// Loads the text behind a doc node's `url`.
#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String>;
}

/// Extension at the end of a URL path, ignoring any query or fragment.
pub fn extract_file_extension(url: &str) -> Option<String> {
    Regex::new(r"(?i)\.([a-z0-9]+)(?:[\?#]|$)")
        .ok()?
        .captures(url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_ascii_lowercase())
}

// ---------------------------------------------------------------------------
// HttpFetcher
// ---------------------------------------------------------------------------

/// Fetches documents over HTTP and turns them into plain text.
///
/// HTML pages are stripped to their visible text and CSV files are rendered
/// one `column: value` block per row. Binary formats such as PDF are refused.
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<String> {
        let extension = extract_file_extension(url);
        if extension.as_deref() == Some("pdf") {
            return Err(FlowError::config(format!(
                "load document error: pdf is not supported ({url})"
            )));
        }

        let resp = self.client.get(url).send().await.map_err(|e| FlowError::ExternalCall {
            message: format!("load document error: {e}"),
            retryable: true,
        })?;
        let status = resp.status();
        let is_html = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("html"))
            .unwrap_or(false);
        let body = resp.text().await.map_err(|e| FlowError::ExternalCall {
            message: format!("load document error: {e}"),
            retryable: true,
        })?;
        if !status.is_success() {
            return Err(FlowError::ExternalCall {
                message: format!("load document error: HTTP {} for {url}", status.as_u16()),
                retryable: status.is_server_error(),
            });
        }

        tracing::debug!(url = %url, bytes = body.len(), "document fetched");

        Ok(match extension.as_deref() {
            Some("csv") => csv_to_text(&body),
            Some("html") | Some("htm") => html_to_text(&body)?,
            _ if is_html => html_to_text(&body)?,
            _ => body,
        })
    }
}

/// Visible text of an HTML page, one line per block.
pub fn html_to_text(html: &str) -> Result<String> {
    let build = |p: &str| Regex::new(p).map_err(|e| FlowError::Other(e.to_string()));
    let hidden = build(r"(?is)<(script|style|noscript|head)[^>]*>.*?</(script|style|noscript|head)>")?;
    let breaks = build(r"(?i)<(br|/p|/div|/li|/h[1-6]|/tr)[^>]*>")?;
    let tags = build(r"(?s)<[^>]+>")?;
    let blank = build(r"\n[ \t]*(\n[ \t]*)+")?;
    let text = hidden.replace_all(html, "");
    let text = breaks.replace_all(&text, "\n");
    let text = tags.replace_all(&text, "");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    let lines: Vec<&str> = text.lines().map(str::trim).collect();
    Ok(blank
        .replace_all(&lines.join("\n"), "\n\n")
        .trim()
        .to_string())
}

/// CSV rows rendered as `header: value` lines, one block per row.
pub fn csv_to_text(csv: &str) -> String {
    let mut lines = csv.lines().filter(|l| !l.trim().is_empty());
    let Some(header) = lines.next() else {
        return String::new();
    };
    let headers: Vec<&str> = header.split(',').map(str::trim).collect();
    lines
        .map(|row| {
            row.split(',')
                .map(str::trim)
                .zip(&headers)
                .map(|(value, name)| format!("{name}: {value}"))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

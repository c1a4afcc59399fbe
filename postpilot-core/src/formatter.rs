use std::collections::HashSet;

use regex::Regex;
use serde::Serialize;

use crate::driver::BodyFormat;
use crate::job::Job;

const SPACER: &str = r#"<p data-ke-size="size16">&nbsp;</p>"#;
const SEPARATOR: &str =
    r#"<hr contenteditable="false" data-ke-type="horizontalRule" data-ke-style="style5" />"#;

/// Title plus composed body, ready for an editor. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContentPayload {
    pub title: String,
    pub body: String,
    pub format: BodyFormat,
}

/// Turns a job's plain-text body and image list into editor input.
///
/// A line that is a bare image URL (matching a known image host or
/// extension, or listed among the job's images) is rendered as an image in
/// place. Listed images not consumed inline are appended after a separator
/// in their original order. No URL is rendered twice.
#[derive(Debug, Clone)]
pub struct ContentFormatter {
    image_line: Regex,
}

impl Default for ContentFormatter {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentFormatter {
    pub fn new() -> Self {
        Self::with_image_hosts(&["blob.vercel-storage.com"])
    }

    pub fn with_image_hosts(hosts: &[&str]) -> Self {
        let hosts = hosts
            .iter()
            .map(|host| regex::escape(host))
            .collect::<Vec<_>>()
            .join("|");
        let pattern = if hosts.is_empty() {
            r"(?i)^https?://\S+\.(png|jpe?g|gif)$".to_string()
        } else {
            format!(r"(?i)^https?://(\S*({hosts})\S*|\S+\.(png|jpe?g|gif))$")
        };
        let image_line = Regex::new(&pattern).expect("valid regex");
        Self { image_line }
    }

    pub fn is_image_line(&self, line: &str) -> bool {
        self.image_line.is_match(line)
    }

    pub fn payload(&self, job: &Job, format: BodyFormat) -> ContentPayload {
        let body = match format {
            BodyFormat::Html => self.format_html(&job.body, &job.image_urls),
            BodyFormat::Plain => self.format_plain(&job.body, &job.image_urls),
        };
        ContentPayload {
            title: job.title.clone(),
            body,
            format,
        }
    }

    /// Markup for HTML-mode editors.
    pub fn format_html(&self, body: &str, images: &[String]) -> String {
        let listed: HashSet<&str> = images.iter().map(|url| url.trim()).collect();
        let mut rendered: HashSet<String> = HashSet::new();
        let mut parts = Vec::new();

        for line in lines(body) {
            if line.is_empty() {
                parts.push(SPACER.to_string());
                continue;
            }
            if self.is_image_line(line) || listed.contains(line) {
                if rendered.insert(line.to_string()) {
                    parts.push(image_block(line));
                }
                continue;
            }
            parts.push(format!(
                r#"<p data-ke-size="size16">{}</p>"#,
                escape_html(line)
            ));
        }

        let remaining = remaining_images(images, &mut rendered);
        if !remaining.is_empty() {
            parts.push(SEPARATOR.to_string());
            parts.extend(remaining.into_iter().map(image_block));
        }
        parts.concat()
    }

    /// Text for rich editors that take keystrokes; unreferenced images are
    /// appended as bare URL lines, which the editors embed on paste.
    pub fn format_plain(&self, body: &str, images: &[String]) -> String {
        let mut rendered: HashSet<String> = HashSet::new();
        let mut out = Vec::new();
        for line in lines(body) {
            let is_image = !line.is_empty()
                && (self.is_image_line(line) || images.iter().any(|url| url.trim() == line));
            if is_image && !rendered.insert(line.to_string()) {
                continue;
            }
            out.push(line.to_string());
        }
        let remaining = remaining_images(images, &mut rendered);
        if !remaining.is_empty() {
            if !out.is_empty() {
                out.push(String::new());
            }
            out.extend(remaining.into_iter().map(str::to_string));
        }
        out.join("\n")
    }
}

/// Body lines with surrounding whitespace removed. An empty body has no lines.
fn lines(body: &str) -> impl Iterator<Item = &str> {
    let mut split = if body.is_empty() {
        None
    } else {
        Some(body.split('\n'))
    };
    std::iter::from_fn(move || split.as_mut()?.next()).map(str::trim)
}

fn remaining_images<'a>(images: &'a [String], rendered: &mut HashSet<String>) -> Vec<&'a str> {
    images
        .iter()
        .map(|url| url.trim())
        .filter(|url| !url.is_empty())
        .filter(|url| rendered.insert(url.to_string()))
        .collect()
}

fn image_block(url: &str) -> String {
    format!(
        r#"<p style="text-align: center;"><img src="{}" style="max-width: 100%;" /></p>"#,
        escape_html(url)
    )
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}

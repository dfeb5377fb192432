//! Markup rendering collaborator.
//!
//! The engine only needs `markup -> (html, toc)` to be a pure function of the
//! markup and the group's title/file tables at commit time. `BasicRenderer`
//! covers headings, paragraphs, fenced code, inline code, page links and file
//! markers; richer markdown renderers plug in through [`Renderer`].

use crate::store::{Attachment, FileId};
use crate::title_resolver::TitleResolver;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;
use std::sync::LazyLock;

static INLINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"`([^`]*)`|\[\[([^\]]+)\]\]|\[(image|file):(\d+)\]").unwrap()
});

static HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(#{1,6})\s+(.+?)\s*#*$").unwrap());

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TocEntry {
    pub level: u8,
    pub text: String,
    pub anchor: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rendered {
    pub html: String,
    pub toc: Vec<TocEntry>,
}

/// Everything a renderer may look at besides the markup itself.
pub struct RenderContext<'a> {
    pub group: &'a str,
    pub titles: &'a TitleResolver,
    pub files: &'a BTreeMap<FileId, Attachment>,
}

pub trait Renderer: Send + Sync {
    fn render(&self, markup: &str, ctx: &RenderContext<'_>) -> Rendered;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BasicRenderer;

impl Renderer for BasicRenderer {
    fn render(&self, markup: &str, ctx: &RenderContext<'_>) -> Rendered {
        let mut html = String::new();
        let mut toc = Vec::new();
        let mut anchors: HashMap<String, usize> = HashMap::new();
        let mut paragraph: Vec<&str> = Vec::new();
        let mut code: Option<Vec<&str>> = None;

        for line in markup.lines() {
            if let Some(block) = code.as_mut() {
                if line.trim_start().starts_with("```") {
                    let _ = write!(html, "<pre><code>{}</code></pre>", escape(&block.join("\n")));
                    code = None;
                } else {
                    block.push(line);
                }
                continue;
            }
            if line.trim_start().starts_with("```") {
                flush_paragraph(&mut html, &mut paragraph, ctx);
                code = Some(Vec::new());
                continue;
            }
            if line.trim().is_empty() {
                flush_paragraph(&mut html, &mut paragraph, ctx);
                continue;
            }
            if let Some(cap) = HEADING_RE.captures(line) {
                flush_paragraph(&mut html, &mut paragraph, ctx);
                let level = cap[1].len() as u8;
                let text = cap[2].to_string();
                let anchor = unique_anchor(&text, &mut anchors);
                let _ = write!(
                    html,
                    "<h{level} id=\"{anchor}\">{}</h{level}>",
                    render_inline(&text, ctx)
                );
                toc.push(TocEntry { level, text, anchor });
                continue;
            }
            paragraph.push(line);
        }

        // An unterminated fence still shows its contents.
        if let Some(block) = code {
            let _ = write!(html, "<pre><code>{}</code></pre>", escape(&block.join("\n")));
        }
        flush_paragraph(&mut html, &mut paragraph, ctx);

        Rendered { html, toc }
    }
}

fn flush_paragraph(html: &mut String, lines: &mut Vec<&str>, ctx: &RenderContext<'_>) {
    if lines.is_empty() {
        return;
    }
    let _ = write!(html, "<p>{}</p>", render_inline(&lines.join("\n"), ctx));
    lines.clear();
}

fn unique_anchor(text: &str, seen: &mut HashMap<String, usize>) -> String {
    let mut slug = String::new();
    for c in text.chars().flat_map(char::to_lowercase) {
        if c.is_alphanumeric() {
            slug.push(c);
        } else if (c.is_whitespace() || c == '-') && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_matches('-').to_string();
    let slug = if slug.is_empty() { "section".to_string() } else { slug };
    let count = seen.entry(slug.clone()).or_insert(0);
    *count += 1;
    if *count == 1 {
        slug
    } else {
        format!("{}-{}", slug, *count - 1)
    }
}

fn render_inline(text: &str, ctx: &RenderContext<'_>) -> String {
    let mut out = String::new();
    let mut last = 0;
    for cap in INLINE_RE.captures_iter(text) {
        let Some(whole) = cap.get(0) else { continue };
        out.push_str(&escape(&text[last..whole.start()]));
        last = whole.end();

        if let Some(code) = cap.get(1) {
            let _ = write!(out, "<code>{}</code>", escape(code.as_str()));
        } else if let Some(link) = cap.get(2) {
            out.push_str(&render_page_link(link.as_str(), ctx));
        } else if let (Some(kind), Some(id)) = (cap.get(3), cap.get(4)) {
            out.push_str(&render_file_marker(kind.as_str(), id.as_str(), whole.as_str(), ctx));
        }
    }
    out.push_str(&escape(&text[last..]));
    out
}

fn render_page_link(content: &str, ctx: &RenderContext<'_>) -> String {
    let (target, alias) = match content.split_once('|') {
        Some((target, alias)) => (target, Some(alias.trim())),
        None => (content, None),
    };
    let (title, anchor) = match target.split_once('#') {
        Some((title, anchor)) => (title.trim(), Some(anchor.trim())),
        None => (target.trim(), None),
    };
    let label = escape(alias.filter(|a| !a.is_empty()).unwrap_or(title));

    match ctx.titles.resolve(title) {
        Some(id) => {
            let fragment = anchor
                .filter(|a| !a.is_empty())
                .map(|a| format!("#{}", escape(a)))
                .unwrap_or_default();
            format!(
                "<a class=\"wiki-link\" href=\"/{}/page/{}{}\">{}</a>",
                escape(ctx.group),
                id,
                fragment,
                label
            )
        }
        None => format!("<a class=\"wiki-link missing\">{}</a>", label),
    }
}

fn render_file_marker(kind: &str, id: &str, raw: &str, ctx: &RenderContext<'_>) -> String {
    let Some(file) = id.parse().ok().and_then(|id: FileId| ctx.files.get(&id)) else {
        return escape(raw);
    };
    let href = format!(
        "/{}/file/{}?filename={}",
        escape(ctx.group),
        file.id,
        urlencoding::encode(&file.name)
    );
    if kind == "image" {
        format!("<img src=\"{}\" alt=\"{}\">", href, escape(&file.name))
    } else {
        format!("<a class=\"wiki-file\" href=\"{}\">{}</a>", href, escape(&file.name))
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
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

use crate::error::{Result, WikiError};
use crate::store::{FileId, PageId};
use regex::Regex;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::LazyLock;

// Compile regex once, reuse across calls
static WIKILINK_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[\[([^\]]+)\]\]").unwrap());

static FENCED_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[^\n]*\n.*?```|~~~[^\n]*\n.*?~~~").unwrap());

static INLINE_CODE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"`[^`]*`").unwrap());

static FILE_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(image|file):(\d+)\]").unwrap());

/// Characters that would break marker parsing if they appeared in a title.
const FORBIDDEN_TITLE_CHARS: &[char] = &['[', ']', '|', '#', '`', '\n', '\r'];

/// The literal marker text for a page link, e.g. `[[Page Title]]`.
pub fn page_marker(title: &str) -> String {
    format!("[[{}]]", title)
}

/// Check that `title` can round-trip through a `[[...]]` marker.
pub fn validate_title(title: &str) -> Result<&str> {
    if title.trim().is_empty()
        || title.trim() != title
        || title.contains(FORBIDDEN_TITLE_CHARS)
    {
        return Err(WikiError::InvalidTitle(title.to_string()));
    }
    Ok(title)
}

/// Extract wikilink targets from markup text.
/// Returns page names only (strips anchors and aliases).
/// Ignores links inside code blocks and inline code.
pub fn extract_wikilinks(markup: &str) -> Vec<String> {
    extract_wikilink_occurrences(markup)
        .into_iter()
        .map(|occ| occ.name)
        .collect()
}

/// Resolve every wikilink in `markup` to a page id.
///
/// Titles `resolve` cannot find are dropped (a link to a missing page is not
/// an edge). Duplicates collapse, so the result only depends on the set of
/// titles mentioned.
pub fn extract_references<F>(markup: &str, resolve: F) -> BTreeSet<PageId>
where
    F: Fn(&str) -> Option<PageId>,
{
    extract_wikilinks(markup)
        .iter()
        .filter_map(|name| resolve(name.as_str()))
        .collect()
}

/// A wikilink occurrence with byte positions of the replaceable page-name span.
///
/// `name_start` and `name_len` describe the byte span from `[[` to the first
/// `#`, `|` or `]]`, the portion replaced during a rename.
/// `name` is the trimmed page name extracted from that span.
#[derive(Debug, PartialEq, Eq)]
pub struct WikilinkOccurrence {
    /// Trimmed page name, e.g. "Foo" from `[[Foo#Section|Alias]]`
    pub name: String,
    /// Byte offset of the replaceable span (starts right after "[[")
    pub name_start: usize,
    /// Byte length of the replaceable span (up to `#`, `|`, or `]]`)
    pub name_len: usize,
}

/// Build a set of byte ranges that are inside code blocks or inline code.
fn build_excluded_ranges(markup: &str) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    for m in FENCED_CODE_RE.find_iter(markup) {
        ranges.push((m.start(), m.end()));
    }
    for m in INLINE_CODE_RE.find_iter(markup) {
        ranges.push((m.start(), m.end()));
    }
    ranges
}

/// Returns true if the byte offset falls within any excluded range.
fn is_excluded(offset: usize, excluded: &[(usize, usize)]) -> bool {
    excluded
        .iter()
        .any(|&(start, end)| offset >= start && offset < end)
}

/// Extract wikilink occurrences with byte positions of the page-name portion.
pub fn extract_wikilink_occurrences(markup: &str) -> Vec<WikilinkOccurrence> {
    let excluded = build_excluded_ranges(markup);
    let mut occurrences = Vec::new();

    for cap in WIKILINK_RE.captures_iter(markup) {
        let (Some(full_match), Some(group1)) = (cap.get(0), cap.get(1)) else {
            continue;
        };
        if is_excluded(full_match.start(), &excluded) {
            continue;
        }

        let content = group1.as_str();
        if content.trim().is_empty() {
            continue;
        }

        // The page name is the part before any '#' or '|'
        let name_end_in_content = content
            .find('#')
            .unwrap_or(content.len())
            .min(content.find('|').unwrap_or(content.len()));

        let name = content[..name_end_in_content].trim();
        if name.is_empty() {
            continue;
        }

        occurrences.push(WikilinkOccurrence {
            name: name.to_string(),
            name_start: group1.start(),
            name_len: name_end_in_content,
        });
    }

    occurrences
}

/// A text edit: replace `remove_len` bytes at `offset` with `insert_text`.
#[derive(Debug, PartialEq, Eq)]
pub struct TextEdit {
    /// Byte offset in source
    pub offset: usize,
    /// Number of bytes to remove
    pub remove_len: usize,
    /// Replacement text
    pub insert_text: String,
}

/// Find all wikilinks naming exactly `old_title` (case-sensitive) and return
/// edits replacing the page-name portion with `new_title`. Anchors and aliases
/// are kept; links inside code are left alone.
/// Returns edits in reverse offset order for safe sequential application.
pub fn compute_wikilink_rename_edits(
    markup: &str,
    old_title: &str,
    new_title: &str,
) -> Vec<TextEdit> {
    let mut edits: Vec<TextEdit> = extract_wikilink_occurrences(markup)
        .into_iter()
        .filter(|occ| occ.name == old_title)
        .map(|occ| TextEdit {
            offset: occ.name_start,
            remove_len: occ.name_len,
            insert_text: new_title.to_string(),
        })
        .collect();

    edits.sort_by(|a, b| b.offset.cmp(&a.offset));
    edits
}

/// Apply edits produced by [`compute_wikilink_rename_edits`].
pub fn apply_text_edits(text: &str, edits: &[TextEdit]) -> String {
    let mut out = text.to_string();
    for edit in edits {
        out.replace_range(edit.offset..edit.offset + edit.remove_len, &edit.insert_text);
    }
    out
}

/// Token-aware rename of every `[[old_title...]]` link in `markup`.
pub fn rename_wikilinks(markup: &str, old_title: &str, new_title: &str) -> String {
    let edits = compute_wikilink_rename_edits(markup, old_title, new_title);
    apply_text_edits(markup, &edits)
}

// ---------------------------------------------------------------------------
// File markers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Image,
    File,
}

impl FileKind {
    /// Images are recognised by MIME type, everything else is a plain file.
    pub fn from_mime(mime_type: &str) -> Self {
        if mime_type.contains("image") {
            FileKind::Image
        } else {
            FileKind::File
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileKind::Image => "image",
            FileKind::File => "file",
        }
    }
}

/// An embedded attachment token such as `[image:12]` or `[file:7]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMarker {
    pub kind: FileKind,
    pub file_id: FileId,
}

impl fmt::Display for FileMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}]", self.kind.as_str(), self.file_id)
    }
}

/// A file marker with its byte span in the scanned text.
#[derive(Debug, PartialEq, Eq)]
pub struct FileMarkerOccurrence {
    pub marker: FileMarker,
    pub start: usize,
    pub end: usize,
}

/// Find file markers outside code blocks, in document order.
pub fn extract_file_markers(markup: &str) -> Vec<FileMarkerOccurrence> {
    let excluded = build_excluded_ranges(markup);
    FILE_MARKER_RE
        .captures_iter(markup)
        .filter_map(|cap| {
            let full = cap.get(0)?;
            if is_excluded(full.start(), &excluded) {
                return None;
            }
            let kind = match cap.get(1)?.as_str() {
                "image" => FileKind::Image,
                _ => FileKind::File,
            };
            let file_id = cap.get(2)?.as_str().parse().ok()?;
            Some(FileMarkerOccurrence {
                marker: FileMarker { kind, file_id },
                start: full.start(),
                end: full.end(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    // === extract_wikilinks tests ===

    #[test]
    fn extracts_simple_wikilink() {
        assert_eq!(extract_wikilinks("[[Note]]"), vec!["Note"]);
    }

    #[test]
    fn returns_empty_for_no_links() {
        assert_eq!(extract_wikilinks("plain text"), Vec::<String>::new());
    }

    #[test]
    fn extracts_multiple_wikilinks() {
        assert_eq!(extract_wikilinks("[[One]] and [[Two]]"), vec!["One", "Two"]);
    }

    #[test]
    fn strips_anchor_and_alias() {
        assert_eq!(extract_wikilinks("[[Note#Section]]"), vec!["Note"]);
        assert_eq!(extract_wikilinks("[[Note|Display Text]]"), vec!["Note"]);
        assert_eq!(extract_wikilinks("[[Note#Section|Display]]"), vec!["Note"]);
    }

    #[test]
    fn ignores_empty_brackets() {
        assert_eq!(extract_wikilinks("[[]]"), Vec::<String>::new());
        assert_eq!(extract_wikilinks("[[ |alias]]"), Vec::<String>::new());
    }

    #[test]
    fn ignores_links_in_code() {
        let markup = "```\n[[CodeLink]]\n```\nOutside [[RealLink]] and `[[Fake]]`";
        assert_eq!(extract_wikilinks(markup), vec!["RealLink"]);
    }

    // === extract_references tests ===

    fn resolver(title: &str) -> Option<PageId> {
        match title {
            "Alpha" => Some(1),
            "Beta" => Some(2),
            _ => None,
        }
    }

    #[test]
    fn references_are_resolved_and_deduplicated() {
        let refs = extract_references("[[Beta]] [[Alpha]] [[Beta|again]] [[Gamma]]", resolver);
        assert_eq!(refs.into_iter().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn references_are_case_sensitive() {
        assert!(extract_references("[[beta]] [[ALPHA]]", resolver).is_empty());
    }

    #[test]
    fn references_are_idempotent() {
        let markup = "see [[Alpha]] and [[Beta]]";
        assert_eq!(
            extract_references(markup, resolver),
            extract_references(markup, resolver)
        );
    }

    // === extract_wikilink_occurrences tests ===

    #[test]
    fn returns_byte_positions_of_page_name() {
        let result = extract_wikilink_occurrences("See [[Foo]] here");
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].name, "Foo");
        assert_eq!(result[0].name_start, 6);
        assert_eq!(result[0].name_len, 3);
    }

    #[test]
    fn positions_with_anchor_and_alias() {
        let result = extract_wikilink_occurrences("[[Foo#Sec|Display]]");
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].name_start, 2);
        assert_eq!(result[0].name_len, 3);
    }

    #[test]
    fn positions_after_multibyte_text() {
        let result = extract_wikilink_occurrences("héllo [[Foo]]");
        assert_eq!(result[0].name_start, "héllo [[".len());
    }

    // === rename edit tests ===

    #[test]
    fn rename_preserves_anchor_and_alias() {
        let markup = "[[Foo]] and [[Foo#Sec]] and [[Foo|Alias]]";
        assert_eq!(
            rename_wikilinks(markup, "Foo", "Bar"),
            "[[Bar]] and [[Bar#Sec]] and [[Bar|Alias]]"
        );
    }

    #[test]
    fn rename_is_case_sensitive() {
        assert_eq!(rename_wikilinks("[[foo]] [[Foo]]", "Foo", "Bar"), "[[foo]] [[Bar]]");
    }

    #[test]
    fn rename_skips_code_blocks() {
        let markup = "```\n[[Foo]]\n```\n[[Foo]]";
        assert_eq!(rename_wikilinks(markup, "Foo", "Bar"), "```\n[[Foo]]\n```\n[[Bar]]");
    }

    #[test]
    fn edits_in_reverse_offset_order() {
        let edits = compute_wikilink_rename_edits("[[Foo]] and [[Foo]]", "Foo", "Bar");
        assert_eq!(edits.len(), 2);
        assert!(edits[0].offset > edits[1].offset);
    }

    #[test]
    fn no_edits_for_prefix_match() {
        assert!(compute_wikilink_rename_edits("[[Foobar]]", "Foo", "Bar").is_empty());
    }

    // === titles and markers ===

    #[test]
    fn validates_titles() {
        assert!(validate_title("Page Title").is_ok());
        assert!(validate_title("Ünïcode 页面").is_ok());
        for bad in ["", "   ", " padded", "a|b", "a#b", "[[x]]", "two\nlines", "tick`"] {
            assert!(
                matches!(validate_title(bad), Err(WikiError::InvalidTitle(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn formats_markers() {
        assert_eq!(page_marker("Beta"), "[[Beta]]");
        let marker = FileMarker {
            kind: FileKind::Image,
            file_id: 12,
        };
        assert_eq!(marker.to_string(), "[image:12]");
    }

    #[test]
    fn file_kind_from_mime() {
        assert_eq!(FileKind::from_mime("image/png"), FileKind::Image);
        assert_eq!(FileKind::from_mime("application/pdf"), FileKind::File);
    }

    #[test]
    fn extracts_file_markers_outside_code() {
        let found = extract_file_markers("[image:3] text [file:7] `[file:9]`");
        let markers: Vec<_> = found.iter().map(|o| o.marker.to_string()).collect();
        assert_eq!(markers, vec!["[image:3]", "[file:7]"]);
        assert_eq!(found[0].start, 0);
        assert_eq!(found[0].end, 9);
    }
}

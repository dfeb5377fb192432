//! Line-based reversible patches between two versions of a page body.
//!
//! The patch text is unified-diff style: `@@ -a,b +c,d @@` headers followed by
//! body lines prefixed with ` `, `-` or `+`. Every body line keeps its original
//! terminator, so `\r\n` survives byte-for-byte. A line without a terminator
//! (only possible at the end of a text) is followed by
//! `\ No newline at end of file`.

use similar::algorithms::{diff_slices, Capture, Replace};
use similar::{group_diff_ops, Algorithm, DiffOp, DiffTag};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const CONTEXT_LINES: usize = 3;
const NO_NEWLINE_MARKER: &str = "\\ No newline at end of file";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatchError {
    #[error("malformed patch at line {line}: {reason}")]
    Malformed { line: usize, reason: &'static str },
    #[error("hunk {hunk} does not apply: line {line} differs")]
    Mismatch { hunk: usize, line: usize },
    #[error("hunk {hunk} starts beyond the end of the text")]
    OutOfRange { hunk: usize },
    #[error("hunk {hunk} overlaps the previous hunk")]
    Overlap { hunk: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Context,
    Removed,
    Added,
}

impl LineKind {
    fn prefix(self) -> char {
        match self {
            LineKind::Context => ' ',
            LineKind::Removed => '-',
            LineKind::Added => '+',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HunkLine {
    pub kind: LineKind,
    /// Line text including its terminator, if it had one.
    pub text: String,
}

/// A contiguous block of changes. Starts are 0-based line indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub old_start: usize,
    pub old_len: usize,
    pub new_start: usize,
    pub new_len: usize,
    pub lines: Vec<HunkLine>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Patch {
    hunks: Vec<Hunk>,
}

fn split_lines(text: &str) -> Vec<&str> {
    text.split_inclusive('\n').collect()
}

/// Raw Myers ops merged into replacements. `capture_diff_slices` also runs a
/// compaction pass that can reorder a delete and an insert around an equal
/// run, which leaves the op indices non-monotonic.
fn line_ops(old: &[&str], new: &[&str]) -> Vec<DiffOp> {
    let mut hook = Replace::new(Capture::new());
    if let Err(never) = diff_slices(Algorithm::Myers, &mut hook, old, new) {
        match never {}
    }
    hook.into_inner().into_ops()
}

/// Compute the patch turning `old` into `new`.
///
/// Returns `None` when the texts are identical; callers must not archive a
/// revision in that case. Myers without a deadline, so the same inputs always
/// produce a byte-identical patch.
pub fn compute_patch(old: &str, new: &str) -> Option<Patch> {
    if old == new {
        return None;
    }

    let old_lines = split_lines(old);
    let new_lines = split_lines(new);

    let mut hunks = Vec::new();
    for group in group_diff_ops(line_ops(&old_lines, &new_lines), CONTEXT_LINES) {
        let Some(first) = group.first() else {
            continue;
        };
        let mut lines = Vec::new();
        let mut push = |kind: LineKind, slice: &[&str]| {
            lines.extend(slice.iter().map(|text| HunkLine {
                kind,
                text: (*text).to_string(),
            }));
        };
        for op in &group {
            let (tag, old_range, new_range) = op.as_tag_tuple();
            match tag {
                DiffTag::Equal => push(LineKind::Context, &old_lines[old_range]),
                DiffTag::Delete => push(LineKind::Removed, &old_lines[old_range]),
                DiffTag::Insert => push(LineKind::Added, &new_lines[new_range]),
                DiffTag::Replace => {
                    push(LineKind::Removed, &old_lines[old_range]);
                    push(LineKind::Added, &new_lines[new_range]);
                }
            }
        }
        let (old_len, new_len) = side_lengths(&lines);
        hunks.push(Hunk {
            old_start: first.old_range().start,
            old_len,
            new_start: first.new_range().start,
            new_len,
            lines,
        });
    }

    Some(Patch { hunks })
}

/// Lines a hunk spans on the (old, new) side.
fn side_lengths(lines: &[HunkLine]) -> (usize, usize) {
    lines.iter().fold((0, 0), |(old, new), line| match line.kind {
        LineKind::Context => (old + 1, new + 1),
        LineKind::Removed => (old + 1, new),
        LineKind::Added => (old, new + 1),
    })
}

/// Apply `patch` to `old`. Every context and removed line is checked against
/// `old`; any difference is an error rather than a best-effort merge.
pub fn apply_patch(old: &str, patch: &Patch) -> Result<String, PatchError> {
    let old_lines = split_lines(old);
    let mut out = String::with_capacity(old.len());
    let mut cursor = 0usize;

    for (i, hunk) in patch.hunks.iter().enumerate() {
        if hunk.old_start < cursor {
            return Err(PatchError::Overlap { hunk: i });
        }
        if hunk.old_start > old_lines.len() {
            return Err(PatchError::OutOfRange { hunk: i });
        }
        for line in &old_lines[cursor..hunk.old_start] {
            out.push_str(line);
        }
        cursor = hunk.old_start;

        for line in &hunk.lines {
            match line.kind {
                LineKind::Context | LineKind::Removed => {
                    match old_lines.get(cursor) {
                        Some(existing) if *existing == line.text => {}
                        _ => {
                            return Err(PatchError::Mismatch {
                                hunk: i,
                                line: cursor + 1,
                            })
                        }
                    }
                    if line.kind == LineKind::Context {
                        out.push_str(&line.text);
                    }
                    cursor += 1;
                }
                LineKind::Added => out.push_str(&line.text),
            }
        }
    }

    for line in &old_lines[cursor..] {
        out.push_str(line);
    }
    Ok(out)
}

impl Patch {
    pub fn hunks(&self) -> &[Hunk] {
        &self.hunks
    }

    pub fn is_empty(&self) -> bool {
        self.hunks.is_empty()
    }

    /// (added, removed) line counts.
    pub fn line_stats(&self) -> (usize, usize) {
        self.hunks
            .iter()
            .flat_map(|h| h.lines.iter())
            .fold((0, 0), |(added, removed), line| match line.kind {
                LineKind::Added => (added + 1, removed),
                LineKind::Removed => (added, removed + 1),
                LineKind::Context => (added, removed),
            })
    }

    /// The patch that undoes this one: `apply(new, invert) == old`.
    pub fn invert(&self) -> Patch {
        let hunks = self
            .hunks
            .iter()
            .map(|hunk| {
                let mut lines: Vec<HunkLine> = hunk
                    .lines
                    .iter()
                    .map(|line| HunkLine {
                        kind: match line.kind {
                            LineKind::Context => LineKind::Context,
                            LineKind::Removed => LineKind::Added,
                            LineKind::Added => LineKind::Removed,
                        },
                        text: line.text.clone(),
                    })
                    .collect();
                // Keep removals ahead of additions inside each changed run.
                let mut start = 0;
                while start < lines.len() {
                    if lines[start].kind == LineKind::Context {
                        start += 1;
                        continue;
                    }
                    let end = lines[start..]
                        .iter()
                        .position(|l| l.kind == LineKind::Context)
                        .map_or(lines.len(), |p| start + p);
                    lines[start..end].sort_by_key(|l| l.kind != LineKind::Removed);
                    start = end;
                }
                Hunk {
                    old_start: hunk.new_start,
                    old_len: hunk.new_len,
                    new_start: hunk.old_start,
                    new_len: hunk.old_len,
                    lines,
                }
            })
            .collect();
        Patch { hunks }
    }
}

fn format_range(start: usize, len: usize) -> String {
    let shown = if len == 0 { start } else { start + 1 };
    format!("{},{}", shown, len)
}

impl fmt::Display for Patch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for hunk in &self.hunks {
            writeln!(
                f,
                "@@ -{} +{} @@",
                format_range(hunk.old_start, hunk.old_len),
                format_range(hunk.new_start, hunk.new_len)
            )?;
            for line in &hunk.lines {
                write!(f, "{}{}", line.kind.prefix(), line.text)?;
                if !line.text.ends_with('\n') {
                    writeln!(f)?;
                    writeln!(f, "{}", NO_NEWLINE_MARKER)?;
                }
            }
        }
        Ok(())
    }
}

fn parse_range(text: &str, sign: char, line: usize) -> Result<(usize, usize), PatchError> {
    let malformed = |reason| PatchError::Malformed { line, reason };
    let (start, len) = text
        .strip_prefix(sign)
        .and_then(|r| r.split_once(','))
        .ok_or_else(|| malformed("bad hunk range"))?;
    let start: usize = start.parse().map_err(|_| malformed("bad hunk start"))?;
    let len: usize = len.parse().map_err(|_| malformed("bad hunk length"))?;
    let start = if len == 0 {
        start
    } else {
        start.checked_sub(1).ok_or_else(|| malformed("hunk start must be 1-based"))?
    };
    Ok((start, len))
}

impl FromStr for Patch {
    type Err = PatchError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut hunks: Vec<Hunk> = Vec::new();

        for (idx, raw) in text.split_inclusive('\n').enumerate() {
            let line = idx + 1;
            let malformed = |reason| PatchError::Malformed { line, reason };

            if let Some(header) = raw.strip_prefix("@@ ") {
                let ranges = header
                    .trim_end()
                    .strip_suffix(" @@")
                    .ok_or_else(|| malformed("unterminated hunk header"))?;
                let (old, new) = ranges
                    .split_once(' ')
                    .ok_or_else(|| malformed("bad hunk header"))?;
                let (old_start, old_len) = parse_range(old, '-', line)?;
                let (new_start, new_len) = parse_range(new, '+', line)?;
                hunks.push(Hunk {
                    old_start,
                    old_len,
                    new_start,
                    new_len,
                    lines: Vec::new(),
                });
                continue;
            }

            let hunk = hunks
                .last_mut()
                .ok_or_else(|| malformed("body line before first hunk header"))?;

            if raw.trim_end_matches('\n') == NO_NEWLINE_MARKER {
                let last = hunk
                    .lines
                    .last_mut()
                    .ok_or_else(|| malformed("newline marker without a line"))?;
                if last.text.pop() != Some('\n') {
                    return Err(malformed("newline marker after unterminated line"));
                }
                continue;
            }

            let kind = match raw.as_bytes()[0] {
                b' ' => LineKind::Context,
                b'-' => LineKind::Removed,
                b'+' => LineKind::Added,
                _ => return Err(malformed("unknown line prefix")),
            };
            hunk.lines.push(HunkLine {
                kind,
                text: raw[1..].to_string(),
            });
        }

        for hunk in &hunks {
            if side_lengths(&hunk.lines) != (hunk.old_len, hunk.new_len) {
                return Err(PatchError::Malformed {
                    line: 0,
                    reason: "hunk length does not match its body",
                });
            }
        }

        Ok(Patch { hunks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn round_trip(old: &str, new: &str) {
        let patch = compute_patch(old, new).expect("texts differ");
        assert_eq!(apply_patch(old, &patch).unwrap(), new);
        let reparsed: Patch = patch.to_string().parse().unwrap();
        assert_eq!(reparsed, patch);
        assert_eq!(apply_patch(new, &patch.invert()).unwrap(), old);
    }

    #[test]
    fn identical_texts_produce_no_patch() {
        assert!(compute_patch("same\ntext", "same\ntext").is_none());
        assert!(compute_patch("", "").is_none());
    }

    #[test]
    fn patch_from_empty_body() {
        let patch = compute_patch("", "see [[Beta]]").unwrap();
        assert_eq!(
            patch.to_string(),
            "@@ -0,0 +1,1 @@\n+see [[Beta]]\n\\ No newline at end of file\n"
        );
        round_trip("", "see [[Beta]]");
    }

    #[test]
    fn single_line_change_keeps_context() {
        let old = "one\ntwo\nthree\nfour\nfive\nsix\nseven\n";
        let new = "one\ntwo\nthree\nFOUR\nfive\nsix\nseven\n";
        let patch = compute_patch(old, new).unwrap();
        assert_eq!(
            patch.to_string(),
            "@@ -1,7 +1,7 @@\n one\n two\n three\n-four\n+FOUR\n five\n six\n seven\n"
        );
        round_trip(old, new);
    }

    #[test]
    fn distant_changes_make_separate_hunks() {
        let old: String = (0..30).map(|i| format!("line {i}\n")).collect();
        let new = old.replace("line 2\n", "line two\n").replace("line 27\n", "line twenty-seven\n");
        let patch = compute_patch(&old, &new).unwrap();
        assert_eq!(patch.hunks().len(), 2);
        assert_eq!(patch.line_stats(), (2, 2));
        round_trip(&old, &new);
    }

    #[test]
    fn crlf_line_endings_survive() {
        let old = "a\r\nb\r\nc\r\n";
        let new = "a\r\nB\r\nc\r\n";
        let patch = compute_patch(old, new).unwrap();
        assert!(patch.to_string().contains("-b\r\n+B\r\n"));
        round_trip(old, new);
    }

    #[test]
    fn trailing_newline_change_is_tracked() {
        round_trip("text", "text\n");
        round_trip("text\n", "text");
        round_trip("a\nb", "a\nc");
    }

    #[test]
    fn blank_last_line_against_unterminated_line() {
        let old = "b\n\n";
        let new = "\n\naa";
        let patch = compute_patch(old, new).unwrap();
        let hunk = &patch.hunks()[0];
        assert_eq!((hunk.old_len, hunk.new_len), (2, 3));
        assert!(patch.to_string().ends_with("+aa\n\\ No newline at end of file\n"));
        round_trip(old, new);
    }

    #[test]
    fn unicode_text() {
        round_trip("héllo\nwörld\n", "héllo\nwörld 🌍\n日本語\n");
    }

    #[test]
    fn output_is_deterministic() {
        let old = "x\ny\nz\n";
        let new = "y\nx\nz\nw\n";
        let a = compute_patch(old, new).unwrap().to_string();
        let b = compute_patch(old, new).unwrap().to_string();
        assert_eq!(a, b);
    }

    #[test]
    fn apply_rejects_mismatched_base() {
        let patch = compute_patch("a\nb\nc\n", "a\nB\nc\n").unwrap();
        let err = apply_patch("a\nX\nc\n", &patch).unwrap_err();
        assert!(matches!(err, PatchError::Mismatch { hunk: 0, .. }), "{err:?}");
    }

    #[test]
    fn apply_rejects_hunk_past_end() {
        let patch: Patch = "@@ -5,1 +5,1 @@\n-x\n+y\n".parse().unwrap();
        assert_eq!(
            apply_patch("a\n", &patch).unwrap_err(),
            PatchError::OutOfRange { hunk: 0 }
        );
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("not a patch\n".parse::<Patch>().is_err());
        assert!("@@ -1,2 +1,1 @@\n a\n".parse::<Patch>().is_err());
        assert!("@@ -1,1 +1,1 @@\n?a\n".parse::<Patch>().is_err());
    }

    #[test]
    fn empty_patch_text_is_identity() {
        let patch: Patch = "".parse().unwrap();
        assert!(patch.is_empty());
        assert_eq!(apply_patch("body\n", &patch).unwrap(), "body\n");
    }

    proptest! {
        #[test]
        fn patch_reproduces_target(
            old in "[ab\\n\\ré]{0,40}",
            new in "[ab\\n\\ré]{0,40}",
        ) {
            match compute_patch(&old, &new) {
                None => prop_assert_eq!(&old, &new),
                Some(patch) => {
                    let text = patch.to_string();
                    let reparsed: Patch = text.parse().unwrap();
                    prop_assert_eq!(apply_patch(&old, &reparsed).unwrap(), new.clone());
                    prop_assert_eq!(apply_patch(&new, &patch.invert()).unwrap(), old.clone());
                }
            }
        }
    }
}

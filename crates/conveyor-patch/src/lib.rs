//! Parsing and generation of landing patches.
//!
//! Two patch dialects are accepted from the outside world:
//!
//! - `hg export` style patches with a leading `# <Key> <Value>` header
//!   block (`User`, `Date`, `Node ID`, `Parent`, `Diff Start Line`).
//! - `git format-patch` style patches with an RFC 822-like header block
//!   (`From:`, `Date:`, `Subject:`) followed by the message body, a `---`
//!   separator and the diff.
//!
//! Both parse into the same [`ParsedPatch`] record. The diff portion is
//! carried as raw bytes so CRLF line endings survive verbatim.
//!
//! The grammar is small enough that a hand-written line scanner beats a
//! general-purpose mail parser, so that is what this crate does.

use std::collections::BTreeMap;

use chrono::DateTime;
use thiserror::Error;

/// Header names recognised in the `hg export` dialect.
const EXPORT_HEADER_NAMES: &[&str] = &[
    "User",
    "Date",
    "Node ID",
    "Parent",
    "Diff Start Line",
    "Fail HG Import",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatchError {
    #[error("patch is empty")]
    Empty,
    #[error("patch is missing the author header ({0})")]
    MissingAuthor(&'static str),
    #[error("patch is missing the Date header")]
    MissingDate,
    #[error("patch has an unparsable date: {0}")]
    InvalidDate(String),
    #[error("patch is missing the Subject header")]
    MissingSubject,
    #[error("patch has no diff content")]
    MissingDiff,
}

/// Which dialect a patch was parsed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    HgExport,
    GitFormatPatch,
}

/// The normalised result of parsing either dialect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPatch {
    pub dialect: Dialect,
    pub author_name: String,
    pub author_email: String,
    /// Unix seconds, kept as a string exactly as the VCS wants it.
    pub timestamp: String,
    pub commit_message: String,
    /// Raw diff bytes, line endings preserved verbatim.
    pub diff: Vec<u8>,
    /// The `Diff Start Line` header value, when present (export dialect).
    pub diff_start_line: Option<usize>,
    pub node_id: Option<String>,
    pub parent: Option<String>,
}

impl ParsedPatch {
    /// Parse a patch, detecting the dialect from its first line.
    pub fn parse(patch: &[u8]) -> Result<Self, PatchError> {
        let first = lines_with_endings(patch)
            .next()
            .ok_or(PatchError::Empty)?;
        let first = String::from_utf8_lossy(first);
        if first.starts_with("# ") || first.starts_with("#HG") {
            Self::parse_hg_export(patch)
        } else {
            Self::parse_git_format_patch(patch)
        }
    }

    /// Parse a mail-style `hg export` patch.
    pub fn parse_hg_export(patch: &[u8]) -> Result<Self, PatchError> {
        let lines: Vec<&[u8]> = lines_with_endings(patch).collect();
        if lines.is_empty() {
            return Err(PatchError::Empty);
        }

        // The header block is the leading run of `# `-prefixed lines.
        let mut headers: BTreeMap<String, String> = BTreeMap::new();
        let mut header_end = 0;
        for line in &lines {
            if !line.starts_with(b"# ") {
                break;
            }
            header_end += 1;
            let text = String::from_utf8_lossy(line);
            let text = text.trim_end_matches(['\r', '\n']);
            for name in EXPORT_HEADER_NAMES {
                if let Some(value) = export_header_value(text, name) {
                    headers.insert(name.to_ascii_lowercase(), value.to_string());
                    break;
                }
            }
        }

        // `Diff Start Line` guards against diff hunks being smuggled in via
        // the commit message. An unparsable value is the same as absent.
        let diff_start_line = headers
            .get("diff start line")
            .and_then(|v| v.parse::<usize>().ok());

        // Locate the first diff line. With the header we trust it outright,
        // without it we scan for `diff <a> <b>`. A start line pointing past
        // the end of the patch means there is no diff at all.
        let diff_index = match diff_start_line {
            Some(n) if n >= 1 => (n - 1).min(lines.len()),
            _ => lines
                .iter()
                .position(|line| is_diff_line(line))
                .unwrap_or(lines.len()),
        };

        let message_lines = &lines[header_end.min(diff_index)..diff_index];
        let commit_message = join_trimmed(message_lines);

        let mut diff = Vec::new();
        for line in lines.iter().skip(diff_index) {
            diff.extend_from_slice(line);
        }

        let user = headers
            .get("user")
            .ok_or(PatchError::MissingAuthor("User"))?;
        let (author_name, author_email) = parse_author(user);

        let date = headers.get("date").ok_or(PatchError::MissingDate)?;
        // `Date` is `<unix-seconds> <tz-offset>`; only the seconds survive.
        let seconds = date.split_whitespace().next().unwrap_or_default();
        seconds
            .parse::<i64>()
            .map_err(|_| PatchError::InvalidDate(date.clone()))?;

        Ok(Self {
            dialect: Dialect::HgExport,
            author_name,
            author_email,
            timestamp: seconds.to_string(),
            commit_message,
            diff,
            diff_start_line,
            node_id: headers.get("node id").cloned(),
            parent: headers.get("parent").cloned(),
        })
    }

    /// Parse a `git format-patch` style patch.
    pub fn parse_git_format_patch(patch: &[u8]) -> Result<Self, PatchError> {
        let lines: Vec<&[u8]> = lines_with_endings(patch).collect();
        if lines.is_empty() {
            return Err(PatchError::Empty);
        }

        // Skip the mbox `From <sha> <date>` envelope line if present.
        let mut index = 0;
        if lines[0].starts_with(b"From ") {
            index = 1;
        }

        // RFC 822-ish headers, with folded continuation lines, up to the
        // first blank line.
        let mut headers: BTreeMap<String, String> = BTreeMap::new();
        let mut current: Option<String> = None;
        while index < lines.len() {
            let text = String::from_utf8_lossy(lines[index]);
            let text = text.trim_end_matches(['\r', '\n']);
            if text.is_empty() {
                index += 1;
                break;
            }
            if text.starts_with(' ') || text.starts_with('\t') {
                if let Some(name) = &current
                    && let Some(value) = headers.get_mut(name)
                {
                    value.push(' ');
                    value.push_str(text.trim());
                }
            } else if let Some((name, value)) = text.split_once(':') {
                let name = name.trim().to_ascii_lowercase();
                headers.insert(name.clone(), value.trim().to_string());
                current = Some(name);
            }
            index += 1;
        }

        let from = headers
            .get("from")
            .ok_or(PatchError::MissingAuthor("From"))?;
        let (author_name, author_email) = parse_author(from);

        let date = headers.get("date").ok_or(PatchError::MissingDate)?;
        let timestamp = DateTime::parse_from_rfc2822(date)
            .map_err(|_| PatchError::InvalidDate(date.clone()))?
            .timestamp()
            .to_string();

        let subject = headers.get("subject").ok_or(PatchError::MissingSubject)?;
        let subject = strip_subject_prefix(subject);

        // Body paragraphs run up to the `---` separator; the diff is
        // everything after it, ending before the `-- ` version trailer.
        let mut body_lines: Vec<&[u8]> = Vec::new();
        let mut separator = None;
        for (offset, line) in lines.iter().enumerate().skip(index) {
            if trimmed_line(line) == "---" {
                separator = Some(offset);
                break;
            }
            body_lines.push(line);
        }

        let body = join_trimmed(&body_lines);
        let commit_message = if body.is_empty() {
            subject.to_string()
        } else {
            format!("{subject}\n\n{body}")
        };

        let diff_from = separator.map(|s| s + 1).ok_or(PatchError::MissingDiff)?;
        let mut diff = Vec::new();
        for line in &lines[diff_from..] {
            if trimmed_line(line) == "--" || line.starts_with(b"-- ") {
                break;
            }
            diff.extend_from_slice(line);
        }
        if diff.is_empty() {
            return Err(PatchError::MissingDiff);
        }

        Ok(Self {
            dialect: Dialect::GitFormatPatch,
            author_name,
            author_email,
            timestamp,
            commit_message,
            diff,
            diff_start_line: None,
            node_id: None,
            parent: None,
        })
    }
}

/// Build an `hg export` style patch carrying a `Diff Start Line` header.
///
/// This is the inverse of [`ParsedPatch::parse_hg_export`] for the subset of
/// patches this system itself produces at submission time.
pub fn build_export_patch(
    diff: &[u8],
    author_name: &str,
    author_email: &str,
    commit_message: &str,
    timestamp: &str,
) -> Vec<u8> {
    let message = commit_message.trim();
    let message_lines = message.lines().count().max(1);
    // Four header lines, the message, one separating blank line, then the
    // diff.
    let diff_start_line = 4 + message_lines + 2;

    let mut patch = Vec::new();
    patch.extend_from_slice(b"# HG changeset patch\n");
    patch.extend_from_slice(
        format!(
            "# User {} <{}>\n",
            single_line(author_name),
            single_line(author_email)
        )
        .as_bytes(),
    );
    patch.extend_from_slice(format!("# Date {} +0000\n", single_line(timestamp)).as_bytes());
    patch.extend_from_slice(format!("# Diff Start Line {diff_start_line}\n").as_bytes());
    patch.extend_from_slice(message.as_bytes());
    patch.extend_from_slice(b"\n\n");
    patch.extend_from_slice(diff);
    patch
}

/// Split `Name <email>` into its parts.
///
/// Falls back to deriving a name from the local part of a bare address,
/// mirroring how review services export author strings.
pub fn parse_author(value: &str) -> (String, String) {
    let value = value.trim();
    if let Some(open) = value.find('<') {
        let name = value[..open].trim().trim_matches('"').trim().to_string();
        let rest = &value[open + 1..];
        let email = match rest.find('>') {
            Some(close) => rest[..close].trim().to_string(),
            None => rest.trim().to_string(),
        };
        (name, email)
    } else {
        let name = match value.find('@') {
            Some(at) => value[..at].replace('.', " "),
            None => value.to_string(),
        };
        (name, value.to_string())
    }
}

fn export_header_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let rest = line.strip_prefix('#')?.trim_start();
    let prefix = rest.get(..name.len())?;
    if !prefix.eq_ignore_ascii_case(name) {
        return None;
    }
    let after = rest.get(name.len()..)?;
    // Require whitespace between the header name and its value so that
    // e.g. `Date` does not match a `Dates` header.
    if !after.starts_with(' ') && !after.starts_with('\t') {
        return None;
    }
    let value = after.trim();
    if value.is_empty() { None } else { Some(value) }
}

fn is_diff_line(line: &[u8]) -> bool {
    let text = String::from_utf8_lossy(line);
    let mut parts = text.split_whitespace();
    parts.next() == Some("diff") && parts.next().is_some() && parts.next().is_some()
}

fn strip_subject_prefix(subject: &str) -> &str {
    let subject = subject.trim();
    if subject.starts_with("[PATCH")
        && let Some(close) = subject.find(']')
    {
        return subject[close + 1..].trim_start();
    }
    subject
}

fn single_line(s: &str) -> String {
    s.trim().lines().collect::<Vec<_>>().concat()
}

fn trimmed_line(line: &[u8]) -> String {
    String::from_utf8_lossy(line)
        .trim_end_matches(['\r', '\n'])
        .to_string()
}

fn join_trimmed(lines: &[&[u8]]) -> String {
    let mut joined = Vec::new();
    for line in lines {
        joined.extend_from_slice(line);
    }
    String::from_utf8_lossy(&joined).trim().to_string()
}

/// Iterate over lines keeping their trailing `\n` (and `\r\n`) bytes.
fn lines_with_endings(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut rest = data;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        match rest.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let (line, tail) = rest.split_at(pos + 1);
                rest = tail;
                Some(line)
            }
            None => {
                let line = rest;
                rest = &[];
                Some(line)
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPORT_PATCH: &str = "# HG changeset patch\n\
# User Joe Tester <joe@example.com>\n\
# Date 1496239141 +0000\n\
# Diff Start Line 8\n\
add a feature\n\
\n\
with a longer description\n\
\n\
diff --git a/hello.c b/hello.c\n\
--- a/hello.c\n\
+++ b/hello.c\n\
@@ -1,1 +1,2 @@\n\
 int main() {}\n\
+// touched\n";

    const GIT_PATCH: &str = "From 5cf35b9a9e224bf0a1d6a4d04dbb59f01dd0b7c4 Mon Sep 17 00:00:00 2001\n\
From: Joe Tester <joe@example.com>\n\
Date: Wed, 31 May 2017 14:39:01 +0000\n\
Subject: [PATCH] add a feature\n\
\n\
with a longer description\n\
---\n\
 hello.c | 1 +\n\
 1 file changed, 1 insertion(+)\n\
\n\
diff --git a/hello.c b/hello.c\n\
--- a/hello.c\n\
+++ b/hello.c\n\
@@ -1,1 +1,2 @@\n\
 int main() {}\n\
+// touched\n\
-- \n\
2.31.1\n";

    #[test]
    fn export_patch_parses_all_fields() {
        let patch = ParsedPatch::parse_hg_export(EXPORT_PATCH.as_bytes()).expect("parse");
        assert_eq!(patch.dialect, Dialect::HgExport);
        assert_eq!(patch.author_name, "Joe Tester");
        assert_eq!(patch.author_email, "joe@example.com");
        assert_eq!(patch.timestamp, "1496239141");
        assert_eq!(
            patch.commit_message,
            "add a feature\n\nwith a longer description"
        );
        assert!(patch.diff.starts_with(b"diff --git a/hello.c"));
        assert_eq!(patch.diff_start_line, Some(8));
    }

    #[test]
    fn export_patch_without_start_line_scans_for_diff() {
        let raw = EXPORT_PATCH.replace("# Diff Start Line 8\n", "");
        let patch = ParsedPatch::parse_hg_export(raw.as_bytes()).expect("parse");
        assert_eq!(patch.diff_start_line, None);
        assert_eq!(
            patch.commit_message,
            "add a feature\n\nwith a longer description"
        );
        assert!(patch.diff.starts_with(b"diff --git a/hello.c"));
    }

    #[test]
    fn export_patch_unparsable_start_line_is_treated_as_absent() {
        let raw = EXPORT_PATCH.replace("Diff Start Line 8", "Diff Start Line eight");
        let patch = ParsedPatch::parse_hg_export(raw.as_bytes()).expect("parse");
        assert_eq!(patch.diff_start_line, None);
        assert!(patch.diff.starts_with(b"diff --git a/hello.c"));
    }

    #[test]
    fn export_patch_missing_user_is_fatal() {
        let raw = EXPORT_PATCH.replace("# User Joe Tester <joe@example.com>\n", "");
        let err = ParsedPatch::parse_hg_export(raw.as_bytes()).expect_err("must fail");
        assert_eq!(err, PatchError::MissingAuthor("User"));
    }

    #[test]
    fn export_patch_missing_date_is_fatal() {
        let raw = EXPORT_PATCH.replace("# Date 1496239141 +0000\n", "");
        let err = ParsedPatch::parse_hg_export(raw.as_bytes()).expect_err("must fail");
        assert_eq!(err, PatchError::MissingDate);
    }

    #[test]
    fn export_patch_preserves_crlf_in_diff() {
        let raw = EXPORT_PATCH.replace(" int main() {}\n", " int main() {}\r\n");
        let patch = ParsedPatch::parse_hg_export(raw.as_bytes()).expect("parse");
        let diff = String::from_utf8_lossy(&patch.diff);
        assert!(diff.contains(" int main() {}\r\n"));
    }

    #[test]
    fn git_patch_parses_all_fields() {
        let patch = ParsedPatch::parse_git_format_patch(GIT_PATCH.as_bytes()).expect("parse");
        assert_eq!(patch.dialect, Dialect::GitFormatPatch);
        assert_eq!(patch.author_name, "Joe Tester");
        assert_eq!(patch.author_email, "joe@example.com");
        assert_eq!(patch.timestamp, "1496241541");
        assert_eq!(
            patch.commit_message,
            "add a feature\n\nwith a longer description"
        );
        assert!(patch.diff.ends_with(b"+// touched\n"));
    }

    #[test]
    fn git_patch_subject_prefix_is_stripped() {
        assert_eq!(strip_subject_prefix("[PATCH] fix"), "fix");
        assert_eq!(strip_subject_prefix("[PATCH 2/5] fix"), "fix");
        assert_eq!(strip_subject_prefix("fix"), "fix");
    }

    #[test]
    fn git_patch_trailer_is_excluded_from_diff() {
        let patch = ParsedPatch::parse_git_format_patch(GIT_PATCH.as_bytes()).expect("parse");
        let diff = String::from_utf8_lossy(&patch.diff);
        assert!(!diff.contains("2.31.1"));
        assert!(!diff.contains("-- \n"));
    }

    #[test]
    fn git_patch_missing_from_is_fatal() {
        let raw = GIT_PATCH.replace("From: Joe Tester <joe@example.com>\n", "");
        let err = ParsedPatch::parse_git_format_patch(raw.as_bytes()).expect_err("must fail");
        assert_eq!(err, PatchError::MissingAuthor("From"));
    }

    #[test]
    fn dialect_detection_picks_the_right_parser() {
        assert_eq!(
            ParsedPatch::parse(EXPORT_PATCH.as_bytes())
                .expect("parse")
                .dialect,
            Dialect::HgExport
        );
        assert_eq!(
            ParsedPatch::parse(GIT_PATCH.as_bytes())
                .expect("parse")
                .dialect,
            Dialect::GitFormatPatch
        );
    }

    #[test]
    fn parse_author_handles_quoted_names() {
        let (name, email) = parse_author("\"Joe Tester\" <joe@example.com>");
        assert_eq!(name, "Joe Tester");
        assert_eq!(email, "joe@example.com");
    }

    #[test]
    fn parse_author_falls_back_on_bare_address() {
        let (name, email) = parse_author("joe.tester@example.com");
        assert_eq!(name, "joe tester");
        assert_eq!(email, "joe.tester@example.com");
    }

    #[test]
    fn build_export_patch_round_trips() {
        let diff = b"diff --git a/x b/x\n--- a/x\n+++ b/x\n@@ -1 +1 @@\n-a\n+b\r\n";
        let built = build_export_patch(
            diff,
            "Joe Tester",
            "joe@example.com",
            "one line\n\nand a body",
            "1496239141",
        );
        let parsed = ParsedPatch::parse_hg_export(&built).expect("parse");
        assert_eq!(parsed.author_name, "Joe Tester");
        assert_eq!(parsed.author_email, "joe@example.com");
        assert_eq!(parsed.timestamp, "1496239141");
        assert_eq!(parsed.commit_message, "one line\n\nand a body");
        assert_eq!(parsed.diff, diff);
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        fn message_strategy() -> impl Strategy<Value = String> {
            // Message lines must not look like headers or diff starts.
            proptest::collection::vec("[a-zA-Z][a-zA-Z0-9 ]{0,30}", 1..5)
                .prop_map(|lines| lines.join("\n"))
        }

        fn diff_strategy() -> impl Strategy<Value = Vec<u8>> {
            ("[a-z]{1,8}", any::<bool>()).prop_map(|(path, crlf)| {
                let ending = if crlf { "\r\n" } else { "\n" };
                format!(
                    "diff --git a/{path} b/{path}\n--- a/{path}\n+++ b/{path}\n@@ -1 +1 @@\n-a{ending}+b{ending}"
                )
                .into_bytes()
            })
        }

        proptest! {
            #[test]
            fn export_round_trip_preserves_every_field(
                message in message_strategy(),
                diff in diff_strategy(),
                seconds in 0i64..4_000_000_000,
            ) {
                let built = build_export_patch(
                    &diff,
                    "Joe Tester",
                    "joe@example.com",
                    &message,
                    &seconds.to_string(),
                );
                let parsed = ParsedPatch::parse_hg_export(&built).expect("parse");
                prop_assert_eq!(parsed.author_name, "Joe Tester");
                prop_assert_eq!(parsed.author_email, "joe@example.com");
                prop_assert_eq!(parsed.timestamp, seconds.to_string());
                prop_assert_eq!(parsed.commit_message, message.trim().to_string());
                prop_assert_eq!(parsed.diff, diff);
            }
        }
    }
}

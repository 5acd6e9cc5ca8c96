//! Commit message construction and bug-number extraction.
//!
//! The landed commit message is rebuilt from review metadata rather than
//! trusted from the submitter: `Bug N - Title r=reviewers a=approvers`,
//! the summary, and a link back to the revision.

/// Maximum bug number considered real; larger values are almost always
/// hashes or dates that happen to follow the word "bug".
const MAX_BUG_NUMBER: i64 = 100_000_000;

/// Extract bug numbers using the conservative `bug N` / `b=N` syntax.
///
/// Duplicates are dropped while preserving first-seen order.
pub fn parse_bugs(message: &str) -> Vec<i64> {
    let bytes = message.as_bytes();
    let mut bugs = Vec::new();

    let mut i = 0;
    while i < bytes.len() {
        // A match must start at a word boundary.
        if i > 0 && is_word_byte(bytes[i - 1]) {
            i += 1;
            continue;
        }

        let rest = &message[i..];
        let after_keyword = if rest.len() >= 3 && rest[..3].eq_ignore_ascii_case("bug") {
            let after = &bytes[i + 3..];
            // `bug` must end at a word boundary too.
            if after.first().is_some_and(|&b| is_word_byte(b)) {
                None
            } else {
                Some(i + 3)
            }
        } else if rest.len() >= 2 && rest[..2].eq_ignore_ascii_case("b=") {
            Some(i + 2)
        } else {
            None
        };

        let Some(mut j) = after_keyword else {
            i += 1;
            continue;
        };

        while j < bytes.len() && bytes[j].is_ascii_whitespace() {
            j += 1;
        }
        let digits_start = j;
        while j < bytes.len() && bytes[j].is_ascii_digit() {
            j += 1;
        }
        // The number must end at a word boundary.
        if j > digits_start && !bytes.get(j).is_some_and(|&b| is_word_byte(b))
            && let Ok(bug) = message[digits_start..j].parse::<i64>()
            && bug < MAX_BUG_NUMBER
            && !bugs.contains(&bug)
        {
            bugs.push(bug);
        }
        i = j.max(i + 1);
    }

    bugs
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Build the commit message for a landing.
///
/// Returns `(first_line, full_message)`. Pieces already present in the
/// title (a bug number up front, a reviewer specifier) are not added a
/// second time.
pub fn format_commit_message(
    title: &str,
    bug: Option<i64>,
    reviewers: &[String],
    approvals: &[String],
    summary: &str,
    revision_url: &str,
    flags: &[String],
) -> (String, String) {
    let mut first_line = String::new();

    if let Some(bug) = bug
        && !parse_bugs(title).contains(&bug)
    {
        first_line.push_str(&format!("Bug {bug} - "));
    }
    first_line.push_str(title.trim());

    if !reviewers.is_empty() && !has_reviewer_specifier(title) {
        first_line.push_str(" r=");
        first_line.push_str(&reviewers.join(","));
    }
    if !approvals.is_empty() {
        first_line.push_str(" a=");
        first_line.push_str(&approvals.join(","));
    }
    for flag in flags {
        first_line.push(' ');
        first_line.push_str(flag);
    }

    let mut message = first_line.clone();
    let summary = summary.trim();
    if !summary.is_empty() {
        message.push_str("\n\n");
        message.push_str(summary);
    }
    message.push_str("\n\nDifferential Revision: ");
    message.push_str(revision_url);

    (first_line, message)
}

/// Whether the title already carries an `r=` / `a=` style specifier.
fn has_reviewer_specifier(title: &str) -> bool {
    let bytes = title.as_bytes();
    for (i, window) in bytes.windows(2).enumerate() {
        let boundary = i == 0 || !is_word_byte(bytes[i - 1]);
        if !boundary {
            continue;
        }
        if (window[0] == b'r' || window[0] == b'a') && (window[1] == b'=' || window[1] == b'?') {
            return true;
        }
    }
    false
}

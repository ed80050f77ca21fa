//! Structured decomposition of recognized notes

use serde::{Deserialize, Serialize};

/// Title and sections recovered from note text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredNote {
    pub title: Option<String>,
    pub sections: Vec<NoteSection>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteSection {
    pub heading: String,
    pub content: String,
}

/// Longest line still treated as a `Heading:` label
const MAX_LABEL_LEN: usize = 48;

/// Split `text` into a title and headed sections
///
/// A leading `# ` line is the title. `## ` and `### ` lines, and short lines
/// ending in `:`, open a new section. Returns `None` when neither a title nor
/// any section is found.
pub fn extract_structure(text: &str) -> Option<StructuredNote> {
    let mut title = None;
    let mut sections: Vec<NoteSection> = Vec::new();
    let mut body: Vec<&str> = Vec::new();

    for line in text.lines().map(str::trim) {
        if let Some(heading) = heading_of(line) {
            close_section(&mut sections, &mut body);
            sections.push(NoteSection {
                heading: heading.to_string(),
                content: String::new(),
            });
        } else if let Some(text) = line.strip_prefix("# ") {
            if title.is_none() && sections.is_empty() {
                title = Some(text.trim().to_string());
            } else {
                body.push(line);
            }
        } else if !line.is_empty() && !sections.is_empty() {
            body.push(line);
        }
    }
    close_section(&mut sections, &mut body);

    if title.is_none() && sections.is_empty() {
        return None;
    }
    Some(StructuredNote { title, sections })
}

fn heading_of(line: &str) -> Option<&str> {
    if let Some(rest) = line
        .strip_prefix("### ")
        .or_else(|| line.strip_prefix("## "))
    {
        let rest = rest.trim();
        return (!rest.is_empty()).then_some(rest);
    }
    let label = line.strip_suffix(':')?.trim();
    let is_label = !label.is_empty()
        && label.len() <= MAX_LABEL_LEN
        && !label.starts_with('#')
        && !label.ends_with(':');
    is_label.then_some(label)
}

fn close_section(sections: &mut [NoteSection], body: &mut Vec<&str>) {
    if let Some(last) = sections.last_mut() {
        last.content = body.join("\n");
    }
    body.clear();
}

//! Heading-bounded chunking of Markdown memory files.

/// A slice of a file between two headings, before tokenization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChunk {
    pub ordinal: usize,
    /// Titles of the enclosing headings, outermost first.
    pub heading_path: Vec<String>,
    pub text: String,
    /// 1-based, inclusive.
    pub start_line: usize,
    pub end_line: usize,
}

/// Split `content` at ATX headings. Each chunk starts at its heading line;
/// text before the first heading gets an empty heading path. Headings inside
/// fenced code blocks do not split.
pub fn chunk_markdown(content: &str) -> Vec<RawChunk> {
    let mut chunks = Vec::new();
    let mut stack: Vec<(usize, String)> = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_path: Vec<String> = Vec::new();
    let mut current_start = 1;
    let mut fence: Option<&str> = None;

    for (idx, line) in content.lines().enumerate() {
        let line_no = idx + 1;
        let heading = if fence.is_none() { parse_heading(line) } else { None };
        fence = toggle_fence(line, fence);

        if let Some((level, title)) = heading {
            flush(&mut chunks, &current, &current_path, current_start);
            while stack.last().is_some_and(|(l, _)| *l >= level) {
                stack.pop();
            }
            stack.push((level, title));
            current_path = stack.iter().map(|(_, t)| t.clone()).collect();
            current.clear();
            current_start = line_no;
        }
        current.push(line);
    }
    flush(&mut chunks, &current, &current_path, current_start);
    chunks
}

fn flush(chunks: &mut Vec<RawChunk>, lines: &[&str], path: &[String], start_line: usize) {
    if lines.iter().all(|l| l.trim().is_empty()) {
        return;
    }
    chunks.push(RawChunk {
        ordinal: chunks.len(),
        heading_path: path.to_vec(),
        text: lines.join("\n"),
        start_line,
        end_line: start_line + lines.len() - 1,
    });
}

/// `Some((level, title))` for an ATX heading line.
fn parse_heading(line: &str) -> Option<(usize, String)> {
    let indent = line.len() - line.trim_start_matches(' ').len();
    if indent > 3 {
        return None;
    }
    let rest = &line[indent..];
    let level = rest.chars().take_while(|c| *c == '#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let after = &rest[level..];
    if !after.is_empty() && !after.starts_with([' ', '\t']) {
        return None;
    }
    let title = after.trim();
    let title = title.trim_end_matches('#').trim_end();
    Some((level, title.to_string()))
}

fn toggle_fence<'a>(line: &'a str, open: Option<&'a str>) -> Option<&'a str> {
    let trimmed = line.trim_start();
    let marker = if trimmed.starts_with("```") {
        "```"
    } else if trimmed.starts_with("~~~") {
        "~~~"
    } else {
        return open;
    };
    match open {
        None => Some(marker),
        Some(m) if m == marker => None,
        Some(m) => Some(m),
    }
}

//! Source normalization applied before hashing.
//!
//! Comments are dropped and runs of whitespace collapse to at most one space.
//! A space survives only where removing it could merge two tokens: between two
//! word characters, or between two operator characters. String, raw string,
//! and character literals are copied verbatim.

const OPERATOR_CHARS: &str = "+-*/%<>=!&|^~:.?";

#[must_use]
pub fn normalize_source(source: &str) -> String {
    let chars = source.chars().collect::<Vec<_>>();
    let mut out = String::with_capacity(source.len());
    let mut pending_space = false;
    let mut index = 0;

    while let Some(&ch) = chars.get(index) {
        let next = chars.get(index + 1).copied();
        match ch {
            '/' if next == Some('/') => {
                while chars.get(index).is_some_and(|&c| c != '\n') {
                    index += 1;
                }
                pending_space = true;
            }
            '/' if next == Some('*') => {
                index = skip_block_comment(&chars, index);
                pending_space = true;
            }
            '"' => {
                separate(&mut out, &mut pending_space, ch);
                index = copy_string_literal(&chars, index, &mut out);
            }
            'r' if raw_string_hashes(&chars, index).is_some() => {
                separate(&mut out, &mut pending_space, ch);
                let hashes = raw_string_hashes(&chars, index).unwrap_or_default();
                index = copy_raw_string_literal(&chars, index, hashes, &mut out);
            }
            '\'' if is_char_literal(&chars, index) => {
                separate(&mut out, &mut pending_space, ch);
                index = copy_char_literal(&chars, index, &mut out);
            }
            c if c.is_whitespace() => {
                pending_space = true;
                index += 1;
            }
            c => {
                separate(&mut out, &mut pending_space, c);
                out.push(c);
                index += 1;
            }
        }
    }

    out
}

fn is_word(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '_'
}

fn is_operator(ch: char) -> bool {
    OPERATOR_CHARS.contains(ch)
}

fn separate(out: &mut String, pending_space: &mut bool, next: char) {
    if std::mem::take(pending_space) {
        if let Some(prev) = out.chars().next_back() {
            if (is_word(prev) && is_word(next)) || (is_operator(prev) && is_operator(next)) {
                out.push(' ');
            }
        }
    }
}

/// Returns the index just past the comment. Block comments nest.
fn skip_block_comment(chars: &[char], start: usize) -> usize {
    let mut depth = 0_usize;
    let mut index = start;
    while let Some(&ch) = chars.get(index) {
        let next = chars.get(index + 1).copied();
        if ch == '/' && next == Some('*') {
            depth += 1;
            index += 2;
        } else if ch == '*' && next == Some('/') {
            depth -= 1;
            index += 2;
            if depth == 0 {
                return index;
            }
        } else {
            index += 1;
        }
    }
    index
}

fn copy_string_literal(chars: &[char], start: usize, out: &mut String) -> usize {
    out.push('"');
    let mut index = start + 1;
    while let Some(&ch) = chars.get(index) {
        out.push(ch);
        index += 1;
        match ch {
            '\\' => {
                if let Some(&escaped) = chars.get(index) {
                    out.push(escaped);
                    index += 1;
                }
            }
            '"' => return index,
            _ => {}
        }
    }
    index
}

/// Number of `#` guards when a raw string literal (`r"..."`, `r#"..."#`,
/// `br"..."`) opens at `start`.
fn raw_string_hashes(chars: &[char], start: usize) -> Option<usize> {
    let before = start.checked_sub(1).and_then(|prev| chars.get(prev)).copied();
    let starts_token = match before {
        None => true,
        Some('b') => !matches!(start.checked_sub(2).and_then(|prev| chars.get(prev)), Some(&c) if is_word(c)),
        Some(c) => !is_word(c),
    };
    if !starts_token {
        return None;
    }
    let hashes = chars.iter().skip(start + 1).take_while(|&&c| c == '#').count();
    (chars.get(start + 1 + hashes) == Some(&'"')).then_some(hashes)
}

fn copy_raw_string_literal(chars: &[char], start: usize, hashes: usize, out: &mut String) -> usize {
    let body = start + hashes + 2;
    out.extend(chars.iter().take(body).skip(start));
    let mut index = body;
    while let Some(&ch) = chars.get(index) {
        out.push(ch);
        index += 1;
        if ch == '"' && chars.iter().skip(index).take(hashes).filter(|&&c| c == '#').count() == hashes {
            out.push_str(&"#".repeat(hashes));
            return index + hashes;
        }
    }
    index
}

fn is_char_literal(chars: &[char], start: usize) -> bool {
    match chars.get(start + 1) {
        Some('\\') => true,
        Some(_) => chars.get(start + 2) == Some(&'\''),
        None => false,
    }
}

fn copy_char_literal(chars: &[char], start: usize, out: &mut String) -> usize {
    out.push('\'');
    let mut index = start + 1;
    while let Some(&ch) = chars.get(index) {
        out.push(ch);
        index += 1;
        match ch {
            '\\' => {
                if let Some(&escaped) = chars.get(index) {
                    out.push(escaped);
                    index += 1;
                }
            }
            '\'' => return index,
            _ => {}
        }
    }
    index
}

//! Terminal-safe rendering of compiler and make output.
//!
//! clang colors its diagnostics when forced to (`-fcolor-diagnostics` is common
//! in kernel toolchain wrappers), and `make` output can carry stray control
//! bytes from generated headers. Everything the tool echoes back to the user
//! goes through [`sanitize_line`] first.

const MAX_LINE_CHARS: usize = 2048;

#[derive(Clone, Copy)]
enum Escape {
    Start,
    Csi,
    Osc,
    OscEsc,
}

pub fn sanitize_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LINE_CHARS));
    let mut escape: Option<Escape> = None;
    let mut kept = 0usize;

    for c in input.chars() {
        if let Some(state) = escape {
            escape = match (state, c) {
                (Escape::Start, '[') => Some(Escape::Csi),
                (Escape::Start, ']') => Some(Escape::Osc),
                (Escape::Start, _) => None,
                (Escape::Csi, '@'..='~') => None,
                (Escape::Csi, _) => Some(Escape::Csi),
                (Escape::Osc, '\x07') => None,
                (Escape::Osc, '\x1b') => Some(Escape::OscEsc),
                (Escape::Osc, _) => Some(Escape::Osc),
                (Escape::OscEsc, '\\') => None,
                (Escape::OscEsc, _) => Some(Escape::Osc),
            };
            continue;
        }

        match c {
            '\x1b' => {
                escape = Some(Escape::Start);
                continue;
            }
            '\t' => out.push(' '),
            c if c.is_control() || is_bidi_control(c) => continue,
            c => out.push(c),
        }
        kept += 1;
        if kept >= MAX_LINE_CHARS {
            out.push_str(" ...[truncated]");
            break;
        }
    }

    out
}

/// Last `n` non-empty lines of captured output, sanitized.
pub fn tail_lines(text: &str, n: usize) -> Vec<String> {
    let mut lines: Vec<String> = text
        .lines()
        .rev()
        .map(sanitize_line)
        .filter(|l| !l.trim().is_empty())
        .take(n)
        .collect();
    lines.reverse();
    lines
}

fn is_bidi_control(c: char) -> bool {
    matches!(c, '\u{061C}' | '\u{200E}' | '\u{200F}')
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}

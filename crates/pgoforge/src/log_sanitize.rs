//! Strips terminal escape sequences and control characters from builder output
//! before it reaches the sink or an error log.

use std::iter::Peekable;
use std::str::Chars;

const MAX_LINE_CHARS: usize = 4096;
const ESC: char = '\x1b';
const BEL: char = '\x07';

/// Skips one escape sequence; the leading ESC is already consumed.
fn skip_escape(chars: &mut Peekable<Chars<'_>>) {
    match chars.next() {
        // CSI: parameters then a final byte in '@'..='~'.
        Some('[') => {
            for c in chars.by_ref() {
                if ('@'..='~').contains(&c) {
                    break;
                }
            }
        }
        // OSC ends with BEL or ST; DCS/SOS/PM/APC only with ST.
        Some(intro @ (']' | 'P' | 'X' | '^' | '_')) => {
            while let Some(c) = chars.next() {
                if intro == ']' && c == BEL {
                    break;
                }
                if c == ESC && chars.peek() == Some(&'\\') {
                    chars.next();
                    break;
                }
            }
        }
        _ => {}
    }
}

fn is_invisible_format(c: char) -> bool {
    matches!(
        c,
        '\u{200B}'..='\u{200F}' | '\u{202A}'..='\u{202E}' | '\u{2060}'..='\u{2064}' | '\u{2066}'..='\u{2069}' | '\u{FEFF}'
    )
}

pub fn sanitize_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LINE_CHARS));
    let mut kept = 0usize;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        let mapped = match c {
            ESC => {
                skip_escape(&mut chars);
                continue;
            }
            '\t' => ' ',
            '\r' | '\n' => continue,
            c if c.is_control() || is_invisible_format(c) => continue,
            c => c,
        };
        if kept == MAX_LINE_CHARS {
            out.push_str(" [truncated]");
            break;
        }
        out.push(mapped);
        kept += 1;
    }
    out
}

//! Shell-style glob patterns (`*`, `?`, `[...]`), matched case-insensitively.

use regex::Regex;

#[derive(Debug, Clone)]
pub struct GlobPattern {
    raw: String,
    regex: Regex,
}

impl GlobPattern {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let regex = Regex::new(&glob_to_regex(pattern))?;
        Ok(Self {
            raw: pattern.to_string(),
            regex,
        })
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl PartialEq for GlobPattern {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() * 2 + 8);
    out.push_str("(?is)^");

    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => match chars[i + 1..].iter().position(|&c| c == ']') {
                // `[]` is treated literally, like an unterminated class.
                Some(end) if end > 0 => {
                    let body = &chars[i + 1..i + 1 + end];
                    out.push('[');
                    for (n, &c) in body.iter().enumerate() {
                        match c {
                            '!' if n == 0 => out.push('^'),
                            '-' if n > 0 && n + 1 < body.len() => out.push('-'),
                            other => out.push_str(&regex::escape(&other.to_string())),
                        }
                    }
                    out.push(']');
                    i += end + 1;
                }
                _ => out.push_str(r"\["),
            },
            other => out.push_str(&regex::escape(&other.to_string())),
        }
        i += 1;
    }

    out.push('$');
    out
}

//! Ordered glob filter for bulk runs.
//!
//! Pattern tokens: `?` matches a single non-slash character, `*` a run of
//! zero or more non-slash characters, `**` zero or more characters
//! including slashes; everything else is literal. So `**.log` matches
//! `a/b/c.log` while `*.log` does not.

/// One compiled pattern element.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(char),
    AnyChar,
    Star,
    DoubleStar,
}

/// A compiled glob pattern.
#[derive(Debug, Clone)]
pub struct Pattern {
    raw: String,
    tokens: Vec<Token>,
}

impl Pattern {
    pub fn new(pattern: &str) -> Self {
        let mut tokens = Vec::new();
        let mut chars = pattern.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '*' => {
                    if chars.peek() == Some(&'*') {
                        chars.next();
                        tokens.push(Token::DoubleStar);
                    } else {
                        tokens.push(Token::Star);
                    }
                }
                '?' => tokens.push(Token::AnyChar),
                other => tokens.push(Token::Literal(other)),
            }
        }
        Self {
            raw: pattern.to_string(),
            tokens,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether the whole of `path` matches this pattern.
    pub fn matches(&self, path: &str) -> bool {
        let chars: Vec<char> = path.chars().collect();
        match_at(&self.tokens, &chars)
    }
}

fn match_at(tokens: &[Token], chars: &[char]) -> bool {
    match tokens.first() {
        None => chars.is_empty(),
        Some(Token::Literal(l)) => match chars.split_first() {
            Some((c, rest)) if c == l => match_at(&tokens[1..], rest),
            _ => false,
        },
        Some(Token::AnyChar) => match chars.split_first() {
            Some((c, rest)) if *c != '/' => match_at(&tokens[1..], rest),
            _ => false,
        },
        Some(Token::Star) => {
            // zero-width first, then consume one non-slash char at a time
            if match_at(&tokens[1..], chars) {
                return true;
            }
            match chars.split_first() {
                Some((c, rest)) if *c != '/' => match_at(tokens, rest),
                _ => false,
            }
        }
        Some(Token::DoubleStar) => {
            if match_at(&tokens[1..], chars) {
                return true;
            }
            match chars.split_first() {
                Some((_, rest)) => match_at(tokens, rest),
                None => false,
            }
        }
    }
}

/// The `--only` / `--exclude` filter applied during enumeration. A path is
/// kept iff it matches no exclude pattern and, when the only-list is
/// non-empty, at least one only pattern.
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    only: Vec<Pattern>,
    exclude: Vec<Pattern>,
}

impl PathFilter {
    pub fn new(only: &[String], exclude: &[String]) -> Self {
        Self {
            only: only.iter().map(|p| Pattern::new(p)).collect(),
            exclude: exclude.iter().map(|p| Pattern::new(p)).collect(),
        }
    }

    pub fn keep(&self, path: &str) -> bool {
        if self.exclude.iter().any(|p| p.matches(path)) {
            return false;
        }
        self.only.is_empty() || self.only.iter().any(|p| p.matches(path))
    }
}

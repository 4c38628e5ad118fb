//! Wildcard patterns: NoSQL `*` search values and SQL `LIKE`.

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(char),
    /// Any run of characters, including none.
    Many,
    /// Exactly one character.
    One,
}

/// A compiled wildcard pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    tokens: Vec<Token>,
}

impl Pattern {
    /// Compiles a NoSQL search value where `*` matches any run of characters.
    ///
    /// Consecutive `*` collapse into one, so `***abc` behaves like `*abc`.
    pub fn search(value: &str) -> Self {
        Self::compile(value, '*', None, None)
    }

    /// Compiles a SQL `LIKE` pattern (`%` and `_`, with an optional escape).
    pub fn like(pattern: &str, escape: Option<char>) -> Self {
        Self::compile(pattern, '%', Some('_'), escape)
    }

    fn compile(pattern: &str, many: char, one: Option<char>, escape: Option<char>) -> Self {
        let mut tokens = Vec::with_capacity(pattern.len());
        let mut chars = pattern.chars();
        while let Some(c) = chars.next() {
            if Some(c) == escape {
                if let Some(next) = chars.next() {
                    tokens.push(Token::Literal(next));
                }
                continue;
            }
            if c == many {
                if tokens.last() != Some(&Token::Many) {
                    tokens.push(Token::Many);
                }
            } else if Some(c) == one {
                tokens.push(Token::One);
            } else {
                tokens.push(Token::Literal(c));
            }
        }
        Self { tokens }
    }

    /// Returns true when the pattern contains no wildcard at all.
    pub fn is_literal(&self) -> bool {
        self.tokens.iter().all(|t| matches!(t, Token::Literal(_)))
    }

    /// Returns true when the pattern matches everything.
    pub fn matches_all(&self) -> bool {
        self.tokens == [Token::Many]
    }

    pub fn matches(&self, text: &str) -> bool {
        let text: Vec<char> = text.chars().collect();
        let (mut t, mut p) = (0usize, 0usize);
        // Position of the last `Many` and the text index it was tried at.
        let mut backtrack: Option<(usize, usize)> = None;

        while t < text.len() {
            match self.tokens.get(p) {
                Some(Token::Literal(c)) if *c == text[t] => {
                    t += 1;
                    p += 1;
                }
                Some(Token::One) => {
                    t += 1;
                    p += 1;
                }
                Some(Token::Many) => {
                    backtrack = Some((p, t));
                    p += 1;
                }
                _ => match backtrack {
                    Some((star, start)) => {
                        p = star + 1;
                        t = start + 1;
                        backtrack = Some((star, start + 1));
                    }
                    None => return false,
                },
            }
        }
        self.tokens[p..].iter().all(|tok| *tok == Token::Many)
    }
}

//! Tokenizer for condition expressions
//!
//! Recognizes the whitelisted grammar plus the tokens of constructs that are
//! deliberately rejected (attribute access, calls, assignment, ...), so the
//! parser can report those as unsafe instead of as syntax errors.

use super::ExprError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Name(String),
    True,
    False,
    None,
    And,
    Or,
    Not,
    In,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    /// Operator or punctuation outside the whitelist (`.`, `=`, `**`, `:`...)
    Forbidden(String),
    /// Keyword outside the whitelist (`lambda`, `if`, `import`...)
    ForbiddenKeyword(String),
}

/// Token with its byte offset in the source
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub pos: usize,
}

const FORBIDDEN_KEYWORDS: &[&str] = &[
    "lambda", "if", "else", "elif", "for", "while", "is", "import", "from", "as", "yield",
    "await", "async", "def", "class", "del", "global", "nonlocal", "return", "with", "assert",
    "raise", "try", "except", "finally", "pass", "break", "continue",
];

/// Multi-character operators, longest first
const OPERATORS: &[&str] = &[
    "**=", "//=", ">>=", "<<=", "==", "!=", "<=", ">=", "**", "//", "<<", ">>", ":=", "->",
    "+=", "-=", "*=", "/=", "%=", "&=", "|=", "^=", "@=",
];

pub fn tokenize(source: &str) -> Result<Vec<Spanned>, ExprError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let Some(c) = source[i..].chars().next() else {
            break;
        };

        if c.is_whitespace() {
            i += c.len_utf8();
            continue;
        }

        let start = i;

        if c.is_ascii_digit() || (c == '.' && bytes.get(i + 1).is_some_and(u8::is_ascii_digit)) {
            let (token, len) = lex_number(&source[i..], start)?;
            tokens.push(Spanned { token, pos: start });
            i += len;
            continue;
        }

        if c == '\'' || c == '"' {
            let (text, len) = lex_string(&source[i..], start)?;
            tokens.push(Spanned {
                token: Token::Str(text),
                pos: start,
            });
            i += len;
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' {
            let len = source[i..]
                .find(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_'))
                .unwrap_or(source.len() - i);
            let word = &source[i..i + len];
            tokens.push(Spanned {
                token: keyword_or_name(word),
                pos: start,
            });
            i += len;
            continue;
        }

        if let Some(op) = OPERATORS.iter().find(|op| source[i..].starts_with(**op)) {
            let token = match *op {
                "==" => Token::EqEq,
                "!=" => Token::NotEq,
                "<=" => Token::LtE,
                ">=" => Token::GtE,
                other => Token::Forbidden(other.to_string()),
            };
            tokens.push(Spanned { token, pos: start });
            i += op.len();
            continue;
        }

        let token = match c {
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' => Token::Star,
            '/' => Token::Slash,
            '%' => Token::Percent,
            '<' => Token::Lt,
            '>' => Token::Gt,
            '(' => Token::LParen,
            ')' => Token::RParen,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            '{' => Token::LBrace,
            '}' => Token::RBrace,
            ',' => Token::Comma,
            '.' | '=' | ':' | '&' | '|' | '^' | '~' | '@' | ';' => Token::Forbidden(c.to_string()),
            other => {
                return Err(ExprError::Syntax {
                    message: format!("unexpected character '{other}'"),
                    position: start,
                })
            }
        };
        tokens.push(Spanned { token, pos: start });
        i += c.len_utf8();
    }

    Ok(tokens)
}

fn keyword_or_name(word: &str) -> Token {
    match word {
        "and" => Token::And,
        "or" => Token::Or,
        "not" => Token::Not,
        "in" => Token::In,
        "True" | "true" => Token::True,
        "False" | "false" => Token::False,
        "None" | "none" | "null" => Token::None,
        w if FORBIDDEN_KEYWORDS.contains(&w) => Token::ForbiddenKeyword(w.to_string()),
        w => Token::Name(w.to_string()),
    }
}

fn lex_number(rest: &str, start: usize) -> Result<(Token, usize), ExprError> {
    let bytes = rest.as_bytes();
    let mut len = 0;
    let mut is_float = false;

    while len < bytes.len() && bytes[len].is_ascii_digit() {
        len += 1;
    }
    if len < bytes.len() && bytes[len] == b'.' {
        is_float = true;
        len += 1;
        while len < bytes.len() && bytes[len].is_ascii_digit() {
            len += 1;
        }
    }
    if len < bytes.len() && (bytes[len] == b'e' || bytes[len] == b'E') {
        let mut exp = len + 1;
        if exp < bytes.len() && (bytes[exp] == b'+' || bytes[exp] == b'-') {
            exp += 1;
        }
        if exp < bytes.len() && bytes[exp].is_ascii_digit() {
            is_float = true;
            len = exp;
            while len < bytes.len() && bytes[len].is_ascii_digit() {
                len += 1;
            }
        }
    }

    let text = &rest[..len];
    let invalid = || ExprError::Syntax {
        message: format!("invalid number literal '{text}'"),
        position: start,
    };

    if bytes
        .get(len)
        .is_some_and(|b| b.is_ascii_alphabetic() || *b == b'_')
    {
        return Err(ExprError::Syntax {
            message: format!("invalid number literal '{}'", &rest[..=len]),
            position: start,
        });
    }

    let token = if is_float {
        Token::Float(text.parse().map_err(|_| invalid())?)
    } else {
        match text.parse::<i64>() {
            Ok(i) => Token::Int(i),
            Err(_) => Token::Float(text.parse().map_err(|_| invalid())?),
        }
    };
    Ok((token, len))
}

fn lex_string(rest: &str, start: usize) -> Result<(String, usize), ExprError> {
    let mut chars = rest.char_indices();
    let quote = match chars.next() {
        Some((_, q)) => q,
        None => {
            return Err(ExprError::Syntax {
                message: "expected string literal".to_string(),
                position: start,
            })
        }
    };

    let mut out = String::new();
    while let Some((idx, ch)) = chars.next() {
        match ch {
            c if c == quote => return Ok((out, idx + c.len_utf8())),
            '\\' => match chars.next() {
                Some((_, 'n')) => out.push('\n'),
                Some((_, 't')) => out.push('\t'),
                Some((_, 'r')) => out.push('\r'),
                Some((_, '0')) => out.push('\0'),
                Some((_, other)) => out.push(other),
                None => break,
            },
            c => out.push(c),
        }
    }

    Err(ExprError::Syntax {
        message: "unterminated string literal".to_string(),
        position: start,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<Token> {
        tokenize(src).unwrap().into_iter().map(|s| s.token).collect()
    }

    #[test]
    fn test_comparison_tokens() {
        assert_eq!(
            kinds("value >= 10.5"),
            vec![Token::Name("value".into()), Token::GtE, Token::Float(10.5)]
        );
        assert_eq!(
            kinds("state != 'IDLE'"),
            vec![Token::Name("state".into()), Token::NotEq, Token::Str("IDLE".into())]
        );
    }

    #[test]
    fn test_keywords() {
        assert_eq!(
            kinds("not x in [1]"),
            vec![
                Token::Not,
                Token::Name("x".into()),
                Token::In,
                Token::LBracket,
                Token::Int(1),
                Token::RBracket
            ]
        );
        assert_eq!(kinds("lambda"), vec![Token::ForbiddenKeyword("lambda".into())]);
    }

    #[test]
    fn test_forbidden_operators() {
        assert_eq!(
            kinds("a.b"),
            vec![
                Token::Name("a".into()),
                Token::Forbidden(".".into()),
                Token::Name("b".into())
            ]
        );
        assert_eq!(kinds("2 ** 8")[1], Token::Forbidden("**".into()));
        assert_eq!(kinds("x = 1")[1], Token::Forbidden("=".into()));
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(kinds(r#""a\"b""#), vec![Token::Str("a\"b".into())]);
    }

    #[test]
    fn test_lex_errors() {
        assert!(matches!(tokenize("'open"), Err(ExprError::Syntax { .. })));
        assert!(matches!(tokenize("x $ y"), Err(ExprError::Syntax { position: 2, .. })));
        assert!(matches!(tokenize("12abc"), Err(ExprError::Syntax { .. })));
    }
}

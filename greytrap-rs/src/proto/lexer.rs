//! Tokeniser for the message protocol.

use crate::error::{GreytrapError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Name(String),
    Str(String),
    Int(i64),
    Eq,
    Comma,
    SquareOpen,
    SquareClose,
    BraceOpen,
    BraceClose,
    Semi,
    Eol,
    /// `%` on its own: end of message.
    End,
    Section,
    Include,
    Blacklist,
    Whitelist,
    Plugin,
    Eof,
}

pub struct Lexer<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Lexer {
            input: input.as_bytes(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    pub fn next_token(&mut self) -> Result<Token> {
        loop {
            match self.peek() {
                None => return Ok(Token::Eof),
                Some(b' ') | Some(b'\t') | Some(b'\r') => {
                    self.bump();
                }
                Some(b'#') => {
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                Some(b'\n') => {
                    self.bump();
                    return Ok(Token::Eol);
                }
                Some(b'%') => {
                    self.bump();
                    return Ok(Token::End);
                }
                Some(b'=') => {
                    self.bump();
                    return Ok(Token::Eq);
                }
                Some(b',') => {
                    self.bump();
                    return Ok(Token::Comma);
                }
                Some(b'[') => {
                    self.bump();
                    return Ok(Token::SquareOpen);
                }
                Some(b']') => {
                    self.bump();
                    return Ok(Token::SquareClose);
                }
                Some(b'{') => {
                    self.bump();
                    return Ok(Token::BraceOpen);
                }
                Some(b'}') => {
                    self.bump();
                    return Ok(Token::BraceClose);
                }
                Some(b';') => {
                    self.bump();
                    return Ok(Token::Semi);
                }
                Some(b'"') => return self.scan_string(),
                Some(c) if c.is_ascii_digit() || c == b'-' => return self.scan_int(),
                Some(c) if c.is_ascii_alphabetic() || c == b'_' => return self.scan_name(),
                Some(c) => {
                    return Err(GreytrapError::Proto(format!(
                        "unexpected character '{}'",
                        c as char
                    )))
                }
            }
        }
    }

    fn scan_string(&mut self) -> Result<Token> {
        self.bump();
        let mut out = String::new();

        loop {
            match self.bump() {
                None | Some(b'\n') => {
                    return Err(GreytrapError::Proto("unterminated string".to_string()))
                }
                Some(b'"') => return Ok(Token::Str(out)),
                Some(b'\\') => match self.bump() {
                    Some(b'\\') => out.push('\\'),
                    Some(b'"') => out.push('"'),
                    _ => {
                        return Err(GreytrapError::Proto(
                            "bad escape in string".to_string(),
                        ))
                    }
                },
                Some(c) => out.push(c as char),
            }
        }
    }

    fn scan_int(&mut self) -> Result<Token> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.bump();
        }
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                self.bump();
            } else {
                break;
            }
        }

        let text = std::str::from_utf8(&self.input[start..self.pos])
            .map_err(|_| GreytrapError::Proto("bad integer".to_string()))?;
        text.parse::<i64>()
            .map(Token::Int)
            .map_err(|_| GreytrapError::Proto(format!("bad integer: {text}")))
    }

    fn scan_name(&mut self) -> Result<Token> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == b'_' || c == b'-' || c == b'.' {
                self.bump();
            } else {
                break;
            }
        }

        let text = std::str::from_utf8(&self.input[start..self.pos])
            .map_err(|_| GreytrapError::Proto("bad identifier".to_string()))?;

        Ok(match text {
            "section" => Token::Section,
            "include" => Token::Include,
            "blacklist" => Token::Blacklist,
            "whitelist" => Token::Whitelist,
            "plugin" => Token::Plugin,
            _ => Token::Name(text.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_tokens(input: &str) -> Vec<Token> {
        let mut lexer = Lexer::new(input);
        let mut out = Vec::new();
        loop {
            let tok = lexer.next_token().unwrap();
            let eof = tok == Token::Eof;
            out.push(tok);
            if eof {
                break;
            }
        }
        out
    }

    #[test]
    fn test_assignment_tokens() {
        let toks = all_tokens("type = 1\n");
        assert_eq!(
            toks,
            vec![
                Token::Name("type".to_string()),
                Token::Eq,
                Token::Int(1),
                Token::Eol,
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        let toks = all_tokens(r#"m = "a \"b\" \\ c""#);
        assert_eq!(toks[2], Token::Str("a \"b\" \\ c".to_string()));
    }

    #[test]
    fn test_comment_skipped() {
        let toks = all_tokens("a = 1 # trailing\nb = 2\n");
        assert!(toks.contains(&Token::Name("b".to_string())));
        assert!(!toks.iter().any(|t| matches!(t, Token::Name(n) if n == "trailing")));
    }

    #[test]
    fn test_reserved_words() {
        let toks = all_tokens("section blacklist whitelist plugin include");
        assert_eq!(
            toks,
            vec![
                Token::Section,
                Token::Blacklist,
                Token::Whitelist,
                Token::Plugin,
                Token::Include,
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_negative_int() {
        let toks = all_tokens("n = -2\n");
        assert_eq!(toks[2], Token::Int(-2));
    }

    #[test]
    fn test_end_marker() {
        let toks = all_tokens("a = 1\n%\n");
        assert!(toks.contains(&Token::End));
    }

    #[test]
    fn test_unterminated_string() {
        let mut lexer = Lexer::new("a = \"oops\n");
        lexer.next_token().unwrap();
        lexer.next_token().unwrap();
        assert!(lexer.next_token().is_err());
    }
}

//! Recursive-descent parser for `%`-terminated messages.

use super::lexer::{Lexer, Token};
use super::{Message, Value};
use crate::error::{GreytrapError, Result};

/// Parse a single message. Input must contain the terminating `%` (or end
/// cleanly at EOF for trailing use in tests).
pub fn parse(input: &str) -> Result<Message> {
    let mut parser = Parser {
        lexer: Lexer::new(input),
        current: Token::Eol,
    };
    parser.advance()?;
    parser.message()
}

struct Parser<'a> {
    lexer: Lexer<'a>,
    current: Token,
}

impl<'a> Parser<'a> {
    fn advance(&mut self) -> Result<()> {
        self.current = self.lexer.next_token()?;
        Ok(())
    }

    fn skip_eols(&mut self) -> Result<()> {
        while self.current == Token::Eol || self.current == Token::Semi {
            self.advance()?;
        }
        Ok(())
    }

    fn expect_eq(&mut self) -> Result<()> {
        if self.current != Token::Eq {
            return Err(GreytrapError::Proto(format!(
                "expected '=', found {:?}",
                self.current
            )));
        }
        self.advance()
    }

    fn message(&mut self) -> Result<Message> {
        let mut message = Message::new();

        loop {
            self.skip_eols()?;
            match std::mem::replace(&mut self.current, Token::Eol) {
                Token::End | Token::Eof => return Ok(message),
                Token::Name(name) => {
                    self.advance()?;
                    self.expect_eq()?;
                    let value = self.value()?;
                    message.set(&name, value);
                }
                Token::Section | Token::Blacklist | Token::Whitelist | Token::Plugin => {
                    self.advance()?;
                    let name = match std::mem::replace(&mut self.current, Token::Eol) {
                        Token::Name(name) => name,
                        other => {
                            return Err(GreytrapError::Proto(format!(
                                "expected section name, found {other:?}"
                            )))
                        }
                    };
                    self.advance()?;
                    let items = self.section_body()?;
                    message.set(&name, Value::Section(items));
                }
                other => {
                    return Err(GreytrapError::Proto(format!(
                        "unexpected token {other:?}"
                    )))
                }
            }
        }
    }

    fn value(&mut self) -> Result<Value> {
        match std::mem::replace(&mut self.current, Token::Eol) {
            Token::Int(i) => {
                self.advance()?;
                Ok(Value::Int(i))
            }
            Token::Str(s) => {
                self.advance()?;
                Ok(Value::Str(s))
            }
            Token::SquareOpen => {
                self.advance()?;
                self.list_body()
            }
            other => Err(GreytrapError::Proto(format!(
                "expected value, found {other:?}"
            ))),
        }
    }

    fn list_body(&mut self) -> Result<Value> {
        let mut values = Vec::new();

        self.skip_eols()?;
        if self.current == Token::SquareClose {
            self.advance()?;
            return Ok(Value::List(values));
        }

        loop {
            self.skip_eols()?;
            values.push(self.value()?);
            self.skip_eols()?;

            match self.current {
                Token::Comma => self.advance()?,
                Token::SquareClose => {
                    self.advance()?;
                    return Ok(Value::List(values));
                }
                ref other => {
                    return Err(GreytrapError::Proto(format!(
                        "expected ',' or ']' in list, found {other:?}"
                    )))
                }
            }
        }
    }

    fn section_body(&mut self) -> Result<Vec<(String, Value)>> {
        self.skip_eols()?;
        if self.current != Token::BraceOpen {
            return Err(GreytrapError::Proto(format!(
                "expected '{{', found {:?}",
                self.current
            )));
        }
        self.advance()?;

        let mut items = Vec::new();
        loop {
            self.skip_eols()?;
            match std::mem::replace(&mut self.current, Token::Eol) {
                Token::BraceClose => {
                    self.advance()?;
                    return Ok(items);
                }
                Token::Name(name) => {
                    self.advance()?;
                    self.expect_eq()?;
                    let value = self.value()?;
                    items.push((name, value));
                    self.skip_eols()?;
                    if self.current == Token::Comma {
                        self.advance()?;
                    }
                }
                other => {
                    return Err(GreytrapError::Proto(format!(
                        "unexpected token {other:?} in section"
                    )))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_grey_event() {
        let msg = parse(
            "type = 1\ndst_ip = \"10.9.9.9\"\nip = \"192.0.2.1\"\nhelo = \"h\"\nfrom = \"a@b\"\nto = \"c@d\"\n%\n",
        )
        .unwrap();

        assert_eq!(msg.get_int("type"), Some(1));
        assert_eq!(msg.get_str("dst_ip"), Some("10.9.9.9"));
        assert_eq!(msg.get_str("to"), Some("c@d"));
    }

    #[test]
    fn test_parse_traplist_message() {
        let msg = parse(
            "name = \"greytrap-traplist\"\nmessage = \"trapped\"\nips = [\"10.0.0.1/32\", \"2001:db8::1/128\"]\n%\n",
        )
        .unwrap();

        let ips = msg.get_list("ips").unwrap();
        assert_eq!(ips.len(), 2);
        assert_eq!(ips[0], Value::Str("10.0.0.1/32".to_string()));
    }

    #[test]
    fn test_parse_multiline_list() {
        let msg = parse("ips = [\n  \"10.0.0.1/32\",\n  \"10.0.0.2/32\"\n]\n%\n").unwrap();
        assert_eq!(msg.get_list("ips").unwrap().len(), 2);
    }

    #[test]
    fn test_parse_empty_list() {
        let msg = parse("ips = []\n%\n").unwrap();
        assert_eq!(msg.get_list("ips").unwrap().len(), 0);
    }

    #[test]
    fn test_parse_section() {
        let msg = parse("section grey {\n  pass_time = 60,\n  enable = 1\n}\n%\n").unwrap();
        match msg.get("grey") {
            Some(Value::Section(items)) => {
                assert_eq!(items.len(), 2);
                assert_eq!(items[0], ("pass_time".to_string(), Value::Int(60)));
            }
            other => panic!("expected section, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_nat_request_without_spaces() {
        let msg =
            parse("type=\"nat\"\nsrc=\"192.0.2.1\"\nsrc_port=4567\nproxy=\"10.0.0.1\"\nproxy_port=8025\n%\n")
                .unwrap();
        assert_eq!(msg.get_str("type"), Some("nat"));
        assert_eq!(msg.get_int("src_port"), Some(4567));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse("type 1\n%\n").is_err());
        assert!(parse("type = \n%\n").is_err());
        assert!(parse("= 1\n%\n").is_err());
        assert!(parse("l = [1, \n%\n").is_err());
    }
}

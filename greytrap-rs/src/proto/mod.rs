//! The key/value message protocol spoken on every internal pipe.
//!
//! A message is a sequence of assignments (`name = value` where a value is
//! an integer, a double-quoted string or a bracketed list) and optional
//! `section NAME { ... }` blocks, terminated by a line containing exactly
//! `%`. Comments run from `#` to end of line. The same syntax carries grey
//! events, traplist pushes and firewall NAT lookups.

mod lexer;
mod parser;

pub use lexer::{Lexer, Token};
pub use parser::parse;

use crate::error::{GreytrapError, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Str(String),
    List(Vec<Value>),
    Section(Vec<(String, Value)>),
}

/// An ordered set of named values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    items: Vec<(String, Value)>,
}

impl Message {
    pub fn new() -> Self {
        Message::default()
    }

    pub fn set(&mut self, name: &str, value: Value) {
        if let Some(item) = self.items.iter_mut().find(|(n, _)| n == name) {
            item.1 = value;
        } else {
            self.items.push((name.to_string(), value));
        }
    }

    pub fn set_int(mut self, name: &str, value: i64) -> Self {
        self.set(name, Value::Int(value));
        self
    }

    pub fn set_str(mut self, name: &str, value: &str) -> Self {
        self.set(name, Value::Str(value.to_string()));
        self
    }

    pub fn set_str_list(mut self, name: &str, values: &[String]) -> Self {
        self.set(
            name,
            Value::List(values.iter().map(|v| Value::Str(v.clone())).collect()),
        );
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.items.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.get(name) {
            Some(Value::Int(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(Value::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn get_list(&self, name: &str) -> Option<&[Value]> {
        match self.get(name) {
            Some(Value::List(l)) => Some(l.as_slice()),
            _ => None,
        }
    }

    pub fn items(&self) -> &[(String, Value)] {
        &self.items
    }

    /// Re-emit the message in wire syntax, `%`-terminated.
    pub fn emit(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.items {
            emit_item(&mut out, name, value);
        }
        out.push_str("%\n");
        out
    }
}

fn emit_item(out: &mut String, name: &str, value: &Value) {
    match value {
        Value::Section(items) => {
            out.push_str(&format!("section {name} {{\n"));
            for (n, v) in items {
                emit_item(out, n, v);
            }
            out.push_str("}\n");
        }
        _ => {
            out.push_str(&format!("{name} = "));
            emit_value(out, value);
            out.push('\n');
        }
    }
}

fn emit_value(out: &mut String, value: &Value) {
    match value {
        Value::Int(i) => out.push_str(&i.to_string()),
        Value::Str(s) => {
            out.push('"');
            for c in s.chars() {
                match c {
                    '\\' => out.push_str("\\\\"),
                    '"' => out.push_str("\\\""),
                    _ => out.push(c),
                }
            }
            out.push('"');
        }
        Value::List(values) => {
            out.push('[');
            for (i, v) in values.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                emit_value(out, v);
            }
            out.push(']');
        }
        Value::Section(_) => {}
    }
}

/// Pulls successive `%`-terminated messages off an async line stream.
pub struct MessageReader<R> {
    lines: Lines<R>,
}

impl<R: AsyncBufRead + Unpin> MessageReader<R> {
    pub fn new(reader: R) -> Self {
        MessageReader {
            lines: reader.lines(),
        }
    }

    /// The next complete message, or `None` at end of stream.
    pub async fn next_message(&mut self) -> Result<Option<Message>> {
        let mut buf = String::new();
        let mut saw_any = false;

        while let Some(line) = self.lines.next_line().await? {
            saw_any = true;
            if line.trim() == "%" {
                buf.push_str("%\n");
                return parse(&buf).map(Some);
            }
            buf.push_str(&line);
            buf.push('\n');
        }

        if saw_any && !buf.trim().is_empty() {
            return Err(GreytrapError::Proto(
                "stream ended mid-message".to_string(),
            ));
        }

        Ok(None)
    }
}

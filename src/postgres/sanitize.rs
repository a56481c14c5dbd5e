//! Client-side interpolation of positional arguments.
//!
//! The simple query protocol has no parameter slots, so `$1`, `$2`, ...
//! are replaced with quoted literals before the statement is sent.
//! Placeholders inside string literals, quoted identifiers and comments
//! are left alone.

use std::fmt::Write;

use crate::{Error, Result};

/// A positional argument for [`interpolate`].
#[derive(Debug, Clone, PartialEq)]
pub enum QueryArg {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl QueryArg {
    fn to_literal(&self) -> String {
        match self {
            QueryArg::Null => "null".to_string(),
            QueryArg::Bool(b) => b.to_string(),
            QueryArg::Int(n) if *n < 0 => format!("({})", n),
            QueryArg::Int(n) => n.to_string(),
            QueryArg::Float(f) if f.is_nan() => "'NaN'".to_string(),
            QueryArg::Float(f) if f.is_infinite() && *f > 0.0 => "'Infinity'".to_string(),
            QueryArg::Float(f) if f.is_infinite() => "'-Infinity'".to_string(),
            QueryArg::Float(f) if *f < 0.0 => format!("({})", f),
            QueryArg::Float(f) => f.to_string(),
            QueryArg::Text(s) => quote_string(s),
            QueryArg::Bytes(b) => {
                let mut lit = String::with_capacity(b.len() * 2 + 13);
                lit.push_str("'\\x");
                for byte in b {
                    let _ = write!(lit, "{:02x}", byte);
                }
                lit.push_str("'::bytea");
                lit
            }
        }
    }
}

impl From<&str> for QueryArg {
    fn from(s: &str) -> Self {
        QueryArg::Text(s.to_string())
    }
}

impl From<String> for QueryArg {
    fn from(s: String) -> Self {
        QueryArg::Text(s)
    }
}

impl From<i64> for QueryArg {
    fn from(n: i64) -> Self {
        QueryArg::Int(n)
    }
}

impl From<i32> for QueryArg {
    fn from(n: i32) -> Self {
        QueryArg::Int(n.into())
    }
}

impl From<f64> for QueryArg {
    fn from(f: f64) -> Self {
        QueryArg::Float(f)
    }
}

impl From<bool> for QueryArg {
    fn from(b: bool) -> Self {
        QueryArg::Bool(b)
    }
}

impl From<Vec<u8>> for QueryArg {
    fn from(b: Vec<u8>) -> Self {
        QueryArg::Bytes(b)
    }
}

impl<T: Into<QueryArg>> From<Option<T>> for QueryArg {
    fn from(v: Option<T>) -> Self {
        v.map_or(QueryArg::Null, Into::into)
    }
}

fn quote_string(s: &str) -> String {
    let mut lit = String::with_capacity(s.len() + 2);
    lit.push('\'');
    for c in s.chars() {
        if c == '\'' {
            lit.push('\'');
        }
        lit.push(c);
    }
    lit.push('\'');
    lit
}

/// Replaces `$N` placeholders in `sql` with the literal form of `args[N-1]`.
///
/// Every argument must be referenced at least once, and no placeholder may
/// point past the end of `args`.
pub fn interpolate(sql: &str, args: &[QueryArg]) -> Result<String> {
    if args.is_empty() {
        return Ok(sql.to_string());
    }

    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len() + args.len() * 8);
    let mut used = vec![false; args.len()];
    let mut i = 0;
    let mut copied = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' | b'"' => i = skip_quoted(bytes, i),
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                i = bytes[i..]
                    .iter()
                    .position(|b| *b == b'\n')
                    .map_or(bytes.len(), |p| i + p + 1);
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = sql[i + 2..].find("*/").map_or(bytes.len(), |p| i + 2 + p + 2);
            }
            b'$' => {
                let digits = bytes[i + 1..]
                    .iter()
                    .take_while(|b| b.is_ascii_digit())
                    .count();
                if digits == 0 {
                    i += 1;
                    continue;
                }
                let end = i + 1 + digits;
                let index: usize = sql[i + 1..end].parse().map_err(|_| Error::Argument {
                    message: format!("Invalid placeholder {}", &sql[i..end]),
                })?;
                let arg = index
                    .checked_sub(1)
                    .and_then(|idx| args.get(idx).map(|a| (idx, a)));
                let (idx, arg) = arg.ok_or_else(|| Error::Argument {
                    message: format!(
                        "Placeholder ${} has no argument ({} given)",
                        index,
                        args.len()
                    ),
                })?;

                out.push_str(&sql[copied..i]);
                out.push_str(&arg.to_literal());
                used[idx] = true;
                i = end;
                copied = end;
            }
            _ => i += 1,
        }
    }
    out.push_str(&sql[copied..]);

    if let Some(unused) = used.iter().position(|u| !u) {
        return Err(Error::Argument {
            message: format!("Argument {} is never referenced", unused + 1),
        });
    }

    Ok(out)
}

// Returns the index just past the closing quote, doubled quotes included.
fn skip_quoted(bytes: &[u8], start: usize) -> usize {
    let quote = bytes[start];
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

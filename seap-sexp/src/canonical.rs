// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The canonical wire encoding.
//!
//! Every SEAP transport exchanges exactly one canonical S-expression per
//! packet. The form is self-delimiting and free of whitespace, so a byte
//! stream can be cut back into frames without any outer length prefix:
//!
//! ```text
//! sexp   := list | uint | int | string | symbol
//! list   := '(' sexp* ')'
//! uint   := '#' DIGITS '#'                 #42#
//! int    := '#' ('+'|'-') DIGITS '#'       #+7#  #-7#
//! string := LEN ':' BYTES                  5:hello
//! symbol := LEN '\'' BYTES                 8'seap.msg
//! ```
//!
//! Signed numbers always carry their sign, so parsing an encoded value
//! reproduces the original variant exactly.
//!
//! [`parse_frame`] is incremental: handed a strict prefix of a frame it
//! reports [`Parsed::Partial`] instead of failing, which lets the channel
//! layer read more bytes and retry. Anything that can never become a valid
//! frame is a hard [`ParseError`].

use crate::SExp;

/// Upper bound on a single atom's payload, matching the frame cap used by
/// the transports.
pub const MAX_ATOM_LEN: usize = 100_000_000;

/// Upper bound on list nesting accepted from the wire.
pub const MAX_DEPTH: usize = 128;

// A u64 has at most 20 decimal digits; one more for the sign.
const MAX_NUMBER_LEN: usize = 21;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unexpected byte {0:#04x} in canonical form")]
    UnexpectedByte(u8),
    #[error("unbalanced ')'")]
    UnbalancedClose,
    #[error("atom of {0} bytes exceeds the {MAX_ATOM_LEN} byte limit")]
    AtomTooLong(usize),
    #[error("lists nested deeper than {MAX_DEPTH}")]
    TooDeep,
    #[error("malformed number")]
    BadNumber,
    #[error("atom is not valid UTF-8")]
    NotUtf8,
}

/// Outcome of an incremental parse attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Parsed {
    /// One full frame decoded from the front of the buffer; `consumed`
    /// bytes belong to it.
    Complete { sexp: SExp, consumed: usize },
    /// The buffer holds a valid but incomplete prefix; feed more bytes.
    Partial,
}

/// Encodes a value in canonical form.
pub fn encode(sexp: &SExp) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    write_value(sexp, &mut out);
    out
}

fn write_value(sexp: &SExp, out: &mut Vec<u8>) {
    match sexp {
        SExp::List(items) => {
            out.push(b'(');
            for item in items {
                write_value(item, out);
            }
            out.push(b')');
        }
        SExp::Uint(v) => {
            out.push(b'#');
            out.extend_from_slice(v.to_string().as_bytes());
            out.push(b'#');
        }
        SExp::Int(v) => {
            out.push(b'#');
            out.extend_from_slice(format!("{v:+}").as_bytes());
            out.push(b'#');
        }
        SExp::String(s) => {
            out.extend_from_slice(s.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(s.as_bytes());
        }
        SExp::Symbol(s) => {
            out.extend_from_slice(s.len().to_string().as_bytes());
            out.push(b'\'');
            out.extend_from_slice(s.as_bytes());
        }
    }
}

/// Decodes one frame from the front of `buf`.
pub fn parse_frame(buf: &[u8]) -> Result<Parsed, ParseError> {
    let mut stack: Vec<Vec<SExp>> = Vec::new();
    let mut pos = 0usize;

    loop {
        let Some(&byte) = buf.get(pos) else {
            return Ok(Parsed::Partial);
        };

        let value = match byte {
            b'(' => {
                if stack.len() >= MAX_DEPTH {
                    return Err(ParseError::TooDeep);
                }
                stack.push(Vec::new());
                pos += 1;
                continue;
            }
            b')' => {
                let items = stack.pop().ok_or(ParseError::UnbalancedClose)?;
                pos += 1;
                SExp::List(items)
            }
            b'#' => match parse_number(&buf[pos..])? {
                Some((value, used)) => {
                    pos += used;
                    value
                }
                None => return Ok(Parsed::Partial),
            },
            b'0'..=b'9' => match parse_sized_atom(&buf[pos..])? {
                Some((value, used)) => {
                    pos += used;
                    value
                }
                None => return Ok(Parsed::Partial),
            },
            other => return Err(ParseError::UnexpectedByte(other)),
        };

        match stack.last_mut() {
            Some(frame) => frame.push(value),
            None => {
                return Ok(Parsed::Complete {
                    sexp: value,
                    consumed: pos,
                })
            }
        }
    }
}

// `#…#` numbers. Returns None when the closing '#' has not arrived yet.
fn parse_number(buf: &[u8]) -> Result<Option<(SExp, usize)>, ParseError> {
    debug_assert_eq!(buf.first(), Some(&b'#'));
    let body = &buf[1..];

    let end = match body.iter().position(|&b| b == b'#') {
        Some(end) => end,
        None if body.len() > MAX_NUMBER_LEN => return Err(ParseError::BadNumber),
        None => return Ok(None),
    };
    if end == 0 || end > MAX_NUMBER_LEN {
        return Err(ParseError::BadNumber);
    }

    let digits = &body[..end];
    let value = match digits[0] {
        b'+' => SExp::Int(fold_signed(&digits[1..], false)?),
        b'-' => SExp::Int(fold_signed(&digits[1..], true)?),
        _ => SExp::Uint(fold_unsigned(digits)?),
    };
    Ok(Some((value, end + 2)))
}

fn fold_unsigned(digits: &[u8]) -> Result<u64, ParseError> {
    if digits.is_empty() {
        return Err(ParseError::BadNumber);
    }
    let mut acc: u64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(ParseError::BadNumber);
        }
        acc = acc
            .checked_mul(10)
            .and_then(|acc| acc.checked_add(u64::from(b - b'0')))
            .ok_or(ParseError::BadNumber)?;
    }
    Ok(acc)
}

// Negative values accumulate downward so i64::MIN parses.
fn fold_signed(digits: &[u8], negative: bool) -> Result<i64, ParseError> {
    if digits.is_empty() {
        return Err(ParseError::BadNumber);
    }
    let mut acc: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(ParseError::BadNumber);
        }
        let digit = i64::from(b - b'0');
        acc = acc
            .checked_mul(10)
            .and_then(|acc| {
                if negative {
                    acc.checked_sub(digit)
                } else {
                    acc.checked_add(digit)
                }
            })
            .ok_or(ParseError::BadNumber)?;
    }
    Ok(acc)
}

// `LEN:bytes` strings and `LEN'bytes` symbols. Returns None when the
// length header or the payload has not fully arrived.
fn parse_sized_atom(buf: &[u8]) -> Result<Option<(SExp, usize)>, ParseError> {
    let mut len: usize = 0;
    let mut header = 0usize;
    let sigil = loop {
        let Some(&b) = buf.get(header) else {
            return Ok(None);
        };
        match b {
            b'0'..=b'9' => {
                len = len
                    .checked_mul(10)
                    .and_then(|len| len.checked_add(usize::from(b - b'0')))
                    .ok_or(ParseError::AtomTooLong(usize::MAX))?;
                if len > MAX_ATOM_LEN {
                    return Err(ParseError::AtomTooLong(len));
                }
                header += 1;
            }
            b':' | b'\'' => break b,
            other => return Err(ParseError::UnexpectedByte(other)),
        }
    };

    let start = header + 1;
    let Some(bytes) = buf.get(start..start + len) else {
        return Ok(None);
    };
    let text = std::str::from_utf8(bytes)
        .map_err(|_| ParseError::NotUtf8)?
        .to_owned();

    let value = if sigil == b':' {
        SExp::String(text)
    } else {
        SExp::Symbol(text)
    };
    Ok(Some((value, start + len)))
}

// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! S-expression values as carried by the SEAP protocol layer.
//!
//! The protocol core treats payloads as opaque trees of atoms and lists.
//! This crate owns the value type, its constructors and accessors, and the
//! canonical wire encoding every transport uses (see [`canonical`]).
//!
//! Values are plain owned data: ownership transfer is a move, shared
//! ownership is an explicit [`Clone`]. There is no interior mutability and
//! no reference counting to get wrong at component boundaries.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

use std::fmt;

pub mod canonical;

pub use canonical::{encode, parse_frame, ParseError, Parsed};

/// A symbolic expression: a tree of atoms and lists.
///
/// Numbers come in two flavors so that protocol ids (full-range `u64`) and
/// ordinary signed values both round-trip exactly through the wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SExp {
    /// An ordered sequence of values.
    List(Vec<SExp>),
    /// An unsigned number. Ids, command codes and error codes live here.
    Uint(u64),
    /// A signed number.
    Int(i64),
    /// UTF-8 text data.
    String(String),
    /// A bare token: packet heads (`seap.msg`) and keywords (`:id`).
    Symbol(String),
}

impl SExp {
    pub fn uint(v: u64) -> SExp {
        SExp::Uint(v)
    }

    pub fn int(v: i64) -> SExp {
        SExp::Int(v)
    }

    pub fn string(v: impl Into<String>) -> SExp {
        SExp::String(v.into())
    }

    pub fn symbol(v: impl Into<String>) -> SExp {
        SExp::Symbol(v.into())
    }

    /// A keyword symbol, i.e. `keyword("id")` is the token `:id`.
    pub fn keyword(name: &str) -> SExp {
        SExp::Symbol(format!(":{name}"))
    }

    pub fn list(items: impl Into<Vec<SExp>>) -> SExp {
        SExp::List(items.into())
    }

    /// The empty list, used by command handlers that have no result.
    pub fn empty() -> SExp {
        SExp::List(Vec::new())
    }

    pub fn as_uint(&self) -> Option<u64> {
        match self {
            SExp::Uint(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            SExp::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SExp::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            SExp::Symbol(s) => Some(s),
            _ => None,
        }
    }

    /// The keyword name if this is a keyword symbol: `:id` yields `id`.
    pub fn as_keyword(&self) -> Option<&str> {
        self.as_symbol().and_then(|s| s.strip_prefix(':'))
    }

    pub fn as_list(&self) -> Option<&[SExp]> {
        match self {
            SExp::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self, SExp::List(_))
    }

    pub fn is_atom(&self) -> bool {
        !self.is_list()
    }

    /// Looks up a keyword-tagged value in a property-list shaped list:
    /// `(… :name value …)`. Returns the value following the first matching
    /// keyword, or `None` when the keyword is absent, trailing, or `self`
    /// is not a list.
    pub fn plist_get(&self, name: &str) -> Option<&SExp> {
        let items = self.as_list()?;
        let mut iter = items.iter();
        while let Some(item) = iter.next() {
            if item.as_keyword() == Some(name) {
                return iter.next();
            }
        }
        None
    }
}

impl From<Vec<SExp>> for SExp {
    fn from(items: Vec<SExp>) -> SExp {
        SExp::List(items)
    }
}

/// Human-oriented rendering for logs and diagnostics. The wire form is
/// [`canonical::encode`], not this.
impl fmt::Display for SExp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SExp::List(items) => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str(")")
            }
            SExp::Uint(v) => write!(f, "{v}"),
            SExp::Int(v) => write!(f, "{v:+}"),
            SExp::String(s) => write!(f, "{s:?}"),
            SExp::Symbol(s) => f.write_str(s),
        }
    }
}

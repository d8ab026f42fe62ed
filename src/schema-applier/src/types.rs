// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Column types and user-defined types.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use itertools::Itertools;

use crate::error::{Error, ErrorKind};

/// A built-in scalar type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NativeType {
    Boolean,
    Int,
    BigInt,
    Double,
    Text,
    Blob,
    Uuid,
    Timestamp,
}

impl NativeType {
    const ALL: [NativeType; 8] = [
        NativeType::Boolean,
        NativeType::Int,
        NativeType::BigInt,
        NativeType::Double,
        NativeType::Text,
        NativeType::Blob,
        NativeType::Uuid,
        NativeType::Timestamp,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            NativeType::Boolean => "boolean",
            NativeType::Int => "int",
            NativeType::BigInt => "bigint",
            NativeType::Double => "double",
            NativeType::Text => "text",
            NativeType::Blob => "blob",
            NativeType::Uuid => "uuid",
            NativeType::Timestamp => "timestamp",
        }
    }

    fn from_name(name: &str) -> Option<NativeType> {
        match name {
            "varchar" => Some(NativeType::Text),
            _ => NativeType::ALL.into_iter().find(|t| t.name() == name),
        }
    }
}

/// The type of a column, function argument or user type field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ColumnType {
    Native(NativeType),
    List(Box<ColumnType>),
    Set(Box<ColumnType>),
    Map(Box<ColumnType>, Box<ColumnType>),
    Frozen(Box<ColumnType>),
    User(Arc<UserType>),
}

impl ColumnType {
    /// Parses the textual form of a type, resolving user type names through
    /// `resolve`.
    pub fn parse(
        text: &str,
        resolve: &dyn Fn(&str) -> Option<Arc<UserType>>,
    ) -> Result<ColumnType, Error> {
        let mut parser = TypeParser {
            text,
            pos: 0,
            resolve,
        };
        let ty = parser.parse_type()?;
        parser.skip_whitespace();
        if parser.pos != text.len() {
            return Err(parser.invalid("trailing characters"));
        }
        Ok(ty)
    }

    /// Parses a type that may reference user types of `keyspace`.
    pub fn parse_in(
        text: &str,
        keyspace: &str,
        lookup: &dyn UserTypeLookup,
    ) -> Result<ColumnType, Error> {
        let types = lookup.user_types(keyspace);
        ColumnType::parse(text, &|name| types.get(name).cloned())
    }

    /// Reports whether this type is, or contains, the user type `keyspace.name`.
    pub fn references_user_type(&self, keyspace: &str, name: &str) -> bool {
        match self {
            ColumnType::Native(_) => false,
            ColumnType::List(t) | ColumnType::Set(t) | ColumnType::Frozen(t) => {
                t.references_user_type(keyspace, name)
            }
            ColumnType::Map(k, v) => {
                k.references_user_type(keyspace, name) || v.references_user_type(keyspace, name)
            }
            ColumnType::User(ut) => {
                (ut.keyspace == keyspace && ut.name == name)
                    || ut
                        .field_types
                        .iter()
                        .any(|t| t.references_user_type(keyspace, name))
            }
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Native(t) => f.write_str(t.name()),
            ColumnType::List(t) => write!(f, "list<{t}>"),
            ColumnType::Set(t) => write!(f, "set<{t}>"),
            ColumnType::Map(k, v) => write!(f, "map<{k}, {v}>"),
            ColumnType::Frozen(t) => write!(f, "frozen<{t}>"),
            ColumnType::User(ut) => f.write_str(&ut.name),
        }
    }
}

struct TypeParser<'a> {
    text: &'a str,
    pos: usize,
    resolve: &'a dyn Fn(&str) -> Option<Arc<UserType>>,
}

impl<'a> TypeParser<'a> {
    fn invalid(&self, detail: &str) -> Error {
        Error::new(ErrorKind::InvalidType {
            text: self.text.into(),
            detail: format!("{detail} at position {}", self.pos),
        })
    }

    fn skip_whitespace(&mut self) {
        let rest = &self.text[self.pos..];
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn eat(&mut self, c: char) -> bool {
        self.skip_whitespace();
        if self.text[self.pos..].starts_with(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: char) -> Result<(), Error> {
        if self.eat(c) {
            Ok(())
        } else {
            Err(self.invalid(&format!("expected '{c}'")))
        }
    }

    fn ident(&mut self) -> Result<&'a str, Error> {
        self.skip_whitespace();
        let rest = &self.text[self.pos..];
        let len = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(rest.len());
        if len == 0 {
            return Err(self.invalid("expected a type name"));
        }
        self.pos += len;
        Ok(&rest[..len])
    }

    fn parse_type(&mut self) -> Result<ColumnType, Error> {
        let name = self.ident()?;
        let lower = name.to_ascii_lowercase();
        let ty = match lower.as_str() {
            "list" | "set" | "frozen" => {
                self.expect('<')?;
                let inner = Box::new(self.parse_type()?);
                self.expect('>')?;
                match lower.as_str() {
                    "list" => ColumnType::List(inner),
                    "set" => ColumnType::Set(inner),
                    _ => ColumnType::Frozen(inner),
                }
            }
            "map" => {
                self.expect('<')?;
                let key = Box::new(self.parse_type()?);
                self.expect(',')?;
                let value = Box::new(self.parse_type()?);
                self.expect('>')?;
                ColumnType::Map(key, value)
            }
            _ => match NativeType::from_name(&lower) {
                Some(native) => ColumnType::Native(native),
                None => match (self.resolve)(name) {
                    Some(ut) => ColumnType::User(ut),
                    None => return Err(Error::new(ErrorKind::UnknownType(name.into()))),
                },
            },
        };
        Ok(ty)
    }
}

/// A user-defined record type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserType {
    pub keyspace: String,
    pub name: String,
    pub field_names: Vec<String>,
    pub field_types: Vec<ColumnType>,
}

impl fmt::Display for UserType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} {{{}}}",
            self.keyspace,
            self.name,
            self.field_names
                .iter()
                .zip(&self.field_types)
                .map(|(n, t)| format!("{n} {t}"))
                .join(", ")
        )
    }
}

/// The user types of one keyspace, by name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserTypes {
    types: BTreeMap<String, Arc<UserType>>,
}

/// The type set of a keyspace that has none.
pub static EMPTY_USER_TYPES: UserTypes = UserTypes::new();

impl UserTypes {
    pub const fn new() -> UserTypes {
        UserTypes {
            types: BTreeMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<UserType>> {
        self.types.get(name)
    }

    /// Adds `ty`, replacing any type of the same name.
    pub fn add(&mut self, ty: Arc<UserType>) {
        self.types.insert(ty.name.clone(), ty);
    }

    pub fn remove(&mut self, name: &str) -> Option<Arc<UserType>> {
        self.types.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<UserType>> {
        self.types.values()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// Resolves the user types visible in a keyspace.
pub trait UserTypeLookup {
    fn user_types(&self, keyspace: &str) -> &UserTypes;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_types(_: &str) -> Option<Arc<UserType>> {
        None
    }

    #[test]
    fn parse_and_display() {
        for text in [
            "int",
            "list<text>",
            "map<text, frozen<set<uuid>>>",
            "frozen<list<bigint>>",
        ] {
            let ty = ColumnType::parse(text, &no_types).unwrap();
            assert_eq!(ty.to_string(), text);
        }
        assert_eq!(
            ColumnType::parse(" map < text ,int > ", &no_types)
                .unwrap()
                .to_string(),
            "map<text, int>"
        );
        assert_eq!(
            ColumnType::parse("varchar", &no_types).unwrap(),
            ColumnType::Native(NativeType::Text)
        );
    }

    #[test]
    fn parse_errors() {
        assert!(matches!(
            ColumnType::parse("address", &no_types).unwrap_err().kind(),
            ErrorKind::UnknownType(name) if name == "address"
        ));
        for text in ["list<int", "map<int>", "int>", ""] {
            assert!(matches!(
                ColumnType::parse(text, &no_types).unwrap_err().kind(),
                ErrorKind::InvalidType { .. }
            ));
        }
    }

    #[test]
    fn user_types_resolve() {
        let address = Arc::new(UserType {
            keyspace: "ks".into(),
            name: "address".into(),
            field_names: vec!["street".into()],
            field_types: vec![ColumnType::Native(NativeType::Text)],
        });
        let mut types = UserTypes::new();
        types.add(Arc::clone(&address));
        let resolve = |name: &str| types.get(name).cloned();
        let ty = ColumnType::parse("frozen<list<frozen<address>>>", &resolve).unwrap();
        assert!(ty.references_user_type("ks", "address"));
        assert!(!ty.references_user_type("other", "address"));
        assert_eq!(ty.to_string(), "frozen<list<frozen<address>>>");
        assert!(EMPTY_USER_TYPES.is_empty());
    }
}

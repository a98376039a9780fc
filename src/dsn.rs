//! Go-style MySQL data source name: `user:pass@tcp(host:port)/schema?params`.
//!
//! This is not a URL — there's no scheme, the network address sits inside
//! `tcp(...)`, and the only part of it the replay engine ever rewrites is
//! the schema (§6: "only the schema is overwritten per session"), which is
//! why [`Dsn::with_schema`] exists instead of a general mutable setter.

use std::collections::HashMap;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dsn {
    pub user: String,
    pub password: Option<String>,
    pub host: String,
    pub port: u16,
    pub schema: Option<String>,
    pub params: HashMap<String, String>,
}

impl Dsn {
    /// Returns a copy with `schema` substituted when `schema` is
    /// `Some(non-empty)`, leaving every other field — and this DSN's own
    /// configured schema — untouched otherwise. `None`/empty means "no
    /// override for this session", not "clear the configured schema": the
    /// replay worker's `Handshake` application only has a schema to
    /// override with when the captured handshake actually named one
    /// (spec: "overriding the default schema with `e.schema` when
    /// present").
    pub fn with_schema(&self, schema: Option<&str>) -> Self {
        match schema {
            Some(schema) if !schema.is_empty() => Self {
                schema: Some(schema.to_string()),
                ..self.clone()
            },
            _ => self.clone(),
        }
    }
}

impl TryFrom<&str> for Dsn {
    type Error = Error;

    fn try_from(dsn: &str) -> Result<Self> {
        let (user_info, rest) = dsn
            .split_once('@')
            .ok_or_else(|| Error::Config(format!("DSN missing '@': {dsn}")))?;

        let (user, password) = match user_info.split_once(':') {
            Some((u, p)) => (u.to_string(), Some(p.to_string())),
            None => (user_info.to_string(), None),
        };

        let rest = rest
            .strip_prefix("tcp(")
            .ok_or_else(|| Error::Config(format!("DSN missing 'tcp(...)': {dsn}")))?;
        let (addr, rest) = rest
            .split_once(')')
            .ok_or_else(|| Error::Config(format!("DSN unterminated 'tcp(...)': {dsn}")))?;

        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("DSN address missing port: {dsn}")))?;
        let port: u16 = port
            .parse()
            .map_err(|_| Error::Config(format!("DSN has a non-numeric port: {dsn}")))?;

        let rest = rest
            .strip_prefix('/')
            .ok_or_else(|| Error::Config(format!("DSN missing '/schema': {dsn}")))?;

        let (schema_part, query) = match rest.split_once('?') {
            Some((s, q)) => (s, Some(q)),
            None => (rest, None),
        };
        let schema = if schema_part.is_empty() {
            None
        } else {
            Some(schema_part.to_string())
        };

        let mut params = HashMap::new();
        if let Some(query) = query {
            for pair in query.split('&').filter(|s| !s.is_empty()) {
                match pair.split_once('=') {
                    Some((k, v)) => {
                        params.insert(k.to_string(), v.to_string());
                    }
                    None => {
                        params.insert(pair.to_string(), String::new());
                    }
                }
            }
        }

        Ok(Self {
            user,
            password,
            host: host.to_string(),
            port,
            schema,
            params,
        })
    }
}

//! Expression scanning for raw SQL fragments
//!
//! Fragments passed to `select`, `where`, `on`, `group by` and `order by` are
//! raw SQL with two extensions: `alias.property` paths, resolved against the
//! query's aliases, and `:name` / `:...name` parameter placeholders. String
//! literals and double-quoted identifiers are never rewritten.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use super::value::SqlValue;
use crate::error::{OrmError, Result};

static PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?P<lit>'(?:[^']|'')*')|(?P<quoted>"[^"]*"(?:\."[^"]*")?)|(?P<param>::|:(?:\.\.\.)?[A-Za-z_][A-Za-z0-9_]*)|(?P<alias>[A-Za-z_][A-Za-z0-9_]*)\.(?:(?P<prop>[A-Za-z_][A-Za-z0-9_]*)|"(?P<qprop>[^"]+)")|(?P<ident>[A-Za-z_][A-Za-z0-9_]*)"#,
    )
    .expect("path regex is valid")
});

static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?P<lit>'(?:[^']|'')*')|(?P<quoted>"[^"]*")|(?P<cast>::)|:(?P<spread>\.\.\.)?(?P<name>[A-Za-z_][A-Za-z0-9_]*)"#,
    )
    .expect("placeholder regex is valid")
});

static IDENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("ident regex is valid"));

static SIMPLE_PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^([A-Za-z_][A-Za-z0-9_]*)\.(?:([A-Za-z_][A-Za-z0-9_]*)|"([^"]+)")$"#)
        .expect("simple path regex is valid")
});

pub(crate) fn is_identifier(text: &str) -> bool {
    IDENT_RE.is_match(text)
}

/// Split `alias.property` (property optionally double-quoted).
pub(crate) fn split_path(text: &str) -> Option<(&str, &str)> {
    let caps = SIMPLE_PATH_RE.captures(text.trim())?;
    let alias = caps.get(1)?.as_str();
    let prop = caps.get(2).or_else(|| caps.get(3))?.as_str();
    Some((alias, prop))
}

/// Rewrite every `alias.property` path in `expr` using `resolve`.
pub(crate) fn resolve_paths<F>(expr: &str, mut resolve: F) -> Result<String>
where
    F: FnMut(&str, &str) -> Result<String>,
{
    let mut out = String::with_capacity(expr.len() + 16);
    let mut last = 0;
    for caps in PATH_RE.captures_iter(expr) {
        let whole = caps.get(0).expect("group 0 always present");
        out.push_str(&expr[last..whole.start()]);
        last = whole.end();

        match caps.name("alias") {
            Some(alias) => {
                let prop = caps
                    .name("prop")
                    .or_else(|| caps.name("qprop"))
                    .map(|m| m.as_str())
                    .unwrap_or_default();
                out.push_str(&resolve(alias.as_str(), prop)?);
            }
            None => out.push_str(whole.as_str()),
        }
    }
    out.push_str(&expr[last..]);
    Ok(out)
}

/// Rewrite named placeholders to SQLite positional `?N` parameters.
///
/// Parameters are numbered by first occurrence; a repeated name reuses its
/// number. `:...name` expands a list into `?N, ?N+1, ...`.
pub(crate) fn bind_placeholders(
    sql: &str,
    params: &HashMap<String, SqlValue>,
) -> Result<(String, Vec<SqlValue>)> {
    let mut values: Vec<SqlValue> = Vec::new();
    let mut assigned: HashMap<String, String> = HashMap::new();
    let mut error: Option<OrmError> = None;

    let rewritten = PLACEHOLDER_RE.replace_all(sql, |caps: &Captures| {
        let Some(name) = caps.name("name") else {
            return caps[0].to_string();
        };
        let name = name.as_str();
        let spread = caps.name("spread").is_some();
        let key = if spread {
            format!("...{}", name)
        } else {
            name.to_string()
        };
        if let Some(existing) = assigned.get(&key) {
            return existing.clone();
        }

        let Some(value) = params.get(name) else {
            error.get_or_insert_with(|| OrmError::UnboundParameter(name.to_string()));
            return caps[0].to_string();
        };

        let rendered = match (spread, value) {
            (true, SqlValue::List(items)) if items.is_empty() => "NULL".to_string(),
            (true, SqlValue::List(items)) => {
                let mut slots = Vec::with_capacity(items.len());
                for item in items {
                    values.push(item.clone());
                    slots.push(format!("?{}", values.len()));
                }
                slots.join(", ")
            }
            (false, SqlValue::List(_)) => {
                error.get_or_insert_with(|| {
                    OrmError::compile(format!(
                        "parameter :{} is a list; use :...{} to expand it",
                        name, name
                    ))
                });
                return caps[0].to_string();
            }
            (_, scalar) => {
                values.push(scalar.clone());
                format!("?{}", values.len())
            }
        };
        assigned.insert(key, rendered.clone());
        rendered
    });

    match error {
        Some(e) => Err(e),
        None => Ok((rewritten.into_owned(), values)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    fn params(pairs: &[(&str, SqlValue)]) -> HashMap<String, SqlValue> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_resolve_paths_skips_literals_and_quoted() {
        let out = resolve_paths(
            r#"post.categoryId = category.id AND post.title <> 'a.b' AND "x"."y" = 1 AND :p.q"#,
            |alias, prop| Ok(format!("<{}|{}>", alias, prop)),
        )
        .unwrap();
        assert_eq!(
            out,
            r#"<post|categoryId> = <category|id> AND <post|title> <> 'a.b' AND "x"."y" = 1 AND :p.q"#
        );
    }

    #[test]
    fn test_resolve_paths_quoted_property() {
        let out = resolve_paths(r#"post."categoryId" = category.id"#, |a, p| {
            Ok(format!("\"{}\".\"{}\"", a, p))
        })
        .unwrap();
        assert_eq!(out, r#""post"."categoryId" = "category"."id""#);
    }

    #[test]
    fn test_resolve_paths_propagates_errors() {
        let result = resolve_paths("nope.id = 1", |a, _| Err(OrmError::compile(a)));
        assert_matches!(result, Err(OrmError::CompileError(m)) if m == "nope");
    }

    #[test]
    fn test_bind_orders_by_first_occurrence() {
        let p = params(&[("b", SqlValue::Int(2)), ("a", SqlValue::Int(1))]);
        let (sql, values) = bind_placeholders("x = :a AND y = :b OR z = :a", &p).unwrap();
        assert_eq!(sql, "x = ?1 AND y = ?2 OR z = ?1");
        assert_eq!(values, vec![SqlValue::Int(1), SqlValue::Int(2)]);
    }

    #[test]
    fn test_bind_ignores_casts_and_literals() {
        let p = params(&[("a", SqlValue::Int(1))]);
        let (sql, values) = bind_placeholders("CAST(x AS TEXT) = ':a' AND y::int = :a", &p).unwrap();
        assert_eq!(sql, "CAST(x AS TEXT) = ':a' AND y::int = ?1");
        assert_eq!(values.len(), 1);
    }

    #[test]
    fn test_bind_unbound_parameter() {
        let p = params(&[("a", SqlValue::Int(1))]);
        assert_matches!(
            bind_placeholders("x = :a AND y = :missing", &p),
            Err(OrmError::UnboundParameter(n)) if n == "missing"
        );
    }

    #[test]
    fn test_bind_spread_list() {
        let p = params(&[
            ("ids", SqlValue::from(vec![3i64, 4, 5])),
            ("none", SqlValue::List(vec![])),
        ]);
        let (sql, values) = bind_placeholders("id IN (:...ids) OR id IN (:...none)", &p).unwrap();
        assert_eq!(sql, "id IN (?1, ?2, ?3) OR id IN (NULL)");
        assert_eq!(values.len(), 3);

        assert_matches!(
            bind_placeholders("id IN (:ids)", &p),
            Err(OrmError::CompileError(_))
        );
    }

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("category.name"), Some(("category", "name")));
        assert_eq!(split_path(r#"post."categoryId""#), Some(("post", "categoryId")));
        assert_eq!(split_path("count(1)"), None);
        assert!(is_identifier("category"));
        assert!(!is_identifier("category.id"));
    }
}

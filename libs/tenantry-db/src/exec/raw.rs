//! Inspection gate for raw statements.
//!
//! The checks are shallow and conservative: a statement passes only when its
//! tenant scoping is visible in its structure. SQL is tokenized and must be a
//! single-table statement whose outermost WHERE clause has
//! `tenant_field = '<tenant>'` as a top-level conjunct. Anything the gate
//! cannot read with confidence is rejected.

use std::iter::Peekable;
use std::str::Chars;

use serde_json::Value;

use super::Fields;
use crate::tenant::TenantId;

const COMMANDS: &[&str] = &[
    "find",
    "count",
    "distinct",
    "aggregate",
    "insert",
    "update",
    "delete",
];
const FORBIDDEN_OPERATORS: &[&str] = &[
    "$where",
    "$function",
    "$accumulator",
    "$lookup",
    "$graphLookup",
    "$unionWith",
    "$out",
    "$merge",
];

/// Keywords that can widen a statement past its tenant predicate or read
/// another table. `INTO` and `VALUES` are accepted only in an INSERT header.
const FORBIDDEN_WORDS: &[&str] = &[
    "OR",
    "XOR",
    "NOT",
    "UNION",
    "INTERSECT",
    "EXCEPT",
    "BETWEEN",
    "CASE",
    "JOIN",
    "USING",
    "LATERAL",
    "TABLE",
    "INTO",
    "VALUES",
    "CONFLICT",
    "DUPLICATE",
];

/// Keywords that end a WHERE clause.
const CLAUSE_ENDS: &[&str] = &[
    "GROUP",
    "HAVING",
    "WINDOW",
    "ORDER",
    "LIMIT",
    "OFFSET",
    "FETCH",
    "FOR",
    "RETURNING",
];

const PUNCT: &[char] = &['(', ')', ',', '.', '=', '<', '>', '+', '-', '*', '/', '%'];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    /// Bare identifier or keyword.
    Word(String),
    /// `"quoted"` or `` `quoted` `` identifier.
    Quoted(String),
    /// Single-quoted literal, unescaped.
    Str(String),
    Number,
    Punct(char),
}

impl Token {
    fn is_kw(&self, kw: &str) -> bool {
        matches!(self, Self::Word(w) if w.eq_ignore_ascii_case(kw))
    }

    fn ident(&self) -> Option<&str> {
        match self {
            Self::Word(w) | Self::Quoted(w) => Some(w),
            _ => None,
        }
    }
}

fn tokenize(sql: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {}
            '\'' => tokens.push(Token::Str(quoted(&mut chars, c)?)),
            '"' | '`' => tokens.push(Token::Quoted(quoted(&mut chars, c)?)),
            c if c == '#'
                || (c == '-' && chars.peek() == Some(&'-'))
                || (c == '/' && chars.peek() == Some(&'*')) =>
            {
                return Err("comments are not allowed".to_owned());
            }
            ';' => {
                if chars.all(char::is_whitespace) {
                    break;
                }
                return Err("multiple statements are not allowed".to_owned());
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut word = String::from(c);
                while let Some(&n) = chars.peek() {
                    if !(n.is_ascii_alphanumeric() || n == '_') {
                        break;
                    }
                    word.push(n);
                    chars.next();
                }
                tokens.push(Token::Word(word));
            }
            c if c.is_ascii_digit() => {
                while chars
                    .peek()
                    .is_some_and(|n| n.is_ascii_alphanumeric() || *n == '.' || *n == '_')
                {
                    chars.next();
                }
                tokens.push(Token::Number);
            }
            c if PUNCT.contains(&c) => tokens.push(Token::Punct(c)),
            other => return Err(format!("character '{other}' is not allowed")),
        }
    }
    Ok(tokens)
}

/// Reads up to the closing `delim`; a doubled delimiter is an escaped one.
/// Backslashes are refused outright since `MySQL` treats them as escapes.
fn quoted(chars: &mut Peekable<Chars<'_>>, delim: char) -> Result<String, String> {
    let mut value = String::new();
    while let Some(c) = chars.next() {
        if c == '\\' {
            return Err("backslash escapes are not allowed".to_owned());
        }
        if c == delim {
            if chars.peek() != Some(&delim) {
                return Ok(value);
            }
            chars.next();
        }
        value.push(c);
    }
    Err("unterminated quoted text".to_owned())
}

fn balanced(tokens: &[Token]) -> bool {
    let mut depth = 0usize;
    for t in tokens {
        match t {
            Token::Punct('(') => depth += 1,
            Token::Punct(')') => match depth.checked_sub(1) {
                Some(d) => depth = d,
                None => return false,
            },
            _ => {}
        }
    }
    depth == 0
}

/// Tokens outside any parentheses, with their positions.
fn top_level(tokens: &[Token]) -> impl Iterator<Item = (usize, &Token)> {
    let mut depth = 0usize;
    tokens.iter().enumerate().filter(move |(_, t)| match t {
        Token::Punct('(') => {
            depth += 1;
            false
        }
        Token::Punct(')') => {
            depth = depth.saturating_sub(1);
            false
        }
        _ => depth == 0,
    })
}

fn find_kw(tokens: &[Token], kw: &str, from: usize) -> Option<usize> {
    top_level(tokens)
        .find(|(i, t)| *i >= from && t.is_kw(kw))
        .map(|(i, _)| i)
}

/// Position of the `)` matching the `(` at `open`.
fn closing(tokens: &[Token], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, t) in tokens.iter().enumerate().skip(open) {
        match t {
            Token::Punct('(') => depth += 1,
            Token::Punct(')') => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn split_top(tokens: &[Token], is_sep: impl Fn(&Token) -> bool) -> Vec<&[Token]> {
    let mut parts = Vec::new();
    let mut start = 0;
    for (i, t) in top_level(tokens) {
        if is_sep(t) {
            parts.push(&tokens[start..i]);
            start = i + 1;
        }
    }
    parts.push(&tokens[start..]);
    parts
}

fn is_comma(t: &Token) -> bool {
    *t == Token::Punct(',')
}

fn strip_parens(mut tokens: &[Token]) -> &[Token] {
    while tokens.len() >= 2
        && tokens[0] == Token::Punct('(')
        && closing(tokens, 0) == Some(tokens.len() - 1)
    {
        tokens = &tokens[1..tokens.len() - 1];
    }
    tokens
}

/// Length of the leading `name(.name)*` run.
fn qualified_name_len(tokens: &[Token]) -> usize {
    let mut len = 0;
    while tokens.get(len).and_then(Token::ident).is_some() {
        len += 1;
        let continues = tokens.get(len) == Some(&Token::Punct('.'))
            && tokens.get(len + 1).and_then(Token::ident).is_some();
        if !continues {
            break;
        }
        len += 1;
    }
    len
}

/// `field`, `alias.field` or `schema.table.field`.
fn is_column(tokens: &[Token], field: &str) -> bool {
    !tokens.is_empty()
        && qualified_name_len(tokens) == tokens.len()
        && tokens
            .last()
            .and_then(Token::ident)
            .is_some_and(|name| name.eq_ignore_ascii_case(field))
}

/// `table`, `table alias` or `table AS alias`, optionally schema-qualified.
fn single_table(tokens: &[Token]) -> Result<(), String> {
    let name_len = qualified_name_len(tokens);
    let alias_ok = match &tokens[name_len..] {
        [] => true,
        [alias] => alias.ident().is_some(),
        [kw, alias] => kw.is_kw("AS") && alias.ident().is_some(),
        _ => false,
    };
    if name_len > 0 && alias_ok {
        Ok(())
    } else {
        Err("exactly one table may be referenced".to_owned())
    }
}

/// Rejects subqueries and widening keywords, except at the `allowed` positions.
fn reject_words(tokens: &[Token], allowed: &[usize]) -> Result<(), String> {
    for (i, t) in tokens.iter().enumerate() {
        let Token::Word(word) = t else { continue };
        if allowed.contains(&i) {
            continue;
        }
        if word.eq_ignore_ascii_case("SELECT") {
            return Err("subqueries are not allowed".to_owned());
        }
        if let Some(kw) = FORBIDDEN_WORDS
            .iter()
            .find(|kw| word.eq_ignore_ascii_case(kw))
        {
            return Err(format!("'{kw}' is not allowed"));
        }
    }
    Ok(())
}

struct SqlGate<'a> {
    field: &'a str,
    tenant: &'a TenantId,
}

impl SqlGate<'_> {
    fn unpinned(&self) -> String {
        format!(
            "no top-level {} = '{}' predicate in the WHERE clause",
            self.field, self.tenant
        )
    }

    fn statement(&self, tokens: &[Token], allow_with: bool) -> Result<(), String> {
        let verb = match tokens.first() {
            Some(Token::Word(w)) => w.to_ascii_uppercase(),
            _ => String::new(),
        };
        match verb.as_str() {
            "WITH" if allow_with => self.with(tokens),
            "SELECT" => self.select(tokens),
            "INSERT" => self.insert(tokens),
            "UPDATE" => self.update(tokens),
            "DELETE" => self.delete(tokens),
            _ => Err(format!("statement type '{verb}' is not allowed")),
        }
    }

    /// Every common table expression must itself be a pinned SELECT.
    fn with(&self, tokens: &[Token]) -> Result<(), String> {
        let malformed = || "malformed WITH clause".to_owned();
        let mut i = 1;
        if tokens.get(i).is_some_and(|t| t.is_kw("RECURSIVE")) {
            i += 1;
        }
        loop {
            if tokens.get(i).and_then(Token::ident).is_none() {
                return Err(malformed());
            }
            i += 1;
            if tokens.get(i) == Some(&Token::Punct('(')) {
                let close = closing(tokens, i).ok_or_else(malformed)?;
                let columns_ok = tokens[i + 1..close]
                    .iter()
                    .all(|t| t.ident().is_some() || is_comma(t));
                if !columns_ok {
                    return Err(malformed());
                }
                i = close + 1;
            }
            if !tokens.get(i).is_some_and(|t| t.is_kw("AS"))
                || tokens.get(i + 1) != Some(&Token::Punct('('))
            {
                return Err(malformed());
            }
            let close = closing(tokens, i + 1).ok_or_else(malformed)?;
            let body = &tokens[i + 2..close];
            if !body.first().is_some_and(|t| t.is_kw("SELECT")) {
                return Err("common table expressions must be SELECT queries".to_owned());
            }
            self.select(body)?;
            i = close + 1;
            if tokens.get(i).is_some_and(is_comma) {
                i += 1;
            } else {
                break;
            }
        }
        self.statement(&tokens[i..], false)
    }

    fn select(&self, tokens: &[Token]) -> Result<(), String> {
        reject_words(tokens, &[0])?;
        let from = find_kw(tokens, "FROM", 1).ok_or("SELECT must read from a table")?;
        let filter = find_kw(tokens, "WHERE", from).ok_or_else(|| self.unpinned())?;
        single_table(&tokens[from + 1..filter])?;
        self.where_clause(&tokens[filter + 1..])
    }

    fn delete(&self, tokens: &[Token]) -> Result<(), String> {
        reject_words(tokens, &[])?;
        if !tokens.get(1).is_some_and(|t| t.is_kw("FROM")) {
            return Err("DELETE must be DELETE FROM table".to_owned());
        }
        let filter = find_kw(tokens, "WHERE", 2).ok_or_else(|| self.unpinned())?;
        single_table(&tokens[2..filter])?;
        self.where_clause(&tokens[filter + 1..])
    }

    fn update(&self, tokens: &[Token]) -> Result<(), String> {
        reject_words(tokens, &[])?;
        let set = find_kw(tokens, "SET", 1).ok_or("UPDATE needs a SET clause")?;
        single_table(&tokens[1..set])?;
        let filter = find_kw(tokens, "WHERE", set).ok_or_else(|| self.unpinned())?;
        for assignment in split_top(&tokens[set + 1..filter], is_comma) {
            if top_level(assignment).any(|(_, t)| t.is_kw("FROM")) {
                return Err("UPDATE may not read other tables".to_owned());
            }
            let target = assignment
                .iter()
                .position(|t| *t == Token::Punct('='))
                .map_or(assignment, |eq| &assignment[..eq]);
            if target.is_empty() || qualified_name_len(target) != target.len() {
                return Err("each SET entry must assign one column".to_owned());
            }
            if is_column(target, self.field) {
                return Err(format!("update may not change {}", self.field));
            }
        }
        self.where_clause(&tokens[filter + 1..])
    }

    /// `INSERT INTO table (columns) VALUES (row), ... [RETURNING ...]` where
    /// every row carries the tenant literal in the tenant column's position.
    fn insert(&self, tokens: &[Token]) -> Result<(), String> {
        let malformed = || "INSERT must be INSERT INTO table (columns) VALUES (...)".to_owned();
        if !tokens.get(1).is_some_and(|t| t.is_kw("INTO")) {
            return Err(malformed());
        }
        let open = 2 + qualified_name_len(&tokens[2..]);
        if open == 2 || tokens.get(open) != Some(&Token::Punct('(')) {
            return Err(malformed());
        }
        let close = closing(tokens, open).ok_or_else(malformed)?;
        let columns = split_top(&tokens[open + 1..close], is_comma);
        if !columns
            .iter()
            .all(|c| matches!(c, [col] if col.ident().is_some()))
        {
            return Err(malformed());
        }
        let tenant_columns: Vec<usize> = columns
            .iter()
            .enumerate()
            .filter(|(_, c)| is_column(c, self.field))
            .map(|(i, _)| i)
            .collect();
        let &[position] = tenant_columns.as_slice() else {
            return Err(format!("column list must name {} exactly once", self.field));
        };

        let values = close + 1;
        if !tokens.get(values).is_some_and(|t| t.is_kw("VALUES")) {
            return Err(malformed());
        }
        reject_words(tokens, &[1, values])?;

        let mut i = values + 1;
        loop {
            if tokens.get(i) != Some(&Token::Punct('(')) {
                return Err(malformed());
            }
            let end = closing(tokens, i).ok_or_else(malformed)?;
            let row = split_top(&tokens[i + 1..end], is_comma);
            if row.len() != columns.len() {
                return Err(format!(
                    "row has {} values for {} columns",
                    row.len(),
                    columns.len()
                ));
            }
            if !matches!(row[position], [Token::Str(v)] if v == self.tenant.as_str()) {
                return Err(format!(
                    "every row must set {} to '{}'",
                    self.field, self.tenant
                ));
            }
            i = end + 1;
            if tokens.get(i).is_some_and(is_comma) {
                i += 1;
            } else {
                break;
            }
        }
        if tokens.get(i).is_none_or(|t| t.is_kw("RETURNING")) {
            Ok(())
        } else {
            Err("unexpected text after VALUES".to_owned())
        }
    }

    /// The clause holds when one of its top-level AND terms is exactly
    /// `[qualifier.]field = '<tenant>'`.
    fn where_clause(&self, tokens: &[Token]) -> Result<(), String> {
        let end = top_level(tokens)
            .find(|(_, t)| CLAUSE_ENDS.iter().any(|kw| t.is_kw(kw)))
            .map_or(tokens.len(), |(i, _)| i);
        let pinned = split_top(&tokens[..end], |t| t.is_kw("AND"))
            .into_iter()
            .any(|term| self.is_tenant_predicate(strip_parens(term)));
        if pinned {
            Ok(())
        } else {
            Err(self.unpinned())
        }
    }

    fn is_tenant_predicate(&self, tokens: &[Token]) -> bool {
        let [column @ .., Token::Punct('='), Token::Str(value)] = tokens else {
            return false;
        };
        value == self.tenant.as_str() && is_column(column, self.field)
    }
}

/// Checks that a SQL statement is visibly pinned to `tenant`.
///
/// # Errors
/// Returns the rejection reason.
pub fn inspect_sql(sql: &str, tenant_field: &str, tenant: &TenantId) -> Result<(), String> {
    let tokens = tokenize(sql)?;
    if tokens.is_empty() {
        return Err("empty statement".to_owned());
    }
    if !balanced(&tokens) {
        return Err("unbalanced parentheses".to_owned());
    }
    SqlGate {
        field: tenant_field,
        tenant,
    }
    .statement(&tokens, true)
}

/// Checks that a document command is visibly pinned to `tenant`.
///
/// # Errors
/// Returns the rejection reason.
pub fn inspect_command(
    command: &Fields,
    tenant_field: &str,
    tenant: &TenantId,
) -> Result<(), String> {
    let (name, target) = command
        .iter()
        .next()
        .ok_or_else(|| "empty command".to_owned())?;
    if !COMMANDS.contains(&name.as_str()) {
        return Err(format!("command '{name}' is not allowed"));
    }
    if !target.is_string() {
        return Err(format!("'{name}' must name a collection"));
    }
    if let Some(op) = find_forbidden(&Value::Object(command.clone())) {
        return Err(format!("operator '{op}' is not allowed"));
    }

    let pinned = |v: Option<&Value>, what: &str| -> Result<(), String> {
        match v {
            Some(Value::Object(filter))
                if filter.get(tenant_field).and_then(Value::as_str) == Some(tenant.as_str()) =>
            {
                Ok(())
            }
            _ => Err(format!("{what} does not pin {tenant_field} to the tenant")),
        }
    };
    let array = |key: &str| non_empty_array(command, key);

    match name.as_str() {
        "find" => pinned(command.get("filter"), "filter"),
        "count" | "distinct" => pinned(command.get("query"), "query"),
        "aggregate" => {
            let first = array("pipeline")?.first().and_then(|s| s.get("$match"));
            pinned(first, "leading $match stage")
        }
        "insert" => array("documents")?
            .iter()
            .try_for_each(|d| pinned(Some(d), "inserted document")),
        "update" => array("updates")?.iter().try_for_each(|u| {
            pinned(u.get("q"), "update filter")?;
            check_update_spec(u.get("u"), tenant_field, tenant)
        }),
        "delete" => array("deletes")?
            .iter()
            .try_for_each(|d| pinned(d.get("q"), "delete filter")),
        _ => Err(format!("command '{name}' is not allowed")),
    }
}

fn non_empty_array<'a>(command: &'a Fields, key: &str) -> Result<&'a Vec<Value>, String> {
    command
        .get(key)
        .and_then(Value::as_array)
        .filter(|a| !a.is_empty())
        .ok_or_else(|| format!("'{key}' must be a non-empty array"))
}

fn check_update_spec(spec: Option<&Value>, field: &str, tenant: &TenantId) -> Result<(), String> {
    let Some(Value::Object(spec)) = spec else {
        return Err("update entry needs a 'u' document".to_owned());
    };
    let is_operator_form = spec.keys().any(|k| k.starts_with('$'));
    if !is_operator_form {
        // Replacement documents must keep the tenant.
        return if spec.get(field).and_then(Value::as_str) == Some(tenant.as_str()) {
            Ok(())
        } else {
            Err(format!("replacement document must keep {field}"))
        };
    }

    let nested = format!("{field}.");
    let targets_tenant = |path: &str| path == field || path.starts_with(&nested);
    for (op, args) in spec {
        let Value::Object(args) = args else {
            return Err(format!("{op} expects a document of fields"));
        };
        for (path, value) in args {
            // `$rename` names its target in the value.
            let renames_onto = op == "$rename" && value.as_str().is_some_and(targets_tenant);
            let keeps_tenant = matches!(op.as_str(), "$set" | "$setOnInsert")
                && path == field
                && value.as_str() == Some(tenant.as_str());
            if renames_onto || (targets_tenant(path) && !keeps_tenant) {
                return Err(format!("update may not change {field} via {op}"));
            }
        }
    }
    Ok(())
}

fn find_forbidden(value: &Value) -> Option<&'static str> {
    match value {
        Value::Object(map) => map.iter().find_map(|(k, v)| {
            FORBIDDEN_OPERATORS
                .iter()
                .find(|op| **op == k.as_str())
                .copied()
                .or_else(|| find_forbidden(v))
        }),
        Value::Array(items) => items.iter().find_map(find_forbidden),
        _ => None,
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use serde_json::json;

    fn tenant() -> TenantId {
        TenantId::new("tenant_a").unwrap()
    }

    fn sql(s: &str) -> Result<(), String> {
        inspect_sql(s, "userId", &tenant())
    }

    fn cmd(v: serde_json::Value) -> Result<(), String> {
        let Value::Object(map) = v else {
            panic!("command must be an object")
        };
        inspect_command(&map, "userId", &tenant())
    }

    #[test]
    fn accepts_pinned_sql() {
        let cases = [
            "SELECT * FROM products WHERE userId = 'tenant_a'",
            "select name from products p where p.\"userId\" = 'tenant_a' and price > 3;",
            "SELECT count(*) FROM sales WHERE (userId = 'tenant_a') AND amount > 10 GROUP BY status ORDER BY 1 LIMIT 5",
            "UPDATE products SET price = 4 WHERE `userId`='tenant_a' AND name = 'x'",
            "DELETE FROM sales WHERE userId = 'tenant_a'",
            "INSERT INTO products (userId, name) VALUES ('tenant_a', 'x')",
            "INSERT INTO products (name, userId) VALUES ('x', 'tenant_a'), ('y', 'tenant_a') RETURNING id",
            "WITH s AS (SELECT * FROM sales WHERE userId = 'tenant_a') SELECT count(*) FROM s WHERE userId = 'tenant_a'",
        ];
        for case in cases {
            assert_eq!(sql(case), Ok(()), "{case:?} should be accepted");
        }
    }

    #[test]
    fn rejects_unscoped_or_smuggled_sql() {
        let cases = [
            "SELECT * FROM products",
            "SELECT * FROM products WHERE userId = 'tenant_b'",
            "SELECT * FROM products WHERE otheruserId = 'tenant_a'",
            "SELECT * FROM products WHERE userId = 'tenant_a' OR 1=1",
            "SELECT * FROM products WHERE userId = 'tenant_a' UNION SELECT * FROM users",
            "SELECT * FROM products WHERE userId = 'tenant_a'; DROP TABLE products",
            "SELECT * FROM products WHERE userId = 'tenant_a' -- comment",
            "DROP TABLE products",
            "TRUNCATE products",
            "INSERT INTO products (name) VALUES ('tenant_a')",
            "",
        ];
        for case in cases {
            assert!(sql(case).is_err(), "{case:?} should be rejected");
        }
    }

    #[test]
    fn predicate_must_be_a_top_level_conjunct() {
        let cases = [
            "SELECT * FROM products WHERE NOT userId = 'tenant_a'",
            "SELECT * FROM products WHERE userId = 'tenant_a' || 1=1",
            "SELECT * FROM products WHERE userId = 'tenant_a' XOR 1=1",
            "DELETE FROM products WHERE userId = 'tenant_a' IS NOT NULL",
            "DELETE FROM products WHERE userId = 'tenant_a' IS TRUE",
            "SELECT * FROM products WHERE (userId = 'tenant_a' AND 1=1) = 0",
            "SELECT * FROM products WHERE price BETWEEN 1 AND userId = 'tenant_a'",
            "SELECT * FROM products WHERE name = 'x' GROUP BY userId HAVING userId = 'tenant_a'",
        ];
        for case in cases {
            assert!(sql(case).is_err(), "{case:?} should be rejected");
        }
    }

    #[test]
    fn other_tables_cannot_be_reached() {
        let cases = [
            "SELECT (SELECT name FROM products WHERE userId = 'tenant_b') FROM products WHERE userId = 'tenant_a'",
            "SELECT * FROM products WHERE userId = 'tenant_a' AND id IN (SELECT id FROM products)",
            "SELECT * FROM products p JOIN products q ON 1=1 WHERE p.userId = 'tenant_a'",
            "SELECT * FROM products, users WHERE userId = 'tenant_a'",
            "DELETE FROM products USING users WHERE userId = 'tenant_a'",
            "UPDATE products SET name = u.name FROM users u WHERE userId = 'tenant_a'",
            "WITH s AS (SELECT * FROM sales) SELECT * FROM s WHERE userId = 'tenant_a'",
            "SELECT * FROM products WHERE userId = 'tenant_a' AND id IN (TABLE users)",
        ];
        for case in cases {
            assert!(sql(case).is_err(), "{case:?} should be rejected");
        }
    }

    #[test]
    fn quoting_cannot_hide_keywords() {
        let cases = [
            r"SELECT * FROM products WHERE userId = 'tenant_a' AND name = 'x\' OR 1=1 OR name = '",
            r#"SELECT * FROM products WHERE userId = 'tenant_a' AND name = "x\" OR 1=1 OR \"""#,
            "SELECT * FROM products WHERE userId = 'tenant_a' AND name = $$x$$",
            "SELECT * FROM products WHERE userId = 'tenant_a",
        ];
        for case in cases {
            assert!(sql(case).is_err(), "{case:?} should be rejected");
        }
        assert!(sql("SELECT * FROM products WHERE userId = 'tenant_a' AND name = 'salt or pepper; --'").is_ok());
        assert!(sql("SELECT * FROM products WHERE userId = 'tenant_a' AND name = 'it''s'").is_ok());
    }

    #[test]
    fn inserts_pin_the_tenant_column_itself() {
        let cases = [
            "INSERT INTO products (userId, name) VALUES ('tenant_b', 'tenant_a')",
            "INSERT INTO products (userId, name) VALUES ('tenant_a', 'x'), ('tenant_b', 'y')",
            "INSERT INTO products (userId, userId) VALUES ('tenant_a', 'tenant_b')",
            "INSERT INTO products (userId, name) VALUES ('tenant_a')",
            "INSERT INTO products (userId, name) SELECT userId, name FROM products",
            "INSERT INTO products (id, userId, name) VALUES (5, 'tenant_a', 'x') ON CONFLICT (id) DO UPDATE SET name = 'y'",
            "INSERT INTO products (userId, name) VALUES ('tenant_a', 'x') ON DUPLICATE KEY UPDATE name = 'y'",
            "INSERT INTO products SET userId = 'tenant_a'",
        ];
        for case in cases {
            assert!(sql(case).is_err(), "{case:?} should be rejected");
        }
    }

    #[test]
    fn updates_cannot_reassign_the_tenant() {
        assert!(sql("UPDATE products SET userId = 'tenant_b' WHERE userId = 'tenant_a'").is_err());
        assert!(sql("UPDATE products p SET p.userId = 'tenant_b' WHERE p.userId = 'tenant_a'").is_err());
        assert!(sql("UPDATE products SET (userId, name) = ('tenant_b', 'x') WHERE userId = 'tenant_a'").is_err());
    }

    #[test]
    fn accepts_pinned_commands() {
        assert!(cmd(json!({"find": "products", "filter": {"userId": "tenant_a", "name": "x"}})).is_ok());
        assert!(cmd(json!({"count": "sales", "query": {"userId": "tenant_a"}})).is_ok());
        assert!(cmd(json!({"aggregate": "sales", "pipeline": [
            {"$match": {"userId": "tenant_a"}},
            {"$group": {"_id": "$status", "total": {"$sum": "$amount"}}}
        ], "cursor": {}})).is_ok());
        assert!(cmd(json!({"insert": "products", "documents": [{"userId": "tenant_a", "name": "x"}]})).is_ok());
        assert!(cmd(json!({"update": "products", "updates": [
            {"q": {"userId": "tenant_a"}, "u": {"$set": {"price": 2}, "$rename": {"nm": "name"}}}
        ]})).is_ok());
        assert!(cmd(json!({"delete": "products", "deletes": [{"q": {"userId": "tenant_a"}, "limit": 0}]})).is_ok());
    }

    #[test]
    fn rejects_unscoped_commands() {
        let cases = [
            json!({"find": "products"}),
            json!({"find": "products", "filter": {"userId": "tenant_b"}}),
            json!({"drop": "products"}),
            json!({"filter": {"userId": "tenant_a"}, "find": "products"}),
            json!({"aggregate": "sales", "pipeline": [{"$group": {"_id": null}}, {"$match": {"userId": "tenant_a"}}]}),
            json!({"aggregate": "sales", "pipeline": [{"$match": {"userId": "tenant_a"}}, {"$lookup": {"from": "users"}}]}),
            json!({"find": "products", "filter": {"userId": "tenant_a", "$where": "true"}}),
            json!({"insert": "products", "documents": [{"name": "x"}]}),
            json!({"update": "products", "updates": [{"q": {"userId": "tenant_a"}, "u": {"$set": {"userId": "tenant_b"}}}]}),
            json!({"update": "products", "updates": [{"q": {"userId": "tenant_a"}, "u": {"$unset": {"userId": ""}}}]}),
            json!({"update": "products", "updates": [{"q": {"userId": "tenant_a"}, "u": {"name": "replaced"}}]}),
            json!({"delete": "products", "deletes": [{"q": {}, "limit": 0}]}),
        ];
        for case in cases {
            assert!(cmd(case.clone()).is_err(), "{case} should be rejected");
        }
    }

    #[test]
    fn cross_collection_and_script_operators_are_rejected() {
        let cases = [
            json!({"aggregate": "products", "pipeline": [
                {"$match": {"userId": "tenant_a"}},
                {"$graphLookup": {"from": "products", "startWith": "$name", "connectFromField": "name",
                                  "connectToField": "name", "as": "all"}}
            ]}),
            json!({"find": "products", "filter": {"userId": "tenant_a",
                "$expr": {"$function": {"body": "function() { return true; }", "args": [], "lang": "js"}}}}),
            json!({"aggregate": "sales", "pipeline": [
                {"$match": {"userId": "tenant_a"}},
                {"$group": {"_id": null, "x": {"$accumulator": {"init": "function() {}"}}}}
            ]}),
        ];
        for case in cases {
            assert!(cmd(case.clone()).is_err(), "{case} should be rejected");
        }
    }

    #[test]
    fn update_operators_cannot_move_the_tenant_key() {
        let cases = [
            json!({"$rename": {"name": "userId"}}),
            json!({"$rename": {"userId": "owner"}}),
            json!({"$rename": {"name": "userId.sub"}}),
            json!({"$set": {"userId.sub": "x"}}),
            json!({"$inc": {"userId": 1}}),
            json!({"$setOnInsert": {"userId": "tenant_b"}}),
            json!({"$set": "userId"}),
        ];
        for u in cases {
            let command = json!({"update": "products", "updates": [{"q": {"userId": "tenant_a"}, "u": u}]});
            assert!(cmd(command).is_err(), "{u} should be rejected");
        }
    }
}

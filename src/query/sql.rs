//! Lightweight SQL scanner.
//!
//! This is not a parser. It tokenizes SQLite's lexical grammar well enough to
//! classify statements, reject unsafe fragments, and pull out the handful of
//! shape facts the planner needs (tables, filter columns, ORDER BY keys, LIMIT).

use crate::catalog::schema::CheckConstraint;
use crate::error::EngineError;
use crate::query::plan::Order;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Bare identifier or keyword.
    Word,
    /// `"x"`, `` `x` `` or `[x]`; text holds the unquoted name.
    QuotedIdent,
    /// `'x'`; text holds the unescaped contents.
    Str,
    Blob,
    Number,
    Placeholder,
    LParen,
    RParen,
    Comma,
    Semicolon,
    Dot,
    Star,
    Operator,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    /// Byte span in the scanned source.
    pub start: usize,
    pub end: usize,
}

impl Token {
    fn is_word(&self, upper: &str) -> bool {
        self.kind == TokenKind::Word && self.text.eq_ignore_ascii_case(upper)
    }

    fn is_identifier(&self) -> bool {
        match self.kind {
            TokenKind::QuotedIdent => true,
            TokenKind::Word => !is_keyword(&self.text),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scanned {
    pub tokens: Vec<Token>,
    pub comments: usize,
}

impl Scanned {
    /// Non-empty statements separated by `;`.
    pub fn statement_count(&self) -> usize {
        let mut count = 0;
        let mut pending = false;
        for token in &self.tokens {
            if token.kind == TokenKind::Semicolon {
                if pending {
                    count += 1;
                }
                pending = false;
            } else {
                pending = true;
            }
        }
        count + usize::from(pending)
    }

    /// Number of bound parameters SQLite would expect (highest parameter index).
    pub fn placeholder_count(&self) -> usize {
        let mut highest = 0usize;
        let mut named: Vec<&str> = Vec::new();
        for token in self.tokens.iter().filter(|t| t.kind == TokenKind::Placeholder) {
            let text = token.text.as_str();
            if text == "?" {
                highest += 1;
            } else if let Some(n) = text.strip_prefix('?').and_then(|n| n.parse::<usize>().ok()) {
                highest = highest.max(n);
            } else if !named.contains(&text) {
                named.push(text);
                highest += 1;
            }
        }
        highest
    }
}

fn scan_err(message: impl Into<String>) -> EngineError {
    EngineError::Validation(message.into())
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b >= 0x80
}

fn is_ident_continue(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b >= 0x80
}

/// Reads a quoted run starting at `open`, where a doubled `close` is an escape.
fn quoted(sql: &str, open: usize, close: u8) -> Result<(String, usize), EngineError> {
    let bytes = sql.as_bytes();
    let mut text = String::new();
    let mut i = open + 1;
    let mut run_start = i;
    while i < bytes.len() {
        if bytes[i] == close {
            text.push_str(&sql[run_start..i]);
            if bytes.get(i + 1) == Some(&close) {
                text.push(close as char);
                i += 2;
                run_start = i;
                continue;
            }
            return Ok((text, i + 1));
        }
        i += 1;
    }
    Err(scan_err(format!("unterminated quote starting at byte {open}")))
}

pub fn tokenize(sql: &str) -> Result<Scanned, EngineError> {
    let bytes = sql.as_bytes();
    let mut out = Scanned::default();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        let next = bytes.get(i + 1).copied();
        let start = i;
        let (kind, text, end) = match c {
            b' ' | b'\t' | b'\n' | b'\r' | 0x0c => {
                i += 1;
                continue;
            }
            b'-' if next == Some(b'-') => {
                out.comments += 1;
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
                continue;
            }
            b'/' if next == Some(b'*') => {
                out.comments += 1;
                let close = sql[i + 2..]
                    .find("*/")
                    .ok_or_else(|| scan_err("unterminated block comment"))?;
                i += 2 + close + 2;
                continue;
            }
            b'\'' => {
                let (text, end) = quoted(sql, i, b'\'')?;
                (TokenKind::Str, text, end)
            }
            b'"' | b'`' => {
                let (text, end) = quoted(sql, i, c)?;
                (TokenKind::QuotedIdent, text, end)
            }
            b'[' => {
                let close = sql[i..]
                    .find(']')
                    .ok_or_else(|| scan_err("unterminated bracket identifier"))?;
                (TokenKind::QuotedIdent, sql[i + 1..i + close].to_string(), i + close + 1)
            }
            b'x' | b'X' if next == Some(b'\'') => {
                let (text, end) = quoted(sql, i + 1, b'\'')?;
                (TokenKind::Blob, text, end)
            }
            b'0'..=b'9' => {
                let mut j = i + 1;
                if c == b'0' && matches!(next, Some(b'x' | b'X')) {
                    j += 1;
                    while j < bytes.len() && bytes[j].is_ascii_hexdigit() {
                        j += 1;
                    }
                } else {
                    while j < bytes.len() {
                        let b = bytes[j];
                        let exponent_sign = matches!(b, b'+' | b'-')
                            && matches!(bytes[j - 1], b'e' | b'E');
                        if b.is_ascii_digit() || b == b'.' || b == b'e' || b == b'E' || exponent_sign
                        {
                            j += 1;
                        } else {
                            break;
                        }
                    }
                }
                (TokenKind::Number, sql[i..j].to_string(), j)
            }
            b'.' if next.is_some_and(|b| b.is_ascii_digit()) => {
                let mut j = i + 1;
                while j < bytes.len() && bytes[j].is_ascii_digit() {
                    j += 1;
                }
                (TokenKind::Number, sql[i..j].to_string(), j)
            }
            b'?' => {
                let mut j = i + 1;
                while j < bytes.len() && bytes[j].is_ascii_digit() {
                    j += 1;
                }
                (TokenKind::Placeholder, sql[i..j].to_string(), j)
            }
            b':' | b'@' | b'$' if next.is_some_and(is_ident_start) => {
                let mut j = i + 1;
                while j < bytes.len() && is_ident_continue(bytes[j]) {
                    j += 1;
                }
                (TokenKind::Placeholder, sql[i..j].to_string(), j)
            }
            b if is_ident_start(b) => {
                let mut j = i + 1;
                while j < bytes.len() && is_ident_continue(bytes[j]) {
                    j += 1;
                }
                (TokenKind::Word, sql[i..j].to_string(), j)
            }
            b'(' => (TokenKind::LParen, "(".into(), i + 1),
            b')' => (TokenKind::RParen, ")".into(), i + 1),
            b',' => (TokenKind::Comma, ",".into(), i + 1),
            b';' => (TokenKind::Semicolon, ";".into(), i + 1),
            b'.' => (TokenKind::Dot, ".".into(), i + 1),
            b'*' => (TokenKind::Star, "*".into(), i + 1),
            b'|' | b'<' | b'>' | b'!' | b'=' => {
                let two = next.is_some_and(|n| {
                    matches!(
                        (c, n),
                        (b'|', b'|')
                            | (b'<', b'=')
                            | (b'>', b'=')
                            | (b'<', b'>')
                            | (b'!', b'=')
                            | (b'=', b'=')
                            | (b'<', b'<')
                            | (b'>', b'>')
                    )
                });
                let end = if two { i + 2 } else { i + 1 };
                (TokenKind::Operator, sql[i..end].to_string(), end)
            }
            b'+' | b'-' | b'/' | b'%' | b'&' | b'~' => (TokenKind::Operator, sql[i..i + 1].to_string(), i + 1),
            other => {
                return Err(scan_err(format!(
                    "unexpected character '{}' at byte {i}",
                    other as char
                )));
            }
        };
        out.tokens.push(Token {
            kind,
            text,
            start,
            end,
        });
        i = end;
    }
    Ok(out)
}

fn is_keyword(word: &str) -> bool {
    const KEYWORDS: &[&str] = &[
        "ALL", "AND", "AS", "ASC", "BETWEEN", "BINARY", "BY", "CASE", "CAST", "COLLATE",
        "CROSS", "CURRENT_DATE", "CURRENT_TIME", "CURRENT_TIMESTAMP", "DESC", "DISTINCT", "ELSE",
        "END", "ESCAPE", "EXCEPT", "EXISTS", "FALSE", "FIRST", "FROM", "GLOB", "GROUP", "HAVING",
        "IN", "INNER", "INTERSECT", "IS", "ISNULL", "JOIN", "LAST", "LEFT", "LIKE", "LIMIT",
        "MATCH", "NATURAL", "NOCASE", "NOT", "NOTNULL", "NULL", "NULLS", "OFFSET", "ON", "OR",
        "ORDER", "OUTER", "RECURSIVE", "REGEXP", "RIGHT", "RTRIM", "SELECT", "THEN", "TRUE",
        "UNION", "USING", "VALUES", "WHEN", "WHERE", "WITH",
    ];
    let upper = word.to_ascii_uppercase();
    KEYWORDS.binary_search(&upper.as_str()).is_ok()
}

fn is_mutating_keyword(word: &str) -> bool {
    matches!(
        word.to_ascii_uppercase().as_str(),
        "INSERT"
            | "UPDATE"
            | "DELETE"
            | "REPLACE"
            | "UPSERT"
            | "DROP"
            | "ALTER"
            | "CREATE"
            | "ATTACH"
            | "DETACH"
            | "PRAGMA"
            | "VACUUM"
            | "REINDEX"
            | "ANALYZE"
            | "BEGIN"
            | "COMMIT"
            | "ROLLBACK"
            | "SAVEPOINT"
            | "RELEASE"
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    With,
    Values,
    Explain,
    Insert,
    Update,
    Delete,
    Ddl,
    Pragma,
    Transaction,
    Other,
}

impl StatementKind {
    pub fn is_read_only(self) -> bool {
        matches!(
            self,
            StatementKind::Select
                | StatementKind::With
                | StatementKind::Values
                | StatementKind::Explain
        )
    }
}

pub fn classify(scanned: &Scanned) -> StatementKind {
    let Some(first) = scanned.tokens.first() else {
        return StatementKind::Other;
    };
    if first.kind != TokenKind::Word {
        return StatementKind::Other;
    }
    match first.text.to_ascii_uppercase().as_str() {
        "SELECT" => StatementKind::Select,
        "VALUES" => StatementKind::Values,
        "EXPLAIN" => StatementKind::Explain,
        "WITH" => {
            // A CTE may front a write: WITH x AS (...) DELETE FROM ...
            let mut depth = 0i32;
            for token in &scanned.tokens[1..] {
                match token.kind {
                    TokenKind::LParen => depth += 1,
                    TokenKind::RParen => depth -= 1,
                    TokenKind::Word if depth == 0 => {
                        match token.text.to_ascii_uppercase().as_str() {
                            "SELECT" | "VALUES" => return StatementKind::With,
                            "INSERT" | "REPLACE" => return StatementKind::Insert,
                            "UPDATE" => return StatementKind::Update,
                            "DELETE" => return StatementKind::Delete,
                            _ => {}
                        }
                    }
                    _ => {}
                }
            }
            StatementKind::Other
        }
        "INSERT" | "REPLACE" => StatementKind::Insert,
        "UPDATE" => StatementKind::Update,
        "DELETE" => StatementKind::Delete,
        "CREATE" | "DROP" | "ALTER" => StatementKind::Ddl,
        "PRAGMA" => StatementKind::Pragma,
        "BEGIN" | "COMMIT" | "END" | "ROLLBACK" | "SAVEPOINT" | "RELEASE" => {
            StatementKind::Transaction
        }
        _ => StatementKind::Other,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Projection {
    Star,
    Columns(Vec<String>),
    /// Computed or aliased expressions the scanner does not interpret.
    Expressions,
}

/// What the planner needs to know about a read statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadShape {
    pub kind: StatementKind,
    pub tables: Vec<String>,
    pub projection: Projection,
    pub filter_columns: Vec<String>,
    pub order_by: Vec<(String, Order)>,
    /// ORDER BY has terms that are not plain column references.
    pub order_by_expressions: bool,
    pub has_limit: bool,
    pub has_offset: bool,
    pub has_group_by: bool,
    pub is_distinct: bool,
    pub has_join: bool,
    pub is_compound: bool,
    pub leading_wildcard_likes: Vec<String>,
    pub placeholder_count: usize,
    /// Names bound by a leading WITH clause.
    pub cte_names: Vec<String>,
}

impl ReadShape {
    /// One table, no joins, grouping or set operations.
    pub fn is_simple(&self) -> bool {
        self.tables.len() == 1 && !self.has_join && !self.has_group_by && !self.is_compound
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Clause {
    Preamble,
    Select,
    From,
    Where,
    GroupBy,
    Having,
    OrderBy,
    Limit,
    Tail,
}

/// Column references in `tokens`: identifiers that are not keywords, not
/// function names and not qualifiers (`t` in `t.col`).
pub fn column_references(tokens: &[Token]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for (i, token) in tokens.iter().enumerate() {
        if !token.is_identifier() {
            continue;
        }
        let next = tokens.get(i + 1).map(|t| t.kind);
        if matches!(next, Some(TokenKind::LParen) | Some(TokenKind::Dot)) {
            continue;
        }
        // `x AS alias`, `COLLATE NOCASE`
        if i > 0 && (tokens[i - 1].is_word("AS") || tokens[i - 1].is_word("COLLATE")) {
            continue;
        }
        let lowered = token.text.to_ascii_lowercase();
        if seen.insert(lowered) {
            out.push(token.text.clone());
        }
    }
    out
}

/// Splits `tokens` on commas at nesting depth 0.
fn split_top_level(tokens: &[Token]) -> Vec<&[Token]> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, token) in tokens.iter().enumerate() {
        match token.kind {
            TokenKind::LParen => depth += 1,
            TokenKind::RParen => depth -= 1,
            TokenKind::Comma if depth == 0 => {
                parts.push(&tokens[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if start < tokens.len() {
        parts.push(&tokens[start..]);
    }
    parts
}

/// `col`, `t.col`, optionally followed by `AS alias` or a bare alias.
fn simple_column(item: &[Token]) -> Option<String> {
    let head: &[Token] = match item {
        [a, dot, b, ..] if dot.kind == TokenKind::Dot && a.is_identifier() && b.is_identifier() => {
            &item[2..]
        }
        [a, ..] if a.is_identifier() => item,
        _ => return None,
    };
    let name = head[0].text.clone();
    match &head[1..] {
        [] => Some(name),
        [alias] if alias.is_identifier() => Some(name),
        [kw, alias] if kw.is_word("AS") && alias.is_identifier() => Some(name),
        _ => None,
    }
}

fn leading_wildcard_likes(tokens: &[Token]) -> Vec<String> {
    let mut out = Vec::new();
    for window in tokens.windows(3) {
        let [column, op, pattern] = window else {
            continue;
        };
        let like = op.is_word("LIKE") && pattern.text.starts_with('%');
        let glob = op.is_word("GLOB") && pattern.text.starts_with('*');
        if column.is_identifier() && pattern.kind == TokenKind::Str && (like || glob) {
            out.push(column.text.clone());
        }
    }
    out
}

/// Checks that `sql` is a single read-only statement and extracts its shape.
pub fn analyze_read(sql: &str) -> Result<ReadShape, EngineError> {
    let scanned = tokenize(sql)?;
    if scanned.tokens.is_empty() {
        return Err(scan_err("query is empty"));
    }
    if scanned.statement_count() != 1 {
        return Err(scan_err("query must contain exactly one statement"));
    }
    let kind = classify(&scanned);
    if !kind.is_read_only() {
        return Err(scan_err(format!(
            "only SELECT, WITH, VALUES and EXPLAIN statements are allowed, got {kind:?}"
        )));
    }
    let tokens: Vec<Token> = scanned
        .tokens
        .iter()
        .filter(|t| t.kind != TokenKind::Semicolon)
        .cloned()
        .collect();

    let mut shape = ReadShape {
        kind,
        tables: Vec::new(),
        projection: Projection::Expressions,
        filter_columns: Vec::new(),
        order_by: Vec::new(),
        order_by_expressions: false,
        has_limit: false,
        has_offset: false,
        has_group_by: false,
        is_distinct: false,
        has_join: false,
        is_compound: false,
        leading_wildcard_likes: Vec::new(),
        placeholder_count: scanned.placeholder_count(),
        cte_names: Vec::new(),
    };
    if kind == StatementKind::Explain || kind == StatementKind::Values {
        return Ok(shape);
    }

    let mut clause = Clause::Preamble;
    let mut depth = 0i32;
    let mut select_items: Vec<Token> = Vec::new();
    let mut from_items: Vec<Token> = Vec::new();
    let mut where_items: Vec<Token> = Vec::new();
    let mut order_items: Vec<Token> = Vec::new();
    let mut core_done = false;

    let mut i = 0;
    while i < tokens.len() {
        let token = &tokens[i];
        match token.kind {
            TokenKind::LParen => depth += 1,
            TokenKind::RParen => depth -= 1,
            _ => {}
        }
        if depth == 0 && token.kind == TokenKind::Word {
            let upper = token.text.to_ascii_uppercase();
            let followed_by_by = tokens.get(i + 1).is_some_and(|t| t.is_word("BY"));
            let switched = match upper.as_str() {
                "SELECT" if clause == Clause::Preamble => Some(Clause::Select),
                "SELECT" => {
                    core_done = true;
                    None
                }
                "FROM" if clause == Clause::Select => Some(Clause::From),
                "WHERE" if !core_done => Some(Clause::Where),
                "GROUP" if followed_by_by => {
                    shape.has_group_by = true;
                    Some(Clause::GroupBy)
                }
                "HAVING" => Some(Clause::Having),
                "ORDER" if followed_by_by => Some(Clause::OrderBy),
                "LIMIT" => {
                    shape.has_limit = true;
                    Some(Clause::Limit)
                }
                "OFFSET" => {
                    shape.has_offset = true;
                    Some(Clause::Tail)
                }
                "UNION" | "INTERSECT" | "EXCEPT" => {
                    shape.is_compound = true;
                    core_done = true;
                    Some(Clause::Tail)
                }
                _ => None,
            };
            if let Some(next) = switched {
                clause = next;
                i += if matches!(next, Clause::GroupBy | Clause::OrderBy) {
                    2
                } else {
                    1
                };
                continue;
            }
        }
        if clause == Clause::Preamble && depth == 0 && token.is_identifier() {
            let binds = match tokens.get(i + 1) {
                Some(next) if next.is_word("AS") => true,
                Some(next) if next.kind == TokenKind::LParen => tokens[i + 1..]
                    .iter()
                    .position(|t| t.kind == TokenKind::RParen)
                    .and_then(|close| tokens.get(i + 1 + close + 1))
                    .is_some_and(|t| t.is_word("AS")),
                _ => false,
            };
            if binds {
                shape.cte_names.push(token.text.clone());
            }
        }
        if clause == Clause::Limit && token.kind == TokenKind::Comma && depth == 0 {
            shape.has_offset = true;
        }
        match clause {
            Clause::Select if !core_done => select_items.push(token.clone()),
            Clause::From if !core_done => from_items.push(token.clone()),
            Clause::Where if !core_done => where_items.push(token.clone()),
            Clause::OrderBy => order_items.push(token.clone()),
            _ => {}
        }
        i += 1;
    }

    let select_items: Vec<Token> = match select_items.first() {
        Some(t) if t.is_word("DISTINCT") || t.is_word("ALL") => {
            shape.is_distinct = t.is_word("DISTINCT");
            select_items[1..].to_vec()
        }
        _ => select_items,
    };
    shape.projection = match select_items.as_slice() {
        [star] if star.kind == TokenKind::Star => Projection::Star,
        items => {
            let columns: Option<Vec<String>> =
                split_top_level(items).into_iter().map(simple_column).collect();
            columns.map_or(Projection::Expressions, Projection::Columns)
        }
    };

    let mut depth = 0i32;
    let mut expect_table = true;
    for (i, token) in from_items.iter().enumerate() {
        match token.kind {
            TokenKind::LParen => {
                depth += 1;
                expect_table = false;
            }
            TokenKind::RParen => depth -= 1,
            TokenKind::Comma if depth == 0 => {
                expect_table = true;
                shape.has_join = true;
            }
            TokenKind::Word if depth == 0 && token.is_word("JOIN") => {
                expect_table = true;
                shape.has_join = true;
            }
            _ if depth == 0 && expect_table && token.is_identifier() => {
                // `main.t` names t; `pragma_table_info(...)` is a function, not a table.
                let qualified_or_call = from_items
                    .get(i + 1)
                    .is_some_and(|t| matches!(t.kind, TokenKind::Dot | TokenKind::LParen));
                if !qualified_or_call {
                    shape.tables.push(token.text.clone());
                    expect_table = false;
                }
            }
            _ => {}
        }
    }

    shape.filter_columns = column_references(&where_items);
    shape.leading_wildcard_likes = leading_wildcard_likes(&where_items);

    for item in split_top_level(&order_items) {
        let mut item = item;
        let mut order = Order::Asc;
        if let Some(last) = item.last() {
            if last.is_word("DESC") {
                order = Order::Desc;
                item = &item[..item.len() - 1];
            } else if last.is_word("ASC") {
                item = &item[..item.len() - 1];
            }
        }
        match simple_column(item) {
            Some(column) if item.len() == 1 || item.len() == 3 => {
                shape.order_by.push((column, order))
            }
            _ => shape.order_by_expressions = true,
        }
    }
    Ok(shape)
}

/// Validates a caller-supplied WHERE fragment and returns the columns it references.
pub fn check_where_fragment(fragment: &str, arg_count: usize) -> Result<Vec<String>, EngineError> {
    let scanned = tokenize(fragment)?;
    if scanned.tokens.is_empty() {
        return Err(scan_err("where clause is empty"));
    }
    if scanned.comments > 0 {
        return Err(scan_err("comments are not allowed in a where clause"));
    }
    let mut depth = 0i32;
    for token in &scanned.tokens {
        match token.kind {
            TokenKind::Semicolon => {
                return Err(scan_err("statement separators are not allowed in a where clause"));
            }
            TokenKind::LParen => depth += 1,
            TokenKind::RParen => {
                depth -= 1;
                if depth < 0 {
                    return Err(scan_err("unbalanced parentheses in where clause"));
                }
            }
            TokenKind::Word if is_mutating_keyword(&token.text) => {
                return Err(scan_err(format!(
                    "keyword {} is not allowed in a where clause",
                    token.text.to_ascii_uppercase()
                )));
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(scan_err("unbalanced parentheses in where clause"));
    }
    let expected = scanned.placeholder_count();
    if expected != arg_count {
        return Err(scan_err(format!(
            "where clause has {expected} placeholders but {arg_count} arguments were supplied"
        )));
    }
    Ok(column_references(&scanned.tokens))
}

/// Pulls `CHECK (...)` constraints out of a CREATE TABLE statement.
pub fn extract_check_constraints(create_sql: &str) -> Vec<CheckConstraint> {
    let Ok(scanned) = tokenize(create_sql) else {
        return Vec::new();
    };
    let tokens = &scanned.tokens;
    let mut out = Vec::new();
    for (i, token) in tokens.iter().enumerate() {
        if !token.is_word("CHECK") || tokens.get(i + 1).map(|t| t.kind) != Some(TokenKind::LParen) {
            continue;
        }
        let open = &tokens[i + 1];
        let mut depth = 0i32;
        let mut close = None;
        for candidate in &tokens[i + 1..] {
            match candidate.kind {
                TokenKind::LParen => depth += 1,
                TokenKind::RParen => {
                    depth -= 1;
                    if depth == 0 {
                        close = Some(candidate.start);
                        break;
                    }
                }
                _ => {}
            }
        }
        let Some(close) = close else {
            continue;
        };
        let name = (i >= 2 && tokens[i - 2].is_word("CONSTRAINT")).then(|| tokens[i - 1].text.clone());
        out.push(CheckConstraint {
            name,
            expression: create_sql[open.end..close].trim().to_string(),
        });
    }
    out
}

/// Column references in a standalone SQL expression.
pub fn expression_columns(expression: &str) -> Vec<String> {
    tokenize(expression)
        .map(|scanned| column_references(&scanned.tokens))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn classifies_reads_and_writes() {
        let kind = |sql: &str| classify(&tokenize(sql).expect("scan"));
        assert_eq!(kind("select * from t"), StatementKind::Select);
        assert_eq!(
            kind("WITH x AS (SELECT 1) SELECT * FROM x"),
            StatementKind::With
        );
        assert_eq!(
            kind("WITH x AS (SELECT 1) DELETE FROM t WHERE id IN x"),
            StatementKind::Delete
        );
        assert_eq!(kind("DROP TABLE t"), StatementKind::Ddl);
        assert_eq!(kind("pragma table_info(t)"), StatementKind::Pragma);
    }

    #[test]
    fn read_analysis_rejects_writes_and_stacked_statements() {
        assert!(analyze_read("DELETE FROM users").is_err());
        assert!(analyze_read("SELECT 1; DROP TABLE users").is_err());
        assert!(analyze_read("SELECT 1;").is_ok());
        assert!(analyze_read("").is_err());
    }

    #[test]
    fn read_shape_extracts_tables_filters_and_order() {
        let shape = analyze_read(
            "SELECT id, e.label AS l FROM events e WHERE e.ts > ?1 AND label LIKE '%x' \
             ORDER BY ts DESC, id LIMIT 10",
        )
        .expect("analyze");
        assert_eq!(shape.tables, vec!["events".to_string()]);
        assert_eq!(
            shape.projection,
            Projection::Columns(vec!["id".into(), "label".into()])
        );
        assert_eq!(shape.filter_columns, vec!["ts".to_string(), "label".to_string()]);
        assert_eq!(
            shape.order_by,
            vec![("ts".to_string(), Order::Desc), ("id".to_string(), Order::Asc)]
        );
        assert_eq!(shape.leading_wildcard_likes, vec!["label".to_string()]);
        assert!(shape.has_limit);
        assert!(!shape.has_offset);
        assert_eq!(shape.placeholder_count, 1);
        assert!(shape.is_simple());
    }

    #[test]
    fn subqueries_and_joins_are_not_simple() {
        let shape = analyze_read(
            "SELECT * FROM a JOIN b ON a.id = b.a_id WHERE a.x IN (SELECT y FROM c WHERE z = 1)",
        )
        .expect("analyze");
        assert_eq!(shape.tables, vec!["a".to_string(), "b".to_string()]);
        assert!(shape.has_join);
        assert!(!shape.is_simple());
        assert_eq!(shape.projection, Projection::Star);
    }

    #[test]
    fn where_fragments_are_screened() {
        assert_eq!(
            check_where_fragment("id = ? AND name = ?", 2).expect("ok"),
            vec!["id".to_string(), "name".to_string()]
        );
        assert!(check_where_fragment("id = ?", 0).is_err());
        assert!(check_where_fragment("id = 1; DROP TABLE users", 0).is_err());
        assert!(check_where_fragment("id = 1 -- trailing", 0).is_err());
        assert!(check_where_fragment("name = 'unterminated", 0).is_err());
        assert!(check_where_fragment("(id = 1", 0).is_err());
        assert!(check_where_fragment("id IN (SELECT id FROM t)", 0).is_ok());
        assert!(check_where_fragment("id = 1 OR 1 = (DELETE FROM t)", 0).is_err());
        assert!(check_where_fragment("   ", 0).is_err());
    }

    #[test]
    fn placeholders_follow_sqlite_numbering() {
        let count = |sql: &str| tokenize(sql).expect("scan").placeholder_count();
        assert_eq!(count("a = ? AND b = ?"), 2);
        assert_eq!(count("a = ?3"), 3);
        assert_eq!(count("a = :x OR b = :x OR c = :y"), 2);
    }

    #[test]
    fn check_constraints_are_extracted_with_names() {
        let checks = extract_check_constraints(
            "CREATE TABLE p (age INTEGER CHECK (age >= 0), \
             price REAL, CONSTRAINT positive_price CHECK (price > 0 AND (price < 1e9)))",
        );
        assert_eq!(checks.len(), 2);
        assert_eq!(checks[0].name, None);
        assert_eq!(checks[0].expression, "age >= 0");
        assert_eq!(checks[1].name.as_deref(), Some("positive_price"));
        assert_eq!(checks[1].expression, "price > 0 AND (price < 1e9)");
        assert_eq!(
            expression_columns(&checks[1].expression),
            vec!["price".to_string()]
        );
    }

    #[test]
    fn cte_names_are_collected() {
        let shape = analyze_read(
            "WITH recent(id) AS (SELECT id FROM events), big AS (SELECT 1) SELECT * FROM recent",
        )
        .expect("analyze");
        assert_eq!(shape.cte_names, vec!["recent".to_string(), "big".to_string()]);
        assert_eq!(shape.tables, vec!["recent".to_string()]);
    }

    #[test]
    fn quoted_strings_hide_keywords() {
        let shape = analyze_read("SELECT * FROM t WHERE note = 'x; DROP TABLE t'").expect("ok");
        assert_eq!(shape.filter_columns, vec!["note".to_string()]);
    }

    proptest! {
        #[test]
        fn scanner_never_panics(input in "\\PC{0,64}") {
            let _ = tokenize(&input);
            let _ = analyze_read(&input);
            let _ = check_where_fragment(&input, 0);
        }

        #[test]
        fn classification_ignores_case_and_leading_space(pad in "[ \t\n]{0,4}", upper in any::<bool>()) {
            let keyword = if upper { "SELECT" } else { "select" };
            let sql = format!("{pad}{keyword} 1");
            prop_assert_eq!(classify(&tokenize(&sql).expect("scan")), StatementKind::Select);
        }
    }
}

// pgvault/src/utils/sql_filter.rs
//! Line-oriented filter over plain-format `pg_dump` output.
//!
//! Tables listed as environment-local (for example the cluster's own auth
//! table) are dropped from the stream: their data at dump time, and every
//! statement touching them at restore time, so the target keeps its own copy.

use regex::Regex;
use std::io::{self, Write};
use std::sync::OnceLock;

/// Which statements of an excluded table are removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterScope {
    /// `COPY ... FROM stdin` blocks and `INSERT` statements.
    DataOnly,
    /// Data plus DDL, grants, comments, indexes and serial sequences.
    All,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    schema: Option<String>,
    name: String,
}

impl TableRef {
    fn parse(raw: &str) -> Option<Self> {
        Self::from_parts(&split_identifier(raw))
    }

    fn from_parts(parts: &[String]) -> Option<Self> {
        match parts {
            [name] if !name.is_empty() => Some(TableRef {
                schema: None,
                name: name.clone(),
            }),
            [schema, name] if !name.is_empty() => Some(TableRef {
                schema: Some(schema.clone()),
                name: name.clone(),
            }),
            _ => None,
        }
    }

    /// Unqualified names resolve to `public`, as in a default `search_path`.
    fn same_object(&self, other: &TableRef) -> bool {
        let schema = |r: &TableRef| r.schema.clone().unwrap_or_else(|| "public".to_string());
        self.name == other.name && schema(self) == schema(other)
    }
}

/// A sequence tied to a table column by `OWNED BY` or an identity column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceOwner {
    pub database: String,
    pub sequence: TableRef,
    pub table: TableRef,
}

/// Splits `schema."Table"` into its unquoted parts.
fn split_identifier(raw: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = raw.trim().chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            '.' if !quoted => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);
    parts
}

#[derive(Debug, Clone, Default)]
pub struct TableFilter {
    entries: Vec<TableRef>,
    /// `(database, sequence)` pairs owned by an excluded table.
    owned_sequences: Vec<(String, TableRef)>,
}

impl TableFilter {
    /// Entries are `table` (any schema) or `schema.table`.
    pub fn new(entries: &[String]) -> Self {
        TableFilter {
            entries: entries.iter().filter_map(|e| TableRef::parse(e)).collect(),
            owned_sequences: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn excludes_table(&self, qualified: &str) -> bool {
        TableRef::parse(qualified).is_some_and(|target| self.excludes(&target))
    }

    fn excludes(&self, target: &TableRef) -> bool {
        self.entries.iter().any(|e| {
            e.name == target.name
                && match (&e.schema, &target.schema) {
                    (Some(a), Some(b)) => a == b,
                    (Some(a), None) => a == "public",
                    (None, _) => true,
                }
        })
    }

    /// Copy of this filter that also drops the sequences owned by excluded
    /// tables. Owners come from a first pass over the same stream.
    pub fn with_sequence_owners(&self, owners: &[SequenceOwner]) -> TableFilter {
        let mut filter = self.clone();
        filter.owned_sequences = owners
            .iter()
            .filter(|o| self.excludes(&o.table))
            .map(|o| (o.database.clone(), o.sequence.clone()))
            .collect();
        filter
    }

    fn excludes_sequence(&self, database: &str, qualified: &str) -> bool {
        let Some(target) = TableRef::parse(qualified) else {
            return false;
        };
        self.owned_sequences
            .iter()
            .any(|(db, seq)| db == database && seq.same_object(&target))
    }
}

const IDENT_PART: &str = r#"(?:"(?:[^"]|"")+"|[\w$]+)"#;
const IDENT: &str = r#"(?:"(?:[^"]|"")+"|[\w$]+)(?:\.(?:"(?:[^"]|"")+"|[\w$]+))?"#;

fn table_statement_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(&format!(
            r"(?is)^\s*(?:DROP\s+TABLE(?:\s+IF\s+EXISTS)?|CREATE(?:\s+UNLOGGED)?\s+TABLE(?:\s+IF\s+NOT\s+EXISTS)?|ALTER\s+TABLE(?:\s+IF\s+EXISTS)?(?:\s+ONLY)?|TRUNCATE(?:\s+TABLE)?(?:\s+ONLY)?|COMMENT\s+ON\s+TABLE|(?:GRANT|REVOKE)\s+.+?\s+ON\s+TABLE|CREATE\s+(?:UNIQUE\s+)?INDEX\s+.+?\s+ON(?:\s+ONLY)?)\s+(?P<name>{IDENT})"
        ))
        .expect("table statement pattern is valid")
    })
}

fn data_statement_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(&format!(r"(?is)^\s*(?:INSERT\s+INTO|COPY)\s+(?P<name>{IDENT})"))
            .expect("data statement pattern is valid")
    })
}

fn sequence_statement_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(&format!(
            r"(?is)^\s*(?:(?:DROP|CREATE|ALTER)\s+SEQUENCE(?:\s+IF\s+(?:NOT\s+)?EXISTS)?\s+(?P<name>{IDENT})|SELECT\s+pg_catalog\.setval\('(?P<setval>[^']+)')"
        ))
        .expect("sequence statement pattern is valid")
    })
}

fn owned_by_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(&format!(
            r"(?is)^\s*ALTER\s+SEQUENCE\s+(?P<seq>{IDENT})\s+OWNED\s+BY\s+(?P<column>{IDENT_PART}(?:\.{IDENT_PART}){{1,2}})"
        ))
        .expect("owned by pattern is valid")
    })
}

fn identity_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(&format!(
            r"(?is)^\s*ALTER\s+TABLE(?:\s+ONLY)?\s+(?P<table>{IDENT})\s+ALTER\s+COLUMN\s+.+?\bSEQUENCE\s+NAME\s+(?P<seq>{IDENT})"
        ))
        .expect("identity pattern is valid")
    })
}

fn dollar_tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\$(?:[A-Za-z_][A-Za-z_0-9]*)?\$").expect("dollar tag pattern is valid")
    })
}

/// Open literal or quoted identifier carried from one line to the next.
#[derive(Debug, Default)]
struct Quoting {
    single: bool,
    double: bool,
    dollar: Option<String>,
}

impl Quoting {
    fn is_open(&self) -> bool {
        self.single || self.double || self.dollar.is_some()
    }

    fn scan(&mut self, line: &str) {
        let mut rest = line;
        while !rest.is_empty() {
            if let Some(tag) = &self.dollar {
                let Some(at) = rest.find(tag.as_str()) else {
                    return;
                };
                rest = &rest[at + tag.len()..];
                self.dollar = None;
                continue;
            }
            if self.single || self.double {
                let close = if self.single { '\'' } else { '"' };
                let Some(at) = rest.find(close) else {
                    return;
                };
                rest = &rest[at + 1..];
                self.single = false;
                self.double = false;
                continue;
            }
            if rest.starts_with("--") {
                return;
            }
            if let Some(tag) = dollar_tag_pattern().find(rest) {
                self.dollar = Some(tag.as_str().to_string());
                rest = &rest[tag.end()..];
                continue;
            }
            let mut chars = rest.chars();
            match chars.next() {
                Some('\'') => self.single = true,
                Some('"') => self.double = true,
                Some(c) if c.is_alphanumeric() || c == '_' => {
                    // `$` inside an identifier never opens a dollar quote.
                    let word = rest
                        .find(|c: char| !(c.is_alphanumeric() || c == '_' || c == '$'))
                        .unwrap_or(rest.len());
                    rest = &rest[word..];
                    continue;
                }
                _ => {}
            }
            rest = chars.as_str();
        }
    }
}

fn is_copy_from_stdin(statement: &str) -> bool {
    let trimmed = statement.trim_end();
    trimmed.starts_with("COPY ") && trimmed.ends_with("FROM stdin;")
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterStats {
    pub skipped_statements: usize,
    pub skipped_rows: usize,
    /// Databases switched to with `\connect`, in stream order.
    pub databases: Vec<String>,
    /// Recorded only when the filter has entries.
    pub sequence_owners: Vec<SequenceOwner>,
}

enum State {
    Normal,
    Statement { lines: Vec<Vec<u8>>, quoting: Quoting },
    Copy { skip: bool },
}

/// Incremental filter: feed raw lines (newline included), call `finish`.
pub struct SqlStreamFilter<'a> {
    filter: &'a TableFilter,
    scope: FilterScope,
    state: State,
    stats: FilterStats,
}

impl<'a> SqlStreamFilter<'a> {
    pub fn new(filter: &'a TableFilter, scope: FilterScope) -> Self {
        SqlStreamFilter {
            filter,
            scope,
            state: State::Normal,
            stats: FilterStats::default(),
        }
    }

    pub fn push_line<W: Write>(&mut self, raw: &[u8], out: &mut W) -> io::Result<()> {
        let text = String::from_utf8_lossy(raw);
        let line = text.trim_end_matches(['\n', '\r']);

        match &mut self.state {
            State::Copy { skip } => {
                if *skip {
                    if line != "\\." {
                        self.stats.skipped_rows += 1;
                    }
                } else {
                    out.write_all(raw)?;
                }
                if line == "\\." {
                    self.state = State::Normal;
                }
                Ok(())
            }
            State::Normal => {
                let trimmed = line.trim_start();
                if trimmed.is_empty() || trimmed.starts_with("--") {
                    return out.write_all(raw);
                }
                if trimmed.starts_with('\\') {
                    if let Some(db) = parse_connect(trimmed) {
                        self.stats.databases.push(db);
                    }
                    return out.write_all(raw);
                }
                self.state = State::Statement {
                    lines: Vec::new(),
                    quoting: Quoting::default(),
                };
                self.continue_statement(raw, line, out)
            }
            State::Statement { .. } => self.continue_statement(raw, line, out),
        }
    }

    fn continue_statement<W: Write>(&mut self, raw: &[u8], line: &str, out: &mut W) -> io::Result<()> {
        let State::Statement { lines, quoting } = &mut self.state else {
            return Ok(());
        };
        lines.push(raw.to_vec());
        quoting.scan(line);
        let complete = !quoting.is_open()
            && (line.trim_end().ends_with(';') || line.trim_end().ends_with("\\gexec"));
        if !complete {
            return Ok(());
        }

        let lines = std::mem::take(lines);
        let statement: String = lines
            .iter()
            .map(|l| String::from_utf8_lossy(l).into_owned())
            .collect();
        if !self.filter.is_empty() {
            self.record_sequence_owner(&statement);
        }
        let skip = self.should_skip(&statement);
        self.state = if is_copy_from_stdin(&statement) {
            State::Copy { skip }
        } else {
            State::Normal
        };
        if skip {
            self.stats.skipped_statements += 1;
            return Ok(());
        }
        for l in &lines {
            out.write_all(l)?;
        }
        Ok(())
    }

    fn should_skip(&self, statement: &str) -> bool {
        if self.filter.is_empty() {
            return false;
        }
        if let Some(caps) = data_statement_pattern().captures(statement) {
            return self.filter.excludes_table(&caps["name"]);
        }
        if self.scope == FilterScope::DataOnly {
            return false;
        }
        if let Some(caps) = table_statement_pattern().captures(statement) {
            return self.filter.excludes_table(&caps["name"]);
        }
        if let Some(caps) = sequence_statement_pattern().captures(statement) {
            let name = caps
                .name("name")
                .or_else(|| caps.name("setval"))
                .map(|m| m.as_str())
                .unwrap_or_default();
            return self.filter.excludes_sequence(self.current_database(), name);
        }
        false
    }

    fn current_database(&self) -> &str {
        self.stats.databases.last().map(String::as_str).unwrap_or_default()
    }

    fn record_sequence_owner(&mut self, statement: &str) {
        let (sequence, table) = if let Some(caps) = owned_by_pattern().captures(statement) {
            let mut column = split_identifier(&caps["column"]);
            column.pop();
            (TableRef::parse(&caps["seq"]), TableRef::from_parts(&column))
        } else if let Some(caps) = identity_pattern().captures(statement) {
            (TableRef::parse(&caps["seq"]), TableRef::parse(&caps["table"]))
        } else {
            return;
        };
        if let (Some(sequence), Some(table)) = (sequence, table) {
            let database = self.current_database().to_string();
            self.stats.sequence_owners.push(SequenceOwner {
                database,
                sequence,
                table,
            });
        }
    }

    /// Flushes a trailing unterminated statement and returns the stats.
    pub fn finish<W: Write>(mut self, out: &mut W) -> io::Result<FilterStats> {
        if let State::Statement { lines, .. } = std::mem::replace(&mut self.state, State::Normal) {
            for l in &lines {
                out.write_all(l)?;
            }
        }
        Ok(self.stats)
    }
}

fn parse_connect(meta: &str) -> Option<String> {
    let mut parts = meta.splitn(2, char::is_whitespace);
    let command = parts.next()?;
    if command != "\\connect" && command != "\\c" {
        return None;
    }
    let arg = parts.next()?.trim();
    let arg = arg.strip_prefix("-reuse-previous=on").unwrap_or(arg).trim();
    let name = split_identifier(arg.split_whitespace().next()?).join(".");
    (!name.is_empty()).then_some(name)
}

//! Statement-list parser for the query surface.
//!
//! The full query language is out of scope; this parser covers exactly
//! the statement forms the executor dispatches on. Statements are
//! separated by `;` and keywords are case-insensitive.

use crate::config::parse_duration;
use crate::meta::Privilege;
use crate::{Error, Result};
use chrono::DateTime;

/// A parsed statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select(SelectStatement),
    CreateDatabase {
        name: String,
    },
    DropDatabase {
        name: String,
    },
    ShowDatabases,
    CreateRetentionPolicy {
        name: String,
        database: String,
        duration: i64,
        replica_n: u32,
        default: bool,
    },
    DropRetentionPolicy {
        name: String,
        database: String,
    },
    ShowRetentionPolicies {
        database: String,
    },
    CreateUser {
        name: String,
        password: String,
    },
    DropUser {
        name: String,
    },
    ShowUsers,
    Grant {
        privilege: Privilege,
        database: Option<String>,
        user: String,
    },
    Revoke {
        privilege: Privilege,
        database: Option<String>,
        user: String,
    },
    ShowMeasurements,
    ShowSeries,
    CreateContinuousQuery {
        name: String,
        database: String,
        /// The raw inner SELECT, re-executed on each interval.
        query: String,
        target_measurement: String,
        interval: i64,
    },
    DropContinuousQuery {
        name: String,
        database: String,
    },
    ShowContinuousQueries,
}

/// A SELECT over one measurement with optional time bounds.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectStatement {
    /// Requested field names; empty means `*`.
    pub fields: Vec<String>,
    pub measurement: String,
    /// `INTO` target, used by continuous queries.
    pub into: Option<String>,
    /// Inclusive lower time bound, nanoseconds.
    pub start: Option<i64>,
    /// Exclusive upper time bound, nanoseconds.
    pub end: Option<i64>,
    /// `GROUP BY time(...)` interval, nanoseconds.
    pub group_interval: Option<i64>,
    /// Per-series row limit.
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Str(String),
    Symbol(char),
}

struct Lexer {
    tokens: Vec<(Token, usize, usize)>,
    pos: usize,
    text: String,
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidQuery(msg.into())
}

impl Lexer {
    fn new(text: &str) -> Result<Self> {
        let bytes = text.as_bytes();
        let mut tokens = Vec::new();
        let mut i = 0usize;
        while i < bytes.len() {
            let c = bytes[i] as char;
            if c.is_whitespace() {
                i += 1;
            } else if c == '\'' || c == '"' {
                let quote = c;
                let start = i;
                i += 1;
                let content_start = i;
                while i < bytes.len() && bytes[i] as char != quote {
                    i += 1;
                }
                if i >= bytes.len() {
                    return Err(invalid(format!("unterminated string at byte {start}")));
                }
                let content = text[content_start..i].to_string();
                i += 1;
                // Double quotes delimit identifiers, single quotes strings.
                let token = if quote == '"' {
                    Token::Word(content)
                } else {
                    Token::Str(content)
                };
                tokens.push((token, start, i));
            } else if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
                let start = i;
                while i < bytes.len() {
                    let c = bytes[i] as char;
                    if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' || c == ':' {
                        i += 1;
                    } else {
                        break;
                    }
                }
                tokens.push((Token::Word(text[start..i].to_string()), start, i));
            } else {
                tokens.push((Token::Symbol(c), i, i + 1));
                i += 1;
            }
        }
        Ok(Self {
            tokens,
            pos: 0,
            text: text.to_string(),
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _, _)| t)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).map(|(t, _, _)| t.clone());
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn peek_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w.eq_ignore_ascii_case(kw))
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.peek_keyword(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, kw: &str) -> Result<()> {
        if self.eat_keyword(kw) {
            Ok(())
        } else {
            Err(invalid(format!("expected {kw}, got {}", self.describe())))
        }
    }

    fn expect_word(&mut self) -> Result<String> {
        match self.next() {
            Some(Token::Word(w)) => Ok(w),
            other => Err(invalid(format!("expected identifier, got {other:?}"))),
        }
    }

    fn expect_string(&mut self) -> Result<String> {
        match self.next() {
            Some(Token::Str(s)) => Ok(s),
            other => Err(invalid(format!("expected string, got {other:?}"))),
        }
    }

    fn expect_symbol(&mut self, sym: char) -> Result<()> {
        match self.next() {
            Some(Token::Symbol(c)) if c == sym => Ok(()),
            other => Err(invalid(format!("expected {sym:?}, got {other:?}"))),
        }
    }

    fn describe(&self) -> String {
        match self.peek() {
            Some(t) => format!("{t:?}"),
            None => "end of input".to_string(),
        }
    }

    /// The source text between the current position and the next `END`
    /// keyword (exclusive), used to preserve continuous-query bodies.
    fn slice_until_end_keyword(&self) -> Option<(usize, usize)> {
        let start = self.tokens.get(self.pos).map(|(_, s, _)| *s)?;
        for (token, s, _) in &self.tokens[self.pos..] {
            if let Token::Word(w) = token {
                if w.eq_ignore_ascii_case("END") {
                    return Some((start, *s));
                }
            }
        }
        None
    }
}

/// Parse a `;`-separated statement list.
pub fn parse_query(text: &str) -> Result<Vec<Statement>> {
    let mut lexer = Lexer::new(text)?;
    let mut statements = Vec::new();
    loop {
        while matches!(lexer.peek(), Some(Token::Symbol(';'))) {
            lexer.pos += 1;
        }
        if lexer.peek().is_none() {
            break;
        }
        statements.push(parse_statement(&mut lexer)?);
        match lexer.peek() {
            None | Some(Token::Symbol(';')) => {}
            _ => {
                return Err(invalid(format!(
                    "unexpected trailing input: {}",
                    lexer.describe()
                )))
            }
        }
    }
    if statements.is_empty() {
        return Err(invalid("empty query"));
    }
    Ok(statements)
}

fn parse_statement(lexer: &mut Lexer) -> Result<Statement> {
    let keyword = lexer.expect_word()?;
    match keyword.to_ascii_uppercase().as_str() {
        "SELECT" => Ok(Statement::Select(parse_select(lexer)?)),
        "CREATE" => parse_create(lexer),
        "DROP" => parse_drop(lexer),
        "SHOW" => parse_show(lexer),
        "GRANT" => parse_grant_revoke(lexer, true),
        "REVOKE" => parse_grant_revoke(lexer, false),
        other => Err(invalid(format!("unknown statement {other}"))),
    }
}

fn parse_select(lexer: &mut Lexer) -> Result<SelectStatement> {
    let mut select = SelectStatement::default();

    // Field list
    loop {
        match lexer.next() {
            Some(Token::Symbol('*')) => {}
            Some(Token::Word(w)) => select.fields.push(w),
            other => return Err(invalid(format!("expected field, got {other:?}"))),
        }
        if matches!(lexer.peek(), Some(Token::Symbol(','))) {
            lexer.pos += 1;
        } else {
            break;
        }
    }

    if lexer.eat_keyword("INTO") {
        select.into = Some(lexer.expect_word()?);
    }

    lexer.expect_keyword("FROM")?;
    select.measurement = lexer.expect_word()?;

    if lexer.eat_keyword("WHERE") {
        parse_time_conditions(lexer, &mut select)?;
    }

    if lexer.eat_keyword("GROUP") {
        lexer.expect_keyword("BY")?;
        lexer.expect_keyword("time")?;
        lexer.expect_symbol('(')?;
        let dur = lexer.expect_word()?;
        select.group_interval = Some(parse_duration_value(&dur)?);
        lexer.expect_symbol(')')?;
    }

    if lexer.eat_keyword("LIMIT") {
        let n = lexer.expect_word()?;
        select.limit = Some(
            n.parse()
                .map_err(|_| invalid(format!("bad limit {n:?}")))?,
        );
    }

    Ok(select)
}

fn parse_time_conditions(lexer: &mut Lexer, select: &mut SelectStatement) -> Result<()> {
    loop {
        lexer.expect_keyword("time")?;
        let op = match lexer.next() {
            Some(Token::Symbol(c @ ('<' | '>' | '='))) => {
                let mut op = c.to_string();
                if matches!(lexer.peek(), Some(Token::Symbol('='))) && c != '=' {
                    lexer.pos += 1;
                    op.push('=');
                }
                op
            }
            other => return Err(invalid(format!("expected comparison, got {other:?}"))),
        };
        let value = parse_time_value(lexer)?;
        match op.as_str() {
            ">=" => select.start = Some(value),
            ">" => select.start = Some(value + 1),
            "<" => select.end = Some(value),
            "<=" => select.end = Some(value + 1),
            "=" => {
                select.start = Some(value);
                select.end = Some(value + 1);
            }
            _ => return Err(invalid(format!("unsupported operator {op}"))),
        }
        if !lexer.eat_keyword("AND") {
            break;
        }
    }
    Ok(())
}

fn parse_time_value(lexer: &mut Lexer) -> Result<i64> {
    match lexer.next() {
        Some(Token::Word(w)) => w
            .parse::<i64>()
            .map_err(|_| invalid(format!("bad time value {w:?}"))),
        Some(Token::Str(s)) => DateTime::parse_from_rfc3339(&s)
            .map_err(|e| invalid(format!("bad time {s:?}: {e}")))?
            .timestamp_nanos_opt()
            .ok_or_else(|| invalid(format!("time {s:?} out of range"))),
        other => Err(invalid(format!("expected time value, got {other:?}"))),
    }
}

fn parse_duration_value(word: &str) -> Result<i64> {
    if word.eq_ignore_ascii_case("INF") {
        return Ok(0);
    }
    let dur = parse_duration(word).map_err(invalid)?;
    Ok(dur.as_nanos() as i64)
}

fn parse_create(lexer: &mut Lexer) -> Result<Statement> {
    let kind = lexer.expect_word()?;
    match kind.to_ascii_uppercase().as_str() {
        "DATABASE" => Ok(Statement::CreateDatabase {
            name: lexer.expect_word()?,
        }),
        "RETENTION" => {
            lexer.expect_keyword("POLICY")?;
            let name = lexer.expect_word()?;
            lexer.expect_keyword("ON")?;
            let database = lexer.expect_word()?;
            lexer.expect_keyword("DURATION")?;
            let duration = parse_duration_value(&lexer.expect_word()?)?;
            lexer.expect_keyword("REPLICATION")?;
            let n = lexer.expect_word()?;
            let replica_n: u32 = n
                .parse()
                .map_err(|_| invalid(format!("bad replication factor {n:?}")))?;
            let default = lexer.eat_keyword("DEFAULT");
            Ok(Statement::CreateRetentionPolicy {
                name,
                database,
                duration,
                replica_n,
                default,
            })
        }
        "USER" => {
            let name = lexer.expect_word()?;
            lexer.expect_keyword("WITH")?;
            lexer.expect_keyword("PASSWORD")?;
            let password = lexer.expect_string()?;
            Ok(Statement::CreateUser { name, password })
        }
        "CONTINUOUS" => {
            lexer.expect_keyword("QUERY")?;
            let name = lexer.expect_word()?;
            lexer.expect_keyword("ON")?;
            let database = lexer.expect_word()?;
            lexer.expect_keyword("BEGIN")?;
            let raw = lexer
                .slice_until_end_keyword()
                .map(|(s, e)| lexer.text[s..e].trim().to_string())
                .ok_or_else(|| invalid("continuous query missing END"))?;
            lexer.expect_keyword("SELECT")?;
            let select = parse_select(lexer)?;
            lexer.expect_keyword("END")?;
            let target_measurement = select
                .into
                .clone()
                .ok_or_else(|| invalid("continuous query requires INTO"))?;
            let interval = select
                .group_interval
                .ok_or_else(|| invalid("continuous query requires GROUP BY time()"))?;
            Ok(Statement::CreateContinuousQuery {
                name,
                database,
                query: raw,
                target_measurement,
                interval,
            })
        }
        other => Err(invalid(format!("cannot create {other}"))),
    }
}

fn parse_drop(lexer: &mut Lexer) -> Result<Statement> {
    let kind = lexer.expect_word()?;
    match kind.to_ascii_uppercase().as_str() {
        "DATABASE" => Ok(Statement::DropDatabase {
            name: lexer.expect_word()?,
        }),
        "RETENTION" => {
            lexer.expect_keyword("POLICY")?;
            let name = lexer.expect_word()?;
            lexer.expect_keyword("ON")?;
            let database = lexer.expect_word()?;
            Ok(Statement::DropRetentionPolicy { name, database })
        }
        "USER" => Ok(Statement::DropUser {
            name: lexer.expect_word()?,
        }),
        "CONTINUOUS" => {
            lexer.expect_keyword("QUERY")?;
            let name = lexer.expect_word()?;
            lexer.expect_keyword("ON")?;
            let database = lexer.expect_word()?;
            Ok(Statement::DropContinuousQuery { name, database })
        }
        other => Err(invalid(format!("cannot drop {other}"))),
    }
}

fn parse_show(lexer: &mut Lexer) -> Result<Statement> {
    let kind = lexer.expect_word()?;
    match kind.to_ascii_uppercase().as_str() {
        "DATABASES" => Ok(Statement::ShowDatabases),
        "USERS" => Ok(Statement::ShowUsers),
        "MEASUREMENTS" => Ok(Statement::ShowMeasurements),
        "SERIES" => Ok(Statement::ShowSeries),
        "RETENTION" => {
            lexer.expect_keyword("POLICIES")?;
            lexer.expect_keyword("ON")?;
            let database = lexer.expect_word()?;
            Ok(Statement::ShowRetentionPolicies { database })
        }
        "CONTINUOUS" => {
            lexer.expect_keyword("QUERIES")?;
            Ok(Statement::ShowContinuousQueries)
        }
        other => Err(invalid(format!("cannot show {other}"))),
    }
}

fn parse_grant_revoke(lexer: &mut Lexer, grant: bool) -> Result<Statement> {
    let word = lexer.expect_word()?;
    let privilege = match word.to_ascii_uppercase().as_str() {
        "READ" => Privilege::Read,
        "WRITE" => Privilege::Write,
        "ALL" => {
            lexer.eat_keyword("PRIVILEGES");
            Privilege::All
        }
        _ => return Err(Error::InvalidGrantRevoke),
    };
    let database = if lexer.eat_keyword("ON") {
        Some(lexer.expect_word()?)
    } else {
        None
    };
    // Only a full-cluster grant may omit the database.
    if database.is_none() && privilege != Privilege::All {
        return Err(Error::InvalidGrantRevoke);
    }
    lexer.expect_keyword(if grant { "TO" } else { "FROM" })?;
    let user = lexer.expect_word()?;
    Ok(if grant {
        Statement::Grant {
            privilege,
            database,
            user,
        }
    } else {
        Statement::Revoke {
            privilege,
            database,
            user,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one(text: &str) -> Statement {
        let mut statements = parse_query(text).unwrap();
        assert_eq!(statements.len(), 1);
        statements.remove(0)
    }

    #[test]
    fn select_star_with_time_range() {
        let Statement::Select(s) = one("SELECT * FROM cpu WHERE time >= 100 AND time < 200")
        else {
            panic!("expected select");
        };
        assert!(s.fields.is_empty());
        assert_eq!(s.measurement, "cpu");
        assert_eq!(s.start, Some(100));
        assert_eq!(s.end, Some(200));
    }

    #[test]
    fn select_fields_and_limit() {
        let Statement::Select(s) = one("select value, usage from cpu limit 10") else {
            panic!("expected select");
        };
        assert_eq!(s.fields, vec!["value", "usage"]);
        assert_eq!(s.limit, Some(10));
    }

    #[test]
    fn select_with_rfc3339_bound() {
        let Statement::Select(s) = one("SELECT * FROM cpu WHERE time >= '2020-01-01T00:00:00Z'")
        else {
            panic!("expected select");
        };
        assert_eq!(s.start, Some(1_577_836_800_000_000_000));
    }

    #[test]
    fn statement_list_preserves_order() {
        let statements =
            parse_query("CREATE DATABASE a; CREATE DATABASE b; SHOW DATABASES").unwrap();
        assert_eq!(statements.len(), 3);
        assert_eq!(statements[0], Statement::CreateDatabase { name: "a".into() });
        assert_eq!(statements[2], Statement::ShowDatabases);
    }

    #[test]
    fn retention_policy_statement() {
        let statement =
            one("CREATE RETENTION POLICY weekly ON metrics DURATION 7d REPLICATION 2 DEFAULT");
        assert_eq!(
            statement,
            Statement::CreateRetentionPolicy {
                name: "weekly".into(),
                database: "metrics".into(),
                duration: 7 * 24 * 3_600_000_000_000,
                replica_n: 2,
                default: true,
            }
        );
    }

    #[test]
    fn infinite_duration() {
        let Statement::CreateRetentionPolicy { duration, .. } =
            one("CREATE RETENTION POLICY keep ON metrics DURATION INF REPLICATION 1")
        else {
            panic!("expected create retention policy");
        };
        assert_eq!(duration, 0);
    }

    #[test]
    fn user_and_grant_statements() {
        assert_eq!(
            one("CREATE USER bob WITH PASSWORD 'pa55 word'"),
            Statement::CreateUser {
                name: "bob".into(),
                password: "pa55 word".into(),
            }
        );
        assert_eq!(
            one("GRANT READ ON metrics TO bob"),
            Statement::Grant {
                privilege: Privilege::Read,
                database: Some("metrics".into()),
                user: "bob".into(),
            }
        );
        assert_eq!(
            one("GRANT ALL PRIVILEGES TO bob"),
            Statement::Grant {
                privilege: Privilege::All,
                database: None,
                user: "bob".into(),
            }
        );
        assert_eq!(
            one("REVOKE WRITE ON metrics FROM bob"),
            Statement::Revoke {
                privilege: Privilege::Write,
                database: Some("metrics".into()),
                user: "bob".into(),
            }
        );
    }

    #[test]
    fn scoped_grant_requires_database() {
        assert!(matches!(
            parse_query("GRANT READ TO bob"),
            Err(Error::InvalidGrantRevoke)
        ));
    }

    #[test]
    fn continuous_query_statement() {
        let statement = one(
            "CREATE CONTINUOUS QUERY rollup ON metrics BEGIN \
             SELECT value INTO cpu_1h FROM cpu GROUP BY time(1h) END",
        );
        let Statement::CreateContinuousQuery {
            name,
            database,
            query,
            target_measurement,
            interval,
        } = statement
        else {
            panic!("expected create continuous query");
        };
        assert_eq!(name, "rollup");
        assert_eq!(database, "metrics");
        assert_eq!(target_measurement, "cpu_1h");
        assert_eq!(interval, 3_600_000_000_000);
        assert!(query.starts_with("SELECT value INTO cpu_1h"));
    }

    #[test]
    fn continuous_query_requires_interval_and_target() {
        assert!(parse_query(
            "CREATE CONTINUOUS QUERY x ON db BEGIN SELECT v INTO t FROM cpu END"
        )
        .is_err());
        assert!(parse_query(
            "CREATE CONTINUOUS QUERY x ON db BEGIN SELECT v FROM cpu GROUP BY time(1h) END"
        )
        .is_err());
    }

    #[test]
    fn unknown_statements_are_invalid() {
        assert!(matches!(
            parse_query("EXPLODE EVERYTHING"),
            Err(Error::InvalidQuery(_))
        ));
        assert!(matches!(parse_query(""), Err(Error::InvalidQuery(_))));
        assert!(matches!(
            parse_query("SELECT * FROM"),
            Err(Error::InvalidQuery(_))
        ));
    }

    #[test]
    fn quoted_identifiers() {
        let Statement::Select(s) = one("SELECT * FROM \"weird measurement\"") else {
            panic!("expected select");
        };
        assert_eq!(s.measurement, "weird measurement");
    }
}

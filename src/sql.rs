use sqlparser::ast::{
    self, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// A request decoded from SQL text.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertListing {
        id: Ulid,
        host_id: Ulid,
    },
    DeleteListing {
        id: Ulid,
        host_id: Ulid,
    },
    SelectListings,
    /// Free/busy check for one exact stay.
    SelectAvailability {
        listing_id: Ulid,
        range: DateRange,
    },
    SelectFreeRanges {
        listing_id: Ulid,
        window: DateRange,
    },
    SelectBookedDates {
        listing_id: Ulid,
        not_before: Option<Day>,
    },
    InsertBooking {
        id: Ulid,
        listing_id: Ulid,
        guest_id: Ulid,
        range: DateRange,
    },
    CancelBooking {
        id: Ulid,
        guest_id: Ulid,
    },
    PurgeUnpaid {
        reserved_before: Option<Ms>,
    },
    SelectBookings {
        listing_id: Ulid,
        host_id: Option<Ulid>,
    },
    AttachPaymentSession {
        booking_id: Ulid,
        guest_id: Ulid,
        session_id: String,
    },
    ConfirmPayment {
        session_id: String,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

/// Strip a leading keyword (case-insensitive) and return the remainder.
fn strip_keyword<'a>(sql: &'a str, keyword: &str) -> Option<&'a str> {
    let head = sql.get(..keyword.len())?;
    if !head.eq_ignore_ascii_case(keyword) {
        return None;
    }
    let rest = &sql[keyword.len()..];
    if rest.is_empty() || rest.starts_with(char::is_whitespace) || rest.starts_with(';') {
        Some(rest.trim().trim_end_matches(';').trim())
    } else {
        None
    }
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if let Some(channel) = strip_keyword(trimmed, "LISTEN") {
        if channel.is_empty() {
            return Err(SqlError::Parse("LISTEN without channel".into()));
        }
        return Ok(Command::Listen { channel: unquote_ident(channel) });
    }
    if let Some(channel) = strip_keyword(trimmed, "UNLISTEN") {
        return Ok(match channel {
            "" => return Err(SqlError::Parse("UNLISTEN without channel".into())),
            "*" => Command::UnlistenAll,
            c => Command::Unlisten { channel: unquote_ident(c) },
        });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = stmts.first().ok_or(SqlError::Empty)?;

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn unquote_ident(s: &str) -> String {
    s.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .map(str::to_string)
        .unwrap_or_else(|| s.to_lowercase())
}

// ── INSERT ────────────────────────────────────────────────────

/// One VALUES row, addressable by column name when the statement listed
/// columns and by position otherwise.
struct Row {
    table: &'static str,
    columns: Vec<String>,
    values: Vec<Expr>,
}

impl Row {
    fn get(&self, column: &'static str, position: usize) -> Result<&Expr, SqlError> {
        let idx = if self.columns.is_empty() {
            Some(position)
        } else {
            self.columns.iter().position(|c| c == column)
        };
        idx.and_then(|i| self.values.get(i))
            .ok_or(SqlError::MissingColumn(self.table, column))
    }
}

fn single_row(insert: &ast::Insert, table: &'static str) -> Result<Row, SqlError> {
    let source = insert
        .source
        .as_ref()
        .ok_or_else(|| SqlError::Parse("no VALUES".into()))?;
    let SetExpr::Values(values) = source.body.as_ref() else {
        return Err(SqlError::Parse("expected VALUES".into()));
    };
    let [row] = values.rows.as_slice() else {
        return Err(SqlError::Unsupported(format!(
            "{table}: expected exactly one VALUES row, got {}",
            values.rows.len()
        )));
    };
    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();
    if !columns.is_empty() && columns.len() != row.len() {
        return Err(SqlError::WrongArity(table, columns.len(), row.len()));
    }
    Ok(Row {
        table,
        columns,
        values: row.clone(),
    })
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "listings" => {
            let row = single_row(insert, "listings")?;
            Ok(Command::InsertListing {
                id: parse_ulid(row.get("id", 0)?)?,
                host_id: parse_ulid(row.get("host_id", 1)?)?,
            })
        }
        "bookings" => {
            let row = single_row(insert, "bookings")?;
            Ok(Command::InsertBooking {
                id: parse_ulid(row.get("id", 0)?)?,
                listing_id: parse_ulid(row.get("listing_id", 1)?)?,
                guest_id: parse_ulid(row.get("guest_id", 2)?)?,
                range: DateRange::new(
                    parse_date(row.get("start_date", 3)?)?,
                    parse_date(row.get("end_date", 4)?)?,
                ),
            })
        }
        "payment_sessions" => {
            let row = single_row(insert, "payment_sessions")?;
            Ok(Command::AttachPaymentSession {
                booking_id: parse_ulid(row.get("booking_id", 0)?)?,
                guest_id: parse_ulid(row.get("guest_id", 1)?)?,
                session_id: parse_text(row.get("session_id", 2)?)?,
            })
        }
        "payments" => {
            let row = single_row(insert, "payments")?;
            Ok(Command::ConfirmPayment {
                session_id: parse_text(row.get("session_id", 0)?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── WHERE filters ─────────────────────────────────────────────

/// Flattened conjunction of `column <op> literal` predicates.
struct Filters<'a> {
    preds: Vec<(String, &'a BinaryOperator, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn from_selection(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut preds = Vec::new();
        if let Some(expr) = selection {
            collect_preds(expr, &mut preds)?;
        }
        Ok(Self { preds })
    }

    fn find(&self, column: &str, op: BinaryOperator) -> Option<&'a Expr> {
        self.preds
            .iter()
            .find(|(c, o, _)| c == column && **o == op)
            .map(|(_, _, e)| *e)
    }

    fn has(&self, column: &str) -> bool {
        self.preds.iter().any(|(c, _, _)| c == column)
    }

    /// Every predicate must be one of `allowed`, each at most once. A filter
    /// that is silently dropped would widen the statement.
    fn only(&self, allowed: &[(&str, BinaryOperator)]) -> Result<(), SqlError> {
        for (i, (column, op, value)) in self.preds.iter().enumerate() {
            let known = allowed.iter().any(|(c, o)| *c == column.as_str() && o == *op);
            let repeated = self.preds[..i].iter().any(|(c, o, _)| c == column && o == op);
            if !known || repeated {
                return Err(SqlError::Unsupported(format!("filter {column} {op} {value}")));
            }
        }
        Ok(())
    }

    fn require(&self, column: &'static str, op: BinaryOperator) -> Result<&'a Expr, SqlError> {
        self.find(column, op).ok_or(SqlError::MissingFilter(column))
    }

    fn ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid(self.require(column, BinaryOperator::Eq)?)
    }

    fn date(&self, column: &'static str, op: BinaryOperator) -> Result<Day, SqlError> {
        parse_date(self.require(column, op)?)
    }
}

fn collect_preds<'a>(
    expr: &'a Expr,
    out: &mut Vec<(String, &'a BinaryOperator, &'a Expr)>,
) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_preds(inner, out),
        Expr::BinaryOp { left, op: BinaryOperator::And, right } => {
            collect_preds(left, out)?;
            collect_preds(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("predicate {expr}")))?;
            out.push((column, op, right.as_ref()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("predicate {other}"))),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::from_selection(delete.selection.as_ref())?;

    use BinaryOperator::{Eq, Lt};
    match table.as_str() {
        "listings" => {
            filters.only(&[("id", Eq), ("host_id", Eq)])?;
            Ok(Command::DeleteListing {
                id: filters.ulid("id")?,
                host_id: filters.ulid("host_id")?,
            })
        }
        "bookings" if filters.has("paid") => {
            filters.only(&[("paid", Eq), ("reserved_at", Lt)])?;
            let paid = parse_bool(filters.require("paid", Eq)?)?;
            if paid {
                return Err(SqlError::Unsupported("paid bookings cannot be purged".into()));
            }
            let reserved_before = filters
                .find("reserved_at", Lt)
                .map(parse_i64)
                .transpose()?;
            Ok(Command::PurgeUnpaid { reserved_before })
        }
        "bookings" => {
            filters.only(&[("id", Eq), ("guest_id", Eq)])?;
            Ok(Command::CancelBooking {
                id: filters.ulid("id")?,
                guest_id: filters.ulid("guest_id")?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let SetExpr::Select(select) = query.body.as_ref() else {
        return Err(SqlError::Unsupported("non-SELECT query".into()));
    };
    let from = select
        .from
        .first()
        .ok_or_else(|| SqlError::Parse("SELECT without FROM".into()))?;
    let table = table_factor_name(&from.relation)?;
    let filters = Filters::from_selection(select.selection.as_ref())?;

    use BinaryOperator::{Eq, GtEq, LtEq};
    let allowed = match table.as_str() {
        "listings" => vec![],
        "availability" => vec![("listing_id", Eq), ("start_date", Eq), ("end_date", Eq)],
        "free_ranges" => vec![("listing_id", Eq), ("start_date", GtEq), ("end_date", LtEq)],
        "booked_dates" => vec![("listing_id", Eq), ("end_date", GtEq)],
        "bookings" => vec![("listing_id", Eq), ("host_id", Eq)],
        _ => return Err(SqlError::UnknownTable(table)),
    };
    filters.only(&allowed)?;

    match table.as_str() {
        "listings" => Ok(Command::SelectListings),
        "availability" => Ok(Command::SelectAvailability {
            listing_id: filters.ulid("listing_id")?,
            range: DateRange::new(
                filters.date("start_date", BinaryOperator::Eq)?,
                filters.date("end_date", BinaryOperator::Eq)?,
            ),
        }),
        "free_ranges" => Ok(Command::SelectFreeRanges {
            listing_id: filters.ulid("listing_id")?,
            window: DateRange::new(
                filters.date("start_date", BinaryOperator::GtEq)?,
                filters.date("end_date", BinaryOperator::LtEq)?,
            ),
        }),
        "booked_dates" => Ok(Command::SelectBookedDates {
            listing_id: filters.ulid("listing_id")?,
            not_before: filters
                .find("end_date", BinaryOperator::GtEq)
                .map(parse_date)
                .transpose()?,
        }),
        "bookings" => Ok(Command::SelectBookings {
            listing_id: filters.ulid("listing_id")?,
            host_id: filters
                .find("host_id", BinaryOperator::Eq)
                .map(parse_ulid)
                .transpose()?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let (FromTable::WithFromKeyword(tables) | FromTable::WithoutKeyword(tables)) = &delete.from;
    let first = tables
        .first()
        .ok_or_else(|| SqlError::Parse("DELETE without table".into()))?;
    table_factor_name(&first.relation)
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

/// The literal behind an expression, looking through `::type` casts.
fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        Expr::Cast { expr, .. } | Expr::Nested(expr) => extract_value(expr),
        _ => None,
    }
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let text = parse_text(expr)?;
    Ulid::from_string(&text).map_err(|e| SqlError::Parse(format!("bad ULID {text:?}: {e}")))
}

/// ISO calendar date, `'YYYY-MM-DD'`.
fn parse_date(expr: &Expr) -> Result<Day, SqlError> {
    let text = parse_text(expr)?;
    Day::parse_from_str(&text, "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {text:?}: {e}")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp { op: ast::UnaryOperator::Minus, expr } = expr {
        return Ok(-parse_i64(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _) | Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
        Some(other) => Err(SqlError::Parse(format!("expected number, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(other) => Err(SqlError::Parse(format!("expected bool, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(t, col) => write!(f, "{t}: missing column {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

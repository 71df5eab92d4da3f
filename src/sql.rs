use std::collections::HashMap;

use chrono::{NaiveDate, NaiveTime, Weekday};
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertRule {
        id: Ulid,
        recurrence: Recurrence,
        span: Span,
        slot_minutes: u32,
        active: bool,
    },
    DeleteRule {
        id: Ulid,
    },
    InsertOverride {
        id: Ulid,
        date: NaiveDate,
        span: Span,
        blocked: bool,
        slot_minutes: u32,
    },
    DeleteOverride {
        id: Ulid,
    },
    InsertPricing {
        id: Ulid,
        name: String,
        credits: Credits,
        active: bool,
    },
    DeletePricing {
        id: Ulid,
    },
    InsertPolicy {
        full_refund_hours: u32,
        partial: Option<PartialRefund>,
        no_refund_hours: u32,
    },
    DeletePolicy,
    InsertSlot {
        id: Ulid,
        date: NaiveDate,
        span: Span,
        note: Option<String>,
    },
    InsertSlotStatus {
        slot_id: Ulid,
        status: SlotStatus,
    },
    DeleteSlot {
        id: Ulid,
    },
    InsertSlotTemplate {
        week_start: NaiveDate,
        entries: Vec<SlotTemplate>,
    },
    InsertReservation {
        request: BookingRequest,
        user_id: Option<UserId>,
        deduct_credits: Option<bool>,
    },
    InsertCancellation {
        reservation_id: Ulid,
        refund_credits: Option<bool>,
    },
    DeleteReservation {
        id: Ulid,
    },
    InsertCredits {
        user_id: UserId,
        amount: Credits,
        kind: TransactionType,
        reference_id: Option<String>,
        note: Option<String>,
    },
    SelectAvailability {
        from: NaiveDate,
        to: NaiveDate,
    },
    SelectSlots {
        from: NaiveDate,
        to: NaiveDate,
    },
    SelectReservations {
        id: Option<Ulid>,
        user_id: Option<UserId>,
        range: Option<(NaiveDate, NaiveDate)>,
    },
    SelectBalance {
        user_id: Option<UserId>,
    },
    SelectCreditHistory {
        user_id: Option<UserId>,
        limit: Option<usize>,
    },
    SelectRefundPreview {
        reservation_id: Ulid,
    },
    SelectRules,
    SelectOverrides,
    SelectPricing,
    SelectPolicy,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// One VALUES row keyed by column name.
struct Row<'a> {
    table: &'static str,
    cells: HashMap<String, &'a Expr>,
}

impl<'a> Row<'a> {
    fn get(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        self.cells
            .get(col)
            .copied()
            .ok_or(SqlError::MissingColumn(self.table, col))
    }

    /// `None` if the column is absent or NULL.
    fn opt(&self, col: &'static str) -> Option<&'a Expr> {
        self.cells.get(col).copied().filter(|e| !is_null(e))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let table: &'static str = match table.as_str() {
        "rules" => "rules",
        "overrides" => "overrides",
        "pricing" => "pricing",
        "policies" => "policies",
        "slots" => "slots",
        "slot_status" => "slot_status",
        "slot_template" => "slot_template",
        "reservations" => "reservations",
        "cancellations" => "cancellations",
        "credits" => "credits",
        _ => return Err(SqlError::UnknownTable(table)),
    };
    let rows = extract_rows(insert, table)?;
    if table == "slot_template" {
        return parse_slot_template(&rows);
    }
    if rows.len() != 1 {
        return Err(SqlError::Unsupported(format!("multi-row INSERT into {table}")));
    }
    let row = &rows[0];

    match table {
        "rules" => Ok(Command::InsertRule {
            id: parse_ulid(row.get("id")?)?,
            recurrence: parse_recurrence(row.get("days")?)?,
            span: parse_span(row)?,
            slot_minutes: parse_u32(row.get("slot_minutes")?)?,
            active: row.opt("active").map(parse_bool).transpose()?.unwrap_or(true),
        }),
        "overrides" => {
            let blocked = row.opt("blocked").map(parse_bool).transpose()?.unwrap_or(true);
            let span = parse_span(row)?;
            let slot_minutes = match row.opt("slot_minutes") {
                Some(e) => parse_u32(e)?,
                None if blocked => 0,
                None => return Err(SqlError::MissingColumn(table, "slot_minutes")),
            };
            Ok(Command::InsertOverride {
                id: parse_ulid(row.get("id")?)?,
                date: parse_date(row.get("slot_date")?)?,
                span,
                blocked,
                slot_minutes,
            })
        }
        "pricing" => Ok(Command::InsertPricing {
            id: parse_ulid(row.get("id")?)?,
            name: parse_string(row.get("name")?)?,
            credits: parse_i64(row.get("credits")?)?,
            active: row.opt("active").map(parse_bool).transpose()?.unwrap_or(true),
        }),
        "policies" => {
            let partial = match (row.opt("partial_refund_hours"), row.opt("partial_refund_percentage")) {
                (None, None) => None,
                (Some(h), Some(p)) => Some(PartialRefund {
                    hours: parse_u32(h)?,
                    percentage: parse_u8(p)?,
                }),
                _ => {
                    return Err(SqlError::Parse(
                        "partial_refund_hours and partial_refund_percentage go together".into(),
                    ));
                }
            };
            Ok(Command::InsertPolicy {
                full_refund_hours: parse_u32(row.get("full_refund_hours")?)?,
                partial,
                no_refund_hours: row.opt("no_refund_hours").map(parse_u32).transpose()?.unwrap_or(0),
            })
        }
        "slots" => Ok(Command::InsertSlot {
            id: parse_ulid(row.get("id")?)?,
            date: parse_date(row.get("slot_date")?)?,
            span: parse_span(row)?,
            note: row.opt("note").map(parse_string).transpose()?,
        }),
        "slot_status" => Ok(Command::InsertSlotStatus {
            slot_id: parse_ulid(row.get("slot_id")?)?,
            status: parse_string(row.get("status")?)?
                .parse()
                .map_err(SqlError::Parse)?,
        }),
        "reservations" => Ok(Command::InsertReservation {
            request: BookingRequest {
                id: parse_ulid(row.get("id")?)?,
                date: parse_date(row.get("slot_date")?)?,
                span: parse_span(row)?,
                block_id: parse_ulid(row.get("block_id")?)?,
                pricing_item_id: row.opt("pricing_item_id").map(parse_ulid).transpose()?,
                note: row.opt("note").map(parse_string).transpose()?,
            },
            user_id: row.opt("user_id").map(parse_string).transpose()?,
            deduct_credits: row.opt("deduct_credits").map(parse_bool).transpose()?,
        }),
        "cancellations" => Ok(Command::InsertCancellation {
            reservation_id: parse_ulid(row.get("reservation_id")?)?,
            refund_credits: row.opt("refund_credits").map(parse_bool).transpose()?,
        }),
        "credits" => Ok(Command::InsertCredits {
            user_id: parse_string(row.get("user_id")?)?,
            amount: parse_i64(row.get("amount")?)?,
            kind: parse_string(row.get("kind")?)?
                .parse()
                .map_err(SqlError::Parse)?,
            reference_id: row.opt("reference_id").map(parse_string).transpose()?,
            note: row.opt("note").map(parse_string).transpose()?,
        }),
        _ => Err(SqlError::UnknownTable(table.to_string())),
    }
}

fn parse_slot_template(rows: &[Row<'_>]) -> Result<Command, SqlError> {
    let mut week_start = None;
    let mut entries = Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        let row_week = parse_date(row.get("week_start")?)?;
        if *week_start.get_or_insert(row_week) != row_week {
            return Err(SqlError::Parse(format!("row {i}: all rows must share week_start")));
        }
        let weekday: Weekday = parse_string(row.get("weekday")?)?
            .parse()
            .map_err(|_| SqlError::Parse(format!("row {i}: bad weekday")))?;
        entries.push(SlotTemplate { weekday, span: parse_span(row)? });
    }
    Ok(Command::InsertSlotTemplate {
        week_start: week_start.ok_or_else(|| SqlError::Parse("empty VALUES".into()))?,
        entries,
    })
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table == "policies" {
        return Ok(Command::DeletePolicy);
    }
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "rules" => Ok(Command::DeleteRule { id }),
        "overrides" => Ok(Command::DeleteOverride { id }),
        "pricing" => Ok(Command::DeletePricing { id }),
        "slots" => Ok(Command::DeleteSlot { id }),
        "reservations" => Ok(Command::DeleteReservation { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let filters = Filters::collect(select.selection.as_ref())?;

    match table.as_str() {
        "availability" => {
            let (from, to) = filters.date_range()?.ok_or(SqlError::MissingFilter("slot_date"))?;
            Ok(Command::SelectAvailability { from, to })
        }
        "slots" => {
            let (from, to) = filters.date_range()?.ok_or(SqlError::MissingFilter("slot_date"))?;
            Ok(Command::SelectSlots { from, to })
        }
        "reservations" => Ok(Command::SelectReservations {
            id: filters.eq("id").map(parse_ulid).transpose()?,
            user_id: filters.eq("user_id").map(parse_string).transpose()?,
            range: filters.date_range()?,
        }),
        "balance" => Ok(Command::SelectBalance {
            user_id: filters.eq("user_id").map(parse_string).transpose()?,
        }),
        "credit_history" => Ok(Command::SelectCreditHistory {
            user_id: filters.eq("user_id").map(parse_string).transpose()?,
            limit: filters
                .eq("row_limit")
                .map(parse_u32)
                .transpose()?
                .map(|n| n as usize),
        }),
        "refund_preview" => Ok(Command::SelectRefundPreview {
            reservation_id: parse_ulid(
                filters.eq("reservation_id").ok_or(SqlError::MissingFilter("reservation_id"))?,
            )?,
        }),
        "rules" => Ok(Command::SelectRules),
        "overrides" => Ok(Command::SelectOverrides),
        "pricing" => Ok(Command::SelectPricing),
        "policies" => Ok(Command::SelectPolicy),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `col <op> value` terms joined by AND.
struct Filters<'a> {
    terms: Vec<(String, ast::BinaryOperator, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn collect(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut terms = Vec::new();
        if let Some(expr) = selection {
            collect_terms(expr, &mut terms)?;
        }
        Ok(Self { terms })
    }

    fn find(&self, col: &str, ops: &[ast::BinaryOperator]) -> Option<&'a Expr> {
        self.terms
            .iter()
            .find(|(c, op, _)| c == col && ops.contains(op))
            .map(|(_, _, e)| *e)
    }

    fn eq(&self, col: &str) -> Option<&'a Expr> {
        self.find(col, &[ast::BinaryOperator::Eq])
    }

    /// `slot_date = d`, or `slot_date >= a AND slot_date <= b`.
    fn date_range(&self) -> Result<Option<(NaiveDate, NaiveDate)>, SqlError> {
        use ast::BinaryOperator::{GtEq, LtEq};
        if let Some(e) = self.eq("slot_date") {
            let d = parse_date(e)?;
            return Ok(Some((d, d)));
        }
        match (self.find("slot_date", &[GtEq]), self.find("slot_date", &[LtEq])) {
            (Some(from), Some(to)) => Ok(Some((parse_date(from)?, parse_date(to)?))),
            (None, None) => Ok(None),
            _ => Err(SqlError::Parse("slot_date needs both >= and <= bounds".into())),
        }
    }
}

fn collect_terms<'a>(
    expr: &'a Expr,
    terms: &mut Vec<(String, ast::BinaryOperator, &'a Expr)>,
) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op: ast::BinaryOperator::And, right } => {
            collect_terms(left, terms)?;
            collect_terms(right, terms)
        }
        Expr::BinaryOp { left, op, right } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
            terms.push((col, op.clone(), right));
            Ok(())
        }
        Expr::Nested(inner) => collect_terms(inner, terms),
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
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
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_rows<'a>(insert: &'a ast::Insert, table: &'static str) -> Result<Vec<Row<'a>>, SqlError> {
    if insert.columns.is_empty() {
        return Err(SqlError::Parse(format!("INSERT INTO {table} needs a column list")));
    }
    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let values = match body.body.as_ref() {
        SetExpr::Values(values) => values,
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    if values.rows.is_empty() {
        return Err(SqlError::Parse("empty VALUES".into()));
    }
    values
        .rows
        .iter()
        .map(|row| {
            if row.len() != columns.len() {
                return Err(SqlError::WrongArity(table, columns.len(), row.len()));
            }
            Ok(Row {
                table,
                cells: columns.iter().cloned().zip(row.iter()).collect(),
            })
        })
        .collect()
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date {s}: {e}")))
}

fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_string(expr)?;
    NaiveTime::parse_from_str(&s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(&s, "%H:%M:%S"))
        .map_err(|e| SqlError::Parse(format!("bad time {s}: {e}")))
}

/// Bounds are checked by the engine, not here.
fn parse_span(row: &Row<'_>) -> Result<Span, SqlError> {
    Ok(Span {
        start: parse_time(row.get("start_time")?)?,
        end: parse_time(row.get("end_time")?)?,
    })
}

/// `'mon,wed,fri'` for a weekly rule, `'2024-06-10'` for a one-off.
fn parse_recurrence(expr: &Expr) -> Result<Recurrence, SqlError> {
    let s = parse_string(expr)?;
    if let Ok(date) = NaiveDate::parse_from_str(&s, "%Y-%m-%d") {
        return Ok(Recurrence::On(date));
    }
    let mut days = Vec::new();
    for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let day: Weekday = part
            .parse()
            .map_err(|_| SqlError::Parse(format!("bad weekday: {part}")))?;
        if !days.contains(&day) {
            days.push(day);
        }
    }
    Ok(Recurrence::Weekly(days))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_u8(expr: &Expr) -> Result<u8, SqlError> {
    let v = parse_i64(expr)?;
    u8::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u8 range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("{0}: missing column {1}")]
    MissingColumn(&'static str, &'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}

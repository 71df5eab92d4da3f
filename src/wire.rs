use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::{AdminSet, SlotbookAuthSource};
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

const DEFAULT_HISTORY_ROWS: usize = 50;

pub struct SlotbookHandler {
    tenant_manager: Arc<TenantManager>,
    admins: AdminSet,
    query_parser: Arc<SlotbookQueryParser>,
}

impl SlotbookHandler {
    pub fn new(tenant_manager: Arc<TenantManager>, admins: AdminSet) -> Self {
        Self {
            tenant_manager,
            admins,
            query_parser: Arc::new(SlotbookQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    /// The login name is the booking identity; the admin list decides the role.
    fn resolve_actor<C: ClientInfo>(&self, client: &C) -> PgWireResult<Actor> {
        let user = client
            .metadata()
            .get("user")
            .cloned()
            .ok_or_else(|| user_error("28000", "no user in startup packet".into()))?;
        Ok(self.admins.actor_for(user))
    }

    async fn run<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Vec<Response>> {
        let engine = self.resolve_engine(client)?;
        let actor = self.resolve_actor(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = execute_command(&engine, &actor, cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = match &result {
            Ok(_) => "ok",
            Err(e) if e.is_retryable() => {
                tracing::debug!(user = %actor.user_id, "{label} lost a slot race: {e}");
                e.kind()
            }
            Err(e) => {
                tracing::warn!(user = %actor.user_id, "{label} failed: {e}");
                e.kind()
            }
        };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result.map_err(engine_err)
    }
}

fn inserted(n: usize) -> Vec<Response> {
    vec![Response::Execution(Tag::new("INSERT").with_rows(n))]
}

fn deleted(n: usize) -> Vec<Response> {
    vec![Response::Execution(Tag::new("DELETE").with_rows(n))]
}

async fn execute_command(
    engine: &Engine,
    actor: &Actor,
    cmd: Command,
) -> Result<Vec<Response>, EngineError> {
    match cmd {
        Command::InsertRule { id, recurrence, span, slot_minutes, active } => {
            let rule = AvailabilityRule { id, recurrence, span, slot_minutes, active };
            engine.put_rule(actor, rule).await?;
            Ok(inserted(1))
        }
        Command::DeleteRule { id } => {
            engine.remove_rule(actor, id).await?;
            Ok(deleted(1))
        }
        Command::InsertOverride { id, date, span, blocked, slot_minutes } => {
            let date_override = DateOverride { id, date, span, blocked, slot_minutes };
            engine.add_override(actor, date_override).await?;
            Ok(inserted(1))
        }
        Command::DeleteOverride { id } => {
            engine.remove_override(actor, id).await?;
            Ok(deleted(1))
        }
        Command::InsertPricing { id, name, credits, active } => {
            engine
                .put_pricing_item(actor, PricingItem { id, name, credits, active })
                .await?;
            Ok(inserted(1))
        }
        Command::DeletePricing { id } => {
            engine.deactivate_pricing_item(actor, id).await?;
            Ok(deleted(1))
        }
        Command::InsertPolicy { full_refund_hours, partial, no_refund_hours } => {
            engine
                .set_policy(actor, full_refund_hours, partial, no_refund_hours)
                .await?;
            Ok(inserted(1))
        }
        Command::DeletePolicy => {
            let retired = engine.deactivate_policy(actor).await?;
            Ok(deleted(usize::from(retired.is_some())))
        }
        Command::InsertSlot { id, date, span, note } => {
            engine.create_slot(actor, id, date, span, note).await?;
            Ok(inserted(1))
        }
        Command::InsertSlotStatus { slot_id, status } => {
            engine.update_slot_status(actor, slot_id, status).await?;
            Ok(inserted(1))
        }
        Command::DeleteSlot { id } => {
            engine.delete_slot(actor, id).await?;
            Ok(deleted(1))
        }
        Command::InsertSlotTemplate { week_start, entries } => {
            let created = engine.apply_week_template(actor, week_start, &entries).await?;
            Ok(inserted(created.len()))
        }
        Command::InsertReservation { request, user_id, deduct_credits } => {
            let on_behalf = user_id.filter(|u| *u != actor.user_id);
            if on_behalf.is_some() || deduct_credits.is_some() {
                let user = on_behalf.unwrap_or_else(|| actor.user_id.clone());
                engine
                    .admin_create_reservation(actor, &user, request, deduct_credits)
                    .await?;
            } else {
                engine.create_reservation(actor, request).await?;
            }
            Ok(inserted(1))
        }
        Command::InsertCancellation { reservation_id, refund_credits } => {
            let result = match refund_credits {
                Some(_) => {
                    engine
                        .admin_cancel_reservation(actor, reservation_id, refund_credits)
                        .await?
                }
                None => engine.cancel_reservation(actor, reservation_id).await?,
            };
            Ok(vec![rows_response(
                cancellation_schema(),
                vec![vec![
                    Cell::text(result.reservation_id.to_string()),
                    Cell::Int(Some(result.refund_amount)),
                    Cell::Int(Some(i64::from(result.refund_percentage))),
                    Cell::Text(result.policy_applied.policy_id.map(|id| id.to_string())),
                    Cell::text(result.policy_applied.tier.as_str()),
                ]],
            )])
        }
        Command::DeleteReservation { id } => {
            engine.cancel_reservation(actor, id).await?;
            Ok(deleted(1))
        }
        Command::InsertCredits { user_id, amount, kind, reference_id, note } => {
            insert_credits(engine, actor, user_id, amount, kind, reference_id, note).await?;
            Ok(inserted(1))
        }
        Command::SelectAvailability { from, to } => {
            let slots = engine.availability(actor, from, to).await?;
            let rows = slots
                .into_iter()
                .map(|s| {
                    vec![
                        Cell::text(s.block_id.to_string()),
                        Cell::text(fmt_date(s.date)),
                        Cell::text(fmt_time(s.span.start)),
                        Cell::text(fmt_time(s.span.end)),
                        Cell::Bool(s.is_available),
                        Cell::Text(s.reserved_by),
                    ]
                })
                .collect();
            Ok(vec![rows_response(availability_schema(), rows)])
        }
        Command::SelectSlots { from, to } => {
            let slots = engine.slots_in_range(actor, from, to).await?;
            let rows = slots
                .into_iter()
                .map(|s| {
                    vec![
                        Cell::text(s.id.to_string()),
                        Cell::text(fmt_date(s.date)),
                        Cell::text(fmt_time(s.span.start)),
                        Cell::text(fmt_time(s.span.end)),
                        Cell::text(s.status.as_str()),
                        Cell::Text(s.assigned_user),
                        Cell::Text(s.note),
                    ]
                })
                .collect();
            Ok(vec![rows_response(slots_schema(), rows)])
        }
        Command::SelectReservations { id, user_id, range } => {
            let reservations = match (id, range) {
                (Some(id), _) => vec![engine.get_reservation(actor, id).await?],
                (None, Some((from, to))) => {
                    let mut all = engine.reservations_in_range(actor, from, to).await?;
                    if let Some(user) = &user_id {
                        all.retain(|r| r.user_id == *user);
                    }
                    all
                }
                (None, None) => {
                    let user = user_id.unwrap_or_else(|| actor.user_id.clone());
                    engine.reservations_for_user(actor, &user).await?
                }
            };
            let rows = reservations.into_iter().map(reservation_row).collect();
            Ok(vec![rows_response(reservations_schema(), rows)])
        }
        Command::SelectBalance { user_id } => {
            let user = user_id.unwrap_or_else(|| actor.user_id.clone());
            let balance = engine.balance(actor, &user).await?;
            Ok(vec![rows_response(
                balance_schema(),
                vec![vec![Cell::text(user), Cell::Int(Some(balance))]],
            )])
        }
        Command::SelectCreditHistory { user_id, limit } => {
            let user = user_id.unwrap_or_else(|| actor.user_id.clone());
            let history = engine
                .credit_history(actor, &user, limit.unwrap_or(DEFAULT_HISTORY_ROWS))
                .await?;
            let rows = history
                .into_iter()
                .map(|t| {
                    vec![
                        Cell::text(t.id.to_string()),
                        Cell::text(t.user_id),
                        Cell::Int(Some(t.amount)),
                        Cell::text(t.kind.as_str()),
                        Cell::Text(t.reference_id),
                        Cell::Text(t.note),
                        Cell::text(fmt_datetime(t.created_at)),
                    ]
                })
                .collect();
            Ok(vec![rows_response(credit_history_schema(), rows)])
        }
        Command::SelectRefundPreview { reservation_id } => {
            let p = engine.refund_preview(actor, reservation_id).await?;
            Ok(vec![rows_response(
                refund_preview_schema(),
                vec![vec![
                    Cell::text(p.reservation_id.to_string()),
                    Cell::Float(p.hours_until_start),
                    Cell::Int(Some(p.credits_used)),
                    Cell::Int(Some(i64::from(p.refund_percentage))),
                    Cell::Int(Some(p.refund_amount)),
                    Cell::Text(p.policy_applied.policy_id.map(|id| id.to_string())),
                    Cell::text(p.policy_applied.tier.as_str()),
                ]],
            )])
        }
        Command::SelectRules => {
            let rows = engine
                .rules()
                .await
                .into_iter()
                .map(|r| {
                    vec![
                        Cell::text(r.id.to_string()),
                        Cell::text(fmt_recurrence(&r.recurrence)),
                        Cell::text(fmt_time(r.span.start)),
                        Cell::text(fmt_time(r.span.end)),
                        Cell::Int(Some(i64::from(r.slot_minutes))),
                        Cell::Bool(r.active),
                    ]
                })
                .collect();
            Ok(vec![rows_response(rules_schema(), rows)])
        }
        Command::SelectOverrides => {
            let rows = engine
                .overrides(actor)
                .await?
                .into_iter()
                .map(|o| {
                    vec![
                        Cell::text(o.id.to_string()),
                        Cell::text(fmt_date(o.date)),
                        Cell::text(fmt_time(o.span.start)),
                        Cell::text(fmt_time(o.span.end)),
                        Cell::Bool(o.blocked),
                        Cell::Int(Some(i64::from(o.slot_minutes))),
                    ]
                })
                .collect();
            Ok(vec![rows_response(overrides_schema(), rows)])
        }
        Command::SelectPricing => {
            let rows = engine
                .pricing_items(actor)
                .await
                .into_iter()
                .map(|p| {
                    vec![
                        Cell::text(p.id.to_string()),
                        Cell::text(p.name),
                        Cell::Int(Some(p.credits)),
                        Cell::Bool(p.active),
                    ]
                })
                .collect();
            Ok(vec![rows_response(pricing_schema(), rows)])
        }
        Command::SelectPolicy => {
            let p = engine.active_policy().await;
            Ok(vec![rows_response(
                policy_schema(),
                vec![vec![
                    Cell::text(p.id.to_string()),
                    Cell::Int(Some(i64::from(p.full_refund_hours))),
                    Cell::Int(p.partial.map(|x| i64::from(x.hours))),
                    Cell::Int(p.partial.map(|x| i64::from(x.percentage))),
                    Cell::Int(Some(i64::from(p.no_refund_hours))),
                    Cell::Bool(p.active),
                ]],
            )])
        }
    }
}

/// Ledger writes over the wire. Payment confirmations come from a trusted
/// admin connection; booking debits and refunds are never written directly.
async fn insert_credits(
    engine: &Engine,
    actor: &Actor,
    user_id: UserId,
    amount: Credits,
    kind: TransactionType,
    reference_id: Option<String>,
    note: Option<String>,
) -> Result<CreditTransaction, EngineError> {
    match kind {
        TransactionType::Purchase | TransactionType::PlanPurchase => {
            if !actor.is_admin() {
                return Err(EngineError::Forbidden("purchases are recorded by the payment layer"));
            }
            let payment_id = reference_id.ok_or_else(|| {
                EngineError::Validation("purchases need a reference_id".into())
            })?;
            if kind == TransactionType::Purchase {
                engine.record_purchase(&user_id, amount, &payment_id).await
            } else {
                engine.record_plan_purchase(&user_id, amount, &payment_id).await
            }
        }
        TransactionType::AdminAdjustment => {
            engine.adjust_credits(actor, &user_id, amount, note).await
        }
        TransactionType::Reservation | TransactionType::Refund => Err(EngineError::Validation(
            format!("{} rows are written by bookings", kind.as_str()),
        )),
    }
}

fn reservation_row(r: Reservation) -> Vec<Cell> {
    vec![
        Cell::text(r.id.to_string()),
        Cell::text(r.user_id),
        Cell::text(r.source.id().to_string()),
        Cell::text(fmt_date(r.date)),
        Cell::text(fmt_time(r.span.start)),
        Cell::text(fmt_time(r.span.end)),
        Cell::text(r.status.as_str()),
        Cell::Int(Some(r.credits_used)),
        Cell::text(fmt_datetime(r.created_at)),
        Cell::Text(r.cancelled_at.map(fmt_datetime)),
        Cell::Text(r.note),
    ]
}

// ── Result encoding ──────────────────────────────────────────────

enum Cell {
    Text(Option<String>),
    Int(Option<i64>),
    Bool(bool),
    Float(f64),
}

impl Cell {
    fn text(s: impl Into<String>) -> Self {
        Cell::Text(Some(s.into()))
    }
}

fn rows_response(schema: Vec<FieldInfo>, rows: Vec<Vec<Cell>>) -> Response {
    let schema = Arc::new(schema);
    let encoded: Vec<PgWireResult<_>> = rows
        .into_iter()
        .map(|row| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            for cell in row {
                match cell {
                    Cell::Text(v) => encoder.encode_field(&v)?,
                    Cell::Int(v) => encoder.encode_field(&v)?,
                    Cell::Bool(v) => encoder.encode_field(&v)?,
                    Cell::Float(v) => encoder.encode_field(&v)?,
                }
            }
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(encoded)))
}

fn fmt_date(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

fn fmt_time(t: NaiveTime) -> String {
    t.format("%H:%M").to_string()
}

fn fmt_datetime(t: NaiveDateTime) -> String {
    t.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn fmt_recurrence(r: &Recurrence) -> String {
    match r {
        Recurrence::On(date) => fmt_date(*date),
        Recurrence::Weekly(days) => days
            .iter()
            .map(|d: &Weekday| d.to_string().to_lowercase())
            .collect::<Vec<_>>()
            .join(","),
    }
}

// ── Schemas ──────────────────────────────────────────────────────

fn fields(cols: &[(&str, Type)]) -> Vec<FieldInfo> {
    cols.iter()
        .map(|(name, ty)| FieldInfo::new((*name).into(), None, None, ty.clone(), FieldFormat::Text))
        .collect()
}

fn availability_schema() -> Vec<FieldInfo> {
    fields(&[
        ("block_id", Type::VARCHAR),
        ("slot_date", Type::VARCHAR),
        ("start_time", Type::VARCHAR),
        ("end_time", Type::VARCHAR),
        ("is_available", Type::BOOL),
        ("reserved_by", Type::VARCHAR),
    ])
}

fn slots_schema() -> Vec<FieldInfo> {
    fields(&[
        ("id", Type::VARCHAR),
        ("slot_date", Type::VARCHAR),
        ("start_time", Type::VARCHAR),
        ("end_time", Type::VARCHAR),
        ("status", Type::VARCHAR),
        ("assigned_user", Type::VARCHAR),
        ("note", Type::VARCHAR),
    ])
}

fn reservations_schema() -> Vec<FieldInfo> {
    fields(&[
        ("id", Type::VARCHAR),
        ("user_id", Type::VARCHAR),
        ("block_id", Type::VARCHAR),
        ("slot_date", Type::VARCHAR),
        ("start_time", Type::VARCHAR),
        ("end_time", Type::VARCHAR),
        ("status", Type::VARCHAR),
        ("credits_used", Type::INT8),
        ("created_at", Type::VARCHAR),
        ("cancelled_at", Type::VARCHAR),
        ("note", Type::VARCHAR),
    ])
}

fn balance_schema() -> Vec<FieldInfo> {
    fields(&[("user_id", Type::VARCHAR), ("balance", Type::INT8)])
}

fn credit_history_schema() -> Vec<FieldInfo> {
    fields(&[
        ("id", Type::VARCHAR),
        ("user_id", Type::VARCHAR),
        ("amount", Type::INT8),
        ("kind", Type::VARCHAR),
        ("reference_id", Type::VARCHAR),
        ("note", Type::VARCHAR),
        ("created_at", Type::VARCHAR),
    ])
}

fn refund_preview_schema() -> Vec<FieldInfo> {
    fields(&[
        ("reservation_id", Type::VARCHAR),
        ("hours_until_start", Type::FLOAT8),
        ("credits_used", Type::INT8),
        ("refund_percentage", Type::INT8),
        ("refund_amount", Type::INT8),
        ("policy_id", Type::VARCHAR),
        ("tier", Type::VARCHAR),
    ])
}

fn cancellation_schema() -> Vec<FieldInfo> {
    fields(&[
        ("reservation_id", Type::VARCHAR),
        ("refund_amount", Type::INT8),
        ("refund_percentage", Type::INT8),
        ("policy_id", Type::VARCHAR),
        ("tier", Type::VARCHAR),
    ])
}

fn rules_schema() -> Vec<FieldInfo> {
    fields(&[
        ("id", Type::VARCHAR),
        ("days", Type::VARCHAR),
        ("start_time", Type::VARCHAR),
        ("end_time", Type::VARCHAR),
        ("slot_minutes", Type::INT8),
        ("active", Type::BOOL),
    ])
}

fn overrides_schema() -> Vec<FieldInfo> {
    fields(&[
        ("id", Type::VARCHAR),
        ("slot_date", Type::VARCHAR),
        ("start_time", Type::VARCHAR),
        ("end_time", Type::VARCHAR),
        ("blocked", Type::BOOL),
        ("slot_minutes", Type::INT8),
    ])
}

fn pricing_schema() -> Vec<FieldInfo> {
    fields(&[
        ("id", Type::VARCHAR),
        ("name", Type::VARCHAR),
        ("credits", Type::INT8),
        ("active", Type::BOOL),
    ])
}

fn policy_schema() -> Vec<FieldInfo> {
    fields(&[
        ("id", Type::VARCHAR),
        ("full_refund_hours", Type::INT8),
        ("partial_refund_hours", Type::INT8),
        ("partial_refund_percentage", Type::INT8),
        ("no_refund_hours", Type::INT8),
        ("active", Type::BOOL),
    ])
}

/// Row shape a statement will produce, judged from its text alone so
/// that statements with unbound `$n` placeholders can be described.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.trim_start().to_lowercase();
    if lower.starts_with("insert") {
        if lower.contains("cancellations") {
            return cancellation_schema();
        }
        return vec![];
    }
    if !lower.starts_with("select") {
        return vec![];
    }
    let table = lower
        .split_once(" from ")
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .unwrap_or("")
        .trim_end_matches(';');
    match table {
        "availability" => availability_schema(),
        "slots" => slots_schema(),
        "reservations" => reservations_schema(),
        "balance" => balance_schema(),
        "credit_history" => credit_history_schema(),
        "refund_preview" => refund_preview_schema(),
        "rules" => rules_schema(),
        "overrides" => overrides_schema(),
        "pricing" => pricing_schema(),
        "policies" => policy_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotbookHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run(client, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotbookQueryParser;

#[async_trait]
impl QueryParser for SlotbookQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotbookHandler {
    type Statement = String;
    type QueryParser = SlotbookQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        let mut responses = self.run(client, &sql).await?;
        if responses.is_empty() {
            return Ok(Response::EmptyQuery);
        }
        Ok(responses.remove(0))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Substitute bound parameter values (text format) for the `$N` placeholders.
fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

/// One left-to-right pass: each `$N` is replaced once, and bound values are
/// never rescanned. `$N` past the bound count is kept as written.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();
        let bound = after[..digits]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| params.get(i));
        match bound {
            Some(param) => {
                out.push_str(&sql_literal(param.as_ref().map(|b| AsRef::<[u8]>::as_ref(b))))
            }
            None => out.push_str(&rest[pos..pos + 1 + digits]),
        }
        rest = &after[digits..];
    }
    out.push_str(rest);
    out
}

fn sql_literal(param: Option<&[u8]>) -> String {
    match param {
        Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
        None => "NULL".to_string(),
    }
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotbookFactory {
    handler: Arc<SlotbookHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SlotbookAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl SlotbookFactory {
    pub fn new(
        tenant_manager: Arc<TenantManager>,
        password: String,
        admins: AdminSet,
    ) -> Self {
        let auth_source = SlotbookAuthSource::new(password, admins.clone());
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotbookHandler::new(tenant_manager, admins)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotbookFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    admins: AdminSet,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = SlotbookFactory::new(tenant_manager, password, admins);
    pgwire::tokio::process_socket(socket, tls, Arc::new(factory)).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for each engine failure.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "22023",
        EngineError::SlotAlreadyTaken { .. } => "23505",
        EngineError::SlotNotBookable(_) => "55000",
        EngineError::InsufficientCredits { .. } => "P0002",
        EngineError::NotFound(_) => "P0001",
        EngineError::Forbidden(_) => "42501",
        EngineError::AlreadyCancelled(_) => "P0003",
        EngineError::AlreadyCompleted(_) => "P0005",
        EngineError::InvalidTransition(_) => "P0004",
        EngineError::AlreadyExists(_) => "23P01",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Persistence(_) => "XX000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

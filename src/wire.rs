use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use futures::{stream, Sink, SinkExt};
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
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, warn};

use crate::auth::{Credentials, StaydAuthSource};
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

/// Per-connection query handler. Owns the connection's LISTEN subscriptions,
/// which are drained into NotificationResponse messages before each reply.
pub struct StaydHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<StaydQueryParser>,
    subscriptions: Mutex<HashMap<String, broadcast::Receiver<Event>>>,
}

impl StaydHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(StaydQueryParser),
            subscriptions: Mutex::new(HashMap::new()),
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

    /// Collect pending events for every channel this connection listens on.
    fn pending_notifications(&self) -> Vec<NotificationResponse> {
        let Ok(mut subs) = self.subscriptions.lock() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        subs.retain(|channel, rx| loop {
            match rx.try_recv() {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(payload) => out.push(NotificationResponse::new(0, channel.clone(), payload)),
                    Err(e) => warn!("dropping unserializable event on {channel}: {e}"),
                },
                Err(TryRecvError::Empty) => break true,
                Err(TryRecvError::Lagged(n)) => {
                    warn!(channel = %channel, skipped = n, "listener fell behind");
                }
                Err(TryRecvError::Closed) => break false,
            }
        });
        out
    }

    async fn flush_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        for notification in self.pending_notifications() {
            client
                .send(PgWireBackendMessage::NotificationResponse(notification))
                .await?;
        }
        Ok(())
    }

    fn listen(&self, engine: &Engine, channel: String) -> PgWireResult<()> {
        let listing_id = NotifyHub::parse_channel(&channel).ok_or_else(|| {
            user_error("42000", format!("invalid channel: {channel} (expected listing_{{id}})"))
        })?;
        if engine.get_listing(&listing_id).is_none() {
            return Err(engine_err(EngineError::NotFound(listing_id)));
        }
        let mut subs = self
            .subscriptions
            .lock()
            .map_err(|_| user_error("XX000", "subscription state poisoned".into()))?;
        subs.entry(channel)
            .or_insert_with(|| engine.notify.subscribe(listing_id));
        Ok(())
    }

    fn unlisten(&self, channel: Option<&str>) {
        if let Ok(mut subs) = self.subscriptions.lock() {
            match channel {
                Some(c) => {
                    subs.remove(c);
                }
                None => subs.clear(),
            }
        }
    }

    async fn run(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertListing { id, host_id } => {
                engine.create_listing(id, host_id).await.map_err(engine_err)?;
                Ok(vec![execution("INSERT", 1)])
            }
            Command::DeleteListing { id, host_id } => {
                engine.delete_listing(id, host_id).await.map_err(engine_err)?;
                Ok(vec![execution("DELETE", 1)])
            }
            Command::SelectListings => {
                let listings = engine.list_listings().await;
                let schema = Arc::new(listings_schema());
                let rows: Vec<PgWireResult<_>> = listings
                    .into_iter()
                    .map(|l| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&l.id.to_string())?;
                        encoder.encode_field(&l.host_id.to_string())?;
                        encoder.encode_field(&(l.bookings as i64))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectAvailability { listing_id, range } => {
                let free = engine
                    .is_range_available(listing_id, range)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(availability_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&listing_id.to_string())?;
                encoder.encode_field(&range.start.to_string())?;
                encoder.encode_field(&range.end.to_string())?;
                encoder.encode_field(&if free { "free" } else { "busy" })?;
                let rows: Vec<PgWireResult<_>> = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectFreeRanges { listing_id, window } => {
                let free = engine
                    .free_ranges(listing_id, window)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(free_ranges_schema());
                let lid = listing_id.to_string();
                let rows: Vec<PgWireResult<_>> = free
                    .into_iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&lid)?;
                        encoder.encode_field(&r.start.to_string())?;
                        encoder.encode_field(&r.end.to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectBookedDates { listing_id, not_before } => {
                let dates = match not_before {
                    Some(day) => engine.booked_dates(listing_id, day).await,
                    None => engine.list_booked_dates(listing_id).await,
                };
                let schema = Arc::new(booked_dates_schema());
                let rows: Vec<PgWireResult<_>> = dates
                    .into_iter()
                    .map(|day| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&day.to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::InsertBooking { id, listing_id, guest_id, range } => {
                engine
                    .reserve(id, listing_id, guest_id, range)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![execution("INSERT", 1)])
            }
            Command::CancelBooking { id, guest_id } => {
                engine.cancel_booking(id, guest_id).await.map_err(engine_err)?;
                Ok(vec![execution("DELETE", 1)])
            }
            Command::PurgeUnpaid { reserved_before } => {
                let removed = match reserved_before {
                    Some(cutoff) => engine.purge_unpaid_before(cutoff).await,
                    None => engine.purge_unpaid().await,
                }
                .map_err(engine_err)?;
                Ok(vec![execution("DELETE", removed)])
            }
            Command::SelectBookings { listing_id, host_id } => {
                let bookings = match host_id {
                    Some(host) => engine.host_bookings(listing_id, host).await.map_err(engine_err)?,
                    None => engine.list_bookings(listing_id).await,
                };
                let schema = Arc::new(bookings_schema());
                let rows: Vec<PgWireResult<_>> = bookings
                    .into_iter()
                    .map(|b| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&b.id.to_string())?;
                        encoder.encode_field(&b.listing_id.to_string())?;
                        encoder.encode_field(&b.guest_id.to_string())?;
                        encoder.encode_field(&b.start.to_string())?;
                        encoder.encode_field(&b.end.to_string())?;
                        encoder.encode_field(&b.payment_session_id)?;
                        encoder.encode_field(&b.paid)?;
                        encoder.encode_field(&b.reserved_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::AttachPaymentSession { booking_id, guest_id, session_id } => {
                engine
                    .attach_payment_session(booking_id, guest_id, session_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![execution("INSERT", 1)])
            }
            Command::ConfirmPayment { session_id } => {
                let outcome = engine.confirm_payment(&session_id).await.map_err(engine_err)?;
                let rows = match outcome {
                    PaymentOutcome::Confirmed(_) => 1,
                    PaymentOutcome::AlreadyPaid(_) | PaymentOutcome::Unmatched => 0,
                };
                Ok(vec![execution("INSERT", rows)])
            }
            Command::Listen { channel } => {
                self.listen(engine, channel)?;
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
            Command::Unlisten { channel } => {
                self.unlisten(Some(&channel));
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
            Command::UnlistenAll => {
                self.unlisten(None);
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
        }
    }
}

fn execution(tag: &str, rows: usize) -> Response {
    Response::Execution(Tag::new(tag).with_rows(rows))
}

// ── Result schemas ───────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn listings_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("host_id"),
        FieldInfo::new("bookings".into(), None, None, Type::INT8, FieldFormat::Text),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text_field("listing_id"),
        text_field("start_date"),
        text_field("end_date"),
        text_field("status"),
    ]
}

fn free_ranges_schema() -> Vec<FieldInfo> {
    vec![text_field("listing_id"), text_field("start_date"), text_field("end_date")]
}

fn booked_dates_schema() -> Vec<FieldInfo> {
    vec![text_field("date")]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("listing_id"),
        text_field("guest_id"),
        text_field("start_date"),
        text_field("end_date"),
        text_field("payment_session_id"),
        FieldInfo::new("paid".into(), None, None, Type::BOOL, FieldFormat::Text),
        FieldInfo::new("reserved_at".into(), None, None, Type::INT8, FieldFormat::Text),
    ]
}

fn schema_for_table(table: &str) -> Vec<FieldInfo> {
    match table {
        "listings" => listings_schema(),
        "availability" => availability_schema(),
        "free_ranges" => free_ranges_schema(),
        "booked_dates" => booked_dates_schema(),
        "bookings" => bookings_schema(),
        _ => vec![],
    }
}

/// Result schema of a statement that may still contain `$n` placeholders.
fn schema_for_sql(sql: &str) -> Vec<FieldInfo> {
    select_table(sql).map(schema_for_table).unwrap_or_default()
}

/// Table named after FROM in a SELECT, without parsing the whole statement.
fn select_table(sql: &str) -> Option<&'static str> {
    let lower = sql.trim_start().to_lowercase();
    if !lower.starts_with("select") {
        return None;
    }
    let mut words = lower.split(|c: char| c.is_whitespace() || c == ';');
    words.find(|w| *w == "from")?;
    let table = words.find(|w| !w.is_empty())?;
    ["listings", "availability", "free_ranges", "booked_dates", "bookings"]
        .into_iter()
        .find(|t| *t == table.trim_matches('"'))
}

#[async_trait]
impl SimpleQueryHandler for StaydHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let responses = self.run(&engine, cmd).await;
        self.flush_notifications(client).await?;
        responses
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct StaydQueryParser;

#[async_trait]
impl QueryParser for StaydQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
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
        Ok(schema_for_sql(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for StaydHandler {
    type Statement = String;
    type QueryParser = StaydQueryParser;

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
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let responses = self.run(&engine, cmd).await;
        self.flush_notifications(client).await?;
        Ok(responses?.into_iter().next().unwrap_or(Response::EmptyQuery))
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
        Ok(DescribeStatementResponse::new(param_types, schema_for_sql(&target.statement)))
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
        Ok(DescribePortalResponse::new(schema_for_sql(&target.statement.statement)))
    }
}

/// Highest `$n` placeholder number in the statement.
fn count_params(sql: &str) -> usize {
    let mut max = 0;
    let mut rest = sql;
    while let Some(pos) = rest.find('$') {
        rest = &rest[pos + 1..];
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if let Ok(n) = rest[..digits].parse::<usize>() {
            max = max.max(n);
        }
        rest = &rest[digits..];
    }
    max
}

/// Replace `$n` placeholders with their bound text values, quoted as
/// string literals.
fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

/// Single left-to-right pass over the statement, so bound text is never
/// rescanned for placeholders. `$` inside a quoted literal is left alone.
fn bind_params<P: AsRef<[u8]>>(sql: &str, params: &[Option<P>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut in_literal = false;
    let mut chars = sql.char_indices();
    while let Some((pos, c)) = chars.next() {
        if c == '\'' {
            in_literal = !in_literal;
        }
        if c != '$' || in_literal {
            out.push(c);
            continue;
        }
        let rest = &sql[pos + 1..];
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        let bound = rest[..digits]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| params.get(i));
        let Some(param) = bound else {
            out.push(c);
            continue;
        };
        match param {
            Some(bytes) => {
                out.push('\'');
                out.push_str(&String::from_utf8_lossy(bytes.as_ref()).replace('\'', "''"));
                out.push('\'');
            }
            None => out.push_str("NULL"),
        }
        for _ in 0..digits {
            chars.next();
        }
    }
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct StaydFactory {
    handler: Arc<StaydHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<StaydAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl StaydFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, credentials: Credentials) -> Self {
        Self {
            handler: Arc::new(StaydHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                StaydAuthSource::new(credentials),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for StaydFactory {
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

/// Serve one client connection until it closes. Each connection gets its
/// own handler so LISTEN subscriptions end with the connection.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    credentials: Credentials,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(StaydFactory::new(tenant_manager, credentials));
    let result = pgwire::tokio::process_socket(socket, tls, factory).await;
    debug!("connection closed");
    result
}

// ── Error mapping ────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for each engine failure.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Conflict(_) => "23P01",
        EngineError::InvalidRange { .. } => "22007",
        EngineError::NotFound(_) => "P0002",
        EngineError::Forbidden(_) => "42501",
        EngineError::AlreadyExists(_) | EngineError::SessionInUse(_) => "23505",
        EngineError::HasBookings(_) => "2BP01",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

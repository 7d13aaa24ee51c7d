use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
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
use ulid::Ulid;

use crate::auth::{CoworkdAuthSource, Principal};
use crate::engine::Engine;
use crate::sql::{self, Command};

pub struct CoworkdHandler {
    engine: Arc<Engine>,
    query_parser: Arc<CoworkdQueryParser>,
}

impl CoworkdHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(CoworkdQueryParser),
        }
    }

    /// The connection's login user is a member email; resolve it to a
    /// portal identity on every query so role changes apply immediately.
    async fn principal<C: ClientInfo>(&self, client: &C) -> PgWireResult<Principal> {
        let email = client
            .metadata()
            .get("user")
            .cloned()
            .unwrap_or_default();
        self.engine.authenticate(&email).await.map_err(engine_err)
    }

    async fn execute_command(&self, who: &Principal, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            // ── members ──────────────────────────────────
            Command::InsertMember {
                id,
                name,
                email,
                company,
                department,
                phone,
                role,
            } => {
                engine
                    .create_member(who, id, name, email, company, department, phone, role)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateMember { id, patch } => {
                engine
                    .update_member(who, id, patch)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteMember { id } => {
                engine.delete_member(who, id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectMembers => {
                let members = engine.list_members();
                let schema = Arc::new(members_schema());
                let rows: Vec<PgWireResult<_>> = members
                    .into_iter()
                    .map(|m| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&m.id.to_string())?;
                        encoder.encode_field(&m.name)?;
                        encoder.encode_field(&m.email)?;
                        encoder.encode_field(&m.company.as_deref())?;
                        encoder.encode_field(&m.department.as_deref())?;
                        encoder.encode_field(&m.phone.as_deref())?;
                        encoder.encode_field(&m.status.as_str())?;
                        encoder.encode_field(&m.role.as_str())?;
                        encoder.encode_field(&m.joined_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            // ── resources ────────────────────────────────
            Command::InsertResource {
                id,
                name,
                category,
                capacity,
                location,
                description,
            } => {
                engine
                    .create_resource(who, id, name, category, capacity, location, description)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateResource { id, patch } => {
                engine
                    .update_resource(who, id, patch)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteResource { id } => {
                engine.delete_resource(who, id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectResources => {
                let resources = engine.list_resources().await;
                let schema = Arc::new(resources_schema());
                let rows: Vec<PgWireResult<_>> = resources
                    .into_iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.name)?;
                        encoder.encode_field(&r.category.as_str())?;
                        encoder.encode_field(&(r.capacity as i64))?;
                        encoder.encode_field(&r.location.as_deref())?;
                        encoder.encode_field(&r.description.as_deref())?;
                        encoder.encode_field(&r.status.as_str())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            // ── bookings ─────────────────────────────────
            Command::InsertBooking {
                id,
                resource_id,
                start,
                end,
                purpose,
                member_id,
            } => {
                engine
                    .create_booking(who, id, resource_id, member_id, start, end, purpose)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::RescheduleBooking { id, start, end } => {
                engine
                    .reschedule_booking(who, id, start, end)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::SetBookingStatus { id, status } => {
                match status {
                    crate::model::BookingStatus::Confirmed => {
                        engine.confirm_booking(who, id).await.map_err(engine_err)?;
                    }
                    _ => {
                        engine.cancel_booking(who, id).await.map_err(engine_err)?;
                    }
                }
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteBooking { id } => {
                engine.delete_booking(who, id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectBookings {
                resource_id,
                member_id,
            } => {
                let bookings = engine.list_bookings(resource_id, member_id).await;
                let schema = Arc::new(bookings_schema());
                let rows: Vec<PgWireResult<_>> = bookings
                    .into_iter()
                    .map(|b| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&b.id.to_string())?;
                        encoder.encode_field(&b.resource_id.to_string())?;
                        encoder.encode_field(&b.member_id.to_string())?;
                        encoder.encode_field(&b.start)?;
                        encoder.encode_field(&b.end)?;
                        encoder.encode_field(&b.status.as_str())?;
                        encoder.encode_field(&b.purpose.as_deref())?;
                        encoder.encode_field(&b.created_at)?;
                        encoder.encode_field(&b.updated_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectAvailability {
                resource_id,
                start,
                end,
            } => {
                let slots = engine
                    .compute_availability(resource_id, start, end)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(availability_schema());
                let rid_str = resource_id.to_string();
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&rid_str)?;
                        encoder.encode_field(&slot.start)?;
                        encoder.encode_field(&slot.end)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectDashboard => {
                let stats = engine.dashboard_stats().await;
                let schema = Arc::new(dashboard_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&(stats.bookings_today as i64))?;
                encoder.encode_field(&(stats.active_members as i64))?;
                encoder.encode_field(&(stats.resources_available_now as i64))?;
                for util in &stats.utilization {
                    encoder.encode_field(&util.busy_pct)?;
                }
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            // LISTEN/UNLISTEN are acknowledged at the wire; delivery runs
            // on the in-process notify hub.
            Command::Listen { channel } => {
                parse_channel(&channel)?;
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
            Command::Unlisten { channel } => {
                parse_channel(&channel)?;
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
            Command::UnlistenAll => Ok(vec![Response::Execution(Tag::new("UNLISTEN"))]),
        }
    }
}

fn parse_channel(channel: &str) -> PgWireResult<Ulid> {
    let resource_id_str = channel.strip_prefix("resource_").ok_or_else(|| {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "42000".into(),
            format!("invalid channel: {channel} (expected resource_{{id}})"),
        )))
    })?;
    Ulid::from_string(resource_id_str).map_err(|e| {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "42000".into(),
            format!("bad ULID in channel: {e}"),
        )))
    })
}

// ── Result schemas ───────────────────────────────────────────────

fn varchar(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn float8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::FLOAT8, FieldFormat::Text)
}

fn members_schema() -> Vec<FieldInfo> {
    vec![
        varchar("id"),
        varchar("name"),
        varchar("email"),
        varchar("company"),
        varchar("department"),
        varchar("phone"),
        varchar("status"),
        varchar("role"),
        int8("joined_at"),
    ]
}

fn resources_schema() -> Vec<FieldInfo> {
    vec![
        varchar("id"),
        varchar("name"),
        varchar("category"),
        int8("capacity"),
        varchar("location"),
        varchar("description"),
        varchar("status"),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        varchar("id"),
        varchar("resource_id"),
        varchar("member_id"),
        int8("start"),
        int8("end"),
        varchar("status"),
        varchar("purpose"),
        int8("created_at"),
        int8("updated_at"),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![varchar("resource_id"), int8("start"), int8("end")]
}

fn dashboard_schema() -> Vec<FieldInfo> {
    vec![
        int8("bookings_today"),
        int8("active_members"),
        int8("resources_available_now"),
        float8("util_meeting_room"),
        float8("util_phone_booth"),
        float8("util_desk"),
        float8("util_equipment"),
    ]
}

fn schema_for_statement(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if !upper.contains("SELECT") {
        return vec![];
    }
    if upper.contains("AVAILABILITY") {
        availability_schema()
    } else if upper.contains("DASHBOARD") {
        dashboard_schema()
    } else if upper.contains("MEMBERS") {
        members_schema()
    } else if upper.contains("RESOURCES") {
        resources_schema()
    } else if upper.contains("BOOKINGS") {
        bookings_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for CoworkdHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let who = self.principal(client).await?;
        let cmd =
            sql::parse_sql(query, self.engine.config.tz_offset_min).map_err(sql_err)?;
        let label = crate::observability::command_label(&cmd);
        let start = std::time::Instant::now();
        let result = self.execute_command(&who, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(crate::observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(crate::observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        result
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct CoworkdQueryParser;

#[async_trait]
impl QueryParser for CoworkdQueryParser {
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
        Ok(schema_for_statement(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for CoworkdHandler {
    type Statement = String;
    type QueryParser = CoworkdQueryParser;

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
        let who = self.principal(client).await?;
        let sql = substitute_params(portal);
        let cmd =
            sql::parse_sql(&sql, self.engine.config.tz_offset_min).map_err(sql_err)?;
        let mut responses = self.execute_command(&who, cmd).await?;
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
            schema_for_statement(&target.statement),
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
        Ok(DescribePortalResponse::new(schema_for_statement(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
                && n > max
            {
                max = n;
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let sql = portal.statement.statement.to_string();
    render_params(&sql, &portal.parameters)
}

/// Quote-aware scan: a `$N` inside a single-quoted literal is text, not a
/// placeholder, and stays untouched.
fn render_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut in_literal = false;

    while let Some(c) = chars.next() {
        if in_literal {
            result.push(c);
            if c == '\'' {
                // '' is an escaped quote, not the end of the literal
                if chars.peek() == Some(&'\'') {
                    result.push('\'');
                    chars.next();
                } else {
                    in_literal = false;
                }
            }
            continue;
        }
        match c {
            '\'' => {
                in_literal = true;
                result.push(c);
            }
            '$' => {
                let mut digits = String::new();
                while let Some(&d) = chars.peek() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    digits.push(d);
                    chars.next();
                }
                match digits.parse::<usize>() {
                    Ok(n) if (1..=params.len()).contains(&n) => match &params[n - 1] {
                        Some(bytes) => {
                            let text = String::from_utf8_lossy(bytes.as_ref());
                            result.push('\'');
                            result.push_str(&text.replace('\'', "''"));
                            result.push('\'');
                        }
                        None => result.push_str("NULL"),
                    },
                    _ => {
                        result.push('$');
                        result.push_str(&digits);
                    }
                }
            }
            _ => result.push(c),
        }
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct CoworkdFactory {
    handler: Arc<CoworkdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<CoworkdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl CoworkdFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = CoworkdAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(CoworkdHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for CoworkdFactory {
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

/// Serve one client connection over the Postgres wire protocol.
pub async fn process_connection(
    socket: tokio::net::TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = CoworkdFactory::new(engine, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: crate::engine::EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "P0001".into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::render_params;

    fn params(values: &[Option<&str>]) -> Vec<Option<Vec<u8>>> {
        values
            .iter()
            .map(|v| v.map(|s| s.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn binds_quote_and_null() {
        let out = render_params(
            "UPDATE members SET company = $1, phone = $2 WHERE id = $3",
            &params(&[Some("O'Brien & Co"), None, Some("abc")]),
        );
        assert_eq!(
            out,
            "UPDATE members SET company = 'O''Brien & Co', phone = NULL WHERE id = 'abc'"
        );
    }

    #[test]
    fn placeholder_text_inside_literal_untouched() {
        let out = render_params(
            "INSERT INTO bookings (id, purpose) VALUES ($1, 'rate is $1 per hour')",
            &params(&[Some("abc")]),
        );
        assert_eq!(
            out,
            "INSERT INTO bookings (id, purpose) VALUES ('abc', 'rate is $1 per hour')"
        );
    }

    #[test]
    fn escaped_quotes_do_not_end_the_literal() {
        let out = render_params(
            "SELECT * FROM members WHERE name = 'O''Brien $2' AND id = $1",
            &params(&[Some("abc")]),
        );
        assert_eq!(
            out,
            "SELECT * FROM members WHERE name = 'O''Brien $2' AND id = 'abc'"
        );
    }

    #[test]
    fn out_of_range_placeholder_left_alone() {
        let out = render_params("SELECT $2", &params(&[Some("abc")]));
        assert_eq!(out, "SELECT $2");
    }
}

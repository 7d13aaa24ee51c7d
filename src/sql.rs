use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::clock;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertMember {
        id: Ulid,
        name: String,
        email: String,
        company: Option<String>,
        department: Option<String>,
        phone: Option<String>,
        role: MemberRole,
    },
    UpdateMember {
        id: Ulid,
        patch: MemberPatch,
    },
    DeleteMember {
        id: Ulid,
    },
    SelectMembers,
    InsertResource {
        id: Ulid,
        name: String,
        category: ResourceCategory,
        capacity: u32,
        location: Option<String>,
        description: Option<String>,
    },
    UpdateResource {
        id: Ulid,
        patch: ResourcePatch,
    },
    DeleteResource {
        id: Ulid,
    },
    SelectResources,
    InsertBooking {
        id: Ulid,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        purpose: Option<String>,
        member_id: Option<Ulid>,
    },
    RescheduleBooking {
        id: Ulid,
        start: Ms,
        end: Ms,
    },
    SetBookingStatus {
        id: Ulid,
        status: BookingStatus,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectBookings {
        resource_id: Option<Ulid>,
        member_id: Option<Ulid>,
    },
    SelectAvailability {
        resource_id: Ulid,
        start: Ms,
        end: Ms,
    },
    SelectDashboard,
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

/// Parse one SQL statement into a `Command`. Time values anywhere a
/// timestamp is expected accept either epoch milliseconds or the quoted
/// spelling `'YYYY-MM-DD H:MM AM'` interpreted in the portal's local day
/// (`tz_offset_min`).
pub fn parse_sql(sql: &str, tz_offset_min: i32) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    let upper = trimmed.to_uppercase();
    if upper.starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().trim_matches(';').to_string();
        return Ok(Command::Listen { channel });
    }
    if upper == "UNLISTEN *" || upper == "UNLISTEN *;" {
        return Ok(Command::UnlistenAll);
    }
    if upper.starts_with("UNLISTEN ") {
        let channel = trimmed[9..].trim().trim_matches(';').to_string();
        return Ok(Command::Unlisten { channel });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert, tz_offset_min),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query, tz_offset_min),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection, tz_offset_min),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert, tz: i32) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        // (id, name, email[, company[, department[, phone[, role]]]])
        "members" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("members", 3, values.len()));
            }
            let role = if values.len() >= 7 {
                parse_role(&values[6])?
            } else {
                MemberRole::Member
            };
            Ok(Command::InsertMember {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
                email: parse_string(&values[2])?,
                company: opt(&values, 3, parse_string_or_null)?,
                department: opt(&values, 4, parse_string_or_null)?,
                phone: opt(&values, 5, parse_string_or_null)?,
                role,
            })
        }
        // (id, name, category[, capacity[, location[, description]]])
        "resources" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("resources", 3, values.len()));
            }
            let capacity = if values.len() >= 4 {
                parse_u32(&values[3])?
            } else {
                1
            };
            Ok(Command::InsertResource {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
                category: parse_category(&values[2])?,
                capacity,
                location: opt(&values, 4, parse_string_or_null)?,
                description: opt(&values, 5, parse_string_or_null)?,
            })
        }
        // (id, resource_id, start, end[, purpose[, member_id]])
        "bookings" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("bookings", 4, values.len()));
            }
            Ok(Command::InsertBooking {
                id: parse_ulid(&values[0])?,
                resource_id: parse_ulid(&values[1])?,
                start: parse_time_expr(&values[2], tz)?,
                end: parse_time_expr(&values[3], tz)?,
                purpose: opt(&values, 4, parse_string_or_null)?,
                member_id: opt(&values, 5, parse_ulid_or_null)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "members" => Ok(Command::DeleteMember { id }),
        "resources" => Ok(Command::DeleteResource { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
    tz: i32,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let id = extract_where_id(selection)?;

    match table.as_str() {
        "members" => {
            let mut patch = MemberPatch::default();
            for a in assignments {
                let (col, value) = assignment_parts(a)?;
                match col.as_str() {
                    "name" => patch.name = Some(parse_string(value)?),
                    "company" => patch.company = Some(parse_string(value)?),
                    "department" => patch.department = Some(parse_string(value)?),
                    "phone" => patch.phone = Some(parse_string(value)?),
                    "status" => patch.status = Some(parse_member_status(value)?),
                    "role" => patch.role = Some(parse_role(value)?),
                    "email" => return Err(SqlError::Parse("email is immutable".into())),
                    other => return Err(SqlError::Parse(format!("unknown column: {other}"))),
                }
            }
            Ok(Command::UpdateMember { id, patch })
        }
        "resources" => {
            let mut patch = ResourcePatch::default();
            for a in assignments {
                let (col, value) = assignment_parts(a)?;
                match col.as_str() {
                    "name" => patch.name = Some(parse_string(value)?),
                    "category" => patch.category = Some(parse_category(value)?),
                    "capacity" => patch.capacity = Some(parse_u32(value)?),
                    "location" => patch.location = Some(parse_string(value)?),
                    "description" => patch.description = Some(parse_string(value)?),
                    "status" => patch.status = Some(parse_resource_status(value)?),
                    other => return Err(SqlError::Parse(format!("unknown column: {other}"))),
                }
            }
            Ok(Command::UpdateResource { id, patch })
        }
        "bookings" => {
            let (mut status, mut start, mut end) = (None, None, None);
            for a in assignments {
                let (col, value) = assignment_parts(a)?;
                match col.as_str() {
                    "status" => status = Some(parse_booking_status(value)?),
                    "start" => start = Some(parse_time_expr(value, tz)?),
                    "end" => end = Some(parse_time_expr(value, tz)?),
                    other => return Err(SqlError::Parse(format!("unknown column: {other}"))),
                }
            }
            match (status, start, end) {
                (Some(status), None, None) => Ok(Command::SetBookingStatus { id, status }),
                (None, Some(start), Some(end)) => {
                    Ok(Command::RescheduleBooking { id, start, end })
                }
                _ => Err(SqlError::Parse(
                    "bookings UPDATE sets either status or both start and \"end\"".into(),
                )),
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query, tz: i32) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    match table.as_str() {
        "members" => Ok(Command::SelectMembers),
        "resources" => Ok(Command::SelectResources),
        "dashboard" => Ok(Command::SelectDashboard),
        "bookings" => {
            let (mut resource_id, mut member_id) = (None, None);
            if let Some(selection) = &select.selection {
                extract_booking_filters(selection, &mut resource_id, &mut member_id)?;
            }
            Ok(Command::SelectBookings {
                resource_id,
                member_id,
            })
        }
        "availability" => {
            let (mut resource_id, mut start, mut end) = (None, None, None);
            if let Some(selection) = &select.selection {
                extract_availability_filters(selection, &mut resource_id, &mut start, &mut end, tz)?;
            }
            Ok(Command::SelectAvailability {
                resource_id: resource_id.ok_or(SqlError::MissingFilter("resource_id"))?,
                start: start.ok_or(SqlError::MissingFilter("start"))?,
                end: end.ok_or(SqlError::MissingFilter("end"))?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn extract_booking_filters(
    expr: &Expr,
    resource_id: &mut Option<Ulid>,
    member_id: &mut Option<Ulid>,
) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_booking_filters(left, resource_id, member_id)?;
                extract_booking_filters(right, resource_id, member_id)?;
            }
            ast::BinaryOperator::Eq => match expr_column_name(left).as_deref() {
                Some("resource_id") => *resource_id = Some(parse_ulid_expr(right)?),
                Some("member_id") => *member_id = Some(parse_ulid_expr(right)?),
                _ => {}
            },
            _ => {}
        }
    }
    Ok(())
}

fn extract_availability_filters(
    expr: &Expr,
    resource_id: &mut Option<Ulid>,
    start: &mut Option<Ms>,
    end: &mut Option<Ms>,
    tz: i32,
) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_availability_filters(left, resource_id, start, end, tz)?;
                extract_availability_filters(right, resource_id, start, end, tz)?;
            }
            ast::BinaryOperator::Eq => {
                if expr_column_name(left).as_deref() == Some("resource_id") {
                    *resource_id = Some(parse_ulid_expr(right)?);
                }
            }
            ast::BinaryOperator::GtEq => {
                if expr_column_name(left).as_deref() == Some("start") {
                    *start = Some(parse_time_expr(right, tz)?);
                }
            }
            ast::BinaryOperator::LtEq => {
                if expr_column_name(left).as_deref() == Some("end") {
                    *end = Some(parse_time_expr(right, tz)?);
                }
            }
            _ => {}
        }
    }
    Ok(())
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

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows[0].clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
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
                parse_ulid_expr(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn assignment_parts(a: &ast::Assignment) -> Result<(String, &Expr), SqlError> {
    match &a.target {
        AssignmentTarget::ColumnName(name) => {
            let col = object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?;
            Ok((col, &a.value))
        }
        _ => Err(SqlError::Parse("unsupported assignment target".into())),
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

fn opt<T>(
    values: &[Expr],
    idx: usize,
    f: impl Fn(&Expr) -> Result<Option<T>, SqlError>,
) -> Result<Option<T>, SqlError> {
    match values.get(idx) {
        Some(expr) => f(expr),
        None => Ok(None),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    parse_ulid_expr(expr)
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if let Some(Value::Null) = extract_value(expr) {
        Ok(None)
    } else {
        parse_ulid_expr(expr).map(Some)
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr) {
        Ok(s.clone())
    } else {
        Err(SqlError::Parse(format!("expected string, got {expr:?}")))
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

/// A timestamp expression: a number is epoch ms, a quoted string is either
/// all-digit epoch ms or a `'YYYY-MM-DD H:MM AM'` instant.
fn parse_time_expr(expr: &Expr, tz: i32) -> Result<Ms, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad timestamp: {e}"))),
            Value::SingleQuotedString(s) => {
                let digits = s.strip_prefix('-').unwrap_or(s);
                if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                    s.parse()
                        .map_err(|e| SqlError::Parse(format!("bad timestamp: {e}")))
                } else {
                    clock::parse_instant(s, tz).map_err(|e| SqlError::Parse(e.to_string()))
                }
            }
            _ => Err(SqlError::Parse(format!("expected timestamp, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_time_expr(expr, tz)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v: i64 = if let Some(Value::Number(s, _)) = extract_value(expr) {
        s.parse()
            .map_err(|e| SqlError::Parse(format!("bad number: {e}")))?
    } else {
        return Err(SqlError::Parse(format!("expected number, got {expr:?}")));
    };
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_category(expr: &Expr) -> Result<ResourceCategory, SqlError> {
    let s = parse_string(expr)?;
    ResourceCategory::parse(&s).ok_or_else(|| SqlError::Parse(format!("unknown category: {s}")))
}

fn parse_resource_status(expr: &Expr) -> Result<ResourceStatus, SqlError> {
    let s = parse_string(expr)?;
    ResourceStatus::parse(&s).ok_or_else(|| SqlError::Parse(format!("unknown status: {s}")))
}

fn parse_member_status(expr: &Expr) -> Result<MemberStatus, SqlError> {
    let s = parse_string(expr)?;
    MemberStatus::parse(&s).ok_or_else(|| SqlError::Parse(format!("unknown status: {s}")))
}

fn parse_role(expr: &Expr) -> Result<MemberRole, SqlError> {
    let s = parse_string(expr)?;
    MemberRole::parse(&s).ok_or_else(|| SqlError::Parse(format!("unknown role: {s}")))
}

/// Clients may only set `cancelled` (withdraw) or `confirmed` (approve)
/// through UPDATE; the other statuses are engine-managed.
fn parse_booking_status(expr: &Expr) -> Result<BookingStatus, SqlError> {
    let s = parse_string(expr)?;
    match BookingStatus::parse(&s) {
        Some(status @ (BookingStatus::Cancelled | BookingStatus::Confirmed)) => Ok(status),
        Some(_) => Err(SqlError::Parse(format!("status not settable: {s}"))),
        None => Err(SqlError::Parse(format!("unknown status: {s}"))),
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
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

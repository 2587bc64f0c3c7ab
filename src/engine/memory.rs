//! A small in-memory [`QueryEngine`].
//!
//! Tables live in memory as a single block each. SELECT understands constant
//! projections, a handful of table functions and plain table scans:
//!
//! - `SELECT 1, 'a' AS s`
//! - `SELECT * FROM numbers(N)` and the endless `system.numbers`
//! - `SELECT * FROM t`, `SELECT a, b FROM t`, where `t` may also be an external
//!   table sent along with the query
//! - `SELECT sleep(ms)` and `SELECT throw('message')`
//! - `SELECT * FROM read_tasks()` and `SELECT * FROM parallel_read('p1', ...)`, which
//!   pull work from the distributed read initiator of the connection.
//!
//! Query parameters (`{name:Type}`) are substituted before planning.
use std::{collections::BTreeMap, sync::Arc, thread, time::Duration};

use log::debug;
use parking_lot::RwLock;

use crate::{
    block::{Block, Column, DataType, NamedColumn},
    protocol::{
        CoordinationMode, InitialRangesAnnouncement, MarkRange, ParallelReadRequest,
        QualifiedTableName, QueryStage, RangesInPart, Setting, TableStatus,
    },
    statement::{InsertSource, ParsedQuery, Statement},
    telemetry::{LogLevel, Progress, events},
};

use super::{
    EngineError, ExecutionContext, InsertSink, Pipeline, Producer, QueryEngine, ThreadedPipeline,
};

/// Marks announced per part by `parallel_read`.
const PARALLEL_READ_MARKS: u64 = 8;

type Tables = Arc<RwLock<BTreeMap<String, Block>>>;

#[derive(Debug, Default, Clone)]
pub struct MemoryEngine {
    tables: Tables,
}

enum Source {
    Rows(Block),
    Numbers { limit: Option<u64> },
    Table(Block),
    ReadTasks,
    ParallelRead(Vec<String>),
    Sleep(Duration),
    Throw(String),
}

struct Plan {
    header: Block,
    projection: Option<Vec<String>>,
    source: Source,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_table(&self, name: &str, header: Block) -> Result<(), EngineError> {
        let mut tables = self.tables.write();
        if tables.contains_key(name) {
            return Err(EngineError::TableAlreadyExists(name.to_string()));
        }
        debug!("created table {name} ({})", header.describe_columns());
        tables.insert(name.to_string(), header.header());
        Ok(())
    }

    /// Snapshot of a table's contents.
    pub fn table(&self, name: &str) -> Option<Block> {
        self.tables.read().get(name).cloned()
    }

    /// Appends rows to `table`. Columns are matched by name; table columns missing
    /// from `block` are filled with default values.
    pub fn insert_block(&self, table: &str, block: &Block) -> Result<(), EngineError> {
        insert_into(&self.tables, table, block)
    }

    fn table_header(&self, name: &str) -> Result<Block, EngineError> {
        self.tables
            .read()
            .get(name)
            .map(Block::header)
            .ok_or_else(|| EngineError::UnknownTable(name.to_string()))
    }

    fn target_header(&self, table: &str, columns: Option<&[String]>) -> Result<Block, EngineError> {
        let header = self.table_header(table)?;
        match columns {
            None => Ok(header),
            Some(names) => project(&header, Some(names)),
        }
    }

    fn plan_select(&self, text: &str, ctx: &ExecutionContext) -> Result<Plan, EngineError> {
        let text = substitute_parameters(text, &ctx.parameters)?;
        let lower = text.to_ascii_lowercase();
        if !lower.starts_with("select") {
            return Err(EngineError::Unsupported(text));
        }

        let (projection, from) = match lower.find(" from ") {
            Some(at) => (&text["select".len()..at], Some(text[at + " from ".len()..].trim())),
            None => (&text["select".len()..], None),
        };
        let projection = projection.trim();

        let Some(from) = from else {
            return plan_constant(projection);
        };

        let names = if projection == "*" {
            None
        } else {
            Some(
                split_top_level(projection, ',')
                    .into_iter()
                    .map(|c| c.trim().to_string())
                    .collect::<Vec<_>>(),
            )
        };
        let from_lower = from.to_ascii_lowercase();

        let (header, source) = if let Some(args) = function_args(from, "numbers") {
            let limit = args
                .trim()
                .parse()
                .map_err(|_| EngineError::Syntax(format!("numbers() expects a count, got '{args}'")))?;
            (numbers_header(), Source::Numbers { limit: Some(limit) })
        } else if from_lower == "system.numbers" {
            (numbers_header(), Source::Numbers { limit: None })
        } else if function_args(from, "read_tasks").is_some() {
            let header = Block::new().with_column("task", Column::String(Vec::new()))?;
            (header, Source::ReadTasks)
        } else if let Some(args) = function_args(from, "parallel_read") {
            let parts = split_top_level(args, ',')
                .into_iter()
                .map(unquote)
                .collect::<Result<Vec<_>, _>>()?;
            (parallel_read_header()?, Source::ParallelRead(parts))
        } else {
            let rows = ctx
                .external_tables
                .get(from)
                .cloned()
                .or_else(|| self.table(from))
                .ok_or_else(|| EngineError::UnknownTable(from.to_string()))?;
            (rows.header(), Source::Table(rows))
        };

        Ok(Plan {
            header: project(&header, names.as_deref())?,
            projection: names,
            source,
        })
    }

    /// Runs a finite SELECT to completion and returns all of its rows.
    fn materialize(&self, text: &str, ctx: &ExecutionContext) -> Result<Block, EngineError> {
        let plan = self.plan_select(text, ctx)?;
        let rows = match plan.source {
            Source::Rows(block) | Source::Table(block) => block,
            Source::Numbers { limit: Some(limit) } => numbers_block(0, limit)?,
            Source::Throw(message) => return Err(EngineError::Execution(message)),
            _ => {
                return Err(EngineError::Unsupported(format!(
                    "INSERT from an unbounded or remote source: {text}"
                )));
            }
        };
        project(&rows, plan.projection.as_deref())
    }

    fn write_rows(
        &self,
        table: &str,
        rows: Block,
        ctx: &ExecutionContext,
    ) -> Result<(), EngineError> {
        account_written(ctx, &rows);
        insert_into(&self.tables, table, &rows)
    }
}

impl QueryEngine for MemoryEngine {
    fn insert_header(&self, query: &ParsedQuery, _ctx: &ExecutionContext) -> Result<Block, EngineError> {
        match &query.statement {
            Statement::Insert { table, columns, .. } => self.target_header(table, columns.as_deref()),
            _ => Err(EngineError::Unsupported(format!(
                "not an INSERT: {}",
                query.text
            ))),
        }
    }

    fn start_insert(
        &self,
        query: &ParsedQuery,
        ctx: &ExecutionContext,
    ) -> Result<Box<dyn InsertSink>, EngineError> {
        let Statement::Insert {
            table,
            columns,
            source: InsertSource::ClientData,
        } = &query.statement
        else {
            return Err(EngineError::Unsupported(format!(
                "INSERT without client data: {}",
                query.text
            )));
        };
        let header = self.target_header(table, columns.as_deref())?;

        Ok(Box::new(MemorySink {
            tables: Arc::clone(&self.tables),
            table: table.clone(),
            pending: Block::new(),
            header,
            ctx: ctx.clone(),
        }))
    }

    fn execute(&self, query: &ParsedQuery, ctx: ExecutionContext) -> Result<Box<dyn Pipeline>, EngineError> {
        ctx.logs.push(
            LogLevel::Debug,
            "executeQuery",
            format!("(from {}) {}", ctx.user, query.text),
        );

        match &query.statement {
            Statement::Select(text) => {
                let Plan {
                    header,
                    projection,
                    source,
                } = self.plan_select(text, &ctx)?;
                if ctx.stage == QueryStage::FetchColumns {
                    return Ok(Box::new(ThreadedPipeline::spawn(header, ctx, |_| Ok(()))?));
                }
                let pipeline = ThreadedPipeline::spawn(header, ctx, move |p| {
                    run(source, projection.as_deref(), p)
                })?;
                Ok(Box::new(pipeline))
            }
            Statement::CreateTable { table, columns } => {
                let header = columns.iter().try_fold(Block::new(), |block, (name, ty)| {
                    block.with_column(name, Column::empty(*ty))
                })?;
                self.create_table(table, header)?;
                Ok(Box::new(ThreadedPipeline::spawn(Block::new(), ctx, |_| Ok(()))?))
            }
            Statement::Insert {
                table,
                columns,
                source,
            } => {
                let header = self.target_header(table, columns.as_deref())?;
                let rows = match source {
                    InsertSource::Select(select) => {
                        rename_to(&self.materialize(select, &ctx)?, &header)?
                    }
                    InsertSource::Values(values) => parse_values(values, &header)?,
                    InsertSource::ClientData => {
                        return Err(EngineError::Unsupported(
                            "INSERT data must be sent by the client".to_string(),
                        ));
                    }
                };
                self.write_rows(table, rows, &ctx)?;
                Ok(Box::new(ThreadedPipeline::spawn(Block::new(), ctx, |_| Ok(()))?))
            }
        }
    }

    fn tables_status(&self, tables: &[QualifiedTableName]) -> Vec<(QualifiedTableName, TableStatus)> {
        let known = self.tables.read();
        tables
            .iter()
            .filter(|t| known.contains_key(&t.table))
            .map(|t| {
                (
                    t.clone(),
                    TableStatus {
                        is_replicated: false,
                        absolute_delay: 0,
                    },
                )
            })
            .collect()
    }
}

struct MemorySink {
    tables: Tables,
    table: String,
    header: Block,
    pending: Block,
    ctx: ExecutionContext,
}

impl InsertSink for MemorySink {
    fn header(&self) -> &Block {
        &self.header
    }

    fn write(&mut self, block: Block) -> Result<(), EngineError> {
        block.check_header(&self.header)?;
        account_written(&self.ctx, &block);
        self.pending.append(&block)?;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<(), EngineError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.ctx.logs.push(
            LogLevel::Information,
            "MemorySink",
            format!("inserted {} rows into {}", self.pending.rows(), self.table),
        );
        insert_into(&self.tables, &self.table, &self.pending)
    }
}

fn account_written(ctx: &ExecutionContext, block: &Block) {
    let rows = block.rows() as u64;
    let bytes = block.byte_size() as u64;
    ctx.progress.increment(&Progress::written(rows, bytes));
    ctx.profile.increment(events::INSERTED_ROWS, rows);
    ctx.profile.increment(events::INSERTED_BYTES, bytes);
}

fn insert_into(tables: &Tables, table: &str, block: &Block) -> Result<(), EngineError> {
    let mut tables = tables.write();
    let rows = tables
        .get_mut(table)
        .ok_or_else(|| EngineError::UnknownTable(table.to_string()))?;
    let conformed = conform(block, &rows.header())?;
    rows.append(&conformed)?;
    Ok(())
}

/// Produces the rows of `source`, stopping early once the consumer stops reading.
fn run(source: Source, projection: Option<&[String]>, p: &Producer) -> Result<(), EngineError> {
    let ctx = p.context();
    let max_block_size = ctx.settings.max_block_size;
    let emit = |block: Block| -> Result<bool, EngineError> { Ok(p.emit(project(&block, projection)?)) };

    match source {
        Source::Rows(block) => {
            emit(block)?;
        }
        Source::Table(rows) => {
            for part in rows.split(max_block_size) {
                if !emit(part)? {
                    break;
                }
            }
        }
        Source::Numbers { limit } => {
            if let Some(limit) = limit {
                ctx.progress.increment(&Progress {
                    total_rows_to_read: limit,
                    ..Progress::default()
                });
            }
            let mut next = 0;
            while limit.is_none_or(|limit| next < limit) {
                let mut end = next + max_block_size as u64;
                if let Some(limit) = limit {
                    end = end.min(limit);
                }
                if !emit(numbers_block(next, end)?)? {
                    break;
                }
                next = end;
            }
        }
        Source::ReadTasks => {
            let tasks = ctx.read_tasks.clone().ok_or_else(|| {
                EngineError::Unsupported("read_tasks() outside of a distributed read".to_string())
            })?;
            while let Some(task) = tasks.next_task()? {
                ctx.logs
                    .push(LogLevel::Debug, "MemoryEngine", format!("got read task '{task}'"));
                let block = Block::new().with_column("task", Column::String(vec![task]))?;
                if !emit(block)? {
                    break;
                }
            }
        }
        Source::ParallelRead(parts) => {
            let tasks = ctx.read_tasks.clone().ok_or_else(|| {
                EngineError::Unsupported("parallel_read() outside of a distributed read".to_string())
            })?;
            tasks.announce_ranges(InitialRangesAnnouncement {
                replica_num: 0,
                mode: CoordinationMode::Default,
                description: parts
                    .iter()
                    .map(|part| RangesInPart {
                        part_name: part.clone(),
                        ranges: vec![MarkRange {
                            begin: 0,
                            end: PARALLEL_READ_MARKS,
                        }],
                    })
                    .collect(),
            })?;

            loop {
                let request = ParallelReadRequest {
                    replica_num: 0,
                    mode: CoordinationMode::Default,
                    min_number_of_marks: 1,
                    description: Vec::new(),
                };
                let Some(response) = tasks.request_ranges(request)? else {
                    break;
                };
                let block = ranges_block(&response.description)?;
                if !block.is_empty() && !emit(block)? {
                    break;
                }
                if response.finish {
                    break;
                }
            }
        }
        Source::Sleep(duration) => {
            let slice = Duration::from_millis(10);
            let mut slept = Duration::ZERO;
            while slept < duration && !p.is_cancelled() {
                thread::sleep(slice.min(duration - slept));
                slept += slice;
            }
            emit(Block::new().with_column("sleep", Column::UInt64(vec![0]))?)?;
        }
        Source::Throw(message) => return Err(EngineError::Execution(message)),
    }

    ctx.logs
        .push(LogLevel::Debug, "MemoryEngine", "query finished reading");
    Ok(())
}

fn plan_constant(projection: &str) -> Result<Plan, EngineError> {
    let items = split_top_level(projection, ',');
    if let [item] = items.as_slice() {
        if let Some(args) = function_args(item.trim(), "throw") {
            return Ok(Plan {
                header: Block::new(),
                projection: None,
                source: Source::Throw(unquote(args)?),
            });
        }
        if let Some(args) = function_args(item.trim(), "sleep") {
            let ms = args
                .trim()
                .parse()
                .map_err(|_| EngineError::Syntax(format!("sleep() expects milliseconds, got '{args}'")))?;
            return Ok(Plan {
                header: Block::new().with_column("sleep", Column::UInt64(Vec::new()))?,
                projection: None,
                source: Source::Sleep(Duration::from_millis(ms)),
            });
        }
    }

    let mut row = Block::new();
    for item in items {
        let item = item.trim();
        let (expr, name) = match item.to_ascii_lowercase().rfind(" as ") {
            Some(at) => (item[..at].trim(), item[at + " as ".len()..].trim()),
            None => (item, item),
        };
        row = row.with_column(name, literal_column(expr)?)?;
    }
    Ok(Plan {
        header: row.header(),
        projection: None,
        source: Source::Rows(row),
    })
}

fn literal_column(expr: &str) -> Result<Column, EngineError> {
    if expr.starts_with('\'') {
        return Ok(Column::String(vec![unquote(expr)?]));
    }
    if let Ok(v) = expr.parse::<u64>() {
        return Ok(Column::UInt64(vec![v]));
    }
    if let Ok(v) = expr.parse::<i64>() {
        return Ok(Column::Int64(vec![v]));
    }
    if let Ok(v) = expr.parse::<f64>() {
        return Ok(Column::Float64(vec![v]));
    }
    Err(EngineError::Unsupported(format!("expression '{expr}'")))
}

fn numbers_header() -> Block {
    Block::new()
        .with_column("number", Column::UInt64(Vec::new()))
        .unwrap_or_default()
}

fn numbers_block(start: u64, end: u64) -> Result<Block, EngineError> {
    Ok(Block::new().with_column("number", Column::UInt64((start..end).collect()))?)
}

fn parallel_read_header() -> Result<Block, EngineError> {
    ranges_block(&[])
}

fn ranges_block(description: &[RangesInPart]) -> Result<Block, EngineError> {
    let mut part = Vec::new();
    let mut begin = Vec::new();
    let mut end = Vec::new();
    for ranges in description {
        for range in &ranges.ranges {
            part.push(ranges.part_name.clone());
            begin.push(range.begin);
            end.push(range.end);
        }
    }
    Ok(Block::new()
        .with_column("part", Column::String(part))?
        .with_column("begin", Column::UInt64(begin))?
        .with_column("end", Column::UInt64(end))?)
}

/// Selects and orders columns by name; `None` keeps all of them.
fn project(block: &Block, names: Option<&[String]>) -> Result<Block, EngineError> {
    let Some(names) = names else {
        return Ok(block.clone());
    };
    let columns = names
        .iter()
        .map(|name| {
            block
                .column(name)
                .map(|column| NamedColumn {
                    name: name.clone(),
                    column: column.clone(),
                })
                .ok_or_else(|| EngineError::Syntax(format!("missing column '{name}'")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Block::from_columns(columns)?)
}

/// Gives the columns of `rows` the names of `header`, by position.
fn rename_to(rows: &Block, header: &Block) -> Result<Block, EngineError> {
    if rows.columns().len() != header.columns().len() {
        return Err(EngineError::Structure(format!(
            "INSERT expects {} columns, SELECT returned {}",
            header.columns().len(),
            rows.columns().len()
        )));
    }
    let columns = rows
        .columns()
        .iter()
        .zip(header.columns())
        .map(|(value, target)| {
            if value.column.data_type() != target.column.data_type() {
                return Err(EngineError::Structure(format!(
                    "cannot insert {} into column {} of type {}",
                    value.column.data_type(),
                    target.name,
                    target.column.data_type()
                )));
            }
            Ok(NamedColumn {
                name: target.name.clone(),
                column: value.column.clone(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Block::from_columns(columns)?)
}

/// Shapes `block` like `table`, filling absent columns with defaults.
fn conform(block: &Block, table: &Block) -> Result<Block, EngineError> {
    let rows = block.rows();
    let columns = table
        .columns()
        .iter()
        .map(|target| {
            let data_type = target.column.data_type();
            let column = match block.column(&target.name) {
                Some(column) if column.data_type() == data_type => column.clone(),
                Some(column) => {
                    return Err(EngineError::Structure(format!(
                        "column {} has type {data_type}, got {}",
                        target.name,
                        column.data_type()
                    )));
                }
                None => defaults(data_type, rows),
            };
            Ok(NamedColumn {
                name: target.name.clone(),
                column,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Block::from_columns(columns)?)
}

fn defaults(data_type: DataType, rows: usize) -> Column {
    match data_type {
        DataType::UInt64 => Column::UInt64(vec![0; rows]),
        DataType::Int64 => Column::Int64(vec![0; rows]),
        DataType::Float64 => Column::Float64(vec![0.0; rows]),
        DataType::String => Column::String(vec![String::new(); rows]),
    }
}

fn parse_values(text: &str, header: &Block) -> Result<Block, EngineError> {
    let mut columns: Vec<Column> = header
        .columns()
        .iter()
        .map(|c| Column::empty(c.column.data_type()))
        .collect();

    for tuple in split_top_level(text, ',') {
        let tuple = tuple.trim();
        let inner = tuple
            .strip_prefix('(')
            .and_then(|t| t.strip_suffix(')'))
            .ok_or_else(|| EngineError::Syntax(format!("expected a (...) tuple, got '{tuple}'")))?;
        let values = split_top_level(inner, ',');
        if values.len() != columns.len() {
            return Err(EngineError::Syntax(format!(
                "tuple {tuple} has {} values, expected {}",
                values.len(),
                columns.len()
            )));
        }
        for (column, value) in columns.iter_mut().zip(values) {
            push_literal(column, value.trim())?;
        }
    }

    let named = header
        .columns()
        .iter()
        .zip(columns)
        .map(|(h, column)| NamedColumn {
            name: h.name.clone(),
            column,
        })
        .collect();
    Ok(Block::from_columns(named)?)
}

fn push_literal(column: &mut Column, value: &str) -> Result<(), EngineError> {
    let data_type = column.data_type();
    let bad = || EngineError::Syntax(format!("cannot parse '{value}' as {data_type}"));
    match column {
        Column::UInt64(v) => v.push(value.parse().map_err(|_| bad())?),
        Column::Int64(v) => v.push(value.parse().map_err(|_| bad())?),
        Column::Float64(v) => v.push(value.parse().map_err(|_| bad())?),
        Column::String(v) => v.push(unquote(value)?),
    }
    Ok(())
}

/// Arguments of `name(...)` when `expr` is a call of that function.
fn function_args<'a>(expr: &'a str, name: &str) -> Option<&'a str> {
    let head = expr.get(..name.len())?;
    if !head.eq_ignore_ascii_case(name) {
        return None;
    }
    expr[name.len()..]
        .trim_start()
        .strip_prefix('(')?
        .strip_suffix(')')
}

fn unquote(value: &str) -> Result<String, EngineError> {
    let value = value.trim();
    value
        .strip_prefix('\'')
        .and_then(|v| v.strip_suffix('\''))
        .map(|v| v.replace("''", "'"))
        .ok_or_else(|| EngineError::Syntax(format!("expected a quoted string, got '{value}'")))
}

/// Splits on `sep` outside of quotes and parentheses.
fn split_top_level(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quoted = false;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '\'' => quoted = !quoted,
            '(' if !quoted => depth += 1,
            ')' if !quoted => depth = depth.saturating_sub(1),
            c if c == sep && !quoted && depth == 0 => {
                parts.push(&s[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    if !s[start..].trim().is_empty() || !parts.is_empty() {
        parts.push(&s[start..]);
    }
    parts
}

fn substitute_parameters(text: &str, parameters: &[Setting]) -> Result<String, EngineError> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(open) = rest.find('{') {
        let Some(len) = rest[open..].find('}') else {
            break;
        };
        let close = open + len;
        let Some((name, ty)) = rest[open + 1..close].split_once(':') else {
            out.push_str(&rest[..=close]);
            rest = &rest[close + 1..];
            continue;
        };
        let name = name.trim();
        let value = parameters
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
            .ok_or_else(|| EngineError::Syntax(format!("substitution '{name}' is not set")))?;

        out.push_str(&rest[..open]);
        match DataType::parse(ty) {
            Some(DataType::String) => {
                out.push('\'');
                out.push_str(&value.replace('\'', "''"));
                out.push('\'');
            }
            Some(data_type) => {
                let mut probe = Column::empty(data_type);
                push_literal(&mut probe, value)?;
                out.push_str(value);
            }
            None => return Err(EngineError::Syntax(format!("unknown type '{ty}' of parameter {name}"))),
        }
        rest = &rest[close + 1..];
    }

    out.push_str(rest);
    Ok(out)
}

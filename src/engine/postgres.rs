// ABOUTME: PostgreSQL backend over tokio-postgres with native TLS
// ABOUTME: Maps column types to cell values and binds parameters by the target column's type

use crate::error::MoverError;
use crate::table::{TabularBuffer, Value};
use crate::utils::{self, quote_column, quote_ident};
use anyhow::{anyhow, Context, Result};
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use std::time::Duration;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Client, Config, GenericClient, Row, Statement};

const QUOTE: char = '"';

/// Types read and bound directly; everything else travels as text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Native {
    Bool,
    Int2,
    Int4,
    Int8,
    Oid,
    Float4,
    Float8,
    Text,
    Bytea,
    Json,
}

fn native(ty: &Type) -> Option<Native> {
    let native = if *ty == Type::BOOL {
        Native::Bool
    } else if *ty == Type::INT2 {
        Native::Int2
    } else if *ty == Type::INT4 {
        Native::Int4
    } else if *ty == Type::INT8 {
        Native::Int8
    } else if *ty == Type::OID {
        Native::Oid
    } else if *ty == Type::FLOAT4 {
        Native::Float4
    } else if *ty == Type::FLOAT8 {
        Native::Float8
    } else if *ty == Type::TEXT
        || *ty == Type::VARCHAR
        || *ty == Type::BPCHAR
        || *ty == Type::NAME
    {
        Native::Text
    } else if *ty == Type::BYTEA {
        Native::Bytea
    } else if *ty == Type::JSON || *ty == Type::JSONB {
        Native::Json
    } else {
        return None;
    };
    Some(native)
}

/// Connect to PostgreSQL with TLS support
pub async fn connect(config: &Config) -> Result<Client> {
    let tls_connector = TlsConnector::builder()
        .danger_accept_invalid_certs(false)
        .build()
        .context("Failed to build TLS connector")?;
    let tls = MakeTlsConnector::new(tls_connector);

    let (client, connection) = config.connect(tls).await.map_err(|e| {
        let error_msg = e.to_string();

        if error_msg.contains("password authentication failed") {
            anyhow!(
                "Authentication failed: Invalid username or password.\n\
                 Please verify the password_file for this connection."
            )
        } else if error_msg.contains("database") && error_msg.contains("does not exist") {
            anyhow!(
                "Database does not exist: {}\n\
                 Please create the database first or fix the connection's database field.",
                error_msg
            )
        } else if error_msg.contains("Connection refused")
            || error_msg.contains("could not connect")
            || error_msg.contains("error connecting to server")
        {
            anyhow!(
                "Connection refused: Unable to reach database server.\n\
                 Please check:\n\
                 - The host and port are correct\n\
                 - The database server is running\n\
                 - Firewall rules allow connections\n\
                 Error: {}",
                error_msg
            )
        } else if error_msg.contains("timeout") || error_msg.contains("timed out") {
            anyhow!(
                "Connection timeout: Database server did not respond in time.\n\
                 Error: {}",
                error_msg
            )
        } else if error_msg.contains("SSL") || error_msg.contains("TLS") {
            anyhow!(
                "TLS/SSL error: Failed to establish secure connection.\n\
                 Error: {}",
                error_msg
            )
        } else if error_msg.contains("no pg_hba.conf entry") {
            anyhow!(
                "Access denied: No pg_hba.conf entry for host.\n\
                 The database server is not configured to accept connections from your host.\n\
                 Error: {}",
                error_msg
            )
        } else {
            anyhow!("Failed to connect to database: {}", error_msg)
        }
    })?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("Connection error: {}", e);
        }
    });

    Ok(client)
}

/// Connect with automatic retry for transient failures
pub async fn connect_with_retry(config: &Config) -> Result<Client> {
    utils::retry_with_backoff(
        || connect(config),
        3,                      // Max 3 retries
        Duration::from_secs(1), // Start with 1 second delay
    )
    .await
    .context("Failed to connect after retries")
}

pub struct PostgresEngine {
    client: Client,
}

impl PostgresEngine {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn read_table(&self, table: &str) -> Result<TabularBuffer> {
        read_query(&self.client, &format!("SELECT * FROM {}", quote_ident(table, QUOTE)))
            .await
            .with_context(|| format!("Failed to read table '{}'", table))
    }

    pub async fn read_column(&self, table: &str, column: &str) -> Result<Vec<Value>> {
        let sql = format!(
            "SELECT {} FROM {}",
            quote_column(column, QUOTE),
            quote_ident(table, QUOTE)
        );
        let buffer = read_query(&self.client, &sql)
            .await
            .with_context(|| format!("Failed to read {}.{}", table, column))?;
        Ok(buffer.rows().iter().map(|row| row[0].clone()).collect())
    }

    pub async fn table_exists(&self, table: &str) -> Result<bool> {
        let row = self
            .client
            .query_one("SELECT to_regclass($1) IS NOT NULL", &[&table])
            .await
            .with_context(|| format!("Failed to look up table '{}'", table))?;
        Ok(row.get(0))
    }

    /// Insert every row in a single transaction; nothing is kept on failure
    pub async fn insert_rows(&mut self, table: &str, rows: &TabularBuffer) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let tx = self
            .client
            .transaction()
            .await
            .context("Failed to start transaction")?;
        let (stmt, binds) = prepare_insert(&tx, table, rows.columns()).await?;

        let mut inserted = 0u64;
        for (idx, row) in rows.rows().iter().enumerate() {
            let params = row
                .iter()
                .zip(&binds)
                .zip(rows.columns())
                .map(|((value, bind), column)| {
                    to_param(value, *bind).with_context(|| format!("column '{}'", column))
                })
                .collect::<Result<Vec<_>>>()
                .with_context(|| format!("Cannot bind row {} of '{}'", idx, table))?;
            let refs: Vec<&(dyn ToSql + Sync)> = params.iter().map(|p| p.as_ref()).collect();

            tx.execute(&stmt, &refs)
                .await
                .map_err(|e| insert_error(table, idx, e))?;
            inserted += 1;
        }

        tx.commit()
            .await
            .with_context(|| format!("Failed to commit insert into '{}'", table))?;
        Ok(inserted)
    }
}

/// Run a query, reading columns without a native mapping through `::text`
async fn read_query<C: GenericClient>(client: &C, sql: &str) -> Result<TabularBuffer> {
    let prepared = client.prepare(sql).await?;
    let columns: Vec<String> = prepared
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();
    let original: Vec<Type> = prepared.columns().iter().map(|c| c.type_().clone()).collect();

    let stmt = if original.iter().all(|ty| native(ty).is_some()) {
        prepared
    } else {
        let select: Vec<String> = columns
            .iter()
            .zip(&original)
            .map(|(name, ty)| {
                let quoted = quote_column(name, QUOTE);
                match native(ty) {
                    Some(_) => quoted,
                    None => format!("{}::text", quoted),
                }
            })
            .collect();
        client
            .prepare(&format!(
                "SELECT {} FROM ({}) AS snapshot",
                select.join(", "),
                sql
            ))
            .await?
    };

    let rows = client.query(&stmt, &[]).await?;
    let mut buffer = TabularBuffer::new(columns);
    for row in &rows {
        let values = original
            .iter()
            .enumerate()
            .map(|(idx, ty)| decode(row, idx, ty))
            .collect::<Result<Vec<_>>>()?;
        buffer.push_row(values)?;
    }

    Ok(buffer)
}

fn decode(row: &Row, idx: usize, original: &Type) -> Result<Value> {
    let value: Value = match native(original) {
        Some(Native::Bool) => row.try_get::<_, Option<bool>>(idx)?.into(),
        Some(Native::Int2) => row.try_get::<_, Option<i16>>(idx)?.map(i64::from).into(),
        Some(Native::Int4) => row.try_get::<_, Option<i32>>(idx)?.map(i64::from).into(),
        Some(Native::Int8) => row.try_get::<_, Option<i64>>(idx)?.into(),
        Some(Native::Oid) => row.try_get::<_, Option<u32>>(idx)?.map(i64::from).into(),
        Some(Native::Float4) => row.try_get::<_, Option<f32>>(idx)?.map(f64::from).into(),
        Some(Native::Float8) => row.try_get::<_, Option<f64>>(idx)?.into(),
        Some(Native::Text) => row.try_get::<_, Option<String>>(idx)?.into(),
        Some(Native::Bytea) => row
            .try_get::<_, Option<Vec<u8>>>(idx)?
            .map(Value::Bytes)
            .unwrap_or(Value::Null),
        Some(Native::Json) => row
            .try_get::<_, Option<serde_json::Value>>(idx)?
            .map(|json| Value::Text(json.to_string()))
            .unwrap_or(Value::Null),
        None => match row.try_get::<_, Option<String>>(idx)? {
            None => Value::Null,
            Some(text) if *original == Type::NUMERIC => Value::parse_numeric(&text),
            Some(text) => Value::Text(text),
        },
    };
    Ok(value)
}

#[derive(Debug, Clone, Copy)]
enum Bind {
    Native(Native),
    /// Bound as text and cast back on the server
    Text,
}

async fn prepare_insert<C: GenericClient>(
    client: &C,
    table: &str,
    columns: &[String],
) -> Result<(Statement, Vec<Bind>)> {
    let target = quote_ident(table, QUOTE);
    if columns.is_empty() {
        let stmt = client
            .prepare(&format!("INSERT INTO {} DEFAULT VALUES", target))
            .await?;
        return Ok((stmt, Vec::new()));
    }

    let names: Vec<String> = columns.iter().map(|c| quote_column(c, QUOTE)).collect();
    let plain: Vec<String> = (1..=columns.len()).map(|i| format!("${}", i)).collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        target,
        names.join(", "),
        plain.join(", ")
    );
    let stmt = client
        .prepare(&sql)
        .await
        .with_context(|| format!("Failed to prepare insert into '{}'", table))?;

    let types: Vec<Type> = stmt.params().to_vec();
    if types.iter().all(|ty| native(ty).is_some()) {
        let binds = types
            .iter()
            .filter_map(native)
            .map(Bind::Native)
            .collect();
        return Ok((stmt, binds));
    }

    let mut binds = Vec::with_capacity(types.len());
    let mut placeholders = Vec::with_capacity(types.len());
    for (idx, ty) in types.iter().enumerate() {
        match native(ty) {
            Some(n) => {
                binds.push(Bind::Native(n));
                placeholders.push(format!("${}", idx + 1));
            }
            None => {
                binds.push(Bind::Text);
                placeholders.push(format!(
                    "${}::text::{}.{}",
                    idx + 1,
                    quote_column(ty.schema(), QUOTE),
                    quote_column(ty.name(), QUOTE)
                ));
            }
        }
    }

    let cast_sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        target,
        names.join(", "),
        placeholders.join(", ")
    );
    let stmt = client
        .prepare(&cast_sql)
        .await
        .with_context(|| format!("Failed to prepare insert into '{}'", table))?;
    Ok((stmt, binds))
}

fn convert<T>(value: &Value, expected: &str, f: impl Fn(&Value) -> Option<T>) -> Result<Option<T>> {
    if value.is_null() {
        return Ok(None);
    }
    f(value)
        .map(Some)
        .ok_or_else(|| anyhow!("cannot bind '{}' as {}", value, expected))
}

fn to_json(value: &Value) -> Option<serde_json::Value> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(serde_json::Value::Bool(*b)),
        Value::Int(i) => Some(serde_json::Value::from(*i)),
        Value::Float(f) => Some(serde_json::Value::from(*f)),
        Value::Text(s) => Some(
            serde_json::from_str(s).unwrap_or_else(|_| serde_json::Value::String(s.clone())),
        ),
        Value::Bytes(_) => value.to_text().map(serde_json::Value::String),
    }
}

fn to_param(value: &Value, bind: Bind) -> Result<Box<dyn ToSql + Sync>> {
    let param: Box<dyn ToSql + Sync> = match bind {
        Bind::Native(Native::Bool) => Box::new(convert(value, "boolean", Value::as_bool)?),
        Bind::Native(Native::Int2) => Box::new(convert(value, "smallint", |v| {
            v.as_i64().and_then(|i| i16::try_from(i).ok())
        })?),
        Bind::Native(Native::Int4) => Box::new(convert(value, "integer", |v| {
            v.as_i64().and_then(|i| i32::try_from(i).ok())
        })?),
        Bind::Native(Native::Int8) => Box::new(convert(value, "bigint", Value::as_i64)?),
        Bind::Native(Native::Oid) => Box::new(convert(value, "oid", |v| {
            v.as_i64().and_then(|i| u32::try_from(i).ok())
        })?),
        Bind::Native(Native::Float4) => {
            Box::new(convert(value, "real", |v| v.as_f64().map(|f| f as f32))?)
        }
        Bind::Native(Native::Float8) => Box::new(convert(value, "double precision", Value::as_f64)?),
        Bind::Native(Native::Bytea) => Box::new(convert(value, "bytea", Value::as_bytes)?),
        Bind::Native(Native::Json) => Box::new(to_json(value)),
        Bind::Native(Native::Text) | Bind::Text => Box::new(value.to_text()),
    };
    Ok(param)
}

fn insert_error(table: &str, row: usize, err: tokio_postgres::Error) -> anyhow::Error {
    let integrity = err
        .code()
        .map(|state| state.code().starts_with("23"))
        .unwrap_or(false);

    if integrity {
        MoverError::integrity(table, format!("row {}: {}", row, err)).into()
    } else {
        anyhow::Error::from(err).context(format!("Failed to insert row {} into '{}'", row, table))
    }
}

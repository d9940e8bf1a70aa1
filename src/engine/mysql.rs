// ABOUTME: MySQL/MariaDB backend over mysql_async
// ABOUTME: Reads through the binary protocol and inserts rows inside one transaction per table

use crate::error::MoverError;
use crate::table::{TabularBuffer, Value};
use crate::utils::{quote_column, quote_ident};
use anyhow::{Context, Result};
use mysql_async::consts::ColumnType;
use mysql_async::prelude::*;
use mysql_async::{Column, Conn, OptsBuilder, TxOpts};

const QUOTE: char = '`';

/// Character set id MySQL reports for binary strings and blobs
const BINARY_CHARSET: u16 = 63;

/// Server error codes raised by constraint violations
const INTEGRITY_CODES: &[u16] = &[
    1048, // column cannot be null
    1062, // duplicate entry
    1451, // cannot delete or update a parent row
    1452, // cannot add or update a child row
    1557, // foreign key duplicate
    1586, // duplicate entry for unique key
    3819, // check constraint violated
];

pub struct MysqlEngine {
    conn: Conn,
}

pub struct MysqlParams<'a> {
    pub host: &'a str,
    pub port: u16,
    pub username: &'a str,
    pub password: Option<&'a str>,
    pub database: &'a str,
}

impl MysqlEngine {
    pub async fn connect(params: &MysqlParams<'_>) -> Result<Self> {
        let opts = OptsBuilder::default()
            .ip_or_hostname(params.host)
            .tcp_port(params.port)
            .db_name(Some(params.database))
            .user(Some(params.username))
            .pass(params.password)
            // utf8mb4 for full Unicode support
            .init(vec!["SET NAMES utf8mb4"]);

        let mut conn = Conn::new(opts).await.with_context(|| {
            format!(
                "Failed to connect to MySQL at {}:{}/{}",
                params.host, params.port, params.database
            )
        })?;
        conn.query_drop("SELECT 1")
            .await
            .context("MySQL connection test failed")?;

        Ok(Self { conn })
    }

    pub async fn read_table(&mut self, table: &str) -> Result<TabularBuffer> {
        let sql = format!("SELECT * FROM {}", quote_ident(table, QUOTE));
        self.read_query(&sql)
            .await
            .with_context(|| format!("Failed to read table '{}'", table))
    }

    pub async fn read_column(&mut self, table: &str, column: &str) -> Result<Vec<Value>> {
        let sql = format!(
            "SELECT {} FROM {}",
            quote_column(column, QUOTE),
            quote_ident(table, QUOTE)
        );
        let buffer = self
            .read_query(&sql)
            .await
            .with_context(|| format!("Failed to read {}.{}", table, column))?;
        Ok(buffer.rows().iter().map(|row| row[0].clone()).collect())
    }

    pub async fn table_exists(&mut self, table: &str) -> Result<bool> {
        let (schema, name) = match table.split_once('.') {
            Some((schema, name)) => (Some(schema.to_string()), name.to_string()),
            None => (None, table.to_string()),
        };
        let count: Option<i64> = self
            .conn
            .exec_first(
                "SELECT COUNT(*) FROM information_schema.tables \
                 WHERE table_schema = COALESCE(?, DATABASE()) AND table_name = ?",
                (schema, name),
            )
            .await
            .with_context(|| format!("Failed to look up table '{}'", table))?;
        Ok(count.unwrap_or(0) > 0)
    }

    async fn read_query(&mut self, sql: &str) -> Result<TabularBuffer> {
        let mut result = self.conn.exec_iter(sql, ()).await?;
        let columns: Vec<Column> = result.columns_ref().to_vec();
        let rows: Vec<mysql_async::Row> = result.collect().await?;
        drop(result);

        let names = columns
            .iter()
            .map(|c| c.name_str().into_owned())
            .collect();
        let mut buffer = TabularBuffer::new(names);
        for row in &rows {
            let values = columns
                .iter()
                .enumerate()
                .map(|(idx, column)| match row.as_ref(idx) {
                    Some(value) => from_mysql(value, column),
                    None => Value::Null,
                })
                .collect();
            buffer.push_row(values)?;
        }

        Ok(buffer)
    }

    /// Insert every row in a single transaction; nothing is kept on failure
    pub async fn insert_rows(&mut self, table: &str, rows: &TabularBuffer) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let names: Vec<String> = rows
            .columns()
            .iter()
            .map(|c| quote_column(c, QUOTE))
            .collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table, QUOTE),
            names.join(", "),
            vec!["?"; names.len()].join(", ")
        );

        let mut tx = self
            .conn
            .start_transaction(TxOpts::default())
            .await
            .context("Failed to start transaction")?;

        let mut inserted = 0u64;
        for (idx, row) in rows.rows().iter().enumerate() {
            let params: Vec<mysql_async::Value> = row.iter().map(to_mysql).collect();
            tx.exec_drop(&sql, params)
                .await
                .map_err(|e| insert_error(table, idx, e))?;
            inserted += 1;
        }

        tx.commit()
            .await
            .with_context(|| format!("Failed to commit insert into '{}'", table))?;
        Ok(inserted)
    }

    pub async fn close(self) -> Result<()> {
        self.conn
            .disconnect()
            .await
            .context("Failed to disconnect from MySQL")
    }
}

fn from_mysql(value: &mysql_async::Value, column: &Column) -> Value {
    use mysql_async::Value as My;

    match value {
        My::NULL => Value::Null,
        My::Int(i) => Value::Int(*i),
        My::UInt(u) => i64::try_from(*u)
            .map(Value::Int)
            .unwrap_or(Value::Float(*u as f64)),
        My::Float(f) => Value::Float(f64::from(*f)),
        My::Double(f) => Value::Float(*f),
        My::Bytes(bytes) => {
            let ty = column.column_type();
            if matches!(
                ty,
                ColumnType::MYSQL_TYPE_DECIMAL | ColumnType::MYSQL_TYPE_NEWDECIMAL
            ) {
                return Value::parse_numeric(&String::from_utf8_lossy(bytes));
            }
            if column.character_set() == BINARY_CHARSET && ty != ColumnType::MYSQL_TYPE_JSON {
                return Value::Bytes(bytes.clone());
            }
            match String::from_utf8(bytes.clone()) {
                Ok(text) => Value::Text(text),
                Err(e) => Value::Bytes(e.into_bytes()),
            }
        }
        My::Date(year, month, day, hour, minute, second, micros) => {
            let date = format!("{:04}-{:02}-{:02}", year, month, day);
            if column.column_type() == ColumnType::MYSQL_TYPE_DATE {
                Value::Text(date)
            } else {
                Value::Text(format!(
                    "{} {:02}:{:02}:{:02}{}",
                    date,
                    hour,
                    minute,
                    second,
                    fraction(*micros)
                ))
            }
        }
        My::Time(negative, days, hours, minutes, seconds, micros) => Value::Text(format!(
            "{}{:02}:{:02}:{:02}{}",
            if *negative { "-" } else { "" },
            u64::from(*days) * 24 + u64::from(*hours),
            minutes,
            seconds,
            fraction(*micros)
        )),
    }
}

fn fraction(micros: u32) -> String {
    if micros == 0 {
        String::new()
    } else {
        format!(".{:06}", micros)
    }
}

fn to_mysql(value: &Value) -> mysql_async::Value {
    use mysql_async::Value as My;

    match value {
        Value::Null => My::NULL,
        Value::Bool(b) => My::Int(i64::from(*b)),
        Value::Int(i) => My::Int(*i),
        Value::Float(f) => My::Double(*f),
        Value::Text(s) => My::Bytes(s.as_bytes().to_vec()),
        Value::Bytes(b) => My::Bytes(b.clone()),
    }
}

fn insert_error(table: &str, row: usize, err: mysql_async::Error) -> anyhow::Error {
    let integrity = matches!(
        &err,
        mysql_async::Error::Server(server) if INTEGRITY_CODES.contains(&server.code)
    );

    if integrity {
        MoverError::integrity(table, format!("row {}: {}", row, err)).into()
    } else {
        anyhow::Error::from(err).context(format!("Failed to insert row {} into '{}'", row, table))
    }
}

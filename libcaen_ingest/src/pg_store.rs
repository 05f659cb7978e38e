use sqlx::postgres::{PgConnection, Postgres};
use sqlx::{Connection, QueryBuilder};
use time::UtcOffset;
use tokio::runtime::{Builder, Runtime};

use super::error::StoreError;
use super::event::AbsoluteEvent;
use super::sink::EventStore;

/// Postgres accepts at most 65535 bind parameters per statement; each row binds 3
const MAX_ROWS_PER_STATEMENT: usize = 21_845;

/// SQLSTATE classes that mean the server cannot take work right now, rather than that it
/// refused this particular write: connection exception, insufficient resources, operator
/// intervention
const TRANSIENT_SQLSTATE_CLASSES: [&str; 3] = ["08", "53", "57"];

fn store_error(error: sqlx::Error) -> StoreError {
    match error {
        sqlx::Error::Database(db) => {
            let transient = db
                .code()
                .is_some_and(|code| TRANSIENT_SQLSTATE_CLASSES.iter().any(|c| code.starts_with(c)));
            if transient {
                StoreError::Unavailable(db.to_string())
            } else {
                StoreError::Rejected(db.to_string())
            }
        }
        other => StoreError::Unavailable(other.to_string()),
    }
}

/// Table names are interpolated into the statement, so only plain identifiers are allowed
pub fn is_valid_table_name(table: &str) -> bool {
    let mut chars = table.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A PostgreSQL (TimescaleDB) event store.
///
/// Holds one long-lived connection, driven by a private single-threaded tokio runtime so
/// the rest of the pipeline stays synchronous. Rows go to `(time, channels, ps)` where
/// `time` is the microsecond rendering at the site offset, `channels` is
/// `[discriminant, energy]` and `ps` is the exact sub-second remainder.
pub struct PgStore {
    url: String,
    offset: UtcOffset,
    runtime: Runtime,
    connection: Option<PgConnection>,
}

impl PgStore {
    pub fn new(url: &str, offset: UtcOffset) -> Result<Self, StoreError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| StoreError::Unavailable(format!("could not start runtime: {e}")))?;
        Ok(Self {
            url: url.to_string(),
            offset,
            runtime,
            connection: None,
        })
    }
}

impl EventStore for PgStore {
    fn connect(&mut self) -> Result<(), StoreError> {
        if let Some(old) = self.connection.take() {
            let _ = self.runtime.block_on(old.close());
        }
        let connection = self
            .runtime
            .block_on(PgConnection::connect(&self.url))
            .map_err(store_error)?;
        spdlog::info!("Connected to the event store");
        self.connection = Some(connection);
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        match self.connection.as_mut() {
            Some(connection) => self.runtime.block_on(connection.ping()).is_ok(),
            None => false,
        }
    }

    /// All rows are written in one transaction, so a failed batch leaves nothing behind
    fn insert_events(&mut self, table: &str, rows: &[AbsoluteEvent]) -> Result<(), StoreError> {
        if !is_valid_table_name(table) {
            return Err(StoreError::Rejected(format!(
                "{table:?} is not a valid table name"
            )));
        }
        let Some(connection) = self.connection.as_mut() else {
            return Err(StoreError::Unavailable(String::from("not connected")));
        };
        let offset = self.offset;
        let statement = format!("INSERT INTO {table} (time, channels, ps) ");

        let result = self.runtime.block_on(async {
            let mut tx = connection.begin().await?;
            for part in rows.chunks(MAX_ROWS_PER_STATEMENT) {
                let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(statement.as_str());
                builder.push_values(part, |mut row, event| {
                    row.push_bind(event.time.to_primitive(offset))
                        .push_bind(event.channels().to_vec())
                        .push_bind(event.time.subsecond_ps);
                });
                builder.build().execute(&mut *tx).await?;
            }
            tx.commit().await?;
            Ok::<(), sqlx::Error>(())
        });
        result.map_err(store_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_names() {
        assert!(is_valid_table_name("caen8ch_ch0"));
        assert!(is_valid_table_name("caen8ch_neutrons_caen3_timestamps"));
        assert!(!is_valid_table_name("8ch"));
        assert!(!is_valid_table_name("ch0; DROP TABLE x"));
        assert!(!is_valid_table_name(""));
    }

    #[test]
    fn test_insert_without_connection_is_transient() {
        let mut store = PgStore::new("postgres://localhost/none", UtcOffset::UTC).unwrap();
        assert!(!store.is_alive());
        assert!(matches!(
            store.insert_events("caen8ch_ch0", &[]),
            Err(StoreError::Unavailable(_))
        ));
    }
}

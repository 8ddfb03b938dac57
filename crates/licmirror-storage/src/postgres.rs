use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use licmirror_core::{
    FetchedDocument, MirrorQuery, MirrorRecord, PagedResult, Predicate, SortKey, SortSpec,
    SourceKind,
};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::{debug, instrument};

use crate::{
    like_pattern, AuditEntry, AuditLog, AuditQuery, DatabaseConfig, MirrorStore, NewAuditEntry,
    StoreError,
};

/// Rows per multi-row INSERT; keeps bind parameters well under the protocol limit.
const INSERT_CHUNK: usize = 1_000;

const RECORD_COLUMNS: &str = "id, external_key, data, updated_at";

/// Serialises writers of one mirror table; plain reads are not blocked.
async fn lock_for_write(
    tx: &mut Transaction<'static, Postgres>,
    source: SourceKind,
) -> Result<(), StoreError> {
    sqlx::query(&format!(
        "LOCK TABLE {} IN SHARE ROW EXCLUSIVE MODE",
        source.table_name()
    ))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn connect_pool(config: &DatabaseConfig) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect(&config.url)
        .await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PgMirrorStore {
    pool: PgPool,
}

impl PgMirrorStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn read_snapshot(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }
}

fn record_from_row(row: &PgRow) -> Result<MirrorRecord, sqlx::Error> {
    Ok(MirrorRecord {
        id: row.try_get("id")?,
        external_key: row.try_get("external_key")?,
        document: row.try_get::<JsonValue, _>("data")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Appends `predicate` as a boolean SQL expression over the `data` column.
pub(crate) fn push_predicate(qb: &mut QueryBuilder<'_, Postgres>, predicate: &Predicate) {
    match predicate {
        Predicate::True => {
            qb.push("TRUE");
        }
        Predicate::All(parts) | Predicate::Any(parts) if parts.is_empty() => {
            qb.push(if matches!(predicate, Predicate::All(_)) {
                "TRUE"
            } else {
                "FALSE"
            });
        }
        Predicate::All(parts) | Predicate::Any(parts) => {
            let joiner = if matches!(predicate, Predicate::All(_)) {
                " AND "
            } else {
                " OR "
            };
            qb.push("(");
            for (idx, part) in parts.iter().enumerate() {
                if idx > 0 {
                    qb.push(joiner);
                }
                push_predicate(qb, part);
            }
            qb.push(")");
        }
        Predicate::ContainsCi { path, needle } => {
            qb.push("(data #>> ");
            qb.push_bind(path.segments().to_vec());
            qb.push("::text[]) ILIKE ");
            qb.push_bind(like_pattern(needle));
        }
        Predicate::Equals { path, value } => {
            qb.push("(data #>> ");
            qb.push_bind(path.segments().to_vec());
            qb.push("::text[]) = ");
            qb.push_bind(value.clone());
        }
        Predicate::Flag { path, expected } => {
            qb.push("COALESCE(LOWER(TRIM(data #>> ");
            qb.push_bind(path.segments().to_vec());
            qb.push("::text[])) IN ('true', '1'), FALSE) = ");
            qb.push_bind(*expected);
        }
    }
}

/// Matches the text `licmirror_core::numeric_text` accepts.
const NUMERIC_TEXT: &str = r"^-?[0-9]+(\.[0-9]+)?$";

pub(crate) fn push_order_by(qb: &mut QueryBuilder<'_, Postgres>, sort: &SortSpec) {
    let direction = sort.direction.as_sql();
    match &sort.key {
        SortKey::UpdatedAt => {
            qb.push(format!(" ORDER BY updated_at {direction}, id {direction}"));
        }
        SortKey::Path(path) => {
            let segments = path.segments().to_vec();
            qb.push(" ORDER BY (CASE WHEN (data #>> ");
            qb.push_bind(segments.clone());
            qb.push(format!("::text[]) ~ '{NUMERIC_TEXT}' THEN (data #>> "));
            qb.push_bind(segments.clone());
            qb.push(format!("::text[])::numeric END) {direction} NULLS LAST, (data #>> "));
            qb.push_bind(segments);
            qb.push(format!("::text[]) {direction} NULLS LAST, id {direction}"));
        }
    }
}

#[async_trait]
impl MirrorStore for PgMirrorStore {
    #[instrument(skip(self, documents), fields(source = %source, count = documents.len()))]
    async fn replace_all(
        &self,
        source: SourceKind,
        documents: Vec<FetchedDocument>,
    ) -> Result<u64, StoreError> {
        let table = source.table_name();
        let mut tx = self.pool.begin().await?;
        lock_for_write(&mut tx, source).await?;

        let removed = sqlx::query(&format!("DELETE FROM {table}"))
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let mut written = 0_u64;
        for chunk in documents.chunks(INSERT_CHUNK) {
            let mut qb = QueryBuilder::<Postgres>::new(format!(
                "INSERT INTO {table} (external_key, data) "
            ));
            qb.push_values(chunk, |mut row, doc| {
                row.push_bind(doc.external_key.clone())
                    .push_bind(doc.document.clone());
            });
            written += qb.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        debug!(removed, written, "replaced mirror table");
        Ok(written)
    }

    #[instrument(skip(self, documents), fields(source = %source, count = documents.len()))]
    async fn upsert_by_key(
        &self,
        source: SourceKind,
        documents: Vec<FetchedDocument>,
    ) -> Result<u64, StoreError> {
        let table = source.table_name();

        // ON CONFLICT cannot touch the same key twice in one statement.
        let mut position: HashMap<String, usize> = HashMap::new();
        let mut unique: Vec<(String, JsonValue)> = Vec::new();
        for doc in documents {
            let key = doc
                .external_key
                .ok_or(StoreError::MissingExternalKey(source))?;
            match position.get(&key) {
                Some(&idx) => unique[idx].1 = doc.document,
                None => {
                    position.insert(key.clone(), unique.len());
                    unique.push((key, doc.document));
                }
            }
        }

        let mut tx = self.pool.begin().await?;
        lock_for_write(&mut tx, source).await?;
        let mut written = 0_u64;
        for chunk in unique.chunks(INSERT_CHUNK) {
            let mut qb = QueryBuilder::<Postgres>::new(format!(
                "INSERT INTO {table} AS mirror (external_key, data) "
            ));
            qb.push_values(chunk, |mut row, (key, document)| {
                row.push_bind(key.clone()).push_bind(document.clone());
            });
            qb.push(
                " ON CONFLICT (external_key) DO UPDATE \
                 SET data = mirror.data || EXCLUDED.data, updated_at = now()",
            );
            written += qb.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }

    #[instrument(skip(self), fields(source = %source))]
    async fn delete_by_key(
        &self,
        source: SourceKind,
        external_key: &str,
    ) -> Result<u64, StoreError> {
        let sql = format!("DELETE FROM {} WHERE external_key = $1", source.table_name());
        let result = sqlx::query(&sql)
            .bind(external_key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, query), fields(source = %source, page = query.page.page, limit = query.page.limit))]
    async fn query_page(
        &self,
        source: SourceKind,
        query: &MirrorQuery,
    ) -> Result<PagedResult<MirrorRecord>, StoreError> {
        let table = source.table_name();
        let mut tx = self.read_snapshot().await?;

        let mut count_qb =
            QueryBuilder::<Postgres>::new(format!("SELECT COUNT(*) FROM {table} WHERE "));
        push_predicate(&mut count_qb, &query.predicate);
        let total: i64 = count_qb
            .build_query_scalar()
            .fetch_one(&mut *tx)
            .await?;

        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {RECORD_COLUMNS} FROM {table} WHERE "
        ));
        push_predicate(&mut qb, &query.predicate);
        push_order_by(&mut qb, &query.sort);
        qb.push(" LIMIT ")
            .push_bind(i64::from(query.page.limit))
            .push(" OFFSET ")
            .push_bind(query.page.offset() as i64);
        let rows = qb.build().fetch_all(&mut *tx).await?;
        tx.commit().await?;

        let items = rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PagedResult {
            page: query.page.page,
            limit: query.page.limit,
            total: total.max(0) as u64,
            items,
        })
    }

    async fn select_all(
        &self,
        source: SourceKind,
        predicate: &Predicate,
        sort: &SortSpec,
    ) -> Result<Vec<MirrorRecord>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {RECORD_COLUMNS} FROM {} WHERE ",
            source.table_name()
        ));
        push_predicate(&mut qb, predicate);
        push_order_by(&mut qb, sort);
        let rows = qb.build().fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn count(&self, source: SourceKind, predicate: &Predicate) -> Result<u64, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT COUNT(*) FROM {} WHERE ",
            source.table_name()
        ));
        push_predicate(&mut qb, predicate);
        let total: i64 = qb.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(total.max(0) as u64)
    }
}

#[derive(Debug, Clone)]
pub struct PgAuditLog {
    pool: PgPool,
}

impl PgAuditLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn push_audit_filters(qb: &mut QueryBuilder<'_, Postgres>, query: &AuditQuery) {
    qb.push(" WHERE TRUE");
    if let Some(level) = &query.level {
        qb.push(" AND LOWER(level) = LOWER(")
            .push_bind(level.clone())
            .push(")");
    }
    if let Some(search) = &query.search {
        qb.push(" AND message ILIKE ").push_bind(like_pattern(search));
    }
}

#[async_trait]
impl AuditLog for PgAuditLog {
    async fn append(&self, entry: NewAuditEntry) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO logs (level, message, path, method, ip_address, data) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(entry.level.as_str())
        .bind(&entry.message)
        .bind(&entry.path)
        .bind(&entry.method)
        .bind(&entry.ip_address)
        .bind(&entry.data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list(&self, query: &AuditQuery) -> Result<PagedResult<AuditEntry>, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;

        let mut count_qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM logs");
        push_audit_filters(&mut count_qb, query);
        let total: i64 = count_qb.build_query_scalar().fetch_one(&mut *tx).await?;

        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT id, level, message, path, method, ip_address, data, created_at FROM logs",
        );
        push_audit_filters(&mut qb, query);
        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(i64::from(query.page.limit))
            .push(" OFFSET ")
            .push_bind(query.page.offset() as i64);
        let rows = qb.build().fetch_all(&mut *tx).await?;
        tx.commit().await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            items.push(AuditEntry {
                id: row.try_get("id")?,
                level: row.try_get("level")?,
                message: row.try_get("message")?,
                path: row.try_get("path")?,
                method: row.try_get("method")?,
                ip_address: row.try_get("ip_address")?,
                data: row.try_get("data")?,
                created_at: row.try_get("created_at")?,
            });
        }
        Ok(PagedResult {
            page: query.page.page,
            limit: query.page.limit,
            total: total.max(0) as u64,
            items,
        })
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM logs WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use licmirror_core::{JsonPath, SortDirection};

    #[test]
    fn predicate_sql_binds_paths_and_patterns() {
        let predicate = Predicate::and(vec![
            Predicate::Any(vec![
                Predicate::ContainsCi {
                    path: JsonPath::parse("org"),
                    needle: "alpha".into(),
                },
                Predicate::ContainsCi {
                    path: JsonPath::parse("bin"),
                    needle: "alpha".into(),
                },
            ]),
            Predicate::Flag {
                path: JsonPath::parse("isActive"),
                expected: true,
            },
        ]);

        let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM tinda_users WHERE ");
        push_predicate(&mut qb, &predicate);
        assert_eq!(
            qb.sql(),
            "SELECT COUNT(*) FROM tinda_users WHERE (((data #>> $1::text[]) ILIKE $2 OR \
             (data #>> $3::text[]) ILIKE $4) AND \
             COALESCE(LOWER(TRIM(data #>> $5::text[])) IN ('true', '1'), FALSE) = $6)"
        );
    }

    #[test]
    fn trivial_predicate_and_path_sort() {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT id FROM tsd_users WHERE ");
        push_predicate(&mut qb, &Predicate::True);
        push_order_by(
            &mut qb,
            &SortSpec::by_path("expireDate", SortDirection::Asc),
        );
        assert_eq!(
            qb.sql(),
            "SELECT id FROM tsd_users WHERE TRUE ORDER BY \
             (CASE WHEN (data #>> $1::text[]) ~ '^-?[0-9]+(\\.[0-9]+)?$' \
             THEN (data #>> $2::text[])::numeric END) ASC NULLS LAST, \
             (data #>> $3::text[]) ASC NULLS LAST, id ASC"
        );

        let mut qb = QueryBuilder::<Postgres>::new("SELECT id FROM t WHERE ");
        push_predicate(&mut qb, &Predicate::Any(vec![]));
        push_order_by(&mut qb, &SortSpec::updated_at_desc());
        assert_eq!(
            qb.sql(),
            "SELECT id FROM t WHERE FALSE ORDER BY updated_at DESC, id DESC"
        );
    }

    #[test]
    fn audit_filters_are_optional() {
        let query = AuditQuery {
            page: licmirror_core::PageRequest::new(1, 20, 200).unwrap(),
            level: Some("ERROR".into()),
            search: None,
        };
        let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM logs");
        push_audit_filters(&mut qb, &query);
        assert_eq!(
            qb.sql(),
            "SELECT COUNT(*) FROM logs WHERE TRUE AND LOWER(level) = LOWER($1)"
        );
    }
}

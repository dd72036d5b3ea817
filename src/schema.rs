use anyhow::{ensure, Result};
use sqlx::PgPool;
use std::collections::HashSet;

/// Postgres truncates identifiers beyond NAMEDATALEN - 1.
const MAX_IDENTIFIER_LEN: usize = 63;

/// Columns managed by fixed statements; attribute writes must not shadow them.
const RESERVED: &[&str] = &["swd_imei", "imei", "lastupdated", "firstseen"];

/// Attribute names double as column identifiers, so only a conservative
/// shape is ever interpolated into SQL. Values always go through binds.
pub fn is_safe_identifier(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_IDENTIFIER_LEN {
        return false;
    }
    if RESERVED.contains(&name) {
        return false;
    }
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !(first.is_ascii_lowercase() || first == '_') {
        return false;
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Known attribute columns on the state table. Consulted before writes so the
/// store is not probed per message; the store's own undefined-column signal
/// remains the ground truth when the cache is wrong.
pub struct SchemaCache {
    known: HashSet<String>,
}

impl SchemaCache {
    pub async fn load(pool: &PgPool) -> Result<Self> {
        let columns: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT column_name
            FROM information_schema.columns
            WHERE table_schema = current_schema()
              AND table_name = 'things'
            "#,
        )
        .fetch_all(pool)
        .await?;
        Ok(Self {
            known: columns.into_iter().collect(),
        })
    }

    pub fn contains(&self, attribute: &str) -> bool {
        self.known.contains(attribute)
    }

    /// Widen the state table unless the cache already knows the column.
    pub async fn ensure_column(&mut self, pool: &PgPool, attribute: &str) -> Result<()> {
        if self.known.contains(attribute) {
            return Ok(());
        }
        self.create_column(pool, attribute).await
    }

    /// Unconditional DDL, used when the store reports a column the cache
    /// believed in is actually missing. `IF NOT EXISTS` keeps duplicate
    /// creation attempts idempotent, and the statement commits on its own so
    /// a later retry always sees the column.
    pub async fn create_column(&mut self, pool: &PgPool, attribute: &str) -> Result<()> {
        ensure!(
            is_safe_identifier(attribute),
            "refusing to create column for attribute {attribute:?}"
        );
        sqlx::query(&format!(
            "ALTER TABLE things ADD COLUMN IF NOT EXISTS {attribute} TEXT"
        ))
        .execute(pool)
        .await?;
        tracing::info!(column = %attribute, "created state table column");
        self.known.insert(attribute.to_string());
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn mark_known(&mut self, attribute: &str) {
        self.known.insert(attribute.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::is_safe_identifier;

    #[test]
    fn accepts_plain_attribute_names() {
        assert!(is_safe_identifier("battlevel"));
        assert!(is_safe_identifier("swd_pingrsp"));
        assert!(is_safe_identifier("_private"));
        assert!(is_safe_identifier("temp2"));
    }

    #[test]
    fn rejects_unsafe_names() {
        assert!(!is_safe_identifier(""));
        assert!(!is_safe_identifier("2fast"));
        assert!(!is_safe_identifier("Temp"));
        assert!(!is_safe_identifier("batt-level"));
        assert!(!is_safe_identifier("batt level"));
        assert!(!is_safe_identifier("x; DROP TABLE things"));
        assert!(!is_safe_identifier("payload'"));
        assert!(!is_safe_identifier(&"a".repeat(64)));
    }

    #[test]
    fn rejects_reserved_columns() {
        assert!(!is_safe_identifier("imei"));
        assert!(!is_safe_identifier("swd_imei"));
        assert!(!is_safe_identifier("lastupdated"));
        assert!(!is_safe_identifier("firstseen"));
    }
}

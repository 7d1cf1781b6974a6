//! SQL backend for the XDB facade.
//!
//! Storage maps `(owner JID, namespace)` to an ordered list of XML
//! fragments. Namespaces with configured query templates get their own
//! tables and native delete-then-insert handling; everything else lands in
//! a generic fragments table.
//!
//! Templates are SQL strings with `{placeholder}` substitution:
//!
//! - `{$owner}`: the owner's bare JID,
//! - `{$xml}`: the serialized fragment,
//! - `{$value}`: the match value on delete templates,
//! - `{@attr}` or any XPath-subset expression, evaluated against the
//!   fragment being stored.
//!
//! Substituted values are SQL-escaped (`'`, `"`, `\`).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use rookery_bus::{MatchSpec, XdbBackend, XdbError};
use rookery_jid::Jid;
use rookery_xml::xpath::{self, NsMap};
use rookery_xml::{parse_document, Element, StreamKind};

/// The query templates for one namespace.
#[derive(Debug, Clone)]
pub struct QuerySet {
    /// SELECT returning one `xml` column, one row per fragment, in order.
    pub get: String,
    /// DELETE of every row for the owner (the first half of a put).
    pub clear: String,
    /// INSERT of one fragment row.
    pub insert: String,
    /// Native delete for insert-with-match: the attribute name the match
    /// must use, and the DELETE template taking `{$value}`.
    pub delete_by: Option<(String, String)>,
}

/// Built-in templates for the namespaces the session manager uses.
pub fn default_templates() -> HashMap<String, QuerySet> {
    let mut map = HashMap::new();
    map.insert(
        "jabber:iq:roster".to_string(),
        QuerySet {
            get: "SELECT xml FROM roster WHERE owner = '{$owner}' ORDER BY rowid".into(),
            clear: "DELETE FROM roster WHERE owner = '{$owner}'".into(),
            insert: "INSERT INTO roster (owner, jid, xml) \
                     VALUES ('{$owner}', '{@jid}', '{$xml}')"
                .into(),
            delete_by: Some((
                "jid".to_string(),
                "DELETE FROM roster WHERE owner = '{$owner}' AND jid = '{$value}'".into(),
            )),
        },
    );
    map.insert(
        "jabber:x:offline".to_string(),
        QuerySet {
            get: "SELECT xml FROM offline WHERE owner = '{$owner}' ORDER BY rowid".into(),
            clear: "DELETE FROM offline WHERE owner = '{$owner}'".into(),
            insert: "INSERT INTO offline (owner, node, xml) \
                     VALUES ('{$owner}', '{@node}', '{$xml}')"
                .into(),
            delete_by: Some((
                "node".to_string(),
                "DELETE FROM offline WHERE owner = '{$owner}' AND node = '{$value}'".into(),
            )),
        },
    );
    map.insert(
        "jabber:iq:privacy".to_string(),
        QuerySet {
            get: "SELECT xml FROM privacy WHERE owner = '{$owner}' ORDER BY rowid".into(),
            clear: "DELETE FROM privacy WHERE owner = '{$owner}'".into(),
            insert: "INSERT INTO privacy (owner, name, xml) \
                     VALUES ('{$owner}', '{@name}', '{$xml}')"
                .into(),
            delete_by: Some((
                "name".to_string(),
                "DELETE FROM privacy WHERE owner = '{$owner}' AND name = '{$value}'".into(),
            )),
        },
    );
    map
}

/// Escape a value for inclusion in a single-quoted SQL literal.
pub fn sql_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\'' => out.push_str("''"),
            '"' => out.push_str("\"\""),
            '\\' => out.push_str("\\\\"),
            other => out.push(other),
        }
    }
    out
}

/// The sqlite-backed XDB store.
pub struct SqlXdb {
    pool: SqlitePool,
    templates: HashMap<String, QuerySet>,
}

impl SqlXdb {
    /// Open (and create) the database, with the default templates.
    pub async fn open(url: &str) -> Result<Arc<Self>, XdbError> {
        Self::open_with(url, default_templates()).await
    }

    /// Open with explicit templates.
    pub async fn open_with(
        url: &str,
        templates: HashMap<String, QuerySet>,
    ) -> Result<Arc<Self>, XdbError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect(url)
            .await
            .map_err(|e| XdbError::Backend(e.to_string()))?;

        for ddl in [
            "CREATE TABLE IF NOT EXISTS fragments ( \
                owner TEXT NOT NULL, ns TEXT NOT NULL, xml TEXT NOT NULL )",
            "CREATE INDEX IF NOT EXISTS fragments_key ON fragments (owner, ns)",
            "CREATE TABLE IF NOT EXISTS roster ( \
                owner TEXT NOT NULL, jid TEXT, xml TEXT NOT NULL )",
            "CREATE TABLE IF NOT EXISTS offline ( \
                owner TEXT NOT NULL, node TEXT, xml TEXT NOT NULL )",
            "CREATE TABLE IF NOT EXISTS privacy ( \
                owner TEXT NOT NULL, name TEXT, xml TEXT NOT NULL )",
        ] {
            sqlx::query(ddl)
                .execute(&pool)
                .await
                .map_err(|e| XdbError::Backend(e.to_string()))?;
        }

        Ok(Arc::new(Self { pool, templates }))
    }

    /// Substitute the `{...}` placeholders of a template.
    fn expand(
        &self,
        template: &str,
        ns: &str,
        owner: &str,
        fragment: Option<&Element>,
        value: Option<&str>,
    ) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find('{') {
            out.push_str(&rest[..start]);
            let Some(end) = rest[start..].find('}') else {
                out.push_str(&rest[start..]);
                return out;
            };
            let expr = &rest[start + 1..start + end];
            rest = &rest[start + end + 1..];

            let substituted = match expr {
                "$owner" => owner.to_string(),
                "$xml" => fragment
                    .map(|f| f.to_wire(StreamKind::Server))
                    .unwrap_or_default(),
                "$value" => value.unwrap_or_default().to_string(),
                attr if attr.starts_with('@') => fragment
                    .and_then(|f| f.attr(&attr[1..]))
                    .unwrap_or_default()
                    .to_string(),
                path => fragment
                    .map(|f| {
                        let mut map = NsMap::new();
                        map.insert(String::new(), ns.to_string());
                        xpath::get_tags(f, path, &map)
                            .first()
                            .map(|m| m.value())
                            .unwrap_or_default()
                    })
                    .unwrap_or_default(),
            };
            out.push_str(&sql_escape(&substituted));
        }
        out.push_str(rest);
        out
    }

    async fn exec(&self, sql: &str) -> Result<(), XdbError> {
        debug!(sql = %sql, "xdb-sql exec");
        sqlx::query(sql)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| XdbError::Backend(e.to_string()))
    }

    async fn fetch_xml(&self, sql: &str) -> Result<Vec<String>, XdbError> {
        debug!(sql = %sql, "xdb-sql fetch");
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| XdbError::Backend(e.to_string()))?;
        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("xml")
                    .map_err(|e| XdbError::Backend(e.to_string()))
            })
            .collect()
    }

    fn parse_rows(rows: Vec<String>) -> Vec<Element> {
        rows.iter()
            .filter_map(|xml| match parse_document(xml) {
                Ok(el) => Some(el),
                Err(e) => {
                    warn!(error = %e, "unparseable stored fragment skipped");
                    None
                }
            })
            .collect()
    }
}

#[async_trait]
impl XdbBackend for SqlXdb {
    async fn get(&self, owner: &Jid, ns: &str) -> Result<Option<Vec<Element>>, XdbError> {
        let owner = owner.bare().to_string();
        let rows = match self.templates.get(ns) {
            Some(queries) => {
                let sql = self.expand(&queries.get, ns, &owner, None, None);
                self.fetch_xml(&sql).await?
            }
            None => {
                let rows = sqlx::query(
                    "SELECT xml FROM fragments WHERE owner = ? AND ns = ? ORDER BY rowid",
                )
                .bind(&owner)
                .bind(ns)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| XdbError::Backend(e.to_string()))?;
                rows.iter()
                    .map(|row| {
                        row.try_get::<String, _>("xml")
                            .map_err(|e| XdbError::Backend(e.to_string()))
                    })
                    .collect::<Result<Vec<_>, _>>()?
            }
        };

        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self::parse_rows(rows)))
    }

    async fn put(&self, owner: &Jid, ns: &str, children: &[Element]) -> Result<(), XdbError> {
        let owner = owner.bare().to_string();
        match self.templates.get(ns) {
            Some(queries) => {
                let clear = self.expand(&queries.clear, ns, &owner, None, None);
                self.exec(&clear).await?;
                for child in children {
                    let insert = self.expand(&queries.insert, ns, &owner, Some(child), None);
                    self.exec(&insert).await?;
                }
            }
            None => {
                sqlx::query("DELETE FROM fragments WHERE owner = ? AND ns = ?")
                    .bind(&owner)
                    .bind(ns)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| XdbError::Backend(e.to_string()))?;
                for child in children {
                    sqlx::query("INSERT INTO fragments (owner, ns, xml) VALUES (?, ?, ?)")
                        .bind(&owner)
                        .bind(ns)
                        .bind(child.to_wire(StreamKind::Server))
                        .execute(&self.pool)
                        .await
                        .map_err(|e| XdbError::Backend(e.to_string()))?;
                }
            }
        }
        Ok(())
    }

    async fn insert(
        &self,
        owner: &Jid,
        ns: &str,
        spec: &MatchSpec,
        content: &[Element],
    ) -> Result<(), XdbError> {
        let owner_str = owner.bare().to_string();

        // a native delete covers the common match shape; everything else
        // goes the read-modify-write route
        if let (Some(queries), MatchSpec::AttrEq { name, value }) =
            (self.templates.get(ns), spec)
        {
            if let Some((key, delete)) = &queries.delete_by {
                if key == name {
                    let sql = self.expand(delete, ns, &owner_str, None, Some(value));
                    self.exec(&sql).await?;
                    for child in content {
                        let insert =
                            self.expand(&queries.insert, ns, &owner_str, Some(child), None);
                        self.exec(&insert).await?;
                    }
                    return Ok(());
                }
            }
        }

        let mut children = self.get(owner, ns).await?.unwrap_or_default();
        children.retain(|el| !spec.matches(el, ns));
        children.extend(content.iter().cloned());
        self.put(owner, ns, &children).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rookery_xml::ns;

    async fn store() -> (tempfile::TempDir, Arc<SqlXdb>) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/xdb.db?mode=rwc", dir.path().display());
        let store = SqlXdb::open(&url).await.unwrap();
        (dir, store)
    }

    fn item(jid: &str, sub: &str) -> Element {
        Element::builder("item", ns::ROSTER)
            .attr("jid", jid)
            .attr("subscription", sub)
            .build()
    }

    #[test]
    fn escaping_covers_the_dangerous_characters() {
        assert_eq!(sql_escape("o'brien"), "o''brien");
        assert_eq!(sql_escape(r#"a"b"#), r#"a""b"#);
        assert_eq!(sql_escape(r"back\slash"), r"back\\slash");
    }

    #[tokio::test]
    async fn templated_namespace_round_trips() {
        let (_dir, store) = store().await;
        let owner: Jid = "u@a.example".parse().unwrap();

        store
            .put(&owner, ns::ROSTER, &[item("a@x", "both"), item("b@x", "none")])
            .await
            .unwrap();

        let loaded = store.get(&owner, ns::ROSTER).await.unwrap().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].attr("jid"), Some("a@x"));
    }

    #[tokio::test]
    async fn native_delete_handles_insert_with_match() {
        let (_dir, store) = store().await;
        let owner: Jid = "u@a.example".parse().unwrap();

        store
            .put(&owner, ns::ROSTER, &[item("a@x", "none"), item("b@x", "none")])
            .await
            .unwrap();

        let spec = MatchSpec::AttrEq {
            name: "jid".into(),
            value: "a@x".into(),
        };
        store
            .insert(&owner, ns::ROSTER, &spec, &[item("a@x", "both")])
            .await
            .unwrap();

        let loaded = store.get(&owner, ns::ROSTER).await.unwrap().unwrap();
        assert_eq!(loaded.len(), 2);
        let a = loaded.iter().find(|i| i.attr("jid") == Some("a@x")).unwrap();
        assert_eq!(a.attr("subscription"), Some("both"));
        let b = loaded.iter().find(|i| i.attr("jid") == Some("b@x")).unwrap();
        assert_eq!(b.attr("subscription"), Some("none"));
    }

    #[tokio::test]
    async fn unmapped_namespaces_use_the_fragments_table() {
        let (_dir, store) = store().await;
        let owner: Jid = "u@a.example".parse().unwrap();

        let mut el = Element::new("thing", "urn:custom:ns");
        el.append_text("payload");
        store.put(&owner, "urn:custom:ns", &[el]).await.unwrap();

        let loaded = store.get(&owner, "urn:custom:ns").await.unwrap().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].text(), "payload");

        // empty put deletes
        store.put(&owner, "urn:custom:ns", &[]).await.unwrap();
        assert!(store.get(&owner, "urn:custom:ns").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn hostile_values_cannot_escape_their_literal() {
        let (_dir, store) = store().await;
        let owner: Jid = "u@a.example".parse().unwrap();

        // a jid value trying to break out of the INSERT literal
        let hostile = Element::builder("item", ns::ROSTER)
            .attr("jid", "x'); DROP TABLE roster; --@x")
            .build();
        store.put(&owner, ns::ROSTER, &[hostile]).await.unwrap();

        let loaded = store.get(&owner, ns::ROSTER).await.unwrap().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded[0].attr("jid").unwrap().contains("DROP TABLE"));
    }

    #[tokio::test]
    async fn expiry_of_absent_records_is_none() {
        let (_dir, store) = store().await;
        let owner: Jid = "ghost@a.example".parse().unwrap();
        assert!(store.get(&owner, ns::ROSTER).await.unwrap().is_none());
    }
}

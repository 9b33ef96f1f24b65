use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params, params_from_iter};
use serde::Serialize;
use tracing::debug;

use crate::phpser::{self, PhpValue};

const MAX_PARENT_DEPTH: usize = 32;

/// Direct handle on a WordPress content store: the options, posts, postmeta
/// and term tables under one table prefix.
pub struct SiteStore {
    connection: Connection,
    prefix: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ContentItem {
    pub id: i64,
    pub title: String,
    pub slug: String,
    pub post_type: String,
    pub status: String,
    pub parent: i64,
    /// `post_date` as stored, `YYYY-MM-DD HH:MM:SS` local time.
    pub date: String,
}

#[derive(Debug, Clone, Default)]
pub struct ContentFilter {
    pub post_types: Vec<String>,
    pub statuses: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MenuRecord {
    pub term_id: i64,
    pub name: String,
    pub slug: String,
    pub item_count: usize,
}

impl SiteStore {
    pub fn open(db_path: &Path, prefix: &str) -> Result<Self> {
        if !db_path.is_file() {
            bail!("database not found: {}", db_path.display());
        }
        let connection = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open {}", db_path.display()))?;
        connection
            .busy_timeout(Duration::from_secs(5))
            .context("failed to set sqlite busy timeout")?;
        debug!(db = %db_path.display(), prefix, "opened content store");
        Self::from_connection(connection, prefix)
    }

    pub fn from_connection(connection: Connection, prefix: &str) -> Result<Self> {
        validate_prefix(prefix)?;
        let store = Self {
            connection,
            prefix: prefix.to_string(),
        };
        let options = store.table("options");
        if !table_exists(&store.connection, &options)? {
            bail!("table {options} not found; check the table prefix ({prefix})");
        }
        Ok(store)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn table(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    pub fn get_option(&self, name: &str) -> Result<Option<String>> {
        let sql = format!(
            "SELECT option_value FROM {} WHERE option_name = ?1",
            self.table("options")
        );
        self.connection
            .query_row(&sql, [name], |row| row.get::<_, String>(0))
            .optional()
            .with_context(|| format!("failed to read option {name}"))
    }

    /// Option value decoded from PHP serialization. Plain values come back as strings.
    pub fn get_serialized_option(&self, name: &str) -> Result<Option<PhpValue>> {
        match self.get_option(name)? {
            Some(raw) if phpser::looks_serialized(&raw) => phpser::parse(&raw)
                .map(Some)
                .with_context(|| format!("option {name} holds malformed serialized data")),
            Some(raw) => Ok(Some(PhpValue::String(raw))),
            None => Ok(None),
        }
    }

    /// Update the row in place, inserting it (autoload `yes`) when absent.
    pub fn set_option(&self, name: &str, value: &str) -> Result<()> {
        let table = self.table("options");
        let updated = self
            .connection
            .execute(
                &format!("UPDATE {table} SET option_value = ?1 WHERE option_name = ?2"),
                params![value, name],
            )
            .with_context(|| format!("failed to update option {name}"))?;
        if updated == 0 {
            self.connection
                .execute(
                    &format!(
                        "INSERT INTO {table} (option_name, option_value, autoload) VALUES (?1, ?2, 'yes')"
                    ),
                    params![name, value],
                )
                .with_context(|| format!("failed to insert option {name}"))?;
        }
        Ok(())
    }

    pub fn delete_option(&self, name: &str) -> Result<bool> {
        let deleted = self
            .connection
            .execute(
                &format!(
                    "DELETE FROM {} WHERE option_name = ?1",
                    self.table("options")
                ),
                [name],
            )
            .with_context(|| format!("failed to delete option {name}"))?;
        Ok(deleted > 0)
    }

    pub fn list_content(&self, filter: &ContentFilter) -> Result<Vec<ContentItem>> {
        let mut clauses = Vec::new();
        let mut values: Vec<String> = Vec::new();
        if !filter.post_types.is_empty() {
            clauses.push(format!(
                "post_type IN ({})",
                placeholders(values.len(), filter.post_types.len())
            ));
            values.extend(filter.post_types.iter().cloned());
        }
        if !filter.statuses.is_empty() {
            clauses.push(format!(
                "post_status IN ({})",
                placeholders(values.len(), filter.statuses.len())
            ));
            values.extend(filter.statuses.iter().cloned());
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT ID, post_title, post_name, post_type, post_status, post_parent, post_date FROM {}{where_clause} ORDER BY ID",
            self.table("posts")
        );

        let mut statement = self
            .connection
            .prepare(&sql)
            .context("failed to prepare content query")?;
        let rows = statement
            .query_map(params_from_iter(values.iter()), content_from_row)
            .context("failed to query content items")?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row.context("failed to decode content row")?);
        }
        Ok(items)
    }

    pub fn get_content(&self, id: i64) -> Result<Option<ContentItem>> {
        let sql = format!(
            "SELECT ID, post_title, post_name, post_type, post_status, post_parent, post_date FROM {} WHERE ID = ?1",
            self.table("posts")
        );
        self.connection
            .query_row(&sql, [id], content_from_row)
            .optional()
            .with_context(|| format!("failed to read content item {id}"))
    }

    pub fn count_content_by_type(&self) -> Result<BTreeMap<String, usize>> {
        let sql = format!(
            "SELECT post_type, COUNT(*) FROM {} GROUP BY post_type",
            self.table("posts")
        );
        let mut statement = self
            .connection
            .prepare(&sql)
            .context("failed to prepare content count query")?;
        let rows = statement
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .context("failed to count content items")?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let (post_type, count) = row.context("failed to decode content count row")?;
            counts.insert(post_type, usize::try_from(count).unwrap_or(0));
        }
        Ok(counts)
    }

    pub fn get_meta(&self, post_id: i64, key: &str) -> Result<Option<String>> {
        let sql = format!(
            "SELECT meta_value FROM {} WHERE post_id = ?1 AND meta_key = ?2 ORDER BY meta_id LIMIT 1",
            self.table("postmeta")
        );
        self.connection
            .query_row(&sql, params![post_id, key], |row| {
                row.get::<_, Option<String>>(0)
            })
            .optional()
            .map(Option::flatten)
            .with_context(|| format!("failed to read meta {key} for item {post_id}"))
    }

    pub fn list_meta_keys(&self, post_id: i64) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT DISTINCT meta_key FROM {} WHERE post_id = ?1 AND meta_key IS NOT NULL ORDER BY meta_key",
            self.table("postmeta")
        );
        let mut statement = self
            .connection
            .prepare(&sql)
            .context("failed to prepare meta key query")?;
        let rows = statement
            .query_map([post_id], |row| row.get::<_, String>(0))
            .with_context(|| format!("failed to list meta keys for item {post_id}"))?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(row.context("failed to decode meta key row")?);
        }
        Ok(keys)
    }

    pub fn set_meta(&self, post_id: i64, key: &str, value: &str) -> Result<()> {
        let table = self.table("postmeta");
        let updated = self
            .connection
            .execute(
                &format!("UPDATE {table} SET meta_value = ?1 WHERE post_id = ?2 AND meta_key = ?3"),
                params![value, post_id, key],
            )
            .with_context(|| format!("failed to update meta {key} for item {post_id}"))?;
        if updated == 0 {
            self.connection
                .execute(
                    &format!(
                        "INSERT INTO {table} (post_id, meta_key, meta_value) VALUES (?1, ?2, ?3)"
                    ),
                    params![post_id, key, value],
                )
                .with_context(|| format!("failed to insert meta {key} for item {post_id}"))?;
        }
        Ok(())
    }

    /// Delete `keys` for one item. Returns the number of rows removed.
    pub fn delete_meta(&self, post_id: i64, keys: &[String]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "DELETE FROM {} WHERE post_id = ?1 AND meta_key IN ({})",
            self.table("postmeta"),
            placeholders(1, keys.len())
        );
        let mut values = vec![SqlValue::Integer(post_id)];
        values.extend(keys.iter().cloned().map(SqlValue::Text));
        self.connection
            .execute(&sql, params_from_iter(values.iter()))
            .with_context(|| format!("failed to delete meta rows for item {post_id}"))
    }

    pub fn delete_meta_everywhere(&self, keys: &[String]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "DELETE FROM {} WHERE meta_key IN ({})",
            self.table("postmeta"),
            placeholders(0, keys.len())
        );
        self.connection
            .execute(&sql, params_from_iter(keys.iter()))
            .context("failed to delete meta rows")
    }

    pub fn count_meta_rows(&self, keys: &[String], post_id: Option<i64>) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut values: Vec<SqlValue> = keys.iter().cloned().map(SqlValue::Text).collect();
        let mut sql = format!(
            "SELECT COUNT(*) FROM {} WHERE meta_key IN ({})",
            self.table("postmeta"),
            placeholders(0, keys.len())
        );
        if let Some(post_id) = post_id {
            sql.push_str(&format!(" AND post_id = ?{}", values.len() + 1));
            values.push(SqlValue::Integer(post_id));
        }
        let count: i64 = self
            .connection
            .query_row(&sql, params_from_iter(values.iter()), |row| row.get(0))
            .context("failed to count meta rows")?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Distinct item ids carrying `key`, ascending.
    pub fn posts_with_meta(&self, key: &str) -> Result<Vec<i64>> {
        let sql = format!(
            "SELECT DISTINCT post_id FROM {} WHERE meta_key = ?1 ORDER BY post_id",
            self.table("postmeta")
        );
        let mut statement = self
            .connection
            .prepare(&sql)
            .context("failed to prepare meta lookup")?;
        let rows = statement
            .query_map([key], |row| row.get::<_, i64>(0))
            .with_context(|| format!("failed to find items with meta {key}"))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.context("failed to decode meta lookup row")?);
        }
        Ok(ids)
    }

    pub fn list_menus(&self) -> Result<Vec<MenuRecord>> {
        let sql = format!(
            "SELECT t.term_id, t.name, t.slug
             FROM {terms} t
             JOIN {taxonomy} tt ON tt.term_id = t.term_id
             WHERE tt.taxonomy = 'nav_menu'
             ORDER BY t.name",
            terms = self.table("terms"),
            taxonomy = self.table("term_taxonomy"),
        );
        let mut statement = self
            .connection
            .prepare(&sql)
            .context("failed to prepare menu query")?;
        let rows = statement
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .context("failed to query menus")?;

        let mut menus = Vec::new();
        for row in rows {
            let (term_id, name, slug) = row.context("failed to decode menu row")?;
            let item_count = self.menu_item_count(term_id)?;
            menus.push(MenuRecord {
                term_id,
                name,
                slug,
                item_count,
            });
        }
        Ok(menus)
    }

    /// Number of `nav_menu_item` posts attached to the menu term.
    pub fn menu_item_count(&self, term_id: i64) -> Result<usize> {
        let sql = format!(
            "SELECT COUNT(*) FROM {relationships} r
             JOIN {taxonomy} tt ON tt.term_taxonomy_id = r.term_taxonomy_id
             JOIN {posts} p ON p.ID = r.object_id
             WHERE tt.term_id = ?1 AND tt.taxonomy = 'nav_menu' AND p.post_type = 'nav_menu_item'",
            relationships = self.table("term_relationships"),
            taxonomy = self.table("term_taxonomy"),
            posts = self.table("posts"),
        );
        let count: i64 = self
            .connection
            .query_row(&sql, [term_id], |row| row.get(0))
            .with_context(|| format!("failed to count items for menu {term_id}"))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Slug path of an item including its ancestors, e.g. `about/team`.
    pub fn permalink_path(&self, item: &ContentItem) -> Result<String> {
        let mut segments = vec![item.slug.clone()];
        let mut parent = item.parent;
        let mut depth = 0;
        while parent != 0 && depth < MAX_PARENT_DEPTH {
            let Some(ancestor) = self.get_content(parent)? else {
                break;
            };
            segments.push(ancestor.slug.clone());
            parent = ancestor.parent;
            depth += 1;
        }
        segments.reverse();
        Ok(segments
            .into_iter()
            .filter(|segment| !segment.is_empty())
            .collect::<Vec<_>>()
            .join("/"))
    }
}

fn content_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContentItem> {
    Ok(ContentItem {
        id: row.get(0)?,
        title: row.get(1)?,
        slug: row.get(2)?,
        post_type: row.get(3)?,
        status: row.get(4)?,
        parent: row.get(5)?,
        date: row.get(6)?,
    })
}

/// `?{start+1}, ?{start+2}, ...` for `count` parameters.
fn placeholders(start: usize, count: usize) -> String {
    (start + 1..=start + count)
        .map(|index| format!("?{index}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn validate_prefix(prefix: &str) -> Result<()> {
    if prefix.is_empty()
        || !prefix
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
    {
        bail!("invalid table prefix `{prefix}` (expected letters, digits and underscores)");
    }
    Ok(())
}

fn table_exists(connection: &Connection, table_name: &str) -> Result<bool> {
    let exists: i64 = connection
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [table_name],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to inspect sqlite_master for table {table_name}"))?;
    Ok(exists == 1)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::fs;

    use rusqlite::{Connection, params};
    use tempfile::{TempDir, tempdir};

    use super::SiteStore;
    use crate::runtime::{ResolvedPaths, test_paths};

    const SCHEMA: &str = r#"
CREATE TABLE wp_options (
    option_id INTEGER PRIMARY KEY AUTOINCREMENT,
    option_name TEXT NOT NULL UNIQUE,
    option_value TEXT NOT NULL,
    autoload TEXT NOT NULL DEFAULT 'yes'
);
CREATE TABLE wp_posts (
    ID INTEGER PRIMARY KEY AUTOINCREMENT,
    post_title TEXT NOT NULL DEFAULT '',
    post_name TEXT NOT NULL DEFAULT '',
    post_type TEXT NOT NULL DEFAULT 'post',
    post_status TEXT NOT NULL DEFAULT 'publish',
    post_parent INTEGER NOT NULL DEFAULT 0,
    post_date TEXT NOT NULL DEFAULT '2024-01-01 00:00:00',
    post_content TEXT NOT NULL DEFAULT ''
);
CREATE TABLE wp_postmeta (
    meta_id INTEGER PRIMARY KEY AUTOINCREMENT,
    post_id INTEGER NOT NULL DEFAULT 0,
    meta_key TEXT,
    meta_value TEXT
);
CREATE TABLE wp_terms (
    term_id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL DEFAULT '',
    slug TEXT NOT NULL DEFAULT ''
);
CREATE TABLE wp_term_taxonomy (
    term_taxonomy_id INTEGER PRIMARY KEY AUTOINCREMENT,
    term_id INTEGER NOT NULL DEFAULT 0,
    taxonomy TEXT NOT NULL DEFAULT '',
    count INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE wp_term_relationships (
    object_id INTEGER NOT NULL DEFAULT 0,
    term_taxonomy_id INTEGER NOT NULL DEFAULT 0
);
"#;

    pub(crate) struct Fixture {
        _temp: TempDir,
        pub(crate) paths: ResolvedPaths,
        pub(crate) store: SiteStore,
    }

    impl Fixture {
        pub(crate) fn new() -> Self {
            let temp = tempdir().expect("tempdir");
            let root = temp.path().join("site");
            let paths = test_paths(&root);
            fs::create_dir_all(paths.db_path.parent().expect("db parent")).expect("db dir");
            fs::create_dir_all(&paths.uploads_dir).expect("uploads dir");
            let connection = Connection::open(&paths.db_path).expect("create db");
            connection.execute_batch(SCHEMA).expect("schema");
            drop(connection);
            let store = SiteStore::open(&paths.db_path, "wp_").expect("open store");
            Self {
                _temp: temp,
                paths,
                store,
            }
        }

        pub(crate) fn option(&self, name: &str, value: &str) {
            self.store.set_option(name, value).expect("insert option");
        }

        pub(crate) fn post(&self, title: &str, slug: &str, post_type: &str, status: &str) -> i64 {
            self.child_post(title, slug, post_type, status, 0)
        }

        pub(crate) fn child_post(
            &self,
            title: &str,
            slug: &str,
            post_type: &str,
            status: &str,
            parent: i64,
        ) -> i64 {
            self.store
                .connection
                .execute(
                    "INSERT INTO wp_posts (post_title, post_name, post_type, post_status, post_parent) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![title, slug, post_type, status, parent],
                )
                .expect("insert post");
            self.store.connection.last_insert_rowid()
        }

        pub(crate) fn post_date(&self, post_id: i64, date: &str) {
            self.store
                .connection
                .execute(
                    "UPDATE wp_posts SET post_date = ?1 WHERE ID = ?2",
                    params![date, post_id],
                )
                .expect("update post date");
        }

        pub(crate) fn meta(&self, post_id: i64, key: &str, value: &str) {
            self.store
                .connection
                .execute(
                    "INSERT INTO wp_postmeta (post_id, meta_key, meta_value) VALUES (?1, ?2, ?3)",
                    params![post_id, key, value],
                )
                .expect("insert meta");
        }

        /// Creates a `nav_menu` term and attaches `items` menu-item posts to it.
        pub(crate) fn menu(&self, name: &str, slug: &str, items: usize) -> i64 {
            let connection = &self.store.connection;
            connection
                .execute(
                    "INSERT INTO wp_terms (name, slug) VALUES (?1, ?2)",
                    params![name, slug],
                )
                .expect("insert term");
            let term_id = connection.last_insert_rowid();
            connection
                .execute(
                    "INSERT INTO wp_term_taxonomy (term_id, taxonomy, count) VALUES (?1, 'nav_menu', ?2)",
                    params![term_id, items as i64],
                )
                .expect("insert taxonomy");
            let term_taxonomy_id = connection.last_insert_rowid();
            for index in 0..items {
                let item_id = self.post(
                    &format!("{name} item {index}"),
                    &format!("{slug}-item-{index}"),
                    "nav_menu_item",
                    "publish",
                );
                connection
                    .execute(
                        "INSERT INTO wp_term_relationships (object_id, term_taxonomy_id) VALUES (?1, ?2)",
                        params![item_id, term_taxonomy_id],
                    )
                    .expect("insert relationship");
            }
            term_id
        }
    }
}

//! Query builder for `EventStore::retrieve`/`delete`.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderBy {
    TimestampAsc,
    TimestampDesc,
}

/// Parameterised filter over the `events` table (§6). All fields are
/// AND-between; empty/`None` fields do not constrain.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub types: Vec<String>,
    pub sources: Vec<String>,
    pub repositories: Vec<String>,
    pub session_ids: Vec<String>,
    pub user_ids: Vec<String>,
    pub after: Option<u64>,
    pub before: Option<u64>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone)]
pub enum Bind {
    Text(String),
    Int(i64),
}

fn in_clause(column: &str, values: &[String], binds: &mut Vec<Bind>) -> Option<String> {
    if values.is_empty() {
        return None;
    }
    let placeholders = values.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
    binds.extend(values.iter().cloned().map(Bind::Text));
    Some(format!("{} IN ({})", column, placeholders))
}

impl EventQuery {
    fn where_clause(&self) -> (String, Vec<Bind>) {
        let mut binds = Vec::new();
        let mut clauses = Vec::new();

        if let Some(c) = in_clause("type", &self.types, &mut binds) {
            clauses.push(c);
        }
        if let Some(c) = in_clause("source", &self.sources, &mut binds) {
            clauses.push(c);
        }
        if let Some(c) = in_clause("repository", &self.repositories, &mut binds) {
            clauses.push(c);
        }
        if let Some(c) = in_clause("session_id", &self.session_ids, &mut binds) {
            clauses.push(c);
        }
        if let Some(c) = in_clause("user_id", &self.user_ids, &mut binds) {
            clauses.push(c);
        }
        if let Some(after) = self.after {
            clauses.push("timestamp >= ?".to_string());
            binds.push(Bind::Int(after as i64));
        }
        if let Some(before) = self.before {
            clauses.push("timestamp <= ?".to_string());
            binds.push(Bind::Int(before as i64));
        }

        if clauses.is_empty() {
            (String::new(), binds)
        } else {
            (format!(" WHERE {}", clauses.join(" AND ")), binds)
        }
    }

    pub fn to_sql(&self) -> (String, Vec<Bind>) {
        let (where_sql, mut binds) = self.where_clause();
        let mut sql = format!("SELECT * FROM events{}", where_sql);

        match self.order_by {
            Some(OrderBy::TimestampAsc) => sql.push_str(" ORDER BY timestamp ASC"),
            Some(OrderBy::TimestampDesc) => sql.push_str(" ORDER BY timestamp DESC"),
            None => sql.push_str(" ORDER BY timestamp ASC"),
        }
        if let Some(limit) = self.limit {
            sql.push_str(" LIMIT ?");
            binds.push(Bind::Int(limit));
        }
        if let Some(offset) = self.offset {
            sql.push_str(" OFFSET ?");
            binds.push(Bind::Int(offset));
        }
        (sql, binds)
    }

    pub fn to_delete_sql(&self) -> (String, Vec<Bind>) {
        let (where_sql, binds) = self.where_clause();
        (format!("DELETE FROM events{}", where_sql), binds)
    }
}


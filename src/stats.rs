use std::collections::HashMap;

use rusqlite::Connection;
use tracing::debug;

use crate::errors::AppResult;

pub fn email_domain_counts(connection: &Connection) -> AppResult<Vec<(String, usize)>> {
    let mut stmt = connection.prepare("SELECT email FROM emails")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut counts: HashMap<String, usize> = HashMap::new();
    for email in rows {
        let email = email?;
        match email.rsplit_once('@') {
            Some((_, domain)) if !domain.is_empty() => {
                *counts.entry(domain.to_string()).or_default() += 1;
            }
            _ => debug!("email missing domain separator; skipping"),
        }
    }
    Ok(sorted_descending(counts))
}

pub fn region_counts(connection: &Connection) -> AppResult<Vec<(String, usize)>> {
    let mut stmt = connection.prepare("SELECT region FROM locations WHERE region IS NOT NULL")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut counts: HashMap<String, usize> = HashMap::new();
    for region in rows {
        *counts.entry(region?).or_default() += 1;
    }
    Ok(sorted_descending(counts))
}

fn sorted_descending(counts: HashMap<String, usize>) -> Vec<(String, usize)> {
    let mut entries: Vec<_> = counts.into_iter().collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries
}

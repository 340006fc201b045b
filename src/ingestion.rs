use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::db::now_timestamp;
use crate::errors::AppResult;

#[derive(Debug, Clone, PartialEq)]
pub struct AddressRecord {
    pub id: String,
    pub postal_code: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub rows_read: usize,
    pub records_stored: usize,
}

#[derive(Debug, Deserialize)]
struct CsvRow {
    first_name: String,
    last_name: String,
    postal: String,
    email: String,
}

pub fn parse_address_records(bytes: &[u8]) -> AppResult<Vec<AddressRecord>> {
    let mut reader = csv::ReaderBuilder::new().delimiter(b';').from_reader(bytes);
    let mut records = Vec::new();
    for row in reader.deserialize::<CsvRow>() {
        let row = row?;
        records.push(AddressRecord {
            id: format!("{}:{}", row.first_name, row.last_name),
            postal_code: row.postal,
            email: row.email,
        });
    }
    Ok(records)
}

pub fn import_records(
    connection: &mut Connection,
    records: &[AddressRecord],
) -> AppResult<ImportSummary> {
    let tx = connection.transaction()?;
    tx.execute("DELETE FROM emails", [])?;
    tx.execute("DELETE FROM locations", [])?;
    {
        let mut insert_location =
            tx.prepare("INSERT OR REPLACE INTO locations (id, postal_code) VALUES (?1, ?2)")?;
        let mut insert_email =
            tx.prepare("INSERT OR REPLACE INTO emails (id, email) VALUES (?1, ?2)")?;
        for record in records {
            insert_location.execute(params![record.id, record.postal_code])?;
            insert_email.execute(params![record.id, record.email])?;
        }
    }
    tx.execute(
        "INSERT INTO cache_info (id, csv_cached_at, locations_cached_at) VALUES (1, ?1, NULL)
        ON CONFLICT(id) DO UPDATE SET csv_cached_at = excluded.csv_cached_at,
            locations_cached_at = NULL",
        [now_timestamp()],
    )?;
    let records_stored: usize =
        tx.query_row("SELECT COUNT(*) FROM locations", [], |row| row.get(0))?;
    tx.commit()?;

    Ok(ImportSummary {
        rows_read: records.len(),
        records_stored,
    })
}

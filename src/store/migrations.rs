use rusqlite::Connection;
use tracing::info;

const MIGRATIONS: &[&str] = &[
    // 1: saved carriers and their insurance document history
    "CREATE TABLE IF NOT EXISTS saved_carriers (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        company_id INTEGER,
        mc_number TEXT NOT NULL,
        dot_number TEXT,
        legal_name TEXT,
        insurance_type TEXT,
        insurance_carrier TEXT,
        policy_number TEXT,
        posted_date TEXT,
        coverage_from TEXT,
        coverage_to TEXT,
        effective_date TEXT,
        cancellation_date TEXT,
        insurance_attempt_at INTEGER,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
    );

    CREATE INDEX IF NOT EXISTS idx_saved_carriers_mc ON saved_carriers(mc_number);

    CREATE TABLE IF NOT EXISTS carrier_documents (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        carrier_id INTEGER NOT NULL REFERENCES saved_carriers(id) ON DELETE CASCADE,
        attempt_at INTEGER NOT NULL,
        file_name TEXT NOT NULL,
        body TEXT NOT NULL,
        uploaded_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        UNIQUE(carrier_id, attempt_at)
    );",
];

pub fn run_migrations(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS _migrations (version INTEGER PRIMARY KEY)")?;

    let applied: i64 = conn.query_row("SELECT COALESCE(MAX(version), 0) FROM _migrations", [], |row| {
        row.get(0)
    })?;

    for (version, sql) in (1i64..).zip(MIGRATIONS.iter()) {
        if version > applied {
            conn.execute_batch(sql)?;
            conn.execute("INSERT INTO _migrations (version) VALUES (?1)", [version])?;
            info!(version = version, "Applied store migration");
        }
    }
    Ok(())
}

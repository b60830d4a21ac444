//! Database schema definitions

use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use crate::error::LedgerResult;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i64 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> LedgerResult<()> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating ledger schema v{}", SCHEMA_VERSION);
        conn.execute_batch(LEDGER_SCHEMA)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating ledger schema from v{} to v{}", current_version, SCHEMA_VERSION);
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else {
        info!("Ledger schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> LedgerResult<i64> {
    conn.execute("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)", [])?;

    let version: i64 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .optional()?
        .unwrap_or(0);

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i64) -> LedgerResult<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

/// Ledger tables. Balances can never go negative at the storage level either.
const LEDGER_SCHEMA: &str = r#"
CREATE TABLE members (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    balance     INTEGER NOT NULL DEFAULT 0 CHECK (balance >= 0),
    is_admin    INTEGER NOT NULL DEFAULT 0,
    version     INTEGER NOT NULL DEFAULT 0,
    created_at  INTEGER NOT NULL
);

CREATE TABLE quotas (
    id              TEXT PRIMARY KEY,
    owner_id        TEXT NOT NULL REFERENCES members(id),
    purchase_price  INTEGER NOT NULL,
    current_value   INTEGER NOT NULL CHECK (current_value >= 0),
    purchased_at    INTEGER NOT NULL,
    status          TEXT NOT NULL,
    pledged_to      TEXT,
    liquidated_at   INTEGER
);

CREATE TABLE credits (
    id                  TEXT PRIMARY KEY,
    borrower_id         TEXT NOT NULL REFERENCES members(id),
    principal           INTEGER NOT NULL,
    total_repayment     INTEGER NOT NULL,
    installments        INTEGER NOT NULL,
    installments_paid   INTEGER NOT NULL DEFAULT 0,
    amount_paid         INTEGER NOT NULL DEFAULT 0,
    status              TEXT NOT NULL,
    payout              TEXT NOT NULL,
    requested_at        INTEGER NOT NULL,
    decided_at          INTEGER,
    due_at              INTEGER,
    closed_at           INTEGER,
    shortfall           INTEGER NOT NULL DEFAULT 0,
    version             INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE credit_collateral (
    credit_id   TEXT NOT NULL REFERENCES credits(id),
    quota_id    TEXT NOT NULL REFERENCES quotas(id),
    position    INTEGER NOT NULL,
    PRIMARY KEY (credit_id, quota_id)
);

CREATE TABLE transactions (
    seq                 INTEGER PRIMARY KEY AUTOINCREMENT,
    id                  TEXT NOT NULL UNIQUE,
    member_id           TEXT NOT NULL REFERENCES members(id),
    tx_type             TEXT NOT NULL,
    amount              INTEGER NOT NULL,
    effect              INTEGER NOT NULL,
    status              TEXT NOT NULL,
    details             TEXT NOT NULL,
    gateway_reference   TEXT,
    created_at          INTEGER NOT NULL,
    settled_at          INTEGER
);

CREATE TABLE system_state (
    id                      INTEGER PRIMARY KEY CHECK (id = 1),
    operating_reserve       INTEGER NOT NULL DEFAULT 0,
    profit_pool             INTEGER NOT NULL DEFAULT 0 CHECK (profit_pool >= 0),
    last_distribution_at    INTEGER,
    pending_generation      INTEGER NOT NULL DEFAULT 0,
    version                 INTEGER NOT NULL DEFAULT 0
);

INSERT INTO system_state (id) VALUES (1);

CREATE INDEX idx_quotas_owner ON quotas(owner_id, status);
CREATE INDEX idx_quotas_pledged ON quotas(pledged_to);
CREATE INDEX idx_credits_status ON credits(status, due_at);
CREATE INDEX idx_credits_borrower ON credits(borrower_id);
CREATE INDEX idx_transactions_member ON transactions(member_id, seq);
CREATE INDEX idx_transactions_status ON transactions(status);
"#;

//! SQLite persistence for the ledger.
//!
//! Free functions over a [`Connection`]; callers pass the open
//! [`rusqlite::Transaction`] of the current atomic unit (it derefs to a
//! connection), so every read and write below happens inside that unit.
//!
//! ## Tables
//!
//! - `members` - balance and admin flag, `version` bumped by row locks
//! - `quotas` - participation units, `pledged_to` marks collateral
//! - `credits` / `credit_collateral` - mutual-aid credits and their pledges
//! - `transactions` - append-only ledger entries, totally ordered by `seq`
//! - `system_state` - the single row holding reserve, profit pool and queue generation

pub mod schema;

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::str::FromStr;

use crate::error::{LedgerError, LedgerResult};
use crate::model::{
    Credit, CreditStatus, Member, Quota, QuotaStatus, SystemState, Transaction, TransactionStatus,
};
use crate::types::{
    from_millis, to_millis, Amount, CreditId, MemberId, QuotaId, Timestamp, TransactionId,
};

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = LedgerError>,
{
    let text: String = row.get(idx)?;
    text.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn opt_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Timestamp>> {
    Ok(row.get::<_, Option<i64>>(idx)?.map(from_millis))
}

// ---------------------------------------------------------------------------
// Members
// ---------------------------------------------------------------------------

const MEMBER_COLUMNS: &str = "m.id, m.name, m.balance, m.is_admin, m.created_at,
    (SELECT COUNT(*) FROM quotas q WHERE q.owner_id = m.id AND q.status = 'ACTIVE'),
    (SELECT COALESCE(SUM(q.current_value), 0) FROM quotas q WHERE q.owner_id = m.id AND q.status = 'ACTIVE')";

fn member_from_row(row: &Row<'_>) -> rusqlite::Result<Member> {
    Ok(Member {
        id: MemberId::new(row.get::<_, String>(0)?),
        name: row.get(1)?,
        balance: Amount::new(row.get(2)?),
        is_admin: row.get(3)?,
        created_at: from_millis(row.get(4)?),
        quota_count: row.get(5)?,
        quota_value: Amount::new(row.get(6)?),
    })
}

pub fn insert_member(conn: &Connection, member: &Member) -> LedgerResult<()> {
    conn.execute(
        "INSERT INTO members (id, name, balance, is_admin, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            member.id.as_str(),
            member.name,
            member.balance.minor_units(),
            member.is_admin,
            to_millis(member.created_at),
        ],
    )?;
    Ok(())
}

pub fn find_member(conn: &Connection, id: &MemberId) -> LedgerResult<Option<Member>> {
    let sql = format!("SELECT {} FROM members m WHERE m.id = ?1", MEMBER_COLUMNS);
    Ok(conn.query_row(&sql, params![id.as_str()], member_from_row).optional()?)
}

pub fn get_member(conn: &Connection, id: &MemberId) -> LedgerResult<Member> {
    find_member(conn, id)?.ok_or_else(|| LedgerError::MemberNotFound(id.to_string()))
}

pub fn list_members(conn: &Connection) -> LedgerResult<Vec<Member>> {
    let sql = format!("SELECT {} FROM members m ORDER BY m.created_at, m.rowid", MEMBER_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], member_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Take the member row lock for the rest of the atomic unit
pub fn lock_member(conn: &Connection, id: &MemberId) -> LedgerResult<()> {
    let updated = conn.execute(
        "UPDATE members SET version = version + 1 WHERE id = ?1",
        params![id.as_str()],
    )?;
    if updated == 0 {
        return Err(LedgerError::MemberNotFound(id.to_string()));
    }
    Ok(())
}

pub fn set_balance(conn: &Connection, id: &MemberId, balance: Amount) -> LedgerResult<()> {
    conn.execute(
        "UPDATE members SET balance = ?2 WHERE id = ?1",
        params![id.as_str(), balance.minor_units()],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Quotas
// ---------------------------------------------------------------------------

const QUOTA_COLUMNS: &str =
    "id, owner_id, purchase_price, current_value, purchased_at, status, pledged_to, liquidated_at";

fn quota_from_row(row: &Row<'_>) -> rusqlite::Result<Quota> {
    Ok(Quota {
        id: QuotaId::new(row.get::<_, String>(0)?),
        owner_id: MemberId::new(row.get::<_, String>(1)?),
        purchase_price: Amount::new(row.get(2)?),
        current_value: Amount::new(row.get(3)?),
        purchased_at: from_millis(row.get(4)?),
        status: parse_column::<QuotaStatus>(row, 5)?,
        pledged_to: row.get::<_, Option<String>>(6)?.map(CreditId::new),
        liquidated_at: opt_time(row, 7)?,
    })
}

pub fn insert_quota(conn: &Connection, quota: &Quota) -> LedgerResult<()> {
    conn.execute(
        "INSERT INTO quotas (id, owner_id, purchase_price, current_value, purchased_at, status, pledged_to, liquidated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            quota.id.as_str(),
            quota.owner_id.as_str(),
            quota.purchase_price.minor_units(),
            quota.current_value.minor_units(),
            to_millis(quota.purchased_at),
            quota.status.as_str(),
            quota.pledged_to.as_ref().map(|c| c.as_str()),
            quota.liquidated_at.map(to_millis),
        ],
    )?;
    Ok(())
}

pub fn get_quota(conn: &Connection, id: &QuotaId) -> LedgerResult<Quota> {
    let sql = format!("SELECT {} FROM quotas WHERE id = ?1", QUOTA_COLUMNS);
    conn.query_row(&sql, params![id.as_str()], quota_from_row)
        .optional()?
        .ok_or_else(|| LedgerError::QuotaNotFound(id.to_string()))
}

/// Persist the mutable fields of a quota
pub fn update_quota(conn: &Connection, quota: &Quota) -> LedgerResult<()> {
    conn.execute(
        "UPDATE quotas SET current_value = ?2, status = ?3, pledged_to = ?4, liquidated_at = ?5 WHERE id = ?1",
        params![
            quota.id.as_str(),
            quota.current_value.minor_units(),
            quota.status.as_str(),
            quota.pledged_to.as_ref().map(|c| c.as_str()),
            quota.liquidated_at.map(to_millis),
        ],
    )?;
    Ok(())
}

fn query_quotas(conn: &Connection, filter: &str, param: &str) -> LedgerResult<Vec<Quota>> {
    let sql = format!(
        "SELECT {} FROM quotas WHERE {} ORDER BY purchased_at, rowid",
        QUOTA_COLUMNS, filter
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![param], quota_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Every quota a member ever held, oldest first
pub fn quotas_for_owner(conn: &Connection, owner: &MemberId) -> LedgerResult<Vec<Quota>> {
    query_quotas(conn, "owner_id = ?1", owner.as_str())
}

/// ACTIVE quotas not pledged to any credit, oldest first
pub fn free_active_quotas(conn: &Connection, owner: &MemberId) -> LedgerResult<Vec<Quota>> {
    query_quotas(conn, "owner_id = ?1 AND status = 'ACTIVE' AND pledged_to IS NULL", owner.as_str())
}

/// ACTIVE quotas pledged to a credit, oldest first
pub fn pledged_quotas(conn: &Connection, credit: &CreditId) -> LedgerResult<Vec<Quota>> {
    query_quotas(conn, "pledged_to = ?1 AND status = 'ACTIVE'", credit.as_str())
}

/// Drop every pledge held by a credit; returns how many quotas were released
pub fn release_pledges(conn: &Connection, credit: &CreditId) -> LedgerResult<usize> {
    Ok(conn.execute(
        "UPDATE quotas SET pledged_to = NULL WHERE pledged_to = ?1",
        params![credit.as_str()],
    )?)
}

/// ACTIVE quota count per owner, ordered by owner id
pub fn active_quota_counts(conn: &Connection) -> LedgerResult<Vec<(MemberId, i64)>> {
    let mut stmt = conn.prepare(
        "SELECT owner_id, COUNT(*) FROM quotas WHERE status = 'ACTIVE' GROUP BY owner_id ORDER BY owner_id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((MemberId::new(row.get::<_, String>(0)?), row.get::<_, i64>(1)?))
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

// ---------------------------------------------------------------------------
// Credits
// ---------------------------------------------------------------------------

const CREDIT_COLUMNS: &str = "id, borrower_id, principal, total_repayment, installments, installments_paid,
    amount_paid, status, payout, requested_at, decided_at, due_at, closed_at, shortfall";

fn credit_from_row(row: &Row<'_>) -> rusqlite::Result<Credit> {
    Ok(Credit {
        id: CreditId::new(row.get::<_, String>(0)?),
        borrower_id: MemberId::new(row.get::<_, String>(1)?),
        principal: Amount::new(row.get(2)?),
        total_repayment: Amount::new(row.get(3)?),
        installments: row.get(4)?,
        installments_paid: row.get(5)?,
        amount_paid: Amount::new(row.get(6)?),
        status: parse_column::<CreditStatus>(row, 7)?,
        payout: json_column(row, 8)?,
        collateral: Vec::new(),
        requested_at: from_millis(row.get(9)?),
        decided_at: opt_time(row, 10)?,
        due_at: opt_time(row, 11)?,
        closed_at: opt_time(row, 12)?,
        shortfall: Amount::new(row.get(13)?),
    })
}

fn load_collateral(conn: &Connection, credit: &mut Credit) -> LedgerResult<()> {
    let mut stmt = conn.prepare(
        "SELECT quota_id FROM credit_collateral WHERE credit_id = ?1 ORDER BY position",
    )?;
    let rows = stmt.query_map(params![credit.id.as_str()], |row| {
        Ok(QuotaId::new(row.get::<_, String>(0)?))
    })?;
    credit.collateral = rows.collect::<Result<Vec<_>, _>>()?;
    Ok(())
}

pub fn insert_credit(conn: &Connection, credit: &Credit) -> LedgerResult<()> {
    conn.execute(
        "INSERT INTO credits (id, borrower_id, principal, total_repayment, installments, installments_paid,
            amount_paid, status, payout, requested_at, decided_at, due_at, closed_at, shortfall)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            credit.id.as_str(),
            credit.borrower_id.as_str(),
            credit.principal.minor_units(),
            credit.total_repayment.minor_units(),
            credit.installments,
            credit.installments_paid,
            credit.amount_paid.minor_units(),
            credit.status.as_str(),
            serde_json::to_string(&credit.payout)?,
            to_millis(credit.requested_at),
            credit.decided_at.map(to_millis),
            credit.due_at.map(to_millis),
            credit.closed_at.map(to_millis),
            credit.shortfall.minor_units(),
        ],
    )?;

    for (position, quota_id) in credit.collateral.iter().enumerate() {
        conn.execute(
            "INSERT INTO credit_collateral (credit_id, quota_id, position) VALUES (?1, ?2, ?3)",
            params![credit.id.as_str(), quota_id.as_str(), position as i64],
        )?;
    }
    Ok(())
}

pub fn get_credit(conn: &Connection, id: &CreditId) -> LedgerResult<Credit> {
    let sql = format!("SELECT {} FROM credits WHERE id = ?1", CREDIT_COLUMNS);
    let mut credit = conn
        .query_row(&sql, params![id.as_str()], credit_from_row)
        .optional()?
        .ok_or_else(|| LedgerError::CreditNotFound(id.to_string()))?;
    load_collateral(conn, &mut credit)?;
    Ok(credit)
}

/// Take the credit row lock for the rest of the atomic unit
pub fn lock_credit(conn: &Connection, id: &CreditId) -> LedgerResult<()> {
    let updated = conn.execute(
        "UPDATE credits SET version = version + 1 WHERE id = ?1",
        params![id.as_str()],
    )?;
    if updated == 0 {
        return Err(LedgerError::CreditNotFound(id.to_string()));
    }
    Ok(())
}

/// Persist the mutable fields of a credit
pub fn update_credit(conn: &Connection, credit: &Credit) -> LedgerResult<()> {
    conn.execute(
        "UPDATE credits SET installments_paid = ?2, amount_paid = ?3, status = ?4, decided_at = ?5,
            due_at = ?6, closed_at = ?7, shortfall = ?8
         WHERE id = ?1",
        params![
            credit.id.as_str(),
            credit.installments_paid,
            credit.amount_paid.minor_units(),
            credit.status.as_str(),
            credit.decided_at.map(to_millis),
            credit.due_at.map(to_millis),
            credit.closed_at.map(to_millis),
            credit.shortfall.minor_units(),
        ],
    )?;
    Ok(())
}

/// Ids of credits in any of `statuses` whose due date is before `due_before`, oldest due first
pub fn credits_due_before(
    conn: &Connection,
    statuses: &[CreditStatus],
    due_before: Timestamp,
) -> LedgerResult<Vec<CreditId>> {
    let placeholders = statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "SELECT id FROM credits WHERE status IN ({}) AND due_at IS NOT NULL AND due_at < ?1 ORDER BY due_at, rowid",
        placeholders
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![to_millis(due_before)], |row| {
        Ok(CreditId::new(row.get::<_, String>(0)?))
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn credits_with_status(conn: &Connection, status: CreditStatus) -> LedgerResult<Vec<Credit>> {
    let sql = format!(
        "SELECT {} FROM credits WHERE status = ?1 ORDER BY requested_at, rowid",
        CREDIT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![status.as_str()], credit_from_row)?;
    let mut credits = rows.collect::<Result<Vec<_>, _>>()?;
    for credit in credits.iter_mut() {
        load_collateral(conn, credit)?;
    }
    Ok(credits)
}

pub fn credits_for_borrower(conn: &Connection, borrower: &MemberId) -> LedgerResult<Vec<Credit>> {
    let sql = format!(
        "SELECT {} FROM credits WHERE borrower_id = ?1 ORDER BY requested_at, rowid",
        CREDIT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![borrower.as_str()], credit_from_row)?;
    let mut credits = rows.collect::<Result<Vec<_>, _>>()?;
    for credit in credits.iter_mut() {
        load_collateral(conn, credit)?;
    }
    Ok(credits)
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

const TRANSACTION_COLUMNS: &str =
    "seq, id, member_id, tx_type, amount, effect, status, details, gateway_reference, created_at, settled_at";

fn transaction_from_row(row: &Row<'_>) -> rusqlite::Result<Transaction> {
    Ok(Transaction {
        seq: row.get(0)?,
        id: TransactionId::new(row.get::<_, String>(1)?),
        member_id: MemberId::new(row.get::<_, String>(2)?),
        transaction_type: parse_column(row, 3)?,
        amount: Amount::new(row.get(4)?),
        effect: Amount::new(row.get(5)?),
        status: parse_column(row, 6)?,
        details: json_column(row, 7)?,
        gateway_reference: row.get(8)?,
        created_at: from_millis(row.get(9)?),
        settled_at: opt_time(row, 10)?,
    })
}

/// Append a transaction; returns its sequence number
pub fn insert_transaction(conn: &Connection, tx: &Transaction) -> LedgerResult<i64> {
    conn.execute(
        "INSERT INTO transactions (id, member_id, tx_type, amount, effect, status, details, gateway_reference,
            created_at, settled_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            tx.id.as_str(),
            tx.member_id.as_str(),
            tx.transaction_type.as_str(),
            tx.amount.minor_units(),
            tx.effect.minor_units(),
            tx.status.as_str(),
            serde_json::to_string(&tx.details)?,
            tx.gateway_reference,
            to_millis(tx.created_at),
            tx.settled_at.map(to_millis),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_transaction(conn: &Connection, id: &TransactionId) -> LedgerResult<Transaction> {
    let sql = format!("SELECT {} FROM transactions WHERE id = ?1", TRANSACTION_COLUMNS);
    conn.query_row(&sql, params![id.as_str()], transaction_from_row)
        .optional()?
        .ok_or_else(|| LedgerError::TransactionNotFound(id.to_string()))
}

/// Record the outcome of a pending transaction; only PENDING rows are touched
pub fn settle_transaction(conn: &Connection, tx: &Transaction) -> LedgerResult<bool> {
    let updated = conn.execute(
        "UPDATE transactions SET status = ?2, effect = ?3, details = ?4, settled_at = ?5
         WHERE id = ?1 AND status = 'PENDING'",
        params![
            tx.id.as_str(),
            tx.status.as_str(),
            tx.effect.minor_units(),
            serde_json::to_string(&tx.details)?,
            tx.settled_at.map(to_millis),
        ],
    )?;
    Ok(updated == 1)
}

pub fn set_gateway_reference(
    conn: &Connection,
    id: &TransactionId,
    reference: &str,
) -> LedgerResult<()> {
    conn.execute(
        "UPDATE transactions SET gateway_reference = ?2 WHERE id = ?1",
        params![id.as_str(), reference],
    )?;
    Ok(())
}

pub fn transactions_for_member(
    conn: &Connection,
    member: &MemberId,
) -> LedgerResult<Vec<Transaction>> {
    let sql = format!(
        "SELECT {} FROM transactions WHERE member_id = ?1 ORDER BY seq",
        TRANSACTION_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![member.as_str()], transaction_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn pending_transactions(conn: &Connection) -> LedgerResult<Vec<Transaction>> {
    let sql = format!(
        "SELECT {} FROM transactions WHERE status = 'PENDING' ORDER BY seq",
        TRANSACTION_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], transaction_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Sum of balance effects of a member's COMPLETED transactions
pub fn completed_effect_sum(conn: &Connection, member: &MemberId) -> LedgerResult<Amount> {
    let sum: i64 = conn.query_row(
        "SELECT COALESCE(SUM(effect), 0) FROM transactions WHERE member_id = ?1 AND status = ?2",
        params![member.as_str(), TransactionStatus::Completed.as_str()],
        |row| row.get(0),
    )?;
    Ok(Amount::new(sum))
}

// ---------------------------------------------------------------------------
// System state
// ---------------------------------------------------------------------------

pub fn get_system_state(conn: &Connection) -> LedgerResult<SystemState> {
    Ok(conn.query_row(
        "SELECT operating_reserve, profit_pool, last_distribution_at, pending_generation FROM system_state WHERE id = 1",
        [],
        |row| {
            Ok(SystemState {
                operating_reserve: Amount::new(row.get(0)?),
                profit_pool: Amount::new(row.get(1)?),
                last_distribution_at: opt_time(row, 2)?,
                pending_generation: row.get(3)?,
            })
        },
    )?)
}

/// Take the system state row lock and read it
pub fn lock_system_state(conn: &Connection) -> LedgerResult<SystemState> {
    conn.execute("UPDATE system_state SET version = version + 1 WHERE id = 1", [])?;
    get_system_state(conn)
}

pub fn update_system_state(conn: &Connection, state: &SystemState) -> LedgerResult<()> {
    conn.execute(
        "UPDATE system_state SET operating_reserve = ?1, profit_pool = ?2, last_distribution_at = ?3 WHERE id = 1",
        params![
            state.operating_reserve.minor_units(),
            state.profit_pool.minor_units(),
            state.last_distribution_at.map(to_millis),
        ],
    )?;
    Ok(())
}

pub fn bump_pending_generation(conn: &Connection) -> LedgerResult<()> {
    conn.execute(
        "UPDATE system_state SET pending_generation = pending_generation + 1 WHERE id = 1",
        [],
    )?;
    Ok(())
}

pub fn pending_generation(conn: &Connection) -> LedgerResult<i64> {
    Ok(conn.query_row(
        "SELECT pending_generation FROM system_state WHERE id = 1",
        [],
        |row| row.get(0),
    )?)
}

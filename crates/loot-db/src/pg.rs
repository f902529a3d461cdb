use chrono::{DateTime, Utc};
use loot_schemas::{
    Account, BatchOutcome, ClaimNonce, ClaimRecord, ClaimResult, Identity, ItemInstance, ItemOp,
    RateLimitPolicy, RefusalReason, RemoveRefusal,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::store::{
    reward_instances, BucketHit, ClaimApply, LedgerInsert, NonceConsume, NonceRejection,
    Registration, Store, StoreError,
};

/// Postgres-backed [`Store`]. Run [`crate::migrate`] before first use.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn begin(&self, op: &'static str) -> Result<Transaction<'static, Postgres>, StoreError> {
        self.pool.begin().await.map_err(|e| map_sqlx(op, e))
    }
}

/// Classify a sqlx error. SQLSTATE class 23 (integrity) and 22 (data) are
/// constraint failures; serialization/deadlock/connection classes and
/// everything else at the transport level are transient.
fn map_sqlx(op: &'static str, e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::PoolTimedOut => StoreError::Timeout,
        sqlx::Error::RowNotFound => StoreError::NotFound(op.to_string()),
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
            if code.starts_with("23") || code.starts_with("22") {
                StoreError::Constraint(format!("{op}: {} ({code})", db.message()))
            } else if code == "57014" {
                // query_canceled: statement_timeout fired
                StoreError::Timeout
            } else {
                StoreError::Transient(format!("{op}: {} ({code})", db.message()))
            }
        }
        err @ (sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::TypeNotFound { .. }) => StoreError::Corrupt(format!("{op}: {err}")),
        other => StoreError::Transient(format!("{op}: {other}")),
    }
}

fn corrupt(op: &'static str, e: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(format!("{op}: {e}"))
}

fn identity_col(row: &PgRow, col: &str, op: &'static str) -> Result<Identity, StoreError> {
    let raw: String = row.try_get(col).map_err(|e| map_sqlx(op, e))?;
    Identity::new(raw).map_err(|e| corrupt(op, e))
}

fn account_from_row(row: &PgRow) -> Result<Account, StoreError> {
    const OP: &str = "decode account";
    let snapshot_json: serde_json::Value = row.try_get("snapshot").map_err(|e| map_sqlx(OP, e))?;
    let snapshot: Vec<String> = serde_json::from_value(snapshot_json).map_err(|e| corrupt(OP, e))?;
    Ok(Account {
        identity: identity_col(row, "identity", OP)?,
        balance: row.try_get("balance").map_err(|e| map_sqlx(OP, e))?,
        experience: row.try_get("experience").map_err(|e| map_sqlx(OP, e))?,
        snapshot,
        created_at: row.try_get("created_at").map_err(|e| map_sqlx(OP, e))?,
    })
}

fn instance_from_row(row: &PgRow) -> Result<ItemInstance, StoreError> {
    const OP: &str = "decode item_instance";
    Ok(ItemInstance {
        instance_id: row.try_get("instance_id").map_err(|e| map_sqlx(OP, e))?,
        item_type: row.try_get("item_type").map_err(|e| map_sqlx(OP, e))?,
        owner: identity_col(row, "owner", OP)?,
        created_at: row.try_get("created_at").map_err(|e| map_sqlx(OP, e))?,
        expires_at: row.try_get("expires_at").map_err(|e| map_sqlx(OP, e))?,
        locked: row.try_get("locked").map_err(|e| map_sqlx(OP, e))?,
    })
}

fn claim_from_row(row: &PgRow) -> Result<ClaimRecord, StoreError> {
    const OP: &str = "decode claim_ledger";
    let result_json: serde_json::Value = row.try_get("result").map_err(|e| map_sqlx(OP, e))?;
    let result: ClaimResult = serde_json::from_value(result_json).map_err(|e| corrupt(OP, e))?;
    Ok(ClaimRecord {
        claim_key: row.try_get("claim_key").map_err(|e| map_sqlx(OP, e))?,
        identity: identity_col(row, "identity", OP)?,
        applied_at: row.try_get("applied_at").map_err(|e| map_sqlx(OP, e))?,
        payload_fingerprint: row
            .try_get("payload_fingerprint")
            .map_err(|e| map_sqlx(OP, e))?,
        result,
    })
}

const ACCOUNT_COLS: &str = "identity, balance, experience, snapshot, created_at";
const INSTANCE_COLS: &str = "instance_id, item_type, owner, created_at, expires_at, locked";

#[async_trait::async_trait]
impl Store for PgStore {
    fn kind(&self) -> &'static str {
        "postgres"
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("select 1")
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx("ping", e))?;
        Ok(())
    }

    async fn register_account(
        &self,
        identity: &Identity,
        now: DateTime<Utc>,
    ) -> Result<Registration, StoreError> {
        let inserted: Option<(String,)> = sqlx::query_as(
            r#"
            insert into accounts (identity, created_at)
            values ($1, $2)
            on conflict (identity) do nothing
            returning identity
            "#,
        )
        .bind(identity.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx("register_account", e))?;

        let account = self
            .fetch_account(identity)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("account {identity}")))?;
        Ok(Registration {
            account,
            created: inserted.is_some(),
        })
    }

    async fn fetch_account(&self, identity: &Identity) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query(&format!(
            "select {ACCOUNT_COLS} from accounts where identity = $1"
        ))
        .bind(identity.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx("fetch_account", e))?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn list_identities(&self) -> Result<Vec<Identity>, StoreError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("select identity from accounts order by identity")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx("list_identities", e))?;
        rows.into_iter()
            .map(|(raw,)| Identity::new(raw).map_err(|e| corrupt("list_identities", e)))
            .collect()
    }

    async fn replace_snapshot(
        &self,
        identity: &Identity,
        snapshot: &[String],
    ) -> Result<(), StoreError> {
        let json = serde_json::to_value(snapshot).map_err(|e| corrupt("replace_snapshot", e))?;
        let res = sqlx::query("update accounts set snapshot = $2 where identity = $1")
            .bind(identity.as_str())
            .bind(json)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx("replace_snapshot", e))?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("account {identity}")));
        }
        Ok(())
    }

    async fn rate_limit_hit(
        &self,
        identity: &Identity,
        endpoint: &str,
        policy: &RateLimitPolicy,
        now: DateTime<Utc>,
    ) -> Result<BucketHit, StoreError> {
        let window_start = policy.window_start(now);
        let max = i32::try_from(policy.max_requests).unwrap_or(i32::MAX);

        // One conditional upsert: a stale window resets to 1, a live window
        // increments only while under the ceiling. No row back means denied.
        let row: Option<(i32,)> = sqlx::query_as(
            r#"
            insert into rate_limit_buckets (identity, endpoint, window_start, count)
            values ($1, $2, $3, 1)
            on conflict (identity, endpoint) do update set
              count = case
                when rate_limit_buckets.window_start < excluded.window_start then 1
                else rate_limit_buckets.count + 1
              end,
              window_start = greatest(rate_limit_buckets.window_start, excluded.window_start)
            where rate_limit_buckets.window_start < excluded.window_start
               or rate_limit_buckets.count < $4
            returning count
            "#,
        )
        .bind(identity.as_str())
        .bind(endpoint)
        .bind(window_start)
        .bind(max)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx("rate_limit_hit", e))?;

        Ok(match row {
            Some((count,)) => BucketHit::Counted {
                count: u32::try_from(count).unwrap_or(0),
            },
            None => BucketHit::Exhausted,
        })
    }

    async fn insert_nonce(&self, nonce: &ClaimNonce) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            insert into claim_nonces (token, identity, session_ref, issued_at, expires_at, consumed)
            values ($1, $2, $3, $4, $5, false)
            "#,
        )
        .bind(&nonce.token)
        .bind(nonce.identity.as_str())
        .bind(&nonce.session_ref)
        .bind(nonce.issued_at)
        .bind(nonce.expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("insert_nonce", e))?;
        Ok(())
    }

    async fn consume_nonce(
        &self,
        token: &str,
        identity: &Identity,
        now: DateTime<Utc>,
    ) -> Result<NonceConsume, StoreError> {
        let row = sqlx::query(
            r#"
            update claim_nonces
            set consumed = true, consumed_at = $3
            where token = $1
              and identity = $2
              and consumed = false
              and expires_at > $3
            returning token, identity, session_ref, issued_at, expires_at
            "#,
        )
        .bind(token)
        .bind(identity.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx("consume_nonce", e))?;

        if let Some(row) = row {
            const OP: &str = "decode claim_nonce";
            return Ok(NonceConsume::Consumed(ClaimNonce {
                token: row.try_get("token").map_err(|e| map_sqlx(OP, e))?,
                identity: identity_col(&row, "identity", OP)?,
                session_ref: row.try_get("session_ref").map_err(|e| map_sqlx(OP, e))?,
                issued_at: row.try_get("issued_at").map_err(|e| map_sqlx(OP, e))?,
                expires_at: row.try_get("expires_at").map_err(|e| map_sqlx(OP, e))?,
                consumed: false,
            }));
        }

        // The write already decided; this read only labels the refusal.
        let probe: Option<(String, bool, DateTime<Utc>)> = sqlx::query_as(
            "select identity, consumed, expires_at from claim_nonces where token = $1",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx("classify_nonce", e))?;

        let rejection = match probe {
            None => NonceRejection::NotFound,
            Some((owner, _, _)) if owner != identity.as_str() => NonceRejection::IdentityMismatch,
            Some((_, true, _)) => NonceRejection::AlreadyConsumed,
            Some((_, false, expires_at)) if expires_at <= now => NonceRejection::Expired,
            Some(_) => NonceRejection::NotFound,
        };
        Ok(NonceConsume::Rejected(rejection))
    }

    async fn purge_stale_buckets(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let res = sqlx::query("delete from rate_limit_buckets where window_start < $1")
            .bind(before)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx("purge_stale_buckets", e))?;
        Ok(res.rows_affected())
    }

    async fn purge_expired_nonces(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let res = sqlx::query("delete from claim_nonces where expires_at < $1")
            .bind(before)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx("purge_expired_nonces", e))?;
        Ok(res.rows_affected())
    }

    async fn find_claim(&self, claim_key: &str) -> Result<Option<ClaimRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            select claim_key, identity, payload_fingerprint, result, applied_at
            from claim_ledger
            where claim_key = $1
            "#,
        )
        .bind(claim_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx("find_claim", e))?;
        row.as_ref().map(claim_from_row).transpose()
    }

    async fn apply_claim(&self, req: ClaimApply<'_>) -> Result<LedgerInsert, StoreError> {
        const OP: &str = "apply_claim";
        let mut tx = self.begin(OP).await?;

        // Row lock serializes concurrent claims for one account.
        let locked: Option<(String,)> =
            sqlx::query_as("select identity from accounts where identity = $1 for update")
                .bind(req.identity.as_str())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx(OP, e))?;
        if locked.is_none() {
            tx.rollback().await.map_err(|e| map_sqlx(OP, e))?;
            return Err(StoreError::NotFound(format!("account {}", req.identity)));
        }

        // Exactly-once gate. The primary key decides, not a prior read.
        let gate: Option<(String,)> = sqlx::query_as(
            r#"
            insert into claim_ledger (claim_key, identity, payload_fingerprint, result, applied_at)
            values ($1, $2, $3, '{}'::jsonb, $4)
            on conflict (claim_key) do nothing
            returning claim_key
            "#,
        )
        .bind(req.claim_key)
        .bind(req.identity.as_str())
        .bind(req.reward.fingerprint())
        .bind(req.applied_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx(OP, e))?;

        if gate.is_none() {
            tx.rollback().await.map_err(|e| map_sqlx(OP, e))?;
            debug!(claim_key = req.claim_key, "ledger key already settled");
            let prior = self
                .find_claim(req.claim_key)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("claim {}", req.claim_key)))?;
            return Ok(LedgerInsert::AlreadyExists(prior));
        }

        let granted = serde_json::to_value(req.reward.item_types()).map_err(|e| corrupt(OP, e))?;
        let (balance_after, experience_after): (i64, i64) = sqlx::query_as(
            r#"
            update accounts
            set balance = balance + $2,
                experience = experience + $3,
                snapshot = snapshot || $4
            where identity = $1
            returning balance, experience
            "#,
        )
        .bind(req.identity.as_str())
        .bind(req.reward.currency_delta())
        .bind(req.reward.experience_delta())
        .bind(granted)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx(OP, e))?;

        let instances = reward_instances(req.reward, req.identity, req.applied_at);
        for inst in &instances {
            insert_instance(&mut tx, inst).await?;
        }

        let result = ClaimResult {
            claim_key: req.claim_key.to_string(),
            currency_granted: req.reward.currency_delta(),
            experience_granted: req.reward.experience_delta(),
            item_types: req.reward.item_types().to_vec(),
            instance_ids: instances.iter().map(|i| i.instance_id).collect(),
            balance_after,
            experience_after,
            applied_at: req.applied_at,
        };
        let result_json = serde_json::to_value(&result).map_err(|e| corrupt(OP, e))?;
        sqlx::query("update claim_ledger set result = $2 where claim_key = $1")
            .bind(req.claim_key)
            .bind(result_json)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx(OP, e))?;

        tx.commit().await.map_err(|e| map_sqlx(OP, e))?;

        Ok(LedgerInsert::Inserted(ClaimRecord {
            claim_key: req.claim_key.to_string(),
            identity: req.identity.clone(),
            applied_at: req.applied_at,
            payload_fingerprint: req.reward.fingerprint().to_string(),
            result,
        }))
    }

    async fn list_instances(&self, identity: &Identity) -> Result<Vec<ItemInstance>, StoreError> {
        let rows = sqlx::query(&format!(
            "select {INSTANCE_COLS} from item_instances where owner = $1 order by created_at, instance_id"
        ))
        .bind(identity.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx("list_instances", e))?;
        rows.iter().map(instance_from_row).collect()
    }

    async fn apply_item_batch(
        &self,
        identity: &Identity,
        ops: &[ItemOp],
        now: DateTime<Utc>,
    ) -> Result<BatchOutcome, StoreError> {
        const OP: &str = "apply_item_batch";
        let mut tx = self.begin(OP).await?;

        let owner: Option<(String,)> =
            sqlx::query_as("select identity from accounts where identity = $1 for update")
                .bind(identity.as_str())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx(OP, e))?;
        if owner.is_none() {
            tx.rollback().await.map_err(|e| map_sqlx(OP, e))?;
            return Err(StoreError::NotFound(format!("account {identity}")));
        }

        let mut out = BatchOutcome::default();
        for op in ops {
            match op {
                ItemOp::Add {
                    item_type,
                    expires_at,
                } => {
                    let mut inst = ItemInstance::new(item_type.clone(), identity.clone(), now);
                    inst.expires_at = *expires_at;
                    insert_instance(&mut tx, &inst).await?;
                    out.added.push(inst.instance_id);
                }
                ItemOp::Remove { instance_id } => {
                    let deleted: Option<(Uuid,)> = sqlx::query_as(
                        r#"
                        delete from item_instances
                        where instance_id = $1 and owner = $2 and locked = false
                        returning instance_id
                        "#,
                    )
                    .bind(instance_id)
                    .bind(identity.as_str())
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx(OP, e))?;

                    if deleted.is_some() {
                        out.removed.push(*instance_id);
                        continue;
                    }

                    let probe: Option<(String, bool)> = sqlx::query_as(
                        "select owner, locked from item_instances where instance_id = $1",
                    )
                    .bind(instance_id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx(OP, e))?;
                    let reason = match probe {
                        Some((o, true)) if o == identity.as_str() => RefusalReason::Locked,
                        _ => RefusalReason::NotOwned,
                    };
                    out.refused.push(RemoveRefusal {
                        instance_id: *instance_id,
                        reason,
                    });
                }
            }
        }

        tx.commit().await.map_err(|e| map_sqlx(OP, e))?;
        Ok(out)
    }

    async fn set_instance_lock(
        &self,
        identity: &Identity,
        instance_id: Uuid,
        locked: bool,
    ) -> Result<ItemInstance, StoreError> {
        let row = sqlx::query(&format!(
            "update item_instances set locked = $3 where instance_id = $1 and owner = $2 returning {INSTANCE_COLS}"
        ))
        .bind(instance_id)
        .bind(identity.as_str())
        .bind(locked)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx("set_instance_lock", e))?;
        match row {
            Some(r) => instance_from_row(&r),
            None => Err(StoreError::NotFound(format!(
                "instance {instance_id} owned by {identity}"
            ))),
        }
    }
}

async fn insert_instance(
    tx: &mut Transaction<'static, Postgres>,
    inst: &ItemInstance,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        insert into item_instances (instance_id, owner, item_type, created_at, expires_at, locked)
        values ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(inst.instance_id)
    .bind(inst.owner.as_str())
    .bind(&inst.item_type)
    .bind(inst.created_at)
    .bind(inst.expires_at)
    .bind(inst.locked)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx("insert_instance", e))?;
    Ok(())
}

// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Postgres-backed [`Store`].
//!
//! Leases rely on `SELECT ... FOR UPDATE SKIP LOCKED`: a row held by another transaction is
//! simply invisible to the caller, so acquisition never waits on a peer. Progress upserts use
//! `ON CONFLICT (event_name) DO UPDATE` with `GREATEST` so a late writer cannot move a marker
//! backwards.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::upsert::excluded;
use diesel::{
    ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper, TextExpressionMethods,
};
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use rollup_relayer_pg_db::Db;
use rollup_relayer_schema::models::{
    EventProgressRow, L2BatchIndexRow, NewEventProgress, NewL2BlockBatchIndex,
    NewPendingSubmissionItem, NewProcessingJob, PendingSubmissionItemRow, ProcessingJobRow,
};
use rollup_relayer_schema::schema::{
    event_progress, l2_batch_index, l2_block_batch_index, pending_submission_items,
    processing_jobs,
};
use tracing::debug;

use super::{
    BatchIndexStore, EventProgressStore, PendingItemStore, ProcessingJobLease, Store,
    TransactionalWork,
};
use crate::error::{RelayerError, RelayerResult};
use crate::types::{
    EventProgress, ItemStatus, L2BatchIndex, PendingSubmissionItem, ProcessingJob,
};

diesel::define_sql_function! {
    fn greatest(
        a: diesel::sql_types::BigInt,
        b: diesel::sql_types::BigInt,
    ) -> diesel::sql_types::BigInt;
}

#[derive(Clone)]
pub struct PgStore {
    db: Db,
}

impl PgStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn run_in_transaction<W>(&self, work: &W) -> RelayerResult<W::Output>
    where
        W: TransactionalWork,
    {
        let mut conn = self
            .db
            .connect()
            .await
            .map_err(|e| {
                RelayerError::StorageUnavailable(format!("failed to get connection: {e}"))
            })?;
        let pg: &mut AsyncPgConnection = &mut conn;

        pg.transaction::<_, RelayerError, _>(|conn| {
            async move {
                let mut tx = PgStoreTx { conn };
                work.run(&mut tx).await
            }
            .scope_boxed()
        })
        .await
    }
}

/// Operations bound to one open Postgres transaction.
pub struct PgStoreTx<'c> {
    conn: &'c mut AsyncPgConnection,
}

impl PgStoreTx<'_> {
    fn conn(&mut self) -> &mut AsyncPgConnection {
        &mut *self.conn
    }
}

fn to_i64(value: u64, what: &str) -> RelayerResult<i64> {
    i64::try_from(value)
        .map_err(|_| RelayerError::Internal(format!("{what} {value} overflows i64")))
}

fn to_u64(value: i64, what: &str) -> RelayerResult<u64> {
    u64::try_from(value).map_err(|_| RelayerError::Decode(format!("negative {what} {value}")))
}

/// Escapes LIKE wildcards so job prefixes such as `l2_block_number_` match literally.
fn like_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

impl TryFrom<EventProgressRow> for EventProgress {
    type Error = RelayerError;

    fn try_from(row: EventProgressRow) -> Result<Self, Self::Error> {
        Ok(Self {
            last_processed_block: to_u64(row.last_processed_block, "block number")?,
            event_name: row.event_name,
            updated_at: row.updated_at,
        })
    }
}

impl From<ProcessingJobRow> for ProcessingJob {
    fn from(row: ProcessingJobRow) -> Self {
        Self {
            name: row.name,
            options: row.options,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

impl TryFrom<PendingSubmissionItemRow> for PendingSubmissionItem {
    type Error = RelayerError;

    fn try_from(row: PendingSubmissionItemRow) -> Result<Self, Self::Error> {
        Ok(Self {
            status: row.status.parse()?,
            family: row.family,
            id: row.item_id,
            payload: row.payload,
            created_at: row.created_at,
        })
    }
}

impl TryFrom<L2BatchIndexRow> for L2BatchIndex {
    type Error = RelayerError;

    fn try_from(row: L2BatchIndexRow) -> Result<Self, Self::Error> {
        Ok(Self {
            batch_index: to_u64(row.batch_index, "batch index")?,
            options: row.options,
            l1_verified_batch_tx_hash: row.l1_verified_batch_tx_hash,
        })
    }
}

#[async_trait]
impl EventProgressStore for PgStoreTx<'_> {
    async fn upsert_progress(
        &mut self,
        event_name: &str,
        block_number: u64,
    ) -> RelayerResult<EventProgress> {
        use event_progress::dsl;

        let row: EventProgressRow = diesel::insert_into(dsl::event_progress)
            .values(NewEventProgress {
                event_name,
                last_processed_block: to_i64(block_number, "block number")?,
                updated_at: Utc::now(),
            })
            .on_conflict(dsl::event_name)
            .do_update()
            .set((
                dsl::last_processed_block.eq(greatest(
                    dsl::last_processed_block,
                    excluded(dsl::last_processed_block),
                )),
                dsl::updated_at.eq(excluded(dsl::updated_at)),
            ))
            .returning(EventProgressRow::as_returning())
            .get_result(self.conn())
            .await?;

        debug!(
            "[ProgressStore] '{}' now at block {}",
            row.event_name, row.last_processed_block
        );
        row.try_into()
    }

    async fn get_progress(&mut self, event_name: &str) -> RelayerResult<Option<EventProgress>> {
        use event_progress::dsl;

        let row: Option<EventProgressRow> = dsl::event_progress
            .filter(dsl::event_name.eq(event_name))
            .select(EventProgressRow::as_select())
            .first(self.conn())
            .await
            .optional()?;
        row.map(TryInto::try_into).transpose()
    }

    async fn get_many_progress(&mut self, names: &[&str]) -> RelayerResult<Vec<EventProgress>> {
        use event_progress::dsl;

        let rows: Vec<EventProgressRow> = dsl::event_progress
            .filter(dsl::event_name.eq_any(names.to_vec()))
            .select(EventProgressRow::as_select())
            .load(self.conn())
            .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }
}

#[async_trait]
impl ProcessingJobLease for PgStoreTx<'_> {
    async fn ensure_job(&mut self, name: &str, options: &serde_json::Value) -> RelayerResult<()> {
        use processing_jobs::dsl;

        diesel::insert_into(dsl::processing_jobs)
            .values(NewProcessingJob { name, options })
            .on_conflict_do_nothing()
            .execute(self.conn())
            .await?;
        Ok(())
    }

    async fn try_acquire_job(&mut self, name: &str) -> RelayerResult<Option<ProcessingJob>> {
        use processing_jobs::dsl;

        let row: Option<ProcessingJobRow> = dsl::processing_jobs
            .filter(dsl::name.eq(name))
            .filter(dsl::updated_at.le(Utc::now()))
            .select(ProcessingJobRow::as_select())
            .for_update()
            .skip_locked()
            .first(self.conn())
            .await
            .optional()?;
        Ok(row.map(Into::into))
    }

    async fn try_acquire_job_by_prefix(
        &mut self,
        prefix: &str,
    ) -> RelayerResult<Option<ProcessingJob>> {
        use processing_jobs::dsl;

        let row: Option<ProcessingJobRow> = dsl::processing_jobs
            .filter(dsl::name.like(like_prefix(prefix)))
            .filter(dsl::updated_at.le(Utc::now()))
            .order(dsl::updated_at.asc())
            .select(ProcessingJobRow::as_select())
            .for_update()
            .skip_locked()
            .first(self.conn())
            .await
            .optional()?;
        Ok(row.map(Into::into))
    }

    async fn reacquire_job(
        &mut self,
        name: &str,
        claimed_until: DateTime<Utc>,
    ) -> RelayerResult<Option<ProcessingJob>> {
        use processing_jobs::dsl;

        let row: Option<ProcessingJobRow> = dsl::processing_jobs
            .filter(dsl::name.eq(name))
            .filter(dsl::updated_at.eq(claimed_until))
            .select(ProcessingJobRow::as_select())
            .for_update()
            .skip_locked()
            .first(self.conn())
            .await
            .optional()?;
        Ok(row.map(Into::into))
    }

    async fn touch_job(
        &mut self,
        name: &str,
        updated_at: DateTime<Utc>,
    ) -> RelayerResult<Option<ProcessingJob>> {
        use processing_jobs::dsl;

        let row: Option<ProcessingJobRow> =
            diesel::update(dsl::processing_jobs.filter(dsl::name.eq(name)))
                .set(dsl::updated_at.eq(updated_at))
                .returning(ProcessingJobRow::as_returning())
                .get_result(self.conn())
                .await
                .optional()?;
        Ok(row.map(Into::into))
    }

    async fn complete_job(&mut self, name: &str) -> RelayerResult<()> {
        use processing_jobs::dsl;

        diesel::delete(dsl::processing_jobs.filter(dsl::name.eq(name)))
            .execute(self.conn())
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PendingItemStore for PgStoreTx<'_> {
    async fn enqueue_item(
        &mut self,
        family: &str,
        id: &str,
        payload: &serde_json::Value,
    ) -> RelayerResult<()> {
        use pending_submission_items::dsl;

        diesel::insert_into(dsl::pending_submission_items)
            .values(NewPendingSubmissionItem {
                family,
                item_id: id,
                payload,
                status: ItemStatus::Pending.as_str(),
            })
            .on_conflict_do_nothing()
            .execute(self.conn())
            .await?;
        Ok(())
    }

    async fn pending_items(
        &mut self,
        family: &str,
        limit: usize,
    ) -> RelayerResult<Vec<PendingSubmissionItem>> {
        use pending_submission_items::dsl;

        let rows: Vec<PendingSubmissionItemRow> = dsl::pending_submission_items
            .filter(dsl::family.eq(family))
            .filter(dsl::status.eq(ItemStatus::Pending.as_str()))
            .order((dsl::created_at.asc(), dsl::item_id.asc()))
            .limit(to_i64(limit as u64, "limit")?)
            .select(PendingSubmissionItemRow::as_select())
            .load(self.conn())
            .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn set_items_status(
        &mut self,
        family: &str,
        ids: &[String],
        status: ItemStatus,
    ) -> RelayerResult<()> {
        use pending_submission_items::dsl;

        diesel::update(
            dsl::pending_submission_items
                .filter(dsl::family.eq(family))
                .filter(dsl::item_id.eq_any(ids)),
        )
        .set((
            dsl::status.eq(status.as_str()),
            dsl::updated_at.eq(Utc::now()),
        ))
        .execute(self.conn())
        .await?;
        Ok(())
    }
}

#[async_trait]
impl BatchIndexStore for PgStoreTx<'_> {
    async fn batch_index(&mut self, batch_index: u64) -> RelayerResult<Option<L2BatchIndex>> {
        use l2_batch_index::dsl;

        let row: Option<L2BatchIndexRow> = dsl::l2_batch_index
            .filter(dsl::batch_index.eq(to_i64(batch_index, "batch index")?))
            .select(L2BatchIndexRow::as_select())
            .first(self.conn())
            .await
            .optional()?;
        row.map(TryInto::try_into).transpose()
    }

    async fn link_block_to_batch(
        &mut self,
        l2_block_number: u64,
        batch_index: u64,
    ) -> RelayerResult<()> {
        let batch_index = to_i64(batch_index, "batch index")?;

        diesel::insert_into(l2_batch_index::table)
            .values(l2_batch_index::batch_index.eq(batch_index))
            .on_conflict_do_nothing()
            .execute(self.conn())
            .await?;

        diesel::insert_into(l2_block_batch_index::table)
            .values(NewL2BlockBatchIndex {
                l2_block_number: to_i64(l2_block_number, "block number")?,
                batch_index,
            })
            .on_conflict(l2_block_batch_index::l2_block_number)
            .do_update()
            .set(l2_block_batch_index::batch_index.eq(excluded(l2_block_batch_index::batch_index)))
            .execute(self.conn())
            .await?;
        Ok(())
    }

    async fn set_batch_options(
        &mut self,
        batch_index: u64,
        options: &serde_json::Value,
    ) -> RelayerResult<()> {
        use l2_batch_index::dsl;

        diesel::update(
            dsl::l2_batch_index.filter(dsl::batch_index.eq(to_i64(batch_index, "batch index")?)),
        )
        .set((
            dsl::options.eq(options),
            dsl::updated_at.eq(Utc::now()),
        ))
        .execute(self.conn())
        .await?;
        Ok(())
    }

    async fn set_batch_l1_verified_tx_hash(
        &mut self,
        batch_index: u64,
        tx_hash: &str,
    ) -> RelayerResult<()> {
        use l2_batch_index::dsl;

        diesel::update(
            dsl::l2_batch_index.filter(dsl::batch_index.eq(to_i64(batch_index, "batch index")?)),
        )
        .set((
            dsl::l1_verified_batch_tx_hash.eq(tx_hash),
            dsl::updated_at.eq(Utc::now()),
        ))
        .execute(self.conn())
        .await?;
        Ok(())
    }
}

// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::{
    event_progress, l2_batch_index, l2_block_batch_index, pending_submission_items,
    processing_jobs,
};

#[derive(Queryable, Selectable, Debug, Clone, PartialEq, Eq)]
#[diesel(table_name = event_progress, check_for_backend(diesel::pg::Pg))]
pub struct EventProgressRow {
    pub event_name: String,
    pub last_processed_block: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = event_progress)]
pub struct NewEventProgress<'a> {
    pub event_name: &'a str,
    pub last_processed_block: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Queryable, Selectable, Debug, Clone, PartialEq)]
#[diesel(table_name = processing_jobs, check_for_backend(diesel::pg::Pg))]
pub struct ProcessingJobRow {
    pub name: String,
    pub options: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = processing_jobs)]
pub struct NewProcessingJob<'a> {
    pub name: &'a str,
    pub options: &'a serde_json::Value,
}

#[derive(Queryable, Selectable, Debug, Clone, PartialEq)]
#[diesel(table_name = pending_submission_items, check_for_backend(diesel::pg::Pg))]
pub struct PendingSubmissionItemRow {
    pub family: String,
    pub item_id: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = pending_submission_items)]
pub struct NewPendingSubmissionItem<'a> {
    pub family: &'a str,
    pub item_id: &'a str,
    pub payload: &'a serde_json::Value,
    pub status: &'a str,
}

#[derive(Queryable, Selectable, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[diesel(table_name = l2_batch_index, check_for_backend(diesel::pg::Pg))]
pub struct L2BatchIndexRow {
    pub batch_index: i64,
    pub options: Option<serde_json::Value>,
    pub l1_verified_batch_tx_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = l2_block_batch_index)]
pub struct NewL2BlockBatchIndex {
    pub l2_block_number: i64,
    pub batch_index: i64,
}

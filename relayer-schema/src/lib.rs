// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Diesel schema and row models for the relayer's coordination tables.

use diesel_migrations::{embed_migrations, EmbeddedMigrations};

pub mod models;
pub mod schema;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

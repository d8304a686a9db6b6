// Copyright (c) Custodia, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Relational schema for the custodial engine: account rows, the append-only
//! ledger transaction journal, and the embedded migrations that create them.

use diesel_migrations::{embed_migrations, EmbeddedMigrations};

pub mod models;
pub mod schema;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

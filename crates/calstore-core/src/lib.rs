//! # Calstore Core Library
//!
//! Reconciles recurring calendar entities (events and tasks) parsed from calendar data
//! and persists them into a local tabular store.
//!
//! ## Features
//!
//! - **Series Resolution**: Groups masters and date-specific exceptions by identity,
//!   keeping the highest sequence of duplicates
//! - **Timezone Normalization**: Resolves zone identifiers leniently and substitutes a
//!   default zone without moving the instant
//! - **Entity Mapping**: Bidirectional conversion between entities and store rows with
//!   explicit correction policies
//! - **Batched Persistence**: Back-referencing write batches that split themselves when
//!   the store refuses a transaction as too large
//!
//! ## Core Modules
//!
//! - [`component`]: Parsed component property bags and entity construction
//! - [`timezone`]: Temporal value normalization
//! - [`recurrence`]: Grouping of components into series
//! - [`validation`]: Repairs applied to resolved series
//! - [`mapping`]: Entity to row conversion, per entity kind
//! - [`batch`]: Write intents and the splitting commit
//! - [`store`]: The store contract plus in-memory and SQLite stores
//! - [`repository`]: Series-level access to a store
//! - [`config`]: Configuration loading
//! - [`error`]: Error types
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use calstore_core::{
//!     component::RawComponent,
//!     config::Config,
//!     mapping::MappingContext,
//!     recurrence::Resolver,
//!     repository::{LocalCollection, Repository},
//!     store::SqliteStore,
//!     timezone::TimeNormalizer,
//! };
//!
//! fn main() -> Result<(), calstore_core::error::CoreError> {
//!     let config = Config::new()?;
//!     let store = SqliteStore::from_config(&config.storage)?;
//!     let mut collection = LocalCollection::new(store, MappingContext::from_config(&config.mapping));
//!
//!     let resolver = Resolver::new(TimeNormalizer::new(config.mapping.default_zone()));
//!     let components = vec![RawComponent::event()
//!         .with("UID", "standup")
//!         .with("DTSTART", "20240501T090000Z")
//!         .with("RRULE", "FREQ=DAILY")];
//!
//!     let report = collection.import(&resolver, components)?;
//!     println!("Imported {} series", report.inserted.len());
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod component;
pub mod config;
pub mod db;
pub mod duration;
pub mod error;
pub mod mapping;
pub mod models;
pub mod recurrence;
pub mod repository;
pub mod store;
pub mod timezone;
pub mod validation;

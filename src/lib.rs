//! # outpay
//!
//! An outgoing payment engine for a streaming micro-payment network.
//! Payments are admitted through the command API, priced by a rate probe,
//! approved and funded, then streamed to the destination by a pool of
//! workers that drive a crash-safe, idempotent lifecycle state machine over
//! exclusively locked rows.
//!
//! The engine depends only on capability ports (accounting, rates,
//! streaming, sub-accounts, plugins, clock); wire real adapters or the
//! bundled simulator into `Dependencies` and hand the record to
//! `OutgoingPayments` and `WorkerPool`.

pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;

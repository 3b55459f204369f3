//! Deterministic transaction-execution engine.
//!
//! This crate holds the data structures and single-threaded components the
//! node pipeline is built from: the transaction model, ordered-log helpers,
//! the deterministic lock manager, the remaster manager, storage seams, and
//! the wire message sum. It is deliberately free of networking and runtime
//! concerns; the node crate wires these pieces into cooperative tasks.

pub mod async_log;
pub mod batch_log;
pub mod commands;
pub mod config;
pub mod holder;
pub mod lock_manager;
pub mod messages;
pub mod remaster;
pub mod storage;
pub mod txn;
pub mod types;

pub use async_log::AsyncLog;
pub use batch_log::{BatchLog, LocalLog};
pub use commands::{Commands, KeyValueCommands};
pub use config::{Config, ConfigFile, ConfigPtr};
pub use holder::TxnHolder;
pub use lock_manager::{DeterministicLockManager, LockState};
pub use messages::{ApiRequest, ApiResponse, Batch, Envelope, ForwardBatch, Message, Request, Response};
pub use remaster::{check_counters, RemasterManager, RemasterOccurredResult, VerifyMasterResult};
pub use storage::{MasterLookup, MemStorage, Storage};
pub use txn::{Procedure, Transaction, TransactionStatus, TransactionType};

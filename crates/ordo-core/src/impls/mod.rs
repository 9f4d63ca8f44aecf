//! Impls - ports の実装（開発用・テスト用）
//!
//! # 含まれる実装
//! - **InMemoryTaskStore**: TaskStore（楽観ロック + 依存関係 index）
//! - **InMemoryBroker / InMemoryConnection**: Transport（AMQP 相当の priority / TTL / dead-letter / tx）

pub mod memory_broker;
pub mod memory_store;

pub use self::memory_broker::{InMemoryBroker, InMemoryConnection};
pub use self::memory_store::InMemoryTaskStore;

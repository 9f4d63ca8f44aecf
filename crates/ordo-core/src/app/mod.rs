//! App - アプリケーション層
//!
//! ports を組み合わせてスケジューリングエンジンを構成します。
//!
//! # 主要コンポーネント
//! - **Worker**: 配送 → gate → execute → retry/complete/recurrence の状態機械
//! - **WorkerGroup**: N 個の Worker を起動・停止
//! - **TaskService**: API 層向けの操作（作成・依存関係・実行順序）
//! - **health**: broker / store の疎通確認

pub mod health;
pub mod service;
pub mod worker;
pub mod worker_group;

pub use self::health::{HealthReport, HealthStatus};
pub use self::service::{ServiceError, TaskService};
pub use self::worker::{ProcessOutcome, Worker, WorkerSettings};
pub use self::worker_group::WorkerGroup;

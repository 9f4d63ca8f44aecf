//! ordo-core
//!
//! Dependency-aware task scheduling on top of a durable message queue.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, envelope, decision, errors）
//! - **graph**: 依存グラフ（トポロジカルソート、循環検出）
//! - **ports**: 抽象化レイヤー（TaskStore, Transport, Clock, TaskExecutor, IdGenerator）
//! - **impls**: 実装（InMemoryTaskStore, InMemoryBroker）
//! - **queue**: TaskQueue（publish / submit / consume）
//! - **app**: Worker, WorkerGroup, TaskService, health
//! - **config**: TOML 設定
//! - **observability**: status counts

pub mod app;
pub mod config;
pub mod domain;
pub mod graph;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod queue;

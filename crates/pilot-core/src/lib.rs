//! pilot-core
//!
//! Task and job lifecycle over a shared, revisioned document store.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, job, state）
//! - **ports**: 抽象化レイヤー（DocumentStore, Clock, IdGenerator, JobLauncher）
//! - **app**: アプリケーションロジック（context, iterator, worker_loop, scrubber, ...）
//! - **impls**: 実装（InMemoryStore, CouchStore, WebDav, views）
//! - **submit**: ジョブ投入バックエンド（ssh, local, osmium, xenon）
//! - **config**: `pilot.toml`
//! - **observability**: ビューごとの件数

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod submit;

pub use crate::app::Context;
pub use crate::config::Config;
pub use crate::error::{PilotError, Result};

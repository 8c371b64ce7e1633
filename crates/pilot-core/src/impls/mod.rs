//! Impls - ports の実装
//!
//! - **InMemoryStore**: テスト・ローカル実行用のドキュメントストア
//! - **CouchStore**: 本番用 (CouchDB over HTTP)
//! - **WebDav**: 添付ファイルの外部保存先
//! - **views**: 両ストアが共有するビュー定義

pub mod couchdb;
pub mod memory_store;
pub mod views;
pub mod webdav;

use std::sync::Arc;

use crate::config::DatabaseConfig;
use crate::error::Result;
use crate::ports::DocumentStore;

pub use self::couchdb::CouchStore;
pub use self::memory_store::InMemoryStore;
pub use self::webdav::WebDav;

/// Open the store a database section points at.
pub fn open_store(config: &DatabaseConfig) -> Result<Arc<dyn DocumentStore>> {
    if config.is_memory() {
        return Ok(Arc::new(InMemoryStore::new(config.database.clone())));
    }
    Ok(Arc::new(CouchStore::new(config)?))
}

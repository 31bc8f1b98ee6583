//! Catalogue entities and their store operations. Relations are expressed
//! through integer ids only; chasing a relation is a store query, never a
//! pointer dereference, so handles can be freely sent across workers.

pub mod album;
pub mod artist;
pub mod device;
pub mod file;
pub mod folder;
pub mod genre;
pub mod group;
pub mod media;
pub mod playlist;
pub mod show;
pub mod subscription;
pub mod task;
pub mod thumbnail;
pub mod track;

/// Seconds since the unix epoch, the timestamp format used across the
/// schema.
pub fn timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

//! Simperium Client - Rust SDK for Simperium data synchronization
//!
//! This crate provides:
//! - Buckets of JSON objects with local queries and change listeners
//! - Per bucket channels that download the index and exchange diffs
//! - A websocket manager with heartbeats and reconnects
//! - User authorization against the Simperium auth service
//! - In-memory and JSON file stores for objects, ghosts and queued changes

pub mod auth;
pub mod bucket;
pub mod channel;
pub mod config;
pub mod error;
pub mod session;
pub mod simperium;
pub mod storage;
pub mod user;
pub mod websocket;

// Client re-exports
pub use config::SimperiumConfig;
pub use error::{ClientError, Result};
pub use simperium::{Simperium, Stores};

// Bucket re-exports
pub use bucket::{
    Bucket, BucketListener, BucketObject, BucketSchema, ChangeType, ComparisonType, Query, QueryRow,
    RevisionsCallbacks, SortType,
};

// Additional re-exports
pub use auth::{AuthClient, AuthError, AuthFailure, AuthProvider, UserStore};
pub use user::{Credentials, User, UserStatus, UserStatusListener};
pub use websocket::{ConnectionProvider, ConnectionStatus, WebSocketManager};

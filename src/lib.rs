//! # tiercache
//!
//! A two-tier read-through response cache for async HTTP/1.1 services: a
//! bounded in-process tier in front of a shared Redis tier, wired into the
//! request path as middleware.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tiercache::cache::Cache;
//! use tiercache::config::CacheConfig;
//! use tiercache::middleware::{LoggerMiddleware, Pipeline};
//! use tiercache::server::Server;
//! use tiercache::{Response, StatusCode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cache = Arc::new(Cache::connect(&CacheConfig::load(None)?).await?);
//!     let pipeline = Pipeline::new()
//!         .layer(LoggerMiddleware)
//!         .layer(cache.middleware())
//!         .handler(|_ctx| async { Response::new(StatusCode::Ok).body("expensive") });
//!
//!     let server = Server::bind("127.0.0.1:8080").await?;
//!     server
//!         .serve_pipeline(pipeline, async { tokio::signal::ctrl_c().await.ok(); })
//!         .await?;
//!     cache.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod context;
pub mod http;
pub mod middleware;
pub mod server;

pub use http::{Headers, Method, Request, Response, StatusCode};
pub use server::{Server, ServerError};

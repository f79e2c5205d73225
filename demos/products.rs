//! A small products API behind the two-tier cache.
//!
//! ```text
//! cargo run --example products
//! curl -i 'localhost:8080/products?page=1'        # X-Cache: MISS
//! curl -i 'localhost:8080/products?page=1'        # X-Cache: HIT-LOCAL
//! curl -X POST -d '{"name":"lamp","price":19.5}' localhost:8080/products
//! curl -i 'localhost:8080/products?page=1'        # X-Cache: MISS again
//! curl localhost:8080/cache/stats
//! ```
//!
//! Set `CACHE__REMOTE__ENABLED=true` (and `CACHE__REMOTE__URL`) to put Redis
//! behind the local tier; `CACHE_CONFIG` points at an optional TOML file.
//! An `X-User` header stands in for authentication.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing_subscriber::EnvFilter;

use tiercache::cache::{Cache, CachePolicy};
use tiercache::config::CacheConfig;
use tiercache::context::{CallerIdentity, Context};
use tiercache::middleware::{LoggerMiddleware, Middleware, Next, Pipeline, ResponseFuture};
use tiercache::{Method, Response, Server, StatusCode};

const PAGE_SIZE: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Product {
    #[serde(default)]
    id: u64,
    name: String,
    price: f64,
}

#[derive(Default)]
struct Catalog {
    products: RwLock<Vec<Product>>,
}

/// Copies `X-User` into the context as the caller identity.
struct HeaderAuth;

impl Middleware for HeaderAuth {
    fn handle(&self, mut ctx: Context, next: Next) -> ResponseFuture {
        Box::pin(async move {
            if let Some(user) = ctx.request().headers().get("x-user").map(str::to_owned) {
                ctx.extensions_mut().insert(CallerIdentity::new(user));
            }
            next.run(ctx).await
        })
    }
}

async fn route(ctx: Context, catalog: Arc<Catalog>, cache: Arc<Cache>) -> Response {
    let request = ctx.request();
    match (request.method(), request.path()) {
        (Method::Get, "/products") => {
            let page: usize = request
                .query_param("page")
                .and_then(|p| p.parse().ok())
                .unwrap_or(1)
                .max(1);
            // Stand-in for a slow query.
            tokio::time::sleep(Duration::from_millis(50)).await;
            let products = catalog.products.read().await;
            let items: Vec<&Product> = products
                .iter()
                .skip((page - 1) * PAGE_SIZE)
                .take(PAGE_SIZE)
                .collect();
            json(&serde_json::json!({ "page": page, "total": products.len(), "items": items }))
        }
        (Method::Post, "/products") => {
            let mut product: Product = match ctx.json() {
                Ok(product) => product,
                Err(e) => {
                    return Response::new(StatusCode::BadRequest).body(format!("invalid product: {e}"));
                }
            };
            {
                let mut products = catalog.products.write().await;
                product.id = products.len() as u64 + 1;
                products.push(product.clone());
            }
            let report = cache.invalidate("products").await;
            tracing::info!(
                local_removed = report.local_removed,
                remote_removed = ?report.remote_removed,
                "product created, cache invalidated"
            );
            match Response::json(&product) {
                Ok(response) => response.header("Location", format!("/products/{}", product.id)),
                Err(e) => internal_error(e),
            }
        }
        (Method::Get, "/cache/stats") => json(&cache.stats().snapshot().await),
        (_, "/products" | "/cache/stats") => Response::new(StatusCode::MethodNotAllowed),
        _ => Response::new(StatusCode::NotFound).body("not found"),
    }
}

fn json<T: Serialize + ?Sized>(value: &T) -> Response {
    Response::json(value).unwrap_or_else(internal_error)
}

fn internal_error(e: serde_json::Error) -> Response {
    tracing::error!(error = %e, "failed to encode response");
    Response::new(StatusCode::InternalServerError)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("failed to load .env: {e}");
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tiercache=debug")),
        )
        .init();

    let config_path = std::env::var_os("CACHE_CONFIG").map(PathBuf::from);
    let config = CacheConfig::load(config_path.as_deref())?;
    let cache = Arc::new(Cache::connect(&config).await?);

    let catalog = Arc::new(Catalog::default());
    {
        let mut products = catalog.products.write().await;
        for (i, name) in ["desk", "chair", "shelf"].into_iter().enumerate() {
            products.push(Product {
                id: i as u64 + 1,
                name: name.to_string(),
                price: 49.0 + i as f64 * 10.0,
            });
        }
    }

    // Listings for three minutes, stats always live, everything else per config.
    let policy = CachePolicy::from_config(&config.policy)
        .route("/products", Duration::from_secs(180))
        .exclude("/cache");
    let cache_layer = tiercache::cache::CacheMiddleware::new(Arc::clone(cache.coordinator()), policy);

    let origin_cache = Arc::clone(&cache);
    let pipeline = Pipeline::new()
        .layer(LoggerMiddleware)
        .layer(HeaderAuth)
        .layer(cache_layer)
        .handler(move |ctx| route(ctx, Arc::clone(&catalog), Arc::clone(&origin_cache)));

    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    let server = Server::bind(&addr).await?;
    tracing::info!("products demo on http://{}", server.local_addr());

    server
        .serve_pipeline(pipeline, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
        })
        .await?;

    cache.shutdown().await;
    Ok(())
}

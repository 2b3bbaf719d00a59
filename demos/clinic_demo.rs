//! Demonstrates the cache in front of a small in-process clinic backend
//!
//! This example shows how to:
//! - Register typed and closure operations
//! - Configure per-operation categories and debouncing
//! - Coalesce concurrent fetches and serve repeats from cache
//! - Persist results across restarts with a file store
//!
//! Run with `cargo run --example clinic_demo`; set `RPC_CACHE_DIR` to choose
//! where the durable tier lives.

use async_trait::async_trait;
use rpc_cache::{
    logging, CacheConfig, Category, DurableStore, FetchOptions, FileStore, OperationHandler,
    OperationPolicy, OperationRegistry, Orchestrator, RemoteError,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Deserialize)]
struct GetDoctorArgs {
    id: u32,
}

#[derive(Serialize)]
struct Doctor {
    id: u32,
    name: String,
    specialty: String,
}

struct GetDoctor;

#[async_trait]
impl OperationHandler for GetDoctor {
    type Args = GetDoctorArgs;
    type Output = Doctor;

    async fn handle(&self, args: GetDoctorArgs, _identity: Option<&str>) -> Result<Doctor, RemoteError> {
        tokio::time::sleep(Duration::from_millis(150)).await;
        match args.id {
            1 => Ok(Doctor {
                id: 1,
                name: "Dr. Ada Park".to_string(),
                specialty: "cardiology".to_string(),
            }),
            id => Err(RemoteError::with_code(
                "getDoctor",
                "NOT_FOUND",
                format!("doctor {} does not exist", id),
            )),
        }
    }
}

fn registry() -> OperationRegistry {
    OperationRegistry::builder()
        .register("getDoctor", GetDoctor)
        .register_fn("findDoctors", |args: Value, _identity: Option<String>| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, RemoteError>(json!({
                "specialty": args["specialty"],
                "doctors": [{ "id": 1, "name": "Dr. Ada Park" }],
            }))
        })
        .register_fn("listAppointments", |_: Value, identity: Option<String>| async move {
            let patient = identity.ok_or_else(|| {
                RemoteError::with_code("listAppointments", "UNAUTHENTICATED", "sign in first")
            })?;
            Ok::<_, RemoteError>(json!({ "patient": patient, "appointments": [] }))
        })
        .build()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let dir = std::env::var("RPC_CACHE_DIR")
        .unwrap_or_else(|_| std::env::temp_dir().join("rpc-cache-demo").display().to_string());

    let config = CacheConfig::builder()
        .operation("getDoctor", OperationPolicy::public(Category::Profile))
        .operation(
            "findDoctors",
            OperationPolicy::public(Category::Listing).debounced(Duration::from_millis(300)),
        )
        .operation("listAppointments", OperationPolicy::new(Category::Message))
        .build();

    let store: Arc<dyn DurableStore> = Arc::new(FileStore::open(&dir).await?);
    let cache: Orchestrator = Orchestrator::init(config, Arc::new(registry()), Some(store)).await?;
    cache.spawn_maintenance();
    println!("Cache ready (durable tier at {})\n", dir);

    // 1. Concurrent identical fetches share one remote call
    println!("1. Five concurrent findDoctors calls...");
    let args = json!({ "specialty": "cardiology" });
    let started = Instant::now();
    let results = futures::future::join_all(
        (0..5).map(|_| cache.fetch("findDoctors", &args, None, FetchOptions::new())),
    )
    .await;
    println!(
        "   {} results in {:?}, remote calls so far: {}\n",
        results.len(),
        started.elapsed(),
        cache.stats().await.remote_calls
    );

    // 2. Repeat fetch is a cache hit
    println!("2. Fetching a doctor twice...");
    for _ in 0..2 {
        let started = Instant::now();
        let doctor = cache
            .fetch("getDoctor", &json!({ "id": 1 }), None, FetchOptions::new())
            .await?;
        println!("   {} in {:?}", doctor["name"], started.elapsed());
    }
    println!();

    // 3. Remote errors come back unchanged and are not cached
    println!("3. Fetching a missing doctor...");
    match cache
        .fetch("getDoctor", &json!({ "id": 42 }), None, FetchOptions::new())
        .await
    {
        Ok(doctor) => println!("   unexpected: {}", doctor),
        Err(e) => println!("   error: {} (code {:?})\n", e, e.code()),
    }

    // 4. Identity-scoped results
    println!("4. Appointments per patient...");
    for patient in ["patient-1", "patient-2"] {
        let appointments = cache
            .fetch("listAppointments", &Value::Null, Some(patient), FetchOptions::new())
            .await?;
        println!("   {} -> {}", patient, appointments);
    }
    println!();

    // 5. Invalidation
    println!("5. Invalidating the listing category...");
    let events = cache.invalidate(Category::Listing).await;
    for event in events {
        println!("   {} tier: {} entries ({})", event.tier, event.len(), event.reason);
    }

    println!("\n{}", cache.stats().await);
    Ok(())
}

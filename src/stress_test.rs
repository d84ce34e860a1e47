use async_stream::stream;
use futures::stream::Stream;
use futures::stream::StreamExt;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rbx_core::{raw, Comparator, ComponentOptions, Head};
use rbx_cud::{apply_package, CudId, CudOperation, CudPackage};
use rbx_sdk::{Client, ClientConfigBuilder, ClientError, DataboxConfig, DataboxEvent, MemoryTransport};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

/// Statistics collected during a convergence run
#[derive(Clone, Debug)]
pub struct StressTestStats {
    pub scenario: &'static str,
    pub num_replicas: usize,
    pub packages: usize,
    pub deliveries: usize,
    pub total_time: Duration,
    pub deliveries_per_second: f64,
    /// Every replica ended with the data of in-order delivery.
    pub converged: bool,
}

impl StressTestStats {
    pub fn print(&self) {
        println!("\n╔════════════════════════════════════════════════════════════╗");
        println!("║              Convergence Statistics                        ║");
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║  Scenario:                  {:>30} ║", self.scenario);
        println!("║  Number of Replicas:        {:>30} ║", self.num_replicas);
        println!("║  Cud Packages:              {:>30} ║", self.packages);
        println!("║  Deliveries:                {:>30} ║", self.deliveries);
        println!("║  Total Time:                {:>29}s ║", format!("{:.3}", self.total_time.as_secs_f64()));
        println!("║  Deliveries/Second:         {:>30.0} ║", self.deliveries_per_second);
        println!("║  Converged:                 {:>30} ║", if self.converged { "yes" } else { "NO" });
        println!("╚════════════════════════════════════════════════════════════╝");
    }
}

/// Snapshot every replica starts from: a keyed object of counters.
fn base_snapshot(num_keys: usize) -> Value {
    let entries: Map<String, Value> = (0..num_keys)
        .map(|k| (format!("counter-{}", k), json!(0)))
        .collect();
    raw::keyed_object(entries)
}

/// Server history of commuting writes.
///
/// Each package updates a random counter with a fresh timestamp and inserts
/// one new entry, so delivery order and duplicates cannot change the outcome.
fn server_history(num_keys: usize, num_packages: usize, seed: u64) -> Vec<CudPackage> {
    let mut rng = StdRng::seed_from_u64(seed);
    (1..=num_packages as u64)
        .map(|id| {
            let counter = format!("counter-{}", rng.gen_range(0..num_keys));
            let operations = vec![
                CudOperation::update([counter], json!(rng.gen_range(0..10_000))),
                CudOperation::insert([format!("entry-{}", id)], json!({"package": id})),
            ];
            CudPackage::new(CudId(id), id, operations)
        })
        .collect()
}

/// Ranked items inserted into a sorted keyed array; ranks are unique.
fn ranked_history(num_packages: usize, seed: u64) -> Vec<CudPackage> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut ranks: Vec<u64> = (0..num_packages as u64).collect();
    ranks.shuffle(&mut rng);
    ranks
        .into_iter()
        .enumerate()
        .map(|(i, rank)| {
            let id = i as u64 + 1;
            let key = format!("item-{}", id);
            let item = json!({"id": key, "rank": rank});
            CudPackage::new(CudId(id), id, vec![CudOperation::insert([key], item)])
        })
        .collect()
}

/// Generator yielding a shuffled delivery order with random duplicates
fn delivery_stream(
    packages: Arc<Vec<CudPackage>>,
    duplicate_rate: f64,
    seed: u64,
) -> impl Stream<Item = CudPackage> {
    stream! {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut order: Vec<usize> = (0..packages.len()).collect();
        order.shuffle(&mut rng);
        for idx in order {
            yield packages[idx].clone();
            if rng.gen_bool(duplicate_rate) {
                yield packages[idx].clone();
            }
        }
    }
}

fn reference(snapshot: &Value, options: &ComponentOptions, packages: &[CudPackage]) -> Value {
    let mut head = Head::from_raw(snapshot.clone(), options.clone());
    for package in packages {
        apply_package(&mut head, package, true);
    }
    head.data()
}

/// Deliver the history to every replica in its own shuffled order and
/// compare the results with in-order delivery.
async fn replicate(
    scenario: &'static str,
    snapshot: Value,
    options: ComponentOptions,
    packages: Vec<CudPackage>,
    num_replicas: usize,
    duplicate_rate: f64,
) -> StressTestStats {
    let start = Instant::now();
    let expected = reference(&snapshot, &options, &packages);
    let packages = Arc::new(packages);

    let replicas: Vec<Arc<Mutex<Head>>> = (0..num_replicas)
        .map(|_| Arc::new(Mutex::new(Head::from_raw(snapshot.clone(), options.clone()))))
        .collect();

    println!("\n[Phase 1/2] Delivering packages to replicas...");

    let mut handles = vec![];
    for (idx, replica) in replicas.iter().enumerate() {
        let replica = Arc::clone(replica);
        let packages = Arc::clone(&packages);
        let handle = tokio::spawn(async move {
            let mut deliveries = Box::pin(delivery_stream(packages, duplicate_rate, idx as u64));
            let mut delivered = 0usize;
            while let Some(package) = deliveries.next().await {
                let mut head = replica.lock().await;
                apply_package(&mut head, &package, true);
                drop(head);

                delivered += 1;
                if delivered % 100 == 0 {
                    tokio::task::yield_now().await;
                }
            }
            delivered
        });
        handles.push(handle);
    }

    let mut deliveries = 0;
    for handle in handles {
        deliveries += handle.await.unwrap_or_default();
    }

    println!("[Phase 1/2] ✓ Completed");
    println!("[Phase 2/2] Comparing replicas...");

    let mut converged = true;
    for (idx, replica) in replicas.iter().enumerate() {
        if replica.lock().await.data() != expected {
            info!(replica = idx, scenario, "replica diverged");
            converged = false;
        }
    }

    let total_time = start.elapsed();
    println!("[Phase 2/2] ✓ Completed");

    StressTestStats {
        scenario,
        num_replicas,
        packages: packages.len(),
        deliveries,
        total_time,
        deliveries_per_second: deliveries as f64 / total_time.as_secs_f64(),
        converged,
    }
}

/// Shuffled, duplicated delivery to keyed-object replicas
pub async fn stress_test_object(
    num_replicas: usize,
    num_packages: usize,
    duplicate_rate: f64,
) -> StressTestStats {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║        Keyed Object Convergence                            ║");
    println!("║  Replicas: {} | Packages: {} | Duplicates: {:.0}% ║",
             num_replicas, num_packages, duplicate_rate * 100.0);
    println!("╚════════════════════════════════════════════════════════════╝");

    let num_keys = (num_packages / 10).max(1);
    replicate(
        "keyed object",
        base_snapshot(num_keys),
        ComponentOptions::default(),
        server_history(num_keys, num_packages, 42),
        num_replicas,
        duplicate_rate,
    )
    .await
}

/// Shuffled, duplicated delivery to sorted keyed-array replicas
pub async fn stress_test_sorted(
    num_replicas: usize,
    num_packages: usize,
    duplicate_rate: f64,
) -> StressTestStats {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║        Sorted Keyed Array Convergence                      ║");
    println!("║  Replicas: {} | Packages: {} | Duplicates: {:.0}% ║",
             num_replicas, num_packages, duplicate_rate * 100.0);
    println!("╚════════════════════════════════════════════════════════════╝");

    replicate(
        "sorted keyed array",
        raw::key_array(Vec::new(), "id", None),
        ComponentOptions::default().with_comparator(Comparator::by_field("rank")),
        ranked_history(num_packages, 7),
        num_replicas,
        duplicate_rate,
    )
    .await
}

/// Wait until `target` data changes were reported.
async fn wait_for_changes(
    events: &mut broadcast::Receiver<DataboxEvent>,
    seen: &mut usize,
    target: usize,
) -> rbx_sdk::Result<()> {
    while *seen < target {
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Ok(DataboxEvent::DataChanged)) => *seen += 1,
            Ok(Ok(_)) => {}
            Ok(Err(err)) => return Err(ClientError::InvalidState(err.to_string())),
            Err(_) => return Err(ClientError::Timeout(rbx_sdk::TimeoutKind::Response)),
        }
    }
    Ok(())
}

/// Push the shuffled history through a databox session over the in-memory
/// transport.
pub async fn stress_test_session(num_packages: usize, duplicate_rate: f64) -> rbx_sdk::Result<StressTestStats> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║        Databox Session Push Convergence                    ║");
    println!("║  Packages: {} | Duplicates: {:.0}% ║", num_packages, duplicate_rate * 100.0);
    println!("╚════════════════════════════════════════════════════════════╝");

    let start = Instant::now();
    let num_keys = (num_packages / 10).max(1);
    let snapshot = base_snapshot(num_keys);
    let packages = server_history(num_keys, num_packages, 1337);
    let expected = reference(&snapshot, &ComponentOptions::default(), &packages);

    let handshake = json!({"ci": 0, "i": "in", "o": "out", "d": snapshot});
    let transport = Arc::new(MemoryTransport::connected().with_responder(move |event, _payload| {
        Ok(if event == ">D" { handshake.clone() } else { Value::Null })
    }));
    let config = ClientConfigBuilder::new().event_buffer(1024).build();
    let client = Client::new(Arc::clone(&transport), config);
    let databox = client.databox("simulation", DataboxConfig::default());
    let mut events = databox.subscribe();
    databox.connect().await?;

    // Every first delivery inserts an entry, so it reports exactly one change.
    let mut deliveries = Box::pin(delivery_stream(Arc::new(packages), duplicate_rate, 99));
    let mut unique: HashSet<CudId> = HashSet::new();
    let mut delivered = 0usize;
    let mut seen = 0usize;
    while let Some(package) = deliveries.next().await {
        unique.insert(package.id);
        transport.deliver("out", json!({"a": 0, "d": package.to_value()?}));
        delivered += 1;
        // Stay below the transport's event buffer.
        if delivered % 64 == 0 {
            wait_for_changes(&mut events, &mut seen, unique.len()).await?;
        }
    }
    wait_for_changes(&mut events, &mut seen, unique.len()).await?;
    debug!(delivered, last_cud_id = %databox.last_cud_id(), "session push finished");

    let converged = databox.data() == expected && databox.last_cud_id() == CudId(num_packages as u64);
    databox.disconnect().await?;

    let total_time = start.elapsed();
    Ok(StressTestStats {
        scenario: "databox session",
        num_replicas: 1,
        packages: num_packages,
        deliveries: delivered,
        total_time,
        deliveries_per_second: delivered as f64 / total_time.as_secs_f64(),
        converged,
    })
}

/// Object convergence at growing replica counts
pub async fn stress_test_scaling(max_replicas: usize, step_size: usize) -> bool {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║      Scaling Analysis - Convergence vs Replicas            ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    let mut all_converged = true;
    let mut current_replicas = step_size;
    while current_replicas <= max_replicas {
        let stats = stress_test_object(current_replicas, current_replicas * 50, 0.2).await;
        stats.print();
        all_converged &= stats.converged;
        current_replicas += step_size;
    }
    all_converged
}

use stress_test::{stress_test_object, stress_test_scaling, stress_test_session, stress_test_sorted};
use tracing_subscriber::EnvFilter;
pub mod stress_test;

fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    let converged = rt.block_on(async_main());
    if !converged {
        std::process::exit(1);
    }
    Ok(())
}

async fn async_main() -> bool {
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            CONVERGENCE STRESS TESTS                        ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    let mut converged = true;

    // Test 1: keyed object, small scale
    let stats = stress_test_object(4, 200, 0.2).await;
    stats.print();
    converged &= stats.converged;

    // Test 2: sorted keyed array, small scale
    let stats = stress_test_sorted(4, 200, 0.2).await;
    stats.print();
    converged &= stats.converged;

    // Test 3: keyed object, medium scale
    let stats = stress_test_object(10, 2000, 0.3).await;
    stats.print();
    converged &= stats.converged;

    // Test 4: pushes through a databox session
    match stress_test_session(1000, 0.2).await {
        Ok(stats) => {
            stats.print();
            converged &= stats.converged;
        }
        Err(err) => {
            println!("\n✗ Session stress test failed: {}", err);
            converged = false;
        }
    }

    // Test 5: scaling analysis
    converged &= stress_test_scaling(20, 5).await;

    if converged {
        println!("\n✓ All replicas converged!");
    } else {
        println!("\n✗ Some replicas diverged");
    }
    converged
}

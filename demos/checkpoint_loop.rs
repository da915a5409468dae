//! Demo checkpoint loop: a growing deployment persisted against the in-memory backend

use bytes::Bytes;
use checkpoint_delta::{
    CheckpointPersister, DeploymentId, InMemoryCheckpointBackend, InMemoryStateManager,
    SyncConfig,
};
use std::sync::Arc;

/// Demo data
fn render_deployment(step: usize) -> Bytes {
    let resources = (0..10 + step * 3)
        .map(|i| {
            format!(
                "      {{\n        \"urn\": \"urn:pulumi:demo::app::aws:ec2/instance:Instance::web-{}\",\n        \"type\": \"aws:ec2/instance:Instance\",\n        \"outputs\": {{\"publicIp\": \"10.0.{}.{}\", \"state\": \"{}\"}}\n      }}",
                i,
                i / 250,
                i % 250,
                if i + 3 > 10 + step * 3 { "pending" } else { "running" }
            )
        })
        .collect::<Vec<_>>()
        .join(",\n");

    Bytes::from(format!(
        "{{\n  \"version\": 3,\n  \"deployment\": {{\n    \"resources\": [\n{}\n    ]\n  }}\n}}\n",
        resources
    ))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let config = SyncConfig {
        minimal_diff_size: 2 * 1024,
        ..SyncConfig::default()
    };
    let manager = InMemoryStateManager::new(config);
    let backend = Arc::new(InMemoryCheckpointBackend::new());
    let deployment = DeploymentId::new("demo/app/dev");

    let persister =
        CheckpointPersister::from_manager(&manager, deployment.clone(), Arc::clone(&backend))
            .await;

    println!("Persisting 8 checkpoints (diff threshold 2KB):");
    for step in 0..8 {
        let snapshot = render_deployment(step);
        let outcome = persister.save(snapshot.clone()).await?;

        println!("  #{} {:?}", outcome.sequence_number(), outcome);
        assert_eq!(backend.snapshot(&deployment), Some(snapshot));
    }

    println!(
        "Backend applied {} deltas and stored {} full checkpoints",
        backend.deltas_applied(),
        backend.full_stored()
    );

    Ok(())
}

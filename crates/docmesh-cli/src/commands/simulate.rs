//! Simulate command handler
//!
//! Builds a local tree, a main backend and shadow backends in memory, runs
//! the engine until everything is synced and stops it gracefully.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tracing::{info, warn};

use docmesh_core::{Config, DocEngine, DocId, DocSource, DocTree, EngineStep, MemorySource};

use crate::output::Output;

/// Parameters of one simulation run
pub struct SimulateOptions {
    pub shadows: usize,
    pub subdocs: usize,
    pub fail_pushes: usize,
    pub timeout: Duration,
}

/// Run the simulation, printing every engine status until synced
pub async fn run(config: &Config, options: SimulateOptions, output: &Output) -> Result<()> {
    let tree = Arc::new(build_tree(options.subdocs)?);

    let main = Arc::new(MemorySource::new("main"));
    main.fail_pushes(options.fail_pushes);
    let shadows: Vec<Arc<MemorySource>> = (1..=options.shadows)
        .map(|i| Arc::new(MemorySource::new(format!("shadow-{}", i))))
        .collect();

    let engine = Arc::new(
        DocEngine::new(
            tree.clone(),
            main.clone(),
            shadows
                .iter()
                .map(|source| source.clone() as Arc<dyn DocSource>)
                .collect(),
        )
        .with_config(config),
    );

    output.message(&format!(
        "Syncing {} documents with 1 main and {} shadow backend(s)...",
        tree.doc_ids().len(),
        shadows.len()
    ));

    let mut statuses = engine.subscribe_status();
    engine.start();

    let deadline = tokio::time::sleep(options.timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                engine.force_stop();
                bail!("Engine did not sync within {}s", options.timeout.as_secs());
            }
            status = statuses.recv() => {
                let Some(status) = status else {
                    bail!("Engine status stream closed");
                };
                output.print_engine_status(&status)?;
                if status.step == EngineStep::Synced {
                    break;
                }
            }
        }
    }

    engine.wait_for_graceful_stop(None).await?;
    info!("Simulation finished");

    let expected = tree.doc_ids();
    let sources = std::iter::once(&main).chain(shadows.iter());
    for source in sources {
        let stored = source.doc_ids().len();
        if stored != expected.len() {
            warn!(
                source = %source.name(),
                stored,
                expected = expected.len(),
                "Backend is missing documents"
            );
        }
        output.message(&format!("  {}: {} document(s)", source.name(), stored));
    }

    output.success(&format!(
        "Synced {} documents to {} backend(s)",
        expected.len(),
        1 + shadows.len()
    ));
    Ok(())
}

/// A root titled after the run, with `subdocs` pages under it
fn build_tree(subdocs: usize) -> Result<DocTree> {
    let root = DocId::new();
    let tree = DocTree::new(root.clone());
    tree.set_field(&root, "title", "docmesh simulation")?;

    for i in 1..=subdocs {
        let page = DocId::new();
        tree.add_subdoc(&root, &page)?;
        tree.set_field(&page, "body", &format!("Page {}", i))?;
    }

    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputFormat;

    #[test]
    fn test_build_tree() {
        let tree = build_tree(3).unwrap();
        assert_eq!(tree.doc_ids().len(), 4);
        assert_eq!(
            tree.field(tree.root_id(), "title").unwrap(),
            Some("docmesh simulation".to_string())
        );
    }

    #[tokio::test]
    async fn test_simulation_with_failing_main() {
        let config = Config {
            retry_delay_ms: 20,
            ..Config::default()
        };
        let options = SimulateOptions {
            shadows: 2,
            subdocs: 2,
            fail_pushes: 1,
            timeout: Duration::from_secs(10),
        };

        run(&config, options, &Output::new(OutputFormat::Quiet))
            .await
            .unwrap();
    }
}

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use pipeflow_core::StateManager;

#[derive(Subcommand, Debug)]
pub enum StateAction {
    /// List persisted keys
    List,
    /// Print the value stored under a key
    Show { key: String },
    /// Remove a persisted key
    Rm { key: String },
}

#[derive(Subcommand, Debug)]
pub enum SnapshotAction {
    /// Capture the current values of the given keys
    Create {
        id: String,
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Write a snapshot's captured values back to their keys
    Restore { id: String },
    /// List snapshots
    List,
    /// Delete a snapshot and its captured values
    Rm { id: String },
}

pub async fn run_state(manager: &StateManager, action: StateAction) -> Result<()> {
    match action {
        StateAction::List => {
            for key in manager.keys().await? {
                println!("{}", key);
            }
        }
        StateAction::Show { key } => {
            let Some(value) = manager.load(&key).await? else {
                bail!("No state stored under {}", key);
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&value).context("Failed to render state")?
            );
        }
        StateAction::Rm { key } => {
            if !manager.remove(&key).await? {
                bail!("No state stored under {}", key);
            }
            tracing::info!("Removed state {}", key);
        }
    }
    Ok(())
}

pub async fn run_snapshot(manager: &StateManager, action: SnapshotAction) -> Result<()> {
    match action {
        SnapshotAction::Create { id, keys } => {
            let snapshot = manager.create_snapshot(&id, &keys).await?;
            if snapshot.keys.len() < keys.len() {
                tracing::warn!(
                    "Snapshot {} captured {} of {} keys; missing keys were skipped",
                    id,
                    snapshot.keys.len(),
                    keys.len()
                );
            }
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        SnapshotAction::Restore { id } => match manager.restore_snapshot(&id).await? {
            Some(snapshot) => {
                tracing::info!("Restored {} keys from snapshot {}", snapshot.keys.len(), id)
            }
            None => bail!("Snapshot {} does not exist", id),
        },
        SnapshotAction::List => {
            for snapshot in manager.list_snapshots().await? {
                println!(
                    "{}\t{}\t{}",
                    snapshot.id,
                    snapshot.timestamp.to_rfc3339(),
                    snapshot.keys.join(",")
                );
            }
        }
        SnapshotAction::Rm { id } => {
            if !manager.delete_snapshot(&id).await? {
                bail!("Snapshot {} does not exist", id);
            }
            tracing::info!("Deleted snapshot {}", id);
        }
    }
    Ok(())
}

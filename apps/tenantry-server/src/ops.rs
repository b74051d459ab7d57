//! Operator commands. Each prints its report as JSON on stdout.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tenantry_db::isolation::reconcile_descriptor;
use tenantry_db::migrate::migrate_descriptor;
use tenantry_db::{ConnectionDescriptor, ConnectionManager, DataConfig, RawDescriptor, Schema, validate};

/// Reads and validates a descriptor file (JSON, same shape as `dbConfig`).
///
/// # Errors
/// Fails when the file cannot be read or the descriptor is invalid.
pub fn load_descriptor(path: &Path, config: &DataConfig) -> Result<ConnectionDescriptor> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read descriptor file {}", path.display()))?;
    let raw: RawDescriptor = serde_json::from_str(&text)
        .with_context(|| format!("descriptor file {} is not valid JSON", path.display()))?;
    Ok(validate::validate(&raw, &config.document)?)
}

fn print_json<T: Serialize>(report: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

/// # Errors
/// Fails on an invalid descriptor, a failed connection, or when any entity
/// could not be reconciled.
pub async fn reconcile_indexes(config: &DataConfig, descriptor_path: &Path) -> Result<()> {
    let descriptor = load_descriptor(descriptor_path, config)?;
    let manager = ConnectionManager::new(config.clone());
    let schema = Schema::standard(&config.tenant_field);

    tracing::info!(descriptor = %descriptor, "reconciling indexes");
    let report = reconcile_descriptor(&manager, &descriptor, &schema).await;
    manager.close_all().await;
    let report = report?;
    print_json(&report)?;
    if !report.is_clean() {
        anyhow::bail!("{} entities failed to reconcile", report.failures.len());
    }
    Ok(())
}

/// # Errors
/// Fails on an invalid or relational descriptor, a failed connection, an
/// insert error other than a duplicate key, or when collections had to be
/// skipped.
pub async fn migrate_legacy(config: &DataConfig, descriptor_path: &Path) -> Result<()> {
    let descriptor = load_descriptor(descriptor_path, config)?;
    let manager = ConnectionManager::new(config.clone());
    let schema = Schema::standard(&config.tenant_field);

    tracing::info!(descriptor = %descriptor, "migrating legacy collections");
    let run = migrate_descriptor(&manager, &descriptor, &schema).await?;
    print_json(&run)?;
    if !run.migration.skipped.is_empty() {
        anyhow::bail!(
            "{} legacy collections were skipped because their indexes could not be reconciled",
            run.migration.skipped.len()
        );
    }
    Ok(())
}

//! Agent seeding (spec §3, "Lifecycle"; §6 "Seeding"): on an empty `agents`
//! table, load a YAML declaration file and register each entry.
use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

use crate::registry::Registry;
use crate::Result;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeedAgent {
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    aliases: Vec<String>,
    #[serde(default)]
    capabilities: Vec<String>,
    #[serde(default)]
    color: Option<String>,
}

/// If the registry is empty and `path` names a readable file, parse it as
/// `{id: {displayName, aliases[], capabilities[], color}}` and register one
/// agent per entry. A missing file or a non-empty registry is a no-op, not
/// an error.
pub async fn seed_if_empty(registry: &Registry, path: Option<&str>) -> Result<usize> {
    if !registry.get_all().await?.is_empty() {
        return Ok(0);
    }

    let Some(path) = path else {
        return Ok(0);
    };
    if !Path::new(path).exists() {
        tracing::debug!(path, "agent seed file not found, skipping seeding");
        return Ok(0);
    }

    let raw = std::fs::read_to_string(path)
        .map_err(|e| crate::error::WaahError::PersistenceFailure(format!("reading seed file: {e}")))?;
    let declarations: std::collections::BTreeMap<String, SeedAgent> = serde_yaml::from_str(&raw)
        .map_err(|e| crate::error::WaahError::PersistenceFailure(format!("parsing seed file: {e}")))?;

    let mut seeded = 0;
    for (id, decl) in declarations {
        let display_name = decl.display_name.unwrap_or_else(|| id.clone());
        let capabilities: HashSet<String> = decl.capabilities.into_iter().collect();
        registry
            .register(&id, &display_name, capabilities, None, decl.aliases, decl.color)
            .await?;
        seeded += 1;
    }

    tracing::info!(count = seeded, "seeded agents from {path}");
    Ok(seeded)
}

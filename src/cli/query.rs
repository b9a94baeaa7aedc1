//! One-shot query and registry listing commands.

use anyhow::{bail, Context, Result};
use serde_json::Value;

use bizlens::{Config, Pipeline, QueryRegistry};

/// Parse `--params` as a JSON array.
pub(crate) fn parse_params(raw: &str) -> Result<Vec<Value>> {
    let value: Value = serde_json::from_str(raw).context("--params must be valid JSON")?;
    match value {
        Value::Array(items) => Ok(items),
        _ => bail!("--params must be a JSON array"),
    }
}

/// Handle `bizlens query`.
pub(crate) async fn cmd_query(
    config: &Config,
    query_id: &str,
    raw_params: &str,
    analysis: bool,
) -> Result<()> {
    let params = parse_params(raw_params)?;
    let pipeline = Pipeline::from_config(config)
        .await
        .context("Failed to initialise pipeline")?;

    let resp = pipeline.handle(query_id, params, analysis).await;
    pipeline.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&resp)?);
    if !resp.is_ok() {
        bail!("query '{}' failed", query_id);
    }
    Ok(())
}

/// Handle `bizlens queries`.
pub(crate) fn cmd_queries(config: &Config) -> Result<()> {
    let registry = QueryRegistry::load(&config.registry.path)?;
    if registry.is_empty() {
        println!("No queries registered in {}.", config.registry.path.display());
        return Ok(());
    }

    println!("{:<28} {:<8} {:<10} {}", "Query", "Params", "Analysis", "Description");
    println!("{}", "-".repeat(72));
    for def in registry.definitions() {
        println!(
            "{:<28} {:<8} {:<10} {}",
            def.id,
            def.param_count,
            if def.analysis_prompt().is_some() { "yes" } else { "no" },
            def.description.as_deref().unwrap_or(""),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_parse_params() {
        assert_eq!(
            parse_params(r#"["emea", 2024, true, null]"#).unwrap(),
            vec![json!("emea"), json!(2024), json!(true), Value::Null]
        );
        assert!(parse_params("[]").unwrap().is_empty());
        assert!(parse_params(r#"{"a":1}"#).is_err());
        assert!(parse_params("not json").is_err());
    }

    #[test]
    fn test_cmd_queries_lists_registry() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("queries.toml");
        std::fs::write(&path, "[[query]]\nid = \"a\"\nsql = \"SELECT $1\"\n").unwrap();
        let mut config = Config::default();
        config.registry.path = path;
        assert!(cmd_queries(&config).is_ok());
    }

    #[test]
    fn test_cmd_queries_missing_registry() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.registry.path = tmp.path().join("absent.toml");
        assert!(cmd_queries(&config).is_err());
    }
}

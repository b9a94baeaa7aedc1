//! Static registry of parameterized dashboard queries.
//!
//! The registry is built once at startup, from a TOML file or in memory, and
//! shared immutably with the pipeline.
//!
//! ```toml
//! [[query]]
//! id = "revenue_by_month"
//! description = "Monthly revenue for a region"
//! sql = "SELECT month, revenue FROM revenue WHERE region = $1 ORDER BY month"
//! prompt_template = "Summarize the revenue trend and call out anomalies."
//! analysis_enabled = true
//!
//! [[query]]
//! id = "churn"
//! sql_file = "sql/churn.sql"   # relative to this file
//!
//! [[query]]
//! id = "orders_since"
//! sql = "SELECT day, orders FROM daily_orders WHERE day >= $1::date"
//! ```
//!
//! String and null parameters are bound as `text`. A placeholder compared
//! against a non-text column needs an explicit cast (`$1::date`,
//! `$2::timestamptz`, `$1::numeric`), otherwise Postgres rejects the
//! statement with "operator does not exist: date >= text".

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{LensError, Result};

/// One registered query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryDefinition {
    pub id: String,
    pub description: Option<String>,
    pub sql: String,
    /// Prompt handed to the analysis workflow alongside the rows.
    pub prompt_template: Option<String>,
    pub analysis_enabled: bool,
    /// Highest `$N` placeholder in `sql`.
    pub param_count: usize,
}

impl QueryDefinition {
    pub fn new(id: impl Into<String>, sql: impl Into<String>) -> Self {
        let sql = sql.into();
        Self {
            id: id.into(),
            description: None,
            param_count: placeholder_count(&sql),
            sql,
            prompt_template: None,
            analysis_enabled: false,
        }
    }

    /// Attach a prompt template and enable analysis.
    pub fn with_analysis(mut self, prompt_template: impl Into<String>) -> Self {
        self.prompt_template = Some(prompt_template.into());
        self.analysis_enabled = true;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Prompt to use when analysis is both templated and enabled.
    pub fn analysis_prompt(&self) -> Option<&str> {
        if !self.analysis_enabled {
            return None;
        }
        self.prompt_template
            .as_deref()
            .filter(|t| !t.trim().is_empty())
    }
}

/// Highest positional placeholder (`$1`, `$2`, ...) referenced by `sql`.
pub fn placeholder_count(sql: &str) -> usize {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    let re = PLACEHOLDER.get_or_init(|| Regex::new(r"\$(\d+)").expect("valid placeholder regex"));
    re.captures_iter(sql)
        .filter_map(|c| c[1].parse::<usize>().ok())
        .max()
        .unwrap_or(0)
}

/// On-disk form of a registry entry.
#[derive(Debug, Deserialize)]
struct RawQuery {
    id: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    sql: Option<String>,
    #[serde(default)]
    sql_file: Option<PathBuf>,
    #[serde(default)]
    prompt_template: Option<String>,
    #[serde(default)]
    analysis_enabled: bool,
}

#[derive(Debug, Default, Deserialize)]
struct RawRegistry {
    #[serde(default)]
    query: Vec<RawQuery>,
}

/// Immutable lookup table of query definitions keyed by id.
#[derive(Debug, Clone, Default)]
pub struct QueryRegistry {
    queries: HashMap<String, QueryDefinition>,
}

impl QueryRegistry {
    /// Build from definitions, rejecting empty and duplicate ids.
    pub fn from_definitions<I>(definitions: I) -> Result<Self>
    where
        I: IntoIterator<Item = QueryDefinition>,
    {
        let mut queries = HashMap::new();
        for def in definitions {
            if def.id.trim().is_empty() {
                return Err(LensError::Config("Query id must not be empty".into()));
            }
            if def.sql.trim().is_empty() {
                return Err(LensError::Config(format!("Query '{}' has no SQL", def.id)));
            }
            if queries.contains_key(&def.id) {
                return Err(LensError::Config(format!("Duplicate query id '{}'", def.id)));
            }
            queries.insert(def.id.clone(), def);
        }
        Ok(Self { queries })
    }

    /// Load a registry TOML file. `sql_file` paths resolve relative to it.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            LensError::Config(format!("Failed to read registry {}: {}", path.display(), e))
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let registry = Self::parse(&data, base)?;
        info!(path = %path.display(), queries = registry.len(), "Query registry loaded");
        Ok(registry)
    }

    /// Parse registry TOML text, resolving `sql_file` against `base_dir`.
    pub fn parse(toml_text: &str, base_dir: &Path) -> Result<Self> {
        let raw: RawRegistry = toml::from_str(toml_text)
            .map_err(|e| LensError::Config(format!("Invalid registry: {}", e)))?;

        let mut definitions = Vec::with_capacity(raw.query.len());
        for q in raw.query {
            let sql = match (q.sql, q.sql_file) {
                (Some(sql), None) => sql,
                (None, Some(file)) => {
                    let full = base_dir.join(&file);
                    std::fs::read_to_string(&full).map_err(|e| {
                        LensError::Config(format!(
                            "Query '{}': failed to read {}: {}",
                            q.id,
                            full.display(),
                            e
                        ))
                    })?
                }
                (Some(_), Some(_)) => {
                    return Err(LensError::Config(format!(
                        "Query '{}' sets both sql and sql_file",
                        q.id
                    )))
                }
                (None, None) => {
                    return Err(LensError::Config(format!("Query '{}' has no SQL", q.id)))
                }
            };
            let mut def = QueryDefinition::new(q.id, sql);
            def.description = q.description;
            def.prompt_template = q.prompt_template;
            def.analysis_enabled = q.analysis_enabled;
            definitions.push(def);
        }
        Self::from_definitions(definitions)
    }

    pub fn lookup(&self, id: &str) -> Option<&QueryDefinition> {
        self.queries.get(id)
    }

    /// Registered ids in sorted order.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.queries.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Definitions sorted by id.
    pub fn definitions(&self) -> Vec<&QueryDefinition> {
        let mut defs: Vec<&QueryDefinition> = self.queries.values().collect();
        defs.sort_by(|a, b| a.id.cmp(&b.id));
        defs
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_placeholder_count() {
        assert_eq!(placeholder_count("SELECT 1"), 0);
        assert_eq!(placeholder_count("SELECT * FROM t WHERE a = $1"), 1);
        assert_eq!(
            placeholder_count("SELECT * FROM t WHERE a = $2 AND b = $1 OR c = $2"),
            2
        );
        assert_eq!(placeholder_count("WHERE x BETWEEN $1 AND $10"), 10);
    }

    #[test]
    fn test_placeholder_count_with_casts() {
        assert_eq!(
            placeholder_count("SELECT * FROM o WHERE day >= $1::date AND day < $2::date"),
            2
        );
        let def = QueryDefinition::new("since", "SELECT 1 WHERE now() > $1::timestamptz");
        assert_eq!(def.param_count, 1);
    }

    #[test]
    fn test_parse_inline_and_file_sql() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("sql")).unwrap();
        std::fs::write(
            tmp.path().join("sql/churn.sql"),
            "SELECT month, rate FROM churn WHERE plan = $1",
        )
        .unwrap();
        let text = r#"
            [[query]]
            id = "revenue"
            sql = "SELECT month, revenue FROM revenue"
            prompt_template = "Summarize revenue."
            analysis_enabled = true

            [[query]]
            id = "churn"
            sql_file = "sql/churn.sql"
        "#;
        let registry = QueryRegistry::parse(text, tmp.path()).unwrap();
        assert_eq!(registry.ids(), vec!["churn", "revenue"]);

        let revenue = registry.lookup("revenue").unwrap();
        assert_eq!(revenue.analysis_prompt(), Some("Summarize revenue."));
        assert_eq!(revenue.param_count, 0);

        let churn = registry.lookup("churn").unwrap();
        assert_eq!(churn.param_count, 1);
        assert!(churn.analysis_prompt().is_none());
    }

    #[test]
    fn test_load_from_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("queries.toml");
        std::fs::write(&path, "[[query]]\nid = \"a\"\nsql = \"SELECT 1\"\n").unwrap();
        let registry = QueryRegistry::load(&path).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup("missing").is_none());
    }

    #[test]
    fn test_template_without_flag_disables_analysis() {
        let mut def = QueryDefinition::new("a", "SELECT 1").with_analysis("Explain.");
        def.analysis_enabled = false;
        assert!(def.analysis_prompt().is_none());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let result = QueryRegistry::from_definitions(vec![
            QueryDefinition::new("a", "SELECT 1"),
            QueryDefinition::new("a", "SELECT 2"),
        ]);
        assert!(matches!(result, Err(LensError::Config(_))));
    }

    #[test]
    fn test_sql_and_sql_file_conflict() {
        let text = "[[query]]\nid = \"a\"\nsql = \"SELECT 1\"\nsql_file = \"a.sql\"\n";
        let err = QueryRegistry::parse(text, Path::new(".")).unwrap_err();
        assert!(err.to_string().contains("both sql and sql_file"));
    }

    #[test]
    fn test_missing_sql_file_is_config_error() {
        let tmp = TempDir::new().unwrap();
        let text = "[[query]]\nid = \"a\"\nsql_file = \"nope.sql\"\n";
        let err = QueryRegistry::parse(text, tmp.path()).unwrap_err();
        assert!(matches!(err, LensError::Config(_)));
    }

    #[test]
    fn test_empty_registry() {
        let registry = QueryRegistry::parse("", Path::new(".")).unwrap();
        assert!(registry.is_empty());
    }
}

//! ApplicationSet discovery.
//!
//! Scans environment directories for ApplicationSet documents and projects
//! their list-generator elements into [`ChartSpec`]s for the pipeline. The
//! on-disk layout is `<env_dir>/<env>/appsets/*appset.yaml`; each document
//! carries charts at `spec.generators[0].list.elements`.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::pipeline::ChartSpec;

/// Filename suffix identifying ApplicationSet documents.
const APPSET_SUFFIX: &str = "appset.yaml";

/// Errors raised during chart discovery. These abort the run; per-chart
/// problems are left for the pipeline to report.
#[derive(Debug, Error)]
pub enum AppsetError {
    /// The selected environment directory does not exist.
    #[error("environment {env:?} not found in {dir}")]
    EnvNotFound {
        /// The requested environment name.
        env: String,
        /// The base directory that was searched.
        dir: String,
    },

    /// A directory or file could not be read.
    #[error("failed to read {path}: {message}")]
    Io {
        /// The path that failed.
        path: String,
        /// Underlying error text.
        message: String,
    },

    /// An appset document is not valid YAML.
    #[error("failed to parse YAML {path}: {message}")]
    Parse {
        /// The file that failed to parse.
        path: String,
        /// Parser error text.
        message: String,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AppSetDocument {
    spec: AppSetSpec,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AppSetSpec {
    generators: Vec<Generator>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Generator {
    list: Option<ListGenerator>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ListGenerator {
    elements: Vec<serde_yaml::Value>,
}

/// Discovers every chart referenced by the ApplicationSets of the selected
/// environments.
///
/// With `selected_env` set, only that environment is scanned and it is an
/// error if its directory is missing. Otherwise every sub-directory of
/// `env_dir` is an environment; ones without an `appsets` directory simply
/// contribute no charts.
///
/// # Errors
///
/// Returns [`AppsetError`] when directories cannot be read, the selected
/// environment does not exist, or an appset document fails to parse.
pub fn find_charts(
    env_dir: &Path,
    selected_env: Option<&str>,
    src_prefix: &str,
) -> Result<Vec<ChartSpec>, AppsetError> {
    info!(dir = %env_dir.display(), "scanning environments");

    if let Some(env) = selected_env {
        let env_path = env_dir.join(env);
        if !env_path.is_dir() {
            return Err(AppsetError::EnvNotFound {
                env: env.to_string(),
                dir: env_dir.display().to_string(),
            });
        }
        return charts_in_environment(env, &env_path, src_prefix);
    }

    let mut environments: Vec<(String, PathBuf)> = read_dir(env_dir)?
        .into_iter()
        .filter(|path| path.is_dir())
        .filter_map(|path| {
            path.file_name()
                .map(|name| (name.to_string_lossy().into_owned(), path.clone()))
        })
        .collect();
    environments.sort();

    let mut charts = Vec::new();
    for (env, env_path) in environments {
        charts.extend(charts_in_environment(&env, &env_path, src_prefix)?);
    }
    Ok(charts)
}

/// Extracts the charts of a single environment directory.
fn charts_in_environment(
    env: &str,
    env_path: &Path,
    src_prefix: &str,
) -> Result<Vec<ChartSpec>, AppsetError> {
    let appsets_path = env_path.join("appsets");
    if !appsets_path.is_dir() {
        debug!(env, "no appsets directory; skipping");
        return Ok(Vec::new());
    }

    let mut files: Vec<PathBuf> = read_dir(&appsets_path)?
        .into_iter()
        .filter(|path| {
            path.is_file()
                && path
                    .file_name()
                    .is_some_and(|name| name.to_string_lossy().ends_with(APPSET_SUFFIX))
        })
        .collect();
    files.sort();

    let mut charts = Vec::new();
    for file in files {
        let data = fs::read_to_string(&file).map_err(|e| AppsetError::Io {
            path: file.display().to_string(),
            message: e.to_string(),
        })?;
        let document: AppSetDocument =
            serde_yaml::from_str(&data).map_err(|e| AppsetError::Parse {
                path: file.display().to_string(),
                message: e.to_string(),
            })?;
        for element in elements_of(document) {
            charts.push(chart_from_element(&element, env, src_prefix));
        }
        debug!(env, file = %file.display(), "processed appset file");
    }
    Ok(charts)
}

/// The chart elements of a document: `spec.generators[0].list.elements`.
fn elements_of(document: AppSetDocument) -> Vec<serde_yaml::Value> {
    document
        .spec
        .generators
        .into_iter()
        .next()
        .and_then(|generator| generator.list)
        .map(|list| list.elements)
        .unwrap_or_default()
}

/// Projects one list element into a [`ChartSpec`]. Missing fields become
/// empty strings; the values-file fragments are joined with `src_prefix`.
fn chart_from_element(element: &serde_yaml::Value, env: &str, src_prefix: &str) -> ChartSpec {
    ChartSpec {
        env: env.to_string(),
        chart_name: field(element, "chartName"),
        repo_url: field(element, "repoURL"),
        chart_version: field(element, "chartVersion"),
        base_values_file: PathBuf::from(format!(
            "{src_prefix}{}",
            field(element, "baseValuesFile")
        )),
        values_override: PathBuf::from(format!(
            "{src_prefix}{}",
            field(element, "valuesOverride")
        )),
    }
}

/// Reads a field as a string, tolerating scalars of other YAML types.
fn field(element: &serde_yaml::Value, key: &str) -> String {
    match element.get(key) {
        None | Some(serde_yaml::Value::Null) => String::new(),
        Some(serde_yaml::Value::String(s)) => s.clone(),
        Some(serde_yaml::Value::Number(n)) => n.to_string(),
        Some(serde_yaml::Value::Bool(b)) => b.to_string(),
        Some(_) => String::new(),
    }
}

/// Lists the entries of a directory.
fn read_dir(dir: &Path) -> Result<Vec<PathBuf>, AppsetError> {
    let entries = fs::read_dir(dir).map_err(|e| AppsetError::Io {
        path: dir.display().to_string(),
        message: e.to_string(),
    })?;
    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| AppsetError::Io {
            path: dir.display().to_string(),
            message: e.to_string(),
        })?;
        paths.push(entry.path());
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    const APPSET: &str = r#"
apiVersion: argoproj.io/v1alpha1
kind: ApplicationSet
spec:
  generators:
    - list:
        elements:
          - chartName: frontend
            repoURL: https://charts.example.com
            chartVersion: 1.2.3
            baseValuesFile: values/frontend.yaml
            valuesOverride: env/prod/values/frontend.yaml
          - chartName: backend
            repoURL: https://charts.example.com
            chartVersion: "2.0"
"#;

    fn write_appset(root: &Path, env: &str, name: &str, content: &str) {
        let dir = root.join(env).join("appsets");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn discovers_charts_with_prefix_and_defaults() {
        let root = tempfile::tempdir().unwrap();
        write_appset(root.path(), "prod", "apps-appset.yaml", APPSET);

        let charts = find_charts(root.path(), None, "../").unwrap();
        assert_eq!(charts.len(), 2);

        let frontend = &charts[0];
        assert_eq!(frontend.env, "prod");
        assert_eq!(frontend.chart_name, "frontend");
        assert_eq!(frontend.repo_url, "https://charts.example.com");
        assert_eq!(frontend.chart_version, "1.2.3");
        assert_eq!(
            frontend.base_values_file,
            PathBuf::from("../values/frontend.yaml")
        );
        assert_eq!(
            frontend.values_override,
            PathBuf::from("../env/prod/values/frontend.yaml")
        );

        // Missing path fields collapse to just the prefix.
        let backend = &charts[1];
        assert_eq!(backend.chart_version, "2.0");
        assert_eq!(backend.base_values_file, PathBuf::from("../"));
    }

    #[test]
    fn scans_every_environment_in_name_order() {
        let root = tempfile::tempdir().unwrap();
        write_appset(root.path(), "beta", "b-appset.yaml", APPSET);
        write_appset(root.path(), "alpha", "a-appset.yaml", APPSET);
        // An environment without appsets contributes nothing.
        fs::create_dir_all(root.path().join("empty")).unwrap();

        let charts = find_charts(root.path(), None, "").unwrap();
        assert_eq!(charts.len(), 4);
        assert_eq!(charts[0].env, "alpha");
        assert_eq!(charts[2].env, "beta");
    }

    #[test]
    fn selected_environment_restricts_the_scan() {
        let root = tempfile::tempdir().unwrap();
        write_appset(root.path(), "prod", "apps-appset.yaml", APPSET);
        write_appset(root.path(), "staging", "apps-appset.yaml", APPSET);

        let charts = find_charts(root.path(), Some("staging"), "").unwrap();
        assert_eq!(charts.len(), 2);
        assert!(charts.iter().all(|chart| chart.env == "staging"));
    }

    #[test]
    fn missing_selected_environment_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let err = find_charts(root.path(), Some("nope"), "").unwrap_err();
        assert!(matches!(err, AppsetError::EnvNotFound { .. }));
    }

    #[test]
    fn non_appset_files_are_ignored() {
        let root = tempfile::tempdir().unwrap();
        write_appset(root.path(), "prod", "apps-appset.yaml", APPSET);
        write_appset(root.path(), "prod", "README.yaml", "not: relevant");

        let charts = find_charts(root.path(), None, "").unwrap();
        assert_eq!(charts.len(), 2);
    }

    #[test]
    fn unparseable_appset_names_the_file() {
        let root = tempfile::tempdir().unwrap();
        write_appset(root.path(), "prod", "bad-appset.yaml", "spec: [unclosed");

        let err = find_charts(root.path(), None, "").unwrap_err();
        match err {
            AppsetError::Parse { path, .. } => assert!(path.contains("bad-appset.yaml")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn document_without_list_generator_yields_nothing() {
        let root = tempfile::tempdir().unwrap();
        write_appset(
            root.path(),
            "prod",
            "git-appset.yaml",
            "spec:\n  generators:\n    - git:\n        repoURL: https://example.com\n",
        );
        assert!(find_charts(root.path(), None, "").unwrap().is_empty());
    }
}

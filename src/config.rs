use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cacheable::cache::{AttrKind, AttrSpec, CacheOptions, JoinSpec, Model, ResourceModel};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheOptions,
  #[serde(default)]
  pub models: Vec<ModelConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  pub url: String,
}

/// A model type declared in the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
  pub name: String,
  pub singular: String,
  pub plural: String,
  /// Collection endpoint (defaults to /api/{plural})
  pub collection_path: Option<String>,
  /// Item endpoint with an `{id}` placeholder (defaults to /api/{plural}/{id})
  pub item_path: Option<String>,
  #[serde(default)]
  pub attributes: Vec<AttrConfig>,
  #[serde(default)]
  pub joins: BTreeMap<String, JoinSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttrConfig {
  pub name: String,
  /// One of: value, stub, stubs, date, datetime
  #[serde(default = "default_kind")]
  pub kind: String,
  /// Referenced type for stub attributes
  pub target: Option<String>,
}

fn default_kind() -> String {
  "value".to_string()
}

impl AttrConfig {
  fn to_spec(&self) -> Result<AttrSpec> {
    let kind = match self.kind.to_lowercase().as_str() {
      "value" => AttrKind::Value,
      "stub" => AttrKind::Stub(self.target.clone()),
      "stubs" => AttrKind::Stubs(self.target.clone()),
      "date" => AttrKind::Date,
      "datetime" => AttrKind::DateTime,
      other => return Err(eyre!("Unknown kind '{}' for attribute {}", other, self.name)),
    };
    Ok(AttrSpec::new(self.name.clone(), kind))
  }
}

impl ModelConfig {
  pub fn to_model(&self) -> Result<Arc<dyn Model>> {
    let mut model = ResourceModel::new(&self.name, &self.singular, &self.plural);
    match (&self.collection_path, &self.item_path) {
      (Some(collection), Some(item)) => model = model.with_paths(collection, item),
      (None, None) => {}
      _ => {
        return Err(eyre!(
          "Model {} must set both collection_path and item_path, or neither",
          self.name
        ))
      }
    }
    for attr in &self.attributes {
      model = model.with_attr(attr.to_spec()?);
    }
    for (relation, join) in &self.joins {
      model = model.with_join(relation, join.clone());
    }
    Ok(Arc::new(model))
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./cacheable.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/cacheable/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/cacheable/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("cacheable.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("cacheable").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Build every declared model.
  pub fn models(&self) -> Result<Vec<Arc<dyn Model>>> {
    self.models.iter().map(ModelConfig::to_model).collect()
  }

  /// Get the API token from the environment, if set.
  ///
  /// Reads CACHEABLE_API_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("CACHEABLE_API_TOKEN")
      .ok()
      .filter(|token| !token.is_empty())
  }
}

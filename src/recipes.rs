//! Recipes and routes
//!
//! A recipe is a named bundle of transform options stored as
//! `<recipes dir>/<name>.json`:
//!
//! ```json
//! { "recipe": "thumbnail", "path": "/images", "settings": { "width": 200, "format": "png" } }
//! ```
//!
//! A route is a named, ordered list of conditional branches stored as
//! `<routes dir>/<name>.json`, each branch pointing at a recipe:
//!
//! ```json
//! { "route": "responsive", "branches": [
//!     { "condition": { "device": "mobile" }, "recipe": "mobile-thumb" },
//!     { "recipe": "desktop-thumb" } ] }
//! ```

use crate::error::{GateError, Result};
use crate::models::TransformOptions;
use crate::options;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

/// Minimum length of a recipe or route name
const MIN_NAME_LEN: usize = 5;

/// A loaded recipe
#[derive(Debug, Clone, PartialEq)]
pub struct Recipe {
    pub name: String,
    /// Prefix prepended to the asset path when set
    pub origin_path: Option<String>,
    pub settings: TransformOptions,
}

/// On-disk recipe representation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipeFile {
    pub recipe: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

impl RecipeFile {
    /// Validate and convert into a [`Recipe`]
    pub fn into_recipe(self) -> Result<Recipe> {
        let settings = options::parse_settings(&self.settings)?;
        Ok(Recipe {
            name: self.recipe,
            origin_path: self.path.filter(|p| !p.is_empty()),
            settings,
        })
    }
}

/// A single value or a list, as accepted in route conditions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn values(&self) -> Vec<String> {
        match self {
            OneOrMany::One(v) => vec![v.clone()],
            OneOrMany::Many(vs) => vs.clone(),
        }
    }
}

/// Client-signal condition on a route branch
///
/// Every key present must match for the branch to match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<OneOrMany>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<OneOrMany>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_min_quality: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<OneOrMany>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<OneOrMany>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub recipe: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    #[serde(rename = "route")]
    pub name: String,
    pub branches: Vec<Branch>,
}

impl Route {
    /// Validation messages for a route definition, empty when valid
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if !is_valid_name(&self.name) {
            errors.push(format!(
                "Route name must be {} or more letters, hyphens or underscores",
                MIN_NAME_LEN
            ));
        }
        if self.branches.is_empty() {
            errors.push("Route must contain at least one branch".to_string());
        }
        for (i, branch) in self.branches.iter().enumerate() {
            if branch.recipe.is_empty() {
                errors.push(format!("Branch {} must specify a recipe", i));
            }
        }
        errors
    }
}

/// Whether a recipe/route name matches `^[A-Za-z\-_]{5,}$`
pub fn is_valid_name(name: &str) -> bool {
    name.len() >= MIN_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphabetic() || c == '-' || c == '_')
}

/// Validation messages for a recipe definition, empty when valid
pub fn validate_recipe(value: &serde_json::Value) -> Vec<String> {
    let mut errors = Vec::new();

    let name = value.get("recipe").and_then(|v| v.as_str());
    match name {
        None => errors.push("Property \"recipe\" not found in recipe".to_string()),
        Some(name) if !is_valid_name(name) => errors.push(format!(
            "Recipe name must be {} or more letters, hyphens or underscores",
            MIN_NAME_LEN
        )),
        Some(_) => {}
    }

    match value.get("settings") {
        Some(serde_json::Value::Object(settings)) => {
            if let Err(e) = options::parse_settings(settings) {
                errors.push(e.to_string());
            }
        }
        Some(_) => errors.push("Property \"settings\" must be an object".to_string()),
        None => errors.push("Property \"settings\" not found in recipe".to_string()),
    }

    if let Some(path) = value.get("path") {
        if !path.is_string() {
            errors.push("Property \"path\" must be a string".to_string());
        }
    }

    errors
}

/// File-backed recipe and route store
#[derive(Debug, Clone)]
pub struct RecipeStore {
    recipes_dir: PathBuf,
    routes_dir: PathBuf,
}

impl RecipeStore {
    pub fn new(recipes_dir: impl AsRef<Path>, routes_dir: impl AsRef<Path>) -> Self {
        Self {
            recipes_dir: recipes_dir.as_ref().to_path_buf(),
            routes_dir: routes_dir.as_ref().to_path_buf(),
        }
    }

    fn recipe_path(&self, name: &str) -> PathBuf {
        self.recipes_dir.join(format!("{}.json", name))
    }

    fn route_path(&self, name: &str) -> PathBuf {
        self.routes_dir.join(format!("{}.json", name))
    }

    /// Load a recipe by name
    ///
    /// # Returns
    /// * `Ok(Some(Recipe))` if a recipe file exists and parses
    /// * `Ok(None)` if the name is not a valid recipe name or no file exists
    /// * `Err(GateError)` if the file exists but is malformed
    pub async fn load_recipe(&self, name: &str) -> Result<Option<Recipe>> {
        if !is_valid_name(name) {
            return Ok(None);
        }

        let Some(content) = read_optional(&self.recipe_path(name)).await? else {
            return Ok(None);
        };

        let file: RecipeFile = serde_json::from_str(&content).map_err(|e| {
            warn!("Malformed recipe file for {}: {}", name, e);
            GateError::ParseError(format!("Recipe {} is malformed: {}", name, e))
        })?;

        debug!("Loaded recipe {}", name);
        file.into_recipe().map(Some)
    }

    /// Load a route by name, same contract as [`RecipeStore::load_recipe`]
    pub async fn load_route(&self, name: &str) -> Result<Option<Route>> {
        if !is_valid_name(name) {
            return Ok(None);
        }

        let Some(content) = read_optional(&self.route_path(name)).await? else {
            return Ok(None);
        };

        let route: Route = serde_json::from_str(&content).map_err(|e| {
            warn!("Malformed route file for {}: {}", name, e);
            GateError::ParseError(format!("Route {} is malformed: {}", name, e))
        })?;

        debug!("Loaded route {} with {} branches", name, route.branches.len());
        Ok(Some(route))
    }

    /// Persist a new recipe
    ///
    /// # Returns
    /// * `Ok(name)` once the file is written
    /// * `Err(errors)` with validation messages otherwise
    pub async fn create_recipe(&self, value: &serde_json::Value) -> std::result::Result<String, Vec<String>> {
        let errors = validate_recipe(value);
        if !errors.is_empty() {
            return Err(errors);
        }

        let file: RecipeFile =
            serde_json::from_value(value.clone()).map_err(|e| vec![e.to_string()])?;
        let path = self.recipe_path(&file.recipe);

        if fs::try_exists(&path).await.unwrap_or(false) {
            return Err(vec![format!("Recipe \"{}\" already exists", file.recipe)]);
        }

        write_json(&self.recipes_dir, &path, &file)
            .await
            .map_err(|e| vec![e.to_string()])?;

        info!("Created recipe {}", file.recipe);
        Ok(file.recipe)
    }

    /// Persist a new route, same contract as [`RecipeStore::create_recipe`]
    pub async fn create_route(&self, value: &serde_json::Value) -> std::result::Result<String, Vec<String>> {
        let route: Route = serde_json::from_value(value.clone())
            .map_err(|e| vec![format!("Invalid route definition: {}", e)])?;

        let errors = route.validate();
        if !errors.is_empty() {
            return Err(errors);
        }

        let path = self.route_path(&route.name);
        if fs::try_exists(&path).await.unwrap_or(false) {
            return Err(vec![format!("Route \"{}\" already exists", route.name)]);
        }

        write_json(&self.routes_dir, &path, &route)
            .await
            .map_err(|e| vec![e.to_string()])?;

        info!("Created route {}", route.name);
        Ok(route.name)
    }

    /// Delete a recipe file, `NotFound` when absent
    pub async fn delete_recipe(&self, name: &str) -> Result<()> {
        remove_named(&self.recipe_path(name), "Recipe", name).await
    }

    /// Delete a route file, `NotFound` when absent
    pub async fn delete_route(&self, name: &str) -> Result<()> {
        remove_named(&self.route_path(name), "Route", name).await
    }
}

async fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_json<T: Serialize>(dir: &Path, path: &Path, value: &T) -> Result<()> {
    fs::create_dir_all(dir).await?;
    let body = serde_json::to_vec_pretty(value)?;
    fs::write(path, body).await?;
    Ok(())
}

async fn remove_named(path: &Path, kind: &str, name: &str) -> Result<()> {
    if !is_valid_name(name) {
        return Err(GateError::NotFound(format!("{} \"{}\" not found", kind, name)));
    }
    match fs::remove_file(path).await {
        Ok(()) => {
            info!("Deleted {} {}", kind.to_lowercase(), name);
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(GateError::NotFound(
            format!("{} \"{}\" not found", kind, name),
        )),
        Err(e) => Err(e.into()),
    }
}

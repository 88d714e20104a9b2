use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::response::Json;
use serde::{Deserialize, Serialize};

use crate::session::AppState;

/// One entry of the static application catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct App {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename(deserialize = "poster_url", serialize = "posterURL"))]
    pub poster_url: String,
    pub device: Vec<String>,
}

/// Static catalog served to browsers, read once at startup.
#[derive(Debug, Clone, Default)]
pub struct AppCatalog {
    apps: Vec<App>,
}

impl AppCatalog {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read app catalog {}", path.display()))?;
        let apps: Vec<App> = serde_yaml::from_str(&raw).context("parse app catalog yaml")?;
        Ok(Self { apps })
    }

    /// All apps, or only those available on the given device class.
    pub fn apps_for_device(&self, device: Option<&str>) -> Vec<App> {
        match device {
            Some(device) => self
                .apps
                .iter()
                .filter(|app| app.device.iter().any(|d| d == device))
                .cloned()
                .collect(),
            None => self.apps.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AppListQuery {
    pub device: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AppListResponse {
    pub apps: Vec<App>,
}

pub async fn list_apps(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AppListQuery>,
) -> Json<AppListResponse> {
    let device = query.device.as_deref().filter(|d| !d.is_empty());
    Json(AppListResponse {
        apps: state.catalog.apps_for_device(device),
    })
}

//! On-disk cache of backend calibration profiles.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Measured speed of one backend on one routine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendProfile {
    pub backend: String,
    pub routine: String,
    pub instances: usize,
    pub average_time_ms: f64,
}

impl BackendProfile {
    pub fn new(backend: &str, routine: &str, instances: usize, average_time_ms: f64) -> Self {
        Self {
            backend: backend.to_string(),
            routine: routine.to_string(),
            instances,
            average_time_ms,
        }
    }

    /// Instances per second.
    pub fn throughput(&self) -> f64 {
        if self.average_time_ms > 0.0 {
            self.instances as f64 / (self.average_time_ms / 1000.0)
        } else {
            f64::INFINITY
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CalibrationCache {
    profiles: HashMap<String, BackendProfile>,
}

impl CalibrationCache {
    pub fn new() -> Self {
        Self {
            profiles: HashMap::new(),
        }
    }

    pub fn get(&self, backend: &str, routine: &str) -> Option<&BackendProfile> {
        self.profiles.get(&profile_key(backend, routine))
    }

    pub fn insert(&mut self, profile: BackendProfile) {
        let key = profile_key(&profile.backend, &profile.routine);
        self.profiles.insert(key, profile);
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let data = fs::read(path)
            .with_context(|| format!("failed to read calibration cache {}", path.display()))?;
        let cache = serde_json::from_slice(&data)
            .with_context(|| format!("invalid calibration cache {}", path.display()))?;
        Ok(cache)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let blob = serde_json::to_vec_pretty(self)?;
        fs::write(path, blob)?;
        Ok(())
    }
}

fn profile_key(backend: &str, routine: &str) -> String {
    format!("{backend}::{routine}")
}

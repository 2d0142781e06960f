//! Device and repository records attached to a job

use serde::{Deserialize, Serialize};

/// Device identity recovered during analysis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub brand: String,
    pub codename: String,
    pub fingerprint: Option<String>,
    pub android_version: Option<String>,
    pub build_id: Option<String>,
    pub platform: Option<String>,
    pub is_ab: bool,
}

/// Location of the published dump
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryInfo {
    /// Namespace (vendor subgroup) the project lives in
    pub namespace: String,
    /// Project name, the lowercased device codename
    pub project: String,
    pub branch: String,
    /// Browsable URL of the pushed branch
    pub url: String,
}

//! Device property resolution
//!
//! Every field is looked up through an ordered table of candidate rows. A
//! row pairs property keys with file globs relative to the dump root; keys
//! are tried outermost, then globs, then the files each glob expands to in
//! sorted order. The first `key=value` line with a non-empty value wins.

use dumper_core::domain::device::{DeviceInfo, RepositoryInfo};
use dumper_core::domain::error::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::service::error::StageError;

/// Maximum length of cleaned repository names
const MAX_NAME_LEN: usize = 35;

/// One row of a lookup table
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub keys: &'static [&'static str],
    pub globs: &'static [&'static str],
}

const fn row(keys: &'static [&'static str], globs: &'static [&'static str]) -> Candidate {
    Candidate { keys, globs }
}

const SYSTEM_PROPS: &[&str] = &["system/build*.prop", "system/system/build*.prop"];
const VENDOR_SYSTEM_PROPS: &[&str] = &[
    "vendor/build*.prop",
    "system/build*.prop",
    "system/system/build*.prop",
];
const BUILD_ID_PROPS: &[&str] = &[
    "my_manifest/build*.prop",
    "system/system/build_default.prop",
    "vendor/euclid/my_manifest/build.prop",
    "vendor/build*.prop",
    "system/build*.prop",
    "system/system/build*.prop",
];

const FLAVOR: &[Candidate] = &[row(
    &[
        "ro.build.flavor",
        "ro.vendor.build.flavor",
        "ro.system.build.flavor",
        "ro.build.type",
    ],
    &[
        "vendor/build*.prop",
        "system/build.prop",
        "system/system/build*.prop",
    ],
)];

const RELEASE: &[Candidate] = &[row(
    &[
        "ro.build.version.release",
        "ro.vendor.build.version.release",
        "ro.system.build.version.release",
    ],
    &[
        "my_manifest/build*.prop",
        "vendor/build*.prop",
        "system/build*.prop",
        "system/system/build*.prop",
    ],
)];

const BUILD_ID: &[Candidate] = &[row(
    &["ro.build.id", "ro.vendor.build.id", "ro.system.build.id"],
    BUILD_ID_PROPS,
)];

const INCREMENTAL: &[Candidate] = &[row(
    &[
        "ro.build.version.incremental",
        "ro.vendor.build.version.incremental",
        "ro.system.build.version.incremental",
    ],
    &[
        "my_manifest/build*.prop",
        "system/system/build_default.prop",
        "vendor/euclid/my_manifest/build.prop",
        "vendor/build*.prop",
        "system/build*.prop",
        "system/system/build*.prop",
        "my_product/build*.prop",
    ],
)];

const TAGS: &[Candidate] = &[row(
    &["ro.build.tags", "ro.vendor.build.tags", "ro.system.build.tags"],
    VENDOR_SYSTEM_PROPS,
)];

const PLATFORM: &[Candidate] = &[row(
    &[
        "ro.board.platform",
        "ro.vendor.board.platform",
        "ro.system.board.platform",
    ],
    VENDOR_SYSTEM_PROPS,
)];

const MANUFACTURER: &[Candidate] = &[
    row(&["ro.product.odm.manufacturer"], &["odm/etc/build*.prop"]),
    row(&["ro.product.manufacturer"], &["odm/etc/fingerprint/build.default.prop"]),
    row(&["ro.product.manufacturer"], &["my_product/build*.prop"]),
    row(&["ro.product.manufacturer"], &["my_manifest/build*.prop"]),
    row(&["ro.product.manufacturer"], &["system/system/build_default.prop"]),
    row(&["ro.product.manufacturer"], &["vendor/euclid/my_manifest/build.prop"]),
    row(&["ro.product.manufacturer"], VENDOR_SYSTEM_PROPS),
    row(&["ro.product.brand.sub"], &["my_product/build*.prop"]),
    row(&["ro.product.brand.sub"], &["system/system/euclid/my_product/build*.prop"]),
    row(&["ro.vendor.product.manufacturer"], &["vendor/build*.prop"]),
    row(&["ro.product.vendor.manufacturer"], &["my_manifest/build*.prop"]),
    row(&["ro.product.vendor.manufacturer"], &["system/system/build_default.prop"]),
    row(&["ro.product.vendor.manufacturer"], &["vendor/euclid/my_manifest/build.prop"]),
    row(&["ro.product.vendor.manufacturer"], &["vendor/build*.prop"]),
    row(&["ro.system.product.manufacturer"], SYSTEM_PROPS),
    row(&["ro.product.system.manufacturer"], SYSTEM_PROPS),
    row(&["ro.product.odm.manufacturer"], &["my_manifest/build*.prop"]),
    row(&["ro.product.odm.manufacturer"], &["system/system/build_default.prop"]),
    row(&["ro.product.odm.manufacturer"], &["vendor/euclid/my_manifest/build.prop"]),
    row(&["ro.product.odm.manufacturer"], &["vendor/odm/etc/build*.prop"]),
    row(&["ro.product.manufacturer"], &["oppo_product/build*.prop", "my_product/build*.prop"]),
    row(&["ro.product.manufacturer"], &["vendor/euclid/*/build.prop"]),
    row(&["ro.system.product.manufacturer"], &["vendor/euclid/*/build.prop"]),
    row(&["ro.product.product.manufacturer"], &["vendor/euclid/product/build*.prop"]),
];

const FINGERPRINT: &[Candidate] = &[
    row(&["ro.odm.build.fingerprint"], &["odm/etc/*build*.prop"]),
    row(&["ro.vendor.build.fingerprint"], &["my_manifest/build*.prop"]),
    row(&["ro.vendor.build.fingerprint"], &["system/system/build_default.prop"]),
    row(&["ro.vendor.build.fingerprint"], &["vendor/euclid/my_manifest/build.prop"]),
    row(&["ro.vendor.build.fingerprint"], &["odm/etc/fingerprint/build.default.prop"]),
    row(&["ro.vendor.build.fingerprint"], &["vendor/build*.prop"]),
    row(&["ro.build.fingerprint"], &["my_manifest/build*.prop"]),
    row(&["ro.build.fingerprint"], &["system/system/build_default.prop"]),
    row(&["ro.build.fingerprint"], &["vendor/euclid/my_manifest/build.prop"]),
    row(&["ro.build.fingerprint"], SYSTEM_PROPS),
    row(&["ro.product.build.fingerprint"], &["product/build*.prop"]),
    row(&["ro.system.build.fingerprint"], SYSTEM_PROPS),
    row(&["ro.build.fingerprint"], &["my_product/build.prop"]),
    row(&["ro.system.build.fingerprint"], &["my_product/build.prop"]),
    row(&["ro.vendor.build.fingerprint"], &["my_product/build.prop"]),
];

const CODENAME: &[Candidate] = &[
    row(&["ro.build.product"], &["product_h/etc/prop/local*.prop"]),
    row(&["ro.product.odm.device"], &["odm/etc/build*.prop"]),
    row(&["ro.product.odm.device"], &["system/system/build_default.prop"]),
    row(&["ro.product.device"], &["odm/etc/fingerprint/build.default.prop"]),
    row(&["ro.product.device"], &["my_manifest/build*.prop"]),
    row(&["ro.product.device"], &["system/system/build_default.prop"]),
    row(&["ro.product.device"], &["vendor/euclid/my_manifest/build.prop"]),
    row(&["ro.product.vendor.device"], &["system/system/build_default.prop"]),
    row(&["ro.product.vendor.device"], &["vendor/euclid/my_manifest/build.prop"]),
    row(&["ro.vendor.product.device"], &["system/system/build_default.prop"]),
    row(&["ro.vendor.product.device"], &["vendor/build*.prop"]),
    row(&["ro.product.vendor.device"], &["vendor/build*.prop"]),
    row(&["ro.product.device"], VENDOR_SYSTEM_PROPS),
    row(&["ro.vendor.product.device.oem"], &["odm/build.prop"]),
    row(&["ro.vendor.product.device.oem"], &["vendor/euclid/odm/build.prop"]),
    row(&["ro.product.vendor.device"], &["my_manifest/build*.prop"]),
    row(&["ro.product.system.device"], SYSTEM_PROPS),
    row(&["ro.product.system.device"], &["vendor/euclid/*/build.prop"]),
    row(&["ro.product.product.device"], &["vendor/euclid/*/build.prop"]),
    row(&["ro.product.product.device"], &["system/system/build_default.prop"]),
    row(&["ro.product.product.model"], &["vendor/euclid/*/build.prop"]),
    row(&["ro.product.device"], &["oppo_product/build*.prop", "my_product/build*.prop"]),
    row(&["ro.product.product.device"], &["oppo_product/build*.prop"]),
    row(&["ro.product.system.device"], &["my_product/build*.prop"]),
    row(&["ro.product.vendor.device"], &["my_product/build*.prop"]),
    row(&["ro.build.product"], VENDOR_SYSTEM_PROPS),
];

const FOTA_VERSION: &[Candidate] = &[row(&["ro.build.fota.version"], SYSTEM_PROPS)];

const BRAND: &[Candidate] = &[
    row(&["ro.product.odm.brand"], &["odm/etc/build*.prop"]),
    row(&["ro.product.odm.brand"], &["system/system/build_default.prop"]),
    row(&["ro.product.brand"], &["odm/etc/fingerprint/build.default.prop"]),
    row(&["ro.product.brand"], &["my_product/build*.prop"]),
    row(&["ro.product.brand"], &["system/system/build_default.prop"]),
    row(&["ro.product.brand"], &["vendor/euclid/my_manifest/build.prop"]),
    row(&["ro.product.brand"], VENDOR_SYSTEM_PROPS),
    row(&["ro.product.brand.sub"], &["my_product/build*.prop"]),
    row(&["ro.product.brand.sub"], &["system/system/euclid/my_product/build*.prop"]),
    row(&["ro.product.vendor.brand"], &["my_manifest/build*.prop"]),
    row(&["ro.product.vendor.brand"], &["system/system/build_default.prop"]),
    row(&["ro.product.vendor.brand"], &["vendor/euclid/my_manifest/build.prop"]),
    row(&["ro.product.vendor.brand"], &["vendor/build*.prop"]),
    row(&["ro.vendor.product.brand"], &["vendor/build*.prop"]),
    row(&["ro.product.system.brand"], SYSTEM_PROPS),
];

/// Applies when the brand is still empty or reads `OPPO`
const OPPO_BRAND: &[Candidate] = &[row(&["ro.product.system.brand"], &["vendor/euclid/*/build.prop"])];

const BRAND_FALLBACK: &[Candidate] = &[
    row(&["ro.product.product.brand"], &["vendor/euclid/product/build*.prop"]),
    row(&["ro.product.odm.brand"], &["my_manifest/build*.prop"]),
    row(&["ro.product.odm.brand"], &["vendor/euclid/my_manifest/build.prop"]),
    row(&["ro.product.odm.brand"], &["vendor/odm/etc/build*.prop"]),
    row(&["ro.product.brand"], &["oppo_product/build*.prop", "my_product/build*.prop"]),
];

const DESCRIPTION: &[Candidate] = &[row(
    &[
        "ro.build.description",
        "ro.vendor.build.description",
        "ro.product.build.description",
        "ro.system.build.description",
    ],
    &[
        "system/build.prop",
        "system/system/build*.prop",
        "vendor/build*.prop",
        "product/build*.prop",
    ],
)];

const AB_UPDATE: &[Candidate] = &[row(
    &["ro.build.ab_update"],
    &[
        "system/build*.prop",
        "system/system/build*.prop",
        "vendor/build*.prop",
    ],
)];

const OPLUS_PIPELINE_KEY: &[Candidate] =
    &[row(&["ro.oplus.pipeline_key"], &["my_manifest/build*.prop"])];

const HONOR_BASE_VERSION: &[Candidate] = &[row(
    &["ro.comp.hl.product_base_version"],
    &["product_h/etc/prop/local*.prop"],
)];

/// Property files of one extracted firmware
pub struct PropertyTree {
    root: PathBuf,
}

impl PropertyTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Files matching `pattern`; a pattern without `*` names a single file
    fn files(&self, pattern: &str) -> Vec<PathBuf> {
        if !pattern.contains('*') {
            let path = self.root.join(pattern);
            return if path.is_file() { vec![path] } else { Vec::new() };
        }

        let escaped = glob::Pattern::escape(&self.root.to_string_lossy());
        let full = format!("{}/{}", escaped, pattern);
        let mut files: Vec<PathBuf> = match glob::glob(&full) {
            Ok(paths) => paths.flatten().filter(|p| p.is_file()).collect(),
            Err(_) => Vec::new(),
        };
        files.sort();
        files
    }

    /// First non-empty value of `key` across the files matching `globs`
    pub fn search(&self, keys: &[&str], globs: &[&str]) -> Option<String> {
        for key in keys {
            for pattern in globs {
                for file in self.files(pattern) {
                    if let Some(value) = read_value(&file, key) {
                        debug!("{} = {} ({})", key, value, file.display());
                        return Some(value);
                    }
                }
            }
        }
        None
    }

    /// First row of `table` that yields a value
    pub fn resolve(&self, table: &[Candidate]) -> Option<String> {
        table.iter().find_map(|c| self.search(c.keys, c.globs))
    }
}

/// First `key=value` line in `file`, when the value is non-empty
fn read_value(file: &Path, key: &str) -> Option<String> {
    let bytes = std::fs::read(file).ok()?;
    let content = String::from_utf8_lossy(&bytes);
    let prefix = format!("{}=", key);

    content
        .lines()
        .find_map(|line| line.strip_prefix(prefix.as_str()))
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Everything known about the dumped build
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceProperties {
    pub flavor: Option<String>,
    pub release: Option<String>,
    pub build_id: Option<String>,
    pub incremental: Option<String>,
    pub tags: Option<String>,
    pub platform: Option<String>,
    pub manufacturer: Option<String>,
    pub fingerprint: Option<String>,
    pub codename: String,
    pub brand: Option<String>,
    pub description: String,
    pub is_ab: bool,
    pub oplus_pipeline_key: Option<String>,
    pub honor_product_base_version: Option<String>,
    pub branch: String,
    /// Vendor namespace the project is published under
    pub repo_subgroup: String,
    /// Project name
    pub repo_name: String,
    pub top_codename: String,
}

impl DeviceProperties {
    /// Resolves every property of the tree at `root`
    ///
    /// # Errors
    /// `codename_unresolved` when no source yields a codename; every other
    /// field may stay empty.
    pub fn resolve(root: &Path) -> Result<Self, StageError> {
        let tree = PropertyTree::new(root);

        let flavor = tree.resolve(FLAVOR);
        let release = tree.resolve(RELEASE);
        let build_id = tree.resolve(BUILD_ID);
        let incremental = tree.resolve(INCREMENTAL);
        let tags = tree.resolve(TAGS);
        let platform = tree.resolve(PLATFORM);
        let manufacturer = tree.resolve(MANUFACTURER);
        let fingerprint = tree.resolve(FINGERPRINT);

        let codename = resolve_codename(&tree, fingerprint.as_deref()).ok_or_else(|| {
            StageError::failed(ErrorKind::CodenameUnresolved, "Codename not detected")
        })?;

        let brand = resolve_brand(&tree, &codename, fingerprint.as_deref(), manufacturer.as_deref());

        let description = tree.resolve(DESCRIPTION).unwrap_or_else(|| {
            [&flavor, &release, &build_id, &incremental, &tags]
                .into_iter()
                .flatten()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(" ")
        });

        let is_ab = tree
            .resolve(AB_UPDATE)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));

        let oplus_pipeline_key = tree.resolve(OPLUS_PIPELINE_KEY);
        let honor_product_base_version = tree.resolve(HONOR_BASE_VERSION);

        let branch = branch_name(
            &description,
            oplus_pipeline_key.as_deref().or(honor_product_base_version.as_deref()),
        );

        let subgroup = brand
            .as_deref()
            .or(manufacturer.as_deref())
            .unwrap_or("unknown")
            .to_lowercase();
        let codename = codename.replace(' ', "_");

        Ok(Self {
            flavor,
            release,
            build_id,
            incremental,
            tags,
            platform: platform.as_deref().map(clean_name),
            manufacturer: manufacturer.as_deref().map(clean_name),
            fingerprint,
            brand,
            description,
            is_ab,
            oplus_pipeline_key,
            honor_product_base_version,
            branch,
            repo_subgroup: clean_name(&subgroup),
            repo_name: clean_name(&codename),
            top_codename: clean_name(&codename),
            codename,
        })
    }

    /// Device record stored on the job
    pub fn to_device_info(&self) -> DeviceInfo {
        DeviceInfo {
            brand: self
                .brand
                .clone()
                .unwrap_or_else(|| self.repo_subgroup.clone()),
            codename: self.codename.clone(),
            fingerprint: self.fingerprint.clone(),
            android_version: self.release.clone(),
            build_id: self.build_id.clone(),
            platform: self.platform.clone(),
            is_ab: self.is_ab,
        }
    }

    /// Where this build gets published
    pub fn repository_info(&self, url: String) -> RepositoryInfo {
        RepositoryInfo {
            namespace: self.repo_subgroup.clone(),
            project: self.repo_name.clone(),
            branch: self.branch.clone(),
            url,
        }
    }
}

fn resolve_codename(tree: &PropertyTree, fingerprint: Option<&str>) -> Option<String> {
    tree.resolve(CODENAME)
        .or_else(|| {
            tree.resolve(FOTA_VERSION)
                .and_then(|v| v.split('-').next().map(str::to_string))
                .filter(|v| !v.is_empty())
        })
        .or_else(|| {
            fingerprint
                .and_then(|f| f.split('/').nth(2))
                .and_then(|segment| segment.split(':').next())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        })
}

fn resolve_brand(
    tree: &PropertyTree,
    codename: &str,
    fingerprint: Option<&str>,
    manufacturer: Option<&str>,
) -> Option<String> {
    let device_specific = format!("odm/etc/{}_build.prop", codename);
    let mut brand = tree
        .search(&["ro.product.odm.brand"], &[device_specific.as_str()])
        .or_else(|| tree.resolve(BRAND));

    if brand.as_deref().is_none_or(|b| b == "OPPO") {
        if let Some(oppo) = tree.resolve(OPPO_BRAND) {
            brand = Some(oppo);
        }
    }

    brand
        .or_else(|| tree.resolve(BRAND_FALLBACK))
        .or_else(|| {
            fingerprint
                .and_then(|f| f.split('/').next())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        })
        .or_else(|| manufacturer.map(str::to_string))
}

/// Branch for a build: its description plus a vendor build key, spaces as dashes
pub fn branch_name(description: &str, vendor_key: Option<&str>) -> String {
    let branch = match vendor_key {
        Some(key) => format!("{}--{}", description, key),
        None => description.to_string(),
    };
    let branch = branch.trim().replace(' ', "-");

    if branch.is_empty() {
        "unknown".to_string()
    } else {
        branch
    }
}

/// Lowercase, dashes for underscores, printable characters only, at most 35 chars
pub fn clean_name(value: &str) -> String {
    value
        .to_lowercase()
        .replace('_', "-")
        .chars()
        .filter(|c| !c.is_control() && (*c == ' ' || !c.is_whitespace()))
        .take(MAX_NAME_LEN)
        .collect()
}

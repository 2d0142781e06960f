//! Firmware extraction
//!
//! Two extractors are supported. The default hands the whole archive to
//! dumpyara. The alternate one runs the Firmware_extractor toolkit and then
//! unpacks every known partition image with a chain of filesystem tools.

use anyhow::Context;
use dumper_core::domain::error::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::context::JobContext;
use crate::repository::tools::{ToolInvocation, ToolRunner, arg, succeeded};
use crate::service::error::StageError;

const EXTRACTOR_REPOSITORY: &str = "https://github.com/AndroidDumps/Firmware_extractor";

/// Partition images unpacked after the toolkit run, in order
pub const PARTITIONS: [&str; 42] = [
    "system",
    "systemex",
    "system_ext",
    "system_other",
    "vendor",
    "cust",
    "odm",
    "odm_ext",
    "oem",
    "factory",
    "product",
    "modem",
    "xrom",
    "oppo_product",
    "opproduct",
    "reserve",
    "india",
    "my_preload",
    "my_odm",
    "my_stock",
    "my_operator",
    "my_country",
    "my_product",
    "my_company",
    "my_engineering",
    "my_heytap",
    "my_custom",
    "my_manifest",
    "my_carrier",
    "my_region",
    "my_bigball",
    "my_version",
    "special_preload",
    "vendor_dlkm",
    "odm_dlkm",
    "system_dlkm",
    "mi_ext",
    "radio",
    "product_h",
    "preas",
    "preavs",
    "preload",
];

/// Directories holding vendor-specific nested images
const NESTED_IMAGE_DIRS: [&str; 3] = ["vendor/euclid", "system/system/euclid", "reserve/reserve"];

/// Which partition extraction failures stop the job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PartitionFailurePolicy {
    /// Only the first partition of the list is critical
    #[default]
    First,
    /// Every failure is fatal
    Strict,
    /// Failures are only reported
    Lenient,
}

impl PartitionFailurePolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" => Some(PartitionFailurePolicy::First),
            "strict" => Some(PartitionFailurePolicy::Strict),
            "lenient" => Some(PartitionFailurePolicy::Lenient),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionFailurePolicy::First => "first",
            PartitionFailurePolicy::Strict => "strict",
            PartitionFailurePolicy::Lenient => "lenient",
        }
    }

    /// Whether a failure of the partition at `index` in [`PARTITIONS`] is fatal
    pub fn is_fatal(&self, index: usize) -> bool {
        match self {
            PartitionFailurePolicy::First => index == 0,
            PartitionFailurePolicy::Strict => true,
            PartitionFailurePolicy::Lenient => false,
        }
    }
}

/// One way of unpacking a partition image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionStrategy {
    Erofs,
    Ext2rd,
    SevenZip,
}

impl PartitionStrategy {
    /// Tried in this order until one succeeds
    pub const CHAIN: [PartitionStrategy; 3] = [
        PartitionStrategy::Erofs,
        PartitionStrategy::Ext2rd,
        PartitionStrategy::SevenZip,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PartitionStrategy::Erofs => "fsck.erofs",
            PartitionStrategy::Ext2rd => "ext2rd",
            PartitionStrategy::SevenZip => "7zz",
        }
    }

    /// Invocation for this strategy, `None` when the toolkit binary is missing
    fn invocation(&self, home: &Path, tree: &Path, partition: &str) -> Option<ToolInvocation> {
        let image = arg(&tree.join(format!("{}.img", partition)));
        let target = tree.join(partition);

        match self {
            PartitionStrategy::Erofs => {
                let tool = home.join("tools").join("fsck.erofs");
                tool.exists().then(|| {
                    ToolInvocation::new(
                        arg(&tool),
                        [format!("--extract={}", arg(&target)), image],
                    )
                })
            }
            PartitionStrategy::Ext2rd => {
                let tool = home.join("tools").join("ext2rd");
                tool.exists().then(|| {
                    ToolInvocation::new(arg(&tool), [image, format!("./{}", partition)])
                        .current_dir(tree)
                })
            }
            PartitionStrategy::SevenZip => Some(ToolInvocation::new(
                "7zz",
                [
                    "-snld".to_string(),
                    "x".to_string(),
                    image,
                    "-y".to_string(),
                    format!("-o{}/", arg(&target)),
                ],
            )),
        }
    }
}

/// Service unpacking a downloaded firmware into the job's tree
pub struct ExtractService {
    tools: Arc<dyn ToolRunner>,
    /// Firmware_extractor checkout
    home: PathBuf,
    policy: PartitionFailurePolicy,
}

impl ExtractService {
    pub fn new(tools: Arc<dyn ToolRunner>, home: PathBuf, policy: PartitionFailurePolicy) -> Self {
        Self {
            tools,
            home,
            policy,
        }
    }

    /// Toolkit checkout; boot image unpacking uses its binaries too
    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Extracts `firmware` into the job's tree directory
    pub async fn extract(&self, ctx: &JobContext, firmware: &Path) -> Result<(), StageError> {
        let tree = ctx.tree_dir();
        tokio::fs::create_dir_all(&tree)
            .await
            .context("Failed to create dump directory")?;

        if ctx.options.use_alternate_extractor {
            self.extract_with_toolkit(ctx, firmware, &tree).await?;
        } else {
            self.extract_with_dumpyara(ctx, firmware, &tree).await?;
        }

        self.expand_nested_images(ctx, &tree).await;
        Ok(())
    }

    async fn extract_with_dumpyara(
        &self,
        ctx: &JobContext,
        firmware: &Path,
        tree: &Path,
    ) -> Result<(), StageError> {
        ctx.log_info("Extracting with dumpyara");

        let invocation = ToolInvocation::new("uvx", ["dumpyara".to_string(), arg(firmware), "-o".to_string(), arg(tree)])
            .current_dir(tree);
        self.run_required(&invocation, "dumpyara").await
    }

    async fn extract_with_toolkit(
        &self,
        ctx: &JobContext,
        firmware: &Path,
        tree: &Path,
    ) -> Result<(), StageError> {
        ctx.log_info("Extracting with Firmware_extractor");
        self.update_toolkit(ctx).await;

        let script = self.home.join("extractor.sh");
        let invocation = ToolInvocation::new("bash", [arg(&script), arg(firmware), arg(tree)])
            .current_dir(tree);
        self.run_required(&invocation, "extractor.sh").await?;

        self.extract_partitions(ctx, tree).await?;
        self.expand_fsg(ctx, tree).await;
        Ok(())
    }

    /// Clones or fast-forwards the toolkit; a stale checkout is still usable
    async fn update_toolkit(&self, ctx: &JobContext) {
        let home = arg(&self.home);
        let invocation = if self.home.join(".git").exists() {
            ToolInvocation::new("git", ["-C", home.as_str(), "pull", "-q", "--rebase"])
        } else {
            ToolInvocation::new("git", ["clone", "-q", EXTRACTOR_REPOSITORY, home.as_str()])
        };

        if !succeeded(self.tools.as_ref(), &invocation).await {
            ctx.log_warning("Could not update Firmware_extractor checkout");
        }
    }

    async fn run_required(&self, invocation: &ToolInvocation, label: &str) -> Result<(), StageError> {
        let output = self
            .tools
            .run(invocation)
            .await
            .map_err(|e| StageError::failed(ErrorKind::ExtractionFailed, format!("{:#}", e)))?;

        if output.success() {
            Ok(())
        } else {
            Err(StageError::failed(
                ErrorKind::ExtractionFailed,
                format!("{} failed: {}", label, output.error_summary()),
            ))
        }
    }

    /// Unpacks every present partition image with the strategy chain
    pub async fn extract_partitions(&self, ctx: &JobContext, tree: &Path) -> Result<(), StageError> {
        for (index, partition) in PARTITIONS.iter().enumerate() {
            let image = tree.join(format!("{}.img", partition));
            if !image.is_file() {
                continue;
            }

            std::fs::create_dir_all(tree.join(partition))
                .with_context(|| format!("Failed to create {} directory", partition))?;

            match self.extract_partition(tree, partition).await {
                Some(strategy) => {
                    ctx.log_info(format!("Extracted {} via {}", partition, strategy.name()));
                    if let Err(e) = std::fs::remove_file(&image) {
                        ctx.log_warning(format!("Could not remove {}.img: {}", partition, e));
                    }
                }
                None if self.policy.is_fatal(index) => {
                    return Err(StageError::failed(
                        ErrorKind::ExtractionFailed,
                        format!("Critical partition extraction failed: {}", partition),
                    ));
                }
                None => ctx.log_warning(format!("Failed to extract {}", partition)),
            }
        }
        Ok(())
    }

    async fn extract_partition(&self, tree: &Path, partition: &str) -> Option<PartitionStrategy> {
        for strategy in PartitionStrategy::CHAIN {
            let Some(invocation) = strategy.invocation(&self.home, tree, partition) else {
                continue;
            };
            if succeeded(self.tools.as_ref(), &invocation).await {
                return Some(strategy);
            }
        }
        None
    }

    /// Expands the modem filesystem image into `radio/fsg`
    async fn expand_fsg(&self, ctx: &JobContext, tree: &Path) {
        let fsg = tree.join("fsg.mbn");
        if !fsg.is_file() {
            return;
        }

        let target = tree.join("radio").join("fsg");
        if let Err(e) = std::fs::create_dir_all(&target) {
            ctx.log_warning(format!("Could not create radio/fsg: {}", e));
            return;
        }

        let invocation = ToolInvocation::new(
            "7zz",
            ["-snld".to_string(), "x".to_string(), arg(&fsg), format!("-o{}", arg(&target))],
        );
        if succeeded(self.tools.as_ref(), &invocation).await {
            remove_consumed(ctx, &fsg);
            ctx.log_info("Extracted fsg.mbn");
        } else {
            ctx.log_warning("Failed to extract fsg.mbn");
        }
    }

    /// Expands images nested inside vendor directories next to themselves
    async fn expand_nested_images(&self, ctx: &JobContext, tree: &Path) {
        for dir in NESTED_IMAGE_DIRS {
            let pattern = tree.join(dir).join("*.img");
            let Ok(paths) = glob::glob(&arg(&pattern)) else {
                continue;
            };

            for image in paths.flatten().filter(|p| p.is_file()) {
                let Some(stem) = image.file_stem().map(|s| s.to_os_string()) else {
                    continue;
                };
                let target = image.with_file_name(stem);
                let name = image
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();

                if let Err(e) = std::fs::create_dir_all(&target) {
                    ctx.log_warning(format!("Could not create directory for {}: {}", name, e));
                    continue;
                }

                let invocation = ToolInvocation::new(
                    "7zz",
                    ["-snld".to_string(), "x".to_string(), arg(&image), format!("-o{}", arg(&target))],
                );
                if succeeded(self.tools.as_ref(), &invocation).await {
                    remove_consumed(ctx, &image);
                    ctx.log_info(format!("Extracted {}", name));
                } else {
                    ctx.log_warning(format!("Failed to extract {}", name));
                }
            }
        }
    }
}

/// Deletes a file whose contents were extracted; one that is already gone is fine
pub(crate) fn remove_consumed(ctx: &JobContext, path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| arg(path));
            ctx.log_warning(format!("Could not remove {}: {}", name, e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeTools, fail, ok, write_file};
    use dumper_core::domain::job::{Job, JobOptions, NotificationContext};
    use dumper_core::domain::progress::LogLevel;
    use uuid::Uuid;

    fn alternate_context(root: &Path) -> Arc<JobContext> {
        let options = JobOptions {
            use_alternate_extractor: true,
            ..Default::default()
        };
        let job = Job::new(
            Uuid::new_v4(),
            "https://example.com/fw.zip".to_string(),
            options,
            NotificationContext::default(),
            chrono::Utc::now(),
        );
        JobContext::new(&job, root.to_path_buf())
    }

    /// Toolkit run that leaves the given partition images in the tree;
    /// 7zz fails for every partition in `broken`
    fn toolkit(images: &'static [&'static str], broken: &'static [&'static str]) -> Arc<FakeTools> {
        FakeTools::new(move |inv| {
            if inv.program == "bash" {
                let tree = PathBuf::from(&inv.args[2]);
                for image in images {
                    write_file(&tree.join(format!("{}.img", image)), "image");
                }
                return Ok(ok());
            }
            if inv.program == "7zz" {
                let image = &inv.args[2];
                if broken.iter().any(|b| image.ends_with(&format!("/{}.img", b))) {
                    return Ok(fail(2));
                }
            }
            Ok(ok())
        })
    }

    #[test]
    fn test_policy_parsing_and_fatality() {
        assert_eq!(PartitionFailurePolicy::parse("Strict"), Some(PartitionFailurePolicy::Strict));
        assert_eq!(PartitionFailurePolicy::parse("bogus"), None);
        assert_eq!(PartitionFailurePolicy::default().as_str(), "first");

        assert!(PartitionFailurePolicy::First.is_fatal(0));
        assert!(!PartitionFailurePolicy::First.is_fatal(4));
        assert!(PartitionFailurePolicy::Strict.is_fatal(4));
        assert!(!PartitionFailurePolicy::Lenient.is_fatal(0));
    }

    #[test]
    fn test_partition_list_starts_with_system() {
        assert_eq!(PARTITIONS[0], "system");
        assert_eq!(PARTITIONS[PARTITIONS.len() - 1], "preload");
    }

    #[tokio::test]
    async fn test_dumpyara_failure_is_extraction_failed() {
        let root = tempfile::tempdir().unwrap();
        let job = Job::new(
            Uuid::new_v4(),
            "https://example.com/fw.zip".to_string(),
            JobOptions::default(),
            NotificationContext::default(),
            chrono::Utc::now(),
        );
        let ctx = JobContext::new(&job, root.path().to_path_buf());
        let tools = FakeTools::new(|_| Ok(fail(1)));

        let service = ExtractService::new(
            tools.clone(),
            root.path().join("toolkit"),
            PartitionFailurePolicy::First,
        );
        let err = service
            .extract(&ctx, &root.path().join("fw.zip"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ExtractionFailed);
        assert_eq!(tools.calls()[0].args[0], "dumpyara");
    }

    #[tokio::test]
    async fn test_first_partition_failing_every_tool_is_fatal() {
        let root = tempfile::tempdir().unwrap();
        let home = root.path().join("toolkit");
        write_file(&home.join("tools").join("fsck.erofs"), "");
        write_file(&home.join("tools").join("ext2rd"), "");

        let ctx = alternate_context(root.path());
        let tools = FakeTools::new(|inv| {
            if inv.program == "bash" {
                write_file(&PathBuf::from(&inv.args[2]).join("system.img"), "image");
                Ok(ok())
            } else if inv.program == "git" {
                Ok(ok())
            } else {
                Ok(fail(1))
            }
        });

        let service = ExtractService::new(tools.clone(), home, PartitionFailurePolicy::First);
        let err = service
            .extract(&ctx, &root.path().join("fw.zip"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ExtractionFailed);
        assert!(err.to_string().contains("system"));
        assert_eq!(
            tools.programs()[2..].iter().map(|p| p.rsplit('/').next().unwrap().to_string()).collect::<Vec<_>>(),
            vec!["fsck.erofs", "ext2rd", "7zz"]
        );
    }

    #[tokio::test]
    async fn test_later_partition_failure_is_a_warning() {
        let root = tempfile::tempdir().unwrap();
        let ctx = alternate_context(root.path());
        let tools = toolkit(&["system", "vendor"], &["vendor"]);

        let service = ExtractService::new(
            tools.clone(),
            root.path().join("toolkit"),
            PartitionFailurePolicy::First,
        );
        service
            .extract(&ctx, &root.path().join("fw.zip"))
            .await
            .unwrap();

        let tree = ctx.tree_dir();
        assert!(!tree.join("system.img").exists());
        assert!(tree.join("vendor.img").exists());

        let warnings: Vec<_> = ctx
            .drain_progress()
            .into_iter()
            .filter(|e| e.level == LogLevel::Warning)
            .map(|e| e.message)
            .collect();
        assert!(warnings.contains(&"Failed to extract vendor".to_string()));
    }

    #[tokio::test]
    async fn test_strict_policy_stops_on_any_partition() {
        let root = tempfile::tempdir().unwrap();
        let ctx = alternate_context(root.path());
        let tools = toolkit(&["system", "vendor"], &["vendor"]);

        let service = ExtractService::new(
            tools,
            root.path().join("toolkit"),
            PartitionFailurePolicy::Strict,
        );
        let err = service
            .extract(&ctx, &root.path().join("fw.zip"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ExtractionFailed);
    }

    #[tokio::test]
    async fn test_toolkit_is_cloned_when_missing_and_pulled_when_present() {
        let root = tempfile::tempdir().unwrap();
        let home = root.path().join("toolkit");
        let ctx = alternate_context(root.path());

        let tools = toolkit(&[], &[]);
        let service = ExtractService::new(tools.clone(), home.clone(), PartitionFailurePolicy::First);
        service.extract(&ctx, &root.path().join("fw.zip")).await.unwrap();
        assert_eq!(tools.calls_to("git")[0].args[0], "clone");

        std::fs::create_dir_all(home.join(".git")).unwrap();
        let tools = toolkit(&[], &[]);
        let service = ExtractService::new(tools.clone(), home, PartitionFailurePolicy::First);
        service.extract(&ctx, &root.path().join("fw.zip")).await.unwrap();
        assert_eq!(tools.calls_to("git")[0].args[2], "pull");
    }

    #[tokio::test]
    async fn test_nested_vendor_images_are_expanded() {
        let root = tempfile::tempdir().unwrap();
        let ctx = alternate_context(root.path());
        let tree = ctx.tree_dir();
        write_file(&tree.join("vendor/euclid/my_product.img"), "image");

        let tools = toolkit(&[], &[]);
        let service = ExtractService::new(
            tools.clone(),
            root.path().join("toolkit"),
            PartitionFailurePolicy::First,
        );
        service.extract(&ctx, &root.path().join("fw.zip")).await.unwrap();

        assert!(!tree.join("vendor/euclid/my_product.img").exists());
        assert!(tree.join("vendor/euclid/my_product").is_dir());
        let expand = tools.calls_to("7zz");
        assert!(expand[0].args[3].ends_with("vendor/euclid/my_product"));
    }

    #[tokio::test]
    async fn test_undeletable_image_is_reported() {
        let root = tempfile::tempdir().unwrap();
        let ctx = alternate_context(root.path());
        let tree = ctx.tree_dir();
        write_file(&tree.join("vendor/euclid/my_product.img"), "image");

        // 7zz leaves a directory where the image was, which remove_file refuses
        let tools = FakeTools::new(|inv| {
            if inv.program == "7zz" {
                let image = PathBuf::from(&inv.args[2]);
                std::fs::remove_file(&image).unwrap();
                std::fs::create_dir_all(&image).unwrap();
            }
            Ok(ok())
        });
        let service = ExtractService::new(
            tools,
            root.path().join("toolkit"),
            PartitionFailurePolicy::First,
        );
        service.extract(&ctx, &root.path().join("fw.zip")).await.unwrap();

        let entries = ctx.drain_progress();
        assert!(entries.iter().any(|e| e.level == LogLevel::Warning
            && e.message.starts_with("Could not remove my_product.img")));
        assert!(entries.iter().any(|e| e.message == "Extracted my_product.img"));
    }
}

//! Boot image processing
//!
//! Collects the boot images at the tree root and derives kernel artifacts
//! and decompiled device trees from them. Nothing here is critical: every
//! failure is reported as a warning and the dump carries on.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

use crate::context::JobContext;
use crate::repository::tools::{ToolInvocation, ToolRunner, arg, succeeded};
use crate::service::extract::remove_consumed;

/// Boot images, in processing order
pub const BOOT_IMAGES: [&str; 5] = [
    "init_boot.img",
    "vendor_kernel_boot.img",
    "vendor_boot.img",
    "boot.img",
    "dtbo.img",
];

const VMLINUX_TO_ELF: &str = "git+https://github.com/marin-m/vmlinux-to-elf@master";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BootImageKind {
    Kernel,
    Vendor,
    Overlay,
}

impl BootImageKind {
    fn of(name: &str) -> Option<Self> {
        match name {
            "boot.img" => Some(BootImageKind::Kernel),
            "vendor_boot.img" | "vendor_kernel_boot.img" | "init_boot.img" => {
                Some(BootImageKind::Vendor)
            }
            "dtbo.img" => Some(BootImageKind::Overlay),
            _ => None,
        }
    }
}

pub struct BootImageService {
    tools: Arc<dyn ToolRunner>,
    /// Firmware_extractor checkout providing `unpackbootimg`
    home: PathBuf,
}

impl BootImageService {
    pub fn new(tools: Arc<dyn ToolRunner>, home: PathBuf) -> Self {
        Self { tools, home }
    }

    /// Processes every boot image found in the job's tree
    pub async fn process(&self, ctx: &JobContext) {
        let tree = ctx.tree_dir();
        collect_boot_images(ctx, &tree);

        for name in BOOT_IMAGES {
            let image = tree.join(name);
            let Some(kind) = BootImageKind::of(name) else {
                continue;
            };
            if !image.is_file() {
                continue;
            }

            ctx.log_info(format!("Processing {}", name));
            let output_dir = tree.join(name.trim_end_matches(".img"));
            if let Err(e) = std::fs::create_dir_all(&output_dir) {
                ctx.log_warning(format!("Could not create {}: {}", arg(&output_dir), e));
                continue;
            }

            let unpack = ctx.options.use_alternate_extractor;
            match kind {
                BootImageKind::Kernel => {
                    if unpack {
                        self.unpack(ctx, &image, &output_dir).await;
                    }
                    self.kernel_artifacts(ctx, &image, &tree).await;
                    self.device_trees(ctx, &image, &output_dir.join("dtb"), &output_dir.join("dts"))
                        .await;
                }
                BootImageKind::Vendor => {
                    if unpack {
                        self.unpack(ctx, &image, &output_dir).await;
                    }
                    self.device_trees(ctx, &image, &output_dir.join("dtb"), &output_dir.join("dts"))
                        .await;
                }
                BootImageKind::Overlay => {
                    self.device_trees(ctx, &image, &output_dir, &output_dir.join("dts"))
                        .await;
                }
            }
        }
    }

    async fn unpack(&self, ctx: &JobContext, image: &Path, output_dir: &Path) {
        let unpackbootimg = self.home.join("tools").join("unpackbootimg");
        if !unpackbootimg.exists() {
            return;
        }

        let invocation = ToolInvocation::new(
            arg(&unpackbootimg),
            ["-i".to_string(), arg(image), "-o".to_string(), arg(output_dir)],
        );
        if !succeeded(self.tools.as_ref(), &invocation).await {
            ctx.log_warning(format!("Failed to unpack {}", file_name(image)));
            return;
        }

        self.ramdisk(ctx, output_dir).await;
    }

    /// Decompresses an LZ4 or gzip ramdisk into `<output_dir>/ramdisk`
    async fn ramdisk(&self, ctx: &JobContext, output_dir: &Path) {
        let pattern = output_dir.join("*-ramdisk*");
        let Some(ramdisk) = glob::glob(&arg(&pattern))
            .ok()
            .and_then(|mut paths| paths.find_map(Result::ok))
        else {
            return;
        };

        let file_type = match self
            .tools
            .run(&ToolInvocation::new("file", [arg(&ramdisk)]))
            .await
        {
            Ok(output) if output.success() => output.stdout,
            _ => return,
        };
        if !file_type.contains("LZ4") && !file_type.contains("gzip") {
            return;
        }

        let ramdisk_dir = output_dir.join("ramdisk");
        let decompressed = output_dir.join("ramdisk.lz4");
        if std::fs::create_dir_all(&ramdisk_dir).is_err() {
            return;
        }

        let unlz4 = ToolInvocation::new("unlz4", [arg(&ramdisk), arg(&decompressed)]);
        if !succeeded(self.tools.as_ref(), &unlz4).await || !decompressed.exists() {
            ctx.log_warning("Failed to decompress ramdisk");
            return;
        }

        let expand = ToolInvocation::new(
            "7zz",
            [
                "-snld".to_string(),
                "x".to_string(),
                arg(&decompressed),
                format!("-o{}", arg(&ramdisk_dir)),
            ],
        );
        if !succeeded(self.tools.as_ref(), &expand).await {
            ctx.log_warning("Failed to extract ramdisk");
        }
        remove_consumed(ctx, &decompressed);
    }

    /// ikconfig, kallsyms.txt and boot.elf at the tree root
    async fn kernel_artifacts(&self, ctx: &JobContext, image: &Path, tree: &Path) {
        let ikconfig = tree.join("ikconfig");
        self.capture(
            ctx,
            ToolInvocation::new("extract-ikconfig", [arg(image)]).stdout_to(&ikconfig),
            &ikconfig,
            "ikconfig",
        )
        .await;

        let kallsyms = tree.join("kallsyms.txt");
        self.capture(
            ctx,
            ToolInvocation::new(
                "uvx",
                [
                    "--from".to_string(),
                    VMLINUX_TO_ELF.to_string(),
                    "kallsyms-finder".to_string(),
                    arg(image),
                ],
            )
            .stdout_to(&kallsyms),
            &kallsyms,
            "kallsyms.txt",
        )
        .await;

        let elf = tree.join("boot.elf");
        let invocation = ToolInvocation::new(
            "uvx",
            [
                "--from".to_string(),
                VMLINUX_TO_ELF.to_string(),
                "vmlinux-to-elf".to_string(),
                arg(image),
                arg(&elf),
            ],
        );
        if succeeded(self.tools.as_ref(), &invocation).await && elf.exists() {
            ctx.log_info("Extracted boot.elf");
        } else {
            ctx.log_warning("Failed to extract boot.elf");
        }
    }

    /// Runs a tool whose stdout is the artifact; a failed run leaves no file behind
    async fn capture(&self, ctx: &JobContext, invocation: ToolInvocation, target: &Path, label: &str) {
        if succeeded(self.tools.as_ref(), &invocation).await && target.exists() {
            ctx.log_info(format!("Extracted {}", label));
        } else {
            ctx.log_warning(format!("Failed to extract {}", label));
            remove_consumed(ctx, target);
        }
    }

    /// Extracts device tree blobs and decompiles them to sources
    async fn device_trees(&self, ctx: &JobContext, image: &Path, dtb_dir: &Path, dts_dir: &Path) {
        if std::fs::create_dir_all(dtb_dir).is_err() || std::fs::create_dir_all(dts_dir).is_err() {
            ctx.log_warning(format!("Could not create device tree directories for {}", file_name(image)));
            return;
        }

        let extract = ToolInvocation::new(
            "extract-dtb",
            [arg(image), "-o".to_string(), arg(dtb_dir)],
        );
        if !succeeded(self.tools.as_ref(), &extract).await {
            ctx.log_warning(format!("{}: no device-tree blobs found", file_name(image)));
            return;
        }

        match std::fs::remove_dir_all(dtb_dir.join("00_kernel")) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => ctx.log_warning(format!("Could not remove 00_kernel: {}", e)),
        }

        let mut blobs: Vec<PathBuf> = glob::glob(&arg(&dtb_dir.join("*.dtb")))
            .map(|paths| paths.flatten().collect())
            .unwrap_or_default();
        blobs.sort();

        for blob in blobs {
            let Some(stem) = blob.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
                continue;
            };
            let source = dts_dir.join(format!("{}.dts", stem));
            let invocation = ToolInvocation::new(
                "dtc",
                ["-q", "-I", "dtb", "-O", "dts"]
                    .into_iter()
                    .map(String::from)
                    .chain(std::iter::once(arg(&blob))),
            )
            .stdout_to(&source);

            if !succeeded(self.tools.as_ref(), &invocation).await {
                ctx.log_warning(format!("Failed to decompile {}", file_name(&blob)));
                remove_consumed(ctx, &source);
            }
        }
    }
}

/// Moves boot images found deeper in the tree up to the root
fn collect_boot_images(ctx: &JobContext, tree: &Path) {
    for name in BOOT_IMAGES {
        let root_copy = tree.join(name);
        if root_copy.exists() {
            continue;
        }

        let found = WalkDir::new(tree)
            .min_depth(2)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
            .find(|e| e.file_type().is_file() && e.file_name() == name);

        if let Some(entry) = found {
            match std::fs::rename(entry.path(), &root_copy) {
                Ok(()) => ctx.log_info(format!("Moved {} to the dump root", name)),
                Err(e) => ctx.log_warning(format!("Could not move {}: {}", name, e)),
            }
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

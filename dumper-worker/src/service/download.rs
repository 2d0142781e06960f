//! Download service
//!
//! Turns a job URL into exactly one firmware file in the job's download
//! directory:
//! - Local paths are copied
//! - Xiaomi CDN URLs are moved to the fastest reachable mirror
//! - Share links are rewritten to direct links
//! - Hosting services with their own protocol get a dedicated tool
//! - Everything else goes through aria2c with a wget fallback

use anyhow::Context;
use dumper_core::domain::error::ErrorKind;
use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::context::JobContext;
use crate::repository::reachability::UrlChecker;
use crate::repository::tools::{ToolInvocation, ToolRunner, arg, succeeded};
use crate::service::error::StageError;
use crate::service::retry::{RetryPolicy, with_backoff};

/// Xiaomi OTA mirrors, fastest first
const XIAOMI_MIRRORS: [&str; 3] = [
    "https://cdnorg.d.miui.com",
    "https://bkt-sgp-miui-ota-update-alisgp.oss-ap-southeast-1.aliyuncs.com",
    "https://bn.d.miui.com",
];

/// The firmware file that ended up in the download directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFirmware {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
}

impl DownloadedFirmware {
    /// Status line kept on the live message once the download is done
    pub fn summary(&self) -> String {
        format!("Downloaded {} ({})", self.name, format_file_size(self.size))
    }
}

/// Program used to fetch a URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadTool {
    GoogleDrive,
    MediaFire,
    Mega,
    /// aria2c, falling back to wget
    Direct,
}

impl DownloadTool {
    pub fn for_url(url: &str) -> Self {
        if url.contains("drive.google.com") {
            DownloadTool::GoogleDrive
        } else if url.contains("mediafire.com") {
            DownloadTool::MediaFire
        } else if url.contains("mega.nz") {
            DownloadTool::Mega
        } else {
            DownloadTool::Direct
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DownloadTool::GoogleDrive => "gdown",
            DownloadTool::MediaFire => "mediafire-dl",
            DownloadTool::Mega => "megatools",
            DownloadTool::Direct => "aria2c",
        }
    }

    /// Invocation for the dedicated tools; they pick the file name themselves
    fn invocation(&self, url: &str, dir: &Path) -> Option<ToolInvocation> {
        let invocation = match self {
            DownloadTool::GoogleDrive => {
                ToolInvocation::new("uvx", ["gdown@5.2.0", "-q", url, "--fuzzy"])
            }
            DownloadTool::MediaFire => ToolInvocation::new(
                "uvx",
                [
                    "--from",
                    "git+https://github.com/Juvenal-Yescas/mediafire-dl@master",
                    "mediafire-dl",
                    url,
                ],
            ),
            DownloadTool::Mega => ToolInvocation::new("megatools", ["dl", url]),
            DownloadTool::Direct => return None,
        };
        Some(invocation.current_dir(dir))
    }
}

/// Service fetching firmware for a job
pub struct DownloadService {
    tools: Arc<dyn ToolRunner>,
    checker: Arc<dyn UrlChecker>,
}

impl DownloadService {
    pub fn new(tools: Arc<dyn ToolRunner>, checker: Arc<dyn UrlChecker>) -> Self {
        Self { tools, checker }
    }

    /// Downloads the job's firmware
    ///
    /// # Returns
    /// The single file left in the download directory
    pub async fn download(&self, ctx: &JobContext) -> Result<DownloadedFirmware, StageError> {
        let dir = ctx.download_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .context("Failed to create download directory")?;

        let local = Path::new(&ctx.url);
        if local.is_file() {
            self.copy_local(ctx, local, &dir).await?;
        } else {
            let url = self.optimize_url(ctx, &ctx.url).await;
            self.fetch(ctx, &url, &dir).await?;
        }

        let firmware = single_file(&dir)?;
        ctx.log_info(firmware.summary());
        Ok(firmware)
    }

    async fn copy_local(&self, ctx: &JobContext, source: &Path, dir: &Path) -> Result<(), StageError> {
        let name = source
            .file_name()
            .ok_or_else(|| StageError::failed(ErrorKind::DownloadFailed, "Local path has no file name"))?;

        ctx.log_info(format!("Copying local file {}", source.display()));
        tokio::fs::copy(source, dir.join(name))
            .await
            .with_context(|| format!("Failed to copy {}", source.display()))?;
        Ok(())
    }

    /// Applies the mirror choice and share-link rewriting
    async fn optimize_url(&self, ctx: &JobContext, url: &str) -> String {
        let mirrored = select_mirror(self.checker.as_ref(), url).await;
        if mirrored != url {
            ctx.log_info(format!("Using mirror {}", mirrored));
        }

        let rewritten = rewrite_share_link(&mirrored);
        if rewritten != mirrored {
            ctx.log_info(format!("Rewrote share link to {}", rewritten));
        }
        rewritten
    }

    async fn fetch(&self, ctx: &JobContext, url: &str, dir: &Path) -> Result<(), StageError> {
        let tool = DownloadTool::for_url(url);
        ctx.log_info(format!("Downloading with {}", tool.name()));

        if let Some(invocation) = tool.invocation(url, dir) {
            let output = self
                .tools
                .run(&invocation)
                .await
                .map_err(|e| StageError::failed(ErrorKind::DownloadFailed, format!("{:#}", e)))?;

            if !output.success() {
                return Err(StageError::failed(
                    ErrorKind::DownloadFailed,
                    format!("{} failed: {}", tool.name(), output.error_summary()),
                ));
            }
            return Ok(());
        }

        let name = file_name_from_url(url);
        let aria2c = ToolInvocation::new(
            "aria2c",
            [
                "-q",
                "-s16",
                "-x16",
                "--check-certificate=false",
                "-o",
                name.as_str(),
                url,
            ],
        )
        .current_dir(dir);

        if succeeded(self.tools.as_ref(), &aria2c).await {
            return Ok(());
        }

        ctx.log_warning("aria2c failed, retrying with wget");
        clear_dir(dir).context("Failed to remove partial download")?;

        let wget = ToolInvocation::new(
            "wget",
            ["-q", "--no-check-certificate", "-O", name.as_str(), url],
        )
        .current_dir(dir);

        let output = self
            .tools
            .run(&wget)
            .await
            .map_err(|e| StageError::failed(ErrorKind::DownloadFailed, format!("{:#}", e)))?;

        if !output.success() {
            return Err(StageError::failed(
                ErrorKind::DownloadFailed,
                format!("Both aria2c and wget failed: {}", output.error_summary()),
            ));
        }

        Ok(())
    }
}

/// Ordered mirror candidates for a Xiaomi CDN URL, original last
///
/// Empty when the URL is not on the Xiaomi CDN or already on a fast mirror.
pub fn mirror_candidates(url: &str) -> Vec<String> {
    if !url.contains("d.miui.com")
        || url.contains("cdnorg")
        || url.contains("bkt-sgp-miui-ota-update-alisgp")
    {
        return Vec::new();
    }

    let Ok(parsed) = reqwest::Url::parse(url) else {
        return Vec::new();
    };

    let mut path = parsed.path().to_string();
    if let Some(query) = parsed.query() {
        path.push('?');
        path.push_str(query);
    }

    XIAOMI_MIRRORS
        .iter()
        .map(|base| format!("{}{}", base, path))
        .chain(std::iter::once(url.to_string()))
        .collect()
}

/// Checks every candidate concurrently and keeps the first reachable one in list order
pub async fn select_mirror(checker: &dyn UrlChecker, url: &str) -> String {
    let candidates = mirror_candidates(url);
    if candidates.is_empty() {
        return url.to_string();
    }

    let results = join_all(candidates.iter().map(|c| is_reachable(checker, c))).await;

    candidates
        .into_iter()
        .zip(results)
        .find(|(_, reachable)| *reachable)
        .map(|(candidate, _)| candidate)
        .unwrap_or_else(|| url.to_string())
}

/// Any answer except 404 counts as reachable
async fn is_reachable(checker: &dyn UrlChecker, url: &str) -> bool {
    let result = with_backoff(&RetryPolicy::MIRROR, "Mirror check", |_| true, || {
        checker.head(url)
    })
    .await;

    match result {
        Ok(status) => {
            debug!("Check {} -> {}", url, status);
            status != 404
        }
        Err(e) => {
            debug!("Check {} failed: {:#}", url, e);
            false
        }
    }
}

/// Turns pixeldrain share pages into direct download links
pub fn rewrite_share_link(url: &str) -> String {
    let id = url.trim_end_matches('/').rsplit('/').next().unwrap_or_default();

    if url.contains("pixeldrain.com/u/") {
        format!("https://pd.cybar.xyz/{}", id)
    } else if url.contains("pixeldrain.com/d/") {
        format!("https://pixeldrain.com/api/filesystem/{}", id)
    } else {
        url.to_string()
    }
}

/// Last path segment without query string or fragment
pub fn file_name_from_url(url: &str) -> String {
    let without_fragment = url.split('#').next().unwrap_or(url);
    let without_query = without_fragment.split('?').next().unwrap_or(without_fragment);
    let name = without_query
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default();

    if name.is_empty() || name.contains(':') {
        "firmware".to_string()
    } else {
        name.to_string()
    }
}

/// Human readable size with one decimal, 1024-based
pub fn format_file_size(bytes: u64) -> String {
    let mut size = bytes as f64;
    for unit in ["B", "KB", "MB", "GB"] {
        if size < 1024.0 {
            return format!("{:.1} {}", size, unit);
        }
        size /= 1024.0;
    }
    format!("{:.1} TB", size)
}

/// Requires exactly one regular file in `dir`
fn single_file(dir: &Path) -> Result<DownloadedFirmware, StageError> {
    let mut files = Vec::new();
    let entries = std::fs::read_dir(dir).context("Failed to list download directory")?;
    for entry in entries {
        let entry = entry.context("Failed to list download directory")?;
        let metadata = entry.metadata().context("Failed to stat downloaded file")?;
        if metadata.is_file() {
            files.push((entry.path(), metadata.len()));
        }
    }

    match files.len() {
        0 => Err(StageError::failed(
            ErrorKind::DownloadFailed,
            "No file found after download",
        )),
        1 => {
            let (path, size) = files.remove(0);
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            info!("Downloaded {} ({} bytes)", name, size);
            Ok(DownloadedFirmware { path, name, size })
        }
        n => Err(StageError::failed(
            ErrorKind::DownloadFailed,
            format!("Download is ambiguous: {} files in {}", n, arg(dir)),
        )),
    }
}

fn clear_dir(dir: &Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::reachability::MockUrlChecker;
    use crate::testing::{FakeTools, arg_after, fail, ok, write_file};
    use dumper_core::domain::job::{Job, JobOptions, NotificationContext};
    use uuid::Uuid;

    const MIUI_URL: &str =
        "https://bigota.d.miui.com/V14.0.8.0.TMRMIXM/miui_MARBLEGlobal_V14.0.8.0.zip?t=1";

    fn context(url: &str, root: &Path) -> Arc<JobContext> {
        let job = Job::new(
            Uuid::new_v4(),
            url.to_string(),
            JobOptions::default(),
            NotificationContext::default(),
            chrono::Utc::now(),
        );
        JobContext::new(&job, root.to_path_buf())
    }

    fn unreachable_checker() -> MockUrlChecker {
        let mut checker = MockUrlChecker::new();
        checker.expect_head().returning(|_| Ok(404));
        checker
    }

    #[test]
    fn test_mirror_candidates_order() {
        let candidates = mirror_candidates(MIUI_URL);
        assert_eq!(
            candidates,
            vec![
                "https://cdnorg.d.miui.com/V14.0.8.0.TMRMIXM/miui_MARBLEGlobal_V14.0.8.0.zip?t=1",
                "https://bkt-sgp-miui-ota-update-alisgp.oss-ap-southeast-1.aliyuncs.com/V14.0.8.0.TMRMIXM/miui_MARBLEGlobal_V14.0.8.0.zip?t=1",
                "https://bn.d.miui.com/V14.0.8.0.TMRMIXM/miui_MARBLEGlobal_V14.0.8.0.zip?t=1",
                MIUI_URL,
            ]
        );
    }

    #[test]
    fn test_mirror_skipped_for_other_hosts() {
        assert!(mirror_candidates("https://example.com/fw.zip").is_empty());
        assert!(mirror_candidates("https://cdnorg.d.miui.com/a/fw.zip").is_empty());
    }

    #[tokio::test]
    async fn test_only_second_mirror_reachable_is_chosen() {
        let candidates = mirror_candidates(MIUI_URL);
        let second = candidates[1].clone();

        let mut checker = MockUrlChecker::new();
        let reachable = second.clone();
        checker
            .expect_head()
            .returning(move |url| if url == reachable { Ok(200) } else { Ok(404) });

        assert_eq!(select_mirror(&checker, MIUI_URL).await, second);
    }

    #[tokio::test]
    async fn test_earlier_mirror_wins_over_later() {
        let mut checker = MockUrlChecker::new();
        checker.expect_head().returning(|url| {
            if url.contains("cdnorg") {
                anyhow::bail!("connect timeout")
            } else {
                Ok(200)
            }
        });

        let chosen = select_mirror(&checker, MIUI_URL).await;
        assert!(chosen.starts_with("https://bkt-sgp-miui-ota-update-alisgp"));
    }

    #[tokio::test]
    async fn test_all_mirrors_down_keeps_original() {
        let checker = unreachable_checker();
        assert_eq!(select_mirror(&checker, MIUI_URL).await, MIUI_URL);
    }

    #[tokio::test]
    async fn test_non_miui_url_is_not_checked() {
        let mut checker = MockUrlChecker::new();
        checker.expect_head().never();
        assert_eq!(
            select_mirror(&checker, "https://example.com/fw.zip").await,
            "https://example.com/fw.zip"
        );
    }

    #[test]
    fn test_share_link_rewriting() {
        assert_eq!(
            rewrite_share_link("https://pixeldrain.com/u/abc123"),
            "https://pd.cybar.xyz/abc123"
        );
        assert_eq!(
            rewrite_share_link("https://pixeldrain.com/d/xyz"),
            "https://pixeldrain.com/api/filesystem/xyz"
        );
        assert_eq!(
            rewrite_share_link("https://example.com/fw.zip"),
            "https://example.com/fw.zip"
        );
    }

    #[test]
    fn test_tool_routing() {
        assert_eq!(
            DownloadTool::for_url("https://drive.google.com/file/d/1/view"),
            DownloadTool::GoogleDrive
        );
        assert_eq!(
            DownloadTool::for_url("https://www.mediafire.com/file/x/fw.zip"),
            DownloadTool::MediaFire
        );
        assert_eq!(DownloadTool::for_url("https://mega.nz/file/x"), DownloadTool::Mega);
        assert_eq!(DownloadTool::for_url("https://example.com/fw.zip"), DownloadTool::Direct);
    }

    #[test]
    fn test_file_name_strips_query_and_fragment() {
        assert_eq!(file_name_from_url("https://a.b/c/fw.zip?x=1#frag"), "fw.zip");
        assert_eq!(file_name_from_url("https://a.b/c/fw%20v2.zip"), "fw%20v2.zip");
        assert_eq!(file_name_from_url("https://a.b/"), "a.b");
        assert_eq!(file_name_from_url("https://"), "firmware");
    }

    #[test]
    fn test_format_file_size_units() {
        assert_eq!(format_file_size(512), "512.0 B");
        assert_eq!(format_file_size(1536), "1.5 KB");
        assert_eq!(format_file_size(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_file_size(3 * 1024 * 1024 * 1024), "3.0 GB");
        assert_eq!(format_file_size(2 * 1024u64.pow(4)), "2.0 TB");
    }

    #[tokio::test]
    async fn test_aria2c_failure_falls_back_to_wget() {
        let root = tempfile::tempdir().unwrap();
        let ctx = context("https://example.com/files/fw.zip?token=1", root.path());

        let tools = FakeTools::new(|inv| {
            let dir = inv.cwd.clone().unwrap();
            match inv.program.as_str() {
                "aria2c" => {
                    write_file(&dir.join("fw.zip.aria2"), "partial");
                    Ok(fail(3))
                }
                "wget" => {
                    let name = arg_after(inv, "-O").unwrap();
                    write_file(&dir.join(name), "firmware bytes");
                    Ok(ok())
                }
                other => panic!("unexpected tool {}", other),
            }
        });

        let service = DownloadService::new(tools.clone(), Arc::new(unreachable_checker()));
        let firmware = service.download(&ctx).await.unwrap();

        assert_eq!(tools.programs(), vec!["aria2c", "wget"]);
        assert_eq!(firmware.name, "fw.zip");
        assert_eq!(firmware.size, "firmware bytes".len() as u64);
        assert_eq!(firmware.summary(), "Downloaded fw.zip (14.0 B)");
    }

    #[tokio::test]
    async fn test_empty_download_dir_is_download_failed() {
        let root = tempfile::tempdir().unwrap();
        let ctx = context("https://example.com/fw.zip", root.path());

        let service = DownloadService::new(FakeTools::succeeding(), Arc::new(unreachable_checker()));
        let err = service.download(&ctx).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::DownloadFailed);
    }

    #[tokio::test]
    async fn test_multiple_files_are_ambiguous() {
        let root = tempfile::tempdir().unwrap();
        let ctx = context("https://mega.nz/file/abc", root.path());

        let tools = FakeTools::new(|inv| {
            let dir = inv.cwd.clone().unwrap();
            write_file(&dir.join("part1.zip"), "a");
            write_file(&dir.join("part2.zip"), "b");
            Ok(ok())
        });

        let service = DownloadService::new(tools.clone(), Arc::new(unreachable_checker()));
        let err = service.download(&ctx).await.unwrap_err();

        assert_eq!(tools.programs(), vec!["megatools"]);
        assert_eq!(err.kind(), ErrorKind::DownloadFailed);
        assert!(err.to_string().contains("ambiguous"));
    }

    #[tokio::test]
    async fn test_local_file_is_copied() {
        let root = tempfile::tempdir().unwrap();
        let source = root.path().join("incoming").join("local.zip");
        write_file(&source, "local firmware");

        let ctx = context(source.to_str().unwrap(), &root.path().join("job"));
        let tools = FakeTools::succeeding();
        let mut checker = MockUrlChecker::new();
        checker.expect_head().never();

        let service = DownloadService::new(tools.clone(), Arc::new(checker));
        let firmware = service.download(&ctx).await.unwrap();

        assert!(tools.calls().is_empty());
        assert_eq!(firmware.name, "local.zip");
        assert_eq!(firmware.path, ctx.download_dir().join("local.zip"));
    }

    #[tokio::test]
    async fn test_google_drive_uses_gdown() {
        let root = tempfile::tempdir().unwrap();
        let url = "https://drive.google.com/file/d/1abc/view";
        let ctx = context(url, root.path());

        let tools = FakeTools::new(|inv| {
            write_file(&inv.cwd.clone().unwrap().join("drive.zip"), "x");
            Ok(ok())
        });
        let mut checker = MockUrlChecker::new();
        checker.expect_head().never();

        let service = DownloadService::new(tools.clone(), Arc::new(checker));
        service.download(&ctx).await.unwrap();

        let calls = tools.calls();
        assert_eq!(calls[0].program, "uvx");
        assert_eq!(calls[0].args, vec!["gdown@5.2.0", "-q", url, "--fuzzy"]);
    }
}

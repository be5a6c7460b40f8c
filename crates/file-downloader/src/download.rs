use std::path::{Path, PathBuf};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::info;

pub const DEFAULT_REGISTRY_URL: &str = "https://huggingface.co";

pub struct FileDownloadConfig {
    pub url: String,
    pub resources_dir: PathBuf,
}

pub struct FileDownload {
    url: String,
    resources_dir: PathBuf,
}

impl Default for FileDownloadConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_REGISTRY_URL.to_string(),
            resources_dir: PathBuf::from("resources"),
        }
    }
}

impl FileDownload {
    pub fn new(config: FileDownloadConfig) -> Self {
        Self {
            url: config.url.trim_end_matches('/').to_string(),
            resources_dir: config.resources_dir,
        }
    }

    /// Location of `file_name` of `repo_id` on the registry, relative to its url.
    pub fn repo_file_uri(repo_id: &str, revision: &str, file_name: &str) -> String {
        format!("{}/resolve/{}/{}", repo_id, revision, file_name)
    }

    /// Where `file_name` of `repo_id` is kept locally.
    pub fn repo_file_path(&self, repo_id: &str, file_name: &str) -> PathBuf {
        self.resources_dir.join(repo_id).join(file_name)
    }

    pub async fn download_to_path_if_not_exists(
        &self,
        uri: impl AsRef<str>,
        file_path: impl AsRef<Path>,
    ) -> anyhow::Result<PathBuf> {
        let file_path = file_path.as_ref().to_path_buf();
        info!("check file path: {:?}", file_path);
        if file_path.exists() {
            return Ok(file_path);
        }

        let temp_download_path = file_path.with_extension("temp");
        let download_url = format!("{}/{}", self.url, uri.as_ref().trim_start_matches('/'));

        info!("downloading {}", download_url);
        let mut response = reqwest::get(&download_url).await?.error_for_status()?;

        // create parent folder
        if let Some(parent_dir) = file_path.parent() {
            fs::create_dir_all(parent_dir).await?;
        }

        let mut file = File::create(&temp_download_path).await?;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        fs::rename(&temp_download_path, &file_path).await?;

        info!("file {:?} downloaded", file_path);

        Ok(file_path)
    }

    /// Fetches one file of a model repository, e.g. `config.json` of
    /// `microsoft/git-base`, unless it is already under `resources_dir`.
    pub async fn download_repo_file_if_not_exists(
        &self,
        repo_id: &str,
        revision: &str,
        file_name: &str,
    ) -> anyhow::Result<PathBuf> {
        let uri = Self::repo_file_uri(repo_id, revision, file_name);
        let file_path = self.repo_file_path(repo_id, file_name);
        self.download_to_path_if_not_exists(uri, file_path)
            .await
            .map_err(|e| anyhow::anyhow!("failed to fetch {} from {}: {}", file_name, repo_id, e))
    }
}

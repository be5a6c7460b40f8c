mod download;
pub use download::*;

#[cfg(test)]
fn scratch_dir(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("file-downloader-{}-{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

#[test]
fn test_repo_file_location() {
    assert_eq!(
        FileDownload::repo_file_uri("microsoft/git-base", "main", "config.json"),
        "microsoft/git-base/resolve/main/config.json"
    );

    let download = FileDownload::new(FileDownloadConfig {
        resources_dir: std::path::PathBuf::from("models"),
        ..Default::default()
    });
    assert_eq!(
        download.repo_file_path("microsoft/git-base", "tokenizer.json"),
        std::path::PathBuf::from("models/microsoft/git-base/tokenizer.json")
    );
}

#[tokio::test]
async fn test_existing_file_is_not_downloaded() {
    let resources_dir = scratch_dir("existing");
    let download = FileDownload::new(FileDownloadConfig {
        // nothing listens here, any request would fail
        url: "http://127.0.0.1:9".to_string(),
        resources_dir: resources_dir.clone(),
    });

    let local = download.repo_file_path("microsoft/git-base", "config.json");
    std::fs::create_dir_all(local.parent().unwrap()).unwrap();
    std::fs::write(&local, b"{}").unwrap();

    let res = download
        .download_repo_file_if_not_exists("microsoft/git-base", "main", "config.json")
        .await;

    assert_eq!(res.unwrap(), local);
    let _ = std::fs::remove_dir_all(resources_dir);
}

#[tokio::test]
async fn test_failed_download_leaves_no_file() {
    let resources_dir = scratch_dir("failed");
    let download = FileDownload::new(FileDownloadConfig {
        url: "http://127.0.0.1:9".to_string(),
        resources_dir: resources_dir.clone(),
    });

    let res = download
        .download_repo_file_if_not_exists("microsoft/git-base", "main", "model.safetensors")
        .await;

    assert!(res.is_err());
    assert!(!download
        .repo_file_path("microsoft/git-base", "model.safetensors")
        .exists());
    let _ = std::fs::remove_dir_all(resources_dir);
}

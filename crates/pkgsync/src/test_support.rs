//! Git fixtures and an in-memory registry for pipeline tests.

use std::collections::BTreeSet;
use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::anyhow;
use pkgsync_config::Config;
use pkgsync_registry::{PackageRegistry, RegistryReceipt, RegistryTarget, UploadError};
use pkgsync_version::PackageVersion;
use tempfile::{TempDir, tempdir};

use crate::Pipeline;

pub const MANIFEST: &str = r#"{
    "name": "acme/widgets",
    "type": "library",
    "require": {
        "php": ">=8.1"
    }
}
"#;

/// Run git in `dir`, panicking on failure, and return trimmed stdout.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args([
            "-c",
            "user.name=Test User",
            "-c",
            "user.email=test@example.com",
            "-c",
            "commit.gpgsign=false",
            "-c",
            "tag.gpgsign=false",
        ])
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Delete { package: String, version: String },
    Upload { file_name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadMode {
    Accept,
    Reject,
    Fail,
}

#[derive(Debug)]
struct State {
    calls: Vec<Call>,
    stored: BTreeSet<(String, String)>,
    manifests: Vec<String>,
    artifacts: Vec<Vec<u8>>,
    upload_mode: UploadMode,
    delete_fails: bool,
    jam_index_of: Option<PathBuf>,
}

/// Registry double keyed by `(package, normalized version)`.
///
/// Uploads open the zip and read `composer.json` out of it, the way the
/// real registry indexes a package.
#[derive(Debug)]
pub struct FakeRegistry {
    state: Mutex<State>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                calls: Vec::new(),
                stored: BTreeSet::new(),
                manifests: Vec::new(),
                artifacts: Vec::new(),
                upload_mode: UploadMode::Accept,
                delete_fails: false,
                jam_index_of: None,
            }),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn set_upload_mode(&self, mode: UploadMode) {
        self.state.lock().expect("lock").upload_mode = mode;
    }

    pub fn set_delete_fails(&self, fails: bool) {
        self.state.lock().expect("lock").delete_fails = fails;
    }

    /// Leave `.git/index.lock` in `working_copy` during the next upload so
    /// the reset after it fails.
    pub fn jam_index_on_upload(&self, working_copy: PathBuf) {
        self.state.lock().expect("lock").jam_index_of = Some(working_copy);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().expect("lock").calls.clone()
    }

    pub fn manifests(&self) -> Vec<String> {
        self.state.lock().expect("lock").manifests.clone()
    }

    pub fn artifacts(&self) -> Vec<Vec<u8>> {
        self.state.lock().expect("lock").artifacts.clone()
    }

    pub fn stored(&self) -> usize {
        self.state.lock().expect("lock").stored.len()
    }

    pub fn max_concurrent_uploads(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl PackageRegistry for FakeRegistry {
    fn delete_if_exists(
        &self,
        _target: &RegistryTarget,
        package: &str,
        version: &PackageVersion,
    ) -> anyhow::Result<bool> {
        let mut state = self.state.lock().expect("lock");
        state.calls.push(Call::Delete {
            package: package.to_string(),
            version: version.raw.clone(),
        });
        if state.delete_fails {
            return Err(anyhow!("registry listing failed"));
        }
        Ok(state
            .stored
            .remove(&(package.to_string(), version.normalized.clone())))
    }

    fn upload(
        &self,
        _target: &RegistryTarget,
        artifact: &Path,
    ) -> Result<RegistryReceipt, UploadError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));

        let result = self.record_upload(artifact);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl FakeRegistry {
    fn record_upload(&self, artifact: &Path) -> Result<RegistryReceipt, UploadError> {
        let file_name = artifact
            .file_name()
            .and_then(|n| n.to_str())
            .expect("artifact file name")
            .to_string();
        let bytes = fs::read(artifact).expect("artifact readable at upload");
        let manifest = zip_entry(&bytes, "composer.json").expect("composer.json in artifact");
        let parsed: serde_json::Value = serde_json::from_str(&manifest).expect("manifest json");

        let mut state = self.state.lock().expect("lock");
        state.calls.push(Call::Upload {
            file_name: file_name.clone(),
        });
        state.manifests.push(manifest);
        state.artifacts.push(bytes);
        if let Some(working_copy) = state.jam_index_of.take() {
            fs::write(working_copy.join(".git/index.lock"), "").expect("write index lock");
        }

        match state.upload_mode {
            UploadMode::Reject => Err(UploadError::Rejected {
                status: 422,
                message: "duplicate".to_string(),
            }),
            UploadMode::Fail => Err(UploadError::Failed(anyhow!("registry unavailable"))),
            UploadMode::Accept => {
                let name = parsed["name"].as_str().unwrap_or_default().to_string();
                let version = parsed["version_normalized"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                state.stored.insert((name.clone(), version.clone()));
                Ok(RegistryReceipt {
                    slug_perm: format!("slug-{}", state.calls.len()),
                    name: Some(name),
                    version: Some(version),
                    self_html_url: None,
                })
            }
        }
    }
}

/// Entry names of a zip archive, in archive order.
pub fn zip_entries(bytes: &[u8]) -> Vec<String> {
    let archive = zip::ZipArchive::new(Cursor::new(bytes)).expect("zip archive");
    archive.file_names().map(str::to_string).collect()
}

/// Contents of one text entry of a zip archive, if present.
pub fn zip_entry(bytes: &[u8], name: &str) -> Option<String> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).expect("zip archive");
    let mut file = archive.by_name(name).ok()?;
    let mut content = String::new();
    file.read_to_string(&mut content).expect("zip entry");
    Some(content)
}

/// A remote repository, scratch directories and a fake registry.
pub struct Fixture {
    _td: TempDir,
    root: PathBuf,
    pub remote: PathBuf,
    pub url: String,
    pub registry: Arc<FakeRegistry>,
}

impl Fixture {
    pub fn new() -> Self {
        let td = tempdir().expect("tempdir");
        let root = td.path().to_path_buf();
        let remote = root.join("remote").join("widgets");
        fs::create_dir_all(&remote).expect("mkdir remote");

        git(&remote, &["init", "--quiet"]);
        git(&remote, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        fs::write(remote.join("composer.json"), MANIFEST).expect("write manifest");
        fs::create_dir_all(remote.join("src")).expect("mkdir src");
        fs::write(remote.join("src/Widget.php"), "<?php\n\nclass Widget {}\n").expect("write src");
        git(&remote, &["add", "-A"]);
        git(&remote, &["commit", "--quiet", "-m", "initial"]);

        let url = remote.to_string_lossy().to_string();
        Self {
            _td: td,
            root,
            remote,
            url,
            registry: Arc::new(FakeRegistry::new()),
        }
    }

    pub fn config(&self) -> Config {
        let toml = format!(
            r#"
owner = "acme"
target_repository = "composer"
repositories_dir = '{}'
artifacts_dir = '{}'

[[repositories]]
url = '{}'
"#,
            self.repos_dir().display(),
            self.artifacts_dir().display(),
            self.url,
        );
        let config = Config::from_toml_str(&toml, None).expect("config");
        config.validate().expect("valid config");
        config
    }

    pub fn pipeline(&self) -> Pipeline {
        self.pipeline_with(|_| {})
    }

    pub fn pipeline_with(&self, customize: impl FnOnce(&mut Config)) -> Pipeline {
        let mut config = self.config();
        customize(&mut config);
        let registry: Arc<dyn PackageRegistry> = self.registry.clone();
        Pipeline::new(config, registry)
    }

    pub fn repos_dir(&self) -> PathBuf {
        self.root.join("repos")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.root.join("artifacts")
    }

    pub fn working_copy(&self) -> PathBuf {
        let config = self.config();
        config
            .working_copy_path(&config.repositories[0])
            .expect("working copy path")
    }

    pub fn artifact(&self, commit: &str) -> PathBuf {
        self.artifacts_dir()
            .join(format!("acme-widgets-{commit}.zip"))
    }

    pub fn head(&self) -> String {
        git(&self.remote, &["rev-parse", "HEAD"])
    }

    pub fn working_copy_is_clean(&self) -> bool {
        pkgsync_git::is_clean(&self.working_copy()).expect("status")
    }

    pub fn commit_manifest(&self, content: &str) {
        self.commit_file("composer.json", content);
    }

    pub fn commit_file(&self, relative: &str, content: &str) {
        let path = self.remote.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("mkdir");
        }
        fs::write(&path, content).expect("write");
        git(&self.remote, &["add", "-A"]);
        git(&self.remote, &["commit", "--quiet", "-m", &format!("update {relative}")]);
    }
}

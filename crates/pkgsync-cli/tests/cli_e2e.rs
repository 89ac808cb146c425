use std::fs;
use std::path::Path;
use std::process;
use std::thread;

use assert_cmd::Command;
use insta::assert_snapshot;
use predicates::str::contains;
use tempfile::tempdir;
use tiny_http::{Header, Response, Server, StatusCode};

fn write_file(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("mkdir");
    }
    fs::write(path, content).expect("write");
}

fn git(dir: &Path, args: &[&str]) -> String {
    let output = process::Command::new("git")
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

fn create_package_repo(dir: &Path) -> String {
    fs::create_dir_all(dir).expect("mkdir");
    git(dir, &["init", "--quiet"]);
    git(dir, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    write_file(
        &dir.join("composer.json"),
        "{\n    \"name\": \"acme/widgets\",\n    \"type\": \"library\"\n}\n",
    );
    write_file(&dir.join("src/Widget.php"), "<?php\n");
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "--quiet", "-m", "initial"]);
    git(dir, &["tag", "v1.4.0"]);
    git(dir, &["rev-parse", "HEAD"])
}

fn normalize_output(raw: &str, root: &Path) -> String {
    raw.replace(&root.display().to_string(), "<ROOT>")
        .replace('\\', "/")
}

fn pkgsync_cmd() -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("pkgsync"));
    cmd.env_remove("PKGSYNC_WEBHOOK_SECRET")
        .env_remove("CLOUDSMITH_API_KEY")
        .env("RUST_LOG", "warn");
    cmd
}

#[derive(Debug)]
struct SeenRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}

struct TestRegistry {
    base_url: String,
    handle: thread::JoinHandle<Vec<SeenRequest>>,
}

/// Answers list, upload and package-creation calls for `acme/composer`.
fn spawn_registry(expected_requests: usize) -> TestRegistry {
    let server = Server::http("127.0.0.1:0").expect("server");
    let base_url = format!("http://{}", server.server_addr());

    let handle = thread::spawn(move || {
        let mut seen = Vec::new();
        for _ in 0..expected_requests {
            let mut req = server.recv().expect("request");
            let method = req.method().to_string();
            let path = req.url().split('?').next().unwrap_or_default().to_string();
            let mut body = Vec::new();
            req.as_reader().read_to_end(&mut body).expect("body");

            let (status, payload) = match (method.as_str(), path.as_str()) {
                ("GET", "/v1/packages/acme/composer/") => (200, "[]".to_string()),
                ("PUT", p) if p.starts_with("/files/acme/composer/") => {
                    (200, r#"{"identifier": "file-1"}"#.to_string())
                }
                ("POST", "/v1/packages/acme/composer/upload/composer/") => (
                    201,
                    r#"{"slug_perm": "Pkg123", "name": "acme/widgets", "version": "1.4.0"}"#
                        .to_string(),
                ),
                _ => (404, r#"{"detail": "Not found."}"#.to_string()),
            };

            seen.push(SeenRequest { method, path, body });
            let resp = Response::from_string(payload)
                .with_status_code(StatusCode(status))
                .with_header(Header::from_bytes("Content-Type", "application/json").expect("header"));
            req.respond(resp).expect("respond");
        }
        seen
    });

    TestRegistry { base_url, handle }
}

fn write_config(root: &Path, repo_url: &str, api: &str) -> std::path::PathBuf {
    let path = root.join("pkgsync.toml");
    write_file(
        &path,
        &format!(
            r#"
owner = "acme"
target_repository = "composer"
repositories_dir = "repos"
artifacts_dir = "artifacts"

[server]
listen = "127.0.0.1:0"

[registry]
api_base = "{api}"
upload_base = "{api}/files"
timeout_secs = 30

[[repositories]]
url = '{repo_url}'
publish_source = true
"#
        ),
    );
    path
}

#[test]
fn version_command_for_tags_and_branches() {
    let td = tempdir().expect("tempdir");

    let out = pkgsync_cmd()
        .current_dir(td.path())
        .args(["version", "--ref", "refs/tags/v2.1.0-RC1"])
        .output()
        .expect("run");
    assert!(out.status.success());
    assert_snapshot!(String::from_utf8(out.stdout).expect("utf8").trim_end(), @r"
    kind: tag
    version: v2.1.0-RC1
    normalized: 2.1.0.0-RC1
    ");

    pkgsync_cmd()
        .current_dir(td.path())
        .args(["version", "--ref", "refs/heads/1.x"])
        .assert()
        .success()
        .stdout(contains("version: 1.x-dev"))
        .stdout(contains("normalized: 1.9999999.9999999.9999999-dev"));

    pkgsync_cmd()
        .current_dir(td.path())
        .args(["version", "--ref", "refs/heads/main"])
        .assert()
        .success()
        .stdout(contains("version: dev-main"));
}

#[test]
fn version_command_rejects_unpublishable_refs() {
    let td = tempdir().expect("tempdir");
    pkgsync_cmd()
        .current_dir(td.path())
        .args(["version", "--ref", "refs/heads/feature/login"])
        .assert()
        .failure()
        .stderr(contains("is not a development branch"));
}

#[test]
fn version_command_honours_configured_branches() {
    let td = tempdir().expect("tempdir");
    let config = td.path().join("custom.toml");
    write_file(
        &config,
        "owner = \"acme\"\ntarget_repository = \"composer\"\n\n[versioning]\ndev_branches = [\"next\"]\n",
    );

    pkgsync_cmd()
        .args(["--config", config.to_str().expect("utf8"), "version", "--ref", "next"])
        .assert()
        .success()
        .stdout(contains("version: dev-next"));
}

#[test]
fn check_command_lists_repositories() {
    let td = tempdir().expect("tempdir");
    write_config(td.path(), "git@github.com:acme/widgets.git", "https://api.example.test");

    let out = pkgsync_cmd()
        .current_dir(td.path())
        .arg("check")
        .output()
        .expect("run");
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let stdout = String::from_utf8(out.stdout).expect("utf8");
    assert_snapshot!(normalize_output(&stdout, td.path()).trim_end(), @r"
    owner: acme
    target_repository: composer
    repositories_dir: <ROOT>/repos
    artifacts_dir: <ROOT>/artifacts
    webhook: 127.0.0.1:0 /webhook
    signature_verification: off
    api_key_configured: false

    git@github.com:acme/widgets.git -> <ROOT>/repos/github.com_acme_widgets [source]
    ");
}

#[test]
fn check_command_fails_on_invalid_config() {
    let td = tempdir().expect("tempdir");
    let config = td.path().join("broken.toml");
    write_file(&config, "owner = \"\"\ntarget_repository = \"composer\"\n");

    pkgsync_cmd()
        .args(["--config", config.to_str().expect("utf8"), "check"])
        .assert()
        .failure()
        .stderr(contains("`owner` must not be empty"));
}

#[test]
fn check_command_fails_without_config() {
    let td = tempdir().expect("tempdir");
    pkgsync_cmd()
        .current_dir(td.path())
        .args(["--config", "missing.toml", "check"])
        .assert()
        .failure()
        .stderr(contains("failed to load configuration"));
}

#[test]
fn sync_command_publishes_tag_end_to_end() {
    let td = tempdir().expect("tempdir");
    let remote = td.path().join("upstream/widgets");
    let commit = create_package_repo(&remote);
    let repo_url = remote.display().to_string();

    let registry = spawn_registry(3);
    let config = write_config(td.path(), &repo_url, &registry.base_url);

    pkgsync_cmd()
        .args([
            "--config",
            config.to_str().expect("utf8"),
            "sync",
            "--repository",
            &repo_url,
            "--ref",
            "refs/tags/v1.4.0",
        ])
        .assert()
        .success()
        .stdout(contains("published acme/widgets@v1.4.0 (1.4.0.0)"))
        .stdout(contains(format!("commit: {commit}")))
        .stdout(contains("slug: Pkg123"));

    let seen = registry.handle.join().expect("join");
    let calls: Vec<_> = seen.iter().map(|r| format!("{} {}", r.method, r.path)).collect();
    assert_eq!(
        calls,
        vec![
            "GET /v1/packages/acme/composer/".to_string(),
            format!("PUT /files/acme/composer/acme-widgets-{commit}.zip"),
            "POST /v1/packages/acme/composer/upload/composer/".to_string(),
        ]
    );
    assert!(seen[1].body.starts_with(b"PK"));

    // working copy reset, artifact cleaned up
    let working_copy = fs::read_dir(td.path().join("repos"))
        .expect("repos dir")
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|p| p.is_dir())
        .expect("working copy");
    assert!(git(&working_copy, &["status", "--porcelain"]).is_empty());
    assert!(!td.path().join(format!("artifacts/acme-widgets-{commit}.zip")).exists());
}

#[test]
fn sync_command_reports_unconfigured_repository() {
    let td = tempdir().expect("tempdir");
    let config = write_config(td.path(), "git@github.com:acme/widgets.git", "http://127.0.0.1:9");

    pkgsync_cmd()
        .args([
            "--config",
            config.to_str().expect("utf8"),
            "sync",
            "--repository",
            "git@github.com:acme/other.git",
            "--ref",
            "refs/heads/main",
        ])
        .assert()
        .failure()
        .stderr(contains("repository not configured"));
}

#[test]
fn sync_command_json_output_for_skips() {
    let td = tempdir().expect("tempdir");
    let remote = td.path().join("upstream/widgets");
    create_package_repo(&remote);
    git(&remote, &["branch", "feature/login"]);
    let repo_url = remote.display().to_string();
    let config = write_config(td.path(), &repo_url, "http://127.0.0.1:9");

    let out = pkgsync_cmd()
        .args([
            "--config",
            config.to_str().expect("utf8"),
            "--json",
            "sync",
            "--repository",
            &repo_url,
            "--ref",
            "refs/heads/feature/login",
        ])
        .output()
        .expect("run");
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let outcome: serde_json::Value =
        serde_json::from_slice(&out.stdout).expect("json outcome on stdout");
    assert_eq!(outcome["outcome"], "skipped");
    assert_eq!(outcome["package"], "acme/widgets");
    assert_eq!(outcome["reference"], "feature/login");
}

#[test]
fn help_lists_commands() {
    pkgsync_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("serve"))
        .stdout(contains("sync"))
        .stdout(contains("version"))
        .stdout(contains("check"));
}

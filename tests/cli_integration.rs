use assert_cmd::Command;

use std::{
    fs,
    io::{BufRead, BufReader, Read, Write},
    net::{TcpListener, TcpStream},
    path::Path,
    process::{Child, Stdio},
    sync::{Mutex, MutexGuard},
    time::Duration,
};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

const DAEMON_WAIT_ATTEMPTS: usize = 100;
const DAEMON_WAIT_STEP_MILLIS: u64 = 20;
static DAEMON_TEST_LOCK: Mutex<()> = Mutex::new(());

fn daemon_test_guard() -> MutexGuard<'static, ()> {
    match DAEMON_TEST_LOCK.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn cloak() -> Command {
    let mut command = Command::new(assert_cmd::cargo::cargo_bin!("cloak"));
    command.env_remove("CLOAK_CONFIG").env_remove("RUST_LOG");
    command
}

fn stdout_of(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr_of(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn connect_with_retry(address: &str) -> TcpStream {
    for _ in 0..DAEMON_WAIT_ATTEMPTS {
        if let Ok(stream) = TcpStream::connect(address) {
            return stream;
        }
        std::thread::sleep(Duration::from_millis(DAEMON_WAIT_STEP_MILLIS));
    }
    panic!("daemon endpoint was not reachable in time: {address}");
}

fn reserve_loopback_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

struct DaemonEnv<'a> {
    root: &'a Path,
    path_var: String,
    tmp_dir: &'a Path,
}

fn spawn_daemon_with_retry(env: &DaemonEnv<'_>) -> (Child, String) {
    let binary = assert_cmd::cargo::cargo_bin!("cloak");
    let root = env.root.to_str().unwrap();
    let mut last_bind_error = String::new();

    for _ in 0..DAEMON_WAIT_ATTEMPTS {
        let bind = format!("127.0.0.1:{}", reserve_loopback_port());
        let mut child = std::process::Command::new(binary)
            .args(["--no-config", "--root", root, "daemon", "--bind", &bind])
            .env("PATH", &env.path_var)
            .env("TMPDIR", env.tmp_dir)
            .env_remove("CLOAK_CONFIG")
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();

        std::thread::sleep(Duration::from_millis(DAEMON_WAIT_STEP_MILLIS));
        match child.try_wait().unwrap() {
            Some(_status) => {
                let mut stderr = String::new();
                if let Some(mut pipe) = child.stderr.take() {
                    let _ = pipe.read_to_string(&mut stderr);
                }
                if stderr.contains("Address already in use") {
                    last_bind_error = stderr;
                    continue;
                }
                panic!("daemon failed to start: {stderr}");
            }
            None => return (child, bind),
        }
    }

    panic!("failed to spawn daemon after retries; last error: {last_bind_error}");
}

fn send_raw_request(bind: &str, line: &str) -> serde_json::Value {
    let mut stream = connect_with_retry(bind);
    stream.write_all(line.as_bytes()).unwrap();
    stream.write_all(b"\n").unwrap();
    let mut response = String::new();
    BufReader::new(stream).read_line(&mut response).unwrap();
    serde_json::from_str(&response).unwrap()
}

fn vault_cmd(bind: &str, args: &[&str]) -> std::process::Output {
    let mut full = vec!["--no-config", "vault", "--bind", bind];
    full.extend_from_slice(args);
    cloak().args(full).output().unwrap()
}

fn list_vaults(bind: &str) -> Vec<serde_json::Value> {
    let output = vault_cmd(bind, &["list"]);
    assert!(output.status.success(), "{}", stderr_of(&output));
    serde_json::from_str(&stdout_of(&output)).unwrap()
}

fn stop_daemon(mut child: Child) {
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(unix)]
fn write_executable(path: &Path, body: &str) {
    fs::write(path, body).unwrap();
    let mut permissions = fs::metadata(path).unwrap().permissions();
    permissions.set_mode(0o755);
    fs::set_permissions(path, permissions).unwrap();
}

#[cfg(unix)]
fn install_fake_runtime(bin_dir: &Path) {
    fs::create_dir_all(bin_dir).unwrap();
    write_executable(
        &bin_dir.join("gocryptfs"),
        r#"#!/usr/bin/env bash
read -r password
if [[ "$password" != "hunter2" ]]; then
  echo "Password incorrect." >&2
  exit 12
fi
trap 'exit 15' INT
while true; do
  sleep 0.05
done
"#,
    );
    write_executable(&bin_dir.join("fusermount"), "#!/usr/bin/env bash\nexit 0\n");
}

#[cfg(unix)]
fn fake_path(bin_dir: &Path) -> String {
    let current_path = std::env::var("PATH").unwrap_or_default();
    format!("{}:{}", bin_dir.display(), current_path)
}

#[test]
fn version_prints_name_and_version() {
    let output = cloak().arg("version").output().unwrap();
    assert!(output.status.success());
    assert_eq!(
        stdout_of(&output).trim(),
        format!("cloak {}", env!("CARGO_PKG_VERSION"))
    );

    let output = cloak().args(["ver", "--json"]).output().unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&stdout_of(&output)).unwrap();
    assert_eq!(parsed["name"], "cloak");
    assert_eq!(parsed["version"], env!("CARGO_PKG_VERSION"));
}

#[test]
fn explain_known_and_unknown_codes() {
    let output = cloak().args(["explain", "e400"]).output().unwrap();
    assert!(output.status.success());
    assert!(stdout_of(&output).contains("E400"));

    let output = cloak().args(["explain", "E777"]).output().unwrap();
    assert_eq!(output.status.code(), Some(1));
    let stderr = stderr_of(&output);
    assert!(stderr.contains("error[E100]"), "{stderr}");
    assert!(stderr.contains("E400"), "{stderr}");
}

#[test]
fn explain_runs_even_with_broken_config() {
    let temp_dir = tempfile::tempdir().unwrap();
    let config_path = temp_dir.path().join("broken.toml");
    fs::write(&config_path, "version = 9\n").unwrap();

    cloak()
        .args(["--config", config_path.to_str().unwrap(), "explain", "E301"])
        .assert()
        .success();
}

#[test]
fn config_validate_reports_defaults_and_warns_on_missing_runtime() {
    let temp_dir = tempfile::tempdir().unwrap();
    let empty_bin = temp_dir.path().join("empty-bin");
    fs::create_dir_all(&empty_bin).unwrap();

    let output = cloak()
        .current_dir(temp_dir.path())
        .env("PATH", &empty_bin)
        .args(["--no-config", "config", "validate"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", stderr_of(&output));
    assert_eq!(stdout_of(&output).trim(), "ok (defaults)");
    assert!(stderr_of(&output).contains("warning:"));
}

#[cfg(unix)]
#[test]
fn config_validate_loads_explicit_file() {
    let temp_dir = tempfile::tempdir().unwrap();
    let config_path = temp_dir.path().join("custom.toml");
    fs::write(
        &config_path,
        "version = 1\n\n[mount]\ngrace_period_ms = 500\n",
    )
    .unwrap();
    let mut permissions = fs::metadata(&config_path).unwrap().permissions();
    permissions.set_mode(0o600);
    fs::set_permissions(&config_path, permissions).unwrap();

    let output = cloak()
        .args(["--config", config_path.to_str().unwrap(), "config", "validate"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", stderr_of(&output));
    assert!(stdout_of(&output).contains("custom.toml"));
}

#[test]
fn config_validate_rejects_invalid_file() {
    let temp_dir = tempfile::tempdir().unwrap();
    let config_path = temp_dir.path().join("bad.toml");
    fs::write(&config_path, "version = 1\nunknown = true\n").unwrap();
    #[cfg(unix)]
    {
        let mut permissions = fs::metadata(&config_path).unwrap().permissions();
        permissions.set_mode(0o600);
        fs::set_permissions(&config_path, permissions).unwrap();
    }

    let output = cloak()
        .args(["--config", config_path.to_str().unwrap(), "config", "validate"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr_of(&output).contains("error[E100]"));
}

#[test]
fn daemon_check_fails_without_runtime() {
    let _guard = daemon_test_guard();
    let temp_dir = tempfile::tempdir().unwrap();
    let empty_bin = temp_dir.path().join("empty-bin");
    fs::create_dir_all(&empty_bin).unwrap();
    let bind = format!("127.0.0.1:{}", reserve_loopback_port());

    let output = cloak()
        .env("PATH", &empty_bin)
        .args([
            "--no-config",
            "--root",
            temp_dir.path().join("root").to_str().unwrap(),
            "daemon",
            "--bind",
            &bind,
            "--check",
        ])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr_of(&output).contains("error[E103]"));
}

#[test]
fn daemon_rejects_non_loopback_bind() {
    let temp_dir = tempfile::tempdir().unwrap();
    let output = cloak()
        .args([
            "--no-config",
            "--root",
            temp_dir.path().to_str().unwrap(),
            "daemon",
            "--bind",
            "0.0.0.0:7789",
            "--check",
        ])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr_of(&output).contains("loopback"));
}

#[test]
fn vault_command_without_daemon_explains_how_to_start_it() {
    let bind = format!("127.0.0.1:{}", reserve_loopback_port());
    let output = vault_cmd(&bind, &["list"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr_of(&output).contains("cloak daemon"));
}

#[cfg(unix)]
#[test]
fn daemon_reports_missing_runtime_per_request() {
    let _guard = daemon_test_guard();
    let temp_dir = tempfile::tempdir().unwrap();
    let empty_bin = temp_dir.path().join("empty-bin");
    fs::create_dir_all(&empty_bin).unwrap();
    let env = DaemonEnv {
        root: &temp_dir.path().join("root"),
        path_var: format!("{}:/usr/bin:/bin", empty_bin.display()),
        tmp_dir: temp_dir.path(),
    };
    let (child, bind) = spawn_daemon_with_retry(&env);

    let pong = send_raw_request(&bind, r#"{"action":"ping"}"#);
    assert_eq!(pong["status"], "ok");
    assert_eq!(pong["message"], "pong");

    let output = vault_cmd(&bind, &["list"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr_of(&output).contains("error[E103]"));

    stop_daemon(child);
}

#[cfg(unix)]
#[test]
fn daemon_serves_vault_lifecycle() {
    let _guard = daemon_test_guard();
    let temp_dir = tempfile::tempdir().unwrap();
    let bin_dir = temp_dir.path().join("bin");
    install_fake_runtime(&bin_dir);
    let mount_base = temp_dir.path().join("mnt");
    fs::create_dir_all(&mount_base).unwrap();
    let vault_dir = temp_dir.path().join("vault");
    fs::create_dir_all(&vault_dir).unwrap();
    fs::write(vault_dir.join("gocryptfs.conf"), b"{}").unwrap();

    let env = DaemonEnv {
        root: &temp_dir.path().join("root"),
        path_var: fake_path(&bin_dir),
        tmp_dir: &mount_base,
    };
    let (child, bind) = spawn_daemon_with_retry(&env);
    connect_with_retry(&bind);

    let output = vault_cmd(&bind, &["add", vault_dir.join("gocryptfs.conf").to_str().unwrap()]);
    assert!(output.status.success(), "{}", stderr_of(&output));
    let added: serde_json::Value = serde_json::from_str(&stdout_of(&output)).unwrap();
    let id = added["id"].as_i64().unwrap().to_string();

    let vaults = list_vaults(&bind);
    assert_eq!(vaults.len(), 1);
    assert_eq!(vaults[0]["state"], "locked");

    let output = cloak()
        .args(["--no-config", "vault", "--bind", &bind, "unlock", &id, "--password-stdin"])
        .write_stdin("wrong\n")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    let stderr = stderr_of(&output);
    assert!(stderr.contains("error[E400]"), "{stderr}");
    assert!(stderr.contains("vault is locked"), "{stderr}");

    let output = cloak()
        .args(["--no-config", "vault", "--bind", &bind, "unlock", &id, "--password-stdin"])
        .write_stdin("hunter2\n")
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", stderr_of(&output));
    let unlocked: serde_json::Value = serde_json::from_str(&stdout_of(&output)).unwrap();
    assert_eq!(unlocked["state"], "unlocked");

    let output = vault_cmd(&bind, &["mountpoints"]);
    let mountpoints: serde_json::Value = serde_json::from_str(&stdout_of(&output)).unwrap();
    let mountpoint = mountpoints[id.as_str()].as_str().unwrap().to_owned();
    assert!(Path::new(&mountpoint).starts_with(&mount_base));

    let output = vault_cmd(&bind, &["options", &id, "--readonly", "true"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr_of(&output).contains("error[E300]"));

    let output = vault_cmd(&bind, &["lock", &id]);
    assert!(output.status.success(), "{}", stderr_of(&output));

    let mut locked = false;
    for _ in 0..DAEMON_WAIT_ATTEMPTS {
        if list_vaults(&bind)[0]["state"] == "locked" {
            locked = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(DAEMON_WAIT_STEP_MILLIS));
    }
    assert!(locked, "vault never reported locked");
    assert!(!Path::new(&mountpoint).exists());

    let output = vault_cmd(&bind, &["lock", &id]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr_of(&output).contains("error[E301]"));

    let output = vault_cmd(&bind, &["remove", &id]);
    assert!(output.status.success(), "{}", stderr_of(&output));
    assert!(list_vaults(&bind).is_empty());

    stop_daemon(child);
}

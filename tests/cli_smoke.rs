use std::process::Command;

fn bin() -> Command {
    Command::new(env!("CARGO_BIN_EXE_syftbox"))
}

#[test]
fn version_prints_something() {
    let out = bin().arg("version").output().expect("spawn syftbox version");
    assert!(out.status.success());
    assert!(!out.stdout.is_empty());
}

#[test]
fn config_path_respects_flag() {
    let tmp = std::env::temp_dir().join("syftbox-rs-cli-smoke-config-path");
    let _ = std::fs::remove_dir_all(&tmp);
    std::fs::create_dir_all(&tmp).unwrap();
    let cfg_path = tmp.join("config.json");

    let out = bin()
        .arg("-c")
        .arg(&cfg_path)
        .arg("config-path")
        .output()
        .expect("spawn syftbox config-path");
    assert!(out.status.success());
    let printed = String::from_utf8_lossy(&out.stdout);
    assert_eq!(printed.trim(), cfg_path.display().to_string());
}

#[test]
fn app_list_reports_empty_apps_dir() {
    let tmp = std::env::temp_dir().join("syftbox-rs-cli-smoke-app-list");
    let _ = std::fs::remove_dir_all(&tmp);
    std::fs::create_dir_all(&tmp).unwrap();

    let cfg_path = tmp.join("config.json");
    let data_dir = tmp.join("SyftBox");
    std::fs::write(
        &cfg_path,
        format!(
            r#"{{"email":"alice@example.com","data_dir":"{}","server_url":"https://syftbox.net"}}"#,
            data_dir.display()
        ),
    )
    .unwrap();

    let out = bin()
        .arg("-c")
        .arg(&cfg_path)
        .arg("app")
        .arg("list")
        .output()
        .expect("spawn syftbox app list");
    assert!(out.status.success());
    let printed = String::from_utf8_lossy(&out.stdout);
    assert!(printed.contains("No apps installed at"));
}

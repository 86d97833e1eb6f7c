use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::Config;

/// Metadata for one directory under `apps/`. Installing, updating, and
/// removing apps is the out-of-core plugin runner's job; this module only
/// enumerates what's already on disk and launches it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInfo {
    pub id: String,
    pub name: String,
    pub path: String,
}

pub fn apps_dir(cfg: &Config) -> PathBuf {
    cfg.data_dir.join("apps")
}

pub fn is_valid_app(path: &Path) -> bool {
    path.join("run.sh").is_file()
}

fn app_id_from_path(path: &Path) -> String {
    let base = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    let base = base.replace('.', "-");
    let base = regex::Regex::new(r"[\s.]+")
        .unwrap()
        .replace_all(&base, "-")
        .to_string();
    format!("local.{base}")
}

fn app_name_from_path(path: &Path) -> String {
    path.file_name()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_lowercase()
}

pub fn list_apps(cfg: &Config) -> Result<Vec<AppInfo>> {
    let apps_dir = apps_dir(cfg);
    let mut out = Vec::new();
    let entries = match std::fs::read_dir(&apps_dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e).with_context(|| format!("read apps dir {}", apps_dir.display())),
    };

    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let ft = match entry.file_type() {
            Ok(ft) => ft,
            Err(_) => continue,
        };
        if !(ft.is_dir() || ft.is_symlink()) {
            continue;
        }
        let p = entry.path();
        if !is_valid_app(&p) {
            continue;
        }
        out.push(AppInfo {
            id: app_id_from_path(&p),
            name: app_name_from_path(&p),
            path: p.display().to_string(),
        });
    }

    out.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(out)
}

pub fn format_app_list(apps_dir: &Path, apps: &[AppInfo]) -> String {
    if apps.is_empty() {
        return format!("No apps installed at '{}'\n", apps_dir.display());
    }
    let mut s = String::new();
    for (idx, app) in apps.iter().enumerate() {
        if idx > 0 {
            s.push('\n');
        }
        s.push_str(&format!("ID      {}\n", app.id));
        s.push_str(&format!("Path    {}\n", app.path));
    }
    s
}

/// Builds (but does not spawn) the launch command for an app's `run.sh`,
/// run with the app's own directory as cwd.
pub fn run_app(app: &AppInfo) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("run.sh").current_dir(&app.path);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigOverrides;

    #[test]
    fn list_apps_finds_valid_runnable_dirs() {
        let tmp = std::env::temp_dir().join("syftbox-rs-apps-test");
        let _ = std::fs::remove_dir_all(&tmp);
        std::fs::create_dir_all(&tmp).unwrap();

        let cfg_path = tmp.join("config.json");
        std::fs::write(
            &cfg_path,
            format!(
                r#"{{
                  "email":"alice@example.com",
                  "data_dir":"{}",
                  "server_url":"{}"
                }}"#,
                tmp.display(),
                Config::default_server_url()
            ),
        )
        .unwrap();
        let cfg = Config::load_with_overrides(&cfg_path, ConfigOverrides::default()).unwrap();

        let apps_dir_path = apps_dir(&cfg);
        std::fs::create_dir_all(apps_dir_path.join("demo-app")).unwrap();
        std::fs::write(
            apps_dir_path.join("demo-app").join("run.sh"),
            "#!/bin/sh\necho ok\n",
        )
        .unwrap();
        std::fs::create_dir_all(apps_dir_path.join("not-an-app")).unwrap();

        let apps = list_apps(&cfg).unwrap();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].id, "local.demo-app");

        let listing = format_app_list(&apps_dir_path, &apps);
        assert!(listing.contains("ID      local.demo-app\n"));
    }

    #[test]
    fn format_app_list_empty() {
        let listing = format_app_list(Path::new("/tmp/nowhere"), &[]);
        assert!(listing.contains("No apps installed at"));
    }
}

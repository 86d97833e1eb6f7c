use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{Context, Result};
use globset::GlobBuilder;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::store::{MetadataStore, RuleRecord};

pub const PERMISSION_FILE_NAME: &str = "syftperm.yaml";
pub const LEGACY_PERMISSION_FILE_NAME: &str = "_.syftperm";

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid email regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    Read,
    Create,
    Write,
    Admin,
}

const ALL_PERMISSIONS: [Permission; 4] = [
    Permission::Read,
    Permission::Create,
    Permission::Write,
    Permission::Admin,
];

/// One raw rule as it appears in a permission file's YAML list.
#[derive(Debug, Clone, Deserialize)]
pub struct RawRule {
    pub path: String,
    #[serde(default = "wildcard_user")]
    pub user: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub allow: Option<bool>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub terminal: bool,
}

fn wildcard_user() -> String {
    "*".to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum PermissionFileError {
    #[error("yaml parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("rule {index}: path escapes its directory: {path}")]
    PathEscapesDirectory { index: usize, path: String },
    #[error("rule {index}: invalid user: {user}")]
    InvalidUser { index: usize, user: String },
    #[error("rule {index}: '**' must not precede '{{useremail}}' in pattern: {path}")]
    GlobBeforeUserToken { index: usize, path: String },
    #[error("rule {index}: unknown permission {perm:?}")]
    UnknownPermission { index: usize, perm: String },
}

/// Parses a permission file's YAML body into materialized rule records for
/// `permfile_dir` (given relative to the snapshot root, POSIX-separated).
/// Either every rule parses and validates, or the whole file is rejected —
/// never a partial rule set.
pub fn parse_permission_file(
    permfile_dir: &str,
    permfile_depth: i64,
    content: &str,
) -> Result<Vec<RuleRecord>, PermissionFileError> {
    let raw_rules: Vec<RawRule> = serde_yaml::from_str(content)?;
    let mut out = Vec::with_capacity(raw_rules.len());

    for (priority, raw) in raw_rules.iter().enumerate() {
        validate_rule(priority, raw)?;

        let disallow = raw.kind.as_deref() == Some("disallow") || raw.allow == Some(false);
        let mut perms: HashSet<Permission> = HashSet::new();
        for p in &raw.permissions {
            perms.insert(parse_permission(priority, p)?);
        }

        out.push(RuleRecord {
            permfile_dir: permfile_dir.to_string(),
            permfile_depth,
            priority: priority as i64,
            path: raw.path.clone(),
            user: raw.user.clone(),
            can_read: perms.contains(&Permission::Read),
            can_create: perms.contains(&Permission::Create),
            can_write: perms.contains(&Permission::Write),
            admin: perms.contains(&Permission::Admin),
            disallow,
            terminal: raw.terminal,
        });
    }

    Ok(out)
}

fn validate_rule(index: usize, raw: &RawRule) -> Result<(), PermissionFileError> {
    if raw.path.split('/').any(|seg| seg == "..") {
        return Err(PermissionFileError::PathEscapesDirectory {
            index,
            path: raw.path.clone(),
        });
    }
    if raw.user != "*" && !EMAIL_RE.is_match(&raw.user) {
        return Err(PermissionFileError::InvalidUser {
            index,
            user: raw.user.clone(),
        });
    }
    if let Some(pos) = raw.path.find("{useremail}") {
        if raw.path[..pos].contains("**") {
            return Err(PermissionFileError::GlobBeforeUserToken {
                index,
                path: raw.path.clone(),
            });
        }
    }
    Ok(())
}

fn parse_permission(index: usize, raw: &str) -> Result<Permission, PermissionFileError> {
    match raw {
        "read" => Ok(Permission::Read),
        "create" => Ok(Permission::Create),
        "write" => Ok(Permission::Write),
        "admin" => Ok(Permission::Admin),
        other => Err(PermissionFileError::UnknownPermission {
            index,
            perm: other.to_string(),
        }),
    }
}

/// The four-permission result of an evaluation, plus which of them were
/// locked by a terminal rule along the way.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Permissions {
    pub read: bool,
    pub create: bool,
    pub write: bool,
    pub admin: bool,
}

impl Permissions {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self {
            read: true,
            create: true,
            write: true,
            admin: true,
        }
    }

    pub fn allows(&self, perm: Permission) -> bool {
        match perm {
            Permission::Read => self.read,
            Permission::Create => self.create,
            Permission::Write => self.write,
            Permission::Admin => self.admin,
        }
    }
}

/// Evaluates the effective permissions for `(user, target_path)` against
/// `rules`, which must already be ordered `(permfile_depth asc, priority
/// asc)` — the order the metadata store's `rules_for_ancestors` returns.
/// Never panics: any unexpected input (a rule whose glob fails to compile)
/// is simply skipped, degrading toward deny-all rather than propagating.
pub fn evaluate(rules: &[RuleRecord], user: &str, target_path: &str) -> Permissions {
    let mut result = Permissions::none();
    let mut terminal_locked: HashSet<Permission> = HashSet::new();

    for rule in rules {
        if rule.user != "*" && !rule.user.eq_ignore_ascii_case(user) {
            continue;
        }

        let rel_target = match relative_to(target_path, &rule.permfile_dir) {
            Some(r) => r,
            None => continue,
        };

        let pattern = rule.path.replace("{useremail}", user);
        if !glob_matches(&pattern, &rel_target) {
            continue;
        }

        apply_rule(&mut result, &mut terminal_locked, rule);
    }

    result
}

fn apply_rule(
    result: &mut Permissions,
    terminal_locked: &mut HashSet<Permission>,
    rule: &RuleRecord,
) {
    let allow = !rule.disallow;
    let carried: &[(Permission, bool)] = &[
        (Permission::Read, rule.can_read),
        (Permission::Create, rule.can_create),
        (Permission::Write, rule.can_write),
        (Permission::Admin, rule.admin),
    ];

    for (perm, carries) in carried {
        if !*carries || terminal_locked.contains(perm) {
            continue;
        }
        set_permission(result, *perm, allow);
        if rule.terminal {
            terminal_locked.insert(*perm);
        }
    }
}

fn set_permission(result: &mut Permissions, perm: Permission, value: bool) {
    match perm {
        Permission::Read => result.read = value,
        Permission::Create => result.create = value,
        Permission::Write => result.write = value,
        Permission::Admin => result.admin = value,
    }
}

fn glob_matches(pattern: &str, rel_target: &str) -> bool {
    let matcher = match GlobBuilder::new(pattern)
        .literal_separator(false)
        .build()
    {
        Ok(g) => g.compile_matcher(),
        Err(_) => return false,
    };
    matcher.is_match(rel_target)
}

/// `target_path` relative to `permfile_dir`, both POSIX-separated and
/// relative to the snapshot root. Returns `None` if `target_path` is not
/// under `permfile_dir`.
fn relative_to(target_path: &str, permfile_dir: &str) -> Option<String> {
    if permfile_dir.is_empty() {
        return Some(target_path.trim_start_matches('/').to_string());
    }
    let prefix = format!("{}/", permfile_dir.trim_end_matches('/'));
    target_path
        .strip_prefix(&prefix)
        .map(|s| s.to_string())
        .or_else(|| {
            if target_path.trim_end_matches('/') == permfile_dir.trim_end_matches('/') {
                Some(String::new())
            } else {
                None
            }
        })
}

/// All ancestor directories of `target_path` from the snapshot root down
/// to (and including) its own parent directory, shallowest first.
pub fn ancestor_dirs(target_path: &str) -> Vec<String> {
    let path = Path::new(target_path);
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    let mut parts: Vec<String> = parent
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    if parts.is_empty() {
        return vec![String::new()];
    }
    let mut out = Vec::with_capacity(parts.len() + 1);
    out.push(String::new());
    let mut acc = PathBuf::new();
    for part in parts.drain(..) {
        acc.push(&part);
        out.push(acc.to_string_lossy().replace('\\', "/"));
    }
    out
}

pub fn depth_of(dir: &str) -> i64 {
    if dir.is_empty() {
        0
    } else {
        dir.split('/').filter(|s| !s.is_empty()).count() as i64
    }
}

/// Legacy `_.syftperm` format: a JSON object mapping permission bit names
/// to lists of emails. Converted once into an equivalent YAML rule list.
#[derive(Debug, Deserialize)]
pub struct LegacyPermissionFile {
    #[serde(default)]
    pub admin: Vec<String>,
    #[serde(default)]
    pub read: Vec<String>,
    #[serde(default)]
    pub write: Vec<String>,
}

/// Converts a legacy permission file into the equivalent ordered YAML rule
/// list, one rule per (permission, email) pair in admin/read/write order —
/// mirroring the original migration's per-bit, per-email rule expansion.
pub fn migrate_legacy(legacy: &LegacyPermissionFile) -> Vec<RawRule> {
    let mut rules = Vec::new();
    for email in &legacy.admin {
        rules.push(RawRule {
            path: "**".to_string(),
            user: email.clone(),
            permissions: vec!["admin".to_string(), "read".to_string(), "write".to_string()],
            allow: Some(true),
            kind: None,
            terminal: false,
        });
    }
    for email in &legacy.write {
        rules.push(RawRule {
            path: "**".to_string(),
            user: email.clone(),
            permissions: vec!["write".to_string(), "read".to_string()],
            allow: Some(true),
            kind: None,
            terminal: false,
        });
    }
    for email in &legacy.read {
        rules.push(RawRule {
            path: "**".to_string(),
            user: email.clone(),
            permissions: vec!["read".to_string()],
            allow: Some(true),
            kind: None,
            terminal: false,
        });
    }
    rules
}

pub fn serialize_rules(rules: &[RawRule]) -> Result<String, serde_yaml::Error> {
    serde_yaml::to_string(rules)
}

impl serde::Serialize for RawRule {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("RawRule", 5)?;
        s.serialize_field("path", &self.path)?;
        s.serialize_field("user", &self.user)?;
        s.serialize_field("permissions", &self.permissions)?;
        if let Some(allow) = self.allow {
            s.serialize_field("allow", &allow)?;
        }
        s.serialize_field("terminal", &self.terminal)?;
        s.end()
    }
}

/// Coordinates rule-table reads and rewrites against a shared
/// `MetadataStore`. Queries take a shared lock; a rewrite (triggered by a
/// permission-file mutation) takes an exclusive lock for the duration of
/// a single directory's re-parse + replace, per the concurrency policy.
pub struct PermissionEngine {
    rewrite_lock: RwLock<()>,
}

impl PermissionEngine {
    pub fn new() -> Self {
        Self {
            rewrite_lock: RwLock::new(()),
        }
    }

    /// Re-parses the permission file at `permfile_abs_path` and replaces
    /// all of its rule records in one transaction. Malformed content is
    /// rejected whole — no partial rule state is ever written.
    pub fn rebuild_for_file(
        &self,
        store: &mut MetadataStore,
        datasites_root: &Path,
        permfile_abs_path: &Path,
    ) -> Result<()> {
        let _guard = self.rewrite_lock.write().unwrap();
        let permfile_dir = relative_dir(datasites_root, permfile_abs_path)?;
        let depth = depth_of(&permfile_dir);

        if !permfile_abs_path.exists() {
            store.remove_rules_for_dir(&permfile_dir)?;
            return Ok(());
        }

        let content = fs::read_to_string(permfile_abs_path)
            .with_context(|| format!("read {}", permfile_abs_path.display()))?;
        let rules = parse_permission_file(&permfile_dir, depth, &content)
            .with_context(|| format!("parse {}", permfile_abs_path.display()))?;
        store.replace_rules(&permfile_dir, &rules)?;
        Ok(())
    }

    /// Evaluates `(user, target_path, op)` against every rule whose
    /// directory is an ancestor of `target_path`.
    pub fn query(
        &self,
        store: &MetadataStore,
        user: &str,
        target_path: &str,
        op: Permission,
    ) -> Result<bool> {
        let _guard = self.rewrite_lock.read().unwrap();
        let ancestors = ancestor_dirs(target_path);
        let rules = store.rules_for_ancestors(&ancestors)?;
        Ok(evaluate(&rules, user, target_path).allows(op))
    }

    /// Startup scan: reads every `syftperm.yaml` under `workspace_root`'s
    /// `datasites/` tree and inserts its rules into `store`, per directory.
    /// Must run after any legacy-file migration so migrated siblings are
    /// picked up too. `workspace_root` is the same root `rebuild_for_file`
    /// expects — the parent of `datasites/`, not `datasites/` itself — so
    /// the rule rows it writes key on `datasites/...` paths like every
    /// other production call site.
    pub fn load_all(&self, store: &mut MetadataStore, workspace_root: &Path) -> Result<usize> {
        let mut loaded = 0;
        for entry in walkdir::WalkDir::new(workspace_root.join("datasites"))
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.file_name() != PERMISSION_FILE_NAME {
                continue;
            }
            self.rebuild_for_file(store, workspace_root, entry.path())?;
            loaded += 1;
        }
        Ok(loaded)
    }

    /// One-shot idempotent migration of legacy `_.syftperm` files found
    /// under the snapshot into YAML `syftperm.yaml` siblings.
    pub fn migrate_legacy_files(&self, datasites_root: &Path) -> Result<usize> {
        let mut migrated = 0;
        for entry in walkdir::WalkDir::new(datasites_root)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.file_name() != LEGACY_PERMISSION_FILE_NAME {
                continue;
            }
            let legacy_path = entry.path();
            let sibling = legacy_path
                .parent()
                .unwrap_or(datasites_root)
                .join(PERMISSION_FILE_NAME);
            if sibling.exists() {
                // Already migrated; leave the legacy file alone rather than
                // guessing whether it's safe to delete.
                continue;
            }
            let raw = fs::read_to_string(legacy_path)
                .with_context(|| format!("read {}", legacy_path.display()))?;
            let legacy: LegacyPermissionFile = serde_json::from_str(&raw)
                .with_context(|| format!("parse legacy {}", legacy_path.display()))?;
            let rules = migrate_legacy(&legacy);
            let yaml = serialize_rules(&rules).context("serialize migrated rules")?;
            fs::write(&sibling, yaml)
                .with_context(|| format!("write {}", sibling.display()))?;
            fs::remove_file(legacy_path)
                .with_context(|| format!("remove legacy {}", legacy_path.display()))?;
            migrated += 1;
        }
        Ok(migrated)
    }
}

impl Default for PermissionEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn relative_dir(root: &Path, permfile_abs_path: &Path) -> Result<String> {
    let dir = permfile_abs_path
        .parent()
        .context("permission file has no parent directory")?;
    let rel = dir.strip_prefix(root).unwrap_or(dir);
    Ok(rel.to_string_lossy().replace('\\', "/"))
}
